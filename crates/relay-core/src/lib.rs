//! `relay-core`
//!
//! Building blocks of the irq-relay pipeline that do not depend on a runtime:
//!
//! - [`RingBuffer`]: fixed-capacity FIFO with drop-on-full semantics
//! - [`DataChannel`]: the byte queue between writers and the flush worker
//! - [`LogStream`] / [`LogSet`]: the interrupt, flush-enter and flush-exit logs
//! - [`ConfigState`]: configuration fields and the stopped/running state machine
//! - [`OpenGate`]: single-session gates with administrative force-release
//! - [`RelayError`]: the error type shared by every relay crate
//!
//! The runtime pieces (event handling, the flush worker, sinks and the device
//! itself) live in `relay-device`.

pub mod channel;
pub mod config;
pub mod error;
pub mod gate;
pub mod log_stream;
pub mod ring_buffer;

pub use channel::{DataChannel, DEFAULT_CHANNEL_CAPACITY};
pub use config::{
    ConfigField, ConfigState, DeviceState, RunParams, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
    MAX_DELAY_MS, PATH_MAX_LEN, SCHEDULING_CORRECTION,
};
pub use error::{ErrorKind, RelayError, Result};
pub use gate::{GateGuard, OpenGate};
pub use log_stream::{
    AnnotatedEntry, LogEntry, LogKind, LogSet, LogSortKey, LogStream, DEFAULT_LOG_CAPACITY,
};
pub use ring_buffer::RingBuffer;
