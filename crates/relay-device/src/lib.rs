//! `relay-device`
//!
//! The runtime half of irq-relay. An event on a claimed line is recorded and
//! turned into one deferred flush job; a single worker task per running device
//! sleeps out the configured delay and writes one chunk of buffered bytes to
//! the sink.
//!
//! ```text
//!  EventSource ──fire──▶ EventDispatch ──FlushJob──▶ FlushWorker ──write──▶ Sink
//!                          │ intr_log                 │ enter_log / exit_log
//!  DeviceSession::write ───┴───────────▶ DataChannel ─┘
//! ```
//!
//! # Modules
//!
//! - [`device`]: [`Device`], its sessions and options
//! - [`source`]: the [`EventSource`] capability and two implementations
//! - [`sink`]: the [`SinkOpener`]/[`Sink`] capability and two implementations
//! - [`stats`]: [`DeviceStats`] counter snapshots

pub mod device;
mod handler;
pub mod sink;
pub mod source;
pub mod stats;
mod worker;

pub use device::{Device, DeviceOptions, DeviceSession, LogSession};
pub use sink::{FileSinkOpener, MemorySinkOpener, Sink, SinkOpener};
pub use source::{EventHandler, EventSource, SoftwareEventSource, TimerEventSource};
pub use stats::{DeviceStats, LogDrops};
