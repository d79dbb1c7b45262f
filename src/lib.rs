//! irq-relay
//!
//! Event-triggered delayed data relay. Bytes written to a device are held in
//! a bounded channel; each trigger event flushes one chunk of them to the
//! destination after a configured delay, and three timestamped logs record
//! when each event fired and when its flush began and ended.
//!
//! The pipeline itself lives in the `relay-core` and `relay-device` crates.
//! This crate adds what the `irq-relay` binary needs around them:
//!
//! - [`config`]: Figment-backed [`config::RelayConfig`]
//! - [`logging`]: tracing subscriber setup
//! - [`app`]: one end-to-end relay run

pub mod app;
pub mod config;
pub mod logging;
