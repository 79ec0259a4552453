//! # Rust Function Generator Control Library
//!
//! This crate drives a two-channel bench function generator over a
//! line-oriented command link. It turns stimulation intents (pulse trains,
//! amplitude modulation, triggered bursts, arbitrary waveforms) into ordered
//! command blocks, keeps the transport buffers sized for each transfer, and
//! drains the instrument's error queue after every operation so silent command
//! failures are reported where they happen.
//!
//! ## Crate Structure
//!
//! - **`session`**: The `Session` facade. Owns the transport exclusively and
//!   exposes every operation stimulation code calls.
//! - **`commands`**: Command vocabulary and the block builders for each mode,
//!   plus the voltage safety guard.
//! - **`options`**: Per-operation option structs with defaults and a fixed set
//!   of accepted names; pulse timing derivation.
//! - **`waveform`**: Scaling of real-valued samples to 16-bit DAC codes, their
//!   wire text, and stored-waveform catalog decoding.
//! - **`catalog`**: Volatile-memory residency checks, catalog listings and
//!   waveform attribute queries.
//! - **`buffer`**: Scoped widening of the transport buffer for large transfers.
//! - **`error_monitor`**: Draining of the instrument `SYST:ERR?` queue.
//! - **`channel`**: Channel identifiers and the per-channel state a session
//!   tracks.
//! - **`transport`**: The `Transport` trait, a raw-socket implementation and a
//!   simulated instrument.
//! - **`config`**: Layered configuration loaded with `figment`.
//! - **`logging`**: `tracing` subscriber setup and the diagnostics file sink.
//! - **`error`**: The `FgenError` type shared across the crate.

pub mod buffer;
pub mod catalog;
pub mod channel;
pub mod commands;
pub mod config;
pub mod error;
pub mod error_monitor;
pub mod logging;
pub mod options;
pub mod session;
pub mod transport;
pub mod waveform;

pub use channel::Channel;
pub use error::{AppResult, FgenError};
pub use session::{PendingVoltage, Session, VoltageOutcome};
