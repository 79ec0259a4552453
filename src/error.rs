//! Custom error types for the function generator control layer.
//!
//! `FgenError` covers the two failure classes that abort an operation:
//!
//! - **Transport failures** (`Transport`, `Io`): the link to the instrument is
//!   unusable. These are fatal for the session.
//! - **Configuration failures** (`Config`, `Configuration`,
//!   `InsufficientPulseParameters`, `UnsafeVoltage`): detected before any
//!   command text is sent, so instrument state is untouched.
//!
//! Errors reported by the instrument itself (its `SYST:ERR?` queue) are not
//! represented here. They are expected, operator-correctable conditions and are
//! returned as an [`ErrorReport`](crate::error_monitor::ErrorReport) instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, FgenError>;

/// Errors that abort a control-layer operation
#[derive(Error, Debug)]
pub enum FgenError {
    /// The link to the instrument failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file or environment could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Invalid option or configuration value
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Pulse timing over- or under-specified
    #[error("Pulse configuration needs exactly two of duty_cycle, duration, repetition_frequency (got {supplied})")]
    InsufficientPulseParameters {
        /// Number of timing values that were supplied.
        supplied: usize,
    },

    /// Amplitude above the safety threshold without confirmation
    #[error("Voltage {requested} V exceeds the safety threshold of {threshold} V")]
    UnsafeVoltage {
        /// Requested amplitude.
        requested: f64,
        /// Threshold above which confirmation is required.
        threshold: f64,
    },

    /// The instrument answered a query with something unusable
    #[error("Unexpected response to '{query}': {response:?}")]
    UnexpectedResponse {
        /// Query that was sent.
        query: String,
        /// Raw line received.
        response: String,
    },
}

impl From<figment::Error> for FgenError {
    fn from(value: figment::Error) -> Self {
        FgenError::Config(Box::new(value))
    }
}

impl FgenError {
    /// Whether the error was raised before any command reached the instrument.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FgenError::Config(_)
                | FgenError::Configuration(_)
                | FgenError::InsufficientPulseParameters { .. }
                | FgenError::UnsafeVoltage { .. }
        )
    }
}
