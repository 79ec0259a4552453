//! Line-oriented request/response transport.
//!
//! The control layer only needs four primitives from the link to the
//! instrument: write a block of text, read one response line, change the
//! buffer capacity in either direction, and reopen the link so a new capacity
//! takes effect. Everything above this trait is transport-agnostic.
//!
//! Two implementations ship with the crate:
//! - [`tcp::TcpTransport`] for the instrument's raw SCPI socket
//! - [`mock::MockFunctionGenerator`] a simulated instrument for tests and
//!   `--mock` runs of the CLI

use crate::error::AppResult;
use async_trait::async_trait;
use std::fmt;

pub mod mock;
pub mod tcp;

pub use mock::MockFunctionGenerator;
pub use tcp::TcpTransport;

/// Which side of the transport a capacity applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferDirection {
    /// Bytes received from the instrument
    Input,
    /// Bytes sent to the instrument
    Output,
}

impl fmt::Display for BufferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferDirection::Input => write!(f, "input"),
            BufferDirection::Output => write!(f, "output"),
        }
    }
}

/// Synchronous-by-contract request/response channel to the instrument.
///
/// Calls never overlap: every method takes `&mut self`, so a transport can
/// only be driven by one owner at a time.
#[async_trait]
pub trait Transport: Send {
    /// Send `text` as one write. Multi-line blocks are newline-joined by the
    /// caller; the transport appends the final terminator.
    async fn write(&mut self, text: &str) -> AppResult<()>;

    /// Read one response line, without its terminator.
    async fn read_line(&mut self) -> AppResult<String>;

    /// Current capacity for `direction`, in bytes.
    fn buffer_capacity(&self, direction: BufferDirection) -> usize;

    /// Set the capacity for `direction`. Takes effect on the next
    /// [`reopen`](Transport::reopen).
    fn set_buffer_capacity(&mut self, direction: BufferDirection, bytes: usize);

    /// Close and reopen the link.
    async fn reopen(&mut self) -> AppResult<()>;

    /// Write a query and read its single-line response.
    async fn query(&mut self, text: &str) -> AppResult<String> {
        self.write(text).await?;
        self.read_line().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_query_is_write_then_read() {
        let mut transport = MockFunctionGenerator::new();
        let idn = transport.query("*IDN?").await.unwrap();
        assert!(idn.contains("33522B"));

        let log = transport.handle().writes();
        assert_eq!(log, vec!["*IDN?".to_string()]);
    }

    #[test]
    fn direction_display() {
        assert_eq!(BufferDirection::Input.to_string(), "input");
        assert_eq!(BufferDirection::Output.to_string(), "output");
    }
}
