//! SCPI over a raw TCP socket.
//!
//! LAN-connected generators expose their command parser on a plain socket
//! (port 5025 by convention). The read and write halves are wrapped in
//! buffered adapters whose capacities follow the
//! [`Transport`](super::Transport) buffer settings; changing a capacity and
//! calling [`reopen`](super::Transport::reopen) reconnects with the new sizes.

use super::{BufferDirection, Transport};
use crate::config::ConnectionConfig;
use crate::error::{AppResult, FgenError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default SCPI socket port
pub const DEFAULT_PORT: u16 = 5025;

/// Timeout for establishing the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

struct Link {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

/// Raw-socket transport
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    input_capacity: usize,
    output_capacity: usize,
    link: Option<Link>,
}

impl TcpTransport {
    /// Connect to `host:port` with `capacity` bytes of buffering each way.
    ///
    /// # Errors
    /// Returns `FgenError::Transport` if the connection cannot be established.
    /// No session is usable without a link, so callers treat this as fatal.
    pub async fn connect(host: &str, port: u16, capacity: usize) -> AppResult<Self> {
        let mut transport = Self {
            host: host.to_string(),
            port,
            timeout: Duration::from_millis(5000),
            input_capacity: capacity,
            output_capacity: capacity,
            link: None,
        };
        transport.open().await?;
        Ok(transport)
    }

    /// Connect using the `[connection]` configuration section.
    pub async fn from_config(config: &ConnectionConfig, capacity: usize) -> AppResult<Self> {
        let mut transport = Self::connect(&config.host, config.port, capacity).await?;
        transport.set_timeout(Duration::from_millis(config.timeout_ms));
        Ok(transport)
    }

    /// Set the read/write timeout.
    pub fn set_timeout(&mut self, duration: Duration) {
        self.timeout = duration;
    }

    async fn open(&mut self) -> AppResult<()> {
        let address = format!("{}:{}", self.host, self.port);
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
            .await
            .map_err(|_| FgenError::Transport(format!("Connection timeout to {}", address)))?
            .map_err(|e| FgenError::Transport(format!("Failed to connect to {}: {}", address, e)))?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        self.link = Some(Link {
            reader: BufReader::with_capacity(self.input_capacity, read_half),
            writer: BufWriter::with_capacity(self.output_capacity, write_half),
        });

        tracing::debug!(
            address = %address,
            input = self.input_capacity,
            output = self.output_capacity,
            "Socket opened"
        );
        Ok(())
    }

    fn link(&mut self) -> AppResult<&mut Link> {
        self.link
            .as_mut()
            .ok_or_else(|| FgenError::Transport("Socket is closed".to_string()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, text: &str) -> AppResult<()> {
        let deadline = self.timeout;
        let link = self.link()?;
        let framed = format!("{}\n", text);

        timeout(deadline, async {
            link.writer.write_all(framed.as_bytes()).await?;
            link.writer.flush().await
        })
        .await
        .map_err(|_| FgenError::Transport("Timeout while writing".to_string()))??;

        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<String> {
        let deadline = self.timeout;
        let link = self.link()?;
        let mut response = String::new();

        match timeout(deadline, link.reader.read_line(&mut response)).await {
            Ok(Ok(0)) => Err(FgenError::Transport(
                "Connection closed by instrument".to_string(),
            )),
            Ok(Ok(_)) => Ok(response.trim_end_matches(['\r', '\n']).to_string()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(FgenError::Transport(
                "Timeout waiting for response".to_string(),
            )),
        }
    }

    fn buffer_capacity(&self, direction: BufferDirection) -> usize {
        match direction {
            BufferDirection::Input => self.input_capacity,
            BufferDirection::Output => self.output_capacity,
        }
    }

    fn set_buffer_capacity(&mut self, direction: BufferDirection, bytes: usize) {
        match direction {
            BufferDirection::Input => self.input_capacity = bytes,
            BufferDirection::Output => self.output_capacity = bytes,
        }
    }

    async fn reopen(&mut self) -> AppResult<()> {
        if let Some(mut link) = self.link.take() {
            // Anything still buffered belongs to the previous capacity
            link.writer.flush().await?;
        }
        self.open().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal echo-style instrument: answers `*IDN?` and nothing else.
    async fn spawn_instrument() -> (u16, tokio::task::JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let mut accepted = 0;
            while let Ok((stream, _)) = listener.accept().await {
                accepted += 1;
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line == "*IDN?" {
                        write_half
                            .write_all(b"Agilent Technologies,33522B,TCP0001,4.00\n")
                            .await
                            .unwrap();
                    }
                    if line == "QUIT" {
                        return accepted;
                    }
                }
            }
            accepted
        });
        (port, handle)
    }

    #[tokio::test]
    async fn query_over_socket() {
        let (port, server) = spawn_instrument().await;
        let mut transport = TcpTransport::connect("127.0.0.1", port, 512).await.unwrap();

        let idn = transport.query("*IDN?").await.unwrap();
        assert_eq!(idn, "Agilent Technologies,33522B,TCP0001,4.00");

        transport.write("QUIT").await.unwrap();
        assert_eq!(server.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reopen_applies_new_capacity() {
        let (port, _server) = spawn_instrument().await;
        let mut transport = TcpTransport::connect("127.0.0.1", port, 512).await.unwrap();

        transport.set_buffer_capacity(BufferDirection::Output, 4096);
        transport.reopen().await.unwrap();
        assert_eq!(transport.buffer_capacity(BufferDirection::Output), 4096);
        assert_eq!(transport.buffer_capacity(BufferDirection::Input), 512);

        let idn = transport.query("*IDN?").await.unwrap();
        assert!(idn.contains("33522B"));
    }

    #[tokio::test]
    async fn connect_failure_is_transport_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = TcpTransport::connect("127.0.0.1", port, 512).await;
        assert!(matches!(result, Err(FgenError::Transport(_))));
    }
}
