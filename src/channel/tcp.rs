//! Raw-socket SCPI transport over TCP
//!
//! Siglent SDS and SDG instruments accept newline-terminated SCPI on TCP port 5025.
//! All exchanges go through one `tokio::sync::Mutex`, so a query is always written and
//! its response fully read (or timed out) before the next command can start.

use super::InstrumentChannel;
use crate::error::{InstrumentError, InstrumentResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Default raw-socket SCPI port for Siglent instruments
pub const DEFAULT_PORT: u16 = 5025;

/// Default response timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Connection timeout in seconds
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// TCP channel to one SCPI instrument
pub struct TcpChannel {
    stream: Mutex<BufReader<TcpStream>>,
    peer: SocketAddr,
    timeout: Duration,
}

impl TcpChannel {
    /// Connect to an instrument.
    ///
    /// # Arguments
    /// * `address` - `host` or `host:port`; the port defaults to [`DEFAULT_PORT`]
    pub async fn connect(address: &str) -> InstrumentResult<Self> {
        let target = if address.contains(':') {
            address.to_string()
        } else {
            format!("{}:{}", address, DEFAULT_PORT)
        };

        let peer = lookup_host(&target).await?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cannot resolve {}", target),
            )
        })?;

        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let stream = timeout(connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| InstrumentError::ProtocolTimeout {
                query: format!("connect {}", peer),
                timeout: connect_timeout,
            })??;

        stream.set_nodelay(true)?;

        tracing::info!(%peer, "Connected to instrument");

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            peer,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        })
    }

    /// Set the response timeout.
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    async fn write_line(stream: &mut BufReader<TcpStream>, line: &str) -> InstrumentResult<()> {
        let cmd = format!("{}\n", line);
        stream.get_mut().write_all(cmd.as_bytes()).await?;
        stream.get_mut().flush().await?;
        Ok(())
    }

    /// Write a query and read one `\n`-terminated response, terminator removed.
    async fn exchange(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        let mut stream = self.stream.lock().await;

        Self::discard_stale_input(&mut stream).await;
        Self::write_line(&mut stream, query).await?;

        let mut response = Vec::new();
        match timeout(self.timeout, stream.read_until(b'\n', &mut response)).await {
            Ok(Ok(0)) => Err(InstrumentError::Closed),
            Ok(Ok(_)) => {
                if response.last() == Some(&b'\n') {
                    response.pop();
                }
                tracing::debug!(peer = %self.peer, query, len = response.len(), "SCPI response");
                Ok(response)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(InstrumentError::ProtocolTimeout {
                query: query.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Drop bytes left over from an earlier exchange so they are not taken as the
    /// answer to the next query.
    async fn discard_stale_input(stream: &mut BufReader<TcpStream>) {
        let buffered = stream.buffer().len();
        if buffered > 0 {
            tracing::debug!("Discarding {} buffered bytes", buffered);
            stream.consume(buffered);
        }

        let mut scratch = [0u8; 256];
        loop {
            match stream.get_mut().try_read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => tracing::debug!("Discarded {} stale bytes", n),
                Err(_) => break,
            }
        }
    }
}

#[async_trait]
impl InstrumentChannel for TcpChannel {
    async fn send(&self, command: &str) -> InstrumentResult<()> {
        let mut stream = self.stream.lock().await;
        tracing::debug!(peer = %self.peer, command, "SCPI write");
        Self::write_line(&mut stream, command).await
    }

    async fn ask(&self, query: &str) -> InstrumentResult<String> {
        let raw = self.exchange(query).await?;
        let text = String::from_utf8(raw)
            .map_err(|e| InstrumentError::decode(query, e.to_string()))?;
        Ok(text.trim().to_string())
    }

    async fn ask_raw(&self, query: &str) -> InstrumentResult<Vec<u8>> {
        self.exchange(query).await
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}
