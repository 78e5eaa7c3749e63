//! Async TCP connection to a cluster node.
//!
//! Sends commands as RESP arrays of bulk strings and reads back parsed
//! frames. Every network step is bounded by the configured timeout.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use shardctl_protocol::{parse_frame, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Errors that can occur during connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server disconnected")]
    Disconnected,

    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

/// A TCP connection to one node with read/write buffering.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    timeout: Duration,
}

impl Connection {
    /// Connects to `host:port`, giving up after `io_timeout`.
    pub async fn connect(host: &str, port: u16, io_timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = timeout(io_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ConnectionError::Timeout(io_timeout))??;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            timeout: io_timeout,
        })
    }

    /// Sends one command and reads its reply.
    ///
    /// Error replies come back as `Frame::Error`; only transport and
    /// framing failures are errors here.
    pub async fn send<I, T>(&mut self, parts: I) -> Result<Frame, ConnectionError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.write_buf.clear();
        Frame::command(parts).serialize(&mut self.write_buf);

        let io_timeout = self.timeout;
        timeout(io_timeout, async {
            self.stream.write_all(&self.write_buf).await?;
            self.stream.flush().await?;
            self.read_response().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout(io_timeout))?
    }

    /// Authenticates with `AUTH <password>`.
    pub async fn authenticate(&mut self, password: &str) -> Result<(), ConnectionError> {
        let reply = self.send([Bytes::from_static(b"AUTH"), Bytes::copy_from_slice(password.as_bytes())])
            .await?;
        match &reply {
            Frame::Simple(s) if s == "OK" => Ok(()),
            Frame::Error(e) => Err(ConnectionError::AuthFailed(e.clone())),
            _ => Err(ConnectionError::AuthFailed(
                "unexpected response to AUTH".into(),
            )),
        }
    }

    async fn read_response(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            if !self.read_buf.is_empty() {
                match parse_frame(&self.read_buf) {
                    Ok(Some((frame, consumed))) => {
                        let _ = self.read_buf.split_to(consumed);
                        return Ok(frame);
                    }
                    Ok(None) => {}
                    Err(e) => return Err(ConnectionError::Protocol(e.to_string())),
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(ConnectionError::Disconnected);
            }
        }
    }
}
