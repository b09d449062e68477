//! Framed message link over any byte stream.
//!
//! `MessageLink` owns the stream plus a read buffer. Partial frames stay in
//! the buffer between calls, which makes [`MessageLink::recv`] cancel-safe:
//! it can sit inside `tokio::time::timeout` or a `select!` arm and a timeout
//! never loses bytes of a half-received frame.

use super::protocol::Message;
use crate::error::{AppResult, ScanError};
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::trace;

const READ_CHUNK: usize = 4096;

/// Bidirectional framed link to the peer node.
pub struct MessageLink<S> {
    stream: S,
    read_buf: BytesMut,
    peer: String,
}

impl<S> MessageLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream`; `peer` names the other end in logs and errors.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            peer: peer.into(),
        }
    }

    /// Name of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one frame and flush it.
    pub async fn send(&mut self, message: &Message) -> AppResult<()> {
        let frame = message.encode();
        trace!(peer = %self.peer, kind = ?message.kind(), bytes = frame.len(), "send");
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| self.lost(e))?;
        self.stream.flush().await.map_err(|e| self.lost(e))?;
        Ok(())
    }

    /// Next message, or `None` if the peer closed the stream cleanly between
    /// frames.
    ///
    /// # Errors
    /// - `ScanError::Protocol` for an undecodable frame
    /// - `ScanError::ConnectionLost` for a read failure or EOF inside a frame
    pub async fn next_message(&mut self) -> AppResult<Option<Message>> {
        loop {
            if let Some((message, used)) = Message::decode_frame(&self.read_buf)? {
                self.read_buf.advance(used);
                trace!(peer = %self.peer, kind = ?message.kind(), "recv");
                return Ok(Some(message));
            }

            self.read_buf.reserve(READ_CHUNK);
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(|e| self.lost(e))?;
            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ScanError::ConnectionLost(format!(
                    "{} closed the connection mid-frame ({} bytes pending)",
                    self.peer,
                    self.read_buf.len()
                )));
            }
        }
    }

    /// Next message; EOF is a lost connection.
    pub async fn recv(&mut self) -> AppResult<Message> {
        match self.next_message().await? {
            Some(message) => Ok(message),
            None => Err(ScanError::ConnectionLost(format!(
                "{} closed the connection",
                self.peer
            ))),
        }
    }

    /// Like [`MessageLink::recv`] but gives up after `wait`, returning
    /// `Ok(None)`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> AppResult<Option<Message>> {
        match timeout(wait, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn lost(&self, err: std::io::Error) -> ScanError {
        ScanError::ConnectionLost(format!("{}: {}", self.peer, err))
    }
}
