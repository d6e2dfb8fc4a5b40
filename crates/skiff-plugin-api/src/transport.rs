//! Newline-delimited JSON framing over any async byte stream

use crate::RpcError;
use crate::protocol::{Frame, Handshake};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

/// Longest line accepted from a peer
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Reads frames line by line, skipping blank lines
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next frame, or `None` once the peer closed the stream
    pub async fn next(&mut self) -> Result<Option<Frame>, RpcError> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(None),
                Err(err) => return Err(RpcError::Unavailable(format!("read failed: {err}"))),
            };
            if line.len() > MAX_FRAME_BYTES {
                return Err(RpcError::Protocol(format!(
                    "frame of {} bytes exceeds limit",
                    line.len()
                )));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str::<Frame>(trimmed)
                .map(Some)
                .map_err(|err| RpcError::Codec(format!("invalid frame: {err}")));
        }
    }

    /// Wait for the peer's handshake, failing when anything else arrives first
    pub async fn read_handshake(&mut self, timeout: Duration) -> Result<Handshake, RpcError> {
        let frame = tokio::time::timeout(timeout, self.next())
            .await
            .map_err(|_| RpcError::DeadlineExceeded)??;
        match frame {
            Some(Frame::Handshake(hs)) => {
                hs.check_compatible().map_err(RpcError::Protocol)?;
                Ok(hs)
            }
            Some(other) => Err(RpcError::Protocol(format!(
                "expected handshake, got {other:?}"
            ))),
            None => Err(RpcError::Unavailable(
                "plugin exited before handshake".to_string(),
            )),
        }
    }
}

/// Writes frames as single JSON lines
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), RpcError> {
        let mut payload = serde_json::to_vec(frame)
            .map_err(|err| RpcError::Codec(format!("serialize frame failed: {err}")))?;
        payload.push(b'\n');
        self.writer
            .write_all(&payload)
            .await
            .map_err(|err| RpcError::Unavailable(format!("write failed: {err}")))?;
        self.writer
            .flush()
            .await
            .map_err(|err| RpcError::Unavailable(format!("flush failed: {err}")))
    }
}
