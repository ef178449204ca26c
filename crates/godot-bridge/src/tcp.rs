//! TCP transport with `Content-Length` framing
//!
//! Used for the debug adapter channel. Generic over the stream halves so the
//! framing can be exercised against in-memory streams.

use crate::codec::{ContentLengthDecoder, encode_frame};
use crate::transport::{FrameReader, FrameWriter, Inbound, preview};
use async_trait::async_trait;
use godot_bridge_core::{BridgeError, Result};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

const READ_CHUNK: usize = 8 * 1024;

/// TCP read wrapper
pub struct TcpReadWrapper<R = OwnedReadHalf> {
    inner: R,
    decoder: ContentLengthDecoder,
    chunk: Vec<u8>,
}

impl<R> TcpReadWrapper<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: ContentLengthDecoder::new(),
            chunk: vec![0u8; READ_CHUNK],
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for TcpReadWrapper<R> {
    async fn read_batch(&mut self) -> Result<Inbound> {
        loop {
            let n = self
                .inner
                .read(&mut self.chunk)
                .await
                .map_err(|e| BridgeError::TransportClosed(format!("TCP read failed: {}", e)))?;
            if n == 0 {
                return Err(BridgeError::TransportClosed("peer closed the stream".into()));
            }

            let documents = self.decoder.feed(&self.chunk[..n]);
            if !documents.is_empty() {
                return Ok(Inbound::Documents(documents));
            }
        }
    }
}

/// TCP write wrapper
pub struct TcpWriteWrapper<W = OwnedWriteHalf>(pub W);

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for TcpWriteWrapper<W> {
    async fn write_document(&mut self, doc: &Value) -> Result<()> {
        let body = serde_json::to_vec(doc)?;
        debug!("[Rust→DAP] len={} json={}", body.len(), preview(doc));

        self.0
            .write_all(&encode_frame(&body))
            .await
            .map_err(|e| BridgeError::TransportUnavailable(format!("TCP write failed: {}", e)))?;

        // Flush to ensure data is sent
        self.0
            .flush()
            .await
            .map_err(|e| BridgeError::TransportUnavailable(format!("TCP flush failed: {}", e)))?;

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.0
            .shutdown()
            .await
            .map_err(|e| BridgeError::TransportUnavailable(format!("TCP shutdown failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_frames_split_across_reads() {
        let mock = tokio_test::io::Builder::new()
            .read(b"Content-Length: 15\r\n\r\n{\"seq\"")
            .read(b":1,\"x\":2}Content-Length: 2\r\n\r\n{}")
            .build();
        let mut reader = TcpReadWrapper::new(mock);

        match reader.read_batch().await.unwrap() {
            Inbound::Documents(docs) => assert_eq!(docs, vec![json!({"seq": 1, "x": 2}), json!({})]),
            other => panic!("Unexpected inbound: {:?}", other),
        }
        assert!(matches!(
            reader.read_batch().await,
            Err(BridgeError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_content_length_frame() {
        let mock = tokio_test::io::Builder::new()
            .write(b"Content-Length: 7\r\n\r\n{\"a\":1}")
            .build();
        let mut writer = TcpWriteWrapper(mock);
        writer.write_document(&json!({"a": 1})).await.unwrap();
    }
}
