//! Wire protocol between bus clients and the broker daemon
//!
//! Every frame is JSON with a length prefix:
//! `[4-byte length (little-endian)][json bytes]`

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::BusError;

/// Frames larger than this are treated as a protocol error.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Message published by the broker on behalf of a client that drops without saying goodbye.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from a client
    Connect {
        client_id: String,
        will: Option<Will>,
    },
    /// Broker accepted the connection
    ConnAck,
    Subscribe {
        pattern: String,
    },
    /// Sent in both directions
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    /// Clean disconnect; suppresses the will
    Disconnect,
}

impl Frame {
    /// Encode a frame to bytes with length prefix
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        let bytes = serde_json::to_vec(self)?;
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(&bytes);
        Ok(result)
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Read one frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Frame>, BusError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = Self::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(BusError::Protocol(format!("frame of {} bytes is too large", len)));
        }

        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        Ok(Some(serde_json::from_slice(&buf)?))
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), BusError>
    where
        W: AsyncWrite + Unpin,
    {
        let bytes = self.encode()?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix() {
        let frame = Frame::ConnAck;
        let bytes = frame.encode().unwrap();
        let len = Frame::read_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(&bytes[4..], br#"{"type":"conn_ack"}"#);
    }

    #[tokio::test]
    async fn test_stream_of_frames() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let sent = vec![
            Frame::Connect {
                client_id: "astprocd".to_string(),
                will: Some(Will {
                    topic: "astoria/astprocd".to_string(),
                    payload: r#"{"status":"STOPPED"}"#.to_string(),
                    retain: true,
                }),
            },
            Frame::Publish {
                topic: "astoria/astprocd".to_string(),
                payload: "{}".to_string(),
                retain: false,
            },
            Frame::Disconnect,
        ];
        for frame in &sent {
            frame.write_to(&mut client).await.unwrap();
        }
        drop(client);

        let mut received = Vec::new();
        while let Some(frame) = Frame::read_from(&mut server).await.unwrap() {
            received.push(frame);
        }
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let result = Frame::read_from(&mut server).await;
        assert!(matches!(result, Err(BusError::Protocol(_))));
    }
}
