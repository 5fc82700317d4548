//! Frame boundaries on the engine socket.
//!
//! The default framing is a 4-byte big-endian length followed by the
//! payload. The padded framing writes every frame as a fixed-size block,
//! NUL-padded after the payload, which is what older engine builds expect.
//! Either way the payload must stay strictly below the frame bound, and an
//! oversized payload is refused before anything is written.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ChannelError;

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;
pub const LEGACY_FRAME_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    LengthPrefixed { max_len: usize },
    /// Fixed-size frames. Trailing NULs are stripped on read, so payloads
    /// must not end in a NUL byte (true of JSON, not of CBOR).
    Padded { frame_len: usize },
}

impl Default for Framing {
    fn default() -> Self {
        Self::LengthPrefixed {
            max_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl Framing {
    pub fn legacy() -> Self {
        Self::Padded {
            frame_len: LEGACY_FRAME_LEN,
        }
    }

    /// Payloads must be strictly shorter than this.
    pub fn bound(&self) -> usize {
        match *self {
            Self::LengthPrefixed { max_len } => max_len,
            Self::Padded { frame_len } => frame_len,
        }
    }

    pub fn encode(&self, command: &'static str, payload: &[u8]) -> Result<Bytes, ChannelError> {
        let max = self.bound();
        if payload.len() >= max {
            return Err(ChannelError::FrameTooLarge {
                command,
                len: payload.len(),
                max,
            });
        }
        let frame = match *self {
            Self::LengthPrefixed { .. } => {
                let mut buf = BytesMut::with_capacity(4 + payload.len());
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
                buf
            }
            Self::Padded { frame_len } => {
                let mut buf = BytesMut::zeroed(frame_len);
                buf[..payload.len()].copy_from_slice(payload);
                buf
            }
        };
        Ok(frame.freeze())
    }

    pub async fn write_frame<W>(
        &self,
        writer: &mut W,
        command: &'static str,
        payload: &[u8],
    ) -> Result<(), ChannelError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.encode(command, payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads one frame and returns its payload.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Bytes, ChannelError>
    where
        R: AsyncRead + Unpin,
    {
        match *self {
            Self::LengthPrefixed { max_len } => {
                let mut len_buf = [0u8; 4];
                read_exact(reader, &mut len_buf).await?;
                let len = u32::from_be_bytes(len_buf) as usize;
                if len >= max_len {
                    return Err(ChannelError::Malformed(format!(
                        "frame length {len} exceeds bound {max_len}"
                    )));
                }
                let mut payload = BytesMut::zeroed(len);
                read_exact(reader, &mut payload).await?;
                Ok(payload.freeze())
            }
            Self::Padded { frame_len } => {
                let mut frame = BytesMut::zeroed(frame_len);
                read_exact(reader, &mut frame).await?;
                let end = frame.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                frame.truncate(end);
                Ok(frame.freeze())
            }
        }
    }
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ChannelError::UnexpectedEof),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_is_big_endian() {
        let frame = Framing::default().encode("config", b"{}").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn payload_at_the_bound_is_refused() {
        let framing = Framing::LengthPrefixed { max_len: 8 };
        assert!(framing.encode("connect", &[b'x'; 7]).is_ok());
        let err = framing.encode("connect", &[b'x'; 8]).unwrap_err();
        assert!(matches!(
            err,
            ChannelError::FrameTooLarge {
                command: "connect",
                len: 8,
                max: 8
            }
        ));

        let err = Framing::legacy().encode("config", &[b'x'; 256]).unwrap_err();
        assert!(matches!(err, ChannelError::FrameTooLarge { max: 256, .. }));
    }

    #[tokio::test]
    async fn padded_frames_are_fixed_size_and_stripped() {
        let framing = Framing::legacy();
        let (mut a, mut b) = tokio::io::duplex(1024);
        framing
            .write_frame(&mut a, "config", br#"{"type":"config"}"#)
            .await
            .unwrap();

        let payload = framing.read_frame(&mut b).await.unwrap();
        assert_eq!(&payload[..], br#"{"type":"config"}"#);
    }

    #[test]
    fn padded_frame_on_the_wire_is_exactly_frame_len() {
        let frame = Framing::legacy().encode("config", b"{}").unwrap();
        assert_eq!(frame.len(), LEGACY_FRAME_LEN);
        assert!(frame[2..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn oversized_length_header_is_malformed() {
        let framing = Framing::LengthPrefixed { max_len: 16 };
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            framing.read_frame(&mut b).await,
            Err(ChannelError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn short_frame_is_unexpected_eof() {
        let framing = Framing::default();
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, b'{']).await.unwrap();
        drop(a);
        assert!(matches!(
            framing.read_frame(&mut b).await,
            Err(ChannelError::UnexpectedEof)
        ));
    }
}
