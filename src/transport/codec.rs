//! Length-prefixed framing for HSM request/response exchanges
//!
//! Every command and every response travels as a single frame: a 2-byte
//! big-endian length followed by that many payload bytes. The payload itself
//! is opaque to this crate.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length header preceding every frame
pub const HEADER_LEN: usize = 2;

/// Largest payload a single frame can carry
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Framing errors
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    #[error("frame payload of {len} bytes exceeds maximum of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("frame I/O failed: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Io(Arc::new(err))
    }
}

impl FrameError {
    /// True when the peer closed the stream before a full frame arrived
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Build the on-wire representation of a payload
pub fn encode_frame(payload: &[u8]) -> Result<BytesMut, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf)
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame and return its payload
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let frame = encode_frame(b"NC").unwrap();
        assert_eq!(&frame[..], &[0x00, 0x02, b'N', b'C']);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_LEN + 1];
        let result = encode_frame(&payload);
        assert!(matches!(
            result,
            Err(FrameError::TooLarge { len, max })
                if len == MAX_FRAME_LEN + 1 && max == MAX_FRAME_LEN
        ));
    }

    #[tokio::test]
    async fn test_frames_survive_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"0000NC").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();

        assert_eq!(read_frame(&mut server).await.unwrap(), b"0000NC".to_vec());
        assert!(read_frame(&mut server).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Header promises 10 bytes, only 3 arrive before the peer goes away
        client.write_all(&[0x00, 0x0A, 1, 2, 3]).await.unwrap();
        drop(client);

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.is_eof(), "expected EOF, got {err:?}");
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0x00])
            .read(&[0x04, b'0', b'0'])
            .read(b"00")
            .write(&[0x00, 0x02, b'O', b'K'])
            .build();

        assert_eq!(read_frame(&mut mock).await.unwrap(), b"0000".to_vec());
        write_frame(&mut mock, b"OK").await.unwrap();
    }
}
