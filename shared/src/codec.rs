//! Length-prefixed bincode framing shared by the relay and the peers.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! bincode-encoded [`Packet`].

use crate::{Packet, SyncError, MAX_FRAME_LEN};
use bincode::{deserialize, serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub fn encode(packet: &Packet) -> Result<Vec<u8>, SyncError> {
    let body = serialize(packet).map_err(SyncError::Encode)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode(body: &[u8]) -> Result<Packet, SyncError> {
    deserialize(body).map_err(SyncError::Decode)
}

/// Reads one frame. Returns `Ok(None)` when the stream closes cleanly
/// between frames.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, SyncError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(SyncError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode(&body).map(Some)
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), SyncError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PropertyScope, PropertyValue};

    #[test]
    fn test_encode_prefixes_length() {
        let frame = encode(&Packet::Heartbeat).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[test]
    fn test_encode_rejects_oversized_packet() {
        let packet = Packet::SetProperties {
            scope: PropertyScope::Session,
            props: vec![(
                "Blob".to_string(),
                PropertyValue::Str("x".repeat(MAX_FRAME_LEN + 1)),
            )],
        };

        match encode(&packet) {
            Err(SyncError::FrameTooLarge { max, .. }) => assert_eq!(max, MAX_FRAME_LEN),
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(decode(&[0xff, 0xff, 0xff, 0xff, 0xff]), Err(SyncError::Decode(_))));
    }

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_packet(&mut a, &Packet::Disconnect).await.unwrap();
        write_packet(&mut a, &Packet::Heartbeat).await.unwrap();
        drop(a);

        assert!(matches!(read_packet(&mut b).await.unwrap(), Some(Packet::Disconnect)));
        assert!(matches!(read_packet(&mut b).await.unwrap(), Some(Packet::Heartbeat)));
        assert!(read_packet(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn test_read_rejects_oversized_length_prefix() {
        let mut bytes: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        let result = tokio_test::block_on(read_packet(&mut bytes));
        assert!(matches!(result, Err(SyncError::FrameTooLarge { .. })));
    }
}
