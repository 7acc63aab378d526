//! Framing for RPC messages
//!
//! Frame layout: `[compressed: u8][length: u32 BE][payload]`. Payloads
//! larger than [`COMPRESSION_THRESHOLD`] are LZ4 compressed. Each
//! connection starts with [`MAGIC`] so stray clients are rejected early.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::SyncMessage;
use crate::error::{SyncError, SyncResult};

/// Maximum frame size (16 MB)
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Compression threshold (64 KB)
pub const COMPRESSION_THRESHOLD: usize = 64 * 1024;

pub const MAGIC: &[u8; 14] = b"solisync-rpc-1";

pub async fn write_magic<W: AsyncWrite + Unpin>(stream: &mut W) -> SyncResult<()> {
    stream.write_all(MAGIC).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_magic<R: AsyncRead + Unpin>(stream: &mut R) -> SyncResult<()> {
    let mut magic = [0u8; 14];
    stream.read_exact(&mut magic).await?;
    if &magic != MAGIC {
        return Err(SyncError::Protocol("Unknown protocol header".to_string()));
    }
    Ok(())
}

/// Encode a message into a single frame
pub fn encode_frame(msg: &SyncMessage) -> SyncResult<Vec<u8>> {
    let payload = bincode::serialize(msg)?;

    let (data, compressed) = if payload.len() > COMPRESSION_THRESHOLD {
        (lz4_flex::compress_prepend_size(&payload), true)
    } else {
        (payload, false)
    };

    let len = data.len() as u32;
    if data.len() > MAX_MESSAGE_SIZE as usize {
        return Err(SyncError::Protocol(format!("Message too large: {} bytes", data.len())));
    }

    let mut frame = Vec::with_capacity(5 + data.len());
    frame.push(if compressed { 1 } else { 0 });
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&data);
    Ok(frame)
}

pub async fn write_message<W>(stream: &mut W, msg: &SyncMessage) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(msg)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message<R>(stream: &mut R) -> SyncResult<SyncMessage>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;

    let compressed = header[0] == 1;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_MESSAGE_SIZE {
        return Err(SyncError::Protocol(format!("Message too large: {} bytes", len)));
    }

    let mut data = vec![0u8; len as usize];
    stream.read_exact(&mut data).await?;

    let payload = if compressed { decompress(&data)? } else { data };

    Ok(bincode::deserialize(&payload)?)
}

/// Inflate an LZ4 payload whose little-endian size prefix is bounded by
/// [`MAX_MESSAGE_SIZE`]
fn decompress(data: &[u8]) -> SyncResult<Vec<u8>> {
    let prefix: [u8; 4] = data
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| SyncError::Protocol("Compressed frame too short".to_string()))?;
    let size = u32::from_le_bytes(prefix);
    if size > MAX_MESSAGE_SIZE {
        return Err(SyncError::Protocol(format!(
            "Decompressed message too large: {} bytes",
            size
        )));
    }
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| SyncError::Protocol(format!("Decompression failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{AsyncMessageHeader, KeyedValues, SyncValueMessage};
    use crate::sync::byte_array::ByteArray;
    use crate::sync::vector_clock::VectorClock;
    use crate::sync::versioned::Versioned;

    #[tokio::test]
    async fn test_large_payload_is_compressed() {
        let values = vec![KeyedValues::new(
            ByteArray::from("big"),
            vec![Versioned::of(vec![7u8; 200 * 1024], VectorClock::from_entries([(1, 1)], 0))],
        )];
        let msg = SyncMessage::SyncValue(SyncValueMessage {
            header: AsyncMessageHeader::new(9),
            store: "apps".to_string(),
            values,
        });
        let frame = encode_frame(&msg).unwrap();
        assert_eq!(frame[0], 1);
        assert!(frame.len() < 100 * 1024);

        let mut reader = &frame[..];
        match read_message(&mut reader).await.unwrap() {
            SyncMessage::SyncValue(m) => {
                assert_eq!(m.header.transaction_id, 9);
                assert_eq!(m.values[0].values[0].value().map(|v| v.len()), Some(200 * 1024));
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_compressed_size_prefix_is_bounded() {
        // 4 GiB claimed behind an 8 byte body
        let body = [0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0];
        let mut frame = vec![1u8];
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        let mut reader = &frame[..];
        match read_message(&mut reader).await {
            Err(SyncError::Protocol(msg)) => assert!(msg.contains("too large"), "{}", msg),
            other => panic!("unexpected {:?}", other.map(|m| m.type_name())),
        }

        let mut frame = vec![1u8];
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        let mut reader = &frame[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut frame = vec![0u8];
        frame.extend_from_slice(&(MAX_MESSAGE_SIZE + 1).to_be_bytes());
        let mut reader = &frame[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(SyncError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let msg = SyncMessage::error(4, crate::rpc::protocol::ErrorCode::UnknownStore, "apps");
        let frame = encode_frame(&msg).unwrap();
        let (head, tail) = frame.split_at(3);

        let mut stream = tokio_test::io::Builder::new()
            .read(MAGIC)
            .read(head)
            .read(tail)
            .write(&frame)
            .build();
        read_magic(&mut stream).await.unwrap();
        match read_message(&mut stream).await.unwrap() {
            SyncMessage::Error(e) => {
                assert_eq!(e.header.transaction_id, 4);
                assert_eq!(e.message, "apps");
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        write_message(&mut stream, &msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_magic_mismatch() {
        let mut reader = &b"something-else"[..];
        assert!(read_magic(&mut reader).await.is_err());
        let mut ok = &MAGIC[..];
        assert!(read_magic(&mut ok).await.is_ok());
    }
}
