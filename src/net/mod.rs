//! Framed TCP peer protocol. Every request starts with a one-byte type;
//! integers are little-endian and variable payloads are u32-length-prefixed.

mod client;
mod pool;
mod server;

pub use client::{
    check_confirmation, get_blocks_bodies, host_with_max_block, max_block_id, send_transaction,
};
pub use pool::BytesPool;
pub use server::TcpServer;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{ChainError, ChainResult};

/// Broadcast a transaction envelope.
pub const REQUEST_TYPE_SEND_TX: u8 = 1;
/// Ask for the hash of a given block id.
pub const REQUEST_TYPE_CONFIRMATION: u8 = 4;
/// Ask for the peer's highest block id.
pub const REQUEST_TYPE_MAX_BLOCK: u8 = 7;
/// Stream block bodies from a starting id.
pub const REQUEST_TYPE_BLOCK_COLLECTION: u8 = 10;

/// Upper bound on blocks served per forward streaming request.
pub const BLOCKS_PER_REQUEST: u64 = 1000;

/// Hard cap on any length-prefixed payload accepted from a peer.
pub const MAX_PAYLOAD_BYTES: u32 = 64 << 20;

pub(crate) async fn read_u8<R: AsyncRead + Unpin>(reader: &mut R) -> ChainResult<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).await?;
    Ok(buf[0])
}

pub(crate) async fn read_u32<R: AsyncRead + Unpin>(reader: &mut R) -> ChainResult<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) async fn read_u64<R: AsyncRead + Unpin>(reader: &mut R) -> ChainResult<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).await?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) async fn read_hash<R: AsyncRead + Unpin>(reader: &mut R) -> ChainResult<[u8; 32]> {
    let mut buf = [0u8; 32];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Reads one u32-length-prefixed payload. A zero length is returned as an
/// empty vector (the stream sentinel).
pub(crate) async fn read_sized<R: AsyncRead + Unpin>(
    reader: &mut R,
    pool: &BytesPool,
) -> ChainResult<Vec<u8>> {
    let len = read_u32(reader).await?;
    if len == 0 {
        return Ok(Vec::new());
    }
    if len > MAX_PAYLOAD_BYTES {
        return Err(ChainError::Net(format!("payload of {len} bytes refused")));
    }
    let mut buf = pool.get(len as u64);
    buf.truncate(len as usize);
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

pub(crate) async fn write_sized<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> ChainResult<()> {
    writer
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    Ok(())
}

pub(crate) async fn write_sentinel<W: AsyncWrite + Unpin>(writer: &mut W) -> ChainResult<()> {
    writer.write_all(&0u32.to_le_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sized_payload_round_trip() {
        let pool = BytesPool::default();
        let mut buf: Vec<u8> = Vec::new();
        write_sized(&mut buf, b"abc").await.unwrap();
        write_sentinel(&mut buf).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let payload = read_sized(&mut cursor, &pool).await.unwrap();
        assert_eq!(payload, b"abc");
        let sentinel = read_sized(&mut cursor, &pool).await.unwrap();
        assert!(sentinel.is_empty());
    }

    #[tokio::test]
    async fn oversize_payload_is_refused() {
        let pool = BytesPool::default();
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&(MAX_PAYLOAD_BYTES + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_sized(&mut cursor, &pool).await.is_err());
    }
}
