use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{ChainError, ChainResult};

use super::{
    read_hash, read_sized, read_u64, read_u8, write_sized, BytesPool,
    REQUEST_TYPE_BLOCK_COLLECTION, REQUEST_TYPE_CONFIRMATION, REQUEST_TYPE_MAX_BLOCK,
    REQUEST_TYPE_SEND_TX,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(10);
const STREAM_FRAME_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_CHANNEL_CAPACITY: usize = 16;

async fn connect(host: &str) -> ChainResult<TcpStream> {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(host)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(ChainError::Net(format!("connect {host}: {err}"))),
        Err(_) => Err(ChainError::Net(format!("connect {host}: timeout"))),
    }
}

/// Discover the peer's highest block id.
pub async fn max_block_id(host: &str) -> ChainResult<u64> {
    let mut stream = connect(host).await?;
    stream.write_all(&[REQUEST_TYPE_MAX_BLOCK]).await?;
    match timeout(READ_TIMEOUT, read_u64(&mut stream)).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Net(format!("read {host}: timeout"))),
    }
}

/// Ask a peer for the hash it recorded at `block_id`; the zero hash means
/// the peer does not have the block.
pub async fn check_confirmation(host: &str, block_id: u64) -> ChainResult<[u8; 32]> {
    let mut stream = connect(host).await?;
    stream.write_all(&[REQUEST_TYPE_CONFIRMATION]).await?;
    stream.write_all(&block_id.to_le_bytes()).await?;
    match timeout(READ_TIMEOUT, read_hash(&mut stream)).await {
        Ok(result) => result,
        Err(_) => Err(ChainError::Net(format!("read {host}: timeout"))),
    }
}

/// Push a transaction envelope to a peer.
pub async fn send_transaction(host: &str, raw: &[u8]) -> ChainResult<()> {
    let mut stream = connect(host).await?;
    stream.write_all(&[REQUEST_TYPE_SEND_TX]).await?;
    write_sized(&mut stream, raw).await?;
    let status = match timeout(READ_TIMEOUT, read_u8(&mut stream)).await {
        Ok(result) => result?,
        Err(_) => return Err(ChainError::Net(format!("read {host}: timeout"))),
    };
    if status == 0 {
        return Err(ChainError::Net(format!("{host} rejected transaction")));
    }
    Ok(())
}

/// Opens a block-body stream from `start_id`. Bodies arrive on the returned
/// bounded channel until the peer's sentinel, an error, or the receiver is
/// dropped; `reverse` walks backward for fork search.
pub async fn get_blocks_bodies(
    host: &str,
    start_id: u64,
    reverse: bool,
) -> ChainResult<mpsc::Receiver<Vec<u8>>> {
    let mut stream = connect(host).await?;
    stream.write_all(&[REQUEST_TYPE_BLOCK_COLLECTION]).await?;
    stream.write_all(&start_id.to_le_bytes()).await?;
    stream.write_all(&[u8::from(reverse)]).await?;

    let (sender, receiver) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let host = host.to_string();
    tokio::spawn(async move {
        let pool = BytesPool::default();
        loop {
            let body = match timeout(STREAM_FRAME_TIMEOUT, read_sized(&mut stream, &pool)).await
            {
                Ok(Ok(body)) => body,
                Ok(Err(err)) => {
                    debug!(%host, ?err, "block stream ended");
                    break;
                }
                Err(_) => {
                    warn!(%host, "block stream frame timeout");
                    break;
                }
            };
            if body.is_empty() {
                break;
            }
            if sender.send(body).await.is_err() {
                break;
            }
        }
    });
    Ok(receiver)
}

/// Probes every host concurrently and returns the one reporting the highest
/// block. Unreachable peers are skipped; all unreachable is an error.
pub async fn host_with_max_block(hosts: &[String]) -> ChainResult<(String, u64)> {
    if hosts.is_empty() {
        return Err(ChainError::NodesUnavailable);
    }
    let mut probes = JoinSet::new();
    for host in hosts {
        let host = host.clone();
        probes.spawn(async move {
            let max = max_block_id(&host).await;
            (host, max)
        });
    }
    let mut best: Option<(String, u64)> = None;
    while let Some(joined) = probes.join_next().await {
        let Ok((host, result)) = joined else { continue };
        match result {
            Ok(max) => {
                if best.as_ref().map(|(_, current)| max > *current).unwrap_or(true) {
                    best = Some((host, max));
                }
            }
            Err(err) => debug!(%host, ?err, "peer probe failed"),
        }
    }
    best.ok_or(ChainError::NodesUnavailable)
}
