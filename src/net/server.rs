use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::errors::{ChainError, ChainResult};
use crate::node::NodeContext;

use super::{
    read_sized, read_u64, read_u8, write_sentinel, write_sized, BLOCKS_PER_REQUEST,
    REQUEST_TYPE_BLOCK_COLLECTION, REQUEST_TYPE_CONFIRMATION, REQUEST_TYPE_MAX_BLOCK,
    REQUEST_TYPE_SEND_TX,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves the peer protocol. Handlers read only committed state and never
/// take the chain mutation lock.
pub struct TcpServer {
    ctx: Arc<NodeContext>,
}

impl TcpServer {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> ChainResult<()> {
        let listener = tokio::net::TcpListener::bind(self.ctx.config.tcp_listen).await?;
        info!(listen = %self.ctx.config.tcp_listen, "tcp server started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(ctx, socket).await {
                                    debug!(%peer, ?err, "peer connection closed");
                                }
                            });
                        }
                        Err(err) => warn!(?err, "accept failed"),
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(ctx: Arc<NodeContext>, mut socket: TcpStream) -> ChainResult<()> {
    loop {
        let request_type = match timeout(IDLE_TIMEOUT, read_u8(&mut socket)).await {
            Ok(Ok(request_type)) => request_type,
            Ok(Err(_)) | Err(_) => return Ok(()),
        };
        match timeout(REQUEST_TIMEOUT, dispatch(&ctx, &mut socket, request_type)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(ChainError::Net("request timed out".into())),
        }
    }
}

async fn dispatch(
    ctx: &NodeContext,
    socket: &mut TcpStream,
    request_type: u8,
) -> ChainResult<()> {
    match request_type {
        REQUEST_TYPE_SEND_TX => {
            let raw = read_sized(socket, &ctx.bytes_pool).await?;
            let accepted = match ctx.pool.submit(&raw) {
                Ok(_) => true,
                Err(err) => {
                    debug!(?err, "broadcast transaction rejected");
                    false
                }
            };
            ctx.bytes_pool.put(raw);
            socket.write_all(&[u8::from(accepted)]).await?;
        }
        REQUEST_TYPE_CONFIRMATION => {
            let block_id = read_u64(socket).await?;
            let hash = ctx
                .storage
                .block(block_id)?
                .map(|record| record.hash)
                .unwrap_or([0u8; 32]);
            socket.write_all(&hash).await?;
        }
        REQUEST_TYPE_MAX_BLOCK => {
            let max = ctx.storage.max_block_id()?.unwrap_or(0);
            socket.write_all(&max.to_le_bytes()).await?;
        }
        REQUEST_TYPE_BLOCK_COLLECTION => {
            let start_id = read_u64(socket).await?;
            let reverse = read_u8(socket).await? != 0;
            let records = if reverse {
                let limit = ctx.sys.read().rollback_blocks as usize;
                ctx.storage.blocks_desc_from(start_id, limit)?
            } else {
                ctx.storage
                    .blocks_from(start_id, BLOCKS_PER_REQUEST as usize)?
            };
            for record in records {
                write_sized(socket, &record.data).await?;
            }
            write_sentinel(socket).await?;
        }
        other => {
            return Err(ChainError::Net(format!("unknown request type {other}")));
        }
    }
    Ok(())
}
