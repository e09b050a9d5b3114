use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SysParams;
use crate::daemons::Daemon;
use crate::errors::{ChainError, ChainResult};
use crate::net;
use crate::node::NodeContext;
use crate::rollback::rollback_block_in;
use crate::types::{Block, GENESIS_BLOCK_ID};
use crate::validator::{apply_block_in, parse_foreign_block};

/// One blocks-collection tick: find the best peer, and if it is ahead of us,
/// stream and apply its blocks under the chain mutation lock.
pub async fn blocks_collection(ctx: Arc<NodeContext>, _daemon: Arc<Daemon>) -> ChainResult<()> {
    let sys = ctx.sys.read().clone();
    let hosts = ctx
        .node_bans
        .filter_banned_hosts(&sys, &sys.remote_hosts(ctx.key_id));
    if hosts.is_empty() {
        return Ok(());
    }
    let (host, max_block_id) = match net::host_with_max_block(&hosts).await {
        Ok(found) => found,
        Err(ChainError::NodesUnavailable) => return Ok(()),
        Err(err) => return Err(err),
    };

    let tip = ctx
        .storage
        .info_block()?
        .map(|info| info.block_id)
        .unwrap_or(0);
    if tip >= max_block_id {
        debug!(tip, peer_max = max_block_id, "peer has nothing newer");
        return Ok(());
    }

    let _db_guard = ctx.db_lock.lock().await;
    update_chain(&ctx, &sys, &host, max_block_id).await
}

/// Downloads blocks `tip+1..=max_block_id` from `host` and applies them one
/// by one; a hash check failure hands over to the fork resolver.
async fn update_chain(
    ctx: &NodeContext,
    sys: &SysParams,
    host: &str,
    max_block_id: u64,
) -> ChainResult<()> {
    let start = ctx
        .storage
        .info_block()?
        .map(|info| info.block_id + 1)
        .unwrap_or(GENESIS_BLOCK_ID);
    info!(
        min_block = start,
        max_block = max_block_id,
        host,
        "downloading blocks"
    );
    let mut next = start;
    while next <= max_block_id {
        let mut bodies = net::get_blocks_bodies(host, next, false).await?;
        let mut received = 0usize;
        while let Some(raw) = bodies.recv().await {
            play_raw_block(ctx, sys, host, &raw).await?;
            received += 1;
            next += 1;
            if next > max_block_id {
                break;
            }
        }
        if received == 0 {
            // Peer stopped serving before reaching its advertised height.
            return Err(ChainError::Net(format!(
                "{host} stopped streaming at block {next}"
            )));
        }
    }
    Ok(())
}

async fn play_raw_block(
    ctx: &NodeContext,
    sys: &SysParams,
    host: &str,
    raw: &[u8],
) -> ChainResult<()> {
    let block = parse_foreign_block(&ctx.storage, raw)?;
    let block_id = block.header.block_id;
    let block_time = block.header.time;
    let result = {
        let vm = ctx.smart_vm.read();
        let mut stx = ctx.storage.begin();
        let applied = apply_block_in(&mut stx, &vm, &ctx.bad_keys, sys, &block);
        drop(vm);
        applied.and_then(|()| stx.commit())
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            // Hash disagreement with a signed block means a fork: replace
            // our recent history with the peer's. A rollback-hash mismatch
            // fetches one extra parent.
            let replace_count = match &err {
                ChainError::IncorrectRollbackHash => 2,
                _ => 1,
            };
            warn!(?err, host, block_id, replace_count, "block check failed");
            if is_fork_trigger(&err) {
                replace_blocks_from_host(ctx, sys, host, block_id - 1, replace_count).await?;
            }
            ban_node_on_error(ctx, sys, &block, &err);
            Err(err)
        }
    }
    .map(|()| {
        debug!(block_id, block_time, "foreign block applied");
    })
}

fn is_fork_trigger(err: &ChainError) -> bool {
    matches!(
        err,
        ChainError::IncorrectRollbackHash | ChainError::Block(_) | ChainError::Banned(_)
    )
}

fn ban_node_on_error(ctx: &NodeContext, sys: &SysParams, block: &Block, err: &ChainError) {
    if !err.is_ban_error() {
        return;
    }
    let Ok(producer) = sys.node_by_position(block.header.node_position) else {
        return;
    };
    if let Err(ban_err) = ctx.node_bans.register_bad_block(
        sys,
        &ctx.pool,
        &ctx.keypair,
        producer,
        block.header.block_id,
        block.header.time,
        &err.to_string(),
        true,
    ) {
        warn!(?ban_err, "failed to register bad block");
    }
}

/// Fork resolution: fetch the peer's chain backwards from the disagreement
/// height (bounded by `rollback_blocks`), unverify the pool, then rewind our
/// blocks and re-apply the peer's, all inside one storage transaction so a
/// failed replacement leaves the pre-fork state untouched.
pub async fn replace_blocks_from_host(
    ctx: &NodeContext,
    sys: &SysParams,
    host: &str,
    block_id: u64,
    replace_count: u64,
) -> ChainResult<()> {
    let blocks = fetch_reverse_chain(ctx, sys, host, block_id, replace_count).await?;
    let Some(lowest) = blocks.last().map(|block| block.header.block_id) else {
        return Err(ChainError::Net(format!("{host} served no fork blocks")));
    };

    ctx.pool.unverify_all()?;

    let tip = ctx
        .storage
        .info_block()?
        .map(|info| info.block_id)
        .unwrap_or(0);

    ctx.smart_vm.savepoint();
    let mut stx = ctx.storage.begin();
    let outcome = (|| -> ChainResult<()> {
        for record in ctx.storage.blocks_desc_from(tip, 0)? {
            if record.id < lowest {
                break;
            }
            rollback_block_in(&mut stx, &record.data)?;
        }
        let vm = ctx.smart_vm.read();
        for block in blocks.iter().rev() {
            apply_block_in(&mut stx, &vm, &ctx.bad_keys, sys, block)?;
        }
        Ok(())
    })();

    match outcome {
        Ok(()) => {
            stx.commit()?;
            ctx.smart_vm.release();
            info!(host, from = lowest, "fork resolved from peer chain");
            Ok(())
        }
        Err(err) => {
            // The uncommitted transaction dies with this scope; the database
            // keeps the pre-fork state.
            drop(stx);
            ctx.smart_vm.rollback();
            if let Ok(node) = sys.node_by_host(host) {
                let _ = ctx.node_bans.register_bad_block(
                    sys,
                    &ctx.pool,
                    &ctx.keypair,
                    node,
                    block_id,
                    0,
                    &err.to_string(),
                    false,
                );
            }
            Err(err)
        }
    }
}

/// Walks the peer's chain backward from `block_id`, collecting blocks until
/// one carries a valid producer signature and `min_count` blocks are in
/// hand, or the `rollback_blocks` budget is exhausted.
async fn fetch_reverse_chain(
    _ctx: &NodeContext,
    sys: &SysParams,
    host: &str,
    block_id: u64,
    min_count: u64,
) -> ChainResult<Vec<Block>> {
    let mut bodies = net::get_blocks_bodies(host, block_id, true).await?;
    let mut blocks: Vec<Block> = Vec::new();
    let mut next = block_id;
    while let Some(raw) = bodies.recv().await {
        if next < 2 {
            break;
        }
        if blocks.len() as u64 >= sys.rollback_blocks {
            break;
        }
        let block = Block::from_bytes(&raw).map_err(ChainError::with_ban)?;
        if block.header.block_id != next {
            return Err(ChainError::with_ban(ChainError::Block(
                "fork stream block ids do not match".into(),
            )));
        }
        let node = sys.node_by_position(block.header.node_position)?;
        let signed = block.verify_signature(&node.public_key).is_ok();
        blocks.push(block);
        if signed && blocks.len() as u64 >= min_count {
            break;
        }
        next -= 1;
    }
    Ok(blocks)
}
