use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SysParams;
use crate::daemons::Daemon;
use crate::errors::{ChainError, ChainResult};
use crate::node::NodeContext;
use crate::scheduler::{now_unix, BlockTimeCounter};
use crate::storage::DelayedContract;
use crate::types::{
    new_internal_transaction, Block, BlockHeader, InfoBlock, QueuedTransaction, StoredBlock,
    TxParam, BLOCK_VERSION,
};
use crate::validator::{play_transactions, PlayMode};

pub const CALL_DELAYED_CONTRACT: &str = "CallDelayedContract";
const FIRST_ECOSYSTEM_ID: i64 = 1;

/// Cumulative block limits enforced while draining the pool. A breach of a
/// per-transaction bound skips that transaction; a cumulative breach stops
/// the drain and finalises the block with what was collected.
pub struct BlockLimits {
    max_count: usize,
    max_size: u64,
    max_tx_size: u64,
    count: usize,
    size: u64,
}

pub enum LimitCheck {
    Ok,
    Skip(String),
    Stop,
}

impl BlockLimits {
    pub fn from_params(sys: &SysParams) -> Self {
        Self {
            max_count: sys.max_tx_count,
            max_size: sys.max_block_size,
            max_tx_size: sys.max_tx_size,
            count: 0,
            size: 0,
        }
    }

    pub fn check(&mut self, tx_len: u64) -> LimitCheck {
        if tx_len > self.max_tx_size {
            return LimitCheck::Skip(format!(
                "transaction of {tx_len} bytes exceeds the per-transaction cap"
            ));
        }
        if self.count + 1 > self.max_count || self.size + tx_len > self.max_size {
            return LimitCheck::Stop;
        }
        self.count += 1;
        self.size += tx_len;
        LimitCheck::Ok
    }
}

/// One block-generator tick: claim the slot if it is ours, drain the pool
/// under the block limits and the slot deadline, replay the batch, sign and
/// commit.
pub async fn block_generator(ctx: Arc<NodeContext>, daemon: Arc<Daemon>) -> ChainResult<()> {
    daemon.set_sleep(Duration::from_secs(1));
    let sys = ctx.sys.read().clone();
    let Some(position) = sys.node_position_by_key(ctx.key_id) else {
        // Not an honor node; nothing to produce.
        daemon.set_sleep(Duration::from_secs(4));
        return Ok(());
    };

    let _db_guard = ctx.db_lock.lock().await;

    let counter = BlockTimeCounter::from_params(&sys);
    let now = now_unix();
    if counter.block_for_time_exists(&ctx.storage, now, position)? {
        return Ok(());
    }
    if !counter.time_to_generate(now, position) {
        debug!("not my generation time");
        return Ok(());
    }
    let (slot_start, slot_end) = counter.range_by_time(now);
    let deadline = Instant::now() + Duration::from_secs((slot_end - now).max(0) as u64);

    let prev = ctx
        .storage
        .info_block()?
        .ok_or_else(|| ChainError::Block("info block not found".into()))?;
    if slot_start <= prev.time {
        return Ok(());
    }
    let block_id = prev.block_id + 1;

    let mut raw_txs = collect_delayed(&ctx, &sys, block_id, slot_start)?;
    let delayed_count = raw_txs.len();
    let selection = ctx.pool.select_for_block(sys.max_tx_count)?;
    drain_selection(&mut raw_txs, selection, &sys, deadline);

    // Block generation only starts when there is something to include.
    if raw_txs.is_empty() {
        return Ok(());
    }

    let mut stx = ctx.storage.begin();
    let vm = ctx.smart_vm.read();
    let play = play_transactions(
        &mut stx,
        &vm,
        block_id,
        slot_start,
        &raw_txs,
        &sys,
        &ctx.bad_keys,
        PlayMode::Produce,
    )?;
    drop(vm);

    for (hash, key_id, reason) in &play.dropped {
        ctx.pool.mark_bad(hash, *key_id, reason)?;
    }
    if play.included.is_empty() {
        return Ok(());
    }

    let mut block = Block {
        header: BlockHeader {
            block_id,
            time: slot_start,
            ecosystem_id: 0,
            key_id: ctx.key_id,
            node_position: position,
            version: BLOCK_VERSION,
            sign: Vec::new(),
        },
        prev_hash: prev.hash,
        merkle_root: play.merkle_root,
        rollbacks_hash: play.rollbacks_hash,
        transactions: play.included.iter().map(|tx| tx.raw.clone()).collect(),
        bin_data: Vec::new(),
    };
    block.sign(&ctx.keypair);

    stx.insert_block(&StoredBlock::from_block(&block)?)?;
    stx.set_info_block(&InfoBlock::from_block(&block))?;
    stx.commit()?;
    reschedule_delayed(&ctx, block_id, delayed_count)?;
    info!(
        block_id,
        txs = block.transactions.len(),
        hash = %hex::encode(block.hash()),
        "block generated"
    );
    Ok(())
}

/// Applies limits and the slot deadline to the pool selection, appending the
/// surviving envelopes to `raw_txs`. A StopNetwork transaction replaces the
/// whole batch with itself.
fn drain_selection(
    raw_txs: &mut Vec<Vec<u8>>,
    selection: Vec<QueuedTransaction>,
    sys: &SysParams,
    deadline: Instant,
) {
    let mut limits = BlockLimits::from_params(sys);
    for row in selection {
        if Instant::now() >= deadline {
            debug!("slot deadline reached while draining the pool");
            break;
        }
        if row.is_stop_network() {
            raw_txs.clear();
            raw_txs.push(row.data);
            return;
        }
        match limits.check(row.data.len() as u64) {
            LimitCheck::Ok => raw_txs.push(row.data),
            LimitCheck::Skip(reason) => {
                debug!(hash = %hex::encode(row.hash), reason, "transaction skipped");
            }
            LimitCheck::Stop => break,
        }
    }
}

/// Synthesizes one internal `CallDelayedContract` transaction per delayed
/// row scheduled at or before `block_id`.
fn collect_delayed(
    ctx: &NodeContext,
    sys: &SysParams,
    block_id: u64,
    time: i64,
) -> ChainResult<Vec<Vec<u8>>> {
    let rows = ctx.storage.delayed_contracts_for_block(block_id)?;
    let mut raw_txs = Vec::with_capacity(rows.len());
    for row in rows {
        let mut params = BTreeMap::new();
        params.insert("Id".to_string(), TxParam::Int(row.id as i64));
        let (raw, _) = new_internal_transaction(
            CALL_DELAYED_CONTRACT,
            params,
            &ctx.keypair,
            ctx.key_id,
            time,
            FIRST_ECOSYSTEM_ID,
            sys.network_id,
        )?;
        raw_txs.push(raw);
    }
    Ok(raw_txs)
}

/// Advances the local schedule of the delayed rows that were just included:
/// recurring rows move forward by `every_block`, one-shot rows retire.
fn reschedule_delayed(ctx: &NodeContext, block_id: u64, count: usize) -> ChainResult<()> {
    if count == 0 {
        return Ok(());
    }
    for mut row in ctx.storage.delayed_contracts_for_block(block_id)? {
        row.counter += 1;
        if row.every_block > 0 {
            row.block_id = block_id + row.every_block;
        } else {
            row.deleted = true;
        }
        ctx.storage.save_delayed_contract(&row)?;
    }
    Ok(())
}

/// Registers a delayed contract invocation. Exposed for the scheduler-facing
/// surfaces; block production picks the row up at its target block.
pub fn schedule_delayed_contract(
    ctx: &NodeContext,
    row: &DelayedContract,
) -> ChainResult<()> {
    if row.contract.is_empty() {
        return Err(ChainError::Config("delayed contract name is empty".into()));
    }
    if ctx.storage.delayed_contract_exists(row.id)? {
        warn!(id = row.id, "delayed contract row overwritten");
    }
    ctx.storage.save_delayed_contract(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::types::TxRate;

    fn sys() -> SysParams {
        let mut config = NodeConfig::default();
        config.params.max_tx_count = Some(3);
        config.params.max_block_size = Some(100);
        config.params.max_tx_size = Some(40);
        SysParams::from_config(&config).expect("params")
    }

    fn row(hash: u8, len: usize, rate: TxRate) -> QueuedTransaction {
        QueuedTransaction {
            hash: [hash; 32],
            data: vec![0u8; len],
            used: false,
            high_rate: rate,
            expedite: 0,
            tx_type: 1,
            key_id: 1,
            sent: false,
            verified: true,
            time: 0,
        }
    }

    #[test]
    fn oversized_transaction_is_skipped_not_fatal() {
        let sys = sys();
        let mut raw = Vec::new();
        let selection = vec![
            row(1, 50, TxRate::ApiContract),
            row(2, 10, TxRate::ApiContract),
        ];
        drain_selection(
            &mut raw,
            selection,
            &sys,
            Instant::now() + Duration::from_secs(60),
        );
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].len(), 10);
    }

    #[test]
    fn cumulative_size_stops_the_drain() {
        let sys = sys();
        let mut raw = Vec::new();
        let selection = vec![
            row(1, 40, TxRate::ApiContract),
            row(2, 40, TxRate::ApiContract),
            row(3, 40, TxRate::ApiContract),
        ];
        drain_selection(
            &mut raw,
            selection,
            &sys,
            Instant::now() + Duration::from_secs(60),
        );
        // Third transaction would cross max_block_size: drain stops.
        assert_eq!(raw.len(), 2);
    }

    #[test]
    fn stop_network_replaces_the_batch() {
        let sys = sys();
        let mut raw = vec![vec![9u8; 5]];
        let selection = vec![
            row(1, 10, TxRate::ApiContract),
            row(2, 10, TxRate::StopNetwork),
        ];
        drain_selection(
            &mut raw,
            selection,
            &sys,
            Instant::now() + Duration::from_secs(60),
        );
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].len(), 10);
    }

    #[test]
    fn count_limit_stops_the_drain() {
        let sys = sys();
        let mut raw = Vec::new();
        let selection = (0..5)
            .map(|i| row(i, 5, TxRate::ApiContract))
            .collect::<Vec<_>>();
        drain_selection(
            &mut raw,
            selection,
            &sys,
            Instant::now() + Duration::from_secs(60),
        );
        assert_eq!(raw.len(), 3);
    }
}
