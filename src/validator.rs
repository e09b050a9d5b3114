use tracing::{debug, warn};

use crate::bans::BadKeys;
use crate::config::SysParams;
use crate::errors::{ChainError, ChainResult};
use crate::scheduler::BlockTimeCounter;
use crate::storage::{rollback_entries_hash, RollbackTxRow, Storage, StorageTx};
use crate::types::{
    merkle_root, parse_transaction, Block, InfoBlock, StoredBlock, TxRate, TxStatus,
    GENESIS_BLOCK_ID,
};
use crate::vm::{execute_contract, SmartCtx, SmartVM, VM};

/// How transaction failures are treated while replaying a batch: the
/// producer drops bad transactions and keeps going, a validator rejects the
/// whole block on anything fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlayMode {
    Produce,
    Validate,
}

#[derive(Clone, Debug)]
pub struct PlayedTx {
    pub hash: [u8; 32],
    pub raw: Vec<u8>,
    pub key_id: i64,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct PlayResult {
    pub included: Vec<PlayedTx>,
    pub dropped: Vec<([u8; 32], i64, String)>,
    pub rollback_entries: Vec<RollbackTxRow>,
    pub merkle_root: [u8; 32],
    pub rollbacks_hash: [u8; 32],
}

/// Header-level checks against the parent: linkage, monotonic id and time,
/// schedule position and producer signature.
pub fn check_block(block: &Block, prev: &InfoBlock, sys: &SysParams) -> ChainResult<()> {
    let header = &block.header;
    if header.block_id != prev.block_id + 1 {
        return Err(ChainError::with_ban(ChainError::Block(format!(
            "block id {} does not follow {}",
            header.block_id, prev.block_id
        ))));
    }
    if block.prev_hash != prev.hash {
        return Err(ChainError::Block("previous hash mismatch".into()));
    }
    if header.time <= prev.time {
        return Err(ChainError::with_ban(ChainError::Block(format!(
            "block time {} is not after {}",
            header.time, prev.time
        ))));
    }
    if block.transactions.len() > sys.max_tx_count {
        return Err(ChainError::with_ban(ChainError::Block(
            "too many transactions".into(),
        )));
    }
    if block.size() > sys.max_block_size {
        return Err(ChainError::with_ban(ChainError::Block(
            "block exceeds size limit".into(),
        )));
    }
    if !sys.honor_nodes.is_empty() {
        let counter = BlockTimeCounter::from_params(sys);
        let expected = counter.node_position(header.time);
        if expected != header.node_position {
            return Err(ChainError::with_ban(ChainError::Block(format!(
                "node position {} does not own the slot of {} (expected {})",
                header.node_position, header.time, expected
            ))));
        }
        let node = sys.node_by_position(header.node_position)?;
        block
            .verify_signature(&node.public_key)
            .map_err(ChainError::with_ban)?;
    }
    Ok(())
}

/// Replays a batch of raw transactions in order under per-transaction
/// savepoints, collecting rollback-log entries and computing the hashes the
/// header commits to.
#[allow(clippy::too_many_arguments)]
pub fn play_transactions(
    stx: &mut StorageTx<'_>,
    vm: &VM,
    block_id: u64,
    block_time: i64,
    txs: &[Vec<u8>],
    sys: &SysParams,
    bad_keys: &BadKeys,
    mode: PlayMode,
) -> ChainResult<PlayResult> {
    let mut included: Vec<PlayedTx> = Vec::with_capacity(txs.len());
    let mut dropped: Vec<([u8; 32], i64, String)> = Vec::new();
    let mut entries: Vec<RollbackTxRow> = Vec::new();

    for (position, raw) in txs.iter().enumerate() {
        let savepoint = stx.savepoint();

        let fatal = |err: ChainError| -> ChainError { ChainError::with_ban(err) };
        let parsed = match parse_transaction(raw) {
            Ok(parsed) => parsed,
            Err(err) => match mode {
                PlayMode::Produce => {
                    stx.rollback_savepoint(savepoint);
                    warn!(?err, "dropping malformed transaction");
                    continue;
                }
                PlayMode::Validate => return Err(fatal(err)),
            },
        };
        let key_id = parsed.body.header.key_id;
        let mut reject = |stx: &mut StorageTx<'_>, reason: String| -> ChainResult<()> {
            stx.rollback_savepoint(savepoint);
            match mode {
                PlayMode::Produce => {
                    dropped.push((parsed.hash, key_id, reason));
                    Ok(())
                }
                PlayMode::Validate => Err(fatal(ChainError::Transaction(reason))),
            }
        };

        if let Err(err) = parsed.verify_signature() {
            reject(stx, err.to_string())?;
            continue;
        }
        if key_id == 0 {
            reject(stx, ChainError::EmptyKey.to_string())?;
            continue;
        }
        if bad_keys.is_banned(key_id) {
            reject(stx, format!("key {key_id} is banned"))?;
            continue;
        }
        if stx.log_transaction_block(&parsed.hash)?.is_some() {
            reject(stx, ChainError::DuplicatedTransaction.to_string())?;
            continue;
        }
        if parsed.is_stop_network() && (position != 0 || txs.len() != 1) {
            // StopNetwork is exclusive: anywhere but alone invalidates the
            // batch for a validator and is dropped by a producer.
            reject(stx, "stop-network transaction is not alone".into())?;
            continue;
        }

        let mut tx_error: Option<String> = None;
        if parsed.rate() != TxRate::StopNetwork {
            let executed = {
                let mut ctx = SmartCtx::new(
                    stx,
                    block_id,
                    parsed.hash,
                    key_id,
                    parsed.body.header.ecosystem_id,
                    block_time,
                    sys.max_fuel,
                );
                execute_contract(
                    vm,
                    parsed.body.header.ecosystem_id,
                    &parsed.body.contract,
                    &parsed.body.params,
                    &mut ctx,
                )
                .map(|()| std::mem::take(&mut ctx.rollback_entries))
            };
            match executed {
                Ok(produced) => entries.extend(produced),
                Err(err) => {
                    // Execution failure is a recorded outcome: the savepoint
                    // undoes its writes, the transaction stays in the block.
                    stx.rollback_savepoint(savepoint);
                    bad_keys.bad_tx(key_id);
                    tx_error = Some(err.to_string());
                }
            }
        }

        if tx_error.is_none() {
            stx.release_savepoint(savepoint);
        }
        stx.insert_log_transaction(&parsed.hash, block_id)?;
        stx.mark_transaction_used(&parsed.hash)?;
        stx.set_tx_status(
            &parsed.hash,
            &TxStatus {
                time: block_time,
                key_id,
                block_id,
                error: tx_error.clone().unwrap_or_default(),
            },
        )?;
        if let Some(ref reason) = tx_error {
            debug!(hash = %hex::encode(parsed.hash), reason, "transaction failed in block");
        }
        included.push(PlayedTx {
            hash: parsed.hash,
            raw: raw.clone(),
            key_id,
            error: tx_error,
        });
    }

    let hashes: Vec<[u8; 32]> = included.iter().map(|tx| tx.hash).collect();
    Ok(PlayResult {
        merkle_root: merkle_root(&hashes),
        rollbacks_hash: rollback_entries_hash(&entries),
        included,
        dropped,
        rollback_entries: entries,
    })
}

/// Verifies and applies one block inside an open storage transaction: header
/// checks against the overlay tip, savepointed replay, committed-hash
/// comparison, block row and InfoBlock update. Nothing is committed here, so
/// the fork resolver can chain several applies inside one transaction.
pub fn apply_block_in(
    stx: &mut StorageTx<'_>,
    vm: &VM,
    bad_keys: &BadKeys,
    sys: &SysParams,
    block: &Block,
) -> ChainResult<()> {
    let info = stx.info_block()?;
    match (&info, block.header.block_id) {
        (None, GENESIS_BLOCK_ID) => {}
        (None, other) => {
            return Err(ChainError::Block(format!(
                "cannot apply block {other} to an empty chain"
            )));
        }
        (Some(info), _) => check_block(block, info, sys)?,
    }

    let play = play_transactions(
        stx,
        vm,
        block.header.block_id,
        block.header.time,
        &block.transactions,
        sys,
        bad_keys,
        PlayMode::Validate,
    )?;

    if play.merkle_root != block.merkle_root {
        return Err(ChainError::with_ban(ChainError::Block(
            "merkle root mismatch".into(),
        )));
    }
    if play.rollbacks_hash != block.rollbacks_hash {
        return Err(ChainError::IncorrectRollbackHash);
    }

    stx.insert_block(&StoredBlock::from_block(block)?)?;
    stx.set_info_block(&InfoBlock::from_block(block))?;
    Ok(())
}

/// Verifies and applies one foreign block on top of the current tip,
/// committing the block row, the replayed state, the rollback log and the
/// InfoBlock update atomically.
pub fn apply_block(
    storage: &Storage,
    smart_vm: &SmartVM,
    bad_keys: &BadKeys,
    sys: &SysParams,
    block: &Block,
) -> ChainResult<()> {
    let mut stx = storage.begin();
    let vm = smart_vm.read();
    apply_block_in(&mut stx, &vm, bad_keys, sys, block)?;
    drop(vm);
    stx.commit()?;
    debug!(
        block_id = block.header.block_id,
        hash = %hex::encode(block.hash()),
        "block applied"
    );
    Ok(())
}

/// Parses a raw foreign block and checks it extends the tip. An empty chain
/// accepts only block 1.
pub fn parse_foreign_block(storage: &Storage, raw: &[u8]) -> ChainResult<Block> {
    let block = Block::from_bytes(raw).map_err(ChainError::with_ban)?;
    let expected = storage
        .info_block()?
        .map(|info| info.block_id + 1)
        .unwrap_or(GENESIS_BLOCK_ID);
    if block.header.block_id != expected {
        return Err(ChainError::Block(format!(
            "expected block {}, got {}",
            expected, block.header.block_id
        )));
    }
    Ok(block)
}

/// Recomputes a stored block's identity hash from its serialized body; used
/// when reconstructing the chain during fork resolution.
pub fn stored_block_hash(record: &StoredBlock) -> ChainResult<[u8; 32]> {
    let block = Block::from_bytes(&record.data)?;
    Ok(block.hash())
}
