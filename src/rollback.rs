use tracing::{debug, info};

use crate::errors::{ChainError, ChainResult};
use crate::storage::{Storage, StorageTx};
use crate::types::{
    parse_transaction, tx_hash_from_envelope, Block, InfoBlock, QueuedTransaction,
    GENESIS_BLOCK_ID,
};

/// Undoes the effects of the overlay tip block inside an open storage
/// transaction: every transaction is reverted in reverse order through its
/// rollback-log before-images, the block row is removed and the InfoBlock is
/// rewound to the parent. The fork resolver chains several of these (and the
/// re-applies) inside one transaction.
pub fn rollback_block_in(stx: &mut StorageTx<'_>, raw: &[u8]) -> ChainResult<()> {
    let block = Block::from_bytes(raw)?;
    let info = stx
        .info_block()?
        .ok_or_else(|| ChainError::Block("info block not found".into()))?;
    if info.block_id != block.header.block_id {
        return Err(ChainError::NotLastBlock);
    }

    for raw_tx in block.transactions.iter().rev() {
        let hash = tx_hash_from_envelope(raw_tx)?;
        restore_pool_row(stx, raw_tx, &hash)?;
        stx.delete_log_transaction(&hash);
        stx.reset_tx_status_block(&hash)?;
        rollback_transaction(stx, &hash)?;
    }

    let parent_id = block.header.block_id - 1;
    let parent = stx
        .stored_block(parent_id)?
        .ok_or_else(|| ChainError::Block(format!("parent block {parent_id} missing")))?;
    let parent_block = Block::from_bytes(&parent.data)?;
    stx.delete_block(block.header.block_id);
    stx.set_info_block(&InfoBlock::from_stored(&parent, parent_block.header.version))?;
    Ok(())
}

/// Undoes the committed effects of the current tip block and commits the
/// reversal atomically.
pub fn rollback_block(storage: &Storage, raw: &[u8]) -> ChainResult<()> {
    let mut stx = storage.begin();
    rollback_block_in(&mut stx, raw)?;
    stx.commit()?;
    debug!("block rolled back");
    Ok(())
}

/// LIFO-applies the before-images recorded for one transaction: a `None`
/// image deletes the row, anything else restores it. The consumed log rows
/// are deleted.
pub fn rollback_transaction(stx: &mut StorageTx<'_>, tx_hash: &[u8; 32]) -> ChainResult<()> {
    let entries = stx.rollback_entries_for_tx(tx_hash)?;
    for (key, entry) in entries.into_iter().rev() {
        match &entry.data {
            Some(image) => {
                let json = serde_json::from_str(image).map_err(|err| {
                    ChainError::Config(format!("corrupt rollback image: {err}"))
                })?;
                stx.put_state_row(&entry.table, &entry.row_id, &json)?;
            }
            None => stx.delete_state_row(&entry.table, &entry.row_id),
        }
        stx.delete_rollback_entry(key);
    }
    Ok(())
}

/// Returns a reverted transaction to the pool as unverified so it can be
/// re-admitted against the replacement chain.
fn restore_pool_row(
    stx: &mut StorageTx<'_>,
    raw_tx: &[u8],
    hash: &[u8; 32],
) -> ChainResult<()> {
    if let Some(mut row) = stx.queued_transaction(hash)? {
        row.used = false;
        row.verified = false;
        stx.upsert_transaction(&row)?;
        return Ok(());
    }
    if let Ok(parsed) = parse_transaction(raw_tx) {
        let mut row = QueuedTransaction::from_parsed(&parsed)?;
        row.used = false;
        row.verified = false;
        stx.upsert_transaction(&row)?;
    }
    Ok(())
}

/// Rolls the chain back until the tip is `target`. `target == 1` is the full
/// rewind, which additionally clears the derived tables.
pub fn to_block_id(storage: &Storage, target: u64) -> ChainResult<()> {
    if target < GENESIS_BLOCK_ID {
        return Err(ChainError::Config("rollback target must be at least 1".into()));
    }
    loop {
        let info = storage
            .info_block()?
            .ok_or_else(|| ChainError::Block("info block not found".into()))?;
        if info.block_id <= target {
            break;
        }
        let record = storage.block(info.block_id)?.ok_or_else(|| {
            ChainError::Block(format!("tip block {} missing", info.block_id))
        })?;
        rollback_block(storage, &record.data)?;
    }
    if target == GENESIS_BLOCK_ID {
        storage.clear_derived_tables()?;
    }
    info!(target, "rollback finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RollbackTxRow;
    use serde_json::json;

    #[test]
    fn transaction_rollback_applies_images_in_reverse() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let tx_hash = [3u8; 32];

        let mut stx = storage.begin();
        stx.put_state_row_logged(5, tx_hash, "1_keys", "9", &json!({"amount": 1}))
            .unwrap();
        stx.put_state_row_logged(5, tx_hash, "1_keys", "9", &json!({"amount": 2}))
            .unwrap();
        stx.commit().unwrap();
        assert_eq!(
            storage.state_row("1_keys", "9").unwrap(),
            Some(json!({"amount": 2}))
        );

        let mut stx = storage.begin();
        rollback_transaction(&mut stx, &tx_hash).unwrap();
        stx.commit().unwrap();

        // Both writes undone: the row did not exist before the transaction.
        assert_eq!(storage.state_row("1_keys", "9").unwrap(), None);
        let stx = storage.begin();
        assert!(stx.rollback_entries_for_tx(&tx_hash).unwrap().is_empty());
    }

    #[test]
    fn partial_rollback_restores_previous_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");

        let first_tx = [1u8; 32];
        let mut stx = storage.begin();
        stx.put_state_row_logged(5, first_tx, "1_keys", "4", &json!({"amount": 10}))
            .unwrap();
        stx.commit().unwrap();

        let second_tx = [2u8; 32];
        let mut stx = storage.begin();
        stx.put_state_row_logged(6, second_tx, "1_keys", "4", &json!({"amount": 99}))
            .unwrap();
        stx.commit().unwrap();

        let mut stx = storage.begin();
        rollback_transaction(&mut stx, &second_tx).unwrap();
        stx.commit().unwrap();
        assert_eq!(
            storage.state_row("1_keys", "4").unwrap(),
            Some(json!({"amount": 10}))
        );
    }

    #[test]
    fn rollback_block_requires_tip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let block = Block {
            header: crate::types::BlockHeader {
                block_id: 4,
                time: 1_700_000_000,
                ecosystem_id: 1,
                key_id: 1,
                node_position: 0,
                version: 1,
                sign: Vec::new(),
            },
            prev_hash: [0u8; 32],
            merkle_root: [0u8; 32],
            rollbacks_hash: [0u8; 32],
            transactions: Vec::new(),
            bin_data: Vec::new(),
        };
        let mut stx = storage.begin();
        stx.set_info_block(&InfoBlock {
            block_id: 7,
            hash: [1u8; 32],
            rollbacks_hash: [0u8; 32],
            key_id: 1,
            node_position: 0,
            time: 1_700_000_100,
            version: 1,
        })
        .unwrap();
        stx.commit().unwrap();

        let raw = block.to_bytes().unwrap();
        assert!(matches!(
            rollback_block(&storage, &raw),
            Err(ChainError::NotLastBlock)
        ));
    }

    #[test]
    fn full_rewind_clears_derived_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let mut stx = storage.begin();
        stx.put_state_row("1_keys", "1", &json!({"amount": 1})).unwrap();
        stx.append_rollback_entry(&RollbackTxRow {
            block_id: 1,
            tx_hash: [1u8; 32],
            table: "1_keys".into(),
            row_id: "1".into(),
            data: None,
        })
        .unwrap();
        stx.set_info_block(&InfoBlock {
            block_id: 1,
            hash: [1u8; 32],
            rollbacks_hash: [0u8; 32],
            key_id: 1,
            node_position: 0,
            time: 1_700_000_000,
            version: 1,
        })
        .unwrap();
        stx.commit().unwrap();

        to_block_id(&storage, 1).unwrap();
        assert_eq!(storage.state_row("1_keys", "1").unwrap(), None);
        let stx = storage.begin();
        assert!(stx.rollback_entries_for_tx(&[1u8; 32]).unwrap().is_empty());
    }
}
