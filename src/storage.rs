use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::crypto::double_hash;
use crate::errors::{ChainError, ChainResult};
use crate::types::{InfoBlock, QueuedTransaction, StoredBlock, TxRate, TxStatus};

pub const STORAGE_SCHEMA_VERSION: u32 = 1;

const CF_BLOCKS: &str = "blocks";
const CF_METADATA: &str = "metadata";
const CF_TRANSACTIONS: &str = "transactions";
const CF_LOG_TRANSACTIONS: &str = "log_transactions";
const CF_TX_STATUS: &str = "transactions_status";
const CF_ROLLBACK_TX: &str = "rollback_tx";
const CF_CONFIRMATIONS: &str = "confirmations";
const CF_SYSTEM_PARAMETERS: &str = "system_parameters";
const CF_STATE: &str = "state";
const CF_DELAYED_CONTRACTS: &str = "delayed_contracts";
const CF_CONTRACTS: &str = "contracts";

const CF_NAMES: [&str; 11] = [
    CF_BLOCKS,
    CF_METADATA,
    CF_TRANSACTIONS,
    CF_LOG_TRANSACTIONS,
    CF_TX_STATUS,
    CF_ROLLBACK_TX,
    CF_CONFIRMATIONS,
    CF_SYSTEM_PARAMETERS,
    CF_STATE,
    CF_DELAYED_CONTRACTS,
    CF_CONTRACTS,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cf {
    Blocks = 0,
    Metadata = 1,
    Transactions = 2,
    LogTransactions = 3,
    TxStatus = 4,
    RollbackTx = 5,
    Confirmations = 6,
    SystemParameters = 7,
    State = 8,
    DelayedContracts = 9,
    Contracts = 10,
}

const INFO_BLOCK_KEY: &[u8] = b"info_block";
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// One before-image of a mutated row, consumed LIFO during rollback.
/// `data == None` records that the row did not exist before the write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackTxRow {
    pub block_id: u64,
    pub tx_hash: [u8; 32],
    pub table: String,
    pub row_id: String,
    pub data: Option<String>,
}

/// Hash committed to by a block header over its rollback-log entries, in
/// append order.
pub fn rollback_entries_hash(entries: &[RollbackTxRow]) -> [u8; 32] {
    let mut concat = Vec::new();
    for entry in entries {
        concat.extend_from_slice(&bincode::serialize(entry).expect("serializing rollback row"));
    }
    double_hash(&concat)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Confirmation {
    pub block_id: u64,
    pub good: i32,
    pub bad: i32,
    pub time: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelayedContract {
    pub id: u64,
    pub contract: String,
    pub key_id: i64,
    pub block_id: u64,
    pub every_block: u64,
    pub counter: u64,
    pub high_rate: TxRate,
    pub deleted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractSource {
    pub name: String,
    pub ecosystem_id: i64,
    pub source: String,
}

pub struct Storage {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl Storage {
    pub fn open(path: &Path) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, descriptors)?;
        let storage = Self { db: Arc::new(db) };
        storage.ensure_schema()?;
        Ok(storage)
    }

    fn cf(&self, cf: Cf) -> ChainResult<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(CF_NAMES[cf as usize])
            .ok_or_else(|| ChainError::Config(format!("missing column family {:?}", cf)))
    }

    fn ensure_schema(&self) -> ChainResult<()> {
        let cf = self.cf(Cf::Metadata)?;
        match self.db.get_cf(&cf, SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let found: u32 = bincode::deserialize(&bytes)?;
                if found != STORAGE_SCHEMA_VERSION {
                    return Err(ChainError::Config(format!(
                        "unsupported storage schema {found}, requires {STORAGE_SCHEMA_VERSION}"
                    )));
                }
            }
            None => {
                self.db
                    .put_cf(&cf, SCHEMA_VERSION_KEY, bincode::serialize(&STORAGE_SCHEMA_VERSION)?)?;
            }
        }
        Ok(())
    }

    pub fn begin(&self) -> StorageTx<'_> {
        StorageTx {
            storage: self,
            layers: vec![HashMap::new()],
        }
    }

    pub(crate) fn get_raw(&self, cf: Cf, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let handle = self.cf(cf)?;
        Ok(self.db.get_cf(&handle, key)?)
    }

    pub(crate) fn put_raw(&self, cf: Cf, key: &[u8], value: &[u8]) -> ChainResult<()> {
        let handle = self.cf(cf)?;
        self.db.put_cf(&handle, key, value)?;
        Ok(())
    }

    pub(crate) fn scan_prefix(&self, cf: Cf, prefix: &[u8]) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let mode = IteratorMode::From(prefix, Direction::Forward);
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&handle, mode) {
            let (key, value) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }

    // --- blocks ---

    pub fn block(&self, id: u64) -> ChainResult<Option<StoredBlock>> {
        match self.get_raw(Cf::Blocks, &id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn max_block_id(&self) -> ChainResult<Option<u64>> {
        let handle = self.cf(Cf::Blocks)?;
        let mut iter = self.db.iterator_cf(&handle, IteratorMode::End);
        match iter.next().transpose()? {
            Some((key, _)) => {
                let raw: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| ChainError::Config("invalid block key encoding".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    /// Blocks with `id >= start`, ascending, up to `limit` (0 = unbounded).
    pub fn blocks_from(&self, start: u64, limit: usize) -> ChainResult<Vec<StoredBlock>> {
        let handle = self.cf(Cf::Blocks)?;
        let start_key = start.to_be_bytes();
        let mode = IteratorMode::From(&start_key, Direction::Forward);
        let mut records = Vec::new();
        for entry in self.db.iterator_cf(&handle, mode) {
            let (_, value) = entry?;
            records.push(bincode::deserialize::<StoredBlock>(&value)?);
            if limit > 0 && records.len() >= limit {
                break;
            }
        }
        Ok(records)
    }

    /// Blocks with `id <= start`, descending, up to `limit` (0 = unbounded).
    pub fn blocks_desc_from(&self, start: u64, limit: usize) -> ChainResult<Vec<StoredBlock>> {
        let handle = self.cf(Cf::Blocks)?;
        let start_key = start.to_be_bytes();
        let mode = IteratorMode::From(&start_key, Direction::Reverse);
        let mut records = Vec::new();
        for entry in self.db.iterator_cf(&handle, mode) {
            let (_, value) = entry?;
            records.push(bincode::deserialize::<StoredBlock>(&value)?);
            if limit > 0 && records.len() >= limit {
                break;
            }
        }
        Ok(records)
    }

    /// Whether a block produced by `node_position` exists with time inside
    /// `[from, to)`. Used to prevent double production within one slot.
    pub fn block_in_time_range(
        &self,
        from: i64,
        to: i64,
        node_position: u16,
    ) -> ChainResult<bool> {
        let Some(max) = self.max_block_id()? else {
            return Ok(false);
        };
        for record in self.blocks_desc_from(max, 0)? {
            if record.time < from {
                break;
            }
            if record.time < to && record.node_position == node_position {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn info_block(&self) -> ChainResult<Option<InfoBlock>> {
        match self.get_raw(Cf::Metadata, INFO_BLOCK_KEY)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // --- transaction pool ---

    pub fn queued_transaction(&self, hash: &[u8; 32]) -> ChainResult<Option<QueuedTransaction>> {
        match self.get_raw(Cf::Transactions, hash)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn all_queued_transactions(&self) -> ChainResult<Vec<QueuedTransaction>> {
        let handle = self.cf(Cf::Transactions)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&handle, IteratorMode::Start) {
            let (_, value) = entry?;
            rows.push(bincode::deserialize::<QueuedTransaction>(&value)?);
        }
        Ok(rows)
    }

    pub fn log_transaction_block(&self, hash: &[u8; 32]) -> ChainResult<Option<u64>> {
        match self.get_raw(Cf::LogTransactions, hash)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn tx_status(&self, hash: &[u8; 32]) -> ChainResult<Option<TxStatus>> {
        match self.get_raw(Cf::TxStatus, hash)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // --- confirmations ---

    pub fn confirmation(&self, block_id: u64) -> ChainResult<Option<Confirmation>> {
        match self.get_raw(Cf::Confirmations, &block_id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn save_confirmation(&self, confirmation: &Confirmation) -> ChainResult<()> {
        self.put_raw(
            Cf::Confirmations,
            &confirmation.block_id.to_be_bytes(),
            &bincode::serialize(confirmation)?,
        )
    }

    /// Highest block whose recorded `good` count reached the quorum.
    pub fn last_confirmed_block(&self, quorum: i32) -> ChainResult<Option<Confirmation>> {
        let handle = self.cf(Cf::Confirmations)?;
        for entry in self.db.iterator_cf(&handle, IteratorMode::End) {
            let (_, value) = entry?;
            let confirmation: Confirmation = bincode::deserialize(&value)?;
            if confirmation.good >= quorum {
                return Ok(Some(confirmation));
            }
        }
        Ok(None)
    }

    // --- system parameters, contracts, delayed contracts, state rows ---

    pub fn system_parameter(&self, name: &str) -> ChainResult<Option<String>> {
        match self.get_raw(Cf::SystemParameters, name.as_bytes())? {
            Some(value) => Ok(Some(String::from_utf8(value).map_err(|err| {
                ChainError::Config(format!("invalid parameter encoding: {err}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn set_system_parameter(&self, name: &str, value: &str) -> ChainResult<()> {
        self.put_raw(Cf::SystemParameters, name.as_bytes(), value.as_bytes())
    }

    pub fn contract_sources(&self) -> ChainResult<Vec<ContractSource>> {
        let handle = self.cf(Cf::Contracts)?;
        let mut sources = Vec::new();
        for entry in self.db.iterator_cf(&handle, IteratorMode::Start) {
            let (_, value) = entry?;
            sources.push(bincode::deserialize::<ContractSource>(&value)?);
        }
        Ok(sources)
    }

    pub fn save_contract_source(&self, source: &ContractSource) -> ChainResult<()> {
        let key = format!("{}:{}", source.ecosystem_id, source.name);
        self.put_raw(Cf::Contracts, key.as_bytes(), &bincode::serialize(source)?)
    }

    pub fn delayed_contracts_for_block(&self, block_id: u64) -> ChainResult<Vec<DelayedContract>> {
        let handle = self.cf(Cf::DelayedContracts)?;
        let mut rows = Vec::new();
        for entry in self.db.iterator_cf(&handle, IteratorMode::Start) {
            let (_, value) = entry?;
            let row: DelayedContract = bincode::deserialize(&value)?;
            if !row.deleted && row.block_id <= block_id {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| b.high_rate.cmp(&a.high_rate).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    pub fn save_delayed_contract(&self, row: &DelayedContract) -> ChainResult<()> {
        self.put_raw(
            Cf::DelayedContracts,
            &row.id.to_be_bytes(),
            &bincode::serialize(row)?,
        )
    }

    pub fn delayed_contract_exists(&self, id: u64) -> ChainResult<bool> {
        Ok(self.get_raw(Cf::DelayedContracts, &id.to_be_bytes())?.is_some())
    }

    pub fn state_row(&self, table: &str, row_id: &str) -> ChainResult<Option<Json>> {
        match self.get_raw(Cf::State, state_key(table, row_id).as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value).map_err(|err| {
                ChainError::Config(format!("corrupt state row: {err}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Drops every row of the derived tables. Only the full rewind
    /// (`rollback --block-id 1`) uses this.
    pub fn clear_derived_tables(&self) -> ChainResult<()> {
        for cf in [
            Cf::State,
            Cf::RollbackTx,
            Cf::LogTransactions,
            Cf::TxStatus,
            Cf::Confirmations,
        ] {
            let handle = self.cf(cf)?;
            let keys: Vec<Vec<u8>> = self
                .db
                .iterator_cf(&handle, IteratorMode::Start)
                .map(|entry| entry.map(|(key, _)| key.to_vec()))
                .collect::<Result<_, _>>()?;
            for key in keys {
                self.db.delete_cf(&handle, key)?;
            }
        }
        Ok(())
    }
}

fn state_key(table: &str, row_id: &str) -> String {
    format!("{table}:{row_id}")
}

fn rollback_key(tx_hash: &[u8; 32], seq: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(tx_hash);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

type Layer = HashMap<(usize, Vec<u8>), Option<Vec<u8>>>;

/// Marker for a savepoint inside a [`StorageTx`]; passed back to release or
/// roll back to that point.
#[derive(Clone, Copy, Debug)]
pub struct Savepoint(usize);

/// Buffered write transaction over the store. Writes land in overlay layers;
/// `savepoint` opens a new layer, `rollback_savepoint` discards it, and
/// `commit` flushes everything in one atomic batch. Reads see the overlay
/// newest-first, then the database.
pub struct StorageTx<'a> {
    storage: &'a Storage,
    layers: Vec<Layer>,
}

impl<'a> StorageTx<'a> {
    pub fn savepoint(&mut self) -> Savepoint {
        self.layers.push(HashMap::new());
        Savepoint(self.layers.len() - 1)
    }

    pub fn rollback_savepoint(&mut self, savepoint: Savepoint) {
        self.layers.truncate(savepoint.0);
        if self.layers.is_empty() {
            self.layers.push(HashMap::new());
        }
    }

    pub fn release_savepoint(&mut self, savepoint: Savepoint) {
        if savepoint.0 == 0 || savepoint.0 >= self.layers.len() {
            return;
        }
        let merged: Vec<Layer> = self.layers.split_off(savepoint.0);
        let target = self.layers.last_mut().expect("base overlay layer");
        for layer in merged {
            target.extend(layer);
        }
    }

    pub fn commit(self) -> ChainResult<()> {
        let mut batch = WriteBatch::default();
        let mut merged: Layer = HashMap::new();
        for layer in self.layers {
            merged.extend(layer);
        }
        for ((cf_idx, key), value) in merged {
            let handle = self
                .storage
                .db
                .cf_handle(CF_NAMES[cf_idx])
                .ok_or_else(|| {
                    ChainError::Config(format!("missing column family {}", CF_NAMES[cf_idx]))
                })?;
            match value {
                Some(value) => batch.put_cf(&handle, key, value),
                None => batch.delete_cf(&handle, key),
            }
        }
        self.storage.db.write(batch)?;
        Ok(())
    }

    fn get(&self, cf: Cf, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        let lookup = (cf as usize, key.to_vec());
        for layer in self.layers.iter().rev() {
            if let Some(value) = layer.get(&lookup) {
                return Ok(value.clone());
            }
        }
        self.storage.get_raw(cf, key)
    }

    fn put(&mut self, cf: Cf, key: Vec<u8>, value: Vec<u8>) {
        self.layers
            .last_mut()
            .expect("base overlay layer")
            .insert((cf as usize, key), Some(value));
    }

    fn delete(&mut self, cf: Cf, key: Vec<u8>) {
        self.layers
            .last_mut()
            .expect("base overlay layer")
            .insert((cf as usize, key), None);
    }

    /// Prefix scan merging database rows with overlay edits.
    fn scan_prefix(&self, cf: Cf, prefix: &[u8]) -> ChainResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: std::collections::BTreeMap<Vec<u8>, Option<Vec<u8>>> =
            std::collections::BTreeMap::new();
        for (key, value) in self.storage.scan_prefix(cf, prefix)? {
            merged.insert(key, Some(value));
        }
        for layer in &self.layers {
            for ((cf_idx, key), value) in layer {
                if *cf_idx == cf as usize && key.starts_with(prefix) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }

    // --- blocks / info block ---

    pub fn insert_block(&mut self, record: &StoredBlock) -> ChainResult<()> {
        self.put(
            Cf::Blocks,
            record.id.to_be_bytes().to_vec(),
            bincode::serialize(record)?,
        );
        Ok(())
    }

    pub fn stored_block(&self, id: u64) -> ChainResult<Option<StoredBlock>> {
        match self.get(Cf::Blocks, &id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_block(&mut self, id: u64) {
        self.delete(Cf::Blocks, id.to_be_bytes().to_vec());
    }

    pub fn set_info_block(&mut self, info: &InfoBlock) -> ChainResult<()> {
        self.put(
            Cf::Metadata,
            INFO_BLOCK_KEY.to_vec(),
            bincode::serialize(info)?,
        );
        Ok(())
    }

    pub fn info_block(&self) -> ChainResult<Option<InfoBlock>> {
        match self.get(Cf::Metadata, INFO_BLOCK_KEY)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // --- transaction pool ---

    pub fn upsert_transaction(&mut self, row: &QueuedTransaction) -> ChainResult<()> {
        self.put(
            Cf::Transactions,
            row.hash.to_vec(),
            bincode::serialize(row)?,
        );
        Ok(())
    }

    pub fn queued_transaction(&self, hash: &[u8; 32]) -> ChainResult<Option<QueuedTransaction>> {
        match self.get(Cf::Transactions, hash)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn delete_transaction(&mut self, hash: &[u8; 32]) {
        self.delete(Cf::Transactions, hash.to_vec());
    }

    pub fn mark_transaction_used(&mut self, hash: &[u8; 32]) -> ChainResult<()> {
        if let Some(mut row) = self.queued_transaction(hash)? {
            row.used = true;
            self.upsert_transaction(&row)?;
        }
        Ok(())
    }

    pub fn mark_transaction_unused_unverified(&mut self, hash: &[u8; 32]) -> ChainResult<()> {
        if let Some(mut row) = self.queued_transaction(hash)? {
            row.used = false;
            row.verified = false;
            self.upsert_transaction(&row)?;
        }
        Ok(())
    }

    // --- log transactions / status ---

    pub fn insert_log_transaction(&mut self, hash: &[u8; 32], block_id: u64) -> ChainResult<()> {
        self.put(
            Cf::LogTransactions,
            hash.to_vec(),
            bincode::serialize(&block_id)?,
        );
        Ok(())
    }

    pub fn delete_log_transaction(&mut self, hash: &[u8; 32]) {
        self.delete(Cf::LogTransactions, hash.to_vec());
    }

    pub fn log_transaction_block(&self, hash: &[u8; 32]) -> ChainResult<Option<u64>> {
        match self.get(Cf::LogTransactions, hash)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn set_tx_status(&mut self, hash: &[u8; 32], status: &TxStatus) -> ChainResult<()> {
        self.put(Cf::TxStatus, hash.to_vec(), bincode::serialize(status)?);
        Ok(())
    }

    pub fn tx_status(&self, hash: &[u8; 32]) -> ChainResult<Option<TxStatus>> {
        match self.get(Cf::TxStatus, hash)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn reset_tx_status_block(&mut self, hash: &[u8; 32]) -> ChainResult<()> {
        if let Some(mut status) = self.tx_status(hash)? {
            status.block_id = 0;
            self.set_tx_status(hash, &status)?;
        }
        Ok(())
    }

    // --- rollback log ---

    pub fn append_rollback_entry(&mut self, entry: &RollbackTxRow) -> ChainResult<()> {
        let existing = self.scan_prefix(Cf::RollbackTx, &entry.tx_hash[..])?;
        let key = rollback_key(&entry.tx_hash, existing.len() as u32);
        self.put(Cf::RollbackTx, key, bincode::serialize(entry)?);
        Ok(())
    }

    /// All entries for a transaction in append order.
    pub fn rollback_entries_for_tx(
        &self,
        tx_hash: &[u8; 32],
    ) -> ChainResult<Vec<(Vec<u8>, RollbackTxRow)>> {
        self.scan_prefix(Cf::RollbackTx, &tx_hash[..])?
            .into_iter()
            .map(|(key, value)| Ok((key, bincode::deserialize::<RollbackTxRow>(&value)?)))
            .collect()
    }

    pub fn delete_rollback_entry(&mut self, key: Vec<u8>) {
        self.delete(Cf::RollbackTx, key);
    }

    // --- contract state rows ---

    pub fn state_row(&self, table: &str, row_id: &str) -> ChainResult<Option<Json>> {
        match self.get(Cf::State, state_key(table, row_id).as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value).map_err(|err| {
                ChainError::Config(format!("corrupt state row: {err}"))
            })?)),
            None => Ok(None),
        }
    }

    pub fn put_state_row(&mut self, table: &str, row_id: &str, value: &Json) -> ChainResult<()> {
        let encoded = serde_json::to_vec(value)
            .map_err(|err| ChainError::Config(format!("unencodable state row: {err}")))?;
        self.put(Cf::State, state_key(table, row_id).into_bytes(), encoded);
        Ok(())
    }

    pub fn delete_state_row(&mut self, table: &str, row_id: &str) {
        self.delete(Cf::State, state_key(table, row_id).into_bytes());
    }

    /// Writes a row while appending its before-image to the rollback log, so
    /// the write can be undone by [`RollbackTxRow`] replay.
    pub fn put_state_row_logged(
        &mut self,
        block_id: u64,
        tx_hash: [u8; 32],
        table: &str,
        row_id: &str,
        value: &Json,
    ) -> ChainResult<RollbackTxRow> {
        let before = self.state_row(table, row_id)?;
        let entry = RollbackTxRow {
            block_id,
            tx_hash,
            table: table.to_string(),
            row_id: row_id.to_string(),
            data: before.map(|json| json.to_string()),
        };
        self.append_rollback_entry(&entry)?;
        self.put_state_row(table, row_id, value)?;
        Ok(entry)
    }

    // --- delayed contracts ---

    pub fn delayed_contract(&self, id: u64) -> ChainResult<Option<DelayedContract>> {
        match self.get(Cf::DelayedContracts, &id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn save_delayed_contract(&mut self, row: &DelayedContract) -> ChainResult<()> {
        self.put(
            Cf::DelayedContracts,
            row.id.to_be_bytes().to_vec(),
            bincode::serialize(row)?,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        (dir, storage)
    }

    #[test]
    fn savepoint_rollback_discards_writes() {
        let (_dir, storage) = open_storage();
        let mut tx = storage.begin();
        tx.put_state_row("1_keys", "10", &json!({"amount": 5})).unwrap();
        let sp = tx.savepoint();
        tx.put_state_row("1_keys", "10", &json!({"amount": 9})).unwrap();
        tx.put_state_row("1_keys", "11", &json!({"amount": 1})).unwrap();
        tx.rollback_savepoint(sp);
        assert_eq!(
            tx.state_row("1_keys", "10").unwrap(),
            Some(json!({"amount": 5}))
        );
        assert_eq!(tx.state_row("1_keys", "11").unwrap(), None);
        tx.commit().unwrap();
        assert_eq!(
            storage.state_row("1_keys", "10").unwrap(),
            Some(json!({"amount": 5}))
        );
        assert_eq!(storage.state_row("1_keys", "11").unwrap(), None);
    }

    #[test]
    fn released_savepoint_keeps_writes() {
        let (_dir, storage) = open_storage();
        let mut tx = storage.begin();
        let sp = tx.savepoint();
        tx.put_state_row("1_keys", "7", &json!({"amount": 2})).unwrap();
        tx.release_savepoint(sp);
        tx.commit().unwrap();
        assert_eq!(
            storage.state_row("1_keys", "7").unwrap(),
            Some(json!({"amount": 2}))
        );
    }

    #[test]
    fn logged_write_records_before_image() {
        let (_dir, storage) = open_storage();
        let tx_hash = [7u8; 32];
        let mut tx = storage.begin();
        tx.put_state_row_logged(3, tx_hash, "1_keys", "42", &json!({"amount": 1}))
            .unwrap();
        tx.put_state_row_logged(3, tx_hash, "1_keys", "42", &json!({"amount": 2}))
            .unwrap();
        let entries = tx.rollback_entries_for_tx(&tx_hash).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.data, None);
        assert_eq!(
            entries[1].1.data.as_deref(),
            Some(json!({"amount": 1}).to_string().as_str())
        );
        tx.commit().unwrap();

        let tx2 = storage.begin();
        assert_eq!(tx2.rollback_entries_for_tx(&tx_hash).unwrap().len(), 2);
    }

    #[test]
    fn rollback_entries_hash_depends_on_order() {
        let a = RollbackTxRow {
            block_id: 1,
            tx_hash: [1u8; 32],
            table: "1_keys".into(),
            row_id: "1".into(),
            data: None,
        };
        let b = RollbackTxRow {
            block_id: 1,
            tx_hash: [1u8; 32],
            table: "1_keys".into(),
            row_id: "2".into(),
            data: Some("{}".into()),
        };
        assert_ne!(
            rollback_entries_hash(&[a.clone(), b.clone()]),
            rollback_entries_hash(&[b, a])
        );
    }

    #[test]
    fn max_block_and_range_queries() {
        let (_dir, storage) = open_storage();
        let mut tx = storage.begin();
        for id in 1..=4u64 {
            let record = StoredBlock {
                id,
                hash: [id as u8; 32],
                rollbacks_hash: [0u8; 32],
                data: Vec::new(),
                ecosystem_id: 1,
                key_id: 5,
                node_position: (id % 2) as u16,
                time: 1_000 + id as i64 * 10,
                tx_count: 0,
            };
            tx.insert_block(&record).unwrap();
        }
        tx.commit().unwrap();

        assert_eq!(storage.max_block_id().unwrap(), Some(4));
        assert!(storage.block_in_time_range(1_035, 1_045, 0).unwrap());
        assert!(!storage.block_in_time_range(1_035, 1_045, 1).unwrap());
        let desc = storage.blocks_desc_from(3, 2).unwrap();
        assert_eq!(desc.iter().map(|b| b.id).collect::<Vec<_>>(), vec![3, 2]);
    }
}
