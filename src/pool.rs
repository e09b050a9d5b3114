use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::bans::BadKeys;
use crate::config::SysParams;
use crate::errors::{ChainError, ChainResult};
use crate::scheduler::now_unix;
use crate::storage::Storage;
use crate::types::{
    parse_transaction, QueuedTransaction, TxStatus, MAX_TX_BACK_SECONDS, MAX_TX_FORWARD_SECONDS,
};

/// Admission, prioritisation and status tracking for not-yet-committed
/// transactions. Rows live in the `transactions` table so the pool survives
/// restarts and participates in block rollbacks.
pub struct TxPool {
    storage: Storage,
    bad_keys: Arc<BadKeys>,
    sys: Arc<RwLock<SysParams>>,
}

impl TxPool {
    pub fn new(storage: Storage, bad_keys: Arc<BadKeys>, sys: Arc<RwLock<SysParams>>) -> Self {
        Self {
            storage,
            bad_keys,
            sys,
        }
    }

    /// Validates and enqueues a wire transaction. The returned hash is the
    /// canonical identity of the queued row.
    pub fn submit(&self, raw: &[u8]) -> ChainResult<[u8; 32]> {
        let parsed = parse_transaction(raw)?;
        parsed.verify_signature()?;

        let key_id = parsed.body.header.key_id;
        if key_id == 0 {
            return Err(ChainError::with_ban(ChainError::EmptyKey));
        }
        if self.bad_keys.is_banned(key_id) {
            return Err(ChainError::KeyBanned {
                key_id,
                until: self.bad_keys.banned_until(key_id),
            });
        }
        {
            let sys = self.sys.read();
            if sys.network_id != parsed.body.header.network_id {
                return Err(ChainError::Transaction("wrong network id".into()));
            }
        }

        let now = now_unix();
        let tx_time = parsed.body.header.time;
        if tx_time > now + MAX_TX_FORWARD_SECONDS {
            return Err(ChainError::with_ban(ChainError::EarlyTransactionTime));
        }
        if tx_time < now - MAX_TX_BACK_SECONDS {
            return Err(ChainError::ExpiredTransactionTime);
        }

        self.check_duplicate(&parsed.hash)?;

        let row = QueuedTransaction::from_parsed(&parsed)?;
        let mut tx = self.storage.begin();
        tx.upsert_transaction(&row)?;
        tx.commit()?;
        debug!(hash = %hex::encode(parsed.hash), "transaction queued");
        Ok(parsed.hash)
    }

    /// A hash may live in the pool or in the committed log, never both.
    fn check_duplicate(&self, hash: &[u8; 32]) -> ChainResult<()> {
        if self.storage.log_transaction_block(hash)?.is_some() {
            return Err(ChainError::DuplicatedTransaction);
        }
        if let Some(existing) = self.storage.queued_transaction(hash)? {
            if existing.verified {
                return Err(ChainError::DuplicatedTransaction);
            }
        }
        Ok(())
    }

    /// Up to `limit` unused transactions in selection order: rate class
    /// first, then expedite, then age. A `StopNetwork` transaction preempts
    /// everything and is returned alone.
    pub fn select_for_block(&self, limit: usize) -> ChainResult<Vec<QueuedTransaction>> {
        let mut rows: Vec<QueuedTransaction> = self
            .storage
            .all_queued_transactions()?
            .into_iter()
            .filter(|row| !row.used && row.verified)
            .collect();
        rows.sort_by(|a, b| {
            b.high_rate
                .cmp(&a.high_rate)
                .then(b.expedite.cmp(&a.expedite))
                .then(a.time.cmp(&b.time))
        });
        if let Some(stop) = rows.iter().find(|row| row.is_stop_network()) {
            return Ok(vec![stop.clone()]);
        }
        if limit > 0 {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    /// Removes a failed transaction from the queue, records the reason, and
    /// debits the author's ban credit.
    pub fn mark_bad(&self, hash: &[u8; 32], key_id: i64, reason: &str) -> ChainResult<()> {
        self.bad_keys.bad_tx(key_id);
        let mut reason = reason.to_string();
        if reason.len() > 255 {
            reason.truncate(255);
            reason.push_str("...");
        }
        warn!(hash = %hex::encode(hash), key_id, reason, "transaction marked bad");
        let mut tx = self.storage.begin();
        tx.set_tx_status(
            hash,
            &TxStatus {
                time: now_unix(),
                key_id,
                block_id: 0,
                error: reason,
            },
        )?;
        tx.delete_transaction(hash);
        tx.commit()?;
        Ok(())
    }

    pub fn mark_sent(&self, hashes: &[[u8; 32]]) -> ChainResult<()> {
        let mut tx = self.storage.begin();
        for hash in hashes {
            if let Some(mut row) = tx.queued_transaction(hash)? {
                row.sent = true;
                tx.upsert_transaction(&row)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn unsent_transactions(&self) -> ChainResult<Vec<QueuedTransaction>> {
        let mut rows: Vec<QueuedTransaction> = self
            .storage
            .all_queued_transactions()?
            .into_iter()
            .filter(|row| !row.sent)
            .collect();
        rows.sort_by(|a, b| {
            b.high_rate
                .cmp(&a.high_rate)
                .then(b.expedite.cmp(&a.expedite))
                .then(a.time.cmp(&b.time))
        });
        Ok(rows)
    }

    /// Fork recovery: every verified-but-unused row must be re-checked
    /// against the replacement chain before it can be selected again.
    pub fn unverify_all(&self) -> ChainResult<()> {
        let mut tx = self.storage.begin();
        for mut row in self.storage.all_queued_transactions()? {
            if row.verified && !row.used {
                row.verified = false;
                tx.upsert_transaction(&row)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Janitor: drops consumed rows and expired unverified leftovers.
    pub fn prune(&self) -> ChainResult<usize> {
        let now = now_unix();
        let mut removed = 0;
        let mut tx = self.storage.begin();
        for row in self.storage.all_queued_transactions()? {
            let expired = !row.verified && row.time < now - MAX_TX_BACK_SECONDS;
            if row.used || expired {
                tx.delete_transaction(&row.hash);
                removed += 1;
            }
        }
        tx.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::crypto::{address_from_public_key, generate_keypair};
    use crate::types::{SmartTransaction, TxHeader, TxParam, TxRate};
    use ed25519_dalek::Keypair;
    use std::collections::BTreeMap;

    fn pool() -> (tempfile::TempDir, TxPool, Storage) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::open(dir.path()).expect("open");
        let config = NodeConfig::default();
        let sys = Arc::new(RwLock::new(SysParams::from_config(&config).expect("params")));
        let bad_keys = Arc::new(BadKeys::new(&sys.read()));
        let pool = TxPool::new(storage.clone(), bad_keys, sys);
        (dir, pool, storage)
    }

    fn signed_tx(keypair: &Keypair, contract: &str, tx_type: u8, time: i64) -> Vec<u8> {
        let tx = SmartTransaction {
            header: TxHeader {
                tx_type,
                time,
                ecosystem_id: 1,
                key_id: address_from_public_key(&keypair.public),
                network_id: 1,
            },
            contract: contract.to_string(),
            signed_by: 0,
            public_key: keypair.public.to_bytes().to_vec(),
            expedite: String::new(),
            params: BTreeMap::new(),
        };
        tx.seal(keypair).expect("seal").0
    }

    #[test]
    fn submit_accepts_and_dedups() {
        let (_dir, pool, _storage) = pool();
        let keypair = generate_keypair();
        let raw = signed_tx(&keypair, "TokenTransfer", 1, now_unix());
        let hash = pool.submit(&raw).expect("submit");
        assert!(matches!(
            pool.submit(&raw),
            Err(ChainError::DuplicatedTransaction)
        ));
        let selected = pool.select_for_block(10).expect("select");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].hash, hash);
    }

    #[test]
    fn submit_rejects_time_horizons() {
        let (_dir, pool, _storage) = pool();
        let keypair = generate_keypair();
        let early = signed_tx(&keypair, "A", 1, now_unix() + MAX_TX_FORWARD_SECONDS + 60);
        match pool.submit(&early) {
            Err(err) => assert!(err.is_ban_error()),
            Ok(_) => panic!("early tx accepted"),
        }
        let expired = signed_tx(&keypair, "A", 1, now_unix() - MAX_TX_BACK_SECONDS - 60);
        assert!(matches!(
            pool.submit(&expired),
            Err(ChainError::ExpiredTransactionTime)
        ));
    }

    #[test]
    fn selection_orders_by_rate_expedite_and_age() {
        let (_dir, pool, storage) = pool();
        let now = now_unix();
        let mut tx = storage.begin();
        let mk = |hash: u8, rate: TxRate, expedite: i64, time: i64| QueuedTransaction {
            hash: [hash; 32],
            data: Vec::new(),
            used: false,
            high_rate: rate,
            expedite,
            tx_type: 1,
            key_id: 1,
            sent: false,
            verified: true,
            time,
        };
        tx.upsert_transaction(&mk(1, TxRate::ApiContract, 0, now - 5)).unwrap();
        tx.upsert_transaction(&mk(2, TxRate::ApiContract, 2_000_000, now)).unwrap();
        tx.upsert_transaction(&mk(3, TxRate::SystemServer, 0, now)).unwrap();
        tx.upsert_transaction(&mk(4, TxRate::ApiContract, 0, now - 10)).unwrap();
        tx.commit().unwrap();

        let order: Vec<u8> = pool
            .select_for_block(10)
            .unwrap()
            .iter()
            .map(|row| row.hash[0])
            .collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn stop_network_short_circuits_selection() {
        let (_dir, pool, _storage) = pool();
        let keypair = generate_keypair();
        let now = now_unix();
        pool.submit(&signed_tx(&keypair, "A", 1, now)).unwrap();
        pool.submit(&signed_tx(&keypair, "StopNetwork", 2, now + 1))
            .unwrap();
        let selected = pool.select_for_block(10).unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].is_stop_network());
    }

    #[test]
    fn mark_bad_removes_row_and_debits_key() {
        let (_dir, pool, storage) = pool();
        let keypair = generate_keypair();
        let raw = signed_tx(&keypair, "A", 1, now_unix());
        let hash = pool.submit(&raw).unwrap();
        let key_id = address_from_public_key(&keypair.public);
        pool.mark_bad(&hash, key_id, "no such contract").unwrap();
        assert!(storage.queued_transaction(&hash).unwrap().is_none());
        let status = storage.tx_status(&hash).unwrap().expect("status row");
        assert_eq!(status.error, "no such contract");
    }

    #[test]
    fn banned_key_submissions_are_rejected() {
        let (_dir, pool, _storage) = pool();
        let keypair = generate_keypair();
        let key_id = address_from_public_key(&keypair.public);
        for _ in 0..5 {
            pool.bad_keys.bad_tx(key_id);
        }
        let raw = signed_tx(&keypair, "A", 1, now_unix());
        assert!(matches!(
            pool.submit(&raw),
            Err(ChainError::KeyBanned { .. })
        ));
    }

    #[test]
    fn unverify_all_hides_rows_from_selection() {
        let (_dir, pool, _storage) = pool();
        let keypair = generate_keypair();
        pool.submit(&signed_tx(&keypair, "A", 1, now_unix())).unwrap();
        pool.unverify_all().unwrap();
        assert!(pool.select_for_block(10).unwrap().is_empty());
    }

    #[test]
    fn prune_drops_used_rows() {
        let (_dir, pool, storage) = pool();
        let keypair = generate_keypair();
        let raw = signed_tx(&keypair, "A", 1, now_unix());
        let hash = pool.submit(&raw).unwrap();
        let mut tx = storage.begin();
        tx.mark_transaction_used(&hash).unwrap();
        tx.commit().unwrap();
        assert_eq!(pool.prune().unwrap(), 1);
        assert!(storage.queued_transaction(&hash).unwrap().is_none());
    }
}
