use std::collections::BTreeMap;
use std::collections::HashMap;

use ed25519_dalek::Keypair;
use parking_lot::{Mutex, RwLock};
use tracing::{error, warn};

use crate::config::{HonorNode, SysParams};
use crate::crypto::address_from_public_key;
use crate::errors::{ChainError, ChainResult};
use crate::pool::TxPool;
use crate::scheduler::now_unix;
use crate::types::{new_internal_transaction, TxParam};

struct BanEntry {
    /// Unix second the outright ban expires at; zero when not banned.
    banned_until: i64,
    /// Circular buffer of the last `slots` bad-transaction times.
    bad: Vec<i64>,
}

/// Sliding-window ban list for transaction authors. A key collects bad-tx
/// timestamps into a fixed circular buffer; once `slots - 1` of them fall
/// inside the window the key is banned for the configured duration.
pub struct BadKeys {
    slots: usize,
    window_seconds: i64,
    ban_seconds: i64,
    entries: RwLock<HashMap<i64, BanEntry>>,
}

impl BadKeys {
    pub fn new(sys: &SysParams) -> Self {
        Self {
            slots: sys.bad_tx_count.max(1),
            window_seconds: sys.bad_tx_window_minutes * 60,
            ban_seconds: sys.ban_duration_minutes * 60,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn bad_tx(&self, key_id: i64) {
        self.bad_tx_at(key_id, now_unix());
    }

    pub fn is_banned(&self, key_id: i64) -> bool {
        self.is_banned_at(key_id, now_unix())
    }

    pub fn banned_until(&self, key_id: i64) -> i64 {
        self.entries
            .read()
            .get(&key_id)
            .map(|entry| entry.banned_until)
            .unwrap_or(0)
    }

    pub(crate) fn bad_tx_at(&self, key_id: i64, now: i64) {
        let mut entries = self.entries.write();
        let entry = entries.entry(key_id).or_insert_with(|| BanEntry {
            banned_until: 0,
            bad: vec![0; self.slots],
        });
        let mut in_window = 0;
        let mut oldest = 0;
        for (i, stamp) in entry.bad.iter().enumerate() {
            if stamp + self.window_seconds > now {
                in_window += 1;
            }
            if *stamp < entry.bad[oldest] {
                oldest = i;
            }
        }
        entry.bad[oldest] = now;
        if in_window >= self.slots - 1 {
            entry.banned_until = now + self.ban_seconds;
        }
    }

    pub(crate) fn is_banned_at(&self, key_id: i64, now: i64) -> bool {
        {
            let entries = self.entries.read();
            match entries.get(&key_id) {
                None => return false,
                Some(entry) => {
                    if now < entry.banned_until {
                        return true;
                    }
                    if entry
                        .bad
                        .iter()
                        .any(|stamp| stamp + self.window_seconds > now)
                    {
                        return false;
                    }
                }
            }
        }
        // Every recorded timestamp has aged out of the window.
        self.entries.write().remove(&key_id);
        false
    }
}

struct LocalBan {
    unban_at: i64,
}

/// Local cool-off list for peer nodes plus the on-chain bad-block report.
/// Membership questions are answered against the current honor set.
pub struct NodeBanRegistry {
    local: Mutex<HashMap<i64, LocalBan>>,
}

impl Default for NodeBanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeBanRegistry {
    pub fn new() -> Self {
        Self {
            local: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_banned(&self, node: &HonorNode) -> bool {
        self.is_banned_at(node, now_unix())
    }

    fn is_banned_at(&self, node: &HonorNode, now: i64) -> bool {
        let mut local = self.local.lock();
        if let Some(ban) = local.get(&node.key_id) {
            if now >= ban.unban_at {
                local.remove(&node.key_id);
            } else {
                return true;
            }
        }
        // A non-zero on-chain unban time means the node is globally banned,
        // with no local expiry estimation.
        node.unban_time != 0
    }

    fn local_ban(&self, node: &HonorNode, sys: &SysParams) {
        let now = now_unix();
        let mut unban_at = now + sys.local_ban_minutes * 60;
        if unban_at == now {
            unban_at = now + 120;
        }
        self.local
            .lock()
            .insert(node.key_id, LocalBan { unban_at });
    }

    /// Bans the producer locally and, when `register` is set, submits the
    /// `NewBadBlock` report so the rest of the network learns about it.
    pub fn register_bad_block(
        &self,
        sys: &SysParams,
        pool: &TxPool,
        keypair: &Keypair,
        producer: &HonorNode,
        block_id: u64,
        block_time: i64,
        reason: &str,
        register: bool,
    ) -> ChainResult<()> {
        if self.is_banned(producer) {
            return Ok(());
        }
        warn!(
            node = producer.key_id,
            block_id, reason, "banning block producer"
        );
        self.local_ban(producer, sys);
        if !register {
            return Ok(());
        }
        let own_key_id = address_from_public_key(&keypair.public);
        if sys.node_position_by_key(own_key_id).is_none() {
            return Err(ChainError::Config(
                "current node is not in the honor set".into(),
            ));
        }
        let mut params = BTreeMap::new();
        params.insert("ProducerNodeID".into(), TxParam::Int(producer.key_id));
        params.insert("ConsumerNodeID".into(), TxParam::Int(own_key_id));
        params.insert("BlockID".into(), TxParam::Int(block_id as i64));
        params.insert("Timestamp".into(), TxParam::Int(block_time));
        params.insert("Reason".into(), TxParam::Str(reason.to_string()));
        let (raw, _) = new_internal_transaction(
            "NewBadBlock",
            params,
            keypair,
            own_key_id,
            now_unix(),
            1,
            sys.network_id,
        )?;
        if let Err(err) = pool.submit(&raw) {
            error!(?err, "failed to queue bad block report");
        }
        Ok(())
    }

    pub fn filter_banned_hosts(&self, sys: &SysParams, hosts: &[String]) -> Vec<String> {
        hosts
            .iter()
            .filter(|host| match sys.node_by_host(host) {
                Ok(node) => !self.is_banned(node),
                Err(_) => false,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn bad_keys() -> BadKeys {
        let config = NodeConfig::default();
        let sys = SysParams::from_config(&config).expect("params");
        BadKeys::new(&sys)
    }

    #[test]
    fn five_bad_transactions_inside_window_ban_the_key() {
        let keys = bad_keys();
        let now = 1_000_000;
        for i in 0..4 {
            keys.bad_tx_at(9, now + i);
            assert!(!keys.is_banned_at(9, now + i));
        }
        keys.bad_tx_at(9, now + 4);
        assert!(keys.is_banned_at(9, now + 5));
    }

    #[test]
    fn ban_expires_after_duration() {
        let keys = bad_keys();
        let now = 1_000_000;
        for i in 0..5 {
            keys.bad_tx_at(3, now + i);
        }
        assert!(keys.is_banned_at(3, now + 10));
        // Past the ban and past the sliding window the entry is dropped.
        let later = now + 31 * 60;
        assert!(!keys.is_banned_at(3, later));
        assert_eq!(keys.banned_until(3), 0);
    }

    #[test]
    fn stale_entries_do_not_ban() {
        let keys = bad_keys();
        let now = 1_000_000;
        for i in 0..4 {
            keys.bad_tx_at(5, now + i * 60);
        }
        // Fifth strike arrives after the earlier ones aged out.
        keys.bad_tx_at(5, now + 40 * 60);
        assert!(!keys.is_banned_at(5, now + 40 * 60 + 1));
    }

    #[test]
    fn ban_check_is_idempotent() {
        let keys = bad_keys();
        let now = 1_000_000;
        keys.bad_tx_at(11, now);
        let first = keys.is_banned_at(11, now + 1);
        let second = keys.is_banned_at(11, now + 1);
        assert_eq!(first, second);
    }
}
