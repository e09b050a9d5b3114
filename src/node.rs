use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bans::{BadKeys, NodeBanRegistry};
use crate::config::{NodeConfig, SysParams};
use crate::crypto::{address_from_public_key, load_or_generate_keypair};
use crate::daemons::{run_daemon, Daemon};
use crate::errors::{ChainError, ChainResult};
use crate::net::{self, BytesPool, TcpServer};
use crate::pool::TxPool;
use crate::scheduler::now_unix;
use crate::storage::Storage;
use crate::types::{
    merkle_root, Block, BlockHeader, InfoBlock, StoredBlock, BLOCK_VERSION, GENESIS_BLOCK_ID,
};
use crate::validator::apply_block;
use crate::vm::SmartVM;
use crate::{confirmations, producer, sync};

/// Contracts every chain ships with: the delayed-contract trampoline and the
/// bad-block report target.
const BOOTSTRAP_CONTRACTS: &str = r#"
contract CallDelayedContract {
    data {
        Id int
    }
    action {
        DBInsert("delayed_log", Str($block) + "_" + Str($Id), {"id": $Id, "time": $time})
    }
}

contract NewBadBlock {
    data {
        ProducerNodeID int
        ConsumerNodeID int
        BlockID int
        Timestamp int
        Reason string
    }
    action {
        DBInsert("bad_blocks", Str($BlockID) + "_" + Str($ConsumerNodeID), {
            "producer": $ProducerNodeID,
            "consumer": $ConsumerNodeID,
            "block_id": $BlockID,
            "timestamp": $Timestamp,
            "reason": $Reason
        })
    }
}
"#;

/// Everything the daemons share, assembled once at startup and passed
/// explicitly; there is no hidden global state.
pub struct NodeContext {
    pub config: NodeConfig,
    pub sys: Arc<RwLock<SysParams>>,
    pub storage: Storage,
    pub keypair: Keypair,
    pub key_id: i64,
    pub smart_vm: SmartVM,
    pub pool: TxPool,
    pub bad_keys: Arc<BadKeys>,
    pub node_bans: NodeBanRegistry,
    /// Serialises every mutation of the committed chain: production, foreign
    /// apply and rollback.
    pub db_lock: tokio::sync::Mutex<()>,
    pub bytes_pool: BytesPool,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> ChainResult<Arc<Self>> {
        config.ensure_directories()?;
        let keypair = load_or_generate_keypair(&config.key_path)?;
        let key_id = address_from_public_key(&keypair.public);
        let storage = Storage::open(&config.data_dir.join("db"))?;
        let sys = Arc::new(RwLock::new(SysParams::load(&config, &storage)?));
        let bad_keys = Arc::new(BadKeys::new(&sys.read()));
        let pool = TxPool::new(storage.clone(), bad_keys.clone(), sys.clone());

        let smart_vm = SmartVM::new();
        smart_vm
            .write()
            .compile(BOOTSTRAP_CONTRACTS, 1)
            .map_err(|err| ChainError::Config(format!("bootstrap contracts: {err}")))?;
        for source in storage.contract_sources()? {
            if let Err(err) = smart_vm.write().compile(&source.source, source.ecosystem_id) {
                warn!(contract = source.name, %err, "stored contract failed to compile");
            }
        }

        let ctx = Arc::new(Self {
            config,
            sys,
            storage,
            keypair,
            key_id,
            smart_vm,
            pool,
            bad_keys,
            node_bans: NodeBanRegistry::new(),
            db_lock: tokio::sync::Mutex::new(()),
            bytes_pool: BytesPool::default(),
        });
        ctx.ensure_genesis()?;
        Ok(ctx)
    }

    /// First boot of an empty store: the solo dev node or the honor node at
    /// position 0 seals the empty genesis block; everyone else fetches block
    /// 1 from the network.
    fn ensure_genesis(&self) -> ChainResult<()> {
        if self.storage.info_block()?.is_some() {
            return Ok(());
        }
        let sys = self.sys.read();
        if !sys.honor_nodes.is_empty() && sys.node_position_by_key(self.key_id) != Some(0) {
            return Ok(());
        }
        drop(sys);
        let mut genesis = Block {
            header: BlockHeader {
                block_id: GENESIS_BLOCK_ID,
                time: now_unix(),
                ecosystem_id: 0,
                key_id: self.key_id,
                node_position: 0,
                version: BLOCK_VERSION,
                sign: Vec::new(),
            },
            prev_hash: [0u8; 32],
            merkle_root: merkle_root(&[]),
            rollbacks_hash: crate::storage::rollback_entries_hash(&[]),
            transactions: Vec::new(),
            bin_data: Vec::new(),
        };
        genesis.sign(&self.keypair);
        let sys = self.sys.read().clone();
        apply_block(&self.storage, &self.smart_vm, &self.bad_keys, &sys, &genesis)?;
        info!(hash = %hex::encode(genesis.hash()), "genesis block created");
        Ok(())
    }

    pub fn info_block(&self) -> ChainResult<Option<InfoBlock>> {
        self.storage.info_block()
    }

    pub fn block(&self, block_id: u64) -> ChainResult<Option<StoredBlock>> {
        self.storage.block(block_id)
    }
}

pub struct Node {
    ctx: Arc<NodeContext>,
}

impl Node {
    pub fn new(config: NodeConfig) -> ChainResult<Self> {
        Ok(Self {
            ctx: NodeContext::new(config)?,
        })
    }

    pub fn context(&self) -> Arc<NodeContext> {
        self.ctx.clone()
    }

    /// Spawns the daemons and the TCP server; returns when `shutdown` fires.
    pub async fn start(self, shutdown: watch::Receiver<bool>) -> ChainResult<()> {
        info!(key_id = self.ctx.key_id, "starting node");
        let mut tasks = JoinSet::new();

        let server = TcpServer::new(self.ctx.clone());
        let server_shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = server.run(server_shutdown).await {
                warn!(?err, "tcp server stopped");
            }
        });

        let generator = Daemon::new("block_generator", Duration::from_secs(1));
        tasks.spawn(run_daemon(
            self.ctx.clone(),
            generator,
            shutdown.clone(),
            producer::block_generator,
        ));

        let collection = Daemon::new("blocks_collection", Duration::from_secs(2));
        tasks.spawn(run_daemon(
            self.ctx.clone(),
            collection,
            shutdown.clone(),
            sync::blocks_collection,
        ));

        let confirm = Daemon::new("confirmations", Duration::from_secs(10));
        tasks.spawn(run_daemon(
            self.ctx.clone(),
            confirm,
            shutdown.clone(),
            confirmations::confirmations,
        ));

        let gossip = Daemon::new("disseminator", Duration::from_secs(1));
        tasks.spawn(run_daemon(
            self.ctx.clone(),
            gossip,
            shutdown.clone(),
            disseminate_transactions,
        ));

        let janitor = Daemon::new("queue_janitor", Duration::from_secs(60));
        tasks.spawn(run_daemon(
            self.ctx.clone(),
            janitor,
            shutdown.clone(),
            prune_queue,
        ));

        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// Pushes not-yet-sent pool transactions to every non-banned peer, then
/// marks them sent.
async fn disseminate_transactions(
    ctx: Arc<NodeContext>,
    _daemon: Arc<Daemon>,
) -> ChainResult<()> {
    let unsent = ctx.pool.unsent_transactions()?;
    if unsent.is_empty() {
        return Ok(());
    }
    let sys = ctx.sys.read().clone();
    let hosts = ctx
        .node_bans
        .filter_banned_hosts(&sys, &sys.remote_hosts(ctx.key_id));
    if hosts.is_empty() {
        return Ok(());
    }
    let mut sent: Vec<[u8; 32]> = Vec::with_capacity(unsent.len());
    for row in unsent {
        let mut delivered = false;
        for host in &hosts {
            match net::send_transaction(host, &row.data).await {
                Ok(()) => delivered = true,
                Err(err) => debug!(host, ?err, "transaction push failed"),
            }
        }
        if delivered {
            sent.push(row.hash);
        }
    }
    if !sent.is_empty() {
        ctx.pool.mark_sent(&sent)?;
    }
    Ok(())
}

async fn prune_queue(ctx: Arc<NodeContext>, _daemon: Arc<Daemon>) -> ChainResult<()> {
    let removed = ctx.pool.prune()?;
    if removed > 0 {
        debug!(removed, "queue janitor pruned transactions");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_config(dir: &std::path::Path) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.data_dir = dir.join("data");
        config.key_path = dir.join("keys/node.toml");
        config.lock_file = dir.join("data/palisade.lock");
        config.tcp_listen = "127.0.0.1:0".parse().expect("socket addr");
        config
    }

    #[test]
    fn first_boot_seals_a_genesis_block() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = NodeContext::new(test_config(dir.path())).expect("context");
        let info = ctx.info_block().expect("info").expect("genesis");
        assert_eq!(info.block_id, GENESIS_BLOCK_ID);
        let record = ctx.block(GENESIS_BLOCK_ID).expect("read").expect("stored");
        assert_eq!(record.hash, info.hash);
    }

    #[test]
    fn restart_keeps_the_existing_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let first = NodeContext::new(config.clone()).expect("context");
        let genesis_hash = first.info_block().unwrap().unwrap().hash;
        drop(first);

        let second = NodeContext::new(config).expect("context again");
        assert_eq!(second.info_block().unwrap().unwrap().hash, genesis_hash);
    }

    #[test]
    fn stored_parameters_overlay_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        {
            let first = NodeContext::new(config.clone()).expect("context");
            first
                .storage
                .set_system_parameter("max_tx_count", "123")
                .expect("set");
        }
        let second = NodeContext::new(config).expect("context again");
        assert_eq!(second.sys.read().max_tx_count, 123);
    }

    #[test]
    fn bootstrap_contracts_are_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = NodeContext::new(test_config(dir.path())).expect("context");
        let vm = ctx.smart_vm.read();
        assert!(vm.contract(1, "CallDelayedContract").is_some());
        assert!(vm.contract(1, "NewBadBlock").is_some());
    }
}
