//! End-to-end flows across two nodes: slot production, foreign-block apply,
//! fork resolution over real TCP, and administrative rewinds.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::Keypair;
use tokio::sync::watch;

use palisade_chain::config::{HonorNodeConfig, NodeConfig};
use palisade_chain::crypto;
use palisade_chain::daemons::Daemon;
use palisade_chain::net::TcpServer;
use palisade_chain::node::NodeContext;
use palisade_chain::producer::block_generator;
use palisade_chain::rollback;
use palisade_chain::scheduler::now_unix;
use palisade_chain::sync::replace_blocks_from_host;
use palisade_chain::types::{
    merkle_root, tx_hash_from_envelope, Block, SmartTransaction, TxHeader, TxParam,
};
use palisade_chain::validator::{self, PlayMode};

const CREDIT_CONTRACT: &str = r#"contract Credit {
    data {
        Id int
        Amount int
    }
    conditions {
        if $Amount <= 0 {
            error "non-positive amount"
        }
    }
    action {
        var row map
        row = DBRow("keys", $Id)
        if Len(row) == 0 {
            DBInsert("keys", $Id, {"amount": $Amount})
        } else {
            var total int
            total = row["amount"] + $Amount
            DBUpdate("keys", $Id, {"amount": total})
        }
    }
}"#;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").port()
}

fn fast_config(dir: &Path, port: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.data_dir = dir.join("data");
    config.key_path = dir.join("keys/node.toml");
    config.lock_file = dir.join("data/palisade.lock");
    config.tcp_listen = format!("127.0.0.1:{port}").parse().expect("addr");
    config.params.block_gen_time = Some(1);
    config.params.gap_between_blocks = Some(0);
    config
}

/// Generates the producer keypair up front so it can appear in honor-node
/// configs, then builds the context with the contract compiled in.
fn producer_node(dir: &Path, port: u16) -> (Arc<NodeContext>, Keypair, String) {
    let mut config = fast_config(dir, port);
    let keypair = crypto::generate_keypair();
    crypto::save_keypair(&config.key_path, &keypair).expect("save key");
    let address = format!("127.0.0.1:{port}");
    config.honor_nodes.push(HonorNodeConfig {
        tcp_address: address.clone(),
        api_address: String::new(),
        public_key: hex::encode(keypair.public.to_bytes()),
        unban_time: 0,
    });
    let ctx = NodeContext::new(config).expect("context");
    ctx.smart_vm
        .write()
        .compile(CREDIT_CONTRACT, 1)
        .expect("compile");
    (ctx, keypair, address)
}

/// A follower that trusts `producer` at position 0 and has no chain yet.
fn follower_node(dir: &Path, producer_key: &Keypair, producer_addr: &str) -> Arc<NodeContext> {
    let mut config = fast_config(dir, free_port());
    config.honor_nodes.push(HonorNodeConfig {
        tcp_address: producer_addr.to_string(),
        api_address: String::new(),
        public_key: hex::encode(producer_key.public.to_bytes()),
        unban_time: 0,
    });
    let ctx = NodeContext::new(config).expect("context");
    assert!(ctx.info_block().expect("info").is_none(), "follower starts empty");
    ctx.smart_vm
        .write()
        .compile(CREDIT_CONTRACT, 1)
        .expect("compile");
    ctx
}

fn credit_tx(user: &Keypair, id: i64, amount: i64) -> Vec<u8> {
    let mut params = BTreeMap::new();
    params.insert("Id".to_string(), TxParam::Int(id));
    params.insert("Amount".to_string(), TxParam::Int(amount));
    let tx = SmartTransaction {
        header: TxHeader {
            tx_type: 1,
            time: now_unix(),
            ecosystem_id: 1,
            key_id: crypto::address_from_public_key(&user.public),
            network_id: 1,
        },
        contract: "Credit".to_string(),
        signed_by: 0,
        public_key: user.public.to_bytes().to_vec(),
        expedite: String::new(),
        params,
    };
    tx.seal(user).expect("seal").0
}

/// Runs producer ticks until a new block lands or the budget runs out.
async fn produce_next_block(ctx: &Arc<NodeContext>) -> u64 {
    let before = ctx.info_block().unwrap().unwrap().block_id;
    let daemon = Daemon::new("block_generator", Duration::from_secs(1));
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        block_generator(ctx.clone(), daemon.clone())
            .await
            .expect("producer tick");
        let tip = ctx.info_block().unwrap().unwrap().block_id;
        if tip > before {
            return tip;
        }
    }
    panic!("no block produced within the budget");
}

#[tokio::test]
async fn empty_slot_produces_no_block() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ctx, _key, _addr) = producer_node(dir.path(), free_port());
    let tip_before = ctx.info_block().unwrap().unwrap();

    let daemon = Daemon::new("block_generator", Duration::from_secs(1));
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(600)).await;
        block_generator(ctx.clone(), daemon.clone())
            .await
            .expect("producer tick");
    }
    let tip_after = ctx.info_block().unwrap().unwrap();
    assert_eq!(tip_before.block_id, tip_after.block_id);
    assert_eq!(tip_before.hash, tip_after.hash);
}

#[tokio::test]
async fn produced_block_commits_single_transaction() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ctx, _key, _addr) = producer_node(dir.path(), free_port());
    let user = crypto::generate_keypair();
    let raw = credit_tx(&user, 7, 100);
    let hash = ctx.pool.submit(&raw).expect("submit");

    let tip = produce_next_block(&ctx).await;
    assert_eq!(tip, 2);

    let record = ctx.block(2).expect("read").expect("stored");
    let block = Block::from_bytes(&record.data).expect("decode");
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(tx_hash_from_envelope(&block.transactions[0]).unwrap(), hash);
    // Single leaf: the root is the hash paired with itself.
    assert_eq!(block.merkle_root, merkle_root(&[hash]));

    let row = ctx.storage.queued_transaction(&hash).unwrap().expect("pool row");
    assert!(row.used);
    assert_eq!(ctx.storage.log_transaction_block(&hash).unwrap(), Some(2));
    assert_eq!(
        ctx.storage.state_row("1_keys", "7").unwrap(),
        Some(serde_json::json!({"amount": 100}))
    );
}

#[tokio::test]
async fn follower_applies_foreign_chain() {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let (node_a, key_a, addr_a) = producer_node(dir_a.path(), free_port());
    let user = crypto::generate_keypair();
    let tx_raw = credit_tx(&user, 3, 40);
    let tx_hash = node_a.pool.submit(&tx_raw).expect("submit");
    produce_next_block(&node_a).await;

    let dir_b = tempfile::tempdir().expect("tempdir");
    let node_b = follower_node(dir_b.path(), &key_a, &addr_a);
    let sys_b = node_b.sys.read().clone();

    for block_id in 1..=2 {
        let record = node_a.block(block_id).unwrap().expect("block");
        let block = Block::from_bytes(&record.data).expect("decode");
        validator::apply_block(&node_b.storage, &node_b.smart_vm, &node_b.bad_keys, &sys_b, &block)
            .expect("apply");
    }

    let info_b = node_b.info_block().unwrap().unwrap();
    let info_a = node_a.info_block().unwrap().unwrap();
    assert_eq!(info_b.block_id, 2);
    assert_eq!(info_b.hash, info_a.hash);
    assert_eq!(info_b.rollbacks_hash, info_a.rollbacks_hash);
    assert_eq!(node_b.storage.log_transaction_block(&tx_hash).unwrap(), Some(2));
    assert_eq!(
        node_b.storage.state_row("1_keys", "3").unwrap(),
        node_a.storage.state_row("1_keys", "3").unwrap()
    );
}

#[tokio::test]
async fn fork_resolves_to_peer_chain_over_tcp() {
    let port_a = free_port();
    let dir_a = tempfile::tempdir().expect("tempdir");
    let (node_a, key_a, addr_a) = producer_node(dir_a.path(), port_a);

    // The peer chain: block 2 credits account 9 with 100.
    let user = crypto::generate_keypair();
    node_a
        .pool
        .submit(&credit_tx(&user, 9, 100))
        .expect("submit");
    produce_next_block(&node_a).await;
    let record_a2 = node_a.block(2).unwrap().expect("peer block 2");
    let block_a2 = Block::from_bytes(&record_a2.data).expect("decode");

    // The follower adopts the shared genesis, then commits a divergent
    // block 2 that credits account 9 with 50.
    let dir_b = tempfile::tempdir().expect("tempdir");
    let node_b = follower_node(dir_b.path(), &key_a, &addr_a);
    let sys_b = node_b.sys.read().clone();
    let genesis = Block::from_bytes(&node_a.block(1).unwrap().unwrap().data).unwrap();
    validator::apply_block(&node_b.storage, &node_b.smart_vm, &node_b.bad_keys, &sys_b, &genesis)
        .expect("apply genesis");

    let fork_tx = credit_tx(&user, 9, 50);
    let fork_tx_hash = tx_hash_from_envelope(&fork_tx).unwrap();
    let fork_block = {
        let mut stx = node_b.storage.begin();
        let vm = node_b.smart_vm.read();
        let play = validator::play_transactions(
            &mut stx,
            &vm,
            2,
            block_a2.header.time,
            std::slice::from_ref(&fork_tx),
            &sys_b,
            &node_b.bad_keys,
            PlayMode::Validate,
        )
        .expect("dry run");
        // The dry-run transaction is discarded with stx.
        let mut block = Block {
            header: palisade_chain::types::BlockHeader {
                block_id: 2,
                time: block_a2.header.time,
                ecosystem_id: 0,
                key_id: crypto::address_from_public_key(&key_a.public),
                node_position: 0,
                version: palisade_chain::types::BLOCK_VERSION,
                sign: Vec::new(),
            },
            prev_hash: genesis.hash(),
            merkle_root: play.merkle_root,
            rollbacks_hash: play.rollbacks_hash,
            transactions: vec![fork_tx.clone()],
            bin_data: Vec::new(),
        };
        block.sign(&key_a);
        block
    };
    validator::apply_block(
        &node_b.storage,
        &node_b.smart_vm,
        &node_b.bad_keys,
        &sys_b,
        &fork_block,
    )
    .expect("apply divergent block");
    assert_ne!(
        node_b.info_block().unwrap().unwrap().hash,
        node_a.info_block().unwrap().unwrap().hash
    );

    // Serve the peer chain and resolve the fork.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = TcpServer::new(node_a.clone());
    let server_task = tokio::spawn(server.run(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;

    replace_blocks_from_host(&node_b, &sys_b, &addr_a, 2, 1)
        .await
        .expect("fork resolution");

    let info_b = node_b.info_block().unwrap().unwrap();
    assert_eq!(info_b.hash, block_a2.hash());
    assert_eq!(
        node_b.storage.state_row("1_keys", "9").unwrap(),
        Some(serde_json::json!({"amount": 100}))
    );
    // The discarded block's transaction went back to the pool unverified.
    let returned = node_b
        .storage
        .queued_transaction(&fork_tx_hash)
        .unwrap()
        .expect("returned row");
    assert!(!returned.used);
    assert!(!returned.verified);

    let _ = shutdown_tx.send(true);
    server_task.abort();
}

#[tokio::test]
async fn full_rewind_restores_initial_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (ctx, _key, _addr) = producer_node(dir.path(), free_port());
    let user = crypto::generate_keypair();

    let first = ctx.pool.submit(&credit_tx(&user, 1, 10)).expect("submit");
    produce_next_block(&ctx).await;
    let second = ctx.pool.submit(&credit_tx(&user, 1, 5)).expect("submit");
    produce_next_block(&ctx).await;
    assert_eq!(
        ctx.storage.state_row("1_keys", "1").unwrap(),
        Some(serde_json::json!({"amount": 15}))
    );

    rollback::to_block_id(&ctx.storage, 1).expect("rewind");

    let info = ctx.info_block().unwrap().unwrap();
    assert_eq!(info.block_id, 1);
    assert!(ctx.block(2).unwrap().is_none());
    assert!(ctx.block(3).unwrap().is_none());
    assert_eq!(ctx.storage.state_row("1_keys", "1").unwrap(), None);
    for hash in [first, second] {
        let row = ctx.storage.queued_transaction(&hash).unwrap().expect("row");
        assert!(!row.used);
        assert!(!row.verified);
        assert!(ctx.storage.log_transaction_block(&hash).unwrap().is_none());
        let stx = ctx.storage.begin();
        assert!(stx.rollback_entries_for_tx(&hash).unwrap().is_empty());
    }
}

#[tokio::test]
async fn apply_then_rollback_is_identity() {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let (node_a, key_a, addr_a) = producer_node(dir_a.path(), free_port());
    let user = crypto::generate_keypair();
    let tx_raw = credit_tx(&user, 4, 70);
    let tx_hash = tx_hash_from_envelope(&tx_raw).unwrap();
    node_a.pool.submit(&tx_raw).expect("submit");
    produce_next_block(&node_a).await;

    let dir_b = tempfile::tempdir().expect("tempdir");
    let node_b = follower_node(dir_b.path(), &key_a, &addr_a);
    let sys_b = node_b.sys.read().clone();
    let genesis_raw = node_a.block(1).unwrap().unwrap().data;
    let block2_raw = node_a.block(2).unwrap().unwrap().data;
    let genesis = Block::from_bytes(&genesis_raw).unwrap();
    let block2 = Block::from_bytes(&block2_raw).unwrap();

    validator::apply_block(&node_b.storage, &node_b.smart_vm, &node_b.bad_keys, &sys_b, &genesis)
        .expect("genesis");
    validator::apply_block(&node_b.storage, &node_b.smart_vm, &node_b.bad_keys, &sys_b, &block2)
        .expect("block 2");
    assert_eq!(
        node_b.storage.state_row("1_keys", "4").unwrap(),
        Some(serde_json::json!({"amount": 70}))
    );

    rollback::rollback_block(&node_b.storage, &block2_raw).expect("rollback");

    let info = node_b.info_block().unwrap().unwrap();
    assert_eq!(info.block_id, 1);
    assert_eq!(info.hash, genesis.hash());
    assert_eq!(node_b.storage.state_row("1_keys", "4").unwrap(), None);
    assert!(node_b.storage.log_transaction_block(&tx_hash).unwrap().is_none());
    let stx = node_b.storage.begin();
    assert!(stx.rollback_entries_for_tx(&tx_hash).unwrap().is_empty());
}
