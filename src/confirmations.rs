use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

use crate::daemons::Daemon;
use crate::errors::ChainResult;
use crate::net;
use crate::node::NodeContext;
use crate::scheduler::now_unix;
use crate::storage::Confirmation;

/// How many recent blocks the daemon re-checks each pass.
const CONFIRMATION_DEPTH: u64 = 5;
/// Ticks spent in the slow startup cadence while blocks are still arriving.
const STARTUP_TICKS: u64 = 12;

/// One confirmations pass: walk recent blocks from the tip down, ask every
/// non-banned peer for its hash at that height, and persist the good/bad
/// tally. Timeouts count as bad answers.
pub async fn confirmations(ctx: Arc<NodeContext>, daemon: Arc<Daemon>) -> ChainResult<()> {
    // The first couple of minutes poll slowly so blocks can be collected.
    if daemon.ticks.load(Ordering::Relaxed) < STARTUP_TICKS {
        daemon.set_sleep(Duration::from_secs(10));
    } else {
        daemon.set_sleep(Duration::from_secs(1));
    }

    let sys = ctx.sys.read().clone();
    let quorum = sys.confirmation_quorum();
    let Some(info) = ctx.storage.info_block()? else {
        return Ok(());
    };
    let tip = info.block_id;
    if tip == 0 {
        return Ok(());
    }
    let confirmed = ctx
        .storage
        .last_confirmed_block(quorum)?
        .map(|confirmation| confirmation.block_id)
        .unwrap_or(0);

    let start_block_id = if tip > confirmed && tip - confirmed > CONFIRMATION_DEPTH {
        daemon.set_sleep(Duration::from_secs(10));
        daemon.ticks.store(0, Ordering::Relaxed);
        confirmed + 1
    } else {
        tip
    };

    for block_id in (start_block_id..=tip).rev() {
        let Some(record) = ctx.storage.block(block_id)? else {
            continue;
        };
        let hosts = ctx
            .node_bans
            .filter_banned_hosts(&sys, &sys.remote_hosts(ctx.key_id));
        let (good, bad) = tally_hosts(&hosts, block_id, record.hash, sys.wait_confirmed_nodes).await;
        let confirmation = Confirmation {
            block_id,
            good,
            bad,
            time: now_unix(),
        };
        ctx.storage.save_confirmation(&confirmation)?;
        debug!(block_id, good, bad, "confirmation recorded");

        if block_id > start_block_id && good >= quorum {
            break;
        }
    }
    Ok(())
}

/// Probes every host concurrently with a per-host deadline; a peer counts as
/// good only when it returns exactly the local hash.
async fn tally_hosts(
    hosts: &[String],
    block_id: u64,
    local_hash: [u8; 32],
    wait_seconds: u64,
) -> (i32, i32) {
    let mut probes = JoinSet::new();
    for host in hosts {
        let host = host.clone();
        probes.spawn(async move {
            match timeout(
                Duration::from_secs(wait_seconds),
                net::check_confirmation(&host, block_id),
            )
            .await
            {
                Ok(Ok(hash)) => Some(hash),
                _ => None,
            }
        });
    }
    let mut good = 0;
    let mut bad = 0;
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok(Some(hash)) if hash == local_hash => good += 1,
            _ => bad += 1,
        }
    }
    (good, bad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tally_counts_unreachable_hosts_as_bad() {
        // Nothing listens on these ports; every probe times out or errors.
        let hosts = vec![
            "127.0.0.1:1".to_string(),
            "127.0.0.1:2".to_string(),
        ];
        let (good, bad) = tally_hosts(&hosts, 3, [7u8; 32], 1).await;
        assert_eq!(good, 0);
        assert_eq!(bad, 2);
    }

    #[tokio::test]
    async fn tally_with_no_hosts_is_empty() {
        let (good, bad) = tally_hosts(&[], 3, [7u8; 32], 1).await;
        assert_eq!(good, 0);
        assert_eq!(bad, 0);
    }
}
