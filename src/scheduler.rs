use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SysParams;
use crate::errors::ChainResult;
use crate::storage::Storage;

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Maps wall-clock seconds onto the round-robin production schedule: each
/// interval of `block_gen_time + gap` seconds belongs to one node position,
/// and only the first `block_gen_time` seconds of it are a valid generation
/// window.
#[derive(Clone, Copy, Debug)]
pub struct BlockTimeCounter {
    block_gen_time: i64,
    gap: i64,
    nodes_count: i64,
}

impl BlockTimeCounter {
    pub fn new(block_gen_time: i64, gap: i64, nodes_count: usize) -> Self {
        Self {
            block_gen_time: block_gen_time.max(1),
            gap: gap.max(0),
            nodes_count: nodes_count.max(1) as i64,
        }
    }

    pub fn from_params(sys: &SysParams) -> Self {
        Self::new(
            sys.block_gen_time,
            sys.gap_between_blocks,
            sys.nodes_count(),
        )
    }

    fn interval(&self) -> i64 {
        self.block_gen_time + self.gap
    }

    /// The producer position for second `t`.
    pub fn node_position(&self, t: i64) -> u16 {
        ((t / self.interval()).rem_euclid(self.nodes_count)) as u16
    }

    /// Whether `position` owns second `t` and `t` still falls inside the
    /// generation window rather than the inter-slot gap.
    pub fn time_to_generate(&self, t: i64, position: u16) -> bool {
        self.node_position(t) == position && t % self.interval() <= self.block_gen_time
    }

    /// The `[start, end]` window of the slot containing `t`; `end` is the
    /// production deadline.
    pub fn range_by_time(&self, t: i64) -> (i64, i64) {
        let start = t - t.rem_euclid(self.interval());
        (start, start + self.block_gen_time)
    }

    /// Whether this node already produced a block inside the current slot.
    pub fn block_for_time_exists(
        &self,
        storage: &Storage,
        t: i64,
        position: u16,
    ) -> ChainResult<bool> {
        let (start, end) = self.range_by_time(t);
        storage.block_in_time_range(start, end + 1, position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_rotate_round_robin() {
        let counter = BlockTimeCounter::new(2, 1, 3);
        // interval = 3s; slots: [0..3) -> 0, [3..6) -> 1, [6..9) -> 2, [9..12) -> 0
        assert_eq!(counter.node_position(0), 0);
        assert_eq!(counter.node_position(4), 1);
        assert_eq!(counter.node_position(8), 2);
        assert_eq!(counter.node_position(9), 0);
    }

    #[test]
    fn gap_seconds_are_not_generation_time() {
        let counter = BlockTimeCounter::new(2, 2, 1);
        // interval = 4s; seconds 0..=2 generate, second 3 is the gap
        assert!(counter.time_to_generate(0, 0));
        assert!(counter.time_to_generate(2, 0));
        assert!(!counter.time_to_generate(3, 0));
        assert!(!counter.time_to_generate(2, 1));
    }

    #[test]
    fn range_covers_the_owning_slot() {
        let counter = BlockTimeCounter::new(2, 1, 4);
        let (start, end) = counter.range_by_time(1_000);
        assert_eq!(start, 999);
        assert_eq!(end, 1_001);
        assert!(start <= 1_000 && 1_000 <= end);
    }

    #[test]
    fn single_node_always_owns_the_slot() {
        let counter = BlockTimeCounter::new(1, 0, 1);
        for t in 0..10 {
            assert_eq!(counter.node_position(t), 0);
        }
    }
}
