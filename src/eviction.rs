//! In-block eviction policies.
//!
//! An [`EvictionPolicy`] answers purely positional questions about the
//! entries of one index block: where a new entry of a given rank lands,
//! where a hit entry is promoted to, which entry is the eviction candidate,
//! and what rank a position corresponds to. The block layout itself lives
//! in `index::block`.

/// Positional eviction policy for index blocks.
///
/// Positions run `0..num_entries` with 0 the hottest (head). Ranks run
/// `0..num_ranks` with 0 the hottest.
pub trait EvictionPolicy: Send + Sync {
    /// Rank new items are inserted with when the caller does not specify one.
    fn default_insert_rank(&self) -> usize;

    /// Position a new entry of `rank` is inserted at, given the current
    /// entry count.
    fn insert_index(&self, rank: usize, num_entries: usize) -> usize;

    /// Position a hit entry at `current` moves to.
    fn promotion_index(&self, current: usize, num_entries: usize) -> usize;

    /// Position of the entry evicted when the block must shed one.
    fn eviction_candidate(&self, num_entries: usize) -> usize;

    /// Rank of the entry at `index`.
    fn rank_for_index(&self, index: usize, num_entries: usize) -> usize;
}

/// Segmented-LRU policy.
///
/// Entries are conceptually partitioned into `num_segments` contiguous
/// virtual segments by position. A hit moves the entry to the head of the
/// virtual segment above its current one (entries already in segment 0 move
/// to the head of segment 0). An insert with rank `r` lands at the head of
/// virtual segment `r`. The eviction candidate is the tail.
#[derive(Debug, Clone)]
pub struct SlruPolicy {
    num_segments: usize,
    insert_point: usize,
    num_ranks: usize,
}

impl SlruPolicy {
    /// Create an SLRU policy.
    ///
    /// `insert_point` is the default insertion rank and must be a valid
    /// rank; `num_segments` and `num_ranks` must be positive.
    pub fn new(num_segments: usize, insert_point: usize, num_ranks: usize) -> Self {
        assert!(num_segments > 0 && num_ranks > 0);
        assert!(insert_point < num_ranks);
        Self {
            num_segments,
            insert_point,
            num_ranks,
        }
    }
}

impl EvictionPolicy for SlruPolicy {
    fn default_insert_rank(&self) -> usize {
        self.insert_point
    }

    fn insert_index(&self, rank: usize, num_entries: usize) -> usize {
        let rank = rank.min(self.num_ranks - 1);
        rank * num_entries / self.num_ranks
    }

    fn promotion_index(&self, current: usize, num_entries: usize) -> usize {
        if num_entries == 0 {
            return 0;
        }
        let segment = current * self.num_segments / num_entries;
        let target = segment.saturating_sub(1);
        target * num_entries / self.num_segments
    }

    fn eviction_candidate(&self, num_entries: usize) -> usize {
        num_entries.saturating_sub(1)
    }

    fn rank_for_index(&self, index: usize, num_entries: usize) -> usize {
        if num_entries == 0 {
            return 0;
        }
        (index * self.num_ranks / num_entries).min(self.num_ranks - 1)
    }
}

/// FIFO policy, used by the admission queue: insert at the head, evict the
/// tail, never promote.
#[derive(Debug, Clone, Default)]
pub struct FifoPolicy;

impl EvictionPolicy for FifoPolicy {
    fn default_insert_rank(&self) -> usize {
        0
    }

    fn insert_index(&self, _rank: usize, _num_entries: usize) -> usize {
        0
    }

    fn promotion_index(&self, current: usize, _num_entries: usize) -> usize {
        current
    }

    fn eviction_candidate(&self, num_entries: usize) -> usize {
        num_entries.saturating_sub(1)
    }

    fn rank_for_index(&self, _index: usize, _num_entries: usize) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slru_insert_index() {
        let policy = SlruPolicy::new(8, 4, 8);
        // Empty block: everything inserts at 0.
        assert_eq!(policy.insert_index(0, 0), 0);
        assert_eq!(policy.insert_index(7, 0), 0);
        // 80 entries, 8 ranks: rank r starts at r * 10.
        assert_eq!(policy.insert_index(0, 80), 0);
        assert_eq!(policy.insert_index(4, 80), 40);
        assert_eq!(policy.insert_index(7, 80), 70);
        // Rank clamped to the last segment.
        assert_eq!(policy.insert_index(99, 80), 70);
    }

    #[test]
    fn test_slru_promotion_one_segment_up() {
        let policy = SlruPolicy::new(8, 4, 8);
        // 128 entries, 8 segments of 16. Position 100 is in segment 6;
        // promotion moves it to the head of segment 5 = position 80.
        assert_eq!(policy.promotion_index(100, 128), 80);
        // Segment 0 stays at the head of segment 0.
        assert_eq!(policy.promotion_index(5, 128), 0);
        assert_eq!(policy.promotion_index(0, 128), 0);
    }

    #[test]
    fn test_slru_rank_for_index() {
        let policy = SlruPolicy::new(8, 4, 8);
        assert_eq!(policy.rank_for_index(0, 80), 0);
        assert_eq!(policy.rank_for_index(79, 80), 7);
        assert_eq!(policy.rank_for_index(40, 80), 4);
        // Single entry is the hottest.
        assert_eq!(policy.rank_for_index(0, 1), 0);
    }

    #[test]
    fn test_slru_eviction_candidate_is_tail() {
        let policy = SlruPolicy::new(8, 4, 8);
        assert_eq!(policy.eviction_candidate(10), 9);
        assert_eq!(policy.eviction_candidate(0), 0);
    }

    #[test]
    fn test_fifo() {
        let policy = FifoPolicy;
        assert_eq!(policy.insert_index(3, 50), 0);
        assert_eq!(policy.promotion_index(7, 50), 7);
        assert_eq!(policy.eviction_candidate(50), 49);
        assert_eq!(policy.rank_for_index(25, 50), 0);
    }
}
