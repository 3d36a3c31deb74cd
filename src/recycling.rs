//! Victim-segment selection for the scavenger.

use crate::storage::segment::SegmentInfo;

/// Chooses which sealed segment the scavenger recycles next.
pub trait RecyclingSelector: Send + Sync {
    /// Pick a victim among sealed segments. `now` is epoch milliseconds.
    fn select(&self, candidates: &[SegmentInfo], now: u64) -> Option<u16>;
}

/// Built-in selectors plus the custom registration hook.
pub enum RecyclingSelectorKind {
    /// Fewest alive items first (default).
    MinAlive,
    /// Oldest segment first.
    Lrc,
    /// Caller-provided selector.
    Custom(Box<dyn RecyclingSelector>),
}

impl RecyclingSelectorKind {
    /// Materialize the selector.
    pub fn build(self) -> Box<dyn RecyclingSelector> {
        match self {
            RecyclingSelectorKind::MinAlive => Box::new(MinAliveSelector),
            RecyclingSelectorKind::Lrc => Box::new(LrcSelector),
            RecyclingSelectorKind::Custom(selector) => selector,
        }
    }
}

impl Default for RecyclingSelectorKind {
    fn default() -> Self {
        RecyclingSelectorKind::MinAlive
    }
}

/// Selects the sealed segment with the fewest alive items. A segment whose
/// items have all expired (`max_expire_at` in the past) is taken
/// immediately.
#[derive(Debug, Clone, Default)]
pub struct MinAliveSelector;

impl RecyclingSelector for MinAliveSelector {
    fn select(&self, candidates: &[SegmentInfo], now: u64) -> Option<u16> {
        let mut best: Option<&SegmentInfo> = None;
        for info in candidates {
            if info.max_expire_at > 0 && now > info.max_expire_at {
                return Some(info.id);
            }
            if best
                .map(|b| info.total_active_items < b.total_active_items)
                .unwrap_or(true)
            {
                best = Some(info);
            }
        }
        best.map(|info| info.id)
    }
}

/// Least-recently-created: recycles the oldest sealed segment, with the
/// same all-expired fast path.
#[derive(Debug, Clone, Default)]
pub struct LrcSelector;

impl RecyclingSelector for LrcSelector {
    fn select(&self, candidates: &[SegmentInfo], now: u64) -> Option<u16> {
        let mut best: Option<&SegmentInfo> = None;
        for info in candidates {
            if info.max_expire_at > 0 && now > info.max_expire_at {
                return Some(info.id);
            }
            if best
                .map(|b| info.creation_time < b.creation_time)
                .unwrap_or(true)
            {
                best = Some(info);
            }
        }
        best.map(|info| info.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::SegmentState;

    fn info(id: u16, active: u32, max_expire: u64, created: u64) -> SegmentInfo {
        SegmentInfo {
            id,
            total_items: active + 5,
            total_active_items: active,
            used_bytes: 1024,
            max_expire_at: max_expire,
            creation_time: created,
            state: SegmentState::Sealed,
        }
    }

    #[test]
    fn test_min_alive_picks_fewest_active() {
        let selector = MinAliveSelector;
        let candidates = vec![info(1, 50, 0, 10), info(2, 3, 0, 20), info(3, 40, 0, 30)];
        assert_eq!(selector.select(&candidates, 1000), Some(2));
    }

    #[test]
    fn test_min_alive_prefers_fully_expired() {
        let selector = MinAliveSelector;
        // Segment 3 has more active items but everything in it is expired.
        let candidates = vec![info(1, 3, 0, 10), info(3, 40, 500, 30)];
        assert_eq!(selector.select(&candidates, 1000), Some(3));
        // Not expired yet: fall back to min-alive.
        assert_eq!(selector.select(&candidates, 100), Some(1));
    }

    #[test]
    fn test_min_alive_empty() {
        assert_eq!(MinAliveSelector.select(&[], 0), None);
    }

    #[test]
    fn test_lrc_picks_oldest() {
        let selector = LrcSelector;
        let candidates = vec![info(1, 1, 0, 300), info(2, 9, 0, 100), info(3, 5, 0, 200)];
        assert_eq!(selector.select(&candidates, 1000), Some(2));
    }
}
