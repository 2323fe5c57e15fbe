//! Eviction policies decide which rankings list a new or touched
//! entry belongs on, and which list to evict from first.
//!
//! Under [`EvictionMode::Lru`], everything lives on the `NoUse` list
//! and eviction is plain least-recently-used.  Under
//! [`EvictionMode::TwoList`], entries that were opened again after
//! creation graduate to the `Reused` list.  One-hit wonders are then
//! evicted first, but never all of them: once `NoUse` shrinks to a
//! tenth of all entries, eviction moves on to `Reused`.
//!
//! Memory caches also evict below their maximum size when the system
//! reports [`MemoryPressure`].
use crate::rankings::List;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionMode {
    /// Single list, least recently used first.
    Lru,
    /// Two lists; prefer evicting entries that were never reused.
    TwoList,
}

impl Default for EvictionMode {
    fn default() -> EvictionMode {
        EvictionMode::Lru
    }
}

impl EvictionMode {
    /// Returns the list for an entry that has been reopened
    /// `reuse_count` times.
    pub(crate) fn list_for(self, reuse_count: u32) -> List {
        match self {
            EvictionMode::Lru => List::NoUse,
            EvictionMode::TwoList if reuse_count > 0 => List::Reused,
            EvictionMode::TwoList => List::NoUse,
        }
    }

    /// Returns the list to evict from first, given the current list
    /// lengths.  Eviction continues with the [`List::other`] list once
    /// this one is exhausted.
    pub(crate) fn select_list(self, no_use: usize, reused: usize) -> List {
        match self {
            EvictionMode::Lru => List::NoUse,
            EvictionMode::TwoList => {
                let total = no_use + reused;
                if no_use > total / 10 {
                    List::NoUse
                } else if reused > 0 {
                    List::Reused
                } else {
                    List::NoUse
                }
            }
        }
    }
}

/// How urgently the system wants memory back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryPressure {
    /// Trim to half the maximum size.
    Moderate,
    /// Trim to a tenth of the maximum size.
    Critical,
}

impl MemoryPressure {
    /// Returns the size a cache with `max_size` should trim itself to.
    pub(crate) fn target_size(self, max_size: u64) -> u64 {
        match self {
            MemoryPressure::Moderate => max_size / 2,
            MemoryPressure::Critical => max_size / 10,
        }
    }
}
