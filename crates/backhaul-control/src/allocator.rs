//! Channel ID allocation

use backhaul_proto::ChannelId;
use std::sync::atomic::{AtomicU32, Ordering};

/// Channel 0 is never handed out
const RESERVED_CHANNEL_ID: ChannelId = 0;

/// Candidates tried before allocation gives up
pub const MAX_ALLOCATION_ATTEMPTS: usize = 1024;

/// Monotonic channel ID counter for one control connection
///
/// The counter wraps on overflow. IDs still in use are skipped, so an ID is
/// only handed out again once its previous channel has been released.
#[derive(Debug)]
pub struct ChannelIdAllocator {
    next: AtomicU32,
}

impl ChannelIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: ChannelId) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Next free ID, or `None` if every candidate tried was in use
    pub fn next<F>(&self, in_use: F) -> Option<ChannelId>
    where
        F: Fn(ChannelId) -> bool,
    {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = self.next.fetch_add(1, Ordering::Relaxed);
            if candidate == RESERVED_CHANNEL_ID || in_use(candidate) {
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

impl Default for ChannelIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_sequential_from_one() {
        let allocator = ChannelIdAllocator::new();
        assert_eq!(allocator.next(|_| false), Some(1));
        assert_eq!(allocator.next(|_| false), Some(2));
        assert_eq!(allocator.next(|_| false), Some(3));
    }

    #[test]
    fn test_wraps_and_skips_reserved_id() {
        let allocator = ChannelIdAllocator::starting_at(u32::MAX);
        assert_eq!(allocator.next(|_| false), Some(u32::MAX));
        assert_eq!(allocator.next(|_| false), Some(1));
    }

    #[test]
    fn test_skips_ids_in_use() {
        let allocator = ChannelIdAllocator::new();
        let in_use: HashSet<u32> = [1, 2, 4].into_iter().collect();
        assert_eq!(allocator.next(|id| in_use.contains(&id)), Some(3));
        assert_eq!(allocator.next(|id| in_use.contains(&id)), Some(5));
    }

    #[test]
    fn test_gives_up_when_everything_is_in_use() {
        let allocator = ChannelIdAllocator::new();
        assert_eq!(allocator.next(|_| true), None);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let allocator = std::sync::Arc::new(ChannelIdAllocator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|_| allocator.next(|_| false).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate channel ID {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
