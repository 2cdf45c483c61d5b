//! Free-list over fixed-size blocks, tracked as sorted half-open ranges.

/// A half-open span `[start, end)` of block indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// First block.
    pub start: u32,
    /// One past the last block.
    pub end: u32,
}

impl BlockSpan {
    #[inline]
    fn len(&self) -> u32 {
        self.end - self.start
    }
}

/// Tracks which blocks of a buffer are free and which are in use.
///
/// Both lists are kept sorted by start index. Freed ranges merge with
/// adjacent free neighbours, so there is never more than one free range
/// between two used ones. The number of used ranges is capped at
/// `max_ranges`; both vectors are sized up front and never grow.
pub struct BlockRange {
    free: Vec<BlockSpan>,
    used: Vec<BlockSpan>,
    max_ranges: usize,
    block_count: u32,
}

impl BlockRange {
    /// Create a tracker over `block_count` free blocks.
    pub fn new(block_count: u32, max_ranges: usize) -> Self {
        let mut free = Vec::with_capacity(max_ranges + 1);
        if block_count > 0 {
            free.push(BlockSpan {
                start: 0,
                end: block_count,
            });
        }
        Self {
            free,
            used: Vec::with_capacity(max_ranges),
            max_ranges,
            block_count,
        }
    }

    /// Reserve `count` contiguous blocks, first fit.
    ///
    /// Returns the first block index, or `None` if no free range is large
    /// enough or the used-range limit is reached.
    pub fn request(&mut self, count: u32) -> Option<u32> {
        if count == 0 || self.used.len() >= self.max_ranges {
            return None;
        }

        let index = self.free.iter().position(|span| span.len() >= count)?;
        let start = self.free[index].start;
        if self.free[index].len() == count {
            self.free.remove(index);
        } else {
            self.free[index].start += count;
        }

        let position = self.used.partition_point(|span| span.start < start);
        self.used.insert(
            position,
            BlockSpan {
                start,
                end: start + count,
            },
        );
        Some(start)
    }

    /// Release the used range starting at `start`.
    ///
    /// Returns `false` if no used range starts there.
    pub fn free(&mut self, start: u32) -> bool {
        let Ok(index) = self.used.binary_search_by_key(&start, |span| span.start) else {
            return false;
        };
        let span = self.used.remove(index);
        self.insert_free(span);
        true
    }

    /// Grow or shrink the used range at `start` to `new_count` blocks
    /// without moving it.
    ///
    /// Growing succeeds only if a free range begins right after the block
    /// and is large enough. Returns the (unchanged) start on success.
    pub fn reallocate_block(&mut self, start: u32, new_count: u32) -> Option<u32> {
        if new_count == 0 {
            return None;
        }
        let index = self.used.binary_search_by_key(&start, |span| span.start).ok()?;
        let current = self.used[index];
        let new_end = start.checked_add(new_count)?;

        if new_end <= current.end {
            if new_end < current.end {
                self.used[index].end = new_end;
                self.insert_free(BlockSpan {
                    start: new_end,
                    end: current.end,
                });
            }
            return Some(start);
        }

        let next = self.free.binary_search_by_key(&current.end, |span| span.start).ok()?;
        if self.free[next].end < new_end {
            return None;
        }
        if self.free[next].end == new_end {
            self.free.remove(next);
        } else {
            self.free[next].start = new_end;
        }
        self.used[index].end = new_end;
        Some(start)
    }

    /// Length in blocks of the used range starting at `start`.
    pub fn block_len(&self, start: u32) -> Option<u32> {
        self.used
            .binary_search_by_key(&start, |span| span.start)
            .ok()
            .map(|index| self.used[index].len())
    }

    /// Release every range.
    pub fn clear(&mut self) {
        self.used.clear();
        self.free.clear();
        if self.block_count > 0 {
            self.free.push(BlockSpan {
                start: 0,
                end: self.block_count,
            });
        }
    }

    /// Whether no block is in use.
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Number of blocks currently in use.
    pub fn used_block_count(&self) -> u64 {
        self.used.iter().map(|span| u64::from(span.len())).sum()
    }

    /// Number of live used ranges.
    pub fn used_range_count(&self) -> usize {
        self.used.len()
    }

    /// Number of free ranges.
    pub fn free_range_count(&self) -> usize {
        self.free.len()
    }

    /// Total number of blocks tracked.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Maximum number of simultaneously used ranges.
    pub fn max_ranges(&self) -> usize {
        self.max_ranges
    }

    fn insert_free(&mut self, span: BlockSpan) {
        let position = self.free.partition_point(|free| free.start < span.start);
        let merges_prev = position > 0 && self.free[position - 1].end == span.start;
        let merges_next = position < self.free.len() && self.free[position].start == span.end;

        match (merges_prev, merges_next) {
            (true, true) => {
                self.free[position - 1].end = self.free[position].end;
                self.free.remove(position);
            }
            (true, false) => self.free[position - 1].end = span.end,
            (false, true) => self.free[position].start = span.start,
            (false, false) => self.free.insert(position, span),
        }
    }
}

impl std::fmt::Debug for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRange")
            .field("block_count", &self.block_count)
            .field("used_ranges", &self.used.len())
            .field("free_ranges", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_first_fit() {
        let mut range = BlockRange::new(100, 8);
        assert_eq!(range.request(10), Some(0));
        assert_eq!(range.request(20), Some(10));
        assert_eq!(range.used_block_count(), 30);
        assert_eq!(range.request(71), None);
        assert_eq!(range.request(70), Some(30));
        assert_eq!(range.free_range_count(), 0);
    }

    #[test]
    fn test_free_merges_neighbours() {
        let mut range = BlockRange::new(30, 8);
        let a = range.request(10).unwrap();
        let b = range.request(10).unwrap();
        let c = range.request(10).unwrap();

        assert!(range.free(a));
        assert!(range.free(c));
        assert_eq!(range.free_range_count(), 2);

        // Freeing the middle block joins everything into one range.
        assert!(range.free(b));
        assert_eq!(range.free_range_count(), 1);
        assert!(range.is_empty());
        assert_eq!(range.request(30), Some(0));
    }

    #[test]
    fn test_free_unknown_start() {
        let mut range = BlockRange::new(10, 4);
        let a = range.request(4).unwrap();
        assert!(!range.free(a + 1));
        assert!(range.free(a));
        assert!(!range.free(a));
    }

    #[test]
    fn test_reused_hole() {
        let mut range = BlockRange::new(30, 8);
        let a = range.request(10).unwrap();
        let _b = range.request(10).unwrap();
        assert!(range.free(a));
        // First fit lands in the hole left by `a`.
        assert_eq!(range.request(5), Some(0));
        assert_eq!(range.request(5), Some(5));
        assert_eq!(range.request(5), Some(20));
    }

    #[test]
    fn test_max_ranges() {
        let mut range = BlockRange::new(100, 2);
        assert!(range.request(1).is_some());
        assert!(range.request(1).is_some());
        assert_eq!(range.request(1), None);
    }

    #[test]
    fn test_reallocate_in_place() {
        let mut range = BlockRange::new(50, 8);
        let a = range.request(10).unwrap();

        // Grow into the free tail.
        assert_eq!(range.reallocate_block(a, 20), Some(a));
        assert_eq!(range.block_len(a), Some(20));

        // Shrink releases the tail.
        assert_eq!(range.reallocate_block(a, 5), Some(a));
        assert_eq!(range.block_len(a), Some(5));
        assert_eq!(range.used_block_count(), 5);
        assert_eq!(range.free_range_count(), 1);

        // Blocked by a neighbour.
        let b = range.request(5).unwrap();
        assert_eq!(b, 5);
        assert_eq!(range.reallocate_block(a, 6), None);
        assert_eq!(range.block_len(a), Some(5));
    }

    #[test]
    fn test_clear() {
        let mut range = BlockRange::new(16, 4);
        range.request(4);
        range.request(4);
        range.clear();
        assert!(range.is_empty());
        assert_eq!(range.request(16), Some(0));
    }
}
