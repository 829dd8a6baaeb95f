//! Bounded, sliding-window index of active blocks.
//!
//! Blocks are hashed by id into a power-of-two table. Each slot holds a
//! chain sorted by wrapping id order, linked through the blocks' own `next`
//! field. The buffer tracks the lowest and highest resident id and refuses
//! any insert that would stretch the window past `range_max` ids.
//!
//! # Design
//!
//! - **Ownership**: the buffer owns every resident block; `remove` hands
//!   the box back to the caller
//! - **Window**: `range == 0` iff empty, otherwise
//!   `range == (range_hi - range_lo) + 1 <= range_max`
//! - **Boundary repair**: removing the lowest or highest id probes the
//!   next `min(distance, table_size)` slots for the new boundary, falling
//!   back to the closest id seen on the way
//! - **Rejection**: an id exactly half the id space away from the window
//!   has no order and is refused
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. One session drives it at a time.

use crate::block::Block;
use crate::block_id::BlockId;
use crate::error::{BufferError, Result};
use tracing::{error, trace, warn};

/// Widest window whose ids still have a wrapping order
pub const MAX_RANGE: u32 = 1 << 31;

/// Where an id falls relative to the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Buffer is empty
    Empty,
    /// Inside `[range_lo, range_hi]`
    Within,
    /// This many ids below `range_lo`
    Below(u32),
    /// This many ids above `range_hi`
    Above(u32),
}

/// Hash-indexed window of active blocks.
#[derive(Debug)]
pub struct BlockBuffer {
    /// Chain heads, one per slot
    table: Vec<Option<Box<Block>>>,

    /// `table.len() - 1`
    hash_mask: u32,

    /// Maximum window width in ids
    range_max: u32,

    /// Current window width, 0 when empty
    range: u32,

    /// Lowest resident id
    range_lo: BlockId,

    /// Highest resident id
    range_hi: BlockId,

    /// Resident blocks
    count: usize,
}

impl BlockBuffer {
    /// Create an empty buffer.
    ///
    /// `table_size` is rounded up to the next power of two.
    ///
    /// # Errors
    /// - `BufferError::ZeroRange` / `BufferError::ZeroTableSize` for zero
    ///   inputs
    /// - `BufferError::RangeTooLarge` if `range_max` exceeds half the id space
    /// - `BufferError::AllocationFailed` if the table cannot be allocated
    pub fn new(range_max: u32, table_size: u32) -> Result<Self> {
        if range_max == 0 {
            return Err(BufferError::ZeroRange.into());
        }
        if range_max > MAX_RANGE {
            return Err(BufferError::RangeTooLarge {
                range_max,
                max: MAX_RANGE,
            }
            .into());
        }
        if table_size == 0 {
            return Err(BufferError::ZeroTableSize.into());
        }

        let slots = table_size
            .checked_next_power_of_two()
            .ok_or(BufferError::AllocationFailed {
                slots: table_size as usize,
            })?;
        let mut table = Vec::new();
        if table.try_reserve_exact(slots as usize).is_err() {
            error!(slots, "block buffer table allocation failed");
            return Err(BufferError::AllocationFailed {
                slots: slots as usize,
            }
            .into());
        }
        table.resize_with(slots as usize, || None);

        Ok(Self {
            table,
            hash_mask: slots - 1,
            range_max,
            range: 0,
            range_lo: BlockId::default(),
            range_hi: BlockId::default(),
            count: 0,
        })
    }

    fn slot(&self, id: BlockId) -> usize {
        (id.value() & self.hash_mask) as usize
    }

    /// True if `id` lies in `[range_lo, range_hi]` of a non-empty window.
    fn in_window(&self, id: BlockId) -> bool {
        self.range > 0 && id - self.range_lo <= self.range_hi - self.range_lo
    }

    fn placement(&self, id: BlockId) -> Option<Placement> {
        if self.range == 0 {
            Some(Placement::Empty)
        } else if id < self.range_lo {
            Some(Placement::Below(self.range_lo - id))
        } else if id > self.range_hi {
            Some(Placement::Above(id - self.range_hi))
        } else if self.in_window(id) {
            Some(Placement::Within)
        } else {
            None
        }
    }

    /// Window width after growing by `distance`, if it stays within
    /// `range_max`.
    fn grown(&self, distance: u32) -> Option<u32> {
        self.range
            .checked_add(distance)
            .filter(|&range| range <= self.range_max)
    }

    /// Look up a resident block.
    pub fn find(&self, id: BlockId) -> Option<&Block> {
        if !self.in_window(id) {
            return None;
        }
        let mut entry = self.table[self.slot(id)].as_deref();
        while let Some(block) = entry {
            if block.id() == id {
                return Some(block);
            }
            if block.id() > id {
                break;
            }
            entry = block.next.as_deref();
        }
        None
    }

    /// Look up a resident block for modification.
    pub fn find_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        if !self.in_window(id) {
            return None;
        }
        let index = self.slot(id);
        let mut entry = self.table[index].as_deref_mut();
        while let Some(block) = entry {
            if block.id() == id {
                return Some(block);
            }
            if block.id() > id {
                return None;
            }
            entry = block.next.as_deref_mut();
        }
        None
    }

    /// True if a block with `id` could be inserted without exceeding
    /// `range_max`.
    pub fn can_insert(&self, id: BlockId) -> bool {
        match self.placement(id) {
            Some(Placement::Empty | Placement::Within) => true,
            Some(Placement::Below(distance) | Placement::Above(distance)) => {
                self.grown(distance).is_some()
            }
            None => false,
        }
    }

    /// Insert a block, extending the window as needed.
    ///
    /// The block's id must not already be resident. A block that would
    /// stretch the window past `range_max`, or whose id has no order
    /// relative to the window, is handed back unchanged.
    pub fn insert(&mut self, mut block: Box<Block>) -> std::result::Result<(), Box<Block>> {
        let id = block.id();
        let Some(placement) = self.placement(id) else {
            trace!(block = %id, "insert rejected: id unordered against window");
            return Err(block);
        };

        match placement {
            Placement::Empty => {
                self.range_lo = id;
                self.range_hi = id;
                self.range = 1;
            }
            Placement::Within => {}
            Placement::Below(distance) => {
                let Some(range) = self.grown(distance) else {
                    trace!(block = %id, range = self.range, "insert rejected: window full");
                    return Err(block);
                };
                self.range_lo = id;
                self.range = range;
            }
            Placement::Above(distance) => {
                let Some(range) = self.grown(distance) else {
                    trace!(block = %id, range = self.range, "insert rejected: window full");
                    return Err(block);
                };
                self.range_hi = id;
                self.range = range;
            }
        }

        let index = self.slot(id);
        let mut cursor = &mut self.table[index];
        while cursor.as_ref().is_some_and(|entry| entry.id() < id) {
            if let Some(entry) = cursor {
                cursor = &mut entry.next;
            }
        }
        debug_assert!(
            cursor.as_ref().map_or(true, |entry| entry.id() != id),
            "block {id} inserted twice"
        );
        block.next = cursor.take();
        *cursor = Some(block);
        self.count += 1;
        Ok(())
    }

    /// Unlink the block with `id` and hand it back.
    ///
    /// Removing a window boundary moves that boundary to the nearest
    /// remaining id.
    pub fn remove(&mut self, id: BlockId) -> Option<Box<Block>> {
        if !self.in_window(id) {
            return None;
        }
        let index = self.slot(id);
        let mut cursor = &mut self.table[index];
        while cursor.as_ref().is_some_and(|entry| entry.id() < id) {
            if let Some(entry) = cursor {
                cursor = &mut entry.next;
            }
        }
        if !cursor.as_ref().is_some_and(|entry| entry.id() == id) {
            return None;
        }
        let mut block = cursor.take()?;
        *cursor = block.next.take();
        self.count -= 1;

        if self.range > 1 {
            if id == self.range_lo {
                self.range_lo = self.scan_forward(id);
            } else if id == self.range_hi {
                self.range_hi = self.scan_backward(id);
            }
            self.range = (self.range_hi - self.range_lo) + 1;
        } else {
            self.range = 0;
        }
        Some(block)
    }

    /// Remove the block at the low edge of the window.
    pub fn take_lowest(&mut self) -> Option<Box<Block>> {
        if self.range == 0 {
            return None;
        }
        self.remove(self.range_lo)
    }

    /// Smallest resident id above `from`, or `range_hi` if none is found
    /// within `table_size` probes.
    fn scan_forward(&self, from: BlockId) -> BlockId {
        let probes = (self.range_hi - from).min(self.table.len() as u32);
        let mut fallback = self.range_hi;
        let mut index = self.slot(from);
        for offset in 1..=probes {
            index = (index + 1) & self.hash_mask as usize;
            let probe = from.wrapping_add(offset);
            let mut entry = self.table[index].as_deref();
            while let Some(block) = entry {
                let candidate = block.id();
                if candidate == probe {
                    return probe;
                }
                if candidate > from && candidate < fallback {
                    fallback = candidate;
                }
                entry = block.next.as_deref();
            }
        }
        fallback
    }

    /// Largest resident id below `from`, or `range_lo` if none is found
    /// within `table_size` probes.
    fn scan_backward(&self, from: BlockId) -> BlockId {
        let probes = (from - self.range_lo).min(self.table.len() as u32);
        let mut fallback = self.range_lo;
        let mut index = self.slot(from);
        for offset in 1..=probes {
            index = index.wrapping_sub(1) & self.hash_mask as usize;
            let probe = from.wrapping_sub(offset);
            let mut entry = self.table[index].as_deref();
            while let Some(block) = entry {
                let candidate = block.id();
                if candidate == probe {
                    return probe;
                }
                if candidate < from && candidate > fallback {
                    fallback = candidate;
                }
                entry = block.next.as_deref();
            }
        }
        fallback
    }

    /// Iterate over resident blocks in ascending id order.
    ///
    /// Each call starts a fresh walk from `range_lo`.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            buffer: self,
            index: None,
        }
    }

    /// True if no block is resident.
    pub fn is_empty(&self) -> bool {
        self.range == 0
    }

    /// Resident block count.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Lowest resident id, if any.
    pub fn range_lo(&self) -> Option<BlockId> {
        (self.range > 0).then_some(self.range_lo)
    }

    /// Highest resident id, if any.
    pub fn range_hi(&self) -> Option<BlockId> {
        (self.range > 0).then_some(self.range_hi)
    }

    /// Current window width.
    pub fn range(&self) -> u32 {
        self.range
    }

    pub fn range_max(&self) -> u32 {
        self.range_max
    }

    /// Number of hash slots.
    pub fn table_size(&self) -> usize {
        self.table.len()
    }

    /// Release the table. Blocks still resident are dropped with their
    /// segments.
    pub fn destroy(&mut self) {
        if self.count > 0 {
            warn!(
                blocks = self.count,
                "block buffer destroyed while holding blocks"
            );
        }
        self.unlink_all();
        self.table = Vec::new();
    }

    fn unlink_all(&mut self) {
        for slot in &mut self.table {
            let mut next = slot.take();
            while let Some(mut block) = next {
                next = block.next.take();
            }
        }
        self.range = 0;
        self.count = 0;
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        self.unlink_all();
    }
}

/// Ascending-order iterator over a [`BlockBuffer`].
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    buffer: &'a BlockBuffer,

    /// Last id yielded; `None` before the first call
    index: Option<BlockId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<&'a Block> {
        let buffer = self.buffer;
        if buffer.range == 0 {
            return None;
        }
        let next = match self.index {
            None => buffer.range_lo,
            Some(current) => {
                if current == buffer.range_hi || !buffer.in_window(current) {
                    return None;
                }
                buffer.scan_forward(current)
            }
        };
        self.index = Some(next);
        buffer.find(next)
    }
}

impl<'a> IntoIterator for &'a BlockBuffer {
    type Item = &'a Block;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn block(id: u32) -> Box<Block> {
        let mut block = Box::new(Block::new(4).unwrap());
        block.rx_init(BlockId::new(id), 2, 2).unwrap();
        block
    }

    fn ids(buffer: &BlockBuffer) -> Vec<u32> {
        buffer.iter().map(|b| b.id().value()).collect()
    }

    #[test]
    fn test_window_grows_and_shrinks() {
        let mut buffer = BlockBuffer::new(8, 8).unwrap();
        for id in [10, 11, 12] {
            buffer.insert(block(id)).unwrap();
        }
        assert_eq!(buffer.range_lo(), Some(BlockId::new(10)));
        assert_eq!(buffer.range_hi(), Some(BlockId::new(12)));
        assert_eq!(buffer.range(), 3);

        // 17 makes the window exactly 8 wide; 18 would make it 9
        assert!(buffer.can_insert(BlockId::new(17)));
        assert!(!buffer.can_insert(BlockId::new(18)));
        assert!(!buffer.can_insert(BlockId::new(4)));

        assert!(buffer.remove(BlockId::new(10)).is_some());
        assert_eq!(buffer.range_lo(), Some(BlockId::new(11)));
        assert_eq!(buffer.range(), 2);

        assert!(buffer.remove(BlockId::new(12)).is_some());
        assert_eq!(buffer.range_hi(), Some(BlockId::new(11)));
        assert_eq!(buffer.range(), 1);

        assert!(buffer.remove(BlockId::new(11)).is_some());
        assert_eq!(buffer.range(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.range_lo(), None);
    }

    #[test]
    fn test_insert_rejects_and_returns_block() {
        let mut buffer = BlockBuffer::new(4, 4).unwrap();
        buffer.insert(block(100)).unwrap();

        let rejected = buffer.insert(block(104)).unwrap_err();
        assert_eq!(rejected.id(), BlockId::new(104));
        assert_eq!(buffer.range(), 1);
        assert_eq!(buffer.len(), 1);

        buffer.insert(block(103)).unwrap();
        buffer.insert(block(101)).unwrap();
        assert_eq!(buffer.range(), 4);
        assert_eq!(ids(&buffer), vec![100, 101, 103]);
    }

    #[test]
    fn test_half_range_id_rejected() {
        let mut buffer = BlockBuffer::new(u32::MAX, 4).unwrap();
        buffer.insert(block(0)).unwrap();

        assert!(!buffer.can_insert(BlockId::new(1 << 31)));
        assert!(buffer.insert(block(1 << 31)).is_err());
        assert!(buffer.find(BlockId::new(1 << 31)).is_none());
    }

    #[test]
    fn test_chain_kept_sorted_on_collision() {
        // Two slots: every even id shares slot 0
        let mut buffer = BlockBuffer::new(16, 2).unwrap();
        for id in [14, 10, 12] {
            buffer.insert(block(id)).unwrap();
        }

        assert_eq!(ids(&buffer), vec![10, 12, 14]);
        for id in [10, 12, 14] {
            assert_eq!(buffer.find(BlockId::new(id)).unwrap().id().value(), id);
        }
        assert!(buffer.find(BlockId::new(11)).is_none());

        assert!(buffer.remove(BlockId::new(12)).is_some());
        assert!(buffer.remove(BlockId::new(12)).is_none());
        assert_eq!(ids(&buffer), vec![10, 14]);
        assert_eq!(buffer.range(), 5);
    }

    #[test]
    fn test_boundary_repair_past_probe_limit() {
        // Gaps larger than the table force the fallback path
        let mut buffer = BlockBuffer::new(100, 4).unwrap();
        for id in [10, 30, 50] {
            buffer.insert(block(id)).unwrap();
        }

        buffer.remove(BlockId::new(10)).unwrap();
        assert_eq!(buffer.range_lo(), Some(BlockId::new(30)));
        assert_eq!(buffer.range(), 21);

        buffer.remove(BlockId::new(50)).unwrap();
        assert_eq!(buffer.range_hi(), Some(BlockId::new(30)));
        assert_eq!(buffer.range(), 1);
    }

    #[test]
    fn test_boundary_repair_by_probe() {
        let mut buffer = BlockBuffer::new(16, 8).unwrap();
        for id in [10, 15, 20] {
            buffer.insert(block(id)).unwrap();
        }

        buffer.remove(BlockId::new(20)).unwrap();
        assert_eq!(buffer.range_hi(), Some(BlockId::new(15)));
        buffer.remove(BlockId::new(10)).unwrap();
        assert_eq!(buffer.range_lo(), Some(BlockId::new(15)));
        assert_eq!(buffer.range(), 1);
    }

    #[test]
    fn test_window_across_wrap() {
        let mut buffer = BlockBuffer::new(8, 4).unwrap();
        for id in [1, u32::MAX, 0, u32::MAX - 1] {
            buffer.insert(block(id)).unwrap();
        }

        assert_eq!(buffer.range_lo(), Some(BlockId::new(u32::MAX - 1)));
        assert_eq!(buffer.range_hi(), Some(BlockId::new(1)));
        assert_eq!(buffer.range(), 4);
        assert_eq!(ids(&buffer), vec![u32::MAX - 1, u32::MAX, 0, 1]);

        let lowest = buffer.take_lowest().unwrap();
        assert_eq!(lowest.id().value(), u32::MAX - 1);
        assert_eq!(buffer.range_lo(), Some(BlockId::new(u32::MAX)));
    }

    #[test]
    fn test_find_mut_and_restartable_iter() {
        let mut buffer = BlockBuffer::new(8, 8).unwrap();
        for id in [3, 5] {
            buffer.insert(block(id)).unwrap();
        }

        buffer.find_mut(BlockId::new(5)).unwrap().set_erasure_count(0);
        assert_eq!(buffer.find(BlockId::new(5)).unwrap().erasure_count(), 0);
        assert!(buffer.find_mut(BlockId::new(4)).is_none());
        assert!(buffer.find_mut(BlockId::new(9)).is_none());

        let first: Vec<_> = (&buffer).into_iter().map(|b| b.id()).collect();
        let second: Vec<_> = buffer.iter().map(|b| b.id()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_table_size_rounded_up() {
        let buffer = BlockBuffer::new(8, 5).unwrap();
        assert_eq!(buffer.table_size(), 8);
        assert_eq!(buffer.iter().count(), 0);
    }

    #[test]
    fn test_zero_inputs_rejected() {
        assert!(matches!(
            BlockBuffer::new(0, 8),
            Err(Error::Buffer(BufferError::ZeroRange))
        ));
        assert!(matches!(
            BlockBuffer::new(8, 0),
            Err(Error::Buffer(BufferError::ZeroTableSize))
        ));
    }

    #[test]
    fn test_range_past_half_id_space_rejected() {
        assert!(matches!(
            BlockBuffer::new(MAX_RANGE + 1, 8),
            Err(Error::Buffer(BufferError::RangeTooLarge { range_max, max: MAX_RANGE }))
                if range_max == MAX_RANGE + 1
        ));
        assert!(matches!(
            BlockBuffer::new(u32::MAX, 8),
            Err(Error::Buffer(BufferError::RangeTooLarge { .. }))
        ));

        let mut buffer = BlockBuffer::new(MAX_RANGE, 8).unwrap();
        buffer.insert(block(0)).unwrap();
        assert!(buffer.can_insert(BlockId::new(MAX_RANGE - 1)));
    }

    #[test]
    fn test_destroy_drops_leftovers() {
        let mut buffer = BlockBuffer::new(8, 8).unwrap();
        buffer.insert(block(1)).unwrap();
        buffer.destroy();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }
}
