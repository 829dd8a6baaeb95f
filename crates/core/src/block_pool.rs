//! Free list of preallocated blocks.
//!
//! Blocks are chained through their `next` link while they sit in the pool.
//! Handing one out unlinks it, so a block is either in the pool or owned by
//! exactly one caller.
//!
//! # Thread Safety
//!
//! This structure is NOT thread-safe. One session drives it at a time.

use crate::block::Block;
use crate::error::{PoolError, Result};
use tracing::{error, warn};

/// Free-list allocator of equally sized blocks.
#[derive(Debug, Default)]
pub struct BlockPool {
    /// Head of the free list
    head: Option<Box<Block>>,

    /// Blocks currently on the free list
    count: usize,

    /// Blocks allocated at initialization
    total: usize,

    /// Transitions into exhaustion
    overruns: u64,

    /// Set while the pool is empty and the overrun has been counted
    overrun_flag: bool,
}

impl BlockPool {
    /// Preallocate `num_blocks` blocks of `total_size` segment slots each.
    ///
    /// # Errors
    /// - `PoolError::ZeroCount` / `PoolError::ZeroBlockSize` for zero inputs
    /// - `PoolError::AllocationFailed` if any block cannot be built; blocks
    ///   already built are released before returning
    pub fn new(num_blocks: usize, total_size: u16) -> Result<Self> {
        if num_blocks == 0 {
            return Err(PoolError::ZeroCount.into());
        }
        if total_size == 0 {
            return Err(PoolError::ZeroBlockSize.into());
        }

        let mut pool = Self::default();
        for allocated in 0..num_blocks {
            match Block::new(total_size) {
                Ok(block) => pool.put(Box::new(block)),
                Err(e) => {
                    error!(allocated, num_blocks, total_size, "block allocation failed: {e}");
                    // Dropping `pool` releases what was built so far
                    return Err(PoolError::AllocationFailed {
                        allocated,
                        requested: num_blocks,
                    }
                    .into());
                }
            }
        }
        pool.total = num_blocks;
        Ok(pool)
    }

    /// Unlink the head block, or `None` if the pool is empty.
    pub fn get(&mut self) -> Option<Box<Block>> {
        match self.head.take() {
            Some(mut block) => {
                self.head = block.next.take();
                self.count -= 1;
                self.overrun_flag = false;
                Some(block)
            }
            None => {
                if !self.overrun_flag {
                    warn!(total = self.total, "block pool exhausted");
                    self.overruns += 1;
                    self.overrun_flag = true;
                }
                None
            }
        }
    }

    /// Push a block back onto the free list.
    ///
    /// The block should hold no segments; any it still holds stay with it.
    pub fn put(&mut self, mut block: Box<Block>) {
        debug_assert!(block.next.is_none(), "block returned while still linked");
        debug_assert!(block.is_empty(), "block returned holding segments");
        block.next = self.head.take();
        self.head = Some(block);
        self.count += 1;
    }

    /// Release every pooled block.
    pub fn destroy(&mut self) {
        debug_assert_eq!(
            self.count, self.total,
            "block pool destroyed with {} blocks outstanding",
            self.total.saturating_sub(self.count)
        );
        self.unlink_all();
        self.total = 0;
    }

    // Iterative so a long free list cannot overflow the stack on drop
    fn unlink_all(&mut self) {
        let mut next = self.head.take();
        while let Some(mut block) = next {
            next = block.next.take();
        }
        self.count = 0;
    }

    /// Blocks currently available.
    pub fn len(&self) -> usize {
        self.count
    }

    /// True if no block is available.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Blocks allocated at initialization.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Blocks currently handed out.
    pub fn outstanding(&self) -> usize {
        self.total.saturating_sub(self.count)
    }

    /// Number of transitions into exhaustion.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        self.unlink_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_id::BlockId;
    use crate::error::Error;

    #[test]
    fn test_get_until_empty() {
        let mut pool = BlockPool::new(3, 8).unwrap();
        assert_eq!(pool.len(), 3);

        let held: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        assert!(pool.is_empty());
        assert_eq!(pool.outstanding(), 3);
        assert!(pool.get().is_none());
        assert_eq!(pool.overruns(), 1);

        for block in held {
            assert_eq!(block.size(), 8);
            pool.put(block);
        }
        assert_eq!(pool.len(), 3);
        pool.destroy();
        assert!(pool.is_empty());
        assert_eq!(pool.total(), 0);
    }

    #[test]
    fn test_put_then_get_is_lifo() {
        let mut pool = BlockPool::new(2, 4).unwrap();
        let mut a = pool.get().unwrap();
        let b = pool.get().unwrap();

        a.tx_init(BlockId::new(77), 2, 2, 0).unwrap();
        pool.put(b);
        pool.put(a);

        // Last returned comes out first
        assert_eq!(pool.get().unwrap().id(), BlockId::new(77));
    }

    #[test]
    fn test_zero_inputs_rejected() {
        assert!(matches!(
            BlockPool::new(0, 8),
            Err(Error::Pool(PoolError::ZeroCount))
        ));
        assert!(matches!(
            BlockPool::new(4, 0),
            Err(Error::Pool(PoolError::ZeroBlockSize))
        ));
    }

    #[test]
    fn test_large_pool_drops_without_recursion() {
        let pool = BlockPool::new(100_000, 1).unwrap();
        assert_eq!(pool.len(), 100_000);
        drop(pool);
    }
}
