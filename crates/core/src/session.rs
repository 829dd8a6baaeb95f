//! Per-session bundle of segment pool, block pool and block buffer.
//!
//! All memory a session will ever use is allocated in [`Session::new`].
//! After that, blocks cycle between the pool and the buffer:
//!
//! ```text
//! blocks.get() -> tx_init/rx_init -> buffer.insert()     FREE -> ACTIVE
//! release(id)  -> buffer.remove() -> empty_to_pool -> put ACTIVE -> FREE
//! ```

use crate::block::{Block, STREAM_PAYLOAD_HEADER_LEN};
use crate::block_buffer::BlockBuffer;
use crate::block_id::BlockId;
use crate::block_pool::BlockPool;
use crate::error::{Error, Result};
use crate::repair::{ITEM_SIZE, REQUEST_HEADER_SIZE};
use crate::segment::SegmentPool;
use tracing::debug;

/// Smallest segment size that still carries one repair range.
pub const MIN_SEGMENT_SIZE: u16 = (REQUEST_HEADER_SIZE + 2 * ITEM_SIZE) as u16;

/// Session sizing. Every field is caller-supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Payload bytes per segment; also the repair message budget
    pub segment_size: u16,

    /// Segments preallocated in the segment pool
    pub segment_count: usize,

    /// Data segments per block
    pub num_data: u16,

    /// Parity segments per block
    pub num_parity: u16,

    /// Parity segments sent proactively with each block
    pub auto_parity: u16,

    /// Blocks preallocated in the block pool
    pub block_count: usize,

    /// Maximum block buffer window in ids
    pub window: u32,

    /// Block buffer hash slots (rounded up to a power of two)
    pub table_size: u32,
}

impl SessionConfig {
    /// Segment slots per block.
    pub fn block_size(&self) -> u16 {
        self.num_data.saturating_add(self.num_parity)
    }

    /// Check the configuration before anything is allocated.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("segment_size", self.segment_size as u64),
            ("segment_count", self.segment_count as u64),
            ("num_data", self.num_data as u64),
            ("block_count", self.block_count as u64),
            ("window", self.window as u64),
            ("table_size", self.table_size as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{name} must be non-zero")));
        }
        if self.num_data.checked_add(self.num_parity).is_none() {
            return Err(Error::Config(format!(
                "num_data + num_parity ({} + {}) exceeds {}",
                self.num_data,
                self.num_parity,
                u16::MAX
            )));
        }
        if self.auto_parity > self.num_parity {
            return Err(Error::Config(format!(
                "auto_parity ({}) exceeds num_parity ({})",
                self.auto_parity, self.num_parity
            )));
        }
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::Config(format!(
                "segment_size ({}) must be at least {MIN_SEGMENT_SIZE}",
                self.segment_size
            )));
        }
        Ok(())
    }
}

/// Pools and buffer for one sender or receiver.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,

    /// Segment storage
    pub segments: SegmentPool,

    /// Idle blocks
    pub blocks: BlockPool,

    /// Active blocks
    pub buffer: BlockBuffer,
}

impl Session {
    /// Validate `config` and allocate everything the session needs.
    ///
    /// On failure nothing stays allocated.
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let segments = SegmentPool::new(
            config.segment_count,
            config.segment_size as usize + STREAM_PAYLOAD_HEADER_LEN,
        )?;
        let blocks = BlockPool::new(config.block_count, config.block_size())?;
        let buffer = BlockBuffer::new(config.window, config.table_size)?;

        debug!(
            segments = config.segment_count,
            blocks = config.block_count,
            window = config.window,
            "session initialized"
        );
        Ok(Self {
            config,
            segments,
            blocks,
            buffer,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Return a block that is not in the buffer to the pools.
    pub fn recycle(&mut self, mut block: Box<Block>) {
        block.empty_to_pool(&mut self.segments);
        self.blocks.put(block);
    }

    /// Retire an active block: remove it from the buffer and return it and
    /// its segments to the pools.
    ///
    /// Returns `false` if no block with `id` is active.
    pub fn release(&mut self, id: BlockId) -> bool {
        match self.buffer.remove(id) {
            Some(block) => {
                self.recycle(block);
                true
            }
            None => false,
        }
    }

    /// Drain every active block and release all storage.
    pub fn destroy(&mut self) {
        while let Some(block) = self.buffer.take_lowest() {
            self.recycle(block);
        }
        self.buffer.destroy();
        self.blocks.destroy();
        self.segments.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig {
            segment_size: 64,
            segment_count: 16,
            num_data: 4,
            num_parity: 2,
            auto_parity: 1,
            block_count: 4,
            window: 8,
            table_size: 8,
        }
    }

    #[test]
    fn test_validate_rejects_bad_config() {
        assert!(config().validate().is_ok());

        let cases = [
            SessionConfig {
                num_data: 0,
                ..config()
            },
            SessionConfig {
                window: 0,
                ..config()
            },
            SessionConfig {
                auto_parity: 3,
                ..config()
            },
            SessionConfig {
                num_data: u16::MAX,
                ..config()
            },
            SessionConfig {
                segment_size: MIN_SEGMENT_SIZE - 1,
                ..config()
            },
        ];
        for case in cases {
            assert!(matches!(case.validate(), Err(Error::Config(_))), "{case:?}");
        }
    }

    #[test]
    fn test_release_returns_everything() {
        let mut session = Session::new(config()).unwrap();

        let mut block = session.blocks.get().unwrap();
        block.tx_init(BlockId::new(1), 4, 2, 1).unwrap();
        for id in 0..4 {
            let segment = session.segments.get().unwrap();
            block.attach_segment(id, segment);
        }
        session.buffer.insert(block).unwrap();
        assert_eq!(session.segments.outstanding(), 4);
        assert_eq!(session.blocks.outstanding(), 1);

        assert!(session.release(BlockId::new(1)));
        assert!(!session.release(BlockId::new(1)));
        assert_eq!(session.segments.outstanding(), 0);
        assert_eq!(session.blocks.outstanding(), 0);
        assert!(session.buffer.is_empty());
        session.destroy();
    }

    #[test]
    fn test_destroy_drains_active_blocks() {
        let mut session = Session::new(config()).unwrap();
        for id in 0..3 {
            let mut block = session.blocks.get().unwrap();
            block.rx_init(BlockId::new(id), 4, 2).unwrap();
            let segment = session.segments.get().unwrap();
            block.attach_segment(0, segment);
            session.buffer.insert(block).unwrap();
        }

        session.destroy();
        assert_eq!(session.segments.total(), 0);
        assert_eq!(session.blocks.total(), 0);
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn test_segment_size_includes_payload_header() {
        let session = Session::new(config()).unwrap();
        assert!(session.segments.segment_size() >= 64 + STREAM_PAYLOAD_HEADER_LEN);
        assert_eq!(session.config().block_size(), 6);
    }
}
