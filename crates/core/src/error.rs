//! Error types for the FEC block engine.
//!
//! Only two things can go wrong at runtime: an allocation made while a pool,
//! block or buffer is being initialized fails, or a repair message runs out
//! of room. Both come back as structured errors. Pool exhaustion during
//! steady state is not an error at all; it shows up as `None` from
//! [`SegmentPool::get`](crate::segment::SegmentPool::get) plus an overrun
//! counter.

use thiserror::Error;

/// Top-level error type for all fallible engine operations.
///
/// Each variant corresponds to a specific failure domain:
/// - Pool: segment or block pool initialization
/// - Block: block allocation or inconsistent FEC geometry
/// - Buffer: block buffer (sliding window) initialization
/// - Repair: repair request packing or decoding
/// - Config: invalid session configuration
#[derive(Debug, Error)]
pub enum Error {
    /// Segment or block pool could not be initialized
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Block could not be initialized or was given inconsistent geometry
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// Block buffer could not be initialized
    #[error("block buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Repair request packing or parsing failed
    #[error("repair request error: {0}")]
    Repair(#[from] RepairError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

/// Segment pool and block pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Pools must hold at least one item
    #[error("pool count must be greater than zero")]
    ZeroCount,

    /// Segments must be at least one byte
    #[error("segment size must be greater than zero")]
    ZeroSegmentSize,

    /// Blocks must have at least one segment slot
    #[error("block size must be greater than zero")]
    ZeroBlockSize,

    /// Preallocation failed partway through
    #[error("allocation failed after {allocated} of {requested} items")]
    AllocationFailed { allocated: usize, requested: usize },
}

/// Block errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// A block needs at least one segment slot
    #[error("block size must be greater than zero")]
    ZeroSize,

    /// Segment table or bitmask allocation failed
    #[error("{what} allocation failed for {size} segments")]
    AllocationFailed { what: &'static str, size: u16 },

    /// Data plus parity does not fit the block, or auto parity exceeds parity
    #[error("invalid geometry: {num_data} data + {num_parity} parity (auto {auto_parity}) in block of {size}")]
    InvalidGeometry {
        num_data: u16,
        num_parity: u16,
        auto_parity: u16,
        size: u16,
    },
}

/// Block buffer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The window must span at least one block id
    #[error("range_max must be greater than zero")]
    ZeroRange,

    /// Wider windows have no defined wrapping order
    #[error("range_max ({range_max}) exceeds {max}")]
    RangeTooLarge { range_max: u32, max: u32 },

    /// The hash table needs at least one slot
    #[error("table size must be greater than zero")]
    ZeroTableSize,

    /// Hash table allocation failed
    #[error("hash table allocation failed for {slots} slots")]
    AllocationFailed { slots: usize },
}

/// Repair request packing and decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    /// Message budget exhausted
    #[error("repair message full: need {needed} bytes, {available} available")]
    MessageFull { needed: usize, available: usize },

    /// Append or pack called with no descriptor attached
    #[error("no repair request attached")]
    NotAttached,

    /// Descriptor header truncated
    #[error("repair request too short: need at least {required} bytes, got {actual}")]
    RequestTooShort { required: usize, actual: usize },

    /// Unknown form code on the wire
    #[error("invalid repair request form {0}")]
    InvalidForm(u8),

    /// Item bytes not a whole number of items or inconsistent with the form
    #[error("repair request length {length} invalid for form {form}")]
    LengthMismatch { form: u8, length: usize },
}

/// Type alias for Result with our Error type
pub type Result<T> = std::result::Result<T, Error>;
