//! nackfec-core: segment and block management for NACK-based FEC transport
//!
//! This library provides the buffering core of a reliable multicast sender
//! and receiver:
//! - Preallocated pools of fixed-size segments and FEC coding blocks
//! - A bounded sliding window of active blocks keyed by wrapping block id
//! - Per-block pending/repair bookkeeping that decides which data and
//!   parity segments to request or retransmit
//! - Compact ITEMS/RANGES encoding of repair requests
//!
//! # Architecture
//!
//! - `block_id`: Wrapping 32-bit block sequence numbers
//! - `bitmask`: Fixed-size bit vectors
//! - `segment`: Segment buffers and the segment pool
//! - `block`: FEC blocks and repair negotiation
//! - `block_pool`: Free list of preallocated blocks
//! - `block_buffer`: Hash-indexed window of active blocks
//! - `repair`: Repair descriptors, packer trait and wire packer
//! - `session`: Session configuration and resource bundle
//! - `metrics`: Observable session behavior
//!
//! # Design Principles
//!
//! - **No allocation after init**: every buffer is sized up front
//! - **Scarcity is not an error**: exhausted pools return `None`
//! - **Single owner**: segments and blocks move between pool, buffer and
//!   caller; nothing is shared
//! - **Single-threaded**: one caller drives a session at a time

pub mod bitmask;
pub mod block;
pub mod block_buffer;
pub mod block_id;
pub mod block_pool;
pub mod error;
pub mod metrics;
pub mod repair;
pub mod segment;
pub mod session;

// Re-export commonly used types
pub use block::{Block, SegmentId};
pub use block_buffer::BlockBuffer;
pub use block_id::BlockId;
pub use block_pool::BlockPool;
pub use error::{Error, Result};
pub use repair::{RepairFlags, RepairForm, RepairMessage, RepairPacker, RepairRequest};
pub use segment::{Segment, SegmentPool};
pub use session::{Session, SessionConfig};
