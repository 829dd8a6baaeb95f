//! Wrapping block sequence numbers.
//!
//! Block ids are 32-bit serial numbers that wrap. Ordering is defined on the
//! signed difference of two ids, so a window that straddles `u32::MAX -> 0`
//! still compares correctly as long as it spans less than half the id space.
//!
//! Two ids exactly `2^31` apart have no defined order: `partial_cmp` returns
//! `None` and both `<` and `>` are false. The block buffer treats such ids as
//! malformed.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Sub;

/// Distance at which ordering becomes ambiguous.
const HALF_RANGE: u32 = 1 << 31;

/// A wrapping block identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

impl BlockId {
    /// Wrap a raw value.
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Raw 32-bit value.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// The id `n` steps after this one, modulo the id space.
    pub const fn wrapping_add(self, n: u32) -> Self {
        Self(self.0.wrapping_add(n))
    }

    /// The id `n` steps before this one, modulo the id space.
    pub const fn wrapping_sub(self, n: u32) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Signed distance `self - other`.
    pub const fn delta(self, other: BlockId) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }
}

impl PartialOrd for BlockId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.0.wrapping_sub(other.0) {
            0 => Some(Ordering::Equal),
            HALF_RANGE => None,
            diff if diff > HALF_RANGE => Some(Ordering::Less),
            _ => Some(Ordering::Greater),
        }
    }
}

/// Forward distance from `rhs` to `self`, modulo the id space.
impl Sub for BlockId {
    type Output = u32;

    fn sub(self, rhs: BlockId) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl From<u32> for BlockId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<BlockId> for u32 {
    fn from(id: BlockId) -> Self {
        id.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
