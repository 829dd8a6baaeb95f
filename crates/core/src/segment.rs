//! Fixed-size segment buffers and the free-list pool that hands them out.
//!
//! A [`Segment`] is a uniformly sized byte buffer holding one data or parity
//! payload. Segments are move-only: whoever holds the value owns it, whether
//! that is a block slot or the pool's free list, so a segment can never be
//! referenced from two owners at once.
//!
//! # Pool lifecycle
//!
//! ```text
//! new(count, size)  -> preallocate `count` segments
//! get() / put()     -> steady state, no allocation
//! destroy()         -> drain; every segment must have been returned
//! ```
//!
//! Exhaustion is not an error. [`SegmentPool::get`] returns `None` and the
//! `overruns` counter is bumped once per contiguous empty period, which is
//! the signal for capacity tuning together with `peak_usage`.

use crate::error::{PoolError, Result};
use std::ops::{Deref, DerefMut};
use tracing::{error, warn};

/// Alignment unit for segment sizes (one pointer width)
const ALIGN: usize = std::mem::size_of::<usize>();

/// A fixed-size payload buffer owned by exactly one holder.
#[derive(Debug, PartialEq, Eq)]
pub struct Segment {
    buf: Box<[u8]>,
}

impl Segment {
    fn alloc(size: usize) -> Option<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0);
        Some(Self {
            buf: buf.into_boxed_slice(),
        })
    }

    /// Zero the first `len` bytes (clamped to the segment length).
    pub fn zero_prefix(&mut self, len: usize) {
        let end = len.min(self.buf.len());
        self.buf[..end].fill(0);
    }
}

impl Deref for Segment {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for Segment {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Round `size` up to a whole number of pointer-sized words.
pub fn aligned_size(size: usize) -> usize {
    size.div_ceil(ALIGN) * ALIGN
}

/// Snapshot of pool usage for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Segments allocated at initialization
    pub total: usize,

    /// Segments currently on the free list
    pub free: usize,

    /// High-water mark of segments handed out
    pub peak_usage: usize,

    /// Number of transitions into exhaustion
    pub overruns: u64,
}

impl PoolStats {
    /// Segments currently held outside the pool.
    pub fn outstanding(&self) -> usize {
        self.total - self.free
    }
}

/// Free-list allocator of uniformly sized segments.
///
/// # Invariants
/// - `free.len() + outstanding == total` at all times
/// - The free list never grows past its preallocated capacity
///
/// # Thread Safety
///
/// This structure is NOT thread-safe. One session drives it at a time.
#[derive(Debug, Default)]
pub struct SegmentPool {
    /// Aligned segment size in bytes
    seg_size: usize,

    /// Segments available for `get`
    free: Vec<Segment>,

    /// Segments allocated at initialization
    total: usize,

    /// High-water mark of `total - free.len()`
    peak_usage: usize,

    /// Transitions into exhaustion
    overruns: u64,

    /// Set while the pool is empty and the overrun has been counted
    overrun_flag: bool,
}

impl SegmentPool {
    /// Preallocate `count` segments of `size` bytes (rounded up to pointer
    /// alignment).
    ///
    /// # Errors
    /// - `PoolError::ZeroCount` / `PoolError::ZeroSegmentSize` for zero inputs
    /// - `PoolError::AllocationFailed` if any allocation fails; nothing is
    ///   kept in that case
    pub fn new(count: usize, size: usize) -> Result<Self> {
        if count == 0 {
            return Err(PoolError::ZeroCount.into());
        }
        if size == 0 {
            return Err(PoolError::ZeroSegmentSize.into());
        }

        let seg_size = aligned_size(size);
        let mut free = Vec::new();
        if free.try_reserve_exact(count).is_err() {
            error!(count, "segment pool free list allocation failed");
            return Err(PoolError::AllocationFailed {
                allocated: 0,
                requested: count,
            }
            .into());
        }

        for allocated in 0..count {
            match Segment::alloc(seg_size) {
                Some(segment) => free.push(segment),
                None => {
                    error!(allocated, count, seg_size, "segment allocation failed");
                    return Err(PoolError::AllocationFailed {
                        allocated,
                        requested: count,
                    }
                    .into());
                }
            }
        }

        Ok(Self {
            seg_size,
            free,
            total: count,
            peak_usage: 0,
            overruns: 0,
            overrun_flag: false,
        })
    }

    /// Take a segment off the free list.
    ///
    /// Returns `None` when the pool is exhausted. The first failed `get` of
    /// an empty period counts one overrun; later failures do not until a
    /// successful `get` ends the period.
    pub fn get(&mut self) -> Option<Segment> {
        match self.free.pop() {
            Some(segment) => {
                self.overrun_flag = false;
                let usage = self.total - self.free.len();
                if usage > self.peak_usage {
                    self.peak_usage = usage;
                }
                Some(segment)
            }
            None => {
                if !self.overrun_flag {
                    warn!(
                        total = self.total,
                        "segment pool exhausted: operating with constrained buffering resources"
                    );
                    self.overruns += 1;
                    self.overrun_flag = true;
                }
                None
            }
        }
    }

    /// Return a segment to the free list.
    ///
    /// The segment must have come from this pool.
    pub fn put(&mut self, segment: Segment) {
        debug_assert_eq!(segment.len(), self.seg_size, "foreign segment returned to pool");
        debug_assert!(self.free.len() < self.total, "more segments returned than allocated");
        self.free.push(segment);
    }

    /// Drain the pool and release its storage.
    ///
    /// Every outstanding segment must have been returned first.
    pub fn destroy(&mut self) {
        debug_assert_eq!(
            self.free.len(),
            self.total,
            "segment pool destroyed with {} segments outstanding",
            self.outstanding()
        );
        self.free = Vec::new();
        self.total = 0;
        self.seg_size = 0;
    }

    /// Aligned size of each segment.
    pub fn segment_size(&self) -> usize {
        self.seg_size
    }

    /// Segments allocated at initialization.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Segments currently available.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Segments currently handed out.
    pub fn outstanding(&self) -> usize {
        self.total - self.free.len()
    }

    /// True if no segment is available.
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// High-water mark of outstanding segments.
    pub fn peak_usage(&self) -> usize {
        self.peak_usage
    }

    /// Number of transitions into exhaustion.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Usage snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total,
            free: self.free.len(),
            peak_usage: self.peak_usage,
            overruns: self.overruns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_exhaustion_counts_one_overrun() {
        let mut pool = SegmentPool::new(4, 1400).unwrap();

        let mut held: Vec<_> = (0..4).map(|_| pool.get().unwrap()).collect();
        assert!(pool.get().is_none());
        assert_eq!(pool.overruns(), 1);

        // Still empty: no further overrun counted
        assert!(pool.get().is_none());
        assert_eq!(pool.overruns(), 1);

        // Put then get succeeds without touching the counter
        pool.put(held.pop().unwrap());
        let seg = pool.get().unwrap();
        assert_eq!(pool.overruns(), 1);
        held.push(seg);

        // A fresh empty period counts again
        assert!(pool.get().is_none());
        assert_eq!(pool.overruns(), 2);

        for seg in held {
            pool.put(seg);
        }
        pool.destroy();
    }

    #[test]
    fn test_segment_size_is_aligned() {
        let pool = SegmentPool::new(1, 1401).unwrap();
        assert_eq!(pool.segment_size() % ALIGN, 0);
        assert!(pool.segment_size() >= 1401);
        assert_eq!(aligned_size(ALIGN * 3), ALIGN * 3);
    }

    #[test]
    fn test_zero_inputs_rejected() {
        assert!(matches!(
            SegmentPool::new(0, 100),
            Err(Error::Pool(PoolError::ZeroCount))
        ));
        assert!(matches!(
            SegmentPool::new(10, 0),
            Err(Error::Pool(PoolError::ZeroSegmentSize))
        ));
    }

    #[test]
    fn test_peak_usage_and_conservation() {
        let mut pool = SegmentPool::new(8, 64).unwrap();

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let c = pool.get().unwrap();
        assert_eq!(pool.outstanding(), 3);
        assert_eq!(pool.free_count() + pool.outstanding(), pool.total());

        pool.put(a);
        pool.put(b);
        assert_eq!(pool.peak_usage(), 3);
        assert_eq!(pool.stats().outstanding(), 1);

        pool.put(c);
        assert_eq!(pool.free_count(), 8);
        pool.destroy();
        assert_eq!(pool.total(), 0);
    }

    #[test]
    fn test_zero_prefix() {
        let mut pool = SegmentPool::new(1, 16).unwrap();
        let mut seg = pool.get().unwrap();
        seg.fill(0xAB);

        seg.zero_prefix(4);
        assert_eq!(&seg[..4], &[0, 0, 0, 0]);
        assert_eq!(seg[4], 0xAB);

        // Clamped to the segment length
        seg.zero_prefix(1000);
        assert!(seg.iter().all(|&b| b == 0));
        pool.put(seg);
    }
}
