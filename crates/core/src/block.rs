//! FEC coding blocks and the repair negotiation algorithms.
//!
//! A block is one coding unit: `size` segment slots, data first
//! (`[0, num_data)`) then parity (`[num_data, num_data + num_parity)`), plus
//! two bitmasks of exactly `size` bits:
//!
//! - `pending`: segments still due for transmission (sender) or still
//!   missing (receiver)
//! - `repair`: scratch set used while negotiating repairs
//!
//! # Lifecycle
//!
//! ```text
//! FREE (block pool) --tx_init/rx_init + insert--> ACTIVE (block buffer)
//! ACTIVE --tx_reset--> IN_REPAIR --activate_repairs--> ACTIVE
//! ACTIVE --empty_to_pool + pool put--> FREE
//! ```
//!
//! # Sender bookkeeping
//!
//! `parity_offset` is the first parity segment not yet used in the current
//! repair cycle and `parity_count` how many fresh parity segments past it
//! have been committed. On the sender `erasure_count` doubles as the number
//! of data segments already folded into incremental parity (see
//! [`Block::parity_ready`]).
//!
//! # Geometry
//!
//! `tx_init`/`rx_init` reject any `num_data`/`num_parity` that do not fit the
//! block. The repair operations take the same values per call (the last
//! block of an object may be short) and assume they are consistent with the
//! most recent init.

use crate::bitmask::BitMask;
use crate::block_id::BlockId;
use crate::error::{BlockError, Result};
use crate::repair::{RepairFlags, RepairForm, RepairItem, RepairPacker};
use crate::segment::{Segment, SegmentPool};
use tracing::{debug, error, trace};

/// Index of a segment within its block.
pub type SegmentId = u16;

/// Bytes of stream payload header that precede segment content.
pub const STREAM_PAYLOAD_HEADER_LEN: usize = 8;

/// Which mask a segment request updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Pending,
    Repair,
}

/// Per-walk constants for repair descriptor generation.
#[derive(Debug, Clone, Copy)]
struct RunScope {
    object_id: u16,
    flags: RepairFlags,
    num_data: u16,
    segment_size: u16,
}

/// One FEC coding block.
#[derive(Debug)]
pub struct Block {
    /// Block identifier within its object
    id: BlockId,

    /// Number of segment slots
    size: u16,

    /// Segment slots; each `Some` is exclusively owned here
    segment_table: Vec<Option<Segment>>,

    /// Segments due for transmission (sender) or missing (receiver)
    pending_mask: BitMask,

    /// Repair negotiation scratch set
    repair_mask: BitMask,

    /// Receiver: missing data count. Sender: parity readiness
    erasure_count: u16,

    /// Fresh parity committed in the current repair cycle
    parity_count: u16,

    /// First parity segment of the current repair cycle
    parity_offset: u16,

    /// Set by `tx_reset` when the repair scope changed
    in_repair: bool,

    /// Free-list or hash-chain link. A boxed block has one owner, so the two
    /// uses never overlap.
    pub(crate) next: Option<Box<Block>>,
}

impl Block {
    /// Allocate a block with `size` empty segment slots.
    ///
    /// # Errors
    /// - `BlockError::ZeroSize` if `size == 0`
    /// - `BlockError::AllocationFailed` if the table or a mask cannot be
    ///   allocated; nothing partial survives
    pub fn new(size: u16) -> Result<Self> {
        if size == 0 {
            return Err(BlockError::ZeroSize.into());
        }

        let mut segment_table = Vec::new();
        if segment_table.try_reserve_exact(size as usize).is_err() {
            error!(size, "block segment_table allocation failed");
            return Err(BlockError::AllocationFailed {
                what: "segment_table",
                size,
            }
            .into());
        }
        segment_table.resize_with(size as usize, || None);

        let pending_mask = BitMask::new(size as usize).ok_or_else(|| {
            error!(size, "block pending_mask allocation failed");
            BlockError::AllocationFailed {
                what: "pending_mask",
                size,
            }
        })?;
        let repair_mask = BitMask::new(size as usize).ok_or_else(|| {
            error!(size, "block repair_mask allocation failed");
            BlockError::AllocationFailed {
                what: "repair_mask",
                size,
            }
        })?;

        Ok(Self {
            id: BlockId::default(),
            size,
            segment_table,
            pending_mask,
            repair_mask,
            erasure_count: 0,
            parity_count: 0,
            parity_offset: 0,
            in_repair: false,
            next: None,
        })
    }

    fn check_geometry(&self, num_data: u16, num_parity: u16, auto_parity: u16) -> Result<()> {
        let fits = u32::from(num_data) + u32::from(num_parity) <= u32::from(self.size);
        if num_data == 0 || !fits || auto_parity > num_parity {
            return Err(BlockError::InvalidGeometry {
                num_data,
                num_parity,
                auto_parity,
                size: self.size,
            }
            .into());
        }
        Ok(())
    }

    /// Prepare a block for transmission.
    ///
    /// Marks the data segments and the first `auto_parity` parity segments
    /// pending and clears all repair state.
    pub fn tx_init(
        &mut self,
        id: BlockId,
        num_data: u16,
        num_parity: u16,
        auto_parity: u16,
    ) -> Result<()> {
        self.check_geometry(num_data, num_parity, auto_parity)?;
        self.id = id;
        self.pending_mask.clear();
        self.pending_mask
            .set_bits(0, (num_data + auto_parity) as usize);
        self.repair_mask.clear();
        self.erasure_count = 0;
        self.parity_count = 0;
        self.parity_offset = auto_parity;
        self.in_repair = false;
        Ok(())
    }

    /// Prepare a block for reception.
    ///
    /// Every data and parity segment starts out missing and the erasure
    /// count equals `num_data`.
    pub fn rx_init(&mut self, id: BlockId, num_data: u16, num_parity: u16) -> Result<()> {
        self.check_geometry(num_data, num_parity, 0)?;
        self.id = id;
        self.pending_mask.clear();
        self.pending_mask
            .set_bits(0, (num_data + num_parity) as usize);
        self.repair_mask.clear();
        self.erasure_count = num_data;
        self.parity_count = 0;
        self.parity_offset = 0;
        self.in_repair = false;
        Ok(())
    }

    /// Block identifier.
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Number of segment slots.
    pub fn size(&self) -> u16 {
        self.size
    }

    // === Segments ===

    /// Place a segment in slot `id`, returning whatever was there.
    pub fn attach_segment(&mut self, id: SegmentId, segment: Segment) -> Option<Segment> {
        self.segment_table[id as usize].replace(segment)
    }

    /// Take the segment out of slot `id`.
    pub fn detach_segment(&mut self, id: SegmentId) -> Option<Segment> {
        self.segment_table[id as usize].take()
    }

    /// Segment in slot `id`, if any.
    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segment_table[id as usize].as_ref()
    }

    /// Mutable segment in slot `id`, if any.
    pub fn segment_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segment_table[id as usize].as_mut()
    }

    /// Return every held segment to `pool`.
    pub fn empty_to_pool(&mut self, pool: &mut SegmentPool) {
        for slot in &mut self.segment_table {
            if let Some(segment) = slot.take() {
                pool.put(segment);
            }
        }
    }

    /// True iff every slot is empty.
    pub fn is_empty(&self) -> bool {
        self.segment_table.iter().all(Option::is_none)
    }

    // === Counters ===

    /// Receiver: data segments still missing. Sender: parity readiness.
    pub fn erasure_count(&self) -> u16 {
        self.erasure_count
    }

    /// Overwrite the erasure count.
    pub fn set_erasure_count(&mut self, count: u16) {
        self.erasure_count = count;
    }

    /// Count one more missing segment.
    pub fn increment_erasure_count(&mut self) {
        self.erasure_count += 1;
    }

    /// Count one missing segment as recovered. Stops at zero.
    pub fn decrement_erasure_count(&mut self) {
        self.erasure_count = self.erasure_count.saturating_sub(1);
    }

    /// Parity segments already committed to repair this cycle.
    pub fn parity_count(&self) -> u16 {
        self.parity_count
    }

    /// First parity index not yet used this cycle, relative to `num_data`.
    pub fn parity_offset(&self) -> u16 {
        self.parity_offset
    }

    /// True once all `num_data` segments have been folded into parity.
    pub fn parity_ready(&self, num_data: u16) -> bool {
        self.erasure_count == num_data
    }

    /// Record one more data segment folded into incremental parity.
    pub fn increase_parity_readiness(&mut self) {
        self.erasure_count += 1;
    }

    /// Mark parity as fully computed.
    pub fn set_parity_readiness(&mut self, num_data: u16) {
        self.erasure_count = num_data;
    }

    /// True while the block is being retransmitted.
    pub fn is_in_repair(&self) -> bool {
        self.in_repair
    }

    /// Leave the repair state.
    pub fn clear_in_repair(&mut self) {
        self.in_repair = false;
    }

    // === Pending mask ===

    /// Mark a segment due for transmission (sender) or missing (receiver).
    pub fn set_pending(&mut self, id: SegmentId) {
        self.pending_mask.set(id as usize);
    }

    /// Clear a segment from the pending set.
    pub fn unset_pending(&mut self, id: SegmentId) {
        self.pending_mask.unset(id as usize);
    }

    /// True if `id` is in the pending set.
    pub fn is_pending(&self, id: SegmentId) -> bool {
        self.pending_mask.test(id as usize)
    }

    /// Empty the pending set.
    pub fn clear_pending(&mut self) {
        self.pending_mask.clear();
    }

    /// True if anything is still due for transmission.
    pub fn is_transmit_pending(&self) -> bool {
        self.pending_mask.is_set()
    }

    /// Lowest pending id.
    pub fn first_pending(&self) -> Option<SegmentId> {
        self.pending_mask.first_set().map(|i| i as SegmentId)
    }

    /// Lowest pending id at or after `from`.
    pub fn next_pending(&self, from: SegmentId) -> Option<SegmentId> {
        self.pending_mask
            .next_set(from as usize)
            .map(|i| i as SegmentId)
    }

    /// Highest pending id.
    pub fn last_pending(&self) -> Option<SegmentId> {
        self.pending_mask.last_set().map(|i| i as SegmentId)
    }

    /// The pending set.
    pub fn pending_mask(&self) -> &BitMask {
        &self.pending_mask
    }

    // === Repair mask ===

    /// Mark a single segment for repair.
    pub fn set_repair(&mut self, id: SegmentId) {
        self.repair_mask.set(id as usize);
    }

    /// Mark `first..=last` for repair.
    pub fn set_repairs(&mut self, first: SegmentId, last: SegmentId) {
        if first <= last {
            self.repair_mask
                .set_bits(first as usize, (last - first) as usize + 1);
        }
    }

    /// True if `id` is marked for repair.
    pub fn is_repair(&self, id: SegmentId) -> bool {
        self.repair_mask.test(id as usize)
    }

    /// Empty the repair set.
    pub fn clear_repairs(&mut self) {
        self.repair_mask.clear();
    }

    /// Lowest id marked for repair.
    pub fn first_repair(&self) -> Option<SegmentId> {
        self.repair_mask.first_set().map(|i| i as SegmentId)
    }

    /// Lowest repair id at or after `from`.
    pub fn next_repair(&self, from: SegmentId) -> Option<SegmentId> {
        self.repair_mask
            .next_set(from as usize)
            .map(|i| i as SegmentId)
    }

    /// The repair set.
    pub fn repair_mask(&self) -> &BitMask {
        &self.repair_mask
    }

    // === Repair negotiation ===

    /// Sender: reset the block for a new repair round.
    ///
    /// The baseline is `num_data + auto_parity` segments pending and the
    /// remaining parity clear. If the pending set differs from it, the
    /// baseline is committed, parity bookkeeping restarts at `auto_parity`,
    /// and the block enters repair. Incremental parity that was not finished
    /// is stale once the scope changes, so in that case the parity segments
    /// are zeroed and readiness restarts from zero.
    ///
    /// Returns `true` if the repair scope increased.
    pub fn tx_reset(
        &mut self,
        num_data: u16,
        num_parity: u16,
        auto_parity: u16,
        segment_size: u16,
    ) -> bool {
        let baseline = (num_data + auto_parity) as usize;
        let extra = (num_parity - auto_parity) as usize;

        self.repair_mask.set_bits(0, baseline);
        self.repair_mask.unset_bits(baseline, extra);
        self.repair_mask.xor(&self.pending_mask);
        if !self.repair_mask.is_set() {
            return false;
        }

        self.repair_mask.clear();
        self.pending_mask.set_bits(0, baseline);
        self.pending_mask.unset_bits(baseline, extra);
        self.parity_offset = auto_parity;
        // No parity repair this cycle
        self.parity_count = num_parity;
        self.in_repair = true;

        if !self.parity_ready(num_data) {
            let payload_max = segment_size as usize + STREAM_PAYLOAD_HEADER_LEN;
            let start = num_data as usize;
            let end = start + num_parity as usize;
            for segment in self.segment_table[start..end].iter_mut().flatten() {
                segment.zero_prefix(payload_max);
            }
            self.erasure_count = 0;
        }

        debug!(block = %self.id, "tx_reset: block entered repair");
        true
    }

    /// Sender: commit negotiated repairs for transmission.
    ///
    /// Merges the repair set into the pending set and clears it. Returns
    /// `true` if anything was merged.
    pub fn activate_repairs(&mut self) -> bool {
        if !self.repair_mask.is_set() {
            return false;
        }
        self.pending_mask.add(&self.repair_mask);
        self.repair_mask.clear();
        true
    }

    /// Sender: apply a NACK that arrives during the repair holdoff directly
    /// to the pending set.
    ///
    /// See [`Block::handle_segment_request`] for the policy. Returns `true`
    /// if the pending set grew.
    pub fn tx_update(
        &mut self,
        next_id: SegmentId,
        last_id: SegmentId,
        num_data: u16,
        num_parity: u16,
        erasure_count: u16,
    ) -> bool {
        self.apply_segment_request(
            Target::Pending,
            next_id,
            last_id,
            num_data,
            num_parity,
            erasure_count,
        )
    }

    /// Sender: aggregate a NACK that arrives after the holdoff into the
    /// repair set.
    ///
    /// A request starting in the data region marks each requested data
    /// segment and restarts parity bookkeeping. A parity request is served
    /// with fresh parity when enough remains; otherwise the remaining fresh
    /// parity is used and the rest of the range is marked explicitly.
    ///
    /// Returns `true` if the repair set grew.
    pub fn handle_segment_request(
        &mut self,
        next_id: SegmentId,
        last_id: SegmentId,
        num_data: u16,
        num_parity: u16,
        erasure_count: u16,
    ) -> bool {
        debug!(
            block = %self.id,
            next_id,
            last_id,
            erasure_count,
            "handle_segment_request"
        );
        self.apply_segment_request(
            Target::Repair,
            next_id,
            last_id,
            num_data,
            num_parity,
            erasure_count,
        )
    }

    fn apply_segment_request(
        &mut self,
        target: Target,
        next_id: SegmentId,
        last_id: SegmentId,
        num_data: u16,
        num_parity: u16,
        erasure_count: u16,
    ) -> bool {
        // Ids past the block come off the wire; clamp instead of trusting them
        let last_id = u32::from(last_id).min(u32::from(self.size) - 1);
        let mut next_id = u32::from(next_id);
        let mask = match target {
            Target::Pending => &mut self.pending_mask,
            Target::Repair => &mut self.repair_mask,
        };

        if next_id < u32::from(num_data) {
            // Explicit data repair
            self.parity_offset = num_parity;
            self.parity_count = num_parity;
            return mark_explicit(mask, next_id, last_id);
        }

        let mut increased = false;
        let available = num_parity.saturating_sub(self.parity_offset);
        if erasure_count <= available {
            if erasure_count > self.parity_count {
                let fresh_start = usize::from(num_data)
                    + usize::from(self.parity_offset)
                    + usize::from(self.parity_count);
                mask.set_bits(fresh_start, (erasure_count - self.parity_count) as usize);
                self.parity_count = erasure_count;
                increased = true;
            }
        } else {
            if self.parity_count < available {
                let fresh_start = usize::from(num_data)
                    + usize::from(self.parity_offset)
                    + usize::from(self.parity_count);
                mask.set_bits(fresh_start, (available - self.parity_count) as usize);
                self.parity_count = available;
                next_id += u32::from(available);
                increased = true;
            }
            increased |= mark_explicit(mask, next_id, last_id);
        }
        increased
    }

    /// Receiver: decide whether a NACK is needed for this block.
    ///
    /// Erasures up to `num_parity` can be filled by parity; anything beyond
    /// must be asked for explicitly. Ids already set in the repair mask (for
    /// example repairs overheard from other receivers) are excluded. The
    /// repair mask ends up holding exactly the segments to request, so its
    /// previous contents are lost.
    pub fn is_repair_pending(&mut self, num_data: u16, num_parity: u16) -> bool {
        if self.erasure_count > num_parity {
            if num_parity > 0 {
                // Mark the first `num_parity` missing ids as parity-fillable
                let mut next = self.first_pending();
                for _ in 0..num_parity {
                    let Some(id) = next else { break };
                    self.repair_mask.set(id as usize);
                    next = self.next_pending(id + 1);
                }
            } else if self.size > num_data {
                self.repair_mask
                    .set_bits(num_data as usize, (self.size - num_data) as usize);
            }
        } else {
            self.repair_mask.set_bits(0, num_data as usize);
            self.repair_mask.set_bits(
                (num_data + self.erasure_count) as usize,
                (num_parity - self.erasure_count) as usize,
            );
        }
        // repair = pending - repair
        self.repair_mask.xcopy(&self.pending_mask);
        let pending = self.repair_mask.is_set();
        trace!(block = %self.id, pending, "is_repair_pending");
        pending
    }

    /// Sender: describe the repair set as repair advertisement content.
    pub fn append_repair_adv<P: RepairPacker + ?Sized>(
        &self,
        packer: &mut P,
        object_id: u16,
        repair_info: bool,
        num_data: u16,
        segment_size: u16,
    ) -> Result<()> {
        let mut flags = RepairFlags::SEGMENT;
        if repair_info {
            flags |= RepairFlags::INFO;
        }
        let scope = RunScope {
            object_id,
            flags,
            num_data,
            segment_size,
        };
        self.encode_runs(&self.repair_mask, self.first_repair(), self.size, packer, &scope)
    }

    /// Receiver: describe the missing segments as NACK content.
    ///
    /// With more erasures than parity, the first `num_parity` missing ids are
    /// left for parity to fill and everything after them (through the end of
    /// the parity region) is requested explicitly. Otherwise only the first
    /// `erasure_count` parity segments are requested.
    pub fn append_repair_request<P: RepairPacker + ?Sized>(
        &self,
        packer: &mut P,
        num_data: u16,
        num_parity: u16,
        object_id: u16,
        pending_info: bool,
        segment_size: u16,
    ) -> Result<()> {
        let (start, end) = if self.erasure_count > num_parity {
            let mut next = self.first_pending();
            for _ in 0..num_parity {
                next = next.and_then(|id| self.next_pending(id + 1));
            }
            (next, num_data + num_parity)
        } else {
            (self.next_pending(num_data), num_data + self.erasure_count)
        };

        let mut flags = RepairFlags::SEGMENT;
        if pending_info {
            flags |= RepairFlags::INFO;
        }
        let scope = RunScope {
            object_id,
            flags,
            num_data,
            segment_size,
        };
        self.encode_runs(&self.pending_mask, start, end, packer, &scope)
    }

    /// Walk the set ids of `mask` in `[start, end)` and emit them as
    /// ITEMS/RANGES descriptors.
    ///
    /// Consecutive ids form a run and every run gets its own descriptor:
    /// one or two ids as ITEMS, three or more as a single RANGES pair.
    fn encode_runs<P: RepairPacker + ?Sized>(
        &self,
        mask: &BitMask,
        start: Option<SegmentId>,
        end: SegmentId,
        packer: &mut P,
        scope: &RunScope,
    ) -> Result<()> {
        let item = |segment_id: SegmentId| RepairItem {
            object_id: scope.object_id,
            block_id: self.id,
            block_len: scope.num_data,
            segment_id,
        };
        let below_end = |id: usize| (id < end as usize).then_some(id as SegmentId);

        let mut segment_count: u16 = 0;
        let mut first_id: SegmentId = 0;
        let mut next = start.and_then(|id| below_end(id as usize));

        while let Some(current) = next {
            next = mask.next_set(current as usize + 1).and_then(below_end);
            if segment_count == 0 {
                first_id = current;
            }
            segment_count += 1;

            // Run continues while the next id is adjacent
            if next == Some(current + 1) {
                continue;
            }

            if segment_count <= 2 {
                packer.attach_repair_request(RepairForm::Items, scope.flags, scope.segment_size)?;
                packer.append_repair_item(item(first_id))?;
                if segment_count == 2 {
                    packer.append_repair_item(item(current))?;
                }
            } else {
                packer.attach_repair_request(RepairForm::Ranges, scope.flags, scope.segment_size)?;
                packer.append_repair_range(item(first_id), item(current))?;
            }
            packer.pack_repair_request()?;
            segment_count = 0;
        }
        Ok(())
    }
}

/// Set every id in `first..=last` not already set. Returns `true` if any bit
/// changed.
fn mark_explicit(mask: &mut BitMask, first: u32, last: u32) -> bool {
    let mut increased = false;
    for id in first..=last {
        let id = id as usize;
        if !mask.test(id) {
            mask.set(id);
            increased = true;
        }
    }
    increased
}
