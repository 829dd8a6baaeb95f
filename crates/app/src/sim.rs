//! Loopback sender/receiver simulation over a seeded lossy channel.
//!
//! Each round runs the full repair cycle:
//!
//! ```text
//! enqueue -> transmit (lossy) -> flush hint -> release completed
//!   -> receiver NACKs -> sender aggregates -> advertise -> activate
//! ```
//!
//! FEC arithmetic is out of scope: parity is a stand-in XOR and a receiver
//! block counts as recovered once `num_data` distinct segments arrived.

use crate::config::Config;
use nackfec_core::block::SegmentId;
use nackfec_core::metrics::Metrics;
use nackfec_core::repair::{RepairItem, RepairMessage, RepairRequest};
use nackfec_core::{Block, BlockId, RepairFlags, RepairForm, RepairPacker, Result, Session};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;
use tracing::{debug, info, trace, warn};

/// Object id carried in repair items
const OBJECT_ID: u16 = 1;

/// Seeded loss model shared by segments and control messages.
struct Channel {
    rng: ChaCha8Rng,
    loss_rate: f64,
}

impl Channel {
    /// Returns `true` if the next message survives.
    fn deliver(&mut self) -> bool {
        !self.rng.gen_bool(self.loss_rate)
    }
}

/// Deterministic payload byte for `block`/`segment` at `offset`.
fn payload_byte(block: BlockId, segment: SegmentId, offset: usize) -> u8 {
    (block.value() as usize)
        .wrapping_mul(31)
        .wrapping_add(segment as usize * 7)
        .wrapping_add(offset) as u8
}

/// Ask for a whole block again.
fn request_block<P: RepairPacker + ?Sized>(
    packer: &mut P,
    block_id: BlockId,
    num_data: u16,
    segment_size: u16,
) -> Result<()> {
    packer.attach_repair_request(RepairForm::Items, RepairFlags::BLOCK, segment_size)?;
    packer.append_repair_item(RepairItem {
        object_id: OBJECT_ID,
        block_id,
        block_len: num_data,
        segment_id: 0,
    })?;
    packer.pack_repair_request()
}

/// Replace the repair set with the next `erasure_count` missing segments,
/// parity first, then data.
fn mark_next_missing(block: &mut Block, num_data: u16) {
    block.clear_repairs();
    let wanted = block.erasure_count() as usize;
    let parity = block.pending_mask().iter_set().filter(|&i| i >= num_data as usize);
    let data = block.pending_mask().iter_set().filter(|&i| i < num_data as usize);
    let ids: Vec<SegmentId> = parity.chain(data).take(wanted).map(|i| i as SegmentId).collect();
    for id in ids {
        block.set_repair(id);
    }
}

struct Sender {
    session: Session,
    first_block: BlockId,
    total_blocks: u32,
    enqueued: u32,
    /// Blocks whose initial transmission is done
    sent_once: HashSet<BlockId>,
}

impl Sender {
    fn new(session: Session, first_block: BlockId, total_blocks: u32) -> Self {
        Self {
            session,
            first_block,
            total_blocks,
            enqueued: 0,
            sent_once: HashSet::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.enqueued == self.total_blocks && self.session.buffer.is_empty()
    }

    fn last_enqueued(&self) -> Option<BlockId> {
        self.enqueued
            .checked_sub(1)
            .map(|n| self.first_block.wrapping_add(n))
    }

    /// Admit new blocks until the window or a pool runs out.
    fn enqueue(&mut self, metrics: &mut Metrics) -> Result<()> {
        let config = self.session.config().clone();
        while self.enqueued < self.total_blocks {
            let id = self.first_block.wrapping_add(self.enqueued);
            if !self.session.buffer.can_insert(id) {
                metrics.enqueue_stalls += 1;
                break;
            }
            let Some(mut block) = self.session.blocks.get() else {
                metrics.enqueue_stalls += 1;
                break;
            };
            if let Err(e) =
                block.tx_init(id, config.num_data, config.num_parity, config.auto_parity)
            {
                self.session.recycle(block);
                return Err(e);
            }
            if !self.fill(&mut block) {
                trace!(block = %id, "enqueue deferred: segment pool empty");
                self.session.recycle(block);
                metrics.enqueue_stalls += 1;
                break;
            }
            if let Err(block) = self.session.buffer.insert(block) {
                self.session.recycle(block);
                metrics.enqueue_stalls += 1;
                break;
            }
            self.enqueued += 1;
            metrics.blocks_enqueued += 1;
        }
        Ok(())
    }

    /// Attach data and parity segments, folding each data segment into
    /// parity as it is added.
    fn fill(&mut self, block: &mut Block) -> bool {
        let num_data = self.session.config().num_data;
        let num_parity = self.session.config().num_parity;
        let id = block.id();

        for slot in num_data..num_data + num_parity {
            let Some(mut parity) = self.session.segments.get() else {
                return false;
            };
            parity.fill(0);
            block.attach_segment(slot, parity);
        }

        for slot in 0..num_data {
            let Some(mut data) = self.session.segments.get() else {
                return false;
            };
            for (offset, byte) in data.iter_mut().enumerate() {
                *byte = payload_byte(id, slot, offset);
            }
            for parity_slot in num_data..num_data + num_parity {
                if let Some(parity) = block.segment_mut(parity_slot) {
                    for (p, d) in parity.iter_mut().zip(data.iter()) {
                        *p ^= *d;
                    }
                }
            }
            block.attach_segment(slot, data);
            block.increase_parity_readiness();
        }
        debug_assert!(block.parity_ready(num_data));
        true
    }

    /// Send everything pending, block by block in id order.
    fn transmit(&mut self, receiver: &mut Receiver, channel: &mut Channel, metrics: &mut Metrics) {
        let ids: Vec<BlockId> = self.session.buffer.iter().map(Block::id).collect();
        for id in ids {
            let Some(block) = self.session.buffer.find_mut(id) else {
                continue;
            };
            let repair = !self.sent_once.insert(id);
            while let Some(segment_id) = block.first_pending() {
                block.unset_pending(segment_id);
                metrics.segments_sent += 1;
                if repair {
                    metrics.repair_segments_sent += 1;
                }
                if !channel.deliver() {
                    metrics.segments_dropped += 1;
                    trace!(block = %id, segment_id, "segment lost");
                    continue;
                }
                let payload = block.segment(segment_id).map_or(&[][..], |s| &s[..]);
                receiver.on_segment(id, segment_id, payload, metrics);
            }
            block.clear_in_repair();
        }
    }

    /// Aggregate one NACK into the affected blocks.
    fn handle_nack(&mut self, bytes: &[u8], metrics: &mut Metrics) {
        let requests = match RepairRequest::parse_all(bytes) {
            Ok(requests) => requests,
            Err(e) => {
                warn!("discarding malformed NACK: {e}");
                return;
            }
        };
        let config = self.session.config().clone();
        let (num_data, num_parity) = (config.num_data, config.num_parity);

        for request in &requests {
            if request.flags.contains(RepairFlags::BLOCK) {
                for item in &request.items {
                    if let Some(block) = self.session.buffer.find_mut(item.block_id) {
                        if block.tx_reset(num_data, num_parity, config.auto_parity, config.segment_size) {
                            metrics.tx_resets += 1;
                        }
                    }
                }
                continue;
            }

            for (block_id, first, last) in request.segment_ranges() {
                let Some(block) = self.session.buffer.find_mut(block_id) else {
                    continue;
                };
                let erasures = if first >= num_data { last - num_data + 1 } else { 0 };
                if block.is_transmit_pending() {
                    // Still queued from this cycle: fold straight into pending
                    block.tx_update(first, last, num_data, num_parity, erasures);
                } else if !block.handle_segment_request(first, last, num_data, num_parity, erasures)
                    && !(first..=last).all(|s| block.is_repair(s))
                {
                    // Fresh parity for this cycle is spent; resend what was asked
                    block.set_repairs(first, last.min(block.size() - 1));
                }
            }
        }
    }

    /// Advertise and commit the negotiated repairs.
    fn advertise(&mut self, metrics: &mut Metrics) -> Vec<RepairMessage> {
        let config = self.session.config().clone();
        let ids: Vec<BlockId> = self.session.buffer.iter().map(Block::id).collect();
        let mut adverts = Vec::new();

        for id in ids {
            let Some(block) = self.session.buffer.find_mut(id) else {
                continue;
            };
            if block.first_repair().is_none() {
                continue;
            }
            let mut adv = RepairMessage::new();
            if let Err(e) =
                block.append_repair_adv(&mut adv, OBJECT_ID, false, config.num_data, config.segment_size)
            {
                warn!(block = %id, packed = adv.request_count(), "repair advertisement truncated: {e}");
            }
            if !adv.is_empty() {
                metrics.repair_adverts += 1;
                adverts.push(adv);
            }
            block.activate_repairs();
        }
        adverts
    }

    fn release(&mut self, completed: &[BlockId], metrics: &mut Metrics) {
        for &id in completed {
            if self.session.release(id) {
                self.sent_once.remove(&id);
                metrics.blocks_released += 1;
            }
        }
    }
}

struct Receiver {
    session: Session,
    /// Lowest id not yet delivered
    next_undelivered: BlockId,
    /// Delivered ids above `next_undelivered`
    delivered: HashSet<BlockId>,
    /// Completed since the last `take_completed`
    completed: Vec<BlockId>,
}

impl Receiver {
    fn new(session: Session, first_block: BlockId) -> Self {
        Self {
            session,
            next_undelivered: first_block,
            delivered: HashSet::new(),
            completed: Vec::new(),
        }
    }

    fn is_delivered(&self, id: BlockId) -> bool {
        id < self.next_undelivered || self.delivered.contains(&id)
    }

    /// Make sure a receive block exists for `id`.
    fn ensure_block(&mut self, id: BlockId) -> bool {
        if self.session.buffer.find(id).is_some() {
            return true;
        }
        if !self.session.buffer.can_insert(id) {
            trace!(block = %id, "outside receive window");
            return false;
        }
        let Some(mut block) = self.session.blocks.get() else {
            return false;
        };
        let config = self.session.config();
        if block.rx_init(id, config.num_data, config.num_parity).is_err() {
            self.session.recycle(block);
            return false;
        }
        match self.session.buffer.insert(block) {
            Ok(()) => true,
            Err(block) => {
                self.session.recycle(block);
                false
            }
        }
    }

    fn on_segment(&mut self, id: BlockId, segment_id: SegmentId, payload: &[u8], metrics: &mut Metrics) {
        if self.is_delivered(id) {
            metrics.segments_duplicate += 1;
            return;
        }
        if !self.ensure_block(id) {
            return;
        }
        let Some(block) = self.session.buffer.find_mut(id) else {
            return;
        };
        if !block.is_pending(segment_id) {
            metrics.segments_duplicate += 1;
            return;
        }
        let Some(mut segment) = self.session.segments.get() else {
            trace!(block = %id, segment_id, "receive buffer full");
            return;
        };
        let len = segment.len().min(payload.len());
        segment[..len].copy_from_slice(&payload[..len]);
        if let Some(old) = block.attach_segment(segment_id, segment) {
            self.session.segments.put(old);
        }
        block.unset_pending(segment_id);
        block.decrement_erasure_count();
        metrics.segments_received += 1;

        if block.erasure_count() == 0 {
            self.complete(id, metrics);
        }
    }

    fn complete(&mut self, id: BlockId, metrics: &mut Metrics) {
        self.session.release(id);
        self.delivered.insert(id);
        while self.delivered.remove(&self.next_undelivered) {
            self.next_undelivered = self.next_undelivered.wrapping_add(1);
        }
        self.completed.push(id);
        metrics.blocks_completed += 1;
        debug!(block = %id, "block recovered");
    }

    /// Learn that the sender has sent through `last`; blocks never heard
    /// from get created so they can be NACKed.
    fn on_flush(&mut self, last: BlockId) {
        if last < self.next_undelivered {
            return;
        }
        let span = last - self.next_undelivered;
        for offset in 0..=span {
            let id = self.next_undelivered.wrapping_add(offset);
            if self.delivered.contains(&id) {
                continue;
            }
            if !self.ensure_block(id) {
                break;
            }
        }
    }

    fn take_completed(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.completed)
    }

    /// Build one NACK per block that still needs repair.
    fn build_nacks(&mut self) -> Vec<RepairMessage> {
        let config = self.session.config().clone();
        let (num_data, num_parity) = (config.num_data, config.num_parity);
        let ids: Vec<BlockId> = self.session.buffer.iter().map(Block::id).collect();
        let mut nacks = Vec::new();

        for id in ids {
            let Some(block) = self.session.buffer.find_mut(id) else {
                continue;
            };
            let mut nack = RepairMessage::new();
            let nothing_received =
                block.pending_mask().count_ones() == (num_data + num_parity) as usize;
            let overheard = block.first_repair().is_some();
            let result = if nothing_received {
                request_block(&mut nack, id, num_data, config.segment_size)
            } else if block.is_repair_pending(num_data, num_parity) {
                block.append_repair_request(
                    &mut nack,
                    num_data,
                    num_parity,
                    OBJECT_ID,
                    false,
                    config.segment_size,
                )
            } else if !overheard && block.erasure_count() > 0 {
                // Parity received earlier already covers the usual request
                // window; ask for the next missing segments instead
                mark_next_missing(block, num_data);
                block.append_repair_adv(&mut nack, OBJECT_ID, false, num_data, config.segment_size)
            } else {
                Ok(())
            };
            // Request set and overheard suppression both end here
            block.clear_repairs();

            if let Err(e) = result {
                warn!(block = %id, packed = nack.request_count(), "NACK truncated: {e}");
            }
            if !nack.is_empty() {
                nacks.push(nack);
            }
        }
        nacks
    }

    /// Note repairs another party already asked for.
    fn apply_advert(&mut self, bytes: &[u8]) {
        let Ok(requests) = RepairRequest::parse_all(bytes) else {
            return;
        };
        for request in &requests {
            for (block_id, first, last) in request.segment_ranges() {
                if let Some(block) = self.session.buffer.find_mut(block_id) {
                    block.set_repairs(first, last.min(block.size() - 1));
                }
            }
        }
    }
}

/// Run a full transfer and return its metrics.
pub fn run(config: &Config) -> Result<Metrics> {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let first_block = BlockId::new(rng.gen());
    let mut channel = Channel {
        rng,
        loss_rate: config.loss_rate,
    };

    let mut sender = Sender::new(
        Session::new(config.session.clone())?,
        first_block,
        config.blocks,
    );
    let mut receiver = Receiver::new(Session::new(config.session.clone())?, first_block);
    let mut metrics = Metrics::new();
    metrics.blocks_planned = u64::from(config.blocks);

    info!(
        seed = config.seed,
        blocks = config.blocks,
        first_block = %first_block,
        loss = config.loss_rate,
        "simulation started"
    );

    while !sender.is_done() && metrics.rounds < config.max_rounds {
        metrics.rounds += 1;

        sender.enqueue(&mut metrics)?;
        sender.transmit(&mut receiver, &mut channel, &mut metrics);
        if let Some(last) = sender.last_enqueued() {
            if channel.deliver() {
                receiver.on_flush(last);
            }
        }

        let completed = receiver.take_completed();
        sender.release(&completed, &mut metrics);

        for nack in receiver.build_nacks() {
            metrics.nacks_sent += 1;
            metrics.nack_bytes += nack.as_bytes().len() as u64;
            metrics.repair_descriptors += nack.request_count() as u64;
            if channel.deliver() {
                sender.handle_nack(nack.as_bytes(), &mut metrics);
            }
        }

        for adv in sender.advertise(&mut metrics) {
            if channel.deliver() {
                receiver.apply_advert(adv.as_bytes());
            }
        }

        debug!(
            round = metrics.rounds,
            enqueued = metrics.blocks_enqueued,
            completed = metrics.blocks_completed,
            active = sender.session.buffer.len(),
            "round finished"
        );
    }

    if !sender.is_done() {
        warn!(rounds = metrics.rounds, "round limit reached before delivery finished");
    }

    metrics.record_segment_pool(&sender.session.segments.stats());
    metrics.block_overruns = sender.session.blocks.overruns();
    sender.session.destroy();
    receiver.session.destroy();
    metrics.complete();

    info!(
        rounds = metrics.rounds,
        completed = metrics.blocks_completed,
        "simulation finished"
    );
    Ok(metrics)
}
