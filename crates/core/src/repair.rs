//! Repair request descriptors and the packing collaborator.
//!
//! Blocks describe the segments they want (re)sent as a sequence of repair
//! descriptors handed to a [`RepairPacker`]. Each descriptor has a form:
//!
//! - `ITEMS`: explicit segment ids
//! - `RANGES`: `(first, last)` pairs covering consecutive ids
//! - `ERASURES`: count-only, carries no items here
//!
//! [`RepairMessage`] is a packer that writes descriptors into a bounded
//! byte buffer, and [`RepairRequest::parse_all`] reads them back.
//!
//! # Wire Format
//!
//! ```text
//! +-------------------+
//! | form (1)          |  1 = ITEMS, 2 = RANGES, 3 = ERASURES
//! +-------------------+
//! | flags (1)         |  SEGMENT | BLOCK | INFO | OBJECT
//! +-------------------+
//! | length (2)        |  u16 item bytes that follow
//! +-------------------+
//! | items             |  length / ITEM_SIZE items
//! | (variable)        |
//! +-------------------+
//!
//! item:
//! +-----------+------------+--------------+----------------+
//! | object(2) | block(4)   | block_len(2) | segment_id(2)  |
//! +-----------+------------+--------------+----------------+
//! ```
//!
//! All integers are big-endian. A RANGES descriptor holds items in
//! `first, last` pairs.

use crate::block_id::BlockId;
use crate::error::{RepairError, Result};
use bitflags::bitflags;

/// Size of a descriptor header in bytes
pub const REQUEST_HEADER_SIZE: usize = 4;

/// Size of one repair item in bytes
pub const ITEM_SIZE: usize = 10;

/// Descriptor encoding form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RepairForm {
    /// No descriptor in progress
    Invalid = 0,
    /// Explicit segment ids
    Items = 1,
    /// Inclusive `(first, last)` pairs
    Ranges = 2,
    /// Erasure counts (not used by segment repair)
    Erasures = 3,
}

impl TryFrom<u8> for RepairForm {
    type Error = RepairError;

    fn try_from(value: u8) -> std::result::Result<Self, RepairError> {
        match value {
            1 => Ok(RepairForm::Items),
            2 => Ok(RepairForm::Ranges),
            3 => Ok(RepairForm::Erasures),
            other => Err(RepairError::InvalidForm(other)),
        }
    }
}

bitflags! {
    /// Scope and extras a descriptor refers to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RepairFlags: u8 {
        const SEGMENT = 0x01;
        const BLOCK = 0x02;
        const INFO = 0x04;
        const OBJECT = 0x08;
    }
}

/// One repair item: a segment within a block of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepairItem {
    /// Transport object the block belongs to
    pub object_id: u16,

    /// Block within the object
    pub block_id: BlockId,

    /// Number of data segments in the block
    pub block_len: u16,

    /// Segment within the block
    pub segment_id: u16,
}

impl RepairItem {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.object_id.to_be_bytes());
        out.extend_from_slice(&self.block_id.value().to_be_bytes());
        out.extend_from_slice(&self.block_len.to_be_bytes());
        out.extend_from_slice(&self.segment_id.to_be_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= ITEM_SIZE);
        Self {
            object_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            block_id: BlockId::new(u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]])),
            block_len: u16::from_be_bytes([bytes[6], bytes[7]]),
            segment_id: u16::from_be_bytes([bytes[8], bytes[9]]),
        }
    }
}

/// Collaborator that receives repair descriptors from a block.
///
/// Blocks call `attach_repair_request` to open a descriptor, append items or
/// ranges to it, and `pack_repair_request` once it is complete. Descriptors
/// arrive in ascending segment-id order and are never abandoned half-built.
pub trait RepairPacker {
    /// Open a new descriptor of `form`. `segment_size` is the message
    /// payload budget.
    fn attach_repair_request(
        &mut self,
        form: RepairForm,
        flags: RepairFlags,
        segment_size: u16,
    ) -> Result<()>;

    /// Append a single segment id to the open descriptor.
    fn append_repair_item(&mut self, item: RepairItem) -> Result<()>;

    /// Append an inclusive range to the open descriptor.
    fn append_repair_range(&mut self, first: RepairItem, last: RepairItem) -> Result<()>;

    /// Finalize the open descriptor.
    fn pack_repair_request(&mut self) -> Result<()>;
}

/// A repair message (NACK or repair advertisement) under construction.
///
/// Packs descriptors into a byte buffer whose total length never exceeds
/// the `segment_size` budget given on attach.
#[derive(Debug, Clone, Default)]
pub struct RepairMessage {
    /// Packed bytes so far
    bytes: Vec<u8>,

    /// Offset of the open descriptor's header
    open: Option<usize>,

    /// Total byte budget, set on attach
    limit: usize,

    /// Descriptors packed so far
    packed: usize,
}

impl RepairMessage {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Packed wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        debug_assert!(self.open.is_none(), "repair request left attached");
        &self.bytes
    }

    /// Number of descriptors packed.
    pub fn request_count(&self) -> usize {
        self.packed
    }

    /// True if nothing has been packed.
    pub fn is_empty(&self) -> bool {
        self.packed == 0
    }

    /// Discard all content.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.open = None;
        self.limit = 0;
        self.packed = 0;
    }

    /// Decode the packed descriptors.
    pub fn requests(&self) -> Result<Vec<RepairRequest>> {
        RepairRequest::parse_all(self.as_bytes())
    }

    fn reserve(&self, needed: usize) -> Result<()> {
        let available = self.limit.saturating_sub(self.bytes.len());
        if needed > available {
            return Err(RepairError::MessageFull { needed, available }.into());
        }
        Ok(())
    }

    /// Reserve room for items in the open descriptor, dropping the whole
    /// descriptor if they do not fit.
    fn reserve_items(&mut self, needed: usize) -> Result<()> {
        let Some(header) = self.open else {
            return Err(RepairError::NotAttached.into());
        };
        if let Err(e) = self.reserve(needed) {
            self.bytes.truncate(header);
            self.open = None;
            return Err(e);
        }
        Ok(())
    }
}

impl RepairPacker for RepairMessage {
    fn attach_repair_request(
        &mut self,
        form: RepairForm,
        flags: RepairFlags,
        segment_size: u16,
    ) -> Result<()> {
        debug_assert!(self.open.is_none(), "repair request attached twice");
        self.limit = segment_size as usize;
        self.reserve(REQUEST_HEADER_SIZE)?;
        self.open = Some(self.bytes.len());
        self.bytes.push(form as u8);
        self.bytes.push(flags.bits());
        self.bytes.extend_from_slice(&0u16.to_be_bytes());
        Ok(())
    }

    fn append_repair_item(&mut self, item: RepairItem) -> Result<()> {
        self.reserve_items(ITEM_SIZE)?;
        item.write_to(&mut self.bytes);
        Ok(())
    }

    fn append_repair_range(&mut self, first: RepairItem, last: RepairItem) -> Result<()> {
        self.reserve_items(2 * ITEM_SIZE)?;
        first.write_to(&mut self.bytes);
        last.write_to(&mut self.bytes);
        Ok(())
    }

    fn pack_repair_request(&mut self) -> Result<()> {
        let header = self.open.take().ok_or(RepairError::NotAttached)?;
        let length = (self.bytes.len() - header - REQUEST_HEADER_SIZE) as u16;
        self.bytes[header + 2..header + 4].copy_from_slice(&length.to_be_bytes());
        self.packed += 1;
        Ok(())
    }
}

/// A decoded repair descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    /// Encoding form
    pub form: RepairForm,

    /// Scope flags
    pub flags: RepairFlags,

    /// Items in wire order (pairs for RANGES)
    pub items: Vec<RepairItem>,
}

impl RepairRequest {
    /// Decode every descriptor in a packed message.
    ///
    /// # Errors
    /// - `RepairError::RequestTooShort` if a header or its items are truncated
    /// - `RepairError::InvalidForm` for unknown form codes
    /// - `RepairError::LengthMismatch` if the item bytes are not whole items,
    ///   or a RANGES descriptor holds an odd number of items
    pub fn parse_all(mut bytes: &[u8]) -> Result<Vec<Self>> {
        let mut requests = Vec::new();
        while !bytes.is_empty() {
            let (request, used) = Self::parse(bytes)?;
            requests.push(request);
            bytes = &bytes[used..];
        }
        Ok(requests)
    }

    /// Decode one descriptor, returning it and the bytes consumed.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < REQUEST_HEADER_SIZE {
            return Err(RepairError::RequestTooShort {
                required: REQUEST_HEADER_SIZE,
                actual: bytes.len(),
            }
            .into());
        }

        let form = RepairForm::try_from(bytes[0])?;
        let flags = RepairFlags::from_bits_truncate(bytes[1]);
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;

        let total = REQUEST_HEADER_SIZE + length;
        if bytes.len() < total {
            return Err(RepairError::RequestTooShort {
                required: total,
                actual: bytes.len(),
            }
            .into());
        }

        let count = length / ITEM_SIZE;
        let bad_length = length % ITEM_SIZE != 0
            || (form == RepairForm::Ranges && count % 2 != 0)
            || (form == RepairForm::Erasures && length != 0);
        if bad_length {
            return Err(RepairError::LengthMismatch {
                form: form as u8,
                length,
            }
            .into());
        }

        let items = bytes[REQUEST_HEADER_SIZE..total]
            .chunks_exact(ITEM_SIZE)
            .map(RepairItem::read_from)
            .collect();

        Ok((Self { form, flags, items }, total))
    }

    /// Expand the descriptor into the segment ids it names, in order.
    pub fn segment_ids(&self) -> Vec<u16> {
        match self.form {
            RepairForm::Items => self.items.iter().map(|item| item.segment_id).collect(),
            RepairForm::Ranges => self
                .items
                .chunks_exact(2)
                .flat_map(|pair| pair[0].segment_id..=pair[1].segment_id)
                .collect(),
            RepairForm::Invalid | RepairForm::Erasures => Vec::new(),
        }
    }

    /// Expand the descriptor into inclusive `(block, first, last)` segment
    /// ranges, one per item (ITEMS) or per pair (RANGES).
    pub fn segment_ranges(&self) -> Vec<(BlockId, u16, u16)> {
        match self.form {
            RepairForm::Items => self
                .items
                .iter()
                .map(|item| (item.block_id, item.segment_id, item.segment_id))
                .collect(),
            RepairForm::Ranges => self
                .items
                .chunks_exact(2)
                .map(|pair| (pair[0].block_id, pair[0].segment_id, pair[1].segment_id))
                .collect(),
            RepairForm::Invalid | RepairForm::Erasures => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn item(segment_id: u16) -> RepairItem {
        RepairItem {
            object_id: 7,
            block_id: BlockId::new(0xDEAD_BEEF),
            block_len: 4,
            segment_id,
        }
    }

    #[test]
    fn test_pack_and_parse() {
        let mut msg = RepairMessage::new();

        msg.attach_repair_request(RepairForm::Items, RepairFlags::SEGMENT, 1400)
            .unwrap();
        msg.append_repair_item(item(1)).unwrap();
        msg.append_repair_item(item(2)).unwrap();
        msg.pack_repair_request().unwrap();

        msg.attach_repair_request(RepairForm::Ranges, RepairFlags::SEGMENT | RepairFlags::INFO, 1400)
            .unwrap();
        msg.append_repair_range(item(4), item(9)).unwrap();
        msg.pack_repair_request().unwrap();

        assert_eq!(msg.request_count(), 2);
        assert_eq!(
            msg.as_bytes().len(),
            2 * REQUEST_HEADER_SIZE + 4 * ITEM_SIZE
        );

        let requests = msg.requests().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].form, RepairForm::Items);
        assert_eq!(requests[0].segment_ids(), vec![1, 2]);
        assert_eq!(requests[1].form, RepairForm::Ranges);
        assert!(requests[1].flags.contains(RepairFlags::INFO));
        assert_eq!(requests[1].segment_ids(), vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(
            requests[1].segment_ranges(),
            vec![(BlockId::new(0xDEAD_BEEF), 4, 9)]
        );
        assert_eq!(requests[0].items[0], item(1));
    }

    #[test]
    fn test_message_budget() {
        let mut msg = RepairMessage::new();
        // Room for the header and one item only
        let budget = (REQUEST_HEADER_SIZE + ITEM_SIZE) as u16;

        msg.attach_repair_request(RepairForm::Items, RepairFlags::SEGMENT, budget)
            .unwrap();
        msg.append_repair_item(item(0)).unwrap();

        let result = msg.append_repair_item(item(1));
        assert!(matches!(
            result,
            Err(Error::Repair(RepairError::MessageFull { .. }))
        ));

        // The partial descriptor is dropped, not left open
        assert!(msg.as_bytes().is_empty());
        assert!(msg.is_empty());
        assert!(matches!(
            msg.pack_repair_request(),
            Err(Error::Repair(RepairError::NotAttached))
        ));
    }

    #[test]
    fn test_overflow_keeps_packed_descriptors() {
        let mut msg = RepairMessage::new();
        // One full ITEMS descriptor plus a header and a single item
        let budget = (2 * REQUEST_HEADER_SIZE + 2 * ITEM_SIZE) as u16;

        msg.attach_repair_request(RepairForm::Items, RepairFlags::SEGMENT, budget)
            .unwrap();
        msg.append_repair_item(item(0)).unwrap();
        msg.pack_repair_request().unwrap();
        let packed = msg.as_bytes().to_vec();

        msg.attach_repair_request(RepairForm::Ranges, RepairFlags::SEGMENT, budget)
            .unwrap();
        assert!(msg.append_repair_range(item(2), item(5)).is_err());

        assert_eq!(msg.as_bytes(), &packed[..]);
        assert_eq!(msg.request_count(), 1);
        assert_eq!(msg.requests().unwrap()[0].segment_ids(), vec![0]);

        // The message stays usable after the rollback
        msg.attach_repair_request(RepairForm::Items, RepairFlags::SEGMENT, budget)
            .unwrap();
        msg.append_repair_item(item(3)).unwrap();
        msg.pack_repair_request().unwrap();
        assert_eq!(msg.request_count(), 2);
    }

    #[test]
    fn test_append_without_attach() {
        let mut msg = RepairMessage::new();
        assert!(matches!(
            msg.append_repair_item(item(0)),
            Err(Error::Repair(RepairError::NotAttached))
        ));
        assert!(matches!(
            msg.pack_repair_request(),
            Err(Error::Repair(RepairError::NotAttached))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        // Truncated header
        assert!(matches!(
            RepairRequest::parse(&[1, 1]),
            Err(Error::Repair(RepairError::RequestTooShort { .. }))
        ));

        // Unknown form
        assert!(matches!(
            RepairRequest::parse(&[9, 1, 0, 0]),
            Err(Error::Repair(RepairError::InvalidForm(9)))
        ));

        // Length not a whole item
        assert!(matches!(
            RepairRequest::parse(&[1, 1, 0, 3, 0, 0, 0]),
            Err(Error::Repair(RepairError::LengthMismatch { .. }))
        ));

        // Header promises more bytes than present
        assert!(matches!(
            RepairRequest::parse(&[1, 1, 0, 10, 0]),
            Err(Error::Repair(RepairError::RequestTooShort { .. }))
        ));
    }

    #[test]
    fn test_odd_range_items_rejected() {
        let mut bytes = vec![RepairForm::Ranges as u8, RepairFlags::SEGMENT.bits()];
        bytes.extend_from_slice(&(ITEM_SIZE as u16).to_be_bytes());
        item(3).write_to(&mut bytes);

        assert!(matches!(
            RepairRequest::parse(&bytes),
            Err(Error::Repair(RepairError::LengthMismatch { .. }))
        ));
    }

    #[test]
    fn test_erasures_carry_no_items() {
        let mut msg = RepairMessage::new();
        msg.attach_repair_request(RepairForm::Erasures, RepairFlags::BLOCK, 100)
            .unwrap();
        msg.pack_repair_request().unwrap();

        let requests = msg.requests().unwrap();
        assert_eq!(requests[0].form, RepairForm::Erasures);
        assert!(requests[0].segment_ids().is_empty());
    }
}
