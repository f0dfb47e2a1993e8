//! Data-product model.
//!
//! A *product* is an immutable, named blob identified by a [`ProdIndex`].
//! Products are sliced into fixed-size *data segments*; every segment is the
//! canonical size except possibly the last one. [`ProdInfo`] carries the
//! product's metadata and [`DataSeg`] carries one segment's bytes.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;

use crate::constants::CANON_SEG_SIZE;

/// Size of a product in bytes.
pub type ProdSize = u32;

/// Size of a data segment in bytes.
pub type SegSize = u16;

/// Byte offset of a data segment within its product.
pub type SegOffset = u32;

/// Errors constructing product-model values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProductError {
    /// Product index 0 is reserved for "unset".
    #[error("product index 0 is invalid")]
    InvalidIndex,

    /// Product names must be non-empty.
    #[error("empty product name")]
    EmptyName,

    /// Product names are length-prefixed with 16 bits on the wire.
    #[error("product name too long: {0} bytes")]
    NameTooLong(usize),

    /// The segment offset lies at or beyond the end of the product.
    #[error("segment offset {offset} out of bounds for product size {size}")]
    OffsetOutOfBounds { offset: SegOffset, size: ProdSize },

    /// The payload length doesn't match the expected segment size.
    #[error("segment payload is {actual} bytes, expected {expected}")]
    PayloadLengthMismatch { actual: usize, expected: SegSize },
}

/// Index identifying a data-product. Unique per publisher.
///
/// Index 0 is reserved for "unset" and never identifies a real product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProdIndex(u32);

impl ProdIndex {
    /// Creates a product index. Fails on the reserved index 0.
    pub fn new(index: u32) -> Result<Self, ProductError> {
        if index == 0 {
            return Err(ProductError::InvalidIndex);
        }
        Ok(Self(index))
    }

    /// The raw index value.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProdIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a data segment: the product it belongs to plus its byte
/// offset within that product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataSegId {
    /// The owning product.
    pub prod_index: ProdIndex,
    /// Byte offset of the segment within the product.
    pub offset: SegOffset,
}

impl DataSegId {
    /// Creates a segment identifier.
    pub fn new(prod_index: ProdIndex, offset: SegOffset) -> Self {
        Self { prod_index, offset }
    }
}

impl fmt::Display for DataSegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prod_index, self.offset)
    }
}

/// Creation time of a product: seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    /// Whole seconds since the epoch.
    pub secs: u64,
    /// Nanoseconds past the second.
    pub nanos: u32,
}

impl Timestamp {
    /// The current system time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: elapsed.as_secs(),
            nanos: elapsed.subsec_nanos(),
        }
    }
}

/// Metadata of a data-product. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProdInfo {
    index: ProdIndex,
    name: String,
    size: ProdSize,
    created: Timestamp,
}

impl ProdInfo {
    /// Creates product information, stamped with the current time.
    pub fn new(
        index: ProdIndex,
        name: impl Into<String>,
        size: ProdSize,
    ) -> Result<Self, ProductError> {
        Self::with_timestamp(index, name, size, Timestamp::now())
    }

    /// Creates product information with an explicit creation time.
    pub fn with_timestamp(
        index: ProdIndex,
        name: impl Into<String>,
        size: ProdSize,
        created: Timestamp,
    ) -> Result<Self, ProductError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ProductError::EmptyName);
        }
        if name.len() > usize::from(u16::MAX) {
            return Err(ProductError::NameTooLong(name.len()));
        }
        Ok(Self {
            index,
            name,
            size,
            created,
        })
    }

    /// The product's index.
    pub fn index(&self) -> ProdIndex {
        self.index
    }

    /// The product's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The product's size in bytes.
    pub fn size(&self) -> ProdSize {
        self.size
    }

    /// When the product was created.
    pub fn created(&self) -> Timestamp {
        self.created
    }

    /// Number of segments the product is sliced into.
    pub fn seg_count(&self) -> u32 {
        self.size.div_ceil(u32::from(CANON_SEG_SIZE)).max(1)
    }
}

impl fmt::Display for ProdInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, \"{}\", {} bytes}}", self.index, self.name, self.size)
    }
}

/// One segment of a product's data.
///
/// The payload length is fully determined by the product size and the
/// segment offset: `min(prod_size - offset, CANON_SEG_SIZE)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSeg {
    id: DataSegId,
    prod_size: ProdSize,
    data: Bytes,
}

impl DataSeg {
    /// The expected size of the segment at `offset` in a product of
    /// `prod_size` bytes.
    pub fn segment_size(prod_size: ProdSize, offset: SegOffset) -> SegSize {
        let remaining = prod_size.saturating_sub(offset);
        remaining.min(u32::from(CANON_SEG_SIZE)) as SegSize
    }

    /// Creates a data segment, validating the payload length against the
    /// product size and offset.
    pub fn new(id: DataSegId, prod_size: ProdSize, data: Bytes) -> Result<Self, ProductError> {
        if id.offset >= prod_size {
            return Err(ProductError::OffsetOutOfBounds {
                offset: id.offset,
                size: prod_size,
            });
        }
        let expected = Self::segment_size(prod_size, id.offset);
        if data.len() != usize::from(expected) {
            return Err(ProductError::PayloadLengthMismatch {
                actual: data.len(),
                expected,
            });
        }
        Ok(Self {
            id,
            prod_size,
            data,
        })
    }

    /// The segment's identifier.
    pub fn id(&self) -> DataSegId {
        self.id
    }

    /// Size of the whole product in bytes.
    pub fn prod_size(&self) -> ProdSize {
        self.prod_size
    }

    /// The segment's payload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The payload length in bytes.
    pub fn len(&self) -> SegSize {
        self.data.len() as SegSize
    }

    /// Whether the payload is empty. Never true for a valid segment.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for DataSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {} bytes}}", self.id, self.data.len())
    }
}

/// A notice or request subject: either a whole product's information or a
/// single data segment.
///
/// Peers announce and ask for both kinds; this union lets the bookkeeper
/// track them as a single queue element and hash-map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteReq {
    /// Product information.
    Prod(ProdIndex),
    /// A data segment.
    Seg(DataSegId),
}

impl From<ProdIndex> for NoteReq {
    fn from(index: ProdIndex) -> Self {
        NoteReq::Prod(index)
    }
}

impl From<DataSegId> for NoteReq {
    fn from(id: DataSegId) -> Self {
        NoteReq::Seg(id)
    }
}

impl fmt::Display for NoteReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoteReq::Prod(index) => write!(f, "prod-info {}", index),
            NoteReq::Seg(id) => write!(f, "data-seg {}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prod_index_zero_rejected() {
        assert_eq!(ProdIndex::new(0), Err(ProductError::InvalidIndex));
        assert!(ProdIndex::new(1).is_ok());
    }

    #[test]
    fn test_prod_info_validation() {
        let index = ProdIndex::new(1).unwrap();
        assert_eq!(
            ProdInfo::new(index, "", 100).unwrap_err(),
            ProductError::EmptyName
        );

        let long = "x".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(
            ProdInfo::new(index, long, 100).unwrap_err(),
            ProductError::NameTooLong(_)
        ));

        let info = ProdInfo::new(index, "product", 1_000_000).unwrap();
        assert_eq!(info.index(), index);
        assert_eq!(info.name(), "product");
        assert_eq!(info.size(), 1_000_000);
    }

    #[test]
    fn test_segment_size() {
        let canon = u32::from(CANON_SEG_SIZE);

        // Interior segment
        assert_eq!(
            u32::from(DataSeg::segment_size(canon * 3, 0)),
            canon
        );
        // Short final segment
        assert_eq!(DataSeg::segment_size(canon + 100, canon), 100);
        // Product smaller than one segment
        assert_eq!(DataSeg::segment_size(17, 0), 17);
    }

    #[test]
    fn test_data_seg_validation() {
        let id = DataSegId::new(ProdIndex::new(5).unwrap(), 0);

        // Payload shorter than the derived size
        let err = DataSeg::new(id, 1_000_000, Bytes::from_static(b"short")).unwrap_err();
        assert!(matches!(err, ProductError::PayloadLengthMismatch { .. }));

        // Offset past the end
        let past = DataSegId::new(ProdIndex::new(5).unwrap(), 2_000_000);
        let err = DataSeg::new(past, 1_000_000, Bytes::new()).unwrap_err();
        assert!(matches!(err, ProductError::OffsetOutOfBounds { .. }));

        // Exact payload accepted
        let data = Bytes::from(vec![0xbd; usize::from(CANON_SEG_SIZE)]);
        let seg = DataSeg::new(id, 1_000_000, data).unwrap();
        assert_eq!(u32::from(seg.len()), u32::from(CANON_SEG_SIZE));
    }

    #[test]
    fn test_seg_count() {
        let index = ProdIndex::new(1).unwrap();
        let canon = u32::from(CANON_SEG_SIZE);

        let info = ProdInfo::new(index, "p", canon * 2 + 1).unwrap();
        assert_eq!(info.seg_count(), 3);

        let tiny = ProdInfo::new(index, "t", 1).unwrap();
        assert_eq!(tiny.seg_count(), 1);
    }

    #[test]
    fn test_note_req_keys() {
        use std::collections::HashSet;

        let index = ProdIndex::new(7).unwrap();
        let seg = DataSegId::new(index, 1448);

        let mut set = HashSet::new();
        set.insert(NoteReq::from(index));
        set.insert(NoteReq::from(seg));
        set.insert(NoteReq::from(index)); // duplicate

        assert_eq!(set.len(), 2);
        assert!(set.contains(&NoteReq::Prod(index)));
        assert!(set.contains(&NoteReq::Seg(seg)));
    }
}
