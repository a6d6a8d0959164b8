//! A persistent, random-access array of fixed-size elements in a mapped file.
//!
//! [Vector] stores elements of one fixed-size type contiguously in a single
//! file behind a self-describing header, and maps the whole file into memory
//! for access. Every open validates the header and a CRC32 over the element
//! region, so corruption (a partial write, a flipped byte, a foreign file) is
//! detected deterministically before any data is relied on.
//!
//! # Format
//!
//! ```text
//! +------------------+---------------------------------------------+
//! |  Header (32 B)   |  Element region: len * elem_size (+ spare)  |
//! +------------------+---------------------------------------------+
//!
//! Header (u32 fields, little-endian; padded with zeros to 32 bytes):
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+...+---+
//! | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 |10 |11 |12 |13 |14 |15 |16 |...|31 |
//! +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+...+---+
//! |     Magic     | Element size  | Num elements  |   Body CRC    | Header CRC|
//! +---------------+---------------+---------------+---------------+-----------+
//! ```
//!
//! The body CRC covers the first `num_elements * elem_size` bytes of the
//! element region; the header CRC covers the 16 bytes before it. Both use the
//! register described in [crate::checksum]. `num_elements` is the logical
//! length; the file is usually longer (spare capacity from chunked growth).
//!
//! # Growth
//!
//! The file starts at exactly the header size. The first [Vector::set] past the
//! current capacity extends the file to the next multiple of
//! [GROW_ELEMENTS] elements (the header rides inside the first chunk) and
//! remaps. Growth never moves data and never happens on read. The element count
//! is capped at [MAX_ELEMENTS].
//!
//! # Incremental checksums
//!
//! Recomputing a CRC over the whole element region on every [Vector::checksum]
//! call would make small edits expensive, so the vector tracks what changed
//! since the checksum last agreed with the mapping:
//!
//! - Overwrites inside the already-checksummed prefix widen a single dirty
//!   byte range, alongside a running CRC of the range's *pre-edit* bytes
//!   (captured from the mapping before each overwrite lands).
//! - Writes past the prefix only extend an appended-length watermark; their
//!   bytes have never been checksummed and are always scanned.
//!
//! When the dirty range is a small fraction of the checksummed prefix
//! (see [Config::partial_crc_limit_div]), the new checksum is spliced
//! algebraically: the old range's contribution is erased, the new bytes'
//! contribution combined in, and the appended tail folded on. Otherwise the
//! region is rescanned linearly. Both paths store the result in the header and
//! return it.
//!
//! Truncation is deliberately lazy: [Vector::truncate_to] only lowers the
//! length, and the stored checksum stays stale until a later mutation forces a
//! rescan. A checksum call with no intervening writes returns the cached value
//! unchanged.
//!
//! # Sync
//!
//! [Vector::sync] flushes the mapping and the header; it does *not* refresh the
//! checksum. Call [Vector::checksum] first when persisting after writes.
//! Dropping the vector reconciles and flushes automatically (best-effort),
//! including after a truncation, so a cleanly dropped file always reopens. A
//! manual sync after a truncation without a checksum call stores a stale body
//! CRC, and the next open will reject the file; callers choose between
//! recomputing before sync and delete-and-recreate.
//!
//! # Concurrency
//!
//! A [Vector] is single-threaded: it is not internally synchronized, and two
//! handles must never map the same file simultaneously.
//!
//! # Example
//!
//! ```rust
//! use sift_storage::{
//!     region::Strategy,
//!     vector::{Config, Vector},
//! };
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("weights.vec");
//!
//! // Create a vector and write some elements
//! let mut vector = Vector::<u8>::init(&path, Config::new(Strategy::ReadWriteAuto)).unwrap();
//! for (i, byte) in b"abcde".iter().enumerate() {
//!     vector.set(i, *byte).unwrap();
//! }
//! assert_eq!(vector.len(), 5);
//!
//! // Refresh the checksum and persist
//! vector.checksum().unwrap();
//! vector.sync().unwrap();
//! drop(vector);
//!
//! // Reopen and verify
//! let vector = Vector::<u8>::init(&path, Config::new(Strategy::ReadWriteAuto)).unwrap();
//! assert_eq!(vector.as_slice(), b"abcde");
//! ```

mod storage;
pub use storage::Vector;

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::region::Strategy;

/// Marker for types that can live in a mapped element region: fixed size, no
/// padding, no pointers, every bit pattern valid.
pub trait Element: FromBytes + IntoBytes + Immutable + KnownLayout + Copy {}

impl<T: FromBytes + IntoBytes + Immutable + KnownLayout + Copy> Element for T {}

/// Hard cap on the number of elements a vector can hold.
pub const MAX_ELEMENTS: usize = 1 << 20;

/// Number of elements the file grows by at a time.
pub const GROW_ELEMENTS: usize = 1 << 14;

/// Size of the on-disk header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Identifies a vector file; anything else is rejected at open.
const MAGIC: u32 = 0x5349_4631;

/// Default for [Config::partial_crc_limit_div].
const PARTIAL_CRC_LIMIT_DIV: usize = 10;

// Byte offsets of the header fields.
const MAGIC_OFFSET: usize = 0;
const ELEMENT_SIZE_OFFSET: usize = 4;
const NUM_ELEMENTS_OFFSET: usize = 8;
const VECTOR_CHECKSUM_OFFSET: usize = 12;
const HEADER_CHECKSUM_OFFSET: usize = 16;

/// Errors that can occur when interacting with a [Vector].
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("region error: {0}")]
    Region(#[from] crate::region::Error),
    #[error("wrong magic: {0:#010x}")]
    WrongMagic(u32),
    #[error("element size mismatch: file has {stored}, requested {requested}")]
    ElementSizeMismatch { stored: u32, requested: u32 },
    #[error("header checksum mismatch: stored {0}, computed {1}")]
    HeaderChecksumMismatch(u32, u32),
    #[error("checksum mismatch: stored {0}, computed {1}")]
    ChecksumMismatch(u32, u32),
    #[error("header truncated: {0} byte file")]
    HeaderTruncated(u64),
    #[error("file too small for {num_elements} elements ({len} bytes)")]
    BodyTruncated { len: u64, num_elements: u32 },
    #[error("corrupt element count: {0}")]
    InvalidElementCount(u32),
    #[error("index {index} out of bounds ({bound})")]
    IndexOutOfBounds { index: usize, bound: usize },
    #[error("invalid length {requested}: vector holds {len} elements")]
    InvalidLength { requested: usize, len: usize },
    #[error("element type has zero size")]
    ZeroSizeElement,
    #[error("element alignment {0} does not divide the header size")]
    UnsupportedAlignment(usize),
    #[error("partial crc limit divisor must be nonzero")]
    InvalidPartialCrcLimit,
    #[error("vector is read-only")]
    ReadOnly,
}

/// Configuration for [Vector] storage.
#[derive(Clone)]
pub struct Config {
    /// How the backing file is mapped and written back.
    pub strategy: Strategy,

    /// Divisor bounding incremental checksum work: if the dirty range exceeds
    /// `1/partial_crc_limit_div` of the checksummed region, [Vector::checksum]
    /// falls back to a full rescan. Tunable; does not affect results.
    pub partial_crc_limit_div: usize,
}

impl Config {
    /// Create a configuration with the default incremental checksum threshold.
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            partial_crc_limit_div: PARTIAL_CRC_LIMIT_DIV,
        }
    }
}
