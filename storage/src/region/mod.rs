//! An owned memory mapping of a file's bytes.
//!
//! [Region] maps the entire current length of a file into the process and hands
//! out byte views of it. Writes through the mapping are visible to later reads
//! through the same handle, and reach the file itself according to the chosen
//! [Strategy]:
//!
//! - [Strategy::ReadOnly]: no mutable views, no growth.
//! - [Strategy::ReadWriteManual]: dirty pages reach the file only when
//!   [Region::flush] (or [Region::sync]) is called; dropping the region flushes
//!   as a last resort.
//! - [Strategy::ReadWriteAuto]: the OS writes dirty pages back on its own
//!   schedule; [Region::sync] remains available as an explicit barrier.
//!
//! # Growth
//!
//! [Region::resize] extends the underlying file and replaces the mapping with a
//! larger one. This invalidates every pointer previously derived from the
//! region, which the borrow checker enforces: views borrow the region and a
//! resize requires exclusive access.
//!
//! # Platform
//!
//! Unix only. The mapping is driven directly through `libc`
//! (`mmap`/`munmap`/`msync`/`madvise`).

mod storage;
pub use storage::Region;

use thiserror::Error;

/// Errors that can occur when interacting with a [Region].
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot map an empty file")]
    EmptyFile,
    #[error("mmap failed: {0}")]
    MapFailed(std::io::Error),
    #[error("munmap failed: {0}")]
    UnmapFailed(std::io::Error),
    #[error("msync failed: {0}")]
    FlushFailed(std::io::Error),
    #[error("madvise failed: {0}")]
    AdviseFailed(std::io::Error),
    #[error("region is read-only")]
    ReadOnly,
}

/// How a [Region] is opened and written back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Read-only mapping. Mutable views and growth are refused.
    ReadOnly,
    /// Read-write mapping whose durability is the caller's responsibility:
    /// nothing is guaranteed to reach the file until [Region::flush] or
    /// [Region::sync] returns.
    ReadWriteManual,
    /// Read-write mapping with OS-driven writeback.
    ReadWriteAuto,
}

/// Expected access pattern, forwarded to the OS as a paging hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// No special treatment.
    Normal,
    /// Random access: read-ahead is wasted effort.
    Random,
    /// Sequential access: aggressive read-ahead pays off.
    Sequential,
    /// The range will be needed soon.
    WillNeed,
    /// The range will not be needed soon.
    DontNeed,
}
