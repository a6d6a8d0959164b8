use super::{
    Config, Element, Error, ELEMENT_SIZE_OFFSET, GROW_ELEMENTS, HEADER_CHECKSUM_OFFSET,
    HEADER_SIZE, MAGIC, MAGIC_OFFSET, MAX_ELEMENTS, NUM_ELEMENTS_OFFSET, VECTOR_CHECKSUM_OFFSET,
};
use crate::{
    checksum::{self, Crc32},
    region::{Region, Strategy},
};
use std::{
    fs, io,
    marker::PhantomData,
    mem::{align_of, size_of},
    path::Path,
};
use tracing::{debug, warn};
use zerocopy::FromBytes;

/// On-disk header, little-endian in the first [HEADER_SIZE] bytes of the file.
struct Header {
    magic: u32,
    element_size: u32,
    num_elements: u32,
    vector_checksum: u32,
    header_checksum: u32,
}

impl Header {
    /// Decode a header from the front of `data`.
    fn decode(data: &[u8]) -> Self {
        let field = |offset: usize| u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        Self {
            magic: field(MAGIC_OFFSET),
            element_size: field(ELEMENT_SIZE_OFFSET),
            num_elements: field(NUM_ELEMENTS_OFFSET),
            vector_checksum: field(VECTOR_CHECKSUM_OFFSET),
            header_checksum: field(HEADER_CHECKSUM_OFFSET),
        }
    }

    /// Encode the header into the front of `data`.
    fn encode(&self, data: &mut [u8]) {
        data[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&self.magic.to_le_bytes());
        data[ELEMENT_SIZE_OFFSET..ELEMENT_SIZE_OFFSET + 4]
            .copy_from_slice(&self.element_size.to_le_bytes());
        data[NUM_ELEMENTS_OFFSET..NUM_ELEMENTS_OFFSET + 4]
            .copy_from_slice(&self.num_elements.to_le_bytes());
        data[VECTOR_CHECKSUM_OFFSET..VECTOR_CHECKSUM_OFFSET + 4]
            .copy_from_slice(&self.vector_checksum.to_le_bytes());
        data[HEADER_CHECKSUM_OFFSET..HEADER_CHECKSUM_OFFSET + 4]
            .copy_from_slice(&self.header_checksum.to_le_bytes());
    }
}

/// Byte range inside the checksummed prefix that has been overwritten since the
/// running checksum last agreed with the mapping. Non-contiguous overwrites are
/// merged by widening to their union.
#[derive(Clone, Copy)]
struct Dirty {
    /// First dirty byte (element-region offset).
    start: usize,
    /// One past the last dirty byte.
    end: usize,
    /// Checksum of the range's pre-edit bytes, maintained as the range widens.
    original: u32,
}

/// Implementation of a persistent file-backed vector.
pub struct Vector<T: Element> {
    region: Region,

    /// Logical length, mirrored in the mapped header.
    num_elements: usize,

    /// Checksum of the first `checked` element-region bytes as they were when
    /// it was last computed (equal to the stored body checksum).
    running: u32,

    /// Prefix length (in bytes) the running checksum covers.
    checked: usize,

    /// Overwrites inside the checksummed prefix since the last computation.
    dirty: Option<Dirty>,

    /// High-water mark of bytes written past the checksummed prefix.
    appended: usize,

    /// See [Config::partial_crc_limit_div].
    limit_div: usize,

    _marker: PhantomData<T>,
}

impl<T: Element> Vector<T> {
    /// Open the vector at `path`, creating it if missing.
    ///
    /// A missing (or zero-length) file is initialized with a fresh header; an
    /// existing file is validated field by field (magic, element size, header
    /// checksum, element count, body checksum) and rejected on the first
    /// mismatch. Rejection never auto-repairs: callers decide between
    /// [Vector::destroy]-and-recreate and escalation.
    pub fn init(path: impl AsRef<Path>, config: Config) -> Result<Self, Error> {
        let elem_size = size_of::<T>();
        if elem_size == 0 {
            return Err(Error::ZeroSizeElement);
        }
        if HEADER_SIZE % align_of::<T>() != 0 {
            return Err(Error::UnsupportedAlignment(align_of::<T>()));
        }
        if config.partial_crc_limit_div == 0 {
            return Err(Error::InvalidPartialCrcLimit);
        }
        let path = path.as_ref();

        // A zero-length file carries no header yet and is treated as absent
        // (its creator never got as far as writing one).
        let fresh = match fs::metadata(path) {
            Ok(metadata) => metadata.len() == 0,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => return Err(err.into()),
        };
        if fresh && config.strategy != Strategy::ReadOnly {
            Self::initialize(path, elem_size)?;
        }

        let region = Region::open(path, config.strategy)?;
        let data = region.as_ref();
        if data.len() < HEADER_SIZE {
            return Err(Error::HeaderTruncated(data.len() as u64));
        }
        let header = Header::decode(data);
        if header.magic != MAGIC {
            return Err(Error::WrongMagic(header.magic));
        }
        if header.element_size as usize != elem_size {
            return Err(Error::ElementSizeMismatch {
                stored: header.element_size,
                requested: elem_size as u32,
            });
        }
        let computed = checksum::hash(&data[..HEADER_CHECKSUM_OFFSET]);
        if header.header_checksum != computed {
            return Err(Error::HeaderChecksumMismatch(
                header.header_checksum,
                computed,
            ));
        }
        let num_elements = header.num_elements as usize;
        if num_elements > MAX_ELEMENTS {
            return Err(Error::InvalidElementCount(header.num_elements));
        }
        let len = num_elements * elem_size;
        if HEADER_SIZE + len > data.len() {
            return Err(Error::BodyTruncated {
                len: data.len() as u64,
                num_elements: header.num_elements,
            });
        }
        let body = checksum::hash(&data[HEADER_SIZE..HEADER_SIZE + len]);
        if header.vector_checksum != body {
            return Err(Error::ChecksumMismatch(header.vector_checksum, body));
        }
        debug!(path = ?path, num_elements, "opened vector");
        Ok(Self {
            region,
            num_elements,
            running: body,
            checked: len,
            dirty: None,
            appended: 0,
            limit_div: config.partial_crc_limit_div,
            _marker: PhantomData,
        })
    }

    /// Remove the vector file at `path`. Succeeds when the file is absent.
    ///
    /// A live handle for the same path is not invalidated; drop it first.
    pub fn destroy(path: impl AsRef<Path>) -> Result<(), Error> {
        match fs::remove_file(path.as_ref()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Logical length in elements.
    pub fn len(&self) -> usize {
        self.num_elements
    }

    /// Whether the vector holds no elements.
    pub fn is_empty(&self) -> bool {
        self.num_elements == 0
    }

    /// Elements the current file can hold without growing.
    pub fn capacity(&self) -> usize {
        self.region.len().saturating_sub(HEADER_SIZE) / size_of::<T>()
    }

    /// Borrow the element at `index`.
    ///
    /// The reference lives inside the mapping; any mutation of the vector ends
    /// the borrow (growth replaces the mapping entirely).
    pub fn get(&self, index: usize) -> Result<&T, Error> {
        if index >= self.num_elements {
            return Err(Error::IndexOutOfBounds {
                index,
                bound: self.num_elements,
            });
        }
        let elem_size = size_of::<T>();
        let start = HEADER_SIZE + index * elem_size;
        let bytes = &self.region.as_ref()[start..start + elem_size];
        // The slice length is exact and alignment was validated at init.
        Ok(T::ref_from_bytes(bytes).unwrap())
    }

    /// Borrow the first `len` elements.
    pub fn as_slice(&self) -> &[T] {
        let end = HEADER_SIZE + self.num_elements * size_of::<T>();
        let bytes = &self.region.as_ref()[HEADER_SIZE..end];
        // The slice length is a whole number of elements and alignment was
        // validated at init.
        <[T]>::ref_from_bytes(bytes).unwrap()
    }

    /// Write `value` at `index`, growing the file as needed.
    ///
    /// Writing at or past the current length extends the vector to
    /// `index + 1` elements; any gap holds whatever the file already contained
    /// (zeros in freshly grown chunks). Indices at or past [MAX_ELEMENTS] are
    /// rejected.
    pub fn set(&mut self, index: usize, value: T) -> Result<(), Error> {
        if index >= MAX_ELEMENTS {
            return Err(Error::IndexOutOfBounds {
                index,
                bound: MAX_ELEMENTS,
            });
        }
        if self.region.is_read_only() {
            return Err(Error::ReadOnly);
        }
        self.grow_to_fit(index)?;

        let elem_size = size_of::<T>();
        let start = index * elem_size;
        let end = start + elem_size;

        // Record what this write destroys before it lands: an overwrite
        // inside the checksummed prefix widens the dirty range, a write past
        // it only moves the appended watermark. A straddling write does both.
        if start < self.checked {
            self.track_overwrite(start, end.min(self.checked));
        }
        if end > self.checked {
            self.appended = self.appended.max(end - self.checked);
        }

        let data = self.region.as_mut()?;
        data[HEADER_SIZE + start..HEADER_SIZE + end].copy_from_slice(value.as_bytes());

        if index >= self.num_elements {
            self.num_elements = index + 1;
            self.store_num_elements()?;
        }
        Ok(())
    }

    /// Reduce the logical length to `len` elements.
    ///
    /// Only the length moves. The file, the mapping, and the stored checksum
    /// all stay put; the checksum remains stale until a later mutation forces
    /// [Vector::checksum] to rescan.
    pub fn truncate_to(&mut self, len: usize) -> Result<(), Error> {
        if len > self.num_elements {
            return Err(Error::InvalidLength {
                requested: len,
                len: self.num_elements,
            });
        }
        if self.region.is_read_only() {
            return Err(Error::ReadOnly);
        }
        self.num_elements = len;
        self.store_num_elements()?;
        debug!(len, "truncated vector");
        Ok(())
    }

    /// Compute the checksum of the element region, store it in the header, and
    /// return it.
    ///
    /// When the writes since the last computation are confined to a small
    /// slice of the already-checksummed prefix, the new value is spliced
    /// algebraically instead of rescanned; see the module documentation for
    /// the exact rule.
    pub fn checksum(&mut self) -> Result<u32, Error> {
        // Nothing written since the last computation: return the cached value
        // untouched. This holds even after a truncation, which deliberately
        // leaves the stored checksum stale until the next mutation.
        if self.dirty.is_none() && self.appended == 0 {
            return Ok(self.running);
        }
        self.recompute()
    }

    /// Recompute the checksum over the current element region, store it in
    /// the header, and reset the change tracking.
    fn recompute(&mut self) -> Result<u32, Error> {
        let len = self.num_elements * size_of::<T>();
        let valid = self.checked.min(len);
        let dirty_len = self.dirty.map_or(0, |dirty| dirty.end - dirty.start);
        let crc = if len >= self.checked && dirty_len * self.limit_div <= valid {
            // Splice: erase the dirty range's old contribution from the
            // running state, fold in its current bytes, and append everything
            // past the old prefix. The two erase/fold steps collapse into one
            // shifted XOR because the register is linear.
            let mut crc = self.running;
            if let Some(dirty) = self.dirty {
                let current = self.range_crc(dirty.start, dirty.end);
                crc ^= checksum::shift(
                    dirty.original ^ current,
                    (self.checked - dirty.end) as u64,
                );
            }
            let appended = self.range_crc(self.checked, len);
            checksum::combine(crc, appended, (len - self.checked) as u64)
        } else {
            self.range_crc(0, len)
        };

        self.store_checksums(crc)?;
        self.running = crc;
        self.checked = len;
        self.dirty = None;
        self.appended = 0;
        Ok(crc)
    }

    /// Flush the mapping and the header to stable storage.
    ///
    /// Does not refresh the checksum; call [Vector::checksum] first when
    /// persisting after writes. After a successful sync, a fresh
    /// [Vector::init] of the same path observes the persisted state.
    pub fn sync(&self) -> Result<(), Error> {
        self.region.sync()?;
        Ok(())
    }

    /// Write a fresh header for an empty vector at `path`.
    fn initialize(path: &Path, elem_size: usize) -> Result<(), Error> {
        let mut header = Header {
            magic: MAGIC,
            element_size: elem_size as u32,
            num_elements: 0,
            vector_checksum: Crc32::new().get(),
            header_checksum: 0,
        };
        let mut data = [0u8; HEADER_SIZE];
        header.encode(&mut data);
        header.header_checksum = checksum::hash(&data[..HEADER_CHECKSUM_OFFSET]);
        header.encode(&mut data);
        fs::write(path, data)?;
        debug!(path = ?path, "created vector file");
        Ok(())
    }

    /// Grow the file (and remap) so that `index` is addressable.
    ///
    /// The file length is always a whole number of [GROW_ELEMENTS]-element
    /// chunks; the header rides inside the first chunk. Growth never shrinks
    /// and never moves data. A grow that extends the file but fails to remap
    /// leaves the file larger than the length requires, which is benign and
    /// reconverges on the next use.
    fn grow_to_fit(&mut self, index: usize) -> Result<(), Error> {
        let elem_size = size_of::<T>();
        let needed = HEADER_SIZE + (index + 1) * elem_size;
        if needed <= self.region.len() {
            return Ok(());
        }
        let chunk = GROW_ELEMENTS * elem_size;
        let new_len = needed.div_ceil(chunk) * chunk;
        debug!(from = self.region.len(), to = new_len, "growing vector file");
        self.region.resize(new_len)?;
        Ok(())
    }

    /// Fold the element-region byte range `[start, end)` into the dirty range.
    ///
    /// Must run before the overwrite lands: extension bytes are still
    /// pristine at this point (the tracked union covers every overwrite since
    /// the last checksum), so their pre-edit checksums can be read straight
    /// from the mapping and stitched onto the stored one.
    fn track_overwrite(&mut self, start: usize, end: usize) {
        match self.dirty {
            None => {
                let original = self.range_crc(start, end);
                self.dirty = Some(Dirty {
                    start,
                    end,
                    original,
                });
            }
            Some(Dirty {
                start: dirty_start,
                end: dirty_end,
                original,
            }) => {
                let mut merged = original;
                let mut new_start = dirty_start;
                let mut new_end = dirty_end;
                if start < dirty_start {
                    let left = self.range_crc(start, dirty_start);
                    merged = checksum::combine(left, merged, (dirty_end - dirty_start) as u64);
                    new_start = start;
                }
                if end > dirty_end {
                    let right = self.range_crc(dirty_end, end);
                    merged = checksum::combine(merged, right, (end - dirty_end) as u64);
                    new_end = end;
                }
                self.dirty = Some(Dirty {
                    start: new_start,
                    end: new_end,
                    original: merged,
                });
            }
        }
    }

    /// Checksum the element-region byte range `[start, end)` as currently
    /// mapped.
    fn range_crc(&self, start: usize, end: usize) -> u32 {
        checksum::hash(&self.region.as_ref()[HEADER_SIZE + start..HEADER_SIZE + end])
    }

    /// Mirror the logical length into the mapped header.
    fn store_num_elements(&mut self) -> Result<(), Error> {
        let count = self.num_elements as u32;
        let data = self.region.as_mut()?;
        data[NUM_ELEMENTS_OFFSET..NUM_ELEMENTS_OFFSET + 4].copy_from_slice(&count.to_le_bytes());
        Ok(())
    }

    /// Store the body checksum and refresh the header checksum over it.
    fn store_checksums(&mut self, crc: u32) -> Result<(), Error> {
        let data = self.region.as_mut()?;
        data[VECTOR_CHECKSUM_OFFSET..VECTOR_CHECKSUM_OFFSET + 4]
            .copy_from_slice(&crc.to_le_bytes());
        let header_crc = checksum::hash(&data[..HEADER_CHECKSUM_OFFSET]);
        data[HEADER_CHECKSUM_OFFSET..HEADER_CHECKSUM_OFFSET + 4]
            .copy_from_slice(&header_crc.to_le_bytes());
        Ok(())
    }
}

impl<T: Element> Drop for Vector<T> {
    fn drop(&mut self) {
        if self.region.is_read_only() {
            return;
        }
        // Reconcile the stored checksum with the current region before
        // flushing, so a clean drop reopens without surprises: pending writes
        // need folding in, and a bare truncation leaves the stored value (and
        // the header checksum over the lowered length) describing more bytes
        // than the length covers. Drop has no way to report errors, so log
        // them.
        let stale = self.dirty.is_some()
            || self.appended != 0
            || self.checked != self.num_elements * size_of::<T>();
        let result = if stale {
            self.recompute().map(|_| ())
        } else {
            Ok(())
        };
        if let Err(err) = result.and_then(|()| self.sync()) {
            warn!(?err, "failed to persist vector on drop");
        }
    }
}
