//! Byte-addressable mapping capability over a file.
//!
//! A [`Mapping`] hands out reads and writes at arbitrary byte offsets;
//! whether the bytes hit a plain memory map or a lazily decrypted page
//! cache is the implementation's business. The ring store above is
//! written against this trait only.

use std::fs::File;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::enc::EncMapping;
use crate::error::{EncMapError, EncMapResult};
use crate::keys::generate_file_key;
use crate::pool::PageManagerPool;

/// Expected access pattern; drives read-ahead in the encrypted mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Sequential scanning (e.g. recovery): prefetch aggressively.
    Read,
    /// Normal operation: fault pages in one at a time.
    ReadWrite,
}

/// Byte-addressable read/write over a fixed-size range whose pages may be
/// lazily decrypted on first touch.
pub trait Mapping: Send {
    /// Size of the mapped range in bytes.
    fn len(&self) -> usize;

    /// True if the mapped range is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> EncMapResult<()>;

    /// Copies `data` into the mapping starting at `offset`.
    fn write(&self, offset: usize, data: &[u8]) -> EncMapResult<()>;

    /// Zeroes `len` bytes starting at `offset`.
    fn zero(&self, offset: usize, len: usize) -> EncMapResult<()>;

    /// Flushes the given byte range to the backing file.
    fn sync_range(&self, offset: usize, len: usize) -> EncMapResult<()>;

    /// Flushes the whole mapping to the backing file.
    fn sync(&self) -> EncMapResult<()>;

    /// Installs a new file key. Destructive on cached state: callers that
    /// care about pending writes must `sync` first.
    fn set_key(&self, key: &[u8]) -> EncMapResult<()>;

    /// Declares the expected access pattern.
    fn set_access_mode(&self, mode: AccessMode);
}

/// Bounds check shared by the mapping implementations.
pub(crate) fn check_bounds(offset: usize, len: usize, size: usize) -> EncMapResult<()> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(EncMapError::OutOfBounds { offset, len, size });
    }
    Ok(())
}

/// Plain memory map; reads and writes go straight to the file pages.
pub struct RawMapping {
    map: Mutex<MmapMut>,
    size: usize,
}

impl RawMapping {
    pub fn new(file: &File) -> EncMapResult<Self> {
        let size = file.metadata()?.len() as usize;
        // SAFETY: the caller owns the file; the cache assumes exclusive
        // access to it for the life of the process.
        let map = unsafe { MmapOptions::new().len(size).map_mut(file)? };
        Ok(Self {
            map: Mutex::new(map),
            size,
        })
    }
}

impl Mapping for RawMapping {
    fn len(&self) -> usize {
        self.size
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> EncMapResult<()> {
        check_bounds(offset, buf.len(), self.size)?;
        let map = self.map.lock();
        buf.copy_from_slice(&map[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, offset: usize, data: &[u8]) -> EncMapResult<()> {
        check_bounds(offset, data.len(), self.size)?;
        let mut map = self.map.lock();
        map[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn zero(&self, offset: usize, len: usize) -> EncMapResult<()> {
        check_bounds(offset, len, self.size)?;
        let mut map = self.map.lock();
        map[offset..offset + len].fill(0);
        Ok(())
    }

    fn sync_range(&self, offset: usize, len: usize) -> EncMapResult<()> {
        check_bounds(offset, len, self.size)?;
        self.map.lock().flush_range(offset, len)?;
        Ok(())
    }

    fn sync(&self) -> EncMapResult<()> {
        self.map.lock().flush()?;
        Ok(())
    }

    fn set_key(&self, _key: &[u8]) -> EncMapResult<()> {
        Ok(())
    }

    fn set_access_mode(&self, _mode: AccessMode) {}
}

/// Options for [`create_mapping`].
#[derive(Debug, Clone)]
pub struct MappingOptions {
    /// Layer the encrypted page cache over the file.
    pub encrypt: bool,
    /// Cache page size in bytes; must be a multiple of the OS page.
    pub cache_page_size: usize,
    /// Total plaintext cache size in bytes.
    pub cache_total_size: usize,
    /// Flush dirty pages when the mapping is dropped.
    pub sync_on_destroy: bool,
    /// Bytes at the head of the file that stay plaintext.
    pub plaintext_prefix: usize,
}

/// Creates the mapping for `file`: a [`RawMapping`] when encryption is
/// off, otherwise an [`EncMapping`] seeded with a throwaway random file
/// key (the real key is installed later via [`Mapping::set_key`]).
pub fn create_mapping(
    file: &File,
    options: &MappingOptions,
    pool: &Arc<PageManagerPool>,
) -> EncMapResult<Box<dyn Mapping>> {
    if !options.encrypt {
        return Ok(Box::new(RawMapping::new(file)?));
    }
    let key = generate_file_key();
    Ok(Box::new(EncMapping::new(file, &key, options, pool)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn scratch_file(len: usize) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f
    }

    #[test]
    fn raw_mapping_read_write() {
        let file = scratch_file(8192);
        let map = RawMapping::new(&file).unwrap();
        assert_eq!(map.len(), 8192);

        map.write(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        map.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        map.zero(100, 5).unwrap();
        map.read(100, &mut buf).unwrap();
        assert_eq!(&buf, &[0u8; 5]);
    }

    #[test]
    fn raw_mapping_bounds() {
        let file = scratch_file(4096);
        let map = RawMapping::new(&file).unwrap();
        let mut buf = [0u8; 8];
        assert!(map.read(4090, &mut buf).is_err());
        assert!(map.write(usize::MAX, b"x").is_err());
    }
}
