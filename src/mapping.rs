//! File access strategies behind a two-method interface.
//!
//! `fetch` makes a byte range of the backing file addressable and returns a
//! pointer that stays valid until the matching `store`; `store` releases
//! the range, writing back or flushing as the strategy requires. One
//! strategy is chosen at open time:
//!
//! - whole-file mmap (the default),
//! - per-region mmap (`MAPRGNS`, or forced when the file exceeds the
//!   address-space limit),
//! - plain `pread`/`pwrite` into heap buffers (`NOMAP`).

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::OpenFlags;
use crate::error::{PqError, Result, corrupt};

pub(crate) trait RegionIo: Send {
    /// Make `[offset, offset+extent)` addressable. The pointer stays valid
    /// until the matching `store` for this offset.
    fn fetch(&mut self, offset: u64, extent: usize, write: bool) -> Result<NonNull<u8>>;

    /// Release a fetched range, writing back if `modified`.
    fn store(&mut self, offset: u64, extent: usize, modified: bool) -> Result<()>;

    /// Flush everything to stable storage (close path).
    fn sync(&mut self) -> Result<()>;
}

/// Pick the strategy for this open.
pub(crate) fn open_io(
    file: &Arc<File>,
    total_size: u64,
    flags: OpenFlags,
) -> Result<Box<dyn RegionIo>> {
    let readonly = flags.contains(OpenFlags::READONLY);
    let private = flags.contains(OpenFlags::PRIVATE);
    if flags.contains(OpenFlags::NOMAP) {
        return Ok(Box::new(FileIo::new(Arc::clone(file))));
    }
    // Region-by-region mapping is forced when the whole file cannot fit in
    // the address space.
    if flags.contains(OpenFlags::MAPRGNS) || total_size > isize::MAX as u64 {
        return Ok(Box::new(RegionMap::new(Arc::clone(file), readonly, private)));
    }
    Ok(Box::new(WholeFile::new(file, total_size, readonly, private)?))
}

enum MapKind {
    Shared(MmapRaw),
    Private(MmapMut),
    ReadOnly(MmapRaw),
}

impl MapKind {
    fn make(file: &File, offset: u64, len: usize, readonly: bool, private: bool) -> Result<MapKind> {
        let mut opts = MmapOptions::new();
        opts.offset(offset).len(len);
        let kind = if private {
            MapKind::Private(unsafe { opts.map_copy(file)? })
        } else if readonly {
            MapKind::ReadOnly(opts.map_raw_read_only(file)?)
        } else {
            MapKind::Shared(opts.map_raw(file)?)
        };
        Ok(kind)
    }

    fn base(&mut self) -> *mut u8 {
        match self {
            MapKind::Shared(m) | MapKind::ReadOnly(m) => m.as_mut_ptr(),
            MapKind::Private(m) => m.as_mut_ptr(),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            MapKind::Shared(m) => m.flush()?,
            // Private writes never reach the file; read-only has nothing
            // to flush.
            MapKind::Private(_) | MapKind::ReadOnly(_) => {}
        }
        Ok(())
    }
}

/// One shared mapping covering the entire file.
struct WholeFile {
    map: MapKind,
    len: u64,
    readonly: bool,
}

impl WholeFile {
    fn new(file: &Arc<File>, total: u64, readonly: bool, private: bool) -> Result<WholeFile> {
        let map = MapKind::make(file, 0, total as usize, readonly, private)?;
        Ok(WholeFile {
            map,
            len: total,
            readonly,
        })
    }
}

impl RegionIo for WholeFile {
    fn fetch(&mut self, offset: u64, extent: usize, write: bool) -> Result<NonNull<u8>> {
        if write && self.readonly {
            return Err(PqError::Invalid("write access to a read-only queue"));
        }
        if offset.checked_add(extent as u64).is_none_or(|end| end > self.len) {
            return Err(corrupt!(
                "fetch of [{offset:#x}, +{extent}) outside the file ({} bytes)",
                self.len
            ));
        }
        // SAFETY: bounds checked above; the mapping lives as long as self.
        let ptr = unsafe { self.map.base().add(offset as usize) };
        Ok(NonNull::new(ptr).expect("mapped base is non-null"))
    }

    fn store(&mut self, _offset: u64, _extent: usize, _modified: bool) -> Result<()> {
        // The shared mapping is coherent across processes; flushing is
        // deferred to sync().
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.map.flush()
    }
}

struct ActiveMap {
    offset: u64,
    extent: usize,
    lead: usize,
    map: MapKind,
}

/// A fresh mapping per fetched region, unmapped (and flushed) on store.
struct RegionMap {
    file: Arc<File>,
    readonly: bool,
    private: bool,
    page: u64,
    active: Vec<ActiveMap>,
}

impl RegionMap {
    fn new(file: Arc<File>, readonly: bool, private: bool) -> RegionMap {
        RegionMap {
            file,
            readonly,
            private,
            page: page_size::get() as u64,
            active: Vec::new(),
        }
    }
}

impl RegionIo for RegionMap {
    fn fetch(&mut self, offset: u64, extent: usize, write: bool) -> Result<NonNull<u8>> {
        if write && self.readonly {
            return Err(PqError::Invalid("write access to a read-only queue"));
        }
        debug_assert!(self.active.iter().all(|a| a.offset != offset));
        // mmap offsets must be page-aligned; map from the enclosing page.
        let astart = offset - offset % self.page;
        let lead = (offset - astart) as usize;
        let mut map = MapKind::make(&self.file, astart, lead + extent, self.readonly, self.private)?;
        // SAFETY: the mapping covers lead + extent bytes.
        let ptr = unsafe { map.base().add(lead) };
        self.active.push(ActiveMap {
            offset,
            extent,
            lead,
            map,
        });
        Ok(NonNull::new(ptr).expect("mapped base is non-null"))
    }

    fn store(&mut self, offset: u64, extent: usize, modified: bool) -> Result<()> {
        let at = self
            .active
            .iter()
            .position(|a| a.offset == offset && a.extent == extent)
            .ok_or(PqError::Invalid("store of a range that was never fetched"))?;
        let entry = self.active.swap_remove(at);
        if modified {
            entry.map.flush()?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        for entry in &self.active {
            entry.map.flush()?;
        }
        Ok(())
    }
}

struct IoBuf {
    offset: u64,
    len: usize,
    /// u64 storage so callers may reinterpret the bytes as index records.
    words: Box<[u64]>,
}

impl IoBuf {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

/// No mapping at all: ranges are read into heap buffers and written back
/// on store.
struct FileIo {
    file: Arc<File>,
    bufs: Vec<IoBuf>,
}

impl FileIo {
    fn new(file: Arc<File>) -> FileIo {
        FileIo {
            file,
            bufs: Vec::new(),
        }
    }
}

impl RegionIo for FileIo {
    fn fetch(&mut self, offset: u64, extent: usize, _write: bool) -> Result<NonNull<u8>> {
        debug_assert!(self.bufs.iter().all(|b| b.offset != offset));
        let words = vec![0u64; extent.div_ceil(8)].into_boxed_slice();
        let mut entry = IoBuf {
            offset,
            len: extent,
            words,
        };
        self.file.read_exact_at(entry.bytes_mut(), offset)?;
        // Boxed storage keeps the address stable while the Vec grows.
        let ptr = NonNull::new(entry.words.as_mut_ptr().cast::<u8>())
            .expect("boxed slice is non-null");
        self.bufs.push(entry);
        Ok(ptr)
    }

    fn store(&mut self, offset: u64, extent: usize, modified: bool) -> Result<()> {
        let at = self
            .bufs
            .iter()
            .position(|b| b.offset == offset && b.len == extent)
            .ok_or(PqError::Invalid("store of a range that was never fetched"))?;
        let entry = self.bufs.swap_remove(at);
        if modified {
            self.file.write_all_at(entry.bytes(), offset)?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
