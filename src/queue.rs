//! The product queue: public operations over the shared file.
//!
//! Every operation follows the same locking discipline: take the
//! control-region byte-range lock (exclusive to mutate the indices, shared
//! to read them), then any data-region locks, and release in reverse
//! order. The one exception is sequencing, which releases the control
//! region once the product's data region is locked and its metadata
//! parsed, so slow consumers do not stall writers.
//!
//! A process that dies mid-operation loses its `fcntl` locks to the
//! kernel; because every index mutation happens entirely between matching
//! acquire/release pairs of the control lock, survivors see a consistent
//! (if slightly stale) queue.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{PqError, Result, corrupt};
use crate::fb::Fb;
use crate::header::{
    self, Geometry, HEADER_SIZE, Header, METRICS_MAGIC, METRICS_MAGIC_2, WRITE_COUNT_MAGIC,
};
use crate::lock::{FileLock, LockMode, RegionUse, UseList};
use crate::mapping::{self, RegionIo};
use crate::product::{self, ClassFilter, ProductInfo, Signature};
use crate::region::Rl;
use crate::signal::{self, SigGuard};
use crate::stats::{MvrtMetrics, QueueStats};
use crate::sx::Sx;
use crate::time::Timestamp;
use crate::tq::Tq;
use crate::{DEFAULT_ALIGN, Relation};

bitflags! {
    /// Open/create options.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading only.
        const READONLY = 1 << 0;
        /// Fail creation if the file already exists.
        const NOCLOBBER = 1 << 1;
        /// Disable advisory locking (single-process use only).
        const NOLOCK = 1 << 2;
        /// Use `pread`/`pwrite` instead of memory mapping.
        const NOMAP = 1 << 3;
        /// Map region-by-region instead of the whole file. Forced when the
        /// file would not fit in the address space.
        const MAPRGNS = 1 << 4;
        /// Private (copy-on-write) mapping; writes are never shared.
        const PRIVATE = 1 << 5;
        /// Accepted for source compatibility. In-process serialization is
        /// already enforced by the exclusive receiver on every operation;
        /// callers sharing a handle across threads wrap it in a mutex.
        const THREADSAFE = 1 << 6;
    }
}

/// What a sequencing callback did with the product it was shown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// The product was consumed; the cursor stays advanced.
    Consumed,
    /// The product could not be handled; the cursor is rewound one tick so
    /// a later call revisits it. (The rewind presumes the clock tick
    /// exceeds one microsecond, which is not true everywhere; inherited
    /// behavior.)
    Deferred,
}

/// Fetched control region: the header and the index segment, both held
/// under the control byte-range lock.
struct Ctl {
    hdr: NonNull<u8>,
    idx: NonNull<u8>,
    _sig: Option<SigGuard>,
}

/// Typed views over the control region, valid while it is fetched.
struct Views<'a> {
    hdr: &'a mut Header,
    rl: Rl<'a>,
    tq: Tq<'a>,
    fb: Fb<'a>,
    sx: Sx<'a>,
}

impl Ctl {
    #[allow(clippy::type_complexity)]
    fn segments<'a>(
        &'a mut self,
        geom: &Geometry,
    ) -> (
        &'a mut [u8],
        &'a mut [u8],
        &'a mut [u8],
        &'a mut [u8],
        &'a mut [u8],
    ) {
        // SAFETY: the pointers come from RegionIo::fetch for exactly these
        // extents; the control lock is held and `&mut self` makes these
        // the only live references.
        let hdr = unsafe { slice::from_raw_parts_mut(self.hdr.as_ptr(), HEADER_SIZE) };
        let idx = unsafe { slice::from_raw_parts_mut(self.idx.as_ptr(), geom.index_size as usize) };
        let (rl, rest) = idx.split_at_mut(geom.rl_size);
        let (tq, rest) = rest.split_at_mut(geom.tq_size);
        let (fb, sx) = rest.split_at_mut(geom.fb_size);
        (hdr, rl, tq, fb, sx)
    }

    fn views<'a>(&'a mut self, geom: &Geometry) -> Result<Views<'a>> {
        let (hdr, rl, tq, fb, sx) = self.segments(geom);
        Ok(Views {
            hdr: bytemuck::from_bytes_mut(hdr),
            rl: Rl::attach(rl)?,
            tq: Tq::attach(tq)?,
            fb: Fb::attach(fb)?,
            sx: Sx::attach(sx)?,
        })
    }
}

/// A shared, file-backed, fixed-capacity product queue.
pub struct ProductQueue {
    path: PathBuf,
    file: Arc<File>,
    geom: Geometry,
    locker: FileLock,
    io: Box<dyn RegionIo>,
    riul: UseList,
    /// Sequencing position: insertion timestamp plus disambiguating
    /// offset. `Timestamp::NONE` until first use.
    cursor: (Timestamp, u64),
    rng: oorandom::Rand32,
    writable: bool,
    write_counted: bool,
    closed: bool,
}

// SAFETY: the raw pointers in `riul` (and inside the mapping strategies)
// reference file-backed storage owned by `io`; they move with the struct
// and are only dereferenced through `&mut self` methods.
unsafe impl Send for ProductQueue {}

fn read_header(file: &File) -> Result<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut buf, 0)?;
    Ok(bytemuck::pod_read_unaligned(&buf))
}

fn rng_for_handle() -> oorandom::Rand32 {
    let seed = (u64::from(std::process::id()) << 32) ^ Timestamp::now().usec as u64;
    oorandom::Rand32::new(seed)
}

impl ProductQueue {
    /// Create a new queue file. The data segment gets `data_bytes`
    /// (rounded up to the alignment; `align` of 0 picks the default) and
    /// the indices are sized for `nprods` products. The creating handle
    /// is open for writing and counted in the writer counter.
    pub fn create<P: AsRef<Path>>(
        path: P,
        mode: u32,
        flags: OpenFlags,
        align: u64,
        data_bytes: u64,
        nprods: u64,
    ) -> Result<ProductQueue> {
        if flags.contains(OpenFlags::READONLY) {
            return Err(PqError::Invalid("cannot create a queue read-only"));
        }
        if nprods == 0 {
            return Err(PqError::Invalid("product capacity must be at least 1"));
        }
        let align = (if align == 0 { DEFAULT_ALIGN } else { align }).next_multiple_of(8);
        let geom = Geometry::compute(align, data_bytes, nprods)?;

        let mut opts = OpenOptions::new();
        opts.read(true).write(true).mode(mode);
        if flags.contains(OpenFlags::NOCLOBBER) {
            opts.create_new(true);
        } else {
            opts.create(true).truncate(true);
        }
        let file = Arc::new(opts.open(path.as_ref())?);
        file.set_len(geom.total_size)?;

        let locker = FileLock::new(Arc::clone(&file), !flags.contains(OpenFlags::NOLOCK));
        let io = mapping::open_io(&file, geom.total_size, flags)?;
        let mut pq = ProductQueue {
            path: path.as_ref().to_owned(),
            file,
            geom,
            locker,
            io,
            riul: UseList::default(),
            cursor: (Timestamp::NONE, 0),
            rng: rng_for_handle(),
            writable: true,
            write_counted: true,
            closed: false,
        };

        let nprods = geom.nprods;
        let mut ctl = pq.ctl_get(LockMode::Exclusive)?;
        let init: Result<()> = {
            let (hdr_bytes, rl_b, tq_b, fb_b, sx_b) = ctl.segments(&geom);
            *bytemuck::from_bytes_mut::<Header>(hdr_bytes) = geom.initial_header();
            let mut fb = Fb::create(fb_b, nprods);
            Sx::create(sx_b, nprods);
            match Tq::create(tq_b, nprods, &mut fb) {
                Ok(_) => Rl::create(
                    rl_b,
                    nprods,
                    &mut fb,
                    &mut pq.rng,
                    geom.data_off,
                    geom.data_size,
                )
                .map(|_| ()),
                Err(e) => Err(e),
            }
        };
        let rel = pq.ctl_rel(ctl, init.is_ok());
        init.and(rel)?;
        log::debug!(
            "created {}: {} data bytes at {:#x}, {} index bytes at {:#x}, {nprods} products",
            pq.path.display(),
            geom.data_size,
            geom.data_off,
            geom.index_size,
            geom.index_off,
        );
        Ok(pq)
    }

    /// Open an existing queue. Writable opens bump the on-disk writer
    /// counter (and fail with `WriterLimit` if it is saturated).
    pub fn open<P: AsRef<Path>>(path: P, flags: OpenFlags) -> Result<ProductQueue> {
        let writable =
            !flags.contains(OpenFlags::READONLY) && !flags.contains(OpenFlags::PRIVATE);
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(writable)
                .open(path.as_ref())?,
        );
        let locker = FileLock::new(Arc::clone(&file), !flags.contains(OpenFlags::NOLOCK));

        // Read the header under a shared lock long enough to learn the
        // geometry.
        locker.lock(0, HEADER_SIZE as u64, LockMode::Shared, true)?;
        let hdr = read_header(&file);
        let _ = locker.unlock(0, HEADER_SIZE as u64);
        let hdr = hdr?;
        header::validate(&hdr)?;
        let geom = Geometry::from_header(&hdr)?;

        let io = mapping::open_io(&file, geom.total_size, flags)?;
        let mut pq = ProductQueue {
            path: path.as_ref().to_owned(),
            file,
            geom,
            locker,
            io,
            riul: UseList::default(),
            cursor: (Timestamp::NONE, 0),
            rng: rng_for_handle(),
            writable,
            write_counted: false,
            closed: false,
        };
        if writable {
            pq.ensure_metrics_init()?;
            adjust_write_count(&pq.file, &pq.locker, |count| {
                if count == u32::MAX {
                    Err(PqError::WriterLimit)
                } else {
                    Ok(count + 1)
                }
            })?;
            pq.write_counted = true;
        }
        log::debug!("opened {} ({flags:?})", pq.path.display());
        Ok(pq)
    }

    /// First-writer initialization of the metrics block, race-free under
    /// the control lock. Queues created by this crate arrive initialized;
    /// this recovers files whose metrics block was never stamped.
    fn ensure_metrics_init(&mut self) -> Result<()> {
        let _sig = SigGuard::block()?;
        self.locker
            .lock(0, self.geom.data_off, LockMode::Exclusive, true)?;
        let result = read_header(&self.file).and_then(|mut hdr| {
            if hdr.metrics_magic != METRICS_MAGIC || hdr.metrics_magic_2 != METRICS_MAGIC_2 {
                hdr.metrics_magic = METRICS_MAGIC;
                hdr.metrics_magic_2 = METRICS_MAGIC_2;
                hdr.most_recent = Timestamp::NONE;
                hdr.min_virt_res_time = Timestamp::NONE;
                hdr.is_full = 0;
                hdr.mvrt_bytes = 0;
                hdr.mvrt_slots = 0;
                let from = std::mem::offset_of!(Header, metrics_magic);
                self.file
                    .write_all_at(&bytemuck::bytes_of(&hdr)[from..], from as u64)?;
                log::warn!(
                    "initialized metrics block on {} (was unstamped)",
                    self.path.display()
                );
            }
            Ok(())
        });
        let rel = self.locker.unlock(0, self.geom.data_off);
        result.and(rel)
    }

    /// Flush, release the writer count, and close. Dropping the handle
    /// does the same on a best-effort basis.
    pub fn close(mut self) -> Result<()> {
        self.close_impl()
    }

    /// The path this queue was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn close_impl(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for e in self.riul.drain() {
            log::warn!(
                "region {:#x}+{} still {:?}-locked at close; releasing",
                e.offset,
                e.extent,
                e.mode
            );
            let _ = self.io.store(e.offset, e.extent as usize, false);
            let _ = self.locker.unlock(e.offset, e.extent);
        }
        if self.writable {
            self.io.sync()?;
        }
        if self.write_counted {
            self.write_counted = false;
            adjust_write_count(&self.file, &self.locker, |count| {
                if count == 0 {
                    log::warn!("writer count already 0 at close");
                    Ok(0)
                } else {
                    Ok(count - 1)
                }
            })?;
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(PqError::Invalid("queue opened read-only"))
        }
    }

    // ---- control region ----

    fn ctl_get(&mut self, mode: LockMode) -> Result<Ctl> {
        let sig = if mode == LockMode::Exclusive {
            Some(SigGuard::block()?)
        } else {
            None
        };
        self.locker.lock(0, self.geom.data_off, mode, true)?;
        let write = mode == LockMode::Exclusive;
        let hdr = match self.io.fetch(0, HEADER_SIZE, write) {
            Ok(p) => p,
            Err(e) => {
                let _ = self.locker.unlock(0, self.geom.data_off);
                return Err(e);
            }
        };
        let idx = match self
            .io
            .fetch(self.geom.index_off, self.geom.index_size as usize, write)
        {
            Ok(p) => p,
            Err(e) => {
                let _ = self.io.store(0, HEADER_SIZE, false);
                let _ = self.locker.unlock(0, self.geom.data_off);
                return Err(e);
            }
        };
        Ok(Ctl {
            hdr,
            idx,
            _sig: sig,
        })
    }

    fn ctl_rel(&mut self, ctl: Ctl, modified: bool) -> Result<()> {
        let r1 = self
            .io
            .store(self.geom.index_off, self.geom.index_size as usize, modified);
        let r2 = self.io.store(0, HEADER_SIZE, modified);
        let r3 = self.locker.unlock(0, self.geom.data_off);
        drop(ctl);
        r1.and(r2).and(r3)
    }

    // ---- data regions ----

    fn rgn_get(
        &mut self,
        offset: u64,
        extent: u64,
        mode: LockMode,
        wait: bool,
    ) -> Result<NonNull<u8>> {
        if self.riul.find(offset).is_some() {
            // This process already holds the region (e.g. a locked
            // sequence); fcntl would silently grant a second lock.
            return Err(PqError::Locked);
        }
        self.locker.lock(offset, extent, mode, wait)?;
        match self
            .io
            .fetch(offset, extent as usize, mode == LockMode::Exclusive)
        {
            Ok(ptr) => {
                self.riul.add(RegionUse {
                    offset,
                    extent,
                    mode,
                    ptr,
                });
                Ok(ptr)
            }
            Err(e) => {
                let _ = self.locker.unlock(offset, extent);
                Err(e)
            }
        }
    }

    fn rgn_rel(&mut self, offset: u64, modified: bool) -> Result<()> {
        let e = self.riul.take(offset).ok_or(PqError::NotFound)?;
        let r1 = self.io.store(e.offset, e.extent as usize, modified);
        let r2 = self.locker.unlock(e.offset, e.extent);
        r1.and(r2)
    }

    /// The bytes of a region this process has locked and fetched.
    ///
    /// # Safety
    ///
    /// The riul entry for `offset` must be live, the slice must not
    /// outlive the matching `rgn_rel`, and no other reference to the
    /// region's bytes may exist while it does. The lifetime is unbound;
    /// the caller constrains it.
    unsafe fn rgn_slice_mut<'x>(&self, offset: u64, extent: u64) -> &'x mut [u8] {
        let e = self
            .riul
            .find(offset)
            .expect("region is locked by this process");
        unsafe { slice::from_raw_parts_mut(e.ptr.as_ptr(), extent as usize) }
    }

    // ---- allocation and eviction ----

    /// The allocation shell: dedup, make room, allocate, lock, and enter
    /// the signature. On success the region is exclusively locked and in
    /// the riul. `aligned` is the already-aligned extent.
    fn rpqe_new(
        &mut self,
        v: &mut Views<'_>,
        sig: &Signature,
        aligned: u64,
    ) -> Result<(u64, u64)> {
        if v.sx.find(sig).is_some() {
            return Err(PqError::Duplicate);
        }
        while !v.tq.has_free_slot() {
            self.del_oldest(v)?;
        }
        let idx = loop {
            match v.rl.alloc(&mut v.fb, &mut self.rng, aligned) {
                Ok(idx) => break idx,
                Err(PqError::NoRoom) => self.del_oldest(v)?,
                Err(e) => return Err(e),
            }
        };
        let (offset, actual) = {
            let r = v.rl.region(idx);
            (r.offset, r.extent)
        };
        if let Err(e) = self.rgn_get(offset, actual, LockMode::Exclusive, true) {
            if let Err(u) = v.rl.free(&mut v.fb, &mut self.rng, offset) {
                log::error!("unwind after failed region lock also failed: {u}");
            }
            return Err(e);
        }
        if let Err(e) = v.sx.add(sig, offset) {
            let _ = self.rgn_rel(offset, false);
            if let Err(u) = v.rl.free(&mut v.fb, &mut self.rng, offset) {
                log::error!("unwind after failed signature insert also failed: {u}");
            }
            return Err(e);
        }
        Ok((offset, actual))
    }

    /// Full unwind of a freshly allocated region, in reverse order of
    /// `rpqe_new`: signature entry out, region lock dropped, region freed.
    fn unwind_new_region(&mut self, v: &mut Views<'_>, sig: &Signature, offset: u64) {
        if let Err(e) = v.sx.find_and_delete(sig) {
            log::error!("unwind: signature entry missing: {e}");
        }
        if let Err(e) = self.rgn_rel(offset, false) {
            log::error!("unwind: region release failed: {e}");
        }
        if let Err(e) = v.rl.free(&mut v.fb, &mut self.rng, offset) {
            log::error!("unwind: region free failed: {e}");
        }
    }

    /// Evict the oldest product whose region can be locked. Walks the time
    /// index from the oldest entry, skipping products other processes
    /// hold.
    fn del_oldest(&mut self, v: &mut Views<'_>) -> Result<()> {
        let mut at = v.tq.first(&v.fb);
        let (tq_idx, offset, extent) = loop {
            let Some(idx) = at else {
                return Err(if v.tq.hdr.nelems == 0 {
                    PqError::OutOfMemory
                } else {
                    PqError::AllLocked
                });
            };
            let offset = v.tq.elem(idx).offset;
            let Some(r_idx) = v.rl.find_in_use(offset) else {
                return Err(corrupt!(
                    "time entry points at {offset:#x} but no in-use region is there"
                ));
            };
            let extent = v.rl.region(r_idx).extent;
            match self.rgn_get(offset, extent, LockMode::Exclusive, false) {
                Ok(_) => break (idx, offset, extent),
                Err(PqError::Locked) => at = v.tq.next(&v.fb, idx),
                Err(e) => return Err(e),
            }
        };

        // SAFETY: just locked and fetched; released below.
        let buf: &[u8] = unsafe { self.rgn_slice_mut(offset, extent) };
        let dec = match product::decode(buf, offset) {
            Ok(d) => d,
            Err(e) => {
                let _ = self.rgn_rel(offset, false);
                return Err(e);
            }
        };

        // Minimum virtual residence time: eviction minus max(creation,
        // insertion); future-dated creation falls back to insertion.
        let now = Timestamp::now();
        let base = if dec.arrival.is_none() {
            dec.info.create_time
        } else if dec.info.create_time > now {
            dec.arrival
        } else {
            dec.info.create_time.max(dec.arrival)
        };
        let virt = now.diff(base);
        if v.hdr.min_virt_res_time.is_none() || virt < v.hdr.min_virt_res_time {
            v.hdr.min_virt_res_time = virt;
            v.hdr.mvrt_bytes = v.rl.hdr.nbytes;
            v.hdr.mvrt_slots = v.tq.hdr.nelems;
        }

        let mut result: Result<()> = Ok(());
        if v.sx.find_and_delete(&dec.info.signature).is_err() {
            result = Err(corrupt!(
                "evicting {}: signature missing from the index",
                dec.info.signature
            ));
        }
        if result.is_ok() {
            result = v.tq.delete(&mut v.fb, tq_idx);
        }
        if result.is_ok() {
            result = v.rl.free(&mut v.fb, &mut self.rng, offset);
        }
        let rel = self.rgn_rel(offset, false);
        result.and(rel)?;
        v.hdr.is_full = 1;
        log::debug!(
            "evicted {} ({} bytes at {offset:#x})",
            dec.info.signature,
            dec.info.size
        );
        Ok(())
    }

    // ---- insertion ----

    /// Insert a complete product: reserve, encode, and commit in one
    /// exclusive critical section. Returns the insertion timestamp.
    pub fn insert(&mut self, info: &ProductInfo, data: &[u8]) -> Result<Timestamp> {
        self.ensure_writable()?;
        if info.size == 0 || data.is_empty() {
            return Err(PqError::Invalid("zero-length product"));
        }
        if data.len() != info.size as usize {
            return Err(PqError::Invalid("payload length disagrees with info.size"));
        }
        let aligned = product::encoded_extent(info)?.next_multiple_of(self.geom.align);
        if aligned > self.geom.data_size {
            return Err(PqError::TooBig {
                size: aligned,
                limit: self.geom.data_size,
            });
        }

        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Exclusive)?;
        let outcome: Result<(u64, Timestamp)> = 'op: {
            let mut v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let (offset, actual) = match self.rpqe_new(&mut v, &info.signature, aligned) {
                Ok(x) => x,
                Err(e) => break 'op Err(e),
            };
            // SAFETY: rpqe_new left the region locked and fetched.
            let buf = unsafe { self.rgn_slice_mut(offset, actual) };
            let data_start = match product::encode_into(buf, info) {
                Ok(x) => x,
                Err(e) => {
                    self.unwind_new_region(&mut v, &info.signature, offset);
                    break 'op Err(e);
                }
            };
            buf[data_start..data_start + data.len()].copy_from_slice(data);

            // The time entry is the last step, so every earlier failure
            // unwinds without leaking a time slot.
            let when = match v.tq.add(&mut v.fb, &mut self.rng, offset, Timestamp::now()) {
                Ok((_, when)) => when,
                Err(e) => {
                    self.unwind_new_region(&mut v, &info.signature, offset);
                    break 'op Err(e);
                }
            };
            product::stamp_arrival(buf, when);
            v.hdr.most_recent = when;
            v.hdr.highwater = v.hdr.highwater.max(v.rl.hdr.nbytes);
            v.hdr.max_products = v.hdr.max_products.max(v.tq.hdr.nelems);
            Ok((offset, when))
        };

        match outcome {
            Ok((offset, when)) => {
                let r = self.rgn_rel(offset, true);
                let rel = self.ctl_rel(ctl, true);
                r.and(rel)?;
                signal::wake_process_group();
                Ok(when)
            }
            Err(e) => {
                let _ = self.ctl_rel(ctl, true);
                Err(e)
            }
        }
    }

    // ---- reservations ----

    /// Reserve a region for a product described by `info`. The returned
    /// reservation derefs to the payload bytes; fill them, then `commit`
    /// (or `discard`).
    pub fn reserve(&mut self, info: &ProductInfo) -> Result<Reservation<'_>> {
        self.ensure_writable()?;
        if info.size == 0 {
            return Err(PqError::Invalid("zero-length product"));
        }
        let aligned = product::encoded_extent(info)?.next_multiple_of(self.geom.align);
        if aligned > self.geom.data_size {
            return Err(PqError::TooBig {
                size: aligned,
                limit: self.geom.data_size,
            });
        }

        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Exclusive)?;
        let outcome: Result<(u64, u64, usize)> = 'op: {
            let mut v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let (offset, actual) = match self.rpqe_new(&mut v, &info.signature, aligned) {
                Ok(x) => x,
                Err(e) => break 'op Err(e),
            };
            // SAFETY: rpqe_new left the region locked and fetched.
            let buf = unsafe { self.rgn_slice_mut(offset, actual) };
            match product::encode_into(buf, info) {
                Ok(data_start) => Ok((offset, actual, data_start)),
                Err(e) => {
                    self.unwind_new_region(&mut v, &info.signature, offset);
                    break 'op Err(e);
                }
            }
        };

        match outcome {
            Ok((offset, extent, data_start)) => {
                if let Err(e) = self.ctl_rel(ctl, true) {
                    let _ = self.rgn_rel(offset, false);
                    return Err(e);
                }
                let data_len = info.size as usize;
                Ok(Reservation {
                    pq: self,
                    offset,
                    extent,
                    data_start,
                    data_len,
                    sig: info.signature,
                    done: false,
                })
            }
            Err(e) => {
                let _ = self.ctl_rel(ctl, true);
                Err(e)
            }
        }
    }

    /// Reserve `size` bytes for an already-encoded product carrying
    /// `sig`. The caller must lay the region out in the queue's record
    /// format (the commit stamps the insertion time into it).
    pub fn reserve_direct(&mut self, size: u64, sig: &Signature) -> Result<Reservation<'_>> {
        self.ensure_writable()?;
        if size < product::INFO_RECORD_SIZE as u64 {
            return Err(PqError::Invalid(
                "direct reservation smaller than the info record",
            ));
        }
        let aligned = size.next_multiple_of(self.geom.align);
        if aligned > self.geom.data_size {
            return Err(PqError::TooBig {
                size: aligned,
                limit: self.geom.data_size,
            });
        }

        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Exclusive)?;
        let outcome: Result<(u64, u64)> = 'op: {
            let mut v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            match self.rpqe_new(&mut v, sig, aligned) {
                Ok(x) => Ok(x),
                Err(e) => break 'op Err(e),
            }
        };

        match outcome {
            Ok((offset, extent)) => {
                if let Err(e) = self.ctl_rel(ctl, true) {
                    let _ = self.rgn_rel(offset, false);
                    return Err(e);
                }
                Ok(Reservation {
                    pq: self,
                    offset,
                    extent,
                    data_start: 0,
                    data_len: size as usize,
                    sig: *sig,
                    done: false,
                })
            }
            Err(e) => {
                let _ = self.ctl_rel(ctl, true);
                Err(e)
            }
        }
    }

    /// Commit a reservation: optionally swap in the real signature, enter
    /// the time index, stamp the insertion time, publish `most_recent`,
    /// and wake consumers. Committing under a signature that meanwhile
    /// appeared in the queue discards the reservation and returns
    /// `Duplicate`.
    fn commit_reservation(
        &mut self,
        offset: u64,
        extent: u64,
        sig: Signature,
        real: Option<Signature>,
    ) -> Result<Timestamp> {
        let geom = self.geom;
        // The reservation still holds the region lock; it must not outlive
        // a failed attempt to take the control region.
        let mut ctl = match self.ctl_get(LockMode::Exclusive) {
            Ok(ctl) => ctl,
            Err(e) => {
                let _ = self.rgn_rel(offset, false);
                return Err(e);
            }
        };
        let outcome: Result<Timestamp> = 'op: {
            let mut v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            // SAFETY: the reservation holds the region lock and fetch.
            let buf = unsafe { self.rgn_slice_mut(offset, extent) };

            let mut committed_sig = sig;
            if let Some(real) = real.filter(|r| *r != sig) {
                if v.sx.find(&real).is_some() {
                    // The real signature arrived by another route.
                    self.unwind_new_region(&mut v, &sig, offset);
                    break 'op Err(PqError::Duplicate);
                }
                match v.sx.find_and_delete(&sig) {
                    Ok(sx_off) if sx_off == offset => {}
                    Ok(sx_off) => {
                        break 'op Err(corrupt!(
                            "provisional signature {sig} maps to {sx_off:#x}, \
                             reservation is at {offset:#x}"
                        ));
                    }
                    Err(_) => {
                        break 'op Err(corrupt!(
                            "provisional signature {sig} missing at commit"
                        ));
                    }
                }
                // A slot was just freed, so this cannot exhaust the index.
                if let Err(e) = v.sx.add(&real, offset) {
                    break 'op Err(e);
                }
                product::stamp_signature(buf, &real);
                committed_sig = real;
            }

            let when = match v.tq.add(&mut v.fb, &mut self.rng, offset, Timestamp::now()) {
                Ok((_, when)) => when,
                Err(e) => {
                    self.unwind_new_region(&mut v, &committed_sig, offset);
                    break 'op Err(e);
                }
            };
            product::stamp_arrival(buf, when);
            v.hdr.most_recent = when;
            v.hdr.highwater = v.hdr.highwater.max(v.rl.hdr.nbytes);
            v.hdr.max_products = v.hdr.max_products.max(v.tq.hdr.nelems);
            Ok(when)
        };

        match outcome {
            Ok(when) => {
                let r = self.rgn_rel(offset, true);
                let rel = self.ctl_rel(ctl, true);
                r.and(rel)?;
                signal::wake_process_group();
                Ok(when)
            }
            Err(e) => {
                let _ = self.ctl_rel(ctl, true);
                Err(e)
            }
        }
    }

    /// Free a reserved region without committing it.
    fn discard_reservation(&mut self, offset: u64, sig: Signature) -> Result<()> {
        let geom = self.geom;
        // As in commit: a failed control acquisition must still release
        // the reservation's region lock.
        let mut ctl = match self.ctl_get(LockMode::Exclusive) {
            Ok(ctl) => ctl,
            Err(e) => {
                let _ = self.rgn_rel(offset, false);
                return Err(e);
            }
        };
        let outcome: Result<()> = match ctl.views(&geom) {
            Ok(mut v) => {
                self.unwind_new_region(&mut v, &sig, offset);
                Ok(())
            }
            Err(e) => Err(e),
        };
        let rel = self.ctl_rel(ctl, true);
        outcome.and(rel)
    }

    // ---- sequencing ----

    /// Advance the cursor to the next product in `rel`'s direction and, if
    /// it passes `filter`, hand its metadata and payload to `f`. Returns
    /// `QueueEnd` when nothing lies in that direction.
    pub fn sequence<F>(&mut self, rel: Relation, filter: &ClassFilter<'_>, mut f: F) -> Result<()>
    where
        F: FnMut(&ProductInfo, &[u8]) -> Disposition,
    {
        self.sequence_impl(rel, filter, &mut f, false).map(|_| ())
    }

    /// Like [`sequence`](Self::sequence), but the product's data region
    /// stays locked after return; the caller must pass the returned offset
    /// to [`release`](Self::release).
    pub fn sequence_locked<F>(
        &mut self,
        rel: Relation,
        filter: &ClassFilter<'_>,
        mut f: F,
    ) -> Result<u64>
    where
        F: FnMut(&ProductInfo, &[u8]) -> Disposition,
    {
        self.sequence_impl(rel, filter, &mut f, true)
    }

    fn sequence_impl(
        &mut self,
        rel: Relation,
        filter: &ClassFilter<'_>,
        f: &mut dyn FnMut(&ProductInfo, &[u8]) -> Disposition,
        keep_locked: bool,
    ) -> Result<u64> {
        self.init_cursor(rel);
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Shared)?;
        let found: Result<(Timestamp, u64, u64)> = 'op: {
            let v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let Some(idx) = v.tq.find(&v.fb, self.cursor, rel) else {
                break 'op Err(PqError::QueueEnd);
            };
            let e = v.tq.elem(idx);
            let (when, offset) = (e.when, e.offset);
            let Some(r_idx) = v.rl.find_in_use(offset) else {
                break 'op Err(corrupt!("time entry at {offset:#x} has no in-use region"));
            };
            Ok((when, offset, v.rl.region(r_idx).extent))
        };
        let (when, offset, extent) = match found {
            Ok(x) => x,
            Err(e) => {
                let _ = self.ctl_rel(ctl, false);
                return Err(e);
            }
        };
        self.cursor = (when, offset);

        if let Err(e) = self.rgn_get(offset, extent, LockMode::Shared, true) {
            let _ = self.ctl_rel(ctl, false);
            return Err(e);
        }
        // SAFETY: locked and fetched just above; released below.
        let buf: &[u8] = unsafe { self.rgn_slice_mut(offset, extent) };
        let dec = match product::decode(buf, offset) {
            Ok(d) => d,
            Err(e) => {
                let _ = self.rgn_rel(offset, false);
                let _ = self.ctl_rel(ctl, false);
                return Err(e);
            }
        };
        // Metadata is parsed; writers may proceed while the callback runs.
        if let Err(e) = self.ctl_rel(ctl, false) {
            let _ = self.rgn_rel(offset, false);
            return Err(e);
        }

        if filter.matches(&dec.info) {
            let payload = &buf[dec.payload_start..dec.payload_start + dec.info.size as usize];
            if f(&dec.info, payload) == Disposition::Deferred {
                self.cursor = (when.minus_usec(Timestamp::TICK), offset);
            }
        }

        if !keep_locked {
            self.rgn_rel(offset, false)?;
        }
        Ok(offset)
    }

    /// Release a data region held by
    /// [`sequence_locked`](Self::sequence_locked).
    pub fn release(&mut self, offset: u64) -> Result<()> {
        self.rgn_rel(offset, false)
    }

    /// Cursor-only advance: move to the next entry without touching the
    /// product.
    pub fn seek(&mut self, rel: Relation) -> Result<()> {
        self.init_cursor(rel);
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Shared)?;
        let found: Result<(Timestamp, u64)> = 'op: {
            let v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let Some(idx) = v.tq.find(&v.fb, self.cursor, rel) else {
                break 'op Err(PqError::QueueEnd);
            };
            let e = v.tq.elem(idx);
            Ok((e.when, e.offset))
        };
        let rel_r = self.ctl_rel(ctl, false);
        let (when, offset) = found?;
        rel_r?;
        self.cursor = (when, offset);
        Ok(())
    }

    fn init_cursor(&mut self, rel: Relation) {
        if self.cursor.0.is_none() {
            self.cursor = match rel {
                Relation::Less => (Timestamp::END_OF_TIME, u64::MAX),
                Relation::Equal | Relation::Greater => (Timestamp::BEGINNING_OF_TIME, 0),
            };
        }
    }

    /// The sequencing position, if one has been established.
    pub fn cursor(&self) -> Option<(Timestamp, u64)> {
        (!self.cursor.0.is_none()).then_some(self.cursor)
    }

    /// Position the cursor at an arbitrary time.
    pub fn set_cursor(&mut self, when: Timestamp) {
        self.cursor = (when, 0);
    }

    /// Position the cursor at the time entry of the product carrying
    /// `sig`, so a forward sequence resumes right after it.
    pub fn set_cursor_from_signature(&mut self, sig: &Signature) -> Result<()> {
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Shared)?;
        let outcome: Result<(Timestamp, u64)> = 'op: {
            let v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let Some(offset) = v.sx.find(sig) else {
                break 'op Err(PqError::NotFound);
            };
            let Some(r_idx) = v.rl.find_in_use(offset) else {
                break 'op Err(corrupt!(
                    "signature {sig} maps to {offset:#x} but no in-use region is there"
                ));
            };
            let extent = v.rl.region(r_idx).extent;
            if let Err(e) = self.rgn_get(offset, extent, LockMode::Shared, true) {
                break 'op Err(e);
            }
            // SAFETY: locked and fetched just above; released below.
            let buf: &[u8] = unsafe { self.rgn_slice_mut(offset, extent) };
            let dec = product::decode(buf, offset);
            let rel = self.rgn_rel(offset, false);
            let arrival = match dec {
                Ok(d) => d.arrival,
                Err(e) => break 'op Err(e),
            };
            if let Err(e) = rel {
                break 'op Err(e);
            }
            if v.tq.find(&v.fb, (arrival, offset), Relation::Equal).is_none() {
                break 'op Err(corrupt!(
                    "product {sig} at {offset:#x} has no time entry at its recorded arrival"
                ));
            }
            Ok((arrival, offset))
        };
        let rel = self.ctl_rel(ctl, false);
        let (arrival, offset) = outcome?;
        rel?;
        self.cursor = (arrival, offset);
        Ok(())
    }

    /// Locate the product carrying `sig`, shared-lock it, and hand its
    /// metadata and payload to `f`.
    pub fn process_product<F>(&mut self, sig: &Signature, f: F) -> Result<()>
    where
        F: FnOnce(&ProductInfo, &[u8]),
    {
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Shared)?;
        let found: Result<(u64, u64)> = 'op: {
            let v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let Some(offset) = v.sx.find(sig) else {
                break 'op Err(PqError::NotFound);
            };
            let Some(r_idx) = v.rl.find_in_use(offset) else {
                break 'op Err(corrupt!(
                    "signature {sig} maps to {offset:#x} but no in-use region is there"
                ));
            };
            Ok((offset, v.rl.region(r_idx).extent))
        };
        let (offset, extent) = match found {
            Ok(x) => x,
            Err(e) => {
                let _ = self.ctl_rel(ctl, false);
                return Err(e);
            }
        };
        if let Err(e) = self.rgn_get(offset, extent, LockMode::Shared, true) {
            let _ = self.ctl_rel(ctl, false);
            return Err(e);
        }
        // SAFETY: locked and fetched just above; released below.
        let buf: &[u8] = unsafe { self.rgn_slice_mut(offset, extent) };
        let dec = match product::decode(buf, offset) {
            Ok(d) => d,
            Err(e) => {
                let _ = self.rgn_rel(offset, false);
                let _ = self.ctl_rel(ctl, false);
                return Err(e);
            }
        };
        if let Err(e) = self.ctl_rel(ctl, false) {
            let _ = self.rgn_rel(offset, false);
            return Err(e);
        }
        let payload = &buf[dec.payload_start..dec.payload_start + dec.info.size as usize];
        f(&dec.info, payload);
        self.rgn_rel(offset, false)
    }

    /// Remove the product carrying `sig`. Fails `Locked` if any process
    /// (this one included) holds its region.
    pub fn delete_by_signature(&mut self, sig: &Signature) -> Result<()> {
        self.ensure_writable()?;
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Exclusive)?;
        let outcome: Result<()> = 'op: {
            let mut v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let Some(offset) = v.sx.find(sig) else {
                break 'op Err(PqError::NotFound);
            };
            let Some(r_idx) = v.rl.find_in_use(offset) else {
                break 'op Err(corrupt!(
                    "signature {sig} maps to {offset:#x} but no in-use region is there"
                ));
            };
            let extent = v.rl.region(r_idx).extent;
            if let Err(e) = self.rgn_get(offset, extent, LockMode::Exclusive, false) {
                break 'op Err(e);
            }
            // SAFETY: locked and fetched just above; released below.
            let buf: &[u8] = unsafe { self.rgn_slice_mut(offset, extent) };
            let arrival = match product::decode(buf, offset) {
                Ok(d) => d.arrival,
                Err(e) => {
                    let _ = self.rgn_rel(offset, false);
                    break 'op Err(e);
                }
            };
            let Some(tq_idx) = v.tq.find(&v.fb, (arrival, offset), Relation::Equal) else {
                let _ = self.rgn_rel(offset, false);
                break 'op Err(corrupt!(
                    "product {sig} at {offset:#x} has no time entry at its recorded arrival"
                ));
            };
            let mut result: Result<()> = v.sx.find_and_delete(sig).map(|_| ());
            if result.is_ok() {
                result = v.tq.delete(&mut v.fb, tq_idx);
            }
            if result.is_ok() {
                result = v.rl.free(&mut v.fb, &mut self.rng, offset);
            }
            let rel = self.rgn_rel(offset, false);
            match result.and(rel) {
                Ok(()) => Ok(()),
                Err(e) => break 'op Err(e),
            }
        };
        let rel = self.ctl_rel(ctl, true);
        outcome.and(rel)
    }

    /// Creation time of the most recent product matching `filter`. Does
    /// not disturb the cursor.
    pub fn last(&mut self, filter: &ClassFilter<'_>) -> Result<Timestamp> {
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Shared)?;
        let outcome: Result<Timestamp> = 'op: {
            let v = match ctl.views(&geom) {
                Ok(v) => v,
                Err(e) => break 'op Err(e),
            };
            let mut key = (Timestamp::END_OF_TIME, u64::MAX);
            loop {
                let Some(idx) = v.tq.find(&v.fb, key, Relation::Less) else {
                    break 'op Err(PqError::NotFound);
                };
                let e = v.tq.elem(idx);
                let (when, offset) = (e.when, e.offset);
                key = (when, offset);
                let Some(r_idx) = v.rl.find_in_use(offset) else {
                    break 'op Err(corrupt!("time entry at {offset:#x} has no in-use region"));
                };
                let extent = v.rl.region(r_idx).extent;
                if let Err(e) = self.rgn_get(offset, extent, LockMode::Shared, true) {
                    break 'op Err(e);
                }
                // SAFETY: locked and fetched just above; released below.
                let buf: &[u8] = unsafe { self.rgn_slice_mut(offset, extent) };
                let dec = product::decode(buf, offset);
                let rel = self.rgn_rel(offset, false);
                let dec = match dec {
                    Ok(d) => d,
                    Err(e) => break 'op Err(e),
                };
                if let Err(e) = rel {
                    break 'op Err(e);
                }
                if filter.matches(&dec.info) {
                    break 'op Ok(dec.info.create_time);
                }
            }
        };
        let rel = self.ctl_rel(ctl, false);
        outcome.and_then(|t| rel.map(|_| t))
    }

    // ---- metrics ----

    /// Point-in-time statistics.
    pub fn stats(&mut self) -> Result<QueueStats> {
        let geom = self.geom;
        let mut ctl = self.ctl_get(LockMode::Shared)?;
        let outcome: Result<QueueStats> = match ctl.views(&geom) {
            Ok(v) => {
                let age_oldest = v
                    .tq
                    .first(&v.fb)
                    .map(|idx| Timestamp::now().diff(v.tq.elem(idx).when));
                Ok(QueueStats {
                    capacity: v.hdr.nalloc,
                    product_count: v.tq.hdr.nelems,
                    free_count: v.rl.hdr.nfree,
                    empty_count: v.rl.hdr.nempty,
                    bytes_used: v.rl.hdr.nbytes,
                    bytes_total: geom.data_size,
                    max_free_extent: v.rl.hdr.maxfextent,
                    max_products: v.hdr.max_products,
                    highwater_bytes: v.hdr.highwater,
                    max_free_regions: v.rl.hdr.max_nfree,
                    min_empty_slots: v.rl.hdr.min_nempty,
                    age_oldest,
                    is_full: v.hdr.is_full != 0,
                })
            }
            Err(e) => Err(e),
        };
        let rel = self.ctl_rel(ctl, false);
        outcome.and_then(|s| rel.map(|_| s))
    }

    /// Whether the queue has ever evicted a product to make room.
    pub fn is_full(&mut self) -> Result<bool> {
        self.with_header_read(|hdr| hdr.is_full != 0)
    }

    /// Insertion time of the most recently committed product.
    pub fn most_recent(&mut self) -> Result<Option<Timestamp>> {
        self.with_header_read(|hdr| (!hdr.most_recent.is_none()).then_some(hdr.most_recent))
    }

    /// The minimum-virtual-residence-time sample.
    pub fn min_virt_res_time_metrics(&mut self) -> Result<MvrtMetrics> {
        self.with_header_read(|hdr| MvrtMetrics {
            min_virt_res_time: (!hdr.min_virt_res_time.is_none())
                .then_some(hdr.min_virt_res_time),
            bytes_used: hdr.mvrt_bytes,
            slots_used: hdr.mvrt_slots,
        })
    }

    /// Reset the minimum-virtual-residence-time sample.
    pub fn clear_min_virt_res_time_metrics(&mut self) -> Result<()> {
        self.ensure_writable()?;
        let _sig = SigGuard::block()?;
        self.locker
            .lock(0, self.geom.data_off, LockMode::Exclusive, true)?;
        let result = read_header(&self.file).and_then(|mut hdr| {
            hdr.min_virt_res_time = Timestamp::NONE;
            hdr.mvrt_bytes = 0;
            hdr.mvrt_slots = 0;
            // Rewrite only the metrics tail of the header; the writer
            // counter lives earlier and is governed by its own word lock.
            let from = std::mem::offset_of!(Header, min_virt_res_time);
            self.file
                .write_all_at(&bytemuck::bytes_of(&hdr)[from..], from as u64)?;
            Ok(())
        });
        let rel = self.locker.unlock(0, self.geom.data_off);
        result.and(rel)
    }

    fn with_header_read<T>(&mut self, f: impl FnOnce(&Header) -> T) -> Result<T> {
        self.locker
            .lock(0, self.geom.data_off, LockMode::Shared, true)?;
        let hdr = read_header(&self.file);
        let rel = self.locker.unlock(0, self.geom.data_off);
        let hdr = hdr?;
        rel?;
        Ok(f(&hdr))
    }

    // ---- writer counter ----

    /// Number of writable handles currently open on the queue at `path`,
    /// across all processes.
    pub fn write_count<P: AsRef<Path>>(path: P) -> Result<u32> {
        let file = Arc::new(File::open(path.as_ref())?);
        header::validate(&read_header(&file)?)?;
        let locker = FileLock::new(Arc::clone(&file), true);
        let (off, len) = header::write_count_range();
        locker.lock(off, len, LockMode::Shared, true)?;
        let hdr = read_header(&file);
        let _ = locker.unlock(off, len);
        let hdr = hdr?;
        Ok(if hdr.write_count_magic == WRITE_COUNT_MAGIC {
            hdr.write_count
        } else {
            0
        })
    }

    /// Force the writer counter to zero: the recovery step after crashes
    /// that leave the counter raised with no live writers. Returns the
    /// previous count.
    pub fn clear_write_count<P: AsRef<Path>>(path: P) -> Result<u32> {
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(path.as_ref())?,
        );
        header::validate(&read_header(&file)?)?;
        let locker = FileLock::new(Arc::clone(&file), true);
        let mut old = 0;
        adjust_write_count(&file, &locker, |count| {
            old = count;
            Ok(0)
        })?;
        if old != 0 {
            log::warn!(
                "forced writer count {old} -> 0 on {}",
                path.as_ref().display()
            );
        }
        Ok(old)
    }
}

/// Read-modify-write of the writer counter under its own word lock. The
/// first writer to find the magic uninitialized initializes it here, which
/// makes initialization race-free.
fn adjust_write_count(
    file: &File,
    locker: &FileLock,
    f: impl FnOnce(u32) -> Result<u32>,
) -> Result<u32> {
    let (off, len) = header::write_count_range();
    locker.lock(off, len, LockMode::Exclusive, true)?;
    let result = (|| {
        let mut hdr = read_header(file)?;
        let current = if hdr.write_count_magic == WRITE_COUNT_MAGIC {
            hdr.write_count
        } else {
            hdr.write_count_magic = WRITE_COUNT_MAGIC;
            0
        };
        let new = f(current)?;
        hdr.write_count = new;
        let words = [hdr.write_count_magic, hdr.write_count];
        file.write_all_at(bytemuck::cast_slice(&words), off)?;
        Ok(new)
    })();
    let _ = locker.unlock(off, len);
    result
}

impl Drop for ProductQueue {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close_impl() {
                log::error!("closing {} failed: {e}", self.path.display());
            }
        }
    }
}

/// An allocated, exclusively locked region awaiting its product. Derefs to
/// the caller-writable payload bytes. Must end in exactly one of
/// [`commit`](Reservation::commit),
/// [`commit_with_signature`](Reservation::commit_with_signature), or
/// [`discard`](Reservation::discard); dropping an unterminated reservation
/// discards it with a warning.
pub struct Reservation<'q> {
    pq: &'q mut ProductQueue,
    offset: u64,
    extent: u64,
    data_start: usize,
    data_len: usize,
    sig: Signature,
    done: bool,
}

impl Reservation<'_> {
    /// Data-region offset; stable for the queue's lifetime.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Publish the product.
    pub fn commit(mut self) -> Result<Timestamp> {
        self.done = true;
        self.pq
            .commit_reservation(self.offset, self.extent, self.sig, None)
    }

    /// Publish the product under its real signature, replacing the
    /// provisional one given at reservation time.
    pub fn commit_with_signature(mut self, real: Signature) -> Result<Timestamp> {
        self.done = true;
        self.pq
            .commit_reservation(self.offset, self.extent, self.sig, Some(real))
    }

    /// Free the region without publishing anything.
    pub fn discard(mut self) -> Result<()> {
        self.done = true;
        self.pq.discard_reservation(self.offset, self.sig)
    }
}

impl std::ops::Deref for Reservation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the reservation holds the region's lock and fetch; the
        // &mut on the queue keeps every other accessor out.
        let buf: &[u8] = unsafe { self.pq.rgn_slice_mut(self.offset, self.extent) };
        &buf[self.data_start..self.data_start + self.data_len]
    }
}

impl std::ops::DerefMut for Reservation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in Deref.
        let buf = unsafe { self.pq.rgn_slice_mut(self.offset, self.extent) };
        &mut buf[self.data_start..self.data_start + self.data_len]
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.done {
            log::warn!(
                "reservation at {:#x} dropped without commit or discard",
                self.offset
            );
            if let Err(e) = self.pq.discard_reservation(self.offset, self.sig) {
                log::error!("discarding dropped reservation failed: {e}");
            }
        }
    }
}
