//! Free-block arena: the fixed pool of skip-list forward-pointer cells.
//!
//! Every skip list in the file (the time index and the two free-region
//! lists) stores its forward pointers in blocks of contiguous `u64` cells
//! drawn from this arena. A block of size `k` serves a node of level `k`.
//! The arena is carved once at creation and never grows; its capacity is
//! computed from the configured product count so the pool cannot be
//! exhausted under expected load.
//!
//! Free blocks of each size hang off a per-size free list threaded through
//! the first cell of each block. A request that misses its own size takes
//! a larger block and splits off the remainder, except from the reserve at
//! the top of the arena: reserve blocks are always full-height and are
//! never split, so they always return to the top list whole.

use bytemuck::{Pod, Zeroable};

use crate::error::{PqError, Result, corrupt};
use crate::{FB_MAGIC, NIL};

/// Upper bound on skip-list height; level(4^23 products) still fits.
pub(crate) const FB_MAX_LEVELS: usize = 24;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct FbHeader {
    pub magic: u32,
    /// Maximum block size; also the height of skip-list head blocks.
    pub maxlevel: u32,
    /// Total cells in the arena.
    pub arena_len: u64,
    /// Cell index where the never-split reserve begins.
    pub reserve_off: u64,
    /// Free-list heads per block size; index 0 unused.
    pub avail: [u64; FB_MAX_LEVELS],
}

pub(crate) const FB_HEADER_SIZE: usize = size_of::<FbHeader>();

/// Arena dimensions derived from the product count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FbCapacity {
    pub maxlevel: u32,
    pub arena_len: u64,
    pub reserve_off: u64,
}

#[inline]
fn log4_floor(n: u64) -> u32 {
    if n < 4 { 0 } else { n.ilog2() / 2 }
}

/// Blocks of size `level` preallocated for `nprods` products:
/// `ceil(0.75 N / 4^(level-1))`, at least 1.
fn prealloc_count(nprods: u64, level: u32) -> u64 {
    (3 * nprods).div_ceil(4u64.pow(level)).max(1)
}

impl FbCapacity {
    /// The capacity formula. `maxlevel = floor(log4 N) + 1` (floor of 2),
    /// per-level preallocation geometrically decreasing, plus a reserve of
    /// `3 * sqrt(N) * log4(N) * maxlevel` full-height blocks against
    /// worst-case fragmentation.
    pub fn for_products(nprods: u64) -> FbCapacity {
        let nprods = nprods.max(1);
        let maxlevel = (log4_floor(nprods) + 1).max(2);
        let mut main_cells: u64 = 0;
        for level in 1..maxlevel {
            main_cells += u64::from(level) * prealloc_count(nprods, level);
        }
        let reserve_blocks =
            3 * nprods.isqrt() * u64::from(log4_floor(nprods).max(1)) * u64::from(maxlevel);
        // Three of these become the permanent skip-list head blocks.
        let reserve_blocks = reserve_blocks.max(4);
        FbCapacity {
            maxlevel,
            arena_len: main_cells + reserve_blocks * u64::from(maxlevel),
            reserve_off: main_cells,
        }
    }

    /// Bytes this arena occupies in the index segment.
    pub fn byte_size(&self) -> usize {
        FB_HEADER_SIZE + self.arena_len as usize * size_of::<u64>()
    }
}

/// Mutable view over the arena's bytes within the (locked) index segment.
pub(crate) struct Fb<'a> {
    pub hdr: &'a mut FbHeader,
    arena: &'a mut [u64],
}

impl<'a> Fb<'a> {
    /// Initialize a fresh arena in `bytes`, carving the free lists for a
    /// queue of `nprods` products.
    pub fn create(bytes: &'a mut [u8], nprods: u64) -> Fb<'a> {
        let cap = FbCapacity::for_products(nprods);
        let nprods = nprods.max(1);
        let (hdr_bytes, rest) = bytes.split_at_mut(FB_HEADER_SIZE);
        let hdr: &mut FbHeader = bytemuck::from_bytes_mut(hdr_bytes);
        *hdr = FbHeader {
            magic: FB_MAGIC,
            maxlevel: cap.maxlevel,
            arena_len: cap.arena_len,
            reserve_off: cap.reserve_off,
            avail: [NIL; FB_MAX_LEVELS],
        };
        let arena: &mut [u64] =
            &mut bytemuck::cast_slice_mut(rest)[..cap.arena_len as usize];

        let mut fb = Fb { hdr, arena };
        let mut at: u64 = 0;
        for level in 1..cap.maxlevel {
            for _ in 0..prealloc_count(nprods, level) {
                fb.push_free(level as usize, at);
                at += u64::from(level);
            }
        }
        debug_assert_eq!(at, cap.reserve_off);
        while at < cap.arena_len {
            fb.push_free(cap.maxlevel as usize, at);
            at += u64::from(cap.maxlevel);
        }
        fb
    }

    /// Attach to an existing arena, validating its magic.
    pub fn attach(bytes: &'a mut [u8]) -> Result<Fb<'a>> {
        let (hdr_bytes, rest) = bytes.split_at_mut(FB_HEADER_SIZE);
        let hdr: &mut FbHeader = bytemuck::from_bytes_mut(hdr_bytes);
        if hdr.magic != FB_MAGIC {
            return Err(corrupt!(
                "free-block arena magic {:#010x}, expected {FB_MAGIC:#010x}",
                hdr.magic
            ));
        }
        let len = hdr.arena_len as usize;
        let words: &mut [u64] = bytemuck::cast_slice_mut(rest);
        if words.len() < len {
            return Err(corrupt!(
                "free-block arena truncated: {} cells present, header claims {len}",
                words.len()
            ));
        }
        let arena = &mut words[..len];
        Ok(Fb { hdr, arena })
    }

    #[inline]
    pub fn maxlevel(&self) -> usize {
        self.hdr.maxlevel as usize
    }

    fn push_free(&mut self, size: usize, blk: u64) {
        self.arena[blk as usize] = self.hdr.avail[size];
        self.hdr.avail[size] = blk;
    }

    /// Take a block of `size` cells. A miss at the exact size takes from
    /// the next occupied larger list and splits off the remainder; reserve
    /// blocks are handed out whole instead. Fails `OutOfSlots` when every
    /// list from `size` up is empty.
    pub fn get(&mut self, size: usize) -> Result<u64> {
        debug_assert!(size >= 1 && size <= self.maxlevel());
        for have in size..=self.maxlevel() {
            let blk = self.hdr.avail[have];
            if blk == NIL {
                continue;
            }
            self.hdr.avail[have] = self.arena[blk as usize];
            if have > size && blk < self.hdr.reserve_off {
                let rem = blk + size as u64;
                self.push_free(have - size, rem);
            }
            return Ok(blk);
        }
        Err(PqError::OutOfSlots)
    }

    /// Return a block to its free list. Reserve blocks go back to the
    /// full-height list regardless of the size they served.
    pub fn release(&mut self, size: usize, blk: u64) {
        debug_assert!((blk as usize) < self.arena.len());
        let size = if blk >= self.hdr.reserve_off {
            self.maxlevel()
        } else {
            size
        };
        self.push_free(size, blk);
    }

    /// Forward pointer `lvl` of the block at `blk`.
    #[inline]
    pub fn fwd(&self, blk: u64, lvl: usize) -> u64 {
        self.arena[blk as usize + lvl]
    }

    #[inline]
    pub fn set_fwd(&mut self, blk: u64, lvl: usize, target: u64) {
        self.arena[blk as usize + lvl] = target;
    }

    /// Clear all cells of a freshly taken block.
    pub fn clear(&mut self, blk: u64, size: usize) {
        for lvl in 0..size {
            self.set_fwd(blk, lvl, NIL);
        }
    }
}
