//! File header and geometry.
//!
//! The header occupies the first `lcm(align, pagesize)` bytes (or the
//! smallest multiple that holds it) and is the target of the control-region
//! lock. Everything after it is laid out deterministically from the
//! creation parameters: the data segment, then the index segment holding
//! the region table, time index, free-block arena, and signature index,
//! each page-aligned. Opens recompute the same layout from the stored
//! parameters and verify it against the stored extents.

use bytemuck::{Pod, Zeroable};

use crate::error::{Result, corrupt};
use crate::fb::FbCapacity;
use crate::time::Timestamp;
use crate::{PQ_MAGIC, PQ_VERSION, region, sx, tq};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct Header {
    pub magic: u32,
    pub version: u32,
    /// Data-region alignment.
    pub align: u64,
    pub data_off: u64,
    pub index_off: u64,
    pub index_size: u64,
    /// Product capacity the indices were sized for.
    pub nalloc: u64,
    /// Most data bytes ever in use.
    pub highwater: u64,
    /// Most products ever resident.
    pub max_products: u64,
    pub write_count_magic: u32,
    pub write_count: u32,
    pub metrics_magic: u32,
    pub _pad: u32,
    /// Insertion time of the most recently committed product.
    pub most_recent: Timestamp,
    /// Minimum virtual residence time observed across evictions.
    pub min_virt_res_time: Timestamp,
    /// Set once the queue has evicted at least one product.
    pub is_full: u32,
    pub metrics_magic_2: u32,
    /// Data bytes in use when the MVRT sample was taken.
    pub mvrt_bytes: u64,
    /// Products resident when the MVRT sample was taken.
    pub mvrt_slots: u64,
}

pub(crate) const HEADER_SIZE: usize = size_of::<Header>();

/// Marks `write_count` as initialized.
pub(crate) const WRITE_COUNT_MAGIC: u32 = 0x5751_5545;
/// Marks the metrics fields as initialized.
pub(crate) const METRICS_MAGIC: u32 = 0x4d51_5545;
pub(crate) const METRICS_MAGIC_2: u32 = 0x4d32_5545;

/// Byte range of the writer-counter words, locked independently of the
/// control region by the path-level counter operations.
pub(crate) fn write_count_range() -> (u64, u64) {
    (
        std::mem::offset_of!(Header, write_count_magic) as u64,
        2 * size_of::<u32>() as u64,
    )
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// Where everything lives, derived once from the creation parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub align: u64,
    pub nprods: u64,
    pub data_off: u64,
    pub data_size: u64,
    pub index_off: u64,
    pub index_size: u64,
    pub total_size: u64,
    /// Section offsets within the index segment, in file order.
    pub rl_off: usize,
    pub rl_size: usize,
    pub tq_off: usize,
    pub tq_size: usize,
    pub fb_off: usize,
    pub fb_size: usize,
    pub sx_off: usize,
    pub sx_size: usize,
}

impl Geometry {
    /// Lay out a new queue.
    pub fn compute(align: u64, data_bytes: u64, nprods: u64) -> Result<Geometry> {
        let page = page_size::get() as u64;
        // Header area: the alignment/page LCM, grown to hold the header.
        let unit = lcm(align, page);
        let data_off = unit * (HEADER_SIZE as u64).div_ceil(unit).max(1);
        let data_size = data_bytes.max(align).next_multiple_of(align);
        let index_off = data_off + data_size;

        let rl_size = region::byte_size(region::slots_for(nprods), region::chains_for(nprods))
            .next_multiple_of(page as usize);
        let tq_size = tq::byte_size(nprods).next_multiple_of(page as usize);
        let fb_size = FbCapacity::for_products(nprods)
            .byte_size()
            .next_multiple_of(page as usize);
        let sx_size = sx::byte_size(nprods, sx::chains_for(nprods))
            .next_multiple_of(page as usize);

        let rl_off = 0;
        let tq_off = rl_off + rl_size;
        let fb_off = tq_off + tq_size;
        let sx_off = fb_off + fb_size;
        let index_size = (sx_off + sx_size) as u64;

        Ok(Geometry {
            align,
            nprods,
            data_off,
            data_size,
            index_off,
            index_size,
            total_size: index_off + index_size,
            rl_off,
            rl_size,
            tq_off,
            tq_size,
            fb_off,
            fb_size,
            sx_off,
            sx_size,
        })
    }

    /// Recover the layout from a validated header. The index layout is a
    /// pure function of the stored parameters; a mismatch against the
    /// stored extents means the file was created with a different page
    /// size or has been damaged.
    pub fn from_header(hdr: &Header) -> Result<Geometry> {
        let data_size = hdr
            .index_off
            .checked_sub(hdr.data_off)
            .ok_or_else(|| corrupt!("index segment precedes the data segment"))?;
        let g = Geometry::compute(hdr.align, data_size, hdr.nalloc)?;
        if g.data_off != hdr.data_off || g.data_size != data_size || g.index_size != hdr.index_size
        {
            return Err(corrupt!(
                "geometry mismatch: header says data {:#x}+{data_size:#x} index {:#x}, \
                 recomputed data {:#x}+{:#x} index {:#x}",
                hdr.data_off,
                hdr.index_size,
                g.data_off,
                g.data_size,
                g.index_size
            ));
        }
        Ok(g)
    }

    /// A header describing this layout, as written at creation.
    pub fn initial_header(&self) -> Header {
        Header {
            magic: PQ_MAGIC,
            version: PQ_VERSION,
            align: self.align,
            data_off: self.data_off,
            index_off: self.index_off,
            index_size: self.index_size,
            nalloc: self.nprods,
            highwater: 0,
            max_products: 0,
            write_count_magic: WRITE_COUNT_MAGIC,
            write_count: 1,
            metrics_magic: METRICS_MAGIC,
            _pad: 0,
            most_recent: Timestamp::NONE,
            min_virt_res_time: Timestamp::NONE,
            is_full: 0,
            metrics_magic_2: METRICS_MAGIC_2,
            mvrt_bytes: 0,
            mvrt_slots: 0,
        }
    }
}

/// Reject a header whose identity words are wrong.
pub(crate) fn validate(hdr: &Header) -> Result<()> {
    if hdr.magic != PQ_MAGIC {
        return Err(corrupt!(
            "bad magic {:#010x}, expected {PQ_MAGIC:#010x} (not a product queue?)",
            hdr.magic
        ));
    }
    if hdr.version != PQ_VERSION {
        return Err(corrupt!(
            "unsupported version {} (expected {PQ_VERSION})",
            hdr.version
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcm() {
        assert_eq!(lcm(8, 4096), 4096);
        assert_eq!(lcm(3, 4096), 12288);
        assert_eq!(lcm(4096, 4096), 4096);
    }

    #[test]
    fn test_geometry_layout() {
        let g = Geometry::compute(8, 1 << 20, 100).unwrap();
        let page = page_size::get() as u64;
        assert_eq!(g.data_off % page, 0);
        assert!(g.data_off >= HEADER_SIZE as u64);
        assert_eq!(g.data_size, 1 << 20);
        assert_eq!(g.index_off, g.data_off + g.data_size);
        assert_eq!(
            g.index_size as usize,
            g.rl_size + g.tq_size + g.fb_size + g.sx_size
        );
        assert_eq!(g.total_size, g.index_off + g.index_size);
        // Sections are page-aligned and in file order.
        for off in [g.rl_off, g.tq_off, g.fb_off, g.sx_off] {
            assert_eq!(off % page as usize, 0);
        }
        assert!(g.rl_off < g.tq_off && g.tq_off < g.fb_off && g.fb_off < g.sx_off);
    }

    #[test]
    fn test_header_roundtrip() {
        let g = Geometry::compute(8, 4096, 10).unwrap();
        let hdr = g.initial_header();
        validate(&hdr).unwrap();
        let back = Geometry::from_header(&hdr).unwrap();
        assert_eq!(back, g);
    }

    #[test]
    fn test_validate_rejects() {
        let g = Geometry::compute(8, 4096, 10).unwrap();
        let mut hdr = g.initial_header();
        hdr.magic = 0xDEAD_BEEF;
        assert!(validate(&hdr).is_err());
        let mut hdr = g.initial_header();
        hdr.version = 99;
        assert!(validate(&hdr).is_err());
    }

    #[test]
    fn test_odd_alignment() {
        // Non-power-of-two alignments still produce a consistent layout.
        let g = Geometry::compute(24, 100_000, 32).unwrap();
        assert_eq!(g.data_off % 24, 0);
        assert_eq!(g.data_size % 24, 0);
        let hdr = g.initial_header();
        assert_eq!(Geometry::from_header(&hdr).unwrap(), g);
    }
}
