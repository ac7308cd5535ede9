//! Region table: every byte extent of the data segment, in one of three
//! states, with the structures that make allocation fast.
//!
//! Four threaded structures share the flat record array:
//!
//! - the empty list (slots with no extent), singly linked through `next`;
//! - the in-use hash, chained by offset through `next`/`prev`;
//! - the free-by-offset skip list (`next` holds the arena block), giving
//!   O(1) coalescing after a free;
//! - the free-by-extent skip list (`prev` holds the arena block), keyed on
//!   `(extent, offset)`, giving O(log n) best fit.
//!
//! The `next`/`prev` fields mean different things per state; the state tag
//! is authoritative and every accessor checks it in debug builds.

use bytemuck::{Pod, Zeroable};

use crate::error::{PqError, Result, corrupt};
use crate::fb::{FB_MAX_LEVELS, Fb};
use crate::{NIL, RL_MAGIC};

pub(crate) const RS_EMPTY: u32 = 0;
pub(crate) const RS_FREE: u32 = 1;
pub(crate) const RS_IN_USE: u32 = 2;

/// Extra slack beyond the smallest extent ever requested; remainders
/// smaller than this are not worth a table slot.
const SPLIT_SLOP: u64 = 64;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct Region {
    pub offset: u64,
    pub extent: u64,
    pub state: u32,
    pub _pad: u32,
    /// Empty: next empty slot. InUse: hash-chain successor. Free: arena
    /// block of the by-offset skip node.
    pub next: u64,
    /// InUse: hash-chain predecessor. Free: arena block of the by-extent
    /// skip node. Empty: unused.
    pub prev: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct RlHeader {
    pub magic: u32,
    pub _pad: u32,
    pub nalloc: u64,
    pub nelems: u64,
    pub nfree: u64,
    pub nempty: u64,
    /// Data bytes held by in-use regions.
    pub nbytes: u64,
    /// Cached largest free extent; 0 when nothing is free.
    pub maxfextent: u64,
    pub empty_head: u64,
    pub nchains: u64,
    pub foff_head_blk: u64,
    pub foff_level: u64,
    pub fext_head_blk: u64,
    pub fext_level: u64,
    /// Smallest aligned extent ever requested; drives the split heuristic.
    pub smallest_extent: u64,
    pub max_nelems: u64,
    pub max_nbytes: u64,
    pub min_nempty: u64,
    pub max_nfree: u64,
}

pub(crate) const RL_HEADER_SIZE: usize = size_of::<RlHeader>();

/// Table slots for `nprods` products: each product plus a worst-case
/// interleaving of free fragments, with slack.
pub(crate) fn slots_for(nprods: u64) -> u64 {
    2 * nprods + 2
}

/// Hash chains for the in-use index: the largest prime at most N/4.
pub(crate) fn chains_for(nprods: u64) -> u64 {
    largest_prime_at_most((nprods / 4).max(2))
}

pub(crate) fn byte_size(nalloc: u64, nchains: u64) -> usize {
    RL_HEADER_SIZE
        + nalloc as usize * size_of::<Region>()
        + nchains as usize * size_of::<u64>()
}

pub(crate) fn largest_prime_at_most(n: u64) -> u64 {
    let is_prime = |v: u64| {
        if v < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= v {
            if v % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    };
    (2..=n).rev().find(|&v| is_prime(v)).unwrap_or(2)
}

/// Which free skip list an operation walks.
#[derive(Clone, Copy, PartialEq, Eq)]
enum FreeList {
    ByOffset,
    ByExtent,
}

/// Mutable view over the region table within the (locked) index segment.
pub(crate) struct Rl<'a> {
    pub hdr: &'a mut RlHeader,
    regions: &'a mut [Region],
    chains: &'a mut [u64],
}

impl<'a> Rl<'a> {
    fn split_bytes(
        bytes: &'a mut [u8],
        nalloc: u64,
        nchains: u64,
    ) -> (&'a mut RlHeader, &'a mut [Region], &'a mut [u64]) {
        let (hdr_bytes, rest) = bytes.split_at_mut(RL_HEADER_SIZE);
        let (region_bytes, chain_bytes) =
            rest.split_at_mut(nalloc as usize * size_of::<Region>());
        (
            bytemuck::from_bytes_mut(hdr_bytes),
            bytemuck::cast_slice_mut(region_bytes),
            &mut bytemuck::cast_slice_mut(chain_bytes)[..nchains as usize],
        )
    }

    /// Initialize a fresh table with one maximum-extent free region
    /// covering the entire data segment.
    pub fn create(
        bytes: &'a mut [u8],
        nprods: u64,
        fb: &mut Fb<'_>,
        rng: &mut oorandom::Rand32,
        data_off: u64,
        data_size: u64,
    ) -> Result<Rl<'a>> {
        let nalloc = slots_for(nprods);
        let nchains = chains_for(nprods);
        let (hdr, regions, chains) = Self::split_bytes(bytes, nalloc, nchains);
        let foff_head_blk = fb.get(fb.maxlevel())?;
        fb.clear(foff_head_blk, fb.maxlevel());
        let fext_head_blk = fb.get(fb.maxlevel())?;
        fb.clear(fext_head_blk, fb.maxlevel());
        *hdr = RlHeader {
            magic: RL_MAGIC,
            _pad: 0,
            nalloc,
            nelems: 0,
            nfree: 0,
            nempty: 0,
            nbytes: 0,
            maxfextent: 0,
            empty_head: NIL,
            nchains,
            foff_head_blk,
            foff_level: 1,
            fext_head_blk,
            fext_level: 1,
            smallest_extent: u64::MAX,
            max_nelems: 0,
            max_nbytes: 0,
            min_nempty: nalloc,
            max_nfree: 0,
        };
        chains.fill(NIL);
        let mut rl = Rl {
            hdr,
            regions,
            chains,
        };
        for idx in (0..nalloc).rev() {
            rl.regions[idx as usize] = Region::zeroed();
            rl.push_empty(idx);
        }
        // One free region spanning the whole data segment.
        let idx = rl.pop_empty().expect("fresh table has empty slots");
        rl.regions[idx as usize] = Region {
            offset: data_off,
            extent: data_size,
            state: RS_FREE,
            _pad: 0,
            next: NIL,
            prev: NIL,
        };
        rl.hdr.nfree = 1;
        rl.insert_free(fb, rng, idx, FreeList::ByOffset)?;
        rl.insert_free(fb, rng, idx, FreeList::ByExtent)?;
        rl.hdr.maxfextent = data_size;
        rl.hdr.max_nfree = 1;
        Ok(rl)
    }

    /// Attach to an existing table, validating its magic.
    pub fn attach(bytes: &'a mut [u8]) -> Result<Rl<'a>> {
        let hdr_probe: &RlHeader =
            bytemuck::from_bytes(&bytes[..RL_HEADER_SIZE]);
        if hdr_probe.magic != RL_MAGIC {
            return Err(corrupt!(
                "region table magic {:#010x}, expected {RL_MAGIC:#010x}",
                hdr_probe.magic
            ));
        }
        let (nalloc, nchains) = (hdr_probe.nalloc, hdr_probe.nchains);
        let need = byte_size(nalloc, nchains);
        if bytes.len() < need {
            return Err(corrupt!(
                "region table truncated: {} bytes present, need {need}",
                bytes.len()
            ));
        }
        let (hdr, regions, chains) = Self::split_bytes(bytes, nalloc, nchains);
        Ok(Rl {
            hdr,
            regions,
            chains,
        })
    }

    #[inline]
    pub fn region(&self, idx: u64) -> &Region {
        &self.regions[idx as usize]
    }

    // ---- empty list ----

    fn push_empty(&mut self, idx: u64) {
        let r = &mut self.regions[idx as usize];
        r.state = RS_EMPTY;
        r.offset = 0;
        r.extent = 0;
        r.prev = NIL;
        r.next = self.hdr.empty_head;
        self.hdr.empty_head = idx;
        self.hdr.nempty += 1;
    }

    fn pop_empty(&mut self) -> Option<u64> {
        let idx = self.hdr.empty_head;
        if idx == NIL {
            return None;
        }
        self.hdr.empty_head = self.regions[idx as usize].next;
        self.hdr.nempty -= 1;
        self.hdr.min_nempty = self.hdr.min_nempty.min(self.hdr.nempty);
        Some(idx)
    }

    // ---- in-use hash ----

    #[inline]
    fn chain_of(&self, offset: u64) -> usize {
        (offset % self.hdr.nchains) as usize
    }

    fn hash_add(&mut self, idx: u64) {
        let offset = self.regions[idx as usize].offset;
        let h = self.chain_of(offset);
        let head = self.chains[h];
        let r = &mut self.regions[idx as usize];
        r.next = head;
        r.prev = NIL;
        if head != NIL {
            self.regions[head as usize].prev = idx;
        }
        self.chains[h] = idx;
    }

    fn hash_del(&mut self, idx: u64) {
        let (offset, next, prev) = {
            let r = &self.regions[idx as usize];
            (r.offset, r.next, r.prev)
        };
        if prev != NIL {
            self.regions[prev as usize].next = next;
        } else {
            let h = self.chain_of(offset);
            self.chains[h] = next;
        }
        if next != NIL {
            self.regions[next as usize].prev = prev;
        }
    }

    /// Look up an in-use region by its exact offset.
    pub fn find_in_use(&self, offset: u64) -> Option<u64> {
        let mut at = self.chains[self.chain_of(offset)];
        while at != NIL {
            let r = &self.regions[at as usize];
            if r.offset == offset {
                debug_assert_eq!(r.state, RS_IN_USE);
                return Some(at);
            }
            at = r.next;
        }
        None
    }

    // ---- free skip lists ----

    fn list_level(&self, which: FreeList) -> usize {
        match which {
            FreeList::ByOffset => self.hdr.foff_level as usize,
            FreeList::ByExtent => self.hdr.fext_level as usize,
        }
    }

    fn set_list_level(&mut self, which: FreeList, level: usize) {
        match which {
            FreeList::ByOffset => self.hdr.foff_level = level as u64,
            FreeList::ByExtent => self.hdr.fext_level = level as u64,
        }
    }

    fn node_blk(&self, idx: u64, which: FreeList) -> u64 {
        let r = &self.regions[idx as usize];
        debug_assert_eq!(r.state, RS_FREE);
        match which {
            FreeList::ByOffset => r.next,
            FreeList::ByExtent => r.prev,
        }
    }

    fn set_node_blk(&mut self, idx: u64, which: FreeList, blk: u64) {
        let r = &mut self.regions[idx as usize];
        match which {
            FreeList::ByOffset => r.next = blk,
            FreeList::ByExtent => r.prev = blk,
        }
    }

    fn key(&self, idx: u64, which: FreeList) -> (u64, u64) {
        let r = &self.regions[idx as usize];
        match which {
            FreeList::ByOffset => (r.offset, 0),
            FreeList::ByExtent => (r.extent, r.offset),
        }
    }

    fn fwd(&self, fb: &Fb<'_>, node: u64, which: FreeList, lvl: usize) -> u64 {
        let blk = if node == NIL {
            match which {
                FreeList::ByOffset => self.hdr.foff_head_blk,
                FreeList::ByExtent => self.hdr.fext_head_blk,
            }
        } else {
            self.node_blk(node, which)
        };
        fb.fwd(blk, lvl)
    }

    fn set_fwd(&mut self, fb: &mut Fb<'_>, node: u64, which: FreeList, lvl: usize, target: u64) {
        let blk = if node == NIL {
            match which {
                FreeList::ByOffset => self.hdr.foff_head_blk,
                FreeList::ByExtent => self.hdr.fext_head_blk,
            }
        } else {
            self.node_blk(node, which)
        };
        fb.set_fwd(blk, lvl, target);
    }

    /// Level-0 predecessor of `key` with per-level predecessors in
    /// `update`.
    fn locate(
        &self,
        fb: &Fb<'_>,
        key: (u64, u64),
        which: FreeList,
        update: &mut [u64; FB_MAX_LEVELS],
    ) -> u64 {
        let mut x = NIL;
        for lvl in (0..self.list_level(which)).rev() {
            loop {
                let nxt = self.fwd(fb, x, which, lvl);
                if nxt != NIL && self.key(nxt, which) < key {
                    x = nxt;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }
        x
    }

    /// Link a free region into one of the skip lists.
    fn insert_free(
        &mut self,
        fb: &mut Fb<'_>,
        rng: &mut oorandom::Rand32,
        idx: u64,
        which: FreeList,
    ) -> Result<()> {
        let key = self.key(idx, which);
        let mut update = [NIL; FB_MAX_LEVELS];
        self.locate(fb, key, which, &mut update);

        let cap = usize::min(self.list_level(which) + 1, fb.maxlevel() - 1);
        let mut height = 1;
        while height < cap && rng.rand_range(0..4) == 0 {
            height += 1;
        }
        let blk = fb.get(height)?;
        fb.clear(blk, height);
        self.set_node_blk(idx, which, blk);
        if height > self.list_level(which) {
            update[self.list_level(which)] = NIL;
            self.set_list_level(which, height);
        }
        for lvl in 0..height {
            let succ = self.fwd(fb, update[lvl], which, lvl);
            fb.set_fwd(blk, lvl, succ);
            self.set_fwd(fb, update[lvl], which, lvl, idx);
        }
        Ok(())
    }

    /// Unlink a free region from one of the skip lists, releasing its
    /// arena block.
    fn remove_free(&mut self, fb: &mut Fb<'_>, idx: u64, which: FreeList) -> Result<()> {
        let key = self.key(idx, which);
        let mut update = [NIL; FB_MAX_LEVELS];
        self.locate(fb, key, which, &mut update);
        if self.fwd(fb, update[0], which, 0) != idx {
            return Err(corrupt!(
                "free region {idx} (offset {:#x}) missing from its skip chain",
                self.regions[idx as usize].offset
            ));
        }
        let mut height = 0;
        for lvl in 0..self.list_level(which) {
            if self.fwd(fb, update[lvl], which, lvl) == idx {
                let succ = self.fwd(fb, idx, which, lvl);
                self.set_fwd(fb, update[lvl], which, lvl, succ);
                height = lvl + 1;
            }
        }
        fb.release(height, self.node_blk(idx, which));
        self.set_node_blk(idx, which, NIL);
        while self.list_level(which) > 1
            && self.fwd(fb, NIL, which, self.list_level(which) - 1) == NIL
        {
            let lvl = self.list_level(which) - 1;
            self.set_list_level(which, lvl);
        }
        Ok(())
    }

    /// Largest extent on the by-extent list (its last node).
    fn recompute_maxfextent(&mut self, fb: &Fb<'_>) {
        let mut x = NIL;
        for lvl in (0..self.list_level(FreeList::ByExtent)).rev() {
            loop {
                let nxt = self.fwd(fb, x, FreeList::ByExtent, lvl);
                if nxt != NIL {
                    x = nxt;
                } else {
                    break;
                }
            }
        }
        self.hdr.maxfextent = if x == NIL {
            0
        } else {
            self.regions[x as usize].extent
        };
    }

    // ---- allocation ----

    /// Best-fit allocation of an (already aligned) extent. Returns the
    /// region index. `NoRoom` means eviction may help; `OutOfMemory` means
    /// the table is out of slots for the split remainder.
    pub fn alloc(
        &mut self,
        fb: &mut Fb<'_>,
        rng: &mut oorandom::Rand32,
        extent: u64,
    ) -> Result<u64> {
        self.hdr.smallest_extent = self.hdr.smallest_extent.min(extent);
        if extent > self.hdr.maxfextent {
            return Err(PqError::NoRoom);
        }
        let mut update = [NIL; FB_MAX_LEVELS];
        let pred = self.locate(fb, (extent, 0), FreeList::ByExtent, &mut update);
        let cand = self.fwd(fb, pred, FreeList::ByExtent, 0);
        if cand == NIL {
            return Err(PqError::NoRoom);
        }
        self.remove_free(fb, cand, FreeList::ByExtent)?;
        self.remove_free(fb, cand, FreeList::ByOffset)?;

        let whole = self.regions[cand as usize].extent;
        if whole > extent.saturating_add(self.hdr.smallest_extent) + SPLIT_SLOP {
            let Some(slot) = self.pop_empty() else {
                // No slot for the remainder; put the region back untouched.
                self.insert_free(fb, rng, cand, FreeList::ByOffset)?;
                self.insert_free(fb, rng, cand, FreeList::ByExtent)?;
                return Err(PqError::OutOfMemory);
            };
            let base = self.regions[cand as usize].offset;
            self.regions[slot as usize] = Region {
                offset: base + extent,
                extent: whole - extent,
                state: RS_FREE,
                _pad: 0,
                next: NIL,
                prev: NIL,
            };
            // Link the remainder into both lists before shrinking `cand`,
            // so arena exhaustion mid-split rolls back to the unsplit
            // region and no partial state survives.
            if let Err(e) = self.insert_free(fb, rng, slot, FreeList::ByOffset) {
                self.push_empty(slot);
                self.insert_free(fb, rng, cand, FreeList::ByOffset)?;
                self.insert_free(fb, rng, cand, FreeList::ByExtent)?;
                return Err(e);
            }
            if let Err(e) = self.insert_free(fb, rng, slot, FreeList::ByExtent) {
                self.remove_free(fb, slot, FreeList::ByOffset)?;
                self.push_empty(slot);
                self.insert_free(fb, rng, cand, FreeList::ByOffset)?;
                self.insert_free(fb, rng, cand, FreeList::ByExtent)?;
                return Err(e);
            }
            self.regions[cand as usize].extent = extent;
            self.hdr.nfree += 1;
        }

        let r = &mut self.regions[cand as usize];
        r.state = RS_IN_USE;
        r.next = NIL;
        r.prev = NIL;
        let actual = r.extent;
        self.hash_add(cand);
        self.hdr.nfree -= 1;
        self.hdr.nelems += 1;
        self.hdr.nbytes += actual;
        self.hdr.max_nelems = self.hdr.max_nelems.max(self.hdr.nelems);
        self.hdr.max_nbytes = self.hdr.max_nbytes.max(self.hdr.nbytes);
        self.recompute_maxfextent(fb);
        log::trace!(
            "allocated region {cand}: offset {:#x}, extent {actual}",
            self.regions[cand as usize].offset
        );
        Ok(cand)
    }

    /// Free the in-use region at `offset`, coalescing with free neighbors.
    pub fn free(
        &mut self,
        fb: &mut Fb<'_>,
        rng: &mut oorandom::Rand32,
        offset: u64,
    ) -> Result<()> {
        let idx = self
            .find_in_use(offset)
            .ok_or_else(|| corrupt!("free of unknown in-use region at {offset:#x}"))?;
        self.hash_del(idx);
        {
            let r = &mut self.regions[idx as usize];
            r.state = RS_FREE;
            r.next = NIL;
            r.prev = NIL;
            self.hdr.nbytes -= r.extent;
        }
        self.hdr.nelems -= 1;
        self.hdr.nfree += 1;

        self.insert_free(fb, rng, idx, FreeList::ByOffset)?;

        // Absorb an adjacent successor.
        let succ = self.fwd(fb, idx, FreeList::ByOffset, 0);
        if succ != NIL {
            let (s_off, s_ext) = {
                let s = &self.regions[succ as usize];
                (s.offset, s.extent)
            };
            let end = self.regions[idx as usize].offset + self.regions[idx as usize].extent;
            if end == s_off {
                self.remove_free(fb, succ, FreeList::ByOffset)?;
                self.remove_free(fb, succ, FreeList::ByExtent)?;
                self.regions[idx as usize].extent += s_ext;
                self.hdr.nfree -= 1;
                self.push_empty(succ);
                log::trace!("coalesced region {succ} into {idx} (forward)");
            }
        }

        // Absorb an adjacent predecessor; the merged region keeps its slot
        // and by-offset position but takes over the predecessor's offset.
        let mut update = [NIL; FB_MAX_LEVELS];
        let pred = self.locate(fb, self.key(idx, FreeList::ByOffset), FreeList::ByOffset, &mut update);
        if pred != NIL {
            let (p_off, p_ext) = {
                let p = &self.regions[pred as usize];
                (p.offset, p.extent)
            };
            if p_off + p_ext == self.regions[idx as usize].offset {
                self.remove_free(fb, pred, FreeList::ByOffset)?;
                self.remove_free(fb, pred, FreeList::ByExtent)?;
                let r = &mut self.regions[idx as usize];
                r.offset = p_off;
                r.extent += p_ext;
                self.hdr.nfree -= 1;
                self.push_empty(pred);
                log::trace!("coalesced region {pred} into {idx} (backward)");
            }
        }

        self.insert_free(fb, rng, idx, FreeList::ByExtent)?;
        let extent = self.regions[idx as usize].extent;
        self.hdr.maxfextent = self.hdr.maxfextent.max(extent);
        self.hdr.max_nfree = self.hdr.max_nfree.max(self.hdr.nfree);
        Ok(())
    }

    /// Age-ordered walk support for tests and integrity checks.
    #[cfg(test)]
    pub fn check_invariants(&self, fb: &Fb<'_>) {
        // I1: states partition the table.
        let mut counts = [0u64; 3];
        for r in self.regions.iter() {
            counts[r.state as usize] += 1;
        }
        assert_eq!(counts[RS_EMPTY as usize], self.hdr.nempty);
        assert_eq!(counts[RS_FREE as usize], self.hdr.nfree);
        assert_eq!(counts[RS_IN_USE as usize], self.hdr.nelems);
        assert_eq!(
            self.hdr.nelems + self.hdr.nfree + self.hdr.nempty,
            self.hdr.nalloc
        );

        // I4: both lists sorted; gather members.
        let mut by_off = Vec::new();
        let mut at = self.fwd(fb, NIL, FreeList::ByOffset, 0);
        while at != NIL {
            by_off.push(at);
            at = self.fwd(fb, at, FreeList::ByOffset, 0);
        }
        let mut by_ext = Vec::new();
        let mut at = self.fwd(fb, NIL, FreeList::ByExtent, 0);
        while at != NIL {
            by_ext.push(at);
            at = self.fwd(fb, at, FreeList::ByExtent, 0);
        }
        assert_eq!(by_off.len() as u64, self.hdr.nfree);
        assert_eq!(by_ext.len() as u64, self.hdr.nfree);
        for w in by_off.windows(2) {
            assert!(self.key(w[0], FreeList::ByOffset) < self.key(w[1], FreeList::ByOffset));
        }
        for w in by_ext.windows(2) {
            assert!(self.key(w[0], FreeList::ByExtent) < self.key(w[1], FreeList::ByExtent));
        }

        // I3: no two free regions touch.
        for w in by_off.windows(2) {
            let a = self.region(w[0]);
            let b = self.region(w[1]);
            assert!(a.offset + a.extent < b.offset);
        }

        // I5: the cache matches the real maximum.
        let real_max = by_ext
            .last()
            .map(|&i| self.region(i).extent)
            .unwrap_or(0);
        assert_eq!(self.hdr.maxfextent, real_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fb::FbCapacity;

    const DATA_OFF: u64 = 4096;
    const DATA_SIZE: u64 = 64 * 1024;

    struct Fixture {
        fb_bytes: Vec<u8>,
        rl_bytes: Vec<u8>,
        rng: oorandom::Rand32,
    }

    impl Fixture {
        fn new(nprods: u64) -> Fixture {
            let mut fx = Fixture {
                fb_bytes: vec![0u8; FbCapacity::for_products(nprods).byte_size()],
                rl_bytes: vec![0u8; byte_size(slots_for(nprods), chains_for(nprods))],
                rng: oorandom::Rand32::new(7),
            };
            let mut fb = Fb::create(&mut fx.fb_bytes, nprods);
            Rl::create(
                &mut fx.rl_bytes,
                nprods,
                &mut fb,
                &mut fx.rng,
                DATA_OFF,
                DATA_SIZE,
            )
            .unwrap();
            fx
        }

        fn views(&mut self) -> (Rl<'_>, Fb<'_>, &mut oorandom::Rand32) {
            (
                Rl::attach(&mut self.rl_bytes).unwrap(),
                Fb::attach(&mut self.fb_bytes).unwrap(),
                &mut self.rng,
            )
        }
    }

    #[test]
    fn test_largest_prime() {
        assert_eq!(largest_prime_at_most(2), 2);
        assert_eq!(largest_prime_at_most(10), 7);
        assert_eq!(largest_prime_at_most(13), 13);
        assert_eq!(largest_prime_at_most(100), 97);
    }

    #[test]
    fn test_create_single_free_region() {
        let mut fx = Fixture::new(16);
        let (rl, fb, _rng) = fx.views();
        assert_eq!(rl.hdr.nfree, 1);
        assert_eq!(rl.hdr.nelems, 0);
        assert_eq!(rl.hdr.maxfextent, DATA_SIZE);
        rl.check_invariants(&fb);
    }

    #[test]
    fn test_alloc_splits_and_hashes() {
        let mut fx = Fixture::new(16);
        let (mut rl, mut fb, rng) = fx.views();
        let idx = rl.alloc(&mut fb, rng, 1024).unwrap();
        let r = *rl.region(idx);
        assert_eq!(r.offset, DATA_OFF);
        assert_eq!(r.extent, 1024);
        assert_eq!(r.state, RS_IN_USE);
        assert_eq!(rl.find_in_use(DATA_OFF), Some(idx));
        // Remainder became a free region.
        assert_eq!(rl.hdr.nfree, 1);
        assert_eq!(rl.hdr.maxfextent, DATA_SIZE - 1024);
        assert_eq!(rl.hdr.nbytes, 1024);
        rl.check_invariants(&fb);
    }

    #[test]
    fn test_alloc_no_room() {
        let mut fx = Fixture::new(16);
        let (mut rl, mut fb, rng) = fx.views();
        assert!(matches!(
            rl.alloc(&mut fb, rng, DATA_SIZE + 1),
            Err(PqError::NoRoom)
        ));
        rl.check_invariants(&fb);
    }

    #[test]
    fn test_best_fit_prefers_smallest() {
        let mut fx = Fixture::new(16);
        let (mut rl, mut fb, rng) = fx.views();
        // Carve three in-use regions then free the first and third to get
        // two free holes of different sizes.
        let a = rl.alloc(&mut fb, rng, 8192).unwrap();
        let _b = rl.alloc(&mut fb, rng, 1024).unwrap();
        let c = rl.alloc(&mut fb, rng, 2048).unwrap();
        let a_off = rl.region(a).offset;
        let c_off = rl.region(c).offset;
        rl.free(&mut fb, rng, a_off).unwrap();
        rl.free(&mut fb, rng, c_off).unwrap();
        rl.check_invariants(&fb);

        // A 2 KiB request must land in the 2 KiB hole, not the 8 KiB one.
        let d = rl.alloc(&mut fb, rng, 2048).unwrap();
        assert_eq!(rl.region(d).offset, c_off);
        rl.check_invariants(&fb);
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let mut fx = Fixture::new(16);
        let (mut rl, mut fb, rng) = fx.views();
        let a = rl.alloc(&mut fb, rng, 1024).unwrap();
        let b = rl.alloc(&mut fb, rng, 1024).unwrap();
        let c = rl.alloc(&mut fb, rng, 1024).unwrap();
        let (a_off, b_off, c_off) = (
            rl.region(a).offset,
            rl.region(b).offset,
            rl.region(c).offset,
        );
        // Regions are carved front-to-back, so a|b|c are adjacent.
        assert_eq!(a_off + 1024, b_off);
        assert_eq!(b_off + 1024, c_off);

        rl.free(&mut fb, rng, a_off).unwrap();
        rl.free(&mut fb, rng, c_off).unwrap();
        let nfree_before = rl.hdr.nfree;
        rl.check_invariants(&fb);

        // Freeing b merges all three holes (and the trailing free space)
        // into one.
        rl.free(&mut fb, rng, b_off).unwrap();
        assert!(rl.hdr.nfree < nfree_before);
        assert_eq!(rl.hdr.nelems, 0);
        assert_eq!(rl.hdr.maxfextent, DATA_SIZE);
        assert_eq!(rl.hdr.nfree, 1);
        rl.check_invariants(&fb);
    }

    #[test]
    fn test_exact_fit_does_not_split() {
        let mut fx = Fixture::new(16);
        let (mut rl, mut fb, rng) = fx.views();
        let a = rl.alloc(&mut fb, rng, 1024).unwrap();
        let a_off = rl.region(a).offset;
        rl.free(&mut fb, rng, a_off).unwrap();
        rl.check_invariants(&fb);

        // The whole segment is one hole again; an exact-size request for a
        // re-carved 1024 hole must not split further.
        let b = rl.alloc(&mut fb, rng, 1024).unwrap();
        let _c = rl.alloc(&mut fb, rng, 2048).unwrap();
        let b_off = rl.region(b).offset;
        rl.free(&mut fb, rng, b_off).unwrap();
        rl.check_invariants(&fb);
        let again = rl.alloc(&mut fb, rng, 1024).unwrap();
        assert_eq!(rl.region(again).offset, b_off);
        assert_eq!(rl.region(again).extent, 1024);
        rl.check_invariants(&fb);
    }

    #[test]
    fn test_alloc_free_cycle_many() {
        let mut fx = Fixture::new(64);
        let (mut rl, mut fb, rng) = fx.views();
        let mut live: Vec<u64> = Vec::new();
        for round in 0..50u64 {
            let extent = 512 + (round % 7) * 256;
            match rl.alloc(&mut fb, rng, extent) {
                Ok(idx) => live.push(rl.region(idx).offset),
                Err(PqError::NoRoom) => {
                    // Free the oldest half and keep going.
                    for off in live.drain(..live.len() / 2 + 1) {
                        rl.free(&mut fb, rng, off).unwrap();
                    }
                }
                Err(e) => panic!("unexpected: {e}"),
            }
            rl.check_invariants(&fb);
        }
        for off in live {
            rl.free(&mut fb, rng, off).unwrap();
        }
        rl.check_invariants(&fb);
        assert_eq!(rl.hdr.maxfextent, DATA_SIZE);
    }
}
