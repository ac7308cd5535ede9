//! Time index: a skip list of products ordered by insertion timestamp.
//!
//! Entries are `(timestamp, data-region offset)` pairs; timestamps are
//! strictly unique within the queue, so insertion advances a colliding
//! stamp by one microsecond and retries until it finds a gap. Forward
//! pointers live in free-block arena cells; the head block is a full-height
//! reserve block taken at creation.

use bytemuck::{Pod, Zeroable};

use crate::NIL;
use crate::Relation;
use crate::error::{PqError, Result, corrupt};
use crate::fb::{FB_MAX_LEVELS, Fb};
use crate::time::Timestamp;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct TqHeader {
    pub nalloc: u64,
    pub nelems: u64,
    /// Head of the free-element list, threaded through `fblk`.
    pub free_head: u64,
    /// Current list level (1-based).
    pub level: u64,
    /// Arena block holding the head forward pointers.
    pub head_blk: u64,
}

pub(crate) const TQ_HEADER_SIZE: usize = size_of::<TqHeader>();

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct TqElem {
    pub when: Timestamp,
    /// Data-region offset of the product this entry indexes.
    pub offset: u64,
    /// Forward-pointer block while linked; next free element while free.
    pub fblk: u64,
}

/// Bytes the time index occupies for `nalloc` products.
pub(crate) fn byte_size(nalloc: u64) -> usize {
    TQ_HEADER_SIZE + nalloc as usize * size_of::<TqElem>()
}

/// Mutable view over the time index within the (locked) index segment.
pub(crate) struct Tq<'a> {
    pub hdr: &'a mut TqHeader,
    elems: &'a mut [TqElem],
}

impl<'a> Tq<'a> {
    /// Initialize a fresh index. Draws the head block from the arena.
    pub fn create(bytes: &'a mut [u8], nalloc: u64, fb: &mut Fb<'_>) -> Result<Tq<'a>> {
        let (hdr_bytes, rest) = bytes.split_at_mut(TQ_HEADER_SIZE);
        let hdr: &mut TqHeader = bytemuck::from_bytes_mut(hdr_bytes);
        let head_blk = fb.get(fb.maxlevel())?;
        fb.clear(head_blk, fb.maxlevel());
        *hdr = TqHeader {
            nalloc,
            nelems: 0,
            free_head: NIL,
            level: 1,
            head_blk,
        };
        let (elem_bytes, _) = rest.split_at_mut(nalloc as usize * size_of::<TqElem>());
        let elems: &mut [TqElem] = bytemuck::cast_slice_mut(elem_bytes);
        let mut tq = Tq { hdr, elems };
        for i in (0..nalloc).rev() {
            tq.elems[i as usize] = TqElem {
                when: Timestamp::NONE,
                offset: 0,
                fblk: tq.hdr.free_head,
            };
            tq.hdr.free_head = i;
        }
        Ok(tq)
    }

    /// Attach to an existing index.
    pub fn attach(bytes: &'a mut [u8]) -> Result<Tq<'a>> {
        let (hdr_bytes, rest) = bytes.split_at_mut(TQ_HEADER_SIZE);
        let hdr: &mut TqHeader = bytemuck::from_bytes_mut(hdr_bytes);
        let nalloc = hdr.nalloc as usize;
        let need = nalloc * size_of::<TqElem>();
        if rest.len() < need {
            return Err(corrupt!(
                "time index truncated: {} bytes present, header claims {nalloc} slots",
                rest.len()
            ));
        }
        let (elem_bytes, _) = rest.split_at_mut(need);
        let elems: &mut [TqElem] = bytemuck::cast_slice_mut(elem_bytes);
        Ok(Tq { hdr, elems })
    }

    #[inline]
    pub fn elem(&self, idx: u64) -> &TqElem {
        &self.elems[idx as usize]
    }

    #[inline]
    pub fn has_free_slot(&self) -> bool {
        self.hdr.free_head != NIL
    }

    /// Forward pointer at `lvl` from `node` (NIL = the head).
    #[inline]
    fn fwd(&self, fb: &Fb<'_>, node: u64, lvl: usize) -> u64 {
        let blk = if node == NIL {
            self.hdr.head_blk
        } else {
            self.elems[node as usize].fblk
        };
        fb.fwd(blk, lvl)
    }

    #[inline]
    fn set_fwd(&mut self, fb: &mut Fb<'_>, node: u64, lvl: usize, target: u64) {
        let blk = if node == NIL {
            self.hdr.head_blk
        } else {
            self.elems[node as usize].fblk
        };
        fb.set_fwd(blk, lvl, target);
    }

    #[inline]
    fn key(&self, idx: u64) -> (Timestamp, u64) {
        let e = &self.elems[idx as usize];
        (e.when, e.offset)
    }

    /// Greatest node whose `(when, offset)` key is strictly less than
    /// `key`, with the traversal's predecessor at every level recorded in
    /// `update`. Returns the level-0 predecessor (NIL = head).
    fn locate(&self, fb: &Fb<'_>, key: (Timestamp, u64), update: &mut [u64; FB_MAX_LEVELS]) -> u64 {
        let mut x = NIL;
        for lvl in (0..self.hdr.level as usize).rev() {
            loop {
                let nxt = self.fwd(fb, x, lvl);
                if nxt != NIL && self.key(nxt) < key {
                    x = nxt;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }
        x
    }

    /// Find the entry related to `key` per `rel`: the greatest-less,
    /// exact, or least-greater entry.
    pub fn find(&self, fb: &Fb<'_>, key: (Timestamp, u64), rel: Relation) -> Option<u64> {
        let mut update = [NIL; FB_MAX_LEVELS];
        let x = self.locate(fb, key, &mut update);
        match rel {
            Relation::Less => (x != NIL).then_some(x),
            Relation::Equal => {
                let nxt = self.fwd(fb, x, 0);
                (nxt != NIL && self.key(nxt) == key).then_some(nxt)
            }
            Relation::Greater => {
                let mut nxt = self.fwd(fb, x, 0);
                if nxt != NIL && self.key(nxt) == key {
                    nxt = self.fwd(fb, nxt, 0);
                }
                (nxt != NIL).then_some(nxt)
            }
        }
    }

    /// The oldest entry.
    pub fn first(&self, fb: &Fb<'_>) -> Option<u64> {
        let nxt = self.fwd(fb, NIL, 0);
        (nxt != NIL).then_some(nxt)
    }

    /// The entry after `idx` in time order.
    pub fn next(&self, fb: &Fb<'_>, idx: u64) -> Option<u64> {
        let nxt = self.fwd(fb, idx, 0);
        (nxt != NIL).then_some(nxt)
    }

    /// Insert an entry for the region at `offset`, stamped with `now`
    /// advanced past any colliding timestamps. Returns the element index
    /// and the (possibly advanced) stamp.
    pub fn add(
        &mut self,
        fb: &mut Fb<'_>,
        rng: &mut oorandom::Rand32,
        offset: u64,
        now: Timestamp,
    ) -> Result<(u64, Timestamp)> {
        if self.hdr.free_head == NIL {
            return Err(PqError::OutOfSlots);
        }
        let mut when = now;
        let mut update = [NIL; FB_MAX_LEVELS];
        loop {
            let x = self.locate(fb, (when, 0), &mut update);
            let nxt = self.fwd(fb, x, 0);
            if nxt != NIL && self.elems[nxt as usize].when == when {
                // Strictly unique stamps: advance by the smallest
                // representable amount and search again.
                when = when.plus_usec(Timestamp::TICK);
                continue;
            }
            break;
        }

        // New node height: P(k) = (3/4)(1/4)^(k-1), capped so one insert
        // raises the list level by at most 1 and never reaches the head
        // block's height.
        let cap = usize::min(self.hdr.level as usize + 1, fb.maxlevel() - 1);
        let mut height = 1;
        while height < cap && rng.rand_range(0..4) == 0 {
            height += 1;
        }

        let blk = fb.get(height)?;
        fb.clear(blk, height);

        let idx = self.hdr.free_head;
        self.hdr.free_head = self.elems[idx as usize].fblk;
        self.elems[idx as usize] = TqElem {
            when,
            offset,
            fblk: blk,
        };
        if height > self.hdr.level as usize {
            update[self.hdr.level as usize] = NIL;
            self.hdr.level = height as u64;
        }
        for lvl in 0..height {
            let succ = self.fwd(fb, update[lvl], lvl);
            fb.set_fwd(blk, lvl, succ);
            self.set_fwd(fb, update[lvl], lvl, idx);
        }
        self.hdr.nelems += 1;
        Ok((idx, when))
    }

    /// Remove the entry at `idx`, releasing its forward block and lowering
    /// the list level if the top level emptied.
    pub fn delete(&mut self, fb: &mut Fb<'_>, idx: u64) -> Result<()> {
        let key = self.key(idx);
        let mut update = [NIL; FB_MAX_LEVELS];
        self.locate(fb, key, &mut update);
        if self.fwd(fb, update[0], 0) != idx {
            return Err(corrupt!(
                "time entry {idx} (offset {:#x}) missing from its skip chain",
                self.elems[idx as usize].offset
            ));
        }
        let mut height = 0;
        for lvl in 0..self.hdr.level as usize {
            if self.fwd(fb, update[lvl], lvl) == idx {
                let succ = self.fwd(fb, idx, lvl);
                self.set_fwd(fb, update[lvl], lvl, succ);
                height = lvl + 1;
            }
        }
        fb.release(height, self.elems[idx as usize].fblk);
        self.elems[idx as usize] = TqElem {
            when: Timestamp::NONE,
            offset: 0,
            fblk: self.hdr.free_head,
        };
        self.hdr.free_head = idx;
        self.hdr.nelems -= 1;
        while self.hdr.level > 1 && self.fwd(fb, NIL, self.hdr.level as usize - 1) == NIL {
            self.hdr.level -= 1;
        }
        Ok(())
    }
}
