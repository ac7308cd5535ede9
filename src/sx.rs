//! Signature index: 16-byte product signatures to data-region offsets.
//!
//! A chained hash keyed on the first four signature bytes. Removing the
//! entry for an in-use product (`find_and_delete`) is mandatory before its
//! region is deallocated; a miss there means the indices disagree and the
//! queue is corrupt.

use bytemuck::{Pod, Zeroable};

use crate::error::{PqError, Result, corrupt};
use crate::product::Signature;
use crate::region::largest_prime_at_most;
use crate::{NIL, SX_MAGIC};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct SxHeader {
    pub magic: u32,
    pub _pad: u32,
    pub nalloc: u64,
    pub nelems: u64,
    pub free_head: u64,
    pub nchains: u64,
}

pub(crate) const SX_HEADER_SIZE: usize = size_of::<SxHeader>();

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct SxElem {
    pub sig: [u8; 16],
    pub offset: u64,
    /// Chain successor while linked; next free element while free.
    pub next: u64,
}

pub(crate) fn chains_for(nprods: u64) -> u64 {
    largest_prime_at_most(nprods.max(2))
}

pub(crate) fn byte_size(nalloc: u64, nchains: u64) -> usize {
    SX_HEADER_SIZE
        + nalloc as usize * size_of::<SxElem>()
        + nchains as usize * size_of::<u64>()
}

/// Mutable view over the signature index within the (locked) index
/// segment.
pub(crate) struct Sx<'a> {
    pub hdr: &'a mut SxHeader,
    elems: &'a mut [SxElem],
    chains: &'a mut [u64],
}

impl<'a> Sx<'a> {
    fn split_bytes(
        bytes: &'a mut [u8],
        nalloc: u64,
        nchains: u64,
    ) -> (&'a mut SxHeader, &'a mut [SxElem], &'a mut [u64]) {
        let (hdr_bytes, rest) = bytes.split_at_mut(SX_HEADER_SIZE);
        let (elem_bytes, chain_bytes) =
            rest.split_at_mut(nalloc as usize * size_of::<SxElem>());
        (
            bytemuck::from_bytes_mut(hdr_bytes),
            bytemuck::cast_slice_mut(elem_bytes),
            &mut bytemuck::cast_slice_mut(chain_bytes)[..nchains as usize],
        )
    }

    pub fn create(bytes: &'a mut [u8], nprods: u64) -> Sx<'a> {
        let nchains = chains_for(nprods);
        let (hdr, elems, chains) = Self::split_bytes(bytes, nprods, nchains);
        *hdr = SxHeader {
            magic: SX_MAGIC,
            _pad: 0,
            nalloc: nprods,
            nelems: 0,
            free_head: NIL,
            nchains,
        };
        chains.fill(NIL);
        let mut sx = Sx { hdr, elems, chains };
        for i in (0..nprods).rev() {
            sx.elems[i as usize] = SxElem {
                sig: [0; 16],
                offset: 0,
                next: sx.hdr.free_head,
            };
            sx.hdr.free_head = i;
        }
        sx
    }

    pub fn attach(bytes: &'a mut [u8]) -> Result<Sx<'a>> {
        let hdr_probe: &SxHeader = bytemuck::from_bytes(&bytes[..SX_HEADER_SIZE]);
        if hdr_probe.magic != SX_MAGIC {
            return Err(corrupt!(
                "signature index magic {:#010x}, expected {SX_MAGIC:#010x}",
                hdr_probe.magic
            ));
        }
        let (nalloc, nchains) = (hdr_probe.nalloc, hdr_probe.nchains);
        let need = byte_size(nalloc, nchains);
        if bytes.len() < need {
            return Err(corrupt!(
                "signature index truncated: {} bytes present, need {need}",
                bytes.len()
            ));
        }
        let (hdr, elems, chains) = Self::split_bytes(bytes, nalloc, nchains);
        Ok(Sx { hdr, elems, chains })
    }

    #[inline]
    fn chain_of(&self, sig: &Signature) -> usize {
        (u64::from(sig.prefix()) % self.hdr.nchains) as usize
    }

    /// Offset of the product with this signature, if present.
    pub fn find(&self, sig: &Signature) -> Option<u64> {
        let mut at = self.chains[self.chain_of(sig)];
        while at != NIL {
            let e = &self.elems[at as usize];
            if e.sig == sig.0 {
                return Some(e.offset);
            }
            at = e.next;
        }
        None
    }

    /// Add a signature entry. The caller has already ruled out duplicates.
    pub fn add(&mut self, sig: &Signature, offset: u64) -> Result<()> {
        debug_assert!(self.find(sig).is_none());
        let idx = self.hdr.free_head;
        if idx == NIL {
            return Err(PqError::OutOfSlots);
        }
        self.hdr.free_head = self.elems[idx as usize].next;
        let h = self.chain_of(sig);
        self.elems[idx as usize] = SxElem {
            sig: sig.0,
            offset,
            next: self.chains[h],
        };
        self.chains[h] = idx;
        self.hdr.nelems += 1;
        Ok(())
    }

    /// Remove the entry for `sig`, returning its offset. `NotFound` if the
    /// signature is absent; callers deallocating a region treat that as
    /// corruption.
    pub fn find_and_delete(&mut self, sig: &Signature) -> Result<u64> {
        let h = self.chain_of(sig);
        let mut prev = NIL;
        let mut at = self.chains[h];
        while at != NIL {
            let e = self.elems[at as usize];
            if e.sig == sig.0 {
                if prev == NIL {
                    self.chains[h] = e.next;
                } else {
                    self.elems[prev as usize].next = e.next;
                }
                self.elems[at as usize] = SxElem {
                    sig: [0; 16],
                    offset: 0,
                    next: self.hdr.free_head,
                };
                self.hdr.free_head = at;
                self.hdr.nelems -= 1;
                return Ok(e.offset);
            }
            prev = at;
            at = e.next;
        }
        Err(PqError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(b: u8) -> Signature {
        Signature([b; 16])
    }

    fn index_bytes(nprods: u64) -> Vec<u8> {
        vec![0u8; byte_size(nprods, chains_for(nprods))]
    }

    #[test]
    fn test_add_find_delete() {
        let mut bytes = index_bytes(8);
        let mut sx = Sx::create(&mut bytes, 8);
        sx.add(&sig(1), 0x1000).unwrap();
        sx.add(&sig(2), 0x2000).unwrap();
        assert_eq!(sx.find(&sig(1)), Some(0x1000));
        assert_eq!(sx.find(&sig(2)), Some(0x2000));
        assert_eq!(sx.find(&sig(3)), None);

        assert_eq!(sx.find_and_delete(&sig(1)).unwrap(), 0x1000);
        assert_eq!(sx.find(&sig(1)), None);
        assert_eq!(sx.hdr.nelems, 1);
        assert!(matches!(
            sx.find_and_delete(&sig(1)),
            Err(PqError::NotFound)
        ));
    }

    #[test]
    fn test_chain_collisions() {
        let mut bytes = index_bytes(8);
        let mut sx = Sx::create(&mut bytes, 8);
        // Same 4-byte prefix, different tails: all share a chain.
        let mut a = Signature([9; 16]);
        let mut b = Signature([9; 16]);
        a.0[15] = 1;
        b.0[15] = 2;
        sx.add(&a, 0xA000).unwrap();
        sx.add(&b, 0xB000).unwrap();
        assert_eq!(sx.find(&a), Some(0xA000));
        assert_eq!(sx.find(&b), Some(0xB000));
        // Delete the mid-chain entry, then the head.
        assert_eq!(sx.find_and_delete(&a).unwrap(), 0xA000);
        assert_eq!(sx.find(&b), Some(0xB000));
        assert_eq!(sx.find_and_delete(&b).unwrap(), 0xB000);
        assert_eq!(sx.hdr.nelems, 0);
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut bytes = index_bytes(2);
        let mut sx = Sx::create(&mut bytes, 2);
        sx.add(&sig(1), 0x1000).unwrap();
        sx.add(&sig(2), 0x2000).unwrap();
        assert!(matches!(
            sx.add(&sig(3), 0x3000),
            Err(PqError::OutOfSlots)
        ));
        // Freeing a slot makes room again.
        sx.find_and_delete(&sig(1)).unwrap();
        sx.add(&sig(3), 0x3000).unwrap();
        assert_eq!(sx.find(&sig(3)), Some(0x3000));
    }

    #[test]
    fn test_create_then_attach() {
        let mut bytes = index_bytes(8);
        {
            let mut sx = Sx::create(&mut bytes, 8);
            sx.add(&sig(5), 0x5000).unwrap();
        }
        let sx = Sx::attach(&mut bytes).unwrap();
        assert_eq!(sx.find(&sig(5)), Some(0x5000));
        bytes[0] ^= 0xFF;
        assert!(matches!(Sx::attach(&mut bytes), Err(PqError::Corrupt(_))));
    }
}
