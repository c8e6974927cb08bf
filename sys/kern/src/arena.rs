// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel memory arena backing task stacks and queue storage.
//!
//! All runtime-created objects draw their memory from a single fixed buffer
//! handed to the kernel at startup. Allocation is a bump pointer plus a small
//! list of retired extents that deleted objects hand back; a retired extent is
//! reused whole on the next allocation it can satisfy. There is no splitting
//! or coalescing beyond rolling the bump pointer back when the retired extent
//! happens to sit at the very end.
//!
//! This is deliberately simpler than a general-purpose heap. Object churn in
//! the systems this kernel targets is rare and stereotyped (a task is deleted
//! and a similar one created), so whole-extent reuse recovers nearly all of
//! the memory that a real allocator would, without the failure modes.

use core::marker::PhantomData;
use core::ptr::NonNull;

/// Allocation granule, in bytes. Every extent starts and ends on a multiple
/// of this, which also guarantees AAPCS64 stack alignment for extents used as
/// task stacks.
pub const GRAIN: usize = 16;

/// Retired extents we can remember before further retirements leak. Sized for
/// the worst realistic churn; going over is logged, not fatal.
const RETIRE_SLOTS: usize = 16;

/// A carved-out region of the arena, named by offset rather than address so
/// that it stays meaningful independent of where the arena sits in memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Extent {
    offset: usize,
    size: usize,
}

impl Extent {
    /// Size of this extent in bytes. Always a multiple of [`GRAIN`].
    pub fn size(&self) -> usize {
        self.size
    }
}

/// The arena proper.
///
/// Internally this holds the buffer as a raw base pointer rather than a
/// `&mut [u8]`, because task stacks live inside the arena and are written by
/// tasks while the kernel is off-CPU. Accessor methods materialize short
/// lived slices on demand; the kernel only runs while every task is stopped
/// (single core, interrupts masked in-kernel), so those slices never overlap
/// a concurrent access.
pub struct Arena<'s> {
    base: NonNull<u8>,
    size: usize,
    brk: usize,
    retired: [Option<Extent>; RETIRE_SLOTS],
    _marker: PhantomData<&'s mut [u8]>,
}

impl<'s> Arena<'s> {
    /// Takes over `mem` as arena storage. The base must be `GRAIN`-aligned;
    /// `KernelStorage` arranges this.
    pub fn new(mem: &'s mut [u8]) -> Self {
        uassert!((mem.as_ptr() as usize).is_multiple_of(GRAIN));
        let size = mem.len();
        // Safety: slice data pointers are never null.
        let base = unsafe { NonNull::new_unchecked(mem.as_mut_ptr()) };
        Self {
            base,
            size,
            brk: 0,
            retired: [None; RETIRE_SLOTS],
            _marker: PhantomData,
        }
    }

    /// Allocates at least `size` bytes, preferring the best-fitting retired
    /// extent over fresh memory. Returns `None` when neither source can
    /// satisfy the request; the arena is unchanged in that case.
    pub fn carve(&mut self, size: usize) -> Option<Extent> {
        uassert!(size != 0);
        let size = round_up(size)?;

        // Best fit among retired extents, to keep big ones available.
        let mut best: Option<(usize, usize)> = None;
        for (i, slot) in self.retired.iter().enumerate() {
            if let Some(e) = slot {
                if e.size >= size && best.is_none_or(|(_, bs)| e.size < bs) {
                    best = Some((i, e.size));
                }
            }
        }
        if let Some((i, _)) = best {
            return self.retired[i].take();
        }

        if size <= self.size - self.brk {
            let extent = Extent {
                offset: self.brk,
                size,
            };
            self.brk += size;
            Some(extent)
        } else {
            None
        }
    }

    /// Returns an extent to the arena.
    ///
    /// Extents ending at the bump pointer roll it back directly (possibly
    /// cascading through other retired extents); the rest go on the retired
    /// list. If the list is full the memory is abandoned until reboot, which
    /// we log but survive.
    pub fn retire(&mut self, extent: Extent) {
        uassert!(extent.offset + extent.size <= self.brk);

        if extent.offset + extent.size == self.brk {
            self.brk = extent.offset;
            // Retired neighbors may now be the tail; fold them in too.
            loop {
                let tail = self.retired.iter().position(|slot| {
                    slot.is_some_and(|e| e.offset + e.size == self.brk)
                });
                let Some(i) = tail else { break };
                if let Some(e) = self.retired[i].take() {
                    self.brk = e.offset;
                }
            }
            return;
        }

        if let Some(slot) = self.retired.iter_mut().find(|s| s.is_none()) {
            *slot = Some(extent);
        } else {
            klog!("arena: dropping {} retired bytes", extent.size);
        }
    }

    /// Address of the first byte of `extent`.
    pub fn addr_of(&self, extent: Extent) -> usize {
        self.base.as_ptr() as usize + extent.offset
    }

    /// Read access to the memory of `extent`.
    pub fn bytes(&self, extent: Extent) -> &[u8] {
        uassert!(extent.offset + extent.size <= self.size);
        // Safety: extent lies within the buffer we own; see the type-level
        // comment for why no other access can overlap this borrow.
        unsafe {
            core::slice::from_raw_parts(
                self.base.as_ptr().add(extent.offset),
                extent.size,
            )
        }
    }

    /// Write access to the memory of `extent`.
    pub fn bytes_mut(&mut self, extent: Extent) -> &mut [u8] {
        uassert!(extent.offset + extent.size <= self.size);
        // Safety: as for `bytes`, plus `&mut self` keeps kernel-side borrows
        // from overlapping.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.base.as_ptr().add(extent.offset),
                extent.size,
            )
        }
    }

    /// Bytes not yet carved. Retired extents don't count, so this is a lower
    /// bound on what `carve` can deliver.
    pub fn remaining(&self) -> usize {
        self.size - self.brk
    }
}

fn round_up(size: usize) -> Option<usize> {
    Some(size.checked_add(GRAIN - 1)? & !(GRAIN - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Aligned<const N: usize>([u8; N]);

    #[test]
    fn carving_rounds_to_the_grain() {
        let mut mem = Aligned([0u8; 64]);
        let mut arena = Arena::new(&mut mem.0);

        let a = arena.carve(10).unwrap();
        assert_eq!(a.size(), 16);
        let b = arena.carve(16).unwrap();
        assert_eq!(b.offset, 16);
        assert_eq!(arena.remaining(), 32);
    }

    #[test]
    fn exhaustion_leaves_the_arena_usable() {
        let mut mem = Aligned([0u8; 32]);
        let mut arena = Arena::new(&mut mem.0);

        assert!(arena.carve(64).is_none());
        assert!(arena.carve(32).is_some());
        assert!(arena.carve(1).is_none());
    }

    #[test]
    fn retired_extents_are_reused_best_fit() {
        let mut mem = Aligned([0u8; 128]);
        let mut arena = Arena::new(&mut mem.0);

        let small = arena.carve(16).unwrap();
        let big = arena.carve(48).unwrap();
        // Keep the tail allocated so retiring doesn't just roll back brk.
        let _tail = arena.carve(16).unwrap();

        arena.retire(big);
        arena.retire(small);

        // A 16-byte request must take the 16-byte extent, not the 48.
        let again = arena.carve(16).unwrap();
        assert_eq!(again, small);
        let larger = arena.carve(33).unwrap();
        assert_eq!(larger, big);
    }

    #[test]
    fn retiring_the_tail_rolls_the_brk_back() {
        let mut mem = Aligned([0u8; 64]);
        let mut arena = Arena::new(&mut mem.0);

        let a = arena.carve(16).unwrap();
        let b = arena.carve(16).unwrap();

        // `a` parks on the retired list; retiring `b` then unwinds through
        // both.
        arena.retire(a);
        arena.retire(b);
        assert_eq!(arena.remaining(), 64);
    }

    #[test]
    fn extent_memory_is_addressable() {
        let mut mem = Aligned([0u8; 32]);
        let base = mem.0.as_ptr() as usize;
        let mut arena = Arena::new(&mut mem.0);

        let e = arena.carve(16).unwrap();
        arena.bytes_mut(e).fill(0x5a);
        assert_eq!(arena.addr_of(e), base);
        assert!(arena.bytes(e).iter().all(|&b| b == 0x5a));
    }
}
