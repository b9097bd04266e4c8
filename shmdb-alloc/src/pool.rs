// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

use crate::{AllocError, Allocator, Global};
use core::alloc::Layout;
use core::cell::{Cell, RefCell};
use core::ptr::{slice_from_raw_parts_mut, NonNull};

/// The first sub-area is never smaller than this, no matter how little the
/// caller asks for up front.
const MIN_FIRST_SUBAREA: usize = 1024;

/// One sub-area of the pool. Deallocated only when the whole pool drops.
struct Subarea {
    ptr: NonNull<u8>,
    layout: Layout,
    used: usize,
    prev: Option<Box<Subarea>>,
}

/// [ScratchPool] is an arena allocator: individual deallocation does
/// nothing, the whole chain of sub-areas is released at once when the pool
/// is dropped. Destructors of objects placed in the pool are not run.
///
/// When the current sub-area is exhausted the pool requests a new one of
/// twice the previous size (or larger, if a single oversized request needs
/// it) from the backing allocator and links it onto the chain.
pub struct ScratchPool<A: Allocator = Global> {
    head: RefCell<Option<Box<Subarea>>>,
    /// Size of the next sub-area to request.
    next_size: Cell<usize>,
    allocator: A,
}

impl ScratchPool<Global> {
    /// Pool whose first sub-area holds at least `origbytes`.
    pub fn new(origbytes: usize) -> Self {
        Self::new_in(origbytes, Global)
    }
}

impl<A: Allocator> ScratchPool<A> {
    pub fn new_in(origbytes: usize, allocator: A) -> Self {
        Self {
            head: RefCell::new(None),
            next_size: Cell::new(origbytes.max(MIN_FIRST_SUBAREA)),
            allocator,
        }
    }

    /// Total bytes handed out so far, across all sub-areas.
    pub fn used_bytes(&self) -> usize {
        let head = self.head.borrow();
        let mut total = 0;
        let mut cur = head.as_deref();
        while let Some(area) = cur {
            total += area.used;
            cur = area.prev.as_deref();
        }
        total
    }

    /// Total bytes requested from the backing allocator.
    pub fn reserved_bytes(&self) -> usize {
        let head = self.head.borrow();
        let mut total = 0;
        let mut cur = head.as_deref();
        while let Some(area) = cur {
            total += area.layout.size();
            cur = area.prev.as_deref();
        }
        total
    }

    #[cold]
    fn grow(&self, min_size: usize) -> Result<(), AllocError> {
        let size = self.next_size.get().max(min_size);
        let layout = Layout::from_size_align(size, align_of::<usize>()).map_err(|_| AllocError)?;
        let allocation = self.allocator.allocate(layout)?;
        // The backing allocator may over-allocate; use what it gave us.
        let layout = Layout::from_size_align(allocation.len(), layout.align())
            .map_err(|_| AllocError)?;
        let area = Box::new(Subarea {
            ptr: allocation.cast(),
            layout,
            used: 0,
            prev: self.head.borrow_mut().take(),
        });
        *self.head.borrow_mut() = Some(area);
        self.next_size.set(size.saturating_mul(2));
        Ok(())
    }

    fn bump(&self, layout: Layout) -> Option<NonNull<[u8]>> {
        let mut head = self.head.borrow_mut();
        let area = head.as_deref_mut()?;
        let base = area.ptr.as_ptr();
        // SAFETY: used <= layout.size(), so this stays within the sub-area
        // or is its one-past-the-end address.
        let pad = unsafe { base.add(area.used) }.align_offset(layout.align());
        let needed = pad.checked_add(layout.size())?;
        if needed > area.layout.size() - area.used {
            return None;
        }
        // SAFETY: fits, per the check above.
        let thin = unsafe { base.add(area.used + pad) };
        area.used += needed;
        NonNull::new(slice_from_raw_parts_mut(thin, layout.size()))
    }

    /// Copy `bytes` into the pool, returning the pool-owned slice.
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<NonNull<[u8]>, AllocError> {
        if bytes.is_empty() {
            return Err(AllocError);
        }
        let layout = Layout::from_size_align(bytes.len(), 1).map_err(|_| AllocError)?;
        let dst = self.allocate(layout)?;
        // SAFETY: freshly allocated, correctly sized, non-overlapping.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr().cast(), bytes.len());
        }
        Ok(dst)
    }
}

unsafe impl<A: Allocator> Allocator for ScratchPool<A> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Err(AllocError);
        }
        if let Some(ptr) = self.bump(layout) {
            return Ok(ptr);
        }
        // `align - 1` slack covers any padding the bump may need.
        let min_size = layout
            .size()
            .checked_add(layout.align() - 1)
            .ok_or(AllocError)?;
        self.grow(min_size)?;
        self.bump(layout).ok_or(AllocError)
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Arena: freed all at once on drop.
    }
}

impl<A: Allocator> Drop for ScratchPool<A> {
    fn drop(&mut self) {
        let mut cur = self.head.borrow_mut().take();
        while let Some(mut area) = cur {
            cur = area.prev.take();
            // SAFETY: ptr/layout are exactly what the backing allocator
            // handed out for this sub-area.
            unsafe { self.allocator.deallocate(area.ptr, area.layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basics() {
        let pool = ScratchPool::new(64);
        let layout = Layout::new::<[u8; 8]>();
        let a = pool.allocate(layout).unwrap();
        let b = pool.allocate(layout).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(8, a.len());
        // deallocate is a no-op but must not panic.
        unsafe { pool.deallocate(a.cast(), layout) };
        assert!(pool.used_bytes() >= 16);
    }

    #[test]
    fn test_first_subarea_minimum() {
        let pool = ScratchPool::new(1);
        pool.allocate(Layout::new::<u8>()).unwrap();
        assert!(pool.reserved_bytes() >= MIN_FIRST_SUBAREA);
    }

    #[test]
    fn test_growth_doubles() {
        let pool = ScratchPool::new(1024);
        // Exhaust several sub-areas; every allocation must keep succeeding.
        for _ in 0..64 {
            pool.allocate(Layout::from_size_align(256, 8).unwrap()).unwrap();
        }
        assert!(pool.reserved_bytes() >= pool.used_bytes());
        assert!(pool.used_bytes() >= 64 * 256);
    }

    #[test]
    fn test_oversized_request() {
        let pool = ScratchPool::new(1024);
        pool.allocate(Layout::new::<u8>()).unwrap();
        // Larger than any sub-area so far; forces an oversized one.
        let big = Layout::from_size_align(1 << 20, 8).unwrap();
        let ptr = pool.allocate(big).unwrap();
        assert!(ptr.len() >= 1 << 20);
    }

    #[test]
    fn test_alignment() {
        let pool = ScratchPool::new(1024);
        pool.allocate(Layout::new::<u8>()).unwrap();
        let ptr = pool.allocate(Layout::new::<u64>()).unwrap();
        assert_eq!(0, (ptr.as_ptr() as *mut u8).align_offset(align_of::<u64>()));
    }

    #[test]
    fn test_alloc_bytes_copies() {
        let pool = ScratchPool::new(64);
        let src = b"hello scratch";
        let dst = pool.alloc_bytes(src).unwrap();
        let copied = unsafe { dst.as_ref() };
        assert_eq!(src.as_slice(), copied);
    }

    #[test]
    fn test_zero_size_fails() {
        let pool = ScratchPool::new(64);
        assert!(pool.allocate(Layout::from_size_align(0, 1).unwrap()).is_err());
    }
}
