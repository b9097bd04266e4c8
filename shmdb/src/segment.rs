// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! The shared segment and its header.
//!
//! Offset 0 of the segment holds the fixed-layout header; it never moves
//! and is the only structure found at a well-known offset. Everything else
//! is reached through root offsets stored here. Offsets are byte
//! displacements from the segment base and offset 0 doubles as NULL, so
//! the segment may be mapped at a different address in every process.

use crate::error::{DbError, Result};
use crate::platform::SegmentMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub(crate) const SEGMENT_MAGIC: u32 = 0x314d_4853; // "SHM1"
pub(crate) const SEGMENT_VERSION: u32 = 3;
/// Transient magic while the creating process initializes the header.
const SEGMENT_BUILDING: u32 = 0xb01d_face;

/// Engine cell width. All offsets and encoded words are 64-bit regardless
/// of the platform pointer width.
pub(crate) const WORD: usize = 8;

/// First allocatable offset; the header owns everything below.
pub(crate) const DATA_START: u64 = 4096;

/// Buckets of the pooled-string hash.
pub(crate) const STR_BUCKETS: usize = 256;

/// Capacity of the named-index table.
pub(crate) const MAX_INDEXES: usize = 16;

/// Columns a single (multi-column) index may cover.
pub(crate) const MAX_INDEX_COLS: usize = 4;

/// Small-object size classes, in bytes. Covers parent-chain nodes,
/// value boxes, short spill strings and the common record arities.
pub(crate) const SIZE_CLASSES: [usize; 7] = [16, 24, 32, 48, 64, 96, 128];

/// One slot of the named-index table. A zero `id` means the slot is free.
#[repr(C)]
pub(crate) struct IndexSlot {
    pub id: AtomicU32,
    pub kind: AtomicU32,
    pub col_count: AtomicU32,
    pub columns: [AtomicU32; MAX_INDEX_COLS],
    _pad: u32,
    /// Offset of the template record, 0 for none.
    pub template: AtomicU64,
    /// Root of the tree / bucket array object.
    pub root: AtomicU64,
}

/// The segment header. Mutable cells are atomics: the segment is shared
/// between processes and Rust references into it must never alias plain
/// mutable data.
#[repr(C)]
pub(crate) struct SegmentHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub segment_size: AtomicU64,

    /// Bump pointer for fresh allocations.
    pub free_top: AtomicU64,
    /// Bytes currently sitting on freelists, for accounting.
    pub freelist_bytes: AtomicU64,

    /// Reader-writer lock state and its token counter.
    pub lock_state: AtomicU64,
    pub lock_token: AtomicU32,
    _pad0: u32,

    /// Record list roots (allocation order, doubly linked).
    pub record_first: AtomicU64,
    pub record_last: AtomicU64,

    /// Monotonic id source for indexes.
    pub next_index_id: AtomicU32,
    _pad1: u32,

    /// Heads of the per-size-class freelists.
    pub class_free: [AtomicU64; SIZE_CLASSES.len()],
    /// Head of the offset-sorted general freelist.
    pub general_free: AtomicU64,

    pub indexes: [IndexSlot; MAX_INDEXES],

    /// Pooled-string hash buckets.
    pub str_buckets: [AtomicU64; STR_BUCKETS],
}

static_assertions::const_assert!(std::mem::size_of::<SegmentHeader>() <= DATA_START as usize);
static_assertions::const_assert_eq!(std::mem::size_of::<IndexSlot>(), 48);

/// A mapped segment plus typed access to its interior.
pub(crate) struct Seg {
    map: SegmentMap,
}

impl Seg {
    /// Wrap a fresh mapping and initialize the header, racing politely
    /// with any other process attaching the same new segment.
    pub(crate) fn init_or_attach(map: SegmentMap) -> Result<Seg> {
        let seg = Seg { map };
        let hdr = seg.header();
        match hdr.magic.compare_exchange(
            0,
            SEGMENT_BUILDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                hdr.version.store(SEGMENT_VERSION, Ordering::Relaxed);
                hdr.segment_size.store(seg.map.len() as u64, Ordering::Relaxed);
                hdr.free_top.store(DATA_START, Ordering::Relaxed);
                hdr.next_index_id.store(1, Ordering::Relaxed);
                hdr.magic.store(SEGMENT_MAGIC, Ordering::Release);
                log::debug!(
                    "initialized segment {:?}, {} bytes",
                    seg.map.backing_name(),
                    seg.map.len()
                );
                Ok(seg)
            }
            Err(_) => {
                // Another attacher got there first; wait out its init.
                let mut spins = 0u32;
                while hdr.magic.load(Ordering::Acquire) == SEGMENT_BUILDING {
                    spins += 1;
                    if spins > 1_000_000 {
                        return Err(DbError::CorruptSegment);
                    }
                    std::hint::spin_loop();
                }
                seg.validate()
            }
        }
    }

    /// Wrap a mapping of a segment some process already initialized.
    pub(crate) fn attach_existing(map: SegmentMap) -> Result<Seg> {
        Seg { map }.validate()
    }

    fn validate(self) -> Result<Seg> {
        let hdr = self.header();
        if hdr.magic.load(Ordering::Acquire) != SEGMENT_MAGIC
            || hdr.version.load(Ordering::Relaxed) != SEGMENT_VERSION
            || hdr.segment_size.load(Ordering::Relaxed) != self.map.len() as u64
        {
            return Err(DbError::CorruptSegment);
        }
        Ok(self)
    }

    pub(crate) fn header(&self) -> &SegmentHeader {
        // SAFETY: the mapping is at least DATA_START bytes (validate and
        // the attach paths reject smaller ones) and the header type is all
        // atomics, sound to view from any number of threads.
        unsafe { &*self.map.base().cast::<SegmentHeader>() }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.map.base()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        self.map.as_slice()
    }

    pub(crate) fn backing_name(&self) -> Option<&std::ffi::CStr> {
        self.map.backing_name()
    }

    /// Bounds-check an offset that should point at `len` addressable bytes.
    #[inline]
    pub(crate) fn check_off(&self, off: u64, len: usize) -> bool {
        off >= DATA_START
            && (off as usize) < self.map.len()
            && self.map.len() - (off as usize) >= len
            && off % WORD as u64 == 0
    }

    /// View a word cell of the segment as an atomic.
    #[inline]
    pub(crate) fn word(&self, off: u64) -> &AtomicU64 {
        debug_assert!(self.check_off(off, WORD));
        // SAFETY: off is word-aligned and in bounds; AtomicU64 may overlay
        // any properly aligned 8 bytes of the mapping.
        unsafe { &*self.map.base().add(off as usize).cast::<AtomicU64>() }
    }

    #[inline]
    pub(crate) fn load(&self, off: u64) -> u64 {
        self.word(off).load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store(&self, off: u64, value: u64) {
        self.word(off).store(value, Ordering::Relaxed);
    }

    /// Raw byte view into the segment.
    pub(crate) fn bytes(&self, off: u64, len: usize) -> &[u8] {
        debug_assert!(off as usize + len <= self.map.len());
        // SAFETY: in bounds; callers only read byte payloads that are
        // immutable once published (string bodies, blob bodies).
        unsafe { std::slice::from_raw_parts(self.map.base().add(off as usize), len) }
    }

    /// Copy bytes into the segment at `off`.
    pub(crate) fn write_bytes(&self, off: u64, data: &[u8]) {
        debug_assert!(off as usize + data.len() <= self.map.len());
        // SAFETY: in bounds; only called on freshly allocated space that no
        // reader can see yet.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.base().add(off as usize),
                data.len(),
            );
        }
    }

    /// Zero a freshly allocated range.
    pub(crate) fn zero_bytes(&self, off: u64, len: usize) {
        debug_assert!(off as usize + len <= self.map.len());
        // SAFETY: in bounds, fresh allocation.
        unsafe {
            std::ptr::write_bytes(self.map.base().add(off as usize), 0, len);
        }
    }
}

/// Anonymous throwaway segment for unit tests.
#[cfg(test)]
pub(crate) fn test_seg(size: usize) -> Seg {
    Seg::init_or_attach(crate::platform::map_anonymous(size).unwrap()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_seg(size: usize) -> Seg {
        test_seg(size)
    }

    #[test]
    fn test_header_fits_reserved_area() {
        assert!(std::mem::size_of::<SegmentHeader>() <= DATA_START as usize);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_init_sets_roots() {
        let seg = local_seg(1 << 20);
        let hdr = seg.header();
        assert_eq!(SEGMENT_MAGIC, hdr.magic.load(Ordering::Relaxed));
        assert_eq!(DATA_START, hdr.free_top.load(Ordering::Relaxed));
        assert_eq!(0, hdr.record_first.load(Ordering::Relaxed));
        assert_eq!(seg.len() as u64, hdr.segment_size.load(Ordering::Relaxed));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_word_cells() {
        let seg = local_seg(1 << 20);
        seg.store(DATA_START, 0xfeed);
        assert_eq!(0xfeed, seg.load(DATA_START));
    }
}
