// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Segment-allocated spill objects and the pooled-string hash.
//!
//! Values too large for the inline payload of an encoded word live in the
//! segment as *spill objects*. Every spill object starts with the same two
//! words:
//!
//! ```text
//! word 0   kind (low byte) | payload length << 32
//! word 1   reference count
//! ```
//!
//! String-like kinds (Str, Uri, XmlLiteral, AnonConst, Blob) continue with
//! a companion offset (language tag, namespace prefix, XSD type or media
//! type — itself an interned string) and an intern-chain link, then the
//! payload bytes. Number boxes (Int, Double) are just header plus one
//! payload word.
//!
//! Str, Uri, XmlLiteral and AnonConst are interned: equal bytes with an
//! equal companion always resolve to the same offset, maintained by the
//! hash-chained bucket table in the segment header. Blobs are data, not
//! symbols, and are never interned.
//!
//! Insertion and release require the writer lock; lookup by offset is safe
//! under the reader lock.

use crate::alloc;
use crate::error::Result;
use crate::segment::{Seg, STR_BUCKETS, WORD};
use crate::value::Kind;
use std::hash::Hasher;
use std::sync::atomic::Ordering;

/// Words of the string-like spill header.
const STR_HDR_WORDS: u64 = 4;
pub(crate) const STR_HDR: u64 = STR_HDR_WORDS * WORD as u64;
/// Size of an Int/Double box.
const BOX_SIZE: usize = 3 * WORD;

#[inline]
fn hdr_word(kind: Kind, len: usize) -> u64 {
    kind as u64 | (len as u64) << 32
}

#[inline]
pub(crate) fn obj_kind(seg: &Seg, off: u64) -> Option<Kind> {
    Kind::from_u8((seg.load(off) & 0xff) as u8)
}

#[inline]
pub(crate) fn obj_len(seg: &Seg, off: u64) -> usize {
    (seg.load(off) >> 32) as usize
}

#[inline]
pub(crate) fn obj_companion(seg: &Seg, off: u64) -> u64 {
    seg.load(off + 2 * WORD as u64)
}

/// Payload bytes of a string-like object.
pub(crate) fn obj_bytes(seg: &Seg, off: u64) -> &[u8] {
    seg.bytes(off + STR_HDR, obj_len(seg, off))
}

/// Payload word of an Int/Double box.
pub(crate) fn box_payload(seg: &Seg, off: u64) -> u64 {
    seg.load(off + 2 * WORD as u64)
}

fn str_obj_size(len: usize) -> usize {
    STR_HDR as usize + len.next_multiple_of(WORD)
}

fn is_interned_kind(kind: Kind) -> bool {
    matches!(kind, Kind::Str | Kind::Uri | Kind::XmlLiteral | Kind::AnonConst)
}

fn bucket_of(kind: Kind, bytes: &[u8], companion: u64) -> usize {
    let mut h = fnv::FnvHasher::default();
    h.write_u8(kind as u8);
    h.write_u64(companion);
    h.write(bytes);
    (h.finish() % STR_BUCKETS as u64) as usize
}

/// Allocate a number box holding one payload word.
pub(crate) fn alloc_box(seg: &Seg, kind: Kind, payload: u64) -> Result<u64> {
    debug_assert!(matches!(kind, Kind::Int | Kind::Double));
    let off = alloc::alloc(seg, BOX_SIZE)?;
    seg.store(off, hdr_word(kind, 0));
    seg.store(off + WORD as u64, 1); // caller's reference
    seg.store(off + 2 * WORD as u64, payload);
    Ok(off)
}

/// Allocate an uninterned string-like object (blobs).
pub(crate) fn alloc_str_obj(seg: &Seg, kind: Kind, bytes: &[u8], companion: u64) -> Result<u64> {
    let off = alloc::alloc(seg, str_obj_size(bytes.len()))?;
    seg.store(off, hdr_word(kind, bytes.len()));
    seg.store(off + WORD as u64, 1);
    seg.store(off + 2 * WORD as u64, companion);
    seg.store(off + 3 * WORD as u64, 0);
    seg.write_bytes(off + STR_HDR, bytes);
    Ok(off)
}

/// Resolve `(kind, bytes, companion)` in the pooled-string hash, inserting
/// on first use. Returns the object with its reference count already
/// incremented for the caller. The caller's reference on `companion` is
/// consumed either way: a fresh object takes it over, an existing one
/// already holds its own.
pub(crate) fn intern(seg: &Seg, kind: Kind, bytes: &[u8], companion: u64) -> Result<u64> {
    debug_assert!(is_interned_kind(kind));
    let bucket = &seg.header().str_buckets[bucket_of(kind, bytes, companion)];
    let mut cur = bucket.load(Ordering::Relaxed);
    while cur != 0 {
        if obj_kind(seg, cur) == Some(kind)
            && obj_len(seg, cur) == bytes.len()
            && obj_companion(seg, cur) == companion
            && obj_bytes(seg, cur) == bytes
        {
            seg.word(cur + WORD as u64).fetch_add(1, Ordering::Relaxed);
            if companion != 0 {
                release_obj(seg, companion);
            }
            return Ok(cur);
        }
        cur = seg.load(cur + 3 * WORD as u64);
    }
    let off = alloc_str_obj(seg, kind, bytes, companion)?;
    seg.store(off + 3 * WORD as u64, bucket.load(Ordering::Relaxed));
    bucket.store(off, Ordering::Relaxed);
    Ok(off)
}

/// Add a reference to any spill object.
pub(crate) fn retain_obj(seg: &Seg, off: u64) {
    seg.word(off + WORD as u64).fetch_add(1, Ordering::Relaxed);
}

/// Drop a reference; frees the object (and releases its companion) when
/// the count reaches zero.
pub(crate) fn release_obj(seg: &Seg, off: u64) {
    let prior = seg.word(off + WORD as u64).fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prior >= 1);
    if prior != 1 {
        return;
    }
    let Some(kind) = obj_kind(seg, off) else {
        return;
    };
    match kind {
        Kind::Int | Kind::Double => alloc::free(seg, off, BOX_SIZE),
        _ => {
            if is_interned_kind(kind) {
                unlink_from_pool(seg, off, kind);
            }
            let companion = obj_companion(seg, off);
            if companion != 0 {
                release_obj(seg, companion);
            }
            alloc::free(seg, off, str_obj_size(obj_len(seg, off)));
        }
    }
}

fn unlink_from_pool(seg: &Seg, off: u64, kind: Kind) {
    let bucket =
        &seg.header().str_buckets[bucket_of(kind, obj_bytes(seg, off), obj_companion(seg, off))];
    let mut cur = bucket.load(Ordering::Relaxed);
    if cur == off {
        bucket.store(seg.load(off + 3 * WORD as u64), Ordering::Relaxed);
        return;
    }
    while cur != 0 {
        let next = seg.load(cur + 3 * WORD as u64);
        if next == off {
            seg.store(cur + 3 * WORD as u64, seg.load(off + 3 * WORD as u64));
            return;
        }
        cur = next;
    }
    debug_assert!(false, "interned object missing from its bucket");
}
