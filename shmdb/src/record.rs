// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Records: fixed-arity vectors of encoded words.
//!
//! A record sits in the segment as a four-word header followed by `arity`
//! field cells:
//!
//! ```text
//! word 0   arity (low 32 bits) | flag bits (JSON document root)
//! word 1   record-list prev
//! word 2   record-list next
//! word 3   parent-chain head
//! word 4+  field cells
//! ```
//!
//! The record list links every live record in allocation order. The
//! parent chain enumerates every field elsewhere that currently holds a
//! reference to this record: for every record R and field F holding a
//! reference to R', exactly one chain entry of R' names (R, F). Field
//! writes maintain both structures; deletion refuses while the parent
//! chain is non-empty.
//!
//! Mutating entry points assume the writer lock; traversal is safe under
//! a read lock because nodes are never deallocated while readers hold it.

use crate::error::{DbError, Result};
use crate::segment::{Seg, DATA_START, WORD};
use crate::value::Kind;
use crate::{alloc, encode, index};
use crate::encode::Word;
use std::sync::atomic::Ordering;

pub(crate) const RECORD_HDR: u64 = 4 * WORD as u64;
const META_ARITY_MASK: u64 = 0xffff_ffff;
const FLAG_JSON_DOCUMENT: u64 = 1 << 32;
const FLAG_JSON_OBJECT: u64 = 1 << 33;
const FLAG_JSON_PAIR: u64 = 1 << 34;

const PARENT_NODE_SIZE: usize = 3 * WORD;

/// Handle to a record: its offset inside the segment. Copyable and stable
/// for the record's lifetime; never dereferenced outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Record(u64);

impl Record {
    pub(crate) fn from_offset(off: u64) -> Record {
        debug_assert!(off >= DATA_START && off % WORD as u64 == 0);
        Record(off)
    }

    /// The record's offset inside the segment: its stable identity.
    pub fn offset(self) -> u64 {
        self.0
    }

    #[inline]
    fn field_cell(self, field: usize) -> u64 {
        self.0 + RECORD_HDR + (field * WORD) as u64
    }
}

/// One entry of a record's parent chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentRef {
    /// The record holding the reference.
    pub record: Record,
    /// The field within that record.
    pub field: usize,
    node: u64,
}

pub(crate) fn record_size(arity: usize) -> usize {
    RECORD_HDR as usize + arity * WORD
}

pub(crate) fn arity(seg: &Seg, rec: Record) -> usize {
    (seg.load(rec.0) & META_ARITY_MASK) as usize
}

pub(crate) fn is_json_document(seg: &Seg, rec: Record) -> bool {
    seg.load(rec.0) & FLAG_JSON_DOCUMENT != 0
}

pub(crate) fn set_json_document(seg: &Seg, rec: Record) {
    seg.store(rec.0, seg.load(rec.0) | FLAG_JSON_DOCUMENT);
}

pub(crate) fn is_json_object(seg: &Seg, rec: Record) -> bool {
    seg.load(rec.0) & FLAG_JSON_OBJECT != 0
}

pub(crate) fn set_json_object(seg: &Seg, rec: Record) {
    seg.store(rec.0, seg.load(rec.0) | FLAG_JSON_OBJECT);
}

pub(crate) fn is_json_pair(seg: &Seg, rec: Record) -> bool {
    seg.load(rec.0) & FLAG_JSON_PAIR != 0
}

pub(crate) fn set_json_pair(seg: &Seg, rec: Record) {
    seg.store(rec.0, seg.load(rec.0) | FLAG_JSON_PAIR);
}

fn check_field(seg: &Seg, rec: Record, field: usize) -> Result<()> {
    let arity = arity(seg, rec);
    if field >= arity {
        return Err(DbError::OutOfRange { field, arity });
    }
    Ok(())
}

/// Create a record and register it with every index whose template admits
/// an all-null record.
pub(crate) fn create(seg: &Seg, arity: usize) -> Result<Record> {
    let rec = create_raw(seg, arity)?;
    index::on_record_created(seg, rec)?;
    Ok(rec)
}

/// Create a record without index maintenance. The caller promises no
/// index covers it yet (bulk loads before index creation).
pub(crate) fn create_raw(seg: &Seg, arity: usize) -> Result<Record> {
    if arity as u64 > META_ARITY_MASK {
        return Err(DbError::Encode("record arity out of range"));
    }
    let hdr = seg.header();
    let off = alloc::alloc(seg, record_size(arity))?;
    seg.store(off, arity as u64);
    let last = hdr.record_last.load(Ordering::Relaxed);
    seg.store(off + WORD as u64, last);
    if last != 0 {
        seg.store(last + 2 * WORD as u64, off);
    } else {
        hdr.record_first.store(off, Ordering::Relaxed);
    }
    hdr.record_last.store(off, Ordering::Relaxed);
    Ok(Record(off))
}

/// Delete a record. Fails with [DbError::HasReferences] while any other
/// record still points at it; on success the space is returned to the
/// allocator.
pub(crate) fn delete(seg: &Seg, rec: Record) -> Result<()> {
    if seg.load(rec.0 + 3 * WORD as u64) != 0 {
        return Err(DbError::HasReferences);
    }
    // An index template is referenced by the registry, not by a field.
    if index::is_template(seg, rec) {
        return Err(DbError::HasReferences);
    }
    index::on_record_deleted(seg, rec);

    let n = arity(seg, rec);
    for field in 0..n {
        let w = Word(seg.load(rec.field_cell(field)));
        if let Some(target) = encode::record_of(w) {
            parent_remove(seg, target, rec, field);
        }
        encode::release(seg, w);
    }

    let hdr = seg.header();
    let prev = seg.load(rec.0 + WORD as u64);
    let next = seg.load(rec.0 + 2 * WORD as u64);
    if prev != 0 {
        seg.store(prev + 2 * WORD as u64, next);
    } else {
        hdr.record_first.store(next, Ordering::Relaxed);
    }
    if next != 0 {
        seg.store(next + WORD as u64, prev);
    } else {
        hdr.record_last.store(prev, Ordering::Relaxed);
    }

    alloc::free(seg, rec.0, record_size(n));
    Ok(())
}

pub(crate) fn first(seg: &Seg) -> Option<Record> {
    let off = seg.header().record_first.load(Ordering::Relaxed);
    (off != 0).then(|| Record(off))
}

pub(crate) fn next(seg: &Seg, rec: Record) -> Option<Record> {
    let off = seg.load(rec.0 + 2 * WORD as u64);
    (off != 0).then(|| Record(off))
}

pub(crate) fn get_field(seg: &Seg, rec: Record, field: usize) -> Result<Word> {
    check_field(seg, rec, field)?;
    Ok(Word(seg.load(rec.field_cell(field))))
}

/// Store an encoded word into a field, in order: take the parent-chain
/// entry for a record-typed new value, update covering indexes with
/// (old, new), drop the old value's parent entry and reference, write the
/// cell. Atomic for readers only by virtue of the writer lock.
///
/// Ownership of the caller's reference on `new` transfers to the field.
pub(crate) fn set_field(seg: &Seg, rec: Record, field: usize, new: Word) -> Result<()> {
    check_field(seg, rec, field)?;
    let old = Word(seg.load(rec.field_cell(field)));
    if old == new {
        // The field already owns an identical reference; drop the
        // caller's so the count stays balanced.
        encode::release(seg, new);
        return Ok(());
    }

    if let Some(target) = encode::record_of(new) {
        parent_add(seg, target, rec, field)?;
    }
    if let Err(e) = index::on_field_update(seg, rec, field, old, new) {
        if let Some(target) = encode::record_of(new) {
            parent_remove(seg, target, rec, field);
        }
        return Err(e);
    }
    if let Some(target) = encode::record_of(old) {
        parent_remove(seg, target, rec, field);
    }
    encode::release(seg, old);
    seg.store(rec.field_cell(field), new.0);
    Ok(())
}

/// [set_field] for a cell known to still be Null: skips the old-value
/// bookkeeping.
pub(crate) fn set_new_field(seg: &Seg, rec: Record, field: usize, new: Word) -> Result<()> {
    check_field(seg, rec, field)?;
    debug_assert_eq!(0, seg.load(rec.field_cell(field)));
    if let Some(target) = encode::record_of(new) {
        parent_add(seg, target, rec, field)?;
    }
    if let Err(e) = index::on_field_update(seg, rec, field, Word::NULL, new) {
        if let Some(target) = encode::record_of(new) {
            parent_remove(seg, target, rec, field);
        }
        return Err(e);
    }
    seg.store(rec.field_cell(field), new.0);
    Ok(())
}

/// Unconditional atomic store of the raw cell. No index, parent-chain or
/// reference maintenance: for counters and flags only.
pub(crate) fn set_atomic_field(seg: &Seg, rec: Record, field: usize, new: Word) -> Result<()> {
    check_field(seg, rec, field)?;
    seg.word(rec.field_cell(field)).store(new.0, Ordering::SeqCst);
    Ok(())
}

/// Hardware compare-and-set on the raw cell. Returns the observed word,
/// which equals `expected` exactly when the swap happened.
pub(crate) fn update_atomic_field(
    seg: &Seg,
    rec: Record,
    field: usize,
    new: Word,
    expected: Word,
) -> Result<Word> {
    check_field(seg, rec, field)?;
    match seg.word(rec.field_cell(field)).compare_exchange(
        expected.0,
        new.0,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(seen) | Err(seen) => Ok(Word(seen)),
    }
}

/// Atomically add `delta` to an inline-integer field, without any outer
/// locking. Fails on a field whose current value is not an inline int.
pub(crate) fn add_int_atomic_field(seg: &Seg, rec: Record, field: usize, delta: i64) -> Result<i64> {
    check_field(seg, rec, field)?;
    let cell = seg.word(rec.field_cell(field));
    loop {
        let seen = Word(cell.load(Ordering::SeqCst));
        let current = match encode::inline_int(seen) {
            Some(v) => v,
            None => return Err(DbError::TypeMismatch { expected: "inline integer field" }),
        };
        let updated = current
            .checked_add(delta)
            .ok_or(DbError::TypeMismatch { expected: "non-overflowing counter" })?;
        let new = encode::inline_int_word(updated)
            .ok_or(DbError::TypeMismatch { expected: "counter in inline range" })?;
        if cell
            .compare_exchange_weak(seen.0, new.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Ok(updated);
        }
    }
}

pub(crate) fn first_parent(seg: &Seg, rec: Record) -> Option<ParentRef> {
    parent_at(seg, seg.load(rec.0 + 3 * WORD as u64))
}

pub(crate) fn next_parent(seg: &Seg, prev: &ParentRef) -> Option<ParentRef> {
    parent_at(seg, seg.load(prev.node + 2 * WORD as u64))
}

fn parent_at(seg: &Seg, node: u64) -> Option<ParentRef> {
    (node != 0).then(|| ParentRef {
        record: Record(seg.load(node)),
        field: seg.load(node + WORD as u64) as usize,
        node,
    })
}

fn parent_add(seg: &Seg, target: Record, parent: Record, field: usize) -> Result<()> {
    let node = alloc::alloc(seg, PARENT_NODE_SIZE)?;
    seg.store(node, parent.0);
    seg.store(node + WORD as u64, field as u64);
    seg.store(node + 2 * WORD as u64, seg.load(target.0 + 3 * WORD as u64));
    seg.store(target.0 + 3 * WORD as u64, node);
    Ok(())
}

fn parent_remove(seg: &Seg, target: Record, parent: Record, field: usize) {
    let head_cell = target.0 + 3 * WORD as u64;
    let mut prev: Option<u64> = None;
    let mut node = seg.load(head_cell);
    while node != 0 {
        let next = seg.load(node + 2 * WORD as u64);
        if seg.load(node) == parent.0 && seg.load(node + WORD as u64) == field as u64 {
            match prev {
                Some(p) => seg.store(p + 2 * WORD as u64, next),
                None => seg.store(head_cell, next),
            }
            alloc::free(seg, node, PARENT_NODE_SIZE);
            return;
        }
        prev = Some(node);
        node = next;
    }
    debug_assert!(false, "parent chain missing entry for ({parent:?}, {field})");
}

/// Kind of the word currently held by a field.
pub(crate) fn field_kind(seg: &Seg, rec: Record, field: usize) -> Result<Kind> {
    encode::kind_of(seg, get_field(seg, rec, field)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::test_seg;
    use crate::value::Value;

    fn enc(seg: &Seg, v: Value) -> Word {
        encode::encode(seg, &v).unwrap()
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_create_set_get() {
        let seg = test_seg(1 << 20);
        let rec = create(&seg, 3).unwrap();
        assert_eq!(3, arity(&seg, rec));
        set_field(&seg, rec, 0, enc(&seg, Value::Int(44))).unwrap();
        set_field(&seg, rec, 1, enc(&seg, Value::Int(-199_999))).unwrap();
        set_field(&seg, rec, 2, enc(&seg, Value::Int(0))).unwrap();
        let w = get_field(&seg, rec, 1).unwrap();
        assert_eq!(Value::Int(-199_999), encode::decode(&seg, w).unwrap());
        // Overwrite back to zero.
        set_field(&seg, rec, 1, enc(&seg, Value::Int(0))).unwrap();
        assert_eq!(
            Value::Int(0),
            encode::decode(&seg, get_field(&seg, rec, 1).unwrap()).unwrap()
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_out_of_range_field() {
        let seg = test_seg(1 << 20);
        let rec = create(&seg, 2).unwrap();
        assert!(matches!(
            set_field(&seg, rec, 2, Word::NULL),
            Err(DbError::OutOfRange { field: 2, arity: 2 })
        ));
        assert!(get_field(&seg, rec, 5).is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_record_list_order_with_deletes() {
        let seg = test_seg(1 << 20);
        let recs: Vec<Record> = (0..5).map(|_| create(&seg, 1).unwrap()).collect();
        delete(&seg, recs[1]).unwrap();
        delete(&seg, recs[4]).unwrap();
        let mut seen = Vec::new();
        let mut cur = first(&seg);
        while let Some(r) = cur {
            seen.push(r);
            cur = next(&seg, r);
        }
        assert_eq!(vec![recs[0], recs[2], recs[3]], seen);
        // New records append at the tail.
        let tail = create(&seg, 1).unwrap();
        assert_eq!(Some(tail), next(&seg, recs[3]));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_parent_chain_and_delete_safety() {
        let seg = test_seg(1 << 20);
        let a = create(&seg, 2).unwrap();
        let b = create(&seg, 3).unwrap();
        let c = create(&seg, 4).unwrap();
        set_field(&seg, b, 2, enc(&seg, Value::Record(a))).unwrap();
        set_field(&seg, b, 1, enc(&seg, Value::Record(c))).unwrap();
        set_field(&seg, a, 0, enc(&seg, Value::Record(c))).unwrap();

        let mut parents = Vec::new();
        let mut cur = first_parent(&seg, c);
        while let Some(p) = cur {
            parents.push((p.record, p.field));
            cur = next_parent(&seg, &p);
        }
        parents.sort_by_key(|(r, _)| r.offset());
        let mut expected = vec![(b, 1), (a, 0)];
        expected.sort_by_key(|(r, _)| r.offset());
        assert_eq!(expected, parents);

        assert!(matches!(delete(&seg, c), Err(DbError::HasReferences)));
        set_field(&seg, a, 0, Word::NULL).unwrap();
        set_field(&seg, b, 1, Word::NULL).unwrap();
        delete(&seg, c).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_overwriting_reference_updates_chain() {
        let seg = test_seg(1 << 20);
        let target = create(&seg, 1).unwrap();
        let holder = create(&seg, 1).unwrap();
        set_field(&seg, holder, 0, enc(&seg, Value::Record(target))).unwrap();
        assert!(first_parent(&seg, target).is_some());
        set_field(&seg, holder, 0, enc(&seg, Value::Int(9))).unwrap();
        assert!(first_parent(&seg, target).is_none());
        delete(&seg, target).unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_delete_releases_interned_fields() {
        let seg = test_seg(1 << 20);
        let v = Value::Str { s: "spilled field value".into(), lang: None };
        let rec = create(&seg, 1).unwrap();
        set_field(&seg, rec, 0, enc(&seg, v.clone())).unwrap();
        let w = enc(&seg, v); // second reference
        encode::release(&seg, w);
        delete(&seg, rec).unwrap();
        // Object is gone: a fresh encode re-creates it at refcount 1.
        let w2 = enc(&seg, Value::Str { s: "spilled field value".into(), lang: None });
        let off = encode::spill_offset(w2).unwrap();
        assert_eq!(1, seg.load(off + WORD as u64));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_atomic_counter_across_threads() {
        use std::sync::Arc;
        let seg = Arc::new(test_seg(1 << 20));
        let rec = create(&seg, 1).unwrap();
        set_field(&seg, rec, 0, enc(&seg, Value::Int(0))).unwrap();
        const THREADS: usize = 4;
        const ROUNDS: i64 = 5000;
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let seg = Arc::clone(&seg);
            handles.push(std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    add_int_atomic_field(&seg, rec, 0, 1).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            Value::Int(THREADS as i64 * ROUNDS),
            encode::decode(&seg, get_field(&seg, rec, 0).unwrap()).unwrap()
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_update_atomic_field_reports_observed() {
        let seg = test_seg(1 << 20);
        let rec = create(&seg, 1).unwrap();
        let five = enc(&seg, Value::Int(5));
        let six = enc(&seg, Value::Int(6));
        set_field(&seg, rec, 0, five).unwrap();
        // Mismatched expectation: no swap, observed value returned.
        let seen = update_atomic_field(&seg, rec, 0, six, six).unwrap();
        assert_eq!(five, seen);
        let seen = update_atomic_field(&seg, rec, 0, six, five).unwrap();
        assert_eq!(five, seen);
        assert_eq!(six, get_field(&seg, rec, 0).unwrap());
    }
}
