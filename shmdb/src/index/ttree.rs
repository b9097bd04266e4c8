// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Ordered index: a T-tree over record offsets.
//!
//! Each node is an AVL-balanced binary tree node carrying a small sorted
//! array of entries, which keeps the tree shallow and the per-record
//! overhead low. Node layout (96 bytes, one size class):
//!
//! ```text
//! word 0   parent offset
//! word 1   left child offset
//! word 2   right child offset
//! word 3   entry count (low 32) | subtree height (high 32)
//! word 4+  entries: record offsets, sorted by indexed key
//! ```
//!
//! Keys are not stored in the node; they are re-read from the indexed
//! column of each entry record. Duplicate keys are allowed and may span
//! adjacent nodes.
//!
//! Mutations require the writer lock. Cursors are valid only under the
//! read lock they were created in.

use crate::error::Result;
use crate::record::Record;
use crate::segment::{Seg, WORD};
use crate::value::Value;
use crate::{alloc, encode, record};
use std::cmp::Ordering as Ord_;
use std::sync::atomic::{AtomicU64, Ordering};

/// Entries per node.
const CAP: usize = 8;
const NODE_SIZE: usize = (4 + CAP) * WORD;

#[inline]
fn parent(seg: &Seg, n: u64) -> u64 {
    seg.load(n)
}

#[inline]
fn left(seg: &Seg, n: u64) -> u64 {
    seg.load(n + WORD as u64)
}

#[inline]
fn right(seg: &Seg, n: u64) -> u64 {
    seg.load(n + 2 * WORD as u64)
}

#[inline]
fn count(seg: &Seg, n: u64) -> usize {
    (seg.load(n + 3 * WORD as u64) & 0xffff_ffff) as usize
}

fn height(seg: &Seg, n: u64) -> i64 {
    if n == 0 {
        0
    } else {
        (seg.load(n + 3 * WORD as u64) >> 32) as i64
    }
}

fn set_parent(seg: &Seg, n: u64, v: u64) {
    seg.store(n, v);
}

fn set_left(seg: &Seg, n: u64, v: u64) {
    seg.store(n + WORD as u64, v);
}

fn set_right(seg: &Seg, n: u64, v: u64) {
    seg.store(n + 2 * WORD as u64, v);
}

fn set_count(seg: &Seg, n: u64, c: usize) {
    let meta = seg.load(n + 3 * WORD as u64);
    seg.store(n + 3 * WORD as u64, (meta & !0xffff_ffff) | c as u64);
}

fn set_height(seg: &Seg, n: u64, h: i64) {
    let meta = seg.load(n + 3 * WORD as u64);
    seg.store(n + 3 * WORD as u64, (meta & 0xffff_ffff) | (h as u64) << 32);
}

#[inline]
fn slot_cell(n: u64, i: usize) -> u64 {
    n + (4 + i) as u64 * WORD as u64
}

fn entry(seg: &Seg, n: u64, i: usize) -> Record {
    Record::from_offset(seg.load(slot_cell(n, i)))
}

/// Key of an entry: the decoded value of its indexed column.
fn key_of(seg: &Seg, rec: Record, column: usize) -> Value {
    record::get_field(seg, rec, column)
        .ok()
        .and_then(|w| encode::decode(seg, w).ok())
        .unwrap_or(Value::Null)
}

fn node_min(seg: &Seg, n: u64, column: usize) -> Value {
    key_of(seg, entry(seg, n, 0), column)
}

fn node_max(seg: &Seg, n: u64, column: usize) -> Value {
    key_of(seg, entry(seg, n, count(seg, n) - 1), column)
}

fn new_node(seg: &Seg, parent_off: u64, rec: Record) -> Result<u64> {
    let n = alloc::alloc(seg, NODE_SIZE)?;
    set_parent(seg, n, parent_off);
    set_count(seg, n, 1);
    set_height(seg, n, 1);
    seg.store(slot_cell(n, 0), rec.offset());
    Ok(n)
}

/// Insert an entry into a node known to have room, keeping slots sorted.
fn node_insert(seg: &Seg, n: u64, key: &Value, rec: Record, column: usize) {
    let c = count(seg, n);
    debug_assert!(c < CAP);
    let mut pos = c;
    for i in 0..c {
        if key_of(seg, entry(seg, n, i), column).db_cmp(key) == Ord_::Greater {
            pos = i;
            break;
        }
    }
    for i in (pos..c).rev() {
        seg.store(slot_cell(n, i + 1), seg.load(slot_cell(n, i)));
    }
    seg.store(slot_cell(n, pos), rec.offset());
    set_count(seg, n, c + 1);
}

fn node_remove_at(seg: &Seg, n: u64, i: usize) {
    let c = count(seg, n);
    for j in i..c - 1 {
        seg.store(slot_cell(n, j), seg.load(slot_cell(n, j + 1)));
    }
    set_count(seg, n, c - 1);
}

fn update_height(seg: &Seg, n: u64) {
    let h = 1 + height(seg, left(seg, n)).max(height(seg, right(seg, n)));
    set_height(seg, n, h);
}

fn replace_child(seg: &Seg, root: &AtomicU64, old_child: u64, new_child: u64) {
    let p = parent(seg, old_child);
    if new_child != 0 {
        set_parent(seg, new_child, p);
    }
    if p == 0 {
        root.store(new_child, Ordering::Relaxed);
    } else if left(seg, p) == old_child {
        set_left(seg, p, new_child);
    } else {
        set_right(seg, p, new_child);
    }
}

fn rotate_left(seg: &Seg, root: &AtomicU64, x: u64) {
    let y = right(seg, x);
    replace_child(seg, root, x, y);
    let t = left(seg, y);
    set_right(seg, x, t);
    if t != 0 {
        set_parent(seg, t, x);
    }
    set_left(seg, y, x);
    set_parent(seg, x, y);
    update_height(seg, x);
    update_height(seg, y);
}

fn rotate_right(seg: &Seg, root: &AtomicU64, x: u64) {
    let y = left(seg, x);
    replace_child(seg, root, x, y);
    let t = right(seg, y);
    set_left(seg, x, t);
    if t != 0 {
        set_parent(seg, t, x);
    }
    set_right(seg, y, x);
    set_parent(seg, x, y);
    update_height(seg, x);
    update_height(seg, y);
}

/// Restore AVL balance walking up from `n`.
fn rebalance(seg: &Seg, root: &AtomicU64, mut n: u64) {
    while n != 0 {
        update_height(seg, n);
        let bf = height(seg, left(seg, n)) - height(seg, right(seg, n));
        let top = if bf > 1 {
            let l = left(seg, n);
            if height(seg, left(seg, l)) < height(seg, right(seg, l)) {
                rotate_left(seg, root, l);
            }
            rotate_right(seg, root, n);
            parent(seg, n)
        } else if bf < -1 {
            let r = right(seg, n);
            if height(seg, right(seg, r)) < height(seg, left(seg, r)) {
                rotate_right(seg, root, r);
            }
            rotate_left(seg, root, n);
            parent(seg, n)
        } else {
            n
        };
        n = parent(seg, top);
    }
}

/// Insert `(key, rec)`.
pub(crate) fn insert(
    seg: &Seg,
    root: &AtomicU64,
    key: &Value,
    rec: Record,
    column: usize,
) -> Result<()> {
    let r = root.load(Ordering::Relaxed);
    if r == 0 {
        root.store(new_node(seg, 0, rec)?, Ordering::Relaxed);
        return Ok(());
    }
    let mut n = r;
    loop {
        let c = count(seg, n);
        debug_assert!(c > 0);
        if key.db_cmp(&node_min(seg, n, column)) == Ord_::Less {
            let l = left(seg, n);
            if l != 0 {
                n = l;
                continue;
            }
            if c < CAP {
                node_insert(seg, n, key, rec, column);
            } else {
                let fresh = new_node(seg, n, rec)?;
                set_left(seg, n, fresh);
                rebalance(seg, root, n);
            }
            return Ok(());
        }
        if key.db_cmp(&node_max(seg, n, column)) == Ord_::Greater {
            let rt = right(seg, n);
            if rt != 0 {
                n = rt;
                continue;
            }
            if c < CAP {
                node_insert(seg, n, key, rec, column);
            } else {
                let fresh = new_node(seg, n, rec)?;
                set_right(seg, n, fresh);
                rebalance(seg, root, n);
            }
            return Ok(());
        }
        // Bounding node.
        if c < CAP {
            node_insert(seg, n, key, rec, column);
            return Ok(());
        }
        // Full: evict the minimum into the left subtree to make room.
        let evicted = entry(seg, n, 0);
        let evicted_key = key_of(seg, evicted, column);
        node_remove_at(seg, n, 0);
        node_insert(seg, n, key, rec, column);
        let l = left(seg, n);
        if l == 0 {
            let fresh = new_node(seg, n, evicted)?;
            set_left(seg, n, fresh);
            rebalance(seg, root, n);
            return Ok(());
        }
        // Rightmost node of the left subtree holds the predecessors.
        let mut p = l;
        while right(seg, p) != 0 {
            p = right(seg, p);
        }
        if count(seg, p) < CAP {
            node_insert(seg, p, &evicted_key, evicted, column);
        } else {
            let fresh = new_node(seg, p, evicted)?;
            set_right(seg, p, fresh);
            rebalance(seg, root, p);
        }
        return Ok(());
    }
}

/// Remove the entry for `(key, rec)`. Missing entries are a logic error
/// upstream and are ignored in release builds.
pub(crate) fn remove(seg: &Seg, root: &AtomicU64, key: &Value, rec: Record, column: usize) {
    let mut cursor = range(seg, root, Some((key.clone(), true)), Some((key.clone(), true)), column);
    while let Some((n, i, r)) = cursor.next_entry(seg) {
        if r == rec {
            remove_at(seg, root, n, i);
            return;
        }
    }
    debug_assert!(false, "ordered index missing entry for {rec:?}");
}

fn remove_at(seg: &Seg, root: &AtomicU64, n: u64, i: usize) {
    node_remove_at(seg, n, i);
    if count(seg, n) > 0 {
        return;
    }
    // Node went empty: splice it out of the tree.
    let (l, r) = (left(seg, n), right(seg, n));
    if l != 0 && r != 0 {
        // Refill from the in-order successor (leftmost of the right
        // subtree), then splice that node, which has no left child.
        let mut s = r;
        while left(seg, s) != 0 {
            s = left(seg, s);
        }
        let c = count(seg, s);
        for j in 0..c {
            seg.store(slot_cell(n, j), seg.load(slot_cell(s, j)));
        }
        set_count(seg, n, c);
        splice_half_leaf(seg, root, s);
    } else {
        splice_half_leaf(seg, root, n);
    }
}

/// Unlink a node with at most one child and free it.
fn splice_half_leaf(seg: &Seg, root: &AtomicU64, n: u64) {
    let child = if left(seg, n) != 0 { left(seg, n) } else { right(seg, n) };
    let p = parent(seg, n);
    replace_child(seg, root, n, child);
    rebalance(seg, root, p);
    alloc::free(seg, n, NODE_SIZE);
}

/// Free every node of the tree (index drop).
pub(crate) fn free_tree(seg: &Seg, root_off: u64) {
    if root_off == 0 {
        return;
    }
    free_tree(seg, left(seg, root_off));
    free_tree(seg, right(seg, root_off));
    alloc::free(seg, root_off, NODE_SIZE);
}

fn leftmost(seg: &Seg, mut n: u64) -> u64 {
    while left(seg, n) != 0 {
        n = left(seg, n);
    }
    n
}

fn successor(seg: &Seg, n: u64) -> u64 {
    let r = right(seg, n);
    if r != 0 {
        return leftmost(seg, r);
    }
    let mut cur = n;
    loop {
        let p = parent(seg, cur);
        if p == 0 || left(seg, p) == cur {
            return p;
        }
        cur = p;
    }
}

/// Ascending scan over `[lo, hi]` (either bound optional, each with its
/// own inclusivity). Valid only under the read lock it was built in.
pub(crate) struct RangeCursor {
    node: u64,
    slot: usize,
    hi: Option<(Value, bool)>,
    column: usize,
}

pub(crate) fn range(
    seg: &Seg,
    root: &AtomicU64,
    lo: Option<(Value, bool)>,
    hi: Option<(Value, bool)>,
    column: usize,
) -> RangeCursor {
    let r = root.load(Ordering::Relaxed);
    let mut cursor = RangeCursor { node: 0, slot: 0, hi, column };
    if r == 0 {
        return cursor;
    }
    match lo {
        None => {
            cursor.node = leftmost(seg, r);
        }
        Some((lo_key, inclusive)) => {
            // Find the first node whose max reaches the bound, then the
            // first qualifying slot within it.
            let mut n = r;
            let mut candidate = 0;
            while n != 0 {
                let over = match node_max(seg, n, column).db_cmp(&lo_key) {
                    Ord_::Less => false,
                    Ord_::Equal => inclusive,
                    Ord_::Greater => true,
                };
                if over {
                    candidate = n;
                    n = left(seg, n);
                } else {
                    n = right(seg, n);
                }
            }
            if candidate == 0 {
                return cursor;
            }
            cursor.node = candidate;
            for i in 0..count(seg, candidate) {
                let k = key_of(seg, entry(seg, candidate, i), column);
                let reached = match k.db_cmp(&lo_key) {
                    Ord_::Less => false,
                    Ord_::Equal => inclusive,
                    Ord_::Greater => true,
                };
                if reached {
                    cursor.slot = i;
                    return cursor;
                }
            }
            // All entries below the bound; start at the successor.
            cursor.node = successor(seg, candidate);
        }
    }
    cursor
}

impl RangeCursor {
    /// Next `(node, slot, record)` within bounds, or None when exhausted.
    fn next_entry(&mut self, seg: &Seg) -> Option<(u64, usize, Record)> {
        loop {
            if self.node == 0 {
                return None;
            }
            if self.slot >= count(seg, self.node) {
                self.node = successor(seg, self.node);
                self.slot = 0;
                continue;
            }
            let rec = entry(seg, self.node, self.slot);
            if let Some((hi_key, inclusive)) = &self.hi {
                let k = key_of(seg, rec, self.column);
                let past = match k.db_cmp(hi_key) {
                    Ord_::Greater => true,
                    Ord_::Equal => !inclusive,
                    Ord_::Less => false,
                };
                if past {
                    self.node = 0;
                    return None;
                }
            }
            let at = (self.node, self.slot, rec);
            self.slot += 1;
            return Some(at);
        }
    }

    pub(crate) fn next(&mut self, seg: &Seg) -> Option<Record> {
        self.next_entry(seg).map(|(_, _, rec)| rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::test_seg;

    fn setup(seg: &Seg, keys: &[i64]) -> (AtomicU64, Vec<Record>) {
        let root = AtomicU64::new(0);
        let mut recs = Vec::new();
        for k in keys {
            let rec = record::create_raw(seg, 1).unwrap();
            record::set_new_field(seg, rec, 0, encode::inline_int_word(*k).unwrap()).unwrap();
            insert(seg, &root, &Value::Int(*k), rec, 0).unwrap();
            recs.push(rec);
        }
        (root, recs)
    }

    fn collect(seg: &Seg, root: &AtomicU64, lo: Option<(Value, bool)>, hi: Option<(Value, bool)>) -> Vec<i64> {
        let mut out = Vec::new();
        let mut cur = range(seg, root, lo, hi, 0);
        while let Some(rec) = cur.next(seg) {
            match encode::decode(seg, record::get_field(seg, rec, 0).unwrap()).unwrap() {
                Value::Int(v) => out.push(v),
                other => panic!("unexpected key {other:?}"),
            }
        }
        out
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_inserts_emit_in_key_order() {
        let seg = test_seg(1 << 22);
        let keys: Vec<i64> = (0..500).map(|i| (i * 37) % 500).collect();
        let (root, _) = setup(&seg, &keys);
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(sorted, collect(&seg, &root, None, None));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_range_bounds() {
        let seg = test_seg(1 << 22);
        let keys: Vec<i64> = (0..100).collect();
        let (root, _) = setup(&seg, &keys);
        let got = collect(
            &seg,
            &root,
            Some((Value::Int(21), false)),
            Some((Value::Int(30), true)),
        );
        assert_eq!((22..=30).collect::<Vec<i64>>(), got);
        let got = collect(&seg, &root, Some((Value::Int(95), true)), None);
        assert_eq!((95..100).collect::<Vec<i64>>(), got);
        let got = collect(&seg, &root, None, Some((Value::Int(4), false)));
        assert_eq!((0..4).collect::<Vec<i64>>(), got);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_duplicates() {
        let seg = test_seg(1 << 22);
        let keys = vec![5; 40];
        let (root, _) = setup(&seg, &keys);
        let got = collect(&seg, &root, Some((Value::Int(5), true)), Some((Value::Int(5), true)));
        assert_eq!(40, got.len());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_remove_keeps_remainder() {
        let seg = test_seg(1 << 22);
        let keys: Vec<i64> = (0..200).collect();
        let (root, recs) = setup(&seg, &keys);
        for (i, rec) in recs.iter().enumerate() {
            if i % 3 == 0 {
                remove(&seg, &root, &Value::Int(i as i64), *rec, 0);
            }
        }
        let expected: Vec<i64> = (0..200).filter(|i| i % 3 != 0).collect();
        assert_eq!(expected, collect(&seg, &root, None, None));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_remove_everything_frees_nodes() {
        let seg = test_seg(1 << 22);
        let keys: Vec<i64> = (0..100).rev().collect();
        let (root, recs) = setup(&seg, &keys);
        for (i, rec) in recs.iter().enumerate() {
            remove(&seg, &root, &Value::Int(keys[i]), *rec, 0);
        }
        assert_eq!(0, root.load(Ordering::Relaxed));
        assert!(collect(&seg, &root, None, None).is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_balance_stays_logarithmic() {
        let seg = test_seg(1 << 22);
        let keys: Vec<i64> = (0..2000).collect(); // worst-case ascending
        let (root, _) = setup(&seg, &keys);
        // 2000 entries / 8 per node = 250 nodes; AVL height must stay
        // well under the entry count.
        let h = height(&seg, root.load(Ordering::Relaxed));
        assert!(h <= 12, "tree degenerated: height {h}");
    }
}
