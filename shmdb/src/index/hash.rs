// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Equality-only index: fixed bucket array with chained entries.
//!
//! Root object: one word of bucket count followed by the bucket array.
//! Entry nodes are `[key hash, record offset, next]`. The key is the
//! tuple of the indexed columns' values (one for a single-column index,
//! several for a multi-column one). Hashes are canonicalized so that
//! values equal under [Value::db_cmp] — notably ints and doubles of the
//! same magnitude — land in the same bucket; the cursor re-checks real
//! equality before yielding.

use crate::error::Result;
use crate::record::Record;
use crate::segment::{Seg, WORD};
use crate::value::Value;
use crate::{alloc, record};
use std::hash::Hasher;

/// Buckets per index.
const BUCKETS: usize = 256;
const ROOT_SIZE: usize = (1 + BUCKETS) * WORD;
const NODE_SIZE: usize = 3 * WORD;

/// Mix one value into the hasher, canonicalizing the numeric family.
fn hash_value(h: &mut fnv::FnvHasher, v: &Value) {
    match v {
        Value::Null => h.write_u8(0),
        Value::Int(i) => {
            h.write_u8(1);
            h.write_i64(*i);
        }
        Value::Double(d) | Value::FixedPoint(d) => {
            // Integral doubles hash like the equal int.
            if d.fract() == 0.0 && *d >= i64::MIN as f64 && *d <= i64::MAX as f64 {
                h.write_u8(1);
                h.write_i64(*d as i64);
            } else {
                h.write_u8(2);
                h.write_u64(d.to_bits());
            }
        }
        Value::Str { s, lang } => {
            h.write_u8(3);
            h.write(s.as_bytes());
            h.write_u8(0xfe);
            if let Some(lang) = lang {
                h.write(lang.as_bytes());
            }
        }
        Value::XmlLiteral { s, xsd_type } => {
            h.write_u8(4);
            h.write(s.as_bytes());
            h.write_u8(0xfe);
            h.write(xsd_type.as_bytes());
        }
        Value::Uri { s, prefix } => {
            h.write_u8(5);
            h.write(s.as_bytes());
            h.write_u8(0xfe);
            if let Some(prefix) = prefix {
                h.write(prefix.as_bytes());
            }
        }
        Value::Blob { bytes, media_type } => {
            h.write_u8(6);
            h.write(bytes);
            h.write_u8(0xfe);
            if let Some(t) = media_type {
                h.write(t.as_bytes());
            }
        }
        Value::Char(c) => {
            h.write_u8(7);
            h.write_u32(*c as u32);
        }
        Value::Date(d) => {
            h.write_u8(8);
            h.write_i32(*d);
        }
        Value::Time(t) => {
            h.write_u8(9);
            h.write_i32(*t);
        }
        Value::Record(r) => {
            h.write_u8(10);
            h.write_u64(r.offset());
        }
        Value::AnonConst(s) => {
            h.write_u8(11);
            h.write(s.as_bytes());
        }
        Value::Var(n) => {
            h.write_u8(12);
            h.write_u32(*n);
        }
    }
}

pub(crate) fn key_hash(values: &[Value]) -> u64 {
    let mut h = fnv::FnvHasher::default();
    for v in values {
        hash_value(&mut h, v);
    }
    h.finish()
}

fn bucket_cell(root: u64, hash: u64) -> u64 {
    root + WORD as u64 + (hash % BUCKETS as u64) * WORD as u64
}

/// Allocate an empty bucket array.
pub(crate) fn create_root(seg: &Seg) -> Result<u64> {
    let root = alloc::alloc(seg, ROOT_SIZE)?;
    seg.store(root, BUCKETS as u64);
    Ok(root)
}

pub(crate) fn insert(seg: &Seg, root: u64, values: &[Value], rec: Record) -> Result<()> {
    let hash = key_hash(values);
    let cell = bucket_cell(root, hash);
    let node = alloc::alloc(seg, NODE_SIZE)?;
    seg.store(node, hash);
    seg.store(node + WORD as u64, rec.offset());
    seg.store(node + 2 * WORD as u64, seg.load(cell));
    seg.store(cell, node);
    Ok(())
}

pub(crate) fn remove(seg: &Seg, root: u64, values: &[Value], rec: Record) {
    let hash = key_hash(values);
    let cell = bucket_cell(root, hash);
    let mut prev: Option<u64> = None;
    let mut node = seg.load(cell);
    while node != 0 {
        let next = seg.load(node + 2 * WORD as u64);
        if seg.load(node) == hash && seg.load(node + WORD as u64) == rec.offset() {
            match prev {
                Some(p) => seg.store(p + 2 * WORD as u64, next),
                None => seg.store(cell, next),
            }
            alloc::free(seg, node, NODE_SIZE);
            return;
        }
        prev = Some(node);
        node = next;
    }
    debug_assert!(false, "hash index missing entry for {rec:?}");
}

/// Free the bucket array and every chain node (index drop).
pub(crate) fn free_root(seg: &Seg, root: u64) {
    for b in 0..BUCKETS {
        let mut node = seg.load(root + ((1 + b) * WORD) as u64);
        while node != 0 {
            let next = seg.load(node + 2 * WORD as u64);
            alloc::free(seg, node, NODE_SIZE);
            node = next;
        }
    }
    alloc::free(seg, root, ROOT_SIZE);
}

/// Equality scan: chain entries whose hash matches, verified against the
/// actual column values before being yielded.
pub(crate) struct EqCursor {
    node: u64,
    hash: u64,
    values: Vec<Value>,
    columns: Vec<usize>,
}

pub(crate) fn lookup_eq(
    seg: &Seg,
    root: u64,
    values: Vec<Value>,
    columns: Vec<usize>,
) -> EqCursor {
    debug_assert_eq!(values.len(), columns.len());
    let hash = key_hash(&values);
    EqCursor {
        node: seg.load(bucket_cell(root, hash)),
        hash,
        values,
        columns,
    }
}

impl EqCursor {
    pub(crate) fn next(&mut self, seg: &Seg) -> Option<Record> {
        while self.node != 0 {
            let node = self.node;
            self.node = seg.load(node + 2 * WORD as u64);
            if seg.load(node) != self.hash {
                continue;
            }
            let rec = Record::from_offset(seg.load(node + WORD as u64));
            let verified = self.columns.iter().zip(&self.values).all(|(col, want)| {
                record::get_field(seg, rec, *col)
                    .ok()
                    .and_then(|w| crate::encode::decode(seg, w).ok())
                    .is_some_and(|have| have.db_eq(want))
            });
            if verified {
                return Some(rec);
            }
        }
        None
    }
}
