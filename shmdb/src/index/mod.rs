// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Index registry and maintenance.
//!
//! Indexes live in the fixed-capacity table of the segment header. Each
//! entry names the covered column(s), the kind (ordered, range-capable;
//! or hashed, equality-only), an optional template record scoping the
//! index to matching records, and the root offset of the structure.
//!
//! The record layer calls the hooks here on every create, delete and
//! field write; the query planner consumes the uniform cursor contract.

mod hash;
mod ttree;

use crate::error::{DbError, Result};
use crate::record::Record;
use crate::segment::{Seg, MAX_INDEXES, MAX_INDEX_COLS};
use crate::value::{Kind, Value};
use crate::{encode, record};
use crate::encode::Word;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a registered index, unique for the segment's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum IndexKind {
    /// T-tree: equality and range lookups, ordered scans.
    Ordered = 1,
    /// Hash table: equality lookups only.
    Hashed = 2,
}

impl IndexKind {
    fn from_u32(raw: u32) -> Option<IndexKind> {
        match raw {
            1 => Some(IndexKind::Ordered),
            2 => Some(IndexKind::Hashed),
            _ => None,
        }
    }
}

/// Snapshot of one registry slot.
#[derive(Debug, Clone)]
pub(crate) struct IndexInfo {
    pub slot: usize,
    pub id: IndexId,
    pub kind: IndexKind,
    pub columns: Vec<usize>,
    pub template: Option<Record>,
}

fn slot_info(seg: &Seg, slot: usize) -> Option<IndexInfo> {
    let e = &seg.header().indexes[slot];
    let id = e.id.load(Ordering::Relaxed);
    if id == 0 {
        return None;
    }
    let kind = IndexKind::from_u32(e.kind.load(Ordering::Relaxed))?;
    let n = e.col_count.load(Ordering::Relaxed) as usize;
    let columns = (0..n).map(|i| e.columns[i].load(Ordering::Relaxed) as usize).collect();
    let template = {
        let t = e.template.load(Ordering::Relaxed);
        (t != 0).then(|| Record::from_offset(t))
    };
    Some(IndexInfo { slot, id: IndexId(id), kind, columns, template })
}

/// Every registered index.
pub(crate) fn all(seg: &Seg) -> Vec<IndexInfo> {
    (0..MAX_INDEXES).filter_map(|i| slot_info(seg, i)).collect()
}

pub(crate) fn by_id(seg: &Seg, id: IndexId) -> Option<IndexInfo> {
    all(seg).into_iter().find(|i| i.id == id)
}

fn root_cell(seg: &Seg, slot: usize) -> &AtomicU64 {
    &seg.header().indexes[slot].root
}

/// Register an index over `columns` and populate it from the current
/// record list. Ordered indexes cover exactly one column; hashed indexes
/// may cover up to [MAX_INDEX_COLS] and then answer only all-column
/// equality probes.
pub(crate) fn create(
    seg: &Seg,
    columns: &[usize],
    kind: IndexKind,
    template: Option<Record>,
) -> Result<IndexId> {
    if columns.is_empty() || columns.len() > MAX_INDEX_COLS {
        return Err(DbError::Index("index must cover 1 to 4 columns"));
    }
    if kind == IndexKind::Ordered && columns.len() != 1 {
        return Err(DbError::Index("ordered indexes are single-column"));
    }
    let duplicate = all(seg).into_iter().any(|i| {
        i.kind == kind && i.columns == columns && i.template == template
    });
    if duplicate {
        return Err(DbError::Index("identical index already exists"));
    }
    let hdr = seg.header();
    let Some(slot) = (0..MAX_INDEXES)
        .find(|i| hdr.indexes[*i].id.load(Ordering::Relaxed) == 0)
    else {
        return Err(DbError::Index("index table is full"));
    };

    let root = match kind {
        IndexKind::Ordered => 0,
        IndexKind::Hashed => hash::create_root(seg)?,
    };
    let e = &hdr.indexes[slot];
    e.kind.store(kind as u32, Ordering::Relaxed);
    e.col_count.store(columns.len() as u32, Ordering::Relaxed);
    for (i, c) in columns.iter().enumerate() {
        e.columns[i].store(*c as u32, Ordering::Relaxed);
    }
    e.template
        .store(template.map_or(0, |t| t.offset()), Ordering::Relaxed);
    e.root.store(root, Ordering::Relaxed);
    let id = hdr.next_index_id.fetch_add(1, Ordering::Relaxed);
    e.id.store(id, Ordering::Relaxed);

    // Populate from existing records.
    let info = slot_info(seg, slot).expect("slot was just filled");
    let mut cur = record::first(seg);
    while let Some(rec) = cur {
        if admits(seg, &info, rec, None) {
            if let Err(e) = insert_entry(seg, &info, rec, None) {
                drop_slot(seg, &info);
                return Err(e);
            }
        }
        cur = record::next(seg, rec);
    }
    log::debug!("created index {id} on columns {columns:?} ({kind:?})");
    Ok(IndexId(id))
}

/// Drop an index and free its structures. The template record, if any,
/// stays: the registry never owned it.
pub(crate) fn drop_index(seg: &Seg, id: IndexId) -> Result<()> {
    let info = by_id(seg, id).ok_or(DbError::Index("no such index"))?;
    drop_slot(seg, &info);
    log::debug!("dropped index {}", id.0);
    Ok(())
}

fn drop_slot(seg: &Seg, info: &IndexInfo) {
    let root = root_cell(seg, info.slot).swap(0, Ordering::Relaxed);
    match info.kind {
        IndexKind::Ordered => ttree::free_tree(seg, root),
        IndexKind::Hashed => hash::free_root(seg, root),
    }
    let e = &seg.header().indexes[info.slot];
    e.id.store(0, Ordering::Relaxed);
    e.kind.store(0, Ordering::Relaxed);
    e.col_count.store(0, Ordering::Relaxed);
    for c in &e.columns {
        c.store(0, Ordering::Relaxed);
    }
    e.template.store(0, Ordering::Relaxed);
}

/// First index covering exactly `columns`, optionally narrowed by kind
/// and template.
pub(crate) fn find(
    seg: &Seg,
    columns: &[usize],
    kind: Option<IndexKind>,
    template: Option<Record>,
) -> Option<IndexId> {
    all(seg)
        .into_iter()
        .find(|i| {
            i.columns == columns
                && kind.is_none_or(|k| k == i.kind)
                && (template.is_none() || i.template == template)
        })
        .map(|i| i.id)
}

/// Is this record the template of any registered index? Such records are
/// pinned: the registry holds their offset.
pub(crate) fn is_template(seg: &Seg, rec: Record) -> bool {
    all(seg).iter().any(|i| i.template == Some(rec))
}

/// The value a record presents for `column`, with an optional substitute
/// for a field mid-update.
fn value_at(seg: &Seg, rec: Record, column: usize, subst: Option<(usize, Word)>) -> Option<Value> {
    let w = match subst {
        Some((f, w)) if f == column => w,
        _ => record::get_field(seg, rec, column).ok()?,
    };
    encode::decode(seg, w).ok()
}

/// Does the index admit this record (arity covers the columns and the
/// template, if any, matches)?
fn admits(seg: &Seg, info: &IndexInfo, rec: Record, subst: Option<(usize, Word)>) -> bool {
    let arity = record::arity(seg, rec);
    if info.columns.iter().any(|c| *c >= arity) {
        return false;
    }
    let Some(template) = info.template else {
        return true;
    };
    // The template itself is a prototype, not data.
    if template == rec {
        return false;
    }
    let t_arity = record::arity(seg, template);
    for i in 0..t_arity.min(arity) {
        let Ok(tw) = record::get_field(seg, template, i) else {
            return false;
        };
        if matches!(encode::kind_of(seg, tw), Ok(Kind::Var)) {
            continue;
        }
        let Ok(want) = encode::decode(seg, tw) else {
            return false;
        };
        match value_at(seg, rec, i, subst) {
            Some(have) if have.db_eq(&want) => {}
            _ => return false,
        }
    }
    // Template fields past the record's arity must all be wildcards.
    for i in arity..t_arity {
        let Ok(tw) = record::get_field(seg, template, i) else {
            return false;
        };
        if !matches!(encode::kind_of(seg, tw), Ok(Kind::Var)) {
            return false;
        }
    }
    true
}

fn key_values(
    seg: &Seg,
    info: &IndexInfo,
    rec: Record,
    subst: Option<(usize, Word)>,
) -> Vec<Value> {
    info.columns
        .iter()
        .map(|c| value_at(seg, rec, *c, subst).unwrap_or(Value::Null))
        .collect()
}

fn insert_entry(
    seg: &Seg,
    info: &IndexInfo,
    rec: Record,
    subst: Option<(usize, Word)>,
) -> Result<()> {
    let values = key_values(seg, info, rec, subst);
    match info.kind {
        IndexKind::Ordered => {
            ttree::insert(seg, root_cell(seg, info.slot), &values[0], rec, info.columns[0])
        }
        IndexKind::Hashed => {
            hash::insert(seg, root_cell(seg, info.slot).load(Ordering::Relaxed), &values, rec)
        }
    }
}

fn remove_entry(seg: &Seg, info: &IndexInfo, rec: Record) {
    let values = key_values(seg, info, rec, None);
    match info.kind {
        IndexKind::Ordered => {
            ttree::remove(seg, root_cell(seg, info.slot), &values[0], rec, info.columns[0]);
        }
        IndexKind::Hashed => {
            hash::remove(seg, root_cell(seg, info.slot).load(Ordering::Relaxed), &values, rec);
        }
    }
}

/// Hook: a record was created with all-null fields.
pub(crate) fn on_record_created(seg: &Seg, rec: Record) -> Result<()> {
    for info in all(seg) {
        if admits(seg, &info, rec, None) {
            insert_entry(seg, &info, rec, None)?;
        }
    }
    Ok(())
}

/// Hook: a record is about to be deleted; its fields are still intact.
pub(crate) fn on_record_deleted(seg: &Seg, rec: Record) {
    for info in all(seg) {
        if admits(seg, &info, rec, None) {
            remove_entry(seg, &info, rec);
        }
    }
}

/// Hook: `field` of `rec` is about to change from `old` to `new`. Called
/// before the cell is written, so lookups by the old key still succeed.
pub(crate) fn on_field_update(
    seg: &Seg,
    rec: Record,
    field: usize,
    old: Word,
    new: Word,
) -> Result<()> {
    if old == new {
        return Ok(());
    }
    for info in all(seg) {
        let before = admits(seg, &info, rec, None);
        let after = admits(seg, &info, rec, Some((field, new)));
        let covers = info.columns.contains(&field);
        match (before, after) {
            (true, true) if covers => {
                remove_entry(seg, &info, rec);
                insert_entry(seg, &info, rec, Some((field, new)))?;
            }
            (true, false) => remove_entry(seg, &info, rec),
            (false, true) => insert_entry(seg, &info, rec, Some((field, new)))?,
            _ => {}
        }
    }
    Ok(())
}

/// Uniform cursor the planner iterates, whatever drives it.
pub(crate) enum Cursor {
    Ordered(ttree::RangeCursor),
    Hashed(hash::EqCursor),
}

impl Cursor {
    pub(crate) fn next(&mut self, seg: &Seg) -> Option<Record> {
        match self {
            Cursor::Ordered(c) => c.next(seg),
            Cursor::Hashed(c) => c.next(seg),
        }
    }
}

/// Equality probe. For hashed indexes `values` carries one value per
/// indexed column; ordered indexes take a single key.
pub(crate) fn cursor_eq(seg: &Seg, info: &IndexInfo, values: Vec<Value>) -> Cursor {
    match info.kind {
        IndexKind::Ordered => Cursor::Ordered(ttree::range(
            seg,
            root_cell(seg, info.slot),
            Some((values[0].clone(), true)),
            Some((values[0].clone(), true)),
            info.columns[0],
        )),
        IndexKind::Hashed => Cursor::Hashed(hash::lookup_eq(
            seg,
            root_cell(seg, info.slot).load(Ordering::Relaxed),
            values,
            info.columns.clone(),
        )),
    }
}

/// Range scan over an ordered index, ascending.
pub(crate) fn cursor_range(
    seg: &Seg,
    info: &IndexInfo,
    lo: Option<(Value, bool)>,
    hi: Option<(Value, bool)>,
) -> Cursor {
    debug_assert_eq!(IndexKind::Ordered, info.kind);
    Cursor::Ordered(ttree::range(seg, root_cell(seg, info.slot), lo, hi, info.columns[0]))
}
