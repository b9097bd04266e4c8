// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Query planning and execution.
//!
//! A query is a match record (concrete fields constrain, `Var` fields are
//! wildcards, columns past its length are implicitly wild) unified with an
//! argument list of `(column, comparator, value)` triples. The planner
//! merges both into one constraint set, scores the available indexes and
//! picks a *driver* — an index probe, an index range, or the record list —
//! to generate candidates; every constraint is then re-checked as a filter
//! before a row is emitted, so the driver is purely an accelerator.
//!
//! Scoring: hashed equality 1, ordered equality 2, ordered range 3, full
//! scan last; ties go to the lowest column. When driven by an ordered
//! index, rows come out ascending by that column; otherwise the order is
//! unspecified but stable for a given database state.
//!
//! A query is `Built` without any lock association; the first `fetch`
//! moves it to `Streaming` and must happen under a lock the caller holds
//! for the whole iteration. The prefetching variant instead materializes
//! matching offsets into scratch-pool pages at build time, so the caller
//! can drop the lock before iterating.

use crate::error::{DbError, Result};
use crate::index::{self, IndexInfo, IndexKind};
use crate::record::Record;
use crate::segment::Seg;
use crate::value::{Kind, Value};
use crate::{encode, record};
use shmdb_alloc::{Allocator, ScratchPool};
use std::alloc::Layout;
use std::cmp::Ordering as Ord_;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// Comparators accepted in a query argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
}

/// One entry of a query argument list.
#[derive(Debug, Clone)]
pub struct QueryArg {
    pub column: usize,
    pub cond: Comparator,
    pub value: Value,
}

/// Columns beyond this are considered nonsense rather than merely empty.
const MAX_QUERY_COLUMN: usize = 4096;

/// Rows per prefetch page, sized to keep pages around 2 KiB.
const PAGE_ROWS: usize = 254;

#[derive(Debug, Clone)]
struct Filter {
    column: usize,
    cond: Comparator,
    value: Value,
}

fn satisfies(seg: &Seg, rec: Record, f: &Filter) -> bool {
    let Ok(w) = record::get_field(seg, rec, f.column) else {
        // A record too short for the column satisfies nothing.
        return false;
    };
    let Ok(have) = encode::decode(seg, w) else {
        return false;
    };
    match f.cond {
        Comparator::Equal => have.db_eq(&f.value),
        Comparator::NotEqual => !have.db_eq(&f.value),
        Comparator::Less => have.db_cmp(&f.value) == Ord_::Less,
        Comparator::Greater => have.db_cmp(&f.value) == Ord_::Greater,
        Comparator::LessOrEqual => have.db_cmp(&f.value) != Ord_::Greater,
        Comparator::GreaterOrEqual => have.db_cmp(&f.value) != Ord_::Less,
    }
}

/// Per-column aggregate of the constraint set.
#[derive(Default, Clone)]
struct ColumnBounds {
    eq: Option<Value>,
    lo: Option<(Value, bool)>,
    hi: Option<(Value, bool)>,
    unsatisfiable: bool,
}

impl ColumnBounds {
    fn add(&mut self, cond: Comparator, value: &Value) {
        match cond {
            Comparator::Equal => match &self.eq {
                Some(prev) if !prev.db_eq(value) => self.unsatisfiable = true,
                _ => self.eq = Some(value.clone()),
            },
            Comparator::Less => self.tighten_hi(value, false),
            Comparator::LessOrEqual => self.tighten_hi(value, true),
            Comparator::Greater => self.tighten_lo(value, false),
            Comparator::GreaterOrEqual => self.tighten_lo(value, true),
            Comparator::NotEqual => {}
        }
    }

    fn tighten_lo(&mut self, value: &Value, inclusive: bool) {
        let replace = match &self.lo {
            None => true,
            Some((cur, cur_incl)) => match value.db_cmp(cur) {
                Ord_::Greater => true,
                Ord_::Equal => *cur_incl && !inclusive,
                Ord_::Less => false,
            },
        };
        if replace {
            self.lo = Some((value.clone(), inclusive));
        }
    }

    fn tighten_hi(&mut self, value: &Value, inclusive: bool) {
        let replace = match &self.hi {
            None => true,
            Some((cur, cur_incl)) => match value.db_cmp(cur) {
                Ord_::Less => true,
                Ord_::Equal => *cur_incl && !inclusive,
                Ord_::Greater => false,
            },
        };
        if replace {
            self.hi = Some((value.clone(), inclusive));
        }
    }
}

/// The chosen access path, instantiated lazily at first fetch.
enum Plan {
    Nothing,
    FullScan,
    IndexEq { id: index::IndexId, values: Vec<Value> },
    IndexRange { id: index::IndexId, lo: Option<(Value, bool)>, hi: Option<(Value, bool)> },
}

enum Driver {
    Scan(Option<Record>),
    Index(index::Cursor),
    Prefetched(PageList),
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Built,
    Streaming,
    Exhausted,
}

/// A built query. Dropping it frees the plan and any prefetched pages.
pub struct Query {
    state: State,
    plan: Plan,
    driver: Option<Driver>,
    filters: Vec<Filter>,
}

/// Collect the effective constraint set from a match template and arglist.
/// Concrete template fields become equality constraints; `Var` fields and
/// everything past the template's length are wildcards.
fn unify(match_template: Option<&[Value]>, args: &[QueryArg]) -> Result<Vec<Filter>> {
    let mut filters = Vec::new();
    for (column, value) in match_template.unwrap_or_default().iter().enumerate() {
        if value.kind() == Kind::Var {
            continue;
        }
        filters.push(Filter { column, cond: Comparator::Equal, value: value.clone() });
    }
    for arg in args {
        if arg.column >= MAX_QUERY_COLUMN {
            return Err(DbError::NoSuchColumn(arg.column));
        }
        if arg.value.kind() == Kind::Var {
            return Err(DbError::InvalidConstraint { column: arg.column });
        }
        filters.push(Filter { column: arg.column, cond: arg.cond, value: arg.value.clone() });
    }
    Ok(filters)
}

/// Is an index with a template safe to drive this query? Only if the
/// constraints guarantee every qualifying record matches the template,
/// i.e. each concrete template field has an equal equality constraint.
fn template_compatible(seg: &Seg, info: &IndexInfo, bounds: &BTreeMap<usize, ColumnBounds>) -> bool {
    let Some(template) = info.template else {
        return true;
    };
    for column in 0..record::arity(seg, template) {
        let Ok(w) = record::get_field(seg, template, column) else {
            return false;
        };
        if matches!(encode::kind_of(seg, w), Ok(Kind::Var)) {
            continue;
        }
        let Ok(want) = encode::decode(seg, w) else {
            return false;
        };
        match bounds.get(&column).and_then(|b| b.eq.as_ref()) {
            Some(eq) if eq.db_eq(&want) => {}
            _ => return false,
        }
    }
    true
}

fn choose_plan(seg: &Seg, filters: &[Filter]) -> Plan {
    let mut bounds: BTreeMap<usize, ColumnBounds> = BTreeMap::new();
    for f in filters {
        bounds.entry(f.column).or_default().add(f.cond, &f.value);
    }
    if bounds.values().any(|b| b.unsatisfiable) {
        return Plan::Nothing;
    }

    let indexes = index::all(seg);
    // (score, tie-break column, plan)
    let mut best: Option<(u32, usize, Plan)> = None;
    let mut consider = |score: u32, column: usize, plan: Plan| {
        let better = match &best {
            None => true,
            Some((s, c, _)) => score < *s || (score == *s && column < *c),
        };
        if better {
            best = Some((score, column, plan));
        }
    };

    for info in &indexes {
        if !template_compatible(seg, info, &bounds) {
            continue;
        }
        let tie_column = *info.columns.iter().min().expect("index covers a column");
        match info.kind {
            IndexKind::Hashed => {
                let values: Option<Vec<Value>> = info
                    .columns
                    .iter()
                    .map(|c| bounds.get(c).and_then(|b| b.eq.clone()))
                    .collect();
                if let Some(values) = values {
                    consider(1, tie_column, Plan::IndexEq { id: info.id, values });
                }
            }
            IndexKind::Ordered => {
                let column = info.columns[0];
                let Some(b) = bounds.get(&column) else {
                    continue;
                };
                if let Some(eq) = &b.eq {
                    consider(2, tie_column, Plan::IndexEq { id: info.id, values: vec![eq.clone()] });
                } else if b.lo.is_some() || b.hi.is_some() {
                    consider(
                        3,
                        tie_column,
                        Plan::IndexRange { id: info.id, lo: b.lo.clone(), hi: b.hi.clone() },
                    );
                }
            }
        }
    }

    match best {
        Some((_, _, plan)) => plan,
        None => Plan::FullScan,
    }
}

/// Build a query without touching any index yet.
pub(crate) fn build(
    seg: &Seg,
    match_template: Option<&[Value]>,
    args: &[QueryArg],
) -> Result<Query> {
    let filters = unify(match_template, args)?;
    let plan = choose_plan(seg, &filters);
    Ok(Query { state: State::Built, plan, driver: None, filters })
}

fn instantiate(seg: &Seg, plan: &Plan) -> Driver {
    match plan {
        Plan::Nothing => Driver::Done,
        Plan::FullScan => Driver::Scan(record::first(seg)),
        Plan::IndexEq { id, values } => match index::by_id(seg, *id) {
            // The index may have been dropped since planning; candidates
            // then come from the record list instead.
            None => Driver::Scan(record::first(seg)),
            Some(info) => Driver::Index(index::cursor_eq(seg, &info, values.clone())),
        },
        Plan::IndexRange { id, lo, hi } => match index::by_id(seg, *id) {
            None => Driver::Scan(record::first(seg)),
            Some(info) => Driver::Index(index::cursor_range(seg, &info, lo.clone(), hi.clone())),
        },
    }
}

fn driver_next(seg: &Seg, driver: &mut Driver) -> Option<Record> {
    match driver {
        Driver::Done => None,
        Driver::Scan(cur) => {
            let rec = (*cur)?;
            *cur = record::next(seg, rec);
            Some(rec)
        }
        Driver::Index(cursor) => cursor.next(seg),
        Driver::Prefetched(pages) => pages.pop(),
    }
}

/// Stream the next matching record. The caller must hold the lock it
/// built the query under for the whole Streaming phase (prefetched
/// queries excepted).
pub(crate) fn fetch(seg: &Seg, query: &mut Query) -> Option<Record> {
    if query.state == State::Exhausted {
        return None;
    }
    if query.driver.is_none() {
        debug_assert!(
            seg.header().lock_state.load(std::sync::atomic::Ordering::Relaxed) != 0,
            "streaming a query without holding the lock"
        );
        query.driver = Some(instantiate(seg, &query.plan));
        query.state = State::Streaming;
    }
    let driver = query.driver.as_mut().expect("driver instantiated above");
    while let Some(rec) = driver_next(seg, driver) {
        if query.filters.iter().all(|f| satisfies(seg, rec, f)) {
            return Some(rec);
        }
    }
    query.state = State::Exhausted;
    None
}

/// Build a prefetching query: run the plan to completion right now, under
/// the caller's lock, snapshotting up to `row_limit` matching offsets into
/// scratch-pool pages. Fetching afterwards needs no lock.
pub(crate) fn build_prefetch(
    seg: &Seg,
    match_template: Option<&[Value]>,
    args: &[QueryArg],
    row_limit: usize,
) -> Result<Query> {
    let mut q = build(seg, match_template, args)?;
    let mut pages = PageList::new();
    let mut driver = instantiate(seg, &q.plan);
    let mut n = 0;
    while n < row_limit {
        let Some(rec) = driver_next(seg, &mut driver) else {
            break;
        };
        if q.filters.iter().all(|f| satisfies(seg, rec, f)) {
            pages.push(rec.offset());
            n += 1;
        }
    }
    q.driver = Some(Driver::Prefetched(pages));
    q.state = State::Streaming;
    q.filters.clear();
    Ok(q)
}

/// Convenience single-constraint scan: the next record after `last` (or
/// the first) whose `column` satisfies `cond value`, in record-list
/// order. No query object survives the call.
pub(crate) fn find_record(
    seg: &Seg,
    column: usize,
    cond: Comparator,
    value: Value,
    last: Option<Record>,
) -> Option<Record> {
    let f = Filter { column, cond, value };
    let mut cur = match last {
        Some(rec) => record::next(seg, rec),
        None => record::first(seg),
    };
    while let Some(rec) = cur {
        if satisfies(seg, rec, &f) {
            return Some(rec);
        }
        cur = record::next(seg, rec);
    }
    None
}

/// Offset pages chained through the scratch pool (process-local memory,
/// never the segment). The pool, and with it every page, is released when
/// the query drops.
struct PageList {
    pool: ScratchPool,
    last: Option<NonNull<Page>>,
    read_page: Option<NonNull<Page>>,
    read_idx: usize,
}

#[repr(C)]
struct Page {
    next: Option<NonNull<Page>>,
    count: usize,
    rows: [u64; PAGE_ROWS],
}

impl PageList {
    fn new() -> PageList {
        PageList {
            pool: ScratchPool::new(std::mem::size_of::<Page>()),
            last: None,
            read_page: None,
            read_idx: 0,
        }
    }

    fn push(&mut self, offset: u64) {
        // SAFETY: pages come from the pool which outlives self; only this
        // list ever holds pointers to them.
        unsafe {
            if let Some(mut last) = self.last {
                if last.as_ref().count < PAGE_ROWS {
                    let page = last.as_mut();
                    page.rows[page.count] = offset;
                    page.count += 1;
                    return;
                }
            }
            let raw = self
                .pool
                .allocate(Layout::new::<Page>())
                .expect("process heap exhausted")
                .cast::<Page>();
            raw.as_ptr().write(Page { next: None, count: 1, rows: [0; PAGE_ROWS] });
            (*raw.as_ptr()).rows[0] = offset;
            match self.last {
                Some(mut last) => last.as_mut().next = Some(raw),
                None => self.read_page = Some(raw),
            }
            self.last = Some(raw);
        }
    }

    fn pop(&mut self) -> Option<Record> {
        // SAFETY: read_page is either None or a live pool page.
        unsafe {
            loop {
                let page = self.read_page?;
                let page = page.as_ref();
                if self.read_idx < page.count {
                    let off = page.rows[self.read_idx];
                    self.read_idx += 1;
                    return Some(Record::from_offset(off));
                }
                self.read_page = page.next;
                self.read_idx = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Word;
    use crate::segment::test_seg;

    fn enc(seg: &Seg, v: Value) -> Word {
        encode::encode(seg, &v).unwrap()
    }

    /// The 20-row fixture: field 0 cycles 0,1,2; field 2 is the row
    /// index; field 3 is 6 for rows below 6.
    fn fixture(seg: &Seg) -> Vec<Record> {
        (0..20)
            .map(|row| {
                let rec = record::create(seg, 4).unwrap();
                record::set_field(seg, rec, 0, enc(seg, Value::Int(row % 3))).unwrap();
                record::set_field(seg, rec, 2, enc(seg, Value::Int(row))).unwrap();
                if row < 6 {
                    record::set_field(seg, rec, 3, enc(seg, Value::Int(6))).unwrap();
                }
                rec
            })
            .collect()
    }

    fn arg(column: usize, cond: Comparator, v: i64) -> QueryArg {
        QueryArg { column, cond, value: Value::Int(v) }
    }

    fn run(seg: &Seg, template: Option<&[Value]>, args: &[QueryArg]) -> Vec<Record> {
        let mut q = build(seg, template, args).unwrap();
        let mut out = Vec::new();
        let t = crate::lock::start_read(seg);
        while let Some(r) = fetch(seg, &mut q) {
            out.push(r);
        }
        crate::lock::end_read(seg, t);
        out
    }

    fn col2(seg: &Seg, rec: Record) -> i64 {
        match encode::decode(seg, record::get_field(seg, rec, 2).unwrap()).unwrap() {
            Value::Int(v) => v,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scan_query_matches_naive() {
        let seg = test_seg(1 << 21);
        let recs = fixture(&seg);
        let got = run(&seg, None, &[arg(0, Comparator::Equal, 1)]);
        let expected: Vec<Record> =
            recs.iter().enumerate().filter(|(i, _)| i % 3 == 1).map(|(_, r)| *r).collect();
        assert_eq!(expected, got);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_ordered_index_range_ascending() {
        let seg = test_seg(1 << 21);
        fixture(&seg);
        index::create(&seg, &[2], IndexKind::Ordered, None).unwrap();
        let got = run(&seg, None, &[arg(2, Comparator::Less, 30)]);
        assert_eq!(20, got.len());
        let keys: Vec<i64> = got.iter().map(|r| col2(&seg, *r)).collect();
        assert_eq!((0..20).collect::<Vec<i64>>(), keys);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_two_sided_range() {
        let seg = test_seg(1 << 22);
        for row in 0..200 {
            let rec = record::create(&seg, 3).unwrap();
            record::set_field(&seg, rec, 2, enc(&seg, Value::Int(row))).unwrap();
        }
        index::create(&seg, &[2], IndexKind::Ordered, None).unwrap();
        let got = run(
            &seg,
            None,
            &[arg(2, Comparator::Greater, 21), arg(2, Comparator::LessOrEqual, 111)],
        );
        assert_eq!(90, got.len());
        assert_eq!(22, col2(&seg, got[0]));
        assert_eq!(111, col2(&seg, *got.last().unwrap()));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_match_template_query() {
        let seg = test_seg(1 << 21);
        let recs = fixture(&seg);
        // [0, *, *, *]: field 0 must decode to 0.
        let template =
            [Value::Int(0), Value::Var(0), Value::Var(0), Value::Var(0)];
        let got = run(&seg, Some(&template), &[]);
        let expected: Vec<Record> =
            recs.iter().enumerate().filter(|(i, _)| i % 3 == 0).map(|(_, r)| *r).collect();
        assert_eq!(expected, got);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_indexed_equals_scan_results() {
        let seg = test_seg(1 << 22);
        fixture(&seg);
        let args =
            [arg(0, Comparator::Equal, 2), arg(2, Comparator::GreaterOrEqual, 5)];
        let mut unindexed = run(&seg, None, &args);
        index::create(&seg, &[0], IndexKind::Hashed, None).unwrap();
        index::create(&seg, &[2], IndexKind::Ordered, None).unwrap();
        let mut indexed = run(&seg, None, &args);
        unindexed.sort_by_key(|r| r.offset());
        indexed.sort_by_key(|r| r.offset());
        assert_eq!(unindexed, indexed);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_hashed_beats_ordered_for_equality() {
        let seg = test_seg(1 << 21);
        fixture(&seg);
        index::create(&seg, &[0], IndexKind::Ordered, None).unwrap();
        index::create(&seg, &[0], IndexKind::Hashed, None).unwrap();
        let filters = unify(None, &[arg(0, Comparator::Equal, 1)]).unwrap();
        match choose_plan(&seg, &filters) {
            Plan::IndexEq { id, .. } => {
                assert_eq!(Some(IndexKind::Hashed), index::by_id(&seg, id).map(|i| i.kind));
            }
            _ => panic!("expected an index-equality plan"),
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_contradictory_equalities_yield_nothing() {
        let seg = test_seg(1 << 21);
        fixture(&seg);
        let got = run(
            &seg,
            None,
            &[arg(2, Comparator::Equal, 1), arg(2, Comparator::Equal, 2)],
        );
        assert!(got.is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_constraint_errors() {
        let seg = test_seg(1 << 21);
        assert!(matches!(
            build(&seg, None, &[QueryArg { column: 1 << 20, cond: Comparator::Equal, value: Value::Int(0) }]),
            Err(DbError::NoSuchColumn(_))
        ));
        assert!(matches!(
            build(&seg, None, &[QueryArg { column: 0, cond: Comparator::Equal, value: Value::Var(1) }]),
            Err(DbError::InvalidConstraint { column: 0 })
        ));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_prefetch_iterates_after_lock_release() {
        let seg = test_seg(1 << 22);
        for row in 0..600 {
            let rec = record::create(&seg, 3).unwrap();
            record::set_field(&seg, rec, 2, enc(&seg, Value::Int(row))).unwrap();
        }
        let t = crate::lock::start_read(&seg);
        let mut q = build_prefetch(&seg, None, &[arg(2, Comparator::Less, 500)], 1000).unwrap();
        crate::lock::end_read(&seg, t);
        let mut n = 0;
        while fetch(&seg, &mut q).is_some() {
            n += 1;
        }
        assert_eq!(500, n);
        // Row limit caps the snapshot.
        let t = crate::lock::start_read(&seg);
        let mut q = build_prefetch(&seg, None, &[], 100).unwrap();
        crate::lock::end_read(&seg, t);
        let mut n = 0;
        while fetch(&seg, &mut q).is_some() {
            n += 1;
        }
        assert_eq!(100, n);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_find_record_iteration() {
        let seg = test_seg(1 << 21);
        let recs = fixture(&seg);
        let mut found = Vec::new();
        let mut last = None;
        while let Some(rec) = find_record(&seg, 0, Comparator::Equal, Value::Int(2), last) {
            found.push(rec);
            last = Some(rec);
        }
        let expected: Vec<Record> =
            recs.iter().enumerate().filter(|(i, _)| i % 3 == 2).map(|(_, r)| *r).collect();
        assert_eq!(expected, found);
    }
}
