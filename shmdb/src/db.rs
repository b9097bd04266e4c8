// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! The database handle.
//!
//! [Database] wraps one mapped segment. There are no process-wide
//! globals: every operation goes through a handle, and several handles
//! (in one process or many) may be attached to the same named segment
//! concurrently, synchronizing only through the segment-resident lock.
//!
//! Locking is the caller's contract, as coarse or as fine as needed:
//! wrap mutations in `start_write`/`end_write` (or a [WriteGuard]) and
//! reads in `start_read`/`end_read`. The engine itself never blocks
//! outside those calls.

use crate::error::{DbError, Result};
use crate::index::{IndexId, IndexKind};
use crate::journal::Journal;
use crate::lock::{ReadToken, WriteToken};
use crate::platform;
use crate::query::{Comparator, Query, QueryArg};
use crate::record::{ParentRef, Record};
use crate::segment::Seg;
use crate::value::{Kind, Value};
use crate::{alloc, datetime, dump, encode, index, journal, json, lock, query, record};
use crate::encode::Word;
use std::path::Path;
use std::sync::Mutex;

/// Default permission bits for freshly created named segments.
const DEFAULT_MODE: u32 = 0o600;

pub struct Database {
    seg: Seg,
    journal: Mutex<Option<Journal>>,
}

impl Database {
    // ----- attaching and detaching ---------------------------------

    /// Create the named segment with `size` bytes (rounded up to the page
    /// size), or attach to it if it already exists.
    pub fn attach(name: &str, size: usize) -> Result<Database> {
        Self::attach_mode(name, size, DEFAULT_MODE)
    }

    /// [Database::attach] with explicit permission bits for creation.
    pub fn attach_mode(name: &str, size: usize, mode: u32) -> Result<Database> {
        let map = platform::map_named_create(name, size, mode).map_err(DbError::Attach)?;
        let seg = Seg::init_or_attach(map)?;
        log::debug!("attached segment {name:?} ({} bytes)", seg.len());
        Ok(Self::wrap(seg))
    }

    /// Attach to an existing named segment; fails if it does not exist.
    pub fn attach_existing(name: &str) -> Result<Database> {
        let map = platform::map_named_open(name).map_err(DbError::Attach)?;
        Ok(Self::wrap(Seg::attach_existing(map)?))
    }

    /// Private single-process database backed by an anonymous segment.
    pub fn attach_local(size: usize) -> Result<Database> {
        let map = platform::map_anonymous(size).map_err(DbError::Attach)?;
        Ok(Self::wrap(Seg::init_or_attach(map)?))
    }

    /// [Database::attach] plus journal logging from the start.
    pub fn attach_logged(name: &str, size: usize, journal_path: &Path) -> Result<Database> {
        let db = Self::attach(name, size)?;
        db.start_logging(journal_path)?;
        Ok(db)
    }

    fn wrap(seg: Seg) -> Database {
        Database { seg, journal: Mutex::new(None) }
    }

    /// Remove the named segment from the system. Attached handles keep
    /// their mapping until dropped.
    pub fn delete(name: &str) -> Result<()> {
        platform::delete_named(name).map_err(DbError::Attach)
    }

    /// Total segment size in bytes.
    pub fn size(&self) -> usize {
        self.seg.len()
    }

    /// Bytes still allocatable, counting freelists.
    pub fn free_size(&self) -> u64 {
        alloc::free_size(&self.seg)
    }

    pub(crate) fn seg(&self) -> &Seg {
        &self.seg
    }

    // ----- transactions --------------------------------------------

    /// Block until a shared read hold is granted.
    pub fn start_read(&self) -> ReadToken {
        lock::start_read(&self.seg)
    }

    pub fn end_read(&self, token: ReadToken) {
        lock::end_read(&self.seg, token)
    }

    /// Block until the exclusive write hold is granted.
    pub fn start_write(&self) -> WriteToken {
        lock::start_write(&self.seg)
    }

    pub fn end_write(&self, token: WriteToken) {
        lock::end_write(&self.seg, token)
    }

    /// Scoped read hold.
    pub fn read(&self) -> ReadGuard<'_> {
        ReadGuard { db: self, token: Some(self.start_read()) }
    }

    /// Scoped write hold.
    pub fn write(&self) -> WriteGuard<'_> {
        WriteGuard { db: self, token: Some(self.start_write()) }
    }

    /// Clear a lock left behind by a crashed holder. Only sound once all
    /// participants have been restarted.
    pub fn reset_lock(&self) {
        lock::reset(&self.seg);
        log::warn!("segment lock forcibly reset");
    }

    // ----- records -------------------------------------------------

    /// Create a record of fixed `arity`, all fields Null.
    pub fn create_record(&self, arity: usize) -> Result<Record> {
        let rec = record::create(&self.seg, arity)?;
        self.with_journal(|j, _| j.log_create(rec, arity, false))?;
        Ok(rec)
    }

    /// Create a record bypassing index maintenance; the caller promises
    /// no index applies to it yet.
    pub fn create_raw_record(&self, arity: usize) -> Result<Record> {
        let rec = record::create_raw(&self.seg, arity)?;
        self.with_journal(|j, _| j.log_create(rec, arity, true))?;
        Ok(rec)
    }

    /// Delete a record; denied while other records still reference it.
    pub fn delete_record(&self, rec: Record) -> Result<()> {
        record::delete(&self.seg, rec)?;
        self.with_journal(|j, _| j.log_delete(rec))?;
        Ok(())
    }

    /// The record's arity.
    pub fn record_len(&self, rec: Record) -> usize {
        record::arity(&self.seg, rec)
    }

    pub fn first_record(&self) -> Option<Record> {
        record::first(&self.seg)
    }

    pub fn next_record(&self, rec: Record) -> Option<Record> {
        record::next(&self.seg, rec)
    }

    /// First entry of the record's parent chain: a (record, field) pair
    /// holding a reference to it.
    pub fn first_parent(&self, rec: Record) -> Option<ParentRef> {
        record::first_parent(&self.seg, rec)
    }

    pub fn next_parent(&self, prev: &ParentRef) -> Option<ParentRef> {
        record::next_parent(&self.seg, prev)
    }

    // ----- fields --------------------------------------------------

    pub fn get_field(&self, rec: Record, field: usize) -> Result<Value> {
        encode::decode(&self.seg, record::get_field(&self.seg, rec, field)?)
    }

    /// Raw encoded word of a field.
    pub fn get_field_word(&self, rec: Record, field: usize) -> Result<Word> {
        record::get_field(&self.seg, rec, field)
    }

    pub fn get_field_kind(&self, rec: Record, field: usize) -> Result<Kind> {
        record::field_kind(&self.seg, rec, field)
    }

    /// Encode `value` and store it, releasing whatever the field held.
    pub fn set_field(&self, rec: Record, field: usize, value: &Value) -> Result<()> {
        let w = encode::encode(&self.seg, value)?;
        self.set_field_word(rec, field, w).inspect_err(|_| self.free_encoded(w))
    }

    /// Store an already-encoded word; ownership of the caller's
    /// reference transfers to the field.
    pub fn set_field_word(&self, rec: Record, field: usize, word: Word) -> Result<()> {
        let old = record::get_field(&self.seg, rec, field)?;
        record::set_field(&self.seg, rec, field, word)?;
        self.with_journal(|j, seg| j.log_set_field(seg, rec, field, old, word))?;
        Ok(())
    }

    /// Store into a field known to still be Null, skipping old-value
    /// bookkeeping.
    pub fn set_new_field(&self, rec: Record, field: usize, value: &Value) -> Result<()> {
        let w = encode::encode(&self.seg, value)?;
        record::set_new_field(&self.seg, rec, field, w).inspect_err(|_| self.free_encoded(w))?;
        self.with_journal(|j, seg| j.log_set_field(seg, rec, field, Word::NULL, w))?;
        Ok(())
    }

    pub fn set_int_field(&self, rec: Record, field: usize, value: i64) -> Result<()> {
        self.set_field(rec, field, &Value::Int(value))
    }

    pub fn set_double_field(&self, rec: Record, field: usize, value: f64) -> Result<()> {
        self.set_field(rec, field, &Value::Double(value))
    }

    pub fn set_str_field(&self, rec: Record, field: usize, value: &str) -> Result<()> {
        self.set_field(rec, field, &Value::Str { s: value.to_owned(), lang: None })
    }

    /// Unconditional atomic store of a raw word; no index, parent-chain
    /// or reference maintenance. For counters and flags.
    pub fn set_atomic_field(&self, rec: Record, field: usize, word: Word) -> Result<()> {
        record::set_atomic_field(&self.seg, rec, field, word)
    }

    /// Compare-and-set on the raw cell; returns the observed word, which
    /// equals `expected` exactly when the swap took place.
    pub fn update_atomic_field(
        &self,
        rec: Record,
        field: usize,
        new: Word,
        expected: Word,
    ) -> Result<Word> {
        record::update_atomic_field(&self.seg, rec, field, new, expected)
    }

    /// Atomic fetch-add on an inline-integer field, usable without any
    /// outer locking.
    pub fn add_int_atomic_field(&self, rec: Record, field: usize, delta: i64) -> Result<i64> {
        record::add_int_atomic_field(&self.seg, rec, field, delta)
    }

    // ----- encoded values ------------------------------------------

    /// Encode a value into one word. Encodes that spill (long strings,
    /// doubles, big ints) allocate in the segment and need the writer
    /// lock.
    pub fn encode_value(&self, value: &Value) -> Result<Word> {
        encode::encode(&self.seg, value)
    }

    pub fn decode_value(&self, word: Word) -> Result<Value> {
        encode::decode(&self.seg, word)
    }

    /// Kind carried by an encoded word.
    pub fn get_encoded_type(&self, word: Word) -> Result<Kind> {
        encode::kind_of(&self.seg, word)
    }

    /// Release a word's reference on its spill object; inline words and
    /// record references are no-ops.
    pub fn free_encoded(&self, word: Word) {
        encode::release(&self.seg, word)
    }

    /// Add a reference, for storing one word into several fields.
    pub fn retain_encoded(&self, word: Word) {
        encode::retain(&self.seg, word)
    }

    // ----- queries -------------------------------------------------

    /// Plan a query from a match template (`Var` fields wild, columns
    /// past its length implicitly wild) and an argument list. The query
    /// holds no lock; stream it with [Database::fetch] under a read
    /// hold.
    pub fn make_query(
        &self,
        match_template: Option<&[Value]>,
        args: &[QueryArg],
    ) -> Result<Query> {
        query::build(&self.seg, match_template, args)
    }

    /// Prefetching variant: snapshots up to `row_limit` matching rows
    /// into process-local pages under the caller's current lock, so the
    /// lock may be dropped before iterating.
    pub fn make_query_rc(
        &self,
        match_template: Option<&[Value]>,
        args: &[QueryArg],
        row_limit: usize,
    ) -> Result<Query> {
        query::build_prefetch(&self.seg, match_template, args, row_limit)
    }

    /// Next matching record, or None once exhausted.
    pub fn fetch(&self, q: &mut Query) -> Option<Record> {
        query::fetch(&self.seg, q)
    }

    /// Release a query's plan and prefetched pages. Equivalent to drop.
    pub fn free_query(&self, q: Query) {
        drop(q);
    }

    /// One-shot matcher: the next record after `last` (or the first)
    /// satisfying `column cond value`, in record-list order.
    pub fn find_record(
        &self,
        column: usize,
        cond: Comparator,
        value: &Value,
        last: Option<Record>,
    ) -> Option<Record> {
        query::find_record(&self.seg, column, cond, value.clone(), last)
    }

    // ----- indexes -------------------------------------------------

    /// Register an index on one column and populate it from existing
    /// records. `template`, if given, scopes the index to records
    /// matching it (`Var` fields wild).
    pub fn create_index(
        &self,
        column: usize,
        kind: IndexKind,
        template: Option<Record>,
    ) -> Result<IndexId> {
        index::create(&self.seg, &[column], kind, template)
    }

    /// Multi-column index (hashed only): answers equality probes that
    /// constrain every covered column.
    pub fn create_multi_index(
        &self,
        columns: &[usize],
        kind: IndexKind,
        template: Option<Record>,
    ) -> Result<IndexId> {
        index::create(&self.seg, columns, kind, template)
    }

    pub fn drop_index(&self, id: IndexId) -> Result<()> {
        index::drop_index(&self.seg, id)
    }

    /// First index on `column`, optionally narrowed by kind/template.
    pub fn column_to_index_id(
        &self,
        column: usize,
        kind: Option<IndexKind>,
        template: Option<Record>,
    ) -> Option<IndexId> {
        index::find(&self.seg, &[column], kind, template)
    }

    pub fn multi_column_to_index_id(
        &self,
        columns: &[usize],
        kind: Option<IndexKind>,
        template: Option<Record>,
    ) -> Option<IndexId> {
        index::find(&self.seg, columns, kind, template)
    }

    pub fn get_index_type(&self, id: IndexId) -> Result<IndexKind> {
        index::by_id(&self.seg, id)
            .map(|i| i.kind)
            .ok_or(DbError::Index("no such index"))
    }

    pub fn get_index_template(&self, id: IndexId) -> Result<Option<Record>> {
        index::by_id(&self.seg, id)
            .map(|i| i.template)
            .ok_or(DbError::Index("no such index"))
    }

    pub fn get_all_indexes(&self) -> Vec<IndexId> {
        index::all(&self.seg).into_iter().map(|i| i.id).collect()
    }

    // ----- persistence ---------------------------------------------

    /// Snapshot the segment to `path` under an exclusive writer hold.
    pub fn dump(&self, path: &Path) -> Result<()> {
        dump::dump(&self.seg, path)
    }

    /// Load a snapshot into this (empty, equally sized) segment.
    pub fn import_dump(&self, path: &Path) -> Result<()> {
        dump::import(&self.seg, path)
    }

    /// Append every subsequent mutation through this handle to the
    /// journal at `path`.
    pub fn start_logging(&self, path: &Path) -> Result<()> {
        let mut slot = self.journal.lock().expect("journal mutex poisoned");
        *slot = Some(Journal::open(path)?);
        Ok(())
    }

    /// Stop journaling. Returns whether logging had been active.
    pub fn stop_logging(&self) -> bool {
        let mut slot = self.journal.lock().expect("journal mutex poisoned");
        if let Some(j) = slot.take() {
            log::debug!("journal at {} closed", j.path().display());
            true
        } else {
            false
        }
    }

    /// Apply a journal to this segment under a writer hold. Stops at the
    /// last well-formed entry of a truncated log and reports it corrupt.
    pub fn replay_log(&self, path: &Path) -> Result<u64> {
        let token = self.start_write();
        let result = journal::replay(&self.seg, path);
        self.end_write(token);
        result
    }

    fn with_journal(
        &self,
        op: impl FnOnce(&mut Journal, &Seg) -> Result<()>,
    ) -> Result<()> {
        let mut slot = self.journal.lock().expect("journal mutex poisoned");
        match slot.as_mut() {
            Some(j) => op(j, &self.seg),
            None => Ok(()),
        }
    }

    // ----- JSON documents ------------------------------------------

    /// Parse a JSON document (object or array) into records; the root
    /// carries the document bit.
    pub fn parse_json_document(&self, buf: &str) -> Result<Record> {
        json::parse_document(&self.seg, buf)
    }

    /// Parse a JSON structure without marking it as a document root.
    pub fn parse_json_fragment(&self, buf: &str) -> Result<Record> {
        json::parse_fragment(&self.seg, buf)
    }

    pub fn parse_json_file(&self, path: &Path) -> Result<Record> {
        json::parse_file(&self.seg, path)
    }

    /// Validate JSON without building anything.
    pub fn check_json(buf: &str) -> Result<()> {
        json::check(buf)
    }

    /// Whether this record is the root of a parsed JSON document.
    pub fn is_json_document(&self, rec: Record) -> bool {
        record::is_json_document(&self.seg, rec)
    }

    /// Re-serialize a parsed document tree.
    pub fn json_to_value(&self, rec: Record) -> Result<serde_json::Value> {
        json::to_json(&self.seg, rec)
    }

    // ----- date and time helpers -----------------------------------

    pub fn ymd_to_date(year: i32, month: u32, day: u32) -> Result<i32> {
        datetime::ymd_to_date(year, month, day)
    }

    pub fn date_to_ymd(date: i32) -> Result<(i32, u32, u32)> {
        datetime::date_to_ymd(date)
    }

    pub fn hms_to_time(hour: u32, minute: u32, second: u32, centisec: u32) -> Result<i32> {
        datetime::hms_to_time(hour, minute, second, centisec)
    }

    pub fn time_to_hms(time: i32) -> Result<(u32, u32, u32, u32)> {
        datetime::time_to_hms(time)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        _ = self.stop_logging();
    }
}

/// Shared read hold released on drop.
pub struct ReadGuard<'a> {
    db: &'a Database,
    token: Option<ReadToken>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.db.end_read(token);
        }
    }
}

/// Exclusive write hold released on drop.
pub struct WriteGuard<'a> {
    db: &'a Database,
    token: Option<WriteToken>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.db.end_write(token);
        }
    }
}
