// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Embeddable shared-memory record database.
//!
//! One contiguous named segment holds everything: records (fixed-arity
//! vectors of tagged one-word values), spilled values with an interned
//! string pool, ordered and hashed indexes, and the reader-writer lock
//! that serializes mutation. All internal pointers are offsets from the
//! segment base, so any number of processes may map the segment at
//! different addresses and work on it concurrently.
//!
//! ```no_run
//! use shmdb::{Database, Value, Comparator, QueryArg, IndexKind};
//!
//! let db = Database::attach("inventory", 16 << 20)?;
//! {
//!     let _w = db.write();
//!     let rec = db.create_record(3)?;
//!     db.set_int_field(rec, 0, 42)?;
//!     db.set_str_field(rec, 1, "bolt")?;
//!     db.create_index(0, IndexKind::Ordered, None)?;
//! }
//! {
//!     let _r = db.read();
//!     let mut q = db.make_query(
//!         None,
//!         &[QueryArg { column: 0, cond: Comparator::Less, value: Value::Int(100) }],
//!     )?;
//!     while let Some(rec) = db.fetch(&mut q) {
//!         println!("{:?}", db.get_field(rec, 1)?);
//!     }
//! }
//! # Ok::<(), shmdb::DbError>(())
//! ```

mod alloc;
mod datetime;
mod db;
mod dump;
mod encode;
mod error;
mod index;
mod journal;
mod json;
mod lock;
mod platform;
mod query;
mod record;
mod segment;
mod spill;
mod value;

pub use datetime::{
    current_local_date, current_local_time, current_utc_date, current_utc_time,
    date_to_ymd, format_iso_datetime, hms_to_time, parse_iso_date, parse_iso_time,
    time_to_hms, ymd_to_date, TIME_GRID,
};
pub use db::{Database, ReadGuard, WriteGuard};
pub use encode::{Word, FIXPOINT_SCALE};
pub use error::{DbError, Result};
pub use index::{IndexId, IndexKind};
pub use lock::{ReadToken, WriteToken};
pub use query::{Comparator, Query, QueryArg};
pub use record::{ParentRef, Record};
pub use value::{Kind, Value};
