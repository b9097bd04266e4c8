// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Errors surfaced by the database engine.
///
/// The engine never retries internally and never unwinds through the lock
/// primitive; every failure is reported to the caller, which decides
/// between retrying the logical operation, failing the request, or tearing
/// the segment down.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The segment could not be created, found, or mapped.
    #[error("failed to attach segment: {0}")]
    Attach(#[source] io::Error),

    /// The segment allocator cannot satisfy the request. Recoverable: the
    /// logical operation was not applied.
    #[error("shared segment out of space")]
    OutOfSpace,

    /// Field index outside the record's arity.
    #[error("field {field} out of range for record of length {arity}")]
    OutOfRange { field: usize, arity: usize },

    /// An encoded word whose kind does not admit the requested operation.
    #[error("type mismatch: expected {expected}")]
    TypeMismatch { expected: &'static str },

    /// Delete denied: the record's parent chain is non-empty.
    #[error("record is still referenced by other records")]
    HasReferences,

    /// Query constraint names a column past the match template length.
    #[error("no such column: {0}")]
    NoSuchColumn(usize),

    /// Comparator and value kind cannot be combined.
    #[error("invalid query constraint on column {column}")]
    InvalidConstraint { column: usize },

    /// Header magic or version mismatch on attach or dump import.
    #[error("segment header corrupt or incompatible")]
    CorruptSegment,

    /// Journal file is malformed or truncated mid-record.
    #[error("journal corrupt at byte offset {offset}")]
    CorruptJournal { offset: u64 },

    /// The value cannot be represented (e.g. a fixed-point out of scale).
    #[error("value not encodable: {0}")]
    Encode(&'static str),

    /// Index creation or lookup was misconfigured.
    #[error("index configuration: {0}")]
    Index(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("malformed JSON document: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
