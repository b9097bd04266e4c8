// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! The tagged one-word value encoding.
//!
//! An encoded word packs a [Kind] and either an inline payload or a
//! segment offset into 64 bits. Record offsets are word-aligned, so the
//! low three bits carry the tag:
//!
//! ```text
//! 000  record offset (zero word = Null)
//! 001  small integer, payload in bits 3..64, sign extended
//! 010  spill object offset (kind in the object header)
//! 011  immediate; subtag in bits 3..8, payload in bits 8..64
//!      (Char, Date, Time, FixedPoint, Var)
//! 100  short string; length in bits 3..6, up to 7 bytes in bits 8..64
//! 111  the illegal sentinel (all ones); never produced by encode
//! ```
//!
//! Encoding is deterministic: interned-eligible values encode to the same
//! word every time (see [crate::spill]). Consumers never touch the tag
//! bits; they go through [encode]/[decode]/[kind_of].

use crate::error::{DbError, Result};
use crate::record::Record;
use crate::segment::{Seg, DATA_START, WORD};
use crate::spill;
use crate::value::{Kind, Value};

/// One encoded machine word. Opaque outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Word(pub(crate) u64);

impl Word {
    /// The zero word: always decodes to Null.
    pub const NULL: Word = Word(0);
    /// Distinguished failure sentinel; never equal to any valid word.
    pub const ILLEGAL: Word = Word(u64::MAX);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn is_illegal(self) -> bool {
        self.0 == u64::MAX
    }
}

const TAG_MASK: u64 = 0b111;
const TAG_RECORD: u64 = 0b000;
const TAG_SMALLINT: u64 = 0b001;
const TAG_SPILL: u64 = 0b010;
const TAG_IMMEDIATE: u64 = 0b011;
const TAG_SHORTSTR: u64 = 0b100;

const SUB_CHAR: u64 = 0;
const SUB_DATE: u64 = 1;
const SUB_TIME: u64 = 2;
const SUB_FIXPOINT: u64 = 3;
const SUB_VAR: u64 = 4;

/// Inline integer range: 61-bit two's complement.
const SMALLINT_MIN: i64 = -(1 << 60);
const SMALLINT_MAX: i64 = (1 << 60) - 1;

/// Decimal scale of the FixedPoint kind.
pub const FIXPOINT_SCALE: f64 = 10_000.0;
/// FixedPoint payload is 56 bits; the scaled integer must fit.
const FIXPOINT_LIMIT: i64 = 1 << 55;

/// Longest string that stays inline (no language tag).
const SHORTSTR_MAX: usize = 7;

#[inline]
fn tag(w: Word) -> u64 {
    w.0 & TAG_MASK
}

#[inline]
fn subtag(w: Word) -> u64 {
    (w.0 >> 3) & 0b11111
}

#[inline]
fn immediate(sub: u64, payload: u64) -> Word {
    Word(payload << 8 | sub << 3 | TAG_IMMEDIATE)
}

#[inline]
fn immediate_i32(w: Word) -> i32 {
    (w.0 >> 8) as u32 as i32
}

#[inline]
fn spill_word(off: u64) -> Word {
    debug_assert_eq!(0, off & TAG_MASK);
    Word(off | TAG_SPILL)
}

#[inline]
pub(crate) fn spill_offset(w: Word) -> Option<u64> {
    (tag(w) == TAG_SPILL).then(|| w.0 & !TAG_MASK)
}

fn shortstr(bytes: &[u8]) -> Word {
    debug_assert!(bytes.len() <= SHORTSTR_MAX);
    let mut w = (bytes.len() as u64) << 3 | TAG_SHORTSTR;
    for (i, b) in bytes.iter().enumerate() {
        w |= (*b as u64) << (8 * (i + 1));
    }
    Word(w)
}

fn shortstr_bytes(w: Word) -> Vec<u8> {
    let len = ((w.0 >> 3) & 0b111) as usize;
    (0..len).map(|i| (w.0 >> (8 * (i + 1))) as u8).collect()
}

/// Intern an optional companion string, returning its offset or 0.
fn companion_in(seg: &Seg, s: Option<&str>) -> Result<u64> {
    match s {
        Some(s) => spill::intern(seg, Kind::Str, s.as_bytes(), 0),
        None => Ok(0),
    }
}

fn companion_out(seg: &Seg, off: u64) -> Option<String> {
    (off != 0).then(|| String::from_utf8_lossy(spill::obj_bytes(seg, off)).into_owned())
}

/// Encode a value into one word, spilling into the segment as needed.
/// Allocating encodes require the writer lock.
pub(crate) fn encode(seg: &Seg, value: &Value) -> Result<Word> {
    Ok(match value {
        Value::Null => Word::NULL,
        Value::Record(r) => {
            debug_assert!(r.offset() >= DATA_START && r.offset() % WORD as u64 == 0);
            Word(r.offset())
        }
        Value::Int(i) if (SMALLINT_MIN..=SMALLINT_MAX).contains(i) => {
            Word((*i as u64) << 3 | TAG_SMALLINT)
        }
        Value::Int(i) => spill_word(spill::alloc_box(seg, Kind::Int, *i as u64)?),
        Value::Double(d) => spill_word(spill::alloc_box(seg, Kind::Double, d.to_bits())?),
        Value::FixedPoint(d) => {
            let scaled = (d * FIXPOINT_SCALE).round();
            if !scaled.is_finite() || scaled.abs() >= FIXPOINT_LIMIT as f64 {
                return Err(DbError::Encode("fixed-point value out of scale"));
            }
            immediate(SUB_FIXPOINT, (scaled as i64 as u64) & (u64::MAX >> 8))
        }
        Value::Str { s, lang: None } if s.len() <= SHORTSTR_MAX => shortstr(s.as_bytes()),
        Value::Str { s, lang } => {
            let companion = companion_in(seg, lang.as_deref())?;
            spill_word(spill::intern(seg, Kind::Str, s.as_bytes(), companion)?)
        }
        Value::XmlLiteral { s, xsd_type } => {
            let companion = companion_in(seg, Some(xsd_type))?;
            spill_word(spill::intern(seg, Kind::XmlLiteral, s.as_bytes(), companion)?)
        }
        Value::Uri { s, prefix } => {
            let companion = companion_in(seg, prefix.as_deref())?;
            spill_word(spill::intern(seg, Kind::Uri, s.as_bytes(), companion)?)
        }
        Value::AnonConst(s) => spill_word(spill::intern(seg, Kind::AnonConst, s.as_bytes(), 0)?),
        Value::Blob { bytes, media_type } => {
            let companion = companion_in(seg, media_type.as_deref())?;
            spill_word(spill::alloc_str_obj(seg, Kind::Blob, bytes, companion)?)
        }
        Value::Char(c) => immediate(SUB_CHAR, *c as u32 as u64),
        Value::Date(d) => immediate(SUB_DATE, *d as u32 as u64),
        Value::Time(t) => immediate(SUB_TIME, *t as u32 as u64),
        Value::Var(n) => immediate(SUB_VAR, *n as u64),
    })
}

/// Kind of an encoded word without materializing the payload.
pub(crate) fn kind_of(seg: &Seg, w: Word) -> Result<Kind> {
    if w.is_null() {
        return Ok(Kind::Null);
    }
    match tag(w) {
        TAG_RECORD => Ok(Kind::Record),
        TAG_SMALLINT => Ok(Kind::Int),
        TAG_SPILL => {
            let off = w.0 & !TAG_MASK;
            spill::obj_kind(seg, off).ok_or(DbError::TypeMismatch { expected: "spill object" })
        }
        TAG_IMMEDIATE => match subtag(w) {
            SUB_CHAR => Ok(Kind::Char),
            SUB_DATE => Ok(Kind::Date),
            SUB_TIME => Ok(Kind::Time),
            SUB_FIXPOINT => Ok(Kind::FixedPoint),
            SUB_VAR => Ok(Kind::Var),
            _ => Err(DbError::TypeMismatch { expected: "known immediate subtag" }),
        },
        TAG_SHORTSTR => Ok(Kind::Str),
        _ => Err(DbError::TypeMismatch { expected: "valid encoded word" }),
    }
}

/// Decode a word back into a value.
pub(crate) fn decode(seg: &Seg, w: Word) -> Result<Value> {
    if w.is_null() {
        return Ok(Value::Null);
    }
    Ok(match tag(w) {
        TAG_RECORD => Value::Record(Record::from_offset(w.0)),
        TAG_SMALLINT => Value::Int((w.0 as i64) >> 3),
        TAG_SHORTSTR => Value::Str {
            s: String::from_utf8_lossy(&shortstr_bytes(w)).into_owned(),
            lang: None,
        },
        TAG_IMMEDIATE => match subtag(w) {
            SUB_CHAR => Value::Char(
                char::from_u32((w.0 >> 8) as u32)
                    .ok_or(DbError::TypeMismatch { expected: "scalar char payload" })?,
            ),
            SUB_DATE => Value::Date(immediate_i32(w)),
            SUB_TIME => Value::Time(immediate_i32(w)),
            SUB_FIXPOINT => {
                // Sign-extend the 56-bit scaled integer.
                let scaled = (w.0 as i64) >> 8;
                Value::FixedPoint(scaled as f64 / FIXPOINT_SCALE)
            }
            SUB_VAR => Value::Var((w.0 >> 8) as u32),
            _ => return Err(DbError::TypeMismatch { expected: "known immediate subtag" }),
        },
        TAG_SPILL => {
            let off = w.0 & !TAG_MASK;
            let kind = spill::obj_kind(seg, off)
                .ok_or(DbError::TypeMismatch { expected: "spill object" })?;
            let companion = || companion_out(seg, spill::obj_companion(seg, off));
            let body = || String::from_utf8_lossy(spill::obj_bytes(seg, off)).into_owned();
            match kind {
                Kind::Int => Value::Int(spill::box_payload(seg, off) as i64),
                Kind::Double => Value::Double(f64::from_bits(spill::box_payload(seg, off))),
                Kind::Str => Value::Str { s: body(), lang: companion() },
                Kind::Uri => Value::Uri { s: body(), prefix: companion() },
                Kind::XmlLiteral => Value::XmlLiteral {
                    s: body(),
                    xsd_type: companion().unwrap_or_default(),
                },
                Kind::AnonConst => Value::AnonConst(body()),
                Kind::Blob => Value::Blob {
                    bytes: spill::obj_bytes(seg, off).to_vec(),
                    media_type: companion(),
                },
                _ => return Err(DbError::TypeMismatch { expected: "spillable kind" }),
            }
        }
        _ => return Err(DbError::TypeMismatch { expected: "valid encoded word" }),
    })
}

/// The record a word references, if it is a record reference.
#[inline]
pub(crate) fn record_of(w: Word) -> Option<Record> {
    (!w.is_null() && tag(w) == TAG_RECORD).then(|| Record::from_offset(w.0))
}

/// Inline-integer payload, if the word is a small int.
#[inline]
pub(crate) fn inline_int(w: Word) -> Option<i64> {
    (tag(w) == TAG_SMALLINT).then(|| (w.0 as i64) >> 3)
}

/// Encode an integer if it fits inline; never allocates.
#[inline]
pub(crate) fn inline_int_word(v: i64) -> Option<Word> {
    (SMALLINT_MIN..=SMALLINT_MAX)
        .contains(&v)
        .then(|| Word((v as u64) << 3 | TAG_SMALLINT))
}

/// Add a reference for a word about to be stored in a second place.
/// Inline words and record references are no-ops.
pub(crate) fn retain(seg: &Seg, w: Word) {
    if let Some(off) = spill_offset(w) {
        spill::retain_obj(seg, off);
    }
}

/// Release the reference a word holds on its spill object, if any.
/// Freeing an inline word is a no-op, as is freeing a record reference
/// (records are deleted explicitly, never by refcount).
pub(crate) fn release(seg: &Seg, w: Word) {
    if let Some(off) = spill_offset(w) {
        spill::release_obj(seg, off);
    }
}
