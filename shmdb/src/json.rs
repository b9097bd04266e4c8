// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! JSON documents as record trees.
//!
//! An object becomes a record with one field per member, each holding a
//! two-field *pair* record `[key, value]`; an array becomes a record with
//! one field per element. Scalars map onto value kinds (numbers to Int or
//! Double, strings to Str, booleans to Int 0/1, null to Null). The top
//! record of a document carries the JSON-document header bit; object and
//! pair records are flagged so the tree re-serializes unambiguously.
//!
//! Parsing allocates records and must run under the writer lock.

use crate::error::{DbError, Result};
use crate::record::Record;
use crate::segment::Seg;
use crate::value::Value;
use crate::{encode, record};
use crate::encode::Word;
use serde_json::Value as Json;
use std::path::Path;

/// Validate without building anything.
pub(crate) fn check(buf: &str) -> Result<()> {
    serde_json::from_str::<serde::de::IgnoredAny>(buf)?;
    Ok(())
}

/// Parse a complete document (object or array) and mark its root.
pub(crate) fn parse_document(seg: &Seg, buf: &str) -> Result<Record> {
    let rec = parse_fragment(seg, buf)?;
    record::set_json_document(seg, rec);
    Ok(rec)
}

/// Parse an object or array without marking it as a document root, for
/// grafting into an existing tree.
pub(crate) fn parse_fragment(seg: &Seg, buf: &str) -> Result<Record> {
    let json: Json = serde_json::from_str(buf)?;
    match &json {
        Json::Object(_) | Json::Array(_) => build_structure(seg, &json),
        _ => Err(DbError::Encode("JSON document root must be an object or array")),
    }
}

pub(crate) fn parse_file(seg: &Seg, path: &Path) -> Result<Record> {
    let buf = std::fs::read_to_string(path)?;
    parse_document(seg, &buf)
}

fn build_structure(seg: &Seg, json: &Json) -> Result<Record> {
    match json {
        Json::Object(members) => {
            let obj = record::create(seg, members.len())?;
            record::set_json_object(seg, obj);
            for (i, (key, value)) in members.iter().enumerate() {
                let pair = record::create(seg, 2)?;
                record::set_json_pair(seg, pair);
                let k = encode::encode(seg, &Value::Str { s: key.clone(), lang: None })?;
                record::set_new_field(seg, pair, 0, k)?;
                let v = build_value(seg, value)?;
                record::set_new_field(seg, pair, 1, v)?;
                let w = encode::encode(seg, &Value::Record(pair))?;
                record::set_new_field(seg, obj, i, w)?;
            }
            Ok(obj)
        }
        Json::Array(elements) => {
            let arr = record::create(seg, elements.len())?;
            for (i, element) in elements.iter().enumerate() {
                let w = build_value(seg, element)?;
                record::set_new_field(seg, arr, i, w)?;
            }
            Ok(arr)
        }
        _ => Err(DbError::Encode("expected a JSON structure")),
    }
}

fn build_value(seg: &Seg, json: &Json) -> Result<Word> {
    let value = match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Int(*b as i64),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Double(n.as_f64().ok_or(DbError::Encode("unrepresentable number"))?)
            }
        }
        Json::String(s) => Value::Str { s: s.clone(), lang: None },
        Json::Object(_) | Json::Array(_) => {
            let child = build_structure(seg, json)?;
            Value::Record(child)
        }
    };
    encode::encode(seg, &value)
}

/// Re-serialize a record tree built by the parser.
pub(crate) fn to_json(seg: &Seg, rec: Record) -> Result<Json> {
    let n = record::arity(seg, rec);
    if record::is_json_object(seg, rec) {
        let mut members = serde_json::Map::with_capacity(n);
        for i in 0..n {
            let w = record::get_field(seg, rec, i)?;
            let pair = encode::record_of(w)
                .filter(|p| record::is_json_pair(seg, *p))
                .ok_or(DbError::TypeMismatch { expected: "object member pair" })?;
            let key = match encode::decode(seg, record::get_field(seg, pair, 0)?)? {
                Value::Str { s, .. } => s,
                _ => return Err(DbError::TypeMismatch { expected: "string member key" }),
            };
            members.insert(key, field_to_json(seg, pair, 1)?);
        }
        Ok(Json::Object(members))
    } else {
        let mut elements = Vec::with_capacity(n);
        for i in 0..n {
            elements.push(field_to_json(seg, rec, i)?);
        }
        Ok(Json::Array(elements))
    }
}

fn field_to_json(seg: &Seg, rec: Record, field: usize) -> Result<Json> {
    let w = record::get_field(seg, rec, field)?;
    if let Some(child) = encode::record_of(w) {
        return to_json(seg, child);
    }
    Ok(match encode::decode(seg, w)? {
        Value::Null => Json::Null,
        Value::Int(i) => Json::Number(i.into()),
        Value::Double(d) => serde_json::Number::from_f64(d)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Str { s, .. } => Json::String(s),
        other => Json::String(format!("{other:?}")),
    })
}
