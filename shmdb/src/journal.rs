// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Append-only operation journal.
//!
//! When logging is enabled, every mutating record operation appends one
//! self-describing entry:
//!
//! ```text
//! op:u8  record_offset:u64  field:u16  old_word:u64  new_word:u64
//! aux_len:u32  aux_bytes
//! ```
//!
//! Inline words are position-independent and replay verbatim; record
//! references and spilled values carry a re-encodable payload in
//! `aux_bytes`. Entries appear in the serial order established by the
//! writer lock, so sequential replay onto an empty (or snapshot-restored)
//! segment reconstructs the post-state exactly. Record offsets in the log
//! are those of the *source* segment; replay keeps an old-to-new mapping.
//!
//! A log that ends mid-entry is corrupt: replay applies every well-formed
//! entry and then reports [DbError::CorruptJournal].

use crate::error::{DbError, Result};
use crate::record::Record;
use crate::segment::Seg;
use crate::value::{Kind, Value};
use crate::{encode, record};
use crate::encode::Word;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const OP_CREATE: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_SET_FIELD: u8 = 3;

/// Fixed-size prefix of every entry.
const ENTRY_FIXED: usize = 1 + 8 + 2 + 8 + 8 + 4;

/// An open journal file. Owned by one database handle; entries are
/// flushed as they are written.
pub(crate) struct Journal {
    out: BufWriter<File>,
    path: PathBuf,
}

impl Journal {
    pub(crate) fn open(path: &Path) -> Result<Journal> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        log::debug!("journal logging to {}", path.display());
        Ok(Journal { out: BufWriter::new(file), path: path.to_path_buf() })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn entry(
        &mut self,
        op: u8,
        rec_off: u64,
        field: u16,
        old: u64,
        new: u64,
        aux: &[u8],
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(ENTRY_FIXED + aux.len());
        buf.push(op);
        buf.extend_from_slice(&rec_off.to_le_bytes());
        buf.extend_from_slice(&field.to_le_bytes());
        buf.extend_from_slice(&old.to_le_bytes());
        buf.extend_from_slice(&new.to_le_bytes());
        buf.extend_from_slice(&(aux.len() as u32).to_le_bytes());
        buf.extend_from_slice(aux);
        self.out.write_all(&buf)?;
        self.out.flush()?;
        Ok(())
    }

    /// Record creation; `raw` marks a creation that bypassed index
    /// maintenance.
    pub(crate) fn log_create(&mut self, rec: Record, arity: usize, raw: bool) -> Result<()> {
        self.entry(OP_CREATE, rec.offset(), raw as u16, 0, arity as u64, &[])
    }

    pub(crate) fn log_delete(&mut self, rec: Record) -> Result<()> {
        self.entry(OP_DELETE, rec.offset(), 0, 0, 0, &[])
    }

    pub(crate) fn log_set_field(
        &mut self,
        seg: &Seg,
        rec: Record,
        field: usize,
        old: Word,
        new: Word,
    ) -> Result<()> {
        let field = u16::try_from(field)
            .map_err(|_| DbError::Encode("journaled field number exceeds 16 bits"))?;
        let aux = match aux_payload(seg, new)? {
            Some(bytes) => bytes,
            None => Vec::new(),
        };
        self.entry(OP_SET_FIELD, rec.offset(), field, old.0, new.0, &aux)
    }
}

/// Serialize a word's value when the word itself would not survive
/// replay into another segment. Inline words need nothing.
fn aux_payload(seg: &Seg, w: Word) -> Result<Option<Vec<u8>>> {
    if w.is_null() {
        return Ok(None);
    }
    if let Some(rec) = encode::record_of(w) {
        let mut buf = vec![Kind::Record as u8];
        buf.extend_from_slice(&rec.offset().to_le_bytes());
        return Ok(Some(buf));
    }
    if encode::spill_offset(w).is_none() {
        return Ok(None);
    }
    let value = encode::decode(seg, w)?;
    let mut buf = vec![value.kind() as u8];
    fn put_str(buf: &mut Vec<u8>, s: &[u8]) {
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s);
    }
    fn put_opt(buf: &mut Vec<u8>, s: Option<&str>) {
        match s {
            Some(s) => {
                buf.push(1);
                put_str(buf, s.as_bytes());
            }
            None => buf.push(0),
        }
    }
    match &value {
        Value::Int(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Double(d) => buf.extend_from_slice(&d.to_bits().to_le_bytes()),
        Value::Str { s, lang } => {
            put_str(&mut buf, s.as_bytes());
            put_opt(&mut buf, lang.as_deref());
        }
        Value::Uri { s, prefix } => {
            put_str(&mut buf, s.as_bytes());
            put_opt(&mut buf, prefix.as_deref());
        }
        Value::XmlLiteral { s, xsd_type } => {
            put_str(&mut buf, s.as_bytes());
            put_opt(&mut buf, Some(xsd_type));
        }
        Value::AnonConst(s) => put_str(&mut buf, s.as_bytes()),
        Value::Blob { bytes, media_type } => {
            put_str(&mut buf, bytes);
            put_opt(&mut buf, media_type.as_deref());
        }
        other => {
            debug_assert!(false, "inline value {other:?} needs no aux payload");
            return Ok(None);
        }
    }
    Ok(Some(buf))
}

struct AuxReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> AuxReader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(out)
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.bytes(4)?.try_into().ok()?))
    }

    fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.bytes(8)?.try_into().ok()?))
    }

    fn str(&mut self) -> Option<String> {
        let n = self.u32()? as usize;
        Some(String::from_utf8_lossy(self.bytes(n)?).into_owned())
    }

    fn opt_str(&mut self) -> Option<Option<String>> {
        match self.u8()? {
            0 => Some(None),
            _ => Some(Some(self.str()?)),
        }
    }
}

/// Parse an aux payload back into a value; record references come back as
/// the *source* offset and must be remapped by the caller.
fn parse_aux(aux: &[u8]) -> Option<(Value, Option<u64>)> {
    let mut r = AuxReader { buf: aux, pos: 0 };
    let kind = Kind::from_u8(r.u8()?)?;
    let value = match kind {
        Kind::Record => return Some((Value::Null, Some(r.u64()?))),
        Kind::Int => Value::Int(r.u64()? as i64),
        Kind::Double => Value::Double(f64::from_bits(r.u64()?)),
        Kind::Str => Value::Str { s: r.str()?, lang: r.opt_str()? },
        Kind::Uri => Value::Uri { s: r.str()?, prefix: r.opt_str()? },
        Kind::XmlLiteral => {
            Value::XmlLiteral { s: r.str()?, xsd_type: r.opt_str()?.unwrap_or_default() }
        }
        Kind::AnonConst => Value::AnonConst(r.str()?),
        Kind::Blob => {
            let n = r.u32()? as usize;
            Value::Blob { bytes: r.bytes(n)?.to_vec(), media_type: r.opt_str()? }
        }
        _ => return None,
    };
    Some((value, None))
}

/// Apply a journal to the segment. The caller holds the writer lock for
/// the whole replay. Returns the number of entries applied;
/// [DbError::CorruptJournal] if the log ends mid-entry, with every
/// well-formed entry already applied.
pub(crate) fn replay(seg: &Seg, path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut input = BufReader::new(file);
    let mut applied = 0u64;
    let mut pos = 0u64;
    // Source record offset -> replayed record.
    let mut remap: HashMap<u64, Record> = HashMap::new();

    loop {
        let mut fixed = [0u8; ENTRY_FIXED];
        match read_exact_or_eof(&mut input, &mut fixed)? {
            ReadOutcome::Eof => break,
            ReadOutcome::Partial => return Err(DbError::CorruptJournal { offset: pos }),
            ReadOutcome::Full => {}
        }
        let op = fixed[0];
        let rec_off = u64::from_le_bytes(fixed[1..9].try_into().expect("fixed slice"));
        let field = u16::from_le_bytes(fixed[9..11].try_into().expect("fixed slice"));
        let new = u64::from_le_bytes(fixed[19..27].try_into().expect("fixed slice"));
        let aux_len = u32::from_le_bytes(fixed[27..31].try_into().expect("fixed slice")) as usize;
        let mut aux = vec![0u8; aux_len];
        if aux_len > 0 {
            match read_exact_or_eof(&mut input, &mut aux)? {
                ReadOutcome::Full => {}
                _ => return Err(DbError::CorruptJournal { offset: pos }),
            }
        }
        pos += (ENTRY_FIXED + aux_len) as u64;

        match op {
            OP_CREATE => {
                let arity = new as usize;
                let rec = if field != 0 {
                    record::create_raw(seg, arity)?
                } else {
                    record::create(seg, arity)?
                };
                remap.insert(rec_off, rec);
            }
            OP_DELETE => {
                let rec = resolve(seg, &remap, rec_off, pos)?;
                record::delete(seg, rec)?;
                remap.remove(&rec_off);
            }
            OP_SET_FIELD => {
                let rec = resolve(seg, &remap, rec_off, pos)?;
                let word = if aux.is_empty() {
                    Word(new)
                } else {
                    let (value, src_rec) =
                        parse_aux(&aux).ok_or(DbError::CorruptJournal { offset: pos })?;
                    match src_rec {
                        Some(src) => {
                            let target = resolve(seg, &remap, src, pos)?;
                            encode::encode(seg, &Value::Record(target))?
                        }
                        None => encode::encode(seg, &value)?,
                    }
                };
                record::set_field(seg, rec, field as usize, word)?;
            }
            _ => return Err(DbError::CorruptJournal { offset: pos }),
        }
        applied += 1;
    }
    log::info!("replayed {applied} journal entries from {}", path.display());
    Ok(applied)
}

/// Resolve a source-segment record offset: records created during the
/// log are remapped; anything older must come from the snapshot the
/// target was restored from, where offsets are identical.
fn resolve(seg: &Seg, remap: &HashMap<u64, Record>, off: u64, pos: u64) -> Result<Record> {
    if let Some(rec) = remap.get(&off) {
        return Ok(*rec);
    }
    if seg.check_off(off, crate::record::RECORD_HDR as usize) {
        return Ok(Record::from_offset(off));
    }
    Err(DbError::CorruptJournal { offset: pos })
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(input: &mut impl Read, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = input.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Partial });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}
