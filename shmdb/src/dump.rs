// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Whole-segment snapshots.
//!
//! A dump file is a fixed 64-byte header followed by the segment image,
//! byte for byte. Nothing in the image is process-address-dependent — all
//! engine pointers are offsets — so import is a verbatim load plus a reset
//! of the lock's mutable cells.
//!
//! ```text
//! magic:4  version:u32  segment_size:u64  alignment:u32  flags:u32
//! reserved to 64 bytes
//! ```

use crate::error::{DbError, Result};
use crate::lock;
use crate::segment::{Seg, DATA_START, SEGMENT_VERSION, WORD};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::Ordering;

const DUMP_MAGIC: [u8; 4] = *b"SDMP";
const DUMP_HEADER: usize = 64;

fn build_header(seg: &Seg) -> [u8; DUMP_HEADER] {
    let mut h = [0u8; DUMP_HEADER];
    h[0..4].copy_from_slice(&DUMP_MAGIC);
    h[4..8].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
    h[8..16].copy_from_slice(&(seg.len() as u64).to_le_bytes());
    h[16..20].copy_from_slice(&(WORD as u32).to_le_bytes());
    // flags and the reserved tail stay zero.
    h
}

/// Write the segment to `path`. Takes the exclusive writer lock for the
/// duration, so the image is a quiesced snapshot.
pub(crate) fn dump(seg: &Seg, path: &Path) -> Result<()> {
    let token = lock::start_write(seg);
    let result = (|| -> Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(&build_header(seg))?;
        out.write_all(seg.as_slice())?;
        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    })();
    lock::end_write(seg, token);
    if result.is_ok() {
        log::info!("dumped {} bytes to {}", seg.len(), path.display());
    }
    result
}

/// Load a dump into this segment. The segment must be empty (fresh) and
/// sized exactly like the source.
pub(crate) fn import(seg: &Seg, path: &Path) -> Result<()> {
    let hdr = seg.header();
    if hdr.free_top.load(Ordering::Relaxed) != DATA_START
        || hdr.record_first.load(Ordering::Relaxed) != 0
    {
        return Err(DbError::CorruptSegment);
    }

    let mut input = File::open(path)?;
    let mut head = [0u8; DUMP_HEADER];
    input.read_exact(&mut head)?;
    let size = u64::from_le_bytes(head[8..16].try_into().expect("fixed slice"));
    let version = u32::from_le_bytes(head[4..8].try_into().expect("fixed slice"));
    let alignment = u32::from_le_bytes(head[16..20].try_into().expect("fixed slice"));
    if head[0..4] != DUMP_MAGIC
        || version != SEGMENT_VERSION
        || alignment != WORD as u32
        || size != seg.len() as u64
    {
        return Err(DbError::CorruptSegment);
    }

    let mut image = vec![0u8; seg.len()];
    input.read_exact(&mut image).map_err(|_| DbError::CorruptSegment)?;
    seg.write_bytes(0, &image);

    // The lock state belonged to the dumping process; nobody holds it
    // here.
    lock::reset(seg);
    log::info!("imported {} bytes from {}", seg.len(), path.display());
    Ok(())
}
