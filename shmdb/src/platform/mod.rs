// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

//! Platform mapping of the shared segment.
//!
//! A segment is identified by a user-visible name; the mapping between that
//! name and the OS primitive (POSIX `shm_open`, Windows named file mapping,
//! or an anonymous mapping for local mode) lives here. Everything above
//! this module works purely with the mapped byte range.

use std::ffi::CString;
use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

/// How the mapped bytes are backed, and what cleanup they need.
pub(crate) enum SegmentBacking {
    /// Named OS object; `owns_name` is set for the creator so that dropping
    /// the creator does *not* unlink — segments outlive processes and are
    /// removed only by an explicit delete.
    Named { name: CString },
    /// Anonymous segment for local (single-process) mode.
    Anon,
}

/// A shared segment mapped into this process.
///
/// All engine data lives inside `[ptr, ptr + len)`; internal pointers are
/// offsets from `ptr`, so remapping at a different address is harmless.
pub(crate) struct SegmentMap {
    ptr: *mut u8,
    len: usize,
    backing: SegmentBacking,
    #[cfg(unix)]
    _fd: io_lifetimes::OwnedFd,
    #[cfg(windows)]
    _handle: OwnedMappingHandle,
}

// SAFETY: the mapping is plain shared memory; all mutable engine state in
// it is accessed through atomics under the segment lock discipline.
unsafe impl Send for SegmentMap {}
unsafe impl Sync for SegmentMap {}

impl SegmentMap {
    pub(crate) fn base(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is valid for len bytes for its whole lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// OS-level name of the backing object, for diagnostics.
    pub(crate) fn backing_name(&self) -> Option<&std::ffi::CStr> {
        match &self.backing {
            SegmentBacking::Named { name } => Some(name.as_c_str()),
            SegmentBacking::Anon => None,
        }
    }
}

/// Compose the OS object name for a user-visible segment name.
pub(crate) fn segment_os_name(name: &str) -> io::Result<CString> {
    let composed = format!("/shmdb-{name}");
    CString::new(composed).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "segment name contains NUL")
    })
}

/// Round a requested segment size up to the platform page size.
pub(crate) fn page_aligned_size(size: usize) -> usize {
    let page = os_page_size();
    ((size.max(1) - 1) & !(page - 1)) + page
}
