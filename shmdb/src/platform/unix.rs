// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

use super::{page_aligned_size, segment_os_name, SegmentBacking, SegmentMap};
use io_lifetimes::OwnedFd;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::fs::MetadataExt;
use std::ptr::NonNull;

pub(crate) fn os_page_size() -> usize {
    page_size::get()
}

fn fd_size(fd: OwnedFd) -> io::Result<(OwnedFd, usize)> {
    let file: File = fd.into();
    let size = file.metadata()?.size() as usize;
    Ok((file.into(), size))
}

fn map_fd(fd: OwnedFd, len: usize, backing: SegmentBacking) -> io::Result<SegmentMap> {
    let length =
        NonZeroUsize::new(len).ok_or_else(|| io::Error::other("zero-size segment"))?;
    // SAFETY: mapping a file-backed range we own; no fixed address requested.
    let ptr = unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            &fd,
            0,
        )?
    };
    Ok(SegmentMap {
        ptr: ptr.as_ptr() as *mut u8,
        len,
        backing,
        _fd: fd,
    })
}

#[cfg(target_os = "linux")]
fn open_anon_fd() -> io::Result<OwnedFd> {
    if let Ok(memfd) = memfd::MemfdOptions::default().create("shmdb-local") {
        Ok(memfd.into_file().into())
    } else {
        open_anon_fd_generic()
    }
}

#[cfg(not(target_os = "linux"))]
fn open_anon_fd() -> io::Result<OwnedFd> {
    open_anon_fd_generic()
}

fn open_anon_fd_generic() -> io::Result<OwnedFd> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static ANON_ID: AtomicU32 = AtomicU32::new(0);
    let path = format!(
        "/shmdb-local-{}-{}",
        std::process::id(),
        ANON_ID.fetch_add(1, Ordering::SeqCst)
    );
    let fd = shm_open(path.as_bytes(), OFlag::O_CREAT | OFlag::O_RDWR, Mode::empty())?;
    _ = shm_unlink(path.as_bytes());
    Ok(fd.into())
}

/// Anonymous segment for local mode: no name, gone when the handle drops.
pub(crate) fn map_anonymous(size: usize) -> io::Result<SegmentMap> {
    let size = page_aligned_size(size);
    let fd = open_anon_fd()?;
    ftruncate(&fd, size as libc::off_t)?;
    map_fd(fd, size, SegmentBacking::Anon)
}

/// Create the named segment, or attach to it if it already exists. An
/// existing segment keeps its size; the size argument only applies to a
/// fresh one.
pub(crate) fn map_named_create(name: &str, size: usize, mode: u32) -> io::Result<SegmentMap> {
    let os_name = segment_os_name(name)?;
    let size = page_aligned_size(size);
    let fd = shm_open(
        os_name.as_c_str(),
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::from_bits_truncate(mode as libc::mode_t),
    )?;
    let (fd, existing) = fd_size(fd.into())?;
    let len = if existing > 0 {
        existing
    } else {
        ftruncate(&fd, size as libc::off_t)?;
        size
    };
    map_fd(fd, len, SegmentBacking::Named { name: os_name })
}

/// Attach to an existing named segment; never creates one.
pub(crate) fn map_named_open(name: &str) -> io::Result<SegmentMap> {
    let os_name = segment_os_name(name)?;
    let fd = shm_open(os_name.as_c_str(), OFlag::O_RDWR, Mode::empty())?;
    let (fd, len) = fd_size(fd.into())?;
    if len == 0 {
        return Err(io::Error::other("segment exists but has zero size"));
    }
    map_fd(fd, len, SegmentBacking::Named { name: os_name })
}

/// Remove the named segment from the system. Live mappings stay valid
/// until their holders detach.
pub(crate) fn delete_named(name: &str) -> io::Result<()> {
    let os_name = segment_os_name(name)?;
    shm_unlink(os_name.as_c_str())?;
    Ok(())
}

impl Drop for SegmentMap {
    fn drop(&mut self) {
        // Detach only; a named object persists until explicitly deleted.
        if let Some(ptr) = NonNull::new(self.ptr as *mut libc::c_void) {
            // SAFETY: exactly the range returned by mmap above.
            unsafe {
                _ = munmap(ptr, self.len);
            }
        }
        _ = &self.backing;
    }
}
