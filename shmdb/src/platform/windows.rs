// Copyright 2024-Present the shmdb authors.
// SPDX-License-Identifier: Apache-2.0

use super::{page_aligned_size, segment_os_name, SegmentBacking, SegmentMap};
use std::io;
use std::mem::MaybeUninit;
use std::ptr::null_mut;
use winapi::shared::minwindef::DWORD;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{
    MapViewOfFile, UnmapViewOfFile, VirtualQuery, FILE_MAP_WRITE,
};
use winapi::um::winbase::{CreateFileMappingA, OpenFileMappingA};
use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION, PAGE_READWRITE};

pub(crate) struct OwnedMappingHandle(HANDLE);

// SAFETY: a file-mapping handle may be used from any thread.
unsafe impl Send for OwnedMappingHandle {}
unsafe impl Sync for OwnedMappingHandle {}

impl Drop for OwnedMappingHandle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

pub(crate) fn os_page_size() -> usize {
    use winapi::um::sysinfoapi::GetSystemInfo;
    let mut info = MaybeUninit::uninit();
    // SAFETY: GetSystemInfo always fills the struct.
    unsafe {
        GetSystemInfo(info.as_mut_ptr());
        (*info.as_ptr()).dwPageSize as usize
    }
}

fn map_view(handle: OwnedMappingHandle, backing: SegmentBacking) -> io::Result<SegmentMap> {
    // Size 0 maps the whole section.
    let ptr = unsafe { MapViewOfFile(handle.0, FILE_MAP_WRITE, 0, 0, 0) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    // The section size is only discoverable from the view itself.
    let len = unsafe {
        let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
        if VirtualQuery(ptr, info.as_mut_ptr(), size_of::<MEMORY_BASIC_INFORMATION>()) == 0 {
            UnmapViewOfFile(ptr);
            return Err(io::Error::last_os_error());
        }
        info.assume_init().RegionSize
    };
    Ok(SegmentMap {
        ptr: ptr as *mut u8,
        len,
        backing,
        _handle: handle,
    })
}

pub(crate) fn map_anonymous(size: usize) -> io::Result<SegmentMap> {
    let size = page_aligned_size(size);
    let handle = unsafe {
        CreateFileMappingA(
            INVALID_HANDLE_VALUE,
            null_mut(),
            PAGE_READWRITE,
            (size as u64 >> 32) as DWORD,
            size as DWORD,
            null_mut(),
        )
    };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    map_view(OwnedMappingHandle(handle), SegmentBacking::Anon)
}

pub(crate) fn map_named_create(name: &str, size: usize, _mode: u32) -> io::Result<SegmentMap> {
    let os_name = segment_os_name(name)?;
    let size = page_aligned_size(size);
    let handle = unsafe {
        CreateFileMappingA(
            INVALID_HANDLE_VALUE,
            null_mut(),
            PAGE_READWRITE,
            (size as u64 >> 32) as DWORD,
            size as DWORD,
            os_name.as_ptr(),
        )
    };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    map_view(
        OwnedMappingHandle(handle),
        SegmentBacking::Named { name: os_name },
    )
}

pub(crate) fn map_named_open(name: &str) -> io::Result<SegmentMap> {
    let os_name = segment_os_name(name)?;
    let handle = unsafe { OpenFileMappingA(FILE_MAP_WRITE, 0, os_name.as_ptr()) };
    if handle.is_null() {
        return Err(io::Error::last_os_error());
    }
    map_view(
        OwnedMappingHandle(handle),
        SegmentBacking::Named { name: os_name },
    )
}

pub(crate) fn delete_named(_name: &str) -> io::Result<()> {
    // Named sections vanish with their last handle; there is nothing to
    // unlink eagerly on this platform.
    Ok(())
}

impl Drop for SegmentMap {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(self.ptr.cast());
        }
        _ = &self.backing;
    }
}
