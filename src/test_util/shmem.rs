//! Shared-memory building blocks for tests: memfd-backed guest RAM and
//! cache-line aligned ring context storage.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use nix::libc;

use crate::memory::MemoryTable;
use crate::proto::{MemoryMap, RegionDesc};

/// A memfd-backed shared memory block mapped into this process.
pub struct SharedBlock {
    fd: OwnedFd,
    ptr: *mut u8,
    size: usize,
}

unsafe impl Send for SharedBlock {}

impl SharedBlock {
    pub fn new(size: usize) -> io::Result<Self> {
        let name = CString::new("pvnet-test-mem").unwrap();
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            ptr: ptr as *mut u8,
            size,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        Ok(self.fd.try_clone()?)
    }
}

impl Drop for SharedBlock {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Guest RAM at a chosen guest-physical base, with a translation table
/// factory for the engine side.
pub struct GuestRam {
    block: SharedBlock,
    gpa_base: u64,
}

impl GuestRam {
    pub fn new(gpa_base: u64, size: usize) -> Self {
        Self {
            block: SharedBlock::new(size).expect("guest ram memfd"),
            gpa_base,
        }
    }

    pub fn gpa_at(&self, offset: usize) -> u64 {
        assert!(offset < self.block.size());
        self.gpa_base + offset as u64
    }

    /// This process's own mapping of the RAM.
    pub fn base_ptr(&self) -> *mut u8 {
        self.block.ptr()
    }

    pub fn fill(&mut self, offset: usize, data: &[u8]) {
        self.block.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.block.as_slice()[offset..offset + len]
    }

    pub fn region_desc(&self) -> RegionDesc {
        RegionDesc {
            gpa: self.gpa_base,
            size: self.block.size() as u64,
            hv_vaddr: self.block.ptr() as u64,
            mmap_offset: 0,
        }
    }

    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.block.try_clone_fd()
    }

    /// Build an engine-side translation table over this RAM (a fresh
    /// mapping of the same backing file).
    pub fn table(&self) -> MemoryTable {
        let mut map = MemoryMap {
            num_regions: 1,
            ..Default::default()
        };
        map.regions[0] = self.region_desc();
        let fds = vec![self.try_clone_fd().expect("clone ram fd")];
        MemoryTable::from_map(&map, &fds).expect("guest ram table")
    }
}

/// Cache-line aligned zeroed allocation for a ring context.
pub struct AlignedCtx {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for AlignedCtx {}

impl AlignedCtx {
    pub fn alloc(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(64), 64).expect("ctx layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for AlignedCtx {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_block_visible_through_clone_mapping() {
        let mut block = SharedBlock::new(8192).unwrap();
        block.as_mut_slice()[100] = 0x5a;

        let fd = block.try_clone_fd().unwrap();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                8192,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        let view = unsafe { std::slice::from_raw_parts(ptr as *const u8, 8192) };
        assert_eq!(view[100], 0x5a);
        unsafe { libc::munmap(ptr, 8192) };
    }

    #[test]
    fn test_aligned_ctx() {
        let ctx = AlignedCtx::alloc(1000);
        assert_eq!(ctx.ptr() as usize % 64, 0);
        assert!(ctx.size() >= 1000);
    }
}
