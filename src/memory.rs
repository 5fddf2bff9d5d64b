//! Guest memory map: mmapped region table and GPA to HVA translation.
//!
//! The table is installed by the control thread while the dataplane worker
//! is halted and is read-only afterwards, except for the MRU swap performed
//! by `translate` itself. The swap is only sound with a single worker; a
//! multi-worker extension must keep a per-worker cached region index
//! instead.

use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;

use nix::libc;
use thiserror::Error;
use tracing::debug;

use crate::proto::{MemoryMap, RegionDesc};

/// Maximum number of regions a guest may install.
pub const MAX_REGIONS: usize = 8;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("too many memory regions: {0}")]
    TooManyRegions(usize),
    #[error("region/fd count mismatch: {regions} regions, {fds} fds")]
    FdCountMismatch { regions: usize, fds: usize },
    #[error("empty memory region at index {0}")]
    EmptyRegion(usize),
    #[error("mmap of region {index} failed: {source}")]
    Mmap {
        index: usize,
        source: std::io::Error,
    },
}

/// One mmapped guest memory region.
///
/// The backing file descriptor is mapped from offset 0 with a length of
/// `mmap_offset + size`: the offset argument of mmap() must be page aligned
/// and the hypervisor may hand us huge-page backed fds, so the usable range
/// starts at `mmap_offset` inside the mapping.
pub struct MemoryRegion {
    gpa_start: u64,
    gpa_end: u64,
    size: u64,
    hv_vaddr: u64,
    mmap_offset: u64,
    mmap_addr: *mut u8,
    mmap_len: usize,
    va_start: *mut u8,
}

// The raw pointers refer to a shared mapping owned by this struct.
unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    pub fn map(desc: &RegionDesc, fd: &OwnedFd, index: usize) -> Result<Self, MemoryError> {
        if desc.size == 0 {
            return Err(MemoryError::EmptyRegion(index));
        }

        let mmap_len = (desc.mmap_offset + desc.size) as usize;
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MemoryError::Mmap {
                index,
                source: std::io::Error::last_os_error(),
            });
        }

        let mmap_addr = addr as *mut u8;
        Ok(Self {
            gpa_start: desc.gpa,
            gpa_end: desc.gpa + desc.size,
            size: desc.size,
            hv_vaddr: desc.hv_vaddr,
            mmap_offset: desc.mmap_offset,
            mmap_addr,
            mmap_len,
            va_start: unsafe { mmap_addr.add(desc.mmap_offset as usize) },
        })
    }

    pub fn gpa_start(&self) -> u64 {
        self.gpa_start
    }

    pub fn gpa_end(&self) -> u64 {
        self.gpa_end
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hv_vaddr(&self) -> u64 {
        self.hv_vaddr
    }

    pub fn mmap_offset(&self) -> u64 {
        self.mmap_offset
    }

    #[inline]
    fn contains(&self, gpa: u64, len: u64) -> bool {
        match gpa.checked_add(len) {
            Some(end) => self.gpa_start <= gpa && end <= self.gpa_end,
            None => false,
        }
    }

    #[inline]
    fn to_hva(&self, gpa: u64) -> *mut u8 {
        unsafe { self.va_start.add((gpa - self.gpa_start) as usize) }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap_addr as *mut libc::c_void, self.mmap_len);
        }
    }
}

/// Guest memory region table with an MRU slot-0 cache.
#[derive(Default)]
pub struct MemoryTable {
    regions: Vec<MemoryRegion>,
}

impl MemoryTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from a SET_MEM_TABLE payload and the SCM_RIGHTS fds
    /// that came with it. The fds are only needed for the mmap calls and
    /// are closed on return.
    pub fn from_map(map: &MemoryMap, fds: &[OwnedFd]) -> Result<Self, MemoryError> {
        let n = map.num_regions as usize;
        if n > MAX_REGIONS {
            return Err(MemoryError::TooManyRegions(n));
        }
        if n != fds.len() {
            return Err(MemoryError::FdCountMismatch {
                regions: n,
                fds: fds.len(),
            });
        }

        let mut regions = Vec::with_capacity(n);
        for (i, (desc, fd)) in map.regions[..n].iter().zip(fds.iter()).enumerate() {
            let region = MemoryRegion::map(desc, fd, i)?;
            debug!(
                index = i,
                gpa = format_args!("{:#x}", region.gpa_start),
                size = region.size,
                mmap_offset = region.mmap_offset,
                "mapped guest memory region"
            );
            regions.push(region);
        }

        Ok(Self { regions })
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Translate a guest physical range into a host pointer.
    ///
    /// Returns Some only if `[gpa, gpa + len)` lies entirely inside one
    /// installed region. Zero-length queries are invalid. A hit outside
    /// slot 0 swaps the hit region to the front to amortize future lookups.
    #[inline]
    pub fn translate(&mut self, gpa: u64, len: u64) -> Option<*mut u8> {
        if len == 0 {
            return None;
        }

        if let Some(first) = self.regions.first()
            && first.contains(gpa, len)
        {
            return Some(first.to_hva(gpa));
        }

        for i in 1..self.regions.len() {
            if self.regions[i].contains(gpa, len) {
                self.regions.swap(0, i);
                return Some(self.regions[0].to_hva(gpa));
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::shmem::SharedBlock;

    fn table_with(regions: &[(u64, u64)]) -> (MemoryTable, Vec<SharedBlock>) {
        // Keep the blocks alive: MemoryTable maps the same fds again, so
        // dropping the blocks is harmless, but holding them keeps the test
        // explicit about backing lifetime.
        let mut blocks = Vec::new();
        let mut map = MemoryMap::default();
        let mut fds = Vec::new();
        for (i, &(gpa, size)) in regions.iter().enumerate() {
            let block = SharedBlock::new(size as usize).expect("memfd block");
            map.regions[i] = RegionDesc {
                gpa,
                size,
                hv_vaddr: 0,
                mmap_offset: 0,
            };
            fds.push(block.try_clone_fd().expect("clone fd"));
            blocks.push(block);
        }
        map.num_regions = regions.len() as u32;
        let table = MemoryTable::from_map(&map, &fds).expect("table");
        (table, blocks)
    }

    #[test]
    fn test_translate_inside_region() {
        let (mut table, _blocks) = table_with(&[(0x10000, 0x4000)]);
        assert!(table.translate(0x10000, 1).is_some());
        assert!(table.translate(0x13fff, 1).is_some());
        assert!(table.translate(0x10000, 0x4000).is_some());
    }

    #[test]
    fn test_translate_rejects_outside_and_spanning() {
        let (mut table, _blocks) = table_with(&[(0x10000, 0x4000), (0x20000, 0x4000)]);
        assert!(table.translate(0x0, 16).is_none());
        assert!(table.translate(0x14000, 1).is_none());
        // A range crossing a region end never resolves, even if another
        // region starts elsewhere.
        assert!(table.translate(0x13ff0, 0x100).is_none());
        assert!(table.translate(u64::MAX - 4, 8).is_none());
    }

    #[test]
    fn test_translate_zero_len_invalid() {
        let (mut table, _blocks) = table_with(&[(0x10000, 0x4000)]);
        assert!(table.translate(0x10000, 0).is_none());
    }

    #[test]
    fn test_translate_offsets_within_region() {
        let (mut table, _blocks) = table_with(&[(0x10000, 0x4000)]);
        let base = table.translate(0x10000, 1).unwrap();
        let offset = table.translate(0x10123, 1).unwrap();
        assert_eq!(offset as usize - base as usize, 0x123);
    }

    #[test]
    fn test_mru_promotion() {
        let (mut table, _blocks) = table_with(&[(0x10000, 0x1000), (0x20000, 0x1000)]);
        assert_eq!(table.regions()[0].gpa_start(), 0x10000);
        // A hit in the second region swaps it to the front.
        assert!(table.translate(0x20000, 8).is_some());
        assert_eq!(table.regions()[0].gpa_start(), 0x20000);
        assert_eq!(table.regions()[1].gpa_start(), 0x10000);
    }

    #[test]
    fn test_empty_region_rejected() {
        let block = SharedBlock::new(4096).expect("memfd block");
        let mut map = MemoryMap::default();
        map.num_regions = 1;
        map.regions[0] = RegionDesc {
            gpa: 0x1000,
            size: 0,
            hv_vaddr: 0,
            mmap_offset: 0,
        };
        let fds = vec![block.try_clone_fd().expect("clone fd")];
        assert!(matches!(
            MemoryTable::from_map(&map, &fds),
            Err(MemoryError::EmptyRegion(0))
        ));
    }

    #[test]
    fn test_fd_count_mismatch() {
        let mut map = MemoryMap::default();
        map.num_regions = 1;
        map.regions[0] = RegionDesc {
            gpa: 0,
            size: 4096,
            hv_vaddr: 0,
            mmap_offset: 0,
        };
        assert!(matches!(
            MemoryTable::from_map(&map, &[]),
            Err(MemoryError::FdCountMismatch { .. })
        ));
    }

    #[test]
    fn test_mmap_offset_applied() {
        // The usable range starts mmap_offset bytes into the mapping:
        // bytes written through the translated pointer must land at
        // offset + delta in the backing file.
        let block = SharedBlock::new(8192).expect("memfd block");
        let mut map = MemoryMap::default();
        map.num_regions = 1;
        map.regions[0] = RegionDesc {
            gpa: 0x40000,
            size: 4096,
            hv_vaddr: 0,
            mmap_offset: 4096,
        };
        let fds = vec![block.try_clone_fd().expect("clone fd")];
        let mut table = MemoryTable::from_map(&map, &fds).expect("table");

        let p = table.translate(0x40010, 4).unwrap();
        unsafe { p.write_bytes(0xab, 4) };
        let view = block.as_slice();
        assert_eq!(&view[4096 + 0x10..4096 + 0x14], &[0xab; 4]);
    }
}
