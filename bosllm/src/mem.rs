// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! DDR region reservations shared between the host and the accelerator.
//!
//! The manager owns the backing storage for all four regions and
//! publishes physical/virtual address pairs. On hardware the regions are
//! windows into `/dev/mem`; the simulation backend uses aligned heap
//! allocations that carry the configured physical addresses. The manager
//! must outlive the engine thread; regions are only borrowed.

use crate::config::{MemoryLayout, RegionSpec};
use crate::error::{self, ErrorKind};

use nix::sys::mman::{MapFlags, ProtFlags};

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::slice;

/// Minimum alignment the accelerator DMA engine requires
pub const REGION_ALIGN: u64 = 64;

/// Mapping granularity of the /dev/mem path
const PAGE_SIZE: u64 = 4096;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionKind {
    Weights,
    KvCache,
    InputBuffer,
    OutputBuffer,
}

/// One host/device shared memory window
#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub phys: u64,
    pub size: u64,
    virt: *mut u8,
}

impl Region {
    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    /// View of the whole region.
    ///
    /// Callers must hold the exclusive borrow dictated by the threading
    /// model: startup code before the engine spawns, or the engine
    /// thread during generation.
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.virt, self.size as usize)
    }

    /// Zero-fills the region
    pub fn zero(&self) {
        unsafe { ptr::write_bytes(self.virt, 0u8, self.size as usize) };
    }
}

#[derive(Debug)]
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(size: u64) -> error::Result<Self> {
        let layout = Layout::from_size_align(size as usize, REGION_ALIGN as usize)
            .map_err(|e| ErrorKind::MemoryInitFailure(e.to_string()))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            Err(ErrorKind::MemoryInitFailure(format!(
                "allocation of {} bytes failed",
                size
            )))?
        }
        Ok(Self { ptr, layout })
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

#[derive(Debug)]
struct DevMemMapping {
    ptr: *mut libc::c_void,
    len: usize,
}

impl Drop for DevMemMapping {
    fn drop(&mut self) {
        unsafe { nix::sys::mman::munmap(self.ptr, self.len) }.expect("munmap is successful");
    }
}

#[derive(Debug)]
enum Backing {
    Heap(Vec<AlignedBuf>),
    DevMem(Vec<DevMemMapping>),
}

#[derive(Debug)]
pub struct MemoryManager {
    weights: Region,
    kv_cache: Region,
    input_buffer: Region,
    output_buffer: Region,
    _backing: Backing,
}

// Raw region pointers are published across the engine and interrupt
// threads; exclusive-access rules are part of each region's contract.
unsafe impl Send for MemoryManager {}
unsafe impl Sync for MemoryManager {}

impl MemoryManager {
    /// Heap-backed reservations for the simulation backend
    pub fn new_heap(layout: &MemoryLayout) -> error::Result<Self> {
        validate_layout(layout, REGION_ALIGN)?;
        let mut bufs = Vec::new();
        let mut reserve = |spec: &RegionSpec| -> error::Result<Region> {
            let buf = AlignedBuf::new(spec.size)?;
            let region = Region {
                phys: spec.phys,
                size: spec.size,
                virt: buf.ptr,
            };
            bufs.push(buf);
            Ok(region)
        };
        let weights = reserve(&layout.weights)?;
        let kv_cache = reserve(&layout.kv_cache)?;
        let input_buffer = reserve(&layout.input_buffer)?;
        let output_buffer = reserve(&layout.output_buffer)?;
        Ok(Self {
            weights,
            kv_cache,
            input_buffer,
            output_buffer,
            _backing: Backing::Heap(bufs),
        })
    }

    /// /dev/mem-backed reservations for real hardware
    pub fn new_devmem(layout: &MemoryLayout) -> error::Result<Self> {
        validate_layout(layout, PAGE_SIZE)?;
        let mem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .map_err(|e| ErrorKind::MemoryInitFailure(format!("/dev/mem: {}", e)))?;
        let mut mappings = Vec::new();
        let weights = map_devmem(&mem_file, &layout.weights, &mut mappings)?;
        let kv_cache = map_devmem(&mem_file, &layout.kv_cache, &mut mappings)?;
        let input_buffer = map_devmem(&mem_file, &layout.input_buffer, &mut mappings)?;
        let output_buffer = map_devmem(&mem_file, &layout.output_buffer, &mut mappings)?;
        Ok(Self {
            weights,
            kv_cache,
            input_buffer,
            output_buffer,
            _backing: Backing::DevMem(mappings),
        })
    }

    pub fn region(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::Weights => &self.weights,
            RegionKind::KvCache => &self.kv_cache,
            RegionKind::InputBuffer => &self.input_buffer,
            RegionKind::OutputBuffer => &self.output_buffer,
        }
    }
}

fn map_devmem(
    mem_file: &File,
    spec: &RegionSpec,
    mappings: &mut Vec<DevMemMapping>,
) -> error::Result<Region> {
    let res = unsafe {
        nix::sys::mman::mmap(
            0 as *mut libc::c_void,
            spec.size as usize,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            mem_file.as_raw_fd(),
            spec.phys as libc::off_t,
        )
    };
    match res {
        Ok(ptr) => {
            mappings.push(DevMemMapping {
                ptr,
                len: spec.size as usize,
            });
            Ok(Region {
                phys: spec.phys,
                size: spec.size,
                virt: ptr as *mut u8,
            })
        }
        Err(e) => Err(ErrorKind::MemoryInitFailure(format!(
            "mmap of {} bytes at 0x{:x}: {}",
            spec.size, spec.phys, e
        )))?,
    }
}

fn validate_layout(layout: &MemoryLayout, align: u64) -> error::Result<()> {
    let regions = [
        ("weights", layout.weights),
        ("kv_cache", layout.kv_cache),
        ("input_buffer", layout.input_buffer),
        ("output_buffer", layout.output_buffer),
    ];
    for (name, spec) in &regions {
        if spec.size == 0 {
            Err(ErrorKind::MemoryInitFailure(format!(
                "region {} has zero size",
                name
            )))?
        }
        if spec.phys % align != 0 {
            Err(ErrorKind::MemoryInitFailure(format!(
                "region {} at 0x{:x} not aligned to {}",
                name, spec.phys, align
            )))?
        }
    }

    let mut sorted = regions;
    sorted.sort_by_key(|(_, spec)| spec.phys);
    for pair in sorted.windows(2) {
        let (lo_name, lo) = pair[0];
        let (hi_name, hi) = pair[1];
        let lo_end = lo.phys.checked_add(lo.size).ok_or_else(|| {
            ErrorKind::MemoryInitFailure(format!("region {} wraps the address space", lo_name))
        })?;
        if lo_end > hi.phys {
            Err(ErrorKind::MemoryInitFailure(format!(
                "regions {} and {} overlap",
                lo_name, hi_name
            )))?
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn tiny_layout() -> MemoryLayout {
        MemoryLayout {
            weights: RegionSpec {
                phys: 0x1000_0000,
                size: 4096,
            },
            kv_cache: RegionSpec {
                phys: 0x3000_0000,
                size: 4096,
            },
            input_buffer: RegionSpec {
                phys: 0x2000_0000,
                size: 1024,
            },
            output_buffer: RegionSpec {
                phys: 0x2000_4000,
                size: 1024,
            },
        }
    }

    #[test]
    fn test_heap_regions_aligned_and_zeroed() {
        let mem = MemoryManager::new_heap(&tiny_layout()).expect("reservation failed");
        for kind in &[
            RegionKind::Weights,
            RegionKind::KvCache,
            RegionKind::InputBuffer,
            RegionKind::OutputBuffer,
        ] {
            let region = mem.region(*kind);
            assert_eq!(region.virt() as usize % REGION_ALIGN as usize, 0);
            let data = unsafe { region.as_mut_slice() };
            assert!(data.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_zero_clears_region() {
        let mem = MemoryManager::new_heap(&tiny_layout()).expect("reservation failed");
        let region = mem.region(RegionKind::KvCache);
        unsafe { region.as_mut_slice() }
            .iter_mut()
            .for_each(|b| *b = 0x5A);
        region.zero();
        assert!(unsafe { region.as_mut_slice() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_overlapping_layout_rejected() {
        let mut layout = tiny_layout();
        layout.input_buffer.phys = layout.weights.phys;
        let err = MemoryManager::new_heap(&layout).expect_err("reservation succeeded");
        match err.kind() {
            ErrorKind::MemoryInitFailure(_) => {}
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    #[test]
    fn test_misaligned_layout_rejected() {
        let mut layout = tiny_layout();
        layout.output_buffer.phys += 8;
        assert!(MemoryManager::new_heap(&layout).is_err());
    }

    #[test]
    fn test_published_physical_addresses() {
        let layout = tiny_layout();
        let mem = MemoryManager::new_heap(&layout).expect("reservation failed");
        assert_eq!(mem.region(RegionKind::Weights).phys, layout.weights.phys);
        assert_eq!(
            mem.region(RegionKind::OutputBuffer).phys,
            layout.output_buffer.phys
        );
    }
}
