//! Page-granular queue memory, registered with the IOMMU.

use std::alloc::{Layout, alloc_zeroed, dealloc};

use log::debug;

use crate::error::{Error, Result};
use crate::pci::PciDevice;

/// Host page shift. Queue rings and PRP pages are laid out in these units.
pub const PAGESHIFT: usize = 12;
/// Host page size in bytes.
pub const PAGESIZE: usize = 1 << PAGESHIFT;

/// A page-aligned host region with a stable bus address.
///
/// A zeroed region (null `vaddr`) denotes "not mapped"; discarded queue
/// records are reset to this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// Host virtual address of the region start.
    pub vaddr: *mut u8,
    /// Region length in bytes (a multiple of the page size).
    pub len: usize,
    /// Bus address produced by the IOMMU.
    pub iova: u64,
}

impl Default for DmaRegion {
    fn default() -> Self {
        Self {
            vaddr: core::ptr::null_mut(),
            len: 0,
            iova: 0,
        }
    }
}

impl DmaRegion {
    /// Whether the region is backed by memory.
    pub fn is_mapped(&self) -> bool {
        !self.vaddr.is_null()
    }
}

fn page_layout(len: usize) -> Layout {
    // len is a nonzero multiple of the page size
    unsafe { Layout::from_size_align_unchecked(len, PAGESIZE) }
}

/// Allocate `n` zeroed, page-aligned, contiguous pages.
///
/// Returns the region start and its byte length.
pub fn alloc_pages(n: usize) -> Result<(*mut u8, usize)> {
    let len = n.max(1) << PAGESHIFT;
    let vaddr = unsafe { alloc_zeroed(page_layout(len)) };
    if vaddr.is_null() {
        return Err(Error::AllocationFailure);
    }

    Ok((vaddr, len))
}

/// Release a region returned by [`alloc_pages`].
pub fn free_pages(vaddr: *mut u8, len: usize) {
    unsafe { dealloc(vaddr, page_layout(len)) }
}

/// Allocate `n` pages and register them with the IOMMU.
///
/// On mapping failure the host allocation is released before the error
/// returns, so the caller never sees a half-built region.
pub fn map_pages<P: PciDevice>(pci: &mut P, n: usize) -> Result<DmaRegion> {
    let (vaddr, len) = alloc_pages(n)?;

    let iova = match pci.map_iova(vaddr, len) {
        Ok(iova) => iova,
        Err(err) => {
            debug!("failed to map vaddr");
            free_pages(vaddr, len);
            return Err(err);
        }
    };

    Ok(DmaRegion { vaddr, len, iova })
}

/// Unregister a region from the IOMMU and release its host memory.
///
/// Unmap failures are logged, not surfaced; teardown is best-effort.
pub fn unmap_pages<P: PciDevice>(pci: &mut P, region: DmaRegion) {
    if !region.is_mapped() {
        return;
    }

    if pci.unmap_iova(region.vaddr).is_err() {
        debug!("failed to unmap vaddr");
    }

    free_pages(region.vaddr, region.len);
}
