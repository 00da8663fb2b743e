//! Contract required of the PCI/IOMMU passthrough layer.

use bitflags::bitflags;

use crate::error::Result;

bitflags! {
    /// BAR mapping protection flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A PCI device function behind a passthrough IOMMU (e.g. VFIO).
///
/// The controller consumes an implementation by value and drives the whole
/// device lifecycle through it: BAR windows for registers and doorbells,
/// stable IOMMU mappings for queue memory, and ephemeral mappings for
/// transient command buffers.
///
/// Implementations are pre-bound to one device function (a BDF); `open`
/// takes the function over from any kernel driver and `close` releases it.
/// `close` may be called more than once and on a never-opened device.
pub trait PciDevice {
    /// Query the PCI class attribute without taking the device over.
    ///
    /// Encoded `[class (8) | subclass (8) | progif (8)]`, so an NVMe I/O
    /// controller reads `0x010802`.
    fn class_code(&self) -> Result<u32>;

    /// Take over the device function.
    fn open(&mut self) -> Result<()>;

    /// Map `len` bytes of BAR `bar` at `offset` into host memory.
    fn map_bar(&mut self, bar: u32, len: usize, offset: usize, prot: Prot) -> Result<*mut u8>;

    /// Unmap a window previously returned by [`map_bar`](Self::map_bar).
    fn unmap_bar(&mut self, bar: u32, vaddr: *mut u8, len: usize, offset: usize);

    /// Establish a stable DMA mapping for a host region, returning its IOVA.
    fn map_iova(&mut self, vaddr: *mut u8, len: usize) -> Result<u64>;

    /// Tear down a stable DMA mapping.
    fn unmap_iova(&mut self, vaddr: *mut u8) -> Result<()>;

    /// Establish a short-lived DMA mapping, released in batch later.
    fn ephemeral_map(&mut self, vaddr: *mut u8, len: usize) -> Result<u64>;

    /// Release the `n` most recent ephemeral mappings.
    fn ephemeral_free(&mut self, n: usize) -> Result<()>;

    /// Release the device function.
    fn close(&mut self);
}
