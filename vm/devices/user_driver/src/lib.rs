// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Infrastructure for drivers that talk to a PCI function directly: register
//! access, DMA memory, and bounded polling.
//!
//! PCI enumeration and BAR mapping are provided by whoever implements
//! [`DeviceBacking`].

pub mod backoff;
pub mod emulated;
pub mod memory;

use memory::MemoryBlock;

/// An interface to access a device's registers and DMA memory.
pub trait DeviceBacking: 'static + Send {
    /// An object for accessing device registers.
    type Registers: 'static + DeviceRegisterIo;
    /// An object for allocating host memory to share with the device.
    type DmaAllocator: 'static + HostDmaAllocator;

    /// Returns a device ID for diagnostics.
    fn id(&self) -> &str;

    /// Returns the physical address of BAR `n`, as seen by peer devices.
    fn bar_address(&self, n: u8) -> anyhow::Result<u64>;

    /// Maps a BAR.
    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers>;

    /// Returns an object that can allocate host memory to be shared with the
    /// device.
    fn host_allocator(&self) -> Self::DmaAllocator;
}

/// Access to device registers.
pub trait DeviceRegisterIo: Send + Sync {
    /// Reads a `u32` register.
    fn read_u32(&self, offset: usize) -> u32;
    /// Reads a `u64` register.
    fn read_u64(&self, offset: usize) -> u64;
    /// Writes a `u32` register.
    fn write_u32(&self, offset: usize, data: u32);
    /// Writes a `u64` register.
    fn write_u64(&self, offset: usize, data: u64);
}

/// Allocator for memory the device can reach with DMA.
pub trait HostDmaAllocator: Send + Sync {
    /// Allocates a physically contiguous, page-aligned, zeroed buffer of at
    /// least `len` bytes.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock>;
}
