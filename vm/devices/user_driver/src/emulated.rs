// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This implements the user-mode driver device traits using an emulated
//! device and process memory standing in for physical memory.

use crate::backoff::Sleep;
use crate::memory::MappedDmaTarget;
use crate::memory::MemoryBlock;
use crate::memory::PAGE_SIZE;
use crate::memory::PAGE_SIZE64;
use crate::DeviceBacking;
use crate::DeviceRegisterIo;
use crate::HostDmaAllocator;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The physical address at which emulated shared memory starts.
pub const SHARED_MEMORY_BASE: u64 = 0x1_0000_0000;

/// The physical address reported for an emulated device's BAR0.
pub const EMULATED_BAR0_ADDRESS: u64 = 0xfebf_0000;

/// Register accesses routed to an emulated device.
pub trait MmioIntercept: Send {
    /// Reads `data.len()` bytes of BAR0 at `offset`.
    fn mmio_read(&mut self, offset: u64, data: &mut [u8]);
    /// Writes `data` to BAR0 at `offset`.
    fn mmio_write(&mut self, offset: u64, data: &[u8]);
}

/// An emulated device.
pub struct EmulatedDevice<T> {
    device: Arc<Mutex<T>>,
    shared_mem: DeviceSharedMemory,
}

impl<T: MmioIntercept> EmulatedDevice<T> {
    /// Creates a new emulated device, wrapping `device`, that allocates DMA
    /// memory from `shared_mem`.
    pub fn new(device: T, shared_mem: DeviceSharedMemory) -> Self {
        Self {
            device: Arc::new(Mutex::new(device)),
            shared_mem,
        }
    }

    /// Returns a handle to the wrapped device, for inspecting or steering it
    /// while a driver owns this object.
    pub fn device(&self) -> Arc<Mutex<T>> {
        self.device.clone()
    }
}

impl<T: 'static + MmioIntercept> DeviceBacking for EmulatedDevice<T> {
    type Registers = Mapping<T>;
    type DmaAllocator = DeviceSharedMemory;

    fn id(&self) -> &str {
        "emulated"
    }

    fn bar_address(&self, n: u8) -> anyhow::Result<u64> {
        if n != 0 {
            anyhow::bail!("invalid bar {n}");
        }
        Ok(EMULATED_BAR0_ADDRESS)
    }

    fn map_bar(&mut self, n: u8) -> anyhow::Result<Self::Registers> {
        if n != 0 {
            anyhow::bail!("invalid bar {n}");
        }
        Ok(Mapping {
            device: self.device.clone(),
        })
    }

    fn host_allocator(&self) -> Self::DmaAllocator {
        self.shared_mem.clone()
    }
}

/// A register mapping for an [`EmulatedDevice`].
pub struct Mapping<T> {
    device: Arc<Mutex<T>>,
}

impl<T: MmioIntercept> DeviceRegisterIo for Mapping<T> {
    fn read_u32(&self, offset: usize) -> u32 {
        let mut n = [0; 4];
        self.device.lock().mmio_read(offset as u64, &mut n);
        u32::from_le_bytes(n)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut n = [0; 8];
        self.device.lock().mmio_read(offset as u64, &mut n);
        u64::from_le_bytes(n)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        self.device
            .lock()
            .mmio_write(offset as u64, &data.to_le_bytes());
    }

    fn write_u64(&self, offset: usize, data: u64) {
        self.device
            .lock()
            .mmio_write(offset as u64, &data.to_le_bytes());
    }
}

/// An access to shared memory fell outside of it.
#[derive(Debug, Error)]
#[error("physical range {addr:#x}+{len:#x} is outside of shared memory")]
pub struct InvalidAddress {
    pub addr: u64,
    pub len: usize,
}

/// Process memory that both the driver (through [`MemoryBlock`]s) and an
/// emulated device (through physical addresses) can access.
#[derive(Clone)]
pub struct DeviceSharedMemory {
    inner: Arc<SharedMemoryInner>,
}

struct SharedMemoryInner {
    mem: Box<[AtomicU8]>,
    state: Mutex<AllocState>,
}

struct AllocState {
    used: Vec<bool>,
    /// Number of allocations that may still succeed, if limited.
    allocations_left: Option<usize>,
}

impl DeviceSharedMemory {
    /// Creates `len` bytes of shared memory, rounded up to whole pages.
    pub fn new(len: usize) -> Self {
        let pages = len.div_ceil(PAGE_SIZE);
        Self {
            inner: Arc::new(SharedMemoryInner {
                mem: (0..pages * PAGE_SIZE).map(|_| AtomicU8::new(0)).collect(),
                state: Mutex::new(AllocState {
                    used: vec![false; pages],
                    allocations_left: None,
                }),
            }),
        }
    }

    /// Allocates a zeroed, physically contiguous range of whole pages covering
    /// `len` bytes.
    pub fn allocate(&self, len: usize) -> Option<MemoryBlock> {
        let count = len.div_ceil(PAGE_SIZE).max(1);
        let mut state = self.inner.state.lock();
        if let Some(left) = &mut state.allocations_left {
            if *left == 0 {
                tracing::debug!(len, "failing allocation on request");
                return None;
            }
            *left -= 1;
        }
        let first = state
            .used
            .windows(count)
            .position(|pages| pages.iter().all(|&used| !used))?;
        state.used[first..first + count].fill(true);
        drop(state);

        for byte in &self.inner.mem[first * PAGE_SIZE..][..count * PAGE_SIZE] {
            byte.store(0, Relaxed);
        }
        let base_pfn = SHARED_MEMORY_BASE / PAGE_SIZE64;
        Some(MemoryBlock::new(SharedAllocation {
            inner: self.inner.clone(),
            first,
            count,
            pfns: (0..count as u64)
                .map(|i| base_pfn + first as u64 + i)
                .collect(),
        }))
    }

    /// Limits future allocations: after `count` more successes, every
    /// allocation fails. `None` removes the limit.
    pub fn fail_allocations_after(&self, count: Option<usize>) {
        self.inner.state.lock().allocations_left = count;
    }

    /// Returns the number of pages currently allocated.
    pub fn allocated_pages(&self) -> usize {
        self.inner.state.lock().used.iter().filter(|&&used| used).count()
    }

    fn range(&self, addr: u64, len: usize) -> Result<&[AtomicU8], InvalidAddress> {
        let err = InvalidAddress { addr, len };
        let offset = addr.checked_sub(SHARED_MEMORY_BASE).ok_or(err)?;
        let offset = usize::try_from(offset).map_err(|_| InvalidAddress { addr, len })?;
        self.inner
            .mem
            .get(offset..)
            .and_then(|mem| mem.get(..len))
            .ok_or(InvalidAddress { addr, len })
    }

    /// Reads from physical address `addr`.
    pub fn read_at(&self, addr: u64, data: &mut [u8]) -> Result<(), InvalidAddress> {
        let range = self.range(addr, data.len())?;
        for (dest, src) in data.iter_mut().zip(range) {
            *dest = src.load(Relaxed);
        }
        Ok(())
    }

    /// Writes to physical address `addr`.
    pub fn write_at(&self, addr: u64, data: &[u8]) -> Result<(), InvalidAddress> {
        for (dest, src) in self.range(addr, data.len())?.iter().zip(data) {
            dest.store(*src, Relaxed);
        }
        Ok(())
    }
}

impl HostDmaAllocator for DeviceSharedMemory {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<MemoryBlock> {
        self.allocate(len)
            .ok_or_else(|| anyhow::anyhow!("out of shared memory allocating {len} bytes"))
    }
}

struct SharedAllocation {
    inner: Arc<SharedMemoryInner>,
    first: usize,
    count: usize,
    pfns: Vec<u64>,
}

impl MappedDmaTarget for SharedAllocation {
    fn as_slice(&self) -> &[AtomicU8] {
        &self.inner.mem[self.first * PAGE_SIZE..][..self.count * PAGE_SIZE]
    }

    fn pfns(&self) -> &[u64] {
        &self.pfns
    }
}

impl Drop for SharedAllocation {
    fn drop(&mut self) {
        self.inner.state.lock().used[self.first..self.first + self.count].fill(false);
    }
}

/// A [`Sleep`] that returns immediately and records what was asked of it.
#[derive(Debug, Default)]
pub struct InstantSleep {
    count: AtomicU64,
    total_nanos: AtomicU64,
}

impl InstantSleep {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of sleeps requested.
    pub fn count(&self) -> u64 {
        self.count.load(Relaxed)
    }

    /// The total time requested across all sleeps.
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_nanos.load(Relaxed))
    }
}

impl Sleep for InstantSleep {
    fn sleep(&self, duration: Duration) {
        self.count.fetch_add(1, Relaxed);
        self.total_nanos
            .fetch_add(duration.as_nanos() as u64, Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn allocations_are_contiguous_and_released() {
        let mem = DeviceSharedMemory::new(PAGE_SIZE * 8);
        let a = mem.allocate(PAGE_SIZE * 2).unwrap();
        let b = mem.allocate(1).unwrap();
        assert_eq!(a.pfns().len(), 2);
        assert_eq!(a.pfns()[1], a.pfns()[0] + 1);
        assert_eq!(b.len(), PAGE_SIZE);
        assert_eq!(b.physical_address(), a.physical_address() + 2 * PAGE_SIZE64);
        assert_eq!(mem.allocated_pages(), 3);

        drop(a);
        assert_eq!(mem.allocated_pages(), 1);
        let c = mem.allocate(PAGE_SIZE * 2).unwrap();
        assert_eq!(c.physical_address(), SHARED_MEMORY_BASE);
        drop((b, c));
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn physical_access_matches_block() {
        let mem = DeviceSharedMemory::new(PAGE_SIZE * 4);
        let _pad = mem.allocate(PAGE_SIZE).unwrap();
        let block = mem.allocate(PAGE_SIZE).unwrap();
        block.write_at(10, b"hello");
        let mut buf = [0; 5];
        mem.read_at(block.physical_address() + 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        mem.write_at(block.physical_address(), b"xy").unwrap();
        let mut buf = [0; 2];
        block.read_at(0, &mut buf);
        assert_eq!(&buf, b"xy");

        assert!(mem.read_at(0x1000, &mut buf).is_err());
        assert!(mem
            .read_at(SHARED_MEMORY_BASE + 4 * PAGE_SIZE64 - 1, &mut buf)
            .is_err());
    }

    #[test]
    fn allocation_failure_injection() {
        let mem = DeviceSharedMemory::new(PAGE_SIZE * 4);
        mem.fail_allocations_after(Some(1));
        let _a = mem.allocate(PAGE_SIZE).unwrap();
        assert!(mem.allocate(PAGE_SIZE).is_none());
        mem.fail_allocations_after(None);
        assert!(mem.allocate(PAGE_SIZE).is_some());
        assert!(mem.allocate(PAGE_SIZE * 4).is_none());
    }
}
