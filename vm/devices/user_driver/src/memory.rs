// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for sharing host memory with the device.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// The 4KB page size used by user-mode devices.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SIZE32: u32 = 4096;
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// A mapped buffer that can be accessed by the host or the device.
///
/// The buffer must start on a page boundary and stay mapped for the lifetime
/// of the object. Dropping the object returns the memory to its owner.
pub trait MappedDmaTarget: Send + Sync {
    /// The mapped memory. The device may write it concurrently, so it is only
    /// exposed as atomics.
    fn as_slice(&self) -> &[AtomicU8];

    /// 4KB page numbers used to refer to the memory when communicating with the
    /// device.
    fn pfns(&self) -> &[u64];
}

/// A DMA target.
#[derive(Clone)]
pub struct MemoryBlock {
    mem: Arc<dyn MappedDmaTarget>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl MemoryBlock {
    /// Creates a new memory block backed by `mem`.
    pub fn new<T: 'static + MappedDmaTarget>(mem: T) -> Self {
        let len = mem.as_slice().len();
        Self {
            mem: Arc::new(mem),
            offset: 0,
            len,
        }
    }

    /// Returns a view of a subset of the buffer.
    pub fn subblock(&self, offset: usize, len: usize) -> Self {
        assert!(self.len >= offset && self.len - offset >= len);
        Self {
            mem: self.mem.clone(),
            offset: self.offset + offset,
            len,
        }
    }

    /// Gets the length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gets the PFNs of the pages this buffer touches.
    pub fn pfns(&self) -> &[u64] {
        let start = self.offset / PAGE_SIZE;
        let count = (self.offset % PAGE_SIZE + self.len).div_ceil(PAGE_SIZE);
        &self.mem.pfns()[start..][..count]
    }

    /// Returns the physical address of the first byte of the buffer.
    pub fn physical_address(&self) -> u64 {
        self.mem.pfns()[self.offset / PAGE_SIZE] * PAGE_SIZE64 + self.offset_in_page() as u64
    }

    /// Returns the offset of the beginning of the buffer in the first page
    /// returned by [`Self::pfns`].
    pub fn offset_in_page(&self) -> u32 {
        (self.offset % PAGE_SIZE) as u32
    }

    /// Gets the buffer as an atomic slice.
    pub fn as_slice(&self) -> &[AtomicU8] {
        &self.mem.as_slice()[self.offset..][..self.len]
    }

    /// Reads from the buffer into `data`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        let len = data.len();
        for (dest, src) in data.iter_mut().zip(&self.as_slice()[offset..][..len]) {
            *dest = src.load(Relaxed);
        }
    }

    /// Reads an object from the buffer at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes into the buffer from `data`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        for (dest, src) in self.as_slice()[offset..][..data.len()].iter().zip(data) {
            dest.store(*src, Relaxed);
        }
    }

    /// Writes an object into the buffer at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, data: &T) {
        self.write_at(offset, data.as_bytes());
    }

    /// Fills `len` bytes at `offset` with `value`.
    pub fn fill_at(&self, offset: usize, len: usize, value: u8) {
        for dest in &self.as_slice()[offset..][..len] {
            dest.store(value, Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    struct HeapTarget {
        mem: Vec<AtomicU8>,
        pfns: Vec<u64>,
    }

    fn heap_block(pages: usize, first_pfn: u64) -> MemoryBlock {
        MemoryBlock::new(HeapTarget {
            mem: (0..pages * PAGE_SIZE).map(|_| AtomicU8::new(0)).collect(),
            pfns: (first_pfn..first_pfn + pages as u64).collect(),
        })
    }

    impl MappedDmaTarget for HeapTarget {
        fn as_slice(&self) -> &[AtomicU8] {
            &self.mem
        }

        fn pfns(&self) -> &[u64] {
            &self.pfns
        }
    }

    #[test]
    fn subblock_addresses() {
        let mem = heap_block(4, 0x100);
        assert_eq!(mem.physical_address(), 0x100000);

        let second = mem.subblock(PAGE_SIZE, PAGE_SIZE);
        assert_eq!(second.pfns(), &[0x101]);
        assert_eq!(second.physical_address(), 0x101000);

        let straddle = mem.subblock(PAGE_SIZE + 16, PAGE_SIZE);
        assert_eq!(straddle.pfns(), &[0x101, 0x102]);
        assert_eq!(straddle.offset_in_page(), 16);
        assert_eq!(straddle.physical_address(), 0x101010);
    }

    #[test]
    fn read_write_through_views() {
        let mem = heap_block(2, 0);
        let view = mem.subblock(PAGE_SIZE, PAGE_SIZE);
        view.write_obj(8, &0x1122_3344_5566_7788u64);
        assert_eq!(mem.read_obj::<u64>(PAGE_SIZE + 8), 0x1122_3344_5566_7788);

        view.fill_at(0, 8, 0xab);
        let mut buf = [0; 10];
        mem.read_at(PAGE_SIZE, &mut buf);
        assert_eq!(buf, [0xab, 0xab, 0xab, 0xab, 0xab, 0xab, 0xab, 0xab, 0x88, 0x77]);
    }
}
