// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Block reads and writes through the host I/O queue.
//!
//! Caller buffers are not shared with the device directly. Each transfer
//! allocates one staging buffer, sized to the largest chunk, plus one page for
//! its PRP list, and moves the data through it one chunk at a time.

use super::spec;
use crate::queue_pair::QueuePair;
use crate::queue_pair::RequestError;
use spec::nvm;
use std::ops::Range;
use thiserror::Error;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::memory::PAGE_SIZE64;
use user_driver::DeviceBacking;
use user_driver::HostDmaAllocator;
use zerocopy::FromZeros;

/// The default largest amount of data moved by one command.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 1 << 20;

const PRP_ENTRY_SIZE: usize = size_of::<u64>();

/// The largest chunk that PRP1 plus a single-page PRP list can describe.
pub const MAX_CHUNK_SIZE_LIMIT: usize = PAGE_SIZE * (PAGE_SIZE / PRP_ENTRY_SIZE + 1);

/// An error moving data to or from the device.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("no host io queue")]
    NoIoQueue,
    #[error("device address {0:#x} is not block aligned")]
    UnalignedAddress(u64),
    #[error("failed to allocate {0}")]
    Allocation(&'static str, #[source] anyhow::Error),
    #[error("chunk at offset {offset:#x} failed")]
    Chunk {
        offset: usize,
        #[source]
        source: RequestError,
    },
}

/// Per-command parameters shared by every chunk of a transfer.
#[derive(Debug, Clone)]
pub(crate) struct TransferParams {
    pub max_chunk_size: usize,
    pub nsid: u32,
    /// Completion polls allowed per chunk.
    pub timeout: u32,
}

/// Splits `len` bytes into consecutive ranges of at most `max` bytes.
pub(crate) fn chunks(len: usize, max: usize) -> impl Iterator<Item = Range<usize>> {
    (0..len)
        .step_by(max)
        .map(move |start| start..len.min(start + max))
}

/// DMA memory that a transfer stages data through.
pub(crate) struct StagingBuffer {
    prp_list: MemoryBlock,
    data: MemoryBlock,
    len: usize,
}

impl StagingBuffer {
    /// Allocates the PRP list page and `len` bytes of data, and fills the
    /// list with the address of every data page after the first.
    pub fn new(allocator: &impl HostDmaAllocator, len: usize) -> Result<Self, TransferError> {
        let prp_list = allocator
            .allocate_dma_buffer(PAGE_SIZE)
            .map_err(|err| TransferError::Allocation("prp list", err))?;
        let data = allocator
            .allocate_dma_buffer(len)
            .map_err(|err| TransferError::Allocation("staging buffer", err))?;

        let this = Self {
            prp_list,
            data,
            len,
        };
        let base = this.data.physical_address();
        for (i, offset) in (PAGE_SIZE..len).step_by(PAGE_SIZE).enumerate() {
            this.prp_list
                .write_obj(i * PRP_ENTRY_SIZE, &(base + offset as u64));
        }
        Ok(this)
    }

    /// The number of PRP list entries in use.
    pub fn prp_entries(&self) -> usize {
        self.len.div_ceil(PAGE_SIZE).saturating_sub(1)
    }

    /// Returns PRP1 and PRP2 for a command moving `len` bytes from the start
    /// of the buffer.
    pub fn dptr(&self, len: usize) -> [u64; 2] {
        let base = self.data.physical_address();
        let prp2 = if len > 2 * PAGE_SIZE {
            self.prp_list.physical_address()
        } else {
            base + PAGE_SIZE64
        };
        [base, prp2]
    }
}

fn check_address(addr: u64) -> Result<(), TransferError> {
    if addr % nvm::BLOCK_SIZE as u64 != 0 {
        return Err(TransferError::UnalignedAddress(addr));
    }
    Ok(())
}

fn staging_len(len: usize, params: &TransferParams) -> usize {
    len.min(params.max_chunk_size)
        .next_multiple_of(nvm::BLOCK_SIZE)
}

/// Writes `data` to the device starting at byte address `addr`.
///
/// A final chunk that is not a whole number of blocks is padded with zeroes.
pub(crate) fn write<T: DeviceBacking>(
    queue: &mut QueuePair<T>,
    allocator: &impl HostDmaAllocator,
    params: &TransferParams,
    addr: u64,
    data: &[u8],
) -> Result<(), TransferError> {
    check_address(addr)?;
    if data.is_empty() {
        return Ok(());
    }
    let staging = StagingBuffer::new(allocator, staging_len(data.len(), params))?;
    for range in chunks(data.len(), params.max_chunk_size) {
        let len = range.len();
        let padded = len.next_multiple_of(nvm::BLOCK_SIZE);
        staging.data.write_at(0, &data[range.clone()]);
        staging.data.fill_at(len, padded - len, 0);
        issue_chunk(
            queue,
            params,
            &staging,
            nvm::NvmOpcode::WRITE,
            addr,
            range.start,
            padded,
        )?;
    }
    Ok(())
}

/// Fills `data` from the device starting at byte address `addr`. Returns the
/// number of bytes read.
pub(crate) fn read<T: DeviceBacking>(
    queue: &mut QueuePair<T>,
    allocator: &impl HostDmaAllocator,
    params: &TransferParams,
    addr: u64,
    data: &mut [u8],
) -> Result<usize, TransferError> {
    check_address(addr)?;
    if data.is_empty() {
        return Ok(0);
    }
    let staging = StagingBuffer::new(allocator, staging_len(data.len(), params))?;
    for range in chunks(data.len(), params.max_chunk_size) {
        let padded = range.len().next_multiple_of(nvm::BLOCK_SIZE);
        issue_chunk(
            queue,
            params,
            &staging,
            nvm::NvmOpcode::READ,
            addr,
            range.start,
            padded,
        )?;
        staging.data.read_at(0, &mut data[range]);
    }
    Ok(data.len())
}

fn issue_chunk<T: DeviceBacking>(
    queue: &mut QueuePair<T>,
    params: &TransferParams,
    staging: &StagingBuffer,
    opcode: nvm::NvmOpcode,
    addr: u64,
    offset: usize,
    len: usize,
) -> Result<(), TransferError> {
    let slba = (addr + offset as u64) / nvm::BLOCK_SIZE as u64;
    let nlb_z = (len / nvm::BLOCK_SIZE - 1) as u16;
    tracing::debug!(?opcode, offset, len, slba, "issuing chunk");
    queue
        .issue(
            spec::Command {
                cdw0: spec::Cdw0::new().with_opcode(opcode.0),
                nsid: params.nsid,
                dptr: staging.dptr(len),
                cdw10: nvm::Cdw10ReadWrite::new()
                    .with_sbla_low(slba as u32)
                    .into(),
                cdw11: nvm::Cdw11ReadWrite::new()
                    .with_sbla_high((slba >> 32) as u32)
                    .into(),
                cdw12: nvm::Cdw12ReadWrite::new().with_nlb_z(nlb_z).into(),
                ..FromZeros::new_zeroed()
            },
            params.timeout,
        )
        .map_err(|source| TransferError::Chunk { offset, source })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use user_driver::emulated::DeviceSharedMemory;

    #[test]
    fn chunk_boundaries() {
        let ranges: Vec<_> = chunks(5_000_000, DEFAULT_MAX_CHUNK_SIZE).collect();
        let lens: Vec<_> = ranges.iter().map(|r| r.len()).collect();
        assert_eq!(lens, [1048576, 1048576, 1048576, 1048576, 805696]);
        assert_eq!(ranges[4].start, 4 * DEFAULT_MAX_CHUNK_SIZE);
        assert_eq!(lens.iter().sum::<usize>(), 5_000_000);

        assert_eq!(chunks(0, DEFAULT_MAX_CHUNK_SIZE).count(), 0);
        assert_eq!(
            chunks(DEFAULT_MAX_CHUNK_SIZE, DEFAULT_MAX_CHUNK_SIZE).collect::<Vec<_>>(),
            [0..DEFAULT_MAX_CHUNK_SIZE]
        );
        for range in chunks(3 * 4096 + 512, 4096) {
            assert!(range.len() <= 4096);
            assert_eq!(range.len() % 512, 0);
        }
    }

    #[test]
    fn prp_list_entries() {
        let mem = DeviceSharedMemory::new(PAGE_SIZE * 600);
        for (len, entries) in [
            (512, 0),
            (4096, 0),
            (4608, 1),
            (8192, 1),
            (8704, 2),
            (DEFAULT_MAX_CHUNK_SIZE, 255),
        ] {
            let staging = StagingBuffer::new(&mem, len).unwrap();
            assert_eq!(staging.prp_entries(), entries, "len {len}");
            let base = staging.data.physical_address();
            for k in 0..entries {
                assert_eq!(
                    staging.prp_list.read_obj::<u64>(k * PRP_ENTRY_SIZE),
                    base + (k as u64 + 1) * PAGE_SIZE64
                );
            }
            assert_eq!(staging.prp_list.read_obj::<u64>(entries * PRP_ENTRY_SIZE), 0);
        }
    }

    #[test]
    fn prp2_selection() {
        let mem = DeviceSharedMemory::new(PAGE_SIZE * 8);
        let staging = StagingBuffer::new(&mem, 4 * PAGE_SIZE).unwrap();
        let base = staging.data.physical_address();
        let list = staging.prp_list.physical_address();
        // The list page is allocated ahead of the data.
        assert!(list < base);

        assert_eq!(staging.dptr(512), [base, base + PAGE_SIZE64]);
        assert_eq!(staging.dptr(2 * PAGE_SIZE), [base, base + PAGE_SIZE64]);
        assert_eq!(staging.dptr(2 * PAGE_SIZE + 512), [base, list]);
        assert_eq!(staging.dptr(4 * PAGE_SIZE), [base, list]);
    }

    #[test]
    fn staging_is_block_rounded() {
        let params = TransferParams {
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            nsid: 1,
            timeout: 1000,
        };
        assert_eq!(staging_len(1, &params), 512);
        assert_eq!(staging_len(805696, &params), 805888);
        assert_eq!(staging_len(5_000_000, &params), DEFAULT_MAX_CHUNK_SIZE);
        assert!(check_address(0x10000).is_ok());
        assert!(matches!(
            check_address(0x10001),
            Err(TransferError::UnalignedAddress(0x10001))
        ));
    }

    #[test]
    fn chunk_limit_fits_one_list_page() {
        assert_eq!(MAX_CHUNK_SIZE_LIMIT, 513 * PAGE_SIZE);
        let mem = DeviceSharedMemory::new(PAGE_SIZE * 520);
        let staging = StagingBuffer::new(&mem, MAX_CHUNK_SIZE_LIMIT).unwrap();
        assert_eq!(staging.prp_entries(), PAGE_SIZE / PRP_ENTRY_SIZE);
    }
}
