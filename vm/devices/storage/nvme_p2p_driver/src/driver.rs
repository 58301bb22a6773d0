// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of the device driver core.

use crate::admin::AdminQueue;
use crate::control::QueueRelease;
use crate::control::QueueSetup;
use crate::io_queue::create_io_queue;
use crate::io_queue::delete_io_queue;
use crate::io_queue::IoQueue;
use crate::io_queue::IoQueueInfo;
use crate::io_queue::Ownership;
use crate::io_queue::PeerQueue;
use crate::io_queue::PeerRings;
use crate::io_queue::HOST_QID;
use crate::io_queue::PEER_QID;
use crate::queue_pair::QueuePair;
use crate::queue_pair::MAX_QUEUE_LEN;
use crate::queue_pair::RequestError;
use crate::registers::Bar0;
use crate::registers::DeviceRegisters;
use crate::registers::ReadyError;
use crate::transfer;
use crate::transfer::TransferError;
use crate::transfer::TransferParams;
use crate::NVME_PAGE_SHIFT;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use user_driver::backoff::Sleep;
use user_driver::memory::PAGE_SIZE;
use user_driver::DeviceBacking;

/// Tunables for an [`NvmeDriver`].
#[derive(Debug, Clone)]
pub struct NvmeDriverConfig {
    /// Entries per queue. Clamped to what the controller supports.
    pub queue_entries: u16,
    /// The largest amount of data moved by one read or write command.
    pub max_chunk_size: usize,
    /// Completion polls allowed per read or write command.
    pub io_timeout: u32,
    /// Namespace targeted by reads and writes.
    pub nsid: u32,
    /// Interval between CSTS.RDY polls. The controller's timeout is counted in
    /// these units.
    pub ready_poll_interval: Duration,
    /// Interval between completion queue polls.
    pub command_poll_interval: Duration,
}

impl Default for NvmeDriverConfig {
    fn default() -> Self {
        Self {
            queue_entries: 64,
            max_chunk_size: transfer::DEFAULT_MAX_CHUNK_SIZE,
            io_timeout: 1000,
            nsid: 1,
            ready_poll_interval: Duration::from_millis(500),
            command_poll_interval: Duration::from_millis(10),
        }
    }
}

impl NvmeDriverConfig {
    fn validate(&self) -> Result<(), DeviceError> {
        if !(2..=MAX_QUEUE_LEN).contains(&self.queue_entries) {
            return Err(DeviceError::InvalidConfig("queue entries out of range"));
        }
        if self.max_chunk_size == 0
            || self.max_chunk_size % PAGE_SIZE != 0
            || self.max_chunk_size > transfer::MAX_CHUNK_SIZE_LIMIT
        {
            return Err(DeviceError::InvalidConfig(
                "chunk size must be a page multiple no larger than one prp list",
            ));
        }
        if self.nsid == 0 {
            return Err(DeviceError::InvalidConfig("namespace id must be nonzero"));
        }
        Ok(())
    }
}

/// An NVMe driver error.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to map device registers")]
    MapRegisters(#[source] anyhow::Error),
    #[error("device is gone")]
    Gone,
    #[error("unsupported minimum page size: {0}")]
    UnsupportedPageSize(u8),
    #[error("controller supports queues of only {0} entries")]
    UnsupportedQueueSize(u32),
    #[error("failed to disable the controller")]
    Disable(#[source] ReadyError),
    #[error("failed to enable the controller")]
    Enable(#[source] ReadyError),
    #[error("failed to allocate {0}")]
    Allocation(&'static str, #[source] anyhow::Error),
    #[error("peer ring address {0:#x} is not a nonzero page aligned address")]
    InvalidRingAddress(u64),
    #[error("failed to create io completion queue {1}")]
    IoCompletionQueueFailure(#[source] RequestError, u16),
    #[error("failed to create io submission queue {1}")]
    IoSubmissionQueueFailure(#[source] RequestError, u16),
    #[error("failed to delete io submission queue {1}")]
    DeleteIoSubmissionQueueFailure(#[source] RequestError, u16),
    #[error("failed to delete io completion queue {1}")]
    DeleteIoCompletionQueueFailure(#[source] RequestError, u16),
}

/// Controller capabilities, as read from CAP at attach time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControllerCaps {
    /// Maximum entries per queue supported by the controller.
    pub max_queue_entries: u32,
    /// Worst-case CSTS.RDY transition time, in 500ms units.
    pub timeout: u8,
    /// Distance between doorbell registers, in bytes.
    pub doorbell_stride: usize,
    /// Whether queues must be physically contiguous.
    pub contiguous_queues_required: bool,
    /// Entries per queue actually used by this driver.
    pub queue_entries: u16,
}

/// An NVMe driver with at most one host-owned and one peer-owned I/O queue
/// pair.
///
/// All operations are synchronous. The driver must be externally serialized,
/// which `&mut self` enforces.
pub struct NvmeDriver<T: DeviceBacking> {
    device: T,
    allocator: T::DmaAllocator,
    registers: Arc<DeviceRegisters<T>>,
    sleep: Arc<dyn Sleep>,
    bar_address: u64,
    queue_len: u16,
    poll_interval: Duration,
    params: TransferParams,
    admin: AdminQueue<T>,
    host_io: Option<QueuePair<T>>,
    peer_io: Option<PeerQueue>,
    shut_down: bool,
}

impl<T: DeviceBacking> NvmeDriver<T> {
    /// Initializes the driver: resets and enables the controller with a new
    /// admin queue, then creates the host I/O queue pair.
    ///
    /// On failure everything set up so far is torn down again.
    pub fn new(
        mut device: T,
        sleep: Arc<dyn Sleep>,
        config: NvmeDriverConfig,
    ) -> Result<Self, DeviceError> {
        let pci_id = device.id().to_owned();
        let _span = tracing::info_span!("nvme_new", pci_id).entered();

        config.validate()?;

        let bar_address = device.bar_address(0).map_err(DeviceError::MapRegisters)?;
        let bar0 = Bar0(device.map_bar(0).map_err(DeviceError::MapRegisters)?);
        let registers = Arc::new(DeviceRegisters::<T>::new(bar0));
        let cap = registers.cap;

        if u64::from(cap) == !0 {
            return Err(DeviceError::Gone);
        }

        if cap.mpsmin() != 0 {
            return Err(DeviceError::UnsupportedPageSize(
                cap.mpsmin() + NVME_PAGE_SHIFT,
            ));
        }

        let max_entries = u32::from(cap.mqes_z()) + 1;
        if max_entries < 2 {
            return Err(DeviceError::UnsupportedQueueSize(max_entries));
        }
        let queue_len = if u32::from(config.queue_entries) > max_entries {
            tracing::warn!(
                requested = config.queue_entries,
                max_entries,
                "clamping queue size to controller maximum"
            );
            max_entries as u16
        } else {
            config.queue_entries
        };

        tracing::debug!(
            mqes = max_entries,
            to = cap.to(),
            dstrd = cap.dstrd(),
            bar_address,
            "read controller capabilities"
        );

        let allocator = device.host_allocator();
        let admin = AdminQueue::enable(&registers, &allocator, &sleep, queue_len, &config)?;

        let params = TransferParams {
            max_chunk_size: config.max_chunk_size,
            nsid: config.nsid,
            timeout: config.io_timeout,
        };

        let mut this = Self {
            device,
            allocator,
            registers,
            sleep,
            bar_address,
            queue_len,
            poll_interval: config.command_poll_interval,
            params,
            admin,
            host_io: None,
            peer_io: None,
            shut_down: false,
        };

        if let Err(err) = this.setup_host_io_queue() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "device initialization failed, shutting down"
            );
            this.shutdown();
            return Err(err);
        }

        Ok(this)
    }

    /// Creates the host-owned I/O queue pair, if not already present.
    pub fn setup_host_io_queue(&mut self) -> Result<QueueSetup, DeviceError> {
        if self.host_io.is_some() {
            return Ok(QueueSetup::AlreadyPresent);
        }
        let queue = QueuePair::new(
            &self.allocator,
            HOST_QID,
            self.queue_len,
            self.registers.clone(),
            self.sleep.clone(),
            self.poll_interval,
        )
        .map_err(|err| DeviceError::Allocation("host io queues", err))?;

        // On failure the queue memory is freed here, after the controller has
        // let go of it.
        create_io_queue(
            &mut self.admin,
            HOST_QID,
            queue.sq_addr(),
            queue.cq_addr(),
            self.queue_len,
        )?;
        self.host_io = Some(queue);
        Ok(QueueSetup::Created)
    }

    /// Registers I/O queue pair rings that live in a peer device's memory, if
    /// no peer queue pair is already present.
    pub fn setup_peer_io_queue(&mut self, rings: PeerRings) -> Result<QueueSetup, DeviceError> {
        if self.peer_io.is_some() {
            return Ok(QueueSetup::AlreadyPresent);
        }
        let queue = PeerQueue::new(rings)?;
        create_io_queue(
            &mut self.admin,
            PEER_QID,
            rings.sq_addr,
            rings.cq_addr,
            self.queue_len,
        )?;
        self.peer_io = Some(queue);
        Ok(QueueSetup::Created)
    }

    /// Deletes an I/O queue pair from the controller and forgets it.
    ///
    /// The queue is forgotten, and any host memory freed, even if the
    /// controller fails the deletion.
    pub fn release_io_queue(&mut self, ownership: Ownership) -> Result<QueueRelease, DeviceError> {
        let queue = match ownership {
            Ownership::Host => self.host_io.take().map(IoQueue::Host),
            Ownership::Peer => self.peer_io.take().map(IoQueue::Peer),
        };
        let Some(queue) = queue else {
            return Ok(QueueRelease::NotPresent);
        };
        delete_io_queue(&mut self.admin, queue)?;
        Ok(QueueRelease::Released)
    }

    /// Reads `data.len()` bytes starting at device byte address `addr`, which
    /// must be block aligned. Returns the number of bytes read.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) -> Result<usize, TransferError> {
        let queue = self.host_io.as_mut().ok_or(TransferError::NoIoQueue)?;
        transfer::read(queue, &self.allocator, &self.params, addr, data)
    }

    /// Writes `data` starting at device byte address `addr`, which must be
    /// block aligned.
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TransferError> {
        let queue = self.host_io.as_mut().ok_or(TransferError::NoIoQueue)?;
        transfer::write(queue, &self.allocator, &self.params, addr, data)
    }

    /// Returns the physical address of the controller's register window, for
    /// handing to a peer device that rings the peer queue's doorbells.
    pub fn controller_base_address(&self) -> u64 {
        self.bar_address
    }

    pub fn capabilities(&self) -> ControllerCaps {
        let cap = self.registers.cap;
        ControllerCaps {
            max_queue_entries: u32::from(cap.mqes_z()) + 1,
            timeout: cap.to(),
            doorbell_stride: cap.doorbell_stride(),
            contiguous_queues_required: cap.cqr(),
            queue_entries: self.queue_len,
        }
    }

    /// Returns the state of an I/O queue pair, if it exists.
    pub fn io_queue_info(&self, ownership: Ownership) -> Option<IoQueueInfo> {
        match ownership {
            Ownership::Host => self.host_io.as_ref().map(|q| q.info(&self.registers)),
            Ownership::Peer => self
                .peer_io
                .as_ref()
                .map(|q| q.info(&self.registers, self.queue_len)),
        }
    }

    /// Deletes the I/O queues, disables the controller, and frees all queue
    /// memory.
    pub fn shutdown(mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        let _span = tracing::info_span!("nvme_shutdown", pci_id = self.device.id()).entered();
        self.shut_down = true;
        for ownership in [Ownership::Peer, Ownership::Host] {
            if let Err(err) = self.release_io_queue(ownership) {
                tracing::warn!(
                    ?ownership,
                    error = &err as &dyn std::error::Error,
                    "failed to release io queue"
                );
            }
        }
        self.admin.disable();
    }
}

impl<T: DeviceBacking> Drop for NvmeDriver<T> {
    fn drop(&mut self) {
        if !self.shut_down {
            self.reset();
        }
    }
}
