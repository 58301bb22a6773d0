// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A driver for an NVMe controller that shares its I/O queues with a peer
//! device.
//!
//! The driver brings the controller up, creates a host-owned I/O queue pair
//! for block reads and writes, and registers a second I/O queue pair whose
//! rings and doorbell writes belong to a peer device such as an FPGA.

#![forbid(unsafe_code)]

mod admin;
mod control;
mod driver;
mod io_queue;
mod queue_pair;
mod queues;
mod registers;
mod transfer;

#[cfg(test)]
mod tests;

pub use self::control::ControlRequest;
pub use self::control::ControlResponse;
pub use self::control::QueueRelease;
pub use self::control::QueueSetup;
pub use self::control::ReleaseIoQueueStatus;
pub use self::control::SetupIoQueueStatus;
pub use self::driver::ControllerCaps;
pub use self::driver::DeviceError;
pub use self::driver::NvmeDriver;
pub use self::driver::NvmeDriverConfig;
pub use self::io_queue::HostRingState;
pub use self::io_queue::IoQueueInfo;
pub use self::io_queue::Ownership;
pub use self::io_queue::PeerRings;
pub use self::io_queue::HOST_QID;
pub use self::io_queue::PEER_QID;
pub use self::queue_pair::NvmeError;
pub use self::queue_pair::RequestError;
pub use self::registers::ReadyError;
pub use self::transfer::TransferError;
pub use self::transfer::DEFAULT_MAX_CHUNK_SIZE;
pub use self::transfer::MAX_CHUNK_SIZE_LIMIT;

use nvme_spec as spec;

const NVME_PAGE_SHIFT: u8 = 12;
