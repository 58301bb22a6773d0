// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The control surface offered to user space and to the peer device's
//! software: queue setup and release requests, block transfers, and the
//! numeric statuses reported for them.

use crate::driver::NvmeDriver;
use crate::io_queue::Ownership;
use crate::io_queue::PeerRings;
use crate::transfer::TransferError;
use crate::DeviceError;
use open_enum::open_enum;
use user_driver::DeviceBacking;

/// The outcome of a successful queue setup request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueSetup {
    Created,
    /// The queue pair already existed. Nothing was changed.
    AlreadyPresent,
}

/// The outcome of a successful queue release request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueRelease {
    Released,
    /// There was no such queue pair. Nothing was changed.
    NotPresent,
}

/// Status reported to callers of a queue setup request.
#[open_enum]
#[repr(u64)]
#[derive(Debug, Copy, Clone)]
pub enum SetupIoQueueStatus {
    PRESENT = 0,
    FAILED = 1,
    SUCCESS = 2,
}

impl From<&Result<QueueSetup, DeviceError>> for SetupIoQueueStatus {
    fn from(value: &Result<QueueSetup, DeviceError>) -> Self {
        match value {
            Ok(QueueSetup::Created) => Self::SUCCESS,
            Ok(QueueSetup::AlreadyPresent) => Self::PRESENT,
            Err(_) => Self::FAILED,
        }
    }
}

/// Status reported to callers of a queue release request.
#[open_enum]
#[repr(u64)]
#[derive(Debug, Copy, Clone)]
pub enum ReleaseIoQueueStatus {
    NOT_PRESENT = 0,
    FAILED = 1,
    SUCCESS = 2,
}

impl From<&Result<QueueRelease, DeviceError>> for ReleaseIoQueueStatus {
    fn from(value: &Result<QueueRelease, DeviceError>) -> Self {
        match value {
            Ok(QueueRelease::Released) => Self::SUCCESS,
            Ok(QueueRelease::NotPresent) => Self::NOT_PRESENT,
            Err(_) => Self::FAILED,
        }
    }
}

/// A request arriving on the control surface.
#[derive(Debug)]
pub enum ControlRequest<'a> {
    GetControllerBaseAddress,
    SetupHostIoQueue,
    SetupPeerIoQueue(PeerRings),
    ReleaseIoQueue(Ownership),
    Read { addr: u64, buf: &'a mut [u8] },
    Write { addr: u64, buf: &'a [u8] },
}

/// The answer to a [`ControlRequest`].
#[derive(Debug)]
pub enum ControlResponse {
    ControllerBaseAddress(u64),
    SetupIoQueue(SetupIoQueueStatus),
    ReleaseIoQueue(ReleaseIoQueueStatus),
    Read(Result<usize, TransferError>),
    Write(Result<(), TransferError>),
}

impl<T: DeviceBacking> NvmeDriver<T> {
    /// Dispatches one control request. Queue failures are logged and reduced
    /// to their wire status.
    pub fn handle_request(&mut self, request: ControlRequest<'_>) -> ControlResponse {
        match request {
            ControlRequest::GetControllerBaseAddress => {
                ControlResponse::ControllerBaseAddress(self.controller_base_address())
            }
            ControlRequest::SetupHostIoQueue => {
                let result = self.setup_host_io_queue();
                log_failure(&result, Ownership::Host, "setup");
                ControlResponse::SetupIoQueue((&result).into())
            }
            ControlRequest::SetupPeerIoQueue(rings) => {
                let result = self.setup_peer_io_queue(rings);
                log_failure(&result, Ownership::Peer, "setup");
                ControlResponse::SetupIoQueue((&result).into())
            }
            ControlRequest::ReleaseIoQueue(ownership) => {
                let result = self.release_io_queue(ownership);
                log_failure(&result, ownership, "release");
                ControlResponse::ReleaseIoQueue((&result).into())
            }
            ControlRequest::Read { addr, buf } => ControlResponse::Read(self.read(addr, buf)),
            ControlRequest::Write { addr, buf } => ControlResponse::Write(self.write(addr, buf)),
        }
    }
}

fn log_failure<R>(result: &Result<R, DeviceError>, ownership: Ownership, op: &str) {
    if let Err(err) = result {
        tracing::error!(
            ?ownership,
            op,
            error = err as &dyn std::error::Error,
            "io queue request failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn wire_values() {
        assert_eq!(SetupIoQueueStatus::PRESENT.0, 0);
        assert_eq!(SetupIoQueueStatus::FAILED.0, 1);
        assert_eq!(SetupIoQueueStatus::SUCCESS.0, 2);
        assert_eq!(ReleaseIoQueueStatus::NOT_PRESENT.0, 0);
        assert_eq!(ReleaseIoQueueStatus::FAILED.0, 1);
        assert_eq!(ReleaseIoQueueStatus::SUCCESS.0, 2);
    }

    #[test]
    fn status_from_result() {
        assert_eq!(
            SetupIoQueueStatus::from(&Ok::<_, DeviceError>(QueueSetup::AlreadyPresent)),
            SetupIoQueueStatus::PRESENT
        );
        assert_eq!(
            SetupIoQueueStatus::from(&Err::<QueueSetup, _>(DeviceError::InvalidRingAddress(0))),
            SetupIoQueueStatus::FAILED
        );
        assert_eq!(
            ReleaseIoQueueStatus::from(&Ok::<_, DeviceError>(QueueRelease::NotPresent)),
            ReleaseIoQueueStatus::NOT_PRESENT
        );
        assert_eq!(
            ReleaseIoQueueStatus::from(&Ok::<_, DeviceError>(QueueRelease::Released)),
            ReleaseIoQueueStatus::SUCCESS
        );
    }
}
