// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Creation and deletion of the I/O queue pairs.
//!
//! The controller hosts at most two I/O queue pairs. The host pair's rings
//! live in host DMA memory and are driven by this driver. The peer pair's
//! rings live in a peer device's memory; this driver only registers them and
//! never touches their contents or doorbells.

use super::spec;
use crate::admin::AdminQueue;
use crate::driver::DeviceError;
use crate::queue_pair::admin_cmd;
use crate::queue_pair::QueuePair;
use crate::registers::DeviceRegisters;
use user_driver::memory::PAGE_SIZE64;
use user_driver::DeviceBacking;

/// Queue identifier used for the host-owned I/O queue pair.
pub const HOST_QID: u16 = 2;
/// Queue identifier used for the peer-owned I/O queue pair.
pub const PEER_QID: u16 = 1;

/// Which agent owns an I/O queue pair's rings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Rings in host memory, driven by this driver.
    Host,
    /// Rings in a peer device's memory, driven by that device.
    Peer,
}

impl Ownership {
    pub fn qid(self) -> u16 {
        match self {
            Ownership::Host => HOST_QID,
            Ownership::Peer => PEER_QID,
        }
    }
}

/// Physical addresses of ring memory supplied by a peer device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerRings {
    pub sq_addr: u64,
    pub cq_addr: u64,
}

pub(crate) enum IoQueue<T: DeviceBacking> {
    Host(QueuePair<T>),
    Peer(PeerQueue),
}

pub(crate) struct PeerQueue {
    rings: PeerRings,
}

impl PeerQueue {
    /// Checks that both rings are at nonzero, page aligned addresses.
    pub fn new(rings: PeerRings) -> Result<Self, DeviceError> {
        for addr in [rings.sq_addr, rings.cq_addr] {
            if addr == 0 || addr % PAGE_SIZE64 != 0 {
                return Err(DeviceError::InvalidRingAddress(addr));
            }
        }
        Ok(Self { rings })
    }
}

impl<T: DeviceBacking> IoQueue<T> {
    pub fn ownership(&self) -> Ownership {
        match self {
            IoQueue::Host(_) => Ownership::Host,
            IoQueue::Peer(_) => Ownership::Peer,
        }
    }

    fn ring_addrs(&self) -> (u64, u64) {
        match self {
            IoQueue::Host(queue) => (queue.sq_addr(), queue.cq_addr()),
            IoQueue::Peer(queue) => (queue.rings.sq_addr, queue.rings.cq_addr),
        }
    }
}

/// A snapshot of a live I/O queue pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoQueueInfo {
    pub qid: u16,
    pub ownership: Ownership,
    pub len: u16,
    pub sq_addr: u64,
    pub cq_addr: u64,
    /// BAR0 offset of the submission queue tail doorbell.
    pub sq_doorbell: usize,
    /// BAR0 offset of the completion queue head doorbell.
    pub cq_doorbell: usize,
    /// Ring positions, known only for host-owned queues.
    pub host_state: Option<HostRingState>,
}

/// Ring positions of a host-owned queue pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HostRingState {
    pub sq_tail: u32,
    pub cq_head: u32,
    /// The phase tag a newly posted completion will carry. Starts `true` and
    /// flips each time the completion ring wraps.
    pub cq_phase: bool,
}

impl PeerQueue {
    pub fn info<T: DeviceBacking>(&self, registers: &DeviceRegisters<T>, len: u16) -> IoQueueInfo {
        IoQueueInfo {
            qid: PEER_QID,
            ownership: Ownership::Peer,
            len,
            sq_addr: self.rings.sq_addr,
            cq_addr: self.rings.cq_addr,
            sq_doorbell: registers.doorbell_offset(PEER_QID, false),
            cq_doorbell: registers.doorbell_offset(PEER_QID, true),
            host_state: None,
        }
    }
}

impl<T: DeviceBacking> QueuePair<T> {
    pub fn info(&self, registers: &DeviceRegisters<T>) -> IoQueueInfo {
        IoQueueInfo {
            qid: self.id(),
            ownership: Ownership::Host,
            len: self.len(),
            sq_addr: self.sq_addr(),
            cq_addr: self.cq_addr(),
            sq_doorbell: registers.doorbell_offset(self.id(), false),
            cq_doorbell: registers.doorbell_offset(self.id(), true),
            host_state: Some(HostRingState {
                sq_tail: self.sq_tail(),
                cq_head: self.cq_head(),
                cq_phase: self.cq_phase(),
            }),
        }
    }
}

/// Registers I/O queue pair `qid` of `len` entries with the controller. The
/// completion queue is created first; if the submission queue then fails, the
/// completion queue is deleted again.
pub(crate) fn create_io_queue<T: DeviceBacking>(
    admin: &mut AdminQueue<T>,
    qid: u16,
    sq_addr: u64,
    cq_addr: u64,
    len: u16,
) -> Result<(), DeviceError> {
    admin
        .issue(spec::Command {
            dptr: [cq_addr, 0],
            cdw10: spec::Cdw10CreateIoQueue::new()
                .with_qid(qid)
                .with_qsize_z(len - 1)
                .into(),
            cdw11: spec::Cdw11CreateIoCompletionQueue::new()
                .with_pc(true)
                .with_ien(false)
                .into(),
            ..admin_cmd(spec::AdminOpcode::CREATE_IO_COMPLETION_QUEUE)
        })
        .map_err(|err| DeviceError::IoCompletionQueueFailure(err, qid))?;

    if let Err(err) = admin.issue(spec::Command {
        dptr: [sq_addr, 0],
        cdw10: spec::Cdw10CreateIoQueue::new()
            .with_qid(qid)
            .with_qsize_z(len - 1)
            .into(),
        cdw11: spec::Cdw11CreateIoSubmissionQueue::new()
            .with_pc(true)
            .with_qprio(spec::QueuePriority::MEDIUM.0)
            .with_cqid(qid)
            .into(),
        ..admin_cmd(spec::AdminOpcode::CREATE_IO_SUBMISSION_QUEUE)
    }) {
        if let Err(err) = admin.issue(delete_cmd(
            spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE,
            qid,
        )) {
            tracing::error!(
                qid,
                error = &err as &dyn std::error::Error,
                "failed to delete completion queue after submission queue failure"
            );
        }
        return Err(DeviceError::IoSubmissionQueueFailure(err, qid));
    }

    tracing::info!(qid, sq_addr, cq_addr, len, "created io queue");
    Ok(())
}

/// Deletes the submission queue, then the completion queue. Both deletions
/// are attempted and host ring memory is freed regardless of the outcome.
pub(crate) fn delete_io_queue<T: DeviceBacking>(
    admin: &mut AdminQueue<T>,
    queue: IoQueue<T>,
) -> Result<(), DeviceError> {
    let qid = queue.ownership().qid();
    let (sq_addr, cq_addr) = queue.ring_addrs();
    let sq = admin.issue(delete_cmd(
        spec::AdminOpcode::DELETE_IO_SUBMISSION_QUEUE,
        qid,
    ));
    let cq = admin.issue(delete_cmd(
        spec::AdminOpcode::DELETE_IO_COMPLETION_QUEUE,
        qid,
    ));
    drop(queue);

    match (sq, cq) {
        (Ok(_), Ok(_)) => {
            tracing::info!(qid, sq_addr, cq_addr, "deleted io queue");
            Ok(())
        }
        (Err(err), cq) => {
            if let Err(cq_err) = cq {
                tracing::error!(
                    qid,
                    error = &cq_err as &dyn std::error::Error,
                    "failed to delete completion queue"
                );
            }
            Err(DeviceError::DeleteIoSubmissionQueueFailure(err, qid))
        }
        (Ok(_), Err(err)) => Err(DeviceError::DeleteIoCompletionQueueFailure(err, qid)),
    }
}

fn delete_cmd(opcode: spec::AdminOpcode, qid: u16) -> spec::Command {
    spec::Command {
        cdw10: spec::Cdw10DeleteIoQueue::new().with_qid(qid).into(),
        ..admin_cmd(opcode)
    }
}
