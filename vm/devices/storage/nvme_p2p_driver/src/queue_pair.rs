// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of an admin or host-owned IO queue pair.
//!
//! Commands are issued synchronously: at most one command is outstanding on a
//! queue pair, and completions are found by polling the completion queue's
//! phase tag.

use super::spec;
use crate::queues::CompletionQueue;
use crate::queues::SubmissionQueue;
use crate::registers::DeviceRegisters;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use user_driver::backoff::Backoff;
use user_driver::backoff::BudgetExhausted;
use user_driver::backoff::Sleep;
use user_driver::memory::MemoryBlock;
use user_driver::memory::PAGE_SIZE;
use user_driver::DeviceBacking;
use user_driver::HostDmaAllocator;
use zerocopy::FromZeros;

pub(crate) struct QueuePair<T: DeviceBacking> {
    sq: SubmissionQueue,
    cq: CompletionQueue,
    len: u16,
    registers: Arc<DeviceRegisters<T>>,
    sleep: Arc<dyn Sleep>,
    poll_interval: Duration,
    mem: MemoryBlock,
}

const MAX_SQSIZE: u16 = (PAGE_SIZE / 64) as u16; // Maximum SQ size in entries.
const MAX_CQSIZE: u16 = (PAGE_SIZE / 16) as u16; // Maximum CQ size in entries.

/// The largest queue pair that fits one page per ring.
pub(crate) const MAX_QUEUE_LEN: u16 = if MAX_SQSIZE < MAX_CQSIZE {
    MAX_SQSIZE
} else {
    MAX_CQSIZE
};

impl<T: DeviceBacking> QueuePair<T> {
    /// Allocates one page for each ring. Nothing is registered with the
    /// controller.
    pub fn new(
        allocator: &impl HostDmaAllocator,
        qid: u16,
        len: u16,
        registers: Arc<DeviceRegisters<T>>,
        sleep: Arc<dyn Sleep>,
        poll_interval: Duration,
    ) -> anyhow::Result<Self> {
        assert!(len <= MAX_QUEUE_LEN);

        let mem = allocator
            .allocate_dma_buffer(PAGE_SIZE * 2)
            .context("failed to allocate memory for queues")?;

        let sq_mem = mem.subblock(0, PAGE_SIZE);
        let cq_mem = mem.subblock(PAGE_SIZE, PAGE_SIZE);

        Ok(Self {
            sq: SubmissionQueue::new(qid, len, sq_mem),
            cq: CompletionQueue::new(qid, len, cq_mem),
            len,
            registers,
            sleep,
            poll_interval,
            mem,
        })
    }

    pub fn id(&self) -> u16 {
        self.sq.id()
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn sq_addr(&self) -> u64 {
        self.mem.physical_address()
    }

    pub fn cq_addr(&self) -> u64 {
        self.mem.physical_address() + PAGE_SIZE as u64
    }

    pub fn sq_tail(&self) -> u32 {
        self.sq.tail()
    }

    pub fn cq_head(&self) -> u32 {
        self.cq.head()
    }

    pub fn cq_phase(&self) -> bool {
        self.cq.phase()
    }

    /// Writes `command` at the current tail, using the tail slot as the
    /// command identifier, and rings the tail doorbell. Returns the
    /// identifier.
    pub fn submit(&mut self, mut command: spec::Command) -> Result<u16, RequestError> {
        let cid = self.sq.tail() as u16;
        command.cdw0.set_cid(cid);
        self.sq.write(command).map_err(|_| RequestError::QueueFull)?;
        self.sq.commit(&self.registers);
        Ok(cid)
    }

    /// Polls for the next completion, sleeping one poll interval between
    /// checks, for at most `timeout + 1` intervals.
    ///
    /// On timeout the completion queue state is left untouched, so a later
    /// call can still pick up the late completion.
    pub fn wait(&mut self, timeout: u32) -> Result<spec::Completion, RequestError> {
        let sleep = self.sleep.clone();
        let mut backoff = Backoff::new(&*sleep, self.poll_interval, timeout);
        self.next_completion(&mut backoff)
    }

    fn next_completion(
        &mut self,
        backoff: &mut Backoff<'_>,
    ) -> Result<spec::Completion, RequestError> {
        let completion = loop {
            if let Some(completion) = self.cq.read() {
                break completion;
            }
            backoff.back_off().map_err(RequestError::Timeout)?;
        };
        self.cq.commit(&self.registers);
        self.sq.update_head(completion.sqhd);
        if completion.sqid != self.sq.id() {
            tracing::warn!(
                qid = self.sq.id(),
                sqid = completion.sqid,
                cid = completion.cid,
                "completion names a different submission queue"
            );
        }
        Ok(completion)
    }

    /// Submits `command` and waits for its completion, failing if the
    /// controller reports an error status.
    ///
    /// Late completions of earlier, timed-out commands are consumed and
    /// dropped while waiting.
    pub fn issue(
        &mut self,
        command: spec::Command,
        timeout: u32,
    ) -> Result<spec::Completion, RequestError> {
        let cid = self.submit(command)?;
        let sleep = self.sleep.clone();
        let mut backoff = Backoff::new(&*sleep, self.poll_interval, timeout);
        let completion = loop {
            let completion = self.next_completion(&mut backoff)?;
            if completion.cid == cid {
                break completion;
            }
            tracing::warn!(
                qid = self.sq.id(),
                expected = cid,
                cid = completion.cid,
                status = completion.status.status(),
                "dropping completion of an earlier command"
            );
        };
        let status = spec::Status(completion.status.status());
        if status == spec::Status::SUCCESS {
            Ok(completion)
        } else {
            Err(RequestError::Nvme(NvmeError(status)))
        }
    }
}

/// An error issuing an NVMe request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("submission queue is full")]
    QueueFull,
    #[error("timed out waiting for completion")]
    Timeout(#[source] BudgetExhausted),
    #[error("nvme error")]
    Nvme(#[source] NvmeError),
}

impl RequestError {
    /// Returns the controller status, if the controller completed the
    /// command with an error.
    pub fn status(&self) -> Option<spec::Status> {
        match self {
            RequestError::Nvme(err) => Some(err.status()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct NvmeError(spec::Status);

impl NvmeError {
    pub fn status(&self) -> spec::Status {
        self.0
    }
}

impl From<spec::Status> for NvmeError {
    fn from(value: spec::Status) -> Self {
        Self(value)
    }
}

impl std::error::Error for NvmeError {}

impl std::fmt::Display for NvmeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.status_code_type() {
            spec::StatusCodeType::GENERIC => write!(f, "general error {:#x?}", self.0),
            spec::StatusCodeType::COMMAND_SPECIFIC => {
                write!(f, "command-specific error {:#x?}", self.0)
            }
            spec::StatusCodeType::MEDIA_ERROR => {
                write!(f, "media error {:#x?}", self.0)
            }
            _ => write!(f, "{:#x?}", self.0),
        }
    }
}

/// Builds an admin command with every field but the opcode zeroed.
pub(crate) fn admin_cmd(opcode: spec::AdminOpcode) -> spec::Command {
    spec::Command {
        cdw0: spec::Cdw0::new().with_opcode(opcode.0),
        ..FromZeros::new_zeroed()
    }
}
