// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Implementation of submission and completion queues.

use super::spec;
use crate::registers::DeviceRegisters;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use user_driver::memory::MemoryBlock;
use user_driver::DeviceBacking;

pub(crate) struct SubmissionQueue {
    sqid: u16,
    head: u32,
    tail: u32,
    committed_tail: u32,
    len: u32,
    mem: MemoryBlock,
}

#[derive(Debug)]
pub(crate) struct QueueFull;

impl SubmissionQueue {
    pub fn new(sqid: u16, len: u16, mem: MemoryBlock) -> Self {
        Self {
            sqid,
            head: 0,
            tail: 0,
            committed_tail: 0,
            len: len.into(),
            mem,
        }
    }

    pub fn id(&self) -> u16 {
        self.sqid
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Records the controller's consumption point, as reported in a
    /// completion's SQ head pointer.
    pub fn update_head(&mut self, head: u16) {
        let head = head as u32;
        if head >= self.len {
            tracing::warn!(sqid = self.sqid, head, "ignoring out of range sq head");
            return;
        }
        self.head = head;
    }

    pub fn write(&mut self, command: spec::Command) -> Result<(), QueueFull> {
        let next_tail = advance(self.tail, self.len);
        if next_tail == self.head {
            return Err(QueueFull);
        }
        self.mem
            .write_obj(self.tail as usize * size_of_val(&command), &command);
        self.tail = next_tail;
        Ok(())
    }

    pub fn commit<T: DeviceBacking>(&mut self, registers: &DeviceRegisters<T>) {
        if self.tail != self.committed_tail {
            fence(Ordering::SeqCst);
            registers.doorbell(self.sqid, false, self.tail);
            self.committed_tail = self.tail;
        }
    }
}

pub(crate) struct CompletionQueue {
    cqid: u16,
    head: u32,
    committed_head: u32,
    len: u32,
    /// The phase tag that marks a newly posted entry. Flips on every wrap.
    phase: bool,
    mem: MemoryBlock,
}

impl CompletionQueue {
    pub fn new(cqid: u16, len: u16, mem: MemoryBlock) -> CompletionQueue {
        Self {
            cqid,
            head: 0,
            committed_head: 0,
            len: len.into(),
            phase: true,
            mem,
        }
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    pub fn read(&mut self) -> Option<spec::Completion> {
        let completion = self
            .mem
            .read_obj::<spec::Completion>(self.head as usize * size_of::<spec::Completion>());
        if completion.status.phase() != self.phase {
            return None;
        }
        self.head += 1;
        if self.head == self.len {
            self.head = 0;
            self.phase = !self.phase;
        }
        Some(completion)
    }

    pub fn commit<T: DeviceBacking>(&mut self, registers: &DeviceRegisters<T>) {
        if self.head != self.committed_head {
            fence(Ordering::SeqCst);
            registers.doorbell(self.cqid, true, self.head);
            self.committed_head = self.head;
        }
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l {
        n + 1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use user_driver::emulated::DeviceSharedMemory;
    use user_driver::memory::PAGE_SIZE;
    use zerocopy::FromZeros;

    fn command(cid: u16) -> spec::Command {
        spec::Command {
            cdw0: spec::Cdw0::new().with_cid(cid),
            ..FromZeros::new_zeroed()
        }
    }

    fn post(mem: &MemoryBlock, slot: usize, phase: bool, cid: u16) {
        let completion = spec::Completion {
            cid,
            status: spec::CompletionStatus::new().with_phase(phase),
            ..FromZeros::new_zeroed()
        };
        mem.write_obj(slot * size_of::<spec::Completion>(), &completion);
    }

    #[test]
    fn tail_wraps_after_len_submissions() {
        let shared = DeviceSharedMemory::new(PAGE_SIZE);
        let mem = shared.allocate(PAGE_SIZE).unwrap();
        let mut sq = SubmissionQueue::new(1, 64, mem.clone());
        for i in 0..65u16 {
            sq.write(command(i)).unwrap();
            sq.update_head(sq.tail() as u16);
        }
        assert_eq!(sq.tail(), 1);
        // The 65th command landed back in slot 0.
        let first = mem.read_obj::<spec::Command>(0);
        assert_eq!(first.cdw0.cid(), 64);
    }

    #[test]
    fn full_queue_rejects_command() {
        let shared = DeviceSharedMemory::new(PAGE_SIZE);
        let mut sq = SubmissionQueue::new(1, 4, shared.allocate(PAGE_SIZE).unwrap());
        for i in 0..3 {
            sq.write(command(i)).unwrap();
        }
        assert!(sq.write(command(3)).is_err());
        assert_eq!(sq.tail(), 3);

        sq.update_head(1);
        sq.write(command(3)).unwrap();
        assert_eq!(sq.tail(), 0);

        // Bogus head values from the device are ignored.
        sq.update_head(4);
        assert!(sq.write(command(4)).is_err());
    }

    #[test]
    fn phase_flips_on_wrap() {
        let shared = DeviceSharedMemory::new(PAGE_SIZE);
        let mem = shared.allocate(PAGE_SIZE).unwrap();
        let mut cq = CompletionQueue::new(1, 4, mem.clone());
        assert!(cq.read().is_none());

        for round in 0..3u16 {
            let phase = round % 2 == 0;
            assert_eq!(cq.phase(), phase);
            for slot in 0..4u16 {
                post(&mem, slot.into(), phase, round * 4 + slot);
                let completion = cq.read().unwrap();
                assert_eq!(completion.cid, round * 4 + slot);
                // The same entry is not consumed twice.
                if slot < 3 {
                    assert!(cq.read().is_none());
                }
            }
            assert_eq!(cq.head(), 0);
        }
        assert!(!cq.phase());
    }
}
