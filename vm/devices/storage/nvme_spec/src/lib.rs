// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the NVMe specifications, limited to what a driver needs to
//! bring up a controller, manage I/O queues, and issue NVM reads and writes.
//!
//! Base 2.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-Base-Specification-2.0c-2022.10.04-Ratified.pdf>
//! PCIe transport 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-PCIe-Transport-Specification-1.0c-2022.10.03-Ratified.pdf>

#![cfg_attr(not(test), no_std)]

pub mod nvm;

use bitfield_struct::bitfield;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Offset of the doorbell array within BAR0.
pub const DOORBELL_BASE: usize = 0x1000;

#[open_enum]
#[repr(u16)]
#[derive(Debug, Copy, Clone)]
pub enum Register {
    CAP = 0x0,
    VS = 0x8,
    INTMS = 0xc,
    INTMC = 0x10,
    CC = 0x14,
    RESERVED = 0x18,
    CSTS = 0x1c,
    NSSR = 0x20,
    AQA = 0x24,
    ASQ = 0x28,
    ACQ = 0x30,
}

#[bitfield(u64)]
pub struct Cap {
    pub mqes_z: u16,
    pub cqr: bool,
    pub ams_weighted_round_robin_with_urgent: bool,
    pub ams_vendor_specific: bool,
    #[bits(5)]
    pub reserved: u8,
    /// Worst-case time to flip CSTS.RDY, in 500ms units.
    pub to: u8,
    #[bits(4)]
    pub dstrd: u8,
    pub nssrs: bool,
    pub css_nvm: bool,
    #[bits(5)]
    pub css_reserved: u8,
    pub multiple_io: bool,
    pub admin_only: bool,
    pub bps: bool,
    #[bits(2)]
    pub cps: u8,
    #[bits(4)]
    pub mpsmin: u8,
    #[bits(4)]
    pub mpsmax: u8,
    pub pmrs: bool,
    pub cmbs: bool,
    pub nsss: bool,
    pub crwms: bool,
    pub crims: bool,
    #[bits(3)]
    pub reserved2: u64,
}

impl Cap {
    /// The distance between consecutive doorbell registers, in bytes.
    pub fn doorbell_stride(&self) -> usize {
        4 << self.dstrd()
    }
}

#[bitfield(u32)]
pub struct Cc {
    pub en: bool,
    #[bits(3)]
    pub reserved: u8,
    #[bits(3)]
    pub css: u8,
    #[bits(4)]
    pub mps: u8,
    #[bits(3)]
    pub ams: u8,
    #[bits(2)]
    pub shn: u8,
    #[bits(4)]
    pub iosqes: u8,
    #[bits(4)]
    pub iocqes: u8,
    pub crime: bool,
    #[bits(7)]
    pub reserved2: u8,
}

#[bitfield(u32)]
pub struct Csts {
    pub rdy: bool,
    pub cfs: bool,
    #[bits(2)]
    pub shst: u8,
    pub nssro: bool,
    pub pp: bool,
    pub st: bool,
    #[bits(25)]
    pub reserved: u32,
}

#[bitfield(u32)]
pub struct Aqa {
    #[bits(12)]
    pub asqs_z: u16,
    #[bits(4)]
    pub reserved: u8,
    #[bits(12)]
    pub acqs_z: u16,
    #[bits(4)]
    pub reserved2: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Command {
    pub cdw0: Cdw0,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub dptr: [u64; 2],
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

const _: () = assert!(size_of::<Command>() == 64);

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdw0 {
    pub opcode: u8,
    #[bits(2)]
    pub fuse: u8,
    #[bits(4)]
    pub reserved: u8,
    #[bits(2)]
    pub psdt: u8,
    pub cid: u16,
}

#[open_enum]
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum AdminOpcode {
    DELETE_IO_SUBMISSION_QUEUE = 0x00,
    CREATE_IO_SUBMISSION_QUEUE = 0x01,
    DELETE_IO_COMPLETION_QUEUE = 0x04,
    CREATE_IO_COMPLETION_QUEUE = 0x05,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Completion {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: CompletionStatus,
}

const _: () = assert!(size_of::<Completion>() == 16);

#[bitfield(u16)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CompletionStatus {
    pub phase: bool,
    /// 8 bits of status code followed by 3 bits of the status code type.
    #[bits(11)]
    pub status: u16,
    #[bits(2)]
    pub crd: u8,
    pub more: bool,
    pub dnr: bool,
}

#[open_enum]
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum StatusCodeType {
    GENERIC = 0,
    COMMAND_SPECIFIC = 1,
    MEDIA_ERROR = 2,
    PATH_RELATED = 3,
    VENDOR_SPECIFIC = 7,
}

#[open_enum]
#[repr(u16)]
#[derive(Debug, Copy, Clone)]
pub enum Status {
    SUCCESS = 0x00,
    INVALID_COMMAND_OPCODE = 0x01,
    INVALID_FIELD_IN_COMMAND = 0x02,
    COMMAND_ID_CONFLICT = 0x03,
    DATA_TRANSFER_ERROR = 0x04,
    INTERNAL_ERROR = 0x06,
    COMMAND_ABORT_REQUESTED = 0x07,
    COMMAND_ABORTED_DUE_TO_SQ_DELETION = 0x08,
    INVALID_NAMESPACE_OR_FORMAT = 0x0b,
    COMMAND_SEQUENCE_ERROR = 0x0c,
    PRP_OFFSET_INVALID = 0x13,

    LBA_OUT_OF_RANGE = 0x80,
    CAPACITY_EXCEEDED = 0x81,
    NAMESPACE_NOT_READY = 0x82,

    COMPLETION_QUEUE_INVALID = 0x100,
    INVALID_QUEUE_IDENTIFIER = 0x101,
    INVALID_QUEUE_SIZE = 0x102,
    INVALID_INTERRUPT_VECTOR = 0x108,
    INVALID_QUEUE_DELETION = 0x10c,

    ATTEMPTED_WRITE_TO_READ_ONLY_RANGE = 0x182,

    MEDIA_WRITE_FAULT = 0x280,
    MEDIA_UNRECOVERED_READ_ERROR = 0x281,
    MEDIA_ACCESS_DENIED = 0x286,
}

impl Status {
    pub fn status_code(&self) -> u8 {
        self.0 as u8
    }

    pub fn status_code_type(&self) -> StatusCodeType {
        StatusCodeType((self.0 >> 8) as u8)
    }
}

#[bitfield(u32)]
pub struct Cdw10CreateIoQueue {
    pub qid: u16,
    pub qsize_z: u16,
}

#[bitfield(u32)]
pub struct Cdw11CreateIoCompletionQueue {
    pub pc: bool,
    pub ien: bool,
    #[bits(14)]
    pub rsvd: u16,
    pub iv: u16,
}

#[bitfield(u32)]
pub struct Cdw11CreateIoSubmissionQueue {
    pub pc: bool,
    #[bits(2)]
    pub qprio: u8,
    #[bits(13)]
    pub rsvd: u16,
    pub cqid: u16,
}

/// Arbitration class of a submission queue under weighted round robin.
#[open_enum]
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
pub enum QueuePriority {
    URGENT = 0,
    HIGH = 1,
    MEDIUM = 2,
    LOW = 3,
}

#[bitfield(u32)]
pub struct Cdw10DeleteIoQueue {
    pub qid: u16,
    pub rsvd: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromZeros;

    #[test]
    fn command_layout() {
        let command = Command {
            cdw0: Cdw0::new().with_opcode(0x5).with_cid(0x1234),
            nsid: 1,
            dptr: [0x1111_2222_3333_4000, 0x5555_6666_7777_8000],
            cdw10: Cdw10CreateIoQueue::new()
                .with_qid(2)
                .with_qsize_z(63)
                .into(),
            ..FromZeros::new_zeroed()
        };
        let bytes = command.as_bytes();
        assert_eq!(bytes[0], 0x5);
        assert_eq!(&bytes[2..4], &0x1234u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[24..32], &0x1111_2222_3333_4000u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &0x5555_6666_7777_8000u64.to_le_bytes());
        assert_eq!(&bytes[40..44], &((63u32 << 16) | 2).to_le_bytes());
    }

    #[test]
    fn completion_status_bits() {
        let mut completion = Completion::new_zeroed();
        completion.status = CompletionStatus::new()
            .with_phase(true)
            .with_status(Status::INVALID_QUEUE_DELETION.0)
            .with_dnr(true);
        let bytes = completion.as_bytes();
        let raw = u16::from_le_bytes([bytes[14], bytes[15]]);
        assert_eq!(raw & 1, 1);
        assert_eq!((raw >> 1) & 0xff, 0x0c);
        assert_eq!((raw >> 9) & 0x7, 1);
        assert_eq!(raw >> 15, 1);

        let status = Status(completion.status.status());
        assert_eq!(status.status_code(), 0x0c);
        assert_eq!(status.status_code_type(), StatusCodeType::COMMAND_SPECIFIC);
    }

    #[test]
    fn capability_fields() {
        let cap = Cap::from(0x0000_0020_1e01_003f_u64);
        assert_eq!(cap.mqes_z(), 63);
        assert!(cap.cqr());
        assert_eq!(cap.to(), 0x1e);
        assert_eq!(cap.dstrd(), 0);
        assert!(cap.css_nvm());
        assert_eq!(cap.doorbell_stride(), 4);
        assert_eq!(cap.with_dstrd(2).doorbell_stride(), 16);
    }

    #[test]
    fn create_submission_queue_dword() {
        let cdw11: u32 = Cdw11CreateIoSubmissionQueue::new()
            .with_pc(true)
            .with_qprio(QueuePriority::MEDIUM.0)
            .with_cqid(1)
            .into();
        assert_eq!(cdw11, (1 << 16) | (2 << 1) | 1);
    }
}
