// Licensed under the MIT License.

//! Definitions from the NVMe specifications:
//!
//! Base 2.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-Base-Specification-2.0c-2022.10.04-Ratified.pdf>
//! PCIe transport 1.0c: <https://nvmexpress.org/wp-content/uploads/NVM-Express-PCIe-Transport-Specification-1.0c-2022.10.03-Ratified.pdf>

#![no_std]

pub mod pci;

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Controller register offsets within BAR0.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Register(pub u16);

impl Register {
    pub const CAP: Register = Register(0x0);
    pub const VS: Register = Register(0x8);
    pub const INTMS: Register = Register(0xc);
    pub const INTMC: Register = Register(0x10);
    pub const CC: Register = Register(0x14);
    pub const CSTS: Register = Register(0x1c);
    pub const NSSR: Register = Register(0x20);
    pub const AQA: Register = Register(0x24);
    pub const ASQ: Register = Register(0x28);
    pub const ACQ: Register = Register(0x30);

    /// Offset of the first doorbell register.
    pub const DOORBELL_BASE: u16 = 0x1000;
}

/// CAP: controller capabilities.
#[bitfield(u64)]
pub struct Cap {
    pub mqes_z: u16,
    pub cqr: bool,
    pub ams_weighted_round_robin_with_urgent: bool,
    pub ams_vendor_specific: bool,
    #[bits(5)]
    pub reserved: u8,
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

/// CC: controller configuration.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
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

/// CSTS: controller status.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
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

/// AQA: admin queue attributes. Sizes are zeroes-based.
#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
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

/// A 64-byte submission queue entry.
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

/// Command DWORD 0, common to all commands.
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

/// Admin command opcodes.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct AdminOpcode(pub u8);

impl AdminOpcode {
    pub const DELETE_IO_SUBMISSION_QUEUE: AdminOpcode = AdminOpcode(0x00);
    pub const CREATE_IO_SUBMISSION_QUEUE: AdminOpcode = AdminOpcode(0x01);
    pub const DELETE_IO_COMPLETION_QUEUE: AdminOpcode = AdminOpcode(0x04);
    pub const CREATE_IO_COMPLETION_QUEUE: AdminOpcode = AdminOpcode(0x05);
    pub const IDENTIFY: AdminOpcode = AdminOpcode(0x06);
    pub const ABORT: AdminOpcode = AdminOpcode(0x08);
    pub const SET_FEATURES: AdminOpcode = AdminOpcode(0x09);
    pub const GET_FEATURES: AdminOpcode = AdminOpcode(0x0a);
    pub const ASYNCHRONOUS_EVENT_REQUEST: AdminOpcode = AdminOpcode(0x0c);
    pub const KEEP_ALIVE: AdminOpcode = AdminOpcode(0x18);
}

impl core::fmt::Debug for AdminOpcode {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match *self {
            Self::DELETE_IO_SUBMISSION_QUEUE => "DELETE_IO_SUBMISSION_QUEUE",
            Self::CREATE_IO_SUBMISSION_QUEUE => "CREATE_IO_SUBMISSION_QUEUE",
            Self::DELETE_IO_COMPLETION_QUEUE => "DELETE_IO_COMPLETION_QUEUE",
            Self::CREATE_IO_COMPLETION_QUEUE => "CREATE_IO_COMPLETION_QUEUE",
            Self::IDENTIFY => "IDENTIFY",
            Self::ABORT => "ABORT",
            Self::SET_FEATURES => "SET_FEATURES",
            Self::GET_FEATURES => "GET_FEATURES",
            Self::ASYNCHRONOUS_EVENT_REQUEST => "ASYNCHRONOUS_EVENT_REQUEST",
            Self::KEEP_ALIVE => "KEEP_ALIVE",
            _ => return core::fmt::Debug::fmt(&self.0, fmt),
        };
        fmt.pad(s)
    }
}

/// A 16-byte completion queue entry.
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

/// Completion status field, including the phase tag.
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

/// Status code types.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(transparent)]
pub struct StatusCodeType(pub u8);

impl StatusCodeType {
    pub const GENERIC: StatusCodeType = StatusCodeType(0);
    pub const COMMAND_SPECIFIC: StatusCodeType = StatusCodeType(1);
    pub const MEDIA_ERROR: StatusCodeType = StatusCodeType(2);
    pub const PATH_RELATED: StatusCodeType = StatusCodeType(3);
    pub const VENDOR_SPECIFIC: StatusCodeType = StatusCodeType(7);
}

/// Completion status values, combining the status code type (upper bits) and
/// status code (low 8 bits).
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    pub const INVALID_COMMAND_OPCODE: Status = Status(0x01);
    pub const INVALID_FIELD_IN_COMMAND: Status = Status(0x02);
    pub const COMMAND_ID_CONFLICT: Status = Status(0x03);
    pub const DATA_TRANSFER_ERROR: Status = Status(0x04);
    pub const INTERNAL_ERROR: Status = Status(0x06);
    pub const COMMAND_ABORTED_DUE_TO_SQ_DELETION: Status = Status(0x08);
    pub const INVALID_NAMESPACE_OR_FORMAT: Status = Status(0x0b);
    pub const COMMAND_SEQUENCE_ERROR: Status = Status(0x0c);
    pub const PRP_OFFSET_INVALID: Status = Status(0x13);

    pub const COMPLETION_QUEUE_INVALID: Status = Status(0x100);
    pub const INVALID_QUEUE_IDENTIFIER: Status = Status(0x101);
    pub const INVALID_QUEUE_SIZE: Status = Status(0x102);
    pub const INVALID_QUEUE_DELETION: Status = Status(0x10c);

    /// The status code, the low 8 bits of the value.
    pub fn status_code(&self) -> u8 {
        self.0 as u8
    }

    /// The status code type, the bits above the status code.
    pub fn status_code_type(&self) -> StatusCodeType {
        StatusCodeType((self.0 >> 8) as u8)
    }
}

impl core::fmt::Debug for Status {
    fn fmt(&self, fmt: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match *self {
            Self::SUCCESS => "SUCCESS",
            Self::INVALID_COMMAND_OPCODE => "INVALID_COMMAND_OPCODE",
            Self::INVALID_FIELD_IN_COMMAND => "INVALID_FIELD_IN_COMMAND",
            Self::COMMAND_ID_CONFLICT => "COMMAND_ID_CONFLICT",
            Self::DATA_TRANSFER_ERROR => "DATA_TRANSFER_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::COMMAND_ABORTED_DUE_TO_SQ_DELETION => "COMMAND_ABORTED_DUE_TO_SQ_DELETION",
            Self::INVALID_NAMESPACE_OR_FORMAT => "INVALID_NAMESPACE_OR_FORMAT",
            Self::COMMAND_SEQUENCE_ERROR => "COMMAND_SEQUENCE_ERROR",
            Self::PRP_OFFSET_INVALID => "PRP_OFFSET_INVALID",
            Self::COMPLETION_QUEUE_INVALID => "COMPLETION_QUEUE_INVALID",
            Self::INVALID_QUEUE_IDENTIFIER => "INVALID_QUEUE_IDENTIFIER",
            Self::INVALID_QUEUE_SIZE => "INVALID_QUEUE_SIZE",
            Self::INVALID_QUEUE_DELETION => "INVALID_QUEUE_DELETION",
            _ => return core::fmt::Debug::fmt(&self.0, fmt),
        };
        fmt.pad(s)
    }
}

/// CDW10 for the Identify command.
#[bitfield(u32)]
pub struct Cdw10Identify {
    pub cns: u8,
    pub reserved: u8,
    pub cntid: u16,
}

/// CNS values for the Identify command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct Cns(pub u8);

impl Cns {
    pub const NAMESPACE: Cns = Cns(0x0);
    pub const CONTROLLER: Cns = Cns(0x1);
    pub const ACTIVE_NAMESPACES: Cns = Cns(0x2);
}

/// CDW10 for the Create IO Submission/Completion Queue commands.
#[bitfield(u32)]
pub struct Cdw10CreateIoQueue {
    pub qid: u16,
    pub qsize_z: u16,
}

/// CDW11 for the Create IO Completion Queue command.
#[bitfield(u32)]
pub struct Cdw11CreateIoCompletionQueue {
    pub pc: bool,
    pub ien: bool,
    #[bits(14)]
    pub reserved: u16,
    pub iv: u16,
}

/// CDW11 for the Create IO Submission Queue command.
#[bitfield(u32)]
pub struct Cdw11CreateIoSubmissionQueue {
    pub pc: bool,
    #[bits(2)]
    pub qprio: u8,
    #[bits(13)]
    pub reserved: u16,
    pub cqid: u16,
}

/// CDW10 for the Delete IO Submission/Completion Queue commands.
#[bitfield(u32)]
pub struct Cdw10DeleteIoQueue {
    pub qid: u16,
    pub reserved: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_sizes() {
        assert_eq!(core::mem::size_of::<Command>(), 64);
        assert_eq!(core::mem::size_of::<Completion>(), 16);
    }

    #[test]
    fn completion_status_packing() {
        // DW3 of a completion packs CID low, then P (bit 16), SC (17..25),
        // SCT (25..28), CRD, M, DNR (bit 31); the status word here is the
        // high half of that DWORD.
        let status = CompletionStatus::new()
            .with_phase(true)
            .with_status(Status::COMMAND_ID_CONFLICT.0)
            .with_dnr(true);
        let raw = u16::from(status);
        assert_eq!(raw & 1, 1);
        assert_eq!((raw >> 1) & 0xff, 0x03);
        assert_eq!((raw >> 9) & 0x7, 0);
        assert_eq!(raw >> 15, 1);
    }

    #[test]
    fn status_code_split() {
        let status = Status::INVALID_QUEUE_SIZE;
        assert_eq!(status.status_code(), 0x02);
        assert_eq!(status.status_code_type(), StatusCodeType::COMMAND_SPECIFIC);
    }

    #[test]
    fn cc_mps_field() {
        let cc = Cc::from(0x0046_0301u32);
        assert!(cc.en());
        assert_eq!(cc.mps(), 6);
        assert_eq!(cc.iosqes(), 6);
        assert_eq!(cc.iocqes(), 4);
    }
}
