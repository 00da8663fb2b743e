use bitflags::bitflags;

use crate::error::StatusCode;

/// Command id bit marking an Asynchronous Event Request.
///
/// AER completions are identified on the admin completion queue by this
/// bit alone, so oneshot polling needs no per-cid table.
pub const CID_AER: u16 = 1 << 15;

const OPCODE_CREATE_IOSQ: u8 = 0x01;
const OPCODE_CREATE_IOCQ: u8 = 0x05;
const OPCODE_SET_FEATURES: u8 = 0x09;
const OPCODE_ASYNC_EVENT_REQUEST: u8 = 0x0C;

/// Feature id: number of I/O queues.
const FID_NUM_QUEUES: u32 = 0x07;

bitflags! {
    /// Queue creation flags (CreateIOCQ/CreateIOSQ cdw11 low bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QueueFlags: u16 {
        /// Physically contiguous ring.
        const PC = 1 << 0;
    }
}

/// A 64-byte submission queue entry.
///
/// All multi-byte fields are stored little-endian; builders convert on the
/// way in and the raw struct is copied to the ring verbatim.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct Command {
    pub(crate) opcode: u8,
    pub(crate) flags: u8,
    pub(crate) cid: u16,
    pub(crate) nsid: u32,
    pub(crate) cdw2: u32,
    pub(crate) cdw3: u32,
    pub(crate) metadata_ptr: u64,
    pub(crate) data_ptr: [u64; 2],
    pub(crate) cdw10: u32,
    pub(crate) cdw11: u32,
    pub(crate) cdw12: u32,
    pub(crate) cdw13: u32,
    pub(crate) cdw14: u32,
    pub(crate) cdw15: u32,
}

impl Command {
    /// Create I/O Completion Queue, ring at `iova`.
    pub fn create_iocq(qid: u16, qsize: u32, iova: u64) -> Self {
        Self {
            opcode: OPCODE_CREATE_IOCQ,
            data_ptr: [iova.to_le(), 0],
            cdw10: (((qsize - 1) << 16) | qid as u32).to_le(),
            cdw11: (QueueFlags::PC.bits() as u32).to_le(),
            ..Default::default()
        }
    }

    /// Create I/O Submission Queue, ring at `iova`, completions to `cqid`.
    pub fn create_iosq(qid: u16, qsize: u32, cqid: u16, iova: u64, flags: QueueFlags) -> Self {
        let qflags = flags | QueueFlags::PC;

        Self {
            opcode: OPCODE_CREATE_IOSQ,
            data_ptr: [iova.to_le(), 0],
            cdw10: (((qsize - 1) << 16) | qid as u32).to_le(),
            cdw11: (((cqid as u32) << 16) | qflags.bits() as u32).to_le(),
            ..Default::default()
        }
    }

    /// Set Features: request `nsqr` I/O submission and `ncqr` I/O
    /// completion queues (zero-based counts).
    pub fn set_features_num_queues(nsqr: u16, ncqr: u16) -> Self {
        Self {
            opcode: OPCODE_SET_FEATURES,
            cdw10: FID_NUM_QUEUES.to_le(),
            cdw11: (((ncqr as u32) << 16) | nsqr as u32).to_le(),
            ..Default::default()
        }
    }

    /// Asynchronous Event Request.
    pub fn async_event_request() -> Self {
        Self {
            opcode: OPCODE_ASYNC_EVENT_REQUEST,
            ..Default::default()
        }
    }

    /// Command identifier, host order.
    pub fn cid(&self) -> u16 {
        u16::from_le(self.cid)
    }

    pub(crate) fn set_cid(&mut self, cid: u16) {
        self.cid = cid.to_le();
    }
}

/// A 16-byte completion queue entry, converted to host order when taken
/// off the ring.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C, packed)]
pub struct Completion {
    /// Command specific result
    pub dw0: u32,
    /// Command specific result (second dword)
    pub dw1: u32,
    /// Submission queue head at completion time
    pub sq_head: u16,
    /// Submission queue the command was taken from
    pub sq_id: u16,
    /// Command identifier
    pub cid: u16,
    /// Phase bit and status field
    pub status: u16,
}

impl Completion {
    /// Decode the status field.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_raw(self.status)
    }
}
