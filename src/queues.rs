use core::hint::spin_loop;
use core::ptr;
use core::sync::atomic::{Ordering, fence};

use crate::cmd::{Command, Completion};
use crate::memory::{DmaRegion, PAGESHIFT, PAGESIZE};

/// Callback invoked for asynchronous event notifications.
pub type AenHandler = fn(&Completion);

/// Per-request state attached to a long-lived slot.
#[derive(Debug, Default, Clone, Copy)]
pub enum RequestTag {
    /// Plain oneshot request.
    #[default]
    None,
    /// The slot carries an armed Asynchronous Event Request.
    AenHandler(AenHandler),
}

/// An in-flight request slot.
///
/// Slots are built once at submission queue configure time and live in the
/// queue's slot array; the free list threads through them by index. Each
/// slot owns one scratch page of the queue's PRP pages region for building
/// PRP lists.
#[derive(Debug, Default)]
pub struct Request {
    /// Command identifier, equal to the slot index.
    pub(crate) cid: u16,
    /// PRP scratch page (a non-owning slice of the queue's pages region).
    pub(crate) page: DmaRegion,
    /// Next free slot, `None` for the free-list tail.
    pub(crate) next: Option<u16>,
    /// Oneshot/AEN layer state.
    pub(crate) tag: RequestTag,
}

impl Request {
    /// Stamp this slot's command identifier into an SQE.
    pub(crate) fn prep_cmd(&self, cmd: &mut Command) {
        cmd.set_cid(self.cid);
    }

    /// Install PRP entries describing `len` bytes at `iova`.
    ///
    /// One page goes in PRP1 alone; a second page goes directly in PRP2;
    /// anything longer gets a PRP list built in the slot's scratch page.
    pub(crate) fn map_prp(&self, cmd: &mut Command, iova: u64, len: usize) {
        cmd.data_ptr[0] = iova.to_le();

        let first = PAGESIZE - (iova as usize & (PAGESIZE - 1));
        if len <= first {
            cmd.data_ptr[1] = 0;
            return;
        }

        let rest = len - first;
        if rest <= PAGESIZE {
            cmd.data_ptr[1] = (iova + first as u64).to_le();
            return;
        }

        let list = self.page.vaddr as *mut u64;
        for i in 0..rest.div_ceil(PAGESIZE) {
            let entry = iova + first as u64 + ((i as u64) << PAGESHIFT);
            unsafe { list.add(i).write_volatile(entry.to_le()) }
        }

        cmd.data_ptr[1] = self.page.iova.to_le();
    }
}

/// An NVMe completion queue: a device-written ring of 16-byte entries.
#[derive(Debug)]
pub struct CompQueue {
    /// Queue id (admin queue is 0).
    pub(crate) id: u16,
    /// Ring depth in entries.
    pub(crate) qsize: u32,
    /// Ring memory.
    pub(crate) ring: DmaRegion,
    /// Head doorbell slot inside the controller's doorbell window.
    pub(crate) doorbell: *mut u32,
    /// Next entry to consume.
    pub(crate) head: u32,
    /// Expected phase of valid entries.
    pub(crate) phase: bool,
    /// Event file descriptor, reserved for interrupt-driven completion.
    pub(crate) efd: Option<i32>,
}

impl Default for CompQueue {
    fn default() -> Self {
        Self {
            id: 0,
            qsize: 0,
            ring: DmaRegion::default(),
            doorbell: ptr::null_mut(),
            head: 0,
            phase: false,
            efd: None,
        }
    }
}

impl CompQueue {
    /// Queue id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Ring depth in entries.
    pub fn qsize(&self) -> u32 {
        self.qsize
    }

    /// Whether the queue is configured.
    pub fn is_configured(&self) -> bool {
        self.ring.is_mapped()
    }

    /// Event file descriptor, if interrupts were set up by an outer layer.
    pub fn event_fd(&self) -> Option<i32> {
        self.efd
    }

    /// Spin until the next completion is posted, consume it, and announce
    /// the new head to the device.
    ///
    /// Bounded only by the device; callers needing a deadline wrap it.
    pub(crate) fn poll(&mut self) -> Completion {
        debug_assert!(self.is_configured());

        let base = self.ring.vaddr as *const Completion;
        loop {
            let raw = unsafe { base.add(self.head as usize).read_volatile() };
            if (u16::from_le(raw.status) & 0x1 == 0x1) == self.phase {
                self.head += 1;
                if self.head == self.qsize {
                    self.head = 0;
                    self.phase = !self.phase;
                }
                unsafe { self.doorbell.write_volatile(self.head.to_le()) }

                return Completion {
                    dw0: u32::from_le(raw.dw0),
                    dw1: u32::from_le(raw.dw1),
                    sq_head: u16::from_le(raw.sq_head),
                    sq_id: u16::from_le(raw.sq_id),
                    cid: u16::from_le(raw.cid),
                    status: u16::from_le(raw.status),
                };
            }
            spin_loop();
        }
    }
}

/// An NVMe submission queue: a host-written ring of 64-byte entries, paired
/// to exactly one completion queue and carrying the request slot array.
#[derive(Debug)]
pub struct SubQueue {
    /// Queue id (admin queue is 0).
    pub(crate) id: u16,
    /// Ring depth in entries.
    pub(crate) qsize: u32,
    /// Ring memory.
    pub(crate) ring: DmaRegion,
    /// Per-slot PRP scratch pages, `qsize` pages long.
    pub(crate) pages: DmaRegion,
    /// Tail doorbell slot inside the controller's doorbell window.
    pub(crate) doorbell: *mut u32,
    /// Next ring entry to fill.
    pub(crate) tail: u32,
    /// Device-consumed head, mirrored from completions.
    pub(crate) head: u32,
    /// Paired completion queue, by id (non-owning).
    pub(crate) cq_id: u16,
    /// Request slots, one fewer than the ring depth.
    pub(crate) rqs: Vec<Request>,
    /// Free-list head, `None` when every slot is in flight.
    pub(crate) rq_top: Option<u16>,
}

impl Default for SubQueue {
    fn default() -> Self {
        Self {
            id: 0,
            qsize: 0,
            ring: DmaRegion::default(),
            pages: DmaRegion::default(),
            doorbell: ptr::null_mut(),
            tail: 0,
            head: 0,
            cq_id: 0,
            rqs: Vec::new(),
            rq_top: None,
        }
    }
}

impl SubQueue {
    /// Queue id.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Ring depth in entries.
    pub fn qsize(&self) -> u32 {
        self.qsize
    }

    /// Whether the queue is configured.
    pub fn is_configured(&self) -> bool {
        self.ring.is_mapped()
    }

    /// Id of the paired completion queue.
    pub fn cq_id(&self) -> u16 {
        self.cq_id
    }

    /// Take a free request slot, returning its cid.
    pub(crate) fn acquire(&mut self) -> Option<u16> {
        let cid = self.rq_top?;
        self.rq_top = self.rqs[cid as usize].next.take();
        Some(cid)
    }

    /// Return a slot to the free list and clear its per-request state.
    pub(crate) fn release(&mut self, cid: u16) {
        let rq = &mut self.rqs[cid as usize];
        rq.tag = RequestTag::None;
        rq.next = self.rq_top.replace(cid);
    }

    /// Copy an SQE into the ring at the tail.
    pub(crate) fn post(&mut self, cmd: &Command) {
        debug_assert!(self.is_configured());

        let slot = unsafe { (self.ring.vaddr as *mut Command).add(self.tail as usize) };
        unsafe { ptr::write_volatile(slot, *cmd) }
        self.tail = (self.tail + 1) % self.qsize;
    }

    /// Announce the current tail to the device.
    ///
    /// The fence keeps the SQE store visible before the doorbell write.
    pub(crate) fn ring_doorbell(&self) {
        fence(Ordering::Release);
        unsafe { self.doorbell.write_volatile(self.tail.to_le()) }
    }

    /// Post an SQE and ring the tail doorbell.
    pub(crate) fn exec(&mut self, cmd: &Command) {
        self.post(cmd);
        self.ring_doorbell();
    }
}
