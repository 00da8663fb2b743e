use core::hint::spin_loop;
use core::ptr;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, error, info};

use crate::cmd::{CID_AER, Command, Completion, QueueFlags};
use crate::error::{Error, Result};
use crate::events::AsyncEvent;
use crate::memory::{self, DmaRegion, PAGESHIFT, PAGESIZE};
use crate::pci::{PciDevice, Prot};
use crate::queues::{AenHandler, CompQueue, Request, RequestTag, SubQueue};
use crate::regs::{
    self, CAP_CSS_ADMIN, CAP_CSS_CSI, CC_AMS_RR, CC_AMS_SHIFT, CC_CSS_ADMIN, CC_CSS_CSI,
    CC_CSS_NVM, CC_CSS_SHIFT, CC_EN, CC_IOCQES_SHIFT, CC_IOSQES_SHIFT, CC_MPS_SHIFT, CC_SHN_NONE,
    CC_SHN_SHIFT, CSTS_RDY, NVME_AQ, NVME_AQ_QSIZE, NVME_CQES, NVME_SQES, Register,
};

bitflags! {
    /// Controller feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlFlags: u32 {
        /// Administrative controller (PCI subclass 0x03): no I/O queues.
        const ADMINISTRATIVE = 1 << 0;
    }
}

/// Caller options, snapshotted at init.
#[derive(Debug, Clone, Copy)]
pub struct CtrlOpts {
    /// Number of I/O submission queues to request (zero-based).
    pub nsqr: u16,
    /// Number of I/O completion queues to request (zero-based).
    pub ncqr: u16,
}

impl Default for CtrlOpts {
    fn default() -> Self {
        Self { nsqr: 63, ncqr: 63 }
    }
}

/// Configuration negotiated with the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct CtrlConfig {
    /// Number of I/O submission queues the device granted.
    pub nsqa: u16,
    /// Number of I/O completion queues the device granted.
    pub ncqa: u16,
}

/// The doorbell window: an array of `(sq_tail, cq_head)` 32-bit pairs
/// indexed by queue id, at BAR0 offset 0x1000.
#[derive(Debug, Clone, Copy)]
struct DoorbellPairs {
    base: *mut u8,
}

impl Default for DoorbellPairs {
    fn default() -> Self {
        Self {
            base: ptr::null_mut(),
        }
    }
}

impl DoorbellPairs {
    fn new(base: *mut u8) -> Self {
        Self { base }
    }

    fn is_mapped(&self) -> bool {
        !self.base.is_null()
    }

    fn sq_tail(&self, qid: u16) -> *mut u32 {
        unsafe { (self.base as *mut u32).add(qid as usize * 2) }
    }

    fn cq_head(&self, qid: u16) -> *mut u32 {
        unsafe { (self.base as *mut u32).add(qid as usize * 2 + 1) }
    }
}

/// An NVMe controller bound to a PCI/IOMMU passthrough handle.
///
/// Owns the register and doorbell windows, the submission/completion queue
/// arrays and their DMA regions, and the negotiated configuration. Queues
/// are single-owner: callers wanting concurrency use disjoint queue pairs.
#[derive(Debug)]
pub struct Controller<P: PciDevice> {
    pci: P,
    regs: *mut u8,
    doorbells: DoorbellPairs,
    sqs: Vec<SubQueue>,
    cqs: Vec<CompQueue>,
    opts: CtrlOpts,
    config: CtrlConfig,
    flags: CtrlFlags,
    closed: bool,
}

unsafe impl<P: PciDevice + Send> Send for Controller<P> {}

impl<P: PciDevice> Controller<P> {
    /// Bring up a controller: verify the PCI class, take the device over,
    /// map BAR0, reset, configure and enable the admin queue pair, and
    /// negotiate I/O queue counts (skipped for administrative controllers).
    ///
    /// On any failure after takeover the already-acquired resources are
    /// released before the error returns.
    pub fn init(pci: P, opts: CtrlOpts) -> Result<Self> {
        let classcode = pci.class_code()?;

        info!("pci class code is {classcode:#08x}");

        if classcode & 0xFFFF00 != 0x010800 {
            debug!("not an NVMe device");
            return Err(Error::InvalidArgument);
        }

        let mut flags = CtrlFlags::empty();
        if classcode & 0xFF == 0x03 {
            flags |= CtrlFlags::ADMINISTRATIVE;
        }

        let mut pci = pci;
        pci.open()?;

        let mut ctrl = Self {
            pci,
            regs: ptr::null_mut(),
            doorbells: DoorbellPairs::default(),
            sqs: Vec::new(),
            cqs: Vec::new(),
            opts,
            config: CtrlConfig::default(),
            flags,
            closed: false,
        };

        match ctrl.bring_up() {
            Ok(()) => Ok(ctrl),
            Err(err) => {
                ctrl.close();
                Err(err)
            }
        }
    }

    fn bring_up(&mut self) -> Result<()> {
        self.regs = self.pci.map_bar(0, 0x1000, 0, Prot::READ | Prot::WRITE)?;

        let cap = regs::mmio_read64(self.regs, Register::CAP);
        let mpsmin = regs::cap_mpsmin(cap);

        if (1usize << (12 + mpsmin)) > PAGESIZE {
            debug!("controller minimum page size too large");
            return Err(Error::InvalidArgument);
        }

        self.reset()?;

        self.doorbells = DoorbellPairs::new(self.pci.map_bar(0, 0x1000, 0x1000, Prot::WRITE)?);

        // +2: nsqr/ncqr are zero-based and do not account for the admin queue
        self.sqs
            .resize_with(self.opts.nsqr as usize + 2, SubQueue::default);
        self.cqs
            .resize_with(self.opts.ncqr as usize + 2, CompQueue::default);

        self.configure_adminq()?;
        self.enable()?;

        if self.flags.contains(CtrlFlags::ADMINISTRATIVE) {
            return Ok(());
        }

        let mut cmd = Command::set_features_num_queues(self.opts.nsqr, self.opts.ncqr);
        let mut cqe = Completion::default();
        self.oneshot(NVME_AQ, &mut cmd, None, Some(&mut cqe))?;

        self.config.nsqa = self.opts.nsqr.min((cqe.dw0 & 0xFFFF) as u16);
        self.config.ncqa = self.opts.ncqr.min((cqe.dw0 >> 16) as u16);

        Ok(())
    }

    /// Discard every queue, release the queue arrays, unmap both BAR
    /// windows, and release the device. Safe to call more than once and on
    /// a controller that never finished `init`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for qid in 0..self.sqs.len() as u16 {
            self.discard_sq(qid);
        }
        self.sqs.clear();

        for qid in 0..self.cqs.len() as u16 {
            self.discard_cq(qid);
        }
        self.cqs.clear();

        if !self.regs.is_null() {
            let regs = self.regs;
            self.regs = ptr::null_mut();
            self.pci.unmap_bar(0, regs, 0x1000, 0);
        }

        if self.doorbells.is_mapped() {
            let doorbells = self.doorbells.base;
            self.doorbells = DoorbellPairs::default();
            self.pci.unmap_bar(0, doorbells, 0x1000, 0x1000);
        }

        self.pci.close();
    }

    /// Spin until `CSTS.RDY` matches `rdy`, bounded by the `CAP.TO`
    /// deadline (500 ms units).
    fn wait_rdy(&self, rdy: bool) -> Result<()> {
        let cap = regs::mmio_read64(self.regs, Register::CAP);
        let timeout_ms = 500 * (regs::cap_to(cap) + 1);
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if Instant::now() > deadline {
                debug!("timed out");
                return Err(Error::Timeout);
            }

            let csts = regs::mmio_read32(self.regs, Register::CSTS);
            if (csts & CSTS_RDY != 0) == rdy {
                return Ok(());
            }

            spin_loop();
        }
    }

    /// Clear `CC.EN`, preserving the other configuration fields, and wait
    /// for the controller to report not ready.
    pub fn reset(&mut self) -> Result<()> {
        let cc = regs::mmio_read32(self.regs, Register::CC);
        regs::mmio_write32(self.regs, Register::CC, cc & !CC_EN);

        self.wait_rdy(false)
    }

    /// Compose and write `CC`, then wait for the controller to report
    /// ready. The command set is selected from `CAP.CSS`, preferring the
    /// command set indicator, then admin-only, then NVM.
    pub fn enable(&mut self) -> Result<()> {
        let cap = regs::mmio_read64(self.regs, Register::CAP);
        let css = regs::cap_css(cap);

        let mut cc = (((PAGESHIFT - 12) as u32) << CC_MPS_SHIFT)
            | (CC_AMS_RR << CC_AMS_SHIFT)
            | (CC_SHN_NONE << CC_SHN_SHIFT)
            | (NVME_SQES << CC_IOSQES_SHIFT)
            | (NVME_CQES << CC_IOCQES_SHIFT)
            | CC_EN;

        let cc_css = if css & CAP_CSS_CSI != 0 {
            CC_CSS_CSI
        } else if css & CAP_CSS_ADMIN != 0 {
            CC_CSS_ADMIN
        } else {
            CC_CSS_NVM
        };
        cc |= cc_css << CC_CSS_SHIFT;

        regs::mmio_write32(self.regs, Register::CC, cc);

        self.wait_rdy(true)
    }

    /// Initialize a completion queue record: allocate and map the ring and
    /// bind the head doorbell.
    pub fn configure_cq(&mut self, qid: u16, qsize: u32) -> Result<()> {
        if qid != NVME_AQ && qid > self.config.ncqa {
            debug!("qid {qid} invalid; max qid is {}", self.config.ncqa);
            return Err(Error::InvalidArgument);
        }

        if qsize < 2 {
            debug!("qsize must be at least 2");
            return Err(Error::InvalidArgument);
        }

        let bytes = (qsize as usize) << NVME_CQES;
        let ring = memory::map_pages(&mut self.pci, bytes.div_ceil(PAGESIZE))?;

        self.cqs[qid as usize] = CompQueue {
            id: qid,
            qsize,
            ring,
            doorbell: self.doorbells.cq_head(qid),
            head: 0,
            phase: true,
            efd: None,
        };

        Ok(())
    }

    /// Tear down a completion queue and zero its record. A no-op on a
    /// never-configured or already-discarded record.
    pub fn discard_cq(&mut self, qid: u16) {
        let Some(cq) = self.cqs.get_mut(qid as usize) else {
            return;
        };
        if !cq.is_configured() {
            return;
        }

        let ring = cq.ring;
        *cq = CompQueue::default();

        memory::unmap_pages(&mut self.pci, ring);
    }

    /// Initialize a submission queue record: allocate and map the ring and
    /// the per-slot PRP pages, build the request slot array with its free
    /// list, and bind the tail doorbell.
    ///
    /// The ring holds `qsize - 1` request slots: one entry stays reserved
    /// so head == tail only when the ring is empty. The free list starts at
    /// slot `qsize - 2` and links downward, slot 0 terminating.
    pub fn configure_sq(&mut self, qid: u16, qsize: u32, cq_id: u16, _flags: QueueFlags) -> Result<()> {
        if qid != NVME_AQ && qid > self.config.nsqa {
            debug!("qid {qid} invalid; max qid is {}", self.config.nsqa);
            return Err(Error::InvalidArgument);
        }

        if qsize < 2 {
            debug!("qsize must be at least 2");
            return Err(Error::InvalidArgument);
        }

        if !self
            .cqs
            .get(cq_id as usize)
            .is_some_and(CompQueue::is_configured)
        {
            debug!("completion queue {cq_id} is not configured");
            return Err(Error::InvalidArgument);
        }

        let pages = memory::map_pages(&mut self.pci, qsize as usize)?;

        let ring_bytes = (qsize as usize) << NVME_SQES;
        let ring = match memory::map_pages(&mut self.pci, ring_bytes.div_ceil(PAGESIZE)) {
            Ok(ring) => ring,
            Err(err) => {
                memory::unmap_pages(&mut self.pci, pages);
                return Err(err);
            }
        };

        let mut rqs = Vec::with_capacity(qsize as usize - 1);
        for i in 0..(qsize as u16 - 1) {
            rqs.push(Request {
                cid: i,
                page: DmaRegion {
                    vaddr: unsafe { pages.vaddr.add((i as usize) << PAGESHIFT) },
                    len: PAGESIZE,
                    iova: pages.iova + ((i as u64) << PAGESHIFT),
                },
                next: (i > 0).then(|| i - 1),
                tag: RequestTag::None,
            });
        }

        self.sqs[qid as usize] = SubQueue {
            id: qid,
            qsize,
            ring,
            pages,
            doorbell: self.doorbells.sq_tail(qid),
            tail: 0,
            head: 0,
            cq_id,
            rqs,
            rq_top: Some(qsize as u16 - 2),
        };

        Ok(())
    }

    /// Tear down a submission queue, its slot array, and its PRP pages, and
    /// zero its record. A no-op on a never-configured or already-discarded
    /// record.
    pub fn discard_sq(&mut self, qid: u16) {
        let Some(sq) = self.sqs.get_mut(qid as usize) else {
            return;
        };
        if !sq.is_configured() {
            return;
        }

        let ring = sq.ring;
        let pages = sq.pages;
        *sq = SubQueue::default();

        memory::unmap_pages(&mut self.pci, ring);
        memory::unmap_pages(&mut self.pci, pages);
    }

    fn configure_adminq(&mut self) -> Result<()> {
        if let Err(err) = self.configure_cq(NVME_AQ, NVME_AQ_QSIZE) {
            debug!("failed to configure admin completion queue");
            return Err(err);
        }

        if let Err(err) = self.configure_sq(NVME_AQ, NVME_AQ_QSIZE, NVME_AQ, QueueFlags::empty()) {
            debug!("failed to configure admin submission queue");
            self.discard_cq(NVME_AQ);
            return Err(err);
        }

        let aqa = (NVME_AQ_QSIZE - 1) | ((NVME_AQ_QSIZE - 1) << 16);
        regs::mmio_write32(self.regs, Register::AQA, aqa);
        regs::mmio_hl_write64(self.regs, Register::ASQ, self.sqs[NVME_AQ as usize].ring.iova);
        regs::mmio_hl_write64(self.regs, Register::ACQ, self.cqs[NVME_AQ as usize].ring.iova);

        Ok(())
    }

    /// Configure an I/O completion queue and return the prepared CreateIOCQ
    /// admin command referencing its ring.
    pub fn create_iocq(&mut self, qid: u16, qsize: u32) -> Result<Command> {
        if let Err(err) = self.configure_cq(qid, qsize) {
            debug!("could not configure io completion queue");
            return Err(err);
        }

        Ok(Command::create_iocq(
            qid,
            qsize,
            self.cqs[qid as usize].ring.iova,
        ))
    }

    /// Create an I/O completion queue synchronously on the admin queue.
    pub fn create_iocq_oneshot(&mut self, qid: u16, qsize: u32) -> Result<()> {
        let mut sqe = self.create_iocq(qid, qsize)?;
        let mut cqe = Completion::default();

        self.oneshot(NVME_AQ, &mut sqe, None, Some(&mut cqe))?;

        let status = cqe.status_code();
        if !status.is_success() {
            debug!("create io completion queue failed: {}", status.description());
            return Err(Error::Device(status));
        }

        Ok(())
    }

    /// Configure an I/O submission queue paired to `cq_id` and return the
    /// prepared CreateIOSQ admin command referencing its ring.
    pub fn create_iosq(
        &mut self,
        qid: u16,
        qsize: u32,
        cq_id: u16,
        flags: QueueFlags,
    ) -> Result<Command> {
        if let Err(err) = self.configure_sq(qid, qsize, cq_id, flags) {
            debug!("could not configure io submission queue");
            return Err(err);
        }

        Ok(Command::create_iosq(
            qid,
            qsize,
            cq_id,
            self.sqs[qid as usize].ring.iova,
            flags,
        ))
    }

    /// Create an I/O submission queue synchronously on the admin queue.
    pub fn create_iosq_oneshot(
        &mut self,
        qid: u16,
        qsize: u32,
        cq_id: u16,
        flags: QueueFlags,
    ) -> Result<()> {
        let mut sqe = self.create_iosq(qid, qsize, cq_id, flags)?;
        let mut cqe = Completion::default();

        self.oneshot(NVME_AQ, &mut sqe, None, Some(&mut cqe))?;

        let status = cqe.status_code();
        if !status.is_success() {
            debug!("create io submission queue failed: {}", status.description());
            return Err(Error::Device(status));
        }

        Ok(())
    }

    /// Create a full I/O queue pair, completion queue first, failing fast
    /// on either half.
    pub fn create_ioqpair(&mut self, qid: u16, qsize: u32, flags: QueueFlags) -> Result<()> {
        if let Err(err) = self.create_iocq_oneshot(qid, qsize) {
            debug!("could not create io completion queue");
            return Err(err);
        }

        if let Err(err) = self.create_iosq_oneshot(qid, qsize, qid, flags) {
            debug!("could not create io submission queue");
            return Err(err);
        }

        Ok(())
    }

    /// Execute one command synchronously on queue `qid`.
    ///
    /// Acquires a request slot (failing with `Unavailable` when none is
    /// free), optionally maps `buf` ephemerally and installs PRPs, submits,
    /// and polls the paired completion queue until the matching completion
    /// arrives. On the admin queue, interleaved AER completions are routed
    /// to [`aen_handle`](Self::aen_handle); any other mismatched completion
    /// is logged as spurious and polling continues.
    ///
    /// The completion is copied to `cqe_out` untranslated; a nonzero status
    /// is not an error here. The slot and any ephemeral mapping are
    /// released on every exit path past acquisition.
    pub fn oneshot(
        &mut self,
        qid: u16,
        sqe: &mut Command,
        buf: Option<&mut [u8]>,
        cqe_out: Option<&mut Completion>,
    ) -> Result<()> {
        let sq_idx = qid as usize;
        if !self.sqs.get(sq_idx).is_some_and(SubQueue::is_configured) {
            return Err(Error::InvalidArgument);
        }

        let cid = self.sqs[sq_idx].acquire().ok_or(Error::Unavailable)?;
        self.sqs[sq_idx].rqs[cid as usize].prep_cmd(sqe);

        let mut mapped = false;
        if let Some(buf) = buf {
            let len = buf.len();
            let iova = match self.pci.ephemeral_map(buf.as_mut_ptr(), len) {
                Ok(iova) => iova,
                Err(err) => {
                    self.sqs[sq_idx].release(cid);
                    return Err(err);
                }
            };

            self.sqs[sq_idx].rqs[cid as usize].map_prp(sqe, iova, len);
            mapped = true;
        }

        self.sqs[sq_idx].exec(sqe);

        let cq_idx = self.sqs[sq_idx].cq_id as usize;
        let cqe = loop {
            let cqe = self.cqs[cq_idx].poll();
            self.sqs[sq_idx].head = cqe.sq_head as u32;

            if cqe.cid == cid {
                break cqe;
            }

            if qid == NVME_AQ && cqe.cid & CID_AER != 0 {
                self.aen_handle(&cqe);
                continue;
            }

            let spurious_cid = cqe.cid;
            error!("SPURIOUS CQE (cq {} cid {})", cq_idx, spurious_cid);
        };

        if let Some(out) = cqe_out {
            *out = cqe;
        }

        let ret = if mapped {
            self.pci.ephemeral_free(1)
        } else {
            Ok(())
        };

        self.sqs[sq_idx].release(cid);

        ret
    }

    /// Arm an Asynchronous Event Request on the admin queue.
    ///
    /// The acquired slot stays in flight until the device posts an event;
    /// it is re-armed by [`aen_handle`](Self::aen_handle) and never
    /// released. Fails with `Unavailable` when no slot is free.
    pub fn aen_enable(&mut self, handler: AenHandler) -> Result<()> {
        let Some(sq) = self.sqs.get_mut(NVME_AQ as usize) else {
            return Err(Error::InvalidArgument);
        };
        if !sq.is_configured() {
            return Err(Error::InvalidArgument);
        }

        let cid = sq.acquire().ok_or(Error::Unavailable)?;

        let mut cmd = Command::async_event_request();
        sq.rqs[cid as usize].prep_cmd(&mut cmd);
        cmd.set_cid(cid | CID_AER);

        sq.rqs[cid as usize].tag = RequestTag::AenHandler(handler);
        sq.exec(&cmd);

        Ok(())
    }

    /// Demultiplex an AER completion: invoke the owning slot's handler (or
    /// log the event) and re-arm the same slot.
    ///
    /// The completion's cid must carry the AER bit.
    pub fn aen_handle(&mut self, cqe: &Completion) {
        debug_assert!(cqe.cid & CID_AER != 0);

        let mut cqe = *cqe;
        cqe.cid &= !CID_AER;

        let sq = &mut self.sqs[NVME_AQ as usize];
        match sq.rqs[cqe.cid as usize].tag {
            RequestTag::AenHandler(handler) => handler(&cqe),
            RequestTag::None => {
                let dw0 = cqe.dw0;
                let event = AsyncEvent::from_completion(dw0);
                info!(
                    "unhandled aen {:#x} (type {:?} info {:?} lid {:?})",
                    dw0, event.event_type, event.event_info, event.log_page
                );
            }
        }

        let mut cmd = Command::async_event_request();
        sq.rqs[cqe.cid as usize].prep_cmd(&mut cmd);
        cmd.set_cid(cqe.cid | CID_AER);

        sq.exec(&cmd);
    }

    /// Controller version from `VS` as `(major, minor, tertiary)`.
    pub fn version(&self) -> (u16, u8, u8) {
        let vs = regs::mmio_read32(self.regs, Register::VS);
        ((vs >> 16) as u16, (vs >> 8) as u8, vs as u8)
    }

    /// Options snapshot taken at init.
    pub fn opts(&self) -> CtrlOpts {
        self.opts
    }

    /// Configuration negotiated with the device.
    pub fn config(&self) -> CtrlConfig {
        self.config
    }

    /// Controller feature flags.
    pub fn flags(&self) -> CtrlFlags {
        self.flags
    }

    /// Submission queue record for `qid`, if within the array.
    pub fn sq(&self, qid: u16) -> Option<&SubQueue> {
        self.sqs.get(qid as usize)
    }

    /// Completion queue record for `qid`, if within the array.
    pub fn cq(&self, qid: u16) -> Option<&CompQueue> {
        self.cqs.get(qid as usize)
    }
}

impl<P: PciDevice> Drop for Controller<P> {
    fn drop(&mut self) {
        self.close();
    }
}
