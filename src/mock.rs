//! Mock NVMe device backing the unit tests.
//!
//! Implements [`PciDevice`] over plain host memory. A background thread
//! models the device side: it follows `CC.EN` with `CSTS.RDY`, consumes
//! admin SQEs announced through the doorbell window, and posts phase-tagged
//! completions. AsyncEventRequest commands are parked until a test fires
//! them, which is enough to reproduce AEN/oneshot interleaving.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::cmd::{Command, Completion};
use crate::error::{Error, Result};
use crate::pci::{PciDevice, Prot};

const BAR_LEN: usize = 0x2000;
const REG_CC: usize = 0x14;
const REG_CSTS: usize = 0x1C;
const REG_AQA: usize = 0x24;
const REG_ASQ: usize = 0x28;
const REG_ACQ: usize = 0x30;
const DB_SQ0_TAIL: usize = 0x1000;

/// Compose a CAP value from the fields the driver reads.
pub(crate) fn cap(to: u8, css: u8, mpsmin: u8) -> u64 {
    ((to as u64) << 24) | ((css as u64) << 37) | ((mpsmin as u64) << 48)
}

/// A queue-creation command the mock device accepted.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CreatedQueue {
    pub qid: u16,
    pub qsize: u32,
    pub iova: u64,
    pub flags: u16,
    pub cqid: u16,
}

#[derive(Default)]
struct MapTable {
    next_iova: u64,
    stable: HashMap<usize, (u64, usize)>,
    ephemeral: Vec<(usize, u64, usize)>,
}

impl MapTable {
    fn insert(&mut self, vaddr: usize, len: usize, ephemeral: bool) -> u64 {
        if self.next_iova == 0 {
            self.next_iova = 0x1000_0000;
        }
        let iova = self.next_iova;
        self.next_iova += len.next_multiple_of(0x1000) as u64;

        if ephemeral {
            self.ephemeral.push((vaddr, iova, len));
        } else {
            self.stable.insert(vaddr, (iova, len));
        }
        iova
    }

    fn translate(&self, iova: u64) -> Option<*mut u8> {
        let stable = self
            .stable
            .iter()
            .map(|(&vaddr, &(base, len))| (vaddr, base, len));
        let ephemeral = self.ephemeral.iter().copied();

        for (vaddr, base, len) in stable.chain(ephemeral) {
            if iova >= base && iova < base + len as u64 {
                return Some((vaddr + (iova - base) as usize) as *mut u8);
            }
        }
        None
    }
}

struct Shared {
    // u64 cells keep the 64-bit registers naturally aligned
    bar: Vec<UnsafeCell<u64>>,
    classcode: u32,
    rdy_responds: AtomicBool,
    feat_dw0: AtomicU32,
    stop: AtomicBool,
    map_budget: AtomicIsize,
    maps: Mutex<MapTable>,
    parked_aers: Mutex<Vec<u16>>,
    fire_aen_dw0: Mutex<Option<u32>>,
    features_seen: AtomicUsize,
    created_cqs: Mutex<Vec<CreatedQueue>>,
    created_sqs: Mutex<Vec<CreatedQueue>>,
    captured_prps: Mutex<Vec<(u64, u64)>>,
}

unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn bar_ptr(&self) -> *mut u8 {
        self.bar.as_ptr() as *mut u8
    }

    fn read_reg32(&self, offset: usize) -> u32 {
        u32::from_le(unsafe { (self.bar_ptr().add(offset) as *const u32).read_volatile() })
    }

    fn write_reg32(&self, offset: usize, val: u32) {
        unsafe { (self.bar_ptr().add(offset) as *mut u32).write_volatile(val.to_le()) }
    }

    fn read_reg64(&self, offset: usize) -> u64 {
        u64::from_le(unsafe { (self.bar_ptr().add(offset) as *const u64).read_volatile() })
    }
}

/// Device-side queue cursors, owned by the model thread.
struct DeviceModel {
    shared: Arc<Shared>,
    asq_head: u32,
    acq_tail: u32,
    acq_phase: bool,
}

impl DeviceModel {
    fn run(mut self) {
        while !self.shared.stop.load(Ordering::Acquire) {
            self.step();
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    fn step(&mut self) {
        let cc = self.shared.read_reg32(REG_CC);
        let csts = self.shared.read_reg32(REG_CSTS);

        let rdy_responds = self.shared.rdy_responds.load(Ordering::Acquire);
        if cc & 0x1 != 0 {
            if csts & 0x1 == 0 && rdy_responds {
                self.asq_head = 0;
                self.acq_tail = 0;
                self.acq_phase = true;
                self.shared.write_reg32(REG_CSTS, csts | 0x1);
            }
        } else if csts & 0x1 != 0 && rdy_responds {
            self.shared.write_reg32(REG_CSTS, csts & !0x1);
        }

        if self.shared.read_reg32(REG_CSTS) & 0x1 != 0 {
            self.process_admin();
        }
    }

    fn sq_qsize(&self) -> u32 {
        (self.shared.read_reg32(REG_AQA) & 0xFFFF) + 1
    }

    fn cq_qsize(&self) -> u32 {
        ((self.shared.read_reg32(REG_AQA) >> 16) & 0xFFFF) + 1
    }

    fn process_admin(&mut self) {
        let tail = self.shared.read_reg32(DB_SQ0_TAIL);
        // pairs with the submitter's release fence before the doorbell write
        std::sync::atomic::fence(Ordering::Acquire);

        while self.asq_head != tail {
            let asq = self.shared.read_reg64(REG_ASQ);
            let sqe_iova = asq + (self.asq_head as u64) * 64;

            let sqe_ptr = {
                let maps = self.shared.maps.lock().unwrap();
                maps.translate(sqe_iova)
            };
            let Some(sqe_ptr) = sqe_ptr else { return };

            let sqe = unsafe { (sqe_ptr as *const Command).read_volatile() };
            self.asq_head = (self.asq_head + 1) % self.sq_qsize();

            self.handle_sqe(&sqe);
        }
    }

    fn handle_sqe(&mut self, sqe: &Command) {
        let cid = u16::from_le(sqe.cid);

        // AERs are held by the device until an event occurs
        if sqe.opcode == 0x0C {
            self.shared.parked_aers.lock().unwrap().push(cid);
            return;
        }

        // a pending event interleaves ahead of the next regular completion
        let fired = self.shared.fire_aen_dw0.lock().unwrap().take();
        if let Some(dw0) = fired {
            let parked = self.shared.parked_aers.lock().unwrap().pop();
            if let Some(aer_cid) = parked {
                self.post_cqe(aer_cid, dw0, 0);
            }
        }

        let cdw10 = u32::from_le(sqe.cdw10);
        let cdw11 = u32::from_le(sqe.cdw11);
        let prp1 = u64::from_le(sqe.data_ptr[0]);
        let prp2 = u64::from_le(sqe.data_ptr[1]);

        let mut dw0 = 0;
        match sqe.opcode {
            // Set Features: Number of Queues
            0x09 if cdw10 & 0xFF == 0x07 => {
                self.shared.features_seen.fetch_add(1, Ordering::AcqRel);
                dw0 = self.shared.feat_dw0.load(Ordering::Acquire);
            }
            // Create I/O Completion Queue
            0x05 => {
                self.shared.created_cqs.lock().unwrap().push(CreatedQueue {
                    qid: (cdw10 & 0xFFFF) as u16,
                    qsize: (cdw10 >> 16) + 1,
                    iova: prp1,
                    flags: (cdw11 & 0xFFFF) as u16,
                    cqid: 0,
                });
            }
            // Create I/O Submission Queue
            0x01 => {
                self.shared.created_sqs.lock().unwrap().push(CreatedQueue {
                    qid: (cdw10 & 0xFFFF) as u16,
                    qsize: (cdw10 >> 16) + 1,
                    iova: prp1,
                    flags: (cdw11 & 0xFFFF) as u16,
                    cqid: (cdw11 >> 16) as u16,
                });
            }
            _ => {
                self.shared.captured_prps.lock().unwrap().push((prp1, prp2));
            }
        }

        self.post_cqe(cid, dw0, 0);
    }

    fn post_cqe(&mut self, cid: u16, dw0: u32, sc: u16) {
        let acq = self.shared.read_reg64(REG_ACQ);
        let cqe_iova = acq + (self.acq_tail as u64) * 16;

        let cqe_ptr = {
            let maps = self.shared.maps.lock().unwrap();
            maps.translate(cqe_iova)
        };
        let Some(cqe_ptr) = cqe_ptr else { return };

        let cqe = Completion {
            dw0: dw0.to_le(),
            dw1: 0,
            sq_head: (self.asq_head as u16).to_le(),
            sq_id: 0,
            cid: cid.to_le(),
            status: ((sc << 1) | self.acq_phase as u16).to_le(),
        };
        unsafe { (cqe_ptr as *mut Completion).write_volatile(cqe) }

        self.acq_tail += 1;
        if self.acq_tail == self.cq_qsize() {
            self.acq_tail = 0;
            self.acq_phase = !self.acq_phase;
        }
    }
}

/// The mock PCI device function handed to `Controller::init`.
pub(crate) struct MockPci {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for MockPci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPci").finish_non_exhaustive()
    }
}

impl MockPci {
    pub fn new(classcode: u32, cap: u64) -> Self {
        let bar: Vec<UnsafeCell<u64>> = (0..BAR_LEN / 8).map(|_| UnsafeCell::new(0)).collect();

        let shared = Arc::new(Shared {
            bar,
            classcode,
            rdy_responds: AtomicBool::new(true),
            feat_dw0: AtomicU32::new((63 << 16) | 63),
            stop: AtomicBool::new(false),
            map_budget: AtomicIsize::new(isize::MAX),
            maps: Mutex::new(MapTable::default()),
            parked_aers: Mutex::new(Vec::new()),
            fire_aen_dw0: Mutex::new(None),
            features_seen: AtomicUsize::new(0),
            created_cqs: Mutex::new(Vec::new()),
            created_sqs: Mutex::new(Vec::new()),
            captured_prps: Mutex::new(Vec::new()),
        });

        unsafe {
            (shared.bar_ptr() as *mut u64).write_volatile(cap.to_le());
            (shared.bar_ptr().add(8) as *mut u32).write_volatile(0x0001_0400u32.to_le());
        }

        Self {
            shared,
            thread: None,
        }
    }

    /// Device never reports ready, whatever `CC.EN` says.
    pub fn unresponsive(self) -> Self {
        self.shared.rdy_responds.store(false, Ordering::Release);
        self
    }

    /// Answer SetFeatures(NumberOfQueues) with this dw0.
    pub fn grant_queues(self, dw0: u32) -> Self {
        self.shared.feat_dw0.store(dw0, Ordering::Release);
        self
    }

    /// Observer handle kept by tests after the device moves into the
    /// controller.
    pub fn probe(&self) -> MockProbe {
        MockProbe {
            shared: self.shared.clone(),
        }
    }
}

impl PciDevice for MockPci {
    fn class_code(&self) -> Result<u32> {
        Ok(self.shared.classcode)
    }

    fn open(&mut self) -> Result<()> {
        let model = DeviceModel {
            shared: self.shared.clone(),
            asq_head: 0,
            acq_tail: 0,
            acq_phase: true,
        };
        self.thread = Some(std::thread::spawn(move || model.run()));
        Ok(())
    }

    fn map_bar(&mut self, _bar: u32, len: usize, offset: usize, _prot: Prot) -> Result<*mut u8> {
        assert!(offset + len <= BAR_LEN);
        Ok(unsafe { self.shared.bar_ptr().add(offset) })
    }

    fn unmap_bar(&mut self, _bar: u32, _vaddr: *mut u8, _len: usize, _offset: usize) {}

    fn map_iova(&mut self, vaddr: *mut u8, len: usize) -> Result<u64> {
        if self.shared.map_budget.fetch_sub(1, Ordering::AcqRel) <= 0 {
            return Err(Error::MappingFailure);
        }

        let mut maps = self.shared.maps.lock().unwrap();
        Ok(maps.insert(vaddr as usize, len, false))
    }

    fn unmap_iova(&mut self, vaddr: *mut u8) -> Result<()> {
        let mut maps = self.shared.maps.lock().unwrap();
        match maps.stable.remove(&(vaddr as usize)) {
            Some(_) => Ok(()),
            None => Err(Error::MappingFailure),
        }
    }

    fn ephemeral_map(&mut self, vaddr: *mut u8, len: usize) -> Result<u64> {
        let mut maps = self.shared.maps.lock().unwrap();
        Ok(maps.insert(vaddr as usize, len, true))
    }

    fn ephemeral_free(&mut self, n: usize) -> Result<()> {
        let mut maps = self.shared.maps.lock().unwrap();
        if maps.ephemeral.len() < n {
            return Err(Error::MappingFailure);
        }
        for _ in 0..n {
            maps.ephemeral.pop();
        }
        Ok(())
    }

    fn close(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MockPci {
    fn drop(&mut self) {
        self.close();
    }
}

/// Test-side view of the mock device state.
pub(crate) struct MockProbe {
    shared: Arc<Shared>,
}

impl MockProbe {
    pub fn reg32(&self, offset: usize) -> u32 {
        self.shared.read_reg32(offset)
    }

    pub fn doorbell_base(&self) -> *mut u8 {
        unsafe { self.shared.bar_ptr().add(DB_SQ0_TAIL) }
    }

    pub fn stable_mappings(&self) -> usize {
        self.shared.maps.lock().unwrap().stable.len()
    }

    pub fn ephemeral_mappings(&self) -> usize {
        self.shared.maps.lock().unwrap().ephemeral.len()
    }

    pub fn features_seen(&self) -> usize {
        self.shared.features_seen.load(Ordering::Acquire)
    }

    pub fn parked_aers(&self) -> usize {
        self.shared.parked_aers.lock().unwrap().len()
    }

    /// Complete one parked AER with `dw0` right before the next regular
    /// command's completion.
    pub fn fire_aen(&self, dw0: u32) {
        *self.shared.fire_aen_dw0.lock().unwrap() = Some(dw0);
    }

    /// Allow only `n` more stable IOMMU mappings to succeed.
    pub fn set_map_budget(&self, n: isize) {
        self.shared.map_budget.store(n, Ordering::Release);
    }

    pub fn created_cqs(&self) -> Vec<CreatedQueue> {
        self.shared.created_cqs.lock().unwrap().clone()
    }

    pub fn created_sqs(&self) -> Vec<CreatedQueue> {
        self.shared.created_sqs.lock().unwrap().clone()
    }

    pub fn captured_prps(&self) -> Vec<(u64, u64)> {
        self.shared.captured_prps.lock().unwrap().clone()
    }
}
