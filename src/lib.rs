mod cmd;
mod ctrl;
mod error;
mod events;
mod memory;
#[cfg(test)]
mod mock;
mod pci;
mod queues;
mod regs;

pub use cmd::{CID_AER, Command, Completion, QueueFlags};
pub use ctrl::{Controller, CtrlConfig, CtrlFlags, CtrlOpts};
pub use error::{Error, Result, StatusCode, StatusCodeType};
pub use events::{AsyncEvent, AsyncEventInfo, AsyncEventType};
pub use memory::{DmaRegion, PAGESHIFT, PAGESIZE};
pub use pci::{PciDevice, Prot};
pub use queues::{AenHandler, CompQueue, Request, RequestTag, SubQueue};
pub use regs::{NVME_AQ, NVME_AQ_QSIZE, NVME_CQES, NVME_SQES, Register};
