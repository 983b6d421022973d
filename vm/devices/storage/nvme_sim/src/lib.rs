// Licensed under the MIT License.

//! A software simulation of an NVMe controller.
//!
//! The controller emulates the register interface, the PCI configuration
//! surface, and the submission/completion queue machinery a host driver
//! drives against real hardware, with host memory simulated as a shared
//! in-process address space. There is no media behind it; the NVM command
//! set is a documented stub, which is enough for driver bring-up and
//! storage-stack test harnesses.

#![forbid(unsafe_code)]

mod controller;
mod engine;
mod error;
pub mod logging;
mod payload;
mod pci;
mod prp;
mod queue;
mod registers;
mod watcher;

#[cfg(test)]
mod tests;

pub use controller::NvmeController;
pub use controller::NvmeControllerConfig;
pub use logging::LoggingLevel;
pub use payload::Payload;
pub use pci::PciRegisters;
pub use prp::PrpRange;
pub use registers::ControllerRegisters;
pub use registers::RegisterError;

use nvme_spec as spec;

// Device configuration shared by the PCI and register models.
const VENDOR_ID: u16 = 0x1234;
const DEVICE_ID: u16 = 0x00c1;
const NVME_VERSION: u32 = 0x00010400;
const MAX_QES: u16 = 256;
const ADMIN_QUEUE_ID: u16 = 0;
