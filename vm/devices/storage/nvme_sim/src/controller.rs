// Licensed under the MIT License.

//! The top-level controller: register images, the command engine, and the
//! watcher tasks that connect them.

use crate::engine::Engine;
use crate::logging;
use crate::logging::LoggingLevel;
use crate::pci::PciRegisters;
use crate::registers::ControllerRegisters;
use crate::registers::RegisterError;
use crate::watcher::LoopingTask;
use host_mem::HostMemory;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Controller configuration.
#[derive(Clone, Debug)]
pub struct NvmeControllerConfig {
    /// Elides the watcher tasks; the host drives [`NvmeController::check_for_changes`]
    /// itself. Externally observable behavior is the same in both modes.
    pub single_threaded: bool,
    /// The doorbell watcher period.
    pub change_check_sleep: Duration,
    /// How chatty the simulator is.
    pub logging_level: LoggingLevel,
    /// The highest IO queue pair id the controller accepts.
    pub max_io_queues: u16,
}

impl Default for NvmeControllerConfig {
    fn default() -> Self {
        Self {
            single_threaded: false,
            change_check_sleep: Duration::from_millis(1),
            logging_level: LoggingLevel::default(),
            max_io_queues: 64,
        }
    }
}

/// A software NVMe controller.
///
/// The host talks to it the way a driver talks to hardware: configuration
/// reads and writes against the PCI image, register reads and writes against
/// BAR0, and command/completion traffic through queues in [`HostMemory`].
pub struct NvmeController {
    pci: Arc<PciRegisters>,
    regs: Arc<ControllerRegisters>,
    engine: Arc<Mutex<Engine>>,
    doorbell_watcher: Option<LoopingTask>,
    register_watcher: Option<JoinHandle<()>>,
    single_threaded: bool,
}

impl NvmeController {
    /// Creates a controller over the given host memory.
    pub fn new(mem: HostMemory, config: NvmeControllerConfig) -> Self {
        logging::apply(config.logging_level);
        let pci = PciRegisters::new();
        let regs = ControllerRegisters::new(config.max_io_queues);
        let engine = Arc::new(Mutex::new(Engine::new(
            mem,
            regs.clone(),
            config.max_io_queues,
        )));

        let (doorbell_watcher, register_watcher) = if config.single_threaded {
            (None, None)
        } else {
            let doorbell_watcher = LoopingTask::spawn("nvme-doorbell", config.change_check_sleep, {
                let engine = engine.clone();
                move || engine.lock().check_for_changes()
            });
            let register_watcher = std::thread::Builder::new()
                .name("nvme-registers".to_owned())
                .spawn({
                    let regs = regs.clone();
                    let engine = engine.clone();
                    move || {
                        let mut seen = regs.changes();
                        while let Some(next) = regs.wait_for_change(seen) {
                            seen = next;
                            process_controller_state(&regs, &engine);
                        }
                    }
                })
                .expect("failed to spawn register watcher thread");
            (Some(doorbell_watcher), Some(register_watcher))
        };

        Self {
            pci,
            regs,
            engine,
            doorbell_watcher,
            register_watcher,
            single_threaded: config.single_threaded,
        }
    }

    /// The PCI configuration image.
    pub fn pci_registers(&self) -> &PciRegisters {
        &self.pci
    }

    /// The controller register image.
    pub fn controller_registers(&self) -> &ControllerRegisters {
        &self.regs
    }

    /// Reads the 32-bit PCI configuration register at `offset`.
    pub fn pci_cfg_read(&self, offset: u16) -> Result<u32, RegisterError> {
        self.pci.cfg_read(offset)
    }

    /// Writes the 32-bit PCI configuration register at `offset`.
    pub fn pci_cfg_write(&self, offset: u16, value: u32) -> Result<(), RegisterError> {
        self.pci.cfg_write(offset, value)
    }

    /// The address the controller registers are mapped at, per the BARs.
    pub fn bar0(&self) -> u64 {
        self.pci.bar0()
    }

    /// Reads controller register bytes at `offset` within BAR0.
    pub fn read_bar0(&self, offset: u64, data: &mut [u8]) -> Result<(), RegisterError> {
        self.regs.read(offset, data)
    }

    /// A host write to the controller registers or doorbells.
    pub fn write_bar0(&self, offset: u64, data: &[u8]) -> Result<(), RegisterError> {
        self.regs.host_write(offset, data)
    }

    /// Runs one engine pass. In single-threaded mode pending CC transitions
    /// are applied first, which the register watcher does in threaded mode.
    pub fn check_for_changes(&self) {
        if self.single_threaded {
            process_controller_state(&self.regs, &self.engine);
        }
        self.engine.lock().check_for_changes();
    }

    /// Steps the simulation: waits for the watcher to complete an iteration,
    /// or, in single-threaded mode, runs one directly.
    pub fn wait_for_change_loop(&self) {
        match &self.doorbell_watcher {
            Some(watcher) => watcher.wait_for_flip(),
            None => self.check_for_changes(),
        }
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        // Stop the watchers before the registers go away.
        if let Some(mut watcher) = self.doorbell_watcher.take() {
            watcher.end();
        }
        self.regs.close();
        self.pci.close();
        if let Some(register_watcher) = self.register_watcher.take() {
            let _ = register_watcher.join();
        }
    }
}

/// Applies host CC writes to the controller state machine: enable raises
/// CSTS.RDY, disable while ready runs a controller reset.
fn process_controller_state(regs: &ControllerRegisters, engine: &Mutex<Engine>) {
    let cc = regs.cc();
    let csts = regs.csts();
    if cc.en() && !csts.rdy() && !csts.cfs() {
        if !regs.mps_valid(cc) {
            tracing::error!(mps = cc.mps(), "disallowed memory page size; fatal status");
            regs.set_fatal();
            return;
        }
        tracing::info!("controller enabled");
        regs.set_ready(true);
    } else if !cc.en() && csts.rdy() {
        engine.lock().controller_reset();
        regs.reset_registers();
        tracing::info!("controller reset complete");
    }
}
