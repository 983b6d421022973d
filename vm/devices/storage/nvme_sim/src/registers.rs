// Licensed under the MIT License.

//! The controller register model.
//!
//! Registers live in bit-exact byte images, as a host would see them through
//! BAR0. Typed views are decoded from the bytes on demand; nothing holds a
//! long-lived typed handle into an image. Host writes bump a change counter
//! and signal an event, which backs the blocking wait-for-change primitive
//! the register watcher sleeps on.

use crate::MAX_QES;
use crate::NVME_VERSION;
use crate::spec;
use event_listener::Event;
use event_listener::Listener;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Doorbell stride in bytes; `4 << CAP.DSTRD` with DSTRD = 0.
const DOORBELL_STRIDE: u64 = 4;

/// A failed host access to a register image.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("register access at {offset:#x} len {len:#x} outside image of {image:#x} bytes")]
    OutOfRange { offset: u64, len: usize, image: usize },
    #[error("unaligned register access at {offset:#x}")]
    Unaligned { offset: u64 },
}

/// A byte image with a host-write change counter.
pub(crate) struct RegisterImage {
    bytes: Mutex<Vec<u8>>,
    changes: AtomicU64,
    event: Event,
    closed: AtomicBool,
}

impl RegisterImage {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0; len]),
            changes: AtomicU64::new(0),
            event: Event::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn check(&self, offset: u64, len: usize, image: usize) -> Result<usize, RegisterError> {
        usize::try_from(offset)
            .ok()
            .filter(|&o| o <= image && len <= image - o)
            .ok_or(RegisterError::OutOfRange { offset, len, image })
    }

    pub fn read(&self, offset: u64, dest: &mut [u8]) -> Result<(), RegisterError> {
        let bytes = self.bytes.lock();
        let o = self.check(offset, dest.len(), bytes.len())?;
        dest.copy_from_slice(&bytes[o..o + dest.len()]);
        Ok(())
    }

    /// A controller-side write; does not count as a host change.
    pub fn write_internal(&self, offset: u64, src: &[u8]) -> Result<(), RegisterError> {
        let mut bytes = self.bytes.lock();
        let o = self.check(offset, src.len(), bytes.len())?;
        bytes[o..o + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// A host-side write; signals the change primitive.
    pub fn write_host(&self, offset: u64, src: &[u8]) -> Result<(), RegisterError> {
        self.write_internal(offset, src)?;
        self.changes.fetch_add(1, Ordering::SeqCst);
        self.event.notify(usize::MAX);
        Ok(())
    }

    /// The number of host writes so far.
    pub fn changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }

    /// Blocks until the host has written to the image since `last_seen`,
    /// returning the new change count, or `None` once the image is closed.
    pub fn wait_for_change(&self, last_seen: u64) -> Option<u64> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let current = self.changes();
            if current != last_seen {
                return Some(current);
            }
            let listener = self.event.listen();
            // Recheck with the listener registered so a write between the
            // check and the listen is not lost.
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            let current = self.changes();
            if current != last_seen {
                return Some(current);
            }
            listener.wait();
        }
    }

    /// Wakes all waiters permanently, for shutdown.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.event.notify(usize::MAX);
    }
}

/// Which doorbell of a queue pair a handle refers to.
#[derive(Copy, Clone, Debug)]
pub enum DoorbellKind {
    SqTail,
    CqHead,
}

/// A handle to one 32-bit doorbell register within the controller image.
#[derive(Clone)]
pub struct DoorbellHandle {
    regs: Arc<ControllerRegisters>,
    offset: u64,
}

impl DoorbellHandle {
    pub fn read(&self) -> u32 {
        self.regs.read_u32(self.offset)
    }

    /// A controller-side doorbell update (the CQ head doorbell ring).
    pub fn write(&self, value: u32) {
        self.regs
            .image
            .write_internal(self.offset, &value.to_le_bytes())
            .expect("doorbell offset is always within the image");
    }
}

impl std::fmt::Debug for DoorbellHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoorbellHandle")
            .field("offset", &self.offset)
            .finish()
    }
}

/// The controller register image: the registers at BAR0 followed by the
/// per-queue doorbell array.
pub struct ControllerRegisters {
    image: RegisterImage,
    doorbell_pairs: u16,
}

impl ControllerRegisters {
    pub(crate) fn new(max_io_queues: u16) -> Arc<Self> {
        let doorbell_pairs = max_io_queues + 1;
        let len = spec::Register::DOORBELL_BASE as usize
            + doorbell_pairs as usize * 2 * DOORBELL_STRIDE as usize;
        let this = Self {
            image: RegisterImage::new(len),
            doorbell_pairs,
        };
        let cap = spec::Cap::new()
            .with_mqes_z(MAX_QES - 1)
            .with_cqr(true)
            .with_to(!0u8)
            .with_dstrd(0)
            .with_css_nvm(true)
            .with_mpsmax(4);
        this.image
            .write_internal(spec::Register::CAP.0 as u64, &u64::from(cap).to_le_bytes())
            .unwrap();
        this.image
            .write_internal(spec::Register::VS.0 as u64, &NVME_VERSION.to_le_bytes())
            .unwrap();
        Arc::new(this)
    }

    fn read_u32(&self, offset: u64) -> u32 {
        let mut buf = [0; 4];
        self.image
            .read(offset, &mut buf)
            .expect("register offset is always within the image");
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0; 8];
        self.image
            .read(offset, &mut buf)
            .expect("register offset is always within the image");
        u64::from_le_bytes(buf)
    }

    pub fn cap(&self) -> spec::Cap {
        self.read_u64(spec::Register::CAP.0 as u64).into()
    }

    pub fn cc(&self) -> spec::Cc {
        self.read_u32(spec::Register::CC.0 as u64).into()
    }

    pub fn csts(&self) -> spec::Csts {
        self.read_u32(spec::Register::CSTS.0 as u64).into()
    }

    pub fn aqa(&self) -> spec::Aqa {
        self.read_u32(spec::Register::AQA.0 as u64).into()
    }

    /// The admin submission queue base address (ASQ.ASQB).
    pub fn asq(&self) -> u64 {
        self.read_u64(spec::Register::ASQ.0 as u64) & !0xfff
    }

    /// The admin completion queue base address (ACQ.ACQB).
    pub fn acq(&self) -> u64 {
        self.read_u64(spec::Register::ACQ.0 as u64) & !0xfff
    }

    /// The memory page size configured by the host, `1 << (12 + CC.MPS)`.
    pub fn memory_page_size(&self) -> u64 {
        1 << (12 + self.cc().mps())
    }

    pub(crate) fn mps_valid(&self, cc: spec::Cc) -> bool {
        let cap = self.cap();
        (cap.mpsmin()..=cap.mpsmax()).contains(&cc.mps())
    }

    pub(crate) fn set_ready(&self, rdy: bool) {
        let csts = self.csts().with_rdy(rdy);
        self.image
            .write_internal(spec::Register::CSTS.0 as u64, &u32::from(csts).to_le_bytes())
            .unwrap();
    }

    pub(crate) fn set_fatal(&self) {
        let csts = self.csts().with_cfs(true);
        self.image
            .write_internal(spec::Register::CSTS.0 as u64, &u32::from(csts).to_le_bytes())
            .unwrap();
    }

    /// Applies the register side of a controller reset: CSTS and the doorbell
    /// array are cleared; CAP, VS and the admin queue registers (AQA, ASQ,
    /// ACQ) keep their values, and CC stays as the host last wrote it.
    pub(crate) fn reset_registers(&self) {
        self.image
            .write_internal(spec::Register::CSTS.0 as u64, &0u32.to_le_bytes())
            .unwrap();
        let doorbell_len = self.doorbell_pairs as usize * 2 * DOORBELL_STRIDE as usize;
        self.image
            .write_internal(
                spec::Register::DOORBELL_BASE as u64,
                &vec![0; doorbell_len],
            )
            .unwrap();
    }

    /// A handle to a queue's doorbell register.
    pub(crate) fn doorbell(self: &Arc<Self>, qid: u16, kind: DoorbellKind) -> DoorbellHandle {
        assert!(qid < self.doorbell_pairs, "qid {qid} has no doorbell");
        let index = qid as u64 * 2 + matches!(kind, DoorbellKind::CqHead) as u64;
        DoorbellHandle {
            regs: self.clone(),
            offset: spec::Register::DOORBELL_BASE as u64 + index * DOORBELL_STRIDE,
        }
    }

    /// Reads host-visible register bytes at `offset` within BAR0.
    pub fn read(&self, offset: u64, dest: &mut [u8]) -> Result<(), RegisterError> {
        self.image.read(offset, dest)
    }

    /// A host write to the register region.
    ///
    /// CAP, VS and CSTS are controller-owned; writes touching them are
    /// dropped, as the transport discards writes to read-only registers.
    pub fn host_write(&self, offset: u64, src: &[u8]) -> Result<(), RegisterError> {
        const READ_ONLY: &[(u64, u64)] = &[(0x0, 0x10), (0x1c, 0x20)];
        let end = offset.saturating_add(src.len() as u64);
        if READ_ONLY.iter().any(|&(s, e)| offset < e && end > s) {
            tracing::warn!(offset, "host write to read-only register ignored");
            return Ok(());
        }
        self.image.write_host(offset, src)
    }

    /// The current host-write count, for pairing with [`Self::wait_for_change`].
    pub fn changes(&self) -> u64 {
        self.image.changes()
    }

    /// Blocks until the host writes the register region; see
    /// [`RegisterImage::wait_for_change`].
    pub fn wait_for_change(&self, last_seen: u64) -> Option<u64> {
        self.image.wait_for_change(last_seen)
    }

    pub(crate) fn close(&self) {
        self.image.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cap_and_version_initialised() {
        let regs = ControllerRegisters::new(4);
        let cap = regs.cap();
        assert_eq!(cap.mqes_z(), MAX_QES - 1);
        assert!(cap.cqr());
        assert_eq!(cap.dstrd(), 0);
        let mut vs = [0; 4];
        regs.read(spec::Register::VS.0 as u64, &mut vs).unwrap();
        assert_eq!(u32::from_le_bytes(vs), NVME_VERSION);
    }

    #[test]
    fn host_writes_are_observable() {
        let regs = ControllerRegisters::new(4);
        regs.host_write(spec::Register::ASQ.0 as u64, &0x4000u64.to_le_bytes())
            .unwrap();
        assert_eq!(regs.asq(), 0x4000);
    }

    #[test]
    fn read_only_registers_ignore_host_writes() {
        let regs = ControllerRegisters::new(4);
        let before = regs.changes();
        regs.host_write(spec::Register::CSTS.0 as u64, &1u32.to_le_bytes())
            .unwrap();
        assert!(!regs.csts().rdy());
        assert_eq!(regs.changes(), before);
    }

    #[test]
    fn doorbell_offsets() {
        let regs = ControllerRegisters::new(4);
        let sq1 = regs.doorbell(1, DoorbellKind::SqTail);
        sq1.write(7);
        let mut raw = [0; 4];
        regs.read(0x1008, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 7);
        let cq1 = regs.doorbell(1, DoorbellKind::CqHead);
        cq1.write(3);
        regs.read(0x100c, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 3);
    }

    #[test]
    fn out_of_range_access_fails() {
        let regs = ControllerRegisters::new(1);
        let mut buf = [0; 4];
        assert!(regs.read(0x10000, &mut buf).is_err());
    }

    #[test]
    fn wait_for_change_sees_host_write() {
        let regs = ControllerRegisters::new(1);
        let seen = regs.changes();
        let waiter = {
            let regs = regs.clone();
            std::thread::spawn(move || regs.wait_for_change(seen))
        };
        std::thread::sleep(Duration::from_millis(10));
        regs.host_write(spec::Register::CC.0 as u64, &1u32.to_le_bytes())
            .unwrap();
        assert_eq!(waiter.join().unwrap(), Some(seen + 1));
    }

    #[test]
    fn close_unblocks_waiters() {
        let regs = ControllerRegisters::new(1);
        let seen = regs.changes();
        let waiter = {
            let regs = regs.clone();
            std::thread::spawn(move || regs.wait_for_change(seen))
        };
        std::thread::sleep(Duration::from_millis(10));
        regs.close();
        assert_eq!(waiter.join().unwrap(), None);
    }
}
