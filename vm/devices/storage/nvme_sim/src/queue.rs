// Licensed under the MIT License.

//! The submission/completion queue abstraction.
//!
//! A [`Queue`] only does ring arithmetic over a host-memory region; fetching
//! commands and posting completions against that region is the command
//! engine's job.

use crate::registers::DoorbellHandle;

/// Size of a submission queue entry in bytes.
pub const SQ_ENTRY_SIZE: u32 = 64;
/// Size of a completion queue entry in bytes.
pub const CQ_ENTRY_SIZE: u32 = 16;

/// One ring in host memory, either a submission or a completion queue.
#[derive(Debug)]
pub struct Queue {
    qid: u16,
    len: u32,
    entry_size: u32,
    gpa: u64,
    head: u32,
    tail: u32,
    doorbell: DoorbellHandle,
    peer: Option<u16>,
}

impl Queue {
    /// Creates a queue of `len` entries of `entry_size` bytes over the host
    /// memory at `gpa`.
    pub fn new(qid: u16, len: u32, entry_size: u32, gpa: u64, doorbell: DoorbellHandle) -> Self {
        Self {
            qid,
            len,
            entry_size,
            gpa,
            head: 0,
            tail: 0,
            doorbell,
            peer: None,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// The base address of the queue's host-memory region.
    pub fn memory_address(&self) -> u64 {
        self.gpa
    }

    /// The size of the queue's host-memory region in bytes.
    pub fn memory_size(&self) -> u64 {
        self.len as u64 * self.entry_size as u64
    }

    /// The address of the entry at `index`.
    pub fn entry_address(&self, index: u32) -> u64 {
        debug_assert!(index < self.len);
        self.gpa + index as u64 * self.entry_size as u64
    }

    /// Adopts a tail value rung by the host. Returns false, leaving the
    /// shadow tail unchanged, if the value is outside the ring.
    pub fn set_tail(&mut self, tail: u32) -> bool {
        if tail >= self.len {
            return false;
        }
        self.tail = tail;
        true
    }

    /// Moves the head one entry closer to the tail, wrapping at the ring end.
    pub fn advance_head(&mut self) {
        self.head = advance(self.head, self.len);
    }

    /// True when head == tail.
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Rebinds the queue to a new host-memory base. Used when the host moves
    /// the admin queues while the controller is disabled.
    pub fn set_memory_address(&mut self, gpa: u64) {
        self.gpa = gpa;
    }

    pub fn doorbell(&self) -> &DoorbellHandle {
        &self.doorbell
    }

    /// The qid of the mapped peer queue (CQ for an SQ and vice versa).
    pub fn peer(&self) -> Option<u16> {
        self.peer
    }

    pub fn set_peer(&mut self, peer: Option<u16>) {
        self.peer = peer;
    }

    /// Returns the ring to its initial indices, for controller reset.
    pub fn reset(&mut self) {
        self.head = 0;
        self.tail = 0;
    }
}

fn advance(n: u32, l: u32) -> u32 {
    if n + 1 < l { n + 1 } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::ControllerRegisters;
    use crate::registers::DoorbellKind;

    fn test_queue(len: u32) -> Queue {
        let regs = ControllerRegisters::new(4);
        let doorbell = regs.doorbell(1, DoorbellKind::SqTail);
        Queue::new(1, len, SQ_ENTRY_SIZE, 0x4000, doorbell)
    }

    #[test]
    fn tail_validation() {
        let mut q = test_queue(4);
        assert!(q.set_tail(3));
        assert_eq!(q.tail(), 3);
        assert!(!q.set_tail(4));
        assert_eq!(q.tail(), 3);
        assert!(q.set_tail(0));
    }

    #[test]
    fn head_wraps() {
        let mut q = test_queue(2);
        assert!(q.set_tail(1));
        assert!(!q.is_empty());
        q.advance_head();
        assert_eq!(q.head(), 1);
        assert!(q.is_empty());
        q.advance_head();
        assert_eq!(q.head(), 0);
    }

    #[test]
    fn geometry() {
        let q = test_queue(16);
        assert_eq!(q.memory_size(), 16 * 64);
        assert_eq!(q.entry_address(3), 0x4000 + 3 * 64);
    }

    #[test]
    fn peer_linkage() {
        let mut q = test_queue(4);
        assert_eq!(q.peer(), None);
        q.set_peer(Some(1));
        assert_eq!(q.peer(), Some(1));
    }
}
