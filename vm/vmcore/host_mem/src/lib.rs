// Licensed under the MIT License.

//! Simulated host memory for device emulators.
//!
//! The simulator has no real DMA; the "host" and the controller exchange data
//! through a single in-process address space. [`HostMemory`] is a cheaply
//! cloneable handle to that space. Accesses are bounds-checked and go through
//! atomics, so host threads and the controller can touch disjoint regions
//! concurrently without locking; ordering between them is the protocol's
//! responsibility, not this crate's.

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// An access failure against the simulated host address space.
#[derive(Debug, Error)]
#[error("host memory access at {addr:#x} len {len:#x} outside space of {space:#x} bytes")]
pub struct HostMemoryError {
    /// Address of the failed access.
    pub addr: u64,
    /// Length of the failed access.
    pub len: usize,
    /// Total size of the address space.
    pub space: usize,
}

/// A handle to the simulated host address space.
///
/// Clones share the same backing storage.
#[derive(Clone)]
pub struct HostMemory {
    space: Arc<[AtomicU8]>,
}

impl std::fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMemory")
            .field("len", &self.space.len())
            .finish()
    }
}

impl HostMemory {
    /// Allocates a zeroed address space of `len` bytes.
    pub fn allocate(len: usize) -> Self {
        let mut space = Vec::new();
        space.resize_with(len, || AtomicU8::new(0));
        Self {
            space: space.into(),
        }
    }

    /// Returns the size of the address space in bytes.
    pub fn len(&self) -> usize {
        self.space.len()
    }

    /// Returns true if the address space is empty.
    pub fn is_empty(&self) -> bool {
        self.space.is_empty()
    }

    fn check(&self, addr: u64, len: usize) -> Result<usize, HostMemoryError> {
        let offset = usize::try_from(addr).ok().filter(|&o| {
            o <= self.space.len() && len <= self.space.len() - o
        });
        offset.ok_or(HostMemoryError {
            addr,
            len,
            space: self.space.len(),
        })
    }

    /// Reads `dest.len()` bytes starting at `addr`.
    pub fn read_at(&self, addr: u64, dest: &mut [u8]) -> Result<(), HostMemoryError> {
        let offset = self.check(addr, dest.len())?;
        for (d, s) in dest.iter_mut().zip(&self.space[offset..]) {
            *d = s.load(Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes `src` starting at `addr`.
    pub fn write_at(&self, addr: u64, src: &[u8]) -> Result<(), HostMemoryError> {
        let offset = self.check(addr, src.len())?;
        for (d, s) in self.space[offset..].iter().zip(src) {
            d.store(*s, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes `len` copies of `val` starting at `addr`.
    pub fn fill_at(&self, addr: u64, val: u8, len: usize) -> Result<(), HostMemoryError> {
        let offset = self.check(addr, len)?;
        for d in &self.space[offset..offset + len] {
            d.store(val, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Reads a `T` from `addr`.
    pub fn read_plain<T: FromBytes + IntoBytes>(&self, addr: u64) -> Result<T, HostMemoryError> {
        let mut val = T::new_zeroed();
        self.read_at(addr, val.as_mut_bytes())?;
        Ok(val)
    }

    /// Writes a `T` at `addr`.
    pub fn write_plain<T: IntoBytes + Immutable + KnownLayout + ?Sized>(
        &self,
        addr: u64,
        val: &T,
    ) -> Result<(), HostMemoryError> {
        self.write_at(addr, val.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mem = HostMemory::allocate(0x1000);
        mem.write_at(0x10, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mem.read_at(0x10, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn allocate_is_zeroed() {
        let mem = HostMemory::allocate(0x100);
        let mut buf = [0xffu8; 0x100];
        mem.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn clones_share_storage() {
        let mem = HostMemory::allocate(0x100);
        let other = mem.clone();
        other.write_at(0x20, &[0xab]).unwrap();
        let mut buf = [0u8; 1];
        mem.read_at(0x20, &mut buf).unwrap();
        assert_eq!(buf[0], 0xab);
    }

    #[test]
    fn out_of_bounds_fails() {
        let mem = HostMemory::allocate(0x100);
        assert!(mem.write_at(0xfe, &[0; 4]).is_err());
        assert!(mem.read_at(0x100, &mut [0; 1]).is_err());
        assert!(mem.read_at(u64::MAX, &mut [0; 1]).is_err());
        // A zero-length access at the end of the space is legal.
        mem.read_at(0x100, &mut []).unwrap();
    }

    #[test]
    fn plain_round_trip() {
        let mem = HostMemory::allocate(0x100);
        mem.write_plain(0x40, &0x1234_5678_9abc_def0u64).unwrap();
        assert_eq!(
            mem.read_plain::<u64>(0x40).unwrap(),
            0x1234_5678_9abc_def0
        );
        let mut raw = [0u8; 8];
        mem.read_at(0x40, &mut raw).unwrap();
        assert_eq!(raw, [0xf0, 0xde, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn fill_at_fills() {
        let mem = HostMemory::allocate(0x100);
        mem.fill_at(0x10, 0x5a, 0x10).unwrap();
        let mut buf = [0u8; 0x12];
        mem.read_at(0xf, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
        assert!(buf[1..0x11].iter().all(|&b| b == 0x5a));
        assert_eq!(buf[0x11], 0);
    }
}
