// Licensed under the MIT License.

//! The in-memory representation of a data transfer.

/// An owned, heap-resident byte buffer with an explicit size.
///
/// This is the canonical form data takes between host memory and an opcode
/// handler: the PRP walker materialises one from a descriptor chain and
/// scatters one back out. Construction zeroes the buffer; cloning deep-copies
/// the bytes.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Payload {
    buf: Vec<u8>,
}

impl Payload {
    /// Creates a zero-filled payload of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self { buf: vec![0; len] }
    }

    /// Creates a payload holding a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec(),
        }
    }

    /// The size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true for a zero-sized payload.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the backing bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutably borrows the backing bytes.
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Copies `src` into the payload at `offset`.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) {
        assert!(
            offset <= self.buf.len() && src.len() <= self.buf.len() - offset,
            "payload write at {offset:#x} len {:#x} outside buffer of {:#x} bytes",
            src.len(),
            self.buf.len(),
        );
        self.buf[offset..offset + src.len()].copy_from_slice(src);
    }

    /// Copies `dest.len()` bytes out of the payload starting at `offset`.
    pub fn read_at(&self, offset: usize, dest: &mut [u8]) {
        assert!(
            offset <= self.buf.len() && dest.len() <= self.buf.len() - offset,
            "payload read at {offset:#x} len {:#x} outside buffer of {:#x} bytes",
            dest.len(),
            self.buf.len(),
        );
        dest.copy_from_slice(&self.buf[offset..offset + dest.len()]);
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_zeroed() {
        let p = Payload::new(16);
        assert_eq!(p.len(), 16);
        assert!(p.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read() {
        let mut p = Payload::new(8);
        p.write_at(2, &[0xaa, 0xbb]);
        let mut out = [0u8; 4];
        p.read_at(1, &mut out);
        assert_eq!(out, [0, 0xaa, 0xbb, 0]);
    }

    #[test]
    fn clone_is_deep() {
        let mut p = Payload::new(4);
        let q = p.clone();
        p.write_at(0, &[1]);
        assert_eq!(q.as_bytes()[0], 0);
    }

    #[test]
    #[should_panic(expected = "payload write")]
    fn write_out_of_bounds_panics() {
        let mut p = Payload::new(4);
        p.write_at(3, &[0; 2]);
    }
}
