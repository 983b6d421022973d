// Licensed under the MIT License.

//! Types for parsing NVMe PRP (Physical Region Page) entries and lists.

use crate::error::NvmeError;
use crate::payload::Payload;
use crate::spec;
use host_mem::HostMemory;
use zerocopy::IntoBytes;

enum PrpPages {
    Short([u64; 2]),
    Long(Vec<u64>),
}

/// A parsed PRP descriptor pair: the scatter-gather description of one
/// command's data transfer.
pub struct PrpRange {
    offset: usize,
    len: usize,
    mps: usize,
    pages: PrpPages,
}

impl PrpRange {
    /// Parses a PRP range for a transfer of `len` bytes from the two PRP
    /// values in `prp`, against a memory page size of `mps` bytes.
    ///
    /// PRP1 may start at any offset within its page. PRP2 is unused when the
    /// transfer fits in the first page, a direct page pointer when it fits in
    /// exactly one more, and a PRP list pointer otherwise. The last entry of a
    /// full list page chains to the next list page while data remains; the
    /// chain walk is bounded by the page count of the transfer, so a
    /// self-referencing list fails the final bounds check instead of looping.
    pub fn parse(
        mem: &HostMemory,
        len: usize,
        prp: [u64; 2],
        mps: usize,
    ) -> Result<Self, NvmeError> {
        assert!(mps.is_power_of_two(), "memory page size {mps:#x}");
        let mps_mask = mps as u64 - 1;
        let offset = (prp[0] & mps_mask) as usize;
        let pages = if len + offset <= mps * 2 {
            PrpPages::Short(prp.map(|x| x & !mps_mask))
        } else {
            let count = (offset + len).div_ceil(mps);
            let mut v = vec![0u64; count];
            v[0] = prp[0];
            let entries_per_page = mps / 8;
            let mut entries = &mut v[1..];
            let mut next_prp_list = prp[1];
            loop {
                let n = entries.len().min(entries_per_page);
                mem.read_at(next_prp_list, entries[..n].as_mut_bytes())
                    .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
                if n == entries.len() {
                    break;
                }
                next_prp_list = entries[n - 1] & !mps_mask;
                entries = &mut entries[n - 1..];
            }
            for gpa in &mut v {
                *gpa &= !mps_mask;
            }
            PrpPages::Long(v)
        };
        Ok(Self {
            offset,
            len,
            mps,
            pages,
        })
    }

    /// The transfer size in bytes.
    pub fn transfer_len(&self) -> usize {
        self.len
    }

    /// The `(address, len)` runs of host memory the range describes, in
    /// transfer order.
    fn segments(&self) -> Vec<(u64, usize)> {
        let pages = match &self.pages {
            PrpPages::Short(pages) => &pages[..],
            PrpPages::Long(pages) => pages,
        };
        let mut segments = Vec::new();
        let mut remaining = self.len;
        let mut index = 0;
        if remaining > 0 {
            let first = remaining.min(self.mps - self.offset);
            segments.push((pages[0] + self.offset as u64, first));
            remaining -= first;
            index = 1;
        }
        while remaining > 0 {
            let n = remaining.min(self.mps);
            segments.push((pages[index], n));
            remaining -= n;
            index += 1;
        }
        segments
    }

    /// Reads the described bytes out of host memory into a fresh payload of
    /// exactly the transfer size.
    pub fn get_payload_copy(&self, mem: &HostMemory) -> Result<Payload, NvmeError> {
        let mut payload = Payload::new(self.len);
        let mut pos = 0;
        for (addr, n) in self.segments() {
            mem.read_at(addr, &mut payload.as_mut_bytes()[pos..pos + n])
                .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
            pos += n;
        }
        Ok(payload)
    }

    /// Writes `payload` back into the host-memory pages the range describes.
    ///
    /// Fails unless the payload size equals the transfer size.
    pub fn place_payload_in_existing_prps(
        &self,
        mem: &HostMemory,
        payload: &Payload,
    ) -> Result<(), NvmeError> {
        if payload.len() != self.len {
            return Err(NvmeError::new(
                spec::Status::INTERNAL_ERROR,
                format!(
                    "payload of {:#x} bytes does not match transfer of {:#x} bytes",
                    payload.len(),
                    self.len
                ),
            ));
        }
        let mut pos = 0;
        for (addr, n) in self.segments() {
            mem.write_at(addr, &payload.as_bytes()[pos..pos + n])
                .map_err(|err| NvmeError::new(spec::Status::DATA_TRANSFER_ERROR, err))?;
            pos += n;
        }
        Ok(())
    }
}
