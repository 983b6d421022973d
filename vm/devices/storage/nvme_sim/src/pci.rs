// Licensed under the MIT License.

//! The PCI Express configuration surface of the controller.

use crate::DEVICE_ID;
use crate::VENDOR_ID;
use crate::registers::RegisterError;
use crate::registers::RegisterImage;
use nvme_spec::pci::CfgSpace;
use nvme_spec::pci::Mlbar;
use nvme_spec::pci::Mubar;
use nvme_spec::pci::bar0_base;
use std::sync::Arc;

/// The 256-byte PCI type-0 configuration image.
pub struct PciRegisters {
    image: RegisterImage,
}

impl PciRegisters {
    pub(crate) fn new() -> Arc<Self> {
        let this = Self {
            image: RegisterImage::new(CfgSpace::LEN),
        };
        let id = VENDOR_ID as u32 | (DEVICE_ID as u32) << 16;
        this.image
            .write_internal(CfgSpace::ID.0 as u64, &id.to_le_bytes())
            .unwrap();
        // Revision 0 plus the NVMe class code bytes.
        let [prog_if, subclass, base_class] = nvme_spec::pci::CLASS_CODE_NVME;
        let rid_cc =
            (prog_if as u32) << 8 | (subclass as u32) << 16 | (base_class as u32) << 24;
        this.image
            .write_internal(CfgSpace::RID_CC.0 as u64, &rid_cc.to_le_bytes())
            .unwrap();
        Arc::new(this)
    }

    /// Reads the 32-bit configuration register at `offset`.
    pub fn cfg_read(&self, offset: u16) -> Result<u32, RegisterError> {
        if offset % 4 != 0 {
            return Err(RegisterError::Unaligned {
                offset: offset.into(),
            });
        }
        let mut buf = [0; 4];
        self.image.read(offset.into(), &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes the 32-bit configuration register at `offset`.
    pub fn cfg_write(&self, offset: u16, value: u32) -> Result<(), RegisterError> {
        if offset % 4 != 0 {
            return Err(RegisterError::Unaligned {
                offset: offset.into(),
            });
        }
        if usize::from(offset) + 4 > CfgSpace::LEN {
            return Err(RegisterError::OutOfRange {
                offset: offset.into(),
                len: 4,
                image: CfgSpace::LEN,
            });
        }
        let stored = match CfgSpace(offset) {
            CfgSpace::CMD => value,
            // The BA field of MLBAR starts at bit 14; the low bits are type
            // and reserved bits, hardwired to zero.
            CfgSpace::MLBAR => value & !0x3fff,
            CfgSpace::MUBAR => value,
            _ => {
                tracing::debug!(offset, value, "config space write ignored");
                return Ok(());
            }
        };
        self.image.write_host(offset.into(), &stored.to_le_bytes())
    }

    /// The base address the controller registers are mapped at:
    /// `MLBAR.BA | (MUBAR.BA << 18)`.
    pub fn bar0(&self) -> u64 {
        let mlbar = Mlbar::from(self.cfg_read(CfgSpace::MLBAR.0).unwrap());
        let mubar = Mubar::from(self.cfg_read(CfgSpace::MUBAR.0).unwrap());
        bar0_base(mlbar, mubar)
    }

    /// The current host-write count, for pairing with [`Self::wait_for_change`].
    pub fn changes(&self) -> u64 {
        self.image.changes()
    }

    /// Blocks until the host writes the configuration image.
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

    #[test]
    fn id_and_class_code() {
        let pci = PciRegisters::new();
        let id = pci.cfg_read(0).unwrap();
        assert_eq!(id & 0xffff, VENDOR_ID as u32);
        assert_eq!(id >> 16, DEVICE_ID as u32);
        assert_eq!(pci.cfg_read(8).unwrap() >> 8, 0x01_08_02);
    }

    #[test]
    fn bars_concatenate() {
        let pci = PciRegisters::new();
        let mlbar = u32::from(Mlbar::new().with_ba(0x2_0000));
        pci.cfg_write(CfgSpace::MLBAR.0, mlbar).unwrap();
        pci.cfg_write(CfgSpace::MUBAR.0, 0x5).unwrap();
        assert_eq!(pci.bar0(), 0x2_0000 | 0x5 << 18);
    }

    #[test]
    fn mlbar_low_bits_hardwired() {
        let pci = PciRegisters::new();
        pci.cfg_write(CfgSpace::MLBAR.0, 0xffff_ffff).unwrap();
        assert_eq!(pci.cfg_read(CfgSpace::MLBAR.0).unwrap(), 0xffff_c000);
    }

    #[test]
    fn id_is_read_only() {
        let pci = PciRegisters::new();
        pci.cfg_write(0, 0xdead_beef).unwrap();
        let id = pci.cfg_read(0).unwrap();
        assert_eq!(id & 0xffff, VENDOR_ID as u32);
    }

    #[test]
    fn unaligned_access_fails() {
        let pci = PciRegisters::new();
        assert!(pci.cfg_read(2).is_err());
        assert!(pci.cfg_write(0x12, 0).is_err());
    }
}
