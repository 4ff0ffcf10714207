//! Modern virtio-pci transport, BAR side.
//!
//! One memory BAR holds the four virtio structures at fixed offsets. PCI
//! configuration space (and the capability list in it) is owned by the
//! embedding VMM; [`VirtioPciTransport::capabilities`] and
//! [`VirtioPciTransport::identity`] describe what it has to publish.
//!
//! ```text
//!   0x0000  common cfg
//!   0x1000  ISR status
//!   0x2000  device cfg
//!   0x3000  notify (queue N at N * 2)
//! ```

use super::mmio::VIRTIO_VENDOR_ID;
use super::queue::Ring;
use super::{TransportKind, VirtioDevice, VirtioRegs, VIRTIO_ID_BLOCK, VIRTIO_ID_NET};
use crate::devices::{IoContext, MmioDevice};
use crate::error::{Result, VirtioError};

// ── BAR layout ──────────────────────────────────────────────────────
const COMMON_CFG: u64 = 0x0000;
const ISR_CFG: u64 = 0x1000;
const DEVICE_CFG: u64 = 0x2000;
const NOTIFY_CFG: u64 = 0x3000;
const REGION_SIZE: u64 = 0x1000;
/// Total BAR size
pub const VIRTIO_PCI_BAR_SIZE: u64 = 0x4000;
/// Bytes between the doorbells of consecutive queues
pub const NOTIFY_OFF_MULTIPLIER: u32 = 2;

// ── Common cfg fields ───────────────────────────────────────────────
const DEVICE_FEATURE_SELECT: u64 = 0x00;
const DEVICE_FEATURE: u64 = 0x04;
const DRIVER_FEATURE_SELECT: u64 = 0x08;
const DRIVER_FEATURE: u64 = 0x0C;
const MSIX_CONFIG: u64 = 0x10;
const NUM_QUEUES: u64 = 0x12;
const DEVICE_STATUS: u64 = 0x14;
const CONFIG_GENERATION: u64 = 0x15;
const QUEUE_SELECT: u64 = 0x16;
const QUEUE_SIZE: u64 = 0x18;
const QUEUE_MSIX_VECTOR: u64 = 0x1A;
const QUEUE_ENABLE: u64 = 0x1C;
const QUEUE_NOTIFY_OFF: u64 = 0x1E;
const QUEUE_DESC_LO: u64 = 0x20;
const QUEUE_DESC_HI: u64 = 0x24;
const QUEUE_DRIVER_LO: u64 = 0x28;
const QUEUE_DRIVER_HI: u64 = 0x2C;
const QUEUE_DEVICE_LO: u64 = 0x30;
const QUEUE_DEVICE_HI: u64 = 0x34;
const QUEUE_NOTIFY_DATA: u64 = 0x38;

/// MSI-X is not provided
const VIRTIO_MSI_NO_VECTOR: u32 = 0xFFFF;

// ── PCI identity ────────────────────────────────────────────────────
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1AF4;
/// Non-transitional device IDs start here
pub const VIRTIO_PCI_MODERN_DEVICE_ID_BASE: u16 = 0x1040;
pub const VIRTIO_PCI_REVISION: u8 = 1;
pub const PCI_CLASS_STORAGE_SCSI: u16 = 0x0100;
pub const PCI_CLASS_NETWORK_ETHERNET: u16 = 0x0200;
pub const PCI_CLASS_OTHER: u16 = 0xFF00;

/// PCI class and subclass advertised for a virtio device ID.
pub fn pci_class_of(device_id: u32) -> u16 {
    match device_id {
        VIRTIO_ID_NET => PCI_CLASS_NETWORK_ETHERNET,
        VIRTIO_ID_BLOCK => PCI_CLASS_STORAGE_SCSI,
        _ => PCI_CLASS_OTHER,
    }
}

/// `cfg_type` of a virtio vendor capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PciCapType {
    Common = 1,
    Notify = 2,
    Isr = 3,
    Device = 4,
}

/// One virtio vendor capability (`struct virtio_pci_cap`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtioPciCap {
    pub cfg_type: PciCapType,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
    /// Only for the notify capability
    pub notify_off_multiplier: Option<u32>,
}

/// Configuration space header values of the function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub revision: u8,
    pub class_code: u8,
    pub subclass: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub interrupt_pin: u8,
}

/// Width of each common cfg field, by start offset.
fn common_field(offset: u64) -> Option<(u64, u8)> {
    let field = match offset {
        0x00..=0x0F => (offset & !3, 4),
        0x10..=0x13 => (offset & !1, 2),
        0x14 => (DEVICE_STATUS, 1),
        0x15 => (CONFIG_GENERATION, 1),
        0x16..=0x1F => (offset & !1, 2),
        0x20..=0x37 => (offset & !3, 4),
        0x38..=0x39 => (QUEUE_NOTIFY_DATA, 2),
        _ => return None,
    };
    Some(field)
}

/// Virtio-PCI transport wrapping a device backend.
pub struct VirtioPciTransport<D: VirtioDevice> {
    /// Guest-physical base of the BAR
    bar_base: u64,
    regs: VirtioRegs,
    device: D,
}

impl<D: VirtioDevice> VirtioPciTransport<D> {
    pub fn new(bar_base: u64, device: D, virq: u32, vcpu: usize) -> Self {
        let regs = VirtioRegs::new(TransportKind::Pci, device.num_queues(), virq, vcpu);
        Self { bar_base, regs, device }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn regs(&self) -> &VirtioRegs {
        &self.regs
    }

    /// Vendor capabilities for BAR 0, in list order.
    pub fn capabilities(&self) -> [VirtioPciCap; 4] {
        let cap = |cfg_type, offset: u64| VirtioPciCap {
            cfg_type,
            bar: 0,
            offset: offset as u32,
            length: REGION_SIZE as u32,
            notify_off_multiplier: None,
        };
        [
            cap(PciCapType::Common, COMMON_CFG),
            cap(PciCapType::Isr, ISR_CFG),
            cap(PciCapType::Device, DEVICE_CFG),
            VirtioPciCap {
                notify_off_multiplier: Some(NOTIFY_OFF_MULTIPLIER),
                ..cap(PciCapType::Notify, NOTIFY_CFG)
            },
        ]
    }

    pub fn identity(&self) -> PciIdentity {
        let id = self.device.device_id() as u16;
        let class = pci_class_of(self.device.device_id());
        PciIdentity {
            vendor_id: VIRTIO_PCI_VENDOR_ID,
            device_id: VIRTIO_PCI_MODERN_DEVICE_ID_BASE + id,
            revision: VIRTIO_PCI_REVISION,
            class_code: (class >> 8) as u8,
            subclass: class as u8,
            subsystem_vendor_id: VIRTIO_VENDOR_ID as u16,
            subsystem_id: id,
            interrupt_pin: 1,
        }
    }

    // ── Common cfg ──────────────────────────────────────────────────

    fn common_read_field(&self, field: u64) -> Result<u32, VirtioError> {
        let val = match field {
            DEVICE_FEATURE_SELECT => self.regs.device_features_sel(),
            DEVICE_FEATURE => self.regs.device_features(&self.device)?,
            DRIVER_FEATURE_SELECT => self.regs.driver_features_sel(),
            DRIVER_FEATURE => self.regs.driver_features()?,
            MSIX_CONFIG | QUEUE_MSIX_VECTOR => VIRTIO_MSI_NO_VECTOR,
            NUM_QUEUES => self.regs.num_queues() as u32,
            DEVICE_STATUS => self.regs.status().bits(),
            CONFIG_GENERATION => self.regs.config_generation(),
            QUEUE_SELECT => self.regs.queue_sel(),
            QUEUE_SIZE => self.regs.queue_num_max(&self.device),
            QUEUE_ENABLE => self.regs.current_queue()?.ready() as u32,
            QUEUE_NOTIFY_OFF | QUEUE_NOTIFY_DATA => {
                self.regs.current_queue()?;
                self.regs.queue_sel()
            }
            QUEUE_DESC_LO | QUEUE_DESC_HI => ring_half(self.regs.current_queue()?.addr(Ring::Desc), field == QUEUE_DESC_HI),
            QUEUE_DRIVER_LO | QUEUE_DRIVER_HI => {
                ring_half(self.regs.current_queue()?.addr(Ring::Avail), field == QUEUE_DRIVER_HI)
            }
            QUEUE_DEVICE_LO | QUEUE_DEVICE_HI => {
                ring_half(self.regs.current_queue()?.addr(Ring::Used), field == QUEUE_DEVICE_HI)
            }
            _ => return Err(VirtioError::UnknownRegister(COMMON_CFG + field)),
        };
        Ok(val)
    }

    fn common_read(&self, offset: u64, size: u8) -> Result<u64, VirtioError> {
        let (field, width) = common_field(offset).ok_or(VirtioError::UnknownRegister(COMMON_CFG + offset))?;
        let shift = offset - field;
        if !matches!(size, 1 | 2 | 4) || shift + size as u64 > width as u64 {
            return Err(VirtioError::AccessWidth { offset: COMMON_CFG + offset, size });
        }
        let val = self.common_read_field(field)? >> (shift * 8);
        let mask = if size == 4 { u32::MAX } else { (1u32 << (size * 8)) - 1 };
        Ok((val & mask) as u64)
    }

    fn common_write(&mut self, io: &mut IoContext<'_>, offset: u64, value: u32, size: u8) -> Result<(), VirtioError> {
        let (field, width) = common_field(offset).ok_or(VirtioError::UnknownRegister(COMMON_CFG + offset))?;
        if field != offset || width != size {
            return Err(VirtioError::AccessWidth { offset: COMMON_CFG + offset, size });
        }
        match field {
            DEVICE_FEATURE_SELECT => self.regs.select_device_features(value),
            DRIVER_FEATURE_SELECT => self.regs.select_driver_features(value),
            DRIVER_FEATURE => self.regs.set_driver_features(&mut self.device, value)?,
            MSIX_CONFIG | QUEUE_MSIX_VECTOR => {
                if value != VIRTIO_MSI_NO_VECTOR {
                    log::debug!("virtio-pci: MSI-X vector {:#x} ignored", value);
                }
            }
            DEVICE_STATUS => self.regs.write_status(&mut self.device, value)?,
            QUEUE_SELECT => self.regs.select_queue(value),
            QUEUE_SIZE => self.regs.set_queue_num(&self.device, value)?,
            QUEUE_ENABLE => {
                // Queues are disabled through a device reset only
                if value != 0 {
                    self.regs.set_queue_ready(&*io.mem, value)?;
                }
            }
            QUEUE_DESC_LO => self.regs.set_ring_half(Ring::Desc, false, value)?,
            QUEUE_DESC_HI => self.regs.set_ring_half(Ring::Desc, true, value)?,
            QUEUE_DRIVER_LO => self.regs.set_ring_half(Ring::Avail, false, value)?,
            QUEUE_DRIVER_HI => self.regs.set_ring_half(Ring::Avail, true, value)?,
            QUEUE_DEVICE_LO => self.regs.set_ring_half(Ring::Used, false, value)?,
            QUEUE_DEVICE_HI => self.regs.set_ring_half(Ring::Used, true, value)?,
            _ => return Err(VirtioError::ReadOnly(COMMON_CFG + offset)),
        }
        Ok(())
    }
}

fn ring_half(addr: u64, high: bool) -> u32 {
    if high {
        (addr >> 32) as u32
    } else {
        addr as u32
    }
}

impl<D: VirtioDevice> MmioDevice for VirtioPciTransport<D> {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64> {
        let rel = offset % REGION_SIZE;
        let val = match offset / REGION_SIZE {
            0 => self.common_read(rel, size)?,
            1 if rel == 0 => {
                let isr = self.regs.take_interrupt_status();
                log::trace!("virtio-pci: ISR read {:#x}", isr.bits());
                isr.bits() as u64
            }
            2 => self.device.config_read(rel, size)?,
            3 => return Err(VirtioError::WriteOnly(offset).into()),
            _ => return Err(VirtioError::UnknownRegister(offset).into()),
        };
        Ok(val)
    }

    fn write(&mut self, io: &mut IoContext<'_>, offset: u64, value: u64, size: u8) -> Result<()> {
        let rel = offset % REGION_SIZE;
        match offset / REGION_SIZE {
            0 => self.common_write(io, rel, value as u32, size)?,
            1 => return Err(VirtioError::ReadOnly(offset).into()),
            2 => self.device.config_write(rel, value, size)?,
            3 => {
                let queue = rel / NOTIFY_OFF_MULTIPLIER as u64;
                self.regs.notify_queue(&mut self.device, io, queue as u32)?;
            }
            _ => return Err(VirtioError::UnknownRegister(offset).into()),
        }
        Ok(())
    }

    fn base_address(&self) -> u64 {
        self.bar_base
    }

    fn size(&self) -> u64 {
        VIRTIO_PCI_BAR_SIZE
    }

    fn backend_notified(&mut self, io: &mut IoContext<'_>, channel: u32) -> bool {
        if self.device.backend_channel() != Some(channel) {
            return false;
        }
        self.regs.backend_notified(&mut self.device, io);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_field_layout() {
        assert_eq!(common_field(0x04), Some((0x04, 4)));
        assert_eq!(common_field(0x07), Some((0x04, 4)));
        assert_eq!(common_field(0x13), Some((0x12, 2)));
        assert_eq!(common_field(0x14), Some((0x14, 1)));
        assert_eq!(common_field(0x1F), Some((0x1E, 2)));
        assert_eq!(common_field(0x2E), Some((0x2C, 4)));
        assert_eq!(common_field(0x3A), None);
    }

    #[test]
    fn test_class_follows_device_type() {
        assert_eq!(pci_class_of(VIRTIO_ID_BLOCK), 0x0100);
        assert_eq!(pci_class_of(VIRTIO_ID_NET), 0x0200);
        // Console
        assert_eq!(pci_class_of(3), PCI_CLASS_OTHER);
    }

    #[test]
    fn test_ring_half() {
        assert_eq!(ring_half(0x1234_5678_9abc_def0, false), 0x9abc_def0);
        assert_eq!(ring_half(0x1234_5678_9abc_def0, true), 0x1234_5678);
    }
}
