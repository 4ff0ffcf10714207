//! Virtio-MMIO transport (version 2 register layout, no legacy mode).
//!
//! Decodes the virtio-mmio register window at a given base address and
//! forwards to the shared [`VirtioRegs`] core and the device class.

use super::queue::Ring;
use super::{TransportKind, VirtioDevice, VirtioRegs};
use crate::devices::{IoContext, MmioDevice};
use crate::error::{Result, VirtioError};

// ── Virtio-MMIO register offsets ────────────────────────────────────
const MAGIC_VALUE: u64 = 0x000;
const VERSION: u64 = 0x004;
const DEVICE_ID: u64 = 0x008;
const VENDOR_ID: u64 = 0x00C;
const DEVICE_FEATURES: u64 = 0x010;
const DEVICE_FEATURES_SEL: u64 = 0x014;
const DRIVER_FEATURES: u64 = 0x020;
const DRIVER_FEATURES_SEL: u64 = 0x024;
const QUEUE_SEL: u64 = 0x030;
const QUEUE_NUM_MAX: u64 = 0x034;
const QUEUE_NUM: u64 = 0x038;
const QUEUE_READY: u64 = 0x044;
const QUEUE_NOTIFY: u64 = 0x050;
const INTERRUPT_STATUS: u64 = 0x060;
const INTERRUPT_ACK: u64 = 0x064;
const STATUS: u64 = 0x070;
const QUEUE_DESC_LOW: u64 = 0x080;
const QUEUE_DESC_HIGH: u64 = 0x084;
const QUEUE_DRIVER_LOW: u64 = 0x090;
const QUEUE_DRIVER_HIGH: u64 = 0x094;
const QUEUE_DEVICE_LOW: u64 = 0x0A0;
const QUEUE_DEVICE_HIGH: u64 = 0x0A4;
const CONFIG_GENERATION: u64 = 0x0FC;
const CONFIG_SPACE: u64 = 0x100;

/// Size of the register window
pub const VIRTIO_MMIO_WINDOW: u64 = 0x200;

// ── Magic and version ───────────────────────────────────────────────
const VIRTIO_MMIO_MAGIC: u32 = 0x74726976; // "virt"
const VIRTIO_MMIO_VERSION: u32 = 2; // Modern (non-legacy)
/// Vendor ID reported to the guest
pub const VIRTIO_VENDOR_ID: u32 = 0x344c6573; // "seL4"

/// Virtio-MMIO transport wrapping a device backend.
pub struct VirtioMmioTransport<D: VirtioDevice> {
    /// MMIO base address
    base: u64,
    regs: VirtioRegs,
    device: D,
}

impl<D: VirtioDevice> VirtioMmioTransport<D> {
    pub fn new(base: u64, device: D, virq: u32, vcpu: usize) -> Self {
        let regs = VirtioRegs::new(TransportKind::Mmio, device.num_queues(), virq, vcpu);
        Self { base, regs, device }
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

    fn read_register(&mut self, offset: u64) -> Result<u32, VirtioError> {
        let val = match offset {
            MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            VERSION => VIRTIO_MMIO_VERSION,
            DEVICE_ID => self.device.device_id(),
            VENDOR_ID => VIRTIO_VENDOR_ID,
            DEVICE_FEATURES => self.regs.device_features(&self.device)?,
            QUEUE_NUM_MAX => self.regs.queue_num_max(&self.device),
            QUEUE_READY => self.regs.current_queue()?.ready() as u32,
            INTERRUPT_STATUS => self.regs.interrupt_status().bits(),
            STATUS => self.regs.status().bits(),
            CONFIG_GENERATION => self.regs.config_generation(),

            DEVICE_FEATURES_SEL | DRIVER_FEATURES | DRIVER_FEATURES_SEL | QUEUE_SEL | QUEUE_NUM | QUEUE_NOTIFY
            | INTERRUPT_ACK | QUEUE_DESC_LOW | QUEUE_DESC_HIGH | QUEUE_DRIVER_LOW | QUEUE_DRIVER_HIGH
            | QUEUE_DEVICE_LOW | QUEUE_DEVICE_HIGH => return Err(VirtioError::WriteOnly(offset)),
            _ => return Err(VirtioError::UnknownRegister(offset)),
        };
        Ok(val)
    }

    fn write_register(&mut self, io: &mut IoContext<'_>, offset: u64, val: u32) -> Result<(), VirtioError> {
        match offset {
            DEVICE_FEATURES_SEL => self.regs.select_device_features(val),
            DRIVER_FEATURES => self.regs.set_driver_features(&mut self.device, val)?,
            DRIVER_FEATURES_SEL => self.regs.select_driver_features(val),
            QUEUE_SEL => self.regs.select_queue(val),
            QUEUE_NUM => self.regs.set_queue_num(&self.device, val)?,
            QUEUE_READY => self.regs.set_queue_ready(&*io.mem, val)?,
            QUEUE_NOTIFY => self.regs.notify_queue(&mut self.device, io, val)?,
            INTERRUPT_ACK => self.regs.ack_interrupt(val),
            STATUS => self.regs.write_status(&mut self.device, val)?,
            QUEUE_DESC_LOW => self.regs.set_ring_half(Ring::Desc, false, val)?,
            QUEUE_DESC_HIGH => self.regs.set_ring_half(Ring::Desc, true, val)?,
            QUEUE_DRIVER_LOW => self.regs.set_ring_half(Ring::Avail, false, val)?,
            QUEUE_DRIVER_HIGH => self.regs.set_ring_half(Ring::Avail, true, val)?,
            QUEUE_DEVICE_LOW => self.regs.set_ring_half(Ring::Used, false, val)?,
            QUEUE_DEVICE_HIGH => self.regs.set_ring_half(Ring::Used, true, val)?,

            MAGIC_VALUE | VERSION | DEVICE_ID | VENDOR_ID | DEVICE_FEATURES | QUEUE_NUM_MAX | INTERRUPT_STATUS
            | CONFIG_GENERATION => return Err(VirtioError::ReadOnly(offset)),
            _ => return Err(VirtioError::UnknownRegister(offset)),
        }
        Ok(())
    }
}

impl<D: VirtioDevice> MmioDevice for VirtioMmioTransport<D> {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64> {
        // Config space is byte addressable
        if offset >= CONFIG_SPACE {
            return Ok(self.device.config_read(offset - CONFIG_SPACE, size)?);
        }
        // All other registers are 32-bit
        if size != 4 {
            return Err(VirtioError::AccessWidth { offset, size }.into());
        }
        let val = self.read_register(offset)?;
        log::trace!("virtio-mmio: read {:#x} = {:#x}", offset, val);
        Ok(val as u64)
    }

    fn write(&mut self, io: &mut IoContext<'_>, offset: u64, value: u64, size: u8) -> Result<()> {
        if offset >= CONFIG_SPACE {
            return Ok(self.device.config_write(offset - CONFIG_SPACE, value, size)?);
        }
        if size != 4 {
            return Err(VirtioError::AccessWidth { offset, size }.into());
        }
        log::trace!("virtio-mmio: write {:#x} = {:#x}", offset, value);
        Ok(self.write_register(io, offset, value as u32)?)
    }

    fn base_address(&self) -> u64 {
        self.base
    }

    fn size(&self) -> u64 {
        VIRTIO_MMIO_WINDOW
    }

    fn backend_notified(&mut self, io: &mut IoContext<'_>, channel: u32) -> bool {
        if self.device.backend_channel() != Some(channel) {
            return false;
        }
        self.regs.backend_notified(&mut self.device, io);
        true
    }
}
