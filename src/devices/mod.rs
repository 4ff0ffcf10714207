//! Device Emulation Framework
//!
//! Routes guest accesses to emulated virtio devices via enum dispatch.
//! Devices are registered into a fixed table of up to `MAX_DEVICES` slots;
//! the vGIC is owned by [`crate::vm::Vm`] and reached by devices only
//! through [`InterruptSink`].

pub mod gic;
pub mod virtio;

use crate::error::{DeviceError, Result};
use crate::mm::GuestMemory;
use crate::storage::BlockBackend;
use virtio::blk::VirtioBlk;
use virtio::mmio::VirtioMmioTransport;
use virtio::pci::VirtioPciTransport;

/// Where devices deliver interrupts and backend wakeups.
pub trait InterruptSink {
    /// Raise `virq` on `vcpu`. Returns false if the interrupt was dropped.
    fn inject(&mut self, vcpu: usize, virq: u32) -> bool;

    /// Signal a notification channel.
    fn notify(&mut self, channel: u32);
}

/// Everything a device may touch while handling one access.
pub struct IoContext<'a> {
    /// vCPU that performed the access
    pub vcpu: usize,
    pub mem: &'a mut dyn GuestMemory,
    pub irq: &'a mut dyn InterruptSink,
}

/// Trait for MMIO-accessible devices
///
/// - `read()`/`write()` receive offsets relative to `base_address()`
/// - `size` parameter indicates access width (1, 2, 4, or 8 bytes)
/// - Invalid accesses return an error; the caller decides how to fault
pub trait MmioDevice {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64>;
    fn write(&mut self, io: &mut IoContext<'_>, offset: u64, value: u64, size: u8) -> Result<()>;
    fn base_address(&self) -> u64;
    fn size(&self) -> u64;

    fn contains(&self, addr: u64) -> bool {
        let base = self.base_address();
        addr >= base && addr < base + self.size()
    }

    /// Handle a notification on `channel`. Returns false if the device does
    /// not own the channel.
    fn backend_notified(&mut self, _io: &mut IoContext<'_>, _channel: u32) -> bool {
        false
    }
}

// ── Enum dispatch ──────────────────────────────────────────────────

/// One variant per device class and transport.
/// Adding a new device requires adding a variant here.
pub enum Device<B: BlockBackend> {
    MmioBlk(VirtioMmioTransport<VirtioBlk<B>>),
    PciBlk(VirtioPciTransport<VirtioBlk<B>>),
}

impl<B: BlockBackend> Device<B> {
    /// The block device behind either transport.
    pub fn blk(&self) -> &VirtioBlk<B> {
        match self {
            Device::MmioBlk(d) => d.device(),
            Device::PciBlk(d) => d.device(),
        }
    }

    pub fn blk_mut(&mut self) -> &mut VirtioBlk<B> {
        match self {
            Device::MmioBlk(d) => d.device_mut(),
            Device::PciBlk(d) => d.device_mut(),
        }
    }
}

impl<B: BlockBackend> MmioDevice for Device<B> {
    fn read(&mut self, offset: u64, size: u8) -> Result<u64> {
        match self {
            Device::MmioBlk(d) => d.read(offset, size),
            Device::PciBlk(d) => d.read(offset, size),
        }
    }

    fn write(&mut self, io: &mut IoContext<'_>, offset: u64, value: u64, size: u8) -> Result<()> {
        match self {
            Device::MmioBlk(d) => d.write(io, offset, value, size),
            Device::PciBlk(d) => d.write(io, offset, value, size),
        }
    }

    fn base_address(&self) -> u64 {
        match self {
            Device::MmioBlk(d) => d.base_address(),
            Device::PciBlk(d) => d.base_address(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Device::MmioBlk(d) => d.size(),
            Device::PciBlk(d) => d.size(),
        }
    }

    fn backend_notified(&mut self, io: &mut IoContext<'_>, channel: u32) -> bool {
        match self {
            Device::MmioBlk(d) => d.backend_notified(io, channel),
            Device::PciBlk(d) => d.backend_notified(io, channel),
        }
    }
}

// ── Device Manager ─────────────────────────────────────────────────

pub const MAX_DEVICES: usize = 4;

/// Routes accesses to registered devices by address.
pub struct DeviceManager<B: BlockBackend> {
    devices: [Option<Device<B>>; MAX_DEVICES],
    count: usize,
}

impl<B: BlockBackend> DeviceManager<B> {
    pub fn new() -> Self {
        Self {
            devices: core::array::from_fn(|_| None),
            count: 0,
        }
    }

    /// Register a device. Returns slot index on success.
    pub fn register_device(&mut self, dev: Device<B>) -> Result<usize, DeviceError> {
        if self.count >= MAX_DEVICES {
            return Err(DeviceError::TableFull);
        }
        let (base, size) = (dev.base_address(), dev.size());
        let overlaps = self
            .iter()
            .any(|d| base < d.base_address() + d.size() && d.base_address() < base + size);
        if overlaps {
            return Err(DeviceError::Overlap { base, size });
        }
        let idx = self.count;
        self.devices[idx] = Some(dev);
        self.count += 1;
        Ok(idx)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, idx: usize) -> Option<&Device<B>> {
        self.devices.get(idx)?.as_ref()
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Device<B>> {
        self.devices.get_mut(idx)?.as_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device<B>> {
        self.devices.iter().flatten()
    }

    /// Whether `addr` falls inside a registered device.
    pub fn claims(&self, addr: u64) -> bool {
        self.iter().any(|d| d.contains(addr))
    }

    fn find_mut(&mut self, addr: u64) -> Option<&mut Device<B>> {
        self.devices.iter_mut().flatten().find(|d| d.contains(addr))
    }

    /// Dispatch a read. `None` if no device claims `addr`.
    pub fn handle_read(&mut self, addr: u64, size: u8) -> Option<Result<u64>> {
        let dev = self.find_mut(addr)?;
        let offset = addr - dev.base_address();
        Some(dev.read(offset, size))
    }

    /// Dispatch a write. `None` if no device claims `addr`.
    pub fn handle_write(&mut self, io: &mut IoContext<'_>, addr: u64, value: u64, size: u8) -> Option<Result<()>> {
        let dev = self.find_mut(addr)?;
        let offset = addr - dev.base_address();
        Some(dev.write(io, offset, value, size))
    }

    /// Offer a notification to every device. Returns true if one owned it.
    pub fn backend_notified(&mut self, io: &mut IoContext<'_>, channel: u32) -> bool {
        let mut handled = false;
        for dev in self.devices.iter_mut().flatten() {
            handled |= dev.backend_notified(io, channel);
        }
        handled
    }
}

impl<B: BlockBackend> Default for DeviceManager<B> {
    fn default() -> Self {
        Self::new()
    }
}
