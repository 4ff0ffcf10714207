//! Virtual Machine Management
//!
//! This module provides the [`Vm`] type which owns everything the VMM
//! emulates for one guest: the vGIC (and through it the hypervisor
//! interface), guest memory and the virtio devices.
//!
//! The entry points are the fault boundary. Errors from the emulation
//! core are logged here and turned into "ignored access" results; the
//! caller only learns whether the access was emulated.

use crate::config::{BlkDeviceConfig, Transport, VmConfig};
use crate::devices::gic::{GicVersion, Vgic};
use crate::devices::virtio::blk::VirtioBlk;
use crate::devices::virtio::mmio::VirtioMmioTransport;
use crate::devices::virtio::pci::VirtioPciTransport;
use crate::devices::{Device, DeviceManager, IoContext, MmioDevice};
use crate::error::{ConfigError, DeviceError, Error, Result, VgicError, VirtioError};
use crate::mm::GuestMemory;
use crate::storage::BlockBackend;
use crate::vcpu_interrupt::{default_ack, AckFn, Hypervisor};

/// Virtual Machine
pub struct Vm<H: Hypervisor, M: GuestMemory, B: BlockBackend> {
    config: VmConfig,
    vgic: Vgic<H>,
    /// Guest RAM as seen by the VMM
    mem: M,
    devices: DeviceManager<B>,
}

impl<H: Hypervisor, M: GuestMemory, B: BlockBackend> Vm<H, M, B> {
    /// Create a new VM
    pub fn new(config: VmConfig, hv: H, mem: M) -> Result<Self, ConfigError> {
        config.validate()?;
        log::info!(
            "vm: {} vCPU(s), {:?} distributor at {:#x}",
            config.num_vcpus,
            config.gic_version,
            config.gicd_base
        );
        Ok(Self {
            config,
            vgic: Vgic::new(hv, config.gic_version, config.num_vcpus),
            mem,
            devices: DeviceManager::new(),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn vgic(&self) -> &Vgic<H> {
        &self.vgic
    }

    pub fn vgic_mut(&mut self) -> &mut Vgic<H> {
        &mut self.vgic
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.mem
    }

    pub fn devices(&self) -> &DeviceManager<B> {
        &self.devices
    }

    /// Block device in slot `idx`.
    pub fn blk(&self, idx: usize) -> Option<&VirtioBlk<B>> {
        self.devices.get(idx).map(Device::blk)
    }

    pub fn blk_mut(&mut self, idx: usize) -> Option<&mut VirtioBlk<B>> {
        self.devices.get_mut(idx).map(Device::blk_mut)
    }

    fn gicd_offset(&self, addr: u64) -> Option<u64> {
        let size = self.config.gic_version.dist_size();
        addr.checked_sub(self.config.gicd_base).filter(|off| *off < size)
    }

    fn gicr_offset(&self, addr: u64) -> Option<u64> {
        if self.config.gic_version != GicVersion::V3 {
            return None;
        }
        let size = self.vgic.redist_size();
        addr.checked_sub(self.config.gicr_base).filter(|off| *off < size)
    }

    fn check_vcpu(&self, vcpu: usize) -> bool {
        if vcpu >= self.config.num_vcpus {
            log::warn!("vm: access from unknown vCPU {}", vcpu);
            return false;
        }
        true
    }

    // ── Guest accesses ──────────────────────────────────────────────

    /// Emulate a guest read of `size` bytes at `addr`. `None` means the
    /// access faulted and was ignored.
    pub fn mmio_read(&mut self, vcpu: usize, addr: u64, size: u8) -> Option<u64> {
        if !self.check_vcpu(vcpu) {
            return None;
        }
        let result = if let Some(off) = self.gicd_offset(addr) {
            self.vgic.dist_read(vcpu, off, size).map_err(Error::from)
        } else if let Some(off) = self.gicr_offset(addr) {
            self.vgic.redist_read(off, size).map_err(Error::from)
        } else {
            match self.devices.handle_read(addr, size) {
                Some(result) => result,
                None => {
                    log::error!("vm: vCPU {} read of {} bytes at unmapped {:#x}", vcpu, size, addr);
                    return None;
                }
            }
        };
        match result {
            Ok(value) => {
                log::trace!("vm: read {:#x} = {:#x}", addr, value);
                Some(value)
            }
            Err(e) => {
                report("read", addr, &e);
                None
            }
        }
    }

    /// Emulate a guest write. Returns false if the write was rejected.
    pub fn mmio_write(&mut self, vcpu: usize, addr: u64, value: u64, size: u8) -> bool {
        if !self.check_vcpu(vcpu) {
            return false;
        }
        let result = if let Some(off) = self.gicd_offset(addr) {
            self.vgic.dist_write(vcpu, off, value, size).map_err(Error::from)
        } else if let Some(off) = self.gicr_offset(addr) {
            self.vgic.redist_write(off, value, size).map_err(Error::from)
        } else {
            let mut io = IoContext {
                vcpu,
                mem: &mut self.mem,
                irq: &mut self.vgic,
            };
            match self.devices.handle_write(&mut io, addr, value, size) {
                Some(result) => result,
                None => {
                    log::error!("vm: vCPU {} write of {} bytes at unmapped {:#x}", vcpu, size, addr);
                    return false;
                }
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                report("write", addr, &e);
                false
            }
        }
    }

    /// ICC_SGI1R_EL1 write trapped from a GICv3 guest.
    pub fn sgi_write(&mut self, vcpu: usize, value: u64) -> bool {
        match self.vgic.icc_sgi1r_write(vcpu, value) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("vm: ICC_SGI1R write {:#x} from vCPU {}: {}", value, vcpu, e);
                false
            }
        }
    }

    // ── Interrupts and notifications ────────────────────────────────

    /// The guest finished with the virq in list register `lr`.
    pub fn vgic_maintenance(&mut self, vcpu: usize, lr: usize) -> bool {
        match self.vgic.maintenance(vcpu, lr) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("vm: maintenance on vCPU {} LR {}: {}", vcpu, lr, e);
                false
            }
        }
    }

    /// A backend signalled `channel`. Returns false if no device owns it.
    pub fn handle_notification(&mut self, channel: u32) -> bool {
        let mut io = IoContext {
            vcpu: 0,
            mem: &mut self.mem,
            irq: &mut self.vgic,
        };
        let handled = self.devices.backend_notified(&mut io, channel);
        if !handled {
            log::debug!("vm: notification on unowned channel {}", channel);
        }
        handled
    }

    pub fn inject_irq(&mut self, vcpu: usize, virq: u32) -> bool {
        self.vgic.inject(vcpu, virq)
    }

    pub fn register_irq(&mut self, vcpu: usize, virq: u32, ack: AckFn<H>, cookie: usize) -> Result<(), VgicError> {
        self.vgic.register(vcpu, virq, ack, cookie)
    }

    // ── Devices ─────────────────────────────────────────────────────

    /// Attach a virtio-blk device. Returns its device slot.
    pub fn attach_virtio_blk(&mut self, config: BlkDeviceConfig, backend: B) -> Result<usize> {
        config.validate(&self.config)?;
        let blk = VirtioBlk::new(backend, config.backend_channel)?;
        let dev = match config.transport {
            Transport::Mmio { base } => Device::MmioBlk(VirtioMmioTransport::new(base, blk, config.virq, config.vcpu)),
            Transport::Pci { bar_base } => {
                Device::PciBlk(VirtioPciTransport::new(bar_base, blk, config.virq, config.vcpu))
            }
        };
        let (base, size) = (dev.base_address(), dev.size());
        if self.gicd_offset(base).is_some()
            || self.gicr_offset(base).is_some()
            || self.gicd_offset(base + size - 1).is_some()
            || self.gicr_offset(base + size - 1).is_some()
        {
            return Err(DeviceError::Overlap { base, size }.into());
        }

        self.vgic.register(config.vcpu, config.virq, default_ack::<H>, 0)?;
        match self.devices.register_device(dev) {
            Ok(idx) => {
                log::info!(
                    "vm: virtio-blk {} at {:#x} ({:?}), virq {} on vCPU {}",
                    idx,
                    base,
                    config.transport,
                    config.virq,
                    config.vcpu
                );
                Ok(idx)
            }
            Err(e) => {
                if let Err(e) = self.vgic.unregister(config.vcpu, config.virq) {
                    log::warn!("vm: cannot release virq {}: {}", config.virq, e);
                }
                Err(e.into())
            }
        }
    }
}

fn report(kind: &str, addr: u64, err: &Error) {
    match err {
        Error::Vgic(VgicError::UnknownRegister(_)) | Error::Virtio(VirtioError::UnknownRegister(_)) => {
            log::error!("vm: {} at {:#x}: {}", kind, addr, err)
        }
        _ => log::warn!("vm: {} at {:#x}: {}", kind, addr, err),
    }
}
