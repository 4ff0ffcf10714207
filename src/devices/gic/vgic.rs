//! Virtual GIC: interrupt state and list register multiplexing.
//!
//! Per virq the controller walks through these states (on a given vCPU for
//! SGIs/PPIs, globally for SPIs):
//!
//! ```text
//! disabled -> enabled -> pending (queued) -> presented (in an LR) -> EOI
//!                ^                                                   |
//!                +---------------------------------------------------+
//! ```
//!
//! Enabling an idle virq acks its source so the next physical interrupt can
//! arrive. Injection marks the virq pending, queues it and, when a list
//! register is free, moves the queue head into that LR. A maintenance
//! report from the hypervisor frees the LR, clears pending, acks the source
//! and refills the LR from the queue.
//!
//! A virq that the guest disables while it sits in a list register is not
//! recalled; it reaches the guest once and later injections fail until the
//! guest enables it again.

use super::distributor::{DistReg, GicDist};
use super::redistributor::{GicRedist, RedistReg};
use super::virq::{self, IrqQueue, SpiSlots, VirqHandle, MAX_VIRQ, NUM_LIST_REGS, NUM_LOCAL_VIRQS, NUM_SGI_VIRQS};
use super::GicVersion;
use crate::devices::InterruptSink;
use crate::error::VgicError;
use crate::platform::MAX_VCPUS;
use crate::vcpu_interrupt::{AckFn, Hypervisor};

/// Priority written into every list register
const LR_PRIORITY: u8 = 0;

// ── ICC_SGI1R_EL1 fields ─────────────────────────────────────────────
const ICC_SGI1R_IRM_BIT: u64 = 40;
const ICC_SGI1R_INTID_SHIFT: u64 = 24;
const ICC_SGI1R_INTID_MASK: u64 = 0xf;
const ICC_SGI1R_TARGET_LIST_MASK: u64 = 0xffff;

// ── GICD_SGIR fields ─────────────────────────────────────────────────
const SGIR_FILTER_SHIFT: u32 = 24;
const SGIR_TARGETS_SHIFT: u32 = 16;
const SGIR_INTID_MASK: u32 = 0xf;
const SGIR_FILTER_LIST: u32 = 0;
const SGIR_FILTER_OTHERS: u32 = 1;
const SGIR_FILTER_SELF: u32 = 2;

/// vCPU specific interrupt context
struct VgicVcpu<H> {
    /// Mirrors the hypervisor's list registers for this vCPU
    lr_shadow: [Option<VirqHandle<H>>; NUM_LIST_REGS],
    /// IRQs that don't fit in the list registers
    queue: IrqQueue,
    /// SGIs and PPIs
    local: [Option<VirqHandle<H>>; NUM_LOCAL_VIRQS as usize],
}

impl<H> VgicVcpu<H> {
    fn new() -> Self {
        Self {
            lr_shadow: [None; NUM_LIST_REGS],
            queue: IrqQueue::new(),
            local: [None; NUM_LOCAL_VIRQS as usize],
        }
    }

    fn free_list_reg(&self) -> Option<usize> {
        self.lr_shadow.iter().position(Option::is_none)
    }

    fn presented(&self, virq: u32) -> bool {
        self.lr_shadow.iter().flatten().any(|h| h.virq == virq)
    }
}

/// Bits of `data` as interrupt IDs of register word `word`.
fn set_bits(word: usize, mut data: u32) -> impl Iterator<Item = u32> {
    core::iter::from_fn(move || {
        if data == 0 {
            return None;
        }
        let bit = data.trailing_zeros();
        data &= data - 1;
        Some(word as u32 * 32 + bit)
    })
}

fn width_mask(size: u8) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

/// Bit position of a naturally aligned 1/2/4-byte access inside its word.
fn sub_word_shift(offset: u64, size: u8) -> Result<u32, VgicError> {
    match size {
        1 | 2 | 4 if offset % size as u64 == 0 => Ok(((offset & 0x3) * 8) as u32),
        _ => Err(VgicError::AccessWidth { offset, size }),
    }
}

fn sgi_frame_view(reg: RedistReg) -> DistReg {
    match reg {
        RedistReg::IGroup0 => DistReg::IGroup(0),
        RedistReg::ISEnable0 => DistReg::ISEnable(0),
        RedistReg::ICEnable0 => DistReg::ICEnable(0),
        RedistReg::ISPend0 => DistReg::ISPend(0),
        RedistReg::ICPend0 => DistReg::ICPend(0),
        RedistReg::ISActive0 => DistReg::ISActive(0),
        RedistReg::ICActive0 => DistReg::ICActive(0),
        RedistReg::IPriority(n) => DistReg::IPriority(n),
        RedistReg::ICfg0 => DistReg::ICfg(0),
        RedistReg::ICfg1 => DistReg::ICfg(1),
        _ => DistReg::Reserved,
    }
}

/// Virtual GIC owning the hypervisor interface it injects through.
pub struct Vgic<H: Hypervisor> {
    hv: H,
    version: GicVersion,
    num_vcpus: usize,
    dist: GicDist,
    redist: GicRedist,
    spis: SpiSlots<H>,
    vcpus: [VgicVcpu<H>; MAX_VCPUS],
}

impl<H: Hypervisor> Vgic<H> {
    /// # Panics
    /// Panics if `num_vcpus` is zero or exceeds `MAX_VCPUS`.
    pub fn new(hv: H, version: GicVersion, num_vcpus: usize) -> Self {
        assert!(num_vcpus > 0 && num_vcpus <= MAX_VCPUS, "unsupported vCPU count");
        Self {
            hv,
            version,
            num_vcpus,
            dist: GicDist::new(version),
            redist: GicRedist::new(num_vcpus),
            spis: SpiSlots::new(),
            vcpus: core::array::from_fn(|_| VgicVcpu::new()),
        }
    }

    pub fn version(&self) -> GicVersion {
        self.version
    }

    pub fn num_vcpus(&self) -> usize {
        self.num_vcpus
    }

    pub fn hypervisor(&self) -> &H {
        &self.hv
    }

    pub fn hypervisor_mut(&mut self) -> &mut H {
        &mut self.hv
    }

    /// Size of the GICv3 redistributor region
    pub fn redist_size(&self) -> u64 {
        self.redist.size()
    }

    fn check_vcpu(&self, vcpu: usize) -> Result<(), VgicError> {
        if vcpu >= self.num_vcpus {
            return Err(VgicError::InvalidVcpu(vcpu));
        }
        Ok(())
    }

    fn handle(&self, vcpu: usize, virq: u32) -> Option<VirqHandle<H>> {
        if virq::is_local(virq) {
            self.vcpus[vcpu].local[virq as usize]
        } else {
            self.spis.get(virq).copied()
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Wire `virq` to an ack callback. SGIs/PPIs are registered per vCPU;
    /// SPIs share one table across vCPUs.
    pub fn register(&mut self, vcpu: usize, virq: u32, ack: AckFn<H>, cookie: usize) -> Result<(), VgicError> {
        self.check_vcpu(vcpu)?;
        if virq >= MAX_VIRQ {
            return Err(VgicError::InvalidVirq(virq));
        }
        let handle = VirqHandle::new(virq, ack, cookie);
        if virq::is_local(virq) {
            let slot = &mut self.vcpus[vcpu].local[virq as usize];
            if slot.is_some() {
                return Err(VgicError::AlreadyRegistered { vcpu, virq });
            }
            *slot = Some(handle);
        } else {
            self.spis.alloc(handle).map_err(|e| match e {
                VgicError::AlreadyRegistered { virq, .. } => VgicError::AlreadyRegistered { vcpu, virq },
                other => other,
            })?;
        }
        log::debug!("vgic: registered virq {} on vCPU {}", virq, vcpu);
        Ok(())
    }

    /// Drop the handle for `virq`. Any queued (not yet presented) instance
    /// is discarded with it.
    pub fn unregister(&mut self, vcpu: usize, virq: u32) -> Result<(), VgicError> {
        self.check_vcpu(vcpu)?;
        let removed = if virq::is_local(virq) {
            self.vcpus[vcpu].local.get_mut(virq as usize).and_then(Option::take)
        } else {
            self.spis.free(virq)
        };
        if removed.is_none() {
            return Err(VgicError::NotRegistered(virq));
        }
        if self.vcpus[vcpu].queue.remove(virq) {
            self.dist.set_pending(vcpu, virq, false);
        }
        Ok(())
    }

    // ── Injection ───────────────────────────────────────────────────

    /// Make `virq` pending on `vcpu` and present it if a list register is
    /// free.
    ///
    /// Fails without changing state when the virq has no handle, the
    /// distributor is disabled or the virq is disabled. Injecting a virq that
    /// is already pending succeeds and changes nothing.
    pub fn try_inject(&mut self, vcpu: usize, virq: u32) -> Result<(), VgicError> {
        self.check_vcpu(vcpu)?;
        if virq >= MAX_VIRQ {
            return Err(VgicError::InvalidVirq(virq));
        }
        if self.handle(vcpu, virq).is_none() {
            return Err(VgicError::NotRegistered(virq));
        }
        if !self.dist.is_enabled() {
            return Err(VgicError::DistributorDisabled);
        }
        if !self.dist.is_irq_enabled(vcpu, virq) {
            return Err(VgicError::VirqDisabled(virq));
        }
        if self.dist.is_pending(vcpu, virq) {
            return Ok(());
        }

        self.dist.set_pending(vcpu, virq, true);
        let vcpu_state = &self.vcpus[vcpu];
        if vcpu_state.presented(virq) || vcpu_state.queue.contains(virq) {
            // Still on its way to the guest from an earlier injection
            log::debug!("vgic: vCPU {} virq {} already in flight, pending again", vcpu, virq);
            return Ok(());
        }
        self.enqueue(vcpu, virq);
        self.load_pending(vcpu);
        Ok(())
    }

    /// [`Self::try_inject`] for callers that only need to know whether the
    /// virq was accepted.
    pub fn inject(&mut self, vcpu: usize, virq: u32) -> bool {
        match self.try_inject(vcpu, virq) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("vgic: vCPU {} virq {} not injected: {}", vcpu, virq, e);
                false
            }
        }
    }

    /// First step of injection: append to the overflow queue.
    ///
    /// # Panics
    /// Panics if the queue is full; more virqs are in flight than the
    /// controller was provisioned for.
    fn enqueue(&mut self, vcpu: usize, virq: u32) {
        if !self.vcpus[vcpu].queue.enqueue(virq) {
            panic!("vgic: IRQ queue overflow on vCPU {}, increase MAX_IRQ_QUEUE_LEN", vcpu);
        }
    }

    /// Second step of injection: move the queue head into a free list
    /// register. Returns true if a list register was loaded.
    fn load_pending(&mut self, vcpu: usize) -> bool {
        let Some(idx) = self.vcpus[vcpu].free_list_reg() else {
            log::trace!("vgic: no free list register on vCPU {}", vcpu);
            return false;
        };
        let Some(virq) = self.vcpus[vcpu].queue.dequeue() else {
            return false;
        };
        self.load_list_reg(vcpu, idx, virq);
        true
    }

    fn load_list_reg(&mut self, vcpu: usize, idx: usize, virq: u32) {
        let Some(handle) = self.handle(vcpu, virq) else {
            panic!("vgic: queued virq {} on vCPU {} has no handle", virq, vcpu);
        };
        let group = self.version.lr_group();
        if !self.hv.inject_irq(vcpu, virq, LR_PRIORITY, group, idx) {
            panic!("vgic: hypervisor rejected virq {} in LR {} of vCPU {}", virq, idx, vcpu);
        }
        log::trace!("vgic: vCPU {} LR {} <- virq {}", vcpu, idx, virq);
        self.vcpus[vcpu].lr_shadow[idx] = Some(handle);
    }

    /// The guest is done with the virq in list register `idx`.
    ///
    /// # Panics
    /// Panics if `idx` is out of range or the shadow slot is empty; the
    /// shadow no longer matches the hardware.
    pub fn maintenance(&mut self, vcpu: usize, idx: usize) -> Result<(), VgicError> {
        self.check_vcpu(vcpu)?;
        assert!(idx < NUM_LIST_REGS, "vgic: maintenance for LR {} out of range", idx);
        let Some(handle) = self.vcpus[vcpu].lr_shadow[idx].take() else {
            panic!("vgic: maintenance for empty LR {} on vCPU {}", idx, vcpu);
        };
        log::trace!("vgic: maintenance vCPU {} LR {} virq {}", vcpu, idx, handle.virq);

        self.dist.set_pending(vcpu, handle.virq, false);
        handle.ack(&mut self.hv, vcpu);

        if let Some(next) = self.vcpus[vcpu].queue.dequeue() {
            self.load_list_reg(vcpu, idx, next);
        }
        Ok(())
    }

    // ── Per-IRQ distributor operations ──────────────────────────────

    fn enable_irq(&mut self, vcpu: usize, irq: u32) {
        log::trace!("vgic: enable irq {} on vCPU {}", irq, vcpu);
        self.dist.set_irq_enabled(vcpu, irq, true);
        match self.handle(vcpu, irq) {
            Some(handle) => {
                if !self.dist.is_pending(vcpu, irq) {
                    handle.ack(&mut self.hv, vcpu);
                }
            }
            None => log::trace!("vgic: enabled irq {} has no handle", irq),
        }
    }

    fn disable_irq(&mut self, vcpu: usize, irq: u32) {
        // SGIs cannot be disabled; guests try during init, so stay quiet.
        if irq >= NUM_SGI_VIRQS {
            log::trace!("vgic: disable irq {} on vCPU {}", irq, vcpu);
            self.dist.set_irq_enabled(vcpu, irq, false);
        }
    }

    /// Clear pending and drop the virq from the queue. A virq already in a
    /// list register stays there.
    fn clear_pending_irq(&mut self, vcpu: usize, irq: u32) {
        log::trace!("vgic: clear pending irq {} on vCPU {}", irq, vcpu);
        self.dist.set_pending(vcpu, irq, false);
        self.vcpus[vcpu].queue.remove(irq);
    }

    fn forward_sgi(&mut self, targets: u32, virq: u32) {
        for target in 0..self.num_vcpus {
            if targets & (1 << target) != 0 && !self.inject(target, virq) {
                log::debug!("vgic: SGI {} not delivered to vCPU {}", virq, target);
            }
        }
    }

    fn sgir_write(&mut self, vcpu: usize, data: u32) {
        let virq = data & SGIR_INTID_MASK;
        let all = (1u32 << self.num_vcpus) - 1;
        let targets = match (data >> SGIR_FILTER_SHIFT) & 0x3 {
            SGIR_FILTER_LIST => (data >> SGIR_TARGETS_SHIFT) & 0xff,
            SGIR_FILTER_OTHERS => all & !(1 << vcpu),
            SGIR_FILTER_SELF => 1 << vcpu,
            _ => {
                log::error!("vgic: unknown SGIR target list filter in {:#x}", data);
                return;
            }
        };
        self.forward_sgi(targets, virq);
    }

    /// Emulate a guest write to the GICv3 ICC_SGI1R_EL1 system register.
    pub fn icc_sgi1r_write(&mut self, vcpu: usize, value: u64) -> Result<(), VgicError> {
        self.check_vcpu(vcpu)?;
        let virq = ((value >> ICC_SGI1R_INTID_SHIFT) & ICC_SGI1R_INTID_MASK) as u32;
        let all = (1u32 << self.num_vcpus) - 1;
        let targets = if (value >> ICC_SGI1R_IRM_BIT) & 1 != 0 {
            all & !(1 << vcpu)
        } else {
            (value & ICC_SGI1R_TARGET_LIST_MASK) as u32 & all
        };
        self.forward_sgi(targets, virq);
        Ok(())
    }

    // ── Distributor MMIO ────────────────────────────────────────────

    pub fn dist_read(&self, vcpu: usize, offset: u64, size: u8) -> Result<u64, VgicError> {
        self.check_vcpu(vcpu)?;
        let reg = DistReg::decode(self.version, offset).ok_or(VgicError::UnknownRegister(offset))?;
        if size == 8 {
            return match reg {
                DistReg::IRouter { spi, high: false } if offset % 8 == 0 => {
                    let lo = self.dist.read(vcpu, reg) as u64;
                    let hi = self.dist.read(vcpu, DistReg::IRouter { spi, high: true }) as u64;
                    Ok(lo | hi << 32)
                }
                _ => Err(VgicError::AccessWidth { offset, size }),
            };
        }
        let shift = sub_word_shift(offset, size)?;
        Ok(((self.dist.read(vcpu, reg) >> shift) & width_mask(size)) as u64)
    }

    pub fn dist_write(&mut self, vcpu: usize, offset: u64, value: u64, size: u8) -> Result<(), VgicError> {
        self.check_vcpu(vcpu)?;
        let reg = DistReg::decode(self.version, offset).ok_or(VgicError::UnknownRegister(offset))?;
        if size == 8 {
            return match reg {
                DistReg::IRouter { spi, high: false } if offset % 8 == 0 => {
                    self.dist.store(vcpu, reg, value as u32, u32::MAX);
                    self.dist.store(vcpu, DistReg::IRouter { spi, high: true }, (value >> 32) as u32, u32::MAX);
                    Ok(())
                }
                _ => Err(VgicError::AccessWidth { offset, size }),
            };
        }
        let shift = sub_word_shift(offset, size)?;
        let mask = width_mask(size) << shift;
        let data = ((value as u32) << shift) & mask;

        match reg {
            DistReg::Ctlr => {
                if !self.dist.write_ctlr(data) {
                    log::error!("vgic: unknown GICD_CTLR encoding {:#x}", data);
                }
            }
            DistReg::ISEnable(n) => {
                for irq in set_bits(n, data) {
                    self.enable_irq(vcpu, irq);
                }
            }
            DistReg::ICEnable(n) => {
                for irq in set_bits(n, data) {
                    self.disable_irq(vcpu, irq);
                }
            }
            DistReg::ISPend(n) => {
                for irq in set_bits(n, data) {
                    self.inject(vcpu, irq);
                }
            }
            DistReg::ICPend(n) => {
                for irq in set_bits(n, data) {
                    self.clear_pending_irq(vcpu, irq);
                }
            }
            DistReg::IGroup(_) | DistReg::ISActive(_) | DistReg::ICActive(_) | DistReg::IRouter { .. } => {
                self.dist.store(vcpu, reg, data, mask);
            }
            DistReg::Sgir => self.sgir_write(vcpu, data),
            DistReg::CPendSgi(_) | DistReg::SPendSgi(_) => {
                log::debug!("vgic: ignoring SGI pending register write at {:#x}", offset);
            }
            // Read-only, unsupported or reserved: write ignored
            DistReg::Typer
            | DistReg::Iidr
            | DistReg::IPriority(_)
            | DistReg::ITargets(_)
            | DistReg::ICfg(_)
            | DistReg::Ident(_)
            | DistReg::Reserved => {}
        }
        Ok(())
    }

    // ── Redistributor MMIO (GICv3) ──────────────────────────────────

    fn redist_decode(&self, offset: u64) -> Result<(usize, u64, RedistReg), VgicError> {
        if self.version != GicVersion::V3 {
            return Err(VgicError::UnknownRegister(offset));
        }
        let (vcpu, frame_off) = self.redist.decode_offset(offset).ok_or(VgicError::UnknownRegister(offset))?;
        let reg = RedistReg::decode(frame_off).ok_or(VgicError::UnknownRegister(offset))?;
        Ok((vcpu, frame_off, reg))
    }

    /// Read from the redistributor region; `offset` selects the vCPU frame.
    pub fn redist_read(&self, offset: u64, size: u8) -> Result<u64, VgicError> {
        let (vcpu, frame_off, reg) = self.redist_decode(offset)?;
        if size == 8 {
            return match reg {
                RedistReg::TyperLo => Ok(self.redist.typer_value(vcpu)),
                _ => Err(VgicError::AccessWidth { offset, size }),
            };
        }
        let shift = sub_word_shift(frame_off, size)?;
        let word = match self.redist.read_rd(vcpu, reg) {
            Some(word) => word,
            None => self.dist.read(vcpu, sgi_frame_view(reg)),
        };
        Ok(((word >> shift) & width_mask(size)) as u64)
    }

    pub fn redist_write(&mut self, offset: u64, value: u64, size: u8) -> Result<(), VgicError> {
        let (vcpu, frame_off, reg) = self.redist_decode(offset)?;
        let shift = sub_word_shift(frame_off, size)?;
        let mask = width_mask(size) << shift;
        let data = ((value as u32) << shift) & mask;

        if reg.is_rd_frame() {
            let old = self.redist.read_rd(vcpu, reg).unwrap_or(0);
            self.redist.write_rd(vcpu, reg, (old & !mask) | data);
            return Ok(());
        }
        match reg {
            RedistReg::ISEnable0 => {
                for irq in set_bits(0, data) {
                    self.enable_irq(vcpu, irq);
                }
            }
            RedistReg::ICEnable0 => {
                for irq in set_bits(0, data) {
                    self.disable_irq(vcpu, irq);
                }
            }
            RedistReg::ISPend0 => {
                for irq in set_bits(0, data) {
                    self.inject(vcpu, irq);
                }
            }
            RedistReg::ICPend0 => {
                for irq in set_bits(0, data) {
                    self.clear_pending_irq(vcpu, irq);
                }
            }
            RedistReg::IGroup0 | RedistReg::ISActive0 | RedistReg::ICActive0 => {
                self.dist.store(vcpu, sgi_frame_view(reg), data, mask);
            }
            _ => {}
        }
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn dist_enabled(&self) -> bool {
        self.dist.is_enabled()
    }

    pub fn is_pending(&self, vcpu: usize, virq: u32) -> bool {
        vcpu < self.num_vcpus && virq < MAX_VIRQ && self.dist.is_pending(vcpu, virq)
    }

    pub fn is_enabled(&self, vcpu: usize, virq: u32) -> bool {
        vcpu < self.num_vcpus && virq < MAX_VIRQ && self.dist.is_irq_enabled(vcpu, virq)
    }

    pub fn is_active(&self, vcpu: usize, virq: u32) -> bool {
        vcpu < self.num_vcpus && virq < MAX_VIRQ && self.dist.is_active(vcpu, virq)
    }

    /// The virq loaded in list register `idx`, if any.
    pub fn list_register(&self, vcpu: usize, idx: usize) -> Option<u32> {
        self.vcpus.get(vcpu)?.lr_shadow.get(idx)?.map(|h| h.virq)
    }

    /// Virqs waiting for a list register, oldest first. Empty for an
    /// unknown vCPU.
    pub fn queued(&self, vcpu: usize) -> impl Iterator<Item = u32> + '_ {
        self.vcpus.get(vcpu).into_iter().flat_map(|v| v.queue.iter())
    }

    pub fn route_spi(&self, virq: u32) -> usize {
        self.dist.route_spi(virq)
    }
}

impl<H: Hypervisor> InterruptSink for Vgic<H> {
    fn inject(&mut self, vcpu: usize, virq: u32) -> bool {
        Vgic::inject(self, vcpu, virq)
    }

    fn notify(&mut self, channel: u32) {
        self.hv.notify(channel);
    }
}
