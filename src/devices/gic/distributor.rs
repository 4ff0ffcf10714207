//! Virtual GIC Distributor (GICD) register state
//!
//! Holds the enable/pending/active bitmaps and the other guest-visible
//! distributor registers for GICv2 and GICv3. Word 0 of every per-IRQ
//! array, the first 8 IPRIORITYR/ITARGETSR words and the SGI pending
//! registers are banked per vCPU. Side effects of writes (injection, acks)
//! are driven by [`super::Vgic`]; this type only stores state.

use super::GicVersion;
use crate::platform::MAX_VCPUS;

// ── GICD register offsets ────────────────────────────────────────────
const GICD_CTLR: u64 = 0x000;
const GICD_TYPER: u64 = 0x004;
const GICD_IIDR: u64 = 0x008;
const GICD_IGROUPR_BASE: u64 = 0x080;
const GICD_IGROUPR_END: u64 = 0x0FC;
const GICD_ISENABLER_BASE: u64 = 0x100;
const GICD_ISENABLER_END: u64 = 0x17C;
const GICD_ICENABLER_BASE: u64 = 0x180;
const GICD_ICENABLER_END: u64 = 0x1FC;
const GICD_ISPENDR_BASE: u64 = 0x200;
const GICD_ISPENDR_END: u64 = 0x27C;
const GICD_ICPENDR_BASE: u64 = 0x280;
const GICD_ICPENDR_END: u64 = 0x2FC;
const GICD_ISACTIVER_BASE: u64 = 0x300;
const GICD_ISACTIVER_END: u64 = 0x37C;
const GICD_ICACTIVER_BASE: u64 = 0x380;
const GICD_ICACTIVER_END: u64 = 0x3FC;
const GICD_IPRIORITYR_BASE: u64 = 0x400;
const GICD_IPRIORITYR_END: u64 = 0x7F8;
const GICD_ITARGETSR_BASE: u64 = 0x800;
const GICD_ITARGETSR_END: u64 = 0xBF8;
const GICD_ICFGR_BASE: u64 = 0xC00;
const GICD_ICFGR_END: u64 = 0xCFC;
const GICD_SGIR: u64 = 0xF00;
const GICD_CPENDSGIR_BASE: u64 = 0xF10;
const GICD_CPENDSGIR_END: u64 = 0xF1C;
const GICD_SPENDSGIR_BASE: u64 = 0xF20;
const GICD_SPENDSGIR_END: u64 = 0xF2C;
/// GICv2 identification block (PIDR4..7, PIDR0..3, CIDR0..3)
const GICD_V2_IDENT_BASE: u64 = 0xFC0;
const GICD_V2_IDENT_END: u64 = 0xFFC;
// GICv3 only
const GICD_IROUTER_BASE: u64 = 0x6100;
const GICD_IROUTER_END: u64 = 0x7FDC;
const GICD_V3_IDENT_BASE: u64 = 0xFFC0;
const GICD_V3_IDENT_FIRST: u64 = 0xFFD0;
const GICD_V3_IDENT_END: u64 = 0xFFFC;

const GICD_V2_CTLR_ENABLE: u32 = 1 << 0;
const GICD_V3_CTLR_GRP1_NS: u32 = 1 << 1;
/// EnableGrp0 | EnableGrp1NS | ARE
const GICD_V3_CTLR_MASK: u32 = 0x13;

const NUM_IRQ_WORDS: usize = 32;
const NUM_PRIORITY_WORDS: usize = 255;
const NUM_BANKED_BYTE_WORDS: usize = 8;
const NUM_CFG_WORDS: usize = 64;
const NUM_IDENT_WORDS: usize = 16;
const NUM_SPI_ROUTES: usize = 988;

/// Decoded distributor register, by 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistReg {
    Ctlr,
    Typer,
    Iidr,
    IGroup(usize),
    ISEnable(usize),
    ICEnable(usize),
    ISPend(usize),
    ICPend(usize),
    ISActive(usize),
    ICActive(usize),
    IPriority(usize),
    ITargets(usize),
    ICfg(usize),
    Sgir,
    CPendSgi(usize),
    SPendSgi(usize),
    /// 32-bit half of a GICv3 IROUTER
    IRouter { spi: usize, high: bool },
    Ident(usize),
    /// Reserved or implementation defined: RAZ/WI
    Reserved,
}

fn word(offset: u64, base: u64) -> usize {
    ((offset - base) / 4) as usize
}

impl DistReg {
    /// Decode a distributor offset. Sub-word offsets select their
    /// containing 32-bit register. Returns `None` for offsets outside the
    /// distributor map of `version`.
    pub fn decode(version: GicVersion, offset: u64) -> Option<Self> {
        let offset = offset & !0x3;
        let reg = match offset {
            GICD_CTLR => DistReg::Ctlr,
            GICD_TYPER => DistReg::Typer,
            GICD_IIDR => DistReg::Iidr,
            0x00C..=0x07C => DistReg::Reserved,
            GICD_IGROUPR_BASE..=GICD_IGROUPR_END => DistReg::IGroup(word(offset, GICD_IGROUPR_BASE)),
            GICD_ISENABLER_BASE..=GICD_ISENABLER_END => DistReg::ISEnable(word(offset, GICD_ISENABLER_BASE)),
            GICD_ICENABLER_BASE..=GICD_ICENABLER_END => DistReg::ICEnable(word(offset, GICD_ICENABLER_BASE)),
            GICD_ISPENDR_BASE..=GICD_ISPENDR_END => DistReg::ISPend(word(offset, GICD_ISPENDR_BASE)),
            GICD_ICPENDR_BASE..=GICD_ICPENDR_END => DistReg::ICPend(word(offset, GICD_ICPENDR_BASE)),
            GICD_ISACTIVER_BASE..=GICD_ISACTIVER_END => DistReg::ISActive(word(offset, GICD_ISACTIVER_BASE)),
            GICD_ICACTIVER_BASE..=GICD_ICACTIVER_END => DistReg::ICActive(word(offset, GICD_ICACTIVER_BASE)),
            GICD_IPRIORITYR_BASE..=GICD_IPRIORITYR_END => DistReg::IPriority(word(offset, GICD_IPRIORITYR_BASE)),
            0x7FC => DistReg::Reserved,
            GICD_ITARGETSR_BASE..=GICD_ITARGETSR_END => DistReg::ITargets(word(offset, GICD_ITARGETSR_BASE)),
            0xBFC => DistReg::Reserved,
            GICD_ICFGR_BASE..=GICD_ICFGR_END => DistReg::ICfg(word(offset, GICD_ICFGR_BASE)),
            // PPI/SPI status, reserved, NSACR
            0xD00..=0xEFC => DistReg::Reserved,
            GICD_SGIR => DistReg::Sgir,
            0xF04..=0xF0C => DistReg::Reserved,
            GICD_CPENDSGIR_BASE..=GICD_CPENDSGIR_END => DistReg::CPendSgi(word(offset, GICD_CPENDSGIR_BASE)),
            GICD_SPENDSGIR_BASE..=GICD_SPENDSGIR_END => DistReg::SPendSgi(word(offset, GICD_SPENDSGIR_BASE)),
            0xF30..=0xFBC => DistReg::Reserved,
            GICD_V2_IDENT_BASE..=GICD_V2_IDENT_END => match version {
                GicVersion::V2 => DistReg::Ident(word(offset, GICD_V2_IDENT_BASE)),
                GicVersion::V3 => DistReg::Reserved,
            },
            GICD_IROUTER_BASE..=GICD_IROUTER_END if version == GicVersion::V3 => {
                let byte = offset - GICD_IROUTER_BASE;
                DistReg::IRouter {
                    spi: (byte / 8) as usize,
                    high: byte & 0x4 != 0,
                }
            }
            GICD_V3_IDENT_FIRST..=GICD_V3_IDENT_END if version == GicVersion::V3 => {
                DistReg::Ident(word(offset, GICD_V3_IDENT_BASE))
            }
            0x1000..=0xFFFC if version == GicVersion::V3 => DistReg::Reserved,
            _ => return None,
        };
        Some(reg)
    }
}

fn irq_idx(irq: u32) -> usize {
    (irq / 32) as usize
}

fn irq_bit(irq: u32) -> u32 {
    1 << (irq % 32)
}

/// Masked merge used for registers the guest may freely rewrite.
fn merge(old: u32, data: u32, mask: u32) -> u32 {
    (old & !mask) | (data & mask)
}

/// Per-vCPU banked distributor state
#[derive(Clone, Copy)]
struct Banked {
    group: u32,
    enable: u32,
    pending: u32,
    active: u32,
    active_clr: u32,
    priority: [u32; NUM_BANKED_BYTE_WORDS],
    targets: [u32; NUM_BANKED_BYTE_WORDS],
    sgi_pending: [u32; 4],
}

impl Banked {
    const fn new() -> Self {
        Self {
            group: 0,
            enable: 0,
            pending: 0,
            active: 0,
            active_clr: 0,
            priority: [0; NUM_BANKED_BYTE_WORDS],
            targets: [0; NUM_BANKED_BYTE_WORDS],
            sgi_pending: [0; 4],
        }
    }
}

/// Distributor state for one VM
pub struct GicDist {
    version: GicVersion,
    ctlr: u32,
    typer: u32,
    iidr: u32,
    banked: [Banked; MAX_VCPUS],
    // Shared words; index 0 is unused (banked)
    group: [u32; NUM_IRQ_WORDS],
    enable: [u32; NUM_IRQ_WORDS],
    pending: [u32; NUM_IRQ_WORDS],
    active: [u32; NUM_IRQ_WORDS],
    active_clr: [u32; NUM_IRQ_WORDS],
    priority: [u32; NUM_PRIORITY_WORDS],
    targets: [u32; NUM_PRIORITY_WORDS],
    config: [u32; NUM_CFG_WORDS],
    irouter: [u64; NUM_SPI_ROUTES],
    ident: [u32; NUM_IDENT_WORDS],
    sgi_control: u32,
}

impl GicDist {
    pub fn new(version: GicVersion) -> Self {
        let mut dist = Self::zeroed(version);
        dist.reset();
        dist
    }

    /// Restore architectural reset values.
    pub fn reset(&mut self) {
        *self = Self::zeroed(self.version);

        // SGIs are always enabled
        for bank in self.banked.iter_mut() {
            bank.enable = 0x0000_ffff;
        }
        self.config[0] = 0xaaaa_aaaa;
        // PIDR4 and CIDR0..3 are common to both versions
        self.ident[4] = 0x04;
        self.ident[12] = 0x0d;
        self.ident[13] = 0xf0;
        self.ident[14] = 0x05;
        self.ident[15] = 0xb1;

        match self.version {
            GicVersion::V2 => {
                self.typer = 0x0000_fce7;
                self.iidr = 0x0200_043b;
                self.config[1] = 0x5554_0000;
                for cfg in &mut self.config[2..16] {
                    *cfg = 0x5555_5555;
                }
                for (cpu, bank) in self.banked.iter_mut().enumerate() {
                    let byte = 1u32 << cpu;
                    let word = byte | byte << 8 | byte << 16 | byte << 24;
                    bank.targets = [word; NUM_BANKED_BYTE_WORDS];
                }
                // SPIs go to the first CPU interface
                for t in &mut self.targets[NUM_BANKED_BYTE_WORDS..] {
                    *t = 0x0101_0101;
                }
                self.ident[8] = 0x90;
                self.ident[9] = 0xb4;
                self.ident[10] = 0x2b;
            }
            GicVersion::V3 => {
                self.typer = 0x007B_04B0;
                self.iidr = 0x0001_043B;
                self.ident[4] = 0x44;
                self.ident[8] = 0x92;
                self.ident[9] = 0xB4;
                self.ident[10] = 0x3B;
            }
        }
    }

    fn zeroed(version: GicVersion) -> Self {
        Self {
            version,
            ctlr: 0,
            typer: 0,
            iidr: 0,
            banked: [Banked::new(); MAX_VCPUS],
            group: [0; NUM_IRQ_WORDS],
            enable: [0; NUM_IRQ_WORDS],
            pending: [0; NUM_IRQ_WORDS],
            active: [0; NUM_IRQ_WORDS],
            active_clr: [0; NUM_IRQ_WORDS],
            priority: [0; NUM_PRIORITY_WORDS],
            targets: [0; NUM_PRIORITY_WORDS],
            config: [0; NUM_CFG_WORDS],
            irouter: [0; NUM_SPI_ROUTES],
            ident: [0; NUM_IDENT_WORDS],
            sgi_control: 0,
        }
    }

    pub fn version(&self) -> GicVersion {
        self.version
    }

    pub fn is_enabled(&self) -> bool {
        match self.version {
            GicVersion::V2 => self.ctlr & GICD_V2_CTLR_ENABLE != 0,
            GicVersion::V3 => self.ctlr & GICD_V3_CTLR_GRP1_NS != 0,
        }
    }

    /// Emulate a GICD_CTLR write. Returns false for an encoding the
    /// distributor does not understand; the register is then unchanged.
    ///
    /// GICv2 only accepts 1 (enable) and 0 (disable). GICv3 keeps the
    /// group enables and ARE; Group 1 decides whether the distributor
    /// forwards interrupts.
    pub fn write_ctlr(&mut self, data: u32) -> bool {
        match self.version {
            GicVersion::V2 => match data {
                0 | 1 => self.ctlr = data,
                _ => return false,
            },
            GicVersion::V3 => self.ctlr = data & GICD_V3_CTLR_MASK,
        }
        log::debug!("vgic: distributor {}", if self.is_enabled() { "enabled" } else { "disabled" });
        true
    }

    pub fn is_pending(&self, vcpu: usize, irq: u32) -> bool {
        if irq_idx(irq) == 0 {
            self.banked[vcpu].pending & irq_bit(irq) != 0
        } else {
            self.pending[irq_idx(irq)] & irq_bit(irq) != 0
        }
    }

    pub fn set_pending(&mut self, vcpu: usize, irq: u32, pending: bool) {
        let word = if irq_idx(irq) == 0 {
            &mut self.banked[vcpu].pending
        } else {
            &mut self.pending[irq_idx(irq)]
        };
        if pending {
            *word |= irq_bit(irq);
        } else {
            *word &= !irq_bit(irq);
        }
    }

    pub fn is_irq_enabled(&self, vcpu: usize, irq: u32) -> bool {
        if irq_idx(irq) == 0 {
            self.banked[vcpu].enable & irq_bit(irq) != 0
        } else {
            self.enable[irq_idx(irq)] & irq_bit(irq) != 0
        }
    }

    pub fn set_irq_enabled(&mut self, vcpu: usize, irq: u32, enabled: bool) {
        let word = if irq_idx(irq) == 0 {
            &mut self.banked[vcpu].enable
        } else {
            &mut self.enable[irq_idx(irq)]
        };
        if enabled {
            *word |= irq_bit(irq);
        } else {
            *word &= !irq_bit(irq);
        }
    }

    pub fn is_active(&self, vcpu: usize, irq: u32) -> bool {
        if irq_idx(irq) == 0 {
            self.banked[vcpu].active & irq_bit(irq) != 0
        } else {
            self.active[irq_idx(irq)] & irq_bit(irq) != 0
        }
    }

    /// Current value of a 32-bit register as seen from `vcpu`.
    pub fn read(&self, vcpu: usize, reg: DistReg) -> u32 {
        let bank = &self.banked[vcpu];
        match reg {
            DistReg::Ctlr => self.ctlr,
            DistReg::Typer => self.typer,
            DistReg::Iidr => self.iidr,
            DistReg::IGroup(0) => bank.group,
            DistReg::IGroup(n) => self.group[n],
            DistReg::ISEnable(0) | DistReg::ICEnable(0) => bank.enable,
            DistReg::ISEnable(n) | DistReg::ICEnable(n) => self.enable[n],
            DistReg::ISPend(0) | DistReg::ICPend(0) => bank.pending,
            DistReg::ISPend(n) | DistReg::ICPend(n) => self.pending[n],
            DistReg::ISActive(0) => bank.active,
            DistReg::ISActive(n) => self.active[n],
            DistReg::ICActive(0) => bank.active_clr,
            DistReg::ICActive(n) => self.active_clr[n],
            DistReg::IPriority(n) if n < NUM_BANKED_BYTE_WORDS => bank.priority[n],
            DistReg::IPriority(n) => self.priority[n],
            DistReg::ITargets(n) if n < NUM_BANKED_BYTE_WORDS => bank.targets[n],
            DistReg::ITargets(n) => self.targets[n],
            DistReg::ICfg(n) => self.config[n],
            DistReg::Sgir => self.sgi_control,
            DistReg::CPendSgi(n) | DistReg::SPendSgi(n) => bank.sgi_pending[n],
            DistReg::IRouter { spi, high } => match self.irouter.get(spi) {
                Some(route) if high => (*route >> 32) as u32,
                Some(route) => *route as u32,
                None => 0,
            },
            DistReg::Ident(n) => self.ident[n],
            DistReg::Reserved => 0,
        }
    }

    /// Masked store into a register that holds guest-written state
    /// verbatim. Returns false if `reg` is not such a register.
    pub fn store(&mut self, vcpu: usize, reg: DistReg, data: u32, mask: u32) -> bool {
        let bank = &mut self.banked[vcpu];
        let slot = match reg {
            DistReg::IGroup(0) => &mut bank.group,
            DistReg::IGroup(n) => &mut self.group[n],
            DistReg::ISActive(0) => &mut bank.active,
            DistReg::ISActive(n) => &mut self.active[n],
            DistReg::ICActive(0) => &mut bank.active_clr,
            DistReg::ICActive(n) => &mut self.active_clr[n],
            DistReg::IRouter { spi, high } => {
                let Some(route) = self.irouter.get_mut(spi) else {
                    return true;
                };
                let shift = if high { 32 } else { 0 };
                let half = merge((*route >> shift) as u32, data, mask);
                *route = (*route & !(0xFFFF_FFFFu64 << shift)) | ((half as u64) << shift);
                return true;
            }
            _ => return false,
        };
        *slot = merge(*slot, data, mask);
        true
    }

    /// SPI routing target (Aff0) programmed through IROUTER.
    pub fn route_spi(&self, irq: u32) -> usize {
        if irq < 32 || irq >= 1020 {
            return 0;
        }
        (self.irouter[(irq - 32) as usize] & 0xFF) as usize
    }
}
