//! Virtual GIC Redistributor (GICR) frames
//!
//! Emulates GICv3 redistributors for all vCPUs. Each vCPU has a 128KB region:
//!   - RD frame   (0x00000..0x0FFFF): CTLR, IIDR, TYPER, WAKER, identification
//!   - SGI frame  (0x10000..0x1FFFF): IGROUPR0, I[SC]ENABLER0, IPRIORITYR, etc.
//!
//! SGI frame registers are views of the banked distributor state; only the
//! RD frame registers live here.

use crate::platform::MAX_VCPUS;

/// Size per redistributor (RD + SGI frames)
pub const GICR_PER_CPU: u64 = 0x20000;

// ── RD frame register offsets ────────────────────────────────────────
const GICR_CTLR: u64 = 0x0000;
const GICR_IIDR: u64 = 0x0004;
const GICR_TYPER: u64 = 0x0008;
const GICR_TYPER_HI: u64 = 0x000C;
const GICR_STATUSR: u64 = 0x0010;
const GICR_WAKER: u64 = 0x0014;
const GICR_IDENT_BASE: u64 = 0xFFC0;
const GICR_IDENT_FIRST: u64 = 0xFFD0;
const GICR_IDENT_END: u64 = 0xFFFC;

// ── SGI frame register offsets (relative to RD base) ─────────────────
const GICR_IGROUPR0: u64 = 0x1_0080;
const GICR_ISENABLER0: u64 = 0x1_0100;
const GICR_ICENABLER0: u64 = 0x1_0180;
const GICR_ISPENDR0: u64 = 0x1_0200;
const GICR_ICPENDR0: u64 = 0x1_0280;
const GICR_ISACTIVER0: u64 = 0x1_0300;
const GICR_ICACTIVER0: u64 = 0x1_0380;
const GICR_IPRIORITYR_BASE: u64 = 0x1_0400;
const GICR_IPRIORITYR_END: u64 = 0x1_041C;
const GICR_ICFGR0: u64 = 0x1_0C00;
const GICR_ICFGR1: u64 = 0x1_0C04;

const GICR_IIDR_VALUE: u32 = 0x0001_143B;
/// PIDR4..7, PIDR0..3, CIDR0..3
const GICR_IDENT: [u32; 12] = [
    0x44, 0, 0, 0, //
    0x93, 0xB4, 0x3B, 0, //
    0x0D, 0xF0, 0x05, 0xB1,
];

const WAKER_PROCESSOR_SLEEP: u32 = 1 << 1;
const WAKER_CHILDREN_ASLEEP: u32 = 1 << 2;

/// Decoded redistributor register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedistReg {
    Ctlr,
    Iidr,
    TyperLo,
    TyperHi,
    Statusr,
    Waker,
    Ident(usize),
    IGroup0,
    ISEnable0,
    ICEnable0,
    ISPend0,
    ICPend0,
    ISActive0,
    ICActive0,
    IPriority(usize),
    ICfg0,
    ICfg1,
}

impl RedistReg {
    /// Decode an offset within one vCPU's 128KB region.
    pub fn decode(frame_off: u64) -> Option<Self> {
        let off = frame_off & !0x3;
        let reg = match off {
            GICR_CTLR => RedistReg::Ctlr,
            GICR_IIDR => RedistReg::Iidr,
            GICR_TYPER => RedistReg::TyperLo,
            GICR_TYPER_HI => RedistReg::TyperHi,
            GICR_STATUSR => RedistReg::Statusr,
            GICR_WAKER => RedistReg::Waker,
            GICR_IDENT_FIRST..=GICR_IDENT_END => RedistReg::Ident(((off - GICR_IDENT_BASE) / 4) as usize),
            GICR_IGROUPR0 => RedistReg::IGroup0,
            GICR_ISENABLER0 => RedistReg::ISEnable0,
            GICR_ICENABLER0 => RedistReg::ICEnable0,
            GICR_ISPENDR0 => RedistReg::ISPend0,
            GICR_ICPENDR0 => RedistReg::ICPend0,
            GICR_ISACTIVER0 => RedistReg::ISActive0,
            GICR_ICACTIVER0 => RedistReg::ICActive0,
            GICR_IPRIORITYR_BASE..=GICR_IPRIORITYR_END => {
                RedistReg::IPriority(((off - GICR_IPRIORITYR_BASE) / 4) as usize)
            }
            GICR_ICFGR0 => RedistReg::ICfg0,
            GICR_ICFGR1 => RedistReg::ICfg1,
            _ => return None,
        };
        Some(reg)
    }

    /// Whether the register lives in the RD frame (not backed by the
    /// distributor).
    pub fn is_rd_frame(self) -> bool {
        matches!(
            self,
            RedistReg::Ctlr
                | RedistReg::Iidr
                | RedistReg::TyperLo
                | RedistReg::TyperHi
                | RedistReg::Statusr
                | RedistReg::Waker
                | RedistReg::Ident(_)
        )
    }
}

/// Per-vCPU RD frame state
#[derive(Copy, Clone)]
struct GicrState {
    ctlr: u32,
    waker: u32,
}

impl GicrState {
    const fn new() -> Self {
        Self {
            ctlr: 0,
            // ProcessorSleep=1, ChildrenAsleep=1 at reset
            waker: WAKER_PROCESSOR_SLEEP | WAKER_CHILDREN_ASLEEP,
        }
    }
}

/// RD frames of all vCPUs
pub struct GicRedist {
    state: [GicrState; MAX_VCPUS],
    num_vcpus: usize,
}

impl GicRedist {
    /// # Panics
    /// Panics if `num_vcpus > MAX_VCPUS`.
    pub fn new(num_vcpus: usize) -> Self {
        assert!(num_vcpus <= MAX_VCPUS, "num_vcpus exceeds MAX_VCPUS");
        Self {
            state: [GicrState::new(); MAX_VCPUS],
            num_vcpus,
        }
    }

    /// Total size of the redistributor region
    pub fn size(&self) -> u64 {
        GICR_PER_CPU * self.num_vcpus as u64
    }

    /// Split a region offset into (vcpu_id, offset within its frame).
    pub fn decode_offset(&self, offset: u64) -> Option<(usize, u64)> {
        let vcpu_id = (offset / GICR_PER_CPU) as usize;
        if vcpu_id >= self.num_vcpus {
            return None;
        }
        Some((vcpu_id, offset % GICR_PER_CPU))
    }

    /// GICR_TYPER layout:
    ///   [63:32] Affinity_Value (Aff0 at [39:32])
    ///   [23:8]  Processor_Number
    ///   [4]     Last
    ///   [0]     PLPIS
    pub fn typer_value(&self, vcpu_id: usize) -> u64 {
        let aff0 = (vcpu_id as u64) << 32;
        let proc_num = (vcpu_id as u64) << 8;
        let last = if vcpu_id == self.num_vcpus - 1 { 1u64 << 4 } else { 0 };
        aff0 | proc_num | last | 0x1
    }

    /// Read an RD frame register; `None` for SGI frame registers.
    pub fn read_rd(&self, vcpu_id: usize, reg: RedistReg) -> Option<u32> {
        let st = &self.state[vcpu_id];
        let val = match reg {
            RedistReg::Ctlr => st.ctlr,
            RedistReg::Iidr => GICR_IIDR_VALUE,
            RedistReg::TyperLo => self.typer_value(vcpu_id) as u32,
            RedistReg::TyperHi => (self.typer_value(vcpu_id) >> 32) as u32,
            RedistReg::Statusr => 0,
            RedistReg::Waker => st.waker,
            RedistReg::Ident(n) => GICR_IDENT.get(n.wrapping_sub(4)).copied().unwrap_or(0),
            _ => return None,
        };
        Some(val)
    }

    /// Write an RD frame register. Returns false for SGI frame registers.
    pub fn write_rd(&mut self, vcpu_id: usize, reg: RedistReg, value: u32) -> bool {
        let st = &mut self.state[vcpu_id];
        match reg {
            RedistReg::Ctlr => st.ctlr = value,
            RedistReg::Waker => {
                // ChildrenAsleep follows ProcessorSleep
                st.waker = if value & WAKER_PROCESSOR_SLEEP == 0 {
                    0
                } else {
                    WAKER_PROCESSOR_SLEEP | WAKER_CHILDREN_ASLEEP
                };
            }
            RedistReg::Iidr | RedistReg::TyperLo | RedistReg::TyperHi | RedistReg::Statusr | RedistReg::Ident(_) => {}
            _ => return false,
        }
        true
    }
}
