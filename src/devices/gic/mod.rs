//! ARM Generic Interrupt Controller (GIC) emulation
//!
//! This module provides the virtual distributor, the GICv3 redistributors
//! and the list register multiplexing that presents virtual interrupts to
//! the guest through the hypervisor.

pub mod distributor;
pub mod redistributor;
pub mod virq;
mod vgic;

pub use distributor::{DistReg, GicDist};
pub use redistributor::{GicRedist, RedistReg};
pub use vgic::Vgic;
pub use virq::{VirqHandle, NUM_LIST_REGS};

/// Emulated GIC architecture version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    V2,
    V3,
}

impl GicVersion {
    /// Group written into a list register: GICv2 guests take Group 0,
    /// GICv3 guests Group 1.
    pub fn lr_group(self) -> u8 {
        match self {
            GicVersion::V2 => 0,
            GicVersion::V3 => 1,
        }
    }

    /// Size of the distributor register frame
    pub fn dist_size(self) -> u64 {
        match self {
            GicVersion::V2 => 0x1000,
            GicVersion::V3 => 0x1_0000,
        }
    }
}
