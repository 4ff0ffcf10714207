//! Platform/Board Constants (QEMU virt machine)
//!
//! All board-specific addresses and sizes live here so they can be
//! changed in one place when targeting a different platform.

use crate::devices::gic::GicVersion;

/// Compile-time vCPU capacity of the vGIC
pub const MAX_VCPUS: usize = 8;
pub const DEFAULT_NUM_VCPUS: usize = 1;

// ── GIC ──────────────────────────────────────────────────────────────
pub const GICD_BASE: u64 = 0x0800_0000;
pub const GICD_SIZE: u64 = 0x1_0000;
/// GICv3 redistributors, one 128KB frame per vCPU
pub const GICR_BASE: u64 = 0x080A_0000;
pub const GICR_FRAME_SIZE: u64 = 0x2_0000;

#[cfg(feature = "gic_v3")]
pub const DEFAULT_GIC_VERSION: GicVersion = GicVersion::V3;
#[cfg(not(feature = "gic_v3"))]
pub const DEFAULT_GIC_VERSION: GicVersion = GicVersion::V2;

// ── Virtio ───────────────────────────────────────────────────────────
/// First virtio-mmio slot
pub const VIRTIO_MMIO_BASE: u64 = 0x0a00_0000;
pub const VIRTIO_MMIO_SIZE: u64 = 0x200;
/// BAR0 of the first virtio-pci function
pub const VIRTIO_PCI_BAR_BASE: u64 = 0x1000_0000;
/// Block device SPI: SPI 16 = INTID 48
pub const VIRTIO_BLK_VIRQ: u32 = 48;

// ── Storage backend ──────────────────────────────────────────────────
pub const BLK_BACKEND_CHANNEL: u32 = 3;
/// Guest-visible sector size
pub const SECTOR_SIZE: u32 = 512;
/// Backend transfer window
pub const BLK_TRANSFER_SIZE: u32 = 4096;

pub const PAGE_SIZE: u64 = 0x1000;
