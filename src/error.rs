//! Error types for the emulation core.
//!
//! Guest protocol violations and resource exhaustion surface as these
//! errors; the fault boundary in [`crate::vm::Vm`] logs them and turns them
//! into "ignored access" results. Internal invariant violations panic
//! instead.

use thiserror::Error;

/// Guest-physical or backend data region access outside the mapped window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("address {addr:#x} (+{len:#x}) is outside the mapped region")]
    OutOfRange { addr: u64, len: u64 },
}

/// Malformed virtqueue state published by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue is not ready")]
    NotReady,
    #[error("descriptor index {index} out of range for queue size {size}")]
    DescriptorIndex { index: u16, size: u16 },
    #[error("descriptor chain starting at {head} is longer than the queue")]
    ChainTooLong { head: u16 },
    #[error("indirect descriptors are not supported (head {head})")]
    Indirect { head: u16 },
    #[error("available index {avail_idx} is {pending} entries ahead of the device")]
    AvailOverrun { avail_idx: u16, pending: u16 },
    #[error("access of {len} bytes at chain offset {offset} exceeds the chain")]
    ChainBounds { offset: u64, len: u64 },
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// vGIC registration and injection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VgicError {
    #[error("vCPU {0} does not exist")]
    InvalidVcpu(usize),
    #[error("virq {0} is out of range")]
    InvalidVirq(u32),
    #[error("virq {virq} already registered on vCPU {vcpu}")]
    AlreadyRegistered { vcpu: usize, virq: u32 },
    #[error("no free SPI slot for virq {0}")]
    SpiSlotsExhausted(u32),
    #[error("virq {0} has no handle")]
    NotRegistered(u32),
    #[error("distributor is disabled")]
    DistributorDisabled,
    #[error("virq {0} is disabled")]
    VirqDisabled(u32),
    #[error("unknown register offset {0:#x}")]
    UnknownRegister(u64),
    #[error("invalid access width {size} at offset {offset:#x}")]
    AccessWidth { offset: u64, size: u8 },
    #[error("list register {0} is out of range or empty")]
    ListRegister(usize),
}

/// Virtio register interface violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VirtioError {
    #[error("unknown register offset {0:#x}")]
    UnknownRegister(u64),
    #[error("invalid access width {size} at offset {offset:#x}")]
    AccessWidth { offset: u64, size: u8 },
    #[error("invalid queue index {0}")]
    InvalidQueue(u32),
    #[error("queue size {requested} not supported (device requires {required})")]
    QueueSize { requested: u32, required: u16 },
    #[error("invalid feature selector {0}")]
    FeatureSelector(u32),
    #[error("driver features {features:#x} (window {sel}) are not offered")]
    UnsupportedFeatures { sel: u32, features: u32 },
    #[error("unknown device status transition {0:#x}")]
    UnknownStatus(u32),
    #[error("register at offset {0:#x} is read-only")]
    ReadOnly(u64),
    #[error("register at offset {0:#x} is write-only")]
    WriteOnly(u64),
    #[error("rings of queue {0} are outside guest memory")]
    RingOutOfRange(u16),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Storage backend queue failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("backend request queue is full")]
    QueueFull,
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Invalid static configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("vCPU count {0} is not supported")]
    VcpuCount(usize),
    #[error("base address {0:#x} is not page aligned")]
    Misaligned(u64),
    #[error("virq {0} is not a shared peripheral interrupt")]
    Virq(u32),
    #[error("transfer window {window} is not a multiple of sector size {sector}")]
    Geometry { window: u32, sector: u32 },
}

/// Device table management failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device table is full")]
    TableFull,
    #[error("region {base:#x} (+{size:#x}) overlaps an existing device")]
    Overlap { base: u64, size: u64 },
}

/// Crate-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("memory: {0}")]
    Memory(#[from] MemoryError),
    #[error("virtqueue: {0}")]
    Queue(#[from] QueueError),
    #[error("vgic: {0}")]
    Vgic(#[from] VgicError),
    #[error("virtio: {0}")]
    Virtio(#[from] VirtioError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("device: {0}")]
    Device(#[from] DeviceError),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
