//! Device and interrupt emulation core of a VMM running on a capability
//! microkernel.
//!
//! The crate emulates a GICv2/GICv3 interrupt controller on top of the
//! hypervisor's list registers, the virtio-mmio and virtio-pci transports,
//! and a virtio block device backed by an asynchronous storage service.
//! Instruction decoding, guest loading and PCI configuration space belong
//! to the embedding VMM, which feeds trapped accesses into [`vm::Vm`].

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod devices;
pub mod error;
pub mod mm;
pub mod platform;
pub mod storage;
pub mod vcpu_interrupt;
pub mod vm;

pub use error::{Error, Result};
