//! Virtio-PCI transport tests
//!
//! BAR layout, common cfg field decoding, ISR read-to-clear semantics and
//! interrupt coalescing.

mod common;

use common::*;
use proptest::prelude::*;
use vmm_core::devices::virtio::pci::PciCapType;
use vmm_core::devices::Device;
use vmm_core::platform::{VIRTIO_BLK_VIRQ, VIRTIO_PCI_BAR_BASE};

const BAR: u64 = VIRTIO_PCI_BAR_BASE;
const ISR: u64 = BAR + 0x1000;

fn fresh() -> (TestVm, Driver) {
    (vm_with_blk(pci(), MemBackend::new(16, 8)), Driver::new(pci()))
}

#[test]
fn test_capabilities_and_identity() {
    let (vm, _) = fresh();
    let Some(Device::PciBlk(transport)) = vm.devices().get(0) else {
        panic!("expected a PCI block device");
    };
    let caps = transport.capabilities();
    let layout: Vec<(PciCapType, u32)> = caps.iter().map(|c| (c.cfg_type, c.offset)).collect();
    assert_eq!(
        layout,
        vec![
            (PciCapType::Common, 0x0000),
            (PciCapType::Isr, 0x1000),
            (PciCapType::Device, 0x2000),
            (PciCapType::Notify, 0x3000),
        ]
    );
    assert_eq!(caps[3].notify_off_multiplier, Some(2));
    assert!(caps[..3].iter().all(|c| c.notify_off_multiplier.is_none()));

    let id = transport.identity();
    assert_eq!((id.vendor_id, id.device_id), (0x1AF4, 0x1042));
    assert_eq!((id.class_code, id.subclass), (0x01, 0x00));
    assert_eq!((id.subsystem_vendor_id, id.subsystem_id), (0x6573, 2));
    assert_eq!(id.revision, 1);
}

#[test]
fn test_common_cfg_field_access() {
    let (mut vm, _) = fresh();
    // num_queues, also readable byte-wise
    assert_eq!(vm.mmio_read(0, BAR + 0x12, 2), Some(1));
    assert_eq!(vm.mmio_read(0, BAR + 0x12, 1), Some(1));
    assert_eq!(vm.mmio_read(0, BAR + 0x13, 1), Some(0));
    // No MSI-X
    assert_eq!(vm.mmio_read(0, BAR + 0x10, 2), Some(0xFFFF));
    // Access spilling into the next field
    assert_eq!(vm.mmio_read(0, BAR + 0x10, 4), None);
    // Writes must cover exactly one field
    assert!(!vm.mmio_write(0, BAR + 0x16, 0, 4));
    assert!(!vm.mmio_write(0, BAR + 0x05, 0, 1));
    // Read-only fields
    assert!(!vm.mmio_write(0, BAR + 0x12, 4, 2));
    assert_eq!(vm.mmio_read(0, BAR + 0x18, 2), Some(128));
    assert!(!vm.mmio_write(0, BAR + 0x18, 256, 2));
    // Notify region is write-only
    assert_eq!(vm.mmio_read(0, BAR + 0x3000, 2), None);
}

#[test]
fn test_ring_addresses_read_back() {
    let (mut vm, mut driver) = fresh();
    driver.init(&mut vm);
    assert_eq!(vm.mmio_read(0, BAR + 0x20, 4), Some(DESC_TABLE & 0xFFFF_FFFF));
    assert_eq!(vm.mmio_read(0, BAR + 0x24, 4), Some(DESC_TABLE >> 32));
    assert_eq!(vm.mmio_read(0, BAR + 0x28, 4), Some(AVAIL_RING & 0xFFFF_FFFF));
    assert_eq!(vm.mmio_read(0, BAR + 0x30, 4), Some(USED_RING & 0xFFFF_FFFF));
    assert_eq!(vm.mmio_read(0, BAR + 0x1C, 2), Some(1));
    assert_eq!(vm.mmio_read(0, BAR + 0x1E, 2), Some(0));
    // Driver features read back through the selector
    assert!(vm.mmio_write(0, BAR + 0x08, 1, 4));
    assert_eq!(vm.mmio_read(0, BAR + 0x0C, 4), Some(1));
}

#[test]
fn test_block_io_over_pci() {
    let (mut vm, mut driver) = fresh();
    driver.init(&mut vm);
    let data = [0x3Cu8; TRANSFER];
    let write = driver.submit(&mut vm, VIRTIO_BLK_T_OUT, 16, Body::Out(&data));
    complete_backend(&mut vm);
    assert_eq!(driver.status_of(&vm, &write), 0);

    let read = driver.submit(&mut vm, VIRTIO_BLK_T_IN, 16, Body::In(TRANSFER));
    complete_backend(&mut vm);
    assert_eq!(driver.body_of(&vm, &read), data.to_vec());
}

#[test]
fn test_isr_read_clears() {
    let (mut vm, mut driver) = fresh();
    driver.init(&mut vm);
    driver.submit(&mut vm, VIRTIO_BLK_T_GET_ID, 0, Body::In(20));

    assert_eq!(vm.mmio_read(0, ISR, 1), Some(1));
    assert_eq!(vm.mmio_read(0, ISR, 1), Some(0));
    assert!(!vm.mmio_write(0, ISR, 0, 1));
}

#[test]
fn test_interrupt_coalesced_until_isr_read() {
    let (mut vm, mut driver) = fresh();
    driver.init(&mut vm);

    driver.submit(&mut vm, VIRTIO_BLK_T_GET_ID, 0, Body::In(20));
    assert_eq!(vm.vgic().hypervisor().loads_of(VIRTIO_BLK_VIRQ), 1);
    assert!(vm.vgic_maintenance(0, 0));

    // The guest has not read the ISR yet: no second interrupt
    driver.submit(&mut vm, VIRTIO_BLK_T_GET_ID, 0, Body::In(20));
    assert_eq!(vm.vgic().hypervisor().loads_of(VIRTIO_BLK_VIRQ), 1);

    assert_eq!(vm.mmio_read(0, ISR, 1), Some(1));
    driver.submit(&mut vm, VIRTIO_BLK_T_GET_ID, 0, Body::In(20));
    assert_eq!(vm.vgic().hypervisor().loads_of(VIRTIO_BLK_VIRQ), 2);
    assert_eq!(driver.take_used(&mut vm).len(), 3);
}

#[test]
fn test_notify_before_ready_is_ignored() {
    let (mut vm, driver) = fresh();
    assert!(driver.kick(&mut vm));
    // Doorbell of a queue that does not exist
    assert!(!vm.mmio_write(0, BAR + 0x3002, 0, 2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Feature writes through the common cfg obey the subset rule, and the
    /// accepted value reads back.
    #[test]
    fn prop_feature_subset(sel in 0u32..2, features in any::<u32>()) {
        let (mut vm, driver) = fresh();
        let offered = if sel == 0 { BLK_FEATURES_LO } else { 1 };
        let accepted = driver.write_features(&mut vm, sel, features);
        prop_assert_eq!(accepted, features & !offered == 0);
        let readback = vm.mmio_read(0, BAR + 0x0C, 4).unwrap() as u32;
        prop_assert_eq!(readback, if accepted { features } else { 0 });
    }
}
