//! Virtual GIC tests through the VM entry points
//!
//! Guest distributor accesses, injection from the VMM side and list
//! register maintenance as reported by the hypervisor.

mod common;

use common::*;
use proptest::prelude::*;
use vmm_core::config::VmConfig;
use vmm_core::devices::gic::{GicVersion, NUM_LIST_REGS};
use vmm_core::platform::{GICD_BASE, GICR_BASE, GICR_FRAME_SIZE};
use vmm_core::vcpu_interrupt::{default_ack, passthrough_ack};
use vmm_core::vm::Vm;

const PASSTHROUGH_VIRQ: u32 = 40;
const PASSTHROUGH_CHANNEL: usize = 7;

fn v3_vm() -> TestVm {
    init_logger();
    let config = VmConfig {
        gic_version: GicVersion::V3,
        ..vm_config()
    };
    let mut vm = Vm::new(config, RecordingHv::default(), GuestRam::new(RAM_BASE, RAM_SIZE)).unwrap();
    // EnableGrp1A | ARE_NS
    assert!(vm.mmio_write(0, GICD_BASE, 0x12, 4));
    vm
}

#[test]
fn test_passthrough_irq_lifecycle() {
    let mut vm = new_vm();
    vm.register_irq(0, PASSTHROUGH_VIRQ, passthrough_ack, PASSTHROUGH_CHANNEL).unwrap();

    // Not enabled yet
    assert!(!vm.inject_irq(0, PASSTHROUGH_VIRQ));

    // Enabling an idle source re-arms it
    enable_virq(&mut vm, PASSTHROUGH_VIRQ);
    assert_eq!(vm.vgic().hypervisor().acked, vec![PASSTHROUGH_CHANNEL as u32]);

    assert!(vm.inject_irq(0, PASSTHROUGH_VIRQ));
    assert_eq!(vm.vgic().hypervisor().loads, vec![(0, PASSTHROUGH_VIRQ, 0, 0)]);
    assert_eq!(vm.vgic().list_register(0, 0), Some(PASSTHROUGH_VIRQ));

    // Already pending: nothing new reaches the hypervisor
    assert!(vm.inject_irq(0, PASSTHROUGH_VIRQ));
    assert_eq!(vm.vgic().hypervisor().loads.len(), 1);

    // Pending shows up in GICD_ISPENDR1
    assert_eq!(vm.mmio_read(0, GICD_BASE + 0x204, 4), Some(1 << 8));

    assert!(vm.vgic_maintenance(0, 0));
    assert_eq!(vm.vgic().list_register(0, 0), None);
    assert!(!vm.vgic().is_pending(0, PASSTHROUGH_VIRQ));
    assert_eq!(vm.vgic().hypervisor().acked, vec![7, 7]);

    assert!(vm.inject_irq(0, PASSTHROUGH_VIRQ));
    assert_eq!(vm.vgic().hypervisor().loads.len(), 2);
}

#[test]
fn test_list_register_overflow() {
    let mut vm = new_vm();
    let virqs: Vec<u32> = (64..64 + NUM_LIST_REGS as u32 + 2).collect();
    for &virq in &virqs {
        vm.register_irq(1, virq, default_ack, 0).unwrap();
        assert!(vm.mmio_write(1, GICD_BASE, 1, 4));
        assert!(vm.mmio_write(1, GICD_BASE + 0x108, 1 << (virq % 32), 4));
    }
    for &virq in &virqs {
        assert!(vm.inject_irq(1, virq));
    }
    let loaded: Vec<Option<u32>> = (0..NUM_LIST_REGS).map(|lr| vm.vgic().list_register(1, lr)).collect();
    assert_eq!(loaded, vec![Some(64), Some(65), Some(66), Some(67)]);
    assert_eq!(vm.vgic().queued(1).collect::<Vec<_>>(), vec![68, 69]);

    assert!(vm.vgic_maintenance(1, 1));
    assert_eq!(vm.vgic().list_register(1, 1), Some(68));
    assert!(vm.vgic_maintenance(1, 3));
    assert_eq!(vm.vgic().list_register(1, 3), Some(69));
    assert_eq!(vm.vgic().queued(1).count(), 0);
    // Everything went to vCPU 1
    assert!(vm.vgic().hypervisor().loads.iter().all(|l| l.0 == 1));
}

#[test]
fn test_distributor_disabled_blocks_injection() {
    let mut vm = new_vm();
    vm.register_irq(0, 50, default_ack, 0).unwrap();
    enable_virq(&mut vm, 50);
    assert!(vm.mmio_write(0, GICD_BASE, 0, 4));
    assert!(!vm.inject_irq(0, 50));
    assert!(vm.vgic().hypervisor().loads.is_empty());
}

#[test]
fn test_guest_set_pending_injects() {
    let mut vm = new_vm();
    vm.register_irq(0, 33, default_ack, 0).unwrap();
    enable_virq(&mut vm, 33);
    // GICD_ISPENDR1 bit 1
    assert!(vm.mmio_write(0, GICD_BASE + 0x204, 1 << 1, 4));
    assert_eq!(vm.vgic().list_register(0, 0), Some(33));
}

#[test]
fn test_invalid_vcpu_and_register() {
    let mut vm = new_vm();
    assert_eq!(vm.mmio_read(2, GICD_BASE, 4), None);
    assert!(!vm.vgic_maintenance(5, 0));
    // No GICv3 redistributor on a GICv2 VM
    assert_eq!(vm.mmio_read(0, GICR_BASE, 4), None);
    assert!(vm.register_irq(0, 1020, default_ack, 0).is_err());
    assert_eq!(vm.vgic().queued(2).count(), 0);
    assert_eq!(vm.vgic().queued(usize::MAX).count(), 0);
}

#[test]
fn test_reinject_after_pending_clear_keeps_list_register() {
    let mut vm = new_vm();
    vm.register_irq(0, 50, default_ack, 0).unwrap();
    enable_virq(&mut vm, 50);
    assert!(vm.inject_irq(0, 50));
    assert_eq!(vm.vgic().list_register(0, 0), Some(50));

    // GICD_ICPENDR1 bit 18 clears the pending state but not the list register
    assert!(vm.mmio_write(0, GICD_BASE + 0x284, 1 << 18, 4));
    assert!(!vm.vgic().is_pending(0, 50));

    // Still presented: pending again without a second load
    assert!(vm.inject_irq(0, 50));
    assert!(vm.vgic().is_pending(0, 50));
    assert_eq!(vm.vgic().hypervisor().loads.len(), 1);
    assert_eq!(vm.vgic().queued(0).count(), 0);
}

#[test]
fn test_gicv3_sgi_and_group() {
    let mut vm = v3_vm();
    for vcpu in 0..2 {
        vm.register_irq(vcpu, 3, default_ack, 0).unwrap();
    }
    // Target list {vCPU 1}, INTID 3
    assert!(vm.sgi_write(0, (3 << 24) | 0b10));
    assert!(vm.vgic().is_pending(1, 3));
    assert!(!vm.vgic().is_pending(0, 3));
    assert_eq!(vm.vgic().hypervisor().loads, vec![(1, 3, 1, 0)]);

    // IRM: every vCPU but the sender
    assert!(vm.sgi_write(1, (1 << 40) | (3 << 24)));
    assert!(vm.vgic().is_pending(0, 3));
    assert!(!vm.sgi_write(4, 0));

    // PPI enable through vCPU 1's SGI frame only touches vCPU 1
    vm.register_irq(1, 27, default_ack, 0).unwrap();
    let sgi_frame = GICR_BASE + GICR_FRAME_SIZE + 0x1_0000;
    assert!(vm.mmio_write(0, sgi_frame + 0x100, 1 << 27, 4));
    assert!(vm.vgic().is_enabled(1, 27));
    assert!(!vm.vgic().is_enabled(0, 27));
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Inject(u32),
    Eoi(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (40u32..48).prop_map(Op::Inject),
        (0..NUM_LIST_REGS).prop_map(Op::Eoi),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// A virq never sits in two list registers, presented virqs are pending,
    /// and the overflow queue is only used while every list register is busy.
    #[test]
    fn prop_list_registers_consistent(ops in proptest::collection::vec(op(), 1..64)) {
        let mut vm = new_vm();
        for virq in 40..48 {
            vm.register_irq(0, virq, default_ack, 0).unwrap();
        }
        assert!(vm.mmio_write(0, GICD_BASE, 1, 4));
        assert!(vm.mmio_write(0, GICD_BASE + 0x104, 0xff << 8, 4));

        for op in ops {
            match op {
                Op::Inject(virq) => prop_assert!(vm.inject_irq(0, virq)),
                Op::Eoi(lr) => {
                    if vm.vgic().list_register(0, lr).is_some() {
                        prop_assert!(vm.vgic_maintenance(0, lr));
                    }
                }
            }

            let vgic = vm.vgic();
            let loaded: Vec<u32> = (0..NUM_LIST_REGS).filter_map(|lr| vgic.list_register(0, lr)).collect();
            let queued: Vec<u32> = vgic.queued(0).collect();
            let mut all = loaded.clone();
            all.extend(&queued);
            let mut dedup = all.clone();
            dedup.sort_unstable();
            dedup.dedup();
            prop_assert_eq!(dedup.len(), all.len());
            for virq in &all {
                prop_assert!(vgic.is_pending(0, *virq));
            }
            if !queued.is_empty() {
                prop_assert_eq!(loaded.len(), NUM_LIST_REGS);
            }
        }
    }
}
