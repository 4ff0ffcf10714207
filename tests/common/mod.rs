//! Test doubles shared by the integration tests: guest RAM, a recording
//! hypervisor, an in-memory storage backend and a minimal virtio driver.

#![allow(dead_code)]

use std::collections::VecDeque;

use vmm_core::config::{BlkDeviceConfig, Transport, VmConfig};
use vmm_core::devices::gic::GicVersion;
use vmm_core::error::{MemoryError, StorageError};
use vmm_core::mm::GuestMemory;
use vmm_core::platform::{BLK_BACKEND_CHANNEL, GICD_BASE, VIRTIO_BLK_VIRQ, VIRTIO_MMIO_BASE, VIRTIO_PCI_BAR_BASE};
use vmm_core::storage::{BlockBackend, BlockCommand, BlockOp, BlockResponse, BlockStatus, StorageInfo, SERIAL_LEN};
use vmm_core::vcpu_interrupt::Hypervisor;
use vmm_core::vm::Vm;

pub const RAM_BASE: u64 = 0x4000_0000;
pub const RAM_SIZE: usize = 0x10_0000;
pub const SERIAL: &[u8; SERIAL_LEN] = b"vmm-core-test-disk01";
pub const TRANSFER: usize = 4096;
pub const SECTOR: usize = 512;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ── Guest RAM ───────────────────────────────────────────────────────

pub struct GuestRam {
    base: u64,
    bytes: Vec<u8>,
}

impl GuestRam {
    pub fn new(base: u64, size: usize) -> Self {
        Self { base, bytes: vec![0; size] }
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = addr
            .checked_sub(self.base)
            .filter(|off| off.checked_add(len as u64).is_some_and(|end| end <= self.bytes.len() as u64))
            .ok_or(MemoryError::OutOfRange { addr, len: len as u64 })?;
        Ok(start as usize..start as usize + len)
    }
}

impl GuestMemory for GuestRam {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, dst.len())?;
        dst.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, src.len())?;
        self.bytes[range].copy_from_slice(src);
        Ok(())
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        self.range(addr, len as usize).is_ok()
    }
}

// ── Hypervisor ──────────────────────────────────────────────────────

/// Records every list register load, notification and ack.
#[derive(Default)]
pub struct RecordingHv {
    /// (vcpu, virq, group, lr)
    pub loads: Vec<(usize, u32, u8, usize)>,
    pub notified: Vec<u32>,
    pub acked: Vec<u32>,
}

impl RecordingHv {
    pub fn loads_of(&self, virq: u32) -> usize {
        self.loads.iter().filter(|l| l.1 == virq).count()
    }
}

impl Hypervisor for RecordingHv {
    fn inject_irq(&mut self, vcpu: usize, virq: u32, _priority: u8, group: u8, lr_idx: usize) -> bool {
        self.loads.push((vcpu, virq, group, lr_idx));
        true
    }

    fn notify(&mut self, channel: u32) {
        self.notified.push(channel);
    }

    fn irq_ack(&mut self, channel: u32) {
        self.acked.push(channel);
    }
}

// ── Storage backend ─────────────────────────────────────────────────

/// Disk image and data region in host memory. Commands are executed only
/// when the test calls `serve()`.
pub struct MemBackend {
    pub info: StorageInfo,
    pub disk: Vec<u8>,
    pub data: Vec<u8>,
    pub queue_depth: usize,
    pub requests: VecDeque<BlockCommand>,
    pub responses: VecDeque<BlockResponse>,
    /// Every command ever enqueued
    pub log: Vec<BlockCommand>,
    /// Fail the next executed command
    pub fail_next: bool,
}

impl MemBackend {
    pub fn new(windows: u64, data_cells: usize) -> Self {
        let disk = (0..windows as usize * TRANSFER).map(|i| (i / SECTOR) as u8).collect();
        Self {
            info: StorageInfo {
                serial: *SERIAL,
                read_only: false,
                sector_size: SECTOR as u32,
                transfer_size: TRANSFER as u32,
                capacity: windows,
            },
            disk,
            data: vec![0; data_cells * TRANSFER],
            queue_depth: 64,
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            log: Vec::new(),
            fail_next: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.info.read_only = true;
        self
    }

    pub fn sector(&self, sector: usize) -> &[u8] {
        &self.disk[sector * SECTOR..(sector + 1) * SECTOR]
    }

    /// Execute every queued command. Returns how many ran.
    pub fn serve(&mut self) -> usize {
        let mut served = 0;
        while let Some(cmd) = self.requests.pop_front() {
            let disk = cmd.block_number as usize * TRANSFER;
            let data = cmd.data_offset as usize;
            let len = cmd.count as usize * TRANSFER;
            let status = if std::mem::take(&mut self.fail_next) {
                BlockStatus::IoError
            } else {
                match cmd.op {
                    BlockOp::Read => self.data[data..data + len].copy_from_slice(&self.disk[disk..disk + len]),
                    BlockOp::Write => self.disk[disk..disk + len].copy_from_slice(&self.data[data..data + len]),
                    BlockOp::Flush => {}
                }
                BlockStatus::Ok
            };
            self.responses.push_back(BlockResponse {
                status,
                success_count: if status == BlockStatus::Ok { cmd.count } else { 0 },
                id: cmd.id,
            });
            served += 1;
        }
        served
    }
}

impl BlockBackend for MemBackend {
    fn info(&self) -> StorageInfo {
        self.info
    }

    fn request_queue_full(&self) -> bool {
        self.requests.len() >= self.queue_depth
    }

    fn enqueue_request(&mut self, cmd: BlockCommand) -> Result<(), StorageError> {
        if self.request_queue_full() {
            return Err(StorageError::QueueFull);
        }
        self.log.push(cmd);
        self.requests.push_back(cmd);
        Ok(())
    }

    fn dequeue_response(&mut self) -> Option<BlockResponse> {
        self.responses.pop_front()
    }

    fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        let src = self
            .data
            .get(start..start + buf.len())
            .ok_or(MemoryError::OutOfRange { addr: offset, len: buf.len() as u64 })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_data(&mut self, offset: u64, buf: &[u8]) -> Result<(), StorageError> {
        let start = offset as usize;
        let len = buf.len() as u64;
        let dst = self
            .data
            .get_mut(start..start + buf.len())
            .ok_or(MemoryError::OutOfRange { addr: offset, len })?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn data_region_size(&self) -> u64 {
        self.data.len() as u64
    }
}

// ── VM setup ────────────────────────────────────────────────────────

pub type TestVm = Vm<RecordingHv, GuestRam, MemBackend>;

pub fn vm_config() -> VmConfig {
    VmConfig {
        gic_version: GicVersion::V2,
        num_vcpus: 2,
        ..VmConfig::default()
    }
}

pub fn new_vm() -> TestVm {
    init_logger();
    Vm::new(vm_config(), RecordingHv::default(), GuestRam::new(RAM_BASE, RAM_SIZE)).unwrap()
}

/// Enable the distributor and `virq` through guest register writes.
pub fn enable_virq(vm: &mut TestVm, virq: u32) {
    assert!(vm.mmio_write(0, GICD_BASE, 1, 4));
    let reg = GICD_BASE + 0x100 + 4 * (virq as u64 / 32);
    assert!(vm.mmio_write(0, reg, 1 << (virq % 32), 4));
}

/// VM with one block device on `transport`, its interrupt enabled.
pub fn vm_with_blk(transport: Transport, backend: MemBackend) -> TestVm {
    let mut vm = new_vm();
    let config = BlkDeviceConfig {
        transport,
        virq: VIRTIO_BLK_VIRQ,
        vcpu: 0,
        backend_channel: BLK_BACKEND_CHANNEL,
    };
    assert_eq!(vm.attach_virtio_blk(config, backend).unwrap(), 0);
    enable_virq(&mut vm, VIRTIO_BLK_VIRQ);
    vm
}

pub fn mmio() -> Transport {
    Transport::Mmio { base: VIRTIO_MMIO_BASE }
}

pub fn pci() -> Transport {
    Transport::Pci { bar_base: VIRTIO_PCI_BAR_BASE }
}

pub fn backend(vm: &mut TestVm) -> &mut MemBackend {
    vm.blk_mut(0).unwrap().backend_mut()
}

/// Let the backend run and deliver its completion notification.
pub fn complete_backend(vm: &mut TestVm) -> usize {
    let served = backend(vm).serve();
    assert!(vm.handle_notification(BLK_BACKEND_CHANNEL));
    served
}

// ── Virtio driver ───────────────────────────────────────────────────

pub const QUEUE_SIZE: u16 = 128;
pub const DESC_TABLE: u64 = RAM_BASE;
pub const AVAIL_RING: u64 = RAM_BASE + 0x1000;
pub const USED_RING: u64 = RAM_BASE + 0x2000;
const HEAP: u64 = RAM_BASE + 0x4000;

pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

pub const F_NEXT: u16 = 1;
pub const F_WRITE: u16 = 2;

/// Offered and accepted by the test driver: FLUSH | BLK_SIZE
pub const BLK_FEATURES_LO: u32 = (1 << 9) | (1 << 6);

#[derive(Debug, Clone, Copy)]
pub enum Body<'a> {
    None,
    /// Device-readable payload
    Out(&'a [u8]),
    /// Device-writable buffer of this size
    In(usize),
}

/// A request placed on the available ring.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub head: u16,
    pub body_addr: u64,
    pub body_len: usize,
    pub status_addr: u64,
}

/// Register offsets the driver needs, per transport.
#[derive(Debug, Clone, Copy)]
pub enum Regs {
    Mmio(u64),
    Pci(u64),
}

pub struct Driver {
    pub regs: Regs,
    next_desc: u16,
    avail_idx: u16,
    used_seen: u16,
    heap: u64,
}

impl Driver {
    pub fn new(transport: Transport) -> Self {
        let regs = match transport {
            Transport::Mmio { base } => Regs::Mmio(base),
            Transport::Pci { bar_base } => Regs::Pci(bar_base),
        };
        Self { regs, next_desc: 0, avail_idx: 0, used_seen: 0, heap: HEAP }
    }

    pub fn status_addr(&self) -> (u64, u8) {
        match self.regs {
            Regs::Mmio(base) => (base + 0x70, 4),
            Regs::Pci(bar) => (bar + 0x14, 1),
        }
    }

    pub fn write_status(&self, vm: &mut TestVm, status: u32) -> bool {
        let (addr, size) = self.status_addr();
        vm.mmio_write(0, addr, status as u64, size)
    }

    pub fn read_status(&self, vm: &mut TestVm) -> u32 {
        let (addr, size) = self.status_addr();
        vm.mmio_read(0, addr, size).unwrap() as u32
    }

    /// Select driver feature window `sel` and write `features` into it.
    pub fn write_features(&self, vm: &mut TestVm, sel: u32, features: u32) -> bool {
        let (sel_reg, feat_reg) = match self.regs {
            Regs::Mmio(base) => (base + 0x24, base + 0x20),
            Regs::Pci(bar) => (bar + 0x08, bar + 0x0C),
        };
        assert!(vm.mmio_write(0, sel_reg, sel as u64, 4));
        vm.mmio_write(0, feat_reg, features as u64, 4)
    }

    /// Full initialisation: status handshake, features, queue 0, DRIVER_OK.
    pub fn init(&mut self, vm: &mut TestVm) {
        assert!(self.write_status(vm, 1));
        assert!(self.write_status(vm, 3));
        assert!(self.write_features(vm, 1, 1));
        assert!(self.write_features(vm, 0, BLK_FEATURES_LO));
        assert!(self.write_status(vm, 0xb));
        assert_eq!(self.read_status(vm), 0xb);
        self.setup_queue(vm);
        assert!(self.write_status(vm, 0xf));
    }

    pub fn setup_queue(&mut self, vm: &mut TestVm) {
        let rings = [DESC_TABLE, AVAIL_RING, USED_RING];
        match self.regs {
            Regs::Mmio(base) => {
                assert!(vm.mmio_write(0, base + 0x30, 0, 4));
                assert!(vm.mmio_write(0, base + 0x38, QUEUE_SIZE as u64, 4));
                for (reg, addr) in [0x80u64, 0x90, 0xa0].into_iter().zip(rings) {
                    assert!(vm.mmio_write(0, base + reg, addr & 0xFFFF_FFFF, 4));
                    assert!(vm.mmio_write(0, base + reg + 4, addr >> 32, 4));
                }
                assert!(vm.mmio_write(0, base + 0x44, 1, 4));
            }
            Regs::Pci(bar) => {
                assert!(vm.mmio_write(0, bar + 0x16, 0, 2));
                assert!(vm.mmio_write(0, bar + 0x18, QUEUE_SIZE as u64, 2));
                for (reg, addr) in [0x20u64, 0x28, 0x30].into_iter().zip(rings) {
                    assert!(vm.mmio_write(0, bar + reg, addr & 0xFFFF_FFFF, 4));
                    assert!(vm.mmio_write(0, bar + reg + 4, addr >> 32, 4));
                }
                assert!(vm.mmio_write(0, bar + 0x1C, 1, 2));
            }
        }
    }

    pub fn alloc(&mut self, len: usize) -> u64 {
        let addr = self.heap;
        self.heap += (len as u64 + 15) & !15;
        assert!(self.heap <= RAM_BASE + RAM_SIZE as u64, "test heap exhausted");
        addr
    }

    fn write_desc(&mut self, vm: &mut TestVm, addr: u64, len: u32, flags: u16) -> u16 {
        let idx = self.next_desc;
        self.next_desc = (self.next_desc + 1) % QUEUE_SIZE;
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&addr.to_le_bytes());
        raw[8..12].copy_from_slice(&len.to_le_bytes());
        raw[12..14].copy_from_slice(&flags.to_le_bytes());
        raw[14..16].copy_from_slice(&self.next_desc.to_le_bytes());
        vm.memory_mut().write(DESC_TABLE + idx as u64 * 16, &raw).unwrap();
        idx
    }

    /// Build a header/body/status chain and publish it on the available
    /// ring without notifying the device.
    pub fn push(&mut self, vm: &mut TestVm, req_type: u32, sector: u64, body: Body<'_>) -> Request {
        let header_addr = self.header(vm, req_type, sector);
        let head = self.write_desc(vm, header_addr, 16, F_NEXT);

        let (body_addr, body_len) = match body {
            Body::None => (0, 0),
            Body::Out(data) => {
                let addr = self.alloc(data.len());
                vm.memory_mut().write(addr, data).unwrap();
                self.write_desc(vm, addr, data.len() as u32, F_NEXT);
                (addr, data.len())
            }
            Body::In(len) => {
                let addr = self.alloc(len);
                self.write_desc(vm, addr, len as u32, F_NEXT | F_WRITE);
                (addr, len)
            }
        };

        let status_addr = self.alloc(1);
        vm.memory_mut().write(status_addr, &[0xff]).unwrap();
        self.write_desc(vm, status_addr, 1, F_WRITE);

        self.publish(vm, head);
        Request { head, body_addr, body_len, status_addr }
    }

    /// Place a request header in guest RAM and return its address.
    pub fn header(&mut self, vm: &mut TestVm, req_type: u32, sector: u64) -> u64 {
        let mut header = [0u8; 16];
        header[0..4].copy_from_slice(&req_type.to_le_bytes());
        header[8..16].copy_from_slice(&sector.to_le_bytes());
        let addr = self.alloc(16);
        vm.memory_mut().write(addr, &header).unwrap();
        addr
    }

    /// Publish a chain of `(addr, len, flags)` descriptors exactly as given.
    /// `F_NEXT` is added to every descriptor but the last.
    pub fn push_chain(&mut self, vm: &mut TestVm, descs: &[(u64, u32, u16)]) -> u16 {
        let head = self.next_desc;
        for (i, &(addr, len, flags)) in descs.iter().enumerate() {
            let next = if i + 1 < descs.len() { F_NEXT } else { 0 };
            self.write_desc(vm, addr, len, flags | next);
        }
        self.publish(vm, head);
        head
    }

    /// Overwrite the length of descriptor `idx`, as a guest would.
    pub fn set_desc_len(&self, vm: &mut TestVm, idx: u16, len: u32) {
        vm.memory_mut().write_u32(DESC_TABLE + idx as u64 * 16 + 8, len).unwrap();
    }

    fn publish(&mut self, vm: &mut TestVm, head: u16) {
        let slot = (self.avail_idx % QUEUE_SIZE) as u64;
        vm.memory_mut().write_u16(AVAIL_RING + 4 + 2 * slot, head).unwrap();
        self.avail_idx = self.avail_idx.wrapping_add(1);
        vm.memory_mut().write_u16(AVAIL_RING + 2, self.avail_idx).unwrap();
    }

    /// Queue notification for queue 0.
    pub fn kick(&self, vm: &mut TestVm) -> bool {
        match self.regs {
            Regs::Mmio(base) => vm.mmio_write(0, base + 0x50, 0, 4),
            Regs::Pci(bar) => vm.mmio_write(0, bar + 0x3000, 0, 2),
        }
    }

    pub fn submit(&mut self, vm: &mut TestVm, req_type: u32, sector: u64, body: Body<'_>) -> Request {
        let req = self.push(vm, req_type, sector, body);
        assert!(self.kick(vm));
        req
    }

    /// New used ring entries as (head, len).
    pub fn take_used(&mut self, vm: &mut TestVm) -> Vec<(u32, u32)> {
        let mem = vm.memory();
        let used_idx = mem.read_u16(USED_RING + 2).unwrap();
        let mut out = Vec::new();
        while self.used_seen != used_idx {
            let elem = USED_RING + 4 + 8 * (self.used_seen % QUEUE_SIZE) as u64;
            out.push((mem.read_u32(elem).unwrap(), mem.read_u32(elem + 4).unwrap()));
            self.used_seen = self.used_seen.wrapping_add(1);
        }
        out
    }

    pub fn status_of(&self, vm: &TestVm, req: &Request) -> u8 {
        vm.memory().read_u8(req.status_addr).unwrap()
    }

    pub fn body_of(&self, vm: &TestVm, req: &Request) -> Vec<u8> {
        let mut buf = vec![0; req.body_len];
        vm.memory().read(req.body_addr, &mut buf).unwrap();
        buf
    }
}
