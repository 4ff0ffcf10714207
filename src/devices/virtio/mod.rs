//! Virtio device framework.
//!
//! Two transports (virtio-mmio and modern virtio-pci) share one register
//! core, [`VirtioRegs`], which implements the device status state machine,
//! feature negotiation and queue configuration. Device classes implement
//! [`VirtioDevice`] and see the transport only through [`VirtioContext`]
//! while they process a notification.

pub mod blk;
pub mod mmio;
pub mod pci;
pub mod queue;

use crate::devices::{InterruptSink, IoContext};
use crate::error::VirtioError;
use crate::mm::GuestMemory;
use bitflags::bitflags;
use queue::{Ring, Virtqueue, MAX_QUEUE_SIZE};

/// Virtio device ID of a network device
pub const VIRTIO_ID_NET: u32 = 1;
/// Virtio device ID of a block device
pub const VIRTIO_ID_BLOCK: u32 = 2;
/// Virtio 1.x compliance, feature bit 32
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;
/// Maximum number of virtqueues per device
pub const MAX_QUEUES: usize = 2;

bitflags! {
    /// Device status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
        const NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

bitflags! {
    /// Reasons for the device interrupt
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        const USED_BUFFER = 1;
        const CONFIG_CHANGE = 2;
    }
}

/// How the guest reaches the device registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// virtio-mmio: reading the interrupt status does not clear it
    Mmio,
    /// virtio-pci: reading the ISR clears it
    Pci,
}

/// Device class behind a transport.
pub trait VirtioDevice {
    /// Virtio device ID (e.g., 2 for block device)
    fn device_id(&self) -> u32;

    /// Number of virtqueues this device uses.
    fn num_queues(&self) -> u16;

    /// Queue size the device requires; the driver must configure exactly this.
    fn max_queue_size(&self) -> u16 {
        MAX_QUEUE_SIZE
    }

    /// Return to the post-reset state. Queue state is reset by the transport.
    fn device_reset(&mut self);

    /// Offered feature bits of window `sel` (0 = bits 0..31, 1 = bits
    /// 32..63); `None` for a window that does not exist.
    fn device_features(&self, sel: u32) -> Option<u32>;

    /// The driver accepted `features` in window `sel`. Called only for a
    /// subset of the offered bits.
    fn driver_features_accepted(&mut self, _sel: u32, _features: u32) {}

    /// Read from device-specific config space. `offset` is relative to the
    /// config space; accesses may be unaligned.
    fn config_read(&self, offset: u64, size: u8) -> Result<u64, VirtioError>;

    /// Write to device-specific config space.
    fn config_write(&mut self, offset: u64, value: u64, size: u8) -> Result<(), VirtioError>;

    /// Handle a queue notification (doorbell write).
    fn queue_notify(&mut self, ctx: &mut VirtioContext<'_>, queue: u16);

    /// The device's backend signalled its channel.
    fn backend_notified(&mut self, _ctx: &mut VirtioContext<'_>) {}

    /// Notification channel of the device's backend, if it has one.
    fn backend_channel(&self) -> Option<u32> {
        None
    }
}

/// Transport register state shared by virtio-mmio and virtio-pci.
pub struct VirtioRegs {
    kind: TransportKind,
    /// SPI injected on completion
    virq: u32,
    /// vCPU the interrupt is delivered to
    vcpu: usize,
    num_queues: u16,
    device_features_sel: u32,
    driver_features_sel: u32,
    /// Driver-acknowledged features
    driver_features: u64,
    /// Set once any driver feature write was refused; cleared on reset
    features_rejected: bool,
    queue_sel: u32,
    queue_notify: u32,
    interrupt_status: InterruptStatus,
    status: DeviceStatus,
    config_generation: u32,
    queues: [Virtqueue; MAX_QUEUES],
}

impl VirtioRegs {
    pub fn new(kind: TransportKind, num_queues: u16, virq: u32, vcpu: usize) -> Self {
        assert!(num_queues as usize <= MAX_QUEUES, "too many virtqueues");
        Self {
            kind,
            virq,
            vcpu,
            num_queues,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            features_rejected: false,
            queue_sel: 0,
            queue_notify: 0,
            interrupt_status: InterruptStatus::empty(),
            status: DeviceStatus::empty(),
            config_generation: 0,
            queues: [Virtqueue::new(); MAX_QUEUES],
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn virq(&self) -> u32 {
        self.virq
    }

    pub fn vcpu(&self) -> usize {
        self.vcpu
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn interrupt_status(&self) -> InterruptStatus {
        self.interrupt_status
    }

    /// Clear the acknowledged interrupt reasons.
    pub fn ack_interrupt(&mut self, bits: u32) {
        self.interrupt_status.remove(InterruptStatus::from_bits_truncate(bits));
    }

    /// PCI ISR read: return and clear.
    pub fn take_interrupt_status(&mut self) -> InterruptStatus {
        core::mem::replace(&mut self.interrupt_status, InterruptStatus::empty())
    }

    pub fn config_generation(&self) -> u32 {
        self.config_generation
    }

    pub fn num_queues(&self) -> u16 {
        self.num_queues
    }

    pub fn queue_sel(&self) -> u32 {
        self.queue_sel
    }

    pub fn select_queue(&mut self, sel: u32) {
        self.queue_sel = sel;
    }

    pub fn last_notify(&self) -> u32 {
        self.queue_notify
    }

    pub fn queue(&self, idx: usize) -> Option<&Virtqueue> {
        self.queues[..self.num_queues as usize].get(idx)
    }

    pub fn queue_mut(&mut self, idx: usize) -> Option<&mut Virtqueue> {
        self.queues[..self.num_queues as usize].get_mut(idx)
    }

    /// The queue selected by `queue_sel`.
    pub fn current_queue(&self) -> Result<&Virtqueue, VirtioError> {
        self.queue(self.queue_sel as usize).ok_or(VirtioError::InvalidQueue(self.queue_sel))
    }

    fn current_queue_mut(&mut self) -> Result<&mut Virtqueue, VirtioError> {
        let sel = self.queue_sel;
        self.queue_mut(sel as usize).ok_or(VirtioError::InvalidQueue(sel))
    }

    /// Reset device to initial state.
    pub fn reset<D: VirtioDevice>(&mut self, device: &mut D) {
        device.device_reset();
        self.status = DeviceStatus::empty();
        self.interrupt_status = InterruptStatus::empty();
        self.device_features_sel = 0;
        self.driver_features_sel = 0;
        self.driver_features = 0;
        self.features_rejected = false;
        self.queue_sel = 0;
        self.queue_notify = 0;
        for q in &mut self.queues {
            q.reset();
        }
    }

    // ── Status ──────────────────────────────────────────────────────

    /// Driver writes the status register.
    ///
    /// Exactly one new bit may be set per write, in the order ACKNOWLEDGE,
    /// DRIVER, FEATURES_OK, DRIVER_OK. 0 resets the device; FAILED is
    /// accepted from any state. Out-of-order transitions are ignored.
    pub fn write_status<D: VirtioDevice>(&mut self, device: &mut D, value: u32) -> Result<(), VirtioError> {
        if value == 0 {
            log::debug!("virtio: device reset by driver");
            self.reset(device);
            return Ok(());
        }
        let requested = DeviceStatus::from_bits(value).ok_or(VirtioError::UnknownStatus(value))?;
        if requested.contains(DeviceStatus::FAILED) {
            log::info!("virtio: driver set FAILED, giving up this device");
            self.status.insert(DeviceStatus::FAILED);
            return Ok(());
        }
        if !requested.contains(self.status) {
            // Bits can only be cleared by a reset
            return Err(VirtioError::UnknownStatus(value));
        }

        let new = requested.difference(self.status);
        let allowed = if new.is_empty() {
            true
        } else if new == DeviceStatus::ACKNOWLEDGE {
            self.status.is_empty()
        } else if new == DeviceStatus::DRIVER {
            self.status == DeviceStatus::ACKNOWLEDGE
        } else if new == DeviceStatus::FEATURES_OK {
            if self.status == DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER && !self.features_happy() {
                // Driver reads the status back and sees FEATURES_OK missing
                log::warn!("virtio: refusing FEATURES_OK, features {:#x}", self.driver_features);
                return Ok(());
            }
            self.status == DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER
        } else if new == DeviceStatus::DRIVER_OK {
            self.status.contains(DeviceStatus::FEATURES_OK)
        } else {
            return Err(VirtioError::UnknownStatus(value));
        };

        if allowed {
            self.status = requested;
        } else {
            log::warn!("virtio: ignoring out-of-order status {:#x} (current {:#x})", value, self.status.bits());
        }
        Ok(())
    }

    // ── Features ────────────────────────────────────────────────────

    pub fn select_device_features(&mut self, sel: u32) {
        self.device_features_sel = sel;
    }

    pub fn select_driver_features(&mut self, sel: u32) {
        self.driver_features_sel = sel;
    }

    pub fn device_features_sel(&self) -> u32 {
        self.device_features_sel
    }

    pub fn driver_features_sel(&self) -> u32 {
        self.driver_features_sel
    }

    /// Offered features in the selected window.
    pub fn device_features<D: VirtioDevice>(&self, device: &D) -> Result<u32, VirtioError> {
        if self.status.contains(DeviceStatus::FEATURES_OK) {
            log::warn!("virtio: device features read after FEATURES_OK");
        }
        device
            .device_features(self.device_features_sel)
            .ok_or(VirtioError::FeatureSelector(self.device_features_sel))
    }

    /// Accepted driver features in the selected window.
    pub fn driver_features(&self) -> Result<u32, VirtioError> {
        match self.driver_features_sel {
            0 => Ok(self.driver_features as u32),
            1 => Ok((self.driver_features >> 32) as u32),
            sel => Err(VirtioError::FeatureSelector(sel)),
        }
    }

    /// Driver writes its feature window. Succeeds iff `features` is a subset
    /// of what the device offers in that window.
    pub fn set_driver_features<D: VirtioDevice>(&mut self, device: &mut D, features: u32) -> Result<(), VirtioError> {
        let sel = self.driver_features_sel;
        let offered = device.device_features(sel).ok_or(VirtioError::FeatureSelector(sel))?;
        if features & !offered != 0 {
            self.features_rejected = true;
            return Err(VirtioError::UnsupportedFeatures { sel, features });
        }
        let shift = sel * 32;
        self.driver_features = (self.driver_features & !(0xFFFF_FFFFu64 << shift)) | ((features as u64) << shift);
        device.driver_features_accepted(sel, features);
        Ok(())
    }

    /// Whether the negotiated features can be latched with FEATURES_OK.
    pub fn features_happy(&self) -> bool {
        !self.features_rejected && self.driver_features & VIRTIO_F_VERSION_1 != 0
    }

    pub fn negotiated_features(&self) -> u64 {
        self.driver_features
    }

    // ── Queue configuration ─────────────────────────────────────────

    /// QUEUE_NUM_MAX of the selected queue, 0 if it does not exist.
    pub fn queue_num_max<D: VirtioDevice>(&self, device: &D) -> u32 {
        match self.current_queue() {
            Ok(_) => device.max_queue_size() as u32,
            Err(_) => 0,
        }
    }

    /// Only the device's fixed queue size is accepted.
    pub fn set_queue_num<D: VirtioDevice>(&mut self, device: &D, num: u32) -> Result<(), VirtioError> {
        let required = device.max_queue_size();
        let queue = self.current_queue_mut()?;
        if num != required as u32 {
            return Err(VirtioError::QueueSize { requested: num, required });
        }
        queue.set_num(required);
        Ok(())
    }

    pub fn set_ring_half(&mut self, ring: Ring, high: bool, value: u32) -> Result<(), VirtioError> {
        self.current_queue_mut()?.set_addr_half(ring, high, value);
        Ok(())
    }

    /// QUEUE_READY write. Enabling validates the rings against guest memory.
    pub fn set_queue_ready<M: GuestMemory + ?Sized>(&mut self, mem: &M, value: u32) -> Result<(), VirtioError> {
        let sel = self.queue_sel;
        let queue = self.current_queue_mut()?;
        if value == 0 {
            queue.disable();
            return Ok(());
        }
        if !queue.set_ready(mem) {
            return Err(VirtioError::RingOutOfRange(sel as u16));
        }
        log::debug!(
            "virtio: queue {} ready, size {} desc {:#x} avail {:#x} used {:#x}",
            sel,
            queue.num(),
            queue.addr(Ring::Desc),
            queue.addr(Ring::Avail),
            queue.addr(Ring::Used)
        );
        Ok(())
    }

    /// Doorbell for `queue`.
    pub fn notify_queue<D: VirtioDevice>(
        &mut self,
        device: &mut D,
        io: &mut IoContext<'_>,
        queue: u32,
    ) -> Result<(), VirtioError> {
        self.queue_notify = queue;
        let ready = self.queue(queue as usize).map(Virtqueue::ready);
        match ready {
            None => return Err(VirtioError::InvalidQueue(queue)),
            Some(false) => {
                log::warn!("virtio: notify on queue {} before it is ready", queue);
                return Ok(());
            }
            Some(true) => {}
        }
        let mut ctx = VirtioContext {
            regs: self,
            mem: &mut *io.mem,
            irq: &mut *io.irq,
        };
        device.queue_notify(&mut ctx, queue as u16);
        Ok(())
    }

    /// Run the device's backend completion handler.
    pub fn backend_notified<D: VirtioDevice>(&mut self, device: &mut D, io: &mut IoContext<'_>) {
        let mut ctx = VirtioContext {
            regs: self,
            mem: &mut *io.mem,
            irq: &mut *io.irq,
        };
        device.backend_notified(&mut ctx);
    }
}

/// What a device class can reach while handling a notification.
pub struct VirtioContext<'a> {
    pub regs: &'a mut VirtioRegs,
    pub mem: &'a mut dyn GuestMemory,
    pub irq: &'a mut dyn InterruptSink,
}

impl VirtioContext<'_> {
    /// Raise the used-buffer interrupt after used ring updates.
    ///
    /// On PCI the ISR read clears the status, so a set bit means the guest
    /// has not yet consumed the previous interrupt and another injection is
    /// skipped. MMIO always injects.
    pub fn notify_used(&mut self) -> bool {
        let already = self.regs.interrupt_status.contains(InterruptStatus::USED_BUFFER);
        self.regs.interrupt_status.insert(InterruptStatus::USED_BUFFER);
        if already && self.regs.kind == TransportKind::Pci {
            log::trace!("virtio: used-buffer interrupt still pending, not injecting");
            return true;
        }
        self.irq.inject(self.regs.vcpu, self.regs.virq)
    }

    /// Wake a backend process.
    pub fn notify_backend(&mut self, channel: u32) {
        self.irq.notify(channel);
    }
}
