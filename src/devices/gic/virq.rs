//! Virtual IRQ handles and the fixed-capacity tables that hold them.
//!
//! SGIs and PPIs (0..32) live in a direct-indexed per-vCPU table. SPIs are
//! sparse across a ~1000 entry ID space, so they share one small slot table
//! that is searched linearly.

use crate::error::VgicError;
use crate::vcpu_interrupt::{AckFn, Hypervisor};

pub const NUM_SGI_VIRQS: u32 = 16;
pub const NUM_PPI_VIRQS: u32 = 16;
pub const NUM_LOCAL_VIRQS: u32 = NUM_SGI_VIRQS + NUM_PPI_VIRQS;
/// First ID reserved for special purposes
pub const MAX_VIRQ: u32 = 1020;
pub const NUM_SLOTS_SPI_VIRQ: usize = 200;
/// Hardware list registers per vCPU
pub const NUM_LIST_REGS: usize = 4;
/// Overflow ring size; one slot stays empty
pub const MAX_IRQ_QUEUE_LEN: usize = 64;

const _: () = assert!(MAX_IRQ_QUEUE_LEN.is_power_of_two());

/// A registered virtual interrupt source.
pub struct VirqHandle<H> {
    pub virq: u32,
    /// Level-sensitive source; recorded only
    pub level: bool,
    pub ack: AckFn<H>,
    pub cookie: usize,
}

// Derive would require `H: Clone`.
impl<H> Clone for VirqHandle<H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H> Copy for VirqHandle<H> {}

impl<H> core::fmt::Debug for VirqHandle<H> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirqHandle")
            .field("virq", &self.virq)
            .field("level", &self.level)
            .field("cookie", &self.cookie)
            .finish()
    }
}

impl<H: Hypervisor> VirqHandle<H> {
    pub fn new(virq: u32, ack: AckFn<H>, cookie: usize) -> Self {
        Self { virq, level: false, ack, cookie }
    }

    /// Run the owner's acknowledge callback.
    pub fn ack(&self, hv: &mut H, vcpu: usize) {
        (self.ack)(hv, vcpu, self.virq, self.cookie);
    }
}

pub fn is_local(virq: u32) -> bool {
    virq < NUM_LOCAL_VIRQS
}

/// Global table of SPI handles.
pub struct SpiSlots<H> {
    slots: [Option<VirqHandle<H>>; NUM_SLOTS_SPI_VIRQ],
}

impl<H: Hypervisor> SpiSlots<H> {
    pub const fn new() -> Self {
        Self {
            slots: [None; NUM_SLOTS_SPI_VIRQ],
        }
    }

    /// Store `handle` in the first free slot, returning the slot index.
    pub fn alloc(&mut self, handle: VirqHandle<H>) -> Result<usize, VgicError> {
        if self.find(handle.virq).is_some() {
            return Err(VgicError::AlreadyRegistered { vcpu: 0, virq: handle.virq });
        }
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(VgicError::SpiSlotsExhausted(handle.virq))?;
        self.slots[idx] = Some(handle);
        Ok(idx)
    }

    pub fn find(&self, virq: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Some(h) if h.virq == virq))
    }

    pub fn get(&self, virq: u32) -> Option<&VirqHandle<H>> {
        self.find(virq).and_then(|idx| self.slots[idx].as_ref())
    }

    pub fn free(&mut self, virq: u32) -> Option<VirqHandle<H>> {
        let idx = self.find(virq)?;
        self.slots[idx].take()
    }

    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// Per-vCPU ring of virqs waiting for a free list register.
pub struct IrqQueue {
    irqs: [u32; MAX_IRQ_QUEUE_LEN],
    head: usize,
    tail: usize,
}

const fn queue_next(i: usize) -> usize {
    (i + 1) & (MAX_IRQ_QUEUE_LEN - 1)
}

impl IrqQueue {
    pub const fn new() -> Self {
        Self {
            irqs: [0; MAX_IRQ_QUEUE_LEN],
            head: 0,
            tail: 0,
        }
    }

    /// Returns false if the ring is full.
    pub fn enqueue(&mut self, virq: u32) -> bool {
        if queue_next(self.tail) == self.head {
            return false;
        }
        self.irqs[self.tail] = virq;
        self.tail = queue_next(self.tail);
        true
    }

    pub fn dequeue(&mut self) -> Option<u32> {
        if self.head == self.tail {
            return None;
        }
        let virq = self.irqs[self.head];
        self.head = queue_next(self.head);
        Some(virq)
    }

    pub fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head) & (MAX_IRQ_QUEUE_LEN - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len()).map(move |i| self.irqs[(self.head + i) & (MAX_IRQ_QUEUE_LEN - 1)])
    }

    pub fn contains(&self, virq: u32) -> bool {
        self.iter().any(|v| v == virq)
    }

    /// Drop every occurrence of `virq`, keeping the order of the rest.
    pub fn remove(&mut self, virq: u32) -> bool {
        let len = self.len();
        let mut kept = 0;
        for i in 0..len {
            let v = self.irqs[(self.head + i) & (MAX_IRQ_QUEUE_LEN - 1)];
            if v != virq {
                self.irqs[(self.head + kept) & (MAX_IRQ_QUEUE_LEN - 1)] = v;
                kept += 1;
            }
        }
        self.tail = (self.head + kept) & (MAX_IRQ_QUEUE_LEN - 1);
        kept != len
    }
}

impl Default for IrqQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcpu_interrupt::default_ack;

    struct NullHv;

    impl Hypervisor for NullHv {
        fn inject_irq(&mut self, _: usize, _: u32, _: u8, _: u8, _: usize) -> bool {
            true
        }
        fn notify(&mut self, _: u32) {}
        fn irq_ack(&mut self, _: u32) {}
    }

    #[test]
    fn test_queue_wraps_and_holds_len_minus_one() {
        let mut q = IrqQueue::new();
        for i in 0..(MAX_IRQ_QUEUE_LEN as u32 - 1) {
            assert!(q.enqueue(32 + i));
        }
        assert!(!q.enqueue(999));
        assert_eq!(q.dequeue(), Some(32));
        assert!(q.enqueue(999));
        assert_eq!(q.len(), MAX_IRQ_QUEUE_LEN - 1);
        assert!(q.contains(999));
    }

    #[test]
    fn test_queue_remove_keeps_order() {
        let mut q = IrqQueue::new();
        for v in [40, 41, 42, 41, 43] {
            q.enqueue(v);
        }
        assert!(q.remove(41));
        assert!(!q.remove(41));
        assert_eq!(q.iter().collect::<Vec<_>>(), vec![40, 42, 43]);
    }

    #[test]
    fn test_spi_slots_exhaust_and_reject_duplicates() {
        let mut slots: SpiSlots<NullHv> = SpiSlots::new();
        assert!(slots.alloc(VirqHandle::new(40, default_ack, 0)).is_ok());
        assert_eq!(
            slots.alloc(VirqHandle::new(40, default_ack, 0)),
            Err(VgicError::AlreadyRegistered { vcpu: 0, virq: 40 })
        );
        for i in 1..NUM_SLOTS_SPI_VIRQ as u32 {
            assert!(slots.alloc(VirqHandle::new(40 + i, default_ack, 0)).is_ok());
        }
        assert_eq!(
            slots.alloc(VirqHandle::new(900, default_ack, 0)),
            Err(VgicError::SpiSlotsExhausted(900))
        );
        assert!(slots.free(41).is_some());
        assert_eq!(slots.alloc(VirqHandle::new(900, default_ack, 0)), Ok(1));
    }
}
