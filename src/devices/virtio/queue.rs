//! Split virtqueue implementation for virtio devices.
//!
//! The guest allocates the descriptor table, available ring and used ring
//! in its own memory. The queue only records their guest-physical
//! addresses; every access goes through [`GuestMemory`] and is range
//! checked, so a corrupted ring is a protocol error and never a wild access.

use crate::error::QueueError;
use crate::mm::GuestMemory;
use core::sync::atomic::{fence, Ordering};

/// Descriptor flags
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
pub const VIRTQ_DESC_F_WRITE: u16 = 2;
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Queue size every device in this crate reports and requires
pub const MAX_QUEUE_SIZE: u16 = 128;

const DESC_SIZE: u64 = 16;
/// flags + idx
const RING_HEADER: u64 = 4;
const USED_ELEM_SIZE: u64 = 8;

/// A single virtqueue descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqDesc {
    /// Guest physical address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Descriptor flags (NEXT, WRITE, INDIRECT)
    pub flags: u16,
    /// Index of the next descriptor in the chain (if NEXT flag set)
    pub next: u16,
}

impl VirtqDesc {
    fn read_from<M: GuestMemory + ?Sized>(mem: &M, addr: u64) -> Result<Self, QueueError> {
        let mut raw = [0u8; DESC_SIZE as usize];
        mem.read(addr, &mut raw)?;
        Ok(Self {
            addr: u64::from_le_bytes([raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]),
            len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: u16::from_le_bytes([raw[12], raw[13]]),
            next: u16::from_le_bytes([raw[14], raw[15]]),
        })
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }
}

/// A descriptor chain: the head index plus the descriptors themselves.
///
/// The chain is addressed as one contiguous byte stream; [`Self::read_at`]
/// and [`Self::write_at`] split an access across descriptor boundaries.
pub struct DescChain {
    /// Head descriptor index (needed for push_used)
    pub head: u16,
    descs: [VirtqDesc; MAX_QUEUE_SIZE as usize],
    count: usize,
}

impl DescChain {
    pub fn descs(&self) -> &[VirtqDesc] {
        &self.descs[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total bytes covered by the chain.
    pub fn total_len(&self) -> u64 {
        self.descs().iter().map(|d| d.len as u64).sum()
    }

    /// Visit the guest ranges backing `[offset, offset + len)` of the chain
    /// as `(gpa, position in the access, length)`.
    fn for_each_segment(
        &self,
        offset: u64,
        len: u64,
        mut f: impl FnMut(u64, usize, usize) -> Result<(), QueueError>,
    ) -> Result<(), QueueError> {
        if offset.checked_add(len).map_or(true, |end| end > self.total_len()) {
            return Err(QueueError::ChainBounds { offset, len });
        }
        let mut skip = offset;
        let mut done = 0u64;
        for desc in self.descs() {
            if done == len {
                break;
            }
            let desc_len = desc.len as u64;
            if skip >= desc_len {
                skip -= desc_len;
                continue;
            }
            let n = (desc_len - skip).min(len - done);
            // The guest picks the address; a segment may not wrap the address space
            let gpa = desc
                .addr
                .checked_add(skip)
                .filter(|gpa| gpa.checked_add(n).is_some())
                .ok_or(QueueError::ChainBounds { offset, len })?;
            f(gpa, done as usize, n as usize)?;
            done += n;
            skip = 0;
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the chain starting at byte `offset`.
    pub fn read_at<M: GuestMemory + ?Sized>(&self, mem: &M, offset: u64, buf: &mut [u8]) -> Result<(), QueueError> {
        self.for_each_segment(offset, buf.len() as u64, |gpa, pos, n| {
            mem.read(gpa, &mut buf[pos..pos + n])?;
            Ok(())
        })
    }

    /// Copy `buf` into the chain starting at byte `offset`.
    pub fn write_at<M: GuestMemory + ?Sized>(&self, mem: &mut M, offset: u64, buf: &[u8]) -> Result<(), QueueError> {
        self.for_each_segment(offset, buf.len() as u64, |gpa, pos, n| {
            mem.write(gpa, &buf[pos..pos + n])?;
            Ok(())
        })
    }
}

/// Which of the three rings an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    /// Descriptor table
    Desc,
    /// Available ring ("driver area")
    Avail,
    /// Used ring ("device area")
    Used,
}

/// Split virtqueue state.
#[derive(Debug, Clone, Copy)]
pub struct Virtqueue {
    /// Guest physical address of the descriptor table
    desc_addr: u64,
    /// Guest physical address of the available ring
    avail_addr: u64,
    /// Guest physical address of the used ring
    used_addr: u64,
    /// Queue size (number of descriptors, must be power of 2)
    num: u16,
    /// Last available index we processed
    last_avail_idx: u16,
    /// Whether the queue has been set up by the driver
    ready: bool,
}

impl Virtqueue {
    pub const fn new() -> Self {
        Self {
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            num: 0,
            last_avail_idx: 0,
            ready: false,
        }
    }

    /// Reset the queue to initial state
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn set_num(&mut self, num: u16) {
        self.num = num;
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    pub fn last_avail_idx(&self) -> u16 {
        self.last_avail_idx
    }

    pub fn addr(&self, ring: Ring) -> u64 {
        match ring {
            Ring::Desc => self.desc_addr,
            Ring::Avail => self.avail_addr,
            Ring::Used => self.used_addr,
        }
    }

    /// Replace one 32-bit half of a ring address.
    pub fn set_addr_half(&mut self, ring: Ring, high: bool, value: u32) {
        let addr = match ring {
            Ring::Desc => &mut self.desc_addr,
            Ring::Avail => &mut self.avail_addr,
            Ring::Used => &mut self.used_addr,
        };
        *addr = if high {
            (*addr & 0xFFFF_FFFF) | ((value as u64) << 32)
        } else {
            (*addr & !0xFFFF_FFFF) | value as u64
        };
    }

    /// Latch the configuration if all three rings fit in guest memory.
    /// Returns false (and stays not ready) otherwise.
    pub fn set_ready<M: GuestMemory + ?Sized>(&mut self, mem: &M) -> bool {
        let num = self.num as u64;
        let fits = num != 0
            && mem.contains(self.desc_addr, num * DESC_SIZE)
            && mem.contains(self.avail_addr, RING_HEADER + 2 * num + 2)
            && mem.contains(self.used_addr, RING_HEADER + USED_ELEM_SIZE * num + 2);
        self.ready = fits;
        fits
    }

    pub fn disable(&mut self) {
        self.ready = false;
    }

    fn avail_idx<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.avail_addr + 2)?)
    }

    /// Check if there are new available descriptors to process.
    pub fn has_avail<M: GuestMemory + ?Sized>(&self, mem: &M) -> Result<bool, QueueError> {
        if !self.ready {
            return Ok(false);
        }
        Ok(self.avail_idx(mem)? != self.last_avail_idx)
    }

    /// Consume the next head index from the available ring.
    ///
    /// Returns `Ok(None)` when the device has caught up with the guest.
    pub fn pop_avail_head<M: GuestMemory + ?Sized>(&mut self, mem: &M) -> Result<Option<u16>, QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        let avail_idx = self.avail_idx(mem)?;
        let pending = avail_idx.wrapping_sub(self.last_avail_idx);
        if pending == 0 {
            return Ok(None);
        }
        if pending > self.num {
            return Err(QueueError::AvailOverrun { avail_idx, pending });
        }
        // Entries may only be read after the guest's idx update is observed
        fence(Ordering::Acquire);
        let slot = (self.last_avail_idx % self.num) as u64;
        let head = mem.read_u16(self.avail_addr + RING_HEADER + 2 * slot)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Walk the descriptor chain starting at `head`.
    pub fn read_chain<M: GuestMemory + ?Sized>(&self, mem: &M, head: u16) -> Result<DescChain, QueueError> {
        let mut chain = DescChain {
            head,
            descs: [VirtqDesc::default(); MAX_QUEUE_SIZE as usize],
            count: 0,
        };
        let mut idx = head;
        loop {
            if idx >= self.num {
                return Err(QueueError::DescriptorIndex { index: idx, size: self.num });
            }
            if chain.count == self.num as usize || chain.count == chain.descs.len() {
                return Err(QueueError::ChainTooLong { head });
            }
            let desc = VirtqDesc::read_from(mem, self.desc_addr + idx as u64 * DESC_SIZE)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(QueueError::Indirect { head });
            }
            chain.descs[chain.count] = desc;
            chain.count += 1;
            if !desc.has_next() {
                return Ok(chain);
            }
            idx = desc.next;
        }
    }

    /// Put a used descriptor back into the used ring.
    ///
    /// `head` is the head descriptor index from the original chain.
    /// `len` is the total number of bytes written to the device-writable descriptors.
    pub fn push_used<M: GuestMemory + ?Sized>(&mut self, mem: &mut M, head: u16, len: u32) -> Result<(), QueueError> {
        if !self.ready {
            return Err(QueueError::NotReady);
        }
        let used_idx = mem.read_u16(self.used_addr + 2)?;
        let slot = (used_idx % self.num) as u64;
        let elem = self.used_addr + RING_HEADER + slot * USED_ELEM_SIZE;
        mem.write_u32(elem, head as u32)?;
        mem.write_u32(elem + 4, len)?;

        // The element must be visible before the index that publishes it
        fence(Ordering::Release);
        mem.write_u16(self.used_addr + 2, used_idx.wrapping_add(1))?;
        Ok(())
    }
}

impl Default for Virtqueue {
    fn default() -> Self {
        Self::new()
    }
}
