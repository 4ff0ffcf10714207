//! In-flight request bookkeeping for the block device.
//!
//! Every guest request that goes to the backend owns one entry, keyed by
//! the request id the backend echoes back in its response. The entry also
//! owns the data cells reserved for the request until the final
//! completion.

use crate::mm::IndexAllocator;

/// Maximum number of requests in flight to the backend
pub const BLK_MAX_REQUESTS: usize = 256;

/// Where a request is in its round trip through the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Read of the guest's windows in flight
    Reading,
    /// Whole-window write in flight
    WritingAligned,
    /// Read half of a read-modify-write in flight
    RmwReading,
    /// Write half of a read-modify-write in flight
    RmwWriting,
    /// Read-modify-write waiting for an overlapping write to finish
    RmwQueueing,
    /// Whole-window write, data already in its cells, waiting for an
    /// overlapping write to finish
    WriteQueueing,
    Flushing,
}

impl RequestState {
    /// States of a request that will modify the disk.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            RequestState::WritingAligned
                | RequestState::RmwReading
                | RequestState::RmwWriting
                | RequestState::RmwQueueing
                | RequestState::WriteQueueing
        )
    }

    /// Held back before reaching the backend.
    pub fn is_queued(self) -> bool {
        matches!(self, RequestState::RmwQueueing | RequestState::WriteQueueing)
    }
}

/// One guest request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reqbk {
    /// Head of the guest's descriptor chain
    pub desc_head: u16,
    /// First data cell reserved for the request
    pub cell_base: usize,
    /// Number of cells (= transfer windows)
    pub cell_count: usize,
    /// First transfer window on disk
    pub block_number: u64,
    /// Byte offset of the guest's data inside the first window
    pub window_offset: u64,
    /// Size of the request body in bytes
    pub body_size: u32,
    pub state: RequestState,
    /// Submission order
    pub seq: u64,
    /// The device was reset while the request was at the backend
    pub orphaned: bool,
}

impl Reqbk {
    /// Half-open window range intersection.
    pub fn overlaps(&self, block_number: u64, count: usize) -> bool {
        self.block_number < block_number + count as u64 && block_number < self.block_number + self.cell_count as u64
    }
}

/// Request entries indexed by request id.
pub struct RequestTable {
    ids: IndexAllocator,
    entries: [Option<Reqbk>; BLK_MAX_REQUESTS],
    next_seq: u64,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            ids: IndexAllocator::new(BLK_MAX_REQUESTS),
            entries: [None; BLK_MAX_REQUESTS],
            next_seq: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.ids.is_full()
    }

    pub fn in_flight(&self) -> usize {
        self.ids.in_use()
    }

    /// Store `req` under a fresh id. The submission sequence number is
    /// assigned here.
    pub fn insert(&mut self, mut req: Reqbk) -> Option<u32> {
        let id = self.ids.alloc()?;
        req.seq = self.next_seq;
        self.next_seq += 1;
        self.entries[id] = Some(req);
        Some(id as u32)
    }

    pub fn get(&self, id: u32) -> Option<&Reqbk> {
        self.entries.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Reqbk> {
        self.entries.get_mut(id as usize)?.as_mut()
    }

    /// Drop the entry and release its id.
    pub fn remove(&mut self, id: u32) -> Option<Reqbk> {
        let req = self.entries.get_mut(id as usize)?.take()?;
        let freed = self.ids.free(id as usize);
        debug_assert!(freed, "request id {} was not allocated", id);
        Some(req)
    }

    fn iter(&self) -> impl Iterator<Item = (u32, &Reqbk)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, e)| e.as_ref().map(|r| (id as u32, r)))
    }

    /// Whether a write other than `except` (and submitted before
    /// `before_seq`) touches the given windows.
    pub fn write_overlaps(&self, block_number: u64, count: usize, except: Option<u32>, before_seq: u64) -> bool {
        self.iter().any(|(id, r)| {
            Some(id) != except && r.seq < before_seq && r.state.is_write() && r.overlaps(block_number, count)
        })
    }

    /// The oldest queued write no earlier write blocks.
    pub fn next_runnable_write(&self) -> Option<u32> {
        self.iter()
            .filter(|(_, r)| r.state.is_queued())
            .filter(|(id, r)| !self.write_overlaps(r.block_number, r.cell_count, Some(*id), r.seq))
            .min_by_key(|(_, r)| r.seq)
            .map(|(id, _)| id)
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}
