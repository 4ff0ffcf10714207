//! Virtio block device backed by an asynchronous storage service.
//!
//! Guest requests arrive as descriptor chains: a 16-byte header (type,
//! ioprio, sector), a body and a one-byte status footer. Descriptor
//! boundaries carry no meaning; the chain is treated as one byte stream.
//!
//! The backend moves data in fixed transfer windows through a shared data
//! region carved into window-sized cells. A request reserves its cells and
//! a request id up front; if any of the backend queue, the id table or the
//! data region is exhausted the request fails with IOERR on the spot.
//!
//! Writes that do not cover whole windows go through read-modify-write:
//! the surrounding windows are read into the request's cells, the guest's
//! bytes are laid over them and the cells are written back. While such a
//! write is in flight, a later write to an overlapping window waits in
//! [`RequestState::RmwQueueing`] or [`RequestState::WriteQueueing`] until
//! the earlier write is done, so overlapping writes reach the disk in
//! submission order.

pub mod request;

use self::request::{Reqbk, RequestState, RequestTable, BLK_MAX_REQUESTS};
use super::queue::DescChain;
use super::{VirtioContext, VirtioDevice, VIRTIO_F_VERSION_1, VIRTIO_ID_BLOCK};
use crate::error::{ConfigError, QueueError, Result, VirtioError};
use crate::mm::allocator::MAX_CELLS;
use crate::mm::{CellAllocator, GuestMemory};
use crate::storage::{BlockBackend, BlockCommand, BlockOp, BlockResponse, BlockStatus, StorageInfo, SERIAL_LEN};

// ── Virtio-blk request types ────────────────────────────────────────
pub const VIRTIO_BLK_T_IN: u32 = 0;
pub const VIRTIO_BLK_T_OUT: u32 = 1;
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

// ── Virtio-blk status codes ────────────────────────────────────────
pub const VIRTIO_BLK_S_OK: u8 = 0;
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

// ── Virtio-blk feature bits ────────────────────────────────────────
pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;

/// Request header: type, ioprio, sector
pub const BLK_HEADER_SIZE: u64 = 16;

const REQUEST_QUEUE: usize = 0;
/// struct virtio_blk_config up to and including the write-zeroes fields
const CONFIG_SIZE: usize = 0x3c;
const CONFIG_CAPACITY: usize = 0x00;
const CONFIG_BLK_SIZE: usize = 0x14;
const COPY_CHUNK: usize = 512;

/// What happened to a request taken off the available ring.
enum Disposition {
    /// Used ring entry written
    Completed,
    /// Command sent to the backend
    Submitted,
    /// Waiting for an overlapping write
    Deferred,
}

/// Accumulated effects of one notification.
#[derive(Default)]
struct Progress {
    completed: bool,
    submitted: bool,
    rmw_started: bool,
}

/// Window range covered by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    block_number: u64,
    window_offset: u64,
    count: usize,
}

/// Virtio-blk device
pub struct VirtioBlk<B: BlockBackend> {
    backend: B,
    info: StorageInfo,
    /// Notification channel of the storage service
    channel: u32,
    cells: CellAllocator,
    requests: RequestTable,
}

impl<B: BlockBackend> VirtioBlk<B> {
    pub fn new(backend: B, channel: u32) -> Result<Self, ConfigError> {
        let info = backend.info();
        if info.sector_size == 0 || info.transfer_size == 0 || info.transfer_size % info.sector_size != 0 {
            return Err(ConfigError::Geometry {
                window: info.transfer_size,
                sector: info.sector_size,
            });
        }
        let num_cells = ((backend.data_region_size() / info.transfer_size as u64) as usize).min(MAX_CELLS);
        log::info!(
            "virtio-blk: {} sectors of {} bytes, {} data cells, channel {}{}",
            info.capacity_sectors(),
            info.sector_size,
            num_cells,
            channel,
            if info.read_only { ", read-only" } else { "" }
        );
        Ok(Self {
            backend,
            info,
            channel,
            cells: CellAllocator::new(num_cells),
            requests: RequestTable::new(),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Requests waiting for the backend (including queued read-modify-writes).
    pub fn in_flight(&self) -> usize {
        self.requests.in_flight()
    }

    /// Data cells not reserved by any request.
    pub fn free_cells(&self) -> usize {
        self.cells.remaining()
    }

    fn transfer_size(&self) -> u64 {
        self.info.transfer_size as u64
    }

    fn cell_offset(&self, cell: usize) -> u64 {
        cell as u64 * self.transfer_size()
    }

    fn span(&self, sector: u64, body: u64) -> Span {
        let sector_size = self.info.sector_size as u64;
        let per_window = self.info.sectors_per_window();
        let window_offset = (sector % per_window) * sector_size;
        Span {
            block_number: sector / per_window,
            window_offset,
            count: (window_offset + body).div_ceil(self.transfer_size()) as usize,
        }
    }

    /// Whole sectors, inside the disk, addressable by one request.
    fn body_valid(&self, sector: u64, body: u64) -> bool {
        let sector_size = self.info.sector_size as u64;
        body % sector_size == 0
            && body <= u32::MAX as u64
            && sector
                .checked_add(body / sector_size)
                .is_some_and(|end| end <= self.info.capacity_sectors())
    }

    // ── Guest side ──────────────────────────────────────────────────

    /// Pull and handle guest requests until the available ring is empty.
    fn process_queue(&mut self, ctx: &mut VirtioContext<'_>, progress: &mut Progress) {
        loop {
            let Some(queue) = ctx.regs.queue_mut(REQUEST_QUEUE) else {
                return;
            };
            let head = match queue.pop_avail_head(&*ctx.mem) {
                Ok(Some(head)) => head,
                Ok(None) => return,
                Err(QueueError::NotReady) => {
                    log::debug!("virtio-blk: request queue not ready");
                    return;
                }
                Err(e) => {
                    log::warn!("virtio-blk: available ring unusable: {}", e);
                    return;
                }
            };
            let chain = match queue.read_chain(&*ctx.mem, head) {
                Ok(chain) => chain,
                Err(e) => {
                    log::warn!("virtio-blk: dropping request {}: {}", head, e);
                    if let Err(e) = queue.push_used(&mut *ctx.mem, head, 0) {
                        log::warn!("virtio-blk: cannot return request {}: {}", head, e);
                    }
                    progress.completed = true;
                    continue;
                }
            };
            match self.handle_request(ctx, &chain) {
                Disposition::Completed => progress.completed = true,
                Disposition::Submitted => progress.submitted = true,
                Disposition::Deferred => {}
            }
        }
    }

    fn handle_request(&mut self, ctx: &mut VirtioContext<'_>, chain: &DescChain) -> Disposition {
        let total = chain.total_len();
        let mut raw = [0u8; BLK_HEADER_SIZE as usize];
        if total < BLK_HEADER_SIZE + 1 || chain.read_at(&*ctx.mem, 0, &mut raw).is_err() {
            log::warn!("virtio-blk: request {} has no room for header and status", chain.head);
            push_used(ctx, chain.head, 0);
            return Disposition::Completed;
        }
        let req_type = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let sector = u64::from_le_bytes([raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15]]);
        let body = total - BLK_HEADER_SIZE - 1;
        log::trace!(
            "virtio-blk: request {} type {} sector {} body {}",
            chain.head,
            req_type,
            sector,
            body
        );

        match req_type {
            VIRTIO_BLK_T_IN => self.start_read(ctx, chain, sector, body),
            VIRTIO_BLK_T_OUT => self.start_write(ctx, chain, sector, body),
            VIRTIO_BLK_T_FLUSH => self.start_flush(ctx, chain),
            VIRTIO_BLK_T_GET_ID => {
                let n = (body as usize).min(SERIAL_LEN);
                let status = match chain.write_at(&mut *ctx.mem, BLK_HEADER_SIZE, &self.info.serial[..n]) {
                    Ok(()) => VIRTIO_BLK_S_OK,
                    Err(e) => {
                        log::warn!("virtio-blk: GET_ID: {}", e);
                        VIRTIO_BLK_S_IOERR
                    }
                };
                complete_chain(ctx, chain, status, body as u32 + 1);
                Disposition::Completed
            }
            other => {
                log::debug!("virtio-blk: unsupported request type {}", other);
                complete_chain(ctx, chain, VIRTIO_BLK_S_UNSUPP, 1);
                Disposition::Completed
            }
        }
    }

    fn fail(&self, ctx: &mut VirtioContext<'_>, chain: &DescChain) -> Disposition {
        complete_chain(ctx, chain, VIRTIO_BLK_S_IOERR, 1);
        Disposition::Completed
    }

    fn start_read(&mut self, ctx: &mut VirtioContext<'_>, chain: &DescChain, sector: u64, body: u64) -> Disposition {
        if body == 0 {
            complete_chain(ctx, chain, VIRTIO_BLK_S_OK, 1);
            return Disposition::Completed;
        }
        if !self.body_valid(sector, body) {
            log::warn!("virtio-blk: invalid read of {} bytes at sector {}", body, sector);
            return self.fail(ctx, chain);
        }
        let span = self.span(sector, body);
        let Some(id) = self.admit(chain.head, span, body, RequestState::Reading) else {
            return self.fail(ctx, chain);
        };
        if !self.submit(BlockOp::Read, id) {
            self.release(id);
            return self.fail(ctx, chain);
        }
        Disposition::Submitted
    }

    fn start_write(&mut self, ctx: &mut VirtioContext<'_>, chain: &DescChain, sector: u64, body: u64) -> Disposition {
        if self.info.read_only {
            log::warn!("virtio-blk: write to read-only disk");
            return self.fail(ctx, chain);
        }
        if body == 0 {
            complete_chain(ctx, chain, VIRTIO_BLK_S_OK, 1);
            return Disposition::Completed;
        }
        if !self.body_valid(sector, body) {
            log::warn!("virtio-blk: invalid write of {} bytes at sector {}", body, sector);
            return self.fail(ctx, chain);
        }
        let span = self.span(sector, body);
        let aligned = span.window_offset == 0 && body % self.transfer_size() == 0;
        let state = if aligned {
            RequestState::WritingAligned
        } else {
            RequestState::RmwReading
        };
        let Some(id) = self.admit(chain.head, span, body, state) else {
            return self.fail(ctx, chain);
        };

        if aligned {
            let cell_base = self.requests.get(id).map_or(0, |r| r.cell_base);
            let data_offset = self.cell_offset(cell_base);
            if let Err(e) = self.copy_from_guest(&*ctx.mem, chain, data_offset, body) {
                log::warn!("virtio-blk: write {}: {}", chain.head, e);
                self.release(id);
                return self.fail(ctx, chain);
            }
        }

        let seq = self.requests.get(id).map_or(0, |r| r.seq);
        if self.requests.write_overlaps(span.block_number, span.count, Some(id), seq) {
            if let Some(req) = self.requests.get_mut(id) {
                req.state = if aligned {
                    RequestState::WriteQueueing
                } else {
                    RequestState::RmwQueueing
                };
            }
            log::debug!(
                "virtio-blk: request {} waits for an overlapping write to windows {}+{}",
                id,
                span.block_number,
                span.count
            );
            return Disposition::Deferred;
        }
        let op = if aligned { BlockOp::Write } else { BlockOp::Read };
        if !self.submit(op, id) {
            self.release(id);
            return self.fail(ctx, chain);
        }
        Disposition::Submitted
    }

    fn start_flush(&mut self, ctx: &mut VirtioContext<'_>, chain: &DescChain) -> Disposition {
        let span = Span {
            block_number: 0,
            window_offset: 0,
            count: 0,
        };
        let Some(id) = self.admit(chain.head, span, 0, RequestState::Flushing) else {
            return self.fail(ctx, chain);
        };
        if !self.submit(BlockOp::Flush, id) {
            self.release(id);
            return self.fail(ctx, chain);
        }
        Disposition::Submitted
    }

    // ── Resources ───────────────────────────────────────────────────

    /// Reserve a request id and the data cells for `span`.
    fn admit(&mut self, desc_head: u16, span: Span, body: u64, state: RequestState) -> Option<u32> {
        if self.backend.request_queue_full() {
            log::warn!("virtio-blk: backend request queue full");
            return None;
        }
        if self.requests.is_full() {
            log::warn!("virtio-blk: no free request id");
            return None;
        }
        let cell_base = if span.count == 0 {
            0
        } else {
            match self.cells.alloc(span.count) {
                Some(base) => base,
                None => {
                    log::warn!("virtio-blk: data region exhausted ({} windows requested)", span.count);
                    return None;
                }
            }
        };
        let req = Reqbk {
            desc_head,
            cell_base,
            cell_count: span.count,
            block_number: span.block_number,
            window_offset: span.window_offset,
            body_size: body as u32,
            state,
            seq: 0,
            orphaned: false,
        };
        let id = self.requests.insert(req);
        if id.is_none() && span.count != 0 {
            self.cells.free(cell_base, span.count);
        }
        id
    }

    /// Free the request's id and cells. Runs once per request.
    fn release(&mut self, id: u32) -> Option<Reqbk> {
        let req = self.requests.remove(id)?;
        if req.cell_count != 0 {
            self.cells.free(req.cell_base, req.cell_count);
        }
        Some(req)
    }

    fn submit(&mut self, op: BlockOp, id: u32) -> bool {
        let Some(req) = self.requests.get(id) else {
            return false;
        };
        let cmd = BlockCommand {
            op,
            data_offset: self.cell_offset(req.cell_base),
            block_number: req.block_number,
            count: req.cell_count as u16,
            id,
        };
        match self.backend.enqueue_request(cmd) {
            Ok(()) => {
                log::debug!("virtio-blk: -> {:?}", cmd);
                true
            }
            Err(e) => {
                log::warn!("virtio-blk: cannot submit request {}: {}", id, e);
                false
            }
        }
    }

    // ── Data movement ───────────────────────────────────────────────

    /// Data region -> request body
    fn copy_to_guest(&self, mem: &mut dyn GuestMemory, chain: &DescChain, data_offset: u64, len: u64) -> Result<()> {
        let mut buf = [0u8; COPY_CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(COPY_CHUNK as u64) as usize;
            self.backend.read_data(data_offset + done, &mut buf[..n])?;
            chain.write_at(mem, BLK_HEADER_SIZE + done, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// Request body -> data region
    fn copy_from_guest(&mut self, mem: &dyn GuestMemory, chain: &DescChain, data_offset: u64, len: u64) -> Result<()> {
        let mut buf = [0u8; COPY_CHUNK];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(COPY_CHUNK as u64) as usize;
            chain.read_at(mem, BLK_HEADER_SIZE + done, &mut buf[..n])?;
            self.backend.write_data(data_offset + done, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    // ── Backend side ────────────────────────────────────────────────

    fn handle_response(&mut self, ctx: &mut VirtioContext<'_>, resp: BlockResponse, progress: &mut Progress) {
        let Some(req) = self.requests.get(resp.id).copied() else {
            log::warn!("virtio-blk: response for unknown request {}", resp.id);
            return;
        };
        log::debug!("virtio-blk: <- {:?} ({:?})", resp, req.state);
        if req.orphaned {
            self.release(resp.id);
            if req.state.is_write() {
                self.run_queued_writes(ctx, progress);
            }
            return;
        }
        let ok = resp.status == BlockStatus::Ok;

        match req.state {
            RequestState::Reading => {
                let status = if ok { self.read_done(ctx, &req) } else { VIRTIO_BLK_S_IOERR };
                self.finish(ctx, resp.id, status);
                progress.completed = true;
            }
            RequestState::WritingAligned | RequestState::RmwWriting | RequestState::Flushing => {
                let status = if ok { VIRTIO_BLK_S_OK } else { VIRTIO_BLK_S_IOERR };
                self.finish(ctx, resp.id, status);
                progress.completed = true;
                if req.state.is_write() {
                    self.run_queued_writes(ctx, progress);
                }
            }
            RequestState::RmwReading => {
                if ok && self.rmw_write_back(ctx, resp.id, &req) {
                    progress.submitted = true;
                    progress.rmw_started = true;
                } else {
                    self.finish(ctx, resp.id, VIRTIO_BLK_S_IOERR);
                    progress.completed = true;
                    self.run_queued_writes(ctx, progress);
                }
            }
            RequestState::RmwQueueing | RequestState::WriteQueueing => {
                log::warn!("virtio-blk: response for request {} that was never submitted", resp.id);
            }
        }
    }

    fn read_done(&mut self, ctx: &mut VirtioContext<'_>, req: &Reqbk) -> u8 {
        let data_offset = self.cell_offset(req.cell_base) + req.window_offset;
        let copied = match request_chain(ctx, req.desc_head) {
            Ok(chain) => self.copy_to_guest(&mut *ctx.mem, &chain, data_offset, req.body_size as u64),
            Err(e) => Err(e.into()),
        };
        match copied {
            Ok(()) => VIRTIO_BLK_S_OK,
            Err(e) => {
                log::warn!("virtio-blk: read {}: {}", req.desc_head, e);
                VIRTIO_BLK_S_IOERR
            }
        }
    }

    /// Lay the guest's bytes over the windows just read and write them back.
    fn rmw_write_back(&mut self, ctx: &mut VirtioContext<'_>, id: u32, req: &Reqbk) -> bool {
        let data_offset = self.cell_offset(req.cell_base) + req.window_offset;
        let chain = match request_chain(ctx, req.desc_head) {
            Ok(chain) => chain,
            Err(e) => {
                log::warn!("virtio-blk: read-modify-write {}: {}", id, e);
                return false;
            }
        };
        if let Err(e) = self.copy_from_guest(&*ctx.mem, &chain, data_offset, req.body_size as u64) {
            log::warn!("virtio-blk: read-modify-write {}: {}", id, e);
            return false;
        }
        if let Some(r) = self.requests.get_mut(id) {
            r.state = RequestState::RmwWriting;
        }
        self.submit(BlockOp::Write, id)
    }

    /// Start every queued write that no earlier write blocks, oldest first.
    fn run_queued_writes(&mut self, ctx: &mut VirtioContext<'_>, progress: &mut Progress) {
        while let Some(id) = self.requests.next_runnable_write() {
            let Some(req) = self.requests.get_mut(id) else {
                break;
            };
            // Whole-window writes already hold the guest's data in their cells
            let op = if req.state == RequestState::WriteQueueing {
                req.state = RequestState::WritingAligned;
                BlockOp::Write
            } else {
                req.state = RequestState::RmwReading;
                BlockOp::Read
            };
            if self.submit(op, id) {
                log::debug!("virtio-blk: request {} no longer blocked", id);
                progress.submitted = true;
            } else {
                self.finish(ctx, id, VIRTIO_BLK_S_IOERR);
                progress.completed = true;
            }
        }
    }

    /// Final completion: free resources, write status, return the chain.
    fn finish(&mut self, ctx: &mut VirtioContext<'_>, id: u32, status: u8) {
        let Some(req) = self.release(id) else {
            return;
        };
        let used_len = if status == VIRTIO_BLK_S_OK && req.state == RequestState::Reading {
            req.body_size + 1
        } else {
            1
        };
        match request_chain(ctx, req.desc_head) {
            Ok(chain) => complete_chain(ctx, &chain, status, used_len),
            Err(e) => log::warn!("virtio-blk: request {} finished without its chain: {}", id, e),
        }
    }

    fn signal(&self, ctx: &mut VirtioContext<'_>, progress: &Progress) {
        if progress.completed {
            ctx.notify_used();
        }
        if progress.submitted {
            ctx.notify_backend(self.channel);
        }
    }

    fn features(&self) -> u64 {
        let mut features = VIRTIO_F_VERSION_1 | VIRTIO_BLK_F_FLUSH | VIRTIO_BLK_F_BLK_SIZE;
        if self.info.read_only {
            features |= VIRTIO_BLK_F_RO;
        }
        features
    }

    fn config_space(&self) -> [u8; CONFIG_SIZE] {
        let mut cfg = [0u8; CONFIG_SIZE];
        cfg[CONFIG_CAPACITY..CONFIG_CAPACITY + 8].copy_from_slice(&self.info.capacity_sectors().to_le_bytes());
        cfg[CONFIG_BLK_SIZE..CONFIG_BLK_SIZE + 4].copy_from_slice(&self.info.sector_size.to_le_bytes());
        cfg
    }
}

/// Re-walk a request's chain from the queue. A well-behaved guest leaves
/// in-flight chains alone; a chain rewritten since submission is used as is.
fn request_chain(ctx: &VirtioContext<'_>, head: u16) -> Result<DescChain, QueueError> {
    let queue = ctx.regs.queue(REQUEST_QUEUE).ok_or(QueueError::NotReady)?;
    if !queue.ready() {
        return Err(QueueError::NotReady);
    }
    queue.read_chain(&*ctx.mem, head)
}

fn push_used(ctx: &mut VirtioContext<'_>, head: u16, len: u32) {
    let Some(queue) = ctx.regs.queue_mut(REQUEST_QUEUE) else {
        return;
    };
    if let Err(e) = queue.push_used(&mut *ctx.mem, head, len) {
        log::warn!("virtio-blk: cannot return request {}: {}", head, e);
    }
}

/// Write the status footer and return the chain to the guest.
fn complete_chain(ctx: &mut VirtioContext<'_>, chain: &DescChain, status: u8, used_len: u32) {
    // The guest may have rewritten an in-flight chain down to nothing
    let Some(footer) = chain.total_len().checked_sub(1) else {
        log::warn!("virtio-blk: request {} lost its status byte", chain.head);
        push_used(ctx, chain.head, 0);
        return;
    };
    if let Err(e) = chain.write_at(&mut *ctx.mem, footer, &[status]) {
        log::warn!("virtio-blk: cannot write status of request {}: {}", chain.head, e);
    }
    push_used(ctx, chain.head, used_len);
}

impl<B: BlockBackend> VirtioDevice for VirtioBlk<B> {
    fn device_id(&self) -> u32 {
        VIRTIO_ID_BLOCK
    }

    fn num_queues(&self) -> u16 {
        1
    }

    /// Requests still at the backend keep their resources until the backend
    /// answers; the answer is then dropped. Queued writes never
    /// reached the backend and are released here.
    fn device_reset(&mut self) {
        if self.requests.in_flight() == 0 {
            return;
        }
        log::warn!(
            "virtio-blk: reset with {} requests in flight; their completions are dropped",
            self.requests.in_flight()
        );
        for id in 0..BLK_MAX_REQUESTS as u32 {
            let Some(req) = self.requests.get_mut(id) else {
                continue;
            };
            if req.state.is_queued() {
                self.release(id);
            } else {
                req.orphaned = true;
            }
        }
    }

    fn device_features(&self, sel: u32) -> Option<u32> {
        match sel {
            0 => Some(self.features() as u32),
            1 => Some((self.features() >> 32) as u32),
            _ => None,
        }
    }

    fn config_read(&self, offset: u64, size: u8) -> Result<u64, VirtioError> {
        if !matches!(size, 1 | 2 | 4 | 8) {
            return Err(VirtioError::AccessWidth { offset, size });
        }
        let start = offset as usize;
        let end = start + size as usize;
        if end > CONFIG_SIZE {
            return Err(VirtioError::UnknownRegister(offset));
        }
        let mut value = [0u8; 8];
        value[..size as usize].copy_from_slice(&self.config_space()[start..end]);
        Ok(u64::from_le_bytes(value))
    }

    fn config_write(&mut self, offset: u64, _value: u64, _size: u8) -> Result<(), VirtioError> {
        Err(VirtioError::ReadOnly(offset))
    }

    fn queue_notify(&mut self, ctx: &mut VirtioContext<'_>, queue: u16) {
        if queue as usize != REQUEST_QUEUE {
            log::warn!("virtio-blk: notify on unknown queue {}", queue);
            return;
        }
        let mut progress = Progress::default();
        self.process_queue(ctx, &mut progress);
        self.signal(ctx, &progress);
    }

    fn backend_notified(&mut self, ctx: &mut VirtioContext<'_>) {
        let mut progress = Progress::default();
        while let Some(resp) = self.backend.dequeue_response() {
            self.handle_response(ctx, resp, &mut progress);
        }
        if !progress.rmw_started {
            self.process_queue(ctx, &mut progress);
        }
        self.signal(ctx, &progress);
    }

    fn backend_channel(&self) -> Option<u32> {
        Some(self.channel)
    }
}
