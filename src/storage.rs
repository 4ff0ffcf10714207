//! Storage backend protocol.
//!
//! The block device talks to a separate storage service through a command
//! queue, a response queue and a shared data region. Both queues are
//! fire-and-forget: commands are enqueued, the backend is notified over its
//! channel, and responses are collected when the backend notifies back.

use crate::error::StorageError;

/// Length of the device serial string
pub const SERIAL_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
}

/// One command on the backend queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCommand {
    pub op: BlockOp,
    /// Byte offset into the shared data region
    pub data_offset: u64,
    /// First transfer window
    pub block_number: u64,
    /// Number of transfer windows
    pub count: u16,
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Ok,
    IoError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockResponse {
    pub status: BlockStatus,
    /// Windows actually transferred
    pub success_count: u16,
    pub id: u32,
}

/// Geometry and identity published by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageInfo {
    pub serial: [u8; SERIAL_LEN],
    pub read_only: bool,
    /// Guest-visible sector size in bytes
    pub sector_size: u32,
    /// Backend transfer window in bytes
    pub transfer_size: u32,
    /// Size of the disk in transfer windows
    pub capacity: u64,
}

impl StorageInfo {
    pub fn sectors_per_window(&self) -> u64 {
        (self.transfer_size / self.sector_size) as u64
    }

    /// Disk size in sectors, as reported to the guest.
    pub fn capacity_sectors(&self) -> u64 {
        self.capacity * self.sectors_per_window()
    }
}

/// Client side of a storage backend.
pub trait BlockBackend {
    fn info(&self) -> StorageInfo;

    fn request_queue_full(&self) -> bool;

    /// Place a command on the request queue. Does not notify the backend.
    fn enqueue_request(&mut self, cmd: BlockCommand) -> Result<(), StorageError>;

    /// Take the next completed response, if any.
    fn dequeue_response(&mut self) -> Option<BlockResponse>;

    /// Copy out of the shared data region.
    fn read_data(&self, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Copy into the shared data region.
    fn write_data(&mut self, offset: u64, buf: &[u8]) -> Result<(), StorageError>;

    /// Size of the shared data region in bytes.
    fn data_region_size(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_in_sectors() {
        let info = StorageInfo {
            serial: [0; SERIAL_LEN],
            read_only: false,
            sector_size: 512,
            transfer_size: 4096,
            capacity: 16,
        };
        assert_eq!(info.sectors_per_window(), 8);
        assert_eq!(info.capacity_sectors(), 128);
    }
}
