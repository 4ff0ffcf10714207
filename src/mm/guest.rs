//! Guest-physical memory access.
//!
//! Every read or write the emulation core performs on guest-owned memory
//! (virtqueue rings, request buffers) and on the shared storage data region
//! goes through [`GuestMemory`]. Accesses are range checked against the
//! mapped window; a guest-supplied address outside it is a protocol
//! violation, never undefined behaviour.

use crate::error::MemoryError;

/// Byte-addressed access to a window of guest-physical (or shared) memory.
pub trait GuestMemory {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryError>;

    /// Whether `[addr, addr + len)` lies entirely inside the window.
    fn contains(&self, addr: u64, len: u64) -> bool;

    fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// A guest-physical window mapped into the VMM's own address space.
///
/// The VMM maps guest RAM (and the storage data region) at a fixed local
/// address; `MappedRegion` translates `gpa_base..gpa_base + size` onto it.
pub struct MappedRegion {
    gpa_base: u64,
    vmm_base: *mut u8,
    size: u64,
}

impl MappedRegion {
    /// # Safety
    ///
    /// `vmm_base..vmm_base + size` must be mapped read/write in the VMM for
    /// the lifetime of the region and must not alias any Rust-owned memory.
    pub const unsafe fn new(gpa_base: u64, vmm_base: *mut u8, size: u64) -> Self {
        Self { gpa_base, vmm_base, size }
    }

    pub fn gpa_base(&self) -> u64 {
        self.gpa_base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn local_offset(&self, addr: u64, len: usize) -> Result<usize, MemoryError> {
        if !self.contains(addr, len as u64) {
            return Err(MemoryError::OutOfRange { addr, len: len as u64 });
        }
        Ok((addr - self.gpa_base) as usize)
    }
}

impl GuestMemory for MappedRegion {
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let off = self.local_offset(addr, dst.len())?;
        // The guest may be writing concurrently; go byte by byte through
        // volatile reads so the compiler cannot cache or elide them.
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = unsafe { core::ptr::read_volatile(self.vmm_base.add(off + i)) };
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), MemoryError> {
        let off = self.local_offset(addr, src.len())?;
        for (i, byte) in src.iter().enumerate() {
            unsafe { core::ptr::write_volatile(self.vmm_base.add(off + i), *byte) };
        }
        Ok(())
    }

    fn contains(&self, addr: u64, len: u64) -> bool {
        match (addr.checked_sub(self.gpa_base), addr.checked_add(len)) {
            (Some(off), Some(_)) => off <= self.size && len <= self.size - off,
            _ => false,
        }
    }
}
