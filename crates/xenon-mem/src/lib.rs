//! Flat guest-physical DRAM arena.
//!
//! Storage is a single contiguously-allocated, pointer-stable byte buffer.
//! Multi-byte accesses are big-endian, matching the PowerPC default
//! endianness the rest of the core assumes for guest DRAM (see the bus
//! router in `xenon-bus`, which is the only other place width-generic
//! accesses happen).

use std::sync::Arc;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address {addr:#x} with width {width} is out of bounds for a {size:#x}-byte arena")]
    OutOfBounds { addr: u64, width: u8, size: usize },
    #[error("ram size {0:#x} is not a multiple of the page size (0x1000)")]
    UnalignedSize(u64),
}

/// Guest physical DRAM. Cheap to clone (shares the backing allocation);
/// the backing `Vec<u8>` never reallocates after construction so raw
/// pointers handed out to DMA peers stay valid for the arena's lifetime.
#[derive(Clone)]
pub struct PhysicalMemory {
    inner: Arc<RwLock<Vec<u8>>>,
    size: usize,
}

impl PhysicalMemory {
    /// `size` is typically 512 MiB or 1 GiB (see spec RAM_SIZE).
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        if size == 0 || size % 0x1000 != 0 {
            return Err(MemoryError::UnalignedSize(size));
        }
        Ok(Self {
            inner: Arc::new(RwLock::new(vec![0u8; size as usize])),
            size: size as usize,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check(&self, addr: u64, width: u8) -> Result<usize, MemoryError> {
        let start = addr as usize;
        let end = start.checked_add(width as usize);
        match end {
            Some(end) if end <= self.size => Ok(start),
            _ => Err(MemoryError::OutOfBounds {
                addr,
                width,
                size: self.size,
            }),
        }
    }

    pub fn read(&self, addr: u64, width: u8) -> Result<u64, MemoryError> {
        let start = self.check(addr, width)?;
        let buf = self.inner.read().unwrap();
        let mut value: u64 = 0;
        for i in 0..width as usize {
            value = (value << 8) | buf[start + i] as u64;
        }
        Ok(value)
    }

    pub fn write(&self, addr: u64, width: u8, value: u64) -> Result<(), MemoryError> {
        let start = self.check(addr, width)?;
        let mut buf = self.inner.write().unwrap();
        for i in 0..width as usize {
            let shift = 8 * (width as usize - 1 - i);
            buf[start + i] = ((value >> shift) & 0xFF) as u8;
        }
        Ok(())
    }

    pub fn memset(&self, addr: u64, byte: u8, len: u64) -> Result<(), MemoryError> {
        let start = self.check(addr, len.min(u8::MAX as u64).max(1) as u8)?;
        // `check` above only validates the first byte's width class; re-verify
        // the whole run explicitly since `len` can exceed u8::MAX.
        let end = start
            .checked_add(len as usize)
            .filter(|&e| e <= self.size)
            .ok_or(MemoryError::OutOfBounds {
                addr,
                width: 0,
                size: self.size,
            })?;
        let mut buf = self.inner.write().unwrap();
        buf[start..end].fill(byte);
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, out: &mut [u8]) -> Result<(), MemoryError> {
        let start = addr as usize;
        let end = start
            .checked_add(out.len())
            .filter(|&e| e <= self.size)
            .ok_or(MemoryError::OutOfBounds {
                addr,
                width: 0,
                size: self.size,
            })?;
        let buf = self.inner.read().unwrap();
        out.copy_from_slice(&buf[start..end]);
        Ok(())
    }

    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let start = addr as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&e| e <= self.size)
            .ok_or(MemoryError::OutOfBounds {
                addr,
                width: 0,
                size: self.size,
            })?;
        let mut buf = self.inner.write().unwrap();
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Raw pointer access for DMA-capable device peers (SFCX, HDD, OHCI).
    /// The returned pointer is valid for `size() - addr` bytes and stays
    /// valid for the lifetime of this `PhysicalMemory` handle (the backing
    /// allocation is never resized or moved after `new`).
    pub fn raw_ptr(&self, addr: u64) -> Result<*mut u8, MemoryError> {
        let start = self.check(addr, 0)?;
        let mut buf = self.inner.write().unwrap();
        Ok(unsafe { buf.as_mut_ptr().add(start) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_width() {
        let ram = PhysicalMemory::new(0x1000).unwrap();
        for width in [1u8, 2, 4, 8] {
            let addr = 0x100;
            let value = 0x0123_4567_89AB_CDEFu64 & ((1u128 << (width as u32 * 8)) - 1) as u64;
            ram.write(addr, width, value).unwrap();
            assert_eq!(ram.read(addr, width).unwrap(), value);
        }
    }

    #[test]
    fn eight_byte_write_is_big_endian_in_storage() {
        let ram = PhysicalMemory::new(0x1000).unwrap();
        ram.write(0, 8, 0x0123_4567_89AB_CDEF).unwrap();
        let mut bytes = [0u8; 8];
        ram.read_bytes(0, &mut bytes).unwrap();
        assert_eq!(bytes, [0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let ram = PhysicalMemory::new(0x1000).unwrap();
        assert!(ram.read(0x1000, 4).is_err());
        assert!(ram.write(0xFF8, 8, 1).is_err());
    }

    #[test]
    fn memset_fills_region() {
        let ram = PhysicalMemory::new(0x1000).unwrap();
        ram.memset(0x10, 0xAB, 16).unwrap();
        let mut bytes = [0u8; 16];
        ram.read_bytes(0x10, &mut bytes).unwrap();
        assert_eq!(bytes, [0xAB; 16]);
    }
}
