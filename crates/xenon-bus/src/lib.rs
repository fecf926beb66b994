//! Guest-physical-address bus router.
//!
//! Maps a 64-bit guest physical address to a device handler plus a local
//! offset. Six to ten devices are registered in a running system, so a
//! linear scan beats building and maintaining an interval tree. Addresses
//! not claimed by any device read as all-ones and ignore writes.

use std::sync::Arc;

use tracing::{trace, warn};

/// A bus-addressable peer: DRAM, a PCI bridge, or a device mapped directly
/// into the physical address space. Implementations own their internal
/// mutex (if any); the bus itself never locks.
pub trait BusDevice: Send + Sync {
    fn name(&self) -> &str;

    /// `offset` is relative to the device's registered `start` address.
    fn read(&self, offset: u64, width: u8) -> u64;
    fn write(&self, offset: u64, width: u8, value: u64);

    /// Fill `len` bytes starting at `offset` with `byte`. The default
    /// implementation emulates this as a byte-wise write loop; devices for
    /// which memset is a meaningful O(region) primitive (framebuffer, NAND
    /// erase) override it.
    fn memset(&self, offset: u64, byte: u8, len: u64) {
        for i in 0..len {
            self.write(offset + i, 1, byte as u64);
        }
    }
}

impl BusDevice for xenon_mem::PhysicalMemory {
    fn name(&self) -> &str {
        "dram"
    }

    fn read(&self, offset: u64, width: u8) -> u64 {
        xenon_mem::PhysicalMemory::read(self, offset, width).unwrap_or_else(|err| {
            warn!(%err, "dram: out-of-range read");
            all_ones(width)
        })
    }

    fn write(&self, offset: u64, width: u8, value: u64) {
        if let Err(err) = xenon_mem::PhysicalMemory::write(self, offset, width, value) {
            warn!(%err, "dram: out-of-range write");
        }
    }

    fn memset(&self, offset: u64, byte: u8, len: u64) {
        if let Err(err) = xenon_mem::PhysicalMemory::memset(self, offset, byte, len) {
            warn!(%err, "dram: out-of-range memset");
        }
    }
}

struct DeviceSlot {
    name: String,
    start: u64,
    end: u64,
    is_soc: bool,
    device: Arc<dyn BusDevice>,
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("device range {start:#x}..={end:#x} for '{name}' overlaps an existing device")]
    Overlap {
        name: String,
        start: u64,
        end: u64,
    },
    #[error("device range is empty or inverted: start {start:#x} > end {end:#x}")]
    InvalidRange { start: u64, end: u64 },
}

/// Routes guest physical accesses to registered devices.
#[derive(Default)]
pub struct Bus {
    devices: Vec<DeviceSlot>,
}

impl Bus {
    pub fn new() -> Self {
        Self { devices: Vec::new() }
    }

    /// `is_soc` marks devices that are wired directly on the root bus
    /// rather than behind the PCI bridge (matches the `is_soc` flag on the
    /// device record in the data model).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        start: u64,
        end: u64,
        is_soc: bool,
        device: Arc<dyn BusDevice>,
    ) -> Result<(), BusError> {
        let name = name.into();
        if start > end {
            return Err(BusError::InvalidRange { start, end });
        }
        for slot in &self.devices {
            if start <= slot.end && slot.start <= end {
                return Err(BusError::Overlap { name, start, end });
            }
        }
        self.devices.push(DeviceSlot {
            name,
            start,
            end,
            is_soc,
            device,
        });
        Ok(())
    }

    fn find(&self, addr: u64) -> Option<&DeviceSlot> {
        self.devices
            .iter()
            .find(|slot| addr >= slot.start && addr <= slot.end)
    }

    pub fn read(&self, addr: u64, width: u8) -> u64 {
        match self.find(addr) {
            Some(slot) => slot.device.read(addr - slot.start, width),
            None => {
                trace!(addr, width, "bus: open-bus read");
                all_ones(width)
            }
        }
    }

    pub fn write(&self, addr: u64, width: u8, value: u64) {
        match self.find(addr) {
            Some(slot) => slot.device.write(addr - slot.start, width, value),
            None => warn!(addr, width, value, "bus: write to unclaimed address ignored"),
        }
    }

    pub fn memset(&self, addr: u64, byte: u8, len: u64) {
        match self.find(addr) {
            Some(slot) => slot.device.memset(addr - slot.start, byte, len),
            None => warn!(addr, len, "bus: memset of unclaimed address ignored"),
        }
    }

    pub fn device_at(&self, addr: u64) -> Option<&str> {
        self.find(addr).map(|slot| slot.name.as_str())
    }

    pub fn soc_devices(&self) -> impl Iterator<Item = &str> {
        self.devices
            .iter()
            .filter(|slot| slot.is_soc)
            .map(|slot| slot.name.as_str())
    }
}

fn all_ones(width: u8) -> u64 {
    match width {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        8 => 0xFFFF_FFFF_FFFF_FFFF,
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Recorder {
        last_write: AtomicU64,
    }

    impl BusDevice for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn read(&self, offset: u64, _width: u8) -> u64 {
            offset
        }
        fn write(&self, _offset: u64, _width: u8, value: u64) {
            self.last_write.store(value, Ordering::SeqCst);
        }
    }

    #[test]
    fn unclaimed_reads_are_all_ones_and_writes_are_ignored() {
        let bus = Bus::new();
        assert_eq!(bus.read(0x1000, 1), 0xFF);
        assert_eq!(bus.read(0x1000, 2), 0xFFFF);
        assert_eq!(bus.read(0x1000, 4), 0xFFFF_FFFF);
        assert_eq!(bus.read(0x1000, 8), 0xFFFF_FFFF_FFFF_FFFF);
        bus.write(0x1000, 4, 0x1234); // must not panic
    }

    #[test]
    fn claimed_addresses_route_to_the_device_with_a_local_offset() {
        let mut bus = Bus::new();
        let dev = Arc::new(Recorder {
            last_write: AtomicU64::new(0),
        });
        bus.register("recorder", 0x2000, 0x2FFF, true, dev.clone())
            .unwrap();

        assert_eq!(bus.read(0x2010, 1), 0x10);
        bus.write(0x2000, 4, 0xDEAD_BEEF);
        assert_eq!(dev.last_write.load(Ordering::SeqCst), 0xDEAD_BEEF);
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut bus = Bus::new();
        let dev = Arc::new(Recorder {
            last_write: AtomicU64::new(0),
        });
        bus.register("a", 0x1000, 0x1FFF, false, dev.clone()).unwrap();
        assert!(bus.register("b", 0x1800, 0x2800, false, dev).is_err());
    }

    #[test]
    fn memset_falls_back_to_a_write_loop_when_unimplemented() {
        let mut bus = Bus::new();
        let dev = Arc::new(Recorder {
            last_write: AtomicU64::new(0),
        });
        bus.register("recorder", 0x3000, 0x3FFF, false, dev.clone())
            .unwrap();
        bus.memset(0x3000, 0x7, 4);
        assert_eq!(dev.last_write.load(Ordering::SeqCst), 0x7);
    }
}
