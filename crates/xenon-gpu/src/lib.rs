//! Xenos GPU register file, EDRAM side-band, and PM4 command processor.

mod cp;
mod registers;

pub use cp::{CommandProcessor, RingConfig};
pub use registers::{Edram, RegisterFile};

use std::sync::Arc;

use xenon_bus::{Bus, BusDevice};
use xenon_interrupts::Iic;

const REG_EDRAM_READ_INDEX: u64 = 0x00;
const REG_EDRAM_WRITE_INDEX: u64 = 0x04;
const REG_EDRAM_DATA: u64 = 0x08;
const REG_EDRAM_STATUS: u64 = 0x0C;
const REG_FILE_BASE: u64 = 0x1000;

/// Maps the GPU's MMIO window onto the register file and EDRAM side-band,
/// so it can be registered directly on the root bus (the GPU is wired as
/// an SoC device, not behind the PCI bridge).
pub struct GpuMmio {
    pub registers: Arc<RegisterFile>,
    pub edram: Arc<Edram>,
    pub cp: Arc<CommandProcessor>,
}

impl GpuMmio {
    pub fn new(bus: Arc<Bus>, iic: Arc<Iic>) -> Self {
        let registers = Arc::new(RegisterFile::new());
        let edram = Arc::new(Edram::new());
        let cp = CommandProcessor::new(registers.clone(), bus, iic);
        Self { registers, edram, cp }
    }
}

impl BusDevice for GpuMmio {
    fn name(&self) -> &str {
        "gpu"
    }

    fn read(&self, offset: u64, width: u8) -> u64 {
        match offset {
            REG_EDRAM_DATA => self.edram.read_data() as u64,
            REG_EDRAM_STATUS => self.edram.is_busy() as u64,
            _ if offset >= REG_FILE_BASE => {
                self.registers.read(((offset - REG_FILE_BASE) / 4) as u32) as u64
            }
            _ => {
                let _ = width;
                0
            }
        }
    }

    fn write(&self, offset: u64, _width: u8, value: u64) {
        match offset {
            REG_EDRAM_READ_INDEX => self.edram.set_read_index(value as u32),
            REG_EDRAM_WRITE_INDEX => self.edram.set_write_index(value as u32),
            REG_EDRAM_DATA => self.edram.write_data(value as u32),
            _ if offset >= REG_FILE_BASE => {
                self.registers.write(((offset - REG_FILE_BASE) / 4) as u32, value as u32);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenon_mem::PhysicalMemory;

    #[test]
    fn mmio_window_routes_register_file_accesses_past_the_fixed_base() {
        let mut bus = Bus::new();
        let ram = Arc::new(PhysicalMemory::new(0x1000).unwrap());
        bus.register("dram", 0, 0xFFF, false, ram).unwrap();
        let bus = Arc::new(bus);
        let iic = Arc::new(Iic::new());
        let gpu = GpuMmio::new(bus, iic);
        gpu.write(REG_FILE_BASE + 4 * 0x20, 4, 0x1234);
        assert_eq!(gpu.read(REG_FILE_BASE + 4 * 0x20, 4), 0x1234);
    }
}
