//! Read-only 1BL boot image window, mapped directly on the root bus.

use tracing::warn;

use xenon_bus::BusDevice;

pub struct BootRom {
    image: Vec<u8>,
}

impl BootRom {
    pub fn new(image: Vec<u8>) -> Self {
        Self { image }
    }
}

impl BusDevice for BootRom {
    fn name(&self) -> &str {
        "boot-rom"
    }

    fn read(&self, offset: u64, width: u8) -> u64 {
        let start = offset as usize;
        let mut value: u64 = 0;
        for i in 0..width as usize {
            let byte = self.image.get(start + i).copied().unwrap_or(0xFF);
            value = (value << 8) | byte as u64;
        }
        value
    }

    fn write(&self, offset: u64, _width: u8, _value: u64) {
        warn!(offset, "boot-rom: ignoring write to read-only boot image");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bytes_from_the_loaded_image_big_endian() {
        let rom = BootRom::new(vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(rom.read(0, 4), 0xDEAD_BEEF);
        assert_eq!(rom.read(0, 1), 0xDE);
    }

    #[test]
    fn reads_past_the_image_end_return_all_ones() {
        let rom = BootRom::new(vec![0x01]);
        assert_eq!(rom.read(4, 1), 0xFF);
    }

    #[test]
    fn writes_are_silently_ignored() {
        let rom = BootRom::new(vec![0x00, 0x00]);
        rom.write(0, 2, 0xFFFF);
        assert_eq!(rom.read(0, 2), 0x0000);
    }
}
