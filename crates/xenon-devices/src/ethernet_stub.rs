//! Minimal BAR-conformant stubs for EHCI, ethernet, audio, and XMA. These
//! answer config-space probing and accept reads/writes without modeling
//! any functional behavior, per the spec's explicit non-goal for these
//! subsystems.

use std::sync::Mutex;

use xenon_pci::{PciConfigSpace, PciDevice};

macro_rules! stub_device {
    ($name:ident, $display:expr, $vendor:expr, $device:expr, $bar0_size:expr) => {
        pub struct $name {
            config: PciConfigSpace,
            scratch: Mutex<Vec<u8>>,
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    config: PciConfigSpace::new($vendor, $device, [$bar0_size, 0, 0, 0, 0, 0]),
                    scratch: Mutex::new(vec![0u8; $bar0_size as usize]),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl PciDevice for $name {
            fn name(&self) -> &str {
                $display
            }

            fn config_space(&self) -> &PciConfigSpace {
                &self.config
            }

            fn bar_read(&self, _bar: usize, offset: u64, width: u8) -> u64 {
                let scratch = self.scratch.lock().unwrap();
                let off = offset as usize;
                let mut buf = [0u8; 8];
                let n = (width as usize).min(8).min(scratch.len().saturating_sub(off));
                if n > 0 {
                    buf[..n].copy_from_slice(&scratch[off..off + n]);
                }
                u64::from_le_bytes(buf)
            }

            fn bar_write(&self, _bar: usize, offset: u64, width: u8, value: u64) {
                let mut scratch = self.scratch.lock().unwrap();
                let off = offset as usize;
                if off + width as usize <= scratch.len() {
                    scratch[off..off + width as usize]
                        .copy_from_slice(&value.to_le_bytes()[..width as usize]);
                }
            }
        }
    };
}

stub_device!(EhciStub, "ehci", 0x1033, 0x00E0, 0x1000);
stub_device!(EthernetStub, "ethernet", 0x1414, 0x580B, 0x1000);
stub_device!(AudioStub, "audio", 0x1414, 0x580D, 0x1000);
stub_device!(XmaStub, "xma", 0x1414, 0x580E, 0x1000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_bar_write_is_observable_on_read_back() {
        let dev = EthernetStub::new();
        dev.bar_write(0, 0x10, 4, 0xDEAD_BEEF);
        assert_eq!(dev.bar_read(0, 0x10, 4), 0xDEAD_BEEF);
    }
}
