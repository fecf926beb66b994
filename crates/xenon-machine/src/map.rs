//! Guest physical address map for windows this crate owns directly (the
//! boot ROM and the two PCI bridge windows). DRAM itself is `[0, ram_size)`
//! and is registered by the caller, not listed here.
//!
//! The boot ROM base and the boot vector derived from it come from the
//! documented reset behavior. The three window bases below are not given
//! anywhere in the retrieval pack; they're chosen to sit in the unused
//! upper half of the 64-bit guest physical space, clear of DRAM and the
//! boot ROM, and are otherwise an invented placement (see DESIGN.md).

/// Where the 1BL image is mapped at reset, and the first instruction
/// fetched from it.
pub const BOOT_ROM_BASE: u64 = 0x2000_0000_0000;
pub const BOOT_ROM_SIZE: u64 = 0x1_0000;
pub const BOOT_VECTOR: u64 = BOOT_ROM_BASE + 0x100;

pub const PCI_CONFIG_BASE: u64 = 0xD000_0000_0000;
pub const PCI_CONFIG_SIZE: u64 = 0x10_0000;

pub const PCI_MMIO_BASE: u64 = 0xD000_1000_0000;
pub const PCI_MMIO_SIZE: u64 = 0x1000_0000;

pub const GPU_MMIO_BASE: u64 = 0xD000_2000_0000;
pub const GPU_MMIO_SIZE: u64 = 0x2_0000;
