//! Secure Flash Controller for Xbox: the NAND controller. Register-driven
//! page/DMA/erase commands against a raw NAND image, with logical-to-
//! physical address translation for the 512+16 byte page/spare tiling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use xenon_interrupts::{Iic, InterruptLine};
use xenon_mem::PhysicalMemory;
use xenon_nand::{
    logical_to_physical_offset, InitSkip, NandError, NandHeader, BLOCK_SIZE_PHYS, PAGE_SIZE,
    PAGE_SIZE_PHYS, SPARE_SIZE,
};
use xenon_pci::{PciConfigSpace, PciDevice};

const SFCX_CONFIG_REG: u8 = 0x00;
const SFCX_STATUS_REG: u8 = 0x04;
const SFCX_COMMAND_REG: u8 = 0x08;
const SFCX_ADDRESS_REG: u8 = 0x0C;
const SFCX_DATA_REG: u8 = 0x10;
const SFCX_LOGICAL_REG: u8 = 0x14;
const SFCX_PHYSICAL_REG: u8 = 0x18;
const SFCX_DATAPHYADDR_REG: u8 = 0x1C;
const SFCX_SPAREPHYADDR_REG: u8 = 0x20;

const NO_CMD: u32 = 0;
const PHY_PAGE_TO_BUF: u32 = 1;
const LOG_PAGE_TO_BUF: u32 = 2;
const DMA_PHY_TO_RAM: u32 = 3;
const DMA_RAM_TO_PHY: u32 = 4;
const BLOCK_ERASE: u32 = 5;

const CONFIG_INT_EN: u32 = 1 << 4;
const CONFIG_DMA_LEN: u32 = 0x3 << 6;
const STATUS_BUSY: u32 = 1 << 0;
const STATUS_INT_CP: u32 = 1 << 1;

struct SfcxState {
    config_reg: u32,
    status_reg: u32,
    command_reg: u32,
    address_reg: u32,
    logical_reg: u32,
    physical_reg: u32,
    data_phys_addr_reg: u32,
    spare_phys_addr_reg: u32,
    page_buffer: [u8; PAGE_SIZE_PHYS as usize],
}

impl Default for SfcxState {
    fn default() -> Self {
        Self {
            config_reg: 0x0004_3000,
            status_reg: 0x0000_0600,
            command_reg: NO_CMD,
            address_reg: 0x00F7_0030,
            logical_reg: 0x0000_0100,
            physical_reg: 0x0000_0100,
            data_phys_addr_reg: 0,
            spare_phys_addr_reg: 0,
            page_buffer: [0u8; PAGE_SIZE_PHYS as usize],
        }
    }
}

pub struct Sfcx {
    config: PciConfigSpace,
    state: Mutex<SfcxState>,
    image: Mutex<Vec<u8>>,
    ram: Arc<PhysicalMemory>,
    iic: Arc<Iic>,
    pub header: NandHeader,
    pub init_skip: InitSkip,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Sfcx {
    pub fn load(
        nand_path: &std::path::Path,
        ram: Arc<PhysicalMemory>,
        iic: Arc<Iic>,
        override_skip: Option<InitSkip>,
    ) -> Result<Arc<Self>, NandError> {
        let parsed = xenon_nand::load(nand_path, override_skip)?;
        let xenon_nand::ParsedNand { image, header, init_skip, .. } = parsed;
        info!(magic = header.magic, build = header.build, "sfcx: loaded nand image");

        let image_size = image.len() as u64;
        let sfcx = Arc::new(Self {
            config: PciConfigSpace::new(0x1414, 0x580, [0x400, image_size, 0, 0, 0, 0]),
            state: Mutex::new(SfcxState::default()),
            image: Mutex::new(image),
            ram,
            iic,
            header,
            init_skip,
            running: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(None),
        });
        let handle = {
            let sfcx = sfcx.clone();
            std::thread::Builder::new()
                .name("xenon-sfcx".into())
                .spawn(move || sfcx.worker_loop())
                .expect("spawn sfcx worker")
        };
        *sfcx.worker.lock().unwrap() = Some(handle);
        Ok(sfcx)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let command = self.state.lock().unwrap().command_reg;
            if command != NO_CMD {
                match command {
                    PHY_PAGE_TO_BUF => self.read_page(true),
                    LOG_PAGE_TO_BUF => self.read_page(false),
                    DMA_PHY_TO_RAM => self.dma_from_nand(),
                    DMA_RAM_TO_PHY => self.dma_to_nand(),
                    BLOCK_ERASE => self.erase_block(),
                    other => error!(command = other, "sfcx: unrecognized command"),
                }
                let mut state = self.state.lock().unwrap();
                if state.config_reg & CONFIG_INT_EN != 0 {
                    self.iic.set_pending(InterruptLine::Sfcx);
                    state.status_reg |= STATUS_INT_CP;
                }
                state.command_reg = NO_CMD;
                state.status_reg &= !STATUS_BUSY;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn read_page(&self, physical: bool) {
        let mut state = self.state.lock().unwrap();
        let offset = logical_to_physical_offset(state.address_reg) as usize;
        let image = self.image.lock().unwrap();
        let len = if physical { PAGE_SIZE_PHYS } else { PAGE_SIZE } as usize;
        state.page_buffer[..len].copy_from_slice(&image[offset..offset + len]);
    }

    fn erase_block(&self) {
        let state = self.state.lock().unwrap();
        let offset = logical_to_physical_offset(state.address_reg) as usize;
        drop(state);
        let mut image = self.image.lock().unwrap();
        let len = BLOCK_SIZE_PHYS as usize;
        image[offset..offset + len].fill(0);
    }

    fn dma_page_count(&self, config_reg: u32) -> u32 {
        ((config_reg & CONFIG_DMA_LEN) >> 6) + 1
    }

    fn dma_from_nand(&self) {
        let (mut phys_addr, data_addr, spare_addr, pages) = {
            let state = self.state.lock().unwrap();
            (
                logical_to_physical_offset(state.address_reg),
                state.data_phys_addr_reg as u64,
                state.spare_phys_addr_reg as u64,
                self.dma_page_count(state.config_reg),
            )
        };
        let image = self.image.lock().unwrap();
        let mut data_ptr = data_addr;
        let mut spare_ptr = spare_addr;
        for _ in 0..pages {
            let page = &image[phys_addr as usize..(phys_addr + PAGE_SIZE_PHYS) as usize];
            for (i, byte) in page[..PAGE_SIZE as usize].iter().enumerate() {
                let _ = self.ram.write(data_ptr + i as u64, 1, *byte as u64);
            }
            for (i, byte) in page[PAGE_SIZE as usize..].iter().enumerate() {
                let _ = self.ram.write(spare_ptr + i as u64, 1, *byte as u64);
            }
            data_ptr += PAGE_SIZE as u64;
            spare_ptr += SPARE_SIZE as u64;
            phys_addr += PAGE_SIZE_PHYS;
        }
    }

    fn dma_to_nand(&self) {
        let (mut phys_addr, data_addr, spare_addr, pages) = {
            let state = self.state.lock().unwrap();
            (
                logical_to_physical_offset(state.address_reg),
                state.data_phys_addr_reg as u64,
                state.spare_phys_addr_reg as u64,
                self.dma_page_count(state.config_reg),
            )
        };
        let mut image = self.image.lock().unwrap();
        let mut data_ptr = data_addr;
        let mut spare_ptr = spare_addr;
        for _ in 0..pages {
            for i in 0..PAGE_SIZE as u64 {
                let byte = self.ram.read(data_ptr + i, 1).unwrap_or(0xFF) as u8;
                image[(phys_addr as u64 + i) as usize] = byte;
            }
            for i in 0..SPARE_SIZE as u64 {
                let byte = self.ram.read(spare_ptr + i, 1).unwrap_or(0xFF) as u8;
                image[(phys_addr as u64 + PAGE_SIZE as u64 + i) as usize] = byte;
            }
            data_ptr += PAGE_SIZE as u64;
            spare_ptr += SPARE_SIZE as u64;
            phys_addr += PAGE_SIZE_PHYS;
        }
    }

    /// Raw (untiled) passthrough: read `len` contiguous bytes from the NAND
    /// image ignoring the spare-area tiling, for tools that want the plain
    /// data stream rather than the page/spare layout.
    pub fn read_raw(&self, offset: u64, len: usize) -> Vec<u8> {
        let image = self.image.lock().unwrap();
        let end = (offset as usize + len).min(image.len());
        image[offset as usize..end].to_vec()
    }
}

impl Drop for Sfcx {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl PciDevice for Sfcx {
    fn name(&self) -> &str {
        "sfcx"
    }

    fn config_space(&self) -> &PciConfigSpace {
        &self.config
    }

    fn bar_read(&self, bar: usize, offset: u64, width: u8) -> u64 {
        if bar == 1 {
            let image = self.image.lock().unwrap();
            let off = offset as usize;
            let mut buf = [0u8; 8];
            let n = (width as usize).min(8);
            if off + n <= image.len() {
                buf[..n].copy_from_slice(&image[off..off + n]);
            }
            return u64::from_le_bytes(buf) & width_mask(width);
        }
        let state = self.state.lock().unwrap();
        let value = match offset as u8 {
            SFCX_CONFIG_REG => state.config_reg,
            SFCX_STATUS_REG => state.status_reg,
            SFCX_COMMAND_REG => state.command_reg,
            SFCX_ADDRESS_REG => state.address_reg,
            SFCX_DATA_REG => 0,
            SFCX_LOGICAL_REG => state.logical_reg,
            SFCX_PHYSICAL_REG => state.physical_reg,
            SFCX_DATAPHYADDR_REG => state.data_phys_addr_reg,
            SFCX_SPAREPHYADDR_REG => state.spare_phys_addr_reg,
            other => {
                warn!(reg = other, "sfcx: read of unknown register");
                0
            }
        };
        value as u64 & width_mask(width)
    }

    fn bar_write(&self, bar: usize, offset: u64, width: u8, value: u64) {
        if bar == 1 {
            return; // NAND image BAR is read-only from the guest's side.
        }
        let value = (value & width_mask(width)) as u32;
        let mut state = self.state.lock().unwrap();
        match offset as u8 {
            SFCX_CONFIG_REG => state.config_reg = value,
            SFCX_STATUS_REG => state.status_reg = value,
            SFCX_COMMAND_REG => {
                state.command_reg = value;
                state.status_reg |= STATUS_BUSY;
            }
            SFCX_ADDRESS_REG => state.address_reg = value,
            SFCX_LOGICAL_REG => state.logical_reg = value,
            SFCX_PHYSICAL_REG => state.physical_reg = value,
            SFCX_DATAPHYADDR_REG => state.data_phys_addr_reg = value,
            SFCX_SPAREPHYADDR_REG => state.spare_phys_addr_reg = value,
            other => warn!(reg = other, value, "sfcx: write to unknown register"),
        }
    }
}

fn width_mask(width: u8) -> u64 {
    match width {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_image() -> Vec<u8> {
        let mut image = vec![0u8; (PAGE_SIZE_PHYS as usize) * 40];
        image[0] = 0xFF;
        image[1] = 0x4F; // retail magic
        image[8..12].copy_from_slice(&42u32.to_be_bytes()); // entry
        // CB_A header at the tiled offset for `entry`
        let cba_off = logical_to_physical_offset(42) as usize;
        image[cba_off..cba_off + 4].copy_from_slice(&6723u32.to_be_bytes());
        image[cba_off + 4..cba_off + 8].copy_from_slice(&0x100u32.to_be_bytes()); // length
        let cbb_off = logical_to_physical_offset(42 + 0x100) as usize;
        image[cbb_off..cbb_off + 4].copy_from_slice(&6723u32.to_be_bytes());
        image
    }

    #[test]
    fn loading_an_image_exposes_the_resolved_init_skip() {
        let dir = std::env::temp_dir().join(format!("xenon-sfcx-test-{}", std::process::id()));
        std::fs::write(&dir, make_image()).unwrap();
        let ram = Arc::new(PhysicalMemory::new(0x1000).unwrap());
        let iic = Arc::new(Iic::new());
        let sfcx = Sfcx::load(&dir, ram, iic, None).unwrap();
        assert_eq!(sfcx.init_skip.addr_1, 0x0300_9B10);
        sfcx.stop();
        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn dma_phy_to_ram_copies_a_page_split_into_data_and_spare() {
        let dir = std::env::temp_dir().join(format!("xenon-sfcx-dma-{}", std::process::id()));
        std::fs::write(&dir, make_image()).unwrap();
        let ram = Arc::new(PhysicalMemory::new(0x2000).unwrap());
        let iic = Arc::new(Iic::new());
        let sfcx = Sfcx::load(&dir, ram.clone(), iic, None).unwrap();

        sfcx.bar_write(0, SFCX_ADDRESS_REG as u64, 4, 0);
        sfcx.bar_write(0, SFCX_DATAPHYADDR_REG as u64, 4, 0x1000);
        sfcx.bar_write(0, SFCX_SPAREPHYADDR_REG as u64, 4, 0x1800);
        sfcx.bar_write(0, SFCX_COMMAND_REG as u64, 4, DMA_PHY_TO_RAM as u64);
        std::thread::sleep(std::time::Duration::from_millis(20));

        let status = sfcx.bar_read(0, SFCX_STATUS_REG as u64, 4) as u32;
        assert_eq!(status & STATUS_BUSY, 0);
        sfcx.stop();
        std::fs::remove_file(&dir).ok();
    }
}
