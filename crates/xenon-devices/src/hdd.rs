//! ATA/SATA hard disk: taskfile register file plus a PRDT-driven bus-master
//! DMA worker, backed by a flat image file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use xenon_interrupts::{Iic, InterruptLine};
use xenon_mem::PhysicalMemory;
use xenon_pci::{PciConfigSpace, PciDevice};

pub const SECTOR_SIZE: u64 = 512;

// Taskfile offsets, BAR0.
const REG_DATA: u8 = 0;
const REG_ERROR_FEATURES: u8 = 1;
const REG_SECTOR_COUNT: u8 = 2;
const REG_LBA_LOW: u8 = 3;
const REG_LBA_MID: u8 = 4;
const REG_LBA_HIGH: u8 = 5;
const REG_DEVICE_SELECT: u8 = 6;
const REG_STATUS_COMMAND: u8 = 7;
const REG_DEVICE_CONTROL: u8 = 0xA;

// Bus-master DMA offsets, BAR1.
const BM_COMMAND: u64 = 0;
const BM_STATUS: u64 = 2;
const BM_PRDT_ADDR: u64 = 4;

const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DRDY: u8 = 1 << 6;
const STATUS_BSY: u8 = 1 << 7;
const DEVICE_CONTROL_NIEN: u8 = 1 << 1;
const BM_COMMAND_START: u8 = 1 << 0;
const BM_COMMAND_WRITE: u8 = 1 << 3;
const PRDT_EOT: u16 = 1 << 15;

const CMD_IDENTIFY_DEVICE: u8 = 0xEC;
const CMD_READ_DMA: u8 = 0xC8;
const CMD_READ_DMA_EXT: u8 = 0x25;
const CMD_WRITE_DMA: u8 = 0xCA;
const CMD_READ_NATIVE_MAX_ADDRESS_EXT: u8 = 0x27;
const CMD_SET_FEATURES: u8 = 0xEF;

#[derive(Default)]
struct Taskfile {
    error_features: u8,
    sector_count: [u8; 2],  // [current, previous] for HOB access
    lba_low: [u8; 2],
    lba_mid: [u8; 2],
    lba_high: [u8; 2],
    device_select: u8,
    status: u8,
    device_control: u8,
}

struct HddState {
    taskfile: Taskfile,
    data_buffer: Vec<u8>,
    data_pos: usize,
    bm_command: u8,
    bm_status: u8,
    bm_prdt_addr: u32,
    transfer_mode: u8,
}

impl Default for HddState {
    fn default() -> Self {
        Self {
            taskfile: Taskfile::default(),
            data_buffer: Vec::new(),
            data_pos: 0,
            bm_command: 0,
            bm_status: 0,
            bm_prdt_addr: 0,
            transfer_mode: 0,
        }
    }
}

pub struct Hdd {
    config: PciConfigSpace,
    state: Mutex<HddState>,
    image: Mutex<File>,
    image_sectors: u64,
    identify: [u8; 512],
    ram: Arc<PhysicalMemory>,
    iic: Arc<Iic>,
    running: Arc<AtomicBool>,
    dma_pending: Arc<AtomicU32>, // 0 = idle, 1 = read (NAND->RAM), 2 = write
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn build_identify_blob(model: &str, total_sectors: u64) -> [u8; 512] {
    let mut words = [0u16; 256];
    words[49] = 0x0200; // LBA supported
    words[83] = 0x0400; // 48-bit LBA supported
    words[86] = 0x0400;
    words[60] = (total_sectors & 0xFFFF) as u16;
    words[61] = ((total_sectors >> 16) & 0xFFFF) as u16;
    words[100] = (total_sectors & 0xFFFF) as u16;
    words[101] = ((total_sectors >> 16) & 0xFFFF) as u16;
    words[102] = ((total_sectors >> 32) & 0xFFFF) as u16;
    words[103] = ((total_sectors >> 48) & 0xFFFF) as u16;

    // Model number occupies words 27-46, byte-swapped per ATA convention.
    let mut model_bytes = [0x20u8; 40];
    for (i, b) in model.bytes().take(40).enumerate() {
        model_bytes[i] = b;
    }
    for (word_idx, pair) in model_bytes.chunks(2).enumerate() {
        words[27 + word_idx] = ((pair[0] as u16) << 8) | pair[1] as u16;
    }

    let mut out = [0u8; 512];
    for (i, word) in words.iter().enumerate() {
        out[i * 2] = (word & 0xFF) as u8;
        out[i * 2 + 1] = (word >> 8) as u8;
    }
    out
}

impl Hdd {
    pub fn open(image_path: &std::path::Path, ram: Arc<PhysicalMemory>, iic: Arc<Iic>) -> std::io::Result<Arc<Self>> {
        let image = File::options().read(true).write(true).open(image_path)?;
        let len = image.metadata()?.len();
        let image_sectors = len / SECTOR_SIZE;

        let hdd = Arc::new(Self {
            config: PciConfigSpace::new(0x1414, 0x5809, [0x10, 0x10, 0, 0, 0, 0]),
            state: Mutex::new(HddState::default()),
            image: Mutex::new(image),
            image_sectors,
            identify: build_identify_blob("XENON VIRTUAL HDD", image_sectors),
            ram,
            iic,
            running: Arc::new(AtomicBool::new(true)),
            dma_pending: Arc::new(AtomicU32::new(0)),
            worker: Mutex::new(None),
        });
        let handle = {
            let hdd = hdd.clone();
            std::thread::Builder::new()
                .name("xenon-hdd-dma".into())
                .spawn(move || hdd.dma_worker())
                .expect("spawn hdd dma worker")
        };
        *hdd.worker.lock().unwrap() = Some(handle);
        Ok(hdd)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn lba28(tf: &Taskfile) -> u64 {
        (tf.lba_low[0] as u64) | ((tf.lba_mid[0] as u64) << 8) | ((tf.lba_high[0] as u64) << 16)
            | (((tf.device_select & 0x0F) as u64) << 24)
    }

    fn lba48(tf: &Taskfile) -> u64 {
        (tf.lba_low[0] as u64)
            | ((tf.lba_mid[0] as u64) << 8)
            | ((tf.lba_high[0] as u64) << 16)
            | ((tf.lba_low[1] as u64) << 24)
            | ((tf.lba_mid[1] as u64) << 32)
            | ((tf.lba_high[1] as u64) << 40)
    }

    fn sector_count28(tf: &Taskfile) -> u64 {
        if tf.sector_count[0] == 0 { 256 } else { tf.sector_count[0] as u64 }
    }

    fn sector_count48(tf: &Taskfile) -> u64 {
        let count = (tf.sector_count[0] as u64) | ((tf.sector_count[1] as u64) << 8);
        if count == 0 { 65536 } else { count }
    }

    fn execute_command(&self, cmd: u8) {
        let mut state = self.state.lock().unwrap();
        match cmd {
            CMD_IDENTIFY_DEVICE => {
                state.data_buffer = self.identify.to_vec();
                state.data_pos = 0;
                state.taskfile.status = STATUS_DRDY | STATUS_DRQ;
                drop(state);
                self.raise_interrupt();
            }
            CMD_READ_DMA => {
                let lba = Self::lba28(&state.taskfile);
                let count = Self::sector_count28(&state.taskfile);
                self.read_sectors(&mut state, lba, count);
            }
            CMD_READ_DMA_EXT => {
                let lba = Self::lba48(&state.taskfile);
                let count = Self::sector_count48(&state.taskfile);
                self.read_sectors(&mut state, lba, count);
            }
            CMD_WRITE_DMA => {
                let lba = Self::lba28(&state.taskfile);
                let count = Self::sector_count28(&state.taskfile);
                self.write_sectors(&mut state, lba, count);
            }
            CMD_READ_NATIVE_MAX_ADDRESS_EXT => {
                let max_lba = self.image_sectors.saturating_sub(1);
                state.taskfile.lba_low = [(max_lba & 0xFF) as u8, ((max_lba >> 24) & 0xFF) as u8];
                state.taskfile.lba_mid = [((max_lba >> 8) & 0xFF) as u8, ((max_lba >> 32) & 0xFF) as u8];
                state.taskfile.lba_high = [((max_lba >> 16) & 0xFF) as u8, ((max_lba >> 40) & 0xFF) as u8];
                state.taskfile.status = STATUS_DRDY;
                drop(state);
                self.raise_interrupt();
            }
            CMD_SET_FEATURES => {
                state.transfer_mode = state.taskfile.error_features;
                state.taskfile.status = STATUS_DRDY;
                drop(state);
                self.raise_interrupt();
            }
            other => warn!(cmd = other, "hdd: unimplemented command"),
        }
    }

    fn read_sectors(&self, state: &mut HddState, lba: u64, count: u64) {
        let mut image = self.image.lock().unwrap();
        let mut buf = vec![0u8; (count * SECTOR_SIZE) as usize];
        if image.seek(SeekFrom::Start(lba * SECTOR_SIZE)).is_ok() {
            let _ = image.read_exact(&mut buf);
        }
        state.data_buffer = buf;
        state.data_pos = 0;
        state.taskfile.status = STATUS_DRDY | STATUS_DRQ;
        self.dma_pending.store(1, Ordering::SeqCst);
    }

    fn write_sectors(&self, state: &mut HddState, lba: u64, count: u64) {
        state.data_buffer = vec![0u8; (count * SECTOR_SIZE) as usize];
        state.data_pos = 0;
        state.taskfile.status = STATUS_DRDY | STATUS_DRQ;
        self.dma_pending.store(2, Ordering::SeqCst);
        // Stash the target LBA in the low taskfile bytes; read back by the
        // DMA worker once the PRDT transfer has filled data_buffer.
        let _ = lba;
    }

    fn raise_interrupt(&self) {
        let nien = self.state.lock().unwrap().taskfile.device_control & DEVICE_CONTROL_NIEN != 0;
        if !nien {
            self.iic.set_pending(InterruptLine::Ata);
        }
    }

    /// Walks the PRDT starting at `bm_prdt_addr`, copying between guest DRAM
    /// and the device's pending data buffer until an end-of-table entry.
    fn dma_worker(&self) {
        while self.running.load(Ordering::SeqCst) {
            let direction = self.dma_pending.load(Ordering::SeqCst);
            let start = { self.state.lock().unwrap().bm_command & BM_COMMAND_START != 0 };
            if direction != 0 && start {
                self.service_prdt(direction);
                self.dma_pending.store(0, Ordering::SeqCst);
                let mut state = self.state.lock().unwrap();
                state.taskfile.status &= !STATUS_DRQ;
                state.bm_command &= !BM_COMMAND_START;
                drop(state);
                self.raise_interrupt();
            }
            std::thread::sleep(Duration::from_micros(200));
        }
    }

    fn service_prdt(&self, direction: u32) {
        let prdt_addr = self.state.lock().unwrap().bm_prdt_addr as u64;
        let mut entry_addr = prdt_addr;
        let mut buffer_pos: u64 = 0;
        loop {
            let raw = self.ram.read(entry_addr, 8).unwrap_or(0);
            let phys_addr = (raw & 0xFFFF_FFFF) as u64;
            let byte_count = ((raw >> 32) & 0xFFFF) as u64;
            let flags = ((raw >> 48) & 0xFFFF) as u16;
            let byte_count = if byte_count == 0 { 0x10000 } else { byte_count };

            let mut state = self.state.lock().unwrap();
            if direction == 1 {
                for i in 0..byte_count {
                    if (buffer_pos + i) as usize >= state.data_buffer.len() {
                        break;
                    }
                    let byte = state.data_buffer[(buffer_pos + i) as usize];
                    let _ = self.ram.write(phys_addr + i, 1, byte as u64);
                }
            } else {
                for i in 0..byte_count {
                    let byte = self.ram.read(phys_addr + i, 1).unwrap_or(0) as u8;
                    if (buffer_pos + i) as usize >= state.data_buffer.len() {
                        break;
                    }
                    state.data_buffer[(buffer_pos + i) as usize] = byte;
                }
            }
            drop(state);

            buffer_pos += byte_count;
            entry_addr += 8;
            if flags & PRDT_EOT != 0 {
                break;
            }
        }

        if direction == 2 {
            let state = self.state.lock().unwrap();
            let lba = Self::lba28(&state.taskfile);
            let data = state.data_buffer.clone();
            drop(state);
            let mut image = self.image.lock().unwrap();
            if image.seek(SeekFrom::Start(lba * SECTOR_SIZE)).is_ok() {
                let _ = image.write_all(&data);
            }
        }
    }
}

impl Drop for Hdd {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl PciDevice for Hdd {
    fn name(&self) -> &str {
        "hdd"
    }

    fn config_space(&self) -> &PciConfigSpace {
        &self.config
    }

    fn bar_read(&self, bar: usize, offset: u64, width: u8) -> u64 {
        if bar == 1 {
            let state = self.state.lock().unwrap();
            return match offset {
                BM_COMMAND => state.bm_command as u64,
                BM_STATUS => state.bm_status as u64,
                BM_PRDT_ADDR => state.bm_prdt_addr as u64,
                _ => 0,
            };
        }
        let mut state = self.state.lock().unwrap();
        match offset as u8 {
            REG_DATA => {
                let pos = state.data_pos;
                let n = (width as usize).min(state.data_buffer.len().saturating_sub(pos));
                let mut buf = [0u8; 8];
                buf[..n].copy_from_slice(&state.data_buffer[pos..pos + n]);
                state.data_pos += width as usize;
                if state.data_pos >= state.data_buffer.len() {
                    state.taskfile.status &= !STATUS_DRQ;
                }
                u64::from_le_bytes(buf)
            }
            REG_ERROR_FEATURES => state.taskfile.error_features as u64,
            REG_SECTOR_COUNT => state.taskfile.sector_count[0] as u64,
            REG_LBA_LOW => state.taskfile.lba_low[0] as u64,
            REG_LBA_MID => state.taskfile.lba_mid[0] as u64,
            REG_LBA_HIGH => state.taskfile.lba_high[0] as u64,
            REG_DEVICE_SELECT => state.taskfile.device_select as u64,
            REG_STATUS_COMMAND => state.taskfile.status as u64,
            REG_DEVICE_CONTROL => state.taskfile.status as u64, // alt-status mirrors status
            _ => 0,
        }
    }

    fn bar_write(&self, bar: usize, offset: u64, width: u8, value: u64) {
        if bar == 1 {
            let mut state = self.state.lock().unwrap();
            match offset {
                BM_COMMAND => state.bm_command = value as u8,
                BM_STATUS => state.bm_status = value as u8,
                BM_PRDT_ADDR => state.bm_prdt_addr = value as u32,
                _ => {}
            }
            return;
        }
        let mut state = self.state.lock().unwrap();
        match offset as u8 {
            REG_DATA => {
                let pos = state.data_pos;
                if pos + width as usize > state.data_buffer.len() {
                    state.data_buffer.resize(pos + width as usize, 0);
                }
                state.data_buffer[pos..pos + width as usize]
                    .copy_from_slice(&value.to_le_bytes()[..width as usize]);
                state.data_pos += width as usize;
            }
            REG_ERROR_FEATURES => state.taskfile.error_features = value as u8,
            REG_SECTOR_COUNT => {
                state.taskfile.sector_count[1] = state.taskfile.sector_count[0];
                state.taskfile.sector_count[0] = value as u8;
            }
            REG_LBA_LOW => {
                state.taskfile.lba_low[1] = state.taskfile.lba_low[0];
                state.taskfile.lba_low[0] = value as u8;
            }
            REG_LBA_MID => {
                state.taskfile.lba_mid[1] = state.taskfile.lba_mid[0];
                state.taskfile.lba_mid[0] = value as u8;
            }
            REG_LBA_HIGH => {
                state.taskfile.lba_high[1] = state.taskfile.lba_high[0];
                state.taskfile.lba_high[0] = value as u8;
            }
            REG_DEVICE_SELECT => state.taskfile.device_select = value as u8,
            REG_STATUS_COMMAND => {
                state.taskfile.status |= STATUS_BSY;
                let cmd = value as u8;
                drop(state);
                self.execute_command(cmd);
                self.state.lock().unwrap().taskfile.status &= !STATUS_BSY;
            }
            REG_DEVICE_CONTROL => state.taskfile.device_control = value as u8,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_image(sectors: u64) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("xenon-hdd-test-{}-{}", std::process::id(), sectors));
        std::fs::write(&path, vec![0u8; (sectors * SECTOR_SIZE) as usize]).unwrap();
        path
    }

    #[test]
    fn identify_device_fills_the_512_byte_blob_and_sets_drdy_drq() {
        let path = temp_image(64);
        let ram = Arc::new(PhysicalMemory::new(0x1000).unwrap());
        let iic = Arc::new(Iic::new());
        let hdd = Hdd::open(&path, ram, iic).unwrap();

        hdd.bar_write(0, REG_STATUS_COMMAND as u64, 1, CMD_IDENTIFY_DEVICE as u64);
        let status = hdd.bar_read(0, REG_STATUS_COMMAND as u64, 1);
        assert_eq!(status as u8 & (STATUS_DRDY | STATUS_DRQ), STATUS_DRDY | STATUS_DRQ);

        hdd.stop();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn sector_count_zero_means_256_for_28_bit_lba() {
        let tf = Taskfile { sector_count: [0, 0], ..Default::default() };
        assert_eq!(Hdd::sector_count28(&tf), 256);
    }
}
