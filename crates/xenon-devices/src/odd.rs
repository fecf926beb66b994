//! ATAPI optical disc drive. Shares the taskfile entry point with the HDD
//! (`PACKET` instead of a direct read/write command) but the payload is a
//! SCSI command descriptor block written through the data register.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use xenon_interrupts::{Iic, InterruptLine};
use xenon_pci::{PciConfigSpace, PciDevice};

const REG_DATA: u8 = 0;
const REG_ERROR_FEATURES: u8 = 1;
const REG_INTERRUPT_REASON: u8 = 2;
const REG_BYTE_COUNT_LOW: u8 = 4;
const REG_BYTE_COUNT_HIGH: u8 = 5;
const REG_DEVICE_SELECT: u8 = 6;
const REG_STATUS_COMMAND: u8 = 7;

const STATUS_DRQ: u8 = 1 << 3;
const STATUS_DRDY: u8 = 1 << 6;

const CMD_PACKET: u8 = 0xA0;

const SCSI_INQUIRY: u8 = 0x12;
const SCSI_MODE_SENSE_10: u8 = 0x5A;
const SCSI_MODE_SELECT_10: u8 = 0x55;
const SCSI_READ_10: u8 = 0x28;
const SCSI_READ_DVD_STRUCTURE: u8 = 0xAD;
const SCSI_XBOX_SECURITY_A: u8 = 0x3B;
const SCSI_XBOX_SECURITY_B: u8 = 0x3E;

#[derive(Default)]
struct OddState {
    cdb_buffer: [u8; 12],
    cdb_pos: usize,
    awaiting_cdb: bool,
    data_buffer: Vec<u8>,
    data_pos: usize,
    status: u8,
    device_select: u8,
}

pub struct Odd {
    config: PciConfigSpace,
    state: Mutex<OddState>,
    image: Mutex<Option<Vec<u8>>>,
    iic: Arc<Iic>,
    running: Arc<AtomicBool>,
}

impl Odd {
    pub fn new(image: Option<Vec<u8>>, iic: Arc<Iic>) -> Arc<Self> {
        Arc::new(Self {
            config: PciConfigSpace::new(0x1414, 0x580A, [0x10, 0, 0, 0, 0, 0]),
            state: Mutex::new(OddState::default()),
            image: Mutex::new(image),
            iic,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn start_packet_command(&self) {
        let mut state = self.state.lock().unwrap();
        state.cdb_pos = 0;
        state.cdb_buffer = [0u8; 12];
        state.awaiting_cdb = true;
        state.status = STATUS_DRDY | STATUS_DRQ;
    }

    fn dispatch_cdb(&self) {
        let mut state = self.state.lock().unwrap();
        let cdb = state.cdb_buffer;
        match cdb[0] {
            SCSI_INQUIRY => {
                let mut buf = vec![0u8; 36];
                buf[0] = 0x05; // CD-ROM device
                buf[1] = 0x80; // removable
                buf[16..32].copy_from_slice(b"XENON ODD       ");
                state.data_buffer = buf;
            }
            SCSI_MODE_SENSE_10 => {
                state.data_buffer = vec![0u8; 8];
            }
            SCSI_MODE_SELECT_10 => {
                state.data_buffer.clear();
            }
            SCSI_READ_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as u64;
                let image = self.image.lock().unwrap();
                let mut buf = vec![0u8; (count * 2048) as usize];
                if let Some(image) = image.as_ref() {
                    let start = (lba * 2048) as usize;
                    let end = (start + buf.len()).min(image.len());
                    if start < end {
                        buf[..end - start].copy_from_slice(&image[start..end]);
                    }
                }
                state.data_buffer = buf;
            }
            SCSI_READ_DVD_STRUCTURE => {
                state.data_buffer = vec![0u8; 2048];
            }
            SCSI_XBOX_SECURITY_A | SCSI_XBOX_SECURITY_B => {
                // Disc authentication vendor pages: canned acknowledgement,
                // the real challenge/response protocol is not modeled.
                state.data_buffer = vec![0u8; 20];
            }
            other => {
                warn!(cdb_op = other, "odd: unimplemented scsi command");
                state.data_buffer.clear();
            }
        }
        state.data_pos = 0;
        state.awaiting_cdb = false;
        state.status = STATUS_DRDY | if state.data_buffer.is_empty() { 0 } else { STATUS_DRQ };
        drop(state);
        self.iic.set_pending(InterruptLine::Odd);
    }
}

impl PciDevice for Odd {
    fn name(&self) -> &str {
        "odd"
    }

    fn config_space(&self) -> &PciConfigSpace {
        &self.config
    }

    fn bar_read(&self, _bar: usize, offset: u64, width: u8) -> u64 {
        let mut state = self.state.lock().unwrap();
        match offset as u8 {
            REG_DATA => {
                let pos = state.data_pos;
                let n = (width as usize).min(state.data_buffer.len().saturating_sub(pos));
                let mut buf = [0u8; 8];
                buf[..n].copy_from_slice(&state.data_buffer[pos..pos + n]);
                state.data_pos += width as usize;
                if state.data_pos >= state.data_buffer.len() {
                    state.status &= !STATUS_DRQ;
                }
                u64::from_le_bytes(buf)
            }
            REG_STATUS_COMMAND => state.status as u64,
            REG_DEVICE_SELECT => state.device_select as u64,
            _ => 0,
        }
    }

    fn bar_write(&self, _bar: usize, offset: u64, width: u8, value: u64) {
        match offset as u8 {
            REG_DATA => {
                let mut state = self.state.lock().unwrap();
                if state.awaiting_cdb {
                    let pos = state.cdb_pos;
                    let n = (width as usize).min(12 - pos);
                    let bytes = value.to_le_bytes();
                    state.cdb_buffer[pos..pos + n].copy_from_slice(&bytes[..n]);
                    state.cdb_pos += n;
                    let complete = state.cdb_pos >= 12;
                    drop(state);
                    if complete {
                        self.dispatch_cdb();
                    }
                }
            }
            REG_ERROR_FEATURES | REG_INTERRUPT_REASON | REG_BYTE_COUNT_LOW | REG_BYTE_COUNT_HIGH => {}
            REG_DEVICE_SELECT => self.state.lock().unwrap().device_select = value as u8,
            REG_STATUS_COMMAND => {
                if value as u8 == CMD_PACKET {
                    self.start_packet_command();
                } else {
                    warn!(cmd = value as u8, "odd: unimplemented ata command");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_command_then_full_cdb_triggers_inquiry_response() {
        let iic = Arc::new(Iic::new());
        let odd = Odd::new(None, iic);
        odd.bar_write(0, REG_STATUS_COMMAND as u64, 1, CMD_PACKET as u64);
        odd.bar_write(0, REG_DATA as u64, 4, SCSI_INQUIRY as u64);
        odd.bar_write(0, REG_DATA as u64, 4, 0);
        odd.bar_write(0, REG_DATA as u64, 4, 0);
        let status = odd.bar_read(0, REG_STATUS_COMMAND as u64, 1) as u8;
        assert_eq!(status & STATUS_DRQ, STATUS_DRQ);
    }
}
