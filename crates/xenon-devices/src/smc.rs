//! System Management Controller: UART, SMI/clock interrupts, and the
//! 16-byte FIFO command protocol the kernel uses for power state, RTC,
//! temperature, tray, AV-pack, and I2C/HANA queries.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, trace, warn};

use xenon_interrupts::{Iic, InterruptLine};
use xenon_pci::{PciConfigSpace, PciDevice};
use xenon_platform::{AvPackType, PowerOnReason, TrayState};

use crate::uart::{PrintUart, SocketUart, UartBackend};

const UART_BYTE_OUT_REG: u8 = 0x10;
const UART_BYTE_IN_REG: u8 = 0x14;
const UART_STATUS_REG: u8 = 0x18;
const UART_CONFIG_REG: u8 = 0x1C;
const SMI_INT_STATUS_REG: u8 = 0x50;
const SMI_INT_ACK_REG: u8 = 0x58;
const SMI_INT_ENABLED_REG: u8 = 0x5C;
const CLCK_INT_ENABLED_REG: u8 = 0x64;
const CLCK_INT_STATUS_REG: u8 = 0x6C;
const FIFO_IN_DATA_REG: u8 = 0x80;
const FIFO_IN_STATUS_REG: u8 = 0x84;
const FIFO_OUT_DATA_REG: u8 = 0x90;
const FIFO_OUT_STATUS_REG: u8 = 0x94;

const FIFO_STATUS_READY: u32 = 0x4;
const FIFO_STATUS_BUSY: u32 = 0x0;

const SMI_INT_ENABLED: u32 = 0xC;
const SMI_INT_PENDING: u32 = 0x1000_0000;

const CLCK_INT_ENABLED: u32 = 0x1000_0000;
const CLCK_INT_READY: u32 = 0x1;
const CLCK_INT_TAKEN: u32 = 0x3;

const CLOCK_PERIOD: Duration = Duration::from_millis(500);

// FIFO command IDs, byte 0 of the 16-byte slot.
const SMC_PWRON_TYPE: u8 = 0x01;
const SMC_QUERY_RTC: u8 = 0x04;
const SMC_QUERY_TEMP_SENS: u8 = 0x07;
const SMC_QUERY_TRAY_STATE: u8 = 0x0B;
const SMC_QUERY_AVPACK: u8 = 0x0F;
const SMC_I2C_READ_WRITE: u8 = 0x11;
const SMC_QUERY_VERSION: u8 = 0x17;
const SMC_SET_STANDBY: u8 = 0x19;

/// Forward-only signal the orchestrator polls for reboot/shutdown
/// requests; the SMC never calls back into orchestrator state directly.
#[derive(Default)]
pub struct PowerSignal {
    pub shutdown_requested: AtomicBool,
    pub reboot_requested: AtomicBool,
    pub reboot_reason: AtomicU8,
}

struct SmcState {
    uart_out_reg: u32,
    uart_in_reg: u32,
    uart_status_reg: u32,
    uart_config_reg: u32,
    smi_status_reg: u32,
    smi_ack_reg: u32,
    smi_enabled_reg: u32,
    clock_enabled_reg: u32,
    clock_status_reg: u32,
    fifo_in_status_reg: u32,
    fifo_out_status_reg: u32,
    fifo_buffer: [u8; 16],
    fifo_pos: usize,
    hana_state: [u32; 256],
}

impl Default for SmcState {
    fn default() -> Self {
        Self {
            uart_out_reg: 0,
            uart_in_reg: 0,
            uart_status_reg: crate::uart::UART_STATUS_EMPTY,
            uart_config_reg: 0,
            smi_status_reg: 0,
            smi_ack_reg: 0,
            smi_enabled_reg: 0,
            clock_enabled_reg: 0,
            clock_status_reg: 0,
            fifo_in_status_reg: FIFO_STATUS_READY,
            fifo_out_status_reg: 0,
            fifo_buffer: [0u8; 16],
            fifo_pos: 0,
            hana_state: [0u32; 256],
        }
    }
}

pub struct Smc {
    config: PciConfigSpace,
    state: Mutex<SmcState>,
    uart: Mutex<Box<dyn UartBackend>>,
    iic: Arc<Iic>,
    power_on_reason: PowerOnReason,
    av_pack: AvPackType,
    tray_state: TrayState,
    power_signal: Arc<PowerSignal>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Smc {
    pub fn new(
        iic: Arc<Iic>,
        uart: Box<dyn UartBackend>,
        power_on_reason: PowerOnReason,
        av_pack: AvPackType,
        tray_state: TrayState,
    ) -> Arc<Self> {
        let smc = Arc::new(Self {
            config: PciConfigSpace::new(0x1414, 0x580, [0x100, 0, 0, 0, 0, 0]),
            state: Mutex::new(SmcState::default()),
            uart: Mutex::new(uart),
            iic,
            power_on_reason,
            av_pack,
            tray_state,
            power_signal: Arc::new(PowerSignal::default()),
            running: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(None),
        });
        let handle = {
            let smc = smc.clone();
            std::thread::Builder::new()
                .name("xenon-smc".into())
                .spawn(move || smc.worker_loop())
                .expect("spawn smc worker")
        };
        *smc.worker.lock().unwrap() = Some(handle);
        smc
    }

    pub fn power_signal(&self) -> Arc<PowerSignal> {
        self.power_signal.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        let mut last_clock = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            self.service_fifo();
            self.service_clock(&mut last_clock);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn service_fifo(&self) {
        let mut state = self.state.lock().unwrap();
        if state.fifo_in_status_reg != FIFO_STATUS_BUSY {
            return;
        }
        state.fifo_out_status_reg = FIFO_STATUS_BUSY;
        state.fifo_in_status_reg = FIFO_STATUS_READY;

        let no_response = self.dispatch_command(&mut state);

        state.fifo_out_status_reg = FIFO_STATUS_READY;
        if state.smi_enabled_reg & SMI_INT_ENABLED != 0 && !no_response {
            state.smi_status_reg = SMI_INT_PENDING;
            self.iic.set_pending(InterruptLine::Smm);
        }
    }

    /// Returns `true` if the command has no reply/interrupt (matches
    /// `noResponse` in the original dispatch).
    fn dispatch_command(&self, state: &mut SmcState) -> bool {
        let cmd = state.fifo_buffer[0];
        match cmd {
            SMC_PWRON_TYPE => {
                state.fifo_buffer = [0u8; 16];
                state.fifo_buffer[0] = SMC_PWRON_TYPE;
                state.fifo_buffer[1] = self.power_on_reason as u8;
            }
            SMC_QUERY_RTC => {
                state.fifo_buffer = [0u8; 16];
                state.fifo_buffer[0] = SMC_QUERY_RTC;
            }
            SMC_QUERY_TEMP_SENS => {
                state.fifo_buffer[0] = SMC_QUERY_TEMP_SENS;
                state.fifo_buffer[1] = 0x3C;
            }
            SMC_QUERY_TRAY_STATE => {
                state.fifo_buffer[0] = SMC_QUERY_TRAY_STATE;
                state.fifo_buffer[1] = self.tray_state as u8;
            }
            SMC_QUERY_AVPACK => {
                state.fifo_buffer[0] = SMC_QUERY_AVPACK;
                state.fifo_buffer[1] = self.av_pack as u8;
            }
            SMC_I2C_READ_WRITE => self.dispatch_i2c(state),
            SMC_QUERY_VERSION => {
                state.fifo_buffer[0] = SMC_QUERY_VERSION;
                state.fifo_buffer[1] = 0x41;
                state.fifo_buffer[2] = 0x02;
                state.fifo_buffer[3] = 0x03;
            }
            SMC_SET_STANDBY => return self.dispatch_standby(state),
            other => warn!(cmd = other, "smc: unknown fifo command"),
        }
        false
    }

    fn dispatch_i2c(&self, state: &mut SmcState) {
        match state.fifo_buffer[1] {
            0x3 => {
                info!("smc: i2c ddc lock requested");
                state.fifo_buffer[0] = SMC_I2C_READ_WRITE;
                state.fifo_buffer[1] = 0;
            }
            0x5 => {
                info!("smc: i2c ddc unlock requested");
                state.fifo_buffer[0] = SMC_I2C_READ_WRITE;
                state.fifo_buffer[1] = 0;
            }
            0x10 => {
                let idx = state.fifo_buffer[6] as usize;
                let value = state.hana_state[idx];
                state.fifo_buffer[0] = SMC_I2C_READ_WRITE;
                state.fifo_buffer[1] = 0;
                state.fifo_buffer[3] = (value & 0xFF) as u8;
                state.fifo_buffer[4] = ((value >> 8) & 0xFF) as u8;
                state.fifo_buffer[5] = ((value >> 16) & 0xFF) as u8;
                state.fifo_buffer[6] = ((value >> 24) & 0xFF) as u8;
            }
            0x60 => {
                let idx = state.fifo_buffer[6] as usize;
                let value = state.fifo_buffer[4] as u32
                    | ((state.fifo_buffer[5] as u32) << 8)
                    | ((state.fifo_buffer[6] as u32) << 16)
                    | ((state.fifo_buffer[7] as u32) << 24);
                state.hana_state[idx] = value;
                state.fifo_buffer[0] = SMC_I2C_READ_WRITE;
                state.fifo_buffer[1] = 0;
            }
            other => {
                warn!(sub = other, "smc: unimplemented i2c sub-command");
                state.fifo_buffer[0] = SMC_I2C_READ_WRITE;
                state.fifo_buffer[1] = 1;
            }
        }
    }

    fn dispatch_standby(&self, state: &mut SmcState) -> bool {
        state.fifo_buffer[0] = SMC_SET_STANDBY;
        match state.fifo_buffer[1] {
            0x01 => {
                info!("smc: shutdown requested");
                self.power_signal.shutdown_requested.store(true, Ordering::SeqCst);
            }
            0x04 => {
                info!("smc: reboot requested");
                self.power_signal
                    .reboot_reason
                    .store(state.fifo_buffer[2], Ordering::SeqCst);
                self.power_signal.reboot_requested.store(true, Ordering::SeqCst);
            }
            other => warn!(sub = other, "smc: unimplemented standby sub-command"),
        }
        false
    }

    fn service_clock(&self, last_clock: &mut Instant) {
        let mut state = self.state.lock().unwrap();
        if state.clock_enabled_reg != CLCK_INT_ENABLED {
            return;
        }
        if state.clock_status_reg != CLCK_INT_READY {
            return;
        }
        if last_clock.elapsed() < CLOCK_PERIOD {
            return;
        }
        *last_clock = Instant::now();
        state.clock_status_reg = CLCK_INT_TAKEN;
        self.iic.set_pending(InterruptLine::Clock);
    }

    fn setup_uart(&self, _config: u32) {
        trace!("smc: uart (re)initialized");
    }
}

impl Drop for Smc {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl PciDevice for Smc {
    fn name(&self) -> &str {
        "smc"
    }

    fn config_space(&self) -> &PciConfigSpace {
        &self.config
    }

    fn bar_read(&self, _bar: usize, offset: u64, width: u8) -> u64 {
        let reg = offset as u8;
        let mut state = self.state.lock().unwrap();
        let value = match reg {
            UART_CONFIG_REG => state.uart_config_reg,
            UART_BYTE_OUT_REG => {
                let mut uart = self.uart.lock().unwrap();
                if let Some(byte) = uart.read() {
                    state.uart_out_reg = byte as u32;
                }
                state.uart_out_reg
            }
            UART_STATUS_REG => {
                let mut uart = self.uart.lock().unwrap();
                state.uart_status_reg = uart.read_status();
                state.uart_status_reg
            }
            SMI_INT_STATUS_REG => state.smi_status_reg,
            SMI_INT_ACK_REG => state.smi_ack_reg,
            SMI_INT_ENABLED_REG => state.smi_enabled_reg,
            FIFO_IN_STATUS_REG => state.fifo_in_status_reg,
            FIFO_OUT_STATUS_REG => state.fifo_out_status_reg,
            FIFO_OUT_DATA_REG => {
                let pos = state.fifo_pos;
                let word = u32::from_le_bytes(state.fifo_buffer[pos..pos + 4].try_into().unwrap());
                state.fifo_pos += 4;
                word
            }
            other => {
                warn!(reg = other, "smc: read of unknown register");
                0
            }
        };
        value as u64 & width_mask(width)
    }

    fn bar_write(&self, _bar: usize, offset: u64, width: u8, value: u64) {
        let reg = offset as u8;
        let value = (value & width_mask(width)) as u32;
        let mut state = self.state.lock().unwrap();
        match reg {
            UART_CONFIG_REG => {
                state.uart_config_reg = value;
                self.setup_uart(value);
            }
            UART_BYTE_IN_REG => {
                state.uart_in_reg = value;
                self.uart.lock().unwrap().write(value as u8);
            }
            SMI_INT_STATUS_REG => state.smi_status_reg = value,
            SMI_INT_ACK_REG => state.smi_ack_reg = value,
            SMI_INT_ENABLED_REG => state.smi_enabled_reg = value,
            CLCK_INT_ENABLED_REG => state.clock_enabled_reg = value,
            CLCK_INT_STATUS_REG => state.clock_status_reg = value,
            FIFO_IN_STATUS_REG => {
                state.fifo_in_status_reg = value;
                if value == FIFO_STATUS_READY {
                    state.fifo_buffer = [0u8; 16];
                    state.fifo_pos = 0;
                }
            }
            FIFO_OUT_STATUS_REG => {
                state.fifo_out_status_reg = value;
                if value == FIFO_STATUS_READY {
                    state.fifo_pos = 0;
                }
            }
            FIFO_IN_DATA_REG => {
                let pos = state.fifo_pos;
                state.fifo_buffer[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
                state.fifo_pos += 4;
            }
            other => warn!(reg = other, value, "smc: write to unknown register"),
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

pub fn uart_from_transport(transport: &xenon_platform::UartTransport) -> Box<dyn UartBackend> {
    match transport {
        xenon_platform::UartTransport::Socket { ip, port } => Box::new(SocketUart::connect(ip, *port)),
        xenon_platform::UartTransport::Print => Box::new(PrintUart),
        xenon_platform::UartTransport::Vcom { .. } => {
            warn!("smc: vcom transport is not available on this host, falling back to print");
            Box::new(PrintUart)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn test_smc() -> Arc<Smc> {
        let iic = Arc::new(Iic::new());
        Smc::new(
            iic,
            Box::new(PrintUart),
            PowerOnReason::PowerButton,
            AvPackType::Hdmi,
            TrayState::Closed,
        )
    }

    #[test]
    fn pwron_query_replies_with_the_configured_reason() {
        let smc = test_smc();
        smc.bar_write(0, FIFO_IN_DATA_REG as u64, 4, SMC_PWRON_TYPE as u64);
        smc.bar_write(0, FIFO_IN_STATUS_REG as u64, 4, FIFO_STATUS_BUSY as u64);

        for _ in 0..200 {
            if smc.bar_read(0, FIFO_OUT_STATUS_REG as u64, 4) == FIFO_STATUS_READY as u64 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(smc.bar_read(0, FIFO_OUT_STATUS_REG as u64, 4), FIFO_STATUS_READY as u64);
        // Guest software rewrites the out-status register to READY to reset
        // the buffer read pointer before pulling the reply words out.
        smc.bar_write(0, FIFO_OUT_STATUS_REG as u64, 4, FIFO_STATUS_READY as u64);
        let reply = smc.bar_read(0, FIFO_OUT_DATA_REG as u64, 4);
        assert_eq!(reply & 0xFF, SMC_PWRON_TYPE as u64);
        smc.stop();
    }

    #[test]
    fn query_version_reply_fills_all_four_fifo_words() {
        let smc = test_smc();
        smc.bar_write(0, FIFO_IN_DATA_REG as u64, 4, SMC_QUERY_VERSION as u64);
        smc.bar_write(0, FIFO_IN_STATUS_REG as u64, 4, FIFO_STATUS_BUSY as u64);

        for _ in 0..200 {
            if smc.bar_read(0, FIFO_OUT_STATUS_REG as u64, 4) == FIFO_STATUS_READY as u64 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        smc.bar_write(0, FIFO_OUT_STATUS_REG as u64, 4, FIFO_STATUS_READY as u64);

        let mut reply = [0u8; 16];
        for word in reply.chunks_mut(4) {
            let value = smc.bar_read(0, FIFO_OUT_DATA_REG as u64, 4) as u32;
            word.copy_from_slice(&value.to_le_bytes());
        }
        let mut expected = [0u8; 16];
        expected[0] = SMC_QUERY_VERSION;
        expected[1] = 0x41;
        expected[2] = 0x02;
        expected[3] = 0x03;
        assert_eq!(reply, expected);
        smc.stop();
    }

    #[test]
    fn bar_sizing_probe_reports_the_256_byte_window() {
        let smc = test_smc();
        smc.config.write(0x10, 0xFFFF_FFFF, 4);
        let mask = smc.config.read(0x10, 4);
        assert_eq!(mask & 0xFF, 0);
        smc.stop();
    }
}
