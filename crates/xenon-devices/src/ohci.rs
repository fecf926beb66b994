//! USB 1.1 Open Host Controller Interface register set, with a worker
//! thread that advances the frame counter and retires ED lists while the
//! controller is in the operational state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use xenon_interrupts::{Iic, InterruptLine};
use xenon_pci::{PciConfigSpace, PciDevice};

const HC_REVISION: u64 = 0x00;
const HC_CONTROL: u64 = 0x04;
const HC_COMMAND_STATUS: u64 = 0x08;
const HC_INTERRUPT_STATUS: u64 = 0x0C;
const HC_INTERRUPT_ENABLE: u64 = 0x10;
const HC_INTERRUPT_DISABLE: u64 = 0x14;
const HC_HCCA: u64 = 0x18;
const HC_PERIOD_CURRENT_ED: u64 = 0x1C;
const HC_CONTROL_HEAD_ED: u64 = 0x20;
const HC_CONTROL_CURRENT_ED: u64 = 0x24;
const HC_BULK_HEAD_ED: u64 = 0x28;
const HC_BULK_CURRENT_ED: u64 = 0x2C;
const HC_DONE_HEAD: u64 = 0x30;
const HC_FM_INTERVAL: u64 = 0x34;
const HC_FM_REMAINING: u64 = 0x38;
const HC_FM_NUMBER: u64 = 0x3C;
const HC_PERIODIC_START: u64 = 0x40;
const HC_LS_THRESHOLD: u64 = 0x44;
const HC_RH_DESCRIPTOR_A: u64 = 0x48;
const HC_RH_DESCRIPTOR_B: u64 = 0x4C;
const HC_RH_STATUS: u64 = 0x50;
const HC_RH_PORT_STATUS_BASE: u64 = 0x54;
const NUM_PORTS: usize = 4;

const HCFS_MASK: u32 = 0x3 << 6;
const HCFS_OPERATIONAL: u32 = 0x2 << 6;

const PORT_CONNECT_STATUS: u32 = 1 << 0;
const PORT_ENABLE_STATUS: u32 = 1 << 1;
const PORT_RESET_STATUS: u32 = 1 << 4;
const PORT_CONNECT_STATUS_CHANGE: u32 = 1 << 16;
const PORT_RESET_STATUS_CHANGE: u32 = 1 << 20;

#[derive(Default)]
struct OhciRegs {
    control: u32,
    command_status: u32,
    interrupt_status: u32,
    interrupt_enable: u32,
    hcca: u32,
    control_head_ed: u32,
    control_current_ed: u32,
    bulk_head_ed: u32,
    bulk_current_ed: u32,
    done_head: u32,
    fm_interval: u32,
    fm_number: u32,
    periodic_start: u32,
    rh_descriptor_a: u32,
    rh_descriptor_b: u32,
    ports: [u32; NUM_PORTS],
}

pub struct Ohci {
    config: PciConfigSpace,
    regs: Mutex<OhciRegs>,
    iic: Arc<Iic>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Ohci {
    pub fn new(iic: Arc<Iic>) -> Arc<Self> {
        let ohci = Arc::new(Self {
            config: PciConfigSpace::new(0x1033, 0x0035, [0x1000, 0, 0, 0, 0, 0]),
            regs: Mutex::new(OhciRegs::default()),
            iic,
            running: Arc::new(AtomicBool::new(true)),
            worker: Mutex::new(None),
        });
        let handle = {
            let ohci = ohci.clone();
            std::thread::Builder::new()
                .name("xenon-ohci".into())
                .spawn(move || ohci.worker_loop())
                .expect("spawn ohci worker")
        };
        *ohci.worker.lock().unwrap() = Some(handle);
        ohci
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let operational = self.regs.lock().unwrap().control & HCFS_MASK == HCFS_OPERATIONAL;
            if operational {
                let mut regs = self.regs.lock().unwrap();
                regs.fm_number = regs.fm_number.wrapping_add(1);
                // ED lists are not modeled beyond head/current pointer
                // bookkeeping; retire by writing back a null done head.
                regs.done_head = 0;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn port_offset(offset: u64) -> Option<usize> {
        if offset >= HC_RH_PORT_STATUS_BASE {
            let idx = ((offset - HC_RH_PORT_STATUS_BASE) / 4) as usize;
            if idx < NUM_PORTS {
                return Some(idx);
            }
        }
        None
    }
}

impl Drop for Ohci {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl PciDevice for Ohci {
    fn name(&self) -> &str {
        "ohci"
    }

    fn config_space(&self) -> &PciConfigSpace {
        &self.config
    }

    fn bar_read(&self, _bar: usize, offset: u64, _width: u8) -> u64 {
        let regs = self.regs.lock().unwrap();
        if let Some(port) = Self::port_offset(offset) {
            return regs.ports[port] as u64;
        }
        (match offset {
            HC_REVISION => 0x10,
            HC_CONTROL => regs.control,
            HC_COMMAND_STATUS => regs.command_status,
            HC_INTERRUPT_STATUS => regs.interrupt_status,
            HC_INTERRUPT_ENABLE => regs.interrupt_enable,
            HC_HCCA => regs.hcca,
            HC_PERIOD_CURRENT_ED => 0,
            HC_CONTROL_HEAD_ED => regs.control_head_ed,
            HC_CONTROL_CURRENT_ED => regs.control_current_ed,
            HC_BULK_HEAD_ED => regs.bulk_head_ed,
            HC_BULK_CURRENT_ED => regs.bulk_current_ed,
            HC_DONE_HEAD => regs.done_head,
            HC_FM_INTERVAL => regs.fm_interval,
            HC_FM_REMAINING => 0,
            HC_FM_NUMBER => regs.fm_number,
            HC_PERIODIC_START => regs.periodic_start,
            HC_LS_THRESHOLD => 0,
            HC_RH_DESCRIPTOR_A => regs.rh_descriptor_a,
            HC_RH_DESCRIPTOR_B => regs.rh_descriptor_b,
            HC_RH_STATUS => 0,
            _ => 0,
        }) as u64
    }

    fn bar_write(&self, _bar: usize, offset: u64, _width: u8, value: u64) {
        let value = value as u32;
        let mut regs = self.regs.lock().unwrap();
        if let Some(port) = Self::port_offset(offset) {
            // Write-one-to-clear for the change bits, write-one-to-set for
            // enable/reset. Port reset completes instantly and then enables
            // the port, matching real-hardware-timing elision in emulation.
            if value & PORT_RESET_STATUS != 0 {
                regs.ports[port] |= PORT_ENABLE_STATUS;
                regs.ports[port] &= !PORT_RESET_STATUS;
                regs.ports[port] |= PORT_RESET_STATUS_CHANGE;
            }
            if value & PORT_ENABLE_STATUS != 0 {
                regs.ports[port] |= PORT_ENABLE_STATUS;
            }
            if value & PORT_CONNECT_STATUS_CHANGE != 0 {
                regs.ports[port] &= !PORT_CONNECT_STATUS_CHANGE;
            }
            if value & PORT_RESET_STATUS_CHANGE != 0 {
                regs.ports[port] &= !PORT_RESET_STATUS_CHANGE;
            }
            return;
        }
        match offset {
            HC_CONTROL => regs.control = value,
            HC_COMMAND_STATUS => regs.command_status = value,
            HC_INTERRUPT_STATUS => regs.interrupt_status &= !value,
            HC_INTERRUPT_ENABLE => regs.interrupt_enable |= value,
            HC_INTERRUPT_DISABLE => regs.interrupt_enable &= !value,
            HC_HCCA => regs.hcca = value,
            HC_CONTROL_HEAD_ED => regs.control_head_ed = value,
            HC_CONTROL_CURRENT_ED => regs.control_current_ed = value,
            HC_BULK_HEAD_ED => regs.bulk_head_ed = value,
            HC_BULK_CURRENT_ED => regs.bulk_current_ed = value,
            HC_FM_INTERVAL => regs.fm_interval = value,
            HC_PERIODIC_START => regs.periodic_start = value,
            HC_RH_DESCRIPTOR_A => regs.rh_descriptor_a = value,
            HC_RH_DESCRIPTOR_B => regs.rh_descriptor_b = value,
            _ => {}
        }
        if regs.interrupt_status & regs.interrupt_enable != 0 {
            drop(regs);
            self.iic.set_pending(InterruptLine::Ohci);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_port_reset_completes_immediately_and_enables_the_port() {
        let iic = Arc::new(Iic::new());
        let ohci = Ohci::new(iic);
        ohci.bar_write(0, HC_RH_PORT_STATUS_BASE, 4, PORT_RESET_STATUS as u64);
        let status = ohci.bar_read(0, HC_RH_PORT_STATUS_BASE, 4) as u32;
        assert_eq!(status & PORT_ENABLE_STATUS, PORT_ENABLE_STATUS);
        assert_eq!(status & PORT_RESET_STATUS, 0);
        ohci.stop();
    }

    #[test]
    fn frame_number_advances_only_while_operational() {
        let iic = Arc::new(Iic::new());
        let ohci = Ohci::new(iic);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(ohci.bar_read(0, HC_FM_NUMBER, 4), 0);

        ohci.bar_write(0, HC_CONTROL, 4, HCFS_OPERATIONAL as u64);
        std::thread::sleep(Duration::from_millis(20));
        assert!(ohci.bar_read(0, HC_FM_NUMBER, 4) > 0);
        ohci.stop();
    }
}
