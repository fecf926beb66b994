//! PM4 ring buffer and command processor worker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use tracing::{trace, warn};

use xenon_bus::Bus;
use xenon_interrupts::{Iic, InterruptLine};

use crate::registers::RegisterFile;

const TYPE0: u32 = 0;
const TYPE1: u32 = 1;
const TYPE2: u32 = 2;
const TYPE3: u32 = 3;

// PM4 type-3 opcodes (xenos command-processor opcode space).
const OP_NOP: u32 = 0x10;
const OP_INTERRUPT: u32 = 0x40;
const OP_INDIRECT_BUFFER: u32 = 0x3F;
const OP_WAIT_REG_MEM: u32 = 0x3C;
const OP_REG_RMW: u32 = 0x21;
const OP_COND_WRITE: u32 = 0x45;
const OP_EVENT_WRITE: u32 = 0x46;
const OP_EVENT_WRITE_SHD: u32 = 0x58;
const OP_EVENT_WRITE_EXT: u32 = 0x5A;
const OP_DRAW_INDX: u32 = 0x22;
const OP_DRAW_INDX_2: u32 = 0x36;
const OP_SET_CONSTANT: u32 = 0x2D;
const OP_SET_CONSTANT2: u32 = 0x55;
const OP_LOAD_ALU_CONSTANT: u32 = 0x2F;
const OP_IM_LOAD: u32 = 0x27;
const OP_IM_LOAD_IMMEDIATE: u32 = 0x2B;
const OP_INVALIDATE_STATE: u32 = 0x3B;
const OP_ME_INIT: u32 = 0x48;

#[derive(Debug, Clone, Copy, Default)]
pub struct RingConfig {
    pub base: u64,
    pub size_words: u32,
    pub writeback_ptr: u64,
}

pub struct CommandProcessor {
    config: Mutex<RingConfig>,
    write_index: AtomicU32,
    read_index: AtomicU32,
    regs: Arc<RegisterFile>,
    // Weak, not Arc: the root bus registers this command processor's own
    // GpuMmio as one of its devices, so an owning Arc<Bus> here would be a
    // reference cycle. The orchestrator guarantees the bus outlives us.
    bus: Weak<Bus>,
    iic: Arc<Iic>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandProcessor {
    pub fn new(regs: Arc<RegisterFile>, bus: Arc<Bus>, iic: Arc<Iic>) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(RingConfig::default()),
            write_index: AtomicU32::new(0),
            read_index: AtomicU32::new(0),
            regs,
            bus: Arc::downgrade(&bus),
            iic,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    fn bus(&self) -> Arc<Bus> {
        self.bus.upgrade().expect("bus outlives the gpu command processor")
    }

    pub fn configure(&self, config: RingConfig) {
        *self.config.lock().unwrap() = config;
    }

    /// Advances `write_index` with release ordering; the guest calls this
    /// through the GPU register write path when it kicks the ring.
    pub fn advance_write_index(&self, new_index: u32) {
        self.write_index.store(new_index, Ordering::Release);
    }

    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let cp = self.clone();
        let handle = std::thread::Builder::new()
            .name("xenon-gpu-cp".into())
            .spawn(move || cp.worker_loop())
            .expect("spawn gpu command processor worker");
        *self.worker.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            let write_index = self.write_index.load(Ordering::Acquire);
            let read_index = self.read_index.load(Ordering::Relaxed);
            if read_index == write_index {
                std::thread::yield_now();
                continue;
            }
            self.process_one_packet();
        }
    }

    fn ring_word(&self, config: &RingConfig, index: u32) -> u32 {
        let wrapped = index % config.size_words.max(1);
        self.bus().read(config.base + wrapped as u64 * 4, 4) as u32
    }

    fn advance_read_index(&self, config: &RingConfig, by: u32) {
        let new_index = self.read_index.fetch_add(by, Ordering::AcqRel) + by;
        self.bus().write(config.writeback_ptr, 4, (new_index.to_be() as u32) as u64);
    }

    fn process_one_packet(&self) {
        let config = *self.config.lock().unwrap();
        if config.size_words == 0 {
            std::thread::yield_now();
            return;
        }
        let read_index = self.read_index.load(Ordering::Relaxed);
        let header = self.ring_word(&config, read_index);
        let packet_type = header >> 30;
        match packet_type {
            TYPE0 => {
                let count = ((header >> 16) & 0x3FFF) + 1;
                let single_target = header & 0x8000 != 0;
                let base_index = header & 0x7FFF;
                for i in 0..count {
                    let value = self.ring_word(&config, read_index + 1 + i);
                    let reg = if single_target { base_index } else { base_index + i };
                    self.regs.write(reg, value);
                }
                self.advance_read_index(&config, 1 + count);
            }
            TYPE1 => {
                let reg0 = header & 0x7FF;
                let reg1 = (header >> 11) & 0x7FF;
                let val0 = self.ring_word(&config, read_index + 1);
                let val1 = self.ring_word(&config, read_index + 2);
                self.regs.write(reg0, val0);
                self.regs.write(reg1, val1);
                self.advance_read_index(&config, 3);
            }
            TYPE2 => {
                self.advance_read_index(&config, 1);
            }
            TYPE3 => {
                let opcode = (header >> 8) & 0x7F;
                let count = ((header >> 16) & 0x3FFF) + 1;
                self.dispatch_type3(&config, read_index, opcode, count);
                self.advance_read_index(&config, 1 + count);
            }
            _ => unreachable!("packet type is a 2-bit field"),
        }
    }

    fn dispatch_type3(&self, config: &RingConfig, read_index: u32, opcode: u32, count: u32) {
        let body = |i: u32| self.ring_word(config, read_index + 1 + i);
        match opcode {
            OP_NOP | OP_ME_INIT | OP_INVALIDATE_STATE => {}
            OP_INTERRUPT => {
                self.iic.set_pending(InterruptLine::Gpu);
            }
            OP_INDIRECT_BUFFER => {
                if count >= 2 {
                    let ib_base = body(0) as u64;
                    let ib_size = body(1) & 0xFFFFF;
                    self.run_indirect_buffer(ib_base, ib_size);
                }
            }
            OP_WAIT_REG_MEM => {
                if count >= 5 {
                    self.exec_wait_reg_mem(body(0), body(1), body(2), body(3), body(4));
                }
            }
            OP_REG_RMW => {
                if count >= 3 {
                    let reg = body(0) & 0x1FFF;
                    let mask = body(1);
                    let or_value = body(2);
                    let current = self.regs.read(reg);
                    self.regs.write(reg, (current & mask) | or_value);
                }
            }
            OP_COND_WRITE => {
                if count >= 6 {
                    let poll = self.read_poll_source(body(0), body(1));
                    let reference = body(2);
                    let mask = body(3);
                    if poll & mask == reference & mask {
                        let dest_addr = body(4) as u64 & 0xFFFF_FFFC;
                        self.bus().write(dest_addr, 4, body(5) as u64);
                    }
                }
            }
            OP_EVENT_WRITE | OP_EVENT_WRITE_SHD | OP_EVENT_WRITE_EXT => {
                if count >= 3 {
                    let addr = (body(1) as u64) & 0xFFFF_FFFC;
                    let value = body(2);
                    self.bus().write(addr, 4, value as u64);
                }
                self.iic.set_pending(InterruptLine::Gpu);
            }
            OP_DRAW_INDX | OP_DRAW_INDX_2 => {
                trace!(opcode, count, "gpu: draw packet (rasterization not modeled)");
            }
            OP_SET_CONSTANT | OP_SET_CONSTANT2 | OP_LOAD_ALU_CONSTANT => {
                if count >= 1 {
                    let base_reg = body(0) & 0xFFFF;
                    for i in 1..count {
                        self.regs.write(base_reg + i - 1, body(i));
                    }
                }
            }
            OP_IM_LOAD | OP_IM_LOAD_IMMEDIATE => {
                trace!(opcode, count, "gpu: shader upload packet (not modeled)");
            }
            other => {
                warn!(opcode = other, count, "gpu: unimplemented pm4 opcode, skipping body");
            }
        }
    }

    fn run_indirect_buffer(&self, ib_base: u64, ib_size_words: u32) {
        if ib_size_words == 0 {
            return;
        }
        let sub = RingConfig { base: ib_base, size_words: ib_size_words, writeback_ptr: 0 };
        let mut local_index = 0u32;
        let bus = self.bus();
        while local_index < ib_size_words {
            let header = bus.read(sub.base + local_index as u64 * 4, 4) as u32;
            let packet_type = header >> 30;
            let advance = match packet_type {
                TYPE0 => 2 + ((header >> 16) & 0x3FFF),
                TYPE1 => 3,
                TYPE2 => 1,
                TYPE3 => {
                    let opcode = (header >> 8) & 0x7F;
                    let count = ((header >> 16) & 0x3FFF) + 1;
                    self.dispatch_type3(&sub, local_index, opcode, count);
                    1 + count
                }
                _ => unreachable!(),
            };
            local_index += advance.max(1);
        }
    }

    fn read_poll_source(&self, function_and_source: u32, poll_addr: u32) -> u32 {
        let from_memory = function_and_source & (1 << 4) == 0;
        if from_memory {
            self.bus().read(poll_addr as u64 & 0xFFFF_FFFC, 4) as u32
        } else {
            self.regs.read(poll_addr & 0x1FFF)
        }
    }

    fn exec_wait_reg_mem(&self, function_and_source: u32, poll_addr: u32, reference: u32, mask: u32, _wait_interval: u32) {
        let compare = function_and_source & 0x7;
        let value = self.read_poll_source(function_and_source, poll_addr) & mask;
        let reference = reference & mask;
        let satisfied = match compare {
            0 => false,        // never
            1 => value < reference,
            2 => value <= reference,
            3 => value == reference,
            4 => value != reference,
            5 => value >= reference,
            6 => value > reference,
            _ => true, // always
        };
        if !satisfied {
            trace!("gpu: wait_reg_mem condition not met on first poll (single-shot model)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenon_mem::PhysicalMemory;

    fn cp_with_ram(size: u64) -> (Arc<CommandProcessor>, Arc<Bus>) {
        let mut bus = Bus::new();
        let ram = Arc::new(PhysicalMemory::new(size).unwrap());
        bus.register("dram", 0, size - 1, false, ram).unwrap();
        let bus = Arc::new(bus);
        let regs = Arc::new(RegisterFile::new());
        let iic = Arc::new(Iic::new());
        (CommandProcessor::new(regs, bus.clone(), iic), bus)
    }

    #[test]
    fn type0_packet_writes_sequential_registers() {
        let (cp, bus) = cp_with_ram(0x1000);
        // header: type0, count=2 (encoded count-1=1), base index 0x10
        let header = (TYPE0 << 30) | (1 << 16) | 0x10;
        bus.write(0, 4, header as u64);
        bus.write(4, 4, 0xAAAA);
        bus.write(8, 4, 0xBBBB);
        cp.configure(RingConfig { base: 0, size_words: 0x100, writeback_ptr: 0x800 });
        cp.advance_write_index(3);
        cp.process_one_packet();
        assert_eq!(cp.regs.read(0x10), 0xAAAA);
        assert_eq!(cp.regs.read(0x11), 0xBBBB);
    }

    #[test]
    fn type2_nop_advances_by_one_word() {
        let (cp, bus) = cp_with_ram(0x1000);
        let header = TYPE2 << 30;
        bus.write(0, 4, header as u64);
        cp.configure(RingConfig { base: 0, size_words: 0x100, writeback_ptr: 0x800 });
        cp.advance_write_index(1);
        cp.process_one_packet();
        assert_eq!(cp.read_index.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn interrupt_opcode_routes_through_the_iic() {
        let (cp, bus) = cp_with_ram(0x1000);
        let header = (TYPE3 << 30) | (OP_INTERRUPT << 8);
        bus.write(0, 4, header as u64);
        cp.configure(RingConfig { base: 0, size_words: 0x100, writeback_ptr: 0x800 });
        cp.advance_write_index(1);
        cp.process_one_packet();
        assert!(cp.iic.has_pending(0));
    }

    #[test]
    fn unknown_opcode_beyond_the_minimum_set_advances_by_count_plus_one_and_logs() {
        let (cp, bus) = cp_with_ram(0x1000);
        let header = (TYPE3 << 30) | (0x7F << 8) | (2 << 16); // count-1=2
        bus.write(0, 4, header as u64);
        cp.configure(RingConfig { base: 0, size_words: 0x100, writeback_ptr: 0x800 });
        cp.advance_write_index(4);
        cp.process_one_packet();
        assert_eq!(cp.read_index.load(Ordering::Relaxed), 4);
    }
}
