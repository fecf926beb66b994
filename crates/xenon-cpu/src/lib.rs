//! PowerPC interpreter core: six hardware threads across three cores,
//! table-driven decode, and a one-entry per-thread decode cache so tight
//! loops don't redecode every iteration.

pub mod decode;
mod exec;
pub mod state;
pub mod testrunner;

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{trace, warn};

use xenon_bus::Bus;
use xenon_mmu::Mmu;

use decode::{decode, Decoded};
use state::ThreadState;

pub const NUM_THREADS: usize = xenon_mmu::NUM_THREADS;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    #[error("illegal instruction")]
    IllegalInstruction,
    #[error("system call")]
    SystemCall,
    #[error("data storage interrupt")]
    DataStorage,
    #[error("instruction storage interrupt")]
    InstructionStorage,
    #[error("alignment interrupt")]
    Alignment,
}

/// What happens when [`Interpreter::step`] decodes an opcode it doesn't
/// implement: either the thread halts so a debugger/test harness notices,
/// or it logs and falls through to the next instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownOpcodePolicy {
    Halt,
    WarnAndContinue,
}

#[derive(Debug, Clone, Copy)]
pub struct HwInitSkip {
    pub address: u64,
    pub force_taken: bool,
}

struct DecodeCacheSlot {
    pc: u64,
    decoded: Decoded,
}

pub struct Interpreter {
    states: Mutex<Vec<ThreadState>>,
    decode_cache: Vec<Mutex<Option<DecodeCacheSlot>>>,
    mmu: Arc<Mmu>,
    bus: Arc<Bus>,
    hw_init_skip: [Option<HwInitSkip>; 2],
    unknown_opcode_policy: UnknownOpcodePolicy,
}

impl Interpreter {
    pub fn new(
        mmu: Arc<Mmu>,
        bus: Arc<Bus>,
        boot_vector: u64,
        hw_init_skip: [Option<HwInitSkip>; 2],
        unknown_opcode_policy: UnknownOpcodePolicy,
    ) -> Self {
        let states = (0..NUM_THREADS).map(|_| ThreadState::new(boot_vector)).collect();
        let decode_cache = (0..NUM_THREADS).map(|_| Mutex::new(None)).collect();
        Self {
            states: Mutex::new(states),
            decode_cache,
            mmu,
            bus,
            hw_init_skip,
            unknown_opcode_policy,
        }
    }

    pub fn thread_state(&self, thread: usize) -> ThreadState {
        self.states.lock().unwrap()[thread].clone()
    }

    pub fn set_thread_state(&self, thread: usize, state: ThreadState) {
        self.states.lock().unwrap()[thread] = state;
        *self.decode_cache[thread].lock().unwrap() = None;
    }

    fn physical_address(&self, thread: usize, effective_addr: u64) -> Result<u64, Exception> {
        let (pid, dr, supervisor) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            (s.pid, s.dr(), s.supervisor())
        };
        self.mmu
            .translate(thread, effective_addr, pid, dr, supervisor, false)
            .map_err(|_| Exception::DataStorage)
    }

    fn load_width(&self, thread: usize, addr: u64, width: u8) -> Result<u64, Exception> {
        let (pid, dr, supervisor) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            (s.pid, s.dr(), s.supervisor())
        };
        self.mmu
            .load(&self.bus, thread, addr, pid, dr, supervisor, width)
            .map_err(|_| Exception::DataStorage)
    }

    fn store_width(&self, thread: usize, addr: u64, width: u8, value: u64) -> Result<(), Exception> {
        let (pid, dr, supervisor) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            (s.pid, s.dr(), s.supervisor())
        };
        self.mmu
            .store(&self.bus, thread, addr, pid, dr, supervisor, width, value)
            .map_err(|_| Exception::DataStorage)
    }

    fn fetch(&self, thread: usize) -> Result<Decoded, Exception> {
        let pc = self.states.lock().unwrap()[thread].pc;
        {
            let cache = self.decode_cache[thread].lock().unwrap();
            if let Some(slot) = cache.as_ref() {
                if slot.pc == pc {
                    return Ok(slot.decoded);
                }
            }
        }
        let word = self.load_width(thread, pc, 4).map_err(|_| Exception::InstructionStorage)? as u32;
        let decoded = decode(word);
        *self.decode_cache[thread].lock().unwrap() = Some(DecodeCacheSlot { pc, decoded });
        Ok(decoded)
    }

    /// Executes exactly one instruction on `thread`. On success, advances
    /// `pc` unless the instruction itself already redirected control flow
    /// (branches handle their own `pc` update). On an unhandled opcode,
    /// applies [`UnknownOpcodePolicy`].
    pub fn step(&self, thread: usize) -> Result<(), Exception> {
        if self.states.lock().unwrap()[thread].halted {
            return Ok(());
        }
        let decoded = self.fetch(thread)?;
        let pc_before = self.states.lock().unwrap()[thread].pc;
        let is_branch = matches!(
            decoded.op,
            decode::Op::B | decode::Op::Bc | decode::Op::Bcctr | decode::Op::Bclr
        );
        match self.exec(thread, decoded) {
            Ok(()) => {
                if !is_branch {
                    let mut states = self.states.lock().unwrap();
                    if states[thread].pc == pc_before {
                        states[thread].pc = pc_before.wrapping_add(4);
                    }
                }
                Ok(())
            }
            Err(Exception::IllegalInstruction) => {
                warn!(pc = pc_before, raw = decoded.raw, "cpu: unimplemented opcode");
                match self.unknown_opcode_policy {
                    UnknownOpcodePolicy::Halt => {
                        self.states.lock().unwrap()[thread].halted = true;
                        Err(Exception::IllegalInstruction)
                    }
                    UnknownOpcodePolicy::WarnAndContinue => {
                        self.states.lock().unwrap()[thread].pc = pc_before.wrapping_add(4);
                        Ok(())
                    }
                }
            }
            Err(other) => {
                trace!(pc = pc_before, ?other, "cpu: exception raised");
                self.raise_exception(thread, pc_before, other);
                Ok(())
            }
        }
    }

    fn raise_exception(&self, thread: usize, pc: u64, exception: Exception) {
        let mut states = self.states.lock().unwrap();
        let s = &mut states[thread];
        s.srr0 = pc;
        s.srr1 = s.msr;
        s.pc = match exception {
            Exception::SystemCall => 0xC00,
            Exception::DataStorage => 0x300,
            Exception::InstructionStorage => 0x400,
            Exception::Alignment => 0x600,
            Exception::IllegalInstruction => 0x700,
        };
    }

    pub fn run(&self, thread: usize, max_instructions: u64) -> Result<u64, Exception> {
        let mut executed = 0;
        while executed < max_instructions {
            if self.states.lock().unwrap()[thread].halted {
                break;
            }
            self.step(thread)?;
            executed += 1;
        }
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenon_mem::PhysicalMemory;

    fn make_interpreter(ram_size: u64) -> Interpreter {
        let mmu = Arc::new(Mmu::new());
        let mut bus = Bus::new();
        let ram = Arc::new(PhysicalMemory::new(ram_size).unwrap());
        bus.register("dram", 0, ram_size - 1, false, ram).unwrap();
        Interpreter::new(
            mmu,
            Arc::new(bus),
            0,
            [None, None],
            UnknownOpcodePolicy::WarnAndContinue,
        )
    }

    fn encode_addi(rt: u8, ra: u8, simm: i16) -> u32 {
        (14u32 << 26) | ((rt as u32) << 21) | ((ra as u32) << 16) | (simm as u16 as u32)
    }

    #[test]
    fn addi_writes_the_sum_and_advances_pc() {
        let interp = make_interpreter(0x1000);
        let word = encode_addi(3, 0, 42);
        interp.bus.write(0, 4, word as u64);
        interp.step(0).unwrap();
        assert_eq!(interp.thread_state(0).gpr[3], 42);
        assert_eq!(interp.thread_state(0).pc, 4);
    }

    #[test]
    fn unknown_opcode_halts_when_configured_to() {
        let mmu = Arc::new(Mmu::new());
        let mut bus = Bus::new();
        let ram = Arc::new(PhysicalMemory::new(0x1000).unwrap());
        bus.register("dram", 0, 0xFFF, false, ram).unwrap();
        bus.write(0, 4, 0); // primary opcode 0: illegal
        let interp = Interpreter::new(mmu, Arc::new(bus), 0, [None, None], UnknownOpcodePolicy::Halt);
        assert!(interp.step(0).is_err());
        assert!(interp.thread_state(0).halted);
    }

    #[test]
    fn decode_cache_reuses_the_same_slot_for_a_tight_loop() {
        let interp = make_interpreter(0x1000);
        let word = encode_addi(3, 3, 1);
        interp.bus.write(0, 4, word as u64);
        let mut state = interp.thread_state(0);
        state.pc = 0;
        interp.set_thread_state(0, state);
        interp.step(0).unwrap();
        let mut state = interp.thread_state(0);
        state.pc = 0;
        interp.set_thread_state(0, state); // cache invalidated on pc rewrite
        interp.step(0).unwrap();
        assert_eq!(interp.thread_state(0).gpr[3], 2);
    }
}
