//! Flat GPU register file and the EDRAM side-band access protocol.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

pub const NUM_REGISTERS: usize = 0x5000;

/// Register-id indexed store with a dirty bitset so the command processor
/// (or a future debugger) can tell which registers guest writes actually
/// touched since the last sweep.
pub struct RegisterFile {
    values: Mutex<Vec<u32>>,
    dirty: Mutex<Vec<bool>>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(vec![0u32; NUM_REGISTERS]),
            dirty: Mutex::new(vec![false; NUM_REGISTERS]),
        }
    }

    pub fn read(&self, index: u32) -> u32 {
        self.values.lock().unwrap().get(index as usize).copied().unwrap_or(0)
    }

    pub fn write(&self, index: u32, value: u32) {
        let idx = index as usize;
        let mut values = self.values.lock().unwrap();
        if idx < values.len() {
            values[idx] = value;
            self.dirty.lock().unwrap()[idx] = true;
        }
    }

    pub fn take_dirty(&self) -> Vec<u32> {
        let mut dirty = self.dirty.lock().unwrap();
        let indices = dirty
            .iter()
            .enumerate()
            .filter(|(_, &d)| d)
            .map(|(i, _)| i as u32)
            .collect();
        dirty.iter_mut().for_each(|d| *d = false);
        indices
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

const EDRAM_SIZE_WORDS: usize = 10 * 1024 * 1024 / 4;

/// The guest accesses EDRAM indirectly: write a word index into a setter
/// register, spin on a busy bit, then touch the data register. Real
/// hardware's latency is elided — busy clears the instant the access
/// completes — but the side-band shape is preserved because some kernel
/// code polls it regardless.
pub struct Edram {
    words: Mutex<Vec<u32>>,
    read_index: AtomicU32,
    write_index: AtomicU32,
    busy: AtomicBool,
}

impl Edram {
    pub fn new() -> Self {
        Self {
            words: Mutex::new(vec![0u32; EDRAM_SIZE_WORDS]),
            read_index: AtomicU32::new(0),
            write_index: AtomicU32::new(0),
            busy: AtomicBool::new(false),
        }
    }

    pub fn set_read_index(&self, index: u32) {
        self.busy.store(true, Ordering::SeqCst);
        self.read_index.store(index, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn set_write_index(&self, index: u32) {
        self.busy.store(true, Ordering::SeqCst);
        self.write_index.store(index, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn read_data(&self) -> u32 {
        self.busy.store(true, Ordering::SeqCst);
        let idx = self.read_index.load(Ordering::SeqCst) as usize;
        let words = self.words.lock().unwrap();
        let value = words.get(idx).copied().unwrap_or(0);
        drop(words);
        self.busy.store(false, Ordering::SeqCst);
        value
    }

    pub fn write_data(&self, value: u32) {
        self.busy.store(true, Ordering::SeqCst);
        let idx = self.write_index.load(Ordering::SeqCst) as usize;
        let mut words = self.words.lock().unwrap();
        if idx < words.len() {
            words[idx] = value;
        }
        drop(words);
        self.busy.store(false, Ordering::SeqCst);
    }
}

impl Default for Edram {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_write_marks_the_index_dirty_until_swept() {
        let regs = RegisterFile::new();
        regs.write(10, 0xAA);
        assert_eq!(regs.read(10), 0xAA);
        assert_eq!(regs.take_dirty(), vec![10]);
        assert!(regs.take_dirty().is_empty());
    }

    #[test]
    fn edram_round_trips_through_the_setter_registers() {
        let edram = Edram::new();
        edram.set_write_index(5);
        edram.write_data(0xDEAD_BEEF);
        edram.set_read_index(5);
        assert_eq!(edram.read_data(), 0xDEAD_BEEF);
        assert!(!edram.is_busy());
    }
}
