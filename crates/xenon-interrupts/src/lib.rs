//! Interrupt input controller (IIC).
//!
//! One priority block per hardware thread (3 cores x 2 threads = 6). The
//! PCI bridge is the only external caller; per the cycle-breaking design
//! note, the IIC exposes only [`Iic::set_pending`] and never reaches back
//! into bridge or device state. The bridge owns its own routing table
//! mapping device interrupt sources to lines (see `xenon-pci`); the IIC's
//! own routing table (configured here) maps a *line* to the set of
//! hardware threads whose pending bits it sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

pub const NUM_THREADS: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InterruptLine {
    Smm,
    Clock,
    Sfcx,
    Ata,
    Odd,
    Ohci,
    Ehci,
    Ethernet,
    Audio,
    Gpu,
}

impl InterruptLine {
    fn bit(self) -> u64 {
        1 << (self as u64)
    }
}

#[derive(Default)]
struct ThreadBlock {
    pending: AtomicU64,
}

pub struct Iic {
    threads: [ThreadBlock; NUM_THREADS],
    routing: Mutex<HashMap<InterruptLine, Vec<usize>>>,
}

impl Default for Iic {
    fn default() -> Self {
        Self::new()
    }
}

impl Iic {
    pub fn new() -> Self {
        Self {
            threads: std::array::from_fn(|_| ThreadBlock::default()),
            routing: Mutex::new(HashMap::new()),
        }
    }

    /// Route `line` to a specific set of hardware threads (0..NUM_THREADS).
    /// Unrouted lines default to thread 0, matching the boot vector always
    /// running on thread 0 (§4.7).
    pub fn set_routing(&self, line: InterruptLine, threads: Vec<usize>) {
        self.routing.lock().unwrap().insert(line, threads);
    }

    /// Raise `line`'s pending bit on every thread it's routed to. Called
    /// by the PCI bridge; never blocks on device state.
    pub fn set_pending(&self, line: InterruptLine) {
        let routing = self.routing.lock().unwrap();
        let targets = routing
            .get(&line)
            .cloned()
            .unwrap_or_else(|| vec![0]);
        drop(routing);
        for t in targets {
            if let Some(block) = self.threads.get(t) {
                block.pending.fetch_or(line.bit(), Ordering::SeqCst);
                trace!(thread = t, ?line, "iic: interrupt pending");
            }
        }
    }

    /// Sampled by the interpreter's dispatch loop between instructions
    /// when MSR.EE is set.
    pub fn pending(&self, thread: usize) -> u64 {
        self.threads[thread].pending.load(Ordering::SeqCst)
    }

    pub fn has_pending(&self, thread: usize) -> bool {
        self.pending(thread) != 0
    }

    /// Acknowledge (clear) a single line on a thread after the guest's
    /// exception handler has observed it.
    pub fn ack(&self, thread: usize, line: InterruptLine) {
        self.threads[thread]
            .pending
            .fetch_and(!line.bit(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrouted_line_defaults_to_thread_zero() {
        let iic = Iic::new();
        iic.set_pending(InterruptLine::Sfcx);
        assert!(iic.has_pending(0));
        assert!(!iic.has_pending(1));
    }

    #[test]
    fn routed_line_reaches_every_configured_thread() {
        let iic = Iic::new();
        iic.set_routing(InterruptLine::Gpu, vec![2, 3]);
        iic.set_pending(InterruptLine::Gpu);
        assert!(iic.has_pending(2));
        assert!(iic.has_pending(3));
        assert!(!iic.has_pending(0));
    }

    #[test]
    fn ack_clears_only_the_acknowledged_line() {
        let iic = Iic::new();
        iic.set_pending(InterruptLine::Clock);
        iic.set_pending(InterruptLine::Smm);
        iic.ack(0, InterruptLine::Clock);
        assert_eq!(iic.pending(0), InterruptLine::Smm.bit());
    }
}
