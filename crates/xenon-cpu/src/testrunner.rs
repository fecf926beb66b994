//! Literal pre/post-state instruction tests.
//!
//! Loads a thread's register file from a caller-supplied snapshot, executes
//! a fixed instruction count, and diffs the result against an expected
//! snapshot. This is how the interpreter's correctness against known
//! hardware traces is checked, independent of booting a full image.

use crate::state::ThreadState;
use crate::Interpreter;

#[derive(Debug, Clone)]
pub struct CpuTest {
    pub name: String,
    pub pre: ThreadState,
    pub post: ThreadState,
    pub instruction_count: u64,
}

#[derive(Debug)]
pub struct TestFailure {
    pub name: String,
    pub mismatches: Vec<String>,
}

/// Runs `test` on `thread` and reports every register that doesn't match
/// the expected post-state. GPRs, CR, XER, LR, CTR, and PC are compared;
/// FPR/VR mismatches are reported by index without formatting the full
/// 128-bit lane value.
pub fn run_test(interp: &Interpreter, thread: usize, test: &CpuTest) -> Result<(), TestFailure> {
    interp.set_thread_state(thread, test.pre.clone());
    let _ = interp.run(thread, test.instruction_count);
    let actual = interp.thread_state(thread);

    let mut mismatches = Vec::new();
    for i in 0..32 {
        if actual.gpr[i] != test.post.gpr[i] {
            mismatches.push(format!(
                "gpr[{i}]: expected {:#x}, got {:#x}",
                test.post.gpr[i], actual.gpr[i]
            ));
        }
    }
    for i in 0..32 {
        if actual.fpr[i].to_bits() != test.post.fpr[i].to_bits() {
            mismatches.push(format!("fpr[{i}] mismatch"));
        }
    }
    for i in 0..32 {
        if actual.vr[i] != test.post.vr[i] {
            mismatches.push(format!("vr[{i}] mismatch"));
        }
    }
    if actual.cr != test.post.cr {
        mismatches.push(format!("cr: expected {:#x}, got {:#x}", test.post.cr, actual.cr));
    }
    if actual.xer != test.post.xer {
        mismatches.push(format!("xer: expected {:#x}, got {:#x}", test.post.xer, actual.xer));
    }
    if actual.lr != test.post.lr {
        mismatches.push(format!("lr: expected {:#x}, got {:#x}", test.post.lr, actual.lr));
    }
    if actual.ctr != test.post.ctr {
        mismatches.push(format!("ctr: expected {:#x}, got {:#x}", test.post.ctr, actual.ctr));
    }
    if actual.pc != test.post.pc {
        mismatches.push(format!("pc: expected {:#x}, got {:#x}", test.post.pc, actual.pc));
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(TestFailure { name: test.name.clone(), mismatches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HwInitSkip, UnknownOpcodePolicy};
    use std::sync::Arc;
    use xenon_bus::Bus;
    use xenon_mem::PhysicalMemory;
    use xenon_mmu::Mmu;

    fn interpreter_with_program(words: &[u32]) -> Interpreter {
        let mmu = Arc::new(Mmu::new());
        let mut bus = Bus::new();
        let ram = Arc::new(PhysicalMemory::new(0x1000).unwrap());
        for (i, word) in words.iter().enumerate() {
            ram.write(i as u64 * 4, 4, *word as u64).unwrap();
        }
        bus.register("dram", 0, 0xFFF, false, ram).unwrap();
        Interpreter::new(mmu, Arc::new(bus), 0, [None::<HwInitSkip>, None], UnknownOpcodePolicy::WarnAndContinue)
    }

    #[test]
    fn a_pre_post_snapshot_test_passes_for_a_correct_add() {
        // addi r3, 0, 5; addi r4, 0, 7; add r5, r3, r4
        let words = [
            (14u32 << 26) | (3 << 21) | (0 << 16) | 5,
            (14u32 << 26) | (4 << 21) | (0 << 16) | 7,
            (31u32 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (266 << 1),
        ];
        let interp = interpreter_with_program(&words);
        let pre = ThreadState::new(0);
        let mut post = ThreadState::new(0);
        post.gpr[3] = 5;
        post.gpr[4] = 7;
        post.gpr[5] = 12;
        post.pc = 12;
        let test = CpuTest {
            name: "add_basic".into(),
            pre,
            post,
            instruction_count: 3,
        };
        run_test(&interp, 0, &test).unwrap();
    }

    #[test]
    fn a_mismatched_expectation_is_reported_with_the_offending_register() {
        let words = [(14u32 << 26) | (3 << 21) | (0 << 16) | 5];
        let interp = interpreter_with_program(&words);
        let pre = ThreadState::new(0);
        let mut post = ThreadState::new(0);
        post.gpr[3] = 999;
        post.pc = 4;
        let test = CpuTest {
            name: "wrong_expectation".into(),
            pre,
            post,
            instruction_count: 1,
        };
        let err = run_test(&interp, 0, &test).unwrap_err();
        assert!(err.mismatches.iter().any(|m| m.contains("gpr[3]")));
    }
}
