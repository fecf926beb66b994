//! Instruction execution. One function per opcode family, dispatched from
//! [`crate::Interpreter::step`].

use crate::decode::{Decoded, Fields, Op};
use crate::state::{ThreadState, XER_CA, XER_OV, XER_SO};
use crate::{Exception, Interpreter};

impl Interpreter {
    pub(crate) fn exec(&self, thread: usize, d: Decoded) -> Result<(), Exception> {
        let f = d.fields;
        match d.op {
            Op::Add | Op::Addo | Op::Addc | Op::Addco | Op::Adde | Op::Addeo
            | Op::Addme | Op::Addze | Op::Subf | Op::Subfo | Op::Subfc | Op::Subfco
            | Op::Subfe | Op::Subfme | Op::Subfze | Op::Neg | Op::Nego => {
                self.exec_add_family(thread, d.op, f)
            }
            Op::Addi => self.with_state(thread, |s| {
                let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
                s.gpr[f.rt as usize] = base.wrapping_add(f.simm as i64 as u64);
            }),
            Op::Addis => self.with_state(thread, |s| {
                let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
                s.gpr[f.rt as usize] = base.wrapping_add(((f.simm as i64) << 16) as u64);
            }),
            Op::Addic | Op::AddicDot => self.with_state(thread, |s| {
                let a = s.gpr[f.ra as usize];
                let imm = f.simm as i64 as u64;
                let (res, carry) = a.overflowing_add(imm);
                s.gpr[f.rt as usize] = res;
                set_ca(s, carry);
                if matches!(d.op, Op::AddicDot) {
                    s.update_cr0(res);
                }
            }),
            Op::Mulli => self.with_state(thread, |s| {
                s.gpr[f.rt as usize] =
                    (s.gpr[f.ra as usize] as i64).wrapping_mul(f.simm as i64) as u64;
            }),
            Op::Subfic => self.with_state(thread, |s| {
                let a = s.gpr[f.ra as usize];
                let imm = f.simm as i64 as u64;
                let (res, carry) = imm.overflowing_sub(a);
                s.gpr[f.rt as usize] = res;
                set_ca(s, !carry || res == 0 && a == 0);
            }),
            Op::Mullw | Op::Mullwo | Op::Mulhw | Op::Mulhwu | Op::Divw | Op::Divwo
            | Op::Divwu | Op::Divwuo => self.exec_mul_div(thread, d.op, f),
            Op::And | Op::Andc | Op::Or | Op::Orc | Op::Xor | Op::Nand | Op::Nor | Op::Eqv => {
                self.exec_logical(thread, d.op, f)
            }
            Op::Andi => self.with_state(thread, |s| {
                let res = s.gpr[f.rt as usize] & f.uimm as u64;
                s.gpr[f.ra as usize] = res;
                s.update_cr0(res);
            }),
            Op::Andis => self.with_state(thread, |s| {
                let res = s.gpr[f.rt as usize] & ((f.uimm as u64) << 16);
                s.gpr[f.ra as usize] = res;
                s.update_cr0(res);
            }),
            Op::Ori => self.with_state(thread, |s| {
                s.gpr[f.ra as usize] = s.gpr[f.rt as usize] | f.uimm as u64;
            }),
            Op::Oris => self.with_state(thread, |s| {
                s.gpr[f.ra as usize] = s.gpr[f.rt as usize] | ((f.uimm as u64) << 16);
            }),
            Op::Xori => self.with_state(thread, |s| {
                s.gpr[f.ra as usize] = s.gpr[f.rt as usize] ^ f.uimm as u64;
            }),
            Op::Xoris => self.with_state(thread, |s| {
                s.gpr[f.ra as usize] = s.gpr[f.rt as usize] ^ ((f.uimm as u64) << 16);
            }),
            Op::Cmp | Op::Cmpi | Op::Cmpl | Op::Cmpli => self.exec_compare(thread, d.op, f),
            Op::Slw | Op::Srw | Op::Sraw | Op::Srawi | Op::Sld | Op::Srd | Op::Srad
            | Op::Sradi => self.exec_shift(thread, d.op, f),
            Op::Extsb => self.with_state(thread, |s| {
                let v = s.gpr[f.rt as usize] as i8 as i64 as u64;
                s.gpr[f.ra as usize] = v;
                if f.rc_flag {
                    s.update_cr0(v);
                }
            }),
            Op::Extsh => self.with_state(thread, |s| {
                let v = s.gpr[f.rt as usize] as i16 as i64 as u64;
                s.gpr[f.ra as usize] = v;
                if f.rc_flag {
                    s.update_cr0(v);
                }
            }),
            Op::Extsw => self.with_state(thread, |s| {
                let v = s.gpr[f.rt as usize] as i32 as i64 as u64;
                s.gpr[f.ra as usize] = v;
                if f.rc_flag {
                    s.update_cr0(v);
                }
            }),
            Op::Cntlzw => self.with_state(thread, |s| {
                let v = (s.gpr[f.rt as usize] as u32).leading_zeros() as u64;
                s.gpr[f.ra as usize] = v;
                if f.rc_flag {
                    s.update_cr0(v);
                }
            }),
            Op::Cntlzd => self.with_state(thread, |s| {
                let v = s.gpr[f.rt as usize].leading_zeros() as u64;
                s.gpr[f.ra as usize] = v;
                if f.rc_flag {
                    s.update_cr0(v);
                }
            }),
            Op::B | Op::Bc | Op::Bcctr | Op::Bclr => self.exec_branch(thread, d.op, d.raw, f),
            Op::Sc => return Err(Exception::SystemCall),
            Op::Rfid => self.with_state(thread, |s| {
                s.pc = s.srr0;
                s.msr = s.srr1;
            }),
            Op::Mfspr => self.exec_mfspr(thread, f),
            Op::Mtspr => self.exec_mtspr(thread, f),
            Op::Mfmsr => self.with_state(thread, |s| s.gpr[f.rt as usize] = s.msr),
            Op::Mtmsr => self.with_state(thread, |s| s.msr = s.gpr[f.rt as usize]),
            Op::Mftb => self.with_state(thread, |s| {
                s.gpr[f.rt as usize] = *s.sprs.entry(284).or_insert(0)
            }),
            Op::Tlbiel | Op::Tlbsync | Op::Slbmte => {
                tracing::trace!(op = ?d.op, "cpu: translation-management instruction (no-op model)");
                Ok(())
            }
            Op::Lwz | Op::Lwzu | Op::Lbz | Op::Lbzu | Op::Lhz | Op::Lhzu | Op::Lha
            | Op::Lhau | Op::Ld | Op::Ldu | Op::Lwa => self.exec_load(thread, d.op, f),
            Op::Stw | Op::Stwu | Op::Stb | Op::Stbu | Op::Sth | Op::Sthu | Op::Std
            | Op::Stdu => self.exec_store(thread, d.op, f),
            Op::Lwarx | Op::Ldarx => self.exec_larx(thread, d.op, f),
            Op::Stwcx | Op::Stdcx => self.exec_stcx(thread, d.op, f),
            Op::Fadd | Op::Fsub | Op::Fmul | Op::Fdiv => self.exec_fp_arith(thread, d.op, f),
            Op::Fmadd | Op::Fmsub | Op::Fnmadd | Op::Fnmsub => {
                self.exec_fp_madd(thread, d.op, f)
            }
            Op::Fabs => self.with_state(thread, |s| {
                s.fpr[f.frt as usize] = s.fpr[f.frb as usize].abs();
            }),
            Op::Fneg => self.with_state(thread, |s| {
                s.fpr[f.frt as usize] = -s.fpr[f.frb as usize];
            }),
            Op::Fmr => self.with_state(thread, |s| {
                s.fpr[f.frt as usize] = s.fpr[f.frb as usize];
            }),
            Op::Fsqrt => self.with_state(thread, |s| {
                s.fpr[f.frt as usize] = s.fpr[f.frb as usize].sqrt();
            }),
            Op::Fcmpu | Op::Fcmpo => self.exec_fcmp(thread, f),
            Op::Frsp => self.with_state(thread, |s| {
                s.fpr[f.frt as usize] = s.fpr[f.frb as usize] as f32 as f64;
            }),
            Op::Fctiwz => self.with_state(thread, |s| {
                let truncated = s.fpr[f.frb as usize].trunc() as i32;
                s.fpr[f.frt as usize] = f64::from_bits(truncated as u32 as u64);
            }),
            Op::Fcfid => self.with_state(thread, |s| {
                let bits = s.fpr[f.frb as usize].to_bits() as i64;
                s.fpr[f.frt as usize] = bits as f64;
            }),
            Op::Lfd => self.exec_load_fp(thread, f, 8),
            Op::Lfs => self.exec_load_fp(thread, f, 4),
            Op::Stfd => self.exec_store_fp(thread, f, 8),
            Op::Stfs => self.exec_store_fp(thread, f, 4),
            Op::Vaddubm | Op::Vsububm | Op::Vand | Op::Vandc | Op::Vor | Op::Vxor
            | Op::Vnor | Op::Vaddsws => self.exec_vector_alu(thread, d.op, f),
            Op::Vsldoi => self.exec_vsldoi(thread, f),
            Op::Vperm => self.exec_vperm(thread, f),
            Op::Vspltb | Op::Vsplth | Op::Vspltw => self.exec_vsplat(thread, d.op, f),
            Op::Vspltisw => self.with_state(thread, |s| {
                let imm = sign_extend5(f.uimm5) as i32;
                let bytes = imm.to_be_bytes();
                let mut v = [0u8; 16];
                for lane in v.chunks_exact_mut(4) {
                    lane.copy_from_slice(&bytes);
                }
                s.vr[f.vrt as usize] = v;
            }),
            Op::Vpkuhum => self.exec_vpkuhum(thread, f),
            Op::Vupkhsb => self.exec_vupkhsb(thread, f),
            Op::Dcbt | Op::Dcbtst | Op::Icbi | Op::Isync | Op::Sync | Op::Eieio => Ok(()),
            Op::Dcbz => self.exec_dcbz(thread, f),
            Op::Mcrf => self.with_state(thread, |s| {
                let v = s.cr_field(f.crfs);
                s.set_cr_field(f.crfd, v);
            }),
            Op::Crand | Op::Cror | Op::Crxor | Op::Crnand | Op::Crnor | Op::Creqv
            | Op::Crandc | Op::Crorc => self.exec_cr_logical(thread, d.op, d.raw),
            Op::Mftmsr => self.with_state(thread, |s| s.gpr[f.rt as usize] = s.msr),
            Op::Illegal => Err(Exception::IllegalInstruction),
        }
    }

    fn with_state(&self, thread: usize, f: impl FnOnce(&mut ThreadState)) -> Result<(), Exception> {
        let mut states = self.states.lock().unwrap();
        f(&mut states[thread]);
        Ok(())
    }

    fn exec_add_family(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.gpr[f.ra as usize];
            let b = s.gpr[f.rb as usize];
            let (res, carry, overflow) = match op {
                Op::Add | Op::Addo => {
                    let (r, c) = a.overflowing_add(b);
                    let ov = ((a as i64).checked_add(b as i64)).is_none();
                    (r, c, ov)
                }
                Op::Addc | Op::Addco => {
                    let (r, c) = a.overflowing_add(b);
                    (r, c, false)
                }
                Op::Adde | Op::Addeo => {
                    let ca = if s.xer & XER_CA != 0 { 1 } else { 0 };
                    let (r1, c1) = a.overflowing_add(b);
                    let (r2, c2) = r1.overflowing_add(ca);
                    (r2, c1 || c2, false)
                }
                Op::Addme => {
                    let ca = if s.xer & XER_CA != 0 { 1 } else { 0 };
                    let (r, c) = a.overflowing_add(u64::MAX);
                    let (r2, c2) = r.overflowing_add(ca);
                    (r2, c || c2, false)
                }
                Op::Addze => {
                    let ca = if s.xer & XER_CA != 0 { 1 } else { 0 };
                    let (r, c) = a.overflowing_add(ca);
                    (r, c, false)
                }
                Op::Subf | Op::Subfo => {
                    let r = b.wrapping_sub(a);
                    let ov = (b as i64).checked_sub(a as i64).is_none();
                    (r, a > b, ov)
                }
                Op::Subfc | Op::Subfco => {
                    let r = b.wrapping_sub(a);
                    (r, a <= b, false)
                }
                Op::Subfe => {
                    let ca = if s.xer & XER_CA != 0 { 1 } else { 0 };
                    let r = (!a).wrapping_add(b).wrapping_add(ca);
                    (r, true, false)
                }
                Op::Subfme => {
                    let ca = if s.xer & XER_CA != 0 { 1 } else { 0 };
                    let r = (!a).wrapping_add(u64::MAX).wrapping_add(ca);
                    (r, true, false)
                }
                Op::Subfze => {
                    let ca = if s.xer & XER_CA != 0 { 1 } else { 0 };
                    let r = (!a).wrapping_add(ca);
                    (r, true, false)
                }
                Op::Neg | Op::Nego => {
                    let r = (a as i64).wrapping_neg() as u64;
                    let ov = a == 0x8000_0000_0000_0000;
                    (r, false, ov)
                }
                _ => unreachable!(),
            };
            s.gpr[f.rt as usize] = res;
            set_ca(s, carry);
            if matches!(
                op,
                Op::Addo | Op::Addco | Op::Addeo | Op::Subfo | Op::Subfco | Op::Nego
            ) {
                set_ov(s, overflow);
            }
            if f.rc_flag {
                s.update_cr0(res);
            }
        })
    }

    fn exec_mul_div(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.gpr[f.ra as usize];
            let b = s.gpr[f.rb as usize];
            let res = match op {
                Op::Mullw | Op::Mullwo => {
                    ((a as i32 as i64).wrapping_mul(b as i32 as i64) as i32) as i64 as u64
                }
                Op::Mulhw => (((a as i32 as i64) * (b as i32 as i64)) >> 32) as u64,
                Op::Mulhwu => (((a as u32 as u64) * (b as u32 as u64)) >> 32) as u64,
                Op::Divw | Op::Divwo => {
                    let (a, b) = (a as i32, b as i32);
                    if b == 0 { 0 } else { (a.wrapping_div(b)) as i64 as u64 }
                }
                Op::Divwu | Op::Divwuo => {
                    let (a, b) = (a as u32, b as u32);
                    if b == 0 { 0 } else { (a / b) as u64 }
                }
                _ => unreachable!(),
            };
            s.gpr[f.rt as usize] = res;
            if f.rc_flag {
                s.update_cr0(res);
            }
        })
    }

    fn exec_logical(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let rt = s.gpr[f.rt as usize];
            let rb = s.gpr[f.rb as usize];
            let res = match op {
                Op::And => rt & rb,
                Op::Andc => rt & !rb,
                Op::Or => rt | rb,
                Op::Orc => rt | !rb,
                Op::Xor => rt ^ rb,
                Op::Nand => !(rt & rb),
                Op::Nor => !(rt | rb),
                Op::Eqv => !(rt ^ rb),
                _ => unreachable!(),
            };
            s.gpr[f.ra as usize] = res;
            if f.rc_flag {
                s.update_cr0(res);
            }
        })
    }

    fn exec_compare(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.gpr[f.ra as usize];
            let b = match op {
                Op::Cmpi | Op::Cmpli => 0,
                _ => s.gpr[f.rb as usize],
            };
            let field = match op {
                Op::Cmp => compare_signed(a as i64, s.gpr[f.rb as usize] as i64, f.l_field),
                Op::Cmpi => compare_signed(a as i64, f.simm as i64, f.l_field),
                Op::Cmpl => compare_unsigned(a, s.gpr[f.rb as usize], f.l_field),
                Op::Cmpli => compare_unsigned(a, f.uimm as u64, f.l_field),
                _ => {
                    let _ = b;
                    unreachable!()
                }
            };
            let so = (s.xer & XER_SO != 0) as u8;
            s.set_cr_field(f.crfd, field | so);
        })
    }

    fn exec_shift(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let rt = s.gpr[f.rt as usize];
            let sh = (s.gpr[f.rb as usize] & 0x3F) as u32;
            let res = match op {
                Op::Slw => {
                    if sh >= 32 { 0 } else { ((rt as u32) << sh) as u64 }
                }
                Op::Srw => {
                    if sh >= 32 { 0 } else { ((rt as u32) >> sh) as u64 }
                }
                Op::Sraw => {
                    let n = sh.min(31);
                    let val = (rt as i32) >> n;
                    let carry = (rt as i32) < 0 && (rt as u32) & ((1u32 << n) - 1) != 0;
                    set_ca(s, carry);
                    val as i64 as u64
                }
                Op::Srawi => {
                    let n = f.sh as u32;
                    let val = (rt as i32) >> n;
                    let carry = (rt as i32) < 0 && (rt as u32) & ((1u32 << n.max(1)) - 1) != 0 && n > 0;
                    set_ca(s, carry);
                    val as i64 as u64
                }
                Op::Sld => {
                    if sh >= 64 { 0 } else { rt << sh }
                }
                Op::Srd => {
                    if sh >= 64 { 0 } else { rt >> sh }
                }
                Op::Srad => {
                    let n = sh.min(63);
                    (rt as i64 >> n) as u64
                }
                Op::Sradi => {
                    let n = f.sh as u32;
                    (rt as i64 >> n) as u64
                }
                _ => unreachable!(),
            };
            s.gpr[f.ra as usize] = res;
            if f.rc_flag {
                s.update_cr0(res);
            }
        })
    }

    fn exec_mfspr(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let v = match f.spr {
                1 => (s.xer & 0xFFFF_FFFF) as u64,
                8 => s.lr,
                9 => s.ctr,
                27 => s.pid as u64,
                _ => *s.sprs.entry(f.spr).or_insert(0),
            };
            s.gpr[f.rt as usize] = v;
        })
    }

    fn exec_mtspr(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let v = s.gpr[f.rt as usize];
            match f.spr {
                1 => s.xer = v & 0xFFFF_FFFF,
                8 => s.lr = v,
                9 => s.ctr = v,
                27 => s.pid = v as u32,
                _ => {
                    s.sprs.insert(f.spr, v);
                }
            }
        })
    }

    fn exec_branch(&self, thread: usize, op: Op, raw: u32, f: Fields) -> Result<(), Exception> {
        let mut states = self.states.lock().unwrap();
        let s = &mut states[thread];
        let ctr_ok = |s: &ThreadState, bo: u8| -> bool {
            if bo & 0b00100 != 0 {
                true
            } else {
                let decremented = s.ctr.wrapping_sub(1);
                (decremented != 0) == (bo & 0b00010 == 0)
            }
        };
        let cond_ok = |s: &ThreadState, bo: u8, bi: u8| -> bool {
            if bo & 0b10000 != 0 {
                true
            } else {
                let bit = s.cr_bit(bi);
                bit == (bo & 0b01000 != 0)
            }
        };
        match op {
            Op::B => {
                let target = if f.aa { f.bd as i64 as u64 } else { s.pc.wrapping_add(f.bd as i64 as u64) };
                if f.lk {
                    s.lr = s.pc.wrapping_add(4);
                }
                s.pc = target;
                return Ok(());
            }
            Op::Bc => {
                if f.bo & 0b00100 == 0 {
                    s.ctr = s.ctr.wrapping_sub(1);
                }
                let take = ctr_ok_no_decrement(s.ctr, f.bo) && cond_ok(s, f.bo, f.bi);
                if take {
                    let target = if f.aa {
                        f.bd as i64 as u64
                    } else {
                        s.pc.wrapping_add(f.bd as i64 as u64)
                    };
                    if f.lk {
                        s.lr = s.pc.wrapping_add(4);
                    }
                    s.pc = target;
                } else if f.lk {
                    s.lr = s.pc.wrapping_add(4);
                    s.pc = s.pc.wrapping_add(4);
                } else {
                    s.pc = s.pc.wrapping_add(4);
                }
                return Ok(());
            }
            Op::Bcctr => {
                if cond_ok(s, f.bo, f.bi) {
                    let target = s.ctr & !0x3;
                    if f.lk {
                        s.lr = s.pc.wrapping_add(4);
                    }
                    s.pc = target;
                } else {
                    s.pc = s.pc.wrapping_add(4);
                }
                return Ok(());
            }
            Op::Bclr => {
                let take_ctr = ctr_ok(s, f.bo);
                let mut take = take_ctr && cond_ok(s, f.bo, f.bi);
                for skip in self.hw_init_skip.iter().flatten() {
                    if s.pc == skip.address {
                        take = skip.force_taken;
                    }
                }
                if take {
                    let target = s.lr & !0x3;
                    if f.lk {
                        s.lr = s.pc.wrapping_add(4);
                    }
                    s.pc = target;
                } else {
                    s.pc = s.pc.wrapping_add(4);
                }
                return Ok(());
            }
            _ => {
                let _ = raw;
                unreachable!()
            }
        }
    }

    fn exec_cr_logical(&self, thread: usize, op: Op, raw: u32) -> Result<(), Exception> {
        let bt = ((raw >> 21) & 0x1F) as u8;
        let ba = ((raw >> 16) & 0x1F) as u8;
        let bb = ((raw >> 11) & 0x1F) as u8;
        self.with_state(thread, |s| {
            let a = s.cr_bit(ba);
            let b = s.cr_bit(bb);
            let res = match op {
                Op::Crand => a && b,
                Op::Cror => a || b,
                Op::Crxor => a ^ b,
                Op::Crnand => !(a && b),
                Op::Crnor => !(a || b),
                Op::Creqv => a == b,
                Op::Crandc => a && !b,
                Op::Crorc => a || !b,
                _ => unreachable!(),
            };
            s.set_cr_bit(bt, res);
        })
    }

    fn exec_load(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        let (addr, width, signed, with_update) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            let ea = base.wrapping_add(f.simm as i64 as u64);
            match op {
                Op::Lwz => (ea, 4, false, false),
                Op::Lwzu => (ea, 4, false, true),
                Op::Lbz => (ea, 1, false, false),
                Op::Lbzu => (ea, 1, false, true),
                Op::Lhz => (ea, 2, false, false),
                Op::Lhzu => (ea, 2, false, true),
                Op::Lha => (ea, 2, true, false),
                Op::Lhau => (ea, 2, true, true),
                Op::Ld | Op::Lwa => (ea, 8, false, false),
                Op::Ldu => (ea, 8, false, true),
                _ => unreachable!(),
            }
        };
        let value = self.load_width(thread, addr, width)?;
        self.with_state(thread, |s| {
            let extended = match (width, signed) {
                (1, false) => value & 0xFF,
                (2, false) => value & 0xFFFF,
                (2, true) => (value as i16) as i64 as u64,
                (4, _) if matches!(op, Op::Lwa) => (value as i32) as i64 as u64,
                (4, _) => value & 0xFFFF_FFFF,
                _ => value,
            };
            s.gpr[f.rt as usize] = extended;
            if with_update {
                let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
                s.gpr[f.ra as usize] = base.wrapping_add(f.simm as i64 as u64);
            }
        })
    }

    fn exec_store(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        let (addr, width, value, with_update) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            let ea = base.wrapping_add(f.simm as i64 as u64);
            let value = s.gpr[f.rt as usize];
            match op {
                Op::Stw => (ea, 4, value, false),
                Op::Stwu => (ea, 4, value, true),
                Op::Stb => (ea, 1, value, false),
                Op::Stbu => (ea, 1, value, true),
                Op::Sth => (ea, 2, value, false),
                Op::Sthu => (ea, 2, value, true),
                Op::Std => (ea, 8, value, false),
                Op::Stdu => (ea, 8, value, true),
                _ => unreachable!(),
            }
        };
        self.store_width(thread, addr, width, value)?;
        if with_update {
            self.with_state(thread, |s| {
                let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
                s.gpr[f.ra as usize] = base.wrapping_add(f.simm as i64 as u64);
            })?;
        }
        Ok(())
    }

    fn exec_larx(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        let width: u8 = if matches!(op, Op::Ldarx) { 8 } else { 4 };
        let addr = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            base.wrapping_add(s.gpr[f.rb as usize])
        };
        let phys = self.physical_address(thread, addr)?;
        let value = self.load_width(thread, addr, width)?;
        self.mmu.set_reservation(thread, phys);
        self.with_state(thread, |s| {
            s.gpr[f.rt as usize] = if width == 4 { value & 0xFFFF_FFFF } else { value };
        })
    }

    fn exec_stcx(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        let width: u8 = if matches!(op, Op::Stdcx) { 8 } else { 4 };
        let (addr, value) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            (base.wrapping_add(s.gpr[f.rb as usize]), s.gpr[f.rt as usize])
        };
        let phys = self.physical_address(thread, addr)?;
        let ok = self.mmu.check_and_clear_reservation(thread, phys);
        if ok {
            self.store_width(thread, addr, width, value)?;
        }
        self.with_state(thread, |s| {
            let so = (s.xer & XER_SO != 0) as u8;
            s.set_cr_field(0, if ok { 0b0010 | so } else { so });
        })
    }

    fn exec_fp_arith(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.fpr[f.fra as usize];
            let b = s.fpr[f.frb as usize];
            let res = match op {
                Op::Fadd => a + b,
                Op::Fsub => a - b,
                Op::Fmul => a * s.fpr[f.frc as usize],
                Op::Fdiv => a / b,
                _ => unreachable!(),
            };
            s.fpr[f.frt as usize] = res;
            update_fpscr_cr1(s, f.rc_flag);
        })
    }

    fn exec_fp_madd(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.fpr[f.fra as usize];
            let b = s.fpr[f.frb as usize];
            let c = s.fpr[f.frc as usize];
            let res = match op {
                Op::Fmadd => a * c + b,
                Op::Fmsub => a * c - b,
                Op::Fnmadd => -(a * c + b),
                Op::Fnmsub => -(a * c - b),
                _ => unreachable!(),
            };
            s.fpr[f.frt as usize] = res;
            update_fpscr_cr1(s, f.rc_flag);
        })
    }

    fn exec_fcmp(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.fpr[f.fra as usize];
            let b = s.fpr[f.frb as usize];
            let field: u8 = if a.is_nan() || b.is_nan() {
                0b0001
            } else if a < b {
                0b1000
            } else if a > b {
                0b0100
            } else {
                0b0010
            };
            s.set_cr_field(f.crfd, field);
            // FPSCR FL/FG/FE/FU mirror the comparison result in bits 15-12.
            s.fpscr = (s.fpscr & !0xF000) | ((field as u32) << 12);
        })
    }

    fn exec_load_fp(&self, thread: usize, f: Fields, width: u8) -> Result<(), Exception> {
        let addr = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            base.wrapping_add(f.simm as i64 as u64)
        };
        let raw = self.load_width(thread, addr, width)?;
        self.with_state(thread, |s| {
            s.fpr[f.frt as usize] = if width == 4 {
                f32::from_bits(raw as u32) as f64
            } else {
                f64::from_bits(raw)
            };
        })
    }

    fn exec_store_fp(&self, thread: usize, f: Fields, width: u8) -> Result<(), Exception> {
        let (addr, raw) = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            let ea = base.wrapping_add(f.simm as i64 as u64);
            let raw = if width == 4 {
                (s.fpr[f.frt as usize] as f32).to_bits() as u64
            } else {
                s.fpr[f.frt as usize].to_bits()
            };
            (ea, raw)
        };
        self.store_width(thread, addr, width, raw)
    }

    fn exec_vector_alu(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.vr[f.vra as usize];
            let b = s.vr[f.vrb as usize];
            let mut out = [0u8; 16];
            match op {
                Op::Vaddubm => {
                    for i in 0..16 {
                        out[i] = a[i].wrapping_add(b[i]);
                    }
                }
                Op::Vsububm => {
                    for i in 0..16 {
                        out[i] = a[i].wrapping_sub(b[i]);
                    }
                }
                Op::Vand => {
                    for i in 0..16 {
                        out[i] = a[i] & b[i];
                    }
                }
                Op::Vandc => {
                    for i in 0..16 {
                        out[i] = a[i] & !b[i];
                    }
                }
                Op::Vor => {
                    for i in 0..16 {
                        out[i] = a[i] | b[i];
                    }
                }
                Op::Vxor => {
                    for i in 0..16 {
                        out[i] = a[i] ^ b[i];
                    }
                }
                Op::Vnor => {
                    for i in 0..16 {
                        out[i] = !(a[i] | b[i]);
                    }
                }
                Op::Vaddsws => {
                    for lane in 0..4 {
                        let av = i32::from_be_bytes(a[lane * 4..lane * 4 + 4].try_into().unwrap());
                        let bv = i32::from_be_bytes(b[lane * 4..lane * 4 + 4].try_into().unwrap());
                        let sum = av.saturating_add(bv);
                        out[lane * 4..lane * 4 + 4].copy_from_slice(&sum.to_be_bytes());
                    }
                }
                _ => unreachable!(),
            }
            s.vr[f.vrt as usize] = out;
        })
    }

    fn exec_vsldoi(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.vr[f.vra as usize];
            let b = s.vr[f.vrb as usize];
            let shb = f.shb as usize & 0xF;
            let mut combined = [0u8; 32];
            combined[..16].copy_from_slice(&a);
            combined[16..].copy_from_slice(&b);
            let mut out = [0u8; 16];
            out.copy_from_slice(&combined[shb..shb + 16]);
            s.vr[f.vrt as usize] = out;
        })
    }

    fn exec_vperm(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.vr[f.vra as usize];
            let b = s.vr[f.vrb as usize];
            let sel = s.vr[f.vrc as usize];
            let mut out = [0u8; 16];
            for i in 0..16 {
                let idx = (sel[i] & 0x1F) as usize;
                out[i] = if idx < 16 { a[idx] } else { b[idx - 16] };
            }
            s.vr[f.vrt as usize] = out;
        })
    }

    fn exec_vsplat(&self, thread: usize, op: Op, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let b = s.vr[f.vrb as usize];
            let mut out = [0u8; 16];
            match op {
                Op::Vspltb => {
                    let byte = b[(f.uimm5 & 0xF) as usize];
                    out = [byte; 16];
                }
                Op::Vsplth => {
                    let idx = (f.uimm5 & 0x7) as usize * 2;
                    let halfword = [b[idx], b[idx + 1]];
                    for lane in out.chunks_exact_mut(2) {
                        lane.copy_from_slice(&halfword);
                    }
                }
                Op::Vspltw => {
                    let idx = (f.uimm5 & 0x3) as usize * 4;
                    let word: [u8; 4] = b[idx..idx + 4].try_into().unwrap();
                    for lane in out.chunks_exact_mut(4) {
                        lane.copy_from_slice(&word);
                    }
                }
                _ => unreachable!(),
            }
            s.vr[f.vrt as usize] = out;
        })
    }

    fn exec_vpkuhum(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let a = s.vr[f.vra as usize];
            let b = s.vr[f.vrb as usize];
            let mut out = [0u8; 16];
            for i in 0..8 {
                out[i] = a[i * 2 + 1];
                out[i + 8] = b[i * 2 + 1];
            }
            s.vr[f.vrt as usize] = out;
        })
    }

    fn exec_vupkhsb(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        self.with_state(thread, |s| {
            let b = s.vr[f.vrb as usize];
            let mut out = [0u8; 16];
            for i in 0..8 {
                let extended = (b[i] as i8 as i16) as u16;
                out[i * 2..i * 2 + 2].copy_from_slice(&extended.to_be_bytes());
            }
            s.vr[f.vrt as usize] = out;
        })
    }

    fn exec_dcbz(&self, thread: usize, f: Fields) -> Result<(), Exception> {
        let addr = {
            let states = self.states.lock().unwrap();
            let s = &states[thread];
            let base = if f.ra == 0 { 0 } else { s.gpr[f.ra as usize] };
            (base.wrapping_add(s.gpr[f.rb as usize])) & !0x7F
        };
        let phys = self.physical_address(thread, addr)?;
        self.bus.memset(phys, 0, 128);
        self.mmu.invalidate_reservations(phys);
        Ok(())
    }
}

fn set_ca(s: &mut ThreadState, carry: bool) {
    if carry {
        s.xer |= XER_CA;
    } else {
        s.xer &= !XER_CA;
    }
}

fn set_ov(s: &mut ThreadState, overflow: bool) {
    if overflow {
        s.xer |= XER_OV | XER_SO;
    } else {
        s.xer &= !XER_OV;
    }
}

fn update_fpscr_cr1(s: &mut ThreadState, rc: bool) {
    if rc {
        // Copies FX/FEX/VX/OX (bits 0-3 of FPSCR) into CR1.
        let top = (s.fpscr >> 28) as u8;
        s.set_cr_field(1, top);
    }
}

fn compare_signed(a: i64, b: i64, _l: bool) -> u8 {
    if a < b {
        0b1000
    } else if a > b {
        0b0100
    } else {
        0b0010
    }
}

fn compare_unsigned(a: u64, b: u64, _l: bool) -> u8 {
    if a < b {
        0b1000
    } else if a > b {
        0b0100
    } else {
        0b0010
    }
}

fn ctr_ok_no_decrement(ctr: u64, bo: u8) -> bool {
    if bo & 0b00100 != 0 {
        true
    } else {
        (ctr != 0) == (bo & 0b00010 == 0)
    }
}

fn sign_extend5(v: u8) -> i8 {
    ((v << 3) as i8) >> 3
}
