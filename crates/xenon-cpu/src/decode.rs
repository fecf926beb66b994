//! Table-driven instruction decode.
//!
//! The primary opcode (bits 0-5) indexes into [`decode`]'s top-level match,
//! which either resolves a mnemonic directly or indirects through a
//! secondary match keyed on the extended opcode (`XO`) field, mirroring how
//! the real decode tables are laid out in silicon.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add, Addo, Addc, Addco, Adde, Addeo, Addi, Addic, AddicDot, Addis, Addme, Addze,
    Subf, Subfo, Subfc, Subfco, Subfe, Subfic, Subfme, Subfze, Neg, Nego,
    Mulli, Mullw, Mullwo, Mulhw, Mulhwu, Divw, Divwo, Divwu, Divwuo,
    And, Andc, Or, Orc, Xor, Nand, Nor, Eqv, Andi, Andis, Ori, Oris, Xori, Xoris,
    Cmp, Cmpi, Cmpl, Cmpli,
    Slw, Srw, Sraw, Srawi, Sld, Srd, Srad, Sradi,
    Extsb, Extsh, Extsw, Cntlzw, Cntlzd,
    B, Bc, Bcctr, Bclr, Sc, Rfid,
    Mfspr, Mtspr, Mfmsr, Mtmsr, Mftb, Tlbiel, Tlbsync, Slbmte,
    Lwz, Lwzu, Lbz, Lbzu, Lhz, Lhzu, Lha, Lhau, Ld, Ldu, Lwa,
    Stw, Stwu, Stb, Stbu, Sth, Sthu, Std, Stdu,
    Lwarx, Stwcx, Ldarx, Stdcx,
    Fadd, Fsub, Fmul, Fdiv, Fmadd, Fmsub, Fnmadd, Fnmsub,
    Fabs, Fneg, Fmr, Fsqrt, Fcmpu, Fcmpo, Frsp, Fctiwz, Fcfid,
    Lfd, Lfs, Stfd, Stfs,
    Vaddubm, Vsububm, Vand, Vandc, Vor, Vxor, Vnor, Vsldoi, Vperm,
    Vspltb, Vsplth, Vspltw, Vspltisw, Vaddsws, Vpkuhum, Vupkhsb,
    Dcbt, Dcbtst, Dcbz, Icbi, Isync, Sync, Eieio, Mftmsr,
    Mcrf, Crand, Cror, Crxor, Crnand, Crnor, Creqv, Crandc, Crorc,
    Illegal,
}

/// Decoded instruction fields. Not every field is meaningful for every
/// `Op`; the executor reads only the ones its mnemonic defines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fields {
    pub rt: u8,
    pub ra: u8,
    pub rb: u8,
    pub rc: u8, // third FP/vector source register
    pub frt: u8,
    pub fra: u8,
    pub frb: u8,
    pub frc: u8,
    pub vrt: u8,
    pub vra: u8,
    pub vrb: u8,
    pub vrc: u8,
    pub simm: i32,
    pub uimm: u32,
    pub bd: i32,
    pub bo: u8,
    pub bi: u8,
    pub aa: bool,
    pub lk: bool,
    pub oe: bool,
    pub rc_flag: bool,
    pub spr: u32,
    pub sh: u8,
    pub mb: u8,
    pub me: u8,
    pub crfd: u8,
    pub crfs: u8,
    pub l_field: bool,
    pub shb: u8,
    pub uimm5: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub op: Op,
    pub fields: Fields,
    pub raw: u32,
}

fn bits(word: u32, hi: u32, lo: u32) -> u32 {
    let width = hi - lo + 1;
    let mask = if width == 32 { u32::MAX } else { (1u32 << width) - 1 };
    (word >> lo) & mask
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

pub fn decode(word: u32) -> Decoded {
    let primary = bits(word, 31, 26);
    let f = extract_common(word);
    let op = match primary {
        14 => Op::Addi,
        15 => Op::Addis,
        12 => Op::Addic,
        13 => Op::AddicDot,
        7 => Op::Mulli,
        8 => Op::Subfic,
        11 => {
            if f.l_field { Op::Cmpi } else { Op::Cmpi }
        }
        10 => Op::Cmpli,
        28 => Op::Andi,
        29 => Op::Andis,
        24 => Op::Ori,
        25 => Op::Oris,
        26 => Op::Xori,
        27 => Op::Xoris,
        18 => Op::B,
        16 => Op::Bc,
        17 => Op::Sc,
        32 => Op::Lwz,
        33 => Op::Lwzu,
        34 => Op::Lbz,
        35 => Op::Lbzu,
        40 => Op::Lhz,
        41 => Op::Lhzu,
        42 => Op::Lha,
        43 => Op::Lhau,
        36 => Op::Stw,
        37 => Op::Stwu,
        38 => Op::Stb,
        39 => Op::Stbu,
        44 => Op::Sth,
        45 => Op::Sthu,
        48 => Op::Lfs,
        50 => Op::Lfd,
        52 => Op::Stfs,
        54 => Op::Stfd,
        58 => match bits(word, 1, 0) {
            0 => Op::Ld,
            1 => Op::Ldu,
            2 => Op::Lwa,
            _ => Op::Illegal,
        },
        62 => match bits(word, 1, 0) {
            0 => Op::Std,
            1 => Op::Stdu,
            _ => Op::Illegal,
        },
        19 => decode_opcode19(word),
        31 => decode_opcode31(word),
        59 => decode_opcode59(word),
        63 => decode_opcode63(word),
        4 => decode_opcode4(word),
        _ => Op::Illegal,
    };
    Decoded { op, fields: f, raw: word }
}

fn extract_common(word: u32) -> Fields {
    let rt = bits(word, 25, 21) as u8;
    let ra = bits(word, 20, 16) as u8;
    let rb = bits(word, 15, 11) as u8;
    let rc = bits(word, 10, 6) as u8;
    Fields {
        rt,
        ra,
        rb,
        rc,
        frt: rt,
        fra: ra,
        frb: rb,
        frc: rc,
        vrt: rt,
        vra: ra,
        vrb: rb,
        vrc: rc,
        simm: sign_extend(bits(word, 15, 0), 16),
        uimm: bits(word, 15, 0),
        bd: sign_extend(bits(word, 15, 2) << 2, 16),
        bo: bits(word, 25, 21) as u8,
        bi: bits(word, 20, 16) as u8,
        aa: bits(word, 1, 1) != 0,
        lk: bits(word, 0, 0) != 0,
        oe: bits(word, 10, 10) != 0,
        rc_flag: bits(word, 0, 0) != 0,
        spr: (bits(word, 15, 11) | (bits(word, 20, 16) << 5)),
        sh: bits(word, 15, 11) as u8,
        mb: bits(word, 10, 6) as u8,
        me: bits(word, 5, 1) as u8,
        crfd: bits(word, 25, 23) as u8,
        crfs: bits(word, 20, 18) as u8,
        l_field: bits(word, 21, 21) != 0,
        shb: bits(word, 9, 6) as u8,
        uimm5: bits(word, 20, 16) as u8,
    }
}

fn decode_opcode4(word: u32) -> Op {
    let xo = bits(word, 10, 0);
    match xo {
        0x000 => Op::Vaddubm,
        0x400 => Op::Vsububm,
        0x404 => Op::Vand,
        0x444 => Op::Vandc,
        0x484 => Op::Vor,
        0x4C4 => Op::Vxor,
        0x504 => Op::Vnor,
        0x34A => Op::Vspltb,
        0x38A => Op::Vsplth,
        0x3CA => Op::Vspltw,
        0x30C => Op::Vspltisw,
        0x380 => Op::Vaddsws,
        0x38E => Op::Vpkuhum,
        0x20E => Op::Vupkhsb,
        _ => {
            if bits(word, 5, 0) == 0x2A {
                Op::Vsldoi
            } else if bits(word, 5, 0) == 0x2B {
                Op::Vperm
            } else {
                Op::Illegal
            }
        }
    }
}

fn decode_opcode19(word: u32) -> Op {
    let xo = bits(word, 10, 1);
    match xo {
        0 => Op::Mcrf,
        16 => Op::Bclr,
        528 => Op::Bcctr,
        150 => Op::Isync,
        257 => Op::Crand,
        449 => Op::Cror,
        193 => Op::Crxor,
        225 => Op::Crnand,
        33 => Op::Crnor,
        289 => Op::Creqv,
        129 => Op::Crandc,
        417 => Op::Crorc,
        _ => Op::Illegal,
    }
}

fn decode_opcode31(word: u32) -> Op {
    let xo = bits(word, 10, 1);
    match xo {
        266 => Op::Add,
        10 => Op::Addc,
        138 => Op::Adde,
        234 => Op::Addme,
        202 => Op::Addze,
        40 => Op::Subf,
        8 => Op::Subfc,
        136 => Op::Subfe,
        232 => Op::Subfme,
        200 => Op::Subfze,
        104 => Op::Neg,
        235 => Op::Mullw,
        75 => Op::Mulhw,
        11 => Op::Mulhwu,
        491 => Op::Divw,
        459 => Op::Divwu,
        28 => Op::And,
        60 => Op::Andc,
        444 => Op::Or,
        412 => Op::Orc,
        316 => Op::Xor,
        476 => Op::Nand,
        124 => Op::Nor,
        284 => Op::Eqv,
        0 => Op::Cmp,
        32 => Op::Cmpl,
        24 => Op::Slw,
        536 => Op::Srw,
        792 => Op::Sraw,
        824 => Op::Srawi,
        27 => Op::Sld,
        539 => Op::Srd,
        794 => Op::Srad,
        413 => Op::Sradi,
        954 => Op::Extsb,
        922 => Op::Extsh,
        986 => Op::Extsw,
        26 => Op::Cntlzw,
        58 => Op::Cntlzd,
        339 => Op::Mfspr,
        467 => Op::Mtspr,
        83 => Op::Mfmsr,
        146 => Op::Mtmsr,
        371 => Op::Mftb,
        566 => Op::Tlbsync,
        402 => Op::Slbmte,
        306 => Op::Tlbiel,
        20 => Op::Lwarx,
        150 => Op::Stwcx,
        84 => Op::Ldarx,
        214 => Op::Stdcx,
        278 => Op::Dcbt,
        246 => Op::Dcbtst,
        1014 => Op::Dcbz,
        982 => Op::Icbi,
        598 => Op::Sync,
        854 => Op::Eieio,
        _ => Op::Illegal,
    }
}

fn decode_opcode59(word: u32) -> Op {
    let xo = bits(word, 5, 1);
    match xo {
        21 => Op::Fadd,
        20 => Op::Fsub,
        25 => Op::Fmul,
        18 => Op::Fdiv,
        29 => Op::Fmadd,
        28 => Op::Fmsub,
        31 => Op::Fnmadd,
        30 => Op::Fnmsub,
        _ => Op::Illegal,
    }
}

fn decode_opcode63(word: u32) -> Op {
    let xo = bits(word, 10, 1);
    match xo {
        21 => Op::Fadd,
        20 => Op::Fsub,
        25 => Op::Fmul,
        18 => Op::Fdiv,
        264 => Op::Fabs,
        40 => Op::Fneg,
        72 => Op::Fmr,
        22 => Op::Fsqrt,
        0 => Op::Fcmpu,
        32 => Op::Fcmpo,
        12 => Op::Frsp,
        14 => Op::Fctiwz,
        846 => Op::Fcfid,
        _ => {
            let xo_full = bits(word, 5, 1);
            match xo_full {
                29 => Op::Fmadd,
                28 => Op::Fmsub,
                31 => Op::Fnmadd,
                30 => Op::Fnmsub,
                _ => Op::Illegal,
            }
        }
    }
}
