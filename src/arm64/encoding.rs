//! ARM64 (AArch64) Instruction Encoding
//!
//! Encodes ARM64 instructions into 32-bit machine code.
//! All ARM64 instructions are exactly 4 bytes, little-endian.
//!
//! Branch and page-relative encoders take a displacement; code that does not
//! know the displacement yet emits a zero placeholder and patches it later
//! with [`patch_branch`], [`patch_adrp`] and [`patch_imm12`].

use super::registers::{DReg, Reg64};

/// Encode a 32-bit instruction and append to buffer
fn emit(buf: &mut Vec<u8>, insn: u32) {
    buf.extend_from_slice(&insn.to_le_bytes());
}

/// Read the instruction word stored at `at`
pub fn read_insn(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Overwrite the instruction word stored at `at`
pub fn write_insn(buf: &mut [u8], at: usize, insn: u32) -> Option<()> {
    let slot = buf.get_mut(at..at + 4)?;
    slot.copy_from_slice(&insn.to_le_bytes());
    Some(())
}

fn rd(r: Reg64) -> u32 {
    r.encoding() as u32
}

fn rn(r: Reg64) -> u32 {
    (r.encoding() as u32) << 5
}

fn rm(r: Reg64) -> u32 {
    (r.encoding() as u32) << 16
}

fn dd(r: DReg) -> u32 {
    r.encoding() as u32
}

fn dn(r: DReg) -> u32 {
    (r.encoding() as u32) << 5
}

fn dm(r: DReg) -> u32 {
    (r.encoding() as u32) << 16
}

// =============================================================================
// Data Processing - Immediate
// =============================================================================

/// MOV (immediate) - Move wide immediate to register (MOVZ)
/// Encodes: MOVZ Xd, #imm16, LSL #shift
pub fn movz_x(buf: &mut Vec<u8>, rd_: Reg64, imm16: u16, shift: u8) {
    // MOVZ (64-bit): 1 10 100101 hw imm16 Rd
    let hw = (shift / 16) as u32;
    emit(buf, 0xD2800000 | (hw << 21) | ((imm16 as u32) << 5) | rd(rd_));
}

/// MOVN - Move wide with NOT
/// Encodes: MOVN Xd, #imm16, LSL #shift (Xd = !(imm16 << shift))
pub fn movn_x(buf: &mut Vec<u8>, rd_: Reg64, imm16: u16, shift: u8) {
    // MOVN (64-bit): 1 00 100101 hw imm16 Rd
    let hw = (shift / 16) as u32;
    emit(buf, 0x92800000 | (hw << 21) | ((imm16 as u32) << 5) | rd(rd_));
}

/// MOVK - Move wide with keep (for building larger immediates)
pub fn movk_x(buf: &mut Vec<u8>, rd_: Reg64, imm16: u16, shift: u8) {
    // MOVK (64-bit): 1 11 100101 hw imm16 Rd
    let hw = (shift / 16) as u32;
    emit(buf, 0xF2800000 | (hw << 21) | ((imm16 as u32) << 5) | rd(rd_));
}

/// ADD (immediate) - Add immediate to register
/// Encodes: ADD Xd, Xn, #imm12. Register 31 is SP on both sides, so
/// `add_imm_x(buf, X28, SP, 0)` is `mov x28, sp`.
pub fn add_imm_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, imm12: u16) {
    // ADD (64-bit): 1 00 10001 shift imm12 Rn Rd
    emit(buf, 0x91000000 | (((imm12 & 0xFFF) as u32) << 10) | rn(rn_) | rd(rd_));
}

/// SUB (immediate) - Subtract immediate from register
pub fn sub_imm_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, imm12: u16) {
    // SUB (64-bit): 1 10 10001 shift imm12 Rn Rd
    emit(buf, 0xD1000000 | (((imm12 & 0xFFF) as u32) << 10) | rn(rn_) | rd(rd_));
}

/// ADRP - Form PC-relative address to 4KB page
/// `pages` is the signed page delta between the target and this instruction.
pub fn adrp(buf: &mut Vec<u8>, rd_: Reg64, pages: i32) {
    emit(buf, adrp_word(rd_.encoding() as u32, pages));
}

fn adrp_word(rd_: u32, pages: i32) -> u32 {
    // ADRP: 1 immlo 10000 immhi Rd
    let imm = (pages as u32) & 0x1F_FFFF;
    let immlo = imm & 0b11;
    let immhi = imm >> 2;
    0x90000000 | (immlo << 29) | (immhi << 5) | rd_
}

// =============================================================================
// Data Processing - Register
// =============================================================================

/// MOV (register) - Move register to register (alias for ORR)
/// Encodes: ORR Xd, XZR, Xm. Neither operand may be SP.
pub fn mov_x(buf: &mut Vec<u8>, rd_: Reg64, rm_: Reg64) {
    // ORR Xd, XZR, Xm: 1 01 01010 shift 0 Xm imm6 XZR Xd
    emit(buf, 0xAA0003E0 | rm(rm_) | rd(rd_));
}

/// ADD (register) - Add two registers
/// Encodes: ADD Xd, Xn, Xm
pub fn add_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64) {
    // ADD (shifted): 1 00 01011 shift 0 Rm imm6 Rn Rd
    emit(buf, 0x8B000000 | rm(rm_) | rn(rn_) | rd(rd_));
}

/// SUB (register) - Subtract two registers
pub fn sub_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64) {
    // SUB (shifted): 1 10 01011 shift 0 Rm imm6 Rn Rd
    emit(buf, 0xCB000000 | rm(rm_) | rn(rn_) | rd(rd_));
}

/// NEG - Negate (alias for SUB Xd, XZR, Xm)
pub fn neg_x(buf: &mut Vec<u8>, rd_: Reg64, rm_: Reg64) {
    emit(buf, 0xCB0003E0 | rm(rm_) | rd(rd_));
}

/// MUL (register) - Multiply two registers
/// Encodes: MADD Xd, Xn, Xm, XZR
pub fn mul_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64) {
    // MADD: 1 00 11011 000 Rm 0 11111 Rn Rd (Ra = XZR = 31)
    emit(buf, 0x9B007C00 | rm(rm_) | rn(rn_) | rd(rd_));
}

/// SDIV - Signed divide. Division by zero yields zero.
pub fn sdiv_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64) {
    // SDIV: 1 00 11010110 Rm 00001 1 Rn Rd
    emit(buf, 0x9AC00C00 | rm(rm_) | rn(rn_) | rd(rd_));
}

/// MSUB - Multiply-subtract (for modulo: a - (a/b)*b)
/// Encodes: MSUB Xd, Xn, Xm, Xa (Xd = Xa - Xn*Xm)
pub fn msub_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64, ra: Reg64) {
    // MSUB: 1 00 11011 000 Rm 1 Ra Rn Rd
    emit(
        buf,
        0x9B008000 | rm(rm_) | ((ra.encoding() as u32) << 10) | rn(rn_) | rd(rd_),
    );
}

/// AND (shifted register) - Bitwise AND
pub fn and_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64) {
    // AND: 1 00 01010 shift 0 Rm imm6 Rn Rd
    emit(buf, 0x8A000000 | rm(rm_) | rn(rn_) | rd(rd_));
}

/// ORR (shifted register) - Bitwise OR
pub fn orr_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64) {
    // ORR: 1 01 01010 shift 0 Rm imm6 Rn Rd
    emit(buf, 0xAA000000 | rm(rm_) | rn(rn_) | rd(rd_));
}

// =============================================================================
// Comparison and Conditionals
// =============================================================================

/// CMP (register) - Compare two registers (alias for SUBS with Xd = XZR)
pub fn cmp_x(buf: &mut Vec<u8>, rn_: Reg64, rm_: Reg64) {
    // SUBS XZR, Xn, Xm: 1 11 01011 shift 0 Rm imm6 Rn 11111
    emit(buf, 0xEB00001F | rm(rm_) | rn(rn_));
}

/// CMP (immediate) - Compare register with immediate
pub fn cmp_imm_x(buf: &mut Vec<u8>, rn_: Reg64, imm12: u16) {
    // SUBS XZR, Xn, #imm12: 1 11 10001 shift imm12 Rn 11111
    emit(buf, 0xF100001F | (((imm12 & 0xFFF) as u32) << 10) | rn(rn_));
}

/// CSET - Conditional set (set 1 if condition, else 0)
/// Encodes: CSINC Xd, XZR, XZR, invert(cond)
pub fn cset_x(buf: &mut Vec<u8>, rd_: Reg64, cond: Condition) {
    let inv_cond = cond.invert();
    emit(buf, 0x9A9F07E0 | ((inv_cond as u32) << 12) | rd(rd_));
}

/// CSEL - Conditional select
/// Encodes: CSEL Xd, Xn, Xm, cond (Xd = cond ? Xn : Xm)
pub fn csel_x(buf: &mut Vec<u8>, rd_: Reg64, rn_: Reg64, rm_: Reg64, cond: Condition) {
    // CSEL: 1 00 11010100 Rm cond 00 Rn Rd
    emit(buf, 0x9A800000 | rm(rm_) | ((cond as u32) << 12) | rn(rn_) | rd(rd_));
}

/// ARM64 condition codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Condition {
    EQ = 0b0000, // Equal
    NE = 0b0001, // Not equal
    CS = 0b0010, // Carry set / unsigned >=
    CC = 0b0011, // Carry clear / unsigned <
    MI = 0b0100, // Minus / negative; float <
    PL = 0b0101, // Plus / positive or zero
    VS = 0b0110, // Overflow; float unordered
    VC = 0b0111, // No overflow
    HI = 0b1000, // Unsigned >
    LS = 0b1001, // Unsigned <=; float <=
    GE = 0b1010, // Signed >=
    LT = 0b1011, // Signed <
    GT = 0b1100, // Signed >
    LE = 0b1101, // Signed <=
    AL = 0b1110, // Always
    NV = 0b1111, // Never (reserved)
}

impl Condition {
    const ALL: [Condition; 16] = [
        Condition::EQ,
        Condition::NE,
        Condition::CS,
        Condition::CC,
        Condition::MI,
        Condition::PL,
        Condition::VS,
        Condition::VC,
        Condition::HI,
        Condition::LS,
        Condition::GE,
        Condition::LT,
        Condition::GT,
        Condition::LE,
        Condition::AL,
        Condition::NV,
    ];

    /// Get the inverted condition
    pub fn invert(self) -> Condition {
        // Toggle the least significant bit
        Self::ALL[((self as u8) ^ 1) as usize]
    }
}

// =============================================================================
// Floating Point (double precision)
// =============================================================================

/// FADD Dd, Dn, Dm
pub fn fadd_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg, rm_: DReg) {
    emit(buf, 0x1E602800 | dm(rm_) | dn(rn_) | dd(rd_));
}

/// FSUB Dd, Dn, Dm
pub fn fsub_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg, rm_: DReg) {
    emit(buf, 0x1E603800 | dm(rm_) | dn(rn_) | dd(rd_));
}

/// FMUL Dd, Dn, Dm
pub fn fmul_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg, rm_: DReg) {
    emit(buf, 0x1E600800 | dm(rm_) | dn(rn_) | dd(rd_));
}

/// FDIV Dd, Dn, Dm
pub fn fdiv_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg, rm_: DReg) {
    emit(buf, 0x1E601800 | dm(rm_) | dn(rn_) | dd(rd_));
}

/// FMSUB Dd, Dn, Dm, Da (Dd = Da - Dn*Dm, fused)
pub fn fmsub_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg, rm_: DReg, ra: DReg) {
    emit(
        buf,
        0x1F408000 | dm(rm_) | ((ra.encoding() as u32) << 10) | dn(rn_) | dd(rd_),
    );
}

/// FRINTZ Dd, Dn - Round toward zero
pub fn frintz_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg) {
    emit(buf, 0x1E65C000 | dn(rn_) | dd(rd_));
}

/// FNEG Dd, Dn
pub fn fneg_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg) {
    emit(buf, 0x1E614000 | dn(rn_) | dd(rd_));
}

/// FMOV Dd, Dn
pub fn fmov_d(buf: &mut Vec<u8>, rd_: DReg, rn_: DReg) {
    emit(buf, 0x1E604000 | dn(rn_) | dd(rd_));
}

/// FCMP Dn, Dm
pub fn fcmp_d(buf: &mut Vec<u8>, rn_: DReg, rm_: DReg) {
    emit(buf, 0x1E602000 | dm(rm_) | dn(rn_));
}

/// FCMP Dn, #0.0
pub fn fcmp_zero_d(buf: &mut Vec<u8>, rn_: DReg) {
    emit(buf, 0x1E602008 | dn(rn_));
}

/// SCVTF Dd, Xn - Signed integer to double
pub fn scvtf_d_x(buf: &mut Vec<u8>, rd_: DReg, rn_: Reg64) {
    emit(buf, 0x9E620000 | rn(rn_) | dd(rd_));
}

// =============================================================================
// Branch Instructions
// =============================================================================

/// B - Unconditional branch (PC-relative)
/// offset is in bytes and must be 4-byte aligned
pub fn b(buf: &mut Vec<u8>, offset: i32) {
    // B: 000101 imm26
    let imm26 = ((offset >> 2) as u32) & 0x03FFFFFF;
    emit(buf, 0x14000000 | imm26);
}

/// B.cond - Conditional branch (PC-relative)
pub fn b_cond(buf: &mut Vec<u8>, cond: Condition, offset: i32) {
    // B.cond: 01010100 imm19 0 cond
    let imm19 = ((offset >> 2) as u32) & 0x7FFFF;
    emit(buf, 0x54000000 | (imm19 << 5) | (cond as u32));
}

/// BL - Branch with link (function call)
pub fn bl(buf: &mut Vec<u8>, offset: i32) {
    // BL: 100101 imm26
    let imm26 = ((offset >> 2) as u32) & 0x03FFFFFF;
    emit(buf, 0x94000000 | imm26);
}

/// BLR - Branch with link to register (indirect call)
pub fn blr(buf: &mut Vec<u8>, rn_: Reg64) {
    // BLR: 1101011 0001 11111 000000 Rn 00000
    emit(buf, 0xD63F0000 | rn(rn_));
}

/// RET - Return from subroutine (X30)
pub fn ret(buf: &mut Vec<u8>) {
    // RET: 1101011 0010 11111 000000 Rn 00000
    emit(buf, 0xD65F0000 | rn(Reg64::X30));
}

/// CBZ - Compare and branch if zero
pub fn cbz_x(buf: &mut Vec<u8>, rt: Reg64, offset: i32) {
    // CBZ (64-bit): 1 011010 0 imm19 Rt
    let imm19 = ((offset >> 2) as u32) & 0x7FFFF;
    emit(buf, 0xB4000000 | (imm19 << 5) | rd(rt));
}

/// Immediate field layout of a PC-relative branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchForm {
    /// B, BL: 26-bit word offset (+/-128MB)
    Imm26,
    /// B.cond, CBZ, CBNZ: 19-bit word offset (+/-1MB)
    Imm19,
}

impl BranchForm {
    /// Largest reachable forward distance in bytes
    pub fn reach(self) -> i64 {
        match self {
            BranchForm::Imm26 => (1 << 27) - 4,
            BranchForm::Imm19 => (1 << 20) - 4,
        }
    }
}

/// Decode which branch form an instruction word is, if any
pub fn branch_form(insn: u32) -> Option<BranchForm> {
    if insn & 0x7C000000 == 0x14000000 {
        Some(BranchForm::Imm26)
    } else if insn & 0xFF000010 == 0x54000000 || insn & 0x7E000000 == 0x34000000 {
        Some(BranchForm::Imm19)
    } else {
        None
    }
}

/// Rewrite the displacement of a branch instruction.
///
/// Returns `None` if `insn` is not a PC-relative branch, the offset is not
/// word-aligned, or it does not fit the immediate field.
pub fn patch_branch(insn: u32, offset: i64) -> Option<u32> {
    let form = branch_form(insn)?;
    if offset % 4 != 0 || offset > form.reach() || offset < -form.reach() - 4 {
        return None;
    }
    let words = offset >> 2;
    Some(match form {
        BranchForm::Imm26 => (insn & !0x03FFFFFF) | ((words as u32) & 0x03FFFFFF),
        BranchForm::Imm19 => (insn & !(0x7FFFF << 5)) | (((words as u32) & 0x7FFFF) << 5),
    })
}

/// Rewrite the page delta of an ADRP instruction
pub fn patch_adrp(insn: u32, pages: i64) -> Option<u32> {
    if insn & 0x9F000000 != 0x90000000 || !(-(1 << 20)..(1 << 20)).contains(&pages) {
        return None;
    }
    Some(adrp_word(insn & 0x1F, pages as i32))
}

/// Rewrite the 12-bit immediate of an ADD (immediate) or an unsigned-offset
/// load/store. The caller scales the value for loads.
pub fn patch_imm12(insn: u32, imm12: u32) -> Option<u32> {
    if imm12 > 0xFFF {
        return None;
    }
    Some((insn & !(0xFFF << 10)) | (imm12 << 10))
}

// =============================================================================
// Load/Store Instructions
// =============================================================================

/// LDR (immediate, unsigned offset) - Load register
/// Encodes: LDR Xt, [Xn, #offset]
pub fn ldr_x_imm(buf: &mut Vec<u8>, rt: Reg64, rn_: Reg64, offset: u16) {
    // LDR (64-bit): 11 111 0 01 01 imm12 Rn Rt
    let imm12 = (offset / 8) as u32; // Scale by 8 for 64-bit
    emit(buf, 0xF9400000 | (imm12 << 10) | rn(rn_) | rd(rt));
}

/// STR (immediate, unsigned offset) - Store register
pub fn str_x_imm(buf: &mut Vec<u8>, rt: Reg64, rn_: Reg64, offset: u16) {
    // STR (64-bit): 11 111 0 01 00 imm12 Rn Rt
    let imm12 = (offset / 8) as u32; // Scale by 8 for 64-bit
    emit(buf, 0xF9000000 | (imm12 << 10) | rn(rn_) | rd(rt));
}

/// LDR Dt, [Xn, #offset] (unsigned, scaled)
pub fn ldr_d_imm(buf: &mut Vec<u8>, rt: DReg, rn_: Reg64, offset: u16) {
    let imm12 = (offset / 8) as u32;
    emit(buf, 0xFD400000 | (imm12 << 10) | rn(rn_) | dd(rt));
}

/// STR Dt, [Xn, #offset] (unsigned, scaled)
pub fn str_d_imm(buf: &mut Vec<u8>, rt: DReg, rn_: Reg64, offset: u16) {
    let imm12 = (offset / 8) as u32;
    emit(buf, 0xFD000000 | (imm12 << 10) | rn(rn_) | dd(rt));
}

/// LDR Xt, [Xn, Xm, LSL #3]
pub fn ldr_x_reg_lsl3(buf: &mut Vec<u8>, rt: Reg64, rn_: Reg64, rm_: Reg64) {
    emit(buf, 0xF8607800 | rm(rm_) | rn(rn_) | rd(rt));
}

/// LDR Dt, [Xn, Xm, LSL #3]
pub fn ldr_d_reg_lsl3(buf: &mut Vec<u8>, rt: DReg, rn_: Reg64, rm_: Reg64) {
    emit(buf, 0xFC607800 | rm(rm_) | rn(rn_) | dd(rt));
}

/// STR Xt, [Xn, #offset]! (pre-index, unscaled imm9)
pub fn str_x_pre(buf: &mut Vec<u8>, rt: Reg64, rn_: Reg64, offset: i16) {
    let imm9 = (offset as u32) & 0x1FF;
    emit(buf, 0xF8000C00 | (imm9 << 12) | rn(rn_) | rd(rt));
}

/// LDR Xt, [Xn], #offset (post-index, unscaled imm9)
pub fn ldr_x_post(buf: &mut Vec<u8>, rt: Reg64, rn_: Reg64, offset: i16) {
    let imm9 = (offset as u32) & 0x1FF;
    emit(buf, 0xF8400400 | (imm9 << 12) | rn(rn_) | rd(rt));
}

/// STR Dt, [Xn, #offset]! (pre-index)
pub fn str_d_pre(buf: &mut Vec<u8>, rt: DReg, rn_: Reg64, offset: i16) {
    let imm9 = (offset as u32) & 0x1FF;
    emit(buf, 0xFC000C00 | (imm9 << 12) | rn(rn_) | dd(rt));
}

/// LDR Dt, [Xn], #offset (post-index)
pub fn ldr_d_post(buf: &mut Vec<u8>, rt: DReg, rn_: Reg64, offset: i16) {
    let imm9 = (offset as u32) & 0x1FF;
    emit(buf, 0xFC400400 | (imm9 << 12) | rn(rn_) | dd(rt));
}

/// STP - Store pair of registers (pre-index)
/// Encodes: STP Xt1, Xt2, [Xn, #offset]!
pub fn stp_pre_x(buf: &mut Vec<u8>, rt1: Reg64, rt2: Reg64, rn_: Reg64, offset: i16) {
    // STP (pre-index, 64-bit): 10 101 0 011 imm7 Rt2 Rn Rt
    let imm7 = ((offset / 8) as u32) & 0x7F;
    emit(
        buf,
        0xA9800000 | (imm7 << 15) | ((rt2.encoding() as u32) << 10) | rn(rn_) | rd(rt1),
    );
}

/// LDP - Load pair of registers (post-index)
/// Encodes: LDP Xt1, Xt2, [Xn], #offset
pub fn ldp_post_x(buf: &mut Vec<u8>, rt1: Reg64, rt2: Reg64, rn_: Reg64, offset: i16) {
    // LDP (post-index, 64-bit): 10 101 0 001 imm7 Rt2 Rn Rt
    let imm7 = ((offset / 8) as u32) & 0x7F;
    emit(
        buf,
        0xA8C00000 | (imm7 << 15) | ((rt2.encoding() as u32) << 10) | rn(rn_) | rd(rt1),
    );
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Load a 64-bit immediate value into a register.
///
/// Uses MOVZ + MOVK, or MOVN + MOVK when more halfwords are all-ones than
/// all-zeros (small negative numbers become a single MOVN).
pub fn load_imm64(buf: &mut Vec<u8>, rd_: Reg64, value: u64) {
    if value == 0 {
        // MOV Xd, XZR
        emit(buf, 0xAA1F03E0 | rd(rd_));
        return;
    }

    let halves: [u16; 4] = [0, 1, 2, 3].map(|i| ((value >> (i * 16)) & 0xFFFF) as u16);
    let zeros = halves.iter().filter(|&&h| h == 0).count();
    let ones = halves.iter().filter(|&&h| h == 0xFFFF).count();

    if ones > zeros {
        let mut first = true;
        for (i, &half) in halves.iter().enumerate() {
            if half == 0xFFFF {
                continue;
            }
            let shift = (i * 16) as u8;
            if first {
                movn_x(buf, rd_, !half, shift);
                first = false;
            } else {
                movk_x(buf, rd_, half, shift);
            }
        }
        if first {
            // All ones: -1
            movn_x(buf, rd_, 0, 0);
        }
        return;
    }

    let mut first = true;
    for (i, &half) in halves.iter().enumerate() {
        if half == 0 {
            continue;
        }
        let shift = (i * 16) as u8;
        if first {
            movz_x(buf, rd_, half, shift);
            first = false;
        } else {
            movk_x(buf, rd_, half, shift);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(buf: &[u8]) -> u32 {
        read_insn(buf, 0).unwrap()
    }

    #[test]
    fn test_movz_x() {
        let mut buf = Vec::new();
        movz_x(&mut buf, Reg64::X0, 42, 0);
        assert_eq!(buf.len(), 4);
        // MOVZ X0, #42 = 0xD2800540
        assert_eq!(word(&buf), 0xD2800540);
    }

    #[test]
    fn test_add_x() {
        let mut buf = Vec::new();
        add_x(&mut buf, Reg64::X0, Reg64::X1, Reg64::X2);
        // ADD X0, X1, X2 = 0x8B020020
        assert_eq!(word(&buf), 0x8B020020);
    }

    #[test]
    fn test_mov_from_sp_uses_add() {
        let mut buf = Vec::new();
        add_imm_x(&mut buf, Reg64::X29, Reg64::SP, 0);
        // MOV X29, SP = ADD X29, SP, #0 = 0x910003FD
        assert_eq!(word(&buf), 0x910003FD);
    }

    #[test]
    fn test_ret() {
        let mut buf = Vec::new();
        ret(&mut buf);
        // RET (X30) = 0xD65F03C0
        assert_eq!(word(&buf), 0xD65F03C0);
    }

    #[test]
    fn test_prologue_pair() {
        let mut buf = Vec::new();
        stp_pre_x(&mut buf, Reg64::X29, Reg64::X30, Reg64::SP, -16);
        // STP X29, X30, [SP, #-16]! = 0xA9BF7BFD
        assert_eq!(word(&buf), 0xA9BF7BFD);

        let mut buf = Vec::new();
        ldp_post_x(&mut buf, Reg64::X29, Reg64::X30, Reg64::SP, 16);
        // LDP X29, X30, [SP], #16 = 0xA8C17BFD
        assert_eq!(word(&buf), 0xA8C17BFD);
    }

    #[test]
    fn test_push_pop() {
        let mut buf = Vec::new();
        str_x_pre(&mut buf, Reg64::X0, Reg64::SP, -16);
        // STR X0, [SP, #-16]! = 0xF81F0FE0
        assert_eq!(word(&buf), 0xF81F0FE0);

        let mut buf = Vec::new();
        ldr_x_post(&mut buf, Reg64::X0, Reg64::SP, 16);
        // LDR X0, [SP], #16 = 0xF84107E0
        assert_eq!(word(&buf), 0xF84107E0);
    }

    #[test]
    fn test_scaled_load_store() {
        let mut buf = Vec::new();
        ldr_x_imm(&mut buf, Reg64::X0, Reg64::X28, 64);
        // LDR X0, [X28, #64] = 0xF9402380
        assert_eq!(word(&buf), 0xF9402380);

        let mut buf = Vec::new();
        str_d_imm(&mut buf, DReg::D0, Reg64::SP, 8);
        // STR D0, [SP, #8] = 0xFD0007E0
        assert_eq!(word(&buf), 0xFD0007E0);
    }

    #[test]
    fn test_float_arithmetic() {
        let mut buf = Vec::new();
        fadd_d(&mut buf, DReg::D0, DReg::D0, DReg::D1);
        // FADD D0, D0, D1 = 0x1E612800
        assert_eq!(word(&buf), 0x1E612800);

        let mut buf = Vec::new();
        scvtf_d_x(&mut buf, DReg::D1, Reg64::X0);
        // SCVTF D1, X0 = 0x9E620001
        assert_eq!(word(&buf), 0x9E620001);
    }

    #[test]
    fn test_cset_and_csel() {
        let mut buf = Vec::new();
        cset_x(&mut buf, Reg64::X0, Condition::EQ);
        // CSET X0, EQ = CSINC X0, XZR, XZR, NE = 0x9A9F17E0
        assert_eq!(word(&buf), 0x9A9F17E0);

        let mut buf = Vec::new();
        csel_x(&mut buf, Reg64::X0, Reg64::X16, Reg64::X17, Condition::NE);
        // CSEL X0, X16, X17, NE = 0x9A911200
        assert_eq!(word(&buf), 0x9A911200);
    }

    #[test]
    fn test_load_imm64_small() {
        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, 42);
        assert_eq!(buf.len(), 4); // Single MOVZ instruction
    }

    #[test]
    fn test_load_imm64_large() {
        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, 0x123456789ABCDEF0);
        // Should use MOVZ + 3 MOVK = 4 instructions = 16 bytes
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn test_load_imm64_negative() {
        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, (-5i64) as u64);
        // MOVN X0, #4 = 0x92800080
        assert_eq!(buf.len(), 4);
        assert_eq!(word(&buf), 0x92800080);

        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, (-1i64) as u64);
        assert_eq!(word(&buf), 0x92800000);

        let mut buf = Vec::new();
        load_imm64(&mut buf, Reg64::X0, (-100_000i64) as u64);
        // MOVN for the low half, MOVK for the next one
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_condition_invert() {
        assert_eq!(Condition::EQ.invert(), Condition::NE);
        assert_eq!(Condition::NE.invert(), Condition::EQ);
        assert_eq!(Condition::LT.invert(), Condition::GE);
        assert_eq!(Condition::GE.invert(), Condition::LT);
        assert_eq!(Condition::MI.invert(), Condition::PL);
        assert_eq!(Condition::LS.invert(), Condition::HI);
    }

    #[test]
    fn test_patch_branch_forward_and_back() {
        let mut buf = Vec::new();
        b(&mut buf, 0);
        assert_eq!(patch_branch(word(&buf), 8), Some(0x14000002));
        assert_eq!(patch_branch(word(&buf), -4), Some(0x17FFFFFF));

        let mut buf = Vec::new();
        b_cond(&mut buf, Condition::GE, 0);
        assert_eq!(patch_branch(word(&buf), 16), Some(0x5400008A));

        let mut buf = Vec::new();
        cbz_x(&mut buf, Reg64::X0, 0);
        assert_eq!(patch_branch(word(&buf), 12), Some(0xB4000060));

        let mut buf = Vec::new();
        bl(&mut buf, 0);
        assert_eq!(branch_form(word(&buf)), Some(BranchForm::Imm26));
    }

    #[test]
    fn test_patch_branch_rejects_out_of_range() {
        let mut buf = Vec::new();
        b_cond(&mut buf, Condition::EQ, 0);
        assert_eq!(patch_branch(word(&buf), 1 << 20), None);
        assert_eq!(patch_branch(word(&buf), 6), None);
        // Not a branch
        assert_eq!(patch_branch(0xD65F03C0, 4), None);
    }

    #[test]
    fn test_patch_adrp_and_imm12() {
        let mut buf = Vec::new();
        adrp(&mut buf, Reg64::X16, 0);
        assert_eq!(word(&buf), 0x90000010);
        // ADRP X16, +5 pages: immlo = 1, immhi = 1
        assert_eq!(patch_adrp(word(&buf), 5), Some(0xB0000030));

        let mut buf = Vec::new();
        add_imm_x(&mut buf, Reg64::X0, Reg64::X0, 0);
        assert_eq!(patch_imm12(word(&buf), 0x10), Some(0x91004000));
        assert_eq!(patch_imm12(word(&buf), 0x1000), None);
    }
}
