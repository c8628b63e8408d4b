//! ARM64 (AArch64) Register Definitions
//!
//! Defines the 64-bit general-purpose and double-precision registers used by
//! the backend, plus the AAPCS64 conventions generated code follows.

/// ARM64 General-Purpose Registers (64-bit X registers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X8 = 8,
    X9 = 9,
    X10 = 10,
    X11 = 11,
    X12 = 12,
    X13 = 13,
    X14 = 14,
    X15 = 15,
    X16 = 16,
    X17 = 17,
    X18 = 18,
    X19 = 19,
    X20 = 20,
    X21 = 21,
    X22 = 22,
    X23 = 23,
    X24 = 24,
    X25 = 25,
    X26 = 26,
    X27 = 27,
    X28 = 28,
    X29 = 29, // Frame Pointer (FP)
    X30 = 30, // Link Register (LR)
    /// Encoding 31 as the stack pointer. Only valid as a load/store base or as
    /// an operand of ADD/SUB (immediate); elsewhere 31 means XZR.
    SP = 31,
}

/// Double-precision floating-point registers (low 64 bits of V registers)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DReg {
    D0 = 0,
    D1 = 1,
    D2 = 2,
    D3 = 3,
    D4 = 4,
    D5 = 5,
    D6 = 6,
    D7 = 7,
}

impl Reg64 {
    const ALL: [Reg64; 32] = [
        Reg64::X0,
        Reg64::X1,
        Reg64::X2,
        Reg64::X3,
        Reg64::X4,
        Reg64::X5,
        Reg64::X6,
        Reg64::X7,
        Reg64::X8,
        Reg64::X9,
        Reg64::X10,
        Reg64::X11,
        Reg64::X12,
        Reg64::X13,
        Reg64::X14,
        Reg64::X15,
        Reg64::X16,
        Reg64::X17,
        Reg64::X18,
        Reg64::X19,
        Reg64::X20,
        Reg64::X21,
        Reg64::X22,
        Reg64::X23,
        Reg64::X24,
        Reg64::X25,
        Reg64::X26,
        Reg64::X27,
        Reg64::X28,
        Reg64::X29,
        Reg64::X30,
        Reg64::SP,
    ];

    /// Get the register encoding (0-31)
    pub fn encoding(self) -> u8 {
        self as u8
    }

    /// Register with the given encoding, if any
    #[cfg(test)]
    pub fn from_encoding(n: u8) -> Option<Reg64> {
        Self::ALL.get(n as usize).copied()
    }

    /// Check if this is a callee-saved register
    #[cfg(test)]
    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg64::X19
                | Reg64::X20
                | Reg64::X21
                | Reg64::X22
                | Reg64::X23
                | Reg64::X24
                | Reg64::X25
                | Reg64::X26
                | Reg64::X27
                | Reg64::X28
                | Reg64::X29
                | Reg64::X30
        )
    }

    /// Check if this is an argument register
    pub fn is_argument(self) -> bool {
        calling_convention::ARGUMENT_REGS.contains(&self)
    }
}

impl DReg {
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// ARM64 AAPCS64 calling convention, as used by generated code
pub mod calling_convention {
    use super::Reg64;

    /// Argument registers (X0-X7)
    pub const ARGUMENT_REGS: [Reg64; 8] = [
        Reg64::X0,
        Reg64::X1,
        Reg64::X2,
        Reg64::X3,
        Reg64::X4,
        Reg64::X5,
        Reg64::X6,
        Reg64::X7,
    ];

    /// Return value register
    pub const RETURN_REG: Reg64 = Reg64::X0;

    /// Callee-saved pairs pushed by every prologue, in push order
    pub const SAVED_PAIRS: [(Reg64, Reg64); 5] = [
        (Reg64::X19, Reg64::X20),
        (Reg64::X21, Reg64::X22),
        (Reg64::X23, Reg64::X24),
        (Reg64::X25, Reg64::X26),
        (Reg64::X27, Reg64::X28),
    ];

    /// Call arguments are staged here while later arguments are evaluated.
    /// Callee-saved, so a nested call cannot clobber them.
    pub const STAGING_REGS: [Reg64; 9] = [
        Reg64::X19,
        Reg64::X20,
        Reg64::X21,
        Reg64::X22,
        Reg64::X23,
        Reg64::X24,
        Reg64::X25,
        Reg64::X26,
        Reg64::X27,
    ];

    /// Base of the current frame's local slot region
    pub const FRAME_BASE: Reg64 = Reg64::X28;

    /// Intra-procedure-call scratch registers (X16-X17)
    pub const IP0: Reg64 = Reg64::X16;
    pub const IP1: Reg64 = Reg64::X17;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encoding() {
        assert_eq!(Reg64::X0.encoding(), 0);
        assert_eq!(Reg64::X15.encoding(), 15);
        assert_eq!(Reg64::X30.encoding(), 30);
        assert_eq!(Reg64::SP.encoding(), 31);
        assert_eq!(DReg::D2.encoding(), 2);
    }

    #[test]
    fn test_from_encoding() {
        assert_eq!(Reg64::from_encoding(19), Some(Reg64::X19));
        assert_eq!(Reg64::from_encoding(31), Some(Reg64::SP));
        assert_eq!(Reg64::from_encoding(32), None);
    }

    #[test]
    fn test_callee_saved() {
        assert!(Reg64::X19.is_callee_saved());
        assert!(Reg64::X29.is_callee_saved());
        assert!(Reg64::X30.is_callee_saved());
        assert!(!Reg64::X0.is_callee_saved());
        assert!(!Reg64::X16.is_callee_saved());
    }

    #[test]
    fn test_staging_registers_survive_calls() {
        for reg in calling_convention::STAGING_REGS {
            assert!(reg.is_callee_saved());
            assert!(!reg.is_argument());
        }
        assert!(!calling_convention::STAGING_REGS.contains(&calling_convention::FRAME_BASE));
    }

    #[test]
    fn test_argument_registers() {
        assert!(Reg64::X0.is_argument());
        assert!(Reg64::X7.is_argument());
        assert!(!Reg64::X8.is_argument());
        assert!(!Reg64::X19.is_argument());
    }
}
