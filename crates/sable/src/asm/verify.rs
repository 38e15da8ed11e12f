//! Bytecode verifier.
//!
//! Runs after assembly and after unmarshalling a funcdef: walks the
//! bytecode linearly with the opcode shape table and checks every operand
//! against the def's header. Each failure is a single code; callers render
//! the message.

use std::fmt;

use super::op::{Opcode, OperandKind, decode_operands};
use crate::funcdef::{FuncDef, FuncFlags};

/// One code per invariant class the verifier enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    /// `min_arity <= arity <= max_arity` violated.
    BadArityRange,
    /// Fewer registers than the calling convention needs.
    BadSlotCount,
    /// Sourcemap present but not the same length as the bytecode.
    BadSourcemapLength,
    /// Flag bits disagree with the presence of an optional array.
    FlagMismatch,
    /// Instruction word with an unassigned opcode.
    UnknownOpcode { pc: usize },
    /// Slot operand outside `[0, slotcount)`.
    BadSlot { pc: usize },
    /// Constant operand outside the constants array.
    BadConstant { pc: usize },
    /// Funcdef operand outside the nested defs array.
    BadFuncDef { pc: usize },
    /// Environment operand outside the environments array.
    BadEnvironment { pc: usize },
    /// Jump whose resolved target is outside the bytecode.
    BadJump { pc: usize },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArityRange => f.write_str("arity out of range"),
            Self::BadSlotCount => f.write_str("not enough slots for arguments"),
            Self::BadSourcemapLength => f.write_str("sourcemap length does not match bytecode"),
            Self::FlagMismatch => f.write_str("flags do not match optional fields"),
            Self::UnknownOpcode { pc } => write!(f, "unknown opcode at pc {pc}"),
            Self::BadSlot { pc } => write!(f, "slot operand out of range at pc {pc}"),
            Self::BadConstant { pc } => write!(f, "constant operand out of range at pc {pc}"),
            Self::BadFuncDef { pc } => write!(f, "funcdef operand out of range at pc {pc}"),
            Self::BadEnvironment { pc } => {
                write!(f, "environment operand out of range at pc {pc}")
            }
            Self::BadJump { pc } => write!(f, "jump target out of range at pc {pc}"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Validates a funcdef's header and every instruction word.
pub fn verify(def: &FuncDef) -> Result<(), VerifyError> {
    if def.min_arity > def.arity || def.arity > def.max_arity {
        return Err(VerifyError::BadArityRange);
    }
    let vararg = def.flags.contains(FuncFlags::VARARG);
    if def.slotcount < def.arity.saturating_add(u32::from(vararg)) {
        return Err(VerifyError::BadSlotCount);
    }
    if !def.sourcemap.is_empty() && def.sourcemap.len() != def.bytecode.len() {
        return Err(VerifyError::BadSourcemapLength);
    }
    let flag_checks = [
        (FuncFlags::HASNAME, def.name.is_some()),
        (FuncFlags::HASSOURCE, def.source.is_some()),
        (FuncFlags::HASDEFS, !def.defs.is_empty()),
        (FuncFlags::HASENVS, !def.environments.is_empty()),
        (FuncFlags::HASSOURCEMAP, !def.sourcemap.is_empty()),
        (FuncFlags::HASSYMBOLMAP, !def.symbolmap.is_empty()),
    ];
    for (flag, present) in flag_checks {
        if def.flags.contains(flag) != present {
            return Err(VerifyError::FlagMismatch);
        }
    }

    let len = def.bytecode.len() as i64;
    for (pc, &word) in def.bytecode.iter().enumerate() {
        let Some(op) = Opcode::from_word(word) else {
            return Err(VerifyError::UnknownOpcode { pc });
        };
        let shape = op.shape();
        for (spec, raw) in shape.operands().iter().zip(decode_operands(word, shape)) {
            match spec.kind {
                OperandKind::Slot => {
                    if raw >= i64::from(def.slotcount) {
                        return Err(VerifyError::BadSlot { pc });
                    }
                }
                OperandKind::Constant => {
                    if raw >= def.constants.len() as i64 {
                        return Err(VerifyError::BadConstant { pc });
                    }
                }
                OperandKind::FuncDef => {
                    if raw >= def.defs.len() as i64 {
                        return Err(VerifyError::BadFuncDef { pc });
                    }
                }
                OperandKind::Environment => {
                    if raw >= def.environments.len() as i64 {
                        return Err(VerifyError::BadEnvironment { pc });
                    }
                }
                OperandKind::Label => {
                    let target = pc as i64 + raw;
                    if target < 0 || target >= len {
                        return Err(VerifyError::BadJump { pc });
                    }
                }
                OperandKind::Type | OperandKind::Integer | OperandKind::Unsigned => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::op::BREAKPOINT_BIT;

    fn base_def(bytecode: Vec<u32>) -> FuncDef {
        FuncDef { slotcount: 4, bytecode, ..FuncDef::default() }
    }

    #[test]
    fn test_accepts_simple_body() {
        let def = base_def(vec![Opcode::LoadNil as u32 | (1 << 8), Opcode::ReturnNil as u32]);
        assert_eq!(verify(&def), Ok(()));
    }

    #[test]
    fn test_rejects_unknown_opcode() {
        let def = base_def(vec![0x7F]);
        assert_eq!(verify(&def), Err(VerifyError::UnknownOpcode { pc: 0 }));
    }

    #[test]
    fn test_rejects_slot_out_of_range() {
        let def = base_def(vec![Opcode::Return as u32 | (9 << 8)]);
        assert_eq!(verify(&def), Err(VerifyError::BadSlot { pc: 0 }));
    }

    #[test]
    fn test_rejects_jump_past_end() {
        let def = base_def(vec![Opcode::Jump as u32 | (7 << 8)]);
        assert_eq!(verify(&def), Err(VerifyError::BadJump { pc: 0 }));
    }

    #[test]
    fn test_rejects_backward_jump_before_start() {
        let word = Opcode::Jump as u32 | ((-2i32 as u32 & 0xFF_FFFF) << 8);
        let def = base_def(vec![word]);
        assert_eq!(verify(&def), Err(VerifyError::BadJump { pc: 0 }));
    }

    #[test]
    fn test_rejects_constant_out_of_range() {
        let def = base_def(vec![Opcode::LoadConstant as u32 | (2 << 16)]);
        assert_eq!(verify(&def), Err(VerifyError::BadConstant { pc: 0 }));
    }

    #[test]
    fn test_rejects_flag_mismatch() {
        let mut def = base_def(vec![Opcode::ReturnNil as u32]);
        def.flags.insert(FuncFlags::HASNAME);
        assert_eq!(verify(&def), Err(VerifyError::FlagMismatch));
    }

    #[test]
    fn test_breakpoint_bit_is_ignored() {
        let def = base_def(vec![Opcode::ReturnNil as u32 | BREAKPOINT_BIT]);
        assert_eq!(verify(&def), Ok(()));
    }

    #[test]
    fn test_rejects_arity_disorder() {
        let def = FuncDef { arity: 2, min_arity: 3, max_arity: 2, ..FuncDef::default() };
        assert_eq!(verify(&def), Err(VerifyError::BadArityRange));
    }
}
