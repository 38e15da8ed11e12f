//! Function definition record: the unit the assembler produces and the
//! reference executor runs.
//!
//! A `FuncDef` is immutable once built. Nested defs are exclusively owned
//! by their parent and the def graph is acyclic; environments referenced
//! through the `environments` map may be shared between closures at
//! runtime.

use std::{cell::RefCell, rc::Rc};

use crate::value::{Closure, Value};

/// Bitset describing a funcdef's calling convention and which optional
/// arrays are present. Flag bits and array presence must agree; the
/// verifier enforces this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuncFlags(u32);

impl FuncFlags {
    pub const VARARG: Self = Self(1 << 0);
    pub const STRUCTARG: Self = Self(1 << 1);
    pub const HASNAME: Self = Self(1 << 2);
    pub const HASSOURCE: Self = Self(1 << 3);
    pub const HASDEFS: Self = Self(1 << 4);
    pub const HASENVS: Self = Self(1 << 5);
    pub const HASSOURCEMAP: Self = Self(1 << 6);
    pub const HASSYMBOLMAP: Self = Self(1 << 7);

    /// All bits a well-formed def may carry.
    pub const ALL: Self = Self(0xFF);

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !Self::ALL.0 == 0).then_some(Self(bits))
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

/// One sourcemap entry: the source span an instruction was compiled from,
/// as `(start, end)` byte offsets into the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub start: i32,
    pub end: i32,
}

/// Marks a pc as "upvalue scope" in a symbolmap entry.
pub const SYMBOLSLOT_UPVALUE: u32 = u32::MAX;

/// One symbolmap entry: the symbol bound to `slot` from `birth_pc` to
/// `death_pc`. A `birth_pc` of [`SYMBOLSLOT_UPVALUE`] denotes upvalue
/// scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSlot {
    pub birth_pc: u32,
    pub death_pc: u32,
    pub slot: u32,
    pub symbol: Rc<[u8]>,
}

/// Immutable compiled form of one function.
#[derive(Debug, Default)]
pub struct FuncDef {
    pub flags: FuncFlags,
    /// Declared arity; `min_arity <= arity <= max_arity`.
    pub arity: u32,
    pub min_arity: u32,
    pub max_arity: u32,
    /// Number of virtual registers the body uses.
    pub slotcount: u32,
    pub constants: Vec<Value>,
    /// 32-bit instruction words.
    pub bytecode: Vec<u32>,
    /// Nested defs for inner closures.
    pub defs: Vec<Rc<FuncDef>>,
    /// Entry `i` is the enclosing environment index to use when this def
    /// references upvalue-environment `i`; `-1` denotes the immediate
    /// parent's own environment.
    pub environments: Vec<i32>,
    /// Empty, or the same length as `bytecode`.
    pub sourcemap: Vec<SourceMapping>,
    pub symbolmap: Vec<SymbolSlot>,
    pub name: Option<Rc<[u8]>>,
    pub source: Option<Rc<[u8]>>,
}

impl FuncDef {
    /// Wraps this def in a closure with no captured environments.
    ///
    /// Only meaningful for defs that do not reference upvalues; the
    /// executor reports missing environments if one does.
    #[must_use]
    pub fn to_function(self: &Rc<Self>) -> Value {
        Value::Function(Rc::new(Closure {
            def: self.clone(),
            envs: RefCell::new(Vec::new()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        let mut flags = FuncFlags::default();
        flags.insert(FuncFlags::VARARG);
        flags.insert(FuncFlags::HASDEFS);
        assert!(flags.contains(FuncFlags::VARARG));
        assert!(!flags.contains(FuncFlags::HASNAME));
        assert_eq!(FuncFlags::from_bits(flags.bits()), Some(flags));
        assert_eq!(FuncFlags::from_bits(1 << 20), None);
    }

    #[test]
    fn test_flag_set_clears() {
        let mut flags = FuncFlags::VARARG;
        flags.set(FuncFlags::VARARG, false);
        assert!(!flags.contains(FuncFlags::VARARG));
    }
}
