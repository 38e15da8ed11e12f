#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wire encodings wrap by design")]

mod asm;
mod error;
pub mod exec;
mod funcdef;
mod limits;
mod marshal;
pub mod peg;
mod value;

pub use crate::{
    asm::{
        AssembleError, BREAKPOINT_BIT, OPCODE_MASK, Opcode, OperandKind, OperandShape,
        VerifyError, assemble, disassemble, verify,
    },
    error::Error,
    funcdef::{FuncDef, FuncFlags, SYMBOLSLOT_UPVALUE, SourceMapping, SymbolSlot},
    limits::{DEFAULT_MAX_RECURSION_DEPTH, MAX_PROTO_DEPTH, MAX_REFERENCE_DEPTH},
    marshal::{MarshalError, UnmarshalError, marshal, marshal_into, unmarshal},
    value::{
        AbstractValue, Closure, Fiber, FiberFrame, FiberStatus, FuncEnv, NativeFunction, Struct,
        TY_ABSTRACT, TY_ARRAY, TY_BOOLEAN, TY_BUFFER, TY_CALLABLE, TY_CFUNCTION, TY_DICTIONARY,
        TY_FIBER, TY_FUNCTION, TY_INDEXED, TY_KEYWORD, TY_NIL, TY_NUMBER, TY_POINTER, TY_STRING,
        TY_STRUCT, TY_SYMBOL, TY_TABLE, TY_TUPLE, Table, Tuple, Value, type_mask_from_name,
    },
};
