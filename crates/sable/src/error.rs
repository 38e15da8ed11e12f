//! Top-level error type, separating failures by subsystem and stage.
//!
//! Keeping assemble/verify/compile/match/marshal failures distinct lets
//! callers route user feedback and recovery without string matching.

use std::fmt;

use crate::{
    asm::{AssembleError, VerifyError},
    exec::ExecError,
    marshal::{MarshalError, UnmarshalError},
    peg::{PegCompileError, PegMatchError},
};

/// Any failure one of the subsystems can surface.
#[derive(Debug, Clone)]
pub enum Error {
    /// Assembly of a function description failed.
    Assemble(AssembleError),
    /// A funcdef failed bytecode verification.
    Verify(VerifyError),
    /// A grammar failed to compile.
    PegCompile(PegCompileError),
    /// A match raised a fatal condition.
    PegMatch(PegMatchError),
    /// A value graph could not be serialized.
    Marshal(MarshalError),
    /// A byte stream could not be reconstructed.
    Unmarshal(UnmarshalError),
    /// The reference executor failed while running a function.
    Exec(ExecError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assemble(error) => write!(f, "assemble error: {error}"),
            Self::Verify(error) => write!(f, "verify error: {error}"),
            Self::PegCompile(error) => write!(f, "peg compile error: {error}"),
            Self::PegMatch(error) => write!(f, "peg match error: {error}"),
            Self::Marshal(error) => write!(f, "marshal error: {error}"),
            Self::Unmarshal(error) => write!(f, "unmarshal error: {error}"),
            Self::Exec(error) => write!(f, "exec error: {error}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<AssembleError> for Error {
    fn from(error: AssembleError) -> Self {
        Self::Assemble(error)
    }
}

impl From<VerifyError> for Error {
    fn from(error: VerifyError) -> Self {
        Self::Verify(error)
    }
}

impl From<PegCompileError> for Error {
    fn from(error: PegCompileError) -> Self {
        Self::PegCompile(error)
    }
}

impl From<PegMatchError> for Error {
    fn from(error: PegMatchError) -> Self {
        Self::PegMatch(error)
    }
}

impl From<MarshalError> for Error {
    fn from(error: MarshalError) -> Self {
        Self::Marshal(error)
    }
}

impl From<UnmarshalError> for Error {
    fn from(error: UnmarshalError) -> Self {
        Self::Unmarshal(error)
    }
}

impl From<ExecError> for Error {
    fn from(error: ExecError) -> Self {
        Self::Exec(error)
    }
}
