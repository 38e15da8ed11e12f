//! PEG engine: grammar compiler and backtracking matcher.
//!
//! `compile` lowers a data-structured grammar expression into a
//! [`PegProgram`]; `PegProgram::matches` (or the [`run`] convenience,
//! which accepts either a program or a raw grammar) executes it against
//! input bytes. Compiled programs are immutable, and marshallable as
//! abstracts; reloaded programs pass [`PegProgram::validate`] before use.

use std::any::Any;

use crate::{
    error::Error,
    value::{AbstractValue, Value},
};

pub use compile::{PegCompileError, compile};
pub use vm::PegMatchError;

use op::RuleOp;

mod compile;
mod op;
mod vm;

/// A compiled grammar: a contiguous rule program plus its constants.
/// Execution always starts at word 0, which the compiler reserves for a
/// one-element sequence dispatching to the main rule.
#[derive(Debug)]
pub struct PegProgram {
    pub(crate) bytecode: Vec<u32>,
    pub(crate) constants: Vec<Value>,
}

impl AbstractValue for PegProgram {
    fn type_name(&self) -> &'static str {
        "core/peg"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl PegProgram {
    /// Runs the program against `text` starting at byte `start`.
    ///
    /// Returns the captures pushed by the match, or `None` when the
    /// grammar does not match.
    pub fn matches(
        &self,
        text: &[u8],
        start: usize,
        extras: &[Value],
    ) -> Result<Option<Vec<Value>>, PegMatchError> {
        vm::interpret(self, text, start, extras)
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u32] {
        &self.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    /// Wraps the program as an abstract value.
    #[must_use]
    pub fn into_value(self: std::rc::Rc<Self>) -> Value {
        Value::Abstract(self)
    }

    /// Structural validation for programs that did not come out of this
    /// process's compiler (the unmarshaller calls this). Walks the rule
    /// words, checking opcodes, lengths, constant indices, tag bytes, and
    /// that every sub-rule reference lands on a rule-start position.
    pub fn validate(&self) -> Result<(), &'static str> {
        let code = &self.bytecode;
        let len = code.len();
        let mut starts = vec![false; len];
        let mut pos = 0usize;
        while pos < len {
            starts[pos] = true;
            pos += self.rule_len(pos)?;
        }
        if !starts.first().copied().unwrap_or(false) {
            return Err("invalid bytecode");
        }

        let check_rule = |index: u32| -> Result<(), &'static str> {
            if starts.get(index as usize).copied().unwrap_or(false) {
                Ok(())
            } else {
                Err("invalid rule reference")
            }
        };
        let check_tag = |tag: u32| -> Result<(), &'static str> {
            if tag <= 255 { Ok(()) } else { Err("invalid tag") }
        };
        let check_constant = |index: u32| -> Result<(), &'static str> {
            if (index as usize) < self.constants.len() {
                Ok(())
            } else {
                Err("invalid constant reference")
            }
        };

        let mut pos = 0usize;
        while pos < len {
            let rule_len = self.rule_len(pos)?;
            let words = &code[pos..pos + rule_len];
            match RuleOp::from_word(words[0]).expect("rule_len checked the opcode") {
                RuleOp::Literal
                | RuleOp::NChar
                | RuleOp::NotNChar
                | RuleOp::Range
                | RuleOp::Set => {}
                RuleOp::Look => check_rule(words[2])?,
                RuleOp::Choice | RuleOp::Sequence => {
                    for &rule in &words[2..] {
                        check_rule(rule)?;
                    }
                }
                RuleOp::If | RuleOp::IfNot => {
                    check_rule(words[1])?;
                    check_rule(words[2])?;
                }
                RuleOp::Not | RuleOp::Drop | RuleOp::Error => check_rule(words[1])?,
                RuleOp::Between => check_rule(words[3])?,
                RuleOp::GetTag => {
                    check_tag(words[1])?;
                    check_tag(words[2])?;
                }
                RuleOp::Capture | RuleOp::Accumulate | RuleOp::Group => {
                    check_rule(words[1])?;
                    check_tag(words[2])?;
                }
                RuleOp::Position => check_tag(words[1])?,
                RuleOp::Argument => check_tag(words[2])?,
                RuleOp::Constant => {
                    check_constant(words[1])?;
                    check_tag(words[2])?;
                }
                RuleOp::Replace | RuleOp::MatchTime => {
                    check_rule(words[1])?;
                    check_constant(words[2])?;
                    check_tag(words[3])?;
                }
                RuleOp::BackMatch => check_tag(words[1])?,
            }
            pos += rule_len;
        }
        Ok(())
    }

    /// Length in words of the rule starting at `pos`, bounds-checked.
    fn rule_len(&self, pos: usize) -> Result<usize, &'static str> {
        let code = &self.bytecode;
        let word = *code.get(pos).ok_or("unexpected end of bytecode")?;
        let op = RuleOp::from_word(word).ok_or("unknown rule opcode")?;
        let fixed = match op {
            RuleOp::NChar
            | RuleOp::NotNChar
            | RuleOp::Range
            | RuleOp::Not
            | RuleOp::Drop
            | RuleOp::Error
            | RuleOp::Position
            | RuleOp::BackMatch => 2,
            RuleOp::Look
            | RuleOp::If
            | RuleOp::IfNot
            | RuleOp::GetTag
            | RuleOp::Capture
            | RuleOp::Accumulate
            | RuleOp::Group
            | RuleOp::Argument
            | RuleOp::Constant => 3,
            RuleOp::Between | RuleOp::Replace | RuleOp::MatchTime => 4,
            RuleOp::Set => 9,
            RuleOp::Literal => {
                let len = *code.get(pos + 1).ok_or("unexpected end of bytecode")? as usize;
                2 + len.div_ceil(4)
            }
            RuleOp::Choice | RuleOp::Sequence => {
                let n = *code.get(pos + 1).ok_or("unexpected end of bytecode")? as usize;
                2 + n
            }
        };
        if pos + fixed > code.len() {
            return Err("unexpected end of bytecode");
        }
        Ok(fixed)
    }
}

/// Matches `pattern` (a compiled program abstract, or any grammar
/// expression, which is compiled on the fly) against `text`.
pub fn run(
    pattern: &Value,
    text: &[u8],
    start: usize,
    extras: &[Value],
) -> Result<Option<Vec<Value>>, Error> {
    if let Value::Abstract(a) = pattern
        && let Some(program) = a.as_any().downcast_ref::<PegProgram>()
    {
        return program.matches(text, start, extras).map_err(Error::from);
    }
    let program = compile(pattern)?;
    program.matches(text, start, extras).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_compiled_program() {
        let program = compile(&Value::string("abc")).unwrap();
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_truncated_program() {
        let program = PegProgram { bytecode: vec![RuleOp::Literal as u32, 8], constants: vec![] };
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mid_rule_reference() {
        // A Not rule pointing into the middle of a literal.
        let program = PegProgram {
            bytecode: vec![
                RuleOp::Not as u32,
                3, // middle of the literal below
                RuleOp::Literal as u32,
                1,
                u32::from(b'a'),
            ],
            constants: vec![],
        };
        assert!(program.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_constant() {
        let program = PegProgram {
            bytecode: vec![RuleOp::Constant as u32, 4, 0],
            constants: vec![],
        };
        assert!(program.validate().is_err());
    }
}
