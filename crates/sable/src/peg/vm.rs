//! PEG matcher: executes a compiled rule program against input bytes.
//!
//! Rule evaluation returns `Ok(Some(next_pos))` on a match,
//! `Ok(None)` on a clean failure (the caller backtracks), and `Err` for
//! fatal conditions (recursion budget, user-raised errors). Backtracking
//! points snapshot `(captures, capture_tags, scratch)` and restore them
//! bit-for-bit on failure. `sequence` and `choice` run their final child
//! in tail position so deep chains do not consume the recursion budget.

use std::fmt;

use crate::{
    exec::{self, ExecError},
    limits::DEFAULT_MAX_RECURSION_DEPTH,
    value::Value,
};

use super::{PegProgram, op::RuleOp};

/// Fatal failure while matching.
#[derive(Debug, Clone)]
pub enum PegMatchError {
    /// The recursion budget ran out.
    RecursedTooDeeply,
    /// A rule word carried an unassigned opcode.
    UnexpectedOpcode(u32),
    /// `(argument i)` indexed past the extra arguments.
    InvalidCaptureIndex(usize),
    /// A value raised by the `error` form, or by a failing callback.
    UserError(Value),
}

impl fmt::Display for PegMatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RecursedTooDeeply => f.write_str("recursed too deeply"),
            Self::UnexpectedOpcode(word) => write!(f, "unexpected opcode in word {word:#x}"),
            Self::InvalidCaptureIndex(index) => write!(f, "invalid capture index {index}"),
            Self::UserError(value) => write!(f, "{value}"),
        }
    }
}

impl std::error::Error for PegMatchError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Accumulate,
}

/// Snapshot of the capture state at a backtracking point. Capture tags
/// always travel with captures, so one length covers both.
#[derive(Clone, Copy)]
struct CapSave {
    caps: usize,
    scratch: usize,
}

struct MatchState<'a> {
    text: &'a [u8],
    code: &'a [u32],
    constants: &'a [Value],
    extras: &'a [Value],
    captures: Vec<Value>,
    tags: Vec<u8>,
    scratch: Vec<u8>,
    mode: Mode,
    depth: usize,
}

/// Runs `program` against `text` from `start`; returns the captures on a
/// match.
pub(super) fn interpret(
    program: &PegProgram,
    text: &[u8],
    start: usize,
    extras: &[Value],
) -> Result<Option<Vec<Value>>, PegMatchError> {
    if start > text.len() {
        return Ok(None);
    }
    let mut state = MatchState {
        text,
        code: &program.bytecode,
        constants: &program.constants,
        extras,
        captures: Vec::new(),
        tags: Vec::new(),
        scratch: Vec::new(),
        mode: Mode::Normal,
        depth: DEFAULT_MAX_RECURSION_DEPTH,
    };
    match state.exec(0, start)? {
        Some(_) => Ok(Some(state.captures)),
        None => Ok(None),
    }
}

impl MatchState<'_> {
    fn save(&self) -> CapSave {
        CapSave { caps: self.captures.len(), scratch: self.scratch.len() }
    }

    fn restore(&mut self, save: CapSave) {
        self.captures.truncate(save.caps);
        self.tags.truncate(save.caps);
        self.scratch.truncate(save.scratch);
    }

    /// Pushes one capture. In accumulate mode the byte rendering goes to
    /// scratch and the value itself is kept only when tagged.
    fn push_capture(&mut self, value: Value, tag: u32) {
        match self.mode {
            Mode::Normal => {
                self.captures.push(value);
                self.tags.push(tag as u8);
            }
            Mode::Accumulate => {
                value.render_bytes(&mut self.scratch);
                if tag != 0 {
                    self.captures.push(value);
                    self.tags.push(tag as u8);
                }
            }
        }
    }

    fn exec(&mut self, ip: usize, pos: usize) -> Result<Option<usize>, PegMatchError> {
        if self.depth == 0 {
            return Err(PegMatchError::RecursedTooDeeply);
        }
        self.depth -= 1;
        let result = self.exec_inner(ip, pos);
        self.depth += 1;
        result
    }

    fn exec_inner(&mut self, ip: usize, pos: usize) -> Result<Option<usize>, PegMatchError> {
        let mut ip = ip;
        let mut pos = pos;
        // Tail continuations visit a rule at most once in any terminating
        // chain, so a step count past the program length means a cycle in
        // foreign bytecode.
        let mut steps = 0usize;
        loop {
            steps += 1;
            if steps > self.code.len() {
                return Err(PegMatchError::RecursedTooDeeply);
            }
            let word = self.code[ip];
            let Some(op) = RuleOp::from_word(word) else {
                return Err(PegMatchError::UnexpectedOpcode(word));
            };
            match op {
                RuleOp::Literal => {
                    let len = self.code[ip + 1] as usize;
                    if pos + len > self.text.len() {
                        return Ok(None);
                    }
                    for i in 0..len {
                        let packed = self.code[ip + 2 + i / 4];
                        let byte = ((packed >> (8 * (i % 4))) & 0xFF) as u8;
                        if self.text[pos + i] != byte {
                            return Ok(None);
                        }
                    }
                    return Ok(Some(pos + len));
                }
                RuleOp::NChar => {
                    let n = self.code[ip + 1] as usize;
                    return Ok((pos + n <= self.text.len()).then_some(pos + n));
                }
                RuleOp::NotNChar => {
                    let n = self.code[ip + 1] as usize;
                    return Ok((self.text.len() - pos < n).then_some(pos));
                }
                RuleOp::Range => {
                    let spec = self.code[ip + 1];
                    let (lo, hi) = ((spec & 0xFF) as u8, ((spec >> 16) & 0xFF) as u8);
                    let hit = self.text.get(pos).is_some_and(|&b| lo <= b && b <= hi);
                    return Ok(hit.then_some(pos + 1));
                }
                RuleOp::Set => {
                    let hit = self.text.get(pos).is_some_and(|&b| {
                        self.code[ip + 1 + (b >> 5) as usize] & (1 << (b & 31)) != 0
                    });
                    return Ok(hit.then_some(pos + 1));
                }
                RuleOp::Look => {
                    let offset = i64::from(self.code[ip + 1] as i32);
                    let target = pos as i64 + offset;
                    if target < 0 || target > self.text.len() as i64 {
                        return Ok(None);
                    }
                    let save = self.save();
                    let result = self.exec(self.code[ip + 2] as usize, target as usize)?;
                    self.restore(save);
                    return Ok(result.map(|_| pos));
                }
                RuleOp::Choice => {
                    let n = self.code[ip + 1] as usize;
                    if n == 0 {
                        return Ok(None);
                    }
                    for i in 0..n - 1 {
                        let save = self.save();
                        match self.exec(self.code[ip + 2 + i] as usize, pos)? {
                            Some(next) => return Ok(Some(next)),
                            None => self.restore(save),
                        }
                    }
                    ip = self.code[ip + 1 + n] as usize;
                    continue;
                }
                RuleOp::Sequence => {
                    let n = self.code[ip + 1] as usize;
                    if n == 0 {
                        return Ok(Some(pos));
                    }
                    for i in 0..n - 1 {
                        match self.exec(self.code[ip + 2 + i] as usize, pos)? {
                            Some(next) => pos = next,
                            None => return Ok(None),
                        }
                    }
                    ip = self.code[ip + 1 + n] as usize;
                    continue;
                }
                RuleOp::If => {
                    let save = self.save();
                    let cond = self.exec(self.code[ip + 1] as usize, pos)?;
                    self.restore(save);
                    if cond.is_none() {
                        return Ok(None);
                    }
                    ip = self.code[ip + 2] as usize;
                    continue;
                }
                RuleOp::IfNot => {
                    let save = self.save();
                    let cond = self.exec(self.code[ip + 1] as usize, pos)?;
                    self.restore(save);
                    if cond.is_some() {
                        return Ok(None);
                    }
                    ip = self.code[ip + 2] as usize;
                    continue;
                }
                RuleOp::Not => {
                    let save = self.save();
                    let result = self.exec(self.code[ip + 1] as usize, pos)?;
                    self.restore(save);
                    return Ok(result.is_none().then_some(pos));
                }
                RuleOp::Between => {
                    let lo = self.code[ip + 1];
                    let hi = self.code[ip + 2];
                    let rule = self.code[ip + 3] as usize;
                    let entry = self.save();
                    let mut count: u32 = 0;
                    let mut cur = pos;
                    while count < hi {
                        let save = self.save();
                        match self.exec(rule, cur)? {
                            None => {
                                self.restore(save);
                                break;
                            }
                            // A zero-width iteration would repeat forever;
                            // stop the loop.
                            Some(next) if next == cur => {
                                count += 1;
                                break;
                            }
                            Some(next) => {
                                cur = next;
                                count += 1;
                            }
                        }
                    }
                    if count < lo {
                        self.restore(entry);
                        return Ok(None);
                    }
                    return Ok(Some(cur));
                }
                RuleOp::GetTag => {
                    let search = self.code[ip + 1] as u8;
                    let tag = self.code[ip + 2];
                    let Some(found) = self.find_tagged(search) else {
                        return Ok(None);
                    };
                    self.push_capture(found, tag);
                    return Ok(Some(pos));
                }
                RuleOp::Capture => {
                    let rule = self.code[ip + 1] as usize;
                    let tag = self.code[ip + 2];
                    let Some(next) = self.exec(rule, pos)? else {
                        return Ok(None);
                    };
                    if tag == 0 && self.mode == Mode::Accumulate {
                        // Untagged accumulate capture: the bytes go
                        // straight to scratch.
                        self.scratch.extend_from_slice(&self.text[pos..next]);
                    } else {
                        let matched = Value::Str(self.text[pos..next].into());
                        self.push_capture(matched, tag);
                    }
                    return Ok(Some(next));
                }
                RuleOp::Position => {
                    self.push_capture(Value::number(pos as f64), self.code[ip + 1]);
                    return Ok(Some(pos));
                }
                RuleOp::Argument => {
                    let index = self.code[ip + 1] as usize;
                    let Some(value) = self.extras.get(index) else {
                        return Err(PegMatchError::InvalidCaptureIndex(index));
                    };
                    self.push_capture(value.clone(), self.code[ip + 2]);
                    return Ok(Some(pos));
                }
                RuleOp::Constant => {
                    let value = self.constants[self.code[ip + 1] as usize].clone();
                    self.push_capture(value, self.code[ip + 2]);
                    return Ok(Some(pos));
                }
                RuleOp::Accumulate => {
                    let rule = self.code[ip + 1] as usize;
                    let tag = self.code[ip + 2];
                    if tag == 0 && self.mode == Mode::Accumulate {
                        // Already accumulating; the wrapper is redundant.
                        ip = rule;
                        continue;
                    }
                    let old_mode = self.mode;
                    let start = self.scratch.len();
                    self.mode = Mode::Accumulate;
                    let result = self.exec(rule, pos)?;
                    self.mode = old_mode;
                    let Some(next) = result else {
                        self.scratch.truncate(start);
                        return Ok(None);
                    };
                    let captured = Value::Str(self.scratch[start..].into());
                    self.scratch.truncate(start);
                    self.push_capture(captured, tag);
                    return Ok(Some(next));
                }
                RuleOp::Group => {
                    let rule = self.code[ip + 1] as usize;
                    let tag = self.code[ip + 2];
                    let save = self.save();
                    let Some(next) = self.exec(rule, pos)? else {
                        return Ok(None);
                    };
                    let items = self.captures[save.caps..].to_vec();
                    self.restore(save);
                    self.push_capture(Value::array(items), tag);
                    return Ok(Some(next));
                }
                RuleOp::Replace => {
                    let rule = self.code[ip + 1] as usize;
                    let constant = self.constants[self.code[ip + 2] as usize].clone();
                    let tag = self.code[ip + 3];
                    let save = self.save();
                    let Some(next) = self.exec(rule, pos)? else {
                        return Ok(None);
                    };
                    let replaced = match &constant {
                        Value::Table(_) | Value::Struct(_) => {
                            let matched = Value::Str(self.text[pos..next].into());
                            constant.get_key(&matched).unwrap_or(Value::Nil)
                        }
                        Value::Function(_) | Value::CFunction(_) => {
                            let argv = self.captures[save.caps..].to_vec();
                            call_callback(&constant, &argv)?
                        }
                        other => other.clone(),
                    };
                    self.restore(save);
                    self.push_capture(replaced, tag);
                    return Ok(Some(next));
                }
                RuleOp::MatchTime => {
                    let rule = self.code[ip + 1] as usize;
                    let callback = self.constants[self.code[ip + 2] as usize].clone();
                    let tag = self.code[ip + 3];
                    let save = self.save();
                    let Some(next) = self.exec(rule, pos)? else {
                        return Ok(None);
                    };
                    let argv = self.captures[save.caps..].to_vec();
                    let result = call_callback(&callback, &argv)?;
                    self.restore(save);
                    if !result.truthy() {
                        return Ok(None);
                    }
                    self.push_capture(result, tag);
                    return Ok(Some(next));
                }
                RuleOp::Error => {
                    let rule = self.code[ip + 1] as usize;
                    let before = self.captures.len();
                    let Some(_) = self.exec(rule, pos)? else {
                        return Ok(None);
                    };
                    let raised = if self.captures.len() > before {
                        self.captures.last().cloned().unwrap_or(Value::Nil)
                    } else {
                        Value::string(format!("match error at position {pos}"))
                    };
                    return Err(PegMatchError::UserError(raised));
                }
                RuleOp::Drop => {
                    let save = self.save();
                    let result = self.exec(self.code[ip + 1] as usize, pos)?;
                    self.restore(save);
                    return Ok(result);
                }
                RuleOp::BackMatch => {
                    let search = self.code[ip + 1] as u8;
                    let Some(bytes) = self.find_tagged(search).and_then(|v| v.as_bytes()) else {
                        return Ok(None);
                    };
                    let end = pos + bytes.len();
                    if end <= self.text.len() && self.text[pos..end] == *bytes {
                        return Ok(Some(end));
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Newest capture carrying `tag`.
    fn find_tagged(&self, tag: u8) -> Option<Value> {
        (0..self.tags.len())
            .rev()
            .find(|&i| self.tags[i] == tag)
            .map(|i| self.captures[i].clone())
    }
}

/// Runs a `replace`/`cmt` callback. The argv slice aliases the capture
/// stack only for the duration of the call.
fn call_callback(callback: &Value, argv: &[Value]) -> Result<Value, PegMatchError> {
    exec::call(callback, argv).map_err(|e| match e {
        ExecError::Thrown(value) => PegMatchError::UserError(value),
        other => PegMatchError::UserError(Value::string(other.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::super::compile;
    use super::*;

    fn sym(s: &str) -> Value {
        Value::symbol(s)
    }

    fn kw(s: &str) -> Value {
        Value::keyword(s)
    }

    fn form(parts: Vec<Value>) -> Value {
        Value::tuple(parts)
    }

    fn run(pattern: &Value, text: &str) -> Option<Vec<Value>> {
        compile(pattern).unwrap().matches(text.as_bytes(), 0, &[]).unwrap()
    }

    #[test]
    fn test_digits_grammar() {
        let grammar = Value::table_from_pairs(vec![(
            kw("main"),
            form(vec![sym("some"), form(vec![sym("range"), Value::string("09")])]),
        )]);
        assert!(run(&grammar, "123abc").is_some());
        assert!(run(&grammar, "abc").is_none());
    }

    #[test]
    fn test_accumulate_substitution() {
        // (% (some (+ (/ "a" "A") (<- 1)))) over "banana" -> "bAnAnA":
        // replaced bytes and captured bytes interleave in the accumulator.
        let pattern = form(vec![
            sym("%"),
            form(vec![
                sym("some"),
                form(vec![
                    sym("+"),
                    form(vec![sym("/"), Value::string("a"), Value::string("A")]),
                    form(vec![sym("<-"), Value::number(1.0)]),
                ]),
            ]),
        ]);
        let caps = run(&pattern, "banana").unwrap();
        assert_eq!(caps, vec![Value::string("bAnAnA")]);
    }

    #[test]
    fn test_backmatch() {
        let grammar = Value::table_from_pairs(vec![(
            kw("main"),
            form(vec![
                sym("*"),
                form(vec![
                    sym("capture"),
                    form(vec![sym("some"), form(vec![sym("range"), Value::string("az")])]),
                    kw("w"),
                ]),
                Value::string("-"),
                form(vec![sym("backmatch"), kw("w")]),
            ]),
        )]);
        assert!(run(&grammar, "foo-foo").is_some());
        assert!(run(&grammar, "foo-bar").is_none());
    }

    #[test]
    fn test_choice_restores_captures() {
        // First alternative captures then fails on "!"; the second must
        // not see its captures.
        let pattern = form(vec![
            sym("+"),
            form(vec![
                sym("*"),
                form(vec![sym("capture"), Value::string("ab")]),
                Value::string("!"),
            ]),
            form(vec![sym("capture"), Value::string("abc")]),
        ]);
        let caps = run(&pattern, "abc").unwrap();
        assert_eq!(caps, vec![Value::string("abc")]);
    }

    #[test]
    fn test_position_and_constant() {
        let pattern = form(vec![
            sym("*"),
            Value::string("ab"),
            form(vec![sym("$")]),
            form(vec![sym("constant"), Value::number(5.0)]),
        ]);
        let caps = run(&pattern, "abc").unwrap();
        assert_eq!(caps, vec![Value::number(2.0), Value::number(5.0)]);
    }

    #[test]
    fn test_argument_capture() {
        let pattern = form(vec![sym("argument"), Value::number(1.0)]);
        let program = compile(&pattern).unwrap();
        let caps = program
            .matches(b"", 0, &[Value::string("x"), Value::string("y")])
            .unwrap()
            .unwrap();
        assert_eq!(caps, vec![Value::string("y")]);
        let err = program.matches(b"", 0, &[]).unwrap_err();
        assert!(matches!(err, PegMatchError::InvalidCaptureIndex(1)));
    }

    #[test]
    fn test_group_collects_subcaptures() {
        let pattern = form(vec![
            sym("group"),
            form(vec![
                sym("*"),
                form(vec![sym("capture"), Value::string("a")]),
                form(vec![sym("capture"), Value::string("b")]),
            ]),
        ]);
        let caps = run(&pattern, "ab").unwrap();
        let Value::Array(items) = &caps[0] else { panic!("expected array capture") };
        assert_eq!(*items.borrow(), vec![Value::string("a"), Value::string("b")]);
    }

    #[test]
    fn test_replace_with_table() {
        let table = Value::table_from_pairs(vec![(Value::string("cat"), Value::string("dog"))]);
        let pattern = form(vec![
            sym("/"),
            form(vec![sym("capture"), Value::string("cat")]),
            table,
        ]);
        let caps = run(&pattern, "cat").unwrap();
        assert_eq!(caps, vec![Value::string("dog")]);
    }

    #[test]
    fn test_cmt_filters_matches() {
        fn only_foo(args: &[Value]) -> Result<Value, Value> {
            match args.first() {
                Some(v) if *v == Value::string("foo") => Ok(v.clone()),
                _ => Ok(Value::boolean(false)),
            }
        }
        let pattern = form(vec![
            sym("cmt"),
            form(vec![sym("capture"), form(vec![sym("some"), Value::number(1.0)])]),
            Value::CFunction(only_foo),
        ]);
        assert!(run(&pattern, "foo").is_some());
        assert!(run(&pattern, "bar").is_none());
    }

    #[test]
    fn test_error_form_raises_last_capture() {
        let pattern = form(vec![
            sym("error"),
            form(vec![sym("capture"), Value::string("bad")]),
        ]);
        let err = compile(&pattern).unwrap().matches(b"bad", 0, &[]).unwrap_err();
        assert!(matches!(err, PegMatchError::UserError(v) if v == Value::string("bad")));
    }

    #[test]
    fn test_lookahead_zero_width() {
        let pattern = form(vec![
            sym("*"),
            form(vec![sym(">"), Value::number(0.0), Value::string("ab")]),
            form(vec![sym("capture"), Value::string("a")]),
        ]);
        let caps = run(&pattern, "ab").unwrap();
        assert_eq!(caps, vec![Value::string("a")]);
    }

    #[test]
    fn test_negative_byte_count() {
        // -1 matches only at end of input.
        let pattern = form(vec![sym("*"), Value::string("ab"), Value::number(-1.0)]);
        assert!(run(&pattern, "ab").is_some());
        assert!(run(&pattern, "abc").is_none());
    }

    #[test]
    fn test_between_zero_width_breaks() {
        // (any (any "x")) must terminate even though the inner rule can
        // match zero-width forever.
        let pattern = form(vec![sym("any"), form(vec![sym("any"), Value::string("x")])]);
        assert!(run(&pattern, "y").is_some());
    }

    #[test]
    fn test_recursive_grammar_matches_balanced() {
        let grammar = Value::table_from_pairs(vec![(
            kw("main"),
            form(vec![
                sym("+"),
                form(vec![
                    sym("*"),
                    Value::string("("),
                    kw("main"),
                    Value::string(")"),
                ]),
                Value::string(""),
            ]),
        )]);
        let program = compile(&grammar).unwrap();
        let deep = format!("{}{}", "(".repeat(20), ")".repeat(20));
        assert!(program.matches(deep.as_bytes(), 0, &[]).unwrap().is_some());
    }

    #[test]
    fn test_default_grammar_classes() {
        assert!(run(&kw("d+"), "123").is_some());
        assert!(run(&kw("d+"), "abc").is_none());
        assert!(run(&Value::keyword("s"), " ").is_some());
        assert!(run(&Value::keyword("h"), "f").is_some());
    }

    #[test]
    fn test_if_not_contributes_no_captures() {
        let pattern = form(vec![
            sym("if-not"),
            form(vec![sym("capture"), Value::string("x")]),
            form(vec![sym("capture"), Value::string("a")]),
        ]);
        let caps = run(&pattern, "a").unwrap();
        assert_eq!(caps, vec![Value::string("a")]);
    }

    #[test]
    fn test_match_determinism() {
        let pattern = form(vec![sym("some"), form(vec![sym("range"), Value::string("az")])]);
        let program = compile(&pattern).unwrap();
        let first = program.matches(b"abc", 0, &[]).unwrap();
        let second = program.matches(b"abc", 0, &[]).unwrap();
        assert_eq!(first, second);
    }
}
