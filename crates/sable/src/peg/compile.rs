//! PEG compiler: lowers grammar expressions into rule programs.
//!
//! An expression is a number (byte-count match), a string (literal), a
//! keyword (rule reference), a mapping (sub-grammar with a `:main` rule),
//! or a special-form tuple. Sub-expressions memoize per grammar scope;
//! primitive shapes memoize at the root so they are emitted once. Keyword
//! rules compile through a reserved indirection slot so recursive rules
//! can reference themselves mid-compilation.

use std::{fmt, rc::Rc};

use ahash::AHashMap;

use super::{PegProgram, op::RuleOp};
use crate::{
    limits::{DEFAULT_MAX_RECURSION_DEPTH, MAX_REFERENCE_DEPTH},
    value::Value,
};

/// Error produced while compiling a grammar.
#[derive(Debug, Clone)]
pub enum PegCompileError {
    /// Tuple head is not a recognized special form.
    UnknownSpecial(String),
    /// A form had the wrong arity or operand types; carries the detail.
    BadForm(String),
    /// A keyword reference is not defined in any enclosing grammar.
    UnknownRule(String),
    /// A keyword chain did not terminate within the reference budget.
    ReferenceChainTooDeep,
    /// Expression nesting exceeded the recursion budget.
    RecursedTooDeeply,
    /// A grammar mapping has no `:main` rule.
    MissingMain,
    /// More than 255 distinct capture tags.
    TooManyTags,
}

impl fmt::Display for PegCompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSpecial(name) => write!(f, "unknown special form {name}"),
            Self::BadForm(detail) => f.write_str(detail),
            Self::UnknownRule(name) => write!(f, "unknown rule :{name}"),
            Self::ReferenceChainTooDeep => f.write_str("reference chain too deep"),
            Self::RecursedTooDeeply => f.write_str("grammar recursed too deeply"),
            Self::MissingMain => f.write_str("missing main rule"),
            Self::TooManyTags => f.write_str("too many tags"),
        }
    }
}

impl std::error::Error for PegCompileError {}

thread_local! {
    /// The global default grammar, at the bottom of every scope chain.
    /// Thread-local because grammar values are `Rc`-based.
    static DEFAULT_GRAMMAR: Value = default_grammar();
}

/// Builds the default grammar: single-character classes and their
/// repetition shorthands.
fn default_grammar() -> Value {
    fn range(spec: &[&str]) -> Value {
        let mut items = vec![Value::symbol("range")];
        items.extend(spec.iter().map(Value::string));
        Value::tuple(items)
    }
    let classes: [(&str, Value); 5] = [
        ("d", range(&["09"])),
        ("a", range(&["az", "AZ"])),
        ("w", range(&["az", "AZ", "09"])),
        ("h", range(&["09", "af", "AF"])),
        ("s", Value::tuple(vec![Value::symbol("set"), Value::string(" \t\r\n\0\x0B\x0C")])),
    ];
    let mut pairs = Vec::new();
    for (name, rule) in classes {
        pairs.push((Value::keyword(name), rule.clone()));
        pairs.push((
            Value::keyword(format!("{name}+")),
            Value::tuple(vec![Value::symbol("some"), rule.clone()]),
        ));
        pairs.push((
            Value::keyword(format!("{name}*")),
            Value::tuple(vec![Value::symbol("any"), rule]),
        ));
    }
    Value::table_from_pairs(pairs)
}

/// Repetition cap meaning "unbounded".
const MAX_REPEAT: u32 = u32::MAX;

struct Scope {
    grammar: Value,
    memo: AHashMap<Value, u32>,
}

struct Compiler {
    bytecode: Vec<u32>,
    constants: Vec<Value>,
    /// Tag names in allocation order; index `i` is tag byte `i + 1`.
    tags: Vec<Rc<[u8]>>,
    scopes: Vec<Scope>,
    depth: usize,
}

/// Compiles a grammar expression into an executable program.
pub fn compile(expr: &Value) -> Result<Rc<PegProgram>, PegCompileError> {
    DEFAULT_GRAMMAR.with(|default| {
        let mut compiler = Compiler {
            // Words 0..3 are reserved for the entry rule, patched below.
            bytecode: vec![0; 3],
            constants: Vec::new(),
            tags: Vec::new(),
            scopes: vec![Scope { grammar: default.clone(), memo: AHashMap::new() }],
            depth: 0,
        };
        let main = compiler.compile_expr(expr)?;
        compiler.bytecode[0] = RuleOp::Sequence as u32;
        compiler.bytecode[1] = 1;
        compiler.bytecode[2] = main;
        Ok(Rc::new(PegProgram { bytecode: compiler.bytecode, constants: compiler.constants }))
    })
}

impl Compiler {
    fn compile_expr(&mut self, expr: &Value) -> Result<u32, PegCompileError> {
        self.depth += 1;
        if self.depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(PegCompileError::RecursedTooDeeply);
        }
        let result = self.compile_expr_inner(expr);
        self.depth -= 1;
        result
    }

    fn compile_expr_inner(&mut self, expr: &Value) -> Result<u32, PegCompileError> {
        match expr {
            Value::Number(_) => {
                let n = expr.as_int_exact().ok_or_else(|| {
                    PegCompileError::BadForm("byte-count rule must be an integer".to_owned())
                })?;
                self.primitive(expr, |c| {
                    if n >= 0 {
                        Ok(c.emit(&[RuleOp::NChar as u32, n as u32]))
                    } else {
                        Ok(c.emit(&[RuleOp::NotNChar as u32, (-n) as u32]))
                    }
                })
            }
            Value::Str(bytes) => {
                let bytes = bytes.clone();
                self.primitive(expr, |c| Ok(c.emit_literal(&bytes)))
            }
            Value::Keyword(name) => self.compile_reference(name.clone()),
            Value::Table(_) | Value::Struct(_) => self.compile_grammar(expr),
            Value::Tuple(t) => {
                if let Some(&found) = self.scope().memo.get(expr) {
                    return Ok(found);
                }
                let head = t.items.first().and_then(Value::as_symbol).ok_or_else(|| {
                    PegCompileError::BadForm("special form must start with a symbol".to_owned())
                })?;
                let head = head.to_vec();
                let rule = self.compile_special(&head, &t.items[1..])?;
                self.scope_mut().memo.insert(expr.clone(), rule);
                Ok(rule)
            }
            other => Err(PegCompileError::BadForm(format!(
                "cannot compile peg from {}",
                other.type_name()
            ))),
        }
    }

    /// Primitive shapes cache at the root scope.
    fn primitive(
        &mut self,
        key: &Value,
        build: impl FnOnce(&mut Self) -> Result<u32, PegCompileError>,
    ) -> Result<u32, PegCompileError> {
        if let Some(&found) = self.scopes[0].memo.get(key) {
            return Ok(found);
        }
        let rule = build(self)?;
        self.scopes[0].memo.insert(key.clone(), rule);
        Ok(rule)
    }

    /// Rule reference: resolve the keyword through the scope chain, then
    /// compile the definition behind a reserved indirection slot so the
    /// rule can reference itself.
    fn compile_reference(&mut self, name: Rc<[u8]>) -> Result<u32, PegCompileError> {
        let key = Value::Keyword(name.clone());
        if let Some(&found) = self.scope().memo.get(&key) {
            return Ok(found);
        }
        let mut target = key.clone();
        let mut definition = None;
        for _ in 0..MAX_REFERENCE_DEPTH {
            let Some(found) = self.lookup_rule(&target) else {
                let shown = match &target {
                    Value::Keyword(n) => String::from_utf8_lossy(n).into_owned(),
                    other => other.to_string(),
                };
                return Err(PegCompileError::UnknownRule(shown));
            };
            if matches!(found, Value::Keyword(_)) {
                target = found;
            } else {
                definition = Some(found);
                break;
            }
        }
        let definition = definition.ok_or(PegCompileError::ReferenceChainTooDeep)?;

        let reserved = self.emit(&[RuleOp::Sequence as u32, 1, 0]);
        self.scope_mut().memo.insert(key, reserved);
        let body = self.compile_expr(&definition)?;
        self.bytecode[reserved as usize + 2] = body;
        Ok(reserved)
    }

    fn lookup_rule(&self, key: &Value) -> Option<Value> {
        self.scopes.iter().rev().find_map(|scope| scope.grammar.get_key(key))
    }

    /// Sub-grammar: a new scope chained over the current one.
    fn compile_grammar(&mut self, grammar: &Value) -> Result<u32, PegCompileError> {
        if let Some(&found) = self.scope().memo.get(grammar) {
            return Ok(found);
        }
        self.scopes.push(Scope { grammar: grammar.clone(), memo: AHashMap::new() });
        // Compiling through the reference path registers `:main` in the
        // new scope's memo before its body compiles, so a self-recursive
        // main resolves to the reserved slot instead of re-entering.
        let result = if grammar.get_keyword("main").is_some() {
            self.compile_expr(&Value::keyword("main"))
        } else {
            Err(PegCompileError::MissingMain)
        };
        self.scopes.pop();
        let rule = result?;
        self.scope_mut().memo.insert(grammar.clone(), rule);
        Ok(rule)
    }

    fn compile_special(&mut self, head: &[u8], args: &[Value]) -> Result<u32, PegCompileError> {
        match head {
            b"sequence" | b"*" => {
                let rules = self.compile_all(args)?;
                Ok(self.emit_with_tail(RuleOp::Sequence, &rules))
            }
            b"choice" | b"+" => {
                let rules = self.compile_all(args)?;
                Ok(self.emit_with_tail(RuleOp::Choice, &rules))
            }
            b"if" => {
                let [cond, body] = self.two(head, args)?;
                Ok(self.emit(&[RuleOp::If as u32, cond, body]))
            }
            b"if-not" => {
                let [cond, body] = self.two(head, args)?;
                Ok(self.emit(&[RuleOp::IfNot as u32, cond, body]))
            }
            b"not" | b"!" => {
                let rule = self.one(head, args)?;
                Ok(self.emit(&[RuleOp::Not as u32, rule]))
            }
            b"look" | b">" => {
                let (offset, rule) = match args {
                    [rule] => (0i64, rule),
                    [offset, rule] => (
                        offset.as_int_exact().ok_or_else(|| {
                            PegCompileError::BadForm("look offset must be an integer".to_owned())
                        })?,
                        rule,
                    ),
                    _ => return Err(bad_arity(head, "1 or 2")),
                };
                let offset = i32::try_from(offset)
                    .map_err(|_| PegCompileError::BadForm("look offset out of range".to_owned()))?;
                let rule = self.compile_expr(rule)?;
                Ok(self.emit(&[RuleOp::Look as u32, offset as u32, rule]))
            }
            b"between" => {
                let [lo, hi, rule] = args else {
                    return Err(bad_arity(head, "3"));
                };
                let lo = repeat_bound(lo)?;
                let hi = repeat_bound(hi)?;
                self.emit_between(lo, hi, rule)
            }
            b"any" => {
                let rule = args.first().ok_or_else(|| bad_arity(head, "1"))?;
                self.emit_between(0, MAX_REPEAT, rule)
            }
            b"some" => {
                let rule = args.first().ok_or_else(|| bad_arity(head, "1"))?;
                self.emit_between(1, MAX_REPEAT, rule)
            }
            b"opt" | b"?" => {
                let rule = args.first().ok_or_else(|| bad_arity(head, "1"))?;
                self.emit_between(0, 1, rule)
            }
            b"at-least" => {
                let [n, rule] = args else {
                    return Err(bad_arity(head, "2"));
                };
                self.emit_between(repeat_bound(n)?, MAX_REPEAT, rule)
            }
            b"at-most" => {
                let [n, rule] = args else {
                    return Err(bad_arity(head, "2"));
                };
                self.emit_between(0, repeat_bound(n)?, rule)
            }
            b"range" => self.compile_range(args),
            b"set" => {
                let [chars] = args else {
                    return Err(bad_arity(head, "1"));
                };
                let Some(chars) = chars.as_bytes() else {
                    return Err(PegCompileError::BadForm("set expects a string".to_owned()));
                };
                let mut bitmap = [0u32; 8];
                for &b in chars.iter() {
                    bitmap[(b >> 5) as usize] |= 1 << (b & 31);
                }
                Ok(self.emit_set(&bitmap))
            }
            b"capture" | b"<-" | b"quote" => {
                let (rule, tag) = self.rule_and_tag(head, args)?;
                Ok(self.emit(&[RuleOp::Capture as u32, rule, tag]))
            }
            b"group" => {
                let (rule, tag) = self.rule_and_tag(head, args)?;
                Ok(self.emit(&[RuleOp::Group as u32, rule, tag]))
            }
            b"accumulate" | b"%" => {
                let (rule, tag) = self.rule_and_tag(head, args)?;
                Ok(self.emit(&[RuleOp::Accumulate as u32, rule, tag]))
            }
            b"drop" => {
                let rule = self.one(head, args)?;
                Ok(self.emit(&[RuleOp::Drop as u32, rule]))
            }
            b"error" => {
                let rule = match args {
                    [] => self.emit(&[RuleOp::Sequence as u32, 0]),
                    [rule] => self.compile_expr(rule)?,
                    _ => return Err(bad_arity(head, "0 or 1")),
                };
                Ok(self.emit(&[RuleOp::Error as u32, rule]))
            }
            b"replace" | b"/" => {
                let (rule, constant, tag) = self.rule_constant_tag(head, args)?;
                Ok(self.emit(&[RuleOp::Replace as u32, rule, constant, tag]))
            }
            b"cmt" => {
                let (rule, constant, tag) = self.rule_constant_tag(head, args)?;
                Ok(self.emit(&[RuleOp::MatchTime as u32, rule, constant, tag]))
            }
            b"position" | b"$" => {
                let tag = self.opt_tag(head, args, 0)?;
                Ok(self.emit(&[RuleOp::Position as u32, tag]))
            }
            b"argument" => {
                let index = args.first().and_then(Value::as_int_exact).and_then(|n| {
                    u32::try_from(n).ok()
                });
                let Some(index) = index else {
                    return Err(PegCompileError::BadForm(
                        "argument expects a non-negative integer".to_owned(),
                    ));
                };
                let tag = self.opt_tag(head, args, 1)?;
                Ok(self.emit(&[RuleOp::Argument as u32, index, tag]))
            }
            b"constant" => {
                let value = args.first().ok_or_else(|| bad_arity(head, "1 or 2"))?;
                let constant = self.add_constant(value.clone());
                let tag = self.opt_tag(head, args, 1)?;
                Ok(self.emit(&[RuleOp::Constant as u32, constant, tag]))
            }
            b"backref" | b"->" => {
                let search = args.first().ok_or_else(|| bad_arity(head, "1 or 2"))?;
                let search = self.tag_byte(search)?;
                let tag = self.opt_tag(head, args, 1)?;
                Ok(self.emit(&[RuleOp::GetTag as u32, search, tag]))
            }
            b"backmatch" => {
                let search = args.first().ok_or_else(|| bad_arity(head, "1"))?;
                let search = self.tag_byte(search)?;
                Ok(self.emit(&[RuleOp::BackMatch as u32, search]))
            }
            other => {
                Err(PegCompileError::UnknownSpecial(String::from_utf8_lossy(other).into_owned()))
            }
        }
    }

    fn compile_range(&mut self, args: &[Value]) -> Result<u32, PegCompileError> {
        let mut ranges = Vec::with_capacity(args.len());
        for arg in args {
            let bytes = arg.as_bytes().filter(|b| b.len() == 2).ok_or_else(|| {
                PegCompileError::BadForm("range expects two-character strings".to_owned())
            })?;
            ranges.push((bytes[0], bytes[1]));
        }
        match ranges.as_slice() {
            [] => Err(bad_arity(b"range", "at least 1")),
            // A single range is one comparison; multiple ranges become a
            // 256-bit set.
            [(lo, hi)] => {
                Ok(self.emit(&[RuleOp::Range as u32, u32::from(*lo) | (u32::from(*hi) << 16)]))
            }
            many => {
                let mut bitmap = [0u32; 8];
                for &(lo, hi) in many {
                    for b in lo..=hi {
                        bitmap[(b >> 5) as usize] |= 1 << (b & 31);
                    }
                }
                Ok(self.emit_set(&bitmap))
            }
        }
    }

    fn emit_between(&mut self, lo: u32, hi: u32, rule: &Value) -> Result<u32, PegCompileError> {
        let rule = self.compile_expr(rule)?;
        Ok(self.emit(&[RuleOp::Between as u32, lo, hi, rule]))
    }

    fn compile_all(&mut self, args: &[Value]) -> Result<Vec<u32>, PegCompileError> {
        args.iter().map(|arg| self.compile_expr(arg)).collect()
    }

    fn one(&mut self, head: &[u8], args: &[Value]) -> Result<u32, PegCompileError> {
        let [rule] = args else {
            return Err(bad_arity(head, "1"));
        };
        self.compile_expr(rule)
    }

    fn two(&mut self, head: &[u8], args: &[Value]) -> Result<[u32; 2], PegCompileError> {
        let [a, b] = args else {
            return Err(bad_arity(head, "2"));
        };
        Ok([self.compile_expr(a)?, self.compile_expr(b)?])
    }

    fn rule_and_tag(&mut self, head: &[u8], args: &[Value]) -> Result<(u32, u32), PegCompileError> {
        let rule = match args {
            [rule] | [rule, _] => self.compile_expr(rule)?,
            _ => return Err(bad_arity(head, "1 or 2")),
        };
        let tag = self.opt_tag(head, args, 1)?;
        Ok((rule, tag))
    }

    fn rule_constant_tag(
        &mut self,
        head: &[u8],
        args: &[Value],
    ) -> Result<(u32, u32, u32), PegCompileError> {
        let (rule, constant) = match args {
            [rule, constant] | [rule, constant, _] => (self.compile_expr(rule)?, constant.clone()),
            _ => return Err(bad_arity(head, "2 or 3")),
        };
        let constant = self.add_constant(constant);
        let tag = self.opt_tag(head, args, 2)?;
        Ok((rule, constant, tag))
    }

    /// Optional trailing tag argument at position `index`; `0` when
    /// absent.
    fn opt_tag(&mut self, head: &[u8], args: &[Value], index: usize) -> Result<u32, PegCompileError> {
        match args.get(index) {
            None => Ok(0),
            Some(tag) => {
                if args.len() > index + 1 {
                    return Err(bad_arity(head, "a trailing tag at most"));
                }
                self.tag_byte(tag)
            }
        }
    }

    /// Maps a tag keyword to its byte. `0` means untagged, so tag bytes
    /// start at 1; a 256th distinct tag overflows the byte.
    fn tag_byte(&mut self, tag: &Value) -> Result<u32, PegCompileError> {
        let Some(name) = tag.as_bytes() else {
            return Err(PegCompileError::BadForm(format!(
                "tag must be a keyword, got {}",
                tag.type_name()
            )));
        };
        if let Some(found) = self.tags.iter().position(|t| **t == *name) {
            return Ok(found as u32 + 1);
        }
        if self.tags.len() >= 255 {
            return Err(PegCompileError::TooManyTags);
        }
        self.tags.push(name);
        Ok(self.tags.len() as u32)
    }

    fn add_constant(&mut self, value: Value) -> u32 {
        if let Some(found) = self.constants.iter().position(|c| *c == value) {
            return found as u32;
        }
        self.constants.push(value);
        (self.constants.len() - 1) as u32
    }

    fn emit(&mut self, words: &[u32]) -> u32 {
        let index = self.bytecode.len() as u32;
        self.bytecode.extend_from_slice(words);
        index
    }

    fn emit_with_tail(&mut self, op: RuleOp, rules: &[u32]) -> u32 {
        let index = self.bytecode.len() as u32;
        self.bytecode.push(op as u32);
        self.bytecode.push(rules.len() as u32);
        self.bytecode.extend_from_slice(rules);
        index
    }

    fn emit_set(&mut self, bitmap: &[u32; 8]) -> u32 {
        let index = self.bytecode.len() as u32;
        self.bytecode.push(RuleOp::Set as u32);
        self.bytecode.extend_from_slice(bitmap);
        index
    }

    fn emit_literal(&mut self, bytes: &[u8]) -> u32 {
        let index = self.bytecode.len() as u32;
        self.bytecode.push(RuleOp::Literal as u32);
        self.bytecode.push(bytes.len() as u32);
        for chunk in bytes.chunks(4) {
            let mut word = 0u32;
            for (i, &b) in chunk.iter().enumerate() {
                word |= u32::from(b) << (8 * i);
            }
            self.bytecode.push(word);
        }
        index
    }

    fn scope(&self) -> &Scope {
        self.scopes.last().expect("scope stack is never empty")
    }

    fn scope_mut(&mut self) -> &mut Scope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }
}

fn bad_arity(head: &[u8], expected: &str) -> PegCompileError {
    PegCompileError::BadForm(format!(
        "{} expects {expected} arguments",
        String::from_utf8_lossy(head)
    ))
}

fn repeat_bound(v: &Value) -> Result<u32, PegCompileError> {
    v.as_int_exact().and_then(|n| u32::try_from(n).ok()).ok_or_else(|| {
        PegCompileError::BadForm("repetition bound must be a non-negative integer".to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Value {
        Value::symbol(s)
    }

    fn form(parts: Vec<Value>) -> Value {
        Value::tuple(parts)
    }

    #[test]
    fn test_literal_emitted_once() {
        // The same string appearing twice memoizes at the root.
        let expr = form(vec![
            sym("sequence"),
            Value::string("ab"),
            Value::string("cd"),
            Value::string("ab"),
        ]);
        let program = compile(&expr).unwrap();
        let literals = program
            .bytecode
            .iter()
            .filter(|&&w| RuleOp::from_word(w) == Some(RuleOp::Literal))
            .count();
        // One per distinct string; the packed payload bytes of "ab"/"cd"
        // do not decode to Literal opcodes.
        assert_eq!(literals, 2);
    }

    #[test]
    fn test_single_range_uses_range_op() {
        let program = compile(&form(vec![sym("range"), Value::string("09")])).unwrap();
        assert!(program.bytecode.iter().any(|&w| RuleOp::from_word(w) == Some(RuleOp::Range)));
    }

    #[test]
    fn test_multi_range_uses_set_op() {
        let program =
            compile(&form(vec![sym("range"), Value::string("az"), Value::string("AZ")])).unwrap();
        assert!(program.bytecode.iter().any(|&w| w & 0x1F == RuleOp::Set as u32));
    }

    #[test]
    fn test_missing_main() {
        let grammar = Value::table_from_pairs(vec![(Value::keyword("x"), Value::string("a"))]);
        assert!(matches!(compile(&grammar), Err(PegCompileError::MissingMain)));
    }

    #[test]
    fn test_unknown_rule() {
        assert!(matches!(
            compile(&Value::keyword("no-such-rule")),
            Err(PegCompileError::UnknownRule(_))
        ));
    }

    #[test]
    fn test_unknown_special() {
        assert!(matches!(
            compile(&form(vec![sym("zap"), Value::string("a")])),
            Err(PegCompileError::UnknownSpecial(_))
        ));
    }

    #[test]
    fn test_too_many_tags() {
        let mut rules = vec![sym("sequence")];
        for i in 0..256 {
            rules.push(form(vec![
                sym("position"),
                Value::keyword(format!("t{i}")),
            ]));
        }
        assert!(matches!(compile(&form(rules)), Err(PegCompileError::TooManyTags)));
    }

    #[test]
    fn test_recursive_grammar_compiles() {
        // Balanced parens: main references itself through the reserved
        // indirection slot.
        let grammar = Value::table_from_pairs(vec![(
            Value::keyword("main"),
            form(vec![
                sym("choice"),
                form(vec![
                    sym("sequence"),
                    Value::string("("),
                    Value::keyword("main"),
                    Value::string(")"),
                ]),
                Value::string(""),
            ]),
        )]);
        let program = compile(&grammar).unwrap();
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn test_default_grammar_reachable() {
        let program = compile(&Value::keyword("d+")).unwrap();
        assert_eq!(program.validate(), Ok(()));
    }

    #[test]
    fn test_reference_cycle_detected() {
        let grammar = Value::table_from_pairs(vec![
            (Value::keyword("main"), Value::keyword("a")),
            (Value::keyword("a"), Value::keyword("b")),
            (Value::keyword("b"), Value::keyword("a")),
        ]);
        assert!(matches!(compile(&grammar), Err(PegCompileError::ReferenceChainTooDeep)));
    }
}
