//! Assembler: parses a declarative function description into a `FuncDef`.
//!
//! The description is a table or struct with keyword keys (`:arity`,
//! `:slots`, `:bytecode`, ...). Bytecode is assembled in two passes: the
//! first records labels, the second emits instruction words. Nested defs
//! assemble recursively with this assembler as parent; environment symbols
//! resolve through the parent chain, allocating environment entries as
//! they go.

use std::{fmt, rc::Rc, str::FromStr};

use ahash::AHashMap;

use super::op::{BREAKPOINT_BIT, Opcode, OperandKind, OperandSpec};
use crate::{
    funcdef::{FuncDef, FuncFlags, SourceMapping, SymbolSlot},
    value::{Tuple, Value, type_mask_from_name},
};

/// Error produced by [`assemble`]. Carries the failing instruction index
/// when the failure happened while emitting bytecode.
#[derive(Debug, Clone)]
pub struct AssembleError {
    message: String,
    instruction: Option<usize>,
}

impl AssembleError {
    fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), instruction: None }
    }

    fn at(message: impl Into<String>, instruction: usize) -> Self {
        Self { message: message.into(), instruction: Some(instruction) }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Index of the instruction being emitted when assembly failed.
    #[must_use]
    pub fn instruction(&self) -> Option<usize> {
        self.instruction
    }
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instruction {
            Some(index) => write!(f, "instruction {index}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for AssembleError {}

/// Per-def assembly state. Scopes form a stack, parent first, so
/// environment resolution can walk and mutate enclosing defs.
#[derive(Default)]
struct AsmScope {
    name: Option<Rc<[u8]>>,
    slots: AHashMap<Vec<u8>, u32>,
    labels: AHashMap<Vec<u8>, u32>,
    constant_names: AHashMap<Vec<u8>, u32>,
    def_names: AHashMap<Vec<u8>, u32>,
    env_names: AHashMap<Vec<u8>, u32>,
    environments: Vec<i32>,
    max_slot_ref: i64,
}

/// Assembles a function description into a verified `FuncDef`.
pub fn assemble(source: &Value) -> Result<Rc<FuncDef>, AssembleError> {
    let mut scopes = Vec::new();
    assemble_def(&mut scopes, source)
}

fn assemble_def(scopes: &mut Vec<AsmScope>, source: &Value) -> Result<Rc<FuncDef>, AssembleError> {
    if !matches!(source, Value::Table(_) | Value::Struct(_)) {
        return Err(AssembleError::new(format!(
            "expected struct or table for assembly source, got {}",
            source.type_name()
        )));
    }
    let name = opt_bytes_field(source, "name")?;
    scopes.push(AsmScope { name: name.clone(), max_slot_ref: -1, ..AsmScope::default() });
    let result = assemble_body(scopes, source, name);
    scopes.pop();
    result
}

fn assemble_body(
    scopes: &mut Vec<AsmScope>,
    source: &Value,
    name: Option<Rc<[u8]>>,
) -> Result<Rc<FuncDef>, AssembleError> {
    let mut def = FuncDef { name, ..FuncDef::default() };

    let vararg = source.get_keyword("vararg").is_some_and(|v| v.truthy());
    let structarg = source.get_keyword("structarg").is_some_and(|v| v.truthy());
    def.flags.set(FuncFlags::VARARG, vararg);
    def.flags.set(FuncFlags::STRUCTARG, structarg);
    def.flags.set(FuncFlags::HASNAME, def.name.is_some());

    def.arity = opt_u32_field(source, "arity")?.unwrap_or(0);
    def.min_arity = opt_u32_field(source, "min-arity")?.unwrap_or(def.arity);
    let default_max = if vararg { i32::MAX as u32 } else { def.arity };
    def.max_arity = opt_u32_field(source, "max-arity")?.unwrap_or(default_max);

    def.source = opt_bytes_field(source, "source")?;
    def.flags.set(FuncFlags::HASSOURCE, def.source.is_some());

    // Slot names. Each element names one slot index, either directly or as
    // a group of aliases.
    if let Some(slots) = source.get_keyword("slots") {
        let items = seq_items(&slots)
            .ok_or_else(|| AssembleError::new("slots must be an array or tuple"))?;
        for (index, item) in items.iter().enumerate() {
            let index = u32::try_from(index).map_err(|_| AssembleError::new("too many slots"))?;
            match item {
                Value::Symbol(sym) => {
                    bind_slot(scopes, sym, index);
                }
                other => {
                    let group = seq_items(other).ok_or_else(|| {
                        AssembleError::new("slot name must be a symbol or sequence of symbols")
                    })?;
                    for sym in &group {
                        let sym = sym.as_symbol().ok_or_else(|| {
                            AssembleError::new("slot name must be a symbol")
                        })?;
                        bind_slot(scopes, sym, index);
                    }
                }
            }
        }
    }

    // Pre-seeded environment entries, as the disassembler emits them.
    if let Some(envs) = source.get_keyword("environments") {
        let items = seq_items(&envs)
            .ok_or_else(|| AssembleError::new("environments must be an array or tuple"))?;
        for item in &items {
            let entry = item
                .as_int_exact()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| AssembleError::new("environment entry must be an integer"))?;
            scope_mut(scopes).environments.push(entry);
        }
    }

    // Constants. The legacy named form `(sym value)` binds `sym` to the
    // constant's index for use in `SC` operands.
    if let Some(constants) = source.get_keyword("constants") {
        let items = seq_items(&constants)
            .ok_or_else(|| AssembleError::new("constants must be an array or tuple"))?;
        for item in items {
            let index = u32::try_from(def.constants.len())
                .map_err(|_| AssembleError::new("too many constants"))?;
            if let Value::Tuple(t) = &item
                && t.items.len() == 2
                && let Some(sym) = t.items[0].as_symbol()
            {
                scope_mut(scopes).constant_names.insert(sym.to_vec(), index);
                def.constants.push(t.items[1].clone());
            } else {
                def.constants.push(item);
            }
        }
    }

    // Nested defs assemble recursively; a child failure propagates its own
    // message to this caller.
    let closures = source.get_keyword("closures").or_else(|| source.get_keyword("defs"));
    if let Some(closures) = closures {
        let items = seq_items(&closures)
            .ok_or_else(|| AssembleError::new("closures must be an array or tuple"))?;
        for item in items {
            let sub = assemble_def(scopes, &item)?;
            let index = u32::try_from(def.defs.len())
                .map_err(|_| AssembleError::new("too many nested funcdefs"))?;
            if let Some(sub_name) = &sub.name {
                scope_mut(scopes).def_names.insert(sub_name.to_vec(), index);
            }
            def.defs.push(sub);
        }
    }

    let bytecode = source
        .get_keyword("bytecode")
        .ok_or_else(|| AssembleError::new("missing bytecode key"))?;
    let elements = seq_items(&bytecode)
        .ok_or_else(|| AssembleError::new("bytecode must be an array or tuple"))?;

    // First pass: a keyword labels the next instruction index.
    let mut count: u32 = 0;
    for element in &elements {
        match element {
            Value::Keyword(kw) => {
                scope_mut(scopes).labels.insert(kw.to_vec(), count);
            }
            Value::Tuple(_) | Value::Array(_) => count += 1,
            other => {
                return Err(AssembleError::new(format!(
                    "expected label or instruction in bytecode, got {}",
                    other.type_name()
                )));
            }
        }
    }

    // Second pass: emit instruction words.
    for element in &elements {
        if matches!(element, Value::Keyword(_)) {
            continue;
        }
        let index = def.bytecode.len();
        let word = emit_instruction(scopes, element, index)?;
        def.bytecode.push(word);
    }

    if let Some(sourcemap) = source.get_keyword("sourcemap") {
        let items = seq_items(&sourcemap)
            .ok_or_else(|| AssembleError::new("sourcemap must be an array or tuple"))?;
        for item in &items {
            let pair = seq_items(item).filter(|p| p.len() == 2).ok_or_else(|| {
                AssembleError::new("sourcemap entry must be a (start end) pair")
            })?;
            let start = int_field(&pair[0], "sourcemap start")?;
            let end = int_field(&pair[1], "sourcemap end")?;
            def.sourcemap.push(SourceMapping { start, end });
        }
    }
    def.flags.set(FuncFlags::HASSOURCEMAP, !def.sourcemap.is_empty());

    if let Some(symbolmap) = source.get_keyword("symbolmap") {
        let items = seq_items(&symbolmap)
            .ok_or_else(|| AssembleError::new("symbolmap must be an array or tuple"))?;
        for item in &items {
            let entry = seq_items(item).filter(|e| e.len() == 4).ok_or_else(|| {
                AssembleError::new("symbolmap entry must be (birth death slot symbol)")
            })?;
            let birth_pc = pc_field(&entry[0])?;
            let death_pc = pc_field(&entry[1])?;
            let slot = pc_field(&entry[2])?;
            let symbol = entry[3]
                .as_symbol()
                .ok_or_else(|| AssembleError::new("symbolmap entry must end with a symbol"))?;
            def.symbolmap.push(SymbolSlot { birth_pc, death_pc, slot, symbol: Rc::from(symbol) });
        }
    }
    def.flags.set(FuncFlags::HASSYMBOLMAP, !def.symbolmap.is_empty());

    let scope = scopes.last().expect("assembly scope present");
    def.environments = scope.environments.clone();
    def.flags.set(FuncFlags::HASENVS, !def.environments.is_empty());
    def.flags.set(FuncFlags::HASDEFS, !def.defs.is_empty());

    // Register count: whatever the description claims, but never less than
    // the arguments or the highest slot the bytecode touches.
    let explicit = opt_u32_field(source, "slotcount")?.unwrap_or(0);
    let max_ref = u32::try_from(scope.max_slot_ref + 1).unwrap_or(0);
    def.slotcount = explicit
        .max(def.arity.saturating_add(u32::from(def.flags.contains(FuncFlags::VARARG))))
        .max(max_ref);

    let def = Rc::new(def);
    super::verify(&def).map_err(|e| AssembleError::new(format!("invalid bytecode: {e}")))?;
    Ok(def)
}

fn emit_instruction(
    scopes: &mut Vec<AsmScope>,
    element: &Value,
    index: usize,
) -> Result<u32, AssembleError> {
    let items = seq_items(element).expect("instruction is a sequence");
    let Some(mnemonic) = items.first().and_then(Value::as_symbol) else {
        return Err(AssembleError::at("expected instruction mnemonic symbol", index));
    };
    let mnemonic_str = String::from_utf8_lossy(mnemonic);
    let op = Opcode::from_str(&mnemonic_str)
        .map_err(|_| AssembleError::at(format!("unknown mnemonic {mnemonic_str}"), index))?;
    let specs = op.shape().operands();
    if items.len() - 1 != specs.len() {
        return Err(AssembleError::at(
            format!("{mnemonic_str} expects {} arguments, got {}", specs.len(), items.len() - 1),
            index,
        ));
    }

    let mut word = op as u32;
    if let Value::Tuple(t) = element
        && t.flag & Tuple::BRACKET != 0
    {
        word |= BREAKPOINT_BIT;
    }
    let mut offset = 8;
    for (spec, arg) in specs.iter().zip(&items[1..]) {
        let raw = parse_operand(scopes, *spec, arg, index)?;
        let field = check_range(raw, *spec, index)?;
        word |= field << offset;
        offset += spec.bits;
    }
    Ok(word)
}

fn parse_operand(
    scopes: &mut Vec<AsmScope>,
    spec: OperandSpec,
    arg: &Value,
    index: usize,
) -> Result<i64, AssembleError> {
    match spec.kind {
        OperandKind::Slot => {
            let raw = match arg {
                Value::Symbol(sym) => {
                    i64::from(*scopes.last().expect("scope").slots.get(sym.as_ref()).ok_or_else(
                        || {
                            AssembleError::at(
                                format!("unknown slot {}", String::from_utf8_lossy(sym)),
                                index,
                            )
                        },
                    )?)
                }
                other => int_operand(other, "slot", index)?,
            };
            let scope = scope_mut(scopes);
            scope.max_slot_ref = scope.max_slot_ref.max(raw);
            Ok(raw)
        }
        OperandKind::Label => match arg {
            Value::Keyword(kw) => {
                let target =
                    scopes.last().expect("scope").labels.get(kw.as_ref()).ok_or_else(|| {
                        AssembleError::at(
                            format!("unknown label :{}", String::from_utf8_lossy(kw)),
                            index,
                        )
                    })?;
                Ok(i64::from(*target) - index as i64)
            }
            // An integer label is an absolute instruction index, as the
            // disassembler renders it.
            other => Ok(int_operand(other, "label", index)? - index as i64),
        },
        OperandKind::Constant => match arg {
            Value::Symbol(sym) => {
                let scope = scopes.last().expect("scope");
                scope.constant_names.get(sym.as_ref()).map(|c| i64::from(*c)).ok_or_else(|| {
                    AssembleError::at(
                        format!("unknown constant {}", String::from_utf8_lossy(sym)),
                        index,
                    )
                })
            }
            other => int_operand(other, "constant", index),
        },
        OperandKind::FuncDef => match arg {
            Value::Symbol(sym) => {
                let scope = scopes.last().expect("scope");
                scope.def_names.get(sym.as_ref()).map(|d| i64::from(*d)).ok_or_else(|| {
                    AssembleError::at(
                        format!("unknown funcdef {}", String::from_utf8_lossy(sym)),
                        index,
                    )
                })
            }
            other => int_operand(other, "funcdef", index),
        },
        OperandKind::Environment => match arg {
            Value::Symbol(sym) => {
                let sym = sym.clone();
                let top = scopes.len() - 1;
                resolve_env(scopes, top, &sym)
                    .map(i64::from)
                    .map_err(|message| AssembleError::at(message, index))
            }
            other => int_operand(other, "environment", index),
        },
        OperandKind::Type => match arg {
            Value::Keyword(kw) => type_operand(kw, index),
            Value::Tuple(_) | Value::Array(_) => {
                let mut mask: i64 = 0;
                for part in &seq_items(arg).expect("sequence") {
                    let kw = part.as_keyword().ok_or_else(|| {
                        AssembleError::at("expected type keyword", index)
                    })?;
                    mask |= type_operand(kw, index)?;
                }
                Ok(mask)
            }
            other => int_operand(other, "type", index),
        },
        OperandKind::Integer | OperandKind::Unsigned => int_operand(arg, "integer", index),
    }
}

fn type_operand(kw: &[u8], index: usize) -> Result<i64, AssembleError> {
    type_mask_from_name(kw)
        .map(i64::from)
        .ok_or_else(|| {
            AssembleError::at(format!("unknown type :{}", String::from_utf8_lossy(kw)), index)
        })
}

fn int_operand(arg: &Value, what: &str, index: usize) -> Result<i64, AssembleError> {
    arg.as_int_exact().ok_or_else(|| {
        AssembleError::at(format!("expected integer {what} operand, got {arg}"), index)
    })
}

/// Range check per operand field: for an `n`-bit field, signed fields span
/// `[-2^(n-1), 2^(n-1) - 1]`, unsigned fields `[0, 2^n - 1]`.
fn check_range(raw: i64, spec: OperandSpec, index: usize) -> Result<u32, AssembleError> {
    let (min, max) = if spec.signed {
        (-(1i64 << (spec.bits - 1)), (1i64 << (spec.bits - 1)) - 1)
    } else {
        (0, (1i64 << spec.bits) - 1)
    };
    if raw > max {
        return Err(AssembleError::at(format!("operand {raw} too large, max is {max}"), index));
    }
    if raw < min {
        return Err(AssembleError::at(format!("operand {raw} too small, min is {min}"), index));
    }
    let mask = ((1u64 << spec.bits) - 1) as u32;
    Ok((raw as u32) & mask)
}

/// Resolves an environment symbol in scope `idx`, consulting enclosing
/// scopes on a miss and allocating environment entries along the chain.
/// Returns `-1` when the name is the scope's own name.
fn resolve_env(scopes: &mut [AsmScope], idx: usize, name: &[u8]) -> Result<i32, String> {
    if let Some(found) = scopes[idx].env_names.get(name) {
        return Ok(*found as i32);
    }
    if scopes[idx].name.as_deref() == Some(name) {
        return Ok(-1);
    }
    if idx == 0 {
        return Err(format!("unknown environment {}", String::from_utf8_lossy(name)));
    }
    let parent_entry = resolve_env(scopes, idx - 1, name)?;
    let new_index = u32::try_from(scopes[idx].environments.len())
        .map_err(|_| "too many environments".to_owned())?;
    scopes[idx].environments.push(parent_entry);
    scopes[idx].env_names.insert(name.to_vec(), new_index);
    Ok(new_index as i32)
}

fn bind_slot(scopes: &mut [AsmScope], sym: &[u8], index: u32) {
    scopes.last_mut().expect("scope").slots.insert(sym.to_vec(), index);
}

fn scope_mut(scopes: &mut [AsmScope]) -> &mut AsmScope {
    scopes.last_mut().expect("assembly scope present")
}

/// The elements of a tuple or array, cloned (element clones are `Rc`
/// bumps).
fn seq_items(v: &Value) -> Option<Vec<Value>> {
    match v {
        Value::Tuple(t) => Some(t.items.clone()),
        Value::Array(a) => Some(a.borrow().clone()),
        _ => None,
    }
}

// Header fields stay within i32 range so they survive the marshaller's
// signed integer encoding.
fn opt_u32_field(source: &Value, key: &str) -> Result<Option<u32>, AssembleError> {
    match source.get_keyword(key) {
        None => Ok(None),
        Some(v) => v
            .as_int_exact()
            .filter(|&n| n <= i64::from(i32::MAX))
            .and_then(|n| u32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| AssembleError::new(format!("{key} must be a non-negative integer"))),
    }
}

fn opt_bytes_field(source: &Value, key: &str) -> Result<Option<Rc<[u8]>>, AssembleError> {
    match source.get_keyword(key) {
        None => Ok(None),
        Some(Value::Str(b) | Value::Symbol(b) | Value::Keyword(b)) => Ok(Some(b)),
        Some(other) => Err(AssembleError::new(format!(
            "{key} must be a string or symbol, got {}",
            other.type_name()
        ))),
    }
}

fn int_field(v: &Value, what: &str) -> Result<i32, AssembleError> {
    v.as_int_exact()
        .and_then(|n| i32::try_from(n).ok())
        .ok_or_else(|| AssembleError::new(format!("{what} must be an integer")))
}

fn pc_field(v: &Value) -> Result<u32, AssembleError> {
    v.as_int_exact()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| AssembleError::new("symbolmap entry field must be a non-negative integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn kw(s: &str) -> Value {
        Value::keyword(s)
    }

    fn sym(s: &str) -> Value {
        Value::symbol(s)
    }

    fn num(n: f64) -> Value {
        Value::number(n)
    }

    fn instr(parts: Vec<Value>) -> Value {
        Value::tuple(parts)
    }

    #[test]
    fn test_identity_function() {
        let desc = Value::table_from_pairs(vec![
            (kw("arity"), num(1.0)),
            (kw("slots"), Value::array(vec![sym("x")])),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("ret"), sym("x")])])),
        ]);
        let def = assemble(&desc).unwrap();
        assert_eq!(def.arity, 1);
        assert_eq!(def.slotcount, 1);
        assert_eq!(def.bytecode, vec![Opcode::Return as u32]);
    }

    #[test]
    fn test_backward_jump_encodes_negative_offset() {
        let desc = Value::table_from_pairs(vec![
            (kw("arity"), num(0.0)),
            (
                kw("bytecode"),
                Value::array(vec![
                    kw("loop"),
                    instr(vec![sym("movn"), num(1.0), num(0.0)]),
                    instr(vec![sym("jmp"), kw("loop")]),
                ]),
            ),
        ]);
        let def = assemble(&desc).unwrap();
        assert_eq!(def.bytecode.len(), 2);
        // 24-bit signed -1 payload above the opcode byte.
        assert_eq!(def.bytecode[1] >> 8, 0xFF_FFFF);
        assert_eq!(def.bytecode[1] & 0x7F, Opcode::Jump as u32);
    }

    #[test]
    fn test_operand_overflow() {
        let desc = Value::table_from_pairs(vec![
            (kw("arity"), num(0.0)),
            (
                kw("bytecode"),
                Value::array(vec![instr(vec![sym("ldi"), num(0.0), num(9_999_999_999.0)])]),
            ),
        ]);
        let err = assemble(&desc).unwrap_err();
        assert_eq!(err.instruction(), Some(0));
        let text = err.to_string();
        assert!(text.contains("too large"), "message was: {text}");
        assert!(text.contains("instruction 0"), "message was: {text}");
    }

    #[test]
    fn test_unknown_mnemonic() {
        let desc = Value::table_from_pairs(vec![(
            kw("bytecode"),
            Value::array(vec![instr(vec![sym("zap"), num(0.0)])]),
        )]);
        let err = assemble(&desc).unwrap_err();
        assert!(err.to_string().contains("unknown mnemonic"));
    }

    #[test]
    fn test_missing_bytecode() {
        let desc = Value::table_from_pairs(vec![(kw("arity"), num(0.0))]);
        let err = assemble(&desc).unwrap_err();
        assert!(err.to_string().contains("missing bytecode"));
    }

    #[test]
    fn test_named_constant() {
        let desc = Value::table_from_pairs(vec![
            (
                kw("constants"),
                Value::array(vec![Value::tuple(vec![sym("greeting"), Value::string("hi")])]),
            ),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("ldc"), num(0.0), sym("greeting")]),
                    instr(vec![sym("ret"), num(0.0)]),
                ]),
            ),
        ]);
        let def = assemble(&desc).unwrap();
        assert_eq!(def.constants, vec![Value::string("hi")]);
        assert_eq!(def.bytecode[0] >> 16, 0);
    }

    #[test]
    fn test_breakpoint_flag_from_bracket_tuple() {
        let desc = Value::table_from_pairs(vec![(
            kw("bytecode"),
            Value::array(vec![Value::bracket_tuple(vec![sym("retn")])]),
        )]);
        let def = assemble(&desc).unwrap();
        assert_eq!(def.bytecode[0] & BREAKPOINT_BIT, BREAKPOINT_BIT);
    }

    #[test]
    fn test_upvalue_resolution_allocates_parent_chain() {
        // outer (named f) defines slot x; inner closure loads x through an
        // environment reference to f.
        let inner = Value::table_from_pairs(vec![
            (kw("name"), sym("inner")),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("ldu"), num(0.0), sym("f"), num(0.0)]),
                    instr(vec![sym("ret"), num(0.0)]),
                ]),
            ),
        ]);
        let desc = Value::table_from_pairs(vec![
            (kw("name"), sym("f")),
            (kw("arity"), num(1.0)),
            (kw("slots"), Value::array(vec![sym("x")])),
            (kw("closures"), Value::array(vec![inner])),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("clo"), num(1.0), sym("inner")]),
                    instr(vec![sym("ret"), num(1.0)]),
                ]),
            ),
        ]);
        let def = assemble(&desc).unwrap();
        assert_eq!(def.defs.len(), 1);
        // The inner def allocated one environment entry pointing at the
        // immediate parent's own environment.
        assert_eq!(def.defs[0].environments, vec![-1]);
        assert!(def.environments.is_empty());
    }

    #[test]
    fn test_unknown_environment() {
        let desc = Value::table_from_pairs(vec![(
            kw("bytecode"),
            Value::array(vec![
                instr(vec![sym("ldu"), num(0.0), sym("nowhere"), num(0.0)]),
                instr(vec![sym("retn")]),
            ]),
        )]);
        let err = assemble(&desc).unwrap_err();
        assert!(err.to_string().contains("unknown environment"));
    }

    #[test]
    fn test_child_error_propagates_to_parent() {
        let bad_inner = Value::table_from_pairs(vec![(
            kw("bytecode"),
            Value::array(vec![instr(vec![sym("zap")])]),
        )]);
        let desc = Value::table_from_pairs(vec![
            (kw("closures"), Value::array(vec![bad_inner])),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("retn")])])),
        ]);
        let err = assemble(&desc).unwrap_err();
        assert!(err.to_string().contains("unknown mnemonic"));
    }

    #[test]
    fn test_slot_alias_group() {
        let desc = Value::table_from_pairs(vec![
            (kw("arity"), num(1.0)),
            (kw("slots"), Value::array(vec![Value::tuple(vec![sym("x"), sym("alias")])])),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("ret"), sym("alias")])])),
        ]);
        let def = assemble(&desc).unwrap();
        assert_eq!(def.bytecode[0] >> 8, 0);
    }

    #[test]
    fn test_vararg_slotcount_floor() {
        let desc = Value::table_from_pairs(vec![
            (kw("arity"), num(2.0)),
            (kw("vararg"), Value::boolean(true)),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("retn")])])),
        ]);
        let def = assemble(&desc).unwrap();
        assert!(def.flags.contains(FuncFlags::VARARG));
        assert_eq!(def.slotcount, 3);
        assert_eq!(def.max_arity, i32::MAX as u32);
    }
}
