//! Disassembler: decodes a `FuncDef` back into the description language
//! the assembler consumes.
//!
//! Slots, constants, and environments render as integers; jump operands
//! render as absolute instruction indices; the breakpoint bit renders as
//! the instruction tuple's bracket flag. Reassembling the output yields a
//! bytecode-equal def.

use crate::{
    funcdef::{FuncDef, FuncFlags},
    value::Value,
};

use super::op::{BREAKPOINT_BIT, Opcode, OperandKind, decode_operands};

/// Decodes `def` into a table description with the assembler's recognized
/// keys. Optional keys appear only when the underlying data is present.
#[must_use]
pub fn disassemble(def: &FuncDef) -> Value {
    let mut pairs: Vec<(Value, Value)> = vec![
        (Value::keyword("arity"), Value::number(f64::from(def.arity))),
        (Value::keyword("min-arity"), Value::number(f64::from(def.min_arity))),
        (Value::keyword("max-arity"), Value::number(f64::from(def.max_arity))),
        (Value::keyword("slotcount"), Value::number(f64::from(def.slotcount))),
    ];
    if def.flags.contains(FuncFlags::VARARG) {
        pairs.push((Value::keyword("vararg"), Value::boolean(true)));
    }
    if def.flags.contains(FuncFlags::STRUCTARG) {
        pairs.push((Value::keyword("structarg"), Value::boolean(true)));
    }
    if let Some(name) = &def.name {
        pairs.push((Value::keyword("name"), Value::Symbol(name.clone())));
    }
    if let Some(source) = &def.source {
        pairs.push((Value::keyword("source"), Value::Str(source.clone())));
    }
    if !def.constants.is_empty() {
        pairs.push((Value::keyword("constants"), Value::array(def.constants.clone())));
    }

    let mut instructions = Vec::with_capacity(def.bytecode.len());
    for (pc, &word) in def.bytecode.iter().enumerate() {
        instructions.push(decode_instruction(word, pc));
    }
    pairs.push((Value::keyword("bytecode"), Value::array(instructions)));

    if !def.defs.is_empty() {
        let subs = def.defs.iter().map(|sub| disassemble(sub)).collect();
        pairs.push((Value::keyword("defs"), Value::array(subs)));
    }
    if !def.environments.is_empty() {
        let envs = def.environments.iter().map(|&e| Value::number(f64::from(e))).collect();
        pairs.push((Value::keyword("environments"), Value::array(envs)));
    }
    if !def.sourcemap.is_empty() {
        let entries = def
            .sourcemap
            .iter()
            .map(|m| {
                Value::tuple(vec![
                    Value::number(f64::from(m.start)),
                    Value::number(f64::from(m.end)),
                ])
            })
            .collect();
        pairs.push((Value::keyword("sourcemap"), Value::array(entries)));
    }
    if !def.symbolmap.is_empty() {
        let entries = def
            .symbolmap
            .iter()
            .map(|s| {
                Value::tuple(vec![
                    Value::number(f64::from(s.birth_pc)),
                    Value::number(f64::from(s.death_pc)),
                    Value::number(f64::from(s.slot)),
                    Value::Symbol(s.symbol.clone()),
                ])
            })
            .collect();
        pairs.push((Value::keyword("symbolmap"), Value::array(entries)));
    }
    Value::table_from_pairs(pairs)
}

/// Decodes one instruction word into a mnemonic tuple. An unknown opcode
/// never comes from a verified def, but hand-built ones can carry one;
/// surface it as a raw-word tuple rather than panicking.
fn decode_instruction(word: u32, pc: usize) -> Value {
    let Some(op) = Opcode::from_word(word) else {
        return Value::tuple(vec![Value::symbol("unknown"), Value::number(f64::from(word))]);
    };
    let shape = op.shape();
    let mut items = Vec::with_capacity(1 + shape.operands().len());
    items.push(Value::symbol(op.mnemonic()));
    for (spec, raw) in shape.operands().iter().zip(decode_operands(word, shape)) {
        let rendered = match spec.kind {
            // Jumps render as absolute instruction indices; the assembler
            // re-encodes them relative to the instruction that uses them.
            OperandKind::Label => pc as i64 + raw,
            _ => raw,
        };
        items.push(Value::number(rendered as f64));
    }
    if word & BREAKPOINT_BIT != 0 {
        Value::bracket_tuple(items)
    } else {
        Value::tuple(items)
    }
}
