//! Reference executor for assembled functions.
//!
//! Interprets the common opcode subset so tests can invoke assembled
//! functions and the PEG engine can host callbacks written as assembled
//! functions. This is deliberately not the surrounding runtime: no
//! scheduler, no signals, no collector. Fiber opcodes report unsupported.
//!
//! Upvalue capture materializes one detached environment per frame, shared
//! by every closure the frame creates; slot writes after materialization
//! do not flow back into it.

use std::{cell::RefCell, fmt, rc::Rc};

use crate::{
    asm::{Opcode, decode_operands},
    funcdef::FuncFlags,
    limits::DEFAULT_MAX_RECURSION_DEPTH,
    value::{Closure, FuncEnv, Value},
};

/// Error produced while running a function on the reference executor.
#[derive(Debug, Clone)]
pub enum ExecError {
    /// The callee is not a function or cfunction.
    NotCallable(&'static str),
    /// Argument count outside the callee's declared arity.
    ArityMismatch { min: u32, max: u32, got: usize },
    /// An operand had the wrong runtime type.
    TypeMismatch { expected: &'static str, got: &'static str },
    /// A `tchck` instruction failed.
    TypeCheckFailed { got: &'static str },
    /// Opcode outside the subset this executor implements.
    UnsupportedOpcode(Opcode),
    /// Instruction word with an unassigned opcode.
    UnknownOpcode(u32),
    /// Closure or upvalue access without a matching environment.
    MissingEnvironment,
    /// Aggregate constructor invoked with an odd number of pending args.
    OddPairs,
    /// Call depth exceeded the fixed budget.
    RecursedTooDeeply,
    /// An `err` instruction ran, or a cfunction reported an error value.
    Thrown(Value),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotCallable(ty) => write!(f, "cannot call value of type {ty}"),
            Self::ArityMismatch { min, max, got } => {
                write!(f, "expected between {min} and {max} arguments, got {got}")
            }
            Self::TypeMismatch { expected, got } => {
                write!(f, "expected {expected}, got {got}")
            }
            Self::TypeCheckFailed { got } => write!(f, "type check failed for {got}"),
            Self::UnsupportedOpcode(op) => write!(f, "unsupported opcode {}", op.mnemonic()),
            Self::UnknownOpcode(word) => write!(f, "unknown opcode in word {word:#x}"),
            Self::MissingEnvironment => f.write_str("missing upvalue environment"),
            Self::OddPairs => f.write_str("expected an even number of arguments"),
            Self::RecursedTooDeeply => f.write_str("recursed too deeply"),
            Self::Thrown(value) => write!(f, "error: {value}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Invokes a callable value with `args`.
pub fn call(callee: &Value, args: &[Value]) -> Result<Value, ExecError> {
    call_depth(callee, args, 0)
}

fn call_depth(callee: &Value, args: &[Value], depth: usize) -> Result<Value, ExecError> {
    if depth > DEFAULT_MAX_RECURSION_DEPTH {
        return Err(ExecError::RecursedTooDeeply);
    }
    match callee {
        Value::CFunction(f) => f(args).map_err(ExecError::Thrown),
        Value::Function(closure) => run_closure(closure, args, depth),
        other => Err(ExecError::NotCallable(other.type_name())),
    }
}

struct Frame {
    slots: Vec<Value>,
    /// Pending call arguments accumulated by the push family.
    pending: Vec<Value>,
    /// This frame's own environment, created at the first closure that
    /// captures it.
    env: Option<Rc<RefCell<FuncEnv>>>,
}

impl Frame {
    fn slot(&self, index: i64) -> Value {
        self.slots[index as usize].clone()
    }

    fn set_slot(&mut self, index: i64, value: Value) {
        self.slots[index as usize] = value;
    }

    fn number(&self, index: i64) -> Result<f64, ExecError> {
        let v = &self.slots[index as usize];
        v.as_number().ok_or(ExecError::TypeMismatch { expected: "number", got: v.type_name() })
    }

    fn integer(&self, index: i64) -> Result<i64, ExecError> {
        let v = &self.slots[index as usize];
        v.as_int_exact()
            .ok_or(ExecError::TypeMismatch { expected: "integer", got: v.type_name() })
    }
}

fn run_closure(closure: &Rc<Closure>, args: &[Value], depth: usize) -> Result<Value, ExecError> {
    let def = &closure.def;
    let vararg = def.flags.contains(FuncFlags::VARARG);
    let too_few = args.len() < def.min_arity as usize;
    let too_many = !vararg && args.len() > def.max_arity as usize;
    if too_few || too_many {
        return Err(ExecError::ArityMismatch {
            min: def.min_arity,
            max: def.max_arity,
            got: args.len(),
        });
    }

    let mut frame = Frame {
        slots: vec![Value::Nil; def.slotcount as usize],
        pending: Vec::new(),
        env: None,
    };
    let fixed = (def.arity as usize).min(args.len());
    frame.slots[..fixed].clone_from_slice(&args[..fixed]);
    if vararg {
        let rest = args.get(def.arity as usize..).unwrap_or(&[]).to_vec();
        frame.slots[def.arity as usize] = Value::tuple(rest);
    }

    let mut pc: usize = 0;
    loop {
        let word = def.bytecode[pc];
        let Some(op) = Opcode::from_word(word) else {
            return Err(ExecError::UnknownOpcode(word));
        };
        let ops = decode_operands(word, op.shape());
        match op {
            Opcode::Noop => {}
            Opcode::Error => return Err(ExecError::Thrown(frame.slot(ops[0]))),
            Opcode::TypeCheck => {
                let v = frame.slot(ops[0]);
                if i64::from(v.type_mask()) & ops[1] == 0 {
                    return Err(ExecError::TypeCheckFailed { got: v.type_name() });
                }
            }
            Opcode::Return => return Ok(frame.slot(ops[0])),
            Opcode::ReturnNil => return Ok(Value::Nil),

            Opcode::Add => arith(&mut frame, &ops, |a, b| a + b)?,
            Opcode::Subtract => arith(&mut frame, &ops, |a, b| a - b)?,
            Opcode::Multiply => arith(&mut frame, &ops, |a, b| a * b)?,
            Opcode::Divide => arith(&mut frame, &ops, |a, b| a / b)?,
            Opcode::Modulo => arith(&mut frame, &ops, |a, b| ((a % b) + b) % b)?,
            Opcode::Remainder => arith(&mut frame, &ops, |a, b| a % b)?,
            Opcode::AddImmediate => arith_imm(&mut frame, &ops, |a, b| a + b)?,
            Opcode::SubtractImmediate => arith_imm(&mut frame, &ops, |a, b| a - b)?,
            Opcode::MultiplyImmediate => arith_imm(&mut frame, &ops, |a, b| a * b)?,
            Opcode::DivideImmediate => arith_imm(&mut frame, &ops, |a, b| a / b)?,

            Opcode::BitAnd => bitwise(&mut frame, &ops, |a, b| a & b)?,
            Opcode::BitOr => bitwise(&mut frame, &ops, |a, b| a | b)?,
            Opcode::BitXor => bitwise(&mut frame, &ops, |a, b| a ^ b)?,
            Opcode::BitNot => {
                let v = frame.integer(ops[1])?;
                frame.set_slot(ops[0], Value::number(!v as f64));
            }
            Opcode::ShiftLeft => bitwise(&mut frame, &ops, |a, b| a << (b & 63))?,
            Opcode::ShiftRight => bitwise(&mut frame, &ops, |a, b| a >> (b & 63))?,
            Opcode::ShiftRightUnsigned => {
                bitwise(&mut frame, &ops, |a, b| ((a as u64) >> (b & 63)) as i64)?;
            }
            Opcode::ShiftLeftImmediate => {
                let v = frame.integer(ops[1])?;
                frame.set_slot(ops[0], Value::number((v << (ops[2] & 63)) as f64));
            }
            Opcode::ShiftRightImmediate => {
                let v = frame.integer(ops[1])?;
                frame.set_slot(ops[0], Value::number((v >> (ops[2] & 63)) as f64));
            }
            Opcode::ShiftRightUnsignedImmediate => {
                let v = frame.integer(ops[1])?;
                frame.set_slot(ops[0], Value::number(((v as u64) >> (ops[2] & 63)) as f64));
            }

            Opcode::MoveNear | Opcode::MoveFar => {
                let v = frame.slot(ops[1]);
                frame.set_slot(ops[0], v);
            }

            Opcode::Jump => {
                pc = jump_target(pc, ops[0]);
                continue;
            }
            Opcode::JumpIf => {
                if frame.slot(ops[0]).truthy() {
                    pc = jump_target(pc, ops[1]);
                    continue;
                }
            }
            Opcode::JumpIfNot => {
                if !frame.slot(ops[0]).truthy() {
                    pc = jump_target(pc, ops[1]);
                    continue;
                }
            }
            Opcode::JumpIfNil => {
                if matches!(frame.slot(ops[0]), Value::Nil) {
                    pc = jump_target(pc, ops[1]);
                    continue;
                }
            }
            Opcode::JumpIfNotNil => {
                if !matches!(frame.slot(ops[0]), Value::Nil) {
                    pc = jump_target(pc, ops[1]);
                    continue;
                }
            }

            Opcode::Equals => {
                let eq = frame.slot(ops[1]) == frame.slot(ops[2]);
                frame.set_slot(ops[0], Value::boolean(eq));
            }
            Opcode::NotEquals => {
                let eq = frame.slot(ops[1]) == frame.slot(ops[2]);
                frame.set_slot(ops[0], Value::boolean(!eq));
            }
            Opcode::EqualsImmediate => {
                let eq = frame.slot(ops[1]) == Value::number(ops[2] as f64);
                frame.set_slot(ops[0], Value::boolean(eq));
            }
            Opcode::NotEqualsImmediate => {
                let eq = frame.slot(ops[1]) == Value::number(ops[2] as f64);
                frame.set_slot(ops[0], Value::boolean(!eq));
            }
            Opcode::GreaterThan => compare(&mut frame, &ops, |a, b| a > b)?,
            Opcode::GreaterThanEqual => compare(&mut frame, &ops, |a, b| a >= b)?,
            Opcode::LessThan => compare(&mut frame, &ops, |a, b| a < b)?,
            Opcode::LessThanEqual => compare(&mut frame, &ops, |a, b| a <= b)?,
            Opcode::GreaterThanImmediate => {
                let v = frame.number(ops[1])?;
                frame.set_slot(ops[0], Value::boolean(v > ops[2] as f64));
            }
            Opcode::LessThanImmediate => {
                let v = frame.number(ops[1])?;
                frame.set_slot(ops[0], Value::boolean(v < ops[2] as f64));
            }
            Opcode::Compare => {
                let ord = frame.slot(ops[1]).total_cmp(&frame.slot(ops[2]));
                frame.set_slot(ops[0], Value::number(ord as i8 as f64));
            }

            Opcode::LoadNil => frame.set_slot(ops[0], Value::Nil),
            Opcode::LoadTrue => frame.set_slot(ops[0], Value::boolean(true)),
            Opcode::LoadFalse => frame.set_slot(ops[0], Value::boolean(false)),
            Opcode::LoadInteger | Opcode::LoadIntegerUnsigned => {
                frame.set_slot(ops[0], Value::number(ops[1] as f64));
            }
            Opcode::LoadConstant => {
                frame.set_slot(ops[0], def.constants[ops[1] as usize].clone());
            }
            Opcode::LoadSelf => frame.set_slot(ops[0], Value::Function(closure.clone())),

            Opcode::LoadUpvalue => {
                let env = captured_env(closure, ops[1])?;
                let value = env
                    .borrow()
                    .values
                    .get(ops[2] as usize)
                    .cloned()
                    .ok_or(ExecError::MissingEnvironment)?;
                frame.set_slot(ops[0], value);
            }
            Opcode::SetUpvalue => {
                let env = captured_env(closure, ops[1])?;
                let value = frame.slot(ops[0]);
                let mut env = env.borrow_mut();
                let slot = env.values.get_mut(ops[2] as usize).ok_or(ExecError::MissingEnvironment)?;
                *slot = value;
            }
            Opcode::Closure => {
                let sub = def.defs[ops[1] as usize].clone();
                let mut envs = Vec::with_capacity(sub.environments.len());
                for &entry in &sub.environments {
                    if entry == -1 {
                        let env = frame.env.get_or_insert_with(|| {
                            Rc::new(RefCell::new(FuncEnv { values: frame.slots.clone() }))
                        });
                        envs.push(env.clone());
                    } else {
                        envs.push(captured_env(closure, i64::from(entry))?);
                    }
                }
                let value =
                    Value::Function(Rc::new(Closure { def: sub, envs: RefCell::new(envs) }));
                frame.set_slot(ops[0], value);
            }

            Opcode::Push => {
                let v = frame.slot(ops[0]);
                frame.pending.push(v);
            }
            Opcode::Push2 => {
                let (a, b) = (frame.slot(ops[0]), frame.slot(ops[1]));
                frame.pending.extend([a, b]);
            }
            Opcode::Push3 => {
                let (a, b, c) = (frame.slot(ops[0]), frame.slot(ops[1]), frame.slot(ops[2]));
                frame.pending.extend([a, b, c]);
            }
            Opcode::PushArray => match frame.slot(ops[0]) {
                Value::Array(items) => frame.pending.extend(items.borrow().iter().cloned()),
                Value::Tuple(t) => frame.pending.extend(t.items.iter().cloned()),
                other => {
                    return Err(ExecError::TypeMismatch {
                        expected: "array or tuple",
                        got: other.type_name(),
                    });
                }
            },
            Opcode::Call => {
                let call_args = std::mem::take(&mut frame.pending);
                let result = call_depth(&frame.slot(ops[1]), &call_args, depth + 1)?;
                frame.set_slot(ops[0], result);
            }
            Opcode::TailCall => {
                let call_args = std::mem::take(&mut frame.pending);
                return call_depth(&frame.slot(ops[0]), &call_args, depth + 1);
            }

            Opcode::Resume | Opcode::Signal | Opcode::Propagate | Opcode::Cancel
            | Opcode::Next => return Err(ExecError::UnsupportedOpcode(op)),

            Opcode::In | Opcode::Get => {
                let value = lookup(&frame.slot(ops[1]), &frame.slot(ops[2]))?;
                frame.set_slot(ops[0], value);
            }
            Opcode::Put => {
                let key = frame.slot(ops[1]);
                let value = frame.slot(ops[2]);
                store(&frame.slot(ops[0]), key, value)?;
            }
            Opcode::GetIndex => {
                let value = lookup(&frame.slot(ops[1]), &Value::number(ops[2] as f64))?;
                frame.set_slot(ops[0], value);
            }
            Opcode::PutIndex => {
                let value = frame.slot(ops[1]);
                store(&frame.slot(ops[0]), Value::number(ops[2] as f64), value)?;
            }
            Opcode::Length => {
                let v = frame.slot(ops[1]);
                let len = match &v {
                    Value::Str(b) | Value::Symbol(b) | Value::Keyword(b) => b.len(),
                    Value::Buffer(b) => b.borrow().len(),
                    Value::Array(a) => a.borrow().len(),
                    Value::Tuple(t) => t.items.len(),
                    Value::Table(t) => t.borrow().len(),
                    Value::Struct(s) => s.len(),
                    other => {
                        return Err(ExecError::TypeMismatch {
                            expected: "lengthable",
                            got: other.type_name(),
                        });
                    }
                };
                frame.set_slot(ops[0], Value::number(len as f64));
            }

            Opcode::MakeArray => {
                let items = std::mem::take(&mut frame.pending);
                frame.set_slot(ops[0], Value::array(items));
            }
            Opcode::MakeTuple => {
                let items = std::mem::take(&mut frame.pending);
                frame.set_slot(ops[0], Value::tuple(items));
            }
            Opcode::MakeBracketTuple => {
                let items = std::mem::take(&mut frame.pending);
                frame.set_slot(ops[0], Value::bracket_tuple(items));
            }
            Opcode::MakeBuffer | Opcode::MakeString => {
                let mut bytes = Vec::new();
                for item in std::mem::take(&mut frame.pending) {
                    item.render_bytes(&mut bytes);
                }
                let value = if op == Opcode::MakeBuffer {
                    Value::buffer(bytes)
                } else {
                    Value::Str(bytes.into())
                };
                frame.set_slot(ops[0], value);
            }
            Opcode::MakeStruct | Opcode::MakeTable => {
                let items = std::mem::take(&mut frame.pending);
                if items.len() % 2 != 0 {
                    return Err(ExecError::OddPairs);
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                let value = if op == Opcode::MakeStruct {
                    Value::struct_from_pairs(pairs)
                } else {
                    Value::table_from_pairs(pairs)
                };
                frame.set_slot(ops[0], value);
            }
        }
        pc += 1;
    }
}

fn jump_target(pc: usize, rel: i64) -> usize {
    // The verifier proved the target is in range.
    (pc as i64 + rel) as usize
}

fn captured_env(
    closure: &Rc<Closure>,
    index: i64,
) -> Result<Rc<RefCell<FuncEnv>>, ExecError> {
    closure.envs.borrow().get(index as usize).cloned().ok_or(ExecError::MissingEnvironment)
}

fn arith(
    frame: &mut Frame,
    ops: &[i64],
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), ExecError> {
    let (a, b) = (frame.number(ops[1])?, frame.number(ops[2])?);
    frame.set_slot(ops[0], Value::number(f(a, b)));
    Ok(())
}

fn arith_imm(
    frame: &mut Frame,
    ops: &[i64],
    f: impl Fn(f64, f64) -> f64,
) -> Result<(), ExecError> {
    let a = frame.number(ops[1])?;
    frame.set_slot(ops[0], Value::number(f(a, ops[2] as f64)));
    Ok(())
}

fn bitwise(
    frame: &mut Frame,
    ops: &[i64],
    f: impl Fn(i64, i64) -> i64,
) -> Result<(), ExecError> {
    let (a, b) = (frame.integer(ops[1])?, frame.integer(ops[2])?);
    frame.set_slot(ops[0], Value::number(f(a, b) as f64));
    Ok(())
}

fn compare(
    frame: &mut Frame,
    ops: &[i64],
    f: impl Fn(f64, f64) -> bool,
) -> Result<(), ExecError> {
    let (a, b) = (frame.number(ops[1])?, frame.number(ops[2])?);
    frame.set_slot(ops[0], Value::boolean(f(a, b)));
    Ok(())
}

fn lookup(data: &Value, key: &Value) -> Result<Value, ExecError> {
    match data {
        Value::Table(_) | Value::Struct(_) => Ok(data.get_key(key).unwrap_or(Value::Nil)),
        Value::Array(items) => Ok(index_of(key)
            .and_then(|i| items.borrow().get(i).cloned())
            .unwrap_or(Value::Nil)),
        Value::Tuple(t) => {
            Ok(index_of(key).and_then(|i| t.items.get(i).cloned()).unwrap_or(Value::Nil))
        }
        Value::Str(b) | Value::Symbol(b) | Value::Keyword(b) => Ok(index_of(key)
            .and_then(|i| b.get(i).copied())
            .map_or(Value::Nil, |byte| Value::number(f64::from(byte)))),
        Value::Buffer(b) => Ok(index_of(key)
            .and_then(|i| b.borrow().get(i).copied())
            .map_or(Value::Nil, |byte| Value::number(f64::from(byte)))),
        other => {
            Err(ExecError::TypeMismatch { expected: "indexable", got: other.type_name() })
        }
    }
}

fn store(data: &Value, key: Value, value: Value) -> Result<(), ExecError> {
    match data {
        Value::Table(t) => {
            t.borrow_mut().insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let index = index_of(&key).ok_or(ExecError::TypeMismatch {
                expected: "integer index",
                got: key.type_name(),
            })?;
            let mut items = items.borrow_mut();
            if index >= items.len() {
                items.resize(index + 1, Value::Nil);
            }
            items[index] = value;
            Ok(())
        }
        Value::Buffer(b) => {
            let index = index_of(&key).ok_or(ExecError::TypeMismatch {
                expected: "integer index",
                got: key.type_name(),
            })?;
            let byte = value.as_int_exact().and_then(|n| u8::try_from(n).ok()).ok_or(
                ExecError::TypeMismatch { expected: "byte", got: value.type_name() },
            )?;
            let mut bytes = b.borrow_mut();
            if index >= bytes.len() {
                bytes.resize(index + 1, 0);
            }
            bytes[index] = byte;
            Ok(())
        }
        other => Err(ExecError::TypeMismatch { expected: "mutable", got: other.type_name() }),
    }
}

fn index_of(key: &Value) -> Option<usize> {
    key.as_int_exact().and_then(|n| usize::try_from(n).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;

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

    fn func(pairs: Vec<(Value, Value)>) -> Value {
        assemble(&Value::table_from_pairs(pairs)).unwrap().to_function()
    }

    #[test]
    fn test_identity() {
        let f = func(vec![
            (kw("arity"), num(1.0)),
            (kw("slots"), Value::array(vec![sym("x")])),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("ret"), sym("x")])])),
        ]);
        assert_eq!(call(&f, &[num(7.0)]).unwrap(), num(7.0));
    }

    #[test]
    fn test_countdown_loop() {
        // Sums 1..=n with a jmpno-terminated loop.
        let f = func(vec![
            (kw("arity"), num(1.0)),
            (kw("slots"), Value::array(vec![sym("n"), sym("acc"), sym("going")])),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("ldi"), sym("acc"), num(0.0)]),
                    kw("loop"),
                    instr(vec![sym("gtim"), sym("going"), sym("n"), num(0.0)]),
                    instr(vec![sym("jmpno"), sym("going"), kw("done")]),
                    instr(vec![sym("add"), sym("acc"), sym("acc"), sym("n")]),
                    instr(vec![sym("addim"), sym("n"), sym("n"), num(-1.0)]),
                    instr(vec![sym("jmp"), kw("loop")]),
                    kw("done"),
                    instr(vec![sym("ret"), sym("acc")]),
                ]),
            ),
        ]);
        assert_eq!(call(&f, &[num(10.0)]).unwrap(), num(55.0));
    }

    #[test]
    fn test_closure_captures_parent_slot() {
        let inner = Value::table_from_pairs(vec![
            (kw("name"), sym("inner")),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("ldu"), num(0.0), sym("outer"), num(0.0)]),
                    instr(vec![sym("ret"), num(0.0)]),
                ]),
            ),
        ]);
        let f = func(vec![
            (kw("name"), sym("outer")),
            (kw("arity"), num(1.0)),
            (kw("slots"), Value::array(vec![sym("x"), sym("g")])),
            (kw("closures"), Value::array(vec![inner])),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("clo"), sym("g"), sym("inner")]),
                    instr(vec![sym("ret"), sym("g")]),
                ]),
            ),
        ]);
        let getter = call(&f, &[num(42.0)]).unwrap();
        assert_eq!(call(&getter, &[]).unwrap(), num(42.0));
    }

    #[test]
    fn test_call_and_vararg() {
        let callee = Value::table_from_pairs(vec![
            (kw("name"), sym("gather")),
            (kw("vararg"), Value::boolean(true)),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("ret"), num(0.0)])])),
        ]);
        let f = func(vec![
            (kw("slots"), Value::array(vec![sym("g"), sym("out")])),
            (kw("closures"), Value::array(vec![callee])),
            (kw("constants"), Value::array(vec![num(1.0), num(2.0)])),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("clo"), sym("g"), sym("gather")]),
                    instr(vec![sym("ldc"), sym("out"), num(0.0)]),
                    instr(vec![sym("push"), sym("out")]),
                    instr(vec![sym("ldc"), sym("out"), num(1.0)]),
                    instr(vec![sym("push"), sym("out")]),
                    instr(vec![sym("call"), sym("out"), sym("g")]),
                    instr(vec![sym("ret"), sym("out")]),
                ]),
            ),
        ]);
        assert_eq!(call(&f, &[]).unwrap(), Value::tuple(vec![num(1.0), num(2.0)]));
    }

    #[test]
    fn test_arity_mismatch() {
        let f = func(vec![
            (kw("arity"), num(2.0)),
            (kw("bytecode"), Value::array(vec![instr(vec![sym("retn")])])),
        ]);
        let err = call(&f, &[num(1.0)]).unwrap_err();
        assert!(matches!(err, ExecError::ArityMismatch { got: 1, .. }));
    }

    #[test]
    fn test_err_opcode_throws() {
        let f = func(vec![
            (kw("constants"), Value::array(vec![Value::string("boom")])),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("ldc"), num(0.0), num(0.0)]),
                    instr(vec![sym("err"), num(0.0)]),
                ]),
            ),
        ]);
        let err = call(&f, &[]).unwrap_err();
        assert!(matches!(err, ExecError::Thrown(v) if v == Value::string("boom")));
    }

    #[test]
    fn test_aggregate_constructors() {
        let f = func(vec![
            (kw("slots"), Value::array(vec![sym("a"), sym("b")])),
            (
                kw("bytecode"),
                Value::array(vec![
                    instr(vec![sym("ldi"), sym("a"), num(1.0)]),
                    instr(vec![sym("push"), sym("a")]),
                    instr(vec![sym("ldi"), sym("a"), num(2.0)]),
                    instr(vec![sym("push"), sym("a")]),
                    instr(vec![sym("mkarr"), sym("b")]),
                    instr(vec![sym("ret"), sym("b")]),
                ]),
            ),
        ]);
        let out = call(&f, &[]).unwrap();
        let Value::Array(items) = &out else { panic!("expected array") };
        assert_eq!(*items.borrow(), vec![num(1.0), num(2.0)]);
    }

    #[test]
    fn test_cfunction_callable() {
        fn double(args: &[Value]) -> Result<Value, Value> {
            match args.first().and_then(Value::as_number) {
                Some(n) => Ok(Value::number(n * 2.0)),
                None => Err(Value::string("expected number")),
            }
        }
        let f = Value::CFunction(double);
        assert_eq!(call(&f, &[num(21.0)]).unwrap(), num(42.0));
    }
}
