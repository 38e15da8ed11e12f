//! Marshal / unmarshal: value graphs to bytes and back.
//!
//! The wire format is byte-exact. A leading byte encodes a compact small
//! integer (`0..=127` directly, `128..=191` leading a two-byte 14-bit
//! signed form) or a tag (`200..=220`) selecting a type. Reference-type
//! values get ascending ids as they are first emitted; later occurrences
//! become back-references, so structural sharing (and cycles through
//! mutable containers) survives the round trip. Funcdefs and function
//! environments track their own id spaces so mutually recursive closures
//! reconstruct.
//!
//! The unmarshaller bounds every read and range-checks every id; a
//! reconstructed funcdef goes through the verifier and a reconstructed
//! PEG program through its validator before either is returned.

use std::{cell::RefCell, fmt, rc::Rc};

use ahash::AHashMap;

use crate::{
    asm::{VerifyError, verify},
    funcdef::{FuncDef, FuncFlags, SourceMapping, SymbolSlot},
    limits::DEFAULT_MAX_RECURSION_DEPTH,
    peg::PegProgram,
    value::{Closure, Fiber, FiberFrame, FiberStatus, FuncEnv, Struct, Table, Tuple, Value},
};

const LB_NIL: u8 = 200;
const LB_FALSE: u8 = 201;
const LB_TRUE: u8 = 202;
const LB_REAL: u8 = 203;
const LB_INTEGER: u8 = 204;
const LB_STRING: u8 = 205;
const LB_SYMBOL: u8 = 206;
const LB_KEYWORD: u8 = 207;
const LB_BUFFER: u8 = 208;
const LB_ARRAY: u8 = 209;
const LB_TUPLE: u8 = 210;
const LB_TABLE: u8 = 211;
const LB_TABLE_PROTO: u8 = 212;
const LB_STRUCT: u8 = 213;
const LB_FIBER: u8 = 214;
const LB_FUNCTION: u8 = 215;
const LB_REGISTRY: u8 = 216;
const LB_ABSTRACT: u8 = 217;
const LB_REFERENCE: u8 = 218;
const LB_FUNCENV_REF: u8 = 219;
const LB_FUNCDEF_REF: u8 = 220;

/// Abstract type name for compiled PEG programs on the wire.
const PEG_ABSTRACT_NAME: &[u8] = b"core/peg";

/// Categorized marshalling failure.
#[derive(Debug, Clone)]
pub enum MarshalError {
    /// The value graph is deeper than the recursion budget.
    StackOverflow,
    /// No marshal implementation for this value.
    TypeNyi(&'static str),
    /// A cfunction (or unknown abstract) with no reverse-registry entry.
    NoRegistryValue(Value),
    /// A fiber frame whose callee is a host function.
    CStackFrame,
    /// The fiber is currently running.
    AliveFiber,
    /// A closure whose environments do not match its def.
    IncompleteFunction,
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => f.write_str("stack overflow"),
            Self::TypeNyi(name) => write!(f, "no marshal implementation for type {name}"),
            Self::NoRegistryValue(value) => write!(f, "no registry value for {value}"),
            Self::CStackFrame => f.write_str("fiber has c stack frame"),
            Self::AliveFiber => f.write_str("cannot marshal alive fiber"),
            Self::IncompleteFunction => {
                f.write_str("closure environments do not match its funcdef")
            }
        }
    }
}

impl std::error::Error for MarshalError {}

/// Categorized unmarshalling failure.
#[derive(Debug, Clone)]
pub enum UnmarshalError {
    /// The encoded graph is deeper than the recursion budget.
    StackOverflow,
    /// The input ended before the value did.
    UnexpectedEnd,
    /// A back-reference to an id that has not been assigned.
    InvalidReference(usize),
    /// The next bytes did not encode what the grammar requires here.
    Expected(&'static str),
    /// A reconstructed funcdef failed verification.
    InvalidBytecode(VerifyError),
    /// A reconstructed PEG program failed validation.
    InvalidProgram(&'static str),
    /// A fiber with an impossible status, frame, or pc.
    InvalidFiber,
}

impl fmt::Display for UnmarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => f.write_str("stack overflow"),
            Self::UnexpectedEnd => f.write_str("unexpected end of source"),
            Self::InvalidReference(id) => write!(f, "invalid reference {id}"),
            Self::Expected(what) => write!(f, "expected {what}"),
            Self::InvalidBytecode(err) => write!(f, "invalid bytecode: {err}"),
            Self::InvalidProgram(detail) => write!(f, "invalid peg program: {detail}"),
            Self::InvalidFiber => f.write_str("invalid fiber"),
        }
    }
}

impl std::error::Error for UnmarshalError {}

/// Serializes `value`, appending to a fresh buffer.
///
/// `reverse_registry` maps values to symbolic names; a registered value is
/// emitted as a name reference instead of its contents.
pub fn marshal(value: &Value, reverse_registry: Option<&Table>) -> Result<Vec<u8>, MarshalError> {
    let mut buf = Vec::new();
    marshal_into(value, reverse_registry, &mut buf)?;
    Ok(buf)
}

/// Serializes `value`, appending to `buf`. On failure the buffer may hold
/// a partial prefix; callers that need atomicity marshal into a scratch
/// buffer first.
pub fn marshal_into(
    value: &Value,
    reverse_registry: Option<&Table>,
    buf: &mut Vec<u8>,
) -> Result<(), MarshalError> {
    let mut state = MarshalState {
        buf,
        seen: AHashMap::new(),
        seen_defs: AHashMap::new(),
        seen_envs: AHashMap::new(),
        rreg: reverse_registry,
    };
    state.marshal_one(value, 0)
}

/// Reconstructs one value from `data`, returning it with the offset of
/// the first unconsumed byte.
pub fn unmarshal(
    data: &[u8],
    forward_registry: Option<&Table>,
) -> Result<(Value, usize), UnmarshalError> {
    let mut state = UnmarshalState {
        data,
        pos: 0,
        values: Vec::new(),
        defs: Vec::new(),
        envs: Vec::new(),
        registry: forward_registry,
    };
    let value = state.unmarshal_one(0)?;
    Ok((value, state.pos))
}

struct MarshalState<'a> {
    buf: &'a mut Vec<u8>,
    /// Value id space. Keys use the value model's equality: content for
    /// immutable values, identity for mutable ones.
    seen: AHashMap<Value, u32>,
    /// Funcdef id space, keyed by allocation address.
    seen_defs: AHashMap<usize, u32>,
    /// Environment id space, keyed by allocation address.
    seen_envs: AHashMap<usize, u32>,
    rreg: Option<&'a Table>,
}

impl MarshalState<'_> {
    fn mark_seen(&mut self, value: &Value) {
        let id = self.seen.len() as u32;
        self.seen.insert(value.clone(), id);
    }

    fn push_byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Compact integer encoding: one byte for `0..=127`, two bytes for
    /// the 14-bit signed range, otherwise a 4-byte big-endian payload.
    fn push_int(&mut self, x: i32) {
        if (0..128).contains(&x) {
            self.push_byte(x as u8);
        } else if (-8192..8192).contains(&x) {
            self.push_byte(0x80 | ((x >> 8) & 0x3F) as u8);
            self.push_byte((x & 0xFF) as u8);
        } else {
            self.push_byte(LB_INTEGER);
            self.push_bytes(&x.to_be_bytes());
        }
    }

    fn push_len(&mut self, len: usize) -> Result<(), MarshalError> {
        let len = i32::try_from(len).map_err(|_| MarshalError::TypeNyi("oversized value"))?;
        self.push_int(len);
        Ok(())
    }

    fn push_byte_string(&mut self, tag: u8, bytes: &[u8]) -> Result<(), MarshalError> {
        self.push_byte(tag);
        self.push_len(bytes.len())?;
        self.push_bytes(bytes);
        Ok(())
    }

    fn marshal_one(&mut self, value: &Value, depth: usize) -> Result<(), MarshalError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(MarshalError::StackOverflow);
        }
        match value {
            Value::Nil => {
                self.push_byte(LB_NIL);
                return Ok(());
            }
            Value::Boolean(b) => {
                self.push_byte(if *b { LB_TRUE } else { LB_FALSE });
                return Ok(());
            }
            Value::Number(n) => {
                self.marshal_number(*n);
                return Ok(());
            }
            _ => {}
        }

        if let Some(&id) = self.seen.get(value) {
            self.push_byte(LB_REFERENCE);
            self.push_int(id as i32);
            return Ok(());
        }
        if let Some(rreg) = self.rreg
            && let Some(name) = rreg.get(value)
        {
            self.push_byte(LB_REGISTRY);
            return self.marshal_one(&name, depth + 1);
        }

        match value {
            Value::Str(bytes) => {
                self.push_byte_string(LB_STRING, bytes)?;
                self.mark_seen(value);
            }
            Value::Symbol(bytes) => {
                self.push_byte_string(LB_SYMBOL, bytes)?;
                self.mark_seen(value);
            }
            Value::Keyword(bytes) => {
                self.push_byte_string(LB_KEYWORD, bytes)?;
                self.mark_seen(value);
            }
            Value::Buffer(buffer) => {
                self.mark_seen(value);
                let bytes = buffer.borrow();
                self.push_byte_string(LB_BUFFER, &bytes)?;
            }
            Value::Array(items) => {
                self.mark_seen(value);
                self.push_byte(LB_ARRAY);
                let items = items.borrow().clone();
                self.push_len(items.len())?;
                for item in &items {
                    self.marshal_one(item, depth + 1)?;
                }
            }
            Value::Tuple(tuple) => {
                self.push_byte(LB_TUPLE);
                self.push_len(tuple.items.len())?;
                self.push_int(i32::from(tuple.flag));
                for item in &tuple.items {
                    self.marshal_one(item, depth + 1)?;
                }
                // Content-hashed: registered only after the children, so
                // it cannot alias mid-emission.
                self.mark_seen(value);
            }
            Value::Table(table) => {
                self.mark_seen(value);
                let (pairs, proto) = {
                    let table = table.borrow();
                    let pairs: Vec<(Value, Value)> =
                        table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    (pairs, table.proto.clone())
                };
                match proto {
                    Some(proto) => {
                        self.push_byte(LB_TABLE_PROTO);
                        self.push_len(pairs.len())?;
                        self.marshal_one(&Value::Table(proto), depth + 1)?;
                    }
                    None => {
                        self.push_byte(LB_TABLE);
                        self.push_len(pairs.len())?;
                    }
                }
                for (k, v) in &pairs {
                    self.marshal_one(k, depth + 1)?;
                    self.marshal_one(v, depth + 1)?;
                }
            }
            Value::Struct(entries) => {
                self.push_byte(LB_STRUCT);
                self.push_len(entries.len())?;
                let pairs: Vec<(Value, Value)> =
                    entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                for (k, v) in &pairs {
                    self.marshal_one(k, depth + 1)?;
                    self.marshal_one(v, depth + 1)?;
                }
                self.mark_seen(value);
            }
            Value::Function(closure) => {
                let envs = closure.envs.borrow().clone();
                if envs.len() != closure.def.environments.len() {
                    return Err(MarshalError::IncompleteFunction);
                }
                self.push_byte(LB_FUNCTION);
                self.marshal_def(&closure.def, depth + 1)?;
                // After its def, before its envs: envs may close the loop
                // back to this function.
                self.mark_seen(value);
                for env in &envs {
                    self.marshal_env(env, depth + 1)?;
                }
            }
            Value::Fiber(fiber) => self.marshal_fiber(value, fiber, depth)?,
            Value::CFunction(_) => return Err(MarshalError::NoRegistryValue(value.clone())),
            Value::Abstract(abs) => {
                let Some(program) = abs.as_any().downcast_ref::<PegProgram>() else {
                    return Err(MarshalError::TypeNyi("abstract"));
                };
                self.mark_seen(value);
                self.push_byte(LB_ABSTRACT);
                self.push_len(PEG_ABSTRACT_NAME.len())?;
                self.push_bytes(PEG_ABSTRACT_NAME);
                self.push_len(program.bytecode().len())?;
                self.push_len(program.constants().len())?;
                for &word in program.bytecode() {
                    self.push_bytes(&word.to_le_bytes());
                }
                for constant in program.constants() {
                    self.marshal_one(constant, depth + 1)?;
                }
            }
            Value::Nil | Value::Boolean(_) | Value::Number(_) => unreachable!("handled above"),
        }
        Ok(())
    }

    /// Numbers exactly representable as 32-bit integers take the compact
    /// integer form; everything else is a little-endian double.
    fn marshal_number(&mut self, n: f64) {
        if n.fract() == 0.0 && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&n) {
            self.push_int(n as i32);
        } else {
            self.push_byte(LB_REAL);
            self.push_bytes(&n.to_le_bytes());
        }
    }

    fn marshal_def(&mut self, def: &Rc<FuncDef>, depth: usize) -> Result<(), MarshalError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(MarshalError::StackOverflow);
        }
        let key = Rc::as_ptr(def) as usize;
        if let Some(&id) = self.seen_defs.get(&key) {
            self.push_byte(LB_FUNCDEF_REF);
            self.push_int(id as i32);
            return Ok(());
        }
        let id = self.seen_defs.len() as u32;
        self.seen_defs.insert(key, id);

        self.push_int(def.flags.bits() as i32);
        self.push_int(def.slotcount as i32);
        self.push_int(def.arity as i32);
        self.push_int(def.min_arity as i32);
        self.push_int(def.max_arity as i32);
        self.push_len(def.constants.len())?;
        self.push_len(def.bytecode.len())?;
        if def.flags.contains(FuncFlags::HASDEFS) {
            self.push_len(def.defs.len())?;
        }
        if def.flags.contains(FuncFlags::HASENVS) {
            self.push_len(def.environments.len())?;
        }
        for constant in &def.constants {
            self.marshal_one(constant, depth + 1)?;
        }
        for &word in &def.bytecode {
            self.push_bytes(&word.to_le_bytes());
        }
        if def.flags.contains(FuncFlags::HASENVS) {
            for &entry in &def.environments {
                self.push_int(entry);
            }
        }
        if def.flags.contains(FuncFlags::HASDEFS) {
            for sub in &def.defs {
                self.marshal_def(sub, depth + 1)?;
            }
        }
        if def.flags.contains(FuncFlags::HASNAME)
            && let Some(name) = &def.name
        {
            self.push_len(name.len())?;
            self.push_bytes(name);
        }
        if def.flags.contains(FuncFlags::HASSOURCE)
            && let Some(source) = &def.source
        {
            self.push_len(source.len())?;
            self.push_bytes(source);
        }
        if def.flags.contains(FuncFlags::HASSOURCEMAP) {
            for mapping in &def.sourcemap {
                self.push_int(mapping.start);
                self.push_int(mapping.end);
            }
        }
        if def.flags.contains(FuncFlags::HASSYMBOLMAP) {
            self.push_len(def.symbolmap.len())?;
            for entry in &def.symbolmap {
                self.push_int(entry.birth_pc as i32);
                self.push_int(entry.death_pc as i32);
                self.push_int(entry.slot as i32);
                self.push_len(entry.symbol.len())?;
                self.push_bytes(&entry.symbol);
            }
        }
        Ok(())
    }

    fn marshal_env(
        &mut self,
        env: &Rc<RefCell<FuncEnv>>,
        depth: usize,
    ) -> Result<(), MarshalError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(MarshalError::StackOverflow);
        }
        let key = Rc::as_ptr(env) as usize;
        if let Some(&id) = self.seen_envs.get(&key) {
            self.push_byte(LB_FUNCENV_REF);
            self.push_int(id as i32);
            return Ok(());
        }
        // Before the values: an env may hold a closure that captures it.
        let id = self.seen_envs.len() as u32;
        self.seen_envs.insert(key, id);

        let values = env.borrow().values.clone();
        self.push_len(values.len())?;
        for value in &values {
            self.marshal_one(value, depth + 1)?;
        }
        Ok(())
    }

    fn marshal_fiber(
        &mut self,
        value: &Value,
        fiber: &Rc<RefCell<Fiber>>,
        depth: usize,
    ) -> Result<(), MarshalError> {
        if fiber.borrow().status == FiberStatus::Alive {
            return Err(MarshalError::AliveFiber);
        }
        self.mark_seen(value);
        self.push_byte(LB_FIBER);
        let fiber = fiber.borrow();
        self.push_int(fiber.status.to_u32() as i32);
        self.push_len(fiber.frames.len())?;
        // Frames walk parent first so the reader rebuilds the stack in
        // push order.
        for frame in &fiber.frames {
            match &frame.callee {
                Value::Function(_) => {}
                Value::CFunction(_) => return Err(MarshalError::CStackFrame),
                _ => return Err(MarshalError::TypeNyi("fiber frame")),
            }
            self.marshal_one(&frame.callee, depth + 1)?;
            self.push_int(frame.pc as i32);
            match &frame.env {
                Some(env) => {
                    self.push_int(1);
                    self.marshal_env(env, depth + 1)?;
                }
                None => self.push_int(0),
            }
            self.push_len(frame.slots.len())?;
            for slot in &frame.slots {
                self.marshal_one(slot, depth + 1)?;
            }
        }
        Ok(())
    }
}

struct UnmarshalState<'a> {
    data: &'a [u8],
    pos: usize,
    /// Value id space, in assignment order.
    values: Vec<Value>,
    defs: Vec<Rc<FuncDef>>,
    envs: Vec<Rc<RefCell<FuncEnv>>>,
    registry: Option<&'a Table>,
}

impl<'a> UnmarshalState<'a> {
    fn peek(&self) -> Result<u8, UnmarshalError> {
        self.data.get(self.pos).copied().ok_or(UnmarshalError::UnexpectedEnd)
    }

    fn byte(&mut self) -> Result<u8, UnmarshalError> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], UnmarshalError> {
        let end = self.pos.checked_add(n).ok_or(UnmarshalError::UnexpectedEnd)?;
        if end > self.data.len() {
            return Err(UnmarshalError::UnexpectedEnd);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_int(&mut self) -> Result<i32, UnmarshalError> {
        let lead = self.byte()?;
        if lead < 128 {
            Ok(i32::from(lead))
        } else if lead < 192 {
            let low = self.byte()?;
            let raw = (i32::from(lead & 0x3F) << 8) | i32::from(low);
            Ok(if raw >= 0x2000 { raw - 0x4000 } else { raw })
        } else if lead == LB_INTEGER {
            let bytes = self.take(4)?;
            Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        } else {
            Err(UnmarshalError::Expected("integer"))
        }
    }

    fn read_len(&mut self) -> Result<usize, UnmarshalError> {
        usize::try_from(self.read_int()?).map_err(|_| UnmarshalError::Expected("integer"))
    }

    fn read_u32(&mut self) -> Result<u32, UnmarshalError> {
        u32::try_from(self.read_int()?).map_err(|_| UnmarshalError::Expected("integer"))
    }

    fn unmarshal_one(&mut self, depth: usize) -> Result<Value, UnmarshalError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(UnmarshalError::StackOverflow);
        }
        let lead = self.peek()?;
        if lead < 192 || lead == LB_INTEGER {
            return Ok(Value::number(f64::from(self.read_int()?)));
        }
        match lead {
            LB_NIL => {
                self.pos += 1;
                Ok(Value::Nil)
            }
            LB_FALSE => {
                self.pos += 1;
                Ok(Value::boolean(false))
            }
            LB_TRUE => {
                self.pos += 1;
                Ok(Value::boolean(true))
            }
            LB_REAL => {
                self.pos += 1;
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(Value::number(f64::from_le_bytes(raw)))
            }
            LB_STRING | LB_SYMBOL | LB_KEYWORD => {
                self.pos += 1;
                let len = self.read_len()?;
                let bytes: Rc<[u8]> = self.take(len)?.into();
                let value = match lead {
                    LB_STRING => Value::Str(bytes),
                    LB_SYMBOL => Value::Symbol(bytes),
                    _ => Value::Keyword(bytes),
                };
                self.values.push(value.clone());
                Ok(value)
            }
            LB_BUFFER => {
                self.pos += 1;
                let len = self.read_len()?;
                let value = Value::buffer(self.take(len)?.to_vec());
                self.values.push(value.clone());
                Ok(value)
            }
            LB_ARRAY => {
                self.pos += 1;
                let items = Rc::new(RefCell::new(Vec::new()));
                let value = Value::Array(items.clone());
                self.values.push(value.clone());
                let len = self.read_len()?;
                for _ in 0..len {
                    let item = self.unmarshal_one(depth + 1)?;
                    items.borrow_mut().push(item);
                }
                Ok(value)
            }
            LB_TUPLE => {
                self.pos += 1;
                let len = self.read_len()?;
                let flag = u8::try_from(self.read_int()?)
                    .map_err(|_| UnmarshalError::Expected("tuple flag"))?;
                let mut items = Vec::new();
                for _ in 0..len {
                    items.push(self.unmarshal_one(depth + 1)?);
                }
                let value = Value::Tuple(Rc::new(Tuple { flag, items }));
                self.values.push(value.clone());
                Ok(value)
            }
            LB_TABLE | LB_TABLE_PROTO => {
                self.pos += 1;
                let table = Rc::new(RefCell::new(Table::new()));
                let value = Value::Table(table.clone());
                self.values.push(value.clone());
                let len = self.read_len()?;
                if lead == LB_TABLE_PROTO {
                    match self.unmarshal_one(depth + 1)? {
                        Value::Table(proto) => table.borrow_mut().proto = Some(proto),
                        _ => return Err(UnmarshalError::Expected("table")),
                    }
                }
                for _ in 0..len {
                    let key = self.unmarshal_one(depth + 1)?;
                    let item = self.unmarshal_one(depth + 1)?;
                    table.borrow_mut().insert(key, item);
                }
                Ok(value)
            }
            LB_STRUCT => {
                self.pos += 1;
                let len = self.read_len()?;
                let mut pairs = Vec::new();
                for _ in 0..len {
                    let key = self.unmarshal_one(depth + 1)?;
                    let item = self.unmarshal_one(depth + 1)?;
                    pairs.push((key, item));
                }
                let value = Value::Struct(Rc::new(Struct::from_pairs(pairs)));
                self.values.push(value.clone());
                Ok(value)
            }
            LB_FUNCTION => {
                self.pos += 1;
                let def = self.unmarshal_def(depth + 1)?;
                let env_count = def.environments.len();
                let closure = Rc::new(Closure { def, envs: RefCell::new(Vec::new()) });
                let value = Value::Function(closure.clone());
                self.values.push(value.clone());
                let mut envs = Vec::with_capacity(env_count);
                for _ in 0..env_count {
                    envs.push(self.unmarshal_env(depth + 1)?);
                }
                *closure.envs.borrow_mut() = envs;
                Ok(value)
            }
            LB_FIBER => {
                self.pos += 1;
                self.unmarshal_fiber(depth)
            }
            LB_REGISTRY => {
                self.pos += 1;
                let name = self.unmarshal_one(depth + 1)?;
                Ok(self
                    .registry
                    .and_then(|registry| registry.get(&name))
                    .unwrap_or(Value::Nil))
            }
            LB_ABSTRACT => {
                self.pos += 1;
                let name_len = self.read_len()?;
                let name = self.take(name_len)?;
                if name != PEG_ABSTRACT_NAME {
                    return Err(UnmarshalError::Expected("known abstract type"));
                }
                // Reserve the id slot now; the writer registered the
                // abstract before its payload.
                let slot = self.values.len();
                self.values.push(Value::Nil);
                let bytecode_len = self.read_len()?;
                let constant_count = self.read_len()?;
                let raw = self.take(bytecode_len.checked_mul(4).ok_or(UnmarshalError::UnexpectedEnd)?)?;
                let bytecode = raw
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                let mut constants = Vec::new();
                for _ in 0..constant_count {
                    constants.push(self.unmarshal_one(depth + 1)?);
                }
                let program = PegProgram { bytecode, constants };
                program.validate().map_err(UnmarshalError::InvalidProgram)?;
                let value = Rc::new(program).into_value();
                self.values[slot] = value.clone();
                Ok(value)
            }
            LB_REFERENCE => {
                self.pos += 1;
                let id = self.read_len()?;
                self.values.get(id).cloned().ok_or(UnmarshalError::InvalidReference(id))
            }
            _ => Err(UnmarshalError::Expected("value tag")),
        }
    }

    fn unmarshal_def(&mut self, depth: usize) -> Result<Rc<FuncDef>, UnmarshalError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(UnmarshalError::StackOverflow);
        }
        if self.peek()? == LB_FUNCDEF_REF {
            self.pos += 1;
            let id = self.read_len()?;
            return self.defs.get(id).cloned().ok_or(UnmarshalError::InvalidReference(id));
        }
        // Reserve the def id; the writer assigned it before the fields.
        let slot = self.defs.len();
        self.defs.push(Rc::new(FuncDef::default()));

        let flags = FuncFlags::from_bits(self.read_u32()?)
            .ok_or(UnmarshalError::Expected("funcdef flags"))?;
        let slotcount = self.read_u32()?;
        let arity = self.read_u32()?;
        let min_arity = self.read_u32()?;
        let max_arity = self.read_u32()?;
        let constant_count = self.read_len()?;
        let bytecode_len = self.read_len()?;
        let def_count =
            if flags.contains(FuncFlags::HASDEFS) { self.read_len()? } else { 0 };
        let env_count =
            if flags.contains(FuncFlags::HASENVS) { self.read_len()? } else { 0 };

        let mut constants = Vec::new();
        for _ in 0..constant_count {
            constants.push(self.unmarshal_one(depth + 1)?);
        }
        let raw =
            self.take(bytecode_len.checked_mul(4).ok_or(UnmarshalError::UnexpectedEnd)?)?;
        let bytecode: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut environments = Vec::new();
        for _ in 0..env_count {
            environments.push(self.read_int()?);
        }
        let mut defs = Vec::new();
        for _ in 0..def_count {
            defs.push(self.unmarshal_def(depth + 1)?);
        }
        let name = if flags.contains(FuncFlags::HASNAME) {
            let len = self.read_len()?;
            Some(Rc::from(self.take(len)?))
        } else {
            None
        };
        let source = if flags.contains(FuncFlags::HASSOURCE) {
            let len = self.read_len()?;
            Some(Rc::from(self.take(len)?))
        } else {
            None
        };
        let mut sourcemap = Vec::new();
        if flags.contains(FuncFlags::HASSOURCEMAP) {
            for _ in 0..bytecode_len {
                let start = self.read_int()?;
                let end = self.read_int()?;
                sourcemap.push(SourceMapping { start, end });
            }
        }
        let mut symbolmap = Vec::new();
        if flags.contains(FuncFlags::HASSYMBOLMAP) {
            let count = self.read_len()?;
            for _ in 0..count {
                let birth_pc = self.read_int()? as u32;
                let death_pc = self.read_int()? as u32;
                let entry_slot = self.read_int()? as u32;
                let len = self.read_len()?;
                let symbol = Rc::from(self.take(len)?);
                symbolmap.push(SymbolSlot { birth_pc, death_pc, slot: entry_slot, symbol });
            }
        }

        let def = Rc::new(FuncDef {
            flags,
            arity,
            min_arity,
            max_arity,
            slotcount,
            constants,
            bytecode,
            defs,
            environments,
            sourcemap,
            symbolmap,
            name,
            source,
        });
        verify(&def).map_err(UnmarshalError::InvalidBytecode)?;
        self.defs[slot] = def.clone();
        Ok(def)
    }

    fn unmarshal_env(&mut self, depth: usize) -> Result<Rc<RefCell<FuncEnv>>, UnmarshalError> {
        if depth > DEFAULT_MAX_RECURSION_DEPTH {
            return Err(UnmarshalError::StackOverflow);
        }
        if self.peek()? == LB_FUNCENV_REF {
            self.pos += 1;
            let id = self.read_len()?;
            return self.envs.get(id).cloned().ok_or(UnmarshalError::InvalidReference(id));
        }
        // Register before the values: the env may hold a closure that
        // captures this same env.
        let env = Rc::new(RefCell::new(FuncEnv::default()));
        self.envs.push(env.clone());
        let len = self.read_len()?;
        let mut values = Vec::new();
        for _ in 0..len {
            values.push(self.unmarshal_one(depth + 1)?);
        }
        env.borrow_mut().values = values;
        Ok(env)
    }

    fn unmarshal_fiber(&mut self, depth: usize) -> Result<Value, UnmarshalError> {
        let fiber = Rc::new(RefCell::new(Fiber::default()));
        let value = Value::Fiber(fiber.clone());
        self.values.push(value.clone());
        let status = FiberStatus::from_u32(self.read_u32()?).ok_or(UnmarshalError::InvalidFiber)?;
        if status == FiberStatus::Alive {
            return Err(UnmarshalError::InvalidFiber);
        }
        let frame_count = self.read_len()?;
        let mut frames = Vec::new();
        for _ in 0..frame_count {
            let callee = self.unmarshal_one(depth + 1)?;
            let Value::Function(closure) = &callee else {
                return Err(UnmarshalError::InvalidFiber);
            };
            let pc = self.read_u32()?;
            if pc as usize >= closure.def.bytecode.len() {
                return Err(UnmarshalError::InvalidFiber);
            }
            let env = match self.read_int()? {
                0 => None,
                1 => Some(self.unmarshal_env(depth + 1)?),
                _ => return Err(UnmarshalError::InvalidFiber),
            };
            let slot_count = self.read_len()?;
            let mut slots = Vec::new();
            for _ in 0..slot_count {
                slots.push(self.unmarshal_one(depth + 1)?);
            }
            frames.push(FiberFrame { callee, env, pc, slots });
        }
        {
            let mut fiber = fiber.borrow_mut();
            fiber.status = status;
            fiber.frames = frames;
        }
        Ok(value)
    }
}
