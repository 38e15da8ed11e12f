//! Primary value type shared by the assembler, the PEG engine, and the
//! marshaller.
//!
//! This enum uses a hybrid design: small immediate values (nil, booleans,
//! numbers) are stored inline, while aggregates live behind `Rc`. Mutable
//! aggregates (`Buffer`, `Array`, `Table`, `Fiber`) compare and hash by
//! pointer identity; immutable ones (the three byte-string flavors,
//! `Tuple`, `Struct`) compare and hash by content. The split is load
//! bearing for the marshaller: content-keyed values cannot alias
//! mid-emission, identity-keyed ones can.

use std::{
    any::Any,
    cell::RefCell,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
};

use indexmap::IndexMap;

use crate::{funcdef::FuncDef, limits::MAX_PROTO_DEPTH};

/// Ordered mapping storage used by both `Table` and `Struct`.
pub type ValueMap = IndexMap<Value, Value, ahash::RandomState>;

/// A host callable. The error value is delivered to the host's panic
/// mechanism (surfaced as an error by whichever subsystem made the call).
pub type NativeFunction = fn(&[Value]) -> Result<Value, Value>;

/// Host-owned opaque value.
///
/// The one abstract this crate defines is the compiled PEG program; hosts
/// may add their own. `as_any` enables downcasting where a subsystem needs
/// a concrete abstract (the marshaller does, for PEG programs).
pub trait AbstractValue: fmt::Debug {
    /// Stable name identifying the abstract type, used on the wire.
    fn type_name(&self) -> &'static str;
    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

/// Tagged runtime value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    /// 64-bit float; the only number representation in this core.
    Number(f64),
    /// Immutable byte string.
    Str(Rc<[u8]>),
    /// Immutable byte string used as an identifier.
    Symbol(Rc<[u8]>),
    /// Immutable byte string used as a self-evaluating name (`:foo`).
    Keyword(Rc<[u8]>),
    /// Mutable byte sequence.
    Buffer(Rc<RefCell<Vec<u8>>>),
    /// Mutable ordered sequence.
    Array(Rc<RefCell<Vec<Value>>>),
    /// Immutable ordered sequence with a small flag byte.
    Tuple(Rc<Tuple>),
    /// Mutable mapping with an optional prototype chain.
    Table(Rc<RefCell<Table>>),
    /// Immutable mapping with canonically sorted entries.
    Struct(Rc<Struct>),
    /// Closure: funcdef plus captured environments.
    Function(Rc<Closure>),
    /// Suspended call stack.
    Fiber(Rc<RefCell<Fiber>>),
    /// Host callable.
    CFunction(NativeFunction),
    /// Host-owned opaque value.
    Abstract(Rc<dyn AbstractValue>),
}

/// Immutable ordered sequence. The flag byte's `BRACKET` bit marks tuples
/// written with bracket syntax; the assembler reuses it as the breakpoint
/// marker on instruction tuples.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub flag: u8,
    pub items: Vec<Value>,
}

impl Tuple {
    pub const BRACKET: u8 = 0x01;
}

/// Mutable mapping with an optional prototype chain.
#[derive(Debug, Default)]
pub struct Table {
    map: ValueMap,
    pub proto: Option<Rc<RefCell<Table>>>,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `key` in this table only, ignoring prototypes.
    #[must_use]
    pub fn rawget(&self, key: &Value) -> Option<Value> {
        self.map.get(key).cloned()
    }

    /// Looks up `key`, walking the prototype chain up to the fixed depth cap.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        if let Some(v) = self.map.get(key) {
            return Some(v.clone());
        }
        let mut proto = self.proto.clone();
        for _ in 0..MAX_PROTO_DEPTH {
            let Some(t) = proto else { return None };
            let t = t.borrow();
            if let Some(v) = t.map.get(key) {
                return Some(v.clone());
            }
            proto = t.proto.clone();
        }
        None
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        if matches!(value, Value::Nil) {
            self.map.shift_remove(&key);
        } else {
            self.map.insert(key, value);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.map.iter()
    }
}

/// Immutable mapping. Entries are stored sorted by the total key order so
/// that content equality and hashing are canonical regardless of the
/// insertion order the caller used.
#[derive(Debug)]
pub struct Struct {
    map: ValueMap,
}

impl Struct {
    /// Builds a struct from key/value pairs. Later duplicates win.
    #[must_use]
    pub fn from_pairs(mut pairs: Vec<(Value, Value)>) -> Self {
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut map = ValueMap::default();
        for (k, v) in pairs {
            if !matches!(v, Value::Nil) {
                map.insert(k, v);
            }
        }
        Self { map }
    }

    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        self.map.get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.map.iter()
    }
}

impl PartialEq for Struct {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl Eq for Struct {}

impl Hash for Struct {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.map.len());
        for (k, v) in &self.map {
            k.hash(state);
            v.hash(state);
        }
    }
}

/// Detached closure environment: a shared slice of captured values.
#[derive(Debug, Default)]
pub struct FuncEnv {
    pub values: Vec<Value>,
}

/// Closure: a funcdef plus one captured environment per entry of the def's
/// `environments` array.
///
/// `envs` sits behind a `RefCell` so the unmarshaller can register the
/// function id before reading the environments it closes over (mutually
/// recursive closures reconstruct through that window).
#[derive(Debug)]
pub struct Closure {
    pub def: Rc<FuncDef>,
    pub envs: RefCell<Vec<Rc<RefCell<FuncEnv>>>>,
}

/// Lifecycle of a fiber. Only suspended fibers (`New`, `Pending`, `Dead`)
/// are marshallable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    New,
    Pending,
    Alive,
    Dead,
}

impl FiberStatus {
    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::New => 0,
            Self::Pending => 1,
            Self::Alive => 2,
            Self::Dead => 3,
        }
    }

    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::New),
            1 => Some(Self::Pending),
            2 => Some(Self::Alive),
            3 => Some(Self::Dead),
            _ => None,
        }
    }
}

/// One suspended stack frame.
#[derive(Debug)]
pub struct FiberFrame {
    /// The frame's callee: a `Function` for bytecode frames, a `CFunction`
    /// for host frames (which the marshaller rejects).
    pub callee: Value,
    pub env: Option<Rc<RefCell<FuncEnv>>>,
    pub pc: u32,
    pub slots: Vec<Value>,
}

/// Suspended call stack, frames ordered parent first.
#[derive(Debug, Default)]
pub struct Fiber {
    pub status: FiberStatus,
    pub frames: Vec<FiberFrame>,
}

impl Default for FiberStatus {
    fn default() -> Self {
        Self::New
    }
}

// Type bitmasks, used by `ST` operands and the `tchck` opcode. Exactly the
// sixteen single types fill a u16; `pointer` is reserved for host use.
pub const TY_NIL: u16 = 1 << 0;
pub const TY_BOOLEAN: u16 = 1 << 1;
pub const TY_NUMBER: u16 = 1 << 2;
pub const TY_STRING: u16 = 1 << 3;
pub const TY_SYMBOL: u16 = 1 << 4;
pub const TY_KEYWORD: u16 = 1 << 5;
pub const TY_BUFFER: u16 = 1 << 6;
pub const TY_ARRAY: u16 = 1 << 7;
pub const TY_TUPLE: u16 = 1 << 8;
pub const TY_STRUCT: u16 = 1 << 9;
pub const TY_TABLE: u16 = 1 << 10;
pub const TY_FUNCTION: u16 = 1 << 11;
pub const TY_CFUNCTION: u16 = 1 << 12;
pub const TY_FIBER: u16 = 1 << 13;
pub const TY_POINTER: u16 = 1 << 14;
pub const TY_ABSTRACT: u16 = 1 << 15;
pub const TY_INDEXED: u16 = TY_ARRAY | TY_TUPLE;
pub const TY_DICTIONARY: u16 = TY_TABLE | TY_STRUCT;
pub const TY_CALLABLE: u16 = TY_FUNCTION | TY_CFUNCTION;

/// Resolves a type keyword (as it appears in assembly source) to its mask.
#[must_use]
pub fn type_mask_from_name(name: &[u8]) -> Option<u16> {
    Some(match name {
        b"nil" => TY_NIL,
        b"boolean" => TY_BOOLEAN,
        b"number" => TY_NUMBER,
        b"string" => TY_STRING,
        b"symbol" => TY_SYMBOL,
        b"keyword" => TY_KEYWORD,
        b"buffer" => TY_BUFFER,
        b"array" => TY_ARRAY,
        b"tuple" => TY_TUPLE,
        b"struct" => TY_STRUCT,
        b"table" => TY_TABLE,
        b"function" => TY_FUNCTION,
        b"cfunction" => TY_CFUNCTION,
        b"fiber" => TY_FIBER,
        b"pointer" => TY_POINTER,
        b"abstract" => TY_ABSTRACT,
        b"indexed" => TY_INDEXED,
        b"dictionary" => TY_DICTIONARY,
        b"callable" => TY_CALLABLE,
        _ => return None,
    })
}

impl Value {
    // Constructors.

    #[must_use]
    pub fn string(bytes: impl AsRef<[u8]>) -> Self {
        Self::Str(Rc::from(bytes.as_ref()))
    }

    #[must_use]
    pub fn symbol(bytes: impl AsRef<[u8]>) -> Self {
        Self::Symbol(Rc::from(bytes.as_ref()))
    }

    #[must_use]
    pub fn keyword(bytes: impl AsRef<[u8]>) -> Self {
        Self::Keyword(Rc::from(bytes.as_ref()))
    }

    #[must_use]
    pub fn number(n: f64) -> Self {
        Self::Number(n)
    }

    #[must_use]
    pub fn boolean(b: bool) -> Self {
        Self::Boolean(b)
    }

    #[must_use]
    pub fn buffer(bytes: Vec<u8>) -> Self {
        Self::Buffer(Rc::new(RefCell::new(bytes)))
    }

    #[must_use]
    pub fn array(items: Vec<Self>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::new(Tuple { flag: 0, items }))
    }

    #[must_use]
    pub fn bracket_tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::new(Tuple { flag: Tuple::BRACKET, items }))
    }

    #[must_use]
    pub fn table() -> Self {
        Self::Table(Rc::new(RefCell::new(Table::new())))
    }

    #[must_use]
    pub fn table_from_pairs(pairs: Vec<(Self, Self)>) -> Self {
        let mut t = Table::new();
        for (k, v) in pairs {
            t.insert(k, v);
        }
        Self::Table(Rc::new(RefCell::new(t)))
    }

    #[must_use]
    pub fn struct_from_pairs(pairs: Vec<(Self, Self)>) -> Self {
        Self::Struct(Rc::new(Struct::from_pairs(pairs)))
    }

    // Inspection.

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean(_) => "boolean",
            Self::Number(_) => "number",
            Self::Str(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Keyword(_) => "keyword",
            Self::Buffer(_) => "buffer",
            Self::Array(_) => "array",
            Self::Tuple(_) => "tuple",
            Self::Table(_) => "table",
            Self::Struct(_) => "struct",
            Self::Function(_) => "function",
            Self::Fiber(_) => "fiber",
            Self::CFunction(_) => "cfunction",
            Self::Abstract(_) => "abstract",
        }
    }

    #[must_use]
    pub fn type_mask(&self) -> u16 {
        match self {
            Self::Nil => TY_NIL,
            Self::Boolean(_) => TY_BOOLEAN,
            Self::Number(_) => TY_NUMBER,
            Self::Str(_) => TY_STRING,
            Self::Symbol(_) => TY_SYMBOL,
            Self::Keyword(_) => TY_KEYWORD,
            Self::Buffer(_) => TY_BUFFER,
            Self::Array(_) => TY_ARRAY,
            Self::Tuple(_) => TY_TUPLE,
            Self::Table(_) => TY_TABLE,
            Self::Struct(_) => TY_STRUCT,
            Self::Function(_) => TY_FUNCTION,
            Self::Fiber(_) => TY_FIBER,
            Self::CFunction(_) => TY_CFUNCTION,
            Self::Abstract(_) => TY_ABSTRACT,
        }
    }

    /// Everything but `nil` and `false` is truthy.
    #[must_use]
    pub fn truthy(&self) -> bool {
        !matches!(self, Self::Nil | Self::Boolean(false))
    }

    /// Returns the number if this value is an integral number in `i64`
    /// range, as operand and index parsing want.
    #[must_use]
    pub fn as_int_exact(&self) -> Option<i64> {
        match self {
            Self::Number(n) if n.fract() == 0.0 && *n >= -(2f64.powi(63)) && *n < 2f64.powi(63) => {
                Some(*n as i64)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The raw bytes of any byte-string flavor. Buffers are excluded: the
    /// callers (tag matching, literal construction) want immutable data.
    #[must_use]
    pub fn as_bytes(&self) -> Option<Rc<[u8]>> {
        match self {
            Self::Str(b) | Self::Symbol(b) | Self::Keyword(b) => Some(b.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_symbol(&self) -> Option<&[u8]> {
        match self {
            Self::Symbol(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_keyword(&self) -> Option<&[u8]> {
        match self {
            Self::Keyword(b) => Some(b),
            _ => None,
        }
    }

    /// Mapping lookup over tables (with prototypes) and structs.
    #[must_use]
    pub fn get_key(&self, key: &Self) -> Option<Self> {
        match self {
            Self::Table(t) => t.borrow().get(key),
            Self::Struct(s) => s.get(key),
            _ => None,
        }
    }

    /// Convenience for the assembler: mapping lookup by keyword name.
    #[must_use]
    pub fn get_keyword(&self, name: &str) -> Option<Self> {
        self.get_key(&Self::keyword(name))
    }

    /// Serializes this value into `out` the way string coercion would:
    /// byte-string flavors and buffers append raw bytes, everything else
    /// appends its display form. Used by the PEG VM's accumulate mode.
    pub fn render_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Self::Str(b) | Self::Symbol(b) | Self::Keyword(b) => out.extend_from_slice(b),
            Self::Buffer(b) => out.extend_from_slice(&b.borrow()),
            other => {
                use std::io::Write;
                let _ = write!(out, "{other}");
            }
        }
    }

    /// Total order over keys: rank by type, then content for immutable
    /// values, then allocation address for mutable ones. Consistent with
    /// `Eq` (required for `Struct` canonicalization).
    #[must_use]
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Nil => 0,
                Value::Boolean(_) => 1,
                Value::Number(_) => 2,
                Value::Str(_) => 3,
                Value::Symbol(_) => 4,
                Value::Keyword(_) => 5,
                Value::Buffer(_) => 6,
                Value::Array(_) => 7,
                Value::Tuple(_) => 8,
                Value::Struct(_) => 9,
                Value::Table(_) => 10,
                Value::Function(_) => 11,
                Value::Fiber(_) => 12,
                Value::CFunction(_) => 13,
                Value::Abstract(_) => 14,
            }
        }
        match rank(self).cmp(&rank(other)) {
            Ordering::Equal => {}
            ord => return ord,
        }
        match (self, other) {
            (Self::Nil, Self::Nil) => Ordering::Equal,
            (Self::Boolean(a), Self::Boolean(b)) => a.cmp(b),
            (Self::Number(a), Self::Number(b)) => {
                if a == b {
                    Ordering::Equal
                } else {
                    a.total_cmp(b)
                }
            }
            (Self::Str(a), Self::Str(b))
            | (Self::Symbol(a), Self::Symbol(b))
            | (Self::Keyword(a), Self::Keyword(b)) => a.as_ref().cmp(b.as_ref()),
            (Self::Buffer(a), Self::Buffer(b)) => addr(a).cmp(&addr(b)),
            (Self::Array(a), Self::Array(b)) => addr(a).cmp(&addr(b)),
            (Self::Tuple(a), Self::Tuple(b)) => {
                for (x, y) in a.items.iter().zip(&b.items) {
                    match x.total_cmp(y) {
                        Ordering::Equal => {}
                        ord => return ord,
                    }
                }
                a.items.len().cmp(&b.items.len()).then(a.flag.cmp(&b.flag))
            }
            (Self::Struct(a), Self::Struct(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.total_cmp(kb).then_with(|| va.total_cmp(vb)) {
                        Ordering::Equal => {}
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Self::Table(a), Self::Table(b)) => addr(a).cmp(&addr(b)),
            (Self::Function(a), Self::Function(b)) => {
                (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
            }
            (Self::Fiber(a), Self::Fiber(b)) => addr(a).cmp(&addr(b)),
            (Self::CFunction(a), Self::CFunction(b)) => (*a as usize).cmp(&(*b as usize)),
            (Self::Abstract(a), Self::Abstract(b)) => {
                (Rc::as_ptr(a).cast::<()>() as usize).cmp(&(Rc::as_ptr(b).cast::<()>() as usize))
            }
            _ => unreachable!("ranks matched"),
        }
    }
}

fn addr<T>(rc: &Rc<RefCell<T>>) -> usize {
    Rc::as_ptr(rc) as usize
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            // NaN equals itself so numbers stay usable as map keys.
            (Self::Number(a), Self::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Self::Str(a), Self::Str(b))
            | (Self::Symbol(a), Self::Symbol(b))
            | (Self::Keyword(a), Self::Keyword(b)) => a == b,
            (Self::Buffer(a), Self::Buffer(b)) => Rc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::Table(a), Self::Table(b)) => Rc::ptr_eq(a, b),
            (Self::Struct(a), Self::Struct(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Fiber(a), Self::Fiber(b)) => Rc::ptr_eq(a, b),
            (Self::CFunction(a), Self::CFunction(b)) => std::ptr::fn_addr_eq(*a, *b),
            (Self::Abstract(a), Self::Abstract(b)) => {
                std::ptr::eq(Rc::as_ptr(a).cast::<()>(), Rc::as_ptr(b).cast::<()>())
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.type_mask().trailing_zeros() as u8);
        match self {
            Self::Nil => {}
            Self::Boolean(b) => b.hash(state),
            Self::Number(n) => {
                // Normalize -0.0 and NaN so hash agrees with Eq.
                let bits = if *n == 0.0 {
                    0u64
                } else if n.is_nan() {
                    f64::NAN.to_bits()
                } else {
                    n.to_bits()
                };
                state.write_u64(bits);
            }
            Self::Str(b) | Self::Symbol(b) | Self::Keyword(b) => b.hash(state),
            Self::Buffer(b) => state.write_usize(addr(b)),
            Self::Array(a) => state.write_usize(addr(a)),
            Self::Tuple(t) => t.hash(state),
            Self::Table(t) => state.write_usize(addr(t)),
            Self::Struct(s) => s.hash(state),
            Self::Function(f) => state.write_usize(Rc::as_ptr(f) as usize),
            Self::Fiber(f) => state.write_usize(addr(f)),
            Self::CFunction(f) => state.write_usize(*f as usize),
            Self::Abstract(a) => state.write_usize(Rc::as_ptr(a).cast::<()>() as usize),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        repr(self, f, 0)
    }
}

/// Depth-capped printable form, close to reader syntax for data and a
/// `<type …>` form for opaque values.
fn repr(v: &Value, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    if depth > 4 {
        return f.write_str("...");
    }
    match v {
        Value::Nil => f.write_str("nil"),
        Value::Boolean(b) => write!(f, "{b}"),
        Value::Number(n) => {
            if n.fract() == 0.0 && n.abs() < 1e15 {
                write!(f, "{}", *n as i64)
            } else {
                write!(f, "{n}")
            }
        }
        Value::Str(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
        Value::Symbol(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        Value::Keyword(b) => write!(f, ":{}", String::from_utf8_lossy(b)),
        Value::Buffer(b) => write!(f, "@\"{}\"", String::from_utf8_lossy(&b.borrow())),
        Value::Array(items) => {
            f.write_str("@[")?;
            for (i, item) in items.borrow().iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                repr(item, f, depth + 1)?;
            }
            f.write_str("]")
        }
        Value::Tuple(t) => {
            let (open, close) = if t.flag & Tuple::BRACKET != 0 { ("[", "]") } else { ("(", ")") };
            f.write_str(open)?;
            for (i, item) in t.items.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                repr(item, f, depth + 1)?;
            }
            f.write_str(close)
        }
        Value::Table(t) => {
            f.write_str("@{")?;
            for (i, (k, val)) in t.borrow().iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                repr(k, f, depth + 1)?;
                f.write_str(" ")?;
                repr(val, f, depth + 1)?;
            }
            f.write_str("}")
        }
        Value::Struct(s) => {
            f.write_str("{")?;
            for (i, (k, val)) in s.iter().enumerate() {
                if i > 0 {
                    f.write_str(" ")?;
                }
                repr(k, f, depth + 1)?;
                f.write_str(" ")?;
                repr(val, f, depth + 1)?;
            }
            f.write_str("}")
        }
        Value::Function(c) => match &c.def.name {
            Some(name) => write!(f, "<function {}>", String::from_utf8_lossy(name)),
            None => f.write_str("<function>"),
        },
        Value::Fiber(_) => f.write_str("<fiber>"),
        Value::CFunction(_) => f.write_str("<cfunction>"),
        Value::Abstract(a) => write!(f, "<{}>", a.type_name()),
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_flavors_distinct() {
        let s = Value::string("abc");
        let sym = Value::symbol("abc");
        let kw = Value::keyword("abc");
        assert_ne!(s, sym);
        assert_ne!(sym, kw);
        assert_eq!(s, Value::string("abc"));
    }

    #[test]
    fn test_mutable_identity_equality() {
        let a = Value::array(vec![Value::number(1.0)]);
        let b = Value::array(vec![Value::number(1.0)]);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_tuple_content_equality() {
        let a = Value::tuple(vec![Value::number(1.0), Value::string("x")]);
        let b = Value::tuple(vec![Value::number(1.0), Value::string("x")]);
        assert_eq!(a, b);
        assert_ne!(a, Value::bracket_tuple(vec![Value::number(1.0), Value::string("x")]));
    }

    #[test]
    fn test_struct_canonical_order() {
        let a = Value::struct_from_pairs(vec![
            (Value::keyword("a"), Value::number(1.0)),
            (Value::keyword("b"), Value::number(2.0)),
        ]);
        let b = Value::struct_from_pairs(vec![
            (Value::keyword("b"), Value::number(2.0)),
            (Value::keyword("a"), Value::number(1.0)),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_table_proto_lookup() {
        let base = Value::table_from_pairs(vec![(Value::keyword("x"), Value::number(1.0))]);
        let child = Value::table();
        if let (Value::Table(c), Value::Table(b)) = (&child, &base) {
            c.borrow_mut().proto = Some(b.clone());
        }
        assert_eq!(child.get_keyword("x"), Some(Value::number(1.0)));
        assert_eq!(child.get_keyword("y"), None);
    }

    #[test]
    fn test_nil_insert_removes() {
        let t = Value::table_from_pairs(vec![(Value::keyword("x"), Value::number(1.0))]);
        if let Value::Table(inner) = &t {
            inner.borrow_mut().insert(Value::keyword("x"), Value::Nil);
            assert!(inner.borrow().is_empty());
        }
    }

    #[test]
    fn test_type_masks() {
        assert_eq!(type_mask_from_name(b"number"), Some(TY_NUMBER));
        assert_eq!(type_mask_from_name(b"callable"), Some(TY_FUNCTION | TY_CFUNCTION));
        assert_eq!(type_mask_from_name(b"widget"), None);
        assert_eq!(Value::number(1.0).type_mask(), TY_NUMBER);
    }

    #[test]
    fn test_total_order_consistent_with_eq() {
        let a = Value::number(0.0);
        let b = Value::number(-0.0);
        assert_eq!(a, b);
        assert_eq!(a.total_cmp(&b), Ordering::Equal);
    }

    #[test]
    fn test_render_bytes() {
        let mut out = Vec::new();
        Value::string("ab").render_bytes(&mut out);
        Value::number(3.0).render_bytes(&mut out);
        Value::keyword("kw").render_bytes(&mut out);
        assert_eq!(out, b"ab3kw");
    }
}
