//! Recursion budgets shared by the subsystems.
//!
//! All three subsystems walk recursive structures (grammar expressions,
//! value graphs, call frames). Each walk carries one of these fixed budgets
//! so a hostile or accidental deep structure fails with a clean error
//! instead of overflowing the Rust call stack.

/// Default recursion budget for the PEG matcher, the marshaller and
/// unmarshaller, and the reference executor.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 1024;

/// Maximum prototype-chain length honored by table lookups.
///
/// Grammar scopes and registries chain through table prototypes; a cyclic
/// chain would otherwise loop forever.
pub const MAX_PROTO_DEPTH: usize = 200;

/// Maximum keyword-reference chain length in a PEG grammar.
///
/// A rule may be defined as another keyword; bounding the chain turns a
/// reference cycle into a compile error.
pub const MAX_REFERENCE_DEPTH: usize = 64;
