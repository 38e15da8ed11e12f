//! End-to-end PEG tests through the public compile/run surface.

use pretty_assertions::assert_eq;
use sable::{
    Value, exec,
    peg::{self, PegCompileError, PegMatchError},
};

fn kw(s: &str) -> Value {
    Value::keyword(s)
}

fn sym(s: &str) -> Value {
    Value::symbol(s)
}

fn num(n: f64) -> Value {
    Value::number(n)
}

fn form(parts: Vec<Value>) -> Value {
    Value::tuple(parts)
}

fn matches(pattern: &Value, text: &str) -> Option<Vec<Value>> {
    peg::run(pattern, text.as_bytes(), 0, &[]).unwrap()
}

/// `{main (some (range "09"))}`: digits match, letters do not.
#[test]
fn digit_grammar() {
    let grammar = Value::table_from_pairs(vec![(
        kw("main"),
        form(vec![sym("some"), form(vec![sym("range"), Value::string("09")])]),
    )]);
    assert!(matches(&grammar, "123abc").is_some());
    assert_eq!(matches(&grammar, "abc"), None);
}

/// Accumulated substitution over "banana" yields "bAnAnA".
#[test]
fn accumulate_substitution() {
    let pattern = form(vec![
        sym("accumulate"),
        form(vec![
            sym("some"),
            form(vec![
                sym("choice"),
                form(vec![sym("replace"), Value::string("a"), Value::string("A")]),
                form(vec![sym("capture"), num(1.0)]),
            ]),
        ]),
    ]);
    assert_eq!(matches(&pattern, "banana"), Some(vec![Value::string("bAnAnA")]));
}

/// Back-reference: `foo-foo` matches, `foo-bar` does not.
#[test]
fn backmatch_grammar() {
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
    assert!(matches(&grammar, "foo-foo").is_some());
    assert_eq!(matches(&grammar, "foo-bar"), None);
}

/// Compiled programs are plain values and can be rerun.
#[test]
fn compiled_program_reusable() {
    let program = peg::compile(&kw("d+")).unwrap();
    assert!(program.matches(b"42", 0, &[]).unwrap().is_some());
    assert!(program.matches(b"forty-two", 0, &[]).unwrap().is_none());

    let as_value = program.into_value();
    assert!(peg::run(&as_value, b"7", 0, &[]).unwrap().is_some());
}

/// Matching is a pure function of program, text, and extras.
#[test]
fn match_is_deterministic() {
    let grammar = Value::table_from_pairs(vec![(
        kw("main"),
        form(vec![
            sym("*"),
            form(vec![sym("capture"), kw("w+"), kw("word")]),
            form(vec![sym("any"), form(vec![sym("*"), kw("s+"), kw("main")])]),
        ]),
    )]);
    let program = peg::compile(&grammar).unwrap();
    let a = program.matches(b"lo rem ipsum", 0, &[]).unwrap();
    let b = program.matches(b"lo rem ipsum", 0, &[]).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.unwrap().len(), 3);
}

/// A 256th distinct tag is a compile error.
#[test]
fn tag_cap() {
    let mut parts = vec![sym("sequence")];
    for i in 0..=255 {
        parts.push(form(vec![sym("position"), kw(&format!("tag{i}"))]));
    }
    let err = peg::compile(&form(parts)).unwrap_err();
    assert!(matches!(err, PegCompileError::TooManyTags));
    assert_eq!(err.to_string(), "too many tags");
}

/// Replace callbacks may be assembled functions; they run on the
/// reference executor.
#[test]
fn replace_with_assembled_function() {
    let double = sable::assemble(&Value::table_from_pairs(vec![
        (kw("arity"), num(1.0)),
        (kw("slots"), Value::array(vec![sym("x"), sym("t")])),
        (
            kw("bytecode"),
            Value::array(vec![
                form(vec![sym("len"), sym("t"), sym("x")]),
                form(vec![sym("ret"), sym("t")]),
            ]),
        ),
    ]))
    .unwrap()
    .to_function();
    // Sanity: the callback itself works.
    assert_eq!(exec::call(&double, &[Value::string("abcd")]).unwrap(), num(4.0));

    let pattern = form(vec![
        sym("/"),
        form(vec![sym("capture"), form(vec![sym("some"), form(vec![sym("range"), Value::string("az")])])]),
        double,
    ]);
    assert_eq!(matches(&pattern, "hello"), Some(vec![num(5.0)]));
}

/// The error form raises the last capture as a match error.
#[test]
fn error_form_raises() {
    let pattern = form(vec![
        sym("error"),
        form(vec![sym("capture"), Value::string("nope")]),
    ]);
    let err = peg::run(&pattern, b"nope", 0, &[]).unwrap_err();
    let sable::Error::PegMatch(PegMatchError::UserError(raised)) = err else {
        panic!("expected a user error, got {err}");
    };
    assert_eq!(raised, Value::string("nope"));
}

/// Extras are visible through the argument form.
#[test]
fn argument_form_reads_extras() {
    let pattern = form(vec![
        sym("*"),
        Value::string("a"),
        form(vec![sym("argument"), num(0.0)]),
    ]);
    let caps = peg::run(&pattern, b"a", 0, &[Value::number(99.0)]).unwrap().unwrap();
    assert_eq!(caps, vec![num(99.0)]);
}

/// Grammar scopes chain: an inner grammar can reference rules from the
/// enclosing grammar.
#[test]
fn nested_grammar_scopes() {
    let grammar = Value::table_from_pairs(vec![
        (kw("digits"), form(vec![sym("some"), form(vec![sym("range"), Value::string("09")])])),
        (
            kw("main"),
            Value::struct_from_pairs(vec![(
                kw("main"),
                form(vec![sym("*"), Value::string("#"), kw("digits")]),
            )]),
        ),
    ]);
    assert!(matches(&grammar, "#123").is_some());
    assert_eq!(matches(&grammar, "#abc"), None);
}

/// Matching from a nonzero start offset.
#[test]
fn start_offset() {
    let program = peg::compile(&kw("d+")).unwrap();
    assert!(program.matches(b"ab12", 2, &[]).unwrap().is_some());
    assert!(program.matches(b"ab12", 0, &[]).unwrap().is_none());
    assert!(program.matches(b"ab12", 9, &[]).unwrap().is_none());
}

/// A pathological self-recursive rule fails with the depth budget, not a
/// stack overflow.
#[test]
fn left_recursion_hits_depth_budget() {
    let grammar = Value::table_from_pairs(vec![(
        kw("main"),
        form(vec![sym("*"), kw("main"), Value::string("x")]),
    )]);
    let program = peg::compile(&grammar).unwrap();
    let err = program.matches(b"xxx", 0, &[]).unwrap_err();
    assert!(matches!(err, PegMatchError::RecursedTooDeeply));
}
