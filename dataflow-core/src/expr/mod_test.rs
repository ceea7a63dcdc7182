use std::time::Duration;

use anyhow::Result;

use super::{eval, eval_bool, eval_bytes, eval_duration, eval_int, parse_duration, Env, Value};

fn env_with_msg(msg: &[u8]) -> Env {
    let mut env = Env::new();
    env.insert("msg".into(), Value::Bytes(msg.to_vec()));
    env
}

macro_rules! eval_test {
    ($name:ident, $input:literal, $env:expr, $expect:expr) => {
        #[test]
        fn $name() -> Result<()> {
            let output = eval($input, &$env)?;
            assert_eq!(output, $expect, "expression {:?} evaluated to unexpected value {:?}", $input, output);
            Ok(())
        }
    };
}

eval_test!(int_arithmetic, "1 + 2 * 3 - 4", Env::new(), Value::Int(3));
eval_test!(int_division, "7 / 2", Env::new(), Value::Int(3));
eval_test!(int_modulo, "7 % 2", Env::new(), Value::Int(1));
eval_test!(unary_negation, "-(1 + 2)", Env::new(), Value::Int(-3));
eval_test!(parens_override_precedence, "(1 + 2) * 3", Env::new(), Value::Int(9));
eval_test!(string_concat, "'hi! ' + 'there'", Env::new(), Value::Str("hi! there".into()));
eval_test!(string_eq, "'accept' == 'accept'", Env::new(), Value::Bool(true));
eval_test!(bool_and_or, "true && (false || true)", Env::new(), Value::Bool(true));
eval_test!(bool_not, "!false", Env::new(), Value::Bool(true));
eval_test!(comparison_chain, "1 < 2 && 2 <= 2 && 3 > 2 && 3 >= 3", Env::new(), Value::Bool(true));
eval_test!(minmax_clamps_high, "minmax(0, 4, 10)", Env::new(), Value::Int(4));
eval_test!(minmax_clamps_low, "minmax(2, 4, 1)", Env::new(), Value::Int(2));
eval_test!(minmax_passes_through, "minmax(0, 4, 3)", Env::new(), Value::Int(3));
eval_test!(duration_literal, "90s", Env::new(), Value::Duration(Duration::from_secs(90)));
eval_test!(
    map_expression,
    "bytes('hi! ' + string(msg))",
    env_with_msg(b"foo-bar"),
    Value::Bytes(b"hi! foo-bar".to_vec())
);
eval_test!(filter_accept, "string(msg) == 'accept'", env_with_msg(b"accept"), Value::Bool(true));
eval_test!(filter_deny, "string(msg) == 'accept'", env_with_msg(b"deny"), Value::Bool(false));

#[test]
fn short_circuit_skips_rhs_eval() -> Result<()> {
    // The right side references an unknown variable; it must not be evaluated.
    assert_eq!(eval("false && missing", &Env::new())?, Value::Bool(false));
    assert_eq!(eval("true || missing", &Env::new())?, Value::Bool(true));
    Ok(())
}

#[test]
fn autoscale_expression_uses_injected_vars() -> Result<()> {
    let mut env = Env::new();
    env.insert("c".into(), Value::Int(2));
    env.insert("P".into(), Value::Int(1000));
    env.insert("p".into(), Value::Int(50));
    let output = eval_int("minmax(0, 4, P / 250)", &env)?;
    assert_eq!(output, 4);
    Ok(())
}

#[test]
fn sha256_is_stable_hex() -> Result<()> {
    let a = eval("sha256(msg)", &env_with_msg(b"foo"))?;
    let b = eval("sha256('foo')", &Env::new())?;
    assert_eq!(a, b);
    match a {
        Value::Str(hex) => assert_eq!(hex.len(), 64, "expected a hex encoded sha256 digest, got {:?}", hex),
        other => panic!("expected a string digest, got {:?}", other),
    }
    Ok(())
}

#[test]
fn eval_bytes_coerces_strings() -> Result<()> {
    assert_eq!(eval_bytes("'abc'", &Env::new())?, b"abc".to_vec());
    Ok(())
}

#[test]
fn eval_bool_rejects_non_bool() {
    assert!(eval_bool("1 + 1", &Env::new()).is_err());
}

#[test]
fn unknown_variable_is_an_error() {
    assert!(eval("nope", &Env::new()).is_err());
}

#[test]
fn unknown_function_is_an_error() {
    assert!(eval("nope(1)", &Env::new()).is_err());
}

#[test]
fn division_by_zero_is_an_error() {
    assert!(eval("1 / 0", &Env::new()).is_err());
}

#[test]
fn trailing_input_is_an_error() {
    assert!(eval("1 2", &Env::new()).is_err());
}

#[test]
fn duration_literals_chain() -> Result<()> {
    assert_eq!(parse_duration("1m30s")?, Duration::from_secs(90));
    assert_eq!(parse_duration("100ms")?, Duration::from_millis(100));
    assert_eq!(parse_duration("2h")?, Duration::from_secs(7200));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10x").is_err());
    Ok(())
}

#[test]
fn duration_expressions_reference_defaults() -> Result<()> {
    let mut env = Env::new();
    env.insert("default_scaling_delay".into(), Value::Duration(Duration::from_secs(60)));
    assert_eq!(eval_duration("default_scaling_delay", &env)?, Duration::from_secs(60));
    assert_eq!(eval_duration("4m", &env)?, Duration::from_secs(240));
    assert_eq!(eval_duration("'30s'", &env)?, Duration::from_secs(30));
    Ok(())
}
