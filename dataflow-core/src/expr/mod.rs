//! The embedded expression language.
//!
//! Used for autoscaling rules (`desiredReplicas`), message transforms (`map`),
//! predicates (`filter`), grouping keys and duration fields. The language is a
//! small, total expression grammar: literals, variables, arithmetic, string
//! ops, comparisons, boolean logic and a fixed set of builtin functions.

#[cfg(test)]
mod mod_test;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// A value produced or consumed by an expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Duration(Duration),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Duration(_) => "duration",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(val) => write!(f, "{}", val),
            Value::Bool(val) => write!(f, "{}", val),
            Value::Str(val) => write!(f, "{}", val),
            Value::Bytes(val) => write!(f, "{}", String::from_utf8_lossy(val)),
            Value::Duration(val) => write!(f, "{:?}", val),
        }
    }
}

/// The variable environment of an evaluation.
pub type Env = BTreeMap<String, Value>;

/// Evaluate the given expression within the given environment.
pub fn eval(input: &str, env: &Env) -> Result<Value> {
    let tokens = lex(input).with_context(|| format!("error tokenizing expression {:?}", input))?;
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.parse_expr(0).with_context(|| format!("error parsing expression {:?}", input))?;
    if parser.pos != parser.tokens.len() {
        bail!("unexpected trailing input in expression {:?}", input);
    }
    eval_node(&node, env).with_context(|| format!("error evaluating expression {:?}", input))
}

/// Evaluate the given expression, requiring an integer result.
pub fn eval_int(input: &str, env: &Env) -> Result<i64> {
    match eval(input, env)? {
        Value::Int(val) => Ok(val),
        other => bail!("expression {:?} must evaluate to an int, got {}", input, other.type_name()),
    }
}

/// Evaluate the given expression, requiring a boolean result.
pub fn eval_bool(input: &str, env: &Env) -> Result<bool> {
    match eval(input, env)? {
        Value::Bool(val) => Ok(val),
        other => bail!("expression {:?} must evaluate to a bool, got {}", input, other.type_name()),
    }
}

/// Evaluate the given expression, requiring a string result.
pub fn eval_str(input: &str, env: &Env) -> Result<String> {
    match eval(input, env)? {
        Value::Str(val) => Ok(val),
        other => bail!("expression {:?} must evaluate to a string, got {}", input, other.type_name()),
    }
}

/// Evaluate the given expression, requiring bytes; strings coerce.
pub fn eval_bytes(input: &str, env: &Env) -> Result<Vec<u8>> {
    match eval(input, env)? {
        Value::Bytes(val) => Ok(val),
        Value::Str(val) => Ok(val.into_bytes()),
        other => bail!("expression {:?} must evaluate to bytes, got {}", input, other.type_name()),
    }
}

/// Evaluate the given expression as a duration; strings are parsed as duration literals.
pub fn eval_duration(input: &str, env: &Env) -> Result<Duration> {
    match eval(input, env)? {
        Value::Duration(val) => Ok(val),
        Value::Str(val) => parse_duration(&val),
        other => bail!("expression {:?} must evaluate to a duration, got {}", input, other.type_name()),
    }
}

/// Parse a duration literal such as `100ms`, `90s` or `1m30s`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let mut total = Duration::from_secs(0);
    let mut chars = input.chars().peekable();
    let mut matched = false;
    while chars.peek().is_some() {
        let mut num = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_digit() {
                num.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(*c);
                chars.next();
            } else {
                break;
            }
        }
        if num.is_empty() || unit.is_empty() {
            bail!("invalid duration literal {:?}", input);
        }
        let num: u64 = num.parse().with_context(|| format!("invalid duration literal {:?}", input))?;
        total += match unit.as_str() {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num * 60),
            "h" => Duration::from_secs(num * 60 * 60),
            _ => bail!("unknown duration unit {:?} in {:?}", unit, input),
        };
        matched = true;
    }
    if !matched {
        bail!("empty duration literal");
    }
    Ok(total)
}

//////////////////////////////////////////////////////////////////////////////
// Lexer /////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Dur(Duration),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut val = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => val.push('\n'),
                            Some('t') => val.push('\t'),
                            Some(c) => val.push(c),
                            None => bail!("unterminated string literal"),
                        },
                        Some(c) => val.push(c),
                        None => bail!("unterminated string literal"),
                    }
                }
                tokens.push(Token::Str(val));
            }
            c if c.is_ascii_digit() => {
                let mut num = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_digit() {
                        num.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // A trailing unit makes this a duration literal, which may chain (`1m30s`).
                if chars.peek().map(|c| c.is_ascii_alphabetic()).unwrap_or(false) {
                    let mut lit = num;
                    while let Some(c) = chars.peek() {
                        if c.is_ascii_alphanumeric() {
                            lit.push(*c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    tokens.push(Token::Dur(parse_duration(&lit)?));
                } else {
                    tokens.push(Token::Int(num.parse().context("invalid integer literal")?));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        ident.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" => tokens.push(Token::Ident("true".into())),
                    "false" => tokens.push(Token::Ident("false".into())),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            _ => {
                let op = lex_op(&mut chars)?;
                tokens.push(Token::Op(op));
            }
        }
    }
    Ok(tokens)
}

fn lex_op(chars: &mut std::iter::Peekable<std::str::Chars>) -> Result<&'static str> {
    let first = match chars.next() {
        Some(first) => first,
        None => bail!("unexpected end of input"),
    };
    let second = chars.peek().copied();
    let two = |chars: &mut std::iter::Peekable<std::str::Chars>, op| {
        chars.next();
        Ok(op)
    };
    match (first, second) {
        ('=', Some('=')) => two(chars, "=="),
        ('!', Some('=')) => two(chars, "!="),
        ('<', Some('=')) => two(chars, "<="),
        ('>', Some('=')) => two(chars, ">="),
        ('&', Some('&')) => two(chars, "&&"),
        ('|', Some('|')) => two(chars, "||"),
        ('<', _) => Ok("<"),
        ('>', _) => Ok(">"),
        ('+', _) => Ok("+"),
        ('-', _) => Ok("-"),
        ('*', _) => Ok("*"),
        ('/', _) => Ok("/"),
        ('%', _) => Ok("%"),
        ('!', _) => Ok("!"),
        (c, _) => bail!("unexpected character {:?}", c),
    }
}

//////////////////////////////////////////////////////////////////////////////
// Parser ////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
enum Node {
    Lit(Value),
    Var(String),
    Unary(&'static str, Box<Node>),
    Binary(&'static str, Box<Node>, Box<Node>),
    Call(String, Vec<Node>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn binding_power(op: &str) -> Option<(u8, u8)> {
    match op {
        "||" => Some((1, 2)),
        "&&" => Some((3, 4)),
        "==" | "!=" | "<" | "<=" | ">" | ">=" => Some((5, 6)),
        "+" | "-" => Some((7, 8)),
        "*" | "/" | "%" => Some((9, 10)),
        _ => None,
    }
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.next() {
            Some(token) if &token == expected => Ok(()),
            other => bail!("expected {:?}, got {:?}", expected, other),
        }
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Node> {
        let mut lhs = match self.next() {
            Some(Token::Int(val)) => Node::Lit(Value::Int(val)),
            Some(Token::Str(val)) => Node::Lit(Value::Str(val)),
            Some(Token::Dur(val)) => Node::Lit(Value::Duration(val)),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Node::Lit(Value::Bool(true)),
                "false" => Node::Lit(Value::Bool(false)),
                _ => {
                    if self.peek() == Some(&Token::LParen) {
                        self.next();
                        let mut args = vec![];
                        if self.peek() != Some(&Token::RParen) {
                            loop {
                                args.push(self.parse_expr(0)?);
                                match self.peek() {
                                    Some(Token::Comma) => {
                                        self.next();
                                    }
                                    _ => break,
                                }
                            }
                        }
                        self.expect(&Token::RParen)?;
                        Node::Call(ident, args)
                    } else {
                        Node::Var(ident)
                    }
                }
            },
            Some(Token::LParen) => {
                let node = self.parse_expr(0)?;
                self.expect(&Token::RParen)?;
                node
            }
            Some(Token::Op("-")) => Node::Unary("-", Box::new(self.parse_expr(11)?)),
            Some(Token::Op("!")) => Node::Unary("!", Box::new(self.parse_expr(11)?)),
            other => bail!("unexpected token {:?}", other),
        };

        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let (l_bp, r_bp) = match binding_power(op) {
                Some(bp) => bp,
                None => bail!("unexpected operator {:?}", op),
            };
            if l_bp < min_bp {
                break;
            }
            self.next();
            let rhs = self.parse_expr(r_bp)?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }
}

//////////////////////////////////////////////////////////////////////////////
// Evaluation ////////////////////////////////////////////////////////////////

fn eval_node(node: &Node, env: &Env) -> Result<Value> {
    match node {
        Node::Lit(val) => Ok(val.clone()),
        Node::Var(name) => env.get(name).cloned().with_context(|| format!("unknown variable {:?}", name)),
        Node::Unary(op, operand) => {
            let val = eval_node(operand, env)?;
            match (*op, val) {
                ("-", Value::Int(val)) => Ok(Value::Int(-val)),
                ("!", Value::Bool(val)) => Ok(Value::Bool(!val)),
                (op, val) => bail!("operator {:?} is not defined for {}", op, val.type_name()),
            }
        }
        Node::Binary(op, lhs, rhs) => {
            // Short-circuit boolean operators before evaluating the right side.
            if *op == "&&" || *op == "||" {
                let lhs = match eval_node(lhs, env)? {
                    Value::Bool(val) => val,
                    other => bail!("operator {:?} is not defined for {}", op, other.type_name()),
                };
                if (*op == "&&" && !lhs) || (*op == "||" && lhs) {
                    return Ok(Value::Bool(lhs));
                }
                return match eval_node(rhs, env)? {
                    Value::Bool(val) => Ok(Value::Bool(val)),
                    other => bail!("operator {:?} is not defined for {}", op, other.type_name()),
                };
            }
            let (lhs, rhs) = (eval_node(lhs, env)?, eval_node(rhs, env)?);
            eval_binary(op, lhs, rhs)
        }
        Node::Call(name, args) => {
            let args = args.iter().map(|arg| eval_node(arg, env)).collect::<Result<Vec<_>>>()?;
            eval_call(name, args)
        }
    }
}

fn eval_binary(op: &str, lhs: Value, rhs: Value) -> Result<Value> {
    use Value::*;
    match (op, lhs, rhs) {
        ("+", Int(a), Int(b)) => Ok(Int(a + b)),
        ("-", Int(a), Int(b)) => Ok(Int(a - b)),
        ("*", Int(a), Int(b)) => Ok(Int(a * b)),
        ("/", Int(a), Int(b)) => {
            if b == 0 {
                bail!("division by zero");
            }
            Ok(Int(a / b))
        }
        ("%", Int(a), Int(b)) => {
            if b == 0 {
                bail!("modulo by zero");
            }
            Ok(Int(a % b))
        }
        ("+", Str(a), Str(b)) => Ok(Str(a + &b)),
        ("+", Bytes(mut a), Bytes(b)) => {
            a.extend(b);
            Ok(Bytes(a))
        }
        ("==", a, b) => Ok(Bool(a == b)),
        ("!=", a, b) => Ok(Bool(a != b)),
        ("<", Int(a), Int(b)) => Ok(Bool(a < b)),
        ("<=", Int(a), Int(b)) => Ok(Bool(a <= b)),
        (">", Int(a), Int(b)) => Ok(Bool(a > b)),
        (">=", Int(a), Int(b)) => Ok(Bool(a >= b)),
        ("<", Str(a), Str(b)) => Ok(Bool(a < b)),
        ("<=", Str(a), Str(b)) => Ok(Bool(a <= b)),
        (">", Str(a), Str(b)) => Ok(Bool(a > b)),
        (">=", Str(a), Str(b)) => Ok(Bool(a >= b)),
        (op, lhs, rhs) => bail!("operator {:?} is not defined for ({}, {})", op, lhs.type_name(), rhs.type_name()),
    }
}

fn eval_call(name: &str, mut args: Vec<Value>) -> Result<Value> {
    match (name, args.len()) {
        ("string", 1) => match args.remove(0) {
            Value::Str(val) => Ok(Value::Str(val)),
            Value::Bytes(val) => Ok(Value::Str(String::from_utf8(val).context("bytes are not valid UTF-8")?)),
            Value::Int(val) => Ok(Value::Str(val.to_string())),
            Value::Bool(val) => Ok(Value::Str(val.to_string())),
            other => bail!("string() is not defined for {}", other.type_name()),
        },
        ("bytes", 1) => match args.remove(0) {
            Value::Bytes(val) => Ok(Value::Bytes(val)),
            Value::Str(val) => Ok(Value::Bytes(val.into_bytes())),
            other => bail!("bytes() is not defined for {}", other.type_name()),
        },
        ("int", 1) => match args.remove(0) {
            Value::Int(val) => Ok(Value::Int(val)),
            Value::Str(val) => Ok(Value::Int(val.trim().parse().with_context(|| format!("int() could not parse {:?}", val))?)),
            other => bail!("int() is not defined for {}", other.type_name()),
        },
        ("minmax", 3) => {
            let (lo, hi, x) = (args.remove(0), args.remove(0), args.remove(0));
            match (lo, hi, x) {
                (Value::Int(lo), Value::Int(hi), Value::Int(x)) => Ok(Value::Int(x.max(lo).min(hi))),
                (lo, hi, x) => bail!("minmax() is not defined for ({}, {}, {})", lo.type_name(), hi.type_name(), x.type_name()),
            }
        }
        ("sha256", 1) => {
            let data = match args.remove(0) {
                Value::Bytes(val) => val,
                Value::Str(val) => val.into_bytes(),
                other => bail!("sha256() is not defined for {}", other.type_name()),
            };
            Ok(Value::Str(hex::encode(Sha256::digest(&data))))
        }
        (name, arity) => bail!("unknown function {}/{}", name, arity),
    }
}
