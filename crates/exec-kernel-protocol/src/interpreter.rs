//! A minimal real interpreter for `execute_request` payloads (§4.4).
//!
//! The distilled spec treats the execution kernel itself as an opaque
//! external collaborator; this is the smallest language that makes `execute`
//! genuinely round-trip end to end without depending on one. One statement
//! per line: `name = <expr>` assigns, `print(<expr>)` appends a line to the
//! output. Expressions are `+ - * /` over integers and string literals, plus
//! bare identifiers.

use std::collections::HashMap;

use crate::ExecKernelError;

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Str(String),
}

impl Value {
    fn display(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}

#[derive(Default)]
pub struct Interpreter {
    vars: HashMap<String, Value>,
}

impl Interpreter {
    pub fn new() -> Self {
        Interpreter::default()
    }

    /// Run `code`, one statement per line, returning every `print`ed line in order.
    pub fn run(&mut self, code: &str) -> Result<Vec<String>, ExecKernelError> {
        let mut output = Vec::new();
        for raw_line in code.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(inner) = line.strip_prefix("print(").and_then(|s| s.strip_suffix(')')) {
                let value = self.eval(inner)?;
                output.push(value.display());
            } else if let Some((name, expr)) = line.split_once('=') {
                let name = name.trim();
                if !is_identifier(name) {
                    return Err(bad_statement(line));
                }
                let value = self.eval(expr.trim())?;
                self.vars.insert(name.to_owned(), value);
            } else {
                return Err(bad_statement(line));
            }
        }
        Ok(output)
    }

    fn eval(&self, expr: &str) -> Result<Value, ExecKernelError> {
        Parser::new(expr, &self.vars).parse_expr()
    }
}

fn bad_statement(line: &str) -> ExecKernelError {
    ExecKernelError::Malformed(format!("unrecognized statement: {line}"))
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    vars: &'a HashMap<String, Value>,
}

impl<'a> Parser<'a> {
    fn new(expr: &'a str, vars: &'a HashMap<String, Value>) -> Self {
        Parser {
            chars: expr.chars().peekable(),
            vars,
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn parse_expr(&mut self) -> Result<Value, ExecKernelError> {
        let mut acc = self.parse_term()?;
        loop {
            self.skip_ws();
            match self.chars.peek() {
                Some('+') => {
                    self.chars.next();
                    let rhs = self.parse_term()?;
                    acc = add(acc, rhs)?;
                }
                Some('-') => {
                    self.chars.next();
                    let rhs = self.parse_term()?;
                    acc = sub(acc, rhs)?;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn parse_term(&mut self) -> Result<Value, ExecKernelError> {
        let mut acc = self.parse_factor()?;
        loop {
            self.skip_ws();
            match self.chars.peek() {
                Some('*') => {
                    self.chars.next();
                    let rhs = self.parse_factor()?;
                    acc = mul(acc, rhs)?;
                }
                Some('/') => {
                    self.chars.next();
                    let rhs = self.parse_factor()?;
                    acc = div(acc, rhs)?;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    fn parse_factor(&mut self) -> Result<Value, ExecKernelError> {
        self.skip_ws();
        match self.chars.peek().copied() {
            Some('(') => {
                self.chars.next();
                let v = self.parse_expr()?;
                self.skip_ws();
                if self.chars.next() != Some(')') {
                    return Err(ExecKernelError::Malformed("unclosed '('".into()));
                }
                Ok(v)
            }
            Some('\'') | Some('"') => {
                let quote = self.chars.next().unwrap();
                let mut s = String::new();
                for c in self.chars.by_ref() {
                    if c == quote {
                        return Ok(Value::Str(s));
                    }
                    s.push(c);
                }
                Err(ExecKernelError::Malformed("unterminated string literal".into()))
            }
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
                    digits.push(self.chars.next().unwrap());
                }
                digits
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| ExecKernelError::Malformed(format!("bad integer literal: {digits}")))
            }
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while matches!(self.chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                    name.push(self.chars.next().unwrap());
                }
                self.vars
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ExecKernelError::Malformed(format!("undefined variable: {name}")))
            }
            _ => Err(ExecKernelError::Malformed("expected an expression".into())),
        }
    }
}

fn add(a: Value, b: Value) -> Result<Value, ExecKernelError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x + y)),
        (Value::Str(x), Value::Str(y)) => Ok(Value::Str(x + &y)),
        _ => Err(ExecKernelError::Malformed("type mismatch in '+'".into())),
    }
}

fn sub(a: Value, b: Value) -> Result<Value, ExecKernelError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x - y)),
        _ => Err(ExecKernelError::Malformed("type mismatch in '-'".into())),
    }
}

fn mul(a: Value, b: Value) -> Result<Value, ExecKernelError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x * y)),
        _ => Err(ExecKernelError::Malformed("type mismatch in '*'".into())),
    }
}

fn div(a: Value, b: Value) -> Result<Value, ExecKernelError> {
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(ExecKernelError::Malformed("division by zero".into())),
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x / y)),
        _ => Err(ExecKernelError::Malformed("type mismatch in '/'".into())),
    }
}
