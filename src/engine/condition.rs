//! Stage condition expressions.
//!
//! A small boolean language evaluated without any host-language `eval`:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ( "==" | "!=" ) primary )?
//! primary := string | number | true | false | path | "(" expr ")"
//! path    := ident ( "." ident )*
//! ```
//!
//! `env.NAME` reads a pipeline variable, `execution.FIELD` reads the running
//! execution (`id`, `pipeline_id`, `triggered_by`). A bare name is an env
//! variable. Missing variables are null, which is falsy.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConditionError {
    #[error("Invalid condition at position {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("Unknown variable scope '{0}' (expected env or execution)")]
    UnknownScope(String),
    #[error("Unknown execution field '{0}'")]
    UnknownField(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false" && s != "0",
            Value::Null => false,
        }
    }

    fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Num(n), Value::Str(s)) | (Value::Str(s), Value::Num(n)) => {
                s.trim().parse::<f64>().map(|v| v == *n).unwrap_or(false)
            }
            (Value::Bool(b), Value::Str(s)) | (Value::Str(s), Value::Bool(b)) => {
                s == if *b { "true" } else { "false" }
            }
            _ => false,
        }
    }
}

/// Variables visible to a condition
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    pub env: BTreeMap<String, String>,
    pub execution: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Ident(String),
    Dot,
    Not,
    And,
    Or,
    EqEq,
    NotEq,
    LParen,
    RParen,
}

fn parse_error(position: usize, message: impl Into<String>) -> ConditionError {
    ConditionError::Parse {
        position,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ConditionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '.' => {
                tokens.push((start, Token::Dot));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push((start, Token::NotEq));
                i += 2;
            }
            '!' => {
                tokens.push((start, Token::Not));
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push((start, Token::EqEq));
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push((start, Token::And));
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push((start, Token::Or));
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(parse_error(start, "unterminated string")),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some(escaped) => value.push(*escaped),
                                None => return Err(parse_error(start, "unterminated string")),
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).map(|d| d.is_ascii_digit()).unwrap_or(false)) =>
            {
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(start, format!("invalid number '{}'", text)))?;
                tokens.push((start, Token::Num(number)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
            }
            other => return Err(parse_error(start, format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

/// Deepest expression tree a condition may build
const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    /// Position reported for errors at the end of input, in characters
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<(), ConditionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_error(
                self.position(),
                format!("expression nested deeper than {} levels", MAX_DEPTH),
            ));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ConditionError> {
        let entry = self.depth;
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            self.descend()?;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let entry = self.depth;
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            self.descend()?;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth = entry;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ConditionError> {
        if self.eat(&Token::Not) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, ConditionError> {
        let left = self.primary()?;
        if self.eat(&Token::EqEq) {
            let right = self.primary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::NotEq) {
            let right = self.primary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        let position = self.position();
        let token = self
            .tokens
            .get(self.pos)
            .map(|(_, t)| t.clone())
            .ok_or_else(|| parse_error(position, "unexpected end of expression"))?;
        self.pos += 1;

        match token {
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::Num(n) => Ok(Expr::Literal(Value::Num(n))),
            Token::LParen => {
                self.descend()?;
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err(parse_error(self.position(), "expected ')'"));
                }
                self.depth -= 1;
                Ok(inner)
            }
            Token::Ident(name) if name == "true" => Ok(Expr::Literal(Value::Bool(true))),
            Token::Ident(name) if name == "false" => Ok(Expr::Literal(Value::Bool(false))),
            Token::Ident(name) if name == "null" => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                let mut path = vec![name];
                while self.eat(&Token::Dot) {
                    let position = self.position();
                    match self.tokens.get(self.pos).map(|(_, t)| t.clone()) {
                        Some(Token::Ident(segment)) => {
                            path.push(segment);
                            self.pos += 1;
                        }
                        _ => return Err(parse_error(position, "expected a name after '.'")),
                    }
                }
                Ok(Expr::Var(path))
            }
            other => Err(parse_error(position, format!("unexpected token {:?}", other))),
        }
    }
}

/// Parse a condition into an expression tree
pub fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(parse_error(0, "empty condition"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.chars().count(),
        depth: 0,
    };
    let expr = parser.or()?;
    if parser.pos < parser.tokens.len() {
        return Err(parse_error(parser.position(), "unexpected trailing input"));
    }
    Ok(expr)
}

impl Expr {
    pub fn evaluate(&self, ctx: &ConditionContext) -> Result<Value, ConditionError> {
        Ok(match self {
            Expr::Literal(v) => v.clone(),
            Expr::Var(path) => resolve(path, ctx)?,
            Expr::Not(inner) => Value::Bool(!inner.evaluate(ctx)?.truthy()),
            Expr::And(l, r) => {
                Value::Bool(l.evaluate(ctx)?.truthy() && r.evaluate(ctx)?.truthy())
            }
            Expr::Or(l, r) => {
                Value::Bool(l.evaluate(ctx)?.truthy() || r.evaluate(ctx)?.truthy())
            }
            Expr::Eq(l, r) => Value::Bool(l.evaluate(ctx)?.loose_eq(&r.evaluate(ctx)?)),
            Expr::Ne(l, r) => Value::Bool(!l.evaluate(ctx)?.loose_eq(&r.evaluate(ctx)?)),
        })
    }
}

fn lookup(map: &BTreeMap<String, String>, key: &str) -> Value {
    map.get(key).cloned().map(Value::Str).unwrap_or(Value::Null)
}

fn resolve(path: &[String], ctx: &ConditionContext) -> Result<Value, ConditionError> {
    match path {
        [name] => Ok(lookup(&ctx.env, name)),
        [scope, name] if scope == "env" => Ok(lookup(&ctx.env, name)),
        [scope, field] if scope == "execution" => match field.as_str() {
            "id" | "pipeline_id" | "triggered_by" => Ok(lookup(&ctx.execution, field)),
            _ => Err(ConditionError::UnknownField(field.clone())),
        },
        _ => Err(ConditionError::UnknownScope(path.join("."))),
    }
}

/// Parse and evaluate in one step
pub fn evaluate(input: &str, ctx: &ConditionContext) -> Result<bool, ConditionError> {
    Ok(parse(input)?.evaluate(ctx)?.truthy())
}
