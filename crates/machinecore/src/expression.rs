//! Guard expression evaluator.
//!
//! Expressions are evaluated against a read-only [`EvalContext`]. Identifiers
//! may be dotted (`Config.retries`, `payload.items.0`); the longest key
//! present in the context wins and the remainder walks into nested objects.

use crate::{ExpressionError, Value};
use std::collections::BTreeMap;

/// Read-only attribute scope for expression evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalContext {
    values: BTreeMap<String, Value>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert every entry of an object, optionally under `prefix.`.
    pub fn extend_object(&mut self, prefix: Option<&str>, object: &BTreeMap<String, Value>) {
        for (key, value) in object {
            let key = match prefix {
                Some(prefix) => format!("{}.{}", prefix, key),
                None => key.clone(),
            };
            self.values.insert(key, value.clone());
        }
    }

    pub fn resolve(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.values.get(path) {
            return Some(value);
        }
        let segments: Vec<&str> = path.split('.').collect();
        for split in (1..segments.len()).rev() {
            let head = segments[..split].join(".");
            if let Some(value) = self.values.get(&head) {
                return value.get_path(&segments[split..]);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Contains => "contains",
            BinaryOp::In => "in",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }

    fn binding_power(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge
            | BinaryOp::Contains
            | BinaryOp::In => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Array(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(BinaryOp),
    Not,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |position: usize, message: &str| ExpressionError::Parse {
        position,
        message: message.to_string(),
    };

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '(' => tokens.push((start, Token::LParen)),
            ')' => tokens.push((start, Token::RParen)),
            '[' => tokens.push((start, Token::LBracket)),
            ']' => tokens.push((start, Token::RBracket)),
            ',' => tokens.push((start, Token::Comma)),
            '+' => tokens.push((start, Token::Op(BinaryOp::Add))),
            '-' => tokens.push((start, Token::Minus)),
            '*' => tokens.push((start, Token::Op(BinaryOp::Mul))),
            '/' => tokens.push((start, Token::Op(BinaryOp::Div))),
            '%' => tokens.push((start, Token::Op(BinaryOp::Mod))),
            '!' | '=' | '<' | '>' | '&' | '|' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('!', Some('=')) => (Token::Op(BinaryOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    ('=', Some('=')) => (Token::Op(BinaryOp::Eq), 2),
                    ('<', Some('=')) => (Token::Op(BinaryOp::Le), 2),
                    ('<', _) => (Token::Op(BinaryOp::Lt), 1),
                    ('>', Some('=')) => (Token::Op(BinaryOp::Ge), 2),
                    ('>', _) => (Token::Op(BinaryOp::Gt), 1),
                    ('&', Some('&')) => (Token::Op(BinaryOp::And), 2),
                    ('|', Some('|')) => (Token::Op(BinaryOp::Or), 2),
                    _ => return Err(err(start, &format!("unexpected '{}'", c))),
                };
                tokens.push((start, token));
                i += width;
                continue;
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err(start, "unterminated string")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => break,
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Str(text)));
            }
            c if c.is_ascii_digit() => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| err(start, &format!("invalid number '{}'", literal)))?;
                tokens.push((start, Token::Number(number)));
                continue;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' || chars[i] == '$')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::Op(BinaryOp::And),
                    "or" => Token::Op(BinaryOp::Or),
                    "not" => Token::Not,
                    "contains" => Token::Op(BinaryOp::Contains),
                    "in" => Token::Op(BinaryOp::In),
                    _ => Token::Ident(word),
                };
                tokens.push((start, token));
                continue;
            }
            other => return Err(err(start, &format!("unexpected '{}'", other))),
        }
        i += 1;
    }
    Ok(tokens)
}

/// Deepest nesting of operators, groups and arrays a guard may use.
pub const MAX_DEPTH: usize = 128;

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
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

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Parse {
            position: self.position(),
            message: message.into(),
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("nested deeper than {} levels", MAX_DEPTH)));
        }
        Ok(())
    }

    fn expect(&mut self, expected: Token) -> Result<(), ExpressionError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", expected)))
        }
    }

    fn expression(&mut self, min_power: u8) -> Result<Expr, ExpressionError> {
        let mut left = self.unary()?;
        let mut folds = 0;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => *op,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            let power = op.binding_power();
            if power < min_power {
                break;
            }
            self.pos += 1;
            // Each fold nests the left operand one level deeper.
            self.enter()?;
            folds += 1;
            let right = self.expression(power + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        self.depth -= folds;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        match self.peek() {
            Some(Token::Not) => self.prefixed(UnaryOp::Not),
            Some(Token::Minus) => self.prefixed(UnaryOp::Neg),
            _ => self.primary(),
        }
    }

    fn prefixed(&mut self, op: UnaryOp) -> Result<Expr, ExpressionError> {
        self.pos += 1;
        self.enter()?;
        let operand = self.unary()?;
        self.depth -= 1;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn primary(&mut self) -> Result<Expr, ExpressionError> {
        let position = self.position();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Ident(word),
            }),
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.expression(0)?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.enter()?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.expression(0)?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                self.depth -= 1;
                Ok(Expr::Array(items))
            }
            Some(other) => Err(ExpressionError::Parse {
                position,
                message: format!("unexpected token {:?}", other),
            }),
            None => Err(ExpressionError::Parse {
                position,
                message: "unexpected end of expression".to_string(),
            }),
        }
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ExpressionError::Parse {
                position: 0,
                message: "empty expression".to_string(),
            });
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let ast = parser.expression(0)?;
        if parser.peek().is_some() {
            return Err(parser.error("trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Value, ExpressionError> {
        eval(&self.ast, ctx)
    }
}

pub fn evaluate(source: &str, ctx: &EvalContext) -> Result<Value, ExpressionError> {
    Expression::parse(source)?.evaluate(ctx)
}

/// Evaluate an expression and reduce it to a boolean by truthiness.
pub fn evaluate_guard(source: &str, ctx: &EvalContext) -> Result<bool, ExpressionError> {
    Ok(evaluate(source, ctx)?.is_truthy())
}

fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => ctx
            .resolve(name)
            .cloned()
            .ok_or_else(|| ExpressionError::UnknownAttribute(name.clone())),
        Expr::Array(items) => Ok(Value::Array(
            items.iter().map(|e| eval(e, ctx)).collect::<Result<_, _>>()?,
        )),
        Expr::Unary(UnaryOp::Not, inner) => Ok(Value::Bool(!eval(inner, ctx)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, inner) => match eval(inner, ctx)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(ExpressionError::TypeMismatch {
                op: "-".to_string(),
                left: "nothing".to_string(),
                right: other.type_name().to_string(),
            }),
        },
        Expr::Binary(BinaryOp::And, left, right) => {
            if !eval(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(right, ctx)?.is_truthy()))
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            if eval(left, ctx)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(right, ctx)?.is_truthy()))
        }
        Expr::Binary(op, left, right) => binary(*op, eval(left, ctx)?, eval(right, ctx)?),
    }
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> ExpressionError {
    ExpressionError::TypeMismatch {
        op: op.symbol().to_string(),
        left: left.type_name().to_string(),
        right: right.type_name().to_string(),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExpressionError> {
    use std::cmp::Ordering;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Ne => Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| mismatch(op, &left, &right))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Contains => contains(&left, &right).ok_or_else(|| mismatch(op, &left, &right)),
        BinaryOp::In => contains(&right, &left).ok_or_else(|| mismatch(op, &left, &right)),
        BinaryOp::Add => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(_), _) | (_, Value::String(_)) => {
                Ok(Value::String(format!("{}{}", left, right)))
            }
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            _ => Err(mismatch(op, &left, &right)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = match (&left, &right) {
                (Value::Number(a), Value::Number(b)) => (*a, *b),
                _ => return Err(mismatch(op, &left, &right)),
            };
            match op {
                BinaryOp::Sub => Ok(Value::Number(a - b)),
                BinaryOp::Mul => Ok(Value::Number(a * b)),
                _ if b == 0.0 => Err(ExpressionError::DivisionByZero),
                BinaryOp::Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a % b)),
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators handled in eval"),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Option<Value> {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => Some(Value::Bool(h.contains(n.as_str()))),
        (Value::Array(items), n) => Some(Value::Bool(items.contains(n))),
        (Value::Object(map), Value::String(key)) => Some(Value::Bool(map.contains_key(key))),
        _ => None,
    }
}
