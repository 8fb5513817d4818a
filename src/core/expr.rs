// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Operand and directive expression parsing and evaluation.
//!
//! Expressions are immutable trees of numeric literals, symbol references,
//! and unary/binary operators. Evaluation is total over resolved symbols and
//! returns [`Eval::Deferred`] (not an error) when any referenced symbol has
//! no value yet; that outcome is what turns an operand into a late
//! immediate instead of failing the assembly.
//!
//! `Display` renders the canonical, fully parenthesized text form. The form
//! re-parses to a structurally equal tree, which both the object-file codec
//! and diagnostic messages rely on.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Complement,
}

impl UnaryOp {
    fn glyph(self) -> char {
        match self {
            Self::Minus => '-',
            Self::Complement => '~',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    ShiftLeft,
    ShiftRight,
    BitAnd,
    BitXor,
    BitOr,
}

impl BinaryOp {
    /// Binding strength; higher binds tighter. All operators are
    /// left-associative.
    fn level(self) -> u8 {
        match self {
            Self::BitOr => 0,
            Self::BitXor => 1,
            Self::BitAnd => 2,
            Self::ShiftLeft | Self::ShiftRight => 3,
            Self::Add | Self::Subtract => 4,
            Self::Multiply | Self::Divide | Self::Modulo => 5,
        }
    }

    fn glyph(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
            Self::ShiftLeft => "<<",
            Self::ShiftRight => ">>",
            Self::BitAnd => "&",
            Self::BitXor => "^",
            Self::BitOr => "|",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Number(i64),
    Symbol(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    /// Visit every symbol reference in the tree, left to right.
    pub fn for_each_symbol(&self, f: &mut impl FnMut(&str)) {
        match self {
            Self::Number(_) => {}
            Self::Symbol(name) => f(name),
            Self::Unary { operand, .. } => operand.for_each_symbol(f),
            Self::Binary { left, right, .. } => {
                left.for_each_symbol(f);
                right.for_each_symbol(f);
            }
        }
    }

    /// Referenced symbol names in first-appearance order, deduplicated.
    pub fn referenced_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        self.for_each_symbol(&mut |name| {
            if !out.iter().any(|n| n == name) {
                out.push(name.to_string());
            }
        });
        out
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Symbol(name) => write!(f, "{name}"),
            Self::Unary { op, operand } => write!(f, "{}({operand})", op.glyph()),
            Self::Binary { op, left, right } => {
                write!(f, "({left} {} {right})", op.glyph())
            }
        }
    }
}

/// Error from tokenizing or parsing expression text. `column` is 1-based
/// within the parsed fragment.
#[derive(Debug, Clone)]
pub struct ExprError {
    pub message: String,
    pub column: usize,
}

impl ExprError {
    fn new(message: impl Into<String>, column: usize) -> Self {
        Self {
            message: message.into(),
            column,
        }
    }
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExprError {}

/// Error from evaluating a fully resolved expression.
#[derive(Debug, Clone)]
pub struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for EvalError {}

/// Evaluation outcome for an expression that produced no error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eval {
    Resolved(i64),
    /// At least one referenced symbol has no value yet.
    Deferred,
}

/// Evaluate an expression against a symbol lookup.
pub fn evaluate<F>(expr: &Expr, lookup: &F) -> Result<Eval, EvalError>
where
    F: Fn(&str) -> Option<i64>,
{
    match expr {
        Expr::Number(value) => Ok(Eval::Resolved(*value)),
        Expr::Symbol(name) => match lookup(name) {
            Some(value) => Ok(Eval::Resolved(value)),
            None => Ok(Eval::Deferred),
        },
        Expr::Unary { op, operand } => match evaluate(operand, lookup)? {
            Eval::Resolved(value) => Ok(Eval::Resolved(apply_unary(*op, value))),
            Eval::Deferred => Ok(Eval::Deferred),
        },
        Expr::Binary { op, left, right } => {
            let l = evaluate(left, lookup)?;
            let r = evaluate(right, lookup)?;
            match (l, r) {
                (Eval::Resolved(l), Eval::Resolved(r)) => {
                    apply_binary(*op, l, r).map(Eval::Resolved)
                }
                _ => Ok(Eval::Deferred),
            }
        }
    }
}

fn apply_unary(op: UnaryOp, value: i64) -> i64 {
    match op {
        UnaryOp::Minus => value.wrapping_neg(),
        UnaryOp::Complement => !value,
    }
}

fn apply_binary(op: BinaryOp, l: i64, r: i64) -> Result<i64, EvalError> {
    Ok(match op {
        BinaryOp::Add => l.wrapping_add(r),
        BinaryOp::Subtract => l.wrapping_sub(r),
        BinaryOp::Multiply => l.wrapping_mul(r),
        BinaryOp::Divide => {
            if r == 0 {
                return Err(EvalError::new("Division by zero"));
            }
            l.wrapping_div(r)
        }
        BinaryOp::Modulo => {
            if r == 0 {
                return Err(EvalError::new("Modulo by zero"));
            }
            l.wrapping_rem(r)
        }
        // Shift amounts are masked to the 64-bit value domain.
        BinaryOp::ShiftLeft => l.wrapping_shl((r & 0x3f) as u32),
        BinaryOp::ShiftRight => ((l as u64).wrapping_shr((r & 0x3f) as u32)) as i64,
        BinaryOp::BitAnd => l & r,
        BinaryOp::BitXor => l ^ r,
        BinaryOp::BitOr => l | r,
    })
}

/// Parse a number literal (decimal, hex, binary, octal).
///
/// Supported notations:
/// - Decimal: `42`, `42d`
/// - Hex: `0x2A`, `$2A`, `2Ah`
/// - Binary: `0b101010`, `101010b`, `%101010`
/// - Octal: `0o52`, `52o`, `52q`
///
/// Underscores are visual separators and are stripped first.
pub fn parse_number(text: &str) -> Option<i64> {
    let text: String = text.chars().filter(|&c| c != '_').collect();
    let text = text.as_str();
    if text.is_empty() {
        return None;
    }

    // Prefix notations win over suffix heuristics so that a prefixed
    // literal like $BB is never taken for a binary-suffixed one.
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(oct) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        return i64::from_str_radix(oct, 8).ok();
    }
    if let Some(hex) = text.strip_prefix('$') {
        return i64::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = text.strip_prefix('%') {
        return i64::from_str_radix(bin, 2).ok();
    }
    if let Some(bin) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        if !bin.is_empty() && bin.bytes().all(|b| b == b'0' || b == b'1') {
            return i64::from_str_radix(bin, 2).ok();
        }
        // Fall through: `0B8H` is a hex literal with a suffix, not binary.
    }
    if text.ends_with('h') || text.ends_with('H') {
        return i64::from_str_radix(&text[..text.len() - 1], 16).ok();
    }
    if text.ends_with('b') || text.ends_with('B') {
        let inner = &text[..text.len() - 1];
        if !inner.is_empty() && inner.bytes().all(|b| b == b'0' || b == b'1') {
            return i64::from_str_radix(inner, 2).ok();
        }
        return None;
    }
    if text.ends_with('o') || text.ends_with('O') || text.ends_with('q') || text.ends_with('Q') {
        return i64::from_str_radix(&text[..text.len() - 1], 8).ok();
    }
    if text.ends_with('d') || text.ends_with('D') {
        return text[..text.len() - 1].parse::<i64>().ok();
    }
    text.parse::<i64>().ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(i64),
    Symbol(String),
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// `-` is sign or subtraction depending on position.
    Minus,
    LParen,
    RParen,
}

struct Lexer<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn column(&self) -> usize {
        self.pos + 1
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, ExprError> {
        let mut tokens: Vec<(Token, usize)> = Vec::new();
        // Tracks whether the previous token completes a value, which
        // disambiguates `%` (modulo vs. binary-literal prefix).
        let mut after_value = false;

        while let Some(b) = self.peek() {
            let col = self.column();
            match b {
                b' ' | b'\t' => {
                    self.pos += 1;
                    continue;
                }
                b'(' => {
                    self.pos += 1;
                    tokens.push((Token::LParen, col));
                    after_value = false;
                }
                b')' => {
                    self.pos += 1;
                    tokens.push((Token::RParen, col));
                    after_value = true;
                }
                b'+' => {
                    self.pos += 1;
                    tokens.push((Token::Binary(BinaryOp::Add), col));
                    after_value = false;
                }
                b'-' => {
                    self.pos += 1;
                    tokens.push((Token::Minus, col));
                    after_value = false;
                }
                b'~' => {
                    self.pos += 1;
                    tokens.push((Token::Unary(UnaryOp::Complement), col));
                    after_value = false;
                }
                b'*' => {
                    self.pos += 1;
                    tokens.push((Token::Binary(BinaryOp::Multiply), col));
                    after_value = false;
                }
                b'/' => {
                    self.pos += 1;
                    tokens.push((Token::Binary(BinaryOp::Divide), col));
                    after_value = false;
                }
                b'&' => {
                    self.pos += 1;
                    tokens.push((Token::Binary(BinaryOp::BitAnd), col));
                    after_value = false;
                }
                b'^' => {
                    self.pos += 1;
                    tokens.push((Token::Binary(BinaryOp::BitXor), col));
                    after_value = false;
                }
                b'|' => {
                    self.pos += 1;
                    tokens.push((Token::Binary(BinaryOp::BitOr), col));
                    after_value = false;
                }
                b'<' | b'>' => {
                    if self.bytes.get(self.pos + 1) != Some(&b) {
                        return Err(ExprError::new(
                            format!("Unexpected character '{}'", b as char),
                            col,
                        ));
                    }
                    self.pos += 2;
                    let op = if b == b'<' {
                        BinaryOp::ShiftLeft
                    } else {
                        BinaryOp::ShiftRight
                    };
                    tokens.push((Token::Binary(op), col));
                    after_value = false;
                }
                b'%' => {
                    if after_value {
                        self.pos += 1;
                        tokens.push((Token::Binary(BinaryOp::Modulo), col));
                        after_value = false;
                    } else {
                        let lexeme = self.take_lexeme();
                        let value = parse_number(lexeme).ok_or_else(|| {
                            ExprError::new(format!("Invalid number: {lexeme}"), col)
                        })?;
                        tokens.push((Token::Number(value), col));
                        after_value = true;
                    }
                }
                b'$' => {
                    let lexeme = self.take_lexeme();
                    let value = parse_number(lexeme)
                        .ok_or_else(|| ExprError::new(format!("Invalid number: {lexeme}"), col))?;
                    tokens.push((Token::Number(value), col));
                    after_value = true;
                }
                b'0'..=b'9' => {
                    let lexeme = self.take_lexeme();
                    let value = parse_number(lexeme)
                        .ok_or_else(|| ExprError::new(format!("Invalid number: {lexeme}"), col))?;
                    tokens.push((Token::Number(value), col));
                    after_value = true;
                }
                b'A'..=b'Z' | b'a'..=b'z' | b'_' | b'.' => {
                    let lexeme = self.take_lexeme();
                    tokens.push((Token::Symbol(lexeme.to_string()), col));
                    after_value = true;
                }
                other => {
                    return Err(ExprError::new(
                        format!("Unexpected character '{}'", other as char),
                        col,
                    ));
                }
            }
        }

        Ok(tokens)
    }

    /// Consume a number or identifier lexeme: the leading sigil (if any)
    /// plus all following alphanumeric / `_` / `.` bytes.
    fn take_lexeme(&mut self) -> &'a str {
        let start = self.pos;
        self.pos += 1;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        &self.text[start..self.pos]
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end_column: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn current_column(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, c)| *c)
            .unwrap_or(self.end_column)
    }

    fn parse_expr(&mut self, min_level: u8) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.peek_binary() {
            if op.level() < min_level {
                break;
            }
            self.pos += 1;
            let right = self.parse_expr(op.level() + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn peek_binary(&self) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::Binary(op)) => Some(*op),
            Some(Token::Minus) => Some(BinaryOp::Subtract),
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let column = self.current_column();
        match self.next() {
            Some((Token::Number(value), _)) => Ok(Expr::Number(value)),
            Some((Token::Symbol(name), _)) => Ok(Expr::Symbol(name)),
            Some((Token::Minus, _)) => {
                let operand = self.parse_unary()?;
                Ok(fold_unary(UnaryOp::Minus, operand))
            }
            Some((Token::Unary(op), _)) => {
                let operand = self.parse_unary()?;
                Ok(fold_unary(op, operand))
            }
            Some((Token::Binary(BinaryOp::Add), _)) => self.parse_unary(),
            Some((Token::LParen, _)) => {
                let inner = self.parse_expr(0)?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(inner),
                    _ => Err(ExprError::new("Expected ')'", self.end_column)),
                }
            }
            Some((token, column)) => Err(ExprError::new(
                format!("Expected expression, found {}", describe(&token)),
                column,
            )),
            None => Err(ExprError::new("Expected expression", column)),
        }
    }
}

/// Constant-fold unary operators applied to literals so that `-5` and the
/// re-parse of a rendered negative number produce the same tree.
fn fold_unary(op: UnaryOp, operand: Expr) -> Expr {
    match operand {
        Expr::Number(value) => Expr::Number(apply_unary(op, value)),
        other => Expr::Unary {
            op,
            operand: Box::new(other),
        },
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(value) => format!("number {value}"),
        Token::Symbol(name) => format!("'{name}'"),
        Token::Unary(op) => format!("'{}'", op.glyph()),
        Token::Binary(op) => format!("'{}'", op.glyph()),
        Token::Minus => "'-'".to_string(),
        Token::LParen => "'('".to_string(),
        Token::RParen => "')'".to_string(),
    }
}

/// Parse expression text into a tree. The whole fragment must be consumed.
pub fn parse(text: &str) -> Result<Expr, ExprError> {
    let end_column = text.len() + 1;
    let tokens = Lexer::new(text).tokenize()?;
    if tokens.is_empty() {
        return Err(ExprError::new("Expected expression", 1));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        end_column,
    };
    let expr = parser.parse_expr(0)?;
    if let Some((token, column)) = parser.next() {
        return Err(ExprError::new(
            format!("Unexpected {} after expression", describe(&token)),
            column,
        ));
    }
    Ok(expr)
}
