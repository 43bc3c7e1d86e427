//! Arithmetic expression trees for formula nodes.
//!
//! The grammar is deliberately small: numeric literals, named variables,
//! binary `+ - * /`, unary `-`, and parentheses for grouping. Standard
//! precedence applies (`+ -` lowest, `* /` above, unary `-` tightest; all
//! binaries left-associative). Anything outside the grammar is rejected at
//! parse time rather than interpreted loosely.

use crate::error::{ModelError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// A parsed arithmetic expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(f64),
    Variable(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Parses a formula string into an expression tree.
    pub fn parse(source: &str) -> Result<Expr> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.unexpected("end of formula"));
        }
        Ok(expr)
    }

    /// Evaluates the tree, resolving each variable through `lookup`.
    pub fn evaluate(&self, lookup: &mut dyn FnMut(&str) -> Result<f64>) -> Result<f64> {
        match self {
            Expr::Literal(v) => Ok(*v),
            Expr::Variable(name) => lookup(name),
            Expr::Neg(inner) => Ok(-inner.evaluate(lookup)?),
            Expr::Binary { op, lhs, rhs } => {
                let l = lhs.evaluate(lookup)?;
                let r = rhs.evaluate(lookup)?;
                match op {
                    BinaryOp::Add => Ok(l + r),
                    BinaryOp::Sub => Ok(l - r),
                    BinaryOp::Mul => Ok(l * r),
                    BinaryOp::Div => {
                        if r == 0.0 {
                            return Err(ModelError::DivisionByZero);
                        }
                        Ok(l / r)
                    }
                }
            }
        }
    }

    /// Variable names referenced by the expression, first occurrence order.
    pub fn variables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Variable(name) => {
                if !out.iter().any(|n| n == name) {
                    out.push(name.clone());
                }
            }
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(out);
                rhs.collect_variables(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '0'..='9' | '.' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &source[start..end];
                let value: f64 = text.parse().map_err(|_| {
                    ModelError::Configuration(format!(
                        "formula '{source}': invalid number literal '{text}'"
                    ))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        end = i + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(source[start..end].to_string()));
            }
            other => {
                return Err(ModelError::Configuration(format!(
                    "formula '{source}': unsupported character '{other}'"
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // unary := '-' unary | primary
    fn unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    // primary := NUMBER | IDENT | '(' expression ')'
    fn primary(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Number(value)) => {
                self.pos += 1;
                Ok(Expr::Literal(value))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                Ok(Expr::Variable(name))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expression()?;
                if !matches!(self.peek(), Some(Token::RParen)) {
                    return Err(self.unexpected("closing ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            _ => Err(self.unexpected("a number, variable, or '('")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn unexpected(&self, expected: &str) -> ModelError {
        let found = match self.peek() {
            Some(tok) => format!("{tok:?}"),
            None => "end of formula".to_string(),
        };
        ModelError::Configuration(format!(
            "formula '{}': expected {expected}, found {found}",
            self.source
        ))
    }
}
