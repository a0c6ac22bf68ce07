//! Species translation scripts.
//!
//! A script is a list of statements applied to every variable of a file:
//!
//! ```text
//! # GEOS-Chem → CB6
//! ALD2 = ALD2
//! POC  = OC * 0.7           ; PEC = BC
//! PAR  = 0.5 * ALK4 + 1.5d0 * C3H8
//! PAR.units = 'moles/day'
//! del OC, BC
//! ```

use std::{fmt, fs, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use ndarray::Array4;
use tracing::debug;

use crate::ioapi::{IoapiFile, IoapiVar, VarMeta, NAMLEN};

const DEFAULT_UNITS: &str = "moles/day";

// ─────────────────────────────────────────────────────────────────────
// Syntax tree
// ─────────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Bin(Op, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Attr {
    Units,
    LongName,
    VarDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Assign { name: String, expr: Expr },
    SetAttr { name: String, attr: Attr, value: String },
    Del(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub line: usize,
    pub stmt: Stmt,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub statements: Vec<Statement>,
}

impl Expr {
    /// First variable referenced, left to right.
    fn first_var(&self) -> Option<&str> {
        match self {
            Expr::Num(_) => None,
            Expr::Var(v) => Some(v),
            Expr::Neg(e) => e.first_var(),
            Expr::Bin(_, a, b) => a.first_var().or_else(|| b.first_var()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Tokens
// ─────────────────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Num(f64),
    Str(String),
    Op(char),
    Pow,
    LParen,
    RParen,
    Eq,
    Dot,
    Comma,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "{s}"),
            Tok::Num(n)   => write!(f, "{n}"),
            Tok::Str(s)   => write!(f, "{s:?}"),
            Tok::Op(c)    => write!(f, "{c}"),
            Tok::Pow      => write!(f, "**"),
            Tok::LParen   => write!(f, "("),
            Tok::RParen   => write!(f, ")"),
            Tok::Eq       => write!(f, "="),
            Tok::Dot      => write!(f, "."),
            Tok::Comma    => write!(f, ","),
        }
    }
}

fn lex(src: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '(' => { out.push(Tok::LParen); i += 1 }
            ')' => { out.push(Tok::RParen); i += 1 }
            '=' => { out.push(Tok::Eq); i += 1 }
            ',' => { out.push(Tok::Comma); i += 1 }
            '+' | '-' | '/' => { out.push(Tok::Op(c)); i += 1 }
            '*' if chars.get(i + 1) == Some(&'*') => { out.push(Tok::Pow); i += 2 }
            '*' => { out.push(Tok::Op('*')); i += 1 }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| anyhow!("unterminated string"))?;
                out.push(Tok::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '.' if !chars.get(i + 1).is_some_and(char::is_ascii_digit) => { out.push(Tok::Dot); i += 1 }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                if i < chars.len() && matches!(chars[i], 'e' | 'E' | 'd' | 'D') {
                    let mut j = i + 1;
                    if j < chars.len() && matches!(chars[j], '+' | '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let text: String = chars[start..i]
                    .iter()
                    .map(|&ch| if matches!(ch, 'd' | 'D') { 'e' } else { ch })
                    .collect();
                let n = text.parse().map_err(|_| anyhow!("bad number {text:?}"))?;
                out.push(Tok::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                out.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => bail!("unexpected character {other:?}"),
        }
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────
struct Parser {
    toks: Vec<Tok>,
    pos:  usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: &Tok) -> Result<()> {
        match self.next() {
            Some(ref t) if t == want => Ok(()),
            Some(t) => bail!("expected {want}, found {t}"),
            None => bail!("expected {want}, found end of statement"),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Tok::Ident(s)) => Ok(s),
            Some(t) => bail!("expected a name, found {t}"),
            None => bail!("expected a name, found end of statement"),
        }
    }

    fn statement(&mut self) -> Result<Stmt> {
        let name = self.ident()?;
        if name == "del" {
            let mut names = vec![self.ident()?];
            while self.peek() == Some(&Tok::Comma) {
                self.pos += 1;
                names.push(self.ident()?);
            }
            return Ok(Stmt::Del(names));
        }
        if self.peek() == Some(&Tok::Dot) {
            self.pos += 1;
            let attr = match self.ident()?.as_str() {
                "units"     => Attr::Units,
                "long_name" => Attr::LongName,
                "var_desc"  => Attr::VarDesc,
                other => bail!("unknown attribute {other:?}"),
            };
            self.expect(&Tok::Eq)?;
            return match self.next() {
                Some(Tok::Str(value)) => Ok(Stmt::SetAttr { name, attr, value }),
                _ => bail!("attribute values must be quoted strings"),
            };
        }
        self.expect(&Tok::Eq)?;
        let expr = self.expr()?;
        Ok(Stmt::Assign { name, expr })
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Tok::Op(c @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let op = if c == '+' { Op::Add } else { Op::Sub };
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(self.term()?));
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Tok::Op(c @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let op = if c == '*' { Op::Mul } else { Op::Div };
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Tok::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Tok::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := atom ('**' unary)?
    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if self.peek() == Some(&Tok::Pow) {
            self.pos += 1;
            return Ok(Expr::Bin(Op::Pow, Box::new(base), Box::new(self.unary()?)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Ident(s)) => Ok(Expr::Var(s)),
            Some(Tok::LParen) => {
                let e = self.expr()?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            Some(t) => bail!("unexpected {t}"),
            None => bail!("unexpected end of expression"),
        }
    }
}

/// Split off a `#` comment that is not inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut quote: Option<char> = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '#') => return &line[..i],
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            _ => {}
        }
    }
    line
}

impl Script {
    pub fn parse(src: &str) -> Result<Self> {
        let mut statements = Vec::new();
        for (n, raw) in src.lines().enumerate() {
            let line = n + 1;
            for piece in strip_comment(raw).split(';') {
                if piece.trim().is_empty() { continue }
                let toks = lex(piece).with_context(|| format!("line {line}"))?;
                let mut p = Parser { toks, pos: 0 };
                let stmt = p.statement().with_context(|| format!("line {line}: {}", piece.trim()))?;
                if let Some(t) = p.peek() {
                    bail!("line {line}: unexpected {t} after statement");
                }
                if let Stmt::Assign { name, .. } = &stmt {
                    if name.chars().count() > NAMLEN {
                        bail!("line {line}: variable name {name:?} exceeds {NAMLEN} characters");
                    }
                }
                statements.push(Statement { line, stmt });
            }
        }
        Ok(Script { statements })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading speciation script {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Run every statement against `file`, in order. Returns the names the
    /// script assigned and did not delete again, in first-assignment order;
    /// only these make up the speciated output.
    pub fn apply(&self, file: &mut IoapiFile) -> Result<Vec<String>> {
        let mut assigned: Vec<String> = Vec::new();
        for Statement { line, stmt } in &self.statements {
            apply_one(stmt, file).with_context(|| format!("speciation line {line}"))?;
            match stmt {
                Stmt::Assign { name, .. } if !assigned.contains(name) => assigned.push(name.clone()),
                Stmt::Del(names) => assigned.retain(|a| !names.contains(a)),
                _ => {}
            }
        }
        debug!("speciation assigned {} variables", assigned.len());
        Ok(assigned)
    }
}

// ─────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────
enum Value {
    Scalar(f64),
    Field(Array4<f32>),
}

fn combine(op: Op, a: Value, b: Value) -> Result<Value> {
    let f = |x: f32, y: f32| -> f32 {
        match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Pow => x.powf(y),
        }
    };
    Ok(match (a, b) {
        (Value::Scalar(x), Value::Scalar(y)) => Value::Scalar(match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Pow => x.powf(y),
        }),
        (Value::Field(mut x), Value::Scalar(y)) => {
            let y = y as f32;
            x.mapv_inplace(|v| f(v, y));
            Value::Field(x)
        }
        (Value::Scalar(x), Value::Field(mut y)) => {
            let x = x as f32;
            y.mapv_inplace(|v| f(x, v));
            Value::Field(y)
        }
        (Value::Field(mut x), Value::Field(y)) => {
            if x.shape() != y.shape() {
                bail!("shape mismatch {:?} vs {:?}", x.shape(), y.shape());
            }
            x.zip_mut_with(&y, |a, &b| *a = f(*a, b));
            Value::Field(x)
        }
    })
}

fn eval(expr: &Expr, file: &IoapiFile) -> Result<Value> {
    Ok(match expr {
        Expr::Num(n) => Value::Scalar(*n),
        Expr::Var(name) => {
            let v = file.var(name).ok_or_else(|| anyhow!("unknown variable {name}"))?;
            Value::Field(v.data.clone())
        }
        Expr::Neg(e) => match eval(e, file)? {
            Value::Scalar(x) => Value::Scalar(-x),
            Value::Field(x) => Value::Field(-x),
        },
        Expr::Bin(op, a, b) => combine(*op, eval(a, file)?, eval(b, file)?)?,
    })
}

fn apply_one(stmt: &Stmt, file: &mut IoapiFile) -> Result<()> {
    match stmt {
        Stmt::Assign { name, expr } => {
            let data = match eval(expr, file)? {
                Value::Field(data) => data,
                Value::Scalar(x) => {
                    let shape = file
                        .vars
                        .first()
                        .map(|v| v.data.raw_dim())
                        .ok_or_else(|| anyhow!("cannot assign a constant to {name}: file has no variables"))?;
                    Array4::from_elem(shape, x as f32)
                }
            };
            let meta = match file.var(name) {
                Some(existing) => existing.meta.clone(),
                None => {
                    let units = expr
                        .first_var()
                        .and_then(|v| file.var(v))
                        .map_or(DEFAULT_UNITS, |v| v.meta.units.as_str());
                    VarMeta::new(name, units)
                }
            };
            file.set_var(IoapiVar { meta, data });
        }
        Stmt::SetAttr { name, attr, value } => {
            let var = file.var_mut(name).ok_or_else(|| anyhow!("unknown variable {name}"))?;
            match attr {
                Attr::Units    => var.meta.units = value.clone(),
                Attr::LongName => var.meta.long_name = value.clone(),
                Attr::VarDesc  => var.meta.var_desc = value.clone(),
            }
        }
        Stmt::Del(names) => {
            for name in names {
                file.remove_var(name).ok_or_else(|| anyhow!("cannot delete unknown variable {name}"))?;
            }
        }
    }
    Ok(())
}
