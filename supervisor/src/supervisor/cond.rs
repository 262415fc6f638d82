//! Rule equation compiler and calculator
//!
//! Equations are chains of values joined by operators with **no
//! precedence**: the parse is a right-linear chain `val op (val op ...)`
//! and existing mission rules rely on exactly that reading, so none may be
//! introduced. A value is a number, a `$id` parameter reference or a
//! parenthesized sub-chain. Whitespace between tokens is insignificant.
//!
//! Evaluation is total: arithmetic domain errors produce NaN, never a
//! failure. All compile-time failures are structured
//! (`ParseSyntax`/`ParseUnknownOp`/`ParseInvalidParamRef`).
use anyhow::anyhow;

use mcp_core::error::{ErrorKind, TypedError, TypedResult};

/// Live parameter source for the calculator
pub trait ParamReader {
    fn read(&self, id: u32) -> f64;
}

impl<F> ParamReader for F
where
    F: Fn(u32) -> f64,
{
    fn read(&self, id: u32) -> f64 {
        self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Cmpl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Ne,
    Eq,
    Gt,
    Lt,
    Gte,
    Lte,
    Or,
    And,
    Mul,
    Div,
    Sub,
    Add,
    Mod,
    Pow,
    BitXor,
    BitOr,
    BitAnd,
    Shr,
    Shl,
}

/// A compiled equation
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Param(u32),
    Group(Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Chain(Box<Expr>, BinaryOp, Box<Expr>),
}

const UNARY_OPS: &[(&str, UnaryOp)] = &[("!", UnaryOp::Not), ("~", UnaryOp::Cmpl)];

// Table order matters: the first entry whose symbol length equals the
// operator-character span wins, as in the original operator tables.
const BINARY_OPS: &[(&str, BinaryOp)] = &[
    ("!=", BinaryOp::Ne),
    ("==", BinaryOp::Eq),
    (">", BinaryOp::Gt),
    ("<", BinaryOp::Lt),
    (">=", BinaryOp::Gte),
    ("<=", BinaryOp::Lte),
    ("||", BinaryOp::Or),
    ("&&", BinaryOp::And),
    ("*", BinaryOp::Mul),
    ("/", BinaryOp::Div),
    ("-", BinaryOp::Sub),
    ("+", BinaryOp::Add),
    ("%", BinaryOp::Mod),
    ("**", BinaryOp::Pow),
    ("^", BinaryOp::BitXor),
    ("|", BinaryOp::BitOr),
    ("&", BinaryOp::BitAnd),
    (">>", BinaryOp::Shr),
    ("<<", BinaryOp::Shl),
];

const OP_CHARS: &str = "!~=><*/-+%^|&";

impl UnaryOp {
    fn apply(self, val: f64) -> f64 {
        match self {
            UnaryOp::Not => {
                if val == 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Cmpl => !(val as u32) as f64,
        }
    }
}

impl BinaryOp {
    fn apply(self, val1: f64, val2: f64) -> f64 {
        let bool_val = |b: bool| b as u32 as f64;
        match self {
            // Equality is absolute difference below machine epsilon; NaN
            // compares unequal to everything, including itself.
            BinaryOp::Ne => bool_val(!((val1 - val2).abs() < f64::EPSILON)),
            BinaryOp::Eq => bool_val((val1 - val2).abs() < f64::EPSILON),
            BinaryOp::Gt => bool_val(val1 > val2),
            BinaryOp::Lt => bool_val(val1 < val2),
            BinaryOp::Gte => bool_val(val1 > val2 || (val1 - val2).abs() < f64::EPSILON),
            BinaryOp::Lte => bool_val(val1 < val2 || (val1 - val2).abs() < f64::EPSILON),
            BinaryOp::Or => bool_val(val1 != 0.0 || val2 != 0.0),
            BinaryOp::And => bool_val(val1 != 0.0 && val2 != 0.0),
            BinaryOp::Mul => val1 * val2,
            BinaryOp::Div => {
                if val2 == 0.0 {
                    f64::NAN
                } else {
                    val1 / val2
                }
            }
            BinaryOp::Sub => val1 - val2,
            BinaryOp::Add => val1 + val2,
            BinaryOp::Mod => val1 % val2,
            BinaryOp::Pow => {
                let result = val1.powf(val2);
                // Overflow and poles surface as NaN, matching the errno
                // convention of the original math calls.
                if result.is_infinite() && val1.is_finite() && val2.is_finite() {
                    f64::NAN
                } else {
                    result
                }
            }
            // Bitwise operators work on the value cast to 32-bit unsigned;
            // shifts mask the count like the hardware does.
            BinaryOp::BitXor => ((val1 as u32) ^ (val2 as u32)) as f64,
            BinaryOp::BitOr => ((val1 as u32) | (val2 as u32)) as f64,
            BinaryOp::BitAnd => ((val1 as u32) & (val2 as u32)) as f64,
            BinaryOp::Shr => (val1 as u32).wrapping_shr(val2 as u32) as f64,
            BinaryOp::Shl => (val1 as u32).wrapping_shl(val2 as u32) as f64,
        }
    }
}

impl Expr {
    /// Calculates the chain against the live parameters
    ///
    /// Parameter reads go through the reader at every evaluation; nothing
    /// is cached.
    pub fn eval<P: ParamReader>(&self, params: &P) -> f64 {
        match self {
            Expr::Const(value) => *value,
            Expr::Param(id) => params.read(*id),
            Expr::Group(inner) => inner.eval(params),
            Expr::Unary(op, inner) => op.apply(inner.eval(params)),
            Expr::Chain(head, op, tail) => op.apply(head.eval(params), tail.eval(params)),
        }
    }
}

/// Compiles an equation string
///
/// `param_valid` vets every `$id` reference against the MCT. The entire
/// input must be consumed; trailing text after a parsed chain is a syntax
/// error.
pub fn compile<V: Fn(u32) -> bool>(text: &str, param_valid: V) -> TypedResult<Expr> {
    let mut parser = Parser {
        rest: text,
        depth: 0,
        param_valid,
    };
    let expr = parser.parse_chain()?;
    if !parser.rest.is_empty() {
        return Err(TypedError::new(
            ErrorKind::ParseSyntax,
            anyhow!("failed to parse entire expression: ...\"{}\"", parser.rest),
        ));
    }
    Ok(expr)
}

struct Parser<'a, V> {
    rest: &'a str,
    depth: i32,
    param_valid: V,
}

/// Length of the run of operator characters at the start of `s`
fn op_span(s: &str) -> usize {
    s.chars().take_while(|c| OP_CHARS.contains(*c)).count()
}

/// Longest valid number prefix, strtod-style: sign, digits, fraction,
/// exponent (the exponent only counts when it has at least one digit)
fn scan_number(s: &str) -> Option<(f64, usize)> {
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut has_digits = end > int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > frac_start || has_digits {
            end = frac_end;
            has_digits = has_digits || frac_end > frac_start;
        }
    }
    if !has_digits {
        return None;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    s[..end].parse().ok().map(|value| (value, end))
}

impl<V: Fn(u32) -> bool> Parser<'_, V> {
    fn skip_space(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn parse_chain(&mut self) -> TypedResult<Expr> {
        if let Some(rest) = self.rest.strip_prefix(')') {
            // An abruptly ended group region parses as the constant 0.
            self.rest = rest;
            return Ok(Expr::Const(0.0));
        }
        if self.rest.is_empty() {
            return Err(TypedError::new(
                ErrorKind::ParseSyntax,
                anyhow!("expression ends where a value is expected"),
            ));
        }

        match self.parse_value()? {
            Some(head) => {
                // Look for a binary operator unless this is the end of the
                // string or of a group region.
                if !self.rest.is_empty() && !self.rest.starts_with(')') {
                    match self.binary_token() {
                        Ok(op) => {
                            let tail = self.parse_chain()?;
                            Ok(Expr::Chain(Box::new(head), op, Box::new(tail)))
                        }
                        Err(kind) => Err(TypedError::new(
                            kind,
                            anyhow!("expected a binary operator at \"{}\"", self.rest),
                        )),
                    }
                } else {
                    Ok(head)
                }
            }
            // No value here; the only legal alternative is a unary operator
            // introducing a chain.
            None => match self.unary_token() {
                Ok(op) => {
                    let inner = self.parse_chain()?;
                    Ok(Expr::Unary(op, Box::new(inner)))
                }
                Err(kind) => Err(TypedError::new(
                    kind,
                    anyhow!("expected a value or unary operator at \"{}\"", self.rest),
                )),
            },
        }
    }

    /// Parses a number, parameter reference or group; `Ok(None)` means "no
    /// value starts here" and lets the caller try a unary operator
    fn parse_value(&mut self) -> TypedResult<Option<Expr>> {
        self.skip_space();

        if let Some(after) = self.rest.strip_prefix('$') {
            let digits = after.chars().take_while(char::is_ascii_digit).count();
            if digits == 0 {
                return Err(TypedError::new(
                    ErrorKind::ParseSyntax,
                    anyhow!("parameter reference without an id at \"{}\"", self.rest),
                ));
            }
            let id: u32 = after[..digits].parse().map_err(|e| {
                TypedError::new(
                    ErrorKind::ParseSyntax,
                    anyhow!("bad parameter id in \"{}\": {e}", self.rest),
                )
            })?;
            if !(self.param_valid)(id) {
                return Err(TypedError::new(
                    ErrorKind::ParseInvalidParamRef,
                    anyhow!("undeclared parameter ${id}"),
                ));
            }
            self.rest = &after[digits..];
            return Ok(Some(Expr::Param(id)));
        }

        if let Some(after) = self.rest.strip_prefix('(') {
            let saved_rest = self.rest;
            let saved_depth = self.depth;
            self.rest = after;
            self.depth += 1;

            let inner = self.parse_chain()?;

            // The closing parenthesis of a group is not consumed by
            // parse_chain, so consume it here and check that the depth
            // matches the one saved at the start of the group.
            if let Some(after) = self.rest.strip_prefix(')') {
                self.rest = after;
                self.depth -= 1;
            }
            if self.depth != saved_depth {
                self.rest = saved_rest;
                return Err(TypedError::new(
                    ErrorKind::ParseSyntax,
                    anyhow!("unbalanced parentheses at \"{}\"", saved_rest),
                ));
            }
            return Ok(Some(Expr::Group(Box::new(inner))));
        }

        Ok(scan_number(self.rest).map(|(value, len)| {
            self.rest = &self.rest[len..];
            Expr::Const(value)
        }))
    }

    fn unary_token(&mut self) -> Result<UnaryOp, ErrorKind> {
        self.skip_space();
        let span = op_span(self.rest);
        if span == 0 {
            return Err(ErrorKind::ParseSyntax);
        }
        // An operator only matches when the whole run of operator
        // characters is exactly its symbol; this keeps "~~" from matching
        // "~".
        for (symbol, op) in UNARY_OPS {
            if symbol.len() == span && self.rest.starts_with(symbol) {
                self.rest = &self.rest[span..];
                return Ok(*op);
            }
        }
        Err(ErrorKind::ParseUnknownOp)
    }

    fn binary_token(&mut self) -> Result<BinaryOp, ErrorKind> {
        self.skip_space();
        let span = op_span(self.rest);
        if span == 0 {
            return Err(ErrorKind::ParseSyntax);
        }
        for (symbol, op) in BINARY_OPS {
            if symbol.len() == span && self.rest.starts_with(symbol) {
                self.rest = &self.rest[span..];
                return Ok(*op);
            }
        }
        Err(ErrorKind::ParseUnknownOp)
    }
}
