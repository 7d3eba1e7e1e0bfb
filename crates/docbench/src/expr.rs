//! Arithmetic expressions for informational metrics
//!
//! Project descriptors declare info metrics such as `"#dummies" = "dummies * page_amount"`.
//! They are parsed once when the descriptor is loaded and evaluated per run
//! against the final variable set (project parameters, build parameters and
//! derived counts).
//!
//! Supported: integer literals, identifiers, `+ - * / % **`, unary minus and
//! parentheses. `**` is right-associative and binds tighter than unary minus,
//! so `-2 ** 2` is `-4`. A surrounding `{{ ... }}` is accepted and ignored.

use crate::config::ParamValue;
use crate::{Error, Result};
use indexmap::IndexMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Pow => "**",
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Int(i64),
    Var(String),
    Neg(Box<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Ident(String),
    Op(BinOp),
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '0'..='9' => {
                let mut end = idx + c.len_utf8();
                while let Some(&(next_idx, next)) = chars.peek() {
                    if next.is_ascii_digit() || next == '_' {
                        end = next_idx + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal: String = source[idx..end].chars().filter(|c| *c != '_').collect();
                let value = literal
                    .parse::<i64>()
                    .map_err(|e| Error::expression(source, format!("invalid integer '{literal}': {e}")))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = idx + c.len_utf8();
                while let Some(&(next_idx, next)) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        end = next_idx + next.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(source[idx..end].to_string()));
            }
            '*' => {
                if matches!(chars.peek(), Some((_, '*'))) {
                    chars.next();
                    tokens.push(Token::Op(BinOp::Pow));
                } else {
                    tokens.push(Token::Op(BinOp::Mul));
                }
            }
            '+' => tokens.push(Token::Op(BinOp::Add)),
            '-' => tokens.push(Token::Op(BinOp::Sub)),
            '/' => tokens.push(Token::Op(BinOp::Div)),
            '%' => tokens.push(Token::Op(BinOp::Rem)),
            '(' => tokens.push(Token::LParen),
            ')' => tokens.push(Token::RParen),
            other => {
                return Err(Error::expression(source, format!("unexpected character '{other}'")));
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
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        Error::expression(self.source, reason)
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek().cloned() {
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

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::Rem))) = self.peek().cloned() {
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

    fn unary(&mut self) -> Result<Expr> {
        if let Some(Token::Op(BinOp::Sub)) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if let Some(Token::Op(BinOp::Pow)) = self.peek() {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            Some(token) => Err(self.error(format!("unexpected token {token:?}"))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

impl Expr {
    /// Parse an expression.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expression`] on any syntax error.
    pub fn parse(source: &str) -> Result<Self> {
        let mut trimmed = source.trim();
        if let Some(inner) = trimmed.strip_prefix("{{").and_then(|s| s.strip_suffix("}}")) {
            trimmed = inner.trim();
        }

        let tokens = tokenize(trimmed)?;
        if tokens.is_empty() {
            return Err(Error::expression(source, "empty expression"));
        }

        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(expr)
    }

    /// Identifiers referenced by the expression, in order of appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Int(_) => {}
            Expr::Var(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Expr::Neg(inner) => inner.collect_variables(names),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_variables(names);
                rhs.collect_variables(names);
            }
        }
    }

    /// Evaluate against a variable set using checked integer arithmetic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Expression`] for unknown or non-integer variables,
    /// division by zero, negative exponents and overflow.
    pub fn eval(&self, vars: &IndexMap<String, ParamValue>) -> Result<i64> {
        let overflow = || Error::expression(self.to_string(), "arithmetic overflow");

        match self {
            Expr::Int(value) => Ok(*value),
            Expr::Var(name) => match vars.get(name) {
                Some(ParamValue::Int(value)) => Ok(*value),
                Some(ParamValue::Str(value)) => Err(Error::expression(
                    self.to_string(),
                    format!("variable '{name}' is not an integer: '{value}'"),
                )),
                None => Err(Error::expression(self.to_string(), format!("unknown variable '{name}'"))),
            },
            Expr::Neg(inner) => inner.eval(vars)?.checked_neg().ok_or_else(overflow),
            Expr::Binary { op, lhs, rhs } => {
                let a = lhs.eval(vars)?;
                let b = rhs.eval(vars)?;
                match op {
                    BinOp::Add => a.checked_add(b).ok_or_else(overflow),
                    BinOp::Sub => a.checked_sub(b).ok_or_else(overflow),
                    BinOp::Mul => a.checked_mul(b).ok_or_else(overflow),
                    BinOp::Div | BinOp::Rem if b == 0 => {
                        Err(Error::expression(self.to_string(), "division by zero"))
                    }
                    BinOp::Div => a.checked_div(b).ok_or_else(overflow),
                    BinOp::Rem => a.checked_rem(b).ok_or_else(overflow),
                    BinOp::Pow => {
                        let exponent = u32::try_from(b)
                            .map_err(|_| Error::expression(self.to_string(), "negative exponent"))?;
                        a.checked_pow(exponent).ok_or_else(overflow)
                    }
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(value) => write!(f, "{value}"),
            Expr::Var(name) => f.write_str(name),
            Expr::Neg(inner) => write!(f, "-{inner}"),
            Expr::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, ParamValue)]) -> IndexMap<String, ParamValue> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_descriptor_expressions() {
        let vars = vars(&[
            ("dummies", ParamValue::Int(10)),
            ("page_amount", ParamValue::Int(70)),
            ("folders", ParamValue::Int(2)),
            ("depth", ParamValue::Int(2)),
        ]);

        assert_eq!(Expr::parse("dummies * page_amount").unwrap().eval(&vars).unwrap(), 700);
        assert_eq!(Expr::parse("{{folders ** depth}}").unwrap().eval(&vars).unwrap(), 4);
        assert_eq!(Expr::parse("page_amount").unwrap().eval(&vars).unwrap(), 70);
    }

    #[test]
    fn test_precedence_and_associativity() {
        let empty = IndexMap::new();
        let eval = |s: &str| Expr::parse(s).unwrap().eval(&empty).unwrap();

        assert_eq!(eval("1 + 2 * 3"), 7);
        assert_eq!(eval("(1 + 2) * 3"), 9);
        assert_eq!(eval("2 ** 3 ** 2"), 512);
        assert_eq!(eval("-2 ** 2"), -4);
        assert_eq!(eval("10 - 4 - 3"), 3);
        assert_eq!(eval("17 % 5"), 2);
        assert_eq!(eval("1_000 / 10"), 100);
    }

    #[test]
    fn test_syntax_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("(1 + 2").is_err());
        assert!(Expr::parse("1 2").is_err());
        assert!(Expr::parse("pages | length").is_err());
    }

    #[test]
    fn test_evaluation_errors() {
        let vars = vars(&[("theme", ParamValue::from("furo")), ("zero", ParamValue::Int(0))]);

        let err = Expr::parse("theme * 2").unwrap().eval(&vars).unwrap_err();
        assert!(err.to_string().contains("not an integer"));

        let err = Expr::parse("missing + 1").unwrap().eval(&vars).unwrap_err();
        assert!(err.to_string().contains("unknown variable 'missing'"));

        assert!(Expr::parse("1 / zero").unwrap().eval(&vars).is_err());
        assert!(Expr::parse("2 ** -1").unwrap().eval(&vars).is_err());
        assert!(Expr::parse("9223372036854775807 + 1").unwrap().eval(&vars).is_err());
    }

    #[test]
    fn test_variables_listed_once() {
        let expr = Expr::parse("pages * folders + pages").unwrap();
        assert_eq!(expr.variables(), vec!["pages", "folders"]);
    }
}
