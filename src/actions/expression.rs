//! Small arithmetic language used in device action values.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (("+" | "-") term)*
//! term    := unary (("*" | "/" | "//" | "%") unary)*
//! unary   := ("-" | "+") unary | primary
//! primary := number | ident | ident "(" expr ("," expr)* ")" | "(" expr ")"
//! ```
//!
//! Only the functions `int round min max abs sqrt` exist; there is no other way
//! to reach the host from an expression.

use std::collections::BTreeMap;
use thiserror::Error;

pub type Variables = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unexpected {found} at {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{function}() takes {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: &'static str,
        got: usize,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NotFinite,

    #[error("unterminated '{{' at {0}")]
    UnterminatedPlaceholder(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Num(n) => format!("number {}", n),
            Token::Ident(s) => format!("'{}'", s),
            Token::Plus => "'+'".into(),
            Token::Minus => "'-'".into(),
            Token::Star => "'*'".into(),
            Token::Slash => "'/'".into(),
            Token::SlashSlash => "'//'".into(),
            Token::Percent => "'%'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::Comma => "','".into(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '0'..='9' | '.' => {
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::UnexpectedChar { pos: start, ch: c })?;
                tokens.push((start, Token::Num(n)));
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(chars[start..i].iter().collect())));
                continue;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                i += 1;
                Token::SlashSlash
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            ch => return Err(ExpressionError::UnexpectedChar { pos: i, ch }),
        };
        i += 1;
        tokens.push((start, token));
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    vars: &'a Variables,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), ExpressionError> {
        match self.next() {
            Some((_, t)) if t == want => Ok(()),
            Some((pos, t)) => Err(ExpressionError::UnexpectedToken {
                pos,
                found: t.describe(),
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn expr(&mut self) -> Result<f64, ExpressionError> {
        let mut value = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => return Ok(value),
            }
        }
    }

    fn term(&mut self) -> Result<f64, ExpressionError> {
        let mut value = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(t @ (Token::Star | Token::Slash | Token::SlashSlash | Token::Percent)) => t.clone(),
                _ => return Ok(value),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                Token::Star => value * rhs,
                _ if rhs == 0.0 => return Err(ExpressionError::DivisionByZero),
                Token::Slash => value / rhs,
                Token::SlashSlash => (value / rhs).floor(),
                // Sign follows the divisor
                _ => value - rhs * (value / rhs).floor(),
            };
        }
    }

    fn unary(&mut self) -> Result<f64, ExpressionError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<f64, ExpressionError> {
        match self.next() {
            Some((_, Token::Num(n))) => Ok(n),
            Some((_, Token::LParen)) => {
                let v = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some((_, Token::Ident(name))) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let args = self.args()?;
                    call(&name, &args)
                } else {
                    self.vars
                        .get(&name)
                        .copied()
                        .ok_or(ExpressionError::UnknownVariable(name))
                }
            }
            Some((pos, t)) => Err(ExpressionError::UnexpectedToken {
                pos,
                found: t.describe(),
            }),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    fn args(&mut self) -> Result<Vec<f64>, ExpressionError> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some((_, Token::Comma)) => continue,
                Some((_, Token::RParen)) => return Ok(args),
                Some((pos, t)) => {
                    return Err(ExpressionError::UnexpectedToken {
                        pos,
                        found: t.describe(),
                    })
                }
                None => return Err(ExpressionError::UnexpectedEnd),
            }
        }
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, ExpressionError> {
    let arity = |expected: &'static str| ExpressionError::Arity {
        function: name.to_string(),
        expected,
        got: args.len(),
    };
    match (name, args) {
        ("int", [x]) => Ok(x.trunc()),
        ("abs", [x]) => Ok(x.abs()),
        ("sqrt", [x]) => Ok(x.sqrt()),
        ("round", [x]) => Ok(x.round()),
        ("round", [x, digits]) => {
            let factor = 10f64.powi(digits.trunc() as i32);
            Ok((x * factor).round() / factor)
        }
        ("min", [first, rest @ ..]) => Ok(rest.iter().fold(*first, |a, b| a.min(*b))),
        ("max", [first, rest @ ..]) => Ok(rest.iter().fold(*first, |a, b| a.max(*b))),
        ("int" | "abs" | "sqrt", _) => Err(arity("1")),
        ("round", _) => Err(arity("1 or 2")),
        ("min" | "max", _) => Err(arity("at least 1")),
        _ => Err(ExpressionError::UnknownFunction(name.to_string())),
    }
}

/// Evaluates a bare arithmetic expression such as `limit_watts / 230`
pub fn evaluate_expression(expr: &str, vars: &Variables) -> Result<f64, ExpressionError> {
    let mut parser = Parser {
        tokens: tokenize(expr)?,
        pos: 0,
        vars,
    };
    let value = parser.expr()?;
    if let Some((pos, t)) = parser.next() {
        return Err(ExpressionError::UnexpectedToken {
            pos,
            found: t.describe(),
        });
    }
    if !value.is_finite() {
        return Err(ExpressionError::NotFinite);
    }
    Ok(value)
}

/// Integral values print without a fraction
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Replaces every `{expr}` in `template` with its value; other text is kept
pub fn evaluate_template(template: &str, vars: &Variables) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or(ExpressionError::UnterminatedPlaceholder(offset + open))?;
        out.push_str(&format_number(evaluate_expression(&after[..close], vars)?));
        offset += open + close + 2;
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
