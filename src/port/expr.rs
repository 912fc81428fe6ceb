//! Expression syntax: chumsky lexer and parser
//!
//! Source is tokenized first, then parsed from the token stream. Masks,
//! filter bodies and calculations share one small grammar:
//!
//! ```text
//! or      := and ('|' and)*
//! and     := not ('&' not)*
//! not     := '!' not | compare
//! compare := sum (('=' | '!=' | '<' | '<=' | '>' | '>=' | '~') sum)?
//! sum     := product (('+' | '-') product)*
//! product := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := literal | '$' name | name ('.' name)* | name '(' args ')' | '(' or ')'
//! ```

use std::fmt;
use std::ops::Range;

use chumsky::prelude::*;

use super::value::Scalar;
use crate::error::{PortError, Result};

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
    /// Text containment (`~`)
    Contains,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Or => "|",
            BinaryOp::And => "&",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Contains => "~",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        };
        f.write_str(symbol)
    }
}

/// Unbound expression syntax tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Syntax {
    /// `None` is the `null` literal
    Literal(Option<Scalar>),
    Param(String),
    Path(Vec<String>),
    Call { name: String, args: Vec<Syntax> },
    Unary { op: UnaryOp, operand: Box<Syntax> },
    Binary { op: BinaryOp, left: Box<Syntax>, right: Box<Syntax> },
}

pub type Span = Range<usize>;

/// Expression tokens. Numbers keep their source text until the parser
/// converts them, so tokens stay `Eq + Hash`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    // Keywords
    True,
    False,
    Null,

    Ident(String),
    Param(String),
    Int(String),
    Float(String),
    Str(String),

    // Operators and punctuation
    Ne,     // !=
    Le,     // <=
    Ge,     // >=
    Eq,     // =
    Lt,     // <
    Gt,     // >
    Tilde,  // ~
    Pipe,   // |
    Amp,    // &
    Bang,   // !
    Plus,   // +
    Minus,  // -
    Star,   // *
    Slash,  // /
    LParen, // (
    RParen, // )
    Comma,  // ,
    Dot,    // .
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::Ident(s) | Token::Int(s) | Token::Float(s) => write!(f, "{}", s),
            Token::Param(s) => write!(f, "${}", s),
            Token::Str(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Token::Ne => write!(f, "!="),
            Token::Le => write!(f, "<="),
            Token::Ge => write!(f, ">="),
            Token::Eq => write!(f, "="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::Tilde => write!(f, "~"),
            Token::Pipe => write!(f, "|"),
            Token::Amp => write!(f, "&"),
            Token::Bang => write!(f, "!"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Dot => write!(f, "."),
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

pub fn lexer() -> impl Parser<char, Vec<(Token, Span)>, Error = Simple<char>> {
    let number = text::digits(10)
        .then(just('.').ignore_then(text::digits(10)).or_not())
        .map(|(int, frac): (String, Option<String>)| match frac {
            Some(frac) => Token::Float(format!("{}.{}", int, frac)),
            None => Token::Int(int),
        });

    // '' escapes a quote
    let string = just('\'')
        .ignore_then(just("''").to('\'').or(none_of('\'')).repeated())
        .then_ignore(just('\''))
        .collect::<String>()
        .map(Token::Str);

    let param = just('$').ignore_then(text::ident()).map(Token::Param);

    let keyword_or_ident = text::ident().map(|s: String| match s.as_str() {
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        _ => Token::Ident(s),
    });

    // two-character operators before their one-character prefixes
    let punctuation = choice((
        just("!=").to(Token::Ne),
        just("<=").to(Token::Le),
        just(">=").to(Token::Ge),
        just('=').to(Token::Eq),
        just('<').to(Token::Lt),
        just('>').to(Token::Gt),
        just('~').to(Token::Tilde),
        just('|').to(Token::Pipe),
        just('&').to(Token::Amp),
        just('!').to(Token::Bang),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Star),
        just('/').to(Token::Slash),
        just('(').to(Token::LParen),
        just(')').to(Token::RParen),
        just(',').to(Token::Comma),
        just('.').to(Token::Dot),
    ));

    choice((number, string, param, keyword_or_ident, punctuation))
        .map_with_span(|token, span| (token, span))
        .padded()
        .repeated()
        .then_ignore(end())
}

// ============================================================================
// Parser
// ============================================================================

fn binary(op: BinaryOp, left: Syntax, right: Syntax) -> Syntax {
    Syntax::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

/// Negative numeric literals fold into the literal.
fn negate(operand: Syntax) -> Syntax {
    match operand {
        Syntax::Literal(Some(Scalar::Integer(n))) => Syntax::Literal(Some(Scalar::Integer(-n))),
        Syntax::Literal(Some(Scalar::Float(f))) => Syntax::Literal(Some(Scalar::Float(-f))),
        other => Syntax::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(other),
        },
    }
}

fn name() -> impl Parser<Token, String, Error = Simple<Token>> + Clone {
    select! { Token::Ident(s) => s }
}

fn param_name() -> impl Parser<Token, String, Error = Simple<Token>> + Clone {
    select! { Token::Param(s) => s }
}

fn literal() -> impl Parser<Token, Syntax, Error = Simple<Token>> + Clone {
    let keyword = select! {
        Token::True => Syntax::Literal(Some(Scalar::Bool(true))),
        Token::False => Syntax::Literal(Some(Scalar::Bool(false))),
        Token::Null => Syntax::Literal(None),
        Token::Str(s) => Syntax::Literal(Some(Scalar::Text(s))),
    };
    let integer = select! { Token::Int(digits) => digits }.try_map(|digits: String, span| {
        digits
            .parse::<i64>()
            .map(|n| Syntax::Literal(Some(Scalar::Integer(n))))
            .map_err(|e| Simple::custom(span, format!("integer `{}`: {}", digits, e)))
    });
    let float = select! { Token::Float(text) => text }.try_map(|text: String, span| {
        text.parse::<f64>()
            .map(|f| Syntax::Literal(Some(Scalar::Float(f))))
            .map_err(|e| Simple::custom(span, format!("number `{}`: {}", text, e)))
    });
    choice((keyword, integer, float))
}

fn expression() -> impl Parser<Token, Syntax, Error = Simple<Token>> + Clone {
    recursive(|expr| {
        let call = name()
            .then(
                expr.clone()
                    .separated_by(just(Token::Comma))
                    .delimited_by(just(Token::LParen), just(Token::RParen)),
            )
            .map(|(name, args)| Syntax::Call { name, args });
        let path = name()
            .separated_by(just(Token::Dot))
            .at_least(1)
            .map(Syntax::Path);
        let group = expr.delimited_by(just(Token::LParen), just(Token::RParen));

        let primary = choice((literal(), param_name().map(Syntax::Param), call, path, group));

        let unary = just(Token::Minus)
            .repeated()
            .then(primary)
            .foldr(|_, operand| negate(operand));

        let product = unary
            .clone()
            .then(
                choice((
                    just(Token::Star).to(BinaryOp::Mul),
                    just(Token::Slash).to(BinaryOp::Div),
                ))
                .then(unary)
                .repeated(),
            )
            .foldl(|left, (op, right)| binary(op, left, right));

        let sum = product
            .clone()
            .then(
                choice((
                    just(Token::Plus).to(BinaryOp::Add),
                    just(Token::Minus).to(BinaryOp::Sub),
                ))
                .then(product)
                .repeated(),
            )
            .foldl(|left, (op, right)| binary(op, left, right));

        let comparison = choice((
            just(Token::Eq).to(BinaryOp::Eq),
            just(Token::Ne).to(BinaryOp::Ne),
            just(Token::Le).to(BinaryOp::Le),
            just(Token::Ge).to(BinaryOp::Ge),
            just(Token::Lt).to(BinaryOp::Lt),
            just(Token::Gt).to(BinaryOp::Gt),
            just(Token::Tilde).to(BinaryOp::Contains),
        ));
        let compare = sum
            .clone()
            .then(comparison.then(sum).or_not())
            .map(|(left, rest)| match rest {
                Some((op, right)) => binary(op, left, right),
                None => left,
            });

        let not = just(Token::Bang)
            .repeated()
            .then(compare)
            .foldr(|_, operand| Syntax::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });

        let and = not
            .clone()
            .then(just(Token::Amp).ignore_then(not).repeated())
            .foldl(|left, right| binary(BinaryOp::And, left, right));

        and.clone()
            .then(just(Token::Pipe).ignore_then(and).repeated())
            .foldl(|left, right| binary(BinaryOp::Or, left, right))
    })
}

/// `name` or `name($formal, ...)`
fn signature() -> impl Parser<Token, (String, Vec<String>), Error = Simple<Token>> + Clone {
    name()
        .then(
            param_name()
                .separated_by(just(Token::Comma))
                .delimited_by(just(Token::LParen), just(Token::RParen))
                .or_not(),
        )
        .map(|(name, formals)| (name, formals.unwrap_or_default()))
}

// ============================================================================
// Entry points
// ============================================================================

fn syntax_error(source: &str, errors: Vec<impl fmt::Display>) -> PortError {
    let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
    PortError::structure(format!("syntax error in `{}`: {}", source, messages.join("; ")))
}

fn run<O>(
    source: &str,
    parser: impl Parser<Token, O, Error = Simple<Token>>,
) -> Result<O> {
    let tokens = lexer()
        .parse(source)
        .map_err(|errors| syntax_error(source, errors))?;
    let len = source.len();
    parser
        .then_ignore(end())
        .parse(chumsky::Stream::from_iter(len..len + 1, tokens.into_iter()))
        .map_err(|errors| syntax_error(source, errors))
}

/// Parse an expression.
pub fn parse(source: &str) -> Result<Syntax> {
    run(source, expression())
}

/// Parse a filter signature such as `search($text)` or `open()`.
pub fn parse_signature(source: &str) -> Result<(String, Vec<String>)> {
    let (name, formals) = run(source, signature())?;
    for (i, formal) in formals.iter().enumerate() {
        if formals[..i].contains(formal) {
            return Err(PortError::duplicate_attribute(format!("${}", formal)));
        }
    }
    Ok((name, formals))
}
