//! Message selectors.
//!
//! A small subset of the JMS selector language, enough for routing on
//! message properties:
//!
//! ```text
//! expr       := term ( OR term )*
//! term       := factor ( AND factor )*
//! factor     := NOT factor | '(' expr ')' | comparison
//! comparison := ident op literal | ident IS [NOT] NULL
//! op         := = | <> | < | <= | > | >=
//! literal    := 'string' | number | TRUE | FALSE
//! ```
//!
//! Identifiers resolve to message properties, except for `JMSCorrelationID`,
//! `JMSType`, `JMSPriority`, `JMSMessageID`, `JMSTimestamp` and
//! `JMSDeliveryMode`, which read the standard fields. A comparison against a
//! missing identifier is false.
//!
//! `NOT` and parentheses may nest at most [`MAX_NESTING`] levels deep.

use crate::broker::{DeliveryMode, Message};
use crate::error::BrokerError;

/// Deepest `NOT`/parenthesis nesting a selector may use.
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    source: String,
    root: Expr,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare(String, Op, Literal),
    IsNull(String, bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(Op),
    LParen,
    RParen,
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: String| BrokerError::InvalidSelector {
            selector: abbreviate(source),
            reason,
        };
        let tokens = tokenize(source).map_err(invalid)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.expr().map_err(invalid)?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected trailing input at token {}",
                parser.pos + 1
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, message: &Message) -> bool {
        eval(&self.root, message)
    }
}

/// Keeps error messages for oversized selectors to a readable length.
fn abbreviate(source: &str) -> String {
    const SHOWN: usize = 64;
    match source.char_indices().nth(SHOWN) {
        Some((end, _)) => format!("{}...", &source[..end]),
        None => source.to_string(),
    }
}

fn lookup(message: &Message, ident: &str) -> Option<String> {
    match ident {
        "JMSCorrelationID" => message.correlation_id.clone(),
        "JMSType" => message.message_type.clone(),
        "JMSMessageID" => message.message_id.clone(),
        "JMSPriority" => Some(message.priority.to_string()),
        "JMSTimestamp" => Some(message.timestamp.to_string()),
        "JMSDeliveryMode" => Some(
            match message.delivery_mode {
                DeliveryMode::Persistent => "PERSISTENT",
                DeliveryMode::NonPersistent => "NON_PERSISTENT",
            }
            .to_string(),
        ),
        _ => message.property(ident).map(str::to_string),
    }
}

fn eval(expr: &Expr, message: &Message) -> bool {
    match expr {
        Expr::Or(terms) => terms.iter().any(|e| eval(e, message)),
        Expr::And(factors) => factors.iter().all(|e| eval(e, message)),
        Expr::Not(inner) => !eval(inner, message),
        Expr::IsNull(ident, negated) => lookup(message, ident).is_none() != *negated,
        Expr::Compare(ident, op, literal) => {
            let Some(value) = lookup(message, ident) else {
                return false;
            };
            match literal {
                Literal::Str(s) => compare(value.as_str().cmp(s.as_str()), *op),
                Literal::Bool(b) => match value.to_ascii_lowercase().parse::<bool>() {
                    Ok(v) => compare(v.cmp(b), *op),
                    Err(_) => false,
                },
                Literal::Num(n) => match value.trim().parse::<f64>() {
                    Ok(v) => v.partial_cmp(n).is_some_and(|ord| compare(ord, *op)),
                    Err(_) => false,
                },
            }
        }
    }
}

fn compare(ord: std::cmp::Ordering, op: Op) -> bool {
    use std::cmp::Ordering::*;
    match op {
        Op::Eq => ord == Equal,
        Op::Ne => ord != Equal,
        Op::Lt => ord == Less,
        Op::Le => ord != Greater,
        Op::Gt => ord == Greater,
        Op::Ge => ord != Less,
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(Op::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Op(Op::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Op(Op::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(Op::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(Op::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(Op::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number {text:?}"))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '.'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut terms = vec![self.term()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.term()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        })
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut factors = vec![self.factor()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            factors.push(self.factor()?);
        }
        Ok(match factors.len() {
            1 => factors.remove(0),
            _ => Expr::And(factors),
        })
    }

    /// Runs `parse` one nesting level deeper.
    fn nested(&mut self, parse: fn(&mut Self) -> Result<Expr, String>) -> Result<Expr, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!(
                "selector nested more than {MAX_NESTING} levels deep"
            ));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn factor(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.nested(Self::factor)?))),
            Some(Token::LParen) => {
                let inner = self.nested(Self::expr)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(ident)) => self.comparison(ident),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of selector".to_string()),
        }
    }

    fn comparison(&mut self, ident: String) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Is) => {
                let negated = if self.peek() == Some(&Token::Not) {
                    self.pos += 1;
                    true
                } else {
                    false
                };
                match self.next() {
                    Some(Token::Null) => Ok(Expr::IsNull(ident, negated)),
                    _ => Err("expected NULL after IS".to_string()),
                }
            }
            Some(Token::Op(op)) => {
                let literal = match self.next() {
                    Some(Token::Str(s)) => Literal::Str(s),
                    Some(Token::Num(n)) => Literal::Num(n),
                    Some(Token::True) => Literal::Bool(true),
                    Some(Token::False) => Literal::Bool(false),
                    _ => return Err(format!("expected a literal after {ident}")),
                };
                Ok(Expr::Compare(ident, op, literal))
            }
            _ => Err(format!("expected an operator after {ident}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message::text("body")
            .with_property("foo", "zzz")
            .with_property("count", "12")
            .with_property("flag", "true")
    }

    #[test]
    fn string_equality() {
        assert!(Selector::parse("foo = 'zzz'").unwrap().matches(&message()));
        assert!(!Selector::parse("foo = '1234'").unwrap().matches(&message()));
        assert!(Selector::parse(" foo <> '1234'").unwrap().matches(&message()));
    }

    #[test]
    fn numeric_comparison() {
        let m = message();
        assert!(Selector::parse("count > 10").unwrap().matches(&m));
        assert!(Selector::parse("count <= 12").unwrap().matches(&m));
        assert!(!Selector::parse("count < 12.0").unwrap().matches(&m));
    }

    #[test]
    fn boolean_logic_and_precedence() {
        let m = message();
        assert!(Selector::parse("foo = 'x' OR count = 12 AND flag = TRUE")
            .unwrap()
            .matches(&m));
        assert!(!Selector::parse("(foo = 'x' OR count = 12) AND NOT flag = true")
            .unwrap()
            .matches(&m));
    }

    #[test]
    fn missing_property_never_matches_comparison() {
        let m = message();
        assert!(!Selector::parse("absent = 'zzz'").unwrap().matches(&m));
        assert!(Selector::parse("absent IS NULL").unwrap().matches(&m));
        assert!(Selector::parse("foo IS NOT NULL").unwrap().matches(&m));
    }

    #[test]
    fn standard_fields_are_addressable() {
        let mut m = message();
        m.correlation_id = Some("c1".into());
        m.priority = 7;
        assert!(Selector::parse("JMSCorrelationID = 'c1' AND JMSPriority >= 5")
            .unwrap()
            .matches(&m));
    }

    #[test]
    fn escaped_quotes() {
        let m = Message::text("").with_property("name", "o'brien");
        assert!(Selector::parse("name = 'o''brien'").unwrap().matches(&m));
    }

    #[test]
    fn rejects_deep_nesting() {
        let nots = format!("{}a = 1", "NOT ".repeat(200_000));
        let parens = format!("{}a = 1{}", "(".repeat(10_000), ")".repeat(10_000));
        for deep in [nots, parens] {
            match Selector::parse(&deep) {
                Err(BrokerError::InvalidSelector { selector, reason }) => {
                    assert!(reason.contains("nested"), "{reason}");
                    assert!(selector.len() < 100);
                }
                other => panic!("expected a nesting error, got {other:?}"),
            }
        }

        let limit = format!("{}count = 12", "NOT ".repeat(MAX_NESTING));
        // An even number of NOTs cancels out.
        assert!(Selector::parse(&limit).unwrap().matches(&message()));
        let over = format!("{}count = 12", "NOT ".repeat(MAX_NESTING + 1));
        assert!(Selector::parse(&over).is_err());
    }

    #[test]
    fn long_flat_chains_are_not_nesting() {
        let chain = vec!["count = 12"; 50_000].join(" AND ");
        assert!(Selector::parse(&chain).unwrap().matches(&message()));
        let either = format!("{} OR foo = 'zzz'", vec!["count = 1"; 50_000].join(" OR "));
        assert!(Selector::parse(&either).unwrap().matches(&message()));
    }

    #[test]
    fn rejects_malformed_selectors() {
        for bad in ["foo =", "foo 'x'", "(foo = 'x'", "foo = 'x' extra", "foo = 'x", "#"] {
            assert!(
                matches!(Selector::parse(bad), Err(BrokerError::InvalidSelector { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
