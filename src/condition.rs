//! Safe routing-condition expressions.
//!
//! Workflow definitions attach small boolean expressions to steps
//! (`condition`) and routes (`when`). The accepted grammar is a closed
//! subset: identifier truthiness, `==`/`!=` against a literal, `in` against
//! a literal list, combined with `&&`/`||` and parentheses:
//!
//! ```text
//! severity == 'high' && (tier in ['gold', 'silver'] || escalated)
//! ```
//!
//! Expressions are parsed up front so malformed conditions are rejected at
//! definition time; evaluation cannot execute arbitrary code. Comparisons
//! over identifiers absent from the context never match.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Error raised when an expression does not conform to the grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionError {
    pub message: String,
}

impl ConditionError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for ConditionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid condition: {}", self.message)
    }
}

impl std::error::Error for ConditionError {}

/// Literal operand in a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Truthy(String),
    Eq(String, Literal),
    Ne(String, Literal),
    In(String, Vec<Literal>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// Evaluation context: flattened step outputs, workflow metadata, and the
/// triggering completion's summary fields.
pub type Context = BTreeMap<String, Value>;

/// Parses an expression. Used both for definition-time validation and for
/// run-time evaluation.
pub fn parse(input: &str) -> Result<Expr, ConditionError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ConditionError::new(format!(
            "unexpected trailing input in '{}'",
            input
        )));
    }
    Ok(expr)
}

/// Parses and evaluates `input` against `context` in one call.
pub fn evaluate(input: &str, context: &Context) -> Result<bool, ConditionError> {
    Ok(eval(&parse(input)?, context))
}

/// Evaluates a parsed expression.
pub fn eval(expr: &Expr, context: &Context) -> bool {
    match expr {
        Expr::Truthy(ident) => context.get(ident).map(is_truthy).unwrap_or(false),
        Expr::Eq(ident, lit) => context
            .get(ident)
            .map(|v| literal_matches(v, lit))
            .unwrap_or(false),
        Expr::Ne(ident, lit) => context
            .get(ident)
            .map(|v| !literal_matches(v, lit))
            .unwrap_or(false),
        Expr::In(ident, lits) => context
            .get(ident)
            .map(|v| lits.iter().any(|lit| literal_matches(v, lit)))
            .unwrap_or(false),
        Expr::And(a, b) => eval(a, context) && eval(b, context),
        Expr::Or(a, b) => eval(a, context) || eval(b, context),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn literal_matches(value: &Value, lit: &Literal) -> bool {
    match lit {
        Literal::Str(expected) => value_text(value) == *expected,
        Literal::Num(expected) => match value {
            Value::Number(n) => n.as_f64().map(|f| f == *expected).unwrap_or(false),
            Value::String(s) => s.parse::<f64>().map(|f| f == *expected).unwrap_or(false),
            _ => false,
        },
        Literal::Bool(expected) => match value {
            Value::Bool(b) => b == expected,
            Value::String(s) => s.parse::<bool>().map(|b| b == *expected).unwrap_or(false),
            _ => false,
        },
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    KwIn,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::EqEq);
                } else {
                    return Err(ConditionError::new("single '=' is not an operator"));
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::NotEq);
                } else {
                    return Err(ConditionError::new("'!' must be followed by '='"));
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(ConditionError::new("single '&' is not an operator"));
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::OrOr);
                } else {
                    return Err(ConditionError::new("single '|' is not an operator"));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                for ch in chars.by_ref() {
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    text.push(ch);
                }
                if !closed {
                    return Err(ConditionError::new("unterminated string literal"));
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ConditionError::new(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match text.as_str() {
                    "in" => tokens.push(Token::KwIn),
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => {
                return Err(ConditionError::new(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    if tokens.is_empty() {
        return Err(ConditionError::new("empty expression"));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.primary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let right = self.primary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, ConditionError> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ConditionError::new("expected ')'")),
                }
            }
            Some(Token::Ident(name)) => self.comparison(name),
            other => Err(ConditionError::new(format!(
                "expected identifier or '(', got {:?}",
                other
            ))),
        }
    }

    fn comparison(&mut self, ident: String) -> Result<Expr, ConditionError> {
        match self.peek() {
            Some(Token::EqEq) => {
                self.next();
                Ok(Expr::Eq(ident, self.literal()?))
            }
            Some(Token::NotEq) => {
                self.next();
                Ok(Expr::Ne(ident, self.literal()?))
            }
            Some(Token::KwIn) => {
                self.next();
                if self.next() != Some(Token::LBracket) {
                    return Err(ConditionError::new("expected '[' after 'in'"));
                }
                let mut items = vec![self.literal()?];
                loop {
                    match self.next() {
                        Some(Token::Comma) => items.push(self.literal()?),
                        Some(Token::RBracket) => break,
                        _ => return Err(ConditionError::new("expected ',' or ']' in list")),
                    }
                }
                Ok(Expr::In(ident, items))
            }
            _ => Ok(Expr::Truthy(ident)),
        }
    }

    fn literal(&mut self) -> Result<Literal, ConditionError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Num(n)) => Ok(Literal::Num(n)),
            Some(Token::Bool(b)) => Ok(Literal::Bool(b)),
            other => Err(ConditionError::new(format!(
                "expected literal, got {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> Context {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn equality_on_strings() {
        let context = ctx(&[("severity", json!("high"))]);
        assert!(evaluate("severity == 'high'", &context).unwrap());
        assert!(!evaluate("severity == 'low'", &context).unwrap());
        assert!(evaluate("severity != 'low'", &context).unwrap());
    }

    #[test]
    fn membership() {
        let context = ctx(&[("tier", json!("gold"))]);
        assert!(evaluate("tier in ['gold', 'silver']", &context).unwrap());
        assert!(!evaluate("tier in ['bronze']", &context).unwrap());
    }

    #[test]
    fn conjunctions_and_parens() {
        let context = ctx(&[("a", json!("x")), ("b", json!("y"))]);
        assert!(evaluate("a == 'x' && b == 'y'", &context).unwrap());
        assert!(evaluate("a == 'z' || b == 'y'", &context).unwrap());
        assert!(evaluate("(a == 'z' || b == 'y') && a == 'x'", &context).unwrap());
    }

    #[test]
    fn truthiness() {
        let context = ctx(&[
            ("yes", json!(true)),
            ("no", json!(false)),
            ("empty", json!("")),
            ("text", json!("something")),
        ]);
        assert!(evaluate("yes", &context).unwrap());
        assert!(!evaluate("no", &context).unwrap());
        assert!(!evaluate("empty", &context).unwrap());
        assert!(evaluate("text", &context).unwrap());
        assert!(!evaluate("missing", &context).unwrap());
    }

    #[test]
    fn numbers_and_bools() {
        let context = ctx(&[("count", json!(3)), ("flag", json!(true))]);
        assert!(evaluate("count == 3", &context).unwrap());
        assert!(!evaluate("count == 4", &context).unwrap());
        assert!(evaluate("flag == true", &context).unwrap());
    }

    #[test]
    fn absent_identifiers_never_match() {
        let context = Context::new();
        assert!(!evaluate("status == 'done'", &context).unwrap());
        assert!(!evaluate("status != 'done'", &context).unwrap());
        assert!(!evaluate("status in ['done']", &context).unwrap());
    }

    #[test]
    fn rejects_unsafe_or_malformed_input() {
        assert!(parse("").is_err());
        assert!(parse("a = 'x'").is_err());
        assert!(parse("__import__('os')").is_err());
        assert!(parse("a == 'x' &&").is_err());
        assert!(parse("a == ").is_err());
        assert!(parse("(a == 'x'").is_err());
        assert!(parse("a in ['x'").is_err());
        assert!(parse("a == 'x' extra").is_err());
    }
}
