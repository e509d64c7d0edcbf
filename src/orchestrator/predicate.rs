//! Minimal boolean expression language for step predicates (§3
//! "optional `Predicate`", §4.5 step 1).
//!
//! Grammar: `expr := or`, `or := and ("||" and)*`, `and := unary ("&&"
//! unary)*`, `unary := "!" unary | cmp`, `cmp := atom (("==" | "!=") atom)?`,
//! `atom := "true" | "false" | "(" expr ")" | ident | json-literal`. An
//! identifier resolves against the flow's current attribute map; a
//! missing attribute makes any comparison involving it `false` rather
//! than an error, since the predicate may reference an attribute the
//! plan hasn't resolved yet.

use serde_json::Value;
use thiserror::Error;

use crate::model::attribute::AttributeMap;

#[derive(Debug, Error, PartialEq)]
pub enum PredicateError {
    #[error("unexpected end of predicate expression")]
    UnexpectedEnd,

    #[error("unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("trailing input: {0}")]
    TrailingInput(String),
}

struct Parser<'a> {
    tokens: Vec<&'a str>,
    pos: usize,
}

fn tokenize(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' || c == ')' {
            tokens.push(&input[i..i + 1]);
            i += 1;
            continue;
        }
        if input[i..].starts_with("&&") || input[i..].starts_with("||") || input[i..].starts_with("==") || input[i..].starts_with("!=") {
            tokens.push(&input[i..i + 2]);
            i += 2;
            continue;
        }
        if c == '!' {
            tokens.push(&input[i..i + 1]);
            i += 1;
            continue;
        }
        if c == '"' {
            let start = i;
            i += 1;
            while i < bytes.len() && bytes[i] as char != '"' {
                i += 1;
            }
            i += 1;
            tokens.push(&input[start..i.min(bytes.len())]);
            continue;
        }
        let start = i;
        while i < bytes.len() {
            let c = bytes[i] as char;
            if c.is_whitespace() || c == '(' || c == ')' || c == '!' {
                break;
            }
            if input[i..].starts_with("&&") || input[i..].starts_with("||") || input[i..].starts_with("==") {
                break;
            }
            i += 1;
        }
        tokens.push(&input[start..i]);
    }
    tokens
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<&'a str> {
        let tok = self.peek();
        self.pos += 1;
        tok
    }

    fn parse_or(&mut self, attrs: &AttributeMap) -> Result<bool, PredicateError> {
        let mut value = self.parse_and(attrs)?;
        while self.peek() == Some("||") {
            self.advance();
            let rhs = self.parse_and(attrs)?;
            value = value || rhs;
        }
        Ok(value)
    }

    fn parse_and(&mut self, attrs: &AttributeMap) -> Result<bool, PredicateError> {
        let mut value = self.parse_unary(attrs)?;
        while self.peek() == Some("&&") {
            self.advance();
            let rhs = self.parse_unary(attrs)?;
            value = value && rhs;
        }
        Ok(value)
    }

    fn parse_unary(&mut self, attrs: &AttributeMap) -> Result<bool, PredicateError> {
        if self.peek() == Some("!") {
            self.advance();
            let value = self.parse_unary(attrs)?;
            return Ok(!value);
        }
        self.parse_cmp(attrs)
    }

    fn parse_cmp(&mut self, attrs: &AttributeMap) -> Result<bool, PredicateError> {
        let lhs = self.parse_atom(attrs)?;
        match self.peek() {
            Some("==") => {
                self.advance();
                let rhs = self.parse_atom_value(attrs)?;
                Ok(lhs == rhs)
            }
            Some("!=") => {
                self.advance();
                let rhs = self.parse_atom_value(attrs)?;
                Ok(lhs != rhs)
            }
            _ => Ok(truthy(&lhs)),
        }
    }

    fn parse_atom(&mut self, attrs: &AttributeMap) -> Result<Value, PredicateError> {
        self.parse_atom_value(attrs)
    }

    fn parse_atom_value(&mut self, attrs: &AttributeMap) -> Result<Value, PredicateError> {
        let tok = self
            .advance()
            .ok_or(PredicateError::UnexpectedEnd)?;
        match tok {
            "(" => {
                let inner = self.parse_or_value(attrs)?;
                match self.advance() {
                    Some(")") => Ok(inner),
                    _ => Err(PredicateError::UnexpectedToken("expected )".to_string())),
                }
            }
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            "null" => Ok(Value::Null),
            other if other.starts_with('"') => {
                let inner = other.trim_matches('"');
                Ok(Value::String(inner.to_string()))
            }
            other if other.parse::<f64>().is_ok() => {
                Ok(serde_json::json!(other.parse::<f64>().unwrap()))
            }
            ident => Ok(attrs
                .get(ident)
                .map(|v| v.value.clone())
                .unwrap_or(Value::Null)),
        }
    }

    // Parenthesized sub-expressions may themselves be boolean; represent
    // the result as a JSON bool so it composes with `parse_atom_value`.
    fn parse_or_value(&mut self, attrs: &AttributeMap) -> Result<Value, PredicateError> {
        Ok(Value::Bool(self.parse_or(attrs)?))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluates `expr` against `attributes`. An absent predicate is handled
/// by the caller (treated as always-true); this function only parses and
/// evaluates a present expression string.
pub fn evaluate(expr: &str, attributes: &AttributeMap) -> Result<bool, PredicateError> {
    let tokens = tokenize(expr);
    let mut parser = Parser { tokens, pos: 0 };
    let result = parser.parse_or(attributes)?;
    if parser.pos != parser.tokens.len() {
        return Err(PredicateError::TrailingInput(
            parser.tokens[parser.pos..].join(" "),
        ));
    }
    Ok(result)
}
