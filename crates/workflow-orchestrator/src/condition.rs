//! Condition expressions gating conditional task dispatch.
//!
//! The grammar is minimal: a bare task id means "that task completed", and
//! expressions compose with `NOT`, `AND`, `OR`, and parentheses. Expressions
//! are parsed once at workflow validation and evaluated against the status
//! map at dispatch time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionExpr {
    /// True iff the referenced task reached `completed`.
    Task(String),
    Not(Box<ConditionExpr>),
    And(Box<ConditionExpr>, Box<ConditionExpr>),
    Or(Box<ConditionExpr>, Box<ConditionExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
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
            c if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '-' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.to_ascii_uppercase().as_str() {
                    "NOT" => tokens.push(Token::Not),
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
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

    // expr := and_expr (OR and_expr)*
    fn parse_expr(&mut self) -> Result<ConditionExpr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = ConditionExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and_expr := unary (AND unary)*
    fn parse_and(&mut self) -> Result<ConditionExpr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_unary()?;
            left = ConditionExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // unary := NOT unary | primary
    fn parse_unary(&mut self) -> Result<ConditionExpr, String> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(ConditionExpr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    // primary := '(' expr ')' | ident
    fn parse_primary(&mut self) -> Result<ConditionExpr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(Token::Ident(name)) => Ok(ConditionExpr::Task(name)),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

impl ConditionExpr {
    /// Parse a condition string into its AST form.
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err("empty condition".to_string());
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!(
                "trailing tokens after expression: {:?}",
                &parser.tokens[parser.pos..]
            ));
        }
        Ok(expr)
    }

    /// Task ids this expression reads.
    pub fn referenced_tasks(&self) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut HashSet<String>) {
        match self {
            ConditionExpr::Task(id) => {
                out.insert(id.clone());
            }
            ConditionExpr::Not(inner) => inner.collect_references(out),
            ConditionExpr::And(left, right) | ConditionExpr::Or(left, right) => {
                left.collect_references(out);
                right.collect_references(out);
            }
        }
    }

    /// Evaluate against a completion predicate over task ids.
    pub fn evaluate(&self, is_completed: &dyn Fn(&str) -> bool) -> bool {
        match self {
            ConditionExpr::Task(id) => is_completed(id),
            ConditionExpr::Not(inner) => !inner.evaluate(is_completed),
            ConditionExpr::And(left, right) => {
                left.evaluate(is_completed) && right.evaluate(is_completed)
            }
            ConditionExpr::Or(left, right) => {
                left.evaluate(is_completed) || right.evaluate(is_completed)
            }
        }
    }
}
