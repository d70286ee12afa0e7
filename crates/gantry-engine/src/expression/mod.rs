//! Typed expression interpreter for job and concurrency conditions.
//!
//! Expressions are written inside `${{ }}` blocks and evaluated against a
//! fixed set of named contexts (`cds`, `git`, `vars`, `jobs`, `needs`,
//! `matrix`). A condition must produce a boolean; anything else is an error.

mod eval;
mod lexer;
mod parser;

pub use eval::Evaluator;
pub use parser::{BinaryOp, Expr, parse};

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("unexpected character at offset {0}")]
    Lex(usize),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown function {0}()")]
    UnknownFunction(String),
    #[error("{name}() expects {expected} argument(s), got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("missing {0} context")]
    MissingContext(String),
    #[error("expression does not return a boolean, got {0}")]
    NotBoolean(String),
}

static BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\$\{\{(.*?)\}\}").expect("valid expression block regex"));

/// Named contexts visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct ExpressionContext {
    contexts: Map<String, Value>,
}

impl ExpressionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.contexts.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.contexts.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.contexts.get(name)
    }
}

/// Replace every `${{ }}` block of `template`.
///
/// A template made of exactly one block yields the block's typed value;
/// otherwise blocks are stringified into the surrounding text.
pub fn interpolate(template: &str, ctx: &ExpressionContext) -> Result<Value, ExpressionError> {
    let trimmed = template.trim();
    if let Some(caps) = BLOCK_RE.captures(trimmed) {
        let whole = caps.get(0).map(|m| m.as_str().len()).unwrap_or_default();
        if whole == trimmed.len() {
            let expr = parse(caps[1].trim())?;
            return Evaluator::new(ctx).eval(&expr);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in BLOCK_RE.captures_iter(template) {
        let Some(block) = caps.get(0) else { continue };
        out.push_str(&template[last..block.start()]);
        let expr = parse(caps[1].trim())?;
        out.push_str(&eval::to_display(&Evaluator::new(ctx).eval(&expr)?));
        last = block.end();
    }
    out.push_str(&template[last..]);
    Ok(Value::String(out))
}

/// Evaluate a condition that must produce `true` or `false`.
///
/// Bare expressions are treated as if wrapped in `${{ }}`.
pub fn evaluate_condition(condition: &str, ctx: &ExpressionContext) -> Result<bool, ExpressionError> {
    let condition = condition.trim();
    let wrapped;
    let source = if condition.starts_with("${{") {
        condition
    } else {
        wrapped = format!("${{{{ {condition} }}}}");
        &wrapped
    };

    match interpolate(source, ctx)? {
        Value::Bool(b) => Ok(b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
        other => Err(ExpressionError::NotBoolean(eval::to_display(&other))),
    }
}
