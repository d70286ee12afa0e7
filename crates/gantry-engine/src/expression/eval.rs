//! Tree-walking evaluator and built-in functions.

use super::parser::{BinaryOp, Expr};
use super::{ExpressionContext, ExpressionError};
use serde_json::Value;
use std::cmp::Ordering;

pub struct Evaluator<'a> {
    ctx: &'a ExpressionContext,
}

impl<'a> Evaluator<'a> {
    pub fn new(ctx: &'a ExpressionContext) -> Self {
        Self { ctx }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, ExpressionError> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Context(name) => Ok(self.ctx.get(name).cloned().unwrap_or(Value::Null)),
            Expr::Property(target, field) => {
                let target = self.eval(target)?;
                Ok(target.get(field).cloned().unwrap_or(Value::Null))
            }
            Expr::Index(target, index) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                let found = match (&target, &index) {
                    (Value::Object(map), Value::String(key)) => map.get(key),
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .and_then(|f| items.get(f as usize)),
                    _ => None,
                };
                Ok(found.cloned().unwrap_or(Value::Null))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::Binary(BinaryOp::And, left, right) => {
                if !truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary(BinaryOp::Or, left, right) => {
                if truthy(&self.eval(left)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&self.eval(right)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(Value::Bool(compare(*op, &left, &right)))
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, args)
            }
        }
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
        match name {
            "always" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::Bool(true))
            }
            "success" => {
                arity(name, &args, 0, 0)?;
                let results = self.need_results()?;
                Ok(Value::Bool(results.iter().all(|r| r.eq_ignore_ascii_case("success"))))
            }
            "failure" => {
                arity(name, &args, 0, 0)?;
                let results = self.need_results()?;
                Ok(Value::Bool(results.iter().any(|r| r.eq_ignore_ascii_case("fail"))))
            }
            "cancelled" => {
                arity(name, &args, 0, 0)?;
                let results = self.need_results()?;
                Ok(Value::Bool(results.iter().any(|r| r.eq_ignore_ascii_case("stopped"))))
            }
            "contains" => {
                arity(name, &args, 2, 2)?;
                let found = match &args[0] {
                    Value::Array(items) => items.iter().any(|i| loose_eq(i, &args[1])),
                    haystack => to_display(haystack)
                        .to_lowercase()
                        .contains(&to_display(&args[1]).to_lowercase()),
                };
                Ok(Value::Bool(found))
            }
            "startsWith" => {
                arity(name, &args, 2, 2)?;
                let (s, prefix) = (to_display(&args[0]), to_display(&args[1]));
                Ok(Value::Bool(s.to_lowercase().starts_with(&prefix.to_lowercase())))
            }
            "endsWith" => {
                arity(name, &args, 2, 2)?;
                let (s, suffix) = (to_display(&args[0]), to_display(&args[1]));
                Ok(Value::Bool(s.to_lowercase().ends_with(&suffix.to_lowercase())))
            }
            "format" => {
                arity(name, &args, 1, usize::MAX)?;
                format_string(&to_display(&args[0]), &args[1..]).map(Value::String)
            }
            "join" => {
                arity(name, &args, 1, 2)?;
                let sep = args.get(1).map(to_display).unwrap_or_else(|| ",".to_string());
                let joined = match &args[0] {
                    Value::Array(items) => items.iter().map(to_display).collect::<Vec<_>>().join(&sep),
                    other => to_display(other),
                };
                Ok(Value::String(joined))
            }
            "toJSON" => {
                arity(name, &args, 1, 1)?;
                serde_json::to_string(&args[0])
                    .map(Value::String)
                    .map_err(|e| ExpressionError::InvalidArgument(e.to_string()))
            }
            "fromJSON" => {
                arity(name, &args, 1, 1)?;
                serde_json::from_str(&to_display(&args[0]))
                    .map_err(|e| ExpressionError::InvalidArgument(format!("fromJSON: {e}")))
            }
            "toLower" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::String(to_display(&args[0]).to_lowercase()))
            }
            "toUpper" => {
                arity(name, &args, 1, 1)?;
                Ok(Value::String(to_display(&args[0]).to_uppercase()))
            }
            _ => Err(ExpressionError::UnknownFunction(name.to_string())),
        }
    }

    /// Results of the direct dependencies, from the `needs` context.
    fn need_results(&self) -> Result<Vec<String>, ExpressionError> {
        let needs = self
            .ctx
            .get("needs")
            .and_then(Value::as_object)
            .ok_or_else(|| ExpressionError::MissingContext("needs".to_string()))?;
        Ok(needs
            .values()
            .map(|n| n.get("result").map(to_display).unwrap_or_default())
            .collect())
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), ExpressionError> {
    if args.len() < min || args.len() > max {
        let expected = match (min, max) {
            (min, max) if min == max => min.to_string(),
            (min, usize::MAX) => format!("at least {min}"),
            (min, max) => format!("{min} to {max}"),
        };
        return Err(ExpressionError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn format_string(template: &str, args: &[Value]) -> Result<String, ExpressionError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == '}' {
                        break;
                    }
                    digits.push(d);
                }
                let index: usize = digits.parse().map_err(|_| {
                    ExpressionError::InvalidArgument(format!("format: invalid placeholder {{{digits}}}"))
                })?;
                let arg = args.get(index).ok_or_else(|| {
                    ExpressionError::InvalidArgument(format!("format: missing argument {index}"))
                })?;
                out.push_str(&to_display(arg));
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// String form used for interpolation and function arguments.
pub(crate) fn to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Equality with numeric coercion across types and case-insensitive strings.
fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Array(_), _) | (_, Value::Array(_)) | (Value::Object(_), _) | (_, Value::Object(_)) => {
            left == right
        }
        _ => to_number(left) == to_number(right),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> bool {
    match op {
        BinaryOp::Eq => return loose_eq(left, right),
        BinaryOp::NotEq => return !loose_eq(left, right),
        _ => {}
    }

    let ordering = match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.to_lowercase().cmp(&b.to_lowercase())),
        _ => to_number(left).partial_cmp(&to_number(right)),
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match op {
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::Le => ordering != Ordering::Greater,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::Ge => ordering != Ordering::Less,
        _ => false,
    }
}
