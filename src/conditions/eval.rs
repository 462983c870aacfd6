use std::cmp::Ordering;

use regex::Regex;

use crate::conditions::{
    ast::{BinaryOp, Node, UnaryOp},
    functions::{self, time},
    value::Number,
    Value,
};

/// Everything a condition can observe about the outside world.
///
/// Implementations supply property values and the dynamic functions (history lookups, host
/// capabilities). Evaluation never performs I/O other than through this trait.
pub trait Environment {
    /// Current value of a property, or [`Value::Nil`] when it is not available.
    fn property(&self, name: &str) -> Value;

    /// Call a dynamic function such as `eventCount`. Returns `None` when the function is not
    /// provided by this environment.
    fn call_function(&self, name: &str, args: &[Value]) -> Option<Result<Value, String>> {
        let _ = (name, args);
        None
    }

    /// Random value fixed for the lifetime of the session backing `sessionRand()`.
    fn session_random(&self) -> i64;
}

/// Environment without properties or dynamic functions.
pub(crate) struct EmptyEnvironment;

impl Environment for EmptyEnvironment {
    fn property(&self, _name: &str) -> Value {
        Value::Nil
    }

    fn session_random(&self) -> i64 {
        0
    }
}

pub(crate) fn evaluate(node: &Node, env: &dyn Environment) -> Result<Value, String> {
    match node {
        Node::Nil => Ok(Value::Nil),
        Node::Bool(b) => Ok(Value::Bool(*b)),
        Node::Int(i) => Ok(Value::Int(*i)),
        Node::Float(f) => Ok(Value::Float(*f)),
        Node::Str(s) => Ok(Value::String(s.clone())),
        Node::Array(items) => items
            .iter()
            .map(|item| evaluate(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Node::Ident(name) => Ok(match time::constant(name) {
            Some(constant) => Value::from(constant),
            None => env.property(name),
        }),
        Node::Call { name, args } => {
            let args = args
                .iter()
                .map(|arg| evaluate(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &args, env)
        }
        Node::Unary { op, operand } => {
            let operand = evaluate(operand, env)?;
            match (op, &operand) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(i)) => i
                    .checked_neg()
                    .map(Value::Int)
                    .ok_or_else(|| "integer overflow".to_owned()),
                (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                (op, operand) => Err(format!(
                    "invalid operation: {} {}",
                    if *op == UnaryOp::Not { "!" } else { "-" },
                    operand.type_name()
                )),
            }
        }
        Node::Binary { op, left, right } => {
            let left = evaluate(left, env)?;
            match op {
                BinaryOp::Or | BinaryOp::And => {
                    let Value::Bool(left) = left else {
                        return Err(mismatched(*op, &left, None));
                    };
                    if left == (*op == BinaryOp::Or) {
                        return Ok(Value::Bool(left));
                    }
                    match evaluate(right, env)? {
                        Value::Bool(right) => Ok(Value::Bool(right)),
                        other => Err(mismatched(*op, &Value::Bool(left), Some(&other))),
                    }
                }
                BinaryOp::Coalesce => {
                    if left.is_nil() {
                        evaluate(right, env)
                    } else {
                        Ok(left)
                    }
                }
                _ => {
                    let right = evaluate(right, env)?;
                    binary(*op, &left, &right)
                }
            }
        }
        Node::Conditional {
            condition,
            then,
            otherwise,
        } => match evaluate(condition, env)? {
            Value::Bool(true) => evaluate(then, env),
            Value::Bool(false) => evaluate(otherwise, env),
            other => Err(format!(
                "non-bool value (type {}) used as condition",
                other.type_name()
            )),
        },
    }
}

fn call(name: &str, args: &[Value], env: &dyn Environment) -> Result<Value, String> {
    if let Some(result) = functions::call_static(name, args, env) {
        return result;
    }
    functions::check_arity(name, args)?;
    env.call_function(name, args)
        .unwrap_or_else(|| Err(format!("function {name} is not available")))
}

fn mismatched(op: BinaryOp, left: &Value, right: Option<&Value>) -> String {
    match right {
        Some(right) => format!(
            "invalid operation: {} (mismatched types {} and {})",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ),
        None => format!(
            "invalid operation: {} on {}",
            op.symbol(),
            left.type_name()
        ),
    }
}

pub(crate) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, String> {
    let mismatch = || mismatched(op, left, Some(right));
    let overflow = || "integer overflow".to_owned();

    match op {
        BinaryOp::Eq => Ok(Value::Bool(left.loosely_equals(right))),
        BinaryOp::Ne => Ok(Value::Bool(!left.loosely_equals(right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(left, right).ok_or_else(mismatch)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In | BinaryOp::NotIn => {
            let found = match right {
                Value::Array(items) => items.iter().any(|item| item.loosely_equals(left)),
                Value::Nil => false,
                _ => return Err(mismatch()),
            };
            Ok(Value::Bool(found == (op == BinaryOp::In)))
        }
        BinaryOp::Contains | BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Matches => {
            let (Value::String(left), Value::String(right)) = (left, right) else {
                return Err(mismatch());
            };
            Ok(Value::Bool(match op {
                BinaryOp::Contains => left.contains(right.as_str()),
                BinaryOp::StartsWith => left.starts_with(right.as_str()),
                BinaryOp::EndsWith => left.ends_with(right.as_str()),
                _ => Regex::new(right)
                    .map_err(|err| format!("invalid regular expression: {err}"))?
                    .is_match(left),
            }))
        }
        BinaryOp::Add => match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(format!("{l}{r}"))),
            (Value::Int(l), Value::Int(r)) => l.checked_add(*r).map(Value::Int).ok_or_else(overflow),
            (Value::Time(t), Value::Int(d)) | (Value::Int(d), Value::Time(t)) => {
                t.checked_add(*d).map(Value::Time).ok_or_else(overflow)
            }
            _ => float_op(left, right, |l, r| l + r).ok_or_else(mismatch),
        },
        BinaryOp::Sub => match (left, right) {
            (Value::Time(l), Value::Time(r))
            | (Value::Int(l), Value::Time(r))
            | (Value::Int(l), Value::Int(r)) => l.checked_sub(*r).map(Value::Int).ok_or_else(overflow),
            (Value::Time(t), Value::Int(d)) => t.checked_sub(*d).map(Value::Time).ok_or_else(overflow),
            _ => float_op(left, right, |l, r| l - r).ok_or_else(mismatch),
        },
        BinaryOp::Mul => match (left, right) {
            (Value::Int(l), Value::Int(r)) => l.checked_mul(*r).map(Value::Int).ok_or_else(overflow),
            _ => float_op(left, right, |l, r| l * r).ok_or_else(mismatch),
        },
        BinaryOp::Div => match (left, right) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                float_op(left, right, |l, r| l / r).ok_or_else(mismatch)
            }
            _ => Err(mismatch()),
        },
        BinaryOp::Mod => match (left, right) {
            (Value::Int(_), Value::Int(0)) => Err("integer divide by zero".to_owned()),
            (Value::Int(l), Value::Int(r)) => Ok(Value::Int(l.wrapping_rem(*r))),
            _ => Err(mismatch()),
        },
        // Short-circuit operators are handled before both sides are evaluated.
        BinaryOp::Or | BinaryOp::And | BinaryOp::Coalesce => Err(mismatch()),
    }
}

/// Arithmetic on two plain numbers (not times), producing a float.
fn float_op(left: &Value, right: &Value, op: impl Fn(f64, f64) -> f64) -> Option<Value> {
    match (left, right) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            let l = left.as_number()?.as_f64();
            let r = right.as_number()?.as_f64();
            Some(Value::Float(op(l, r)))
        }
        _ => None,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => match (left.as_number()?, right.as_number()?) {
            (Number::Int(l), Number::Int(r)) => Some(l.cmp(&r)),
            (l, r) => l.as_f64().partial_cmp(&r.as_f64()),
        },
    }
}
