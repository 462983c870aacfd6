use regex::Regex;

use crate::{
    conditions::{
        ast::{BinaryOp, Node, UnaryOp},
        functions::{self, time},
        ConditionError,
    },
    properties::PropertyKind,
};

/// Static type of an expression. `Unknown` is compatible with everything and is what free
/// identifiers and unknown functions produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Type {
    Nil,
    Bool,
    Int,
    Float,
    String,
    Time,
    Array,
    Unknown,
}

impl From<PropertyKind> for Type {
    fn from(kind: PropertyKind) -> Self {
        match kind {
            PropertyKind::String => Type::String,
            PropertyKind::Int => Type::Int,
            PropertyKind::Float => Type::Float,
            PropertyKind::Bool => Type::Bool,
            PropertyKind::Timestamp => Type::Time,
        }
    }
}

impl Type {
    fn name(self) -> &'static str {
        match self {
            Type::Nil => "nil",
            Type::Bool => "bool",
            Type::Int => "int",
            Type::Float => "float",
            Type::String => "string",
            Type::Time => "time",
            Type::Array => "array",
            Type::Unknown => "unknown",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Time)
    }

    fn accepts(self, actual: Type) -> bool {
        match (self, actual) {
            (Type::Unknown, _) | (_, Type::Unknown) => true,
            (Type::Time, Type::Int) | (Type::Float, Type::Int) => true,
            (expected, actual) => expected == actual,
        }
    }
}

/// Static type check over a parsed condition.
///
/// The untyped checker only knows literal and operator types, which is enough to reject
/// expressions like `'qwert' > 3` without any knowledge of the host. The typed checker also
/// verifies calls against built-in function signatures and looks up declared property types.
pub(crate) struct Checker<'a> {
    typed: bool,
    variable_type: Option<&'a dyn Fn(&str) -> Option<Type>>,
}

impl<'a> Checker<'a> {
    pub(crate) fn untyped() -> Self {
        Checker {
            typed: false,
            variable_type: None,
        }
    }

    pub(crate) fn typed(variable_type: &'a dyn Fn(&str) -> Option<Type>) -> Self {
        Checker {
            typed: true,
            variable_type: Some(variable_type),
        }
    }

    /// Checks a whole condition, which must produce a boolean.
    pub(crate) fn check_condition(&self, node: &Node) -> Result<(), ConditionError> {
        match self.check(node)? {
            Type::Bool | Type::Unknown => Ok(()),
            other => Err(ConditionError::Type(format!(
                "expected bool, but got {}",
                other.name()
            ))),
        }
    }

    fn check(&self, node: &Node) -> Result<Type, ConditionError> {
        Ok(match node {
            Node::Nil => Type::Nil,
            Node::Bool(_) => Type::Bool,
            Node::Int(_) => Type::Int,
            Node::Float(_) => Type::Float,
            Node::Str(_) => Type::String,
            Node::Array(items) => {
                for item in items {
                    self.check(item)?;
                }
                Type::Array
            }
            Node::Ident(name) => {
                if time::constant(name).is_some() {
                    Type::String
                } else {
                    self.variable_type
                        .and_then(|lookup| lookup(name.as_str()))
                        .unwrap_or(Type::Unknown)
                }
            }
            Node::Call { name, args } => {
                let arg_types = args
                    .iter()
                    .map(|arg| self.check(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                self.check_call(name, &arg_types)?
            }
            Node::Unary { op, operand } => {
                let operand = self.check(operand)?;
                match op {
                    UnaryOp::Not if matches!(operand, Type::Bool | Type::Unknown) => Type::Bool,
                    UnaryOp::Neg if operand.is_numeric() || operand == Type::Unknown => operand,
                    _ => {
                        let symbol = if *op == UnaryOp::Not { "!" } else { "-" };
                        return Err(ConditionError::Type(format!(
                            "invalid operation: {symbol} (mismatched type {})",
                            operand.name()
                        )));
                    }
                }
            }
            Node::Binary { op, left, right } => {
                let left_type = self.check(left)?;
                let right_type = self.check(right)?;
                if *op == BinaryOp::Matches {
                    if let Node::Str(pattern) = right.as_ref() {
                        Regex::new(pattern).map_err(|err| {
                            ConditionError::Type(format!("invalid regular expression: {err}"))
                        })?;
                    }
                }
                binary_type(*op, left_type, right_type).ok_or_else(|| {
                    ConditionError::Type(format!(
                        "invalid operation: {} (mismatched types {} and {})",
                        op.symbol(),
                        left_type.name(),
                        right_type.name()
                    ))
                })?
            }
            Node::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let condition = self.check(condition)?;
                if !matches!(condition, Type::Bool | Type::Unknown) {
                    return Err(ConditionError::Type(format!(
                        "non-bool expression (type {}) used as condition",
                        condition.name()
                    )));
                }
                let then = self.check(then)?;
                let otherwise = self.check(otherwise)?;
                if then == otherwise {
                    then
                } else {
                    Type::Unknown
                }
            }
        })
    }

    fn check_call(&self, name: &str, args: &[Type]) -> Result<Type, ConditionError> {
        if !self.typed {
            return Ok(Type::Unknown);
        }
        let Some(signature) = functions::signature(name) else {
            return Ok(Type::Unknown);
        };

        let max = signature.params.len();
        let min = max - signature.optional;
        if args.len() < min || args.len() > max {
            return Err(ConditionError::Type(format!(
                "{name} called with {} arguments, expected {}",
                args.len(),
                if min == max {
                    max.to_string()
                } else {
                    format!("{min} to {max}")
                }
            )));
        }
        for (i, (expected, actual)) in signature.params.iter().zip(args).enumerate() {
            if !expected.accepts(*actual) && *actual != Type::Nil {
                return Err(ConditionError::Type(format!(
                    "cannot use {} as argument {} of {name} (expected {})",
                    actual.name(),
                    i + 1,
                    expected.name()
                )));
            }
        }
        Ok(signature.returns)
    }
}

fn binary_type(op: BinaryOp, left: Type, right: Type) -> Option<Type> {
    use Type::*;

    let bool_like = |t: Type| matches!(t, Bool | Unknown);
    let string_like = |t: Type| matches!(t, String | Unknown);
    let numeric_like = |t: Type| t.is_numeric() || t == Unknown;

    match op {
        BinaryOp::Or | BinaryOp::And => (bool_like(left) && bool_like(right)).then_some(Bool),
        BinaryOp::Eq | BinaryOp::Ne => Some(Bool),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let comparable = left == Unknown
                || right == Unknown
                || (left.is_numeric() && right.is_numeric())
                || (left == String && right == String);
            comparable.then_some(Bool)
        }
        BinaryOp::In | BinaryOp::NotIn => matches!(right, Array | Unknown).then_some(Bool),
        BinaryOp::Contains | BinaryOp::StartsWith | BinaryOp::EndsWith | BinaryOp::Matches => {
            (string_like(left) && string_like(right)).then_some(Bool)
        }
        BinaryOp::Add => match (left, right) {
            (Unknown, _) | (_, Unknown) => Some(Unknown),
            (String, String) => Some(String),
            (Int, Int) => Some(Int),
            (Time, Int) | (Int, Time) => Some(Time),
            (Float, Int | Float) | (Int, Float) => Some(Float),
            _ => None,
        },
        BinaryOp::Sub => match (left, right) {
            (Unknown, _) | (_, Unknown) => Some(Unknown),
            (Time | Int, Time) | (Int, Int) => Some(Int),
            (Time, Int) => Some(Time),
            (Float, Int | Float) | (Int, Float) => Some(Float),
            _ => None,
        },
        BinaryOp::Mul => match (left, right) {
            (Unknown, _) | (_, Unknown) => Some(Unknown),
            (Int, Int) => Some(Int),
            (Float, Int | Float) | (Int, Float) => Some(Float),
            _ => None,
        },
        BinaryOp::Div => (numeric_like(left)
            && numeric_like(right)
            && left != Time
            && right != Time)
            .then_some(Float),
        BinaryOp::Mod => matches!((left, right), (Int | Unknown, Int | Unknown)).then_some(Int),
        BinaryOp::Coalesce => Some(match (left, right) {
            (Nil, right) => right,
            (left, right) if left == right => left,
            _ => Unknown,
        }),
    }
}
