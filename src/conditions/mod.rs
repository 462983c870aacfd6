//! Boolean condition language used to target actions, triggers and notifications.
//!
//! A condition is a small expression such as
//! `platform == 'ios' && versionGreaterThan(app_version, '2.1') && eventCount('signed_in') > 0`.
//! Conditions go through four stages: parsing, a static type check, constant folding (which also
//! removes dead branches) and evaluation against an [`Environment`].

use std::{
    collections::{BTreeSet, HashSet},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::properties::catalog;

mod ast;
mod checker;
mod eval;
pub mod functions;
mod lexer;
mod optimizer;
mod parser;
mod value;

pub use eval::Environment;
pub use value::Value;

use ast::Node;
use checker::{Checker, Type};

/// Problems with a condition, from parsing through evaluation.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConditionError {
    /// Empty condition strings are not allowed.
    #[error("Condition is empty string (not allowed). Use 'true' or 'false' for minimal condition.")]
    Empty,
    /// Malformed expression.
    #[error("invalid condition syntax at offset {offset}: {message}")]
    Parse {
        /// Byte offset into the condition source.
        offset: usize,
        /// Description of the problem.
        message: String,
    },
    /// Expression is well formed but its types do not line up.
    #[error("invalid condition: {0}")]
    Type(String),
    /// Call to a function that is not built in (strict validation only).
    #[error("Method included in condition which isn't recognized: {0}")]
    UnknownFunction(String),
    /// Reference to a property that is not declared (strict validation only).
    #[error("Variable included in condition which isn't recognized: {0}")]
    UnknownVariable(String),
    /// Runtime failure while evaluating a condition.
    #[error("error evaluating condition: {0}")]
    Evaluation(String),
}

/// How strictly conditions are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Every identifier must be a declared property and every call a built-in function. Used
    /// when authoring and signing configs.
    Strict,
    /// Unknown identifiers are allowed and invalid conditions in a config degrade to `false`.
    /// Used by deployed clients, which may receive configs written for newer releases.
    #[default]
    Lenient,
}

/// Names referenced by a condition, after dead branches are removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConditionFields {
    /// Every name, whether used as a value or called.
    pub identifiers: BTreeSet<String>,
    /// Names the condition reads as inputs: all names except built-in functions.
    pub variables: BTreeSet<String>,
    /// Names used in call position.
    pub methods: BTreeSet<String>,
}

impl ConditionFields {
    fn of(node: &Node) -> Self {
        let mut fields = ConditionFields::default();
        node.walk(&mut |node| match node {
            Node::Ident(name) => {
                fields.identifiers.insert(name.clone());
                fields.variables.insert(name.clone());
            }
            Node::Call { name, .. } => {
                fields.identifiers.insert(name.clone());
                fields.methods.insert(name.clone());
                if !functions::is_builtin_function(name) {
                    fields.variables.insert(name.clone());
                }
            }
            _ => {}
        });
        fields
    }
}

/// A compiled condition, ready to evaluate. Immutable and shareable across threads.
#[derive(Debug)]
pub struct Program {
    root: Node,
    fields: ConditionFields,
}

impl Program {
    /// Names referenced by this program.
    pub fn fields(&self) -> &ConditionFields {
        &self.fields
    }

    /// Evaluate to a boolean. Runtime faults, including panics inside the evaluator, are
    /// returned as [`ConditionError::Evaluation`] and never unwind past this call.
    pub fn evaluate(&self, env: &dyn Environment) -> Result<bool, ConditionError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| eval::evaluate(&self.root, env)));
        match result {
            Ok(Ok(Value::Bool(b))) => Ok(b),
            Ok(Ok(other)) => Err(ConditionError::Evaluation(format!(
                "condition produced {} instead of bool",
                other.type_name()
            ))),
            Ok(Err(message)) => Err(ConditionError::Evaluation(message)),
            Err(_) => Err(ConditionError::Evaluation(
                "internal evaluator fault".to_owned(),
            )),
        }
    }
}

fn parse_checked(source: &str, checker: &Checker<'_>) -> Result<Node, ConditionError> {
    if source.is_empty() {
        return Err(ConditionError::Empty);
    }
    let node = parser::parse(source)?;
    checker.check_condition(&node)?;
    Ok(optimizer::optimize(node))
}

/// Names referenced by `source`, without any knowledge of properties or function signatures.
///
/// ```
/// # use critical_moments::conditions::extract_fields;
/// let fields = extract_fields("a || (false && b + c + d > 0)").unwrap();
/// assert_eq!(fields.variables.into_iter().collect::<Vec<_>>(), ["a"]);
/// ```
pub fn extract_fields(source: &str) -> Result<ConditionFields, ConditionError> {
    let node = parse_checked(source, &Checker::untyped())?;
    Ok(ConditionFields::of(&node))
}

/// Parse, type check against the known property catalog and fold constants.
pub fn compile(source: &str) -> Result<Program, ConditionError> {
    let lookup = |name: &str| catalog::kind_of(name).map(Type::from);
    let root = parse_checked(source, &Checker::typed(&lookup))?;
    let fields = ConditionFields::of(&root);
    Ok(Program { root, fields })
}

/// Validates and compiles conditions with a fixed [`ValidationMode`].
#[derive(Debug, Clone, Default)]
pub struct ConditionEngine {
    mode: ValidationMode,
    declared_properties: HashSet<String>,
}

impl ConditionEngine {
    /// Create an engine validating in `mode`.
    pub fn new(mode: ValidationMode) -> Self {
        ConditionEngine {
            mode,
            declared_properties: HashSet::new(),
        }
    }

    /// Validation mode of this engine.
    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    /// Declare an extra property name accepted by strict validation, in addition to the
    /// built-in catalog and `custom_` properties.
    pub fn declare_property(&mut self, name: impl Into<String>) -> &mut Self {
        self.declared_properties.insert(name.into());
        self
    }

    fn is_declared(&self, name: &str) -> bool {
        catalog::is_declared(name)
            || functions::time::constant(name).is_some()
            || self.declared_properties.contains(name)
    }

    /// Check that `source` is a usable condition. In strict mode every variable must be a
    /// declared property and every call a built-in function.
    pub fn validate(&self, source: &str) -> Result<(), ConditionError> {
        self.compile(source).map(|_| ())
    }

    /// Validate and compile `source`.
    pub fn compile(&self, source: &str) -> Result<Program, ConditionError> {
        let program = compile(source)?;
        if self.mode == ValidationMode::Strict {
            let fields = program.fields();
            if let Some(method) = fields
                .methods
                .iter()
                .find(|method| !functions::is_builtin_function(method))
            {
                return Err(ConditionError::UnknownFunction(method.clone()));
            }
            if let Some(variable) = fields
                .variables
                .iter()
                .find(|variable| !self.is_declared(variable))
            {
                return Err(ConditionError::UnknownVariable(variable.clone()));
            }
        }
        Ok(program)
    }

    /// Names referenced by `source`.
    pub fn extract_fields(&self, source: &str) -> Result<ConditionFields, ConditionError> {
        extract_fields(source)
    }

    /// Evaluate a compiled program.
    pub fn evaluate(&self, program: &Program, env: &dyn Environment) -> Result<bool, ConditionError> {
        program.evaluate(env)
    }

    /// Build a [`Condition`] from source. Invalid sources are always rejected here; use
    /// [`Condition::prepare`] for the config-loading behavior where lenient mode degrades.
    pub fn condition(&self, source: impl Into<String>) -> Result<Condition, ConditionError> {
        let condition = Condition::from(source.into());
        let program = self.compile(&condition.source)?;
        let _ = condition.program.set(Ok(Arc::new(program)));
        Ok(condition)
    }
}

/// A condition string from a config, compiled on first use.
///
/// A condition that failed validation in lenient mode is *degraded*: it keeps the reason for
/// the failure and always evaluates to `false`.
#[derive(Clone, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub struct Condition {
    source: String,
    degraded: Option<ConditionError>,
    program: OnceLock<Result<Arc<Program>, ConditionError>>,
}

impl From<String> for Condition {
    fn from(source: String) -> Self {
        Condition {
            source,
            degraded: None,
            program: OnceLock::new(),
        }
    }
}

impl From<&str> for Condition {
    fn from(source: &str) -> Self {
        Condition::from(source.to_owned())
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.source
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condition")
            .field("source", &self.source)
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.degraded == other.degraded
    }
}

impl Condition {
    /// Condition source text. Empty for degraded conditions.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reason this condition was degraded to always-false, if it was.
    pub fn degraded_reason(&self) -> Option<&ConditionError> {
        self.degraded.as_ref()
    }

    /// Validate with `engine`. In strict mode failures are returned. In lenient mode the
    /// condition is replaced with an always-false one and the failure is logged.
    pub fn prepare(&mut self, engine: &ConditionEngine) -> Result<(), ConditionError> {
        if self.degraded.is_some() {
            return Ok(());
        }
        match engine.compile(&self.source) {
            Ok(program) => {
                let _ = self.program.set(Ok(Arc::new(program)));
                Ok(())
            }
            Err(err) if engine.mode() == ValidationMode::Strict => Err(err),
            Err(err) => {
                log::warn!(target: "critical_moments",
                    condition = self.source.as_str();
                    "invalid condition will evaluate to false: {err}");
                *self = Condition {
                    source: String::new(),
                    degraded: Some(err),
                    program: OnceLock::new(),
                };
                Ok(())
            }
        }
    }

    /// Compiled program, compiling on first call.
    pub fn program(&self) -> Result<Arc<Program>, ConditionError> {
        if let Some(reason) = &self.degraded {
            return Err(reason.clone());
        }
        self.program
            .get_or_init(|| compile(&self.source).map(Arc::new))
            .clone()
    }

    /// Names referenced by this condition.
    pub fn fields(&self) -> Result<ConditionFields, ConditionError> {
        Ok(self.program()?.fields().clone())
    }

    /// Evaluate against `env`. Degraded conditions are `false`.
    pub fn evaluate(&self, env: &dyn Environment) -> Result<bool, ConditionError> {
        if self.degraded.is_some() {
            return Ok(false);
        }
        self.program()?.evaluate(env)
    }
}
