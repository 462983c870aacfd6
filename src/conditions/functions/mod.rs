//! Functions callable from conditions.
//!
//! Static functions are pure (apart from clock and randomness) and are implemented here. Dynamic
//! functions read the history store or ask the host; they are only declared here and resolved by
//! the [`Environment`](crate::conditions::Environment) at evaluation time.

use std::cmp::Ordering;

use crate::conditions::{checker::Type, Environment, Value};

pub(crate) mod random;
pub(crate) mod time;
pub mod version;

/// Parameter and return types of a function, used by the static type check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Signature {
    pub params: &'static [Type],
    /// Number of trailing parameters that may be omitted.
    pub optional: usize,
    pub returns: Type,
}

const fn sig(params: &'static [Type], optional: usize, returns: Type) -> Signature {
    Signature {
        params,
        optional,
        returns,
    }
}

const STATIC_FUNCTIONS: &[(&str, Signature)] = &[
    (
        "versionNumberComponent",
        sig(&[Type::String, Type::Int], 0, Type::Unknown),
    ),
    (
        "versionGreaterThan",
        sig(&[Type::String, Type::String], 0, Type::Bool),
    ),
    (
        "versionLessThan",
        sig(&[Type::String, Type::String], 0, Type::Bool),
    ),
    (
        "versionEqual",
        sig(&[Type::String, Type::String], 0, Type::Bool),
    ),
    ("seconds", sig(&[Type::Unknown], 0, Type::Int)),
    ("minutes", sig(&[Type::Unknown], 0, Type::Int)),
    ("hours", sig(&[Type::Unknown], 0, Type::Int)),
    ("days", sig(&[Type::Unknown], 0, Type::Int)),
    ("now", sig(&[], 0, Type::Int)),
    ("unixTimeNanoseconds", sig(&[Type::Int], 0, Type::Time)),
    ("unixTimeMilliseconds", sig(&[Type::Int], 0, Type::Time)),
    ("unixTimeSeconds", sig(&[Type::Int], 0, Type::Time)),
    (
        "formatTime",
        sig(&[Type::Unknown, Type::String, Type::String], 1, Type::Unknown),
    ),
    (
        "parseDate",
        sig(&[Type::String, Type::String, Type::String], 2, Type::Time),
    ),
    (
        "date",
        sig(&[Type::String, Type::String, Type::String], 2, Type::Time),
    ),
    ("rand", sig(&[], 0, Type::Int)),
    ("sessionRand", sig(&[], 0, Type::Int)),
    ("randForKey", sig(&[Type::String, Type::Int], 0, Type::Int)),
];

const DYNAMIC_FUNCTIONS: &[(&str, Signature)] = &[
    ("eventCount", sig(&[Type::String], 0, Type::Int)),
    (
        "eventCountWithLimit",
        sig(&[Type::String, Type::Int], 0, Type::Int),
    ),
    (
        "propertyHistoryLatestValue",
        sig(&[Type::String], 0, Type::Unknown),
    ),
    (
        "propertyEver",
        sig(&[Type::String, Type::Unknown], 0, Type::Bool),
    ),
    (
        "propertyEverHadValue",
        sig(&[Type::String, Type::Unknown], 0, Type::Bool),
    ),
    ("stableRand", sig(&[], 0, Type::Int)),
    ("canOpenUrl", sig(&[Type::String], 0, Type::Bool)),
];

pub(crate) fn is_static_function(name: &str) -> bool {
    STATIC_FUNCTIONS.iter().any(|(n, _)| *n == name)
}

pub(crate) fn is_dynamic_function(name: &str) -> bool {
    DYNAMIC_FUNCTIONS.iter().any(|(n, _)| *n == name)
}

pub(crate) fn is_builtin_function(name: &str) -> bool {
    is_static_function(name) || is_dynamic_function(name)
}

pub(crate) fn signature(name: &str) -> Option<Signature> {
    STATIC_FUNCTIONS
        .iter()
        .chain(DYNAMIC_FUNCTIONS)
        .find(|(n, _)| *n == name)
        .map(|(_, signature)| *signature)
}

/// Checks argument count against the declared signature.
pub(crate) fn check_arity(name: &str, args: &[Value]) -> Result<(), String> {
    let Some(signature) = signature(name) else {
        return Ok(());
    };
    let max = signature.params.len();
    let min = max - signature.optional;
    if args.len() < min || args.len() > max {
        return Err(format!(
            "{name} expects {} arguments, got {}",
            if min == max {
                max.to_string()
            } else {
                format!("{min} to {max}")
            },
            args.len()
        ));
    }
    Ok(())
}

/// Calls a static function. Returns `None` when `name` is not a static function.
pub(crate) fn call_static(
    name: &str,
    args: &[Value],
    env: &dyn Environment,
) -> Option<Result<Value, String>> {
    if !is_static_function(name) {
        return None;
    }
    Some(check_arity(name, args).and_then(|()| dispatch(name, args, env)))
}

struct Args<'a> {
    name: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn wrong_types(&self) -> String {
        let types: Vec<&str> = self.values.iter().map(Value::type_name).collect();
        format!("invalid arguments for {}({})", self.name, types.join(", "))
    }

    fn value(&self, i: usize) -> Result<&'a Value, String> {
        self.values.get(i).ok_or_else(|| self.wrong_types())
    }

    fn str(&self, i: usize) -> Result<&'a str, String> {
        self.value(i)?.as_str().ok_or_else(|| self.wrong_types())
    }

    fn int(&self, i: usize) -> Result<i64, String> {
        self.value(i)?.as_int().ok_or_else(|| self.wrong_types())
    }

    /// Optional trailing string; absent or nil means default.
    fn opt_str(&self, i: usize) -> Result<Option<&'a str>, String> {
        match self.values.get(i) {
            None | Some(Value::Nil) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.wrong_types()),
        }
    }
}

fn dispatch(name: &str, values: &[Value], env: &dyn Environment) -> Result<Value, String> {
    let args = Args { name, values };

    match name {
        "versionNumberComponent" => {
            Ok(version::version_number_component(args.str(0)?, args.int(1)?).into())
        }
        "versionGreaterThan" => Ok(Value::Bool(version::version_compare_expecting(
            args.str(0)?,
            args.str(1)?,
            Ordering::Greater,
        ))),
        "versionLessThan" => Ok(Value::Bool(version::version_compare_expecting(
            args.str(0)?,
            args.str(1)?,
            Ordering::Less,
        ))),
        "versionEqual" => Ok(Value::Bool(version::version_compare_expecting(
            args.str(0)?,
            args.str(1)?,
            Ordering::Equal,
        ))),
        "seconds" | "minutes" | "hours" | "days" => time::duration_millis(name, args.value(0)?)
            .map(Value::Int)
            .ok_or_else(|| args.wrong_types()),
        "now" => Ok(Value::Int(time::now_millis())),
        "unixTimeNanoseconds" | "unixTimeMilliseconds" | "unixTimeSeconds" => {
            time::unix_time(name, args.int(0)?).ok_or_else(|| args.wrong_types())
        }
        "formatTime" => {
            let millis = args
                .value(0)?
                .as_time_millis()
                .ok_or_else(|| args.wrong_types())?;
            Ok(time::format_time(millis, args.str(1)?, args.opt_str(2)?))
        }
        "parseDate" | "date" => {
            let s = args.str(0)?;
            time::parse_date(s, args.opt_str(1)?, args.opt_str(2)?)
                .map(Value::Time)
                .ok_or_else(|| format!("unable to parse date \"{s}\""))
        }
        "rand" => Ok(Value::Int(random::random())),
        "sessionRand" => Ok(Value::Int(env.session_random())),
        "randForKey" => Ok(Value::Int(random::random_for_key(
            args.str(0)?,
            args.int(1)?,
        ))),
        _ => Err(format!("unknown function {name}")),
    }
}
