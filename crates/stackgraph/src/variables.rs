//! Variable binding
//!
//! Every variable is bound exactly once per plan from an ordered chain of
//! [`VariableSource`]s, falling back to its declared default. Binding is
//! total: planning never starts with an unbound variable.
//!
//! Sensitive values are held in [`BoundValue`], whose `Debug` output is
//! redacted. Only names ever reach logs and errors.

use crate::error::{Error, Result};
use crate::stack::{Stack, VarType};
use crate::value::{Literal, Reference, Value};
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder printed instead of a sensitive value
pub const REDACTED: &str = "(sensitive)";

/// External provider of raw variable values
pub trait VariableSource {
    /// Name shown in log lines
    fn name(&self) -> &str;

    /// Raw value for `variable` of `stack`, if this source has one
    fn lookup(&self, stack: &str, variable: &str) -> Option<String>;
}

/// Values supplied explicitly (command line flags, var files)
///
/// Keys may be qualified (`stack.NAME`) or bare (`NAME`); a qualified key
/// wins over a bare one.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    name: String,
    values: BTreeMap<String, String>,
}

impl MapSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: BTreeMap::new(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl VariableSource for MapSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, stack: &str, variable: &str) -> Option<String> {
        self.values
            .get(&format!("{stack}.{variable}"))
            .or_else(|| self.values.get(variable))
            .cloned()
    }
}

/// Values from environment variables named `<prefix><NAME>`
#[derive(Debug, Clone)]
pub struct EnvSource {
    prefix: String,
}

impl EnvSource {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl VariableSource for EnvSource {
    fn name(&self) -> &str {
        "environment"
    }

    fn lookup(&self, _stack: &str, variable: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, variable)).ok()
    }
}

/// A bound variable value
#[derive(Clone, PartialEq)]
pub struct BoundValue {
    value: Literal,
    sensitive: bool,
}

impl BoundValue {
    pub fn is_sensitive(&self) -> bool {
        self.sensitive
    }

    /// The plain value, for substitution into configuration sent to a backend
    pub fn expose(&self) -> &Literal {
        &self.value
    }

    /// Value for display: the literal, or [`REDACTED`]
    pub fn display_json(&self) -> serde_json::Value {
        if self.sensitive {
            serde_json::Value::String(REDACTED.to_string())
        } else {
            self.value.to_json()
        }
    }
}

impl fmt::Debug for BoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sensitive {
            write!(f, "BoundValue({REDACTED})")
        } else {
            write!(f, "BoundValue({:?})", self.value)
        }
    }
}

/// All variables bound for one plan invocation
#[derive(Debug, Clone, Default)]
pub struct BoundVariables {
    values: BTreeMap<(String, String), BoundValue>,
}

impl BoundVariables {
    pub fn get(&self, stack: &str, name: &str) -> Option<&BoundValue> {
        self.values.get(&(stack.to_string(), name.to_string()))
    }

    pub fn contains(&self, stack: &str, name: &str) -> bool {
        self.get(stack, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether `name` of `stack` is bound and sensitive
    pub fn is_sensitive(&self, stack: &str, name: &str) -> bool {
        self.get(stack, name).is_some_and(BoundValue::is_sensitive)
    }

    /// Plain values of every sensitive variable, for output scrubbing
    ///
    /// Booleans are left out: a `true` leaf cannot be told apart from any
    /// other flag. [`redact_sensitive`] covers them where they are referenced.
    pub fn sensitive_values(&self) -> Vec<serde_json::Value> {
        self.values
            .values()
            .filter(|v| v.sensitive)
            .filter_map(|v| match &v.value {
                Literal::String(s) if !s.is_empty() => Some(v.value.to_json()),
                Literal::Number(_) => Some(v.value.to_json()),
                _ => None,
            })
            .collect()
    }
}

/// Bind every variable of `stacks` from `sources`, in order, then defaults
pub fn bind(stacks: &[Stack], sources: &[&dyn VariableSource]) -> Result<BoundVariables> {
    let mut bound = BoundVariables::default();

    for stack in stacks {
        for variable in &stack.variables {
            let found = sources.iter().find_map(|source| {
                source
                    .lookup(&stack.name, &variable.name)
                    .map(|raw| (source.name().to_string(), raw))
            });

            let value = match found {
                Some((source, raw)) => {
                    log::debug!("bound {}.{} from {}", stack.name, variable.name, source);
                    parse(&raw, variable.var_type).ok_or_else(|| Error::InvalidVariable {
                        stack: stack.name.clone(),
                        name: variable.name.clone(),
                        expected: variable.var_type.name(),
                    })?
                }
                None => match &variable.default {
                    Some(default) => {
                        log::debug!("bound {}.{} from default", stack.name, variable.name);
                        default.clone()
                    }
                    None => {
                        return Err(Error::UnboundVariable {
                            stack: stack.name.clone(),
                            name: variable.name.clone(),
                        });
                    }
                },
            };

            bound.values.insert(
                (stack.name.clone(), variable.name.clone()),
                BoundValue {
                    value,
                    sensitive: variable.sensitive,
                },
            );
        }
    }

    Ok(bound)
}

/// Redact every leaf holding a secret
///
/// String leaves are redacted when they contain a string secret; any other
/// leaf when it equals a secret.
pub fn scrub_json(value: &mut serde_json::Value, secrets: &[serde_json::Value]) {
    match value {
        serde_json::Value::String(s) => {
            let leaks = secrets.iter().any(|secret| match secret {
                serde_json::Value::String(secret) => s.contains(secret.as_str()),
                _ => false,
            });
            if leaks {
                *s = REDACTED.to_string();
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                scrub_json(item, secrets);
            }
        }
        serde_json::Value::Object(entries) => {
            for item in entries.values_mut() {
                scrub_json(item, secrets);
            }
        }
        serde_json::Value::Null => {}
        leaf => {
            if secrets.contains(leaf) {
                *leaf = serde_json::Value::String(REDACTED.to_string());
            }
        }
    }
}

/// Redact every position of `resolved` that `config` fills from a sensitive
/// variable of `stack`, whatever the variable's type
pub fn redact_sensitive(
    config: &Value,
    resolved: &mut serde_json::Value,
    stack: &str,
    bound: &BoundVariables,
) {
    match (config, resolved) {
        (Value::Ref(Reference::Variable { name }), resolved) => {
            if bound.is_sensitive(stack, name) {
                *resolved = serde_json::Value::String(REDACTED.to_string());
            }
        }
        (Value::List(items), serde_json::Value::Array(values)) => {
            for (item, value) in items.iter().zip(values.iter_mut()) {
                redact_sensitive(item, value, stack, bound);
            }
        }
        (Value::Map(entries), serde_json::Value::Object(values)) => {
            for (key, item) in entries {
                if let Some(value) = values.get_mut(key) {
                    redact_sensitive(item, value, stack, bound);
                }
            }
        }
        _ => {}
    }
}

fn parse(raw: &str, var_type: VarType) -> Option<Literal> {
    match var_type {
        VarType::String => Some(Literal::String(raw.to_string())),
        VarType::Bool => match raw.trim() {
            "true" => Some(Literal::Bool(true)),
            "false" => Some(Literal::Bool(false)),
            _ => None,
        },
        VarType::Number => {
            let raw = raw.trim();
            if let Ok(n) = raw.parse::<i64>() {
                return Some(Literal::Number(Number::from(n)));
            }
            raw.parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Literal::Number)
        }
    }
}
