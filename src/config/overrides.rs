use serde_json::Value;
use std::fmt;

use super::Config;
use crate::error::{ExpError, Result};

/// A single `key=value` assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Override {
    pub key: String,
    pub value: String,
}

/// One combination of overrides, i.e. one job.
pub type OverrideSet = Vec<Override>;

impl Override {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn parse(expr: &str) -> Result<Self> {
        let (key, value) = expr.split_once('=').ok_or_else(|| {
            ExpError::configuration(format!("override '{expr}' must be of the form key=value"))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ExpError::configuration(format!(
                "override '{expr}' has an empty key"
            )));
        }
        Ok(Self::new(key, value.trim()))
    }

    /// The value as a YAML scalar: `1` is an integer, `true` a bool, `x` a string.
    pub fn parsed_value(&self) -> Value {
        if self.value.is_empty() {
            return Value::String(String::new());
        }
        match serde_yaml::from_str::<Value>(&self.value) {
            Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Null)) => v,
            _ => Value::String(self.value.clone()),
        }
    }
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Turn a `key -> values` mapping into override expressions (`key=v1,v2`).
pub fn overrides_from_map<I, K, V, S>(map: I) -> Vec<String>
where
    I: IntoIterator<Item = (K, V)>,
    K: fmt::Display,
    V: IntoIterator<Item = S>,
    S: fmt::Display,
{
    map.into_iter()
        .map(|(key, values)| {
            let joined: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
            format!("{key}={}", joined.join(","))
        })
        .collect()
}

/// Whether any expression carries more than one value.
pub fn is_multirun<S: AsRef<str>>(overrides: &[S]) -> bool {
    overrides.iter().any(|o| {
        o.as_ref()
            .split_once('=')
            .is_some_and(|(_, value)| value.contains(','))
    })
}

/// Expand `key=v1,v2` expressions into the Cartesian product of single
/// overrides, validating every key against the base configuration.
///
/// The product is ordered like nested loops over the expressions in the
/// given order, the last expression varying fastest.
pub fn parse_overrides<S: AsRef<str>>(base: &Config, overrides: &[S]) -> Result<Vec<OverrideSet>> {
    let known = base.all_keys();
    let mut axes: Vec<Vec<Override>> = Vec::with_capacity(overrides.len());
    for expr in overrides {
        let expr = expr.as_ref();
        let head = Override::parse(expr)?;
        if !known.contains(&head.key) {
            return Err(ExpError::UnknownKey {
                key: head.key,
                valid: known.into_iter().collect(),
            });
        }
        axes.push(
            head.value
                .split(',')
                .map(|v| Override::new(head.key.clone(), v.trim()))
                .collect(),
        );
    }

    let mut product: Vec<OverrideSet> = vec![Vec::new()];
    for axis in axes {
        let mut next = Vec::with_capacity(product.len() * axis.len());
        for prefix in &product {
            for single in &axis {
                let mut combo = prefix.clone();
                combo.push(single.clone());
                next.push(combo);
            }
        }
        product = next;
    }
    Ok(product)
}

/// Apply one combination of overrides to a copy of the base configuration.
pub fn apply_overrides(base: &Config, set: &[Override]) -> Result<Config> {
    let mut cfg = base.clone();
    for single in set {
        cfg.set(&single.key, single.parsed_value())?;
    }
    Ok(cfg)
}

/// Resolve overrides into one configuration per combination, in product order.
pub fn load_configuration<S: AsRef<str>>(base: &Config, overrides: &[S]) -> Result<Vec<Config>> {
    parse_overrides(base, overrides)?
        .iter()
        .map(|set| apply_overrides(base, set))
        .collect()
}
