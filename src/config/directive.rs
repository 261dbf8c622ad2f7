use std::time::Duration;

use serde_yaml::{Mapping, Value as YamlValue};

use crate::core::error::{DiscoveryError, DiscoveryResult};

/// A single sub-directive of a provider block: a name followed by zero or
/// more arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<String>,
}

impl Directive {
    pub fn new<S: Into<String>>(name: S, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Returns the only argument, failing when there is not exactly one.
    pub fn single_arg(&self) -> DiscoveryResult<&str> {
        match self.args.as_slice() {
            [arg] => Ok(arg.as_str()),
            _ => Err(DiscoveryError::ArgCount(self.name.clone())),
        }
    }

    pub fn remaining_args(&self) -> Vec<String> {
        self.args.clone()
    }

    pub fn duration_arg(&self) -> DiscoveryResult<Duration> {
        let value = self.single_arg()?;
        parse_duration(value)
            .ok_or_else(|| DiscoveryError::invalid_value(&self.name, "duration", value))
    }

    pub fn bool_arg(&self) -> DiscoveryResult<bool> {
        let value = self.single_arg()?;
        parse_bool(value).ok_or_else(|| DiscoveryError::invalid_value(&self.name, "boolean", value))
    }

    pub fn u16_arg(&self) -> DiscoveryResult<u16> {
        let value = self.single_arg()?;
        value
            .parse::<u16>()
            .map_err(|_| DiscoveryError::invalid_value(&self.name, "port", value))
    }
}

/// Flattens an ordered YAML mapping into directives, preserving order.
///
/// Scalars become a single argument, sequences one argument per item and
/// `null` no argument at all.
pub fn directives_from_yaml(options: &Mapping) -> DiscoveryResult<Vec<Directive>> {
    options
        .iter()
        .map(|(key, value)| {
            let name = scalar_to_string(key)
                .ok_or_else(|| DiscoveryError::invalid_value("directive", "name", format!("{key:?}")))?;
            let args = match value {
                YamlValue::Null => Vec::new(),
                YamlValue::Sequence(items) => items
                    .iter()
                    .map(|item| {
                        scalar_to_string(item).ok_or_else(|| DiscoveryError::ArgCount(name.clone()))
                    })
                    .collect::<DiscoveryResult<Vec<_>>>()?,
                other => vec![scalar_to_string(other)
                    .ok_or_else(|| DiscoveryError::ArgCount(name.clone()))?],
            };
            Ok(Directive::new(name, args))
        })
        .collect()
}

fn scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses booleans the way Go's `strconv.ParseBool` does.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

/// Parses durations such as `500ms`, `10s`, `1m30s`, `1.5h` or `2d`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if value == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = value;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let number: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += number * seconds_per_unit;
    }

    if !total.is_finite() {
        return None;
    }
    Duration::try_from_secs_f64(total).ok()
}
