//! Option schema and validation.
//!
//! Every analyzer enumerates its options at registration time. Envelopes are
//! checked against that list on admission, so an analyzer only ever sees
//! well-typed options with defaults filled in.

use serde::{Deserialize, Serialize};
use std::fmt;
use triage_core::AnalyzerOptions;

/// Value type of an option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum OptionKind {
    /// Free text
    String,
    /// Text that must compile as a regular expression
    Regex,
    /// true / false
    Bool,
    /// Non-negative integer
    Integer,
    /// Integer of at least 1
    PositiveInteger,
    /// Number
    Float,
    /// One of a fixed set of strings
    Choice(Vec<String>),
    /// One or more of a fixed set of strings, given as a string or a list
    ChoiceSet(Vec<String>),
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::String => write!(f, "string"),
            OptionKind::Regex => write!(f, "regex"),
            OptionKind::Bool => write!(f, "bool"),
            OptionKind::Integer => write!(f, "integer"),
            OptionKind::PositiveInteger => write!(f, "positive integer"),
            OptionKind::Float => write!(f, "float"),
            OptionKind::Choice(values) => write!(f, "one of [{}]", values.join(", ")),
            OptionKind::ChoiceSet(values) => write!(f, "one or more of [{}]", values.join(", ")),
        }
    }
}

/// An option an analyzer recognises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSpec {
    /// Option name
    pub name: String,

    /// Value type
    pub kind: OptionKind,

    /// Whether the envelope must provide it
    pub required: bool,

    /// Value used when the envelope omits it
    pub default: Option<serde_json::Value>,

    /// Description
    pub description: String,
}

impl OptionSpec {
    /// An optional option without default.
    pub fn new(name: impl Into<String>, kind: OptionKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            default: None,
            description: description.into(),
        }
    }

    /// Mark as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the default value.
    pub fn default_value(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn check(&self, value: &serde_json::Value) -> Result<(), OptionError> {
        let wrong_type = || OptionError::WrongType {
            name: self.name.clone(),
            expected: self.kind.to_string(),
        };

        match &self.kind {
            OptionKind::String => {
                value.as_str().ok_or_else(wrong_type)?;
            }
            OptionKind::Regex => {
                let pattern = value.as_str().ok_or_else(wrong_type)?;
                regex::bytes::Regex::new(pattern).map_err(|e| OptionError::InvalidRegex {
                    name: self.name.clone(),
                    message: e.to_string(),
                })?;
            }
            OptionKind::Bool => {
                value.as_bool().ok_or_else(wrong_type)?;
            }
            OptionKind::Integer => {
                value.as_u64().ok_or_else(wrong_type)?;
            }
            OptionKind::PositiveInteger => {
                value.as_u64().filter(|&n| n > 0).ok_or_else(wrong_type)?;
            }
            OptionKind::Float => {
                value.as_f64().ok_or_else(wrong_type)?;
            }
            OptionKind::Choice(allowed) => {
                let chosen = value.as_str().ok_or_else(wrong_type)?;
                self.check_choice(chosen, allowed)?;
            }
            OptionKind::ChoiceSet(allowed) => {
                let chosen = string_list(value).ok_or_else(wrong_type)?;
                if chosen.is_empty() {
                    return Err(wrong_type());
                }
                for c in chosen {
                    self.check_choice(c, allowed)?;
                }
            }
        }
        Ok(())
    }

    fn check_choice(&self, chosen: &str, allowed: &[String]) -> Result<(), OptionError> {
        if allowed.iter().any(|a| a == chosen) {
            return Ok(());
        }
        Err(OptionError::NotAllowed {
            name: self.name.clone(),
            value: chosen.to_string(),
            allowed: allowed.to_vec(),
        })
    }
}

/// A single string or an array of strings.
fn string_list(value: &serde_json::Value) -> Option<Vec<&str>> {
    match value {
        serde_json::Value::String(s) => Some(vec![s.as_str()]),
        serde_json::Value::Array(items) => items.iter().map(|v| v.as_str()).collect(),
        _ => None,
    }
}

/// Option validation failures. All of them are input errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptionError {
    /// Key not declared by the analyzer
    #[error("unknown option '{name}' (recognised: {})", .recognised.join(", "))]
    Unknown {
        /// Offending key
        name: String,
        /// Declared keys
        recognised: Vec<String>,
    },

    /// Required key absent
    #[error("missing required option '{0}'")]
    Missing(String),

    /// Value of the wrong JSON type
    #[error("option '{name}' must be {expected}")]
    WrongType {
        /// Option name
        name: String,
        /// Expected kind
        expected: String,
    },

    /// Regex option does not compile
    #[error("option '{name}' is not a valid regex: {message}")]
    InvalidRegex {
        /// Option name
        name: String,
        /// Compiler message
        message: String,
    },

    /// Choice option outside its set
    #[error("option '{name}': {value} is not a valid choice (expected one of {})", .allowed.join(", "))]
    NotAllowed {
        /// Option name
        name: String,
        /// Given value
        value: String,
        /// Allowed values
        allowed: Vec<String>,
    },
}

/// Validate `options` against `specs` and return them with defaults applied.
pub fn prepare_options(
    specs: &[OptionSpec],
    options: &AnalyzerOptions,
) -> Result<AnalyzerOptions, OptionError> {
    for key in options.keys() {
        if !specs.iter().any(|s| &s.name == key) {
            return Err(OptionError::Unknown {
                name: key.clone(),
                recognised: specs.iter().map(|s| s.name.clone()).collect(),
            });
        }
    }

    let mut prepared = AnalyzerOptions::new();
    for spec in specs {
        match options.get(&spec.name) {
            Some(value) if !value.is_null() => {
                spec.check(value)?;
                prepared.insert(spec.name.clone(), value.clone());
            }
            _ => {
                if let Some(default) = &spec.default {
                    prepared.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    return Err(OptionError::Missing(spec.name.clone()));
                }
            }
        }
    }
    Ok(prepared)
}

/// Typed accessors over prepared options.
pub trait OptionsExt {
    /// String option.
    fn str_opt(&self, key: &str) -> Option<&str>;
    /// Bool option, `fallback` when absent.
    fn bool_opt(&self, key: &str, fallback: bool) -> bool;
    /// Integer option.
    fn u64_opt(&self, key: &str) -> Option<u64>;
    /// Float option.
    fn f64_opt(&self, key: &str) -> Option<f64>;
    /// String or list-of-strings option, duplicates removed, order kept.
    fn str_list_opt(&self, key: &str) -> Vec<&str>;
}

impl OptionsExt for AnalyzerOptions {
    fn str_opt(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    fn bool_opt(&self, key: &str, fallback: bool) -> bool {
        self.get(key).and_then(|v| v.as_bool()).unwrap_or(fallback)
    }

    fn u64_opt(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.as_u64())
    }

    fn f64_opt(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    fn str_list_opt(&self, key: &str) -> Vec<&str> {
        let mut list = self.get(key).and_then(string_list).unwrap_or_default();
        let mut seen = std::collections::HashSet::new();
        list.retain(|s| seen.insert(*s));
        list
    }
}
