//! References into workflow context and step input mappings

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::WorkflowContext;

/// Root segment naming the workflow's initial input
pub const INPUT_ROOT: &str = "input";

/// Dotted path into workflow context
///
/// The first segment is either `input` (the initial input) or a step id;
/// the remaining segments walk object keys, or array indices when the
/// segment is numeric. `transcribe.text` reads the `text` field of the
/// `transcribe` step's output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ValueRef {
    root: String,
    path: Vec<String>,
}

/// Why a reference could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unresolved {
    /// The referenced step has no entry in context
    StepMissing,
    /// The referenced step was skipped by its condition
    StepSkipped,
    /// The step ran but its output has nothing at this path
    PathMissing,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepMissing => f.write_str("step has not produced output"),
            Self::StepSkipped => f.write_str("step was skipped"),
            Self::PathMissing => f.write_str("path not present in output"),
        }
    }
}

impl ValueRef {
    pub fn parse(s: &str) -> Self {
        let mut segments = s.trim().split('.').map(str::to_string);
        let root = segments.next().unwrap_or_default();
        Self {
            root,
            path: segments.collect(),
        }
    }

    /// Step id this reference depends on, if it is not the initial input
    pub fn step_id(&self) -> Option<&str> {
        (self.root != INPUT_ROOT).then_some(self.root.as_str())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Look the reference up in context
    pub fn lookup<'a>(&self, ctx: &'a WorkflowContext) -> Result<&'a Value, Unresolved> {
        let base = match self.step_id() {
            None => &ctx.input,
            Some(step) => {
                if ctx.is_skipped(step) {
                    return Err(Unresolved::StepSkipped);
                }
                ctx.output(step).ok_or(Unresolved::StepMissing)?
            }
        };

        self.path
            .iter()
            .try_fold(base, |value, segment| match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
            .ok_or(Unresolved::PathMissing)
    }
}

impl fmt::Display for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.root)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for ValueRef {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for ValueRef {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for ValueRef {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<ValueRef> for String {
    fn from(value: ValueRef) -> Self {
        value.to_string()
    }
}

/// Failure to build a step's input
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unresolved input reference `{reference}`: {reason}")]
pub struct MappingError {
    pub reference: String,
    pub reason: Unresolved,
}

/// One mapped value with an optional fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "InputSourceRepr", into = "InputSourceRepr")]
pub struct InputSource {
    pub from: ValueRef,
    pub default: Option<Value>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum InputSourceRepr {
    Short(ValueRef),
    Full {
        from: ValueRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
}

impl From<InputSourceRepr> for InputSource {
    fn from(repr: InputSourceRepr) -> Self {
        match repr {
            InputSourceRepr::Short(from) => Self {
                from,
                default: None,
            },
            InputSourceRepr::Full { from, default } => Self { from, default },
        }
    }
}

impl From<InputSource> for InputSourceRepr {
    fn from(source: InputSource) -> Self {
        match source.default {
            None => Self::Short(source.from),
            Some(default) => Self::Full {
                from: source.from,
                default: Some(default),
            },
        }
    }
}

impl InputSource {
    pub fn new(from: impl Into<ValueRef>) -> Self {
        Self {
            from: from.into(),
            default: None,
        }
    }

    pub fn or_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    fn resolve(&self, ctx: &WorkflowContext) -> Result<Value, MappingError> {
        match self.from.lookup(ctx) {
            Ok(value) => Ok(value.clone()),
            Err(reason) => self.default.clone().ok_or_else(|| MappingError {
                reference: self.from.to_string(),
                reason,
            }),
        }
    }
}

impl From<&str> for InputSource {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// How a step's input is built from context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputMapping {
    /// The workflow's initial input, unchanged
    #[default]
    Passthrough,

    /// A single referenced value
    Value {
        from: ValueRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },

    /// An object whose fields are each mapped from context
    Fields { fields: BTreeMap<String, InputSource> },
}

impl InputMapping {
    /// Map a single reference
    pub fn value(from: impl Into<ValueRef>) -> Self {
        Self::Value {
            from: from.into(),
            default: None,
        }
    }

    /// Start an empty object mapping
    pub fn fields() -> Self {
        Self::Fields {
            fields: BTreeMap::new(),
        }
    }

    /// Add a field to an object mapping (turns any other mapping into one)
    pub fn field(self, name: impl Into<String>, source: impl Into<InputSource>) -> Self {
        let mut fields = match self {
            Self::Fields { fields } => fields,
            _ => BTreeMap::new(),
        };
        fields.insert(name.into(), source.into());
        Self::Fields { fields }
    }

    /// Every reference this mapping reads
    pub fn references(&self) -> Vec<&ValueRef> {
        match self {
            Self::Passthrough => vec![],
            Self::Value { from, .. } => vec![from],
            Self::Fields { fields } => fields.values().map(|s| &s.from).collect(),
        }
    }

    /// Build the concrete input value
    pub fn resolve(&self, ctx: &WorkflowContext) -> Result<Value, MappingError> {
        match self {
            Self::Passthrough => Ok(ctx.input.clone()),
            Self::Value { from, default } => InputSource {
                from: from.clone(),
                default: default.clone(),
            }
            .resolve(ctx),
            Self::Fields { fields } => fields
                .iter()
                .map(|(name, source)| Ok((name.clone(), source.resolve(ctx)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
        }
    }
}
