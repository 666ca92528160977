use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{
    error::{Result, StageError},
    media::{MediaKind, MediaSegment, SegmentInfo},
};

/// Core trait that every enhancement stage implements
///
/// A stage is a pure transform: identical input and parameters produce
/// identical output, and the only side effect is buffer allocation.
pub trait Stage: Send + Sync {
    /// Returns the unique registry name of this stage
    fn name(&self) -> &str;

    /// Returns a human-readable description of this stage
    fn description(&self) -> &str;

    /// Declared input/output contract and parameter schema
    fn capabilities(&self) -> StageCapabilities;

    /// Predict the output metadata for `input` without touching any payload
    ///
    /// The planner uses this to validate a request before anything runs,
    /// and the engine holds every `apply` result to it.
    fn describe_output(&self, input: &SegmentInfo, params: &StageParams) -> Result<SegmentInfo>;

    /// Transform one segment into a new one
    fn apply(&self, input: MediaSegment, params: &StageParams) -> Result<MediaSegment>;

    /// Check parameters against the declared schema
    fn validate_params(&self, params: &StageParams) -> Result<()> {
        let caps = self.capabilities();
        for (key, value) in params.iter() {
            let spec = caps
                .params
                .iter()
                .find(|spec| spec.name == key)
                .ok_or_else(|| StageError::new(self.name(), format!("unknown parameter '{}'", key)))?;
            spec.check(value)
                .map_err(|cause| StageError::new(self.name(), cause))?;
        }
        Ok(())
    }

    /// Validate `params` and fill in declared defaults
    fn resolve(&self, params: &StageParams) -> Result<StageParams> {
        self.validate_params(params)?;
        let mut resolved = params.clone();
        for spec in self.capabilities().params {
            if let Some(default) = spec.default {
                resolved.values.entry(spec.name.to_string()).or_insert(default);
            }
        }
        Ok(resolved)
    }
}

/// Declared contract of a stage
#[derive(Debug, Clone)]
pub struct StageCapabilities {
    /// Kinds of segment the stage accepts
    pub input_kinds: Vec<MediaKind>,

    /// Kind of segment the stage produces
    pub output_kind: MediaKind,

    /// Parameter schema
    pub params: Vec<ParamSpec>,

    /// Stages that must not run before this one within a chain
    pub must_precede: Vec<&'static str>,

    /// Whether the stage refuses input that ends on a partial unit;
    /// the planner rejects such chains before anything runs
    pub requires_aligned: bool,
}

impl StageCapabilities {
    /// Same-kind transform with the given parameters
    pub fn transform(kind: MediaKind, params: Vec<ParamSpec>) -> Self {
        Self {
            input_kinds: vec![kind],
            output_kind: kind,
            params,
            must_precede: Vec::new(),
            requires_aligned: false,
        }
    }

    pub fn aligned(mut self) -> Self {
        self.requires_aligned = true;
        self
    }

    pub fn preceding(mut self, stages: &[&'static str]) -> Self {
        self.must_precede.extend_from_slice(stages);
        self
    }

    pub fn accepts(&self, kind: MediaKind) -> bool {
        self.input_kinds.contains(&kind)
    }
}

/// Value domain of a parameter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamDomain {
    Float { min: f64, max: f64 },
    Integer { min: i64, max: i64 },
}

/// One declared stage parameter
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub domain: ParamDomain,
    pub default: Option<ParamValue>,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn float(name: &'static str, min: f64, max: f64, default: f64, description: &'static str) -> Self {
        Self {
            name,
            domain: ParamDomain::Float { min, max },
            default: Some(ParamValue::Float(default)),
            description,
        }
    }

    pub fn integer(name: &'static str, min: i64, max: i64, default: i64, description: &'static str) -> Self {
        Self {
            name,
            domain: ParamDomain::Integer { min, max },
            default: Some(ParamValue::Integer(default)),
            description,
        }
    }

    /// Float parameter with no default value
    pub fn optional_float(name: &'static str, min: f64, max: f64, description: &'static str) -> Self {
        Self {
            name,
            domain: ParamDomain::Float { min, max },
            default: None,
            description,
        }
    }

    fn check(&self, value: &ParamValue) -> std::result::Result<(), String> {
        match (self.domain, value) {
            (ParamDomain::Float { min, max }, value) => {
                let v = value
                    .as_f64()
                    .ok_or_else(|| format!("parameter '{}' must be a number", self.name))?;
                if !v.is_finite() || v < min || v > max {
                    return Err(format!(
                        "parameter '{}' = {} is outside [{}, {}]",
                        self.name, v, min, max
                    ));
                }
            }
            (ParamDomain::Integer { min, max }, value) => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| format!("parameter '{}' must be an integer", self.name))?;
                if v < min || v > max {
                    return Err(format!(
                        "parameter '{}' = {} is outside [{}, {}]",
                        self.name, v, min, max
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parameters passed to a stage invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageParams {
    values: BTreeMap<String, ParamValue>,
}

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value
    pub fn set<K: Into<String>, V: Into<ParamValue>>(mut self, key: K, value: V) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert<K: Into<String>, V: Into<ParamValue>>(&mut self, key: K, value: V) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    /// `self` layered on top of `defaults`; keys in `self` win
    pub fn over(&self, defaults: &StageParams) -> StageParams {
        let mut merged = defaults.clone();
        merged
            .values
            .extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for StageParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Flexible parameter value that can hold different types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Integer(i) => Some(*i),
            ParamValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// Parse a command-line value: integer, then float, then bool, else text
    pub fn parse(text: &str) -> Self {
        if let Ok(i) = text.parse::<i64>() {
            ParamValue::Integer(i)
        } else if let Ok(f) = text.parse::<f64>() {
            ParamValue::Float(f)
        } else if let Ok(b) = text.parse::<bool>() {
            ParamValue::Bool(b)
        } else {
            ParamValue::Text(text.to_string())
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Integer(i) => write!(f, "{}", i),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// Fail unless `input` ends on a whole unit
pub(crate) fn require_aligned(stage: &str, input: &SegmentInfo) -> Result<()> {
    if input.aligned {
        Ok(())
    } else {
        Err(StageError::new(
            stage,
            "input ends on a partial unit; conform it with a boundary policy first",
        )
        .into())
    }
}

/// Fail unless `input` is of `kind`
pub(crate) fn require_kind(stage: &str, input: &SegmentInfo, kind: MediaKind) -> Result<()> {
    if input.kind() == kind {
        Ok(())
    } else {
        Err(StageError::new(stage, format!("expected {:?} input, got {:?}", kind, input.kind())).into())
    }
}
