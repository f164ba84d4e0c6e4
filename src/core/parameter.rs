//! Parameter system for block configuration
//!
//! Blocks declare typed parameters with defaults and constraints. Values are
//! checked when a block is added to a graph (or a parameter is changed), so a
//! block's `initialize` can rely on every declared parameter being present and
//! in range.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Parameter definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    /// Unique parameter identifier
    pub id: String,
    /// Human-readable parameter name
    pub name: String,
    /// Parameter type
    pub param_type: ParameterType,
    /// Parameter description
    pub description: String,
    /// Default value
    pub default_value: ParameterValue,
    /// Optional constraints
    pub constraints: Option<ParameterConstraints>,
}

impl Parameter {
    /// Integer parameter bounded to `[min, max]`.
    pub fn integer(id: &str, name: &str, default: i64, min: i64, max: i64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            param_type: ParameterType::Integer,
            description: String::new(),
            default_value: ParameterValue::Integer(default),
            constraints: Some(
                ParameterConstraints::new()
                    .with_min(min as f64)
                    .with_max(max as f64),
            ),
        }
    }

    /// Floating point parameter bounded to `[min, max]`.
    pub fn number(id: &str, name: &str, default: f64, min: f64, max: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            param_type: ParameterType::Number,
            description: String::new(),
            default_value: ParameterValue::Number(default),
            constraints: Some(ParameterConstraints::new().with_min(min).with_max(max)),
        }
    }

    pub fn boolean(id: &str, name: &str, default: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            param_type: ParameterType::Boolean,
            description: String::new(),
            default_value: ParameterValue::Boolean(default),
            constraints: None,
        }
    }

    /// String parameter restricted to `allowed`.
    pub fn enumeration(id: &str, name: &str, default: &str, allowed: &[&str]) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            param_type: ParameterType::Enum,
            description: String::new(),
            default_value: ParameterValue::String(default.into()),
            constraints: Some(ParameterConstraints::new().with_allowed_values(
                allowed.iter().map(|v| ParameterValue::from(*v)).collect(),
            )),
        }
    }

    pub fn string(id: &str, name: &str, default: &str) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            param_type: ParameterType::String,
            description: String::new(),
            default_value: ParameterValue::String(default.into()),
            constraints: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Check a value against this definition and return it in canonical form
    /// (integers widened for number parameters, integral numbers narrowed for
    /// integer parameters).
    pub fn validate(&self, value: &ParameterValue) -> Result<ParameterValue, String> {
        let normalized = match (self.param_type, value) {
            (ParameterType::Integer, ParameterValue::Integer(i)) => ParameterValue::Integer(*i),
            (ParameterType::Integer, ParameterValue::Number(n)) if n.fract() == 0.0 => {
                ParameterValue::Integer(*n as i64)
            }
            (ParameterType::Number, ParameterValue::Number(n)) => ParameterValue::Number(*n),
            (ParameterType::Number, ParameterValue::Integer(i)) => ParameterValue::Number(*i as f64),
            (ParameterType::Boolean, ParameterValue::Boolean(b)) => ParameterValue::Boolean(*b),
            (ParameterType::Enum | ParameterType::String, ParameterValue::String(s)) => {
                ParameterValue::String(s.clone())
            }
            (expected, got) => {
                return Err(format!(
                    "{} must be {}, got {}",
                    self.id,
                    expected,
                    got.type_name()
                ))
            }
        };

        if let Some(constraints) = &self.constraints {
            constraints.check(&self.id, &normalized)?;
        }
        Ok(normalized)
    }
}

/// Parameter types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    Integer,
    Number,
    Boolean,
    Enum,
    String,
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterType::Integer => "an integer",
            ParameterType::Number => "a number",
            ParameterType::Boolean => "a boolean",
            ParameterType::Enum => "one of the allowed values",
            ParameterType::String => "a string",
        };
        f.write_str(name)
    }
}

/// Parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean value
    Boolean(bool),
    /// Integer number
    Integer(i64),
    /// Floating point number
    Number(f64),
    /// String value
    String(String),
}

impl ParameterValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParameterValue::Boolean(_) => "boolean",
            ParameterValue::Integer(_) => "integer",
            ParameterValue::Number(_) => "number",
            ParameterValue::String(_) => "string",
        }
    }

    /// Try to convert to string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Try to convert to number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            ParameterValue::Number(n) => Some(*n),
            ParameterValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to convert to integer
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(i) => Some(*i),
            ParameterValue::Number(n) if n.fract() == 0.0 => Some(*n as i64),
            _ => None,
        }
    }

    /// Try to convert to boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Boolean(b) => write!(f, "{}", b),
            ParameterValue::Integer(i) => write!(f, "{}", i),
            ParameterValue::Number(n) => write!(f, "{}", n),
            ParameterValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

impl From<String> for ParameterValue {
    fn from(s: String) -> Self {
        ParameterValue::String(s)
    }
}

impl From<&str> for ParameterValue {
    fn from(s: &str) -> Self {
        ParameterValue::String(s.to_string())
    }
}

impl From<f64> for ParameterValue {
    fn from(n: f64) -> Self {
        ParameterValue::Number(n)
    }
}

impl From<i64> for ParameterValue {
    fn from(i: i64) -> Self {
        ParameterValue::Integer(i)
    }
}

impl From<bool> for ParameterValue {
    fn from(b: bool) -> Self {
        ParameterValue::Boolean(b)
    }
}

/// Parameter constraints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterConstraints {
    /// Minimum value (for numbers)
    pub min: Option<f64>,
    /// Maximum value (for numbers)
    pub max: Option<f64>,
    /// Allowed values (for enums)
    pub allowed_values: Option<Vec<ParameterValue>>,
}

impl ParameterConstraints {
    /// Create a new empty constraints object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum value
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Set maximum value
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    /// Set allowed values
    pub fn with_allowed_values(mut self, values: Vec<ParameterValue>) -> Self {
        self.allowed_values = Some(values);
        self
    }

    fn check(&self, id: &str, value: &ParameterValue) -> Result<(), String> {
        if let Some(n) = value.as_number() {
            let below = self.min.map_or(false, |min| n < min);
            let above = self.max.map_or(false, |max| n > max);
            if below || above {
                return Err(format!(
                    "{} must be between {} and {}",
                    id,
                    self.min.map_or("-inf".to_string(), |v| v.to_string()),
                    self.max.map_or("inf".to_string(), |v| v.to_string()),
                ));
            }
        }
        if let Some(allowed) = &self.allowed_values {
            if !allowed.contains(value) {
                let names: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                return Err(format!("{} must be one of [{}]", id, names.join(", ")));
            }
        }
        Ok(())
    }
}

/// Fully resolved parameter values of one block instance
pub type ParameterSet = BTreeMap<String, ParameterValue>;

/// Resolve user-supplied overrides against declared parameters: unknown names
/// are rejected, values are checked and every missing parameter takes its
/// default. Errors carry `(parameter, reason)`.
pub fn resolve_parameters(
    declared: &[Parameter],
    overrides: &ParameterSet,
) -> Result<ParameterSet, (String, String)> {
    for name in overrides.keys() {
        if !declared.iter().any(|p| &p.id == name) {
            return Err((name.clone(), format!("unknown parameter '{}'", name)));
        }
    }

    let mut resolved = ParameterSet::new();
    for param in declared {
        let value = match overrides.get(&param.id) {
            Some(v) => param.validate(v).map_err(|e| (param.id.clone(), e))?,
            None => param.default_value.clone(),
        };
        resolved.insert(param.id.clone(), value);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_size() -> Parameter {
        Parameter::integer("page_size", "Page Size", 8192, 512, 65536)
    }

    #[test]
    fn test_integer_range() {
        let p = page_size();
        assert_eq!(p.validate(&4096i64.into()), Ok(ParameterValue::Integer(4096)));
        assert!(p.validate(&100i64.into()).is_err());
        assert!(p.validate(&100_000i64.into()).is_err());
    }

    #[test]
    fn test_integer_accepts_integral_number() {
        let p = page_size();
        assert_eq!(p.validate(&1024.0.into()), Ok(ParameterValue::Integer(1024)));
        assert!(p.validate(&1024.5.into()).is_err());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let err = page_size().validate(&"big".into()).unwrap_err();
        assert!(err.contains("must be an integer"), "{}", err);
    }

    #[test]
    fn test_enum_allowed_values() {
        let p = Parameter::enumeration("scan_type", "Scan Type", "point", &["point", "range"]);
        assert!(p.validate(&"range".into()).is_ok());
        let err = p.validate(&"sideways".into()).unwrap_err();
        assert!(err.contains("must be one of"), "{}", err);
    }

    #[test]
    fn test_number_widens_integer() {
        let p = Parameter::number("fill_factor", "Fill Factor", 0.9, 0.1, 1.0);
        assert_eq!(p.validate(&1i64.into()), Ok(ParameterValue::Number(1.0)));
    }

    #[test]
    fn test_resolve_fills_defaults_and_rejects_unknown() {
        let declared = vec![page_size(), Parameter::boolean("unique", "Unique", false)];

        let mut overrides = ParameterSet::new();
        overrides.insert("unique".into(), true.into());
        let resolved = resolve_parameters(&declared, &overrides).unwrap();
        assert_eq!(resolved["page_size"], ParameterValue::Integer(8192));
        assert_eq!(resolved["unique"], ParameterValue::Boolean(true));

        overrides.insert("colour".into(), "blue".into());
        let (name, _) = resolve_parameters(&declared, &overrides).unwrap_err();
        assert_eq!(name, "colour");
    }

    #[test]
    fn test_untagged_deserialization_prefers_integer() {
        let v: ParameterValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, ParameterValue::Integer(42));
        let v: ParameterValue = serde_json::from_str("0.5").unwrap();
        assert_eq!(v, ParameterValue::Number(0.5));
    }
}
