//! Dependency constraints and capabilities
//!
//! A block definition can declare what it needs from the blocks upstream of
//! it (dependency constraints) and what lookup capabilities it offers to
//! blocks downstream. Both may be conditional on the instance's parameters,
//! e.g. an LSM tree only needs a write-ahead log when `wal_required` is set,
//! and an index scan only needs range support when `scan_type` is `range`.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::block::BlockCategory;
use super::parameter::{ParameterSet, ParameterValue};

/// Constraint that a block requires from the blocks upstream of it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConstraint {
    /// What must be reachable upstream
    pub kind: ConstraintKind,
    /// Only enforced when this parameter condition holds
    pub when: Option<ParameterCondition>,
    /// Human-readable description of why this constraint is needed
    pub description: String,
}

/// Types of upstream dependencies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    /// An instance of this block definition must be upstream
    UpstreamBlock(String),
    /// An instance of this category must be upstream
    UpstreamCategory(BlockCategory),
}

impl DependencyConstraint {
    /// Create a constraint requiring a specific block definition upstream
    pub fn upstream_block(definition_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: ConstraintKind::UpstreamBlock(definition_id.into()),
            when: None,
            description: description.into(),
        }
    }

    /// Create a constraint requiring a block of some category upstream
    pub fn upstream_category(category: BlockCategory, description: impl Into<String>) -> Self {
        Self {
            kind: ConstraintKind::UpstreamCategory(category),
            when: None,
            description: description.into(),
        }
    }

    /// Only enforce the constraint when `condition` holds
    pub fn when(mut self, condition: ParameterCondition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Whether the constraint applies to an instance with these parameters
    pub fn applies(&self, parameters: &ParameterSet) -> bool {
        self.when.as_ref().map_or(true, |c| c.holds(parameters))
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::UpstreamBlock(id) => write!(f, "upstream block '{}'", id),
            ConstraintKind::UpstreamCategory(c) => write!(f, "upstream {} block", c),
        }
    }
}

/// Equality test on one parameter of the instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterCondition {
    pub parameter: String,
    pub equals: ParameterValue,
}

impl ParameterCondition {
    pub fn new(parameter: impl Into<String>, equals: impl Into<ParameterValue>) -> Self {
        Self {
            parameter: parameter.into(),
            equals: equals.into(),
        }
    }

    pub fn holds(&self, parameters: &ParameterSet) -> bool {
        parameters.get(&self.parameter) == Some(&self.equals)
    }
}

/// Lookup capabilities offered by index-like blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PointLookup,
    RangeScan,
    OrderedIteration,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::PointLookup => "point-lookup",
            Capability::RangeScan => "range-scan",
            Capability::OrderedIteration => "ordered-iteration",
        };
        f.write_str(name)
    }
}

/// A capability that the block feeding an input port must offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequirement {
    /// Input port the requirement is attached to
    pub port: String,
    pub capability: Capability,
    pub when: Option<ParameterCondition>,
}

impl CapabilityRequirement {
    pub fn new(port: impl Into<String>, capability: Capability) -> Self {
        Self {
            port: port.into(),
            capability,
            when: None,
        }
    }

    pub fn when(mut self, condition: ParameterCondition) -> Self {
        self.when = Some(condition);
        self
    }

    pub fn applies(&self, parameters: &ParameterSet) -> bool {
        self.when.as_ref().map_or(true, |c| c.holds(parameters))
    }
}
