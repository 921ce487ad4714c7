// Build Plans
// Declarative step tree evaluated by the exec engine

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating a plan
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse plan YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid plan structure: {0}")]
    Structure(#[from] serde_json::Error),

    #[error("Put step has an empty name")]
    EmptyName,

    #[error("Put step '{0}' has an empty resource type")]
    EmptyType(String),

    #[error("Step name '{0}' is used more than once")]
    DuplicateName(String),
}

/// A node of the step tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    /// Publish through a resource
    Put(PutPlan),

    /// Run children concurrently
    Aggregate(Vec<Plan>),

    /// Run `next` only once `step` has succeeded
    OnSuccess { step: Box<Plan>, next: Box<Plan> },
}

/// Configuration of a single put step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default)]
    pub source: Map<String, Value>,

    #[serde(default)]
    pub params: Map<String, Value>,

    #[serde(default)]
    pub tags: Vec<String>,
}

impl PutPlan {
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
            source: Map::new(),
            params: Map::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: Map<String, Value>) -> Self {
        self.source = source;
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Plan as shown to users: engine schema plus the plan without credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPlan {
    pub schema: String,
    pub plan: Value,
}

impl Plan {
    /// Parse a plan from YAML
    pub fn from_yaml(content: &str) -> Result<Self, PlanError> {
        // go through a JSON value so enum tags use the same form as stored metadata
        let value: Value = serde_yaml::from_str(content)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Load a plan from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// All put steps in evaluation order
    pub fn puts(&self) -> Vec<&PutPlan> {
        let mut puts = Vec::new();
        self.collect_puts(&mut puts);
        puts
    }

    fn collect_puts<'a>(&'a self, puts: &mut Vec<&'a PutPlan>) {
        match self {
            Plan::Put(put) => puts.push(put),
            Plan::Aggregate(children) => {
                for child in children {
                    child.collect_puts(puts);
                }
            }
            Plan::OnSuccess { step, next } => {
                step.collect_puts(puts);
                next.collect_puts(puts);
            }
        }
    }

    /// Check names and types; names must be unique within one run
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for put in self.puts() {
            if put.name.is_empty() {
                return Err(PlanError::EmptyName);
            }
            if put.resource_type.is_empty() {
                return Err(PlanError::EmptyType(put.name.clone()));
            }
            if !seen.insert(put.name.as_str()) {
                return Err(PlanError::DuplicateName(put.name.clone()));
            }
        }
        Ok(())
    }

    /// The plan without sources and params
    pub fn public(&self) -> Value {
        match self {
            Plan::Put(put) => json!({
                "put": {
                    "name": put.name,
                    "type": put.resource_type,
                    "tags": put.tags,
                }
            }),
            Plan::Aggregate(children) => json!({
                "aggregate": children.iter().map(Plan::public).collect::<Vec<_>>(),
            }),
            Plan::OnSuccess { step, next } => json!({
                "on_success": {
                    "step": step.public(),
                    "next": next.public(),
                }
            }),
        }
    }
}
