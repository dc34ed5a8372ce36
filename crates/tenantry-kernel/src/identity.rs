//! Identifier types.

use std::fmt;

use serde::{Deserialize, Serialize};

pub type RunId = String;
pub type ManagerId = String;
pub type PropertyId = String;
pub type ActionId = String;
pub type ExceptionId = String;
pub type PolicyId = String;

/// Generates a prefixed random identifier, e.g. `run-5b0c…`.
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Tag selecting the workflow engine that executes a run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowType(String);

impl WorkflowType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WorkflowType {
    fn from(value: String) -> Self {
        Self(value)
    }
}
