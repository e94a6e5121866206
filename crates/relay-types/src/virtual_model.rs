//! Virtual models: logical targets routed onto concrete providers.

use serde::{Deserialize, Serialize};

use crate::{RelayError, Result};

/// One routable upstream behind a virtual model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub provider_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl Target {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            weight: None,
            priority: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A logical model name mapping onto one or more provider targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualModel {
    pub id: String,
    pub targets: Vec<Target>,
}

impl VirtualModel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            targets: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    /// A virtual model with no targets can never be served; executions
    /// refuse to start against one.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(RelayError::Configuration(format!(
                "virtual model '{}' has no targets",
                self.id
            )));
        }
        Ok(())
    }

    pub fn target_ids(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.provider_id.as_str()).collect()
    }
}
