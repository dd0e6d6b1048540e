//! Workflow sources — named, ordered step lists.

use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::config::JobsConfig;
use crate::error::{Result, WorkflowError};

/// A named sequence of textual steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<String>,
}

/// Supplies workflows to the control surface.
pub trait WorkflowSource: Send + Sync {
    /// Steps of the named workflow, empty if unknown.
    fn get_steps(&self, name: &str) -> Vec<String>;

    fn list_names(&self) -> Vec<String>;

    /// Add a workflow, replacing any existing one with the same name.
    fn add_workflow(&self, name: &str, steps: Vec<String>);
}

/// Process-local workflow store.
pub struct InMemoryWorkflows {
    workflows: RwLock<Vec<Workflow>>,
}

impl InMemoryWorkflows {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(Vec::new()),
        }
    }

    /// Store seeded with the built-in sample workflows.
    pub fn with_defaults() -> Self {
        let store = Self::new();
        store.add_workflow(
            "google_check",
            vec![
                "navigate to google.com".to_string(),
                "search for 'Rust async runtime'".to_string(),
                "summarize the first result".to_string(),
            ],
        );
        store.add_workflow(
            "docs_lookup",
            vec![
                "navigate to 'https://docs.rs'".to_string(),
                "search for the crate 'tokio-util'".to_string(),
                "open the CancellationToken documentation".to_string(),
                "summarize how child tokens behave".to_string(),
            ],
        );
        store
    }

    /// Built-in workflows plus the configured workflows file, if any.
    pub fn from_config(config: &JobsConfig) -> Result<Self> {
        let store = Self::with_defaults();
        if let Some(path) = &config.workflows_file {
            store.load_json_file(path)?;
        }
        Ok(store)
    }

    /// Merge workflows from a JSON file holding an array of
    /// `{"name": ..., "steps": [...]}` objects. Returns how many were loaded.
    pub fn load_json_file(&self, path: &Path) -> std::result::Result<usize, WorkflowError> {
        let raw = std::fs::read_to_string(path)?;
        let parsed: Vec<Workflow> = serde_json::from_str(&raw)?;

        if let Some(empty) = parsed.iter().find(|w| w.steps.is_empty()) {
            return Err(WorkflowError::Empty {
                name: empty.name.clone(),
            });
        }

        let count = parsed.len();
        for wf in parsed {
            self.add_workflow(&wf.name, wf.steps);
        }
        tracing::info!(path = %path.display(), count, "Loaded workflows");
        Ok(count)
    }
}

impl Default for InMemoryWorkflows {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowSource for InMemoryWorkflows {
    fn get_steps(&self, name: &str) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|w| w.name == name)
            .map(|w| w.steps.clone())
            .unwrap_or_default()
    }

    fn list_names(&self) -> Vec<String> {
        self.workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| w.name.clone())
            .collect()
    }

    fn add_workflow(&self, name: &str, steps: Vec<String>) {
        let mut workflows = self.workflows.write().unwrap_or_else(PoisonError::into_inner);
        match workflows.iter_mut().find(|w| w.name == name) {
            Some(existing) => existing.steps = steps,
            None => workflows.push(Workflow {
                name: name.to_string(),
                steps,
            }),
        }
    }
}
