//! Registry of tools the agent has created for itself.
//!
//! Tools are named specs with typed parameters. Each invocation bumps the
//! tool's usage count so rarely used tools can be pruned.

use crate::error::{Error, Result};
use crate::persist::{ensure_dir, load_or_default, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

const TOOLS_FILE: &str = "tools.json";

/// One parameter of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Type name, e.g. "string" or "number".
    #[serde(rename = "type")]
    pub kind: String,
    /// What the parameter is for.
    #[serde(default)]
    pub description: String,
    /// Whether callers must supply it.
    #[serde(default)]
    pub required: bool,
}

impl ParamSpec {
    /// A required parameter.
    pub fn required(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: String::new(),
            required: true,
        }
    }

    /// An optional parameter.
    pub fn optional(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }
}

/// A registered tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    /// Unique name.
    pub name: String,
    /// Tool category, e.g. "search" or "analysis".
    #[serde(rename = "type")]
    pub kind: String,
    /// What the tool does.
    pub description: String,
    /// Accepted parameters.
    #[serde(default)]
    pub parameters: Vec<ParamSpec>,
    /// Number of recorded invocations.
    #[serde(default)]
    pub usage_count: u64,
    /// When the tool was registered.
    pub created_at: DateTime<Utc>,
}

/// Input for `ToolRegistry::create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTool {
    /// Unique name.
    pub name: String,
    /// Tool category.
    pub kind: String,
    /// What the tool does.
    pub description: String,
    /// Accepted parameters.
    pub parameters: Vec<ParamSpec>,
}

impl NewTool {
    /// A tool with no parameters.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Add a parameter.
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.parameters.push(param);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ToolsDoc {
    tools: Vec<ToolSpec>,
}

/// The tool registry.
#[derive(Debug)]
pub struct ToolRegistry {
    path: PathBuf,
    state: Mutex<ToolsDoc>,
}

impl ToolRegistry {
    /// Open (or create) a registry rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Storage` or `Error::Serialization` if the registry
    /// cannot be loaded.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        ensure_dir(root)?;
        let path = root.join(TOOLS_FILE);
        let doc = load_or_default(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(doc),
        })
    }

    /// Release the registry. Every change is already on disk.
    pub fn close(self) {}

    fn lock(&self) -> MutexGuard<'_, ToolsDoc> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new tool.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` if the name is empty or taken.
    pub fn create(&self, tool: NewTool) -> Result<ToolSpec> {
        if tool.name.trim().is_empty() {
            return Err(Error::invalid_state("tool name must not be empty"));
        }

        let mut state = self.lock();
        if state.tools.iter().any(|t| t.name == tool.name) {
            return Err(Error::invalid_state(format!(
                "tool '{}' already exists",
                tool.name
            )));
        }

        let spec = ToolSpec {
            name: tool.name,
            kind: tool.kind,
            description: tool.description,
            parameters: tool.parameters,
            usage_count: 0,
            created_at: Utc::now(),
        };
        let mut next = state.clone();
        next.tools.push(spec.clone());
        write_atomic(&self.path, &next)?;
        *state = next;

        info!(name = %spec.name, kind = %spec.kind, "registered tool");
        Ok(spec)
    }

    /// Record one invocation of `name`.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown tool.
    pub fn invoke(&self, name: &str) -> Result<ToolSpec> {
        let mut state = self.lock();
        let mut next = state.clone();
        let tool = next
            .tools
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::not_found("tool", name))?;
        tool.usage_count += 1;
        let updated = tool.clone();
        write_atomic(&self.path, &next)?;
        *state = next;
        Ok(updated)
    }

    /// Remove a tool.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown tool.
    pub fn delete(&self, name: &str) -> Result<ToolSpec> {
        let mut state = self.lock();
        let mut next = state.clone();
        let idx = next
            .tools
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| Error::not_found("tool", name))?;
        let removed = next.tools.remove(idx);
        write_atomic(&self.path, &next)?;
        *state = next;

        info!(name = %removed.name, uses = removed.usage_count, "deleted tool");
        Ok(removed)
    }

    /// All tools, in registration order.
    pub fn list(&self) -> Vec<ToolSpec> {
        self.lock().tools.clone()
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<ToolSpec> {
        self.lock().tools.iter().find(|t| t.name == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_tool() -> NewTool {
        NewTool::new("arxiv_search", "search", "Search arXiv abstracts")
            .param(ParamSpec::required("query", "string"))
            .param(ParamSpec::optional("limit", "number"))
    }

    #[test]
    fn test_create_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::open(dir.path()).unwrap();

        let tool = registry.create(search_tool()).unwrap();
        assert_eq!(tool.usage_count, 0);
        assert_eq!(tool.parameters.len(), 2);
        assert!(!tool.parameters[1].required);

        assert!(matches!(
            registry.create(search_tool()),
            Err(Error::InvalidState { .. })
        ));
        assert!(registry.create(NewTool::new(" ", "search", "")).is_err());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_invoke_counts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = ToolRegistry::open(dir.path()).unwrap();
            registry.create(search_tool()).unwrap();
            registry.invoke("arxiv_search").unwrap();
            assert_eq!(registry.invoke("arxiv_search").unwrap().usage_count, 2);
            registry.close();
        }

        let registry = ToolRegistry::open(dir.path()).unwrap();
        assert_eq!(registry.get("arxiv_search").unwrap().usage_count, 2);
        assert!(matches!(
            registry.invoke("missing"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::open(dir.path()).unwrap();
        registry.create(search_tool()).unwrap();

        registry.delete("arxiv_search").unwrap();
        assert!(registry.get("arxiv_search").is_none());
        assert!(matches!(
            registry.delete("arxiv_search"),
            Err(Error::NotFound { .. })
        ));
    }
}
