//! Tool registry interface and the static-config implementation.
//!
//! The router/proxy and session transport consume the `ToolRegistry` trait;
//! storage and synchronization live behind it. The shipped implementation
//! loads a JSON file at startup and keeps removed entries as soft-deleted
//! (`active: false`) so lookups can distinguish "unknown" from "retired".

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::auth::AuthContext;
use crate::rpc::Tool;

/// Resolved network identity of the process implementing a tool.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub tool_name: String,
    /// Scope the tool is exposed under; a hard authorization boundary.
    pub scope: String,
    /// Backend process id, the circuit breaker key.
    pub backend_id: String,
    pub url: String,
    pub active: bool,
    /// Roles required to invoke the tool; empty means any caller.
    pub required_roles: Vec<String>,
}

/// Answers tool visibility and backend resolution questions.
pub trait ToolRegistry: Send + Sync {
    /// Tools visible under a scope for a given caller, permission-filtered.
    fn visible_tools(&self, scope: &str, ctx: &AuthContext) -> Vec<Tool>;

    /// Backend descriptor for a tool name, including soft-deleted entries.
    fn descriptor(&self, tool_name: &str) -> Option<BackendDescriptor>;
}

/// One tool definition from the static config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    pub description: String,
    pub scope: String,
    pub backend_id: String,
    pub backend_url: String,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    tools: Vec<ToolEntry>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to read registry file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse registry file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("Duplicate tool name in registry: {0}")]
    DuplicateTool(String),
}

/// In-memory registry populated from static config.
pub struct StaticRegistry {
    tools: HashMap<String, ToolEntry>,
}

impl StaticRegistry {
    pub fn from_entries(entries: Vec<ToolEntry>) -> Result<Self, RegistryError> {
        let mut tools: HashMap<String, ToolEntry> = HashMap::with_capacity(entries.len());
        for entry in entries {
            if tools.contains_key(&entry.name) {
                return Err(RegistryError::DuplicateTool(entry.name));
            }
            tools.insert(entry.name.clone(), entry);
        }
        Ok(Self { tools })
    }

    /// Load from a JSON registry file. A missing file yields an empty
    /// registry.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Registry file not found, starting empty");
            return Ok(Self {
                tools: HashMap::new(),
            });
        }

        let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let file: RegistryFile =
            serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
                path: path.display().to_string(),
                source,
            })?;

        tracing::info!(
            path = %path.display(),
            tools = file.tools.len(),
            "Loaded tool registry"
        );
        Self::from_entries(file.tools)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl ToolRegistry for StaticRegistry {
    fn visible_tools(&self, scope: &str, ctx: &AuthContext) -> Vec<Tool> {
        let mut visible: Vec<Tool> = self
            .tools
            .values()
            .filter(|entry| entry.active && entry.scope == scope)
            .filter(|entry| ctx.can_use_tool(&entry.name))
            .filter(|entry| {
                entry.required_roles.is_empty()
                    || entry.required_roles.iter().any(|r| ctx.roles.contains(r))
            })
            .map(|entry| Tool {
                name: entry.name.clone(),
                description: Some(entry.description.clone()),
                input_schema: entry.input_schema.clone().unwrap_or_else(|| {
                    serde_json::json!({
                        "type": "object",
                        "properties": {},
                        "additionalProperties": true
                    })
                }),
            })
            .collect();

        visible.sort_by(|a, b| a.name.cmp(&b.name));
        visible
    }

    fn descriptor(&self, tool_name: &str) -> Option<BackendDescriptor> {
        self.tools.get(tool_name).map(|entry| BackendDescriptor {
            tool_name: entry.name.clone(),
            scope: entry.scope.clone(),
            backend_id: entry.backend_id.clone(),
            url: entry.backend_url.clone(),
            active: entry.active,
            required_roles: entry.required_roles.clone(),
        })
    }
}
