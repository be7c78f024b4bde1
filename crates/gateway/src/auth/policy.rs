//! Authorization policy: which tools a caller may use.
//!
//! Loaded once at startup from a JSON policy file. Role allowlists are
//! unioned across the caller's roles; tenant policies can replace the
//! allowlist and add deny lists. `"*"` grants every tool.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use super::jwt::VerifiedClaims;

/// Wildcard marker inside allowed-tool sets.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RolePolicy {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantPolicy {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

/// Parsed policy file. Default-deny: a role not listed grants nothing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub roles: HashMap<String, RolePolicy>,
    #[serde(default)]
    pub tenants: HashMap<String, TenantPolicy>,
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to read policy file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse policy file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

impl PolicyConfig {
    /// Load policy from a JSON file. A missing file yields the default
    /// deny-all policy.
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Policy file not found, using deny-all policy");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| PolicyError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Compute the permitted-tool set for a verified caller.
    pub fn permitted_tools(&self, claims: &VerifiedClaims) -> HashSet<String> {
        let mut allowed: HashSet<String> = HashSet::new();
        let mut denied: HashSet<String> = HashSet::new();

        for role in &claims.roles {
            if let Some(role_policy) = self.roles.get(role) {
                allowed.extend(role_policy.allowed_tools.iter().cloned());
            }
        }

        if let Some(tenant) = &claims.tenant {
            if let Some(tenant_policy) = self.tenants.get(tenant) {
                if !tenant_policy.allowed_tools.is_empty() {
                    // Tenant allowlist replaces the role-derived set.
                    allowed = tenant_policy.allowed_tools.iter().cloned().collect();
                }
                denied.extend(tenant_policy.denied_tools.iter().cloned());
            }
        }

        // Deny lists apply even to wildcard holders unless they are admins.
        if !allowed.contains(WILDCARD) || !claims.roles.iter().any(|r| r == "admin") {
            for tool in &denied {
                allowed.remove(tool);
            }
        }

        allowed
    }
}
