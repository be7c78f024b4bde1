//! Authorization context resolution.
//!
//! Runs once per connection: verify the bearer credential, map the verified
//! claims into an `AuthContext`, and validate that the connection path names
//! a known scope. No backend is ever contacted before this succeeds.

use std::collections::HashSet;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::error::GatewayError;

use super::jwt::{token_from_header, TokenVerifier};
use super::policy::{PolicyConfig, WILDCARD};

/// Immutable per-session authorization context.
///
/// Resolved at handshake time and re-resolved only on reconnect.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub tenant: Option<String>,
    pub roles: Vec<String>,
    pub permitted_tools: HashSet<String>,
    /// Token freshness deadline (the credential's `exp`).
    pub expires_at: OffsetDateTime,
}

impl AuthContext {
    /// Check whether the caller may use a tool (wildcard-aware).
    pub fn can_use_tool(&self, tool_name: &str) -> bool {
        self.permitted_tools.contains(WILDCARD) || self.permitted_tools.contains(tool_name)
    }
}

/// Turns a credential plus a connection path into an `AuthContext`.
pub struct ScopeResolver {
    verifier: Arc<dyn TokenVerifier>,
    policy: PolicyConfig,
    scopes: HashSet<String>,
}

impl ScopeResolver {
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        policy: PolicyConfig,
        scopes: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            verifier,
            policy,
            scopes: scopes.into_iter().collect(),
        }
    }

    /// Validate that a path scope is part of the configured set.
    pub fn validate_scope(&self, scope: &str) -> Result<(), GatewayError> {
        if self.scopes.contains(scope) {
            Ok(())
        } else {
            Err(GatewayError::Auth(format!(
                "Invalid endpoint scope '{scope}'"
            )))
        }
    }

    /// Resolve an `Authorization` header value and a path scope into an
    /// authorization context. Fails closed on any verification error.
    pub fn resolve(&self, authorization: &str, scope: &str) -> Result<AuthContext, GatewayError> {
        self.validate_scope(scope)?;

        let token = token_from_header(authorization)
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        let claims = self
            .verifier
            .verify(token)
            .map_err(|e| GatewayError::Auth(e.to_string()))?;

        let permitted_tools = self.policy.permitted_tools(&claims);
        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|_| GatewayError::Auth("invalid 'exp' claim".to_string()))?;

        tracing::debug!(
            user_id = %claims.sub,
            scope = %scope,
            tools = permitted_tools.len(),
            "Resolved authorization context"
        );

        Ok(AuthContext {
            user_id: claims.sub,
            tenant: claims.tenant,
            roles: claims.roles,
            permitted_tools,
            expires_at,
        })
    }
}
