//! Gateway error taxonomy and JSON-RPC mapping.
//!
//! Every denial or failure is decided locally and converted to exactly one
//! terminal JSON-RPC error. Nothing is retried by the gateway itself.

use serde_json::json;

use crate::rpc::JsonRpcError;

/// Errors produced while handling a single call.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // Identity not established - fails closed before any admission check
    #[error("Authentication failed: {0}")]
    Auth(String),

    // Identity established but not entitled - no backend contact
    #[error("Tool '{tool}' is not available on endpoint '/{scope}/sse'")]
    ScopeDenied { tool: String, scope: String },
    #[error("Tool '{tool}' is not permitted for this caller")]
    PermissionDenied { tool: String },

    // Entitled but over quota - safe to retry after the hint
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: f64 },

    // Entitled and under quota, but the backend is judged unhealthy
    #[error("Backend '{backend}' circuit is open")]
    CircuitOpen { backend: String },

    // Call was attempted and failed
    #[error("Backend '{backend}' timed out after {timeout_secs}s")]
    BackendTimeout { backend: String, timeout_secs: f64 },
    #[error("Backend '{backend}' is unavailable: {reason}")]
    BackendUnreachable { backend: String, reason: String },
    #[error("Backend '{backend}' returned an invalid response: {reason}")]
    BackendProtocol { backend: String, reason: String },

    // Local to the offending frame; does not affect session state
    #[error("Payload size {size_bytes} bytes exceeds limit of {max_bytes} bytes")]
    PayloadTooLarge { size_bytes: usize, max_bytes: usize },
    #[error("Tool '{0}' not found in registry")]
    ToolNotFound(String),
    #[error("Too many concurrent calls for tool '{tool}'")]
    ConcurrencyLimit { tool: String },
    #[error("Meta-tool '{0}' was removed in v2. Use scoped tools/list and tools/call directly.")]
    MetaToolRemoved(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Map to the client-facing JSON-RPC error object.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            GatewayError::Auth(_) => JsonRpcError::new(JsonRpcError::AUTH_ERROR, self.to_string()),
            GatewayError::ScopeDenied { .. } | GatewayError::PermissionDenied { .. } => {
                JsonRpcError::new(JsonRpcError::SCOPE_DENIED, self.to_string())
            }
            GatewayError::RateLimited { retry_after_secs } => {
                JsonRpcError::new(JsonRpcError::RATE_LIMITED, self.to_string())
                    .with_data(json!({ "retryAfter": retry_after_secs }))
            }
            GatewayError::CircuitOpen { .. } => {
                JsonRpcError::new(JsonRpcError::CIRCUIT_OPEN, self.to_string())
            }
            GatewayError::BackendTimeout { .. } => {
                JsonRpcError::new(JsonRpcError::BACKEND_TIMEOUT, self.to_string())
            }
            GatewayError::BackendUnreachable { .. } => {
                JsonRpcError::new(JsonRpcError::BACKEND_UNREACHABLE, self.to_string())
            }
            GatewayError::BackendProtocol { .. } => {
                JsonRpcError::internal_error(self.to_string())
            }
            GatewayError::PayloadTooLarge { .. } => {
                JsonRpcError::new(JsonRpcError::PAYLOAD_TOO_LARGE, self.to_string())
            }
            GatewayError::ToolNotFound(_) => JsonRpcError::invalid_params(self.to_string()),
            GatewayError::ConcurrencyLimit { .. } => {
                JsonRpcError::new(JsonRpcError::RATE_LIMITED, self.to_string())
                    .with_data(json!({ "reason": "concurrency" }))
            }
            GatewayError::MetaToolRemoved(_) => {
                JsonRpcError::new(JsonRpcError::META_TOOL_REMOVED, self.to_string())
            }
            GatewayError::Internal(_) => JsonRpcError::internal_error(self.to_string()),
        }
    }

    /// Short code recorded in audit logs.
    pub fn audit_code(&self) -> &'static str {
        match self {
            GatewayError::Auth(_) => "AUTH_ERROR",
            GatewayError::ScopeDenied { .. } => "SCOPE_DENIED",
            GatewayError::PermissionDenied { .. } => "PERMISSION_DENIED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            GatewayError::BackendTimeout { .. } => "BACKEND_TIMEOUT",
            GatewayError::BackendUnreachable { .. } => "BACKEND_UNAVAILABLE",
            GatewayError::BackendProtocol { .. } => "BACKEND_PROTOCOL_ERROR",
            GatewayError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            GatewayError::ToolNotFound(_) => "TOOL_NOT_FOUND",
            GatewayError::ConcurrencyLimit { .. } => "CONCURRENCY_LIMIT",
            GatewayError::MetaToolRemoved(_) => "META_TOOL_REMOVED",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for call handling.
pub type GatewayResult<T> = Result<T, GatewayError>;
