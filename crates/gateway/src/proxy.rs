//! Router/proxy: forwards admitted calls to backend tool processes.
//!
//! Injects the gateway trust headers, enforces the per-call deadline, maps
//! backend outcomes to protocol results, and reports every attempted call's
//! outcome to the circuit breaker registry.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::admission::Admitted;
use crate::breaker::{CallKind, CircuitBreakerRegistry};
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{JsonRpcId, JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolCallResult};

/// Header proving the call originated from this gateway.
pub const GATEWAY_AUTH_HEADER: &str = "X-Gateway-Auth";
/// Header carrying the caller's identity so backends can scope side effects.
pub const USER_ID_HEADER: &str = "X-User-ID";
/// Correlation id propagated to backends and audit records.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub struct RouterProxy {
    client: Client,
    breakers: Arc<CircuitBreakerRegistry>,
    gateway_secret: String,
    call_timeout: Duration,
}

impl RouterProxy {
    pub fn new(
        breakers: Arc<CircuitBreakerRegistry>,
        gateway_secret: String,
        call_timeout: Duration,
    ) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(call_timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            breakers,
            gateway_secret,
            call_timeout,
        })
    }

    /// Forward an admitted `tools/call` to its backend and return the
    /// terminal result.
    ///
    /// Every admitted call ends in an outcome report to the breaker
    /// registry, so a half-open probe always settles the circuit.
    pub async fn route(
        &self,
        admitted: &Admitted,
        user_id: &str,
        request_id: &str,
        arguments: Value,
    ) -> GatewayResult<ToolCallResult> {
        let descriptor = &admitted.descriptor;
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(JsonRpcId::String(request_id.to_string())),
            method: "tools/call".to_string(),
            params: Some(
                serde_json::to_value(ToolCallParams {
                    name: descriptor.tool_name.clone(),
                    arguments,
                })
                .map_err(|e| GatewayError::Internal(e.to_string()))?,
            ),
        };

        let outcome = self
            .forward(descriptor.backend_id.as_str(), &descriptor.url, user_id, request_id, &request)
            .await;

        match &outcome {
            Ok(_) => {
                self.breakers
                    .record_outcome(&descriptor.backend_id, admitted.call_kind, true)
                    .await;
            }
            Err(err) => {
                if counts_as_circuit_failure(err) || admitted.call_kind == CallKind::Probe {
                    self.breakers
                        .record_outcome(&descriptor.backend_id, admitted.call_kind, false)
                        .await;
                }
            }
        }

        outcome
    }

    async fn forward(
        &self,
        backend_id: &str,
        url: &str,
        user_id: &str,
        request_id: &str,
        request: &JsonRpcRequest,
    ) -> GatewayResult<ToolCallResult> {
        let send = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(GATEWAY_AUTH_HEADER, &self.gateway_secret)
            .header(USER_ID_HEADER, user_id)
            .header(REQUEST_ID_HEADER, request_id)
            .json(request)
            .send();

        // Deadline independent of any client-visible timeout.
        let response = match tokio::time::timeout(self.call_timeout, send).await {
            Err(_) => {
                return Err(GatewayError::BackendTimeout {
                    backend: backend_id.to_string(),
                    timeout_secs: self.call_timeout.as_secs_f64(),
                });
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(GatewayError::BackendTimeout {
                    backend: backend_id.to_string(),
                    timeout_secs: self.call_timeout.as_secs_f64(),
                });
            }
            Ok(Err(e)) => {
                return Err(GatewayError::BackendUnreachable {
                    backend: backend_id.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.is_server_error() {
            return Err(GatewayError::BackendUnreachable {
                backend: backend_id.to_string(),
                reason: format!("HTTP {status}"),
            });
        }
        if status.is_client_error() {
            return Err(GatewayError::BackendProtocol {
                backend: backend_id.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let rpc_response: JsonRpcResponse = match tokio::time::timeout(
            self.call_timeout,
            response.json::<JsonRpcResponse>(),
        )
        .await
        {
            Err(_) => {
                return Err(GatewayError::BackendTimeout {
                    backend: backend_id.to_string(),
                    timeout_secs: self.call_timeout.as_secs_f64(),
                });
            }
            Ok(Err(e)) => {
                return Err(GatewayError::BackendProtocol {
                    backend: backend_id.to_string(),
                    reason: e.to_string(),
                });
            }
            Ok(Ok(resp)) => resp,
        };

        // A JSON-RPC error is a healthy backend declining the call: surface
        // it as a tool-level error result.
        if let Some(error) = rpc_response.error {
            return Ok(ToolCallResult {
                content: vec![crate::rpc::Content::Text {
                    text: format!("Error: {}", error.message),
                }],
                is_error: true,
            });
        }

        let result = rpc_response.result.ok_or_else(|| GatewayError::BackendProtocol {
            backend: backend_id.to_string(),
            reason: "response carried neither result nor error".to_string(),
        })?;

        // Lenient parse: a backend returning a bare value is wrapped as text.
        match serde_json::from_value::<ToolCallResult>(result.clone()) {
            Ok(parsed) => Ok(parsed),
            Err(_) => Ok(ToolCallResult::text(result.to_string())),
        }
    }
}

/// Only timeouts, connection errors, and 5xx-equivalents move the breaker;
/// protocol-shaped responses do not.
fn counts_as_circuit_failure(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::BackendTimeout { .. } | GatewayError::BackendUnreachable { .. }
    )
}
