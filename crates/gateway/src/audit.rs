//! Audit records for tool invocations.
//!
//! Persistent storage is an external collaborator behind `AuditSink`; the
//! gateway guarantees exactly one record per completed call, whether it was
//! denied at admission, failed at the backend, or succeeded.

use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;

/// Terminal outcome of one call, as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Denied,
    BackendError,
    Timeout,
}

/// Structured record of a single tool invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub request_id: String,
    pub user_id: String,
    pub tool_name: String,
    pub backend_id: Option<String>,
    pub status: AuditStatus,
    pub error_code: Option<String>,
    pub duration_ms: u64,
    pub recorded_at: OffsetDateTime,
}

/// Accepts one invocation record per completed call.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: InvocationRecord);
}

/// Emits records as structured log events.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: InvocationRecord) {
        tracing::info!(
            request_id = %record.request_id,
            user_id = %record.user_id,
            tool = %record.tool_name,
            backend = record.backend_id.as_deref().unwrap_or("-"),
            status = ?record.status,
            error_code = record.error_code.as_deref().unwrap_or("-"),
            duration_ms = record.duration_ms,
            "tool invocation"
        );
    }
}

/// Builder tracking one call from dispatch to its terminal outcome.
pub struct AuditContext {
    request_id: String,
    user_id: String,
    tool_name: String,
    backend_id: Option<String>,
    started: Instant,
}

impl AuditContext {
    pub fn new(request_id: String, user_id: String, tool_name: String) -> Self {
        Self {
            request_id,
            user_id,
            tool_name,
            backend_id: None,
            started: Instant::now(),
        }
    }

    pub fn set_backend(&mut self, backend_id: &str) {
        self.backend_id = Some(backend_id.to_string());
    }

    /// Consume the context into its terminal record.
    pub fn finish(self, status: AuditStatus, error_code: Option<&str>) -> InvocationRecord {
        InvocationRecord {
            request_id: self.request_id,
            user_id: self.user_id,
            tool_name: self.tool_name,
            backend_id: self.backend_id,
            status,
            error_code: error_code.map(|c| c.to_string()),
            duration_ms: self.started.elapsed().as_millis() as u64,
            recorded_at: OffsetDateTime::now_utc(),
        }
    }
}
