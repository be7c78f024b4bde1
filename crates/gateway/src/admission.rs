//! Ordered admission checks for one call.
//!
//! Cheapest and most certain checks run first; each failure short-circuits
//! and is terminal for that call. Tokens consumed by the bucket checks are
//! not refunded when a later check denies - the conservative policy the
//! rate limiter tests pin down explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::auth::AuthContext;
use crate::breaker::{BreakerDecision, CallKind, CircuitBreakerRegistry};
use crate::error::{GatewayError, GatewayResult};
use crate::ratelimit::{RateLimiterRegistry, SubjectKind};
use crate::registry::{BackendDescriptor, ToolRegistry};

/// Tracks in-flight call counts per tool.
///
/// `acquire` hands out a guard that decrements the counter on drop, so the
/// slot is released on every exit path, including panics and cancelled
/// tasks.
#[derive(Clone, Default)]
pub struct InFlightTracker {
    counts: Arc<Mutex<HashMap<String, u32>>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, tool: &str, max: u32) -> Option<InFlightGuard> {
        let mut counts = match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = counts.entry(tool.to_string()).or_insert(0);
        if *count >= max {
            return None;
        }
        *count += 1;
        Some(InFlightGuard {
            counts: Arc::clone(&self.counts),
            tool: tool.to_string(),
        })
    }

    pub fn current(&self, tool: &str) -> u32 {
        let counts = match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        counts.get(tool).copied().unwrap_or(0)
    }
}

/// Releases one in-flight slot when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    counts: Arc<Mutex<HashMap<String, u32>>>,
    tool: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut counts = match self.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(count) = counts.get_mut(&self.tool) {
            *count = count.saturating_sub(1);
        }
    }
}

/// An admitted call, carrying everything the proxy needs.
#[derive(Debug)]
pub struct Admitted {
    pub descriptor: BackendDescriptor,
    /// Whether this call is the breaker's half-open probe.
    pub call_kind: CallKind,
    /// Held for the lifetime of the call; releases the concurrency slot.
    pub _inflight: InFlightGuard,
}

/// Runs the admission chain for tool calls.
pub struct AdmissionController {
    registry: Arc<dyn ToolRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    inflight: InFlightTracker,
    max_concurrent_per_tool: u32,
}

impl AdmissionController {
    pub fn new(
        registry: Arc<dyn ToolRegistry>,
        limiters: Arc<RateLimiterRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        max_concurrent_per_tool: u32,
    ) -> Self {
        Self {
            registry,
            limiters,
            breakers,
            inflight: InFlightTracker::new(),
            max_concurrent_per_tool,
        }
    }

    /// Decide whether a call may proceed to the proxy.
    ///
    /// Check order: scope match, permission, per-user quota, per-tool
    /// quota, per-tool concurrency cap, circuit state. The first failure
    /// wins and is terminal for the call.
    pub async fn admit(
        &self,
        ctx: &AuthContext,
        scope: &str,
        tool_name: &str,
    ) -> GatewayResult<Admitted> {
        // Resolving the descriptor up front gives us the owning scope; an
        // unknown tool never reaches quota accounting.
        let descriptor = self
            .registry
            .descriptor(tool_name)
            .ok_or_else(|| GatewayError::ToolNotFound(tool_name.to_string()))?;

        // Soft-deleted tools behave exactly like unknown ones. Rejecting
        // here keeps them out of quota and breaker accounting; in
        // particular a half-open probe must never be spent on one.
        if !descriptor.active {
            return Err(GatewayError::ToolNotFound(tool_name.to_string()));
        }

        // (1) Scope is a hard boundary, independent of permissions.
        if descriptor.scope != scope {
            return Err(GatewayError::ScopeDenied {
                tool: tool_name.to_string(),
                scope: scope.to_string(),
            });
        }

        // (2) Permission set from the caller's authorization context, plus
        // the tool's own role requirement. A wildcard permit does not
        // bypass required roles.
        if !ctx.can_use_tool(tool_name) {
            return Err(GatewayError::PermissionDenied {
                tool: tool_name.to_string(),
            });
        }
        if !descriptor.required_roles.is_empty()
            && !descriptor
                .required_roles
                .iter()
                .any(|r| ctx.roles.contains(r))
        {
            return Err(GatewayError::PermissionDenied {
                tool: tool_name.to_string(),
            });
        }

        // (3) Per-user quota. Consumed tokens stay consumed.
        let user_decision = self
            .limiters
            .try_consume(SubjectKind::User, &ctx.user_id)
            .await;
        if !user_decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_secs: user_decision.retry_after_secs,
            });
        }

        // (4) Per-tool quota.
        let tool_decision = self
            .limiters
            .try_consume(SubjectKind::Tool, tool_name)
            .await;
        if !tool_decision.allowed {
            return Err(GatewayError::RateLimited {
                retry_after_secs: tool_decision.retry_after_secs,
            });
        }

        // (5) Per-tool concurrency cap.
        let guard = self
            .inflight
            .acquire(tool_name, self.max_concurrent_per_tool)
            .ok_or_else(|| GatewayError::ConcurrencyLimit {
                tool: tool_name.to_string(),
            })?;

        // (6) Circuit state for the resolved backend.
        let call_kind = match self.breakers.try_acquire(&descriptor.backend_id).await {
            BreakerDecision::Permitted(kind) => kind,
            BreakerDecision::Rejected => {
                return Err(GatewayError::CircuitOpen {
                    backend: descriptor.backend_id.clone(),
                });
            }
        };

        tracing::debug!(
            user_id = %ctx.user_id,
            tool = %tool_name,
            backend = %descriptor.backend_id,
            probe = matches!(call_kind, CallKind::Probe),
            "Call admitted"
        );

        Ok(Admitted {
            descriptor,
            call_kind,
            _inflight: guard,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::ratelimit::RateLimitConfig;
    use crate::registry::test_support::{entry, sample_registry};
    use crate::registry::{StaticRegistry, ToolEntry};
    use std::collections::HashSet;
    use std::time::Duration;
    use time::OffsetDateTime;

    fn ctx(tools: &[&str]) -> AuthContext {
        AuthContext {
            user_id: "user-1".to_string(),
            tenant: None,
            roles: vec!["developer".to_string()],
            permitted_tools: tools.iter().map(|t| t.to_string()).collect::<HashSet<_>>(),
            expires_at: OffsetDateTime::now_utc(),
        }
    }

    fn controller_with(
        registry: StaticRegistry,
        breaker_config: CircuitBreakerConfig,
        user_limit: u32,
        tool_limit: u32,
        max_concurrent: u32,
    ) -> AdmissionController {
        let user_config = RateLimitConfig {
            requests_per_minute: 60,
            burst_size: user_limit,
        };
        let tool_config = RateLimitConfig {
            requests_per_minute: 60,
            burst_size: tool_limit,
        };
        AdmissionController::new(
            Arc::new(registry),
            Arc::new(RateLimiterRegistry::new(user_config, tool_config)),
            Arc::new(CircuitBreakerRegistry::new(breaker_config)),
            max_concurrent,
        )
    }

    fn controller(user_limit: u32, tool_limit: u32, max_concurrent: u32) -> AdmissionController {
        controller_with(
            sample_registry(),
            CircuitBreakerConfig::default(),
            user_limit,
            tool_limit,
            max_concurrent,
        )
    }

    #[tokio::test]
    async fn test_admits_entitled_call() {
        let controller = controller(10, 10, 4);
        let admitted = controller.admit(&ctx(&["add"]), "calculator", "add").await;
        assert!(admitted.is_ok());
    }

    #[tokio::test]
    async fn test_scope_denied_before_permission() {
        let controller = controller(10, 10, 4);
        // Caller may use search_docs, but the session is bound to calculator:
        // the scope boundary wins and no quota is touched.
        let err = controller
            .admit(&ctx(&["search_docs"]), "calculator", "search_docs")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ScopeDenied { .. }));
    }

    #[tokio::test]
    async fn test_permission_denied_within_scope() {
        let controller = controller(10, 10, 4);
        let err = controller
            .admit(&ctx(&["add"]), "calculator", "subtract")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_unknown_tool_not_found() {
        let controller = controller(10, 10, 4);
        let err = controller
            .admit(&ctx(&["*"]), "calculator", "does_not_exist")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_user_quota_denial() {
        let controller = controller(2, 10, 4);
        let ctx = ctx(&["add"]);
        for _ in 0..2 {
            controller.admit(&ctx, "calculator", "add").await.unwrap();
        }
        let err = controller.admit(&ctx, "calculator", "add").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_denied_call_does_not_refund_tokens() {
        // User bucket holds 3 tokens, tool bucket only 1. The second call is
        // denied at the tool bucket but still burns a user token, so only
        // one more admission attempt can pass the user check afterwards.
        let controller = controller(3, 1, 4);
        let ctx = ctx(&["add", "subtract"]);

        controller.admit(&ctx, "calculator", "add").await.unwrap();

        let err = controller.admit(&ctx, "calculator", "add").await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));

        // Third attempt against a different tool: user bucket has exactly
        // one token left, proving the denied attempt was not refunded.
        controller
            .admit(&ctx, "calculator", "subtract")
            .await
            .unwrap();
        let err = controller
            .admit(&ctx, "calculator", "subtract")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let controller = controller(10, 10, 2);
        let ctx = ctx(&["add"]);

        let first = controller.admit(&ctx, "calculator", "add").await.unwrap();
        let second = controller.admit(&ctx, "calculator", "add").await.unwrap();

        let err = controller.admit(&ctx, "calculator", "add").await.unwrap_err();
        assert!(matches!(err, GatewayError::ConcurrencyLimit { .. }));

        // Releasing one in-flight call frees a slot.
        drop(first);
        assert!(controller.admit(&ctx, "calculator", "add").await.is_ok());
        drop(second);
    }

    #[tokio::test]
    async fn test_open_circuit_denies() {
        let controller = controller(100, 100, 10);
        let ctx = ctx(&["add"]);

        // Drive the calc backend's breaker open through recorded failures.
        for _ in 0..5 {
            let admitted = controller.admit(&ctx, "calculator", "add").await.unwrap();
            controller
                .breakers
                .record_outcome(&admitted.descriptor.backend_id, admitted.call_kind, false)
                .await;
        }

        let err = controller.admit(&ctx, "calculator", "add").await.unwrap_err();
        assert!(matches!(err, GatewayError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn test_inactive_tool_does_not_consume_half_open_slot() {
        // Zero cooldown so the breaker offers its trial call immediately
        // after opening.
        let breaker_config = CircuitBreakerConfig {
            cooldown: Duration::ZERO,
            ..CircuitBreakerConfig::default()
        };
        let controller = controller_with(sample_registry(), breaker_config, 100, 100, 10);
        let ctx = ctx(&["*"]);

        for _ in 0..5 {
            let admitted = controller.admit(&ctx, "calculator", "add").await.unwrap();
            controller
                .breakers
                .record_outcome(&admitted.descriptor.backend_id, admitted.call_kind, false)
                .await;
        }

        // legacy_sum is soft-deleted but shares the calc backend. It must be
        // rejected before the breaker hands out the single trial call.
        let err = controller
            .admit(&ctx, "calculator", "legacy_sum")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound(_)));

        // The trial call is still available for a live tool.
        let admitted = controller.admit(&ctx, "calculator", "add").await.unwrap();
        assert_eq!(admitted.call_kind, CallKind::Probe);
    }

    #[tokio::test]
    async fn test_required_role_enforced_at_admission() {
        let registry = StaticRegistry::from_entries(vec![ToolEntry {
            required_roles: vec!["operator".to_string()],
            ..entry("restart_service", "git", "git-backend")
        }])
        .unwrap();
        let controller = controller_with(registry, CircuitBreakerConfig::default(), 10, 10, 4);

        // Wildcard entitlement does not bypass the role requirement.
        let err = controller
            .admit(&ctx(&["*"]), "git", "restart_service")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::PermissionDenied { .. }));

        let mut operator = ctx(&["*"]);
        operator.roles.push("operator".to_string());
        assert!(controller
            .admit(&operator, "git", "restart_service")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_inflight_guard_releases_on_drop() {
        let tracker = InFlightTracker::new();
        {
            let _a = tracker.acquire("add", 2).unwrap();
            let _b = tracker.acquire("add", 2).unwrap();
            assert!(tracker.acquire("add", 2).is_none());
            assert_eq!(tracker.current("add"), 2);
        }
        assert_eq!(tracker.current("add"), 0);
    }
}
