//! Shared application state.

use std::sync::Arc;

use anyhow::Context;

use crate::admission::AdmissionController;
use crate::audit::{AuditSink, TracingAuditSink};
use crate::auth::{JwtVerifier, PolicyConfig, ScopeResolver};
use crate::breaker::CircuitBreakerRegistry;
use crate::config::Config;
use crate::proxy::RouterProxy;
use crate::ratelimit::RateLimiterRegistry;
use crate::registry::{StaticRegistry, ToolRegistry};
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub resolver: Arc<ScopeResolver>,
    pub registry: Arc<dyn ToolRegistry>,
    pub admission: Arc<AdmissionController>,
    pub proxy: Arc<RouterProxy>,
    pub audit: Arc<dyn AuditSink>,
    pub sessions: SessionRegistry,
    #[cfg(test)]
    pub(crate) recording: Option<Arc<crate::audit::test_support::RecordingSink>>,
}

impl AppState {
    /// Wire up every component from configuration. Registry and policy
    /// files are loaded once here; there is no runtime reload.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let verifier = JwtVerifier::new(
            &config.jwt_secret,
            &config.jwt_issuer,
            &config.jwt_audience,
            config.max_token_age_secs,
        );
        let policy = PolicyConfig::load(&config.policy_path)
            .with_context(|| format!("loading policy from {}", config.policy_path.display()))?;
        let resolver = Arc::new(ScopeResolver::new(
            Arc::new(verifier),
            policy,
            config.scopes.iter().cloned(),
        ));

        let registry: Arc<dyn ToolRegistry> = Arc::new(
            StaticRegistry::load(&config.registry_path).with_context(|| {
                format!("loading tool registry from {}", config.registry_path.display())
            })?,
        );

        let limiters = Arc::new(RateLimiterRegistry::new(
            config.user_rate_limit.clone(),
            config.tool_rate_limit.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&registry),
            limiters,
            Arc::clone(&breakers),
            config.max_concurrent_per_tool,
        ));
        let proxy = Arc::new(RouterProxy::new(
            breakers,
            config.gateway_secret.clone(),
            config.call_timeout,
        )?);

        Ok(Self {
            config: Arc::new(config),
            resolver,
            registry,
            admission,
            proxy,
            audit: Arc::new(TracingAuditSink),
            sessions: SessionRegistry::new(),
            #[cfg(test)]
            recording: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use crate::audit::test_support::RecordingSink;
    use crate::audit::InvocationRecord;
    use crate::auth::policy::RolePolicy;
    use crate::auth::test_support as jwt_test;
    use crate::breaker::CircuitBreakerConfig;
    use crate::ratelimit::RateLimitConfig;
    use crate::registry::test_support::entry;
    use crate::registry::ToolEntry;

    fn test_config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".to_string(),
            scopes: vec![
                "calculator".to_string(),
                "git".to_string(),
                "docs".to_string(),
            ],
            jwt_secret: jwt_test::TEST_SECRET.to_string(),
            jwt_issuer: jwt_test::TEST_ISSUER.to_string(),
            jwt_audience: jwt_test::TEST_AUDIENCE.to_string(),
            max_token_age_secs: 3600,
            gateway_secret: "gateway-shared-secret-for-tests-only".to_string(),
            registry_path: "unused".into(),
            policy_path: "unused".into(),
            user_rate_limit: RateLimitConfig {
                requests_per_minute: 600,
                burst_size: 100,
            },
            tool_rate_limit: RateLimitConfig {
                requests_per_minute: 600,
                burst_size: 100,
            },
            breaker: CircuitBreakerConfig::default(),
            max_concurrent_per_tool: 10,
            max_frame_bytes: 4096,
            max_argument_bytes: 1024,
            call_timeout: Duration::from_secs(2),
        }
    }

    fn wildcard_policy() -> PolicyConfig {
        PolicyConfig {
            roles: HashMap::from([(
                "developer".to_string(),
                RolePolicy {
                    allowed_tools: vec!["*".to_string()],
                },
            )]),
            tenants: HashMap::new(),
        }
    }

    fn build(entries: Vec<ToolEntry>) -> AppState {
        let config = test_config();
        let resolver = Arc::new(ScopeResolver::new(
            Arc::new(jwt_test::verifier()),
            wildcard_policy(),
            config.scopes.iter().cloned(),
        ));
        let registry: Arc<dyn ToolRegistry> =
            Arc::new(StaticRegistry::from_entries(entries).unwrap());
        let limiters = Arc::new(RateLimiterRegistry::new(
            config.user_rate_limit.clone(),
            config.tool_rate_limit.clone(),
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&registry),
            limiters,
            Arc::clone(&breakers),
            config.max_concurrent_per_tool,
        ));
        let proxy = Arc::new(
            RouterProxy::new(breakers, config.gateway_secret.clone(), config.call_timeout)
                .unwrap(),
        );
        let recording = Arc::new(RecordingSink::default());

        AppState {
            config: Arc::new(config),
            resolver,
            registry,
            admission,
            proxy,
            audit: Arc::clone(&recording) as Arc<dyn AuditSink>,
            sessions: SessionRegistry::new(),
            recording: Some(recording),
        }
    }

    /// State with the default fixture registry and recording audit sink.
    pub fn test_state() -> AppState {
        build(vec![
            entry("add", "calculator", "calc-backend"),
            entry("subtract", "calculator", "calc-backend"),
            entry("git_status", "git", "git-backend"),
            entry("search_docs", "docs", "docs-backend"),
        ])
    }

    /// State built from an explicit registry, for tests that need
    /// per-tool backend wiring.
    pub fn test_state_with_entries(entries: Vec<ToolEntry>) -> AppState {
        build(entries)
    }

    /// State whose calculator tools point at a live test backend.
    pub fn test_state_with_proxy(backend_url: &str) -> AppState {
        build(vec![
            ToolEntry {
                backend_url: backend_url.to_string(),
                ..entry("add", "calculator", "calc-backend")
            },
            ToolEntry {
                backend_url: backend_url.to_string(),
                ..entry("subtract", "calculator", "calc-backend")
            },
            entry("git_status", "git", "git-backend"),
        ])
    }

    impl AppState {
        pub(crate) fn recorded(&self) -> Vec<InvocationRecord> {
            self.recording
                .as_ref()
                .map(|sink| sink.records.lock().unwrap().clone())
                .unwrap_or_default()
        }
    }
}
