//! Broker and engine configuration
//!
//! Every setting has a default and can be overridden from `SWITCHYARD_*`
//! environment variables. Unparseable values fall back to the default.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::reliability::RetryPolicy;
use crate::workflow::DEFAULT_STEP_TIMEOUT;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

// =============================================================================
// Broker
// =============================================================================

/// Message broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Delivery policy for types without an entry in `delivery_policies`
    pub default_policy: RetryPolicy,
    /// Per message type delivery policies
    pub delivery_policies: HashMap<String, RetryPolicy>,
    /// Maximum concurrently running handler invocations
    pub max_in_flight: usize,
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
    /// How often stale correlation waiters are swept
    pub correlation_sweep_interval: Duration,
    /// How long `shutdown` waits for lanes to drain
    pub shutdown_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_policy: RetryPolicy::with_max_retries(3),
            delivery_policies: HashMap::new(),
            max_in_flight: 64,
            handler_timeout: Duration::from_secs(300),
            correlation_sweep_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SWITCHYARD_MAX_RETRIES`: retries after the first delivery (default: 3)
    /// - `SWITCHYARD_BACKOFF_BASE_MS`: first retry delay (default: 500)
    /// - `SWITCHYARD_BACKOFF_MAX_MS`: delay cap (default: 30000)
    /// - `SWITCHYARD_MAX_IN_FLIGHT`: concurrent handler limit (default: 64)
    /// - `SWITCHYARD_CORRELATION_SWEEP_MS`: waiter sweep interval (default: 5000)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut policy = defaults.default_policy.clone();

        if let Some(retries) = env_parse::<u32>("SWITCHYARD_MAX_RETRIES") {
            policy = policy.with_max_attempts(retries.saturating_add(1));
        }
        if let Some(base) = env_millis("SWITCHYARD_BACKOFF_BASE_MS") {
            policy = policy.with_initial_interval(base);
        }
        if let Some(cap) = env_millis("SWITCHYARD_BACKOFF_MAX_MS") {
            policy = policy.with_max_interval(cap);
        }

        Self {
            default_policy: policy,
            max_in_flight: env_parse("SWITCHYARD_MAX_IN_FLIGHT").unwrap_or(defaults.max_in_flight),
            correlation_sweep_interval: env_millis("SWITCHYARD_CORRELATION_SWEEP_MS")
                .unwrap_or(defaults.correlation_sweep_interval),
            ..defaults
        }
    }

    /// Delivery policy applied to a message type
    pub fn policy_for(&self, message_type: &str) -> &RetryPolicy {
        self.delivery_policies
            .get(message_type)
            .unwrap_or(&self.default_policy)
    }

    /// Set the default delivery policy
    pub fn with_default_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Set the delivery policy of one message type
    pub fn with_policy(mut self, message_type: impl Into<String>, policy: RetryPolicy) -> Self {
        self.delivery_policies.insert(message_type.into(), policy);
        self
    }

    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_correlation_sweep_interval(mut self, interval: Duration) -> Self {
        self.correlation_sweep_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Default keys whose values are masked in status views
pub const DEFAULT_REDACT_KEYS: &[&str] = &["password", "secret", "token", "api_key", "authorization"];

/// Workflow engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout for steps whose definition does not set one
    pub default_step_timeout: Duration,
    /// Context keys masked by `get_status`
    pub redact_keys: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            redact_keys: DEFAULT_REDACT_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SWITCHYARD_STEP_TIMEOUT_MS`: default step timeout (default: 30000)
    /// - `SWITCHYARD_REDACT_KEYS`: comma separated keys (default: password,secret,token,api_key,authorization)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let redact_keys = std::env::var("SWITCHYARD_REDACT_KEYS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or(defaults.redact_keys);

        Self {
            default_step_timeout: env_millis("SWITCHYARD_STEP_TIMEOUT_MS")
                .unwrap_or(defaults.default_step_timeout),
            redact_keys,
        }
    }

    pub fn with_redact_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.redact_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }
}

// =============================================================================
// Combined
// =============================================================================

/// Everything needed to assemble a broker and engine
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub broker: BrokerConfig,
    pub engine: EngineConfig,
    /// PostgreSQL connection string; in-memory stores are used when unset
    pub database_url: Option<String>,
}

impl OrchestratorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            broker: BrokerConfig::from_env(),
            engine: EngineConfig::from_env(),
            database_url: std::env::var("DATABASE_URL").ok(),
        }
    }

    /// Load a `.env` file (if present) and then read the environment
    pub fn from_env_file(path: impl AsRef<Path>) -> Self {
        match dotenvy::from_path(path.as_ref()) {
            Ok(()) => tracing::debug!(path = %path.as_ref().display(), "loaded env file"),
            Err(e) if e.not_found() => {}
            Err(e) => tracing::warn!(error = %e, "failed to load env file"),
        }
        Self::from_env()
    }
}
