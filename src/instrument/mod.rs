//! Page Instrumentation
//!
//! Installs the browser-side probes pagesync relies on and exposes them as a
//! small fixed protocol:
//! - [`Capability`]: an idempotent install script
//! - [`Query`]: a read against an installed capability
//!
//! Call sites go through [`run_query`] instead of embedding script text.

pub mod retry;
pub mod scripts;

use std::time::Duration;

use serde_json::Value;

use crate::bridge::{value_as_bool, ExecutionContext, ScriptBridge};
use crate::error::{Error, Result};
use crate::SyncConfig;

pub use retry::{RetryOutcome, RetryPolicy};

/// An installable browser-side capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Mutation counter, mutation observer, busy-timer harness
    Probes,
    /// XHR/fetch interception with in-flight count and call log
    NetworkMonitor,
    /// XPath lookup and event recorder (carries the context marker)
    DomUtils,
}

impl Capability {
    /// Script that installs this capability
    pub fn install_script(self) -> &'static str {
        match self {
            Capability::Probes => scripts::QUIESCENCE_PROBES,
            Capability::NetworkMonitor => scripts::NETWORK_MONITOR,
            Capability::DomUtils => scripts::DOM_UTILS,
        }
    }

    /// Name used in logs and errors
    pub fn name(self) -> &'static str {
        match self {
            Capability::Probes => "quiescence probes",
            Capability::NetworkMonitor => "network monitor",
            Capability::DomUtils => "dom utils",
        }
    }
}

/// A read against installed capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Is the context marker installed
    MarkerPresent,
    /// In-flight request count > 0
    NetworkPending,
    /// Mutation count changed since the previous check (resets the baseline)
    DomMutated,
    /// Latency of a timer scheduled `delay_ms` ahead, in ms (async)
    BusyLatency { delay_ms: u64 },
    /// `{loading, networkPending, domMutated}` in one round trip
    ActivitySnapshot,
    /// `document.readyState`
    ReadyState,
    /// Number of captured network calls
    CallLogLength,
    /// One captured call tuple
    CallAt(usize),
    /// Whether an XPath expression matches a node
    XPathExists(String),
    /// Number of recorded user events
    RecordedEventCount,
}

impl Query {
    /// Script text for this query
    pub fn script(&self) -> String {
        match self {
            Query::MarkerPresent => scripts::MARKER_PRESENT.to_string(),
            Query::NetworkPending => scripts::NETWORK_PENDING.to_string(),
            Query::DomMutated => scripts::DOM_MUTATED.to_string(),
            Query::BusyLatency { delay_ms } => scripts::busy_latency(*delay_ms),
            Query::ActivitySnapshot => scripts::ACTIVITY_SNAPSHOT.to_string(),
            Query::ReadyState => scripts::READY_STATE.to_string(),
            Query::CallLogLength => scripts::CALL_LOG_LENGTH.to_string(),
            Query::CallAt(index) => scripts::call_at(*index),
            Query::XPathExists(expression) => scripts::xpath_exists(expression),
            Query::RecordedEventCount => scripts::RECORDED_EVENT_COUNT.to_string(),
        }
    }

    /// Whether the script completes through a callback
    pub fn is_async(&self) -> bool {
        matches!(self, Query::BusyLatency { .. })
    }

    /// Probe name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Query::MarkerPresent => "marker",
            Query::NetworkPending => "network",
            Query::DomMutated => "dom",
            Query::BusyLatency { .. } => "busy",
            Query::ActivitySnapshot => "snapshot",
            Query::ReadyState => "ready-state",
            Query::CallLogLength => "call-log-length",
            Query::CallAt(_) => "call-at",
            Query::XPathExists(_) => "xpath",
            Query::RecordedEventCount => "event-count",
        }
    }
}

/// Run a query, mapping any bridge failure to [`Error::Probe`]
pub async fn run_query(
    bridge: &dyn ScriptBridge,
    query: &Query,
    async_timeout: Duration,
) -> Result<Value> {
    let script = query.script();
    let result = if query.is_async() {
        bridge.run_script_async(&script, async_timeout).await
    } else {
        bridge.run_script(&script).await
    };

    result.map_err(|e| match e {
        Error::Probe { .. } => e,
        other => Error::probe(query.name(), other.to_string()),
    })
}

/// Result of [`Instrumentation::ensure_injected`]
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "injection may have been abandoned"]
pub enum InjectionStatus {
    /// Scripts were installed on this call
    Injected { attempts: u32 },
    /// The marker was already there; nothing was installed
    AlreadyPresent,
    /// Every attempt failed; the context is left uninstrumented
    Abandoned { failures: Vec<String> },
}

impl InjectionStatus {
    /// True unless injection was abandoned
    pub fn is_instrumented(&self) -> bool {
        !matches!(self, InjectionStatus::Abandoned { .. })
    }
}

enum Attempt {
    Installed,
    Present,
}

/// Installs capabilities into execution contexts
#[derive(Debug, Clone)]
pub struct Instrumentation {
    policy: RetryPolicy,
    network_monitor: bool,
    strict: bool,
}

impl Instrumentation {
    /// Create an injector from config
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            policy: config.injection_policy(),
            network_monitor: config.network_monitor,
            strict: config.strict,
        }
    }

    /// The retry policy used for injection
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Ask the browser whether the current context carries the marker
    pub async fn is_present(&self, bridge: &dyn ScriptBridge) -> Result<bool> {
        let value = bridge.run_script(scripts::MARKER_PRESENT).await?;
        value_as_bool(Query::MarkerPresent.name(), &value)
    }

    /// Install a single capability
    pub async fn ensure_capability(
        &self,
        bridge: &dyn ScriptBridge,
        capability: Capability,
    ) -> Result<()> {
        bridge
            .run_script(capability.install_script())
            .await
            .map_err(|e| Error::injection(capability.name(), e.to_string()))?;
        tracing::debug!("Installed {}", capability.name());
        Ok(())
    }

    /// Capabilities in install order; the marker-bearing one goes last
    fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Probes];
        if self.network_monitor {
            caps.push(Capability::NetworkMonitor);
        }
        caps.push(Capability::DomUtils);
        caps
    }

    async fn attempt(&self, bridge: &dyn ScriptBridge) -> Result<Attempt> {
        if self.is_present(bridge).await? {
            return Ok(Attempt::Present);
        }
        for capability in self.capabilities() {
            self.ensure_capability(bridge, capability).await?;
        }
        Ok(Attempt::Installed)
    }

    /// Make sure `context` is instrumented.
    ///
    /// Retries per the policy. After the last failure the context is left
    /// uninstrumented and `Abandoned` is returned; strict mode turns that
    /// into [`Error::RetryExhausted`].
    pub async fn ensure_injected(
        &self,
        bridge: &dyn ScriptBridge,
        context: &ExecutionContext,
    ) -> Result<InjectionStatus> {
        let label = format!("Inserting sync scripts into '{}'", context.label());
        let outcome = self.policy.run(&label, |_| self.attempt(bridge)).await;

        let status = match outcome.value {
            Some(Attempt::Installed) => {
                tracing::info!("Javascript context loaded for '{}'", context.label());
                InjectionStatus::Injected {
                    attempts: outcome.attempts,
                }
            }
            Some(Attempt::Present) => {
                tracing::debug!("Javascript context already present in '{}'", context.label());
                InjectionStatus::AlreadyPresent
            }
            None => {
                if self.strict {
                    return Err(Error::RetryExhausted {
                        attempts: outcome.attempts,
                        last_error: outcome.failures.last().cloned().unwrap_or_default(),
                    });
                }
                InjectionStatus::Abandoned {
                    failures: outcome.failures,
                }
            }
        };

        Ok(status)
    }
}
