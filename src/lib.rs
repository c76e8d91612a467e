//! # pagesync
//!
//! Knowing when a page has finished reacting to a scripted step.
//!
//! pagesync installs a few probes into the page (mutation counter, XHR/fetch
//! shim, timer harness) and polls them until network, DOM and main thread
//! have all gone quiet. The busy threshold calibrates itself against the
//! page's own timer latency.
//!
//! ## Features
//!
//! - **Multi-signal** - in-flight requests, DOM mutations, timer busyness
//! - **Self-calibrating** - moving-average threshold per session
//! - **Idempotent instrumentation** - probes installed once per document/frame
//! - **Degrades gracefully** - soft timeouts by default, `strict` to escalate
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagesync::{ActionCoordinator, ActionStep, ScreenshotManager, ScriptAction, ScriptBridge, SyncConfig, SyncMode};
//!
//! # async fn example(bridge: Arc<dyn ScriptBridge>) -> pagesync::Result<()> {
//! let shots = Arc::new(ScreenshotManager::new("staging"));
//! let mut coordinator = ActionCoordinator::new(bridge, shots.clone(), SyncConfig::default());
//!
//! let _ = coordinator.load_context().await?;
//! coordinator.calibrate().await?;
//!
//! let search = ScriptAction::new("document.querySelector('#search').click();");
//! coordinator
//!     .perform(ActionStep::new(&search, "Search").sync(SyncMode::Ajax))
//!     .await?;
//!
//! shots.write_all(std::path::Path::new("screenshots"))?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod calibration;
pub mod coordinator;
pub mod error;
pub mod instrument;
pub mod network;
pub mod quiescence;
pub mod screenshot;

#[cfg(test)]
pub(crate) mod testing;

use std::path::Path;

use serde::{Deserialize, Serialize};

// Re-exports
pub use bridge::{ExecutionContext, ScriptBridge};
pub use calibration::{BusyCalibrator, LatencyWindow, ResponseThreshold};
pub use coordinator::{
    ActionCoordinator, ActionHooks, ActionReport, ActionStep, BrowserAction, Expectation,
    HookResult, HookStage, NoAction, ScriptAction, ScriptExpectation, SyncMode, SyncReport,
};
pub use error::{Error, Result};
pub use instrument::{Capability, InjectionStatus, Instrumentation, Query, RetryOutcome, RetryPolicy};
pub use network::{ApiField, CapturedCall, NetworkLog};
pub use quiescence::{ActivitySignal, Phase, QuiescenceDetector, WaitOutcome, WaitReport};
pub use screenshot::{DiscardShots, ScreenshotManager, ScreenshotSink};

/// Timing and failure-handling knobs, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delay the busy probe schedules its timer at
    pub busy_base_delay_ms: u64,
    /// Busy threshold before the first calibration
    pub initial_threshold_ms: u64,
    /// Rounds per calibration
    pub calibration_rounds: u32,
    /// Bound on waiting for the page to start reacting
    pub busy_detection_ms: u64,
    /// Pause after seeing network or DOM activity, and before confirming
    pub settle_ms: u64,
    /// Outer bound on steady polling (None = poll until quiet)
    pub steady_deadline_ms: Option<u64>,
    /// Soft bound on page-load waits
    pub page_load_timeout_ms: u64,
    /// `document.readyState` poll interval
    pub page_load_poll_ms: u64,
    /// Injection attempts per context
    pub injection_attempts: u32,
    /// Pause between injection attempts
    pub injection_backoff_ms: u64,
    /// Timeout handed to asynchronous scripts
    pub script_timeout_ms: u64,
    /// Install the XHR/fetch shim
    pub network_monitor: bool,
    /// Escalate soft timeouts and abandoned injection to errors
    pub strict: bool,
    /// Wait for quiescence right after scripts are freshly installed
    pub sync_after_injection: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            busy_base_delay_ms: 200,
            initial_threshold_ms: ResponseThreshold::DEFAULT_MS,
            calibration_rounds: 30,
            busy_detection_ms: 800,
            settle_ms: 300,
            steady_deadline_ms: None,
            page_load_timeout_ms: 30_000,
            page_load_poll_ms: 50,
            injection_attempts: 3,
            injection_backoff_ms: 1000,
            script_timeout_ms: 5_000,
            network_monitor: true,
            strict: false,
            sync_after_injection: false,
        }
    }
}

impl SyncConfig {
    /// Fail instead of proceeding when a bound is hit
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Default::default()
        }
    }

    /// Slow environments: longer bounds and a steady-poll deadline
    pub fn patient() -> Self {
        Self {
            busy_detection_ms: 2_000,
            settle_ms: 500,
            steady_deadline_ms: Some(120_000),
            page_load_timeout_ms: 60_000,
            script_timeout_ms: 15_000,
            ..Default::default()
        }
    }

    pub fn with_steady_deadline(mut self, ms: u64) -> Self {
        self.steady_deadline_ms = Some(ms);
        self
    }

    pub fn with_page_load_timeout(mut self, ms: u64) -> Self {
        self.page_load_timeout_ms = ms;
        self
    }

    pub fn with_injection_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.injection_attempts = attempts;
        self.injection_backoff_ms = backoff_ms;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Retry policy for instrumentation
    pub fn injection_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.injection_attempts, self.injection_backoff_ms)
    }

    /// Save config to JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}
