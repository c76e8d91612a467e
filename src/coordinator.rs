//! Action Coordination
//!
//! Wraps one scripted step with diagnostic hooks and the synchronisation it
//! needs:
//!
//! ```text
//! before -> action -> after_pre_sync -> sync -> after_post_sync -> (re-instrument)
//! ```
//!
//! Hooks never gate the sequence; a failed expectation is logged and recorded
//! in the [`ActionReport`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::{value_as_bool, ExecutionContext, ScriptBridge};
use crate::calibration::ResponseThreshold;
use crate::error::{Error, Result};
use crate::instrument::{run_query, InjectionStatus, Instrumentation, Query};
use crate::network::NetworkLog;
use crate::quiescence::{cancellable, QuiescenceDetector, WaitOutcome};
use crate::screenshot::ScreenshotSink;
use crate::SyncConfig;

const PAGE_LOAD: &str = "page load wait";

/// How to wait after an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Poll `document.readyState` until complete
    PageLoad,
    /// Wait for network, DOM and timer quiescence
    Ajax,
    #[default]
    None,
}

/// Outcome of one hook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub ok: bool,
    pub message: String,
}

impl HookResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Where in the sequence a hook ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Before,
    AfterPreSync,
    AfterPostSync,
}

impl HookStage {
    fn label(self) -> &'static str {
        match self {
            HookStage::Before => "BEFORE",
            HookStage::AfterPreSync => "AFTER_BEFORE_SYNC",
            HookStage::AfterPostSync => "AFTER",
        }
    }
}

/// The step being performed
#[async_trait]
pub trait BrowserAction: Send + Sync {
    async fn perform(&self, bridge: &dyn ScriptBridge) -> Result<()>;
}

/// A diagnostic check around the step
#[async_trait]
pub trait Expectation: Send + Sync {
    async fn check(&self, bridge: &dyn ScriptBridge) -> HookResult;
}

/// Does nothing; used for context reloads
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAction;

#[async_trait]
impl BrowserAction for NoAction {
    async fn perform(&self, _bridge: &dyn ScriptBridge) -> Result<()> {
        Ok(())
    }
}

/// Runs a script as the action
#[derive(Debug, Clone)]
pub struct ScriptAction {
    pub script: String,
}

impl ScriptAction {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait]
impl BrowserAction for ScriptAction {
    async fn perform(&self, bridge: &dyn ScriptBridge) -> Result<()> {
        bridge.run_script(&self.script).await?;
        Ok(())
    }
}

/// Passes when a script returns `true`
#[derive(Debug, Clone)]
pub struct ScriptExpectation {
    pub script: String,
    pub description: String,
}

impl ScriptExpectation {
    pub fn new(script: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            description: description.into(),
        }
    }
}

#[async_trait]
impl Expectation for ScriptExpectation {
    async fn check(&self, bridge: &dyn ScriptBridge) -> HookResult {
        match bridge.run_script(&self.script).await {
            Ok(value) => match value_as_bool("expectation", &value) {
                Ok(true) => HookResult::pass(self.description.clone()),
                Ok(false) => HookResult::fail(self.description.clone()),
                Err(e) => HookResult::fail(format!("{}: {}", self.description, e)),
            },
            Err(e) => HookResult::fail(format!("{}: {}", self.description, e)),
        }
    }
}

/// Optional hooks around a step
#[derive(Default)]
pub struct ActionHooks {
    pub before: Option<Box<dyn Expectation>>,
    pub after_pre_sync: Option<Box<dyn Expectation>>,
    pub after_post_sync: Option<Box<dyn Expectation>>,
}

impl ActionHooks {
    pub fn before(mut self, hook: impl Expectation + 'static) -> Self {
        self.before = Some(Box::new(hook));
        self
    }

    pub fn after_pre_sync(mut self, hook: impl Expectation + 'static) -> Self {
        self.after_pre_sync = Some(Box::new(hook));
        self
    }

    pub fn after_post_sync(mut self, hook: impl Expectation + 'static) -> Self {
        self.after_post_sync = Some(Box::new(hook));
        self
    }
}

/// One step to perform
pub struct ActionStep<'a> {
    pub action: &'a dyn BrowserAction,
    pub description: String,
    pub hooks: ActionHooks,
    pub sync: SyncMode,
    /// The step may have moved into a new document/frame
    pub context_may_change: bool,
}

impl<'a> ActionStep<'a> {
    pub fn new(action: &'a dyn BrowserAction, description: impl Into<String>) -> Self {
        Self {
            action,
            description: description.into(),
            hooks: ActionHooks::default(),
            sync: SyncMode::None,
            context_may_change: false,
        }
    }

    pub fn hooks(mut self, hooks: ActionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    pub fn context_may_change(mut self, yes: bool) -> Self {
        self.context_may_change = yes;
        self
    }
}

/// How synchronisation went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub outcome: WaitOutcome,
    pub elapsed: Duration,
}

/// Everything that happened during one step
#[derive(Debug, Clone)]
pub struct ActionReport {
    pub description: String,
    pub hooks: Vec<(HookStage, HookResult)>,
    pub sync: Option<SyncReport>,
    pub injection: Option<InjectionStatus>,
}

impl ActionReport {
    /// True if every hook passed
    pub fn expectations_met(&self) -> bool {
        self.hooks.iter().all(|(_, r)| r.ok)
    }
}

/// Drives steps against one browser session
pub struct ActionCoordinator {
    bridge: Arc<dyn ScriptBridge>,
    detector: QuiescenceDetector,
    injector: Instrumentation,
    shots: Arc<dyn ScreenshotSink>,
    context: ExecutionContext,
    config: SyncConfig,
    cancel: Option<CancellationToken>,
}

impl ActionCoordinator {
    pub fn new(
        bridge: Arc<dyn ScriptBridge>,
        shots: Arc<dyn ScreenshotSink>,
        config: SyncConfig,
    ) -> Self {
        Self {
            bridge,
            detector: QuiescenceDetector::new(&config),
            injector: Instrumentation::new(&config),
            shots,
            context: ExecutionContext::top(),
            config,
            cancel: None,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.detector = self.detector.with_cancellation(token.clone());
        self.cancel = Some(token);
        self
    }

    pub fn bridge(&self) -> &dyn ScriptBridge {
        self.bridge.as_ref()
    }

    pub fn detector(&self) -> &QuiescenceDetector {
        &self.detector
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Context the coordinator last switched to
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Call log of the in-page network monitor
    pub fn network(&self) -> NetworkLog<'_> {
        NetworkLog::new(
            self.bridge.as_ref(),
            Duration::from_millis(self.config.script_timeout_ms),
        )
    }

    /// Recalibrate the busy threshold. Never run implicitly.
    pub async fn calibrate(&mut self) -> Result<ResponseThreshold> {
        let status = self
            .injector
            .ensure_injected(self.bridge.as_ref(), &self.context)
            .await?;
        if let InjectionStatus::Abandoned { failures } = &status {
            tracing::warn!(
                "Calibrating '{}' without sync scripts ({} failed injections)",
                self.context.label(),
                failures.len()
            );
        }
        self.detector.calibrate(self.bridge.as_ref()).await
    }

    /// Instrument the current context if it is not already
    pub async fn load_context(&self) -> Result<InjectionStatus> {
        self.injector
            .ensure_injected(self.bridge.as_ref(), &self.context)
            .await
    }

    /// Whether an XPath expression matches in the current context
    pub async fn xpath_exists(&self, expression: &str) -> Result<bool> {
        let query = Query::XPathExists(expression.to_string());
        let value = run_query(self.bridge.as_ref(), &query, self.script_timeout()).await?;
        value_as_bool(query.name(), &value)
    }

    /// Number of user events recorded in the current context
    pub async fn recorded_events(&self) -> Result<u64> {
        let query = Query::RecordedEventCount;
        let value = run_query(self.bridge.as_ref(), &query, self.script_timeout()).await?;
        value
            .as_u64()
            .ok_or_else(|| Error::probe(query.name(), format!("expected count, got {}", value)))
    }

    fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.config.script_timeout_ms)
    }

    async fn run_hook(
        &self,
        stage: HookStage,
        hook: &Option<Box<dyn Expectation>>,
        report: &mut ActionReport,
    ) {
        let Some(hook) = hook else {
            return;
        };
        let result = hook.check(self.bridge.as_ref()).await;
        if result.ok {
            tracing::info!("{} function returned PASS: {}", stage.label(), result.message);
        } else {
            tracing::error!("{} function returned FAIL: {}", stage.label(), result.message);
        }
        report.hooks.push((stage, result));
    }

    /// Perform one step.
    ///
    /// Errors come from the action itself, from probe failures during Ajax
    /// sync, and from soft timeouts when `strict` is set.
    pub async fn perform(&mut self, step: ActionStep<'_>) -> Result<ActionReport> {
        tracing::info!("ACTION: {}", step.description);
        let mut report = ActionReport {
            description: step.description.clone(),
            hooks: Vec::new(),
            sync: None,
            injection: None,
        };

        self.run_hook(HookStage::Before, &step.hooks.before, &mut report)
            .await;

        step.action
            .perform(self.bridge.as_ref())
            .await
            .map_err(|e| Error::action(&step.description, e.to_string()))?;

        self.run_hook(
            HookStage::AfterPreSync,
            &step.hooks.after_pre_sync,
            &mut report,
        )
        .await;

        report.sync = match step.sync {
            SyncMode::PageLoad => Some(self.wait_for_page_load(&step.description).await?),
            SyncMode::Ajax => Some(self.wait_for_ajax(&step.description).await?),
            SyncMode::None => None,
        };

        self.run_hook(
            HookStage::AfterPostSync,
            &step.hooks.after_post_sync,
            &mut report,
        )
        .await;

        if step.context_may_change {
            let status = self.load_context().await?;
            if self.config.sync_after_injection
                && matches!(status, InjectionStatus::Injected { .. })
            {
                tracing::info!(
                    "Waiting for '{}' to settle after loading the javascript context",
                    self.context.label()
                );
                self.detector.wait(self.bridge.as_ref()).await?;
            }
            report.injection = Some(status);
        }

        Ok(report)
    }

    /// Poll `document.readyState` until complete or the soft bound elapses
    pub async fn wait_for_page_load(&self, description: &str) -> Result<SyncReport> {
        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.page_load_timeout_ms);
        let poll_interval = Duration::from_millis(self.config.page_load_poll_ms);

        loop {
            let ready = cancellable(
                self.cancel.as_ref(),
                PAGE_LOAD,
                run_query(self.bridge.as_ref(), &Query::ReadyState, self.script_timeout()),
            )
            .await;
            match ready {
                Ok(value) if value.as_str() == Some("complete") => {
                    tracing::info!("Page load after: {:?}", start.elapsed());
                    self.add_screenshot(&format!("{} Page load completed", description))
                        .await;
                    return Ok(SyncReport {
                        mode: SyncMode::PageLoad,
                        outcome: WaitOutcome::Quiescent,
                        elapsed: start.elapsed(),
                    });
                }
                Ok(_) => tracing::debug!("Page loading..."),
                // Navigation replaces the context; keep waiting
                Err(e) if e.is_context_lost() => tracing::debug!("Page context changed: {}", e),
                Err(e) => return Err(e),
            }

            if start.elapsed() >= timeout {
                if self.config.strict {
                    return Err(Error::Timeout(format!(
                        "page load did not complete within {}ms",
                        timeout.as_millis()
                    )));
                }
                tracing::warn!(
                    "Page load did not complete within {:?}, continuing anyway",
                    timeout
                );
                return Ok(SyncReport {
                    mode: SyncMode::PageLoad,
                    outcome: WaitOutcome::TimedOut,
                    elapsed: start.elapsed(),
                });
            }

            cancellable(self.cancel.as_ref(), PAGE_LOAD, async {
                tokio::time::sleep(poll_interval).await;
                Ok(())
            })
            .await?;
        }
    }

    /// Wait for quiescence and take a screenshot once reached
    pub async fn wait_for_ajax(&mut self, description: &str) -> Result<SyncReport> {
        let report = self.detector.wait(self.bridge.as_ref()).await?;
        if report.outcome == WaitOutcome::Quiescent {
            self.add_screenshot(&format!("{} Browser sync completed", description))
                .await;
        }
        Ok(SyncReport {
            mode: SyncMode::Ajax,
            outcome: report.outcome,
            elapsed: report.elapsed,
        })
    }

    /// Capture and hand a screenshot to the sink; failures are only logged
    pub async fn add_screenshot(&self, description: &str) {
        match self.bridge.capture_screenshot().await {
            Ok(image) => self.shots.add_shot(image, description),
            Err(e) => tracing::warn!("Screenshot '{}' failed: {}", description, e),
        }
    }

    /// Scope to a frame (`None` = top document) and re-instrument if needed
    pub async fn set_frame(&mut self, frame: Option<&str>) -> Result<Option<InjectionStatus>> {
        self.bridge.switch_to_frame(None).await?;
        if let Some(name) = frame {
            self.bridge.switch_to_frame(Some(name)).await?;
        }
        self.context = ExecutionContext {
            frame: frame.map(String::from),
        };

        if self.injector.is_present(self.bridge.as_ref()).await? {
            return Ok(None);
        }

        tracing::info!(
            "Reloading javascript context for frame '{}'",
            self.context.label()
        );
        let step = ActionStep::new(&NoAction, "Ajax reload after Frame change")
            .context_may_change(true);
        let report = self.perform(step).await?;
        Ok(report.injection)
    }
}
