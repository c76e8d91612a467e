//! Quiescence Detection
//!
//! Decides when a page has finished reacting to an action by polling three
//! signals through the installed probes:
//!
//! ```text
//! Start -> BusyDetection -> SteadyPoll -> Quiescent
//!                                     \-> TimedOut (only with a steady deadline)
//! ```
//!
//! `BusyDetection` gives the page a bounded chance to start doing something so
//! the wait is not declared idle before the action has even landed.
//! `SteadyPoll` then checks network, DOM and busyness in that priority order
//! and only finishes after a clean confirming sample.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::{value_as_bool, ScriptBridge};
use crate::calibration::{BusyCalibrator, ResponseThreshold};
use crate::error::{Error, Result};
use crate::instrument::{run_query, Query};
use crate::SyncConfig;

const WAIT: &str = "quiescence wait";

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    BusyDetection,
    SteadyPoll,
    Quiescent,
    TimedOut,
}

impl Phase {
    /// Whether this is a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Quiescent | Phase::TimedOut)
    }
}

/// One per-poll sample
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActivitySignal {
    pub network_pending: bool,
    pub dom_mutated: bool,
    pub busy: bool,
}

impl ActivitySignal {
    /// No signal reports activity
    pub fn is_idle(&self) -> bool {
        !(self.network_pending || self.dom_mutated || self.busy)
    }
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Quiescent,
    TimedOut,
}

/// Summary of one wait
#[derive(Debug, Clone)]
pub struct WaitReport {
    pub outcome: WaitOutcome,
    pub elapsed: Duration,
    /// Steady-poll ticks started
    pub ticks: u32,
    /// Whether the busy-detection phase saw the page react
    pub busy_detected: bool,
    /// Most recent full sample, if one was taken
    pub last_signal: Option<ActivitySignal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    loading: bool,
    network_pending: bool,
    dom_mutated: bool,
}

/// Polls probes until the page is quiet.
///
/// One detector belongs to one session; it is not meant to be shared.
#[derive(Debug)]
pub struct QuiescenceDetector {
    calibrator: BusyCalibrator,
    busy_detection: Duration,
    settle: Duration,
    steady_deadline: Option<Duration>,
    script_timeout: Duration,
    strict: bool,
    cancel: Option<CancellationToken>,
    phase: Phase,
}

impl QuiescenceDetector {
    /// Create a detector from config
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            calibrator: BusyCalibrator::new(config),
            busy_detection: Duration::from_millis(config.busy_detection_ms),
            settle: Duration::from_millis(config.settle_ms),
            steady_deadline: config.steady_deadline_ms.map(Duration::from_millis),
            script_timeout: Duration::from_millis(config.script_timeout_ms),
            strict: config.strict,
            cancel: None,
            phase: Phase::Start,
        }
    }

    /// Abort waits when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// State reached by the most recent wait
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn threshold(&self) -> ResponseThreshold {
        self.calibrator.threshold()
    }

    pub fn calibrator(&self) -> &BusyCalibrator {
        &self.calibrator
    }

    /// Recalibrate the busy threshold against the current page
    pub async fn calibrate(&mut self, bridge: &dyn ScriptBridge) -> Result<ResponseThreshold> {
        self.calibrator.calibrate(bridge).await
    }

    fn enter(&mut self, phase: Phase, start: Instant) {
        tracing::debug!("{:?} -> {:?} after {:?}", self.phase, phase, start.elapsed());
        self.phase = phase;
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => {
                Err(Error::Cancelled(WAIT.into()))
            }
            _ => Ok(()),
        }
    }

    async fn pause(&self, duration: Duration) -> Result<()> {
        cancellable(self.cancel.as_ref(), WAIT, async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    async fn query_bool(&self, bridge: &dyn ScriptBridge, query: Query) -> Result<bool> {
        let value = cancellable(
            self.cancel.as_ref(),
            WAIT,
            run_query(bridge, &query, self.script_timeout),
        )
        .await?;
        value_as_bool(query.name(), &value)
    }

    async fn network_pending(&self, bridge: &dyn ScriptBridge) -> Result<bool> {
        self.query_bool(bridge, Query::NetworkPending).await
    }

    async fn dom_mutated(&self, bridge: &dyn ScriptBridge) -> Result<bool> {
        self.query_bool(bridge, Query::DomMutated).await
    }

    async fn busy(&mut self, bridge: &dyn ScriptBridge) -> Result<bool> {
        cancellable(self.cancel.as_ref(), WAIT, self.calibrator.probe(bridge)).await
    }

    /// Full sample: page loading counts as network activity
    async fn confirm(&mut self, bridge: &dyn ScriptBridge) -> Result<ActivitySignal> {
        let value = cancellable(
            self.cancel.as_ref(),
            WAIT,
            run_query(bridge, &Query::ActivitySnapshot, self.script_timeout),
        )
        .await?;
        let snapshot: Snapshot = serde_json::from_value(value)
            .map_err(|e| Error::probe(Query::ActivitySnapshot.name(), e.to_string()))?;
        let busy = self.busy(bridge).await?;

        Ok(ActivitySignal {
            network_pending: snapshot.loading || snapshot.network_pending,
            dom_mutated: snapshot.dom_mutated,
            busy,
        })
    }

    /// Probe for busyness until it shows or the bound elapses
    async fn detect_busy_start(&mut self, bridge: &dyn ScriptBridge, start: Instant) -> Result<bool> {
        let bound = start + self.busy_detection;
        while Instant::now() < bound {
            self.check_cancelled()?;
            if self.busy(bridge).await? {
                tracing::info!("Browser activity detected after: {:?}", start.elapsed());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Wait until the page is quiescent.
    ///
    /// Probe failures end the wait with [`Error::Probe`]. Without a steady
    /// deadline this only returns once a clean confirming sample is seen.
    pub async fn wait(&mut self, bridge: &dyn ScriptBridge) -> Result<WaitReport> {
        let start = Instant::now();
        self.phase = Phase::Start;

        self.enter(Phase::BusyDetection, start);
        let busy_detected = self.detect_busy_start(bridge, start).await?;
        if !busy_detected {
            tracing::info!(
                "Could not detect the start of browser activity after: {:?}",
                start.elapsed()
            );
        }

        self.enter(Phase::SteadyPoll, start);
        let mut ticks = 0u32;
        let mut last_signal = None;

        loop {
            self.check_cancelled()?;

            if let Some(deadline) = self.steady_deadline {
                if start.elapsed() >= deadline {
                    self.enter(Phase::TimedOut, start);
                    if self.strict {
                        return Err(Error::Timeout(format!(
                            "page did not settle within {}ms",
                            deadline.as_millis()
                        )));
                    }
                    tracing::warn!(
                        "Page did not settle within {:?}, continuing anyway",
                        deadline
                    );
                    return Ok(WaitReport {
                        outcome: WaitOutcome::TimedOut,
                        elapsed: start.elapsed(),
                        ticks,
                        busy_detected,
                        last_signal,
                    });
                }
            }

            ticks += 1;

            if self.network_pending(bridge).await? {
                tracing::info!("Waiting on Network activity: {:?}", start.elapsed());
                self.pause(self.settle).await?;
                continue;
            }

            if self.dom_mutated(bridge).await? {
                tracing::info!("Waiting on DOM activity: {:?}", start.elapsed());
                self.pause(self.settle).await?;
                continue;
            }

            // The busy probe already spans a timer delay, so no settle pause
            if self.busy(bridge).await? {
                tracing::info!("Waiting on BUSY browser: {:?}", start.elapsed());
                continue;
            }

            self.pause(self.settle).await?;

            let signal = self.confirm(bridge).await?;
            last_signal = Some(signal);
            if signal.is_idle() {
                tracing::info!(
                    "No more browser activity of any kind detected: {:?}",
                    start.elapsed()
                );
                break;
            }
            tracing::info!(
                "More browser activity detected! Running sync again: {:?}",
                start.elapsed()
            );
        }

        self.enter(Phase::Quiescent, start);
        Ok(WaitReport {
            outcome: WaitOutcome::Quiescent,
            elapsed: start.elapsed(),
            ticks,
            busy_detected,
            last_signal,
        })
    }
}

/// Race `operation` against `token`; a cancelled token wins
pub(crate) async fn cancellable<T>(
    token: Option<&CancellationToken>,
    what: &str,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match token {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(Error::Cancelled(what.to_string())),
            result = operation => result,
        },
        None => operation.await,
    }
}
