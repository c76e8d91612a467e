//! Busy Calibration
//!
//! Measures how late a timer callback fires on a quiet page and derives the
//! threshold above which the browser counts as busy.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::{value_as_f64, ScriptBridge};
use crate::error::Result;
use crate::instrument::{run_query, Query};
use crate::SyncConfig;

/// Number of samples the moving average covers
pub const WINDOW_CAPACITY: usize = 10;

/// Fixed-capacity ring of latency samples (ms); the oldest is evicted first
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
}

impl LatencyWindow {
    /// Create an empty window
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// Add a sample, evicting the oldest once full
    pub fn push(&mut self, sample_ms: f64) {
        if self.samples.len() == WINDOW_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Mean of the retained samples, `None` when empty
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Samples, oldest first
    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

/// Busy-detection threshold in milliseconds. Always > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResponseThreshold(u64);

impl ResponseThreshold {
    /// Threshold used before the first calibration
    pub const DEFAULT_MS: u64 = 220;

    /// Create a threshold; `None` for zero
    pub fn new(ms: u64) -> Option<Self> {
        (ms > 0).then_some(Self(ms))
    }

    /// `round(mean * 1.1)`; `None` if that rounds to zero or the mean is not finite
    pub fn from_mean(mean_ms: f64) -> Option<Self> {
        let scaled = (mean_ms * 1.1).round();
        if !scaled.is_finite() || scaled < 1.0 {
            return None;
        }
        Self::new(scaled as u64)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl Default for ResponseThreshold {
    fn default() -> Self {
        Self(Self::DEFAULT_MS)
    }
}

/// Owns the latency window and threshold for one session.
///
/// Busy-probe samples share the window with calibration samples, so a single
/// slow callback raises the moving average without flipping it outright.
#[derive(Debug, Clone)]
pub struct BusyCalibrator {
    window: LatencyWindow,
    threshold: ResponseThreshold,
    base_delay_ms: u64,
    rounds: u32,
    script_timeout: Duration,
}

impl BusyCalibrator {
    /// Create a calibrator from config
    pub fn new(config: &SyncConfig) -> Self {
        let threshold = ResponseThreshold::new(config.initial_threshold_ms).unwrap_or_default();
        tracing::info!(
            "Using a BUSY timeout of {}ms and a BUSY response timeout of {}ms",
            config.busy_base_delay_ms,
            threshold.as_millis()
        );
        Self {
            window: LatencyWindow::new(),
            threshold,
            base_delay_ms: config.busy_base_delay_ms,
            rounds: config.calibration_rounds,
            script_timeout: Duration::from_millis(config.script_timeout_ms),
        }
    }

    /// Current threshold
    pub fn threshold(&self) -> ResponseThreshold {
        self.threshold
    }

    /// Retained samples
    pub fn window(&self) -> &LatencyWindow {
        &self.window
    }

    /// Record a latency sample and report whether the moving average is over threshold
    pub fn record(&mut self, latency_ms: f64) -> bool {
        self.window.push(latency_ms);
        self.is_busy()
    }

    /// Whether the moving average is over threshold
    pub fn is_busy(&self) -> bool {
        self.window
            .mean()
            .is_some_and(|mean| mean > self.threshold.as_millis() as f64)
    }

    /// Schedule one deferred callback and return how long it took to fire
    pub async fn measure(&self, bridge: &dyn ScriptBridge) -> Result<f64> {
        let query = Query::BusyLatency {
            delay_ms: self.base_delay_ms,
        };
        let value = run_query(bridge, &query, self.script_timeout).await?;
        value_as_f64(query.name(), &value)
    }

    /// Measure once, record the sample, and report busyness
    pub async fn probe(&mut self, bridge: &dyn ScriptBridge) -> Result<bool> {
        let latency = self.measure(bridge).await?;
        Ok(self.record(latency))
    }

    /// Run the calibration rounds and recompute the threshold.
    ///
    /// Only samples taken by this run count; they replace the window once
    /// at least one was recorded. With none, window and threshold are kept.
    pub async fn calibrate(&mut self, bridge: &dyn ScriptBridge) -> Result<ResponseThreshold> {
        tracing::info!("Calibrating BUSY response timeout...");

        let mut window = LatencyWindow::new();
        for _ in 0..self.rounds {
            window.push(self.measure(bridge).await?);
        }

        match window.mean() {
            Some(mean) => {
                tracing::info!("Calibration value retrieved from web browser: {:.2}", mean);
                if let Some(threshold) = ResponseThreshold::from_mean(mean) {
                    self.threshold = threshold;
                }
                self.window = window;
            }
            None => tracing::warn!("No calibration samples recorded, keeping previous threshold"),
        }

        tracing::info!(
            "Using a BUSY response timeout (in milliseconds) + 10% of: {}",
            self.threshold.as_millis()
        );
        Ok(self.threshold)
    }
}
