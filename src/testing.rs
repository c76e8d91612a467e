//! Scripted in-memory bridge for unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::ScriptBridge;
use crate::error::{Error, Result};
use crate::instrument::{scripts, Capability};

const BUSY_DELAY_MS: u64 = 200;

#[derive(Default)]
struct State {
    marker: bool,
    installed: Vec<Capability>,
    injections: u32,
    install_failures: u32,
    fail_probes: bool,
    always_mutating: bool,
    network: VecDeque<bool>,
    dom: VecDeque<bool>,
    latencies: VecDeque<f64>,
    snapshot_queue: VecDeque<(bool, bool, bool)>,
    ready_states: VecDeque<&'static str>,
    network_probes: u32,
    busy_probes: u32,
    snapshots: u32,
    screenshots: u32,
    frame: Option<String>,
}

/// Answers probe scripts from queues; empty queues mean "quiet page"
#[derive(Default)]
pub struct FakePage {
    state: Mutex<State>,
}

impl FakePage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_installs(&self, count: u32) {
        self.state.lock().install_failures = count;
    }

    pub fn fail_probes(&self, fail: bool) {
        self.state.lock().fail_probes = fail;
    }

    pub fn always_mutating(&self, on: bool) {
        self.state.lock().always_mutating = on;
    }

    pub fn push_network(&self, values: impl IntoIterator<Item = bool>) {
        self.state.lock().network.extend(values);
    }

    pub fn push_dom(&self, values: impl IntoIterator<Item = bool>) {
        self.state.lock().dom.extend(values);
    }

    pub fn push_latencies(&self, values: impl IntoIterator<Item = f64>) {
        self.state.lock().latencies.extend(values);
    }

    /// `(loading, network_pending, dom_mutated)` answers for confirming samples
    pub fn push_snapshots(&self, values: impl IntoIterator<Item = (bool, bool, bool)>) {
        self.state.lock().snapshot_queue.extend(values);
    }

    pub fn push_ready_states(&self, values: impl IntoIterator<Item = &'static str>) {
        self.state.lock().ready_states.extend(values);
    }

    /// Simulate navigation: the document is replaced and loses its globals
    pub fn navigate(&self) {
        let mut state = self.state.lock();
        state.marker = false;
        state.installed.clear();
    }

    pub fn marker_present(&self) -> bool {
        self.state.lock().marker
    }

    pub fn installed(&self) -> Vec<Capability> {
        self.state.lock().installed.clone()
    }

    pub fn injections(&self) -> u32 {
        self.state.lock().injections
    }

    pub fn network_probes(&self) -> u32 {
        self.state.lock().network_probes
    }

    pub fn busy_probes(&self) -> u32 {
        self.state.lock().busy_probes
    }

    pub fn snapshots(&self) -> u32 {
        self.state.lock().snapshots
    }

    pub fn screenshots(&self) -> u32 {
        self.state.lock().screenshots
    }

    pub fn frame(&self) -> Option<String> {
        self.state.lock().frame.clone()
    }

    fn install(&self, capability: Capability) -> Result<Value> {
        let mut state = self.state.lock();
        if state.install_failures > 0 {
            state.install_failures -= 1;
            return Err(Error::Script(format!(
                "javascript error: cannot install {}",
                capability.name()
            )));
        }
        state.installed.push(capability);
        if capability == Capability::DomUtils {
            state.marker = true;
            state.injections += 1;
        }
        Ok(Value::Null)
    }
}

#[async_trait]
impl ScriptBridge for FakePage {
    async fn run_script(&self, script: &str) -> Result<Value> {
        for capability in [
            Capability::Probes,
            Capability::NetworkMonitor,
            Capability::DomUtils,
        ] {
            if script == capability.install_script() {
                return self.install(capability);
            }
        }

        let mut state = self.state.lock();
        if script == scripts::MARKER_PRESENT {
            return Ok(json!(state.marker));
        }
        if script == scripts::READY_STATE {
            let ready = state.ready_states.pop_front().unwrap_or("complete");
            return Ok(json!(ready));
        }
        if state.fail_probes {
            return Err(Error::Script(
                "javascript error: window.isCallingAjax is not a function".into(),
            ));
        }
        if script == scripts::NETWORK_PENDING {
            state.network_probes += 1;
            return Ok(json!(state.network.pop_front().unwrap_or(false)));
        }
        if script == scripts::DOM_MUTATED {
            let mutated = state.dom.pop_front().unwrap_or(state.always_mutating);
            return Ok(json!(mutated));
        }
        if script == scripts::ACTIVITY_SNAPSHOT {
            state.snapshots += 1;
            let (loading, network, dom) = state.snapshot_queue.pop_front().unwrap_or((
                false,
                false,
                state.always_mutating,
            ));
            return Ok(json!({
                "loading": loading,
                "networkPending": network,
                "domMutated": dom,
            }));
        }
        Err(Error::Script(format!("unexpected script: {}", script)))
    }

    async fn run_script_async(&self, script: &str, _timeout: Duration) -> Result<Value> {
        if script != scripts::busy_latency(BUSY_DELAY_MS) {
            return Err(Error::Script(format!("unexpected async script: {}", script)));
        }
        let latency = {
            let mut state = self.state.lock();
            if state.fail_probes {
                return Err(Error::Script("javascript error: script timeout".into()));
            }
            state.busy_probes += 1;
            state.latencies.pop_front().unwrap_or(BUSY_DELAY_MS as f64)
        };
        tokio::time::sleep(Duration::from_millis(latency as u64)).await;
        Ok(json!(latency))
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        self.state.lock().screenshots += 1;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn switch_to_frame(&self, frame: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        if frame == Some("missing") {
            return Err(Error::FrameNotFound("missing".into()));
        }
        state.frame = frame.map(String::from);
        // A different document: its globals are its own
        state.marker = false;
        Ok(())
    }
}

/// Counts WARN events
#[derive(Clone, Default)]
pub struct WarnCounter(Arc<AtomicUsize>);

impl WarnCounter {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}
