//! A simulated page driven by tokio's clock.
//!
//! Activity is described as timelines (ms since the page was created):
//! requests in flight, DOM mutations, main-thread busy spans.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use pagesync::instrument::scripts;
use pagesync::{Capability, Error, Result, ScriptBridge};
use serde_json::{json, Value};
use tokio::time::Instant;

const TIMER_JITTER_MS: u64 = 3;

#[derive(Default)]
struct Document {
    installed: Vec<Capability>,
    marker: bool,
    prev_mutations: usize,
    calls: Vec<Value>,
}

struct State {
    documents: HashMap<Option<String>, Document>,
    requests: Vec<(u64, u64)>,
    mutations: Vec<u64>,
    busy: Vec<(u64, u64)>,
    load_complete_at: u64,
    install_failures: u32,
    injections: u32,
    frame: Option<String>,
}

pub struct SimulatedPage {
    epoch: Instant,
    state: parking_lot::Mutex<State>,
}

impl SimulatedPage {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: parking_lot::Mutex::new(State {
                documents: HashMap::new(),
                requests: Vec::new(),
                mutations: Vec::new(),
                busy: Vec::new(),
                load_complete_at: 0,
                install_failures: 0,
                injections: 0,
                frame: None,
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// A request in flight between `from` and `to`
    pub fn request(&self, from: u64, to: u64) -> &Self {
        self.state.lock().requests.push((from, to));
        self
    }

    /// One mutation every `every` ms in `[from, to)`
    pub fn mutations(&self, from: u64, to: u64, every: u64) -> &Self {
        let mut state = self.state.lock();
        let mut t = from;
        while t < to {
            state.mutations.push(t);
            t += every;
        }
        drop(state);
        self
    }

    /// Main thread blocked between `from` and `to`
    pub fn busy(&self, from: u64, to: u64) -> &Self {
        self.state.lock().busy.push((from, to));
        self
    }

    pub fn loads_until(&self, at: u64) -> &Self {
        self.state.lock().load_complete_at = at;
        self
    }

    pub fn fail_installs(&self, count: u32) {
        self.state.lock().install_failures = count;
    }

    pub fn record_call(&self, call: Value) {
        Self::document(&mut self.state.lock()).calls.push(call);
    }

    pub fn injections(&self) -> u32 {
        self.state.lock().injections
    }

    pub fn marker_present(&self) -> bool {
        Self::document(&mut self.state.lock()).marker
    }

    /// Replace the current document; its globals are gone
    pub fn navigate(&self) {
        *Self::document(&mut self.state.lock()) = Document::default();
    }

    fn document(state: &mut State) -> &mut Document {
        let frame = state.frame.clone();
        state.documents.entry(frame).or_default()
    }

    fn in_flight(state: &State, now: u64) -> bool {
        state
            .requests
            .iter()
            .any(|&(from, to)| from <= now && now < to)
    }

    fn mutation_count(state: &State, now: u64) -> usize {
        state.mutations.iter().filter(|&&t| t <= now).count()
    }

    fn have_new_mutations(state: &mut State, now: u64) -> bool {
        let count = Self::mutation_count(state, now);
        let document = Self::document(state);
        let changed = count != document.prev_mutations;
        document.prev_mutations = count;
        changed
    }

    /// When a timer scheduled now for `delay` ms actually fires
    fn fire_time(state: &State, now: u64, delay: u64) -> u64 {
        let mut fire = now + delay + TIMER_JITTER_MS;
        for &(from, to) in &state.busy {
            if from <= fire && fire < to {
                fire = to;
            }
        }
        fire
    }

    fn require(state: &mut State, capability: Capability) -> Result<()> {
        if Self::document(state).installed.contains(&capability) {
            Ok(())
        } else {
            Err(Error::Script(format!(
                "javascript error: {} not installed",
                capability.name()
            )))
        }
    }
}

#[async_trait]
impl ScriptBridge for SimulatedPage {
    async fn run_script(&self, script: &str) -> Result<Value> {
        let now = self.now_ms();
        let mut state = self.state.lock();

        for capability in [
            Capability::Probes,
            Capability::NetworkMonitor,
            Capability::DomUtils,
        ] {
            if script == capability.install_script() {
                if state.install_failures > 0 {
                    state.install_failures -= 1;
                    return Err(Error::Script("javascript error: document is not ready".into()));
                }
                let document = Self::document(&mut state);
                if !document.installed.contains(&capability) {
                    document.installed.push(capability);
                }
                if capability == Capability::DomUtils {
                    document.marker = true;
                    state.injections += 1;
                }
                return Ok(Value::Null);
            }
        }

        match script {
            s if s == scripts::MARKER_PRESENT => Ok(json!(Self::document(&mut state).marker)),
            s if s == scripts::READY_STATE => {
                let ready = if now >= state.load_complete_at {
                    "complete"
                } else {
                    "loading"
                };
                Ok(json!(ready))
            }
            s if s == scripts::NETWORK_PENDING => {
                Self::require(&mut state, Capability::Probes)?;
                Ok(json!(Self::in_flight(&state, now)))
            }
            s if s == scripts::DOM_MUTATED => {
                Self::require(&mut state, Capability::Probes)?;
                Ok(json!(Self::have_new_mutations(&mut state, now)))
            }
            s if s == scripts::ACTIVITY_SNAPSHOT => {
                Self::require(&mut state, Capability::Probes)?;
                let loading = now < state.load_complete_at;
                let network = Self::in_flight(&state, now);
                let dom = Self::have_new_mutations(&mut state, now);
                Ok(json!({
                    "loading": loading,
                    "networkPending": network,
                    "domMutated": dom,
                }))
            }
            s if s == scripts::CALL_LOG_LENGTH => {
                Self::require(&mut state, Capability::NetworkMonitor)?;
                Ok(json!(Self::document(&mut state).calls.len()))
            }
            s if s.starts_with("return window.requestArray[") => {
                Self::require(&mut state, Capability::NetworkMonitor)?;
                let index: usize = s
                    .trim_start_matches("return window.requestArray[")
                    .trim_end_matches("];")
                    .parse()
                    .map_err(|_| Error::Script("bad index".into()))?;
                let call = Self::document(&mut state).calls.get(index).cloned();
                Ok(call.unwrap_or(Value::Null))
            }
            _ => Err(Error::Script(format!("unexpected script: {}", script))),
        }
    }

    async fn run_script_async(&self, script: &str, timeout: Duration) -> Result<Value> {
        let delay = [100u64, 200, 300]
            .into_iter()
            .find(|&d| script == scripts::busy_latency(d))
            .ok_or_else(|| Error::Script(format!("unexpected async script: {}", script)))?;

        let now = self.now_ms();
        let fire = Self::fire_time(&self.state.lock(), now, delay);
        let latency = fire - now;
        if Duration::from_millis(latency) > timeout {
            tokio::time::sleep(timeout).await;
            return Err(Error::Script("script timeout".into()));
        }
        tokio::time::sleep(Duration::from_millis(latency)).await;
        Ok(json!(latency))
    }

    async fn capture_screenshot(&self) -> Result<Vec<u8>> {
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn switch_to_frame(&self, frame: Option<&str>) -> Result<()> {
        if frame == Some("missing") {
            return Err(Error::FrameNotFound("missing".into()));
        }
        self.state.lock().frame = frame.map(String::from);
        Ok(())
    }
}
