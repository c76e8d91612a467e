//! Screenshot Collection
//!
//! Keeps the screenshots taken after each successful sync and writes them
//! out with names that sort in capture order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use base64::Engine;
use parking_lot::Mutex;
use regex::Regex;

use crate::error::{Error, Result};

/// Global counter for unique manager ids (one per session)
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Serialises file output across every session in the process
static FILE_OUTPUT_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// Longest description kept in a file name
const MAX_DESCRIPTION_LEN: usize = 100;

/// Receives screenshots from the coordinator
pub trait ScreenshotSink: Send + Sync {
    /// Store one PNG with a human-readable description
    fn add_shot(&self, image: Vec<u8>, description: &str);
}

/// A sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardShots;

impl ScreenshotSink for DiscardShots {
    fn add_shot(&self, _image: Vec<u8>, _description: &str) {}
}

#[derive(Debug, Clone)]
struct Shot {
    image: Vec<u8>,
    description: String,
    test_name: String,
}

/// Collects screenshots in memory until [`ScreenshotManager::write_all`]
#[derive(Debug)]
pub struct ScreenshotManager {
    session: u64,
    environment: String,
    test_name: Mutex<String>,
    shots: Mutex<Vec<Shot>>,
}

impl ScreenshotManager {
    /// Create a manager; `environment` prefixes every file name
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            session: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            environment: environment.into(),
            test_name: Mutex::new(String::new()),
            shots: Mutex::new(Vec::new()),
        }
    }

    /// Tag subsequent shots with a test name (`None` clears it)
    pub fn set_test_name(&self, name: Option<&str>) {
        *self.test_name.lock() = name.map(String::from).unwrap_or_default();
    }

    pub fn len(&self) -> usize {
        self.shots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shots.lock().is_empty()
    }

    /// Descriptions of the collected shots, in order
    pub fn descriptions(&self) -> Vec<String> {
        self.shots
            .lock()
            .iter()
            .map(|s| s.description.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.shots.lock().clear();
    }

    /// Write every collected shot into `dir`, returning the paths in order.
    ///
    /// Holds the process-wide output lock for the whole batch so parallel
    /// sessions do not interleave.
    pub fn write_all(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let shots = self.shots.lock().clone();

        let _guard = FILE_OUTPUT_LOCK.lock();
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::with_capacity(shots.len());
        for (index, shot) in shots.iter().enumerate() {
            let counter = index as u64 + 1;
            let path = dir.join(self.file_name(shot, counter));
            std::fs::write(&path, &shot.image)?;
            written.push(path);
        }

        tracing::info!("Wrote {} screenshots to {:?}", written.len(), dir);
        Ok(written)
    }

    fn file_name(&self, shot: &Shot, counter: u64) -> String {
        let test = if shot.test_name.is_empty() {
            String::new()
        } else {
            format!("{}_", shot.test_name)
        };
        format!(
            "{}_{}_{}{}_{}_{}.png",
            self.environment,
            self.session,
            test,
            alpha_counter(counter),
            counter,
            sanitize_description(&shot.description)
        )
    }
}

impl ScreenshotSink for ScreenshotManager {
    fn add_shot(&self, image: Vec<u8>, description: &str) {
        let test_name = self.test_name.lock().clone();
        self.shots.lock().push(Shot {
            image,
            description: description.to_string(),
            test_name,
        });
    }
}

/// Replace anything but word characters and '-' with '_', capped in length
pub fn sanitize_description(description: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"[^\w\-]").expect("valid pattern"));
    pattern
        .replace_all(description, "_")
        .chars()
        .take(MAX_DESCRIPTION_LEN)
        .collect()
}

/// Base-26 letter counter, left-padded with 'A' to four letters (1 -> "AAAB")
pub fn alpha_counter(value: u64) -> String {
    let mut letters = Vec::new();
    let mut rest = value;
    while rest >= 26 {
        letters.push(b'A' + (rest % 26) as u8);
        rest /= 26;
    }
    letters.push(b'A' + rest as u8);
    while letters.len() < 4 {
        letters.push(b'A');
    }
    letters.iter().rev().map(|&b| b as char).collect()
}

/// Decode a base64 screenshot as returned by WebDriver/CDP (data URL prefix allowed)
pub fn decode_base64_png(encoded: &str) -> Result<Vec<u8>> {
    let data = encoded
        .split_once("base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| Error::Decode(e.to_string()))
}
