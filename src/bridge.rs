//! Browser Scripting Bridge
//!
//! The one seam between pagesync and whatever drives the browser (WebDriver,
//! CDP, a test double). Every probe is a blocking round trip through it.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};

/// Script execution surface of a browser driver
#[async_trait]
pub trait ScriptBridge: Send + Sync {
    /// Run a script synchronously and return its value (`return x;` style body)
    async fn run_script(&self, script: &str) -> Result<Value>;

    /// Run an asynchronous script.
    ///
    /// The script receives a completion callback as its last argument and
    /// the call resolves with whatever the script passes to it. Drivers must
    /// fail the call once `timeout` elapses without completion.
    async fn run_script_async(&self, script: &str, timeout: Duration) -> Result<Value>;

    /// Capture the viewport as PNG bytes
    async fn capture_screenshot(&self) -> Result<Vec<u8>>;

    /// Scope subsequent scripts to a frame (`None` = top-level document)
    async fn switch_to_frame(&self, frame: Option<&str>) -> Result<()>;
}

/// A frame or document the automation is currently scoped to.
///
/// Whether the context is instrumented lives entirely in the browser; ask
/// [`crate::Instrumentation::is_present`] instead of caching it here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ExecutionContext {
    /// Frame title/class used to locate the iframe, `None` for the top document
    pub frame: Option<String>,
}

impl ExecutionContext {
    /// The top-level document
    pub fn top() -> Self {
        Self { frame: None }
    }

    /// A named iframe
    pub fn frame(name: impl Into<String>) -> Self {
        Self {
            frame: Some(name.into()),
        }
    }

    /// Human-readable label for logs
    pub fn label(&self) -> &str {
        self.frame.as_deref().unwrap_or("top")
    }
}

/// Interpret a probe result as a boolean
pub fn value_as_bool(probe: &str, value: &Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::probe(probe, format!("expected boolean, got {}", value)))
}

/// Interpret a probe result as a number
pub fn value_as_f64(probe: &str, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::probe(probe, format!("expected number, got {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_label() {
        assert_eq!(ExecutionContext::top().label(), "top");
        assert_eq!(ExecutionContext::frame("checkout").label(), "checkout");
    }

    #[test]
    fn test_value_conversions() {
        assert!(value_as_bool("network", &json!(true)).unwrap());
        assert_eq!(value_as_f64("busy", &json!(203)).unwrap(), 203.0);

        let err = value_as_bool("dom", &Value::Null).unwrap_err();
        assert!(matches!(err, Error::Probe { .. }));
    }
}
