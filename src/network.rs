//! Captured Network Calls
//!
//! Reads the call log kept by the in-page network monitor
//! (`window.requestArray`).

use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::bridge::{value_as_f64, ScriptBridge};
use crate::error::{Error, Result};
use crate::instrument::{run_query, Query};

/// Which part of a captured call to match against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiField {
    Url,
    Method,
    PostData,
    ResponseText,
    StatusCode,
    StatusText,
}

/// One completed XHR/fetch call
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCall {
    pub url: String,
    pub method: String,
    /// Request body; non-string bodies are JSON-stringified
    pub body: Option<String>,
    pub response_text: Option<String>,
    pub status: i64,
    pub status_text: String,
}

impl CapturedCall {
    /// Decode the `[url, method, body, responseBody, statusCode, statusText]` tuple
    pub fn from_tuple(value: Value) -> Result<Self> {
        let (url, method, body, response_text, status, status_text): (
            Option<String>,
            Option<String>,
            Value,
            Option<String>,
            Option<i64>,
            Option<String>,
        ) = serde_json::from_value(value)?;

        let body = match body {
            Value::Null => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        };

        Ok(Self {
            url: url.unwrap_or_default(),
            method: method.unwrap_or_default(),
            body,
            response_text,
            status: status.unwrap_or(0),
            status_text: status_text.unwrap_or_default(),
        })
    }

    /// Text of one field, as the regex filter sees it
    pub fn field(&self, field: ApiField) -> String {
        match field {
            ApiField::Url => self.url.clone(),
            ApiField::Method => self.method.clone(),
            ApiField::PostData => self.body.clone().unwrap_or_default(),
            ApiField::ResponseText => self.response_text.clone().unwrap_or_default(),
            ApiField::StatusCode => self.status.to_string(),
            ApiField::StatusText => self.status_text.clone(),
        }
    }
}

/// Read-only view over the page's call log
pub struct NetworkLog<'a> {
    bridge: &'a dyn ScriptBridge,
    timeout: Duration,
}

impl<'a> NetworkLog<'a> {
    pub fn new(bridge: &'a dyn ScriptBridge, timeout: Duration) -> Self {
        Self { bridge, timeout }
    }

    /// Number of captured calls
    pub async fn len(&self) -> Result<usize> {
        let query = Query::CallLogLength;
        let value = run_query(self.bridge, &query, self.timeout).await?;
        Ok(value_as_f64(query.name(), &value)? as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Call at `index`, oldest first
    pub async fn call_at(&self, index: usize) -> Result<CapturedCall> {
        let query = Query::CallAt(index);
        let value = run_query(self.bridge, &query, self.timeout).await?;
        if value.is_null() {
            return Err(Error::probe(
                query.name(),
                format!("no captured call at index {}", index),
            ));
        }
        CapturedCall::from_tuple(value)
    }

    /// All captured calls
    pub async fn all(&self) -> Result<Vec<CapturedCall>> {
        let count = self.len().await?;
        let mut calls = Vec::with_capacity(count);
        for index in 0..count {
            calls.push(self.call_at(index).await?);
        }
        Ok(calls)
    }

    /// Calls whose `field` matches `pattern`
    pub async fn matching(&self, pattern: &Regex, field: ApiField) -> Result<Vec<CapturedCall>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|call| pattern.is_match(&call.field(field)))
            .collect())
    }
}
