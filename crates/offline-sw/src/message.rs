//! Messages exchanged between the page and the background script.

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Page → background script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Leave the waiting state and activate immediately.
    SkipWaiting,
}

/// Background script → page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerMessage {
    /// Activation finished; carries the active version for diagnostics.
    #[serde(rename = "SW_ACTIVATED")]
    Activated { version: String },
}

impl ClientMessage {
    /// Decode a message posted by a page.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl WorkerMessage {
    /// Decode a message broadcast by the background script.
    pub fn from_json(json: &str) -> Result<Self, ServiceWorkerError> {
        serde_json::from_str(json).map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
