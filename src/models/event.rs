// Out-of-band events posted by external worker processes

//! # Bridge Events
//!
//! External workers (typically processes spawned by a running module) report
//! progress by POSTing JSON events to the bridge ingress. The [`Event`] type
//! is the wire schema; validation enforces the supported protocol version and
//! the required identity fields before an event enters the router.
//!
//! Two event classes get special treatment under subscriber-queue overflow:
//!
//! - **critical** (`session_end`, `error`): preferred for retention
//! - **preferred-drop** (`model_response`): preferred for eviction
//!
//! Classification is by exact, case-insensitive comparison so the drop policy
//! stays auditable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LatticeError, Result};

/// Supported event schema version; anything else is rejected at ingress
pub const PROTOCOL_VERSION: u32 = 1;

/// Event types protected from eviction under subscriber-queue overflow
pub const CRITICAL_EVENT_TYPES: [&str; 2] = ["session_end", "error"];

/// Event type preferentially evicted when the critical rule does not decide
pub const PREFERRED_DROP_EVENT_TYPE: &str = "model_response";

/// A single out-of-band notification from an external worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub sequence: i64,
    /// Event type, e.g. `model_response`, `session_end`, `error`
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_time: Option<DateTime<Utc>>,
    /// Stamped by the ingress when the event is accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub module_id: String,
    #[serde(default)]
    pub workflow: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// Validate the wire-level requirements for ingress acceptance
    ///
    /// `version` must equal [`PROTOCOL_VERSION`]; `event_id`, `type`,
    /// `session_id`, `module_id`, and `workflow` must be non-empty after
    /// trimming.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(LatticeError::InvalidEvent(format!(
                "unsupported event version {} (expected {})",
                self.version, PROTOCOL_VERSION
            )));
        }
        for (field, value) in [
            ("event_id", &self.event_id),
            ("type", &self.kind),
            ("session_id", &self.session_id),
            ("module_id", &self.module_id),
            ("workflow", &self.workflow),
        ] {
            if value.trim().is_empty() {
                return Err(LatticeError::InvalidEvent(format!(
                    "missing required field: {}",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Critical events are preferred for retention under overflow
    pub fn is_critical(&self) -> bool {
        let kind = self.kind.trim();
        CRITICAL_EVENT_TYPES
            .iter()
            .any(|t| kind.eq_ignore_ascii_case(t))
    }

    /// Preferred-drop events are evicted first when the critical rule does
    /// not decide
    pub fn is_preferred_drop(&self) -> bool {
        self.kind.trim().eq_ignore_ascii_case(PREFERRED_DROP_EVENT_TYPE)
    }
}

/// Canonical form of a module id for routing: trimmed and lowercased
pub fn normalize_module_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
