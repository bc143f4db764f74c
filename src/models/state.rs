// Run state - the durable record the engine persists after every operation

//! # Run State
//!
//! This module defines the durable run record and the two state machines the
//! engine derives purely from ground truth:
//!
//! - [`NodeState`]: per-node readiness, recomputed on every resolver refresh
//! - [`EngineStatus`]: the run-level status, derived from (nodes, runtime,
//!   runs) so no transition is lost if the process crashes mid-operation
//!
//! [`State`] is serialized as a single JSON document to
//! `<workflow-dir>/engine/state.json`. Maps use `BTreeMap` so the document is
//! byte-stable across saves with unchanged content.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::module::{ConcurrencyProfile, RunStatus};
use super::workflow::WorkflowDefinition;

/// Readiness of a single module instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Unknown,
    Pending,
    Ready,
    Blocked,
    Complete,
    Error,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Unknown => "unknown",
            NodeState::Pending => "pending",
            NodeState::Ready => "ready",
            NodeState::Blocked => "blocked",
            NodeState::Complete => "complete",
            NodeState::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Run-level status derived from nodes, runtime, and run history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Unknown,
    Running,
    Blocked,
    Complete,
    Error,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EngineStatus::Unknown => "unknown",
            EngineStatus::Running => "running",
            EngineStatus::Blocked => "blocked",
            EngineStatus::Complete => "complete",
            EngineStatus::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Validity of a stored artifact relative to the node that declares it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Stored, produced by this node's module, fingerprint matches (if any)
    Fresh,
    /// Produced by this node's module but the fingerprints disagree
    Outdated,
    /// Another module overwrote the slot, or the metadata is missing
    Invalid,
    /// Nothing stored under the artifact id
    Absent,
}

impl ArtifactStatus {
    /// Statuses that force a complete node back to pending
    pub fn invalidates(&self) -> bool {
        matches!(self, ArtifactStatus::Outdated | ArtifactStatus::Invalid)
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactStatus::Fresh => "fresh",
            ArtifactStatus::Outdated => "outdated",
            ArtifactStatus::Invalid => "invalid",
            ArtifactStatus::Absent => "absent",
        };
        write!(f, "{}", name)
    }
}

/// Per-artifact evaluation recorded on a node during refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub status: ArtifactStatus,
    /// Fingerprint the module expects (recorded for `Outdated`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_fingerprint: Option<String>,
    /// Fingerprint found in the stored metadata (recorded for `Outdated`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_fingerprint: Option<String>,
}

impl ArtifactReport {
    pub fn new(status: ArtifactStatus) -> Self {
        Self {
            status,
            expected_fingerprint: None,
            stored_fingerprint: None,
        }
    }
}

/// Resolver view of a module instance, rebuilt on every refresh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub module_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
    pub state: NodeState,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub dependents: Vec<String>,
    /// Dependency ids that are not complete (populated when `Blocked`)
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub concurrency: ConcurrencyProfile,
    /// Artifact reports keyed by artifact id (populated for complete nodes
    /// and for nodes downgraded by artifact invalidation)
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactReport>,
}

/// A per-node requirement that an external approver unlocks before the
/// scheduler will admit the node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManualGate {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub note: String,
}

impl ManualGate {
    /// True when the gate currently withholds the node
    pub fn blocks(&self) -> bool {
        self.required && !self.approved
    }
}

/// Runtime overlay that survives restarts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineRuntime {
    /// Narrow scheduling to these instance ids (empty = every node)
    #[serde(default)]
    pub targets: Vec<String>,
    /// Cap on nodes admitted per batch; 0 means no cap
    #[serde(default)]
    pub batch_size: u64,
    /// Parallel slot budget; 0 means unlimited
    #[serde(default)]
    pub max_parallel: i64,
    /// Instance ids currently claimed by the coordinator
    #[serde(default)]
    pub running: Vec<String>,
    #[serde(default)]
    pub manual_gates: BTreeMap<String, ManualGate>,
}

impl EngineRuntime {
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.running.iter().any(|id| id == instance_id)
    }

    pub fn gate(&self, instance_id: &str) -> Option<&ManualGate> {
        self.manual_gates.get(instance_id)
    }
}

/// Last observed execution outcome for a module instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRun {
    pub status: RunStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Why a ready node was withheld from the runnable batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipCode {
    NotReady,
    ManualGate,
    Concurrency,
    Active,
}

/// Scheduler explanation attached to a withheld node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipReason {
    pub reason: SkipCode,
    #[serde(default)]
    pub detail: String,
}

impl SkipReason {
    pub fn new<S: Into<String>>(reason: SkipCode, detail: S) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Work reserved by a `claim` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub module_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub concurrency: ConcurrencyProfile,
}

/// The durable snapshot persisted after every engine operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub run_id: String,
    pub workflow_id: String,
    pub definition: WorkflowDefinition,
    pub status: EngineStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub runtime: EngineRuntime,
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Instance ids admissible right now, in scheduler order
    #[serde(default)]
    pub runnable: Vec<String>,
    #[serde(default)]
    pub skipped: BTreeMap<String, SkipReason>,
    #[serde(default)]
    pub runs: BTreeMap<String, ModuleRun>,
    pub updated_at: DateTime<Utc>,
}

impl State {
    pub fn node(&self, instance_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_gate_blocks_until_approved() {
        let mut gate = ManualGate {
            required: true,
            approved: false,
            note: "SRE sign-off".to_string(),
        };
        assert!(gate.blocks());
        gate.approved = true;
        assert!(!gate.blocks());
        assert!(!ManualGate::default().blocks());
    }

    #[test]
    fn artifact_status_invalidation_rules() {
        assert!(ArtifactStatus::Outdated.invalidates());
        assert!(ArtifactStatus::Invalid.invalidates());
        assert!(!ArtifactStatus::Fresh.invalidates());
        assert!(!ArtifactStatus::Absent.invalidates());
    }

    #[test]
    fn node_state_serializes_snake_case() {
        let json = serde_json::to_string(&NodeState::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
        let back: NodeState = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(back, NodeState::Blocked);
    }
}
