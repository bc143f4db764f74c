// Module contract - the capability set every pluggable phase implements
// The engine never downcasts; it calls only the methods defined here

//! # Module Contract
//!
//! A **module** is an idempotent unit of workflow-scoped work. Concrete
//! modules (planning, hiring, cleanup, ...) live outside this crate; the
//! engine sees them only through the [`Module`] trait:
//!
//! - **Identity**: [`ModuleInfo`] with a stable id, human name, version, and
//!   a [`ConcurrencyProfile`] (slot cost + exclusivity)
//! - **Artifacts**: declared inputs/outputs as [`ArtifactRef`] sequences
//! - **Completion**: `is_complete` re-derives done-ness from ground truth
//!   (typically on-disk markers), so restarts and out-of-band changes are
//!   always observed
//! - **Execution**: `run` performs the work and reports a [`RunResult`]
//! - **Fingerprints**: optional per-artifact fingerprints the resolver
//!   compares against stored artifact metadata
//!
//! Modules are instantiated through the [`ModuleRegistry`], a map from module
//! id to a factory closure consuming the opaque per-instance configuration.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::state::ArtifactStatus;
use super::workflow::ModuleRef;
use crate::engine::artifacts::ArtifactStore;
use crate::{LatticeError, Result};

/// Concurrency descriptor for a module
///
/// `slots` is the parallel-budget cost of running the module (default 1).
/// `exclusive` means the module requires the entire parallel budget: nothing
/// else may run alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyProfile {
    #[serde(default = "default_slots")]
    pub slots: u32,
    #[serde(default)]
    pub exclusive: bool,
}

fn default_slots() -> u32 {
    1
}

impl Default for ConcurrencyProfile {
    fn default() -> Self {
        Self {
            slots: 1,
            exclusive: false,
        }
    }
}

impl ConcurrencyProfile {
    /// An exclusive profile (whole parallel budget)
    pub fn exclusive() -> Self {
        Self {
            slots: 1,
            exclusive: true,
        }
    }

    /// Slot cost, clamped to at least 1
    pub fn slot_cost(&self) -> u32 {
        self.slots.max(1)
    }
}

/// Module identity and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub concurrency: ConcurrencyProfile,
}

impl ModuleInfo {
    pub fn new<S: Into<String>>(id: S, name: S, version: S) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            concurrency: ConcurrencyProfile::default(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyProfile) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// A named artifact kind a module consumes or produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub name: String,
}

impl ArtifactRef {
    pub fn new<S: Into<String>>(id: S, name: S) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Outcome status of a module execution
///
/// `NeedsInput` means the module paused pending an external event (for
/// example a user decision delivered via the bridge) and is still active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    NeedsInput,
}

impl RunStatus {
    /// Terminal statuses release the module's claim; `NeedsInput` does not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::NeedsInput)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::NeedsInput => write!(f, "needs_input"),
        }
    }
}

/// Result returned by `Module::run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(default)]
    pub message: String,
}

impl RunResult {
    pub fn completed<S: Into<String>>(message: S) -> Self {
        Self {
            status: RunStatus::Completed,
            message: message.into(),
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            status: RunStatus::Failed,
            message: message.into(),
        }
    }

    pub fn needs_input<S: Into<String>>(message: S) -> Self {
        Self {
            status: RunStatus::NeedsInput,
            message: message.into(),
        }
    }
}

/// Notification passed to `Module::on_artifact_invalidation` when an expected
/// output artifact is observed `Outdated` or `Invalid` during a refresh.
#[derive(Debug, Clone)]
pub struct ArtifactInvalidation {
    pub artifact_id: String,
    pub status: ArtifactStatus,
    pub expected_fingerprint: Option<String>,
    pub stored_fingerprint: Option<String>,
}

/// Execution context handed to every module call
///
/// Carries the workflow directory, the artifact store handle, and a
/// cancellation token. Module-bound work that touches the filesystem should
/// observe `cancel` and abort early when it fires.
#[derive(Clone)]
pub struct ModuleContext {
    pub workflow_dir: PathBuf,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub cancel: CancellationToken,
}

impl ModuleContext {
    pub fn new(workflow_dir: PathBuf, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            workflow_dir,
            artifacts,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("workflow_dir", &self.workflow_dir)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// The capability set a pluggable module must satisfy
///
/// All methods take a [`ModuleContext`]; `is_complete` and
/// `artifact_fingerprints` may touch disk and must be idempotent and
/// side-effect-free. `is_complete` fails only when the underlying check hits
/// I/O that is not benign absence.
#[async_trait::async_trait]
pub trait Module: Send + Sync {
    /// Stable identity, human name, version, and concurrency profile
    fn info(&self) -> ModuleInfo;

    /// Artifacts this module consumes
    fn inputs(&self) -> Vec<ArtifactRef> {
        Vec::new()
    }

    /// Artifacts this module produces
    fn outputs(&self) -> Vec<ArtifactRef> {
        Vec::new()
    }

    /// Idempotent completion check against ground truth
    async fn is_complete(&self, ctx: &ModuleContext) -> Result<bool>;

    /// Execute the module
    async fn run(&self, ctx: &ModuleContext) -> Result<RunResult>;

    /// Expected fingerprint per produced artifact id
    ///
    /// When non-empty, the resolver compares these against the fingerprint
    /// notes recorded in the stored artifact metadata and downgrades the node
    /// on mismatch.
    async fn artifact_fingerprints(&self, _ctx: &ModuleContext) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    /// Hook invoked once per offending artifact when an expected output
    /// transitions to `Outdated` or `Invalid`. The module may update local
    /// state; the engine still treats the node as requiring a rerun.
    async fn on_artifact_invalidation(
        &self,
        _ctx: &ModuleContext,
        _invalidation: &ArtifactInvalidation,
    ) -> Result<()> {
        Ok(())
    }
}

/// Factory closure that builds a module instance from its workflow reference
/// (the reference carries the opaque per-instance configuration map).
pub type ModuleFactory = Box<dyn Fn(&ModuleRef) -> Result<Arc<dyn Module>> + Send + Sync>;

/// Plugin registry of module factories keyed by module id
///
/// The resolver consults the registry exactly once per module instance at
/// construction time; an unregistered module id is a definition-level error.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a module id, replacing any previous entry
    pub fn register<S, F>(&mut self, module_id: S, factory: F)
    where
        S: Into<String>,
        F: Fn(&ModuleRef) -> Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        self.factories.insert(module_id.into(), Box::new(factory));
    }

    /// True when a factory exists for the module id
    pub fn contains(&self, module_id: &str) -> bool {
        self.factories.contains_key(module_id)
    }

    /// Instantiate the module a workflow reference points at
    pub fn instantiate(&self, reference: &ModuleRef) -> Result<Arc<dyn Module>> {
        let factory =
            self.factories
                .get(&reference.module)
                .ok_or_else(|| LatticeError::UnknownModule {
                    id: reference.module.clone(),
                })?;
        factory(reference)
    }

    /// Registered module ids, sorted
    pub fn module_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.module_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_profile_defaults_to_one_shared_slot() {
        let profile = ConcurrencyProfile::default();
        assert_eq!(profile.slot_cost(), 1);
        assert!(!profile.exclusive);
    }

    #[test]
    fn slot_cost_clamps_to_at_least_one() {
        let profile = ConcurrencyProfile {
            slots: 0,
            exclusive: false,
        };
        assert_eq!(profile.slot_cost(), 1);
    }

    #[test]
    fn run_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::NeedsInput.is_terminal());
    }

    #[test]
    fn registry_rejects_unknown_module() {
        let registry = ModuleRegistry::new();
        let reference = ModuleRef::new("plan");
        let err = match registry.instantiate(&reference) {
            Err(err) => err,
            Ok(_) => panic!("unregistered module must not instantiate"),
        };
        assert!(matches!(err, LatticeError::UnknownModule { id } if id == "plan"));
    }
}
