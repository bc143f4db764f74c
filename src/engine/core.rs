// Engine facade - start / resume / update / claim / view over a durable run

//! # Engine Facade
//!
//! [`Engine`] composes the resolver, the scheduler, and the state store
//! behind five operations:
//!
//! - `start`: normalize a definition, build the first snapshot, assign a
//!   fresh run id, persist
//! - `resume`: reload the persisted snapshot and rebuild derived fields from
//!   ground truth (out-of-band completions and artifact invalidations that
//!   happened while the process was down surface here)
//! - `update`: merge reported module outcomes into the run history, release
//!   terminal claims, rebuild
//! - `claim`: reserve runnable nodes for external execution
//! - `view`: return the last persisted snapshot without recomputation
//!
//! The facade is a request/response surface driven serially by one
//! coordinator. It absorbs module failures into the state machine and
//! surfaces only infrastructure failures (persistence, definition errors) to
//! its caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::artifacts::{ArtifactStore, FsArtifactStore};
use crate::engine::resolver::Resolver;
use crate::engine::scheduler::{runnable_batch, RunnableRequest};
use crate::engine::storage::{JsonStateStore, StateStore};
use crate::models::{
    EngineRuntime, EngineStatus, ManualGate, ModuleContext, ModuleRegistry, ModuleRun, NodeState,
    RunResult, RunStatus, State, WorkItem, WorkflowDefinition,
};
use crate::Result;

/// Overrides applied onto the runtime overlay by any operation
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub targets: Option<Vec<String>>,
    pub batch_size: Option<u64>,
    pub max_parallel: Option<i64>,
    pub manual_gates: Option<BTreeMap<String, ManualGate>>,
}

impl RuntimeOverrides {
    fn apply(&self, runtime: &mut EngineRuntime) {
        if let Some(targets) = &self.targets {
            runtime.targets = targets.clone();
        }
        if let Some(batch_size) = self.batch_size {
            runtime.batch_size = batch_size;
        }
        if let Some(max_parallel) = self.max_parallel {
            runtime.max_parallel = max_parallel.max(0);
        }
        if let Some(gates) = &self.manual_gates {
            runtime.manual_gates = gates.clone();
        }
    }
}

/// Start a new run from a workflow definition
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub definition: WorkflowDefinition,
    pub runtime: RuntimeOverrides,
}

impl StartRequest {
    pub fn new(definition: WorkflowDefinition) -> Self {
        Self {
            definition,
            runtime: RuntimeOverrides::default(),
        }
    }
}

/// Resume the persisted run
#[derive(Debug, Clone, Default)]
pub struct ResumeRequest {
    pub runtime: RuntimeOverrides,
}

/// One reported module outcome
#[derive(Debug, Clone)]
pub struct ModuleStatusUpdate {
    pub id: String,
    pub result: Option<RunResult>,
    pub error: Option<String>,
    /// Defaults to the engine clock when unset
    pub finished_at: Option<DateTime<Utc>>,
}

impl ModuleStatusUpdate {
    pub fn completed<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            result: Some(RunResult::completed("")),
            error: None,
            finished_at: None,
        }
    }

    pub fn failed<S: Into<String>>(id: S, error: S) -> Self {
        Self {
            id: id.into(),
            result: Some(RunResult::failed("")),
            error: Some(error.into()),
            finished_at: None,
        }
    }

    pub fn needs_input<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            result: Some(RunResult::needs_input("")),
            error: None,
            finished_at: None,
        }
    }
}

/// Merge module outcomes and re-derive the snapshot
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub results: Vec<ModuleStatusUpdate>,
    pub runtime: RuntimeOverrides,
}

/// Reserve runnable nodes for external execution
#[derive(Debug, Clone, Default)]
pub struct ClaimRequest {
    /// Restrict claiming to these instance ids (empty = any runnable)
    pub modules: Vec<String>,
    /// Maximum nodes to claim; 0 means no cap
    pub limit: u64,
    pub runtime: RuntimeOverrides,
}

/// The persistent engine facade
pub struct Engine {
    registry: Arc<ModuleRegistry>,
    state_store: Arc<dyn StateStore>,
    artifact_store: Arc<dyn ArtifactStore>,
    workflow_dir: PathBuf,
}

impl Engine {
    pub fn new(
        registry: Arc<ModuleRegistry>,
        state_store: Arc<dyn StateStore>,
        artifact_store: Arc<dyn ArtifactStore>,
        workflow_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            state_store,
            artifact_store,
            workflow_dir,
        }
    }

    /// Conventional wiring under a workflow directory:
    /// state at `engine/state.json`, artifacts under `artifacts/`
    pub fn for_workflow_dir<P: AsRef<Path>>(registry: Arc<ModuleRegistry>, workflow_dir: P) -> Self {
        let workflow_dir = workflow_dir.as_ref().to_path_buf();
        Self {
            registry,
            state_store: Arc::new(JsonStateStore::for_workflow_dir(&workflow_dir)),
            artifact_store: Arc::new(FsArtifactStore::new(workflow_dir.join("artifacts"))),
            workflow_dir,
        }
    }

    /// Start a new run
    ///
    /// Normalizes the definition (rejecting duplicates, unknown dependency
    /// references, and cycles), seeds the runtime overlay from the
    /// definition's runtime config plus the request overrides, assigns a new
    /// run id, builds the first snapshot, and persists it.
    pub async fn start(&self, cancel: &CancellationToken, request: StartRequest) -> Result<State> {
        let definition = request.definition.normalize()?;

        let mut runtime = EngineRuntime {
            max_parallel: definition.runtime.max_parallel,
            ..EngineRuntime::default()
        };
        request.runtime.apply(&mut runtime);

        let mut state = State {
            run_id: make_run_id(&definition.id),
            workflow_id: definition.id.clone(),
            definition,
            status: EngineStatus::Unknown,
            status_reason: String::new(),
            runtime,
            nodes: Vec::new(),
            runnable: Vec::new(),
            skipped: BTreeMap::new(),
            runs: BTreeMap::new(),
            updated_at: Utc::now(),
        };

        self.rebuild(&mut state, cancel).await?;
        self.state_store.save(&state).await?;
        info!(run_id = %state.run_id, workflow = %state.workflow_id, status = %state.status,
            "run started");
        Ok(state)
    }

    /// Resume the persisted run
    ///
    /// Fails with the distinguished not-found signal when no state was ever
    /// persisted. The run id and workflow id are preserved; derived fields
    /// are rebuilt from the stored definition and run history.
    pub async fn resume(&self, cancel: &CancellationToken, request: ResumeRequest) -> Result<State> {
        let mut state = self.state_store.load().await?;
        request.runtime.apply(&mut state.runtime);

        self.rebuild(&mut state, cancel).await?;
        self.state_store.save(&state).await?;
        info!(run_id = %state.run_id, status = %state.status, "run resumed");
        Ok(state)
    }

    /// Merge reported outcomes into the run history and rebuild
    ///
    /// Later entries for the same id overwrite earlier ones. Terminal
    /// statuses (anything but `NeedsInput`) release the module's claim before
    /// the rebuild.
    pub async fn update(&self, cancel: &CancellationToken, request: UpdateRequest) -> Result<State> {
        let mut state = self.state_store.load().await?;
        request.runtime.apply(&mut state.runtime);

        let mut released: Vec<String> = Vec::new();
        for update in &request.results {
            let status = match &update.result {
                Some(result) => result.status,
                None if update.error.is_some() => RunStatus::Failed,
                None => RunStatus::Completed,
            };
            let run = ModuleRun {
                status,
                message: update
                    .result
                    .as_ref()
                    .map(|r| r.message.clone())
                    .unwrap_or_default(),
                error: update.error.clone(),
                finished_at: update.finished_at.unwrap_or_else(Utc::now),
            };
            debug!(instance = %update.id, status = %status, "module run recorded");
            state.runs.insert(update.id.clone(), run);
            if status.is_terminal() {
                released.push(update.id.clone());
            }
        }
        state
            .runtime
            .running
            .retain(|id| !released.iter().any(|r| r == id));

        self.rebuild(&mut state, cancel).await?;
        self.state_store.save(&state).await?;
        Ok(state)
    }

    /// Reserve runnable nodes for external execution
    ///
    /// Rebuilds the snapshot, filters the runnable list by the optional
    /// instance-id predicate, caps the reservation at `limit`, marks the
    /// claimed ids running (deduplicated), strips them from the runnable
    /// list, re-derives the status, and persists.
    pub async fn claim(
        &self,
        cancel: &CancellationToken,
        request: ClaimRequest,
    ) -> Result<(Vec<WorkItem>, State)> {
        let mut state = self.state_store.load().await?;
        request.runtime.apply(&mut state.runtime);

        self.rebuild(&mut state, cancel).await?;

        let mut claimed: Vec<String> = Vec::new();
        for id in &state.runnable {
            if request.limit > 0 && claimed.len() as u64 >= request.limit {
                break;
            }
            if !request.modules.is_empty() && !request.modules.iter().any(|m| m == id) {
                continue;
            }
            claimed.push(id.clone());
        }

        for id in &claimed {
            if !state.runtime.is_running(id) {
                state.runtime.running.push(id.clone());
            }
        }
        state.runnable.retain(|id| !claimed.iter().any(|c| c == id));
        derive_status(&mut state);
        state.updated_at = Utc::now();

        self.state_store.save(&state).await?;

        let items: Vec<WorkItem> = claimed
            .iter()
            .filter_map(|id| state.node(id))
            .map(|node| WorkItem {
                id: node.id.clone(),
                module_id: node.module_id.clone(),
                name: node.name.clone(),
                description: node.description.clone(),
                optional: node.optional,
                concurrency: node.concurrency.clone(),
            })
            .collect();

        debug!(claimed = items.len(), "work reserved");
        Ok((items, state))
    }

    /// Return the last persisted snapshot without recomputation
    pub async fn view(&self) -> Result<State> {
        self.state_store.load().await
    }

    /// Rebuild derived state from ground truth: resolver refresh, claim
    /// pruning, scheduling, status derivation.
    async fn rebuild(&self, state: &mut State, cancel: &CancellationToken) -> Result<()> {
        let mut resolver = Resolver::new(&state.definition, &self.registry)?;
        let ctx = ModuleContext::new(self.workflow_dir.clone(), self.artifact_store.clone())
            .with_cancel(cancel.clone());
        resolver.refresh(&ctx).await?;

        // Claims on nodes that completed out-of-band (or disappeared from the
        // definition) are released before scheduling.
        state.runtime.running.retain(|id| {
            resolver
                .node(id)
                .map(|n| n.state != NodeState::Complete)
                .unwrap_or(false)
        });

        let batch = runnable_batch(&resolver, &RunnableRequest::from_runtime(&state.runtime));

        state.nodes = resolver.nodes().to_vec();
        state.runnable = batch.nodes;
        state.skipped = batch.skipped;
        derive_status(state);
        state.updated_at = Utc::now();
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflow_dir", &self.workflow_dir)
            .finish()
    }
}

/// Derive the run-level status purely from (nodes, runtime, runs)
fn derive_status(state: &mut State) {
    if let Some(node) = state.nodes.iter().find(|n| n.state == NodeState::Error) {
        state.status = EngineStatus::Error;
        state.status_reason = format!(
            "module {} readiness check failed: {}",
            node.id,
            node.error.as_deref().unwrap_or("unknown error")
        );
        return;
    }
    if let Some((id, run)) = state
        .runs
        .iter()
        .find(|(_, run)| run.status == RunStatus::Failed)
    {
        state.status = EngineStatus::Error;
        let detail = run
            .error
            .as_deref()
            .filter(|e| !e.is_empty())
            .unwrap_or(run.message.as_str());
        state.status_reason = format!("module {} failed: {}", id, detail);
        return;
    }
    if state.nodes.iter().all(|n| n.state == NodeState::Complete) {
        state.status = EngineStatus::Complete;
        state.status_reason.clear();
        return;
    }
    if state.nodes.iter().any(|n| n.state == NodeState::Ready)
        || !state.runtime.running.is_empty()
    {
        state.status = EngineStatus::Running;
        state.status_reason.clear();
        return;
    }
    state.status = EngineStatus::Blocked;
    state.status_reason = "waiting on blocked or pending modules".to_string();
}

/// `<workflow-id-slug>-<monotonic-timestamp>`
fn make_run_id(workflow_id: &str) -> String {
    format!("{}-{}", slug(workflow_id), Utc::now().timestamp_millis())
}

fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev_dash = false;
    for ch in input.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            prev_dash = false;
        } else if !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "workflow".to_string()
    } else {
        out
    }
}
