// End-to-end engine scenarios against the filesystem stores
// Each test gets its own workflow directory under the system temp dir

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use lattice::{
    ArtifactMetadata, ArtifactRef, ArtifactStatus, ArtifactStore, ClaimRequest, Engine,
    EngineStatus, FsArtifactStore, JsonStateStore, ManualGate, Module, ModuleContext, ModuleInfo,
    ModuleRef, ModuleRegistry, ModuleStatusUpdate, NodeState, ResumeRequest, RunResult,
    RuntimeOverrides, SkipCode, StartRequest, UpdateRequest, WorkflowDefinition,
};

/// A module whose completion is an on-disk marker file, the way real modules
/// derive done-ness from ground truth. External completion = writing the
/// marker.
struct MarkerModule {
    id: String,
    outputs: Vec<ArtifactRef>,
}

#[async_trait::async_trait]
impl Module for MarkerModule {
    fn info(&self) -> ModuleInfo {
        ModuleInfo::new(self.id.clone(), self.id.clone(), "1.0.0".to_string())
    }

    fn outputs(&self) -> Vec<ArtifactRef> {
        self.outputs.clone()
    }

    async fn is_complete(&self, ctx: &ModuleContext) -> lattice::Result<bool> {
        Ok(marker_path(&ctx.workflow_dir, &self.id).exists())
    }

    async fn run(&self, ctx: &ModuleContext) -> lattice::Result<RunResult> {
        tokio::fs::create_dir_all(ctx.workflow_dir.join("markers")).await?;
        tokio::fs::write(marker_path(&ctx.workflow_dir, &self.id), b"done").await?;
        Ok(RunResult::completed("marker written"))
    }
}

fn marker_path(workflow_dir: &std::path::Path, id: &str) -> PathBuf {
    workflow_dir.join("markers").join(format!("{}.done", id))
}

fn mark_complete(workflow_dir: &std::path::Path, id: &str) {
    std::fs::create_dir_all(workflow_dir.join("markers")).unwrap();
    std::fs::write(marker_path(workflow_dir, id), b"done").unwrap();
}

struct Setup {
    engine: Engine,
    workflow_dir: PathBuf,
    artifacts: Arc<FsArtifactStore>,
    cancel: CancellationToken,
}

/// (module id, output artifacts)
fn setup(modules: &[(&str, Vec<ArtifactRef>)]) -> Setup {
    let workflow_dir =
        std::env::temp_dir().join(format!("lattice-e2e-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&workflow_dir).unwrap();

    let mut registry = ModuleRegistry::new();
    for (id, outputs) in modules {
        let id = id.to_string();
        let outputs = outputs.clone();
        registry.register(id.clone(), move |_| {
            Ok(Arc::new(MarkerModule {
                id: id.clone(),
                outputs: outputs.clone(),
            }) as Arc<dyn Module>)
        });
    }

    let artifacts = Arc::new(FsArtifactStore::new(workflow_dir.join("artifacts")));
    let engine = Engine::new(
        Arc::new(registry),
        Arc::new(JsonStateStore::for_workflow_dir(&workflow_dir)),
        artifacts.clone(),
        workflow_dir.clone(),
    );
    Setup {
        engine,
        workflow_dir,
        artifacts,
        cancel: CancellationToken::new(),
    }
}

fn linear_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("release")
        .with_module(ModuleRef::new("plan"))
        .with_module(ModuleRef::new("build").with_depends_on(["plan"]))
        .with_module(ModuleRef::new("deploy").with_depends_on(["build"]))
}

#[tokio::test]
async fn linear_workflow_with_out_of_band_completion() {
    let s = setup(&[
        ("plan", vec![]),
        ("build", vec![]),
        ("deploy", vec![]),
    ]);

    let state = s
        .engine
        .start(&s.cancel, StartRequest::new(linear_definition()))
        .await
        .unwrap();
    assert_eq!(state.runnable, vec!["plan"]);
    assert_eq!(state.status, EngineStatus::Running);

    // The plan module completes while no engine is watching
    mark_complete(&s.workflow_dir, "plan");

    let state = s
        .engine
        .resume(&s.cancel, ResumeRequest::default())
        .await
        .unwrap();
    assert_eq!(state.node("plan").unwrap().state, NodeState::Complete);
    assert_eq!(state.runnable, vec!["build"]);
    assert_eq!(state.status, EngineStatus::Running);
}

#[tokio::test]
async fn restart_preserves_run_identity_and_runnable() {
    let s = setup(&[
        ("plan", vec![]),
        ("build", vec![]),
        ("deploy", vec![]),
    ]);

    let started = s
        .engine
        .start(&s.cancel, StartRequest::new(linear_definition()))
        .await
        .unwrap();

    // A fresh process: new registry, new stores, same workflow directory
    let second_engine = {
        let mut registry = ModuleRegistry::new();
        for id in ["plan", "build", "deploy"] {
            let id = id.to_string();
            registry.register(id.clone(), move |_| {
                Ok(Arc::new(MarkerModule {
                    id: id.clone(),
                    outputs: vec![],
                }) as Arc<dyn Module>)
            });
        }
        Engine::for_workflow_dir(Arc::new(registry), &s.workflow_dir)
    };

    let resumed = second_engine
        .resume(&s.cancel, ResumeRequest::default())
        .await
        .unwrap();
    assert_eq!(resumed.run_id, started.run_id);
    assert_eq!(resumed.workflow_id, started.workflow_id);
    assert_eq!(resumed.runnable, started.runnable);
}

#[tokio::test]
async fn artifact_invalidation_reopens_completed_module() {
    let modules_artifact = ArtifactRef::new("MODULES", "Module list");
    let s = setup(&[("plan", vec![modules_artifact.clone()])]);

    let definition = WorkflowDefinition::new("release").with_module(ModuleRef::new("plan"));

    // plan is complete and owns its artifact
    mark_complete(&s.workflow_dir, "plan");
    s.artifacts
        .write(
            &modules_artifact,
            b"alpha\nbeta\n",
            ArtifactMetadata::new("MODULES", "plan", "1.0.0"),
        )
        .await
        .unwrap();

    let state = s
        .engine
        .start(&s.cancel, StartRequest::new(definition))
        .await
        .unwrap();
    assert_eq!(state.node("plan").unwrap().state, NodeState::Complete);
    assert_eq!(state.status, EngineStatus::Complete);

    // Another module overwrites the slot
    s.artifacts
        .write(
            &modules_artifact,
            b"alpha\nbeta\n",
            ArtifactMetadata::new("MODULES", "other", "1.0.0"),
        )
        .await
        .unwrap();

    let state = s
        .engine
        .update(&s.cancel, UpdateRequest::default())
        .await
        .unwrap();
    let plan = state.node("plan").unwrap();
    assert_eq!(plan.state, NodeState::Ready);
    assert_eq!(
        plan.artifacts.get("MODULES").unwrap().status,
        ArtifactStatus::Invalid
    );
    assert_eq!(state.runnable, vec!["plan"]);
}

#[tokio::test]
async fn parallel_limit_with_slot_costs() {
    let s = setup(&[
        ("plan", vec![]),
        ("build", vec![]),
        ("docs", vec![]),
    ]);
    let definition = WorkflowDefinition::new("release")
        .with_module(ModuleRef::new("plan"))
        .with_module(ModuleRef::new("build").with_depends_on(["plan"]))
        .with_module(ModuleRef::new("docs").with_depends_on(["plan"]))
        .with_max_parallel(1);

    mark_complete(&s.workflow_dir, "plan");
    s.engine
        .start(&s.cancel, StartRequest::new(definition))
        .await
        .unwrap();

    // Budget of one: a claim for two yields one
    let (items, _) = s
        .engine
        .claim(
            &s.cancel,
            ClaimRequest {
                limit: 2,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "build");

    // The budget is exhausted while build runs
    let (items, state) = s
        .engine
        .claim(&s.cancel, ClaimRequest::default())
        .await
        .unwrap();
    assert!(items.is_empty());
    // One representative skip, anchored to the first ready candidate and
    // naming the module that holds the slot
    let skip = state.skipped.values().next().unwrap();
    assert_eq!(skip.reason, SkipCode::Concurrency);
    assert!(skip.detail.contains("build"));

    // build finishes (marker plus report), freeing the slot for docs
    mark_complete(&s.workflow_dir, "build");
    s.engine
        .update(
            &s.cancel,
            UpdateRequest {
                results: vec![ModuleStatusUpdate::completed("build")],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (items, _) = s
        .engine
        .claim(
            &s.cancel,
            ClaimRequest {
                limit: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "docs");
}

#[tokio::test]
async fn manual_gate_holds_deploy_until_approved() {
    let s = setup(&[("plan", vec![]), ("deploy", vec![])]);
    let definition = WorkflowDefinition::new("release")
        .with_module(ModuleRef::new("plan"))
        .with_module(ModuleRef::new("deploy").with_depends_on(["plan"]));

    mark_complete(&s.workflow_dir, "plan");

    let mut gates = BTreeMap::new();
    gates.insert(
        "deploy".to_string(),
        ManualGate {
            required: true,
            approved: false,
            note: "SRE sign-off".to_string(),
        },
    );
    let state = s
        .engine
        .start(
            &s.cancel,
            StartRequest {
                definition,
                runtime: RuntimeOverrides {
                    manual_gates: Some(gates.clone()),
                    ..Default::default()
                },
            },
        )
        .await
        .unwrap();

    assert!(state.runnable.is_empty());
    let skip = state.skipped.get("deploy").unwrap();
    assert_eq!(skip.reason, SkipCode::ManualGate);
    assert_eq!(skip.detail, "SRE sign-off");

    // Approval flips the gate; deploy becomes runnable
    gates.get_mut("deploy").unwrap().approved = true;
    let state = s
        .engine
        .update(
            &s.cancel,
            UpdateRequest {
                results: Vec::new(),
                runtime: RuntimeOverrides {
                    manual_gates: Some(gates),
                    ..Default::default()
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(state.runnable, vec!["deploy"]);
    assert!(state.skipped.is_empty());
}

#[tokio::test]
async fn idempotent_update_only_moves_the_clock() {
    let s = setup(&[
        ("plan", vec![]),
        ("build", vec![]),
        ("deploy", vec![]),
    ]);
    s.engine
        .start(&s.cancel, StartRequest::new(linear_definition()))
        .await
        .unwrap();

    let first = s
        .engine
        .update(&s.cancel, UpdateRequest::default())
        .await
        .unwrap();
    let second = s
        .engine
        .update(&s.cancel, UpdateRequest::default())
        .await
        .unwrap();

    assert_eq!(first.run_id, second.run_id);
    assert_eq!(first.runnable, second.runnable);
    assert_eq!(first.status, second.status);
    assert_eq!(
        serde_json::to_value(&first.nodes).unwrap(),
        serde_json::to_value(&second.nodes).unwrap()
    );
    assert!(second.updated_at >= first.updated_at);
}
