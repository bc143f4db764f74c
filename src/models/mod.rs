// Core domain models for Lattice
// These are the engine-agnostic data structures shared by every subsystem

//! # Domain Models Module
//!
//! This module contains the core domain models for Lattice:
//!
//! - `module`: the pluggable-module contract (info, concurrency profile,
//!   completion check, execution entry point, artifact fingerprints) plus the
//!   factory-based registry the resolver instantiates modules through
//! - `workflow`: the immutable workflow definition (module references and the
//!   dependency graph) with normalization and validation
//! - `state`: the durable run record - node readiness, runtime overlay,
//!   module-run history, and the engine status machine
//! - `event`: the out-of-band event schema consumed by the bridge

pub mod event;
pub mod module;
pub mod state;
pub mod workflow;

// Re-export main types for convenience
pub use event::{normalize_module_id, Event, PROTOCOL_VERSION};
pub use module::{
    ArtifactInvalidation, ArtifactRef, ConcurrencyProfile, Module, ModuleContext, ModuleInfo,
    ModuleRegistry, RunResult, RunStatus,
};
pub use state::{
    ArtifactReport, ArtifactStatus, EngineRuntime, EngineStatus, ManualGate, ModuleRun, Node,
    NodeState, SkipCode, SkipReason, State, WorkItem,
};
pub use workflow::{ModuleRef, RuntimeConfig, WorkflowDefinition};
