// Lattice - multi-phase collaborative workflow engine
// Resolver + scheduler + persistent engine facade + event bridge

//! # Lattice Library
//!
//! This is the main library crate for Lattice, a workflow engine that drives
//! multi-phase collaborative runs in which each phase is an independently
//! pluggable **module** (an idempotent unit of work). This file serves as the
//! **library root** and defines the public API that external crates can use.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`WorkflowDefinition`]: Defines the modules of a run and their dependency graph
//! - [`Module`]: The contract every pluggable phase implements
//! - [`State`]: The durable run record persisted after every engine operation
//! - [`Event`]: An out-of-band notification posted by an external worker process
//!
//! ### Engine
//! - [`Resolver`]: Builds the dependency DAG and recomputes readiness from
//!   on-disk ground truth (completion checks + artifact validity)
//! - `runnable_batch`: Converts a resolver snapshot plus runtime constraints
//!   into a runnable batch (concurrency slots, exclusivity, manual gates)
//! - [`Engine`]: The persistent facade - `start` / `resume` / `update` /
//!   `claim` / `view` - that owns run identity and serializes the state file
//!
//! ### Event Bridge
//! - [`EventRouter`]: Validates, de-duplicates, and routes worker events to
//!   in-process subscribers keyed by module identity, with backlog buffering
//!   and bounded per-subscriber queues that preserve critical events
//! - [`BridgeServer`]: The HTTP ingress (`POST /events`, `GET /health`)
//!
//! ## Execution Model
//!
//! The engine does not execute modules itself. A supervising coordinator calls
//! `start` (or `resume`), receives a [`State`] with a runnable list, reserves
//! work with `claim`, executes the modules externally, and reports outcomes
//! with `update`. Every operation re-runs the resolver so completion is
//! recomputed from ground truth after any out-of-band change.

// Core domain models (module contract, workflow definition, run state, events)
pub mod models;

// Engine implementations (artifact store, resolver, scheduler, state store, facade)
pub mod engine;

// Event bridge (router, HTTP ingress, configuration)
pub mod bridge;

// Re-export core domain types for easy access
pub use models::{
    normalize_module_id, ArtifactInvalidation, ArtifactRef, ArtifactReport, ArtifactStatus,
    ConcurrencyProfile, EngineRuntime, EngineStatus, Event, ManualGate, Module, ModuleContext,
    ModuleInfo, ModuleRef, ModuleRegistry, ModuleRun, Node, NodeState, RunResult, RunStatus,
    RuntimeConfig, SkipCode, SkipReason, State, WorkItem, WorkflowDefinition, PROTOCOL_VERSION,
};

// Re-export engine types for convenience
pub use engine::{
    artifacts::{ArtifactMetadata, ArtifactStore, FsArtifactStore, InMemoryArtifactStore},
    core::{
        ClaimRequest, Engine, ModuleStatusUpdate, ResumeRequest, RuntimeOverrides, StartRequest,
        UpdateRequest,
    },
    resolver::Resolver,
    scheduler::{runnable_batch, RunnableBatch, RunnableRequest},
    storage::{InMemoryStateStore, JsonStateStore, StateStore},
};

// Re-export bridge types for convenience
pub use bridge::{
    config::BridgeConfig,
    router::{EventRouter, RouterConfig, Subscription},
    server::BridgeServer,
};

// Core error types
use thiserror::Error;

/// Custom error types for Lattice operations
#[derive(Error, Debug)]
pub enum LatticeError {
    /// Error when a workflow definition fails validation
    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// Error when a module id cannot be resolved through the registry
    #[error("Unknown module: {id}")]
    UnknownModule { id: String },

    /// Error when a dependency references an undeclared module instance
    #[error("Unknown dependency {dependency} declared by {instance}")]
    UnknownDependency { instance: String, dependency: String },

    /// Error when no persisted state exists for the workflow
    #[error("No persisted state found: {0}")]
    StateNotFound(String),

    /// Error raised by a module's completion check or execution
    #[error("Module {id} failed: {message}")]
    ModuleFailed { id: String, message: String },

    /// Error when an incoming bridge event fails validation
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Storage-related errors
    /// Using anyhow::Error for flexible error handling across storage backends
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LatticeError {
    /// True when the error is the distinguished "no persisted state" signal
    /// returned by `StateStore::load` for a fresh workflow directory.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LatticeError::StateNotFound(_))
    }
}

impl From<std::io::Error> for LatticeError {
    fn from(err: std::io::Error) -> Self {
        LatticeError::Storage(anyhow::Error::new(err))
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, LatticeError>;
