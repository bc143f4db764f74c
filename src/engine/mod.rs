// Engine implementations - artifact store, resolver, scheduler, persistence, facade

//! # Engine Module
//!
//! The execution side of Lattice. Layered bottom-up:
//!
//! - `artifacts`: content lookup and metadata for durable named artifacts,
//!   including the fingerprint notes the resolver compares against
//! - `resolver`: builds the dependency DAG from a workflow definition and
//!   recomputes per-node readiness from ground truth on every refresh
//! - `scheduler`: turns a resolver snapshot plus runtime constraints into a
//!   runnable batch (concurrency slots, exclusivity, manual gates, targets)
//! - `storage`: the persistent state store (single JSON document, atomic
//!   replace)
//! - `core`: the [`core::Engine`] facade composing all of the above behind
//!   `start` / `resume` / `update` / `claim` / `view`

pub mod artifacts;
pub mod core;
pub mod resolver;
pub mod scheduler;
pub mod storage;
