// Scheduler - admission of ready nodes under runtime constraints

//! # Scheduler
//!
//! The scheduler converts a resolver snapshot plus the runtime overlay into a
//! [`RunnableBatch`]: the nodes the coordinator may claim right now, and a
//! skip map explaining every withheld candidate.
//!
//! Admission honors, in order:
//! 1. a global short-circuit when the running set already exhausts the
//!    parallel budget or contains an exclusive module
//! 2. per-node conditions: already claimed, not ready, manual gate,
//!    exclusivity, slot arithmetic against `max_parallel`
//! 3. the `batch_size` cap on admitted nodes
//!
//! Output order is the queue's dependency-first declaration order; for a
//! fixed (snapshot, request) pair the result is deterministic.

use std::collections::BTreeMap;

use crate::engine::resolver::Resolver;
use crate::models::{EngineRuntime, ManualGate, NodeState, SkipCode, SkipReason};

/// Runtime constraints for one scheduling decision
#[derive(Debug, Clone, Default)]
pub struct RunnableRequest {
    /// Narrow scheduling to these instance ids (empty = every node)
    pub targets: Vec<String>,
    /// Cap on nodes admitted per batch; 0 means no cap
    pub batch_size: u64,
    /// Parallel slot budget; 0 means unlimited
    pub max_parallel: i64,
    /// Instance ids currently claimed
    pub running: Vec<String>,
    pub manual_gates: BTreeMap<String, ManualGate>,
}

impl RunnableRequest {
    /// Borrow the scheduling-relevant fields out of the persisted runtime
    pub fn from_runtime(runtime: &EngineRuntime) -> Self {
        Self {
            targets: runtime.targets.clone(),
            batch_size: runtime.batch_size,
            max_parallel: runtime.max_parallel,
            running: runtime.running.clone(),
            manual_gates: runtime.manual_gates.clone(),
        }
    }
}

/// The scheduler's decision: admitted instance ids plus skip explanations
#[derive(Debug, Clone, Default)]
pub struct RunnableBatch {
    /// Admitted instance ids in queue order
    pub nodes: Vec<String>,
    pub skipped: BTreeMap<String, SkipReason>,
}

/// Slot usage of the currently-running set
#[derive(Debug, Default)]
struct RunningInventory {
    slots: u64,
    exclusive_id: Option<String>,
}

fn running_inventory(resolver: &Resolver, running: &[String]) -> RunningInventory {
    let mut inventory = RunningInventory::default();
    for id in running {
        if let Some(node) = resolver.node(id) {
            inventory.slots += u64::from(node.concurrency.slot_cost());
            if node.concurrency.exclusive && inventory.exclusive_id.is_none() {
                inventory.exclusive_id = Some(id.clone());
            }
        }
    }
    inventory
}

/// Compute the runnable batch for a refreshed resolver snapshot
pub fn runnable_batch(resolver: &Resolver, request: &RunnableRequest) -> RunnableBatch {
    let queue = resolver.queue(&request.targets);
    let inventory = running_inventory(resolver, &request.running);
    let max_parallel = request.max_parallel.max(0) as u64;

    let mut batch = RunnableBatch::default();

    // Global short-circuits: nothing is admissible while the running set
    // exhausts the budget. One representative skip reason is attached to the
    // first ready candidate so callers can surface why the batch is empty.
    let first_ready = queue
        .iter()
        .find(|id| {
            resolver
                .node(id)
                .map(|n| n.state == NodeState::Ready)
                .unwrap_or(false)
        })
        .cloned();

    if max_parallel > 0 && inventory.slots >= max_parallel {
        if let Some(anchor) = first_ready {
            let detail = format!(
                "parallel limit reached ({}/{} slots in use by {})",
                inventory.slots,
                max_parallel,
                request.running.join(", ")
            );
            batch
                .skipped
                .insert(anchor, SkipReason::new(SkipCode::Concurrency, detail));
        }
        return batch;
    }
    if let Some(exclusive_id) = &inventory.exclusive_id {
        if let Some(anchor) = first_ready {
            let detail = format!("{} requires exclusive execution", exclusive_id);
            batch
                .skipped
                .insert(anchor, SkipReason::new(SkipCode::Concurrency, detail));
        }
        return batch;
    }

    let mut batch_slots: u64 = 0;
    for id in queue {
        if request.batch_size > 0 && batch.nodes.len() as u64 >= request.batch_size {
            break;
        }
        let node = match resolver.node(&id) {
            Some(node) => node,
            None => continue,
        };

        if request.running.iter().any(|r| r == &id) {
            batch
                .skipped
                .insert(id, SkipReason::new(SkipCode::Active, "already claimed"));
            continue;
        }
        if node.state != NodeState::Ready {
            batch.skipped.insert(
                id,
                SkipReason::new(SkipCode::NotReady, format!("state: {}", node.state)),
            );
            continue;
        }
        if let Some(gate) = request.manual_gates.get(&id) {
            if gate.blocks() {
                let detail = if gate.note.is_empty() {
                    "awaiting manual approval".to_string()
                } else {
                    gate.note.clone()
                };
                batch
                    .skipped
                    .insert(id, SkipReason::new(SkipCode::ManualGate, detail));
                continue;
            }
        }

        let cost = u64::from(node.concurrency.slot_cost());
        if node.concurrency.exclusive && (inventory.slots > 0 || batch_slots > 0) {
            batch.skipped.insert(
                id,
                SkipReason::new(SkipCode::Concurrency, "requires exclusive execution"),
            );
            continue;
        }
        if max_parallel > 0 && inventory.slots + batch_slots + cost > max_parallel {
            let detail = format!(
                "parallel limit reached ({} running, {} batched, limit {})",
                inventory.slots, batch_slots, max_parallel
            );
            batch
                .skipped
                .insert(id, SkipReason::new(SkipCode::Concurrency, detail));
            continue;
        }

        let exclusive = node.concurrency.exclusive;
        batch.nodes.push(id);
        batch_slots += cost;
        if exclusive {
            // An exclusive node owns the whole budget: close the batch
            break;
        }
    }

    batch
}
