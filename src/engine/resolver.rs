// Resolver - dependency DAG construction and ground-truth readiness

//! # Resolver
//!
//! The resolver turns a normalized [`WorkflowDefinition`] into a graph of
//! [`Node`]s and keeps their readiness in sync with ground truth. It owns the
//! instantiated modules (one per instance, built through the registry at
//! construction) and the forward/reverse adjacency over instance ids.
//!
//! `refresh` is the heart of crash recovery: instead of trusting any recorded
//! state, it re-asks every module `is_complete` and re-validates declared
//! output artifacts, so completions and invalidations that happened while the
//! process was down are observed on the next engine operation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::models::{
    ArtifactInvalidation, Module, ModuleContext, ModuleRegistry, Node, NodeState,
    WorkflowDefinition,
};
use crate::engine::artifacts::evaluate_artifact;
use crate::{LatticeError, Result};

/// Dependency resolver over a workflow definition
///
/// Nodes are kept in declaration order; every query that returns multiple
/// nodes is deterministic given a fixed definition.
pub struct Resolver {
    definition: WorkflowDefinition,
    modules: HashMap<String, Arc<dyn Module>>,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl Resolver {
    /// Build the resolver: instantiate every module exactly once, wire
    /// forward dependencies from the graph, and derive sorted dependents.
    ///
    /// The definition is expected to be normalized; dependency references to
    /// undeclared instances are rejected here as well so a hand-built
    /// definition cannot corrupt the graph.
    pub fn new(definition: &WorkflowDefinition, registry: &ModuleRegistry) -> Result<Self> {
        let mut modules: HashMap<String, Arc<dyn Module>> = HashMap::new();
        let mut nodes: Vec<Node> = Vec::with_capacity(definition.modules.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        let declared: HashSet<&str> = definition
            .modules
            .iter()
            .map(|m| m.instance_id())
            .collect();

        for reference in &definition.modules {
            let instance_id = reference.instance_id().to_string();
            let module = registry.instantiate(reference)?;
            let info = module.info();

            let depends_on: Vec<String> = definition.dependencies_of(&instance_id).to_vec();
            for dep in &depends_on {
                if !declared.contains(dep.as_str()) {
                    return Err(LatticeError::UnknownDependency {
                        instance: instance_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }

            let name = if reference.name.is_empty() {
                info.name.clone()
            } else {
                reference.name.clone()
            };

            let node = Node {
                id: instance_id.clone(),
                module_id: reference.module.clone(),
                name,
                description: reference.description.clone(),
                optional: reference.optional,
                state: NodeState::Unknown,
                depends_on,
                dependents: Vec::new(),
                blocked_by: Vec::new(),
                error: None,
                concurrency: info.concurrency.clone(),
                artifacts: Default::default(),
            };

            index.insert(instance_id.clone(), nodes.len());
            nodes.push(node);
            modules.insert(instance_id, module);
        }

        // Reverse adjacency, sorted for deterministic output
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for node in &nodes {
            for dep in &node.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }
        for node in &mut nodes {
            if let Some(mut deps) = dependents.remove(&node.id) {
                deps.sort();
                node.dependents = deps;
            }
        }

        Ok(Self {
            definition: definition.clone(),
            modules,
            nodes,
            index,
        })
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, instance_id: &str) -> Option<&Node> {
        self.index.get(instance_id).map(|&i| &self.nodes[i])
    }

    pub fn module(&self, instance_id: &str) -> Option<&Arc<dyn Module>> {
        self.modules.get(instance_id)
    }

    /// Recompute every node's readiness from ground truth
    ///
    /// Pass one asks each module `is_complete` and, for complete nodes,
    /// validates declared outputs against the artifact store (downgrading to
    /// `Pending` on `Outdated`/`Invalid` and notifying the module once per
    /// offending artifact). Pass two derives `Ready`/`Blocked` for the
    /// remaining pending nodes from their dependencies.
    pub async fn refresh(&mut self, ctx: &ModuleContext) -> Result<()> {
        // Pass 1: completion + artifact validity
        for i in 0..self.nodes.len() {
            let instance_id = self.nodes[i].id.clone();
            let module = self.modules[&instance_id].clone();

            self.nodes[i].error = None;
            self.nodes[i].blocked_by.clear();
            self.nodes[i].artifacts.clear();

            let complete = match module.is_complete(ctx).await {
                Ok(complete) => complete,
                Err(err) => {
                    warn!(instance = %instance_id, error = %err, "completion check failed");
                    self.nodes[i].state = NodeState::Error;
                    self.nodes[i].error = Some(err.to_string());
                    continue;
                }
            };

            if !complete {
                self.nodes[i].state = NodeState::Pending;
                continue;
            }

            self.nodes[i].state = NodeState::Complete;
            self.evaluate_outputs(i, module.as_ref(), ctx).await?;
        }

        // Pass 2: readiness from dependencies
        let states: HashMap<String, NodeState> = self
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.state))
            .collect();
        for node in &mut self.nodes {
            if node.state != NodeState::Pending {
                continue;
            }
            let incomplete: Vec<String> = node
                .depends_on
                .iter()
                .filter(|dep| states.get(dep.as_str()) != Some(&NodeState::Complete))
                .cloned()
                .collect();
            if incomplete.is_empty() {
                node.state = NodeState::Ready;
            } else {
                node.state = NodeState::Blocked;
                node.blocked_by = incomplete;
            }
        }

        debug!(
            ready = self.ready().len(),
            total = self.nodes.len(),
            "resolver refreshed"
        );
        Ok(())
    }

    /// Validate the declared outputs of a complete node, downgrading it to
    /// `Pending` when any output is `Outdated` or `Invalid`.
    async fn evaluate_outputs(
        &mut self,
        node_index: usize,
        module: &dyn Module,
        ctx: &ModuleContext,
    ) -> Result<()> {
        let outputs = module.outputs();
        if outputs.is_empty() {
            return Ok(());
        }

        let instance_id = self.nodes[node_index].id.clone();
        let module_id = self.nodes[node_index].module_id.clone();

        let fingerprints = match module.artifact_fingerprints(ctx).await {
            Ok(fingerprints) => fingerprints,
            Err(err) => {
                warn!(instance = %instance_id, error = %err, "fingerprint computation failed");
                self.nodes[node_index].state = NodeState::Error;
                self.nodes[node_index].error = Some(err.to_string());
                return Ok(());
            }
        };

        let mut downgrade = false;
        for output in outputs {
            let metadata = ctx.artifacts.metadata(&output.id).await?;
            let stored = metadata.is_some() || ctx.artifacts.exists(&output.id).await?;
            let report = evaluate_artifact(
                &module_id,
                fingerprints.get(&output.id).map(String::as_str),
                metadata.as_ref(),
                stored,
            );

            if report.status.invalidates() {
                downgrade = true;
                let invalidation = ArtifactInvalidation {
                    artifact_id: output.id.clone(),
                    status: report.status,
                    expected_fingerprint: report.expected_fingerprint.clone(),
                    stored_fingerprint: report.stored_fingerprint.clone(),
                };
                debug!(
                    instance = %instance_id,
                    artifact = %output.id,
                    status = %report.status,
                    "output artifact invalidated"
                );
                if let Err(err) = module.on_artifact_invalidation(ctx, &invalidation).await {
                    warn!(instance = %instance_id, artifact = %output.id, error = %err,
                        "artifact invalidation hook failed");
                }
            }

            self.nodes[node_index].artifacts.insert(output.id, report);
        }

        if downgrade {
            self.nodes[node_index].state = NodeState::Pending;
        }
        Ok(())
    }

    /// Candidate execution queue: depth-first from each target (defaulting to
    /// every node in declaration order), dependencies before dependents,
    /// complete nodes skipped. Unknown target ids are ignored.
    pub fn queue(&self, targets: &[String]) -> Vec<String> {
        let roots: Vec<String> = if targets.is_empty() {
            self.nodes.iter().map(|n| n.id.clone()).collect()
        } else {
            targets.to_vec()
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut out: Vec<String> = Vec::new();
        for root in roots {
            self.visit(&root, &mut visited, &mut out);
        }
        out
    }

    fn visit(&self, instance_id: &str, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        let node = match self.node(instance_id) {
            Some(node) => node,
            None => return,
        };
        if !visited.insert(instance_id.to_string()) {
            return;
        }
        for dep in &node.depends_on {
            self.visit(dep, visited, out);
        }
        if node.state != NodeState::Complete {
            out.push(instance_id.to_string());
        }
    }

    /// Ready nodes in declaration order
    pub fn ready(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Ready)
            .collect()
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("workflow", &self.definition.id)
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
