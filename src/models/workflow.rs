// Workflow definitions - the immutable description of a run

//! # Workflow Definitions
//!
//! A [`WorkflowDefinition`] is the immutable specification of a run: an
//! ordered list of module references, a dependency graph over their instance
//! ids, opaque metadata, and runtime configuration. The engine clones the
//! definition into the persisted state on `start` and never mutates it
//! afterwards.
//!
//! ## Normalization
//!
//! Loaders may leave instance ids unset and declare dependencies inline on
//! the module reference. [`WorkflowDefinition::normalize`] produces the
//! canonical form the engine operates on:
//! - instance ids default to the module id
//! - inline `depends_on` entries are merged into the graph
//! - negative `max_parallel` clamps to zero (zero means unlimited)
//!
//! ## Validation
//!
//! Validation enforces the structural invariants the resolver assumes:
//! no duplicate instance ids, every dependency resolves to a declared
//! instance, and the graph is acyclic.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{LatticeError, Result};

/// A module instance within a workflow
///
/// `id` is the workflow-local instance id; it defaults to the module id
/// during normalization, so a workflow may run the same module twice under
/// distinct instance ids. `config` is opaque to the engine and handed to the
/// module factory verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleRef {
    #[serde(default)]
    pub id: String,
    pub module: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub optional: bool,
}

impl ModuleRef {
    pub fn new<S: Into<String>>(module: S) -> Self {
        let module = module.into();
        Self {
            id: String::new(),
            module,
            name: String::new(),
            description: String::new(),
            depends_on: Vec::new(),
            config: BTreeMap::new(),
            optional: false,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Instance id, falling back to the module id when unset
    pub fn instance_id(&self) -> &str {
        if self.id.is_empty() {
            &self.module
        } else {
            &self.id
        }
    }
}

/// Runtime configuration carried by the definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Parallel slot budget; 0 means unlimited
    #[serde(default)]
    pub max_parallel: i64,
}

/// Immutable specification of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub modules: Vec<ModuleRef>,
    /// Forward adjacency: instance id -> dependency instance ids
    #[serde(default)]
    pub graph: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl WorkflowDefinition {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            modules: Vec::new(),
            graph: BTreeMap::new(),
            metadata: BTreeMap::new(),
            runtime: RuntimeConfig::default(),
        }
    }

    pub fn with_module(mut self, module: ModuleRef) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: i64) -> Self {
        self.runtime.max_parallel = max_parallel;
        self
    }

    /// Look up a module reference by instance id
    pub fn module_ref(&self, instance_id: &str) -> Option<&ModuleRef> {
        self.modules.iter().find(|m| m.instance_id() == instance_id)
    }

    /// Declared instance ids in declaration order
    pub fn instance_ids(&self) -> Vec<String> {
        self.modules
            .iter()
            .map(|m| m.instance_id().to_string())
            .collect()
    }

    /// Dependencies of an instance according to the normalized graph
    pub fn dependencies_of(&self, instance_id: &str) -> &[String] {
        self.graph
            .get(instance_id)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }

    /// Produce the canonical definition the engine operates on
    ///
    /// Clones the definition, fills unset instance ids, merges inline
    /// `depends_on` lists into the graph (deduplicated, declaration order
    /// preserved), clamps negative `max_parallel` to zero, and validates the
    /// result.
    pub fn normalize(&self) -> Result<WorkflowDefinition> {
        let mut normalized = self.clone();

        for module in &mut normalized.modules {
            if module.id.is_empty() {
                module.id = module.module.clone();
            }
        }

        // Merge inline dependencies into the graph
        for module in &normalized.modules {
            let entry = normalized.graph.entry(module.id.clone()).or_default();
            for dep in &module.depends_on {
                if !entry.contains(dep) {
                    entry.push(dep.clone());
                }
            }
        }

        if normalized.runtime.max_parallel < 0 {
            normalized.runtime.max_parallel = 0;
        }

        normalized.validate()?;
        Ok(normalized)
    }

    /// Validate the structural invariants the resolver assumes
    ///
    /// - no duplicate module instance ids
    /// - every graph key and every dependency resolves to a declared instance
    /// - the dependency graph is acyclic
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(LatticeError::InvalidDefinition(
                "workflow id must not be empty".to_string(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for module in &self.modules {
            if module.module.trim().is_empty() {
                return Err(LatticeError::InvalidDefinition(format!(
                    "module reference {} has no module id",
                    module.instance_id()
                )));
            }
            if !seen.insert(module.instance_id()) {
                return Err(LatticeError::InvalidDefinition(format!(
                    "duplicate module instance id: {}",
                    module.instance_id()
                )));
            }
        }

        for (instance, deps) in &self.graph {
            if !seen.contains(instance.as_str()) {
                return Err(LatticeError::InvalidDefinition(format!(
                    "graph entry references undeclared instance: {}",
                    instance
                )));
            }
            for dep in deps {
                if !seen.contains(dep.as_str()) {
                    return Err(LatticeError::UnknownDependency {
                        instance: instance.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        for module in &self.modules {
            for dep in &module.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(LatticeError::UnknownDependency {
                        instance: module.instance_id().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Depth-first cycle detection over the dependency graph
    fn check_acyclic(&self) -> Result<()> {
        const IN_PROGRESS: u8 = 1;
        const DONE: u8 = 2;

        fn visit(
            id: &str,
            definition: &WorkflowDefinition,
            marks: &mut BTreeMap<String, u8>,
        ) -> Result<()> {
            match marks.get(id).copied() {
                Some(DONE) => return Ok(()),
                Some(IN_PROGRESS) => {
                    return Err(LatticeError::InvalidDefinition(format!(
                        "dependency cycle involving {}",
                        id
                    )))
                }
                _ => {}
            }
            marks.insert(id.to_string(), IN_PROGRESS);
            for dep in definition.dependencies_of(id) {
                visit(dep, definition, marks)?;
            }
            marks.insert(id.to_string(), DONE);
            Ok(())
        }

        let mut marks: BTreeMap<String, u8> = BTreeMap::new();
        for id in self.instance_ids() {
            visit(&id, self, &mut marks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("release")
            .with_module(ModuleRef::new("plan"))
            .with_module(ModuleRef::new("build").with_depends_on(["plan"]))
            .with_module(ModuleRef::new("deploy").with_depends_on(["build"]))
    }

    #[test]
    fn normalize_fills_instance_ids_and_graph() {
        let normalized = linear_definition().normalize().unwrap();
        assert_eq!(normalized.instance_ids(), vec!["plan", "build", "deploy"]);
        assert_eq!(normalized.dependencies_of("build"), ["plan"]);
        assert_eq!(normalized.dependencies_of("deploy"), ["build"]);
        assert!(normalized.dependencies_of("plan").is_empty());
    }

    #[test]
    fn normalize_clamps_negative_max_parallel() {
        let normalized = linear_definition()
            .with_max_parallel(-3)
            .normalize()
            .unwrap();
        assert_eq!(normalized.runtime.max_parallel, 0);
    }

    #[test]
    fn normalize_keeps_explicit_instance_ids() {
        let definition = WorkflowDefinition::new("twice")
            .with_module(ModuleRef::new("plan").with_id("plan-a"))
            .with_module(ModuleRef::new("plan").with_id("plan-b"));
        let normalized = definition.normalize().unwrap();
        assert_eq!(normalized.instance_ids(), vec!["plan-a", "plan-b"]);
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let definition = WorkflowDefinition::new("dup")
            .with_module(ModuleRef::new("plan"))
            .with_module(ModuleRef::new("plan"));
        let err = definition.normalize().unwrap_err();
        assert!(matches!(err, LatticeError::InvalidDefinition(_)));
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let definition = WorkflowDefinition::new("missing")
            .with_module(ModuleRef::new("build").with_depends_on(["plan"]));
        let err = definition.normalize().unwrap_err();
        assert!(matches!(
            err,
            LatticeError::UnknownDependency { instance, dependency }
                if instance == "build" && dependency == "plan"
        ));
    }

    #[test]
    fn validate_rejects_cycles() {
        let definition = WorkflowDefinition::new("loop")
            .with_module(ModuleRef::new("a").with_depends_on(["b"]))
            .with_module(ModuleRef::new("b").with_depends_on(["a"]));
        let err = definition.normalize().unwrap_err();
        assert!(matches!(err, LatticeError::InvalidDefinition(_)));
    }

    #[test]
    fn definition_round_trips_through_json() {
        let normalized = linear_definition().normalize().unwrap();
        let json = serde_json::to_string(&normalized).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_ids(), normalized.instance_ids());
        assert_eq!(back.graph, normalized.graph);
    }
}
