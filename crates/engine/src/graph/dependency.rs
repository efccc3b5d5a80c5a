//! Component -> runnable dependency graph.
//!
//! Edges are derived, never authored: they come from resolving each runnable's bindings. The
//! graph keeps, per runnable, the bindings it resolved last so a single runnable can be
//! re-linked after an edit without rescanning the others.

use std::collections::{BTreeSet, HashMap, VecDeque};

use indexmap::{IndexMap, IndexSet};
use runboard_types::Runnable;
use tracing::{debug, warn};

use crate::error::{DanglingReference, GraphError, ResolutionWarning};
use crate::graph::bindings::{self, ResolvedBindings};

/// Dependency graph over the runnables of an app.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    runnables: IndexMap<String, Runnable>,
    bindings: IndexMap<String, ResolvedBindings>,
    components: IndexSet<String>,
    /// Component ID -> runnables reading from it. Kept for absent components too so that
    /// dangling references can be reported and re-linked when the component comes back.
    readers: HashMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    /// Builds the graph in a single pass over every runnable's fields.
    ///
    /// Runnable names are registered as component IDs because runnables publish outputs.
    pub fn build(runnables: impl IntoIterator<Item = Runnable>, component_ids: impl IntoIterator<Item = String>) -> Result<Self, GraphError> {
        let mut graph = Self {
            components: component_ids.into_iter().collect(),
            ..Self::default()
        };

        for runnable in runnables {
            if graph.runnables.contains_key(&runnable.name) {
                return Err(GraphError::duplicate_runnable(runnable.name));
            }
            graph.components.insert(runnable.name.clone());
            graph.runnables.insert(runnable.name.clone(), runnable);
        }

        let names: Vec<String> = graph.runnables.keys().cloned().collect();
        for name in names {
            graph.link(&name);
        }

        debug!(
            runnables = graph.runnables.len(),
            components = graph.components.len(),
            "dependency graph built"
        );
        Ok(graph)
    }

    /// Runnables to refresh after `component_id` changed.
    ///
    /// Includes readers of the component and, when the component is itself a runnable, the
    /// runnables it forces through `recomputeIds`. Empty when the component is unknown.
    pub fn on_component_changed(&self, component_id: &str) -> BTreeSet<String> {
        if !self.components.contains(component_id) {
            return BTreeSet::new();
        }

        let mut dependents = self.readers.get(component_id).cloned().unwrap_or_default();
        if let Some(bindings) = self.bindings.get(component_id) {
            dependents.extend(
                bindings
                    .recompute_targets
                    .iter()
                    .filter(|target| self.runnables.contains_key(*target))
                    .cloned(),
            );
        }
        dependents
    }

    /// Re-resolves the edges of one runnable from its current definition.
    pub fn rebuild_incremental(&mut self, runnable_name: &str) -> Result<&ResolvedBindings, GraphError> {
        if !self.runnables.contains_key(runnable_name) {
            return Err(GraphError::unknown_runnable(runnable_name));
        }
        self.unlink(runnable_name);
        self.link(runnable_name);
        self.bindings
            .get(runnable_name)
            .ok_or_else(|| GraphError::unknown_runnable(runnable_name))
    }

    /// Applies an editor mutation to a runnable and re-links it before returning.
    ///
    /// The runnable keeps its name; renames go through remove + insert.
    pub fn edit_runnable<F>(&mut self, runnable_name: &str, edit: F) -> Result<&ResolvedBindings, GraphError>
    where
        F: FnOnce(&mut Runnable),
    {
        let runnable = self
            .runnables
            .get_mut(runnable_name)
            .ok_or_else(|| GraphError::unknown_runnable(runnable_name))?;
        edit(runnable);
        runnable.name = runnable_name.to_string();
        self.rebuild_incremental(runnable_name)
    }

    /// Inserts a new runnable or replaces an existing definition with the same name.
    pub fn upsert_runnable(&mut self, runnable: Runnable) -> &ResolvedBindings {
        let name = runnable.name.clone();
        if self.runnables.contains_key(&name) {
            self.unlink(&name);
        }
        self.components.insert(name.clone());
        self.runnables.insert(name.clone(), runnable);
        self.link(&name);
        &self.bindings[&name]
    }

    /// Removes a runnable together with every edge it contributed and its output component.
    pub fn remove_runnable(&mut self, runnable_name: &str) -> Option<Runnable> {
        if !self.runnables.contains_key(runnable_name) {
            return None;
        }
        self.unlink(runnable_name);
        self.bindings.shift_remove(runnable_name);
        self.components.shift_remove(runnable_name);
        self.runnables.shift_remove(runnable_name)
    }

    /// Registers a component supplied by the rendering layer.
    pub fn add_component(&mut self, component_id: impl Into<String>) {
        self.components.insert(component_id.into());
    }

    /// Removes a component. Bindings that still point at it become dangling references.
    ///
    /// Returns the removed runnable when the component was one.
    pub fn remove_component(&mut self, component_id: &str) -> Option<Runnable> {
        let removed_runnable = self.remove_runnable(component_id);
        self.components.shift_remove(component_id);
        removed_runnable
    }

    pub fn contains_component(&self, component_id: &str) -> bool {
        self.components.contains(component_id)
    }

    pub fn component_ids(&self) -> impl Iterator<Item = &String> {
        self.components.iter()
    }

    pub fn runnable(&self, runnable_name: &str) -> Option<&Runnable> {
        self.runnables.get(runnable_name)
    }

    pub fn runnables(&self) -> impl Iterator<Item = &Runnable> {
        self.runnables.values()
    }

    pub fn bindings(&self, runnable_name: &str) -> Option<&ResolvedBindings> {
        self.bindings.get(runnable_name)
    }

    /// Resolution warnings of every runnable, in authoring order.
    pub fn warnings(&self) -> Vec<&ResolutionWarning> {
        self.bindings.values().flat_map(|bindings| bindings.warnings.iter()).collect()
    }

    /// Bindings of `runnable_name` that point at components missing from the graph.
    pub fn dangling_references_for(&self, runnable_name: &str) -> Vec<DanglingReference> {
        let Some(bindings) = self.bindings.get(runnable_name) else {
            return Vec::new();
        };

        let mut dangling: Vec<DanglingReference> = bindings
            .dependencies
            .iter()
            .filter(|(component_id, _)| !self.components.contains(*component_id))
            .flat_map(|(component_id, sites)| {
                sites.iter().map(move |site| DanglingReference {
                    runnable: runnable_name.to_string(),
                    field: site.field.clone(),
                    component_id: component_id.clone(),
                })
            })
            .collect();

        dangling.extend(
            bindings
                .recompute_targets
                .iter()
                .filter(|target| !self.runnables.contains_key(*target))
                .map(|target| DanglingReference {
                    runnable: runnable_name.to_string(),
                    field: "recomputeIds".to_string(),
                    component_id: target.clone(),
                }),
        );
        dangling
    }

    /// Every dangling reference in the graph.
    pub fn dangling_references(&self) -> Vec<DanglingReference> {
        self.runnables
            .keys()
            .flat_map(|runnable_name| self.dangling_references_for(runnable_name))
            .collect()
    }

    /// Orders runnables so that every runnable comes after the runnables it reads from.
    ///
    /// Ties keep authoring order. Returns an error naming the runnables involved in a cycle.
    pub fn refresh_order(&self) -> Result<Vec<String>, GraphError> {
        let mut in_degrees: IndexMap<&str, usize> = self.runnables.keys().map(|name| (name.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, BTreeSet<&str>> = HashMap::new();

        for name in self.runnables.keys() {
            for dependent in self.on_component_changed(name) {
                let Some((dependent, _)) = self.runnables.get_key_value(&dependent) else {
                    continue;
                };
                let dependent = dependent.as_str();
                if adjacency.entry(name.as_str()).or_default().insert(dependent)
                    && let Some(degree) = in_degrees.get_mut(dependent)
                {
                    *degree += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degrees
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut ordered = Vec::with_capacity(self.runnables.len());
        while let Some(name) = queue.pop_front() {
            ordered.push(name.to_string());
            let Some(children) = adjacency.get(name) else {
                continue;
            };
            for child in children {
                if let Some(degree) = in_degrees.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }

        if ordered.len() != self.runnables.len() {
            let mut members: Vec<String> = in_degrees
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(name, _)| name.to_string())
                .collect();
            members.sort();
            return Err(GraphError::Cycle { members });
        }

        Ok(ordered)
    }

    fn link(&mut self, runnable_name: &str) {
        let Some(runnable) = self.runnables.get(runnable_name) else {
            return;
        };
        let resolved = bindings::resolve(runnable);

        for warning in &resolved.warnings {
            warn!(runnable = %warning.runnable, field = %warning.field, "binding resolution warning: {}", warning.message);
        }
        for component_id in resolved.dependencies.keys() {
            self.readers
                .entry(component_id.clone())
                .or_default()
                .insert(runnable_name.to_string());
        }

        self.bindings.insert(runnable_name.to_string(), resolved);
    }

    fn unlink(&mut self, runnable_name: &str) {
        let Some(previous) = self.bindings.get(runnable_name) else {
            return;
        };
        for component_id in previous.dependencies.keys() {
            if let Some(readers) = self.readers.get_mut(component_id) {
                readers.remove(runnable_name);
                if readers.is_empty() {
                    self.readers.remove(component_id);
                }
            }
        }
    }
}
