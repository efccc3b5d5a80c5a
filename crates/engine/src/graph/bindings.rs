//! Binding resolution.
//!
//! Runnables declare their inputs as field configurations. This module walks those fields and
//! extracts every component the runnable reads from: plain connections, expression
//! connections, and inline-script refresh triggers. Only the selected branch of a `oneOf`
//! configuration is walked; unselected alternatives are inert.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use runboard_types::{ConnectionSpec, EvalConnection, FieldConfiguration, Runnable};

use crate::error::ResolutionWarning;

/// Resolves the components a runnable depends on.
///
/// Pure function: the result only depends on the runnable definition. Malformed bindings do
/// not abort resolution; they contribute nothing and are reported as warnings.
pub fn resolve(runnable: &Runnable) -> ResolvedBindings {
    let mut resolver = BindingResolver::new(runnable);
    resolver.visit_fields("fields", &runnable.fields);
    resolver.visit_refresh_triggers();
    resolver.collect_recompute_targets();
    resolver.finish()
}

/// Output of [`resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedBindings {
    pub runnable: String,
    /// Component ID -> every place in the runnable that reads from it, in authoring order.
    pub dependencies: IndexMap<String, Vec<BindingSite>>,
    /// Runnables this runnable forces to recompute after it finishes (`recomputeIds`).
    pub recompute_targets: Vec<String>,
    pub warnings: Vec<ResolutionWarning>,
}

impl ResolvedBindings {
    /// Set of component IDs this runnable depends on.
    pub fn component_ids(&self) -> BTreeSet<&str> {
        self.dependencies.keys().map(String::as_str).collect()
    }

    pub fn depends_on(&self, component_id: &str) -> bool {
        self.dependencies.contains_key(component_id)
    }
}

/// Location of a single binding inside a runnable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSite {
    /// Dotted field location, for example `fields.source.x.query`.
    pub field: String,
    pub kind: BindingKind,
}

/// How a binding reads from its component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingKind {
    /// `connected` field reading `path` (output key plus optional JSON path).
    Connection { path: String },
    /// Connection declared by an `evalv2` or `templatev2` expression.
    Expression { output: String },
    /// Inline script `refreshOn` entry.
    RefreshTrigger { output: String },
}

struct BindingResolver<'runnable> {
    runnable: &'runnable Runnable,
    dependencies: IndexMap<String, Vec<BindingSite>>,
    warnings: Vec<ResolutionWarning>,
    recompute_targets: Vec<String>,
}

impl<'runnable> BindingResolver<'runnable> {
    fn new(runnable: &'runnable Runnable) -> Self {
        Self {
            runnable,
            dependencies: IndexMap::new(),
            warnings: Vec::new(),
            recompute_targets: Vec::new(),
        }
    }

    fn visit_fields(&mut self, prefix: &str, fields: &IndexMap<String, FieldConfiguration>) {
        for (key, field) in fields {
            let location = format!("{prefix}.{key}");
            self.visit_field(&location, field);
        }
    }

    fn visit_field(&mut self, location: &str, field: &FieldConfiguration) {
        match field {
            FieldConfiguration::Connected { connection: None } => {}
            FieldConfiguration::Connected {
                connection: Some(connection),
            } => self.visit_connection(location, connection),
            FieldConfiguration::EvalV2 { connections, .. } | FieldConfiguration::TemplateV2 { connections, .. } => {
                self.visit_expression_connections(location, connections)
            }
            FieldConfiguration::OneOf(one_of) => match one_of.selected_branch() {
                Some(branch) => self.visit_fields(&format!("{location}.{}", one_of.selected), branch),
                None => self.warn(location, format!("selected branch '{}' is not configured", one_of.selected)),
            },
            FieldConfiguration::Runnable(input) => self.visit_fields(location, &input.fields),
            FieldConfiguration::Static { .. }
            | FieldConfiguration::User { .. }
            | FieldConfiguration::Row { .. }
            | FieldConfiguration::Eval { .. }
            | FieldConfiguration::Upload { .. }
            | FieldConfiguration::UploadS3 { .. } => {}
        }
    }

    fn visit_connection(&mut self, location: &str, connection: &ConnectionSpec) {
        match connection.as_connection() {
            Some(connection) => self.add_dependency(
                location,
                &connection.component_id,
                BindingKind::Connection {
                    path: connection.path.trim().to_string(),
                },
            ),
            None => self.warn(location, "connection must name both a component and an output path"),
        }
    }

    fn visit_expression_connections(&mut self, location: &str, connections: &[EvalConnection]) {
        for connection in connections {
            if connection.component_id.trim().is_empty() {
                self.warn(location, "expression connection is missing its component id");
                continue;
            }
            self.add_dependency(
                location,
                &connection.component_id,
                BindingKind::Expression {
                    output: connection.id.clone(),
                },
            );
        }
    }

    fn visit_refresh_triggers(&mut self) {
        for trigger in self.runnable.refresh_triggers() {
            if trigger.id.trim().is_empty() {
                self.warn("source.inlineScript.refreshOn", "refresh trigger is missing its component id");
                continue;
            }
            self.add_dependency(
                "source.inlineScript.refreshOn",
                &trigger.id,
                BindingKind::RefreshTrigger {
                    output: trigger.key.clone(),
                },
            );
        }
    }

    fn collect_recompute_targets(&mut self) {
        for target in &self.runnable.recompute_ids {
            let target = target.trim();
            if target.is_empty() || target == self.runnable.name {
                continue;
            }
            if !self.recompute_targets.iter().any(|existing| existing == target) {
                self.recompute_targets.push(target.to_string());
            }
        }
    }

    fn add_dependency(&mut self, location: &str, component_id: &str, kind: BindingKind) {
        let component_id = component_id.trim();
        // A runnable reading its own output would re-trigger itself on every completion.
        if component_id == self.runnable.name {
            self.warn(location, "binding to the runnable's own output is ignored");
            return;
        }
        self.dependencies.entry(component_id.to_string()).or_default().push(BindingSite {
            field: location.to_string(),
            kind,
        });
    }

    fn warn(&mut self, location: &str, message: impl Into<String>) {
        self.warnings.push(ResolutionWarning::new(self.runnable.name.clone(), location, message));
    }

    fn finish(self) -> ResolvedBindings {
        ResolvedBindings {
            runnable: self.runnable.name.clone(),
            dependencies: self.dependencies,
            recompute_targets: self.recompute_targets,
            warnings: self.warnings,
        }
    }
}
