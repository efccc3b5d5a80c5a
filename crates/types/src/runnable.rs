//! Runnable definitions.
//!
//! The document stores runnables in two places: as the `componentInput` of a grid component and
//! as background ("hidden") scripts. [`Runnable`] is the normalized view both collapse into.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::input::FieldConfiguration;

/// Where the code of a runnable comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum RunnableSource {
    /// Script stored inline in the app document.
    #[serde(rename = "runnableByName")]
    ByName {
        #[serde(default)]
        inline_script: Option<InlineScript>,
    },
    /// Script or flow deployed in the workspace.
    #[serde(rename = "runnableByPath")]
    ByPath {
        path: String,
        #[serde(default = "default_run_type")]
        run_type: String,
    },
}

/// Inline script body plus the metadata the runtime cares about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InlineScript {
    #[serde(default)]
    pub content: String,
    /// Script language; `frontend` scripts run in the viewer.
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub cache_ttl: Option<u64>,
    /// Outputs that force a re-run of this script when they change.
    #[serde(default)]
    pub refresh_on: Vec<RefreshTrigger>,
    /// Outputs the editor suggests adding to `refresh_on`. They never create edges.
    #[serde(default)]
    pub suggested_refresh_on: Vec<RefreshTrigger>,
}

/// Output `(component, key)` watched by a frontend script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RefreshTrigger {
    pub id: String,
    pub key: String,
}

/// Normalized runnable consumed by the dependency graph and the coordinator.
///
/// `name` doubles as the component ID under which the runnable publishes its outputs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Runnable {
    pub name: String,
    /// Display name, when it differs from `name` (background runnables).
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub source: Option<RunnableSource>,
    #[serde(default)]
    pub fields: IndexMap<String, FieldConfiguration>,
    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default)]
    pub recompute_on_input_changed: Option<bool>,
    #[serde(default)]
    pub do_not_recompute_on_input_changed: Option<bool>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub transformer: Option<InlineScript>,
    /// Runnables forced to recompute after this one finishes.
    #[serde(default)]
    pub recompute_ids: Vec<String>,
    #[serde(default)]
    pub allow_concurrent_runs: bool,
}

impl Runnable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds or replaces a field, returning the runnable for chaining.
    pub fn with_field(mut self, key: impl Into<String>, field: FieldConfiguration) -> Self {
        self.fields.insert(key.into(), field);
        self
    }

    /// Whether a change of any input should re-run this runnable.
    pub fn recomputes_on_input_change(&self) -> bool {
        resolve_recompute_flag(self.recompute_on_input_changed, self.do_not_recompute_on_input_changed)
    }

    /// Explicit refresh triggers declared by an inline script.
    pub fn refresh_triggers(&self) -> &[RefreshTrigger] {
        match &self.source {
            Some(RunnableSource::ByName {
                inline_script: Some(script),
            }) => &script.refresh_on,
            _ => &[],
        }
    }

    /// Human readable name for logs and CLI output.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

/// Reconciles the recompute flag with its deprecated negated predecessor.
///
/// `recomputeOnInputChanged` wins whenever it is present; otherwise the legacy
/// `doNotRecomputeOnInputChanged` is negated; with neither set the runnable recomputes.
pub fn resolve_recompute_flag(recompute_on_input_changed: Option<bool>, do_not_recompute_on_input_changed: Option<bool>) -> bool {
    match (recompute_on_input_changed, do_not_recompute_on_input_changed) {
        (Some(flag), _) => flag,
        (None, Some(legacy)) => !legacy,
        (None, None) => true,
    }
}

fn default_run_type() -> String {
    "script".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recompute_flag_prefers_current_field() {
        assert!(resolve_recompute_flag(None, None));
        assert!(!resolve_recompute_flag(None, Some(true)));
        assert!(resolve_recompute_flag(None, Some(false)));
        assert!(!resolve_recompute_flag(Some(false), Some(false)));
        assert!(resolve_recompute_flag(Some(true), Some(true)));
    }

    #[test]
    fn refresh_triggers_come_from_inline_script() {
        let runnable = Runnable {
            source: Some(RunnableSource::ByName {
                inline_script: Some(InlineScript {
                    language: "frontend".into(),
                    refresh_on: vec![RefreshTrigger {
                        id: "a".into(),
                        key: "result".into(),
                    }],
                    ..Default::default()
                }),
            }),
            ..Runnable::new("r")
        };

        assert_eq!(runnable.refresh_triggers().len(), 1);
        assert!(Runnable::new("plain").refresh_triggers().is_empty());
    }

    #[test]
    fn runnable_source_uses_document_tags() {
        let source: RunnableSource =
            serde_json::from_value(json!({ "type": "runnableByPath", "path": "f/team/sync", "runType": "flow" })).expect("source");
        assert_eq!(
            source,
            RunnableSource::ByPath {
                path: "f/team/sync".into(),
                run_type: "flow".into()
            }
        );
    }
}
