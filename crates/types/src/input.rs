//! Field configuration unions used to bind runnable and component inputs to data sources.
//!
//! Every configuration is discriminated by its `type` tag exactly as the app editor stores it.
//! `oneOf` configurations nest further configurations per branch; only the branch named by
//! `selected` is live.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::runnable::{InlineScript, RunnableSource};

/// Configuration attached to a single input field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum FieldConfiguration {
    /// Literal value authored in the editor.
    #[serde(rename = "static")]
    Static {
        #[serde(default)]
        value: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field_type: Option<String>,
    },
    /// Reference to another component's output.
    #[serde(rename = "connected")]
    Connected {
        #[serde(default)]
        connection: Option<ConnectionSpec>,
    },
    /// Value supplied by the end user at run time.
    #[serde(rename = "user")]
    User {
        #[serde(default)]
        value: Option<JsonValue>,
    },
    /// Column of the row currently rendered by a list or table.
    #[serde(rename = "row")]
    Row {
        #[serde(default)]
        column: String,
    },
    /// Legacy expression without declared connections.
    #[serde(rename = "eval")]
    Eval {
        #[serde(default)]
        expr: String,
    },
    /// Expression with explicitly declared connections.
    #[serde(rename = "evalv2")]
    EvalV2 {
        #[serde(default)]
        expr: String,
        #[serde(default)]
        connections: Vec<EvalConnection>,
    },
    #[serde(rename = "upload")]
    Upload {
        #[serde(default)]
        value: Option<JsonValue>,
    },
    #[serde(rename = "uploadS3")]
    UploadS3 {
        #[serde(default)]
        value: Option<JsonValue>,
    },
    /// Component input backed by a runnable.
    #[serde(rename = "runnable")]
    Runnable(RunnableInput),
    /// Template string with explicitly declared connections.
    #[serde(rename = "templatev2")]
    TemplateV2 {
        #[serde(default)]
        eval: String,
        #[serde(default)]
        connections: Vec<EvalConnection>,
    },
    /// Alternative configurations, one of which is selected.
    #[serde(rename = "oneOf")]
    OneOf(OneOfConfiguration),
}

impl FieldConfiguration {
    /// Tag string used in the document for this configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldConfiguration::Static { .. } => "static",
            FieldConfiguration::Connected { .. } => "connected",
            FieldConfiguration::User { .. } => "user",
            FieldConfiguration::Row { .. } => "row",
            FieldConfiguration::Eval { .. } => "eval",
            FieldConfiguration::EvalV2 { .. } => "evalv2",
            FieldConfiguration::Upload { .. } => "upload",
            FieldConfiguration::UploadS3 { .. } => "uploadS3",
            FieldConfiguration::Runnable(_) => "runnable",
            FieldConfiguration::TemplateV2 { .. } => "templatev2",
            FieldConfiguration::OneOf(_) => "oneOf",
        }
    }

    /// Convenience constructor for a static field.
    pub fn static_value(value: JsonValue) -> Self {
        FieldConfiguration::Static { value, field_type: None }
    }

    /// Convenience constructor for a field connected to `component_id` at `path`.
    pub fn connected(component_id: impl Into<String>, path: impl Into<String>) -> Self {
        FieldConfiguration::Connected {
            connection: Some(ConnectionSpec::Connection(InputConnection {
                component_id: component_id.into(),
                path: path.into(),
            })),
        }
    }
}

/// Connection payload as stored in the document.
///
/// Documents edited by older clients occasionally carry connection payloads of the wrong
/// shape. Those deserialize into [`ConnectionSpec::Malformed`] so the document still loads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConnectionSpec {
    Connection(InputConnection),
    Malformed(JsonValue),
}

impl ConnectionSpec {
    /// Returns the connection when it names both a component and an output path.
    pub fn as_connection(&self) -> Option<&InputConnection> {
        match self {
            ConnectionSpec::Connection(connection) if connection.is_complete() => Some(connection),
            _ => None,
        }
    }
}

/// Reference to `(componentId, outputPath)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InputConnection {
    #[serde(default)]
    pub component_id: String,
    /// Output key optionally followed by a JSON path, for example `result.items[0]`.
    #[serde(default)]
    pub path: String,
}

impl InputConnection {
    pub fn is_complete(&self) -> bool {
        !self.component_id.trim().is_empty() && !self.path.trim().is_empty()
    }
}

/// Connection declared by an expression (`evalv2` / `templatev2`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvalConnection {
    #[serde(default)]
    pub component_id: String,
    /// Output key read by the expression.
    #[serde(default)]
    pub id: String,
}

/// Component input that executes a runnable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunnableInput {
    #[serde(default)]
    pub runnable: Option<RunnableSource>,
    #[serde(default)]
    pub fields: IndexMap<String, FieldConfiguration>,
    #[serde(default)]
    pub auto_refresh: Option<bool>,
    #[serde(default)]
    pub recompute_on_input_changed: Option<bool>,
    /// Deprecated. Read through [`crate::runnable::resolve_recompute_flag`].
    #[serde(default)]
    pub do_not_recompute_on_input_changed: Option<bool>,
    #[serde(default)]
    pub transformer: Option<InlineScript>,
    #[serde(default)]
    pub recompute_ids: Vec<String>,
    #[serde(default)]
    pub allow_concurrent_runs: bool,
}

/// `oneOf` configuration: a set of named branches with exactly one selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OneOfConfiguration {
    pub selected: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default)]
    pub configuration: IndexMap<String, IndexMap<String, FieldConfiguration>>,
}

impl OneOfConfiguration {
    /// Fields of the selected branch, if the branch exists.
    pub fn selected_branch(&self) -> Option<&IndexMap<String, FieldConfiguration>> {
        self.configuration.get(&self.selected)
    }
}
