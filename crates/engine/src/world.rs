//! Component outputs and input resolution for dispatch.
//!
//! The world holds, per component, the outputs it currently publishes (`result`, `loading`,
//! `error`, or any key the rendering layer writes). Connection paths such as
//! `result.items[0].name` select an output key and then walk into the JSON value.

use indexmap::IndexMap;
use runboard_types::{ConnectionSpec, EvalConnection, FieldConfiguration, Runnable};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::DanglingReference;
use crate::graph::DependencyGraph;

/// Output key runnables publish their result under.
pub const RESULT_OUTPUT: &str = "result";
/// Output key runnables publish their failure under.
pub const ERROR_OUTPUT: &str = "error";
/// Output key flagging an in-flight run.
pub const LOADING_OUTPUT: &str = "loading";

/// Current outputs of every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct World {
    outputs: IndexMap<String, IndexMap<String, Value>>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one output. Returns `false` when the stored value was already equal.
    pub fn set(&mut self, component_id: &str, key: &str, value: Value) -> bool {
        let outputs = self.outputs.entry(component_id.to_string()).or_default();
        if outputs.get(key) == Some(&value) {
            return false;
        }
        outputs.insert(key.to_string(), value);
        true
    }

    pub fn remove(&mut self, component_id: &str, key: &str) -> Option<Value> {
        self.outputs.get_mut(component_id)?.shift_remove(key)
    }

    pub fn get(&self, component_id: &str, key: &str) -> Option<&Value> {
        self.outputs.get(component_id)?.get(key)
    }

    pub fn outputs_of(&self, component_id: &str) -> Option<&IndexMap<String, Value>> {
        self.outputs.get(component_id)
    }

    /// Drops every output of a removed component.
    pub fn remove_component(&mut self, component_id: &str) -> Option<IndexMap<String, Value>> {
        self.outputs.shift_remove(component_id)
    }

    /// Resolves a connection path (`<output>[.<json path>]`) against a component's outputs.
    pub fn select(&self, component_id: &str, path: &str) -> Option<Value> {
        let path = path.trim();
        let head_end = path.find(['.', '[']).unwrap_or(path.len());
        let (output_key, rest) = path.split_at(head_end);
        let output = self.get(component_id, output_key)?;
        select_path(output, rest)
    }

    /// Outputs of one component as a JSON object, `null` when it has none.
    fn outputs_value(&self, component_id: &str) -> Value {
        match self.outputs.get(component_id) {
            Some(outputs) => Value::Object(outputs.iter().map(|(key, value)| (key.clone(), value.clone())).collect()),
            None => Value::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.outputs
                .keys()
                .map(|component_id| (component_id.clone(), self.outputs_value(component_id)))
                .collect(),
        )
    }
}

/// Walks a dotted JSON path with optional array indices (`items[0].name`).
///
/// An empty path selects the value itself.
pub fn select_path(value: &Value, path: &str) -> Option<Value> {
    let mut current = value;
    for segment in path.trim().split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let key_end = segment.find('[').unwrap_or(segment.len());
    let key = &segment[..key_end];
    let mut indices = Vec::new();
    let mut rest = &segment[key_end..];
    while let Some(stripped) = rest.strip_prefix('[') {
        let Some(close) = stripped.find(']') else {
            break;
        };
        if let Ok(index) = stripped[..close].parse::<usize>() {
            indices.push(index);
        }
        rest = &stripped[close + 1..];
    }
    (key, indices)
}

/// Resolves the inputs of a runnable from the current world.
///
/// Fails with the first binding that points at a component missing from the graph.
pub fn resolve_inputs(runnable: &Runnable, world: &World, graph: &DependencyGraph) -> Result<Map<String, Value>, DanglingReference> {
    InputResolver { runnable, world, graph }.resolve_fields("fields", &runnable.fields)
}

struct InputResolver<'a> {
    runnable: &'a Runnable,
    world: &'a World,
    graph: &'a DependencyGraph,
}

impl InputResolver<'_> {
    fn resolve_fields(&self, prefix: &str, fields: &IndexMap<String, FieldConfiguration>) -> Result<Map<String, Value>, DanglingReference> {
        let mut resolved = Map::new();
        for (key, field) in fields {
            let value = self.resolve_field(&format!("{prefix}.{key}"), field)?;
            resolved.insert(key.clone(), value);
        }
        Ok(resolved)
    }

    fn resolve_field(&self, location: &str, field: &FieldConfiguration) -> Result<Value, DanglingReference> {
        let value = match field {
            FieldConfiguration::Static { value, .. } => value.clone(),
            FieldConfiguration::User { value } | FieldConfiguration::Upload { value } | FieldConfiguration::UploadS3 { value } => {
                value.clone().unwrap_or(Value::Null)
            }
            FieldConfiguration::Connected { connection } => self.resolve_connection(location, connection.as_ref())?,
            FieldConfiguration::Row { .. } => Value::Null,
            FieldConfiguration::Eval { expr } => expression(expr, self.world.to_value()),
            FieldConfiguration::EvalV2 { expr, connections } => expression(expr, self.expression_context(location, connections)?),
            FieldConfiguration::TemplateV2 { eval, connections } => expression(eval, self.expression_context(location, connections)?),
            FieldConfiguration::OneOf(one_of) => {
                let configuration = match one_of.selected_branch() {
                    Some(branch) => Value::Object(self.resolve_fields(&format!("{location}.{}", one_of.selected), branch)?),
                    None => Value::Null,
                };
                serde_json::json!({ "selected": one_of.selected, "configuration": configuration })
            }
            FieldConfiguration::Runnable(input) => Value::Object(self.resolve_fields(location, &input.fields)?),
        };
        Ok(value)
    }

    fn resolve_connection(&self, location: &str, connection: Option<&ConnectionSpec>) -> Result<Value, DanglingReference> {
        let Some(connection) = connection.and_then(ConnectionSpec::as_connection) else {
            return Ok(Value::Null);
        };
        let component_id = connection.component_id.trim();
        self.ensure_known(location, component_id)?;
        Ok(self.world.select(component_id, &connection.path).unwrap_or(Value::Null))
    }

    fn expression_context(&self, location: &str, connections: &[EvalConnection]) -> Result<Value, DanglingReference> {
        let mut context = Map::new();
        for connection in connections {
            let component_id = connection.component_id.trim();
            if component_id.is_empty() {
                continue;
            }
            self.ensure_known(location, component_id)?;
            let entry = context
                .entry(component_id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(outputs) = entry {
                let output = self.world.get(component_id, &connection.id).cloned().unwrap_or(Value::Null);
                outputs.insert(connection.id.clone(), output);
            }
        }
        Ok(Value::Object(context))
    }

    fn ensure_known(&self, location: &str, component_id: &str) -> Result<(), DanglingReference> {
        if self.graph.contains_component(component_id) {
            return Ok(());
        }
        Err(DanglingReference {
            runnable: self.runnable.name.clone(),
            field: location.to_string(),
            component_id: component_id.to_string(),
        })
    }
}

fn expression(source: &str, context: Value) -> Value {
    serde_json::json!({ "expr": source, "context": context })
}
