//! App document schema.
//!
//! Only the parts of the document that feed the dependency model are typed. Layout, styling and
//! theming keys are accepted and ignored.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::input::{FieldConfiguration, RunnableInput};
use crate::runnable::{InlineScript, Runnable, RunnableSource};

/// Prefix used to address background runnables as components.
pub const BACKGROUND_RUNNABLE_PREFIX: &str = "bg_";

/// Persisted app document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppDocument {
    #[serde(default)]
    pub grid: Vec<GridItem>,
    /// Grids nested inside container components, keyed by `<componentId>-<index>`.
    #[serde(default)]
    pub subgrids: IndexMap<String, Vec<GridItem>>,
    /// Background runnables not attached to a visible component.
    #[serde(default)]
    pub hidden_inline_scripts: Vec<HiddenRunnable>,
    #[serde(default)]
    pub norefreshbar: bool,
    #[serde(default)]
    pub version: Option<u32>,
}

/// Placed component. Position data is not modelled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GridItem {
    pub id: String,
    pub data: AppComponent,
}

/// Component definition as stored in a grid item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppComponent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub component_input: Option<FieldConfiguration>,
    #[serde(default)]
    pub configuration: IndexMap<String, FieldConfiguration>,
}

impl AppComponent {
    /// Runnable backing this component, when its input is of kind `runnable`.
    pub fn runnable_input(&self) -> Option<&RunnableInput> {
        match &self.component_input {
            Some(FieldConfiguration::Runnable(input)) => Some(input),
            _ => None,
        }
    }
}

/// Background runnable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HiddenRunnable {
    pub name: String,
    #[serde(flatten)]
    pub source: Option<RunnableSource>,
    #[serde(default)]
    pub transformer: Option<InlineScript>,
    #[serde(default)]
    pub fields: IndexMap<String, FieldConfiguration>,
    #[serde(default)]
    pub auto_refresh: bool,
    #[serde(default)]
    pub do_not_recompute_on_input_changed: Option<bool>,
    #[serde(default)]
    pub recompute_on_input_changed: Option<bool>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub recompute_ids: Vec<String>,
    #[serde(default)]
    pub allow_concurrent_runs: bool,
}

impl AppDocument {
    /// Iterates over every placed component, top-level grid first, then subgrids in order.
    pub fn components(&self) -> impl Iterator<Item = &AppComponent> {
        self.grid
            .iter()
            .chain(self.subgrids.values().flatten())
            .map(|item| &item.data)
    }

    /// IDs of every addressable component, including background runnables.
    pub fn component_ids(&self) -> Vec<String> {
        self.components()
            .map(|component| component.id.clone())
            .chain((0..self.hidden_inline_scripts.len()).map(background_runnable_id))
            .collect()
    }

    /// Normalizes component runnables and background runnables into [`Runnable`]s.
    pub fn runnables(&self) -> Vec<Runnable> {
        let component_runnables = self.components().filter_map(|component| {
            let input = component.runnable_input()?;
            Some(Runnable {
                name: component.id.clone(),
                label: None,
                source: input.runnable.clone(),
                fields: input.fields.clone(),
                auto_refresh: input.auto_refresh.unwrap_or(true),
                recompute_on_input_changed: input.recompute_on_input_changed,
                do_not_recompute_on_input_changed: input.do_not_recompute_on_input_changed,
                hidden: false,
                transformer: input.transformer.clone(),
                recompute_ids: input.recompute_ids.clone(),
                allow_concurrent_runs: input.allow_concurrent_runs,
            })
        });

        let background_runnables = self.hidden_inline_scripts.iter().enumerate().map(|(index, hidden)| Runnable {
            name: background_runnable_id(index),
            label: Some(hidden.name.clone()),
            source: hidden.source.clone(),
            fields: hidden.fields.clone(),
            auto_refresh: hidden.auto_refresh,
            recompute_on_input_changed: hidden.recompute_on_input_changed,
            do_not_recompute_on_input_changed: hidden.do_not_recompute_on_input_changed,
            hidden: hidden.hidden,
            transformer: hidden.transformer.clone(),
            recompute_ids: hidden.recompute_ids.clone(),
            allow_concurrent_runs: hidden.allow_concurrent_runs,
        });

        component_runnables.chain(background_runnables).collect()
    }
}

/// Component ID of the background runnable at `index`.
pub fn background_runnable_id(index: usize) -> String {
    format!("{BACKGROUND_RUNNABLE_PREFIX}{index}")
}
