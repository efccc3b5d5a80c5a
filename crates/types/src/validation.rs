//! Structural checks over an app document.
//!
//! Nothing here is fatal: every problem is reported as a [`DocumentIssue`] so the editor can
//! surface it next to the offending component while the app keeps running.

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::app::AppDocument;
use crate::input::FieldConfiguration;
use crate::runnable::Runnable;

static COMPONENT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("valid component id pattern"));

/// Category of a document issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentIssueKind {
    DuplicateComponentId,
    InvalidComponentId,
    EmptyRunnableName,
    MissingOneOfBranch,
    ConflictingRecomputeFlags,
}

/// Problem found while validating a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentIssue {
    pub kind: DocumentIssueKind,
    /// Component or runnable the issue belongs to.
    pub component: Option<String>,
    pub message: String,
}

impl fmt::Display for DocumentIssue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.component {
            Some(component) => write!(formatter, "{component}: {}", self.message),
            None => formatter.write_str(&self.message),
        }
    }
}

/// Validates component identifiers and runnable definitions.
pub fn validate_document(document: &AppDocument) -> Vec<DocumentIssue> {
    let mut issues = Vec::new();
    let mut seen = HashSet::new();

    for component_id in document.component_ids() {
        if !COMPONENT_ID_PATTERN.is_match(&component_id) {
            issues.push(DocumentIssue {
                kind: DocumentIssueKind::InvalidComponentId,
                component: Some(component_id.clone()),
                message: format!(
                    "component id '{component_id}' must match {}: a letter or underscore, then letters, digits, '_' or '-'",
                    COMPONENT_ID_PATTERN.as_str()
                ),
            });
        }
        if !seen.insert(component_id.clone()) {
            issues.push(DocumentIssue {
                kind: DocumentIssueKind::DuplicateComponentId,
                component: Some(component_id.clone()),
                message: format!("component id '{component_id}' is used more than once"),
            });
        }
    }

    for (index, hidden) in document.hidden_inline_scripts.iter().enumerate() {
        if hidden.name.trim().is_empty() {
            issues.push(DocumentIssue {
                kind: DocumentIssueKind::EmptyRunnableName,
                component: Some(crate::app::background_runnable_id(index)),
                message: "background runnable has an empty name".to_string(),
            });
        }
    }

    for runnable in document.runnables() {
        issues.extend(validate_runnable(&runnable));
    }

    for component in document.components() {
        collect_one_of_issues(&component.id, "configuration", &component.configuration, &mut issues);
    }

    issues
}

/// Checks a single runnable definition.
pub fn validate_runnable(runnable: &Runnable) -> Vec<DocumentIssue> {
    let mut issues = Vec::new();

    if let (Some(current), Some(legacy)) = (runnable.recompute_on_input_changed, runnable.do_not_recompute_on_input_changed)
        && current == legacy
    {
        issues.push(DocumentIssue {
            kind: DocumentIssueKind::ConflictingRecomputeFlags,
            component: Some(runnable.name.clone()),
            message: format!(
                "recomputeOnInputChanged={current} conflicts with deprecated doNotRecomputeOnInputChanged={legacy}; \
                 recomputeOnInputChanged takes precedence"
            ),
        });
    }

    collect_one_of_issues(&runnable.name, "fields", &runnable.fields, &mut issues);
    issues
}

fn collect_one_of_issues(owner: &str, prefix: &str, fields: &IndexMap<String, FieldConfiguration>, issues: &mut Vec<DocumentIssue>) {
    for (key, field) in fields {
        let location = format!("{prefix}.{key}");
        match field {
            FieldConfiguration::OneOf(one_of) => match one_of.selected_branch() {
                Some(branch) => collect_one_of_issues(owner, &format!("{location}.{}", one_of.selected), branch, issues),
                None => issues.push(DocumentIssue {
                    kind: DocumentIssueKind::MissingOneOfBranch,
                    component: Some(owner.to_string()),
                    message: format!("{location} selects branch '{}' which is not configured", one_of.selected),
                }),
            },
            FieldConfiguration::Runnable(input) => collect_one_of_issues(owner, &location, &input.fields, issues),
            _ => {}
        }
    }
}
