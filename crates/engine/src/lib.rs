//! # Runboard Engine
//!
//! The Runboard engine keeps the runnables of a low-code app in sync with the components they
//! read from. It derives a dependency graph from each runnable's field bindings, refreshes the
//! affected runnables when a component output changes, and coordinates their executions so that
//! at most one run per runnable is current at any time.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use runboard_engine::{AppSession, NoopBackend, SessionConfig, load_app_document};
//!
//! let temp_dir = tempfile::tempdir()?;
//! let document_path = temp_dir.path().join("app.yaml");
//! std::fs::write(&document_path, r#"
//! grid:
//!   - id: search
//!     data: { id: search, type: textinputcomponent }
//! "#)?;
//!
//! let document = load_app_document(&document_path)?;
//! let runtime = tokio::runtime::Runtime::new()?;
//! runtime.block_on(async {
//!     let session = AppSession::from_document(&document, Arc::new(NoopBackend::new()), SessionConfig::default())?;
//!     let handle = session.start();
//!     let snapshot = handle.snapshot().await?;
//!     println!("{} runnables", snapshot.states.len());
//!     handle.shutdown().await?;
//!     Ok::<(), anyhow::Error>(())
//! })?;
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **`graph`**: binding resolution and the component -> runnable dependency graph
//! - **`world`**: component outputs and input resolution at dispatch time
//! - **`executor`**: run state machine and the execution backend abstraction
//! - **`jobs`**: job result store
//! - **`session`**: the single-writer actor tying everything together
//! - **`events`**: publish/subscribe channel of session events

use std::{fs, path::Path};

use anyhow::{Context, Result};
use runboard_types::AppDocument;

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod jobs;
pub mod session;
pub mod world;

pub use config::SessionConfig;
pub use error::{CancellationRace, DanglingReference, ExecutionError, GraphError, ResolutionWarning, SessionError};
pub use events::{EventBus, SessionEvent, Subscription};
pub use executor::{
    Coordinator, DispatchRequest, ExecutionBackend, JobCompletion, JobTicket, NoopBackend, RunId, RunState, TriggerCause,
};
pub use graph::{BindingKind, BindingSite, DependencyGraph, ResolvedBindings, resolve};
pub use jobs::JobResultStore;
pub use session::{AppSession, EditorEvent, SessionHandle, SessionSnapshot};
pub use world::{World, resolve_inputs, select_path};

/// Loads an app document from the filesystem.
///
/// Files with a `.json` extension are parsed as JSON; everything else as YAML (which also
/// accepts JSON content).
pub fn load_app_document(file_path: impl AsRef<Path>) -> Result<AppDocument> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("Failed to read app document: {}", file_path.display()))?;

    let is_json = file_path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON app document: {}", file_path.display()))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid YAML app document: {}", file_path.display()))
    }
}
