//! Strongly typed app document model shared by the Runboard engine and CLI.
//!
//! The models mirror the document persisted by the app editor. They preserve authoring order
//! (via `IndexMap`) so diagnostics and refresh cascades are reported in a predictable sequence.

pub mod app;
pub mod input;
pub mod job;
pub mod runnable;
pub mod validation;

pub use app::{AppComponent, AppDocument, GridItem, HiddenRunnable, background_runnable_id};
pub use input::{ConnectionSpec, EvalConnection, FieldConfiguration, InputConnection, OneOfConfiguration, RunnableInput};
pub use job::{ComponentError, JobId, JobRecord, JobStatus, JobUpdate, TransformerOutcome};
pub use runnable::{InlineScript, RefreshTrigger, Runnable, RunnableSource, resolve_recompute_flag};
pub use validation::{DocumentIssue, DocumentIssueKind, validate_document, validate_runnable};
