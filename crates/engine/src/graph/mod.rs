//! Binding resolution and the component -> runnable dependency graph.

pub mod bindings;
pub mod dependency;

pub use bindings::{BindingKind, BindingSite, ResolvedBindings, resolve};
pub use dependency::DependencyGraph;
