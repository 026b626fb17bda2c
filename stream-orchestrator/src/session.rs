//! Tab bindings and tab-scoped persistent state.

pub mod binding;
pub mod store;

// Re-export main types
pub use binding::{Binding, BindingRegistry};
pub use store::{InMemorySelectionStore, SelectionStore};
