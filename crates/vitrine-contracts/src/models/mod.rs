mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, EDIT_CAPABILITY};
pub use selectors::{ModelSelection, ModelSelector};
