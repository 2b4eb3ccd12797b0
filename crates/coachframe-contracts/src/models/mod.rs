mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec};
pub use selectors::{ModelSelection, ModelSelector};

pub const CAPABILITY_VISION: &str = "vision";
pub const CAPABILITY_TEXT: &str = "text";
pub const CAPABILITY_EDIT: &str = "edit";
