mod registry;
mod router;
mod selectors;

pub use registry::{FalPayloadStyle, ModelRegistry, ModelSpec};
pub use router::{
    classify, is_control_net, reve_version, validate_base_model, validate_base_model_in,
    ModelFamily, AIR_PATTERN, AIR_REGEX, DEFAULT_BASE_MODEL, FAL_PREFIX, REVE_PREFIX,
};
pub use selectors::{ModelSelection, ModelSelector};
