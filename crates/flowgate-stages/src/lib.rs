pub mod builtin;
pub mod registry;

pub use registry::{stage_type_identifier, StageRegistry, StageTypeInfo};
