pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod plan;
pub mod policy;
pub mod stage;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use context::{ExecutionContext, ExecutionStatus, PlanContext};
pub use error::{FlowError, Result};
pub use event::{EventBus, FlowEvent};
pub use plan::{Plan, PlanEntry};
pub use policy::{Policy, PolicyContext, PolicyEngineMode, PolicyBinding, PolicyKind, PolicyResult, PolicySet, PolicyVerdict};
pub use stage::{Challenge, StageResult};
pub use types::*;
