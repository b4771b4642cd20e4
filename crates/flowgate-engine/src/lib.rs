pub mod cache;
pub mod executor;
pub mod planner;
pub mod sessions;

pub use cache::{cache_key, PlanCache, CACHE_PREFIX};
pub use executor::{FlowExecutor, Outcome, FLOW_CANNOT_CONTINUE};
pub use planner::FlowPlanner;
pub use sessions::FlowSessions;
