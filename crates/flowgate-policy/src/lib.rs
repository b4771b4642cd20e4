//! Policy evaluation for flowgate.
//!
//! `PolicyEngine` is the default `PolicyEvaluator`: it runs every enabled
//! binding of a set concurrently, each bounded by its own timeout, and
//! aggregates the results by the set's mode. Errors and timeouts surface as
//! `FlowError::PolicyEvaluation`, which callers treat as a denial.

pub mod engine;
pub mod expression;

pub use engine::PolicyEngine;
pub use expression::{evaluate_expression, ExpressionError};
