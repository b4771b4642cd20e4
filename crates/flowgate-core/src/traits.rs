use futures::future::BoxFuture;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::policy::{PolicyContext, PolicySet, PolicyVerdict};
use crate::stage::{Challenge, StageResult};
use crate::types::{Flow, FlowStageBinding, SessionId, Stage, User};

/// Policy evaluator: decides whether a request passes a policy set.
pub trait PolicyEvaluator: Send + Sync + 'static {
    /// Evaluate every enabled binding of `set` against `request` and
    /// aggregate according to the set's mode.
    fn evaluate<'a>(
        &'a self,
        set: &'a PolicySet,
        request: &'a PolicyContext,
    ) -> BoxFuture<'a, Result<PolicyVerdict>>;
}

/// Stage behavior: the runtime side of a stage kind.
pub trait StageBehavior: Send + Sync + 'static {
    /// Concrete type name, e.g. `IdentificationStage`.
    fn type_name(&self) -> &'static str;

    /// Human-readable name for UIs.
    fn verbose_name(&self) -> &'static str;

    /// Check a stage's configuration. Called for every binding while a plan
    /// is built; an error makes the flow unplannable.
    fn validate(&self, _stage: &Stage) -> Result<()> {
        Ok(())
    }

    /// Build the challenge shown to the client.
    fn present<'a>(
        &'a self,
        stage: &'a Stage,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<Challenge>>;

    /// Validate client input and apply side effects.
    fn process<'a>(
        &'a self,
        stage: &'a Stage,
        ctx: &'a ExecutionContext,
        input: serde_json::Value,
    ) -> BoxFuture<'a, Result<StageResult>>;
}

/// Flow definitions: read side of the persistence collaborator.
pub trait FlowStore: Send + Sync + 'static {
    /// Look up a flow by slug.
    fn flow(&self, slug: &str) -> BoxFuture<'_, Result<Option<Flow>>>;

    /// All bindings of a flow, in storage order.
    fn bindings(&self, slug: &str) -> BoxFuture<'_, Result<Vec<FlowStageBinding>>>;

    /// List all flows.
    fn flows(&self) -> BoxFuture<'_, Result<Vec<Flow>>>;
}

/// User directory used by identification and password stages.
pub trait UserDirectory: Send + Sync + 'static {
    /// Find an active or inactive user by username or email.
    fn find_user(&self, identifier: &str) -> BoxFuture<'_, Result<Option<User>>>;

    /// Verify a password for the user with this username. Returns the user
    /// when the credentials are valid and the user is active.
    fn authenticate(&self, username: &str, password: &str)
        -> BoxFuture<'_, Result<Option<User>>>;
}

/// Execution store: persists per-session flow progress.
pub trait ExecutionStore: Send + Sync + 'static {
    fn save(&self, ctx: &ExecutionContext) -> BoxFuture<'_, Result<()>>;

    fn load(&self, session: &SessionId) -> BoxFuture<'_, Result<Option<ExecutionContext>>>;

    /// Returns whether anything was deleted.
    fn delete(&self, session: &SessionId) -> BoxFuture<'_, Result<bool>>;
}
