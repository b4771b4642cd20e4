use std::sync::Arc;

use tracing::debug;

use flowgate_core::error::{FlowError, Result};
use flowgate_core::traits::ExecutionStore;
use flowgate_core::{ExecutionContext, PlanContext, SessionId};

use crate::executor::{FlowExecutor, Outcome};

/// Session-scoped front of the executor.
///
/// Each call loads the execution for a session, runs one step and writes
/// the result back. Finished executions are removed from the store.
pub struct FlowSessions {
    executor: Arc<FlowExecutor>,
    store: Arc<dyn ExecutionStore>,
}

impl FlowSessions {
    pub fn new(executor: Arc<FlowExecutor>, store: Arc<dyn ExecutionStore>) -> Self {
        Self { executor, store }
    }

    pub fn executor(&self) -> &Arc<FlowExecutor> {
        &self.executor
    }

    /// Start a new execution of `flow_slug` under a fresh session id.
    pub async fn begin(&self, flow_slug: &str, request: PlanContext) -> Result<(SessionId, Outcome)> {
        let mut ctx = ExecutionContext::new(SessionId::new(), flow_slug, request);
        let outcome = self.executor.start(&mut ctx).await?;
        self.persist(&ctx).await?;
        Ok((ctx.session_id, outcome))
    }

    pub async fn submit(&self, session: &SessionId, input: serde_json::Value) -> Result<Outcome> {
        let mut ctx = self.load(session).await?;
        let outcome = self.executor.submit(&mut ctx, input).await?;
        self.persist(&ctx).await?;
        Ok(outcome)
    }

    /// Re-present the current stage of a session.
    pub async fn current(&self, session: &SessionId) -> Result<Outcome> {
        let mut ctx = self.load(session).await?;
        let outcome = self.executor.current(&mut ctx).await?;
        // may have expired
        self.persist(&ctx).await?;
        Ok(outcome)
    }

    pub async fn abort(&self, session: &SessionId) -> Result<Outcome> {
        let mut ctx = self.load(session).await?;
        let outcome = self.executor.abort(&mut ctx);
        self.persist(&ctx).await?;
        Ok(outcome)
    }

    async fn load(&self, session: &SessionId) -> Result<ExecutionContext> {
        self.store
            .load(session)
            .await?
            .ok_or_else(|| FlowError::ExecutionNotFound(session.to_string()))
    }

    async fn persist(&self, ctx: &ExecutionContext) -> Result<()> {
        if ctx.is_terminal() {
            let removed = self.store.delete(&ctx.session_id).await?;
            debug!(session = %ctx.session_id, status = %ctx.status, removed, "Execution finished");
            Ok(())
        } else {
            self.store.save(ctx).await
        }
    }
}
