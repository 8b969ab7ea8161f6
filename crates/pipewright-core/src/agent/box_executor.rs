//! BoxAgentExecutor -- object-safe dynamic dispatch wrapper for AgentExecutor.
//!
//! 1. Define an object-safe `AgentExecutorDyn` trait with boxed futures
//! 2. Blanket-impl `AgentExecutorDyn` for all `T: AgentExecutor`
//! 3. `BoxAgentExecutor` wraps `Box<dyn AgentExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use pipewright_types::workflow::StepDefinition;

use super::{AgentExecutor, ExecutionContext, StepOutcome};
use crate::workspace::WorkspacePaths;

/// Object-safe version of [`AgentExecutor`] with boxed futures.
pub trait AgentExecutorDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        workspace: &'a WorkspacePaths,
        context: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>>;
}

impl<T: AgentExecutor> AgentExecutorDyn for T {
    fn name(&self) -> &str {
        AgentExecutor::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        workspace: &'a WorkspacePaths,
        context: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(self.execute(step, workspace, context))
    }
}

/// Type-erased executor for runtime backend selection.
///
/// Since `AgentExecutor` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxAgentExecutor` provides the same surface by delegating to
/// the inner `AgentExecutorDyn` object.
pub struct BoxAgentExecutor {
    inner: Box<dyn AgentExecutorDyn + Send + Sync>,
}

impl BoxAgentExecutor {
    pub fn new<T: AgentExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(
        &self,
        step: &StepDefinition,
        workspace: &WorkspacePaths,
        context: &ExecutionContext,
    ) -> StepOutcome {
        self.inner.execute_boxed(step, workspace, context).await
    }
}
