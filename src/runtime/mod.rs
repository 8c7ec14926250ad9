//! Agent runtime abstraction.
//!
//! The [`AgentRuntime`] trait decouples turn coordination from the process
//! or service that actually runs the agent. Prompt dispatch, reconnects, and
//! aborts route through it; events flow back separately as
//! [`AgentEvent`](crate::models::event::AgentEvent)s on the event channel.

pub mod codec;
pub mod ndjson;

use std::future::Future;
use std::pin::Pin;

use crate::Result;

/// Boxed future returned by [`AgentRuntime`] methods.
pub type RuntimeFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Interface between the coordinator and an agent runtime.
pub trait AgentRuntime: Send + Sync {
    /// Hand a prompt to the session's agent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`](crate::AppError::Runtime) if the prompt
    /// could not be delivered.
    fn send_prompt<'a>(&'a self, session_id: &'a str, prompt: &'a str) -> RuntimeFuture<'a>;

    /// Re-establish the connection to the session's agent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`](crate::AppError::Runtime) if the
    /// session cannot be reached.
    fn reconnect<'a>(&'a self, session_id: &'a str) -> RuntimeFuture<'a>;

    /// Ask the agent to stop its current turn. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Runtime`](crate::AppError::Runtime) if the abort
    /// request could not be delivered.
    fn abort<'a>(&'a self, session_id: &'a str) -> RuntimeFuture<'a>;
}
