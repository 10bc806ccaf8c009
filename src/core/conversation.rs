//! The turn-by-turn conversation loop.
//!
//! Each user turn submits the full history plus the current tool manifest to
//! the completion service, executes any requested tool calls in request
//! order, and resubmits until the model produces a final answer or the
//! iteration cap trips. Tool batches are staged and committed atomically:
//! cancelling mid-batch leaves the history exactly as it was before the
//! iteration started.

use chrono::Local;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::{ChatMessage, ChatRequest, CompletionBackend, CompletionError};
use crate::core::cancel::{run_cancellable, Cancellable};
use crate::core::tool_call::PendingToolCall;
use crate::mcp::executor::{ApprovalPolicy, ToolCallExecutor};
use crate::mcp::manager::ServerManager;
use crate::mcp::registry::ToolRegistry;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("the model kept calling tools past the {0}-iteration limit")]
    IterationLimit(usize),
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("turn interrupted")]
    Cancelled,
}

/// Everything a turn borrows from the session. Each field keeps its single
/// designated writer: the engine owns history, the manager owns connections,
/// and the registry is only read here.
pub struct TurnContext<'a> {
    pub backend: &'a dyn CompletionBackend,
    pub registry: &'a ToolRegistry,
    pub manager: &'a mut ServerManager,
    pub executor: &'a ToolCallExecutor,
    pub policy: &'a dyn ApprovalPolicy,
    pub cancel: Option<&'a CancellationToken>,
}

pub struct ConversationEngine {
    history: Vec<ChatMessage>,
    system_prompt: String,
    max_iterations: usize,
}

impl ConversationEngine {
    pub fn new(system_prompt: &str, max_iterations: usize) -> Self {
        let mut engine = Self {
            history: Vec::new(),
            system_prompt: format!(
                "{system_prompt}\nCurrent date: {}",
                Local::now().format("%Y-%m-%d")
            ),
            max_iterations,
        };
        engine.history.push(ChatMessage::system(engine.system_prompt.clone()));
        engine
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Clears the conversation back to the system prompt. Connections and
    /// the tool registry are untouched by design.
    pub fn reset(&mut self) {
        self.history.clear();
        self.history.push(ChatMessage::system(self.system_prompt.clone()));
    }

    /// Runs one user turn to completion and returns the final assistant
    /// text. On error the history keeps every fully committed message and
    /// nothing else.
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        ctx: TurnContext<'_>,
    ) -> Result<String, TurnError> {
        self.history.push(ChatMessage::user(user_input));

        for iteration in 0..self.max_iterations {
            let request = ChatRequest {
                messages: self.history.clone(),
                tools: Some(ctx.registry.tool_definitions()).filter(|tools| !tools.is_empty()),
                ..ChatRequest::default()
            };

            let turn = match run_cancellable(ctx.cancel, ctx.backend.complete(request)).await {
                Cancellable::Cancelled => return Err(TurnError::Cancelled),
                Cancellable::Done(result) => result?,
            };

            if !turn.requests_tools() {
                let content = turn.content.unwrap_or_default();
                self.history.push(ChatMessage::assistant(content.clone()));
                return Ok(content);
            }

            debug!(
                iteration,
                requested = turn.tool_calls.len(),
                "Model requested tool calls"
            );

            // Stage the assistant request and every tool result; commit only
            // when the whole batch has run.
            let mut staged = Vec::with_capacity(turn.tool_calls.len() + 1);
            staged.push(ChatMessage::assistant_tool_calls(
                turn.content.clone(),
                turn.tool_calls.clone(),
            ));
            for wire_call in &turn.tool_calls {
                let mut call = PendingToolCall::from_request(wire_call);
                match ctx
                    .executor
                    .execute(&mut call, ctx.registry, ctx.manager, ctx.policy, ctx.cancel)
                    .await
                {
                    Ok(message) => staged.push(message),
                    Err(_) => return Err(TurnError::Cancelled),
                }
            }
            self.history.extend(staged);
        }

        Err(TurnError::IterationLimit(self.max_iterations))
    }

    /// Commits a user-forced tool exchange directly: the synthetic assistant
    /// request and its result, with no completion round trip.
    pub fn record_tool_exchange(&mut self, request: crate::api::ChatToolCall, result: ChatMessage) {
        self.history
            .push(ChatMessage::assistant_tool_calls(None, vec![request]));
        self.history.push(result);
    }
}
