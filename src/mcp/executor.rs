//! Tool-call execution: resolve, approve, validate, invoke, and normalize
//! every outcome into a tool-role message so the conversation can continue
//! no matter what the call did.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manager::ServerManager;
use super::registry::ToolRegistry;
use crate::api::ChatMessage;
use crate::core::cancel::{run_cancellable, Cancellable, Interrupted};
use crate::core::tool_call::PendingToolCall;
use crate::utils::input::read_user_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

/// Pluggable gate in front of every model-requested tool call.
#[async_trait]
pub trait ApprovalPolicy: Send + Sync {
    async fn review(&self, call: &PendingToolCall, server: &str) -> ApprovalDecision;

    /// Called when the conversation is reset.
    fn reset(&self) {}
}

/// Approves everything. Used in batch mode.
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalPolicy for AutoApprove {
    async fn review(&self, _call: &PendingToolCall, _server: &str) -> ApprovalDecision {
        ApprovalDecision::Approved
    }
}

/// Prompts the human for each call. Answering `a` latches approval for the
/// rest of the conversation; `reset` clears the latch.
#[derive(Debug, Default)]
pub struct InteractiveApproval {
    always: AtomicBool,
}

#[async_trait]
impl ApprovalPolicy for InteractiveApproval {
    async fn review(&self, call: &PendingToolCall, server: &str) -> ApprovalDecision {
        if self.always.load(Ordering::Relaxed) {
            return ApprovalDecision::Approved;
        }
        loop {
            let prompt = format!(
                "Execute tool 🔧 {} ({server})? (y=yes, n=no, a=always, s=show args) ",
                call.tool_name
            );
            let answer = match read_user_line(&prompt).await {
                Ok(Some(line)) => line.trim().to_ascii_lowercase(),
                // EOF or a broken stdin can no longer grant approval.
                Ok(None) | Err(_) => return ApprovalDecision::Rejected,
            };
            match answer.as_str() {
                "y" => return ApprovalDecision::Approved,
                "n" => return ApprovalDecision::Rejected,
                "a" => {
                    self.always.store(true, Ordering::Relaxed);
                    return ApprovalDecision::Approved;
                }
                "s" => println!("Tool arguments: {}", call.raw_arguments),
                _ => println!("Invalid choice, please select y, n, a, or s."),
            }
        }
    }

    fn reset(&self) {
        self.always.store(false, Ordering::Relaxed);
    }
}

pub struct ToolCallExecutor {
    tool_timeout: Duration,
    /// Announce invocations on stdout. Off in batch mode, where stdout
    /// carries only the final answer.
    announce: bool,
    verbose: bool,
}

impl ToolCallExecutor {
    pub fn new(tool_timeout: Duration, announce: bool, verbose: bool) -> Self {
        Self {
            tool_timeout,
            announce,
            verbose,
        }
    }

    /// Runs one pending call to a terminal status and returns the tool
    /// message to append. The only non-message outcome is user cancellation,
    /// which aborts the whole turn.
    pub async fn execute(
        &self,
        call: &mut PendingToolCall,
        registry: &ToolRegistry,
        manager: &mut ServerManager,
        policy: &dyn ApprovalPolicy,
        cancel: Option<&CancellationToken>,
    ) -> Result<ChatMessage, Interrupted> {
        // Re-resolve at execution time: the manifest can shrink between the
        // model's request and now.
        let entry = if call.forced {
            registry.resolve_any(&call.tool_name)
        } else {
            registry.resolve(&call.tool_name)
        };
        let Some(entry) = entry else {
            call.fail();
            return Ok(self.failure_message(call, "unknown_tool", &format!(
                "no tool named `{}` is currently available",
                call.tool_name
            )));
        };
        let server = entry.server.clone();
        let wire_name = entry.tool.name.clone();
        let schema = ToolRegistry::input_schema_value(entry);

        if call.forced {
            call.approve();
        } else {
            match run_cancellable(cancel, policy.review(call, &server)).await {
                Cancellable::Cancelled => {
                    call.fail();
                    return Err(Interrupted);
                }
                Cancellable::Done(ApprovalDecision::Approved) => call.approve(),
                Cancellable::Done(ApprovalDecision::Rejected) => {
                    call.reject();
                    debug!(tool = %call.tool_name, "Tool call rejected by user");
                    return Ok(self.rejection_message(call));
                }
            }
        }

        let arguments = call.argument_object();
        if let Err(reason) = validate_arguments(&schema, &arguments) {
            call.fail();
            return Ok(self.failure_message(call, "invalid_arguments", &reason));
        }

        if self.announce {
            if self.verbose {
                println!(
                    "🔧 Calling tool {} with args {}",
                    call.tool_name, call.raw_arguments
                );
            } else {
                println!("🔧 Calling tool {}", call.tool_name);
            }
        }
        call.begin_execution();

        let invocation = manager.invoke(&server, &wire_name, arguments, self.tool_timeout);
        match run_cancellable(cancel, invocation).await {
            Cancellable::Cancelled => {
                call.fail();
                Err(Interrupted)
            }
            Cancellable::Done(Ok(result)) => {
                call.complete();
                let content = serde_json::to_string(&result)
                    .unwrap_or_else(|_| json!({"error": {"kind": "unserializable_result"}}).to_string());
                Ok(ChatMessage::tool_result(&call.id, &call.tool_name, content))
            }
            Cancellable::Done(Err(err)) => {
                call.fail();
                debug!(tool = %call.tool_name, error = %err, "Tool invocation failed");
                Ok(self.failure_message(call, "invocation_failed", &err.to_string()))
            }
        }
    }

    fn rejection_message(&self, call: &PendingToolCall) -> ChatMessage {
        // The model sees a declined tool, not a crash.
        let payload = json!({"error": {"kind": "rejected", "message": "Tool execution rejected by user"}});
        ChatMessage::tool_result(&call.id, &call.tool_name, payload.to_string())
    }

    fn failure_message(&self, call: &PendingToolCall, kind: &str, message: &str) -> ChatMessage {
        let payload = json!({"error": {"kind": kind, "message": message}});
        ChatMessage::tool_result(&call.id, &call.tool_name, payload.to_string())
    }
}

/// Validates the argument object against the tool's schema, once per call.
/// An unusable schema is treated as no constraint; tool servers own their
/// schemas and some publish invalid ones.
fn validate_arguments(
    schema: &Value,
    arguments: &serde_json::Map<String, Value>,
) -> Result<(), String> {
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            debug!(error = %err, "Tool schema is not a usable JSON schema; skipping validation");
            return Ok(());
        }
    };
    let instance = Value::Object(arguments.clone());
    validator
        .validate(&instance)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatToolCall, ChatToolCallFunction};
    use crate::core::tool_call::ToolCallStatus;
    use crate::mcp::testing::{
        call_tool_response, rpc_error_response, stdio_descriptor, tool, tool_with_schema,
        FakeTransport,
    };
    use serde_json::json;

    struct RejectAll;

    #[async_trait]
    impl ApprovalPolicy for RejectAll {
        async fn review(&self, _call: &PendingToolCall, _server: &str) -> ApprovalDecision {
            ApprovalDecision::Rejected
        }
    }

    fn pending(tool_name: &str, arguments: &str) -> PendingToolCall {
        PendingToolCall::from_request(&ChatToolCall {
            id: "call-1".to_string(),
            kind: "function".to_string(),
            function: ChatToolCallFunction {
                name: tool_name.to_string(),
                arguments: arguments.to_string(),
            },
        })
    }

    fn executor() -> ToolCallExecutor {
        ToolCallExecutor::new(Duration::from_secs(5), false, false)
    }

    fn ready_manager(transport: FakeTransport) -> ServerManager {
        let mut manager = ServerManager::new();
        manager.insert_ready_for_tests(
            stdio_descriptor("alpha", "srv"),
            Box::new(transport),
            Vec::new(),
        );
        manager
    }

    fn registry_with(tools: Vec<rust_mcp_schema::Tool>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.merge("alpha", tools);
        registry
    }

    #[tokio::test]
    async fn successful_call_completes_and_carries_the_result() {
        let transport = FakeTransport::new(vec![Ok(call_tool_response("hello"))]);
        let calls = transport.recorded_calls();
        let mut manager = ready_manager(transport);
        let registry = registry_with(vec![tool("echo")]);
        let mut call = pending("echo", r#"{"message": "hi"}"#);

        let message = executor()
            .execute(&mut call, &registry, &mut manager, &AutoApprove, None)
            .await
            .expect("message");

        assert_eq!(call.status(), ToolCallStatus::Completed);
        assert_eq!(message.role, "tool");
        assert_eq!(message.tool_call_id.as_deref(), Some("call-1"));
        assert!(message.content.as_deref().unwrap_or("").contains("hello"));
        let recorded = calls.lock().expect("calls lock");
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "echo");
        assert_eq!(recorded[0].1.get("message"), Some(&json!("hi")));
    }

    #[tokio::test]
    async fn unknown_tool_fails_without_reaching_a_server() {
        let mut manager = ServerManager::new();
        let registry = ToolRegistry::new();
        let mut call = pending("ghost", "{}");

        let message = executor()
            .execute(&mut call, &registry, &mut manager, &AutoApprove, None)
            .await
            .expect("message");

        assert_eq!(call.status(), ToolCallStatus::Failed);
        assert!(message.content.as_deref().unwrap_or("").contains("unknown_tool"));
    }

    #[tokio::test]
    async fn rejection_synthesizes_a_declined_result() {
        let transport = FakeTransport::new(Vec::new());
        let calls = transport.recorded_calls();
        let mut manager = ready_manager(transport);
        let registry = registry_with(vec![tool("echo")]);
        let mut call = pending("echo", "{}");

        let message = executor()
            .execute(&mut call, &registry, &mut manager, &RejectAll, None)
            .await
            .expect("message");

        assert_eq!(call.status(), ToolCallStatus::Rejected);
        assert!(message.content.as_deref().unwrap_or("").contains("rejected"));
        assert!(calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn schema_violations_fail_before_invocation() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
            "required": ["count"]
        });
        let transport = FakeTransport::new(Vec::new());
        let calls = transport.recorded_calls();
        let mut manager = ready_manager(transport);
        let registry = registry_with(vec![tool_with_schema("echo", schema)]);
        let mut call = pending("echo", r#"{"count": "three"}"#);

        let message = executor()
            .execute(&mut call, &registry, &mut manager, &AutoApprove, None)
            .await
            .expect("message");

        assert_eq!(call.status(), ToolCallStatus::Failed);
        assert!(message
            .content
            .as_deref()
            .unwrap_or("")
            .contains("invalid_arguments"));
        assert!(calls.lock().expect("calls lock").is_empty());
    }

    #[tokio::test]
    async fn server_errors_become_tool_content_not_faults() {
        let transport = FakeTransport::new(vec![Ok(rpc_error_response(-32000, "backend exploded"))]);
        let mut manager = ready_manager(transport);
        let registry = registry_with(vec![tool("echo")]);
        let mut call = pending("echo", "{}");

        let message = executor()
            .execute(&mut call, &registry, &mut manager, &AutoApprove, None)
            .await
            .expect("message");

        assert_eq!(call.status(), ToolCallStatus::Failed);
        assert!(message
            .content
            .as_deref()
            .unwrap_or("")
            .contains("invocation_failed"));
    }

    #[tokio::test]
    async fn forced_calls_resolve_against_disabled_servers() {
        let transport = FakeTransport::new(vec![Ok(call_tool_response("forced"))]);
        let mut manager = ready_manager(transport);
        let mut registry = registry_with(vec![tool("echo")]);
        registry.set_server_enabled("alpha", false);

        let mut args = serde_json::Map::new();
        args.insert("message".to_string(), json!("hello"));
        let mut call = PendingToolCall::forced("forced-1", "echo", args);

        let message = executor()
            .execute(&mut call, &registry, &mut manager, &RejectAll, None)
            .await
            .expect("message");

        // RejectAll was never consulted: forced calls are approved up front.
        assert_eq!(call.status(), ToolCallStatus::Completed);
        assert!(message.content.as_deref().unwrap_or("").contains("forced"));
    }

    #[tokio::test]
    async fn cancellation_aborts_without_a_message() {
        let transport =
            FakeTransport::new(vec![Ok(call_tool_response("late"))]).with_delay(Duration::from_secs(30));
        let mut manager = ready_manager(transport);
        let registry = registry_with(vec![tool("echo")]);
        let mut call = pending("echo", "{}");

        let token = CancellationToken::new();
        token.cancel();
        let result = executor()
            .execute(&mut call, &registry, &mut manager, &AutoApprove, Some(&token))
            .await;

        assert!(result.is_err());
        assert_eq!(call.status(), ToolCallStatus::Failed);
    }

    #[test]
    fn interactive_reset_clears_the_always_latch() {
        let policy = InteractiveApproval::default();
        policy.always.store(true, Ordering::Relaxed);
        policy.reset();
        assert!(!policy.always.load(Ordering::Relaxed));
    }
}
