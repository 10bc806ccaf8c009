//! Interactive and batch session drivers.
//!
//! The session owns the whole runtime context: server connections, the tool
//! registry, the conversation engine, the completion backend, the approval
//! policy, and the optional transcript log. User input is dispatched either
//! to a local command or into a conversation turn.

use std::error::Error;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatToolCall, ChatToolCallFunction, CompletionClient};
use crate::core::config::{self, CompletionConfig};
use crate::core::conversation::{ConversationEngine, TurnContext, TurnError};
use crate::core::tool_call::PendingToolCall;
use crate::logging::ChatLogger;
use crate::mcp::executor::{ApprovalPolicy, AutoApprove, InteractiveApproval, ToolCallExecutor};
use crate::mcp::manager::{ConnectionState, ServerManager};
use crate::mcp::registry::ToolRegistry;
use crate::mcp::transport::TransportKind;
use crate::utils::input::read_user_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Continue,
    Quit,
}

pub struct SessionOptions {
    pub completion_config: CompletionConfig,
    pub mcp_config_path: PathBuf,
    pub chatlog: Option<PathBuf>,
    pub verbose: bool,
    pub interactive: bool,
}

pub struct Session {
    mcp_config_path: PathBuf,
    manager: ServerManager,
    registry: ToolRegistry,
    engine: ConversationEngine,
    backend: CompletionClient,
    executor: ToolCallExecutor,
    policy: Box<dyn ApprovalPolicy>,
    logger: Option<ChatLogger>,
    interactive: bool,
    forced_calls: u64,
}

impl Session {
    /// Builds the full session context: dials every configured tool server
    /// (concurrently, best effort) and assembles the registry from whatever
    /// came up Ready.
    pub async fn start(options: SessionOptions) -> Result<Self, Box<dyn Error>> {
        let backend = CompletionClient::new(&options.completion_config)?;
        let engine = ConversationEngine::new(
            options.completion_config.system_prompt(),
            options.completion_config.max_tool_iterations(),
        );
        let executor = ToolCallExecutor::new(
            options.completion_config.tool_timeout(),
            options.interactive,
            options.verbose,
        );
        let policy: Box<dyn ApprovalPolicy> = if options.interactive {
            Box::new(InteractiveApproval::default())
        } else {
            Box::new(AutoApprove)
        };
        let logger = match &options.chatlog {
            Some(path) => Some(ChatLogger::new(path)?),
            None => None,
        };

        let mut session = Self {
            mcp_config_path: options.mcp_config_path,
            manager: ServerManager::new(),
            registry: ToolRegistry::new(),
            engine,
            backend,
            executor,
            policy,
            logger,
            interactive: options.interactive,
            forced_calls: 0,
        };

        let descriptors = config::load_mcp_servers(&session.mcp_config_path)?;
        if !descriptors.is_empty() {
            session.say(&format!(
                "🔗 Connecting to {} tool server(s)…",
                descriptors.len()
            ));
        }
        session.manager.connect_all(descriptors).await;
        session.rebuild_registry();
        session.print_connection_summary();

        session.log_messages(0);
        Ok(session)
    }

    pub async fn run_interactive(mut self) -> Result<(), Box<dyn Error>> {
        println!("\n📝 Starting AI agent chat — 'reset' to reset history, 'exit' to quit\n");
        loop {
            let line = match read_user_line("👤 User> ").await? {
                Some(line) => line,
                None => break,
            };
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if self.dispatch(input).await == SessionOutcome::Quit {
                break;
            }
        }
        self.manager.disconnect_all().await;
        Ok(())
    }

    /// One turn, auto-approved, printing only the final assistant text (bare
    /// in raw mode).
    pub async fn run_batch(mut self, input: &str, raw: bool) -> Result<(), Box<dyn Error>> {
        let logged = self.engine.history().len();
        let result = {
            let ctx = TurnContext {
                backend: &self.backend,
                registry: &self.registry,
                manager: &mut self.manager,
                executor: &self.executor,
                policy: self.policy.as_ref(),
                cancel: None,
            };
            self.engine.run_turn(input, ctx).await
        };
        self.log_messages(logged);
        self.manager.disconnect_all().await;
        match result {
            Ok(content) => {
                if raw {
                    println!("{content}");
                } else {
                    println!("🤖 AI> {content}");
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn dispatch(&mut self, input: &str) -> SessionOutcome {
        if let Some(rest) = input.strip_prefix('#') {
            self.forced_invocation(rest.trim_start()).await;
            return SessionOutcome::Continue;
        }

        let lower = input.to_lowercase();
        match lower.as_str() {
            "exit" | "quit" => {
                println!("👋 Goodbye!");
                return SessionOutcome::Quit;
            }
            "reset" => {
                self.engine.reset();
                self.policy.reset();
                println!("🔄 History reset");
                if let Some(logger) = &mut self.logger {
                    for message in self.engine.history() {
                        if let Err(err) = logger.append(message) {
                            warn!(error = %err, "Chat log write failed");
                        }
                    }
                }
                return SessionOutcome::Continue;
            }
            "tools" => {
                self.show_tools();
                return SessionOutcome::Continue;
            }
            "tools reset" => {
                self.tools_reset().await;
                return SessionOutcome::Continue;
            }
            _ => {}
        }

        if lower.starts_with("tools describe ") {
            self.describe_server(input["tools describe ".len()..].trim());
        } else if lower.starts_with("tools enable ") {
            self.set_server_enabled(input["tools enable ".len()..].trim(), true);
        } else if lower.starts_with("tools disable ") {
            self.set_server_enabled(input["tools disable ".len()..].trim(), false);
        } else {
            self.chat_turn(input).await;
        }
        SessionOutcome::Continue
    }

    async fn chat_turn(&mut self, input: &str) {
        let logged = self.engine.history().len();
        let token = CancellationToken::new();
        let result = {
            let ctx = TurnContext {
                backend: &self.backend,
                registry: &self.registry,
                manager: &mut self.manager,
                executor: &self.executor,
                policy: self.policy.as_ref(),
                cancel: Some(&token),
            };
            let turn = self.engine.run_turn(input, ctx);
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    result = &mut turn => break result,
                    signal = tokio::signal::ctrl_c() => {
                        match signal {
                            Ok(()) => {
                                println!();
                                println!("⚠️  Interrupting…");
                                token.cancel();
                            }
                            Err(err) => {
                                warn!(error = %err, "Interrupt handler unavailable");
                                break (&mut turn).await;
                            }
                        }
                    }
                }
            }
        };
        self.log_messages(logged);
        self.prune_registry();

        match result {
            Ok(content) => println!("🤖 AI> {content}"),
            Err(TurnError::Cancelled) => {
                println!("⚠️ Turn interrupted; partial tool results were discarded");
            }
            Err(err) => println!("⚠️ {err}"),
        }
    }

    /// Drops registry entries whose connection left Ready (for example a
    /// stdio server that died mid-call), so the manifest never advertises
    /// tools that cannot run.
    fn prune_registry(&mut self) {
        for server in self.registry.servers() {
            let ready = self
                .manager
                .connection(&server)
                .is_some_and(|connection| connection.state.is_ready());
            if !ready {
                debug!(server = %server, "Dropping tools for a connection that left Ready");
                self.registry.remove(&server);
            }
        }
    }

    /// `#<tool> <message>`: run one tool directly, bypassing the model's
    /// selection. The result lands in history as a regular tool exchange so
    /// the model can build on it next turn.
    async fn forced_invocation(&mut self, rest: &str) {
        let (tool_name, message) = match rest.split_once(char::is_whitespace) {
            Some((name, message)) => (name, message.trim()),
            None => (rest, ""),
        };
        if tool_name.is_empty() {
            println!("⚠️ Usage: #<tool_name> <message>");
            return;
        }
        if self.registry.resolve_any(tool_name).is_none() {
            println!("⚠️ No such tool: {tool_name}");
            return;
        }

        self.forced_calls += 1;
        let call_id = format!("forced-{}", self.forced_calls);
        let mut call =
            PendingToolCall::forced(call_id.clone(), tool_name, forced_arguments(message));
        let raw_arguments = call.raw_arguments.clone();

        let token = CancellationToken::new();
        let result = {
            let execution = self.executor.execute(
                &mut call,
                &self.registry,
                &mut self.manager,
                self.policy.as_ref(),
                Some(&token),
            );
            tokio::pin!(execution);
            loop {
                tokio::select! {
                    result = &mut execution => break result,
                    signal = tokio::signal::ctrl_c() => {
                        match signal {
                            Ok(()) => {
                                println!();
                                token.cancel();
                            }
                            Err(err) => {
                                warn!(error = %err, "Interrupt handler unavailable");
                                break (&mut execution).await;
                            }
                        }
                    }
                }
            }
        };

        match result {
            Ok(result_message) => {
                println!(
                    "🛠️ {}",
                    result_message.content.as_deref().unwrap_or("(no content)")
                );
                let logged = self.engine.history().len();
                self.engine.record_tool_exchange(
                    ChatToolCall {
                        id: call_id,
                        kind: "function".to_string(),
                        function: ChatToolCallFunction {
                            name: tool_name.to_string(),
                            arguments: raw_arguments,
                        },
                    },
                    result_message,
                );
                self.log_messages(logged);
            }
            Err(_) => println!("⚠️ Tool call interrupted"),
        }
        self.prune_registry();
    }

    fn show_tools(&self) {
        if self.manager.connections().is_empty() {
            println!("🛠️ No tool servers configured");
            return;
        }
        println!("🛠️ Configured MCP servers and their tools (status):");
        for connection in self.manager.connections() {
            let name = connection.name();
            let status = match &connection.state {
                ConnectionState::Ready => {
                    if self.registry.is_server_enabled(name) {
                        "enabled"
                    } else {
                        "disabled"
                    }
                }
                ConnectionState::Failed(_) => "failed",
                ConnectionState::Disconnected => "disconnected",
                ConnectionState::Connecting => "connecting",
            };
            let tools: Vec<&str> = self
                .registry
                .tools_for(name)
                .iter()
                .map(|entry| entry.visible_name.as_str())
                .collect();
            println!("🧰 {name} [{status}]: {}", tools.join(", "));
            if let ConnectionState::Failed(reason) = &connection.state {
                println!("   ↳ {reason}");
            }
        }
    }

    fn describe_server(&self, server: &str) {
        let tools = self.registry.tools_for(server);
        if tools.is_empty() {
            println!("⚠️ No tools found for server: {server}");
            return;
        }
        println!("📝 Tools for server '{server}':");
        for entry in tools {
            println!(
                "- {}: {}",
                entry.visible_name,
                entry.tool.description.as_deref().unwrap_or("No description")
            );
        }
    }

    fn set_server_enabled(&mut self, server: &str, enabled: bool) {
        if self.manager.connection(server).is_none() {
            println!("⚠️ No such server: {server}");
            return;
        }
        self.registry.set_server_enabled(server, enabled);
        if enabled {
            println!("🔓 Enabled all tools for server: {server}");
        } else {
            println!("🔒 Disabled all tools for server: {server}");
        }
    }

    /// Reloads the MCP configuration, tears down every connection (stdio
    /// children included), reconnects, and rebuilds the registry from
    /// scratch. Runtime enable/disable flags do not survive the rebuild.
    async fn tools_reset(&mut self) {
        let descriptors = match config::load_mcp_servers(&self.mcp_config_path) {
            Ok(descriptors) => descriptors,
            Err(err) => {
                println!("⚠️ Could not reload tool configuration: {err}");
                return;
            }
        };
        self.manager.reconnect_all(descriptors).await;
        self.rebuild_registry();
        self.print_connection_summary();
        println!("🔄 Tools reset: reloaded configuration and reconnected to MCP servers");
    }

    fn rebuild_registry(&mut self) {
        self.registry = ToolRegistry::new();
        let merges: Vec<(String, Vec<rust_mcp_schema::Tool>)> = self
            .manager
            .connections()
            .iter()
            .filter(|connection| connection.state.is_ready())
            .map(|connection| (connection.name().to_string(), connection.tools.clone()))
            .collect();
        for (server, tools) in merges {
            self.registry.merge(&server, tools);
        }
        debug!(
            tools = self.registry.manifest().len(),
            "Tool registry rebuilt"
        );
    }

    fn print_connection_summary(&self) {
        for connection in self.manager.connections() {
            let name = connection.name();
            let transport = TransportKind::from_descriptor(&connection.descriptor)
                .map(TransportKind::label)
                .unwrap_or("unknown");
            match &connection.state {
                ConnectionState::Ready => self.say(&format!(
                    "✅ Connected to {name} ({transport}) — {} tools",
                    connection.tools.len()
                )),
                ConnectionState::Failed(reason) => {
                    self.say(&format!("❌ Connection to {name} failed: {reason}"));
                }
                ConnectionState::Disconnected => {
                    self.say(&format!("⏸️ {name} is disabled in configuration"));
                }
                ConnectionState::Connecting => {}
            }
        }
    }

    /// Appends every message committed since `from` to the chat log.
    fn log_messages(&mut self, from: usize) {
        let Some(logger) = &mut self.logger else {
            return;
        };
        if let Err(err) = logger.append_all(&self.engine.history()[from..]) {
            warn!(path = %logger.path().display(), error = %err, "Chat log write failed");
        }
    }

    /// Status output; suppressed in batch mode so stdout carries only the
    /// final answer.
    fn say(&self, message: &str) {
        if self.interactive {
            println!("{message}");
        }
    }
}

/// Forced-invocation arguments: a JSON object passes through verbatim,
/// anything else is wrapped as `{"message": …}` so simple tools get the text
/// in a predictable place.
fn forced_arguments(message: &str) -> serde_json::Map<String, serde_json::Value> {
    if !message.is_empty() {
        if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(message) {
            return map;
        }
    }
    let mut map = serde_json::Map::new();
    if !message.is_empty() {
        map.insert(
            "message".to_string(),
            serde_json::Value::String(message.to_string()),
        );
    }
    map
}
