//! Estafette is a terminal chat client in which a remote LLM completion
//! service can call tools provided by external MCP servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns the tool-server side: transports (stdio, streamable HTTP,
//!   legacy SSE), the connection manager, the merged tool registry, and the
//!   tool-call executor with its approval policies.
//! - [`core`] owns configuration, the conversation engine that drives the
//!   turn-by-turn tool-calling loop, and the pending tool-call lifecycle.
//! - [`api`] defines the chat-completions payloads and the completion
//!   client used to talk to the LLM service.
//! - [`session`] runs the interactive REPL and the single-shot batch mode,
//!   dispatching user commands and chat turns.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
pub mod session;
pub mod utils;
