//! Command-line surface and runtime entrypoint.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::core::config;
use crate::session::{Session, SessionOptions};

#[derive(Parser)]
#[command(name = "estafette")]
#[command(about = "A terminal chat client whose LLM can call tools from MCP servers")]
#[command(
    long_about = "Estafette connects a chat completion service to tools exposed by MCP servers \
over stdio, streamable HTTP, or SSE transports.\n\n\
Configuration lives in two JSON files (override with --azureconfig / --mcpconfig):\n\
  AzureOpenAI.json  Completion endpoint, credentials, and sampling parameters\n\
  mcp.json          Tool servers: {\"servers\": {name: {type, command|url, ...}}}\n\n\
REPL commands:\n\
  reset                     Clear conversation history (keeps the system prompt)\n\
  tools                     List servers and their tools\n\
  tools describe <server>   Show per-tool descriptions\n\
  tools enable <server>     Offer the server's tools to the model again\n\
  tools disable <server>    Hide the server's tools from the model\n\
  tools reset               Reload mcp.json and reconnect everything\n\
  #<tool> <message>         Invoke a tool directly, bypassing the model\n\
  exit | quit               Leave"
)]
pub struct Args {
    /// Delete the completion config and write a fresh template, then exit
    #[arg(long)]
    pub reset: bool,

    /// Verbose output: debug-level diagnostics and tool-call arguments
    #[arg(long, short)]
    pub verbose: bool,

    /// Append every conversation message to this file as JSON lines
    #[arg(long, value_name = "PATH")]
    pub chatlog: Option<PathBuf>,

    /// Run one turn non-interactively with auto-approved tool calls
    #[arg(long, value_name = "INPUT")]
    pub batch: Option<String>,

    /// With --batch: print the bare assistant text with no decoration
    #[arg(long, requires = "batch")]
    pub raw: bool,

    /// Path to the completion service config (default: platform config dir)
    #[arg(long, value_name = "FILE")]
    pub azureconfig: Option<PathBuf>,

    /// Path to the MCP server config (default: platform config dir)
    #[arg(long, value_name = "FILE")]
    pub mcpconfig: Option<PathBuf>,
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let completion_path = config::completion_config_path(args.azureconfig.as_deref())?;
    if args.reset {
        config::reset_completion_config(&completion_path)?;
        println!(
            "✅ Wrote a fresh completion config template to {}",
            completion_path.display()
        );
        println!("   Fill in endpoint, api_key, api_version, and deployment, then run again.");
        return Ok(());
    }

    let completion_config = config::load_completion_config(&completion_path)?;
    let mcp_config_path = config::mcp_config_path(args.mcpconfig.as_deref())?;
    let interactive = args.batch.is_none();

    let session = Session::start(SessionOptions {
        completion_config,
        mcp_config_path,
        chatlog: args.chatlog,
        verbose: args.verbose,
        interactive,
    })
    .await?;

    match args.batch {
        Some(input) => session.run_batch(&input, args.raw).await,
        None => session.run_interactive().await,
    }
}

/// Diagnostics go to stderr through `tracing`; stdout belongs to the
/// conversation. `RUST_LOG` overrides the defaults.
fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "estafette=debug"
    } else {
        "estafette=warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
