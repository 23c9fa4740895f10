//! Tool-orchestration core for an MCP chat client.
//!
//! Connects to tool-providing subprocesses over a line-oriented stdio
//! protocol, exposes their tools to a completion API, and drives the
//! multi-turn loop where the model requests tool invocations, receives
//! results, and continues until it produces a final answer.
//!
//! The hosting application wires the pieces together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use mcp_chat_core::gateway::{GatewayConfig, ModelGateway};
//! use mcp_chat_core::mcp::{load_servers_config, RegistryConfig, ServerRegistry};
//! use mcp_chat_core::orchestrator::{OrchestratorConfig, QueryOrchestrator};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! mcp_chat_core::logging::init();
//!
//! let config = load_servers_config(std::path::Path::new("servers.json"))?;
//! let registry = Arc::new(ServerRegistry::new(config, RegistryConfig::default()));
//! for name in registry.configured_servers() {
//!     registry.connect(&name, Duration::from_secs(120)).await?;
//! }
//! let sweep = registry.spawn_liveness_sweep(Duration::from_secs(300));
//!
//! let gateway = Arc::new(ModelGateway::new(GatewayConfig::default())?);
//! let orchestrator =
//!     QueryOrchestrator::new(registry.clone(), gateway, OrchestratorConfig::default());
//!
//! let transcript = orchestrator.process_query("list my files", &[]).await;
//! println!("{transcript}");
//!
//! sweep.abort();
//! registry.cleanup_all().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod gateway;
pub mod logging;
pub mod mcp;
pub mod orchestrator;

pub use gateway::{GatewayConfig, GatewayError, ModelGateway};
pub use mcp::{McpError, RegistryConfig, ServerRegistry, ServersConfig};
pub use orchestrator::{OrchestratorConfig, QueryOrchestrator, Turn, TurnRole};
