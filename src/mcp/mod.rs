//! MCP layer — stdio tool servers and the registry that fans out over them.
//!
//! This module handles:
//! - Spawning tool-server child processes and the JSON-RPC stdio protocol
//! - Session lifecycle (connect with backoff, liveness probing, teardown)
//! - Tool discovery and first-match dispatch across all sessions
//! - Server configuration loading and validation

pub mod config;
pub mod errors;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use config::{default_config_path, load_servers_config};
pub use errors::McpError;
pub use registry::{RegistryConfig, ServerRegistry};
pub use session::{ConnectionState, StdioSession, ToolChannel};
pub use types::{ServerConfig, ServersConfig, ToolContent, ToolDescriptor};
