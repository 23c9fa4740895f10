//! Server configuration loading.
//!
//! Server declarations live in a JSON or YAML file. Values in a server's
//! `env` map may reference process environment variables with a `$` prefix
//! (`"API_KEY": "$MY_KEY"`); references resolve at load time, unset
//! variables resolve to the empty string. Validation is eager: a server
//! with an empty launch command is a configuration error at startup, not a
//! runtime surprise.

use std::path::{Path, PathBuf};

use super::errors::McpError;
use super::types::ServersConfig;

/// Default location for the servers file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcp-chat")
        .join("servers.json")
}

/// Load, expand, and validate a servers file.
pub fn load_servers_config(path: &Path) -> Result<ServersConfig, McpError> {
    // Pick up a local .env before resolving $VAR references.
    let _ = dotenvy::dotenv();

    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let mut config = parse_config(path, &raw)?;
    expand_env_references(&mut config);
    validate(&config)?;
    Ok(config)
}

fn parse_config(path: &Path, raw: &str) -> Result<ServersConfig, McpError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    match extension {
        "json" => serde_json::from_str(raw).map_err(|e| McpError::Config {
            reason: format!("invalid JSON in {}: {e}", path.display()),
        }),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| McpError::Config {
            reason: format!("invalid YAML in {}: {e}", path.display()),
        }),
        other => Err(McpError::Config {
            reason: format!("unsupported config extension '{other}' for {}", path.display()),
        }),
    }
}

/// Resolve `$VAR` values in every server's env map.
fn expand_env_references(config: &mut ServersConfig) {
    for server in config.servers.values_mut() {
        for value in server.env.values_mut() {
            if let Some(var_name) = value.strip_prefix('$') {
                *value = std::env::var(var_name).unwrap_or_default();
            }
        }
    }
}

fn validate(config: &ServersConfig) -> Result<(), McpError> {
    for (name, server) in &config.servers {
        if server.command.trim().is_empty() {
            return Err(McpError::Config {
                reason: format!("server '{name}' has an empty command"),
            });
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_config(dir: &tempfile::TempDir, file_name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(file_name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_json_config() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_config(
            &dir,
            "servers.json",
            r#"{"servers": {"echo": {"command": "echo-server", "args": ["--stdio"]}}}"#,
        );

        let config = load_servers_config(&path)?;
        assert_eq!(config.servers["echo"].command, "echo-server");
        assert_eq!(config.servers["echo"].args, vec!["--stdio"]);
        Ok(())
    }

    #[test]
    fn test_load_yaml_config() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = write_config(
            &dir,
            "servers.yaml",
            "servers:\n  files:\n    command: file-server\n    args: [\"-q\"]\n",
        );

        let config = load_servers_config(&path)?;
        assert_eq!(config.servers["files"].command, "file-server");
        Ok(())
    }

    #[test]
    fn test_env_reference_expansion() {
        std::env::set_var("MCP_CHAT_TEST_TOKEN", "sekrit");
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "servers.json",
            r#"{"servers": {"echo": {"command": "echo-server", "env": {"TOKEN": "$MCP_CHAT_TEST_TOKEN", "PLAIN": "as-is"}}}}"#,
        );

        let config = load_servers_config(&path).unwrap();
        assert_eq!(config.servers["echo"].env["TOKEN"], "sekrit");
        assert_eq!(config.servers["echo"].env["PLAIN"], "as-is");
    }

    #[test]
    fn test_unset_env_reference_resolves_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "servers.json",
            r#"{"servers": {"echo": {"command": "echo-server", "env": {"TOKEN": "$MCP_CHAT_TEST_UNSET"}}}}"#,
        );

        let config = load_servers_config(&path).unwrap();
        assert_eq!(config.servers["echo"].env["TOKEN"], "");
    }

    #[test]
    fn test_empty_command_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "servers.json",
            r#"{"servers": {"broken": {"command": "  "}}}"#,
        );

        let err = load_servers_config(&path).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_config(&dir, "servers.toml", "servers = {}");

        let err = load_servers_config(&path).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[test]
    fn test_missing_file_rejected() {
        let err = load_servers_config(Path::new("/nonexistent/servers.json")).unwrap_err();
        assert!(matches!(err, McpError::Config { .. }));
    }
}
