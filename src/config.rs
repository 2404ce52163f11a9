//! Client configuration.
//!
//! `ClientConfig` is plain data so library users can build it directly.
//! The binary fills it from the command line, with environment fallbacks:
//!
//! 1. Server command given on the command line
//! 2. `LANGSERV_SERVER_PATH` environment variable
//! 3. `vala-language-server` on PATH

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::info;

use crate::protocol::InitializeParams;
use crate::session::DEFAULT_SHUTDOWN_GRACE;

/// Environment variable overriding the server command.
pub const SERVER_PATH_ENV: &str = "LANGSERV_SERVER_PATH";

/// Environment variable providing the workspace root.
pub const ROOT_ENV: &str = "LANGSERV_ROOT";

/// Server command used when nothing else is configured.
pub const DEFAULT_SERVER_COMMAND: &str = "vala-language-server";

/// Everything needed to spawn a server and open a session with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub server_command: String,
    pub server_args: Vec<String>,
    /// Extra environment for the server process (e.g. `G_MESSAGES_DEBUG=all`).
    pub server_env: Vec<(String, String)>,
    pub root_path: Option<PathBuf>,
    /// Passed through to the server unexamined.
    pub initialization_options: Value,
    pub capabilities: Value,
    /// Local deadline for requests issued by the front end. `None` waits forever.
    pub request_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_command: DEFAULT_SERVER_COMMAND.to_string(),
            server_args: Vec::new(),
            server_env: Vec::new(),
            root_path: None,
            initialization_options: Value::Null,
            capabilities: json!({}),
            request_timeout: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ClientConfig {
    /// Handshake params derived from this configuration.
    pub fn initialize_params(&self) -> InitializeParams {
        InitializeParams::new(self.root_path.as_deref())
            .with_initialization_options(self.initialization_options.clone())
            .with_capabilities(self.capabilities.clone())
    }

    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let server_command = match &cli.server {
            Some(server) => server.clone(),
            None => {
                info!(
                    "No server command given, using default: {}",
                    DEFAULT_SERVER_COMMAND
                );
                DEFAULT_SERVER_COMMAND.to_string()
            }
        };

        let initialization_options = match &cli.init_options {
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("Invalid --init-options JSON: {}", raw))?,
            None => Value::Null,
        };

        let server_env = cli
            .env
            .iter()
            .map(|pair| parse_env_pair(pair))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            server_command,
            server_args: cli.server_args.clone(),
            server_env,
            root_path: cli.root.clone(),
            initialization_options,
            capabilities: json!({}),
            request_timeout: cli.timeout_secs.map(Duration::from_secs),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }
}

/// Split a `KEY=VALUE` pair.
pub fn parse_env_pair(pair: &str) -> Result<(String, String)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("Expected KEY=VALUE, got: {}", pair))?;
    if key.is_empty() {
        return Err(anyhow!("Empty environment variable name in: {}", pair));
    }
    Ok((key.to_string(), value.to_string()))
}

/// langserv-client - talk to a language server over stdio
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Language server command
    #[arg(env = SERVER_PATH_ENV)]
    pub server: Option<String>,

    /// Arguments passed to the server
    #[arg(last = true)]
    pub server_args: Vec<String>,

    /// Workspace root sent in the initialize request
    #[arg(short, long, env = ROOT_ENV)]
    pub root: Option<PathBuf>,

    /// initializationOptions as a JSON string
    #[arg(long)]
    pub init_options: Option<String>,

    /// Extra server environment, KEY=VALUE (repeatable)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Timeout in seconds for --request
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Method to call once the session is ready
    #[arg(long)]
    pub request: Option<String>,

    /// Params for --request as a JSON string
    #[arg(long, requires = "request")]
    pub params: Option<String>,
}

impl Cli {
    /// The one-shot request, if any, with parsed params.
    pub fn one_shot_request(&self) -> Result<Option<(String, Value)>> {
        let Some(method) = &self.request else {
            return Ok(None);
        };
        let params = match &self.params {
            Some(raw) => serde_json::from_str(raw)
                .with_context(|| format!("Invalid --params JSON: {}", raw))?,
            None => Value::Null,
        };
        Ok(Some((method.clone(), params)))
    }
}
