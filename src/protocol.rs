//! Handshake payloads and well-known method names.
//!
//! Only the pieces of the Language Server Protocol this client itself
//! relies on are typed here. Capabilities and initialization options are
//! carried as opaque JSON values.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const SHUTDOWN: &str = "shutdown";
    pub const EXIT: &str = "exit";
}

/// Params of the `initialize` request.
///
/// `rootPath` and `initializationOptions` are always transmitted, as
/// `null` when absent. `rootUri` is only added when a root is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub process_id: Option<u32>,
    pub root_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_uri: Option<String>,
    pub initialization_options: Value,
    pub capabilities: Value,
}

impl InitializeParams {
    /// Params for this process with an optional workspace root.
    pub fn new(root_path: Option<&Path>) -> Self {
        Self {
            process_id: Some(std::process::id()),
            root_path: root_path.map(|p| p.to_string_lossy().into_owned()),
            root_uri: root_path.map(path_to_uri),
            initialization_options: Value::Null,
            capabilities: json!({}),
        }
    }

    pub fn with_initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = options;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Convert a file path to a file:// URI with proper percent-encoding.
///
/// Relative paths are resolved against the current directory first.
pub fn path_to_uri(path: &Path) -> String {
    let abs_path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|p| p.join(path))
            .unwrap_or_else(|_| PathBuf::from(path))
    };

    match Url::from_file_path(&abs_path) {
        Ok(url) => url.to_string(),
        Err(_) => {
            // Relative paths that couldn't be resolved
            format!("file://{}", abs_path.to_string_lossy().replace(' ', "%20"))
        }
    }
}
