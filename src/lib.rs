//! langserv-client library
//!
//! A minimal client for language servers speaking JSON-RPC 2.0 over a
//! stdio byte stream:
//!
//! - `framing` - Content-Length framing (encode, incremental decode)
//! - `jsonrpc` - request/notification/response message model
//! - `session` - id correlation, pending requests and the initialize handshake
//! - `handler` - hook for messages the server originates
//! - `protocol` - typed `initialize` payloads
//! - `process` / `config` - spawning the server and configuring the client
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use langserv_client::{ClientConfig, LoggingHandler, ServerProcess, Session};
//!
//! let config = ClientConfig::default();
//! let (process, io) = ServerProcess::spawn(&config)?;
//! let session = Session::start(io.stdout, io.stdin, config.initialize_params(), Arc::new(LoggingHandler)).await?;
//! let symbols = session.request("workspace/symbol", serde_json::json!({"query": ""})).await?;
//! ```

pub mod config;
pub mod framing;
pub mod handler;
pub mod jsonrpc;
pub mod process;
pub mod protocol;
pub mod session;

pub use config::ClientConfig;
pub use framing::{encode_message, FrameDecoder, FramedReader, FramingError};
pub use handler::{EventForwarder, InboundHandler, LoggingHandler, SessionEvent};
pub use jsonrpc::{Message, Notification, Request, RequestId, Response, ResponseError};
pub use process::{ServerIo, ServerProcess};
pub use protocol::{InitializeParams, InitializeResult};
pub use session::{Session, SessionError, SessionState};
