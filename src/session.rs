//! Session client: request/response correlation and the initialize handshake.
//!
//! A `Session` owns one duplex byte stream to a language server. It assigns
//! request ids, keeps the table of requests awaiting a response, and runs a
//! background task that decodes inbound frames and routes them:
//!
//! ```text
//!  request()/notify() ──► encode ──► [writer lock] ──► peer stdin
//!
//!  peer stdout ──► FramedReader ──► dispatch ─┬─► pending[id] (Response)
//!                                             └─► InboundHandler (Request/Notification)
//! ```
//!
//! # Lifecycle
//!
//! `Uninitialized → Initializing → Ready → Closed`. `Session::start` only
//! returns once the `initialize` response has arrived, so callers never hold
//! a session that is not yet `Ready`. Requests on a session in any other
//! state are rejected rather than queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::framing::{encode_message, write_frame, FramedReader, FramingError};
use crate::handler::InboundHandler;
use crate::jsonrpc::{Message, Notification, Request, RequestId, Response, ResponseError};
use crate::protocol::{methods, InitializeParams, InitializeResult};

/// Default grace period for the `shutdown` request during `Session::shutdown`.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// Session-level error types.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The inbound stream desynchronized or an outbound message could not
    /// be encoded. Shared by every request the failure affected.
    #[error("Framing error: {0}")]
    Framing(#[source] Arc<FramingError>),

    /// The byte stream ended or the session was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer answered this request with an error payload.
    #[error("Peer error: {0}")]
    Peer(ResponseError),

    /// The session has not completed its handshake.
    #[error("Session not ready (state: {0:?})")]
    NotReady(SessionState),

    /// Local timeout layered over a request.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl From<FramingError> for SessionError {
    fn from(err: FramingError) -> Self {
        SessionError::Framing(Arc::new(err))
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Responder = oneshot::Sender<Result<Value, SessionError>>;

/// Bookkeeping for a request awaiting its response.
struct PendingRequest {
    method: String,
    responder: Responder,
}

/// Which states a call may be issued in.
#[derive(Debug, Clone, Copy)]
enum Gate {
    Handshake,
    Ready,
}

/// Why the session closed.
enum CloseCause {
    PeerExited,
    Framing(Arc<FramingError>),
    WriteFailed,
    Local,
}

/// State guarded by a single lock: the id counter, the pending table and
/// the lifecycle state always change together.
struct Inner {
    state: SessionState,
    next_id: u64,
    pending: HashMap<u64, PendingRequest>,
}

struct Shared {
    inner: Mutex<Inner>,
    writer: tokio::sync::Mutex<BoxedWriter>,
    state_tx: watch::Sender<SessionState>,
    handshake: OnceLock<Handshake>,
}

/// The server's answer to `initialize`, kept verbatim next to its typed form.
struct Handshake {
    raw: Value,
    parsed: Option<InitializeResult>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Inner is consistent after every statement, so a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut inner = self.lock();
        if inner.state != from {
            return false;
        }
        inner.state = to;
        drop(inner);
        self.state_tx.send_replace(to);
        debug!("Session state: {:?} -> {:?}", from, to);
        true
    }

    /// Allocate an id and record the pending entry in one step.
    fn register(
        &self,
        method: &str,
        gate: Gate,
    ) -> Result<(u64, oneshot::Receiver<Result<Value, SessionError>>), SessionError> {
        let mut inner = self.lock();
        match (inner.state, gate) {
            (SessionState::Closed, _) => return Err(SessionError::ConnectionClosed),
            (SessionState::Initializing, Gate::Handshake) | (SessionState::Ready, Gate::Ready) => {}
            (state, _) => return Err(SessionError::NotReady(state)),
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let (responder, rx) = oneshot::channel();
        inner.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                responder,
            },
        );
        Ok((id, rx))
    }

    fn cancel(&self, id: u64) {
        if let Some(entry) = self.lock().pending.remove(&id) {
            debug!("Cancelled request {} ({})", id, entry.method);
        }
    }

    /// Encode and write one message under the writer lock.
    ///
    /// Closing the session abandons a write that is waiting for the lock or
    /// for the peer to drain its input.
    async fn send(&self, message: &Message) -> Result<(), SessionError> {
        let frame = encode_message(message)?;
        let mut state_rx = self.state_tx.subscribe();

        let write = async {
            let mut writer = self.writer.lock().await;
            if self.state() == SessionState::Closed {
                return Ok(false);
            }
            write_frame(&mut *writer, &frame).await.map(|()| true)
        };

        tokio::select! {
            written = write => match written {
                Ok(true) => Ok(()),
                Ok(false) => Err(SessionError::ConnectionClosed),
                Err(e) => {
                    error!("Failed to write to peer: {}", e);
                    self.close(CloseCause::WriteFailed);
                    Err(SessionError::ConnectionClosed)
                }
            },
            () = wait_closed(&mut state_rx) => {
                debug!("Session closed while writing, abandoning frame");
                Err(SessionError::ConnectionClosed)
            }
        }
    }

    /// Move to `Closed` and fail every outstanding request.
    fn close(&self, cause: CloseCause) {
        let pending = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            std::mem::take(&mut inner.pending)
        };
        self.state_tx.send_replace(SessionState::Closed);

        let reason = match &cause {
            CloseCause::PeerExited => "peer closed the stream".to_string(),
            CloseCause::Framing(e) => format!("framing error: {}", e),
            CloseCause::WriteFailed => "write to peer failed".to_string(),
            CloseCause::Local => "closed locally".to_string(),
        };
        info!(
            "Session closed ({}), failing {} pending request(s)",
            reason,
            pending.len()
        );

        for (_, entry) in pending {
            let err = match &cause {
                CloseCause::Framing(e) => SessionError::Framing(Arc::clone(e)),
                _ => SessionError::ConnectionClosed,
            };
            let _ = entry.responder.send(Err(err));
        }
    }

    /// Resolve the pending request a response belongs to.
    fn resolve(&self, response: Response) {
        let Some(id) = response.id.as_ref().and_then(RequestId::as_u64) else {
            warn!("Dropping response with unusable id: {:?}", response.id);
            return;
        };

        let (entry, next_id) = {
            let mut inner = self.lock();
            (inner.pending.remove(&id), inner.next_id)
        };

        match entry {
            Some(entry) => {
                debug!("Received response for request {} ({})", id, entry.method);
                let outcome = response.into_result().map_err(SessionError::Peer);
                // Receiver gone means the caller stopped waiting
                let _ = entry.responder.send(outcome);
            }
            None if id < next_id => {
                debug!("Dropping late response for cancelled request {}", id);
            }
            None => {
                warn!("Dropping response for unknown request id {}", id);
            }
        }
    }
}

async fn wait_closed(state_rx: &mut watch::Receiver<SessionState>) {
    let _ = state_rx
        .wait_for(|state| *state == SessionState::Closed)
        .await;
}

/// Removes the pending entry if the request future is dropped before
/// its response arrives.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.cancel(self.id);
    }
}

/// Client session with a language server over a duplex byte stream.
///
/// All methods take `&self`; wrap the session in an `Arc` to issue requests
/// from several tasks at once.
pub struct Session {
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
}

impl Session {
    /// Create a session and perform the `initialize` handshake.
    ///
    /// Sends exactly one `initialize` request, waits for its response,
    /// marks the session `Ready` and sends the `initialized` notification.
    ///
    /// # Errors
    ///
    /// - `Peer` if the server rejects `initialize`
    /// - `ConnectionClosed` / `Framing` if the stream fails first
    ///
    /// On error the session is closed before returning.
    pub async fn start<R, W>(
        reader: R,
        writer: W,
        params: InitializeParams,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self, SessionError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let session = Self::new(reader, writer, handler);
        match session.initialize(params).await {
            Ok(()) => Ok(session),
            Err(e) => {
                warn!("Initialize handshake failed: {}", e);
                session.close().await;
                Err(e)
            }
        }
    }

    fn new<R, W>(reader: R, writer: W, handler: Arc<dyn InboundHandler>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state_tx, _) = watch::channel(SessionState::Uninitialized);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                next_id: 1,
                pending: HashMap::new(),
            }),
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            state_tx,
            handshake: OnceLock::new(),
        });

        let reader_task = tokio::spawn(dispatch_loop(
            Arc::clone(&shared),
            FramedReader::new(reader),
            handler,
        ));

        shared.transition(SessionState::Uninitialized, SessionState::Initializing);

        Self {
            shared,
            reader_task,
        }
    }

    async fn initialize(&self, params: InitializeParams) -> Result<(), SessionError> {
        let params = serde_json::to_value(&params).map_err(FramingError::Serialize)?;
        info!("Sending initialize request");

        let result = self.call(methods::INITIALIZE, params, Gate::Handshake).await?;
        let parsed = match serde_json::from_value::<InitializeResult>(result.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Unexpected initialize result shape: {}", e);
                None
            }
        };

        if let Some(info) = parsed.as_ref().and_then(|r| r.server_info.as_ref()) {
            info!(
                "Server initialized: {} {}",
                info.name,
                info.version.as_deref().unwrap_or("")
            );
        }
        let _ = self.shared.handshake.set(Handshake {
            raw: result,
            parsed,
        });

        if !self
            .shared
            .transition(SessionState::Initializing, SessionState::Ready)
        {
            return Err(SessionError::ConnectionClosed);
        }

        self.notify(methods::INITIALIZED, json!({})).await
    }

    /// Send a request and wait for its response.
    ///
    /// Resolves with the peer's `result`, or fails with `Peer` carrying the
    /// peer's error payload. If the stream closes first, fails with
    /// `ConnectionClosed` (or `Framing` when the stream desynchronized).
    /// No timeout is applied; see `request_with_timeout`.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        self.call(method, params, Gate::Ready).await
    }

    /// `request` with a local deadline.
    ///
    /// On expiry the pending entry is removed; a late response is dropped.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Value,
        duration: Duration,
    ) -> Result<Value, SessionError> {
        timeout(duration, self.request(method, params))
            .await
            .map_err(|_| SessionError::Timeout(duration))?
    }

    /// Send a notification. No id is issued and nothing is awaited.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), SessionError> {
        match self.shared.state() {
            SessionState::Ready => {}
            SessionState::Closed => return Err(SessionError::ConnectionClosed),
            state => return Err(SessionError::NotReady(state)),
        }

        debug!("Sending notification: {}", method);
        self.shared
            .send(&Notification::new(method, params).into())
            .await
    }

    async fn call(&self, method: &str, params: Value, gate: Gate) -> Result<Value, SessionError> {
        let (id, rx) = self.shared.register(method, gate)?;
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        debug!("Sending request: {} (id: {})", method, id);
        self.shared
            .send(&Request::new(id, method, params).into())
            .await?;

        // Sender dropped without a value means the session went away
        rx.await.map_err(|_| SessionError::ConnectionClosed)?
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Wait until the session is `Closed`.
    pub async fn closed(&self) {
        wait_closed(&mut self.shared.state_tx.subscribe()).await;
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// What the server returned from `initialize`, if it had the expected shape.
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.shared.handshake.get().and_then(|h| h.parsed.as_ref())
    }

    /// The `initialize` result exactly as the server sent it.
    pub fn initialize_response(&self) -> Option<&Value> {
        self.shared.handshake.get().map(|h| &h.raw)
    }

    pub fn server_capabilities(&self) -> Option<&Value> {
        self.initialize_response()
            .and_then(|raw| raw.get("capabilities"))
    }

    /// Polite shutdown: `shutdown` request, `exit` notification, then close.
    ///
    /// Failures of either message are logged; the session ends `Closed`
    /// regardless.
    pub async fn shutdown(&self, grace: Duration) {
        if self.state() == SessionState::Ready {
            match self
                .request_with_timeout(methods::SHUTDOWN, Value::Null, grace)
                .await
            {
                Ok(_) => debug!("Server acknowledged shutdown"),
                Err(e) => warn!("Shutdown request failed: {}", e),
            }
            if let Err(e) = self.notify(methods::EXIT, Value::Null).await {
                debug!("Exit notification not sent: {}", e);
            }
        }
        self.close().await;
    }

    /// Close immediately. Irreversible.
    ///
    /// Fails all pending requests with `ConnectionClosed`, stops reading and
    /// closes the outbound stream. If a write is still in flight the stream
    /// is instead closed when the session is dropped.
    pub async fn close(&self) {
        self.shared.close(CloseCause::Local);
        self.reader_task.abort();

        let Ok(mut writer) = self.shared.writer.try_lock() else {
            debug!("Outbound stream busy, leaving it to close on drop");
            return;
        };
        if let Err(e) = writer.shutdown().await {
            debug!("Error closing outbound stream: {}", e);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.shared.close(CloseCause::Local);
    }
}

/// Inbound loop: decode frames until the stream ends or desynchronizes.
async fn dispatch_loop<R>(
    shared: Arc<Shared>,
    mut reader: FramedReader<R>,
    handler: Arc<dyn InboundHandler>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    debug!("Starting inbound dispatch loop");

    loop {
        match reader.next_message().await {
            Ok(Some(value)) => dispatch(&shared, value, handler.as_ref()),
            Ok(None) => {
                info!("Peer closed the stream");
                shared.close(CloseCause::PeerExited);
                break;
            }
            Err(FramingError::TruncatedFrame { buffered }) => {
                warn!("Peer closed the stream mid-frame ({} bytes buffered)", buffered);
                shared.close(CloseCause::PeerExited);
                break;
            }
            Err(e) => {
                error!("Inbound stream desynchronized: {}", e);
                shared.close(CloseCause::Framing(Arc::new(e)));
                break;
            }
        }
    }

    debug!("Inbound dispatch loop stopped");
}

fn dispatch(shared: &Arc<Shared>, value: Value, handler: &dyn InboundHandler) {
    let message = match Message::from_value(value) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping invalid message: {}", e);
            return;
        }
    };

    match message {
        Message::Response(response) => shared.resolve(response),
        Message::Notification(notification) => {
            debug!("Received notification: {}", notification.method);
            handler.on_notification(notification);
        }
        Message::Request(request) => {
            debug!("Received request: {} (id: {})", request.method, request.id);
            let reply = match handler.on_request(&request) {
                Ok(result) => Response::success(request.id, result),
                Err(err) => Response::error(request.id, err),
            };

            // Reply off the inbound path so a busy writer never stalls reading
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                if let Err(e) = shared.send(&reply.into()).await {
                    warn!("Failed to answer peer request: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameDecoder;
    use crate::handler::{EventForwarder, LoggingHandler, SessionEvent};
    use crate::jsonrpc::ResponseError;
    use pretty_assertions::assert_eq;
    use serde::Serialize;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};

    /// Test timeout to prevent hanging tests.
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// The peer's end of the connection.
    struct Peer {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
        decoder: FrameDecoder,
    }

    impl Peer {
        async fn recv(&mut self) -> Message {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(value) = self.decoder.decode_next().unwrap() {
                    return Message::from_value(value).unwrap();
                }
                let n = timeout(TEST_TIMEOUT, self.reader.read(&mut buf))
                    .await
                    .expect("Test timed out")
                    .unwrap();
                assert!(n > 0, "client closed its side");
                self.decoder.push(&buf[..n]);
            }
        }

        async fn recv_request(&mut self) -> Request {
            match self.recv().await {
                Message::Request(r) => r,
                other => panic!("Expected Request, got: {:?}", other),
            }
        }

        async fn send(&mut self, message: impl Serialize) {
            let frame = encode_message(&message).unwrap();
            write_frame(&mut self.writer, &frame).await.unwrap();
        }

        /// Answer the handshake and consume the `initialized` notification.
        async fn accept_handshake(&mut self) {
            let init = self.recv_request().await;
            assert_eq!(init.method, "initialize");
            self.send(Response::success(init.id, json!({"capabilities": {"hoverProvider": true}})))
                .await;
            match self.recv().await {
                Message::Notification(n) => assert_eq!(n.method, "initialized"),
                other => panic!("Expected initialized, got: {:?}", other),
            }
        }
    }

    fn connect() -> (DuplexStream, Peer) {
        let (client, server) = duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        (
            client,
            Peer {
                reader,
                writer,
                decoder: FrameDecoder::new(),
            },
        )
    }

    async fn ready_session(handler: Arc<dyn InboundHandler>) -> (Session, Peer) {
        let (client, mut peer) = connect();
        let (read, write) = tokio::io::split(client);
        let start = Session::start(read, write, InitializeParams::default(), handler);
        let (session, ()) = tokio::join!(start, peer.accept_handshake());
        (session.expect("handshake failed"), peer)
    }

    #[tokio::test]
    async fn test_handshake_sends_initialize_first() {
        let (client, mut peer) = connect();
        let (read, write) = tokio::io::split(client);
        let params = InitializeParams::default()
            .with_initialization_options(json!({"opaque": [1, 2]}));
        let start = tokio::spawn(Session::start(read, write, params, Arc::new(LoggingHandler)));

        let init = peer.recv_request().await;
        assert_eq!(init.id, RequestId::Number(1));
        assert_eq!(init.method, "initialize");
        assert_eq!(init.params["processId"], json!(std::process::id()));
        assert_eq!(init.params["rootPath"], Value::Null);
        assert_eq!(init.params["initializationOptions"], json!({"opaque": [1, 2]}));
        assert_eq!(init.params["capabilities"], json!({}));

        peer.send(Response::success(init.id, json!({"capabilities": {}, "serverInfo": {"name": "mock"}})))
            .await;
        let session = timeout(TEST_TIMEOUT, start)
            .await
            .expect("Test timed out")
            .unwrap()
            .unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            session.initialize_result().unwrap().server_info.as_ref().unwrap().name,
            "mock"
        );
        assert!(matches!(peer.recv().await, Message::Notification(n) if n.method == "initialized"));
    }

    #[tokio::test]
    async fn test_handshake_peer_error_fails_start() {
        let (client, mut peer) = connect();
        let (read, write) = tokio::io::split(client);
        let start = tokio::spawn(Session::start(
            read,
            write,
            InitializeParams::default(),
            Arc::new(LoggingHandler),
        ));

        let init = peer.recv_request().await;
        peer.send(Response::error(init.id, ResponseError::new(-32600, "Invalid Request")))
            .await;

        let result = timeout(TEST_TIMEOUT, start).await.expect("Test timed out").unwrap();
        match result {
            Err(SessionError::Peer(err)) => assert_eq!(err.message, "Invalid Request"),
            Err(e) => panic!("Expected Peer error, got: {:?}", e),
            Ok(_) => panic!("Expected handshake failure"),
        }
    }

    #[tokio::test]
    async fn test_handshake_peer_exit() {
        let (client, peer) = connect();
        let (read, write) = tokio::io::split(client);
        drop(peer);
        let result = timeout(
            TEST_TIMEOUT,
            Session::start(read, write, InitializeParams::default(), Arc::new(LoggingHandler)),
        )
        .await
        .expect("Test timed out");
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_request_resolves_matching_id_out_of_order() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let a = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("a", json!({})).await }
        });
        let first = peer.recv_request().await;
        let b = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("b", json!({})).await }
        });
        let second = peer.recv_request().await;
        assert_eq!(session.pending_count(), 2);

        // Answer in reverse order
        peer.send(Response::success(second.id.clone(), json!(second.method))).await;
        peer.send(Response::success(first.id.clone(), json!(first.method))).await;

        let a = timeout(TEST_TIMEOUT, a).await.unwrap().unwrap().unwrap();
        let b = timeout(TEST_TIMEOUT, b).await.unwrap().unwrap().unwrap();
        assert_eq!(a, json!("a"));
        assert_eq!(b, json!("b"));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_error_is_local_to_request() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let failing = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("fails", Value::Null).await }
        });
        let req = peer.recv_request().await;
        peer.send(Response::error(
            req.id,
            ResponseError {
                code: -32001,
                message: "nope".into(),
                data: Some(json!({"why": "because"})),
            },
        ))
        .await;

        match timeout(TEST_TIMEOUT, failing).await.unwrap().unwrap() {
            Err(SessionError::Peer(err)) => {
                assert_eq!(err.code, -32001);
                assert_eq!(err.data, Some(json!({"why": "because"})));
            }
            other => panic!("Expected Peer error, got: {:?}", other),
        }

        assert_eq!(session.state(), SessionState::Ready);
        let ok = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("works", Value::Null).await }
        });
        let req = peer.recv_request().await;
        peer.send(Response::success(req.id, json!(true))).await;
        assert_eq!(timeout(TEST_TIMEOUT, ok).await.unwrap().unwrap().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_orphaned_response_dropped() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        peer.send(Response::success(RequestId::Number(999), json!(null))).await;
        peer.send(Response::success(RequestId::String("x".into()), json!(null))).await;

        let session = Arc::new(session);
        let pending = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("after", Value::Null).await }
        });
        let req = peer.recv_request().await;
        peer.send(Response::success(req.id, json!(1))).await;
        assert_eq!(timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap().unwrap(), json!(1));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_timeout_cancels_and_late_response_dropped() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;

        let result = session
            .request_with_timeout("slow", Value::Null, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout(_))));
        assert_eq!(session.pending_count(), 0);

        let slow = peer.recv_request().await;
        peer.send(Response::success(slow.id, json!("late"))).await;

        let session = Arc::new(session);
        let next = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("next", Value::Null).await }
        });
        let req = peer.recv_request().await;
        assert_eq!(req.id, RequestId::Number(3));
        peer.send(Response::success(req.id, json!("fresh"))).await;
        assert_eq!(timeout(TEST_TIMEOUT, next).await.unwrap().unwrap().unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_stream_close_rejects_all_pending() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let mut handles = Vec::new();
        for i in 0..3 {
            let s = Arc::clone(&session);
            handles.push(tokio::spawn(async move { s.request(&format!("m{}", i), Value::Null).await }));
            peer.recv_request().await;
        }
        drop(peer);

        for handle in handles {
            let result = timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
            assert!(matches!(result, Err(SessionError::ConnectionClosed)));
        }
        timeout(TEST_TIMEOUT, session.closed()).await.expect("Test timed out");
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(
            session.request("again", Value::Null).await,
            Err(SessionError::ConnectionClosed)
        ));
        assert!(matches!(
            session.notify("again", Value::Null).await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_framing_error_is_session_fatal() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let pending = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("m", Value::Null).await }
        });
        peer.recv_request().await;
        peer.writer.write_all(b"Content-Length: abc\r\n\r\n").await.unwrap();

        let result = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
        match result {
            Err(SessionError::Framing(e)) => {
                assert!(matches!(*e, FramingError::InvalidContentLength(_)))
            }
            other => panic!("Expected Framing error, got: {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_invalid_message_is_not_fatal() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        peer.send(json!({})).await;
        peer.send(json!({"jsonrpc": "2.0"})).await;

        let session = Arc::new(session);
        let pending = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("m", Value::Null).await }
        });
        let req = peer.recv_request().await;
        peer.send(Response::success(req.id, json!("ok"))).await;
        assert_eq!(timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap().unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_notify_issues_no_id() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        session
            .notify("textDocument/didOpen", json!({"uri": "file:///a.vala"}))
            .await
            .unwrap();
        match peer.recv().await {
            Message::Notification(n) => {
                assert_eq!(n.method, "textDocument/didOpen");
                assert_eq!(n.params["uri"], "file:///a.vala");
            }
            other => panic!("Expected Notification, got: {:?}", other),
        }
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_messages_reach_handler() {
        let (handler, mut events) = EventForwarder::channel();
        let (_session, mut peer) = ready_session(Arc::new(handler)).await;

        peer.send(Notification::new("window/logMessage", json!({"message": "hi"}))).await;
        peer.send(Request::new(RequestId::String("srv-1".into()), "workspace/configuration", json!({})))
            .await;

        let first = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(first, SessionEvent::Notification(n) if n.method == "window/logMessage"));
        let second = timeout(TEST_TIMEOUT, events.recv()).await.unwrap().unwrap();
        assert!(matches!(second, SessionEvent::Request(r) if r.method == "workspace/configuration"));

        match peer.recv().await {
            Message::Response(resp) => {
                assert_eq!(resp.id, Some(RequestId::String("srv-1".into())));
                assert_eq!(resp.into_result().unwrap_err().code, -32601);
            }
            other => panic!("Expected Response, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;

        let server = tokio::spawn(async move {
            let req = peer.recv_request().await;
            assert_eq!(req.method, "shutdown");
            peer.send(Response::success(req.id, Value::Null)).await;
            match peer.recv().await {
                Message::Notification(n) => assert_eq!(n.method, "exit"),
                other => panic!("Expected exit, got: {:?}", other),
            }
            peer
        });

        session.shutdown(TEST_TIMEOUT).await;
        assert_eq!(session.state(), SessionState::Closed);

        let mut peer = timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
        // Outbound side is closed: the peer sees EOF
        let mut buf = [0u8; 16];
        let n = timeout(TEST_TIMEOUT, peer.reader.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_is_irreversible() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let pending = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.request("m", Value::Null).await }
        });
        peer.recv_request().await;

        session.close().await;
        let result = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::ConnectionClosed)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.request("m", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_ids_are_unique_and_increasing() {
        let (session, mut peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let mut handles = Vec::new();
        for i in 0..20 {
            let s = Arc::clone(&session);
            handles.push(tokio::spawn(async move { s.request("m", json!(i)).await }));
        }

        let mut ids = Vec::new();
        for _ in 0..20 {
            let req = peer.recv_request().await;
            ids.push(req.id.as_u64().unwrap());
            peer.send(Response::success(req.id, req.params)).await;
        }
        for handle in handles {
            timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
        }

        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 20);
        // id 1 went to initialize
        assert_eq!(sorted, (2..22).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_requests_rejected_before_ready() {
        let (client, mut peer) = connect();
        let (read, write) = tokio::io::split(client);
        let session = Session::new(read, write, Arc::new(LoggingHandler));
        assert_eq!(session.state(), SessionState::Initializing);

        match session.request("textDocument/hover", json!({})).await {
            Err(SessionError::NotReady(SessionState::Initializing)) => {}
            other => panic!("Expected NotReady(Initializing), got: {:?}", other),
        }
        match session.notify("textDocument/didOpen", json!({})).await {
            Err(SessionError::NotReady(SessionState::Initializing)) => {}
            other => panic!("Expected NotReady(Initializing), got: {:?}", other),
        }
        assert_eq!(session.pending_count(), 0);

        // Nothing was written
        let mut buf = [0u8; 64];
        let received = timeout(Duration::from_millis(100), peer.reader.read(&mut buf)).await;
        assert!(received.is_err(), "peer received bytes: {:?}", received);
    }

    #[tokio::test]
    async fn test_close_is_immediate_with_stalled_writer() {
        // The peer stops reading, so a large request fills the pipe
        let (session, _peer) = ready_session(Arc::new(LoggingHandler)).await;
        let session = Arc::new(session);

        let blob = "x".repeat(64 * 1024);
        let stuck = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.request("big", json!({ "blob": blob })).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.pending_count(), 1);
        assert!(!stuck.is_finished());

        timeout(TEST_TIMEOUT, session.close())
            .await
            .expect("close blocked on the writer");
        assert_eq!(session.state(), SessionState::Closed);

        let result = timeout(TEST_TIMEOUT, stuck)
            .await
            .expect("stalled request was never rejected")
            .unwrap();
        assert!(
            matches!(result, Err(SessionError::ConnectionClosed)),
            "Expected ConnectionClosed, got: {:?}",
            result
        );
        assert!(matches!(
            session.notify("later", Value::Null).await,
            Err(SessionError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unexpected_initialize_result_kept_verbatim() {
        let (client, mut peer) = connect();
        let (read, write) = tokio::io::split(client);
        let start = tokio::spawn(Session::start(read, write, InitializeParams::default(), Arc::new(LoggingHandler)));

        let init = peer.recv_request().await;
        let raw = json!({"capabilities": {"hoverProvider": true}, "serverInfo": "not an object"});
        peer.send(Response::success(init.id, raw.clone())).await;

        let session = timeout(TEST_TIMEOUT, start)
            .await
            .expect("Test timed out")
            .unwrap()
            .expect("handshake failed");
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.initialize_result().is_none());
        assert_eq!(session.initialize_response(), Some(&raw));
        assert_eq!(
            session.server_capabilities(),
            Some(&json!({"hoverProvider": true}))
        );
    }

    #[tokio::test]
    async fn test_forwarded_events_drain_after_drop() {
        let (handler, mut events) = EventForwarder::channel();
        let (session, mut peer) = ready_session(Arc::new(handler)).await;

        peer.send(Notification::new("window/logMessage", json!({"message": "last"})))
            .await;
        // The stream is ordered, so this round trip means the notification was dispatched
        let pending = tokio::spawn(async move {
            let result = session.request("ping", Value::Null).await;
            (session, result)
        });
        let req = peer.recv_request().await;
        peer.send(Response::success(req.id, json!("pong"))).await;
        let (session, result) = timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
        assert_eq!(result.unwrap(), json!("pong"));

        drop(session);
        match timeout(TEST_TIMEOUT, events.recv()).await.expect("Test timed out") {
            Some(SessionEvent::Notification(n)) => assert_eq!(n.params["message"], "last"),
            other => panic!("Expected buffered notification, got: {:?}", other),
        }
        let end = timeout(TEST_TIMEOUT, events.recv()).await.expect("channel never closed");
        assert!(end.is_none());
    }
}
