//! # Server Dispatcher
//!
//! The [`Server`] owns the handler table, the tracked long connections and the
//! pending-call counter. Transports feed it bytes through [`Server::on_receive`];
//! every decoded request or message is dispatched on its own task, so a slow
//! handler never delays decoding of the frames behind it.
//!
//! ## Lifecycle
//!
//! `Opening` → [`Server::start`] → `Opened` → [`Server::graceful_stop`] →
//! `Closing` → `Closed`. While `Closing`, in-flight calls run to completion
//! and new requests are answered with `SERVER_STOPPING`.
//!
//! ## Invariants
//! - **One Response**: every decoded request gets exactly one answer: the
//!   handler's, the timeout's, the fault path's, or `NO_RESPONSE` if the
//!   handler finished without answering.
//! - **Faults Stay Local**: a handler error or panic becomes a response to that
//!   call only; the dispatcher and the other calls keep running.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use neorpc::DecodeError;
use neorpc::Frame;
use neorpc::FrameCodec;
use neorpc::RpcError;
use neorpc::ServiceDef;
use neorpc::ServiceRef;
use neorpc::code;
use serde_json::Value;
use tokio::sync::Notify;

use crate::call::ApiCall;
use crate::call::MsgCall;
use crate::call::internal_error;
use crate::config::ServerOptions;
use crate::connection::ConnId;
use crate::connection::Connection;
use crate::connection::ConnectionKind;
use crate::connection::Shared;
use crate::fault::FaultCapture;
use crate::fault::panic_message;
use crate::flows::DisconnectData;
use crate::flows::MsgData;
use crate::flows::RecvData;
use crate::flows::ServerFlows;
use crate::listener::ListenerId;
use crate::listener::Listeners;
use crate::transport::Transport;

pub type ApiHandler = Arc<dyn Fn(Arc<ApiCall>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type MsgHandler = Arc<dyn Fn(Arc<MsgCall>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub type InputErrorHandler = Arc<dyn Fn(Arc<Connection>, DecodeError) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Opening,
    Opened,
    Closing,
    Closed,
}

const OPENING: u8 = 0;
const OPENED: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

impl ServerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            OPENING => Self::Opening,
            OPENED => Self::Opened,
            CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug)]
pub enum Error {
    DuplicateHandler(String),
    UnknownApi(String),
    UnknownMsg(String),
    NotAccepting(ServerStatus),
    InvalidState { expected: ServerStatus, actual: ServerStatus },
    /// `pre_connect` aborted or failed.
    Rejected(String),
    Encode(neorpc::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateHandler(name) => write!(f, "API '{}' already has a handler", name),
            Self::UnknownApi(name) => write!(f, "Unknown API: '{}'", name),
            Self::UnknownMsg(name) => write!(f, "Unknown message: '{}'", name),
            Self::NotAccepting(status) => write!(f, "Server is not accepting connections ({:?})", status),
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid server state: expected {:?}, found {:?}", expected, actual)
            }
            Self::Rejected(reason) => write!(f, "Connection rejected: {}", reason),
            Self::Encode(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<neorpc::Error> for Error {
    fn from(e: neorpc::Error) -> Self {
        Self::Encode(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct ServerBuilder {
    codec: Arc<dyn FrameCodec>,
    options: ServerOptions,
    flows: ServerFlows,
    faults: Option<Arc<FaultCapture>>,
    on_input_error: Option<InputErrorHandler>,
}

impl ServerBuilder {
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    /// Installed on [`Server::start`] when `capture_faults` is set.
    pub fn fault_capture(mut self, faults: Arc<FaultCapture>) -> Self {
        self.faults = Some(faults);
        self
    }

    /// Replaces the default reaction to undecodable input.
    pub fn on_input_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Arc<Connection>, DecodeError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_input_error = Some(Arc::new(move |conn, err| handler(conn, err).boxed()));
        self
    }

    pub fn build(self) -> Server {
        let shared = Arc::new(Shared { codec: self.codec, flows: self.flows, options: self.options });
        Server {
            inner: Arc::new(Inner {
                shared,
                api_handlers: DashMap::new(),
                msg_listeners: Listeners::new(),
                connections: DashMap::new(),
                next_conn_id: AtomicU64::new(1),
                status: AtomicU8::new(OPENING),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                faults: self.faults,
                on_input_error: self.on_input_error,
            }),
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    api_handlers: DashMap<String, ApiHandler>,
    msg_listeners: Listeners<MsgHandler>,
    connections: DashMap<ConnId, Arc<Connection>>,
    next_conn_id: AtomicU64,
    status: AtomicU8,
    pending: AtomicUsize,
    idle: Notify,
    faults: Option<Arc<FaultCapture>>,
    on_input_error: Option<InputErrorHandler>,
}

/// Cheap to clone; every clone drives the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

/// Whether the call reached a handler, or a flow took it over.
enum Dispatch {
    Handled,
    Aborted,
}

impl Server {
    pub fn builder(codec: Arc<dyn FrameCodec>) -> ServerBuilder {
        ServerBuilder {
            codec,
            options: ServerOptions::default(),
            flows: ServerFlows::new(),
            faults: None,
            on_input_error: None,
        }
    }

    pub fn new(codec: Arc<dyn FrameCodec>, options: ServerOptions) -> Self {
        Self::builder(codec).options(options).build()
    }

    pub fn flows(&self) -> &ServerFlows {
        &self.inner.shared.flows
    }

    pub fn options(&self) -> &ServerOptions {
        &self.inner.shared.options
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.inner.shared.codec
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus::from_u8(self.inner.status.load(Ordering::SeqCst))
    }

    /// API calls dispatched but not yet finished.
    pub fn pending_api_calls(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// The tracked long connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.iter().map(|e| e.value().clone()).collect()
    }

    pub fn implement_api<F, Fut>(&self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(Arc<ApiCall>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.codec().registry().api(name).is_none() {
            return Err(Error::UnknownApi(name.to_string()));
        }
        match self.inner.api_handlers.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::DuplicateHandler(name.to_string())),
            Entry::Vacant(slot) => {
                let handler: ApiHandler = Arc::new(move |call| handler(call).boxed());
                slot.insert(handler);
                tracing::debug!(api = name, "api implemented");
                Ok(())
            }
        }
    }

    pub fn listen_msg<F, Fut>(&self, name: &str, handler: F) -> Result<ListenerId>
    where
        F: Fn(Arc<MsgCall>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.codec().registry().msg(name).is_none() {
            return Err(Error::UnknownMsg(name.to_string()));
        }
        let handler: MsgHandler = Arc::new(move |call| handler(call).boxed());
        Ok(self.inner.msg_listeners.add(name, handler))
    }

    pub fn unlisten_msg(&self, name: &str, id: ListenerId) -> bool {
        self.inner.msg_listeners.remove(name, id)
    }

    pub fn unlisten_all(&self, name: &str) -> usize {
        self.inner.msg_listeners.remove_all(name)
    }

    pub fn start(&self) -> Result<()> {
        self.inner
            .status
            .compare_exchange(OPENING, OPENED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|actual| Error::InvalidState {
                expected: ServerStatus::Opening,
                actual: ServerStatus::from_u8(actual),
            })?;

        if self.options().capture_faults {
            if let Some(faults) = &self.inner.faults {
                faults.install();
            }
        }
        tracing::info!(services = self.codec().registry().services().count(), "server started");
        Ok(())
    }

    /// Registers a freshly opened link as a connection.
    pub async fn accept(
        &self,
        kind: ConnectionKind,
        remote_address: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Connection>> {
        let status = self.status();
        if status != ServerStatus::Opened {
            transport.close(Some("server not accepting")).await;
            return Err(Error::NotAccepting(status));
        }

        let id = ConnId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let conn = Arc::new(Connection::new(id, kind, remote_address.into(), transport, self.inner.shared.clone()));

        let rejected = match self.flows().pre_connect.exec(conn.clone()).await {
            Ok(Some(_)) => None,
            Ok(None) => Some(format!("connection {} refused by pre_connect", id)),
            Err(e) => Some(format!("{:#}", e)),
        };
        if let Some(reason) = rejected {
            conn.close(Some("rejected")).await;
            return Err(Error::Rejected(reason));
        }

        if kind == ConnectionKind::Long {
            self.inner.connections.insert(id, conn.clone());
            tracing::info!(conn = %id, remote = conn.remote_address(), "connected");
        }

        if let Err(e) = self.flows().post_connect.exec(conn.clone()).await {
            tracing::warn!(conn = %id, "post_connect failed: {:#}", e);
        }
        Ok(conn)
    }

    /// Closes `conn` and forgets it. `post_disconnect` runs once per tracked connection.
    pub async fn disconnect(&self, conn: &Arc<Connection>, reason: Option<&str>) {
        conn.close(reason).await;
        if self.inner.connections.remove(&conn.id()).is_none() {
            return;
        }
        tracing::info!(conn = %conn.id(), reason = reason.unwrap_or(""), "disconnected");

        let data = DisconnectData { conn: conn.clone(), reason: reason.map(str::to_string) };
        if let Err(e) = self.flows().post_disconnect.exec(data).await {
            tracing::warn!(conn = %conn.id(), "post_disconnect failed: {:#}", e);
        }
    }

    /// Entry point for bytes read from `conn`.
    pub async fn on_receive(&self, conn: &Arc<Connection>, data: Vec<u8>) {
        let shared = &self.inner.shared;
        let data = match shared.flows.pre_recv_data.exec(RecvData { conn: conn.clone(), data }).await {
            Ok(Some(recv)) => recv.data,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(conn = %conn.id(), "pre_recv_data failed: {:#}", e);
                return;
            }
        };

        let frame = shared.codec.decode(&data);
        shared.codec.release(data);

        match frame {
            Ok(Frame::Request { service, sn, req }) => {
                if shared.options.log_req_body {
                    tracing::info!(conn = %conn.id(), sn, api = %service.name, req = %req, "[ApiReq]");
                } else {
                    tracing::info!(conn = %conn.id(), sn, api = %service.name, "[ApiReq]");
                }
                let call = Arc::new(ApiCall::new(service, sn, req, conn.clone()));
                self.dispatch_api(call);
            }
            Ok(Frame::Message { service, msg }) => {
                if shared.options.log_msg_body {
                    tracing::info!(conn = %conn.id(), msg = %service.name, body = %msg, "[RecvMsg]");
                } else {
                    tracing::info!(conn = %conn.id(), msg = %service.name, "[RecvMsg]");
                }
                if self.status() == ServerStatus::Opened {
                    let call = Arc::new(MsgCall::new(service, msg, conn.clone()));
                    tokio::spawn(self.clone().run_msg(call));
                }
                if conn.kind() == ConnectionKind::Short {
                    conn.close(None).await;
                }
            }
            Ok(Frame::Response { sn, .. }) => {
                tracing::warn!(conn = %conn.id(), sn, "unexpected response frame from client");
            }
            Err(err) => self.input_error(conn.clone(), err).await,
        }
    }

    fn dispatch_api(&self, call: Arc<ApiCall>) {
        // Count first, then check: a stop that has already flipped the status
        // sees either this call in the counter or the call sees the new status.
        // A refused call stays counted until its refusal is on the wire.
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        if self.status() != ServerStatus::Opened {
            let server = self.clone();
            let err = RpcError::network("Server is stopping").with_code(code::SERVER_STOPPING);
            tokio::spawn(async move {
                call.error(err).await;
                server.finish_pending();
            });
            return;
        }
        tokio::spawn(self.clone().run_api(call));
    }

    fn finish_pending(&self) {
        if self.inner.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }

    async fn run_api(self, call: Arc<ApiCall>) {
        let return_inner = self.options().return_inner_error;
        let handled = AssertUnwindSafe(self.clone().handle_api(call.clone())).catch_unwind();

        let result = match self.options().api_timeout() {
            Some(limit) => {
                tokio::pin!(handled);
                tokio::select! {
                    result = &mut handled => result,
                    _ = tokio::time::sleep(limit) => {
                        if !call.is_returned() {
                            call.error(RpcError::server("Server Timeout").with_code(code::SERVER_TIMEOUT)).await;
                        }
                        handled.await
                    }
                }
            }
            None => handled.await,
        };

        match result {
            Ok(Dispatch::Handled) => {
                if !call.is_returned() {
                    let err = RpcError::server("API handler finished without a response").with_code(code::NO_RESPONSE);
                    call.error(err).await;
                }
            }
            Ok(Dispatch::Aborted) => {}
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(conn = %call.conn().id(), sn = call.sn(), api = call.name(), "handler panicked: {}", detail);
                call.error(internal_error(return_inner, detail)).await;
            }
        }

        if let Err(e) = self.flows().post_api_call.exec(call.clone()).await {
            tracing::error!(conn = %call.conn().id(), sn = call.sn(), "post_api_call failed: {:#}", e);
        }
        self.finish_pending();
    }

    async fn handle_api(self, call: Arc<ApiCall>) -> Dispatch {
        let return_inner = self.options().return_inner_error;
        let call = match self.flows().pre_api_call.exec(call.clone()).await {
            Ok(Some(call)) => call,
            Ok(None) => return Dispatch::Aborted,
            Err(e) => {
                tracing::error!(conn = %call.conn().id(), sn = call.sn(), "{:#}", e);
                call.error(internal_error(return_inner, format!("{:#}", e))).await;
                return Dispatch::Handled;
            }
        };

        let handler = self.inner.api_handlers.get(call.name()).map(|h| h.value().clone());
        let Some(handler) = handler else {
            let err = RpcError::server(format!("Unhandled API: {}", call.name())).with_code(code::UNHANDLED_API);
            call.error(err).await;
            return Dispatch::Handled;
        };

        if let Err(e) = handler(call.clone()).await {
            match e.downcast::<RpcError>() {
                Ok(err) => call.error(err).await,
                Err(e) => {
                    tracing::error!(conn = %call.conn().id(), sn = call.sn(), api = call.name(), "handler failed: {:#}", e);
                    call.error(internal_error(return_inner, format!("{:#}", e))).await;
                }
            }
        }
        Dispatch::Handled
    }

    async fn run_msg(self, call: Arc<MsgCall>) {
        let call = match self.flows().pre_msg_call.exec(call).await {
            Ok(Some(call)) => call,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("pre_msg_call failed: {:#}", e);
                return;
            }
        };

        let handlers = self.inner.msg_listeners.snapshot(call.name());
        if handlers.is_empty() {
            tracing::debug!(msg = call.name(), "no listener for message");
            return;
        }

        let runs = handlers.into_iter().map(|handler| AssertUnwindSafe(handler(call.clone())).catch_unwind());
        for result in futures::future::join_all(runs).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(conn = %call.conn().id(), msg = call.name(), "listener failed: {:#}", e),
                Err(panic) => tracing::error!(
                    conn = %call.conn().id(),
                    msg = call.name(),
                    "listener panicked: {}",
                    panic_message(panic.as_ref())
                ),
            }
        }
    }

    async fn input_error(&self, conn: Arc<Connection>, err: DecodeError) {
        tracing::warn!(conn = %conn.id(), "invalid input: {}", err);
        if let Some(handler) = &self.inner.on_input_error {
            handler(conn, err).await;
            return;
        }

        let short = conn.kind() == ConnectionKind::Short;
        let reply = match &err {
            // A well-formed request for a service we do not have: answer it.
            DecodeError::UnknownService { service, sn: Some(sn) } => {
                let rpc = RpcError::server(format!("Unhandled API: {}", service)).with_code(code::UNHANDLED_API);
                Some((service.clone(), *sn, rpc))
            }
            DecodeError::Payload { service_id, sn, .. } if short => {
                Some((ServiceRef::Id(*service_id), sn.unwrap_or(0), input_data_error(&err)))
            }
            _ if short => Some((ServiceRef::Id(0), err.sn().unwrap_or(0), input_data_error(&err))),
            _ => None,
        };

        let Some((service, sn, rpc)) = reply else {
            self.disconnect(&conn, Some("input data error")).await;
            return;
        };

        match self.codec().encode_unroutable(&service, sn, &rpc) {
            Ok(data) => {
                if let Err(e) = conn.send(data, Some(sn)).await {
                    tracing::debug!(conn = %conn.id(), sn, "error reply not delivered: {}", e);
                }
            }
            Err(e) => tracing::error!(conn = %conn.id(), sn, "cannot encode error reply: {}", e),
        }
        if short {
            conn.close(None).await;
        }
    }

    /// Pushes `msg` to every listed long connection, or to all tracked ones.
    /// `pre_send_msg` runs per target and may drop it; targets that leave the
    /// message untouched share one encoding. Returns how many sends succeeded.
    pub async fn broadcast_msg(&self, name: &str, msg: &Value, conns: Option<&[Arc<Connection>]>) -> Result<usize> {
        let service = self.codec().registry().msg(name).cloned().ok_or_else(|| Error::UnknownMsg(name.to_string()))?;
        let targets: Vec<Arc<Connection>> = match conns {
            Some(list) => list.iter().filter(|c| c.kind() == ConnectionKind::Long).cloned().collect(),
            None => self.connections(),
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let shared = self.codec().encode_message(&service, msg)?;
        let sends = targets.iter().map(|conn| self.broadcast_one(conn, &service, msg, &shared));
        let sent = futures::future::join_all(sends).await.into_iter().filter(|delivered| *delivered).count();
        self.codec().release(shared);

        tracing::info!(msg = name, sent, targets = targets.len(), "[BroadcastMsg]");
        Ok(sent)
    }

    async fn broadcast_one(&self, conn: &Arc<Connection>, service: &Arc<ServiceDef>, msg: &Value, shared: &[u8]) -> bool {
        let flows = self.flows();
        let data = MsgData { conn: conn.clone(), service: service.clone(), msg: msg.clone() };
        let out = match flows.pre_send_msg.exec(data).await {
            Ok(Some(out)) => out,
            Ok(None) => {
                tracing::debug!(conn = %conn.id(), msg = %service.name, "broadcast dropped by pre_send_msg");
                return false;
            }
            Err(e) => {
                tracing::warn!(conn = %conn.id(), msg = %service.name, "pre_send_msg failed: {:#}", e);
                return false;
            }
        };

        let frame = if out.msg == *msg {
            shared.to_vec()
        } else {
            match self.codec().encode_message(&out.service, &out.msg) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(conn = %conn.id(), msg = %service.name, "rewritten message rejected: {}", e);
                    return false;
                }
            }
        };
        if let Err(e) = conn.send(frame, None).await {
            tracing::debug!(conn = %conn.id(), msg = %service.name, "broadcast not delivered: {}", e);
            return false;
        }

        if let Err(e) = flows.post_send_msg.exec(out).await {
            tracing::warn!(conn = %conn.id(), "post_send_msg failed: {:#}", e);
        }
        true
    }

    /// Stops taking new calls, waits for in-flight ones (at most `max_wait`),
    /// then closes everything.
    pub async fn graceful_stop(&self, max_wait: Option<Duration>) {
        match self.inner.status.compare_exchange(OPENED, CLOSING, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => {}
            Err(CLOSING) | Err(CLOSED) => return,
            Err(_) => return self.stop().await,
        }
        tracing::info!(pending = self.pending_api_calls(), "graceful stop");

        let drained = self.wait_idle();
        match max_wait {
            Some(limit) => {
                if tokio::time::timeout(limit, drained).await.is_err() {
                    tracing::warn!(pending = self.pending_api_calls(), "graceful stop timed out");
                }
            }
            None => drained.await,
        }
        self.stop().await;
    }

    /// Closes every tracked connection without waiting for in-flight calls.
    pub async fn stop(&self) {
        if self.inner.status.swap(CLOSED, Ordering::SeqCst) == CLOSED {
            return;
        }
        for conn in self.connections() {
            self.disconnect(&conn, Some("server stopped")).await;
        }
        tracing::info!("server stopped");
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn input_data_error(err: &DecodeError) -> RpcError {
    RpcError::server(format!("Input data error: {}", err)).with_code(code::INPUT_DATA_ERR)
}
