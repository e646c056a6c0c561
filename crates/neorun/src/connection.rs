//! # Server-Side Connections
//!
//! A [`Connection`] is the server's handle on one peer. It owns the transport
//! for that peer and pushes every outbound frame through the send flows.
//!
//! ## Connection Kinds
//!
//! - [`ConnectionKind::Long`]: a persistent duplex link. Carries many
//!   concurrent requests and server-pushed messages.
//! - [`ConnectionKind::Short`]: exists for exactly one request (or one
//!   message) and is closed as soon as the response is out. It can never
//!   carry a server-pushed message.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use neorpc::FrameCodec;
use neorpc::RpcError;
use neorpc::code;
use serde_json::Value;

use crate::config::ServerOptions;
use crate::flows::MsgData;
use crate::flows::SendData;
use crate::flows::ServerFlows;
use crate::transport;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    Long,
    Short,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Opened,
    Closing,
    Closed,
}

const OPENED: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug)]
pub enum Error {
    Closed(ConnId),
    /// Server-pushed messages need a long connection.
    ShortConnection,
    UnknownMsg(String),
    Encode(neorpc::Error),
    Transport(transport::Error),
    Flow(String),
    /// A flow node deliberately dropped the frame.
    Aborted(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed(id) => write!(f, "Connection {} is closed", id),
            Self::ShortConnection => write!(f, "Short connections cannot carry messages"),
            Self::UnknownMsg(name) => write!(f, "Unknown message: '{}'", name),
            Self::Encode(e) => write!(f, "{}", e),
            Self::Transport(e) => write!(f, "{}", e),
            Self::Flow(e) => write!(f, "Flow error: {}", e),
            Self::Aborted(flow) => write!(f, "Send aborted by {}", flow),
        }
    }
}

impl std::error::Error for Error {}

impl From<neorpc::Error> for Error {
    fn from(e: neorpc::Error) -> Self {
        Self::Encode(e)
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<Error> for RpcError {
    fn from(e: Error) -> Self {
        let message = e.to_string();
        match e {
            Error::Closed(_) | Error::Transport(_) => RpcError::network(message).with_code(code::SEND_DATA_ERR),
            Error::ShortConnection => RpcError::client(message).with_code(code::SHORT_CONNECTION),
            Error::Flow(_) => RpcError::client(message).with_code(code::FLOW_ERROR),
            Error::UnknownMsg(_) | Error::Encode(_) | Error::Aborted(_) => RpcError::client(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What a connection shares with the server that accepted it.
pub(crate) struct Shared {
    pub(crate) codec: Arc<dyn FrameCodec>,
    pub(crate) flows: ServerFlows,
    pub(crate) options: ServerOptions,
}

pub struct Connection {
    id: ConnId,
    kind: ConnectionKind,
    remote_address: String,
    status: AtomicU8,
    transport: Arc<dyn Transport>,
    pub(crate) shared: Arc<Shared>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        kind: ConnectionKind,
        remote_address: String,
        transport: Arc<dyn Transport>,
        shared: Arc<Shared>,
    ) -> Self {
        Self { id, kind, remote_address, status: AtomicU8::new(OPENED), transport, shared }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::Acquire) {
            OPENED => ConnectionStatus::Opened,
            CLOSING => ConnectionStatus::Closing,
            _ => ConnectionStatus::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Opened
    }

    pub fn codec(&self) -> &Arc<dyn FrameCodec> {
        &self.shared.codec
    }

    /// Writes an encoded frame through `pre_send_data` and `post_send_data`.
    pub async fn send(self: &Arc<Self>, data: Vec<u8>, sn: Option<u64>) -> Result<()> {
        let codec = &self.shared.codec;
        if !self.is_open() {
            codec.release(data);
            return Err(Error::Closed(self.id));
        }

        let flows = &self.shared.flows;
        let out = match flows.pre_send_data.exec(SendData { conn: self.clone(), data, sn }).await {
            Ok(Some(out)) => out,
            Ok(None) => return Err(Error::Aborted("pre_send_data")),
            Err(e) => return Err(Error::Flow(format!("{:#}", e))),
        };

        if let Err(e) = self.transport.send(&out.data).await {
            codec.release(out.data);
            return Err(e.into());
        }

        match flows.post_send_data.exec(out).await {
            Ok(Some(out)) => codec.release(out.data),
            Ok(None) => {}
            Err(e) => tracing::warn!(conn = %self.id, "post_send_data failed: {:#}", e),
        }
        Ok(())
    }

    /// Pushes a server message to this peer.
    pub async fn send_msg(self: &Arc<Self>, name: &str, msg: Value) -> Result<()> {
        if self.kind == ConnectionKind::Short {
            return Err(Error::ShortConnection);
        }
        let service = self
            .shared
            .codec
            .registry()
            .msg(name)
            .cloned()
            .ok_or_else(|| Error::UnknownMsg(name.to_string()))?;

        let flows = &self.shared.flows;
        let out = match flows.pre_send_msg.exec(MsgData { conn: self.clone(), service, msg }).await {
            Ok(Some(out)) => out,
            Ok(None) => return Err(Error::Aborted("pre_send_msg")),
            Err(e) => return Err(Error::Flow(format!("{:#}", e))),
        };

        let data = self.shared.codec.encode_message(&out.service, &out.msg)?;
        self.send(data, None).await?;

        if self.shared.options.log_msg_body {
            tracing::debug!(conn = %self.id, msg = %out.service.name, body = %out.msg, "message sent");
        } else {
            tracing::debug!(conn = %self.id, msg = %out.service.name, "message sent");
        }

        if let Err(e) = flows.post_send_msg.exec(out).await {
            tracing::warn!(conn = %self.id, "post_send_msg failed: {:#}", e);
        }
        Ok(())
    }

    /// Closes the transport. Returns `false` if the connection was already
    /// closing or closed.
    pub async fn close(&self, reason: Option<&str>) -> bool {
        if self.status.compare_exchange(OPENED, CLOSING, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return false;
        }
        self.transport.close(reason).await;
        self.status.store(CLOSED, Ordering::Release);
        tracing::debug!(conn = %self.id, reason = reason.unwrap_or(""), "connection closed");
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("remote_address", &self.remote_address)
            .field("status", &self.status())
            .finish()
    }
}
