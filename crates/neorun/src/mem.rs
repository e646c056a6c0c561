//! In-memory transport bindings.
//!
//! Wires a [`Client`] straight to a [`Server`] through tokio channels, so the
//! full encode → dispatch → respond → decode path runs without sockets.
//!
//! - [`connect_long`]: one persistent duplex link, like a socket.
//! - [`connect_short`]: a fresh short connection per outbound frame, like a
//!   plain request/response protocol.

use std::sync::Arc;
use std::sync::Mutex;

use neorpc::FrameCodec;
use tokio::sync::mpsc;

use crate::client::Client;
use crate::config::ClientOptions;
use crate::connection::Connection;
use crate::connection::ConnectionKind;
use crate::server;
use crate::server::Server;
use crate::transport;
use crate::transport::Transport;

/// Pushes every frame into an unbounded channel. Closing drops the sender,
/// which ends the reader on the other side.
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx: Mutex::new(Some(tx)) }
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let Some(tx) = tx else {
            return Err(transport::Error::ConnectionLost("Channel closed".into()));
        };
        tx.send(payload.to_vec()).map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn close(&self, _reason: Option<&str>) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Opens a long connection on `server` and returns the client end with it.
pub async fn connect_long(
    server: &Server,
    codec: Arc<dyn FrameCodec>,
    options: ClientOptions,
) -> server::Result<(Client, Arc<Connection>)> {
    let (to_server, mut server_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (to_client, mut client_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let conn = server.accept(ConnectionKind::Long, "mem://long", Arc::new(ChannelTransport::new(to_client))).await?;
    let client = Client::new(codec, Arc::new(ChannelTransport::new(to_server)), options);

    let pump_server = server.clone();
    let pump_conn = conn.clone();
    tokio::spawn(async move {
        while let Some(bytes) = server_rx.recv().await {
            pump_server.on_receive(&pump_conn, bytes).await;
        }
        pump_server.disconnect(&pump_conn, Some("peer closed")).await;
    });

    let pump_client = client.clone();
    tokio::spawn(async move {
        while let Some(bytes) = client_rx.recv().await {
            pump_client.on_receive(bytes).await;
        }
    });

    Ok((client, conn))
}

/// Opens a short connection for every frame the client sends.
struct ShortLinkTransport {
    server: Server,
    replies: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait::async_trait]
impl Transport for ShortLinkTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        let reply = Arc::new(ChannelTransport::new(self.replies.clone()));
        let conn = self
            .server
            .accept(ConnectionKind::Short, "mem://short", reply)
            .await
            .map_err(|e| transport::Error::ConnectionLost(e.to_string()))?;
        let server = self.server.clone();
        let payload = payload.to_vec();
        tokio::spawn(async move { server.on_receive(&conn, payload).await });
        Ok(())
    }
}

pub fn connect_short(server: &Server, codec: Arc<dyn FrameCodec>, options: ClientOptions) -> Client {
    let (replies, mut reply_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let transport = ShortLinkTransport { server: server.clone(), replies };
    let client = Client::new(codec, Arc::new(transport), options);

    let pump_client = client.clone();
    tokio::spawn(async move {
        while let Some(bytes) = reply_rx.recv().await {
            pump_client.on_receive(bytes).await;
        }
    });
    client
}
