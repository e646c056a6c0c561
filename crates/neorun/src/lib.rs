//! # Neorun
//!
//! The call-lifecycle runtime on top of `neorpc` frames: a server that
//! dispatches requests to handlers and guarantees one response per request,
//! and a client that correlates responses by sequence number with timeouts
//! and aborts.
//!
//! ## Architecture
//!
//! - [`flow`]: ordered async interceptor pipelines; [`flows`] names the hook
//!   points of both sides.
//! - [`connection`] / [`call`]: the server's view of a peer and of one request.
//! - [`server`]: handler table, dispatch, timeouts, graceful shutdown.
//! - [`client`]: pending-call table, sequence numbers, aborts, listeners.
//! - [`transport`]: the byte pipe both sides write to; [`mem`] provides
//!   in-memory bindings.

pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod fault;
pub mod flow;
pub mod flows;
pub mod listener;
pub mod logging;
pub mod mem;
pub mod server;
pub mod sn;
pub mod transport;

pub use call::ApiCall;
pub use call::MsgCall;
pub use client::Client;
pub use config::CallOptions;
pub use config::ClientOptions;
pub use config::ServerOptions;
pub use connection::ConnId;
pub use connection::Connection;
pub use connection::ConnectionKind;
pub use connection::ConnectionStatus;
pub use fault::FaultCapture;
pub use flow::Flow;
pub use flows::ClientFlows;
pub use flows::ServerFlows;
pub use listener::ListenerId;
pub use server::Server;
pub use server::ServerBuilder;
pub use server::ServerStatus;
pub use transport::Transport;
