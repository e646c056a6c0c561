//! The named interception points of the server and the client.
//!
//! Every field is a [`Flow`]; register nodes on them before traffic starts.

use std::sync::Arc;

use neorpc::Outcome;
use neorpc::ServiceDef;
use serde_json::Value;

use crate::call::ApiCall;
use crate::call::MsgCall;
use crate::config::CallOptions;
use crate::connection::Connection;
use crate::flow::Flow;

/// Bytes just read from a connection, before decoding.
#[derive(Clone)]
pub struct RecvData {
    pub conn: Arc<Connection>,
    pub data: Vec<u8>,
}

/// An encoded frame about to be (or just) written to a connection.
#[derive(Clone)]
pub struct SendData {
    pub conn: Arc<Connection>,
    pub data: Vec<u8>,
    /// Set when the frame is a response.
    pub sn: Option<u64>,
}

#[derive(Clone)]
pub struct DisconnectData {
    pub conn: Arc<Connection>,
    pub reason: Option<String>,
}

/// The outcome an [`ApiCall`] is about to send (or has sent).
#[derive(Clone)]
pub struct ApiReturnData {
    pub call: Arc<ApiCall>,
    pub ret: Outcome,
}

/// A server-pushed message on its way out.
#[derive(Clone)]
pub struct MsgData {
    pub conn: Arc<Connection>,
    pub service: Arc<ServiceDef>,
    pub msg: Value,
}

pub struct ServerFlows {
    pub pre_connect: Flow<Arc<Connection>>,
    pub post_connect: Flow<Arc<Connection>>,
    pub post_disconnect: Flow<DisconnectData>,
    pub pre_recv_data: Flow<RecvData>,
    pub pre_send_data: Flow<SendData>,
    pub post_send_data: Flow<SendData>,
    pub pre_api_call: Flow<Arc<ApiCall>>,
    pub post_api_call: Flow<Arc<ApiCall>>,
    pub pre_api_return: Flow<ApiReturnData>,
    pub post_api_return: Flow<ApiReturnData>,
    pub pre_msg_call: Flow<Arc<MsgCall>>,
    pub pre_send_msg: Flow<MsgData>,
    pub post_send_msg: Flow<MsgData>,
}

impl ServerFlows {
    pub fn new() -> Self {
        Self {
            pre_connect: Flow::new("pre_connect"),
            post_connect: Flow::new("post_connect"),
            post_disconnect: Flow::new("post_disconnect"),
            pre_recv_data: Flow::new("pre_recv_data"),
            pre_send_data: Flow::new("pre_send_data"),
            post_send_data: Flow::new("post_send_data"),
            pre_api_call: Flow::new("pre_api_call"),
            post_api_call: Flow::new("post_api_call"),
            pre_api_return: Flow::new("pre_api_return"),
            post_api_return: Flow::new("post_api_return"),
            pre_msg_call: Flow::new("pre_msg_call"),
            pre_send_msg: Flow::new("pre_send_msg"),
            post_send_msg: Flow::new("post_send_msg"),
        }
    }
}

impl Default for ServerFlows {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound call before it is assigned a sequence number.
#[derive(Clone)]
pub struct CallApiData {
    pub service: Arc<ServiceDef>,
    pub req: Value,
    pub options: CallOptions,
}

/// A settled outbound call on its way back to the caller.
#[derive(Clone)]
pub struct ReturnData {
    pub service: Arc<ServiceDef>,
    pub sn: u64,
    pub req: Value,
    pub ret: Outcome,
}

/// A message received from, or about to be sent to, the server.
#[derive(Clone)]
pub struct ClientMsgData {
    pub service: Arc<ServiceDef>,
    pub msg: Value,
}

pub struct ClientFlows {
    pub pre_call_api: Flow<CallApiData>,
    pub pre_api_return: Flow<ReturnData>,
    pub post_api_return: Flow<ReturnData>,
    pub pre_send_data: Flow<Vec<u8>>,
    pub pre_recv_data: Flow<Vec<u8>>,
    pub pre_recv_msg: Flow<ClientMsgData>,
    pub pre_send_msg: Flow<ClientMsgData>,
    pub post_send_msg: Flow<ClientMsgData>,
}

impl ClientFlows {
    pub fn new() -> Self {
        Self {
            pre_call_api: Flow::new("pre_call_api"),
            pre_api_return: Flow::new("pre_api_return"),
            post_api_return: Flow::new("post_api_return"),
            pre_send_data: Flow::new("pre_send_data"),
            pre_recv_data: Flow::new("pre_recv_data"),
            pre_recv_msg: Flow::new("pre_recv_msg"),
            pre_send_msg: Flow::new("pre_send_msg"),
            post_send_msg: Flow::new("post_send_msg"),
        }
    }
}

impl Default for ClientFlows {
    fn default() -> Self {
        Self::new()
    }
}
