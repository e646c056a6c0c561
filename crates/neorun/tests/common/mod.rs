//! Shared fixtures for the neorun integration suites.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use neorpc::BinaryCodec;
use neorpc::FrameCodec;
use neorpc::JsonCodec;
use neorpc::RpcError;
use neorpc::SchemaValidator;
use neorpc::ServiceRegistry;
use neorun::ApiCall;
use neorun::Server;
use neorun::ServerOptions;
use neorun::transport;
use neorun::transport::Transport;
use serde_json::Value;
use serde_json::json;

pub const PROTO: &str = r#"{
    "version": 2,
    "services": [
        { "id": 0, "name": "Test", "type": "api", "reqSchemaId": "PtlTest/ReqTest", "resSchemaId": "PtlTest/ResTest" },
        { "id": 1, "name": "Slow", "type": "api" },
        { "id": 2, "name": "Unimplemented", "type": "api" },
        { "id": 3, "name": "chat/Chat", "type": "msg", "msgSchemaId": "MsgChat/MsgChat" },
        { "id": 4, "name": "Notice", "type": "msg" },
        { "id": 5, "name": "Fault", "type": "api" }
    ],
    "types": {
        "PtlTest/ReqTest": { "type": "object", "properties": { "name": { "type": "string" } } },
        "PtlTest/ResTest": { "type": "object", "properties": { "reply": { "type": "string" } } },
        "MsgChat/MsgChat": { "type": "object", "properties": { "content": { "type": "string" } } }
    }
}"#;

/// The same protocol one version later, with an API the server does not know yet.
pub const PROTO_NEXT: &str = r#"{
    "version": 3,
    "services": [
        { "id": 0, "name": "Test", "type": "api", "reqSchemaId": "PtlTest/ReqTest", "resSchemaId": "PtlTest/ResTest" },
        { "id": 1, "name": "Slow", "type": "api" },
        { "id": 2, "name": "Unimplemented", "type": "api" },
        { "id": 3, "name": "chat/Chat", "type": "msg", "msgSchemaId": "MsgChat/MsgChat" },
        { "id": 4, "name": "Notice", "type": "msg" },
        { "id": 5, "name": "Fault", "type": "api" },
        { "id": 9, "name": "Missing", "type": "api" }
    ],
    "types": {
        "PtlTest/ReqTest": { "type": "object", "properties": { "name": { "type": "string" } } },
        "PtlTest/ResTest": { "type": "object", "properties": { "reply": { "type": "string" } } },
        "MsgChat/MsgChat": { "type": "object", "properties": { "content": { "type": "string" } } }
    }
}"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Binary,
    Json,
}

pub const FORMATS: [Format; 2] = [Format::Binary, Format::Json];

pub fn codec_for(proto: &str, format: Format) -> Arc<dyn FrameCodec> {
    let registry = Arc::new(ServiceRegistry::from_json(proto).expect("fixture proto is valid"));
    let validator = Arc::new(SchemaValidator::new(registry.schemas().clone()));
    match format {
        Format::Binary => Arc::new(BinaryCodec::new(registry, validator)),
        Format::Json => Arc::new(JsonCodec::new(registry, validator)),
    }
}

pub fn codec(format: Format) -> Arc<dyn FrameCodec> {
    codec_for(PROTO, format)
}

/// A started server where `Test` echoes and `Slow` sleeps for `req.ms`.
pub fn echo_server(format: Format, options: ServerOptions) -> Server {
    neorun::logging::init_for_tests();
    let server = Server::new(codec(format), options);
    server
        .implement_api("Test", |call: Arc<ApiCall>| async move {
            let name = call.req()["name"].as_str().unwrap_or_default().to_string();
            call.succ(json!({ "reply": format!("echo:{}", name) })).await;
            Ok(())
        })
        .unwrap();
    server
        .implement_api("Slow", |call: Arc<ApiCall>| async move {
            let ms = call.req()["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            if call.req()["fail"].as_bool() == Some(true) {
                return Err(RpcError::api("Slow failed").with_code("SLOW_FAIL").into());
            }
            call.succ(json!({ "slept": ms })).await;
            Ok(())
        })
        .unwrap();
    server.start().unwrap();
    server
}

pub fn quiet_server_options() -> ServerOptions {
    ServerOptions::default().with_capture_faults(false)
}

/// Records every frame instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Vec<u8>>>,
    pub fail: std::sync::atomic::AtomicBool,
}

impl RecordingTransport {
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: &[u8]) -> transport::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(transport::Error::ConnectionLost("refused".into()));
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

pub fn res(value: Value) -> Result<Value, RpcError> {
    Ok(value)
}
