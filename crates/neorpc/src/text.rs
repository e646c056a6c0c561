//! # JSON Text Frames
//!
//! The text variant of the wire format, for peers that speak JSON:
//!
//! - Request:  `{"serviceId": 1, "sn": 7, "req": {..}}`
//! - Response: `{"serviceId": 1, "sn": 7, "isSucc": true, "res": {..}}`
//!   or `{"serviceId": 1, "sn": 7, "isSucc": false, "err": {..}}`
//! - Message:  `{"serviceId": 2, "msg": {..}}`
//!
//! Inbound frames may address a service by `"name"` instead of `"serviceId"`.
//! Outbound frames always use `"serviceId"`, except when echoing an unroutable name.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::alloc::BufferAlloc;
use crate::error::DecodeError;
use crate::error::Error;
use crate::error::Result;
use crate::error::RpcError;
use crate::error::ServiceRef;
use crate::frame::CodecCore;
use crate::frame::Frame;
use crate::frame::FrameCodec;
use crate::frame::Outcome;
use crate::registry::ServiceDef;
use crate::registry::ServiceKind;
use crate::registry::ServiceRegistry;
use crate::schema::Validator;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestOut<'a> {
    service_id: u32,
    sn: u64,
    req: &'a Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResponseOut<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    service_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    sn: u64,
    is_succ: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    res: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<&'a RpcError>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageOut<'a> {
    service_id: u32,
    msg: &'a Value,
}

/// JSON text frames. Bodies are embedded as JSON values, validated in place.
#[derive(Clone)]
pub struct JsonCodec {
    core: CodecCore,
}

impl JsonCodec {
    pub fn new(registry: Arc<ServiceRegistry>, validator: Arc<dyn Validator>) -> Self {
        Self { core: CodecCore::new(registry, validator) }
    }

    pub fn with_alloc(mut self, alloc: Arc<dyn BufferAlloc>) -> Self {
        self.core.alloc = alloc;
        self
    }

    fn write<T: Serialize>(&self, service: &str, frame: &T) -> Result<Vec<u8>> {
        let mut buf = self.core.alloc.acquire();
        match serde_json::to_writer(&mut buf, frame) {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.core.alloc.release(buf);
                Err(Error::Encode { service: service.to_string(), reason: e.to_string() })
            }
        }
    }
}

fn take_sn(map: &mut Map<String, Value>) -> std::result::Result<Option<u64>, DecodeError> {
    match map.remove("sn") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| DecodeError::Envelope(format!("sn must be an unsigned integer, got {}", v))),
    }
}

fn take_service(map: &mut Map<String, Value>) -> std::result::Result<ServiceRef, DecodeError> {
    if let Some(id) = map.remove("serviceId") {
        let id = id
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| DecodeError::Envelope(format!("invalid serviceId {}", id)))?;
        return Ok(ServiceRef::Id(id));
    }
    match map.remove("name") {
        Some(Value::String(name)) => Ok(ServiceRef::Name(name)),
        Some(other) => Err(DecodeError::Envelope(format!("invalid name {}", other))),
        None => Err(DecodeError::Envelope("missing serviceId or name".into())),
    }
}

impl FrameCodec for JsonCodec {
    fn encode_request(&self, service: &ServiceDef, sn: u64, req: &Value) -> Result<Vec<u8>> {
        CodecCore::expect_kind(service, ServiceKind::Api)?;
        self.core.validate_body(service, service.req_schema_id.as_deref(), req)?;
        self.write(&service.name, &RequestOut { service_id: service.id, sn, req })
    }

    fn encode_response(&self, service: &ServiceDef, sn: u64, outcome: &Outcome) -> Result<Vec<u8>> {
        CodecCore::expect_kind(service, ServiceKind::Api)?;
        let frame = match outcome {
            Ok(res) => {
                self.core.validate_body(service, service.res_schema_id.as_deref(), res)?;
                ResponseOut { service_id: Some(service.id), name: None, sn, is_succ: true, res: Some(res), err: None }
            }
            Err(err) => ResponseOut { service_id: Some(service.id), name: None, sn, is_succ: false, res: None, err: Some(err) },
        };
        self.write(&service.name, &frame)
    }

    fn encode_unroutable(&self, service: &ServiceRef, sn: u64, err: &RpcError) -> Result<Vec<u8>> {
        let (service_id, name) = match service {
            ServiceRef::Id(id) => (Some(*id), None),
            ServiceRef::Name(name) => (None, Some(name.as_str())),
        };
        let frame = ResponseOut { service_id, name, sn, is_succ: false, res: None, err: Some(err) };
        self.write("<unroutable>", &frame)
    }

    fn encode_message(&self, service: &ServiceDef, msg: &Value) -> Result<Vec<u8>> {
        CodecCore::expect_kind(service, ServiceKind::Msg)?;
        self.core.validate_body(service, service.msg_schema_id.as_deref(), msg)?;
        self.write(&service.name, &MessageOut { service_id: service.id, msg })
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Frame, DecodeError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| DecodeError::Envelope(e.to_string()))?;
        let Value::Object(mut map) = value else {
            return Err(DecodeError::Envelope("frame is not a JSON object".into()));
        };

        let service_ref = take_service(&mut map)?;
        let sn = take_sn(&mut map)?;

        if let Some(is_succ) = map.remove("isSucc") {
            let sn = sn.ok_or_else(|| DecodeError::Envelope("response without sn".into()))?;
            return match is_succ {
                Value::Bool(true) => {
                    let res = map.remove("res").unwrap_or(Value::Null);
                    let service = self.core.resolve(service_ref, ServiceKind::Api, Some(sn))?;
                    self.core.check_body(&service, service.res_schema_id.as_deref(), Some(sn), &res)?;
                    Ok(Frame::Response { service: Some(service), sn, outcome: Ok(res) })
                }
                Value::Bool(false) => {
                    let err = map.remove("err").ok_or_else(|| DecodeError::Envelope("failure without err".into()))?;
                    let err: RpcError = serde_json::from_value(err).map_err(|e| DecodeError::Envelope(format!("error body: {}", e)))?;
                    let service = self.core.resolve(service_ref, ServiceKind::Api, Some(sn)).ok();
                    Ok(Frame::Response { service, sn, outcome: Err(err) })
                }
                other => Err(DecodeError::Envelope(format!("isSucc must be a boolean, got {}", other))),
            };
        }

        if let Some(req) = map.remove("req") {
            let sn = sn.ok_or_else(|| DecodeError::Envelope("request without sn".into()))?;
            let service = self.core.resolve(service_ref, ServiceKind::Api, Some(sn))?;
            self.core.check_body(&service, service.req_schema_id.as_deref(), Some(sn), &req)?;
            return Ok(Frame::Request { service, sn, req });
        }

        if let Some(msg) = map.remove("msg") {
            let service = self.core.resolve(service_ref, ServiceKind::Msg, None)?;
            self.core.check_body(&service, service.msg_schema_id.as_deref(), None, &msg)?;
            return Ok(Frame::Message { service, msg });
        }

        Err(DecodeError::Envelope("frame has none of req, msg, isSucc".into()))
    }

    fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.core.registry
    }

    fn release(&self, buf: Vec<u8>) {
        self.core.alloc.release(buf);
    }
}
