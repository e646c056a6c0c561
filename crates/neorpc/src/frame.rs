//! # Protocol Frames
//!
//! Defines the RPC envelope (Request, Response, Message), the [`FrameCodec`]
//! contract every wire format satisfies, and the binary format.
//!
//! ## Binary Wire Format
//!
//! Every frame starts with a kind byte; all integers are unsigned LEB128.
//!
//! - Request:  `[0][serviceId][sn][bodyLen][body]`
//! - Response: `[1][serviceId][sn][1][resLen][res]` or `[1][serviceId][sn][0][errJson]`
//! - Message:  `[2][serviceId][bodyLen][body]`
//!
//! ## Invariants
//! - **Panic Safety**: All decoding paths return `Result`, never panicking on unknown data.
//! - **Two Failure Domains**: the envelope is parsed completely before the service
//!   is resolved and before the payload is validated, so the caller can tell
//!   [`DecodeError::Envelope`], [`DecodeError::UnknownService`] and
//!   [`DecodeError::Payload`] apart.

use std::sync::Arc;

use serde_json::Value;

use crate::alloc::BufferAlloc;
use crate::alloc::Unpooled;
use crate::error::DecodeError;
use crate::error::Error;
use crate::error::Result;
use crate::error::RpcError;
use crate::error::ServiceRef;
use crate::registry::ServiceDef;
use crate::registry::ServiceKind;
use crate::registry::ServiceRegistry;
use crate::schema::Validator;
use crate::varint;
use crate::varint::Reader;

/// The result of one API call: the `res` body, or the structured error.
pub type Outcome = std::result::Result<Value, RpcError>;

const KIND_REQUEST: u8 = 0;
const KIND_RESPONSE: u8 = 1;
const KIND_MESSAGE: u8 = 2;

const FLAG_FAIL: u8 = 0;
const FLAG_SUCC: u8 = 1;

/// One decoded wire unit.
#[derive(Debug, Clone)]
pub enum Frame {
    Request { service: Arc<ServiceDef>, sn: u64, req: Value },
    /// `service` is `None` only for failures answering an unroutable request;
    /// success bodies always resolve so they can be validated.
    Response { service: Option<Arc<ServiceDef>>, sn: u64, outcome: Outcome },
    Message { service: Arc<ServiceDef>, msg: Value },
}

impl Frame {
    pub fn sn(&self) -> Option<u64> {
        match self {
            Frame::Request { sn, .. } | Frame::Response { sn, .. } => Some(*sn),
            Frame::Message { .. } => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "request",
            Frame::Response { .. } => "response",
            Frame::Message { .. } => "message",
        }
    }
}

/// The contract every wire format satisfies.
///
/// This trait is object-safe so the runtime can hold an `Arc<dyn FrameCodec>`.
pub trait FrameCodec: Send + Sync + 'static {
    /// Validates `req` against the service's request schema and frames it.
    fn encode_request(&self, service: &ServiceDef, sn: u64, req: &Value) -> Result<Vec<u8>>;

    /// Frames a success (validated against the response schema) or a structured error.
    fn encode_response(&self, service: &ServiceDef, sn: u64, outcome: &Outcome) -> Result<Vec<u8>>;

    /// Frames an error answering a request whose service could not be resolved.
    fn encode_unroutable(&self, service: &ServiceRef, sn: u64, err: &RpcError) -> Result<Vec<u8>>;

    fn encode_message(&self, service: &ServiceDef, msg: &Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Frame, DecodeError>;

    fn registry(&self) -> &Arc<ServiceRegistry>;

    /// Hands a sent frame buffer back to the codec's allocator.
    fn release(&self, buf: Vec<u8>);
}

/// State shared by the concrete codecs.
#[derive(Clone)]
pub(crate) struct CodecCore {
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) validator: Arc<dyn Validator>,
    pub(crate) alloc: Arc<dyn BufferAlloc>,
}

impl CodecCore {
    pub(crate) fn new(registry: Arc<ServiceRegistry>, validator: Arc<dyn Validator>) -> Self {
        Self { registry, validator, alloc: Arc::new(Unpooled) }
    }

    pub(crate) fn expect_kind(service: &ServiceDef, kind: ServiceKind) -> Result<()> {
        if service.kind == kind {
            return Ok(());
        }
        let expected = match kind {
            ServiceKind::Api => "api",
            ServiceKind::Msg => "msg",
        };
        Err(Error::KindMismatch { service: service.name.clone(), expected })
    }

    /// Validates `value` and appends its serialized form.
    pub(crate) fn encode_body(&self, service: &ServiceDef, schema_id: Option<&str>, value: &Value, buf: &mut Vec<u8>) -> Result<()> {
        let encoded = match schema_id {
            Some(id) => self.validator.encode_into(value, id, buf).map_err(|e| e.to_string()),
            None => serde_json::to_writer(buf, value).map_err(|e| e.to_string()),
        };
        encoded.map_err(|reason| Error::Encode { service: service.name.clone(), reason })
    }

    /// Checks `value` without serializing it (for formats that embed the value directly).
    pub(crate) fn validate_body(&self, service: &ServiceDef, schema_id: Option<&str>, value: &Value) -> Result<()> {
        match schema_id {
            Some(id) => self
                .validator
                .validate(value, id)
                .map_err(|e| Error::Encode { service: service.name.clone(), reason: e.to_string() }),
            None => Ok(()),
        }
    }

    pub(crate) fn decode_body(&self, service: &ServiceDef, schema_id: Option<&str>, sn: Option<u64>, bytes: &[u8]) -> std::result::Result<Value, DecodeError> {
        let decoded = match schema_id {
            Some(id) => self.validator.decode(bytes, id).map_err(|e| e.to_string()),
            None => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        };
        decoded.map_err(|reason| payload_error(service, sn, reason))
    }

    pub(crate) fn check_body(&self, service: &ServiceDef, schema_id: Option<&str>, sn: Option<u64>, value: &Value) -> std::result::Result<(), DecodeError> {
        match schema_id {
            Some(id) => self.validator.validate(value, id).map_err(|e| payload_error(service, sn, e.to_string())),
            None => Ok(()),
        }
    }

    /// Resolves a service of the expected kind; a wrong-kind hit counts as unknown.
    pub(crate) fn resolve(&self, service: ServiceRef, kind: ServiceKind, sn: Option<u64>) -> std::result::Result<Arc<ServiceDef>, DecodeError> {
        let found = match &service {
            ServiceRef::Id(id) => self.registry.by_id(*id).filter(|s| s.kind == kind),
            ServiceRef::Name(name) => self.registry.by_name(kind, name),
        };
        found.cloned().ok_or(DecodeError::UnknownService { service, sn })
    }
}

pub(crate) fn payload_error(service: &ServiceDef, sn: Option<u64>, reason: String) -> DecodeError {
    DecodeError::Payload { service_id: service.id, service_name: service.name.clone(), sn, reason }
}

/// The binary frame format described in the module docs.
#[derive(Clone)]
pub struct BinaryCodec {
    core: CodecCore,
}

impl BinaryCodec {
    pub fn new(registry: Arc<ServiceRegistry>, validator: Arc<dyn Validator>) -> Self {
        Self { core: CodecCore::new(registry, validator) }
    }

    /// Routes frame buffers through `alloc` (e.g. a [`crate::alloc::BufferPool`]).
    pub fn with_alloc(mut self, alloc: Arc<dyn BufferAlloc>) -> Self {
        self.core.alloc = alloc;
        self
    }

    /// Writes `[len][body]` for a body produced by `encode_body`.
    fn write_blob(&self, buf: &mut Vec<u8>, service: &ServiceDef, schema_id: Option<&str>, value: &Value) -> Result<()> {
        let mut scratch = self.core.alloc.acquire();
        let res = self.core.encode_body(service, schema_id, value, &mut scratch);
        if res.is_ok() {
            varint::write(buf, scratch.len() as u64);
            buf.extend_from_slice(&scratch);
        }
        self.core.alloc.release(scratch);
        res
    }

    /// Runs `fill` against a fresh frame buffer, releasing it again on failure.
    fn frame(&self, fill: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> Result<Vec<u8>> {
        let mut buf = self.core.alloc.acquire();
        match fill(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.core.alloc.release(buf);
                Err(e)
            }
        }
    }
}

fn envelope(what: &str) -> impl Fn(varint::Error) -> DecodeError + '_ {
    move |e| DecodeError::Envelope(format!("{}: {}", what, e))
}

fn read_service_id(r: &mut Reader) -> std::result::Result<u32, DecodeError> {
    let id = r.varint().map_err(envelope("service id"))?;
    u32::try_from(id).map_err(|_| DecodeError::Envelope(format!("service id {} out of range", id)))
}

fn write_error_json(buf: &mut Vec<u8>, err: &RpcError) -> Result<()> {
    serde_json::to_writer(buf, err).map_err(|e| Error::Encode { service: "<error>".into(), reason: e.to_string() })
}

impl FrameCodec for BinaryCodec {
    fn encode_request(&self, service: &ServiceDef, sn: u64, req: &Value) -> Result<Vec<u8>> {
        CodecCore::expect_kind(service, ServiceKind::Api)?;
        self.frame(|buf| {
            buf.push(KIND_REQUEST);
            varint::write(buf, service.id as u64);
            varint::write(buf, sn);
            self.write_blob(buf, service, service.req_schema_id.as_deref(), req)
        })
    }

    fn encode_response(&self, service: &ServiceDef, sn: u64, outcome: &Outcome) -> Result<Vec<u8>> {
        CodecCore::expect_kind(service, ServiceKind::Api)?;
        self.frame(|buf| {
            buf.push(KIND_RESPONSE);
            varint::write(buf, service.id as u64);
            varint::write(buf, sn);
            match outcome {
                Ok(res) => {
                    buf.push(FLAG_SUCC);
                    self.write_blob(buf, service, service.res_schema_id.as_deref(), res)
                }
                Err(err) => {
                    buf.push(FLAG_FAIL);
                    write_error_json(buf, err)
                }
            }
        })
    }

    fn encode_unroutable(&self, service: &ServiceRef, sn: u64, err: &RpcError) -> Result<Vec<u8>> {
        // The binary format only carries ids; a name-addressed request cannot be echoed.
        let id = match service {
            ServiceRef::Id(id) => *id,
            ServiceRef::Name(_) => 0,
        };
        self.frame(|buf| {
            buf.push(KIND_RESPONSE);
            varint::write(buf, id as u64);
            varint::write(buf, sn);
            buf.push(FLAG_FAIL);
            write_error_json(buf, err)
        })
    }

    fn encode_message(&self, service: &ServiceDef, msg: &Value) -> Result<Vec<u8>> {
        CodecCore::expect_kind(service, ServiceKind::Msg)?;
        self.frame(|buf| {
            buf.push(KIND_MESSAGE);
            varint::write(buf, service.id as u64);
            self.write_blob(buf, service, service.msg_schema_id.as_deref(), msg)
        })
    }

    fn decode(&self, bytes: &[u8]) -> std::result::Result<Frame, DecodeError> {
        let mut r = Reader::new(bytes);
        let kind = r.u8().map_err(envelope("kind"))?;

        match kind {
            KIND_REQUEST => {
                let id = read_service_id(&mut r)?;
                let sn = r.varint().map_err(envelope("sn"))?;
                let body = r.blob().map_err(envelope("body"))?;
                expect_end(&r)?;

                let service = self.core.resolve(ServiceRef::Id(id), ServiceKind::Api, Some(sn))?;
                let req = self.core.decode_body(&service, service.req_schema_id.as_deref(), Some(sn), body)?;
                Ok(Frame::Request { service, sn, req })
            }
            KIND_RESPONSE => {
                let id = read_service_id(&mut r)?;
                let sn = r.varint().map_err(envelope("sn"))?;
                match r.u8().map_err(envelope("flag"))? {
                    FLAG_SUCC => {
                        let body = r.blob().map_err(envelope("res"))?;
                        expect_end(&r)?;
                        let service = self.core.resolve(ServiceRef::Id(id), ServiceKind::Api, Some(sn))?;
                        let res = self.core.decode_body(&service, service.res_schema_id.as_deref(), Some(sn), body)?;
                        Ok(Frame::Response { service: Some(service), sn, outcome: Ok(res) })
                    }
                    FLAG_FAIL => {
                        let err: RpcError = serde_json::from_slice(r.rest())
                            .map_err(|e| DecodeError::Envelope(format!("error body: {}", e)))?;
                        let service = self.core.registry.by_id(id).filter(|s| s.is_api()).cloned();
                        Ok(Frame::Response { service, sn, outcome: Err(err) })
                    }
                    flag => Err(DecodeError::Envelope(format!("invalid outcome flag {:#04x}", flag))),
                }
            }
            KIND_MESSAGE => {
                let id = read_service_id(&mut r)?;
                let body = r.blob().map_err(envelope("body"))?;
                expect_end(&r)?;

                let service = self.core.resolve(ServiceRef::Id(id), ServiceKind::Msg, None)?;
                let msg = self.core.decode_body(&service, service.msg_schema_id.as_deref(), None, body)?;
                Ok(Frame::Message { service, msg })
            }
            other => Err(DecodeError::Envelope(format!("invalid frame kind {:#04x}", other))),
        }
    }

    fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.core.registry
    }

    fn release(&self, buf: Vec<u8>) {
        self.core.alloc.release(buf);
    }
}

fn expect_end(r: &Reader) -> std::result::Result<(), DecodeError> {
    match r.remaining() {
        0 => Ok(()),
        n => Err(DecodeError::Envelope(format!("{} trailing bytes", n))),
    }
}
