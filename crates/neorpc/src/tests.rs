// File: crates/neorpc/src/tests.rs
use std::sync::Arc;

use rand::Rng;
use serde_json::json;
use serde_json::Value;

use crate::*;

// ============================================================================
//  FIXTURES
// ============================================================================

const PROTO: &str = r#"{
    "version": 3,
    "services": [
        { "id": 0, "name": "Test", "type": "api", "reqSchemaId": "PtlTest/ReqTest", "resSchemaId": "PtlTest/ResTest" },
        { "id": 1, "name": "chat/Chat", "type": "msg", "msgSchemaId": "MsgChat/MsgChat" },
        { "id": 2, "name": "Loose", "type": "api", "conf": { "needLogin": true } }
    ],
    "types": {
        "PtlTest/ReqTest": { "type": "object", "properties": { "name": { "type": "string" } } },
        "PtlTest/ResTest": { "type": "object", "properties": { "reply": { "type": "string" } } },
        "MsgChat/MsgChat": { "type": "object", "properties": { "content": { "type": "string" }, "time": { "type": "integer" } } }
    }
}"#;

fn registry() -> Arc<ServiceRegistry> {
    Arc::new(ServiceRegistry::from_json(PROTO).expect("fixture proto is valid"))
}

fn validator(reg: &ServiceRegistry) -> Arc<dyn Validator> {
    Arc::new(SchemaValidator::new(reg.schemas().clone()))
}

fn binary() -> BinaryCodec {
    let reg = registry();
    let v = validator(&reg);
    BinaryCodec::new(reg, v)
}

fn text() -> JsonCodec {
    let reg = registry();
    let v = validator(&reg);
    JsonCodec::new(reg, v)
}

fn api(codec: &dyn FrameCodec, name: &str) -> Arc<ServiceDef> {
    codec.registry().api(name).cloned().expect("api exists")
}

fn msg(codec: &dyn FrameCodec, name: &str) -> Arc<ServiceDef> {
    codec.registry().msg(name).cloned().expect("msg exists")
}

// ============================================================================
//  1. REGISTRY
// ============================================================================

#[test]
fn test_registry_lookup_by_id_and_name() {
    let reg = registry();
    assert_eq!(reg.version(), 3);
    assert_eq!(reg.by_id(0).unwrap().name, "Test");
    assert_eq!(reg.by_id(1).unwrap().kind, ServiceKind::Msg);
    assert!(reg.by_id(99).is_none());

    assert_eq!(reg.api("Test").unwrap().id, 0);
    assert!(reg.api("chat/Chat").is_none(), "name lookup is per kind");
    assert_eq!(reg.msg("chat/Chat").unwrap().id, 1);
    assert_eq!(reg.services().count(), 3);
}

#[test]
fn test_registry_keeps_opaque_conf() {
    let reg = registry();
    let conf = reg.api("Loose").unwrap().conf.as_ref().unwrap();
    assert_eq!(conf.get("needLogin"), Some(&json!(true)));
}

#[test]
fn test_registry_rejects_duplicate_id() {
    let doc = ProtoDoc {
        version: 1,
        services: vec![ServiceDef::api(1, "A", None, None), ServiceDef::msg(1, "B", None)],
        types: SchemaDoc::new(),
    };
    match ServiceRegistry::build(doc) {
        Err(registry::Error::DuplicateId(1)) => {}
        other => panic!("Expected DuplicateId, got {:?}", other),
    }
}

#[test]
fn test_registry_name_unique_per_kind_only() {
    let same_kind = ProtoDoc {
        version: 1,
        services: vec![ServiceDef::api(1, "A", None, None), ServiceDef::api(2, "A", None, None)],
        types: SchemaDoc::new(),
    };
    assert!(matches!(ServiceRegistry::build(same_kind), Err(registry::Error::DuplicateName { .. })));

    let across_kinds = ProtoDoc {
        version: 1,
        services: vec![ServiceDef::api(1, "A", None, None), ServiceDef::msg(2, "A", None)],
        types: SchemaDoc::new(),
    };
    ServiceRegistry::build(across_kinds).expect("same name in different kinds is allowed");
}

#[test]
fn test_registry_rejects_dangling_schema() {
    let doc = ProtoDoc {
        version: 1,
        services: vec![ServiceDef::api(1, "A", Some("Nope"), None)],
        types: SchemaDoc::new(),
    };
    match ServiceRegistry::build(doc) {
        Err(registry::Error::MissingSchema { service, schema_id }) => {
            assert_eq!(service, "A");
            assert_eq!(schema_id, "Nope");
        }
        other => panic!("Expected MissingSchema, got {:?}", other),
    }
}

#[test]
fn test_registry_rejects_misplaced_schema_slot() {
    let mut svc = ServiceDef::msg(1, "M", None);
    svc.req_schema_id = Some("X".into());
    let mut types = SchemaDoc::new();
    types.insert("X", Schema::Any);
    let doc = ProtoDoc { version: 1, services: vec![svc], types };
    assert!(matches!(ServiceRegistry::build(doc), Err(registry::Error::InvalidService { .. })));
}

#[test]
fn test_registry_parse_error() {
    assert!(matches!(ServiceRegistry::from_json("{"), Err(registry::Error::Parse(_))));
}

// ============================================================================
//  2. BINARY CODEC
// ============================================================================

#[test]
fn test_binary_request_layout() {
    let codec = binary();
    let svc = api(&codec, "Test");
    let bytes = codec.encode_request(&svc, 300, &json!({"name": "abc"})).unwrap();

    let body = br#"{"name":"abc"}"#;
    let mut expected = vec![0x00, 0x00, 0xac, 0x02, body.len() as u8];
    expected.extend_from_slice(body);
    assert_eq!(bytes, expected);
}

#[test]
fn test_binary_request_decodes_to_same_sn() {
    let codec = binary();
    let svc = api(&codec, "Test");
    let bytes = codec.encode_request(&svc, 42, &json!({"name": "abc"})).unwrap();

    match codec.decode(&bytes).unwrap() {
        Frame::Request { service, sn, req } => {
            assert_eq!(service.name, "Test");
            assert_eq!(sn, 42);
            assert_eq!(req, json!({"name": "abc"}));
        }
        other => panic!("Expected Request, got {:?}", other),
    }
}

#[test]
fn test_binary_response_success_and_failure() {
    let codec = binary();
    let svc = api(&codec, "Test");

    let ok = codec.encode_response(&svc, 7, &Ok(json!({"reply": "echo:abc"}))).unwrap();
    match codec.decode(&ok).unwrap() {
        Frame::Response { service, sn, outcome } => {
            assert_eq!(service.unwrap().id, 0);
            assert_eq!(sn, 7);
            assert_eq!(outcome, Ok(json!({"reply": "echo:abc"})));
        }
        other => panic!("Expected Response, got {:?}", other),
    }

    let err = RpcError::api("Name taken").with_code("NAME_TAKEN");
    let fail = codec.encode_response(&svc, 8, &Err(err.clone())).unwrap();
    match codec.decode(&fail).unwrap() {
        Frame::Response { sn, outcome, .. } => {
            assert_eq!(sn, 8);
            assert_eq!(outcome, Err(err));
        }
        other => panic!("Expected Response, got {:?}", other),
    }
}

#[test]
fn test_binary_error_body_is_structured_json() {
    let codec = binary();
    let svc = api(&codec, "Test");
    let bytes = codec.encode_response(&svc, 1, &Err(RpcError::server("boom").with_code(code::NO_RESPONSE))).unwrap();
    // [kind][id][sn][flag] then JSON
    let json: Value = serde_json::from_slice(&bytes[4..]).unwrap();
    assert_eq!(json, json!({"message": "boom", "type": "ServerError", "code": "NO_RESPONSE"}));
}

#[test]
fn test_binary_message_has_no_sn() {
    let codec = binary();
    let svc = msg(&codec, "chat/Chat");
    let bytes = codec.encode_message(&svc, &json!({"content": "hi", "time": 1})).unwrap();
    assert_eq!(bytes[0], 0x02);

    let frame = codec.decode(&bytes).unwrap();
    assert_eq!(frame.sn(), None);
    assert_eq!(frame.kind_name(), "message");
}

#[test]
fn test_binary_encode_rejects_schema_mismatch() {
    let codec = binary();
    let svc = api(&codec, "Test");
    match codec.encode_request(&svc, 1, &json!({"name": 5})) {
        Err(Error::Encode { service, .. }) => assert_eq!(service, "Test"),
        other => panic!("Expected Encode error, got {:?}", other),
    }
}

#[test]
fn test_binary_encode_rejects_wrong_kind() {
    let codec = binary();
    let svc = msg(&codec, "chat/Chat");
    assert!(matches!(codec.encode_request(&svc, 1, &json!({})), Err(Error::KindMismatch { .. })));
}

#[test]
fn test_binary_unknown_service_keeps_sn() {
    let codec = binary();
    let bytes = [0x00, 0x63, 0x05, 0x02, b'{', b'}'];
    match codec.decode(&bytes) {
        Err(DecodeError::UnknownService { service, sn }) => {
            assert_eq!(service, ServiceRef::Id(99));
            assert_eq!(sn, Some(5));
        }
        other => panic!("Expected UnknownService, got {:?}", other),
    }
}

#[test]
fn test_binary_payload_failure_is_distinct_from_envelope() {
    let codec = binary();
    let body = br#"{"name":1}"#;
    let mut bytes = vec![0x00, 0x00, 0x09, body.len() as u8];
    bytes.extend_from_slice(body);

    let err = codec.decode(&bytes).unwrap_err();
    assert_eq!(err.sn(), Some(9));
    assert!(matches!(err, DecodeError::Payload { service_id: 0, .. }));

    let truncated = &bytes[..bytes.len() - 2];
    assert!(matches!(codec.decode(truncated), Err(DecodeError::Envelope(_))));
}

#[test]
fn test_binary_rejects_trailing_bytes_and_bad_kind() {
    let codec = binary();
    let svc = api(&codec, "Test");
    let mut bytes = codec.encode_request(&svc, 1, &json!({"name": "a"})).unwrap();
    bytes.push(0xff);
    assert!(matches!(codec.decode(&bytes), Err(DecodeError::Envelope(_))));

    assert!(matches!(codec.decode(&[0x09]), Err(DecodeError::Envelope(_))));
    assert!(matches!(codec.decode(&[]), Err(DecodeError::Envelope(_))));
}

#[test]
fn test_binary_message_id_is_not_an_api() {
    let codec = binary();
    // A Request frame addressed at the Message service id.
    let bytes = [0x00, 0x01, 0x01, 0x02, b'{', b'}'];
    assert!(matches!(codec.decode(&bytes), Err(DecodeError::UnknownService { .. })));
}

#[test]
fn test_binary_unroutable_failure_decodes_without_service() {
    let codec = binary();
    let err = RpcError::server("Unhandled API: Missing").with_code(code::UNHANDLED_API);
    let bytes = codec.encode_unroutable(&ServiceRef::Id(77), 4, &err).unwrap();
    match codec.decode(&bytes).unwrap() {
        Frame::Response { service, sn, outcome } => {
            assert!(service.is_none());
            assert_eq!(sn, 4);
            assert_eq!(outcome.unwrap_err().code.as_deref(), Some("UNHANDLED_API"));
        }
        other => panic!("Expected Response, got {:?}", other),
    }
}

#[test]
fn test_binary_sn_fuzz_round_trip() {
    let codec = binary();
    let svc = api(&codec, "Test");
    let mut rng = rand::thread_rng();
    let boundaries = [0, 1, 127, 128, u32::MAX as u64 - 1, u32::MAX as u64, u64::MAX];

    let samples = boundaries.into_iter().chain((0..200).map(|_| rng.gen::<u64>()));
    for sn in samples {
        let bytes = codec.encode_response(&svc, sn, &Ok(json!({"reply": "x"}))).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap().sn(), Some(sn));
    }
}

#[test]
fn test_binary_pooled_codec_recycles_buffers() {
    let reg = registry();
    let v = validator(&reg);
    let pool = Arc::new(BufferPool::new(8, 64, 4096));
    let codec = BinaryCodec::new(reg, v).with_alloc(pool.clone());
    let svc = api(&codec, "Test");

    let bytes = codec.encode_request(&svc, 1, &json!({"name": "a"})).unwrap();
    // The body scratch buffer went back to the pool already.
    assert_eq!(pool.idle(), 1);
    codec.release(bytes);
    assert_eq!(pool.idle(), 2);

    // A failed encode does not leak its frame buffer.
    assert!(codec.encode_request(&svc, 2, &json!({})).is_err());
    assert_eq!(pool.idle(), 2);
}

#[test]
fn test_binary_unvalidated_service_accepts_any_json() {
    let codec = binary();
    let svc = api(&codec, "Loose");
    let bytes = codec.encode_request(&svc, 3, &json!([1, "two", null])).unwrap();
    match codec.decode(&bytes).unwrap() {
        Frame::Request { req, .. } => assert_eq!(req, json!([1, "two", null])),
        other => panic!("Expected Request, got {:?}", other),
    }
}

// ============================================================================
//  3. JSON TEXT CODEC
// ============================================================================

#[test]
fn test_text_request_shape() {
    let codec = text();
    let svc = api(&codec, "Test");
    let bytes = codec.encode_request(&svc, 5, &json!({"name": "abc"})).unwrap();
    let v: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v, json!({"serviceId": 0, "sn": 5, "req": {"name": "abc"}}));
}

#[test]
fn test_text_response_shapes() {
    let codec = text();
    let svc = api(&codec, "Test");

    let ok = codec.encode_response(&svc, 5, &Ok(json!({"reply": "r"}))).unwrap();
    let v: Value = serde_json::from_slice(&ok).unwrap();
    assert_eq!(v, json!({"serviceId": 0, "sn": 5, "isSucc": true, "res": {"reply": "r"}}));

    let fail = codec.encode_response(&svc, 6, &Err(RpcError::api("nope"))).unwrap();
    let v: Value = serde_json::from_slice(&fail).unwrap();
    assert_eq!(v, json!({"serviceId": 0, "sn": 6, "isSucc": false, "err": {"message": "nope", "type": "ApiError"}}));
}

#[test]
fn test_text_decode_by_name() {
    let codec = text();
    let frame = codec.decode(br#"{"name": "Test", "sn": 2, "req": {"name": "x"}}"#).unwrap();
    match frame {
        Frame::Request { service, sn, .. } => {
            assert_eq!(service.id, 0);
            assert_eq!(sn, 2);
        }
        other => panic!("Expected Request, got {:?}", other),
    }

    let frame = codec.decode(br#"{"name": "chat/Chat", "msg": {"content": "c", "time": 2}}"#).unwrap();
    assert!(matches!(frame, Frame::Message { .. }));
}

#[test]
fn test_text_unknown_name_is_unroutable() {
    let codec = text();
    let err = codec.decode(br#"{"name": "Missing", "sn": 11, "req": {}}"#).unwrap_err();
    match &err {
        DecodeError::UnknownService { service, sn } => {
            assert_eq!(service, &ServiceRef::Name("Missing".into()));
            assert_eq!(*sn, Some(11));
        }
        other => panic!("Expected UnknownService, got {:?}", other),
    }

    let reply = codec
        .encode_unroutable(&ServiceRef::Name("Missing".into()), 11, &RpcError::server("Unhandled API: Missing").with_code(code::UNHANDLED_API))
        .unwrap();
    let v: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(v["name"], json!("Missing"));
    assert_eq!(v["isSucc"], json!(false));
    assert_eq!(v["err"]["type"], json!("ServerError"));
    assert_eq!(v["err"]["code"], json!("UNHANDLED_API"));
}

#[test]
fn test_text_envelope_errors() {
    let codec = text();
    for bad in [&b"not json"[..], b"[1,2]", br#"{"sn": 1, "req": {}}"#, br#"{"serviceId": 0, "req": {}}"#, br#"{"serviceId": 0, "sn": 1}"#] {
        assert!(matches!(codec.decode(bad), Err(DecodeError::Envelope(_))), "input {:?}", String::from_utf8_lossy(bad));
    }
}

#[test]
fn test_text_payload_error() {
    let codec = text();
    let err = codec.decode(br#"{"serviceId": 0, "sn": 3, "req": {"wrong": 1}}"#).unwrap_err();
    assert!(matches!(err, DecodeError::Payload { sn: Some(3), .. }));
}

#[test]
fn test_text_inner_error_only_when_present() {
    let codec = text();
    let svc = api(&codec, "Test");
    let err = RpcError::server("Internal Server Error").with_inner("db exploded");
    let bytes = codec.encode_response(&svc, 1, &Err(err)).unwrap();
    let v: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["err"]["innerErr"], json!("db exploded"));

    let bytes = codec.encode_response(&svc, 1, &Err(RpcError::server("Internal Server Error"))).unwrap();
    let v: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(v["err"].get("innerErr").is_none());
}
