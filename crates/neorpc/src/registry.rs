//! # Service Registry
//!
//! The registry is the source of truth for every API and Message a process can
//! serve or call. It maps the stable numeric id used on the wire and the
//! human-facing name to one immutable [`ServiceDef`].
//!
//! ## Philosophy
//!
//! - **Build-Time Safety**: duplicate ids, duplicate names and dangling schema
//!   references are rejected when the registry is built, never at call time.
//! - **Read-Only**: there is no mutation after [`ServiceRegistry::build`]; share it
//!   behind an `Arc` across every connection and call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::schema::SchemaDoc;

/// Registry construction errors.
#[derive(Debug, Clone)]
pub enum Error {
    /// Two services share a wire id.
    DuplicateId(u32),
    /// Two services of the same kind share a name.
    DuplicateName { kind: ServiceKind, name: String },
    /// A service references a schema id absent from the document.
    MissingSchema { service: String, schema_id: String },
    /// A service declares schema slots that do not fit its kind.
    InvalidService { service: String, details: String },
    /// The proto document could not be parsed.
    Parse(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId(id) => write!(f, "duplicate service id {}", id),
            Self::DuplicateName { kind, name } => write!(f, "duplicate {} service name '{}'", kind, name),
            Self::MissingSchema { service, schema_id } => {
                write!(f, "service '{}' references unknown schema '{}'", service, schema_id)
            }
            Self::InvalidService { service, details } => write!(f, "service '{}' is invalid: {}", service, details),
            Self::Parse(msg) => write!(f, "proto document parse error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether a service is answered (API) or fire-and-forget (Message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceKind {
    #[serde(rename = "api", alias = "API")]
    Api,
    #[serde(rename = "msg", alias = "MESSAGE", alias = "message")]
    Msg,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Api => write!(f, "api"),
            Self::Msg => write!(f, "msg"),
        }
    }
}

/// One registered API or Message.
///
/// Absent schema ids mean the corresponding body is not validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDef {
    pub id: u32,
    /// Path-like routable name, e.g. `"user/Login"`.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_schema_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_schema_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_schema_id: Option<String>,
    /// Opaque per-service configuration carried through from the proto document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<Map<String, Value>>,
}

impl ServiceDef {
    pub fn api(id: u32, name: impl Into<String>, req: Option<&str>, res: Option<&str>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ServiceKind::Api,
            req_schema_id: req.map(str::to_string),
            res_schema_id: res.map(str::to_string),
            msg_schema_id: None,
            conf: None,
        }
    }

    pub fn msg(id: u32, name: impl Into<String>, msg: Option<&str>) -> Self {
        Self {
            id,
            name: name.into(),
            kind: ServiceKind::Msg,
            req_schema_id: None,
            res_schema_id: None,
            msg_schema_id: msg.map(str::to_string),
            conf: None,
        }
    }

    pub fn is_api(&self) -> bool {
        self.kind == ServiceKind::Api
    }

    pub fn is_msg(&self) -> bool {
        self.kind == ServiceKind::Msg
    }

    fn schema_refs(&self) -> impl Iterator<Item = &str> {
        [&self.req_schema_id, &self.res_schema_id, &self.msg_schema_id]
            .into_iter()
            .filter_map(|id| id.as_deref())
    }
}

/// The loadable form of a registry, as produced by the code generator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtoDoc {
    #[serde(default)]
    pub version: u32,
    pub services: Vec<ServiceDef>,
    #[serde(default)]
    pub types: SchemaDoc,
}

/// Immutable index of services by id and by (kind, name).
#[derive(Debug)]
pub struct ServiceRegistry {
    version: u32,
    services: Vec<Arc<ServiceDef>>,
    by_id: HashMap<u32, usize>,
    api_by_name: HashMap<String, usize>,
    msg_by_name: HashMap<String, usize>,
    schemas: SchemaDoc,
}

impl ServiceRegistry {
    /// Indexes a proto document, failing on the first inconsistency.
    pub fn build(doc: ProtoDoc) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(doc.services.len());
        let mut api_by_name = HashMap::new();
        let mut msg_by_name = HashMap::new();
        let mut services = Vec::with_capacity(doc.services.len());

        for (idx, svc) in doc.services.into_iter().enumerate() {
            check_slots(&svc)?;

            for schema_id in svc.schema_refs() {
                if !doc.types.contains(schema_id) {
                    return Err(Error::MissingSchema { service: svc.name.clone(), schema_id: schema_id.to_string() });
                }
            }

            if by_id.insert(svc.id, idx).is_some() {
                return Err(Error::DuplicateId(svc.id));
            }

            let names = match svc.kind {
                ServiceKind::Api => &mut api_by_name,
                ServiceKind::Msg => &mut msg_by_name,
            };
            if names.insert(svc.name.clone(), idx).is_some() {
                return Err(Error::DuplicateName { kind: svc.kind, name: svc.name });
            }

            services.push(Arc::new(svc));
        }

        tracing::debug!(services = services.len(), schemas = doc.types.len(), "service registry built");

        Ok(Self { version: doc.version, services, by_id, api_by_name, msg_by_name, schemas: doc.types })
    }

    /// Parses and indexes a JSON proto document.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: ProtoDoc = serde_json::from_str(json).map_err(|e| Error::Parse(e.to_string()))?;
        Self::build(doc)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn by_id(&self, id: u32) -> Option<&Arc<ServiceDef>> {
        self.by_id.get(&id).map(|&idx| &self.services[idx])
    }

    pub fn by_name(&self, kind: ServiceKind, name: &str) -> Option<&Arc<ServiceDef>> {
        let names = match kind {
            ServiceKind::Api => &self.api_by_name,
            ServiceKind::Msg => &self.msg_by_name,
        };
        names.get(name).map(|&idx| &self.services[idx])
    }

    pub fn api(&self, name: &str) -> Option<&Arc<ServiceDef>> {
        self.by_name(ServiceKind::Api, name)
    }

    pub fn msg(&self, name: &str) -> Option<&Arc<ServiceDef>> {
        self.by_name(ServiceKind::Msg, name)
    }

    /// All services in document order.
    pub fn services(&self) -> impl Iterator<Item = &Arc<ServiceDef>> {
        self.services.iter()
    }

    pub fn schemas(&self) -> &SchemaDoc {
        &self.schemas
    }
}

fn check_slots(svc: &ServiceDef) -> Result<()> {
    let misplaced = match svc.kind {
        ServiceKind::Api => svc.msg_schema_id.is_some().then_some("api declares msgSchemaId"),
        ServiceKind::Msg => (svc.req_schema_id.is_some() || svc.res_schema_id.is_some())
            .then_some("msg declares reqSchemaId/resSchemaId"),
    };
    match misplaced {
        Some(details) => Err(Error::InvalidService { service: svc.name.clone(), details: details.to_string() }),
        None => Ok(()),
    }
}
