//! # NeoRPC
//!
//! The wire layer of the neorun call runtime: what a service is, what a frame
//! looks like, and how bodies are checked against the shared schema.
//!
//! ## Architecture
//!
//! - [`registry`]: the immutable service map, indexed by wire id and by name.
//! - [`schema`]: the schema document and the validator contract the codecs call into.
//! - [`frame`]: the frame envelope, the [`FrameCodec`] contract and the binary format.
//! - [`text`]: the JSON text format.
//! - [`alloc`]: pooled or unpooled frame buffers.

pub mod alloc;
pub mod error;
pub mod frame;
pub mod registry;
pub mod schema;
pub mod text;
pub mod varint;

#[cfg(test)]
mod tests;

pub use alloc::BufferAlloc;
pub use alloc::BufferPool;
pub use alloc::Unpooled;
pub use error::code;
pub use error::DecodeError;
pub use error::Error;
pub use error::ErrorType;
pub use error::Result;
pub use error::RpcError;
pub use error::ServiceRef;
pub use frame::BinaryCodec;
pub use frame::Frame;
pub use frame::FrameCodec;
pub use frame::Outcome;
pub use registry::ProtoDoc;
pub use registry::ServiceDef;
pub use registry::ServiceKind;
pub use registry::ServiceRegistry;
pub use schema::Schema;
pub use schema::SchemaDoc;
pub use schema::SchemaValidator;
pub use schema::Validator;
pub use text::JsonCodec;
