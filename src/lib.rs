//! annpack is a schema-driven binary serialization format for document
//! object graphs: a document owns a set of named, ordered record
//! collections (stores), and records reference each other by position
//! rather than by embedding. It is built for pipelines where successive
//! stages each understand only part of a document's schema: a stage that
//! does not know a field, a record type, or a whole store still
//! round-trips its bytes exactly.
//!
//! The pieces:
//!
//! - A static schema, declared once through [`DocSchema::builder`] and
//!   validated eagerly. Wire ("serial") names are independently
//!   assignable from declared names, so one schema can read data written
//!   under another's naming.
//! - A document graph ([`Doc`], [`Store`], [`Ann`]) whose records hold
//!   dynamic [`Value`]s, with pointer, self-pointer, and slice fields
//!   expressed as store indices.
//! - A per-stream runtime schema that reconciles the stream's
//!   self-declared layout against the static schema, deciding per class,
//!   field, and store whether data is materialized or preserved lazily
//!   as raw bytes.
//! - A [`Reader`] and [`Writer`] for the length-prefixed MessagePack
//!   wire format. Reading a document with schema A, mutating a known
//!   field, and writing it back with schema A reproduces every unknown
//!   byte exactly.
//!
//! ```
//! use annpack::{AnnDef, Ann, Doc, DocSchema, FieldDef, FieldType, Reader, StoreDef, Value, Writer};
//!
//! let schema = DocSchema::builder("Doc")
//!     .ann(AnnDef::new("Token").field(FieldDef::primitive("raw", FieldType::Str)))
//!     .store(StoreDef::new("tokens", "Token"))
//!     .build()?;
//!
//! let mut doc = Doc::new(&schema);
//! let mut tok = Ann::new(&schema.types()[0]);
//! tok.set(0, "hello");
//! doc.store_mut(0).push(tok)?;
//!
//! let mut bytes = Vec::new();
//! Writer::new(&mut bytes, &schema).write(&doc)?;
//!
//! let mut reader = Reader::new(bytes.as_slice(), &schema);
//! let out = reader.read_doc()?.expect("one document");
//! assert_eq!(out.store(0).get(0).unwrap().get(0), Some(&Value::Str("hello".into())));
//! # Ok::<(), annpack::Error>(())
//! ```

mod decode;
mod document;
mod encode;
mod error;
mod marker;
mod reader;
mod runtime;
mod schema;
mod value;
mod writer;

pub use self::document::{Ann, Doc, Store};
pub use self::error::{EncodeError, Error, FormatError, Result, SchemaError};
pub use self::reader::Reader;
pub use self::runtime::Runtime;
pub use self::schema::{
    AnnDef, AnnSchema, DocSchema, DocSchemaBuilder, FieldDef, FieldKind, FieldMode, FieldSchema,
    FieldType, StoreDef, StoreSchema,
};
pub use self::value::{ByteSlice, Slice, Value};
pub use self::writer::Writer;

/// The wire format version this implementation reads and writes. The
/// leading byte of every document must equal it exactly.
pub const WIRE_VERSION: u8 = 3;

/// The serial name under which a document's own record type travels.
pub const META_SERIAL: &str = "__meta__";
