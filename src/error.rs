use std::fmt;
use std::io;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type for all annpack operations.
#[derive(Debug)]
pub enum Error {
    /// Static schema construction or validation failed. Raised once at
    /// schema-build time, never during streaming.
    Schema(SchemaError),
    /// Wire-level failure on read. Aborts the current document; the stream
    /// has no resynchronization point and is unusable afterwards.
    Format(FormatError),
    /// Failure while serializing a document.
    Encode(EncodeError),
    /// I/O failure on the underlying stream.
    Io(io::Error),
    /// A record that already belongs to a store was appended to a store.
    AlreadyStored { index: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Schema(err) => write!(f, "schema error: {}", err),
            Error::Format(err) => write!(f, "format error: {}", err),
            Error::Encode(err) => write!(f, "encode error: {}", err),
            Error::Io(err) => write!(f, "io error: {}", err),
            Error::AlreadyStored { index } => write!(
                f,
                "cannot insert a record into a store which is already in a store (index={})",
                index
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Schema(err) => Some(err),
            Error::Format(err) => Some(err),
            Error::Encode(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::AlreadyStored { .. } => None,
        }
    }
}

impl From<SchemaError> for Error {
    fn from(e: SchemaError) -> Self {
        Error::Schema(e)
    }
}

impl From<FormatError> for Error {
    fn from(e: FormatError) -> Self {
        Error::Format(e)
    }
}

impl From<EncodeError> for Error {
    fn from(e: EncodeError) -> Self {
        Error::Encode(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Static schema validation failure.
#[derive(Debug, PartialEq, Eq)]
pub enum SchemaError {
    /// Two types, stores, or fields were registered under the same name.
    DuplicateName { kind: &'static str, name: String },
    /// A field carries no kind tag at all.
    MissingKind { ty: String, field: String },
    /// A field carries more than one kind tag (e.g. both a primitive type
    /// and a pointer target).
    ConflictingKinds { ty: String, field: String },
    /// A field is tagged as both a slice and a collection.
    ShapeConflict { ty: String, field: String },
    /// A slice or collection tag was placed on a non-pointer field.
    ShapeWithoutPointer { ty: String, field: String },
    /// A pointer field names a store that is not declared on the document.
    UnknownTargetStore {
        ty: String,
        field: String,
        store: String,
    },
    /// A store names a stored type that is not a registered record type.
    UnknownStoredType { store: String, ty: String },
    /// A document-level field was declared as a self-pointer.
    SelfPointerOnDoc { field: String },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SchemaError::DuplicateName { kind, name } => {
                write!(f, "{} '{}' is declared more than once", kind, name)
            }
            SchemaError::MissingKind { ty, field } => {
                write!(f, "field '{}' of '{}' has no field kind", field, ty)
            }
            SchemaError::ConflictingKinds { ty, field } => write!(
                f,
                "field '{}' of '{}' cannot have more than one field kind",
                field, ty
            ),
            SchemaError::ShapeConflict { ty, field } => write!(
                f,
                "field '{}' of '{}' cannot be both a slice and a collection",
                field, ty
            ),
            SchemaError::ShapeWithoutPointer { ty, field } => write!(
                f,
                "field '{}' of '{}' cannot be a slice or collection without being a pointer",
                field, ty
            ),
            SchemaError::UnknownTargetStore { ty, field, store } => write!(
                f,
                "store name '{}' on field '{}' of '{}' is unknown",
                store, field, ty
            ),
            SchemaError::UnknownStoredType { store, ty } => write!(
                f,
                "the stored type '{}' in store '{}' is not a registered record type",
                ty, store
            ),
            SchemaError::SelfPointerOnDoc { field } => write!(
                f,
                "document field '{}' cannot be a self-pointer; the document is not in a store",
                field
            ),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Wire-level failure while reading a stream.
#[derive(Debug)]
pub enum FormatError {
    /// The leading version byte was not the supported wire version.
    BadVersion { found: u8 },
    /// A `<klass>` pair or `<store>` triple had the wrong element count.
    TupleSize { expected: usize, found: usize },
    /// A `<field>` map used a key outside the defined tag set.
    UnknownFieldKey { key: u64 },
    /// A `<field>` map did not contain a NAME entry.
    MissingFieldName { index: usize },
    /// The stream did not declare a `__meta__` class.
    MissingMetaClass,
    /// The stream and the static schema disagree on one of a field's
    /// pointer/self-pointer/slice/collection flags.
    FlagMismatch {
        klass: String,
        field: String,
        flag: &'static str,
        stream: bool,
        declared: bool,
    },
    /// A store declared a class id past the end of the class table.
    ClassIdRange { id: u64, nklasses: usize },
    /// A pointer field declared a store id past the end of the store table.
    StoreIdRange { id: usize, nstores: usize },
    /// A POINTER_TO entry carried the reserved value zero.
    ReservedStoreId { klass: String, field: String },
    /// A known store's stream class does not match its declared stored type.
    StoreTypeMismatch {
        store: String,
        declared: String,
        stream: String,
    },
    /// A pointer field's declared target type does not match the stored
    /// type of the store it points into on the stream.
    PointerTypeMismatch {
        field: String,
        pointed_to: String,
        stored: String,
    },
    /// A pointer value occurred in a field that points into a lazy store.
    PointerIntoLazyStore { field: String },
    /// An `<instance>` map used a field id past the end of the field table.
    FieldIdRange { id: u64, nfields: usize },
    /// A pointer index referenced past the end of its target store.
    PointerIndexRange { index: u64, nelem: usize },
    /// A slice covered zero elements.
    EmptySlice,
    /// A length-prefixed buffer held more data than its contents consumed.
    TrailingBytes { count: usize },
    /// An instance group's element count disagreed with its store header.
    GroupSizeMismatch { store: String, header: usize, group: usize },
    /// A reserved or structurally invalid marker byte was read.
    BadMarker { byte: u8 },
    /// A value of one wire type appeared where another was required.
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
    /// An integer value did not fit the field's declared width.
    IntOutOfRange { ty: &'static str },
    /// A string was not valid UTF-8.
    BadUtf8,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FormatError::BadVersion { found } => {
                if found.is_ascii_graphic() || *found == b' ' {
                    write!(
                        f,
                        "invalid wire format version: stream begins with byte 0x{:02x} \
                         (ascii '{}'); the input may be plain text",
                        found, *found as char
                    )
                } else {
                    write!(
                        f,
                        "invalid wire format version: stream has version {} but only \
                         version {} can be read",
                        found,
                        crate::WIRE_VERSION
                    )
                }
            }
            FormatError::TupleSize { expected, found } => write!(
                f,
                "invalid sized tuple read in: expected {} elements but found {}",
                expected, found
            ),
            FormatError::UnknownFieldKey { key } => {
                write!(f, "unknown value {} as key in <field> map", key)
            }
            FormatError::MissingFieldName { index } => {
                write!(f, "field number {} did not contain a NAME key", index + 1)
            }
            FormatError::MissingMetaClass => f.write_str("did not read in a __meta__ class"),
            FormatError::FlagMismatch {
                klass,
                field,
                flag,
                stream,
                declared,
            } => write!(
                f,
                "field '{}' of class '{}' has {} as {} on the stream, but {} on the \
                 class's field",
                field, klass, flag, stream, declared
            ),
            FormatError::ClassIdRange { id, nklasses } => {
                write!(f, "klass id value {} >= number of klasses ({})", id, nklasses)
            }
            FormatError::StoreIdRange { id, nstores } => {
                write!(f, "store id value {} >= number of stores ({})", id, nstores)
            }
            FormatError::ReservedStoreId { klass, field } => write!(
                f,
                "field '{}' of class '{}' carries the reserved POINTER_TO value 0",
                field, klass
            ),
            FormatError::StoreTypeMismatch {
                store,
                declared,
                stream,
            } => write!(
                f,
                "store '{}' points to {} but the stream says it points to {}",
                store, declared, stream
            ),
            FormatError::PointerTypeMismatch {
                field,
                pointed_to,
                stored,
            } => write!(
                f,
                "field '{}' points to {} but the containing store stores {}",
                field, pointed_to, stored
            ),
            FormatError::PointerIntoLazyStore { field } => {
                write!(f, "pointer field '{}' cannot point into a lazy store", field)
            }
            FormatError::FieldIdRange { id, nfields } => {
                write!(f, "field id value {} >= number of fields ({})", id, nfields)
            }
            FormatError::PointerIndexRange { index, nelem } => write!(
                f,
                "pointer index {} >= number of elements in the target store ({})",
                index, nelem
            ),
            FormatError::EmptySlice => f.write_str("slice covers zero elements"),
            FormatError::TrailingBytes { count } => write!(
                f,
                "{} unconsumed bytes at the end of a length-prefixed buffer",
                count
            ),
            FormatError::GroupSizeMismatch {
                store,
                header,
                group,
            } => write!(
                f,
                "store '{}' declared {} elements but its instance group holds {}",
                store, header, group
            ),
            FormatError::BadMarker { byte } => {
                write!(f, "invalid marker byte 0x{:02x}", byte)
            }
            FormatError::UnexpectedType { expected, found } => {
                write!(f, "expected {} but found {}", expected, found)
            }
            FormatError::IntOutOfRange { ty } => {
                write!(f, "integer value does not fit in {}", ty)
            }
            FormatError::BadUtf8 => f.write_str("string is not valid utf-8"),
        }
    }
}

impl std::error::Error for FormatError {}

/// Failure while serializing a document.
#[derive(Debug)]
pub enum EncodeError {
    /// A field value's type does not match the field's declared kind.
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    /// A materialized record type is unknown to the writer's schema.
    UnknownClass { name: String },
    /// A materialized store is unknown to the writer's schema, or a
    /// pointer field targets a store the writer will not emit.
    UnknownStore { name: String },
    /// A store matched by name across two schemas holds records of a
    /// different type than the writer's schema declares for it.
    StoreTypeMismatch {
        store: String,
        stored: String,
        held: String,
    },
    /// A pointer value references past the end of its target store.
    PointerIndexRange {
        field: String,
        index: usize,
        nelem: usize,
    },
    /// A slice value's endpoints are reversed.
    ReversedSlice { field: String },
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncodeError::TypeMismatch {
                field,
                expected,
                found,
            } => write!(
                f,
                "field '{}' declares {} but holds a {} value",
                field, expected, found
            ),
            EncodeError::UnknownClass { name } => write!(
                f,
                "record type '{}' holds materialized data but is unknown to the \
                 writer's schema",
                name
            ),
            EncodeError::UnknownStore { name } => write!(
                f,
                "store '{}' holds materialized data but is unknown to the writer's \
                 schema",
                name
            ),
            EncodeError::StoreTypeMismatch {
                store,
                stored,
                held,
            } => write!(
                f,
                "store '{}' is declared to store {} but the document holds {}",
                store, stored, held
            ),
            EncodeError::PointerIndexRange {
                field,
                index,
                nelem,
            } => write!(
                f,
                "field '{}' points at index {} but the target store holds {} records",
                field, index, nelem
            ),
            EncodeError::ReversedSlice { field } => {
                write!(f, "field '{}' holds a slice whose end precedes its start", field)
            }
        }
    }
}

impl std::error::Error for EncodeError {}
