//! Static schema model: the contract a program declares for its record
//! types, fields, and stores.
//!
//! Schemas are built once at startup through [`DocSchema::builder`],
//! validated eagerly, and immutable afterwards — with the single exception
//! of serial names, which may be reassigned before use so one declared
//! schema can read data written under different wire names.

use crate::error::SchemaError;

/// How a field or store behaves across a read/write round trip.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldMode {
    /// Decode onto the record, encode from the record.
    #[default]
    ReadWrite,
    /// Decode onto the record, but keep the original encoded bytes and
    /// write those back out instead of re-encoding the value.
    ReadOnly,
    /// Never re-emitted during serialization.
    Delete,
}

/// The closed set of primitive scalar types a field may declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        use self::FieldType::*;
        match self {
            Str => "str",
            Bool => "bool",
            U8 => "u8",
            U16 => "u16",
            U32 => "u32",
            U64 => "u64",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            F32 => "f32",
            F64 => "f64",
        }
    }
}

/// A field's resolved kind. Pointer variants hold the index of their
/// target store on the document schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Primitive(FieldType),
    ByteSlice,
    Pointer { store: usize },
    PointerCollection { store: usize },
    PointerSlice { store: usize },
    SelfPointer,
    SelfPointerCollection,
    SelfPointerSlice,
}

impl FieldKind {
    /// Whether this field references a named store (self-pointers do not).
    pub fn is_pointer(&self) -> bool {
        matches!(
            self,
            FieldKind::Pointer { .. }
                | FieldKind::PointerCollection { .. }
                | FieldKind::PointerSlice { .. }
        )
    }

    pub fn is_self_pointer(&self) -> bool {
        matches!(
            self,
            FieldKind::SelfPointer
                | FieldKind::SelfPointerCollection
                | FieldKind::SelfPointerSlice
        )
    }

    pub fn is_slice(&self) -> bool {
        matches!(
            self,
            FieldKind::ByteSlice | FieldKind::PointerSlice { .. } | FieldKind::SelfPointerSlice
        )
    }

    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            FieldKind::PointerCollection { .. } | FieldKind::SelfPointerCollection
        )
    }

    /// Target store index for non-self pointer kinds.
    pub fn target_store(&self) -> Option<usize> {
        match self {
            FieldKind::Pointer { store }
            | FieldKind::PointerCollection { store }
            | FieldKind::PointerSlice { store } => Some(*store),
            _ => None,
        }
    }
}

/// One declared field on a record type or on the document itself.
#[derive(Clone, Debug)]
pub struct FieldSchema {
    name: String,
    serial: String,
    mode: FieldMode,
    kind: FieldKind,
}

impl FieldSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name used on the wire.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn set_serial(&mut self, serial: impl Into<String>) {
        self.serial = serial.into();
    }

    pub fn mode(&self) -> FieldMode {
        self.mode
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }
}

/// One declared record type: its names and its ordered fields.
#[derive(Clone, Debug)]
pub struct AnnSchema {
    name: String,
    serial: String,
    fields: Vec<FieldSchema>,
}

impl AnnSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn set_serial(&mut self, serial: impl Into<String>) {
        self.serial = serial.into();
    }

    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut FieldSchema> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_index_by_serial(&self, serial: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.serial == serial)
    }
}

/// One declared store: an ordered collection of records of one type.
#[derive(Clone, Debug)]
pub struct StoreSchema {
    name: String,
    serial: String,
    mode: FieldMode,
    stored: usize,
}

impl StoreSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn set_serial(&mut self, serial: impl Into<String>) {
        self.serial = serial.into();
    }

    pub fn mode(&self) -> FieldMode {
        self.mode
    }

    /// Index of the stored record type on the document schema.
    pub fn stored(&self) -> usize {
        self.stored
    }
}

/// A document type's full static schema: its own fields, its registered
/// record types, and its stores.
#[derive(Clone, Debug)]
pub struct DocSchema {
    name: String,
    fields: Vec<FieldSchema>,
    types: Vec<AnnSchema>,
    stores: Vec<StoreSchema>,
}

impl DocSchema {
    pub fn builder(name: impl Into<String>) -> DocSchemaBuilder {
        DocSchemaBuilder {
            name: name.into(),
            fields: Vec::new(),
            types: Vec::new(),
            stores: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The document's own fields.
    pub fn doc_fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    pub fn types(&self) -> &[AnnSchema] {
        &self.types
    }

    pub fn stores(&self) -> &[StoreSchema] {
        &self.stores
    }

    pub fn type_index(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|t| t.name == name)
    }

    pub fn type_index_by_serial(&self, serial: &str) -> Option<usize> {
        self.types.iter().position(|t| t.serial == serial)
    }

    pub fn store_index(&self, name: &str) -> Option<usize> {
        self.stores.iter().position(|s| s.name == name)
    }

    pub fn store_index_by_serial(&self, serial: &str) -> Option<usize> {
        self.stores.iter().position(|s| s.serial == serial)
    }

    pub fn doc_field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn doc_field_index_by_serial(&self, serial: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.serial == serial)
    }

    /// Record type by declared name, for pre-use serial remapping.
    pub fn type_mut(&mut self, name: &str) -> Option<&mut AnnSchema> {
        self.types.iter_mut().find(|t| t.name == name)
    }

    /// Store by declared name, for pre-use serial remapping.
    pub fn store_mut(&mut self, name: &str) -> Option<&mut StoreSchema> {
        self.stores.iter_mut().find(|s| s.name == name)
    }

    /// Document field by declared name, for pre-use serial remapping.
    pub fn doc_field_mut(&mut self, name: &str) -> Option<&mut FieldSchema> {
        self.fields.iter_mut().find(|f| f.name == name)
    }
}

/// Declaration of one field, before validation.
#[derive(Clone, Debug)]
pub struct FieldDef {
    name: String,
    serial: Option<String>,
    mode: FieldMode,
    ty: Option<FieldType>,
    byte_slice: bool,
    pointer_store: Option<String>,
    self_pointer: bool,
    slice: bool,
    collection: bool,
}

impl FieldDef {
    /// A bare declaration with no kind tag. Tags are added with the
    /// chainable setters; carrying conflicting tags is rejected when the
    /// schema is built.
    pub fn new(name: impl Into<String>) -> Self {
        FieldDef {
            name: name.into(),
            serial: None,
            mode: FieldMode::default(),
            ty: None,
            byte_slice: false,
            pointer_store: None,
            self_pointer: false,
            slice: false,
            collection: false,
        }
    }

    pub fn primitive(name: impl Into<String>, ty: FieldType) -> Self {
        Self::new(name).ty(ty)
    }

    pub fn byte_slice(name: impl Into<String>) -> Self {
        let mut def = Self::new(name);
        def.byte_slice = true;
        def
    }

    pub fn pointer(name: impl Into<String>, store: impl Into<String>) -> Self {
        Self::new(name).pointer_to(store)
    }

    pub fn pointer_collection(name: impl Into<String>, store: impl Into<String>) -> Self {
        Self::new(name).pointer_to(store).collection()
    }

    pub fn pointer_slice(name: impl Into<String>, store: impl Into<String>) -> Self {
        Self::new(name).pointer_to(store).slice()
    }

    pub fn self_pointer(name: impl Into<String>) -> Self {
        Self::new(name).self_pointer_tag()
    }

    pub fn self_pointer_collection(name: impl Into<String>) -> Self {
        Self::new(name).self_pointer_tag().collection()
    }

    pub fn self_pointer_slice(name: impl Into<String>) -> Self {
        Self::new(name).self_pointer_tag().slice()
    }

    pub fn ty(mut self, ty: FieldType) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn pointer_to(mut self, store: impl Into<String>) -> Self {
        self.pointer_store = Some(store.into());
        self
    }

    pub fn self_pointer_tag(mut self) -> Self {
        self.self_pointer = true;
        self
    }

    pub fn slice(mut self) -> Self {
        self.slice = true;
        self
    }

    pub fn collection(mut self) -> Self {
        self.collection = true;
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }

    fn resolve(
        self,
        ty_name: &str,
        stores: &[StoreDef],
        on_doc: bool,
    ) -> Result<FieldSchema, SchemaError> {
        let err_ctx = || (ty_name.to_owned(), self.name.clone());

        let primitive_tag = self.ty.is_some() || self.byte_slice;
        let pointer_tag = self.pointer_store.is_some();
        let ntags = primitive_tag as usize + pointer_tag as usize + self.self_pointer as usize;
        if ntags == 0 {
            let (ty, field) = err_ctx();
            return Err(SchemaError::MissingKind { ty, field });
        }
        if ntags > 1 || (self.ty.is_some() && self.byte_slice) {
            let (ty, field) = err_ctx();
            return Err(SchemaError::ConflictingKinds { ty, field });
        }
        if self.slice && self.collection {
            let (ty, field) = err_ctx();
            return Err(SchemaError::ShapeConflict { ty, field });
        }
        if (self.slice || self.collection) && primitive_tag {
            let (ty, field) = err_ctx();
            return Err(SchemaError::ShapeWithoutPointer { ty, field });
        }
        if on_doc && self.self_pointer {
            return Err(SchemaError::SelfPointerOnDoc {
                field: self.name,
            });
        }

        let kind = if let Some(ty) = self.ty {
            FieldKind::Primitive(ty)
        } else if self.byte_slice {
            FieldKind::ByteSlice
        } else if let Some(store_name) = &self.pointer_store {
            let store = stores
                .iter()
                .position(|s| &s.name == store_name)
                .ok_or_else(|| {
                    let (ty, field) = err_ctx();
                    SchemaError::UnknownTargetStore {
                        ty,
                        field,
                        store: store_name.clone(),
                    }
                })?;
            if self.slice {
                FieldKind::PointerSlice { store }
            } else if self.collection {
                FieldKind::PointerCollection { store }
            } else {
                FieldKind::Pointer { store }
            }
        } else if self.slice {
            FieldKind::SelfPointerSlice
        } else if self.collection {
            FieldKind::SelfPointerCollection
        } else {
            FieldKind::SelfPointer
        };

        let serial = self.serial.unwrap_or_else(|| self.name.clone());
        Ok(FieldSchema {
            name: self.name,
            serial,
            mode: self.mode,
            kind,
        })
    }
}

/// Declaration of one record type.
#[derive(Clone, Debug)]
pub struct AnnDef {
    name: String,
    serial: Option<String>,
    fields: Vec<FieldDef>,
}

impl AnnDef {
    pub fn new(name: impl Into<String>) -> Self {
        AnnDef {
            name: name.into(),
            serial: None,
            fields: Vec::new(),
        }
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }
}

/// Declaration of one store.
#[derive(Clone, Debug)]
pub struct StoreDef {
    name: String,
    serial: Option<String>,
    stored: String,
    mode: FieldMode,
}

impl StoreDef {
    pub fn new(name: impl Into<String>, stored: impl Into<String>) -> Self {
        StoreDef {
            name: name.into(),
            serial: None,
            stored: stored.into(),
            mode: FieldMode::default(),
        }
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn mode(mut self, mode: FieldMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Builds a validated [`DocSchema`] from explicit declarations.
pub struct DocSchemaBuilder {
    name: String,
    fields: Vec<FieldDef>,
    types: Vec<AnnDef>,
    stores: Vec<StoreDef>,
}

impl DocSchemaBuilder {
    /// Add a field on the document itself.
    pub fn doc_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Register a record type.
    pub fn ann(mut self, ann: AnnDef) -> Self {
        self.types.push(ann);
        self
    }

    /// Declare a store.
    pub fn store(mut self, store: StoreDef) -> Self {
        self.stores.push(store);
        self
    }

    /// Validate every declaration and produce the immutable schema.
    pub fn build(self) -> Result<DocSchema, SchemaError> {
        for (i, ty) in self.types.iter().enumerate() {
            if self.types[..i].iter().any(|t| t.name == ty.name) {
                return Err(SchemaError::DuplicateName {
                    kind: "record type",
                    name: ty.name.clone(),
                });
            }
        }
        for (i, store) in self.stores.iter().enumerate() {
            if self.stores[..i].iter().any(|s| s.name == store.name) {
                return Err(SchemaError::DuplicateName {
                    kind: "store",
                    name: store.name.clone(),
                });
            }
        }

        let mut stores = Vec::with_capacity(self.stores.len());
        for store in &self.stores {
            let stored = self
                .types
                .iter()
                .position(|t| t.name == store.stored)
                .ok_or_else(|| SchemaError::UnknownStoredType {
                    store: store.name.clone(),
                    ty: store.stored.clone(),
                })?;
            stores.push(StoreSchema {
                name: store.name.clone(),
                serial: store.serial.clone().unwrap_or_else(|| store.name.clone()),
                mode: store.mode,
                stored,
            });
        }

        let mut fields = Vec::with_capacity(self.fields.len());
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(SchemaError::DuplicateName {
                    kind: "document field",
                    name: field.name.clone(),
                });
            }
            fields.push(field.clone().resolve(&self.name, &self.stores, true)?);
        }

        let mut types = Vec::with_capacity(self.types.len());
        for ty in &self.types {
            let mut ty_fields = Vec::with_capacity(ty.fields.len());
            for (i, field) in ty.fields.iter().enumerate() {
                if ty.fields[..i].iter().any(|f| f.name == field.name) {
                    return Err(SchemaError::DuplicateName {
                        kind: "field",
                        name: field.name.clone(),
                    });
                }
                ty_fields.push(field.clone().resolve(&ty.name, &self.stores, false)?);
            }
            types.push(AnnSchema {
                name: ty.name.clone(),
                serial: ty.serial.clone().unwrap_or_else(|| ty.name.clone()),
                fields: ty_fields,
            });
        }

        Ok(DocSchema {
            name: self.name,
            fields,
            types,
            stores,
        })
    }
}
