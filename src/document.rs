//! The in-memory document graph: a document, its stores, and their
//! records.
//!
//! Stores are append-only. A record's index is assigned exactly once, when
//! it enters a store, and is its identity for pointer fields; indices are
//! dense and stable for the life of the document. Records and the document
//! itself carry a lazy slab: the still-encoded bytes of any fields the
//! reading schema did not know, keyed by stream field id, re-emitted
//! verbatim on write.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::schema::{AnnSchema, DocSchema};
use crate::value::Value;

/// Still-encoded field data carried through a round trip untouched.
#[derive(Clone, Debug)]
pub(crate) struct LazySlab {
    pub(crate) bytes: Vec<u8>,
    pub(crate) nelem: usize,
}

/// Field and lazy-slab access shared by records and documents.
pub(crate) trait Record {
    fn field_slot(&self, index: usize) -> Option<&Value>;
    fn set_field(&mut self, index: usize, value: Value);
    fn lazy_slab(&self) -> Option<&LazySlab>;
    fn set_lazy_slab(&mut self, slab: LazySlab);
}

/// One record. Its field storage is position-aligned with the fields of
/// its [`AnnSchema`].
#[derive(Clone, Debug)]
pub struct Ann {
    index: Option<usize>,
    fields: Vec<Option<Value>>,
    lazy: Option<LazySlab>,
}

impl Ann {
    /// A fresh record of the given type, all fields unset, in no store.
    pub fn new(schema: &AnnSchema) -> Self {
        Ann {
            index: None,
            fields: vec![None; schema.fields().len()],
            lazy: None,
        }
    }

    /// The record's index within its store, if it has been added to one.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    /// Field value by position on the record's schema.
    pub fn get(&self, field: usize) -> Option<&Value> {
        self.fields.get(field).and_then(|v| v.as_ref())
    }

    /// Set a field value. Panics if `field` is out of range for the
    /// record's schema.
    pub fn set(&mut self, field: usize, value: impl Into<Value>) {
        self.fields[field] = Some(value.into());
    }

    /// Unset a field value.
    pub fn clear(&mut self, field: usize) {
        self.fields[field] = None;
    }

    /// The record's still-encoded unknown-field bytes, if any.
    pub fn lazy_bytes(&self) -> Option<&[u8]> {
        self.lazy.as_ref().map(|l| l.bytes.as_slice())
    }

    /// Number of fields held in the lazy slab.
    pub fn lazy_count(&self) -> usize {
        self.lazy.as_ref().map_or(0, |l| l.nelem)
    }
}

impl Record for Ann {
    fn field_slot(&self, index: usize) -> Option<&Value> {
        self.get(index)
    }

    fn set_field(&mut self, index: usize, value: Value) {
        self.fields[index] = Some(value);
    }

    fn lazy_slab(&self) -> Option<&LazySlab> {
        self.lazy.as_ref()
    }

    fn set_lazy_slab(&mut self, slab: LazySlab) {
        self.lazy = Some(slab);
    }
}

/// An ordered, append-only collection of records of one declared type.
#[derive(Clone, Debug, Default)]
pub struct Store {
    items: Vec<Ann>,
}

impl Store {
    pub(crate) fn new() -> Self {
        Store { items: Vec::new() }
    }

    /// Append a record, assigning its index. Fails if the record already
    /// belongs to a store.
    pub fn push(&mut self, mut ann: Ann) -> Result<usize> {
        if let Some(index) = ann.index {
            return Err(Error::AlreadyStored { index });
        }
        let index = self.items.len();
        ann.index = Some(index);
        self.items.push(ann);
        Ok(index)
    }

    /// Bulk-construct `n` fresh records of the given type into the store.
    pub fn create(&mut self, schema: &AnnSchema, n: usize) {
        self.items.reserve(n);
        for _ in 0..n {
            let mut ann = Ann::new(schema);
            ann.index = Some(self.items.len());
            self.items.push(ann);
        }
    }

    /// Remove every record, unassigning their indices.
    pub fn clear(&mut self) {
        for ann in &mut self.items {
            ann.index = None;
        }
        self.items.clear();
    }

    pub fn get(&self, index: usize) -> Option<&Ann> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Ann> {
        self.items.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Ann> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Ann> {
        self.items.iter_mut()
    }
}

impl<'a> IntoIterator for &'a Store {
    type Item = &'a Ann;
    type IntoIter = std::slice::Iter<'a, Ann>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// One document: its own fields plus one [`Store`] per store declared on
/// its schema, position-aligned with [`DocSchema::stores`].
#[derive(Clone, Debug)]
pub struct Doc {
    fields: Vec<Option<Value>>,
    lazy: Option<LazySlab>,
    stores: Vec<Store>,
    runtime: Option<Runtime>,
}

impl Doc {
    /// A fresh document with empty stores and no runtime schema.
    pub fn new(schema: &DocSchema) -> Self {
        Doc {
            fields: vec![None; schema.doc_fields().len()],
            lazy: None,
            stores: (0..schema.stores().len()).map(|_| Store::new()).collect(),
            runtime: None,
        }
    }

    /// Document field value by position on the document schema.
    pub fn get(&self, field: usize) -> Option<&Value> {
        self.fields.get(field).and_then(|v| v.as_ref())
    }

    /// Set a document field. Panics if `field` is out of range.
    pub fn set(&mut self, field: usize, value: impl Into<Value>) {
        self.fields[field] = Some(value.into());
    }

    /// Unset a document field.
    pub fn clear(&mut self, field: usize) {
        self.fields[field] = None;
    }

    /// Store by position on the document schema.
    pub fn store(&self, index: usize) -> &Store {
        &self.stores[index]
    }

    pub fn store_mut(&mut self, index: usize) -> &mut Store {
        &mut self.stores[index]
    }

    pub fn stores(&self) -> &[Store] {
        &self.stores
    }

    pub fn lazy_bytes(&self) -> Option<&[u8]> {
        self.lazy.as_ref().map(|l| l.bytes.as_slice())
    }

    pub fn lazy_count(&self) -> usize {
        self.lazy.as_ref().map_or(0, |l| l.nelem)
    }

    /// The runtime schema this document was read under, if it came from a
    /// stream.
    pub fn runtime(&self) -> Option<&Runtime> {
        self.runtime.as_ref()
    }

    pub(crate) fn set_runtime(&mut self, runtime: Runtime) {
        self.runtime = Some(runtime);
    }
}

impl Record for Doc {
    fn field_slot(&self, index: usize) -> Option<&Value> {
        self.get(index)
    }

    fn set_field(&mut self, index: usize, value: Value) {
        self.fields[index] = Some(value);
    }

    fn lazy_slab(&self) -> Option<&LazySlab> {
        self.lazy.as_ref()
    }

    fn set_lazy_slab(&mut self, slab: LazySlab) {
        self.lazy = Some(slab);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::schema::{AnnDef, DocSchema, FieldDef, FieldType, StoreDef};

    fn schema() -> DocSchema {
        DocSchema::builder("Doc")
            .ann(AnnDef::new("A").field(FieldDef::primitive("v", FieldType::U32)))
            .store(StoreDef::new("as", "A"))
            .build()
            .unwrap()
    }

    #[test]
    fn push_assigns_dense_indices() {
        let schema = schema();
        let mut doc = Doc::new(&schema);
        let store = doc.store_mut(0);
        for i in 0..4 {
            let idx = store.push(Ann::new(&schema.types()[0])).unwrap();
            assert_eq!(idx, i);
            assert_eq!(store.get(i).unwrap().index(), Some(i));
        }
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn push_rejects_stored_record() {
        let schema = schema();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 1);
        let stored = doc.store(0).get(0).unwrap().clone();
        let err = doc.store_mut(0).push(stored).unwrap_err();
        assert!(matches!(err, Error::AlreadyStored { index: 0 }));
    }

    #[test]
    fn bulk_create_and_clear() {
        let schema = schema();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 10);
        assert_eq!(doc.store(0).len(), 10);
        assert_eq!(doc.store(0).get(9).unwrap().index(), Some(9));
        doc.store_mut(0).clear();
        assert!(doc.store(0).is_empty());
        // Indices restart at zero after a clear.
        doc.store_mut(0).create(&schema.types()[0], 1);
        assert_eq!(doc.store(0).get(0).unwrap().index(), Some(0));
    }

    #[test]
    fn field_set_get_clear() {
        let schema = schema();
        let mut ann = Ann::new(&schema.types()[0]);
        assert!(ann.get(0).is_none());
        ann.set(0, Value::U32(7));
        assert_eq!(ann.get(0), Some(&Value::U32(7)));
        ann.clear(0);
        assert!(ann.get(0).is_none());
        assert_eq!(ann.lazy_count(), 0);
        assert!(ann.lazy_bytes().is_none());
    }
}
