//! Runtime schema reconciliation.
//!
//! Every stream carries its own layout: class, field, and store tables
//! with stream-assigned ids. A runtime schema maps that layout onto a
//! static [`DocSchema`], deciding per class, field, and store whether data
//! is materialized onto the document graph or preserved lazily as raw
//! bytes. Cross-references are plain indices into flat arenas, keyed by
//! the stream's own ids.
//!
//! Readers build a runtime schema while parsing a stream header. Writers
//! either build one fresh from the static schema, or merge a document's
//! origin runtime schema with the static schema they were given: stream
//! ids and ordering are preserved exactly (lazy slabs reference them),
//! lazy entries stay lazy, known entries relink by declared name, and
//! entries new to the writer's schema are appended after the stream's.

use log::debug;

use crate::document::Doc;
use crate::error::{EncodeError, Error, FormatError, Result};
use crate::schema::{DocSchema, FieldKind, FieldMode, FieldSchema, FieldType};
use crate::META_SERIAL;

/// Link from a runtime class to the static schema: the document type
/// itself, or a registered record type by position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClassDef {
    Doc,
    Type(usize),
}

#[derive(Clone, Debug)]
pub(crate) struct RtFieldSchema {
    pub(crate) field_id: usize,
    /// The name this field carries on the wire.
    pub(crate) serial: String,
    pub(crate) is_pointer: bool,
    pub(crate) is_self_pointer: bool,
    pub(crate) is_slice: bool,
    pub(crate) is_collection: bool,
    /// Resolved target store, as a runtime store id.
    pub(crate) store_id: Option<usize>,
    /// Position of this field's value on the record, aligned with the
    /// schema the record was built under. `None` means the field has no
    /// materialized backing: its data lives only in lazy slabs.
    pub(crate) slot: Option<usize>,
    pub(crate) mode: FieldMode,
    pub(crate) prim: Option<FieldType>,
    /// Whether this field's bytes ride the record's lazy slab when one is
    /// present (read-only fields captured at read time). Such fields are
    /// never re-encoded alongside the slab.
    pub(crate) in_slab: bool,
}

impl RtFieldSchema {
    pub(crate) fn is_lazy(&self) -> bool {
        self.slot.is_none()
    }

    pub(crate) fn is_byte_slice(&self) -> bool {
        self.is_slice && !self.is_pointer && !self.is_self_pointer
    }

    fn from_static(
        field_id: usize,
        f: &FieldSchema,
        slot: usize,
        store_id: Option<usize>,
    ) -> Self {
        let kind = f.kind();
        RtFieldSchema {
            field_id,
            serial: f.serial().to_owned(),
            is_pointer: kind.is_pointer(),
            is_self_pointer: kind.is_self_pointer(),
            is_slice: kind.is_slice(),
            is_collection: kind.is_collection(),
            store_id,
            slot: Some(slot),
            mode: f.mode(),
            prim: match kind {
                FieldKind::Primitive(t) => Some(t),
                _ => None,
            },
            in_slab: false,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RtClassSchema {
    pub(crate) class_id: usize,
    /// The name this class carries on the wire.
    pub(crate) serial: String,
    pub(crate) def: Option<ClassDef>,
    pub(crate) fields: Vec<RtFieldSchema>,
}

impl RtClassSchema {
    pub(crate) fn is_lazy(&self) -> bool {
        self.def.is_none()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RtStoreSchema {
    pub(crate) store_id: usize,
    /// The name this store carries on the wire.
    pub(crate) serial: String,
    pub(crate) class_id: usize,
    /// Element count from the stream header; live stores recompute it on
    /// write, verbatim stores re-emit it.
    pub(crate) nelem: usize,
    /// Position of the backing [`crate::Store`] on the document, aligned
    /// with the schema the document was built under. `None` means no
    /// records are materialized for this store.
    pub(crate) slot: Option<usize>,
    pub(crate) mode: FieldMode,
    /// Captured raw instance-group bytes: always present for lazy stores
    /// once read, and for known read-only stores.
    pub(crate) lazy: Option<Vec<u8>>,
}

impl RtStoreSchema {
    pub(crate) fn is_lazy(&self) -> bool {
        self.slot.is_none()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RtSchema {
    pub(crate) classes: Vec<RtClassSchema>,
    pub(crate) stores: Vec<RtStoreSchema>,
    pub(crate) doc_class: usize,
}

/// The runtime schema a document was produced under, retained on the
/// document so a later write can merge it with the writer's own schema.
#[derive(Clone, Debug)]
pub struct Runtime {
    pub(crate) schema: DocSchema,
    pub(crate) rt: RtSchema,
}

impl Runtime {
    /// The static schema the document was read with.
    pub fn schema(&self) -> &DocSchema {
        &self.schema
    }

    /// Number of classes the origin stream declared.
    pub fn nclasses(&self) -> usize {
        self.rt.classes.len()
    }

    /// Number of stores the origin stream declared.
    pub fn nstores(&self) -> usize {
        self.rt.stores.len()
    }
}

/// Builds a runtime schema from a stream header, reconciling each entry
/// against the static schema as the reader parses it.
pub(crate) struct Reconciler<'a> {
    schema: &'a DocSchema,
    classes: Vec<RtClassSchema>,
    stores: Vec<RtStoreSchema>,
    doc_class: Option<usize>,
    /// (class id, field id, raw store id) awaiting the store table.
    pending: Vec<(usize, usize, usize)>,
}

impl<'a> Reconciler<'a> {
    pub fn new(schema: &'a DocSchema) -> Self {
        Reconciler {
            schema,
            classes: Vec::new(),
            stores: Vec::new(),
            doc_class: None,
            pending: Vec::new(),
        }
    }

    fn static_fields(&self, def: ClassDef) -> &'a [FieldSchema] {
        match def {
            ClassDef::Doc => self.schema.doc_fields(),
            ClassDef::Type(i) => self.schema.types()[i].fields(),
        }
    }

    /// Register the next stream class, matching it against the static
    /// schema by serial name. `__meta__` matches the document type itself.
    pub fn begin_class(&mut self, serial: String) -> usize {
        let class_id = self.classes.len();
        let def = if serial == META_SERIAL {
            self.doc_class = Some(class_id);
            Some(ClassDef::Doc)
        } else {
            let def = self.schema.type_index_by_serial(&serial).map(ClassDef::Type);
            if def.is_none() {
                debug!(
                    "stream class '{}' is not in the schema; its instances stay lazy",
                    serial
                );
            }
            def
        };
        self.classes.push(RtClassSchema {
            class_id,
            serial,
            def,
            fields: Vec::new(),
        });
        class_id
    }

    /// Register the next field of a stream class. `pointer_to` is the raw
    /// POINTER_TO wire value (target store id + 1, 0 reserved).
    pub fn add_field(
        &mut self,
        class_id: usize,
        serial: String,
        pointer_to: Option<u64>,
        is_self_pointer: bool,
        is_slice: bool,
        is_collection: bool,
    ) -> Result<()> {
        let class = &self.classes[class_id];
        let field_id = class.fields.len();
        let is_pointer = pointer_to.is_some();

        let raw_store = match pointer_to {
            Some(0) => {
                return Err(FormatError::ReservedStoreId {
                    klass: class.serial.clone(),
                    field: serial,
                }
                .into())
            }
            Some(v) => Some((v - 1) as usize),
            None => None,
        };

        let mut slot = None;
        let mut mode = FieldMode::ReadWrite;
        let mut prim = None;
        if let Some(def) = class.def {
            if let Some(idx) = self
                .static_fields(def)
                .iter()
                .position(|f| f.serial() == serial)
            {
                let f = &self.static_fields(def)[idx];
                let kind = f.kind();
                let checks = [
                    ("IS_POINTER", is_pointer, kind.is_pointer()),
                    ("IS_SLICE", is_slice, kind.is_slice()),
                    ("IS_SELF_POINTER", is_self_pointer, kind.is_self_pointer()),
                    ("IS_COLLECTION", is_collection, kind.is_collection()),
                ];
                for (flag, stream, declared) in checks {
                    if stream != declared {
                        return Err(FormatError::FlagMismatch {
                            klass: class.serial.clone(),
                            field: serial,
                            flag,
                            stream,
                            declared,
                        }
                        .into());
                    }
                }
                slot = Some(idx);
                mode = f.mode();
                if let FieldKind::Primitive(t) = kind {
                    prim = Some(t);
                }
            }
        }

        if let Some(raw) = raw_store {
            self.pending.push((class_id, field_id, raw));
        }
        let in_slab = slot.is_some() && mode == FieldMode::ReadOnly;
        self.classes[class_id].fields.push(RtFieldSchema {
            field_id,
            serial,
            is_pointer,
            is_self_pointer,
            is_slice,
            is_collection,
            store_id: None,
            slot,
            mode,
            prim,
            in_slab,
        });
        Ok(())
    }

    /// Register the next stream store, matching it against the static
    /// schema by serial name and cross-validating its stored type.
    pub fn add_store(&mut self, serial: String, class_id: u64, nelem: u64) -> Result<()> {
        if class_id as usize >= self.classes.len() {
            return Err(FormatError::ClassIdRange {
                id: class_id,
                nklasses: self.classes.len(),
            }
            .into());
        }
        let class_id = class_id as usize;
        let store_id = self.stores.len();

        let slot = self.schema.store_index_by_serial(&serial);
        let mut mode = FieldMode::ReadWrite;
        if let Some(idx) = slot {
            let declared = self.schema.stores()[idx].stored();
            match self.classes[class_id].def {
                Some(ClassDef::Type(t)) if t == declared => {}
                _ => {
                    return Err(FormatError::StoreTypeMismatch {
                        store: serial,
                        declared: self.schema.types()[declared].name().to_owned(),
                        stream: self.classes[class_id].serial.clone(),
                    }
                    .into())
                }
            }
            mode = self.schema.stores()[idx].mode();
        } else {
            debug!(
                "stream store '{}' ({} elements) is not in the schema; its bytes will be \
                 preserved",
                serial, nelem
            );
        }

        self.stores.push(RtStoreSchema {
            store_id,
            serial,
            class_id,
            nelem: nelem as usize,
            slot,
            mode,
            lazy: None,
        });
        Ok(())
    }

    /// Back-fill pointer targets now that the store table is known, and
    /// check the stream declared a `__meta__` class.
    pub fn finish(mut self) -> Result<RtSchema> {
        let doc_class = self.doc_class.ok_or(FormatError::MissingMetaClass)?;

        for (class_id, field_id, raw_store) in std::mem::take(&mut self.pending) {
            if raw_store >= self.stores.len() {
                return Err(FormatError::StoreIdRange {
                    id: raw_store,
                    nstores: self.stores.len(),
                }
                .into());
            }

            // Non-lazy pointer fields must agree with the store they point
            // into about the stored type.
            let field = &self.classes[class_id].fields[field_id];
            if let (Some(def), Some(slot)) = (self.classes[class_id].def, field.slot) {
                let f = &self.static_fields(def)[slot];
                if let Some(target) = f.kind().target_store() {
                    let pointed_to = self.schema.stores()[target].stored();
                    if let Some(store_slot) = self.stores[raw_store].slot {
                        let stored = self.schema.stores()[store_slot].stored();
                        if pointed_to != stored {
                            return Err(FormatError::PointerTypeMismatch {
                                field: field.serial.clone(),
                                pointed_to: self.schema.types()[pointed_to].name().to_owned(),
                                stored: self.schema.types()[stored].name().to_owned(),
                            }
                            .into());
                        }
                    }
                }
            }

            self.classes[class_id].fields[field_id].store_id = Some(raw_store);
        }

        Ok(RtSchema {
            classes: self.classes,
            stores: self.stores,
            doc_class,
        })
    }
}

impl RtSchema {
    /// Runtime schema for one write call: built fresh for documents never
    /// read from a stream, merged with the document's origin runtime
    /// schema otherwise.
    pub(crate) fn for_write(doc: &Doc, schema: &DocSchema) -> Result<RtSchema, Error> {
        match doc.runtime() {
            None => Self::fresh(schema),
            Some(origin) => Self::merge(origin, schema),
        }
    }

    fn fresh(schema: &DocSchema) -> Result<RtSchema, Error> {
        // Stores first: fields need the static-index -> store-id map.
        let mut store_ids: Vec<Option<usize>> = vec![None; schema.stores().len()];
        let mut stores = Vec::new();
        for (i, s) in schema.stores().iter().enumerate() {
            if s.mode() == FieldMode::Delete {
                continue;
            }
            store_ids[i] = Some(stores.len());
            stores.push(RtStoreSchema {
                store_id: stores.len(),
                serial: s.serial().to_owned(),
                class_id: s.stored() + 1,
                nelem: 0,
                slot: Some(i),
                mode: s.mode(),
                lazy: None,
            });
        }

        let mut classes = Vec::with_capacity(schema.types().len() + 1);
        classes.push(Self::class_from_static(
            0,
            META_SERIAL.to_owned(),
            ClassDef::Doc,
            schema.doc_fields(),
            schema,
            &store_ids,
        )?);
        for (i, t) in schema.types().iter().enumerate() {
            classes.push(Self::class_from_static(
                i + 1,
                t.serial().to_owned(),
                ClassDef::Type(i),
                t.fields(),
                schema,
                &store_ids,
            )?);
        }

        Ok(RtSchema {
            classes,
            stores,
            doc_class: 0,
        })
    }

    fn class_from_static(
        class_id: usize,
        serial: String,
        def: ClassDef,
        fields: &[FieldSchema],
        schema: &DocSchema,
        store_ids: &[Option<usize>],
    ) -> Result<RtClassSchema, Error> {
        let mut rt_fields = Vec::new();
        for (slot, f) in fields.iter().enumerate() {
            if f.mode() == FieldMode::Delete {
                continue;
            }
            let store_id = Self::map_target(f, schema, store_ids)?;
            rt_fields.push(RtFieldSchema::from_static(rt_fields.len(), f, slot, store_id));
        }
        Ok(RtClassSchema {
            class_id,
            serial,
            def: Some(def),
            fields: rt_fields,
        })
    }

    fn map_target(
        f: &FieldSchema,
        schema: &DocSchema,
        store_ids: &[Option<usize>],
    ) -> Result<Option<usize>, Error> {
        match f.kind().target_store() {
            None => Ok(None),
            Some(target) => {
                let id = store_ids[target].ok_or_else(|| EncodeError::UnknownStore {
                    name: schema.stores()[target].name().to_owned(),
                })?;
                Ok(Some(id))
            }
        }
    }

    fn merge(origin: &Runtime, target: &DocSchema) -> Result<RtSchema, Error> {
        let os = &origin.schema;
        let ort = &origin.rt;

        // Relink each origin class to the target schema by declared name.
        let mut class_defs: Vec<Option<ClassDef>> = Vec::with_capacity(ort.classes.len());
        let mut matched_types = vec![false; target.types().len()];
        for oc in &ort.classes {
            let def = match oc.def {
                None => None,
                Some(ClassDef::Doc) => Some(ClassDef::Doc),
                Some(ClassDef::Type(ti)) => {
                    let name = os.types()[ti].name();
                    let nt = target.type_index(name).ok_or_else(|| EncodeError::UnknownClass {
                        name: name.to_owned(),
                    })?;
                    matched_types[nt] = true;
                    Some(ClassDef::Type(nt))
                }
            };
            class_defs.push(def);
        }
        // Target types the stream never declared are appended after it.
        let appended_types: Vec<usize> = (0..target.types().len())
            .filter(|i| !matched_types[*i])
            .collect();
        // Class id of each target type in the merged table.
        let mut type_class_ids: Vec<usize> = vec![0; target.types().len()];
        for (ci, def) in class_defs.iter().enumerate() {
            if let Some(ClassDef::Type(t)) = def {
                type_class_ids[*t] = ci;
            }
        }
        for (n, t) in appended_types.iter().enumerate() {
            type_class_ids[*t] = ort.classes.len() + n;
        }

        // Stores: origin order and ids preserved, new target stores appended.
        let mut store_ids: Vec<Option<usize>> = vec![None; target.stores().len()];
        let mut matched_stores = vec![false; target.stores().len()];
        let mut stores = Vec::new();
        for ost in &ort.stores {
            let (serial, slot, mode) = match ost.slot {
                None => (ost.serial.clone(), None, FieldMode::ReadWrite),
                Some(osi) => {
                    let name = os.stores()[osi].name();
                    let nsi = target.store_index(name).ok_or_else(|| EncodeError::UnknownStore {
                        name: name.to_owned(),
                    })?;
                    let held = match class_defs[ost.class_id] {
                        Some(ClassDef::Type(t)) => t,
                        _ => {
                            return Err(EncodeError::UnknownClass {
                                name: ort.classes[ost.class_id].serial.clone(),
                            }
                            .into())
                        }
                    };
                    if held != target.stores()[nsi].stored() {
                        return Err(EncodeError::StoreTypeMismatch {
                            store: name.to_owned(),
                            stored: target.types()[target.stores()[nsi].stored()]
                                .name()
                                .to_owned(),
                            held: target.types()[held].name().to_owned(),
                        }
                        .into());
                    }
                    store_ids[nsi] = Some(stores.len());
                    matched_stores[nsi] = true;
                    // Records live at the origin schema's store position.
                    (
                        target.stores()[nsi].serial().to_owned(),
                        Some(osi),
                        target.stores()[nsi].mode(),
                    )
                }
            };
            stores.push(RtStoreSchema {
                store_id: stores.len(),
                serial,
                class_id: ost.class_id,
                nelem: ost.nelem,
                slot,
                mode,
                lazy: ost.lazy.clone(),
            });
        }
        for (nsi, s) in target.stores().iter().enumerate() {
            if matched_stores[nsi] || s.mode() == FieldMode::Delete {
                continue;
            }
            store_ids[nsi] = Some(stores.len());
            // A store the origin schema never declared has no backing
            // records on this document; it is emitted empty.
            let slot = os.store_index(s.name());
            stores.push(RtStoreSchema {
                store_id: stores.len(),
                serial: s.serial().to_owned(),
                class_id: type_class_ids[s.stored()],
                nelem: 0,
                slot,
                mode: s.mode(),
                lazy: None,
            });
        }

        // Fields: origin stream fields keep their ids; target fields the
        // stream never carried are appended when the record layout can
        // hold them.
        let mut classes = Vec::with_capacity(ort.classes.len() + appended_types.len());
        for (ci, oc) in ort.classes.iter().enumerate() {
            let def = class_defs[ci];
            let serial = match def {
                None => oc.serial.clone(),
                Some(ClassDef::Doc) => META_SERIAL.to_owned(),
                Some(ClassDef::Type(nt)) => target.types()[nt].serial().to_owned(),
            };
            let target_fields: &[FieldSchema] = match def {
                None => &[],
                Some(ClassDef::Doc) => target.doc_fields(),
                Some(ClassDef::Type(nt)) => target.types()[nt].fields(),
            };
            let origin_fields: &[FieldSchema] = match oc.def {
                None => &[],
                Some(ClassDef::Doc) => os.doc_fields(),
                Some(ClassDef::Type(ti)) => os.types()[ti].fields(),
            };

            let mut fields = Vec::with_capacity(oc.fields.len());
            let mut matched_fields = vec![false; target_fields.len()];
            for of in &oc.fields {
                let target_idx = of.slot.map(|oslot| {
                    let name = origin_fields[oslot].name();
                    (oslot, target_fields.iter().position(|f| f.name() == name))
                });
                let rt = match target_idx {
                    Some((oslot, Some(nfi))) => {
                        matched_fields[nfi] = true;
                        let f = &target_fields[nfi];
                        let store_id = match f.kind().target_store() {
                            Some(t) => Some(store_ids[t].ok_or_else(|| {
                                EncodeError::UnknownStore {
                                    name: target.stores()[t].name().to_owned(),
                                }
                            })?),
                            None => None,
                        };
                        // The record's layout follows the origin schema, and
                        // slab membership was fixed at read time.
                        let mut rt = RtFieldSchema::from_static(of.field_id, f, oslot, store_id);
                        rt.in_slab = of.in_slab;
                        rt
                    }
                    // Lazy on the stream, or known to the origin but not to
                    // this writer: the header slot stays, no values follow.
                    _ => RtFieldSchema {
                        slot: None,
                        store_id: of.store_id,
                        ..of.clone()
                    },
                };
                fields.push(rt);
            }
            for (nfi, f) in target_fields.iter().enumerate() {
                if matched_fields[nfi] || f.mode() == FieldMode::Delete {
                    continue;
                }
                // Appendable only when the origin schema gave the record a
                // slot for it; otherwise no instance could hold a value.
                let oslot = match origin_fields.iter().position(|g| g.name() == f.name()) {
                    Some(s) => s,
                    None => continue,
                };
                let store_id = match f.kind().target_store() {
                    Some(t) => Some(store_ids[t].ok_or_else(|| EncodeError::UnknownStore {
                        name: target.stores()[t].name().to_owned(),
                    })?),
                    None => None,
                };
                fields.push(RtFieldSchema::from_static(fields.len(), f, oslot, store_id));
            }

            classes.push(RtClassSchema {
                class_id: ci,
                serial,
                def,
                fields,
            });
        }
        for (n, ti) in appended_types.iter().enumerate() {
            let t = &target.types()[*ti];
            let origin_ty = os.type_index(t.name());
            let mut fields = Vec::new();
            for (static_slot, f) in t.fields().iter().enumerate() {
                if f.mode() == FieldMode::Delete {
                    continue;
                }
                // Records of this type, if any exist on the document, were
                // laid out by the origin schema.
                let slot = match origin_ty {
                    Some(oti) => match os.types()[oti].field_index(f.name()) {
                        Some(s) => s,
                        None => continue,
                    },
                    None => static_slot,
                };
                let store_id = match f.kind().target_store() {
                    Some(tg) => Some(store_ids[tg].ok_or_else(|| EncodeError::UnknownStore {
                        name: target.stores()[tg].name().to_owned(),
                    })?),
                    None => None,
                };
                fields.push(RtFieldSchema::from_static(fields.len(), f, slot, store_id));
            }
            classes.push(RtClassSchema {
                class_id: ort.classes.len() + n,
                serial: t.serial().to_owned(),
                def: Some(ClassDef::Type(*ti)),
                fields,
            });
        }

        debug!(
            "merged runtime schema: {} classes ({} from stream), {} stores",
            classes.len(),
            ort.classes.len(),
            stores.len()
        );
        Ok(RtSchema {
            classes,
            stores,
            doc_class: ort.doc_class,
        })
    }
}
