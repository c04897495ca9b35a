//! Wire-format writer.
//!
//! A writer serializes whole documents: the instance maps and instance
//! groups are staged in scratch buffers (their byte lengths prefix them
//! on the wire), the complete document is assembled in memory, and a
//! single write-and-flush makes the call atomic from the caller's side.
//! Within each instance map, lazy slab bytes always precede freshly
//! encoded fields, and the two counts sum to the map's size.

use std::io::Write;

use log::debug;

use crate::document::{Doc, Record};
use crate::encode;
use crate::error::{EncodeError, Result};
use crate::runtime::{RtClassSchema, RtFieldSchema, RtSchema, RtStoreSchema};
use crate::schema::{DocSchema, FieldMode, FieldType};
use crate::value::Value;
use crate::WIRE_VERSION;

pub struct Writer<'a, W: Write> {
    schema: &'a DocSchema,
    out: W,
}

/// How one store's instance group leaves the writer.
enum Emit<'a> {
    /// Captured bytes re-emitted untouched, with the origin element count.
    Verbatim(&'a [u8], usize),
    /// Header entry only; zero elements and an empty group.
    Empty,
    /// Live records from the document store at the given position.
    Live(usize),
}

fn plan<'a>(store: &'a RtStoreSchema, doc: &Doc) -> Emit<'a> {
    if store.mode == FieldMode::Delete {
        return Emit::Empty;
    }
    match store.slot {
        None => match &store.lazy {
            Some(bytes) => Emit::Verbatim(bytes, store.nelem),
            None => Emit::Empty,
        },
        Some(slot) => {
            if store.mode == FieldMode::ReadOnly {
                if let Some(bytes) = &store.lazy {
                    return Emit::Verbatim(bytes, store.nelem);
                }
            }
            Emit::Live(slot)
        }
    }
}

impl<'a, W: Write> Writer<'a, W> {
    pub fn new(out: W, schema: &'a DocSchema) -> Self {
        Writer { schema, out }
    }

    /// Serialize one document. Documents that were never read from a
    /// stream must have been built from this writer's schema.
    pub fn write(&mut self, doc: &Doc) -> Result<()> {
        debug_assert!(
            doc.runtime().is_some() || doc.stores().len() == self.schema.stores().len(),
            "document was not built from the writer's schema"
        );
        let rt = RtSchema::for_write(doc, self.schema)?;

        let mut buf = Vec::new();
        // <wire_version>
        encode::write_uint(&mut buf, WIRE_VERSION as u64);

        // <klasses> ::= [ <klass> ]
        encode::write_array_len(&mut buf, rt.classes.len());
        for (i, class) in rt.classes.iter().enumerate() {
            debug_assert_eq!(class.class_id, i);
            // <klass> ::= ( <klass_name>, <fields> )
            encode::write_array_len(&mut buf, 2);
            encode::write_str(&mut buf, &class.serial);

            // <fields> ::= [ <field> ]
            encode::write_array_len(&mut buf, class.fields.len());
            for (fi, field) in class.fields.iter().enumerate() {
                debug_assert_eq!(field.field_id, fi);
                let nitems = 1
                    + field.is_pointer as usize
                    + field.is_slice as usize
                    + field.is_self_pointer as usize
                    + field.is_collection as usize;
                encode::write_map_len(&mut buf, nitems);

                // 0 NAME
                encode::write_uint(&mut buf, 0);
                encode::write_str(&mut buf, &field.serial);
                // 1 POINTER_TO: target store id + 1, 0 reserved
                if field.is_pointer {
                    let store_id =
                        field
                            .store_id
                            .ok_or_else(|| EncodeError::UnknownStore {
                                name: field.serial.clone(),
                            })?;
                    encode::write_uint(&mut buf, 1);
                    encode::write_uint(&mut buf, store_id as u64 + 1);
                }
                // 2 IS_SLICE
                if field.is_slice {
                    encode::write_uint(&mut buf, 2);
                    encode::write_nil(&mut buf);
                }
                // 3 IS_SELF_POINTER
                if field.is_self_pointer {
                    encode::write_uint(&mut buf, 3);
                    encode::write_nil(&mut buf);
                }
                // 4 IS_COLLECTION
                if field.is_collection {
                    encode::write_uint(&mut buf, 4);
                    encode::write_nil(&mut buf);
                }
            }
        }

        // <stores> ::= [ <store> ]
        encode::write_array_len(&mut buf, rt.stores.len());
        for (i, store) in rt.stores.iter().enumerate() {
            debug_assert_eq!(store.store_id, i);
            let nelem = match plan(store, doc) {
                Emit::Verbatim(_, nelem) => nelem,
                Emit::Empty => 0,
                Emit::Live(slot) => doc.store(slot).len(),
            };
            // <store> ::= ( <store_name>, <klass_id>, <store_nelem> )
            encode::write_array_len(&mut buf, 3);
            encode::write_str(&mut buf, &store.serial);
            encode::write_uint(&mut buf, store.class_id as u64);
            encode::write_uint(&mut buf, nelem as u64);
        }

        // <doc_instance> ::= <instances_nbytes> <instance>
        let mut scratch = Vec::new();
        write_instance(&mut scratch, doc, &rt.classes[rt.doc_class], &rt, None, doc)?;
        encode::write_uint(&mut buf, scratch.len() as u64);
        buf.extend_from_slice(&scratch);

        // <instances_group> ::= <instances_nbytes> <instances>
        for store in &rt.stores {
            match plan(store, doc) {
                Emit::Verbatim(bytes, _) => {
                    encode::write_uint(&mut buf, bytes.len() as u64);
                    buf.extend_from_slice(bytes);
                }
                Emit::Empty => {
                    let mut scratch = Vec::new();
                    encode::write_array_len(&mut scratch, 0);
                    encode::write_uint(&mut buf, scratch.len() as u64);
                    buf.extend_from_slice(&scratch);
                }
                Emit::Live(slot) => {
                    let live = doc.store(slot);
                    let class = &rt.classes[store.class_id];
                    let mut scratch = Vec::new();
                    encode::write_array_len(&mut scratch, live.len());
                    for ann in live.iter() {
                        write_instance(&mut scratch, ann, class, &rt, Some(live.len()), doc)?;
                    }
                    encode::write_uint(&mut buf, scratch.len() as u64);
                    buf.extend_from_slice(&scratch);
                }
            }
        }

        debug!(
            "writing document: {} classes, {} stores, {} bytes",
            rt.classes.len(),
            rt.stores.len(),
            buf.len()
        );
        self.out.write_all(&buf)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Serialize one `<instance>` map: slab bytes first, freshly encoded
/// fields after; the two counts sum to the map size. A record with no
/// fields at all encodes as an empty map.
fn write_instance(
    out: &mut Vec<u8>,
    record: &dyn Record,
    class: &RtClassSchema,
    rt: &RtSchema,
    self_len: Option<usize>,
    doc: &Doc,
) -> Result<()> {
    let has_slab = record.lazy_slab().is_some();
    let mut fresh = Vec::new();
    let mut nfresh = 0usize;
    for field in &class.fields {
        let slot = match field.slot {
            None => continue,
            Some(slot) => slot,
        };
        if field.in_slab && has_slab {
            continue;
        }
        if field.mode == FieldMode::Delete {
            continue;
        }
        let value = match record.field_slot(slot) {
            None => continue,
            Some(value) => value,
        };
        if write_field(&mut fresh, field, value, rt, self_len, doc)? {
            nfresh += 1;
        }
    }

    let slab = record.lazy_slab();
    encode::write_map_len(out, nfresh + slab.map_or(0, |s| s.nelem));
    if let Some(slab) = slab {
        out.extend_from_slice(&slab.bytes);
    }
    out.extend_from_slice(&fresh);
    Ok(())
}

/// Encode one set field. Returns false when the value is skipped (empty
/// collections are not written).
fn write_field(
    out: &mut Vec<u8>,
    field: &RtFieldSchema,
    value: &Value,
    rt: &RtSchema,
    self_len: Option<usize>,
    doc: &Doc,
) -> Result<bool> {
    let mismatch = |expected: &'static str| EncodeError::TypeMismatch {
        field: field.serial.clone(),
        expected,
        found: value.kind(),
    };

    if field.is_pointer || field.is_self_pointer {
        let nelem = if field.is_self_pointer {
            self_len.unwrap_or(0)
        } else {
            let target = field
                .store_id
                .and_then(|id| rt.stores.get(id))
                .ok_or_else(|| EncodeError::UnknownStore {
                    name: field.serial.clone(),
                })?;
            match target.slot {
                Some(slot) => doc.store(slot).len(),
                None => target.nelem,
            }
        };
        let check = |index: usize| -> Result<u64> {
            if index >= nelem {
                Err(EncodeError::PointerIndexRange {
                    field: field.serial.clone(),
                    index,
                    nelem,
                }
                .into())
            } else {
                Ok(index as u64)
            }
        };

        if field.is_slice {
            let slice = value.as_slice().ok_or_else(|| mismatch("slice"))?;
            if slice.last < slice.first {
                return Err(EncodeError::ReversedSlice {
                    field: field.serial.clone(),
                }
                .into());
            }
            check(slice.first)?;
            check(slice.last)?;
            encode::write_uint(out, field.field_id as u64);
            encode::write_array_len(out, 2);
            encode::write_uint(out, slice.first as u64);
            encode::write_uint(out, (slice.last - slice.first + 1) as u64);
        } else if field.is_collection {
            let indices = value.as_pointers().ok_or_else(|| mismatch("pointer collection"))?;
            if indices.is_empty() {
                return Ok(false);
            }
            encode::write_uint(out, field.field_id as u64);
            encode::write_array_len(out, indices.len());
            for index in indices {
                encode::write_uint(out, check(*index)?);
            }
        } else {
            let index = value.as_pointer().ok_or_else(|| mismatch("pointer"))?;
            encode::write_uint(out, field.field_id as u64);
            encode::write_uint(out, check(index)?);
        }
        return Ok(true);
    }

    if field.is_byte_slice() {
        let slice = value.as_byte_slice().ok_or_else(|| mismatch("byte slice"))?;
        if slice.stop < slice.start {
            return Err(EncodeError::ReversedSlice {
                field: field.serial.clone(),
            }
            .into());
        }
        encode::write_uint(out, field.field_id as u64);
        encode::write_array_len(out, 2);
        encode::write_uint(out, slice.start);
        encode::write_uint(out, slice.stop - slice.start);
        return Ok(true);
    }

    match (field.prim, value) {
        (Some(FieldType::Str), Value::Str(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_str(out, v);
        }
        (Some(FieldType::Bool), Value::Bool(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_bool(out, *v);
        }
        (Some(FieldType::U8), Value::U8(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_uint(out, *v as u64);
        }
        (Some(FieldType::U16), Value::U16(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_uint(out, *v as u64);
        }
        (Some(FieldType::U32), Value::U32(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_uint(out, *v as u64);
        }
        (Some(FieldType::U64), Value::U64(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_uint(out, *v);
        }
        (Some(FieldType::I8), Value::I8(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_int(out, *v as i64);
        }
        (Some(FieldType::I16), Value::I16(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_int(out, *v as i64);
        }
        (Some(FieldType::I32), Value::I32(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_int(out, *v as i64);
        }
        (Some(FieldType::I64), Value::I64(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_int(out, *v);
        }
        (Some(FieldType::F32), Value::F32(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_f32(out, *v);
        }
        (Some(FieldType::F64), Value::F64(v)) => {
            encode::write_uint(out, field.field_id as u64);
            encode::write_f64(out, *v);
        }
        (Some(ty), _) => return Err(mismatch(ty.name()).into()),
        (None, _) => {
            return Err(EncodeError::TypeMismatch {
                field: field.serial.clone(),
                expected: "primitive",
                found: value.kind(),
            }
            .into())
        }
    }
    Ok(true)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Error;
    use crate::reader::Reader;
    use crate::schema::{AnnDef, FieldDef, StoreDef};
    use crate::value::{ByteSlice, Slice};

    /// Byte-fixture builder; keeps the expected streams readable.
    struct Fix(Vec<u8>);

    impl Fix {
        fn new() -> Self {
            Fix(Vec::new())
        }

        fn b(mut self, bytes: &[u8]) -> Self {
            self.0.extend_from_slice(bytes);
            self
        }

        /// A fixstr: marker `0xa0 | len` followed by the bytes.
        fn s(mut self, v: &str) -> Self {
            self.0.push(0xa0 | v.len() as u8);
            self.0.extend_from_slice(v.as_bytes());
            self
        }
    }

    fn assert_bytes(expected: &[u8], actual: &[u8]) {
        assert_eq!(hex::encode(expected), hex::encode(actual));
    }

    fn write_to_vec(schema: &DocSchema, doc: &Doc) -> Vec<u8> {
        let mut out = Vec::new();
        Writer::new(&mut out, schema).write(doc).unwrap();
        out
    }

    fn self_pointer_schema() -> DocSchema {
        DocSchema::builder("TestDoc")
            .ann(
                AnnDef::new("X")
                    .field(FieldDef::self_pointer("parent"))
                    .field(FieldDef::pointer("other", "xs2")),
            )
            .store(StoreDef::new("xs1", "X"))
            .store(StoreDef::new("xs2", "X"))
            .build()
            .unwrap()
    }

    #[test]
    fn self_pointers_resolve_per_store() {
        let schema = self_pointer_schema();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 3);
        doc.store_mut(1).create(&schema.types()[0], 2);

        doc.store_mut(0).get_mut(1).unwrap().set(0, Value::Pointer(0));
        doc.store_mut(0).get_mut(2).unwrap().set(0, Value::Pointer(1));
        doc.store_mut(1).get_mut(1).unwrap().set(0, Value::Pointer(0));
        for i in 0..3 {
            doc.store_mut(0).get_mut(i).unwrap().set(1, Value::Pointer(0));
        }
        for i in 0..2 {
            doc.store_mut(1).get_mut(i).unwrap().set(1, Value::Pointer(0));
        }

        let expected = Fix::new()
            .b(&[0x03])
            .b(&[0x92]) // <klasses>: 2-element array
            .b(&[0x92]) // <klass>: ( __meta__, no fields )
            .s("__meta__")
            .b(&[0x90])
            .b(&[0x92]) // <klass>: ( X, 2 fields )
            .s("X")
            .b(&[0x92])
            .b(&[0x82, 0x00]) // <field>: { NAME: parent, IS_SELF_POINTER: nil }
            .s("parent")
            .b(&[0x03, 0xc0])
            .b(&[0x82, 0x00]) // <field>: { NAME: other, POINTER_TO: xs2 + 1 }
            .s("other")
            .b(&[0x01, 0x02])
            .b(&[0x92]) // <stores>: 2-element array
            .b(&[0x93])
            .s("xs1")
            .b(&[0x01, 0x03])
            .b(&[0x93])
            .s("xs2")
            .b(&[0x01, 0x02])
            .b(&[0x01, 0x80]) // <doc_instance>: empty map
            .b(&[0x0e, 0x93]) // xs1 instances
            .b(&[0x81, 0x01, 0x00])
            .b(&[0x82, 0x00, 0x00, 0x01, 0x00])
            .b(&[0x82, 0x00, 0x01, 0x01, 0x00])
            .b(&[0x09, 0x92]) // xs2 instances
            .b(&[0x81, 0x01, 0x00])
            .b(&[0x82, 0x00, 0x00, 0x01, 0x00])
            .0;

        let stream = write_to_vec(&schema, &doc);
        assert_bytes(&expected, &stream);

        let mut reader = Reader::new(stream.as_slice(), &schema);
        let doc1 = reader.read_doc().unwrap().unwrap();
        assert!(reader.read_doc().unwrap().is_none());

        assert_eq!(doc1.store(0).len(), 3);
        assert_eq!(doc1.store(1).len(), 2);
        assert_eq!(doc1.store(0).get(0).unwrap().get(0), None);
        assert_eq!(doc1.store(0).get(1).unwrap().get(0), Some(&Value::Pointer(0)));
        assert_eq!(doc1.store(0).get(2).unwrap().get(0), Some(&Value::Pointer(1)));
        assert_eq!(doc1.store(1).get(0).unwrap().get(0), None);
        assert_eq!(doc1.store(1).get(1).unwrap().get(0), Some(&Value::Pointer(0)));
        for i in 0..3 {
            assert_eq!(doc1.store(0).get(i).unwrap().get(1), Some(&Value::Pointer(0)));
        }
        for i in 0..2 {
            assert_eq!(doc1.store(1).get(i).unwrap().get(1), Some(&Value::Pointer(0)));
        }
    }

    fn slices_schema() -> DocSchema {
        DocSchema::builder("Doc")
            .ann(
                AnnDef::new("Token")
                    .field(FieldDef::byte_slice("span"))
                    .field(FieldDef::primitive("raw", FieldType::Str)),
            )
            .ann(
                AnnDef::new("Sent")
                    .field(FieldDef::pointer_slice("span", "tokens"))
                    .field(FieldDef::primitive("number", FieldType::I32)),
            )
            .store(StoreDef::new("tokens", "Token"))
            .store(StoreDef::new("sents", "Sent"))
            .build()
            .unwrap()
    }

    #[test]
    fn slices_encode_start_and_count() {
        let schema = slices_schema();
        let words: [(&str, u64, u64); 10] = [
            ("The", 0, 3),
            ("quick", 4, 9),
            ("brown", 11, 16),
            ("fox", 17, 20),
            (".", 20, 21),
            ("The", 22, 25),
            ("lazy", 26, 30),
            ("cat", 31, 34),
            ("too", 35, 38),
            (".", 38, 39),
        ];

        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], words.len());
        for (i, (raw, start, stop)) in words.iter().enumerate() {
            let tok = doc.store_mut(0).get_mut(i).unwrap();
            tok.set(0, ByteSlice::new(*start, *stop));
            tok.set(1, *raw);
        }
        doc.store_mut(1).create(&schema.types()[1], 2);
        doc.store_mut(1).get_mut(0).unwrap().set(0, Slice::new(0, 4));
        doc.store_mut(1).get_mut(0).unwrap().set(1, Value::I32(0));
        doc.store_mut(1).get_mut(1).unwrap().set(0, Slice::new(5, 9));
        doc.store_mut(1).get_mut(1).unwrap().set(1, Value::I32(0));

        let mut expected = Fix::new()
            .b(&[0x03])
            .b(&[0x93]) // <klasses>
            .b(&[0x92])
            .s("__meta__")
            .b(&[0x90])
            .b(&[0x92])
            .s("Token")
            .b(&[0x92])
            .b(&[0x82, 0x00]) // { NAME: span, IS_SLICE: nil }
            .s("span")
            .b(&[0x02, 0xc0])
            .b(&[0x81, 0x00]) // { NAME: raw }
            .s("raw")
            .b(&[0x92])
            .s("Sent")
            .b(&[0x92])
            .b(&[0x83, 0x00]) // { NAME: span, POINTER_TO: tokens + 1, IS_SLICE: nil }
            .s("span")
            .b(&[0x01, 0x01, 0x02, 0xc0])
            .b(&[0x81, 0x00]) // { NAME: number }
            .s("number")
            .b(&[0x92]) // <stores>
            .b(&[0x93])
            .s("tokens")
            .b(&[0x01, 0x0a])
            .b(&[0x93])
            .s("sents")
            .b(&[0x02, 0x02])
            .b(&[0x01, 0x80]) // <doc_instance>
            .b(&[0x66, 0x9a]); // tokens group
        for (raw, start, stop) in &words {
            expected = expected
                .b(&[0x82, 0x00, 0x92, *start as u8, (*stop - *start) as u8, 0x01])
                .s(raw);
        }
        let expected = expected
            .b(&[0x0f, 0x92]) // sents group
            .b(&[0x82, 0x00, 0x92, 0x00, 0x05, 0x01, 0x00])
            .b(&[0x82, 0x00, 0x92, 0x05, 0x05, 0x01, 0x00])
            .0;

        let stream = write_to_vec(&schema, &doc);
        assert_bytes(&expected, &stream);

        let mut reader = Reader::new(stream.as_slice(), &schema);
        let doc1 = reader.read_doc().unwrap().unwrap();
        assert_eq!(doc1.store(0).len(), 10);
        assert_eq!(doc1.store(1).len(), 2);
        for (i, (raw, start, stop)) in words.iter().enumerate() {
            let tok = doc1.store(0).get(i).unwrap();
            assert_eq!(tok.get(0), Some(&Value::ByteSlice(ByteSlice::new(*start, *stop))));
            assert_eq!(tok.get(1), Some(&Value::Str((*raw).to_owned())));
        }
        // A slice covering indices 0..=4 rides the wire as [0, 5] and comes
        // back with inclusive endpoints.
        assert_eq!(doc1.store(1).get(0).unwrap().get(0), Some(&Value::Slice(Slice::new(0, 4))));
        assert_eq!(doc1.store(1).get(1).unwrap().get(0), Some(&Value::Slice(Slice::new(5, 9))));
    }

    fn pointers_schema() -> DocSchema {
        DocSchema::builder("TestDoc")
            .ann(
                AnnDef::new("Token")
                    .field(FieldDef::byte_slice("span"))
                    .field(FieldDef::primitive("raw", FieldType::Str)),
            )
            .ann(
                AnnDef::new("X")
                    .field(FieldDef::pointer_collection("tokens", "tokens"))
                    .field(FieldDef::self_pointer_collection("prior")),
            )
            .store(StoreDef::new("tokens", "Token"))
            .store(StoreDef::new("xs", "X"))
            .build()
            .unwrap()
    }

    #[test]
    fn pointer_collections_keep_order() {
        let schema = pointers_schema();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 10);
        for i in 0..10u64 {
            let tok = doc.store_mut(0).get_mut(i as usize).unwrap();
            tok.set(0, ByteSlice::new(i, i + 1));
            tok.set(1, ((b'a' + i as u8) as char).to_string());
        }
        doc.store_mut(1).create(&schema.types()[1], 5);
        let groups: [&[usize]; 5] = [&[0], &[0, 1, 2], &[0, 1, 2, 3, 4], &[], &[9]];
        for (i, g) in groups.iter().enumerate() {
            let x = doc.store_mut(1).get_mut(i).unwrap();
            if !g.is_empty() {
                x.set(0, Value::Pointers(g.to_vec()));
            }
            x.set(1, Value::Pointers((0..=i).collect()));
        }

        let mut expected = Fix::new()
            .b(&[0x03])
            .b(&[0x93]) // <klasses>
            .b(&[0x92])
            .s("__meta__")
            .b(&[0x90])
            .b(&[0x92])
            .s("Token")
            .b(&[0x92])
            .b(&[0x82, 0x00])
            .s("span")
            .b(&[0x02, 0xc0])
            .b(&[0x81, 0x00])
            .s("raw")
            .b(&[0x92])
            .s("X")
            .b(&[0x92])
            .b(&[0x83, 0x00]) // { NAME: tokens, POINTER_TO: tokens + 1, IS_COLLECTION: nil }
            .s("tokens")
            .b(&[0x01, 0x01, 0x04, 0xc0])
            .b(&[0x83, 0x00]) // { NAME: prior, IS_SELF_POINTER: nil, IS_COLLECTION: nil }
            .s("prior")
            .b(&[0x03, 0xc0, 0x04, 0xc0])
            .b(&[0x92]) // <stores>
            .b(&[0x93])
            .s("tokens")
            .b(&[0x01, 0x0a])
            .b(&[0x93])
            .s("xs")
            .b(&[0x02, 0x05])
            .b(&[0x01, 0x80]) // <doc_instance>
            .b(&[0x51, 0x9a]); // tokens group
        for i in 0..10u8 {
            expected = expected
                .b(&[0x82, 0x00, 0x92, i, 0x01, 0x01])
                .s(&((b'a' + i) as char).to_string());
        }
        let expected = expected
            .b(&[0x31, 0x95]) // xs group
            .b(&[0x82, 0x00, 0x91, 0x00, 0x01, 0x91, 0x00])
            .b(&[0x82, 0x00, 0x93, 0x00, 0x01, 0x02, 0x01, 0x92, 0x00, 0x01])
            .b(&[0x82, 0x00, 0x95, 0x00, 0x01, 0x02, 0x03, 0x04, 0x01, 0x93, 0x00, 0x01, 0x02])
            .b(&[0x81, 0x01, 0x94, 0x00, 0x01, 0x02, 0x03])
            .b(&[0x82, 0x00, 0x91, 0x09, 0x01, 0x95, 0x00, 0x01, 0x02, 0x03, 0x04])
            .0;

        let stream = write_to_vec(&schema, &doc);
        assert_bytes(&expected, &stream);

        let mut reader = Reader::new(stream.as_slice(), &schema);
        let doc1 = reader.read_doc().unwrap().unwrap();
        for (i, g) in groups.iter().enumerate() {
            let x = doc1.store(1).get(i).unwrap();
            // The empty collection was skipped on write, so it reads back
            // as unset.
            if g.is_empty() {
                assert_eq!(x.get(0), None);
            } else {
                assert_eq!(x.get(0), Some(&Value::Pointers(g.to_vec())));
            }
            assert_eq!(x.get(1), Some(&Value::Pointers((0..=i).collect())));
        }
    }

    fn schema_a() -> DocSchema {
        DocSchema::builder("DocA")
            .ann(
                AnnDef::new("A")
                    .field(FieldDef::primitive("v_str", FieldType::Str))
                    .field(FieldDef::primitive("v_uint8", FieldType::U8))
                    .field(FieldDef::primitive("v_bool", FieldType::Bool)),
            )
            .store(StoreDef::new("as", "A"))
            .build()
            .unwrap()
    }

    fn schema_b() -> DocSchema {
        DocSchema::builder("DocB")
            .ann(
                AnnDef::new("B")
                    .field(FieldDef::primitive("word", FieldType::Str).mode(FieldMode::ReadOnly))
                    .field(FieldDef::primitive("upper", FieldType::Str))
                    .field(
                        FieldDef::primitive("is_first", FieldType::Bool).mode(FieldMode::ReadOnly),
                    ),
            )
            .store(StoreDef::new("bs", "B"))
            .build()
            .unwrap()
    }

    const WORDS: [&str; 5] = ["The", "quick", "brown", "fox", "jumped"];

    fn stream0_expected() -> Vec<u8> {
        let mut fix = Fix::new()
            .b(&[0x03])
            .b(&[0x92])
            .b(&[0x92])
            .s("__meta__")
            .b(&[0x90])
            .b(&[0x92])
            .s("A")
            .b(&[0x93])
            .b(&[0x81, 0x00])
            .s("v_str")
            .b(&[0x81, 0x00])
            .s("v_uint8")
            .b(&[0x81, 0x00])
            .s("v_bool")
            .b(&[0x91])
            .b(&[0x93])
            .s("as")
            .b(&[0x01, 0x05])
            .b(&[0x01, 0x80])
            .b(&[0x3a, 0x95]);
        for (i, w) in WORDS.iter().enumerate() {
            fix = fix
                .b(&[0x83, 0x00])
                .s(w)
                .b(&[0x01, i as u8, 0x02, if i == 0 { 0xc3 } else { 0xc2 }]);
        }
        fix.0
    }

    fn stream1_expected() -> Vec<u8> {
        let mut fix = Fix::new()
            .b(&[0x03])
            .b(&[0x92])
            .b(&[0x92])
            .s("__meta__")
            .b(&[0x90])
            .b(&[0x92])
            .s("B")
            .b(&[0x94])
            .b(&[0x81, 0x00])
            .s("word")
            .b(&[0x81, 0x00])
            .s("v_uint8")
            .b(&[0x81, 0x00])
            .s("is_first")
            .b(&[0x81, 0x00])
            .s("upper")
            .b(&[0x91])
            .b(&[0x93])
            .s("bs")
            .b(&[0x01, 0x05])
            .b(&[0x01, 0x80])
            .b(&[0x5a, 0x95]);
        for (i, w) in WORDS.iter().enumerate() {
            fix = fix
                .b(&[0x84, 0x00])
                .s(w)
                .b(&[0x01, i as u8, 0x02, if i == 0 { 0xc3 } else { 0xc2 }, 0x03])
                .s(&w.to_uppercase());
        }
        fix.0
    }

    /// The cross-schema lazy scenario: write under A; read under B with
    /// serial remaps (B does not know v_uint8); mutate; write under B;
    /// read back under A with the reverse remaps. Unknown bytes and
    /// read-only bytes survive every hop unchanged.
    #[test]
    fn lazy_cross_schema_round_trip() {
        let schema0 = schema_a();
        let mut doc0 = Doc::new(&schema0);
        doc0.store_mut(0).create(&schema0.types()[0], WORDS.len());
        for (i, w) in WORDS.iter().enumerate() {
            let a = doc0.store_mut(0).get_mut(i).unwrap();
            a.set(0, *w);
            a.set(1, Value::U8(i as u8));
            a.set(2, i == 0);
        }
        let stream0 = write_to_vec(&schema0, &doc0);
        assert_bytes(&stream0_expected(), &stream0);

        let mut schema1_in = schema_b();
        schema1_in.store_mut("bs").unwrap().set_serial("as");
        schema1_in.type_mut("B").unwrap().set_serial("A");
        let b = schema1_in.type_mut("B").unwrap();
        b.field_mut("word").unwrap().set_serial("v_str");
        b.field_mut("is_first").unwrap().set_serial("v_bool");
        let schema1_out = schema_b();

        let mut stream1 = Vec::new();
        let mut ndocs = 0;
        for doc1 in Reader::new(stream0.as_slice(), &schema1_in) {
            let mut doc1 = doc1.unwrap();
            ndocs += 1;

            assert_eq!(doc1.store(0).len(), WORDS.len());
            for (i, w) in WORDS.iter().enumerate() {
                let b = doc1.store(0).get(i).unwrap();
                assert_eq!(b.get(0), Some(&Value::Str((*w).to_owned())));
                assert_eq!(b.get(1), None);
                assert_eq!(b.get(2), Some(&Value::Bool(i == 0)));
                // v_uint8 plus the two read-only fields ride the slab.
                assert_eq!(b.lazy_count(), 3);
                assert_eq!(b.lazy_bytes().unwrap().len(), 3 + (w.len() + 1) + 1 + 1);
            }
            assert_eq!(doc1.lazy_count(), 0);
            assert!(doc1.lazy_bytes().is_none());

            for i in 0..WORDS.len() {
                let b = doc1.store_mut(0).get_mut(i).unwrap();
                let upper = b.get(0).unwrap().as_str().unwrap().to_uppercase();
                b.set(1, upper);
                // Read-only: this mutation must not reach the output.
                b.set(2, true);
            }
            Writer::new(&mut stream1, &schema1_out).write(&doc1).unwrap();
        }
        assert_eq!(ndocs, 1);
        assert_bytes(&stream1_expected(), &stream1);

        let mut schema2 = schema_a();
        schema2.store_mut("as").unwrap().set_serial("bs");
        schema2.type_mut("A").unwrap().set_serial("B");
        let a = schema2.type_mut("A").unwrap();
        a.field_mut("v_str").unwrap().set_serial("word");
        a.field_mut("v_bool").unwrap().set_serial("is_first");

        let mut ndocs = 0;
        for doc2 in Reader::new(stream1.as_slice(), &schema2) {
            let doc2 = doc2.unwrap();
            ndocs += 1;
            for (i, w) in WORDS.iter().enumerate() {
                let a = doc2.store(0).get(i).unwrap();
                assert_eq!(a.get(0), Some(&Value::Str((*w).to_owned())));
                assert_eq!(a.get(1), Some(&Value::U8(i as u8)));
                // The original booleans, not the mutated ones.
                assert_eq!(a.get(2), Some(&Value::Bool(i == 0)));
                // Only `upper` is unknown to A.
                assert_eq!(a.lazy_count(), 1);
                assert_eq!(a.lazy_bytes().unwrap().len(), 1 + (w.len() + 1));
            }
        }
        assert_eq!(ndocs, 1);
    }

    #[test]
    fn unknown_record_type_round_trips_verbatim() {
        let schema_z = DocSchema::builder("DocZ")
            .ann(AnnDef::new("Z").field(FieldDef::primitive("z", FieldType::Str)))
            .store(StoreDef::new("zs", "Z"))
            .build()
            .unwrap();
        let mut doc = Doc::new(&schema_z);
        doc.store_mut(0).create(&schema_z.types()[0], 2);
        doc.store_mut(0).get_mut(0).unwrap().set(0, "alpha");
        doc.store_mut(0).get_mut(1).unwrap().set(0, "beta");
        let stream = write_to_vec(&schema_z, &doc);

        let empty = DocSchema::builder("Doc").build().unwrap();
        let mut reader = Reader::new(stream.as_slice(), &empty);
        let doc1 = reader.read_doc().unwrap().unwrap();
        // Zero records materialize...
        assert!(doc1.stores().is_empty());
        let rt = doc1.runtime().unwrap();
        assert_eq!(rt.nclasses(), 2);
        assert_eq!(rt.nstores(), 1);

        // ...but the store's bytes come back out unchanged.
        let out = write_to_vec(&empty, &doc1);
        assert_bytes(&stream, &out);
    }

    #[test]
    fn read_only_store_round_trips_verbatim() {
        let schema = schema_a();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 3);
        for i in 0..3 {
            doc.store_mut(0).get_mut(i).unwrap().set(1, Value::U8(i as u8));
        }
        let stream = write_to_vec(&schema, &doc);

        let ro = DocSchema::builder("DocA")
            .ann(AnnDef::new("A").field(FieldDef::primitive("v_uint8", FieldType::U8)))
            .store(StoreDef::new("as", "A").mode(FieldMode::ReadOnly))
            .build()
            .unwrap();
        let mut reader = Reader::new(stream.as_slice(), &ro);
        let mut doc1 = reader.read_doc().unwrap().unwrap();
        // Records materialize even though the store is read-only...
        assert_eq!(doc1.store(0).len(), 3);
        assert_eq!(doc1.store(0).get(2).unwrap().get(0), Some(&Value::U8(2)));
        // ...and mutations never reach the output: the whole stream comes
        // back out byte-for-byte.
        doc1.store_mut(0).get_mut(2).unwrap().set(0, Value::U8(99));
        let out = write_to_vec(&ro, &doc1);
        assert_bytes(&stream, &out);

        let reread = Reader::new(out.as_slice(), &ro).read_doc().unwrap().unwrap();
        assert_eq!(reread.store(0).get(2).unwrap().get(0), Some(&Value::U8(2)));
    }

    #[test]
    fn delete_mode_fields_are_not_emitted() {
        let schema = schema_a();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 1);
        let a = doc.store_mut(0).get_mut(0).unwrap();
        a.set(0, "kept");
        a.set(1, Value::U8(7));
        let stream = write_to_vec(&schema, &doc);

        let dropper = DocSchema::builder("DocA")
            .ann(
                AnnDef::new("A")
                    .field(FieldDef::primitive("v_str", FieldType::Str))
                    .field(FieldDef::primitive("v_uint8", FieldType::U8).mode(FieldMode::Delete))
                    .field(FieldDef::primitive("v_bool", FieldType::Bool)),
            )
            .store(StoreDef::new("as", "A"))
            .build()
            .unwrap();
        let doc1 = Reader::new(stream.as_slice(), &dropper)
            .read_doc()
            .unwrap()
            .unwrap();
        // Read normally...
        assert_eq!(doc1.store(0).get(0).unwrap().get(1), Some(&Value::U8(7)));
        let out = write_to_vec(&dropper, &doc1);

        // ...but gone after the round trip.
        let doc2 = Reader::new(out.as_slice(), &dropper)
            .read_doc()
            .unwrap()
            .unwrap();
        assert_eq!(doc2.store(0).get(0).unwrap().get(0), Some(&Value::Str("kept".into())));
        assert_eq!(doc2.store(0).get(0).unwrap().get(1), None);
    }

    #[test]
    fn value_type_must_match_declaration() {
        let schema = schema_a();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 1);
        doc.store_mut(0).get_mut(0).unwrap().set(1, "not a u8");
        let mut sink = Vec::new();
        let err = Writer::new(&mut sink, &schema).write(&doc).unwrap_err();
        assert!(matches!(
            err,
            Error::Encode(EncodeError::TypeMismatch { expected: "u8", .. })
        ));
    }

    #[test]
    fn pointer_values_are_bounds_checked() {
        let schema = self_pointer_schema();
        let mut doc = Doc::new(&schema);
        doc.store_mut(0).create(&schema.types()[0], 2);
        doc.store_mut(1).create(&schema.types()[0], 1);
        doc.store_mut(0).get_mut(0).unwrap().set(1, Value::Pointer(5));
        let mut sink = Vec::new();
        let err = Writer::new(&mut sink, &schema).write(&doc).unwrap_err();
        assert!(matches!(
            err,
            Error::Encode(EncodeError::PointerIndexRange { index: 5, nelem: 1, .. })
        ));
    }

    fn kitchen_schema() -> DocSchema {
        DocSchema::builder("Doc")
            .doc_field(FieldDef::primitive("text", FieldType::Str))
            .ann(
                AnnDef::new("Token")
                    .field(FieldDef::byte_slice("span"))
                    .field(FieldDef::primitive("raw", FieldType::Str))
                    .field(FieldDef::primitive("idx", FieldType::U32))
                    .field(FieldDef::primitive("score", FieldType::F64))
                    .field(FieldDef::primitive("flag", FieldType::Bool))
                    .field(FieldDef::primitive("delta", FieldType::I16)),
            )
            .ann(
                AnnDef::new("Phrase")
                    .field(FieldDef::pointer_collection("members", "tokens"))
                    .field(FieldDef::pointer_slice("range", "tokens"))
                    .field(FieldDef::pointer("head", "tokens"))
                    .field(FieldDef::self_pointer("parent")),
            )
            .store(StoreDef::new("tokens", "Token"))
            .store(StoreDef::new("phrases", "Phrase"))
            .build()
            .unwrap()
    }

    #[test]
    fn identity_round_trip() {
        let schema = kitchen_schema();
        let mut doc = Doc::new(&schema);
        doc.set(0, "a small document");
        doc.store_mut(0).create(&schema.types()[0], 4);
        for i in 0..4u64 {
            let tok = doc.store_mut(0).get_mut(i as usize).unwrap();
            tok.set(0, ByteSlice::new(i * 3, i * 3 + 2));
            tok.set(1, format!("t{}", i));
            tok.set(2, Value::U32(i as u32 * 1000));
            tok.set(3, Value::F64(0.25 * i as f64));
            tok.set(4, i % 2 == 0);
            tok.set(5, Value::I16(-(i as i16)));
        }
        doc.store_mut(1).create(&schema.types()[1], 2);
        {
            let p = doc.store_mut(1).get_mut(0).unwrap();
            p.set(0, Value::Pointers(vec![0, 2, 3]));
            p.set(1, Slice::new(1, 3));
            p.set(2, Value::Pointer(2));
        }
        {
            let p = doc.store_mut(1).get_mut(1).unwrap();
            p.set(2, Value::Pointer(0));
            p.set(3, Value::Pointer(0));
        }

        let stream = write_to_vec(&schema, &doc);
        let doc1 = Reader::new(stream.as_slice(), &schema)
            .read_doc()
            .unwrap()
            .unwrap();

        assert_eq!(doc1.get(0), Some(&Value::Str("a small document".into())));
        for i in 0..4 {
            let a = doc.store(0).get(i).unwrap();
            let b = doc1.store(0).get(i).unwrap();
            for f in 0..6 {
                assert_eq!(a.get(f), b.get(f), "token {} field {}", i, f);
            }
        }
        for i in 0..2 {
            let a = doc.store(1).get(i).unwrap();
            let b = doc1.store(1).get(i).unwrap();
            for f in 0..4 {
                assert_eq!(a.get(f), b.get(f), "phrase {} field {}", i, f);
            }
        }

        // Re-writing the read document reproduces the stream.
        let again = write_to_vec(&schema, &doc1);
        assert_bytes(&stream, &again);
    }

    #[test]
    fn randomized_multi_doc_round_trip() {
        use rand::{Rng, SeedableRng};

        let schema = DocSchema::builder("Doc")
            .ann(
                AnnDef::new("R")
                    .field(FieldDef::primitive("a", FieldType::U64))
                    .field(FieldDef::primitive("b", FieldType::I64))
                    .field(FieldDef::primitive("c", FieldType::Str))
                    .field(FieldDef::primitive("d", FieldType::F32)),
            )
            .store(StoreDef::new("rs", "R"))
            .build()
            .unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut docs = Vec::new();
        let mut stream = Vec::new();
        for _ in 0..5 {
            let mut doc = Doc::new(&schema);
            let n = rng.gen_range(0..20);
            doc.store_mut(0).create(&schema.types()[0], n);
            for i in 0..n {
                let r = doc.store_mut(0).get_mut(i).unwrap();
                if rng.gen_bool(0.8) {
                    r.set(0, Value::U64(rng.gen()));
                }
                if rng.gen_bool(0.8) {
                    r.set(1, Value::I64(rng.gen()));
                }
                if rng.gen_bool(0.5) {
                    let len = rng.gen_range(0..40);
                    let s: String = (0..len).map(|_| rng.gen_range('a'..='z')).collect();
                    r.set(2, s);
                }
                if rng.gen_bool(0.5) {
                    r.set(3, Value::F32(rng.gen::<f32>()));
                }
            }
            Writer::new(&mut stream, &schema).write(&doc).unwrap();
            docs.push(doc);
        }

        let mut nread = 0;
        for (read, wrote) in Reader::new(stream.as_slice(), &schema).zip(docs.iter()) {
            let read = read.unwrap();
            nread += 1;
            assert_eq!(read.store(0).len(), wrote.store(0).len());
            for (x, y) in read.store(0).iter().zip(wrote.store(0).iter()) {
                for f in 0..4 {
                    assert_eq!(x.get(f), y.get(f));
                }
            }
        }
        assert_eq!(nread, 5);
    }
}
