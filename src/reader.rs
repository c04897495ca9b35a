//! Wire-format reader.
//!
//! A reader consumes one input stream end-to-end as an external iterator:
//! each advance parses one full document, re-reading the stream's
//! self-declared layout every time, since the format embeds the schema
//! per document. End of stream is a clean termination, not an error. Any
//! failure partway through a document is fatal and the stream is
//! unusable afterwards; the format has no resynchronization point.

use std::io::Read;

use log::debug;

use crate::decode;
use crate::document::{Doc, LazySlab, Record};
use crate::encode;
use crate::error::{FormatError, Result};
use crate::runtime::{Reconciler, RtClassSchema, RtFieldSchema, RtStoreSchema, Runtime};
use crate::schema::{DocSchema, FieldMode, FieldType};
use crate::value::{ByteSlice, Slice, Value};
use crate::WIRE_VERSION;

pub struct Reader<'a, R: Read> {
    schema: &'a DocSchema,
    input: R,
    errored: bool,
}

impl<'a, R: Read> Reader<'a, R> {
    pub fn new(input: R, schema: &'a DocSchema) -> Self {
        Reader {
            schema,
            input,
            errored: false,
        }
    }

    /// Read the next document off the stream. Returns `Ok(None)` at a
    /// clean end of stream.
    pub fn read_doc(&mut self) -> Result<Option<Doc>> {
        // <wire_version>, or end of stream.
        let mut version = [0u8; 1];
        loop {
            match self.input.read(&mut version) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if version[0] != WIRE_VERSION {
            return Err(FormatError::BadVersion { found: version[0] }.into());
        }

        // <klasses> ::= [ <klass> ]
        let mut rec = Reconciler::new(self.schema);
        let nklasses = decode::read_array_len(&mut self.input)?;
        for _ in 0..nklasses {
            // <klass> ::= ( <klass_name>, <fields> )
            let npair = decode::read_array_len(&mut self.input)?;
            if npair != 2 {
                return Err(FormatError::TupleSize {
                    expected: 2,
                    found: npair,
                }
                .into());
            }
            let klass_name = decode::read_str(&mut self.input)?;
            let class_id = rec.begin_class(klass_name);

            // <fields> ::= [ <field> ]
            let nfields = decode::read_array_len(&mut self.input)?;
            for f in 0..nfields {
                // <field> ::= { <field_type> : <field_val> }
                let nitems = decode::read_map_len(&mut self.input)?;
                let mut field_name: Option<String> = None;
                let mut pointer_to: Option<u64> = None;
                let mut is_slice = false;
                let mut is_self_pointer = false;
                let mut is_collection = false;
                for _ in 0..nitems {
                    match decode::read_uint(&mut self.input)? {
                        0 => field_name = Some(decode::read_str(&mut self.input)?),
                        1 => pointer_to = Some(decode::read_uint(&mut self.input)?),
                        2 => {
                            decode::read_nil(&mut self.input)?;
                            is_slice = true;
                        }
                        3 => {
                            decode::read_nil(&mut self.input)?;
                            is_self_pointer = true;
                        }
                        4 => {
                            decode::read_nil(&mut self.input)?;
                            is_collection = true;
                        }
                        key => return Err(FormatError::UnknownFieldKey { key }.into()),
                    }
                }
                let field_name =
                    field_name.ok_or(FormatError::MissingFieldName { index: f })?;
                rec.add_field(
                    class_id,
                    field_name,
                    pointer_to,
                    is_self_pointer,
                    is_slice,
                    is_collection,
                )?;
            }
        }

        // <stores> ::= [ <store> ]
        let nstores = decode::read_array_len(&mut self.input)?;
        for _ in 0..nstores {
            // <store> ::= ( <store_name>, <klass_id>, <store_nelem> )
            let ntriple = decode::read_array_len(&mut self.input)?;
            if ntriple != 3 {
                return Err(FormatError::TupleSize {
                    expected: 3,
                    found: ntriple,
                }
                .into());
            }
            let store_name = decode::read_str(&mut self.input)?;
            let klass_id = decode::read_uint(&mut self.input)?;
            let nelem = decode::read_uint(&mut self.input)?;
            rec.add_store(store_name, klass_id, nelem)?;
        }

        let mut rt = rec.finish()?;

        // Pre-size every known store before any instance is decoded, since
        // pointer fields may reference any index by position.
        let mut doc = Doc::new(self.schema);
        for store in &rt.stores {
            if let Some(slot) = store.slot {
                let stored = self.schema.stores()[slot].stored();
                doc.store_mut(slot)
                    .create(&self.schema.types()[stored], store.nelem);
            }
        }

        // <doc_instance> ::= <instances_nbytes> <instance>
        let nbytes = decode::read_uint(&mut self.input)? as usize;
        let buf = decode::read_exact_vec(&mut self.input, nbytes)?;
        {
            let mut body: &[u8] = &buf;
            parse_instance(&mut body, &mut doc, &rt.classes[rt.doc_class], &rt.stores, None)?;
            if !body.is_empty() {
                return Err(FormatError::TrailingBytes { count: body.len() }.into());
            }
        }

        // <instances_group> ::= <instances_nbytes> <instances>,
        // one group per declared store, in store order.
        for si in 0..rt.stores.len() {
            let nbytes = decode::read_uint(&mut self.input)? as usize;
            let buf = decode::read_exact_vec(&mut self.input, nbytes)?;

            let slot = match rt.stores[si].slot {
                None => {
                    rt.stores[si].lazy = Some(buf);
                    continue;
                }
                Some(slot) => slot,
            };
            if rt.stores[si].mode == FieldMode::ReadOnly {
                rt.stores[si].lazy = Some(buf.clone());
            }

            let nelem = rt.stores[si].nelem;
            let class = &rt.classes[rt.stores[si].class_id];
            let mut body: &[u8] = &buf;
            let ninstances = decode::read_array_len(&mut body)?;
            if ninstances != nelem {
                return Err(FormatError::GroupSizeMismatch {
                    store: rt.stores[si].serial.clone(),
                    header: nelem,
                    group: ninstances,
                }
                .into());
            }
            for ann in doc.store_mut(slot).iter_mut() {
                parse_instance(&mut body, ann, class, &rt.stores, Some(nelem))?;
            }
            if !body.is_empty() {
                return Err(FormatError::TrailingBytes { count: body.len() }.into());
            }
        }

        debug!(
            "read document: {} classes, {} stores",
            rt.classes.len(),
            rt.stores.len()
        );
        doc.set_runtime(Runtime {
            schema: self.schema.clone(),
            rt,
        });
        Ok(Some(doc))
    }
}

/// After the first error the iterator is fused; the stream has no
/// resynchronization point.
impl<'a, R: Read> Iterator for Reader<'a, R> {
    type Item = Result<Doc>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        match self.read_doc() {
            Ok(Some(doc)) => Some(Ok(doc)),
            Ok(None) => None,
            Err(e) => {
                self.errored = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse one `<instance>` map onto a record. Lazy fields are copied
/// verbatim onto the record's slab, keyed by stream field id in stream
/// order; read-only fields are copied *and* decoded.
fn parse_instance(
    buf: &mut &[u8],
    record: &mut dyn Record,
    class: &RtClassSchema,
    stores: &[RtStoreSchema],
    self_len: Option<usize>,
) -> Result<()> {
    let nitems = decode::read_map_len(buf)?;
    let mut lazy_bytes = Vec::new();
    let mut lazy_nelem = 0usize;
    for _ in 0..nitems {
        let key = decode::read_uint(buf)?;
        let field = class
            .fields
            .get(key as usize)
            .ok_or(FormatError::FieldIdRange {
                id: key,
                nfields: class.fields.len(),
            })?;
        match field.slot {
            None => {
                encode::write_uint(&mut lazy_bytes, key);
                decode::copy_value(buf, &mut lazy_bytes)?;
                lazy_nelem += 1;
            }
            Some(slot) if field.in_slab => {
                encode::write_uint(&mut lazy_bytes, key);
                let start = lazy_bytes.len();
                decode::copy_value(buf, &mut lazy_bytes)?;
                lazy_nelem += 1;
                let mut copied: &[u8] = &lazy_bytes[start..];
                let value = decode_field(&mut copied, field, stores, self_len)?;
                record.set_field(slot, value);
            }
            Some(slot) => {
                let value = decode_field(buf, field, stores, self_len)?;
                record.set_field(slot, value);
            }
        }
    }
    if lazy_nelem != 0 {
        record.set_lazy_slab(LazySlab {
            bytes: lazy_bytes,
            nelem: lazy_nelem,
        });
    }
    Ok(())
}

/// Decode one field value per its kind. Self-pointers resolve against the
/// store currently being populated, independent of field name; ordinary
/// pointers resolve against the store back-filled from the header.
fn decode_field(
    buf: &mut &[u8],
    field: &RtFieldSchema,
    stores: &[RtStoreSchema],
    self_len: Option<usize>,
) -> Result<Value> {
    if field.is_pointer || field.is_self_pointer {
        let nelem = if field.is_self_pointer {
            self_len.unwrap_or(0)
        } else {
            let target = field
                .store_id
                .and_then(|id| stores.get(id))
                .ok_or_else(|| FormatError::PointerIntoLazyStore {
                    field: field.serial.clone(),
                })?;
            if target.is_lazy() {
                return Err(FormatError::PointerIntoLazyStore {
                    field: field.serial.clone(),
                }
                .into());
            }
            target.nelem
        };
        let check = |index: u64| -> Result<usize> {
            if index as usize >= nelem {
                Err(FormatError::PointerIndexRange { index, nelem }.into())
            } else {
                Ok(index as usize)
            }
        };

        if field.is_slice {
            let npair = decode::read_array_len(buf)?;
            if npair != 2 {
                return Err(FormatError::TupleSize {
                    expected: 2,
                    found: npair,
                }
                .into());
            }
            let start = decode::read_uint(buf)?;
            let count = decode::read_uint(buf)?;
            if count == 0 {
                return Err(FormatError::EmptySlice.into());
            }
            let last = start
                .checked_add(count - 1)
                .ok_or(FormatError::PointerIndexRange {
                    index: u64::MAX,
                    nelem,
                })?;
            Ok(Value::Slice(Slice::new(check(start)?, check(last)?)))
        } else if field.is_collection {
            let n = decode::read_array_len(buf)?;
            let mut indices = Vec::with_capacity(n);
            for _ in 0..n {
                indices.push(check(decode::read_uint(buf)?)?);
            }
            Ok(Value::Pointers(indices))
        } else {
            Ok(Value::Pointer(check(decode::read_uint(buf)?)?))
        }
    } else if field.is_byte_slice() {
        let npair = decode::read_array_len(buf)?;
        if npair != 2 {
            return Err(FormatError::TupleSize {
                expected: 2,
                found: npair,
            }
            .into());
        }
        let start = decode::read_uint(buf)?;
        let length = decode::read_uint(buf)?;
        Ok(Value::ByteSlice(ByteSlice::new(start, start.saturating_add(length))))
    } else {
        match field.prim {
            Some(FieldType::Str) => Ok(Value::Str(decode::read_str(buf)?)),
            Some(FieldType::Bool) => Ok(Value::Bool(decode::read_bool(buf)?)),
            Some(FieldType::U8) => Ok(Value::U8(decode::read_u8(buf)?)),
            Some(FieldType::U16) => Ok(Value::U16(decode::read_u16(buf)?)),
            Some(FieldType::U32) => Ok(Value::U32(decode::read_u32(buf)?)),
            Some(FieldType::U64) => Ok(Value::U64(decode::read_u64(buf)?)),
            Some(FieldType::I8) => Ok(Value::I8(decode::read_i8(buf)?)),
            Some(FieldType::I16) => Ok(Value::I16(decode::read_i16(buf)?)),
            Some(FieldType::I32) => Ok(Value::I32(decode::read_i32(buf)?)),
            Some(FieldType::I64) => Ok(Value::I64(decode::read_i64(buf)?)),
            Some(FieldType::F32) => Ok(Value::F32(decode::read_f32(buf)?)),
            Some(FieldType::F64) => Ok(Value::F64(decode::read_f64(buf)?)),
            None => Err(FormatError::UnexpectedType {
                expected: "primitive",
                found: "untyped field",
            }
            .into()),
        }
    }
}
