//! Read-side codec primitives over any [`std::io::Read`] source.
//!
//! Typed reads fail when the next value is not of the requested wire type
//! or does not fit the requested width; nothing is ever coerced.
//! [`copy_value`] transfers one encoded value verbatim, which is how lazy
//! data crosses a reader without being interpreted.

use std::convert::TryFrom;
use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt};

use crate::error::{FormatError, Result};
use crate::marker::Marker;

fn marker_name(marker: Marker) -> &'static str {
    use self::Marker::*;
    match marker {
        PosFixInt(_) | UInt8 | UInt16 | UInt32 | UInt64 => "unsigned integer",
        NegFixInt(_) | Int8 | Int16 | Int32 | Int64 => "signed integer",
        FixMap(_) | Map16 | Map32 => "map",
        FixArray(_) | Array16 | Array32 => "array",
        FixStr(_) | Str8 | Str16 | Str32 => "string",
        Nil => "nil",
        Reserved => "reserved",
        False | True => "boolean",
        Bin8 | Bin16 | Bin32 => "binary",
        Ext8 | Ext16 | Ext32 | FixExt1 | FixExt2 | FixExt4 | FixExt8 | FixExt16 => "extension",
        F32 => "f32",
        F64 => "f64",
    }
}

fn unexpected(expected: &'static str, found: Marker) -> FormatError {
    FormatError::UnexpectedType {
        expected,
        found: marker_name(found),
    }
}

pub fn read_marker<R: Read>(r: &mut R) -> Result<Marker> {
    Ok(Marker::from_u8(r.read_u8()?))
}

/// Read an unsigned integer. Fails unless the next value uses one of the
/// unsigned encodings.
pub fn read_uint<R: Read>(r: &mut R) -> Result<u64> {
    let marker = read_marker(r)?;
    Ok(match marker {
        Marker::PosFixInt(v) => v as u64,
        Marker::UInt8 => r.read_u8()? as u64,
        Marker::UInt16 => r.read_u16::<BigEndian>()? as u64,
        Marker::UInt32 => r.read_u32::<BigEndian>()? as u64,
        Marker::UInt64 => r.read_u64::<BigEndian>()?,
        other => return Err(unexpected("unsigned integer", other).into()),
    })
}

/// Read a signed integer. Accepts both integer encoding families, since
/// non-negative values are always written unsigned.
pub fn read_int<R: Read>(r: &mut R) -> Result<i64> {
    let marker = read_marker(r)?;
    Ok(match marker {
        Marker::PosFixInt(v) => v as i64,
        Marker::NegFixInt(v) => v as i64,
        Marker::UInt8 => r.read_u8()? as i64,
        Marker::UInt16 => r.read_u16::<BigEndian>()? as i64,
        Marker::UInt32 => r.read_u32::<BigEndian>()? as i64,
        Marker::UInt64 => {
            let v = r.read_u64::<BigEndian>()?;
            i64::try_from(v).map_err(|_| FormatError::IntOutOfRange { ty: "i64" })?
        }
        Marker::Int8 => r.read_i8()? as i64,
        Marker::Int16 => r.read_i16::<BigEndian>()? as i64,
        Marker::Int32 => r.read_i32::<BigEndian>()? as i64,
        Marker::Int64 => r.read_i64::<BigEndian>()?,
        other => return Err(unexpected("integer", other).into()),
    })
}

macro_rules! read_uint_as {
    ($name:ident, $ty:ty) => {
        /// Read an unsigned integer and fail if it does not fit the width.
        pub fn $name<R: Read>(r: &mut R) -> Result<$ty> {
            let v = read_uint(r)?;
            <$ty>::try_from(v).map_err(|_| {
                FormatError::IntOutOfRange {
                    ty: stringify!($ty),
                }
                .into()
            })
        }
    };
}

macro_rules! read_int_as {
    ($name:ident, $ty:ty) => {
        /// Read a signed integer and fail if it does not fit the width.
        pub fn $name<R: Read>(r: &mut R) -> Result<$ty> {
            let v = read_int(r)?;
            <$ty>::try_from(v).map_err(|_| {
                FormatError::IntOutOfRange {
                    ty: stringify!($ty),
                }
                .into()
            })
        }
    };
}

read_uint_as!(read_u8, u8);
read_uint_as!(read_u16, u16);
read_uint_as!(read_u32, u32);
read_int_as!(read_i8, i8);
read_int_as!(read_i16, i16);
read_int_as!(read_i32, i32);

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    read_uint(r)
}

pub fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    read_int(r)
}

pub fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
    match read_marker(r)? {
        Marker::True => Ok(true),
        Marker::False => Ok(false),
        other => Err(unexpected("boolean", other).into()),
    }
}

pub fn read_nil<R: Read>(r: &mut R) -> Result<()> {
    match read_marker(r)? {
        Marker::Nil => Ok(()),
        other => Err(unexpected("nil", other).into()),
    }
}

pub fn read_f32<R: Read>(r: &mut R) -> Result<f32> {
    match read_marker(r)? {
        Marker::F32 => Ok(f32::from_bits(r.read_u32::<BigEndian>()?)),
        other => Err(unexpected("f32", other).into()),
    }
}

pub fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    match read_marker(r)? {
        Marker::F64 => Ok(f64::from_bits(r.read_u64::<BigEndian>()?)),
        other => Err(unexpected("f64", other).into()),
    }
}

pub fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let marker = read_marker(r)?;
    let len = match marker {
        Marker::FixStr(len) => len as usize,
        Marker::Str8 => r.read_u8()? as usize,
        Marker::Str16 => r.read_u16::<BigEndian>()? as usize,
        Marker::Str32 => r.read_u32::<BigEndian>()? as usize,
        other => return Err(unexpected("string", other).into()),
    };
    let raw = read_exact_vec(r, len)?;
    String::from_utf8(raw).map_err(|_| FormatError::BadUtf8.into())
}

pub fn read_array_len<R: Read>(r: &mut R) -> Result<usize> {
    let marker = read_marker(r)?;
    Ok(match marker {
        Marker::FixArray(len) => len as usize,
        Marker::Array16 => r.read_u16::<BigEndian>()? as usize,
        Marker::Array32 => r.read_u32::<BigEndian>()? as usize,
        other => return Err(unexpected("array", other).into()),
    })
}

pub fn read_map_len<R: Read>(r: &mut R) -> Result<usize> {
    let marker = read_marker(r)?;
    Ok(match marker {
        Marker::FixMap(len) => len as usize,
        Marker::Map16 => r.read_u16::<BigEndian>()? as usize,
        Marker::Map32 => r.read_u32::<BigEndian>()? as usize,
        other => return Err(unexpected("map", other).into()),
    })
}

/// Read exactly `len` bytes into a fresh vector.
pub fn read_exact_vec<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn copy_exact<R: Read>(r: &mut R, out: &mut Vec<u8>, len: usize) -> Result<()> {
    let start = out.len();
    out.resize(start + len, 0);
    r.read_exact(&mut out[start..])?;
    Ok(())
}

/// Copy one encoded value from `r` onto `out` byte-for-byte, without
/// interpreting it. Container contents are walked structurally; every
/// marker class is accepted, since lazy data may carry types this crate
/// never produces itself.
pub fn copy_value<R: Read>(r: &mut R, out: &mut Vec<u8>) -> Result<()> {
    let byte = r.read_u8()?;
    out.push(byte);
    match Marker::from_u8(byte) {
        Marker::PosFixInt(_)
        | Marker::NegFixInt(_)
        | Marker::Nil
        | Marker::False
        | Marker::True => Ok(()),
        Marker::FixMap(n) => {
            for _ in 0..(2 * n as usize) {
                copy_value(r, out)?;
            }
            Ok(())
        }
        Marker::FixArray(n) => {
            for _ in 0..n as usize {
                copy_value(r, out)?;
            }
            Ok(())
        }
        Marker::FixStr(n) => copy_exact(r, out, n as usize),
        Marker::UInt8 | Marker::Int8 => copy_exact(r, out, 1),
        Marker::UInt16 | Marker::Int16 => copy_exact(r, out, 2),
        Marker::UInt32 | Marker::Int32 | Marker::F32 => copy_exact(r, out, 4),
        Marker::UInt64 | Marker::Int64 | Marker::F64 => copy_exact(r, out, 8),
        Marker::Str8 | Marker::Bin8 => {
            let len = r.read_u8()?;
            out.push(len);
            copy_exact(r, out, len as usize)
        }
        Marker::Str16 | Marker::Bin16 => {
            let len = r.read_u16::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            copy_exact(r, out, len as usize)
        }
        Marker::Str32 | Marker::Bin32 => {
            let len = r.read_u32::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            copy_exact(r, out, len as usize)
        }
        Marker::Ext8 => {
            let len = r.read_u8()?;
            out.push(len);
            copy_exact(r, out, len as usize + 1)
        }
        Marker::Ext16 => {
            let len = r.read_u16::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            copy_exact(r, out, len as usize + 1)
        }
        Marker::Ext32 => {
            let len = r.read_u32::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            copy_exact(r, out, len as usize + 1)
        }
        Marker::FixExt1 => copy_exact(r, out, 2),
        Marker::FixExt2 => copy_exact(r, out, 3),
        Marker::FixExt4 => copy_exact(r, out, 5),
        Marker::FixExt8 => copy_exact(r, out, 9),
        Marker::FixExt16 => copy_exact(r, out, 17),
        Marker::Array16 => {
            let len = r.read_u16::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            for _ in 0..len as usize {
                copy_value(r, out)?;
            }
            Ok(())
        }
        Marker::Array32 => {
            let len = r.read_u32::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            for _ in 0..len as usize {
                copy_value(r, out)?;
            }
            Ok(())
        }
        Marker::Map16 => {
            let len = r.read_u16::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            for _ in 0..(2 * len as usize) {
                copy_value(r, out)?;
            }
            Ok(())
        }
        Marker::Map32 => {
            let len = r.read_u32::<BigEndian>()?;
            out.extend_from_slice(&len.to_be_bytes());
            for _ in 0..(2 * len as usize) {
                copy_value(r, out)?;
            }
            Ok(())
        }
        Marker::Reserved => Err(FormatError::BadMarker { byte }.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::encode;

    #[test]
    fn uint_round_trip() {
        for v in [0u64, 1, 127, 128, 255, 256, 65535, 65536, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            encode::write_uint(&mut buf, v);
            assert_eq!(read_uint(&mut buf.as_slice()).unwrap(), v);
        }
    }

    #[test]
    fn int_round_trip() {
        for v in [0i64, -1, -32, -33, -128, -129, -32768, -32769, i64::MIN, i64::MAX] {
            let mut buf = Vec::new();
            encode::write_int(&mut buf, v);
            assert_eq!(read_int(&mut buf.as_slice()).unwrap(), v);
        }
    }

    #[test]
    fn typed_reads_check_range() {
        let mut buf = Vec::new();
        encode::write_uint(&mut buf, 256);
        assert!(read_u8(&mut buf.as_slice()).is_err());

        let mut buf = Vec::new();
        encode::write_int(&mut buf, -129);
        assert!(read_i8(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn typed_reads_reject_wrong_type() {
        let mut buf = Vec::new();
        encode::write_str(&mut buf, "nope");
        assert!(read_uint(&mut buf.as_slice()).is_err());

        let mut buf = Vec::new();
        encode::write_bool(&mut buf, true);
        assert!(read_str(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn str_round_trip() {
        for s in ["", "The", &"x".repeat(40)] {
            let mut buf = Vec::new();
            encode::write_str(&mut buf, s);
            assert_eq!(read_str(&mut buf.as_slice()).unwrap(), s);
        }
    }

    #[test]
    fn copy_value_is_verbatim() {
        // A map holding a string, a nested array, a negative int, and a
        // binary value this crate never writes itself.
        let data: Vec<u8> = vec![
            0x82, // map of 2
            0x00, 0x92, 0xa1, b'a', 0xe0, // 0 => ["a", -32]
            0x01, 0xc4, 0x03, 0xde, 0xad, 0xbe, // 1 => bin
        ];
        let mut src = data.as_slice();
        let mut out = Vec::new();
        copy_value(&mut src, &mut out).unwrap();
        assert!(src.is_empty());
        assert_eq!(out, data);
    }

    #[test]
    fn copy_value_rejects_reserved() {
        let data = [0xc1u8];
        let mut out = Vec::new();
        assert!(copy_value(&mut data.as_slice(), &mut out).is_err());
    }

    #[test]
    fn truncated_value_fails() {
        let data = [0xa5u8, b'a', b'b']; // fixstr of 5 with 2 bytes present
        assert!(read_str(&mut data.as_slice()).is_err());
    }
}
