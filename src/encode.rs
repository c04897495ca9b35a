//! Write-side codec primitives: canonical MessagePack scalars and
//! array/map headers, serialized onto a byte vector.
//!
//! Every value is encoded in as few bytes as possible, so a given input
//! always produces the same output bytes.

use crate::marker::Marker;

pub fn write_nil(buf: &mut Vec<u8>) {
    buf.push(Marker::Nil.into());
}

pub fn write_bool(buf: &mut Vec<u8>, v: bool) {
    buf.push(if v { Marker::True } else { Marker::False }.into());
}

/// Write an unsigned integer using the shortest unsigned encoding.
pub fn write_uint(buf: &mut Vec<u8>, v: u64) {
    if v <= 127 {
        buf.push(Marker::PosFixInt(v as u8).into());
    } else if v <= u8::MAX as u64 {
        buf.push(Marker::UInt8.into());
        buf.push(v as u8);
    } else if v <= u16::MAX as u64 {
        buf.push(Marker::UInt16.into());
        buf.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= u32::MAX as u64 {
        buf.push(Marker::UInt32.into());
        buf.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        buf.push(Marker::UInt64.into());
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

/// Write a signed integer. Non-negative values use the unsigned encodings
/// so that a given number always has exactly one representation.
pub fn write_int(buf: &mut Vec<u8>, v: i64) {
    if v >= 0 {
        write_uint(buf, v as u64);
    } else if v >= -32 {
        buf.push(Marker::NegFixInt(v as i8).into());
    } else if v >= i8::MIN as i64 {
        buf.push(Marker::Int8.into());
        buf.push(v as u8);
    } else if v >= i16::MIN as i64 {
        buf.push(Marker::Int16.into());
        buf.extend_from_slice(&(v as i16).to_be_bytes());
    } else if v >= i32::MIN as i64 {
        buf.push(Marker::Int32.into());
        buf.extend_from_slice(&(v as i32).to_be_bytes());
    } else {
        buf.push(Marker::Int64.into());
        buf.extend_from_slice(&v.to_be_bytes());
    }
}

pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.push(Marker::F32.into());
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    buf.push(Marker::F64.into());
    buf.extend_from_slice(&v.to_bits().to_be_bytes());
}

pub fn write_str(buf: &mut Vec<u8>, v: &str) {
    let len = v.len();
    assert!(len <= u32::MAX as usize);
    if len <= 31 {
        buf.push(Marker::FixStr(len as u8).into());
    } else if len <= u8::MAX as usize {
        buf.push(Marker::Str8.into());
        buf.push(len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(Marker::Str16.into());
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(Marker::Str32.into());
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
    buf.extend_from_slice(v.as_bytes());
}

pub fn write_array_len(buf: &mut Vec<u8>, len: usize) {
    assert!(len <= u32::MAX as usize);
    if len <= 15 {
        buf.push(Marker::FixArray(len as u8).into());
    } else if len <= u16::MAX as usize {
        buf.push(Marker::Array16.into());
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(Marker::Array32.into());
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
}

pub fn write_map_len(buf: &mut Vec<u8>, len: usize) {
    assert!(len <= u32::MAX as usize);
    if len <= 15 {
        buf.push(Marker::FixMap(len as u8).into());
    } else if len <= u16::MAX as usize {
        buf.push(Marker::Map16.into());
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(Marker::Map32.into());
        buf.extend_from_slice(&(len as u32).to_be_bytes());
    }
}
