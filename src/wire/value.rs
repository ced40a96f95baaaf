//! Value model and encoder. The encoder always selects the narrowest integer
//!  and length form that covers the value; the one deliberate exception is
//!  [`encode_data_u32_len`], which keeps the fixed 32-bit length form the wire
//!  protocol mandates for media chunk blobs.

use bytes::{BufMut, Bytes, BytesMut};

use super::tag;
use crate::safe_converter::PrecheckedCast;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Null,
    Uuid([u8; 16]),
    Date(f64),
    Int(i64),
    Float(f64),
    String(String),
    Data(Bytes),
    Array(Vec<Value>),
    Dict(Vec<(String, Value)>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_data(&self) -> Option<&Bytes> {
        match self {
            Value::Data(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

pub fn encode(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Bool(true) => buf.put_u8(tag::TRUE),
        Value::Bool(false) => buf.put_u8(tag::FALSE),
        Value::Null => buf.put_u8(tag::NULL),
        Value::Uuid(bytes) => {
            buf.put_u8(tag::UUID);
            buf.put_slice(bytes);
        }
        Value::Date(seconds) => {
            buf.put_u8(tag::DATE);
            buf.put_f64_le(*seconds);
        }
        Value::Int(v) => encode_int(*v, buf),
        Value::Float(v) => {
            buf.put_u8(tag::FLOAT64);
            buf.put_f64_le(*v);
        }
        Value::String(s) => encode_string(s, buf),
        Value::Data(d) => encode_data(d, buf),
        Value::Array(elements) => {
            encode_array_header(elements.len(), buf);
            for element in elements {
                encode(element, buf);
            }
            if elements.len() > tag::INLINE_COUNT_LIMIT {
                buf.put_u8(tag::TERMINATOR);
            }
        }
        Value::Dict(members) => {
            encode_dict_header(members.len(), buf);
            for (key, value) in members {
                encode_string(key, buf);
                encode(value, buf);
            }
            if members.len() > tag::INLINE_COUNT_LIMIT {
                buf.put_u8(tag::TERMINATOR);
            }
        }
    }
}

/// Narrowest-width integer encoding: inline tag, then int8/16/32/64.
pub fn encode_int(v: i64, buf: &mut BytesMut) {
    if v == -1 {
        buf.put_u8(tag::INT_MINUS_ONE);
    } else if (0..=tag::INT_INLINE_LIMIT).contains(&v) {
        buf.put_u8(tag::INT_INLINE_BASE + v as u8);
    } else if let Ok(v) = i8::try_from(v) {
        buf.put_u8(tag::INT8);
        buf.put_i8(v);
    } else if let Ok(v) = i16::try_from(v) {
        buf.put_u8(tag::INT16);
        buf.put_i16_le(v);
    } else if let Ok(v) = i32::try_from(v) {
        buf.put_u8(tag::INT32);
        buf.put_i32_le(v);
    } else {
        buf.put_u8(tag::INT64);
        buf.put_i64_le(v);
    }
}

pub(crate) fn encode_string(s: &str, buf: &mut BytesMut) {
    let len = s.len();
    if len <= tag::INLINE_LEN_LIMIT {
        buf.put_u8(tag::STRING_INLINE_BASE + len as u8);
    } else if let Ok(len) = u8::try_from(len) {
        buf.put_u8(tag::STRING_LEN8);
        buf.put_u8(len);
    } else if let Ok(len) = u16::try_from(len) {
        buf.put_u8(tag::STRING_LEN16);
        buf.put_u16_le(len);
    } else if let Ok(len) = u32::try_from(len) {
        buf.put_u8(tag::STRING_LEN32);
        buf.put_u32_le(len);
    } else {
        buf.put_u8(tag::STRING_LEN64);
        buf.put_u64_le(len as u64);
    }
    buf.put_slice(s.as_bytes());
}

pub(crate) fn encode_data(d: &[u8], buf: &mut BytesMut) {
    let len = d.len();
    if len <= tag::INLINE_LEN_LIMIT {
        buf.put_u8(tag::DATA_INLINE_BASE + len as u8);
    } else if let Ok(len) = u8::try_from(len) {
        buf.put_u8(tag::DATA_LEN8);
        buf.put_u8(len);
    } else if let Ok(len) = u16::try_from(len) {
        buf.put_u8(tag::DATA_LEN16);
        buf.put_u16_le(len);
    } else if let Ok(len) = u32::try_from(len) {
        buf.put_u8(tag::DATA_LEN32);
        buf.put_u32_le(len);
    } else {
        buf.put_u8(tag::DATA_LEN64);
        buf.put_u64_le(len as u64);
    }
    buf.put_slice(d);
}

/// Fixed 32-bit length form, regardless of the blob's actual size. The chunk
///  blob of every data event is encoded this way on the wire; keep it that way
///  even where a narrower form would fit.
pub(crate) fn encode_data_u32_len(d: &[u8], buf: &mut BytesMut) {
    buf.put_u8(tag::DATA_LEN32);
    buf.put_u32_le(d.len().prechecked_cast());
    buf.put_slice(d);
}

pub(crate) fn encode_array_header(count: usize, buf: &mut BytesMut) {
    if count <= tag::INLINE_COUNT_LIMIT {
        buf.put_u8(tag::ARRAY_INLINE_BASE + count as u8);
    } else {
        buf.put_u8(tag::ARRAY_TERMINATED);
    }
}

pub(crate) fn encode_dict_header(count: usize, buf: &mut BytesMut) {
    if count <= tag::INLINE_COUNT_LIMIT {
        buf.put_u8(tag::DICT_INLINE_BASE + count as u8);
    } else {
        buf.put_u8(tag::DICT_TERMINATED);
    }
}
