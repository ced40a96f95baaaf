//! Defensive decoder for the tagged binary format. All input reaching this
//!  module is attacker-controlled network data: every declared length is
//!  validated against the remaining buffer before anything is consumed, and
//!  container nesting is depth-limited.

use bytes::Bytes;

use super::tag;
use super::value::Value;
use super::WireError;

const MAX_DEPTH: usize = 16;

pub struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Reader<'a> {
        Reader { input }
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    pub fn read_value(&mut self) -> Result<Value, WireError> {
        self.value(0)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if n > self.input.len() {
            return Err(WireError::Truncated { needed: n - self.input.len() });
        }
        let (head, rest) = self.input.split_at(n);
        self.input = rest;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn peek_u8(&self) -> Result<u8, WireError> {
        self.input.first().copied().ok_or(WireError::Truncated { needed: 1 })
    }

    /// Explicit-width length field (u8/u16/u32/u64, little-endian), validated
    ///  against the remaining buffer by the caller's subsequent `take`.
    fn length_field(&mut self, width: usize) -> Result<usize, WireError> {
        let raw = self.take(width)?;
        let mut value: u64 = 0;
        for (i, byte) in raw.iter().enumerate() {
            value |= (*byte as u64) << (8 * i);
        }
        usize::try_from(value).map_err(|_| WireError::Truncated { needed: usize::MAX })
    }

    fn value(&mut self, depth: usize) -> Result<Value, WireError> {
        if depth > MAX_DEPTH {
            return Err(WireError::DepthExceeded);
        }

        let tag_byte = self.take_u8()?;
        match tag_byte {
            tag::TRUE => Ok(Value::Bool(true)),
            tag::FALSE => Ok(Value::Bool(false)),
            tag::NULL => Ok(Value::Null),
            tag::UUID => {
                let raw = self.take(16)?;
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(raw);
                Ok(Value::Uuid(uuid))
            }
            tag::DATE => {
                let raw = self.take(8)?;
                Ok(Value::Date(f64::from_le_bytes(raw.try_into().expect("take returned 8 bytes"))))
            }
            tag::INT_MINUS_ONE => Ok(Value::Int(-1)),
            tag::INT_INLINE_BASE..=tag::INT_INLINE_MAX => {
                Ok(Value::Int((tag_byte - tag::INT_INLINE_BASE) as i64))
            }
            tag::INT8 => Ok(Value::Int(self.take_u8()? as i8 as i64)),
            tag::INT16 => {
                let raw = self.take(2)?;
                Ok(Value::Int(i16::from_le_bytes(raw.try_into().expect("take returned 2 bytes")) as i64))
            }
            tag::INT32 => {
                let raw = self.take(4)?;
                Ok(Value::Int(i32::from_le_bytes(raw.try_into().expect("take returned 4 bytes")) as i64))
            }
            tag::INT64 => {
                let raw = self.take(8)?;
                Ok(Value::Int(i64::from_le_bytes(raw.try_into().expect("take returned 8 bytes"))))
            }
            tag::FLOAT32 => {
                let raw = self.take(4)?;
                Ok(Value::Float(f32::from_le_bytes(raw.try_into().expect("take returned 4 bytes")) as f64))
            }
            tag::FLOAT64 => {
                let raw = self.take(8)?;
                Ok(Value::Float(f64::from_le_bytes(raw.try_into().expect("take returned 8 bytes"))))
            }
            tag::STRING_INLINE_BASE..=tag::STRING_INLINE_MAX => {
                let len = (tag_byte - tag::STRING_INLINE_BASE) as usize;
                self.string_of(len)
            }
            tag::STRING_LEN8 => {
                let len = self.length_field(1)?;
                self.string_of(len)
            }
            tag::STRING_LEN16 => {
                let len = self.length_field(2)?;
                self.string_of(len)
            }
            tag::STRING_LEN32 => {
                let len = self.length_field(4)?;
                self.string_of(len)
            }
            tag::STRING_LEN64 => {
                let len = self.length_field(8)?;
                self.string_of(len)
            }
            tag::STRING_NULL_TERMINATED => {
                let end = self
                    .input
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(WireError::Truncated { needed: 1 })?;
                let raw = self.take(end)?;
                self.take(1)?;
                let s = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;
                Ok(Value::String(s.to_owned()))
            }
            tag::DATA_INLINE_BASE..=tag::DATA_INLINE_MAX => {
                let len = (tag_byte - tag::DATA_INLINE_BASE) as usize;
                Ok(Value::Data(Bytes::copy_from_slice(self.take(len)?)))
            }
            tag::DATA_LEN8 => {
                let len = self.length_field(1)?;
                Ok(Value::Data(Bytes::copy_from_slice(self.take(len)?)))
            }
            tag::DATA_LEN16 => {
                let len = self.length_field(2)?;
                Ok(Value::Data(Bytes::copy_from_slice(self.take(len)?)))
            }
            tag::DATA_LEN32 => {
                let len = self.length_field(4)?;
                Ok(Value::Data(Bytes::copy_from_slice(self.take(len)?)))
            }
            tag::DATA_LEN64 => {
                let len = self.length_field(8)?;
                Ok(Value::Data(Bytes::copy_from_slice(self.take(len)?)))
            }
            tag::ARRAY_INLINE_BASE..=tag::ARRAY_INLINE_MAX => {
                let count = (tag_byte - tag::ARRAY_INLINE_BASE) as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    elements.push(self.value(depth + 1)?);
                }
                Ok(Value::Array(elements))
            }
            tag::ARRAY_TERMINATED => {
                let mut elements = Vec::new();
                while self.peek_u8()? != tag::TERMINATOR {
                    elements.push(self.value(depth + 1)?);
                }
                self.take(1)?;
                Ok(Value::Array(elements))
            }
            tag::DICT_INLINE_BASE..=tag::DICT_INLINE_MAX => {
                let count = (tag_byte - tag::DICT_INLINE_BASE) as usize;
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    members.push(self.member(depth)?);
                }
                Ok(Value::Dict(members))
            }
            tag::DICT_TERMINATED => {
                let mut members = Vec::new();
                while self.peek_u8()? != tag::TERMINATOR {
                    members.push(self.member(depth)?);
                }
                self.take(1)?;
                Ok(Value::Dict(members))
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }

    fn member(&mut self, depth: usize) -> Result<(String, Value), WireError> {
        let key = match self.value(depth + 1)? {
            Value::String(key) => key,
            _ => return Err(WireError::Schema("dictionary key must be a string")),
        };
        let value = self.value(depth + 1)?;
        Ok((key, value))
    }

    fn string_of(&mut self, len: usize) -> Result<Value, WireError> {
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;
        Ok(Value::String(s.to_owned()))
    }
}
