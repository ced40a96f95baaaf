//! The compact self-describing tagged binary format used for handshake
//!  payloads and for the inside of every encrypted frame, plus the message
//!  schemas built on top of it.
//!
//! Encoding and decoding are exact inverses for every legal field value.
//!  Decoding never trusts a declared length: each one is checked against the
//!  remaining buffer before it is consumed.

pub mod messages;
pub mod reader;
pub mod value;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated value: {needed} more bytes declared than buffered")]
    Truncated { needed: usize },

    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),

    #[error("invalid UTF-8 in string value")]
    InvalidUtf8,

    #[error("container nesting exceeds the supported depth")]
    DepthExceeded,

    #[error("schema mismatch: {0}")]
    Schema(&'static str),
}

/// Tag space of the binary format. Contiguous ranges carry their small
///  payload (integer value, length, count) in the tag byte itself.
pub(crate) mod tag {
    pub const TRUE: u8 = 0x01;
    pub const FALSE: u8 = 0x02;
    pub const TERMINATOR: u8 = 0x03;
    pub const NULL: u8 = 0x04;
    pub const UUID: u8 = 0x05;
    pub const DATE: u8 = 0x06;
    pub const INT_MINUS_ONE: u8 = 0x07;

    /// 0..=39 inline, value = tag - INT_INLINE_BASE
    pub const INT_INLINE_BASE: u8 = 0x08;
    pub const INT_INLINE_MAX: u8 = 0x2F;
    pub const INT8: u8 = 0x30;
    pub const INT16: u8 = 0x31;
    pub const INT32: u8 = 0x32;
    pub const INT64: u8 = 0x33;
    pub const FLOAT32: u8 = 0x35;
    pub const FLOAT64: u8 = 0x36;

    /// string length 0..=32 inline, length = tag - STRING_INLINE_BASE
    pub const STRING_INLINE_BASE: u8 = 0x40;
    pub const STRING_INLINE_MAX: u8 = 0x60;
    pub const STRING_LEN8: u8 = 0x61;
    pub const STRING_LEN16: u8 = 0x62;
    pub const STRING_LEN32: u8 = 0x63;
    pub const STRING_LEN64: u8 = 0x64;
    pub const STRING_NULL_TERMINATED: u8 = 0x6F;

    /// data length 0..=32 inline, length = tag - DATA_INLINE_BASE
    pub const DATA_INLINE_BASE: u8 = 0x70;
    pub const DATA_INLINE_MAX: u8 = 0x90;
    pub const DATA_LEN8: u8 = 0x91;
    pub const DATA_LEN16: u8 = 0x92;
    pub const DATA_LEN32: u8 = 0x93;
    pub const DATA_LEN64: u8 = 0x94;

    /// array count 0..=14 inline
    pub const ARRAY_INLINE_BASE: u8 = 0xD0;
    pub const ARRAY_INLINE_MAX: u8 = 0xDE;
    pub const ARRAY_TERMINATED: u8 = 0xDF;

    /// dictionary count 0..=14 inline
    pub const DICT_INLINE_BASE: u8 = 0xE0;
    pub const DICT_INLINE_MAX: u8 = 0xEE;
    pub const DICT_TERMINATED: u8 = 0xEF;

    pub const INT_INLINE_LIMIT: i64 = 39;
    pub const INLINE_LEN_LIMIT: usize = 32;
    pub const INLINE_COUNT_LIMIT: usize = 14;
}
