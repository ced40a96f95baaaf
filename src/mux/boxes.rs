//! Byte-buffer builder for nested container boxes.
//!
//! Boxes are opened with [`BoxWriter::begin_box`], which reserves the 4-byte
//!  size field, and closed innermost-first with [`BoxWriter::end_box`], which
//!  back-patches the size once the content length is known. All appends are
//!  bounds-checked by the underlying buffer; there is no raw pointer stack.

use bytes::{BufMut, Bytes, BytesMut};

use crate::safe_converter::PrecheckedCast;

#[derive(Debug)]
#[must_use = "an opened box must be closed with end_box"]
pub struct BoxMarker {
    size_field: usize,
}

pub struct BoxWriter {
    buf: BytesMut,
    open: Vec<usize>,
}

impl BoxWriter {
    pub fn with_capacity(capacity: usize) -> BoxWriter {
        BoxWriter { buf: BytesMut::with_capacity(capacity), open: Vec::new() }
    }

    pub fn begin_box(&mut self, fourcc: &[u8; 4]) -> BoxMarker {
        let size_field = self.buf.len();
        self.open.push(size_field);
        self.buf.put_u32(0);
        self.buf.put_slice(fourcc);
        BoxMarker { size_field }
    }

    /// Box with the leading version/flags word.
    pub fn begin_full_box(&mut self, fourcc: &[u8; 4], version: u8, flags: u32) -> BoxMarker {
        let marker = self.begin_box(fourcc);
        self.buf.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
        marker
    }

    pub fn end_box(&mut self, marker: BoxMarker) {
        let innermost = self
            .open
            .pop()
            .expect("this is a bug: end_box without a matching begin_box");
        assert_eq!(
            innermost, marker.size_field,
            "this is a bug: boxes must be closed innermost-first"
        );
        let size = self.buf.len() - marker.size_field;
        self.patch_u32_at(marker.size_field, size.prechecked_cast());
    }

    /// Current write position, usable with [`BoxWriter::patch_u32_at`] for
    ///  fields whose value is only known later (e.g. run data offsets).
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn patch_u32_at(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn put_slice(&mut self, slice: &[u8]) {
        self.buf.put_slice(slice);
    }

    pub fn put_zeros(&mut self, count: usize) {
        self.buf.put_bytes(0, count);
    }

    pub fn finish(self) -> Bytes {
        assert!(self.open.is_empty(), "this is a bug: {} box(es) left open", self.open.len());
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_is_back_patched() {
        let mut writer = BoxWriter::with_capacity(64);
        let marker = writer.begin_box(b"test");
        writer.put_slice(b"payload!");
        writer.end_box(marker);

        let bytes = writer.finish();
        assert_eq!(&bytes[..4], &16u32.to_be_bytes());
        assert_eq!(&bytes[4..8], b"test");
        assert_eq!(&bytes[8..], b"payload!");
    }

    #[test]
    fn test_nested_boxes_patch_outer_last() {
        let mut writer = BoxWriter::with_capacity(64);
        let outer = writer.begin_box(b"moov");
        let inner = writer.begin_full_box(b"mvhd", 1, 3);
        writer.put_u32(0xAABBCCDD);
        writer.end_box(inner);
        writer.end_box(outer);

        let bytes = writer.finish();
        assert_eq!(&bytes[..4], &24u32.to_be_bytes());
        assert_eq!(&bytes[8..12], &16u32.to_be_bytes());
        assert_eq!(&bytes[16..20], &[1, 0, 0, 3]);
    }

    #[test]
    #[should_panic(expected = "innermost-first")]
    fn test_misnested_close_is_a_bug() {
        let mut writer = BoxWriter::with_capacity(64);
        let outer = writer.begin_box(b"out ");
        let _inner = writer.begin_box(b"in  ");
        writer.end_box(outer);
    }

    #[test]
    #[should_panic(expected = "left open")]
    fn test_unclosed_box_is_a_bug() {
        let mut writer = BoxWriter::with_capacity(64);
        let _marker = writer.begin_box(b"test");
        let _ = writer.finish();
    }

    #[test]
    fn test_patch_at_recorded_position() {
        let mut writer = BoxWriter::with_capacity(64);
        let marker = writer.begin_box(b"trun");
        let offset_field = writer.position();
        writer.put_u32(0);
        writer.end_box(marker);
        writer.patch_u32_at(offset_field, 4711);

        let bytes = writer.finish();
        assert_eq!(&bytes[8..12], &4711u32.to_be_bytes());
    }
}
