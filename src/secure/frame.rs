//! Per-connection encrypted framing over a byte stream.
//!
//! ```ascii
//! 0: frame type (u8)
//! 1: ciphertext length (u24, big-endian)
//! 4: ciphertext[length]
//! *: authentication tag (16 bytes)
//! ```
//!
//! The 4-byte header is the frame's additional authenticated data. Nonces are
//!  12 bytes, 4 zero bytes followed by a u64 little-endian counter that is
//!  independent per direction, starts at 0 and strictly increases for the life
//!  of the connection. Decoding fails closed: an authentication mismatch
//!  reports an error and no recovery is attempted.

use aead::{Aead, KeyInit, Payload};
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::error;

use super::keys::SuiteKeys;
use crate::error::UplinkError;

pub const FRAME_HEADER_LEN: usize = 4;
pub const FRAME_TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    /// Tagged-binary message payload (handshake and data exchange alike).
    Message = 1,
}

pub struct SecureFrameChannel {
    send_cipher: ChaCha20Poly1305,
    recv_cipher: ChaCha20Poly1305,
    send_nonce: u64,
    recv_nonce: u64,
    max_payload: usize,
}

impl SecureFrameChannel {
    /// Channel as seen from the accessory: sends with the
    ///  accessory-to-controller key, receives with the other one.
    pub fn accessory(keys: &SuiteKeys, max_payload: usize) -> SecureFrameChannel {
        match keys {
            SuiteKeys::ChaCha20Poly1305(keys) => SecureFrameChannel::new(
                &keys.accessory_to_controller,
                &keys.controller_to_accessory,
                max_payload,
            ),
        }
    }

    /// The controller's view of the same channel (used by tests and
    ///  simulations driving the peer side).
    pub fn controller(keys: &SuiteKeys, max_payload: usize) -> SecureFrameChannel {
        match keys {
            SuiteKeys::ChaCha20Poly1305(keys) => SecureFrameChannel::new(
                &keys.controller_to_accessory,
                &keys.accessory_to_controller,
                max_payload,
            ),
        }
    }

    fn new(send_key: &[u8; 32], recv_key: &[u8; 32], max_payload: usize) -> SecureFrameChannel {
        SecureFrameChannel {
            send_cipher: ChaCha20Poly1305::new(Key::from_slice(send_key)),
            recv_cipher: ChaCha20Poly1305::new(Key::from_slice(recv_key)),
            send_nonce: 0,
            recv_nonce: 0,
            max_payload,
        }
    }

    /// Next outbound nonce counter value (also the number of frames sent).
    pub fn send_nonce(&self) -> u64 {
        self.send_nonce
    }

    /// Next expected inbound nonce counter value.
    pub fn recv_nonce(&self) -> u64 {
        self.recv_nonce
    }

    /// Total frame length once the 4 header bytes are buffered, `None` while
    ///  even the header is incomplete. The consumer uses this to know when a
    ///  partial frame has been fully assembled.
    pub fn complete_frame_len(buf: &[u8], max_payload: usize) -> Result<Option<usize>, UplinkError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let declared = u24_be(&buf[1..4]);
        if declared > max_payload {
            return Err(UplinkError::Framing("declared frame length exceeds the configured bound"));
        }
        Ok(Some(FRAME_HEADER_LEN + declared + FRAME_TAG_LEN))
    }

    pub fn encode_frame(&mut self, frame_type: FrameType, plaintext: &[u8]) -> Result<Bytes, UplinkError> {
        if plaintext.len() > self.max_payload {
            return Err(UplinkError::Framing("frame payload exceeds the configured bound"));
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = frame_type.into();
        header[1] = (plaintext.len() >> 16) as u8;
        header[2] = (plaintext.len() >> 8) as u8;
        header[3] = plaintext.len() as u8;

        let nonce = counter_nonce(self.send_nonce);
        let ciphertext = match self.send_cipher.encrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: &header },
        ) {
            Ok(ciphertext) => ciphertext,
            Err(e) => {
                error!("encryption error: {}", e);
                panic!("encryption error");
            }
        };
        self.send_nonce += 1;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + ciphertext.len());
        buf.put_slice(&header);
        buf.put_slice(&ciphertext);
        Ok(buf.freeze())
    }

    /// Decodes one complete frame. The caller must pass exactly the bytes
    ///  reported by [`SecureFrameChannel::complete_frame_len`].
    pub fn decode_frame(&mut self, frame: &[u8]) -> Result<(FrameType, Bytes), UplinkError> {
        let mut header = &frame[..frame.len().min(FRAME_HEADER_LEN)];
        let type_byte = header
            .try_get_u8()
            .map_err(|_| UplinkError::Framing("incomplete frame header"))?;
        let frame_type = FrameType::try_from(type_byte)
            .map_err(|_| UplinkError::Framing("unknown frame type"))?;
        if frame.len() < FRAME_HEADER_LEN + FRAME_TAG_LEN {
            return Err(UplinkError::Framing("incomplete frame header"));
        }
        let declared = u24_be(&frame[1..4]);
        if declared > self.max_payload {
            return Err(UplinkError::Framing("declared frame length exceeds the configured bound"));
        }
        if frame.len() != FRAME_HEADER_LEN + declared + FRAME_TAG_LEN {
            return Err(UplinkError::Framing("frame length does not match its header"));
        }

        let nonce = counter_nonce(self.recv_nonce);
        let plaintext = self
            .recv_cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: &frame[FRAME_HEADER_LEN..], aad: &frame[..FRAME_HEADER_LEN] },
            )
            .map_err(|_| UplinkError::Authentication)?;
        self.recv_nonce += 1;

        Ok((frame_type, Bytes::from(plaintext)))
    }
}

fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn u24_be(raw: &[u8]) -> usize {
    ((raw[0] as usize) << 16) | ((raw[1] as usize) << 8) | raw[2] as usize
}
