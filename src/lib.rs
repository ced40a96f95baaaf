//! Secure upload pipeline for continuously recorded media: live H.264 (and
//!  optionally AAC) samples are packaged into standard fragmented-container
//!  segments and shipped chunk by chunk to a remote controller over a private,
//!  encrypted point-to-point channel riding on an ordinary TCP byte stream.
//!
//! ## Design goals
//!
//! * The accessory is the listening side: a `setup` call allocates a connection
//!   slot and a listening socket, and exactly one inbound connection is accepted
//!   per setup (the listener is closed right after the accept)
//! * The channel is bootstrapped from a shared secret established by an external
//!   pairing protocol, which also supplies one 32-byte salt per side. Two
//!   independent direction keys are derived from these; nothing ever crosses the
//!   wire unencrypted
//! * Recording never stops for the network's sake: the capture thread keeps
//!   appending samples to a bounded ring whether or not a connection is bound,
//!   and connection-side failures are contained to the connection
//! * A single upload session makes progress at any time. Additional setups are
//!   accepted into spare slots and run the handshake, but only the slot bound to
//!   the recording orchestrator is fed media data
//! * Every fragment is independently decodable: fragments begin at keyframes
//!   only, and the init segment carries the codec parameter sets captured from
//!   the live stream
//!
//! ## Encryption
//!
//! Each frame on the wire is AEAD-encrypted (ChaCha20-Poly1305) with a
//!  direction-scoped key and a strictly monotonic per-direction counter nonce:
//!
//! ```ascii
//! 0: frame type (u8)
//! 1: ciphertext length (u24, big-endian)
//! 4: ciphertext
//! *: authentication tag (16 bytes)
//! ```
//!
//! The 4-byte header is the additional authenticated data of its own frame. The
//!  nonce is 12 bytes: 4 zero bytes followed by the u64 little-endian counter.
//!  Counters start at 0, are independent per direction, and are never reused for
//!  the life of a connection.
//!
//! ## Payload encoding
//!
//! Frame payloads use a compact self-describing tagged binary format:
//!
//! ```ascii
//! 0x01 true          0x02 false         0x03 terminator    0x04 null
//! 0x05 uuid (16)     0x06 date (f64 LE) 0x07 integer -1
//! 0x08..=0x2F  integer 0..=39 (tag - 0x08)
//! 0x30/31/32/33  int8/int16/int32/int64, little-endian
//! 0x35 float32 LE    0x36 float64 LE
//! 0x40..=0x60  UTF-8 string, inline length 0..=32
//! 0x61/62/63/64  UTF-8 string, u8/u16/u32/u64 LE length
//! 0x6F           UTF-8 string, null-terminated
//! 0x70..=0x90  opaque data, inline length 0..=32
//! 0x91/92/93/94  opaque data, u8/u16/u32/u64 LE length
//! 0xD0..=0xDE  array, inline count 0..=14        0xDF terminated array
//! 0xE0..=0xEE  dictionary, inline count 0..=14   0xEF terminated dictionary
//! ```
//!
//! Integers are always encoded in the narrowest form that covers the value.
//!  Parsing is defensive throughout: every declared length is checked against
//!  the remaining buffer, and dictionaries are validated against the expected
//!  message schema (member count, key identity, value types) before any field
//!  is consumed - the input is attacker-controlled network data.
//!
//! ## Session flow
//!
//! A connection walks hello -> open -> data exchange: the controller sends a
//!  hello request and an open request (both answered with status 0), then the
//!  accessory streams data events, each carrying one chunk of the current data
//!  item (the init segment first, then one item per media fragment). A close
//!  event from the controller is latched and honored at the next fragment
//!  boundary; the terminal chunk is acknowledged by the controller before the
//!  accessory sends its own close and releases the connection slot. Every wait
//!  state is covered by a 10 second response timeout.

pub mod config;
pub mod error;
pub mod media;
pub mod mux;
pub mod safe_converter;
pub mod secure;
pub mod session;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
