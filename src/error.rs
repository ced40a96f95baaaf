//! Error taxonomy of the upload pipeline.
//!
//! The variants map one-to-one to how failures are contained:
//!
//! * [`UplinkError::Framing`], [`UplinkError::Authentication`],
//!   [`UplinkError::Wire`] and [`UplinkError::UnexpectedMessage`] are
//!   connection-scoped: they are logged, the connection transitions to its
//!   terminal state, and nothing propagates beyond the connection boundary
//! * [`UplinkError::NoFreeSlot`] is returned to the `setup` caller and leaves
//!   all existing state untouched
//! * [`UplinkError::RingOverflow`] halts chunk production for the bound
//!   connection only; the controller notices through the connection's own
//!   response timeout, and the capture producer keeps running regardless

use thiserror::Error;

use crate::wire::WireError;

#[derive(Debug, Error)]
pub enum UplinkError {
    /// Malformed frame header, or a declared length that exceeds the configured
    ///  bounds or the buffered input.
    #[error("malformed frame: {0}")]
    Framing(&'static str),

    /// AEAD tag mismatch on frame decode. Decoding fails closed: no recovery
    ///  is attempted and no plaintext is surfaced.
    #[error("frame authentication failed")]
    Authentication,

    /// The payload did not parse against the tagged binary format or the
    ///  expected message schema.
    #[error("protocol violation: {0}")]
    Wire(#[from] WireError),

    /// A well-formed message arrived that the current connection state does
    ///  not admit.
    #[error("protocol violation: unexpected {0}")]
    UnexpectedMessage(&'static str),

    /// All connection slots are occupied at setup time.
    #[error("no free connection slot")]
    NoFreeSlot,

    /// The producer was about to overwrite a sample still referenced by the
    ///  bound consumer.
    #[error("sample ring overflow")]
    RingOverflow,
}

impl UplinkError {
    /// True for the error classes that collapse the connection (framing,
    ///  authentication, protocol violations).
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            UplinkError::Framing(_)
            | UplinkError::Authentication
            | UplinkError::Wire(_)
            | UplinkError::UnexpectedMessage(_) => true,
            UplinkError::NoFreeSlot | UplinkError::RingOverflow => false,
        }
    }
}
