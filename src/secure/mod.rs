//! The private, encrypted, authenticated point-to-point channel: key
//!  derivation from the pairing collaborator's session secret, and the
//!  per-connection AEAD frame codec.

pub mod frame;
pub mod keys;
