//! Capture-side media handling: elementary-stream classification and the
//!  bounded sample store between the capture thread and the upload session.

pub mod h264;
pub mod ring;
