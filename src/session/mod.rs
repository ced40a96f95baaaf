//! Connection handling: the fixed-slot connection pool, the per-connection
//!  transport state machine, the recording orchestrator binding the capture
//!  producer to the active session, and the tokio reactor driving socket and
//!  timer events.

pub mod machine;
pub mod orchestrator;
pub mod pool;
pub mod reactor;
