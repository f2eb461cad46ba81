//! Deterministic, pure logic shared by the supervision loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures, take the current instant explicitly, and return
//! deterministic outputs suitable for tests.

pub mod breaker;
pub mod idempotency;
pub mod lease;
pub mod policy;
pub mod progress;
pub mod stall;
pub mod types;
pub mod veto;
