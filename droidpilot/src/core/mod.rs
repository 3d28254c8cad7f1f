//! Deterministic, pure logic for the replan engine.
//!
//! Core modules must be free of I/O side effects; the only blocking call is the
//! backoff sleep in [`retry`]. They operate on in-memory data structures and
//! return deterministic outputs suitable for tests.

pub mod budget;
pub mod decision;
pub mod invariants;
pub mod progress;
pub mod retry;
pub mod types;
