//! Deterministic, pure logic shared by the dispatch layer.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod cache;
pub mod invariants;
pub mod roles;
pub mod types;
