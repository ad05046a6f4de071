//! Deterministic, pure logic shared by the crawler.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and explicit timestamps and return deterministic outputs
//! suitable for tests.

pub mod action_validator;
pub mod budget;
pub mod classifier;
pub mod fingerprint;
pub mod lifecycle;
pub mod recovery_state;
pub mod stuck;
pub mod types;
