//! Integration tests for `VoucherCore`
//!
//! This crate contains integration tests that drive the whole engine
//! end to end: checkout, payment intake, the outbox worker, and the
//! tracking view, wired together over the in-memory adapter.

// This is a test-only crate
#![cfg(test)]
