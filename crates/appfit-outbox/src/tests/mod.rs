//! Scenario tests for the outbox.
//!
//! Run with: cargo test -p appfit-outbox
