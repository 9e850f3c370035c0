//! Chaos test suite entry point.
//!
//! These tests run every failure scenario end to end against the in-memory
//! cluster model on a paused tokio clock, so minutes of scenario time pass
//! in well under a second and no infrastructure is needed.
//!
//! Run with: `cargo test --test chaos_tests`

mod chaos_suite;
