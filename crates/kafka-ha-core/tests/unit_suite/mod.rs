//! Unit tests for kafka-ha-core.
//!
//! These tests focus on pure functions and data structures without I/O.

pub mod checker;
pub mod helpers;
pub mod model;
