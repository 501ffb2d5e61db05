//! Shared test utilities for reelsort integration tests.
//!
//! This module provides:
//! - `TestHarness` for driving an engine over temp directories
//! - Builders for configurations and a scripted classifier

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
