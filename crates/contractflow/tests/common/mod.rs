//! Shared test utilities for contractflow integration tests.
//!
//! This module provides:
//! - `TestHarness` for an isolated service over a temp directory and a manual clock
//! - Scripted providers that fail a set number of times before behaving

pub mod harness;
pub mod providers;

pub use harness::TestHarness;
pub use providers::FlakyOcr;
