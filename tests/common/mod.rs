//! Common test utilities and helpers
//!
//! This module provides shared utilities for all tests including:
//! - An in-process Cart API with a network switch
//! - Session and cart fixtures
//! - Custom assertion macros

pub mod assertions;
pub mod fake_api;
pub mod fixtures;

// Re-export commonly used utilities
pub use fake_api::*;
pub use fixtures::*;
