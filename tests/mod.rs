//! Test suite for cartsync
//!
//! This module organizes all tests

pub mod common;
pub mod integration;
pub mod property;
