//! Shared fixtures for strand integration tests.

pub mod fixtures;
