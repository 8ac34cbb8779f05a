//! Shared primitives used by all `carmine` crates.
//!
//! This crate sits at the bottom of the dependency graph and is kept
//! dependency-light on purpose: configuration, the unified error model,
//! the FNV-32 hash every keyspace component agrees on, and the snowflake
//! transaction-id generator.

pub mod config;
pub mod error;
pub mod hash;
pub mod ids;
