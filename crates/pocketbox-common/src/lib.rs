//! # pocketbox-common
//!
//! Shared types, persisted records, error definitions, configuration, and
//! the metadata store used across the Pocketbox workspace.
//!
//! This crate is the leaf of the dependency graph: it depends on no other
//! internal crate.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod records;
pub mod store;
pub mod types;
