//! # pocketbox-runtime
//!
//! Container lifecycle for the Pocketbox runtime.
//!
//! Handles:
//! - **Sandbox**: proot command lines, environments, and process spawning.
//! - **State machine**: the pure lifecycle transition table.
//! - **Containers**: one actor per container serializing its operations.
//! - **Indexes**: the container and running-process maps.
//! - **Engine**: image pulls, container creation, and lookups.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod index;
pub mod logs;
pub mod names;
pub mod process;
pub mod sandbox;
pub mod state;

pub use container::Container;
pub use engine::Engine;
pub use process::{ContainerProcess, ProcessEntry, ProcessKind};
