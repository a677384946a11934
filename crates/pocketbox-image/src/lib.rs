//! # pocketbox-image
//!
//! Image management for the Pocketbox runtime.
//!
//! Handles:
//! - **References**: `registry/repository:tag` parsing and display.
//! - **Registry**: bearer-token auth, multi-arch manifest resolution, and
//!   streamed blob downloads.
//! - **Mirrors**: health-checked endpoint selection for Docker Hub pulls.
//! - **Layers**: content-addressed archive storage, SHA-256 verification,
//!   and rootfs assembly with whiteout support.
//! - **Pull**: the background pull pipeline with progress events.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod auth;
pub mod client;
pub mod hash;
pub mod layer;
pub mod manifest;
pub mod mirror;
pub mod pull;
pub mod reference;
pub mod storage;

pub use client::{ClientTimeouts, Endpoint, RegistryClient};
pub use mirror::MirrorManager;
pub use pull::{ImagePuller, PullHandle, PullProgress, PullStatus};
pub use reference::ImageReference;
pub use storage::LayerStore;
