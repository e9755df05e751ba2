//! Profile management module.
//!
//! This module provides the registry of imported VPN profiles, including
//! format checks on import and persistence across restarts.

pub mod store;

pub use store::{ProfileError, ProfileStore};
