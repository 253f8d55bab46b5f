//! BurstFS Common - Shared types and utilities
//!
//! This crate provides the identifiers, file attributes, client
//! configuration and the error type used by the BurstFS client engine
//! and its tooling.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ClientConfig, RegionBacking, StorageMode};
pub use error::{Error, Result};
pub use types::*;
