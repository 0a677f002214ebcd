//! # Taask Common
//!
//! Shared types, traits, and utilities used across Taask components.
//!
//! ## Modules
//! - `types` - Core data structures (TaskStatus, MemberGroup, Service, etc.)
//! - `error` - The error taxonomy shared by every component
//! - `constants` - Shared configuration constants
//! - `encoding` - Serde helpers for byte fields

pub mod constants;
pub mod encoding;
pub mod error;
pub mod types;

pub use error::{Result, TaaskError};
pub use types::*;
