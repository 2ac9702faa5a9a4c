//! Moving versions between directory trees and block stores
//!
//! This crate provides:
//! - Block assembly from a source tree into block files or a block store
//! - Version changes on a target tree (remove, create, rewrite)
//! - Full reconstruction of a version

pub mod content;
pub mod version;

// Re-exports
pub use content::{put_content, write_content};
pub use version::{change_version, write_version};
