//! CLI command implementations

pub mod diff;
pub mod downsync;
pub mod index;
pub mod ls_store;
pub mod upsync;
