//! Shared helpers and payload types

pub mod helpers;
pub mod types;
