//! Core domain types, configuration, and id helpers shared by every
//! mend crate.

pub mod config;
pub mod ids;
pub mod types;
