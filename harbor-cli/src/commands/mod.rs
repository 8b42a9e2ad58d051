//! CLI subcommand implementations.

pub mod files;
pub mod serve;
pub mod transfer;
