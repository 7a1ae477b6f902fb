//! I/O helpers for crew commands.

pub mod backend;
pub mod config;
pub mod process;
pub mod prompt;
