//! Side-effecting adapters: processes, HTTP, files, terminal.

pub mod config;
pub mod console;
pub mod instructions;
pub mod model;
pub mod process;
pub mod prompt;
pub mod shell;
