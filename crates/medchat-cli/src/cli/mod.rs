pub mod commands;
pub mod config;

pub use commands::{run_command, watch, CliCommand};
pub use config::CliConfig;
