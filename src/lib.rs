pub mod autopilot;
pub mod classifier;
pub mod cli;
pub mod commands;
pub mod config;
pub mod log;
pub mod policy;
pub mod registry;
pub mod shell_completion;
pub mod terminal;
pub mod transcript;
