pub mod aws;
mod cli;
pub mod config;
pub mod endpoint;
pub mod extract;
pub mod job;
pub mod package;
pub mod runtime;
pub mod storage;

#[cfg(test)]
mod testing;

pub use cli::{run, Cli, Command, Overrides};
