//! Configuration for the replication runtime.
//!
//! Settings persist to disk as RON, accept CLI overrides via clap, and
//! tolerate missing or unknown fields so old files keep loading.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig};
pub use error::ConfigError;
