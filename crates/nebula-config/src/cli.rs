//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;
use nebula_replication::{HistoryOverflow, ReplicationStrategy, VisibilityPolicy};

use crate::Config;

/// Command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "nebula-replication", about = "Headless replication and prediction loop")]
pub struct CliArgs {
    /// Network tick rate (Hz).
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Replication strategy (full, delta, on-demand).
    #[arg(long)]
    pub strategy: Option<ReplicationStrategy>,

    /// Send value updates on the reliable channel.
    #[arg(long)]
    pub reliable: Option<bool>,

    /// Visibility policy (all, blacklist, whitelist).
    #[arg(long)]
    pub policy: Option<VisibilityPolicy>,

    /// Prediction history size in frames.
    #[arg(long)]
    pub history_size: Option<usize>,

    /// Prediction divergence threshold.
    #[arg(long)]
    pub error_threshold: Option<f64>,

    /// Behaviour of a full prediction history (drop-oldest, stall).
    #[arg(long)]
    pub overflow: Option<HistoryOverflow>,

    /// Number of loopback clients.
    #[arg(long)]
    pub clients: Option<u32>,

    /// Ticks to run before exiting.
    #[arg(long)]
    pub ticks: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rate) = args.tick_rate {
            self.network.net_tick_rate = rate;
        }
        if let Some(strategy) = args.strategy {
            self.replication.strategy = strategy;
        }
        if let Some(reliable) = args.reliable {
            self.replication.reliable = reliable;
        }
        if let Some(policy) = args.policy {
            self.visibility.policy = policy;
        }
        if let Some(size) = args.history_size {
            self.prediction.max_history_frames = size;
        }
        if let Some(threshold) = args.error_threshold {
            self.prediction.error_threshold = threshold;
        }
        if let Some(overflow) = args.overflow {
            self.prediction.overflow = overflow;
        }
        if let Some(clients) = args.clients {
            self.network.clients = clients;
        }
        if let Some(ticks) = args.ticks {
            self.debug.demo_ticks = ticks;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            strategy: Some(ReplicationStrategy::OnDemand),
            history_size: Some(32),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.replication.strategy, ReplicationStrategy::OnDemand);
        assert_eq!(config.prediction.max_history_frames, 32);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.network.net_tick_rate, 20);
        assert_eq!(config.visibility.policy, VisibilityPolicy::All);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_setting_enums() {
        let args = CliArgs::try_parse_from([
            "nebula-replication",
            "--strategy",
            "full",
            "--policy",
            "whitelist",
            "--overflow",
            "stall",
            "--ticks",
            "10",
        ])
        .unwrap();
        assert_eq!(args.strategy, Some(ReplicationStrategy::Full));
        assert_eq!(args.policy, Some(VisibilityPolicy::Whitelist));
        assert_eq!(args.overflow, Some(HistoryOverflow::Stall));
        assert_eq!(args.ticks, Some(10));
    }

    #[test]
    fn test_cli_rejects_unknown_strategy() {
        let result = CliArgs::try_parse_from(["nebula-replication", "--strategy", "sometimes"]);
        assert!(result.is_err());
    }
}
