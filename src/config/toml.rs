//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<SwitchboardConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<SwitchboardConfig> {
    let config: SwitchboardConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Load the configuration file if one was given, then apply CLI overrides
pub fn load_config(cli: &Cli) -> Result<SwitchboardConfig> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => SwitchboardConfig::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: SwitchboardConfig) -> Result<SwitchboardConfig> {
    let coordinator = &mut config.coordinator;
    if let Some(listen) = &cli.listen {
        coordinator.listen = listen.clone();
    }
    if let Some(timeout) = cli.socket_timeout {
        coordinator.socket_timeout_ms = timeout;
    }
    if let Some(interval) = cli.keep_alive_interval {
        coordinator.keep_alive_interval_ms = interval;
    }
    if let Some(retries) = cli.keep_alive_max_retries {
        coordinator.keep_alive_max_retries = retries;
    }
    if let Some(max) = cli.max_open_files {
        coordinator.max_open_files = max;
    }

    // Flags only ever move away from the defaults
    if cli.kill_clients_on_server_death {
        coordinator.server_death_kill_clients = true;
    }
    if cli.no_sort {
        coordinator.sort_output = false;
    }
    if cli.no_clobber {
        coordinator.clobber = false;
    }
    if cli.reprocess_unfinished {
        coordinator.reprocess_unfinished = true;
    }
    if let Some(path) = &cli.messages_file {
        coordinator.messages_file = Some(path.clone());
    }

    // Override codecs
    if let Some(codec) = cli.input_codec {
        config.files.input_codec = codec;
    }
    if let Some(codec) = cli.log_codec {
        config.files.log_codec = codec;
    }
    if let Some(codec) = cli.output_codec {
        config.files.output_codec = codec;
    }

    // Override client settings
    if let Some(retries) = cli.retries {
        config.client.retries = retries;
    }
    if let Some(sleep) = cli.retry_sleep {
        config.client.retry_sleep_ms = sleep;
    }
    if cli.no_failover {
        config.client.failover = false;
    }

    Ok(config)
}
