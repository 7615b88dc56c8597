//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//! The coordinator also publishes a flat string view of its configuration
//! (see [`SwitchboardConfig::settings`]) that peers read through
//! `get_setting`/`get_settings`.

pub mod cli;
pub mod toml;
pub mod validator;

use crate::codec::CodecKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Setting key: per-call timeout in milliseconds
pub const SOCKET_TIMEOUT: &str = "switchboard.socketTimeout";
/// Setting key: liveness ping interval in milliseconds
pub const KEEP_ALIVE_INTERVAL: &str = "switchboard.keepAliveInterval";
/// Setting key: consecutive ping failures tolerated before a peer is presumed dead
pub const KEEP_ALIVE_MAX_RETRIES: &str = "switchboard.keepAliveMaxRetries";
/// Setting key: whether a server's death kills its clients
pub const SERVER_DEATH_KILL_CLIENTS: &str = "switchboard.serverDeathKillClients";
/// Setting key: whether final output is sorted by sequence number
pub const SORT_OUTPUT: &str = "switchboard.sortOutput";
/// Setting key: how long a client sleeps when no work is available, in milliseconds
pub const CLIENT_NEXT_OBJECT_INTERVAL: &str = "switchboard.client.nextObjectInterval";

/// Complete switchboard configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub client: ClientConfig,
    /// Free-form per-peer transport and policy switches
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Coordinator behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address the coordinator listens on
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Timeout for every call to or from a peer (0 is rejected)
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    /// Interval between liveness pings
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Extra failed pings tolerated before a peer is presumed dead
    #[serde(default)]
    pub keep_alive_max_retries: u32,
    /// Kill a dead server's clients instead of notifying them
    #[serde(default)]
    pub server_death_kill_clients: bool,
    /// Sort final output by sequence number
    #[serde(default = "default_true")]
    pub sort_output: bool,
    /// On recovery, re-queue logged items that were not processed
    #[serde(default)]
    pub reprocess_unfinished: bool,
    /// Overwrite existing output files
    #[serde(default = "default_true")]
    pub clobber: bool,
    /// Maximum number of files with open streams
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
    /// Buffer size for file streams
    #[serde(default = "default_buf_size")]
    pub buf_size: usize,
    /// Append log messages to this file instead of stderr
    #[serde(default)]
    pub messages_file: Option<PathBuf>,
}

/// Encodings and naming of input, log, and output files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    #[serde(default)]
    pub input_codec: CodecKind,
    #[serde(default = "default_log_codec")]
    pub log_codec: CodecKind,
    #[serde(default)]
    pub output_codec: CodecKind,
    #[serde(default = "default_output_suffix")]
    pub output_suffix: String,
    #[serde(default = "default_log_suffix")]
    pub log_suffix: String,
}

/// Client-side behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Sleep between polls when no work is available
    #[serde(default = "default_next_object_interval_ms")]
    pub next_object_interval_ms: u64,
    /// Retries per failed call to a server (negative retries indefinitely)
    #[serde(default = "default_retries")]
    pub retries: i64,
    #[serde(default = "default_retry_sleep_ms")]
    pub retry_sleep_ms: u64,
    /// Ask the coordinator for a replacement server when the current one fails
    #[serde(default = "default_true")]
    pub failover: bool,
}

fn default_listen() -> String {
    "0.0.0.0:1099".to_string()
}

fn default_socket_timeout_ms() -> u64 {
    120_000
}

fn default_keep_alive_interval_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_max_open_files() -> usize {
    100
}

fn default_buf_size() -> usize {
    8192
}

fn default_log_codec() -> CodecKind {
    CodecKind::Jsonl
}

fn default_output_suffix() -> String {
    ".proc".to_string()
}

fn default_log_suffix() -> String {
    ".log".to_string()
}

fn default_next_object_interval_ms() -> u64 {
    10_000
}

fn default_retries() -> i64 {
    -1
}

fn default_retry_sleep_ms() -> u64 {
    1_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            socket_timeout_ms: default_socket_timeout_ms(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            keep_alive_max_retries: 0,
            server_death_kill_clients: false,
            sort_output: true,
            reprocess_unfinished: false,
            clobber: true,
            max_open_files: default_max_open_files(),
            buf_size: default_buf_size(),
            messages_file: None,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            input_codec: CodecKind::Text,
            log_codec: default_log_codec(),
            output_codec: CodecKind::Text,
            output_suffix: default_output_suffix(),
            log_suffix: default_log_suffix(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            next_object_interval_ms: default_next_object_interval_ms(),
            retries: default_retries(),
            retry_sleep_ms: default_retry_sleep_ms(),
            failover: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

impl ClientConfig {
    pub fn next_object_interval(&self) -> Duration {
        Duration::from_millis(self.next_object_interval_ms)
    }

    pub fn retry_sleep(&self) -> Duration {
        Duration::from_millis(self.retry_sleep_ms)
    }
}

impl SwitchboardConfig {
    /// Flat settings map published to peers
    ///
    /// Well-known keys are derived from the typed sections; free-form
    /// `[settings]` entries are added as given and may override them.
    pub fn settings(&self) -> BTreeMap<String, String> {
        let c = &self.coordinator;
        let mut settings = BTreeMap::new();
        settings.insert(SOCKET_TIMEOUT.to_string(), c.socket_timeout_ms.to_string());
        settings.insert(
            KEEP_ALIVE_INTERVAL.to_string(),
            c.keep_alive_interval_ms.to_string(),
        );
        settings.insert(
            KEEP_ALIVE_MAX_RETRIES.to_string(),
            c.keep_alive_max_retries.to_string(),
        );
        settings.insert(
            SERVER_DEATH_KILL_CLIENTS.to_string(),
            c.server_death_kill_clients.to_string(),
        );
        settings.insert(SORT_OUTPUT.to_string(), c.sort_output.to_string());
        settings.insert(
            CLIENT_NEXT_OBJECT_INTERVAL.to_string(),
            self.client.next_object_interval_ms.to_string(),
        );
        for (key, value) in &self.settings {
            settings.insert(key.clone(), value.clone());
        }
        settings
    }
}

impl fmt::Display for SwitchboardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.coordinator;
        writeln!(f, "Switchboard configuration:")?;
        writeln!(f, "  listen: {}", c.listen)?;
        writeln!(f, "  socket timeout: {}ms", c.socket_timeout_ms)?;
        writeln!(
            f,
            "  keep-alive: every {}ms, {} retries",
            c.keep_alive_interval_ms, c.keep_alive_max_retries
        )?;
        writeln!(f, "  kill clients on server death: {}", c.server_death_kill_clients)?;
        writeln!(f, "  sort output: {}", c.sort_output)?;
        writeln!(f, "  reprocess unfinished: {}", c.reprocess_unfinished)?;
        writeln!(f, "  clobber: {}", c.clobber)?;
        writeln!(f, "  max open files: {}", c.max_open_files)?;
        write!(
            f,
            "  codecs: input={} log={} output={}",
            self.files.input_codec, self.files.log_codec, self.files.output_codec
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SwitchboardConfig::default();
        assert_eq!(config.coordinator.socket_timeout_ms, 120_000);
        assert_eq!(config.coordinator.keep_alive_interval_ms, 5_000);
        assert_eq!(config.coordinator.keep_alive_max_retries, 0);
        assert!(config.coordinator.sort_output);
        assert!(config.coordinator.clobber);
        assert!(!config.coordinator.server_death_kill_clients);
        assert_eq!(config.coordinator.max_open_files, 100);
        assert_eq!(config.files.log_codec, CodecKind::Jsonl);
        assert_eq!(config.files.output_suffix, ".proc");
        assert_eq!(config.client.retries, -1);
    }

    #[test]
    fn test_settings_map() {
        let mut config = SwitchboardConfig::default();
        config.coordinator.keep_alive_max_retries = 2;
        config
            .settings
            .insert("parser.client.timeout".to_string(), "30".to_string());

        let settings = config.settings();
        assert_eq!(settings[KEEP_ALIVE_MAX_RETRIES], "2");
        assert_eq!(settings[SORT_OUTPUT], "true");
        assert_eq!(settings[CLIENT_NEXT_OBJECT_INTERVAL], "10000");
        assert_eq!(settings["parser.client.timeout"], "30");
    }
}
