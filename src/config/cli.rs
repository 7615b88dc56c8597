//! CLI argument parsing using clap

use crate::codec::CodecKind;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Coordinator (default) - accept peers and distribute the input files
    Coordinator,
    /// Client - pull work items, process them, return results
    Client,
    /// Server - perform a service for assigned clients
    Server,
}

/// Switchboard - distributed object-processing coordinator
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: coordinator, client, or server
    #[arg(long, value_enum, default_value = "coordinator")]
    pub mode: ExecutionMode,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Input files to process (coordinator mode)
    #[arg(value_name = "INPUT")]
    pub inputs: Vec<PathBuf>,

    /// Address to listen on (coordinator address, or peer endpoint address)
    #[arg(long)]
    pub listen: Option<String>,

    /// Host name other processes should use to reach this peer (defaults to this machine's host name)
    #[arg(long)]
    pub advertise: Option<String>,

    /// Coordinator address (client and server modes)
    #[arg(long, env = "SWITCHBOARD_ADDR", default_value = "127.0.0.1:1099")]
    pub switchboard: String,

    // === Coordinator Options ===
    /// Timeout for every peer call in milliseconds
    #[arg(long)]
    pub socket_timeout: Option<u64>,

    /// Interval between liveness pings in milliseconds
    #[arg(long)]
    pub keep_alive_interval: Option<u64>,

    /// Failed pings tolerated before a peer is presumed dead
    #[arg(long)]
    pub keep_alive_max_retries: Option<u32>,

    /// Kill a dead server's clients instead of notifying them
    #[arg(long)]
    pub kill_clients_on_server_death: bool,

    /// Write output in completion order instead of input order
    #[arg(long)]
    pub no_sort: bool,

    /// Treat inputs whose output file already exists as done
    #[arg(long)]
    pub no_clobber: bool,

    /// On recovery, re-queue logged items that were not processed
    #[arg(long)]
    pub reprocess_unfinished: bool,

    /// Maximum number of files with open streams
    #[arg(long)]
    pub max_open_files: Option<usize>,

    /// Encoding of input files
    #[arg(long, value_enum)]
    pub input_codec: Option<CodecKind>,

    /// Encoding of work logs (jsonl or msgpack)
    #[arg(long, value_enum)]
    pub log_codec: Option<CodecKind>,

    /// Encoding of output files
    #[arg(long, value_enum)]
    pub output_codec: Option<CodecKind>,

    /// Append log messages to this file
    #[arg(long)]
    pub messages_file: Option<PathBuf>,

    // === Peer Options ===
    /// Shell command run once per payload (stdin -> stdout)
    #[arg(long)]
    pub exec: Option<String>,

    /// Maximum concurrent clients (server mode, 0 = unlimited)
    #[arg(long, default_value = "0")]
    pub max_clients: i32,

    /// Only accept clients that ask for this server by id (server mode)
    #[arg(long)]
    pub accept_only_by_request: bool,

    /// Ask for this server id instead of the least-loaded server (client mode)
    #[arg(long)]
    pub server_id: Option<u32>,

    /// Retries per failed server call, negative for indefinitely (client mode)
    #[arg(long, allow_negative_numbers = true)]
    pub retries: Option<i64>,

    /// Sleep between retries in milliseconds (client mode)
    #[arg(long)]
    pub retry_sleep: Option<u64>,

    /// Do not fail over to another server (client mode)
    #[arg(long)]
    pub no_failover: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_is_default_mode() {
        let cli = Cli::parse_from(["switchboard", "a.txt", "b.txt"]);
        assert_eq!(cli.mode, ExecutionMode::Coordinator);
        assert_eq!(cli.inputs, vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]);
        assert!(!cli.no_sort);
    }

    #[test]
    fn test_client_options() {
        let cli = Cli::parse_from([
            "switchboard",
            "--mode",
            "client",
            "--switchboard",
            "10.0.1.10:1099",
            "--retries",
            "-1",
            "--log-codec",
            "msgpack",
        ]);
        assert_eq!(cli.mode, ExecutionMode::Client);
        assert_eq!(cli.switchboard, "10.0.1.10:1099");
        assert_eq!(cli.retries, Some(-1));
        assert_eq!(cli.log_codec, Some(CodecKind::Msgpack));
    }
}
