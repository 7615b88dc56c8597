//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &SwitchboardConfig) -> Result<()> {
    validate_coordinator(&config.coordinator)?;
    validate_files(&config.files)?;
    validate_client(&config.client)?;

    Ok(())
}

/// Validate coordinator configuration
pub fn validate_coordinator(coordinator: &CoordinatorConfig) -> Result<()> {
    // A hung peer would stall liveness detection forever
    if coordinator.socket_timeout_ms == 0 {
        anyhow::bail!("socket_timeout_ms must be greater than 0 (infinite timeouts are not allowed)");
    }

    if coordinator.keep_alive_interval_ms == 0 {
        anyhow::bail!("keep_alive_interval_ms must be greater than 0");
    }

    if coordinator.max_open_files == 0 {
        anyhow::bail!("max_open_files must be at least 1");
    }

    if coordinator.buf_size == 0 {
        anyhow::bail!("buf_size must be greater than 0");
    }

    if coordinator.listen.trim().is_empty() {
        anyhow::bail!("listen address must not be empty");
    }

    Ok(())
}

/// Validate file naming and encodings
pub fn validate_files(files: &FilesConfig) -> Result<()> {
    if !files.log_codec.is_structured() {
        anyhow::bail!(
            "log_codec {} cannot hold work items; use jsonl or msgpack",
            files.log_codec
        );
    }

    if files.output_suffix.is_empty() || files.log_suffix.is_empty() {
        anyhow::bail!("output_suffix and log_suffix must not be empty");
    }

    if files.output_suffix == files.log_suffix {
        anyhow::bail!(
            "output_suffix and log_suffix must differ, both are {:?}",
            files.output_suffix
        );
    }

    Ok(())
}

/// Validate client configuration
pub fn validate_client(client: &ClientConfig) -> Result<()> {
    if client.next_object_interval_ms == 0 {
        anyhow::bail!("next_object_interval_ms must be greater than 0");
    }

    Ok(())
}
