//! Processors and services backed by a shell command
//!
//! Each payload is written to the command's stdin (strings as raw text,
//! anything else as JSON) and its trimmed stdout becomes the result. A
//! non-zero exit status is a service error.

use super::client::Processor;
use super::server::Service;
use super::ServerHandle;
use crate::error::{CallResult, SwitchboardError};
use crate::work::Payload;
use async_trait::async_trait;
use log::debug;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Run `command` under `sh -c` with `payload` on stdin
async fn run_command(command: &str, payload: &Payload) -> CallResult<Payload> {
    let input = match payload {
        Payload::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // stdin is written while stdout is drained
    let feeder = child.stdin.take().map(|mut stdin| {
        tokio::spawn(async move {
            stdin.write_all(input.as_bytes()).await?;
            stdin.write_all(b"\n").await
        })
    });

    let output = child.wait_with_output().await?;
    if let Some(feeder) = feeder {
        match feeder.await {
            Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e.into()),
            _ => {}
        }
    }
    if !output.status.success() {
        return Err(SwitchboardError::service(format!(
            "`{}` exited with {}: {}",
            command,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let text = text.trim_end_matches(&['\n', '\r'][..]);
    debug!("`{}` produced {} bytes", command, text.len());
    Ok(Payload::String(text.to_string()))
}

/// Client-side processor that runs a command locally; needs no server
pub struct ExecProcessor {
    command: String,
}

impl ExecProcessor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Processor for ExecProcessor {
    async fn process(
        &self,
        payload: Payload,
        _server: Option<&ServerHandle>,
    ) -> CallResult<Payload> {
        run_command(&self.command, &payload).await
    }

    fn needs_server(&self) -> bool {
        false
    }
}

/// Server-side service that runs a command per request
pub struct ExecService {
    command: String,
}

impl ExecService {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Service for ExecService {
    async fn serve(&self, request: Payload) -> CallResult<Payload> {
        run_command(&self.command, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_exec_processor_pipes_payload() {
        let processor = ExecProcessor::new("tr a-z A-Z");
        let result = processor.process(json!("the cat sat"), None).await.unwrap();
        assert_eq!(result, json!("THE CAT SAT"));
    }

    #[tokio::test]
    async fn test_structured_payload_is_sent_as_json() {
        let service = ExecService::new("cat");
        let result = service.serve(json!({ "n": 1 })).await.unwrap();
        assert_eq!(result, json!("{\"n\":1}"));
    }

    #[tokio::test]
    async fn test_failing_command_is_service_error() {
        let service = ExecService::new("echo broken >&2; exit 3");
        let err = service.serve(json!("x")).await.unwrap_err();
        match err {
            SwitchboardError::Service { message } => assert!(message.contains("broken")),
            other => panic!("Wrong error variant: {:?}", other),
        }
    }
}
