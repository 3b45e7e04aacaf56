//! Seam between the executor pool and the wire.

use async_trait::async_trait;
use tracing::warn;

use super::client::SshClient;
use super::{CommandOutput, DeviceTarget, ExecutorOptions, SshCredentials, SshError};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Full per-device protocol: connect, detect prompt, optional paging
    /// prelude (non-fatal), ordered command list, close.
    async fn run_commands(
        &self,
        target: &DeviceTarget,
        credentials: &SshCredentials,
        options: &ExecutorOptions,
    ) -> Result<CommandOutput, SshError>;

    /// Connect-only probe used by credential discovery: authenticate and
    /// reach a prompt, never execute data commands. Returns the prompt.
    async fn probe(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        options: &ExecutorOptions,
    ) -> Result<String, SshError>;
}

/// The real thing.
pub struct SshTransport;

#[async_trait]
impl Transport for SshTransport {
    async fn run_commands(
        &self,
        target: &DeviceTarget,
        credentials: &SshCredentials,
        options: &ExecutorOptions,
    ) -> Result<CommandOutput, SshError> {
        let target = target.clone();
        let credentials = credentials.clone();
        let options = options.clone();

        tokio::task::spawn_blocking(move || -> Result<CommandOutput, SshError> {
            let mut client =
                SshClient::connect(&target.host, target.port, &credentials, &options)?;
            let prompt = client.find_prompt()?;

            let mut warnings = Vec::new();
            if let Some(prelude) = target.paging_prelude.as_deref() {
                if let Err(e) = client.send_prelude(prelude) {
                    // Paging still enabled is survivable; a dead session is
                    // caught by the command reads right after.
                    warn!(device = %target.device_name, error = %e, "paging prelude failed");
                    warnings.push(format!("paging prelude failed: {e}"));
                }
            }

            let result = client.run_commands(&target.commands, options.inter_command_delay);
            let transcript = match result {
                Ok(t) => t,
                Err(e) => {
                    client.close();
                    return Err(e);
                }
            };
            client.close();

            Ok(CommandOutput {
                transcript,
                prompt,
                warnings,
            })
        })
        .await
        .map_err(|e| SshError::Protocol(format!("executor task failed: {e}")))?
    }

    async fn probe(
        &self,
        host: &str,
        port: u16,
        credentials: &SshCredentials,
        options: &ExecutorOptions,
    ) -> Result<String, SshError> {
        let host = host.to_string();
        let credentials = credentials.clone();
        let options = options.clone();

        tokio::task::spawn_blocking(move || -> Result<String, SshError> {
            let mut client = SshClient::connect(&host, port, &credentials, &options)?;
            let prompt = client.find_prompt()?;
            client.close();
            Ok(prompt)
        })
        .await
        .map_err(|e| SshError::Protocol(format!("probe task failed: {e}")))?
    }
}
