use crate::config::NodeSpec;
use crate::error::DeployError;
use async_trait::async_trait;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ExecOutput {
	pub exit_code: u32,
	pub stdout: String,
	pub stderr: String,
}

impl ExecOutput {
	pub fn success(&self) -> bool {
		self.exit_code == 0
	}
}

/// One authenticated session to a remote node. Every remote command and
/// file transfer the orchestration performs goes through this trait, which
/// keeps the state machine testable without a network.
#[async_trait]
pub trait RemoteExecutor: Send {
	/// Run a shell command, optionally elevated. Returns the full output;
	/// a non-zero exit code is not an error at this layer.
	async fn exec(&mut self, command: &str, elevate: bool) -> Result<ExecOutput, DeployError>;

	async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), DeployError>;

	async fn download(&mut self, remote: &str, local: &Path) -> Result<(), DeployError>;

	async fn close(&mut self) -> Result<(), DeployError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
	async fn connect(&self, node: &NodeSpec) -> Result<Box<dyn RemoteExecutor>, DeployError>;
}

/// Run an elevated command and fail on non-zero exit.
pub async fn run(
	exec: &mut dyn RemoteExecutor,
	node: &NodeSpec,
	command: &str,
) -> Result<ExecOutput, DeployError> {
	let output = exec.exec(command, true).await?;
	if !output.success() {
		return Err(DeployError::command_failed(
			&node.hostname,
			command,
			output.exit_code,
			&output.stderr,
		));
	}
	Ok(output)
}

/// Run a sequence of elevated commands, stopping at the first failure.
pub async fn run_all(
	exec: &mut dyn RemoteExecutor,
	node: &NodeSpec,
	commands: &[String],
) -> Result<(), DeployError> {
	for command in commands {
		run(exec, node, command).await?;
	}
	Ok(())
}

/// Best-effort variant: failures are logged at warn level and swallowed.
pub async fn run_all_tolerant(exec: &mut dyn RemoteExecutor, node: &NodeSpec, commands: &[String]) {
	for command in commands {
		match exec.exec(command, true).await {
			Ok(output) if !output.success() => {
				tracing::warn!(
					"[{}] Command exited {} (continuing): {command}",
					node.hostname,
					output.exit_code
				);
			}
			Ok(_) => {}
			Err(err) => {
				tracing::warn!("[{}] Command error (continuing): {err}", node.hostname);
			}
		}
	}
}
