use std::{io, path::PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
	#[error("I/O error: {0}.")]
	Io(#[from] io::Error),

	#[error("Invalid configuration: {0}.")]
	Config(String),

	#[error("Pre-flight validation failed: {0} check(s) did not pass.")]
	Validation(usize),

	#[error("Failed to connect to node '{node}': {reason}")]
	Connection { node: String, reason: String },

	#[error("Command failed on node '{node}': {cmd} (exit {exit_code}): {}", .stderr.as_deref().unwrap_or("no stderr"))]
	CommandFailed {
		node: String,
		cmd: String,
		exit_code: u32,
		stderr: Option<String>,
	},

	#[error("Timed out on node '{node}' waiting for {what} after {secs}s.")]
	Timeout { node: String, what: String, secs: u64 },

	#[error("Required bundle artifact '{name}' not found at {path}.")]
	BundleMissing { name: String, path: PathBuf },

	#[error("Cluster join token is not available yet; the first server must populate it before any node can join.")]
	TokenUnavailable,

	#[error("YAML error: {0}")]
	Yaml(#[from] serde_yaml::Error),

	#[error("SSH error: {0}")]
	Ssh(#[from] russh::Error),

	#[error("SFTP error: {0}")]
	Sftp(#[from] russh_sftp::client::error::Error),
}

impl DeployError {
	pub fn command_failed(node: &str, cmd: &str, exit_code: u32, stderr: &str) -> Self {
		let stderr = stderr.trim();
		DeployError::CommandFailed {
			node: node.to_owned(),
			cmd: cmd.to_owned(),
			exit_code,
			stderr: if stderr.is_empty() {
				None
			} else {
				Some(stderr.to_owned())
			},
		}
	}
}
