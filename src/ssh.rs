use crate::config::{NodeSpec, SshSettings};
use crate::error::DeployError;
use crate::executor::{Connector, ExecOutput, RemoteExecutor};
use async_trait::async_trait;
use russh::{
	client::{connect, Config, Handle, Handler},
	keys::{key::PrivateKeyWithHashAlg, load_secret_key, ssh_key::PublicKey},
	ChannelMsg, Disconnect, Preferred,
};
use russh_sftp::client::SftpSession;
use std::{borrow::Cow, path::Path, sync::Arc, time::Duration};
use tokio::io::AsyncWriteExt;
use tracing::debug;

struct SshClient {}

impl Handler for SshClient {
	type Error = russh::Error;

	async fn check_server_key(
		&mut self,
		_server_public_key: &PublicKey,
	) -> Result<bool, Self::Error> {
		Ok(true)
	}
}

pub struct SshConnector {
	settings: SshSettings,
}

impl SshConnector {
	pub fn new(settings: SshSettings) -> Self {
		SshConnector { settings }
	}
}

#[async_trait]
impl Connector for SshConnector {
	async fn connect(&self, node: &NodeSpec) -> Result<Box<dyn RemoteExecutor>, DeployError> {
		let session = SshSession::open(node, self.settings.clone())
			.await
			.map_err(|err| DeployError::Connection {
				node: node.hostname.clone(),
				reason: err.to_string(),
			})?;
		Ok(Box::new(session))
	}
}

pub struct SshSession {
	session: Handle<SshClient>,
	hostname: String,
	sudo_password: Option<String>,
	settings: SshSettings,
}

impl SshSession {
	pub async fn open(node: &NodeSpec, settings: SshSettings) -> Result<Self, DeployError> {
		let key_pair = load_secret_key(&node.ssh_key, None).map_err(|err| {
			DeployError::Connection {
				node: node.hostname.clone(),
				reason: format!("cannot load SSH key {}: {err}", node.ssh_key.display()),
			}
		})?;
		let config = Config {
			inactivity_timeout: Some(Duration::from_secs(settings.connection_timeout_secs)),
			preferred: Preferred {
				kex: Cow::Owned(vec![
					russh::kex::CURVE25519_PRE_RFC_8731,
					russh::kex::EXTENSION_SUPPORT_AS_CLIENT,
				]),
				..Default::default()
			},
			..<_>::default()
		};
		let config = Arc::new(config);
		let addrs = (node.ip.as_str(), node.port);
		let connect_timeout = Duration::from_secs(settings.connection_timeout_secs);
		let mut session =
			tokio::time::timeout(connect_timeout, connect(config, addrs, SshClient {}))
				.await
				.map_err(|_| DeployError::Timeout {
					node: node.hostname.clone(),
					what: "connecting".to_owned(),
					secs: settings.connection_timeout_secs,
				})??;
		let auth_res = session
			.authenticate_publickey(
				&node.user,
				PrivateKeyWithHashAlg::new(
					Arc::new(key_pair),
					session.best_supported_rsa_hash().await?.flatten(),
				),
			)
			.await?;
		if !auth_res.success() {
			return Err(DeployError::Connection {
				node: node.hostname.clone(),
				reason: "publickey authentication failed".to_owned(),
			});
		}
		Ok(SshSession {
			session,
			hostname: node.hostname.clone(),
			sudo_password: node.sudo_password.clone(),
			settings,
		})
	}

	async fn drive_channel(&mut self, cmd: String) -> Result<ExecOutput, DeployError> {
		let mut channel = self.session.channel_open_session().await?;
		channel.exec(true, cmd.as_str()).await?;
		let mut code = None;
		let mut stdout = Vec::new();
		let mut stderr = Vec::new();
		loop {
			let Some(msg) = channel.wait().await else {
				break;
			};
			match msg {
				ChannelMsg::Data { ref data } => {
					stdout.extend_from_slice(data);
				}
				ChannelMsg::ExtendedData { ref data, ext: 1 } => {
					stderr.extend_from_slice(data);
				}
				ChannelMsg::ExitStatus { exit_status } => {
					code = Some(exit_status);
				}
				_ => {}
			}
		}
		Ok(ExecOutput {
			exit_code: code.unwrap_or(255),
			stdout: String::from_utf8_lossy(&stdout).into_owned(),
			stderr: String::from_utf8_lossy(&stderr).into_owned(),
		})
	}

	async fn sftp(&mut self) -> Result<SftpSession, DeployError> {
		let channel = self.session.channel_open_session().await?;
		channel.request_subsystem(true, "sftp").await?;
		Ok(SftpSession::new(channel.into_stream()).await?)
	}
}

fn wrap_command(command: &str, elevate: bool, sudo_password: Option<&str>) -> String {
	let quoted = command.replace('\'', r"'\''");
	if !elevate {
		return format!("/bin/bash -c '{quoted}'");
	}
	match sudo_password {
		// -p '' keeps the password prompt out of stderr.
		Some(password) => format!("echo '{password}' | sudo -S -p '' /bin/bash -c '{quoted}'"),
		None => format!("sudo -n /bin/bash -c '{quoted}'"),
	}
}

#[async_trait]
impl RemoteExecutor for SshSession {
	async fn exec(&mut self, command: &str, elevate: bool) -> Result<ExecOutput, DeployError> {
		let cmd = wrap_command(command, elevate, self.sudo_password.as_deref());
		debug!("[{}] exec: {command}", self.hostname);
		let timeout = Duration::from_secs(self.settings.command_timeout_secs);
		tokio::time::timeout(timeout, self.drive_channel(cmd))
			.await
			.map_err(|_| DeployError::Timeout {
				node: self.hostname.clone(),
				what: format!("running '{command}'"),
				secs: self.settings.command_timeout_secs,
			})?
	}

	async fn upload(&mut self, local: &Path, remote: &str) -> Result<(), DeployError> {
		debug!("[{}] upload: {} -> {remote}", self.hostname, local.display());
		let timeout = Duration::from_secs(self.settings.transfer_timeout_secs);
		let transfer = async {
			let sftp = self.sftp().await?;
			let mut source = tokio::fs::File::open(local).await?;
			let mut target = sftp.create(remote).await?;
			tokio::io::copy(&mut source, &mut target).await?;
			target.shutdown().await?;
			sftp.close().await?;
			Ok::<(), DeployError>(())
		};
		tokio::time::timeout(timeout, transfer)
			.await
			.map_err(|_| DeployError::Timeout {
				node: self.hostname.clone(),
				what: format!("uploading {}", local.display()),
				secs: self.settings.transfer_timeout_secs,
			})?
	}

	async fn download(&mut self, remote: &str, local: &Path) -> Result<(), DeployError> {
		debug!("[{}] download: {remote} -> {}", self.hostname, local.display());
		let timeout = Duration::from_secs(self.settings.transfer_timeout_secs);
		let transfer = async {
			let sftp = self.sftp().await?;
			let mut source = sftp.open(remote).await?;
			let mut target = tokio::fs::File::create(local).await?;
			tokio::io::copy(&mut source, &mut target).await?;
			target.flush().await?;
			sftp.close().await?;
			Ok::<(), DeployError>(())
		};
		tokio::time::timeout(timeout, transfer)
			.await
			.map_err(|_| DeployError::Timeout {
				node: self.hostname.clone(),
				what: format!("downloading {remote}"),
				secs: self.settings.transfer_timeout_secs,
			})?
	}

	async fn close(&mut self) -> Result<(), DeployError> {
		self.session
			.disconnect(Disconnect::ByApplication, "Disconnected", "English")
			.await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn plain_commands_run_through_bash() {
		assert_eq!(
			wrap_command("echo hi", false, None),
			"/bin/bash -c 'echo hi'"
		);
	}

	#[test]
	fn elevation_without_password_uses_noninteractive_sudo() {
		assert_eq!(
			wrap_command("echo hi", true, None),
			"sudo -n /bin/bash -c 'echo hi'"
		);
	}

	#[test]
	fn elevation_with_password_pipes_to_sudo_stdin() {
		let cmd = wrap_command("systemctl start rke2-server", true, Some("s3cret"));
		assert!(cmd.starts_with("echo 's3cret' | sudo -S -p ''"));
		assert!(cmd.ends_with("'systemctl start rke2-server'"));
	}

	#[test]
	fn single_quotes_in_commands_survive_wrapping() {
		let cmd = wrap_command("echo 'a b'", false, None);
		assert_eq!(cmd, r"/bin/bash -c 'echo '\''a b'\'''");
	}
}
