pub mod eks_anywhere;
pub mod k3s;
pub mod kubeadm;
pub mod rke2;

use crate::config::{ClusterSpec, Distribution, NodeRole, NodeSpec};
use crate::error::DeployError;
use crate::executor::{run, RemoteExecutor};
use async_trait::async_trait;

pub use eks_anywhere::EksAnywhere;
pub use k3s::K3s;
pub use kubeadm::Kubeadm;
pub use rke2::Rke2;

/// What a joining node needs to know about the cluster it is joining.
/// Built by the orchestrator only after the cluster token is populated.
#[derive(Debug, Clone, Copy)]
pub struct JoinContext<'a> {
	pub server_ip: &'a str,
	pub token: &'a str,
}

#[async_trait]
pub trait DistributionHandler: Send + Sync {
	fn name(&self) -> &'static str;

	/// Distributions that ship their own containerd skip RuntimePrepare.
	fn manages_runtime(&self) -> bool {
		false
	}

	/// Systemd unit for the role, when the distribution runs as one.
	fn service_unit(&self, role: NodeRole) -> Option<String>;

	/// Where the first server writes its generated join token, for
	/// distributions with dynamic tokens.
	fn token_path(&self) -> Option<&'static str> {
		None
	}

	fn kubeconfig_path(&self) -> Option<&'static str> {
		None
	}

	/// Where the installed distribution leaves a kubectl binary, for
	/// distributions that do not already put one on PATH.
	fn kubectl_source(&self) -> Option<&'static str> {
		None
	}

	fn join_port(&self) -> u16;

	fn uninstall_script_candidates(&self) -> &'static [&'static str] {
		&[]
	}

	fn cleanup_paths(&self) -> &'static [&'static str] {
		&[]
	}

	fn network_interfaces(&self) -> &'static [&'static str] {
		&[]
	}

	fn extra_cleanup_commands(&self) -> Vec<String> {
		Vec::new()
	}

	/// Render the node's config file. Empty string means the distribution
	/// does not use a per-node config file for this role.
	fn render_node_config(
		&self,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> String;

	/// Create directories and upload rendered configuration.
	async fn prepare(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError>;

	/// Install binaries/packages and load images.
	async fn install(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError>;
}

pub fn handler_for(distribution: Distribution) -> Box<dyn DistributionHandler> {
	match distribution {
		Distribution::Rke2 => Box::new(Rke2),
		Distribution::K3s => Box::new(K3s),
		Distribution::EksAnywhere => Box::new(EksAnywhere),
		Distribution::Kubeadm => Box::new(Kubeadm),
	}
}

/// Write a small file on the remote host with elevated privileges.
/// Existing content is overwritten.
pub(crate) async fn write_remote_file(
	exec: &mut dyn RemoteExecutor,
	node: &NodeSpec,
	content: &str,
	remote_path: &str,
) -> Result<(), DeployError> {
	let dir = remote_path.rsplit_once('/').map(|(d, _)| d).unwrap_or("/");
	let command = format!(
		"mkdir -p {dir} && tee {remote_path} >/dev/null <<'KFGEOF'\n{}\nKFGEOF",
		content.trim_end()
	);
	run(exec, node, &command).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn factory_covers_every_distribution() {
		for distribution in Distribution::ALL {
			let handler = handler_for(*distribution);
			assert_eq!(handler.name(), distribution.as_str());
		}
	}
}
