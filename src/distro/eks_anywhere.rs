use super::{write_remote_file, DistributionHandler, JoinContext};
use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::error::DeployError;
use crate::executor::{run_all, RemoteExecutor};
use async_trait::async_trait;
use tracing::info;

/// EKS-Anywhere support is partial: the first server becomes the admin
/// node holding the cluster spec and the eksctl-anywhere binary; every
/// other node is managed by EKS-A itself during cluster creation.
pub struct EksAnywhere;

impl EksAnywhere {
	pub const ADMIN_DIR: &str = "/opt/eks-anywhere";
	pub const CLUSTER_SPEC_PATH: &str = "/opt/eks-anywhere/cluster.yaml";
}

#[async_trait]
impl DistributionHandler for EksAnywhere {
	fn name(&self) -> &'static str {
		"eks-anywhere"
	}

	fn manages_runtime(&self) -> bool {
		true
	}

	fn service_unit(&self, _role: NodeRole) -> Option<String> {
		// No systemd unit of its own; lifecycle is driven by eksctl.
		None
	}

	fn join_port(&self) -> u16 {
		6443
	}

	fn cleanup_paths(&self) -> &'static [&'static str] {
		&["/opt/eks-anywhere", "/usr/local/bin/eksctl-anywhere"]
	}

	fn render_node_config(
		&self,
		spec: &ClusterSpec,
		_node: &NodeSpec,
		role: NodeRole,
		_join: Option<&JoinContext<'_>>,
	) -> String {
		if role != NodeRole::FirstServer {
			return String::new();
		}
		let mut lines = vec![
			"apiVersion: anywhere.eks.amazonaws.com/v1alpha1".to_owned(),
			"kind: Cluster".to_owned(),
			"metadata:".to_owned(),
			format!("  name: {}", spec.cluster.name),
			"spec:".to_owned(),
			format!("  kubernetesVersion: \"{}\"",
				spec.deployment.settings.version.as_deref().unwrap_or("1.31")),
			"  controlPlaneConfiguration:".to_owned(),
			format!("    count: {}", spec.nodes.servers.len()),
			"  workerNodeGroupConfigurations:".to_owned(),
			"    - name: workers".to_owned(),
			format!("      count: {}", spec.nodes.agents.len()),
		];
		if let Some(cidr) = &spec.deployment.settings.cluster_cidr {
			lines.push("  clusterNetwork:".to_owned());
			lines.push("    pods:".to_owned());
			lines.push(format!("      cidrBlocks: [{cidr}]"));
			if let Some(service_cidr) = &spec.deployment.settings.service_cidr {
				lines.push("    services:".to_owned());
				lines.push(format!("      cidrBlocks: [{service_cidr}]"));
			}
		}
		lines.join("\n") + "\n"
	}

	async fn prepare(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError> {
		if role != NodeRole::FirstServer {
			info!(
				"[{}] EKS-Anywhere manages this node from the admin node; nothing to prepare.",
				node.hostname
			);
			return Ok(());
		}
		run_all(exec, node, &[format!("mkdir -p {}", EksAnywhere::ADMIN_DIR)]).await?;
		let cluster_spec = self.render_node_config(spec, node, role, join);
		info!("[{}] Writing EKS-Anywhere cluster spec.", node.hostname);
		write_remote_file(exec, node, &cluster_spec, EksAnywhere::CLUSTER_SPEC_PATH).await
	}

	async fn install(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		_join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError> {
		if role != NodeRole::FirstServer {
			return Ok(());
		}
		if spec.deployment.airgap.enabled {
			let staging = node.bundle_staging_path(spec);
			let command = format!(
				"tar -xzf {staging}/eks-anywhere-bundle.tar.gz -C /usr/local/bin eksctl-anywhere \
				&& chmod +x /usr/local/bin/eksctl-anywhere"
			);
			info!("[{}] Installing eksctl-anywhere from staged bundle.", node.hostname);
			run_all(exec, node, &[command]).await
		} else {
			let version = spec
				.deployment
				.settings
				.version
				.as_deref()
				.unwrap_or("latest");
			info!("[{}] Installing eksctl-anywhere {version}.", node.hostname);
			let command = format!(
				"curl -sfL https://anywhere-assets.eks.amazonaws.com/releases/eks-a/eksctl-anywhere-{version}-linux-amd64.tar.gz \
				| tar -xz -C /usr/local/bin eksctl-anywhere && chmod +x /usr/local/bin/eksctl-anywhere"
			);
			run_all(exec, node, &[command]).await
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Distribution, OsFamily};

	#[test]
	fn only_the_first_server_gets_a_cluster_spec() {
		let spec = ClusterSpec::template(Distribution::EksAnywhere, OsFamily::Ubuntu, false);
		let node = &spec.nodes.servers[0];
		let first = EksAnywhere.render_node_config(&spec, node, NodeRole::FirstServer, None);
		assert!(first.contains("kind: Cluster"));
		assert!(first.contains(&format!("name: {}", spec.cluster.name)));
		let joining =
			EksAnywhere.render_node_config(&spec, node, NodeRole::JoiningServer, None);
		assert!(joining.is_empty());
	}

	#[test]
	fn no_systemd_unit_is_declared() {
		assert!(EksAnywhere.service_unit(NodeRole::FirstServer).is_none());
	}
}
