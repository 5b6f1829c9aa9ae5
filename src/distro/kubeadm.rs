use super::{DistributionHandler, JoinContext};
use crate::config::{ClusterSpec, NodeRole, NodeSpec, OsFamily};
use crate::error::DeployError;
use crate::executor::{run_all, RemoteExecutor};
use async_trait::async_trait;
use tracing::info;

/// Vanilla Kubernetes via kubeadm. Requires a static cluster token
/// (enforced at config load); runs on the runtime installed during
/// RuntimePrepare rather than shipping its own.
pub struct Kubeadm;

impl Kubeadm {
	pub const K8S_BASE_URL: &str = "https://pkgs.k8s.io/core:/stable:/v1.31";
	pub const PACKAGES: &[&str] = &["kubelet", "kubeadm", "kubectl"];
	pub const APT_KEY_PATH: &str = "/etc/apt/keyrings/kubernetes-apt-keyring.gpg";
	pub const APT_CONFIG_PATH: &str = "/etc/apt/sources.list.d/kubernetes.list";
}

#[async_trait]
impl DistributionHandler for Kubeadm {
	fn name(&self) -> &'static str {
		"kubeadm"
	}

	fn service_unit(&self, _role: NodeRole) -> Option<String> {
		Some("kubelet".to_owned())
	}

	fn kubeconfig_path(&self) -> Option<&'static str> {
		Some("/etc/kubernetes/admin.conf")
	}

	fn join_port(&self) -> u16 {
		6443
	}

	fn cleanup_paths(&self) -> &'static [&'static str] {
		&["/etc/kubernetes", "/var/lib/kubelet", "/etc/cni/net.d"]
	}

	fn network_interfaces(&self) -> &'static [&'static str] {
		&["cni0", "flannel.1"]
	}

	fn extra_cleanup_commands(&self) -> Vec<String> {
		vec!["kubeadm reset -f".to_owned()]
	}

	fn render_node_config(
		&self,
		_spec: &ClusterSpec,
		_node: &NodeSpec,
		_role: NodeRole,
		_join: Option<&JoinContext<'_>>,
	) -> String {
		// kubeadm is driven by init/join flags, not a per-node config file.
		String::new()
	}

	async fn prepare(
		&self,
		exec: &mut dyn RemoteExecutor,
		_spec: &ClusterSpec,
		node: &NodeSpec,
		_role: NodeRole,
		_join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError> {
		run_all(exec, node, &["mkdir -p /etc/kubernetes".to_owned()]).await
	}

	async fn install(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError> {
		self.install_packages(exec, spec, node).await?;
		match (role, join) {
			(NodeRole::FirstServer, _) => {
				let settings = &spec.deployment.settings;
				let mut init = format!(
					"kubeadm init --token {}",
					spec.cluster.token.as_deref().unwrap_or_default()
				);
				if let Some(cidr) = &settings.cluster_cidr {
					init.push_str(&format!(" --pod-network-cidr {cidr}"));
				}
				if let Some(cidr) = &settings.service_cidr {
					init.push_str(&format!(" --service-cidr {cidr}"));
				}
				info!("[{}] Initializing control plane with kubeadm.", node.hostname);
				run_all(exec, node, &[init]).await
			}
			(_, Some(join)) => {
				info!("[{}] Joining cluster via kubeadm.", node.hostname);
				let command = format!(
					"kubeadm join {}:{} --token {} --discovery-token-unsafe-skip-ca-verification",
					join.server_ip,
					self.join_port(),
					join.token
				);
				run_all(exec, node, &[command]).await
			}
			(_, None) => Err(DeployError::TokenUnavailable),
		}
	}
}

impl Kubeadm {
	async fn install_packages(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		let packages = Kubeadm::PACKAGES.join(" ");
		if spec.deployment.airgap.enabled {
			let staging = node.bundle_staging_path(spec);
			let os_name = node.os_family(spec).as_str();
			info!("[{}] Installing Kubernetes packages from staged bundle.", node.hostname);
			let commands = vec![
				format!("cd /tmp && tar -xzf {staging}/{os_name}-packages.tar.gz"),
				match node.os_family(spec) {
					OsFamily::Ubuntu | OsFamily::Debian => {
						format!("dpkg -i /tmp/{os_name}-packages/*.deb")
					}
					_ => format!("dnf install -y --nogpgcheck /tmp/{os_name}-packages/*.rpm"),
				},
				"systemctl enable kubelet".to_owned(),
			];
			return run_all(exec, node, &commands).await;
		}
		info!("[{}] Installing Kubernetes packages from upstream repo.", node.hostname);
		let commands = match node.os_family(spec) {
			OsFamily::Ubuntu | OsFamily::Debian => vec![
				format!(
					"mkdir -p /etc/apt/keyrings && curl -fsSL {}/deb/Release.key | gpg --dearmor --yes -o {}",
					Kubeadm::K8S_BASE_URL,
					Kubeadm::APT_KEY_PATH
				),
				format!(
					"echo 'deb [signed-by={}] {}/deb /' > {}",
					Kubeadm::APT_KEY_PATH,
					Kubeadm::K8S_BASE_URL,
					Kubeadm::APT_CONFIG_PATH
				),
				"apt-get update".to_owned(),
				format!("apt-get install -y --no-install-recommends {packages}"),
				format!("apt-mark hold {packages}"),
				"systemctl enable kubelet".to_owned(),
			],
			_ => vec![
				format!(
					"tee /etc/yum.repos.d/kubernetes.repo >/dev/null <<'KFGEOF'\n\
					[kubernetes]\n\
					name=Kubernetes\n\
					baseurl={}/rpm/\n\
					enabled=1\n\
					gpgcheck=1\n\
					gpgkey={}/rpm/repodata/repomd.xml.key\n\
					KFGEOF",
					Kubeadm::K8S_BASE_URL,
					Kubeadm::K8S_BASE_URL
				),
				format!("dnf install -y {packages} --disableexcludes=kubernetes"),
				"systemctl enable kubelet".to_owned(),
			],
		};
		run_all(exec, node, &commands).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kubelet_is_the_unit_for_both_roles() {
		assert_eq!(Kubeadm.service_unit(NodeRole::FirstServer).unwrap(), "kubelet");
		assert_eq!(Kubeadm.service_unit(NodeRole::Agent).unwrap(), "kubelet");
	}

	#[test]
	fn no_per_node_config_file_is_rendered() {
		let spec = crate::config::ClusterSpec::template(
			crate::config::Distribution::Kubeadm,
			OsFamily::Rhel,
			false,
		);
		let node = &spec.nodes.servers[0];
		assert!(Kubeadm
			.render_node_config(&spec, node, NodeRole::FirstServer, None)
			.is_empty());
	}
}
