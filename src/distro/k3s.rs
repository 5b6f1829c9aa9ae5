use super::{write_remote_file, DistributionHandler, JoinContext};
use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::error::DeployError;
use crate::executor::{run_all, RemoteExecutor};
use async_trait::async_trait;
use tracing::info;

pub struct K3s;

impl K3s {
	pub const CONFIG_DIR: &str = "/etc/rancher/k3s";
	pub const CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";
	pub const IMAGES_DIR: &str = "/var/lib/rancher/k3s/agent/images";
	pub const BINARY_PATH: &str = "/usr/local/bin/k3s";
}

#[async_trait]
impl DistributionHandler for K3s {
	fn name(&self) -> &'static str {
		"k3s"
	}

	fn manages_runtime(&self) -> bool {
		true
	}

	fn service_unit(&self, role: NodeRole) -> Option<String> {
		Some(if role.is_server() {
			"k3s".to_owned()
		} else {
			"k3s-agent".to_owned()
		})
	}

	fn token_path(&self) -> Option<&'static str> {
		Some("/var/lib/rancher/k3s/server/node-token")
	}

	fn kubeconfig_path(&self) -> Option<&'static str> {
		Some("/etc/rancher/k3s/k3s.yaml")
	}

	fn join_port(&self) -> u16 {
		6443
	}

	fn uninstall_script_candidates(&self) -> &'static [&'static str] {
		&[
			"/usr/local/bin/k3s-uninstall.sh",
			"/usr/local/bin/k3s-agent-uninstall.sh",
		]
	}

	fn cleanup_paths(&self) -> &'static [&'static str] {
		&[
			"/var/lib/rancher/k3s",
			"/etc/rancher/k3s",
			"/var/lib/kubelet",
			"/usr/local/bin/k3s",
			"/etc/systemd/system/k3s.service",
			"/etc/systemd/system/k3s-agent.service",
		]
	}

	fn network_interfaces(&self) -> &'static [&'static str] {
		&["flannel.1", "cni0"]
	}

	fn render_node_config(
		&self,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> String {
		let mut lines = vec![format!("node-name: {}", node.hostname)];
		match (role, join) {
			(NodeRole::FirstServer, _) => {
				if spec.nodes.servers.len() > 1 {
					lines.push("cluster-init: true".to_owned());
				}
				if let Some(token) = &spec.cluster.token {
					lines.push(format!("token: {token}"));
				}
			}
			(_, Some(join)) => {
				lines.push(format!("server: https://{}:{}", join.server_ip, self.join_port()));
				lines.push(format!("token: {}", join.token));
			}
			(_, None) => {}
		}
		if role.is_server() {
			let settings = &spec.deployment.settings;
			if let Some(cidr) = &settings.cluster_cidr {
				lines.push(format!("cluster-cidr: {cidr}"));
			}
			if let Some(cidr) = &settings.service_cidr {
				lines.push(format!("service-cidr: {cidr}"));
			}
			if let Some(mode) = &settings.write_kubeconfig_mode {
				lines.push(format!("write-kubeconfig-mode: \"{mode}\""));
			}
			for item in &settings.disable {
				lines.push(format!("disable: {item}"));
			}
		}
		if spec.deployment.airgap.enabled {
			if let Some(registry) = &spec.deployment.airgap.local_registry {
				lines.push(format!("system-default-registry: {registry}"));
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
		let commands = vec![
			format!("mkdir -p {}", K3s::CONFIG_DIR),
			format!("mkdir -p {}", K3s::IMAGES_DIR),
		];
		run_all(exec, node, &commands).await?;
		let config = self.render_node_config(spec, node, role, join);
		info!("[{}] Writing K3s config.yaml.", node.hostname);
		write_remote_file(exec, node, &config, K3s::CONFIG_PATH).await
	}

	async fn install(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		_join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError> {
		let exec_mode = if role.is_server() { "server" } else { "agent" };
		if !spec.deployment.airgap.enabled {
			info!("[{}] Installing K3s {exec_mode} via upstream script.", node.hostname);
			let command =
				format!("curl -sfL https://get.k3s.io | INSTALL_K3S_EXEC='{exec_mode}' sh -s -");
			return run_all(exec, node, &[command]).await;
		}
		let staging = node.bundle_staging_path(spec);
		let settings = &spec.deployment.settings;
		let mut commands = vec![format!(
			"cp {staging}/k3s {binary} && chmod +x {binary}",
			binary = K3s::BINARY_PATH
		)];
		if settings.images_bundle_path.is_some() {
			commands.push(format!(
				"mkdir -p {images} && cp {staging}/k3s-airgap-images.tar.gz {images}/",
				images = K3s::IMAGES_DIR
			));
		}
		info!("[{}] Installing K3s {exec_mode} from staged bundles.", node.hostname);
		run_all(exec, node, &commands).await?;
		if settings.install_script_path.is_some() {
			let command = format!(
				"INSTALL_K3S_SKIP_DOWNLOAD=true INSTALL_K3S_EXEC='{exec_mode}' sh {staging}/install.sh"
			);
			run_all(exec, node, &[command]).await
		} else {
			// No install script staged: write the unit file ourselves.
			let unit_name = self
				.service_unit(role)
				.unwrap_or_else(|| "k3s".to_owned());
			let unit = format!(
				"[Unit]\n\
				Description=Lightweight Kubernetes ({exec_mode})\n\
				After=network-online.target\n\
				\n\
				[Service]\n\
				Type={service_type}\n\
				ExecStart={binary} {exec_mode}\n\
				Restart=always\n\
				RestartSec=5s\n\
				\n\
				[Install]\n\
				WantedBy=multi-user.target\n",
				service_type = if role.is_server() { "notify" } else { "exec" },
				binary = K3s::BINARY_PATH
			);
			write_remote_file(
				exec,
				node,
				&unit,
				&format!("/etc/systemd/system/{unit_name}.service"),
			)
			.await?;
			run_all(exec, node, &["systemctl daemon-reload".to_owned()]).await
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Distribution, OsFamily};

	#[test]
	fn single_server_does_not_cluster_init() {
		let spec = ClusterSpec::template(Distribution::K3s, OsFamily::Ubuntu, false);
		let node = &spec.nodes.servers[0];
		let config = K3s.render_node_config(&spec, node, NodeRole::FirstServer, None);
		assert!(!config.contains("cluster-init"));
	}

	#[test]
	fn agent_join_uses_port_6443() {
		let spec = ClusterSpec::template(Distribution::K3s, OsFamily::Ubuntu, false);
		let node = &spec.nodes.agents[0];
		let join = JoinContext {
			server_ip: "10.0.4.10",
			token: "tok",
		};
		let config = K3s.render_node_config(&spec, node, NodeRole::Agent, Some(&join));
		assert!(config.contains("server: https://10.0.4.10:6443"));
	}

	#[test]
	fn server_and_agent_use_distinct_units() {
		assert_eq!(K3s.service_unit(NodeRole::FirstServer).unwrap(), "k3s");
		assert_eq!(K3s.service_unit(NodeRole::Agent).unwrap(), "k3s-agent");
	}
}
