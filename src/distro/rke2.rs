use super::{write_remote_file, DistributionHandler, JoinContext};
use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::error::DeployError;
use crate::executor::{run_all, RemoteExecutor};
use async_trait::async_trait;
use tracing::info;

pub struct Rke2;

impl Rke2 {
	pub const CONFIG_DIR: &str = "/etc/rancher/rke2";
	pub const CONFIG_PATH: &str = "/etc/rancher/rke2/config.yaml";
	pub const REGISTRIES_PATH: &str = "/etc/rancher/rke2/registries.yaml";
	pub const EXTRACT_PATH: &str = "/opt/rke2";
	pub const IMAGES_DIR: &str = "/var/lib/rancher/rke2/agent/images";
	pub const IMAGES_ARCHIVE: &str = "rke2-images.linux-amd64.tar.zst";
	pub const RPM_EXTRACT_PATH: &str = "/tmp/rke2-rpms";
}

#[async_trait]
impl DistributionHandler for Rke2 {
	fn name(&self) -> &'static str {
		"rke2"
	}

	fn manages_runtime(&self) -> bool {
		true
	}

	fn service_unit(&self, role: NodeRole) -> Option<String> {
		Some(format!("rke2-{}", role.service_suffix()))
	}

	fn token_path(&self) -> Option<&'static str> {
		Some("/var/lib/rancher/rke2/server/node-token")
	}

	fn kubeconfig_path(&self) -> Option<&'static str> {
		Some("/etc/rancher/rke2/rke2.yaml")
	}

	fn kubectl_source(&self) -> Option<&'static str> {
		Some("/var/lib/rancher/rke2/bin/kubectl")
	}

	fn join_port(&self) -> u16 {
		9345
	}

	fn uninstall_script_candidates(&self) -> &'static [&'static str] {
		// Tarball install, then RPM install.
		&["/usr/local/bin/rke2-uninstall.sh", "/usr/bin/rke2-uninstall.sh"]
	}

	fn cleanup_paths(&self) -> &'static [&'static str] {
		&[
			"/var/lib/rancher/rke2",
			"/etc/rancher/rke2",
			"/var/lib/kubelet",
			"/opt/rke2",
			"/usr/local/bin/rke2",
			"/usr/local/bin/kubectl",
			"/usr/bin/rke2",
			"/usr/share/rke2",
			"/etc/systemd/system/rke2-server.service",
			"/etc/systemd/system/rke2-agent.service",
		]
	}

	fn network_interfaces(&self) -> &'static [&'static str] {
		&["flannel.1", "cni0", "vxlan.calico"]
	}

	fn render_node_config(
		&self,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> String {
		let settings = &spec.deployment.settings;
		let mut lines = vec![format!("node-name: {}", node.hostname)];
		match (role, join) {
			(NodeRole::FirstServer, _) => {
				lines.push("cluster-init: true".to_owned());
				if let Some(token) = &spec.cluster.token {
					lines.push(format!("token: {token}"));
				}
			}
			(_, Some(join)) => {
				lines.push(format!("server: https://{}:{}", join.server_ip, self.join_port()));
				lines.push(format!("token: {}", join.token));
			}
			// The provisioner never prepares a joining node without a join
			// context; rendering without one yields a config that cannot
			// join, which is why prepare() requires it.
			(_, None) => {}
		}
		if role.is_server() {
			lines.push("tls-san:".to_owned());
			lines.push(format!("  - {}", node.ip));
			lines.push(format!("  - {}", node.hostname));
			if let Some(domain) = &spec.cluster.domain {
				lines.push(format!("  - {}.{domain}", node.hostname));
			}
			if let Some(cidr) = &settings.cluster_cidr {
				lines.push(format!("cluster-cidr: {cidr}"));
			}
			if let Some(cidr) = &settings.service_cidr {
				lines.push(format!("service-cidr: {cidr}"));
			}
			if let Some(mode) = &settings.write_kubeconfig_mode {
				lines.push(format!("write-kubeconfig-mode: \"{mode}\""));
			}
			if !settings.cni.is_empty() {
				let list = settings
					.cni
					.iter()
					.map(|cni| format!("\"{cni}\""))
					.collect::<Vec<_>>()
					.join(", ");
				lines.push(format!("cni: [{list}]"));
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
		if !node.labels.is_empty() {
			lines.push("node-label:".to_owned());
			for (key, value) in &node.labels {
				lines.push(format!("  - {key}={value}"));
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
		let mut dirs = vec![Rke2::CONFIG_DIR, Rke2::IMAGES_DIR];
		if role.is_server() {
			dirs.push("/var/lib/rancher/rke2/server/manifests");
		}
		let commands: Vec<String> = dirs.iter().map(|dir| format!("mkdir -p {dir}")).collect();
		run_all(exec, node, &commands).await?;
		let config = self.render_node_config(spec, node, role, join);
		info!("[{}] Writing RKE2 config.yaml.", node.hostname);
		write_remote_file(exec, node, &config, Rke2::CONFIG_PATH).await?;
		if let Some(registry) = &spec.deployment.settings.registry {
			let registries_yaml = serde_yaml::to_string(registry)?;
			info!("[{}] Writing RKE2 registries.yaml.", node.hostname);
			write_remote_file(exec, node, &registries_yaml, Rke2::REGISTRIES_PATH).await?;
		}
		Ok(())
	}

	async fn install(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		role: NodeRole,
		_join: Option<&JoinContext<'_>>,
	) -> Result<(), DeployError> {
		let suffix = role.service_suffix();
		if !spec.deployment.airgap.enabled {
			info!("[{}] Installing RKE2 {suffix} via upstream script.", node.hostname);
			let command =
				format!("curl -sfL https://get.rke2.io | INSTALL_RKE2_TYPE='{suffix}' sh -");
			return run_all(exec, node, &[command]).await;
		}
		let staging = node.bundle_staging_path(spec);
		let settings = &spec.deployment.settings;
		let mut commands = vec![format!(
			"mkdir -p {extract} && tar -xzf {staging}/rke2-airgap-bundle.tar.gz --strip-components=1 -C {extract}",
			extract = Rke2::EXTRACT_PATH
		)];
		if settings.rpm_bundle_path.is_some() {
			// RPMs install in a fixed dependency order: the selinux policy
			// package first, then common, then the role package.
			commands.push(format!(
				"mkdir -p {rpms} && tar -xzf {staging}/rke2-rpms.tar.gz -C {rpms}",
				rpms = Rke2::RPM_EXTRACT_PATH
			));
			for pattern in ["rke2-selinux*.rpm", "rke2-common*.rpm"] {
				commands.push(format!(
					"dnf install -y --nogpgcheck {}/{pattern}",
					Rke2::RPM_EXTRACT_PATH
				));
			}
			commands.push(format!(
				"dnf install -y --nogpgcheck {}/rke2-{suffix}*.rpm",
				Rke2::RPM_EXTRACT_PATH
			));
		} else if settings.install_script_path.is_some() {
			commands.push(format!(
				"INSTALL_RKE2_TYPE='{suffix}' INSTALL_RKE2_ARTIFACT_PATH={staging} sh {staging}/install.sh"
			));
		} else {
			commands.push(format!(
				"cp {}/bin/rke2 /usr/local/bin/rke2 && chmod +x /usr/local/bin/rke2",
				Rke2::EXTRACT_PATH
			));
		}
		if settings.images_bundle_path.is_some() {
			commands.push(format!(
				"mkdir -p {images} && cp {staging}/{archive} {images}/ && chmod 644 {images}/{archive}",
				images = Rke2::IMAGES_DIR,
				archive = Rke2::IMAGES_ARCHIVE
			));
		}
		info!("[{}] Installing RKE2 {suffix} from staged bundles.", node.hostname);
		run_all(exec, node, &commands).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Distribution, OsFamily};

	fn spec() -> ClusterSpec {
		ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, true)
	}

	#[test]
	fn first_server_config_initializes_the_cluster() {
		let spec = spec();
		let node = &spec.nodes.servers[0];
		let config = Rke2.render_node_config(&spec, node, NodeRole::FirstServer, None);
		assert!(config.contains("cluster-init: true"));
		assert!(config.contains("cluster-cidr: 10.42.0.0/16"));
		assert!(config.contains("system-default-registry: registry.internal.local:5000"));
		assert!(!config.contains("server: https://"));
	}

	#[test]
	fn joining_server_points_at_first_server_with_token() {
		let spec = spec();
		let node = &spec.nodes.servers[0];
		let join = JoinContext {
			server_ip: "10.0.4.10",
			token: "K10abc::server:xyz",
		};
		let config =
			Rke2.render_node_config(&spec, node, NodeRole::JoiningServer, Some(&join));
		assert!(config.contains("server: https://10.0.4.10:9345"));
		assert!(config.contains("token: K10abc::server:xyz"));
		assert!(!config.contains("cluster-init"));
	}

	#[test]
	fn agent_config_carries_no_server_only_fields() {
		let spec = spec();
		let node = &spec.nodes.agents[0];
		let join = JoinContext {
			server_ip: "10.0.4.10",
			token: "tok",
		};
		let config = Rke2.render_node_config(&spec, node, NodeRole::Agent, Some(&join));
		assert!(config.contains("server: https://10.0.4.10:9345"));
		assert!(!config.contains("tls-san"));
		assert!(!config.contains("cluster-cidr"));
	}

	#[test]
	fn node_labels_render_as_list_entries() {
		let mut spec = spec();
		spec.nodes.agents[0]
			.labels
			.insert("tier".to_owned(), "gpu".to_owned());
		let node = spec.nodes.agents[0].clone();
		let join = JoinContext {
			server_ip: "10.0.4.10",
			token: "tok",
		};
		let config = Rke2.render_node_config(&spec, &node, NodeRole::Agent, Some(&join));
		assert!(config.contains("node-label:\n  - tier=gpu"));
	}
}
