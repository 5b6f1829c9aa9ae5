use super::{OsHandler, COMMON_PORTS, KERNEL_MODULES, SERVER_PORTS, SYSCTL_CONF};
use crate::config::{ClusterSpec, NodeRole, NodeSpec, Runtime};
use crate::distro::write_remote_file;
use crate::error::DeployError;
use crate::executor::{run, run_all, run_all_tolerant, RemoteExecutor};
use async_trait::async_trait;
use tracing::{info, warn};

/// Ubuntu and Debian. apt for packages, ufw for the firewall, AppArmor
/// for mandatory access control.
pub struct Ubuntu;

impl Ubuntu {
	pub const BASE_PACKAGES: &[&str] = &[
		"curl",
		"tar",
		"iptables",
		"apt-transport-https",
		"ca-certificates",
		"gnupg",
	];
	pub const PACKAGE_EXTRACT_PATH: &str = "/tmp/os-packages";
	/// Marks rules this tool added, so uninstall only deletes its own.
	pub const RULE_COMMENT: &str = "kubeforge";
}

#[async_trait]
impl OsHandler for Ubuntu {
	fn name(&self) -> &'static str {
		"ubuntu"
	}

	fn package_manager(&self) -> &'static str {
		"apt-get"
	}

	async fn install_base_packages(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		if spec.deployment.airgap.enabled {
			let os_name = node.os_family(spec).as_str();
			if !spec.packages.contains_key(os_name) {
				info!(
					"[{}] No package bundle declared for {os_name}; assuming preinstalled.",
					node.hostname
				);
				return Ok(());
			}
			let staging = node.bundle_staging_path(spec);
			info!("[{}] Installing base packages from staged bundle.", node.hostname);
			let commands = vec![
				format!(
					"mkdir -p {extract} && tar -xzf {staging}/{os_name}-packages.tar.gz -C {extract}",
					extract = Ubuntu::PACKAGE_EXTRACT_PATH
				),
				format!("dpkg -i {}/*.deb || apt-get install -f -y", Ubuntu::PACKAGE_EXTRACT_PATH),
			];
			return run_all(exec, node, &commands).await;
		}
		info!("[{}] Installing base packages with apt.", node.hostname);
		let commands = vec![
			"apt-get update".to_owned(),
			format!(
				"apt-get install -y --no-install-recommends {}",
				Ubuntu::BASE_PACKAGES.join(" ")
			),
		];
		run_all(exec, node, &commands).await
	}

	async fn install_runtime(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		runtime: Runtime,
	) -> Result<(), DeployError> {
		let package = match runtime {
			Runtime::Containerd => "containerd",
			Runtime::Crio => "cri-o",
		};
		if spec.deployment.airgap.enabled {
			info!(
				"[{}] Airgapped: container runtime expected in the package bundle.",
				node.hostname
			);
			return Ok(());
		}
		info!("[{}] Installing {package}.", node.hostname);
		let commands = vec![
			"apt-get update".to_owned(),
			format!("apt-get install -y --no-install-recommends {package}"),
			format!("systemctl enable --now {package}"),
		];
		run_all(exec, node, &commands).await
	}

	async fn disable_swap(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		let commands = vec![
			"swapoff -a".to_owned(),
			r"sed -i '/\sswap\s/s/^/#/' /etc/fstab".to_owned(),
		];
		run_all(exec, node, &commands).await
	}

	async fn configure_kernel_modules(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		let modules = KERNEL_MODULES.join("\n") + "\n";
		for module in KERNEL_MODULES {
			run(exec, node, &format!("modprobe {module}")).await?;
		}
		write_remote_file(exec, node, &modules, "/etc/modules-load.d/k8s.conf").await?;
		write_remote_file(exec, node, SYSCTL_CONF, "/etc/sysctl.d/99-k8s.conf").await?;
		run_all(exec, node, &["sysctl --system".to_owned()]).await
	}

	async fn configure_mandatory_access(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		let status = exec.exec("systemctl is-active apparmor", true).await?;
		if status.stdout.trim() != "active" {
			info!("[{}] AppArmor is not active; leaving it alone.", node.hostname);
			return Ok(());
		}
		// Kubelet needs the utils present; profiles stay enforcing.
		info!("[{}] Ensuring AppArmor utilities are installed.", node.hostname);
		run_all(
			exec,
			node,
			&["apt-get install -y --no-install-recommends apparmor-utils".to_owned()],
		)
		.await
	}

	async fn configure_firewall(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
	) -> Result<(), DeployError> {
		let status = run(exec, node, "ufw status").await?;
		if !status.stdout.contains("Status: active") {
			warn!("[{}] ufw is inactive; skipping firewall rules.", node.hostname);
			return Ok(());
		}
		let mut commands: Vec<String> = firewall_ports(role)
			.iter()
			.map(|port| {
				let (port, proto) = split_port(port);
				format!(
					"ufw allow proto {proto} to any port {port} comment '{}'",
					Ubuntu::RULE_COMMENT
				)
			})
			.collect();
		commands.push(format!(
			"ufw allow from 10.42.0.0/16 comment '{}'",
			Ubuntu::RULE_COMMENT
		));
		commands.push(format!(
			"ufw allow from 10.43.0.0/16 comment '{}'",
			Ubuntu::RULE_COMMENT
		));
		info!("[{}] Opening firewall ports for {role}.", node.hostname);
		run_all(exec, node, &commands).await
	}

	async fn remove_firewall_rules(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
	) {
		let mut commands: Vec<String> = firewall_ports(role)
			.iter()
			.map(|port| {
				let (port, proto) = split_port(port);
				format!("ufw delete allow proto {proto} to any port {port}")
			})
			.collect();
		commands.push("ufw delete allow from 10.42.0.0/16".to_owned());
		commands.push("ufw delete allow from 10.43.0.0/16".to_owned());
		run_all_tolerant(exec, node, &commands).await;
	}

	async fn install_gpu_stack(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		if spec.deployment.airgap.enabled {
			let staging = node.bundle_staging_path(spec);
			info!("[{}] Installing NVIDIA container toolkit from staged debs.", node.hostname);
			let commands = vec![
				format!(
					"mkdir -p /tmp/nvidia-debs && tar -xzf {staging}/nvidia-container-toolkit.tar.gz -C /tmp/nvidia-debs"
				),
				"dpkg -i /tmp/nvidia-debs/*.deb || apt-get install -f -y".to_owned(),
			];
			run_all(exec, node, &commands).await?;
		} else {
			info!("[{}] Installing NVIDIA container toolkit.", node.hostname);
			let commands = vec![
				"curl -fsSL https://nvidia.github.io/libnvidia-container/gpgkey \
				| gpg --dearmor --yes -o /usr/share/keyrings/nvidia-container-toolkit.gpg"
					.to_owned(),
				"curl -sfL https://nvidia.github.io/libnvidia-container/stable/deb/nvidia-container-toolkit.list \
				| sed 's#deb https://#deb [signed-by=/usr/share/keyrings/nvidia-container-toolkit.gpg] https://#g' \
				| tee /etc/apt/sources.list.d/nvidia-container-toolkit.list >/dev/null"
					.to_owned(),
				"apt-get update".to_owned(),
				"apt-get install -y --no-install-recommends nvidia-container-toolkit".to_owned(),
			];
			run_all(exec, node, &commands).await?;
		}
		run_all(
			exec,
			node,
			&["nvidia-ctk runtime configure --runtime=containerd".to_owned()],
		)
		.await
	}
}

fn firewall_ports(role: NodeRole) -> Vec<&'static str> {
	let mut ports: Vec<&'static str> = COMMON_PORTS.to_vec();
	if role.is_server() {
		for port in SERVER_PORTS {
			if !ports.contains(port) {
				ports.push(port);
			}
		}
	}
	ports
}

/// "2379-2380/tcp" -> ("2379:2380", "tcp") in ufw's range syntax.
fn split_port(spec: &str) -> (String, &str) {
	let (port, proto) = spec.rsplit_once('/').unwrap_or((spec, "tcp"));
	(port.replace('-', ":"), proto)
}
