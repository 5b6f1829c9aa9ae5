use super::{OsHandler, COMMON_PORTS, KERNEL_MODULES, SERVER_PORTS, SYSCTL_CONF};
use crate::config::{ClusterSpec, NodeRole, NodeSpec, Runtime};
use crate::distro::write_remote_file;
use crate::error::DeployError;
use crate::executor::{run, run_all, run_all_tolerant, RemoteExecutor};
use async_trait::async_trait;
use tracing::{info, warn};

/// RHEL, Rocky and CentOS. dnf for packages, firewalld for the firewall,
/// SELinux for mandatory access control.
pub struct Rhel;

impl Rhel {
	pub const BASE_PACKAGES: &[&str] = &[
		"curl",
		"tar",
		"iptables",
		"container-selinux",
		"libnetfilter_conntrack",
		"libnfnetlink",
		"libnftnl",
		"policycoreutils-python-utils",
	];
	pub const PACKAGE_EXTRACT_PATH: &str = "/tmp/os-packages";
}

#[async_trait]
impl OsHandler for Rhel {
	fn name(&self) -> &'static str {
		"rhel"
	}

	fn package_manager(&self) -> &'static str {
		"dnf"
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
					extract = Rhel::PACKAGE_EXTRACT_PATH
				),
				format!(
					"dnf install -y --nogpgcheck --skip-broken {}/*.rpm",
					Rhel::PACKAGE_EXTRACT_PATH
				),
			];
			return run_all(exec, node, &commands).await;
		}
		info!("[{}] Installing base packages with dnf.", node.hostname);
		let command = format!("dnf install -y {}", Rhel::BASE_PACKAGES.join(" "));
		run_all(exec, node, &[command]).await
	}

	async fn install_runtime(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		runtime: Runtime,
	) -> Result<(), DeployError> {
		let package = match runtime {
			Runtime::Containerd => "containerd.io",
			Runtime::Crio => "cri-o",
		};
		if spec.deployment.airgap.enabled {
			// The runtime rpms travel inside the base package bundle.
			info!(
				"[{}] Airgapped: container runtime expected in the package bundle.",
				node.hostname
			);
			return Ok(());
		}
		info!("[{}] Installing {package}.", node.hostname);
		let commands = vec![
			"dnf config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo"
				.to_owned(),
			format!("dnf install -y {package}"),
			"systemctl enable --now containerd".to_owned(),
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
		let state = run(exec, node, "getenforce").await?;
		if state.stdout.trim().eq_ignore_ascii_case("disabled") {
			info!("[{}] SELinux is disabled; leaving it alone.", node.hostname);
			return Ok(());
		}
		info!("[{}] Setting SELinux to permissive.", node.hostname);
		let commands = vec![
			"setenforce 0".to_owned(),
			"sed -i 's/^SELINUX=enforcing/SELINUX=permissive/' /etc/selinux/config".to_owned(),
		];
		run_all(exec, node, &commands).await
	}

	async fn configure_firewall(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
	) -> Result<(), DeployError> {
		let active = exec.exec("systemctl is-active firewalld", true).await?;
		if active.stdout.trim() != "active" {
			warn!("[{}] firewalld is not active; skipping firewall rules.", node.hostname);
			return Ok(());
		}
		let mut commands: Vec<String> = firewall_ports(role)
			.iter()
			.map(|port| format!("firewall-cmd --permanent --add-port={port}"))
			.collect();
		commands.push("firewall-cmd --permanent --zone=trusted --add-source=10.42.0.0/16".to_owned());
		commands.push("firewall-cmd --permanent --zone=trusted --add-source=10.43.0.0/16".to_owned());
		commands.push("firewall-cmd --reload".to_owned());
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
			.map(|port| format!("firewall-cmd --permanent --remove-port={port}"))
			.collect();
		commands.push("firewall-cmd --permanent --zone=trusted --remove-source=10.42.0.0/16".to_owned());
		commands.push("firewall-cmd --permanent --zone=trusted --remove-source=10.43.0.0/16".to_owned());
		commands.push("firewall-cmd --reload".to_owned());
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
			info!("[{}] Installing NVIDIA container toolkit from staged rpms.", node.hostname);
			let commands = vec![
				format!(
					"mkdir -p /tmp/nvidia-rpms && tar -xzf {staging}/nvidia-container-toolkit.tar.gz -C /tmp/nvidia-rpms"
				),
				"dnf install -y --nogpgcheck /tmp/nvidia-rpms/*.rpm".to_owned(),
			];
			run_all(exec, node, &commands).await?;
		} else {
			info!("[{}] Installing NVIDIA container toolkit.", node.hostname);
			let commands = vec![
				"curl -sfL https://nvidia.github.io/libnvidia-container/stable/rpm/nvidia-container-toolkit.repo \
				| tee /etc/yum.repos.d/nvidia-container-toolkit.repo >/dev/null"
					.to_owned(),
				"dnf install -y nvidia-container-toolkit".to_owned(),
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

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn server_ports_include_etcd_and_supervisor() {
		let ports = firewall_ports(NodeRole::FirstServer);
		assert!(ports.contains(&"2379-2380/tcp"));
		assert!(ports.contains(&"9345/tcp"));
		assert!(ports.contains(&"30000-32767/tcp"));
	}

	#[test]
	fn agent_ports_stay_minimal() {
		let ports = firewall_ports(NodeRole::Agent);
		assert!(!ports.contains(&"6443/tcp"));
		assert!(ports.contains(&"10250/tcp"));
	}

	#[test]
	fn kubelet_port_is_not_duplicated_for_servers() {
		let ports = firewall_ports(NodeRole::JoiningServer);
		assert_eq!(ports.iter().filter(|p| **p == "10250/tcp").count(), 1);
	}
}
