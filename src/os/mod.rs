pub mod rhel;
pub mod ubuntu;

use crate::config::{ClusterSpec, NodeRole, NodeSpec, OsFamily, Runtime};
use crate::error::DeployError;
use crate::executor::RemoteExecutor;
use async_trait::async_trait;

pub use rhel::Rhel;
pub use ubuntu::Ubuntu;

/// Control-plane ports opened on servers, on top of the shared set.
pub const SERVER_PORTS: &[&str] = &[
	"6443/tcp",      // kube-apiserver
	"2379-2380/tcp", // etcd client + peer
	"9345/tcp",      // rke2 supervisor
	"10250/tcp",     // kubelet
	"10251/tcp",     // kube-scheduler
	"10252/tcp",     // kube-controller-manager
];

/// Shared kubelet/NodePort ranges opened on every node.
pub const COMMON_PORTS: &[&str] = &["10250/tcp", "30000-32767/tcp"];

#[async_trait]
pub trait OsHandler: Send + Sync {
	fn name(&self) -> &'static str;

	fn package_manager(&self) -> &'static str;

	async fn install_base_packages(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
	) -> Result<(), DeployError>;

	async fn install_runtime(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
		runtime: Runtime,
	) -> Result<(), DeployError>;

	async fn disable_swap(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError>;

	async fn configure_kernel_modules(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError>;

	/// SELinux to permissive, AppArmor profiles to complain.
	async fn configure_mandatory_access(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError>;

	async fn configure_firewall(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
	) -> Result<(), DeployError>;

	/// Best-effort inverse of configure_firewall, used by uninstall.
	async fn remove_firewall_rules(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
	);

	async fn install_gpu_stack(
		&self,
		exec: &mut dyn RemoteExecutor,
		spec: &ClusterSpec,
		node: &NodeSpec,
	) -> Result<(), DeployError>;
}

pub fn handler_for(family: OsFamily) -> Box<dyn OsHandler> {
	match family {
		OsFamily::Rhel | OsFamily::Rocky | OsFamily::Centos => Box::new(Rhel),
		OsFamily::Ubuntu | OsFamily::Debian => Box::new(Ubuntu),
	}
}

/// /etc/modules-load.d + /etc/sysctl.d contents, shared by every OS.
pub(crate) const KERNEL_MODULES: &[&str] = &["overlay", "br_netfilter"];

pub(crate) const SYSCTL_CONF: &str = "net.bridge.bridge-nf-call-iptables = 1\n\
	net.bridge.bridge-nf-call-ip6tables = 1\n\
	net.ipv4.ip_forward = 1\n";
