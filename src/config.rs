use crate::error::DeployError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Distribution {
	Rke2,
	K3s,
	EksAnywhere,
	Kubeadm,
}

impl Distribution {
	pub const ALL: &[Distribution] = &[
		Distribution::Rke2,
		Distribution::K3s,
		Distribution::EksAnywhere,
		Distribution::Kubeadm,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			Distribution::Rke2 => "rke2",
			Distribution::K3s => "k3s",
			Distribution::EksAnywhere => "eks-anywhere",
			Distribution::Kubeadm => "kubeadm",
		}
	}
}

impl fmt::Display for Distribution {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
	Rhel,
	Rocky,
	Centos,
	Ubuntu,
	Debian,
}

impl OsFamily {
	pub const ALL: &[OsFamily] = &[
		OsFamily::Rhel,
		OsFamily::Rocky,
		OsFamily::Centos,
		OsFamily::Ubuntu,
		OsFamily::Debian,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			OsFamily::Rhel => "rhel",
			OsFamily::Rocky => "rocky",
			OsFamily::Centos => "centos",
			OsFamily::Ubuntu => "ubuntu",
			OsFamily::Debian => "debian",
		}
	}
}

impl fmt::Display for OsFamily {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
	Containerd,
	Crio,
}

/// The node's place in the cluster, assigned once when the deploy plan is
/// built. Never re-derived from list position after that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
	FirstServer,
	JoiningServer,
	Agent,
}

impl NodeRole {
	pub fn is_server(&self) -> bool {
		matches!(self, NodeRole::FirstServer | NodeRole::JoiningServer)
	}

	pub fn service_suffix(&self) -> &'static str {
		if self.is_server() {
			"server"
		} else {
			"agent"
		}
	}
}

impl fmt::Display for NodeRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			NodeRole::FirstServer => "first server",
			NodeRole::JoiningServer => "joining server",
			NodeRole::Agent => "agent",
		};
		f.write_str(label)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
	pub cluster: ClusterSection,
	pub deployment: DeploymentSection,
	pub nodes: NodeInventory,
	#[serde(default)]
	pub packages: BTreeMap<String, PackageBundle>,
	#[serde(default)]
	pub extra_tools: Vec<ToolSpec>,
	#[serde(default)]
	pub ssh: SshSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSection {
	pub name: String,
	#[serde(default)]
	pub domain: Option<String>,
	/// Static join token. When absent, RKE2/K3s fall back to the dynamic
	/// token generated by the first server.
	#[serde(default)]
	pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSection {
	pub distribution: Distribution,
	pub os: OsSection,
	#[serde(default)]
	pub airgap: AirgapSection,
	#[serde(default = "default_runtime")]
	pub runtime: Runtime,
	#[serde(default)]
	pub settings: DistroSettings,
}

fn default_runtime() -> Runtime {
	Runtime::Containerd
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsSection {
	pub family: OsFamily,
	pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AirgapSection {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub local_registry: Option<String>,
	#[serde(default = "default_bundle_staging")]
	pub bundle_staging_path: String,
	#[serde(default = "default_image_staging")]
	pub image_staging_path: String,
}

fn default_bundle_staging() -> String {
	"/opt/k8s-bundles".to_owned()
}

fn default_image_staging() -> String {
	"/opt/container-images".to_owned()
}

/// Distribution settings. A single shape shared by every distribution;
/// each handler reads the fields it cares about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistroSettings {
	#[serde(default)]
	pub version: Option<String>,
	#[serde(default)]
	pub airgap_bundle_path: Option<PathBuf>,
	#[serde(default)]
	pub images_bundle_path: Option<PathBuf>,
	#[serde(default)]
	pub rpm_bundle_path: Option<PathBuf>,
	#[serde(default)]
	pub install_script_path: Option<PathBuf>,
	#[serde(default)]
	pub binary_path: Option<PathBuf>,
	#[serde(default)]
	pub cluster_cidr: Option<String>,
	#[serde(default)]
	pub service_cidr: Option<String>,
	#[serde(default)]
	pub cni: Vec<String>,
	#[serde(default)]
	pub disable: Vec<String>,
	#[serde(default)]
	pub write_kubeconfig_mode: Option<String>,
	/// Registry mirror/auth configuration, rendered verbatim into the
	/// distribution's registries.yaml. Not validated beyond being YAML.
	#[serde(default)]
	pub registry: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInventory {
	pub servers: Vec<NodeSpec>,
	#[serde(default)]
	pub agents: Vec<NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
	pub hostname: String,
	pub ip: String,
	pub user: String,
	pub ssh_key: PathBuf,
	#[serde(default = "default_ssh_port")]
	pub port: u16,
	// `password` is the pre-migration name for this field.
	#[serde(default, alias = "password")]
	pub sudo_password: Option<String>,
	#[serde(default)]
	pub os: Option<OsFamily>,
	#[serde(default)]
	pub gpu: bool,
	#[serde(default)]
	pub staging_paths: Option<StagingPaths>,
	#[serde(default)]
	pub labels: BTreeMap<String, String>,
}

fn default_ssh_port() -> u16 {
	22
}

impl NodeSpec {
	pub fn bundle_staging_path<'a>(&'a self, spec: &'a ClusterSpec) -> &'a str {
		self.staging_paths
			.as_ref()
			.map(|sp| sp.bundles.as_str())
			.unwrap_or(&spec.deployment.airgap.bundle_staging_path)
	}

	pub fn image_staging_path<'a>(&'a self, spec: &'a ClusterSpec) -> &'a str {
		self.staging_paths
			.as_ref()
			.map(|sp| sp.images.as_str())
			.unwrap_or(&spec.deployment.airgap.image_staging_path)
	}

	pub fn os_family(&self, spec: &ClusterSpec) -> OsFamily {
		self.os.unwrap_or(spec.deployment.os.family)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingPaths {
	pub bundles: String,
	pub images: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageBundle {
	pub bundle_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
	pub name: String,
	#[serde(default)]
	pub bundle_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
	#[serde(default = "default_connection_timeout")]
	pub connection_timeout_secs: u64,
	#[serde(default = "default_command_timeout")]
	pub command_timeout_secs: u64,
	#[serde(default = "default_transfer_timeout")]
	pub transfer_timeout_secs: u64,
}

fn default_connection_timeout() -> u64 {
	30
}

fn default_command_timeout() -> u64 {
	600
}

fn default_transfer_timeout() -> u64 {
	1800
}

impl Default for SshSettings {
	fn default() -> Self {
		SshSettings {
			connection_timeout_secs: default_connection_timeout(),
			command_timeout_secs: default_command_timeout(),
			transfer_timeout_secs: default_transfer_timeout(),
		}
	}
}

impl ClusterSpec {
	pub fn load(path: &Path) -> Result<Self, DeployError> {
		let text = std::fs::read_to_string(path).map_err(|err| {
			DeployError::Config(format!("cannot read {}: {err}", path.display()))
		})?;
		let spec: ClusterSpec = serde_yaml::from_str(&text)
			.map_err(|err| DeployError::Config(format!("{}: {err}", path.display())))?;
		spec.check_shape()?;
		Ok(spec)
	}

	/// Structural checks that serde cannot express.
	fn check_shape(&self) -> Result<(), DeployError> {
		if self.nodes.servers.is_empty() {
			return Err(DeployError::Config(
				"at least one server node is required".to_owned(),
			));
		}
		if self.cluster.name.trim().is_empty() {
			return Err(DeployError::Config("cluster.name must not be empty".to_owned()));
		}
		if self.deployment.distribution == Distribution::Kubeadm && self.cluster.token.is_none() {
			return Err(DeployError::Config(
				"kubeadm requires a static cluster.token".to_owned(),
			));
		}
		// No dynamic token file to read back, so multi-node clusters need
		// a token up front.
		if self.deployment.distribution == Distribution::EksAnywhere
			&& self.all_nodes().count() > 1
			&& self.cluster.token.is_none()
		{
			return Err(DeployError::Config(
				"eks-anywhere with more than one node requires a static cluster.token".to_owned(),
			));
		}
		Ok(())
	}

	pub fn first_server(&self) -> &NodeSpec {
		// check_shape guarantees at least one server.
		&self.nodes.servers[0]
	}

	pub fn all_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
		self.nodes.servers.iter().chain(self.nodes.agents.iter())
	}

	/// Emit a starter spec for `generate-config`.
	pub fn template(distribution: Distribution, os: OsFamily, airgapped: bool) -> Self {
		let settings = match distribution {
			Distribution::Rke2 => DistroSettings {
				version: Some("v1.31.4+rke2r1".to_owned()),
				airgap_bundle_path: airgapped
					.then(|| PathBuf::from("/opt/bundles/rke2-airgap-bundle.tar.gz")),
				images_bundle_path: airgapped
					.then(|| PathBuf::from("/opt/bundles/rke2-images.linux-amd64.tar.zst")),
				rpm_bundle_path: airgapped.then(|| PathBuf::from("/opt/bundles/rke2-rpms.tar.gz")),
				install_script_path: airgapped.then(|| PathBuf::from("/opt/bundles/install.sh")),
				cluster_cidr: Some("10.42.0.0/16".to_owned()),
				service_cidr: Some("10.43.0.0/16".to_owned()),
				cni: vec!["canal".to_owned()],
				disable: vec!["rke2-ingress-nginx".to_owned()],
				write_kubeconfig_mode: Some("0644".to_owned()),
				..DistroSettings::default()
			},
			Distribution::K3s => DistroSettings {
				version: Some("v1.31.4+k3s1".to_owned()),
				binary_path: airgapped.then(|| PathBuf::from("/opt/bundles/k3s")),
				images_bundle_path: airgapped
					.then(|| PathBuf::from("/opt/bundles/k3s-airgap-images.tar.gz")),
				..DistroSettings::default()
			},
			Distribution::EksAnywhere | Distribution::Kubeadm => DistroSettings {
				version: Some("v1.31.0".to_owned()),
				..DistroSettings::default()
			},
		};
		let mut packages = BTreeMap::new();
		if airgapped {
			packages.insert(
				os.as_str().to_owned(),
				PackageBundle {
					bundle_path: PathBuf::from(format!("/opt/bundles/{os}-packages.tar.gz")),
				},
			);
		}
		ClusterSpec {
			cluster: ClusterSection {
				name: format!("{distribution}-cluster"),
				domain: Some("internal.local".to_owned()),
				token: Some("example-token::server:example-hash".to_owned()),
			},
			deployment: DeploymentSection {
				distribution,
				os: OsSection {
					family: os,
					version: default_os_version(os).to_owned(),
				},
				airgap: AirgapSection {
					enabled: airgapped,
					local_registry: airgapped.then(|| "registry.internal.local:5000".to_owned()),
					bundle_staging_path: default_bundle_staging(),
					image_staging_path: default_image_staging(),
				},
				runtime: Runtime::Containerd,
				settings,
			},
			nodes: NodeInventory {
				servers: vec![NodeSpec {
					hostname: format!("{distribution}-server-1"),
					ip: "10.0.4.10".to_owned(),
					user: "k8s-admin".to_owned(),
					ssh_key: PathBuf::from("~/.ssh/cluster_key"),
					port: default_ssh_port(),
					sudo_password: None,
					os: None,
					gpu: false,
					staging_paths: None,
					labels: BTreeMap::new(),
				}],
				agents: vec![NodeSpec {
					hostname: format!("{distribution}-agent-1"),
					ip: "10.0.4.177".to_owned(),
					user: "k8s-admin".to_owned(),
					ssh_key: PathBuf::from("~/.ssh/cluster_key"),
					port: default_ssh_port(),
					sudo_password: None,
					os: None,
					gpu: false,
					staging_paths: None,
					labels: BTreeMap::new(),
				}],
			},
			packages,
			extra_tools: vec![
				ToolSpec {
					name: "k9s".to_owned(),
					bundle_path: airgapped.then(|| PathBuf::from("/opt/bundles/k9s")),
				},
				ToolSpec {
					name: "helm".to_owned(),
					bundle_path: airgapped.then(|| PathBuf::from("/opt/bundles/helm")),
				},
			],
			ssh: SshSettings::default(),
		}
	}
}

fn default_os_version(os: OsFamily) -> &'static str {
	match os {
		OsFamily::Rhel | OsFamily::Rocky | OsFamily::Centos => "8",
		OsFamily::Ubuntu => "22.04",
		OsFamily::Debian => "12",
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	const MINIMAL: &str = r#"
cluster:
  name: lab
deployment:
  distribution: rke2
  os:
    family: rhel
    version: "8"
nodes:
  servers:
    - hostname: srv-1
      ip: 10.0.0.1
      user: k8s-admin
      ssh_key: /home/op/.ssh/id_ed25519
  agents:
    - hostname: agt-1
      ip: 10.0.0.2
      user: k8s-admin
      ssh_key: /home/op/.ssh/id_ed25519
"#;

	fn write_temp(contents: &str) -> tempfile::NamedTempFile {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(contents.as_bytes()).unwrap();
		file
	}

	#[test]
	fn load_minimal_spec() {
		let file = write_temp(MINIMAL);
		let spec = ClusterSpec::load(file.path()).unwrap();
		assert_eq!(spec.cluster.name, "lab");
		assert_eq!(spec.deployment.distribution, Distribution::Rke2);
		assert_eq!(spec.nodes.servers.len(), 1);
		assert_eq!(spec.nodes.agents.len(), 1);
		assert!(!spec.deployment.airgap.enabled);
		assert_eq!(spec.ssh.command_timeout_secs, 600);
	}

	#[test]
	fn unknown_distribution_is_a_config_error() {
		let file = write_temp(&MINIMAL.replace("rke2", "openshift"));
		let err = ClusterSpec::load(file.path()).unwrap_err();
		assert!(matches!(err, DeployError::Config(_)));
	}

	#[test]
	fn empty_server_list_is_rejected() {
		let broken = MINIMAL.replace(
			"  servers:\n    - hostname: srv-1\n      ip: 10.0.0.1\n      user: k8s-admin\n      ssh_key: /home/op/.ssh/id_ed25519\n",
			"  servers: []\n",
		);
		let file = write_temp(&broken);
		assert!(ClusterSpec::load(file.path()).is_err());
	}

	#[test]
	fn legacy_password_field_migrates_to_sudo_password() {
		let legacy = MINIMAL.replace(
			"      ssh_key: /home/op/.ssh/id_ed25519\n  agents:",
			"      ssh_key: /home/op/.ssh/id_ed25519\n      password: hunter2\n  agents:",
		);
		let file = write_temp(&legacy);
		let spec = ClusterSpec::load(file.path()).unwrap();
		assert_eq!(spec.nodes.servers[0].sudo_password.as_deref(), Some("hunter2"));
	}

	#[test]
	fn template_round_trips_through_yaml() {
		let spec = ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, true);
		let text = serde_yaml::to_string(&spec).unwrap();
		let parsed: ClusterSpec = serde_yaml::from_str(&text).unwrap();
		assert_eq!(parsed.deployment.distribution, Distribution::Rke2);
		assert!(parsed.deployment.airgap.enabled);
		assert!(parsed.deployment.settings.airgap_bundle_path.is_some());
	}
}
