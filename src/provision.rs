use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::distro::{DistributionHandler, JoinContext};
use crate::error::DeployError;
use crate::executor::{run, run_all, run_all_tolerant, Connector, RemoteExecutor};
use crate::os::{self, OsHandler};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// The provisioning pipeline for one node. States run strictly in this
/// order; a failure in any state fails the node at that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
	Connect,
	OsPrepare,
	RuntimePrepare,
	DistributionPrepare,
	DistributionInstall,
	ServiceStart,
	PostInstallExtras,
}

impl fmt::Display for ProvisionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			ProvisionState::Connect => "connect",
			ProvisionState::OsPrepare => "os-prepare",
			ProvisionState::RuntimePrepare => "runtime-prepare",
			ProvisionState::DistributionPrepare => "distribution-prepare",
			ProvisionState::DistributionInstall => "distribution-install",
			ProvisionState::ServiceStart => "service-start",
			ProvisionState::PostInstallExtras => "post-install-extras",
		};
		f.write_str(label)
	}
}

#[derive(Debug)]
pub struct ProvisionOutcome {
	pub hostname: String,
	/// Join token read back from the first server, when the distribution
	/// generates one dynamically.
	pub retrieved_token: Option<String>,
	pub warnings: Vec<String>,
}

const SERVICE_POLL: Duration = Duration::from_secs(5);
const SERVICE_WAIT_ATTEMPTS: u32 = 60;
const KUBECONFIG_WAIT_ATTEMPTS: u32 = 24;
const TOKEN_WAIT_ATTEMPTS: u32 = 24;

pub struct NodeProvisioner<'a> {
	spec: &'a ClusterSpec,
	connector: &'a dyn Connector,
	distro: &'a dyn DistributionHandler,
}

impl<'a> NodeProvisioner<'a> {
	pub fn new(
		spec: &'a ClusterSpec,
		connector: &'a dyn Connector,
		distro: &'a dyn DistributionHandler,
	) -> Self {
		NodeProvisioner {
			spec,
			connector,
			distro,
		}
	}

	/// Drive a node through the whole pipeline. Joining roles must carry a
	/// join context; the first server never does.
	pub async fn provision(
		&self,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
	) -> Result<ProvisionOutcome, DeployError> {
		if role != NodeRole::FirstServer && join.is_none() {
			return Err(DeployError::TokenUnavailable);
		}
		let mut outcome = ProvisionOutcome {
			hostname: node.hostname.clone(),
			retrieved_token: None,
			warnings: Vec::new(),
		};
		info!("[{}] Provisioning as {role}: {}.", node.hostname, ProvisionState::Connect);
		let mut exec = self.connector.connect(node).await?;
		let result = self
			.run_pipeline(exec.as_mut(), node, role, join, &mut outcome)
			.await;
		if let Err(close_err) = exec.close().await {
			warn!("[{}] Error closing session: {close_err}", node.hostname);
		}
		result.map(|()| outcome)
	}

	async fn run_pipeline(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
		join: Option<&JoinContext<'_>>,
		outcome: &mut ProvisionOutcome,
	) -> Result<(), DeployError> {
		let os_handler = os::handler_for(node.os_family(self.spec));

		info!("[{}] {}.", node.hostname, ProvisionState::OsPrepare);
		self.os_prepare(exec, node, role, os_handler.as_ref()).await?;

		if self.distro.manages_runtime() {
			info!(
				"[{}] {} skipped: {} ships its own runtime.",
				node.hostname,
				ProvisionState::RuntimePrepare,
				self.distro.name()
			);
		} else {
			info!("[{}] {}.", node.hostname, ProvisionState::RuntimePrepare);
			os_handler
				.install_runtime(exec, self.spec, node, self.spec.deployment.runtime)
				.await?;
		}

		info!("[{}] {}.", node.hostname, ProvisionState::DistributionPrepare);
		self.distro.prepare(exec, self.spec, node, role, join).await?;

		info!("[{}] {}.", node.hostname, ProvisionState::DistributionInstall);
		self.distro.install(exec, self.spec, node, role, join).await?;

		info!("[{}] {}.", node.hostname, ProvisionState::ServiceStart);
		let kubeconfig_ready = self.service_start(exec, node, role, outcome).await?;

		if role == NodeRole::FirstServer {
			outcome.retrieved_token = self.read_generated_token(exec, node).await?;
		}

		info!("[{}] {}.", node.hostname, ProvisionState::PostInstallExtras);
		self.post_install_extras(exec, node, role, kubeconfig_ready, outcome)
			.await;
		Ok(())
	}

	async fn os_prepare(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
		os_handler: &dyn OsHandler,
	) -> Result<(), DeployError> {
		os_handler.install_base_packages(exec, self.spec, node).await?;
		os_handler.disable_swap(exec, node).await?;
		os_handler.configure_kernel_modules(exec, node).await?;
		os_handler.configure_mandatory_access(exec, node).await?;
		os_handler.configure_firewall(exec, node, role).await
	}

	/// Enable and start the unit, then wait for it to report active. For
	/// servers, additionally wait for the kubeconfig to appear; that wait
	/// timing out is a warning, not a failure.
	async fn service_start(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
		outcome: &mut ProvisionOutcome,
	) -> Result<bool, DeployError> {
		let Some(unit) = self.distro.service_unit(role) else {
			info!(
				"[{}] {} runs no systemd unit; nothing to start.",
				node.hostname,
				self.distro.name()
			);
			return Ok(true);
		};
		run_all(
			exec,
			node,
			&[
				format!("systemctl enable {unit}"),
				format!("systemctl start {unit}"),
			],
		)
		.await?;
		self.wait_for_active(exec, node, &unit).await?;
		info!("[{}] Service {unit} is active.", node.hostname);
		if !role.is_server() {
			return Ok(true);
		}
		let Some(kubeconfig) = self.distro.kubeconfig_path() else {
			return Ok(true);
		};
		for _ in 0..KUBECONFIG_WAIT_ATTEMPTS {
			let check = exec.exec(&format!("test -f {kubeconfig}"), true).await?;
			if check.success() {
				return Ok(true);
			}
			tokio::time::sleep(SERVICE_POLL).await;
		}
		let warning = format!("kubeconfig {kubeconfig} did not appear; skipping kubectl extras");
		warn!("[{}] {warning}", node.hostname);
		outcome.warnings.push(warning);
		Ok(false)
	}

	async fn wait_for_active(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		unit: &str,
	) -> Result<(), DeployError> {
		let command = format!("systemctl is-active {unit}");
		for _ in 0..SERVICE_WAIT_ATTEMPTS {
			let output = exec.exec(&command, true).await?;
			if output.stdout.trim() == "active" {
				return Ok(());
			}
			if output.stdout.trim() == "failed" {
				return Err(DeployError::command_failed(
					&node.hostname,
					&command,
					output.exit_code,
					"unit entered failed state",
				));
			}
			tokio::time::sleep(SERVICE_POLL).await;
		}
		Err(DeployError::Timeout {
			node: node.hostname.clone(),
			what: format!("service {unit} to become active"),
			secs: SERVICE_WAIT_ATTEMPTS as u64 * SERVICE_POLL.as_secs(),
		})
	}

	/// Read the token the first server generated, retrying while the file
	/// materializes. Distributions with static-only tokens return None.
	async fn read_generated_token(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<Option<String>, DeployError> {
		let Some(path) = self.distro.token_path() else {
			return Ok(None);
		};
		let command = format!("cat {path}");
		for _ in 0..TOKEN_WAIT_ATTEMPTS {
			let output = exec.exec(&command, true).await?;
			let token = output.stdout.trim();
			if output.success() && !token.is_empty() {
				info!("[{}] Retrieved generated join token.", node.hostname);
				return Ok(Some(token.to_owned()));
			}
			tokio::time::sleep(SERVICE_POLL).await;
		}
		Err(DeployError::Timeout {
			node: node.hostname.clone(),
			what: format!("join token at {path}"),
			secs: TOKEN_WAIT_ATTEMPTS as u64 * SERVICE_POLL.as_secs(),
		})
	}

	/// First-server-only and best-effort: the node is already a cluster
	/// member, and kubectl plus the extra tools live where the operator
	/// logs in.
	async fn post_install_extras(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		role: NodeRole,
		kubeconfig_ready: bool,
		outcome: &mut ProvisionOutcome,
	) {
		if role != NodeRole::FirstServer {
			return;
		}
		if kubeconfig_ready {
			if let Some(kubeconfig) = self.distro.kubeconfig_path() {
				let mut commands = vec![
					"mkdir -p /root/.kube".to_owned(),
					format!("cp {kubeconfig} /root/.kube/config"),
					"chmod 600 /root/.kube/config".to_owned(),
				];
				if let Some(kubectl) = self.distro.kubectl_source() {
					commands.push(format!("ln -sf {kubectl} /usr/local/bin/kubectl"));
				}
				run_all_tolerant(exec, node, &commands).await;
			}
		}
		for tool in &self.spec.extra_tools {
			let result = self.install_tool(exec, node, tool).await;
			if let Err(err) = result {
				let warning = format!("tool {} not installed: {err}", tool.name);
				warn!("[{}] {warning}", node.hostname);
				outcome.warnings.push(warning);
			}
		}
	}

	async fn install_tool(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
		tool: &crate::config::ToolSpec,
	) -> Result<(), DeployError> {
		if self.spec.deployment.airgap.enabled {
			if tool.bundle_path.is_none() {
				info!(
					"[{}] No bundle for tool {}; skipping in airgapped mode.",
					node.hostname, tool.name
				);
				return Ok(());
			}
			let staging = node.bundle_staging_path(self.spec);
			let command = format!(
				"cp {staging}/{name} /usr/local/bin/{name} && chmod +x /usr/local/bin/{name}",
				name = tool.name
			);
			run(exec, node, &command).await?;
		} else {
			let Some(command) = online_installer(&tool.name) else {
				info!(
					"[{}] Tool {} has no online installer; skipping.",
					node.hostname, tool.name
				);
				return Ok(());
			};
			run(exec, node, &command).await?;
		}
		Ok(())
	}
}

/// Download command for a tool when the node has internet access. Tools
/// without one are skipped with a log line.
fn online_installer(name: &str) -> Option<String> {
	let command = match name {
		"helm" => {
			"curl -fsSL https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3 | bash"
		}
		"k9s" => {
			"curl -sfL https://github.com/derailed/k9s/releases/latest/download/k9s_Linux_amd64.tar.gz | tar -xz -C /usr/local/bin k9s"
		}
		"flux" => "curl -sfL https://fluxcd.io/install.sh | bash",
		_ => return None,
	};
	Some(command.to_owned())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{ClusterSpec, Distribution, OsFamily};
	use crate::distro;
	use crate::executor::mock::MockConnector;

	fn airgapped_spec() -> ClusterSpec {
		ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, true)
	}

	#[tokio::test]
	async fn first_server_returns_the_generated_token() {
		let spec = airgapped_spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		let outcome = provisioner
			.provision(spec.first_server(), NodeRole::FirstServer, None)
			.await
			.unwrap();
		assert_eq!(
			outcome.retrieved_token.as_deref(),
			Some("K10mocktoken::server:mock")
		);
	}

	#[tokio::test]
	async fn joining_role_without_join_context_is_rejected() {
		let spec = airgapped_spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		let err = provisioner
			.provision(&spec.nodes.agents[0], NodeRole::Agent, None)
			.await
			.unwrap_err();
		assert!(matches!(err, DeployError::TokenUnavailable));
		// Rejected before any remote interaction.
		assert!(mock.connected_nodes().is_empty());
	}

	#[tokio::test]
	async fn runtime_prepare_is_skipped_when_the_distribution_ships_one() {
		let spec = airgapped_spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		provisioner
			.provision(spec.first_server(), NodeRole::FirstServer, None)
			.await
			.unwrap();
		let commands = mock.commands_on(&spec.first_server().hostname);
		assert!(!commands.iter().any(|c| c.contains("containerd.io")));
	}

	#[tokio::test]
	async fn install_failure_reports_the_failing_command() {
		let spec = airgapped_spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		mock.fail_command(&spec.first_server().hostname, "rke2-airgap-bundle");
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		let err = provisioner
			.provision(spec.first_server(), NodeRole::FirstServer, None)
			.await
			.unwrap_err();
		assert!(matches!(err, DeployError::CommandFailed { .. }));
	}

	#[tokio::test]
	async fn online_first_server_installs_tools_from_release_urls() {
		use crate::config::ToolSpec;
		let mut spec = ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, false);
		spec.extra_tools.push(ToolSpec {
			name: "flux".to_owned(),
			bundle_path: None,
		});
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		let outcome = provisioner
			.provision(spec.first_server(), NodeRole::FirstServer, None)
			.await
			.unwrap();
		assert!(outcome.warnings.is_empty());
		let commands = mock.commands_on(&spec.first_server().hostname);
		assert!(commands
			.iter()
			.any(|c| c.contains("get-helm-3")));
		assert!(commands
			.iter()
			.any(|c| c.contains("k9s_Linux_amd64.tar.gz") && c.contains("/usr/local/bin")));
		assert!(commands
			.iter()
			.any(|c| c.contains("fluxcd.io/install.sh")));
	}

	#[tokio::test]
	async fn kubectl_and_tools_land_only_on_the_first_server() {
		let spec = airgapped_spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		provisioner
			.provision(spec.first_server(), NodeRole::FirstServer, None)
			.await
			.unwrap();
		assert!(mock
			.commands_on(&spec.first_server().hostname)
			.iter()
			.any(|c| c.contains("/root/.kube")));

		let mut second = spec.first_server().clone();
		second.hostname = "rke2-server-2".to_owned();
		second.ip = "10.0.4.11".to_owned();
		let join = JoinContext {
			server_ip: "10.0.4.10",
			token: "K10abc",
		};
		provisioner
			.provision(&second, NodeRole::JoiningServer, Some(&join))
			.await
			.unwrap();
		let commands = mock.commands_on("rke2-server-2");
		assert!(!commands.iter().any(|c| c.contains("/root/.kube")));
		assert!(!commands.iter().any(|c| c.contains("/usr/local/bin/k9s")));
	}

	#[tokio::test]
	async fn agent_with_join_context_points_at_the_server() {
		let spec = airgapped_spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let provisioner = NodeProvisioner::new(&spec, &mock, handler.as_ref());
		let join = JoinContext {
			server_ip: "10.0.4.10",
			token: "K10abc",
		};
		provisioner
			.provision(&spec.nodes.agents[0], NodeRole::Agent, Some(&join))
			.await
			.unwrap();
		let commands = mock.commands_on(&spec.nodes.agents[0].hostname);
		assert!(commands
			.iter()
			.any(|c| c.contains("server: https://10.0.4.10:9345")));
	}
}
