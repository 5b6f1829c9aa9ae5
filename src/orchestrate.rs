use crate::bundle::{BundleManifest, BundleStager};
use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::distro::{self, DistributionHandler, JoinContext};
use crate::error::DeployError;
use crate::executor::Connector;
use crate::health::{HealthChecker, HealthReport};
use crate::os;
use crate::plan::DeployPlan;
use crate::provision::NodeProvisioner;
use crate::token::ClusterToken;
use crate::validate::Validator;
use tracing::{error, info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct DeployOptions {
	pub dry_run: bool,
	pub skip_validation: bool,
	pub stage_only: bool,
}

#[derive(Debug, Default)]
pub struct DeployReport {
	pub provisioned: Vec<String>,
	pub agent_failures: Vec<(String, String)>,
	pub warnings: Vec<String>,
	pub health: Option<HealthReport>,
}

impl DeployReport {
	pub fn success(&self) -> bool {
		self.agent_failures.is_empty()
	}
}

/// Drives a full cluster rollout: validation, staging, the first server,
/// joining servers in inventory order, then agents. A server failure aborts
/// the run, an agent failure only loses that agent.
pub struct ClusterOrchestrator<'a> {
	spec: &'a ClusterSpec,
	connector: &'a dyn Connector,
	distro: Box<dyn DistributionHandler>,
}

impl<'a> ClusterOrchestrator<'a> {
	pub fn new(spec: &'a ClusterSpec, connector: &'a dyn Connector) -> Self {
		ClusterOrchestrator {
			spec,
			connector,
			distro: distro::handler_for(spec.deployment.distribution),
		}
	}

	pub async fn deploy(&self, opts: DeployOptions) -> Result<DeployReport, DeployError> {
		if opts.skip_validation {
			warn!("Pre-flight validation skipped on request.");
		} else {
			let problems = Validator::new(self.spec).collect_problems();
			if !problems.is_empty() {
				for problem in &problems {
					error!("Validation: {problem}");
				}
				return Err(DeployError::Validation(problems.len()));
			}
			info!("All pre-flight checks passed.");
		}

		let plan = DeployPlan::build(self.spec);
		info!("\n{}", plan.render());
		if opts.dry_run {
			info!("Dry run: no nodes were contacted.");
			return Ok(DeployReport::default());
		}

		let manifest = BundleManifest::resolve(self.spec);
		if self.spec.deployment.airgap.enabled {
			// Missing artifacts fail here, before any SSH connection.
			if let Some(artifact) = manifest.missing().first() {
				return Err(DeployError::BundleMissing {
					name: artifact.name.clone(),
					path: artifact.local.clone(),
				});
			}
			self.stage_all(&manifest).await?;
		}
		if opts.stage_only {
			if self.spec.deployment.airgap.enabled {
				info!("Bundles staged on all nodes; stopping as requested.");
			} else {
				info!("Airgap mode is disabled; nothing was staged.");
			}
			return Ok(DeployReport::default());
		}

		let mut report = DeployReport::default();
		let mut token = ClusterToken::seeded(self.spec.cluster.token.as_deref());
		let provisioner = NodeProvisioner::new(self.spec, self.connector, self.distro.as_ref());
		let first_server_ip = self.spec.first_server().ip.clone();

		for entry in plan.servers() {
			let node = self.node_by_hostname(&entry.hostname)?;
			let outcome = match entry.role {
				NodeRole::FirstServer => {
					provisioner.provision(node, entry.role, None).await?
				}
				_ => {
					let join = JoinContext {
						server_ip: &first_server_ip,
						token: token.get()?,
					};
					provisioner.provision(node, entry.role, Some(&join)).await?
				}
			};
			report.warnings.extend(outcome.warnings);
			if let Some(retrieved) = outcome.retrieved_token {
				if token.is_set() {
					info!("Static cluster token in use; ignoring the generated one.");
				} else {
					token.populate(retrieved)?;
				}
			}
			report.provisioned.push(entry.hostname.clone());
			info!("[{}] Server provisioned.", entry.hostname);
		}

		for entry in plan.agents() {
			let node = self.node_by_hostname(&entry.hostname)?;
			let join = JoinContext {
				server_ip: &first_server_ip,
				token: token.get()?,
			};
			match provisioner.provision(node, NodeRole::Agent, Some(&join)).await {
				Ok(outcome) => {
					report.warnings.extend(outcome.warnings);
					report.provisioned.push(entry.hostname.clone());
					info!("[{}] Agent provisioned.", entry.hostname);
					// GPU stack goes on right after the agent joins, before
					// the next agent is attempted.
					if entry.gpu {
						info!("[{}] Configuring GPU stack.", entry.hostname);
						if let Err(err) = self.configure_gpu(node).await {
							warn!("[{}] GPU stack not configured: {err}", entry.hostname);
							report.warnings.push(format!(
								"{}: GPU stack not configured: {err}",
								entry.hostname
							));
						}
					}
				}
				Err(err) => {
					error!("[{}] Agent failed, continuing with the rest: {err}", entry.hostname);
					report.agent_failures.push((entry.hostname.clone(), err.to_string()));
				}
			}
		}

		// The cluster is up at this point; a failed sweep is reported, not
		// fatal. Only servers are probed, joined agents are left alone.
		let checker = HealthChecker::new(self.spec, self.connector, self.distro.as_ref());
		match checker.sweep_servers().await {
			Ok(health) => report.health = Some(health),
			Err(err) => {
				warn!("Health sweep failed: {err}");
				report.warnings.push(format!("health sweep failed: {err}"));
			}
		}
		Ok(report)
	}

	/// Stage the bundle manifest onto every node in the inventory.
	pub async fn stage_all(&self, manifest: &BundleManifest) -> Result<(), DeployError> {
		let stager = BundleStager::new(self.spec, manifest);
		for node in self.spec.all_nodes() {
			info!("[{}] Staging bundles.", node.hostname);
			let mut exec = self.connector.connect(node).await?;
			let result = stager.stage(exec.as_mut(), node).await;
			if let Err(close_err) = exec.close().await {
				warn!("[{}] Error closing session: {close_err}", node.hostname);
			}
			result?;
		}
		Ok(())
	}

	/// Failures here degrade the node to CPU-only scheduling, so the caller
	/// only warns.
	async fn configure_gpu(&self, node: &NodeSpec) -> Result<(), DeployError> {
		let os_handler = os::handler_for(node.os_family(self.spec));
		let mut exec = self.connector.connect(node).await?;
		let result = os_handler.install_gpu_stack(exec.as_mut(), self.spec, node).await;
		if let Err(close_err) = exec.close().await {
			warn!("[{}] Error closing session: {close_err}", node.hostname);
		}
		result
	}

	fn node_by_hostname(&self, hostname: &str) -> Result<&NodeSpec, DeployError> {
		self.spec
			.all_nodes()
			.find(|node| node.hostname == hostname)
			.ok_or_else(|| DeployError::Config(format!("node '{hostname}' vanished from the inventory")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Distribution, NodeSpec, OsFamily};
	use crate::executor::mock::{Event, MockConnector};

	/// Online three-node cluster: two servers, one agent, dynamic token.
	fn three_node_spec() -> ClusterSpec {
		let mut spec = ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, false);
		spec.cluster.token = None;
		spec.extra_tools.clear();
		let second = NodeSpec {
			hostname: "rke2-server-2".to_owned(),
			ip: "10.0.4.11".to_owned(),
			..spec.nodes.servers[0].clone()
		};
		spec.nodes.servers.push(second);
		spec
	}

	fn opts() -> DeployOptions {
		DeployOptions {
			skip_validation: true,
			..DeployOptions::default()
		}
	}

	#[tokio::test]
	async fn servers_deploy_in_order_before_any_agent() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let report = orchestrator.deploy(opts()).await.unwrap();
		assert_eq!(
			report.provisioned,
			vec!["rke2-server-1", "rke2-server-2", "rke2-agent-1"]
		);
		assert_eq!(
			&mock.connected_nodes()[..3],
			&["rke2-server-1", "rke2-server-2", "rke2-agent-1"]
		);
	}

	#[tokio::test]
	async fn generated_token_flows_into_every_join_config() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		orchestrator.deploy(opts()).await.unwrap();
		for hostname in ["rke2-server-2", "rke2-agent-1"] {
			let commands = mock.commands_on(hostname);
			assert!(
				commands
					.iter()
					.any(|c| c.contains("token: K10mocktoken::server:mock")
						&& c.contains("server: https://10.0.4.10:9345")),
				"{hostname} must join the first server with the generated token"
			);
		}
	}

	#[tokio::test]
	async fn joining_server_failure_aborts_before_agents() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		mock.fail_command("rke2-server-2", "get.rke2.io");
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let err = orchestrator.deploy(opts()).await.unwrap_err();
		assert!(matches!(err, DeployError::CommandFailed { .. }));
		assert!(!mock.connected_nodes().contains(&"rke2-agent-1".to_owned()));
	}

	#[tokio::test]
	async fn first_server_connect_failure_stops_everything() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		mock.refuse_connect("rke2-server-1");
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let err = orchestrator.deploy(opts()).await.unwrap_err();
		assert!(matches!(err, DeployError::Connection { .. }));
		assert!(mock.connected_nodes().is_empty());
	}

	#[tokio::test]
	async fn agent_failure_is_isolated_from_other_agents() {
		let mut spec = three_node_spec();
		let second_agent = NodeSpec {
			hostname: "rke2-agent-2".to_owned(),
			ip: "10.0.4.178".to_owned(),
			..spec.nodes.agents[0].clone()
		};
		spec.nodes.agents.push(second_agent);
		let mock = MockConnector::new();
		mock.fail_command("rke2-agent-1", "get.rke2.io");
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let report = orchestrator.deploy(opts()).await.unwrap();
		assert_eq!(report.agent_failures.len(), 1);
		assert_eq!(report.agent_failures[0].0, "rke2-agent-1");
		assert!(report.provisioned.contains(&"rke2-agent-2".to_owned()));
		assert!(!report.success());
	}

	#[tokio::test]
	async fn dry_run_contacts_no_nodes() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let report = orchestrator
			.deploy(DeployOptions {
				dry_run: true,
				skip_validation: true,
				..DeployOptions::default()
			})
			.await
			.unwrap();
		assert!(report.provisioned.is_empty());
		assert!(mock.events().is_empty());
	}

	#[tokio::test]
	async fn airgap_with_missing_artifact_aborts_before_any_connection() {
		let mut spec = three_node_spec();
		spec.deployment.airgap.enabled = true;
		spec.deployment.airgap.local_registry = Some("registry.internal:5000".to_owned());
		spec.deployment.settings.airgap_bundle_path = Some("/nonexistent/bundle.tar.gz".into());
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let err = orchestrator.deploy(opts()).await.unwrap_err();
		assert!(matches!(err, DeployError::BundleMissing { .. }));
		assert!(mock.events().is_empty());
	}

	#[tokio::test]
	async fn stage_only_uploads_and_installs_nothing() {
		use std::io::Write;
		let mut spec = three_node_spec();
		let mut bundle = tempfile::NamedTempFile::new().unwrap();
		bundle.write_all(b"tarball").unwrap();
		spec.deployment.airgap.enabled = true;
		spec.deployment.airgap.local_registry = Some("registry.internal:5000".to_owned());
		spec.deployment.settings.airgap_bundle_path = Some(bundle.path().to_path_buf());
		let mock = MockConnector::new();
		// Force the digest probe to miss so the upload happens.
		mock.respond("sha256sum", "mismatch placeholder");
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let report = orchestrator
			.deploy(DeployOptions {
				stage_only: true,
				skip_validation: true,
				..DeployOptions::default()
			})
			.await
			.unwrap();
		assert!(report.provisioned.is_empty());
		let events = mock.events();
		assert!(events
			.iter()
			.any(|event| matches!(event, Event::Upload { .. })));
		assert!(!mock
			.commands_on("rke2-server-1")
			.iter()
			.any(|c| c.contains("systemctl start")));
	}

	#[tokio::test]
	async fn stage_only_without_airgap_touches_nothing() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let report = orchestrator
			.deploy(DeployOptions {
				stage_only: true,
				skip_validation: true,
				..DeployOptions::default()
			})
			.await
			.unwrap();
		assert!(report.provisioned.is_empty());
		assert!(mock.events().is_empty());
	}

	#[tokio::test]
	async fn post_deploy_sweep_connects_to_each_agent_exactly_once() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		let report = orchestrator.deploy(opts()).await.unwrap();
		assert!(report.health.is_some());
		// The one connection is the agent's own provisioning; the sweep
		// only probes servers.
		let connects = mock.connected_nodes();
		assert_eq!(
			connects.iter().filter(|n| n.as_str() == "rke2-agent-1").count(),
			1
		);
	}

	#[tokio::test]
	async fn gpu_toolkit_goes_on_before_the_next_agent_starts() {
		let mut spec = three_node_spec();
		spec.nodes.agents[0].gpu = true;
		let second_agent = NodeSpec {
			hostname: "rke2-agent-2".to_owned(),
			ip: "10.0.4.178".to_owned(),
			gpu: false,
			..spec.nodes.agents[0].clone()
		};
		spec.nodes.agents.push(second_agent);
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		orchestrator.deploy(opts()).await.unwrap();
		let events = mock.events();
		let toolkit = events
			.iter()
			.position(|event| matches!(event, Event::Exec { node, command }
				if node == "rke2-agent-1" && command.contains("nvidia-ctk runtime configure")))
			.unwrap();
		let next_agent = events
			.iter()
			.position(|event| matches!(event, Event::Connect { node } if node == "rke2-agent-2"))
			.unwrap();
		assert!(toolkit < next_agent);
	}

	#[tokio::test]
	async fn gpu_nodes_get_the_toolkit_after_joining() {
		let mut spec = three_node_spec();
		spec.nodes.agents[0].gpu = true;
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		orchestrator.deploy(opts()).await.unwrap();
		assert!(mock
			.commands_on("rke2-agent-1")
			.iter()
			.any(|c| c.contains("nvidia-ctk runtime configure")));
	}

	#[tokio::test]
	async fn static_token_wins_over_the_generated_one() {
		let mut spec = three_node_spec();
		spec.cluster.token = Some("static-secret".to_owned());
		let mock = MockConnector::new();
		let orchestrator = ClusterOrchestrator::new(&spec, &mock);
		orchestrator.deploy(opts()).await.unwrap();
		assert!(mock
			.commands_on("rke2-agent-1")
			.iter()
			.any(|c| c.contains("token: static-secret")));
	}
}
