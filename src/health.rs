use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::distro::DistributionHandler;
use crate::error::DeployError;
use crate::executor::Connector;
use crate::plan::DeployPlan;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
	Healthy,
	ServiceDown,
	Unreachable,
}

impl fmt::Display for NodeHealth {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let label = match self {
			NodeHealth::Healthy => "healthy",
			NodeHealth::ServiceDown => "service down",
			NodeHealth::Unreachable => "unreachable",
		};
		f.write_str(label)
	}
}

#[derive(Debug)]
pub struct HealthReport {
	pub results: Vec<(String, NodeHealth)>,
}

impl HealthReport {
	pub fn all_healthy(&self) -> bool {
		self.results
			.iter()
			.all(|(_, health)| *health == NodeHealth::Healthy)
	}
}

/// Post-deploy health sweep. Connection or command failures downgrade the
/// node's status; they never abort the sweep.
pub struct HealthChecker<'a> {
	spec: &'a ClusterSpec,
	connector: &'a dyn Connector,
	distro: &'a dyn DistributionHandler,
}

impl<'a> HealthChecker<'a> {
	pub fn new(
		spec: &'a ClusterSpec,
		connector: &'a dyn Connector,
		distro: &'a dyn DistributionHandler,
	) -> Self {
		HealthChecker {
			spec,
			connector,
			distro,
		}
	}

	/// Check every node in the plan, or just `only` when given.
	pub async fn sweep(&self, only: Option<&str>) -> Result<HealthReport, DeployError> {
		self.run_sweep(only, false).await
	}

	/// The post-deploy sweep: servers only, agents are left alone.
	pub async fn sweep_servers(&self) -> Result<HealthReport, DeployError> {
		self.run_sweep(None, true).await
	}

	async fn run_sweep(
		&self,
		only: Option<&str>,
		servers_only: bool,
	) -> Result<HealthReport, DeployError> {
		let plan = DeployPlan::build(self.spec);
		let mut results = Vec::new();
		for entry in &plan.entries {
			if servers_only && !entry.role.is_server() {
				continue;
			}
			if let Some(hostname) = only {
				if entry.hostname != hostname {
					continue;
				}
			}
			let Some(node) = self
				.spec
				.all_nodes()
				.find(|node| node.hostname == entry.hostname)
			else {
				continue;
			};
			let health = self.check_node(node, entry.role).await;
			match health {
				NodeHealth::Healthy => info!("[{}] {health}", node.hostname),
				_ => warn!("[{}] {health}", node.hostname),
			}
			results.push((entry.hostname.clone(), health));
		}
		if let Some(hostname) = only {
			if results.is_empty() {
				return Err(DeployError::Config(format!(
					"node '{hostname}' is not in the inventory"
				)));
			}
		} else {
			self.check_cluster_view(&plan).await;
		}
		Ok(HealthReport { results })
	}

	async fn check_node(&self, node: &NodeSpec, role: NodeRole) -> NodeHealth {
		let mut exec = match self.connector.connect(node).await {
			Ok(exec) => exec,
			Err(err) => {
				warn!("[{}] Connection failed: {err}", node.hostname);
				return NodeHealth::Unreachable;
			}
		};
		let health = match self.distro.service_unit(role) {
			Some(unit) => {
				let command = format!("systemctl is-active {unit}");
				match exec.exec(&command, true).await {
					Ok(output) if output.stdout.trim() == "active" => NodeHealth::Healthy,
					Ok(_) => NodeHealth::ServiceDown,
					Err(err) => {
						warn!("[{}] Health probe failed: {err}", node.hostname);
						NodeHealth::Unreachable
					}
				}
			}
			// No unit to probe; reachability is the whole check.
			None => NodeHealth::Healthy,
		};
		if let Err(err) = exec.close().await {
			warn!("[{}] Error closing session: {err}", node.hostname);
		}
		health
	}

	/// Ask the first server for its view of the cluster. Informational only.
	async fn check_cluster_view(&self, plan: &DeployPlan) {
		let Some(kubeconfig) = self.distro.kubeconfig_path() else {
			return;
		};
		let Some(first) = plan.servers().next() else {
			return;
		};
		let Some(node) = self
			.spec
			.all_nodes()
			.find(|node| node.hostname == first.hostname)
		else {
			return;
		};
		let mut exec = match self.connector.connect(node).await {
			Ok(exec) => exec,
			Err(err) => {
				warn!("[{}] Cannot query cluster state: {err}", node.hostname);
				return;
			}
		};
		let command = format!("kubectl get nodes -o wide --kubeconfig {kubeconfig}");
		match exec.exec(&command, true).await {
			Ok(output) if output.success() => {
				info!("Cluster node view:\n{}", output.stdout.trim_end());
			}
			Ok(output) => {
				warn!(
					"[{}] kubectl get nodes exited {}.",
					node.hostname, output.exit_code
				);
			}
			Err(err) => warn!("[{}] kubectl get nodes failed: {err}", node.hostname),
		}
		if let Err(err) = exec.close().await {
			warn!("[{}] Error closing session: {err}", node.hostname);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Distribution, OsFamily};
	use crate::distro;
	use crate::executor::mock::MockConnector;

	fn spec() -> ClusterSpec {
		ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, false)
	}

	#[tokio::test]
	async fn unreachable_node_does_not_abort_the_sweep() {
		let spec = spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		mock.refuse_connect(&spec.nodes.servers[0].hostname);
		let checker = HealthChecker::new(&spec, &mock, handler.as_ref());
		let report = checker.sweep(None).await.unwrap();
		assert_eq!(report.results.len(), 2);
		assert_eq!(report.results[0].1, NodeHealth::Unreachable);
		assert_eq!(report.results[1].1, NodeHealth::Healthy);
	}

	#[tokio::test]
	async fn inactive_service_is_reported_as_down() {
		let spec = spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		mock.respond("systemctl is-active rke2-agent", "inactive");
		let checker = HealthChecker::new(&spec, &mock, handler.as_ref());
		let report = checker.sweep(None).await.unwrap();
		assert_eq!(report.results[1].1, NodeHealth::ServiceDown);
		assert!(!report.all_healthy());
	}

	#[tokio::test]
	async fn server_sweep_never_touches_agents() {
		let spec = spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let checker = HealthChecker::new(&spec, &mock, handler.as_ref());
		let report = checker.sweep_servers().await.unwrap();
		assert_eq!(report.results.len(), 1);
		assert_eq!(report.results[0].0, spec.nodes.servers[0].hostname);
		assert!(!mock
			.connected_nodes()
			.contains(&spec.nodes.agents[0].hostname));
	}

	#[tokio::test]
	async fn single_node_scope_checks_only_that_node() {
		let spec = spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let checker = HealthChecker::new(&spec, &mock, handler.as_ref());
		let report = checker
			.sweep(Some(&spec.nodes.agents[0].hostname))
			.await
			.unwrap();
		assert_eq!(report.results.len(), 1);
		assert_eq!(report.results[0].0, spec.nodes.agents[0].hostname);
	}

	#[tokio::test]
	async fn unknown_node_name_is_a_config_error() {
		let spec = spec();
		let handler = distro::handler_for(spec.deployment.distribution);
		let mock = MockConnector::new();
		let checker = HealthChecker::new(&spec, &mock, handler.as_ref());
		let err = checker.sweep(Some("no-such-node")).await.unwrap_err();
		assert!(matches!(err, DeployError::Config(_)));
	}
}
