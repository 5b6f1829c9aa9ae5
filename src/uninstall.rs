use crate::config::{ClusterSpec, NodeRole, NodeSpec};
use crate::distro::{self, DistributionHandler};
use crate::error::DeployError;
use crate::executor::{run_all_tolerant, Connector, RemoteExecutor};
use crate::os;
use crate::plan::DeployPlan;
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct UninstallReport {
	pub cleaned: Vec<String>,
	pub unreachable: Vec<String>,
}

/// Tears the cluster down: agents first so they drain off the control
/// plane, then servers in reverse inventory order so the first server goes
/// last. Every step is best-effort; an unreachable node is recorded and
/// skipped, never a reason to stop.
pub struct UninstallOrchestrator<'a> {
	spec: &'a ClusterSpec,
	connector: &'a dyn Connector,
	distro: Box<dyn DistributionHandler>,
}

impl<'a> UninstallOrchestrator<'a> {
	pub fn new(spec: &'a ClusterSpec, connector: &'a dyn Connector) -> Self {
		UninstallOrchestrator {
			spec,
			connector,
			distro: distro::handler_for(spec.deployment.distribution),
		}
	}

	pub async fn uninstall(&self) -> UninstallReport {
		let plan = DeployPlan::build(self.spec);
		let mut report = UninstallReport::default();
		let agents: Vec<_> = plan.agents().collect();
		let mut servers: Vec<_> = plan.servers().collect();
		servers.reverse();
		for entry in agents.into_iter().chain(servers) {
			let Some(node) = self
				.spec
				.all_nodes()
				.find(|node| node.hostname == entry.hostname)
			else {
				continue;
			};
			info!("[{}] Uninstalling ({}).", node.hostname, entry.role);
			match self.connector.connect(node).await {
				Ok(mut exec) => {
					self.clean_node(exec.as_mut(), node, entry.role).await;
					if let Err(err) = exec.close().await {
						warn!("[{}] Error closing session: {err}", node.hostname);
					}
					report.cleaned.push(node.hostname.clone());
				}
				Err(err) => {
					warn!("[{}] Unreachable, skipping: {err}", node.hostname);
					report.unreachable.push(node.hostname.clone());
				}
			}
		}
		report
	}

	async fn clean_node(&self, exec: &mut dyn RemoteExecutor, node: &NodeSpec, role: NodeRole) {
		if let Some(unit) = self.distro.service_unit(role) {
			run_all_tolerant(
				exec,
				node,
				&[
					format!("systemctl stop {unit}"),
					format!("systemctl disable {unit}"),
				],
			)
			.await;
		}
		self.run_uninstall_script(exec, node).await;
		// The script may not exist or may have failed half-way; sweep the
		// known paths regardless.
		let mut commands: Vec<String> = self
			.distro
			.cleanup_paths()
			.iter()
			.map(|path| format!("rm -rf {path}"))
			.collect();
		commands.extend(self.distro.extra_cleanup_commands());
		for interface in self.distro.network_interfaces() {
			commands.push(format!("ip link delete {interface} 2>/dev/null || true"));
		}
		commands.push("systemctl daemon-reload".to_owned());
		run_all_tolerant(exec, node, &commands).await;
		let os_handler = os::handler_for(node.os_family(self.spec));
		os_handler.remove_firewall_rules(exec, node, role).await;
		info!("[{}] Cleanup finished.", node.hostname);
	}

	/// Try the distribution's own uninstall scripts, first hit wins.
	async fn run_uninstall_script(&self, exec: &mut dyn RemoteExecutor, node: &NodeSpec) {
		for candidate in self.distro.uninstall_script_candidates() {
			let probe = exec.exec(&format!("test -f {candidate}"), true).await;
			match probe {
				Ok(output) if output.success() => {
					info!("[{}] Running {candidate}.", node.hostname);
					run_all_tolerant(exec, node, &[format!("sh {candidate}")]).await;
					return;
				}
				Ok(_) => {}
				Err(err) => {
					warn!("[{}] Probe for {candidate} failed: {err}", node.hostname);
					return;
				}
			}
		}
		info!("[{}] No uninstall script found; relying on path cleanup.", node.hostname);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Distribution, NodeSpec, OsFamily};
	use crate::executor::mock::MockConnector;

	fn three_node_spec() -> ClusterSpec {
		let mut spec = ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, false);
		let second = NodeSpec {
			hostname: "rke2-server-2".to_owned(),
			ip: "10.0.4.11".to_owned(),
			..spec.nodes.servers[0].clone()
		};
		spec.nodes.servers.push(second);
		spec
	}

	#[tokio::test]
	async fn agents_are_cleaned_before_servers_and_first_server_goes_last() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		let orchestrator = UninstallOrchestrator::new(&spec, &mock);
		let report = orchestrator.uninstall().await;
		assert_eq!(
			report.cleaned,
			vec!["rke2-agent-1", "rke2-server-2", "rke2-server-1"]
		);
	}

	#[tokio::test]
	async fn unreachable_node_is_skipped_not_fatal() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		mock.refuse_connect("rke2-agent-1");
		let orchestrator = UninstallOrchestrator::new(&spec, &mock);
		let report = orchestrator.uninstall().await;
		assert_eq!(report.unreachable, vec!["rke2-agent-1"]);
		assert_eq!(report.cleaned, vec!["rke2-server-2", "rke2-server-1"]);
	}

	#[tokio::test]
	async fn cleanup_runs_even_when_the_uninstall_script_is_absent() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		// No script at either candidate path.
		mock.fail_command("rke2-server-1", "test -f /usr/local/bin/rke2-uninstall.sh");
		mock.fail_command("rke2-server-1", "test -f /usr/bin/rke2-uninstall.sh");
		let orchestrator = UninstallOrchestrator::new(&spec, &mock);
		orchestrator.uninstall().await;
		let commands = mock.commands_on("rke2-server-1");
		assert!(!commands.iter().any(|c| c.starts_with("sh /usr")));
		assert!(commands.iter().any(|c| c.contains("rm -rf /var/lib/rancher/rke2")));
		assert!(commands.iter().any(|c| c.contains("ip link delete flannel.1")));
	}

	#[tokio::test]
	async fn failed_service_stop_does_not_block_path_cleanup() {
		let spec = three_node_spec();
		let mock = MockConnector::new();
		mock.fail_command("rke2-agent-1", "systemctl stop");
		let orchestrator = UninstallOrchestrator::new(&spec, &mock);
		let report = orchestrator.uninstall().await;
		assert!(report.cleaned.contains(&"rke2-agent-1".to_owned()));
		assert!(mock
			.commands_on("rke2-agent-1")
			.iter()
			.any(|c| c.contains("rm -rf /etc/rancher/rke2")));
	}
}
