use crate::bundle::BundleManifest;
use crate::config::{ClusterSpec, Distribution, NodeRole, NodeSpec, OsFamily};
use std::fmt::Write as _;

#[derive(Debug, Clone)]
pub struct PlanEntry {
	pub hostname: String,
	pub ip: String,
	pub role: NodeRole,
	pub os: OsFamily,
	pub gpu: bool,
}

/// The resolved deployment plan. Roles are tagged exactly once here, from
/// inventory order; nothing downstream infers "first server" from a list
/// position again.
#[derive(Debug)]
pub struct DeployPlan {
	pub distribution: Distribution,
	pub airgap: bool,
	pub entries: Vec<PlanEntry>,
	/// (artifact name, local path, exists locally)
	pub bundles: Vec<(String, String, bool)>,
}

impl DeployPlan {
	pub fn build(spec: &ClusterSpec) -> Self {
		let mut entries = Vec::new();
		for (index, node) in spec.nodes.servers.iter().enumerate() {
			let role = if index == 0 {
				NodeRole::FirstServer
			} else {
				NodeRole::JoiningServer
			};
			entries.push(entry_for(spec, node, role));
		}
		for node in &spec.nodes.agents {
			entries.push(entry_for(spec, node, NodeRole::Agent));
		}
		let manifest = BundleManifest::resolve(spec);
		let bundles = manifest
			.artifacts
			.iter()
			.map(|artifact| {
				(
					artifact.name.clone(),
					artifact.local.display().to_string(),
					artifact.local.is_file(),
				)
			})
			.collect();
		DeployPlan {
			distribution: spec.deployment.distribution,
			airgap: spec.deployment.airgap.enabled,
			entries,
			bundles,
		}
	}

	pub fn servers(&self) -> impl Iterator<Item = &PlanEntry> {
		self.entries.iter().filter(|entry| entry.role.is_server())
	}

	pub fn agents(&self) -> impl Iterator<Item = &PlanEntry> {
		self.entries
			.iter()
			.filter(|entry| entry.role == NodeRole::Agent)
	}

	pub fn render(&self) -> String {
		let mut out = String::new();
		let mode = if self.airgap { "airgapped" } else { "online" };
		let _ = writeln!(
			out,
			"Plan: {} ({mode}), {} server(s), {} agent(s)",
			self.distribution,
			self.servers().count(),
			self.agents().count()
		);
		for entry in &self.entries {
			let gpu = if entry.gpu { ", gpu" } else { "" };
			let _ = writeln!(
				out,
				"  {:<20} {:<16} {} [{}{gpu}]",
				entry.hostname, entry.ip, entry.role, entry.os
			);
		}
		if self.airgap {
			let _ = writeln!(out, "Bundles:");
			for (name, path, exists) in &self.bundles {
				let status = if *exists { "ok" } else { "MISSING" };
				let _ = writeln!(out, "  {name:<20} {path} [{status}]");
			}
		}
		out
	}
}

fn entry_for(spec: &ClusterSpec, node: &NodeSpec, role: NodeRole) -> PlanEntry {
	PlanEntry {
		hostname: node.hostname.clone(),
		ip: node.ip.clone(),
		role,
		os: node.os_family(spec),
		gpu: node.gpu,
	}
}
