use crate::bundle::BundleManifest;
use crate::config::{ClusterSpec, Distribution};
use tracing::{error, info, warn};

/// Pre-flight checks. Every check runs and reports, so an operator sees
/// the complete list of problems in a single pass instead of fixing them
/// one failure at a time.
pub struct Validator<'a> {
	spec: &'a ClusterSpec,
}

impl<'a> Validator<'a> {
	pub fn new(spec: &'a ClusterSpec) -> Self {
		Validator { spec }
	}

	pub fn run_full_validation(&self) -> bool {
		let problems = self.collect_problems();
		for problem in &problems {
			error!("Validation: {problem}");
		}
		if problems.is_empty() {
			info!("All pre-flight checks passed.");
			true
		} else {
			error!("{} pre-flight check(s) failed.", problems.len());
			false
		}
	}

	pub fn collect_problems(&self) -> Vec<String> {
		let mut problems = Vec::new();
		self.check_bundles(&mut problems);
		self.check_airgap(&mut problems);
		self.check_nodes(&mut problems);
		problems
	}

	fn check_bundles(&self, problems: &mut Vec<String>) {
		if !self.spec.deployment.airgap.enabled {
			return;
		}
		let settings = &self.spec.deployment.settings;
		// Required bundle keys per distribution.
		let required: &[(&str, bool)] = match self.spec.deployment.distribution {
			Distribution::Rke2 => &[
				("airgap_bundle_path", settings.airgap_bundle_path.is_some()),
				("images_bundle_path", settings.images_bundle_path.is_some()),
			],
			Distribution::K3s => &[
				("binary_path", settings.binary_path.is_some()),
				("images_bundle_path", settings.images_bundle_path.is_some()),
			],
			Distribution::EksAnywhere => {
				&[("airgap_bundle_path", settings.airgap_bundle_path.is_some())]
			}
			Distribution::Kubeadm => &[],
		};
		for (key, present) in required {
			if !present {
				problems.push(format!(
					"airgap mode requires deployment.settings.{key} for {}",
					self.spec.deployment.distribution
				));
			}
		}
		let manifest = BundleManifest::resolve(self.spec);
		for artifact in manifest.missing() {
			problems.push(format!(
				"bundle artifact '{}' not found at {}",
				artifact.name,
				artifact.local.display()
			));
		}
	}

	fn check_airgap(&self, problems: &mut Vec<String>) {
		let airgap = &self.spec.deployment.airgap;
		if !airgap.enabled {
			return;
		}
		if airgap.bundle_staging_path.trim().is_empty() {
			problems.push("airgap.bundle_staging_path must not be empty".to_owned());
		}
		if airgap
			.local_registry
			.as_deref()
			.map(str::trim)
			.unwrap_or("")
			.is_empty()
		{
			problems.push("airgap mode requires deployment.airgap.local_registry".to_owned());
		}
	}

	fn check_nodes(&self, problems: &mut Vec<String>) {
		for node in self.spec.all_nodes() {
			for (field, value) in [
				("hostname", node.hostname.as_str()),
				("ip", node.ip.as_str()),
				("user", node.user.as_str()),
			] {
				if value.trim().is_empty() {
					problems.push(format!(
						"node '{}': required field '{field}' is empty",
						node.hostname
					));
				}
			}
			if !node.ssh_key.is_file() {
				problems.push(format!(
					"node '{}': SSH key not found: {}",
					node.hostname,
					node.ssh_key.display()
				));
			}
			// Non-fatal: the design assumes non-root + sudo.
			if node.user == "root" {
				warn!(
					"[{}] SSH user is root; consider a non-root user with sudo.",
					node.hostname
				);
			}
		}
	}
}
