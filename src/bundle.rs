use crate::config::{ClusterSpec, Distribution, NodeSpec};
use crate::error::DeployError;
use crate::executor::{run, RemoteExecutor};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct BundleArtifact {
	pub name: String,
	pub local: PathBuf,
	pub remote_name: String,
	pub executable: bool,
}

impl BundleArtifact {
	fn new(name: &str, local: &Path, remote_name: &str, executable: bool) -> Self {
		BundleArtifact {
			name: name.to_owned(),
			local: local.to_path_buf(),
			remote_name: remote_name.to_owned(),
			executable,
		}
	}
}

/// Every offline artifact the selected distribution + OS combination needs,
/// resolved from the spec. Empty outside airgap mode.
#[derive(Debug, Default)]
pub struct BundleManifest {
	pub artifacts: Vec<BundleArtifact>,
}

impl BundleManifest {
	pub fn resolve(spec: &ClusterSpec) -> Self {
		if !spec.deployment.airgap.enabled {
			return BundleManifest::default();
		}
		let settings = &spec.deployment.settings;
		let mut artifacts = Vec::new();
		match spec.deployment.distribution {
			Distribution::Rke2 => {
				if let Some(path) = &settings.airgap_bundle_path {
					artifacts.push(BundleArtifact::new(
						"airgap-bundle",
						path,
						"rke2-airgap-bundle.tar.gz",
						false,
					));
				}
				if let Some(path) = &settings.images_bundle_path {
					artifacts.push(BundleArtifact::new(
						"images-bundle",
						path,
						"rke2-images.linux-amd64.tar.zst",
						false,
					));
				}
				if let Some(path) = &settings.rpm_bundle_path {
					artifacts.push(BundleArtifact::new(
						"rpm-bundle",
						path,
						"rke2-rpms.tar.gz",
						false,
					));
				}
				if let Some(path) = &settings.install_script_path {
					artifacts.push(BundleArtifact::new("install-script", path, "install.sh", true));
				}
			}
			Distribution::K3s => {
				if let Some(path) = &settings.binary_path {
					artifacts.push(BundleArtifact::new("k3s-binary", path, "k3s", true));
				}
				if let Some(path) = &settings.images_bundle_path {
					artifacts.push(BundleArtifact::new(
						"images-bundle",
						path,
						"k3s-airgap-images.tar.gz",
						false,
					));
				}
				if let Some(path) = &settings.install_script_path {
					artifacts.push(BundleArtifact::new("install-script", path, "install.sh", true));
				}
			}
			Distribution::EksAnywhere => {
				if let Some(path) = &settings.airgap_bundle_path {
					artifacts.push(BundleArtifact::new(
						"eks-anywhere-bundle",
						path,
						"eks-anywhere-bundle.tar.gz",
						false,
					));
				}
			}
			Distribution::Kubeadm => {
				if let Some(path) = &settings.images_bundle_path {
					artifacts.push(BundleArtifact::new(
						"images-bundle",
						path,
						"kubeadm-images.tar.gz",
						false,
					));
				}
			}
		}
		for (os_name, package) in &spec.packages {
			artifacts.push(BundleArtifact::new(
				&format!("{os_name}-packages"),
				&package.bundle_path,
				&format!("{os_name}-packages.tar.gz"),
				false,
			));
		}
		for tool in &spec.extra_tools {
			if let Some(path) = &tool.bundle_path {
				artifacts.push(BundleArtifact::new(&tool.name, path, &tool.name, true));
			}
		}
		BundleManifest { artifacts }
	}

	/// Artifacts whose local source file does not exist.
	pub fn missing(&self) -> Vec<&BundleArtifact> {
		self.artifacts
			.iter()
			.filter(|artifact| !artifact.local.is_file())
			.collect()
	}

	pub fn find(&self, name: &str) -> Option<&BundleArtifact> {
		self.artifacts.iter().find(|artifact| artifact.name == name)
	}
}

/// Stages the manifest onto one node's staging path. Uploads are skipped
/// when the remote copy already matches the local digest, so re-staging a
/// half-provisioned cluster is cheap.
pub struct BundleStager<'a> {
	spec: &'a ClusterSpec,
	manifest: &'a BundleManifest,
}

impl<'a> BundleStager<'a> {
	pub fn new(spec: &'a ClusterSpec, manifest: &'a BundleManifest) -> Self {
		BundleStager { spec, manifest }
	}

	pub async fn stage(
		&self,
		exec: &mut dyn RemoteExecutor,
		node: &NodeSpec,
	) -> Result<(), DeployError> {
		if self.manifest.artifacts.is_empty() {
			return Ok(());
		}
		let bundles = node.bundle_staging_path(self.spec);
		let images = node.image_staging_path(self.spec);
		// The SSH user is not root, so the staging dirs need an elevated
		// mkdir followed by a chown back to the user.
		run(
			exec,
			node,
			&format!(
				"mkdir -p {bundles} {images} && chown {user}:{user} {bundles} {images}",
				user = node.user
			),
		)
		.await?;
		for artifact in &self.manifest.artifacts {
			if !artifact.local.is_file() {
				return Err(DeployError::BundleMissing {
					name: artifact.name.clone(),
					path: artifact.local.clone(),
				});
			}
			let remote_path = format!("{bundles}/{}", artifact.remote_name);
			if self.remote_matches(exec, artifact, &remote_path).await? {
				info!(
					"[{}] {} already staged, skipping upload.",
					node.hostname, artifact.name
				);
				continue;
			}
			info!(
				"[{}] Uploading {} -> {remote_path}",
				node.hostname, artifact.name
			);
			exec.upload(&artifact.local, &remote_path).await?;
			if artifact.executable {
				run(exec, node, &format!("chmod +x {remote_path}")).await?;
			}
		}
		Ok(())
	}

	async fn remote_matches(
		&self,
		exec: &mut dyn RemoteExecutor,
		artifact: &BundleArtifact,
		remote_path: &str,
	) -> Result<bool, DeployError> {
		let output = exec
			.exec(&format!("sha256sum {remote_path} 2>/dev/null"), false)
			.await?;
		if !output.success() {
			return Ok(false);
		}
		let Some(remote_digest) = output.stdout.split_whitespace().next() else {
			return Ok(false);
		};
		Ok(remote_digest == local_digest(&artifact.local)?)
	}
}

fn local_digest(path: &Path) -> Result<String, DeployError> {
	let mut file = std::fs::File::open(path)?;
	let mut hasher = Sha256::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	let digest = hasher.finalize();
	Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::OsFamily;
	use std::io::Write;

	fn airgapped_spec() -> ClusterSpec {
		let mut spec = ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, true);
		spec.extra_tools.clear();
		spec.packages.clear();
		spec
	}

	#[test]
	fn online_mode_has_an_empty_manifest() {
		let spec = ClusterSpec::template(Distribution::Rke2, OsFamily::Rhel, false);
		assert!(BundleManifest::resolve(&spec).artifacts.is_empty());
	}

	#[test]
	fn rke2_manifest_lists_all_configured_bundles() {
		let manifest = BundleManifest::resolve(&airgapped_spec());
		let names: Vec<&str> = manifest.artifacts.iter().map(|a| a.name.as_str()).collect();
		assert_eq!(
			names,
			vec!["airgap-bundle", "images-bundle", "rpm-bundle", "install-script"]
		);
		assert!(manifest.find("install-script").unwrap().executable);
	}

	#[test]
	fn missing_reports_every_absent_file() {
		let manifest = BundleManifest::resolve(&airgapped_spec());
		// Template paths do not exist on the test machine.
		assert_eq!(manifest.missing().len(), manifest.artifacts.len());
	}

	#[test]
	fn local_digest_matches_known_sha256() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		file.write_all(b"abc").unwrap();
		assert_eq!(
			local_digest(file.path()).unwrap(),
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
		);
	}

	#[tokio::test]
	async fn restage_skips_upload_when_remote_digest_matches() {
		use crate::executor::mock::{Event, MockConnector};
		use crate::executor::Connector;

		let mut spec = airgapped_spec();
		let mut bundle_file = tempfile::NamedTempFile::new().unwrap();
		bundle_file.write_all(b"abc").unwrap();
		spec.deployment.settings.airgap_bundle_path = Some(bundle_file.path().to_path_buf());
		spec.deployment.settings.images_bundle_path = None;
		spec.deployment.settings.rpm_bundle_path = None;
		spec.deployment.settings.install_script_path = None;
		let manifest = BundleManifest::resolve(&spec);
		assert_eq!(manifest.artifacts.len(), 1);

		let mock = MockConnector::new();
		mock.respond(
			"sha256sum",
			"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad  staged",
		);
		let node = spec.nodes.servers[0].clone();
		let mut exec = mock.connect(&node).await.unwrap();
		let stager = BundleStager::new(&spec, &manifest);
		stager.stage(exec.as_mut(), &node).await.unwrap();
		assert!(!mock
			.events()
			.iter()
			.any(|event| matches!(event, Event::Upload { .. })));
	}
}
