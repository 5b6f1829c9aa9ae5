use crate::error::DeployError;

/// The cluster join secret. Owned by the orchestrator, seeded from the
/// static config token when one is present, otherwise written exactly once
/// after the first server's service comes up. Reading before population is
/// a hard error, never a silent skip.
#[derive(Debug, Default)]
pub struct ClusterToken {
	value: Option<String>,
}

impl ClusterToken {
	pub fn new() -> Self {
		ClusterToken { value: None }
	}

	pub fn seeded(value: Option<&str>) -> Self {
		ClusterToken {
			value: value.map(str::to_owned),
		}
	}

	pub fn is_set(&self) -> bool {
		self.value.is_some()
	}

	/// Write-once: a second populate call is a logic error upstream.
	pub fn populate(&mut self, value: String) -> Result<(), DeployError> {
		if self.value.is_some() {
			return Err(DeployError::Config(
				"cluster token was populated twice".to_owned(),
			));
		}
		if value.trim().is_empty() {
			return Err(DeployError::TokenUnavailable);
		}
		self.value = Some(value);
		Ok(())
	}

	pub fn get(&self) -> Result<&str, DeployError> {
		self.value.as_deref().ok_or(DeployError::TokenUnavailable)
	}
}
