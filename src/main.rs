mod bundle;
mod config;
mod distro;
mod error;
mod executor;
mod health;
mod orchestrate;
mod os;
mod plan;
mod provision;
mod ssh;
mod token;
mod uninstall;
mod validate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::{ClusterSpec, Distribution, OsFamily};
use orchestrate::{ClusterOrchestrator, DeployOptions};
use ssh::SshConnector;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "kubeforge", version, about = "Bootstrap Kubernetes clusters over SSH, online or airgapped")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Provision the cluster described by the config file.
	Deploy {
		#[arg(short, long, default_value = "cluster.yaml")]
		config: PathBuf,
		/// Print the resolved plan and exit without contacting any node.
		#[arg(long)]
		dry_run: bool,
		/// Skip pre-flight validation.
		#[arg(long)]
		skip_validation: bool,
		/// Stage airgap bundles on every node, then stop.
		#[arg(long)]
		stage_only: bool,
		/// Install only these extra tools (comma-separated names).
		#[arg(long, value_delimiter = ',')]
		tools: Option<Vec<String>>,
	},
	/// Tear the cluster down, agents first, best-effort.
	Uninstall {
		#[arg(short, long, default_value = "cluster.yaml")]
		config: PathBuf,
		/// Do not ask for confirmation.
		#[arg(long)]
		force: bool,
	},
	/// Run the pre-flight checks and report every problem.
	Validate {
		#[arg(short, long, default_value = "cluster.yaml")]
		config: PathBuf,
	},
	/// Stage airgap bundles on every node without installing anything.
	StageBundles {
		#[arg(short, long, default_value = "cluster.yaml")]
		config: PathBuf,
	},
	/// Probe node services and the cluster's own view of its members.
	HealthCheck {
		#[arg(short, long, default_value = "cluster.yaml")]
		config: PathBuf,
		/// Check a single node by hostname.
		#[arg(long)]
		node: Option<String>,
	},
	/// Print a starter spec for the given distribution and OS.
	GenerateConfig {
		#[arg(long, value_enum, default_value_t = Distribution::Rke2)]
		distribution: Distribution,
		#[arg(long, value_enum, default_value_t = OsFamily::Rhel)]
		os: OsFamily,
		#[arg(long)]
		airgapped: bool,
		/// Write the template here instead of stdout.
		#[arg(short, long)]
		output: Option<PathBuf>,
	},
	/// List the supported distributions and OS families.
	ListSupported,
}

#[tokio::main]
async fn main() -> ExitCode {
	fmt()
		.with_ansi(true)
		.with_env_filter(
			EnvFilter::try_from_env("KUBEFORGE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.with_target(false)
		.with_timer(fmt::time::SystemTime)
		.compact()
		.init();
	match run(Cli::parse()).await {
		Ok(code) => code,
		Err(err) => {
			error!("{err:#}");
			ExitCode::FAILURE
		}
	}
}

async fn run(cli: Cli) -> Result<ExitCode> {
	match cli.command {
		Command::Deploy {
			config,
			dry_run,
			skip_validation,
			stage_only,
			tools,
		} => {
			let mut spec = ClusterSpec::load(&config)?;
			if let Some(selected) = tools {
				spec.extra_tools.retain(|tool| selected.contains(&tool.name));
			}
			let connector = SshConnector::new(spec.ssh.clone());
			let orchestrator = ClusterOrchestrator::new(&spec, &connector);
			let report = orchestrator
				.deploy(DeployOptions {
					dry_run,
					skip_validation,
					stage_only,
				})
				.await?;
			for warning in &report.warnings {
				warn!("{warning}");
			}
			if report.success() {
				Ok(ExitCode::SUCCESS)
			} else {
				for (hostname, reason) in &report.agent_failures {
					error!("[{hostname}] {reason}");
				}
				Ok(ExitCode::FAILURE)
			}
		}
		Command::Uninstall { config, force } => {
			let spec = ClusterSpec::load(&config)?;
			if !force && !confirm_uninstall(&spec)? {
				info!("Uninstall cancelled.");
				return Ok(ExitCode::SUCCESS);
			}
			let connector = SshConnector::new(spec.ssh.clone());
			let orchestrator = uninstall::UninstallOrchestrator::new(&spec, &connector);
			let report = orchestrator.uninstall().await;
			info!(
				"Uninstall finished: {} node(s) cleaned, {} unreachable.",
				report.cleaned.len(),
				report.unreachable.len()
			);
			if report.unreachable.is_empty() {
				Ok(ExitCode::SUCCESS)
			} else {
				Ok(ExitCode::FAILURE)
			}
		}
		Command::Validate { config } => {
			let spec = ClusterSpec::load(&config)?;
			if validate::Validator::new(&spec).run_full_validation() {
				Ok(ExitCode::SUCCESS)
			} else {
				Ok(ExitCode::FAILURE)
			}
		}
		Command::StageBundles { config } => {
			let spec = ClusterSpec::load(&config)?;
			let manifest = bundle::BundleManifest::resolve(&spec);
			if manifest.artifacts.is_empty() {
				info!("Nothing to stage: airgap mode is disabled or no bundles are configured.");
				return Ok(ExitCode::SUCCESS);
			}
			if let Some(artifact) = manifest.missing().first() {
				error!(
					"Bundle artifact '{}' not found at {}.",
					artifact.name,
					artifact.local.display()
				);
				return Ok(ExitCode::FAILURE);
			}
			let connector = SshConnector::new(spec.ssh.clone());
			let orchestrator = ClusterOrchestrator::new(&spec, &connector);
			orchestrator.stage_all(&manifest).await?;
			info!("Bundles staged on all nodes.");
			Ok(ExitCode::SUCCESS)
		}
		Command::HealthCheck { config, node } => {
			let spec = ClusterSpec::load(&config)?;
			let connector = SshConnector::new(spec.ssh.clone());
			let handler = distro::handler_for(spec.deployment.distribution);
			let checker = health::HealthChecker::new(&spec, &connector, handler.as_ref());
			let report = checker.sweep(node.as_deref()).await?;
			for (hostname, status) in &report.results {
				info!("{hostname}: {status}");
			}
			if report.all_healthy() {
				Ok(ExitCode::SUCCESS)
			} else {
				Ok(ExitCode::FAILURE)
			}
		}
		Command::GenerateConfig {
			distribution,
			os,
			airgapped,
			output,
		} => {
			let template = ClusterSpec::template(distribution, os, airgapped);
			let rendered = serde_yaml::to_string(&template)?;
			match output {
				Some(path) => {
					std::fs::write(&path, rendered)?;
					info!("Template written to {}.", path.display());
				}
				None => print!("{rendered}"),
			}
			Ok(ExitCode::SUCCESS)
		}
		Command::ListSupported => {
			println!("distributions:");
			for distribution in Distribution::ALL {
				let note = match distribution {
					Distribution::Rke2 => "full support, online and airgapped",
					Distribution::K3s => "online and airgapped",
					Distribution::EksAnywhere => "partial: admin node bootstrap only",
					Distribution::Kubeadm => "partial: requires a static token",
				};
				println!("  {distribution:<14} {note}");
			}
			println!("os families:");
			for os in OsFamily::ALL {
				println!("  {os}");
			}
			Ok(ExitCode::SUCCESS)
		}
	}
}

fn confirm_uninstall(spec: &ClusterSpec) -> Result<bool> {
	print!(
		"This removes {} from {} node(s). Type 'yes' to continue: ",
		spec.deployment.distribution,
		spec.all_nodes().count()
	);
	std::io::stdout().flush()?;
	let mut answer = String::new();
	std::io::stdin().read_line(&mut answer)?;
	Ok(answer.trim().eq_ignore_ascii_case("yes"))
}
