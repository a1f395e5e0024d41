//! Analyze command - runs the detector over packages and writes their reports

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use malgraph_core::config::Config;
use malgraph_core::knowledge::{KnowledgeStore, StaticKnowledgeStore};
use malgraph_core::oracle::Oracle;
use malgraph_core::probe::{ArgumentProbe, NoProbe};
use malgraph_core::{AnalysisOptions, Outcome, PackageAnalyzer, Status, Workspace};
use rayon::prelude::*;
use tracing::info;

use super::{load_config, load_patterns};
use crate::oracle::LlmOracle;
use crate::output::json::JsonFormatter;
use crate::output::pretty::PrettyFormatter;
use crate::probe::DockerProbe;
use crate::registry::RegistryKnowledgeStore;

#[derive(Args, Debug)]
pub struct AnalyzeArgs {
    /// Package identifiers: directory names under the code and graph directories
    #[arg(value_name = "PACKAGE", required = true)]
    pub packages: Vec<String>,

    /// Directory holding `<package>/package/...` sources
    #[arg(long, value_name = "DIR")]
    pub code_dir: PathBuf,

    /// Directory holding `<package>/cpg` and `<package>/pdg` graph exports
    #[arg(long, value_name = "DIR")]
    pub graph_dir: PathBuf,

    /// Directory receiving `<package>/report.json`
    #[arg(long, value_name = "DIR")]
    pub report_dir: PathBuf,

    /// Per-package timeout in seconds, 0 disables it (overrides the config)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Number of packages analyzed in parallel
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Keep every match without asking the oracle
    #[arg(long)]
    pub no_oracle: bool,

    /// Output format (pretty, json)
    #[arg(short, long, default_value = "pretty")]
    pub format: String,
}

impl AnalyzeArgs {
    pub fn run(&self, config_path: Option<&std::path::Path>) -> Result<()> {
        self.validate()?;
        let config = load_config(config_path)?;
        let patterns = load_patterns(&config)?;
        let knowledge = build_knowledge(&config)?;
        let oracle = self.build_oracle(&config)?;
        let probe = build_probe(&config);
        let options = self.options(&config);

        let workspace = Workspace {
            code_dir: self.code_dir.clone(),
            graph_dir: self.graph_dir.clone(),
            report_dir: self.report_dir.clone(),
        };
        let analyzer = PackageAnalyzer::new(
            knowledge.as_ref(),
            &patterns,
            oracle.as_deref(),
            probe.as_ref(),
            options,
        );

        info!(packages = self.packages.len(), "starting analysis");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.jobs.unwrap_or(0))
            .build()
            .context("Failed to create worker pool")?;
        let outcomes: Vec<Outcome> = pool.install(|| {
            self.packages
                .par_iter()
                .map(|package| analyzer.analyze(package, &workspace))
                .collect()
        });

        match self.format.as_str() {
            "json" => println!("{}", JsonFormatter::new(&self.report_dir).format(&outcomes)),
            _ => print!("{}", PrettyFormatter.format(&outcomes)),
        }

        let code = exit_code(&outcomes);
        if code != 0 {
            process::exit(code);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.format.as_str(), "pretty" | "json") {
            anyhow::bail!(
                "Invalid format '{}'. Valid values: pretty, json",
                self.format
            );
        }
        if self.jobs == Some(0) {
            anyhow::bail!("--jobs must be at least 1");
        }
        if !self.code_dir.is_dir() {
            anyhow::bail!("Code directory does not exist: {}", self.code_dir.display());
        }
        Ok(())
    }

    fn options(&self, config: &Config) -> AnalysisOptions {
        let timeout = match self.timeout {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => config.analysis.timeout(),
        };
        let obfuscation_limit = config
            .obfuscation
            .enabled
            .then_some(config.obfuscation.max_source_bytes);
        AnalysisOptions {
            timeout,
            phases: config.analysis.phases.clone(),
            obfuscation_limit,
        }
    }

    fn build_oracle(&self, config: &Config) -> Result<Option<Box<dyn Oracle>>> {
        if self.no_oracle || !config.oracle.enabled {
            return Ok(None);
        }
        let oracle = LlmOracle::from_config(&config.oracle)?;
        Ok(Some(Box::new(oracle)))
    }
}

fn build_knowledge(config: &Config) -> Result<Box<dyn KnowledgeStore>> {
    let store = StaticKnowledgeStore::with_defaults();
    if let Some(path) = &config.knowledge.path {
        store.load_overlay(path)?;
    }
    if !config.knowledge.register_unknown {
        return Ok(Box::new(store));
    }
    let registry =
        RegistryKnowledgeStore::new(store, &config.knowledge.registry, config.oracle.retry_policy())?;
    Ok(Box::new(registry))
}

fn build_probe(config: &Config) -> Box<dyn ArgumentProbe> {
    if !config.probe.enabled {
        return Box::new(NoProbe);
    }
    Box::new(DockerProbe::new(
        &config.probe.image,
        Duration::from_secs(config.probe.timeout_secs),
        config.probe.sandbox_dir.clone(),
    ))
}

/// A single package exits with its own status code. Several packages exit
/// with `1` when any is flagged, else with the first non-zero code.
fn exit_code(outcomes: &[Outcome]) -> i32 {
    if let [single] = outcomes {
        return single.status.exit_code();
    }
    if outcomes.iter().any(|o| o.status.is_flagged()) {
        return Status::Malicious.exit_code();
    }
    outcomes
        .iter()
        .map(|o| o.status.exit_code())
        .find(|code| *code != 0)
        .unwrap_or(0)
}
