//! CLI command implementations

pub mod analyze;
pub mod patterns;

pub use analyze::AnalyzeArgs;
pub use patterns::PatternsArgs;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use malgraph_core::config::{
    Config, load_config_or_default_with_warnings, load_config_with_warnings,
};
use malgraph_core::pattern::PatternLibrary;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze packages and write a report per package
    Analyze(AnalyzeArgs),

    /// List the pattern library and category taxonomy
    Patterns(PatternsArgs),
}

/// The explicit config file, or the nearest `malgraph.toml` above the
/// working directory.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let result = match explicit {
        Some(path) => load_config_with_warnings(path)?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            load_config_or_default_with_warnings(&cwd)
        }
    };
    for warning in &result.warnings {
        eprintln!("{} {}", "warning:".yellow().bold(), warning);
    }
    Ok(result.config)
}

/// Built-in patterns followed by those of the configured pattern file.
pub fn load_patterns(config: &Config) -> Result<PatternLibrary> {
    let mut library = PatternLibrary::with_defaults();
    if let Some(path) = &config.patterns.path {
        let extra = PatternLibrary::load(path)
            .with_context(|| format!("Failed to load patterns from {}", path.display()))?;
        library.extend(extra);
    }
    Ok(library)
}
