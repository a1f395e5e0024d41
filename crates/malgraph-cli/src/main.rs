//! malgraph CLI - detects malicious npm packages from their behavior graphs

mod commands;
mod logging;
mod oracle;
mod output;
mod probe;
mod registry;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use commands::Commands;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "malgraph",
    author,
    version,
    about = "Behavior-graph detector for malicious npm packages",
    long_about = "malgraph stitches the graph exports of an npm package into a behavior graph,\n\
                  reduces it to sensitive API calls and matches it against known malicious\n\
                  behavior patterns.\n\n\
                  The exit code of `analyze` reflects the package status."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_enum, default_value = "warn", help = "Set the log level")]
    pub log_level: LogLevel,

    #[arg(long, global = true, help = "Write logs to the specified file")]
    pub log_file: Option<PathBuf>,

    #[arg(long, global = true, help = "Output logs in JSON format")]
    pub log_json: bool,

    #[arg(long, global = true, value_name = "FILE", help = "Use this malgraph.toml instead of discovering one")]
    pub config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = logging::init_logging(&cli);

    match &cli.command {
        Commands::Analyze(args) => args.run(cli.config.as_deref()),
        Commands::Patterns(args) => args.run(cli.config.as_deref()),
    }
}
