use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    prelude::*,
};

use crate::Cli;

/// Installs the global subscriber. Logs go to stderr unless `--log-file` is
/// given; the returned guard flushes that file on drop.
pub fn init_logging(cli: &Cli) -> Option<WorkerGuard> {
    let level = cli.log_level.as_tracing_level();
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let (layer, guard) = match cli.log_file {
        Some(ref path) => {
            let (writer, guard) = file_writer(path);
            (output_layer(writer, cli.log_json, false), Some(guard))
        }
        None => (output_layer(std::io::stderr, cli.log_json, true), None),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
    guard
}

fn output_layer<W>(writer: W, json: bool, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi && !json)
        .with_target(false);
    if json {
        layer.json().with_span_events(FmtSpan::CLOSE).boxed()
    } else {
        layer.boxed()
    }
}

fn file_writer(path: &Path) -> (tracing_appender::non_blocking::NonBlocking, WorkerGuard) {
    let parent = path.parent().unwrap_or(Path::new("."));
    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("malgraph.log");
    tracing_appender::non_blocking(tracing_appender::rolling::never(parent, filename))
}

#[cfg(test)]
mod tests {
    use crate::LogLevel;
    use tracing::Level;

    #[test]
    fn log_levels_map_to_tracing_levels() {
        assert_eq!(LogLevel::Trace.as_tracing_level(), Level::TRACE);
        assert_eq!(LogLevel::Debug.as_tracing_level(), Level::DEBUG);
        assert_eq!(LogLevel::Info.as_tracing_level(), Level::INFO);
        assert_eq!(LogLevel::Warn.as_tracing_level(), Level::WARN);
        assert_eq!(LogLevel::Error.as_tracing_level(), Level::ERROR);
    }

    #[test]
    fn warn_filters_info_messages() {
        let warn = LogLevel::Warn.as_tracing_level();
        let info = LogLevel::Info.as_tracing_level();
        assert!(warn < info);
    }
}
