//! Run-time resolution of dynamically computed call arguments

use std::collections::HashMap;
use std::path::Path;

use crate::error::ServiceError;

/// One expression to evaluate, logged under `placeholder` (`#1`, `#2`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub placeholder: String,
    pub expression: String,
}

/// Where the instrumentation goes: a file of the package and the statement
/// before which the logging lines are inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSite<'a> {
    pub package_dir: &'a Path,
    /// Path relative to the package directory, e.g. `package/index.js`.
    pub file: &'a str,
    pub line: usize,
    pub column: usize,
}

pub trait ArgumentProbe: Send + Sync {
    /// `false` for probes that never run anything. Matches are then kept
    /// without their dynamic arguments.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Values observed for each placeholder, or `None` when the instrumented
    /// program never reached the site.
    fn evaluate(
        &self,
        site: &ProbeSite<'_>,
        requests: &[ProbeRequest],
    ) -> Result<Option<HashMap<String, String>>, ServiceError>;
}

/// Probe that never resolves anything.
#[derive(Debug, Default)]
pub struct NoProbe;

impl ArgumentProbe for NoProbe {
    fn is_enabled(&self) -> bool {
        false
    }

    fn evaluate(
        &self,
        _site: &ProbeSite<'_>,
        _requests: &[ProbeRequest],
    ) -> Result<Option<HashMap<String, String>>, ServiceError> {
        Ok(None)
    }
}

/// Instrumentation line appending the value of `request` to `log.log`.
pub fn logging_statement(request: &ProbeRequest, indent: usize) -> String {
    format!(
        "{}require('fs').appendFileSync(\"log.log\", \"{}:\" + ({}) + \"\\n\");",
        " ".repeat(indent),
        request.placeholder,
        request.expression
    )
}

/// Lines spliced before the probed statement: one logging line per request,
/// then an exit so the sensitive call itself never runs.
pub fn instrumentation(requests: &[ProbeRequest], indent: usize) -> Vec<String> {
    let mut lines: Vec<String> = requests
        .iter()
        .map(|r| logging_statement(r, indent))
        .collect();
    lines.push(format!("{}process.exit(1);", " ".repeat(indent)));
    lines
}

/// Parses `#n:value` lines written by [`logging_statement`]. The first value
/// logged for a placeholder wins.
pub fn parse_probe_log(log: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in log.lines() {
        let Some((placeholder, value)) = line.split_once(':') else {
            continue;
        };
        if placeholder.starts_with('#') {
            values
                .entry(placeholder.to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_statement_wraps_expression() {
        let request = ProbeRequest {
            placeholder: "#1".into(),
            expression: "a + b".into(),
        };

        assert_eq!(
            logging_statement(&request, 2),
            r##"  require('fs').appendFileSync("log.log", "#1:" + (a + b) + "\n");"##
        );
    }

    #[test]
    fn instrumentation_exits_before_the_call() {
        let requests = [
            ProbeRequest {
                placeholder: "#1".into(),
                expression: "cmd".into(),
            },
            ProbeRequest {
                placeholder: "#2".into(),
                expression: "opts".into(),
            },
        ];

        let lines = instrumentation(&requests, 4);

        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"#1:\" + (cmd)"));
        assert!(lines[1].contains("\"#2:\" + (opts)"));
        assert_eq!(lines[2], "    process.exit(1);");
    }

    #[test]
    fn default_runner_is_disabled() {
        assert!(!NoProbe.is_enabled());
    }

    #[test]
    fn probe_log_keeps_first_value() {
        let values = parse_probe_log("#1:rm -rf /\n#2:http://x:80\n#1:later\nnoise\n");

        assert_eq!(values["#1"], "rm -rf /");
        assert_eq!(values["#2"], "http://x:80");
        assert_eq!(values.len(), 2);
    }
}
