//! Human-readable output for analysis outcomes

use std::fmt::Write;

use colored::{ColoredString, Colorize};
use malgraph_core::{Outcome, Status};

pub struct PrettyFormatter;

impl PrettyFormatter {
    pub fn format(&self, outcomes: &[Outcome]) -> String {
        let mut out = String::new();
        for outcome in outcomes {
            let _ = write!(
                out,
                "{:<24} {}",
                outcome.package.bold(),
                status_label(outcome.status)
            );
            if outcome.findings > 0 {
                let _ = write!(out, " {}", format!("({} finding(s))", outcome.findings).dimmed());
            }
            let _ = writeln!(
                out,
                " {}",
                format!("{:.2}s", outcome.elapsed.as_secs_f64()).dimmed()
            );
        }

        let flagged = outcomes.iter().filter(|o| o.status.is_flagged()).count();
        if outcomes.len() > 1 {
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "Analyzed {} package(s), {} flagged",
                outcomes.len(),
                flagged
            );
        }
        out
    }
}

fn status_label(status: Status) -> ColoredString {
    match status {
        Status::Benign => status.as_str().green().bold(),
        Status::Malicious | Status::Obfuscated => status.as_str().red().bold(),
        Status::Timeout | Status::ExternalServiceError => status.as_str().yellow().bold(),
        _ => status.as_str().cyan().bold(),
    }
}
