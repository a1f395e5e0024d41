//! JSON output formatter for analysis outcomes

use std::collections::BTreeMap;
use std::path::Path;

use malgraph_core::Outcome;
use serde::Serialize;

#[derive(Serialize)]
pub struct JsonOutput<'a> {
    pub version: &'static str,
    pub metadata: JsonMetadata,
    pub summary: JsonSummary,
    pub packages: &'a [Outcome],
}

#[derive(Serialize)]
pub struct JsonMetadata {
    pub malgraph_version: &'static str,
    pub report_dir: String,
}

#[derive(Serialize)]
pub struct JsonSummary {
    pub total_packages: usize,
    pub flagged: usize,
    pub by_status: BTreeMap<&'static str, usize>,
}

pub struct JsonFormatter<'a> {
    report_dir: &'a Path,
}

impl<'a> JsonFormatter<'a> {
    pub fn new(report_dir: &'a Path) -> Self {
        Self { report_dir }
    }

    pub fn format(&self, outcomes: &[Outcome]) -> String {
        let output = JsonOutput {
            version: "1.0",
            metadata: JsonMetadata {
                malgraph_version: env!("CARGO_PKG_VERSION"),
                report_dir: self.report_dir.to_string_lossy().to_string(),
            },
            summary: summarize(outcomes),
            packages: outcomes,
        };
        serde_json::to_string_pretty(&output).unwrap_or_else(|_| "{}".to_string())
    }
}

fn summarize(outcomes: &[Outcome]) -> JsonSummary {
    let mut by_status = BTreeMap::new();
    for outcome in outcomes {
        *by_status.entry(outcome.status.as_str()).or_insert(0) += 1;
    }
    JsonSummary {
        total_packages: outcomes.len(),
        flagged: outcomes.iter().filter(|o| o.status.is_flagged()).count(),
        by_status,
    }
}
