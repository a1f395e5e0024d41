//! Per-package analysis report
//!
//! Findings are grouped by phase and general behavior. Each finding names the
//! specific pattern and the lines involved, per file.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::manifest::ScriptProfile;

pub const REPORT_FILE: &str = "report.json";

pub const INFORMATION_STEALING: &str = "Information Stealing";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Install,
    Import,
    Run,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Install, Phase::Import, Phase::Run];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Install => "INSTALL",
            Phase::Import => "IMPORT",
            Phase::Run => "RUN",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lines per file.
pub type Locality = BTreeMap<String, BTreeSet<usize>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(rename = "pattern desc")]
    pub description: String,
    pub file: Locality,
}

impl Finding {
    /// Same files, and every line of `self` already present in `other`.
    fn is_covered_by(&self, other: &Finding) -> bool {
        if self == other {
            return true;
        }
        self.file.len() == other.file.len()
            && self.file.iter().all(|(file, lines)| {
                other
                    .file
                    .get(file)
                    .is_some_and(|covering| lines.is_subset(covering))
            })
    }
}

type Behaviors = BTreeMap<String, Vec<Finding>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Report {
    #[serde(rename = "Malicious")]
    malicious: bool,
    #[serde(rename = "Obfuscation", skip_serializing_if = "Option::is_none")]
    obfuscation: Option<Vec<String>>,
    #[serde(rename = "INSTALL TIME SCRIPT", skip_serializing_if = "BTreeMap::is_empty")]
    install_scripts: BTreeMap<String, ScriptProfile>,
    #[serde(rename = "INSTALL", skip_serializing_if = "BTreeMap::is_empty")]
    install: Behaviors,
    #[serde(rename = "IMPORT", skip_serializing_if = "BTreeMap::is_empty")]
    import: Behaviors,
    #[serde(rename = "RUN", skip_serializing_if = "BTreeMap::is_empty")]
    run: Behaviors,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_malicious(&self) -> bool {
        self.malicious
    }

    pub fn set_malicious(&mut self, malicious: bool) {
        self.malicious = malicious;
    }

    /// Records a malicious install script under its lifecycle name.
    pub fn add_install_script(&mut self, phase: &str, profile: ScriptProfile) {
        self.install_scripts.insert(phase.to_string(), profile);
    }

    pub fn install_scripts(&self) -> &BTreeMap<String, ScriptProfile> {
        &self.install_scripts
    }

    pub fn set_obfuscation(&mut self, files: Vec<String>) {
        self.malicious = true;
        self.obfuscation = Some(files);
    }

    pub fn obfuscation(&self) -> Option<&[String]> {
        self.obfuscation.as_deref()
    }

    /// Adds a finding unless an existing one of the same behavior already
    /// covers it. Returns whether it was added.
    pub fn add_finding(
        &mut self,
        phase: Phase,
        behavior: &str,
        description: &str,
        locality: Locality,
    ) -> bool {
        let finding = Finding {
            description: description.to_string(),
            file: locality,
        };
        let findings = self.behaviors_mut(phase).entry(behavior.to_string()).or_default();
        if findings.iter().any(|existing| finding.is_covered_by(existing)) {
            return false;
        }
        findings.push(finding);
        true
    }

    pub fn findings(&self, phase: Phase) -> &BTreeMap<String, Vec<Finding>> {
        match phase {
            Phase::Install => &self.install,
            Phase::Import => &self.import,
            Phase::Run => &self.run,
        }
    }

    fn behaviors_mut(&mut self, phase: Phase) -> &mut Behaviors {
        match phase {
            Phase::Install => &mut self.install,
            Phase::Import => &mut self.import,
            Phase::Run => &mut self.run,
        }
    }

    pub fn finding_count(&self) -> usize {
        [&self.install, &self.import, &self.run]
            .iter()
            .flat_map(|b| b.values())
            .map(Vec::len)
            .sum()
    }

    pub fn contains_information_stealing(&self) -> bool {
        [&self.install, &self.import, &self.run]
            .iter()
            .any(|b| b.contains_key(INFORMATION_STEALING))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes `report.json` into `dir`, creating it when needed.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| AnalysisError::io(dir, e))?;
        let path = dir.join(REPORT_FILE);
        std::fs::write(&path, self.to_json()?).map_err(|e| AnalysisError::io(&path, e))
    }
}
