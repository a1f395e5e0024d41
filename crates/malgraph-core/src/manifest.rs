//! `package.json` ingestion and install-time script profiles

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AnalysisError, Result};
use crate::sources::normalize_path;

pub const PROFILE_FILE: &str = "package_json_profile.json";

/// Lifecycle scripts run by `npm install`, in execution order.
pub const INSTALL_SCRIPTS: [&str; 3] = ["preinstall", "install", "postinstall"];

static NODE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"node\s+([^\s]+\.js\b)").expect("Invalid regex pattern"));

static RUN_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([^\s'"&|;]+\.(?:sh|exe|md|bat|cmd))\b"#).expect("Invalid regex pattern")
});

const SENSITIVE_EXTENSIONS: [&str; 3] = ["md", "sh", "exe"];

#[derive(Debug, Deserialize)]
struct RawManifest {
    main: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    path: PathBuf,
    main: String,
    scripts: Vec<(String, String)>,
    dependencies: Vec<String>,
}

impl Manifest {
    /// Reads `<package_root>/package/package.json`.
    pub fn load(package_root: &Path) -> Result<Self> {
        let path = package_root.join("package").join("package.json");
        if !path.is_file() {
            return Err(AnalysisError::ManifestMissing {
                path: package_root.join("package"),
            });
        }
        let text = std::fs::read_to_string(&path).map_err(|e| AnalysisError::io(&path, e))?;
        Self::parse(&path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let raw: RawManifest =
            serde_json::from_str(text).map_err(|e| AnalysisError::InvalidManifest {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let scripts = INSTALL_SCRIPTS
            .iter()
            .filter_map(|phase| {
                let command = raw.scripts.get(*phase)?.as_str()?;
                Some((phase.to_string(), command.to_string()))
            })
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            main: raw.main.unwrap_or_else(|| "index.js".to_string()),
            scripts,
            dependencies: raw.dependencies.into_keys().collect(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn main(&self) -> &str {
        &self.main
    }

    /// The main entry as a package-relative source path, e.g. `package/index.js`.
    pub fn main_file(&self) -> String {
        let mut file = normalize_path(&format!("package/{}", self.main));
        let name = file.rsplit('/').next().unwrap_or_default();
        if !name.contains('.') {
            file.push_str(".js");
        }
        file
    }

    /// Install-time scripts present in the manifest, in lifecycle order.
    pub fn install_scripts(&self) -> &[(String, String)] {
        &self.scripts
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptKind {
    /// Runs one or more package `.js` files through node.
    Node,
    ShellCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptProfile {
    pub phase: String,
    pub command: String,
    #[serde(rename = "type")]
    pub kind: ScriptKind,
    /// Files the script runs.
    pub run: Vec<String>,
    pub malicious: bool,
}

impl ScriptProfile {
    /// Classifies a lifecycle script without consulting any service.
    pub fn classify(phase: &str, command: &str) -> Self {
        let node_files: Vec<String> = NODE_RUN
            .captures_iter(command)
            .map(|caps| caps[1].to_string())
            .collect();

        let (kind, run) = if node_files.is_empty() {
            let files = RUN_FILE
                .captures_iter(command)
                .map(|caps| caps[1].to_string())
                .collect();
            (ScriptKind::ShellCommand, files)
        } else {
            (ScriptKind::Node, node_files)
        };

        Self {
            phase: phase.to_string(),
            command: command.to_string(),
            kind,
            run,
            malicious: false,
        }
    }

    pub fn needs_static_analysis(&self) -> bool {
        self.kind == ScriptKind::Node
    }

    /// Package source paths of the `.js` files the script runs.
    pub fn js_files(&self) -> Vec<String> {
        self.run
            .iter()
            .filter(|file| file.ends_with(".js"))
            .map(|file| normalize_path(&format!("package/{file}")))
            .collect()
    }

    /// Whether the script runs a file no static analysis can see into.
    pub fn runs_sensitive_file(&self) -> bool {
        self.run
            .iter()
            .any(|file| SENSITIVE_EXTENSIONS.iter().any(|ext| file.ends_with(ext)))
    }
}

pub type ScriptProfiles = BTreeMap<String, ScriptProfile>;

/// Loads the cached profiles from `report_dir`, if any.
pub fn load_profiles(report_dir: &Path) -> Option<ScriptProfiles> {
    let path = report_dir.join(PROFILE_FILE);
    let text = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&text) {
        Ok(profiles) => {
            debug!(path = %path.display(), "reusing cached script profiles");
            Some(profiles)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable script profile cache");
            None
        }
    }
}

pub fn save_profiles(report_dir: &Path, profiles: &ScriptProfiles) -> Result<()> {
    std::fs::create_dir_all(report_dir).map_err(|e| AnalysisError::io(report_dir, e))?;
    let path = report_dir.join(PROFILE_FILE);
    let json = serde_json::to_string_pretty(profiles)?;
    std::fs::write(&path, json).map_err(|e| AnalysisError::io(&path, e))
}
