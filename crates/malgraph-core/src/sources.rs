//! Files of an unpacked package
//!
//! Paths are keyed relative to the package root with `/` separators, so the
//! entry file of a typical tarball is `package/index.js`. The same keys are
//! used by the graph exports in `FILENAME` attributes.

use std::collections::BTreeSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Default)]
pub struct PackageSources {
    files: BTreeSet<String>,
    dependencies: Vec<String>,
}

impl PackageSources {
    pub fn new(files: impl IntoIterator<Item = String>, dependencies: Vec<String>) -> Self {
        Self {
            files: files.into_iter().collect(),
            dependencies,
        }
    }

    /// Lists every regular file below `root`, skipping `node_modules`.
    pub fn collect(root: &Path, dependencies: Vec<String>) -> Result<Self> {
        let mut files = BTreeSet::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.file_name() != "node_modules");
        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                AnalysisError::io(path, e.into())
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key);
        }
        Ok(Self {
            files,
            dependencies,
        })
    }

    pub fn contains(&self, file: &str) -> bool {
        self.files.contains(file)
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn js_files(&self) -> impl Iterator<Item = &str> {
        self.files().filter(|f| f.ends_with(".js"))
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn set_dependencies(&mut self, dependencies: Vec<String>) {
        self.dependencies = dependencies;
    }
}

/// Lexically normalizes a `/`-separated path: drops `.` and empty segments
/// and folds `..` into its parent.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Directory part of a `/`-separated path, empty for bare file names.
pub fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or_default()
}

/// Resolves `entity` against the directory of `file`.
pub fn resolve_relative(file: &str, entity: &str) -> String {
    let dir = parent_dir(file);
    if dir.is_empty() || entity.starts_with('/') {
        normalize_path(entity)
    } else {
        normalize_path(&format!("{dir}/{entity}"))
    }
}
