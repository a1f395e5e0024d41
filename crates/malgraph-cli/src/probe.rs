//! Argument probe running an instrumented package copy in a docker container

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use malgraph_core::ServiceError;
use malgraph_core::manifest::Manifest;
use malgraph_core::probe::{
    ArgumentProbe, ProbeRequest, ProbeSite, instrumentation, parse_probe_log,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use walkdir::WalkDir;

const SERVICE: &str = "argument probe";
const LOG_FILE: &str = "log.log";
const PACKAGE: &str = "package";
const MOUNT: &str = "/pkg";

static SANDBOX_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// How the instrumented package is started inside the container. Launches
/// are tried in order until one writes the log.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Launch {
    /// `npm install` with the package's own install scripts.
    Install,
    /// `npm install` after `postinstall` is set to `node <script>`.
    Postinstall(String),
    /// `node <script>`, for packages whose install needs the network.
    Direct(String),
}

impl Launch {
    fn command(&self) -> Vec<&str> {
        match self {
            Launch::Install | Launch::Postinstall(_) => vec!["npm", "install"],
            Launch::Direct(script) => vec!["node", script],
        }
    }
}

pub struct DockerProbe {
    image: String,
    timeout: Duration,
    sandbox_root: PathBuf,
}

impl DockerProbe {
    pub fn new(image: &str, timeout: Duration, sandbox_root: Option<PathBuf>) -> Self {
        Self {
            image: image.to_string(),
            timeout,
            sandbox_root: sandbox_root.unwrap_or_else(std::env::temp_dir),
        }
    }

    fn sandbox(&self) -> PathBuf {
        let n = SANDBOX_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.sandbox_root
            .join(format!("malgraph-probe-{}-{n}", std::process::id()))
    }

    fn run(
        &self,
        sandbox: &Path,
        site: &ProbeSite<'_>,
        requests: &[ProbeRequest],
    ) -> Result<Option<HashMap<String, String>>, ServiceError> {
        copy_tree(site.package_dir, sandbox).map_err(|e| io_error("copy package", e))?;

        let target = sandbox.join(site.file);
        let source = fs::read_to_string(&target).map_err(|e| io_error("read source", e))?;
        let instrumented = instrument(&source, site.line, site.column, requests);
        fs::write(&target, instrumented).map_err(|e| io_error("write source", e))?;

        let package = sandbox.join(PACKAGE);
        if !package.join("package.json").is_file() {
            return Ok(None);
        }

        for launch in launches(sandbox, site.file) {
            if let Launch::Postinstall(script) = &launch {
                set_postinstall(&package, script)?;
            }
            self.start(sandbox, &launch)?;
            if let Some(values) = read_log(&package) {
                debug!(file = site.file, ?launch, "probe log collected");
                return Ok(Some(values));
            }
        }
        Ok(None)
    }

    fn start(&self, sandbox: &Path, launch: &Launch) -> Result<(), ServiceError> {
        let volume = format!("{}:{MOUNT}", sandbox.display());
        let workdir = format!("{MOUNT}/{PACKAGE}");
        let output = Command::new("docker")
            .args(["run", "--rm", "--network", "none", "-v", &volume, "-w", &workdir])
            .arg(&self.image)
            .args(["timeout", &self.timeout.as_secs().max(1).to_string()])
            .args(launch.command())
            .output()
            .map_err(|e| ServiceError::transport(SERVICE, format!("failed to start docker: {e}")))?;
        debug!(?launch, status = ?output.status.code(), "instrumented run finished");
        Ok(())
    }
}

impl ArgumentProbe for DockerProbe {
    fn evaluate(
        &self,
        site: &ProbeSite<'_>,
        requests: &[ProbeRequest],
    ) -> Result<Option<HashMap<String, String>>, ServiceError> {
        if requests.is_empty() {
            return Ok(None);
        }
        let sandbox = self.sandbox();
        let result = self.run(&sandbox, site, requests);
        if let Err(e) = fs::remove_dir_all(&sandbox) {
            warn!(path = %sandbox.display(), error = %e, "failed to remove probe sandbox");
        }
        result
    }
}

fn io_error(action: &str, e: std::io::Error) -> ServiceError {
    ServiceError::transport(SERVICE, format!("{action}: {e}"))
}

/// Install first, then `postinstall` hooks on the main entry and on the
/// probed file, then a direct run of the probed file.
fn launches(sandbox: &Path, file: &str) -> Vec<Launch> {
    let target = package_relative(file);
    let mut launches = vec![Launch::Install];
    if let Ok(manifest) = Manifest::load(sandbox) {
        let main = package_relative(&manifest.main_file());
        if main != target {
            launches.push(Launch::Postinstall(main));
        }
    }
    launches.push(Launch::Postinstall(target.clone()));
    launches.push(Launch::Direct(target));
    launches
}

fn package_relative(file: &str) -> String {
    file.strip_prefix("package/").unwrap_or(file).to_string()
}

fn set_postinstall(package: &Path, script: &str) -> Result<(), ServiceError> {
    let path = package.join("package.json");
    let text = fs::read_to_string(&path).map_err(|e| io_error("read package.json", e))?;
    let mut manifest: Value = serde_json::from_str(&text)
        .map_err(|e| ServiceError::malformed(SERVICE, format!("package.json: {e}")))?;
    let Some(root) = manifest.as_object_mut() else {
        return Err(ServiceError::malformed(SERVICE, "package.json is not an object"));
    };
    let scripts = root
        .entry("scripts")
        .or_insert_with(|| Value::Object(Map::new()));
    if !scripts.is_object() {
        *scripts = Value::Object(Map::new());
    }
    if let Some(scripts) = scripts.as_object_mut() {
        scripts.insert("postinstall".to_string(), Value::String(format!("node {script}")));
    }
    let text = serde_json::to_string_pretty(&manifest)
        .map_err(|e| ServiceError::malformed(SERVICE, e.to_string()))?;
    fs::write(&path, text).map_err(|e| io_error("write package.json", e))
}

fn read_log(package: &Path) -> Option<HashMap<String, String>> {
    let log = fs::read_to_string(package.join(LOG_FILE)).ok()?;
    let values = parse_probe_log(&log);
    (!values.is_empty()).then_some(values)
}

/// Inserts the instrumentation before the 1-based `line`, indented to
/// `column`.
fn instrument(source: &str, line: usize, column: usize, requests: &[ProbeRequest]) -> String {
    let mut lines: Vec<String> = source.lines().map(str::to_string).collect();
    let at = line.saturating_sub(1).min(lines.len());
    lines.splice(at..at, instrumentation(requests, column));
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(placeholder: &str, expression: &str) -> ProbeRequest {
        ProbeRequest {
            placeholder: placeholder.to_string(),
            expression: expression.to_string(),
        }
    }

    fn package_with_manifest(manifest: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("package")).unwrap();
        fs::write(dir.path().join("package/package.json"), manifest).unwrap();
        dir
    }

    #[test]
    fn logging_lines_and_exit_go_before_the_call() {
        let source = "const c = process.argv[2];\n  exec(c);\n";

        let out = instrument(source, 2, 2, &[request("#1", "c")]);

        assert_eq!(
            out,
            "const c = process.argv[2];\n  require('fs').appendFileSync(\"log.log\", \"#1:\" + (c) + \"\\n\");\n  process.exit(1);\n  exec(c);\n"
        );
    }

    #[test]
    fn line_past_the_end_appends() {
        let out = instrument("a();", 9, 0, &[request("#1", "x"), request("#2", "y")]);

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "a();");
        assert!(lines[2].contains("\"#2:\" + (y)"));
        assert_eq!(lines[3], "process.exit(1);");
    }

    #[test]
    fn launches_fall_back_from_install_to_direct_run() {
        let dir = package_with_manifest(r#"{"name": "pkg", "main": "lib/main"}"#);

        let launches = launches(dir.path(), "package/lib/util.js");

        assert_eq!(
            launches,
            [
                Launch::Install,
                Launch::Postinstall("lib/main.js".to_string()),
                Launch::Postinstall("lib/util.js".to_string()),
                Launch::Direct("lib/util.js".to_string()),
            ]
        );
        assert_eq!(launches[0].command(), ["npm", "install"]);
        assert_eq!(launches[3].command(), ["node", "lib/util.js"]);
    }

    #[test]
    fn probed_main_entry_is_not_launched_twice() {
        let dir = package_with_manifest(r#"{"name": "pkg"}"#);

        let launches = launches(dir.path(), "package/index.js");

        assert_eq!(
            launches,
            [
                Launch::Install,
                Launch::Postinstall("index.js".to_string()),
                Launch::Direct("index.js".to_string()),
            ]
        );
    }

    #[test]
    fn postinstall_hook_is_rewritten() {
        let dir = package_with_manifest(
            r#"{"name": "pkg", "scripts": {"test": "jest", "postinstall": "node setup.js"}}"#,
        );
        let package = dir.path().join("package");

        set_postinstall(&package, "index.js").unwrap();

        let manifest: Value =
            serde_json::from_str(&fs::read_to_string(package.join("package.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["scripts"]["postinstall"], "node index.js");
        assert_eq!(manifest["scripts"]["test"], "jest");
    }

    #[test]
    fn postinstall_hook_is_added_without_scripts() {
        let dir = package_with_manifest(r#"{"name": "pkg"}"#);
        let package = dir.path().join("package");

        set_postinstall(&package, "lib/run.js").unwrap();

        let manifest: Value =
            serde_json::from_str(&fs::read_to_string(package.join("package.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["scripts"]["postinstall"], "node lib/run.js");
    }

    #[test]
    fn log_is_read_from_the_package_directory() {
        let dir = package_with_manifest("{}");
        let package = dir.path().join("package");
        assert!(read_log(&package).is_none());

        fs::write(package.join(LOG_FILE), "#1:curl evil.example\n").unwrap();

        assert_eq!(read_log(&package).unwrap()["#1"], "curl evil.example");
    }

    #[test]
    fn copies_nested_package_files() {
        let from = tempfile::tempdir().unwrap();
        let to = tempfile::tempdir().unwrap();
        fs::create_dir_all(from.path().join("package/lib")).unwrap();
        fs::write(from.path().join("package/index.js"), "1;").unwrap();
        fs::write(from.path().join("package/lib/util.js"), "2;").unwrap();

        copy_tree(from.path(), &to.path().join("copy")).unwrap();

        assert_eq!(
            fs::read_to_string(to.path().join("copy/package/lib/util.js")).unwrap(),
            "2;"
        );
        assert!(to.path().join("copy/package/index.js").is_file());
    }

    #[test]
    fn sandboxes_are_unique() {
        let probe = DockerProbe::new("node:20-alpine", Duration::from_secs(10), None);

        assert_ne!(probe.sandbox(), probe.sandbox());
    }
}
