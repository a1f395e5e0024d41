//! End-to-end package analysis over fixtures from tests/fixtures/

use std::fs;
use std::path::Path;

use insta::assert_json_snapshot;
use malgraph_core::knowledge::StaticKnowledgeStore;
use malgraph_core::oracle::{FixedOracle, Judgement, Oracle};
use malgraph_core::pattern::PatternLibrary;
use malgraph_core::probe::NoProbe;
use malgraph_core::{AnalysisOptions, Outcome, PackageAnalyzer, Phase, Report, Status, Workspace};

const FIXTURES_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

fn workspace(scenario: &str, reports: &Path) -> Workspace {
    let root = Path::new(FIXTURES_DIR).join(scenario);
    Workspace {
        code_dir: root.join("code"),
        graph_dir: root.join("graphs"),
        report_dir: reports.to_path_buf(),
    }
}

fn analyze(
    workspace: &Workspace,
    patterns: &PatternLibrary,
    oracle: Option<&dyn Oracle>,
) -> Outcome {
    let knowledge = StaticKnowledgeStore::with_defaults();
    PackageAnalyzer::new(
        &knowledge,
        patterns,
        oracle,
        &NoProbe,
        AnalysisOptions::default(),
    )
    .analyze("pkg", workspace)
}

fn read_report(workspace: &Workspace) -> Report {
    let path = workspace.report_dir("pkg").join("report.json");
    let content = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read report {}: {}", path.display(), e));
    serde_json::from_str(&content).expect("Failed to parse report")
}

#[test]
fn reading_passwd_is_confirmed_by_the_oracle() {
    let reports = tempfile::tempdir().unwrap();
    let ws = workspace("read_passwd", reports.path());
    let patterns =
        PatternLibrary::load(&Path::new(FIXTURES_DIR).join("read_passwd/patterns.toml")).unwrap();
    let oracle = FixedOracle::new([Judgement::FileRead]);

    let outcome = analyze(&ws, &patterns, Some(&oracle));

    assert_eq!(outcome.status, Status::Malicious);
    assert_eq!(outcome.findings, 1);
    assert_eq!(
        oracle.calls(),
        vec![(Judgement::FileRead, "/etc/passwd".to_string())]
    );
    assert_json_snapshot!(read_report(&ws), @r#"
    {
      "Malicious": true,
      "IMPORT": {
        "Information Stealing": [
          {
            "pattern desc": "read local file - send through network communication",
            "file": {
              "package/index.js": [
                2
              ]
            }
          }
        ]
      }
    }
    "#);
}

#[test]
fn benign_oracle_verdict_leaves_the_package_clean() {
    let reports = tempfile::tempdir().unwrap();
    let ws = workspace("read_passwd", reports.path());
    let patterns =
        PatternLibrary::load(&Path::new(FIXTURES_DIR).join("read_passwd/patterns.toml")).unwrap();
    let oracle = FixedOracle::default();

    let outcome = analyze(&ws, &patterns, Some(&oracle));

    assert_eq!(outcome.status, Status::Benign);
    assert_eq!(oracle.calls().len(), 1);
    let report = read_report(&ws);
    assert!(!report.is_malicious());
    assert_eq!(report.finding_count(), 0);
}

#[test]
fn command_in_required_local_file_is_reported_at_its_source() {
    let reports = tempfile::tempdir().unwrap();
    let ws = workspace("local_require", reports.path());

    let outcome = analyze(&ws, &PatternLibrary::with_defaults(), None);

    assert_eq!(outcome.status, Status::Malicious);
    let report = read_report(&ws);
    let findings = &report.findings(Phase::Import)["Malicious Command Execution"];
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].description, "execute a command");
    assert_eq!(
        findings[0].file.get("package/util.js").map(|l| l.iter().copied().collect::<Vec<_>>()),
        Some(vec![1])
    );
    assert!(report.findings(Phase::Run).is_empty());
}

#[test]
fn command_output_returned_from_local_module_reaches_the_request() {
    let reports = tempfile::tempdir().unwrap();
    let ws = workspace("local_function", reports.path());

    let outcome = analyze(&ws, &PatternLibrary::with_defaults(), None);

    assert_eq!(outcome.status, Status::Malicious);
    let report = read_report(&ws);
    let findings = &report.findings(Phase::Import)["Malicious Command Execution"];
    assert_eq!(findings.len(), 1);
    assert_eq!(
        findings[0].description,
        "execute a command - send result through HTTP request"
    );
    assert!(findings[0].file["package/util.js"].contains(&2));
    assert!(findings[0].file["package/index.js"].contains(&3));
    assert!(report.findings(Phase::Run).is_empty());
}

#[test]
fn control_flow_alone_matches_only_the_cfg_pattern() {
    let reports = tempfile::tempdir().unwrap();
    let ws = workspace("exec_then_fetch", reports.path());

    let outcome = analyze(&ws, &PatternLibrary::with_defaults(), None);

    assert_eq!(outcome.status, Status::Malicious);
    let report = read_report(&ws);
    let descriptions: Vec<&str> = report
        .findings(Phase::Import)
        .values()
        .flatten()
        .map(|f| f.description.as_str())
        .collect();
    assert_eq!(descriptions, ["execute a command - make HTTP request"]);
}

#[test]
fn import_phase_can_be_disabled() {
    let reports = tempfile::tempdir().unwrap();
    let ws = workspace("exec_then_fetch", reports.path());
    let knowledge = StaticKnowledgeStore::with_defaults();
    let patterns = PatternLibrary::with_defaults();
    let options = AnalysisOptions {
        phases: vec![Phase::Install],
        ..AnalysisOptions::default()
    };

    let outcome = PackageAnalyzer::new(&knowledge, &patterns, None, &NoProbe, options)
        .analyze("pkg", &ws);

    assert_eq!(outcome.status, Status::Benign);
    assert_eq!(read_report(&ws).finding_count(), 0);
}
