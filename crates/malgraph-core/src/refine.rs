//! Oracle refinement of pattern matches
//!
//! Some patterns only indicate malice when a call argument does: the
//! command being executed, the path being read, the endpoint being contacted.
//! For those the argument is recovered from source (and, when computed at run
//! time, through an [`ArgumentProbe`]) and handed to the [`Oracle`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::category::Category;
use crate::error::Result;
use crate::matcher::Mapping;
use crate::oracle::{Judgement, Oracle};
use crate::pattern::Pattern;
use crate::pdg::{DependencyNode, NodeArena, UNKNOWN_POSITION};
use crate::probe::{ArgumentProbe, ProbeRequest, ProbeSite};
use crate::report::Report;
use crate::syntax::{Argument, SourceText};

pub trait Refine {
    /// Whether a match of `pattern` should be reported.
    fn keep(
        &self,
        pattern: &Pattern,
        mapping: &Mapping,
        arena: &NodeArena,
        report: &Report,
    ) -> Result<bool>;
}

/// Reports every match unchanged.
#[derive(Debug, Default)]
pub struct KeepAll;

impl Refine for KeepAll {
    fn keep(&self, _: &Pattern, _: &Mapping, _: &NodeArena, _: &Report) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rule {
    category: Category,
    judgement: Judgement,
    skip_when_stealing: bool,
}

impl Rule {
    const fn new(category: Category, judgement: Judgement) -> Self {
        Self {
            category,
            judgement,
            skip_when_stealing: false,
        }
    }
}

fn rule_for(description: &str) -> Option<Rule> {
    let rule = match description {
        "execute a command" => Rule::new(Category::EXECUTE_COMMAND, Judgement::Command),
        "spawn a new process" => Rule::new(Category::SPAWN_PROCESS, Judgement::Command),
        "run an executable file" => Rule::new(Category::RUN_EXECUTABLE, Judgement::Executable),
        "execute a dynamically created program" => {
            Rule::new(Category::DYNAMIC_PROGRAM, Judgement::Program)
        }
        "read from file - execute dynamically created program"
        | "manipulate path - read local file - send through network communication"
        | "read local file - send through network communication"
        | "read local file - send through HTTP request" => {
            Rule::new(Category::READ_FILE, Judgement::FileRead)
        }
        "search file - send through network" => {
            Rule::new(Category::SEARCH_FILE, Judgement::SearchPath)
        }
        "make HTTP request - write data to local sensitive path"
        | "change file mode - write data to file"
        | "read file - write data to file" => Rule::new(Category::WRITE_FILE, Judgement::FileWrite),
        "encode data - data rep - send through network communication"
        | "encode data - send through network communication" => Rule {
            skip_when_stealing: true,
            ..Rule::new(Category::NETWORK_COMMUNICATION, Judgement::Url)
        },
        _ => return None,
    };
    Some(rule)
}

enum Part {
    Text(String),
    Placeholder(String),
}

/// Refines matches with an oracle over recovered call arguments. Without an
/// oracle every match is kept.
pub struct Refiner<'a> {
    package_dir: &'a Path,
    oracle: Option<&'a dyn Oracle>,
    probe: &'a dyn ArgumentProbe,
    sources: RefCell<HashMap<String, Option<SourceText>>>,
}

impl<'a> Refiner<'a> {
    pub fn new(
        package_dir: &'a Path,
        oracle: Option<&'a dyn Oracle>,
        probe: &'a dyn ArgumentProbe,
    ) -> Self {
        Self {
            package_dir,
            oracle,
            probe,
            sources: RefCell::new(HashMap::new()),
        }
    }

    /// Argument text of the call at `node`'s position.
    ///
    /// `None` when it cannot be determined, an empty string when the call
    /// has no usable arguments or the probe run never reached it.
    pub fn argument_text(&self, node: &DependencyNode) -> Result<Option<String>> {
        if node.line == UNKNOWN_POSITION || node.file.is_empty() {
            return Ok(None);
        }
        let column = if node.column == UNKNOWN_POSITION {
            0
        } else {
            node.column
        };

        let (parts, requests, site) = {
            let mut sources = self.sources.borrow_mut();
            let source = sources
                .entry(node.file.clone())
                .or_insert_with(|| self.read_source(&node.file));
            let Some(source) = source.as_ref().filter(|s| s.module().is_some()) else {
                return Ok(None);
            };
            let Some(arguments) = source.call_arguments_at(node.line, column) else {
                return Ok(Some(String::new()));
            };

            let mut parts = Vec::with_capacity(arguments.len());
            let mut requests = Vec::new();
            for argument in arguments {
                match argument {
                    Argument::Literal(text) => parts.push(Part::Text(text)),
                    Argument::Dynamic(expression) => {
                        let placeholder = format!("#{}", requests.len() + 1);
                        parts.push(Part::Placeholder(placeholder.clone()));
                        requests.push(ProbeRequest {
                            placeholder,
                            expression,
                        });
                    }
                }
            }
            let site = if requests.is_empty() {
                None
            } else {
                match source.statement_start(node.line, column) {
                    Some(position) => Some(position),
                    None => return Ok(Some(String::new())),
                }
            };
            (parts, requests, site)
        };

        let values = match site {
            None => HashMap::new(),
            Some(_) if !self.probe.is_enabled() => return Ok(None),
            Some((line, column)) => {
                let site = ProbeSite {
                    package_dir: self.package_dir,
                    file: &node.file,
                    line,
                    column,
                };
                match self.probe.evaluate(&site, &requests)? {
                    Some(values) => values,
                    None => {
                        debug!(file = %node.file, line = node.line, "probe did not reach the call");
                        return Ok(Some(String::new()));
                    }
                }
            }
        };

        let text = parts
            .into_iter()
            .filter_map(|part| match part {
                Part::Text(text) => Some(text),
                Part::Placeholder(placeholder) => values.get(&placeholder).cloned(),
            })
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Some(text))
    }

    fn read_source(&self, file: &str) -> Option<SourceText> {
        let path = self.package_dir.join(file);
        match std::fs::read_to_string(&path) {
            Ok(text) => Some(SourceText::parse(&text)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "source unavailable for refinement");
                None
            }
        }
    }
}

impl Refine for Refiner<'_> {
    fn keep(
        &self,
        pattern: &Pattern,
        mapping: &Mapping,
        arena: &NodeArena,
        report: &Report,
    ) -> Result<bool> {
        let Some(rule) = rule_for(pattern.description()) else {
            return Ok(true);
        };
        if rule.skip_when_stealing && report.contains_information_stealing() {
            return Ok(false);
        }
        let Some(oracle) = self.oracle else {
            return Ok(true);
        };
        let Some(node) = mapping.node(rule.category).and_then(|id| arena.get(id)) else {
            return Ok(true);
        };

        match self.argument_text(node)? {
            None => Ok(true),
            Some(text) if text.is_empty() => Ok(false),
            Some(text) => {
                let verdict = oracle.judge(rule.judgement, &text)?;
                debug!(
                    pattern = pattern.description(),
                    judgement = rule.judgement.as_str(),
                    argument = %text,
                    verdict,
                    "oracle refinement"
                );
                Ok(verdict)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::matcher::find_matches;
    use crate::oracle::FixedOracle;
    use crate::pattern::PatternEdge;
    use crate::pdg::EdgeKind;
    use crate::probe::NoProbe;
    use crate::deadline::Deadline;
    use crate::report::{INFORMATION_STEALING, Phase};
    use crate::sensitive::SensitiveGraph;
    use std::collections::BTreeMap;

    struct FixedProbe(HashMap<String, String>);

    impl ArgumentProbe for FixedProbe {
        fn evaluate(
            &self,
            _site: &ProbeSite<'_>,
            _requests: &[ProbeRequest],
        ) -> std::result::Result<Option<HashMap<String, String>>, ServiceError> {
            Ok(Some(self.0.clone()))
        }
    }

    fn package(source: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("package")).unwrap();
        std::fs::write(dir.path().join("package/index.js"), source).unwrap();
        dir
    }

    fn call_node(id: u64, line: usize, category: Category) -> DependencyNode {
        let mut node = DependencyNode::new(id, 1, "CALL");
        node.line = line;
        node.column = 0;
        node.file = "package/index.js".into();
        node.mark_sensitive(vec![category]);
        node
    }

    fn single_match(category: Category, description: &str, node: DependencyNode) -> (Pattern, Mapping, NodeArena) {
        let pattern = Pattern::new("B", description, PatternEdge::Single(category), vec![]);
        let mut graph = SensitiveGraph::new();
        graph.add_node(node.id, category);
        let mut arena = NodeArena::new();
        arena.insert(node);
        let mapping = find_matches(&pattern, &graph, &Deadline::unlimited())
            .unwrap()
            .remove(0);
        (pattern, mapping, arena)
    }

    #[test]
    fn literal_path_reaches_the_oracle() {
        let dir = package("const fs = require('fs');\nfs.readFileSync('/etc/passwd');\n");
        let oracle = FixedOracle::new([Judgement::FileRead]);
        let refiner = Refiner::new(dir.path(), Some(&oracle), &NoProbe);
        let pattern = Pattern::new(
            INFORMATION_STEALING,
            "read local file - send through HTTP request",
            PatternEdge::Pair {
                head: Category::READ_FILE,
                kind: EdgeKind::Ddg,
                tail: Category::HTTP_REQUEST,
            },
            vec![],
        );
        let mut graph = SensitiveGraph::new();
        graph.add_node(1, Category::READ_FILE);
        graph.add_node(2, Category::HTTP_REQUEST);
        graph.add_edge(1, 2, EdgeKind::Ddg, &[]);
        let mut arena = NodeArena::new();
        arena.insert(call_node(1, 2, Category::READ_FILE));
        arena.insert(call_node(2, 2, Category::HTTP_REQUEST));
        let mapping = find_matches(&pattern, &graph, &Deadline::unlimited())
            .unwrap()
            .remove(0);

        assert!(refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
        assert_eq!(
            oracle.calls(),
            vec![(Judgement::FileRead, "/etc/passwd".to_string())]
        );
    }

    #[test]
    fn negative_verdict_discards() {
        let dir = package("require('child_process').exec('ls -la');\n");
        let oracle = FixedOracle::default();
        let refiner = Refiner::new(dir.path(), Some(&oracle), &NoProbe);
        let (pattern, mapping, arena) = single_match(
            Category::EXECUTE_COMMAND,
            "execute a command",
            call_node(1, 1, Category::EXECUTE_COMMAND),
        );

        assert!(!refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
        assert_eq!(oracle.calls()[0].1, "ls -la");
    }

    #[test]
    fn call_without_arguments_is_discarded() {
        let dir = package("exec();\n");
        let oracle = FixedOracle::new([Judgement::Command]);
        let refiner = Refiner::new(dir.path(), Some(&oracle), &NoProbe);
        let (pattern, mapping, arena) = single_match(
            Category::EXECUTE_COMMAND,
            "execute a command",
            call_node(1, 1, Category::EXECUTE_COMMAND),
        );

        assert!(!refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
        assert!(oracle.calls().is_empty());
    }

    struct UnreachedCall;

    impl ArgumentProbe for UnreachedCall {
        fn evaluate(
            &self,
            _site: &ProbeSite<'_>,
            _requests: &[ProbeRequest],
        ) -> std::result::Result<Option<HashMap<String, String>>, ServiceError> {
            Ok(None)
        }
    }

    #[test]
    fn call_never_reached_at_run_time_is_discarded() {
        let dir = package("const c = process.argv[2];\nexec(c);\n");
        let oracle = FixedOracle::new([Judgement::Command]);
        let refiner = Refiner::new(dir.path(), Some(&oracle), &UnreachedCall);
        let (pattern, mapping, arena) = single_match(
            Category::EXECUTE_COMMAND,
            "execute a command",
            call_node(1, 2, Category::EXECUTE_COMMAND),
        );

        assert_eq!(refiner.argument_text(arena.get(1).unwrap()).unwrap(), Some(String::new()));
        assert!(!refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
        assert!(oracle.calls().is_empty());
    }

    #[test]
    fn dynamic_argument_without_run_time_values_keeps_the_match() {
        let dir = package("const c = process.argv[2];\nexec(c);\n");
        let oracle = FixedOracle::default();
        let refiner = Refiner::new(dir.path(), Some(&oracle), &NoProbe);
        let (pattern, mapping, arena) = single_match(
            Category::EXECUTE_COMMAND,
            "execute a command",
            call_node(1, 2, Category::EXECUTE_COMMAND),
        );

        assert!(refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
        assert!(oracle.calls().is_empty());
    }

    #[test]
    fn probe_values_replace_placeholders() {
        let dir = package("const p = home + '/.ssh';\nspawn('cat', p);\n");
        let oracle = FixedOracle::new([Judgement::Command]);
        let probe = FixedProbe(HashMap::from([("#1".to_string(), "/root/.ssh".to_string())]));
        let refiner = Refiner::new(dir.path(), Some(&oracle), &probe);
        let (pattern, mapping, arena) = single_match(
            Category::SPAWN_PROCESS,
            "spawn a new process",
            call_node(1, 2, Category::SPAWN_PROCESS),
        );

        assert!(refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
        assert_eq!(oracle.calls()[0].1, "cat /root/.ssh");
    }

    #[test]
    fn url_refinement_yields_to_information_stealing() {
        let dir = package("net.connect('evil.example');\n");
        let oracle = FixedOracle::new([Judgement::Url]);
        let refiner = Refiner::new(dir.path(), Some(&oracle), &NoProbe);
        let (pattern, mapping, arena) = single_match(
            Category::NETWORK_COMMUNICATION,
            "encode data - send through network communication",
            call_node(1, 1, Category::NETWORK_COMMUNICATION),
        );
        let mut report = Report::new();
        report.add_finding(
            Phase::Import,
            INFORMATION_STEALING,
            "read local file - send through HTTP request",
            BTreeMap::new(),
        );

        assert!(!refiner.keep(&pattern, &mapping, &arena, &report).unwrap());
        assert!(refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
    }

    #[test]
    fn without_oracle_everything_is_kept() {
        let dir = package("exec('rm -rf /');\n");
        let refiner = Refiner::new(dir.path(), None, &NoProbe);
        let (pattern, mapping, arena) = single_match(
            Category::EXECUTE_COMMAND,
            "execute a command",
            call_node(1, 1, Category::EXECUTE_COMMAND),
        );

        assert!(refiner.keep(&pattern, &mapping, &arena, &Report::new()).unwrap());
    }
}
