//! Per-function dependency graphs and the package-wide node arena
//!
//! Every dependency export describes one program unit (a file's top-level
//! code, a named function or a lambda). Nodes from all units live in a single
//! [`NodeArena`] so that classification written once is visible from every
//! behavior graph that references the node.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use std::sync::LazyLock;

use crate::category::Category;
use crate::cpg::{GraphStore, NodeId};
use crate::dot::DotGraph;
use crate::error::{AnalysisError, Result};

/// Sentinel for missing line or column information.
pub const UNKNOWN_POSITION: usize = usize::MAX;

pub const PROGRAM_NAME: &str = ":program";

static LAMBDA_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<lambda>\d*").expect("Invalid regex pattern"));

pub fn is_lambda_name(name: &str) -> bool {
    LAMBDA_NAME.is_match(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EdgeKind {
    Cfg,
    Ddg,
}

impl EdgeKind {
    /// An edge is data-flow when any of its tags mentions `DDG`.
    pub fn classify<S: AsRef<str>>(tags: &[S]) -> Self {
        if tags.iter().any(|t| t.as_ref().contains("DDG")) {
            EdgeKind::Ddg
        } else {
            EdgeKind::Cfg
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Cfg => "CFG",
            EdgeKind::Ddg => "DDG",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Program,
    Lambda,
    Function,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    FunctionCall,
    LocalModuleCall,
    Assignment,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Derivation {
    Builtin,
    ThirdParty,
}

impl Derivation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Derivation::Builtin => "builtin",
            Derivation::ThirdParty => "third_party",
        }
    }
}

/// Entrance and return values of a behavior graph inlined at a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeLink {
    pub entrance: NodeId,
    pub returns: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub id: NodeId,
    pub unit: NodeId,
    pub kind: String,
    pub line: usize,
    pub column: usize,
    pub name: Option<String>,
    pub code: Option<String>,
    pub file: String,
    pub sensitive: bool,
    pub entrance: bool,
    pub is_return_value: bool,
    pub call_kind: Option<CallKind>,
    pub full_name: Option<String>,
    pub derivation: Option<Derivation>,
    pub categories: Vec<Category>,
    pub callee: Option<CalleeLink>,
}

impl DependencyNode {
    pub fn new(id: NodeId, unit: NodeId, kind: impl Into<String>) -> Self {
        Self {
            id,
            unit,
            kind: kind.into(),
            line: UNKNOWN_POSITION,
            column: UNKNOWN_POSITION,
            name: None,
            code: None,
            file: String::new(),
            sensitive: false,
            entrance: false,
            is_return_value: false,
            call_kind: None,
            full_name: None,
            derivation: None,
            categories: Vec::new(),
            callee: None,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or_default()
    }

    pub fn mark_sensitive(&mut self, categories: Vec<Category>) {
        self.sensitive = true;
        self.categories = categories;
    }

    /// The single category of a node after sensitive-node splitting.
    pub fn category(&self) -> Option<Category> {
        self.categories.first().copied()
    }

    pub fn has_resolved_callee(&self) -> bool {
        matches!(
            self.call_kind,
            Some(CallKind::FunctionCall | CallKind::LocalModuleCall)
        ) && self.callee.is_some()
    }
}

#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: HashMap<NodeId, DependencyNode>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: DependencyNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn get(&self, id: NodeId) -> Option<&DependencyNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut DependencyNode> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Kind of the node, or an empty string for ids outside the arena.
    pub fn kind(&self, id: NodeId) -> &str {
        self.get(id).map(|n| n.kind.as_str()).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    id: NodeId,
    name: String,
    full_name: String,
    file: String,
    kind: UnitKind,
    nodes: Vec<NodeId>,
    edges: HashMap<(NodeId, NodeId), Vec<String>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
}

impl DependencyGraph {
    /// Loads one dependency export. Returns `None` for units that carry no
    /// analyzable JavaScript code.
    pub fn load(path: &Path, store: &GraphStore, arena: &mut NodeArena) -> Result<Option<Self>> {
        let content = std::fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        let graph = DotGraph::parse(&content).map_err(|source| AnalysisError::InvalidExport {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_dot(&graph, store, arena))
    }

    pub fn from_dot(graph: &DotGraph, store: &GraphStore, arena: &mut NodeArena) -> Option<Self> {
        let first = graph.nodes().first()?;
        let id: NodeId = first.id.parse().ok()?;
        let code_node = store.node(id);

        let lookup = |key: &str| {
            first
                .attr(key)
                .or_else(|| code_node.and_then(|n| n.attr(key)))
                .map(str::to_string)
        };
        let name = lookup("NAME")?;
        let full_name = lookup("FULL_NAME").unwrap_or_default();
        let file = lookup("FILENAME").unwrap_or_default();
        if file == "<empty>" || !file.ends_with(".js") {
            return None;
        }

        let kind = if name == PROGRAM_NAME {
            UnitKind::Program
        } else if is_lambda_name(&name) {
            UnitKind::Lambda
        } else {
            UnitKind::Function
        };

        let mut unit = DependencyGraph {
            id,
            name,
            full_name,
            file,
            kind,
            nodes: Vec::new(),
            edges: HashMap::new(),
            successors: HashMap::new(),
            predecessors: HashMap::new(),
        };

        for dot_node in graph.nodes() {
            let Ok(node_id) = dot_node.id.parse::<NodeId>() else {
                continue;
            };
            let code_node = store.node(node_id);
            let attr = |key: &str| {
                dot_node
                    .attr(key)
                    .or_else(|| code_node.and_then(|n| n.attr(key)))
            };
            let position = |key: &str| {
                attr(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(UNKNOWN_POSITION)
            };

            let kind = dot_node
                .attr("NODE_TYPE")
                .or_else(|| code_node.map(|n| n.kind.as_str()))
                .unwrap_or("UNKNOWN");
            let mut node = DependencyNode::new(node_id, id, kind);
            node.line = position("LINE_NUMBER");
            node.column = position("COLUMN_NUMBER");
            node.name = attr("NAME").map(str::to_string);
            node.code = code_node
                .and_then(|n| n.code())
                .or_else(|| dot_node.attr("CODE"))
                .map(str::to_string);
            node.file = unit.file.clone();
            node.entrance = node_id == id;

            unit.nodes.push(node_id);
            arena.insert(node);
        }

        for dot_edge in graph.edges() {
            let (Ok(source), Ok(target)) = (
                dot_edge.source.parse::<NodeId>(),
                dot_edge.target.parse::<NodeId>(),
            ) else {
                continue;
            };
            let tags: Vec<String> = match dot_edge.attr("label") {
                Some(label) => vec![label.to_string()],
                None => dot_edge
                    .attrs
                    .iter()
                    .filter(|(k, _)| k != "key")
                    .map(|(_, v)| v.clone())
                    .collect(),
            };
            unit.add_edge(source, target, tags);
        }

        let returns: Vec<NodeId> = unit
            .nodes
            .iter()
            .copied()
            .filter(|n| arena.kind(*n) == "METHOD_RETURN")
            .collect();
        for ret in returns {
            unit.drop_in_edges(ret);
        }

        Some(unit)
    }

    fn add_edge(&mut self, source: NodeId, target: NodeId, tags: Vec<String>) {
        let successors = self.successors.entry(source).or_default();
        if !successors.contains(&target) {
            successors.push(target);
        }
        let predecessors = self.predecessors.entry(target).or_default();
        if !predecessors.contains(&source) {
            predecessors.push(source);
        }
        self.edges.entry((source, target)).or_default().extend(tags);
    }

    fn drop_in_edges(&mut self, target: NodeId) {
        for source in self.predecessors.remove(&target).unwrap_or_default() {
            self.edges.remove(&(source, target));
            if let Some(successors) = self.successors.get_mut(&source) {
                successors.retain(|s| *s != target);
            }
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn is_program(&self) -> bool {
        self.kind == UnitKind::Program
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn predecessors(&self, id: NodeId) -> &[NodeId] {
        self.predecessors
            .get(&id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn tags(&self, source: NodeId, target: NodeId) -> Option<&[String]> {
        self.edges.get(&(source, target)).map(Vec::as_slice)
    }

    pub fn edge_kind(&self, source: NodeId, target: NodeId) -> Option<EdgeKind> {
        self.tags(source, target).map(EdgeKind::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPG: &str = r#"digraph {
"100" [label = "METHOD" NAME="check" FULL_NAME="package/index.js::program:check" FILENAME="package/index.js" CODE="function check(a) {}" ]
"101" [label = "METHOD_PARAMETER_IN" NAME="a" CODE="a" LINE_NUMBER="1" ]
"102" [label = "CALL" NAME="exec" CODE="exec(a)" LINE_NUMBER="2" COLUMN_NUMBER="2" ]
"103" [label = "METHOD_RETURN" CODE="RET" ]
}"#;

    const PDG: &str = r#"digraph "check" {
"100" [NODE_TYPE="METHOD" NAME="check" FULL_NAME="package/index.js::program:check" FILENAME="package/index.js" ]
"101" [NODE_TYPE="METHOD_PARAMETER_IN" NAME="a" LINE_NUMBER="1" ]
"102" [NODE_TYPE="CALL" NAME="exec" LINE_NUMBER="2" COLUMN_NUMBER="2" CODE="exec(a)" ]
"103" [NODE_TYPE="METHOD_RETURN" ]
"100" -> "101" [ label = "CFG" ]
"101" -> "102" [ label = "CFG" ]
"101" -> "102" [ label = "DDG: a" ]
"102" -> "103" [ label = "CFG" ]
}"#;

    fn load(pdg: &str) -> (Option<DependencyGraph>, NodeArena) {
        let store = GraphStore::parse(CPG).unwrap();
        let mut arena = NodeArena::new();
        let graph = DotGraph::parse(pdg).unwrap();
        let unit = DependencyGraph::from_dot(&graph, &store, &mut arena);
        (unit, arena)
    }

    #[test]
    fn first_node_is_entrance_and_names_the_unit() {
        let (unit, arena) = load(PDG);
        let unit = unit.unwrap();

        assert_eq!(unit.id(), 100);
        assert_eq!(unit.name(), "check");
        assert_eq!(unit.file(), "package/index.js");
        assert_eq!(unit.kind(), UnitKind::Function);
        assert!(arena.get(100).unwrap().entrance);
        assert!(!arena.get(101).unwrap().entrance);
    }

    #[test]
    fn parallel_edges_merge_tags() {
        let (unit, _) = load(PDG);
        let unit = unit.unwrap();

        assert_eq!(unit.tags(101, 102).unwrap(), ["CFG", "DDG: a"]);
        assert_eq!(unit.edge_kind(101, 102), Some(EdgeKind::Ddg));
        assert_eq!(unit.successors(101), [102]);
    }

    #[test]
    fn method_return_in_edges_are_dropped() {
        let (unit, _) = load(PDG);
        let unit = unit.unwrap();

        assert!(unit.predecessors(103).is_empty());
        assert!(unit.successors(102).is_empty());
        assert!(unit.tags(102, 103).is_none());
    }

    #[test]
    fn code_comes_from_the_property_graph() {
        let (_, arena) = load(PDG);

        assert_eq!(arena.get(102).unwrap().code(), "exec(a)");
        assert_eq!(arena.get(102).unwrap().line, 2);
        assert_eq!(arena.get(103).unwrap().line, UNKNOWN_POSITION);
    }

    #[test]
    fn non_javascript_units_are_skipped() {
        let pdg = r#"digraph { "100" [NAME=":program" FILENAME="<empty>"] }"#;

        let (unit, _) = load(pdg);

        assert!(unit.is_none());
    }

    #[test]
    fn unit_kind_from_name() {
        assert!(is_lambda_name("<lambda>3"));
        assert!(!is_lambda_name("main"));
        let pdg = r#"digraph { "100" [NAME="<lambda>0" FILENAME="package/a.js"] }"#;

        let (unit, _) = load(pdg);

        assert_eq!(unit.unwrap().kind(), UnitKind::Lambda);
    }

    #[test]
    fn edge_kind_requires_ddg_substring() {
        assert_eq!(EdgeKind::classify(&["CFG", "CDG: "]), EdgeKind::Cfg);
        assert_eq!(EdgeKind::classify(&["DDG"]), EdgeKind::Ddg);
        assert_eq!(EdgeKind::classify::<&str>(&[]), EdgeKind::Cfg);
    }
}
