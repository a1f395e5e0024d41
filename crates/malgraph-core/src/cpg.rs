//! Whole-package code-property graph
//!
//! Read-only index over the exported graph: node attributes plus the AST,
//! argument and call edges between nodes.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::dot::{DotError, DotGraph};
use crate::error::{AnalysisError, Result};

pub type NodeId = u64;

pub const EXPORT_FILE: &str = "export.dot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeEdgeKind {
    AstChild,
    Argument,
    Call,
}

impl CodeEdgeKind {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "AST" => Some(CodeEdgeKind::AstChild),
            "ARGUMENT" => Some(CodeEdgeKind::Argument),
            "CALL" => Some(CodeEdgeKind::Call),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeNode {
    pub id: NodeId,
    pub kind: String,
    attrs: HashMap<String, String>,
}

impl CodeNode {
    pub fn new(id: NodeId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            attrs: HashMap::new(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn code(&self) -> Option<&str> {
        self.attr("CODE")
    }

    pub fn name(&self) -> Option<&str> {
        self.attr("NAME")
    }

    pub fn line(&self) -> Option<usize> {
        self.attr("LINE_NUMBER").and_then(|v| v.trim().parse().ok())
    }

    pub fn column(&self) -> Option<usize> {
        self.attr("COLUMN_NUMBER").and_then(|v| v.trim().parse().ok())
    }

    pub fn method_full_name(&self) -> Option<&str> {
        self.attr("METHOD_FULL_NAME")
    }

    fn order(&self) -> i64 {
        self.attr("ORDER")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(i64::MAX)
    }

    fn argument_index(&self) -> i64 {
        self.attr("ARGUMENT_INDEX")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(i64::MAX)
    }
}

#[derive(Debug)]
pub struct GraphStore {
    nodes: HashMap<NodeId, CodeNode>,
    edges: HashMap<(NodeId, NodeId), HashSet<CodeEdgeKind>>,
    successors: HashMap<NodeId, Vec<NodeId>>,
    next_id: AtomicU64,
}

impl GraphStore {
    /// Loads `export.dot` from the package's `cpg` directory.
    pub fn load(cpg_dir: &Path) -> Result<Self> {
        let path = cpg_dir.join(EXPORT_FILE);
        if !path.is_file() {
            return Err(AnalysisError::MissingExport { path });
        }
        let content = std::fs::read_to_string(&path).map_err(|e| AnalysisError::io(&path, e))?;
        let store = Self::parse(&content)
            .map_err(|source| AnalysisError::InvalidExport { path, source })?;
        debug!(nodes = store.nodes.len(), "loaded code-property graph");
        Ok(store)
    }

    pub fn parse(input: &str) -> Result<Self, DotError> {
        let graph = DotGraph::parse(input)?;
        Ok(Self::from_dot(&graph))
    }

    pub fn from_dot(graph: &DotGraph) -> Self {
        let mut store = Self::empty();

        for dot_node in graph.nodes() {
            let Ok(id) = dot_node.id.parse::<NodeId>() else {
                warn!(id = %dot_node.id, "skipping code node with non-numeric id");
                continue;
            };
            let mut node = CodeNode::new(id, dot_node.attr("label").unwrap_or_default());
            for (key, value) in &dot_node.attrs {
                if key != "label" {
                    node.attrs.insert(key.clone(), value.clone());
                }
            }
            store.insert_node(node);
        }

        for dot_edge in graph.edges() {
            let (Ok(source), Ok(target)) = (
                dot_edge.source.parse::<NodeId>(),
                dot_edge.target.parse::<NodeId>(),
            ) else {
                continue;
            };
            for (_, value) in &dot_edge.attrs {
                if let Some(kind) = CodeEdgeKind::from_label(value) {
                    store.insert_edge(source, target, kind);
                }
            }
        }

        store
    }

    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            successors: HashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn insert_node(&mut self, node: CodeNode) {
        self.next_id.fetch_max(node.id, Ordering::Relaxed);
        self.nodes.insert(node.id, node);
    }

    pub fn insert_edge(&mut self, source: NodeId, target: NodeId, kind: CodeEdgeKind) {
        let kinds = self.edges.entry((source, target)).or_default();
        if kinds.is_empty() {
            self.successors.entry(source).or_default().push(target);
        }
        kinds.insert(kind);
    }

    pub fn node(&self, id: NodeId) -> Option<&CodeNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// AST children ordered by their `ORDER` attribute.
    pub fn ast_children(&self, id: NodeId) -> Vec<&CodeNode> {
        let mut children = self.targets(id, CodeEdgeKind::AstChild);
        children.sort_by_key(|n| n.order());
        children
    }

    /// Argument children ordered by their `ARGUMENT_INDEX` attribute.
    pub fn arguments(&self, id: NodeId) -> Vec<&CodeNode> {
        let mut arguments = self.targets(id, CodeEdgeKind::Argument);
        arguments.sort_by_key(|n| n.argument_index());
        arguments
    }

    pub fn call_target(&self, id: NodeId) -> Option<&CodeNode> {
        self.targets(id, CodeEdgeKind::Call).into_iter().next()
    }

    /// Allocates an id above every id seen so far.
    pub fn next_id(&self) -> NodeId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn targets(&self, id: NodeId, kind: CodeEdgeKind) -> Vec<&CodeNode> {
        self.successors
            .get(&id)
            .into_iter()
            .flatten()
            .filter(|target| {
                self.edges
                    .get(&(id, **target))
                    .is_some_and(|kinds| kinds.contains(&kind))
            })
            .filter_map(|target| self.nodes.get(target))
            .collect()
    }
}
