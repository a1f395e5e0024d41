//! Reduction of a behavior graph to its sensitive nodes
//!
//! Every sensitive node is first split into single-category nodes. The
//! reduced graph then links each sensitive node to the sensitive nodes it
//! reaches: through pure data flow (DDG) or through any path (CFG). Each
//! reduced edge remembers the non-sensitive nodes it elides.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::behavior::BehaviorGraph;
use crate::category::Category;
use crate::cpg::{GraphStore, NodeId};
use crate::deadline::Deadline;
use crate::error::Result;
use crate::pdg::{DependencyNode, EdgeKind, NodeArena};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedEdge {
    pub kind: EdgeKind,
    pub elided: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct SensitiveGraph {
    nodes: Vec<NodeId>,
    categories: HashMap<NodeId, Category>,
    edges: HashMap<(NodeId, NodeId), ReducedEdge>,
    successors: HashMap<NodeId, Vec<NodeId>>,
}

impl SensitiveGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: NodeId, category: Category) {
        if self.categories.insert(id, category).is_none() {
            self.nodes.push(id);
        }
    }

    /// Adds or merges an edge. DDG wins over CFG and elided ids accumulate.
    pub fn add_edge(&mut self, source: NodeId, target: NodeId, kind: EdgeKind, elided: &[NodeId]) {
        match self.edges.get_mut(&(source, target)) {
            Some(edge) => {
                edge.kind = edge.kind.max(kind);
                merge_ids(&mut edge.elided, elided);
            }
            None => {
                self.successors.entry(source).or_default().push(target);
                self.edges.insert(
                    (source, target),
                    ReducedEdge {
                        kind,
                        elided: elided.to_vec(),
                    },
                );
            }
        }
    }

    fn merge_path(&mut self, source: NodeId, target: NodeId, elided: &[NodeId]) {
        if let Some(edge) = self.edges.get_mut(&(source, target)) {
            merge_ids(&mut edge.elided, elided);
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.categories.contains_key(&id)
    }

    pub fn category(&self, id: NodeId) -> Option<Category> {
        self.categories.get(&id).copied()
    }

    pub fn nodes_with(&self, category: Category) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .copied()
            .filter(move |n| self.categories.get(n) == Some(&category))
    }

    pub fn successors(&self, id: NodeId) -> &[NodeId] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn edge(&self, source: NodeId, target: NodeId) -> Option<&ReducedEdge> {
        self.edges.get(&(source, target))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn merge_ids(into: &mut Vec<NodeId>, ids: &[NodeId]) {
    for id in ids {
        if !into.contains(id) {
            into.push(*id);
        }
    }
}

/// Splits every sensitive node of `graph` with several categories into a
/// chain of single-category nodes linked by `DDG` edges. The outgoing edges
/// of the original node end up on the last node of the chain.
pub fn split_categories(graph: &mut BehaviorGraph, arena: &mut NodeArena, store: &GraphStore) {
    let candidates: Vec<NodeId> = graph
        .nodes()
        .iter()
        .copied()
        .filter(|id| {
            arena
                .get(*id)
                .is_some_and(|n| n.sensitive && n.categories.len() > 1)
        })
        .collect();

    for id in candidates {
        let Some(node) = arena.get_mut(id) else {
            continue;
        };
        let categories = std::mem::take(&mut node.categories);
        node.categories = categories[..1].to_vec();
        let template = node.clone();

        let mut previous = id;
        for category in &categories[1..] {
            let split = split_node(&template, store.next_id(), *category);
            let split_id = split.id;
            arena.insert(split);
            graph.add_node(split_id);
            graph.move_out_edges(previous, split_id);
            graph.add_edge(previous, split_id, &["DDG"]);
            previous = split_id;
        }
        debug!(node = id, parts = categories.len(), "split sensitive node");
    }
}

fn split_node(template: &DependencyNode, id: NodeId, category: Category) -> DependencyNode {
    let mut node = DependencyNode::new(id, template.unit, template.kind.clone());
    node.line = template.line;
    node.column = template.column;
    node.name = template.name.clone();
    node.code = template.code.clone();
    node.file = template.file.clone();
    node.call_kind = template.call_kind;
    node.full_name = template.full_name.clone();
    node.derivation = template.derivation;
    node.mark_sensitive(vec![category]);
    node
}

/// Splits multi-category nodes, then reduces `graph` to its sensitive nodes.
pub fn extract(
    graph: &mut BehaviorGraph,
    arena: &mut NodeArena,
    store: &GraphStore,
    deadline: &Deadline,
) -> Result<SensitiveGraph> {
    split_categories(graph, arena, store);

    let sensitive: HashMap<NodeId, Category> = graph
        .nodes()
        .iter()
        .filter_map(|id| {
            arena
                .get(*id)
                .filter(|n| n.sensitive)
                .and_then(|n| n.category())
                .map(|c| (*id, c))
        })
        .collect();

    let mut reduced = SensitiveGraph::new();
    for start in graph.nodes() {
        let Some(category) = sensitive.get(start) else {
            continue;
        };
        reduced.add_node(*start, *category);
        data_flow_search(graph, &sensitive, &mut reduced, *start, deadline)?;
        control_flow_search(graph, &sensitive, &mut reduced, *start, deadline)?;
    }
    debug!(
        nodes = reduced.nodes().len(),
        edges = reduced.edge_count(),
        "extracted sensitive graph"
    );
    Ok(reduced)
}

/// Follows DDG edges from `start`. Non-sensitive nodes are released on
/// backtrack so that every data path is explored.
fn data_flow_search(
    graph: &BehaviorGraph,
    sensitive: &HashMap<NodeId, Category>,
    reduced: &mut SensitiveGraph,
    start: NodeId,
    deadline: &Deadline,
) -> Result<()> {
    let mut visited = HashSet::from([start]);
    let mut path: Vec<NodeId> = Vec::new();
    let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];

    while let Some(frame) = stack.last_mut() {
        let (current, index) = *frame;
        let successors = graph.successors(current);
        let Some(next) = successors.get(index).copied() else {
            stack.pop();
            if current != start {
                path.pop();
                visited.remove(&current);
            }
            continue;
        };
        frame.1 += 1;
        if graph.edge_kind(current, next) != Some(EdgeKind::Ddg) {
            continue;
        }
        deadline.check()?;

        if visited.contains(&next) {
            if next != start && sensitive.contains_key(&next) {
                reduced.merge_path(start, next, &path);
            }
            continue;
        }
        visited.insert(next);
        match sensitive.get(&next) {
            Some(category) => {
                reduced.add_node(next, *category);
                reduced.add_edge(start, next, EdgeKind::Ddg, &path);
            }
            None => {
                path.push(next);
                stack.push((next, 0));
            }
        }
    }
    Ok(())
}

/// Follows every edge from `start` and stops at the first sensitive node of
/// each path.
fn control_flow_search(
    graph: &BehaviorGraph,
    sensitive: &HashMap<NodeId, Category>,
    reduced: &mut SensitiveGraph,
    start: NodeId,
    deadline: &Deadline,
) -> Result<()> {
    let mut visited = HashSet::from([start]);
    let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];

    while let Some(frame) = stack.last_mut() {
        let (current, index) = *frame;
        let Some(next) = graph.successors(current).get(index).copied() else {
            stack.pop();
            continue;
        };
        frame.1 += 1;
        if !visited.insert(next) {
            continue;
        }
        deadline.check()?;

        match sensitive.get(&next) {
            Some(category) => {
                if reduced.edge(start, next).is_none() {
                    let path: Vec<NodeId> = stack.iter().skip(1).map(|(n, _)| *n).collect();
                    reduced.add_node(next, *category);
                    reduced.add_edge(start, next, EdgeKind::Cfg, &path);
                }
            }
            None => stack.push((next, 0)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arena_with(nodes: &[(NodeId, &[Category])]) -> NodeArena {
        let mut arena = NodeArena::new();
        for (id, categories) in nodes {
            let mut node = DependencyNode::new(*id, 1, "CALL");
            node.line = *id as usize;
            node.file = "package/index.js".into();
            if !categories.is_empty() {
                node.mark_sensitive(categories.to_vec());
            }
            arena.insert(node);
        }
        arena
    }

    fn graph_with(nodes: &[NodeId], edges: &[(NodeId, NodeId, &str)]) -> BehaviorGraph {
        let mut graph = BehaviorGraph::new(nodes[0]);
        for node in nodes {
            graph.add_node(*node);
        }
        for (source, target, tag) in edges {
            graph.add_edge(*source, *target, &[*tag]);
        }
        graph
    }

    fn store_above(max: NodeId) -> GraphStore {
        let mut store = GraphStore::empty();
        store.insert_node(crate::cpg::CodeNode::new(max, "CALL"));
        store
    }

    #[test]
    fn multi_category_node_becomes_a_chain() {
        let cats = [Category::READ_FILE, Category::SEND_DATA, Category::WRITE_FILE];
        let mut arena = arena_with(&[(1, &[]), (2, &cats), (3, &[])]);
        let mut graph = graph_with(&[1, 2, 3], &[(1, 2, "CFG"), (2, 3, "DDG: x")]);
        let store = store_above(10);

        split_categories(&mut graph, &mut arena, &store);

        assert_eq!(arena.get(2).unwrap().categories, [Category::READ_FILE]);
        assert_eq!(arena.get(11).unwrap().categories, [Category::SEND_DATA]);
        assert_eq!(arena.get(12).unwrap().categories, [Category::WRITE_FILE]);
        assert_eq!(graph.tags(2, 11).unwrap(), ["DDG"]);
        assert_eq!(graph.tags(11, 12).unwrap(), ["DDG"]);
        assert_eq!(graph.tags(12, 3).unwrap(), ["DDG: x"]);
        assert!(graph.tags(2, 3).is_none());
        assert_eq!(arena.get(12).unwrap().line, 2);
    }

    #[test]
    fn data_flow_through_plain_nodes_is_ddg() {
        let mut arena = arena_with(&[
            (1, &[Category::READ_FILE]),
            (2, &[]),
            (3, &[Category::SEND_DATA]),
        ]);
        let mut graph = graph_with(&[1, 2, 3], &[(1, 2, "DDG: a"), (2, 3, "DDG: b")]);

        let reduced =
            extract(&mut graph, &mut arena, &store_above(3), &Deadline::unlimited()).unwrap();

        let edge = reduced.edge(1, 3).unwrap();
        assert_eq!(edge.kind, EdgeKind::Ddg);
        assert_eq!(edge.elided, [2]);
        assert!(!reduced.contains(2));
    }

    #[test]
    fn control_flow_stops_at_first_sensitive_node() {
        let mut arena = arena_with(&[
            (1, &[Category::EXECUTE_COMMAND]),
            (2, &[]),
            (3, &[Category::HTTP_REQUEST]),
            (4, &[Category::WRITE_FILE]),
        ]);
        let mut graph = graph_with(
            &[1, 2, 3, 4],
            &[(1, 2, "CFG"), (2, 3, "CFG"), (3, 4, "CFG")],
        );

        let reduced =
            extract(&mut graph, &mut arena, &store_above(4), &Deadline::unlimited()).unwrap();

        assert_eq!(reduced.edge(1, 3).unwrap().kind, EdgeKind::Cfg);
        assert_eq!(reduced.edge(1, 3).unwrap().elided, [2]);
        assert!(reduced.edge(1, 4).is_none());
        assert_eq!(reduced.edge(3, 4).unwrap().kind, EdgeKind::Cfg);
    }

    #[test]
    fn ddg_wins_when_both_searches_reach_a_node() {
        let mut arena = arena_with(&[(1, &[Category::READ_FILE]), (2, &[Category::SEND_DATA])]);
        let mut graph = graph_with(&[1, 2], &[(1, 2, "CFG")]);
        graph.add_edge(1, 2, &["DDG: data"]);

        let reduced =
            extract(&mut graph, &mut arena, &store_above(2), &Deadline::unlimited()).unwrap();

        assert_eq!(reduced.edge(1, 2).unwrap().kind, EdgeKind::Ddg);
    }

    #[test]
    fn reduced_graph_only_holds_sensitive_nodes() {
        let mut arena = arena_with(&[(1, &[]), (2, &[Category::READ_FILE]), (3, &[])]);
        let mut graph = graph_with(&[1, 2, 3], &[(1, 2, "CFG"), (2, 3, "DDG: x")]);

        let reduced =
            extract(&mut graph, &mut arena, &store_above(3), &Deadline::unlimited()).unwrap();

        assert_eq!(reduced.nodes(), [2]);
        for node in reduced.nodes() {
            assert!(arena.get(*node).unwrap().sensitive);
        }
    }

    proptest! {
        #[test]
        fn k_categories_become_k_nodes_with_k_minus_one_links(
            categories in prop::sample::subsequence(Category::all().collect::<Vec<_>>(), 1..=6)
        ) {
            let mut arena = arena_with(&[(1, &[]), (2, categories.as_slice()), (3, &[])]);
            let mut graph = graph_with(&[1, 2, 3], &[(1, 2, "CFG"), (2, 3, "DDG: x")]);

            split_categories(&mut graph, &mut arena, &store_above(10));

            let chain: Vec<NodeId> =
                std::iter::once(2).chain(11..10 + categories.len() as NodeId).collect();
            prop_assert_eq!(chain.len(), categories.len());
            for (id, category) in chain.iter().zip(&categories) {
                prop_assert_eq!(&arena.get(*id).unwrap().categories, &vec![*category]);
            }
            for link in chain.windows(2) {
                prop_assert_eq!(graph.tags(link[0], link[1]).unwrap(), ["DDG"]);
            }
            prop_assert_eq!(graph.tags(chain[chain.len() - 1], 3).unwrap(), ["DDG: x"]);
            prop_assert_eq!(graph.edge_count(), categories.len() + 1);
        }
    }
}
