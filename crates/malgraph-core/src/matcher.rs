//! Pattern matching over a sensitive graph
//!
//! Each pattern is matched by assigning its categories to distinct sensitive
//! nodes and checking every triple for reachability. CFG triples accept any
//! path; DDG triples need a path made only of DDG edges.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::category::Category;
use crate::cpg::NodeId;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::pattern::{Pattern, PatternLibrary};
use crate::pdg::{EdgeKind, NodeArena, UNKNOWN_POSITION};
use crate::refine::Refine;
use crate::report::{Locality, Phase, Report};
use crate::sensitive::SensitiveGraph;

/// One assignment of pattern categories to sensitive nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    nodes: Vec<(Category, NodeId)>,
    /// Non-sensitive nodes on the paths that satisfied the triples.
    elided: Vec<NodeId>,
}

impl Mapping {
    pub fn node(&self, category: Category) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, id)| *id)
    }

    pub fn nodes(&self) -> &[(Category, NodeId)] {
        &self.nodes
    }

    pub fn elided(&self) -> &[NodeId] {
        &self.elided
    }
}

/// Whether `tail` is reachable from `head` under `kind`. On success, returns
/// the elided nodes of every reduced edge on the path found.
pub fn reachable(
    graph: &SensitiveGraph,
    head: NodeId,
    tail: NodeId,
    kind: EdgeKind,
) -> Option<Vec<NodeId>> {
    let follows = |source: NodeId, target: NodeId| {
        kind == EdgeKind::Cfg
            || graph
                .edge(source, target)
                .is_some_and(|e| e.kind == EdgeKind::Ddg)
    };

    let mut visited = HashSet::from([head]);
    let mut stack: Vec<(NodeId, usize)> = vec![(head, 0)];
    while let Some(frame) = stack.last_mut() {
        let (current, index) = *frame;
        let Some(next) = graph.successors(current).get(index).copied() else {
            stack.pop();
            continue;
        };
        frame.1 += 1;
        if !follows(current, next) {
            continue;
        }
        if next == tail {
            let mut witness = Vec::new();
            let hops = stack
                .windows(2)
                .map(|w| (w[0].0, w[1].0))
                .chain(std::iter::once((current, next)));
            for (source, target) in hops {
                if let Some(edge) = graph.edge(source, target) {
                    witness.extend(edge.elided.iter().copied());
                }
            }
            return Some(witness);
        }
        if visited.insert(next) {
            stack.push((next, 0));
        }
    }
    None
}

/// Every injective assignment of `pattern`'s categories that satisfies all
/// of its triples.
pub fn find_matches(
    pattern: &Pattern,
    graph: &SensitiveGraph,
    deadline: &Deadline,
) -> Result<Vec<Mapping>> {
    let categories = pattern.categories();
    let candidates: Vec<Vec<NodeId>> = categories
        .iter()
        .map(|c| graph.nodes_with(*c).collect())
        .collect();
    if candidates.iter().any(Vec::is_empty) {
        return Ok(Vec::new());
    }

    let mut matches = Vec::new();
    let mut assigned: Vec<NodeId> = Vec::with_capacity(categories.len());
    let mut cursor: Vec<usize> = vec![0];

    // Backtracking over candidate indices, one level per category.
    while !cursor.is_empty() {
        let depth = cursor.len() - 1;
        let position = &mut cursor[depth];
        let Some(candidate) = candidates[depth].get(*position).copied() else {
            cursor.pop();
            assigned.pop();
            continue;
        };
        *position += 1;
        if assigned.contains(&candidate) {
            continue;
        }
        deadline.check()?;

        assigned.push(candidate);
        if assigned.len() == categories.len() {
            let mapping: Vec<(Category, NodeId)> =
                categories.iter().copied().zip(assigned.iter().copied()).collect();
            if let Some(elided) = satisfies(pattern, graph, &mapping) {
                matches.push(Mapping {
                    nodes: mapping,
                    elided,
                });
            }
            assigned.pop();
        } else {
            cursor.push(0);
        }
    }
    Ok(matches)
}

fn satisfies(
    pattern: &Pattern,
    graph: &SensitiveGraph,
    mapping: &[(Category, NodeId)],
) -> Option<Vec<NodeId>> {
    let lookup = |category: Category| {
        mapping
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, id)| *id)
    };
    let mut elided = Vec::new();
    for triple in pattern.triples() {
        let head = lookup(triple.head)?;
        let tail = lookup(triple.tail)?;
        for id in reachable(graph, head, tail, triple.kind)? {
            if !elided.contains(&id) {
                elided.push(id);
            }
        }
    }
    Some(elided)
}

/// File and lines of a confirmed match. Single-category patterns report
/// their one node; others also report the elided nodes of their paths.
pub fn locality(pattern: &Pattern, mapping: &Mapping, arena: &NodeArena) -> Locality {
    let mut locality = Locality::new();
    let mut ids: Vec<NodeId> = mapping.nodes().iter().map(|(_, id)| *id).collect();
    if !pattern.is_single() {
        ids.extend(mapping.elided().iter().copied());
    }
    for node in ids.iter().filter_map(|id| arena.get(*id)) {
        if node.line == UNKNOWN_POSITION || node.file.is_empty() {
            continue;
        }
        locality.entry(node.file.clone()).or_default().insert(node.line);
    }
    locality
}

/// Matches the whole library against `graph` and records confirmed matches
/// in `report` under `phase`. Returns the number of findings added.
pub fn match_patterns(
    library: &PatternLibrary,
    graph: &SensitiveGraph,
    arena: &NodeArena,
    refiner: &dyn Refine,
    phase: Phase,
    report: &mut Report,
    deadline: &Deadline,
) -> Result<usize> {
    if graph.is_empty() {
        return Ok(0);
    }
    let mut matched: Vec<&Pattern> = Vec::new();
    let mut added = 0;

    for pattern in library.iter() {
        if graph.nodes_with(pattern.head()).next().is_none() {
            continue;
        }
        if matched.iter().any(|m| pattern.is_subsumed_by(m)) {
            debug!(pattern = pattern.description(), "skipping subsumed pattern");
            continue;
        }
        let mappings = find_matches(pattern, graph, deadline)?;
        if mappings.is_empty() {
            continue;
        }
        matched.push(pattern);

        for mapping in &mappings {
            deadline.check()?;
            if !refiner.keep(pattern, mapping, arena, report)? {
                debug!(pattern = pattern.description(), "match discarded by refinement");
                continue;
            }
            let lines = locality(pattern, mapping, arena);
            info!(
                phase = %phase,
                behavior = pattern.behavior(),
                pattern = pattern.description(),
                "malicious pattern matched"
            );
            if report.add_finding(phase, pattern.behavior(), pattern.description(), lines) {
                added += 1;
            }
            report.set_malicious(true);
        }
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::PatternEdge;
    use crate::pdg::DependencyNode;
    use crate::refine::KeepAll;
    use crate::sensitive::ReducedEdge;
    use proptest::prelude::*;

    fn graph(nodes: &[(NodeId, Category)], edges: &[(NodeId, NodeId, EdgeKind, &[NodeId])]) -> SensitiveGraph {
        let mut graph = SensitiveGraph::new();
        for (id, category) in nodes {
            graph.add_node(*id, *category);
        }
        for (source, target, kind, elided) in edges {
            graph.add_edge(*source, *target, *kind, elided);
        }
        graph
    }

    fn arena(ids: &[NodeId]) -> NodeArena {
        let mut arena = NodeArena::new();
        for id in ids {
            let mut node = DependencyNode::new(*id, 1, "CALL");
            node.line = *id as usize;
            node.file = "package/index.js".into();
            arena.insert(node);
        }
        arena
    }

    fn pair(head: Category, kind: EdgeKind, tail: Category) -> Pattern {
        Pattern::new("B", "d", PatternEdge::Pair { head, kind, tail }, vec![])
    }

    #[test]
    fn cfg_only_path_never_satisfies_ddg() {
        let g = graph(
            &[(1, Category::EXECUTE_COMMAND), (2, Category::HTTP_REQUEST)],
            &[(1, 2, EdgeKind::Cfg, &[])],
        );

        assert!(reachable(&g, 1, 2, EdgeKind::Cfg).is_some());
        assert!(reachable(&g, 1, 2, EdgeKind::Ddg).is_none());
    }

    #[test]
    fn ddg_reachability_needs_every_hop_ddg() {
        let g = graph(
            &[
                (1, Category::READ_FILE),
                (2, Category::ENCODE),
                (3, Category::SEND_DATA),
            ],
            &[
                (1, 2, EdgeKind::Ddg, &[10]),
                (2, 3, EdgeKind::Cfg, &[]),
            ],
        );

        assert!(reachable(&g, 1, 3, EdgeKind::Ddg).is_none());
        assert_eq!(reachable(&g, 1, 2, EdgeKind::Ddg), Some(vec![10]));
    }

    #[test]
    fn witness_collects_elided_ids_along_the_path() {
        let g = graph(
            &[
                (1, Category::READ_FILE),
                (2, Category::ENCODE),
                (3, Category::SEND_DATA),
            ],
            &[
                (1, 2, EdgeKind::Ddg, &[10, 11]),
                (2, 3, EdgeKind::Ddg, &[12]),
            ],
        );

        assert_eq!(reachable(&g, 1, 3, EdgeKind::Ddg), Some(vec![10, 11, 12]));
    }

    #[test]
    fn mapping_is_injective_and_reports_all_matches() {
        let g = graph(
            &[
                (1, Category::READ_FILE),
                (2, Category::READ_FILE),
                (3, Category::SEND_DATA),
            ],
            &[(1, 3, EdgeKind::Ddg, &[]), (2, 3, EdgeKind::Ddg, &[])],
        );
        let pattern = pair(Category::READ_FILE, EdgeKind::Ddg, Category::SEND_DATA);

        let matches = find_matches(&pattern, &g, &Deadline::unlimited()).unwrap();

        let heads: Vec<_> = matches
            .iter()
            .map(|m| m.node(Category::READ_FILE).unwrap())
            .collect();
        assert_eq!(heads, vec![1, 2]);
        assert!(matches.iter().all(|m| m.node(Category::SEND_DATA) == Some(3)));
    }

    #[test]
    fn subsumed_patterns_are_skipped() {
        let g = graph(
            &[
                (1, Category::READ_FILE),
                (2, Category::ENCODE),
                (3, Category::SEND_DATA),
            ],
            &[
                (1, 2, EdgeKind::Ddg, &[]),
                (2, 3, EdgeKind::Ddg, &[]),
                (1, 3, EdgeKind::Ddg, &[]),
            ],
        );
        let wide = Pattern::new(
            "Information Stealing",
            "read - encode - send",
            PatternEdge::Pair {
                head: Category::READ_FILE,
                kind: EdgeKind::Ddg,
                tail: Category::ENCODE,
            },
            vec![(Category::ENCODE, EdgeKind::Ddg, Category::SEND_DATA)],
        );
        let narrow = Pattern::new(
            "Information Stealing",
            "read - send",
            PatternEdge::Pair {
                head: Category::READ_FILE,
                kind: EdgeKind::Ddg,
                tail: Category::SEND_DATA,
            },
            vec![],
        );
        let library = PatternLibrary::new(vec![wide, narrow]);
        let mut report = Report::new();

        let added = match_patterns(
            &library,
            &g,
            &arena(&[1, 2, 3]),
            &KeepAll,
            Phase::Import,
            &mut report,
            &Deadline::unlimited(),
        )
        .unwrap();

        assert_eq!(added, 1);
        let findings = &report.findings(Phase::Import)["Information Stealing"];
        assert_eq!(findings[0].description, "read - encode - send");
        assert!(report.is_malicious());
    }

    #[test]
    fn locality_includes_elided_nodes_for_multi_node_patterns() {
        let pattern = pair(Category::READ_FILE, EdgeKind::Ddg, Category::SEND_DATA);
        let mapping = Mapping {
            nodes: vec![(Category::READ_FILE, 1), (Category::SEND_DATA, 3)],
            elided: vec![2],
        };
        let mut arena = arena(&[1, 2, 3]);
        arena.get_mut(3).unwrap().file = "package/lib.js".into();

        let lines = locality(&pattern, &mapping, &arena);

        assert_eq!(lines["package/index.js"].iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(lines["package/lib.js"].iter().copied().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn unknown_positions_are_left_out() {
        let pattern = Pattern::new("B", "d", PatternEdge::Single(Category::EXECUTE_COMMAND), vec![]);
        let mapping = Mapping {
            nodes: vec![(Category::EXECUTE_COMMAND, 1)],
            elided: vec![],
        };
        let mut arena = arena(&[1]);
        arena.get_mut(1).unwrap().line = UNKNOWN_POSITION;

        assert!(locality(&pattern, &mapping, &arena).is_empty());
    }

    /// Nodes reached from `head` in one or more hops over accepted edges.
    fn closure(g: &SensitiveGraph, head: NodeId, follows: impl Fn(&ReducedEdge) -> bool) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack = vec![head];
        while let Some(node) = stack.pop() {
            for next in g.successors(node) {
                if g.edge(node, *next).is_some_and(|e| follows(e)) && seen.insert(*next) {
                    stack.push(*next);
                }
            }
        }
        seen
    }

    /// Eight nodes with random edges. Each edge elides `100 + 10 * source + target`.
    fn random_graph() -> impl Strategy<Value = SensitiveGraph> {
        prop::collection::vec((1..=8u64, 1..=8u64, any::<bool>()), 0..24).prop_map(|edges| {
            let mut g = SensitiveGraph::new();
            for id in 1..=8 {
                g.add_node(id, Category::READ_FILE);
            }
            for (source, target, data) in edges {
                let kind = if data { EdgeKind::Ddg } else { EdgeKind::Cfg };
                g.add_edge(source, target, kind, &[100 + 10 * source + target]);
            }
            g
        })
    }

    proptest! {
        #[test]
        fn reachability_agrees_with_edge_closure(g in random_graph(), head in 1..=8u64, tail in 1..=8u64) {
            let any_path = closure(&g, head, |_| true);
            let data_path = closure(&g, head, |e| e.kind == EdgeKind::Ddg);

            prop_assert_eq!(reachable(&g, head, tail, EdgeKind::Cfg).is_some(), any_path.contains(&tail));
            prop_assert_eq!(reachable(&g, head, tail, EdgeKind::Ddg).is_some(), data_path.contains(&tail));
        }

        #[test]
        fn data_witness_only_crosses_data_edges(g in random_graph(), head in 1..=8u64, tail in 1..=8u64) {
            if let Some(witness) = reachable(&g, head, tail, EdgeKind::Ddg) {
                for id in witness {
                    let (source, target) = ((id - 100) / 10, (id - 100) % 10);
                    prop_assert_eq!(g.edge(source, target).map(|e| e.kind), Some(EdgeKind::Ddg));
                }
            }
        }
    }
}
