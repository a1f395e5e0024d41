//! Classification of assignment destinations

use crate::behavior::BehaviorGraph;
use crate::cpg::{CodeNode, NodeId};
use crate::error::Result;
use crate::knowledge::ModuleClass;
use crate::pdg::{CallKind, Derivation, DependencyGraph, DependencyNode, EdgeKind};
use crate::scope::{Identifier, IdentifierKind};
use crate::syntax::{NewTarget, new_target, require_literal};

use super::{
    BehaviorBuilder, incoming_tags, link_identifier, link_incoming, substitute_returns,
};

impl BehaviorBuilder<'_> {
    /// Declares the assigned identifier and records what its value is: a
    /// module, a function imported from a module, a call result or a copy of
    /// another identifier.
    pub(super) fn assignment(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        former: Option<NodeId>,
    ) -> Result<()> {
        let store = self.store;
        let children = store.ast_children(node.id);
        let (Some(left), Some(right)) = (children.first(), children.get(1)) else {
            link_incoming(unit, graph, former, node.id);
            return Ok(());
        };
        self.update(node.id, |n| n.call_kind = Some(CallKind::Assignment));
        if right.kind == "METHOD_REF" {
            link_incoming(unit, graph, former, node.id);
            return Ok(());
        }

        let mut identifier = Identifier::new(
            left.code().unwrap_or_default(),
            node.line,
            IdentifierKind::Identifier,
            Some(node.id),
            node.file.as_str(),
        );

        match right.kind.as_str() {
            "CALL" => self.assign_call(unit, graph, node, former, right, &mut identifier)?,
            "IDENTIFIER" => {
                let name = right.code().unwrap_or_default();
                link_incoming(unit, graph, former, node.id);
                if let Some(found) = self.lookup(&node.file, name, node.line) {
                    identifier.resolve_from(&found);
                    if let Some(source) = found.node {
                        link_identifier(unit, graph, source, node.id, name);
                    }
                }
            }
            "BLOCK" => {
                link_incoming(unit, graph, former, node.id);
                self.assign_constructed(unit, graph, node, right, &mut identifier)?;
            }
            _ => link_incoming(unit, graph, former, node.id),
        }

        self.declare(identifier);
        Ok(())
    }

    fn assign_call(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        former: Option<NodeId>,
        right: &CodeNode,
        identifier: &mut Identifier,
    ) -> Result<()> {
        let tags = incoming_tags(unit, former, node.id);

        match right.name().unwrap_or_default() {
            "require" => {
                if let Some(module) = require_literal(right.code().unwrap_or_default()) {
                    if self.is_local_file(&node.file, &module) {
                        identifier.local = true;
                    } else {
                        self.classify_into(&module, identifier)?;
                    }
                    identifier.kind = IdentifierKind::Require;
                    identifier.full_name = Some(module.clone());
                    identifier.module = Some(module);
                }
                link_incoming(unit, graph, former, node.id);
                return Ok(());
            }
            "<operator>.addition" => {
                if let Some(former) = former {
                    if EdgeKind::classify(&tags) == EdgeKind::Ddg {
                        match self.node(former) {
                            Some(source) if source.has_resolved_callee() => {
                                substitute_returns(graph, &source, node.id, &tags)
                            }
                            _ => graph.add_edge(former, node.id, &tags),
                        }
                    }
                }
                return Ok(());
            }
            "<operator>.fieldAccess" | "<operator>.indexAccess" => {
                self.assign_field(unit, graph, node, right, identifier)?;
                link_incoming(unit, graph, former, node.id);
                return Ok(());
            }
            _ => {}
        }

        let Some(call) = self.node(right.id) else {
            if let Some(former) = former {
                graph.add_edge(former, node.id, &["DDG"]);
            }
            return Ok(());
        };

        match call.call_kind {
            Some(CallKind::LocalModuleCall) => {
                identifier.kind = IdentifierKind::LocalModuleReturnValue;
                self.link_call_returns(graph, &call, node.id, former, "DDG");
            }
            Some(CallKind::FunctionCall) => {
                identifier.kind = IdentifierKind::FunctionReturnValue;
                let fallback = if call.callee.is_some() { "DDG" } else { "CFG" };
                self.link_call_returns(graph, &call, node.id, former, fallback);
            }
            Some(CallKind::Call) => {
                identifier.kind = IdentifierKind::ReturnObject;
                identifier.full_name = call.full_name.clone();
                identifier.origin = call.derivation;
                if call.sensitive {
                    identifier.created_by = Some(call.categories.clone());
                }
                if let Some(former) = former {
                    graph.add_edge(former, node.id, &["DDG"]);
                }
            }
            _ => {
                if let Some(former) = former {
                    graph.add_edge(former, node.id, &["DDG"]);
                }
            }
        }
        Ok(())
    }

    /// `x = obj.prop` and `x = require('m').prop`.
    fn assign_field(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        right: &CodeNode,
        identifier: &mut Identifier,
    ) -> Result<()> {
        let store = self.store;
        let parts = store.ast_children(right.id);
        let Some(object) = parts.first() else {
            return Ok(());
        };
        let object_code = object.code().unwrap_or_default();
        let property = parts
            .get(1)
            .and_then(|p| p.code())
            .unwrap_or_default()
            .to_string();
        let object_line = object.line().unwrap_or(node.line);

        if let Some(found) = self.lookup(&node.file, object_code, object_line) {
            if let Some(source) = found.node {
                link_identifier(unit, graph, source, node.id, object_code);
            }
            if found.kind == IdentifierKind::Require {
                let module = found.module.clone().unwrap_or_default();
                identifier.kind = IdentifierKind::FunctionFromRequire;
                identifier.full_name = Some(format!("{module}.{property}"));
                identifier.module = Some(module);
                identifier.imported_function = Some(property);
                identifier.local = found.local;
                identifier.builtin = found.builtin;
                identifier.third_party = found.third_party;
            }
            return Ok(());
        }

        if object.name() != Some("require") {
            return Ok(());
        }
        let Some(module) = require_literal(object_code) else {
            return Ok(());
        };
        if property == "default" {
            identifier.kind = IdentifierKind::Require;
            identifier.full_name = Some(module.clone());
        } else {
            identifier.kind = IdentifierKind::FunctionFromRequire;
            identifier.full_name = Some(format!("{module}.{property}"));
            identifier.imported_function = Some(property);
        }
        if self.is_local_file(&node.file, &module) {
            identifier.local = true;
        } else {
            self.classify_into(&module, identifier)?;
        }
        identifier.module = Some(module);
        Ok(())
    }

    /// `x = new X(...)` and `x = new X.Y(...)`.
    fn assign_constructed(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        right: &CodeNode,
        identifier: &mut Identifier,
    ) -> Result<()> {
        let Some(target) = new_target(right.code().unwrap_or_default()) else {
            return Ok(());
        };

        match target {
            NewTarget::Ident(class) => match self.lookup(&node.file, &class, node.line) {
                Some(found) => {
                    match found.kind {
                        IdentifierKind::Require if found.builtin => {
                            identifier.kind = IdentifierKind::Require;
                            identifier.module = found.module.clone();
                            identifier.builtin = true;
                        }
                        IdentifierKind::FunctionFromRequire if found.builtin => {
                            identifier.kind = IdentifierKind::ReturnObject;
                            identifier.full_name = found.full_name.clone();
                            identifier.origin = Some(Derivation::Builtin);
                        }
                        IdentifierKind::Require if found.third_party => {
                            identifier.kind = IdentifierKind::Require;
                            identifier.module = found.module.clone();
                            identifier.third_party = true;
                        }
                        _ => {}
                    }
                    if found.kind != IdentifierKind::FunctionDeclare {
                        if let Some(source) = found.node {
                            link_identifier(unit, graph, source, node.id, &class);
                        }
                    }
                }
                None => {
                    if self.classify(&class)? == ModuleClass::Builtin {
                        identifier.kind = IdentifierKind::Require;
                        identifier.builtin = true;
                        identifier.module = Some(class);
                    }
                }
            },
            NewTarget::Member { object, property } => {
                let (module, derivation) = match self.lookup(&node.file, &object, node.line) {
                    Some(found) => {
                        if let Some(source) = found.node {
                            link_identifier(unit, graph, source, node.id, &object);
                        }
                        if found.kind != IdentifierKind::Require {
                            return Ok(());
                        }
                        let module = found.module.clone().unwrap_or_default();
                        match self.classify(&module)? {
                            ModuleClass::Builtin => (module, Derivation::Builtin),
                            ModuleClass::ThirdParty => (module, Derivation::ThirdParty),
                            ModuleClass::NotIn => return Ok(()),
                        }
                    }
                    None => {
                        if self.classify(&object)? != ModuleClass::Builtin {
                            return Ok(());
                        }
                        (object, Derivation::Builtin)
                    }
                };

                let categories = self.sensitive_call(&module, &property, derivation, None)?;
                identifier.kind = IdentifierKind::ReturnObject;
                identifier.full_name = Some(format!("{module}.{property}"));
                identifier.origin = Some(derivation);
                if self.mark_sensitive(node.id, categories.clone()) {
                    identifier.created_by = Some(categories);
                }
            }
        }
        Ok(())
    }

    /// Sets the builtin/third-party flags of a non-local module, registering
    /// unknown modules as third-party.
    fn classify_into(&mut self, module: &str, identifier: &mut Identifier) -> Result<()> {
        match self.classify(module)? {
            ModuleClass::Builtin => identifier.builtin = true,
            ModuleClass::ThirdParty => identifier.third_party = true,
            ModuleClass::NotIn => {
                identifier.third_party = true;
                self.register(module);
            }
        }
        Ok(())
    }

    /// DDG edges from the callee's return values into `target`, or a single
    /// edge from the predecessor tagged `fallback` when there are none.
    fn link_call_returns(
        &self,
        graph: &mut BehaviorGraph,
        call: &DependencyNode,
        target: NodeId,
        former: Option<NodeId>,
        fallback: &str,
    ) {
        let returns = call
            .callee
            .as_ref()
            .map(|c| c.returns.as_slice())
            .unwrap_or_default();
        if returns.is_empty() {
            if let Some(former) = former {
                graph.add_edge(former, target, &[fallback]);
            }
            return;
        }
        for ret in returns {
            graph.add_edge(*ret, target, &["DDG"]);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::tests::Fixture;
    use crate::category::Category;
    use crate::pdg::Derivation;
    use crate::scope::IdentifierKind;

    const CPG: &str = r#"digraph {
"1" [label = "METHOD" NAME=":program" FULL_NAME="package/index.js::program" FILENAME="package/index.js" ]
"2" [label = "CALL" NAME="<operator>.assignment" CODE="exec = require('child_process').exec" LINE_NUMBER="1" ]
"3" [label = "IDENTIFIER" NAME="exec" CODE="exec" LINE_NUMBER="1" ORDER="1" ]
"4" [label = "CALL" NAME="<operator>.fieldAccess" CODE="require('child_process').exec" LINE_NUMBER="1" ORDER="2" ]
"5" [label = "CALL" NAME="require" CODE="require('child_process')" LINE_NUMBER="1" ORDER="1" ]
"6" [label = "FIELD_IDENTIFIER" CODE="exec" LINE_NUMBER="1" ORDER="2" ]
"7" [label = "CALL" NAME="<operator>.assignment" CODE="s = new vm.Script(code)" LINE_NUMBER="2" ]
"8" [label = "IDENTIFIER" NAME="s" CODE="s" LINE_NUMBER="2" ORDER="1" ]
"9" [label = "BLOCK" CODE="new vm.Script(code)" LINE_NUMBER="2" ORDER="2" ]
"10" [label = "CALL" NAME="<operator>.assignment" CODE="vm = require('vm')" LINE_NUMBER="2" ]
"11" [label = "IDENTIFIER" NAME="vm" CODE="vm" LINE_NUMBER="2" ORDER="1" ]
"12" [label = "CALL" NAME="require" CODE="require('vm')" LINE_NUMBER="2" ORDER="2" ]
"2" -> "3" [ label = "AST" ]
"2" -> "4" [ label = "AST" ]
"4" -> "5" [ label = "AST" ]
"4" -> "6" [ label = "AST" ]
"7" -> "8" [ label = "AST" ]
"7" -> "9" [ label = "AST" ]
"10" -> "11" [ label = "AST" ]
"10" -> "12" [ label = "AST" ]
}"#;

    const PDG: &str = r#"digraph ":program" {
"1" [NODE_TYPE="METHOD" NAME=":program" FILENAME="package/index.js" ]
"2" [NODE_TYPE="CALL" NAME="<operator>.assignment" LINE_NUMBER="1" ]
"10" [NODE_TYPE="CALL" NAME="<operator>.assignment" LINE_NUMBER="2" ]
"7" [NODE_TYPE="CALL" NAME="<operator>.assignment" LINE_NUMBER="2" ]
"1" -> "2" [ label = "CFG" ]
"2" -> "10" [ label = "CFG" ]
"10" -> "7" [ label = "CFG" ]
"10" -> "7" [ label = "DDG: vm" ]
}"#;

    #[test]
    fn require_member_binds_imported_function() {
        let mut fixture = Fixture::new(CPG, &[PDG]);

        fixture.build(1);

        let exec = fixture.lookup("package/index.js", "exec", 5);
        assert_eq!(exec.kind, IdentifierKind::FunctionFromRequire);
        assert_eq!(exec.module.as_deref(), Some("child_process"));
        assert_eq!(exec.imported_function.as_deref(), Some("exec"));
        assert_eq!(exec.full_name.as_deref(), Some("child_process.exec"));
        assert!(exec.builtin);
    }

    #[test]
    fn constructor_of_builtin_member_is_sensitive() {
        let mut fixture = Fixture::new(CPG, &[PDG]);

        let graph = fixture.build(1);

        let script = fixture.lookup("package/index.js", "s", 5);
        assert_eq!(script.kind, IdentifierKind::ReturnObject);
        assert_eq!(script.full_name.as_deref(), Some("vm.Script"));
        assert_eq!(script.origin, Some(Derivation::Builtin));
        assert_eq!(script.created_by, Some(vec![Category::DYNAMIC_PROGRAM]));
        assert!(fixture.node(7).sensitive);
        assert!(graph.tags(10, 7).unwrap().contains(&"DDG: vm".to_string()));
    }
}
