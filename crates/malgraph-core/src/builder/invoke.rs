//! Resolution of function and method calls by callee shape

use crate::behavior::BehaviorGraph;
use crate::category::{interest_category, module_to_class};
use crate::cpg::NodeId;
use crate::error::Result;
use crate::knowledge::ModuleClass;
use crate::pdg::{CallKind, CalleeLink, Derivation, DependencyGraph, DependencyNode};
use crate::scope::{Identifier, IdentifierKind};
use crate::sources::resolve_relative;
use crate::syntax::{CallShape, identifiers};

use super::{BehaviorBuilder, link_identifier};

impl BehaviorBuilder<'_> {
    pub(super) fn invoke(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
    ) -> Result<()> {
        self.update(node.id, |n| n.call_kind = Some(CallKind::Call));
        let call = node.name();

        match CallShape::classify(node.code()) {
            CallShape::Bare(_) => {
                self.connect_by_param(unit, graph, node, None);
                self.bare_call(graph, node)
            }
            CallShape::Member { object, property }
            | CallShape::PartialMember { object, property } => {
                if property != call || object == "this" {
                    return Ok(());
                }
                self.connect_by_param(unit, graph, node, Some(&object));
                match self.lookup(&node.file, &object, node.line) {
                    Some(found) => {
                        if let Some(source) = found.node {
                            link_identifier(unit, graph, source, node.id, &object);
                        }
                        if found.original == "this" {
                            return Ok(());
                        }
                        self.qualifier_found(graph, node, &found)
                    }
                    None => self.builtin_member(node, &object, call),
                }
            }
            CallShape::RequireMember { module, property } => {
                if property == call {
                    self.builtin_member(node, &module, call)?;
                }
                Ok(())
            }
            CallShape::ChainedCall {
                object,
                inner,
                outer,
            } => {
                if outer != call || object == "this" {
                    return Ok(());
                }
                self.connect_by_param(unit, graph, node, Some(&object));
                let Some(found) = self.lookup(&node.file, &object, node.line) else {
                    return Ok(());
                };
                if let Some(source) = found.node {
                    link_identifier(unit, graph, source, node.id, &object);
                }
                if found.original == "this" || !found.builtin {
                    return Ok(());
                }
                let Some(module) = found.module.as_deref() else {
                    return Ok(());
                };
                let factory = format!("{module}.{inner}");
                let qualifier = module_to_class(&factory).unwrap_or(&factory);
                let categories = self.sensitive_call(qualifier, call, Derivation::Builtin, None)?;
                self.resolve_call(node.id, format!("{factory}.{call}"), Derivation::Builtin);
                self.mark_sensitive(node.id, categories);
                Ok(())
            }
            CallShape::NestedMember {
                object,
                inner,
                outer,
            } => {
                if outer != call {
                    return Ok(());
                }
                self.nested_member(unit, graph, node, &object, &inner)
            }
            CallShape::PartialMemberCall { .. } | CallShape::Subscript | CallShape::Other => {
                Ok(())
            }
        }
    }

    /// `name(...)`: a declared function, an imported function or a module
    /// called directly.
    fn bare_call(&mut self, graph: &mut BehaviorGraph, node: &DependencyNode) -> Result<()> {
        let call = node.name();
        let Some(found) = self.lookup(&node.file, call, node.line) else {
            if self.classify(call)? == ModuleClass::Builtin {
                let categories = self.sensitive_call(call, call, Derivation::Builtin, None)?;
                self.resolve_call(node.id, call.to_string(), Derivation::Builtin);
                self.mark_sensitive(node.id, categories);
            }
            return Ok(());
        };

        match found.kind {
            IdentifierKind::FunctionDeclare => {
                self.update(node.id, |n| n.call_kind = Some(CallKind::FunctionCall));
                let Some(declaration) = found.declaration else {
                    return Ok(());
                };
                let store = self.store;
                if let Some(target) = store.call_target(node.id) {
                    if target.id != declaration {
                        return Ok(());
                    }
                }
                self.function_call(graph, node, call, declaration)
            }
            IdentifierKind::FunctionFromRequire if found.local => {
                let module = found.module.clone().unwrap_or_default();
                let function = found.imported_function.clone().unwrap_or_default();
                self.local_module_call(graph, node, &module, &function)
            }
            IdentifierKind::FunctionFromRequire => {
                let module = found.module.clone().unwrap_or_default();
                let function = found.imported_function.clone().unwrap_or_default();
                let derivation = match self.classify(&module)? {
                    ModuleClass::Builtin => Derivation::Builtin,
                    ModuleClass::ThirdParty => Derivation::ThirdParty,
                    ModuleClass::NotIn => {
                        if !self.register(&module) {
                            return Ok(());
                        }
                        Derivation::ThirdParty
                    }
                };
                let categories = self.sensitive_call(&module, &function, derivation, None)?;
                self.resolve_call(node.id, format!("{module}.{function}"), derivation);
                self.mark_sensitive(node.id, categories);
                Ok(())
            }
            IdentifierKind::Require => {
                let module = found.module.clone().unwrap_or_default();
                let categories = match self.classify(&module)? {
                    ModuleClass::ThirdParty => {
                        self.resolve_call(node.id, module.clone(), Derivation::ThirdParty);
                        self.sensitive_call(&module, &module, Derivation::ThirdParty, None)?
                    }
                    ModuleClass::Builtin => {
                        self.resolve_call(node.id, module.clone(), Derivation::Builtin);
                        self.sensitive_call(&module, call, Derivation::Builtin, None)?
                    }
                    ModuleClass::NotIn => Vec::new(),
                };
                self.mark_sensitive(node.id, categories);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Inlines a function declared in the current file unless it is already
    /// being built.
    fn function_call(
        &mut self,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        name: &str,
        declaration: NodeId,
    ) -> Result<()> {
        let units = self.units;
        let Some(callee) = units.get(declaration) else {
            return Ok(());
        };
        if self.state.scope(&node.file).is_on_stack(name) {
            return Ok(());
        }

        self.state.scope(&node.file).push(name);
        self.state.mark_analyzed(callee.id());
        graph.add_edge(node.id, callee.id(), &["DDG"]);
        let result = self.build(callee.id());
        self.state.scope(&node.file).pop();
        let result = result?;

        graph.join(&result);
        self.attach_callee(node.id, &result);
        Ok(())
    }

    /// Inlines `function` exported by the local module `module`.
    fn local_module_call(
        &mut self,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        module: &str,
        function: &str,
    ) -> Result<()> {
        let mut path = resolve_relative(&node.file, module);
        if !path.ends_with(".js") {
            path.push_str(".js");
        }
        let units = self.units;
        let Some(callee) = units.named(function, &path) else {
            return Ok(());
        };
        if self.state.scope(&path).is_on_stack(function) {
            return Ok(());
        }

        self.state.scope(&path).push(function);
        self.state.mark_analyzed(callee.id());
        graph.add_edge(node.id, callee.id(), &["DDG"]);
        let result = self.build(callee.id());
        self.state.scope(&path).pop();
        let result = result?;

        self.update(node.id, |n| n.call_kind = Some(CallKind::LocalModuleCall));
        graph.join(&result);
        self.attach_callee(node.id, &result);
        Ok(())
    }

    fn attach_callee(&mut self, id: NodeId, callee: &BehaviorGraph) {
        let link = CalleeLink {
            entrance: callee.entrance(),
            returns: callee.returns().to_vec(),
        };
        self.update(id, |n| n.callee = Some(link));
    }

    /// Method call on an identifier that resolved in scope.
    fn qualifier_found(
        &mut self,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        found: &Identifier,
    ) -> Result<()> {
        let call = node.name();
        match found.kind {
            IdentifierKind::Require => {
                let module = found.module.clone().unwrap_or_default();
                if found.local {
                    return self.local_module_call(graph, node, &module, call);
                }
                let derivation = if found.builtin {
                    Derivation::Builtin
                } else if found.third_party {
                    Derivation::ThirdParty
                } else {
                    return Ok(());
                };
                let categories = self.sensitive_call(&module, call, derivation, None)?;
                self.resolve_call(node.id, format!("{module}.{call}"), derivation);
                self.mark_sensitive(node.id, categories);
            }
            IdentifierKind::ReturnObject => {
                let Some(full_name) = found.full_name.as_deref() else {
                    return Ok(());
                };
                match found.origin {
                    Some(Derivation::ThirdParty) => {
                        let hint = interest_category(found.created_by.as_deref().unwrap_or_default());
                        if hint.is_none() {
                            return Ok(());
                        }
                        let categories =
                            self.sensitive_call(full_name, call, Derivation::ThirdParty, hint)?;
                        if !categories.is_empty() {
                            self.resolve_call(
                                node.id,
                                format!("{full_name}.{call}"),
                                Derivation::ThirdParty,
                            );
                        }
                        self.mark_sensitive(node.id, categories);
                    }
                    Some(Derivation::Builtin) => {
                        let qualifier = module_to_class(full_name).unwrap_or(full_name);
                        let categories =
                            self.sensitive_call(qualifier, call, Derivation::Builtin, None)?;
                        self.resolve_call(
                            node.id,
                            format!("{qualifier}.{call}"),
                            Derivation::Builtin,
                        );
                        self.mark_sensitive(node.id, categories);
                    }
                    None => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// `obj.a.b(...)`
    fn nested_member(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        object: &str,
        inner: &str,
    ) -> Result<()> {
        let call = node.name();
        let qualifier = format!("{object}.{inner}");
        if qualifier == "module.exports" {
            return Ok(());
        }
        if let Some(found) = self.lookup(&node.file, &qualifier, node.line) {
            if let Some(source) = found.node {
                link_identifier(unit, graph, source, node.id, &qualifier);
            }
            return self.qualifier_found(graph, node, &found);
        }
        if object == "this" {
            return Ok(());
        }

        self.connect_by_param(unit, graph, node, Some(object));
        let Some(found) = self.lookup(&node.file, object, node.line) else {
            return self.builtin_member(node, &qualifier, call);
        };
        if let Some(source) = found.node {
            link_identifier(unit, graph, source, node.id, object);
        }
        if found.original == "this" {
            return Ok(());
        }

        match found.kind {
            IdentifierKind::Require if !found.local && found.builtin => {
                let module = found.module.clone().unwrap_or_default();
                let qualifier = format!("{module}.{inner}");
                let categories =
                    self.sensitive_call(&qualifier, call, Derivation::Builtin, None)?;
                self.resolve_call(node.id, format!("{qualifier}.{call}"), Derivation::Builtin);
                self.mark_sensitive(node.id, categories);
            }
            IdentifierKind::ReturnObject => {
                let Some(full_name) = found.full_name.as_deref() else {
                    return Ok(());
                };
                match found.origin {
                    Some(Derivation::Builtin) => {
                        let class = module_to_class(full_name).unwrap_or(full_name);
                        let method = format!("{inner}.{call}");
                        let categories =
                            self.sensitive_call(class, &method, Derivation::Builtin, None)?;
                        self.resolve_call(node.id, format!("{class}.{method}"), Derivation::Builtin);
                        self.mark_sensitive(node.id, categories);
                    }
                    Some(Derivation::ThirdParty) => {
                        let hint = interest_category(found.created_by.as_deref().unwrap_or_default());
                        if hint.is_none() {
                            return Ok(());
                        }
                        let qualifier = format!("{full_name}.{inner}");
                        let categories =
                            self.sensitive_call(&qualifier, call, Derivation::ThirdParty, hint)?;
                        if !categories.is_empty() {
                            self.resolve_call(
                                node.id,
                                format!("{qualifier}.{call}"),
                                Derivation::ThirdParty,
                            );
                        }
                        self.mark_sensitive(node.id, categories);
                    }
                    None => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Method of a builtin module or global that is not bound in scope,
    /// such as `process.exit` or `fs.promises.readFile`.
    fn builtin_member(&mut self, node: &DependencyNode, qualifier: &str, call: &str) -> Result<()> {
        let root = qualifier.split('.').next().unwrap_or(qualifier);
        if self.classify(root)? != ModuleClass::Builtin {
            return Ok(());
        }
        let categories = self.sensitive_call(qualifier, call, Derivation::Builtin, None)?;
        self.resolve_call(node.id, format!("{qualifier}.{call}"), Derivation::Builtin);
        self.mark_sensitive(node.id, categories);
        Ok(())
    }

    /// Links the declaring node of every identifier passed as an argument to
    /// the call, skipping the call's own qualifier.
    fn connect_by_param(
        &mut self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        node: &DependencyNode,
        qualifier: Option<&str>,
    ) {
        let store = self.store;
        for argument in store.arguments(node.id) {
            let line = argument.line().unwrap_or(node.line);
            match argument.kind.as_str() {
                "CALL"
                    if matches!(
                        argument.name(),
                        Some("<operator>.fieldAccess" | "<operator>.indexAccess")
                    ) =>
                {
                    let children = store.ast_children(argument.id);
                    let Some(object) = children.first() else {
                        continue;
                    };
                    let name = object.code().unwrap_or_default();
                    let line = object.line().unwrap_or(line);
                    self.link_argument(unit, graph, node.id, name, line);
                }
                "IDENTIFIER" => {
                    for name in identifiers(argument.code().unwrap_or_default()) {
                        if name == "this" || Some(name.as_str()) == qualifier {
                            continue;
                        }
                        self.link_argument(unit, graph, node.id, &name, line);
                    }
                }
                _ => {}
            }
        }
    }

    fn link_argument(
        &self,
        unit: &DependencyGraph,
        graph: &mut BehaviorGraph,
        call: NodeId,
        name: &str,
        line: usize,
    ) {
        let Some(found) = self.lookup(unit.file(), name, line) else {
            return;
        };
        if found.kind.is_function() {
            return;
        }
        if let Some(source) = found.node {
            link_identifier(unit, graph, source, call, name);
        }
    }
}
