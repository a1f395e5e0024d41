//! Source-level queries over JavaScript code
//!
//! Dependency nodes only carry the text of the expression they stand for. The
//! builder asks small questions about that text (which module a `require`
//! names, what shape a call has), and refinement needs the arguments of the
//! call found at a given position in a whole source file.

use std::sync::LazyLock;

use regex::Regex;
use swc_common::sync::Lrc;
use swc_common::{BytePos, FileName, SourceMap, Span, Spanned};
use swc_ecma_ast::{
    CallExpr, Callee, EsVersion, Expr, ExprOrSpread, Lit, MemberProp, Module, ModuleItem, NewExpr,
    Stmt,
};
use swc_ecma_parser::{EsSyntax, Syntax, parse_file_as_module};
use swc_ecma_visit::{Visit, VisitWith};

static PARTIAL_MEMBER_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_$][\w$]*\s*\([^()]*\))\s*\.\s*([A-Za-z_$][\w$]*)")
        .expect("Invalid regex pattern")
});

static PARTIAL_MEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_$][\w$]*)\s*\.\s*([A-Za-z_$][\w$]*)").expect("Invalid regex pattern")
});

/// A parsed piece of JavaScript with byte/line bookkeeping.
pub struct SourceText {
    source: String,
    module: Option<Module>,
    has_errors: bool,
    base: u32,
    line_starts: Vec<usize>,
}

impl std::fmt::Debug for SourceText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceText")
            .field("len", &self.source.len())
            .field("has_module", &self.module.is_some())
            .field("has_errors", &self.has_errors)
            .finish()
    }
}

impl SourceText {
    pub fn parse(source: &str) -> Self {
        let source_map: Lrc<SourceMap> = Default::default();
        let fm = source_map
            .new_source_file(FileName::Custom("input.js".into()).into(), source.to_string());

        let mut recovered_errors = Vec::new();
        let result = parse_file_as_module(
            &fm,
            Syntax::Es(EsSyntax::default()),
            EsVersion::latest(),
            None,
            &mut recovered_errors,
        );

        let (module, has_errors) = match result {
            Ok(module) => (Some(module), !recovered_errors.is_empty()),
            Err(_) => (None, true),
        };

        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(i, _)| i + 1),
        );

        Self {
            source: source.to_string(),
            module,
            has_errors,
            base: fm.start_pos.0,
            line_starts,
        }
    }

    pub fn module(&self) -> Option<&Module> {
        self.module.as_ref()
    }

    pub fn has_errors(&self) -> bool {
        self.has_errors
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn slice(&self, span: Span) -> &str {
        let lo = span.lo.0.saturating_sub(self.base) as usize;
        let hi = span.hi.0.saturating_sub(self.base) as usize;
        self.source.get(lo..hi).unwrap_or_default()
    }

    /// Absolute position of a 1-based line and 0-based character column.
    fn byte_pos(&self, line: usize, column: usize) -> Option<BytePos> {
        let start = *self.line_starts.get(line.checked_sub(1)?)?;
        let rest = self.source.get(start..)?;
        let offset = rest
            .char_indices()
            .take_while(|(_, c)| *c != '\n')
            .map(|(i, _)| i)
            .chain(std::iter::once(
                rest.find('\n').unwrap_or(rest.len()),
            ))
            .nth(column)?;
        Some(BytePos(self.base + (start + offset) as u32))
    }

    /// 1-based line and 0-based character column of an absolute position.
    fn line_column(&self, pos: BytePos) -> (usize, usize) {
        let offset = pos.0.saturating_sub(self.base) as usize;
        let index = self.line_starts.partition_point(|s| *s <= offset) - 1;
        let start = self.line_starts[index];
        let column = self
            .source
            .get(start..offset)
            .map_or(0, |s| s.chars().count());
        (index + 1, column)
    }

    /// Arguments of the outermost call or `new` expression that starts at the
    /// given position. `None` when no such expression exists.
    pub fn call_arguments_at(&self, line: usize, column: usize) -> Option<Vec<Argument>> {
        let module = self.module.as_ref()?;
        let target = self.byte_pos(line, column)?;
        let mut finder = ExpressionAt {
            text: self,
            target,
            found: None,
        };
        module.visit_with(&mut finder);
        finder.found
    }

    /// Start of the innermost list statement enclosing the position, where
    /// extra statements can be inserted.
    pub fn statement_start(&self, line: usize, column: usize) -> Option<(usize, usize)> {
        let module = self.module.as_ref()?;
        let target = self.byte_pos(line, column)?;
        let mut finder = StatementAt {
            target,
            found: None,
        };
        module.visit_with(&mut finder);
        finder.found.map(|span| self.line_column(span.lo))
    }
}

/// One argument of a call located in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    Literal(String),
    /// Source text of an expression whose value is only known at run time.
    Dynamic(String),
}

struct ExpressionAt<'a> {
    text: &'a SourceText,
    target: BytePos,
    found: Option<Vec<Argument>>,
}

impl ExpressionAt<'_> {
    fn arguments(&self, args: &[ExprOrSpread]) -> Vec<Argument> {
        args.iter()
            .filter_map(|arg| match arg.expr.as_ref() {
                _ if arg.spread.is_some() => {
                    Some(Argument::Dynamic(self.text.slice(arg.expr.span()).to_string()))
                }
                Expr::Lit(Lit::Str(s)) => Some(Argument::Literal(s.value.to_string())),
                Expr::Tpl(tpl) if tpl.exprs.is_empty() => Some(Argument::Literal(
                    tpl.quasis.iter().map(|q| q.raw.to_string()).collect(),
                )),
                Expr::Arrow(_) | Expr::Fn(_) => None,
                other => Some(Argument::Dynamic(self.text.slice(other.span()).to_string())),
            })
            .collect()
    }
}

impl Visit for ExpressionAt<'_> {
    fn visit_expr(&mut self, node: &Expr) {
        if self.found.is_some() {
            return;
        }
        match node {
            Expr::Call(call) if call.span.lo == self.target => {
                self.found = Some(self.arguments(&call.args));
            }
            Expr::New(new) if new.span.lo == self.target => {
                self.found = Some(
                    new.args
                        .as_deref()
                        .map(|args| self.arguments(args))
                        .unwrap_or_default(),
                );
            }
            _ => node.visit_children_with(self),
        }
    }
}

struct StatementAt {
    target: BytePos,
    found: Option<Span>,
}

impl StatementAt {
    fn contains(&self, span: Span) -> bool {
        span.lo <= self.target && self.target < span.hi
    }
}

impl Visit for StatementAt {
    fn visit_module_items(&mut self, nodes: &[ModuleItem]) {
        if let Some(item) = nodes.iter().find(|item| self.contains(item.span())) {
            self.found = Some(item.span());
            item.visit_with(self);
        }
    }

    fn visit_stmts(&mut self, nodes: &[Stmt]) {
        if let Some(stmt) = nodes.iter().find(|stmt| self.contains(stmt.span())) {
            self.found = Some(stmt.span());
            stmt.visit_with(self);
        }
    }
}

/// First non-empty string literal passed to any call in `code`, e.g. the
/// module named by `require('fs')`.
pub fn require_literal(code: &str) -> Option<String> {
    let text = SourceText::parse(code);
    let mut finder = RequireLiteral { found: None };
    text.module()?.visit_with(&mut finder);
    finder.found
}

struct RequireLiteral {
    found: Option<String>,
}

impl Visit for RequireLiteral {
    fn visit_call_expr(&mut self, node: &CallExpr) {
        if self.found.is_some() {
            return;
        }
        for arg in &node.args {
            if let Expr::Lit(Lit::Str(s)) = arg.expr.as_ref() {
                let value = s.value.to_string();
                if !value.is_empty() {
                    self.found = Some(value);
                    return;
                }
            }
        }
        node.visit_children_with(self);
    }
}

/// Constructor named by a `new` expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewTarget {
    Ident(String),
    Member { object: String, property: String },
}

/// Constructor of the first `new X(...)` in `code`, falling back to the first
/// `new X.Y(...)`.
pub fn new_target(code: &str) -> Option<NewTarget> {
    let text = SourceText::parse(code);
    let mut collector = NewTargets::default();
    text.module()?.visit_with(&mut collector);
    let idents = collector
        .targets
        .iter()
        .find(|t| matches!(t, NewTarget::Ident(_)));
    idents.or(collector.targets.first()).cloned()
}

#[derive(Default)]
struct NewTargets {
    targets: Vec<NewTarget>,
}

impl Visit for NewTargets {
    fn visit_new_expr(&mut self, node: &NewExpr) {
        match node.callee.as_ref() {
            Expr::Ident(ident) => self.targets.push(NewTarget::Ident(ident.sym.to_string())),
            Expr::Member(member) => {
                if let (Expr::Ident(object), MemberProp::Ident(property)) =
                    (member.obj.as_ref(), &member.prop)
                {
                    self.targets.push(NewTarget::Member {
                        object: object.sym.to_string(),
                        property: property.sym.to_string(),
                    });
                }
            }
            _ => {}
        }
        node.visit_children_with(self);
    }
}

/// Every identifier referenced in `code`, in source order.
pub fn identifiers(code: &str) -> Vec<String> {
    let text = SourceText::parse(code);
    let mut collector = Identifiers::default();
    if let Some(module) = text.module() {
        module.visit_with(&mut collector);
    }
    collector.names
}

#[derive(Default)]
struct Identifiers {
    names: Vec<String>,
}

impl Visit for Identifiers {
    fn visit_ident(&mut self, node: &swc_ecma_ast::Ident) {
        self.names.push(node.sym.to_string());
    }
}

/// Syntactic shape of a call expression's callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallShape {
    /// `obj[key](...)`
    Subscript,
    /// `name(...)`
    Bare(String),
    /// `f(...).prop` in a fragment that does not parse.
    PartialMemberCall { call: String, property: String },
    /// `obj.prop` in a fragment that does not parse.
    PartialMember { object: String, property: String },
    /// `require('module').prop(...)`
    RequireMember { module: String, property: String },
    /// `obj.prop(...)`
    Member { object: String, property: String },
    /// `obj.a(...).b(...)`
    ChainedCall {
        object: String,
        inner: String,
        outer: String,
    },
    /// `obj.a.b(...)`
    NestedMember {
        object: String,
        inner: String,
        outer: String,
    },
    Other,
}

impl CallShape {
    pub fn classify(code: &str) -> Self {
        let text = SourceText::parse(code);
        match text.module() {
            Some(module) if !text.has_errors() => Self::from_module(module),
            _ => Self::partial(code),
        }
    }

    fn from_module(module: &Module) -> Self {
        let Some(ModuleItem::Stmt(Stmt::Expr(stmt))) = module.body.first() else {
            return CallShape::Other;
        };
        let Expr::Call(call) = stmt.expr.as_ref() else {
            return CallShape::Other;
        };
        let Callee::Expr(callee) = &call.callee else {
            return CallShape::Other;
        };

        match callee.as_ref() {
            Expr::Ident(ident) => CallShape::Bare(ident.sym.to_string()),
            Expr::Member(member) => {
                let property = match &member.prop {
                    MemberProp::Ident(prop) => prop.sym.to_string(),
                    MemberProp::Computed(_) => return CallShape::Subscript,
                    MemberProp::PrivateName(_) => return CallShape::Other,
                };
                match member.obj.as_ref() {
                    Expr::Ident(object) => CallShape::Member {
                        object: object.sym.to_string(),
                        property,
                    },
                    Expr::Call(inner) => Self::from_inner_call(inner, property),
                    Expr::Member(inner) => match (inner.obj.as_ref(), &inner.prop) {
                        (Expr::Ident(object), MemberProp::Ident(prop)) => CallShape::NestedMember {
                            object: object.sym.to_string(),
                            inner: prop.sym.to_string(),
                            outer: property,
                        },
                        _ => CallShape::Other,
                    },
                    _ => CallShape::Other,
                }
            }
            _ => CallShape::Other,
        }
    }

    fn from_inner_call(inner: &CallExpr, property: String) -> Self {
        let Callee::Expr(callee) = &inner.callee else {
            return CallShape::Other;
        };
        match callee.as_ref() {
            Expr::Ident(ident) if ident.sym.as_ref() == "require" => {
                match inner.args.first().map(|arg| arg.expr.as_ref()) {
                    Some(Expr::Lit(Lit::Str(s))) => CallShape::RequireMember {
                        module: s.value.to_string(),
                        property,
                    },
                    _ => CallShape::Other,
                }
            }
            Expr::Member(member) => match (member.obj.as_ref(), &member.prop) {
                (Expr::Ident(object), MemberProp::Ident(prop)) => CallShape::ChainedCall {
                    object: object.sym.to_string(),
                    inner: prop.sym.to_string(),
                    outer: property,
                },
                _ => CallShape::Other,
            },
            _ => CallShape::Other,
        }
    }

    fn partial(code: &str) -> Self {
        if let Some(caps) = PARTIAL_MEMBER_CALL.captures(code) {
            return CallShape::PartialMemberCall {
                call: caps[1].to_string(),
                property: caps[2].to_string(),
            };
        }
        if let Some(caps) = PARTIAL_MEMBER.captures(code) {
            return CallShape::PartialMember {
                object: caps[1].to_string(),
                property: caps[2].to_string(),
            };
        }
        CallShape::Other
    }
}
