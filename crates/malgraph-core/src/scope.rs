//! Lexical scope stack used for identifier resolution
//!
//! One resolver exists per source file. Frames are arena-allocated and keep a
//! back-reference to their enclosing frame; popping a frame only moves the top
//! pointer, so identifiers declared in a popped frame become unreachable.

use id_arena::{Arena, Id};

use crate::category::Category;
use crate::cpg::NodeId;
use crate::pdg::Derivation;

pub type FrameId = Id<Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Require,
    FunctionFromRequire,
    FunctionDeclare,
    LocalModuleReturnValue,
    FunctionReturnValue,
    ReturnObject,
    Identifier,
}

impl IdentifierKind {
    /// Function bindings never carry data into an argument position.
    pub fn is_function(self) -> bool {
        matches!(
            self,
            IdentifierKind::FunctionDeclare | IdentifierKind::FunctionFromRequire
        )
    }
}

#[derive(Debug, Clone)]
pub struct Identifier {
    pub name: String,
    pub line: usize,
    pub kind: IdentifierKind,
    /// Dependency node that declared the identifier.
    pub node: Option<NodeId>,
    pub file: String,
    /// Module named by the `require` this identifier came from.
    pub module: Option<String>,
    pub local: bool,
    pub builtin: bool,
    pub third_party: bool,
    pub full_name: Option<String>,
    pub imported_function: Option<String>,
    pub original: String,
    /// Derivation of the call whose return value initialized the identifier.
    pub origin: Option<Derivation>,
    /// Categories of the sensitive call that created the identifier.
    pub created_by: Option<Vec<Category>>,
    /// Entrance of the declaring unit, for `FunctionDeclare`.
    pub declaration: Option<NodeId>,
}

impl Identifier {
    pub fn new(
        name: impl Into<String>,
        line: usize,
        kind: IdentifierKind,
        node: Option<NodeId>,
        file: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            original: name.clone(),
            name,
            line,
            kind,
            node,
            file: file.into(),
            module: None,
            local: false,
            builtin: false,
            third_party: false,
            full_name: None,
            imported_function: None,
            origin: None,
            created_by: None,
            declaration: None,
        }
    }

    pub fn function(name: impl Into<String>, file: impl Into<String>, unit: NodeId) -> Self {
        let mut identifier = Self::new(name, 1, IdentifierKind::FunctionDeclare, None, file);
        identifier.declaration = Some(unit);
        identifier
    }

    /// Copies the resolution of `source` into this identifier.
    pub fn resolve_from(&mut self, source: &Identifier) {
        self.original = source.name.clone();
        self.kind = source.kind;
        self.local = source.local;
        self.builtin = source.builtin;
        self.third_party = source.third_party;
        self.module = source.module.clone();
        self.full_name = source.full_name.clone();
        self.imported_function = source.imported_function.clone();
        self.origin = source.origin;
    }
}

#[derive(Debug)]
pub struct Frame {
    pub id: FrameId,
    pub name: String,
    pub enclosing: Option<FrameId>,
    identifiers: Vec<Identifier>,
}

#[derive(Debug)]
pub struct ScopeResolver {
    file: String,
    arena: Arena<Frame>,
    root: FrameId,
    top: FrameId,
}

impl ScopeResolver {
    pub fn new(file: impl Into<String>) -> Self {
        let mut arena = Arena::new();
        let root = Self::alloc(&mut arena, "program", None);
        Self {
            file: file.into(),
            arena,
            root,
            top: root,
        }
    }

    fn alloc(arena: &mut Arena<Frame>, name: &str, enclosing: Option<FrameId>) -> FrameId {
        arena.alloc_with_id(|id| Frame {
            id,
            name: name.to_string(),
            enclosing,
            identifiers: Vec::new(),
        })
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn declare(&mut self, identifier: Identifier) {
        self.arena[self.top].identifiers.push(identifier);
    }

    /// Newest declaration of `name` at or before `before_line`, searching
    /// the top frame first and then each enclosing frame.
    pub fn lookup(&self, name: &str, before_line: usize) -> Option<&Identifier> {
        self.frames().find_map(|frame| {
            frame
                .identifiers
                .iter()
                .rev()
                .find(|i| i.name == name && i.line <= before_line)
        })
    }

    pub fn push(&mut self, name: &str) {
        self.top = Self::alloc(&mut self.arena, name, Some(self.top));
    }

    pub fn pop(&mut self) {
        if self.top != self.root {
            self.top = self.arena[self.top].enclosing.unwrap_or(self.root);
        }
    }

    /// Whether a frame named `name` is currently open.
    pub fn is_on_stack(&self, name: &str) -> bool {
        self.frames().any(|frame| frame.name == name)
    }

    pub fn depth(&self) -> usize {
        self.frames().count()
    }

    pub fn reset(&mut self) {
        self.arena = Arena::new();
        self.root = Self::alloc(&mut self.arena, "program", None);
        self.top = self.root;
    }

    fn frames(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(Some(&self.arena[self.top]), |frame| {
            frame.enclosing.map(|id| &self.arena[id])
        })
    }
}
