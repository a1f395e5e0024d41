//! Malicious behavior patterns
//!
//! A pattern is a small graph over sensitive categories. Its key edge (or key
//! node, for single-category patterns) anchors the search; the remaining
//! edges constrain it further. Patterns load from TOML:
//!
//! ```toml
//! [[pattern]]
//! behavior = "Information Stealing"
//! description = "read local file - send through HTTP request"
//! key = { head = 12, kind = "DDG", tail = 20 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::category::Category;
use crate::pdg::EdgeKind;

#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("Failed to read pattern file '{path}': {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid TOML in pattern file: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Pattern '{pattern}' uses unknown category {id}")]
    UnknownCategory { pattern: String, id: u8 },
    #[error("Pattern '{pattern}' has an edge with an invalid kind '{kind}'")]
    InvalidEdgeKind { pattern: String, kind: String },
    #[error("Pattern '{pattern}' has an edge without both a kind and a tail")]
    IncompleteEdge { pattern: String },
}

/// A single category, or a `head -kind-> tail` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternEdge {
    Single(Category),
    Pair {
        head: Category,
        kind: EdgeKind,
        tail: Category,
    },
}

impl PatternEdge {
    pub fn head(&self) -> Category {
        match self {
            PatternEdge::Single(head) | PatternEdge::Pair { head, .. } => *head,
        }
    }
}

/// A required connection between two pattern categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Triple {
    pub head: Category,
    pub kind: EdgeKind,
    pub tail: Category,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    behavior: String,
    description: String,
    key: PatternEdge,
    categories: Vec<Category>,
    triples: Vec<Triple>,
}

impl Pattern {
    pub fn new(
        behavior: impl Into<String>,
        description: impl Into<String>,
        key: PatternEdge,
        others: Vec<(Category, EdgeKind, Category)>,
    ) -> Self {
        let mut pattern = Self {
            behavior: behavior.into(),
            description: description.into(),
            key,
            categories: Vec::new(),
            triples: Vec::new(),
        };
        match key {
            PatternEdge::Single(head) => pattern.add_category(head),
            PatternEdge::Pair { head, kind, tail } => pattern.add_triple(head, kind, tail),
        }
        for (head, kind, tail) in others {
            pattern.add_triple(head, kind, tail);
        }
        pattern
    }

    fn add_category(&mut self, category: Category) {
        if !self.categories.contains(&category) {
            self.categories.push(category);
        }
    }

    fn add_triple(&mut self, head: Category, kind: EdgeKind, tail: Category) {
        self.add_category(head);
        self.add_category(tail);
        let triple = Triple { head, kind, tail };
        if !self.triples.contains(&triple) {
            self.triples.push(triple);
        }
    }

    /// General behavior label, e.g. `Information Stealing`.
    pub fn behavior(&self) -> &str {
        &self.behavior
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn key(&self) -> PatternEdge {
        self.key
    }

    pub fn head(&self) -> Category {
        self.key.head()
    }

    /// Participating categories in order of first appearance.
    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn triples(&self) -> &[Triple] {
        &self.triples
    }

    pub fn is_single(&self) -> bool {
        self.triples.is_empty()
    }

    /// `true` when every behavior this pattern describes is already
    /// described by `other`: its categories are a subset of `other`'s and
    /// each of its triples is implied by a path in `other`.
    pub fn is_subsumed_by(&self, other: &Pattern) -> bool {
        if !self.categories.iter().all(|c| other.categories.contains(c)) {
            return false;
        }
        self.triples
            .iter()
            .all(|t| other.has_path(t.head, t.tail, t.kind))
    }

    /// Path from `head` to `tail` over this pattern's triples. DDG paths may
    /// only use DDG triples.
    fn has_path(&self, head: Category, tail: Category, kind: EdgeKind) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![head];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for triple in self.triples.iter().filter(|t| t.head == current) {
                if kind == EdgeKind::Ddg && triple.kind != EdgeKind::Ddg {
                    continue;
                }
                if triple.tail == tail {
                    return true;
                }
                stack.push(triple.tail);
            }
        }
        false
    }
}

#[derive(Debug, Deserialize)]
struct PatternFile {
    #[serde(default)]
    pattern: Vec<PatternSpec>,
}

#[derive(Debug, Deserialize)]
struct PatternSpec {
    behavior: String,
    description: String,
    key: EdgeSpec,
    #[serde(default)]
    edges: Vec<EdgeSpec>,
}

#[derive(Debug, Deserialize)]
struct EdgeSpec {
    head: u8,
    kind: Option<String>,
    tail: Option<u8>,
}

impl PatternSpec {
    fn into_pattern(self) -> Result<Pattern, PatternError> {
        let name = self.description.clone();
        let key = match edge_parts(&name, &self.key)? {
            (head, None) => PatternEdge::Single(head),
            (head, Some((kind, tail))) => PatternEdge::Pair { head, kind, tail },
        };
        let mut others = Vec::new();
        for edge in &self.edges {
            match edge_parts(&name, edge)? {
                (head, Some((kind, tail))) => others.push((head, kind, tail)),
                (_, None) => {
                    return Err(PatternError::IncompleteEdge { pattern: name });
                }
            }
        }
        Ok(Pattern::new(self.behavior, self.description, key, others))
    }
}

fn edge_parts(
    pattern: &str,
    edge: &EdgeSpec,
) -> Result<(Category, Option<(EdgeKind, Category)>), PatternError> {
    let category = |id: u8| {
        Category::from_id(id).ok_or_else(|| PatternError::UnknownCategory {
            pattern: pattern.to_string(),
            id,
        })
    };
    let head = category(edge.head)?;
    match (&edge.kind, edge.tail) {
        (None, None) => Ok((head, None)),
        (Some(kind), Some(tail)) => {
            let kind = match kind.as_str() {
                "CFG" => EdgeKind::Cfg,
                "DDG" => EdgeKind::Ddg,
                other => {
                    return Err(PatternError::InvalidEdgeKind {
                        pattern: pattern.to_string(),
                        kind: other.to_string(),
                    });
                }
            };
            Ok((head, Some((kind, category(tail)?))))
        }
        _ => Err(PatternError::IncompleteEdge {
            pattern: pattern.to_string(),
        }),
    }
}

/// Ordered pattern collection. Earlier patterns take precedence: a pattern
/// subsumed by one that already matched is not searched.
#[derive(Debug, Clone, Default)]
pub struct PatternLibrary {
    patterns: Vec<Pattern>,
}

impl PatternLibrary {
    pub fn new(patterns: Vec<Pattern>) -> Self {
        Self { patterns }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_patterns())
    }

    pub fn parse(content: &str) -> Result<Self, PatternError> {
        let file: PatternFile = toml::from_str(content)?;
        let patterns = file
            .pattern
            .into_iter()
            .map(PatternSpec::into_pattern)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(patterns))
    }

    pub fn load(path: &Path) -> Result<Self, PatternError> {
        let content = std::fs::read_to_string(path).map_err(|e| PatternError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content)
    }

    /// Appends `other`'s patterns after this library's.
    pub fn extend(&mut self, other: PatternLibrary) {
        self.patterns.extend(other.patterns);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn default_patterns() -> Vec<Pattern> {
    use Category as C;
    use EdgeKind::{Cfg, Ddg};

    let pair = |head, kind, tail| PatternEdge::Pair { head, kind, tail };
    const STEALING: &str = "Information Stealing";
    const COMMAND: &str = "Malicious Command Execution";
    const CODE: &str = "Malicious Code Execution";
    const FILE: &str = "Malicious File Operation";
    const NETWORK: &str = "Suspicious Network Communication";

    vec![
        Pattern::new(
            STEALING,
            "manipulate path - read local file - send through network communication",
            pair(C::MANIPULATE_PATH, Ddg, C::READ_FILE),
            vec![(C::READ_FILE, Ddg, C::SEND_DATA)],
        ),
        Pattern::new(
            STEALING,
            "read local file - send through network communication",
            pair(C::READ_FILE, Ddg, C::SEND_DATA),
            vec![],
        ),
        Pattern::new(
            STEALING,
            "read local file - send through HTTP request",
            pair(C::READ_FILE, Ddg, C::HTTP_REQUEST),
            vec![],
        ),
        Pattern::new(
            STEALING,
            "search file - send through network",
            pair(C::SEARCH_FILE, Ddg, C::SEND_DATA),
            vec![],
        ),
        Pattern::new(
            STEALING,
            "get system information - send through HTTP request",
            pair(C::SYSTEM_INFO, Ddg, C::HTTP_REQUEST),
            vec![],
        ),
        Pattern::new(
            STEALING,
            "get user information - send through HTTP request",
            pair(C::USER_INFO, Ddg, C::HTTP_REQUEST),
            vec![],
        ),
        Pattern::new(
            CODE,
            "read from file - execute dynamically created program",
            pair(C::READ_FILE, Ddg, C::DYNAMIC_PROGRAM),
            vec![],
        ),
        Pattern::new(
            CODE,
            "receive data - execute dynamically created program",
            pair(C::RECEIVE_DATA, Ddg, C::DYNAMIC_PROGRAM),
            vec![],
        ),
        Pattern::new(
            COMMAND,
            "execute a command - send result through HTTP request",
            pair(C::EXECUTE_COMMAND, Ddg, C::HTTP_REQUEST),
            vec![],
        ),
        Pattern::new(
            COMMAND,
            "execute a command - make HTTP request",
            pair(C::EXECUTE_COMMAND, Cfg, C::HTTP_REQUEST),
            vec![],
        ),
        Pattern::new(
            FILE,
            "make HTTP request - write data to local sensitive path",
            pair(C::HTTP_REQUEST, Ddg, C::WRITE_FILE),
            vec![],
        ),
        Pattern::new(
            FILE,
            "change file mode - write data to file",
            pair(C::CHANGE_PERMISSIONS, Cfg, C::WRITE_FILE),
            vec![],
        ),
        Pattern::new(
            FILE,
            "read file - write data to file",
            pair(C::READ_FILE, Ddg, C::WRITE_FILE),
            vec![],
        ),
        Pattern::new(
            NETWORK,
            "encode data - data rep - send through network communication",
            pair(C::ENCODE, Ddg, C::DATA_REPRESENTATION),
            vec![(C::DATA_REPRESENTATION, Ddg, C::NETWORK_COMMUNICATION)],
        ),
        Pattern::new(
            NETWORK,
            "encode data - send through network communication",
            pair(C::ENCODE, Ddg, C::NETWORK_COMMUNICATION),
            vec![],
        ),
        Pattern::new(
            COMMAND,
            "execute a command",
            PatternEdge::Single(C::EXECUTE_COMMAND),
            vec![],
        ),
        Pattern::new(
            COMMAND,
            "spawn a new process",
            PatternEdge::Single(C::SPAWN_PROCESS),
            vec![],
        ),
        Pattern::new(
            COMMAND,
            "run an executable file",
            PatternEdge::Single(C::RUN_EXECUTABLE),
            vec![],
        ),
        Pattern::new(
            CODE,
            "execute a dynamically created program",
            PatternEdge::Single(C::DYNAMIC_PROGRAM),
            vec![],
        ),
    ]
}
