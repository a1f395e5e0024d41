//! Reader for the DOT graph exports produced by the code-property-graph tool
//!
//! Only the subset needed to ingest exports is supported: node and edge
//! statements with attribute lists, default-attribute statements (ignored),
//! nested subgraphs (flattened) and comments.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at line {line}")]
pub struct DotError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotNode {
    pub id: String,
    pub attrs: Vec<(String, String)>,
}

impl DotNode {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotEdge {
    pub source: String,
    pub target: String,
    pub attrs: Vec<(String, String)>,
}

impl DotEdge {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A parsed multigraph. Nodes keep the order in which they first appear,
/// either in a node statement or as an edge endpoint.
#[derive(Debug, Default)]
pub struct DotGraph {
    nodes: Vec<DotNode>,
    edges: Vec<DotEdge>,
    index: HashMap<String, usize>,
}

impl DotGraph {
    pub fn parse(input: &str) -> Result<Self, DotError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = DotParser {
            tokens,
            pos: 0,
            graph: DotGraph::default(),
        };
        parser.parse_graph()?;
        Ok(parser.graph)
    }

    pub fn nodes(&self) -> &[DotNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[DotEdge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&DotNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn touch_node(&mut self, id: &str) -> usize {
        if let Some(&i) = self.index.get(id) {
            return i;
        }
        let i = self.nodes.len();
        self.nodes.push(DotNode {
            id: id.to_string(),
            attrs: Vec::new(),
        });
        self.index.insert(id.to_string(), i);
        i
    }

    fn merge_node_attrs(&mut self, id: &str, attrs: Vec<(String, String)>) {
        let i = self.touch_node(id);
        let node = &mut self.nodes[i];
        for (key, value) in attrs {
            match node.attrs.iter_mut().find(|(k, _)| *k == key) {
                Some(slot) => slot.1 = value,
                None => node.attrs.push((key, value)),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Id(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Equals,
    Separator,
    EdgeOp,
    Colon,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> DotError {
        DotError {
            line: self.line,
            message: message.into(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, DotError> {
        let mut tokens = Vec::new();
        let mut at_line_start = true;

        while let Some(&c) = self.chars.peek() {
            let line = self.line;
            match c {
                '\n' => {
                    self.bump();
                    at_line_start = true;
                    continue;
                }
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                '#' if at_line_start => self.skip_line(),
                '/' => self.skip_comment()?,
                '{' => {
                    self.bump();
                    tokens.push((Token::LBrace, line));
                }
                '}' => {
                    self.bump();
                    tokens.push((Token::RBrace, line));
                }
                '[' => {
                    self.bump();
                    tokens.push((Token::LBracket, line));
                }
                ']' => {
                    self.bump();
                    tokens.push((Token::RBracket, line));
                }
                '=' => {
                    self.bump();
                    tokens.push((Token::Equals, line));
                }
                ';' | ',' => {
                    self.bump();
                    tokens.push((Token::Separator, line));
                }
                ':' => {
                    self.bump();
                    tokens.push((Token::Colon, line));
                }
                '"' => {
                    let value = self.quoted()?;
                    tokens.push((Token::Id(value), line));
                }
                '<' => {
                    let value = self.html()?;
                    tokens.push((Token::Id(value), line));
                }
                '-' => {
                    self.bump();
                    match self.chars.peek() {
                        Some(&'>') | Some(&'-') => {
                            self.bump();
                            tokens.push((Token::EdgeOp, line));
                        }
                        _ => {
                            let rest = self.bare();
                            tokens.push((Token::Id(format!("-{rest}")), line));
                        }
                    }
                }
                c if is_bare_char(c) => {
                    let value = self.bare();
                    tokens.push((Token::Id(value), line));
                }
                other => return Err(self.error(format!("unexpected character '{other}'"))),
            }
            at_line_start = false;
        }

        Ok(tokens)
    }

    fn skip_line(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_comment(&mut self) -> Result<(), DotError> {
        self.bump();
        match self.chars.peek() {
            Some(&'/') => {
                self.skip_line();
                Ok(())
            }
            Some(&'*') => {
                self.bump();
                let mut previous = '\0';
                while let Some(c) = self.bump() {
                    if previous == '*' && c == '/' {
                        return Ok(());
                    }
                    previous = c;
                }
                Err(self.error("unterminated block comment"))
            }
            _ => Err(self.error("unexpected '/'")),
        }
    }

    fn quoted(&mut self) -> Result<String, DotError> {
        let start = self.line;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some('\n') => {}
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                Some(c) => value.push(c),
                None => break,
            }
        }
        Err(DotError {
            line: start,
            message: "unterminated string".to_string(),
        })
    }

    fn html(&mut self) -> Result<String, DotError> {
        self.bump();
        let mut depth = 1usize;
        let mut value = String::new();
        while let Some(c) = self.bump() {
            match c {
                '<' => depth += 1,
                '>' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(value);
                    }
                }
                _ => {}
            }
            value.push(c);
        }
        Err(self.error("unterminated HTML label"))
    }

    fn bare(&mut self) -> String {
        let mut value = String::new();
        while let Some(&c) = self.chars.peek() {
            if !is_bare_char(c) {
                break;
            }
            value.push(c);
            self.bump();
        }
        value
    }
}

fn is_bare_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.' || !c.is_ascii()
}

struct DotParser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    graph: DotGraph,
}

impl DotParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, l)| *l)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> DotError {
        DotError {
            line: self.line(),
            message: message.into(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        self.pos += 1;
        token
    }

    fn expect_id(&mut self) -> Result<String, DotError> {
        match self.next() {
            Some(Token::Id(id)) => Ok(id),
            other => Err(self.error(format!("expected identifier, found {other:?}"))),
        }
    }

    fn parse_graph(&mut self) -> Result<(), DotError> {
        let mut keyword = self.expect_id()?;
        if keyword.eq_ignore_ascii_case("strict") {
            keyword = self.expect_id()?;
        }
        if !keyword.eq_ignore_ascii_case("digraph") && !keyword.eq_ignore_ascii_case("graph") {
            return Err(self.error(format!("expected 'digraph', found '{keyword}'")));
        }
        if let Some(Token::Id(_)) = self.peek() {
            self.pos += 1;
        }
        match self.next() {
            Some(Token::LBrace) => {}
            _ => return Err(self.error("expected '{'")),
        }
        self.parse_statements()?;
        if self.pos < self.tokens.len() {
            return Err(self.error("unexpected content after graph body"));
        }
        Ok(())
    }

    fn parse_statements(&mut self) -> Result<(), DotError> {
        loop {
            match self.peek() {
                None => return Err(self.error("unexpected end of input, expected '}'")),
                Some(Token::RBrace) => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(Token::Separator) => self.pos += 1,
                Some(Token::LBrace) => {
                    self.pos += 1;
                    self.parse_statements()?;
                }
                Some(Token::Id(_)) => self.parse_statement()?,
                Some(other) => {
                    let message = format!("unexpected token {other:?}");
                    return Err(self.error(message));
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<(), DotError> {
        let first = self.expect_id()?;

        match first.as_str() {
            "node" | "edge" | "graph" if self.peek() == Some(&Token::LBracket) => {
                self.parse_attr_lists()?;
                return Ok(());
            }
            "subgraph" => {
                if let Some(Token::Id(_)) = self.peek() {
                    self.pos += 1;
                }
                if self.peek() == Some(&Token::LBrace) {
                    self.pos += 1;
                    self.parse_statements()?;
                }
                return Ok(());
            }
            _ => {}
        }

        if self.peek() == Some(&Token::Equals) {
            self.pos += 1;
            self.expect_id()?;
            return Ok(());
        }

        self.skip_port();
        let mut chain = vec![first];
        while self.peek() == Some(&Token::EdgeOp) {
            self.pos += 1;
            chain.push(self.expect_id()?);
            self.skip_port();
        }

        let attrs = if self.peek() == Some(&Token::LBracket) {
            self.parse_attr_lists()?
        } else {
            Vec::new()
        };

        if chain.len() == 1 {
            self.graph.merge_node_attrs(&chain[0], attrs);
        } else {
            for pair in chain.windows(2) {
                self.graph.touch_node(&pair[0]);
                self.graph.touch_node(&pair[1]);
                self.graph.edges.push(DotEdge {
                    source: pair[0].clone(),
                    target: pair[1].clone(),
                    attrs: attrs.clone(),
                });
            }
        }
        Ok(())
    }

    fn skip_port(&mut self) {
        while self.peek() == Some(&Token::Colon) {
            self.pos += 1;
            if let Some(Token::Id(_)) = self.peek() {
                self.pos += 1;
            }
        }
    }

    fn parse_attr_lists(&mut self) -> Result<Vec<(String, String)>, DotError> {
        let mut attrs = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            loop {
                match self.next() {
                    Some(Token::RBracket) => break,
                    Some(Token::Separator) => {}
                    Some(Token::Id(key)) => {
                        if self.peek() == Some(&Token::Equals) {
                            self.pos += 1;
                            let value = self.expect_id()?;
                            attrs.push((key, value));
                        } else {
                            attrs.push((key, "true".to_string()));
                        }
                    }
                    other => {
                        return Err(self.error(format!("unexpected {other:?} in attribute list")));
                    }
                }
            }
        }
        Ok(attrs)
    }
}
