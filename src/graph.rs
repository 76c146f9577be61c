//! Causal graph
//!
//! A directed acyclic graph over variable names, parsed from the DOT
//! `digraph` language. Provides the ancestry and d-separation queries used by
//! backdoor identification.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

use logos::Logos;
use petgraph::algo::{has_path_connecting, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use petgraph::Direction;

use crate::CausalError;

/// Directed acyclic graph over named variables.
#[derive(Debug, Clone, Default)]
pub struct CausalGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl CausalGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a DOT `digraph` description.
    ///
    /// Attribute lists and `graph`/`node`/`edge` defaults are accepted and
    /// ignored. Undirected graphs, subgraphs and cycles are rejected.
    pub fn parse_dot(text: &str) -> Result<Self, CausalError> {
        let tokens = tokenize(text)?;
        let mut parser = DotParser {
            tokens,
            pos: 0,
            graph: CausalGraph::new(),
        };
        parser.parse_graph()?;
        let graph = parser.graph;

        if let Some(cycle) = graph.find_cycle() {
            return Err(CausalError::parse(
                "graph",
                format!("graph contains a cycle through: {}", cycle.join(", ")),
            ));
        }

        Ok(graph)
    }

    /// Add a node if it is not present yet
    pub fn add_node(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Add an edge, creating missing endpoints.
    ///
    /// Returns `Ok(false)` when the edge already exists. An edge that would
    /// close a cycle is rejected.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<bool, CausalError> {
        let a = self.add_node(from);
        let b = self.add_node(to);

        if self.graph.find_edge(a, b).is_some() {
            return Ok(false);
        }
        if a == b || has_path_connecting(&self.graph, b, a, None) {
            return Err(CausalError::parse(
                "graph",
                format!("edge {from} -> {to} would create a cycle"),
            ));
        }

        self.graph.add_edge(a, b, ());
        Ok(true)
    }

    fn add_edge_unchecked(&mut self, from: &str, to: &str) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        if self.graph.find_edge(a, b).is_none() {
            self.graph.add_edge(a, b, ());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Node names in insertion order
    pub fn nodes(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .map(|idx| self.graph[idx].as_str())
            .collect()
    }

    /// Edges as `(from, to)` pairs in insertion order
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(a, b)| (self.graph[a].as_str(), self.graph[b].as_str()))
            .collect()
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Direct parents, sorted by insertion order
    pub fn parents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct children, sorted by insertion order
    pub fn children(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        found.sort_unstable();
        found.dedup();
        found.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Strict ancestors of a node
    pub fn ancestors(&self, name: &str) -> BTreeSet<String> {
        let Some(&idx) = self.index.get(name) else {
            return BTreeSet::new();
        };
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, idx);
        let mut out = BTreeSet::new();
        while let Some(node) = dfs.next(reversed) {
            if node != idx {
                out.insert(self.graph[node].clone());
            }
        }
        out
    }

    /// Strict descendants of a node
    pub fn descendants(&self, name: &str) -> BTreeSet<String> {
        let Some(&idx) = self.index.get(name) else {
            return BTreeSet::new();
        };
        let mut dfs = Dfs::new(&self.graph, idx);
        let mut out = BTreeSet::new();
        while let Some(node) = dfs.next(&self.graph) {
            if node != idx {
                out.insert(self.graph[node].clone());
            }
        }
        out
    }

    /// Whether a directed path leads from `from` to `to`
    pub fn has_directed_path(&self, from: &str, to: &str) -> bool {
        match (self.index.get(from), self.index.get(to)) {
            (Some(&a), Some(&b)) => a != b && has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Copy of the graph with every edge leaving `name` removed
    pub fn without_outgoing(&self, name: &str) -> CausalGraph {
        let mut copy = self.clone();
        if let Some(&idx) = self.index.get(name) {
            copy.graph.retain_edges(|g, e| {
                g.edge_endpoints(e)
                    .map(|(source, _)| source != idx)
                    .unwrap_or(true)
            });
        }
        copy
    }

    /// d-separation of `xs` and `ys` given `zs`.
    ///
    /// Uses the moralized ancestral graph: `xs` and `ys` are d-separated by
    /// `zs` iff they are disconnected in the moral graph of the ancestors of
    /// `xs ∪ ys ∪ zs` once `zs` is removed. Names absent from the graph are
    /// ignored.
    pub fn d_separated(&self, xs: &[&str], ys: &[&str], zs: &[&str]) -> bool {
        let lookup = |names: &[&str]| -> HashSet<NodeIndex> {
            names
                .iter()
                .filter_map(|n| self.index.get(*n).copied())
                .collect()
        };
        let x = lookup(xs);
        let y = lookup(ys);
        let z = lookup(zs);

        if x.is_empty() || y.is_empty() {
            return true;
        }
        if x.iter().any(|n| y.contains(n)) {
            return false;
        }

        let reversed = Reversed(&self.graph);
        let mut ancestral = HashSet::new();
        for &start in x.iter().chain(y.iter()).chain(z.iter()) {
            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                ancestral.insert(node);
            }
        }

        let mut moral: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
        let mut link = |a: NodeIndex, b: NodeIndex| {
            moral.entry(a).or_default().insert(b);
            moral.entry(b).or_default().insert(a);
        };
        for &node in &ancestral {
            let parents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|p| ancestral.contains(p))
                .collect();
            for (i, &p) in parents.iter().enumerate() {
                link(p, node);
                for &q in &parents[i + 1..] {
                    if p != q {
                        link(p, q);
                    }
                }
            }
        }

        let mut seen: HashSet<NodeIndex> = x.iter().filter(|n| !z.contains(n)).copied().collect();
        let mut queue: VecDeque<NodeIndex> = seen.iter().copied().collect();
        while let Some(node) = queue.pop_front() {
            if y.contains(&node) {
                return false;
            }
            if let Some(next) = moral.get(&node) {
                for &n in next {
                    if !z.contains(&n) && seen.insert(n) {
                        queue.push_back(n);
                    }
                }
            }
        }

        true
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .find(|scc| {
                scc.len() > 1 || self.graph.find_edge(scc[0], scc[0]).is_some()
            })
            .map(|scc| {
                let mut names: Vec<String> = scc.iter().map(|&n| self.graph[n].clone()).collect();
                names.sort();
                names
            })
    }

    /// Render back to a single-line DOT `digraph`
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph {");
        for idx in self.graph.node_indices() {
            let isolated = self.graph.neighbors_undirected(idx).next().is_none();
            if isolated {
                let _ = write!(out, " {};", quote_id(&self.graph[idx]));
            }
        }
        for (a, b) in self.edges() {
            let _ = write!(out, " {} -> {};", quote_id(a), quote_id(b));
        }
        out.push_str(" }");
        out
    }
}

fn quote_id(id: &str) -> String {
    let plain = id
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        id.to_string()
    } else {
        format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"(//|#)[^\n]*")]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
enum Token {
    #[token("->")]
    Arrow,
    #[token("--")]
    UndirectedEdge,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(";")]
    Semi,
    #[token(",")]
    Comma,
    #[token("=")]
    Equals,
    #[regex(r"[\p{L}\p{N}_.]+", |lex| lex.slice().to_string())]
    #[regex(r"-[0-9.]+", |lex| lex.slice().to_string())]
    #[regex(r#""([^"\\]|\\.)*""#, unquote_id)]
    Id(String),
}

fn unquote_id(lex: &mut logos::Lexer<Token>) -> String {
    let slice = lex.slice();
    let body = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(next);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

fn tokenize(text: &str) -> Result<Vec<Token>, CausalError> {
    let mut lexer = Token::lexer(text);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push(token),
            Err(()) => {
                let span = lexer.span();
                return Err(CausalError::parse(
                    "graph",
                    format!("unexpected input {:?} at offset {}", &text[span.clone()], span.start),
                ));
            }
        }
    }
    Ok(tokens)
}

struct DotParser {
    tokens: Vec<Token>,
    pos: usize,
    graph: CausalGraph,
}

impl DotParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), CausalError> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(CausalError::parse(
                "graph",
                format!("expected {expected:?}, found {token:?}"),
            )),
            None => Err(CausalError::parse(
                "graph",
                format!("expected {expected:?}, found end of input"),
            )),
        }
    }

    fn parse_graph(&mut self) -> Result<(), CausalError> {
        if matches!(self.peek(), Some(Token::Id(k)) if k.eq_ignore_ascii_case("strict")) {
            self.pos += 1;
        }

        match self.next() {
            Some(Token::Id(k)) if k.eq_ignore_ascii_case("digraph") => {}
            Some(Token::Id(k)) if k.eq_ignore_ascii_case("graph") => {
                return Err(CausalError::parse(
                    "graph",
                    "undirected graphs are not supported, use digraph",
                ));
            }
            _ => return Err(CausalError::parse("graph", "expected 'digraph'")),
        }

        if matches!(self.peek(), Some(Token::Id(_))) {
            self.pos += 1;
        }
        self.expect(Token::LBrace)?;
        self.parse_statements()?;
        self.expect(Token::RBrace)?;

        if let Some(token) = self.peek() {
            return Err(CausalError::parse(
                "graph",
                format!("unexpected {token:?} after closing brace"),
            ));
        }
        Ok(())
    }

    fn parse_statements(&mut self) -> Result<(), CausalError> {
        loop {
            match self.peek() {
                None | Some(Token::RBrace) => return Ok(()),
                Some(Token::Semi) | Some(Token::Comma) => {
                    self.pos += 1;
                }
                Some(Token::Id(_)) => self.parse_statement()?,
                Some(token) => {
                    return Err(CausalError::parse(
                        "graph",
                        format!("unexpected {token:?} at start of statement"),
                    ));
                }
            }
        }
    }

    fn parse_statement(&mut self) -> Result<(), CausalError> {
        let Some(Token::Id(first)) = self.next() else {
            return Err(CausalError::parse("graph", "expected node id"));
        };

        let keyword = first.to_ascii_lowercase();
        if matches!(keyword.as_str(), "graph" | "node" | "edge")
            && matches!(self.peek(), Some(Token::LBracket))
        {
            return self.skip_attr_lists();
        }
        if keyword == "subgraph" {
            return Err(CausalError::parse("graph", "subgraphs are not supported"));
        }

        if matches!(self.peek(), Some(Token::Equals)) {
            self.pos += 1;
            return match self.next() {
                Some(Token::Id(_)) => Ok(()),
                _ => Err(CausalError::parse("graph", "expected value after '='")),
            };
        }

        let mut chain = vec![first];
        loop {
            match self.peek() {
                Some(Token::Arrow) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Id(id)) => chain.push(id),
                        _ => return Err(CausalError::parse("graph", "expected node id after '->'")),
                    }
                }
                Some(Token::UndirectedEdge) => {
                    return Err(CausalError::parse(
                        "graph",
                        "undirected edge '--' in a digraph",
                    ));
                }
                _ => break,
            }
        }

        if matches!(self.peek(), Some(Token::LBracket)) {
            self.skip_attr_lists()?;
        }

        if chain.len() == 1 {
            self.graph.add_node(&chain[0]);
        } else {
            for pair in chain.windows(2) {
                self.graph.add_edge_unchecked(&pair[0], &pair[1]);
            }
        }
        Ok(())
    }

    fn skip_attr_lists(&mut self) -> Result<(), CausalError> {
        while matches!(self.peek(), Some(Token::LBracket)) {
            self.pos += 1;
            loop {
                match self.next() {
                    Some(Token::RBracket) => break,
                    Some(Token::Id(_)) | Some(Token::Equals) | Some(Token::Comma)
                    | Some(Token::Semi) => {}
                    Some(token) => {
                        return Err(CausalError::parse(
                            "graph",
                            format!("unexpected {token:?} in attribute list"),
                        ));
                    }
                    None => return Err(CausalError::parse("graph", "unterminated attribute list")),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "digraph { X -> Y; Z1 -> Y; Z1 -> X; Z2 -> Y; Z2 -> X; }";

    #[test]
    fn test_parse_example_graph() {
        let graph = CausalGraph::parse_dot(EXAMPLE).unwrap();
        assert_eq!(graph.node_count(), 4);
        assert_eq!(graph.edge_count(), 5);
        assert_eq!(graph.parents("X"), vec!["Z1".to_string(), "Z2".to_string()]);
        assert_eq!(graph.children("X"), vec!["Y".to_string()]);
    }

    #[test]
    fn test_parse_chains_attributes_and_comments() {
        let text = r#"
            strict digraph G {
                // defaults are ignored
                node [shape=box];
                rankdir = LR;
                "age group" -> T -> Y [label="confounds", color=red]
                /* block
                   comment */
                W # isolated node
            }
        "#;
        let graph = CausalGraph::parse_dot(text).unwrap();
        assert!(graph.has_edge("age group", "T"));
        assert!(graph.has_edge("T", "Y"));
        assert!(graph.contains("W"));
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_tokenize_ids_and_skips_comments() {
        let tokens = tokenize("educação -> \"a \\\"b\\\"\" // tail\n[w=-1.5] /* x */").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Id("educação".to_string()),
                Token::Arrow,
                Token::Id("a \"b\"".to_string()),
                Token::LBracket,
                Token::Id("w".to_string()),
                Token::Equals,
                Token::Id("-1.5".to_string()),
                Token::RBracket,
            ]
        );
        assert!(tokenize("A -> B /* open").is_err());
        assert!(tokenize("A -> B ?").is_err());
    }

    #[test]
    fn test_parse_empty_digraph() {
        let graph = CausalGraph::parse_dot("digraph {\n\n}").unwrap();
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn test_rejects_cycle() {
        let err = CausalGraph::parse_dot("digraph { A -> B; B -> C; C -> A; }").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_rejects_undirected_and_garbage() {
        assert!(CausalGraph::parse_dot("graph { A -- B }").is_err());
        assert!(CausalGraph::parse_dot("digraph { A -- B }").is_err());
        assert!(CausalGraph::parse_dot("digraph { A -> }").is_err());
        assert!(CausalGraph::parse_dot("digraph { A -> B").is_err());
        assert!(CausalGraph::parse_dot("X -> Y").is_err());
        assert!(CausalGraph::parse_dot("digraph { A -> B } extra").is_err());
    }

    #[test]
    fn test_add_edge_rejects_cycle() {
        let mut graph = CausalGraph::new();
        assert!(graph.add_edge("A", "B").unwrap());
        assert!(!graph.add_edge("A", "B").unwrap());
        assert!(graph.add_edge("B", "A").is_err());
        assert!(graph.add_edge("A", "A").is_err());
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let graph = CausalGraph::parse_dot("digraph { A -> B -> C; D -> C; }").unwrap();
        let anc: Vec<_> = graph.ancestors("C").into_iter().collect();
        assert_eq!(anc, vec!["A", "B", "D"]);
        let desc: Vec<_> = graph.descendants("A").into_iter().collect();
        assert_eq!(desc, vec!["B", "C"]);
        assert!(graph.has_directed_path("A", "C"));
        assert!(!graph.has_directed_path("C", "A"));
    }

    #[test]
    fn test_d_separation_basic_structures() {
        // chain
        let chain = CausalGraph::parse_dot("digraph { A -> B -> C }").unwrap();
        assert!(!chain.d_separated(&["A"], &["C"], &[]));
        assert!(chain.d_separated(&["A"], &["C"], &["B"]));

        // fork
        let fork = CausalGraph::parse_dot("digraph { B -> A; B -> C }").unwrap();
        assert!(!fork.d_separated(&["A"], &["C"], &[]));
        assert!(fork.d_separated(&["A"], &["C"], &["B"]));

        // collider, and conditioning on a descendant of it
        let collider = CausalGraph::parse_dot("digraph { A -> B; C -> B; B -> D }").unwrap();
        assert!(collider.d_separated(&["A"], &["C"], &[]));
        assert!(!collider.d_separated(&["A"], &["C"], &["B"]));
        assert!(!collider.d_separated(&["A"], &["C"], &["D"]));
    }

    #[test]
    fn test_backdoor_check_on_example() {
        let graph = CausalGraph::parse_dot(EXAMPLE).unwrap();
        let cut = graph.without_outgoing("X");
        assert!(!cut.d_separated(&["X"], &["Y"], &[]));
        assert!(!cut.d_separated(&["X"], &["Y"], &["Z1"]));
        assert!(cut.d_separated(&["X"], &["Y"], &["Z1", "Z2"]));
        // original graph is untouched
        assert!(graph.has_edge("X", "Y"));
        assert!(!cut.has_edge("X", "Y"));
    }

    #[test]
    fn test_to_dot_round_trips_structure() {
        let graph = CausalGraph::parse_dot("digraph { \"my var\" -> Y; W }").unwrap();
        let again = CausalGraph::parse_dot(&graph.to_dot()).unwrap();
        assert!(again.has_edge("my var", "Y"));
        assert!(again.contains("W"));
    }
}
