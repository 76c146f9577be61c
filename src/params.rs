//! Analysis parameters
//!
//! Collects the variable roles and the causal graph for one run. The role
//! literal is read with a data-only grammar (mappings, lists and quoted
//! strings); nothing in it is ever evaluated.
//!
//! ```text
//! {'treatment': 'X',
//!  'outcome': 'Y',
//!  'common_causes': ['Z1', 'Z2'],
//!  'effect_modifiers': [],
//!  'instruments': []}
//! ```

use std::collections::HashSet;
use std::ops::Range;

use logos::Logos;
use serde::Serialize;

use crate::dataset::Dataset;
use crate::graph::CausalGraph;
use crate::CausalError;

/// Example graph shown to users as a starting point.
pub const DEFAULT_GRAPH: &str = "digraph { X -> Y; Z1 -> Y; Z1 -> X; Z2 -> Y; Z2 -> X; }";

/// Graph used when no graph text is supplied; the roles imply its edges.
pub const EMPTY_GRAPH: &str = "digraph { }";

const KNOWN_KEYS: [&str; 6] = [
    "treatment",
    "outcome",
    "common_causes",
    "effect_modifiers",
    "instruments",
    "dag",
];

/// Validated configuration record for one analysis run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisParams {
    pub treatment: String,
    pub outcome: String,
    pub common_causes: Vec<String>,
    pub effect_modifiers: Vec<String>,
    pub instruments: Vec<String>,
    /// Graph text with newlines flattened to spaces
    pub dag: String,
    #[serde(skip)]
    graph: CausalGraph,
}

impl AnalysisParams {
    /// Create parameters with only a treatment and an outcome.
    ///
    /// The graph is parsed from `dag` as given, so line comments end at their
    /// line break; only the stored copy is flattened.
    pub fn new(
        treatment: impl Into<String>,
        outcome: impl Into<String>,
        dag: &str,
    ) -> Result<Self, CausalError> {
        let graph = CausalGraph::parse_dot(dag)?;
        Ok(Self {
            treatment: treatment.into(),
            outcome: outcome.into(),
            common_causes: Vec::new(),
            effect_modifiers: Vec::new(),
            instruments: Vec::new(),
            dag: flatten_graph_text(dag),
            graph,
        })
    }

    pub fn with_common_causes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.common_causes = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_effect_modifiers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.effect_modifiers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_instruments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instruments = names.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed causal graph
    pub fn graph(&self) -> &CausalGraph {
        &self.graph
    }

    /// Every referenced column: treatment, outcome, common causes, effect
    /// modifiers, instruments, each once.
    pub fn columns(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.treatment)
            .chain(std::iter::once(&self.outcome))
            .chain(self.common_causes.iter())
            .chain(self.effect_modifiers.iter())
            .chain(self.instruments.iter())
            .filter(|name| seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// Check that roles are well formed and disjoint.
    pub fn validate_roles(&self) -> Result<(), CausalError> {
        if self.treatment.is_empty() || self.outcome.is_empty() {
            return Err(CausalError::Config(
                "treatment and outcome must be non-empty".to_string(),
            ));
        }
        if self.treatment == self.outcome {
            return Err(CausalError::Config(format!(
                "'{}' cannot be both treatment and outcome",
                self.treatment
            )));
        }

        let mut owner: Vec<(&str, &str)> = vec![
            (self.treatment.as_str(), "treatment"),
            (self.outcome.as_str(), "outcome"),
        ];
        let lists = [
            ("common_causes", &self.common_causes),
            ("effect_modifiers", &self.effect_modifiers),
            ("instruments", &self.instruments),
        ];
        for (role, names) in lists {
            for name in names {
                if name.is_empty() {
                    return Err(CausalError::Config(format!(
                        "{role} contains an empty column name"
                    )));
                }
                if let Some((_, other)) = owner.iter().find(|(n, _)| *n == name.as_str()) {
                    return Err(CausalError::Config(if *other == role {
                        format!("'{name}' is listed twice in {role}")
                    } else {
                        format!("'{name}' is listed in both {other} and {role}")
                    }));
                }
                owner.push((name.as_str(), role));
            }
        }

        Ok(())
    }

    /// Check every referenced column against the dataset header.
    pub fn validate_against(&self, dataset: &Dataset) -> Result<(), CausalError> {
        let missing: Vec<String> = self
            .columns()
            .into_iter()
            .filter(|name| !dataset.has_column(name))
            .collect();
        if !missing.is_empty() {
            return Err(CausalError::MissingColumns(missing));
        }
        Ok(())
    }
}

/// Replace embedded newlines with spaces
pub fn flatten_graph_text(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}

/// Build [`AnalysisParams`] from the role literal and the graph text.
///
/// When `dag_text` is `None` the literal's own `dag` key is used, and when
/// that is absent too the graph starts empty.
pub fn parse_params(literal: &str, dag_text: Option<&str>) -> Result<AnalysisParams, CausalError> {
    let value = parse_literal(literal)?;
    let Literal::Map(entries) = value else {
        return Err(CausalError::parse(
            "parameters",
            "top-level value must be a mapping",
        ));
    };

    let mut seen = HashSet::new();
    for (key, _) in &entries {
        if !KNOWN_KEYS.contains(&key.as_str()) {
            return Err(CausalError::parse(
                "parameters",
                format!("unknown key '{key}', expected one of {}", KNOWN_KEYS.join(", ")),
            ));
        }
        if !seen.insert(key.as_str()) {
            return Err(CausalError::parse(
                "parameters",
                format!("key '{key}' appears twice"),
            ));
        }
    }

    let lookup = |key: &str| entries.iter().find(|(k, _)| k == key).map(|(_, v)| v);

    let treatment = single_name(lookup("treatment"), "treatment")?;
    let outcome = single_name(lookup("outcome"), "outcome")?;
    let common_causes = name_list(lookup("common_causes"), "common_causes")?;
    let effect_modifiers = name_list(lookup("effect_modifiers"), "effect_modifiers")?;
    let instruments = name_list(lookup("instruments"), "instruments")?;

    let dag = match (dag_text, lookup("dag")) {
        (Some(text), _) => text.to_string(),
        (None, Some(Literal::Str(text))) => text.clone(),
        (None, Some(_)) => {
            return Err(CausalError::parse("parameters", "'dag' must be a string"));
        }
        (None, None) => EMPTY_GRAPH.to_string(),
    };

    Ok(AnalysisParams::new(treatment, outcome, &dag)?
        .with_common_causes(common_causes)
        .with_effect_modifiers(effect_modifiers)
        .with_instruments(instruments))
}

fn single_name(value: Option<&Literal>, key: &str) -> Result<String, CausalError> {
    match value {
        None => Err(CausalError::parse(
            "parameters",
            format!("missing required key '{key}'"),
        )),
        Some(Literal::Str(name)) => Ok(name.clone()),
        Some(Literal::List(items)) if items.len() == 1 => match &items[0] {
            Literal::Str(name) => Ok(name.clone()),
            _ => Err(CausalError::parse(
                "parameters",
                format!("'{key}' must be a string"),
            )),
        },
        Some(_) => Err(CausalError::parse(
            "parameters",
            format!("'{key}' must name exactly one column"),
        )),
    }
}

fn name_list(value: Option<&Literal>, key: &str) -> Result<Vec<String>, CausalError> {
    match value {
        None => Ok(Vec::new()),
        Some(Literal::Str(name)) => Ok(vec![name.clone()]),
        Some(Literal::List(items)) => items
            .iter()
            .map(|item| match item {
                Literal::Str(name) => Ok(name.clone()),
                _ => Err(CausalError::parse(
                    "parameters",
                    format!("'{key}' must be a list of strings"),
                )),
            })
            .collect(),
        Some(Literal::Map(_)) => Err(CausalError::parse(
            "parameters",
            format!("'{key}' must be a string or a list of strings"),
        )),
    }
}

/// Value of the restricted parameter grammar
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    List(Vec<Literal>),
    Map(Vec<(String, Literal)>),
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"#[^\n]*")]
enum LiteralToken {
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[regex(r#"'([^'\\\n]|\\[^\n])*'"#, unquote)]
    #[regex(r#""([^"\\\n]|\\[^\n])*""#, unquote)]
    Str(String),
}

/// Strip the quotes and resolve `\\`, `\'`, `\"`, `\n`, `\t`; any other
/// escape fails the token.
fn unquote(lex: &mut logos::Lexer<LiteralToken>) -> Option<String> {
    let slice = lex.slice();
    let body = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            c @ ('\\' | '\'' | '"') => out.push(c),
            _ => return None,
        }
    }
    Some(out)
}

fn literal_error(text: &str, offset: usize, message: &str) -> CausalError {
    let before = &text[..offset];
    let line = before.matches('\n').count() + 1;
    let col = before.rsplit('\n').next().map_or(0, |l| l.chars().count()) + 1;
    CausalError::parse(
        "parameters",
        format!("{message} at line {line}, column {col}"),
    )
}

fn lex_literal(text: &str) -> Result<Vec<(LiteralToken, Range<usize>)>, CausalError> {
    let mut lexer = LiteralToken::lexer(text);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                return Err(literal_error(
                    text,
                    span.start,
                    &format!("unexpected input {:?}", &text[span.clone()]),
                ));
            }
        }
    }
    Ok(tokens)
}

/// Parse a data-only literal: `{...}` mappings with string keys, `[...]` or
/// `(...)` lists, and single- or double-quoted strings. `#` starts a comment.
pub fn parse_literal(text: &str) -> Result<Literal, CausalError> {
    let mut parser = LiteralParser {
        text,
        tokens: lex_literal(text)?,
        pos: 0,
    };
    let value = parser.parse_value()?;
    if parser.pos < parser.tokens.len() {
        return Err(parser.error("unexpected trailing content"));
    }
    Ok(value)
}

struct LiteralParser<'a> {
    text: &'a str,
    tokens: Vec<(LiteralToken, Range<usize>)>,
    pos: usize,
}

impl LiteralParser<'_> {
    /// Error located at the current token, or at the end of input
    fn error(&self, message: &str) -> CausalError {
        let offset = self
            .tokens
            .get(self.pos)
            .map_or(self.text.len(), |(_, span)| span.start);
        literal_error(self.text, offset, message)
    }

    fn peek(&self) -> Option<&LiteralToken> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn eat(&mut self, expected: &LiteralToken) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Literal, CausalError> {
        let Some(token) = self.peek().cloned() else {
            return Err(self.error("unexpected end of input"));
        };
        match token {
            LiteralToken::LBrace => {
                self.pos += 1;
                self.parse_map()
            }
            LiteralToken::LBracket => {
                self.pos += 1;
                self.parse_list(LiteralToken::RBracket, ']')
            }
            LiteralToken::LParen => {
                self.pos += 1;
                self.parse_list(LiteralToken::RParen, ')')
            }
            LiteralToken::Str(value) => {
                self.pos += 1;
                Ok(Literal::Str(value))
            }
            _ => Err(self.error("expected a string, list or mapping")),
        }
    }

    fn parse_map(&mut self) -> Result<Literal, CausalError> {
        let mut entries = Vec::new();
        loop {
            if self.eat(&LiteralToken::RBrace) {
                return Ok(Literal::Map(entries));
            }

            let key = match self.peek() {
                Some(LiteralToken::Str(key)) => key.clone(),
                _ => return Err(self.error("mapping keys must be quoted strings")),
            };
            self.pos += 1;
            if !self.eat(&LiteralToken::Colon) {
                return Err(self.error("expected ':' after mapping key"));
            }
            let value = self.parse_value()?;
            entries.push((key, value));

            if self.eat(&LiteralToken::Comma) {
                continue;
            }
            if self.eat(&LiteralToken::RBrace) {
                return Ok(Literal::Map(entries));
            }
            return Err(self.error("expected ',' or '}' in mapping"));
        }
    }

    fn parse_list(&mut self, close: LiteralToken, symbol: char) -> Result<Literal, CausalError> {
        let mut items = Vec::new();
        loop {
            if self.eat(&close) {
                return Ok(Literal::List(items));
            }

            items.push(self.parse_value()?);

            if self.eat(&LiteralToken::Comma) {
                continue;
            }
            if self.eat(&close) {
                return Ok(Literal::List(items));
            }
            return Err(self.error(&format!("expected ',' or '{symbol}' in list")));
        }
    }
}
