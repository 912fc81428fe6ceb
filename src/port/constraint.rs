//! Request-time constraints addressed to schema tree paths
//!
//! Wire form: `path[:operator]=value&...` with percent-encoded, dot-joined
//! path segments. Repeated `(path, operator)` keys merge into one
//! multi-valued constraint. An empty path addresses the root: `:format=csv`
//! negotiates the output format, any other operator binds the declared
//! parameter of that name.

use std::fmt;
use std::str::FromStr;

use crate::error::{PortError, Result};

/// Output format negotiated through `:format=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
    Csv,
    Html,
    Txt,
}

impl FromStr for OutputFormat {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(OutputFormat::Json),
            "yaml" => Ok(OutputFormat::Yaml),
            "csv" => Ok(OutputFormat::Csv),
            "html" => Ok(OutputFormat::Html),
            "txt" => Ok(OutputFormat::Txt),
            _ => Err(PortError::argument(format!("unknown output format `{}`", s))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Json => "json",
            OutputFormat::Yaml => "yaml",
            OutputFormat::Csv => "csv",
            OutputFormat::Html => "html",
            OutputFormat::Txt => "txt",
        };
        f.write_str(name)
    }
}

/// Reserved root-level operator selecting the output format.
pub const FORMAT: &str = "format";

/// Path segment matching every child at its level.
pub const WILDCARD: &str = "*";

/// One directive: `operator` applied at `path` with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub path: Vec<String>,
    pub operator: String,
    pub arguments: Vec<String>,
}

impl Constraint {
    pub fn new(path: &str, operator: &str, arguments: Vec<String>) -> Self {
        Self {
            path: split_path(path),
            operator: operator.to_string(),
            arguments,
        }
    }

    pub fn is_root_level(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.join("."), self.operator)
    }
}

fn split_path(path: &str) -> Vec<String> {
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('.').map(str::to_string).collect()
    }
}

/// An ordered list of constraints.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConstraintSet {
    constraints: Vec<Constraint>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the wire form.
    pub fn parse(query: &str) -> Result<Self> {
        let mut set = Self::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| PortError::argument(format!("`{}` has no value", pair)))?;
            let (path, operator) = match key.split_once(':') {
                Some((path, operator)) => (path, decode(operator)?),
                None => (key, "eq".to_string()),
            };
            let path = parse_path(path)?;
            set.push(Constraint {
                path,
                operator,
                arguments: vec![decode(value)?],
            });
        }
        Ok(set)
    }

    /// Add a constraint, merging it into an existing one with the same key.
    pub fn push(&mut self, constraint: Constraint) {
        match self
            .constraints
            .iter_mut()
            .find(|c| c.path == constraint.path && c.operator == constraint.operator)
        {
            Some(existing) => existing.arguments.extend(constraint.arguments),
            None => self.constraints.push(constraint),
        }
    }

    /// Builder-style `push`.
    pub fn with(mut self, path: &str, operator: &str, arguments: &[&str]) -> Self {
        self.push(Constraint::new(
            path,
            operator,
            arguments.iter().map(|a| a.to_string()).collect(),
        ));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    /// Root-level constraints (empty path).
    pub fn root_level(&self) -> impl Iterator<Item = &Constraint> {
        self.constraints.iter().filter(|c| c.is_root_level())
    }

    /// The negotiated output format, if any.
    pub fn format(&self) -> Result<Option<OutputFormat>> {
        match self.root_level().find(|c| c.operator == FORMAT) {
            None => Ok(None),
            Some(c) => match c.arguments.as_slice() {
                [single] => single.parse().map(Some),
                _ => Err(PortError::argument("`format` takes exactly one value")),
            },
        }
    }

    /// Everything below the root, ready to be partitioned level by level.
    pub fn addressed(&self) -> Addressed<'_> {
        Addressed {
            entries: self
                .constraints
                .iter()
                .filter(|c| !c.is_root_level())
                .map(|c| (c, 0))
                .collect(),
        }
    }
}

/// Constraints reaching one tree level, each with the depth already consumed.
#[derive(Debug, Clone, Default)]
pub struct Addressed<'a> {
    entries: Vec<(&'a Constraint, usize)>,
}

impl<'a> Addressed<'a> {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Constraints whose path ends at this level, in declaration order.
    pub fn own(&self) -> impl Iterator<Item = &'a Constraint> + '_ {
        self.entries
            .iter()
            .filter(|(c, depth)| c.path.len() == *depth)
            .map(|(c, _)| *c)
    }

    /// Bucket the deeper constraints by their next segment. `*` broadcasts to
    /// every child; an unknown segment is an `UnknownAttribute`.
    pub fn partition(&self, children: &[&str]) -> Result<Vec<Addressed<'a>>> {
        let mut buckets: Vec<Addressed<'a>> = vec![Addressed::default(); children.len()];
        for (constraint, depth) in &self.entries {
            let Some(segment) = constraint.path.get(*depth) else {
                continue;
            };
            if segment == WILDCARD {
                for bucket in &mut buckets {
                    bucket.entries.push((constraint, depth + 1));
                }
                continue;
            }
            let index = children
                .iter()
                .position(|name| name == segment)
                .ok_or_else(|| PortError::unknown_attribute(segment.clone()))?;
            buckets[index].entries.push((constraint, depth + 1));
        }
        Ok(buckets)
    }

    /// Fail on any constraint that continues below this level.
    pub fn require_leaf(&self) -> Result<()> {
        match self.entries.iter().find(|(c, depth)| c.path.len() > *depth) {
            Some((c, depth)) => Err(PortError::unknown_attribute(c.path[*depth].clone())),
            None => Ok(()),
        }
    }
}

/// Dot-joined, percent-encoded segments; an empty segment names nothing.
fn parse_path(raw: &str) -> Result<Vec<String>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    raw.split('.')
        .map(|segment| {
            if segment.is_empty() {
                Err(PortError::unknown_attribute(raw))
            } else {
                decode(segment)
            }
        })
        .collect()
}

fn decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| PortError::argument(format!("bad percent-encoding in `{}`: {}", raw, e)))
}
