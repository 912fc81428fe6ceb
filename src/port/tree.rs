//! The schema tree: an immutable projection of entities, columns, links and
//! calculations over the catalog
//!
//! Trees are never mutated. Growing one (see [`super::grow`]) copies the
//! nodes on the path from the root to the grown node and shares every other
//! subtree through `Arc`.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::bind::Bound;
use super::value::Domain;
use crate::db::IdentityMeta;
use crate::error::{PortError, Result};

/// Named children in declaration order.
pub type Children = Vec<(String, Arc<Node>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Root,
    Trunk,
    Branch,
    Facet,
    Column,
    Link,
    Expression,
}

impl NodeKind {
    pub fn is_entity(self) -> bool {
        matches!(self, NodeKind::Trunk | NodeKind::Branch | NodeKind::Facet)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Root => "root",
            NodeKind::Trunk => "trunk",
            NodeKind::Branch => "branch",
            NodeKind::Facet => "facet",
            NodeKind::Column => "column",
            NodeKind::Link => "link",
            NodeKind::Expression => "expression",
        };
        f.write_str(name)
    }
}

/// A named, parameterized boolean template declared on an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub name: String,
    pub formals: Vec<String>,
    pub body: Bound,
}

/// A node backed by a table: a trunk, branch or facet.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityNode {
    pub table: String,
    pub identity: IdentityMeta,
    /// Column of `table` referencing the enclosing entity's identity; `None` for trunks
    pub relation: Option<String>,
    pub plural: bool,
    pub mask: Option<Bound>,
    pub filters: Vec<Filter>,
    pub children: Children,
}

impl EntityNode {
    pub fn filter(&self, name: &str) -> Option<&Filter> {
        self.filters.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnNode {
    pub column: String,
    pub domain: Domain,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkNode {
    pub column: String,
    pub target: String,
    /// Identity domain of the target entity
    pub domain: Domain,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionNode {
    pub source: String,
    pub expr: Bound,
}

/// A schema tree node. Entity kinds share [`EntityNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Root { children: Children },
    Trunk(EntityNode),
    Branch(EntityNode),
    Facet(EntityNode),
    Column(ColumnNode),
    Link(LinkNode),
    Expression(ExpressionNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Root { .. } => NodeKind::Root,
            Node::Trunk(_) => NodeKind::Trunk,
            Node::Branch(_) => NodeKind::Branch,
            Node::Facet(_) => NodeKind::Facet,
            Node::Column(_) => NodeKind::Column,
            Node::Link(_) => NodeKind::Link,
            Node::Expression(_) => NodeKind::Expression,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityNode> {
        match self {
            Node::Trunk(e) | Node::Branch(e) | Node::Facet(e) => Some(e),
            _ => None,
        }
    }

    fn as_entity_mut(&mut self) -> Option<&mut EntityNode> {
        match self {
            Node::Trunk(e) | Node::Branch(e) | Node::Facet(e) => Some(e),
            _ => None,
        }
    }

    pub fn children(&self) -> &[(String, Arc<Node>)] {
        match self {
            Node::Root { children } => children,
            Node::Trunk(e) | Node::Branch(e) | Node::Facet(e) => &e.children,
            _ => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Children> {
        match self {
            Node::Root { children } => Some(children),
            other => other.as_entity_mut().map(|e| &mut e.children),
        }
    }

    pub fn child(&self, name: &str) -> Option<&Arc<Node>> {
        self.children()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }

    pub fn child_names(&self) -> Vec<&str> {
        self.children().iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn is_plural(&self) -> bool {
        self.as_entity().is_some_and(|e| e.plural)
    }

    /// Scalar domain of a column, link or expression.
    pub fn domain(&self) -> Option<&Domain> {
        match self {
            Node::Column(c) => Some(&c.domain),
            Node::Link(l) => Some(&l.domain),
            Node::Expression(e) => Some(e.expr.domain()),
            _ => None,
        }
    }
}

/// A root-level reference value usable as `$name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub default: Option<String>,
}

/// An immutable schema tree plus its declared parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaTree {
    root: Arc<Node>,
    parameters: Vec<Parameter>,
}

impl Default for SchemaTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaTree {
    /// A tree with an empty root.
    pub fn new() -> Self {
        Self {
            root: Arc::new(Node::Root {
                children: Vec::new(),
            }),
            parameters: Vec::new(),
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Resolve a node path; `PathError` names the first missing segment.
    pub fn node(&self, path: &[String]) -> Result<&Arc<Node>> {
        let mut node = &self.root;
        for segment in path {
            node = node
                .child(segment)
                .ok_or_else(|| PortError::path_error(segment.clone()))?;
        }
        Ok(node)
    }

    /// Resolve a path that must end at the root or an entity.
    pub fn container(&self, path: &[String]) -> Result<&Arc<Node>> {
        let node = self.node(path)?;
        match node.kind() {
            NodeKind::Root | NodeKind::Trunk | NodeKind::Branch | NodeKind::Facet => Ok(node),
            other => Err(PortError::type_mismatch("entity", other)),
        }
    }

    /// Paths of every entity node, in pre-order.
    pub fn entity_paths(&self) -> Vec<Vec<String>> {
        fn walk(node: &Node, path: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
            for (name, child) in node.children() {
                if child.as_entity().is_some() {
                    path.push(name.clone());
                    out.push(path.clone());
                    walk(child, path, out);
                    path.pop();
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.root, &mut Vec::new(), &mut out);
        out
    }

    /// A new tree with `child` appended under the container at `path`.
    pub(crate) fn with_child(&self, path: &[String], name: &str, child: Node) -> Result<Self> {
        let root = attach(&self.root, path, name, Arc::new(child))?;
        Ok(Self {
            root: Arc::new(root),
            parameters: self.parameters.clone(),
        })
    }

    pub(crate) fn with_parameter(&self, parameter: Parameter) -> Result<Self> {
        if self.parameter(&parameter.name).is_some() {
            return Err(PortError::duplicate_attribute(format!("${}", parameter.name)));
        }
        let mut parameters = self.parameters.clone();
        parameters.push(parameter);
        Ok(Self {
            root: self.root.clone(),
            parameters,
        })
    }
}

fn attach(node: &Node, path: &[String], name: &str, child: Arc<Node>) -> Result<Node> {
    let mut copy = node.clone();
    match path.split_first() {
        None => {
            if copy.child(name).is_some() || name == "id" {
                return Err(PortError::duplicate_attribute(name));
            }
            let children = copy
                .children_mut()
                .ok_or_else(|| PortError::type_mismatch("entity", node.kind()))?;
            children.push((name.to_string(), child));
        }
        Some((head, rest)) => {
            let children = copy
                .children_mut()
                .ok_or_else(|| PortError::path_error(head.clone()))?;
            let slot = children
                .iter_mut()
                .find(|(n, _)| n == head)
                .ok_or_else(|| PortError::path_error(head.clone()))?;
            slot.1 = Arc::new(attach(&slot.1, rest, name, child)?);
        }
    }
    Ok(copy)
}
