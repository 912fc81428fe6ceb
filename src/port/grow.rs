//! GrowBuilder: additive directives that extend a schema tree
//!
//! Each directive produces a new tree. Growth never replaces anything, so
//! applying the same directive twice fails with `DuplicateAttribute`.

use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use super::bind::Scope;
use super::condition;
use super::constraint::FORMAT;
use super::expr;
use super::tree::{
    ColumnNode, EntityNode, ExpressionNode, Filter, LinkNode, Node, NodeKind, Parameter,
    SchemaTree,
};
use super::value::Domain;
use crate::db::{Catalog, Label};
use crate::error::{PortError, Result, ResultExt};

/// Attach an entity (trunk, branch or facet) under `target`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityDirective {
    /// Dotted path of the container; empty for the root
    pub target: String,
    /// Table name (at the root) or relationship label (below an entity)
    pub entity: String,
    pub mask: Option<String>,
    /// `(signature, body)` pairs such as `("search($text)", "name ~ $text")`
    pub filters: Vec<(String, String)>,
    pub select: Vec<String>,
    pub deselect: Vec<String>,
    /// Directives resolved relative to this entity
    pub nested: Vec<Directive>,
}

impl EntityDirective {
    pub fn new(target: &str, entity: &str) -> Self {
        Self {
            target: target.to_string(),
            entity: entity.to_string(),
            ..Self::default()
        }
    }

    pub fn mask(mut self, mask: &str) -> Self {
        self.mask = Some(mask.to_string());
        self
    }

    pub fn filter(mut self, signature: &str, body: &str) -> Self {
        self.filters.push((signature.to_string(), body.to_string()));
        self
    }

    pub fn select(mut self, pattern: &str) -> Self {
        self.select.push(pattern.to_string());
        self
    }

    pub fn deselect(mut self, pattern: &str) -> Self {
        self.deselect.push(pattern.to_string());
        self
    }

    pub fn nest(mut self, directive: impl Into<Directive>) -> Self {
        self.nested.push(directive.into());
        self
    }
}

/// Attach a calculated field to the entity at `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculationDirective {
    pub target: String,
    pub name: String,
    pub expression: String,
}

impl CalculationDirective {
    pub fn new(target: &str, name: &str, expression: &str) -> Self {
        Self {
            target: target.to_string(),
            name: name.to_string(),
            expression: expression.to_string(),
        }
    }
}

/// Declare a root-level `$name` reference value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterDirective {
    pub name: String,
    pub default: Option<String>,
}

impl ParameterDirective {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
        }
    }

    pub fn default_value(mut self, value: &str) -> Self {
        self.default = Some(value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Entity(EntityDirective),
    Calculation(CalculationDirective),
    Parameter(ParameterDirective),
}

impl From<EntityDirective> for Directive {
    fn from(d: EntityDirective) -> Self {
        Directive::Entity(d)
    }
}

impl From<CalculationDirective> for Directive {
    fn from(d: CalculationDirective) -> Self {
        Directive::Calculation(d)
    }
}

impl From<ParameterDirective> for Directive {
    fn from(d: ParameterDirective) -> Self {
        Directive::Parameter(d)
    }
}

/// Applies directives against the catalog.
pub struct GrowBuilder<'a> {
    catalog: &'a Catalog,
}

impl<'a> GrowBuilder<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Apply directives in order, returning the grown tree.
    pub fn grow(&self, tree: &SchemaTree, directives: &[Directive]) -> Result<SchemaTree> {
        let mut grown = tree.clone();
        for directive in directives {
            grown = self.apply(grown, &[], directive)?;
        }
        Ok(grown)
    }

    fn apply(&self, tree: SchemaTree, base: &[String], directive: &Directive) -> Result<SchemaTree> {
        match directive {
            Directive::Entity(d) => {
                let target = join(base, &d.target);
                self.grow_entity(tree, &target, d)
                    .with_context(|| format!("growing `{}` at `{}`", d.entity, target.join(".")))
            }
            Directive::Calculation(d) => {
                let target = join(base, &d.target);
                self.grow_calculation(tree, &target, d)
                    .with_context(|| format!("calculating `{}` at `{}`", d.name, target.join(".")))
            }
            Directive::Parameter(d) => self
                .grow_parameter(tree, d)
                .with_context(|| format!("declaring parameter `${}`", d.name)),
        }
    }

    fn grow_entity(
        &self,
        tree: SchemaTree,
        target: &[String],
        directive: &EntityDirective,
    ) -> Result<SchemaTree> {
        let container = tree.container(target)?;
        let (kind, table, relation) = self.classify(container, &directive.entity)?;

        let identity = self.catalog.describe_table(&table)?.identity()?;
        let select = if directive.select.is_empty() {
            vec![glob("*")?]
        } else {
            directive.select.iter().map(|p| glob(p)).collect::<Result<_>>()?
        };
        let deselect: Vec<Regex> = directive.deselect.iter().map(|p| glob(p)).collect::<Result<_>>()?;

        let mut children = Vec::new();
        for label in self.catalog.labels(&table)? {
            let name = label.name().to_string();
            if !select.iter().any(|re| re.is_match(&name)) || deselect.iter().any(|re| re.is_match(&name)) {
                continue;
            }
            let node = match label {
                Label::Column { column, .. } => Node::Column(ColumnNode {
                    column: column.name,
                    domain: column.domain,
                    nullable: column.nullable,
                }),
                Label::Link {
                    column,
                    target,
                    nullable,
                    ..
                } => {
                    if relation.as_deref() == Some(column.as_str()) {
                        continue;
                    }
                    let key = self.catalog.describe_table(&target)?.identity()?.domain;
                    Node::Link(LinkNode {
                        column,
                        domain: Domain::identity(target.clone(), key),
                        target,
                        nullable,
                    })
                }
                Label::Identity { .. } | Label::Reverse { .. } => continue,
            };
            if name == "id" {
                return Err(PortError::duplicate_attribute(name));
            }
            children.push((name, Arc::new(node)));
        }

        let params: Vec<String> = tree.parameters().iter().map(|p| p.name.clone()).collect();
        let scope = Scope::new(self.catalog, Some(table.as_str())).with_params(params.clone());
        let mask = directive
            .mask
            .as_deref()
            .map(|source| scope.bind_predicate(source))
            .transpose()
            .context("binding mask")?;

        let mut filters: Vec<Filter> = Vec::new();
        for (signature, body) in &directive.filters {
            let (name, formals) = expr::parse_signature(signature)?;
            if condition::is_reserved(&name) {
                return Err(PortError::structure(format!(
                    "filter `{}` shadows a built-in operator",
                    name
                )));
            }
            if filters.iter().any(|f| f.name == name) || tree.parameter(&name).is_some() {
                return Err(PortError::duplicate_attribute(name));
            }
            let scope = Scope::new(self.catalog, Some(table.as_str()))
                .with_params(params.iter().cloned().chain(formals.iter().cloned()));
            let body = scope
                .bind_predicate(body)
                .with_context(|| format!("binding filter `{}`", name))?;
            filters.push(Filter {
                name,
                formals,
                body,
            });
        }

        let entity = EntityNode {
            table,
            identity,
            relation,
            plural: kind != NodeKind::Facet,
            mask,
            filters,
            children,
        };
        let node = match kind {
            NodeKind::Trunk => Node::Trunk(entity),
            NodeKind::Branch => Node::Branch(entity),
            _ => Node::Facet(entity),
        };

        let grown = tree.with_child(target, &directive.entity, node)?;
        debug!(target = %target.join("."), entity = %directive.entity, kind = %kind, "Grew entity");

        let mut path = target.to_vec();
        path.push(directive.entity.clone());
        let mut grown = grown;
        for nested in &directive.nested {
            grown = self.apply(grown, &path, nested)?;
        }
        Ok(grown)
    }

    /// Decide what the named entity is relative to its container.
    fn classify(&self, container: &Node, name: &str) -> Result<(NodeKind, String, Option<String>)> {
        let Some(parent) = container.as_entity() else {
            return if self.catalog.has_table(name) {
                Ok((NodeKind::Trunk, name.to_string(), None))
            } else {
                Err(PortError::unknown_attribute(name))
            };
        };
        match self.catalog.label(&parent.table, name)? {
            Some(Label::Reverse {
                table,
                column,
                plural,
                ..
            }) => {
                let kind = if plural { NodeKind::Branch } else { NodeKind::Facet };
                Ok((kind, table, Some(column)))
            }
            Some(Label::Link { .. }) => Err(PortError::type_mismatch("reverse relationship", "link")),
            Some(Label::Column { .. }) | Some(Label::Identity { .. }) => {
                Err(PortError::type_mismatch("reverse relationship", "column"))
            }
            None => Err(PortError::unknown_attribute(name)),
        }
    }

    fn grow_calculation(
        &self,
        tree: SchemaTree,
        target: &[String],
        directive: &CalculationDirective,
    ) -> Result<SchemaTree> {
        let container = tree.container(target)?;
        let entity = container
            .as_entity()
            .ok_or_else(|| PortError::type_mismatch("entity", container.kind()))?;
        let params = tree.parameters().iter().map(|p| p.name.clone());
        let expr = Scope::new(self.catalog, Some(entity.table.as_str()))
            .with_params(params)
            .bind_source(&directive.expression)?;
        let node = Node::Expression(ExpressionNode {
            source: directive.expression.clone(),
            expr,
        });
        let grown = tree.with_child(target, &directive.name, node)?;
        debug!(target = %target.join("."), name = %directive.name, "Grew calculation");
        Ok(grown)
    }

    fn grow_parameter(&self, tree: SchemaTree, directive: &ParameterDirective) -> Result<SchemaTree> {
        if directive.name == FORMAT || condition::is_reserved(&directive.name) {
            return Err(PortError::structure(format!(
                "parameter `${}` collides with a reserved name",
                directive.name
            )));
        }
        if has_filter(tree.root(), &directive.name) {
            return Err(PortError::duplicate_attribute(directive.name.clone()));
        }
        let grown = tree.with_parameter(Parameter {
            name: directive.name.clone(),
            default: directive.default.clone(),
        })?;
        debug!(name = %directive.name, "Declared parameter");
        Ok(grown)
    }
}

fn has_filter(node: &Node, name: &str) -> bool {
    node.as_entity().is_some_and(|e| e.filter(name).is_some())
        || node.children().iter().any(|(_, child)| has_filter(child, name))
}

fn join(base: &[String], target: &str) -> Vec<String> {
    let mut path = base.to_vec();
    path.extend(target.split('.').filter(|s| !s.is_empty()).map(str::to_string));
    path
}

/// Compile a shell glob (`*`, `?`) into an anchored regex.
fn glob(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| PortError::argument(format!("bad pattern `{}`: {}", pattern, e)))
}
