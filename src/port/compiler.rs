//! QueryCompiler: schema tree + constraints -> statements -> nested values
//!
//! Every entity node compiles to one SELECT, in pre-order. Branches and facets
//! fetch the rows of all their parents at once (`fk IN json_each(?1)`) and are
//! grouped by parent identity while assembling the result. The whole tree is
//! compiled before anything executes, so every structural or argument error
//! surfaces without touching the store.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::bind::Bindings;
use super::builder::{SelectQuery, StatementBuilder};
use super::condition::{self, Condition, Operand};
use super::constraint::{Addressed, Constraint, ConstraintSet, FORMAT, OutputFormat};
use super::tree::{EntityNode, Filter, Node, NodeKind, SchemaTree};
use super::value::{Domain, Identity, Record, Scalar, Shape, Value};
use crate::db::sqlite_helpers::{identities_to_json, json_array_in_sql, qualified, quote_ident};
use crate::db::{Plan, Row, Store, Transaction};
use crate::error::{PortError, Result, ResultExt};

/// Result of `produce`: the data, its shape and the negotiated format.
#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub format: OutputFormat,
    pub shape: Shape,
    pub data: Value,
}

/// Shape metadata of a tree, without executing anything.
pub fn describe(tree: &SchemaTree, constraints: &ConstraintSet) -> Result<Shape> {
    Compiled::new(tree, constraints)?;
    Ok(shape_of(tree))
}

/// Compile and execute in a read transaction.
pub async fn produce(
    store: &dyn Store,
    tree: &SchemaTree,
    constraints: &ConstraintSet,
    default_format: OutputFormat,
) -> Result<Product> {
    let compiled = Compiled::new(tree, constraints)?;
    let mut tx = store.begin().await?;
    match compiled.execute(tx.as_mut()).await {
        Ok(data) => {
            tx.commit().await?;
            Ok(Product {
                format: compiled.format.unwrap_or(default_format),
                shape: shape_of(tree),
                data,
            })
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "Rollback after failed read also failed");
            }
            Err(err)
        }
    }
}

/// Shape of the whole tree; entities list `id` first.
pub fn shape_of(tree: &SchemaTree) -> Shape {
    Shape {
        name: String::new(),
        kind: NodeKind::Root,
        plural: false,
        domain: None,
        children: tree
            .root()
            .children()
            .iter()
            .map(|(name, node)| node_shape(name, node))
            .collect(),
    }
}

fn node_shape(name: &str, node: &Node) -> Shape {
    match node.as_entity() {
        Some(entity) => {
            let mut children = vec![Shape {
                name: "id".to_string(),
                kind: NodeKind::Column,
                plural: false,
                domain: Some(Domain::identity(
                    entity.table.clone(),
                    entity.identity.domain.clone(),
                )),
                children: Vec::new(),
            }];
            children.extend(entity.children.iter().map(|(n, c)| node_shape(n, c)));
            Shape {
                name: name.to_string(),
                kind: node.kind(),
                plural: entity.plural,
                domain: None,
                children,
            }
        }
        None => Shape {
            name: name.to_string(),
            kind: node.kind(),
            plural: false,
            domain: node.domain().cloned(),
            children: Vec::new(),
        },
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// Where a record field comes from.
#[derive(Debug, Clone)]
enum Slot {
    /// Column index in this node's rows
    Value(usize),
    /// Rows of another plan, grouped by this record's identity
    Entity { plan: usize, plural: bool },
}

#[derive(Debug)]
struct NodePlan {
    path: String,
    parent: Option<usize>,
    /// Parameter slot receiving the parent identities
    slot: Option<usize>,
    plan: Plan,
    domains: Vec<Domain>,
    fields: Vec<(String, Slot)>,
}

/// Constraint contributions collected for one statement.
#[derive(Debug, Default)]
struct Clauses {
    filters: Vec<String>,
    /// `(constraint position, ORDER BY term)`
    sorts: Vec<(usize, String)>,
    top: Option<i64>,
    skip: Option<i64>,
    /// `exists` constraints on this entity; they restrict its parent
    exists: Vec<bool>,
}

/// A fully compiled tree, ready to execute.
#[derive(Debug)]
pub struct Compiled {
    plans: Vec<NodePlan>,
    roots: Vec<(String, usize)>,
    format: Option<OutputFormat>,
}

struct Compiler<'c> {
    constraints: &'c ConstraintSet,
    bindings: Bindings,
    plans: Vec<NodePlan>,
}

impl Compiled {
    pub fn new(tree: &SchemaTree, constraints: &ConstraintSet) -> Result<Self> {
        let format = constraints.format()?;
        let mut compiler = Compiler {
            constraints,
            bindings: root_bindings(tree, constraints)?,
            plans: Vec::new(),
        };

        let root = tree.root();
        let buckets = constraints.addressed().partition(&root.child_names())?;
        let mut roots = Vec::new();
        for ((name, node), bucket) in root.children().iter().zip(&buckets) {
            let index = compiler
                .compile_entity(name, node, None, bucket)
                .with_context(|| format!("compiling `{}`", name))?;
            roots.push((name.clone(), index));
        }

        Ok(Self {
            plans: compiler.plans,
            roots,
            format,
        })
    }

    pub fn format(&self) -> Option<OutputFormat> {
        self.format
    }

    /// The compiled statements in execution order.
    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.iter().map(|p| &p.plan)
    }

    /// Run every statement and assemble the nested result.
    pub async fn execute(&self, tx: &mut dyn Transaction) -> Result<Value> {
        let mut fetched: Vec<Fetched> = Vec::with_capacity(self.plans.len());
        for node in &self.plans {
            let rows = match (node.parent, node.slot) {
                (Some(parent), Some(slot)) => {
                    let ids = &fetched[parent].ids;
                    if ids.is_empty() {
                        Vec::new()
                    } else {
                        let mut plan = node.plan.clone();
                        plan.params[slot] = Some(Scalar::Text(identities_to_json(ids)));
                        tx.query(&plan, &node.domains).await?
                    }
                }
                _ => tx.query(&node.plan, &node.domains).await?,
            };
            debug!(node = %node.path, rows = rows.len(), "Fetched rows");
            fetched.push(Fetched::new(rows, node.parent.is_some())?);
        }

        let mut root = Record::new();
        for (name, index) in &self.roots {
            root.push(name.clone(), Value::List(self.records(*index, None, &fetched)));
        }
        Ok(Value::Record(root))
    }

    fn records(&self, index: usize, parent: Option<&Identity>, fetched: &[Fetched]) -> Vec<Value> {
        let rows = &fetched[index];
        let indices: Vec<usize> = match parent {
            None => (0..rows.rows.len()).collect(),
            Some(id) => rows.by_parent.get(id).cloned().unwrap_or_default(),
        };
        indices
            .into_iter()
            .map(|row| self.record(index, row, fetched))
            .collect()
    }

    fn record(&self, index: usize, row: usize, fetched: &[Fetched]) -> Value {
        let node = &self.plans[index];
        let id = &fetched[index].ids[row];
        let values = &fetched[index].rows[row];

        let mut record = Record::new();
        record.push("id", Value::from(id));
        for (name, slot) in &node.fields {
            let value = match slot {
                Slot::Value(column) => Value::from(values.get(*column).cloned().flatten()),
                Slot::Entity { plan, plural } => {
                    let items = self.records(*plan, Some(id), fetched);
                    if *plural {
                        Value::List(items)
                    } else {
                        items.into_iter().next().unwrap_or(Value::Null)
                    }
                }
            };
            record.push(name.clone(), value);
        }
        Value::Record(record)
    }
}

/// Parameter defaults overridden by root-level constraints.
fn root_bindings(tree: &SchemaTree, constraints: &ConstraintSet) -> Result<Bindings> {
    let mut bindings: Bindings = tree
        .parameters()
        .iter()
        .filter_map(|p| p.default.clone().map(|d| (p.name.clone(), d)))
        .collect();
    for constraint in constraints.root_level() {
        if constraint.operator == FORMAT {
            continue;
        }
        if tree.parameter(&constraint.operator).is_none() {
            return Err(PortError::unknown_attribute(format!("${}", constraint.operator)));
        }
        match constraint.arguments.as_slice() {
            [value] => {
                bindings.insert(constraint.operator.clone(), value.clone());
            }
            _ => {
                return Err(PortError::argument(format!(
                    "parameter `${}` takes exactly one value",
                    constraint.operator
                )));
            }
        }
    }
    Ok(bindings)
}

impl Compiler<'_> {
    fn compile_entity(
        &mut self,
        path: &str,
        node: &Arc<Node>,
        parent: Option<usize>,
        bucket: &Addressed<'_>,
    ) -> Result<usize> {
        let entity = node
            .as_entity()
            .ok_or_else(|| PortError::type_mismatch("entity", node.kind()))?;

        let mut sb = StatementBuilder::new();
        let alias = sb.alias();
        let mut query = SelectQuery::new(&entity.table, &alias);
        let mut domains = Vec::new();

        let slot = match (parent, &entity.relation) {
            (Some(parent), Some(relation)) => {
                let (slot, placeholder) = sb.reserve();
                let fk = qualified(&alias, relation);
                query = query
                    .column(relation)
                    .where_clause(json_array_in_sql(&fk, &placeholder))
                    .partition_by(fk);
                domains.push(self.plans[parent].domains[self.identity_column(parent)].clone());
                Some(slot)
            }
            (Some(_), None) => {
                return Err(PortError::structure(format!(
                    "`{}` has no relationship to its parent",
                    path
                )));
            }
            (None, _) => None,
        };

        query = query.column(&entity.identity.column);
        domains.push(entity.identity.domain.clone());

        let mut fields = Vec::new();
        let mut nested = Vec::new();
        for (child_index, (name, child)) in entity.children.iter().enumerate() {
            let (sql, domain) = match &**child {
                Node::Column(c) => (qualified(&alias, &c.column), c.domain.clone()),
                Node::Link(l) => (qualified(&alias, &l.column), l.domain.clone()),
                Node::Expression(e) => (
                    e.expr
                        .to_sql(&alias, &mut sb, &self.bindings)
                        .with_context(|| format!("calculating `{}.{}`", path, name))?,
                    e.expr.domain().clone(),
                ),
                _ => {
                    nested.push((fields.len(), child_index));
                    fields.push((name.clone(), Slot::Entity { plan: 0, plural: child.is_plural() }));
                    continue;
                }
            };
            fields.push((name.clone(), Slot::Value(domains.len())));
            query = query.expression(sql);
            domains.push(domain);
        }

        if let Some(mask) = &entity.mask {
            query = query.where_clause(mask.to_sql(&alias, &mut sb, &self.bindings)?);
        }

        let buckets = bucket.partition(&node.child_names())?;
        let clauses = self.restrict(node, &alias, bucket, &buckets, &mut sb)?;
        for filter in clauses.filters {
            query = query.where_clause(filter);
        }
        let mut sorts = clauses.sorts;
        sorts.sort_by_key(|(position, _)| *position);
        for (_, sort) in sorts {
            query = query.order_by(sort);
        }
        query = query.order_by(format!("{} ASC", qualified(&alias, &entity.identity.column)));
        if let Some(top) = clauses.top {
            query = query.limit(top);
        }
        if let Some(skip) = clauses.skip {
            query = query.offset(skip);
        }

        let plan = sb.finish(query.build_sql());
        debug!(node = %path, sql = %plan.sql, "Compiled entity");
        let index = self.plans.len();
        self.plans.push(NodePlan {
            path: path.to_string(),
            parent,
            slot,
            plan,
            domains,
            fields,
        });

        for (position, child_index) in nested {
            let (name, child) = &entity.children[child_index];
            let child_path = format!("{}.{}", path, name);
            let plan = self
                .compile_entity(&child_path, child, Some(index), &buckets[child_index])
                .with_context(|| format!("compiling `{}`", child_path))?;
            self.plans[index].fields[position].1 = Slot::Entity {
                plan,
                plural: child.is_plural(),
            };
        }

        Ok(index)
    }

    fn identity_column(&self, plan: usize) -> usize {
        usize::from(self.plans[plan].parent.is_some())
    }

    fn position(&self, constraint: &Constraint) -> usize {
        self.constraints
            .iter()
            .position(|c| std::ptr::eq(c, constraint))
            .unwrap_or(usize::MAX)
    }

    /// Conditions contributed to the statement over `node` (aliased `alias`):
    /// singular children first, then the node's own constraints.
    fn restrict(
        &self,
        node: &Node,
        alias: &str,
        bucket: &Addressed<'_>,
        buckets: &[Addressed<'_>],
        sb: &mut StatementBuilder,
    ) -> Result<Clauses> {
        let entity = node
            .as_entity()
            .ok_or_else(|| PortError::type_mismatch("entity", node.kind()))?;
        let mut clauses = Clauses::default();

        for ((name, child), sub) in entity.children.iter().zip(buckets) {
            if sub.is_empty() {
                continue;
            }
            match &**child {
                Node::Facet(facet) => {
                    let inner_alias = sb.alias();
                    let inner_buckets = sub.partition(&child.child_names())?;
                    let inner = self
                        .restrict(child, &inner_alias, sub, &inner_buckets, sb)
                        .with_context(|| format!("constraining `{}`", name))?;
                    for positive in inner.exists {
                        clauses.filters.push(self.presence(entity, facet, alias, positive, sb)?);
                    }
                    if !inner.filters.is_empty() {
                        clauses.filters.push(self.correlated(
                            entity,
                            facet,
                            alias,
                            &inner_alias,
                            inner.filters,
                            sb,
                        )?);
                    }
                }
                Node::Branch(branch) => {
                    let operand = entity_operand(child, branch, alias);
                    for constraint in sub.own().filter(|c| c.operator == "exists") {
                        let condition =
                            condition::apply(&operand, &constraint.operator, &constraint.arguments, sb)
                                .with_context(|| format!("applying `{}`", constraint))?;
                        if let Condition::Exists(positive) = condition {
                            clauses.filters.push(self.presence(entity, branch, alias, positive, sb)?);
                        }
                    }
                }
                _ => {
                    sub.require_leaf()?;
                    for constraint in sub.own() {
                        let operand = self.scalar_operand(child, alias, sb)?;
                        let condition =
                            condition::apply(&operand, &constraint.operator, &constraint.arguments, sb)
                                .with_context(|| format!("applying `{}`", constraint))?;
                        match condition {
                            Condition::Filter(sql) => clauses.filters.push(sql),
                            Condition::Sort(sql) => {
                                clauses.sorts.push((self.position(constraint), sql))
                            }
                            other => {
                                return Err(PortError::structure(format!(
                                    "`{}` produced {:?} on a scalar node",
                                    constraint, other
                                )));
                            }
                        }
                    }
                }
            }
        }

        let operand = entity_operand(node, entity, alias);
        for constraint in bucket.own() {
            let condition = if condition::supports(node.kind(), &constraint.operator) {
                condition::apply(&operand, &constraint.operator, &constraint.arguments, sb)
            } else if let Some(filter) = entity.filter(&constraint.operator) {
                self.apply_filter(filter, alias, &constraint.arguments, sb)
                    .map(Condition::Filter)
            } else {
                Err(PortError::unsupported(constraint.operator.clone(), node.kind()))
            }
            .with_context(|| format!("applying `{}`", constraint))?;

            match condition {
                Condition::Filter(sql) => clauses.filters.push(sql),
                Condition::Sort(sql) => clauses.sorts.push((self.position(constraint), sql)),
                Condition::Top(n) => clauses.top = Some(n),
                Condition::Skip(n) => clauses.skip = Some(n),
                Condition::Exists(positive) => clauses.exists.push(positive),
            }
        }

        Ok(clauses)
    }

    fn scalar_operand(&self, node: &Node, alias: &str, sb: &mut StatementBuilder) -> Result<Operand> {
        let (sql, domain) = match node {
            Node::Column(c) => (qualified(alias, &c.column), c.domain.clone()),
            Node::Link(l) => (qualified(alias, &l.column), l.domain.clone()),
            Node::Expression(e) => (
                e.expr.to_sql(alias, sb, &self.bindings)?,
                e.expr.domain().clone(),
            ),
            other => return Err(PortError::type_mismatch("scalar", other.kind())),
        };
        Ok(Operand {
            kind: node.kind(),
            sql,
            domain,
            plural: false,
        })
    }

    fn apply_filter(
        &self,
        filter: &Filter,
        alias: &str,
        arguments: &[String],
        sb: &mut StatementBuilder,
    ) -> Result<String> {
        let arguments: Vec<&String> = if filter.formals.is_empty() {
            arguments.iter().filter(|a| !a.is_empty()).collect()
        } else {
            arguments.iter().collect()
        };
        if arguments.len() != filter.formals.len() {
            return Err(PortError::argument(format!(
                "filter `{}` takes {} argument(s), got {}",
                filter.name,
                filter.formals.len(),
                arguments.len()
            )));
        }
        let mut bindings = self.bindings.clone();
        for (formal, value) in filter.formals.iter().zip(arguments) {
            bindings.insert(formal.clone(), value.clone());
        }
        filter.body.to_sql(alias, sb, &bindings)
    }

    /// `[NOT] EXISTS` over the rows of `child` belonging to the parent row.
    fn presence(
        &self,
        parent: &EntityNode,
        child: &EntityNode,
        parent_alias: &str,
        positive: bool,
        sb: &mut StatementBuilder,
    ) -> Result<String> {
        let child_alias = sb.alias();
        let sql = self.correlated(parent, child, parent_alias, &child_alias, Vec::new(), sb)?;
        Ok(if positive { sql } else { format!("NOT {}", sql) })
    }

    /// `EXISTS` over the rows of `child` (aliased `child_alias`) belonging to
    /// the parent row and satisfying `conditions`.
    fn correlated(
        &self,
        parent: &EntityNode,
        child: &EntityNode,
        parent_alias: &str,
        child_alias: &str,
        conditions: Vec<String>,
        sb: &mut StatementBuilder,
    ) -> Result<String> {
        let relation = child
            .relation
            .as_ref()
            .ok_or_else(|| PortError::structure(format!("`{}` has no parent relationship", child.table)))?;
        let mut all = vec![format!(
            "{} = {}",
            qualified(child_alias, relation),
            qualified(parent_alias, &parent.identity.column)
        )];
        if let Some(mask) = &child.mask {
            all.push(mask.to_sql(child_alias, sb, &self.bindings)?);
        }
        all.extend(conditions);
        Ok(format!(
            "EXISTS (SELECT 1 FROM {} AS {} WHERE {})",
            quote_ident(&child.table),
            child_alias,
            all.join(" AND ")
        ))
    }
}

fn entity_operand(node: &Node, entity: &EntityNode, alias: &str) -> Operand {
    Operand {
        kind: node.kind(),
        sql: qualified(alias, &entity.identity.column),
        domain: Domain::identity(entity.table.clone(), entity.identity.domain.clone()),
        plural: entity.plural,
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Rows of one plan, indexed by identity and parent identity.
struct Fetched {
    rows: Vec<Row>,
    ids: Vec<Identity>,
    by_parent: HashMap<Identity, Vec<usize>>,
}

impl Fetched {
    fn new(rows: Vec<Row>, has_parent: bool) -> Result<Self> {
        let offset = usize::from(has_parent);
        let identity = |row: &Row, index: usize| {
            row.get(index)
                .cloned()
                .flatten()
                .and_then(|s| s.to_identity())
                .ok_or_else(|| PortError::structure("row without identity"))
        };

        let mut ids = Vec::with_capacity(rows.len());
        let mut by_parent: HashMap<Identity, Vec<usize>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            ids.push(identity(row, offset)?);
            if has_parent {
                by_parent.entry(identity(row, 0)?).or_default().push(i);
            }
        }
        Ok(Self {
            rows,
            ids,
            by_parent,
        })
    }
}
