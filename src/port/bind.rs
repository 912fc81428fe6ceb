//! Expression binding: name resolution, domain inference and SQL emission
//!
//! A [`Syntax`] tree is bound against the catalog labels of a scope table.
//! Dotted paths become chains of [`Hop`]s; scalar positions accept only
//! singular chains, aggregates accept plural ones. The bound tree emits SQL
//! as correlated subqueries over the enclosing statement's alias.

use std::collections::HashMap;

use super::builder::StatementBuilder;
use super::expr::{self, BinaryOp, Syntax, UnaryOp};
use super::value::{Domain, Scalar};
use crate::db::sqlite_helpers::{qualified, quote_ident};
use crate::db::{Catalog, Label};
use crate::error::{PortError, Result};

/// Raw values of `$name` references, keyed by name.
pub type Bindings = HashMap<String, String>;

/// One step of navigation from one table to another.
#[derive(Debug, Clone, PartialEq)]
pub enum Hop {
    /// `from.column` holds the identity (`identity`) of a `table` record
    Forward {
        column: String,
        table: String,
        identity: String,
    },
    /// Records of `table` whose `column` holds `from`'s identity (`identity`)
    Backward {
        table: String,
        column: String,
        identity: String,
        plural: bool,
    },
}

impl Hop {
    fn table(&self) -> &str {
        match self {
            Hop::Forward { table, .. } | Hop::Backward { table, .. } => table,
        }
    }

    fn join_condition(&self, from: &str, to: &str) -> String {
        match self {
            Hop::Forward {
                column, identity, ..
            } => format!("{} = {}", qualified(to, identity), qualified(from, column)),
            Hop::Backward {
                column, identity, ..
            } => format!("{} = {}", qualified(to, column), qualified(from, identity)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Exists,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "count" => Some(Aggregate::Count),
            "exists" => Some(Aggregate::Exists),
            "sum" => Some(Aggregate::Sum),
            "avg" => Some(Aggregate::Avg),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            _ => None,
        }
    }

    fn sql_name(self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Exists => "EXISTS",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Lower,
    Upper,
    Length,
    IsNull,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "lower" => Some(Function::Lower),
            "upper" => Some(Function::Upper),
            "length" => Some(Function::Length),
            "is_null" => Some(Function::IsNull),
            _ => None,
        }
    }
}

/// A bound expression with its inferred domain.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    Literal {
        value: Option<Scalar>,
        domain: Domain,
    },
    Param {
        name: String,
        domain: Domain,
    },
    /// A column reached through singular hops (none for the scope table itself)
    Field {
        hops: Vec<Hop>,
        column: String,
        domain: Domain,
    },
    /// `column` is `None` when aggregating whole records
    Aggregate {
        function: Aggregate,
        hops: Vec<Hop>,
        column: Option<String>,
        domain: Domain,
    },
    Function {
        function: Function,
        arg: Box<Bound>,
        domain: Domain,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Bound>,
        domain: Domain,
    },
    Binary {
        op: BinaryOp,
        left: Box<Bound>,
        right: Box<Bound>,
        domain: Domain,
    },
}

impl Bound {
    pub fn domain(&self) -> &Domain {
        match self {
            Bound::Literal { domain, .. }
            | Bound::Param { domain, .. }
            | Bound::Field { domain, .. }
            | Bound::Aggregate { domain, .. }
            | Bound::Function { domain, .. }
            | Bound::Unary { domain, .. }
            | Bound::Binary { domain, .. } => domain,
        }
    }

    fn is_null_literal(&self) -> bool {
        matches!(self, Bound::Literal { value: None, .. })
    }

    /// Give an untyped `$param` (or `null`) the domain of its partner.
    fn typed(self, domain: &Domain) -> Bound {
        match self {
            Bound::Param {
                name,
                domain: Domain::Untyped,
            } => Bound::Param {
                name,
                domain: domain.clone(),
            },
            Bound::Literal {
                value: None,
                domain: Domain::Untyped,
            } => Bound::Literal {
                value: None,
                domain: domain.clone(),
            },
            other => other,
        }
    }

    /// Emit SQL for this expression evaluated against the row aliased `alias`.
    pub fn to_sql(
        &self,
        alias: &str,
        builder: &mut StatementBuilder,
        bindings: &Bindings,
    ) -> Result<String> {
        match self {
            Bound::Literal { value: None, .. } => Ok("NULL".to_string()),
            Bound::Literal { value, .. } => Ok(builder.param(value.clone())),
            Bound::Param { name, domain } => {
                let raw = bindings
                    .get(name)
                    .ok_or_else(|| PortError::missing_parameter(name.clone()))?;
                let value = domain.parse(raw)?;
                Ok(builder.param(Some(value)))
            }
            Bound::Field { hops, column, .. } => {
                if hops.is_empty() {
                    return Ok(qualified(alias, column));
                }
                let (from, last) = chain(hops, alias, builder);
                Ok(format!("(SELECT {} {})", qualified(&last, column), from))
            }
            Bound::Aggregate {
                function,
                hops,
                column,
                ..
            } => {
                let (from, last) = chain(hops, alias, builder);
                match (function, column) {
                    (Aggregate::Exists, None) => Ok(format!("EXISTS (SELECT 1 {})", from)),
                    (Aggregate::Exists, Some(column)) => Ok(format!(
                        "EXISTS (SELECT 1 {} AND {} IS NOT NULL)",
                        from,
                        qualified(&last, column)
                    )),
                    (Aggregate::Count, None) => Ok(format!("(SELECT COUNT(*) {})", from)),
                    (function, Some(column)) => Ok(format!(
                        "(SELECT {}({}) {})",
                        function.sql_name(),
                        qualified(&last, column),
                        from
                    )),
                    (function, None) => Err(PortError::structure(format!(
                        "{} needs a column",
                        function.sql_name()
                    ))),
                }
            }
            Bound::Function { function, arg, .. } => {
                let arg = arg.to_sql(alias, builder, bindings)?;
                Ok(match function {
                    Function::Lower => format!("lower({})", arg),
                    Function::Upper => format!("upper({})", arg),
                    Function::Length => format!("length({})", arg),
                    Function::IsNull => format!("({} IS NULL)", arg),
                })
            }
            Bound::Unary { op, operand, .. } => {
                let operand = operand.to_sql(alias, builder, bindings)?;
                Ok(match op {
                    UnaryOp::Not => format!("(NOT {})", operand),
                    UnaryOp::Neg => format!("(-{})", operand),
                })
            }
            Bound::Binary {
                op, left, right, ..
            } => {
                let null_test = left.is_null_literal() || right.is_null_literal();
                let text = left.domain().is_text() || right.domain().is_text();
                let l = left.to_sql(alias, builder, bindings)?;
                let r = right.to_sql(alias, builder, bindings)?;
                Ok(match op {
                    BinaryOp::Or => format!("({} OR {})", l, r),
                    BinaryOp::And => format!("({} AND {})", l, r),
                    BinaryOp::Eq if null_test => format!("({} IS {})", l, r),
                    BinaryOp::Ne if null_test => format!("({} IS NOT {})", l, r),
                    BinaryOp::Eq => format!("({} = {})", l, r),
                    BinaryOp::Ne => format!("({} <> {})", l, r),
                    BinaryOp::Lt => format!("({} < {})", l, r),
                    BinaryOp::Le => format!("({} <= {})", l, r),
                    BinaryOp::Gt => format!("({} > {})", l, r),
                    BinaryOp::Ge => format!("({} >= {})", l, r),
                    BinaryOp::Contains => format!("(instr(lower({}), lower({})) > 0)", l, r),
                    BinaryOp::Add if text => format!("({} || {})", l, r),
                    BinaryOp::Add => format!("({} + {})", l, r),
                    BinaryOp::Sub => format!("({} - {})", l, r),
                    BinaryOp::Mul => format!("({} * {})", l, r),
                    BinaryOp::Div => format!("(CAST({} AS REAL) / {})", l, r),
                })
            }
        }
    }
}

/// `FROM ... WHERE <correlation>` for a hop chain starting at `alias`,
/// plus the alias of the last table.
fn chain(hops: &[Hop], alias: &str, builder: &mut StatementBuilder) -> (String, String) {
    let mut from = String::new();
    let mut correlation = String::new();
    let mut previous = alias.to_string();
    for (i, hop) in hops.iter().enumerate() {
        let next = builder.alias();
        let condition = hop.join_condition(&previous, &next);
        if i == 0 {
            from = format!("{} AS {}", quote_ident(hop.table()), next);
            correlation = condition;
        } else {
            from.push_str(&format!(
                " JOIN {} AS {} ON {}",
                quote_ident(hop.table()),
                next,
                condition
            ));
        }
        previous = next;
    }
    (format!("FROM {} WHERE {}", from, correlation), previous)
}

/// Names visible to an expression: the labels of `table` and the `$params`.
pub struct Scope<'a> {
    pub catalog: &'a Catalog,
    pub table: Option<&'a str>,
    pub params: Vec<String>,
}

impl<'a> Scope<'a> {
    pub fn new(catalog: &'a Catalog, table: Option<&'a str>) -> Self {
        Self {
            catalog,
            table,
            params: Vec::new(),
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    /// Parse and bind an expression of any domain.
    pub fn bind_source(&self, source: &str) -> Result<Bound> {
        self.bind(&expr::parse(source)?)
    }

    /// Parse and bind an expression that must be boolean.
    pub fn bind_predicate(&self, source: &str) -> Result<Bound> {
        let bound = self.bind_source(source)?.typed(&Domain::Boolean);
        require_boolean(&bound)?;
        Ok(bound)
    }

    pub fn bind(&self, syntax: &Syntax) -> Result<Bound> {
        match syntax {
            Syntax::Literal(value) => Ok(Bound::Literal {
                domain: literal_domain(value.as_ref()),
                value: value.clone(),
            }),
            Syntax::Param(name) => {
                if self.params.iter().any(|p| p == name) {
                    Ok(Bound::Param {
                        name: name.clone(),
                        domain: Domain::Untyped,
                    })
                } else {
                    Err(PortError::unbound(format!("${}", name)))
                }
            }
            Syntax::Path(segments) => {
                let path = self.resolve(segments)?;
                if path.plural {
                    return Err(PortError::structure(format!(
                        "`{}` is plural; use it inside an aggregate",
                        segments.join(".")
                    )));
                }
                let (column, domain) = path.terminal.into_column();
                Ok(Bound::Field {
                    hops: path.hops,
                    column,
                    domain,
                })
            }
            Syntax::Call { name, args } => self.bind_call(name, args),
            Syntax::Unary { op, operand } => {
                let operand = self.bind(operand)?;
                match op {
                    UnaryOp::Not => {
                        let operand = operand.typed(&Domain::Boolean);
                        require_boolean(&operand)?;
                        Ok(Bound::Unary {
                            op: *op,
                            operand: Box::new(operand),
                            domain: Domain::Boolean,
                        })
                    }
                    UnaryOp::Neg => {
                        let operand = operand.typed(&Domain::Integer);
                        if !operand.domain().is_numeric() {
                            return Err(PortError::type_mismatch("number", operand.domain()));
                        }
                        let domain = operand.domain().storage().clone();
                        Ok(Bound::Unary {
                            op: *op,
                            operand: Box::new(operand),
                            domain,
                        })
                    }
                }
            }
            Syntax::Binary { op, left, right } => {
                let left = self.bind(left)?;
                let right = self.bind(right)?;
                bind_binary(*op, left, right)
            }
        }
    }

    fn bind_call(&self, name: &str, args: &[Syntax]) -> Result<Bound> {
        let [arg] = args else {
            return Err(PortError::structure(format!(
                "`{}` takes exactly one argument, got {}",
                name,
                args.len()
            )));
        };

        if let Some(function) = Aggregate::from_name(name) {
            let Syntax::Path(segments) = arg else {
                return Err(PortError::structure(format!("`{}` expects a path", name)));
            };
            let path = self.resolve(segments)?;
            if path.hops.is_empty() {
                return Err(PortError::structure(format!(
                    "`{}` needs a relationship to aggregate over",
                    name
                )));
            }
            let column = path.terminal.column();
            let domain = match function {
                Aggregate::Count => Domain::Integer,
                Aggregate::Exists => Domain::Boolean,
                Aggregate::Avg | Aggregate::Sum => {
                    let domain = path.terminal.require_column()?;
                    if !domain.is_numeric() {
                        return Err(PortError::type_mismatch("number", domain));
                    }
                    if function == Aggregate::Avg {
                        Domain::Float
                    } else {
                        domain.storage().clone()
                    }
                }
                Aggregate::Min | Aggregate::Max => {
                    let domain = path.terminal.require_column()?;
                    if !domain.is_ordered() {
                        return Err(PortError::type_mismatch("ordered domain", domain));
                    }
                    domain.clone()
                }
            };
            return Ok(Bound::Aggregate {
                function,
                hops: path.hops,
                column,
                domain,
            });
        }

        let function = Function::from_name(name).ok_or_else(|| PortError::unbound(name))?;
        let arg = self.bind(arg)?;
        let (arg, domain) = match function {
            Function::IsNull => (arg, Domain::Boolean),
            Function::Lower | Function::Upper | Function::Length => {
                let arg = arg.typed(&Domain::Text);
                if !matches!(arg.domain(), Domain::Text | Domain::Date) {
                    return Err(PortError::type_mismatch("text", arg.domain()));
                }
                let domain = if function == Function::Length {
                    Domain::Integer
                } else {
                    Domain::Text
                };
                (arg, domain)
            }
        };
        Ok(Bound::Function {
            function,
            arg: Box::new(arg),
            domain,
        })
    }

    /// Walk a dotted path through the catalog labels.
    fn resolve(&self, segments: &[String]) -> Result<ResolvedPath> {
        let joined = segments.join(".");
        let mut table = self
            .table
            .ok_or_else(|| PortError::unbound(joined.clone()))?
            .to_string();
        let mut hops = Vec::new();
        let mut plural = false;

        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            let label = self
                .catalog
                .label(&table, segment)?
                .ok_or_else(|| PortError::unbound(joined.clone()))?;
            match label {
                Label::Identity { column, domain, .. } if last => {
                    return Ok(ResolvedPath {
                        hops,
                        plural,
                        terminal: Terminal::Column {
                            column,
                            domain: Domain::identity(table, domain),
                        },
                    });
                }
                Label::Column { column, .. } if last => {
                    return Ok(ResolvedPath {
                        hops,
                        plural,
                        terminal: Terminal::Column {
                            column: column.name,
                            domain: column.domain,
                        },
                    });
                }
                Label::Identity { .. } | Label::Column { .. } => {
                    return Err(PortError::structure(format!(
                        "cannot navigate through column `{}` in `{}`",
                        segment, joined
                    )));
                }
                Label::Link { column, target, .. } => {
                    let identity = self.catalog.describe_table(&target)?.identity()?;
                    if last {
                        return Ok(ResolvedPath {
                            hops,
                            plural,
                            terminal: Terminal::Column {
                                column,
                                domain: Domain::identity(target, identity.domain),
                            },
                        });
                    }
                    hops.push(Hop::Forward {
                        column,
                        table: target.clone(),
                        identity: identity.column,
                    });
                    table = target;
                }
                Label::Reverse {
                    table: source,
                    column,
                    plural: many,
                    ..
                } => {
                    let identity = self.catalog.describe_table(&table)?.identity()?;
                    hops.push(Hop::Backward {
                        table: source.clone(),
                        column,
                        identity: identity.column,
                        plural: many,
                    });
                    plural |= many;
                    table = source;
                }
            }
        }

        let identity = self.catalog.describe_table(&table)?.identity()?;
        Ok(ResolvedPath {
            hops,
            plural,
            terminal: Terminal::Entity {
                domain: Domain::identity(table, identity.domain),
                identity: identity.column,
            },
        })
    }
}

struct ResolvedPath {
    hops: Vec<Hop>,
    plural: bool,
    terminal: Terminal,
}

enum Terminal {
    Column { column: String, domain: Domain },
    /// The path ends at a record; scalar use projects its identity
    Entity { identity: String, domain: Domain },
}

impl Terminal {
    fn into_column(self) -> (String, Domain) {
        match self {
            Terminal::Column { column, domain } => (column, domain),
            Terminal::Entity { identity, domain } => (identity, domain),
        }
    }

    fn column(&self) -> Option<String> {
        match self {
            Terminal::Column { column, .. } => Some(column.clone()),
            Terminal::Entity { .. } => None,
        }
    }

    fn require_column(&self) -> Result<&Domain> {
        match self {
            Terminal::Column { domain, .. } => Ok(domain),
            Terminal::Entity { domain, .. } => Err(PortError::type_mismatch("column", domain)),
        }
    }
}

fn literal_domain(value: Option<&Scalar>) -> Domain {
    match value {
        None => Domain::Untyped,
        Some(Scalar::Bool(_)) => Domain::Boolean,
        Some(Scalar::Integer(_)) => Domain::Integer,
        Some(Scalar::Float(_)) => Domain::Float,
        Some(Scalar::Text(_)) => Domain::Text,
    }
}

fn is_untyped(domain: &Domain) -> bool {
    matches!(domain, Domain::Untyped)
}

fn require_boolean(bound: &Bound) -> Result<()> {
    match bound.domain().storage() {
        Domain::Boolean => Ok(()),
        other => Err(PortError::type_mismatch("boolean", other)),
    }
}

fn comparable(a: &Domain, b: &Domain) -> bool {
    match (a.storage(), b.storage()) {
        (Domain::Untyped, _) | (_, Domain::Untyped) => true,
        (x, y) if x.is_numeric() && y.is_numeric() => true,
        (Domain::Text | Domain::Date, Domain::Text | Domain::Date) => true,
        (x, y) => x == y,
    }
}

fn bind_binary(op: BinaryOp, left: Bound, right: Bound) -> Result<Bound> {
    let binary = |left: Bound, right: Bound, domain: Domain| Bound::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
        domain,
    };

    match op {
        BinaryOp::Or | BinaryOp::And => {
            let left = left.typed(&Domain::Boolean);
            let right = right.typed(&Domain::Boolean);
            require_boolean(&left)?;
            require_boolean(&right)?;
            Ok(binary(left, right, Domain::Boolean))
        }
        BinaryOp::Contains => {
            let left = left.typed(&Domain::Text);
            let right = right.typed(&Domain::Text);
            for side in [&left, &right] {
                if !matches!(side.domain(), Domain::Text | Domain::Date) {
                    return Err(PortError::type_mismatch("text", side.domain()));
                }
            }
            Ok(binary(left, right, Domain::Boolean))
        }
        _ if op.is_comparison() => {
            let (left, right) = unify(left, right, Domain::Text);
            if !comparable(left.domain(), right.domain()) {
                return Err(PortError::type_mismatch(left.domain(), right.domain()));
            }
            let ordered = |d: &Domain| is_untyped(d) || d.is_ordered();
            let needs_order = !matches!(op, BinaryOp::Eq | BinaryOp::Ne);
            if needs_order && !(ordered(left.domain()) && ordered(right.domain())) {
                return Err(PortError::type_mismatch("ordered domain", left.domain()));
            }
            Ok(binary(left, right, Domain::Boolean))
        }
        _ => {
            let text = left.domain().is_text() || right.domain().is_text();
            if op == BinaryOp::Add && text {
                let left = left.typed(&Domain::Text);
                let right = right.typed(&Domain::Text);
                if !(left.domain().is_text() && right.domain().is_text()) {
                    return Err(PortError::type_mismatch(left.domain(), right.domain()));
                }
                return Ok(binary(left, right, Domain::Text));
            }
            let (left, right) = unify(left, right, Domain::Integer);
            for side in [&left, &right] {
                if !side.domain().is_numeric() {
                    return Err(PortError::type_mismatch("number", side.domain()));
                }
            }
            let both_integer = matches!(
                (left.domain().storage(), right.domain().storage()),
                (Domain::Integer, Domain::Integer)
            );
            let domain = if op == BinaryOp::Div || !both_integer {
                Domain::Float
            } else {
                Domain::Integer
            };
            Ok(binary(left, right, domain))
        }
    }
}

/// Type untyped operands after their partner, or `fallback` when both are untyped.
fn unify(left: Bound, right: Bound, fallback: Domain) -> (Bound, Bound) {
    match (is_untyped(left.domain()), is_untyped(right.domain())) {
        (true, true) => (left.typed(&fallback), right.typed(&fallback)),
        (true, false) => {
            let domain = right.domain().clone();
            (left.typed(&domain), right)
        }
        (false, true) => {
            let domain = left.domain().clone();
            (left, right.typed(&domain))
        }
        (false, false) => (left, right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TableMeta;
    use crate::error::ErrorKind;

    fn shop() -> Catalog {
        Catalog::new([
            TableMeta::new("customer")
                .primary_key("id", "INTEGER")
                .column("name", "TEXT"),
            TableMeta::new("order")
                .primary_key("id", "INTEGER")
                .column("code", "TEXT")
                .column("customer_id", "INTEGER")
                .foreign_key("customer_id", "customer"),
            TableMeta::new("item")
                .primary_key("id", "INTEGER")
                .column("order_id", "INTEGER")
                .column("sku", "TEXT")
                .column("qty", "INTEGER")
                .column("price", "REAL")
                .foreign_key("order_id", "order"),
        ])
    }

    #[test]
    fn test_domain_inference() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("item"));
        assert_eq!(scope.bind_source("qty * 2").unwrap().domain(), &Domain::Integer);
        assert_eq!(scope.bind_source("qty / 2").unwrap().domain(), &Domain::Float);
        assert_eq!(scope.bind_source("qty * price").unwrap().domain(), &Domain::Float);
        assert_eq!(scope.bind_source("sku + '-x'").unwrap().domain(), &Domain::Text);
        assert_eq!(
            scope.bind_source("order.customer.name").unwrap().domain(),
            &Domain::Text
        );
    }

    #[test]
    fn test_aggregates_over_plural_paths() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("order"));
        assert_eq!(scope.bind_source("count(item)").unwrap().domain(), &Domain::Integer);
        assert_eq!(scope.bind_source("sum(item.price)").unwrap().domain(), &Domain::Float);
        assert_eq!(scope.bind_source("exists(item)").unwrap().domain(), &Domain::Boolean);

        let err = scope.bind_source("item.sku").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::StructureError(_)));
    }

    #[test]
    fn test_unbound_names() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("order")).with_params(["user"]);
        assert!(matches!(
            scope.bind_source("nope = 1").unwrap_err().kind,
            ErrorKind::UnboundName { .. }
        ));
        assert!(matches!(
            scope.bind_source("$other").unwrap_err().kind,
            ErrorKind::UnboundName { .. }
        ));
        assert!(scope.bind_source("code = $user").is_ok());
    }

    #[test]
    fn test_type_mismatches() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("item"));
        assert!(matches!(
            scope.bind_source("sku - 1").unwrap_err().kind,
            ErrorKind::TypeMismatch { .. }
        ));
        assert!(matches!(
            scope.bind_predicate("qty + 1").unwrap_err().kind,
            ErrorKind::TypeMismatch { .. }
        ));
        assert!(matches!(
            scope.bind_source("qty ~ 'a'").unwrap_err().kind,
            ErrorKind::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_param_takes_partner_domain() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("item")).with_params(["n"]);
        let bound = scope.bind_predicate("qty >= $n").unwrap();
        let Bound::Binary { right, .. } = &bound else {
            panic!("expected a comparison");
        };
        assert_eq!(right.domain(), &Domain::Integer);

        let mut builder = StatementBuilder::new();
        let bindings = Bindings::from([("n".to_string(), "3".to_string())]);
        let sql = bound.to_sql("t0", &mut builder, &bindings).unwrap();
        assert_eq!(sql, "(t0.\"qty\" >= ?1)");
        let plan = builder.finish(sql);
        assert_eq!(plan.params, vec![Some(Scalar::Integer(3))]);
    }

    #[test]
    fn test_missing_parameter_at_emission() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("item")).with_params(["n"]);
        let bound = scope.bind_predicate("qty >= $n").unwrap();
        let err = bound
            .to_sql("t0", &mut StatementBuilder::new(), &Bindings::new())
            .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::MissingParameter { .. }));
    }

    #[test]
    fn test_correlated_subqueries() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("order"));
        let mut builder = StatementBuilder::new();
        let root = builder.alias();

        let count = scope.bind_source("count(item)").unwrap();
        assert_eq!(
            count.to_sql(&root, &mut builder, &Bindings::new()).unwrap(),
            "(SELECT COUNT(*) FROM \"item\" AS t1 WHERE t1.\"order_id\" = t0.\"id\")"
        );

        let name = scope.bind_source("customer.name").unwrap();
        assert_eq!(
            name.to_sql(&root, &mut builder, &Bindings::new()).unwrap(),
            "(SELECT t2.\"name\" FROM \"customer\" AS t2 WHERE t2.\"id\" = t0.\"customer_id\")"
        );
    }

    #[test]
    fn test_null_comparison_uses_is() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("order"));
        let bound = scope.bind_predicate("code = null").unwrap();
        let sql = bound
            .to_sql("t0", &mut StatementBuilder::new(), &Bindings::new())
            .unwrap();
        assert_eq!(sql, "(t0.\"code\" IS NULL)");
    }

    #[test]
    fn test_containment_ignores_case() {
        let catalog = shop();
        let scope = Scope::new(&catalog, Some("order"));
        let bound = scope.bind_predicate("code ~ 'ab'").unwrap();
        let sql = bound
            .to_sql("t0", &mut StatementBuilder::new(), &Bindings::new())
            .unwrap();
        assert_eq!(sql, "(instr(lower(t0.\"code\"), lower(?1)) > 0)");
    }
}
