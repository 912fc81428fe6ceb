//! Operator implementations per node kind
//!
//! The table is built once and keyed by `(NodeKind, operator)`. Custom
//! filters declared on entities are looked up by the compiler after this
//! table misses.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use super::builder::StatementBuilder;
use super::tree::NodeKind;
use super::value::{Domain, Scalar};
use crate::error::{PortError, Result};

/// What one constraint contributes to a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Predicate on the rows of the enclosing statement
    Filter(String),
    /// `ORDER BY` term
    Sort(String),
    Top(i64),
    Skip(i64),
    /// Existence of the constrained entity under its parent (`false` negates)
    Exists(bool),
}

/// The value a constraint applies to.
#[derive(Debug, Clone)]
pub struct Operand {
    pub kind: NodeKind,
    /// SQL of the constrained value: a column, an expression or an entity identity
    pub sql: String,
    pub domain: Domain,
    pub plural: bool,
}

type OperatorFn = fn(&Operand, &[String], &mut StatementBuilder) -> Result<Condition>;

/// Operator names that filters and parameters may not reuse.
pub const RESERVED: &[&str] = &[
    "eq", "ne", "null", "lt", "le", "gt", "ge", "contains", "sort", "exists", "top", "skip",
    "format",
];

static OPERATORS: Lazy<HashMap<(NodeKind, &'static str), OperatorFn>> = Lazy::new(|| {
    let mut table: HashMap<(NodeKind, &'static str), OperatorFn> = HashMap::new();

    for kind in [NodeKind::Column, NodeKind::Expression] {
        table.insert((kind, "eq"), equal);
        table.insert((kind, "ne"), not_equal);
        table.insert((kind, "null"), null_test);
        table.insert((kind, "lt"), less);
        table.insert((kind, "le"), less_or_equal);
        table.insert((kind, "gt"), greater);
        table.insert((kind, "ge"), greater_or_equal);
        table.insert((kind, "contains"), contains);
        table.insert((kind, "sort"), sort);
    }

    for kind in [NodeKind::Trunk, NodeKind::Branch, NodeKind::Facet] {
        table.insert((kind, "eq"), equal);
        table.insert((kind, "exists"), entity_exists);
        table.insert((kind, "top"), top);
        table.insert((kind, "skip"), skip);
    }

    table.insert((NodeKind::Link, "eq"), equal);
    table.insert((NodeKind::Link, "exists"), link_exists);

    table
});

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

/// Whether `operator` is built in for `kind`.
pub fn supports(kind: NodeKind, operator: &str) -> bool {
    OPERATORS.contains_key(&(kind, operator))
}

/// Apply a built-in operator.
pub fn apply(
    operand: &Operand,
    operator: &str,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    let function = OPERATORS
        .get(&(operand.kind, operator))
        .ok_or_else(|| PortError::unsupported(operator, operand.kind))?;
    function(operand, arguments, builder)
}

// ============================================================================
// Argument helpers
// ============================================================================

fn single<'a>(operator: &str, arguments: &'a [String]) -> Result<&'a str> {
    match arguments {
        [one] => Ok(one),
        _ => Err(PortError::argument(format!(
            "`{}` takes exactly one value, got {}",
            operator,
            arguments.len()
        ))),
    }
}

fn flag(operator: &str, arguments: &[String]) -> Result<bool> {
    match Domain::Boolean.parse(single(operator, arguments)?)? {
        Scalar::Bool(b) => Ok(b),
        _ => Err(PortError::argument(format!("`{}` expects true or false", operator))),
    }
}

fn count(operator: &str, arguments: &[String]) -> Result<i64> {
    let raw = single(operator, arguments)?;
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| {
            PortError::argument(format!(
                "`{}` expects a non-negative integer, got `{}`",
                operator, raw
            ))
        })
}

fn placeholders(
    operand: &Operand,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Vec<String>> {
    if arguments.is_empty() {
        return Err(PortError::argument("at least one value is required"));
    }
    arguments
        .iter()
        .map(|raw| Ok(builder.param(Some(operand.domain.parse(raw)?))))
        .collect()
}

fn compare(
    operand: &Operand,
    symbol: &str,
    operator: &str,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    if !operand.domain.is_ordered() {
        return Err(PortError::type_mismatch("ordered domain", &operand.domain));
    }
    let value = operand.domain.parse(single(operator, arguments)?)?;
    Ok(Condition::Filter(format!(
        "{} {} {}",
        operand.sql,
        symbol,
        builder.param(Some(value))
    )))
}

// ============================================================================
// Scalar operators
// ============================================================================

fn equal(operand: &Operand, arguments: &[String], builder: &mut StatementBuilder) -> Result<Condition> {
    let values = placeholders(operand, arguments, builder)?;
    Ok(Condition::Filter(match values.as_slice() {
        [one] => format!("{} = {}", operand.sql, one),
        many => format!("{} IN ({})", operand.sql, many.join(", ")),
    }))
}

fn not_equal(
    operand: &Operand,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    let values = placeholders(operand, arguments, builder)?;
    Ok(Condition::Filter(match values.as_slice() {
        [one] => format!("{} <> {}", operand.sql, one),
        many => format!("{} NOT IN ({})", operand.sql, many.join(", ")),
    }))
}

fn null_test(operand: &Operand, arguments: &[String], _: &mut StatementBuilder) -> Result<Condition> {
    let is_null = flag("null", arguments)?;
    Ok(Condition::Filter(format!(
        "{} IS {}NULL",
        operand.sql,
        if is_null { "" } else { "NOT " }
    )))
}

fn less(operand: &Operand, arguments: &[String], builder: &mut StatementBuilder) -> Result<Condition> {
    compare(operand, "<", "lt", arguments, builder)
}

fn less_or_equal(
    operand: &Operand,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    compare(operand, "<=", "le", arguments, builder)
}

fn greater(
    operand: &Operand,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    compare(operand, ">", "gt", arguments, builder)
}

fn greater_or_equal(
    operand: &Operand,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    compare(operand, ">=", "ge", arguments, builder)
}

fn contains(
    operand: &Operand,
    arguments: &[String],
    builder: &mut StatementBuilder,
) -> Result<Condition> {
    if !matches!(operand.domain, Domain::Text | Domain::Date) {
        return Err(PortError::type_mismatch("text", &operand.domain));
    }
    if arguments.is_empty() {
        return Err(PortError::argument("`contains` requires a value"));
    }
    let terms: Vec<String> = arguments
        .iter()
        .map(|needle| {
            format!(
                "instr(lower({}), lower({})) > 0",
                operand.sql,
                builder.param(Some(Scalar::Text(needle.clone())))
            )
        })
        .collect();
    Ok(Condition::Filter(if terms.len() == 1 {
        terms.join("")
    } else {
        format!("({})", terms.join(" OR "))
    }))
}

fn sort(operand: &Operand, arguments: &[String], _: &mut StatementBuilder) -> Result<Condition> {
    let direction = match single("sort", arguments)?.to_ascii_lowercase().as_str() {
        "asc" => "ASC",
        "desc" => "DESC",
        other => {
            return Err(PortError::argument(format!(
                "sort direction must be asc or desc, got `{}`",
                other
            )));
        }
    };
    Ok(Condition::Sort(format!("{} {}", operand.sql, direction)))
}

// ============================================================================
// Entity and link operators
// ============================================================================

fn entity_exists(
    operand: &Operand,
    arguments: &[String],
    _: &mut StatementBuilder,
) -> Result<Condition> {
    if operand.kind == NodeKind::Trunk {
        return Err(PortError::structure(
            "`exists` needs an enclosing entity; trunks have none",
        ));
    }
    Ok(Condition::Exists(flag("exists", arguments)?))
}

fn link_exists(
    operand: &Operand,
    arguments: &[String],
    _: &mut StatementBuilder,
) -> Result<Condition> {
    let present = flag("exists", arguments)?;
    Ok(Condition::Filter(format!(
        "{} IS {}NULL",
        operand.sql,
        if present { "NOT " } else { "" }
    )))
}

fn paginate(operand: &Operand, operator: &str) -> Result<()> {
    if operand.plural {
        Ok(())
    } else {
        Err(PortError::structure(format!(
            "`{}` applies to plural nodes only; this {} is singular",
            operator, operand.kind
        )))
    }
}

fn top(operand: &Operand, arguments: &[String], _: &mut StatementBuilder) -> Result<Condition> {
    paginate(operand, "top")?;
    Ok(Condition::Top(count("top", arguments)?))
}

fn skip(operand: &Operand, arguments: &[String], _: &mut StatementBuilder) -> Result<Condition> {
    paginate(operand, "skip")?;
    Ok(Condition::Skip(count("skip", arguments)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn column(domain: Domain) -> Operand {
        Operand {
            kind: NodeKind::Column,
            sql: "t0.\"x\"".into(),
            domain,
            plural: false,
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_equality_single_and_multi() {
        let mut builder = StatementBuilder::new();
        let operand = column(Domain::Integer);
        let one = apply(&operand, "eq", &args(&["1"]), &mut builder).unwrap();
        assert_eq!(one, Condition::Filter("t0.\"x\" = ?1".into()));
        let many = apply(&operand, "eq", &args(&["2", "3"]), &mut builder).unwrap();
        assert_eq!(many, Condition::Filter("t0.\"x\" IN (?2, ?3)".into()));
    }

    #[test]
    fn test_argument_domain_mismatch() {
        let err = apply(
            &column(Domain::Integer),
            "eq",
            &args(&["seven"]),
            &mut StatementBuilder::new(),
        )
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ArgumentError(_)));
    }

    #[test]
    fn test_ordered_comparison_needs_ordered_domain() {
        let err = apply(
            &column(Domain::Boolean),
            "lt",
            &args(&["true"]),
            &mut StatementBuilder::new(),
        )
        .unwrap_err();
        assert!(matches!(err.kind, ErrorKind::TypeMismatch { .. }));
    }

    #[test]
    fn test_unsupported_operator_for_kind() {
        let operand = Operand {
            kind: NodeKind::Link,
            sql: "t0.\"customer_id\"".into(),
            domain: Domain::identity("customer", Domain::Integer),
            plural: false,
        };
        let err = apply(&operand, "sort", &args(&["asc"]), &mut StatementBuilder::new()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnsupportedOperator { .. }));
        assert!(!supports(NodeKind::Link, "contains"));
        assert!(supports(NodeKind::Branch, "top"));
    }

    #[test]
    fn test_pagination_rules() {
        let mut builder = StatementBuilder::new();
        let mut entity = Operand {
            kind: NodeKind::Branch,
            sql: "t0.\"id\"".into(),
            domain: Domain::Integer,
            plural: true,
        };
        assert_eq!(
            apply(&entity, "top", &args(&["2"]), &mut builder).unwrap(),
            Condition::Top(2)
        );
        assert!(matches!(
            apply(&entity, "skip", &args(&["-1"]), &mut builder).unwrap_err().kind,
            ErrorKind::ArgumentError(_)
        ));
        entity.kind = NodeKind::Facet;
        entity.plural = false;
        assert!(matches!(
            apply(&entity, "top", &args(&["2"]), &mut builder).unwrap_err().kind,
            ErrorKind::StructureError(_)
        ));
    }

    #[test]
    fn test_exists_on_trunk_is_structural() {
        let trunk = Operand {
            kind: NodeKind::Trunk,
            sql: "t0.\"id\"".into(),
            domain: Domain::Integer,
            plural: true,
        };
        let err = apply(&trunk, "exists", &args(&["true"]), &mut StatementBuilder::new()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::StructureError(_)));
    }

    #[test]
    fn test_sort_and_contains() {
        let mut builder = StatementBuilder::new();
        let operand = column(Domain::Text);
        assert_eq!(
            apply(&operand, "sort", &args(&["DESC"]), &mut builder).unwrap(),
            Condition::Sort("t0.\"x\" DESC".into())
        );
        assert_eq!(
            apply(&operand, "contains", &args(&["ab"]), &mut builder).unwrap(),
            Condition::Filter("instr(lower(t0.\"x\"), lower(?1)) > 0".into())
        );
    }
}
