//! DiffPatchEngine, second half: recover, patch, restrict + re-query
//!
//! All three steps share one transaction. Recover checks the caller's view of
//! every old record against the store (optimistic concurrency), patch applies
//! the paired writes in order, and the re-query reads back exactly the records
//! the new payload describes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde_json::Value as Json;
use tracing::{debug, info, warn};

use super::compiler::Compiled;
use super::constraint::{Constraint, ConstraintSet};
use super::diff::{self, Cell, Matched, Pair};
use super::tree::SchemaTree;
use super::value::{CellValue, Identity, Scalar, Value};
use crate::db::sqlite_helpers::{identities_to_json, json_array_in_sql, qualified, quote_ident};
use crate::db::{Catalog, Plan, Store, Transaction};
use crate::error::{PortError, Result, ResultExt};

/// Which old-side fields Recover compares with stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Every field the caller declared in the old payload
    #[default]
    AllDeclared,
    /// Only declared fields the new payload changes
    ChangedOnly,
}

impl FromStr for ConflictPolicy {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "all" | "all_declared" => Ok(ConflictPolicy::AllDeclared),
            "changed" | "changed_only" => Ok(ConflictPolicy::ChangedOnly),
            _ => Err(PortError::argument(format!("unknown conflict policy `{}`", s))),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::AllDeclared => f.write_str("all"),
            ConflictPolicy::ChangedOnly => f.write_str("changed"),
        }
    }
}

/// What a patch did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Identities present on the new side after patching, per entity node path
    pub affected: BTreeMap<String, Vec<Identity>>,
}

// ============================================================================
// Recover
// ============================================================================

/// Refresh every old cell that takes part in an update or delete. Declared
/// fields must agree with the store; `Unset` fields are filled in from it.
pub async fn recover(
    tx: &mut dyn Transaction,
    catalog: &Catalog,
    matched: &mut Matched,
    policy: ConflictPolicy,
) -> Result<()> {
    let mut counterpart: HashMap<usize, Option<usize>> = HashMap::new();
    let mut by_table: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for pair in &matched.pairs {
        let (old, new) = match *pair {
            Pair::Update { old, new } => (old, Some(new)),
            Pair::Delete { old } => (old, None),
            Pair::Insert { .. } => continue,
        };
        counterpart.insert(old, new);
        by_table
            .entry(matched.olds[old].table.clone())
            .or_default()
            .push(old);
    }

    for (table, indices) in by_table {
        let stored = fetch_current(tx, catalog, &table, &matched.olds, &indices).await?;
        for old in indices {
            let new = counterpart.get(&old).copied().flatten();
            let checked = checked_columns(&matched.olds[old], new.map(|n| &matched.news[n]), policy);
            let cell = &mut matched.olds[old];
            let identity = cell
                .identity
                .clone()
                .ok_or_else(|| PortError::argument(format!("old record `{}` has no identity", cell.path)))?;

            let Some(current) = stored.get(&identity) else {
                warn!(table = %table, identity = %identity, "Record vanished before write");
                return Err(PortError::conflict(&table, &identity, "record no longer exists")
                    .context(format!("recovering `{}`", cell.path)));
            };

            for column in checked {
                let now = current.get(&column).cloned().unwrap_or(CellValue::Null);
                if !cell.field(&column).agrees_with(&now) {
                    warn!(table = %table, identity = %identity, column = %column, "Stale field");
                    return Err(PortError::conflict(
                        &table,
                        &identity,
                        format!("`{}` is {} in the store, {} in the old payload", column, now, cell.field(&column)),
                    )
                    .context(format!("recovering `{}`", cell.path)));
                }
            }

            for (column, value) in current {
                if cell.field(column).is_unset() {
                    cell.fields.insert(column.clone(), value.clone());
                }
            }
        }
    }
    Ok(())
}

fn checked_columns(old: &Cell, new: Option<&Cell>, policy: ConflictPolicy) -> Vec<String> {
    let declared = old
        .fields
        .iter()
        .filter(|(_, value)| !value.is_unset())
        .map(|(column, _)| column);
    match (policy, new) {
        (ConflictPolicy::AllDeclared, _) => declared.cloned().collect(),
        (ConflictPolicy::ChangedOnly, None) => Vec::new(),
        (ConflictPolicy::ChangedOnly, Some(new)) => declared
            .filter(|column| {
                let next = new.field(column);
                !next.is_unset() && !next.agrees_with(old.field(column))
            })
            .cloned()
            .collect(),
    }
}

/// Current values of every catalog column for the given old cells.
async fn fetch_current(
    tx: &mut dyn Transaction,
    catalog: &Catalog,
    table: &str,
    olds: &[Cell],
    indices: &[usize],
) -> Result<HashMap<Identity, BTreeMap<String, CellValue>>> {
    let meta = catalog.describe_table(table)?;
    let identity = meta.identity()?;
    let ids: Vec<Identity> = indices.iter().filter_map(|&i| olds[i].identity.clone()).collect();

    let alias = "t0";
    let mut columns = vec![qualified(alias, &identity.column)];
    let mut domains = vec![identity.domain.clone()];
    let mut names = Vec::new();
    for column in meta.columns.iter().filter(|c| c.name != identity.column) {
        columns.push(qualified(alias, &column.name));
        domains.push(column.domain.clone());
        names.push(column.name.clone());
    }
    let plan = Plan {
        sql: format!(
            "SELECT {} FROM {} AS {} WHERE {}",
            columns.join(", "),
            quote_ident(table),
            alias,
            json_array_in_sql(&qualified(alias, &identity.column), "?1")
        ),
        params: vec![Some(Scalar::Text(identities_to_json(&ids)))],
    };
    debug!(table = %table, records = ids.len(), "Recovering stored state");

    let mut current = HashMap::new();
    for row in tx.query(&plan, &domains).await? {
        let mut values = row.into_iter();
        let Some(id) = values.next().flatten().and_then(|s| s.to_identity()) else {
            continue;
        };
        let fields = names
            .iter()
            .cloned()
            .zip(values.map(CellValue::from_stored))
            .collect();
        current.insert(id, fields);
    }
    Ok(current)
}

// ============================================================================
// Patch
// ============================================================================

/// Execute the paired writes in order. New cells that reference records
/// inserted earlier receive their freshly assigned identities.
pub async fn patch(tx: &mut dyn Transaction, matched: &Matched) -> Result<Outcome> {
    let mut assigned: Vec<Option<Identity>> = matched.news.iter().map(|c| c.identity.clone()).collect();
    let mut outcome = Outcome::default();

    for pair in &matched.pairs {
        match *pair {
            Pair::Insert { new } => {
                let cell = &matched.news[new];
                let fields = assignments(cell, None, &assigned, &matched.news)
                    .with_context(|| format!("inserting `{}`", cell.path))?;
                let id = tx
                    .insert(&cell.table, &cell.identity_meta, &fields)
                    .await
                    .with_context(|| format!("inserting `{}`", cell.path))?;
                debug!(table = %cell.table, identity = %id, "Inserted record");
                assigned[new] = Some(id);
                outcome.inserted += 1;
            }
            Pair::Update { old, new } => {
                let cell = &matched.news[new];
                let fields = assignments(cell, Some(&matched.olds[old]), &assigned, &matched.news)
                    .with_context(|| format!("updating `{}`", cell.path))?;
                if fields.is_empty() {
                    continue;
                }
                let id = cell
                    .identity
                    .as_ref()
                    .ok_or_else(|| PortError::structure(format!("`{}` has no identity", cell.path)))?;
                let touched = tx
                    .update(&cell.table, &cell.identity_meta, id, &fields)
                    .await
                    .with_context(|| format!("updating `{}`", cell.path))?;
                if touched == 0 {
                    warn!(table = %cell.table, identity = %id, "Update touched no rows");
                    return Err(PortError::conflict(&cell.table, id, "record no longer exists"));
                }
                outcome.updated += 1;
            }
            Pair::Delete { old } => {
                let cell = &matched.olds[old];
                let id = cell
                    .identity
                    .as_ref()
                    .ok_or_else(|| PortError::structure(format!("`{}` has no identity", cell.path)))?;
                let touched = tx
                    .delete(&cell.table, &cell.identity_meta, id)
                    .await
                    .with_context(|| format!("deleting `{}`", cell.path))?;
                if touched == 0 {
                    warn!(table = %cell.table, identity = %id, "Delete touched no rows");
                    return Err(PortError::conflict(&cell.table, id, "record already deleted"));
                }
                outcome.deleted += 1;
            }
        }
    }

    for (cell, id) in matched.news.iter().zip(assigned) {
        if let Some(id) = id {
            outcome.affected.entry(cell.node.clone()).or_default().push(id);
        }
    }
    Ok(outcome)
}

/// Field assignments of `cell`, minus those already equal on the old side.
fn assignments(
    cell: &Cell,
    old: Option<&Cell>,
    assigned: &[Option<Identity>],
    news: &[Cell],
) -> Result<Vec<(String, Option<Scalar>)>> {
    let unchanged = |column: &str, value: &CellValue| old.is_some_and(|o| o.field(column).agrees_with(value));
    let mut fields = Vec::new();

    for (column, value) in &cell.fields {
        let scalar = match value {
            CellValue::Unset => continue,
            CellValue::Null => None,
            CellValue::Value(v) => Some(v.clone()),
        };
        if !unchanged(column, value) {
            fields.push((column.clone(), scalar));
        }
    }

    for (column, &target) in &cell.references {
        let id = assigned[target]
            .as_ref()
            .ok_or_else(|| PortError::dangling(news[target].path.clone()))?;
        let value = CellValue::Value(id.to_scalar());
        if !unchanged(column, &value) {
            fields.push((column.clone(), Some(id.to_scalar())));
        }
    }
    Ok(fields)
}

// ============================================================================
// Restrict + re-query
// ============================================================================

/// Constraints selecting exactly the affected records of every plural node;
/// plural nodes without any get `top=0`.
pub fn restriction(tree: &SchemaTree, affected: &BTreeMap<String, Vec<Identity>>) -> Result<ConstraintSet> {
    let mut set = ConstraintSet::new();
    for path in tree.entity_paths() {
        if !tree.node(&path)?.is_plural() {
            continue;
        }
        let key = path.join(".");
        let constraint = match affected.get(&key) {
            Some(ids) if !ids.is_empty() => {
                Constraint::new(&key, "eq", ids.iter().map(Identity::to_string).collect())
            }
            _ => Constraint::new(&key, "top", vec!["0".to_string()]),
        };
        set.push(constraint);
    }
    Ok(set)
}

/// Apply `old -> new` and return the post-write state of `new`'s records.
/// `bindings` holds root-level constraints (`:name=value`) for the parameters
/// the re-query needs.
pub async fn replace(
    store: &dyn Store,
    tree: &SchemaTree,
    old: Option<&Json>,
    new: Option<&Json>,
    bindings: &ConstraintSet,
    policy: ConflictPolicy,
) -> Result<Value> {
    if let Some(constraint) = bindings.iter().find(|c| !c.is_root_level()) {
        return Err(PortError::argument(format!(
            "`{}` is not a root-level binding",
            constraint
        )));
    }
    let mut matched = diff::diff(tree, old, new)?;
    // unresolvable parameters fail here, before anything is written
    Compiled::new(tree, bindings).context("binding parameters")?;

    let mut tx = store.begin().await?;
    match write(tx.as_mut(), store.catalog(), tree, &mut matched, bindings, policy).await {
        Ok(data) => {
            tx.commit().await?;
            Ok(data)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}

async fn write(
    tx: &mut dyn Transaction,
    catalog: &Catalog,
    tree: &SchemaTree,
    matched: &mut Matched,
    bindings: &ConstraintSet,
    policy: ConflictPolicy,
) -> Result<Value> {
    recover(tx, catalog, matched, policy).await?;
    let outcome = patch(tx, matched).await?;
    info!(
        inserted = outcome.inserted,
        updated = outcome.updated,
        deleted = outcome.deleted,
        "Applied write"
    );
    let mut set = restriction(tree, &outcome.affected)?;
    for binding in bindings.iter() {
        set.push(binding.clone());
    }
    Compiled::new(tree, &set)?.execute(tx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{IdentityMeta, TableMeta};
    use crate::port::value::Domain;
    use crate::port::grow::{EntityDirective, GrowBuilder};
    use pretty_assertions::assert_eq;

    fn cell(path: &str, id: Option<i64>, fields: &[(&str, CellValue)]) -> Cell {
        Cell {
            node: "order".into(),
            path: path.into(),
            table: "order".into(),
            identity_meta: IdentityMeta {
                column: "id".into(),
                domain: Domain::Integer,
            },
            identity: id.map(Identity::Integer),
            singular: false,
            fields: fields.iter().map(|(c, v)| (c.to_string(), v.clone())).collect(),
            references: BTreeMap::new(),
        }
    }

    fn text(s: &str) -> CellValue {
        CellValue::Value(Scalar::Text(s.into()))
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("all".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::AllDeclared);
        assert_eq!("Changed".parse::<ConflictPolicy>().unwrap(), ConflictPolicy::ChangedOnly);
        assert!("some".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::default().to_string(), "all");
    }

    #[test]
    fn test_checked_columns_by_policy() {
        let old = cell("order.0", Some(1), &[("code", text("A")), ("note", text("n"))]);
        let new = cell("order.0", Some(1), &[("code", text("B")), ("note", text("n"))]);

        let mut all = checked_columns(&old, Some(&new), ConflictPolicy::AllDeclared);
        all.sort();
        assert_eq!(all, vec!["code", "note"]);
        assert_eq!(checked_columns(&old, Some(&new), ConflictPolicy::ChangedOnly), vec!["code"]);
        assert!(checked_columns(&old, None, ConflictPolicy::ChangedOnly).is_empty());
    }

    #[test]
    fn test_assignments_skip_unchanged_and_unset() {
        let old = cell("order.0", Some(1), &[("code", text("A")), ("note", CellValue::Null)]);
        let new = cell(
            "order.0",
            Some(1),
            &[("code", text("A")), ("note", text("x")), ("extra", CellValue::Unset)],
        );
        let fields = assignments(&new, Some(&old), &[Some(Identity::Integer(1))], &[new.clone()]).unwrap();
        assert_eq!(fields, vec![("note".to_string(), Some(Scalar::Text("x".into())))]);
    }

    #[test]
    fn test_forward_reference_is_dangling() {
        let mut child = cell("order.0", None, &[]);
        child.references.insert("parent_id".into(), 1);
        let target = cell("order.1", None, &[]);
        let err = assignments(&child, None, &[None, None], &[child.clone(), target]).unwrap_err();
        assert!(matches!(err.kind, crate::error::ErrorKind::DanglingReference { ref reference } if reference == "order.1"));
    }

    #[test]
    fn test_restriction_matches_nothing_without_ids() {
        let catalog = Catalog::new([
            TableMeta::new("order").primary_key("id", "INTEGER"),
            TableMeta::new("item")
                .primary_key("id", "INTEGER")
                .column("order_id", "INTEGER")
                .foreign_key("order_id", "order"),
        ]);
        let tree = GrowBuilder::new(&catalog)
            .grow(
                &SchemaTree::new(),
                &[EntityDirective::new("", "order")
                    .nest(EntityDirective::new("", "item"))
                    .into()],
            )
            .unwrap();
        let mut affected = BTreeMap::new();
        affected.insert("order".to_string(), vec![Identity::Integer(7)]);
        let set = restriction(&tree, &affected).unwrap();
        let rendered: Vec<(String, Vec<String>)> =
            set.iter().map(|c| (c.to_string(), c.arguments.clone())).collect();
        assert_eq!(
            rendered,
            vec![
                ("order:eq".to_string(), vec!["7".to_string()]),
                ("order.item:top".to_string(), vec!["0".to_string()]),
            ]
        );
    }
}
