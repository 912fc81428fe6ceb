//! Catalog metadata: tables, columns, relationships and identities
//!
//! This is the metadata half of the catalog adapter. It is introspected once
//! from SQLite (`PRAGMA table_info`, `foreign_key_list`, `index_list`) and then
//! shared immutably; the schema tree builder classifies names against the
//! [`Label`]s it derives.

use std::collections::BTreeMap;

use sqlx::SqlitePool;
use tracing::debug;

use super::sqlite_helpers::quote_ident;
use crate::error::{PortError, Result};
use crate::port::value::Domain;

/// A plain column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    /// Declared SQL type as written in the DDL
    pub declared_type: String,
    pub domain: Domain,
    pub nullable: bool,
    /// Primary key or covered by a single-column unique index
    pub unique: bool,
}

/// A direct relationship: `column` holds the identity of a `target_table` record.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub target_table: String,
    pub target_column: Option<String>,
}

/// The identity column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMeta {
    pub column: String,
    pub domain: Domain,
}

/// Everything the port needs to know about one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    pub foreign_keys: Vec<ForeignKey>,
    primary_key: Vec<String>,
}

impl TableMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    /// Add a nullable column.
    pub fn column(mut self, name: &str, declared_type: &str) -> Self {
        self.columns.push(ColumnMeta {
            name: name.to_string(),
            declared_type: declared_type.to_string(),
            domain: Domain::from_declared_type(declared_type),
            nullable: true,
            unique: false,
        });
        self
    }

    /// Add a primary-key column.
    pub fn primary_key(mut self, name: &str, declared_type: &str) -> Self {
        self = self.column(name, declared_type);
        if let Some(col) = self.columns.last_mut() {
            col.nullable = false;
            col.unique = true;
        }
        self.primary_key.push(name.to_string());
        self
    }

    /// Mark a column NOT NULL.
    pub fn not_null(mut self, name: &str) -> Self {
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            col.nullable = false;
        }
        self
    }

    /// Mark a column unique.
    pub fn unique(mut self, name: &str) -> Self {
        if let Some(col) = self.columns.iter_mut().find(|c| c.name == name) {
            col.unique = true;
        }
        self
    }

    /// Declare `column` as a foreign key to the identity of `target_table`.
    pub fn foreign_key(mut self, column: &str, target_table: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            target_table: target_table.to_string(),
            target_column: None,
        });
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn foreign_key_for(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// The single identity column; `rowid` when the table declares no key.
    pub fn identity(&self) -> Result<IdentityMeta> {
        let column = match self.primary_key.as_slice() {
            [] => {
                return Ok(IdentityMeta {
                    column: "rowid".to_string(),
                    domain: Domain::Integer,
                });
            }
            [single] => single,
            _ => {
                return Err(PortError::structure(format!(
                    "table `{}` has a composite key; only single-column identities are supported",
                    self.name
                )));
            }
        };
        let meta = self
            .find_column(column)
            .ok_or_else(|| PortError::unknown_attribute(column.clone()))?;
        match meta.domain {
            Domain::Integer | Domain::Text => Ok(IdentityMeta {
                column: column.clone(),
                domain: meta.domain.clone(),
            }),
            ref other => Err(PortError::type_mismatch("integer or text identity", other)),
        }
    }

    fn is_identity_column(&self, name: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == name)
    }

    /// Label under which a foreign key column is exposed.
    fn link_label(&self, fk: &ForeignKey) -> String {
        let stripped = fk
            .column
            .strip_suffix("_id")
            .filter(|s| !s.is_empty() && self.find_column(s).is_none());
        stripped.unwrap_or(&fk.column).to_string()
    }
}

/// A name visible in the scope of a table.
#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    /// The identity column (`id` or its own name)
    Identity { name: String, column: String, domain: Domain },
    /// A plain column
    Column { name: String, column: ColumnMeta },
    /// A direct relationship held by `column`
    Link {
        name: String,
        column: String,
        target: String,
        nullable: bool,
    },
    /// A reverse relationship: records of `table` whose `column` points here
    Reverse {
        name: String,
        table: String,
        column: String,
        plural: bool,
    },
}

impl Label {
    pub fn name(&self) -> &str {
        match self {
            Label::Identity { name, .. }
            | Label::Column { name, .. }
            | Label::Link { name, .. }
            | Label::Reverse { name, .. } => name,
        }
    }
}

/// Metadata of every table in the store.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: BTreeMap<String, TableMeta>,
}

impl Catalog {
    pub fn new(tables: impl IntoIterator<Item = TableMeta>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
        }
    }

    /// Look up a table by name.
    pub fn describe_table(&self, name: &str) -> Result<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| PortError::unknown_attribute(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// All labels of a table in catalog order: columns and links in column
    /// order, then reverse relationships by referencing table name.
    pub fn labels(&self, table: &str) -> Result<Vec<Label>> {
        let meta = self.describe_table(table)?;
        let mut labels = Vec::new();

        for column in &meta.columns {
            if meta.is_identity_column(&column.name) {
                continue;
            }
            match meta.foreign_key_for(&column.name) {
                Some(fk) => labels.push(Label::Link {
                    name: meta.link_label(fk),
                    column: column.name.clone(),
                    target: fk.target_table.clone(),
                    nullable: column.nullable,
                }),
                None => labels.push(Label::Column {
                    name: column.name.clone(),
                    column: column.clone(),
                }),
            }
        }

        for other in self.tables.values() {
            let incoming: Vec<&ForeignKey> = other
                .foreign_keys
                .iter()
                .filter(|fk| fk.target_table == table)
                .collect();
            for fk in &incoming {
                let name = if incoming.len() == 1 {
                    other.name.clone()
                } else {
                    format!("{}_via_{}", other.name, other.link_label(fk))
                };
                let unique = other.find_column(&fk.column).is_some_and(|c| c.unique);
                labels.push(Label::Reverse {
                    name,
                    table: other.name.clone(),
                    column: fk.column.clone(),
                    plural: !unique,
                });
            }
        }

        Ok(labels)
    }

    /// Resolve one label of a table, including the identity aliases.
    pub fn label(&self, table: &str, name: &str) -> Result<Option<Label>> {
        let meta = self.describe_table(table)?;
        if let Ok(identity) = meta.identity() {
            if name == "id" || name == identity.column {
                return Ok(Some(Label::Identity {
                    name: name.to_string(),
                    column: identity.column,
                    domain: identity.domain,
                }));
            }
        }
        Ok(self.labels(table)?.into_iter().find(|l| l.name() == name))
    }

    /// Introspect every user table of a SQLite database.
    pub async fn introspect(pool: &SqlitePool) -> Result<Self> {
        let names: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(pool)
        .await?;

        let mut tables = Vec::with_capacity(names.len());
        for (name,) in names {
            tables.push(introspect_table(pool, &name).await?);
        }
        debug!(tables = tables.len(), "Catalog introspected");
        Ok(Self::new(tables))
    }
}

/// Read columns, keys and unique indexes of one table.
async fn introspect_table(pool: &SqlitePool, table: &str) -> Result<TableMeta> {
    let quoted = quote_ident(table);
    let mut meta = TableMeta::new(table);

    let columns: Vec<(i64, String, String, i64, Option<String>, i64)> =
        sqlx::query_as(&format!("PRAGMA table_info({})", quoted))
            .fetch_all(pool)
            .await?;
    let mut keyed: Vec<(i64, String)> = Vec::new();
    for (_, name, declared_type, notnull, _, pk) in columns {
        meta = meta.column(&name, &declared_type);
        if notnull != 0 {
            meta = meta.not_null(&name);
        }
        if pk > 0 {
            keyed.push((pk, name));
        }
    }
    keyed.sort();
    for (_, name) in &keyed {
        meta.primary_key.push(name.clone());
        if keyed.len() == 1 {
            meta = meta.unique(name);
        }
    }

    let fks: Vec<(i64, i64, String, String, Option<String>, String, String, String)> =
        sqlx::query_as(&format!("PRAGMA foreign_key_list({})", quoted))
            .fetch_all(pool)
            .await?;
    for (_, _, target_table, column, target_column, _, _, _) in fks {
        meta.foreign_keys.push(ForeignKey {
            column,
            target_table,
            target_column,
        });
    }

    let indexes: Vec<(i64, String, i64, String, i64)> =
        sqlx::query_as(&format!("PRAGMA index_list({})", quoted))
            .fetch_all(pool)
            .await?;
    for (_, index, unique, _, partial) in indexes {
        if unique == 0 || partial != 0 {
            continue;
        }
        let covered: Vec<(i64, i64, Option<String>)> =
            sqlx::query_as(&format!("PRAGMA index_info({})", quote_ident(&index)))
                .fetch_all(pool)
                .await?;
        if let [(_, _, Some(column))] = covered.as_slice() {
            meta = meta.unique(column);
        }
    }

    Ok(meta)
}
