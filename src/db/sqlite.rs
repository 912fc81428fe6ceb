//! SQLite implementation of the catalog adapter

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Sqlite;
use tracing::debug;

use super::Database;
use super::catalog::{Catalog, IdentityMeta};
use super::sqlite_helpers::{bind_scalar, decode_column, quote_ident};
use super::store::{Assignments, Plan, Row, Store, Transaction};
use crate::error::{PortError, Result};
use crate::port::value::{Domain, Identity, Scalar};

/// Store backed by a SQLite pool, with the catalog introspected at open time.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
    catalog: Arc<Catalog>,
}

impl SqliteStore {
    /// Introspect the database behind `db` and wrap it.
    pub async fn open(db: Database) -> Result<Self> {
        let catalog = Catalog::introspect(db.pool()).await?;
        Ok(Self {
            db,
            catalog: Arc::new(catalog),
        })
    }

    /// Re-read the catalog after DDL changes.
    pub async fn refresh(&mut self) -> Result<()> {
        self.catalog = Arc::new(Catalog::introspect(self.db.pool()).await?);
        Ok(())
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.db.pool().begin().await?;
        Ok(Box::new(SqliteTransaction { tx: Some(tx) }))
    }
}

/// An open sqlx transaction.
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl SqliteTransaction {
    fn active(&mut self) -> Result<&mut sqlx::Transaction<'static, Sqlite>> {
        self.tx
            .as_mut()
            .ok_or_else(|| PortError::structure("transaction already finished"))
    }

    async fn execute(&mut self, sql: &str, values: Vec<Option<Scalar>>) -> Result<u64> {
        debug!(sql = %sql, "Executing statement");
        let tx = self.active()?;
        let mut query = sqlx::query(sql);
        for value in &values {
            query = bind_scalar(query, value.as_ref());
        }
        let result = query.execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn query(&mut self, plan: &Plan, domains: &[Domain]) -> Result<Vec<Row>> {
        debug!(sql = %plan.sql, params = plan.params.len(), "Executing query");
        let tx = self.active()?;
        let mut query = sqlx::query(&plan.sql);
        for value in &plan.params {
            query = bind_scalar(query, value.as_ref());
        }
        let rows = query.fetch_all(&mut **tx).await?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut values = Vec::with_capacity(domains.len());
            for (index, domain) in domains.iter().enumerate() {
                values.push(decode_column(row, index, domain)?);
            }
            decoded.push(values);
        }
        Ok(decoded)
    }

    async fn insert(
        &mut self,
        table: &str,
        identity: &IdentityMeta,
        fields: &Assignments,
    ) -> Result<Identity> {
        let sql = if fields.is_empty() {
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                quote_ident(table),
                quote_ident(&identity.column)
            )
        } else {
            let columns: Vec<String> = fields.iter().map(|(c, _)| quote_ident(c)).collect();
            let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("?{}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                quote_ident(table),
                columns.join(", "),
                placeholders.join(", "),
                quote_ident(&identity.column)
            )
        };
        debug!(sql = %sql, "Executing insert");

        let tx = self.active()?;
        let mut query = sqlx::query(&sql);
        for (_, value) in fields {
            query = bind_scalar(query, value.as_ref());
        }
        let row = query.fetch_one(&mut **tx).await?;
        decode_column(&row, 0, &identity.domain)?
            .and_then(|scalar| scalar.to_identity())
            .ok_or_else(|| {
                PortError::structure(format!("insert into `{}` returned no identity", table))
            })
    }

    async fn update(
        &mut self,
        table: &str,
        identity: &IdentityMeta,
        id: &Identity,
        fields: &Assignments,
    ) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }
        let assignments: Vec<String> = fields
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", quote_ident(c), i + 1))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            quote_ident(table),
            assignments.join(", "),
            quote_ident(&identity.column),
            fields.len() + 1
        );
        let mut values: Vec<_> = fields.iter().map(|(_, v)| v.clone()).collect();
        values.push(Some(id.to_scalar()));
        self.execute(&sql, values).await
    }

    async fn delete(
        &mut self,
        table: &str,
        identity: &IdentityMeta,
        id: &Identity,
    ) -> Result<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(table),
            quote_ident(&identity.column)
        );
        self.execute(&sql, vec![Some(id.to_scalar())]).await
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
