//! Execution half of the catalog adapter
//!
//! The port never talks to sqlx directly: the compiler hands a [`Plan`] to a
//! [`Transaction`], and the diff/patch engine issues inserts, updates and
//! deletes through the same transaction so that recover, patch and re-query
//! commit or roll back together.

use async_trait::async_trait;

use super::catalog::{Catalog, IdentityMeta};
use crate::error::Result;
use crate::port::value::{Domain, Identity, Scalar};

/// A compiled statement with its positional parameters (`?1`, `?2`, ...).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub sql: String,
    pub params: Vec<Option<Scalar>>,
}

/// One decoded result row; `None` is SQL NULL.
pub type Row = Vec<Option<Scalar>>;

/// Field assignments for insert/update, in column order.
pub type Assignments = [(String, Option<Scalar>)];

/// A store that exposes catalog metadata and runs statements in transactions.
#[async_trait]
pub trait Store: Send + Sync {
    fn catalog(&self) -> &Catalog;

    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Run a query, decoding column `i` of every row with `domains[i]`.
    async fn query(&mut self, plan: &Plan, domains: &[Domain]) -> Result<Vec<Row>>;

    /// Insert a record and return the identity the store assigned.
    async fn insert(
        &mut self,
        table: &str,
        identity: &IdentityMeta,
        fields: &Assignments,
    ) -> Result<Identity>;

    /// Update a record, returning the number of rows touched.
    async fn update(
        &mut self,
        table: &str,
        identity: &IdentityMeta,
        id: &Identity,
        fields: &Assignments,
    ) -> Result<u64>;

    /// Delete a record, returning the number of rows touched.
    async fn delete(&mut self, table: &str, identity: &IdentityMeta, id: &Identity)
    -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
