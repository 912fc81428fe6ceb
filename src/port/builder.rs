//! SQL statement builder for compiled entity nodes
//!
//! Builds parameterized SELECT statements with numbered `?N` placeholders so
//! that fragments (masks, filters, correlated subqueries) can be emitted in any
//! order and still bind the right values.

use crate::db::Plan;
use crate::db::sqlite_helpers::{qualified, quote_ident};
use crate::port::value::Scalar;

/// Shared state of one statement: bound values and table aliases.
#[derive(Debug, Default)]
pub struct StatementBuilder {
    params: Vec<Option<Scalar>>,
    aliases: usize,
}

impl StatementBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh table alias (`t0`, `t1`, ...).
    pub fn alias(&mut self) -> String {
        let alias = format!("t{}", self.aliases);
        self.aliases += 1;
        alias
    }

    /// Bind a value and return its placeholder.
    pub fn param(&mut self, value: Option<Scalar>) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    /// Reserve a placeholder whose value is filled in at execution time.
    /// Returns the slot index into [`Plan::params`] and the placeholder.
    pub fn reserve(&mut self) -> (usize, String) {
        let placeholder = self.param(None);
        (self.params.len() - 1, placeholder)
    }

    pub fn finish(self, sql: String) -> Plan {
        Plan {
            sql,
            params: self.params,
        }
    }
}

/// Name of the per-parent row number column in windowed statements.
const ROW_NUMBER: &str = "__row";

/// A SELECT over one table.
///
/// Plain statements use `LIMIT`/`OFFSET`. When a partition is set, pagination
/// applies per partition value through `ROW_NUMBER() OVER (PARTITION BY ...)`.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    table: String,
    alias: String,
    columns: Vec<String>,
    where_clauses: Vec<String>,
    order_clauses: Vec<String>,
    partition: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl SelectQuery {
    pub fn new(table: &str, alias: &str) -> Self {
        Self {
            table: table.to_string(),
            alias: alias.to_string(),
            columns: Vec::new(),
            where_clauses: Vec::new(),
            order_clauses: Vec::new(),
            partition: None,
            limit: None,
            offset: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Project a column of this query's table.
    pub fn column(mut self, column: &str) -> Self {
        self.columns.push(qualified(&self.alias, column));
        self
    }

    /// Project an arbitrary SQL expression.
    pub fn expression(mut self, sql: String) -> Self {
        self.columns.push(sql);
        self
    }

    pub fn where_clause(mut self, condition: String) -> Self {
        self.where_clauses.push(condition);
        self
    }

    pub fn order_by(mut self, order: String) -> Self {
        self.order_clauses.push(order);
        self
    }

    /// Paginate per distinct value of `expr` instead of over the whole result.
    pub fn partition_by(mut self, expr: String) -> Self {
        self.partition = Some(expr);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn from_where(&self) -> String {
        let mut sql = format!(" FROM {} AS {}", quote_ident(&self.table), self.alias);
        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clauses.join(" AND "));
        }
        sql
    }

    /// Build the SQL query string.
    pub fn build_sql(&self) -> String {
        let paginated = self.limit.is_some() || self.offset.is_some();
        match &self.partition {
            Some(partition) if paginated => self.build_windowed_sql(partition),
            _ => self.build_plain_sql(),
        }
    }

    fn build_plain_sql(&self) -> String {
        let mut sql = format!("SELECT {}", self.columns.join(", "));
        sql.push_str(&self.from_where());

        if !self.order_clauses.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_clauses.join(", "));
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) if offset > 0 => {
                sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
            }
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) if offset > 0 => {
                sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset))
            }
            _ => {}
        }

        sql
    }

    fn build_windowed_sql(&self, partition: &str) -> String {
        let inner: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} AS c{}", c, i))
            .collect();
        let order = if self.order_clauses.is_empty() {
            String::new()
        } else {
            format!(" ORDER BY {}", self.order_clauses.join(", "))
        };
        let outer: Vec<String> = (0..self.columns.len()).map(|i| format!("w.c{}", i)).collect();

        let offset = self.offset.unwrap_or(0);
        let mut bounds = vec![format!("w.{} > {}", ROW_NUMBER, offset)];
        // an upper bound past i64::MAX is no bound at all
        if let Some(last) = self.limit.and_then(|limit| offset.checked_add(limit)) {
            bounds.push(format!("w.{} <= {}", ROW_NUMBER, last));
        }

        format!(
            "SELECT {} FROM (SELECT {}, ROW_NUMBER() OVER (PARTITION BY {}{}) AS {}{}) AS w WHERE {} ORDER BY w.c0, w.{}",
            outer.join(", "),
            inner.join(", "),
            partition,
            order,
            ROW_NUMBER,
            self.from_where(),
            bounds.join(" AND "),
            ROW_NUMBER
        )
    }
}
