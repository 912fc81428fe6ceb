//! Declarative data access over a schema tree
//!
//! A [`Port`] pairs a store with an immutable [`SchemaTree`]. Reads compile
//! the tree plus a [`ConstraintSet`] into statements; writes diff an old and a
//! new payload against the tree and patch the store in one transaction.

pub mod bind;
pub mod builder;
pub mod compiler;
pub mod condition;
pub mod constraint;
pub mod diff;
pub mod expr;
pub mod grow;
pub mod patch;
pub mod tree;
pub mod value;

use std::sync::Arc;

use serde_json::Value as Json;
use tracing::debug;

pub use compiler::Product;
pub use constraint::{Constraint, ConstraintSet, OutputFormat};
pub use grow::{CalculationDirective, Directive, EntityDirective, GrowBuilder, ParameterDirective};
pub use patch::ConflictPolicy;
pub use tree::{Node, NodeKind, SchemaTree};
pub use value::{CellValue, Domain, Identity, Record, Scalar, Shape, Value};

use crate::config::PortConfig;
use crate::db::{Database, SqliteStore, Store};
use crate::error::{Result, ResultExt};

/// Read and write entry points over one tree.
#[derive(Clone)]
pub struct Port {
    store: Arc<dyn Store>,
    tree: Arc<SchemaTree>,
    config: PortConfig,
}

impl Port {
    /// A port with an empty tree; grow it before reading.
    pub fn new(store: Arc<dyn Store>, config: PortConfig) -> Self {
        Self {
            store,
            tree: Arc::new(SchemaTree::new()),
            config,
        }
    }

    /// Connect to the configured database and introspect its catalog.
    pub async fn connect(config: PortConfig) -> anyhow::Result<Self> {
        let db = Database::connect(&config).await?;
        let store = SqliteStore::open(db).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn tree(&self) -> &Arc<SchemaTree> {
        &self.tree
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// A port over the tree grown by `directives`; `self` is unchanged.
    pub fn grow(&self, directives: &[Directive]) -> Result<Self> {
        let tree = GrowBuilder::new(self.store.catalog()).grow(&self.tree, directives)?;
        Ok(Self {
            store: Arc::clone(&self.store),
            tree: Arc::new(tree),
            config: self.config.clone(),
        })
    }

    pub fn describe(&self, constraints: &ConstraintSet) -> Result<Shape> {
        compiler::describe(&self.tree, constraints).context("describing")
    }

    pub async fn produce(&self, constraints: &ConstraintSet) -> Result<Product> {
        compiler::produce(
            self.store.as_ref(),
            &self.tree,
            constraints,
            self.config.default_format,
        )
        .await
        .context("producing")
    }

    /// `produce` from the wire form of a constraint set.
    pub async fn produce_query(&self, query: &str) -> Result<Product> {
        debug!(query = %query, "Producing");
        let constraints = ConstraintSet::parse(query)?;
        self.produce(&constraints).await
    }

    pub async fn replace(&self, old: Option<&Json>, new: Option<&Json>) -> Result<Value> {
        self.replace_with(old, new, &ConstraintSet::new()).await
    }

    /// `replace` with root-level parameter bindings (`:user=alice`) for trees
    /// whose masks or filters refer to parameters without defaults.
    pub async fn replace_with(
        &self,
        old: Option<&Json>,
        new: Option<&Json>,
        bindings: &ConstraintSet,
    ) -> Result<Value> {
        patch::replace(
            self.store.as_ref(),
            &self.tree,
            old,
            new,
            bindings,
            self.config.conflict_policy,
        )
        .await
        .context("replacing")
    }

    pub async fn insert(&self, payload: &Json) -> Result<Value> {
        self.replace(None, Some(payload)).await
    }

    pub async fn delete(&self, payload: &Json) -> Result<Value> {
        self.replace(Some(payload), None).await
    }
}
