//! Treeport - declarative tree-shaped data access over SQLite
//!
//! Grow a schema tree from the catalog, read slices of it with path-addressed
//! constraints, and write back by diffing old and new payloads.

pub mod config;
pub mod db;
pub mod error;
pub mod port;
pub mod telemetry;

pub use config::PortConfig;
pub use db::{Catalog, Database, SqliteStore, Store};
pub use error::{ErrorClass, ErrorKind, PortError, Result, ResultExt};
pub use port::{
    CalculationDirective, ConflictPolicy, ConstraintSet, Directive, EntityDirective,
    OutputFormat, ParameterDirective, Port, Product, SchemaTree, Shape, Value,
};
