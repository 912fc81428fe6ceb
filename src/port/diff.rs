//! DiffPatchEngine, first half: normalize, flatten, match
//!
//! Payloads are mapped onto the tree shape ([`Instance`]), flattened into one
//! [`Cell`] per entity instance in pre-order, and paired old-to-new by
//! `(table, identity)`. Nothing here touches the store.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value as Json;

use super::tree::{EntityNode, Node, SchemaTree};
use super::value::{CellValue, Identity};
use crate::db::IdentityMeta;
use crate::error::{PortError, Result, ResultExt};

/// Key of a structural reference object in `new` payloads.
pub const REFERENCE: &str = "$ref";

/// Which payload is being normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Old,
    New,
}

// ============================================================================
// Normalize
// ============================================================================

/// A field of a normalized record.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Value(CellValue),
    /// Structural path of another record in the same payload
    Reference(String),
    /// Records of a branch (any number) or facet (at most one)
    Entities(Vec<Instance>),
}

/// One record mapped onto an entity node. Scalar fields the payload left out
/// are simply absent; entity children are always present.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Instance {
    pub identity: Option<Identity>,
    pub slots: Vec<(String, Slot)>,
}

impl Instance {
    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }
}

/// A payload mapped onto the tree: records per trunk, in declaration order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalized {
    pub trunks: Vec<(String, Vec<Instance>)>,
}

/// Map a payload onto the tree. `None` and `null` mean "no records".
pub fn normalize(tree: &SchemaTree, payload: Option<&Json>, side: Side) -> Result<Normalized> {
    let root = tree.root();
    let trunks = root.children();
    let mut values: Vec<Option<&Json>> = vec![None; trunks.len()];

    match payload {
        None | Some(Json::Null) => {}
        Some(Json::Object(map)) => {
            for (key, value) in map {
                let index = trunks
                    .iter()
                    .position(|(name, _)| name == key)
                    .ok_or_else(|| PortError::unknown_attribute(key.clone()))?;
                values[index] = Some(value);
            }
        }
        Some(Json::Array(items)) => {
            if items.len() > trunks.len() {
                return Err(PortError::argument(format!(
                    "payload has {} positional entries but the tree has {} trunks",
                    items.len(),
                    trunks.len()
                )));
            }
            for (slot, item) in values.iter_mut().zip(items) {
                *slot = Some(item);
            }
        }
        Some(other) => {
            return Err(PortError::argument(format!(
                "payload must be an object or an array, got {}",
                other
            )));
        }
    }

    let mut normalized = Normalized::default();
    for ((name, node), value) in trunks.iter().zip(values) {
        let instances = normalize_entities(node, value, side, name)?;
        normalized.trunks.push((name.clone(), instances));
    }
    Ok(normalized)
}

fn normalize_entities(node: &Node, value: Option<&Json>, side: Side, path: &str) -> Result<Vec<Instance>> {
    let entity = node
        .as_entity()
        .ok_or_else(|| PortError::type_mismatch("entity", node.kind()))?;
    match value {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Array(items)) if entity.plural => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let path = format!("{}.{}", path, i);
                normalize_record(entity, item, side, &path)
                    .with_context(|| format!("normalizing `{}`", path))
            })
            .collect(),
        Some(_) if entity.plural => Err(PortError::argument(format!(
            "`{}` is a collection and expects an array",
            path
        ))),
        Some(record) => Ok(vec![
            normalize_record(entity, record, side, path)
                .with_context(|| format!("normalizing `{}`", path))?,
        ]),
    }
}

fn normalize_record(entity: &EntityNode, value: &Json, side: Side, path: &str) -> Result<Instance> {
    let mut given: Vec<Option<&Json>> = vec![None; entity.children.len()];
    let id = match value {
        Json::Object(map) => {
            let mut id = None;
            for (key, field) in map {
                if key == "id" {
                    id = Some(field);
                    continue;
                }
                let index = entity
                    .children
                    .iter()
                    .position(|(name, _)| name == key)
                    .ok_or_else(|| PortError::unknown_attribute(key.clone()))?;
                given[index] = Some(field);
            }
            id
        }
        Json::Array(items) => {
            if items.len() > entity.children.len() + 1 {
                return Err(PortError::argument(format!(
                    "record has {} positional fields, `{}` declares {}",
                    items.len(),
                    entity.table,
                    entity.children.len() + 1
                )));
            }
            let mut items = items.iter();
            let id = items.next();
            for (slot, item) in given.iter_mut().zip(items) {
                *slot = Some(item);
            }
            id
        }
        other => {
            return Err(PortError::argument(format!(
                "record must be an object or an array, got {}",
                other
            )));
        }
    };

    let identity = match id {
        None | Some(Json::Null) => None,
        Some(raw) => Some(identity_from_json(&entity.identity, raw)?),
    };
    if side == Side::Old && identity.is_none() {
        return Err(PortError::argument(format!(
            "old record `{}` has no identity",
            path
        )));
    }

    let mut instance = Instance {
        identity,
        slots: Vec::new(),
    };
    for ((name, child), value) in entity.children.iter().zip(given) {
        let slot = match &**child {
            Node::Expression(_) => continue,
            Node::Column(column) => match value {
                None => continue,
                Some(Json::Null) => Slot::Value(CellValue::Null),
                Some(v) => Slot::Value(CellValue::Value(column.domain.from_json(v).context(name.clone())?)),
            },
            Node::Link(link) => match value {
                None => continue,
                Some(Json::Null) => Slot::Value(CellValue::Null),
                Some(Json::Object(map)) if map.contains_key(REFERENCE) => {
                    if side == Side::Old {
                        return Err(PortError::argument(format!(
                            "`{}.{}`: references are only allowed in new payloads",
                            path, name
                        )));
                    }
                    match map.get(REFERENCE) {
                        Some(Json::String(target)) if map.len() == 1 => Slot::Reference(target.clone()),
                        _ => {
                            return Err(PortError::argument(format!(
                                "`{}.{}`: malformed reference",
                                path, name
                            )));
                        }
                    }
                }
                Some(v) => Slot::Value(CellValue::Value(link.domain.from_json(v).context(name.clone())?)),
            },
            entity_child => {
                let child_path = format!("{}.{}", path, name);
                Slot::Entities(normalize_entities(entity_child, value, side, &child_path)?)
            }
        };
        instance.slots.push((name.clone(), slot));
    }
    Ok(instance)
}

fn identity_from_json(meta: &IdentityMeta, raw: &Json) -> Result<Identity> {
    meta.domain
        .from_json(raw)?
        .to_identity()
        .ok_or_else(|| PortError::argument(format!("{} is not a valid identity", raw)))
}

// ============================================================================
// Flatten
// ============================================================================

/// A flattened, path-addressed snapshot of one entity instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Tree path of the entity node (`order.item`)
    pub node: String,
    /// Structural path of the instance (`order.0.item.1`)
    pub path: String,
    pub table: String,
    pub identity_meta: IdentityMeta,
    pub identity: Option<Identity>,
    /// At most one instance per parent (a facet)
    pub singular: bool,
    /// Column values; a missing column is `Unset`
    pub fields: BTreeMap<String, CellValue>,
    /// Columns whose value is the identity of another cell on the same side
    pub references: BTreeMap<String, usize>,
}

impl Cell {
    pub fn field(&self, column: &str) -> &CellValue {
        static UNSET: CellValue = CellValue::Unset;
        self.fields.get(column).unwrap_or(&UNSET)
    }

    fn placeholder(of: &Cell) -> Cell {
        Cell {
            fields: BTreeMap::new(),
            references: BTreeMap::new(),
            ..of.clone()
        }
    }
}

struct PendingReference {
    cell: usize,
    column: String,
    path: String,
    target_table: String,
}

/// One cell per entity instance, pre-order. Parent linkage comes from the
/// traversal: a child of a stored parent gets the parent identity as a value,
/// a child of a new parent references the parent cell.
pub fn flatten(tree: &SchemaTree, normalized: &Normalized) -> Result<Vec<Cell>> {
    let mut cells = Vec::new();
    let mut pending = Vec::new();
    for (name, instances) in &normalized.trunks {
        let node = tree.root().child(name).ok_or_else(|| PortError::path_error(name.clone()))?;
        let entity = node
            .as_entity()
            .ok_or_else(|| PortError::type_mismatch("entity", node.kind()))?;
        for (i, instance) in instances.iter().enumerate() {
            let path = format!("{}.{}", name, i);
            flatten_instance(entity, name, &path, instance, None, &mut cells, &mut pending)?;
        }
    }

    let by_path: HashMap<&str, usize> = cells
        .iter()
        .enumerate()
        .map(|(i, c): (usize, &Cell)| (c.path.as_str(), i))
        .collect();
    let mut resolved = Vec::with_capacity(pending.len());
    for reference in pending {
        let target = *by_path
            .get(reference.path.as_str())
            .ok_or_else(|| PortError::dangling(reference.path.clone()))?;
        if cells[target].table != reference.target_table {
            return Err(PortError::argument(format!(
                "reference `{}` points to a `{}` record, expected `{}`",
                reference.path, cells[target].table, reference.target_table
            ))
            .context(format!("flattening `{}`", cells[reference.cell].path)));
        }
        resolved.push((reference.cell, reference.column, target));
    }
    for (cell, column, target) in resolved {
        cells[cell].references.insert(column, target);
    }
    Ok(cells)
}

fn flatten_instance(
    entity: &EntityNode,
    node: &str,
    path: &str,
    instance: &Instance,
    parent: Option<usize>,
    cells: &mut Vec<Cell>,
    pending: &mut Vec<PendingReference>,
) -> Result<()> {
    let index = cells.len();
    let mut cell = Cell {
        node: node.to_string(),
        path: path.to_string(),
        table: entity.table.clone(),
        identity_meta: entity.identity.clone(),
        identity: instance.identity.clone(),
        singular: !entity.plural,
        fields: BTreeMap::new(),
        references: BTreeMap::new(),
    };

    if let (Some(parent), Some(relation)) = (parent, &entity.relation) {
        match &cells[parent].identity {
            Some(id) => {
                cell.fields
                    .insert(relation.clone(), CellValue::Value(id.to_scalar()));
            }
            None => {
                cell.references.insert(relation.clone(), parent);
            }
        }
    }

    let mut nested = Vec::new();
    for (name, slot) in &instance.slots {
        let child = entity
            .children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
            .ok_or_else(|| PortError::unknown_attribute(name.clone()))?;
        match (&**child, slot) {
            (Node::Column(column), Slot::Value(value)) => {
                cell.fields.insert(column.column.clone(), value.clone());
            }
            (Node::Link(link), Slot::Value(value)) => {
                cell.fields.insert(link.column.clone(), value.clone());
            }
            (Node::Link(link), Slot::Reference(target)) => pending.push(PendingReference {
                cell: index,
                column: link.column.clone(),
                path: target.clone(),
                target_table: link.target.clone(),
            }),
            (child, Slot::Entities(instances)) => {
                let child_entity = child
                    .as_entity()
                    .ok_or_else(|| PortError::type_mismatch("entity", child.kind()))?;
                nested.push((name, child_entity, instances));
            }
            (child, _) => {
                return Err(PortError::type_mismatch(child.kind(), "payload value"));
            }
        }
    }
    cells.push(cell);

    for (name, child, instances) in nested {
        let node = format!("{}.{}", node, name);
        for (i, instance) in instances.iter().enumerate() {
            let path = if child.plural {
                format!("{}.{}.{}", path, name, i)
            } else {
                format!("{}.{}", path, name)
            };
            flatten_instance(child, &node, &path, instance, Some(index), cells, pending)?;
        }
    }
    Ok(())
}

// ============================================================================
// Match
// ============================================================================

/// One write to perform, by cell index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pair {
    Insert { new: usize },
    Update { old: usize, new: usize },
    Delete { old: usize },
}

/// Old and new cells with the writes pairing them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Matched {
    pub olds: Vec<Cell>,
    pub news: Vec<Cell>,
    pub pairs: Vec<Pair>,
}

fn index_by_identity(cells: &[Cell]) -> Result<HashMap<(&str, &Identity), usize>> {
    let mut index = HashMap::new();
    for (i, cell) in cells.iter().enumerate() {
        if let Some(id) = &cell.identity {
            if index.insert((cell.table.as_str(), id), i).is_some() {
                return Err(PortError::duplicate_record(cell.table.clone(), id)
                    .context(format!("matching `{}`", cell.path)));
            }
        }
    }
    Ok(index)
}

/// Pair cells by `(table, identity)`. Inserts and updates follow new-side
/// order; deletes come last, in reverse old-side order. The exception is a
/// displaced facet record (and its listed descendants): its slot is unique per
/// parent, so it is deleted before anything else.
pub fn match_cells(mut olds: Vec<Cell>, news: Vec<Cell>) -> Result<Matched> {
    let (pairs, placeholders) = {
        let old_index = index_by_identity(&olds)?;
        index_by_identity(&news)?;

        let mut matched = vec![false; olds.len()];
        let mut placeholders = Vec::new();
        let mut writes = Vec::new();
        for (n, cell) in news.iter().enumerate() {
            match &cell.identity {
                None => writes.push(Pair::Insert { new: n }),
                Some(id) => match old_index.get(&(cell.table.as_str(), id)) {
                    Some(&o) => {
                        matched[o] = true;
                        writes.push(Pair::Update { old: o, new: n });
                    }
                    None => {
                        let o = olds.len() + placeholders.len();
                        placeholders.push(Cell::placeholder(cell));
                        writes.push(Pair::Update { old: o, new: n });
                    }
                },
            }
        }

        let displaced: Vec<String> = olds
            .iter()
            .zip(&matched)
            .filter(|(cell, m)| cell.singular && !**m)
            .map(|(cell, _)| format!("{}.", cell.path))
            .collect();
        let (early, late): (Vec<usize>, Vec<usize>) = (0..olds.len())
            .rev()
            .filter(|&o| !matched[o])
            .partition(|&o| {
                let path = format!("{}.", olds[o].path);
                displaced.iter().any(|prefix| path.starts_with(prefix.as_str()))
            });

        let mut pairs: Vec<Pair> = early.into_iter().map(|old| Pair::Delete { old }).collect();
        pairs.extend(writes);
        pairs.extend(late.into_iter().map(|old| Pair::Delete { old }));
        (pairs, placeholders)
    };
    olds.extend(placeholders);
    Ok(Matched { olds, news, pairs })
}

/// Normalize, flatten and match both payloads.
pub fn diff(tree: &SchemaTree, old: Option<&Json>, new: Option<&Json>) -> Result<Matched> {
    let olds = flatten(tree, &normalize(tree, old, Side::Old).context("reading old payload")?)
        .context("reading old payload")?;
    let news = flatten(tree, &normalize(tree, new, Side::New).context("reading new payload")?)
        .context("reading new payload")?;
    match_cells(olds, news)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Catalog, TableMeta};
    use crate::error::ErrorKind;
    use crate::port::grow::{CalculationDirective, EntityDirective, GrowBuilder};
    use crate::port::value::Scalar;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tree() -> SchemaTree {
        let catalog = Catalog::new([
            TableMeta::new("order")
                .primary_key("id", "INTEGER")
                .column("code", "TEXT"),
            TableMeta::new("item")
                .primary_key("id", "INTEGER")
                .column("order_id", "INTEGER")
                .column("sku", "TEXT")
                .column("parent_id", "INTEGER")
                .foreign_key("order_id", "order")
                .foreign_key("parent_id", "item"),
        ]);
        GrowBuilder::new(&catalog)
            .grow(
                &SchemaTree::new(),
                &[
                    EntityDirective::new("", "order")
                        .nest(EntityDirective::new("", "item"))
                        .into(),
                    CalculationDirective::new("order", "lines", "count(item)").into(),
                ],
            )
            .unwrap()
    }

    #[test]
    fn test_normalize_object_and_positional_forms() {
        let tree = tree();
        let keyed = normalize(
            &tree,
            Some(&json!({"order": [{"id": 7, "code": "A", "item": [{"id": 1, "sku": "X"}]}]})),
            Side::New,
        )
        .unwrap();
        let positional = normalize(
            &tree,
            Some(&json!([[[7, "A", [[1, "X"]]]]])),
            Side::New,
        )
        .unwrap();
        assert_eq!(keyed, positional);

        let order = &keyed.trunks[0].1[0];
        assert_eq!(order.identity, Some(Identity::Integer(7)));
        assert_eq!(order.slot("code"), Some(&Slot::Value(CellValue::Value(Scalar::Text("A".into())))));
    }

    #[test]
    fn test_absent_fields_stay_unset() {
        let tree = tree();
        let cells = flatten(
            &tree,
            &normalize(&tree, Some(&json!({"order": [{"id": 7, "item": [{"id": 1, "sku": null}]}]})), Side::Old)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].field("code"), &CellValue::Unset);
        assert_eq!(cells[1].field("sku"), &CellValue::Null);
        assert_eq!(cells[1].field("order_id"), &CellValue::Value(Scalar::Integer(7)));
        assert_eq!(cells[1].path, "order.0.item.0");
        assert_eq!(cells[1].node, "order.item");
    }

    #[test]
    fn test_new_parent_is_referenced_structurally() {
        let tree = tree();
        let cells = flatten(
            &tree,
            &normalize(
                &tree,
                Some(&json!({"order": [{"code": "N", "item": [
                    {"sku": "A"},
                    {"sku": "B", "parent": {"$ref": "order.0.item.0"}}
                ]}]})),
                Side::New,
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(cells[1].references.get("order_id"), Some(&0));
        assert_eq!(cells[2].references.get("parent_id"), Some(&1));
    }

    #[test]
    fn test_reference_errors() {
        let tree = tree();
        let dangling = json!({"order": [{"item": [{"parent": {"$ref": "order.0.item.5"}}]}]});
        let err = flatten(&tree, &normalize(&tree, Some(&dangling), Side::New).unwrap()).unwrap_err();
        assert_matches!(err.kind, ErrorKind::DanglingReference { .. });

        let wrong_table = json!({"order": [{"item": [{"parent": {"$ref": "order.0"}}]}]});
        let err = flatten(&tree, &normalize(&tree, Some(&wrong_table), Side::New).unwrap()).unwrap_err();
        assert_matches!(err.kind, ErrorKind::ArgumentError(_));

        let in_old = json!({"order": [{"id": 1, "item": [{"id": 2, "parent": {"$ref": "order.0"}}]}]});
        let err = normalize(&tree, Some(&in_old), Side::Old).unwrap_err();
        assert_matches!(err.kind, ErrorKind::ArgumentError(_));
    }

    #[test]
    fn test_payload_errors() {
        let tree = tree();
        assert_matches!(
            normalize(&tree, Some(&json!({"orders": []})), Side::New).unwrap_err().kind,
            ErrorKind::UnknownAttribute { .. }
        );
        assert_matches!(
            normalize(&tree, Some(&json!({"order": [{"code": 5}]})), Side::New).unwrap_err().kind,
            ErrorKind::ArgumentError(_)
        );
        assert_matches!(
            normalize(&tree, Some(&json!({"order": [{"code": "A"}]})), Side::Old).unwrap_err().kind,
            ErrorKind::ArgumentError(_)
        );
    }

    #[test]
    fn test_expressions_are_ignored() {
        let tree = tree();
        let normalized = normalize(&tree, Some(&json!({"order": [{"id": 1, "lines": 99}]})), Side::New).unwrap();
        assert!(normalized.trunks[0].1[0].slot("lines").is_none());
    }

    #[test]
    fn test_match_pairs() {
        let tree = tree();
        let old = json!({"order": [{"id": 7, "item": [{"id": 1}, {"id": 2}]}]});
        let new = json!({"order": [{"id": 7, "item": [{"id": 1}, {"sku": "X"}]}, {"id": 9}]});
        let matched = diff(&tree, Some(&old), Some(&new)).unwrap();
        assert_eq!(
            matched.pairs,
            vec![
                Pair::Update { old: 0, new: 0 },
                Pair::Update { old: 1, new: 1 },
                Pair::Insert { new: 2 },
                Pair::Update { old: 3, new: 3 },
                Pair::Delete { old: 2 },
            ]
        );
        assert_eq!(matched.olds.len(), 4);
        assert!(matched.olds[3].fields.is_empty());
        assert_eq!(matched.olds[3].identity, Some(Identity::Integer(9)));
    }

    fn billed_tree() -> SchemaTree {
        let catalog = Catalog::new([
            TableMeta::new("order")
                .primary_key("id", "INTEGER")
                .column("code", "TEXT"),
            TableMeta::new("item")
                .primary_key("id", "INTEGER")
                .column("order_id", "INTEGER")
                .foreign_key("order_id", "order"),
            TableMeta::new("invoice")
                .primary_key("id", "INTEGER")
                .column("order_id", "INTEGER")
                .column("total", "REAL")
                .unique("order_id")
                .foreign_key("order_id", "order"),
            TableMeta::new("payment")
                .primary_key("id", "INTEGER")
                .column("invoice_id", "INTEGER")
                .foreign_key("invoice_id", "invoice"),
        ]);
        GrowBuilder::new(&catalog)
            .grow(
                &SchemaTree::new(),
                &[EntityDirective::new("", "order")
                    .nest(EntityDirective::new("", "item"))
                    .nest(EntityDirective::new("", "invoice").nest(EntityDirective::new("", "payment")))
                    .into()],
            )
            .unwrap()
    }

    #[test]
    fn test_displaced_facet_is_deleted_first() {
        let tree = billed_tree();
        let old = json!({"order": [{"id": 7, "item": [{"id": 1}], "invoice": {"id": 3, "payment": [{"id": 4}]}}]});
        let new = json!({"order": [{"id": 7, "item": [], "invoice": {"total": 9.0}}]});
        let matched = diff(&tree, Some(&old), Some(&new)).unwrap();

        assert!(matched.olds[2].singular);
        assert!(!matched.olds[1].singular);
        assert_eq!(
            matched.pairs,
            vec![
                Pair::Delete { old: 3 },
                Pair::Delete { old: 2 },
                Pair::Update { old: 0, new: 0 },
                Pair::Insert { new: 1 },
                Pair::Delete { old: 1 },
            ]
        );
    }

    #[test]
    fn test_duplicate_record() {
        let tree = tree();
        let new = json!({"order": [{"id": 7}, {"id": 7}]});
        let err = diff(&tree, None, Some(&new)).unwrap_err();
        assert_matches!(err.kind, ErrorKind::DuplicateRecord { .. });
    }
}
