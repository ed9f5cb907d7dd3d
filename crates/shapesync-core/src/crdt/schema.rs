//! Loro document schema and the replicated shape store.

use super::convert::{record_from_loro, record_to_loro};
use crate::error::{Result, ShapeSyncError};
use crate::shapes::{ShapeId, ShapeRecord};
use loro::{ExportMode, LoroDoc, LoroList, LoroMap, LoroValue, ValueOrContainer, VersionVector};
use std::collections::HashSet;

/// Key for the shapes map in the document.
pub const SHAPES_KEY: &str = "shapes";
/// Key for the z-order list in the document.
pub const Z_ORDER_KEY: &str = "z_order";

/// Where a batch of changes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Notification delivered to observers after each applied batch.
#[derive(Debug)]
pub struct StoreEvent<'a> {
    pub origin: ChangeOrigin,
    /// The materialized list after the change.
    pub shapes: &'a [ShapeRecord],
}

/// Handle returned by [`ShapeStore::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&StoreEvent<'_>)>;

/// A single mutation of the shared sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Insert a record at a materialized index (clamped to the length).
    Insert { position: usize, record: ShapeRecord },
    /// Remove a record. No-op when absent.
    Delete(ShapeId),
    /// Replace a record's body, keeping its slot. No-op when absent.
    Update(ShapeRecord),
    /// Move an existing record to a materialized index.
    Move { id: ShapeId, position: usize },
}

/// The shared, ordered collection of shape records.
///
/// ```text
/// LoroDoc
/// ├── "shapes": LoroMap<ShapeId, LoroMap> (record fields)
/// └── "z_order": LoroList<String> (record ids in sequence order)
/// ```
///
/// The materialized list walks `z_order`, skipping ids without a record and
/// repeated ids, so concurrent edits can never produce a malformed view.
pub struct ShapeStore {
    doc: LoroDoc,
    shapes: Vec<ShapeRecord>,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl ShapeStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            doc: LoroDoc::new(),
            shapes: Vec::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Create a store seeded from a snapshot.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        let mut store = Self::new();
        store.doc.import(bytes)?;
        store.rebuild();
        Ok(store)
    }

    /// Loro peer id of this replica.
    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    fn shapes_map(&self) -> LoroMap {
        self.doc.get_map(SHAPES_KEY)
    }

    fn z_order_list(&self) -> LoroList {
        self.doc.get_list(Z_ORDER_KEY)
    }

    /// Materialized list in sequence order.
    pub fn shapes(&self) -> &[ShapeRecord] {
        &self.shapes
    }

    /// Materialized list sorted by `z_index`, ties kept in sequence order.
    pub fn paint_order(&self) -> Vec<&ShapeRecord> {
        let mut ordered: Vec<&ShapeRecord> = self.shapes.iter().collect();
        ordered.sort_by_key(|s| s.z_index);
        ordered
    }

    pub fn get(&self, id: &ShapeId) -> Option<&ShapeRecord> {
        self.shapes.iter().find(|s| &s.id == id)
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.get(id).is_some()
    }

    pub fn position(&self, id: &ShapeId) -> Option<usize> {
        self.shapes.iter().position(|s| &s.id == id)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Register a change callback.
    pub fn observe(&mut self, callback: impl FnMut(&StoreEvent<'_>) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        id
    }

    /// Remove a change callback. Returns false if it was not registered.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    pub fn insert(&mut self, position: usize, record: ShapeRecord) -> Result<()> {
        self.apply(vec![StoreOp::Insert { position, record }]).map(|_| ())
    }

    pub fn delete(&mut self, id: &ShapeId) -> Result<bool> {
        self.apply(vec![StoreOp::Delete(id.clone())]).map(|n| n > 0)
    }

    pub fn update(&mut self, record: ShapeRecord) -> Result<bool> {
        self.apply(vec![StoreOp::Update(record)]).map(|n| n > 0)
    }

    /// Apply a batch of operations as one transaction.
    ///
    /// Observers fire once if anything changed. Returns the number of
    /// operations that took effect.
    pub fn apply(&mut self, ops: Vec<StoreOp>) -> Result<usize> {
        let mut applied = 0;
        for op in ops {
            if self.apply_one(op)? {
                applied += 1;
            }
        }
        if applied > 0 {
            self.doc.commit();
            self.rebuild();
            self.notify(ChangeOrigin::Local);
        }
        Ok(applied)
    }

    fn apply_one(&mut self, op: StoreOp) -> Result<bool> {
        let shapes = self.shapes_map();
        let z_order = self.z_order_list();

        match op {
            StoreOp::Insert { position, record } => {
                let slot = self.slot_for(position);
                let map = shapes.insert_container(record.id.as_str(), LoroMap::new())?;
                record_to_loro(&record, &map)?;
                z_order.insert(slot, LoroValue::String(record.id.to_string().into()))?;
                Ok(true)
            }
            StoreOp::Delete(id) => {
                if shapes.get(id.as_str()).is_none() {
                    return Ok(false);
                }
                shapes.delete(id.as_str())?;
                self.remove_from_order(&id)?;
                Ok(true)
            }
            StoreOp::Update(record) => {
                if shapes.get(record.id.as_str()).is_none() {
                    return Ok(false);
                }
                shapes.delete(record.id.as_str())?;
                let map = shapes.insert_container(record.id.as_str(), LoroMap::new())?;
                record_to_loro(&record, &map)?;
                Ok(true)
            }
            StoreOp::Move { id, position } => {
                if shapes.get(id.as_str()).is_none() {
                    return Ok(false);
                }
                self.remove_from_order(&id)?;
                let slot = self.slot_for(position);
                z_order.insert(slot, LoroValue::String(id.to_string().into()))?;
                Ok(true)
            }
        }
    }

    /// Live `(id, list index)` pairs in materialized order, read from the
    /// document including uncommitted changes.
    fn live_order(&self) -> Vec<(String, usize)> {
        let shapes = self.shapes_map();
        let z_order = self.z_order_list();
        let mut seen = HashSet::new();
        let mut order = Vec::with_capacity(z_order.len());
        for i in 0..z_order.len() {
            if let Some(ValueOrContainer::Value(LoroValue::String(s))) = z_order.get(i) {
                let id = s.to_string();
                if shapes.get(&id).is_some() && seen.insert(id.clone()) {
                    order.push((id, i));
                }
            }
        }
        order
    }

    /// Translate a materialized index into a `z_order` list index.
    fn slot_for(&self, position: usize) -> usize {
        self.live_order()
            .get(position)
            .map(|(_, slot)| *slot)
            .unwrap_or_else(|| self.z_order_list().len())
    }

    fn remove_from_order(&self, id: &ShapeId) -> Result<()> {
        let z_order = self.z_order_list();
        for i in (0..z_order.len()).rev() {
            if let Some(ValueOrContainer::Value(LoroValue::String(s))) = z_order.get(i) {
                if s.as_ref() == id.as_str() {
                    z_order.delete(i, 1)?;
                }
            }
        }
        Ok(())
    }

    /// Make the store equal to `target` using the fewest operations.
    ///
    /// Records absent from `target` are deleted, changed ones updated in
    /// place, missing ones inserted and misplaced ones moved.
    pub fn replace_all(&mut self, target: &[ShapeRecord]) -> Result<usize> {
        let wanted: HashSet<&ShapeId> = target.iter().map(|r| &r.id).collect();
        let mut ops = Vec::new();

        let mut current: Vec<ShapeId> = Vec::with_capacity(self.shapes.len());
        for record in &self.shapes {
            if wanted.contains(&record.id) {
                current.push(record.id.clone());
            } else {
                ops.push(StoreOp::Delete(record.id.clone()));
            }
        }

        for (i, record) in target.iter().enumerate() {
            match self.get(&record.id) {
                Some(existing) if existing != record => ops.push(StoreOp::Update(record.clone())),
                _ => {}
            }

            if current.get(i) == Some(&record.id) {
                continue;
            }
            if let Some(j) = current.iter().position(|id| id == &record.id) {
                current.remove(j);
                ops.push(StoreOp::Move {
                    id: record.id.clone(),
                    position: i,
                });
            } else {
                ops.push(StoreOp::Insert {
                    position: i,
                    record: record.clone(),
                });
            }
            current.insert(i, record.id.clone());
        }

        self.apply(ops)
    }

    /// Apply remote updates or a snapshot. Re-importing known data is a no-op.
    pub fn import(&mut self, bytes: &[u8]) -> Result<bool> {
        let before = self.doc.oplog_vv();
        self.doc.import(bytes)?;
        if self.doc.oplog_vv() == before {
            return Ok(false);
        }
        self.rebuild();
        self.notify(ChangeOrigin::Remote);
        Ok(true)
    }

    /// Export the document as a snapshot (full state).
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| ShapeSyncError::Encode(e.to_string()))
    }

    /// Export incremental updates since a version.
    pub fn export_updates(&self, since: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(since))
            .map_err(|e| ShapeSyncError::Encode(e.to_string()))
    }

    /// Get the current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    fn rebuild(&mut self) {
        let LoroValue::Map(records) = self.shapes_map().get_deep_value() else {
            self.shapes.clear();
            return;
        };

        let mut shapes = Vec::with_capacity(records.len());
        for (id, _) in self.live_order() {
            match records.get(&id) {
                Some(LoroValue::Map(value)) => match record_from_loro(value) {
                    Some(record) => shapes.push(record),
                    None => log::warn!("Skipping malformed shape record {id}"),
                },
                _ => log::warn!("Shape {id} has no record body"),
            }
        }
        self.shapes = shapes;
    }

    fn notify(&mut self, origin: ChangeOrigin) {
        let event = StoreEvent {
            origin,
            shapes: &self.shapes,
        };
        for (_, callback) in self.observers.iter_mut() {
            callback(&event);
        }
    }
}

impl Default for ShapeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Version vector covered by an encoded update or snapshot.
pub fn version_of(bytes: &[u8]) -> Result<VersionVector> {
    let doc = LoroDoc::new();
    doc.import(bytes)?;
    Ok(doc.oplog_vv())
}
