//! Local shape manipulation engine.
//!
//! Every verb reads the store's materialized list, stages the records it
//! changes, and applies them as one batch. Failing preconditions (wrong arity,
//! unknown or concurrently deleted ids) are silent no-ops.

use crate::crdt::{ShapeStore, StoreOp};
use crate::history::{History, MAX_UNDO_HISTORY};
use crate::shapes::{union_bounds, ShapeId, ShapeKind, ShapePatch, ShapeRecord};
use crate::view::ViewState;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Offset applied to duplicated and pasted shapes.
pub const PASTE_OFFSET: f64 = 20.0;

/// Edge or axis to align the selection on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    Right,
    Top,
    Bottom,
    /// Horizontal centers.
    Center,
    /// Vertical centers.
    Middle,
}

/// Direction for distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Horizontal,
    Vertical,
}

/// Records staged by one engine call before they reach the store.
struct Draft<'a> {
    store: &'a ShapeStore,
    changed: Vec<ShapeRecord>,
    deleted: Vec<ShapeId>,
    appended: Vec<ShapeRecord>,
}

impl<'a> Draft<'a> {
    fn new(store: &'a ShapeStore) -> Self {
        Self {
            store,
            changed: Vec::new(),
            deleted: Vec::new(),
            appended: Vec::new(),
        }
    }

    fn get(&self, id: &ShapeId) -> Option<ShapeRecord> {
        if self.deleted.contains(id) {
            return None;
        }
        self.appended
            .iter()
            .chain(self.changed.iter())
            .find(|r| &r.id == id)
            .or_else(|| self.store.get(id))
            .cloned()
    }

    fn put(&mut self, record: ShapeRecord) {
        if let Some(slot) = self.appended.iter_mut().find(|r| r.id == record.id) {
            *slot = record;
        } else if let Some(slot) = self.changed.iter_mut().find(|r| r.id == record.id) {
            *slot = record;
        } else {
            self.changed.push(record);
        }
    }

    fn modify(&mut self, id: &ShapeId, f: impl FnOnce(&mut ShapeRecord)) {
        if let Some(mut record) = self.get(id) {
            f(&mut record);
            self.put(record);
        }
    }

    fn append(&mut self, record: ShapeRecord) {
        self.appended.push(record);
    }

    fn delete(&mut self, id: &ShapeId) {
        if let Some(pos) = self.appended.iter().position(|r| &r.id == id) {
            self.appended.remove(pos);
            return;
        }
        self.changed.retain(|r| &r.id != id);
        if !self.deleted.contains(id) {
            self.deleted.push(id.clone());
        }
    }

    /// Delete a record and repair the group links pointing at or from it.
    fn delete_linked(&mut self, id: &ShapeId) {
        let Some(record) = self.get(id) else {
            return;
        };

        for child in record.children.iter().flatten() {
            self.modify(child, |c| {
                if c.group_id.as_ref() == Some(id) {
                    c.group_id = None;
                }
            });
        }
        if let Some(parent) = &record.group_id {
            self.modify(parent, |g| {
                if let Some(children) = g.children.as_mut() {
                    children.retain(|c| c != id);
                }
            });
        }
        self.delete(id);
    }

    fn into_ops(self) -> Vec<StoreOp> {
        let store = self.store;
        let mut ops: Vec<StoreOp> = self.deleted.into_iter().map(StoreOp::Delete).collect();
        ops.extend(
            self.changed
                .into_iter()
                .filter(|r| store.get(&r.id) != Some(r))
                .map(StoreOp::Update),
        );
        ops.extend(self.appended.into_iter().map(|record| StoreOp::Insert {
            position: usize::MAX,
            record,
        }));
        ops
    }
}

/// Client-side editing state over a shared store.
pub struct Canvas {
    store: ShapeStore,
    selection: Vec<ShapeId>,
    clipboard: Vec<ShapeRecord>,
    history: History,
    paste_offset: f64,
    /// Zoom, pan and grid toggles.
    pub view: ViewState,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new()
    }
}

impl Canvas {
    /// Create a canvas over an empty store.
    pub fn new() -> Self {
        Self::with_store(ShapeStore::new())
    }

    /// Create a canvas over an existing store.
    pub fn with_store(store: ShapeStore) -> Self {
        Self {
            store,
            selection: Vec::new(),
            clipboard: Vec::new(),
            history: History::new(MAX_UNDO_HISTORY),
            paste_offset: PASTE_OFFSET,
            view: ViewState::default(),
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history = History::new(limit);
        self
    }

    pub fn with_paste_offset(mut self, offset: f64) -> Self {
        self.paste_offset = offset;
        self
    }

    pub fn store(&self) -> &ShapeStore {
        &self.store
    }

    /// Mutable store access for the replication layer.
    ///
    /// Call [`Canvas::prune_selection`] after importing remote changes.
    pub fn store_mut(&mut self) -> &mut ShapeStore {
        &mut self.store
    }

    pub fn shapes(&self) -> &[ShapeRecord] {
        self.store.shapes()
    }

    pub fn get(&self, id: &ShapeId) -> Option<&ShapeRecord> {
        self.store.get(id)
    }

    pub fn selection(&self) -> &[ShapeId] {
        &self.selection
    }

    pub fn is_selected(&self, id: &ShapeId) -> bool {
        self.selection.contains(id)
    }

    pub fn clipboard(&self) -> &[ShapeRecord] {
        &self.clipboard
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Forget undo/redo state.
    pub fn reset_history(&mut self) {
        self.history.clear();
    }

    /// Drop selected ids that no longer exist.
    pub fn prune_selection(&mut self) {
        let store = &self.store;
        self.selection.retain(|id| store.contains(id));
    }

    /// Next z-index: at least the shape count and above every existing shape.
    fn next_z_index(&self) -> i64 {
        let count = self.store.len() as i64;
        let top = self.store.shapes().iter().map(|s| s.z_index + 1).max().unwrap_or(0);
        count.max(top)
    }

    /// Apply staged ops and record an undo checkpoint when anything changed.
    fn commit(&mut self, ops: Vec<StoreOp>) -> bool {
        if ops.is_empty() {
            return false;
        }
        let before = self.store.shapes().to_vec();
        match self.store.apply(ops) {
            Ok(0) => false,
            Ok(_) => {
                self.history.checkpoint(before);
                true
            }
            Err(e) => {
                log::warn!("Failed to apply shape changes: {e}");
                false
            }
        }
    }

    /// Add a shape with a fresh id, painted above everything else.
    pub fn add_shape(&mut self, mut record: ShapeRecord) -> Option<ShapeId> {
        record.id = ShapeId::new();
        record.z_index = self.next_z_index();
        if let Some(group) = &record.group_id {
            if !self.store.get(group).is_some_and(ShapeRecord::is_group) {
                record.group_id = None;
            }
        }
        if record.is_group() && record.children.is_none() {
            record.children = Some(Vec::new());
        }

        let id = record.id.clone();
        let ops = vec![StoreOp::Insert {
            position: usize::MAX,
            record,
        }];
        self.commit(ops).then_some(id)
    }

    /// Merge `patch` into the record. No-op if the id is gone.
    pub fn update_shape(&mut self, id: &ShapeId, patch: &ShapePatch) -> bool {
        let Some(mut record) = self.store.get(id).cloned() else {
            log::debug!("update_shape: {id} not found");
            return false;
        };
        let before = record.clone();
        patch.apply(&mut record);

        // Group links only point at existing groups, and only groups own children.
        if let Some(group) = &record.group_id {
            if group == id || !self.store.get(group).is_some_and(ShapeRecord::is_group) {
                log::debug!("update_shape: ignoring group_id {group} for {id}");
                record.group_id = before.group_id.clone();
            }
        }
        if !record.is_group() {
            record.children = before.children.clone();
        }
        if record == before {
            return false;
        }

        let ops = {
            let mut draft = Draft::new(&self.store);
            if record.group_id != before.group_id {
                if let Some(old) = &before.group_id {
                    draft.modify(old, |g| {
                        if let Some(children) = g.children.as_mut() {
                            children.retain(|c| c != id);
                        }
                    });
                }
                if let Some(new) = &record.group_id {
                    draft.modify(new, |g| {
                        let children = g.children.get_or_insert_with(Vec::new);
                        if !children.contains(id) {
                            children.push(id.clone());
                        }
                    });
                }
            }
            draft.put(record);
            draft.into_ops()
        };
        self.commit(ops)
    }

    /// Delete a shape and prune it from the selection.
    pub fn delete_shape(&mut self, id: &ShapeId) -> bool {
        if !self.store.contains(id) {
            return false;
        }
        let ops = {
            let mut draft = Draft::new(&self.store);
            draft.delete_linked(id);
            draft.into_ops()
        };
        let changed = self.commit(ops);
        self.prune_selection();
        changed
    }

    /// Delete every selected shape. Returns how many were selected.
    pub fn delete_selected(&mut self) -> usize {
        if self.selection.is_empty() {
            return 0;
        }
        let count = self.selection.len();
        let ops = {
            let mut draft = Draft::new(&self.store);
            for id in &self.selection {
                draft.delete_linked(id);
            }
            draft.into_ops()
        };
        self.commit(ops);
        self.prune_selection();
        count
    }

    /// Clone a shape (and a group's members) under new ids, offset and on top.
    pub fn duplicate_shape(&mut self, id: &ShapeId) -> Option<ShapeId> {
        let record = self.store.get(id)?.clone();
        let mut z = self.next_z_index();
        let offset = self.paste_offset;

        let (new_id, ops) = {
            let mut draft = Draft::new(&self.store);
            let new_id = clone_tree(&mut draft, &record, None, offset, &mut z);
            (new_id, draft.into_ops())
        };

        if !self.commit(ops) {
            return None;
        }
        self.selection = vec![new_id.clone()];
        Some(new_id)
    }

    /// Group at least two existing shapes under a new group record.
    pub fn group_shapes(&mut self, ids: &[ShapeId]) -> Option<ShapeId> {
        let wanted: HashSet<&ShapeId> = ids.iter().collect();
        let members: Vec<ShapeRecord> = self
            .store
            .shapes()
            .iter()
            .filter(|s| wanted.contains(&s.id))
            .cloned()
            .collect();
        if members.len() < 2 {
            return None;
        }

        let bounds = union_bounds(&members)?;
        let mut group = ShapeRecord::new(ShapeKind::Group, bounds.x0, bounds.y0)
            .with_size(bounds.width(), bounds.height());
        group.z_index = self.next_z_index();
        group.children = Some(members.iter().map(|m| m.id.clone()).collect());
        let group_id = group.id.clone();

        let ops = {
            let mut draft = Draft::new(&self.store);
            for member in &members {
                if let Some(previous) = &member.group_id {
                    draft.modify(previous, |g| {
                        if let Some(children) = g.children.as_mut() {
                            children.retain(|c| c != &member.id);
                        }
                    });
                }
                draft.modify(&member.id, |m| m.group_id = Some(group_id.clone()));
            }
            draft.append(group);
            draft.into_ops()
        };

        if !self.commit(ops) {
            return None;
        }
        self.selection = vec![group_id.clone()];
        Some(group_id)
    }

    /// Dissolve a group record; its members stay and become the selection.
    pub fn ungroup_shapes(&mut self, group_id: &ShapeId) -> Option<Vec<ShapeId>> {
        let group = self.store.get(group_id).filter(|g| g.is_group())?.clone();
        let children: Vec<ShapeId> = group
            .children
            .iter()
            .flatten()
            .filter(|c| self.store.contains(c))
            .cloned()
            .collect();

        let ops = {
            let mut draft = Draft::new(&self.store);
            draft.delete_linked(group_id);
            draft.into_ops()
        };

        if !self.commit(ops) {
            return None;
        }
        self.selection = children.clone();
        Some(children)
    }

    fn selected_records(&self) -> Vec<ShapeRecord> {
        self.selection
            .iter()
            .filter_map(|id| self.store.get(id))
            .cloned()
            .collect()
    }

    /// Align at least two selected shapes to an edge or center of their
    /// combined bounds.
    pub fn align_shapes(&mut self, alignment: Alignment) -> bool {
        let selected = self.selected_records();
        if selected.len() < 2 {
            return false;
        }
        let Some(bounds) = union_bounds(&selected) else {
            return false;
        };
        let center = bounds.center();

        let ops = {
            let mut draft = Draft::new(&self.store);
            for record in &selected {
                let (w, h) = (record.extent_x(), record.extent_y());
                draft.modify(&record.id, |r| match alignment {
                    Alignment::Left => r.x = bounds.x0,
                    Alignment::Right => r.x = bounds.x1 - w,
                    Alignment::Top => r.y = bounds.y0,
                    Alignment::Bottom => r.y = bounds.y1 - h,
                    Alignment::Center => r.x = center.x - w / 2.0,
                    Alignment::Middle => r.y = center.y - h / 2.0,
                });
            }
            draft.into_ops()
        };
        self.commit(ops)
    }

    /// Spread at least three selected shapes evenly along an axis.
    ///
    /// The first and last shapes by position stay put; interior near edges
    /// land on `first_near + i * (last_far - first_near) / (count - 1)`.
    pub fn distribute_shapes(&mut self, axis: Axis) -> bool {
        let mut selected = self.selected_records();
        if selected.len() < 3 {
            return false;
        }

        let near = |r: &ShapeRecord| match axis {
            Axis::Horizontal => r.x,
            Axis::Vertical => r.y,
        };
        let extent = |r: &ShapeRecord| match axis {
            Axis::Horizontal => r.extent_x(),
            Axis::Vertical => r.extent_y(),
        };
        selected.sort_by(|a, b| near(a).total_cmp(&near(b)));

        let count = selected.len();
        let first_near = near(&selected[0]);
        let last = &selected[count - 1];
        let last_far = near(last) + extent(last);
        let step = (last_far - first_near) / (count - 1) as f64;

        let ops = {
            let mut draft = Draft::new(&self.store);
            for (i, record) in selected.iter().enumerate().take(count - 1).skip(1) {
                let target = first_near + i as f64 * step;
                draft.modify(&record.id, |r| match axis {
                    Axis::Horizontal => r.x = target,
                    Axis::Vertical => r.y = target,
                });
            }
            draft.into_ops()
        };
        self.commit(ops)
    }

    /// Replace the selection with `id`, or toggle it when `additive`.
    pub fn select_shape(&mut self, id: &ShapeId, additive: bool) {
        if !self.store.contains(id) {
            return;
        }
        if !additive {
            self.selection = vec![id.clone()];
        } else if let Some(pos) = self.selection.iter().position(|s| s == id) {
            self.selection.remove(pos);
        } else {
            self.selection.push(id.clone());
        }
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn select_all(&mut self) {
        self.selection = self.store.shapes().iter().map(|s| s.id.clone()).collect();
    }

    /// Copy the selected records (and members of selected groups) into the
    /// clipboard. Returns the number of records copied.
    pub fn copy_shapes(&mut self) -> usize {
        if self.selection.is_empty() {
            return 0;
        }

        let mut included: HashSet<ShapeId> = HashSet::new();
        let mut pending: Vec<ShapeId> = self.selection.clone();
        while let Some(id) = pending.pop() {
            let Some(record) = self.store.get(&id) else {
                continue;
            };
            if included.insert(id) {
                pending.extend(record.children.iter().flatten().cloned());
            }
        }

        self.clipboard = self
            .store
            .shapes()
            .iter()
            .filter(|s| included.contains(&s.id))
            .cloned()
            .collect();
        self.clipboard.len()
    }

    /// Add the clipboard back as new shapes offset from the copied ones.
    ///
    /// Group links inside the clipboard are remapped to the new ids; links to
    /// shapes outside it are dropped. Repeated pastes keep cascading.
    pub fn paste_shapes(&mut self) -> Vec<ShapeId> {
        if self.clipboard.is_empty() {
            return Vec::new();
        }

        let offset = self.paste_offset;
        let remap: HashMap<ShapeId, ShapeId> = self
            .clipboard
            .iter()
            .map(|r| (r.id.clone(), ShapeId::new()))
            .collect();
        let mut z = self.next_z_index();

        let mut pasted = Vec::with_capacity(self.clipboard.len());
        let mut top_level = Vec::new();
        for source in &self.clipboard {
            let mut record = source.clone();
            record.id = remap[&source.id].clone();
            record.translate(offset, offset);
            record.z_index = z;
            z += 1;
            record.group_id = source.group_id.as_ref().and_then(|g| remap.get(g)).cloned();
            if let Some(children) = record.children.as_mut() {
                *children = children.iter().filter_map(|c| remap.get(c)).cloned().collect();
            }
            if record.group_id.is_none() {
                top_level.push(record.id.clone());
            }
            pasted.push(record);
        }

        let ids: Vec<ShapeId> = pasted.iter().map(|r| r.id.clone()).collect();
        let ops = pasted
            .into_iter()
            .map(|record| StoreOp::Insert {
                position: usize::MAX,
                record,
            })
            .collect();
        if !self.commit(ops) {
            return Vec::new();
        }

        for record in &mut self.clipboard {
            record.translate(offset, offset);
        }
        self.selection = top_level;
        ids
    }

    /// Restore the state before the last recorded change.
    pub fn undo(&mut self) -> bool {
        let current = self.store.shapes().to_vec();
        let Some(snapshot) = self.history.undo(&current) else {
            return false;
        };
        match self.store.replace_all(&snapshot) {
            Ok(_) => {
                self.prune_selection();
                true
            }
            Err(e) => {
                log::warn!("Undo failed: {e}");
                self.history.revert_undo(snapshot);
                false
            }
        }
    }

    /// Re-apply the last undone change.
    pub fn redo(&mut self) -> bool {
        let current = self.store.shapes().to_vec();
        let Some(snapshot) = self.history.redo(&current) else {
            return false;
        };
        match self.store.replace_all(&snapshot) {
            Ok(_) => {
                self.prune_selection();
                true
            }
            Err(e) => {
                log::warn!("Redo failed: {e}");
                self.history.revert_redo(snapshot);
                false
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }
}

/// Stage a copy of `source` and, for groups, of its members. Returns the id
/// of the copy of `source`.
fn clone_tree(
    draft: &mut Draft<'_>,
    source: &ShapeRecord,
    parent: Option<ShapeId>,
    offset: f64,
    z: &mut i64,
) -> ShapeId {
    let mut copy = source.clone();
    copy.id = ShapeId::new();
    copy.group_id = parent;
    copy.translate(offset, offset);

    if let Some(children) = &source.children {
        let store = draft.store;
        let mut new_children = Vec::with_capacity(children.len());
        for child_id in children {
            if let Some(child) = store.get(child_id) {
                new_children.push(clone_tree(draft, child, Some(copy.id.clone()), offset, z));
            }
        }
        copy.children = Some(new_children);
    }

    copy.z_index = *z;
    *z += 1;
    let id = copy.id.clone();
    draft.append(copy);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f64, y: f64, w: f64, h: f64) -> ShapeRecord {
        ShapeRecord::new(ShapeKind::Rect, x, y).with_size(w, h)
    }

    fn add(canvas: &mut Canvas, record: ShapeRecord) -> ShapeId {
        canvas.add_shape(record).unwrap()
    }

    fn x_of(canvas: &Canvas, id: &ShapeId) -> f64 {
        canvas.get(id).unwrap().x
    }

    #[test]
    fn test_add_assigns_fresh_id_and_top_z() {
        let mut canvas = Canvas::new();
        let template = rect(0.0, 0.0, 10.0, 10.0);
        let a = add(&mut canvas, template.clone());
        let b = add(&mut canvas, template.clone());
        assert_ne!(a, template.id);
        assert_ne!(a, b);

        for _ in 0..3 {
            let count = canvas.shapes().len() as i64;
            let id = add(&mut canvas, rect(0.0, 0.0, 1.0, 1.0));
            assert!(canvas.get(&id).unwrap().z_index >= count);
        }

        // Still on top after deletions shrink the count.
        canvas.delete_shape(&a);
        let top = canvas.shapes().iter().map(|s| s.z_index).max().unwrap();
        let c = add(&mut canvas, rect(0.0, 0.0, 1.0, 1.0));
        assert!(canvas.get(&c).unwrap().z_index > top);
        assert_eq!(canvas.shapes().last().unwrap().id, c);
    }

    #[test]
    fn test_update_merges_and_ignores_missing() {
        let mut canvas = Canvas::new();
        let id = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        assert!(canvas.update_shape(&id, &ShapePatch::position(5.0, 6.0)));
        let record = canvas.get(&id).unwrap();
        assert_eq!((record.x, record.y), (5.0, 6.0));
        assert_eq!(record.width, Some(10.0));

        let undo_depth = canvas.history().undo_count();
        assert!(!canvas.update_shape(&ShapeId::from("gone"), &ShapePatch::position(1.0, 1.0)));
        assert!(!canvas.update_shape(&id, &ShapePatch::position(5.0, 6.0)));
        assert_eq!(canvas.history().undo_count(), undo_depth);
    }

    #[test]
    fn test_delete_prunes_selection() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        canvas.select_all();
        assert!(canvas.delete_shape(&a));
        assert_eq!(canvas.selection(), &[b.clone()]);
        assert!(!canvas.delete_shape(&a));
    }

    #[test]
    fn test_duplicate_offsets_and_stacks_on_top() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(10.0, 15.0, 10.0, 10.0));
        add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));

        let copy = canvas.duplicate_shape(&a).unwrap();
        let record = canvas.get(&copy).unwrap();
        assert_eq!((record.x, record.y), (30.0, 35.0));
        assert_eq!(record.z_index, 2);
        assert_eq!(canvas.selection(), &[copy.clone()]);
        assert!(canvas.duplicate_shape(&ShapeId::from("missing")).is_none());
    }

    #[test]
    fn test_group_bounding_box() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 20.0, 10.0, 10.0));

        let group_id = canvas.group_shapes(&[a.clone(), b.clone()]).unwrap();
        let group = canvas.get(&group_id).unwrap();
        assert_eq!(group.kind, ShapeKind::Group);
        assert_eq!((group.x, group.y), (0.0, 0.0));
        assert_eq!((group.width, group.height), (Some(30.0), Some(30.0)));
        assert_eq!(group.children, Some(vec![a.clone(), b.clone()]));
        assert_eq!(canvas.get(&a).unwrap().group_id, Some(group_id.clone()));
        assert_eq!(canvas.get(&b).unwrap().group_id, Some(group_id.clone()));
        assert_eq!(canvas.selection(), &[group_id]);
    }

    #[test]
    fn test_group_needs_two_existing_shapes() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        assert!(canvas.group_shapes(&[a.clone()]).is_none());
        assert!(canvas.group_shapes(&[a.clone(), a.clone()]).is_none());
        assert!(canvas.group_shapes(&[a.clone(), ShapeId::from("ghost")]).is_none());
        assert_eq!(canvas.shapes().len(), 1);
    }

    #[test]
    fn test_group_ungroup_inverse() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(40.0, 5.0, 10.0, 10.0));

        let group_id = canvas.group_shapes(&[a.clone(), b.clone()]).unwrap();
        let children = canvas.ungroup_shapes(&group_id).unwrap();

        assert_eq!(children, vec![a.clone(), b.clone()]);
        assert_eq!(canvas.selection(), &[a.clone(), b.clone()]);
        assert!(canvas.get(&group_id).is_none());
        assert!(canvas.shapes().iter().all(|s| !s.is_group()));
        assert!(canvas.get(&a).unwrap().group_id.is_none());
        assert!(canvas.get(&b).unwrap().group_id.is_none());
    }

    #[test]
    fn test_ungroup_requires_group_record() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        assert!(canvas.ungroup_shapes(&a).is_none());
        assert!(canvas.ungroup_shapes(&ShapeId::from("nope")).is_none());
    }

    #[test]
    fn test_delete_group_and_member_repair_links() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 0.0, 10.0, 10.0));
        let c = add(&mut canvas, rect(40.0, 0.0, 10.0, 10.0));
        let group_id = canvas.group_shapes(&[a.clone(), b.clone(), c.clone()]).unwrap();

        canvas.delete_shape(&a);
        assert_eq!(
            canvas.get(&group_id).unwrap().children,
            Some(vec![b.clone(), c.clone()])
        );

        canvas.delete_shape(&group_id);
        assert!(canvas.get(&b).unwrap().group_id.is_none());
        assert!(canvas.get(&c).unwrap().group_id.is_none());
    }

    #[test]
    fn test_regrouping_moves_member_out_of_old_group() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 0.0, 10.0, 10.0));
        let c = add(&mut canvas, rect(40.0, 0.0, 10.0, 10.0));
        let first = canvas.group_shapes(&[a.clone(), b.clone()]).unwrap();
        let second = canvas.group_shapes(&[b.clone(), c.clone()]).unwrap();

        assert_eq!(canvas.get(&first).unwrap().children, Some(vec![a.clone()]));
        assert_eq!(canvas.get(&b).unwrap().group_id, Some(second));
    }

    #[test]
    fn test_update_rejects_dangling_group_links() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 0.0, 10.0, 10.0));
        let undo_depth = canvas.history().undo_count();

        assert!(!canvas.update_shape(&a, &ShapePatch::group(Some(ShapeId::from("ghost")))));
        assert!(!canvas.update_shape(&b, &ShapePatch::group(Some(a.clone()))));
        assert!(!canvas.update_shape(&b, &ShapePatch::group(Some(b.clone()))));
        let children = ShapePatch {
            children: Some(Some(vec![b.clone()])),
            ..ShapePatch::default()
        };
        assert!(!canvas.update_shape(&a, &children));

        assert!(canvas.get(&a).unwrap().group_id.is_none());
        assert!(canvas.get(&a).unwrap().children.is_none());
        assert!(canvas.get(&b).unwrap().group_id.is_none());
        assert_eq!(canvas.history().undo_count(), undo_depth);

        // Valid fields in the same patch still apply
        let mut mixed = ShapePatch::group(Some(ShapeId::from("ghost")));
        mixed.x = Some(7.0);
        assert!(canvas.update_shape(&a, &mixed));
        assert_eq!(x_of(&canvas, &a), 7.0);
        assert!(canvas.get(&a).unwrap().group_id.is_none());
    }

    #[test]
    fn test_update_group_link_keeps_children_in_step() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 0.0, 10.0, 10.0));
        let c = add(&mut canvas, rect(40.0, 0.0, 10.0, 10.0));
        let d = add(&mut canvas, rect(60.0, 0.0, 10.0, 10.0));
        let first = canvas.group_shapes(&[a.clone(), b.clone()]).unwrap();
        let second = canvas.group_shapes(&[c.clone(), d.clone()]).unwrap();

        assert!(canvas.update_shape(&a, &ShapePatch::group(Some(second.clone()))));
        assert_eq!(canvas.get(&first).unwrap().children, Some(vec![b.clone()]));
        assert_eq!(
            canvas.get(&second).unwrap().children,
            Some(vec![c.clone(), d.clone(), a.clone()])
        );

        assert!(canvas.update_shape(&a, &ShapePatch::group(None)));
        assert_eq!(canvas.get(&second).unwrap().children, Some(vec![c.clone(), d.clone()]));
        assert!(canvas.get(&a).unwrap().group_id.is_none());
    }

    #[test]
    fn test_duplicate_group_relinks_members() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 20.0, 10.0, 10.0));
        let group_id = canvas.group_shapes(&[a.clone(), b.clone()]).unwrap();

        let copy_id = canvas.duplicate_shape(&group_id).unwrap();
        assert_eq!(canvas.shapes().len(), 6);

        let copy = canvas.get(&copy_id).unwrap().clone();
        let members = copy.children.clone().unwrap();
        assert_eq!(members.len(), 2);
        for member in &members {
            assert!(member != &a && member != &b);
            assert_eq!(canvas.get(member).unwrap().group_id, Some(copy_id.clone()));
        }
        assert_eq!((copy.x, copy.y), (20.0, 20.0));
        assert_eq!(canvas.get(&group_id).unwrap().children, Some(vec![a, b]));
    }

    #[test]
    fn test_duplicate_member_is_ungrouped() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 20.0, 10.0, 10.0));
        canvas.group_shapes(&[a.clone(), b]).unwrap();
        let copy = canvas.duplicate_shape(&a).unwrap();
        assert!(canvas.get(&copy).unwrap().group_id.is_none());
    }

    #[test]
    fn test_align_every_edge() {
        let cases = [
            (Alignment::Left, [0.0, 0.0, 0.0], [0.0, 30.0, 60.0]),
            (Alignment::Right, [140.0, 150.0, 100.0], [0.0, 30.0, 60.0]),
            (Alignment::Center, [70.0, 75.0, 50.0], [0.0, 30.0, 60.0]),
            (Alignment::Top, [0.0, 50.0, 100.0], [0.0, 0.0, 0.0]),
            (Alignment::Bottom, [0.0, 50.0, 100.0], [65.0, 75.0, 60.0]),
            (Alignment::Middle, [0.0, 50.0, 100.0], [32.5, 37.5, 30.0]),
        ];

        for (alignment, xs, ys) in cases {
            let mut canvas = Canvas::new();
            let ids = [
                add(&mut canvas, rect(0.0, 0.0, 20.0, 10.0)),
                add(&mut canvas, rect(50.0, 30.0, 10.0, 0.0)),
                add(&mut canvas, rect(100.0, 60.0, 60.0, 15.0)),
            ];
            canvas.select_all();
            assert!(canvas.align_shapes(alignment), "{alignment:?}");
            for (i, id) in ids.iter().enumerate() {
                let record = canvas.get(id).unwrap();
                assert_eq!(record.x, xs[i], "{alignment:?} x of shape {i}");
                assert_eq!(record.y, ys[i], "{alignment:?} y of shape {i}");
            }
        }
    }

    #[test]
    fn test_align_left_matches_min_x() {
        let mut canvas = Canvas::new();
        let circle = ShapeRecord::new(ShapeKind::Circle, 7.0, 3.0).with_radius(5.0);
        let ids = [
            add(&mut canvas, rect(30.0, 0.0, 10.0, 10.0)),
            add(&mut canvas, circle),
            add(&mut canvas, rect(12.0, 40.0, 5.0, 5.0)),
        ];
        canvas.select_all();
        canvas.align_shapes(Alignment::Left);
        for id in &ids {
            assert_eq!(x_of(&canvas, id), 7.0);
        }
    }

    #[test]
    fn test_align_needs_two_selected() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(30.0, 0.0, 10.0, 10.0));
        canvas.select_shape(&a, false);
        assert!(!canvas.align_shapes(Alignment::Left));
        assert_eq!(x_of(&canvas, &a), 30.0);
    }

    #[test]
    fn test_distribute_middle_rectangle() {
        let mut canvas = Canvas::new();
        let left = add(&mut canvas, rect(0.0, 0.0, 20.0, 20.0));
        let right = add(&mut canvas, rect(120.0, 0.0, 20.0, 20.0));
        let middle = add(&mut canvas, rect(50.0, 0.0, 20.0, 20.0));
        canvas.select_all();

        assert!(canvas.distribute_shapes(Axis::Horizontal));
        assert_eq!(x_of(&canvas, &left), 0.0);
        assert_eq!(x_of(&canvas, &middle), 70.0);
        assert_eq!(x_of(&canvas, &right), 120.0);
    }

    #[test]
    fn test_distribute_vertical_endpoints_fixed() {
        let mut canvas = Canvas::new();
        let ys = [0.0, 10.0, 15.0, 90.0];
        let ids: Vec<ShapeId> = ys
            .iter()
            .map(|y| add(&mut canvas, rect(0.0, *y, 10.0, 10.0)))
            .collect();
        canvas.select_all();
        canvas.distribute_shapes(Axis::Vertical);

        let y = |i: usize| canvas.get(&ids[i]).unwrap().y;
        assert_eq!(y(0), 0.0);
        assert_eq!(y(3), 90.0);
        let step = (100.0 - 0.0) / 3.0;
        assert!((y(1) - step).abs() < 1e-9);
        assert!((y(2) - 2.0 * step).abs() < 1e-9);
    }

    #[test]
    fn test_distribute_needs_three_selected() {
        let mut canvas = Canvas::new();
        add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        add(&mut canvas, rect(100.0, 0.0, 10.0, 10.0));
        canvas.select_all();
        assert!(!canvas.distribute_shapes(Axis::Horizontal));
    }

    #[test]
    fn test_select_replace_and_toggle() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));

        canvas.select_shape(&a, false);
        canvas.select_shape(&b, true);
        assert_eq!(canvas.selection(), &[a.clone(), b.clone()]);
        canvas.select_shape(&a, true);
        assert_eq!(canvas.selection(), &[b.clone()]);
        canvas.select_shape(&a, false);
        assert_eq!(canvas.selection(), &[a.clone()]);
        canvas.select_shape(&ShapeId::from("ghost"), false);
        assert_eq!(canvas.selection(), &[a]);
        canvas.clear_selection();
        assert!(canvas.selection().is_empty());
    }

    #[test]
    fn test_copy_paste_is_decoupled() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(5.0, 5.0, 10.0, 10.0));
        canvas.select_shape(&a, false);
        assert_eq!(canvas.copy_shapes(), 1);

        let pasted = canvas.paste_shapes();
        assert_eq!(pasted.len(), 1);
        assert_ne!(pasted[0], a);
        assert_eq!(canvas.selection(), pasted.as_slice());
        let copy = canvas.get(&pasted[0]).unwrap();
        assert_eq!((copy.x, copy.y), (25.0, 25.0));

        canvas.update_shape(&a, &ShapePatch::position(500.0, 500.0));
        assert_eq!(x_of(&canvas, &pasted[0]), 25.0);

        let again = canvas.paste_shapes();
        assert_eq!(x_of(&canvas, &again[0]), 45.0);
    }

    #[test]
    fn test_paste_group_remaps_links() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 20.0, 10.0, 10.0));
        let group_id = canvas.group_shapes(&[a, b]).unwrap();
        assert_eq!(canvas.copy_shapes(), 3);

        let pasted = canvas.paste_shapes();
        assert_eq!(pasted.len(), 3);
        assert_eq!(canvas.selection().len(), 1);

        let new_group = canvas.get(&canvas.selection()[0]).unwrap().clone();
        assert!(new_group.is_group());
        assert_ne!(new_group.id, group_id);
        for child in new_group.children.unwrap() {
            assert!(pasted.contains(&child));
            assert_eq!(canvas.get(&child).unwrap().group_id, Some(new_group.id.clone()));
        }
    }

    #[test]
    fn test_undo_redo_symmetry() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        let b = add(&mut canvas, rect(20.0, 20.0, 10.0, 10.0));
        canvas.group_shapes(&[a.clone(), b.clone()]);
        canvas.update_shape(&a, &ShapePatch::position(3.0, 4.0));

        let before = canvas.shapes().to_vec();
        assert!(canvas.undo());
        assert_ne!(canvas.shapes(), before.as_slice());
        assert!(canvas.redo());
        assert_eq!(canvas.shapes(), before.as_slice());
    }

    #[test]
    fn test_undo_walks_back_to_empty() {
        let mut canvas = Canvas::new();
        let a = add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        canvas.select_shape(&a, false);
        canvas.delete_selected();
        assert!(canvas.shapes().is_empty());

        assert!(canvas.undo());
        assert_eq!(canvas.shapes().len(), 1);
        assert_eq!(canvas.shapes()[0].id, a);
        assert!(canvas.undo());
        assert!(canvas.shapes().is_empty());
        assert!(!canvas.undo());

        assert!(canvas.redo());
        assert!(canvas.redo());
        assert!(!canvas.redo());
        assert!(canvas.shapes().is_empty());
    }

    #[test]
    fn test_new_change_after_undo_truncates_redo() {
        let mut canvas = Canvas::new();
        add(&mut canvas, rect(0.0, 0.0, 10.0, 10.0));
        canvas.undo();
        assert!(canvas.can_redo());
        add(&mut canvas, rect(5.0, 5.0, 10.0, 10.0));
        assert!(!canvas.can_redo());
    }

    #[test]
    fn test_history_limit() {
        let mut canvas = Canvas::new().with_history_limit(2);
        for i in 0..4 {
            add(&mut canvas, rect(i as f64, 0.0, 1.0, 1.0));
        }
        assert!(canvas.undo());
        assert!(canvas.undo());
        assert!(!canvas.undo());
        assert_eq!(canvas.shapes().len(), 2);
    }
}
