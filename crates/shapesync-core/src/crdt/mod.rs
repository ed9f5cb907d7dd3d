//! CRDT integration using Loro for the shared shape sequence.
//!
//! Records live in a `shapes` map keyed by id; their order lives in a
//! `z_order` list. Loro's list CRDT resolves concurrent inserts at the same
//! slot with a deterministic tie-break, so every replica materializes the
//! same order once it has seen the same operations, in any delivery order and
//! with any duplication.

mod convert;
mod schema;

pub use convert::{record_from_loro, record_to_loro};
pub use schema::{
    version_of, ChangeOrigin, ObserverId, ShapeStore, StoreEvent, StoreOp, SHAPES_KEY, Z_ORDER_KEY,
};

// Re-export Loro types used by the replication layer
pub use loro::{ExportMode, VersionVector};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{ShapeId, ShapeKind, ShapeRecord};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn rect(id: &str, x: f64) -> ShapeRecord {
        ShapeRecord::new(ShapeKind::Rect, x, 0.0)
            .with_id(id)
            .with_size(10.0, 10.0)
    }

    fn ids(store: &ShapeStore) -> Vec<String> {
        store.shapes().iter().map(|s| s.id.to_string()).collect()
    }

    #[test]
    fn test_insert_delete_update() {
        let mut store = ShapeStore::new();
        store.insert(0, rect("a", 0.0)).unwrap();
        store.insert(1, rect("b", 10.0)).unwrap();
        store.insert(1, rect("c", 20.0)).unwrap();
        assert_eq!(ids(&store), ["a", "c", "b"]);

        let mut moved = store.get(&ShapeId::from("a")).unwrap().clone();
        moved.x = 99.0;
        assert!(store.update(moved).unwrap());
        assert_eq!(ids(&store), ["a", "c", "b"]);
        assert_eq!(store.get(&ShapeId::from("a")).unwrap().x, 99.0);

        assert!(store.delete(&ShapeId::from("c")).unwrap());
        assert!(!store.delete(&ShapeId::from("c")).unwrap());
        assert!(!store.update(rect("missing", 0.0)).unwrap());
        assert_eq!(ids(&store), ["a", "b"]);
    }

    #[test]
    fn test_insert_position_clamped() {
        let mut store = ShapeStore::new();
        store.insert(10, rect("a", 0.0)).unwrap();
        store.insert(10, rect("b", 0.0)).unwrap();
        assert_eq!(ids(&store), ["a", "b"]);
    }

    #[test]
    fn test_concurrent_inserts_converge() {
        // Two replicas insert at the same slot without seeing each other.
        let mut a = ShapeStore::new();
        let mut b = ShapeStore::new();
        let base = a.export_snapshot().unwrap();
        b.import(&base).unwrap();

        let va = a.version();
        let vb = b.version();
        a.insert(0, ShapeRecord::new(ShapeKind::Rect, 10.0, 10.0).with_id("s1")).unwrap();
        b.insert(0, ShapeRecord::new(ShapeKind::Circle, 50.0, 50.0).with_id("s2")).unwrap();

        let from_a = a.export_updates(&va).unwrap();
        let from_b = b.export_updates(&vb).unwrap();

        // Opposite delivery orders, with duplicates.
        b.import(&from_a).unwrap();
        b.import(&from_a).unwrap();
        a.import(&from_b).unwrap();

        assert_eq!(a.len(), 2);
        assert_eq!(a.shapes(), b.shapes());
        let order = ids(&a);
        assert!(order == ["s1", "s2"] || order == ["s2", "s1"]);
    }

    #[test]
    fn test_import_is_idempotent() {
        let mut source = ShapeStore::new();
        source.insert(0, rect("a", 0.0)).unwrap();
        source.delete(&ShapeId::from("a")).unwrap();
        source.insert(0, rect("b", 5.0)).unwrap();
        let updates = source.export_updates(&Default::default()).unwrap();

        let mut replica = ShapeStore::new();
        assert!(replica.import(&updates).unwrap());
        let once = replica.shapes().to_vec();
        assert!(!replica.import(&updates).unwrap());
        assert_eq!(replica.shapes(), once.as_slice());
        assert_eq!(replica.shapes(), source.shapes());
    }

    #[test]
    fn test_concurrent_delete_and_update() {
        let mut a = ShapeStore::new();
        a.insert(0, rect("x", 0.0)).unwrap();
        let mut b = ShapeStore::from_snapshot(&a.export_snapshot().unwrap()).unwrap();

        let va = a.version();
        let vb = b.version();
        a.delete(&ShapeId::from("x")).unwrap();
        b.update(rect("x", 42.0)).unwrap();

        let from_a = a.export_updates(&va).unwrap();
        let from_b = b.export_updates(&vb).unwrap();
        a.import(&from_b).unwrap();
        b.import(&from_a).unwrap();

        assert_eq!(a.shapes(), b.shapes());
    }

    #[test]
    fn test_observers_see_local_and_remote_changes() {
        let mut store = ShapeStore::new();
        let events: Rc<RefCell<Vec<(ChangeOrigin, usize)>>> = Rc::default();
        let sink = events.clone();
        let observer = store.observe(move |event| {
            sink.borrow_mut().push((event.origin, event.shapes.len()));
        });

        store.insert(0, rect("a", 0.0)).unwrap();

        let mut other = ShapeStore::new();
        other.insert(0, rect("b", 0.0)).unwrap();
        store.import(&other.export_snapshot().unwrap()).unwrap();

        assert_eq!(
            events.borrow().as_slice(),
            &[(ChangeOrigin::Local, 1), (ChangeOrigin::Remote, 2)]
        );

        assert!(store.unobserve(observer));
        store.delete(&ShapeId::from("a")).unwrap();
        assert_eq!(events.borrow().len(), 2);
    }

    #[test]
    fn test_batch_notifies_once() {
        let mut store = ShapeStore::new();
        let count = Rc::new(RefCell::new(0));
        let sink = count.clone();
        store.observe(move |_| *sink.borrow_mut() += 1);

        let applied = store
            .apply(vec![
                StoreOp::Insert { position: 0, record: rect("a", 0.0) },
                StoreOp::Insert { position: 1, record: rect("b", 0.0) },
                StoreOp::Delete(ShapeId::from("nope")),
            ])
            .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_replace_all_restores_exact_state() {
        let mut store = ShapeStore::new();
        store.insert(0, rect("a", 0.0)).unwrap();
        store.insert(1, rect("b", 10.0)).unwrap();
        store.insert(2, rect("c", 20.0)).unwrap();
        let saved = store.shapes().to_vec();

        store.delete(&ShapeId::from("a")).unwrap();
        store.update(rect("c", 77.0)).unwrap();
        store.insert(0, rect("d", 5.0)).unwrap();
        store
            .apply(vec![StoreOp::Move { id: ShapeId::from("b"), position: 2 }])
            .unwrap();

        store.replace_all(&saved).unwrap();
        assert_eq!(store.shapes(), saved.as_slice());

        // Already equal: nothing to do.
        assert_eq!(store.replace_all(&saved).unwrap(), 0);
    }

    #[test]
    fn test_paint_order_breaks_ties_by_sequence() {
        let mut store = ShapeStore::new();
        let mut high = rect("high", 0.0);
        high.z_index = 5;
        let mut low = rect("low", 0.0);
        low.z_index = 1;
        let mut tie = rect("tie", 0.0);
        tie.z_index = 1;
        store.insert(0, high).unwrap();
        store.insert(1, low).unwrap();
        store.insert(2, tie).unwrap();

        let painted: Vec<&str> = store.paint_order().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(painted, ["low", "tie", "high"]);
    }

    #[test]
    fn test_snapshot_roundtrip_and_version() {
        let mut store = ShapeStore::new();
        store.insert(0, rect("a", 3.0)).unwrap();
        let bytes = store.export_snapshot().unwrap();

        let restored = ShapeStore::from_snapshot(&bytes).unwrap();
        assert_eq!(restored.shapes(), store.shapes());
        assert_eq!(version_of(&bytes).unwrap(), store.version());
    }

    #[test]
    fn test_corrupt_import_is_an_error() {
        let mut store = ShapeStore::new();
        assert!(store.import(b"definitely not loro").is_err());
        assert!(store.is_empty());
    }
}
