//! Property tests for typed storage.
//!
//! Random values, shapes and entity mixes are written through the typed layer
//! and read back through handles and filters.

use std::sync::Arc;

use proptest::prelude::*;
use tessera::prelude::*;

/// Finite f32 values, so equality comparisons are meaningful.
fn finite_f32() -> impl Strategy<Value = f32> {
    (-1_000_000i32..1_000_000i32).prop_map(|v| v as f32 * 0.01)
}

fn shape() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1..4usize, 1..3)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Whatever is set is what `get` returns, element for element.
    #[test]
    fn set_get_round_trip(
        shape in shape(),
        seed in prop::collection::vec(finite_f32(), 9),
    ) {
        let mut world = World::new();
        let c = world.component::<f32>("Value", &shape).unwrap();
        let values: Vec<f32> = seed.iter().copied().cycle().take(c.element_count()).collect();

        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        handle.set(&c, &values).unwrap();
        let view = handle.get::<f32>(&c).unwrap();
        prop_assert_eq!(view.shape(), &shape[..]);
        prop_assert_eq!(view.as_slice(), &values[..]);
    }

    /// Integer element types round-trip too, including through migration.
    #[test]
    fn integer_values_survive_migration(a in any::<i64>(), b in any::<u16>(), c in any::<u8>()) {
        let mut world = World::new();
        let big = world.component::<i64>("Big", &[1]).unwrap();
        let small = world.component::<u16>("Small", &[2]).unwrap();
        let flag = world.component::<u8>("Flag", &[1]).unwrap();

        let e = world.entity().unwrap();
        let mut handle = world.entity_mut(e).unwrap();
        handle.set(&big, &[a]).unwrap();
        handle.set(&small, &[b, b.wrapping_add(1)]).unwrap();
        handle.set(&flag, &[c]).unwrap();
        handle.remove(&flag).unwrap();

        prop_assert_eq!(handle.get::<i64>(&big).unwrap().as_slice(), &[a][..]);
        prop_assert_eq!(handle.get::<u16>(&small).unwrap().as_slice(), &[b, b.wrapping_add(1)][..]);
        prop_assert!(!handle.has(&flag));
    }

    /// A raw buffer of `k * total_bytes` bytes yields a view with `k` rows.
    #[test]
    fn view_rows_follow_buffer_length(k in 0..20usize) {
        let mut world = World::new();
        let c = world.component::<f32>("Position", &[3]).unwrap();
        prop_assert_eq!(c.total_bytes(), 12);
        let values = vec![0f32; 3 * k];
        let view = c.create_view::<f32>(bytemuck::cast_slice(&values)).unwrap();
        prop_assert_eq!(view.rows(), k);
    }

    /// N entities with A and B, M with only A: a filter on (A, B) yields N rows
    /// and one on A yields N + M, however the entities are grouped.
    #[test]
    fn filter_cardinality(n in 0..40usize, m in 0..40usize, extra_tags in 0..4usize) {
        let mut world = World::new();
        let a = world.component::<f32>("A", &[2]).unwrap();
        let b = world.component::<f32>("B", &[1]).unwrap();
        let tags: Vec<Entity> = (0..extra_tags)
            .map(|i| world.tag(&format!("T{i}")).unwrap())
            .collect();

        for i in 0..(n + m) {
            let e = world.entity().unwrap();
            let mut handle = world.entity_mut(e).unwrap();
            handle.set(&a, &[1.0f32, 1.0]).unwrap();
            if i < n {
                handle.set(&b, &[1.0f32]).unwrap();
            }
            if !tags.is_empty() {
                handle.add(tags[i % tags.len()]).unwrap();
            }
        }

        let mut both = world.filter_builder().term(&a).term(&b).build().unwrap();
        let mut only_a = world.filter_builder().expr("A").build().unwrap();
        prop_assert_eq!(both.count(&mut world), n);
        prop_assert_eq!(only_a.count(&mut world), n + m);

        let mut rows = 0;
        let mut it = both.iter(&mut world);
        while it.advance() {
            let col = it.column::<f32>("A").unwrap();
            prop_assert_eq!(col.rows(), it.count());
            prop_assert_eq!(it.entities().len(), it.count());
            rows += col.rows();
        }
        prop_assert_eq!(rows, n);
    }

    /// A rejected bulk build leaves the entity count untouched; an accepted one
    /// adds exactly the staged row count.
    #[test]
    fn bulk_commit_is_atomic(rows_a in 1..30usize, rows_b in 1..30usize) {
        let mut world = World::new();
        let a = world.component::<f32>("A", &[2]).unwrap();
        let b = world.component::<i32>("B", &[1]).unwrap();
        let before = world.entity_count();

        let mut builder = world.bulk_entity_builder();
        builder.add(&a, &vec![0.5f32; rows_a * 2]).unwrap();
        let staged = builder.add(&b, &vec![7i32; rows_b]).map(|_| ());

        if rows_a == rows_b {
            prop_assert!(staged.is_ok());
            let entities = builder.build().unwrap();
            prop_assert_eq!(entities.len(), rows_a);
            prop_assert_eq!(world.entity_count(), before + rows_a);
        } else {
            let is_count_mismatch = matches!(staged, Err(TesseraError::CountMismatch { .. }));
            prop_assert!(is_count_mismatch);
            drop(builder);
            prop_assert_eq!(world.entity_count(), before);
        }
    }

    /// Repeated component creation returns the same descriptor instance.
    #[test]
    fn component_names_are_cached(shape in shape(), repeats in 1..5usize) {
        let mut world = World::new();
        let first = world.component::<f64>("Cached", &shape).unwrap();
        for _ in 0..repeats {
            let again = world.component::<f64>("Cached", &shape).unwrap();
            prop_assert!(Arc::ptr_eq(&first, &again));
            prop_assert_eq!(again.total_bytes(), first.total_bytes());
        }
        let looked_up = world.lookup_component("Cached").unwrap();
        prop_assert!(Arc::ptr_eq(&first, &looked_up));
    }

    /// Destroying random entities never disturbs the data of the survivors.
    #[test]
    fn survivors_keep_their_data(count in 2..40usize, doomed in prop::collection::vec(0..40usize, 0..10)) {
        let mut world = World::new();
        let id = world.component::<u32>("Id", &[1]).unwrap();
        let mut builder = world.bulk_entity_builder();
        let values: Vec<u32> = (0..count as u32).collect();
        builder.add(&id, &values).unwrap();
        let mut alive: Vec<(Entity, u32)> = builder.build().unwrap().into_iter().zip(values).collect();

        for d in doomed {
            if alive.is_empty() {
                break;
            }
            let (e, _) = alive.remove(d % alive.len());
            world.destroy(e).unwrap();
            prop_assert!(!world.is_alive(e));
        }
        for &(e, v) in &alive {
            let handle = world.entity_mut(e).unwrap();
            prop_assert_eq!(handle.get::<u32>(&id).unwrap().as_slice(), &[v][..]);
        }
    }
}
