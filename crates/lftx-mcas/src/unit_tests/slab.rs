// Copyright © lftx Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::{Annotated, SlabMap, WriteEntry};
use claims::{assert_none, assert_some_eq};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

#[test]
fn put_replace_remove() {
    let map: SlabMap<WriteEntry> = SlabMap::with_slab_capacity(4);
    let e1 = WriteEntry {
        old_cnt: 0,
        old_val: 1,
        new_val: 2,
    };
    let e2 = WriteEntry {
        old_cnt: 4,
        old_val: 2,
        new_val: 3,
    };

    assert_none!(map.put(100, e1));
    assert_some_eq!(map.get(100), e1);
    assert_some_eq!(map.put(100, e2), e1);
    assert_some_eq!(map.get(100), e2);
    assert_some_eq!(map.remove(100), e2);
    assert_none!(map.get(100));
    assert_none!(map.remove(100));
}

#[test]
fn iterator_skips_removed_entries() {
    let map: SlabMap<Annotated> = SlabMap::with_slab_capacity(4);
    for key in 1..=6usize {
        map.put(key * 8, Annotated::new(key as u64, 0));
    }
    map.remove(16);
    map.remove(48);

    let mut seen: Vec<usize> = map.iter().map(|(k, _)| k).collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![8, 24, 32, 40]);
}

#[test]
fn spills_across_slabs() {
    let map: SlabMap<Annotated> = SlabMap::with_slab_capacity(3);
    for key in 1..=10usize {
        map.put(key * 8, Annotated::new(key as u64, 4));
    }
    for key in 1..=10usize {
        assert_some_eq!(map.get(key * 8), Annotated::new(key as u64, 4));
    }
    assert_eq!(map.iter().count(), 10);
}

#[test]
fn reset_allows_reuse() {
    let map: SlabMap<Annotated> = SlabMap::with_slab_capacity(3);
    for round in 0..5u64 {
        assert!(map.is_empty());
        for key in 1..=7usize {
            map.put(key * 8, Annotated::new(round * 100 + key as u64, 0));
        }
        for key in 1..=7usize {
            assert_some_eq!(map.get(key * 8), Annotated::new(round * 100 + key as u64, 0));
        }
        assert_eq!(map.iter().count(), 7);
        map.reset();
        assert_none!(map.get(8));
        assert_eq!(map.iter().count(), 0);
    }
}

/// Randomized differential test against HashMap. Replacement through `put`
/// allocates a fresh slot, so slot churn is exercised too.
#[test]
fn randomized_against_hashmap() {
    let map: SlabMap<Annotated> = SlabMap::new();
    let mut model: HashMap<usize, Annotated> = HashMap::new();
    let mut rng = SmallRng::seed_from_u64(7);

    for _ in 0..2_000 {
        let key = (rng.gen_range(0usize, 64) + 1) * 8;
        match rng.gen_range(0u32, 3) {
            0 => {
                let val = Annotated::new(rng.gen::<u32>() as u64, 0);
                assert_eq!(map.put(key, val), model.insert(key, val));
            },
            1 => {
                assert_eq!(map.remove(key), model.remove(&key));
            },
            _ => {
                assert_eq!(map.get(key), model.get(&key).copied());
            },
        }
    }

    let mut seen: Vec<(usize, Annotated)> = map.iter().collect();
    seen.sort_unstable_by_key(|(k, _)| *k);
    let mut expected: Vec<(usize, Annotated)> = model.into_iter().collect();
    expected.sort_unstable_by_key(|(k, _)| *k);
    assert_eq!(seen, expected);
}
