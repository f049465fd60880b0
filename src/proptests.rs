//! Model-based checks against a reference `BTreeMap`.

use std::collections::BTreeMap;

use proptest::prelude::*;

use crate::{BwTree, Config};

/// Reference implementation: key to value multiset.
type Model = BTreeMap<u64, Vec<u64>>;

fn model_insert(model: &mut Model, key: u64, value: u64) {
    model.entry(key).or_default().push(value);
}

/// Mirrors the tree's contract: deleting a value removes every copy of it
/// under the key, and the key disappears with its last value.
fn model_delete(model: &mut Model, key: u64, value: u64) -> bool {
    let Some(bucket) = model.get_mut(&key) else {
        return false;
    };
    let before = bucket.len();
    bucket.retain(|v| *v != value);
    let hit = bucket.len() != before;
    let empty = bucket.is_empty();
    if empty {
        model.remove(&key);
    }
    hit
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Delete(u64, u64),
    Lookup(u64),
}

/// A narrow key domain with tiny nodes keeps splits and multi-value keys
/// frequent within a few hundred operations.
fn ops() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => (0u64..24, 0u64..4).prop_map(|(k, v)| Op::Insert(k, v)),
        2 => (0u64..24, 0u64..4).prop_map(|(k, v)| Op::Delete(k, v)),
        1 => (0u64..24).prop_map(Op::Lookup),
    ];
    prop::collection::vec(op, 1..250)
}

fn sorted(mut v: Vec<u64>) -> Vec<u64> {
    v.sort_unstable();
    v
}

proptest! {
    #[test]
    fn matches_a_btreemap_model(ops in ops()) {
        let tree: BwTree<u64, u64> = BwTree::with_config(Config {
            node_bytes: 64,
            ..Config::default()
        })
        .unwrap();
        let mut model = Model::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    prop_assert!(tree.insert(&k, v));
                    model_insert(&mut model, k, v);
                }
                Op::Delete(k, v) => {
                    prop_assert_eq!(tree.delete(&k, &v), model_delete(&mut model, k, v));
                }
                Op::Lookup(k) => {
                    let want = model.get(&k).cloned().unwrap_or_default();
                    prop_assert_eq!(sorted(tree.lookup(&k)), sorted(want));
                }
            }
        }

        let (keys, values) = tree.scan();
        prop_assert_eq!(&keys, &model.keys().copied().collect::<Vec<_>>());
        for (bucket, want) in values.into_iter().zip(model.values()) {
            prop_assert_eq!(sorted(bucket), sorted(want.clone()));
        }
    }

    #[test]
    fn unique_mode_admits_one_value_per_key(
        entries in prop::collection::vec((0u64..16, any::<u64>()), 1..64)
    ) {
        let tree: BwTree<u64, u64> = BwTree::with_config(Config {
            unique_keys: true,
            ..Config::default()
        })
        .unwrap();
        let mut seen = BTreeMap::new();

        for (k, v) in entries {
            let admitted = tree.insert(&k, v);
            prop_assert_eq!(admitted, !seen.contains_key(&k));
            seen.entry(k).or_insert(v);
        }

        for (k, v) in &seen {
            prop_assert_eq!(tree.lookup(k), vec![*v]);
        }
    }
}
