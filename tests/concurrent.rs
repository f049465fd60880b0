//! Multi-thread and randomized workloads over the public interface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use bewick::{BwTree, Config};

/// Small nodes so these workloads split constantly.
fn small_config() -> Config {
    Config {
        node_bytes: 64,
        ..Config::default()
    }
}

#[test]
fn concurrent_inserts_with_disjoint_values() {
    let tree = Arc::new(BwTree::<u64, u64>::with_config(small_config()).unwrap());
    const KEYS: u64 = 1000;
    const THREADS: u64 = 2;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for k in 1..=KEYS {
                assert!(tree.insert(&k, k * 10 + t));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(tree.scan_all().len(), (KEYS * THREADS) as usize);

    let (keys, values) = tree.scan();
    assert_eq!(keys, (1..=KEYS).collect::<Vec<_>>());
    for (k, bucket) in keys.iter().zip(&values) {
        let mut bucket = bucket.clone();
        bucket.sort_unstable();
        assert_eq!(bucket, vec![k * 10, k * 10 + 1]);
    }
}

#[test]
fn concurrent_churn_conserves_values() {
    // After N inserts and M matching deletes exactly N - M values survive.
    let tree = Arc::new(BwTree::<u64, u64>::with_config(small_config()).unwrap());
    const THREADS: u64 = 4;
    const KEYS: u64 = 250;

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let tree = Arc::clone(&tree);
        handles.push(thread::spawn(move || {
            for k in 0..KEYS {
                assert!(tree.insert(&k, k * THREADS + t));
            }
            for k in (1..KEYS).step_by(2) {
                assert!(tree.delete(&k, &(k * THREADS + t)));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let inserted = THREADS * KEYS;
    let deleted = THREADS * (KEYS / 2);
    assert_eq!(tree.scan_all().len(), (inserted - deleted) as usize);

    let (keys, values) = tree.scan();
    assert_eq!(keys, (0..KEYS).step_by(2).collect::<Vec<_>>());
    for bucket in &values {
        assert_eq!(bucket.len(), THREADS as usize);
    }
}

#[test]
fn readers_observe_only_committed_values() {
    let tree = Arc::new(BwTree::<u64, u64>::with_config(small_config()).unwrap());
    const KEYS: u64 = 2000;

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            for k in 1..=KEYS {
                tree.insert(&k, k + 7);
            }
        })
    };

    let mut readers = Vec::new();
    for _ in 0..2 {
        let tree = Arc::clone(&tree);
        readers.push(thread::spawn(move || {
            for _ in 0..50 {
                let (keys, _) = tree.scan();
                assert!(keys.windows(2).all(|w| w[0] < w[1]));
                for k in [1u64, KEYS / 2, KEYS - 1] {
                    let vals = tree.lookup(&k);
                    assert!(vals.is_empty() || vals == vec![k + 7]);
                }
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(tree.scan_all().len(), KEYS as usize);
    for k in 1..=KEYS {
        assert_eq!(tree.lookup(&k), vec![k + 7]);
    }
}

#[test]
fn seeded_random_workload_matches_a_model() {
    let tree = BwTree::<u64, u64>::with_config(small_config()).unwrap();
    let mut model: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xb371ee);

    for _ in 0..5000 {
        let key = rng.gen_range(0..64u64);
        match rng.gen_range(0..10u32) {
            0..=5 => {
                let value = rng.gen_range(0..8u64);
                assert!(tree.insert(&key, value));
                model.entry(key).or_default().push(value);
            }
            6..=8 => {
                let value = rng.gen_range(0..8u64);
                let mut expect = false;
                let mut now_empty = false;
                if let Some(bucket) = model.get_mut(&key) {
                    let before = bucket.len();
                    bucket.retain(|v| *v != value);
                    expect = bucket.len() != before;
                    now_empty = bucket.is_empty();
                }
                if now_empty {
                    model.remove(&key);
                }
                assert_eq!(tree.delete(&key, &value), expect);
            }
            _ => {
                let mut got = tree.lookup(&key);
                got.sort_unstable();
                let mut want = model.get(&key).cloned().unwrap_or_default();
                want.sort_unstable();
                assert_eq!(got, want);
            }
        }
    }

    let (keys, values) = tree.scan();
    assert_eq!(keys, model.keys().copied().collect::<Vec<_>>());
    for (bucket, want) in values.iter().zip(model.values()) {
        let mut bucket = bucket.clone();
        bucket.sort_unstable();
        let mut want = want.clone();
        want.sort_unstable();
        assert_eq!(&bucket, &want);
    }
}
