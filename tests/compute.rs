use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use stripemap::HashMap;

#[cfg(not(miri))]
const NUM_THREADS: usize = 8;
#[cfg(miri)]
const NUM_THREADS: usize = 2;
#[cfg(not(miri))]
const ITERATIONS: usize = 1_000;
#[cfg(miri)]
const ITERATIONS: usize = 16;

#[test]
fn compute_against_concurrent_get() {
    let map = Arc::new(HashMap::<&'static str, usize>::with_capacity(16));
    {
        let map = map.pin();
        map.insert("a", 1);
        map.insert("b", 2);
    }

    let barrier = Arc::new(Barrier::new(2));
    let writer = {
        let map = map.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            let map = map.pin();
            assert_eq!(map.compute("a", |v| v.map(|v| v + 10)), Some(&11));
        })
    };
    let reader = {
        let map = map.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..ITERATIONS {
                let map = map.pin();
                let v = *map.get("a").unwrap();
                assert!(v == 1 || v == 11, "saw {}", v);
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    let map = map.pin();
    assert_eq!(map.get("a"), Some(&11));
    assert_eq!(map.get("b"), Some(&2));
}

#[test]
fn remove_even_keys() {
    let n = if cfg!(miri) { 40 } else { 1000 };
    let map = HashMap::<String, usize>::new();
    let map = map.pin();
    for i in 0..n {
        map.insert(format!("k{}", i), i);
    }
    for i in (0..n).step_by(2) {
        assert_eq!(map.remove(&format!("k{}", i)), Some(&i));
    }

    assert_eq!(map.len(), n / 2);
    assert_eq!(map.get("k1"), Some(&1));
    assert_eq!(map.get("k0"), None);
    for i in 0..n {
        assert_eq!(map.contains_key(&format!("k{}", i)), i % 2 == 1);
    }
}

#[test]
fn remove_is_idempotent() {
    let map = HashMap::<usize, usize>::new();
    let map = map.pin();
    map.insert(1, 1);
    map.insert(2, 2);

    assert_eq!(map.remove(&1), Some(&1));
    assert_eq!(map.remove(&1), None);
    assert_eq!(map.remove(&1), None);
    assert_eq!(map.remove(&3), None);
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&2), Some(&2));
}

#[test]
fn compute_inserts_updates_and_removes() {
    let map = HashMap::<usize, usize>::new();
    let map = map.pin();

    // absent and staying absent
    assert_eq!(map.compute(1, |v| v.copied()), None);
    assert!(map.is_empty());

    assert_eq!(map.compute(1, |v| Some(v.map_or(0, |v| v + 1))), Some(&0));
    assert_eq!(map.compute(1, |v| Some(v.map_or(0, |v| v + 1))), Some(&1));
    assert_eq!(map.len(), 1);

    assert_eq!(map.compute(1, |_| None), None);
    assert!(map.get(&1).is_none());
    assert_eq!(map.len(), 0);
}

#[test]
fn compute_if_absent_runs_once() {
    let map = Arc::new(HashMap::<usize, usize>::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let map = map.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let map = map.pin();
                let v = *map.compute_if_absent(42, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    t
                });
                v
            })
        })
        .collect();

    let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // everybody observed the one value that made it in
    assert!(seen.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(map.pin().get(&42), Some(&seen[0]));
}

#[test]
fn compute_if_absent_after_removal() {
    let map = HashMap::<usize, usize>::new();
    let map = map.pin();
    assert_eq!(map.compute_if_absent(7, || 1), &1);
    map.remove(&7);
    assert_eq!(map.compute_if_absent(7, || 2), &2);
    assert_eq!(map.len(), 1);
}

#[test]
fn compute_if_absent_mixed_with_inserts() {
    let map = HashMap::<usize, usize>::new();
    let map = map.pin();
    for i in 0..64 {
        map.insert(i * 16, i);
    }
    for i in 0..128 {
        let expected = if i < 64 { i } else { i * 2 };
        assert_eq!(map.compute_if_absent(i * 16, || i * 2), &expected);
    }
    assert_eq!(map.len(), 128);
}

#[test]
fn concurrent_compute_counts() {
    let map = Arc::new(HashMap::<usize, usize>::new());
    let keys = 4;

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    let map = map.pin();
                    map.compute(i % keys, |v| Some(v.map_or(1, |v| v + 1)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let map = map.pin();
    let total: usize = map.values().sum();
    assert_eq!(total, NUM_THREADS * ITERATIONS);
    assert_eq!(map.len(), keys);
}

#[test]
fn concurrent_merge_counts() {
    let map = Arc::new(HashMap::<String, usize>::new());

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let map = map.clone();
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    // spread over enough keys to force a few resizes along the way
                    let key = format!("word{}", (i * 7 + t) % 97);
                    map.pin().merge(key, 1, |old, one| Some(old + one));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let map = map.pin();
    let total: usize = map.values().sum();
    assert_eq!(total, NUM_THREADS * ITERATIONS);
}

#[test]
fn merge_can_remove() {
    let map = HashMap::<&'static str, usize>::new();
    let map = map.pin();
    assert_eq!(map.merge("x", 3, |_, _| None), Some(&3));
    assert_eq!(map.merge("x", 3, |_, _| None), None);
    assert!(map.is_empty());
}

#[test]
fn replace_compares_values() {
    let map = HashMap::<usize, String>::new();
    let map = map.pin();

    assert!(!map.replace(&1, &"a".to_string(), "b".to_string()));
    assert!(map.is_empty());

    map.insert(1, "a".to_string());
    assert!(map.replace(&1, &"a".to_string(), "b".to_string()));
    assert!(!map.replace(&1, &"a".to_string(), "c".to_string()));
    assert_eq!(map.get(&1).map(String::as_str), Some("b"));
}

#[test]
fn replace_as_compare_and_swap() {
    let map = Arc::new(HashMap::<usize, usize>::new());
    map.pin().insert(0, 0);

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let mut done = 0;
                while done < ITERATIONS {
                    let map = map.pin();
                    let current = *map.get(&0).unwrap();
                    if map.replace(&0, &current, current + 1) {
                        done += 1;
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(map.pin().get(&0), Some(&(NUM_THREADS * ITERATIONS)));
}

#[test]
fn remove_pair_only_on_match() {
    let map = HashMap::<usize, usize>::new();
    let map = map.pin();
    map.insert(1, 10);

    assert!(!map.remove_pair(&1, &11));
    assert!(!map.remove_pair(&2, &10));
    assert_eq!(map.get(&1), Some(&10));
    assert!(map.remove_pair(&1, &10));
    assert!(!map.remove_pair(&1, &10));
    assert!(map.is_empty());
}

#[test]
fn replace_if_exists_only_when_present() {
    let map = HashMap::<usize, usize>::new();
    let map = map.pin();

    assert_eq!(map.replace_if_exists(&1, 1), None);
    assert!(map.is_empty());
    map.insert(1, 1);
    assert_eq!(map.replace_if_exists(&1, 2), Some(&1));
    assert_eq!(map.get(&1), Some(&2));
}
