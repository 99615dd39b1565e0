use rand::Rng;
use std::sync::Arc;
use stripemap::HashMap;

/// Entries each thread associates per round.
#[cfg(not(miri))]
const NUM_ENTRIES: usize = 128;
#[cfg(miri)]
const NUM_ENTRIES: usize = 4;

/// Rounds per associating operation.
#[cfg(not(miri))]
const ITERATIONS: usize = 64;
#[cfg(miri)]
const ITERATIONS: usize = 1;

#[derive(Hash, PartialEq, Eq, Clone, Copy, Debug)]
struct KeyVal {
    _data: usize,
}

impl KeyVal {
    fn random() -> Self {
        Self {
            _data: rand::thread_rng().gen(),
        }
    }
}

type Associator = fn(&HashMap<KeyVal, KeyVal>, KeyVal);

fn insert(map: &HashMap<KeyVal, KeyVal>, k: KeyVal) {
    map.pin().insert(k, k);
}

fn try_insert(map: &HashMap<KeyVal, KeyVal>, k: KeyVal) {
    let _ = map.pin().try_insert(k, k);
}

fn compute_if_absent(map: &HashMap<KeyVal, KeyVal>, k: KeyVal) {
    map.pin().compute_if_absent(k, || k);
}

fn compute(map: &HashMap<KeyVal, KeyVal>, k: KeyVal) {
    map.pin().compute(k, |_| Some(k));
}

fn merge(map: &HashMap<KeyVal, KeyVal>, k: KeyVal) {
    map.pin().merge(k, k, |_, new| Some(new));
}

#[test]
fn concurrent_insert() {
    run(insert);
}

#[test]
fn concurrent_try_insert() {
    run(try_insert);
}

#[test]
fn concurrent_compute_if_absent() {
    run(compute_if_absent);
}

#[test]
fn concurrent_compute() {
    run(compute);
}

#[test]
fn concurrent_merge() {
    run(merge);
}

fn run(associate: Associator) {
    for _ in 0..ITERATIONS {
        run_once(associate);
    }
}

fn run_once(associate: Associator) {
    let map = Arc::new(HashMap::new());
    let threads: Vec<_> = (0..num_cpus::get().min(8))
        .map(|_| {
            let map = map.clone();
            std::thread::spawn(move || {
                for _ in 0..NUM_ENTRIES {
                    let key = KeyVal::random();
                    associate(&map, key);
                    let map = map.pin();
                    assert!(map.contains_key(&key));
                    assert_eq!(map.get(&key), Some(&key));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("failed to join thread");
    }
}
