use std::{sync::Arc, thread};
use stripemap::HashMap;

/// Entries placed in the map up front.
const NUM_ENTRIES: usize = 16;

/// Rounds of the whole check.
const ITERATIONS: usize = 256;

/// Lookups every thread performs per entry.
const ROUNDS: usize = 32;

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_contains_key() {
    let map = HashMap::new();
    let mut content = [0; NUM_ENTRIES];
    {
        let map = map.pin();
        for (k, slot) in content.iter_mut().enumerate() {
            map.insert(k, k);
            *slot = k;
        }
    }
    let map = Arc::new(map);
    for _ in 0..ITERATIONS {
        check_once(content, map.clone());
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn contains_key_while_growing() {
    // lookups race with the resizes triggered by a writer
    let map = Arc::new(HashMap::<usize, usize>::new());
    {
        let map = map.pin();
        for k in 0..NUM_ENTRIES {
            map.insert(k, k);
        }
    }

    let writer = {
        let map = map.clone();
        thread::spawn(move || {
            let map = map.pin();
            for k in NUM_ENTRIES..NUM_ENTRIES * ROUNDS * 8 {
                map.insert(k, k);
            }
        })
    };
    check_once(std::array::from_fn(|k| k), map.clone());
    writer.join().expect("failed to join writer");
}

fn check_once(content: [usize; NUM_ENTRIES], map: Arc<HashMap<usize, usize>>) {
    let threads: Vec<_> = (0..num_cpus::get().min(8))
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let map = map.pin();
                for i in 0..NUM_ENTRIES * ROUNDS {
                    let key = content[i % content.len()];
                    assert!(map.contains_key(&key));
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("failed to join thread");
    }
}
