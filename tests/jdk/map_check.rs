use rand::prelude::*;
use std::hash::Hash;
use stripemap::HashMap;

#[cfg(not(miri))]
const SIZE: usize = 50_000;
#[cfg(miri)]
const SIZE: usize = 12;

// more keys must be absent than present
#[cfg(not(miri))]
const ABSENT_SIZE: usize = 1 << 17;
#[cfg(miri)]
const ABSENT_SIZE: usize = 1 << 5;

const ABSENT_MASK: usize = ABSENT_SIZE - 1;

fn count_present<K, V>(map: &HashMap<K, V>, keys: &[K], expect: usize)
where
    K: Hash + Eq,
{
    let iters = 4;
    let map = map.pin();
    let mut sum = 0;
    for _ in 0..iters {
        sum += keys.iter().filter(|k| map.get(*k).is_some()).count();
    }
    assert_eq!(sum, expect * iters);
}

fn remove_all(map: &HashMap<usize, usize>, keys: &[usize], expect: usize) {
    let map = map.pin();
    let sum = keys.iter().filter(|k| map.remove(*k).is_some()).count();
    assert_eq!(sum, expect);
}

fn insert_all(map: &HashMap<usize, usize>, keys: &[usize], expect: usize) {
    let map = map.pin();
    let sum = keys.iter().filter(|&&k| map.insert(k, 0).is_none()).count();
    assert_eq!(sum, expect);
}

fn try_insert_all(map: &HashMap<usize, usize>, keys: &[usize], expect: usize) {
    let map = map.pin();
    let sum = keys.iter().filter(|&&k| map.try_insert(k, 1).is_ok()).count();
    assert_eq!(sum, expect);
}

fn contains_all(map: &HashMap<usize, usize>, keys: &[usize], expect: usize) {
    let map = map.pin();
    let sum = keys.iter().filter(|k| map.contains_key(*k)).count();
    assert_eq!(sum, expect);
}

fn remove_every_other(map: &HashMap<usize, usize>, keys: &[usize], expect: usize) {
    let map = map.pin();
    let mut sum = 0;
    let mut i = keys.len() as isize - 2;
    while i >= 0 {
        if map.remove(&keys[i as usize]).is_some() {
            sum += 1;
        }
        i -= 2;
    }
    assert_eq!(sum, expect);
}

fn get_mixed(map: &HashMap<usize, usize>, present: &[usize], absent: &[usize], expect: usize) {
    let map = map.pin();
    let mut sum = 0;
    for i in 0..expect {
        if map.get(&present[i]).is_some() {
            sum += 1;
        }
        if map.get(&absent[i & ABSENT_MASK]).is_some() {
            sum += 1;
        }
    }
    assert_eq!(sum, expect);
}

fn contains_mixed(map: &HashMap<usize, usize>, present: &[usize], absent: &[usize]) {
    let map = map.pin();
    let mut sum = 0;
    for (p, a) in present.iter().zip(absent) {
        if map.contains_key(p) {
            sum += 1;
        }
        if map.contains_key(a) {
            sum += 1;
        }
    }
    assert_eq!(sum, present.len().min(absent.len()));
}

fn bump_all(map: &HashMap<usize, usize>, keys: &[usize], expect: usize) {
    let map = map.pin();
    let sum = keys
        .iter()
        .filter(|k| map.compute_if_present(*k, |_, v| Some(v + 1)).is_some())
        .count();
    assert_eq!(sum, expect);
}

fn iterate(map: &HashMap<usize, usize>, expect: usize) {
    let map = map.pin();
    assert_eq!(map.keys().count(), expect);
    assert_eq!(map.values().count(), expect);
    assert_eq!(map.iter().count(), expect);
    let mut visited = 0;
    map.for_each(|_, _| visited += 1);
    assert_eq!(visited, expect);
}

#[test]
fn everything() {
    let mut rng = rand::thread_rng();

    let map = HashMap::new();
    let mut keys: Vec<_> = (0..ABSENT_SIZE + SIZE).collect();
    keys.shuffle(&mut rng);
    let absent_keys = &keys[0..ABSENT_SIZE];
    let keys = &keys[ABSENT_SIZE..];

    // insert (absent)
    insert_all(&map, keys, SIZE);
    // insert (present)
    insert_all(&map, keys, 0);
    // try_insert (present)
    try_insert_all(&map, keys, 0);
    // contains_key (present and absent)
    contains_mixed(&map, keys, absent_keys);
    // contains_key (present)
    contains_all(&map, keys, SIZE);
    // contains_key (absent)
    contains_all(&map, absent_keys, 0);
    // get
    get_mixed(&map, keys, absent_keys, SIZE);
    // get (present)
    count_present(&map, keys, SIZE);
    // get (absent)
    count_present(&map, absent_keys, 0);
    // compute_if_present (present and absent)
    bump_all(&map, keys, SIZE);
    bump_all(&map, absent_keys, 0);
    // remove (absent)
    remove_all(&map, absent_keys, 0);
    // remove (present)
    remove_every_other(&map, keys, SIZE / 2);
    // try_insert (half present)
    try_insert_all(&map, keys, SIZE / 2);
    // iteration (present)
    iterate(&map, SIZE);
    assert_eq!(map.len(), SIZE);
    // remove (present)
    remove_all(&map, keys, SIZE);
    iterate(&map, 0);
    assert!(map.is_empty());
}
