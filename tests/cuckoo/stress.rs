// Modeled on libcuckoo's stress tests:
// https://github.com/efficient/libcuckoo/tree/master/tests/stress-tests

use parking_lot::Mutex;
use rand::distributions::{Distribution, Uniform};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use stripemap::HashMap;

/// Number of keys to work with.
const NUM_KEYS: usize = 1 << 12;
/// Number of threads of each kind.
const NUM_THREADS: usize = 4;
/// How long the stress test runs.
const TEST_LEN: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Default)]
struct Slot {
    present: bool,
    val1: usize,
    val2: usize,
}

/// Two maps that must always hold the same key set, and a record of what they should contain.
///
/// A worker claims a key before touching it, so the record for a claimed key can only change
/// under that worker.
struct Environment {
    table1: HashMap<usize, usize>,
    table2: HashMap<usize, usize>,
    claimed: Vec<AtomicBool>,
    expected: Vec<Mutex<Slot>>,
    key_dist: Uniform<usize>,
    val_dist: Uniform<usize>,
    finished: AtomicBool,
}

impl Environment {
    fn new() -> Self {
        Self {
            // start small so that the run goes through plenty of resizes
            table1: HashMap::new(),
            table2: HashMap::with_capacity(NUM_KEYS),
            claimed: (0..NUM_KEYS).map(|_| AtomicBool::new(false)).collect(),
            expected: (0..NUM_KEYS).map(|_| Mutex::new(Slot::default())).collect(),
            key_dist: Uniform::from(0..NUM_KEYS),
            val_dist: Uniform::from(0..usize::MAX),
            finished: AtomicBool::new(false),
        }
    }

    /// Runs `f` on a random key, unless another worker holds it.
    fn with_random_key(&self, rng: &mut impl rand::Rng, f: impl FnOnce(usize)) {
        let key = self.key_dist.sample(rng);
        if self.claimed[key]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            f(key);
            self.claimed[key].store(false, Ordering::SeqCst);
        }
    }
}

fn insert_worker(env: Arc<Environment>) {
    let mut rng = rand::thread_rng();
    while !env.finished.load(Ordering::SeqCst) {
        let (val1, val2) = (env.val_dist.sample(&mut rng), env.val_dist.sample(&mut rng));
        env.with_random_key(&mut rng, |key| {
            let (t1, t2) = (env.table1.pin(), env.table2.pin());
            let inserted1 = t1.try_insert(key, val1).is_ok();
            let mut inserted2 = false;
            t2.compute_if_absent(key, || {
                inserted2 = true;
                val2
            });
            let mut slot = env.expected[key].lock();
            assert_ne!(inserted1, slot.present);
            assert_eq!(inserted1, inserted2);
            if inserted1 {
                assert_eq!(t1.get(&key), Some(&val1));
                assert_eq!(t2.get(&key), Some(&val2));
                *slot = Slot {
                    present: true,
                    val1,
                    val2,
                };
            }
        });
    }
}

fn update_worker(env: Arc<Environment>) {
    let mut rng = rand::thread_rng();
    while !env.finished.load(Ordering::SeqCst) {
        let val = env.val_dist.sample(&mut rng);
        env.with_random_key(&mut rng, |key| {
            let (t1, t2) = (env.table1.pin(), env.table2.pin());
            let mut slot = env.expected[key].lock();
            let updated1 = t1.compute_if_present(&key, |_, _| Some(val)).is_some();
            let updated2 = t2.replace(&key, &slot.val2, val);
            assert_eq!(updated1, slot.present);
            assert_eq!(updated2, slot.present);
            if slot.present {
                slot.val1 = val;
                slot.val2 = val;
            }
        });
    }
}

fn delete_worker(env: Arc<Environment>) {
    let mut rng = rand::thread_rng();
    while !env.finished.load(Ordering::SeqCst) {
        env.with_random_key(&mut rng, |key| {
            let (t1, t2) = (env.table1.pin(), env.table2.pin());
            let removed1 = t1.remove(&key).is_some();
            let removed2 = t2.remove(&key).is_some();
            let mut slot = env.expected[key].lock();
            assert_eq!(removed1, slot.present);
            assert_eq!(removed2, slot.present);
            if removed1 {
                assert!(t1.get(&key).is_none());
                assert!(t2.get(&key).is_none());
                slot.present = false;
            }
        });
    }
}

fn find_worker(env: Arc<Environment>) {
    let mut rng = rand::thread_rng();
    while !env.finished.load(Ordering::SeqCst) {
        env.with_random_key(&mut rng, |key| {
            let (t1, t2) = (env.table1.pin(), env.table2.pin());
            let slot = *env.expected[key].lock();
            match (t1.get(&key), t2.get(&key)) {
                (Some(v1), Some(v2)) => {
                    assert!(slot.present);
                    assert_eq!(*v1, slot.val1);
                    assert_eq!(*v2, slot.val2);
                }
                (None, None) => assert!(!slot.present),
                _ => panic!("maps disagree about key {}", key),
            }
        });
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn stress_test() {
    let root = Arc::new(Environment::new());
    let mut threads = Vec::new();
    for _ in 0..NUM_THREADS {
        let env = Arc::clone(&root);
        threads.push(thread::spawn(move || insert_worker(env)));
        let env = Arc::clone(&root);
        threads.push(thread::spawn(move || update_worker(env)));
        let env = Arc::clone(&root);
        threads.push(thread::spawn(move || delete_worker(env)));
        let env = Arc::clone(&root);
        threads.push(thread::spawn(move || find_worker(env)));
    }
    thread::sleep(TEST_LEN);
    root.finished.store(true, Ordering::SeqCst);
    for t in threads {
        t.join().expect("failed to join thread");
    }

    let filled = root.expected.iter().filter(|s| s.lock().present).count();
    assert_eq!(filled, root.table1.len());
    assert_eq!(filled, root.table2.len());
}
