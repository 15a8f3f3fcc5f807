//! String interning: uniqueness, hashing, table growth and shrinking, and
//! revival of dead strings found by lookup.

use tricolor::string::hash_bytes;
use tricolor::{GcConfig, GcPhase, ObjRef, Runtime, Value};

fn runtime() -> Runtime {
    Runtime::new(GcConfig::default())
}

/// One collector unit per `step`.
fn fine_grained() -> Runtime {
    let mut rt = runtime();
    rt.set_step_multiplier(1);
    rt
}

#[test]
fn test_same_bytes_same_object() {
    let mut rt = runtime();
    let a = rt.intern_str("hello").unwrap();
    let b = rt.intern(b"hello").unwrap();
    let c = rt.intern_str("world").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(rt.string_bytes(a), b"hello");
    assert_eq!(rt.string(a).hash(), hash_bytes(b"hello"));
}

#[test]
fn test_binary_and_empty_strings() {
    let mut rt = runtime();
    let count = rt.string_count();
    let empty = rt.intern(b"").unwrap();
    let nul = rt.intern(b"a\0b").unwrap();
    let a = rt.intern(b"a").unwrap();
    assert_ne!(nul, a);
    assert!(rt.string(empty).is_empty());
    assert_eq!(rt.string(nul).len(), 3);
    assert_eq!(rt.intern(b"a\0b").unwrap(), nul);
    assert_eq!(rt.string_count(), count + 3);
}

#[test]
fn test_long_strings_with_equal_hash_stay_distinct() {
    let mut rt = runtime();
    // 64-byte strings are sampled every third byte from the end, so byte 1
    // does not contribute to the hash.
    let mut x = vec![b'a'; 64];
    let y = x.clone();
    x[1] = b'z';
    assert_eq!(hash_bytes(&x), hash_bytes(&y));

    let sx = rt.intern(&x).unwrap();
    let sy = rt.intern(&y).unwrap();
    assert_ne!(sx, sy);
    assert_eq!(rt.intern(&x).unwrap(), sx);
    assert_eq!(rt.intern(&y).unwrap(), sy);
}

#[test]
fn test_bucket_collisions_resolve_by_content() {
    let mut rt = runtime();
    let size = rt.string_table_size();
    let target = hash_bytes(b"k0") as usize & (size - 1);
    let other = (1..10_000)
        .map(|i| format!("k{i}"))
        .find(|s| hash_bytes(s.as_bytes()) as usize & (size - 1) == target)
        .unwrap();

    let a = rt.intern_str("k0").unwrap();
    let b = rt.intern_str(&other).unwrap();
    assert_ne!(a, b);
    assert_eq!(rt.strings().bucket_index(rt.string(a).hash()), target);
    assert_eq!(rt.strings().bucket_index(rt.string(b).hash()), target);
    assert_eq!(rt.intern_str("k0").unwrap(), a);
    assert_eq!(rt.intern_str(&other).unwrap(), b);
}

#[test]
fn test_table_doubles_when_count_first_exceeds_size() {
    let mut rt = runtime();
    let size = rt.string_table_size();
    let mut n = 0;
    while rt.string_count() < size {
        rt.intern_str(&format!("fill{n}")).unwrap();
        n += 1;
        assert_eq!(rt.string_table_size(), size);
    }
    rt.intern_str("one-more").unwrap();
    assert_eq!(rt.string_count(), size + 1);
    assert_eq!(rt.string_table_size(), size * 2);
}

#[test]
fn test_small_minimum_grows_during_startup() {
    let config = GcConfig {
        min_string_table_size: 4,
        ..GcConfig::default()
    };
    let rt = Runtime::new(config);
    // the metamethod names alone need 17 slots
    assert_eq!(rt.string_table_size(), 32);
}

#[test]
fn test_table_shrinks_after_sweep() {
    let mut rt = runtime();
    let min = rt.config().min_string_table_size;
    for i in 0..(min * 8) {
        rt.intern_str(&format!("garbage{i}")).unwrap();
    }
    let grown = rt.string_table_size();
    assert!(grown > min * 2);

    rt.full_collect().unwrap();
    assert!(rt.string_table_size() < grown);
    assert!(rt.string_table_size() >= min);
}

#[test]
fn test_every_string_survives_resize() {
    let mut rt = runtime();
    let keep: Vec<ObjRef> = (0..200)
        .map(|i| rt.intern_str(&format!("s{i}")).unwrap())
        .collect();
    for (i, &s) in keep.iter().enumerate() {
        assert_eq!(rt.intern_str(&format!("s{i}")).unwrap(), s);
    }
}

#[test]
fn test_unreferenced_strings_are_collected() {
    let mut rt = runtime();
    let before = rt.string_count();
    let s = rt.intern_str("transient").unwrap();
    rt.full_collect().unwrap();
    assert!(!rt.is_alive(s));
    assert_eq!(rt.string_count(), before);
}

#[test]
fn test_fixed_strings_survive() {
    let mut rt = runtime();
    let s = rt.intern_str("reserved").unwrap();
    rt.fix_string(s);
    rt.full_collect().unwrap();
    rt.full_collect().unwrap();
    assert!(rt.is_alive(s));
}

#[test]
fn test_dead_string_is_revived_by_lookup() {
    let mut rt = fine_grained();
    let last = rt.string_table_size() - 1;
    let name = (0..10_000)
        .map(|i| format!("late{i}"))
        .find(|s| rt.strings().bucket_index(hash_bytes(s.as_bytes())) == last)
        .unwrap();
    let s = rt.intern_str(&name).unwrap();

    while rt.phase() != GcPhase::SweepStrings {
        rt.step().unwrap();
    }
    // the last bucket has not been swept yet
    assert!(rt.is_dead(s));
    assert_eq!(rt.intern_str(&name).unwrap(), s);
    assert!(!rt.is_dead(s));

    while rt.phase() != GcPhase::Pause {
        rt.step().unwrap();
    }
    assert!(rt.is_alive(s));
    rt.verify_invariants().unwrap();

    // nothing references it, so the next cycle takes it
    rt.full_collect().unwrap();
    assert!(!rt.is_alive(s));
}

#[test]
fn test_strings_as_table_keys_survive() {
    let mut rt = runtime();
    let Value::Table(g) = rt.globals() else {
        panic!("globals is not a table");
    };
    let k = rt.intern_str("name").unwrap();
    let v = rt.intern_str("value").unwrap();
    rt.table_set(g, Value::String(k), Value::String(v)).unwrap();
    rt.full_collect().unwrap();
    assert_eq!(rt.table(g).get_str(k), Value::String(v));
    assert!(rt.is_alive(v));
}
