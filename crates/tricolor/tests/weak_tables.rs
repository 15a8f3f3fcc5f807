//! Tables whose metatable sets `__mode`.

use tricolor::{GcConfig, GcError, GcPhase, ObjRef, Runtime, TagMethod, Value};

fn runtime() -> Runtime {
    Runtime::new(GcConfig::default())
}

/// A pinned table with `__mode = mode`.
fn weak_table(rt: &mut Runtime, mode: &str) -> ObjRef {
    let t = rt.new_table().unwrap();
    rt.pin(Value::Table(t));
    let mt = rt.new_table().unwrap();
    let key = rt.tag_method_name(TagMethod::Mode);
    let mode = rt.intern_str(mode).unwrap();
    rt.table_set(mt, Value::String(key), Value::String(mode))
        .unwrap();
    rt.set_metatable(Value::Table(t), Some(mt));
    t
}

fn noop(_: &mut Runtime, _: ObjRef) -> Result<usize, GcError> {
    Ok(0)
}

#[test]
fn test_weak_values_are_cleared() {
    let mut rt = runtime();
    let t = weak_table(&mut rt, "v");
    let a = rt.new_table().unwrap();
    let b = rt.new_table().unwrap();
    let kept = rt.new_table().unwrap();
    rt.pin(Value::Table(kept));
    let x = rt.intern_str("x").unwrap();
    let y = rt.intern_str("y").unwrap();
    rt.table_set_int(t, 1, Value::Table(a)).unwrap();
    rt.table_set_int(t, 2, Value::Number(2.0)).unwrap();
    rt.table_set(t, Value::String(x), Value::Table(b)).unwrap();
    rt.table_set(t, Value::String(y), Value::Table(kept)).unwrap();

    rt.full_collect().unwrap();
    assert!(!rt.is_alive(a));
    assert!(!rt.is_alive(b));
    let table = rt.table(t);
    assert_eq!(table.get_int(1), Value::Nil);
    assert_eq!(table.get_int(2), Value::Number(2.0));
    assert_eq!(table.get_str(x), Value::Nil);
    assert_eq!(table.get_str(y), Value::Table(kept));
}

#[test]
fn test_weak_keys_are_cleared() {
    let mut rt = runtime();
    let t = weak_table(&mut rt, "k");
    let key = rt.new_table().unwrap();
    let value = rt.new_table().unwrap();
    rt.table_set(t, Value::Table(key), Value::Number(1.0)).unwrap();
    let name = rt.intern_str("strong").unwrap();
    rt.table_set(t, Value::String(name), Value::Table(value))
        .unwrap();

    rt.full_collect().unwrap();
    assert!(!rt.is_alive(key));
    // values stay strong
    assert!(rt.is_alive(value));
    assert_eq!(rt.table(t).len(), 1);
    assert_eq!(rt.table(t).get_str(name), Value::Table(value));
}

#[test]
fn test_fully_weak_table_holds_nothing() {
    let mut rt = runtime();
    let t = weak_table(&mut rt, "kv");
    let k = rt.new_table().unwrap();
    let v = rt.new_table().unwrap();
    rt.table_set(t, Value::Table(k), Value::Table(v)).unwrap();
    rt.table_set_int(t, 1, Value::Table(v)).unwrap();

    rt.full_collect().unwrap();
    assert!(!rt.is_alive(k));
    assert!(!rt.is_alive(v));
    assert!(rt.table(t).is_empty());
}

#[test]
fn test_strings_are_never_weak() {
    let mut rt = runtime();
    let t = weak_table(&mut rt, "kv");
    let k = rt.intern_str("only-here-key").unwrap();
    let v = rt.intern_str("only-here-value").unwrap();
    rt.table_set(t, Value::String(k), Value::String(v)).unwrap();

    rt.full_collect().unwrap();
    rt.full_collect().unwrap();
    assert!(rt.is_alive(k));
    assert!(rt.is_alive(v));
    assert_eq!(rt.table(t).get_str(k), Value::String(v));
}

#[test]
fn test_finalized_userdata_leaves_weak_values_only() {
    let mut rt = runtime();
    let values = weak_table(&mut rt, "v");
    let keys = weak_table(&mut rt, "k");

    let f = rt.new_native_closure(noop, 0).unwrap();
    let mt = rt.new_table().unwrap();
    let gc = rt.tag_method_name(TagMethod::Gc);
    rt.table_set(mt, Value::String(gc), Value::Function(f)).unwrap();
    let u = rt.new_userdata(4).unwrap();
    rt.set_metatable(Value::Userdata(u), Some(mt));

    rt.table_set_int(values, 1, Value::Userdata(u)).unwrap();
    rt.table_set(keys, Value::Userdata(u), Value::Boolean(true))
        .unwrap();

    rt.full_collect().unwrap();
    assert_eq!(rt.metrics().totals().finalizers_run, 1);
    assert_eq!(rt.table(values).get_int(1), Value::Nil);
    assert_eq!(
        rt.table(keys).get(&Value::Userdata(u)),
        Value::Boolean(true)
    );

    // once finalized, the next cycle drops the key as well
    rt.full_collect().unwrap();
    assert!(!rt.is_alive(u));
    assert!(rt.table(keys).is_empty());
}

#[test]
fn test_mode_is_read_every_cycle() {
    let mut rt = runtime();
    let t = weak_table(&mut rt, "v");
    let a = rt.new_table().unwrap();
    rt.table_set_int(t, 1, Value::Table(a)).unwrap();

    let mt = rt.table(t).metatable.unwrap();
    let mode = rt.tag_method_name(TagMethod::Mode);
    rt.table_set(mt, Value::String(mode), Value::Nil).unwrap();
    rt.full_collect().unwrap();
    assert!(rt.is_alive(a));
    assert!(!rt.table(t).weak_mode().is_weak());
}

#[test]
fn test_weak_tables_under_incremental_steps() {
    let mut rt = runtime();
    rt.set_step_multiplier(1);
    let t = weak_table(&mut rt, "v");
    let keep = rt.new_table().unwrap();
    rt.pin(Value::Table(keep));
    for round in 0..200 {
        let fresh = rt.new_table().unwrap();
        rt.table_set_int(t, round % 16 + 1, Value::Table(fresh))
            .unwrap();
        if round % 5 == 0 {
            rt.table_set_int(keep, round + 1, Value::Table(fresh))
                .unwrap();
        }
        rt.step().unwrap();
        rt.verify_invariants().unwrap();
    }
    while rt.phase() != GcPhase::Pause {
        rt.step().unwrap();
    }
    rt.full_collect().unwrap();
    // only values also held by `keep` survive
    for v in rt.table(t).array().iter().chain(rt.table(t).nodes().iter().map(|n| &n.value)) {
        if let Value::Table(r) = *v {
            assert!(rt.table(keep).array().contains(&Value::Table(r))
                || rt.table(keep).nodes().iter().any(|n| n.value == Value::Table(r)));
        }
    }
}
