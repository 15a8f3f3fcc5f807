//! `__gc` metamethods on userdata.

use std::cell::RefCell;
use std::rc::Rc;

use tricolor::{GcConfig, GcError, GcPhase, ObjRef, Runtime, TagMethod, Value};

thread_local! {
    static FINALIZED: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
}

fn finalized() -> Vec<Value> {
    FINALIZED.with(|f| f.borrow().clone())
}

/// Records the userdata it was called with.
fn record(rt: &mut Runtime, _thread: ObjRef) -> Result<usize, GcError> {
    let u = rt.stack_get(rt.top() - 1);
    FINALIZED.with(|f| f.borrow_mut().push(u));
    Ok(0)
}

/// Stores its userdata in `globals.saved`.
fn resurrect(rt: &mut Runtime, thread: ObjRef) -> Result<usize, GcError> {
    record(rt, thread)?;
    let u = rt.stack_get(rt.top() - 1);
    let Value::Table(g) = rt.globals() else {
        return Err(GcError::Runtime("no globals".into()));
    };
    let key = rt.intern_str("saved")?;
    rt.table_set(g, Value::String(key), u)?;
    Ok(0)
}

fn fail(rt: &mut Runtime, thread: ObjRef) -> Result<usize, GcError> {
    record(rt, thread)?;
    Err(GcError::Runtime("boom".into()))
}

/// Tries to start a collection from inside the finalizer.
fn collect_inside(rt: &mut Runtime, thread: ObjRef) -> Result<usize, GcError> {
    assert!(rt.in_finalizer());
    assert_eq!(rt.phase(), GcPhase::Finalize);
    rt.full_collect()?;
    rt.step()?;
    assert_eq!(rt.phase(), GcPhase::Finalize);
    record(rt, thread)
}

fn runtime() -> Runtime {
    Runtime::new(GcConfig::default())
}

/// A metatable whose `__gc` is `handler`.
fn gc_metatable(rt: &mut Runtime, handler: Value) -> ObjRef {
    let mt = rt.new_table().unwrap();
    let name = rt.tag_method_name(TagMethod::Gc);
    rt.table_set(mt, Value::String(name), handler).unwrap();
    mt
}

fn finalizable(rt: &mut Runtime, func: tricolor::object::NativeFn) -> ObjRef {
    let f = rt.new_native_closure(func, 0).unwrap();
    let mt = gc_metatable(rt, Value::Function(f));
    let u = rt.new_userdata(8).unwrap();
    rt.set_metatable(Value::Userdata(u), Some(mt));
    u
}

#[test]
fn test_finalizer_runs_exactly_once() {
    let mut rt = runtime();
    let u = finalizable(&mut rt, record);
    rt.full_collect().unwrap();
    assert_eq!(finalized(), vec![Value::Userdata(u)]);
    // resurrected for the finalizer, freed by the next cycle
    assert!(rt.is_alive(u));
    assert!(rt.userdata(u).is_finalized());

    rt.full_collect().unwrap();
    assert!(!rt.is_alive(u));
    assert_eq!(finalized().len(), 1);
    assert_eq!(rt.metrics().totals().finalizers_run, 1);
}

#[test]
fn test_reachable_userdata_is_not_finalized() {
    let mut rt = runtime();
    let u = finalizable(&mut rt, record);
    rt.pin(Value::Userdata(u));
    rt.full_collect().unwrap();
    rt.full_collect().unwrap();
    assert!(finalized().is_empty());
    assert!(!rt.userdata(u).is_finalized());
}

#[test]
fn test_userdata_without_gc_is_freed_directly() {
    let mut rt = runtime();
    let mt = rt.new_table().unwrap();
    let u = rt.new_userdata(8).unwrap();
    rt.set_metatable(Value::Userdata(u), Some(mt));
    rt.full_collect().unwrap();
    assert!(!rt.is_alive(u));
    assert_eq!(rt.metrics().totals().finalizers_run, 0);
}

#[test]
fn test_finalizers_run_newest_first() {
    let mut rt = runtime();
    let all: Vec<ObjRef> = (0..3).map(|_| finalizable(&mut rt, record)).collect();
    rt.full_collect().unwrap();
    let expected: Vec<Value> = all.into_iter().rev().map(Value::Userdata).collect();
    assert_eq!(finalized(), expected);
}

#[test]
fn test_finalizer_order_survives_earlier_sweeps() {
    let mut rt = runtime();
    let plain = rt.new_userdata(8).unwrap();
    let all: Vec<ObjRef> = (0..3).map(|_| finalizable(&mut rt, record)).collect();
    for &u in &all {
        rt.pin(Value::Userdata(u));
    }
    rt.full_collect().unwrap();
    assert!(!rt.is_alive(plain));
    assert!(finalized().is_empty());

    for &u in &all {
        rt.unpin(Value::Userdata(u));
    }
    rt.full_collect().unwrap();
    let expected: Vec<Value> = all.into_iter().rev().map(Value::Userdata).collect();
    assert_eq!(finalized(), expected);
}

#[test]
fn test_finalizer_can_resurrect_its_object() {
    let mut rt = runtime();
    let u = finalizable(&mut rt, resurrect);
    rt.full_collect().unwrap();
    rt.full_collect().unwrap();
    assert!(rt.is_alive(u));
    assert_eq!(finalized().len(), 1);

    let Value::Table(g) = rt.globals() else {
        panic!("globals is not a table");
    };
    let key = rt.intern_str("saved").unwrap();
    assert_eq!(rt.table(g).get_str(key), Value::Userdata(u));
    rt.table_set(g, Value::String(key), Value::Nil).unwrap();
    rt.full_collect().unwrap();
    assert!(!rt.is_alive(u));
    assert_eq!(finalized().len(), 1);
}

#[test]
fn test_finalizer_error_propagates() {
    let mut rt = runtime();
    finalizable(&mut rt, fail);
    let err = rt.full_collect().unwrap_err();
    assert_eq!(err, GcError::Runtime("boom".into()));
    assert!(!rt.in_finalizer());
    assert_eq!(rt.top(), 0);

    // the collector picks up where it stopped
    let garbage = rt.new_table().unwrap();
    rt.full_collect().unwrap();
    assert_eq!(rt.phase(), GcPhase::Pause);
    assert!(!rt.is_alive(garbage));
    assert_eq!(finalized().len(), 1);
}

#[test]
fn test_script_finalizer_needs_an_invoker() {
    let mut rt = runtime();
    let p = rt.new_proto().unwrap();
    rt.pin_object(p);
    let f = rt.new_script_closure(p).unwrap();
    let mt = gc_metatable(&mut rt, Value::Function(f));
    let u = rt.new_userdata(0).unwrap();
    rt.set_metatable(Value::Userdata(u), Some(mt));

    let err = rt.full_collect().unwrap_err();
    assert!(matches!(err, GcError::Finalizer(msg) if msg.contains("without an invoker")));
}

#[test]
fn test_non_function_finalizer_is_an_error() {
    let mut rt = runtime();
    let mt = gc_metatable(&mut rt, Value::Boolean(true));
    let u = rt.new_userdata(0).unwrap();
    rt.set_metatable(Value::Userdata(u), Some(mt));
    let err = rt.full_collect().unwrap_err();
    assert_eq!(
        err.to_string(),
        "error in __gc metamethod (attempt to call a boolean value)"
    );
}

#[test]
fn test_invoker_receives_metamethod_and_userdata() {
    let mut rt = runtime();
    let calls: Rc<RefCell<Vec<(Value, Value)>>> = Rc::default();
    let log = Rc::clone(&calls);
    let previous = rt.set_finalizer_invoker(Box::new(move |rt: &mut Runtime, tm: Value, u: Value| {
        assert!(rt.in_finalizer());
        log.borrow_mut().push((tm, u));
        Ok(())
    }));
    assert!(previous.is_none());

    let p = rt.new_proto().unwrap();
    rt.pin_object(p);
    let f = rt.new_script_closure(p).unwrap();
    let mt = gc_metatable(&mut rt, Value::Function(f));
    let u = rt.new_userdata(0).unwrap();
    rt.set_metatable(Value::Userdata(u), Some(mt));

    rt.full_collect().unwrap();
    assert_eq!(
        calls.borrow().as_slice(),
        &[(Value::Function(f), Value::Userdata(u))]
    );
    // the invoker stays installed
    assert!(rt.set_finalizer_invoker(Box::new(|_: &mut Runtime, _: Value, _: Value| Ok(()))).is_some());
}

#[test]
fn test_collection_inside_finalizer_is_ignored() {
    let mut rt = runtime();
    let u = finalizable(&mut rt, collect_inside);
    let steps = rt.metrics().totals().steps;
    rt.full_collect().unwrap();
    assert_eq!(finalized(), vec![Value::Userdata(u)]);
    assert_eq!(rt.metrics().totals().steps, steps + 1);
}

#[test]
fn test_pending_finalizers_are_queued_at_atomic() {
    let mut rt = runtime();
    rt.set_step_multiplier(1);
    let u = finalizable(&mut rt, record);
    while rt.phase() != GcPhase::SweepStrings {
        rt.step().unwrap();
    }
    assert_eq!(rt.pending_finalizers(), 1);
    assert!(finalized().is_empty());

    rt.call_pending_finalizers().unwrap();
    assert_eq!(rt.pending_finalizers(), 0);
    assert_eq!(finalized(), vec![Value::Userdata(u)]);

    while rt.phase() != GcPhase::Pause {
        rt.step().unwrap();
    }
    assert!(rt.is_alive(u));
    assert_eq!(finalized().len(), 1);
}

#[test]
fn test_close_finalizes_reachable_userdata() {
    let mut rt = runtime();
    let kept = finalizable(&mut rt, record);
    rt.pin(Value::Userdata(kept));
    let Value::Table(reg) = rt.registry() else {
        panic!("registry is not a table");
    };
    let stored = finalizable(&mut rt, fail);
    rt.table_set_int(reg, 1, Value::Userdata(stored)).unwrap();
    rt.close();
    // errors during shutdown are dropped and the rest still run
    let seen = finalized();
    assert_eq!(seen.len(), 2);
    assert!(seen.contains(&Value::Userdata(kept)));
    assert!(seen.contains(&Value::Userdata(stored)));
}
