//! Incremental stepping, pacing and full collections started mid-cycle.

use tricolor::{Color, GcConfig, GcPhase, ObjRef, Runtime, Value, GC_STEP_SIZE};

fn fine_grained() -> Runtime {
    let mut rt = Runtime::new(GcConfig::default());
    rt.set_step_multiplier(1);
    rt
}

fn step_until(rt: &mut Runtime, phase: GcPhase) {
    while rt.phase() != phase {
        rt.step().unwrap();
    }
}

fn pinned_table(rt: &mut Runtime) -> ObjRef {
    let t = rt.new_table().unwrap();
    rt.pin(Value::Table(t));
    t
}

#[test]
fn test_phases_advance_in_order() {
    let mut rt = fine_grained();
    for i in 0..64 {
        let t = pinned_table(&mut rt);
        rt.table_set_int(t, 1, Value::Number(f64::from(i))).unwrap();
    }
    let mut seen = vec![rt.phase()];
    loop {
        rt.step().unwrap();
        if seen.last() != Some(&rt.phase()) {
            seen.push(rt.phase());
        }
        if rt.phase() == GcPhase::Pause {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            GcPhase::Pause,
            GcPhase::Propagate,
            GcPhase::SweepStrings,
            GcPhase::Sweep,
            GcPhase::Finalize,
            GcPhase::Pause
        ]
    );
}

#[test]
fn test_cycle_frees_garbage_incrementally() {
    let mut rt = fine_grained();
    let keep = pinned_table(&mut rt);
    let garbage: Vec<ObjRef> = (0..32).map(|_| rt.new_table().unwrap()).collect();
    rt.step().unwrap();
    step_until(&mut rt, GcPhase::Pause);
    assert!(rt.is_alive(keep));
    assert!(garbage.iter().all(|&g| !rt.is_alive(g)));
}

#[test]
fn test_invariants_hold_between_steps() {
    let mut rt = fine_grained();
    let root = pinned_table(&mut rt);
    let mut seed: u32 = 12345;
    let mut next = || {
        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
        (seed >> 16) as usize
    };
    let mut live = vec![root];
    for round in 0..400 {
        let t = rt.new_table().unwrap();
        let parent = live[next() % live.len()];
        rt.table_set_int(parent, (next() % 8) as i64 + 1, Value::Table(t))
            .unwrap();
        live.push(t);
        if round % 3 == 0 {
            let s = rt.intern_str(&format!("s{}", next() % 50)).unwrap();
            rt.table_set(t, Value::String(s), Value::Boolean(true)).unwrap();
        }
        rt.step().unwrap();
        rt.verify_invariants().unwrap();
        live.retain(|&r| rt.is_alive(r));
    }
    assert!(rt.is_alive(root));
}

#[test]
fn test_objects_created_while_sweeping_survive_the_cycle() {
    let mut rt = fine_grained();
    pinned_table(&mut rt);
    step_until(&mut rt, GcPhase::Sweep);
    let late = rt.new_table().unwrap();
    step_until(&mut rt, GcPhase::Pause);
    assert!(rt.is_alive(late));
    assert_eq!(rt.color_of(late), Color::White);

    rt.full_collect().unwrap();
    assert!(!rt.is_alive(late));
}

#[test]
fn test_full_collect_discards_partial_marks() {
    let mut rt = fine_grained();
    let keep = pinned_table(&mut rt);
    let garbage = rt.new_table().unwrap();
    rt.step().unwrap();
    rt.step().unwrap();
    assert_eq!(rt.phase(), GcPhase::Propagate);

    rt.full_collect().unwrap();
    assert_eq!(rt.phase(), GcPhase::Pause);
    assert!(rt.is_alive(keep));
    assert!(!rt.is_alive(garbage));
    assert_eq!(rt.color_of(keep), Color::White);
}

#[test]
fn test_full_collect_finishes_pending_sweep() {
    let mut rt = fine_grained();
    let garbage = rt.new_table().unwrap();
    step_until(&mut rt, GcPhase::SweepStrings);
    rt.full_collect().unwrap();
    assert_eq!(rt.phase(), GcPhase::Pause);
    assert!(!rt.is_alive(garbage));
}

#[test]
fn test_threshold_follows_estimate() {
    let mut rt = Runtime::new(GcConfig::default());
    let keep = pinned_table(&mut rt);
    for i in 0..100 {
        rt.table_set_int(keep, i + 1, Value::Number(0.0)).unwrap();
    }
    rt.full_collect().unwrap();
    assert_eq!(rt.threshold(), rt.estimate() / 100 * 200);

    let old = rt.set_pause(100);
    assert_eq!(old, 200);
    rt.full_collect().unwrap();
    assert_eq!(rt.threshold(), rt.estimate() / 100 * 100);
}

#[test]
fn test_threshold_moves_ahead_during_cycle() {
    let mut rt = fine_grained();
    pinned_table(&mut rt);
    rt.step().unwrap();
    assert_ne!(rt.phase(), GcPhase::Pause);
    assert_eq!(rt.threshold(), rt.total_bytes() + GC_STEP_SIZE);
    assert_eq!(rt.debt(), 0);
}

#[test]
fn test_unpaid_debt_carries_across_steps() {
    let mut rt = fine_grained();
    for _ in 0..256 {
        pinned_table(&mut rt);
    }
    rt.step().unwrap();
    assert_eq!(rt.phase(), GcPhase::Propagate);

    let big = pinned_table(&mut rt);
    let mut i = 1;
    while rt.debt() < 4 * GC_STEP_SIZE {
        rt.table_set_int(big, i, Value::Boolean(true)).unwrap();
        i += 1;
    }
    // each step pays one quantum and keeps the threshold at the total
    let mut owed = rt.debt();
    while owed >= GC_STEP_SIZE {
        rt.step().unwrap();
        assert_eq!(rt.phase(), GcPhase::Propagate);
        assert_eq!(rt.threshold(), rt.total_bytes());
        owed -= GC_STEP_SIZE;
        assert_eq!(rt.debt(), owed);
    }
    rt.step().unwrap();
    assert_eq!(rt.phase(), GcPhase::Propagate);
    assert_eq!(rt.threshold(), rt.total_bytes() + GC_STEP_SIZE);
    assert_eq!(rt.debt(), owed);
}

#[test]
fn test_check_gc_waits_for_threshold() {
    let mut rt = fine_grained();
    assert!(rt.total_bytes() < rt.threshold());
    rt.check_gc().unwrap();
    assert_eq!(rt.phase(), GcPhase::Pause);
    assert_eq!(rt.metrics().totals().steps, 0);

    let keep = pinned_table(&mut rt);
    let mut i = 1;
    while rt.total_bytes() < rt.threshold() {
        rt.table_set_int(keep, i, Value::Boolean(true)).unwrap();
        i += 1;
    }
    rt.check_gc().unwrap();
    assert_eq!(rt.metrics().totals().steps, 1);
}

#[test]
fn test_non_incremental_mode_runs_full_cycles() {
    let mut rt = Runtime::new(GcConfig::default());
    rt.set_incremental(false);
    let garbage = rt.new_table().unwrap();
    let keep = pinned_table(&mut rt);
    let mut i = 1;
    while rt.total_bytes() < rt.threshold() {
        rt.table_set_int(keep, i, Value::Boolean(true)).unwrap();
        i += 1;
    }
    rt.check_gc().unwrap();
    assert_eq!(rt.phase(), GcPhase::Pause);
    assert!(!rt.is_alive(garbage));
}

#[test]
fn test_zero_multiplier_finishes_cycle_in_one_step() {
    let mut rt = Runtime::new(GcConfig::default());
    rt.set_step_multiplier(0);
    let garbage = rt.new_table().unwrap();
    rt.step().unwrap();
    assert_eq!(rt.phase(), GcPhase::Pause);
    assert!(!rt.is_alive(garbage));
    assert_eq!(rt.metrics().totals().collections, 1);
}

#[test]
fn test_thread_stacks_are_rescanned_atomically() {
    let mut rt = fine_grained();
    step_until(&mut rt, GcPhase::Propagate);
    // main thread, globals and registry
    while rt.phase() == GcPhase::Propagate && rt.metrics().current_cycle().objects_marked < 3 {
        rt.step().unwrap();
    }
    let late = rt.new_table().unwrap();
    rt.push(Value::Table(late)).unwrap();
    step_until(&mut rt, GcPhase::Pause);
    assert!(rt.is_alive(late));
}
