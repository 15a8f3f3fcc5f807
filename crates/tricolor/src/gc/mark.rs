//! Marking: roots, propagation, and the atomic closing step.

use crate::object::{Closure, ObjRef, UpvalueState};
use crate::state::TagMethod;
use crate::table::WeakMode;
use crate::value::{TypeTag, Value, NUM_BASIC_TAGS};
use crate::Runtime;

use super::tracing::log_atomic;
use super::GcPhase;

impl Runtime {
    /// Starts a cycle: grays the root set.
    pub(crate) fn mark_root(&mut self) {
        self.gc.clear_lists();
        let main = self.main_thread;
        self.mark_object(main);
        let globals = self.heap.obj(main).as_thread().globals;
        self.mark_value(globals);
        self.mark_value(self.registry);
        self.mark_type_metatables();
        self.mark_pinned();
        self.mark_pending_finalization();
        if !self.metrics.cycle_active() {
            self.metrics.begin_cycle(self.gc.driver);
        }
        self.transition_to(GcPhase::Propagate);
    }

    pub(crate) fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.as_object() {
            debug_assert_eq!(
                self.heap.obj(r).tag(),
                v.type_tag(),
                "value tag disagrees with object header"
            );
            self.mark_object(r);
        }
    }

    /// Grays a white object.
    ///
    /// Strings just lose their white. Userdata and closed upvalues have no
    /// children worth a gray-list round trip and go black at once; open
    /// upvalues stay gray so the atomic step can re-mark their stack slot.
    /// Everything else is queued on the gray list.
    pub(crate) fn mark_object(&mut self, r: ObjRef) {
        let obj = self.heap.obj_mut(r);
        if !obj.marked().is_white() {
            return;
        }
        obj.marked_mut().white_to_gray();
        match obj.tag() {
            TypeTag::String => {}
            TypeTag::Userdata => {
                obj.marked_mut().gray_to_black();
                let u = obj.as_userdata();
                let (mt, env) = (u.metatable, u.env);
                if let Some(mt) = mt {
                    self.mark_object(mt);
                }
                if let Some(env) = env {
                    self.mark_object(env);
                }
            }
            TypeTag::Upvalue => {
                let state = obj.as_upvalue().state;
                match state {
                    UpvalueState::Closed(v) => {
                        obj.marked_mut().gray_to_black();
                        self.mark_value(v);
                    }
                    UpvalueState::Open { thread, level } => {
                        let v = self.heap.obj(thread).as_thread().stack[level];
                        self.mark_value(v);
                    }
                }
            }
            _ => self.gc.gray.push(r),
        }
    }

    fn mark_type_metatables(&mut self) {
        for i in 0..NUM_BASIC_TAGS {
            if let Some(mt) = self.type_metatables[i] {
                self.mark_object(mt);
            }
        }
    }

    fn mark_pinned(&mut self) {
        for i in 0..self.roots.len() {
            let r = self.roots.as_slice()[i];
            self.mark_object(r);
        }
    }

    /// Traverses one gray object and returns the work it cost, or `None`
    /// when the gray list is empty.
    pub(crate) fn propagate_mark(&mut self) -> Option<usize> {
        let r = self.gc.gray.pop()?;
        let obj = self.heap.obj_mut(r);
        obj.marked_mut().gray_to_black();
        let tag = obj.tag();
        self.metrics.record_marked(1);
        match tag {
            TypeTag::Table => self.traverse_table(r),
            TypeTag::Function => self.traverse_closure(r),
            TypeTag::Thread => self.traverse_thread(r),
            TypeTag::Proto => self.traverse_proto(r),
            other => panic!("{other} object on the gray list"),
        }
        Some(self.heap.size_of(r))
    }

    pub(crate) fn propagate_all(&mut self) -> usize {
        let mut work = 0;
        while let Some(w) = self.propagate_mark() {
            work += w;
        }
        work
    }

    /// Marks every value queued in the scratch buffer.
    fn mark_buffered(&mut self, mut buf: Vec<Value>) {
        for v in buf.drain(..) {
            self.mark_value(v);
        }
        self.gc.scratch = buf;
    }

    fn traverse_table(&mut self, r: ObjRef) {
        let mut weak = WeakMode::STRONG;
        if let Some(mt) = self.heap.obj(r).as_table().metatable {
            self.mark_object(mt);
            if let Value::String(mode) = self.fast_tm(mt, TagMethod::Mode) {
                weak = WeakMode::from_mode(self.heap.obj(mode).as_string().as_bytes());
            }
        }
        let obj = self.heap.obj_mut(r);
        obj.as_table_mut().weak = weak;
        if weak.is_weak() {
            // stays gray until its entries are cleared
            obj.marked_mut().black_to_gray();
            self.gc.weak.push(r);
        }
        if weak.keys && weak.values {
            return;
        }
        let mut buf = std::mem::take(&mut self.gc.scratch);
        let t = self.heap.obj(r).as_table();
        if !weak.values {
            buf.extend_from_slice(t.array());
        }
        for node in t.nodes() {
            if !weak.keys {
                buf.push(node.key);
            }
            if !weak.values {
                buf.push(node.value);
            }
        }
        self.mark_buffered(buf);
    }

    fn traverse_closure(&mut self, r: ObjRef) {
        let mut buf = std::mem::take(&mut self.gc.scratch);
        let mut objects = Vec::new();
        match self.heap.obj(r).as_closure() {
            Closure::Native(c) => {
                buf.extend(c.env.map(Value::Table));
                buf.extend_from_slice(&c.upvalues);
            }
            Closure::Script(c) => {
                buf.extend(c.env.map(Value::Table));
                objects.push(c.proto);
                objects.extend(c.upvalues.iter().flatten().copied());
            }
        }
        self.mark_buffered(buf);
        for o in objects {
            self.mark_object(o);
        }
    }

    fn traverse_proto(&mut self, r: ObjRef) {
        let mut buf = std::mem::take(&mut self.gc.scratch);
        let p = self.heap.obj(r).as_proto();
        buf.extend(p.source.map(Value::String));
        buf.extend_from_slice(&p.constants);
        buf.extend(p.upvalue_names.iter().map(|&n| Value::String(n)));
        buf.extend(p.locals.iter().map(|l| Value::String(l.name)));
        let children = p.protos.clone();
        self.mark_buffered(buf);
        for child in children {
            self.mark_object(child);
        }
    }

    /// Threads go back to gray and onto the gray-again list: their stacks
    /// are written without barriers, so they are re-scanned atomically.
    fn traverse_thread(&mut self, r: ObjRef) {
        let obj = self.heap.obj_mut(r);
        obj.marked_mut().black_to_gray();
        self.gc.gray_again.push(r);
        let th = obj.as_thread_mut();
        let top = th.top;
        th.stack[top..].fill(Value::Nil);

        let mut buf = std::mem::take(&mut self.gc.scratch);
        let th = self.heap.obj(r).as_thread();
        buf.push(th.globals);
        buf.extend_from_slice(&th.stack[..top]);
        self.mark_buffered(buf);
    }

    /// Re-marks the values of gray open upvalues; their threads may not be
    /// reachable any more.
    fn remark_upvalues(&mut self) {
        for i in 0..self.open_upvalues.len() {
            let uv = self.open_upvalues[i];
            let obj = self.heap.obj(uv);
            if !obj.marked().is_gray() {
                continue;
            }
            if let UpvalueState::Open { thread, level } = obj.as_upvalue().state {
                let v = self.heap.obj(thread).as_thread().stack[level];
                self.mark_value(v);
            }
        }
    }

    /// Closes the mark phase in one indivisible step and starts sweeping.
    pub(crate) fn atomic(&mut self) {
        self.remark_upvalues();
        self.propagate_all();

        // weak tables are traversed again, possibly as strong ones
        self.gc.gray = std::mem::take(&mut self.gc.weak);
        let current = self.current_thread;
        self.mark_object(current);
        self.mark_type_metatables();
        self.mark_pinned();
        self.propagate_all();

        self.gc.gray = std::mem::take(&mut self.gc.gray_again);
        self.propagate_all();

        let separated = self.separate_udata(false);
        self.mark_pending_finalization();
        self.propagate_all();

        let weak_tables = self.clear_weak_tables();

        self.gc.current_white = self.gc.current_white.other();
        self.gc.reset_sweep();
        self.gc.estimate = self.heap.total_bytes().saturating_sub(separated);
        self.metrics.set_estimate(self.gc.estimate);
        log_atomic(self.gc.estimate, weak_tables, self.gc.tmudata.len());
        self.transition_to(GcPhase::SweepStrings);
    }

    /// Moves unreached userdata with a `__gc` metamethod to the pending
    /// finalization queue and returns their bytes. With `all`, reached
    /// userdata are separated too.
    ///
    /// Every considered userdata is flagged finalized, so none is ever
    /// separated twice.
    pub(crate) fn separate_udata(&mut self, all: bool) -> usize {
        let mut separated = 0;
        // Newest first.
        let mut i = self.heap.udata.len();
        while i > 0 {
            i -= 1;
            let r = self.heap.udata[i];
            let obj = self.heap.obj(r);
            let u = obj.as_userdata();
            if !(all || obj.marked().is_white()) || u.finalized {
                continue;
            }
            let has_gc = match u.metatable {
                Some(mt) => !self.fast_tm(mt, TagMethod::Gc).is_nil(),
                None => false,
            };
            self.heap.obj_mut(r).as_userdata_mut().finalized = true;
            if has_gc {
                separated += self.heap.size_of(r);
                self.heap.udata.remove(i);
                self.gc.tmudata.push_back(r);
            }
        }
        separated
    }

    /// Keeps everything referenced by pending userdata alive for this cycle.
    fn mark_pending_finalization(&mut self) {
        let white = self.gc.current_white;
        for i in 0..self.gc.tmudata.len() {
            let u = self.gc.tmudata[i];
            self.heap.obj_mut(u).marked_mut().make_white(white);
            self.mark_object(u);
        }
    }

    /// Whether a weak entry must be dropped. Strings are never weak: they
    /// are marked instead.
    fn is_cleared(&mut self, v: Value, is_key: bool) -> bool {
        let Some(r) = v.as_object() else {
            return false;
        };
        if let Value::String(s) = v {
            self.mark_object(s);
            return false;
        }
        let obj = self.heap.obj(r);
        obj.marked().is_white()
            || (!is_key && obj.tag() == TypeTag::Userdata && obj.as_userdata().finalized)
    }

    /// Drops collected entries from every table on the weak list and returns
    /// how many tables were visited.
    fn clear_weak_tables(&mut self) -> usize {
        let weak = std::mem::take(&mut self.gc.weak);
        for &t in &weak {
            let mode = self.heap.obj(t).as_table().weak;
            if mode.values {
                let n = self.heap.obj(t).as_table().array().len();
                for i in 0..n {
                    let v = self.heap.obj(t).as_table().array()[i];
                    if self.is_cleared(v, false) {
                        self.heap.obj_mut(t).as_table_mut().array_mut()[i] = Value::Nil;
                    }
                }
            }
            let mut i = 0;
            while i < self.heap.obj(t).as_table().nodes().len() {
                let node = self.heap.obj(t).as_table().nodes()[i];
                if self.is_cleared(node.key, true) || self.is_cleared(node.value, false) {
                    self.heap.obj_mut(t).as_table_mut().remove_node(i);
                } else {
                    i += 1;
                }
            }
            self.heap.obj_mut(t).as_table_mut().shrink_after_clear();
            let size = self.heap.obj(t).body.byte_size();
            self.heap.shrink_to(t, size);
        }
        weak.len()
    }
}
