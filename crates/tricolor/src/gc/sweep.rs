//! Sweeping and object freeing.
//!
//! After the atomic step has flipped the current white, anything still
//! carrying the other white was not reached. Sweeping frees those objects and
//! recolors every survivor to the new current white, ready for the next cycle.

use crate::object::{ObjRef, UpvalueState};
use crate::string::StringTable;
use crate::value::TypeTag;
use crate::Runtime;

use super::tracing::log_sweep_done;
use super::GcPhase;

impl Runtime {
    /// Whether `r` survives the sweep; recolors it if so.
    fn sweep_survivor(&mut self, r: ObjRef) -> bool {
        let white = self.gc.current_white;
        let obj = self.heap.obj_mut(r);
        let marked = obj.marked();
        if marked.is_dead(white) && !marked.is_fixed() {
            return false;
        }
        obj.marked_mut().make_white(white);
        true
    }

    /// Sweeps one bucket of the string table.
    pub(crate) fn sweep_string_bucket(&mut self) {
        let before = self.heap.total_bytes();
        let i = self.gc.sweep_strings;
        self.gc.sweep_strings += 1;

        let chain = std::mem::take(self.strings.bucket_mut(i));
        let mut kept = Vec::with_capacity(chain.len());
        let mut freed = 0;
        for s in chain {
            if self.sweep_survivor(s) {
                kept.push(s);
            } else {
                self.free_object(s);
                freed += 1;
            }
        }
        *self.strings.bucket_mut(i) = kept;
        self.strings.forget(freed);

        self.gc.estimate = self
            .gc
            .estimate
            .saturating_sub(before - self.heap.total_bytes());
        if self.gc.sweep_strings >= self.strings.size() {
            log_sweep_done(
                GcPhase::SweepStrings,
                self.metrics.current_cycle().strings_reclaimed,
                self.metrics.current_cycle().bytes_reclaimed,
            );
            self.transition_to(GcPhase::Sweep);
        }
    }

    /// Sweeps up to `max` objects from the general list, then the userdata
    /// list. Returns `false` once both lists are exhausted.
    pub(crate) fn sweep_objects(&mut self, max: usize) -> bool {
        let before = self.heap.total_bytes();
        let mut budget = max;
        while budget > 0 {
            let cursor = self.gc.sweep_objects;
            let Some(&r) = self.heap.objects.get(cursor) else {
                break;
            };
            if self.heap.obj(r).tag() == TypeTag::Thread {
                self.sweep_open_upvalues(r);
            }
            if self.sweep_survivor(r) {
                self.gc.sweep_objects += 1;
            } else {
                self.heap.objects.swap_remove(cursor);
                self.free_object(r);
            }
            budget -= 1;
        }
        let more = budget == 0 || self.sweep_udata(budget);
        self.gc.estimate = self
            .gc
            .estimate
            .saturating_sub(before.saturating_sub(self.heap.total_bytes()));
        if !more {
            let cycle = self.metrics.current_cycle();
            log_sweep_done(GcPhase::Sweep, cycle.objects_reclaimed, cycle.bytes_reclaimed);
        }
        more
    }

    /// Sweeps the next `max` userdata, keeping survivors in creation order.
    fn sweep_udata(&mut self, max: usize) -> bool {
        let start = self.gc.sweep_udata.min(self.heap.udata.len());
        let end = start.saturating_add(max).min(self.heap.udata.len());
        let mut kept = Vec::with_capacity(end - start);
        for i in start..end {
            let r = self.heap.udata[i];
            if self.sweep_survivor(r) {
                kept.push(r);
            } else {
                self.free_object(r);
            }
        }
        self.gc.sweep_udata += kept.len();
        self.heap.udata.splice(start..end, kept);
        self.gc.sweep_udata < self.heap.udata.len()
    }

    /// Open upvalues live on their thread's list rather than the general
    /// one, so they are swept together with the thread.
    fn sweep_open_upvalues(&mut self, thread: ObjRef) {
        let mut i = 0;
        loop {
            let th = self.heap.obj(thread).as_thread();
            let Some(&(_, uv)) = th.open_upvalues.get(i) else {
                break;
            };
            if self.sweep_survivor(uv) {
                i += 1;
            } else {
                self.heap
                    .obj_mut(thread)
                    .as_thread_mut()
                    .open_upvalues
                    .remove(i);
                self.free_object(uv);
            }
        }
    }

    /// Frees one object that is already unlinked from its list.
    pub(crate) fn free_object(&mut self, r: ObjRef) {
        let tag = self.heap.obj(r).tag();
        match tag {
            TypeTag::Thread => {
                assert!(r != self.main_thread, "main thread cannot be freed");
                self.close_upvalues(r, 0);
            }
            TypeTag::Upvalue => {
                if let UpvalueState::Open { .. } = self.heap.obj(r).as_upvalue().state {
                    self.unlink_open_upvalue(r);
                }
            }
            _ => {}
        }
        let size = self.heap.size_of(r);
        self.heap.remove(r);
        self.metrics.record_freed(size, tag == TypeTag::String);
    }

    pub(crate) fn unlink_open_upvalue(&mut self, uv: ObjRef) {
        if let Some(pos) = self.open_upvalues.iter().position(|&u| u == uv) {
            self.open_upvalues.swap_remove(pos);
        }
    }

    /// Halves the string table when it is mostly empty.
    pub(crate) fn check_sizes(&mut self) {
        let size = self.strings.size();
        if self.strings.is_sparse(self.config.min_string_table_size) {
            self.resize_strings(size / 2);
        }
    }

    /// Rehashes the string table into `new_size` buckets. Skipped while the
    /// string sweep holds a cursor into the buckets, or if the allocator
    /// refuses the new bucket array.
    pub(crate) fn resize_strings(&mut self, new_size: usize) {
        if self.gc.phase == GcPhase::SweepStrings {
            return;
        }
        let old_bytes = StringTable::bucket_bytes(self.strings.size());
        let new_bytes = StringTable::bucket_bytes(new_size);
        if !self.heap.charge(old_bytes, new_bytes) {
            return;
        }
        let heap = &self.heap;
        self.strings
            .resize(new_size, |s| heap.obj(s).as_string().hash());
    }
}
