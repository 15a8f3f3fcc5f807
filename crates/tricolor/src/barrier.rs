//! Write barriers and the barriered field setters.
//!
//! While a cycle is propagating, no black object may point at a white one.
//! Every store of a collectable reference into a heap object goes through one
//! of the setters below, which apply the matching barrier:
//!
//! - **Forward** ([`Runtime::barrier`], [`Runtime::object_barrier`]): the white
//!   child is marked at once. Outside propagation the black parent is turned
//!   white instead, so the sweep does not have to look at it twice.
//! - **Backward** ([`Runtime::barrier_back`]): the black parent goes back to
//!   gray and is re-traversed in the atomic step. Tables use this since they
//!   are written often and re-traversing one is cheap.
//!
//! Stack slots and thread globals carry no barrier: threads are always
//! re-traversed atomically.

use std::mem::size_of;

use crate::error::GcError;
use crate::gc::GcPhase;
use crate::object::{Closure, LocalVar, ObjRef, UpvalueState};
use crate::table::Table;
use crate::value::{TypeTag, Value};
use crate::Runtime;

impl Runtime {
    /// Whether storing `child` into `parent` breaks the invariant right now.
    fn needs_barrier(&self, parent: ObjRef, child: ObjRef) -> bool {
        if matches!(self.gc.phase, GcPhase::Pause | GcPhase::Finalize) {
            return false;
        }
        self.heap.obj(child).marked().is_white() && self.heap.obj(parent).marked().is_black()
    }

    /// Forward barrier for storing object `child` into `parent`.
    ///
    /// # Panics
    ///
    /// In debug builds, if `parent` is a table (tables use
    /// [`Runtime::barrier_back`]) or either object is dead.
    pub fn object_barrier(&mut self, parent: ObjRef, child: ObjRef) {
        if !self.needs_barrier(parent, child) {
            return;
        }
        let white = self.gc.current_white;
        debug_assert!(
            self.heap.obj(parent).tag() != TypeTag::Table,
            "tables take the backward barrier"
        );
        debug_assert!(
            !self.heap.obj(child).marked().is_dead(white),
            "barrier on a dead object"
        );
        if self.gc.phase == GcPhase::Propagate {
            self.mark_object(child);
        } else {
            self.heap.obj_mut(parent).marked_mut().make_white(white);
        }
    }

    /// Forward barrier for storing `v` into `parent`; a no-op for
    /// non-collectable values.
    pub fn barrier(&mut self, parent: ObjRef, v: Value) {
        if let Some(child) = v.as_object() {
            self.object_barrier(parent, child);
        }
    }

    /// Backward barrier: a black table goes back to gray and is re-traversed
    /// atomically.
    pub fn barrier_back(&mut self, t: ObjRef) {
        if matches!(self.gc.phase, GcPhase::Pause | GcPhase::Finalize) {
            return;
        }
        let obj = self.heap.obj_mut(t);
        if !obj.marked().is_black() {
            return;
        }
        debug_assert_eq!(obj.tag(), TypeTag::Table);
        obj.marked_mut().black_to_gray();
        self.gc.gray_again.push(t);
    }

    fn table_barrier(&mut self, t: ObjRef, key: Value, value: Value) {
        let white = |rt: &Self, v: Value| {
            v.as_object()
                .is_some_and(|r| rt.heap.obj(r).marked().is_white())
        };
        if white(self, key) || white(self, value) {
            self.barrier_back(t);
        }
    }

    /// Stores `value` under `key` in table `t`. Storing nil removes the key.
    ///
    /// # Errors
    ///
    /// A runtime error for a nil or NaN key, or [`GcError::OutOfMemory`] if
    /// the table cannot grow.
    pub fn table_set(&mut self, t: ObjRef, key: Value, value: Value) -> Result<(), GcError> {
        Table::check_key(&key)?;
        let growth = self.heap.obj(t).as_table().growth_for(&key, &value);
        if growth > 0 {
            let size = self.heap.size_of(t) + growth;
            self.resize_object(t, size, &[key, value])?;
        }
        self.heap.obj_mut(t).as_table_mut().raw_set(key, value)?;
        self.table_barrier(t, key, value);
        let actual = self.heap.obj(t).body.byte_size();
        self.heap.shrink_to(t, actual);
        Ok(())
    }

    /// [`Runtime::table_set`] with an integer key.
    ///
    /// # Errors
    ///
    /// See [`Runtime::table_set`].
    #[allow(clippy::cast_precision_loss)]
    pub fn table_set_int(&mut self, t: ObjRef, key: i64, value: Value) -> Result<(), GcError> {
        self.table_set(t, Value::Number(key as f64), value)
    }

    /// Sets or clears the metatable of `v`. Values other than tables and
    /// userdata share one metatable per type.
    pub fn set_metatable(&mut self, v: Value, mt: Option<ObjRef>) {
        match v {
            Value::Table(t) => {
                self.heap.obj_mut(t).as_table_mut().metatable = mt;
                if let Some(mt) = mt {
                    self.table_barrier(t, Value::Nil, Value::Table(mt));
                }
            }
            Value::Userdata(u) => {
                self.heap.obj_mut(u).as_userdata_mut().metatable = mt;
                if let Some(mt) = mt {
                    self.object_barrier(u, mt);
                }
            }
            other => self.set_type_metatable(other.type_tag(), mt),
        }
    }

    /// Sets the environment table of userdata `u`.
    pub fn set_userdata_env(&mut self, u: ObjRef, env: ObjRef) {
        self.heap.obj_mut(u).as_userdata_mut().env = Some(env);
        self.object_barrier(u, env);
    }

    /// Sets the environment table of closure `f`.
    pub fn set_closure_env(&mut self, f: ObjRef, env: ObjRef) {
        match self.heap.obj_mut(f).as_closure_mut() {
            Closure::Native(c) => c.env = Some(env),
            Closure::Script(c) => c.env = Some(env),
        }
        self.object_barrier(f, env);
    }

    /// Sets upvalue `i` of a native closure.
    ///
    /// # Panics
    ///
    /// Panics if `f` is a script closure or `i` is out of range.
    pub fn set_native_upvalue(&mut self, f: ObjRef, i: usize, v: Value) {
        match self.heap.obj_mut(f).as_closure_mut() {
            Closure::Native(c) => c.upvalues[i] = v,
            Closure::Script(_) => panic!("script closures hold upvalue objects"),
        }
        self.barrier(f, v);
    }

    /// Binds slot `i` of a script closure to upvalue `uv`.
    ///
    /// # Panics
    ///
    /// Panics if `f` is a native closure or `i` is out of range.
    pub fn set_script_upvalue(&mut self, f: ObjRef, i: usize, uv: ObjRef) {
        debug_assert_eq!(self.heap.obj(uv).tag(), TypeTag::Upvalue);
        match self.heap.obj_mut(f).as_closure_mut() {
            Closure::Script(c) => c.upvalues[i] = Some(uv),
            Closure::Native(_) => panic!("native closures hold plain values"),
        }
        self.object_barrier(f, uv);
    }

    /// Charges `extra` bytes to prototype `p` before one of its vectors grows.
    fn grow_proto(&mut self, p: ObjRef, extra: usize, keep: &[Value]) -> Result<(), GcError> {
        let size = self.heap.size_of(p) + extra;
        self.resize_object(p, size, keep)
    }

    /// Appends a constant to prototype `p` and returns its index.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the constant array cannot grow.
    pub fn proto_push_constant(&mut self, p: ObjRef, k: Value) -> Result<usize, GcError> {
        self.grow_proto(p, size_of::<Value>(), &[k])?;
        let constants = &mut self.heap.obj_mut(p).as_proto_mut().constants;
        constants.push(k);
        let index = constants.len() - 1;
        self.barrier(p, k);
        Ok(index)
    }

    /// Appends a nested prototype.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the array cannot grow.
    pub fn proto_push_child(&mut self, p: ObjRef, child: ObjRef) -> Result<(), GcError> {
        debug_assert_eq!(self.heap.obj(child).tag(), TypeTag::Proto);
        self.roots.push_object(child);
        let grown = self.grow_proto(p, size_of::<ObjRef>(), &[]);
        self.roots.pop_object(child);
        grown?;
        self.heap.obj_mut(p).as_proto_mut().protos.push(child);
        self.object_barrier(p, child);
        Ok(())
    }

    /// Records the chunk name prototype `p` was compiled from.
    pub fn proto_set_source(&mut self, p: ObjRef, source: ObjRef) {
        self.heap.obj_mut(p).as_proto_mut().source = Some(source);
        self.object_barrier(p, source);
    }

    /// Appends debug information for a local variable.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the array cannot grow.
    pub fn proto_push_local(&mut self, p: ObjRef, local: LocalVar) -> Result<(), GcError> {
        self.grow_proto(p, size_of::<LocalVar>(), &[Value::String(local.name)])?;
        self.heap.obj_mut(p).as_proto_mut().locals.push(local);
        self.object_barrier(p, local.name);
        Ok(())
    }

    /// Appends an upvalue name.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the array cannot grow.
    pub fn proto_push_upvalue_name(&mut self, p: ObjRef, name: ObjRef) -> Result<(), GcError> {
        self.grow_proto(p, size_of::<ObjRef>(), &[Value::String(name)])?;
        self.heap.obj_mut(p).as_proto_mut().upvalue_names.push(name);
        self.object_barrier(p, name);
        Ok(())
    }

    /// Writes through an upvalue: into the aliased stack slot while it is
    /// open, into its own copy once closed.
    pub fn upvalue_set(&mut self, uv: ObjRef, v: Value) {
        match self.heap.obj(uv).as_upvalue().state {
            UpvalueState::Open { thread, level } => {
                self.heap.obj_mut(thread).as_thread_mut().stack[level] = v;
            }
            UpvalueState::Closed(_) => {
                self.heap.obj_mut(uv).as_upvalue_mut().state = UpvalueState::Closed(v);
                self.barrier(uv, v);
            }
        }
    }

    /// Replaces the globals table of `thread`.
    pub fn set_globals(&mut self, thread: ObjRef, globals: ObjRef) {
        self.heap.obj_mut(thread).as_thread_mut().globals = Value::Table(globals);
    }
}
