//! Finalizer dispatch.
//!
//! Userdata whose metatable carries a `__gc` entry are separated during the
//! atomic step and queued on `tmudata`. The Finalize phase pops them one at a
//! time, puts each back on the ordinary userdata list, and calls its `__gc`
//! with the userdata as the only argument. A userdata is separated at most
//! once, so every finalizer runs exactly once even when it resurrects its
//! object.

use crate::error::GcError;
use crate::object::Closure;
use crate::state::TagMethod;
use crate::value::Value;
use crate::Runtime;

use super::tracing::log_finalizer;

/// Calls a `__gc` metamethod: `(runtime, metamethod, userdata)`.
///
/// Embedders running their own interpreter install one with
/// [`Runtime::set_finalizer_invoker`]. Without one, native closures are
/// called directly and anything else is reported as an error.
pub type FinalizerInvoker = Box<dyn FnMut(&mut Runtime, Value, Value) -> Result<(), GcError>>;

impl Runtime {
    /// Installs the hook used to call `__gc` metamethods, returning the
    /// previous one.
    pub fn set_finalizer_invoker(
        &mut self,
        invoker: FinalizerInvoker,
    ) -> Option<FinalizerInvoker> {
        self.finalizer_invoker.replace(invoker)
    }

    /// Number of userdata waiting for their finalizer.
    #[must_use]
    pub fn pending_finalizers(&self) -> usize {
        self.gc.tmudata.len()
    }

    /// Whether a finalizer is running right now.
    #[must_use]
    pub const fn in_finalizer(&self) -> bool {
        self.gc.in_finalizer
    }

    /// Dequeues the next pending userdata and calls its finalizer.
    ///
    /// While the finalizer runs the threshold is raised to twice the current
    /// heap so allocations inside it do not start another step, and nested
    /// collection requests are ignored.
    pub(crate) fn call_next_finalizer(&mut self) -> Result<(), GcError> {
        let Some(u) = self.gc.tmudata.pop_front() else {
            return Ok(());
        };
        self.heap.udata.push(u);
        let white = self.gc.current_white;
        self.heap.obj_mut(u).marked_mut().make_white(white);
        log_finalizer(self.gc.tmudata.len());

        let tm = match self.heap.obj(u).as_userdata().metatable {
            Some(mt) => self.fast_tm(mt, TagMethod::Gc),
            None => Value::Nil,
        };
        if tm.is_nil() {
            return Ok(());
        }
        self.metrics.record_finalizer();

        let saved_threshold = self.gc.threshold;
        self.gc.threshold = self.heap.total_bytes().saturating_mul(2);
        self.gc.in_finalizer = true;

        let udata = Value::Userdata(u);
        let result = match self.finalizer_invoker.take() {
            Some(mut invoker) => {
                let result = invoker(self, tm, udata);
                if self.finalizer_invoker.is_none() {
                    self.finalizer_invoker = Some(invoker);
                }
                result
            }
            None => self.call_native_finalizer(tm, udata),
        };

        self.gc.in_finalizer = false;
        self.gc.threshold = saved_threshold;
        result
    }

    fn call_native_finalizer(&mut self, tm: Value, udata: Value) -> Result<(), GcError> {
        let Value::Function(f) = tm else {
            return Err(GcError::Finalizer(format!(
                "attempt to call a {} value",
                tm.type_tag()
            )));
        };
        let func = match self.heap.obj(f).as_closure() {
            Closure::Native(c) => c.func,
            Closure::Script(_) => {
                return Err(GcError::Finalizer(
                    "script finalizer called without an invoker".into(),
                ))
            }
        };
        let thread = self.current_thread;
        let top = self.top();
        self.push(tm)?;
        self.push(udata)?;
        let result = func(self, thread).map(drop);
        self.set_top(top);
        result
    }

    /// Calls every pending finalizer, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a finalizer; the remaining ones stay
    /// queued.
    pub fn call_pending_finalizers(&mut self) -> Result<(), GcError> {
        while !self.gc.tmudata.is_empty() {
            self.call_next_finalizer()?;
        }
        Ok(())
    }
}
