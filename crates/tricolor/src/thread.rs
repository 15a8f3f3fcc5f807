//! Per-thread state: value stack, call frames and open upvalues.
//!
//! Stack slots carry no write barrier. The collector instead keeps every
//! traversed thread gray and re-scans it during the atomic step.

use std::mem::size_of;

use crate::error::GcError;
use crate::gc::GcPhase;
use crate::object::{ObjRef, ObjectBody, Upvalue, UpvalueState};
use crate::value::Value;
use crate::Runtime;

/// Initial number of stack slots of a new thread.
pub const BASIC_STACK_SIZE: usize = 40;
/// Initial capacity of the call-frame array.
pub const BASIC_FRAME_SIZE: usize = 8;

/// Execution status of a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Runnable.
    #[default]
    Ok,
    /// Suspended in a yield.
    Yield,
    /// Stopped by an error; cannot be resumed.
    Dead,
}

/// One activation record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallFrame {
    /// Stack index of the called function.
    pub func: usize,
    /// First stack slot of the frame.
    pub base: usize,
    /// Highest stack slot the frame may use.
    pub top: usize,
    /// Instruction to resume at.
    pub saved_pc: u32,
    /// Expected results, or -1 for all of them.
    pub num_results: i32,
}

/// An execution thread.
#[derive(Debug)]
pub struct Thread {
    /// Allocated slots; everything at or above `top` is scratch.
    pub(crate) stack: Vec<Value>,
    pub(crate) top: usize,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) frame_size: usize,
    /// Open upvalues as `(stack level, upvalue)`, ascending by level.
    pub(crate) open_upvalues: Vec<(usize, ObjRef)>,
    /// Table of globals.
    pub globals: Value,
    /// Whether the thread can run.
    pub status: ThreadStatus,
}

impl Thread {
    pub(crate) fn new(globals: Value) -> Self {
        Self {
            stack: vec![Value::Nil; BASIC_STACK_SIZE],
            top: 0,
            frames: Vec::with_capacity(BASIC_FRAME_SIZE),
            frame_size: BASIC_FRAME_SIZE,
            open_upvalues: Vec::new(),
            globals,
            status: ThreadStatus::Ok,
        }
    }

    /// Live part of the stack.
    #[must_use]
    pub fn stack(&self) -> &[Value] {
        &self.stack[..self.top]
    }

    /// Number of allocated stack slots.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// First free stack slot.
    #[must_use]
    pub const fn top(&self) -> usize {
        self.top
    }

    /// Active call frames, innermost last.
    #[must_use]
    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    /// Number of upvalues still aliasing this thread's stack.
    #[must_use]
    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    /// Bytes owned by the stack and the frame array.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.stack.len() * size_of::<Value>() + self.frame_size * size_of::<CallFrame>()
    }

    /// Slot that must be occupied by an open upvalue for `level`, if any.
    pub(crate) fn find_open(&self, level: usize) -> Result<usize, usize> {
        self.open_upvalues.binary_search_by_key(&level, |&(l, _)| l)
    }

    /// Size of the stack after it grows to hold `extra` more slots.
    pub(crate) fn grown_stack_size(&self, extra: usize) -> usize {
        let needed = self.top + extra;
        let mut size = self.stack.len();
        while size < needed {
            size *= 2;
        }
        size
    }

    pub(crate) fn grown_frame_size(&self) -> usize {
        if self.frames.len() < self.frame_size {
            self.frame_size
        } else {
            self.frame_size * 2
        }
    }
}

impl Runtime {
    fn current(&self) -> &Thread {
        self.heap.obj(self.current_thread).as_thread()
    }

    fn current_mut(&mut self) -> &mut Thread {
        self.heap.obj_mut(self.current_thread).as_thread_mut()
    }

    /// Makes room for `extra` more slots above the current thread's top.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the allocator refuses the larger stack.
    pub fn check_stack(&mut self, extra: usize) -> Result<(), GcError> {
        self.grow_stack(extra, &[])
    }

    fn grow_stack(&mut self, extra: usize, keep: &[Value]) -> Result<(), GcError> {
        let th = self.current();
        let (old_len, new_len) = (th.stack.len(), th.grown_stack_size(extra));
        if new_len == old_len {
            return Ok(());
        }
        let r = self.current_thread;
        let size = self.heap.size_of(r) + (new_len - old_len) * size_of::<Value>();
        self.resize_object(r, size, keep)?;
        self.current_mut().stack.resize(new_len, Value::Nil);
        Ok(())
    }

    /// Pushes onto the current thread's stack, growing it if needed.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the stack cannot grow.
    pub fn push(&mut self, v: Value) -> Result<(), GcError> {
        self.grow_stack(1, &[v])?;
        let th = self.current_mut();
        th.stack[th.top] = v;
        th.top += 1;
        Ok(())
    }

    /// Pops the current thread's top slot.
    pub fn pop(&mut self) -> Option<Value> {
        let th = self.current_mut();
        th.top = th.top.checked_sub(1)?;
        Some(th.stack[th.top])
    }

    /// Top of the current thread's stack.
    #[must_use]
    pub fn top(&self) -> usize {
        self.current().top
    }

    /// Moves the current thread's top; slots uncovered by raising it read
    /// as nil.
    ///
    /// # Panics
    ///
    /// Panics if `top` is past the allocated stack; call
    /// [`Runtime::check_stack`] first.
    pub fn set_top(&mut self, top: usize) {
        let th = self.current_mut();
        assert!(top <= th.stack.len(), "stack top {top} out of range");
        if top > th.top {
            th.stack[th.top..top].fill(Value::Nil);
        }
        th.top = top;
    }

    /// Reads a live stack slot of the current thread.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below top.
    #[must_use]
    pub fn stack_get(&self, index: usize) -> Value {
        self.current().stack()[index]
    }

    /// Writes a live stack slot. Stack writes need no barrier.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below top.
    pub fn stack_set(&mut self, index: usize, v: Value) {
        let th = self.current_mut();
        assert!(index < th.top, "stack index {index} above top");
        th.stack[index] = v;
    }

    /// Pushes a call frame on the current thread.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the frame array cannot grow.
    pub fn push_frame(&mut self, frame: CallFrame) -> Result<(), GcError> {
        let th = self.current();
        let (old, new) = (th.frame_size, th.grown_frame_size());
        if new > old {
            let r = self.current_thread;
            let size = self.heap.size_of(r) + (new - old) * size_of::<CallFrame>();
            self.resize_object(r, size, &[])?;
            let th = self.current_mut();
            th.frame_size = new;
            th.frames.reserve_exact(new - th.frames.len());
        }
        self.current_mut().frames.push(frame);
        Ok(())
    }

    /// Pops the innermost call frame of the current thread.
    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        self.current_mut().frames.pop()
    }

    /// The open upvalue aliasing `level` of `thread`'s stack, created if it
    /// does not exist yet.
    ///
    /// An existing upvalue the sweep has not reached yet may already be dead;
    /// it is revived by flipping its white.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if a new upvalue cannot be allocated.
    pub fn find_upvalue(&mut self, thread: ObjRef, level: usize) -> Result<ObjRef, GcError> {
        let th = self.heap.obj(thread).as_thread();
        assert!(level < th.stack.len(), "upvalue level {level} outside the stack");
        if let Ok(i) = th.find_open(level) {
            let uv = th.open_upvalues[i].1;
            let white = self.gc.current_white;
            let obj = self.heap.obj_mut(uv);
            if obj.marked().is_dead(white) {
                obj.marked_mut().change_white();
            }
            return Ok(uv);
        }

        let body = ObjectBody::Upvalue(Upvalue {
            state: UpvalueState::Open { thread, level },
        });
        let uv = self.allocate(body, &[Value::Thread(thread)])?;
        let th = self.heap.obj_mut(thread).as_thread_mut();
        let pos = th.find_open(level).unwrap_or_else(|pos| pos);
        th.open_upvalues.insert(pos, (level, uv));
        self.open_upvalues.push(uv);
        Ok(uv)
    }

    /// Closes every open upvalue of `thread` at or above `level`: each takes
    /// a copy of its stack slot and joins the general object list.
    pub fn close_upvalues(&mut self, thread: ObjRef, level: usize) {
        loop {
            let th = self.heap.obj_mut(thread).as_thread_mut();
            let uv = match th.open_upvalues.last() {
                Some(&(l, uv)) if l >= level => uv,
                _ => break,
            };
            th.open_upvalues.pop();

            let white = self.gc.current_white;
            if self.heap.obj(uv).marked().is_dead(white) {
                self.free_object(uv);
                continue;
            }
            let value = self.upvalue_get(uv);
            self.unlink_open_upvalue(uv);
            self.heap.obj_mut(uv).as_upvalue_mut().state = UpvalueState::Closed(value);
            self.heap.objects.push(uv);

            if self.heap.obj(uv).marked().is_gray() {
                if self.gc.phase == GcPhase::Propagate {
                    self.heap.obj_mut(uv).marked_mut().gray_to_black();
                    self.barrier(uv, value);
                } else {
                    self.heap.obj_mut(uv).marked_mut().make_white(white);
                }
            }
        }
    }

    /// Current value of an upvalue, read through the stack while it is open.
    #[must_use]
    pub fn upvalue_get(&self, uv: ObjRef) -> Value {
        match self.heap.obj(uv).as_upvalue().state {
            UpvalueState::Open { thread, level } => self.heap.obj(thread).as_thread().stack[level],
            UpvalueState::Closed(v) => v,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_layout() {
        let th = Thread::new(Value::Nil);
        assert_eq!(th.stack_size(), BASIC_STACK_SIZE);
        assert!(th.stack().is_empty());
        assert_eq!(
            th.byte_size(),
            BASIC_STACK_SIZE * size_of::<Value>() + BASIC_FRAME_SIZE * size_of::<CallFrame>()
        );
    }

    #[test]
    fn test_stack_growth_doubles() {
        let mut th = Thread::new(Value::Nil);
        assert_eq!(th.grown_stack_size(BASIC_STACK_SIZE), BASIC_STACK_SIZE);
        th.top = BASIC_STACK_SIZE;
        assert_eq!(th.grown_stack_size(1), BASIC_STACK_SIZE * 2);
        assert_eq!(th.grown_stack_size(BASIC_STACK_SIZE * 3), BASIC_STACK_SIZE * 4);
    }

    #[test]
    fn test_frame_array_doubles_when_full() {
        let mut th = Thread::new(Value::Nil);
        assert_eq!(th.grown_frame_size(), BASIC_FRAME_SIZE);
        th.frames.resize(BASIC_FRAME_SIZE, CallFrame::default());
        assert_eq!(th.grown_frame_size(), BASIC_FRAME_SIZE * 2);
    }

    #[test]
    fn test_find_open_keeps_order() {
        let mut th = Thread::new(Value::Nil);
        th.open_upvalues = vec![(1, ObjRef::new(0, 0)), (5, ObjRef::new(1, 0))];
        assert_eq!(th.find_open(5), Ok(1));
        assert_eq!(th.find_open(3), Err(1));
        assert_eq!(th.find_open(9), Err(2));
    }
}
