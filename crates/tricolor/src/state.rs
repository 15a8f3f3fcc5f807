//! The runtime: state shared by every thread.
//!
//! A [`Runtime`] owns the object arena, the intern table, the collector state
//! and the root set (main thread, registry, per-type metatables and pinned
//! objects). Everything is per instance; two runtimes share nothing.

use std::fmt;

use crate::alloc::{Allocator, SystemAllocator};
use crate::color::Color;
use crate::error::GcError;
use crate::gc::tracing::log_emergency;
use crate::gc::{FinalizerInvoker, GcConfig, GcPhase, GcState};
use crate::heap::Heap;
use crate::metrics::{CollectionType, Metrics};
use crate::object::{
    Closure, GcObject, LuaString, NativeClosure, NativeFn, ObjRef, ObjectBody, Proto,
    ScriptClosure, Upvalue, Userdata,
};
use crate::roots::RootStack;
use crate::string::{hash_bytes, StringTable};
use crate::table::Table;
use crate::thread::Thread;
use crate::value::{TypeTag, Value, NUM_BASIC_TAGS};

/// Metamethod events, in the order their names are interned.
///
/// The first five are looked up often enough that a table used as a
/// metatable caches their absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TagMethod {
    Index,
    NewIndex,
    Gc,
    Mode,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Lt,
    Le,
    Concat,
    Call,
}

impl TagMethod {
    /// Every event, in interning order.
    pub const ALL: [Self; 17] = [
        Self::Index,
        Self::NewIndex,
        Self::Gc,
        Self::Mode,
        Self::Eq,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Div,
        Self::Mod,
        Self::Pow,
        Self::Unm,
        Self::Len,
        Self::Lt,
        Self::Le,
        Self::Concat,
        Self::Call,
    ];

    /// The metatable key for this event.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Index => "__index",
            Self::NewIndex => "__newindex",
            Self::Gc => "__gc",
            Self::Mode => "__mode",
            Self::Eq => "__eq",
            Self::Add => "__add",
            Self::Sub => "__sub",
            Self::Mul => "__mul",
            Self::Div => "__div",
            Self::Mod => "__mod",
            Self::Pow => "__pow",
            Self::Unm => "__unm",
            Self::Len => "__len",
            Self::Lt => "__lt",
            Self::Le => "__le",
            Self::Concat => "__concat",
            Self::Call => "__call",
        }
    }

    /// Whether a metatable remembers that this event is missing.
    #[must_use]
    pub const fn is_cacheable(self) -> bool {
        (self as u8) <= Self::Eq as u8
    }
}

/// Called with an error that escaped every protected boundary.
pub type PanicHandler = Box<dyn FnMut(&GcError)>;

/// The runtime's global state.
pub struct Runtime {
    pub(crate) heap: Heap,
    pub(crate) strings: StringTable,
    pub(crate) gc: GcState,
    pub(crate) config: GcConfig,
    pub(crate) roots: RootStack,
    pub(crate) registry: Value,
    pub(crate) main_thread: ObjRef,
    pub(crate) current_thread: ObjRef,
    pub(crate) type_metatables: [Option<ObjRef>; NUM_BASIC_TAGS],
    pub(crate) tm_names: Vec<ObjRef>,
    /// Every open upvalue of every thread.
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) metrics: Metrics,
    pub(crate) finalizer_invoker: Option<FinalizerInvoker>,
    panic_handler: Option<PanicHandler>,
    /// Set once construction finished; emergency collections wait for it.
    ready: bool,
    closed: bool,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("heap", &self.heap)
            .field("phase", &self.gc.phase)
            .field("strings", &self.strings.count())
            .field("threshold", &self.gc.threshold)
            .finish_non_exhaustive()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

impl Runtime {
    /// Creates a runtime backed by the [`SystemAllocator`].
    ///
    /// # Panics
    ///
    /// Panics if `config.min_string_table_size` is not a power of two.
    #[must_use]
    pub fn new(config: GcConfig) -> Self {
        match Self::with_allocator(Box::new(SystemAllocator), config) {
            Ok(rt) => rt,
            Err(err) => unreachable!("system allocator refused a request: {err}"),
        }
    }

    /// Creates a runtime whose memory requests go through `allocator`.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the allocator refuses the initial state.
    ///
    /// # Panics
    ///
    /// Panics if `config.min_string_table_size` is not a power of two.
    pub fn with_allocator(allocator: Box<dyn Allocator>, config: GcConfig) -> Result<Self, GcError> {
        assert!(
            config.min_string_table_size.is_power_of_two(),
            "string table size must be a power of two"
        );
        let placeholder = ObjRef::new(u32::MAX, 0);
        let mut rt = Self {
            heap: Heap::new(allocator),
            strings: StringTable::new(),
            gc: GcState::new(),
            config,
            roots: RootStack::new(),
            registry: Value::Nil,
            main_thread: placeholder,
            current_thread: placeholder,
            type_metatables: [None; NUM_BASIC_TAGS],
            tm_names: Vec::with_capacity(TagMethod::ALL.len()),
            open_upvalues: Vec::new(),
            metrics: Metrics::new(),
            finalizer_invoker: None,
            panic_handler: None,
            ready: false,
            closed: false,
        };

        let main = rt.allocate(ObjectBody::Thread(Thread::new(Value::Nil)), &[])?;
        rt.heap.obj_mut(main).marked_mut().set_super_fixed();
        rt.heap.objects.push(main);
        rt.main_thread = main;
        rt.current_thread = main;

        let size = rt.config.min_string_table_size;
        rt.reserve(0, StringTable::bucket_bytes(size), &[])?;
        rt.strings.resize(size, |_| 0);

        let registry = rt.new_table()?;
        rt.registry = Value::Table(registry);
        let globals = rt.new_table()?;
        rt.set_globals(main, globals);

        for event in TagMethod::ALL {
            let name = rt.intern_str(event.name())?;
            rt.fix_string(name);
            rt.tm_names.push(name);
        }

        rt.gc.threshold = rt.heap.total_bytes().saturating_mul(4);
        rt.ready = true;
        Ok(rt)
    }

    // ------------------------------------------------------------------
    // Allocation

    /// Charges an `old -> new` resize, collecting once if the allocator
    /// refuses. `keep` stays rooted across that collection, and finalizers
    /// found by it wait for the next regular one.
    pub(crate) fn reserve(&mut self, old: usize, new: usize, keep: &[Value]) -> Result<(), GcError> {
        self.reserve_for(None, old, new, keep)
    }

    fn reserve_for(
        &mut self,
        owner: Option<ObjRef>,
        old: usize,
        new: usize,
        keep: &[Value],
    ) -> Result<(), GcError> {
        if self.heap.charge(old, new) {
            return Ok(());
        }
        if !self.ready || self.gc.in_finalizer {
            return Err(GcError::OutOfMemory);
        }
        log_emergency(new, self.heap.total_bytes());
        self.roots.push_frame();
        if let Some(owner) = owner {
            self.roots.push_object(owner);
        }
        for &v in keep {
            self.roots.push(v);
        }
        let collected = self.full_collect_as(CollectionType::Emergency);
        self.roots.pop_frame();
        collected?;
        if self.heap.charge(old, new) {
            Ok(())
        } else {
            Err(GcError::OutOfMemory)
        }
    }

    /// Charges the growth of `r` to `new_size` bytes; `r` and `keep` survive
    /// a collection triggered by the request.
    pub(crate) fn resize_object(
        &mut self,
        r: ObjRef,
        new_size: usize,
        keep: &[Value],
    ) -> Result<(), GcError> {
        let old = self.heap.size_of(r);
        self.reserve_for(Some(r), old, new_size, keep)?;
        self.heap.set_size(r, new_size);
        Ok(())
    }

    /// Stores a new object colored with the current white. The caller links
    /// it into the list it belongs to.
    pub(crate) fn allocate(&mut self, body: ObjectBody, keep: &[Value]) -> Result<ObjRef, GcError> {
        let size = body.byte_size();
        self.reserve(0, size, keep)?;
        let obj = GcObject::new(body, self.gc.current_white);
        Ok(self.heap.insert(obj, size))
    }

    // ------------------------------------------------------------------
    // Strings

    /// Returns the unique string with these bytes, creating it if needed.
    ///
    /// A matching string that is dead but not yet swept is revived by
    /// flipping its white; it is not re-marked.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if a new string cannot be allocated.
    pub fn intern(&mut self, bytes: &[u8]) -> Result<ObjRef, GcError> {
        let hash = hash_bytes(bytes);
        let bucket = self.strings.bucket(self.strings.bucket_index(hash));
        let found = bucket.iter().rev().copied().find(|&r| {
            let s = self.heap.obj(r).as_string();
            s.hash() == hash && s.as_bytes() == bytes
        });
        if let Some(r) = found {
            let white = self.gc.current_white;
            let obj = self.heap.obj_mut(r);
            if obj.marked().is_dead(white) {
                obj.marked_mut().change_white();
            }
            return Ok(r);
        }

        let r = self.allocate(ObjectBody::String(LuaString::new(bytes, hash)), &[])?;
        self.strings.insert(hash, r);
        if self.strings.is_crowded() {
            self.resize_strings(self.strings.size() * 2);
        }
        Ok(r)
    }

    /// Interns a UTF-8 string.
    ///
    /// # Errors
    ///
    /// See [`Runtime::intern`].
    pub fn intern_str(&mut self, s: &str) -> Result<ObjRef, GcError> {
        self.intern(s.as_bytes())
    }

    /// Contents of string `s`.
    #[must_use]
    pub fn string_bytes(&self, s: ObjRef) -> &[u8] {
        self.heap.obj(s).as_string().as_bytes()
    }

    /// Keeps a string alive for the lifetime of the runtime.
    pub fn fix_string(&mut self, s: ObjRef) {
        self.heap.obj_mut(s).marked_mut().set_fixed();
    }

    /// Number of interned strings.
    #[must_use]
    pub const fn string_count(&self) -> usize {
        self.strings.count()
    }

    /// Number of buckets in the intern table.
    #[must_use]
    pub fn string_table_size(&self) -> usize {
        self.strings.size()
    }

    /// The intern table, for inspection.
    #[must_use]
    pub const fn strings(&self) -> &StringTable {
        &self.strings
    }

    // ------------------------------------------------------------------
    // Object creation

    fn current_globals(&self) -> Option<ObjRef> {
        match self.heap.obj(self.current_thread).as_thread().globals {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Creates an empty table.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`].
    pub fn new_table(&mut self) -> Result<ObjRef, GcError> {
        let t = self.allocate(ObjectBody::Table(Table::new()), &[])?;
        self.heap.objects.push(t);
        Ok(t)
    }

    /// Creates a zero-filled userdata of `len` bytes whose environment is
    /// the current thread's globals.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`].
    pub fn new_userdata(&mut self, len: usize) -> Result<ObjRef, GcError> {
        let body = ObjectBody::Userdata(Userdata {
            data: vec![0; len].into_boxed_slice(),
            metatable: None,
            env: self.current_globals(),
            finalized: false,
        });
        let u = self.allocate(body, &[])?;
        self.heap.udata.push(u);
        Ok(u)
    }

    /// Creates an empty function prototype.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`].
    pub fn new_proto(&mut self) -> Result<ObjRef, GcError> {
        let p = self.allocate(ObjectBody::Proto(Proto::default()), &[])?;
        self.heap.objects.push(p);
        Ok(p)
    }

    /// Creates a native closure with `num_upvalues` nil upvalues, closed
    /// over the current thread's globals.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`].
    pub fn new_native_closure(
        &mut self,
        func: NativeFn,
        num_upvalues: usize,
    ) -> Result<ObjRef, GcError> {
        let body = ObjectBody::Function(Closure::Native(NativeClosure {
            func,
            upvalues: vec![Value::Nil; num_upvalues],
            env: self.current_globals(),
        }));
        let f = self.allocate(body, &[])?;
        self.heap.objects.push(f);
        Ok(f)
    }

    /// Instantiates prototype `proto` with unbound upvalue slots, closed over
    /// the current thread's globals.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`].
    pub fn new_script_closure(&mut self, proto: ObjRef) -> Result<ObjRef, GcError> {
        let slots = usize::from(self.heap.obj(proto).as_proto().num_upvalues);
        let body = ObjectBody::Function(Closure::Script(ScriptClosure {
            proto,
            upvalues: vec![None; slots],
            env: self.current_globals(),
        }));
        self.roots.push_object(proto);
        let f = self.allocate(body, &[]);
        self.roots.pop_object(proto);
        let f = f?;
        self.heap.objects.push(f);
        Ok(f)
    }

    /// Creates a thread sharing this runtime, with the current thread's
    /// globals.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`].
    pub fn new_thread(&mut self) -> Result<ObjRef, GcError> {
        let globals = self.heap.obj(self.current_thread).as_thread().globals;
        let th = self.allocate(ObjectBody::Thread(Thread::new(globals)), &[globals])?;
        self.heap.objects.push(th);
        Ok(th)
    }

    /// Replaces the code and line information of prototype `p`.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] if the new arrays cannot be charged.
    pub fn proto_set_code(
        &mut self,
        p: ObjRef,
        code: Vec<u32>,
        line_info: Vec<u32>,
    ) -> Result<(), GcError> {
        let old = self.heap.obj(p).as_proto();
        let word = std::mem::size_of::<u32>();
        let size = self.heap.size_of(p) - (old.code.len() + old.line_info.len()) * word
            + (code.len() + line_info.len()) * word;
        self.resize_object(p, size, &[])?;
        let proto = self.heap.obj_mut(p).as_proto_mut();
        proto.code = code;
        proto.line_info = line_info;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors

    /// The object arena.
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    /// # Panics
    ///
    /// Panics if `r` is dangling.
    #[must_use]
    pub fn object(&self, r: ObjRef) -> &GcObject {
        self.heap.obj(r)
    }

    /// Kind of object `r`.
    #[must_use]
    pub fn type_of(&self, r: ObjRef) -> TypeTag {
        self.heap.obj(r).tag()
    }

    /// String `r`; panics if `r` is another kind.
    #[must_use]
    pub fn string(&self, r: ObjRef) -> &LuaString {
        self.heap.obj(r).as_string()
    }

    /// Table `r`; panics if `r` is another kind.
    #[must_use]
    pub fn table(&self, r: ObjRef) -> &Table {
        self.heap.obj(r).as_table()
    }

    /// Userdata `r`; panics if `r` is another kind.
    #[must_use]
    pub fn userdata(&self, r: ObjRef) -> &Userdata {
        self.heap.obj(r).as_userdata()
    }

    /// The userdata's payload. Holds no references, so needs no barrier.
    pub fn userdata_data_mut(&mut self, r: ObjRef) -> &mut [u8] {
        &mut self.heap.obj_mut(r).as_userdata_mut().data
    }

    /// Closure `r`; panics if `r` is another kind.
    #[must_use]
    pub fn closure(&self, r: ObjRef) -> &Closure {
        self.heap.obj(r).as_closure()
    }

    /// Prototype `r`; panics if `r` is another kind.
    #[must_use]
    pub fn proto(&self, r: ObjRef) -> &Proto {
        self.heap.obj(r).as_proto()
    }

    /// Upvalue `r`; panics if `r` is another kind.
    #[must_use]
    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        self.heap.obj(r).as_upvalue()
    }

    /// Thread `r`; panics if `r` is another kind.
    #[must_use]
    pub fn thread(&self, r: ObjRef) -> &Thread {
        self.heap.obj(r).as_thread()
    }

    // ------------------------------------------------------------------
    // Roots

    /// The registry table.
    #[must_use]
    pub const fn registry(&self) -> Value {
        self.registry
    }

    /// The main thread. It is never collected.
    #[must_use]
    pub const fn main_thread(&self) -> ObjRef {
        self.main_thread
    }

    /// Thread the stack operations act on.
    #[must_use]
    pub const fn current_thread(&self) -> ObjRef {
        self.current_thread
    }

    /// Makes `thread` the target of the stack operations.
    ///
    /// # Panics
    ///
    /// Panics if `thread` is not a thread.
    pub fn set_current_thread(&mut self, thread: ObjRef) {
        assert_eq!(self.heap.obj(thread).tag(), TypeTag::Thread);
        self.current_thread = thread;
    }

    /// Globals table of the current thread.
    #[must_use]
    pub fn globals(&self) -> Value {
        self.heap.obj(self.current_thread).as_thread().globals
    }

    /// Sets the metatable shared by every value of a basic type.
    ///
    /// # Panics
    ///
    /// Panics for internal kinds.
    pub fn set_type_metatable(&mut self, tag: TypeTag, mt: Option<ObjRef>) {
        assert!((tag as usize) < NUM_BASIC_TAGS, "{tag} has no type metatable");
        self.type_metatables[tag as usize] = mt;
    }

    /// Metatable shared by values of type `tag`.
    #[must_use]
    pub fn type_metatable(&self, tag: TypeTag) -> Option<ObjRef> {
        self.type_metatables.get(tag as usize).copied().flatten()
    }

    /// Keeps `v` alive until a matching [`Runtime::unpin`].
    pub fn pin(&mut self, v: Value) {
        self.roots.push(v);
    }

    /// Releases one pin of `v`. Returns false if `v` was not pinned.
    pub fn unpin(&mut self, v: Value) -> bool {
        self.roots.pop(v)
    }

    /// Pins an object that cannot be held in a [`Value`], such as a
    /// prototype under construction.
    pub fn pin_object(&mut self, r: ObjRef) {
        self.roots.push_object(r);
    }

    /// Releases one pin of `r`.
    pub fn unpin_object(&mut self, r: ObjRef) -> bool {
        self.roots.pop_object(r)
    }

    // ------------------------------------------------------------------
    // Metamethods

    /// Looks up `event` in metatable `mt`, remembering misses of cacheable
    /// events in the table.
    pub(crate) fn fast_tm(&mut self, mt: ObjRef, event: TagMethod) -> Value {
        let bit = 1u8 << (event as u8);
        let table = self.heap.obj(mt).as_table();
        if event.is_cacheable() && table.tm_absent & bit != 0 {
            return Value::Nil;
        }
        let tm = table.get_str(self.tm_names[event as usize]);
        if tm.is_nil() && event.is_cacheable() {
            self.heap.obj_mut(mt).as_table_mut().tm_absent |= bit;
        }
        tm
    }

    /// The metatable of `v`: its own for tables and userdata, the per-type
    /// one otherwise.
    #[must_use]
    pub fn metatable_of(&self, v: Value) -> Option<ObjRef> {
        match v {
            Value::Table(t) => self.heap.obj(t).as_table().metatable,
            Value::Userdata(u) => self.heap.obj(u).as_userdata().metatable,
            other => self.type_metatable(other.type_tag()),
        }
    }

    /// The handler for `event` on `v`, or nil.
    pub fn metamethod(&mut self, v: Value, event: TagMethod) -> Value {
        match self.metatable_of(v) {
            Some(mt) => self.fast_tm(mt, event),
            None => Value::Nil,
        }
    }

    /// Interned name of `event`.
    #[must_use]
    pub fn tag_method_name(&self, event: TagMethod) -> ObjRef {
        self.tm_names[event as usize]
    }

    // ------------------------------------------------------------------
    // Liveness

    /// Whether `r` carries the white of a finished mark and waits for the
    /// sweep.
    #[must_use]
    pub fn is_dead(&self, r: ObjRef) -> bool {
        self.heap.obj(r).marked().is_dead(self.gc.current_white)
    }

    /// Tri-color view of `r`'s mark.
    #[must_use]
    pub fn color_of(&self, r: ObjRef) -> Color {
        self.heap.obj(r).marked().color()
    }

    /// Whether `r` still names an object; `false` once it has been freed.
    #[must_use]
    pub fn is_alive(&self, r: ObjRef) -> bool {
        self.heap.contains(r)
    }

    /// Collector statistics.
    #[must_use]
    pub const fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // ------------------------------------------------------------------
    // Errors

    /// Installs the handler called for unprotected errors and returns the
    /// previous one.
    pub fn at_panic(&mut self, handler: PanicHandler) -> Option<PanicHandler> {
        self.panic_handler.replace(handler)
    }

    /// Reports an error no protected boundary caught, then panics.
    ///
    /// # Panics
    ///
    /// Always.
    pub fn raise(&mut self, err: GcError) -> ! {
        if let Some(handler) = self.panic_handler.as_mut() {
            handler(&err);
        }
        panic!("unprotected error in call to runtime ({err})")
    }

    /// Runs `f` as a protected call. On error the current thread, its stack
    /// top and its call frames are restored, and upvalues above the old top
    /// are closed.
    ///
    /// # Errors
    ///
    /// Whatever `f` returns.
    pub fn protected<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, GcError>,
    ) -> Result<T, GcError> {
        let thread = self.current_thread;
        let th = self.heap.obj(thread).as_thread();
        let (top, frames) = (th.top, th.frames.len());
        let result = f(self);
        if result.is_err() && self.heap.contains(thread) {
            self.current_thread = thread;
            self.close_upvalues(thread, top);
            let th = self.heap.obj_mut(thread).as_thread_mut();
            th.top = top.min(th.stack.len());
            th.frames.truncate(frames);
        }
        result
    }

    // ------------------------------------------------------------------
    // Shutdown

    /// Finalizes every userdata with a `__gc` metamethod, then frees every
    /// object and returns all bytes to the allocator.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let main = self.main_thread;
        if self.heap.contains(main) {
            self.current_thread = main;
            self.close_upvalues(main, 0);
            self.separate_udata(true);
            while !self.gc.tmudata.is_empty() {
                // errors are dropped; the userdata is already dequeued
                let _ = self.call_next_finalizer();
            }
        }
        self.ready = false;
        // Freeing happens in no particular order; barriers must not look at
        // objects that are already gone.
        self.gc.phase = GcPhase::Pause;

        while let Some(r) = self.heap.objects.pop() {
            if r != main {
                self.free_object(r);
            }
        }
        while let Some(r) = self.heap.udata.pop() {
            self.free_object(r);
        }
        let strings: Vec<ObjRef> = self.strings.iter().collect();
        for s in strings {
            self.free_object(s);
        }
        self.heap.release(StringTable::bucket_bytes(self.strings.size()));
        self.strings = StringTable::new();
        if self.heap.contains(main) {
            self.heap.remove(main);
        }
        self.open_upvalues.clear();
        self.roots.clear();
        self.gc.clear_lists();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
