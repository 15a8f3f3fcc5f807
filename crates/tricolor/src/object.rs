//! Collectable object representation.
//!
//! Objects live in the runtime's arena and are addressed by [`ObjRef`]
//! handles. Every object has a [`GcHeader`] (type tag + mark byte) and a body
//! drawn from the closed set of collectable kinds in [`ObjectBody`].
//!
//! Downcasts are tag-checked. Asking for the wrong kind is a contract
//! violation by the caller and panics.

use std::mem::size_of;

use crate::color::{Marked, White};
use crate::error::GcError;
use crate::table::Table;
use crate::thread::Thread;
use crate::value::{TypeTag, Value};
use crate::Runtime;

/// Stable handle to a collectable object.
///
/// The generation guards against use of a handle after its slot has been
/// reclaimed and reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    /// Slot generation this handle was issued for.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

/// Header common to every collectable kind.
#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    /// The kind's own type tag; always equal to the body's kind.
    pub tag: TypeTag,
    /// Packed color and fixed bits. Only touched through the color protocol.
    pub marked: Marked,
}

/// An interned, immutable byte string.
#[derive(Debug, Clone)]
pub struct LuaString {
    bytes: Box<[u8]>,
    hash: u32,
    /// Reserved-word index used by the lexer; zero for ordinary strings.
    pub reserved: u8,
}

impl LuaString {
    pub(crate) fn new(bytes: &[u8], hash: u32) -> Self {
        Self {
            bytes: bytes.into(),
            hash,
            reserved: 0,
        }
    }

    /// Content bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the string has no bytes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Hash computed at interning time.
    #[inline]
    #[must_use]
    pub const fn hash(&self) -> u32 {
        self.hash
    }
}

/// A length-tagged host blob.
#[derive(Debug, Clone)]
pub struct Userdata {
    /// Raw payload bytes.
    pub data: Box<[u8]>,
    /// Metatable; a `__gc` entry makes the userdata finalizable.
    pub metatable: Option<ObjRef>,
    /// Environment table.
    pub env: Option<ObjRef>,
    /// Set once the userdata has been considered for finalization, so that
    /// its finalizer can run at most once.
    pub(crate) finalized: bool,
}

impl Userdata {
    /// Whether the userdata was already considered for finalization.
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        self.finalized
    }
}

/// Host function signature for native closures.
///
/// The second argument is the calling thread.
pub type NativeFn = fn(&mut Runtime, ObjRef) -> Result<usize, GcError>;

/// A closure over a host function.
#[derive(Debug, Clone)]
pub struct NativeClosure {
    /// Function called when the closure is invoked.
    pub func: NativeFn,
    /// Upvalues are stored inline as values.
    pub upvalues: Vec<Value>,
    /// Environment table.
    pub env: Option<ObjRef>,
}

/// A closure over a compiled prototype.
#[derive(Debug, Clone)]
pub struct ScriptClosure {
    /// Prototype this closure instantiates.
    pub proto: ObjRef,
    /// Shared upvalue objects; `None` until the interpreter fills the slot.
    pub upvalues: Vec<Option<ObjRef>>,
    /// Environment table; globals are resolved through it.
    pub env: Option<ObjRef>,
}

/// Either flavor of function object.
#[derive(Debug, Clone)]
pub enum Closure {
    /// Host function.
    Native(NativeClosure),
    /// Compiled function.
    Script(ScriptClosure),
}

impl Closure {
    /// Environment table of the closure.
    #[must_use]
    pub const fn env(&self) -> Option<ObjRef> {
        match self {
            Self::Native(c) => c.env,
            Self::Script(c) => c.env,
        }
    }

    /// Whether this is a host function.
    #[must_use]
    pub const fn is_native(&self) -> bool {
        matches!(self, Self::Native(_))
    }
}

/// Debug information for a local variable.
#[derive(Debug, Clone, Copy)]
pub struct LocalVar {
    /// Variable name, an interned string.
    pub name: ObjRef,
    /// First instruction where the variable is active.
    pub start_pc: u32,
    /// First instruction where it is dead.
    pub end_pc: u32,
}

/// A compiled function template.
#[derive(Debug, Clone, Default)]
pub struct Proto {
    /// Constant pool.
    pub constants: Vec<Value>,
    /// Encoded instructions.
    pub code: Vec<u32>,
    /// Nested function prototypes.
    pub protos: Vec<ObjRef>,
    /// Source line of each instruction.
    pub line_info: Vec<u32>,
    /// Local variable debug information.
    pub locals: Vec<LocalVar>,
    /// Upvalue names, interned strings.
    pub upvalue_names: Vec<ObjRef>,
    /// Chunk name.
    pub source: Option<ObjRef>,
    /// Line where the function starts.
    pub line_defined: u32,
    /// Line where the function ends.
    pub last_line_defined: u32,
    /// Number of upvalues the function captures.
    pub num_upvalues: u8,
    /// Number of fixed parameters.
    pub num_params: u8,
    /// Vararg flags.
    pub is_vararg: u8,
    /// Registers the function needs.
    pub max_stack_size: u8,
}

/// Where an upvalue's current value lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    /// Aliases a live stack slot of `thread`.
    Open {
        /// Thread owning the stack.
        thread: ObjRef,
        /// Stack slot index.
        level: usize,
    },
    /// Owns its own copy of the value.
    Closed(Value),
}

/// A captured variable.
#[derive(Debug, Clone, Copy)]
pub struct Upvalue {
    /// Open or closed.
    pub state: UpvalueState,
}

impl Upvalue {
    /// Whether the upvalue still aliases a stack slot.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.state, UpvalueState::Open { .. })
    }
}

/// The closed set of collectable kinds.
#[derive(Debug)]
pub enum ObjectBody {
    String(LuaString),
    Table(Table),
    Function(Closure),
    Userdata(Userdata),
    Thread(Thread),
    Proto(Proto),
    Upvalue(Upvalue),
}

impl ObjectBody {
    /// The type tag matching this body.
    #[must_use]
    pub const fn tag(&self) -> TypeTag {
        match self {
            Self::String(_) => TypeTag::String,
            Self::Table(_) => TypeTag::Table,
            Self::Function(_) => TypeTag::Function,
            Self::Userdata(_) => TypeTag::Userdata,
            Self::Thread(_) => TypeTag::Thread,
            Self::Proto(_) => TypeTag::Proto,
            Self::Upvalue(_) => TypeTag::Upvalue,
        }
    }

    /// Estimated bytes charged to the allocator for this object.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        let dynamic = match self {
            Self::String(s) => s.len() + 1,
            Self::Table(t) => t.byte_size(),
            Self::Function(Closure::Native(c)) => c.upvalues.len() * size_of::<Value>(),
            Self::Function(Closure::Script(c)) => c.upvalues.len() * size_of::<Option<ObjRef>>(),
            Self::Userdata(u) => u.data.len(),
            Self::Thread(th) => th.byte_size(),
            Self::Proto(p) => {
                p.constants.len() * size_of::<Value>()
                    + p.code.len() * size_of::<u32>()
                    + p.protos.len() * size_of::<ObjRef>()
                    + p.line_info.len() * size_of::<u32>()
                    + p.locals.len() * size_of::<LocalVar>()
                    + p.upvalue_names.len() * size_of::<ObjRef>()
            }
            Self::Upvalue(_) => 0,
        };
        size_of::<GcObject>() + dynamic
    }
}

/// A collectable object: header plus body.
#[derive(Debug)]
pub struct GcObject {
    /// Kind tag and mark bits.
    pub header: GcHeader,
    /// Kind-specific payload.
    pub body: ObjectBody,
}

fn kind_mismatch(expected: TypeTag, found: TypeTag) -> ! {
    panic!("object kind mismatch: expected {expected}, found {found}")
}

macro_rules! downcasts {
    ($($variant:ident => $ty:ty, $get:ident, $get_mut:ident;)*) => {
        impl GcObject {
            $(
                /// Tag-checked downcast.
                ///
                /// # Panics
                ///
                /// Panics if the object is of a different kind.
                #[must_use]
                pub fn $get(&self) -> &$ty {
                    match &self.body {
                        ObjectBody::$variant(inner) => inner,
                        other => kind_mismatch(TypeTag::$variant, other.tag()),
                    }
                }

                /// Tag-checked mutable downcast.
                ///
                /// # Panics
                ///
                /// Panics if the object is of a different kind.
                pub fn $get_mut(&mut self) -> &mut $ty {
                    match &mut self.body {
                        ObjectBody::$variant(inner) => inner,
                        other => kind_mismatch(TypeTag::$variant, other.tag()),
                    }
                }
            )*
        }
    };
}

downcasts! {
    String => LuaString, as_string, as_string_mut;
    Table => Table, as_table, as_table_mut;
    Function => Closure, as_closure, as_closure_mut;
    Userdata => Userdata, as_userdata, as_userdata_mut;
    Thread => Thread, as_thread, as_thread_mut;
    Proto => Proto, as_proto, as_proto_mut;
    Upvalue => Upvalue, as_upvalue, as_upvalue_mut;
}

impl GcObject {
    /// Wraps `body` in a header colored with the current white.
    #[must_use]
    pub fn new(body: ObjectBody, white: White) -> Self {
        Self {
            header: GcHeader {
                tag: body.tag(),
                marked: Marked::new(white),
            },
            body,
        }
    }

    /// Kind of the object.
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> TypeTag {
        self.header.tag
    }

    /// Current mark bits.
    #[inline]
    #[must_use]
    pub const fn marked(&self) -> Marked {
        self.header.marked
    }

    #[inline]
    pub(crate) fn marked_mut(&mut self) -> &mut Marked {
        &mut self.header.marked
    }
}
