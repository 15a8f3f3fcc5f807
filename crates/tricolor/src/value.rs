//! Tagged values.
//!
//! A [`Value`] holds exactly one of nil, a boolean, a number, a light
//! (non-owned) host pointer, or a reference to a collectable object. The
//! discriminant of a collectable value doubles as its type tag, and that tag
//! must always agree with the tag stored in the referenced object's header.

use std::fmt;

use crate::object::ObjRef;

/// Type tags for every value and every collectable kind.
///
/// The order matters: every tag from [`TypeTag::String`] upwards names a
/// collectable kind. [`TypeTag::Proto`] and [`TypeTag::Upvalue`] are internal
/// kinds that never appear inside a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TypeTag {
    /// Absence of a value.
    Nil = 0,
    /// `true` / `false`.
    Boolean = 1,
    /// A host pointer that the collector neither owns nor traces.
    LightUserdata = 2,
    /// A double-precision number.
    Number = 3,
    /// An interned, immutable byte string.
    String = 4,
    /// An array + hash container.
    Table = 5,
    /// A native or scripted closure.
    Function = 6,
    /// A host-owned blob with optional metatable and environment.
    Userdata = 7,
    /// An execution thread (coroutine).
    Thread = 8,
    /// A compiled function template.
    Proto = 9,
    /// A captured variable, open or closed.
    Upvalue = 10,
}

/// Number of basic (user-visible) type tags, `Nil` through `Thread`.
pub const NUM_BASIC_TAGS: usize = TypeTag::Thread as usize + 1;

impl TypeTag {
    /// Returns `true` for tags of heap-managed objects.
    #[inline]
    #[must_use]
    pub fn is_collectable(self) -> bool {
        self >= Self::String
    }

    /// The name used by the runtime when reporting this type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Boolean => "boolean",
            Self::LightUserdata | Self::Userdata => "userdata",
            Self::Number => "number",
            Self::String => "string",
            Self::Table => "table",
            Self::Function => "function",
            Self::Thread => "thread",
            Self::Proto => "proto",
            Self::Upvalue => "upval",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An opaque, non-owned host pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightPtr(pub usize);

impl LightPtr {
    /// Wraps a raw pointer without taking ownership.
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// The address this light pointer carries.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// A tagged value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Value {
    /// `nil`.
    #[default]
    Nil,
    /// A boolean.
    Boolean(bool),
    /// A light host pointer.
    LightUserdata(LightPtr),
    /// A number.
    Number(f64),
    /// Reference to an interned string.
    String(ObjRef),
    /// Reference to a table.
    Table(ObjRef),
    /// Reference to a closure.
    Function(ObjRef),
    /// Reference to a full userdata.
    Userdata(ObjRef),
    /// Reference to a thread.
    Thread(ObjRef),
}

impl Value {
    /// Builds a collectable value from a tag and an object reference,
    /// writing payload and discriminant together.
    ///
    /// # Panics
    ///
    /// Panics if `tag` does not name a user-visible collectable kind.
    #[must_use]
    pub fn from_object(tag: TypeTag, obj: ObjRef) -> Self {
        match tag {
            TypeTag::String => Self::String(obj),
            TypeTag::Table => Self::Table(obj),
            TypeTag::Function => Self::Function(obj),
            TypeTag::Userdata => Self::Userdata(obj),
            TypeTag::Thread => Self::Thread(obj),
            other => panic!("{other} objects cannot be stored in a value"),
        }
    }

    /// The type tag of this value.
    #[inline]
    #[must_use]
    pub const fn type_tag(&self) -> TypeTag {
        match self {
            Self::Nil => TypeTag::Nil,
            Self::Boolean(_) => TypeTag::Boolean,
            Self::LightUserdata(_) => TypeTag::LightUserdata,
            Self::Number(_) => TypeTag::Number,
            Self::String(_) => TypeTag::String,
            Self::Table(_) => TypeTag::Table,
            Self::Function(_) => TypeTag::Function,
            Self::Userdata(_) => TypeTag::Userdata,
            Self::Thread(_) => TypeTag::Thread,
        }
    }

    /// Returns `true` if this value references a heap object.
    #[inline]
    #[must_use]
    pub const fn is_collectable(&self) -> bool {
        self.as_object().is_some()
    }

    /// The referenced object, if the value is collectable.
    #[inline]
    #[must_use]
    pub const fn as_object(&self) -> Option<ObjRef> {
        match *self {
            Self::String(r)
            | Self::Table(r)
            | Self::Function(r)
            | Self::Userdata(r)
            | Self::Thread(r) => Some(r),
            _ => None,
        }
    }

    /// Returns `true` for `nil`.
    #[inline]
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Returns `true` for `nil` and `false`.
    #[inline]
    #[must_use]
    pub const fn is_falsy(&self) -> bool {
        matches!(self, Self::Nil | Self::Boolean(false))
    }

    /// Primitive equality: numbers by value, objects by identity.
    ///
    /// Because strings are interned, identity is content equality for them.
    #[must_use]
    pub fn raw_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<LightPtr> for Value {
    fn from(p: LightPtr) -> Self {
        Self::LightUserdata(p)
    }
}
