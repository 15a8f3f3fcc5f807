//! Table objects as seen by the collector.
//!
//! A table is an array segment (integer keys `1..=n`) plus a hash segment of
//! key/value nodes. Indexing here is deliberately simple: the collector only
//! needs to traverse both segments, drop entries during weak clearing, and give
//! the barriered setters a raw store. Lookups in the hash segment are linear.

use std::mem::size_of;

use crate::error::GcError;
use crate::object::ObjRef;
use crate::value::Value;

/// Which references of a table do not keep their referents alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeakMode {
    /// Keys are weak.
    pub keys: bool,
    /// Values are weak.
    pub values: bool,
}

impl WeakMode {
    /// Strong keys and strong values.
    pub const STRONG: Self = Self {
        keys: false,
        values: false,
    };

    /// Parses a `__mode` string: `k` makes keys weak, `v` makes values weak.
    #[must_use]
    pub fn from_mode(mode: &[u8]) -> Self {
        Self {
            keys: mode.contains(&b'k'),
            values: mode.contains(&b'v'),
        }
    }

    /// Whether either side is weak.
    #[inline]
    #[must_use]
    pub const fn is_weak(self) -> bool {
        self.keys || self.values
    }
}

/// One entry of the hash segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Node {
    /// Entry key; never nil.
    pub key: Value,
    /// Entry value.
    pub value: Value,
}

/// An array + hash container.
#[derive(Debug, Default)]
pub struct Table {
    array: Vec<Value>,
    nodes: Vec<Node>,
    /// Metatable, if any.
    pub metatable: Option<ObjRef>,
    /// Bit `i` set means tag method `i` is known to be absent from this table
    /// when it is used as a metatable.
    pub(crate) tm_absent: u8,
    /// Weak mode observed during the last traversal.
    pub(crate) weak: WeakMode,
}

/// Where a raw store will land, used to price growth before mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Array(usize),
    Append,
    Node(usize),
    NewNode,
    Absent,
}

impl Table {
    /// An empty table without a metatable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Values of the array segment, index 0 holding key `1`.
    #[must_use]
    pub fn array(&self) -> &[Value] {
        &self.array
    }

    /// Entries of the hash segment.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of non-nil entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count() + self.nodes.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Weak mode recorded by the collector's last traversal.
    #[must_use]
    pub const fn weak_mode(&self) -> WeakMode {
        self.weak
    }

    /// Bytes owned by the two segments.
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.array.len() * size_of::<Value>() + self.nodes.len() * size_of::<Node>()
    }

    fn array_index(key: &Value) -> Option<usize> {
        match *key {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            Value::Number(n) if n >= 1.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => {
                Some(n as usize - 1)
            }
            _ => None,
        }
    }

    /// Raw read; absent keys read as nil.
    #[must_use]
    pub fn get(&self, key: &Value) -> Value {
        match self.locate(key) {
            Slot::Array(i) => self.array[i],
            Slot::Node(i) => self.nodes[i].value,
            Slot::Append | Slot::NewNode | Slot::Absent => Value::Nil,
        }
    }

    /// Raw read with an integer key.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_int(&self, key: i64) -> Value {
        self.get(&Value::Number(key as f64))
    }

    /// Raw read with an interned string key.
    #[must_use]
    pub fn get_str(&self, key: ObjRef) -> Value {
        self.get(&Value::String(key))
    }

    pub(crate) fn locate(&self, key: &Value) -> Slot {
        if let Some(i) = Self::array_index(key) {
            if i < self.array.len() {
                return Slot::Array(i);
            }
            if i == self.array.len() {
                return match self.find_node(key) {
                    Some(n) => Slot::Node(n),
                    None => Slot::Append,
                };
            }
        }
        match self.find_node(key) {
            Some(n) => Slot::Node(n),
            None if key.is_nil() => Slot::Absent,
            None => Slot::NewNode,
        }
    }

    fn find_node(&self, key: &Value) -> Option<usize> {
        self.nodes.iter().position(|n| n.key.raw_eq(key))
    }

    /// Bytes a raw store of `value` under `key` would add.
    pub(crate) fn growth_for(&self, key: &Value, value: &Value) -> usize {
        if value.is_nil() {
            return 0;
        }
        match self.locate(key) {
            Slot::Append => size_of::<Value>(),
            Slot::NewNode => size_of::<Node>(),
            Slot::Array(_) | Slot::Node(_) | Slot::Absent => 0,
        }
    }

    /// Rejects keys no table can hold.
    pub(crate) fn check_key(key: &Value) -> Result<(), GcError> {
        match *key {
            Value::Nil => Err(GcError::Runtime("table index is nil".into())),
            Value::Number(n) if n.is_nan() => Err(GcError::Runtime("table index is NaN".into())),
            _ => Ok(()),
        }
    }

    /// Raw store without barrier. Storing nil removes the entry.
    ///
    /// Invalidates the absent-tag-method cache.
    pub(crate) fn raw_set(&mut self, key: Value, value: Value) -> Result<(), GcError> {
        Self::check_key(&key)?;
        self.tm_absent = 0;
        match self.locate(&key) {
            Slot::Array(i) => {
                self.array[i] = value;
                if value.is_nil() {
                    self.trim_array();
                }
            }
            Slot::Append => {
                if !value.is_nil() {
                    self.array.push(value);
                    self.migrate_nodes();
                }
            }
            Slot::Node(i) => {
                if value.is_nil() {
                    self.nodes.swap_remove(i);
                } else {
                    self.nodes[i].value = value;
                }
            }
            Slot::NewNode => {
                if !value.is_nil() {
                    self.nodes.push(Node { key, value });
                }
            }
            Slot::Absent => {}
        }
        Ok(())
    }

    fn trim_array(&mut self) {
        while self.array.last().is_some_and(Value::is_nil) {
            self.array.pop();
        }
    }

    /// Moves hash entries that continue the array segment into it.
    fn migrate_nodes(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        while let Some(i) = self.find_node(&Value::Number((self.array.len() + 1) as f64)) {
            let node = self.nodes.swap_remove(i);
            self.array.push(node.value);
        }
    }

    pub(crate) fn array_mut(&mut self) -> &mut [Value] {
        &mut self.array
    }

    pub(crate) fn remove_node(&mut self, i: usize) -> Node {
        self.nodes.swap_remove(i)
    }

    pub(crate) fn shrink_after_clear(&mut self) {
        self.trim_array();
    }
}
