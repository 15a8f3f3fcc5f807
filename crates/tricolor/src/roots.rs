//! Host-pinned roots.
//!
//! Besides the main thread, the registry and the per-type metatables, a host
//! can pin any collectable value so it survives collection while it is held
//! outside the object graph. Frames allow the runtime to pin operands
//! temporarily, for instance around an emergency collection.
//!
//! Pins are kept as object handles so internal kinds such as prototypes can
//! be anchored while they are being built.

use crate::object::ObjRef;
use crate::value::Value;

/// A stack of pinned objects with scope markers.
#[derive(Debug, Default)]
pub struct RootStack {
    roots: Vec<ObjRef>,
    frame_markers: Vec<usize>,
}

impl RootStack {
    /// An empty root set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Pins a value; non-collectable values are ignored. Pinning twice
    /// needs two unpins.
    pub fn push(&mut self, value: Value) {
        if let Some(r) = value.as_object() {
            self.roots.push(r);
        }
    }

    /// Pins an object directly.
    pub fn push_object(&mut self, r: ObjRef) {
        self.roots.push(r);
    }

    /// Removes one pin of `value`. Returns `false` if it was not pinned.
    pub fn pop(&mut self, value: Value) -> bool {
        value.as_object().is_some_and(|r| self.pop_object(r))
    }

    /// Removes the most recent pin of `r`.
    pub fn pop_object(&mut self, r: ObjRef) -> bool {
        match self.roots.iter().rposition(|&p| p == r) {
            Some(pos) => {
                self.roots.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of pins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether nothing is pinned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub(crate) fn as_slice(&self) -> &[ObjRef] {
        &self.roots
    }

    /// Pinned objects, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.roots.iter().copied()
    }

    pub(crate) fn push_frame(&mut self) {
        self.frame_markers.push(self.roots.len());
    }

    /// Drops every root pinned since the matching `push_frame`.
    pub(crate) fn pop_frame(&mut self) {
        if let Some(marker) = self.frame_markers.pop() {
            self.roots.truncate(marker);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.roots.clear();
        self.frame_markers.clear();
    }
}
