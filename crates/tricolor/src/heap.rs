//! The object arena.
//!
//! Objects are stored in generation-checked slots and addressed by
//! [`ObjRef`]. A freed slot goes on a free list and is reused with a bumped
//! generation, so stale handles are detected instead of aliasing a new object.
//!
//! Besides storage the heap owns the two sweepable lists (general objects and
//! userdata) and the byte accounting that every allocation passes through.

use crate::alloc::Allocator;
use crate::object::{GcObject, ObjRef};

struct Slot {
    generation: u32,
    size: usize,
    object: Option<GcObject>,
}

/// Arena, sweep lists and byte accounting for one runtime.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Tables, functions, prototypes, threads and closed upvalues.
    pub(crate) objects: Vec<ObjRef>,
    /// Userdata, kept apart so they can be separated for finalization.
    pub(crate) udata: Vec<ObjRef>,
    allocator: Box<dyn Allocator>,
    total: usize,
    live: usize,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}

impl Heap {
    pub(crate) fn new(allocator: Box<dyn Allocator>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            objects: Vec::new(),
            udata: Vec::new(),
            allocator,
            total: 0,
            live: 0,
        }
    }

    /// Asks the allocator to move a block from `old` to `new` bytes and
    /// updates the running total if it agrees.
    pub(crate) fn charge(&mut self, old: usize, new: usize) -> bool {
        if !self.allocator.reallocate(old, new) {
            return false;
        }
        self.total = self.total - old.min(self.total) + new;
        true
    }

    /// Returns bytes to the allocator. Never refused.
    pub(crate) fn release(&mut self, size: usize) {
        if size > 0 {
            let accepted = self.charge(size, 0);
            debug_assert!(accepted, "allocator refused a free");
        }
    }

    /// Stores an object whose `size` bytes have already been charged.
    pub(crate) fn insert(&mut self, object: GcObject, size: usize) -> ObjRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.size = size;
            slot.object = Some(object);
            return ObjRef::new(index, slot.generation);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or_else(|_| panic!("object arena full"));
        self.slots.push(Slot {
            generation: 0,
            size,
            object: Some(object),
        });
        ObjRef::new(index, 0)
    }

    /// Takes an object out of the arena and returns its bytes.
    ///
    /// # Panics
    ///
    /// Panics if `r` is dangling.
    pub(crate) fn remove(&mut self, r: ObjRef) -> GcObject {
        let slot = self.slot_mut(r);
        let size = slot.size;
        let object = slot.object.take().unwrap_or_else(|| dangling(r));
        slot.generation = slot.generation.wrapping_add(1);
        slot.size = 0;
        #[allow(clippy::cast_possible_truncation)]
        self.free.push(r.index() as u32);
        self.live -= 1;
        self.release(size);
        object
    }

    fn slot(&self, r: ObjRef) -> Option<&Slot> {
        self.slots
            .get(r.index())
            .filter(|s| s.generation == r.generation() && s.object.is_some())
    }

    fn slot_mut(&mut self, r: ObjRef) -> &mut Slot {
        match self.slots.get_mut(r.index()) {
            Some(s) if s.generation == r.generation() && s.object.is_some() => s,
            _ => dangling(r),
        }
    }

    /// The object behind `r`, or `None` if it has been freed.
    #[must_use]
    pub fn get(&self, r: ObjRef) -> Option<&GcObject> {
        self.slot(r).and_then(|s| s.object.as_ref())
    }

    /// Whether `r` still names a live slot.
    #[must_use]
    pub fn contains(&self, r: ObjRef) -> bool {
        self.slot(r).is_some()
    }

    /// # Panics
    ///
    /// Panics if `r` is dangling.
    #[must_use]
    pub fn obj(&self, r: ObjRef) -> &GcObject {
        self.get(r).unwrap_or_else(|| dangling(r))
    }

    pub(crate) fn obj_mut(&mut self, r: ObjRef) -> &mut GcObject {
        match self.slot_mut(r).object.as_mut() {
            Some(o) => o,
            None => dangling(r),
        }
    }

    /// Bytes currently charged for `r`.
    #[must_use]
    pub fn size_of(&self, r: ObjRef) -> usize {
        self.slot(r).map_or(0, |s| s.size)
    }

    /// Gives back the bytes `r` no longer needs.
    pub(crate) fn shrink_to(&mut self, r: ObjRef, size: usize) {
        let old = self.size_of(r);
        if size < old {
            let accepted = self.charge(old, size);
            debug_assert!(accepted, "allocator refused a shrink");
            self.set_size(r, size);
        }
    }

    /// Records a new size for `r` whose difference was already charged.
    pub(crate) fn set_size(&mut self, r: ObjRef, size: usize) {
        self.slot_mut(r).size = size;
    }

    /// Total bytes charged through the allocator.
    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.total
    }

    /// Number of objects in the arena, strings included.
    #[must_use]
    pub const fn object_count(&self) -> usize {
        self.live
    }

    /// Every live object.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &GcObject)> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            #[allow(clippy::cast_possible_truncation)]
            s.object
                .as_ref()
                .map(|o| (ObjRef::new(i as u32, s.generation), o))
        })
    }
}

#[cold]
fn dangling(r: ObjRef) -> ! {
    panic!("dangling object handle {r:?}")
}
