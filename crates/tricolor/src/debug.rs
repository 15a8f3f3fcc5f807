//! Heap consistency checks.
//!
//! [`Runtime::verify_invariants`] walks every object in the arena and checks
//! the properties the collector relies on. It is meant for tests and for
//! hosts chasing a missing barrier; it allocates and is linear in the heap.

use thiserror::Error;

use crate::gc::GcPhase;
use crate::object::{Closure, ObjRef, ObjectBody, UpvalueState};
use crate::value::{TypeTag, Value};
use crate::Runtime;

/// A broken heap invariant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// A stored value's tag disagrees with the object it references.
    #[error("{holder:?} holds a {stored} value pointing at a {actual} object")]
    TagMismatch {
        /// Object holding the value.
        holder: ObjRef,
        /// Tag the value was stored under.
        stored: TypeTag,
        /// Tag of the referenced object.
        actual: TypeTag,
    },
    /// A stored reference names a freed object.
    #[error("{holder:?} references freed object {target:?}")]
    Dangling {
        /// Object holding the reference.
        holder: ObjRef,
        /// The freed handle.
        target: ObjRef,
    },
    /// A black object references an object marked for collection.
    #[error("black {holder:?} references dead {target:?}")]
    BlackToDead {
        /// Black object holding the reference.
        holder: ObjRef,
        /// Object carrying the other white.
        target: ObjRef,
    },
    /// During propagation, a black object references a white one.
    #[error("black {holder:?} references white {target:?} during propagation")]
    BlackToWhite {
        /// Black object holding the reference.
        holder: ObjRef,
        /// Unreached object.
        target: ObjRef,
    },
}

/// An outgoing reference: the tag it was stored under (if it was stored as a
/// value) and the target.
type Edge = (Option<TypeTag>, ObjRef);

fn edges(body: &ObjectBody) -> Vec<Edge> {
    let mut out = Vec::new();
    let mut value = |v: &Value| {
        if let Some(r) = v.as_object() {
            out.push((Some(v.type_tag()), r));
        }
    };
    match body {
        ObjectBody::String(_) => {}
        ObjectBody::Table(t) => {
            t.array().iter().for_each(&mut value);
            for node in t.nodes() {
                value(&node.key);
                value(&node.value);
            }
            out.extend(t.metatable.map(|m| (Some(TypeTag::Table), m)));
        }
        ObjectBody::Function(Closure::Native(c)) => {
            c.upvalues.iter().for_each(&mut value);
            out.extend(c.env.map(|e| (Some(TypeTag::Table), e)));
        }
        ObjectBody::Function(Closure::Script(c)) => {
            out.push((Some(TypeTag::Proto), c.proto));
            out.extend(c.upvalues.iter().flatten().map(|&u| (Some(TypeTag::Upvalue), u)));
            out.extend(c.env.map(|e| (Some(TypeTag::Table), e)));
        }
        ObjectBody::Userdata(u) => {
            out.extend(u.metatable.map(|m| (Some(TypeTag::Table), m)));
            out.extend(u.env.map(|e| (Some(TypeTag::Table), e)));
        }
        ObjectBody::Thread(th) => {
            th.stack().iter().for_each(&mut value);
            value(&th.globals);
        }
        ObjectBody::Proto(p) => {
            p.constants.iter().for_each(&mut value);
            out.extend(p.protos.iter().map(|&c| (Some(TypeTag::Proto), c)));
            out.extend(p.source.map(|s| (Some(TypeTag::String), s)));
            out.extend(p.upvalue_names.iter().map(|&n| (Some(TypeTag::String), n)));
            out.extend(p.locals.iter().map(|l| (Some(TypeTag::String), l.name)));
        }
        ObjectBody::Upvalue(uv) => match uv.state {
            UpvalueState::Closed(v) => value(&v),
            UpvalueState::Open { thread, .. } => out.push((Some(TypeTag::Thread), thread)),
        },
    }
    out
}

impl Runtime {
    /// Checks every live object:
    ///
    /// - every stored reference points at a live object of the stored kind
    /// - no black object references a dead one
    /// - while propagating, no black object references a white one
    ///
    /// Objects already dead are skipped: they are garbage waiting for the
    /// sweep. Weak tables are exempt from the color checks until their
    /// entries are cleared.
    ///
    /// # Errors
    ///
    /// The first violation found.
    pub fn verify_invariants(&self) -> Result<(), InvariantViolation> {
        let white = self.gc.current_white;
        let propagating = self.gc.phase == GcPhase::Propagate;
        for (holder, obj) in self.heap.iter() {
            let marked = obj.marked();
            if marked.is_dead(white) {
                continue;
            }
            let weak = obj.tag() == TypeTag::Table && obj.as_table().weak_mode().is_weak();
            for (stored, target) in edges(&obj.body) {
                let Some(t) = self.heap.get(target) else {
                    return Err(InvariantViolation::Dangling { holder, target });
                };
                if let Some(stored) = stored {
                    if stored != t.tag() {
                        return Err(InvariantViolation::TagMismatch {
                            holder,
                            stored,
                            actual: t.tag(),
                        });
                    }
                }
                if !marked.is_black() || weak {
                    continue;
                }
                let tm = t.marked();
                if tm.is_dead(white) && !tm.is_fixed() {
                    return Err(InvariantViolation::BlackToDead { holder, target });
                }
                if propagating && tm.is_white() {
                    return Err(InvariantViolation::BlackToWhite { holder, target });
                }
            }
        }
        Ok(())
    }
}
