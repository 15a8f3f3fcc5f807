//! An incremental tri-color garbage collector for a dynamic language runtime.
//!
//! `tricolor` manages the heap of a small dynamically-typed language: tagged
//! [`Value`]s, the collectable object kinds they reference (strings, tables,
//! closures, userdata, threads, plus internal prototypes and upvalues), and
//! the intern table that makes every string unique by content.
//!
//! # Features
//!
//! - **Incremental collection**: work is interleaved with the mutator in
//!   steps whose size follows the allocation rate
//! - **Write barriers**: every barriered setter keeps the tri-color invariant
//!   while a cycle is in progress
//! - **Weak tables** driven by a metatable's `__mode` field
//! - **Finalizers**: userdata with a `__gc` metamethod are finalized exactly
//!   once, after they become unreachable
//! - **Pluggable allocator**: every byte is admitted by an [`Allocator`], and a
//!   refused request triggers one emergency full collection
//!
//! # Quick Start
//!
//! ```
//! use tricolor::{GcConfig, Runtime, Value};
//!
//! let mut rt = Runtime::new(GcConfig::default());
//! let t = rt.new_table()?;
//! let key = rt.intern_str("answer")?;
//! rt.table_set(t, Value::String(key), Value::Number(42.0))?;
//!
//! // Only reachable objects survive a collection.
//! rt.pin(Value::Table(t));
//! let garbage = rt.new_table()?;
//! rt.full_collect()?;
//! assert!(rt.is_alive(t));
//! assert!(!rt.is_alive(garbage));
//! # Ok::<(), tricolor::GcError>(())
//! ```
//!
//! # Handles
//!
//! Objects are addressed by [`ObjRef`] handles into the runtime's arena. A
//! handle does not keep its object alive: an object survives a collection
//! only if it is reachable from the main thread, the registry, a per-type
//! metatable, or a pinned root. Using a handle after its object was freed
//! panics.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod alloc;
mod barrier;
pub mod color;
pub mod debug;
pub mod error;
mod gc;
pub mod heap;
pub mod metrics;
pub mod object;
pub mod roots;
mod state;
pub mod string;
pub mod table;
pub mod thread;
pub mod tracing;
pub mod value;

pub use alloc::{AllocStats, Allocator, CountingAllocator, LimitAllocator, SystemAllocator};
pub use color::Color;
pub use debug::InvariantViolation;
pub use error::GcError;
pub use gc::{
    FinalizerInvoker, GcConfig, GcPhase, DEFAULT_PAUSE, DEFAULT_STEP_MULTIPLIER,
    GC_FINALIZE_COST, GC_STEP_SIZE, GC_SWEEP_COST, GC_SWEEP_MAX,
};
pub use metrics::{CollectionType, GcMetrics};
pub use object::{Closure, LocalVar, ObjRef, Proto, UpvalueState};
pub use state::{PanicHandler, Runtime, TagMethod};
pub use thread::CallFrame;
pub use value::{LightPtr, TypeTag, Value};
