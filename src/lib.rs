//! # WEFT
//! Single-threaded cooperative multitasking without stack switching.
//!
//! This crate provides a minimal poll-driven runtime: resumable computations
//! ("frames") that suspend at explicit points, reference-counted tasks, a
//! FIFO scheduler with a deferred lane for cooperative yields, and a
//! hierarchical timing wheel backing sleeps and timeouts.
//!
//! ## Architectural principles
//! * **No preemption:** a suspension point is the only place control returns
//!   to the scheduler; exactly one frame executes at a time.
//! * **Explicit frames:** every local that survives a suspension lives in the
//!   frame struct, never on a transient call stack.
//! * **Starvation-free yields:** ready tasks always drain before any task
//!   that yielded in the current round runs again.
//! * **Bounded timers:** the wheel indexes deadlines up to a fixed horizon
//!   with O(1) amortized insert and removal.

mod clock;
mod frame;
mod join;
mod macros;
mod reactor;
mod runtime;
mod sleep;
mod task;
mod trace;
mod wheel;
mod yield_now;

pub use crate::{
    frame::{FnFrame, Frame, Poll},
    join::JoinHandle,
    runtime::{Cx, Runtime, SpawnError},
    sleep::Sleep,
    trace::{BufferTracer, LogTracer, Tracer},
    yield_now::YieldNow,
};
