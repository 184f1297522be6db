// src/trace.rs
use std::{cell::RefCell, rc::Rc};

/// Scheduler observation hooks. Every method defaults to a no-op; install an
/// implementation with [`Runtime::set_tracer`](crate::Runtime::set_tracer).
pub trait Tracer {
    fn on_spawn(&mut self, _id: u64) {}
    fn on_spawn_rejected(&mut self) {}

    fn on_poll_begin(&mut self, _id: u64) {}
    fn on_poll_end(&mut self, _id: u64, _ready: bool) {}

    fn on_wake(&mut self, _id: u64) {}
    fn on_defer(&mut self, _id: u64) {}
    fn on_finish(&mut self, _id: u64) {}

    fn on_timer_insert(&mut self, _id: u64, _deadline: u64) {}
    fn on_timers_fired(&mut self, _count: usize) {}
    fn on_park(&mut self, _timeout_ms: Option<u64>) {}
}

/// Prints every event to stderr.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_spawn(&mut self, id: u64) {
        eprintln!("[spawn] {id}");
    }
    fn on_spawn_rejected(&mut self) {
        eprintln!("[spawn] rejected: out of memory");
    }
    fn on_poll_begin(&mut self, id: u64) {
        eprintln!("[poll+] {id}");
    }
    fn on_poll_end(&mut self, id: u64, ready: bool) {
        eprintln!("[poll-] {id} ready={ready}");
    }
    fn on_wake(&mut self, id: u64) {
        eprintln!("[wake] {id}");
    }
    fn on_defer(&mut self, id: u64) {
        eprintln!("[defer] {id}");
    }
    fn on_finish(&mut self, id: u64) {
        eprintln!("[done] {id}");
    }
    fn on_timer_insert(&mut self, id: u64, deadline: u64) {
        eprintln!("[timer] task {id} deadline {deadline}");
    }
    fn on_timers_fired(&mut self, count: usize) {
        eprintln!("[timers] fired {count}");
    }
    fn on_park(&mut self, timeout_ms: Option<u64>) {
        eprintln!("[park] timeout {timeout_ms:?}");
    }
}

/// Stores trace lines in memory instead of printing; used by tests to assert
/// on scheduling order. The line buffer is shared, so a handle kept outside
/// the runtime still sees everything recorded after installation.
pub struct BufferTracer {
    lines: Rc<RefCell<Vec<String>>>,
}

impl BufferTracer {
    pub fn new() -> Self {
        Self {
            lines: Rc::new(RefCell::new(Vec::new())),
        }
    }

    fn push(&mut self, line: impl Into<String>) {
        self.lines.borrow_mut().push(line.into());
    }

    /// A second view onto the same line buffer.
    pub fn handle(&self) -> BufferTracer {
        BufferTracer {
            lines: Rc::clone(&self.lines),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }
}

impl Default for BufferTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for BufferTracer {
    fn on_spawn(&mut self, id: u64) {
        self.push(format!("[spawn] {id}"));
    }
    fn on_spawn_rejected(&mut self) {
        self.push("[spawn] rejected");
    }
    fn on_poll_begin(&mut self, id: u64) {
        self.push(format!("[poll] {id}"));
    }
    fn on_wake(&mut self, id: u64) {
        self.push(format!("[wake] {id}"));
    }
    fn on_defer(&mut self, id: u64) {
        self.push(format!("[defer] {id}"));
    }
    fn on_finish(&mut self, id: u64) {
        self.push(format!("[done] {id}"));
    }
    fn on_timer_insert(&mut self, id: u64, deadline: u64) {
        self.push(format!("[timer] {id} {deadline}"));
    }
    fn on_timers_fired(&mut self, count: usize) {
        self.push(format!("[timers] {count}"));
    }
}
