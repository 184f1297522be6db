// src/runtime.rs
use std::{collections::VecDeque, fmt, io, rc::Rc, time::Duration};

use crate::{
    clock::Clock,
    frame::{Frame, Poll},
    join::JoinHandle,
    reactor::Reactor,
    task::{Task, TaskRef},
    trace::Tracer,
    wheel::TimeWheel,
};

/// Default cap on concurrently live tasks; see [`Runtime::with_max_tasks`].
pub(crate) const DEFAULT_MAX_TASKS: usize = 1024;

/// The one recoverable failure: task creation when no capacity remains.
/// Everything else in the runtime is a contract violation and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    OutOfMemory,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::OutOfMemory => write!(f, "out of memory: task budget exhausted"),
        }
    }
}

impl std::error::Error for SpawnError {}

/// Single-threaded cooperative scheduler.
///
/// Owns the ready queue, the deferred queue for cooperative yields, the
/// timing wheel and the clock. All runtime state is reached through this one
/// object; there are no ambient globals.
pub struct Runtime {
    ready: VecDeque<TaskRef>,
    deferred: VecDeque<TaskRef>,
    wheel: TimeWheel,
    clock: Clock,
    reactor: Reactor,
    blocked: Option<TaskRef>,
    live_tasks: usize,
    max_tasks: usize,
    next_task_id: u64,
    tracer: Option<Box<dyn Tracer>>,
}

impl Runtime {
    pub fn new() -> io::Result<Self> {
        Self::with_max_tasks(DEFAULT_MAX_TASKS)
    }

    /// A runtime that refuses to hold more than `max_tasks` live tasks;
    /// `spawn` past the cap reports [`SpawnError::OutOfMemory`].
    pub fn with_max_tasks(max_tasks: usize) -> io::Result<Self> {
        Ok(Self {
            ready: VecDeque::new(),
            deferred: VecDeque::new(),
            wheel: TimeWheel::new(),
            clock: Clock::new(),
            reactor: Reactor::new()?,
            blocked: None,
            live_tasks: 0,
            max_tasks,
            next_task_id: 0,
            tracer: None,
        })
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracer = Some(tracer);
    }

    /// Registry for readiness sources; an event on any registered source
    /// interrupts the scheduler's idle wait.
    pub fn registry(&self) -> &mio::Registry {
        self.reactor.registry()
    }

    // ---------------- spawning ----------------

    fn new_task<F: Frame>(&mut self, frame: F) -> Result<TaskRef, SpawnError> {
        if self.live_tasks >= self.max_tasks {
            if let Some(t) = self.tracer.as_mut() {
                t.on_spawn_rejected();
            }
            return Err(SpawnError::OutOfMemory);
        }

        let id = self.next_task_id;
        self.next_task_id += 1;
        self.live_tasks += 1;

        let task = Task::new(id, frame);
        if let Some(t) = self.tracer.as_mut() {
            t.on_spawn(id);
        }
        Ok(task)
    }

    /// Enqueues a new task and returns a handle to its eventual output. On
    /// capacity exhaustion the handle records the error instead of a task;
    /// polling it yields the error immediately and the rest of the runtime
    /// is unaffected.
    pub fn spawn<F: Frame>(&mut self, frame: F) -> JoinHandle<F::Output> {
        match self.new_task(frame) {
            Ok(task) => {
                self.ready.push_back(task.clone());
                JoinHandle::new(task)
            }
            Err(err) => JoinHandle::failed(err),
        }
    }

    /// As `spawn`, but no handle: the output is discarded on completion and
    /// no consumer is ever registered.
    pub fn spawn_detached<F: Frame>(&mut self, frame: F) -> Result<(), SpawnError> {
        let task = self.new_task(frame)?;
        self.ready.push_back(task);
        Ok(())
    }

    // ---------------- driving ----------------

    /// Drives `frame` to completion and returns its output. The only
    /// blocking call exposed to a host program; cannot be nested.
    pub fn block_on<F: Frame>(&mut self, frame: F) -> F::Output {
        assert!(self.blocked.is_none(), "block_on cannot be nested");

        let root = match self.new_task(frame) {
            Ok(task) => task,
            Err(err) => panic!("failed to create the root task: {err}"),
        };
        self.blocked = Some(root.clone());

        loop {
            if root.is_runnable() {
                if self.poll_task(&root).is_ready() {
                    self.blocked = None;
                    let mut out: Option<F::Output> = None;
                    let copied = root.try_copy_output(&mut out);
                    debug_assert!(copied);
                    return out.expect("root task completed without an output");
                }
            }

            self.run_ready();
            self.run_deferred();
            self.wait_for_timers(&root);
        }
    }

    /// Polls every task that is ready this round, in FIFO order. Tasks
    /// spawned or woken while draining run within the same round.
    fn run_ready(&mut self) {
        while let Some(task) = self.ready.pop_front() {
            let _ = self.poll_task(&task);
        }
    }

    /// Requeues every task that yielded this round. Deferred tasks never run
    /// before the ready queue has drained, so yielding cannot starve a task
    /// that is genuinely ready.
    fn run_deferred(&mut self) {
        while let Some(task) = self.deferred.pop_front() {
            self.wake(task);
        }
    }

    /// Blocks until the wheel's next deadline elapses or an external
    /// readiness event arrives, then moves every newly fired timer's task
    /// onto the ready queue. Loops until some task is runnable.
    fn wait_for_timers(&mut self, root: &TaskRef) {
        while self.ready.is_empty() && !root.is_runnable() {
            let now = self.clock.now();
            match self.wheel.next_expiration() {
                Some(deadline) if now < deadline => {
                    let timeout = deadline - now;
                    if let Some(t) = self.tracer.as_mut() {
                        t.on_park(Some(timeout));
                    }
                    let _ = self.reactor.park(Some(Duration::from_millis(timeout)));
                }
                Some(_) => {}
                None => {
                    if let Some(t) = self.tracer.as_mut() {
                        t.on_park(None);
                    }
                    let _ = self.reactor.park(None);
                }
            }

            let now = self.clock.now();
            self.wheel.process_at(now);

            let mut fired = 0usize;
            while let Some(task) = self.wheel.next_pending_task() {
                fired += 1;
                self.wake(task);
            }
            if fired > 0 {
                if let Some(t) = self.tracer.as_mut() {
                    t.on_timers_fired(fired);
                }
            }
        }
    }

    fn poll_task(&mut self, task: &TaskRef) -> Poll<()> {
        let id = task.id();
        if let Some(t) = self.tracer.as_mut() {
            t.on_poll_begin(id);
        }

        let polled = {
            let mut cx = Cx {
                rt: self,
                current: task.clone(),
            };
            task.poll(&mut cx)
        };

        match polled {
            Poll::Pending => {
                if let Some(t) = self.tracer.as_mut() {
                    t.on_poll_end(id, false);
                }
                Poll::Pending
            }
            Poll::Ready(consumer) => {
                if let Some(t) = self.tracer.as_mut() {
                    t.on_poll_end(id, true);
                }
                self.live_tasks -= 1;
                if let Some(t) = self.tracer.as_mut() {
                    t.on_finish(id);
                }
                if let Some(consumer) = consumer {
                    self.wake(consumer);
                }
                Poll::Ready(())
            }
        }
    }

    // ---------------- wake/defer ----------------

    /// Idempotent: a task that is already runnable stays where it is. The
    /// blocked root task is never queued; the main loop polls it directly.
    pub(crate) fn wake(&mut self, task: TaskRef) {
        if task.is_runnable() {
            return;
        }
        task.make_runnable();
        if let Some(t) = self.tracer.as_mut() {
            t.on_wake(task.id());
        }

        let is_root = self
            .blocked
            .as_ref()
            .is_some_and(|blocked| Rc::ptr_eq(blocked, &task));
        if !is_root {
            self.ready.push_back(task);
        }
    }

    /// Removes the task from consideration this round; it runs again only
    /// after the current ready batch has drained.
    pub(crate) fn defer(&mut self, task: TaskRef) {
        if let Some(t) = self.tracer.as_mut() {
            t.on_defer(task.id());
        }
        self.deferred.push_back(task);
    }
}

/// Poll context: how a frame reaches the current task and the active
/// scheduler. Handed to every `poll` call; never stored.
pub struct Cx<'a> {
    rt: &'a mut Runtime,
    current: TaskRef,
}

impl<'a> Cx<'a> {
    /// Current instant in runtime ticks (milliseconds since init).
    #[inline]
    pub fn now(&self) -> u64 {
        self.rt.clock.now()
    }

    pub fn spawn<F: Frame>(&mut self, frame: F) -> JoinHandle<F::Output> {
        self.rt.spawn(frame)
    }

    pub fn spawn_detached<F: Frame>(&mut self, frame: F) -> Result<(), SpawnError> {
        self.rt.spawn_detached(frame)
    }

    #[inline]
    pub(crate) fn current(&self) -> &TaskRef {
        &self.current
    }

    pub(crate) fn defer_current(&mut self) {
        let task = self.current.clone();
        self.rt.defer(task);
    }

    #[inline]
    pub(crate) fn wheel(&mut self) -> &mut TimeWheel {
        &mut self.rt.wheel
    }

    #[inline]
    pub(crate) fn deadline_after(&self, timeout_ms: u64) -> u64 {
        self.rt.clock.deadline_after(timeout_ms)
    }

    pub(crate) fn trace_timer_insert(&mut self, deadline: u64) {
        let id = self.current.id();
        if let Some(t) = self.rt.tracer.as_mut() {
            t.on_timer_insert(id, deadline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame::FnFrame, sleep::Sleep, trace::BufferTracer};

    #[test]
    fn task_reference_counting() {
        let mut rt = Runtime::new().unwrap();
        let task = rt
            .new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(7u32)))
            .unwrap();
        let weak = Rc::downgrade(&task);

        // One reference here, one in the queue slot.
        rt.ready.push_back(task.clone());
        assert_eq!(Rc::strong_count(&task), 2);

        // Completion releases the queue slot's reference.
        rt.run_ready();
        assert_eq!(Rc::strong_count(&task), 1);
        assert!(task.is_complete());

        drop(task);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn spawn_past_budget_is_rejected() {
        let mut rt = Runtime::with_max_tasks(1).unwrap();
        let first = rt.new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(()))).unwrap();
        let err = rt
            .new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(())))
            .unwrap_err();
        assert_eq!(err, SpawnError::OutOfMemory);
        drop(first);
    }

    #[test]
    fn budget_slot_is_reclaimed_on_completion() {
        let mut rt = Runtime::with_max_tasks(1).unwrap();
        let task = rt.new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(()))).unwrap();
        rt.ready.push_back(task);
        rt.run_ready();

        assert!(rt.new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(()))).is_ok());
    }

    #[test]
    fn completed_task_wakes_its_consumer() {
        let mut rt = Runtime::new().unwrap();
        let tracer = BufferTracer::new();
        let lines = tracer.handle();
        rt.set_tracer(Box::new(tracer));

        // Park the consumer in the waiting state.
        let consumer = rt
            .new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::<()>::Pending))
            .unwrap();
        rt.ready.push_back(consumer.clone());
        rt.run_ready();
        assert!(!consumer.is_runnable());

        let target = rt.new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(1u8))).unwrap();
        target.register_consumer(Some(consumer.clone()));
        rt.ready.push_back(target);
        rt.run_ready();

        let consumer_id = consumer.id();
        assert!(lines.lines().iter().any(|l| l == &format!("[wake] {consumer_id}")));
    }

    #[test]
    fn canceled_sleep_releases_its_timer_entry() {
        let mut rt = Runtime::new().unwrap();
        let task = rt
            .new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::<()>::Pending))
            .unwrap();

        let mut sleep = Sleep::new(600_000);
        let mut cx = Cx {
            rt: &mut rt,
            current: task,
        };
        assert!(sleep.poll(&mut cx).is_pending());
        assert_eq!(cx.rt.wheel.live_entries(), 1);

        sleep.cancel(&mut cx);
        assert_eq!(cx.rt.wheel.live_entries(), 0);
    }

    #[test]
    fn reset_sleep_rearms_with_one_entry() {
        let mut rt = Runtime::new().unwrap();
        let task = rt
            .new_task(FnFrame(|_cx: &mut Cx<'_>| Poll::<()>::Pending))
            .unwrap();

        let mut sleep = Sleep::new(600_000);
        let mut cx = Cx {
            rt: &mut rt,
            current: task,
        };
        assert!(sleep.poll(&mut cx).is_pending());
        sleep.reset(&mut cx, 300_000);
        assert_eq!(cx.rt.wheel.live_entries(), 0);

        assert!(sleep.poll(&mut cx).is_pending());
        assert_eq!(cx.rt.wheel.live_entries(), 1);

        sleep.cancel(&mut cx);
        assert_eq!(cx.rt.wheel.live_entries(), 0);
    }
}
