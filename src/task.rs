// src/task.rs
use std::{
    any::Any,
    cell::{Cell, RefCell},
    mem,
    rc::Rc,
};

use crate::{
    frame::{Frame, Poll},
    runtime::Cx,
};

/// Shared handle to a task. Every structural holder of a task (a scheduler
/// queue slot, a timer entry, a consumer registration, a join handle) holds
/// exactly one clone; the task is freed when the last clone drops.
pub(crate) type TaskRef = Rc<Task>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Runnable,
    Running,
    Waiting,
    Complete,
}

/// Frame storage and output storage share one slot: the output replaces the
/// frame at the moment of completion and must not be read before then.
enum PayloadSlot<F: Frame> {
    Polling(F),
    Finished(F::Output),
    Taken,
}

/// Type-erased view of a task's payload slot.
trait Payload {
    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<()>;
    fn take_output(&mut self, dst: &mut dyn Any) -> bool;
}

impl<F: Frame> Payload for PayloadSlot<F> {
    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<()> {
        match self {
            PayloadSlot::Polling(frame) => match frame.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(out) => {
                    *self = PayloadSlot::Finished(out);
                    Poll::Ready(())
                }
            },
            _ => panic!("task frame polled after completion"),
        }
    }

    fn take_output(&mut self, dst: &mut dyn Any) -> bool {
        match mem::replace(self, PayloadSlot::Taken) {
            PayloadSlot::Finished(out) => {
                let slot = dst
                    .downcast_mut::<Option<F::Output>>()
                    .expect("task output copied into a slot of the wrong type");
                *slot = Some(out);
                true
            }
            PayloadSlot::Taken => panic!("task output taken twice"),
            PayloadSlot::Polling(_) => panic!("task output taken before completion"),
        }
    }
}

/// One spawned (or blocked-on) computation.
///
/// Lifecycle: `Runnable -> Running -> (Waiting -> Runnable)* -> Complete`.
/// A task transitions to `Running` only while its frame is being polled, and
/// is mutated only from scheduler context; there is no concurrent access by
/// construction.
pub(crate) struct Task {
    id: u64,
    state: Cell<TaskState>,
    consumer: RefCell<Option<TaskRef>>,
    payload: RefCell<Box<dyn Payload>>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new<F: Frame>(id: u64, frame: F) -> TaskRef {
        Rc::new(Task {
            id,
            state: Cell::new(TaskState::Runnable),
            consumer: RefCell::new(None),
            payload: RefCell::new(Box::new(PayloadSlot::Polling(frame))),
        })
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub(crate) fn is_runnable(&self) -> bool {
        self.state.get() == TaskState::Runnable
    }

    #[inline]
    pub(crate) fn is_complete(&self) -> bool {
        self.state.get() == TaskState::Complete
    }

    pub(crate) fn make_runnable(&self) {
        assert_eq!(
            self.state.get(),
            TaskState::Waiting,
            "only a waiting task can be made runnable"
        );
        self.state.set(TaskState::Runnable);
    }

    /// Sets or clears the task woken when this one completes. A registered
    /// consumer is kept alive by this task for as long as the registration
    /// stands; replacing it releases the previous reference.
    pub(crate) fn register_consumer(&self, consumer: Option<TaskRef>) {
        *self.consumer.borrow_mut() = consumer;
    }

    /// Polls the frame once. On completion, hands back the registered
    /// consumer (if any) so the scheduler can wake it.
    pub(crate) fn poll(&self, cx: &mut Cx<'_>) -> Poll<Option<TaskRef>> {
        assert_eq!(
            self.state.get(),
            TaskState::Runnable,
            "polled a task that is not runnable"
        );
        self.state.set(TaskState::Running);

        let polled = self.payload.borrow_mut().poll(cx);
        match polled {
            Poll::Pending => {
                self.state.set(TaskState::Waiting);
                Poll::Pending
            }
            Poll::Ready(()) => {
                self.state.set(TaskState::Complete);
                Poll::Ready(self.consumer.borrow().clone())
            }
        }
    }

    /// Copies the output out and clears the consumer registration. Returns
    /// false until the task is complete; succeeds at most once.
    pub(crate) fn try_copy_output(&self, dst: &mut dyn Any) -> bool {
        if !self.is_complete() {
            return false;
        }

        let copied = self.payload.borrow_mut().take_output(dst);
        *self.consumer.borrow_mut() = None;
        copied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FnFrame;

    #[test]
    fn new_task_is_runnable() {
        let task = Task::new(0, FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(5u32)));
        assert!(task.is_runnable());
        assert!(!task.is_complete());
    }

    #[test]
    fn output_not_readable_before_completion() {
        let task = Task::new(0, FnFrame(|_cx: &mut Cx<'_>| Poll::Ready(5u32)));
        let mut out: Option<u32> = None;
        assert!(!task.try_copy_output(&mut out));
        assert_eq!(out, None);
    }
}
