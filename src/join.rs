// src/join.rs
use std::marker::PhantomData;

use crate::{
    frame::{Frame, Poll},
    runtime::{Cx, SpawnError},
    task::TaskRef,
};

/// Waits for a spawned task and yields its output.
///
/// The handle holds a reference on the target task, so the output survives
/// until the handle claims it even if the task finishes first. On the first
/// poll the handle registers its own task as the target's consumer; the
/// target then holds a reference back until completion, when the scheduler
/// wakes the consumer and the registration is cleared.
///
/// A handle produced by a failed spawn carries the error instead and yields
/// `Err` on its first poll.
pub struct JoinHandle<T> {
    task: Option<TaskRef>,
    error: Option<SpawnError>,
    registered: bool,
    _output: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef) -> Self {
        Self {
            task: Some(task),
            error: None,
            registered: false,
            _output: PhantomData,
        }
    }

    pub(crate) fn failed(error: SpawnError) -> Self {
        Self {
            task: None,
            error: Some(error),
            registered: false,
            _output: PhantomData,
        }
    }

    /// True when the spawn behind this handle never produced a task.
    pub fn spawn_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Abandons the output. Clears the consumer registration (if one was
    /// made) and drops the handle's reference; the task keeps running and is
    /// freed on its own when it completes.
    pub fn detach(mut self) {
        if let Some(task) = self.task.take() {
            task.register_consumer(None);
        }
    }
}

impl<T: 'static> Frame for JoinHandle<T> {
    type Output = Result<T, SpawnError>;

    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<Self::Output> {
        if let Some(err) = self.error {
            return Poll::Ready(Err(err));
        }

        let task = self
            .task
            .as_ref()
            .expect("join handle polled after completion")
            .clone();

        if !self.registered {
            task.register_consumer(Some(cx.current().clone()));
            self.registered = true;
        }

        let mut out: Option<T> = None;
        if !task.try_copy_output(&mut out) {
            return Poll::Pending;
        }

        self.task = None;
        Poll::Ready(Ok(out.expect("joined task completed without an output")))
    }
}
