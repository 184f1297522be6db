// src/sleep.rs
use crate::{
    frame::{Frame, Poll},
    runtime::Cx,
    wheel::EntryKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SleepState {
    Created,
    Registered,
    Completed,
    Canceled,
}

/// Suspends the owning task until a timeout elapses.
///
/// The deadline is fixed at the first poll, not at construction, so a sleep
/// embedded in a larger frame measures from the moment the surrounding state
/// machine actually reaches it. Dropping a registered `Sleep` without calling
/// [`cancel`](Sleep::cancel) leaks its timer entry; a frame that stops
/// polling mid-sleep must cancel first.
pub struct Sleep {
    timeout_ms: u64,
    deadline: Option<u64>,
    entry: Option<EntryKey>,
    state: SleepState,
}

impl Sleep {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            deadline: None,
            entry: None,
            state: SleepState::Created,
        }
    }

    /// Withdraws the timer. The sleep can no longer be polled; a frame that
    /// no longer needs its timeout calls this instead of abandoning it.
    pub fn cancel(&mut self, cx: &mut Cx<'_>) {
        assert!(
            self.state != SleepState::Canceled && self.state != SleepState::Completed,
            "canceled a sleep that already ended"
        );
        if let Some(key) = self.entry.take() {
            cx.wheel().remove_timeout(key);
        }
        self.state = SleepState::Canceled;
    }

    /// Replaces the timeout with a fresh one measured from now. The previous
    /// timer entry, fired or not, is withdrawn.
    pub fn reset(&mut self, cx: &mut Cx<'_>, timeout_ms: u64) {
        assert!(
            self.state != SleepState::Canceled && self.state != SleepState::Completed,
            "reset a sleep that already ended"
        );
        if let Some(key) = self.entry.take() {
            cx.wheel().remove_timeout(key);
        }
        self.timeout_ms = timeout_ms;
        self.deadline = Some(cx.deadline_after(timeout_ms));
        self.state = SleepState::Created;
    }
}

impl Frame for Sleep {
    type Output = ();

    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<()> {
        loop {
            match self.state {
                SleepState::Created => {
                    let deadline = match self.deadline {
                        Some(d) => d,
                        None => {
                            let d = cx.deadline_after(self.timeout_ms);
                            self.deadline = Some(d);
                            d
                        }
                    };

                    let owner = cx.current().clone();
                    let key = cx.wheel().create_entry(owner, deadline);
                    cx.wheel().insert_timeout(key);
                    cx.trace_timer_insert(deadline);
                    self.entry = Some(key);
                    self.state = SleepState::Registered;
                    // Fall through: a deadline already in the past is marked
                    // fired at insertion and completes on this same poll.
                }
                SleepState::Registered => {
                    let key = self.entry.expect("registered sleep without an entry");
                    if !cx.wheel().entry_fired(key) {
                        return Poll::Pending;
                    }
                    cx.wheel().remove_timeout(key);
                    self.entry = None;
                    self.state = SleepState::Completed;
                    return Poll::Ready(());
                }
                SleepState::Completed => panic!("polled a completed sleep"),
                SleepState::Canceled => panic!("polled a canceled sleep"),
            }
        }
    }
}
