// src/yield_now.rs
use crate::{
    frame::{Frame, Poll},
    runtime::Cx,
};

/// Gives the rest of the ready queue a turn, then resumes.
///
/// The owning task is moved to the deferred queue; it runs again only after
/// every task that was already ready has been polled.
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub fn new() -> Self {
        Self { yielded: false }
    }
}

impl Default for YieldNow {
    fn default() -> Self {
        Self::new()
    }
}

impl Frame for YieldNow {
    type Output = ();

    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.defer_current();
            Poll::Pending
        }
    }
}
