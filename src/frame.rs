// src/frame.rs
use crate::runtime::Cx;

/// Result of resuming a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll<T> {
    Pending,
    Ready(T),
}

impl<T> Poll<T> {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Poll::Pending)
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self, Poll::Ready(_))
    }
}

/// A resumable computation.
///
/// A frame encodes its resume point as an explicit state field and dispatches
/// on it at the top of `poll`. Every local read after a suspension point must
/// be stored in the frame itself: nothing but the frame survives between
/// polls. Frames are plain relocatable structs, exclusively owned by one task
/// or by an enclosing frame.
///
/// Awaiting a nested frame is spelled with [`ready!`](crate::ready): poll the
/// nested frame and, if it is not ready, re-suspend the enclosing frame at
/// the same point without doing further work.
pub trait Frame: 'static {
    type Output: 'static;

    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<Self::Output>;
}

/// Convenience adapter: poll a closure.
pub struct FnFrame<F>(pub F);

impl<F, T> Frame for FnFrame<F>
where
    F: FnMut(&mut Cx<'_>) -> Poll<T> + 'static,
    T: 'static,
{
    type Output = T;

    #[inline]
    fn poll(&mut self, cx: &mut Cx<'_>) -> Poll<T> {
        (self.0)(cx)
    }
}
