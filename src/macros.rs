// src/macros.rs

/// The await step: polls a nested frame and suspends the enclosing frame at
/// the current resume point if it is not ready.
#[macro_export]
macro_rules! ready {
    ($poll:expr) => {
        match $poll {
            $crate::Poll::Ready(out) => out,
            $crate::Poll::Pending => return $crate::Poll::Pending,
        }
    };
}
