//! Delayed event dispatcher
//!
//! Protocol lifecycle hooks (`on_connect`, `release`) are never invoked
//! inline from connection code; they are handed to the dispatcher, which
//! runs them on the runtime after an optional delay. This breaks the
//! reentrancy loop where a freshly connected protocol sends data while
//! the acceptance path is still on the stack.

use std::time::Duration;

use tracing::trace;

/// Schedules callbacks onto the async runtime
///
/// Must be used from within a tokio runtime context.
#[derive(Debug, Default)]
pub struct EventDispatcher;

impl EventDispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run `callback` after `delay`
    ///
    /// A zero delay still defers the callback to a fresh task.
    pub fn add_event(
        &self,
        callback: impl FnOnce() + Send + 'static,
        label: &'static str,
        delay: Duration,
    ) {
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            trace!(event = label, "Dispatching deferred event");
            callback();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_zero_delay_event_runs() {
        let dispatcher = EventDispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        dispatcher.add_event(
            move || flag.store(true, Ordering::SeqCst),
            "test event",
            Duration::ZERO,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_event_waits() {
        let dispatcher = EventDispatcher::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        dispatcher.add_event(
            move || flag.store(true, Ordering::SeqCst),
            "delayed event",
            Duration::from_secs(30),
        );

        // Let the spawned task reach its sleep before advancing the clock
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
