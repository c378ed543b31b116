/// Guard that runs a closure when dropped.
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
///
/// The guard also fires when the owning future is dropped before completion, which makes it
/// suitable for bookkeeping that has to happen whether a task finished, failed or was aborted.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = Arc::clone(&fired);
            let _guard = defer(move || fired.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_runs_when_future_is_dropped() {
        let fired = Arc::new(AtomicBool::new(false));
        let guard = {
            let fired = Arc::clone(&fired);
            defer(move || fired.store(true, Ordering::SeqCst))
        };

        let future = async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        };
        let handle = tokio::spawn(future);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(fired.load(Ordering::SeqCst));
    }
}
