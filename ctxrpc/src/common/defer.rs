#[doc(hidden)]
pub struct Defer<F: FnOnce()> {
    // held by the defer! macro, runs on drop
    func: Option<F>,
}

impl<F: FnOnce()> Defer<F> {
    pub fn new(func: F) -> Self {
        Self { func: Some(func) }
    }
}

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(f) = self.func.take() {
            f()
        }
    }
}

/// Run the given statements when the enclosing scope exits, including on
/// early return and on future cancellation.
#[macro_export]
macro_rules! defer {
	( $($tt:tt)* ) => {
		let _deferred = $crate::common::defer::Defer::new(|| { $($tt)* });
	};
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn defer_runs_when_future_is_dropped() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let task = tokio::spawn(async move {
            defer!(c.fetch_add(1, Ordering::SeqCst););
            futures::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        task.abort();
        let _ = task.await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
