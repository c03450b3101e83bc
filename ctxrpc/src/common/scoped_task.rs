//! `ScopedTask` wraps a tokio `JoinHandle` and aborts the task when it is dropped.
//!
//! Background loops owned by a connection (outbound pump, heartbeat, liveness
//! watchdog) are held as `ScopedTask`s so they die with their owner.

use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ScopedTask<T> {
    inner: JoinHandle<T>,
}

impl<T> Drop for ScopedTask<T> {
    fn drop(&mut self) {
        self.inner.abort()
    }
}

impl<T> Future for ScopedTask<T> {
    type Output = <JoinHandle<T> as Future>::Output;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl<T> From<JoinHandle<T>> for ScopedTask<T> {
    fn from(inner: JoinHandle<T>) -> Self {
        Self { inner }
    }
}

impl<T> Deref for ScopedTask<T> {
    type Target = JoinHandle<T>;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::time::Duration;

    use super::ScopedTask;

    #[tokio::test]
    async fn owner_drop_stops_background_loop() {
        let stopped = Arc::new(AtomicBool::new(false));
        let s = stopped.clone();
        let owner = vec![ScopedTask::from(tokio::spawn(async move {
            crate::defer!(s.store(true, Ordering::SeqCst););
            loop {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }))];
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopped.load(Ordering::SeqCst));
        assert!(!owner[0].is_finished());

        drop(owner);
        tokio::task::yield_now().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn awaiting_yields_task_output() {
        let task: ScopedTask<u32> = tokio::spawn(async { 7 }).into();
        assert_eq!(task.await.unwrap(), 7);
    }
}
