use std::{
    fmt::Debug,
    future,
    sync::{Arc, Mutex},
};
use tokio::task::JoinSet;
use tracing::Instrument;

pub mod config;
pub mod defer;
pub mod log;
pub mod scoped_task;

pub fn get_logger_timer<F: time::formatting::Formattable>(
    format: F,
) -> tracing_subscriber::fmt::time::OffsetTime<F> {
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    tracing_subscriber::fmt::time::OffsetTime::new(local_offset, format)
}

pub fn get_logger_timer_rfc3339(
) -> tracing_subscriber::fmt::time::OffsetTime<time::format_description::well_known::Rfc3339> {
    get_logger_timer(time::format_description::well_known::Rfc3339)
}

/// Keep reaping finished tasks of a shared `JoinSet` until every strong
/// reference to it is gone, so per-call tasks do not pile up as finished
/// handles on a long-lived connection.
pub fn join_joinset_background<T: Debug + Send + Sync + 'static>(
    js: Arc<Mutex<JoinSet<T>>>,
    origin: String,
) {
    let js = Arc::downgrade(&js);
    tokio::spawn(
        async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if js.strong_count() == 0 {
                    tracing::debug!("joinset owner dropped, reaper exit");
                    break;
                }

                future::poll_fn(|cx| {
                    let Some(js) = js.upgrade() else {
                        return std::task::Poll::Ready(());
                    };

                    let Ok(mut js) = js.lock() else {
                        return std::task::Poll::Ready(());
                    };
                    while !js.is_empty() {
                        match js.poll_join_next(cx) {
                            std::task::Poll::Pending => return std::task::Poll::Pending,
                            std::task::Poll::Ready(Some(Err(err))) if err.is_panic() => {
                                tracing::error!(?err, "rpc task panicked");
                            }
                            std::task::Poll::Ready(_) => {}
                        }
                    }

                    std::task::Poll::Ready(())
                })
                .await;
            }
        }
        .instrument(tracing::debug_span!(
            "join_joinset_background",
            origin = origin
        )),
    );
}
