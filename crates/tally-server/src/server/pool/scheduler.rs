use super::{DeadLetterSink, QueuedTask, manager::Dispatcher};
use core::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Holds `Retrying` tasks for their backoff, then hands them back to the
/// pool.
///
/// A worker never sleeps on a backoff itself; it parks the task here and
/// moves on. Once the shutdown token is cancelled, waiting tasks are
/// dead-lettered instead of re-dispatched.
#[derive(Clone)]
pub struct RetryScheduler {
    dispatcher: Dispatcher,
    sink: DeadLetterSink,
    shutdown_token: CancellationToken,
}

impl RetryScheduler {
    pub const fn new(
        dispatcher: Dispatcher,
        sink: DeadLetterSink,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            dispatcher,
            sink,
            shutdown_token,
        }
    }

    pub fn schedule(&self, queued: QueuedTask, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = this.shutdown_token.cancelled() => {
                    this.sink.bury(queued.task, "abandoned at shutdown while awaiting retry").await;
                }
                () = sleep(delay) => {
                    if let Err(queued) = this.dispatcher.dispatch(queued).await {
                        this.sink.bury(queued.task, "worker pool closed before retry").await;
                    }
                }
            }
        });
    }
}
