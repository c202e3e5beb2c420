use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

/// Cancellation signal shared by the periodic tasks of one connection.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation was requested (or the sender is gone).
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Re-runs `body` every `period`, measured from the end of the previous run,
/// until cancelled. A run in progress always completes.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: Cancellation,
    mut body: F,
) -> JoinHandle<()>
where
    F: FnMut(Cancellation) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut waiter = cancel.clone();
        loop {
            tokio::select! {
                () = waiter.cancelled() => break,
                () = sleep(period) => {}
            }
            if cancel.is_cancelled() {
                break;
            }
            body(cancel.clone()).await;
        }
        debug!(task = name, "Periodic task stopped");
    })
}

/// Background tasks started by `connect`.
pub struct MaintenanceTasks {
    cancel_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl MaintenanceTasks {
    pub fn new() -> (Self, Cancellation) {
        let (cancel_tx, rx) = watch::channel(false);
        (
            Self {
                cancel_tx,
                handles: Vec::new(),
            },
            Cancellation { rx },
        )
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Signals cancellation without waiting for running iterations.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Signals cancellation and waits until every task has stopped.
    pub async fn shutdown(self) {
        self.cancel();
        for res in join_all(self.handles).await {
            if let Err(e) = res {
                debug!(error = %e, "Periodic task ended abnormally");
            }
        }
    }
}
