// Cooperative cancellation for in-flight jobs
use tokio::sync::watch;

/// Owner side: call `cancel()` to abort the job holding the matching token
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Job side: resolves `cancelled()` once the source fires (or is dropped
/// after firing)
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token that never fires
    pub fn never() -> Self {
        // A closed channel that never fired pends forever in `cancelled()`
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until cancellation is requested
    ///
    /// If the source is dropped without firing, this pends forever.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
