use crate::error::ReconcileError;
use crate::resource::TestCase;
use async_trait::async_trait;
use std::future::Future;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    Retry,
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Run one reconciliation pass for a test case present in the store.
    async fn changed(
        &self,
        test_case: &TestCase,
        cancellation: &Cancellation,
    ) -> Result<Outcome, ReconcileError>;

    /// Handle a test case which is no longer present in the store.
    async fn missing(&self, name: &str) -> Result<Outcome, ReconcileError>;
}

/// Cooperative cancellation of a reconciliation pass.
#[derive(Clone, Debug)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

/// Triggers the cancellation of all [`Cancellation`]s created with it.
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    pub fn cancel(&self) {
        // no receiver left means nothing to cancel
        let _ = self.tx.send(true);
    }

    pub fn cancellation(&self) -> Cancellation {
        Cancellation {
            rx: self.tx.subscribe(),
        }
    }
}

impl Cancellation {
    pub fn new() -> (Canceller, Self) {
        let (tx, rx) = watch::channel(false);
        (Canceller { tx }, Self { rx })
    }

    /// A cancellation which never fires.
    pub fn never() -> Self {
        Self::new().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled, never if the [`Canceller`] is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    pub fn check(&self) -> Result<(), ReconcileError> {
        if self.is_cancelled() {
            Err(ReconcileError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a future, aborting it when cancelled.
    pub async fn run<F: Future>(&self, f: F) -> Result<F::Output, ReconcileError> {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ReconcileError::Cancelled),
            result = f => Ok(result),
        }
    }
}
