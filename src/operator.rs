use crate::error::ReconcileError;
use crate::reconciler::{Cancellation, Outcome, Reconciler};
use crate::store::ResourceStore;
use humantime::format_duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug)]
pub struct Settings {
    /// Interval of reconciling all test cases
    pub interval: Duration,
    /// Number of passes running concurrently
    pub workers: usize,
    /// Time after which a pass gets cancelled
    pub pass_timeout: Duration,
    /// Delay before re-running a pass which asked for it
    pub retry_delay: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            workers: 4,
            pass_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_secs(1),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Schedules reconciliation passes for test cases.
///
/// At most one pass per test case runs at a time, passes of different test cases run
/// concurrently, bounded by the number of workers.
pub struct Operator<R>
where
    R: Reconciler,
{
    shared: Arc<Shared<R>>,
    interval: Duration,
}

struct Shared<R> {
    reconciler: R,
    store: Arc<dyn ResourceStore>,
    workers: Semaphore,
    num_workers: usize,
    inflight: SingleFlight,
    backoff: Backoff,
    pass_timeout: Duration,
    retry_delay: Duration,
    shutdown: Cancellation,
}

impl<R> Operator<R>
where
    R: Reconciler,
{
    pub fn new(
        reconciler: R,
        store: Arc<dyn ResourceStore>,
        settings: Settings,
        shutdown: Cancellation,
    ) -> Self {
        let num_workers = settings.workers.max(1);
        Self {
            shared: Arc::new(Shared {
                reconciler,
                store,
                workers: Semaphore::new(num_workers),
                num_workers,
                inflight: Default::default(),
                backoff: Backoff::new(settings.backoff_initial, settings.backoff_max),
                pass_timeout: settings.pass_timeout,
                retry_delay: settings.retry_delay,
                shutdown,
            }),
            interval: settings.interval,
        }
    }

    /// Request a reconciliation pass for a test case.
    pub fn trigger<N: Into<String>>(&self, name: N) {
        self.shared.schedule(name.into());
    }

    pub async fn reconcile_all(&self) {
        match self.shared.store.list_test_cases().await {
            Ok(test_cases) => {
                log::debug!("Reconciling {} test cases", test_cases.len());
                for tc in test_cases {
                    self.shared.schedule(tc.metadata.name);
                }
            }
            Err(err) => log::warn!("Failed to list test cases: {err}"),
        }
    }

    /// Run until shut down, processing triggers and periodically reconciling all test cases.
    pub async fn run(&self, mut triggers: mpsc::Receiver<String>) -> anyhow::Result<()> {
        log::info!(
            "Reconciling test cases with interval {}",
            format_duration(self.interval)
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut triggers_open = true;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile_all().await;
                }
                trigger = triggers.recv(), if triggers_open => match trigger {
                    Some(name) => {
                        log::debug!("Triggered: {name}");
                        self.shared.schedule(name);
                    }
                    None => {
                        log::info!("Trigger source closed, continuing with periodic reconciliation");
                        triggers_open = false;
                    }
                },
                _ = self.shared.shutdown.cancelled() => {
                    break;
                }
            }
        }

        log::info!("Shutting down, waiting for running passes");
        let _ = self
            .shared
            .workers
            .acquire_many(self.shared.num_workers as u32)
            .await;

        Ok(())
    }
}

impl<R> Shared<R>
where
    R: Reconciler,
{
    fn schedule(self: &Arc<Self>, name: String) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if !self.inflight.try_start(&name) {
            log::debug!("Pass for {name} already scheduled, coalescing");
            return;
        }

        let shared = self.clone();
        tokio::spawn(async move { shared.process(name).await });
    }

    fn requeue(self: &Arc<Self>, name: String, delay: Duration) {
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => shared.schedule(name),
                _ = shared.shutdown.cancelled() => {}
            }
        });
    }

    async fn process(self: Arc<Self>, name: String) {
        let result = match self.workers.acquire().await {
            Ok(_permit) if !self.shutdown.is_cancelled() => Some(self.pass(&name).await),
            _ => None,
        };

        let rerun = self.inflight.finish(&name);

        match result {
            Some(Ok(Outcome::Complete)) => {
                self.backoff.reset(&name);
                log::debug!("Reconciled test case: {name}");
                if rerun {
                    self.schedule(name);
                }
            }
            Some(Ok(Outcome::Retry)) => {
                self.backoff.reset(&name);
                log::debug!("Need to retry test case: {name}");
                self.requeue(name, self.retry_delay);
            }
            Some(Err(err)) => {
                let delay = self.backoff.next(&name);
                log::warn!(
                    "Failed to reconcile test case {name}, retrying in {}: {}",
                    format_duration(delay),
                    err.message()
                );
                self.requeue(name, delay);
            }
            None => {}
        }
    }

    async fn pass(&self, name: &str) -> Result<Outcome, ReconcileError> {
        let (canceller, cancellation) = Cancellation::new();

        let watchdog = async move {
            tokio::select! {
                _ = tokio::time::sleep(self.pass_timeout) => {
                    log::warn!("Pass for {name} timed out after {}", format_duration(self.pass_timeout));
                }
                _ = self.shutdown.cancelled() => {}
            }
            canceller.cancel();
            futures::future::pending::<Result<Outcome, ReconcileError>>().await
        };

        let work = async {
            match self.store.get_test_case(name).await? {
                Some(tc) => self.reconciler.changed(&tc, &cancellation).await,
                None => self.reconciler.missing(name).await,
            }
        };

        tokio::select! {
            result = work => result,
            result = watchdog => result,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks scheduled passes per test case.
#[derive(Debug, Default)]
struct SingleFlight {
    /// scheduled passes, and if another pass was requested meanwhile
    inflight: Mutex<HashMap<String, bool>>,
}

impl SingleFlight {
    /// Returns `true` if the caller should run the pass.
    fn try_start(&self, name: &str) -> bool {
        let mut inflight = lock(&self.inflight);
        match inflight.get_mut(name) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                inflight.insert(name.to_string(), false);
                true
            }
        }
    }

    /// Returns `true` if another pass was requested while this one was running.
    fn finish(&self, name: &str) -> bool {
        lock(&self.inflight).remove(name).unwrap_or_default()
    }
}

/// Exponential backoff per test case.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    attempts: Mutex<HashMap<String, u32>>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempts: Default::default(),
        }
    }

    fn next(&self, name: &str) -> Duration {
        let mut attempts = lock(&self.attempts);
        let attempt = attempts.entry(name.to_string()).or_default();
        let delay = self
            .initial
            .saturating_mul(2u32.saturating_pow(*attempt))
            .min(self.max);
        *attempt = attempt.saturating_add(1);
        delay
    }

    fn reset(&self, name: &str) {
        lock(&self.attempts).remove(name);
    }
}
