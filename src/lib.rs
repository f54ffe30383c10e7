pub mod client;
pub mod connector;
pub mod credentials;
pub mod error;
pub mod events;
pub mod external;
pub mod operator;
pub mod reconciler;
pub mod resource;
pub mod store;
pub mod testcase;

pub use operator::*;

use crate::client::ForgeConfig;
use crate::connector::{Connector, ForgeClientFactory};
use crate::events::{EventSource, EventsConfig};
use crate::reconciler::Cancellation;
use crate::store::{MemoryStore, ResourceStore};
use crate::testcase::TestCaseReconciler;
use anyhow::Context;
use drogue_bazaar::app::{Startup, StartupExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Config {
    operator: OperatorConfig,
    #[serde(default)]
    forge: ForgeConfig,
    /// Receive change notifications from an MQTT endpoint
    #[serde(default)]
    events: Option<EventsConfig>,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct OperatorConfig {
    /// Directory containing test case, provider config and secret manifests
    manifests: PathBuf,

    /// Interval of re-reading the manifests directory
    #[serde(default, with = "humantime_serde")]
    manifest_interval: Option<Duration>,

    /// Interval reconciling all test cases
    #[serde(default, with = "humantime_serde")]
    interval: Option<Duration>,

    /// Number of concurrent reconciliation passes
    #[serde(default)]
    workers: Option<usize>,

    #[serde(default, with = "humantime_serde")]
    pass_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    retry_delay: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    backoff_initial: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    backoff_max: Option<Duration>,
}

impl OperatorConfig {
    fn settings(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            interval: self.interval.unwrap_or(defaults.interval),
            workers: self.workers.unwrap_or(defaults.workers),
            pass_timeout: self.pass_timeout.unwrap_or(defaults.pass_timeout),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            backoff_initial: self.backoff_initial.unwrap_or(defaults.backoff_initial),
            backoff_max: self.backoff_max.unwrap_or(defaults.backoff_max),
        }
    }
}

pub async fn run(config: Config, startup: &mut dyn Startup) -> anyhow::Result<()> {
    // the events config carries a token, don't log it
    log::info!("Operator config: {:#?}", config.operator);
    log::info!("Forge config: {:#?}", config.forge);

    let store = MemoryStore::new();
    store
        .sync_dir(&config.operator.manifests)
        .await
        .with_context(|| {
            format!(
                "Failed to load manifests from {}",
                config.operator.manifests.display()
            )
        })?;

    let (canceller, shutdown) = Cancellation::new();
    let (tx, rx) = mpsc::channel(100);

    let resources: Arc<dyn ResourceStore> = Arc::new(store.clone());
    let connector = Connector::new(
        resources.clone(),
        Arc::new(ForgeClientFactory::new(config.forge)),
    );
    let operator = Operator::new(
        TestCaseReconciler::new(resources.clone(), connector),
        resources,
        config.operator.settings(),
        shutdown,
    );

    if let Some(events) = config.events {
        let source = EventSource::connect(events).await?;
        let tx = tx.clone();
        startup.spawn(async move { source.run(tx).await });
    }

    let manifests = config.operator.manifests;
    let manifest_interval = config
        .operator
        .manifest_interval
        .unwrap_or(Duration::from_secs(10));
    startup.spawn(async move {
        watch_manifests(store, manifests, manifest_interval, tx).await;
        Ok(())
    });

    // the operator task ends once running passes are finished
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Received shutdown signal");
                canceller.cancel();
            }
            Err(err) => log::warn!("Failed to listen for shutdown signal: {err}"),
        }
    });

    log::info!("Starting operator");

    startup.spawn(async move { operator.run(rx).await });

    Ok(())
}

/// Periodically re-read the manifests, triggering passes for changed test cases.
///
/// Runs until the operator stops receiving triggers.
async fn watch_manifests(
    store: MemoryStore,
    path: PathBuf,
    period: Duration,
    triggers: mpsc::Sender<String>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately, the initial sync already happened
    interval.tick().await;

    loop {
        interval.tick().await;

        let changed = match store.sync_dir(&path).await {
            Ok(changed) => changed,
            Err(err) => {
                log::warn!("Failed to sync manifests from {}: {err:#}", path.display());
                continue;
            }
        };

        for name in changed {
            if triggers.send(name).await.is_err() {
                return;
            }
        }
    }
}
