use crate::client::{ExternalClient, ForgeClient, ForgeConfig};
use crate::credentials::{CredentialResolver, Credentials};
use crate::error::ConnectError;
use crate::external::{AssumeUpToDate, DriftDetector, ExternalHandle};
use crate::resource::{ProviderConfigUsage, TestCase};
use crate::store::ResourceStore;
use std::sync::Arc;

/// Creates clients from resolved credentials.
pub trait ClientFactory: Send + Sync {
    fn new_client(&self, credentials: Credentials) -> anyhow::Result<Box<dyn ExternalClient>>;
}

#[derive(Clone, Debug, Default)]
pub struct ForgeClientFactory {
    config: ForgeConfig,
}

impl ForgeClientFactory {
    pub fn new(config: ForgeConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for ForgeClientFactory {
    fn new_client(&self, credentials: Credentials) -> anyhow::Result<Box<dyn ExternalClient>> {
        Ok(Box::new(ForgeClient::new(self.config.clone(), credentials)?))
    }
}

/// Produces an [`ExternalHandle`] for a test case.
pub struct Connector {
    store: Arc<dyn ResourceStore>,
    factory: Arc<dyn ClientFactory>,
    drift: Arc<dyn DriftDetector>,
}

impl Connector {
    pub fn new(store: Arc<dyn ResourceStore>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            store,
            factory,
            drift: Arc::new(AssumeUpToDate),
        }
    }

    pub fn drift_detector(mut self, drift: Arc<dyn DriftDetector>) -> Self {
        self.drift = drift;
        self
    }

    /// Connect to the external system on behalf of a test case.
    ///
    /// 1. Track that the test case is using its provider config.
    /// 2. Get the provider config.
    /// 3. Get the credentials specified by the provider config.
    /// 4. Use the credentials to create a client, and ping it.
    ///
    /// A failing ping is only logged, the pass continues and observing will report problems.
    pub async fn connect(&self, test_case: &TestCase) -> Result<ExternalHandle, ConnectError> {
        let config_name = &test_case.spec.provider_config_ref.name;

        self.store
            .track_usage(ProviderConfigUsage {
                provider_config: config_name.clone(),
                resource: test_case.metadata.name.clone(),
            })
            .await
            .map_err(ConnectError::TrackingFailed)?;

        let config = self
            .store
            .get_provider_config(config_name)
            .await
            .map_err(|source| ConnectError::ConfigLookupFailed {
                name: config_name.clone(),
                source,
            })?
            .ok_or_else(|| ConnectError::ConfigNotFound(config_name.clone()))?;

        let credentials = CredentialResolver::new(self.store.as_ref())
            .resolve(&config)
            .await
            .map_err(ConnectError::CredentialResolutionFailed)?;

        let client = self
            .factory
            .new_client(credentials)
            .map_err(ConnectError::NewClient)?;

        if let Err(err) = client.health_check().await {
            log::warn!(
                "Health check for {} failed, continuing: {err}",
                test_case.metadata.name
            );
        }

        Ok(ExternalHandle::new(client, self.drift.clone()))
    }
}
