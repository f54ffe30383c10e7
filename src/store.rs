use crate::error::StoreError;
use crate::resource::{
    ConnectionDetails, Manifest, ObjectMeta, ProviderConfig, ProviderConfigUsage, Secret, SecretReference,
    TestCase, TestCaseStatus,
};
use async_trait::async_trait;
use chrono::Utc;
use indexmap::{IndexMap, IndexSet};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_test_cases(&self) -> Result<Vec<TestCase>, StoreError>;

    async fn get_test_case(&self, name: &str) -> Result<Option<TestCase>, StoreError>;

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError>;

    /// Record that a resource uses a provider config.
    async fn track_usage(&self, usage: ProviderConfigUsage) -> Result<(), StoreError>;

    /// Replace the status of a test case.
    async fn update_status(&self, name: &str, status: TestCaseStatus) -> Result<(), StoreError>;

    /// Replace the finalizers of a test case. Once a deleted test case has no finalizers left,
    /// it is removed from the store.
    async fn update_finalizers(&self, name: &str, finalizers: Vec<String>)
        -> Result<(), StoreError>;

    async fn publish_connection_details(
        &self,
        target: &SecretReference,
        details: &ConnectionDetails,
    ) -> Result<(), StoreError>;

    async fn unpublish_connection_details(&self, target: &SecretReference)
        -> Result<(), StoreError>;
}

#[async_trait]
impl<S: ResourceStore + ?Sized> ResourceStore for Arc<S> {
    async fn list_test_cases(&self) -> Result<Vec<TestCase>, StoreError> {
        (**self).list_test_cases().await
    }

    async fn get_test_case(&self, name: &str) -> Result<Option<TestCase>, StoreError> {
        (**self).get_test_case(name).await
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        (**self).get_provider_config(name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        (**self).get_secret(namespace, name).await
    }

    async fn track_usage(&self, usage: ProviderConfigUsage) -> Result<(), StoreError> {
        (**self).track_usage(usage).await
    }

    async fn update_status(&self, name: &str, status: TestCaseStatus) -> Result<(), StoreError> {
        (**self).update_status(name, status).await
    }

    async fn update_finalizers(
        &self,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        (**self).update_finalizers(name, finalizers).await
    }

    async fn publish_connection_details(
        &self,
        target: &SecretReference,
        details: &ConnectionDetails,
    ) -> Result<(), StoreError> {
        (**self).publish_connection_details(target, details).await
    }

    async fn unpublish_connection_details(
        &self,
        target: &SecretReference,
    ) -> Result<(), StoreError> {
        (**self).unpublish_connection_details(target).await
    }
}

#[derive(Debug, Default)]
struct State {
    test_cases: IndexMap<String, TestCase>,
    provider_configs: IndexMap<String, ProviderConfig>,
    secrets: IndexMap<(String, String), Secret>,
    usages: IndexSet<ProviderConfigUsage>,
}

impl State {
    /// Returns `true` if a test case was added or its spec changed.
    fn apply(&mut self, manifest: Manifest) -> bool {
        match manifest {
            Manifest::TestCase(mut tc) => {
                let changed;
                if let Some(existing) = self.test_cases.get(&tc.metadata.name) {
                    // spec comes from the manifest, everything the operator owns is kept
                    tc.status = existing.status.clone();
                    tc.metadata.finalizers = existing.metadata.finalizers.clone();
                    tc.metadata.creation_timestamp = existing.metadata.creation_timestamp;
                    tc.metadata.deletion_timestamp = tc
                        .metadata
                        .deletion_timestamp
                        .or(existing.metadata.deletion_timestamp);
                    changed = existing.spec != tc.spec;
                    tc.metadata.generation = if changed {
                        existing.metadata.generation + 1
                    } else {
                        existing.metadata.generation
                    };
                } else {
                    changed = true;
                    tc.metadata.creation_timestamp.get_or_insert_with(Utc::now);
                    tc.metadata.generation = tc.metadata.generation.max(1);
                }
                self.test_cases.insert(tc.metadata.name.clone(), tc);
                changed
            }
            Manifest::ProviderConfig(pc) => {
                self.provider_configs.insert(pc.metadata.name.clone(), pc);
                false
            }
            Manifest::Secret(secret) => {
                let key = (secret.namespace().to_string(), secret.metadata.name.clone());
                self.secrets.insert(key, secret);
                false
            }
        }
    }

    fn delete_test_case(&mut self, name: &str) -> bool {
        let remove = match self.test_cases.get_mut(name) {
            Some(tc) if tc.metadata.finalizers.is_empty() => true,
            Some(tc) => {
                tc.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
                false
            }
            None => return false,
        };
        if remove {
            self.test_cases.shift_remove(name);
        }
        true
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, manifest: Manifest) {
        self.state.write().await.apply(manifest);
    }

    /// Request deletion of a test case.
    ///
    /// Test cases without finalizers are removed immediately, others are marked as deleted.
    pub async fn delete_test_case(&self, name: &str) -> bool {
        self.state.write().await.delete_test_case(name)
    }

    pub async fn usages(&self) -> Vec<ProviderConfigUsage> {
        self.state.read().await.usages.iter().cloned().collect()
    }

    /// Synchronize with a directory of manifests, returning the names of changed test cases.
    ///
    /// Test cases which no longer have a manifest get deleted. Provider configs and secrets are
    /// replaced with the content of the directory.
    pub async fn sync_dir<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<Vec<String>> {
        let path = path.as_ref().to_path_buf();
        let manifests = tokio::task::spawn_blocking(move || load_dir(path)).await??;

        let names: IndexSet<String> = manifests
            .iter()
            .filter_map(|m| match m {
                Manifest::TestCase(tc) => Some(tc.metadata.name.clone()),
                _ => None,
            })
            .collect();

        let mut state = self.state.write().await;
        state.provider_configs.clear();
        state
            .secrets
            .retain(|_, secret| secret.metadata.annotations.contains_key(OWNER_ANNOTATION));

        let mut changed = Vec::new();
        for manifest in manifests {
            let name = match &manifest {
                Manifest::TestCase(tc) => Some(tc.metadata.name.clone()),
                _ => None,
            };
            if state.apply(manifest) {
                changed.extend(name);
            }
        }

        let removed: Vec<String> = state
            .test_cases
            .iter()
            .filter(|(name, tc)| !names.contains(*name) && !tc.is_deleted())
            .map(|(name, _)| name.clone())
            .collect();
        for name in removed {
            log::info!("Test case manifest removed: {name}");
            state.delete_test_case(&name);
            changed.push(name);
        }

        Ok(changed)
    }
}

const OWNER_ANNOTATION: &str = "stormforge.io/connection-secret";

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_test_cases(&self) -> Result<Vec<TestCase>, StoreError> {
        Ok(self.state.read().await.test_cases.values().cloned().collect())
    }

    async fn get_test_case(&self, name: &str) -> Result<Option<TestCase>, StoreError> {
        Ok(self.state.read().await.test_cases.get(name).cloned())
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        Ok(self.state.read().await.provider_configs.get(name).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn track_usage(&self, usage: ProviderConfigUsage) -> Result<(), StoreError> {
        self.state.write().await.usages.insert(usage);
        Ok(())
    }

    async fn update_status(&self, name: &str, status: TestCaseStatus) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let tc = state
            .test_cases
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "TestCase",
                name: name.to_string(),
            })?;
        if tc.status != status {
            log::debug!("Status of {name}: {status:?}");
        }
        tc.status = status;
        Ok(())
    }

    async fn update_finalizers(
        &self,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let tc = state
            .test_cases
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: "TestCase",
                name: name.to_string(),
            })?;
        tc.metadata.finalizers = finalizers;
        if tc.is_deleted() && tc.metadata.finalizers.is_empty() {
            log::info!("Test case {name} released");
            state.test_cases.shift_remove(name);
            state.usages.retain(|u| u.resource != name);
        }
        Ok(())
    }

    async fn publish_connection_details(
        &self,
        target: &SecretReference,
        details: &ConnectionDetails,
    ) -> Result<(), StoreError> {
        let mut secret = Secret {
            metadata: ObjectMeta {
                namespace: Some(target.namespace.clone()),
                ..ObjectMeta::new(target.name.clone())
            },
            data: details
                .iter()
                .map(|(k, v)| (k.clone(), base64::encode(v)))
                .collect(),
        };
        secret
            .metadata
            .annotations
            .insert(OWNER_ANNOTATION.to_string(), "true".to_string());

        self.state
            .write()
            .await
            .secrets
            .insert((target.namespace.clone(), target.name.clone()), secret);
        Ok(())
    }

    async fn unpublish_connection_details(
        &self,
        target: &SecretReference,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .secrets
            .shift_remove(&(target.namespace.clone(), target.name.clone()));
        Ok(())
    }
}

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Manifest> {
    Ok(serde_yaml::from_reader(File::open(path)?)?)
}

/// Load all `.yaml`/`.yml` manifests of a directory, in file name order.
pub fn load_dir<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Manifest>> {
    let mut paths = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.retain(|p| {
        p.is_file()
            && matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
    });
    paths.sort();

    paths
        .into_iter()
        .map(|p| {
            load(&p).map_err(|err| err.context(format!("failed to load {}", p.display())))
        })
        .collect()
}
