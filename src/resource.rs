use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt::{Debug, Formatter};

/// Finalizer protecting test cases until the external resource has been handled.
pub const FINALIZER: &str = "finalizer.managedresource.crossplane.io";

pub const DEFAULT_PROVIDER_CONFIG: &str = "default";

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub labels: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub annotations: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add the finalizer, returns `true` if the metadata was changed.
    pub fn ensure_finalizer(&mut self, finalizer: &str) -> bool {
        if self.finalizers.iter().any(|f| f == finalizer) {
            false
        } else {
            self.finalizers.push(finalizer.to_string());
            true
        }
    }

    /// Remove the finalizer, returns `true` if the metadata was changed.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let len = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        len != self.finalizers.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub name: String,
}

impl Default for Reference {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROVIDER_CONFIG.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum DeletionPolicy {
    /// Delete the external resource when the test case is deleted.
    #[default]
    Delete,
    /// Leave the external resource behind.
    Orphan,
}

/// A StormForge test case, as declared by the user.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub metadata: ObjectMeta,
    pub spec: TestCaseSpec,
    #[serde(default)]
    pub status: TestCaseStatus,
}

impl TestCase {
    pub fn new<N: Into<String>>(name: N, parameters: TestCaseParameters) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec: TestCaseSpec {
                provider_config_ref: Default::default(),
                write_connection_secret_to_ref: None,
                deletion_policy: Default::default(),
                for_provider: parameters,
            },
            status: Default::default(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseSpec {
    #[serde(default)]
    pub provider_config_ref: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_connection_secret_to_ref: Option<SecretReference>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    pub for_provider: TestCaseParameters,
}

/// The configurable fields of a test case.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseParameters {
    #[serde(alias = "org")]
    pub organization: String,
    pub name: String,
    /// Test case definition, overriding the client's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_case_file: Option<String>,
    #[serde(flatten)]
    pub fields: IndexMap<String, Value>,
}

impl TestCaseParameters {
    pub fn new<O: Into<String>, N: Into<String>>(organization: O, name: N) -> Self {
        Self {
            organization: organization.into(),
            name: name.into(),
            test_case_file: None,
            fields: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub at_provider: TestCaseObservation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,
}

/// The observable fields of a test case, as seen by the last successful observe.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseObservation {
    pub exists: bool,
    pub up_to_date: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
pub enum ConditionType {
    /// The external resource is ready for use.
    Ready,
    /// The last reconciliation pass succeeded.
    Synced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn new(r#type: ConditionType, status: ConditionStatus, reason: &str) -> Self {
        Self {
            r#type,
            status,
            reason: reason.to_string(),
            message: None,
            last_transition_time: Utc::now(),
        }
    }

    pub fn with_message<M: Into<String>>(mut self, message: M) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn available() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::True, "Available")
    }

    pub fn creating() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, "Creating")
    }

    pub fn deleting() -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::False, "Deleting")
    }

    pub fn reconcile_success() -> Self {
        Self::new(ConditionType::Synced, ConditionStatus::True, "ReconcileSuccess")
    }

    pub fn reconcile_error(reason: &str, message: String) -> Self {
        Self::new(ConditionType::Synced, ConditionStatus::False, reason).with_message(message)
    }

    /// Same state, ignoring the transition time.
    fn equivalent(&self, other: &Self) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

impl TestCaseStatus {
    pub fn condition(&self, r#type: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.r#type == r#type)
    }

    /// Set a condition, keeping the previous transition time if nothing changed.
    pub fn set_condition(&mut self, condition: Condition) {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            Some(existing) if existing.equivalent(&condition) => {}
            Some(existing) => *existing = condition,
            None => self.conditions.push(condition),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub metadata: ObjectMeta,
    pub spec: ProviderConfigSpec,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigSpec {
    pub credentials: ProviderCredentials,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum CredentialsSource {
    None,
    Secret,
    Environment,
    Filesystem,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCredentials {
    pub source: CredentialsSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsSelector>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct EnvSelector {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct FsSelector {
    pub path: String,
}

/// Records that a resource is using a provider config.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfigUsage {
    pub provider_config: String,
    pub resource: String,
}

/// Secret material, with base64 encoded values.
#[derive(Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: IndexMap<String, String>,
}

impl Debug for Secret {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("metadata", &self.metadata)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Secret {
    pub fn namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }
}

/// Details required to connect to an external resource, stored as a secret by the caller.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionDetails(IndexMap<String, Vec<u8>>);

impl ConnectionDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<String>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.0.iter()
    }
}

impl Debug for ConnectionDetails {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Any object which can be loaded from a manifest.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    TestCase(TestCase),
    ProviderConfig(ProviderConfig),
    Secret(Secret),
}
