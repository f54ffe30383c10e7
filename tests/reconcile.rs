use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stormforge_operator::{
    client::{parse_list, ExternalClient},
    connector::{ClientFactory, Connector},
    credentials::Credentials,
    error::{
        CommandError, ConnectError, CreateError, DeleteError, QueryError, ReconcileError,
        StoreError, UnreachableError, UpdateError,
    },
    external::DriftDetector,
    reconciler::{Cancellation, Canceller, Outcome, Reconciler},
    resource::{
        ConditionStatus, ConditionType, ConnectionDetails, DeletionPolicy, Manifest,
        ProviderConfig, ProviderConfigUsage, Secret, SecretReference, TestCase,
        TestCaseParameters, TestCaseStatus, FINALIZER,
    },
    store::{MemoryStore, ResourceStore},
    testcase::TestCaseReconciler,
    Operator, Settings,
};

const SECRET: &str = r#"
kind: Secret
metadata:
  name: stormforge
  namespace: crossplane-system
data:
  token: c2VjcmV0LXRva2Vu
"#;

const PROVIDER_CONFIG: &str = r#"
kind: ProviderConfig
metadata:
  name: default
spec:
  credentials:
    source: Secret
    secretRef:
      namespace: crossplane-system
      name: stormforge
      key: token
"#;

const BROKEN_PROVIDER_CONFIG: &str = r#"
kind: ProviderConfig
metadata:
  name: broken
spec:
  credentials:
    source: Secret
    secretRef:
      namespace: crossplane-system
      name: stormforge
      key: password
"#;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What the external system answers when listing test cases.
#[derive(Debug)]
enum Remote {
    TestCases(Vec<(String, String)>),
    Raw(&'static [u8]),
}

impl Remote {
    fn output(&self, organization: &str) -> Vec<u8> {
        match self {
            Self::TestCases(test_cases) => {
                let data: Vec<_> = test_cases
                    .iter()
                    .filter(|(org, _)| org == organization)
                    .enumerate()
                    .map(|(id, (_, name))| {
                        serde_json::json!({
                            "id": id.to_string(),
                            "attributes": { "name": name, "scope": organization },
                        })
                    })
                    .collect();
                serde_json::to_vec(&serde_json::json!({ "data": data })).unwrap()
            }
            Self::Raw(output) => output.to_vec(),
        }
    }
}

#[derive(Debug)]
struct Forge {
    remote: Mutex<Remote>,
    unhealthy: AtomicBool,
    fail_create: AtomicBool,
    support_delete: AtomicBool,
    support_update: AtomicBool,
    cancel_on_observe: Mutex<Option<Canceller>>,
    clients: AtomicUsize,
    tokens: Mutex<Vec<Vec<u8>>>,
    queries: AtomicUsize,
    creates: Mutex<Vec<(String, String, Option<String>)>>,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl Default for Forge {
    fn default() -> Self {
        Self {
            remote: Mutex::new(Remote::TestCases(vec![])),
            unhealthy: Default::default(),
            fail_create: Default::default(),
            support_delete: Default::default(),
            support_update: Default::default(),
            cancel_on_observe: Default::default(),
            clients: Default::default(),
            tokens: Default::default(),
            queries: Default::default(),
            creates: Default::default(),
            updates: Default::default(),
            deletes: Default::default(),
        }
    }
}

impl Forge {
    fn with_test_case(organization: &str, name: &str) -> Self {
        let forge = Self::default();
        *forge.remote.lock().unwrap() =
            Remote::TestCases(vec![(organization.to_string(), name.to_string())]);
        forge
    }

    fn creates(&self) -> Vec<(String, String, Option<String>)> {
        self.creates.lock().unwrap().clone()
    }
}

#[derive(Debug)]
struct FakeClient(Arc<Forge>);

#[async_trait]
impl ExternalClient for FakeClient {
    async fn health_check(&self) -> Result<(), UnreachableError> {
        if self.0.unhealthy.load(Ordering::SeqCst) {
            return Err(UnreachableError(CommandError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "forge not found",
            ))));
        }
        Ok(())
    }

    async fn exists(&self, organization: &str, name: &str) -> Result<bool, QueryError> {
        self.0.queries.fetch_add(1, Ordering::SeqCst);
        if let Some(canceller) = self.0.cancel_on_observe.lock().unwrap().take() {
            canceller.cancel();
        }
        let output = self.0.remote.lock().unwrap().output(organization);
        Ok(parse_list(&output)?.contains(name))
    }

    async fn create(
        &self,
        organization: &str,
        name: &str,
        definition: Option<&str>,
    ) -> Result<(), CreateError> {
        self.0.creates.lock().unwrap().push((
            organization.to_string(),
            name.to_string(),
            definition.map(ToString::to_string),
        ));
        if self.0.fail_create.load(Ordering::SeqCst) {
            return Err(CreateError::Command(CommandError::Timeout(
                Duration::from_secs(60),
            )));
        }
        if let Remote::TestCases(test_cases) = &mut *self.0.remote.lock().unwrap() {
            test_cases.push((organization.to_string(), name.to_string()));
        }
        Ok(())
    }

    async fn update(
        &self,
        _organization: &str,
        _name: &str,
        _definition: Option<&str>,
    ) -> Result<(), UpdateError> {
        self.0.updates.fetch_add(1, Ordering::SeqCst);
        if !self.0.support_update.load(Ordering::SeqCst) {
            return Err(UpdateError::Unsupported);
        }
        Ok(())
    }

    async fn delete(&self, organization: &str, name: &str) -> Result<(), DeleteError> {
        self.0.deletes.fetch_add(1, Ordering::SeqCst);
        if !self.0.support_delete.load(Ordering::SeqCst) {
            return Err(DeleteError::Unsupported);
        }
        if let Remote::TestCases(test_cases) = &mut *self.0.remote.lock().unwrap() {
            test_cases.retain(|(org, n)| !(org == organization && n == name));
        }
        Ok(())
    }
}

struct FakeFactory(Arc<Forge>);

impl ClientFactory for FakeFactory {
    fn new_client(&self, credentials: Credentials) -> anyhow::Result<Box<dyn ExternalClient>> {
        self.0.clients.fetch_add(1, Ordering::SeqCst);
        self.0
            .tokens
            .lock()
            .unwrap()
            .push(credentials.expose().to_vec());
        Ok(Box::new(FakeClient(self.0.clone())))
    }
}

/// Reports every existing test case as changed.
#[derive(Debug)]
struct Stale;

impl DriftDetector for Stale {
    fn is_up_to_date(&self, _: &TestCase) -> bool {
        false
    }
}

/// A store refusing to track provider config usage.
struct NoTracking(MemoryStore);

#[async_trait]
impl ResourceStore for NoTracking {
    async fn list_test_cases(&self) -> Result<Vec<TestCase>, StoreError> {
        self.0.list_test_cases().await
    }

    async fn get_test_case(&self, name: &str) -> Result<Option<TestCase>, StoreError> {
        self.0.get_test_case(name).await
    }

    async fn get_provider_config(&self, name: &str) -> Result<Option<ProviderConfig>, StoreError> {
        self.0.get_provider_config(name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, StoreError> {
        self.0.get_secret(namespace, name).await
    }

    async fn track_usage(&self, _: ProviderConfigUsage) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("read only".into()))
    }

    async fn update_status(&self, name: &str, status: TestCaseStatus) -> Result<(), StoreError> {
        self.0.update_status(name, status).await
    }

    async fn update_finalizers(
        &self,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        self.0.update_finalizers(name, finalizers).await
    }

    async fn publish_connection_details(
        &self,
        target: &SecretReference,
        details: &ConnectionDetails,
    ) -> Result<(), StoreError> {
        self.0.publish_connection_details(target, details).await
    }

    async fn unpublish_connection_details(
        &self,
        target: &SecretReference,
    ) -> Result<(), StoreError> {
        self.0.unpublish_connection_details(target).await
    }
}

struct Harness {
    store: MemoryStore,
    forge: Arc<Forge>,
    reconciler: TestCaseReconciler,
}

impl Harness {
    async fn new(forge: Forge) -> Self {
        let store = seeded_store().await;
        Self::with_store(store.clone(), Arc::new(store), forge)
    }

    async fn with_drift(forge: Forge, drift: Arc<dyn DriftDetector>) -> Self {
        let store = seeded_store().await;
        Self::build(store.clone(), Arc::new(store), forge, Some(drift))
    }

    fn with_store(store: MemoryStore, resources: Arc<dyn ResourceStore>, forge: Forge) -> Self {
        Self::build(store, resources, forge, None)
    }

    fn build(
        store: MemoryStore,
        resources: Arc<dyn ResourceStore>,
        forge: Forge,
        drift: Option<Arc<dyn DriftDetector>>,
    ) -> Self {
        init();
        let forge = Arc::new(forge);
        let mut connector =
            Connector::new(resources.clone(), Arc::new(FakeFactory(forge.clone())));
        if let Some(drift) = drift {
            connector = connector.drift_detector(drift);
        }
        Self {
            store,
            forge,
            reconciler: TestCaseReconciler::new(resources, connector),
        }
    }

    async fn apply(&self, test_case: TestCase) {
        self.store.apply(Manifest::TestCase(test_case)).await;
    }

    async fn get(&self, name: &str) -> Option<TestCase> {
        self.store.get_test_case(name).await.unwrap()
    }

    async fn pass(&self, name: &str) -> Result<Outcome, ReconcileError> {
        self.pass_with(name, &Cancellation::never()).await
    }

    async fn pass_with(
        &self,
        name: &str,
        cancellation: &Cancellation,
    ) -> Result<Outcome, ReconcileError> {
        let test_case = self.get(name).await.expect("test case must exist");
        self.reconciler.changed(&test_case, cancellation).await
    }
}

async fn seeded_store() -> MemoryStore {
    let store = MemoryStore::new();
    for yaml in [SECRET, PROVIDER_CONFIG, BROKEN_PROVIDER_CONFIG] {
        store.apply(serde_yaml::from_str(yaml).unwrap()).await;
    }
    store
}

fn test_case(name: &str) -> TestCase {
    TestCase::new(name, TestCaseParameters::new("acme", name))
}

fn reason(test_case: &TestCase, r#type: ConditionType) -> (ConditionStatus, String) {
    let condition = test_case
        .status
        .condition(r#type)
        .unwrap_or_else(|| panic!("missing condition {:?}", r#type));
    (condition.status, condition.reason.clone())
}

#[tokio::test]
async fn test_create_absent() {
    let harness = Harness::new(Forge::default()).await;
    harness.apply(test_case("load-1")).await;

    let outcome = harness.pass("load-1").await.unwrap();
    assert_eq!(outcome, Outcome::Retry);

    assert_eq!(harness.forge.queries.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.forge.creates(),
        vec![("acme".to_string(), "load-1".to_string(), None)]
    );
    assert_eq!(harness.forge.deletes.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.forge.tokens.lock().unwrap().clone(),
        vec![b"secret-token".to_vec()]
    );

    let tc = harness.get("load-1").await.unwrap();
    assert!(tc.metadata.finalizers.contains(&FINALIZER.to_string()));
    assert!(!tc.status.at_provider.exists);
    assert_eq!(
        reason(&tc, ConditionType::Ready),
        (ConditionStatus::False, "Creating".into())
    );
    assert_eq!(
        reason(&tc, ConditionType::Synced),
        (ConditionStatus::True, "ReconcileSuccess".into())
    );
    assert_eq!(
        harness.store.usages().await,
        vec![ProviderConfigUsage {
            provider_config: "default".into(),
            resource: "load-1".into(),
        }]
    );
}

#[tokio::test]
async fn test_create_then_available() {
    let harness = Harness::new(Forge::default()).await;
    let mut tc = test_case("load-1");
    tc.spec.for_provider.test_case_file = Some("tests/load.mjs".into());
    harness.apply(tc).await;

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Retry);
    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Complete);

    // created exactly once, with the definition of the test case
    assert_eq!(
        harness.forge.creates(),
        vec![(
            "acme".to_string(),
            "load-1".to_string(),
            Some("tests/load.mjs".to_string())
        )]
    );

    let tc = harness.get("load-1").await.unwrap();
    assert!(tc.status.at_provider.exists);
    assert_eq!(
        reason(&tc, ConditionType::Ready),
        (ConditionStatus::True, "Available".into())
    );
}

#[tokio::test]
async fn test_existing_is_up_to_date() {
    let harness = Harness::new(Forge::with_test_case("acme", "load-1")).await;
    harness.apply(test_case("load-1")).await;

    let outcome = harness.pass("load-1").await.unwrap();
    assert_eq!(outcome, Outcome::Complete);
    assert_eq!(harness.forge.queries.load(Ordering::SeqCst), 1);
    assert!(harness.forge.creates().is_empty());
    assert_eq!(harness.forge.updates.load(Ordering::SeqCst), 0);
    assert_eq!(harness.forge.deletes.load(Ordering::SeqCst), 0);

    let tc = harness.get("load-1").await.unwrap();
    assert!(tc.status.at_provider.exists);
    assert!(tc.status.at_provider.up_to_date);
    assert_eq!(tc.status.observed_generation, Some(tc.metadata.generation));
    assert_eq!(
        reason(&tc, ConditionType::Ready),
        (ConditionStatus::True, "Available".into())
    );
    assert_eq!(
        reason(&tc, ConditionType::Synced),
        (ConditionStatus::True, "ReconcileSuccess".into())
    );
}

#[tokio::test]
async fn test_other_organization_is_absent() {
    let harness = Harness::new(Forge::with_test_case("other", "load-1")).await;
    harness.apply(test_case("load-1")).await;

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Retry);
    assert_eq!(harness.forge.creates().len(), 1);
}

#[tokio::test]
async fn test_malformed_listing_never_creates() {
    let forge = Forge::default();
    *forge.remote.lock().unwrap() = Remote::Raw(b"Error: not logged in");
    let harness = Harness::new(forge).await;
    harness.apply(test_case("load-1")).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Observe(QueryError::Malformed(_))
    ));
    assert!(harness.forge.creates().is_empty());

    let tc = harness.get("load-1").await.unwrap();
    assert!(!tc.status.at_provider.exists);
    assert_eq!(
        reason(&tc, ConditionType::Synced),
        (ConditionStatus::False, "ObserveFailed".into())
    );
}

#[tokio::test]
async fn test_empty_output_never_creates() {
    let forge = Forge::default();
    *forge.remote.lock().unwrap() = Remote::Raw(b"\n");
    let harness = Harness::new(forge).await;
    harness.apply(test_case("load-1")).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Observe(QueryError::Empty)));
    assert!(harness.forge.creates().is_empty());
}

#[tokio::test]
async fn test_missing_provider_config() {
    let harness = Harness::new(Forge::default()).await;
    let mut tc = test_case("load-1");
    tc.spec.provider_config_ref.name = "missing".into();
    harness.apply(tc).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Connect(ConnectError::ConfigNotFound(ref name)) if name == "missing"
    ));
    assert_eq!(harness.forge.clients.load(Ordering::SeqCst), 0);

    let tc = harness.get("load-1").await.unwrap();
    assert_eq!(
        reason(&tc, ConditionType::Synced),
        (ConditionStatus::False, "ConnectFailed".into())
    );
    // usage is tracked before the provider config is looked up
    assert_eq!(harness.store.usages().await.len(), 1);
}

#[tokio::test]
async fn test_tracking_failure() {
    let store = seeded_store().await;
    let harness = Harness::with_store(
        store.clone(),
        Arc::new(NoTracking(store)),
        Forge::default(),
    );
    harness.apply(test_case("load-1")).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Connect(ConnectError::TrackingFailed(_))
    ));
    assert_eq!(harness.forge.clients.load(Ordering::SeqCst), 0);
    assert!(harness.forge.creates().is_empty());
}

#[tokio::test]
async fn test_credential_failure() {
    let harness = Harness::new(Forge::default()).await;
    let mut tc = test_case("load-1");
    tc.spec.provider_config_ref.name = "broken".into();
    harness.apply(tc).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Connect(ConnectError::CredentialResolutionFailed(_))
    ));
    assert_eq!(harness.forge.clients.load(Ordering::SeqCst), 0);
    assert!(harness.forge.creates().is_empty());
}

#[tokio::test]
async fn test_failing_health_check_continues() {
    let forge = Forge::default();
    forge.unhealthy.store(true, Ordering::SeqCst);
    let harness = Harness::new(forge).await;
    harness.apply(test_case("load-1")).await;

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Retry);
    assert_eq!(harness.forge.creates().len(), 1);
}

#[tokio::test]
async fn test_create_failure() {
    let forge = Forge::default();
    forge.fail_create.store(true, Ordering::SeqCst);
    let harness = Harness::new(forge).await;
    harness.apply(test_case("load-1")).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Create(_)));

    let tc = harness.get("load-1").await.unwrap();
    assert!(!tc.status.at_provider.exists);
    assert!(tc.metadata.finalizers.contains(&FINALIZER.to_string()));
    let synced = tc.status.condition(ConditionType::Synced).unwrap();
    assert_eq!(synced.reason, "CreateFailed");
    assert!(synced.message.as_deref().unwrap_or_default().contains("timed out"));
}

#[tokio::test]
async fn test_cancelled_before_create() {
    let harness = Harness::new(Forge::default()).await;
    harness.apply(test_case("load-1")).await;

    let (canceller, cancellation) = Cancellation::new();
    *harness.forge.cancel_on_observe.lock().unwrap() = Some(canceller);

    let err = harness.pass_with("load-1", &cancellation).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled));
    assert!(harness.forge.creates().is_empty());
}

#[tokio::test]
async fn test_cancelled_before_connect() {
    let harness = Harness::new(Forge::default()).await;
    harness.apply(test_case("load-1")).await;

    let (canceller, cancellation) = Cancellation::new();
    canceller.cancel();

    let err = harness.pass_with("load-1", &cancellation).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Cancelled));
    assert_eq!(harness.forge.clients.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unsupported_delete_releases() {
    let harness = Harness::new(Forge::with_test_case("acme", "load-1")).await;
    harness.apply(test_case("load-1")).await;
    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Complete);

    assert!(harness.store.delete_test_case("load-1").await);
    let tc = harness.get("load-1").await.unwrap();
    assert!(tc.is_deleted());

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Complete);
    assert_eq!(harness.forge.deletes.load(Ordering::SeqCst), 1);
    assert!(harness.get("load-1").await.is_none());
    assert!(harness.store.usages().await.is_empty());
}

#[tokio::test]
async fn test_orphan_never_deletes() {
    let forge = Forge::with_test_case("acme", "load-1");
    forge.support_delete.store(true, Ordering::SeqCst);
    let harness = Harness::new(forge).await;
    let mut tc = test_case("load-1");
    tc.spec.deletion_policy = DeletionPolicy::Orphan;
    harness.apply(tc).await;
    harness.pass("load-1").await.unwrap();

    harness.store.delete_test_case("load-1").await;
    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Complete);

    assert_eq!(harness.forge.deletes.load(Ordering::SeqCst), 0);
    assert!(harness.get("load-1").await.is_none());
}

#[tokio::test]
async fn test_supported_delete_waits_for_removal() {
    let forge = Forge::with_test_case("acme", "load-1");
    forge.support_delete.store(true, Ordering::SeqCst);
    let harness = Harness::new(forge).await;
    harness.apply(test_case("load-1")).await;
    harness.pass("load-1").await.unwrap();

    harness.store.delete_test_case("load-1").await;

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Retry);
    assert_eq!(harness.forge.deletes.load(Ordering::SeqCst), 1);
    // still protected by the finalizer, and reported as being deleted
    let tc = harness.get("load-1").await.unwrap();
    assert_eq!(
        reason(&tc, ConditionType::Ready),
        (ConditionStatus::False, "Deleting".into())
    );
    assert!(tc.status.at_provider.exists);

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Complete);
    assert_eq!(harness.forge.deletes.load(Ordering::SeqCst), 1);
    assert!(harness.get("load-1").await.is_none());
}

#[tokio::test]
async fn test_stale_is_updated() {
    let forge = Forge::with_test_case("acme", "load-1");
    forge.support_update.store(true, Ordering::SeqCst);
    let harness = Harness::with_drift(forge, Arc::new(Stale)).await;
    harness.apply(test_case("load-1")).await;

    assert_eq!(harness.pass("load-1").await.unwrap(), Outcome::Complete);
    assert_eq!(harness.forge.updates.load(Ordering::SeqCst), 1);
    assert!(harness.forge.creates().is_empty());

    let tc = harness.get("load-1").await.unwrap();
    assert!(tc.status.at_provider.exists);
    assert!(!tc.status.at_provider.up_to_date);
    assert_eq!(
        reason(&tc, ConditionType::Ready),
        (ConditionStatus::True, "Available".into())
    );
}

#[tokio::test]
async fn test_stale_without_update_support() {
    let harness =
        Harness::with_drift(Forge::with_test_case("acme", "load-1"), Arc::new(Stale)).await;
    harness.apply(test_case("load-1")).await;

    let err = harness.pass("load-1").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Update(UpdateError::Unsupported)));
    assert_eq!(harness.forge.updates.load(Ordering::SeqCst), 1);
    assert!(harness.forge.creates().is_empty());

    let tc = harness.get("load-1").await.unwrap();
    assert_eq!(
        reason(&tc, ConditionType::Synced),
        (ConditionStatus::False, "UpdateFailed".into())
    );
}

#[tokio::test]
async fn test_connection_secret() {
    let harness = Harness::new(Forge::with_test_case("acme", "load-1")).await;
    let mut tc = test_case("load-1");
    tc.spec.write_connection_secret_to_ref = Some(SecretReference {
        namespace: "default".into(),
        name: "load-1-connection".into(),
    });
    harness.apply(tc).await;

    harness.pass("load-1").await.unwrap();
    assert!(harness
        .store
        .get_secret("default", "load-1-connection")
        .await
        .unwrap()
        .is_some());

    harness.store.delete_test_case("load-1").await;
    harness.pass("load-1").await.unwrap();
    assert!(harness
        .store
        .get_secret("default", "load-1-connection")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_missing_is_complete() {
    let harness = Harness::new(Forge::default()).await;
    assert_eq!(
        harness.reconciler.missing("load-1").await.unwrap(),
        Outcome::Complete
    );
    assert_eq!(harness.forge.clients.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_operator_creates_and_settles() {
    let store = seeded_store().await;
    store.apply(Manifest::TestCase(test_case("load-1"))).await;
    let harness = Harness::with_store(store.clone(), Arc::new(store.clone()), Forge::default());

    let (canceller, shutdown) = Cancellation::new();
    let operator = Arc::new(Operator::new(
        harness.reconciler,
        Arc::new(store.clone()),
        Settings {
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        },
        shutdown,
    ));

    let (tx, rx) = tokio::sync::mpsc::channel(10);
    let runner = {
        let operator = operator.clone();
        tokio::spawn(async move { operator.run(rx).await })
    };
    tx.send("load-1".to_string()).await.unwrap();

    let mut available = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let tc = store.get_test_case("load-1").await.unwrap().unwrap();
        if tc
            .status
            .condition(ConditionType::Ready)
            .map(|c| c.reason == "Available")
            .unwrap_or_default()
        {
            available = true;
            break;
        }
    }

    canceller.cancel();
    runner.await.unwrap().unwrap();

    assert!(available);
    assert_eq!(harness.forge.creates().len(), 1);
}
