use crate::{
    connector::Connector,
    error::{DeleteError, ReconcileError, StoreError},
    external::ExternalHandle,
    reconciler::{Cancellation, Outcome, Reconciler},
    resource::{
        Condition, ConnectionDetails, DeletionPolicy, TestCase, TestCaseObservation,
        TestCaseStatus, FINALIZER,
    },
    store::ResourceStore,
};
use async_trait::async_trait;
use std::sync::Arc;

pub struct TestCaseReconciler {
    store: Arc<dyn ResourceStore>,
    connector: Connector,
}

impl TestCaseReconciler {
    pub fn new(store: Arc<dyn ResourceStore>, connector: Connector) -> Self {
        Self { store, connector }
    }
}

#[async_trait]
impl Reconciler for TestCaseReconciler {
    async fn changed(
        &self,
        test_case: &TestCase,
        cancellation: &Cancellation,
    ) -> Result<Outcome, ReconcileError> {
        let name = &test_case.metadata.name;
        let mut status = test_case.status.clone();

        let result = self.reconcile(test_case, &mut status, cancellation).await;

        if let Err(err) = &result {
            status.set_condition(Condition::reconcile_error(err.reason(), err.message()));
        }

        if status != test_case.status {
            match self.store.update_status(name, status).await {
                Ok(()) => {}
                // released by this pass
                Err(StoreError::NotFound { .. }) if test_case.is_deleted() => {}
                Err(err) => {
                    log::warn!("Failed to update status of {name}: {err}");
                    // an error of the pass takes precedence
                    return result.and(Err(err.into()));
                }
            }
        }

        result
    }

    async fn missing(&self, name: &str) -> Result<Outcome, ReconcileError> {
        // finalizers ensure deletion was handled before the test case disappeared
        log::debug!("Test case is gone: {name}");
        Ok(Outcome::Complete)
    }
}

impl TestCaseReconciler {
    async fn reconcile(
        &self,
        test_case: &TestCase,
        status: &mut TestCaseStatus,
        cancellation: &Cancellation,
    ) -> Result<Outcome, ReconcileError> {
        let handle = cancellation.run(self.connector.connect(test_case)).await??;
        let observation = cancellation.run(handle.observe(test_case)).await??;

        status.at_provider = TestCaseObservation {
            exists: observation.resource_exists,
            up_to_date: observation.resource_up_to_date,
        };

        if test_case.is_deleted() {
            return self
                .removing(&handle, test_case, status, observation.resource_exists)
                .await;
        }

        self.publish(test_case, &observation.connection_details)
            .await?;

        // ensure that the finalizer is set, before creating anything
        let mut metadata = test_case.metadata.clone();
        if metadata.ensure_finalizer(FINALIZER) {
            self.store
                .update_finalizers(&metadata.name, metadata.finalizers)
                .await?;
        }

        if !observation.resource_exists {
            // once started, a create runs to completion
            cancellation.check()?;
            let creation = handle.create(test_case).await?;

            status.set_condition(Condition::creating());
            status.set_condition(Condition::reconcile_success());
            self.publish(test_case, &creation.connection_details)
                .await?;

            // observe the result with the next pass
            return Ok(Outcome::Retry);
        }

        if !observation.resource_up_to_date {
            cancellation.check()?;
            let update = handle.update(test_case).await?;
            self.publish(test_case, &update.connection_details).await?;
        }

        status.set_condition(Condition::available());
        status.set_condition(Condition::reconcile_success());
        status.observed_generation = Some(test_case.metadata.generation);

        Ok(Outcome::Complete)
    }

    /// Handle the external resource of a deleted test case, and release the test case.
    async fn removing(
        &self,
        handle: &ExternalHandle,
        test_case: &TestCase,
        status: &mut TestCaseStatus,
        exists: bool,
    ) -> Result<Outcome, ReconcileError> {
        let name = &test_case.metadata.name;
        status.set_condition(Condition::deleting());

        if exists && test_case.spec.deletion_policy == DeletionPolicy::Delete {
            match handle.delete(test_case).await {
                Ok(()) => {
                    status.set_condition(Condition::reconcile_success());
                    // wait for the test case to be gone
                    return Ok(Outcome::Retry);
                }
                Err(DeleteError::Unsupported) => {
                    let params = &test_case.spec.for_provider;
                    log::warn!(
                        "Unable to delete external test case {}/{}, orphaning it",
                        params.organization,
                        params.name
                    );
                    status.set_condition(
                        Condition::deleting().with_message("external test case was orphaned"),
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(target) = &test_case.spec.write_connection_secret_to_ref {
            self.store.unpublish_connection_details(target).await?;
        }

        let mut metadata = test_case.metadata.clone();
        if metadata.remove_finalizer(FINALIZER) {
            self.store
                .update_finalizers(name, metadata.finalizers)
                .await?;
        }

        log::info!("Released test case: {name}");

        Ok(Outcome::Complete)
    }

    async fn publish(
        &self,
        test_case: &TestCase,
        details: &ConnectionDetails,
    ) -> Result<(), ReconcileError> {
        if let Some(target) = &test_case.spec.write_connection_secret_to_ref {
            self.store
                .publish_connection_details(target, details)
                .await?;
        }
        Ok(())
    }
}
