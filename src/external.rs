use crate::client::ExternalClient;
use crate::error::{CreateError, DeleteError, QueryError, UpdateError};
use crate::resource::{ConnectionDetails, TestCase};
use std::fmt::Debug;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalObservation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
    pub connection_details: ConnectionDetails,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalCreation {
    pub connection_details: ConnectionDetails,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalUpdate {
    pub connection_details: ConnectionDetails,
}

/// Decides if an existing external resource still matches the desired state.
pub trait DriftDetector: Debug + Send + Sync {
    fn is_up_to_date(&self, desired: &TestCase) -> bool;
}

/// Treats every existing test case as up to date.
///
/// This is a placeholder: nothing is compared against the external test case, so changes to the
/// desired state of an existing test case are never propagated.
#[derive(Clone, Copy, Debug, Default)]
pub struct AssumeUpToDate;

impl DriftDetector for AssumeUpToDate {
    fn is_up_to_date(&self, _: &TestCase) -> bool {
        true
    }
}

/// Handle to the external system, valid for a single reconciliation pass.
#[derive(Debug)]
pub struct ExternalHandle {
    client: Box<dyn ExternalClient>,
    drift: Arc<dyn DriftDetector>,
}

impl ExternalHandle {
    pub fn new(client: Box<dyn ExternalClient>, drift: Arc<dyn DriftDetector>) -> Self {
        Self { client, drift }
    }

    pub async fn observe(&self, desired: &TestCase) -> Result<ExternalObservation, QueryError> {
        let params = &desired.spec.for_provider;
        let exists = self
            .client
            .exists(&params.organization, &params.name)
            .await?;

        log::debug!(
            "Observed {}/{}: exists: {exists}",
            params.organization,
            params.name
        );

        Ok(ExternalObservation {
            resource_exists: exists,
            resource_up_to_date: exists && self.drift.is_up_to_date(desired),
            connection_details: ConnectionDetails::new(),
        })
    }

    pub async fn create(&self, desired: &TestCase) -> Result<ExternalCreation, CreateError> {
        let params = &desired.spec.for_provider;
        log::info!("Creating test case: {}/{}", params.organization, params.name);

        self.client
            .create(
                &params.organization,
                &params.name,
                params.test_case_file.as_deref(),
            )
            .await?;

        Ok(ExternalCreation::default())
    }

    pub async fn update(&self, desired: &TestCase) -> Result<ExternalUpdate, UpdateError> {
        let params = &desired.spec.for_provider;
        log::info!("Updating test case: {}/{}", params.organization, params.name);

        self.client
            .update(
                &params.organization,
                &params.name,
                params.test_case_file.as_deref(),
            )
            .await?;

        Ok(ExternalUpdate::default())
    }

    pub async fn delete(&self, desired: &TestCase) -> Result<(), DeleteError> {
        let params = &desired.spec.for_provider;
        log::info!("Deleting test case: {}/{}", params.organization, params.name);

        self.client
            .delete(&params.organization, &params.name)
            .await
    }
}
