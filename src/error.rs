use std::process::ExitStatus;
use std::time::Duration;

/// Failure of the declarative store backing test cases, provider configs and secrets.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("object not found: {kind}/{name}")]
    NotFound { kind: &'static str, name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("credential source object not found: {namespace}/{name}")]
    ConfigNotFound { namespace: String, name: String },
    #[error("failed to extract credentials: {0}")]
    CredentialExtractionFailed(String),
    #[error("failed to read credential source")]
    Store(#[source] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("cannot track ProviderConfig usage")]
    TrackingFailed(#[source] StoreError),
    #[error("ProviderConfig not found: {0}")]
    ConfigNotFound(String),
    #[error("cannot get ProviderConfig {name}")]
    ConfigLookupFailed {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("cannot get credentials")]
    CredentialResolutionFailed(#[source] ResolutionError),
    #[error("cannot create new client")]
    NewClient(#[source] anyhow::Error),
}

/// Failure of a single external command invocation.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn command")]
    Spawn(#[source] std::io::Error),
    #[error("command exited with {status}: {stderr}")]
    Status { status: ExitStatus, stderr: String },
    #[error("command timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
#[error("external system unreachable")]
pub struct UnreachableError(#[source] pub CommandError);

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("list command failed")]
    Command(#[source] CommandError),
    #[error("list command returned no output")]
    Empty,
    #[error("malformed list response")]
    Malformed(#[source] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("create command failed")]
    Command(#[source] CommandError),
    #[error("invalid create request: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("updating test cases is not supported by this client")]
    Unsupported,
    #[error("update command failed")]
    Command(#[source] CommandError),
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("deleting test cases is not supported by this client")]
    Unsupported,
    #[error("delete command failed")]
    Command(#[source] CommandError),
}

/// Outcome of a failed reconciliation pass, scoped to a single test case.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("connect failed")]
    Connect(#[from] ConnectError),
    #[error("observe failed")]
    Observe(#[from] QueryError),
    #[error("create failed")]
    Create(#[from] CreateError),
    #[error("update failed")]
    Update(#[from] UpdateError),
    #[error("delete failed")]
    Delete(#[from] DeleteError),
    #[error("store operation failed")]
    Store(#[from] StoreError),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconcileError {
    /// Condition reason reported on the test case status.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Connect(_) => "ConnectFailed",
            Self::Observe(_) => "ObserveFailed",
            Self::Create(_) => "CreateFailed",
            Self::Update(_) => "UpdateFailed",
            Self::Delete(_) => "DeleteFailed",
            Self::Store(_) => "StoreFailed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Full message, including the chain of sources.
    pub fn message(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(s) = source {
            message.push_str(": ");
            message.push_str(&s.to_string());
            source = s.source();
        }
        message
    }
}
