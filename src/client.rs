use crate::credentials::Credentials;
use crate::error::{
    CommandError, CreateError, DeleteError, QueryError, UnreachableError, UpdateError,
};
use async_trait::async_trait;
use std::ffi::OsStr;
use std::fmt::Debug;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::instrument;

/// The verbs the reconciler needs from the external system.
///
/// Every call is a single request against the external system. Transports (CLI, HTTP, ...) only
/// need to implement this trait.
#[async_trait]
pub trait ExternalClient: Debug + Send + Sync {
    async fn health_check(&self) -> Result<(), UnreachableError>;

    /// Check if a test case named `name` exists in the scope of `organization`.
    ///
    /// An error means the state is unknown, not that the test case is absent.
    async fn exists(&self, organization: &str, name: &str) -> Result<bool, QueryError>;

    /// Create a test case. Must only be called when the test case doesn't exist.
    async fn create(
        &self,
        organization: &str,
        name: &str,
        definition: Option<&str>,
    ) -> Result<(), CreateError>;

    async fn update(
        &self,
        _organization: &str,
        _name: &str,
        _definition: Option<&str>,
    ) -> Result<(), UpdateError> {
        Err(UpdateError::Unsupported)
    }

    async fn delete(&self, _organization: &str, _name: &str) -> Result<(), DeleteError> {
        Err(DeleteError::Unsupported)
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct TestCaseList {
    pub data: Vec<TestCaseRecord>,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct TestCaseRecord {
    pub id: String,
    pub attributes: TestCaseAttributes,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct TestCaseAttributes {
    pub name: String,
    #[serde(default)]
    pub scope: String,
}

/// Parse the output of listing test cases.
///
/// Empty output is an error, as is anything not carrying a `data` array.
pub fn parse_list(output: &[u8]) -> Result<TestCaseList, QueryError> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Err(QueryError::Empty);
    }
    serde_json::from_slice(output).map_err(QueryError::Malformed)
}

impl TestCaseList {
    pub fn contains(&self, name: &str) -> bool {
        self.data.iter().any(|r| r.attributes.name == name)
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ForgeConfig {
    /// The forge binary
    #[serde(default = "default::binary")]
    pub binary: String,

    /// Test case definition used when a test case doesn't provide one
    #[serde(default = "default::definition")]
    pub definition: String,

    /// Environment variable passing the token to the forge process
    #[serde(default = "default::token_env")]
    pub token_env: String,

    /// Timeout of a single forge invocation
    #[serde(default = "default::timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

mod default {
    use std::time::Duration;

    pub fn binary() -> String {
        "forge".to_string()
    }

    pub fn definition() -> String {
        "examples/sample/loadtest.mjs".to_string()
    }

    pub fn token_env() -> String {
        "STORMFORGE_TOKEN".to_string()
    }

    pub const fn timeout() -> Duration {
        Duration::from_secs(60)
    }
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            binary: default::binary(),
            definition: default::definition(),
            token_env: default::token_env(),
            timeout: default::timeout(),
        }
    }
}

/// Client running the `forge` command line tool.
#[derive(Clone)]
pub struct ForgeClient {
    config: ForgeConfig,
    token: String,
}

impl Debug for ForgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgeClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ForgeClient {
    pub fn new(config: ForgeConfig, credentials: Credentials) -> anyhow::Result<Self> {
        let token = credentials
            .token()
            .map_err(|_| anyhow::anyhow!("token is not valid UTF-8"))?
            .to_string();
        Ok(Self { config, token })
    }

    async fn run<I, S>(&self, args: I) -> Result<Vec<u8>, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args).kill_on_drop(true);
        if !self.token.is_empty() {
            cmd.env(&self.config.token_env, &self.token);
        }

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| CommandError::Timeout(self.config.timeout))?
            .map_err(CommandError::Spawn)?;

        check_output(output)
    }
}

fn check_output(output: Output) -> Result<Vec<u8>, CommandError> {
    log::debug!(
        "Command result: {}, {} bytes of output",
        output.status,
        output.stdout.len()
    );

    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(CommandError::Status {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl ExternalClient for ForgeClient {
    #[instrument(skip_all, err)]
    async fn health_check(&self) -> Result<(), UnreachableError> {
        let output = self.run(["ping"]).await.map_err(UnreachableError)?;
        log::debug!("Ping: {}", String::from_utf8_lossy(&output).trim());
        Ok(())
    }

    #[instrument(skip(self), ret, err)]
    async fn exists(&self, organization: &str, name: &str) -> Result<bool, QueryError> {
        let output = self
            .run(["--output", "json", "test-case", "list", organization])
            .await
            .map_err(QueryError::Command)?;

        Ok(parse_list(&output)?.contains(name))
    }

    #[instrument(skip(self), err)]
    async fn create(
        &self,
        organization: &str,
        name: &str,
        definition: Option<&str>,
    ) -> Result<(), CreateError> {
        if organization.is_empty() || name.is_empty() {
            return Err(CreateError::Invalid(
                "organization and name must not be empty".to_string(),
            ));
        }

        let definition = definition.unwrap_or(&self.config.definition);
        let target = format!("{organization}/{name}");
        let output = self
            .run(["test-case", "create", target.as_str(), definition])
            .await
            .map_err(CreateError::Command)?;

        log::info!("Created: {}", String::from_utf8_lossy(&output).trim());

        Ok(())
    }
}
