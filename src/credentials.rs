use crate::error::ResolutionError;
use crate::resource::{CredentialsSource, ProviderConfig, ProviderCredentials};
use crate::store::ResourceStore;
use std::fmt::{Debug, Formatter};

/// Opaque secret material used to construct a client.
///
/// Never logged or serialized.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new<B: Into<Vec<u8>>>(data: B) -> Self {
        Self(data.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// The credentials as a token string, surrounding whitespace removed.
    pub fn token(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.0).map(str::trim)
    }
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credentials(***)")
    }
}

/// Resolves the credentials a provider config points to.
pub struct CredentialResolver<'s, S: ResourceStore + ?Sized> {
    store: &'s S,
}

impl<'s, S: ResourceStore + ?Sized> CredentialResolver<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, config: &ProviderConfig) -> Result<Credentials, ResolutionError> {
        let credentials = &config.spec.credentials;
        let data = match credentials.source {
            CredentialsSource::None => return Ok(Credentials::new(Vec::new())),
            CredentialsSource::Secret => self.secret_data(credentials).await?,
            CredentialsSource::Environment => env_data(credentials)?,
            CredentialsSource::Filesystem => fs_data(credentials).await?,
        };

        if data.is_empty() {
            return Err(ResolutionError::CredentialExtractionFailed(format!(
                "credentials of ProviderConfig {} are empty",
                config.metadata.name
            )));
        }

        Ok(Credentials::new(data))
    }

    async fn secret_data(
        &self,
        credentials: &ProviderCredentials,
    ) -> Result<Vec<u8>, ResolutionError> {
        let selector = credentials.secret_ref.as_ref().ok_or_else(|| {
            ResolutionError::CredentialExtractionFailed(
                "no secret reference was provided".to_string(),
            )
        })?;

        let secret = self
            .store
            .get_secret(&selector.namespace, &selector.name)
            .await
            .map_err(ResolutionError::Store)?
            .ok_or_else(|| ResolutionError::ConfigNotFound {
                namespace: selector.namespace.clone(),
                name: selector.name.clone(),
            })?;

        let value = secret.data.get(&selector.key).ok_or_else(|| {
            ResolutionError::CredentialExtractionFailed(format!(
                "secret {}/{} has no key '{}'",
                selector.namespace, selector.name, selector.key
            ))
        })?;

        base64::decode(value.trim()).map_err(|err| {
            ResolutionError::CredentialExtractionFailed(format!(
                "failed to decode key '{}' of secret {}/{}: {err}",
                selector.key, selector.namespace, selector.name
            ))
        })
    }
}

fn env_data(credentials: &ProviderCredentials) -> Result<Vec<u8>, ResolutionError> {
    let selector = credentials.env.as_ref().ok_or_else(|| {
        ResolutionError::CredentialExtractionFailed(
            "no environment variable was provided".to_string(),
        )
    })?;

    std::env::var(&selector.name)
        .map(String::into_bytes)
        .map_err(|err| {
            ResolutionError::CredentialExtractionFailed(format!(
                "failed to read environment variable {}: {err}",
                selector.name
            ))
        })
}

async fn fs_data(credentials: &ProviderCredentials) -> Result<Vec<u8>, ResolutionError> {
    let selector = credentials.fs.as_ref().ok_or_else(|| {
        ResolutionError::CredentialExtractionFailed("no filesystem path was provided".to_string())
    })?;

    tokio::fs::read(&selector.path).await.map_err(|err| {
        ResolutionError::CredentialExtractionFailed(format!(
            "failed to read {}: {err}",
            selector.path
        ))
    })
}
