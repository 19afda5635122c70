use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MedStoreError;
use crate::transfer::RetryPolicy;

/// Default API endpoint used when no URL is configured.
pub const DEFAULT_URL: &str = "https://preview.medstore.io";

/// Default bound on simultaneous series exports.
pub const MAX_CONCURRENCY: usize = 30;
/// Largest number of files for which presigned URLs are requested at once.
pub const MAX_FILE_BATCH_SIZE: usize = 1000;
/// Default bound on simultaneous file uploads.
pub const MAX_UPLOAD_CONCURRENCY: usize = 5;
/// Default listing page size for query/export pagination.
pub const EXPORT_PAGE_SIZE: usize = 50;
/// Attempt budget shared by the GraphQL client and file transfers.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;
/// Per-request timeout for GraphQL calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Explicit client configuration threaded through the transport and the
/// pipelines. There is intentionally no process-wide settings singleton.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub api_key: String,
    pub secret_key: String,
    pub verify_ssl: bool,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Self, MedStoreError> {
        let api_key = api_key.into();
        let secret_key = secret_key.into();
        if api_key.trim().is_empty() || secret_key.trim().is_empty() {
            return Err(MedStoreError::Config(
                "API key and secret key must not be empty".into(),
            ));
        }
        let url = url.into();
        Ok(ClientConfig {
            url: if url.trim().is_empty() {
                DEFAULT_URL.into()
            } else {
                url
            },
            api_key,
            secret_key,
            verify_ssl: true,
            request_timeout: REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        })
    }

    /// Build a configuration from `MEDSTORE_API_KEY`, `MEDSTORE_SECRET_KEY`
    /// and (optionally) `MEDSTORE_URL`.
    pub fn from_env() -> Result<Self, MedStoreError> {
        let api_key = env::var("MEDSTORE_API_KEY")
            .map_err(|_| MedStoreError::Config("MEDSTORE_API_KEY is not set".into()))?;
        let secret_key = env::var("MEDSTORE_SECRET_KEY")
            .map_err(|_| MedStoreError::Config("MEDSTORE_SECRET_KEY is not set".into()))?;
        let url = env::var("MEDSTORE_URL").unwrap_or_else(|_| DEFAULT_URL.into());
        ClientConfig::new(api_key, secret_key, url)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }
}

/// One stored credentials profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub api_key: String,
    pub secret_key: String,
    pub org_id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// The `~/.medstore/credentials` TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
}

impl CredentialsFile {
    pub fn default_path() -> Result<PathBuf, MedStoreError> {
        let home = dirs::home_dir()
            .ok_or_else(|| MedStoreError::Config("could not determine home directory".into()))?;
        Ok(home.join(".medstore").join("credentials"))
    }

    pub fn load(path: &PathBuf) -> Result<Self, MedStoreError> {
        if !path.is_file() {
            return Ok(CredentialsFile::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|err| {
            MedStoreError::Config(format!("malformed credentials file {}: {err}", path.display()))
        })
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), MedStoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|err| MedStoreError::Config(format!("could not encode credentials: {err}")))?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_keys() {
        assert!(ClientConfig::new("", "secret", "").is_err());
        assert!(ClientConfig::new("key", " ", "").is_err());
    }

    #[test]
    fn defaults_url_when_blank() {
        let config = ClientConfig::new("key", "secret", "").unwrap();
        assert_eq!(config.url, DEFAULT_URL);
        assert!(config.verify_ssl);
    }

    #[test]
    fn credentials_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials");
        let mut creds = CredentialsFile::default();
        creds.profiles.insert(
            "default".into(),
            Profile {
                api_key: "key".into(),
                secret_key: "secret".into(),
                org_id: "org".into(),
                url: None,
            },
        );
        creds.save(&path).unwrap();
        let loaded = CredentialsFile::load(&path).unwrap();
        assert_eq!(loaded.profile("default").unwrap().api_key, "key");
    }
}
