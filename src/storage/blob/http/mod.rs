
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::storage::blob::BlobContainer;
use crate::{Result, StoreError};

/// Blob container behind a REST gateway:
/// `GET|PUT|DELETE {endpoint}/{container}/{name}` and
/// `GET {endpoint}/{container}?prefix=` returning `{"blobs": [...]}`
#[derive(Clone)]
pub struct HttpBlobContainer {
    base_url: Url,
    container: String,
    access_key: Option<String>,
    agent: ureq::Agent,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    blobs: Vec<String>,
}

enum Outcome {
    Body(Vec<u8>),
    Missing,
    PreconditionFailed,
}

impl std::fmt::Debug for HttpBlobContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBlobContainer")
            .field("base_url", &self.base_url.as_str())
            .field("container", &self.container)
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl HttpBlobContainer {
    #[inline]
    pub fn new(
        endpoint: &str,
        container: &str,
        access_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(endpoint).map_err(|e| {
            StoreError::Configuration(format!("invalid blob endpoint {}: {}", endpoint, e))
        })?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();

        Ok(Self {
            base_url,
            container: container.to_string(),
            access_key,
            agent,
        })
    }

    fn blob_url(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.container,
            name
        )
    }

    /// Runs a blocking request off the async runtime and classifies the status
    async fn send(
        &self,
        method: &'static str,
        url: String,
        body: Option<(Vec<u8>, bool)>,
    ) -> Result<Outcome> {
        let agent = self.agent.clone();
        let access_key = self.access_key.clone();
        let target = url.clone();

        let response = tokio::task::spawn_blocking(move || {
            let auth = access_key.map(|key| format!("Bearer {}", key));
            match (method, body) {
                ("PUT", Some((bytes, if_none_match))) => {
                    let mut request = agent
                        .put(&url)
                        .header("Content-Type", "application/json");
                    if let Some(auth) = &auth {
                        request = request.header("Authorization", auth);
                    }
                    if if_none_match {
                        request = request.header("If-None-Match", "*");
                    }
                    request.send(&bytes[..])
                }
                ("DELETE", _) => {
                    let mut request = agent.delete(&url);
                    if let Some(auth) = &auth {
                        request = request.header("Authorization", auth);
                    }
                    request.call()
                }
                _ => {
                    let mut request = agent.get(&url);
                    if let Some(auth) = &auth {
                        request = request.header("Authorization", auth);
                    }
                    request.call()
                }
            }
            .and_then(|mut response| {
                let status = response.status().as_u16();
                let body = response.body_mut().read_to_vec()?;
                Ok((status, body))
            })
        })
        .await
        .map_err(|e| StoreError::Other(anyhow::anyhow!("blob request task failed: {}", e)))?;

        let (status, body) = response.map_err(|e| classify_transport(method, &target, &e))?;
        debug!("{} {} -> {}", method, target, status);

        match status {
            200..=299 => Ok(Outcome::Body(body)),
            404 => Ok(Outcome::Missing),
            409 | 412 => Ok(Outcome::PreconditionFailed),
            408 | 429 | 500..=599 => Err(StoreError::transient(
                method,
                &target,
                format!("blob gateway returned HTTP {}", status),
            )),
            _ => Err(StoreError::Other(anyhow::anyhow!(
                "{} {} failed with HTTP {}",
                method,
                target,
                status
            ))),
        }
    }
}

fn classify_transport(method: &str, target: &str, error: &ureq::Error) -> StoreError {
    match error {
        ureq::Error::ConnectionFailed
        | ureq::Error::HostNotFound
        | ureq::Error::Timeout(_)
        | ureq::Error::Io(_) => StoreError::transient(method, target, error.to_string()),
        _ => StoreError::Other(anyhow::anyhow!("{} {} failed: {}", method, target, error)),
    }
}

#[async_trait]
impl BlobContainer for HttpBlobContainer {
    async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.send("GET", self.blob_url(name), None).await? {
            Outcome::Body(bytes) => Ok(Some(bytes)),
            Outcome::Missing => Ok(None),
            Outcome::PreconditionFailed => Err(StoreError::conflict(
                "get blob",
                name,
                "unexpected precondition failure",
            )),
        }
    }

    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        match self
            .send("PUT", self.blob_url(name), Some((bytes, false)))
            .await?
        {
            Outcome::Body(_) => Ok(()),
            Outcome::Missing => Err(StoreError::not_found("put blob", &self.container)),
            Outcome::PreconditionFailed => Err(StoreError::conflict(
                "put blob",
                name,
                "blob is leased by another writer",
            )),
        }
    }

    async fn create(&self, name: &str, bytes: Vec<u8>) -> Result<bool> {
        match self
            .send("PUT", self.blob_url(name), Some((bytes, true)))
            .await?
        {
            Outcome::Body(_) => Ok(true),
            Outcome::PreconditionFailed => Ok(false),
            Outcome::Missing => Err(StoreError::not_found("create blob", &self.container)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.send("DELETE", self.blob_url(name), None).await? {
            Outcome::Body(_) | Outcome::Missing => Ok(()),
            Outcome::PreconditionFailed => Err(StoreError::conflict(
                "delete blob",
                name,
                "blob is leased by another writer",
            )),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut url = Url::parse(&format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.container
        ))
        .map_err(|e| StoreError::Configuration(format!("invalid blob container url: {}", e)))?;
        url.query_pairs_mut().append_pair("prefix", prefix);

        match self.send("GET", url.to_string(), None).await? {
            Outcome::Body(bytes) => {
                let listing: ListResponse = serde_json::from_slice(&bytes).map_err(|e| {
                    StoreError::corrupt("list blobs", &self.container, e.to_string())
                })?;
                Ok(listing.blobs)
            }
            Outcome::Missing => Ok(Vec::new()),
            Outcome::PreconditionFailed => Err(StoreError::conflict(
                "list blobs",
                &self.container,
                "unexpected precondition failure",
            )),
        }
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.base_url, self.container)
    }
}
