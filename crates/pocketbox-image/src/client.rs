//! Docker Registry v2 API client.
//!
//! A client is bound to one endpoint (a mirror or a registry host). Tokens
//! obtained through the bearer challenge flow are cached twice: per
//! repository for the lifetime of the client, and per token URL in the
//! persistent [`TokenCache`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use pocketbox_common::constants::USER_AGENT;
use pocketbox_common::error::{PocketboxError, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::auth::{AuthChallenge, TokenCache, TokenResponse};
use crate::manifest::{
    ACCEPT_MANIFEST, Descriptor, ImageConfigBlob, ImageManifest, ManifestList,
    is_index_media_type, select_platform_manifest,
};
use crate::reference::ImageReference;

/// A registry base URL plus an optional preconfigured bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Base URL without trailing slash.
    pub url: String,
    /// Token used instead of the challenge flow.
    pub bearer_token: Option<String>,
}

impl Endpoint {
    /// Creates an endpoint without a preconfigured token.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            bearer_token: None,
        }
    }
}

/// Timeouts applied by a [`RegistryClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimeouts {
    /// Timeout of API calls (ping, token, manifest, config).
    pub request: Duration,
    /// Timeout of one layer download.
    pub download: Duration,
}

#[derive(Debug, Deserialize)]
struct ManifestProbe {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

/// Registry client for the Docker Registry v2 API.
#[derive(Debug)]
pub struct RegistryClient {
    http: Client,
    endpoint: Endpoint,
    tokens: TokenCache,
    timeouts: ClientTimeouts,
    architecture: String,
    os: String,
    sessions: RwLock<HashMap<String, String>>,
}

impl RegistryClient {
    /// Creates a client bound to `endpoint`, targeting `architecture`/`os`
    /// when resolving manifest lists.
    ///
    /// # Errors
    ///
    /// Returns [`PocketboxError::Network`] if the HTTP client cannot be built.
    pub fn new(
        endpoint: Endpoint,
        tokens: TokenCache,
        timeouts: ClientTimeouts,
        architecture: impl Into<String>,
        os: impl Into<String>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeouts.request)
            .build()
            .map_err(|e| PocketboxError::Network {
                url: endpoint.url.clone(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            endpoint,
            tokens,
            timeouts,
            architecture: architecture.into(),
            os: os.into(),
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Obtains a pull token for `repository`.
    ///
    /// Returns the preconfigured mirror token if there is one, an empty
    /// string for registries that allow anonymous access, and otherwise a
    /// token from the challenge's realm (served from cache when unexpired).
    ///
    /// # Errors
    ///
    /// Fails on network errors, a missing or unparsable challenge, or a
    /// token endpoint that does not answer with a token.
    #[tracing::instrument(skip(self), fields(registry = %self.endpoint.url))]
    pub async fn authenticate(&self, repository: &str) -> Result<String> {
        if let Some(token) = &self.endpoint.bearer_token {
            return Ok(token.clone());
        }

        let ping_url = format!("{}/v2/", self.endpoint.url);
        let response = self
            .send(&ping_url, self.http.get(&ping_url).timeout(self.timeouts.request))
            .await?;
        if response.status() == StatusCode::OK {
            tracing::debug!("registry allows anonymous access");
            return Ok(String::new());
        }

        let challenge_header = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| PocketboxError::Integrity {
                message: format!(
                    "{ping_url} answered {} without a WWW-Authenticate header",
                    response.status()
                ),
            })?;
        let challenge = AuthChallenge::parse(challenge_header)?;
        let auth_url = challenge.token_url(repository);

        if let Some(token) = self.tokens.get(&auth_url)? {
            tracing::debug!("using cached registry token");
            return Ok(token);
        }

        let response = self
            .send(&auth_url, self.http.get(&auth_url).timeout(self.timeouts.request))
            .await?;
        let body: TokenResponse = read_json(&auth_url, response).await?;
        let (token, expires_in) = body.into_token()?;
        self.tokens.put(&auth_url, &token, expires_in)?;
        tracing::debug!(expires_in = ?expires_in, "obtained registry token");
        Ok(token)
    }

    /// Resolves the single-platform manifest for `reference`.
    ///
    /// Manifest lists and OCI indexes are resolved to the entry matching the
    /// client's target platform, which is then fetched by digest.
    ///
    /// # Errors
    ///
    /// Fails on network errors, unexpected statuses, malformed JSON, or an
    /// empty manifest list.
    #[tracing::instrument(skip(self, reference), fields(reference = %reference))]
    pub async fn get_manifest(&self, reference: &ImageReference) -> Result<ImageManifest> {
        let (media_type, body) = self.fetch_manifest(reference, &reference.tag).await?;
        let probe: ManifestProbe = parse_json("manifest", &body)?;
        let is_index = is_index_media_type(&media_type)
            || probe.media_type.as_deref().is_some_and(is_index_media_type)
            || probe.manifests.is_some();
        if !is_index {
            return parse_json("manifest", &body);
        }

        let list: ManifestList = parse_json("manifest list", &body)?;
        let chosen = select_platform_manifest(&list, &self.architecture, &self.os)?;
        tracing::debug!(
            digest = %chosen.digest,
            candidates = list.manifests.len(),
            "selected platform manifest"
        );
        let (_, body) = self.fetch_manifest(reference, &chosen.digest).await?;
        parse_json("manifest", &body)
    }

    /// Fetches and parses the image configuration blob.
    ///
    /// # Errors
    ///
    /// Fails on network errors, unexpected statuses, or malformed JSON.
    pub async fn get_image_config(
        &self,
        reference: &ImageReference,
        digest: &str,
    ) -> Result<ImageConfigBlob> {
        let url = self.blob_url(reference, digest);
        let response = self
            .get_authorized(reference, &url, None, self.timeouts.request)
            .await?;
        let body = read_body(&url, response).await?;
        parse_json("image config", &body)
    }

    /// Streams a layer blob into `dest`, reporting `(downloaded, total)`
    /// after every chunk. Returns the number of bytes written.
    ///
    /// `total` is the response's content length, or the manifest size when
    /// the server sends none.
    ///
    /// # Errors
    ///
    /// Fails on network errors, unexpected statuses, or write failures.
    pub async fn download_layer<F>(
        &self,
        reference: &ImageReference,
        layer: &Descriptor,
        dest: &Path,
        mut on_progress: F,
    ) -> Result<u64>
    where
        F: FnMut(u64, u64) + Send,
    {
        let url = self.blob_url(reference, &layer.digest);
        let response = self
            .get_authorized(reference, &url, None, self.timeouts.download)
            .await?;
        let response = check_status(&url, response)?;
        let total = response.content_length().unwrap_or(layer.size);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PocketboxError::io(parent, e))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| PocketboxError::io(dest, e))?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| network_error(&url, &e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| PocketboxError::io(dest, e))?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }
        file.flush().await.map_err(|e| PocketboxError::io(dest, e))?;

        tracing::debug!(digest = %layer.digest, bytes = downloaded, "layer downloaded");
        Ok(downloaded)
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        tag_or_digest: &str,
    ) -> Result<(String, Vec<u8>)> {
        let url = format!(
            "{}/v2/{}/manifests/{tag_or_digest}",
            self.endpoint.url, reference.repository
        );
        let response = self
            .get_authorized(reference, &url, Some(ACCEPT_MANIFEST), self.timeouts.request)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PocketboxError::NotFound {
                kind: "manifest",
                id: reference.with_tag(tag_or_digest).to_string(),
            });
        }
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = read_body(&url, response).await?;
        Ok((media_type, body))
    }

    async fn get_authorized(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: Option<&str>,
        timeout: Duration,
    ) -> Result<Response> {
        let token = self.session_token(&reference.repository).await?;
        let mut request = self.http.get(url).timeout(timeout);
        if !token.is_empty() {
            request = request.bearer_auth(&token);
        }
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }
        self.send(url, request).await
    }

    async fn session_token(&self, repository: &str) -> Result<String> {
        if let Some(token) = self.sessions.read().await.get(repository) {
            return Ok(token.clone());
        }
        let token = self.authenticate(repository).await?;
        let _ = self
            .sessions
            .write()
            .await
            .insert(repository.to_string(), token.clone());
        Ok(token)
    }

    fn blob_url(&self, reference: &ImageReference, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{digest}",
            self.endpoint.url, reference.repository
        )
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<Response> {
        tracing::trace!(url, "registry request");
        request.send().await.map_err(|e| network_error(url, &e))
    }
}

fn network_error(url: &str, e: &reqwest::Error) -> PocketboxError {
    let message = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    };
    PocketboxError::Network {
        url: url.to_string(),
        message,
    }
}

fn check_status(url: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(PocketboxError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

async fn read_body(url: &str, response: Response) -> Result<Vec<u8>> {
    let body = check_status(url, response)?
        .bytes()
        .await
        .map_err(|e| network_error(url, &e))?;
    Ok(body.to_vec())
}

async fn read_json<T: DeserializeOwned>(url: &str, response: Response) -> Result<T> {
    let body = read_body(url, response).await?;
    parse_json("response", &body)
}

fn parse_json<T: DeserializeOwned>(what: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| PocketboxError::Integrity {
        message: format!("malformed {what}: {e}"),
    })
}
