//! Registry v2 tag resolution.
//!
//! Maps a floating base tag (e.g. `latest`) to the concrete version tag
//! whose manifest digest matches it. Digests are compared at the manifest
//! list / OCI index level so the comparison is architecture-agnostic.

use crate::config::ImageTarget;
use crate::image_reference::{DEFAULT_REGISTRY, ImageReference};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

static DEFAULT_AUTH_URL: &str = "https://auth.docker.io/token";

/// Accept header listing manifest-list/index media types ahead of single
/// manifests, so `Docker-Content-Digest` names the multi-arch digest.
const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.docker.distribution.manifest.list.v2+json,",
    "application/vnd.docker.distribution.manifest.v2+json,",
    "application/vnd.oci.image.index.v1+json,",
    "application/vnd.oci.image.manifest.v1+json"
);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on concurrent per-tag digest fetches, to be polite to
/// registries.
const MAX_DIGEST_WORKERS: usize = 10;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0}")]
    NotFound(String),
    #[error("registry authorization failed: {0}")]
    Auth(String),
    #[error("registry request failed: {0}")]
    Network(#[from] reqwest::Error),
}

/// The version tag currently carrying the base tag's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVersion {
    pub tag: String,
    pub digest: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct RegistryResolver {
    client: Client,
}

impl RegistryResolver {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("tagwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build registry HTTP client")?;
        Ok(Self { client })
    }

    /// Resolves which regex-matched version tag currently shares the base
    /// tag's digest, falling back to the lexicographically greatest match
    /// when no digest comparison is possible.
    pub async fn resolve(&self, target: &ImageTarget) -> Result<ResolvedVersion, ResolveError> {
        let mut reference = ImageReference::parse(&target.image)
            .map_err(|e| ResolveError::NotFound(e.to_string()))?;
        if let Some(registry) = &target.registry {
            reference.registry = registry.clone();
        }
        let base_url = registry_base_url(&reference.registry);

        let token = self.fetch_token(&base_url, &reference).await;

        let base_digest = self
            .manifest_digest(&base_url, &reference, &target.base_tag, token.as_deref())
            .await;
        if base_digest.is_none() {
            warn!(
                "Could not get digest for {}:{}, falling back to newest matching tag",
                target.image, target.base_tag
            );
        }

        let tags = self
            .list_tags(&base_url, &reference, token.as_deref())
            .await?;

        let mut matching: Vec<String> = tags
            .into_iter()
            .filter(|tag| target.regex.is_match(tag))
            .collect();
        debug!("Found {} tags matching pattern", matching.len());
        if matching.is_empty() {
            return Err(ResolveError::NotFound(format!(
                "no tags matching pattern '{}' for {}",
                target.regex.as_str(),
                target.image
            )));
        }

        // Newest versions typically sort last alphabetically; reverse puts
        // them first so the digest race usually hits early.
        matching.sort_unstable_by(|a, b| b.cmp(a));

        if let Some(base_digest) = &base_digest {
            let base_url = &base_url;
            let reference = &reference;
            let token = token.as_deref();
            let workers = matching.len().min(MAX_DIGEST_WORKERS);
            // Owned tags keep the per-tag futures free of short-lived
            // borrows, so the whole resolve future stays Send.
            let mut digests = stream::iter(matching.clone().into_iter().map(|tag| async move {
                let digest = self.manifest_digest(base_url, reference, &tag, token).await;
                (tag, digest)
            }))
            .buffer_unordered(workers);

            while let Some((tag, digest)) = digests.next().await {
                if digest.as_deref() == Some(base_digest.as_str()) {
                    debug!("Found matching tag {} with digest {}", tag, base_digest);
                    // Dropping the stream abandons the remaining in-flight
                    // fetches; any tag with an equal digest is equally valid.
                    return Ok(ResolvedVersion {
                        tag,
                        digest: base_digest.clone(),
                    });
                }
            }

            warn!(
                "No tag matching pattern '{}' shares a digest with {}:{}, falling back to newest",
                target.regex.as_str(),
                target.image,
                target.base_tag
            );
        }

        // Known limitation: lexicographic order misorders components of
        // differing digit width ("3.9.0" sorts after "3.10.0"). The primary
        // path is digest equality; this only picks the candidate when no
        // digest comparison was possible.
        let fallback = matching.swap_remove(0);
        match self
            .manifest_digest(&base_url, &reference, &fallback, token.as_deref())
            .await
        {
            Some(digest) => {
                info!(
                    "Resolved {}:{} to {} by fallback ordering",
                    target.image, target.base_tag, fallback
                );
                Ok(ResolvedVersion {
                    tag: fallback,
                    digest,
                })
            }
            None => Err(ResolveError::NotFound(format!(
                "could not fetch digest for {}:{}",
                target.image, fallback
            ))),
        }
    }

    /// Exchanges for a pull-scoped bearer token. Failure is not fatal:
    /// public registries accept unauthenticated reads, so this logs and
    /// returns `None` instead of erroring.
    async fn fetch_token(&self, base_url: &str, reference: &ImageReference) -> Option<String> {
        let auth_url = auth_endpoint(base_url, reference);
        let response = match self.client.get(&auth_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Error getting token for {}/{}: {}",
                    reference.namespace, reference.repository, e
                );
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(
                "Token endpoint for {} returned status {}, continuing unauthenticated",
                reference.registry,
                response.status()
            );
            return None;
        }
        match response.json::<TokenResponse>().await {
            Ok(body) => body.token,
            Err(e) => {
                warn!("Invalid token response from {}: {}", reference.registry, e);
                None
            }
        }
    }

    /// Fetches a tag's manifest digest with a HEAD request. No body is
    /// transferred, and `Docker-Content-Digest` names the manifest-list
    /// digest for multi-arch images, which is what cross-tag comparison
    /// needs.
    async fn manifest_digest(
        &self,
        base_url: &str,
        reference: &ImageReference,
        tag: &str,
        token: Option<&str>,
    ) -> Option<String> {
        let url = format!(
            "{}/v2/{}/{}/manifests/{}",
            base_url, reference.namespace, reference.repository, tag
        );

        let mut request = self.client.head(&url).header(ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Error getting manifest digest for {}: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(
                "Manifest HEAD for {}:{} returned status {}",
                reference.repository,
                tag,
                response.status()
            );
            return None;
        }

        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    }

    async fn list_tags(
        &self,
        base_url: &str,
        reference: &ImageReference,
        token: Option<&str>,
    ) -> Result<Vec<String>, ResolveError> {
        let url = format!(
            "{}/v2/{}/{}/tags/list",
            base_url, reference.namespace, reference.repository
        );

        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ResolveError::Auth(format!(
                    "tag listing for {}/{} denied with status {}",
                    reference.namespace,
                    reference.repository,
                    response.status()
                )));
            }
            StatusCode::NOT_FOUND => {
                return Err(ResolveError::NotFound(format!(
                    "repository {}/{} not found on {}",
                    reference.namespace, reference.repository, reference.registry
                )));
            }
            _ => {}
        }
        let response = response.error_for_status()?;

        let body: TagList = response.json().await?;
        Ok(body.tags.unwrap_or_default())
    }
}

/// Base URL for a registry host. Local registries (`localhost`, loopback)
/// are reached over plain HTTP since they carry no TLS; an explicit scheme
/// in a registry override passes through untouched.
fn registry_base_url(registry: &str) -> String {
    if registry.starts_with("http://") || registry.starts_with("https://") {
        registry.trim_end_matches('/').to_string()
    } else if registry == "localhost"
        || registry.starts_with("localhost:")
        || registry.starts_with("127.0.0.1")
    {
        format!("http://{}", registry)
    } else {
        format!("https://{}", registry)
    }
}

/// Registry-specific bearer auth endpoints: Docker Hub has its own, a small
/// set of known hosts delegate to the ghcr authority, anything else gets the
/// generic per-host pattern.
fn auth_endpoint(base_url: &str, reference: &ImageReference) -> String {
    let scope = format!(
        "repository:{}/{}:pull",
        reference.namespace, reference.repository
    );
    match reference.registry.as_str() {
        r if r == DEFAULT_REGISTRY => {
            format!(
                "{}?service=registry.docker.io&scope={}",
                DEFAULT_AUTH_URL, scope
            )
        }
        "ghcr.io" | "lscr.io" => {
            format!("https://ghcr.io/token?service=ghcr.io&scope={}", scope)
        }
        registry => format!("{}/v2/auth?service={}&scope={}", base_url, registry, scope),
    }
}
