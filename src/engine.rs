//! Container engine API client over the local Unix domain socket.
//!
//! Opens one fresh connection per call: the socket is local, so the overhead
//! is negligible and stale-connection errors are avoided entirely. JSON
//! request/response for everything except image pulls, which stream
//! newline-delimited JSON progress objects.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::debug;

/// Engine API version prefix. Compatible with Docker 20.10+.
const API_PREFIX: &str = "/v1.41";

const DEFAULT_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Timeout for ordinary metadata calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for image pulls, which can transfer gigabytes.
const PULL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("engine socket I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("engine HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid engine request: {0}")]
    Request(#[from] hyper::http::Error),
    #[error("invalid engine response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// HTTP status of an API-level error, if that is what this is.
    pub fn status(&self) -> Option<u16> {
        match self {
            EngineError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct EngineClient {
    socket_path: PathBuf,
}

impl EngineClient {
    /// Client for the socket named by `DOCKER_HOST` (a `unix://` URL),
    /// falling back to the standard location.
    pub fn new() -> Self {
        let socket_path = match std::env::var("DOCKER_HOST") {
            Ok(host) if !host.is_empty() => {
                PathBuf::from(host.strip_prefix("unix://").unwrap_or(&host))
            }
            _ => PathBuf::from(DEFAULT_SOCKET_PATH),
        };
        Self { socket_path }
    }

    pub fn with_socket(path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Sends a request and returns the raw status and body, without mapping
    /// error statuses. Used directly by the streaming pull path.
    async fn request_raw(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(StatusCode, Bytes), EngineError> {
        let call = async {
            let stream = UnixStream::connect(&self.socket_path).await?;
            let io = TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Engine connection closed: {}", e);
                }
            });

            let uri = format!("http://localhost{}{}", API_PREFIX, path_and_query);
            let builder = Request::builder()
                .method(method)
                .uri(uri)
                .header(HOST, "localhost");
            let request = match body {
                Some(bytes) => builder
                    .header(CONTENT_TYPE, "application/json")
                    .body(Full::new(Bytes::from(bytes)))?,
                None => builder.body(Full::new(Bytes::new()))?,
            };

            let response = sender.send_request(request).await?;
            let status = response.status();
            let bytes = response.into_body().collect().await?.to_bytes();
            Ok::<_, EngineError>((status, bytes))
        };

        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    /// Sends a request, mapping 4xx/5xx to [`EngineError::Api`] with the
    /// engine-supplied message.
    async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Bytes, EngineError> {
        let (status, bytes) = self
            .request_raw(method, path_and_query, body, timeout)
            .await?;

        if status.is_client_error() || status.is_server_error() {
            let raw = String::from_utf8_lossy(&bytes);
            let message = serde_json::from_str::<ErrorBody>(&raw)
                .map(|e| e.message)
                .unwrap_or_else(|_| raw.trim().to_string());
            return Err(EngineError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(bytes)
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, EngineError> {
        let bytes = self
            .request(method, path_and_query, body, REQUEST_TIMEOUT)
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn request_empty(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.request(method, path_and_query, body, timeout).await?;
        Ok(())
    }

    /// Pulls `image:tag` from its registry.
    ///
    /// The engine streams NDJSON progress objects and reports mid-pull
    /// failures as an embedded `error` field with a 200 outer status, so the
    /// pull only counts as successful when the stream finishes without one.
    pub async fn pull_image(&self, image: &str, tag: &str) -> Result<(), EngineError> {
        let path = format!(
            "/images/create?fromImage={}&tag={}",
            urlencoding::encode(image),
            urlencoding::encode(tag)
        );
        let (status, bytes) = self
            .request_raw(Method::POST, &path, None, PULL_TIMEOUT)
            .await?;
        let text = String::from_utf8_lossy(&bytes);

        if status.is_client_error() || status.is_server_error() {
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: text.trim().to_string(),
            });
        }

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Ok(progress) = serde_json::from_str::<PullProgress>(line) else {
                continue;
            };
            if let Some(error) = progress.error {
                let message = progress
                    .error_detail
                    .and_then(|d| d.message)
                    .unwrap_or(error);
                return Err(EngineError::Api {
                    status: status.as_u16(),
                    message,
                });
            }
        }

        Ok(())
    }

    /// Lists local images matching a reference filter (e.g. `nginx`).
    pub async fn list_images(&self, reference: &str) -> Result<Vec<ImageSummary>, EngineError> {
        let filters = serde_json::json!({ "reference": [reference] }).to_string();
        let path = format!("/images/json?filters={}", urlencoding::encode(&filters));
        self.request_json(Method::GET, &path, None).await
    }

    /// Removes an image. Returns `false` when the image is gone already or
    /// still in use (404/409), which callers treat as a non-event.
    pub async fn remove_image(&self, image_ref: &str) -> Result<bool, EngineError> {
        let path = format!("/images/{}", urlencoding::encode(image_ref));
        match self
            .request_empty(Method::DELETE, &path, None, REQUEST_TIMEOUT)
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if matches!(e.status(), Some(404) | Some(409)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let path = if all {
            "/containers/json?all=true"
        } else {
            "/containers/json"
        };
        self.request_json(Method::GET, path, None).await
    }

    pub async fn inspect_container(&self, name: &str) -> Result<ContainerInspect, EngineError> {
        let path = format!("/containers/{}/json", urlencoding::encode(name));
        self.request_json(Method::GET, &path, None).await
    }

    /// Stops a container, giving it `grace_secs` to exit before the engine
    /// kills it. The call timeout leaves headroom beyond the grace period.
    pub async fn stop_container(&self, name: &str, grace_secs: u64) -> Result<(), EngineError> {
        let path = format!(
            "/containers/{}/stop?t={}",
            urlencoding::encode(name),
            grace_secs
        );
        let timeout = Duration::from_secs(grace_secs) + REQUEST_TIMEOUT;
        self.request_empty(Method::POST, &path, None, timeout).await
    }

    pub async fn rename_container(&self, name: &str, new_name: &str) -> Result<(), EngineError> {
        let path = format!(
            "/containers/{}/rename?name={}",
            urlencoding::encode(name),
            urlencoding::encode(new_name)
        );
        self.request_empty(Method::POST, &path, None, REQUEST_TIMEOUT)
            .await
    }

    /// Creates a container from a serializable create payload and returns
    /// the new container ID.
    pub async fn create_container<B: Serialize>(
        &self,
        name: &str,
        body: &B,
    ) -> Result<String, EngineError> {
        let path = format!("/containers/create?name={}", urlencoding::encode(name));
        let payload = serde_json::to_vec(body)?;
        let created: CreatedContainer = self
            .request_json(Method::POST, &path, Some(payload))
            .await?;
        Ok(created.id)
    }

    pub async fn start_container(&self, name: &str) -> Result<(), EngineError> {
        let path = format!("/containers/{}/start", urlencoding::encode(name));
        self.request_empty(Method::POST, &path, None, REQUEST_TIMEOUT)
            .await
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let path = format!(
            "/containers/{}{}",
            urlencoding::encode(name),
            if force { "?force=true" } else { "" }
        );
        self.request_empty(Method::DELETE, &path, None, REQUEST_TIMEOUT)
            .await
    }

    pub async fn connect_network(
        &self,
        network: &str,
        container_id: &str,
    ) -> Result<(), EngineError> {
        let path = format!("/networks/{}/connect", urlencoding::encode(network));
        let body = serde_json::to_vec(&serde_json::json!({ "Container": container_id }))?;
        self.request_empty(Method::POST, &path, Some(body), REQUEST_TIMEOUT)
            .await
    }
}

impl Default for EngineClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct PullProgress {
    error: Option<String>,
    #[serde(rename = "errorDetail")]
    error_detail: Option<PullErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PullErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreatedContainer {
    id: String,
}

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    /// Container names as reported by the engine, each with a `/` prefix.
    #[serde(default)]
    pub names: Vec<String>,
    pub image: String,
    /// ID of the image the container was created from.
    #[serde(rename = "ImageID", default)]
    pub image_id: String,
    #[serde(default)]
    pub state: String,
}

impl ContainerSummary {
    /// Primary container name without the engine's leading slash.
    pub fn name(&self) -> Option<&str> {
        self.names
            .first()
            .map(|n| n.strip_prefix('/').unwrap_or(n))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    /// Unix timestamp of image creation.
    #[serde(default)]
    pub created: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    /// Image ID (`sha256:...`) the container was created from.
    pub image: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub network_settings: Option<NetworkSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    #[serde(default)]
    pub network_mode: Option<String>,
    #[serde(default)]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub port_bindings: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    #[serde(default)]
    pub privileged: Option<bool>,
    #[serde(default)]
    pub cap_add: Option<Vec<String>>,
    #[serde(default)]
    pub cap_drop: Option<Vec<String>>,
    #[serde(default)]
    pub devices: Option<Vec<DeviceMapping>>,
    #[serde(default)]
    pub memory: Option<i64>,
    #[serde(default)]
    pub cpu_shares: Option<i64>,
    #[serde(default)]
    pub cpu_quota: Option<i64>,
    #[serde(default)]
    pub security_opt: Option<Vec<String>>,
    #[serde(default)]
    pub runtime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartPolicy {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub maximum_retry_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    #[serde(default)]
    pub host_ip: Option<String>,
    #[serde(default)]
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceMapping {
    #[serde(default)]
    pub path_on_host: Option<String>,
    #[serde(default)]
    pub path_in_container: Option<String>,
    #[serde(default)]
    pub cgroup_permissions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mount {
    #[serde(rename = "Type")]
    pub mount_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    pub destination: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    #[serde(default)]
    pub networks: Option<HashMap<String, serde_json::Value>>,
}
