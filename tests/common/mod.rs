//! In-process fakes for the container engine and a registry, backed by
//! axum. The engine fake listens on a Unix socket in a temp directory, the
//! registry fake on a loopback TCP port, so tests exercise the real HTTP
//! clients end to end.

#![allow(dead_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tagwatch::engine::EngineClient;
use tempfile::TempDir;
use tokio::net::{TcpListener, UnixListener};

// ── Fake engine ───────────────────────────────────────────────────────

pub struct FakeContainer {
    pub image_ref: String,
    pub inspect: Value,
    pub create_body: Option<Value>,
}

#[derive(Default)]
pub struct EngineState {
    pub containers: HashMap<String, FakeContainer>,
    pub images: Vec<Value>,
    pub pulls: Vec<(String, String)>,
    pub removed_images: Vec<String>,
    pub removed_containers: Vec<String>,
    pub network_connects: Vec<(String, String)>,
    pub stops: usize,
    pub renames: usize,
    pub creates: usize,
    pub starts: usize,
    pub fail_create: HashSet<String>,
    pub fail_rename_to: HashSet<String>,
    pub pull_error: Option<String>,
}

pub struct FakeEngine {
    pub state: Arc<Mutex<EngineState>>,
    pub socket_path: PathBuf,
    _dir: TempDir,
}

type Shared = Arc<Mutex<EngineState>>;

impl FakeEngine {
    pub fn client(&self) -> EngineClient {
        EngineClient::with_socket(&self.socket_path)
    }

    pub fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    pub fn add_container(&self, name: &str, image_ref: &str, inspect: Value) {
        self.lock().containers.insert(
            name.to_string(),
            FakeContainer {
                image_ref: image_ref.to_string(),
                inspect,
                create_body: None,
            },
        );
    }

    pub fn add_image<S: AsRef<str>>(&self, repo_tags: &[S], created: i64) {
        self.add_image_with_id(&format!("sha256:img{}", created), repo_tags, created);
    }

    pub fn add_image_with_id<S: AsRef<str>>(&self, id: &str, repo_tags: &[S], created: i64) {
        let tags: Vec<String> = repo_tags.iter().map(|t| t.as_ref().to_string()).collect();
        self.lock().images.push(json!({
            "Id": id,
            "RepoTags": tags,
            "Created": created,
        }));
    }

    pub fn fail_create_of(&self, name: &str) {
        self.lock().fail_create.insert(name.to_string());
    }

    pub fn fail_rename_to(&self, new_name: &str) {
        self.lock().fail_rename_to.insert(new_name.to_string());
    }

    pub fn set_pull_error(&self, message: &str) {
        self.lock().pull_error = Some(message.to_string());
    }
}

/// Minimal but realistic inspect document for a seeded container.
pub fn inspect_fixture(id: &str, name: &str, image_ref: &str) -> Value {
    json!({
        "Id": id,
        "Name": format!("/{name}"),
        "Image": "sha256:runningimage",
        "Config": {
            "Hostname": name,
            "Env": ["PATH=/usr/bin", "APP_MODE=test"],
            "Cmd": ["serve"],
            "Labels": {"maintainer": "tests"},
            "Image": image_ref,
        },
        "HostConfig": {
            "NetworkMode": "default",
            "RestartPolicy": {"Name": "unless-stopped", "MaximumRetryCount": 0},
        },
        "Mounts": [],
        "NetworkSettings": {"Networks": {"bridge": {}}}
    })
}

pub async fn spawn_engine() -> FakeEngine {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("engine.sock");
    let state: Shared = Arc::new(Mutex::new(EngineState::default()));

    let app = Router::new()
        .route("/v1.41/images/create", post(pull_image))
        .route("/v1.41/images/json", get(list_images))
        .route("/v1.41/images/{reference}", delete(remove_image))
        .route("/v1.41/containers/json", get(list_containers))
        .route("/v1.41/containers/create", post(create_container))
        .route("/v1.41/containers/{name}/json", get(inspect_container))
        .route("/v1.41/containers/{name}/stop", post(stop_container))
        .route("/v1.41/containers/{name}/rename", post(rename_container))
        .route("/v1.41/containers/{name}/start", post(start_container))
        .route("/v1.41/containers/{name}", delete(remove_container))
        .route("/v1.41/networks/{network}/connect", post(connect_network))
        .with_state(state.clone());

    let listener = UnixListener::bind(&socket_path).unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeEngine {
        state,
        socket_path,
        _dir: dir,
    }
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"message": message}))).into_response()
}

async fn pull_image(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let image = params.get("fromImage").cloned().unwrap_or_default();
    let tag = params.get("tag").cloned().unwrap_or_default();

    let mut state = state.lock().unwrap();
    state.pulls.push((image, tag));
    match &state.pull_error {
        Some(error) => {
            let body = format!(
                "{{\"status\":\"Pulling\"}}\n{{\"error\":{}}}\n",
                serde_json::to_string(error).unwrap()
            );
            (StatusCode::OK, body).into_response()
        }
        None => (StatusCode::OK, "{\"status\":\"Pull complete\"}\n".to_string()).into_response(),
    }
}

async fn list_images(State(state): State<Shared>) -> Json<Value> {
    Json(Value::Array(state.lock().unwrap().images.clone()))
}

async fn remove_image(State(state): State<Shared>, Path(reference): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    let mut found = false;
    for summary in &mut state.images {
        let Some(tags) = summary["RepoTags"].as_array_mut() else {
            continue;
        };
        let before = tags.len();
        tags.retain(|t| t.as_str() != Some(reference.as_str()));
        if tags.len() < before {
            found = true;
        }
    }
    if found {
        state.removed_images.push(reference);
        StatusCode::OK.into_response()
    } else {
        not_found("no such image")
    }
}

async fn list_containers(State(state): State<Shared>) -> Json<Value> {
    let state = state.lock().unwrap();
    let summaries: Vec<Value> = state
        .containers
        .iter()
        .map(|(name, container)| {
            json!({
                "Id": container.inspect["Id"],
                "Names": [format!("/{name}")],
                "Image": container.image_ref,
                "ImageID": container.inspect["Image"],
                "State": "running",
            })
        })
        .collect();
    Json(Value::Array(summaries))
}

async fn inspect_container(State(state): State<Shared>, Path(name): Path<String>) -> Response {
    match state.lock().unwrap().containers.get(&name) {
        Some(container) => Json(container.inspect.clone()).into_response(),
        None => not_found("no such container"),
    }
}

async fn stop_container(State(state): State<Shared>, Path(name): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if !state.containers.contains_key(&name) {
        return not_found("no such container");
    }
    state.stops += 1;
    StatusCode::NO_CONTENT.into_response()
}

async fn rename_container(
    State(state): State<Shared>,
    Path(name): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(new_name) = params.get("name").cloned() else {
        return (StatusCode::BAD_REQUEST, Json(json!({"message": "missing name"}))).into_response();
    };
    let mut state = state.lock().unwrap();
    if state.fail_rename_to.contains(&new_name) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "rename failed"})),
        )
            .into_response();
    }
    let Some(container) = state.containers.remove(&name) else {
        return not_found("no such container");
    };
    state.containers.insert(new_name, container);
    state.renames += 1;
    StatusCode::NO_CONTENT.into_response()
}

async fn create_container(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    let name = params.get("name").cloned().unwrap_or_default();
    let mut state = state.lock().unwrap();
    if state.fail_create.contains(&name) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"message": "create failed"})),
        )
            .into_response();
    }
    if state.containers.contains_key(&name) {
        return (
            StatusCode::CONFLICT,
            Json(json!({"message": "name already in use"})),
        )
            .into_response();
    }

    let id = format!("created-{name}");
    let image_ref = body["Image"].as_str().unwrap_or_default().to_string();
    let inspect = json!({
        "Id": id.clone(),
        "Name": format!("/{name}"),
        "Image": "sha256:created",
        "Config": {
            "Hostname": body.get("Hostname"),
            "User": body.get("User"),
            "Env": body.get("Env"),
            "Cmd": body.get("Cmd"),
            "Entrypoint": body.get("Entrypoint"),
            "Labels": body.get("Labels"),
            "ExposedPorts": body.get("ExposedPorts"),
        },
        "HostConfig": body.get("HostConfig").cloned().unwrap_or_else(|| json!({})),
        "Mounts": [],
        "NetworkSettings": {"Networks": {}}
    });
    state.containers.insert(
        name,
        FakeContainer {
            image_ref,
            inspect,
            create_body: Some(body),
        },
    );
    state.creates += 1;
    (StatusCode::CREATED, Json(json!({"Id": id}))).into_response()
}

async fn start_container(State(state): State<Shared>, Path(name): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if !state.containers.contains_key(&name) {
        return not_found("no such container");
    }
    state.starts += 1;
    StatusCode::NO_CONTENT.into_response()
}

async fn remove_container(State(state): State<Shared>, Path(name): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if state.containers.remove(&name).is_none() {
        return not_found("no such container");
    }
    state.removed_containers.push(name);
    StatusCode::NO_CONTENT.into_response()
}

async fn connect_network(
    State(state): State<Shared>,
    Path(network): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let container = body["Container"].as_str().unwrap_or_default().to_string();
    state.lock().unwrap().network_connects.push((network, container));
    StatusCode::OK.into_response()
}

// ── Fake registry ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct RegistryState {
    pub tags: Vec<String>,
    pub digests: HashMap<String, String>,
    pub manifest_heads: usize,
}

pub struct FakeRegistry {
    pub state: Arc<Mutex<RegistryState>>,
    /// Host:port suitable for use as an image reference's registry part.
    pub host: String,
}

type SharedRegistry = Arc<Mutex<RegistryState>>;

impl FakeRegistry {
    pub fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap()
    }

    pub fn set_digest(&self, tag: &str, digest: &str) {
        self.lock()
            .digests
            .insert(tag.to_string(), digest.to_string());
    }
}

pub async fn spawn_registry(tags: &[&str], digests: &[(&str, &str)]) -> FakeRegistry {
    let state: SharedRegistry = Arc::new(Mutex::new(RegistryState {
        tags: tags.iter().map(|t| t.to_string()).collect(),
        digests: digests
            .iter()
            .map(|(t, d)| (t.to_string(), d.to_string()))
            .collect(),
        manifest_heads: 0,
    }));

    let app = Router::new()
        .route("/v2/auth", get(registry_auth))
        .route("/v2/{namespace}/{repo}/tags/list", get(registry_tags))
        .route(
            "/v2/{namespace}/{repo}/manifests/{tag}",
            get(registry_manifest),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let host = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    FakeRegistry { state, host }
}

async fn registry_auth() -> StatusCode {
    // Anonymous reads are allowed; clients fall back when no token issues.
    StatusCode::NOT_FOUND
}

async fn registry_tags(State(state): State<SharedRegistry>) -> Json<Value> {
    let state = state.lock().unwrap();
    Json(json!({"name": "testns/app", "tags": state.tags}))
}

async fn registry_manifest(
    State(state): State<SharedRegistry>,
    Path((_namespace, _repo, tag)): Path<(String, String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    state.manifest_heads += 1;
    match state.digests.get(&tag) {
        Some(digest) => (
            [("docker-content-digest", digest.clone())],
            StatusCode::OK,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
