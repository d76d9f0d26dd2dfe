//! Docker Engine API client over the daemon's unix socket.
//!
//! Only the handful of endpoints the launcher needs are covered:
//!
//! - `POST /images/create` (pull; the progress stream is drained and checked)
//! - `POST /containers/create`, `POST /containers/{id}/start`
//! - `POST /containers/{id}/wait`, `POST /containers/{id}/kill`
//! - `DELETE /containers/{id}?force=true`
//! - `GET /_ping` (connection check)
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::path::Path;

use async_trait::async_trait;
use hyper::body::{Bytes, HttpBody};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::engine::{ContainerEngine, ContainerHandle, ContainerSpec, EngineError, ExitStatus};

pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker Engine client.
pub struct DockerEngine {
    socket_path: String,
    client: Client<UnixConnector>,
}

impl DockerEngine {
    /// Connects to the daemon and verifies it answers `/_ping`.
    pub async fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self, EngineError> {
        let path = socket_path.as_ref();
        if !path.exists() {
            return Err(EngineError::Unavailable(format!(
                "docker socket not found at {}",
                path.display()
            )));
        }

        let engine = Self {
            socket_path: path.to_string_lossy().to_string(),
            client: Client::unix(),
        };
        engine.ping().await?;
        info!(socket = %engine.socket_path, "Connected to Docker daemon");
        Ok(engine)
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        let response = self.send(Method::GET, "/_ping", None).await?;
        read_success(response).await.map(|_| ())
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Body>, EngineError> {
        let uri: hyper::Uri = Uri::new(&self.socket_path, path).into();
        debug!(method = %method, path = path, "Docker API request");

        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;
        Ok(self.client.request(request).await?)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerBody<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<&'a [String]>,
    env: &'a [String],
    host_config: HostConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    nano_cpus: i64,
    memory: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateContainerResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

/// One line of the pull progress stream.
#[derive(Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let path = pull_path(image);
        let response = self.send(Method::POST, &path, None).await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        // The daemon answers 200 immediately and reports failures inside the
        // stream, so every line has to be inspected.
        let mut body = response.into_body();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = body.data().await {
            pending.extend_from_slice(&chunk?);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                check_pull_line(image, &line)?;
            }
        }
        check_pull_line(image, &pending)?;

        info!(image = %image, "Image pulled");
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerHandle, EngineError> {
        let body = CreateContainerBody {
            image: &spec.image,
            cmd: spec.command.as_deref(),
            env: &spec.env,
            host_config: HostConfig {
                nano_cpus: spec.nano_cpus(),
                memory: spec.memory_bytes(),
            },
        };
        let path = create_path(&spec.name);
        let response = self
            .send(Method::POST, &path, Some(serde_json::to_vec(&body)?))
            .await?;
        let created: CreateContainerResponse = serde_json::from_slice(&read_success(response).await?)?;
        for warning in created.warnings.iter().flatten() {
            warn!(container_id = %created.id, warning = %warning, "Docker create warning");
        }

        let handle = ContainerHandle { id: created.id };
        let start_path = format!("/containers/{}/start", handle.id);
        let started = match self.send(Method::POST, &start_path, None).await {
            Ok(response) => read_success(response).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = started {
            error!(container_id = %handle.id, error = %e, "Failed to start container, removing it");
            if let Err(remove_err) = self.remove(&handle).await {
                warn!(container_id = %handle.id, error = %remove_err, "Failed to remove container");
            }
            return Err(e);
        }

        debug!(container_id = %handle.id, image = %spec.image, "Container started");
        Ok(handle)
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ExitStatus, EngineError> {
        let path = format!("/containers/{}/wait", handle.id);
        let response = self.send(Method::POST, &path, None).await?;
        let waited: WaitResponse = serde_json::from_slice(&read_success(response).await?)?;
        if let Some(err) = waited.error.filter(|e| !e.message.is_empty()) {
            return Err(EngineError::Api {
                status: 200,
                message: err.message,
            });
        }
        Ok(ExitStatus {
            code: waited.status_code,
        })
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        let path = format!("/containers/{}/kill", handle.id);
        let response = self.send(Method::POST, &path, None).await?;
        // 409: the container is no longer running, which is what we wanted.
        if response.status() == StatusCode::CONFLICT {
            debug!(container_id = %handle.id, "Container already stopped");
            return Ok(());
        }
        read_success(response).await.map(|_| ())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<(), EngineError> {
        let path = format!("/containers/{}?force=true", handle.id);
        let response = self.send(Method::DELETE, &path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(container_id = %handle.id, "Container already removed");
            return Ok(());
        }
        read_success(response).await?;
        debug!(container_id = %handle.id, "Container removed");
        Ok(())
    }
}

async fn read_success(response: Response<Body>) -> Result<Bytes, EngineError> {
    if response.status().is_success() {
        Ok(hyper::body::to_bytes(response.into_body()).await?)
    } else {
        Err(api_error(response).await)
    }
}

async fn api_error(response: Response<Body>) -> EngineError {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: String,
    }

    let status = response.status();
    let message = match hyper::body::to_bytes(response.into_body()).await {
        Ok(bytes) => serde_json::from_slice::<ErrorBody>(&bytes)
            .map(|b| b.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&bytes).trim().to_string()),
        Err(e) => e.to_string(),
    };
    error!(status = %status, message = %message, "Docker API error");
    EngineError::Api {
        status: status.as_u16(),
        message,
    }
}

fn check_pull_line(image: &str, line: &[u8]) -> Result<(), EngineError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(());
    }
    let progress: PullProgress = serde_json::from_slice(line)?;
    if let Some(message) = progress.error {
        return Err(EngineError::Pull {
            image: image.to_string(),
            message,
        });
    }
    if let Some(status) = progress.status {
        debug!(image = %image, status = %status, "Pull progress");
    }
    Ok(())
}

/// Builds the pull path, splitting a trailing tag into its own parameter.
///
/// Digest references are passed whole; a `:` that belongs to a registry
/// port (`localhost:5000/app`) is not a tag.
fn pull_path(image: &str) -> String {
    let (name, tag) = split_tag(image);
    match tag {
        Some(tag) => format!(
            "/images/create?fromImage={}&tag={}",
            urlencoding::encode(name),
            urlencoding::encode(tag)
        ),
        None => format!("/images/create?fromImage={}", urlencoding::encode(name)),
    }
}

fn create_path(name: &str) -> String {
    format!("/containers/create?name={}", urlencoding::encode(name))
}

fn split_tag(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (image, None),
    }
}
