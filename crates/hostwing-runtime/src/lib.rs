//! Thin, typed façade over the container runtime's local HTTP API.
//!
//! This is built directly on top of `docktopus`'s re-export of `bollard`,
//! the same Docker Engine API client the rest of this lineage already uses
//! for container lifecycle work. Streaming endpoints (image pull progress,
//! logs, exec, stats) are exposed as typed async streams rather than
//! pre-consumed buffers, so callers can drain them incrementally.

use docktopus::bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, RestartContainerOptions, StartContainerOptions,
    Stats, StatsOptions, StopContainerOptions,
};
use docktopus::bollard::errors::Error as BollardError;
use docktopus::bollard::exec::{CreateExecOptions, CreateExecResults, StartExecResults};
use docktopus::bollard::image::CreateImageOptions;
use docktopus::bollard::models::{
    ContainerSummary, HostConfig, Mount, MountTypeEnum, PortBinding as BollardPortBinding,
};
use docktopus::bollard::Docker;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

pub use docktopus;
pub use docktopus::bollard;

/// Fallback API version used when the startup probe against `/version`
/// fails, so the client stays usable against an older daemon.
const FALLBACK_API_VERSION: &str = "1.41";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(#[source] BollardError),

    #[error("container runtime returned an unparseable response: {0}")]
    ProtocolError(String),

    #[error("container runtime rejected the request: status {status}, body: {body}")]
    RuntimeErrorResponse { status: u16, body: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("image pull failed: {0}")]
    PullFailed(String),

    #[error("container creation failed: {0}")]
    CreateFailed(String),

    #[error("container start failed: {0}")]
    StartFailed(String),

    #[error("docker API error: {0}")]
    Docker(#[from] BollardError),
}

impl From<RuntimeError> for hostwing_common::AgentError {
    fn from(err: RuntimeError) -> Self {
        hostwing_common::AgentError::Runtime(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Everything the deployment pipeline needs to create a container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub exposed_ports: Vec<String>,
    /// `container_port/proto -> host_port`
    pub port_bindings: HashMap<String, String>,
    pub volume_bind: (String, String),
    pub memory_bytes: i64,
    pub cpu_count: i64,
    /// `"host"` on UNIX-like hosts, `"bridge"` elsewhere.
    pub network_mode: String,
}

#[derive(Debug, Clone)]
pub struct CreatedContainer {
    pub id: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProgressEvent {
    pub status: Option<String>,
    pub id: Option<String>,
    pub error: Option<String>,
    pub progress: Option<String>,
}

/// A handle to an exec instance created inside a running container.
pub struct ExecHandle {
    docker: Arc<Docker>,
    pub id: String,
}

impl ExecHandle {
    /// Starts the exec and writes `input` to its stdin if the exec was
    /// created with a TTY/stdin attached.
    pub async fn start_and_write(&self, input: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        match self.docker.start_exec(&self.id, None).await? {
            StartExecResults::Attached { mut input: sink, .. } => {
                sink.write_all(input.as_bytes())
                    .await
                    .map_err(|e| RuntimeError::ProtocolError(e.to_string()))?;
                Ok(())
            }
            StartExecResults::Detached => Ok(()),
        }
    }

    pub async fn inspect(&self) -> Result<bool> {
        let inspect = self.docker.inspect_exec(&self.id).await?;
        Ok(inspect.running.unwrap_or(false))
    }
}

/// Speaks the container runtime's local HTTP API: version negotiation,
/// lifecycle operations, and the streaming endpoints (pull progress, logs,
/// stats, exec).
pub struct RuntimeClient {
    docker: Arc<Docker>,
    api_version: RwLock<String>,
}

impl RuntimeClient {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self {
            docker,
            api_version: RwLock::new(FALLBACK_API_VERSION.to_string()),
        }
    }

    /// Issues a version-less probe and records the negotiated API version
    /// for observability. The underlying client library re-negotiates the
    /// wire version on every connection; this is a diagnostic record, not a
    /// precondition for subsequent calls.
    #[instrument(skip(self))]
    pub async fn negotiate_version(&self) {
        match self.docker.version().await {
            Ok(v) => {
                let version = v.api_version.unwrap_or_else(|| FALLBACK_API_VERSION.to_string());
                info!(%version, "negotiated container runtime API version");
                *self.api_version.write().await = version;
            }
            Err(e) => {
                warn!(error = %e, fallback = FALLBACK_API_VERSION, "version probe failed, using fallback");
            }
        }
    }

    pub async fn api_version(&self) -> String {
        self.api_version.read().await.clone()
    }

    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(RuntimeError::RuntimeUnavailable)
    }

    pub async fn version(&self) -> Result<docktopus::bollard::models::SystemVersion> {
        Ok(self.docker.version().await?)
    }

    pub async fn info(&self) -> Result<docktopus::bollard::models::SystemInfo> {
        Ok(self.docker.info().await?)
    }

    #[instrument(skip(self))]
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let options = docktopus::bollard::container::ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image))]
    pub async fn create_container(&self, spec: ContainerSpec) -> Result<CreatedContainer> {
        let mut port_bindings: HashMap<String, Option<Vec<BollardPortBinding>>> = HashMap::new();
        for (container_port, host_port) in &spec.port_bindings {
            port_bindings.insert(
                container_port.clone(),
                Some(vec![BollardPortBinding {
                    host_ip: None,
                    host_port: Some(host_port.clone()),
                }]),
            );
        }

        let mut exposed_ports = HashMap::new();
        for port in &spec.exposed_ports {
            exposed_ports.insert(port.clone(), HashMap::new());
        }

        let mount = Mount {
            target: Some(spec.volume_bind.1.clone()),
            source: Some(spec.volume_bind.0.clone()),
            typ: Some(MountTypeEnum::BIND),
            ..Default::default()
        };

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(vec![mount]),
            memory: Some(spec.memory_bytes),
            cpu_count: Some(spec.cpu_count),
            network_mode: Some(spec.network_mode.clone()),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            tty: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        Ok(CreatedContainer { id: response.id })
    }

    /// Pulls `reference`, returning a stream of progress records. Fails
    /// eagerly if the pull cannot begin; once returned, per-record `error`
    /// fields are surfaced through `follow_progress`.
    #[instrument(skip(self))]
    pub fn pull_image(
        &self,
        reference: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<ProgressEvent>> + Send>> {
        let options = CreateImageOptions {
            from_image: reference.to_string(),
            ..Default::default()
        };
        let stream = self.docker.create_image(Some(options), None, None);
        Box::pin(stream.map(|item| {
            item.map(|info| ProgressEvent {
                status: info.status,
                id: info.id,
                error: info.error,
                progress: info.progress,
            })
            .map_err(|e| RuntimeError::PullFailed(e.to_string()))
        }))
    }

    #[instrument(skip(self))]
    pub async fn inspect(
        &self,
        container_id: &str,
    ) -> Result<docktopus::bollard::models::ContainerInspectResponse> {
        self.docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| match &e {
                BollardError::DockerResponseServerError { status_code, message } if *status_code == 404 => {
                    let _ = message;
                    RuntimeError::NotFound(container_id.to_string())
                }
                other => RuntimeError::Docker(clone_bollard_error(other)),
            })
    }

    #[instrument(skip(self))]
    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::StartFailed(e.to_string()))
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        Ok(self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await?)
    }

    pub async fn restart(&self, container_id: &str) -> Result<()> {
        Ok(self
            .docker
            .restart_container(container_id, Some(RestartContainerOptions { t: 10 }))
            .await?)
    }

    pub async fn kill(&self, container_id: &str) -> Result<()> {
        Ok(self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await?)
    }

    pub async fn pause(&self, container_id: &str) -> Result<()> {
        Ok(self.docker.pause_container(container_id).await?)
    }

    pub async fn unpause(&self, container_id: &str) -> Result<()> {
        Ok(self.docker.unpause_container(container_id).await?)
    }

    pub async fn remove(&self, container_id: &str) -> Result<()> {
        Ok(self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?)
    }

    /// Single non-streaming stats snapshot.
    pub async fn stats_once(&self, container_id: &str) -> Result<Stats> {
        let mut stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::ProtocolError("stats stream ended with no data".into()))?
            .map_err(RuntimeError::Docker)
    }

    /// Continuous stats stream.
    pub fn stats_stream(
        &self,
        container_id: &str,
    ) -> Pin<Box<dyn Stream<Item = Result<Stats>> + Send>> {
        let stream = self.docker.stats(
            container_id,
            Some(StatsOptions {
                stream: true,
                one_shot: false,
            }),
        );
        Box::pin(stream.map(|item| item.map_err(RuntimeError::Docker)))
    }

    /// Native multiplex-framed log stream (stdout/stderr already demuxed by
    /// the underlying client library).
    pub fn logs(
        &self,
        container_id: &str,
        follow: bool,
        tail: Option<String>,
    ) -> Pin<Box<dyn Stream<Item = Result<LogOutput>> + Send>> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            tail: tail.unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };
        let stream = self.docker.logs(container_id, Some(options));
        Box::pin(stream.map(|item| item.map_err(RuntimeError::Docker)))
    }

    #[instrument(skip(self, command))]
    pub async fn exec(&self, container_id: &str, command: Vec<String>) -> Result<ExecHandle> {
        let config = CreateExecOptions {
            cmd: Some(command),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let CreateExecResults { id } = self.docker.create_exec(container_id, config).await?;
        debug!(%container_id, exec_id = %id, "created exec");
        Ok(ExecHandle {
            docker: self.docker.clone(),
            id,
        })
    }
}

/// `BollardError` doesn't implement `Clone`; rebuild a compatible value for
/// the branches where we've already matched on it by reference.
fn clone_bollard_error(e: &BollardError) -> BollardError {
    match e {
        BollardError::DockerResponseServerError { status_code, message } => {
            BollardError::DockerResponseServerError {
                status_code: *status_code,
                message: message.clone(),
            }
        }
        other => BollardError::IOError {
            err: std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        },
    }
}

/// Drains a pull-progress stream: calls `on_progress` per record, then
/// `on_finished` once with the last-seen error (if any) and the full record
/// list. A stream-level `Err` item — a malformed JSON line, for instance —
/// does not abort the pull; it's remembered as the last-seen error and
/// draining continues with whatever records follow it.
pub async fn follow_progress<F, G>(
    mut stream: Pin<Box<dyn Stream<Item = Result<ProgressEvent>> + Send>>,
    mut on_progress: F,
    on_finished: G,
) where
    F: FnMut(&ProgressEvent),
    G: FnOnce(Option<String>, Vec<ProgressEvent>),
{
    let mut records = Vec::new();
    let mut err = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(e) = &event.error {
                    err = Some(e.clone());
                }
                on_progress(&event);
                records.push(event);
            }
            Err(e) => {
                err = Some(e.to_string());
            }
        }
    }
    on_finished(err, records);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn follow_progress_surfaces_final_error() {
        let events = vec![
            Ok(ProgressEvent {
                status: Some("Pulling".into()),
                id: None,
                error: None,
                progress: None,
            }),
            Ok(ProgressEvent {
                status: None,
                id: None,
                error: Some("manifest unknown".into()),
                progress: None,
            }),
        ];
        let s: Pin<Box<dyn Stream<Item = Result<ProgressEvent>> + Send>> =
            Box::pin(stream::iter(events));

        let mut seen = 0;
        let mut final_err = None;
        follow_progress(
            s,
            |_| seen += 1,
            |err, records| {
                final_err = err;
                assert_eq!(records.len(), 2);
            },
        )
        .await;

        assert_eq!(seen, 2);
        assert_eq!(final_err.as_deref(), Some("manifest unknown"));
    }

    #[tokio::test]
    async fn follow_progress_continues_after_mid_stream_error() {
        let events: Vec<Result<ProgressEvent>> = vec![
            Ok(ProgressEvent {
                status: Some("Pulling".into()),
                id: None,
                error: None,
                progress: None,
            }),
            Err(RuntimeError::ProtocolError("malformed JSON line".into())),
            Ok(ProgressEvent {
                status: Some("Pull complete".into()),
                id: None,
                error: None,
                progress: None,
            }),
        ];
        let s: Pin<Box<dyn Stream<Item = Result<ProgressEvent>> + Send>> =
            Box::pin(stream::iter(events));

        let mut seen = 0;
        let mut final_records = Vec::new();
        let mut final_err = None;
        follow_progress(
            s,
            |_| seen += 1,
            |err, records| {
                final_err = err;
                final_records = records;
            },
        )
        .await;

        // The error event doesn't reach `on_progress`/`records` (it carries
        // no `ProgressEvent`), but draining keeps going past it.
        assert_eq!(seen, 2);
        assert_eq!(final_records.len(), 2);
        assert!(final_err.unwrap().contains("malformed JSON line"));
    }

    #[tokio::test]
    async fn follow_progress_with_no_error_reports_none() {
        let events = vec![Ok(ProgressEvent {
            status: Some("Pull complete".into()),
            id: None,
            error: None,
            progress: None,
        })];
        let s: Pin<Box<dyn Stream<Item = Result<ProgressEvent>> + Send>> =
            Box::pin(stream::iter(events));

        let mut final_err = Some("unset".to_string());
        follow_progress(s, |_| {}, |err, _| final_err = err).await;
        assert!(final_err.is_none());
    }
}
