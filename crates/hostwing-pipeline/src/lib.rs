//! Orchestrates the multi-stage deployment workflow: volume setup, image
//! pull, container creation, early acknowledgement, background script
//! provisioning, start, and final state commit. Also implements the
//! supplemented reconciliation surface (delete/redeploy/reinstall/edit).

use hostwing_common::{CreateRequest, InstallScripts, Instance, InstanceStatus, RawPortBinding};
use hostwing_runtime::{follow_progress, ContainerSpec, CreatedContainer, RuntimeClient};
use hostwing_store::{DeploymentStore, StateStore};
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("image pull failed: {0}")]
    PullFailed(String),

    #[error(transparent)]
    Runtime(#[from] hostwing_runtime::RuntimeError),

    #[error(transparent)]
    Store(#[from] hostwing_store::StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<PipelineError> for hostwing_common::AgentError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::BadRequest(m) => hostwing_common::AgentError::BadRequest(m),
            PipelineError::NotFound(m) => hostwing_common::AgentError::NotFound(m),
            PipelineError::Conflict(m) => hostwing_common::AgentError::Conflict(m),
            other => hostwing_common::AgentError::Deployment(other.to_string()),
        }
    }
}

/// Response envelope for create/redeploy/reinstall: returned at the early
/// acknowledgement point, before background provisioning has run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeployOutcome {
    pub message: String,
    pub env: Vec<String>,
    pub volume_id: String,
    pub container_id: String,
}

/// Patch applied onto a stored [`CreateRequest`] for redeploy/reinstall.
/// Every field is optional; absent fields keep the last-known value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployOverrides {
    pub image: Option<String>,
    pub cmd: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub exposed_ports: Option<Vec<String>>,
    pub port_bindings: Option<HashMap<String, Vec<RawPortBinding>>>,
    pub memory_mib: Option<u64>,
    pub cpu_count: Option<u32>,
    pub disk_limit_mib: Option<u64>,
    pub variables: Option<serde_json::Value>,
}

fn apply_overrides(mut base: CreateRequest, overrides: DeployOverrides) -> CreateRequest {
    if let Some(v) = overrides.image {
        base.image = v;
    }
    if let Some(v) = overrides.cmd {
        base.cmd = Some(v);
    }
    if let Some(v) = overrides.env {
        base.env = v;
    }
    if let Some(v) = overrides.exposed_ports {
        base.exposed_ports = v;
    }
    if let Some(v) = overrides.port_bindings {
        base.port_bindings = v;
    }
    if let Some(v) = overrides.memory_mib {
        base.memory_mib = v;
    }
    if let Some(v) = overrides.cpu_count {
        base.cpu_count = v;
    }
    if let Some(v) = overrides.disk_limit_mib {
        base.disk_limit_mib = v;
    }
    if let Some(v) = overrides.variables {
        base.variables = Some(v);
    }
    base
}

/// Mutation accepted by `PUT /instances/edit/:id`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditRequest {
    pub memory_mib: Option<u64>,
    pub cpu_count: Option<u32>,
    pub disk_limit_mib: Option<u64>,
    pub env: Option<Vec<String>>,
}

const FALLBACK_PRIMARY_PORT: &str = "25565";
const VOLUME_MOUNT_POINT: &str = "/app/data";

pub struct DeploymentPipeline {
    runtime: Arc<RuntimeClient>,
    state: Arc<StateStore>,
    deployments: Arc<DeploymentStore>,
    http: reqwest::Client,
    storage_root: PathBuf,
}

impl DeploymentPipeline {
    pub fn new(
        runtime: Arc<RuntimeClient>,
        state: Arc<StateStore>,
        deployments: Arc<DeploymentStore>,
        storage_root: PathBuf,
    ) -> Self {
        Self {
            runtime,
            state,
            deployments,
            http: reqwest::Client::new(),
            storage_root,
        }
    }

    fn volume_dir(&self, instance_id: &str) -> PathBuf {
        self.storage_root.join("volumes").join(instance_id)
    }

    fn validate(&self, req: &CreateRequest) -> Result<()> {
        if req.instance_id.trim().is_empty() {
            return Err(PipelineError::BadRequest("instance id must not be empty".into()));
        }
        validate_port_bindings(&req.port_bindings)
    }

    /// Orchestrates stages 1-9 of §4.4 and spawns the background
    /// provisioning stages (10-12), returning the early-acknowledgement
    /// envelope once the container id is known.
    #[instrument(skip(self, req), fields(instance_id = %req.instance_id))]
    pub async fn create(self: &Arc<Self>, req: CreateRequest) -> Result<DeployOutcome> {
        self.validate(&req)?;

        let variables = parse_variables(req.variables.as_ref());
        let primary_port = primary_port(&req.port_bindings);
        let env = build_env(&req.env, &variables, &primary_port);
        let volume_dir = self.volume_dir(&req.instance_id);
        tokio::fs::create_dir_all(&volume_dir).await?;

        self.state
            .update(&req.instance_id, InstanceStatus::Installing, None, req.disk_limit_mib)
            .await?;

        let created = self
            .pull_and_create(&req.instance_id, &req.image, &req, &volume_dir, &env, req.disk_limit_mib)
            .await?;

        self.deployments.put(&req.instance_id, req.clone()).await?;

        let outcome = DeployOutcome {
            message: "deployment accepted".to_string(),
            env: env.clone(),
            volume_id: req.instance_id.clone(),
            container_id: created.id.clone(),
        };

        let pipeline = Arc::clone(self);
        let instance_id = req.instance_id.clone();
        let container_id = created.id.clone();
        let disk_limit_mib = req.disk_limit_mib;
        let scripts = req.scripts.clone();
        tokio::spawn(async move {
            pipeline
                .provision_start_and_commit(
                    instance_id,
                    container_id,
                    volume_dir,
                    variables,
                    primary_port,
                    disk_limit_mib,
                    scripts,
                )
                .await;
        });

        Ok(outcome)
    }

    /// Re-runs pull/create/start against the existing volume, reusing the
    /// instance's last-known parameters plus `overrides`. Never re-runs
    /// install scripts.
    #[instrument(skip(self, overrides))]
    pub async fn redeploy(
        self: &Arc<Self>,
        instance_id: &str,
        container_id: &str,
        overrides: DeployOverrides,
    ) -> Result<DeployOutcome> {
        self.redeploy_or_reinstall(instance_id, container_id, overrides, false)
            .await
    }

    /// Identical to `redeploy`, but always replays the instance's
    /// originally recorded install scripts.
    #[instrument(skip(self, overrides))]
    pub async fn reinstall(
        self: &Arc<Self>,
        instance_id: &str,
        container_id: &str,
        overrides: DeployOverrides,
    ) -> Result<DeployOutcome> {
        self.redeploy_or_reinstall(instance_id, container_id, overrides, true)
            .await
    }

    async fn redeploy_or_reinstall(
        self: &Arc<Self>,
        instance_id: &str,
        container_id: &str,
        overrides: DeployOverrides,
        replay_scripts: bool,
    ) -> Result<DeployOutcome> {
        let document = self.state.read().await?;
        let record = document
            .get(instance_id)
            .ok_or_else(|| PipelineError::NotFound(instance_id.to_string()))?;
        if record.container_id.as_deref() != Some(container_id) {
            return Err(PipelineError::Conflict(format!(
                "container id {container_id} does not match instance {instance_id}"
            )));
        }

        let stored = self
            .deployments
            .get(instance_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(instance_id.to_string()))?;
        let scripts_to_replay = stored.scripts.clone();
        let merged = apply_overrides(stored, overrides);
        self.validate(&merged)?;

        let _ = self.runtime.stop(container_id).await;
        let _ = self.runtime.remove(container_id).await;

        let variables = parse_variables(merged.variables.as_ref());
        let primary_port = primary_port(&merged.port_bindings);
        let env = build_env(&merged.env, &variables, &primary_port);
        let volume_dir = self.volume_dir(instance_id);

        self.state
            .update(instance_id, InstanceStatus::Installing, None, merged.disk_limit_mib)
            .await?;

        let created = self
            .pull_and_create(instance_id, &merged.image, &merged, &volume_dir, &env, merged.disk_limit_mib)
            .await?;

        self.deployments.put(instance_id, merged.clone()).await?;

        let outcome = DeployOutcome {
            message: "redeploy accepted".to_string(),
            env: env.clone(),
            volume_id: instance_id.to_string(),
            container_id: created.id.clone(),
        };

        let scripts = if replay_scripts {
            scripts_to_replay
        } else {
            InstallScripts::default()
        };

        let pipeline = Arc::clone(self);
        let instance_id = instance_id.to_string();
        let container_id = created.id.clone();
        let disk_limit_mib = merged.disk_limit_mib;
        tokio::spawn(async move {
            pipeline
                .provision_start_and_commit(
                    instance_id,
                    container_id,
                    volume_dir,
                    variables,
                    primary_port,
                    disk_limit_mib,
                    scripts,
                )
                .await;
        });

        Ok(outcome)
    }

    /// `DELETE /instances/:id`: stop+remove the container if known, drop
    /// the volume, and delete the state and deployment records.
    #[instrument(skip(self))]
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        let document = self.state.read().await?;
        let record = document
            .get(instance_id)
            .ok_or_else(|| PipelineError::NotFound(instance_id.to_string()))?
            .clone();

        if let Some(container_id) = &record.container_id {
            if let Err(e) = self.runtime.stop(container_id).await {
                warn!(%instance_id, error = %e, "stop during delete failed, continuing");
            }
            if let Err(e) = self.runtime.remove(container_id).await {
                warn!(%instance_id, error = %e, "remove during delete failed, continuing");
            }
        }

        let volume_dir = self.volume_dir(instance_id);
        let _ = tokio::fs::remove_dir_all(&volume_dir).await;

        self.state.remove(instance_id).await?;
        self.deployments.remove(instance_id).await?;
        Ok(())
    }

    /// `PUT /instances/edit/:id`: a pure state-store update when only
    /// `disk_limit_mib` changes; a stop/remove/recreate/start when
    /// `memory_mib`, `cpu_count`, or `env` change.
    #[instrument(skip(self, edits))]
    pub async fn edit(&self, instance_id: &str, edits: EditRequest) -> Result<Instance> {
        let document = self.state.read().await?;
        let record = document
            .get(instance_id)
            .ok_or_else(|| PipelineError::NotFound(instance_id.to_string()))?
            .clone();
        let stored = self
            .deployments
            .get(instance_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(instance_id.to_string()))?;

        let needs_recreate = edits.memory_mib.is_some() || edits.cpu_count.is_some() || edits.env.is_some();

        if !needs_recreate {
            let disk_limit_mib = edits.disk_limit_mib.unwrap_or(record.disk_limit_mib);
            self.state
                .update(instance_id, record.state, record.container_id.clone(), disk_limit_mib)
                .await?;
            let mut updated = stored;
            updated.disk_limit_mib = disk_limit_mib;
            self.deployments.put(instance_id, updated).await?;
            return Ok(Instance {
                state: record.state,
                container_id: record.container_id,
                disk_limit_mib,
            });
        }

        let container_id = record.container_id.clone().ok_or_else(|| {
            PipelineError::Conflict(format!("instance {instance_id} has no container to recreate"))
        })?;
        let _ = self.runtime.stop(&container_id).await;
        let _ = self.runtime.remove(&container_id).await;

        let mut merged = stored;
        if let Some(v) = edits.memory_mib {
            merged.memory_mib = v;
        }
        if let Some(v) = edits.cpu_count {
            merged.cpu_count = v;
        }
        if let Some(v) = edits.disk_limit_mib {
            merged.disk_limit_mib = v;
        }
        if let Some(v) = edits.env {
            merged.env = v;
        }

        let variables = parse_variables(merged.variables.as_ref());
        let primary_port = primary_port(&merged.port_bindings);
        let env = build_env(&merged.env, &variables, &primary_port);
        let volume_dir = self.volume_dir(instance_id);

        let spec = self.container_spec(instance_id, &merged, &volume_dir, &env);
        let created = match self.runtime.create_container(spec).await {
            Ok(c) => c,
            Err(e) => {
                self.state
                    .update(instance_id, InstanceStatus::Failed, None, merged.disk_limit_mib)
                    .await
                    .ok();
                return Err(e.into());
            }
        };
        self.runtime
            .start(&created.id)
            .await
            .map_err(PipelineError::from)?;

        self.state
            .update(instance_id, InstanceStatus::Ready, Some(created.id.clone()), merged.disk_limit_mib)
            .await?;
        self.deployments.put(instance_id, merged.clone()).await?;

        Ok(Instance {
            state: InstanceStatus::Ready,
            container_id: Some(created.id),
            disk_limit_mib: merged.disk_limit_mib,
        })
    }

    fn container_spec(
        &self,
        instance_id: &str,
        req: &CreateRequest,
        volume_dir: &std::path::Path,
        env: &[String],
    ) -> ContainerSpec {
        let mut port_bindings = HashMap::new();
        for (container_port, bindings) in &req.port_bindings {
            if let Some(first) = bindings.first() {
                port_bindings.insert(container_port.clone(), first.host_port.clone());
            }
        }

        ContainerSpec {
            name: instance_id.to_string(),
            image: req.image.clone(),
            cmd: req.cmd.clone(),
            env: env.to_vec(),
            exposed_ports: req.exposed_ports.clone(),
            port_bindings,
            volume_bind: (volume_dir.to_string_lossy().to_string(), VOLUME_MOUNT_POINT.to_string()),
            memory_bytes: (req.memory_mib as i64) * 1024 * 1024,
            cpu_count: req.cpu_count as i64,
            network_mode: default_network_mode().to_string(),
        }
    }

    /// Pulls the image (drain progress, surface `PullFailed`), then
    /// creates the container. On any failure, commits the `FAILED` state
    /// with whatever `container_id` is known (none, here) before
    /// propagating the error.
    async fn pull_and_create(
        &self,
        instance_id: &str,
        image: &str,
        req: &CreateRequest,
        volume_dir: &std::path::Path,
        env: &[String],
        disk_limit_mib: u64,
    ) -> Result<CreatedContainer> {
        let stream = self.runtime.pull_image(image);
        let final_error = Arc::new(Mutex::new(None));
        let final_error_writer = final_error.clone();
        follow_progress(
            stream,
            |_event| {},
            move |err, _records| {
                *final_error_writer.lock().unwrap() = err;
            },
        )
        .await;

        if let Some(err) = final_error.lock().unwrap().take() {
            self.state
                .update(instance_id, InstanceStatus::Failed, None, disk_limit_mib)
                .await
                .ok();
            error!(%instance_id, %err, "image pull failed");
            return Err(PipelineError::PullFailed(err));
        }

        let spec = self.container_spec(instance_id, req, volume_dir, env);
        match self.runtime.create_container(spec).await {
            Ok(created) => Ok(created),
            Err(e) => {
                self.state
                    .update(instance_id, InstanceStatus::Failed, None, disk_limit_mib)
                    .await
                    .ok();
                Err(e.into())
            }
        }
    }

    /// Background stages 10-12 of §4.4: download scripts (best-effort),
    /// substitute template variables, start the container, commit `READY`.
    /// Any failure here only reaches the state record, never the caller
    /// (the 202 was already sent).
    async fn provision_start_and_commit(
        &self,
        instance_id: String,
        container_id: String,
        volume_dir: PathBuf,
        mut variables: HashMap<String, String>,
        primary_port: String,
        disk_limit_mib: u64,
        scripts: InstallScripts,
    ) {
        variables.insert("primary_port".to_string(), primary_port);
        variables.insert(
            "container_name".to_string(),
            container_id.chars().take(12).collect(),
        );
        variables.insert("timestamp".to_string(), chrono::Utc::now().to_rfc3339());
        variables.insert("random_string".to_string(), random_string(12));

        if !scripts.install.is_empty() {
            let targets: Vec<hostwing_fetcher::ScriptTarget<'_>> = scripts
                .install
                .iter()
                .map(|s| hostwing_fetcher::ScriptTarget {
                    uri: &s.uri,
                    path: &s.path,
                })
                .collect();
            hostwing_fetcher::download_install_scripts(&self.http, &targets, &volume_dir, &variables).await;
            if let Err(e) = hostwing_fetcher::replace_variables(&volume_dir, &variables).await {
                warn!(%instance_id, error = %e, "variable substitution failed, continuing");
            }
        }

        if let Err(e) = self.runtime.start(&container_id).await {
            error!(%instance_id, %container_id, error = %e, "start failed after provisioning");
            self.state
                .update(&instance_id, InstanceStatus::Failed, Some(container_id), disk_limit_mib)
                .await
                .ok();
            return;
        }

        info!(%instance_id, %container_id, "instance ready");
        self.state
            .update(&instance_id, InstanceStatus::Ready, Some(container_id), disk_limit_mib)
            .await
            .ok();
    }
}

fn random_string(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn default_network_mode() -> &'static str {
    if cfg!(unix) {
        "host"
    } else {
        "bridge"
    }
}

fn validate_port_bindings(port_bindings: &HashMap<String, Vec<RawPortBinding>>) -> Result<()> {
    for bindings in port_bindings.values() {
        for binding in bindings {
            let port: u32 = binding
                .host_port
                .parse()
                .map_err(|_| PipelineError::BadRequest(format!("invalid host port: {}", binding.host_port)))?;
            if port == 0 || port > 65535 {
                return Err(PipelineError::BadRequest(format!(
                    "host port out of range: {}",
                    binding.host_port
                )));
            }
        }
    }
    Ok(())
}

/// Host port of the first binding, in iteration order, else a fixed
/// default (this lineage's workloads are predominantly game servers, whose
/// conventional default port is 25565).
fn primary_port(port_bindings: &HashMap<String, Vec<RawPortBinding>>) -> String {
    port_bindings
        .values()
        .flatten()
        .next()
        .map(|b| b.host_port.clone())
        .unwrap_or_else(|| FALLBACK_PRIMARY_PORT.to_string())
}

fn build_env(caller_env: &[String], variables: &HashMap<String, String>, primary_port: &str) -> Vec<String> {
    let mut env = caller_env.to_vec();
    for (key, value) in variables {
        env.push(format!("{key}={value}"));
    }
    env.push(format!("PRIMARY_PORT={primary_port}"));
    env
}

/// Accepts either a JSON object or a JSON-encoded string of an object;
/// defaults to an empty mapping. Non-string scalar values are rendered via
/// their plain (unquoted) display form.
fn parse_variables(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    let resolved = match value {
        Some(serde_json::Value::String(s)) => serde_json::from_str(s).ok(),
        Some(v) => Some(v.clone()),
        None => None,
    };

    match resolved {
        Some(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(k, v)| {
                let rendered = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, rendered)
            })
            .collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(host_port: &str) -> HashMap<String, Vec<RawPortBinding>> {
        let mut m = HashMap::new();
        m.insert(
            "80/tcp".to_string(),
            vec![RawPortBinding {
                host_port: host_port.to_string(),
            }],
        );
        m
    }

    #[test]
    fn port_0_and_65536_are_rejected() {
        assert!(validate_port_bindings(&binding("0")).is_err());
        assert!(validate_port_bindings(&binding("65536")).is_err());
    }

    #[test]
    fn port_1_and_65535_are_accepted() {
        assert!(validate_port_bindings(&binding("1")).is_ok());
        assert!(validate_port_bindings(&binding("65535")).is_ok());
    }

    #[test]
    fn primary_port_uses_first_binding() {
        let bindings = binding("18080");
        assert_eq!(primary_port(&bindings), "18080");
    }

    #[test]
    fn primary_port_falls_back_when_no_bindings() {
        assert_eq!(primary_port(&HashMap::new()), FALLBACK_PRIMARY_PORT);
    }

    #[test]
    fn parse_variables_accepts_object() {
        let value = serde_json::json!({"NAME": "svc", "COUNT": 3});
        let vars = parse_variables(Some(&value));
        assert_eq!(vars.get("NAME").unwrap(), "svc");
        assert_eq!(vars.get("COUNT").unwrap(), "3");
    }

    #[test]
    fn parse_variables_accepts_json_string() {
        let value = serde_json::Value::String(r#"{"NAME":"svc"}"#.to_string());
        let vars = parse_variables(Some(&value));
        assert_eq!(vars.get("NAME").unwrap(), "svc");
    }

    #[test]
    fn parse_variables_defaults_to_empty() {
        assert!(parse_variables(None).is_empty());
    }

    #[test]
    fn build_env_includes_primary_port_and_variables() {
        let mut vars = HashMap::new();
        vars.insert("NAME".to_string(), "svc".to_string());
        let env = build_env(&["A=1".to_string()], &vars, "25565");
        assert!(env.contains(&"A=1".to_string()));
        assert!(env.contains(&"NAME=svc".to_string()));
        assert!(env.contains(&"PRIMARY_PORT=25565".to_string()));
    }

    #[test]
    fn apply_overrides_only_touches_present_fields() {
        let base: CreateRequest = serde_json::from_value(serde_json::json!({
            "image": "alpine:latest",
            "Id": "inst-a",
            "Memory": 128,
            "Cpu": 1,
        }))
        .unwrap();

        let overrides = DeployOverrides {
            memory_mib: Some(256),
            ..Default::default()
        };
        let merged = apply_overrides(base, overrides);
        assert_eq!(merged.memory_mib, 256);
        assert_eq!(merged.image, "alpine:latest");
    }
}
