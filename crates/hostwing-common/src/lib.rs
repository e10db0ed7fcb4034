// Shared error type and data model used across the host agent's crates.

use thiserror::Error;

pub use serde::{Deserialize, Serialize};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Runtime Error: {0}")]
    Runtime(String),

    #[error("Deployment Error: {0}")]
    Deployment(String),

    #[error("Gateway Error: {0}")]
    Gateway(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Lifecycle state of a deployed instance. The create pipeline only ever
/// writes `Installing`, `Ready` or `Failed`; redeploy/reinstall reuse the
/// same three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    Installing,
    Ready,
    Failed,
}

/// One entry of the durable state document: `instance_id -> Instance`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub state: InstanceStatus,
    #[serde(rename = "containerId")]
    pub container_id: Option<String>,
    #[serde(rename = "diskLimit")]
    pub disk_limit_mib: u64,
}

/// A single `hostPort:containerPort` binding as submitted by the panel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortBinding {
    pub container_port: String,
    pub host_port: String,
}

/// One entry of an install-script manifest: where to fetch it from, and
/// where in the instance volume it should land.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptEntry {
    pub uri: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InstallScripts {
    #[serde(default)]
    pub install: Vec<ScriptEntry>,
}

/// Request body for `POST /instances/create` (and the redeploy/reinstall
/// variants, which reuse most of the same fields).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreateRequest {
    pub image: String,
    #[serde(rename = "Id")]
    pub instance_id: String,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, rename = "ExposedPorts")]
    pub exposed_ports: Vec<String>,
    #[serde(default, rename = "PortBindings")]
    pub port_bindings: std::collections::HashMap<String, Vec<RawPortBinding>>,
    #[serde(default)]
    pub scripts: InstallScripts,
    #[serde(rename = "Memory")]
    pub memory_mib: u64,
    #[serde(rename = "Cpu")]
    pub cpu_count: u32,
    #[serde(default, rename = "Disk")]
    pub disk_limit_mib: u64,
    #[serde(default)]
    pub variables: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawPortBinding {
    #[serde(rename = "HostPort")]
    pub host_port: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_round_trips_as_uppercase() {
        let inst = Instance {
            state: InstanceStatus::Installing,
            container_id: None,
            disk_limit_mib: 0,
        };
        let json = serde_json::to_string(&inst).unwrap();
        assert!(json.contains("\"INSTALLING\""));
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back.state, inst.state);
    }

    #[test]
    fn create_request_deserializes_from_panel_shape() {
        let body = serde_json::json!({
            "image": "alpine:latest",
            "Id": "inst-a",
            "Memory": 128,
            "Cpu": 1,
            "PortBindings": { "80/tcp": [{"HostPort": "18080"}] },
            "variables": {"NAME": "svc"}
        });
        let req: CreateRequest = serde_json::from_value(body).unwrap();
        assert_eq!(req.instance_id, "inst-a");
        assert_eq!(req.memory_mib, 128);
        assert_eq!(
            req.port_bindings.get("80/tcp").unwrap()[0].host_port,
            "18080"
        );
    }
}
