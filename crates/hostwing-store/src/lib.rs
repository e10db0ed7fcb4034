//! Durable mapping of instance id to `{state, container id, disk limit}`,
//! persisted as a single JSON document at `<root>/storage/states.json`.
//!
//! Every write goes to a temp file in the same directory and is renamed
//! over the destination, so a crash mid-write never leaves a torn
//! document. All reads and writes are serialized through a single mutex so
//! concurrent deployments can't clobber each other's updates.

use hostwing_common::{CreateRequest, Instance, InstanceStatus};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state document IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state document is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for hostwing_common::AgentError {
    fn from(err: StoreError) -> Self {
        hostwing_common::AgentError::Internal(err.to_string())
    }
}

pub type StateDocument = HashMap<String, Instance>;

/// File-backed, mutex-serialized store for the instance state document.
pub struct StateStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl StateStore {
    /// `root` is the agent's data directory; the document lives at
    /// `root/storage/states.json`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("storage").join("states.json"),
            guard: Mutex::new(()),
        }
    }

    #[instrument(skip(self))]
    pub async fn read(&self) -> Result<StateDocument> {
        let _lock = self.guard.lock().await;
        self.read_unlocked().await
    }

    async fn read_unlocked(&self) -> Result<StateDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(StateDocument::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StateDocument::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the record for `instance_id` wholesale with the provided
    /// fields; unrelated records are untouched.
    #[instrument(skip(self))]
    pub async fn update(
        &self,
        instance_id: &str,
        state: InstanceStatus,
        container_id: Option<String>,
        disk_limit_mib: u64,
    ) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut document = self.read_unlocked().await?;
        document.insert(
            instance_id.to_string(),
            Instance {
                state,
                container_id,
                disk_limit_mib,
            },
        );
        self.write_unlocked(&document).await
    }

    /// Deletes the record for `instance_id` entirely. A no-op if the
    /// record is already absent.
    #[instrument(skip(self))]
    pub async fn remove(&self, instance_id: &str) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut document = self.read_unlocked().await?;
        document.remove(instance_id);
        self.write_unlocked(&document).await
    }

    async fn write_unlocked(&self, document: &StateDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .expect("states.json path always has a parent");
        tokio::fs::create_dir_all(dir).await?;

        let serialized = serde_json::to_vec_pretty(document)?;
        let tmp_path = dir.join(format!(".states.json.{}.tmp", std::process::id()));

        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(instances = document.len(), "wrote state document");
        Ok(())
    }
}

/// Persists the last-known deployment parameters per instance, keyed the
/// same way as the state document but written to its own file. The
/// canonical state document (§3 of the design) deliberately carries only
/// `{state, container_id, disk_limit_mib}`; redeploy and reinstall need the
/// original image/resource/script parameters too, so they're kept here
/// rather than widening the state document's schema.
pub type DeploymentDocument = HashMap<String, CreateRequest>;

pub struct DeploymentStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl DeploymentStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("storage").join("deployments.json"),
            guard: Mutex::new(()),
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, instance_id: &str) -> Result<Option<CreateRequest>> {
        let _lock = self.guard.lock().await;
        let document = self.read_unlocked().await?;
        Ok(document.get(instance_id).cloned())
    }

    #[instrument(skip(self, request))]
    pub async fn put(&self, instance_id: &str, request: CreateRequest) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut document = self.read_unlocked().await?;
        document.insert(instance_id.to_string(), request);
        self.write_unlocked(&document).await
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, instance_id: &str) -> Result<()> {
        let _lock = self.guard.lock().await;
        let mut document = self.read_unlocked().await?;
        document.remove(instance_id);
        self.write_unlocked(&document).await
    }

    async fn read_unlocked(&self) -> Result<DeploymentDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(DeploymentDocument::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DeploymentDocument::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_unlocked(&self, document: &DeploymentDocument) -> Result<()> {
        let dir = self
            .path
            .parent()
            .expect("deployments.json path always has a parent");
        tokio::fs::create_dir_all(dir).await?;

        let serialized = serde_json::to_vec_pretty(document)?;
        let tmp_path = dir.join(format!(".deployments.json.{}.tmp", std::process::id()));

        tokio::fs::write(&tmp_path, &serialized).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(instances = document.len(), "wrote deployment document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store
            .update("inst-a", InstanceStatus::Installing, None, 0)
            .await
            .unwrap();

        let doc = store.read().await.unwrap();
        let rec = doc.get("inst-a").unwrap();
        assert_eq!(rec.state, InstanceStatus::Installing);
        assert!(rec.container_id.is_none());
    }

    #[tokio::test]
    async fn update_replaces_record_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store
            .update("inst-a", InstanceStatus::Installing, None, 0)
            .await
            .unwrap();
        store
            .update(
                "inst-a",
                InstanceStatus::Ready,
                Some("cid123".to_string()),
                512,
            )
            .await
            .unwrap();

        let doc = store.read().await.unwrap();
        let rec = doc.get("inst-a").unwrap();
        assert_eq!(rec.state, InstanceStatus::Ready);
        assert_eq!(rec.container_id.as_deref(), Some("cid123"));
        assert_eq!(rec.disk_limit_mib, 512);
    }

    #[tokio::test]
    async fn unrelated_records_are_untouched_by_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store
            .update("inst-a", InstanceStatus::Ready, Some("a".into()), 1)
            .await
            .unwrap();
        store
            .update("inst-b", InstanceStatus::Installing, None, 2)
            .await
            .unwrap();

        let doc = store.read().await.unwrap();
        assert_eq!(doc.get("inst-a").unwrap().container_id.as_deref(), Some("a"));
        assert_eq!(doc.get("inst-b").unwrap().disk_limit_mib, 2);
    }

    #[tokio::test]
    async fn remove_deletes_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store
            .update("inst-a", InstanceStatus::Ready, Some("a".into()), 1)
            .await
            .unwrap();
        store.remove("inst-a").await.unwrap();

        let doc = store.read().await.unwrap();
        assert!(doc.get("inst-a").is_none());
    }

    #[tokio::test]
    async fn read_on_missing_document_returns_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let doc = store.read().await.unwrap();
        assert!(doc.is_empty());
    }

    #[tokio::test]
    async fn document_on_disk_is_valid_json_after_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store
            .update("inst-a", InstanceStatus::Failed, None, 0)
            .await
            .unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("storage").join("states.json"))
            .await
            .unwrap();
        let _: serde_json::Value = serde_json::from_str(&raw).unwrap();
    }

    fn sample_request(id: &str) -> CreateRequest {
        serde_json::from_value(serde_json::json!({
            "image": "alpine:latest",
            "Id": id,
            "Memory": 128,
            "Cpu": 1,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn deployment_store_round_trips_last_known_request() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::new(dir.path());

        store.put("inst-a", sample_request("inst-a")).await.unwrap();
        let got = store.get("inst-a").await.unwrap().unwrap();
        assert_eq!(got.image, "alpine:latest");
        assert_eq!(got.memory_mib, 128);
    }

    #[tokio::test]
    async fn deployment_store_remove_clears_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::new(dir.path());

        store.put("inst-a", sample_request("inst-a")).await.unwrap();
        store.remove("inst-a").await.unwrap();
        assert!(store.get("inst-a").await.unwrap().is_none());
    }
}
