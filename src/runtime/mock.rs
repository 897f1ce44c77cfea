//! In-memory fake implementation of `ContainerRuntime` for testing.
//!
//! Tracks all calls and manages fake container and image state so the
//! monitor loop, update engine and control surface can be exercised
//! without a daemon.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{
    ContainerDetail, ContainerRuntime, ContainerStatus, ContainerSummary, CreateSpec, ImageInfo,
    Listing, MountSpec, PortMapping, RuntimeError,
};

// ---------------------------------------------------------------------------
// Call recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCall {
    Ping,
    List,
    Inspect(String),
    Pull(String),
    Stop(String),
    Start(String),
    Create(String), // name
    Rename { id: String, name: String },
    Remove(String),
    ImageRemove(String),
    ImageList,
}

// ---------------------------------------------------------------------------
// Fake state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image_ref: String,
    pub image_digest: Option<String>,
    pub status: ContainerStatus,
    pub labels: HashMap<String, String>,
    pub env: Option<Vec<String>>,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<MountSpec>,
    stall_start: bool,
}

impl FakeContainer {
    /// A running container with a minimal but replicable configuration.
    pub fn running(id: &str, name: &str, image_ref: &str, digest: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            image_ref: image_ref.to_string(),
            image_digest: Some(digest.to_string()),
            status: ContainerStatus::Running,
            labels: HashMap::new(),
            env: Some(vec!["PATH=/usr/bin".to_string()]),
            ports: Vec::new(),
            mounts: Vec::new(),
            stall_start: false,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Simulate a container whose configuration could not be inspected.
    pub fn without_env(mut self) -> Self {
        self.env = None;
        self
    }
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<RuntimeCall>,
    containers: HashMap<String, FakeContainer>,
    /// image_ref -> the digest a pull currently resolves to.
    images: HashMap<String, String>,
    next_id: u64,
    // Behavior overrides for edge cases
    list_failure: Option<String>,
    pull_failures: Vec<RuntimeError>,
    fail_create: bool,
    fail_start: bool,
    stall_new_starts: bool,
}

pub struct MockRuntime {
    inner: Mutex<Inner>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Pre-populate with a container.
    pub fn with_container(self, container: FakeContainer) -> Self {
        self.inner
            .lock()
            .unwrap()
            .containers
            .insert(container.id.clone(), container);
        self
    }

    /// Pre-populate the pull target for an image ref.
    pub fn with_image(self, image_ref: &str, digest: &str) -> Self {
        self.set_image_digest(image_ref, digest);
        self
    }

    /// Point an image ref at a new digest, as if the upstream tag moved.
    pub fn set_image_digest(&self, image_ref: &str, digest: &str) {
        self.inner
            .lock()
            .unwrap()
            .images
            .insert(image_ref.to_string(), digest.to_string());
    }

    /// Make `list` fail until `clear_list_failure` is called.
    pub fn fail_list(&self, message: &str) {
        self.inner.lock().unwrap().list_failure = Some(message.to_string());
    }

    pub fn clear_list_failure(&self) {
        self.inner.lock().unwrap().list_failure = None;
    }

    /// Queue errors returned by the next `pull` calls, oldest first.
    pub fn fail_next_pulls(&self, errors: Vec<RuntimeError>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pull_failures = errors;
    }

    pub fn fail_create(self) -> Self {
        self.inner.lock().unwrap().fail_create = true;
        self
    }

    pub fn fail_start(self) -> Self {
        self.inner.lock().unwrap().fail_start = true;
        self
    }

    /// Containers created from now on accept `start` but never reach
    /// `running`, so readiness waits time out.
    pub fn stall_new_starts(&self) {
        self.inner.lock().unwrap().stall_new_starts = true;
    }

    // -- Inspection helpers for tests --

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, needle: &RuntimeCall) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == needle)
            .count()
    }

    pub fn was_called(&self, needle: &RuntimeCall) -> bool {
        self.call_count(needle) > 0
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.inner.lock().unwrap().containers.get(id).cloned()
    }

    pub fn container_by_name(&self, name: &str) -> Option<FakeContainer> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.inner.lock().unwrap().containers.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| c.status == ContainerStatus::Running)
            .unwrap_or(false)
    }

    /// Remove a container behind the agent's back.
    pub fn drop_container(&self, id: &str) {
        self.inner.lock().unwrap().containers.remove(id);
    }

    /// Change a container's status behind the agent's back.
    pub fn set_status(&self, id: &str, status: ContainerStatus) {
        if let Some(c) = self.inner.lock().unwrap().containers.get_mut(id) {
            c.status = status;
        }
    }
}

fn detail_of(c: &FakeContainer) -> ContainerDetail {
    ContainerDetail {
        id: c.id.clone(),
        name: c.name.clone(),
        image_ref: c.image_ref.clone(),
        image_digest: c.image_digest.clone(),
        status: c.status,
        created_at: Some(Utc::now()),
        started_at: if c.status == ContainerStatus::Running {
            Some(Utc::now())
        } else {
            None
        },
        labels: c.labels.clone(),
        env: c.env.clone(),
        ports: c.ports.clone(),
        mounts: c.mounts.clone(),
    }
}

// ---------------------------------------------------------------------------
// ContainerRuntime implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn endpoint(&self) -> String {
        "/tmp/mock.sock".to_string()
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Ping);
        if let Some(msg) = &inner.list_failure {
            return Err(RuntimeError::Unavailable(msg.clone()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Listing, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::List);

        if let Some(msg) = &inner.list_failure {
            return Err(RuntimeError::Unavailable(msg.clone()));
        }

        Ok(Listing {
            containers: inner
                .containers
                .values()
                .map(|c| ContainerSummary {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    image_ref: c.image_ref.clone(),
                    status: c.status,
                    created_at: Some(Utc::now()),
                    labels: c.labels.clone(),
                })
                .collect(),
            diagnostics: Vec::new(),
        })
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Inspect(id.to_string()));

        inner
            .containers
            .get(id)
            .map(detail_of)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    async fn pull(&self, image_ref: &str) -> Result<Option<String>, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Pull(image_ref.to_string()));

        if !inner.pull_failures.is_empty() {
            return Err(inner.pull_failures.remove(0));
        }

        Ok(inner.images.get(image_ref).cloned())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Stop(id.to_string()));

        match inner.containers.get_mut(id) {
            Some(c) => {
                c.status = ContainerStatus::Exited;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Start(id.to_string()));

        if inner.fail_start {
            return Err(RuntimeError::Other("mock: start failed".to_string()));
        }

        match inner.containers.get_mut(id) {
            Some(c) => {
                if !c.stall_start {
                    c.status = ContainerStatus::Running;
                }
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Create(spec.name.clone()));

        if inner.fail_create {
            return Err(RuntimeError::Other("mock: create failed".to_string()));
        }
        if inner.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Other(format!(
                "mock: container name {} already in use",
                spec.name
            )));
        }

        let id = format!("mock-container-{}", inner.next_id);
        inner.next_id += 1;

        let digest = inner.images.get(&spec.image_ref).cloned();
        let stall_start = inner.stall_new_starts;
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name,
                image_ref: spec.image_ref,
                image_digest: digest,
                status: ContainerStatus::Created,
                labels: spec.labels,
                env: Some(spec.env),
                ports: spec.ports,
                mounts: spec.mounts,
                stall_start,
            },
        );

        Ok(id)
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Rename {
            id: id.to_string(),
            name: name.to_string(),
        });

        match inner.containers.get_mut(id) {
            Some(c) => {
                c.name = name.to_string();
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::Remove(id.to_string()));
        inner.containers.remove(id);
        Ok(())
    }

    async fn image_remove(&self, image: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::ImageRemove(image.to_string()));
        Ok(())
    }

    async fn image_list(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(RuntimeCall::ImageList);

        if let Some(msg) = &inner.list_failure {
            return Err(RuntimeError::Unavailable(msg.clone()));
        }

        Ok(inner
            .images
            .iter()
            .map(|(name, digest)| ImageInfo {
                id: digest.clone(),
                repo_tags: vec![name.clone()],
                size: 100_000_000,
                created: 1_700_000_000,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn container_lifecycle() {
        let rt = MockRuntime::new().with_image("app:1", "sha256:aaa");

        let id = rt
            .create(CreateSpec {
                name: "web".into(),
                image_ref: "app:1".into(),
                env: vec![],
                labels: HashMap::new(),
                ports: vec![],
                mounts: vec![],
            })
            .await
            .unwrap();

        assert_eq!(rt.container(&id).unwrap().status, ContainerStatus::Created);

        rt.start(&id).await.unwrap();
        assert!(rt.is_running(&id));

        rt.stop(&id, Duration::from_secs(10)).await.unwrap();
        assert!(!rt.is_running(&id));

        rt.remove(&id, true).await.unwrap();
        assert!(rt.container(&id).is_none());
    }

    #[tokio::test]
    async fn created_container_inherits_registry_digest() {
        let rt = MockRuntime::new().with_image("app:1", "sha256:ccc");
        let id = rt
            .create(CreateSpec {
                name: "web".into(),
                image_ref: "app:1".into(),
                env: vec![],
                labels: HashMap::new(),
                ports: vec![],
                mounts: vec![],
            })
            .await
            .unwrap();

        assert_eq!(
            rt.container(&id).unwrap().image_digest.as_deref(),
            Some("sha256:ccc")
        );
    }

    #[tokio::test]
    async fn duplicate_name_rejected_until_renamed() {
        let rt = MockRuntime::new()
            .with_container(FakeContainer::running("c1", "web", "app:1", "sha256:aaa"));

        let spec = CreateSpec {
            name: "web".into(),
            image_ref: "app:1".into(),
            env: vec![],
            labels: HashMap::new(),
            ports: vec![],
            mounts: vec![],
        };
        assert!(rt.create(spec.clone()).await.is_err());

        rt.rename("c1", "web-prev").await.unwrap();
        assert!(rt.create(spec).await.is_ok());
    }

    #[tokio::test]
    async fn pull_failure_queue_drains() {
        let rt = MockRuntime::new().with_image("app:1", "sha256:bbb");
        rt.fail_next_pulls(vec![RuntimeError::RegistryUnreachable("flaky".into())]);

        assert!(rt.pull("app:1").await.is_err());
        assert_eq!(rt.pull("app:1").await.unwrap().as_deref(), Some("sha256:bbb"));
    }

    #[tokio::test]
    async fn list_failure_toggles() {
        let rt = MockRuntime::new();
        rt.fail_list("socket gone");
        assert!(rt.list().await.is_err());

        rt.clear_list_failure();
        assert!(rt.list().await.is_ok());
    }

    #[tokio::test]
    async fn stalled_start_never_reaches_running() {
        let rt = MockRuntime::new().with_image("app:1", "sha256:aaa");
        rt.stall_new_starts();

        let id = rt
            .create(CreateSpec {
                name: "web".into(),
                image_ref: "app:1".into(),
                env: vec![],
                labels: HashMap::new(),
                ports: vec![],
                mounts: vec![],
            })
            .await
            .unwrap();

        rt.start(&id).await.unwrap();
        assert_eq!(rt.container(&id).unwrap().status, ContainerStatus::Created);
    }

    #[tokio::test]
    async fn call_history_is_ordered() {
        let rt = MockRuntime::new();
        rt.ping().await.unwrap();
        let _ = rt.list().await;

        let calls = rt.calls();
        assert_eq!(calls[0], RuntimeCall::Ping);
        assert_eq!(calls[1], RuntimeCall::List);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let rt = MockRuntime::new();
        assert!(rt.remove("missing", true).await.is_ok());
    }
}
