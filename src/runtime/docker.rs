use async_trait::async_trait;
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListContainersOptions, ListImagesOptions,
    RemoveContainerOptions, RemoveImageOptions, RenameContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::service::{ContainerCreateBody, HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;

use super::{
    ContainerDetail, ContainerRuntime, ContainerStatus, ContainerSummary, CreateSpec, ImageInfo,
    Listing, MountSpec, PortMapping, RuntimeError,
};

// ---------------------------------------------------------------------------
// DockerRuntime
// ---------------------------------------------------------------------------

pub struct DockerRuntime {
    docker: Docker,
    endpoint: String,
}

impl DockerRuntime {
    /// Connect to the local daemon, honouring an explicit endpoint override.
    pub fn connect(endpoint: Option<&str>) -> Result<Self, RuntimeError> {
        match endpoint {
            Some(path) => {
                let docker = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
                    .map_err(|e| {
                        RuntimeError::Unavailable(format!("connect to {path} failed: {e}"))
                    })?;
                Ok(Self {
                    docker,
                    endpoint: path.to_string(),
                })
            }
            None => {
                let docker = Docker::connect_with_local_defaults().map_err(|e| {
                    RuntimeError::Unavailable(format!("Docker connection failed: {e}"))
                })?;
                let endpoint = std::env::var("DOCKER_HOST")
                    .unwrap_or_else(|_| "/var/run/docker.sock".to_string());
                Ok(Self { docker, endpoint })
            }
        }
    }
}

fn to_err(e: bollard::errors::Error) -> RuntimeError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(e.to_string()),
        bollard::errors::Error::DockerResponseServerError { .. } => {
            RuntimeError::Other(e.to_string())
        }
        bollard::errors::Error::IOError { .. } => RuntimeError::Unavailable(e.to_string()),
        bollard::errors::Error::RequestTimeoutError => RuntimeError::Timeout(e.to_string()),
        _ => RuntimeError::Unavailable(e.to_string()),
    }
}

/// Pull failures are registry-side: auth errors are terminal, the rest are
/// worth a retry with backoff.
fn to_pull_err(e: bollard::errors::Error) -> RuntimeError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 401 | 403,
            ..
        } => RuntimeError::AuthRequired(e.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(e.to_string()),
        bollard::errors::Error::IOError { .. } => RuntimeError::Unavailable(e.to_string()),
        _ => RuntimeError::RegistryUnreachable(e.to_string()),
    }
}

/// Treat "already in the requested state" (HTTP 304) as success.
fn idempotent(result: Result<(), bollard::errors::Error>) -> Result<(), RuntimeError> {
    match result {
        Ok(()) => Ok(()),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 304, ..
        }) => Ok(()),
        Err(e) => Err(to_err(e)),
    }
}

fn parse_instant(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    let utc = parsed.with_timezone(&chrono::Utc);
    // Docker reports the zero time for never-started containers
    if utc.timestamp() <= 0 {
        return None;
    }
    Some(utc)
}

fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(to_err)?;
        Ok(())
    }

    async fn list(&self) -> Result<Listing, RuntimeError> {
        let opts = ListContainersOptions {
            all: true,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(to_err)?;

        let mut listing = Listing::default();
        for c in summaries {
            let Some(id) = c.id else {
                listing
                    .diagnostics
                    .push("listing entry without an id, skipped".to_string());
                continue;
            };

            let name = c
                .names
                .unwrap_or_default()
                .into_iter()
                .next()
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());

            listing.containers.push(ContainerSummary {
                id,
                name,
                image_ref: c.image.unwrap_or_default(),
                status: c
                    .state
                    .map(|s| ContainerStatus::parse(&s.to_string()))
                    .unwrap_or(ContainerStatus::Unknown),
                created_at: c.created.and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
                labels: c.labels.unwrap_or_default(),
            });
        }

        Ok(listing)
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(to_err)?;

        let (status, started_at) = match info.state {
            Some(s) => (s.status, s.started_at),
            None => (None, None),
        };
        let config = info.config;

        let mut ports: Vec<PortMapping> = Vec::new();
        if let Some(bindings) = info.host_config.and_then(|hc| hc.port_bindings) {
            for (key, binding) in bindings {
                let (port_str, protocol) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
                let Ok(container_port) = port_str.parse::<u16>() else {
                    continue;
                };
                match binding {
                    Some(list) if !list.is_empty() => {
                        for b in list {
                            ports.push(PortMapping {
                                protocol: protocol.to_string(),
                                container_port,
                                host_port: b.host_port.as_deref().and_then(|p| p.parse().ok()),
                                host_ip: b.host_ip.clone(),
                            });
                        }
                    }
                    _ => ports.push(PortMapping {
                        protocol: protocol.to_string(),
                        container_port,
                        host_port: None,
                        host_ip: None,
                    }),
                }
            }
        }
        ports.sort();

        let mut mounts: Vec<MountSpec> = info
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountSpec {
                source: m.source.unwrap_or_default(),
                target: m.destination.unwrap_or_default(),
                read_only: !m.rw.unwrap_or(true),
            })
            .collect();
        mounts.sort();

        Ok(ContainerDetail {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            image_ref: config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            image_digest: info.image,
            status: status
                .map(|s| ContainerStatus::parse(&s.to_string()))
                .unwrap_or(ContainerStatus::Unknown),
            created_at: info.created.as_deref().and_then(parse_instant),
            started_at: started_at.as_deref().and_then(parse_instant),
            labels: config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default(),
            env: config.and_then(|c| c.env),
            ports,
            mounts,
        })
    }

    async fn pull(&self, image_ref: &str) -> Result<Option<String>, RuntimeError> {
        let (repo, tag) = split_image_ref(image_ref);

        let opts = CreateImageOptions {
            from_image: Some(repo.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        log::debug!("pull {}: {}", image_ref, status);
                    }
                }
                Err(e) => return Err(to_pull_err(e)),
            }
        }

        let inspect = self.docker.inspect_image(image_ref).await.map_err(to_err)?;
        Ok(inspect.id)
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        idempotent(
            self.docker
                .stop_container(
                    id,
                    Some(StopContainerOptions {
                        t: Some(grace.as_secs() as i32),
                        signal: None,
                    }),
                )
                .await,
        )
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        idempotent(
            self.docker
                .start_container(id, None::<StartContainerOptions>)
                .await,
        )
    }

    async fn create(&self, spec: CreateSpec) -> Result<String, RuntimeError> {
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for p in &spec.ports {
            let key = format!("{}/{}", p.container_port, p.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            let binding = p.host_port.map(|host_port| {
                vec![PortBinding {
                    host_ip: p.host_ip.clone(),
                    host_port: Some(host_port.to_string()),
                }]
            });
            port_bindings.insert(key, binding);
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                target: Some(m.target.clone()),
                source: Some(m.source.clone()),
                typ: Some(if m.source.starts_with('/') {
                    MountTypeEnum::BIND
                } else {
                    MountTypeEnum::VOLUME
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            mounts: Some(mounts),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image_ref.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let opts = CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(opts), body)
            .await
            .map_err(to_err)?;

        Ok(response.id)
    }

    async fn rename(&self, id: &str, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .rename_container(
                id,
                RenameContainerOptions {
                    name: name.to_string(),
                },
            )
            .await
            .map_err(to_err)
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let result = self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(to_err(e)),
        }
    }

    async fn image_remove(&self, image: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await
            .map_err(to_err)?;
        Ok(())
    }

    async fn image_list(&self) -> Result<Vec<ImageInfo>, RuntimeError> {
        let images = self
            .docker
            .list_images(None::<ListImagesOptions>)
            .await
            .map_err(to_err)?;

        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_splitting() {
        assert_eq!(split_image_ref("nginx:1.25"), ("nginx", "1.25"));
        assert_eq!(split_image_ref("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_image_ref("ghcr.io/acme/app:v2"),
            ("ghcr.io/acme/app", "v2")
        );
        // A colon in the registry host must not be mistaken for a tag
        assert_eq!(
            split_image_ref("localhost:5000/app"),
            ("localhost:5000/app", "latest")
        );
    }

    #[test]
    fn zero_time_is_not_an_instant() {
        assert!(parse_instant("0001-01-01T00:00:00Z").is_none());
        assert!(parse_instant("2024-05-01T10:00:00Z").is_some());
        assert!(parse_instant("garbage").is_none());
    }
}
