//! Stable hash over the portion of a container's configuration that must be
//! preserved across an image replace.
//!
//! Covers the image ref, environment variables, mounts, published ports and
//! non-ephemeral labels, each in sorted order so the hash is independent of
//! daemon enumeration order. Returns `None` when inspection did not yield
//! the environment; such a container cannot be safely recreated.

use sha2::{Digest, Sha256};

use crate::runtime::ContainerDetail;

/// Label prefixes that vary per container instance or carry build metadata.
const EPHEMERAL_LABEL_PREFIXES: &[&str] = &[
    "com.docker.swarm.",
    "com.docker.compose.",
    "org.opencontainers.image.",
];

pub fn env_fingerprint(detail: &ContainerDetail) -> Option<String> {
    let env = detail.env.as_ref()?;

    let mut hasher = Sha256::new();
    hasher.update(detail.image_ref.as_bytes());
    hasher.update([0u8]);

    let mut env_sorted: Vec<&str> = env.iter().map(String::as_str).collect();
    env_sorted.sort_unstable();
    for line in env_sorted {
        hasher.update(line.as_bytes());
        hasher.update([0u8]);
    }

    let mut mounts: Vec<String> = detail
        .mounts
        .iter()
        .map(|m| format!("mount:{}:{}:{}", m.source, m.target, m.read_only))
        .collect();
    mounts.sort_unstable();
    for m in mounts {
        hasher.update(m.as_bytes());
        hasher.update([0u8]);
    }

    let mut ports: Vec<String> = detail
        .ports
        .iter()
        .map(|p| {
            format!(
                "port:{}:{}:{}",
                p.protocol,
                p.container_port,
                p.host_port.map(|hp| hp.to_string()).unwrap_or_default()
            )
        })
        .collect();
    ports.sort_unstable();
    for p in ports {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }

    let mut labels: Vec<String> = detail
        .labels
        .iter()
        .filter(|(k, _)| {
            !EPHEMERAL_LABEL_PREFIXES
                .iter()
                .any(|prefix| k.starts_with(prefix))
        })
        .map(|(k, v)| format!("label:{k}={v}"))
        .collect();
    labels.sort_unstable();
    for l in labels {
        hasher.update(l.as_bytes());
        hasher.update([0u8]);
    }

    Some(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerStatus, MountSpec, PortMapping};
    use std::collections::HashMap;

    fn detail() -> ContainerDetail {
        ContainerDetail {
            id: "c1".into(),
            name: "web".into(),
            image_ref: "app:1".into(),
            image_digest: Some("sha256:aaa".into()),
            status: ContainerStatus::Running,
            created_at: None,
            started_at: None,
            labels: HashMap::new(),
            env: Some(vec!["B=2".into(), "A=1".into()]),
            ports: vec![PortMapping {
                protocol: "tcp".into(),
                container_port: 80,
                host_port: Some(8080),
                host_ip: None,
            }],
            mounts: vec![MountSpec {
                source: "/data".into(),
                target: "/var/lib/data".into(),
                read_only: false,
            }],
        }
    }

    #[test]
    fn independent_of_env_order() {
        let a = env_fingerprint(&detail()).unwrap();

        let mut reordered = detail();
        reordered.env = Some(vec!["A=1".into(), "B=2".into()]);
        let b = env_fingerprint(&reordered).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_configuration() {
        let base = env_fingerprint(&detail()).unwrap();

        let mut changed = detail();
        changed.env = Some(vec!["A=1".into(), "B=3".into()]);
        assert_ne!(env_fingerprint(&changed).unwrap(), base);

        let mut changed = detail();
        changed.ports[0].host_port = Some(9090);
        assert_ne!(env_fingerprint(&changed).unwrap(), base);

        let mut changed = detail();
        changed.image_ref = "app:2".into();
        assert_ne!(env_fingerprint(&changed).unwrap(), base);
    }

    #[test]
    fn insensitive_to_digest_and_ephemeral_labels() {
        let base = env_fingerprint(&detail()).unwrap();

        let mut changed = detail();
        changed.image_digest = Some("sha256:bbb".into());
        changed
            .labels
            .insert("com.docker.compose.container-number".into(), "2".into());
        changed
            .labels
            .insert("org.opencontainers.image.created".into(), "now".into());
        assert_eq!(env_fingerprint(&changed).unwrap(), base);
    }

    #[test]
    fn durable_labels_count() {
        let base = env_fingerprint(&detail()).unwrap();

        let mut changed = detail();
        changed.labels.insert("app.tier".into(), "frontend".into());
        assert_ne!(env_fingerprint(&changed).unwrap(), base);
    }

    #[test]
    fn missing_env_means_no_fingerprint() {
        let mut incomplete = detail();
        incomplete.env = None;
        assert!(env_fingerprint(&incomplete).is_none());
    }
}
