//! Partition scheme discovery: an external source pushing scheme updates.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::partition::{PartitionId, PartitionScheme};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("scheme parse failed at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("scheme invalid: {reason}")]
    Invalid { reason: String },
}

/// Source of partition schemes. Implementations push a scheme on every
/// tick; dropping the sender ends the stream and the consumer keeps the
/// last scheme in force.
pub trait DiscoveryService<P: Ord>: Send {
    fn subscribe(&self) -> Receiver<PartitionScheme<P>>;
}

/// Fixed scheme, mostly for tests and single-shot tools.
pub struct StaticDiscovery<P: Ord> {
    scheme: PartitionScheme<P>,
}

impl<P: PartitionId> StaticDiscovery<P> {
    pub fn new(scheme: PartitionScheme<P>) -> Self {
        Self { scheme }
    }
}

impl<P: PartitionId> DiscoveryService<P> for StaticDiscovery<P> {
    fn subscribe(&self) -> Receiver<PartitionScheme<P>> {
        let (tx, rx) = bounded(1);
        let _ = tx.send(self.scheme.clone());
        rx
    }
}

/// Polls a JSON scheme file; pushes whenever the content changes. A
/// failing tick is logged and ignored, the previous scheme stays in
/// force.
pub struct FileDiscovery {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileDiscovery {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

pub fn load_scheme<P: PartitionId + DeserializeOwned>(
    path: &Path,
) -> Result<PartitionScheme<P>, DiscoveryError> {
    let bytes = fs::read(path).map_err(|source| DiscoveryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let scheme: PartitionScheme<P> =
        serde_json::from_slice(&bytes).map_err(|source| DiscoveryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if !scheme.buckets.is_power_of_two() {
        return Err(DiscoveryError::Invalid {
            reason: format!("buckets must be a power of two, got {}", scheme.buckets),
        });
    }
    if scheme.groups.is_empty() {
        return Err(DiscoveryError::Invalid {
            reason: "scheme has no partition groups".to_string(),
        });
    }
    Ok(scheme)
}

impl<P: PartitionId + DeserializeOwned> DiscoveryService<P> for FileDiscovery {
    fn subscribe(&self) -> Receiver<PartitionScheme<P>> {
        let (tx, rx) = bounded(4);
        let path = self.path.clone();
        let poll_interval = self.poll_interval;

        thread::spawn(move || loop {
            // Every tick re-delivers the current scheme; the consumer's
            // update is idempotent. A bad tick is ignored and the previous
            // scheme stays in force.
            match load_scheme::<P>(&path) {
                Ok(scheme) => {
                    if tx.send(scheme).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::warn!("ignoring bad discovery tick from {:?}: {}", path, err);
                }
            }
            thread::sleep(poll_interval);
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::super::partition::RendezvousPartitionGroup;
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn scheme() -> PartitionScheme<String> {
        PartitionScheme::new(vec![RendezvousPartitionGroup::new(
            BTreeSet::from(["one".to_string(), "two".to_string()]),
            1,
        )])
    }

    #[test]
    fn static_discovery_delivers_one_scheme() {
        let discovery = StaticDiscovery::new(scheme());
        let rx = discovery.subscribe();
        assert_eq!(rx.recv().unwrap(), scheme());
        assert!(rx.recv().is_err());
    }

    #[test]
    fn file_discovery_picks_up_changes_and_survives_bad_ticks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheme.json");
        fs::write(&path, serde_json::to_vec(&scheme()).unwrap()).unwrap();

        let discovery = FileDiscovery::new(&path, Duration::from_millis(10));
        let rx: Receiver<PartitionScheme<String>> = discovery.subscribe();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            scheme()
        );

        // A bad tick is ignored.
        fs::write(&path, b"{ not json").unwrap();
        // Then a real update lands.
        let mut updated = scheme();
        updated.groups[0].replication = 2;
        fs::write(&path, serde_json::to_vec(&updated).unwrap()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let received = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            if received == updated {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "update never delivered");
        }
    }

    #[test]
    fn load_scheme_validates_buckets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scheme.json");
        let mut bad = scheme();
        bad.buckets = 500;
        fs::write(&path, serde_json::to_vec(&bad).unwrap()).unwrap();

        let err = load_scheme::<String>(&path).unwrap_err();
        assert!(matches!(err, DiscoveryError::Invalid { .. }));
    }
}
