use super::types::{ImageFile, PersistedState, TunnelFile};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// JSON file persistence for container records, tunnel bindings and
/// snapshot history.
///
/// Two files are kept, each replaced atomically with a write-then-rename so
/// a crash mid-save leaves the previous version intact:
///
/// - The tunnel-state file wraps two maps keyed by container name, rather
///   than being a bare name to bindings map:
///   `{"containers": {name: record}, "tunnels": {name: [binding, ..]}}`.
///   Records live next to the bindings so the lifecycle state survives a
///   restart.
/// - The image-mapping file is `{name: [snapshot, ..]}`, oldest first.
pub struct StateStore {
    tunnel_path: PathBuf,
    image_path: PathBuf,
    /// Serializes writers so renames land in call order
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(tunnel_path: impl Into<PathBuf>, image_path: impl Into<PathBuf>) -> Self {
        Self {
            tunnel_path: tunnel_path.into(),
            image_path: image_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn tunnel_path(&self) -> &Path {
        &self.tunnel_path
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    /// Read both files.
    ///
    /// A missing file is empty state. A file that exists but cannot be read
    /// or parsed is [`Error::CorruptState`]: nothing is dropped silently.
    pub fn load(&self) -> Result<PersistedState> {
        let tunnels: TunnelFile = read_json(&self.tunnel_path)?.unwrap_or_default();
        let snapshots: ImageFile = read_json(&self.image_path)?.unwrap_or_default();

        for (name, record) in &tunnels.containers {
            if *name != record.name {
                return Err(self.corrupt_tunnels(format!(
                    "record stored under '{}' is named '{}'",
                    name, record.name
                )));
            }
        }
        if let Some(orphan) = tunnels
            .tunnels
            .keys()
            .find(|name| !tunnels.containers.contains_key(*name))
        {
            return Err(self.corrupt_tunnels(format!(
                "tunnel bindings for '{}' have no container record",
                orphan
            )));
        }

        let state = PersistedState {
            containers: tunnels.containers,
            tunnels: tunnels.tunnels,
            snapshots,
        };
        debug!(
            containers = state.containers.len(),
            histories = state.snapshots.len(),
            "Loaded persisted state"
        );
        Ok(state)
    }

    /// Write both files atomically.
    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let tunnel_file = TunnelFile {
            containers: state.containers.clone(),
            tunnels: state
                .tunnels
                .iter()
                .filter(|(_, bindings)| !bindings.is_empty())
                .map(|(name, bindings)| (name.clone(), bindings.clone()))
                .collect(),
        };
        let image_file: ImageFile = state
            .snapshots
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(name, history)| (name.clone(), history.clone()))
            .collect();

        let tunnel_json = serde_json::to_string_pretty(&tunnel_file)?;
        let image_json = serde_json::to_string_pretty(&image_file)?;

        let _guard = self.write_lock.lock().await;
        let tunnel_path = self.tunnel_path.clone();
        let image_path = self.image_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            // History first: a record appended for a committed image must not
            // trail a tunnel file that already references its effects.
            atomic_write(&image_path, &image_json)?;
            atomic_write(&tunnel_path, &tunnel_json)
        })
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;

        debug!(path = %self.tunnel_path.display(), "Saved state");
        Ok(())
    }

    fn corrupt_tunnels(&self, reason: String) -> Error {
        Error::CorruptState {
            path: self.tunnel_path.clone(),
            reason,
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No state file, starting empty");
            return Ok(None);
        }
        Err(e) => {
            return Err(Error::CorruptState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    if contents.trim().is_empty() {
        return Err(Error::CorruptState {
            path: path.to_path_buf(),
            reason: "file is empty".to_string(),
        });
    }

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| Error::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomic file write using write-then-rename pattern
fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp = temp_path(path);
    let mut file = fs::File::create(&temp)?;
    file.write_all(contents.as_bytes())?;
    // Data must be on disk before the rename publishes it
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceLimits, ServiceKind};
    use crate::credentials::Credentials;
    use crate::relay::TunnelId;
    use crate::state::{ContainerRecord, LifecycleState, SnapshotRecord, TunnelBinding};
    use chrono::Utc;

    fn store(dir: &Path) -> StateStore {
        StateStore::new(
            dir.join(".devbox/tunnels.json"),
            dir.join(".devbox/images.json"),
        )
    }

    fn sample() -> PersistedState {
        let mut state = PersistedState::default();
        let mut record = ContainerRecord::new(
            "c1",
            "ubuntu:22.04",
            ResourceLimits::default(),
            vec![],
            Credentials {
                root_password: Some("pw".into()),
                notebook_token: None,
            },
        );
        record.container_id = Some("abc".into());
        record.transition(LifecycleState::Running);
        state.containers.insert("c1".into(), record);
        state.tunnels.insert(
            "c1".into(),
            vec![TunnelBinding {
                service_type: ServiceKind::Ssh,
                internal_port: 22,
                public_port: 10001,
                tunnel_id: TunnelId::from("5"),
                credential: Some("pw".into()),
            }],
        );
        state.snapshots.insert(
            "c1".into(),
            vec![SnapshotRecord {
                version_tag: "v1_20240101_000000".into(),
                image_ref: "devbox-snapshot/c1:v1_20240101_000000".into(),
                timestamp: Utc::now(),
                message: "first".into(),
            }],
        );
        state
    }

    #[test]
    fn test_missing_files_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = store(dir.path()).load().unwrap();
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_reproduces_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let state = sample();
        store.save(&state).await.unwrap();

        assert_eq!(store.load().unwrap(), state);
        assert!(!temp_path(store.tunnel_path()).exists());
    }

    #[tokio::test]
    async fn test_files_use_documented_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save(&sample()).await.unwrap();

        let tunnels: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.tunnel_path()).unwrap()).unwrap();
        assert_eq!(tunnels["tunnels"]["c1"][0]["public_port"], 10001);
        assert_eq!(tunnels["containers"]["c1"]["state"], "running");

        let images: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.image_path()).unwrap()).unwrap();
        assert_eq!(images["c1"][0]["version_tag"], "v1_20240101_000000");
    }

    #[test]
    fn test_malformed_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.tunnel_path().parent().unwrap()).unwrap();
        fs::write(store.tunnel_path(), "{ not json").unwrap();

        let err = store.load().unwrap_err();
        assert!(matches!(err, Error::CorruptState { .. }));
    }

    #[test]
    fn test_empty_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.image_path().parent().unwrap()).unwrap();
        fs::write(store.image_path(), "").unwrap();
        assert!(matches!(store.load(), Err(Error::CorruptState { .. })));
    }

    #[test]
    fn test_bindings_without_record_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        fs::create_dir_all(store.tunnel_path().parent().unwrap()).unwrap();
        fs::write(
            store.tunnel_path(),
            r#"{"containers":{},"tunnels":{"ghost":[{"service_type":"ssh","internal_port":22,"public_port":10000,"tunnel_id":"1"}]}}"#,
        )
        .unwrap();
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_empty_entries_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let mut state = sample();
        state.tunnels.insert("c1".into(), vec![]);
        store.save(&state).await.unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.bindings("c1").is_empty());
        assert!(!loaded.tunnels.contains_key("c1"));
    }
}
