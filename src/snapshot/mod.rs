//! Snapshot history.
//!
//! A snapshot is a committed image of a stopped container, stored as
//! `<prefix><name>:v<N>_<YYYYmmdd_HHMMSS>`. History per container is kept
//! oldest first and capped at `max_history`; the oldest entries are evicted
//! and their images deleted.
//!
//! Committing and evicting only touch the in-memory history. The caller
//! persists it and then calls [`SnapshotManager::delete_images`] for the
//! evicted entries, so an image is never deleted while a persisted record
//! still points at it. Images left behind by a crash in between are found
//! again by [`SnapshotManager::recover`].

use crate::config::SnapshotConfig;
use crate::error::{Error, Result};
use crate::lock_order::{LockId, OrderedMutex};
use crate::runtime::{self, ContainerRuntime, RuntimeError};
use crate::state::{ImageFile, SnapshotRecord};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TAG_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Message recorded for images adopted during recovery.
pub const RECOVERED_MESSAGE: &str = "recovered from orphan image";

/// `v<version>_<timestamp>`
pub fn format_tag(version: u32, at: DateTime<Utc>) -> String {
    format!("v{}_{}", version, at.format(TAG_TIME_FORMAT))
}

/// Inverse of [`format_tag`]. `None` for tags not produced by devbox.
pub fn parse_tag(tag: &str) -> Option<(u32, DateTime<Utc>)> {
    let (version, time) = tag.strip_prefix('v')?.split_once('_')?;
    let version = version.parse().ok()?;
    let time = NaiveDateTime::parse_from_str(time, TAG_TIME_FORMAT).ok()?;
    Some((version, time.and_utc()))
}

fn version_of(record: &SnapshotRecord) -> u32 {
    parse_tag(&record.version_tag).map(|(v, _)| v).unwrap_or(0)
}

/// Result of a commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub record: SnapshotRecord,
    /// Entries pushed out of the history; their images still exist
    pub evicted: Vec<SnapshotRecord>,
}

/// One row of [`SnapshotManager::list_all`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotListing {
    pub container: String,
    #[serde(flatten)]
    pub record: SnapshotRecord,
}

pub struct SnapshotManager {
    runtime: Arc<dyn ContainerRuntime>,
    runtime_timeout: Duration,
    max_history: usize,
    repository_prefix: String,
    history: OrderedMutex<ImageFile>,
}

impl SnapshotManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config: &SnapshotConfig,
        runtime_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            runtime_timeout,
            max_history: config.max_history.max(1),
            repository_prefix: config.repository_prefix.clone(),
            history: OrderedMutex::new(LockId::History, ImageFile::new()),
        }
    }

    pub fn repository(&self, name: &str) -> String {
        format!("{}{}", self.repository_prefix, name)
    }

    /// Replace the in-memory history with persisted state.
    pub fn load(&self, histories: ImageFile) {
        *self.history.lock() = histories;
    }

    pub fn export(&self) -> ImageFile {
        self.history.lock().clone()
    }

    /// Commit the filesystem of the stopped container `name`.
    ///
    /// The version is one above the highest recorded for `name`. If the
    /// history then exceeds `max_history` the oldest entries are evicted.
    pub async fn commit(&self, name: &str, message: &str) -> Result<CommitOutcome> {
        let info = runtime::with_timeout(self.runtime_timeout, "docker inspect", async {
            self.runtime.inspect(name).await
        })
        .await?
        .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if info.running {
            return Err(Error::Conflict {
                name: name.to_string(),
                reason: "must be stopped before it can be snapshotted".to_string(),
            });
        }

        let now = Utc::now();
        let version = {
            let history = self.history.lock();
            history
                .get(name)
                .and_then(|h| h.iter().map(version_of).max())
                .unwrap_or(0)
                + 1
        };
        let version_tag = format_tag(version, now);
        let image_ref = format!("{}:{}", self.repository(name), version_tag);

        runtime::with_timeout(self.runtime_timeout, "docker commit", async {
            self.runtime.commit(name, &image_ref, message).await
        })
        .await?;

        let record = SnapshotRecord {
            version_tag,
            image_ref,
            timestamp: now,
            message: message.to_string(),
        };
        info!(
            container = %name,
            tag = %record.version_tag,
            image = %record.image_ref,
            "Snapshot committed"
        );

        let evicted = {
            let mut history = self.history.lock();
            let entries = history.entry(name.to_string()).or_default();
            entries.push(record.clone());
            self.evict(name, entries)
        };

        Ok(CommitOutcome { record, evicted })
    }

    /// Drop the oldest entries beyond `max_history`.
    fn evict(&self, name: &str, entries: &mut Vec<SnapshotRecord>) -> Vec<SnapshotRecord> {
        if entries.len() <= self.max_history {
            return Vec::new();
        }
        let excess = entries.len() - self.max_history;
        let evicted: Vec<SnapshotRecord> = entries.drain(..excess).collect();
        for record in &evicted {
            debug!(container = %name, tag = %record.version_tag, "Evicting snapshot");
        }
        evicted
    }

    /// Delete the images of `records`. Returns the image references that
    /// could not be deleted.
    pub async fn delete_images(&self, records: &[SnapshotRecord]) -> Vec<String> {
        let mut failed = Vec::new();
        for record in records {
            let result = runtime::with_timeout(self.runtime_timeout, "docker rmi", async {
                self.runtime.remove_image(&record.image_ref).await
            })
            .await;
            match result {
                Ok(()) => debug!(image = %record.image_ref, "Deleted snapshot image"),
                Err(e) => {
                    warn!(image = %record.image_ref, error = %e, "Failed to delete snapshot image");
                    failed.push(record.image_ref.clone());
                }
            }
        }
        failed
    }

    /// History of `name`, newest first.
    pub fn list(&self, name: &str) -> Vec<SnapshotRecord> {
        let history = self.history.lock();
        history
            .get(name)
            .map(|h| h.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    /// Every snapshot of every container, newest first.
    pub fn list_all(&self) -> Vec<SnapshotListing> {
        let history = self.history.lock();
        let mut all: Vec<SnapshotListing> = history
            .iter()
            .flat_map(|(name, entries)| {
                entries.iter().map(move |record| SnapshotListing {
                    container: name.clone(),
                    record: record.clone(),
                })
            })
            .collect();
        all.sort_by(|a, b| {
            b.record
                .timestamp
                .cmp(&a.record.timestamp)
                .then_with(|| version_of(&b.record).cmp(&version_of(&a.record)))
                .then_with(|| a.container.cmp(&b.container))
        });
        all
    }

    /// Snapshot of `name` to start from.
    ///
    /// `None` picks the newest. A tag may be given bare (`v3_20240101_120000`)
    /// or as the full image reference.
    pub fn restore(&self, name: &str, tag: Option<&str>) -> Result<SnapshotRecord> {
        let history = self.history.lock();
        let entries = history.get(name).map(Vec::as_slice).unwrap_or(&[]);

        let found = match tag {
            None => entries.last(),
            Some(tag) => entries
                .iter()
                .rev()
                .find(|r| r.version_tag == tag || r.image_ref == tag),
        };

        found.cloned().ok_or_else(|| Error::SnapshotNotFound {
            container: name.to_string(),
            tag: tag.unwrap_or("latest").to_string(),
        })
    }

    /// Remove the whole history of `name`. The images still exist.
    pub fn purge(&self, name: &str) -> Vec<SnapshotRecord> {
        self.history.lock().remove(name).unwrap_or_default()
    }

    /// Adopt images under the repositories of `names` that have no record.
    ///
    /// Adopted entries are ordered by the version and time encoded in their
    /// tags, then the history is capped again. Returns the number adopted and
    /// the entries evicted by the cap.
    pub async fn recover(&self, names: &[String]) -> Result<(usize, Vec<SnapshotRecord>)> {
        let mut adopted = 0;
        let mut evicted = Vec::new();

        for name in names {
            let repository = self.repository(name);
            let scan = runtime::with_timeout(self.runtime_timeout, "docker images", async {
                self.runtime.list_images(&repository).await
            })
            .await;
            let images = match scan {
                Ok(images) => images,
                Err(RuntimeError::DaemonUnavailable) => {
                    return Err(RuntimeError::DaemonUnavailable.into())
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "Cannot scan snapshot images");
                    continue;
                }
            };

            let mut history = self.history.lock();
            let entries = history.entry(name.clone()).or_default();
            let mut changed = false;

            for image_ref in images {
                if entries.iter().any(|r| r.image_ref == image_ref) {
                    continue;
                }
                let Some(tag) = image_ref.strip_prefix(&format!("{}:", repository)) else {
                    continue;
                };
                let Some((_, timestamp)) = parse_tag(tag) else {
                    debug!(image = %image_ref, "Ignoring image with foreign tag");
                    continue;
                };

                warn!(container = %name, image = %image_ref, "Adopting orphan snapshot image");
                entries.push(SnapshotRecord {
                    version_tag: tag.to_string(),
                    image_ref: image_ref.clone(),
                    timestamp,
                    message: RECOVERED_MESSAGE.to_string(),
                });
                adopted += 1;
                changed = true;
            }

            if changed {
                entries.sort_by(|a, b| {
                    version_of(a)
                        .cmp(&version_of(b))
                        .then_with(|| a.timestamp.cmp(&b.timestamp))
                });
                evicted.extend(self.evict(name, entries));
            }
            if entries.is_empty() {
                history.remove(name);
            }
        }

        if adopted > 0 {
            info!(adopted, evicted = evicted.len(), "Recovered snapshot history");
        }
        Ok((adopted, evicted))
    }
}
