//! Status projection and drift reconciliation.
//!
//! The runtime is authoritative for whether a container exists and runs; the
//! record is authoritative for everything else. A refresh corrects the
//! record to what the runtime reports and brings tunnels in line with it.

use super::core::Orchestrator;
use crate::config::ServiceKind;
use crate::error::{Error, Result};
use crate::snapshot::SnapshotListing;
use crate::state::{LifecycleState, SnapshotRecord, TunnelBinding};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Read-only view of one container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: LifecycleState,
    pub container_id: Option<String>,
    pub image: String,
    pub base_image: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ip_address: Option<String>,
    pub ports: BTreeMap<ServiceKind, u16>,
    pub bindings: Vec<TunnelBinding>,
    /// Snapshots in history
    pub snapshots: usize,
    /// Operation currently holding the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy: Option<&'static str>,
}

/// A state correction made by reconciliation. `to` is `None` when the
/// record was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    pub container: String,
    pub from: LifecycleState,
    pub to: Option<LifecycleState>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub drifted: Vec<Drift>,
    /// Containers skipped because an operation held them
    pub skipped_busy: Vec<String>,
    pub errors: Vec<String>,
}

impl Orchestrator {
    /// Status of `name`, refreshed against the runtime first.
    ///
    /// While another operation holds the container the recorded status is
    /// returned as is, with `busy` naming that operation.
    pub async fn get_status(&self, name: &str) -> Result<ContainerStatus> {
        if self.record(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }

        match self.guards.try_acquire(name, "refresh") {
            Ok(_guard) => self.refresh(name).await?,
            Err(Error::Busy { operation, .. }) => {
                debug!(
                    container = %name,
                    operation = %operation,
                    "Busy; reporting recorded status"
                );
            }
            Err(e) => return Err(e),
        }

        self.status_of(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Status of every container, refreshed one by one.
    pub async fn list(&self) -> Vec<ContainerStatus> {
        let names: Vec<String> = self.ledger.lock().containers.keys().cloned().collect();
        let mut statuses = Vec::with_capacity(names.len());

        for name in names {
            match self.get_status(&name).await {
                Ok(status) => statuses.push(status),
                // Dropped by the refresh
                Err(Error::NotFound(_)) => {}
                Err(e) => {
                    warn!(container = %name, error = %e, "Status refresh failed");
                    statuses.extend(self.status_of(&name));
                }
            }
        }
        statuses
    }

    /// Refresh every container that no operation currently holds.
    pub async fn reconcile(&self) -> ReconcileReport {
        let names: Vec<String> = self.ledger.lock().containers.keys().cloned().collect();
        let mut report = ReconcileReport::default();

        for name in names {
            let _guard = match self.guards.try_acquire(&name, "refresh") {
                Ok(guard) => guard,
                Err(_) => {
                    report.skipped_busy.push(name);
                    continue;
                }
            };
            let Some(from) = self.record(&name).map(|r| r.state) else {
                continue;
            };
            report.checked += 1;

            match self.refresh(&name).await {
                Ok(()) => {
                    let to = self.record(&name).map(|r| r.state);
                    if to != Some(from) {
                        report.drifted.push(Drift {
                            container: name,
                            from,
                            to,
                        });
                    }
                }
                Err(e) => {
                    warn!(container = %name, error = %e, "Reconciliation failed");
                    report.errors.push(format!("{}: {}", name, e));
                }
            }
        }

        if !report.drifted.is_empty() {
            info!(
                checked = report.checked,
                drifted = report.drifted.len(),
                "Reconciled container state"
            );
        }
        report
    }

    /// Snapshot history of `name`, newest first.
    pub fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotRecord>> {
        let history = self.snapshots.list(name);
        if history.is_empty() && self.record(name).is_none() {
            return Err(Error::NotFound(name.to_string()));
        }
        Ok(history)
    }

    /// Snapshots of every container, newest first.
    pub fn list_all_snapshots(&self) -> Vec<SnapshotListing> {
        self.snapshots.list_all()
    }

    /// Correct the record of `name` to what the runtime reports.
    /// The caller holds the guard for `name`.
    async fn refresh(&self, name: &str) -> Result<()> {
        let Some(record) = self.record(name) else {
            return Ok(());
        };
        let info = self
            .call_runtime("docker inspect", self.runtime.inspect(name))
            .await
            .map_err(|e| self.runtime_error("refresh", name, e))?;
        let bindings = self.bindings(name);

        let Some(info) = info else {
            return match record.state {
                // Never finished, or finished deleting
                LifecycleState::Creating | LifecycleState::Deleting => {
                    self.drop_tunnels(name, bindings).await?;
                    self.forget(name);
                    note_drift(name, record.state, None);
                    self.persist().await;
                    Ok(())
                }
                LifecycleState::Stale if bindings.is_empty() => Ok(()),
                _ => {
                    self.drop_tunnels(name, bindings).await?;
                    self.mark_stale(name);
                    note_drift(name, record.state, Some(LifecycleState::Stale));
                    self.persist().await;
                    Ok(())
                }
            };
        };

        if info.running {
            let ip = info.ip_address.clone().filter(|ip| !ip.is_empty());
            let in_sync = record.state == LifecycleState::Running
                && self.bindings_complete(&bindings)
                && ip.is_some()
                && ip == record.ip_address;
            if in_sync {
                if record.container_id.as_deref() != Some(info.id.as_str()) {
                    self.update(name, |r, _| r.container_id = Some(info.id));
                    self.persist().await;
                }
                return Ok(());
            }

            // Started behind our back, lost tunnels, or moved address
            self.drop_tunnels(name, bindings).await?;
            self.update(name, |r, _| r.container_id = Some(info.id));
            if let Err(e) = self.republish(name).await {
                self.transition(name, LifecycleState::Unknown);
                self.persist().await;
                return Err(self.classify("refresh", name, e));
            }
            self.transition(name, LifecycleState::Running);
            note_drift(name, record.state, Some(LifecycleState::Running));
            self.persist().await;
            return Ok(());
        }

        let had_tunnels = !bindings.is_empty();
        self.drop_tunnels(name, bindings).await?;
        let changed = had_tunnels
            || record.state != LifecycleState::Stopped
            || record.container_id.as_deref() != Some(info.id.as_str());
        if changed {
            self.update(name, |r, _| {
                r.container_id = Some(info.id);
                r.ip_address = None;
                r.transition(LifecycleState::Stopped);
            });
            note_drift(name, record.state, Some(LifecycleState::Stopped));
            self.persist().await;
        }
        Ok(())
    }

    /// Close `bindings` during a refresh. Bindings that stay open are kept
    /// and make the container `unknown`.
    async fn drop_tunnels(&self, name: &str, bindings: Vec<TunnelBinding>) -> Result<()> {
        if bindings.is_empty() {
            return Ok(());
        }
        let mut open = bindings;
        match self.tunnels.close_all(name, &mut open).await {
            Ok(()) => {
                self.set_bindings(name, Vec::new());
                Ok(())
            }
            Err(e) => {
                self.update(name, |record, slot| {
                    record.transition(LifecycleState::Unknown);
                    *slot = open;
                });
                self.persist().await;
                Err(e)
            }
        }
    }

    fn status_of(&self, name: &str) -> Option<ContainerStatus> {
        let busy = self.guards.current(name);
        let (record, bindings) = {
            let ledger = self.ledger.lock();
            let record = ledger.containers.get(name)?.clone();
            let bindings = ledger.tunnels.get(name).cloned().unwrap_or_default();
            (record, bindings)
        };
        let snapshots = self.snapshots.list(name).len();

        Some(ContainerStatus {
            name: record.name,
            state: record.state,
            container_id: record.container_id,
            image: record.image,
            base_image: record.base_image,
            created_at: record.created_at,
            updated_at: record.updated_at,
            ip_address: record.ip_address,
            ports: bindings
                .iter()
                .map(|b| (b.service_type, b.public_port))
                .collect(),
            bindings,
            snapshots,
            busy,
        })
    }
}

fn note_drift(name: &str, from: LifecycleState, to: Option<LifecycleState>) {
    if to == Some(from) {
        return;
    }
    match to {
        Some(to) => warn!(container = %name, from = %from, to = %to, "Corrected state drift"),
        None => warn!(container = %name, from = %from, "Dropped record of missing container"),
    }
}
