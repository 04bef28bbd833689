//! Tunnel coordination.
//!
//! Turns a container's configured services into relay tunnels on freshly
//! allocated public ports, and tears them down again. Ordering rules:
//!
//! - A public port is allocated before its tunnel is registered.
//! - A port goes back to the pool only after the relay confirmed the
//!   tunnel is gone, or refused to create it. A tunnel that could not be
//!   removed, or whose registration outcome is unknown, keeps its port.
//! - A failed registration rolls back the services already published for
//!   the same container, so a container is never half tunneled.

use crate::config::ServiceKind;
use crate::error::Error;
use crate::port::{PortAllocator, PortOwner};
use crate::relay::{RelayError, TunnelId, TunnelRelay, TunnelRequest};
use crate::state::TunnelBinding;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A service to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub kind: ServiceKind,
    pub internal_port: u16,
    pub credential: Option<String>,
}

/// Why [`TunnelCoordinator::open_all`] gave up.
#[derive(Debug)]
pub enum OpenFailure {
    /// Everything published so far was removed again.
    RolledBack(Error),
    /// Rollback could not remove some tunnels; they keep their ports.
    Partial {
        cause: Error,
        remaining: Vec<TunnelBinding>,
    },
    /// A registration timed out, or the relay accepted it without
    /// reporting an id. Its outcome is unknown, so nothing is rolled back
    /// and the bindings confirmed so far are handed back.
    Unsettled {
        cause: Error,
        established: Vec<TunnelBinding>,
        /// Port whose registration outcome is unknown. It stays allocated.
        pending_port: u16,
    },
}

pub struct TunnelCoordinator {
    relay: Arc<dyn TunnelRelay>,
    ports: Arc<PortAllocator>,
    relay_timeout: Duration,
    teardown_attempts: u32,
}

impl TunnelCoordinator {
    pub fn new(
        relay: Arc<dyn TunnelRelay>,
        ports: Arc<PortAllocator>,
        relay_timeout: Duration,
        teardown_retries: u32,
    ) -> Self {
        Self {
            relay,
            ports,
            relay_timeout,
            teardown_attempts: teardown_retries.max(1),
        }
    }

    /// Publish every service of `container`, whose runtime address is `ip`.
    ///
    /// Returns one binding per endpoint, in endpoint order.
    pub async fn open_all(
        &self,
        container: &str,
        ip: &str,
        endpoints: &[ServiceEndpoint],
    ) -> std::result::Result<Vec<TunnelBinding>, OpenFailure> {
        let mut established: Vec<TunnelBinding> = Vec::with_capacity(endpoints.len());

        for endpoint in endpoints {
            let public_port = match self
                .ports
                .acquire(PortOwner::new(container, endpoint.kind))
            {
                Ok(port) => port,
                Err(e) => return Err(self.rollback(container, established, e).await),
            };

            let request = TunnelRequest {
                public_port,
                target: format!("{}:{}", ip, endpoint.internal_port),
                remark: format!("Container:{}_Service:{}", container, endpoint.kind),
            };

            match self.register(&request).await {
                Ok(tunnel_id) => {
                    info!(
                        container = %container,
                        service = %endpoint.kind,
                        port = public_port,
                        tunnel_id = %tunnel_id,
                        "Tunnel registered"
                    );
                    established.push(TunnelBinding {
                        service_type: endpoint.kind,
                        internal_port: endpoint.internal_port,
                        public_port,
                        tunnel_id,
                        credential: endpoint.credential.clone(),
                    });
                }
                Err(e) if e.is_rejection() => {
                    // Relay refused, so no tunnel exists on this port
                    self.ports.release(public_port);
                    return Err(self
                        .rollback(container, established, Error::RelayFailure(e))
                        .await);
                }
                Err(e) => {
                    warn!(
                        container = %container,
                        service = %endpoint.kind,
                        port = public_port,
                        error = %e,
                        "Tunnel registration outcome unknown; keeping its port allocated"
                    );
                    let cause = if e.is_timeout() {
                        Error::Timeout {
                            operation: format!("{} tunnel registration", endpoint.kind),
                            container: container.to_string(),
                            after: self.relay_timeout,
                        }
                    } else {
                        Error::RelayFailure(e)
                    };
                    return Err(OpenFailure::Unsettled {
                        cause,
                        established,
                        pending_port: public_port,
                    });
                }
            }
        }

        Ok(established)
    }

    /// Remove every binding in `bindings`, releasing each port after its
    /// tunnel is confirmed gone.
    ///
    /// Closed bindings are drained from the vector. On failure the bindings
    /// that could not be closed stay in it and the last error is returned.
    pub async fn close_all(
        &self,
        container: &str,
        bindings: &mut Vec<TunnelBinding>,
    ) -> Result<(), Error> {
        let mut remaining = Vec::new();
        let mut last_error = None;

        for binding in std::mem::take(bindings) {
            match self.deregister_with_retry(&binding.tunnel_id).await {
                Ok(()) => {
                    self.ports.release(binding.public_port);
                    debug!(
                        container = %container,
                        service = %binding.service_type,
                        port = binding.public_port,
                        "Tunnel closed"
                    );
                }
                Err(e) => {
                    warn!(
                        container = %container,
                        service = %binding.service_type,
                        tunnel_id = %binding.tunnel_id,
                        error = %e,
                        "Tunnel teardown failed"
                    );
                    remaining.push(binding);
                    last_error = Some(e);
                }
            }
        }

        *bindings = remaining;
        match last_error {
            None => Ok(()),
            Some(e) => Err(Error::RelayFailure(e)),
        }
    }

    async fn register(&self, request: &TunnelRequest) -> Result<TunnelId, RelayError> {
        match tokio::time::timeout(self.relay_timeout, self.relay.register(request)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::Timeout {
                action: "register",
                after: self.relay_timeout,
            }),
        }
    }

    /// Deregistration is idempotent, so it is the one relay call that is retried.
    async fn deregister_with_retry(&self, tunnel_id: &TunnelId) -> Result<(), RelayError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            let result =
                match tokio::time::timeout(self.relay_timeout, self.relay.deregister(tunnel_id))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::Timeout {
                        action: "deregister",
                        after: self.relay_timeout,
                    }),
                };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.teardown_attempts => {
                    debug!(
                        tunnel_id = %tunnel_id,
                        attempt,
                        error = %e,
                        "Deregister failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn rollback(
        &self,
        container: &str,
        mut established: Vec<TunnelBinding>,
        cause: Error,
    ) -> OpenFailure {
        if established.is_empty() {
            return OpenFailure::RolledBack(cause);
        }

        warn!(
            container = %container,
            count = established.len(),
            "Rolling back published tunnels"
        );
        match self.close_all(container, &mut established).await {
            Ok(()) => OpenFailure::RolledBack(cause),
            Err(_) => OpenFailure::Partial {
                cause,
                remaining: established,
            },
        }
    }
}

/// Human-readable names of live tunnels, for manual reconciliation notes.
pub fn describe_bindings(bindings: &[TunnelBinding]) -> Vec<String> {
    bindings
        .iter()
        .map(|b| {
            format!(
                "{} tunnel {} on public port {}",
                b.service_type, b.tunnel_id, b.public_port
            )
        })
        .collect()
}
