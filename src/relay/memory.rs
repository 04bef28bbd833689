//! In-process tunnel relay.

use super::{RelayError, TunnelId, TunnelRelay, TunnelRequest};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Default)]
struct RelayState {
    tunnels: BTreeMap<TunnelId, TunnelRequest>,
    next_id: u64,
    /// Register calls that succeed before the injected failure
    fail_register_after: Option<u32>,
    fail_deregister: u32,
    /// Accept the next tunnel but report its lookup as failed
    lose_next_id: bool,
    register_delay: Option<Duration>,
    register_calls: u32,
    deregister_calls: u32,
}

/// Relay that keeps tunnels in a map and routes nothing.
///
/// Like a real relay it refuses a second tunnel on a port that is already
/// published.
#[derive(Debug, Default)]
pub struct InMemoryRelay {
    state: Mutex<RelayState>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next register call.
    pub fn fail_next_register(&self) {
        self.fail_register_after(0);
    }

    /// Let `successes` register calls through, then fail one.
    pub fn fail_register_after(&self, successes: u32) {
        self.state.lock().fail_register_after = Some(successes);
    }

    /// Accept the next register call but fail to report the tunnel id,
    /// leaving a live tunnel the caller does not know about.
    pub fn lose_next_tunnel_id(&self) {
        self.state.lock().lose_next_id = true;
    }

    /// Fail the next `times` deregister calls.
    pub fn fail_deregister_times(&self, times: u32) {
        self.state.lock().fail_deregister = times;
    }

    pub fn delay_register(&self, delay: Duration) {
        self.state.lock().register_delay = Some(delay);
    }

    pub fn active_tunnels(&self) -> Vec<(TunnelId, TunnelRequest)> {
        self.state
            .lock()
            .tunnels
            .iter()
            .map(|(id, req)| (id.clone(), req.clone()))
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.state.lock().tunnels.len()
    }

    pub fn is_registered(&self, tunnel_id: &TunnelId) -> bool {
        self.state.lock().tunnels.contains_key(tunnel_id)
    }

    pub fn register_calls(&self) -> u32 {
        self.state.lock().register_calls
    }

    pub fn deregister_calls(&self) -> u32 {
        self.state.lock().deregister_calls
    }
}

#[async_trait]
impl TunnelRelay for InMemoryRelay {
    async fn register(&self, request: &TunnelRequest) -> Result<TunnelId, RelayError> {
        let delay = self.state.lock().register_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.register_calls += 1;

        match state.fail_register_after {
            Some(0) => {
                state.fail_register_after = None;
                return Err(RelayError::Rejected {
                    action: "register",
                    message: "injected failure".into(),
                });
            }
            Some(n) => state.fail_register_after = Some(n - 1),
            None => {}
        }

        if state
            .tunnels
            .values()
            .any(|t| t.public_port == request.public_port)
        {
            return Err(RelayError::Rejected {
                action: "register",
                message: format!("port {} is already published", request.public_port),
            });
        }

        state.next_id += 1;
        let id = TunnelId(state.next_id.to_string());
        state.tunnels.insert(id.clone(), request.clone());
        if std::mem::take(&mut state.lose_next_id) {
            return Err(RelayError::LookupFailed {
                port: request.public_port,
                detail: "injected failure".into(),
            });
        }
        Ok(id)
    }

    async fn deregister(&self, tunnel_id: &TunnelId) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        state.deregister_calls += 1;
        if state.fail_deregister > 0 {
            state.fail_deregister -= 1;
            return Err(RelayError::Unavailable("injected failure".into()));
        }
        state.tunnels.remove(tunnel_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(port: u16) -> TunnelRequest {
        TunnelRequest {
            public_port: port,
            target: "172.17.0.2:22".into(),
            remark: "Container:c1_Service:ssh".into(),
        }
    }

    #[tokio::test]
    async fn test_register_and_idempotent_deregister() {
        let relay = InMemoryRelay::new();
        let id = relay.register(&req(10000)).await.unwrap();
        assert!(relay.is_registered(&id));
        relay.deregister(&id).await.unwrap();
        relay.deregister(&id).await.unwrap();
        assert_eq!(relay.tunnel_count(), 0);
    }

    #[tokio::test]
    async fn test_port_cannot_be_published_twice() {
        let relay = InMemoryRelay::new();
        relay.register(&req(10000)).await.unwrap();
        assert!(relay.register(&req(10000)).await.is_err());
    }

    #[tokio::test]
    async fn test_lost_tunnel_id_leaves_tunnel_live() {
        let relay = InMemoryRelay::new();
        relay.lose_next_tunnel_id();
        let err = relay.register(&req(10000)).await.unwrap_err();
        assert!(!err.is_rejection());
        assert_eq!(relay.tunnel_count(), 1);
        assert!(relay.register(&req(10001)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_register_after() {
        let relay = InMemoryRelay::new();
        relay.fail_register_after(1);
        assert!(relay.register(&req(1)).await.is_ok());
        assert!(relay.register(&req(2)).await.is_err());
        assert!(relay.register(&req(3)).await.is_ok());
    }
}
