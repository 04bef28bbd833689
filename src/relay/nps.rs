//! NPS relay client.
//!
//! NPS exposes a form-encoded HTTP API. Every request carries
//! `auth_key = md5(key + timestamp)` and `timestamp`; a JSON body with
//! `status == 1` means success. `index/add` does not return the new tunnel
//! id, so registration is followed by a lookup of the tunnel by port.

use super::{RelayError, TunnelId, TunnelRelay, TunnelRequest};
use crate::config::RelayConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const LOOKUP_DELAY: Duration = Duration::from_millis(500);

pub struct NpsRelay {
    client: Client,
    base_url: String,
    auth_key: String,
    client_id: u32,
    timeout: Duration,
    lookup_retries: u32,
}

/// Generic NPS command response.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    #[serde(default)]
    rows: Vec<TunnelRow>,
}

#[derive(Debug, Deserialize)]
struct TunnelRow {
    #[serde(rename = "Id")]
    id: i64,
    #[serde(rename = "Port")]
    port: u16,
}

#[derive(Debug, Deserialize)]
struct OneTunnel {
    #[serde(default)]
    code: i64,
}

/// `md5(key + timestamp)` as lowercase hex.
pub fn auth_signature(auth_key: &str, timestamp: u64) -> String {
    format!("{:x}", md5::compute(format!("{}{}", auth_key, timestamp)))
}

impl NpsRelay {
    pub fn new(config: &RelayConfig) -> Result<Self, RelayError> {
        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| RelayError::Unavailable(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.address.trim_end_matches('/').to_string(),
            auth_key: config.auth_key.clone(),
            client_id: config.client_id,
            timeout,
            lookup_retries: config.lookup_retries.max(1),
        })
    }

    fn auth_params(&self) -> [(&'static str, String); 2] {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        [
            ("auth_key", auth_signature(&self.auth_key, timestamp)),
            ("timestamp", timestamp.to_string()),
        ]
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        action: &'static str,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<T, RelayError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let request = self
            .client
            .post(&url)
            .query(&self.auth_params())
            .form(form)
            .send();

        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) if source.is_timeout() => {
                return Err(RelayError::Timeout {
                    action,
                    after: self.timeout,
                })
            }
            Ok(Err(source)) => return Err(RelayError::Http { action, source }),
            Err(_) => {
                return Err(RelayError::Timeout {
                    action,
                    after: self.timeout,
                })
            }
        };

        let response = response
            .error_for_status()
            .map_err(|source| RelayError::Http { action, source })?;
        let body = response
            .text()
            .await
            .map_err(|source| RelayError::Http { action, source })?;
        serde_json::from_str(&body).map_err(|e| RelayError::Decode {
            action,
            detail: format!("{} (body: {})", e, truncate(&body, 200)),
        })
    }

    async fn find_tunnel_by_port(&self, port: u16) -> Result<Option<TunnelId>, RelayError> {
        let list: TunnelList = self
            .post(
                "tunnel lookup",
                "index/gettunnel",
                &[
                    ("client_id", self.client_id.to_string()),
                    ("type", "tcp".to_string()),
                    ("search", String::new()),
                    ("offset", "0".to_string()),
                    ("limit", "1000".to_string()),
                ],
            )
            .await?;
        Ok(find_port(&list.rows, port))
    }

    async fn tunnel_exists(&self, tunnel_id: &TunnelId) -> Result<bool, RelayError> {
        let one: OneTunnel = self
            .post(
                "tunnel lookup",
                "index/getonetunnel",
                &[("id", tunnel_id.0.clone())],
            )
            .await?;
        Ok(one.code == 1)
    }
}

fn find_port(rows: &[TunnelRow], port: u16) -> Option<TunnelId> {
    rows.iter()
        .find(|row| row.port == port)
        .map(|row| TunnelId(row.id.to_string()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl TunnelRelay for NpsRelay {
    async fn register(&self, request: &TunnelRequest) -> Result<TunnelId, RelayError> {
        let added: StatusResponse = self
            .post(
                "register",
                "index/add",
                &[
                    ("type", "tcp".to_string()),
                    ("client_id", self.client_id.to_string()),
                    ("port", request.public_port.to_string()),
                    ("target", request.target.clone()),
                    ("remark", request.remark.clone()),
                ],
            )
            .await?;
        if added.status != 1 {
            return Err(RelayError::Rejected {
                action: "register",
                message: added.msg,
            });
        }

        // From here on the tunnel exists, so every failure is a lookup failure
        let port = request.public_port;
        for attempt in 1..=self.lookup_retries {
            let found = self
                .find_tunnel_by_port(port)
                .await
                .map_err(|e| RelayError::LookupFailed {
                    port,
                    detail: e.to_string(),
                })?;
            if let Some(id) = found {
                tracing::debug!(
                    port,
                    tunnel_id = %id,
                    "Registered relay tunnel"
                );
                return Ok(id);
            }
            if attempt < self.lookup_retries {
                tokio::time::sleep(LOOKUP_DELAY).await;
            }
        }

        Err(RelayError::LookupFailed {
            port,
            detail: format!("not listed after {} lookups", self.lookup_retries),
        })
    }

    async fn deregister(&self, tunnel_id: &TunnelId) -> Result<(), RelayError> {
        let deleted: StatusResponse = self
            .post("deregister", "index/del", &[("id", tunnel_id.0.clone())])
            .await?;
        if deleted.status == 1 {
            return Ok(());
        }

        // NPS reports a failed delete for unknown ids; confirm before treating it as gone
        if !self.tunnel_exists(tunnel_id).await? {
            tracing::debug!(tunnel_id = %tunnel_id, "Tunnel already absent on relay");
            return Ok(());
        }

        Err(RelayError::Rejected {
            action: "deregister",
            message: deleted.msg,
        })
    }
}
