//! Service credentials: the ssh root password and the notebook token.

use crate::config::{ServiceConfig, ServiceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Length of generated passwords and tokens (~190 bits of entropy).
pub const SECRET_LENGTH: usize = 32;

/// Generate a random secret string using a CSPRNG (ChaCha12 via `thread_rng`).
pub fn generate_secret(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Credentials in effect for one container, fixed at creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_token: Option<String>,
}

impl Credentials {
    /// Resolve credentials for a new container.
    ///
    /// An explicitly supplied value wins, then the service default from
    /// config, then a generated secret. Services that are not configured get
    /// no credential.
    pub fn resolve(
        services: &BTreeMap<ServiceKind, ServiceConfig>,
        supplied: &Credentials,
    ) -> Self {
        let root_password = services.get(&ServiceKind::Ssh).map(|ssh| {
            supplied
                .root_password
                .clone()
                .or_else(|| ssh.password.clone())
                .unwrap_or_else(|| generate_secret(SECRET_LENGTH))
        });
        let notebook_token = services.get(&ServiceKind::Notebook).map(|nb| {
            supplied
                .notebook_token
                .clone()
                .or_else(|| nb.token.clone())
                .unwrap_or_else(|| generate_secret(SECRET_LENGTH))
        });

        Self {
            root_password,
            notebook_token,
        }
    }

    /// The credential recorded on a service's tunnel binding.
    pub fn for_service(&self, kind: ServiceKind) -> Option<String> {
        match kind {
            ServiceKind::Ssh => self.root_password.clone(),
            ServiceKind::Notebook => self.notebook_token.clone(),
            ServiceKind::App => None,
        }
    }

    /// Environment passed into the container.
    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(password) = &self.root_password {
            env.insert("ROOT_PASSWORD".to_string(), password.clone());
        }
        if let Some(token) = &self.notebook_token {
            env.insert("NOTEBOOK_TOKEN".to_string(), token.clone());
        }
        env
    }
}
