use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A service exposed from inside a container through a relay tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Ssh,
    Notebook,
    App,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 3] = [ServiceKind::Ssh, ServiceKind::Notebook, ServiceKind::App];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Ssh => "ssh",
            ServiceKind::Notebook => "notebook",
            ServiceKind::App => "app",
        }
    }

    /// Well-known port the service listens on inside the container.
    pub fn default_port(&self) -> u16 {
        match self {
            ServiceKind::Ssh => 22,
            ServiceKind::Notebook => 8888,
            ServiceKind::App => 5000,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(ServiceKind::Ssh),
            "notebook" | "jupyter" => Ok(ServiceKind::Notebook),
            "app" => Ok(ServiceKind::App),
            other => Err(format!(
                "unknown service '{}' (expected ssh, notebook or app)",
                other
            )),
        }
    }
}

/// Per-service settings.
///
/// `password` applies to ssh and `token` to the notebook; both act as the
/// default credential for new containers and are generated when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Port the service listens on inside the container
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Notebook URL prefix (e.g. "/jupyter")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Notebook root directory inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_dir: Option<String>,
}

impl ServiceConfig {
    pub fn on_port(port: u16) -> Self {
        Self {
            port,
            password: None,
            token: None,
            base_url: None,
            notebook_dir: None,
        }
    }

    pub fn default_for(kind: ServiceKind) -> Self {
        let mut config = Self::on_port(kind.default_port());
        if kind == ServiceKind::Notebook {
            config.base_url = Some("/jupyter".to_string());
            config.notebook_dir = Some("/root".to_string());
        }
        config
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or("/jupyter")
    }

    pub fn notebook_dir(&self) -> &str {
        self.notebook_dir.as_deref().unwrap_or("/root")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_parsing() {
        assert_eq!("SSH".parse::<ServiceKind>(), Ok(ServiceKind::Ssh));
        assert_eq!("jupyter".parse::<ServiceKind>(), Ok(ServiceKind::Notebook));
        assert!("ftp".parse::<ServiceKind>().is_err());
    }

    #[test]
    fn test_service_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ServiceKind::Notebook).unwrap();
        assert_eq!(json, "\"notebook\"");
    }
}
