use super::{parse_duration_string, Config, RelayKind, ServiceKind};
use crate::error::{Error, Result};
use std::collections::HashSet;

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_ports()?;
        self.validate_services()?;

        self.container.resources.validate()?;
        for volume in &self.container.volumes {
            volume.validate()?;
        }
        if self.container.hostname.trim().is_empty() {
            return Err(Error::Validation(
                "container.hostname must not be empty".to_string(),
            ));
        }

        if self.snapshots.max_history == 0 {
            return Err(Error::Validation(
                "snapshots.max_history must be at least 1".to_string(),
            ));
        }
        if self.snapshots.repository_prefix.chars().any(|c| c.is_ascii_uppercase() || c == ':')
        {
            return Err(Error::Validation(format!(
                "snapshots.repository_prefix '{}' must be lowercase and must not contain ':'",
                self.snapshots.repository_prefix
            )));
        }

        self.validate_persistence()?;
        self.validate_durations()?;
        self.validate_relay()?;

        Ok(())
    }

    fn validate_ports(&self) -> Result<()> {
        let ports = &self.ports;
        if ports.start == 0 {
            return Err(Error::Validation(
                "ports.start must be at least 1".to_string(),
            ));
        }
        if ports.start > ports.end {
            return Err(Error::Validation(format!(
                "ports.start ({}) must not exceed ports.end ({})",
                ports.start, ports.end
            )));
        }

        let range = ports.range();
        let reserved_in_range = ports.reserved.iter().filter(|p| range.contains(**p)).count();
        let total = (ports.end - ports.start) as usize + 1;
        if reserved_in_range >= total {
            return Err(Error::Validation(format!(
                "every port in {}-{} is reserved; nothing left to allocate",
                ports.start, ports.end
            )));
        }

        for preferred in &ports.prefer_ranges {
            if preferred.start > preferred.end
                || !range.contains(preferred.start)
                || !range.contains(preferred.end)
            {
                return Err(Error::Validation(format!(
                    "ports.prefer_ranges entry {}-{} must lie inside {}-{}",
                    preferred.start, preferred.end, ports.start, ports.end
                )));
            }
        }
        Ok(())
    }

    fn validate_services(&self) -> Result<()> {
        if self.services.is_empty() {
            return Err(Error::Validation(
                "at least one service (ssh, notebook, app) must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (kind, service) in &self.services {
            if service.port == 0 {
                return Err(Error::Validation(format!(
                    "services.{}.port must not be 0",
                    kind
                )));
            }
            if !seen.insert(service.port) {
                return Err(Error::Validation(format!(
                    "services.{}.port {} is used by another service",
                    kind, service.port
                )));
            }
            if *kind == ServiceKind::Notebook {
                if let Some(ref base_url) = service.base_url {
                    if !base_url.starts_with('/') {
                        return Err(Error::Validation(format!(
                            "services.notebook.base_url '{}' must start with '/'",
                            base_url
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_persistence(&self) -> Result<()> {
        let p = &self.persistence;
        if p.tunnel_state_file.as_os_str().is_empty() || p.image_mapping_file.as_os_str().is_empty()
        {
            return Err(Error::Validation(
                "persistence file paths must not be empty".to_string(),
            ));
        }
        if p.tunnel_state_file == p.image_mapping_file {
            return Err(Error::Validation(format!(
                "persistence.tunnel_state_file and persistence.image_mapping_file must differ (both are '{}')",
                p.tunnel_state_file.display()
            )));
        }
        if !p.save_on_mutation && p.autosave_interval.is_none() {
            return Err(Error::Validation(
                "persistence.save_on_mutation is off and no autosave_interval is set; state would never be written".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_durations(&self) -> Result<()> {
        let durations = [
            ("runtime.timeout", Some(&self.runtime.timeout)),
            ("relay.timeout", Some(&self.relay.timeout)),
            (
                "persistence.autosave_interval",
                self.persistence.autosave_interval.as_ref(),
            ),
        ];

        for (field, value) in durations {
            let Some(value) = value else { continue };
            match parse_duration_string(value) {
                Some(d) if !d.is_zero() => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "{} '{}' is invalid. Use formats like '10s', '5m', '500ms'",
                        field, value
                    )))
                }
            }
        }
        Ok(())
    }

    fn validate_relay(&self) -> Result<()> {
        if self.relay.kind != RelayKind::Nps {
            return Ok(());
        }
        let url = url::Url::parse(&self.relay.address).map_err(|e| {
            Error::Validation(format!(
                "relay.address '{}' is not a valid URL: {}",
                self.relay.address, e
            ))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Validation(format!(
                "relay.address '{}' must use http or https",
                self.relay.address
            )));
        }
        if self.relay.lookup_retries == 0 || self.relay.teardown_retries == 0 {
            return Err(Error::Validation(
                "relay.lookup_retries and relay.teardown_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortRange, ServiceConfig};

    fn valid() -> Config {
        Config::default()
    }

    #[test]
    fn test_default_config_is_valid() {
        valid().validate().unwrap();
    }

    #[test]
    fn test_fully_reserved_range_rejected() {
        let mut config = valid();
        config.ports.start = 100;
        config.ports.end = 101;
        config.ports.reserved = [100, 101].into_iter().collect();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefer_range_outside_range_rejected() {
        let mut config = valid();
        config.ports.prefer_ranges = vec![PortRange {
            start: 9000,
            end: 9100,
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_internal_ports_rejected() {
        let mut config = valid();
        config
            .services
            .insert(ServiceKind::App, ServiceConfig::on_port(22));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("used by another service"));
    }

    #[test]
    fn test_no_services_rejected() {
        let mut config = valid();
        config.services.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_history_rejected() {
        let mut config = valid();
        config.snapshots.max_history = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_relay_address_rejected() {
        let mut config = valid();
        config.relay.address = "not a url".into();
        assert!(config.validate().is_err());

        config.relay.kind = RelayKind::Memory;
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_durations_rejected() {
        let mut config = valid();
        config.runtime.timeout = "forever".into();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.persistence.autosave_interval = Some("0s".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_same_persistence_paths_rejected() {
        let mut config = valid();
        config.persistence.image_mapping_file = config.persistence.tunnel_state_file.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_write_never_scheduled_rejected() {
        let mut config = valid();
        config.persistence.save_on_mutation = false;
        assert!(config.validate().is_err());
        config.persistence.autosave_interval = Some("1m".into());
        config.validate().unwrap();
    }
}
