use crate::output::UserOutput;
use devbox::Parser as ConfigParser;
use std::path::PathBuf;

pub fn run_validate(config_path: Option<PathBuf>, out: &dyn UserOutput) -> anyhow::Result<()> {
    let parser = ConfigParser::new();
    let config_path = if let Some(path) = config_path {
        path
    } else {
        match parser.find_config_file() {
            Ok(path) => path,
            Err(_) => {
                out.error("Error: No configuration file found");
                out.error(&format!(
                    "\nSearched for devbox.yaml in:\n  - Current directory: {}\n  - Parent directories up to root",
                    std::env::current_dir()?.display()
                ));
                return Err(anyhow::anyhow!("Configuration file not found"));
            }
        }
    };

    out.status(&format!("Validating {}...", config_path.display()));

    // load_config validates as well
    let config = match parser.load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            out.error("Configuration is invalid");
            return Err(e.into());
        }
    };

    out.success("Configuration is valid");
    out.blank();

    let ports = &config.ports;
    out.status(&format!(
        "Ports: {}-{} ({:?}), {} reserved",
        ports.start,
        ports.end,
        ports.strategy,
        ports.reserved.len()
    ));
    out.status(&format!("Services: {}", config.services.len()));
    for (kind, service) in &config.services {
        out.status(&format!("  - {} (port {})", kind, service.port));
    }
    out.status(&format!(
        "Snapshots: keep {} under {}<name>",
        config.snapshots.max_history, config.snapshots.repository_prefix
    ));
    out.status(&format!(
        "State: {} and {}",
        config.persistence.tunnel_state_file.display(),
        config.persistence.image_mapping_file.display()
    ));

    Ok(())
}
