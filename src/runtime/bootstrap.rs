//! Container entry script.
//!
//! Unless `container.command` overrides it, every dev container runs a small
//! shell script that sets the root password, starts sshd and launches the
//! notebook server in the background, then keeps PID 1 alive.

use crate::config::{ServiceConfig, ServiceKind};
use std::collections::BTreeMap;

/// Credentials in effect for a container.
pub struct BootstrapCredentials<'a> {
    pub root_password: Option<&'a str>,
    pub notebook_token: Option<&'a str>,
}

/// Single-quote `value` for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn startup_script(
    services: &BTreeMap<ServiceKind, ServiceConfig>,
    creds: &BootstrapCredentials<'_>,
) -> String {
    let mut script = String::from("set -e\n");

    if let Some(ssh) = services.get(&ServiceKind::Ssh) {
        script.push_str("mkdir -p /var/run/sshd\n");
        script.push_str("grep -q '^PermitRootLogin yes' /etc/ssh/sshd_config || echo 'PermitRootLogin yes' >> /etc/ssh/sshd_config\n");
        if let Some(password) = creds.root_password {
            script.push_str(&format!(
                "echo {} | chpasswd\n",
                shell_quote(&format!("root:{}", password))
            ));
        }
        script.push_str("ssh-keygen -A\n");
        script.push_str(&format!("/usr/sbin/sshd -p {} &\n", ssh.port));
    }

    if let Some(notebook) = services.get(&ServiceKind::Notebook) {
        let dir = notebook.notebook_dir();
        script.push_str(&format!(
            "mkdir -p {dir} && chmod -R 777 {dir}\n",
            dir = shell_quote(dir)
        ));
        script.push_str(
            "[ -f /root/miniconda3/bin/activate ] && . /root/miniconda3/bin/activate || true\n",
        );
        script.push_str(&format!(
            "jupyter lab --ip=0.0.0.0 --port={} --allow-root --no-browser \
             --ServerApp.token={} --notebook-dir={} --ServerApp.base_url={} \
             > /var/log/jupyter.log 2>&1 &\n",
            notebook.port,
            shell_quote(creds.notebook_token.unwrap_or("")),
            shell_quote(dir),
            shell_quote(notebook.base_url()),
        ));
    }

    script.push_str("exec tail -f /dev/null\n");
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_services() -> BTreeMap<ServiceKind, ServiceConfig> {
        ServiceKind::ALL
            .iter()
            .map(|k| (*k, ServiceConfig::default_for(*k)))
            .collect()
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_script_starts_configured_services() {
        let script = startup_script(
            &all_services(),
            &BootstrapCredentials {
                root_password: Some("pw"),
                notebook_token: Some("tok"),
            },
        );
        assert!(script.contains("'root:pw' | chpasswd"));
        assert!(script.contains("/usr/sbin/sshd -p 22"));
        assert!(script.contains("--port=8888"));
        assert!(script.contains("--ServerApp.token='tok'"));
        assert!(script.contains("--ServerApp.base_url='/jupyter'"));
        assert!(script.ends_with("exec tail -f /dev/null\n"));
    }

    #[test]
    fn test_script_skips_unconfigured_services() {
        let mut services = all_services();
        services.remove(&ServiceKind::Notebook);
        let script = startup_script(
            &services,
            &BootstrapCredentials {
                root_password: None,
                notebook_token: None,
            },
        );
        assert!(!script.contains("jupyter"));
        assert!(!script.contains("chpasswd"));
        assert!(script.contains("sshd"));
    }
}
