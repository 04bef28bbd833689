//! Docker CLI runtime.
//!
//! All Docker CLI interactions go through [`DockerRuntime`], which provides
//! consistent timeout handling, error mapping to [`RuntimeError`], and a
//! single point where `Command::new("docker")` is constructed.

use super::{ContainerRuntime, ContainerSpec, RuntimeError, RuntimeInfo, MANAGED_LABEL};
use async_trait::async_trait;
use std::process::Output;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    timeout: Duration,
}

impl DockerRuntime {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    /// Run a docker command with the configured timeout, returning raw Output.
    async fn run(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        run_docker(args, self.timeout).await
    }

    /// Run a docker command, returning Output only if exit 0.
    async fn run_success(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        let output = self.run(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(RuntimeError::failed(command_string(args), &output))
        }
    }

    /// Build `docker create` arguments for a spec.
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            spec.name.clone(),
            "--hostname".into(),
            spec.hostname.clone(),
            "--restart".into(),
            format!("on-failure:{}", spec.restart_retries),
        ];

        for (key, value) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref network) = spec.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        let resources = &spec.resources;
        let flags = [
            ("--memory", &resources.memory),
            ("--memory-swap", &resources.memory_swap),
            ("--cpuset-cpus", &resources.cpuset),
            ("--cpus", &resources.cpus),
            ("--shm-size", &resources.shm_size),
        ];
        for (flag, value) in flags {
            if let Some(v) = value {
                args.push(flag.into());
                args.push(v.clone());
            }
        }
        if let Some(gpus) = resources.gpus_arg() {
            args.push("--runtime".into());
            args.push("nvidia".into());
            args.push("--gpus".into());
            args.push(gpus);
        }

        for volume in &spec.volumes {
            args.push("-v".into());
            args.push(volume.to_docker_arg());
        }

        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        if let Some(ref dir) = spec.working_dir {
            args.push("-w".into());
            args.push(dir.clone());
        }

        args.push(spec.image.clone());

        if let Some(ref command) = spec.command {
            args.push("/bin/bash".into());
            args.push("-c".into());
            args.push(command.clone());
        }

        args
    }

    pub async fn daemon_healthy(&self, timeout: Duration) -> bool {
        matches!(
            run_docker(&["info", "--format", "{{.ServerVersion}}"], timeout).await,
            Ok(o) if o.status.success()
        )
    }
}

async fn run_docker(args: &[&str], timeout: Duration) -> Result<Output, RuntimeError> {
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("docker").args(args).output(),
    )
    .await;

    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(RuntimeError::exec_failed(command_string(args), e)),
        Err(_) => Err(RuntimeError::timeout(command_string(args), timeout)),
    }
}

fn command_string(args: &[&str]) -> String {
    // Only the subcommand; full create args carry credentials in env flags
    match args.first() {
        Some(sub) => format!("docker {}", sub),
        None => "docker".to_string(),
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

/// Parse `docker inspect --format '{{json .}}'` output.
pub(crate) fn parse_inspect(json: &str) -> Result<RuntimeInfo, RuntimeError> {
    let value: serde_json::Value =
        serde_json::from_str(json.trim()).map_err(|e| RuntimeError::Unexpected {
            command: "docker inspect".into(),
            detail: e.to_string(),
        })?;

    let str_at = |pointer: &str| {
        value
            .pointer(pointer)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let id = str_at("/Id");
    if id.is_empty() {
        return Err(RuntimeError::Unexpected {
            command: "docker inspect".into(),
            detail: "missing Id".into(),
        });
    }

    let mut ip_address = Some(str_at("/NetworkSettings/IPAddress")).filter(|ip| !ip.is_empty());
    if ip_address.is_none() {
        ip_address = value
            .pointer("/NetworkSettings/Networks")
            .and_then(|n| n.as_object())
            .and_then(|networks| {
                networks
                    .values()
                    .filter_map(|n| n.get("IPAddress").and_then(|ip| ip.as_str()))
                    .find(|ip| !ip.is_empty())
                    .map(str::to_string)
            });
    }

    Ok(RuntimeInfo {
        id,
        name: str_at("/Name").trim_start_matches('/').to_string(),
        running: value
            .pointer("/State/Running")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        status: str_at("/State/Status"),
        image: str_at("/Config/Image"),
        ip_address,
    })
}

/// Parse `docker ps --format '{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Image}}'` output.
pub(crate) fn parse_ps(stdout: &str) -> Vec<RuntimeInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(4, '\t');
            let id = parts.next()?.to_string();
            let name = parts.next()?.to_string();
            let status = parts.next()?.to_string();
            let image = parts.next().unwrap_or_default().to_string();
            if id.is_empty() || name.is_empty() {
                return None;
            }
            Some(RuntimeInfo {
                id,
                name,
                running: status == "running",
                status,
                image,
                ip_address: None,
            })
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let args = Self::create_args(spec);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("Unable to find image") || stderr.contains("No such image") {
                return Err(RuntimeError::ImageNotFound {
                    image: spec.image.clone(),
                });
            }
            return Err(RuntimeError::failed("docker create", &output));
        }
        let id = String::from_utf8_lossy(&output.stdout)
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if id.is_empty() {
            return Err(RuntimeError::Unexpected {
                command: "docker create".into(),
                detail: "no container id on stdout".into(),
            });
        }
        Ok(id)
    }

    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["start", container]).await?;
        if output.status.success() {
            return Ok(());
        }
        if is_missing_container(&stderr_of(&output)) {
            return Err(RuntimeError::not_found(container));
        }
        Err(RuntimeError::failed("docker start", &output))
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["stop", container]).await?;
        if output.status.success() {
            return Ok(());
        }
        if is_missing_container(&stderr_of(&output)) {
            return Err(RuntimeError::not_found(container));
        }
        Err(RuntimeError::failed("docker stop", &output))
    }

    async fn remove(&self, container: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["rm", "-f", container]).await?;
        if output.status.success() || is_missing_container(&stderr_of(&output)) {
            return Ok(());
        }
        Err(RuntimeError::failed("docker rm -f", &output))
    }

    async fn commit(
        &self,
        container: &str,
        image_ref: &str,
        message: &str,
    ) -> Result<(), RuntimeError> {
        let output = self
            .run(&["commit", "-m", message, container, image_ref])
            .await?;
        if output.status.success() {
            return Ok(());
        }
        if is_missing_container(&stderr_of(&output)) {
            return Err(RuntimeError::not_found(container));
        }
        Err(RuntimeError::failed("docker commit", &output))
    }

    async fn remove_image(&self, image_ref: &str) -> Result<(), RuntimeError> {
        let output = self.run(&["rmi", "-f", image_ref]).await?;
        if output.status.success() || stderr_of(&output).contains("No such image") {
            return Ok(());
        }
        Err(RuntimeError::failed("docker rmi", &output))
    }

    async fn inspect(&self, container: &str) -> Result<Option<RuntimeInfo>, RuntimeError> {
        let output = self
            .run(&["inspect", "--type", "container", "--format", "{{json .}}", container])
            .await?;
        if !output.status.success() {
            if is_missing_container(&stderr_of(&output)) {
                return Ok(None);
            }
            return Err(RuntimeError::failed("docker inspect", &output));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout)).map(Some)
    }

    async fn list(&self) -> Result<Vec<RuntimeInfo>, RuntimeError> {
        let filter = format!("label={}=true", MANAGED_LABEL);
        let output = self
            .run_success(&[
                "ps",
                "-a",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.State}}\t{{.Image}}",
            ])
            .await?;
        Ok(parse_ps(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn list_images(&self, repository: &str) -> Result<Vec<String>, RuntimeError> {
        let output = self
            .run_success(&[
                "images",
                repository,
                "--format",
                "{{.Repository}}:{{.Tag}}",
            ])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty() && !s.contains("<none>"))
            .collect())
    }
}

/// Check Docker daemon health with retry and exponential backoff.
///
/// Backoff runs 100ms, 200ms, 400ms... capped at 2 seconds, and gives up
/// once `total_timeout` has elapsed.
pub async fn check_daemon_with_retry(max_attempts: u32, total_timeout: Duration) -> bool {
    use tokio::time::sleep;

    let probe = DockerRuntime::new(Duration::from_secs(2));
    let start = std::time::Instant::now();
    let mut delay = Duration::from_millis(100);

    for attempt in 1..=max_attempts {
        if start.elapsed() >= total_timeout {
            break;
        }

        if probe.daemon_healthy(Duration::from_secs(2)).await {
            if attempt > 1 {
                tracing::info!(
                    "Docker daemon became healthy after {} attempts ({:?})",
                    attempt,
                    start.elapsed()
                );
            }
            return true;
        }

        if attempt < max_attempts {
            tracing::debug!(
                "Docker daemon health check attempt {}/{} failed, retrying in {:?}",
                attempt,
                max_attempts,
                delay
            );
            sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(2));
        }
    }

    tracing::warn!(
        "Docker daemon unhealthy after {} attempts ({:?})",
        max_attempts,
        start.elapsed()
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceLimits, VolumeMount};
    use std::collections::BTreeMap;

    fn spec() -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        let mut env = BTreeMap::new();
        env.insert("ROOT_PASSWORD".to_string(), "pw".to_string());
        ContainerSpec {
            name: "c1".into(),
            image: "nvidia/cuda:12.2-devel".into(),
            hostname: "devbox".into(),
            network: None,
            resources: ResourceLimits {
                cpuset: Some("0-3".into()),
                ..Default::default()
            },
            volumes: vec![VolumeMount {
                source: "/data".into(),
                target: "/data".into(),
                read_only: true,
            }],
            env,
            labels,
            command: Some("exec tail -f /dev/null".into()),
            working_dir: Some("/root".into()),
            restart_retries: 3,
        }
    }

    #[test]
    fn test_create_args() {
        let args = DockerRuntime::create_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name c1 --hostname devbox --restart on-failure:3"));
        assert!(joined.contains("--label devbox.managed=true"));
        assert!(joined.contains("--memory 4g"));
        assert!(joined.contains("--cpuset-cpus 0-3"));
        assert!(joined.contains("--shm-size 1g"));
        assert!(joined.contains("--runtime nvidia --gpus all"));
        assert!(joined.contains("-v /data:/data:ro"));
        assert!(joined.contains("-e ROOT_PASSWORD=pw"));
        let image_pos = args.iter().position(|a| a == "nvidia/cuda:12.2-devel").unwrap();
        assert_eq!(args[image_pos + 1], "/bin/bash");
        assert_eq!(args.last().unwrap(), "exec tail -f /dev/null");
    }

    #[test]
    fn test_create_args_without_gpu() {
        let mut spec = spec();
        spec.resources.gpu = false;
        let args = DockerRuntime::create_args(&spec);
        assert!(!args.iter().any(|a| a == "--gpus"));
        assert!(!args.iter().any(|a| a == "nvidia"));
    }

    #[test]
    fn test_command_string_hides_arguments() {
        assert_eq!(command_string(&["create", "-e", "ROOT_PASSWORD=pw"]), "docker create");
    }

    #[test]
    fn test_parse_inspect() {
        let json = r#"{
            "Id": "abc123",
            "Name": "/c1",
            "State": {"Running": true, "Status": "running"},
            "Config": {"Image": "ubuntu:22.04"},
            "NetworkSettings": {"IPAddress": "", "Networks": {"devnet": {"IPAddress": "172.18.0.5"}}}
        }"#;
        let info = parse_inspect(json).unwrap();
        assert_eq!(info.id, "abc123");
        assert_eq!(info.name, "c1");
        assert!(info.running);
        assert_eq!(info.image, "ubuntu:22.04");
        assert_eq!(info.ip_address.as_deref(), Some("172.18.0.5"));
    }

    #[test]
    fn test_parse_inspect_rejects_garbage() {
        assert!(parse_inspect("not json").is_err());
        assert!(parse_inspect("{}").is_err());
    }

    #[test]
    fn test_parse_ps() {
        let out = "abc\tc1\trunning\tubuntu\ndef\tc2\texited\tubuntu\n\n";
        let infos = parse_ps(out);
        assert_eq!(infos.len(), 2);
        assert!(infos[0].running);
        assert!(!infos[1].running);
        assert_eq!(infos[1].status, "exited");
    }
}
