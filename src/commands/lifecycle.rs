use super::emit;
use crate::output::UserOutput;
use devbox::config::{ResourceLimits, VolumeMount};
use devbox::credentials::Credentials;
use devbox::orchestrator::{CreateOptions, StartResult, StopOptions};
use devbox::Orchestrator;

/// Create flags that override config.
pub struct CreateArgs {
    pub image: String,
    pub password: Option<String>,
    pub token: Option<String>,
    pub memory: Option<String>,
    pub cpuset: Option<String>,
    pub cpus: Option<String>,
    pub shm_size: Option<String>,
    /// `Some(true)` for --gpu, `Some(false)` for --no-gpu
    pub gpu: Option<bool>,
    pub volumes: Vec<String>,
}

impl CreateArgs {
    fn into_options(self, defaults: &ResourceLimits) -> anyhow::Result<CreateOptions> {
        let overridden = self.memory.is_some()
            || self.cpuset.is_some()
            || self.cpus.is_some()
            || self.shm_size.is_some()
            || self.gpu.is_some();
        let resources = overridden.then(|| {
            let mut resources = defaults.clone();
            if let Some(memory) = self.memory {
                resources.memory_swap = Some(memory.clone());
                resources.memory = Some(memory);
            }
            if self.cpuset.is_some() {
                resources.cpuset = self.cpuset;
            }
            if self.cpus.is_some() {
                resources.cpus = self.cpus;
            }
            if self.shm_size.is_some() {
                resources.shm_size = self.shm_size;
            }
            if let Some(gpu) = self.gpu {
                resources.gpu = gpu;
            }
            resources
        });

        let volumes = if self.volumes.is_empty() {
            None
        } else {
            Some(
                self.volumes
                    .iter()
                    .map(|v| parse_volume(v))
                    .collect::<anyhow::Result<Vec<_>>>()?,
            )
        };

        Ok(CreateOptions {
            credentials: Credentials {
                root_password: self.password,
                notebook_token: self.token,
            },
            resources,
            volumes,
        })
    }
}

/// Parse `SOURCE:TARGET[:ro]`.
fn parse_volume(spec: &str) -> anyhow::Result<VolumeMount> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [source, target] => (*source, *target, false),
        [source, target, "ro"] => (*source, *target, true),
        [source, target, "rw"] => (*source, *target, false),
        _ => anyhow::bail!("invalid volume '{}': expected SOURCE:TARGET[:ro]", spec),
    };
    Ok(VolumeMount {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
    })
}

pub async fn run_create(
    orchestrator: &Orchestrator,
    name: &str,
    args: CreateArgs,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let image = args.image.clone();
    let options = args.into_options(&orchestrator.config().container.resources)?;
    let result = orchestrator.create(name, &image, options).await;
    emit(
        result,
        json,
        out,
        |r| format!("Container '{}' created from {}", r.name, r.image),
        print_started,
    )
}

pub async fn run_start(
    orchestrator: &Orchestrator,
    name: &str,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let result = orchestrator.start(name).await;
    emit(
        result,
        json,
        out,
        |r| format!("Container '{}' started", r.name),
        print_started,
    )
}

pub async fn run_restore(
    orchestrator: &Orchestrator,
    name: &str,
    tag: Option<&str>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let result = orchestrator.start_from_snapshot(name, tag).await;
    emit(
        result,
        json,
        out,
        |r| format!("Container '{}' restored from {}", r.name, r.image),
        print_started,
    )
}

pub async fn run_stop(
    orchestrator: &Orchestrator,
    name: &str,
    options: StopOptions,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let result = orchestrator.stop(name, options).await;
    emit(
        result,
        json,
        out,
        |r| format!("Container '{}' stopped", r.name),
        |r, out| {
            if !r.released_ports.is_empty() {
                out.status(&format!("  Released ports: {}", join_ports(&r.released_ports)));
            }
            if let Some(snapshot) = &r.snapshot {
                out.status(&format!("  Snapshot: {}", snapshot.image_ref));
            }
            for evicted in &r.evicted {
                out.status(&format!("  Evicted:  {}", evicted.image_ref));
            }
            for image in &r.unremoved_images {
                out.warning(&format!("  Could not delete image {}", image));
            }
        },
    )
}

pub async fn run_delete(
    orchestrator: &Orchestrator,
    name: &str,
    remove_snapshots: bool,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let result = orchestrator.delete(name, remove_snapshots).await;
    emit(
        result,
        json,
        out,
        |r| format!("Container '{}' deleted", r.name),
        |r, out| {
            if !r.released_ports.is_empty() {
                out.status(&format!("  Released ports: {}", join_ports(&r.released_ports)));
            }
            if !r.removed_snapshots.is_empty() {
                out.status(&format!("  Removed {} snapshot(s)", r.removed_snapshots.len()));
            }
            for image in &r.unremoved_images {
                out.warning(&format!("  Could not delete image {}", image));
            }
        },
    )
}

fn print_started(result: &StartResult, out: &dyn UserOutput) {
    out.blank();
    out.status(&format!("  {:<10} {:<8} {:<8} TUNNEL", "SERVICE", "PORT", "PUBLIC"));
    for binding in &result.bindings {
        out.status(&format!(
            "  {:<10} {:<8} {:<8} {}",
            binding.service_type.to_string(),
            binding.internal_port,
            binding.public_port,
            binding.tunnel_id
        ));
    }
    out.blank();
    if let Some(password) = &result.credentials.root_password {
        out.status(&format!("  Root password:  {}", password));
    }
    if let Some(token) = &result.credentials.notebook_token {
        out.status(&format!("  Notebook token: {}", token));
    }
}

pub(crate) fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
