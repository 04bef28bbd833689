use super::emit;
use crate::output::UserOutput;
use devbox::orchestrator::ContainerStatus;
use devbox::{LifecycleState, Orchestrator};

pub async fn run_status(
    orchestrator: &Orchestrator,
    name: &str,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let result = orchestrator.get_status(name).await;
    emit(
        result,
        json,
        out,
        |s| format!("Container '{}' is {}", s.name, s.state),
        |s, out| {
            out.status(&format!("  Image:      {}", s.image));
            if s.base_image != s.image {
                out.status(&format!("  Base image: {}", s.base_image));
            }
            if let Some(id) = &s.container_id {
                out.status(&format!("  Id:         {}", short_id(id)));
            }
            if let Some(ip) = &s.ip_address {
                out.status(&format!("  Address:    {}", ip));
            }
            out.status(&format!("  Updated:    {}", s.updated_at.format("%Y-%m-%d %H:%M:%S UTC")));
            out.status(&format!("  Snapshots:  {}", s.snapshots));
            if let Some(operation) = s.busy {
                out.warning(&format!("  Busy: {} in progress", operation));
            }
            for binding in &s.bindings {
                out.status(&format!(
                    "  {:<10} {} -> public {} (tunnel {})",
                    binding.service_type.to_string(),
                    binding.internal_port,
                    binding.public_port,
                    binding.tunnel_id
                ));
            }
        },
    )
}

pub async fn run_list(
    orchestrator: &Orchestrator,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let statuses = orchestrator.list().await;
    emit(
        Ok(statuses),
        json,
        out,
        |s| format!("{} container(s)", s.len()),
        |statuses, out| {
            if statuses.is_empty() {
                out.status("  No containers. Create one with `devbox create <name> --image <image>`");
                return;
            }
            out.status(&format!("  {:<24} {:<13} PORTS", "NAME", "STATE"));
            for status in statuses {
                out.status(&format!(
                    "  {} {:<22} {:<13} {}",
                    state_icon(status),
                    status.name,
                    status.state.to_string(),
                    status
                        .ports
                        .iter()
                        .map(|(service, port)| format!("{}={}", service, port))
                        .collect::<Vec<_>>()
                        .join(" ")
                ));
            }
        },
    )
}

pub async fn run_reconcile(
    orchestrator: &Orchestrator,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let report = orchestrator.reconcile().await;
    emit(
        Ok(report),
        json,
        out,
        |r| {
            format!(
                "Checked {} container(s), corrected {}",
                r.checked,
                r.drifted.len()
            )
        },
        |r, out| {
            for drift in &r.drifted {
                let to = drift
                    .to
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "removed".to_string());
                out.status(&format!("  {:<24} {} -> {}", drift.container, drift.from, to));
            }
            for name in &r.skipped_busy {
                out.warning(&format!("  {} skipped: operation in progress", name));
            }
            for error in &r.errors {
                out.warning(&format!("  {}", error));
            }
        },
    )
}

fn state_icon(status: &ContainerStatus) -> &'static str {
    match status.state {
        LifecycleState::Running => "+",
        LifecycleState::Stopped => "o",
        LifecycleState::Unknown | LifecycleState::Stale => "x",
        _ => ".",
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
