use super::emit;
use crate::output::UserOutput;
use devbox::Orchestrator;

pub fn run_ports(
    orchestrator: &Orchestrator,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let usage = orchestrator.port_usage();
    emit(
        Ok(usage),
        json,
        out,
        |u| {
            format!(
                "Ports {}-{}: {} allocated, {} available ({:.2}% used)",
                u.range_start, u.range_end, u.allocated, u.available, u.utilization_percent
            )
        },
        |u, out| {
            out.status(&format!("  Strategy: {:?}", u.strategy));
            out.status(&format!(
                "  Total: {}  Reserved: {}  Cooling: {}",
                u.total, u.reserved, u.cooling
            ));
            if u.by_container.is_empty() {
                return;
            }
            out.blank();
            for (container, services) in &u.by_container {
                let ports = services
                    .iter()
                    .map(|(service, port)| format!("{}={}", service, port))
                    .collect::<Vec<_>>()
                    .join(" ");
                out.status(&format!("  {:<24} {}", container, ports));
            }
        },
    )
}
