use super::emit;
use crate::output::UserOutput;
use devbox::Orchestrator;

pub async fn run_snapshot(
    orchestrator: &Orchestrator,
    name: &str,
    message: &str,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    let result = orchestrator.snapshot(name, message).await;
    emit(
        result,
        json,
        out,
        |r| format!("Snapshot {} of '{}' committed", r.snapshot.version_tag, r.name),
        |r, out| {
            out.status(&format!("  Image: {}", r.snapshot.image_ref));
            for evicted in &r.evicted {
                out.status(&format!("  Evicted: {}", evicted.image_ref));
            }
            for image in &r.unremoved_images {
                out.warning(&format!("  Could not delete image {}", image));
            }
        },
    )
}

pub async fn run_snapshots(
    orchestrator: &Orchestrator,
    name: Option<&str>,
    json: bool,
    out: &dyn UserOutput,
) -> anyhow::Result<()> {
    match name {
        Some(name) => emit(
            orchestrator.list_snapshots(name),
            json,
            out,
            |history| format!("{} snapshot(s) of '{}'", history.len(), name),
            |history, out| {
                for record in history {
                    out.status(&format!(
                        "  {:<26} {}  {}",
                        record.version_tag,
                        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        record.message
                    ));
                }
            },
        ),
        None => emit(
            Ok(orchestrator.list_all_snapshots()),
            json,
            out,
            |all| format!("{} snapshot(s)", all.len()),
            |all, out| {
                for listing in all {
                    out.status(&format!(
                        "  {:<20} {:<26} {}  {}",
                        listing.container,
                        listing.record.version_tag,
                        listing.record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        listing.record.message
                    ));
                }
            },
        ),
    }
}
