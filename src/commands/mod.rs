mod lifecycle;
mod ports;
mod snapshot;
mod status;
mod validate;

pub use lifecycle::{run_create, run_delete, run_restore, run_start, run_stop, CreateArgs};
pub use ports::run_ports;
pub use snapshot::{run_snapshot, run_snapshots};
pub use status::{run_list, run_reconcile, run_status};
pub use validate::run_validate;

use crate::output::UserOutput;
use devbox::OperationResult;
use serde::Serialize;

/// Report an operation.
///
/// In JSON mode the structured result object is the only thing written to
/// stdout, for failures too. Otherwise a success prints `message` and then
/// whatever `render` adds. A failure is always returned so the exit code is
/// non-zero.
pub(crate) fn emit<T: Serialize>(
    result: devbox::Result<T>,
    json: bool,
    out: &dyn UserOutput,
    message: impl FnOnce(&T) -> String,
    render: impl FnOnce(&T, &dyn UserOutput),
) -> anyhow::Result<()> {
    match result {
        Ok(data) => {
            let message = message(&data);
            if json {
                out.status(&serde_json::to_string_pretty(&OperationResult::ok(
                    message, &data,
                ))?);
            } else {
                out.success(&message);
                render(&data, out);
            }
            Ok(())
        }
        Err(err) => {
            if json {
                out.status(&serde_json::to_string_pretty(
                    &OperationResult::<()>::failed(&err),
                )?);
            }
            Err(err.into())
        }
    }
}
