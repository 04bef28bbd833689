/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// JSON mode keeps stdout to the result object alone.
pub trait UserOutput: Send + Sync {
    /// Informational line (e.g., a table row)
    fn status(&self, message: &str);

    /// Success message (e.g., "Container 'c1' created")
    fn success(&self, message: &str);

    /// Warning message (e.g., "2 evicted images could not be deleted")
    fn warning(&self, message: &str);

    /// Error message
    fn error(&self, message: &str);

    /// A blank line separator.
    fn blank(&self);
}

/// Standard CLI output, written to stdout/stderr with ANSI colors.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }

    fn blank(&self) {
        println!();
    }
}
