//! External inspection (`@inspectFile /path/to/program`).

use super::traits::{Operator, OperatorContext, OperatorOptions};
use crate::error::{Error, Result};
use crate::engine::CancellationToken;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long the program may run before it is killed.
pub const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Runs a program with the value as its only argument; exit status 0 is a
/// match. A program that outlives the timeout or the transaction's
/// cancellation is killed and counts as no match.
pub struct InspectFileOperator {
    program: PathBuf,
    timeout: Duration,
}

impl InspectFileOperator {
    /// Resolve the program path against the rule's directory.
    pub fn new(opts: &OperatorOptions) -> Result<Self> {
        let program = opts.argument.trim();
        if program.is_empty() {
            return Err(Error::InvalidOperatorArgument {
                operator: "inspectFile".to_string(),
                message: "missing program path".to_string(),
            });
        }
        Ok(Self {
            program: opts.resolve_path(program),
            timeout: INSPECT_TIMEOUT,
        })
    }

    #[cfg(test)]
    fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Operator for InspectFileOperator {
    fn evaluate(&self, ctx: &mut OperatorContext<'_>, value: &str) -> bool {
        run_program(&self.program, &[value], self.timeout, ctx.cancel)
    }

    fn name(&self) -> &'static str {
        "inspectFile"
    }
}

/// Run `program` with `args` and report whether it exited with status 0.
///
/// A program that outlives `timeout` or the cancellation is killed and
/// counts as a failure. Also used by the `exec` action.
pub(crate) fn run_program(
    program: &Path,
    args: &[&str],
    timeout: Duration,
    cancel: &CancellationToken,
) -> bool {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            debug!(program = %program.display(), error = %e, "spawn failed");
            return false;
        }
    };

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return status.success(),
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "wait failed");
                return false;
            }
        }
        if cancel.is_cancelled() || started.elapsed() >= timeout {
            debug!(program = %program.display(), "killed");
            let _ = child.kill();
            let _ = child.wait();
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::operators::traits::testing::eval;

    fn op(program: &str) -> InspectFileOperator {
        InspectFileOperator::new(&OperatorOptions::new(program)).unwrap()
    }

    #[test]
    fn test_exit_status() {
        assert!(eval(&op("/bin/true"), "upload.bin"));
        assert!(!eval(&op("/bin/false"), "upload.bin"));
        assert!(!eval(&op("/definitely/missing/program"), "x"));
    }

    #[test]
    fn test_timeout_kills() {
        let slow = op("/bin/sleep").with_timeout(Duration::from_millis(100));
        let started = Instant::now();
        assert!(!eval(&slow, "5"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_missing_argument() {
        assert!(InspectFileOperator::new(&OperatorOptions::new("  ")).is_err());
    }
}
