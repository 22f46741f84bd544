//! Execute a command and return the combined output it generated.
//!
//! Stdout and stderr are merged into a temporary file under the working
//! directory whose contents become the return value. Benchmark workloads can
//! produce multi-megabyte output; inline pipe buffers deadlock.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, error};

use crate::error::{Error, Result};

/// Run `cmd` in `cwd`, returning its combined stdout/stderr.
///
/// `cmd` is shell-lexed into an argument vector. The child inherits the
/// current process environment, in particular any bindings installed by a
/// surrounding scoped environment.
pub fn run(cmd: &str, cwd: &Path) -> Result<String> {
    run_with_env(cmd, cwd, &[])
}

/// Run `cmd` in `cwd`, discarding output; only success or failure matters.
pub fn run_check(cmd: &str, cwd: &Path) -> Result<()> {
    run_with_env(cmd, cwd, &[]).map(|_| ())
}

/// [`run`] with extra environment bindings set on the child only. Used by
/// the builders for `HOME`/`CC`/`CXX` overrides; the process-wide
/// environment is mutated exclusively by the scoped environment.
pub fn run_with_env(cmd: &str, cwd: &Path, envs: &[(&str, &str)]) -> Result<String> {
    let argv = shell_words::split(cmd)
        .map_err(|e| Error::Config(format!("unable to lex command `{cmd}`: {e}")))?;
    let Some((program, args)) = argv.split_first() else {
        return Err(Error::Config("empty command".to_string()));
    };

    debug!(command = cmd, cwd = %cwd.display(), "executing command");

    let capture = tempfile::Builder::new()
        .prefix(".salvo-cmd-")
        .tempfile_in(cwd)?;
    // Both streams must share one file description: independent descriptions
    // carry independent offsets and overwrite each other at the start of the
    // file instead of appending to a merged log.
    let stdout = capture.reopen()?;
    let stderr = stdout.try_clone()?;

    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(envs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .status()?;

    let bytes = fs::read(capture.path())?;
    let output = String::from_utf8_lossy(&bytes).trim().to_string();

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        error!(command = cmd, status = code, "command failed");
        return Err(Error::ProcessFailure {
            command: cmd.to_string(),
            status: code,
            output,
        });
    }

    debug!(bytes = output.len(), "command output captured");
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_combined_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = run("sh -c 'echo out; echo err >&2'", dir.path()).expect("run");
        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[test]
    fn streams_append_instead_of_clobbering() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = run(
            "sh -c 'echo first-stdout-line; echo stderr-line >&2; echo second-stdout-line'",
            dir.path(),
        )
        .expect("run");
        // A per-stream offset would make the stderr write overwrite the head
        // of the stdout output; every line must survive in full.
        assert!(output.contains("first-stdout-line"), "output: {output}");
        assert!(output.contains("stderr-line"), "output: {output}");
        assert!(output.contains("second-stdout-line"), "output: {output}");
    }

    #[test]
    fn trims_trailing_newline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = run("echo hello", dir.path()).expect("run");
        assert_eq!(output, "hello");
    }

    #[test]
    fn nonzero_exit_carries_command_and_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run("sh -c 'echo boom; exit 3'", dir.path()).expect_err("must fail");
        match err {
            Error::ProcessFailure {
                command,
                status,
                output,
            } => {
                assert!(command.contains("boom"));
                assert_eq!(status, 3);
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn extra_env_reaches_child_without_leaking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = run_with_env(
            "sh -c 'echo $SALVO_CMD_EXEC_CHILD_ONLY'",
            dir.path(),
            &[("SALVO_CMD_EXEC_CHILD_ONLY", "isolated")],
        )
        .expect("run");
        assert_eq!(output, "isolated");
        assert!(std::env::var("SALVO_CMD_EXEC_CHILD_ONLY").is_err());
    }

    #[test]
    fn run_check_discards_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        run_check("true", dir.path()).expect("run_check");
        assert!(run_check("false", dir.path()).is_err());
    }
}
