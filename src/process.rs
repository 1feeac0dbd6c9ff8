use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{DubError, DubResult};
use crate::pipeline::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(100);

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

pub fn run_command(program: &str, args: &[String], cwd: Option<&Path>) -> DubResult<Output> {
    run_command_with_timeout(program, args, cwd, None)
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> DubResult<Output> {
    let token = CancellationToken::new();
    run_command_cancellable(program, args, cwd, None, &token, timeout)
}

/// Run a subprocess with cancellation-aware polling.
///
/// `stdin_text` is written to the child and the pipe closed before polling
/// starts. The token is checked on every poll; once it reports cancellation the
/// child's whole process group is killed and `Cancelled` is returned. The
/// optional `timeout` applies to this single invocation and yields
/// `ExternalToolTimeout`.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    stdin_text: Option<&str>,
    token: &CancellationToken,
    timeout: Option<Duration>,
) -> DubResult<Output> {
    if !command_exists(program) {
        return Err(DubError::CommandMissing {
            command: program.to_owned(),
        });
    }
    token.checkpoint()?;

    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    command.stdin(if stdin_text.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    tracing::debug!(command = %rendered, "spawning external tool");
    let mut child = command.spawn()?;
    let started_at = Instant::now();

    if let Some(text) = stdin_text
        && let Some(mut stdin) = child.stdin.take()
    {
        stdin.write_all(text.as_bytes())?;
    }

    let (stdout_rx, stderr_rx) = drain_pipes(&mut child)?;

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx.recv_timeout(PIPE_DRAIN_GRACE).unwrap_or_default();
            let stderr = stderr_rx.recv_timeout(PIPE_DRAIN_GRACE).unwrap_or_default();
            return validate_command_output(
                &rendered,
                Output {
                    status,
                    stdout,
                    stderr,
                },
            );
        }

        if let Err(err) = token.checkpoint() {
            kill_process_group(&mut child);
            tracing::warn!(command = %rendered, "external tool killed on cancellation");
            return Err(err);
        }

        if let Some(limit) = timeout
            && started_at.elapsed() >= limit
        {
            kill_process_group(&mut child);
            let stderr = stderr_rx.recv_timeout(PIPE_DRAIN_GRACE).unwrap_or_default();
            return Err(DubError::from_command_timeout(
                rendered,
                saturating_duration_ms(limit),
                String::from_utf8_lossy(&stderr).into_owned(),
            ));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

type PipeReceiver = std::sync::mpsc::Receiver<Vec<u8>>;

fn drain_pipes(child: &mut Child) -> DubResult<(PipeReceiver, PipeReceiver)> {
    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| DubError::Io(std::io::Error::other("child stdout was not piped")))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| DubError::Io(std::io::Error::other("child stderr was not piped")))?;

    let (stdout_tx, stdout_rx) = std::sync::mpsc::channel();
    let (stderr_tx, stderr_rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf);
        let _ = stdout_tx.send(buf);
    });

    thread::spawn(move || {
        use std::io::Read;
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf);
        let _ = stderr_tx.send(buf);
    });

    Ok((stdout_rx, stderr_rx))
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    // The child leads its own group, so a negative pid reaches any helpers it forked.
    if !signal_process_group(child.id()) {
        tracing::warn!(pid = child.id(), "process group kill failed; killing the child only");
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Sends SIGKILL to process group `pgid` through `kill(1)`. Returns false when
/// the signal could not be delivered.
#[cfg(unix)]
fn signal_process_group(pgid: u32) -> bool {
    if pgid == 0 || pgid > i32::MAX as u32 {
        return false;
    }
    match Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(err) => {
            tracing::debug!(pgid, error = %err, "could not spawn kill");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn validate_command_output(rendered: &str, output: Output) -> DubResult<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(DubError::from_command_failure(
        rendered.to_owned(),
        status,
        stderr,
    ))
}

fn saturating_duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
