use std::io::Read;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{SegError, SegResult};
use crate::orchestrator::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const PIPE_DRAIN_WAIT: Duration = Duration::from_millis(100);

#[must_use]
pub fn command_exists(program: &str) -> bool {
    which::which(program).is_ok()
}

/// Run a subprocess with cancellation-aware polling.
///
/// The token is checked on every poll; once it reports cancellation the child
/// is killed and the cancellation error is returned. `hard_timeout` bounds the
/// wall time independently of the token.
pub fn run_command_cancellable(
    program: &str,
    args: &[String],
    cwd: Option<&Path>,
    token: &CancellationToken,
    hard_timeout: Option<Duration>,
) -> SegResult<Output> {
    if !command_exists(program) {
        return Err(SegError::CommandMissing {
            command: program.to_owned(),
        });
    }

    let rendered = format!("{} {}", program, args.join(" "));
    let mut command = Command::new(program);
    command.args(args);
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn()?;
    let started_at = Instant::now();

    let stdout_rx = drain_pipe(child.stdout.take());
    let stderr_rx = drain_pipe(child.stderr.take());

    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = stdout_rx.recv_timeout(PIPE_DRAIN_WAIT).unwrap_or_default();
            let stderr = stderr_rx.recv_timeout(PIPE_DRAIN_WAIT).unwrap_or_default();
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
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        if let Some(limit) = hard_timeout
            && started_at.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            let stderr = stderr_rx.recv_timeout(PIPE_DRAIN_WAIT).unwrap_or_default();
            return Err(SegError::from_command_timeout(
                rendered,
                saturating_duration_ms(limit),
                String::from_utf8_lossy(&stderr).into_owned(),
            ));
        }

        thread::sleep(POLL_INTERVAL);
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

fn validate_command_output(rendered: &str, output: Output) -> SegResult<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let status = output.status.code().unwrap_or(-1);
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    Err(SegError::from_command_failure(
        rendered.to_owned(),
        status,
        stderr,
    ))
}

fn saturating_duration_ms(duration: Duration) -> u64 {
    duration.as_millis().try_into().unwrap_or(u64::MAX)
}
