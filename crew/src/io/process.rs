//! Child process runner with a hard deadline and bounded output capture.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Last `max_chars` characters of stderr, lossily decoded and trimmed.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let text = text.trim();
        let skip = text.chars().count().saturating_sub(max_chars);
        text.chars().skip(skip).collect()
    }
}

/// How long to wait for output readers once a timed-out child has been killed.
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Run `cmd`, feed it `stdin`, and kill it if it outlives `timeout`.
///
/// stdin is written and stdout/stderr are drained on their own threads so a
/// chatty child can never deadlock against a full pipe. At most
/// `output_limit_bytes` of each stream is kept; the rest is counted and discarded.
///
/// On unix the child leads its own process group, and a timeout kills the whole
/// group, so processes it started die with it. A pipe still held open past the
/// deadline (plus `KILL_GRACE`) by a process that outlived the child is
/// abandoned with whatever it would have captured.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_with_deadline(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut pipe = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(thread::spawn(move || write_input(&mut pipe, &input)))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs_f64(),
                "command exceeded deadline, killing"
            );
            timed_out = true;
            kill_tree(&mut child).context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // A stdin writer blocked on an orphaned reader is left behind after a timeout.
    if let Some(handle) = stdin_handle
        && !timed_out
    {
        join(handle).context("join stdin writer")?;
    }
    let grace = if timed_out {
        KILL_GRACE
    } else {
        timeout
            .saturating_sub(started.elapsed())
            .saturating_add(KILL_GRACE)
    };
    let (stdout, stdout_truncated) = collect(&stdout_rx, grace).context("read stdout")?;
    let (stderr, stderr_truncated) = collect(&stderr_rx, grace).context("read stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Write all of `input`, then close the pipe. A child that exits without reading
/// its input is not an error.
fn write_input<W: Write>(pipe: &mut W, input: &[u8]) -> Result<()> {
    match pipe.write_all(input).and_then(|()| pipe.flush()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e).context("write stdin"),
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn kill_tree(child: &mut Child) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(child.id())
        .map_err(|_| io::Error::other("child pid out of range"))?;
    // SAFETY: kill(2) only reads its two integer arguments.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) -> io::Result<()> {
    child.kill()
}

type Captured = Result<(Vec<u8>, usize)>;

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> Receiver<Captured> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(read_limited(reader, limit));
    });
    rx
}

/// Wait up to `grace` for a reader's capture.
fn collect(rx: &Receiver<Captured>, grace: Duration) -> Captured {
    match rx.recv_timeout(grace) {
        Ok(captured) => captured,
        Err(RecvTimeoutError::Timeout) => {
            warn!("output pipe still open past the deadline, abandoning it");
            Ok((Vec::new(), 0))
        }
        Err(RecvTimeoutError::Disconnected) => Err(anyhow!("process i/o thread panicked")),
    }
}

fn join<T>(handle: thread::JoinHandle<Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("process i/o thread panicked")),
    }
}

fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_feeds_stdin() {
        let output = run_with_deadline(
            sh("tr a-z A-Z"),
            Some(b"hello".to_vec()),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");

        assert!(output.status.success());
        assert!(!output.timed_out);
        assert_eq!(output.stdout, b"HELLO");
    }

    #[test]
    fn kills_child_past_deadline() {
        let start = Instant::now();
        let output =
            run_with_deadline(sh("exec sleep 5"), None, Duration::from_millis(200), 1024).expect("run");

        assert!(output.timed_out);
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn deadline_holds_when_shell_runs_a_subprocess() {
        let start = Instant::now();
        let output = run_with_deadline(
            sh("cat >/dev/null; sleep 3; echo late"),
            Some(b"{}".to_vec()),
            Duration::from_millis(200),
            1024,
        )
        .expect("run");

        assert!(output.timed_out);
        assert!(output.stdout.is_empty());
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("survived");
        let script = format!("sleep 1; touch '{}'", marker.display());

        let output =
            run_with_deadline(sh(&script), None, Duration::from_millis(200), 1024).expect("run");
        assert!(output.timed_out);

        std::thread::sleep(Duration::from_millis(1500));
        assert!(!marker.exists(), "grandchild outlived the deadline");
    }

    #[test]
    fn background_process_holding_pipes_does_not_block() {
        let start = Instant::now();
        let output = run_with_deadline(
            sh("sleep 5 & echo started"),
            None,
            Duration::from_millis(300),
            1024,
        )
        .expect("run");

        assert!(output.status.success());
        assert!(!output.timed_out);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output = run_with_deadline(sh("printf 0123456789"), None, Duration::from_secs(5), 4)
            .expect("run");

        assert_eq!(output.stdout, b"0123");
        assert_eq!(output.stdout_truncated, 6);
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let output = run_with_deadline(
            sh("echo done >&2; exit 3"),
            Some(vec![b'x'; 1 << 20]),
            Duration::from_secs(5),
            1024,
        )
        .expect("run");

        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stderr_tail(100), "done");
    }
}
