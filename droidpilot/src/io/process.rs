//! Child processes with timeouts and bounded output capture.
//!
//! Used for `adb` device commands and for the oracle agent process. Output is
//! drained on reader threads so a chatty child can never deadlock on a full pipe.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Fail on timeout or non-zero exit, naming `label` and quoting stderr.
    pub fn ensure_success(&self, label: &str) -> Result<()> {
        if self.timed_out {
            bail!("{label} timed out");
        }
        if !self.status.success() {
            bail!(
                "{label} failed with status {:?}: {}",
                self.status.code(),
                self.stderr_text().trim()
            );
        }
        Ok(())
    }

    /// Human-readable log of both streams, bounded to `limit` bytes.
    pub fn render_log(&self, label: &str, limit: usize) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_text());
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_text());
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if buf.len() > limit {
            let cut = floor_char_boundary(&buf, limit);
            let dropped = buf.len() - cut;
            buf.truncate(cut);
            buf.push_str(&format!("\n[truncated {dropped} bytes]\n"));
        }
        buf
    }
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut cut = index.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    cut
}

/// Run a command with a timeout and capture stdout/stderr.
///
/// `output_limit_bytes` bounds the amount of each stream kept in memory; bytes
/// beyond it are drained and counted but discarded.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_and_collect(cmd, stdin, timeout, output_limit_bytes, None)
}

/// Like [`run_command_with_timeout`], but also tees each stdout line to
/// `stream_path` as it arrives (flushed per line) when a path is given.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes, streaming = stream_path.is_some()))]
pub fn run_command_with_stream(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    stream_path: Option<&Path>,
) -> Result<CommandOutput> {
    let tee = match stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(BufWriter::new(file))
        }
        None => None,
    };
    run_and_collect(cmd, stdin, timeout, output_limit_bytes, tee)
}

fn run_and_collect(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    tee: Option<BufWriter<File>>,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn command");
        anyhow!(err).context("spawn command")
    })?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
        // Dropping the handle closes the pipe so the child sees EOF.
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle: JoinHandle<Result<(Vec<u8>, usize)>> = match tee {
        Some(writer) => {
            thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, writer))
        }
        None => thread::spawn(move || read_limited(stdout, output_limit_bytes)),
    };
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_reader(handle: JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

/// Append `chunk` to `buf` up to `limit` total bytes; return bytes discarded.
fn keep_within(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) -> usize {
    let keep = chunk.len().min(limit.saturating_sub(buf.len()));
    buf.extend_from_slice(&chunk[..keep]);
    chunk.len() - keep
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
        truncated += keep_within(&mut buf, &chunk[..n], limit);
    }
    Ok((buf, truncated))
}

fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    mut tee: BufWriter<File>,
) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).context("read line")?;
        if n == 0 {
            break;
        }
        if let Err(err) = tee.write_all(&line).and_then(|()| tee.flush()) {
            warn!(err = %err, "failed to write to stream file");
        }
        truncated += keep_within(&mut buf, &line, limit);
    }
    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_within_counts_discarded_bytes() {
        let mut buf = b"abc".to_vec();
        assert_eq!(keep_within(&mut buf, b"defgh", 5), 3);
        assert_eq!(buf, b"abcde");
        assert_eq!(keep_within(&mut buf, b"x", 5), 1);
    }

    #[test]
    fn read_limited_truncates_long_streams() {
        let data = vec![b'a'; 20_000];
        let (buf, truncated) = read_limited(data.as_slice(), 1_000).expect("read");
        assert_eq!(buf.len(), 1_000);
        assert_eq!(truncated, 19_000);
    }

    #[test]
    fn tee_writes_every_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stream.jsonl");
        let file = File::create(&path).expect("create");
        let (buf, truncated) =
            read_lines_limited(&b"one\ntwo\nthree\n"[..], 6, BufWriter::new(file)).expect("read");
        assert_eq!(buf, b"one\ntw");
        assert_eq!(truncated, 8);
        assert_eq!(
            fs::read_to_string(&path).expect("read stream"),
            "one\ntwo\nthree\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn run_command_captures_stdout_and_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat; echo err >&2");
        let output =
            run_command_with_timeout(cmd, Some(b"hello"), Duration::from_secs(10), 1_000)
                .expect("run");
        output.ensure_success("sh").expect("success");
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(output.stderr_text().trim(), "err");
        assert!(output.render_log("sh", 1_000).contains("=== stderr ==="));
    }
}
