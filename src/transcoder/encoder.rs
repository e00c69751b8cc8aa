//! ffmpeg driver.
//!
//! The driver owns the subprocess and nothing else: it emits raw progress
//! events (processed output duration) on a channel and leaves percentage
//! math and persistence to the worker. Cancellation is a watch flag; on the
//! flag flipping the subprocess gets SIGTERM, a short grace period, then
//! SIGKILL.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::presets::QualityPreset;
use super::TranscodeError;

/// How long a SIGTERM'd encoder gets before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How many trailing stderr lines to keep for error reporting.
const STDERR_TAIL: usize = 40;

/// Amount of output already encoded, as reported by ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub processed: Duration,
}

pub struct Encoder {
    ffmpeg_path: String,
}

impl Encoder {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Encoder {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    /// Run one encode to completion. Progress events arrive on `progress_tx`
    /// as ffmpeg reports them; flipping `cancel` to `true` terminates the
    /// subprocess and yields `TranscodeError::Cancelled`.
    pub async fn encode(
        &self,
        input: &Path,
        output: &Path,
        preset: &QualityPreset,
        progress_tx: mpsc::Sender<ProgressEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), TranscodeError> {
        let args = preset.ffmpeg_args(&input.display().to_string(), &output.display().to_string());
        debug!(ffmpeg = %self.ffmpeg_path, quality = preset.height, "spawning encoder");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Backstop: if this future is dropped (job timeout), the
            // subprocess must not outlive it
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TranscodeError::Encoder(format!("failed to spawn {}: {}", self.ffmpeg_path, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::Encoder("encoder stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::Encoder("encoder stderr not captured".to_string()))?;

        // Drain stderr concurrently, keeping only the tail; a stalled stderr
        // pipe would otherwise deadlock ffmpeg.
        let stderr_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail.join("\n")
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut cancel_live = true;
        loop {
            tokio::select! {
                maybe_line = lines.next_line() => {
                    match maybe_line? {
                        Some(line) => {
                            if let Some(processed) = parse_progress_line(&line) {
                                // Receiver lag or shutdown must not stall the encoder
                                let _ = progress_tx.try_send(ProgressEvent { processed });
                            }
                        }
                        None => break,
                    }
                }
                changed = cancel.changed(), if cancel_live => {
                    match changed {
                        Ok(()) if *cancel.borrow() => {
                            warn!("cancellation requested, terminating encoder");
                            terminate(&mut child).await;
                            let _ = stderr_task.await;
                            return Err(TranscodeError::Cancelled);
                        }
                        Ok(()) => {}
                        // Sender gone: cancellation can no longer happen
                        Err(_) => cancel_live = false,
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(TranscodeError::Encoder(format!(
                "ffmpeg exited with {}: {}",
                status,
                stderr_tail.trim()
            )));
        }
        Ok(())
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!(pid, "encoder ignored SIGTERM, killing");
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// ffmpeg `-progress` emits `key=value` lines; `out_time_ms` is, despite the
/// name, in microseconds.
fn parse_progress_line(line: &str) -> Option<Duration> {
    let value = line.strip_prefix("out_time_ms=")?.trim();
    let micros: i64 = value.parse().ok()?;
    if micros < 0 {
        return None;
    }
    Some(Duration::from_micros(micros as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_parsing() {
        assert_eq!(
            parse_progress_line("out_time_ms=1500000"),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(parse_progress_line("out_time_ms=0"), Some(Duration::ZERO));
        assert_eq!(parse_progress_line("out_time_ms=-9223372036854775808"), None);
        assert_eq!(parse_progress_line("frame=120"), None);
        assert_eq!(parse_progress_line("out_time_ms=abc"), None);
        assert_eq!(parse_progress_line("progress=end"), None);
    }
}
