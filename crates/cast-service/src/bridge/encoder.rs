//! External encoder process.
//!
//! The encoder reads the session descriptor, tiles every video input into one
//! frame, mixes every audio input into one track and writes a sliding HLS
//! playlist. It counts as started once it has been spawned and has written
//! its first diagnostic line to stderr.

use crate::actors::messages::BridgeMessage;
use crate::errors::CastError;
use crate::observability::metrics;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Playlist file name inside the output directory.
pub const PLAYLIST_NAME: &str = "live.m3u8";

/// Segment file pattern inside the output directory.
pub const SEGMENT_PATTERN: &str = "segment%05d.ts";

/// First retry delay; doubles per attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// How long a killed encoder may take to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything needed to launch one encoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSpec {
    pub program: PathBuf,
    pub sdp_path: PathBuf,
    pub output_dir: PathBuf,
    pub video_inputs: usize,
    pub audio_inputs: usize,
    pub segment_seconds: u32,
    pub window_size: u32,
}

impl EncoderSpec {
    #[must_use]
    pub fn playlist_path(&self) -> PathBuf {
        self.output_dir.join(PLAYLIST_NAME)
    }
}

/// Starts encoder processes.
#[async_trait]
pub trait EncoderLauncher: Send + Sync {
    async fn launch(&self, spec: &EncoderSpec) -> Result<Box<dyn EncoderProcess>, CastError>;
}

/// A running encoder.
#[async_trait]
pub trait EncoderProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolve once the process signals it has started.
    async fn wait_ready(&mut self) -> Result<(), CastError>;

    /// Resolve when the process exits, with its exit code if it had one.
    async fn wait_exit(&mut self) -> Result<Option<i32>, CastError>;

    /// Kill the process forcibly and reap it.
    async fn kill(&mut self) -> Result<(), CastError>;
}

/// Build the encoder command line (without the program name).
#[must_use]
pub fn ffmpeg_args(spec: &EncoderSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-protocol_whitelist".into(),
        "file,udp,rtp".into(),
        "-i".into(),
        spec.sdp_path.display().to_string(),
    ];

    let mut filters = Vec::new();
    if let Some(video) = mix_filter("v", spec.video_inputs, "hstack", "null", "v_stacked") {
        filters.push(video);
    }
    if let Some(audio) = mix_filter("a", spec.audio_inputs, "amix", "anull", "a_mixed") {
        filters.push(audio);
    }
    if !filters.is_empty() {
        args.push("-filter_complex".into());
        args.push(filters.join(";"));
    }

    if spec.video_inputs > 0 {
        args.extend(
            [
                "-map", "[v_stacked]", "-c:v", "libx264", "-preset", "medium", "-crf", "23", "-g",
                "60",
            ]
            .map(String::from),
        );
    }
    if spec.audio_inputs > 0 {
        args.extend(["-map", "[a_mixed]", "-c:a", "aac", "-b:a", "192k"].map(String::from));
    }

    args.extend([
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        spec.segment_seconds.to_string(),
        "-hls_list_size".into(),
        spec.window_size.to_string(),
        "-hls_segment_filename".into(),
        spec.output_dir.join(SEGMENT_PATTERN).display().to_string(),
        "-hls_flags".into(),
        "delete_segments+independent_segments+program_date_time".into(),
        spec.playlist_path().display().to_string(),
    ]);
    args
}

/// `[0:v:0][0:v:1]hstack=inputs=2[v_stacked]`, or a passthrough for one input.
fn mix_filter(
    stream: &str,
    inputs: usize,
    combine: &str,
    passthrough: &str,
    label: &str,
) -> Option<String> {
    let sources: String = (0..inputs).map(|i| format!("[0:{stream}:{i}]")).collect();
    match inputs {
        0 => None,
        1 => Some(format!("{sources}{passthrough}[{label}]")),
        n => Some(format!("{sources}{combine}=inputs={n}[{label}]")),
    }
}

/// Launches `ffmpeg` as a child process.
#[derive(Debug, Default, Clone)]
pub struct FfmpegLauncher;

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, spec: &EncoderSpec) -> Result<Box<dyn EncoderProcess>, CastError> {
        let mut child = Command::new(&spec.program)
            .args(ffmpeg_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CastError::ProcessError(format!(
                    "failed to spawn {}: {e}",
                    spec.program.display()
                ))
            })?;

        let stderr = child
            .stderr
            .take()
            .map(|stderr| BufReader::new(stderr).lines());

        info!(target: "cast.encoder", pid = ?child.id(), program = %spec.program.display(), "Encoder spawned");
        Ok(Box::new(FfmpegProcess { child, stderr }))
    }
}

struct FfmpegProcess {
    child: Child,
    stderr: Option<Lines<BufReader<ChildStderr>>>,
}

#[async_trait]
impl EncoderProcess for FfmpegProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_ready(&mut self) -> Result<(), CastError> {
        let Some(mut lines) = self.stderr.take() else {
            return Err(CastError::ProcessError("encoder stderr unavailable".to_string()));
        };

        match lines.next_line().await? {
            Some(line) => {
                debug!(target: "cast.encoder", line = %line, "Encoder started");
                // Keep draining so the pipe never fills up
                let pid = self.child.id();
                tokio::spawn(async move {
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(target: "cast.encoder", pid = ?pid, line = %line);
                    }
                });
                Ok(())
            }
            None => Err(CastError::ProcessError(
                "encoder exited before becoming ready".to_string(),
            )),
        }
    }

    async fn wait_exit(&mut self) -> Result<Option<i32>, CastError> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<(), CastError> {
        self.child.kill().await?;
        Ok(())
    }
}

/// Launch the encoder and wait for readiness, retrying with backoff.
///
/// # Errors
///
/// `ProcessError` once every attempt failed; `Cancelled` when `cancel`
/// fires first.
pub async fn launch_with_retry(
    launcher: &dyn EncoderLauncher,
    spec: &EncoderSpec,
    attempts: u32,
    ready_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Box<dyn EncoderProcess>, CastError> {
    let mut last_error = String::from("no attempt made");
    let mut backoff = INITIAL_BACKOFF;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(CastError::Cancelled);
        }

        match launcher.launch(spec).await {
            Ok(mut process) => {
                let ready = tokio::select! {
                    () = cancel.cancelled() => {
                        kill_quietly(process.as_mut()).await;
                        return Err(CastError::Cancelled);
                    }
                    ready = tokio::time::timeout(ready_timeout, process.wait_ready()) => ready,
                };
                match ready {
                    Ok(Ok(())) => {
                        metrics::record_encoder_spawn("ready");
                        info!(target: "cast.encoder", attempt, pid = ?process.id(), "Encoder ready");
                        return Ok(process);
                    }
                    Ok(Err(e)) => {
                        metrics::record_encoder_spawn("failed");
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        metrics::record_encoder_spawn("timeout");
                        last_error = format!("not ready within {}ms", ready_timeout.as_millis());
                    }
                }
                kill_quietly(process.as_mut()).await;
            }
            Err(e) => {
                metrics::record_encoder_spawn("failed");
                last_error = e.to_string();
            }
        }

        warn!(target: "cast.encoder", attempt, attempts, error = %last_error, "Encoder start attempt failed");

        if attempt < attempts {
            tokio::select! {
                () = cancel.cancelled() => return Err(CastError::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2);
        }
    }

    Err(CastError::ProcessError(format!(
        "encoder failed to start after {attempts} attempts: {last_error}"
    )))
}

async fn kill_quietly(process: &mut dyn EncoderProcess) {
    if let Err(e) = process.kill().await {
        debug!(target: "cast.encoder", error = %e, "Encoder kill failed");
    }
}

/// Owner of a started encoder.
///
/// A monitor task waits for the process to exit; an unexpected exit is
/// reported to the bridge as `EncoderExited` and fires [`Self::exited`].
#[derive(Debug)]
pub struct EncoderHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: CancellationToken,
    task: JoinHandle<()>,
}

impl EncoderHandle {
    pub fn monitor(
        job_id: Uuid,
        mut process: Box<dyn EncoderProcess>,
        notify: mpsc::WeakSender<BridgeMessage>,
    ) -> Self {
        let pid = process.id();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let exited = CancellationToken::new();
        let exit_signal = exited.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                exit = process.wait_exit() => {
                    let exit_code = exit.ok().flatten();
                    metrics::record_encoder_exit(false);
                    warn!(target: "cast.encoder", job_id = %job_id, pid = ?pid, exit_code = ?exit_code, "Encoder exited unexpectedly");
                    exit_signal.cancel();
                    if let Some(notify) = notify.upgrade() {
                        let _ = notify
                            .send(BridgeMessage::EncoderExited { job_id, exit_code })
                            .await;
                    }
                }
                _ = kill_rx => {
                    kill_quietly(process.as_mut()).await;
                    metrics::record_encoder_exit(true);
                    exit_signal.cancel();
                    debug!(target: "cast.encoder", job_id = %job_id, pid = ?pid, "Encoder killed");
                }
            }
        });

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exited,
            task,
        }
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Resolves when the process is gone for any reason.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }

    /// Kill the encoder if it is still alive and wait for the monitor.
    pub async fn terminate(mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if tokio::time::timeout(KILL_TIMEOUT, self.task).await.is_err() {
            warn!(target: "cast.encoder", pid = ?self.pid, "Encoder did not exit after kill");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn spec(video: usize, audio: usize) -> EncoderSpec {
        EncoderSpec {
            program: PathBuf::from("ffmpeg"),
            sdp_path: PathBuf::from("/tmp/stream.sdp"),
            output_dir: PathBuf::from("/srv/public/hls"),
            video_inputs: video,
            audio_inputs: audio,
            segment_seconds: 4,
            window_size: 5,
        }
    }

    fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_two_by_two_filter_graph() {
        let args = ffmpeg_args(&spec(2, 2));
        assert_eq!(
            arg_after(&args, "-filter_complex"),
            Some("[0:v:0][0:v:1]hstack=inputs=2[v_stacked];[0:a:0][0:a:1]amix=inputs=2[a_mixed]")
        );
        assert_eq!(arg_after(&args, "-i"), Some("/tmp/stream.sdp"));
        assert_eq!(arg_after(&args, "-protocol_whitelist"), Some("file,udp,rtp"));
    }

    #[test]
    fn test_single_inputs_pass_through() {
        let args = ffmpeg_args(&spec(1, 1));
        assert_eq!(
            arg_after(&args, "-filter_complex"),
            Some("[0:v:0]null[v_stacked];[0:a:0]anull[a_mixed]")
        );
    }

    #[test]
    fn test_audio_only_skips_video_encoder() {
        let args = ffmpeg_args(&spec(0, 3));
        assert!(!args.iter().any(|a| a == "libx264"));
        assert_eq!(arg_after(&args, "-c:a"), Some("aac"));
        assert_eq!(
            arg_after(&args, "-filter_complex"),
            Some("[0:a:0][0:a:1][0:a:2]amix=inputs=3[a_mixed]")
        );
    }

    #[test]
    fn test_hls_output_options() {
        let args = ffmpeg_args(&spec(2, 2));
        assert_eq!(arg_after(&args, "-preset"), Some("medium"));
        assert_eq!(arg_after(&args, "-crf"), Some("23"));
        assert_eq!(arg_after(&args, "-g"), Some("60"));
        assert_eq!(arg_after(&args, "-b:a"), Some("192k"));
        assert_eq!(arg_after(&args, "-hls_time"), Some("4"));
        assert_eq!(arg_after(&args, "-hls_list_size"), Some("5"));
        assert_eq!(
            arg_after(&args, "-hls_segment_filename"),
            Some("/srv/public/hls/segment%05d.ts")
        );
        assert_eq!(
            arg_after(&args, "-hls_flags"),
            Some("delete_segments+independent_segments+program_date_time")
        );
        assert_eq!(args.last().map(String::as_str), Some("/srv/public/hls/live.m3u8"));
    }

    #[tokio::test]
    async fn test_missing_binary_exhausts_attempts() {
        let mut spec = spec(1, 1);
        spec.program = PathBuf::from(format!("/nonexistent/encoder-{}", Uuid::new_v4()));

        let err = launch_with_retry(
            &FfmpegLauncher,
            &spec,
            2,
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, CastError::ProcessError(_)));
        assert!(err.to_string().contains("2 attempts"));
    }

    #[tokio::test]
    async fn test_cancelled_before_launch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = launch_with_retry(
            &FfmpegLauncher,
            &spec(1, 1),
            3,
            Duration::from_secs(1),
            &cancel,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, CastError::Cancelled));
    }
}
