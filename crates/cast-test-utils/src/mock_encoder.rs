//! Mock encoder for bridge tests.
//!
//! `MockEncoder` implements `EncoderLauncher` without spawning a process. It
//! can be configured to:
//! - Report readiness immediately, after a delay, or never
//! - Fail the first N launches (or all of them)
//! - Exit on its own some time after readiness
//!
//! Clones share state, so a test keeps one copy to inspect launches, kills
//! and the specs the bridge asked for.
//!
//! # Example
//!
//! ```rust,ignore
//! use cast_test_utils::MockEncoder;
//!
//! let encoder = MockEncoder::builder()
//!     .fail_first(1)
//!     .exit_after(Duration::from_millis(200))
//!     .build();
//! ```

use async_trait::async_trait;
use cast_service::bridge::encoder::{EncoderLauncher, EncoderProcess, EncoderSpec};
use cast_service::errors::CastError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit code reported by a mock process that exits on its own.
pub const MOCK_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Default)]
struct Behavior {
    fail_first: u32,
    fail_always: bool,
    never_ready: bool,
    ready_delay: Option<Duration>,
    exit_after: Option<Duration>,
}

#[derive(Debug, Default)]
struct Shared {
    behavior: Behavior,
    launches: AtomicU32,
    kills: AtomicU32,
    running: AtomicUsize,
    specs: Mutex<Vec<EncoderSpec>>,
}

/// Launcher handing out mock encoder processes.
#[derive(Debug, Clone, Default)]
pub struct MockEncoder {
    shared: Arc<Shared>,
}

impl MockEncoder {
    #[must_use]
    pub fn builder() -> MockEncoderBuilder {
        MockEncoderBuilder::default()
    }

    /// Ready immediately, runs until killed.
    #[must_use]
    pub fn ready() -> Self {
        Self::builder().build()
    }

    /// Every launch fails.
    #[must_use]
    pub fn failing() -> Self {
        Self::builder().fail_always().build()
    }

    /// Launches succeed but readiness never comes.
    #[must_use]
    pub fn never_ready() -> Self {
        Self::builder().never_ready().build()
    }

    /// Number of `launch` calls so far.
    #[must_use]
    pub fn launch_count(&self) -> u32 {
        self.shared.launches.load(Ordering::SeqCst)
    }

    /// Number of processes killed.
    #[must_use]
    pub fn kill_count(&self) -> u32 {
        self.shared.kills.load(Ordering::SeqCst)
    }

    /// Processes launched and neither killed nor exited.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_spec(&self) -> Option<EncoderSpec> {
        self.shared.specs.lock().last().cloned()
    }

    #[must_use]
    pub fn specs(&self) -> Vec<EncoderSpec> {
        self.shared.specs.lock().clone()
    }
}

#[async_trait]
impl EncoderLauncher for MockEncoder {
    async fn launch(&self, spec: &EncoderSpec) -> Result<Box<dyn EncoderProcess>, CastError> {
        let attempt = self.shared.launches.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.specs.lock().push(spec.clone());

        let behavior = &self.shared.behavior;
        if behavior.fail_always || attempt <= behavior.fail_first {
            return Err(CastError::ProcessError(format!(
                "mock launch {attempt} failed"
            )));
        }

        self.shared.running.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProcess {
            id: 10_000 + attempt,
            behavior: behavior.clone(),
            killed: CancellationToken::new(),
            alive: true,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Builder for `MockEncoder`.
#[derive(Debug, Default)]
pub struct MockEncoderBuilder {
    behavior: Behavior,
}

impl MockEncoderBuilder {
    /// Fail the first `n` launches, then behave normally.
    #[must_use]
    pub fn fail_first(mut self, n: u32) -> Self {
        self.behavior.fail_first = n;
        self
    }

    #[must_use]
    pub fn fail_always(mut self) -> Self {
        self.behavior.fail_always = true;
        self
    }

    #[must_use]
    pub fn never_ready(mut self) -> Self {
        self.behavior.never_ready = true;
        self
    }

    /// Delay before readiness is reported.
    #[must_use]
    pub fn ready_after(mut self, delay: Duration) -> Self {
        self.behavior.ready_delay = Some(delay);
        self
    }

    /// Exit with [`MOCK_EXIT_CODE`] this long after being waited on.
    #[must_use]
    pub fn exit_after(mut self, delay: Duration) -> Self {
        self.behavior.exit_after = Some(delay);
        self
    }

    #[must_use]
    pub fn build(self) -> MockEncoder {
        MockEncoder {
            shared: Arc::new(Shared {
                behavior: self.behavior,
                ..Shared::default()
            }),
        }
    }
}

struct MockProcess {
    id: u32,
    behavior: Behavior,
    killed: CancellationToken,
    alive: bool,
    shared: Arc<Shared>,
}

impl MockProcess {
    fn mark_gone(&mut self) {
        if self.alive {
            self.alive = false;
            self.shared.running.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl EncoderProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(self.id)
    }

    async fn wait_ready(&mut self) -> Result<(), CastError> {
        if self.behavior.never_ready {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.behavior.ready_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn wait_exit(&mut self) -> Result<Option<i32>, CastError> {
        let Some(delay) = self.behavior.exit_after else {
            self.killed.cancelled().await;
            return Ok(None);
        };

        tokio::select! {
            () = self.killed.cancelled() => Ok(None),
            () = tokio::time::sleep(delay) => {
                self.mark_gone();
                Ok(Some(MOCK_EXIT_CODE))
            }
        }
    }

    async fn kill(&mut self) -> Result<(), CastError> {
        if self.alive {
            self.shared.kills.fetch_add(1, Ordering::SeqCst);
        }
        self.killed.cancel();
        self.mark_gone();
        Ok(())
    }
}

impl Drop for MockProcess {
    fn drop(&mut self) {
        // Mirrors kill_on_drop
        self.mark_gone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> EncoderSpec {
        EncoderSpec {
            program: PathBuf::from("ffmpeg"),
            sdp_path: PathBuf::from("stream.sdp"),
            output_dir: PathBuf::from("hls"),
            video_inputs: 2,
            audio_inputs: 2,
            segment_seconds: 4,
            window_size: 5,
        }
    }

    #[tokio::test]
    async fn test_fail_first_then_ready() {
        let encoder = MockEncoder::builder().fail_first(1).build();

        assert!(encoder.launch(&spec()).await.is_err());
        let mut process = encoder.launch(&spec()).await.unwrap();
        process.wait_ready().await.unwrap();

        assert_eq!(encoder.launch_count(), 2);
        assert_eq!(encoder.running(), 1);
        assert_eq!(encoder.last_spec(), Some(spec()));

        process.kill().await.unwrap();
        assert_eq!(encoder.kill_count(), 1);
        assert_eq!(encoder.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_after() {
        let encoder = MockEncoder::builder()
            .exit_after(Duration::from_secs(1))
            .build();
        let mut process = encoder.launch(&spec()).await.unwrap();

        assert_eq!(process.wait_exit().await.unwrap(), Some(MOCK_EXIT_CODE));
        assert_eq!(encoder.running(), 0);
        assert_eq!(encoder.kill_count(), 0);
    }
}
