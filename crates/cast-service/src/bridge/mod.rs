//! `BridgeActor` - the single compositing job.
//!
//! ```text
//! Idle -> Preparing -> Starting -> Linking -> Running -> Terminating -> Idle
//! ```
//!
//! - **Preparing**: one plain transport and one paused consumer per live
//!   producer, then the session descriptor is written.
//! - **Starting**: the encoder is launched and must report readiness.
//! - **Linking**: after warm-up each plain transport is pointed at its
//!   encoder port pair.
//! - **Running**: bridge consumers are resumed and media flows.
//!
//! Every transition runs inside the actor, so a second start or a stop is
//! applied only after the current step resolves. A stop also cancels the
//! in-flight job's token, which the start sequence checks between steps.
//!
//! A producer that closes before the descriptor is generated is left out of
//! it. One that closes afterwards has its leg released and that encoder input
//! goes silent; the job is not restarted.

pub mod descriptor;
pub mod encoder;
pub mod state;

use crate::actors::messages::{notify, BridgeMessage};
use crate::actors::metrics::{ActorType, MailboxMonitor};
use crate::config::Config;
use crate::coordinator::{ProducerConsumerCoordinator, ResourceEvent};
use crate::engine::MediaEngine;
use crate::errors::CastError;
use crate::observability::metrics;
use crate::registry::ProducerRecord;
use chrono::Utc;
use common::rtp::RtpCapabilities;
use common::types::{ConnectionState, MediaKind, TransportId};
use descriptor::{StreamDescriptor, StreamEntry};
use encoder::{launch_with_retry, EncoderHandle, EncoderLauncher, EncoderSpec};
use parking_lot::Mutex;
use state::{BridgeLeg, BridgePhase, BridgeState, BridgeStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Channel buffer size for the bridge mailbox.
const BRIDGE_CHANNEL_BUFFER: usize = 32;

/// Bridge settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub required_participants: usize,
    pub sdp_path: PathBuf,
    pub hls_dir: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub hls_segment_seconds: u32,
    pub hls_window_size: u32,
    pub rtp_base_port: u16,
    pub encoder_ready_timeout: Duration,
    pub encoder_spawn_attempts: u32,
    pub encoder_warmup: Duration,
    pub auto_stop: bool,
}

impl From<&Config> for BridgeSettings {
    fn from(config: &Config) -> Self {
        Self {
            required_participants: config.required_participants,
            sdp_path: config.sdp_path.clone(),
            hls_dir: config.hls_dir.clone(),
            ffmpeg_path: config.ffmpeg_path.clone(),
            hls_segment_seconds: config.hls_segment_seconds,
            hls_window_size: config.hls_window_size,
            rtp_base_port: config.rtp_base_port,
            encoder_ready_timeout: config.encoder_ready_timeout,
            encoder_spawn_attempts: config.encoder_spawn_attempts,
            encoder_warmup: config.encoder_warmup,
            auto_stop: config.auto_stop,
        }
    }
}

/// Handle to the `BridgeActor`.
#[derive(Clone, Debug)]
pub struct BridgeActorHandle {
    sender: mpsc::Sender<BridgeMessage>,
    cancel_token: CancellationToken,
    active_job: Arc<Mutex<Option<CancellationToken>>>,
    status: watch::Receiver<BridgeStatus>,
}

impl BridgeActorHandle {
    /// Start compositing. Resolves once the job is running or has failed.
    pub async fn start(&self) -> Result<BridgeStatus, CastError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BridgeMessage::Start { respond_to: tx })
            .await
            .map_err(|e| CastError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CastError::Internal(format!("response receive failed: {e}")))?
    }

    /// Stop compositing, cancelling a start in progress.
    ///
    /// Returns the phase the bridge was in when the stop was applied.
    pub async fn stop(&self) -> Result<BridgePhase, CastError> {
        if let Some(job) = self.active_job.lock().as_ref() {
            job.cancel();
        }

        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BridgeMessage::Stop { respond_to: tx })
            .await
            .map_err(|e| CastError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| CastError::Internal(format!("response receive failed: {e}")))
    }

    /// Forward an engine state for a bridge-owned transport. Does not wait.
    pub fn transport_state(
        &self,
        transport_id: TransportId,
        state: ConnectionState,
    ) -> Result<(), CastError> {
        notify(
            &self.sender,
            BridgeMessage::TransportState {
                transport_id,
                state,
            },
        )
    }

    /// Ask the bridge to re-check its legs against the engine.
    pub fn reconcile(&self) -> Result<(), CastError> {
        notify(&self.sender, BridgeMessage::Reconcile)
    }

    /// Latest published status, without going through the mailbox.
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        self.status.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<BridgeStatus> {
        self.status.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

pub struct BridgeActor {
    settings: BridgeSettings,
    coordinator: Arc<ProducerConsumerCoordinator>,
    engine: Arc<dyn MediaEngine>,
    launcher: Arc<dyn EncoderLauncher>,
    receiver: mpsc::Receiver<BridgeMessage>,
    notify: mpsc::WeakSender<BridgeMessage>,
    resource_events: broadcast::Receiver<ResourceEvent>,
    state: BridgeState,
    status_tx: watch::Sender<BridgeStatus>,
    active_job: Arc<Mutex<Option<CancellationToken>>>,
    cancel_token: CancellationToken,
    mailbox: MailboxMonitor,
}

impl BridgeActor {
    pub fn spawn(
        settings: BridgeSettings,
        coordinator: Arc<ProducerConsumerCoordinator>,
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn EncoderLauncher>,
        cancel_token: CancellationToken,
    ) -> (BridgeActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(BRIDGE_CHANNEL_BUFFER);
        let (status_tx, status_rx) = watch::channel(BridgeStatus::idle());
        let active_job = Arc::new(Mutex::new(None));
        let resource_events = coordinator.subscribe();

        let actor = Self {
            settings,
            coordinator,
            engine,
            launcher,
            receiver,
            notify: sender.downgrade(),
            resource_events,
            state: BridgeState::Idle,
            status_tx,
            active_job: Arc::clone(&active_job),
            cancel_token: cancel_token.clone(),
            mailbox: MailboxMonitor::new(ActorType::Bridge, "bridge"),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = BridgeActorHandle {
            sender,
            cancel_token,
            active_job,
            status: status_rx,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "cast.actor.bridge")]
    async fn run(mut self) {
        debug!(target: "cast.bridge", "BridgeActor started");
        let mut resource_events_open = true;

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cast.bridge", "BridgeActor received cancellation signal");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message).await;
                            self.mailbox.record_processed(self.receiver.len());
                        }
                        None => {
                            debug!(target: "cast.bridge", "BridgeActor channel closed, exiting");
                            break;
                        }
                    }
                }

                event = self.resource_events.recv(), if resource_events_open => {
                    match event {
                        Ok(event) => self.handle_resource_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(target: "cast.bridge", skipped, "Resource events lagged, reconciling");
                            self.reconcile_legs().await;
                            self.maybe_auto_stop().await;
                        }
                        Err(RecvError::Closed) => resource_events_open = false,
                    }
                }
            }
        }

        self.teardown("shutdown").await;
        info!(
            target: "cast.bridge",
            messages_processed = self.mailbox.messages_processed(),
            "BridgeActor stopped"
        );
    }

    async fn handle_message(&mut self, message: BridgeMessage) {
        match message {
            BridgeMessage::Start { respond_to } => {
                let result = self.start().await;
                let _ = respond_to.send(result);
            }

            BridgeMessage::Stop { respond_to } => {
                let phase = self.state.phase();
                self.teardown("stop requested").await;
                let _ = respond_to.send(phase);
            }

            BridgeMessage::TransportState {
                transport_id,
                state,
            } => {
                if state.is_terminal() {
                    self.release_legs(|leg| leg.transport_id == transport_id, "transport closed")
                        .await;
                }
            }

            BridgeMessage::Reconcile => {
                let engine = Arc::clone(&self.engine);
                self.release_legs(
                    |leg| {
                        !engine
                            .transport_state(leg.transport_id)
                            .is_some_and(|state| !state.is_terminal())
                    },
                    "transport closed",
                )
                .await;
                self.reconcile_legs().await;
                self.maybe_auto_stop().await;
            }

            BridgeMessage::EncoderExited { job_id, exit_code } => {
                if self.state.job_id() == Some(job_id) {
                    error!(target: "cast.bridge", job_id = %job_id, exit_code = ?exit_code, "Encoder exited, terminating job");
                    self.teardown("encoder exited").await;
                } else {
                    debug!(target: "cast.bridge", job_id = %job_id, "Exit of a finished job's encoder");
                }
            }
        }
    }

    async fn handle_resource_event(&mut self, event: ResourceEvent) {
        match event {
            ResourceEvent::ProducerClosed { producer_id, .. } => {
                self.release_legs(|leg| leg.producer_id == producer_id, "producer closed")
                    .await;
            }
            ResourceEvent::SessionClosed { .. } => {}
        }
        self.maybe_auto_stop().await;
    }

    #[instrument(skip_all, name = "cast.bridge.start")]
    async fn start(&mut self) -> Result<BridgeStatus, CastError> {
        if self.state.phase().is_active() {
            metrics::record_bridge_start("already_running");
            return Err(CastError::AlreadyRunning);
        }

        let required = self.settings.required_participants;
        let producing = self.coordinator.registry().producing_session_count();
        if producing < required {
            metrics::record_bridge_start("not_ready");
            debug!(target: "cast.bridge", required, producing, "Not enough producing participants");
            return Err(CastError::NotReady {
                required,
                producing,
            });
        }

        let job_id = Uuid::new_v4();
        let job_token = self.cancel_token.child_token();
        *self.active_job.lock() = Some(job_token.clone());
        // Closures before this point are already reflected in the registry
        self.resource_events = self.resource_events.resubscribe();
        let started = Instant::now();

        info!(target: "cast.bridge", job_id = %job_id, producing, "Starting compositing job");
        let result = self.run_job(job_id, &job_token).await;
        *self.active_job.lock() = None;

        match result {
            Ok(status) => {
                metrics::record_bridge_start("started");
                metrics::record_bridge_start_duration(started.elapsed());
                info!(
                    target: "cast.bridge",
                    job_id = %job_id,
                    streams = status.streams,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Compositing job running"
                );
                self.maybe_auto_stop().await;
                Ok(status)
            }
            Err(e) if job_token.is_cancelled() => {
                metrics::record_bridge_start("cancelled");
                info!(target: "cast.bridge", job_id = %job_id, "Compositing start cancelled by stop");
                self.teardown("cancelled").await;
                debug!(target: "cast.bridge", job_id = %job_id, error = %e, "Start aborted");
                Err(CastError::Cancelled)
            }
            Err(e) => {
                metrics::record_bridge_start("failed");
                warn!(target: "cast.bridge", job_id = %job_id, error = %e, "Compositing job did not start");
                self.teardown("failed").await;
                Err(e)
            }
        }
    }

    async fn run_job(
        &mut self,
        job_id: Uuid,
        token: &CancellationToken,
    ) -> Result<BridgeStatus, CastError> {
        // Preparing
        self.transition(BridgeState::Preparing {
            job_id,
            legs: Vec::new(),
        });
        reset_output_dir(&self.settings.hls_dir).await?;

        for producer in self.coordinator.registry().list_producers() {
            checkpoint(token)?;
            if let Some(leg) = self.open_leg(&producer).await? {
                if let Some(legs) = self.state.legs_mut() {
                    legs.push(leg);
                }
            }
        }

        self.drain_resource_events().await;
        self.reconcile_legs().await;
        checkpoint(token)?;

        let BridgeState::Preparing { legs, .. } = std::mem::take(&mut self.state) else {
            return Err(CastError::Internal("bridge left Preparing unexpectedly".to_string()));
        };
        let generated =
            StreamDescriptor::generate(&legs, self.settings.rtp_base_port, Utc::now().timestamp());
        let descriptor = match generated {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.state = BridgeState::Preparing { job_id, legs };
                return Err(e);
            }
        };
        let empty = descriptor.entries.is_empty();
        let spec = self.encoder_spec(&descriptor);
        self.transition(BridgeState::Starting {
            job_id,
            legs,
            descriptor,
        });

        if empty {
            return Err(CastError::NotReady {
                required: self.settings.required_participants,
                producing: self.coordinator.registry().producing_session_count(),
            });
        }
        if let BridgeState::Starting { descriptor, .. } = &self.state {
            descriptor.write_to(&self.settings.sdp_path).await?;
            debug!(target: "cast.bridge", job_id = %job_id, path = %self.settings.sdp_path.display(), streams = descriptor.entries.len(), "Session descriptor written");
        }
        checkpoint(token)?;

        // Starting
        let process = launch_with_retry(
            self.launcher.as_ref(),
            &spec,
            self.settings.encoder_spawn_attempts,
            self.settings.encoder_ready_timeout,
            token,
        )
        .await?;
        let encoder = EncoderHandle::monitor(job_id, process, self.notify.clone());

        let BridgeState::Starting {
            legs, descriptor, ..
        } = std::mem::take(&mut self.state)
        else {
            encoder.terminate().await;
            return Err(CastError::Internal("bridge left Starting unexpectedly".to_string()));
        };
        self.transition(BridgeState::Linking {
            job_id,
            legs,
            descriptor,
            encoder,
        });

        self.warm_up(token).await?;

        // Linking
        self.drain_resource_events().await;
        for entry in self.active_entries() {
            checkpoint(token)?;
            self.ensure_encoder_alive()?;
            match self
                .coordinator
                .transports()
                .connect_plain(entry.transport_id, entry.port, entry.rtcp_port)
                .await
            {
                Ok(()) => {
                    debug!(target: "cast.bridge", producer_id = %entry.producer_id, port = entry.port, "Bridge transport linked");
                }
                Err(e) if e.is_not_found() => {
                    let transport_id = entry.transport_id;
                    self.release_legs(|leg| leg.transport_id == transport_id, "transport gone")
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        // Linking -> Running
        self.drain_resource_events().await;
        for entry in self.active_entries() {
            checkpoint(token)?;
            self.ensure_encoder_alive()?;
            match self.engine.resume_consumer(entry.consumer_id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    self.release_legs(|leg| leg.consumer_id == entry.consumer_id, "consumer gone")
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        let BridgeState::Linking {
            legs,
            descriptor,
            encoder,
            ..
        } = std::mem::take(&mut self.state)
        else {
            return Err(CastError::Internal("bridge left Linking unexpectedly".to_string()));
        };
        self.transition(BridgeState::Running {
            job_id,
            legs,
            descriptor,
            encoder,
            started_at: Utc::now(),
        });

        Ok(self.state.status())
    }

    /// Plain transport plus paused consumer for one producer.
    ///
    /// `None` when the producer closed in the meantime.
    async fn open_leg(&self, producer: &ProducerRecord) -> Result<Option<BridgeLeg>, CastError> {
        let transport = self
            .coordinator
            .transports()
            .create_plain_transport()
            .await?;
        let capabilities = RtpCapabilities::mirroring(producer.kind, &producer.rtp_parameters);

        match self
            .engine
            .consume(transport.id, producer.id, &capabilities, true)
            .await
        {
            Ok(consumer) => {
                debug!(target: "cast.bridge", producer_id = %producer.id, consumer_id = %consumer.id, transport_id = %transport.id, "Bridge leg opened");
                Ok(Some(BridgeLeg {
                    producer_id: producer.id,
                    kind: consumer.kind,
                    transport_id: transport.id,
                    consumer_id: consumer.id,
                    rtp_parameters: consumer.rtp_parameters,
                    active: true,
                }))
            }
            Err(e) => {
                self.engine.close_transport(transport.id).await;
                if e.is_not_found() {
                    debug!(target: "cast.bridge", producer_id = %producer.id, "Producer closed before its leg opened");
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn warm_up(&self, token: &CancellationToken) -> Result<(), CastError> {
        let BridgeState::Linking { encoder, .. } = &self.state else {
            return Ok(());
        };
        tokio::select! {
            () = token.cancelled() => Err(CastError::Cancelled),
            () = encoder.exited() => Err(CastError::ProcessError(
                "encoder exited during warm-up".to_string(),
            )),
            () = tokio::time::sleep(self.settings.encoder_warmup) => Ok(()),
        }
    }

    fn ensure_encoder_alive(&self) -> Result<(), CastError> {
        match &self.state {
            BridgeState::Linking { encoder, .. } | BridgeState::Running { encoder, .. }
                if encoder.has_exited() =>
            {
                Err(CastError::ProcessError(
                    "encoder exited before media was linked".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Descriptor entries whose leg is still active.
    fn active_entries(&self) -> Vec<StreamEntry> {
        match &self.state {
            BridgeState::Linking {
                legs, descriptor, ..
            }
            | BridgeState::Running {
                legs, descriptor, ..
            } => descriptor
                .entries
                .iter()
                .filter(|entry| {
                    legs.iter()
                        .any(|leg| leg.active && leg.consumer_id == entry.consumer_id)
                })
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn encoder_spec(&self, descriptor: &StreamDescriptor) -> EncoderSpec {
        EncoderSpec {
            program: self.settings.ffmpeg_path.clone(),
            sdp_path: self.settings.sdp_path.clone(),
            output_dir: self.settings.hls_dir.clone(),
            video_inputs: descriptor.count(MediaKind::Video),
            audio_inputs: descriptor.count(MediaKind::Audio),
            segment_seconds: self.settings.hls_segment_seconds,
            window_size: self.settings.hls_window_size,
        }
    }

    /// Apply closures queued while a step was in flight.
    async fn drain_resource_events(&mut self) {
        loop {
            match self.resource_events.try_recv() {
                Ok(ResourceEvent::ProducerClosed { producer_id, .. }) => {
                    self.release_legs(|leg| leg.producer_id == producer_id, "producer closed")
                        .await;
                }
                Ok(ResourceEvent::SessionClosed { .. }) => {}
                Err(TryRecvError::Lagged(_)) => self.reconcile_legs().await,
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Release legs whose producer is no longer registered.
    async fn reconcile_legs(&mut self) {
        let registry = Arc::clone(self.coordinator.registry());
        self.release_legs(|leg| registry.producer(leg.producer_id).is_err(), "producer missing")
            .await;
    }

    /// Close the consumer and transport of matching active legs. The
    /// corresponding encoder input goes silent.
    async fn release_legs<F>(&mut self, matches: F, reason: &str)
    where
        F: Fn(&BridgeLeg) -> bool,
    {
        let job_id = self.state.job_id();
        let mut released = Vec::new();
        if let Some(legs) = self.state.legs_mut() {
            for leg in legs.iter_mut().filter(|leg| leg.active && matches(leg)) {
                leg.active = false;
                released.push((leg.producer_id, leg.consumer_id, leg.transport_id));
            }
        }

        for (producer_id, consumer_id, transport_id) in released {
            self.engine.close_consumer(consumer_id).await;
            self.engine.close_transport(transport_id).await;
            info!(
                target: "cast.bridge",
                job_id = ?job_id,
                producer_id = %producer_id,
                reason,
                "Bridge input released"
            );
        }
    }

    async fn maybe_auto_stop(&mut self) {
        if self.settings.auto_stop
            && self.state.phase() == BridgePhase::Running
            && self.coordinator.registry().producing_session_count() == 0
        {
            info!(target: "cast.bridge", "Last producing participant left, stopping");
            self.teardown("no producers left").await;
        }
    }

    /// Running/any -> Terminating -> Idle. No-op when idle.
    async fn teardown(&mut self, reason: &str) {
        let taken = self.state.take_for_teardown();
        let job_id = taken.job_id();
        let previous = taken.phase();
        if previous == BridgePhase::Idle {
            return;
        }
        self.publish();

        let (legs, encoder) = match taken {
            BridgeState::Preparing { legs, .. } | BridgeState::Starting { legs, .. } => {
                (legs, None)
            }
            BridgeState::Linking { legs, encoder, .. }
            | BridgeState::Running { legs, encoder, .. } => (legs, Some(encoder)),
            BridgeState::Idle | BridgeState::Terminating { .. } => (Vec::new(), None),
        };

        for leg in &legs {
            self.engine.close_consumer(leg.consumer_id).await;
            self.engine.close_transport(leg.transport_id).await;
        }
        if let Some(encoder) = encoder {
            encoder.terminate().await;
        }

        self.transition(BridgeState::Idle);
        info!(
            target: "cast.bridge",
            job_id = ?job_id,
            previous = %previous,
            legs = legs.len(),
            reason,
            "Compositing job terminated"
        );
    }

    fn transition(&mut self, next: BridgeState) {
        debug!(target: "cast.bridge", from = %self.state.phase(), to = %next.phase(), "Bridge transition");
        self.state = next;
        self.publish();
    }

    fn publish(&self) {
        let status = self.state.status();
        metrics::set_bridge_streams(status.streams);
        self.status_tx.send_replace(status);
    }
}

fn checkpoint(token: &CancellationToken) -> Result<(), CastError> {
    if token.is_cancelled() {
        Err(CastError::Cancelled)
    } else {
        Ok(())
    }
}

/// Remove the previous job's playlist and segments.
async fn reset_output_dir(dir: &Path) -> Result<(), CastError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(dir).await?;
    Ok(())
}
