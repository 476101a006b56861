//! The face-gated capture/verification state machine.
//!
//! [`GateSession`] is a handle to a single actor task that owns the camera
//! session, the detector adapter, the UI sink and every timer. Commands and
//! timer fires are handled one at a time on that task, so no state is shared
//! and no lock is needed. Detection and camera acquisition are awaited in
//! place; timers that fire meanwhile queue up and are checked against their
//! generation before anything acts on them.

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::camera::{CameraError, CameraInfo, CameraSession, CameraSource};
use crate::config::{ConfigError, GateConfig};
use crate::detector::{DetectionResult, DetectorAdapter, DetectorError, FaceModel, LoadError};
use crate::sink::{Alert, Screen, Severity, StatusLevel, UiSink};
use crate::timers::{TimerFired, TimerKind, Timers};

const VERIFY_FAILED: &str = "Face verification failed. Please try again.";
const MULTIPLE_FACES: &str = "Multiple faces detected. Please ensure only your face is visible.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    LoadingModel,
    RequestingCamera,
    Detecting,
    Stabilizing,
    Verifying,
    Captured,
    TimedOut,
    VerificationFailed,
    MultipleFaces,
    InitError,
    /// A failure has been shown; auto-restart is pending.
    AwaitingRetry,
    /// Torn down and waiting out the settle delay before setting up again.
    AutoRestarting,
    Disposed,
}

impl GateState {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            GateState::TimedOut
                | GateState::VerificationFailed
                | GateState::MultipleFaces
                | GateState::InitError
        )
    }

    fn is_detecting(self) -> bool {
        matches!(self, GateState::Detecting | GateState::Stabilizing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    NotAttempted,
    Pending,
    Succeeded,
    FailedNoFace,
    FailedMultipleFaces,
    FailedError,
}

/// Read-only view of the gate for display code.
#[derive(Debug, Clone, PartialEq)]
pub struct GateSnapshot {
    pub state: GateState,
    pub outcome: VerificationOutcome,
    pub camera: Option<CameraInfo>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("failed to load face detection models: {0}")]
    Load(#[from] LoadError),
    #[error("failed to access camera: {0}")]
    Camera(#[from] CameraError),
    #[error("detection failed: {0}")]
    Detection(#[from] DetectorError),
    #[error("no face detected before the timeout")]
    NoFaceTimeout,
    #[error("no face in the captured frame")]
    VerificationFailed,
    #[error("{0} faces in the captured frame")]
    MultipleFacesDetected(usize),
    #[error("gate session has shut down")]
    SessionClosed,
}

enum Command {
    Start,
    Retry,
    Dispose(oneshot::Sender<()>),
}

/// Owned handle to a running gate.
///
/// Dropping the handle tears the gate down: timers are cancelled and the
/// camera is released.
pub struct GateSession {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<GateSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl GateSession {
    /// Spawn the gate actor in `Idle`. Nothing happens until [`start`](Self::start).
    ///
    /// Fails without spawning anything if `config` does not validate.
    pub fn spawn<M, C, S>(
        config: GateConfig,
        detector: DetectorAdapter<M>,
        camera: C,
        sink: S,
    ) -> Result<Self, ConfigError>
    where
        M: FaceModel,
        C: CameraSource,
        S: UiSink,
    {
        config.validate()?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (timers, fired_rx) = Timers::new();
        let initial = GateSnapshot {
            state: GateState::Idle,
            outcome: VerificationOutcome::NotAttempted,
            camera: None,
        };
        let (snapshot_tx, snapshot) = watch::channel(initial);

        let gate = Gate {
            config,
            detector,
            source: camera,
            camera: None,
            sink,
            timers,
            state: GateState::Idle,
            outcome: VerificationOutcome::NotAttempted,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(gate.run(command_rx, fired_rx));

        Ok(Self {
            commands,
            snapshot,
            task: Some(task),
        })
    }

    /// Begin setup. Ignored unless the gate is idle.
    pub fn start(&self) -> Result<(), GateError> {
        self.send(Command::Start)
    }

    /// Tear everything down and set up again after the settle delay.
    /// Repeated calls while a restart is already underway are ignored.
    pub fn retry(&self) -> Result<(), GateError> {
        self.send(Command::Retry)
    }

    pub fn snapshot(&self) -> GateSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the published snapshot satisfies `pred`.
    ///
    /// Only the latest snapshot is observed; states that come and go between
    /// two polls of the watch channel can be missed. Use a [`UiSink`] to see
    /// every transition.
    pub async fn wait_until(
        &self,
        mut pred: impl FnMut(&GateSnapshot) -> bool,
    ) -> Result<GateSnapshot, GateError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| pred(s))
            .await
            .map_err(|_| GateError::SessionClosed)?;
        Ok(snapshot.clone())
    }

    /// Cancel every timer, release the camera and stop the actor.
    pub async fn dispose(mut self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Dispose(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), GateError> {
        self.commands
            .send(command)
            .map_err(|_| GateError::SessionClosed)
    }
}

struct Gate<M: FaceModel, C: CameraSource, S: UiSink> {
    config: GateConfig,
    detector: DetectorAdapter<M>,
    source: C,
    camera: Option<CameraSession<C::Stream>>,
    sink: S,
    timers: Timers,
    state: GateState,
    outcome: VerificationOutcome,
    snapshot: watch::Sender<GateSnapshot>,
}

impl<M: FaceModel, C: CameraSource, S: UiSink> Gate<M, C, S> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut fired: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Start) => self.start().await,
                    Some(Command::Retry) => self.retry(),
                    Some(Command::Dispose(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = fired.recv() => {
                    if self.timers.accept(event) {
                        self.on_timer(event.kind).await;
                    }
                }
            }
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Poll => self.poll_tick().await,
            TimerKind::Stabilization => self.verify().await,
            TimerKind::NoFace => self.no_face_timeout(),
            TimerKind::AutoRestart => {
                if self.state == GateState::AwaitingRetry {
                    self.restart("auto");
                }
            }
            TimerKind::SuccessDisplay => self.hand_off(),
            TimerKind::Settle => {
                if self.state == GateState::AutoRestarting {
                    self.setup().await;
                }
            }
        }
    }

    async fn start(&mut self) {
        if self.state != GateState::Idle {
            tracing::debug!(state = ?self.state, "start ignored");
            return;
        }
        self.setup().await;
    }

    async fn setup(&mut self) {
        if !self.detector.is_loaded() {
            self.set_state(GateState::LoadingModel);
            self.sink
                .on_status("Loading face detection models...", StatusLevel::Loading);
            if let Err(e) = self.detector.load_model().await {
                return self.fail(GateState::InitError, e.into());
            }
            self.sink
                .on_status("Models loaded successfully", StatusLevel::Loading);
        }

        self.set_state(GateState::RequestingCamera);
        self.sink
            .on_status("Requesting camera access...", StatusLevel::Loading);
        self.release_camera();
        match self.source.open(&self.config.camera).await {
            Ok(stream) => {
                let session = CameraSession::new(stream);
                let info = session.info();
                tracing::info!(width = info.width, height = info.height, "camera opened");
                self.camera = Some(session);
            }
            Err(e) => return self.fail(GateState::InitError, e.into()),
        }

        self.sink
            .on_status("Camera ready. Waiting for face...", StatusLevel::Loading);
        self.set_state(GateState::Detecting);
        self.timers
            .start_repeating(TimerKind::Poll, self.config.poll_interval);
        self.timers
            .start_once(TimerKind::NoFace, self.config.no_face_timeout);
    }

    async fn poll_tick(&mut self) {
        if !self.state.is_detecting() {
            return;
        }
        let Some(camera) = self.camera.as_mut() else {
            return;
        };

        let frame = match camera.live_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "live frame unavailable");
                self.sink.on_status("Detection error", StatusLevel::Error);
                return;
            }
        };
        let result = match self.detector.detect_faces(&frame).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "detection tick failed");
                self.sink.on_status("Detection error", StatusLevel::Error);
                return;
            }
        };
        self.sink.on_detections(&result);

        match result.face_count() {
            0 => {
                if self.timers.cancel(TimerKind::Stabilization) {
                    tracing::debug!("face lost, stabilization reset");
                }
                self.sink.on_status("No face detected", StatusLevel::Error);
                if self.state != GateState::Detecting {
                    self.set_state(GateState::Detecting);
                }
            }
            1 => {
                self.sink.on_status("Face detected", StatusLevel::Success);
                if !self.timers.is_pending(TimerKind::Stabilization) {
                    self.timers.start_once(
                        TimerKind::Stabilization,
                        self.config.stabilization_delay,
                    );
                    self.set_state(GateState::Stabilizing);
                }
            }
            faces => {
                tracing::debug!(faces, "multiple faces in live frame");
                self.sink.on_status(MULTIPLE_FACES, StatusLevel::Error);
            }
        }
    }

    async fn verify(&mut self) {
        if self.state != GateState::Stabilizing {
            return;
        }
        self.timers.cancel(TimerKind::Poll);
        self.outcome = VerificationOutcome::Pending;
        self.set_state(GateState::Verifying);
        self.sink.on_status("Verifying face...", StatusLevel::Loading);

        let result = match self.capture_and_detect().await {
            Ok(result) => result,
            Err(e) => {
                self.outcome = VerificationOutcome::FailedError;
                return self.fail(GateState::VerificationFailed, e);
            }
        };

        match result.face_count() {
            0 => {
                self.outcome = VerificationOutcome::FailedNoFace;
                self.fail(GateState::VerificationFailed, GateError::VerificationFailed);
            }
            1 => {
                self.timers.cancel(TimerKind::NoFace);
                self.outcome = VerificationOutcome::Succeeded;
                self.set_state(GateState::Captured);
                self.sink
                    .on_status("Face detected successfully", StatusLevel::Success);
                self.timers.start_once(
                    TimerKind::SuccessDisplay,
                    self.config.success_display_delay,
                );
                tracing::info!(confidence = result.faces[0].confidence, "face captured");
            }
            faces => {
                self.outcome = VerificationOutcome::FailedMultipleFaces;
                self.fail(
                    GateState::MultipleFaces,
                    GateError::MultipleFacesDetected(faces),
                );
            }
        }
    }

    async fn capture_and_detect(&mut self) -> Result<DetectionResult, GateError> {
        let camera = self
            .camera
            .as_mut()
            .ok_or(GateError::Camera(CameraError::Stopped))?;
        let frame = camera.capture_still()?;
        Ok(self.detector.detect_faces(&frame).await?)
    }

    fn no_face_timeout(&mut self) {
        if self.state.is_detecting() {
            self.fail(GateState::TimedOut, GateError::NoFaceTimeout);
        }
    }

    fn hand_off(&mut self) {
        if self.state != GateState::Captured {
            return;
        }
        self.release_camera();
        self.publish();
        self.sink.on_screen_change(Screen::Login);
        tracing::info!("face gate passed");
    }

    /// Surface a terminal failure and schedule the automatic restart.
    fn fail(&mut self, state: GateState, error: GateError) {
        debug_assert!(state.is_failure());
        tracing::warn!(?state, error = %error, "face gate failed");
        self.timers.cancel(TimerKind::Poll);
        self.timers.cancel(TimerKind::Stabilization);
        self.timers.cancel(TimerKind::NoFace);
        self.set_state(state);

        let (status, message) = failure_text(state, &error);
        self.sink.on_status(&status, StatusLevel::Error);
        self.sink.on_show_alert(Alert {
            title: "Error".to_string(),
            message,
            severity: Severity::Error,
            offer_retry: true,
        });

        self.timers
            .start_once(TimerKind::AutoRestart, self.config.auto_restart_delay);
        self.set_state(GateState::AwaitingRetry);
    }

    fn retry(&mut self) {
        match self.state {
            GateState::AutoRestarting | GateState::Disposed => {
                tracing::debug!(state = ?self.state, "retry already underway");
            }
            _ => self.restart("manual"),
        }
    }

    fn restart(&mut self, trigger: &'static str) {
        tracing::info!(trigger, from = ?self.state, "restarting face gate");
        self.timers.cancel_all();
        self.release_camera();
        self.outcome = VerificationOutcome::NotAttempted;
        self.set_state(GateState::AutoRestarting);
        self.sink.on_screen_change(Screen::Capture);
        self.sink
            .on_status("Restarting face detection...", StatusLevel::Loading);
        self.timers
            .start_once(TimerKind::Settle, self.config.retry_settle_delay);
    }

    fn shutdown(&mut self) {
        self.timers.cancel_all();
        self.release_camera();
        self.set_state(GateState::Disposed);
        tracing::info!("face gate disposed");
    }

    fn release_camera(&mut self) {
        if let Some(mut camera) = self.camera.take() {
            camera.release();
        }
    }

    fn set_state(&mut self, state: GateState) {
        tracing::debug!(from = ?self.state, to = ?state, "gate transition");
        self.state = state;
        self.sink.on_state(state);
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(GateSnapshot {
            state: self.state,
            outcome: self.outcome,
            camera: self.camera.as_ref().map(|c| c.info()),
        });
    }
}

/// Status line and alert body for a terminal failure.
fn failure_text(state: GateState, error: &GateError) -> (String, String) {
    match (state, error) {
        (GateState::TimedOut, _) => (
            "Timed out waiting for face".to_string(),
            "No face detected. Please try again.".to_string(),
        ),
        (GateState::MultipleFaces, _) => (MULTIPLE_FACES.to_string(), MULTIPLE_FACES.to_string()),
        (GateState::VerificationFailed, GateError::VerificationFailed) => {
            (VERIFY_FAILED.to_string(), VERIFY_FAILED.to_string())
        }
        (GateState::VerificationFailed, other) => (
            VERIFY_FAILED.to_string(),
            format!("Face verification failed: {other}"),
        ),
        (_, other) => (
            format!("Error initializing: {other}"),
            format!("Error initializing: {other}"),
        ),
    }
}
