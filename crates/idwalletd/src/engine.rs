use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

use idwallet_core::document::{self, ScanOutcome};
use idwallet_core::frame::mean_luminance;
use idwallet_core::{
    CameraFacing, ChallengeKind, DocumentKind, Event, FaceDetectionProvider, FaceSelection,
    FacialFeatureExtractor, Frame, LicenseFormat, OcrProvider, Outcome, SessionConfig, StageKind,
    StageToken, ValidatedNumber, VerificationError, VerificationSession,
};
use image::RgbImage;
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

const COMMAND_QUEUE: usize = 8;
const JOB_QUEUE: usize = 2;
/// Sleep used when no timer is armed; the select branch is disabled anyway.
const IDLE_PARK: Duration = Duration::from_secs(3600);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn inference thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("session actor exited")]
    ChannelClosed,
}

/// The external capabilities one session's inference thread owns.
pub struct Providers {
    pub ocr: Box<dyn OcrProvider>,
    pub faces: Box<dyn FaceDetectionProvider>,
}

/// Creates a fresh set of providers for each session.
pub trait ProviderFactory: Send + Sync {
    fn create(&self) -> Providers;
}

/// Snapshot of a session, published after every input.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub user: String,
    pub active: bool,
    pub stage: StageKind,
    /// Camera the frame source should have bound; `None` when no frames are needed.
    pub camera: Option<CameraFacing>,
    pub challenge: Option<ChallengeKind>,
    pub instruction: Option<String>,
    /// Masked document number, once read.
    pub document_number: Option<String>,
    pub match_score: Option<f32>,
    pub matched: Option<bool>,
    pub error: Option<VerificationError>,
    pub analyses: u64,
    pub frames_dropped: u64,
}

impl SessionStatus {
    fn initial(session_id: &str, user: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user: user.to_string(),
            active: true,
            stage: StageKind::AadhaarCard,
            camera: StageKind::AadhaarCard.camera(),
            challenge: None,
            instruction: None,
            document_number: None,
            match_score: None,
            matched: None,
            error: None,
            analyses: 0,
            frames_dropped: 0,
        }
    }
}

/// Sent once per session when it reaches `Complete`.
#[derive(Debug, Clone)]
pub struct CompletedVerification {
    pub session_id: String,
    pub user: String,
    pub document_number: ValidatedNumber,
    pub score: f32,
    pub matched: bool,
}

enum Command {
    Frame(Frame),
    Reset,
    DismissError,
    Cancel(oneshot::Sender<()>),
}

/// Clone-safe handle to one session actor.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    tx: mpsc::Sender<Command>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a camera frame. Frames that arrive while inference is busy
    /// replace each other; only the latest is analysed.
    pub async fn submit_frame(&self, frame: Frame) -> Result<(), EngineError> {
        self.send(Command::Frame(frame)).await
    }

    /// Abandon the attempt and start over from the document stage.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.send(Command::Reset).await
    }

    /// Clear the error currently shown to the subject.
    pub async fn dismiss_error(&self) -> Result<(), EngineError> {
        self.send(Command::DismissError).await
    }

    /// Stop the session and wait for the actor to exit.
    pub async fn cancel(&self) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(Command::Cancel(ack_tx)).await?;
        ack_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    async fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Start a verification session: an inference thread owning `providers` and
/// an actor task owning the state machine. Must be called inside a Tokio runtime.
///
/// The session ends on its own once `idle_timeout` passes without a command.
pub fn spawn_session(
    id: String,
    user: String,
    config: SessionConfig,
    idle_timeout: Duration,
    providers: Providers,
    rng: Box<dyn RngCore + Send>,
    completions: mpsc::UnboundedSender<CompletedVerification>,
) -> Result<SessionHandle, EngineError> {
    let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE);
    let (result_tx, result_rx) = mpsc::channel(JOB_QUEUE);
    spawn_worker(&id, providers, job_rx, result_tx)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
    let (status_tx, status_rx) = watch::channel(SessionStatus::initial(&id, &user));

    let actor = Actor {
        id: id.clone(),
        user,
        session: VerificationSession::new(config, rng, StdInstant::now()),
        commands: cmd_rx,
        jobs: job_tx,
        results: result_rx,
        status: status_tx,
        completions,
        idle_timeout,
        last_input: Instant::now(),
        in_flight: 0,
        pending: None,
        analyses: 0,
        frames_dropped: 0,
    };
    tokio::spawn(actor.run());

    Ok(SessionHandle {
        id,
        tx: cmd_tx,
        status: status_rx,
    })
}

// ── Inference thread ──────────────────────────────────────────────────────────

enum Job {
    ScanDocument(Frame),
    DocumentFace(Arc<RgbImage>),
    Selfie(Frame),
    Liveness(Frame),
}

struct JobRequest {
    token: StageToken,
    job: Job,
}

struct JobResult {
    token: StageToken,
    /// `None` when the job produced nothing the state machine cares about.
    event: Option<Event>,
}

fn spawn_worker(
    session_id: &str,
    providers: Providers,
    mut jobs: mpsc::Receiver<JobRequest>,
    results: mpsc::Sender<JobResult>,
) -> Result<(), EngineError> {
    let short_id: String = session_id.chars().take(8).collect();
    std::thread::Builder::new()
        .name(format!("idwallet-{short_id}"))
        .spawn(move || {
            tracing::debug!("inference thread started");
            let Providers { mut ocr, faces } = providers;
            let mut extractor = FacialFeatureExtractor::new(faces);
            while let Some(JobRequest { token, job }) = jobs.blocking_recv() {
                let event = run_job(job, &mut *ocr, &mut extractor);
                if results.blocking_send(JobResult { token, event }).is_err() {
                    break;
                }
            }
            tracing::debug!("inference thread exiting");
        })
        .map_err(EngineError::Spawn)?;
    Ok(())
}

fn run_job(
    job: Job,
    ocr: &mut dyn OcrProvider,
    extractor: &mut FacialFeatureExtractor<Box<dyn FaceDetectionProvider>>,
) -> Option<Event> {
    match job {
        Job::ScanDocument(frame) => {
            let image = match frame.into_image() {
                Ok(image) => image,
                Err(e) => return Some(Event::ProviderFailed(e.to_string())),
            };
            let text = match ocr.process(&image) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "ocr failed");
                    return Some(Event::ProviderFailed(e.to_string()));
                }
            };
            // Aadhaar is the only document the flow reads; license strictness does not apply.
            match document::scan(&text.text, DocumentKind::Aadhaar, LicenseFormat::default()) {
                ScanOutcome::Found(number) => Some(Event::DocumentNumber {
                    number,
                    still: image,
                }),
                ScanOutcome::Rejected { .. } => Some(Event::DocumentRejected),
                ScanOutcome::Nothing => None,
            }
        }
        Job::DocumentFace(still) => Some(Event::DocumentFace(
            extractor.detect(&still, FaceSelection::Largest),
        )),
        Job::Selfie(frame) => {
            let image = match frame.into_image() {
                Ok(image) => image,
                Err(e) => return Some(Event::ProviderFailed(e.to_string())),
            };
            let luminance = mean_luminance(&image);
            let face = extractor.detect(&image, FaceSelection::Single);
            Some(Event::SelfieFrame {
                face,
                width: image.width(),
                height: image.height(),
                luminance,
            })
        }
        Job::Liveness(frame) => match frame.into_image() {
            Ok(image) => Some(Event::LivenessFrame(
                extractor.detect(&image, FaceSelection::Single),
            )),
            Err(e) => Some(Event::ProviderFailed(e.to_string())),
        },
    }
}

// ── Session actor ─────────────────────────────────────────────────────────────

struct Actor {
    id: String,
    user: String,
    session: VerificationSession,
    commands: mpsc::Receiver<Command>,
    jobs: mpsc::Sender<JobRequest>,
    results: mpsc::Receiver<JobResult>,
    status: watch::Sender<SessionStatus>,
    completions: mpsc::UnboundedSender<CompletedVerification>,
    idle_timeout: Duration,
    last_input: Instant,
    in_flight: usize,
    /// Latest frame received while inference was busy.
    pending: Option<Frame>,
    analyses: u64,
    frames_dropped: u64,
}

impl Actor {
    async fn run(mut self) {
        tracing::info!(session = %self.id, user = %self.user, "verification session started");
        self.publish(true);

        loop {
            let armed = self.session.token();
            let deadline = self.session.next_deadline();
            let sleep_at = deadline
                .map(Instant::from_std)
                .unwrap_or_else(|| Instant::now() + IDLE_PARK);

            let idle_at = self.last_input + self.idle_timeout;

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Frame(frame)) => {
                        self.last_input = Instant::now();
                        self.on_frame(frame);
                    }
                    Some(Command::Reset) => {
                        self.last_input = Instant::now();
                        tracing::info!(session = %self.id, "session reset requested");
                        let outcome = self.session.reset(StdInstant::now());
                        self.after(outcome);
                    }
                    Some(Command::DismissError) => {
                        self.last_input = Instant::now();
                        self.session.take_error();
                    }
                    Some(Command::Cancel(ack)) => {
                        tracing::info!(session = %self.id, "session cancelled");
                        self.commands.close();
                        self.publish(false);
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        tracing::debug!(session = %self.id, "all session handles dropped");
                        break;
                    }
                },
                Some(result) = self.results.recv() => self.on_result(result),
                _ = tokio::time::sleep_until(idle_at) => {
                    tracing::info!(session = %self.id, idle = ?self.idle_timeout, "session idle, ending");
                    self.commands.close();
                    break;
                }
                _ = tokio::time::sleep_until(sleep_at), if deadline.is_some() => {
                    let outcome = self.session.expire(armed, StdInstant::now());
                    self.after(outcome);
                }
            }

            self.publish(true);
        }

        self.publish(false);
    }

    fn on_frame(&mut self, frame: Frame) {
        if self.in_flight > 0 {
            if self.pending.replace(frame).is_some() {
                self.frames_dropped += 1;
            }
            return;
        }
        self.dispatch_frame(frame);
    }

    fn dispatch_frame(&mut self, frame: Frame) {
        let job = match self.session.stage_kind() {
            StageKind::AadhaarCard => Job::ScanDocument(frame),
            StageKind::Selfie => Job::Selfie(frame),
            StageKind::LivenessCheck => Job::Liveness(frame),
            StageKind::AadhaarFaceDetection | StageKind::FaceComparison | StageKind::Complete => {
                self.frames_dropped += 1;
                return;
            }
        };
        self.dispatch(job);
    }

    fn dispatch(&mut self, job: Job) {
        let token = self.session.token();
        match self.jobs.try_send(JobRequest { token, job }) {
            Ok(()) => self.in_flight += 1,
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "inference thread unavailable");
                let outcome = self.session.handle(
                    token,
                    Event::ProviderFailed("inference thread unavailable".into()),
                    StdInstant::now(),
                );
                self.after(outcome);
            }
        }
    }

    fn on_result(&mut self, result: JobResult) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.analyses += 1;

        if let Some(event) = result.event {
            let outcome = self.session.handle(result.token, event, StdInstant::now());
            if outcome == Outcome::Stale {
                tracing::debug!(session = %self.id, stage = %result.token.stage, "stale inference result discarded");
            }
            self.after(outcome);
        }

        if self.in_flight == 0 {
            if let Some(frame) = self.pending.take() {
                self.dispatch_frame(frame);
            }
        }
    }

    /// Kick off whatever a newly entered stage needs without waiting for a frame.
    fn after(&mut self, outcome: Outcome) {
        let Outcome::Transitioned { to, .. } = outcome else {
            return;
        };
        // Buffered frames belong to the previous stage (and possibly the other camera).
        if self.pending.take().is_some() {
            self.frames_dropped += 1;
        }

        match to {
            StageKind::AadhaarFaceDetection => {
                if let Some(still) = self.session.document_still() {
                    self.dispatch(Job::DocumentFace(still));
                }
            }
            StageKind::FaceComparison => {
                let token = self.session.token();
                let outcome = self
                    .session
                    .handle(token, Event::CompareFaces, StdInstant::now());
                self.after(outcome);
            }
            StageKind::Complete => self.report_completion(),
            StageKind::AadhaarCard | StageKind::Selfie | StageKind::LivenessCheck => {}
        }
    }

    fn report_completion(&self) {
        let (Some(number), Some(score), Some(matched)) = (
            self.session.document_number(),
            self.session.match_score(),
            self.session.match_decision(),
        ) else {
            return;
        };
        tracing::info!(
            session = %self.id,
            user = %self.user,
            document = %number.masked(),
            score,
            matched,
            "verification complete"
        );
        let _ = self.completions.send(CompletedVerification {
            session_id: self.id.clone(),
            user: self.user.clone(),
            document_number: number.clone(),
            score,
            matched,
        });
    }

    fn publish(&self, active: bool) {
        let stage = self.session.stage_kind();
        let challenge = self.session.liveness_challenge();
        self.status.send_replace(SessionStatus {
            session_id: self.id.clone(),
            user: self.user.clone(),
            active,
            stage,
            camera: stage.camera(),
            challenge,
            instruction: challenge.map(|c| c.instruction().to_string()),
            document_number: self.session.document_number().map(|n| n.masked()),
            match_score: self.session.match_score(),
            matched: self.session.match_decision(),
            error: self.session.last_error().cloned(),
            analyses: self.analyses,
            frames_dropped: self.frames_dropped,
        });
    }
}
