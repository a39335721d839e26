use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use idwallet_core::document::{self, ScanOutcome};
use idwallet_core::{DocumentKind, Frame};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, Mutex};
use zbus::interface;

use crate::config::Config;
use crate::engine::{self, CompletedVerification, ProviderFactory, SessionHandle};
use crate::rate_limiter::RateLimiter;
use crate::store::VerifiedIdentityStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub providers: Arc<dyn ProviderFactory>,
    pub sessions: HashMap<String, SessionHandle>,
    pub store: VerifiedIdentityStore,
    pub rate_limiter: RateLimiter,
    pub completions: mpsc::UnboundedSender<CompletedVerification>,
}

impl AppState {
    /// Refuse new attempts from a locked-out user.
    fn admit(&mut self, user: &str, now: Instant) -> zbus::fdo::Result<()> {
        self.rate_limiter.check(user, now).map_err(|msg| {
            tracing::warn!(user, "rate limited");
            zbus::fdo::Error::Failed(msg)
        })
    }

    fn start_session(&mut self, user: &str) -> zbus::fdo::Result<String> {
        self.admit(user, Instant::now())?;

        self.sessions.retain(|_, handle| handle.status().active);
        let live = self
            .sessions
            .values()
            .filter(|handle| handle.status().user == user)
            .count();
        if live >= self.config.max_sessions_per_user {
            tracing::warn!(user, live, "begin: too many live sessions");
            return Err(zbus::fdo::Error::LimitsExceeded(format!(
                "user '{user}' already has {live} live sessions"
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let handle = engine::spawn_session(
            session_id.clone(),
            user.to_string(),
            self.config.session_config(),
            self.config.session_idle_timeout(),
            self.providers.create(),
            Box::new(StdRng::from_entropy()),
            self.completions.clone(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "begin: session spawn failed");
            failed(e)
        })?;
        self.sessions.insert(session_id.clone(), handle);
        Ok(session_id)
    }
}

/// Reset a session unless its user is locked out.
async fn restart_session(state: &Mutex<AppState>, handle: &SessionHandle) -> zbus::fdo::Result<()> {
    let user = handle.status().user;
    state.lock().await.admit(&user, Instant::now())?;
    handle.reset().await.map_err(failed)
}

/// D-Bus interface for the identity verification daemon.
///
/// Bus name: org.idwallet.Verifier1
/// Object path: /org/idwallet/Verifier1
pub struct VerifierService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn).await.map_err(failed)?;
    let bus_name = zbus::names::BusName::try_from(sender_str).map_err(failed)?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(failed)
}

/// Look up the numeric UID for a local username by parsing `/etc/passwd`.
fn uid_for_name(name: &str) -> Option<u32> {
    let contents = std::fs::read_to_string("/etc/passwd").ok()?;
    contents.lines().find_map(|line| {
        let mut parts = line.split(':');
        if parts.next()? != name {
            return None;
        }
        parts.nth(1)?.parse().ok()
    })
}

impl VerifierService {
    /// On the system bus the caller must be root or the user it acts for.
    /// On the session bus (development mode) every caller is the same user.
    async fn authorize(
        &self,
        user: &str,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        // Read session_bus flag without holding lock across the async UID lookup
        if self.state.lock().await.config.session_bus {
            return Ok(());
        }

        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
        if caller_uid == 0 {
            return Ok(());
        }
        match uid_for_name(user) {
            Some(expected_uid) if caller_uid == expected_uid => Ok(()),
            Some(_) => {
                tracing::warn!(user, caller_uid, "caller UID does not match target user UID");
                Err(zbus::fdo::Error::AccessDenied(format!(
                    "caller is not permitted to act for user '{user}'"
                )))
            }
            None => {
                tracing::warn!(user, "unknown user");
                Err(zbus::fdo::Error::Failed(format!("unknown user '{user}'")))
            }
        }
    }

    /// Look up a session and check the caller may drive it.
    async fn session(
        &self,
        session_id: &str,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<SessionHandle> {
        let handle = self
            .state
            .lock()
            .await
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| zbus::fdo::Error::Failed(format!("unknown session '{session_id}'")))?;
        self.authorize(&handle.status().user, header, conn).await?;
        Ok(handle)
    }
}

#[interface(name = "org.idwallet.Verifier1")]
impl VerifierService {
    /// Start a verification session for `user`. Returns the session ID.
    async fn begin(
        &self,
        user: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, "begin requested");
        self.authorize(user, &header, conn).await?;

        self.state.lock().await.start_session(user)
    }

    /// Deliver one camera frame (packed RGB8, sensor orientation).
    async fn submit_frame(
        &self,
        session_id: &str,
        data: Vec<u8>,
        width: u32,
        height: u32,
        rotation_degrees: u32,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let handle = self.session(session_id, &header, conn).await?;
        handle
            .submit_frame(Frame::new(data, width, height, rotation_degrees))
            .await
            .map_err(failed)
    }

    /// Current session snapshot as JSON.
    async fn status(
        &self,
        session_id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let handle = self.session(session_id, &header, conn).await?;
        serde_json::to_string(&handle.status()).map_err(failed)
    }

    async fn dismiss_error(
        &self,
        session_id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let handle = self.session(session_id, &header, conn).await?;
        handle.dismiss_error().await.map_err(failed)
    }

    /// Restart the session from the document stage. Refused while the
    /// user is locked out.
    async fn reset(
        &self,
        session_id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        let handle = self.session(session_id, &header, conn).await?;
        restart_session(&self.state, &handle).await
    }

    /// Stop the session. Returns false if it had already ended.
    async fn cancel(
        &self,
        session_id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        let handle = self.session(session_id, &header, conn).await?;
        self.state.lock().await.sessions.remove(session_id);
        let cancelled = handle.cancel().await.is_ok();
        tracing::info!(session_id, cancelled, "cancel requested");
        Ok(cancelled)
    }

    /// List the user's stored verifications as JSON (numbers masked).
    async fn list_verifications(
        &self,
        user: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(user, "list_verifications requested");
        self.authorize(user, &header, conn).await?;
        let state = self.state.lock().await;
        let records = state.store.list_by_user(user).await.map_err(failed)?;
        serde_json::to_string(&records).map_err(failed)
    }

    /// Remove a stored verification by ID (scoped to user).
    async fn remove_verification(
        &self,
        user: &str,
        id: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(user, id, "remove_verification requested");
        self.authorize(user, &header, conn).await?;
        let state = self.state.lock().await;
        let removed = state.store.remove(user, id).await.map_err(failed)?;
        if !removed {
            tracing::warn!(id, user, "verification not found or not owned by user");
        }
        Ok(removed)
    }

    /// Find and validate a document number of `kind` in OCR text.
    ///
    /// Returns JSON: `{"status": "found", "kind": …, "number": …}`,
    /// `{"status": "rejected", "candidates": n}` or `{"status": "nothing"}`.
    async fn extract_number(&self, kind: &str, text: &str) -> zbus::fdo::Result<String> {
        let kind: DocumentKind = kind.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        let format = self.state.lock().await.config.license_format();
        let reply = match document::scan(text, kind, format) {
            ScanOutcome::Found(number) => serde_json::json!({
                "status": "found",
                "kind": number.kind,
                "number": number.value,
            }),
            ScanOutcome::Rejected { candidates } => serde_json::json!({
                "status": "rejected",
                "candidates": candidates,
            }),
            ScanOutcome::Nothing => serde_json::json!({ "status": "nothing" }),
        };
        Ok(reply.to_string())
    }

    /// Return daemon status information as JSON.
    async fn daemon_status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let stored = state.store.count_all().await.unwrap_or(0);
        let active = state
            .sessions
            .values()
            .filter(|h| h.status().active)
            .count();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": active,
            "verifications_stored": stored,
            "locked_users": state.rate_limiter.locked_count(Instant::now()),
            "match_threshold": state.config.match_threshold,
            "ocr_command": state.config.ocr_command,
            "face_command": state.config.face_command,
            "session_bus": state.config.session_bus,
        })
        .to_string())
    }
}

/// Persist matches and feed outcomes to the rate limiter as sessions complete.
pub async fn record_completions(
    state: Arc<Mutex<AppState>>,
    mut completions: mpsc::UnboundedReceiver<CompletedVerification>,
) {
    while let Some(done) = completions.recv().await {
        let mut state = state.lock().await;
        if !done.matched {
            state.rate_limiter.record_failure(&done.user, Instant::now());
            continue;
        }

        state.rate_limiter.record_success(&done.user);
        match state.store.users_with_number(&done.document_number).await {
            Ok(users) if users.iter().any(|u| u != &done.user) => {
                tracing::warn!(
                    user = %done.user,
                    others = users.len(),
                    document = %done.document_number.masked(),
                    "document number already verified by another user"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "duplicate lookup failed"),
        }
        match state
            .store
            .insert(&done.user, &done.session_id, &done.document_number, done.score)
            .await
        {
            Ok(id) => tracing::info!(id = %id, user = %done.user, "verified identity stored"),
            Err(e) => tracing::error!(error = %e, user = %done.user, "store insert failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimits;
    use idwallet_core::{
        DetectedFace, DetectorOptions, FaceDetectionProvider, OcrProvider, ProviderError,
        RecognizedText, StageKind, ValidatedNumber,
    };
    use image::RgbImage;
    use std::path::Path;

    struct NoProviders;

    impl ProviderFactory for NoProviders {
        fn create(&self) -> engine::Providers {
            unreachable!("no sessions are started in these tests")
        }
    }

    /// Providers that never see anything; sessions just sit at the first stage.
    struct BlankProviders;

    struct BlankOcr;

    impl OcrProvider for BlankOcr {
        fn process(&mut self, _image: &RgbImage) -> Result<RecognizedText, ProviderError> {
            Ok(RecognizedText::new(String::new()))
        }
    }

    struct NoFaces;

    impl FaceDetectionProvider for NoFaces {
        fn process(
            &mut self,
            _image: &RgbImage,
            _options: &DetectorOptions,
        ) -> Result<Vec<DetectedFace>, ProviderError> {
            Ok(Vec::new())
        }
    }

    impl ProviderFactory for BlankProviders {
        fn create(&self) -> engine::Providers {
            engine::Providers {
                ocr: Box::new(BlankOcr),
                faces: Box::new(NoFaces),
            }
        }
    }

    async fn state() -> (
        Arc<Mutex<AppState>>,
        mpsc::UnboundedSender<CompletedVerification>,
        mpsc::UnboundedReceiver<CompletedVerification>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = VerifiedIdentityStore::open(Path::new(":memory:")).await.unwrap();
        let state = AppState {
            config: Config::from_env(),
            providers: Arc::new(NoProviders),
            sessions: HashMap::new(),
            store,
            rate_limiter: RateLimiter::new(RateLimits {
                max_failures: 2,
                ..RateLimits::default()
            }),
            completions: tx.clone(),
        };
        (Arc::new(Mutex::new(state)), tx, rx)
    }

    fn completed(user: &str, matched: bool) -> CompletedVerification {
        CompletedVerification {
            session_id: "s-1".into(),
            user: user.into(),
            document_number: ValidatedNumber {
                kind: DocumentKind::Aadhaar,
                value: "234567890124".into(),
            },
            score: if matched { 0.92 } else { 0.41 },
            matched,
        }
    }

    #[test]
    fn test_uid_for_root() {
        assert_eq!(uid_for_name("root"), Some(0));
        assert_eq!(uid_for_name("no-such-user-idwallet"), None);
    }

    #[tokio::test]
    async fn test_matches_are_stored() {
        let (state, tx, rx) = state().await;
        tx.send(completed("alice", true)).unwrap();
        drop(tx);
        let shared = state.clone();
        // Drop the sender held by AppState too, so the consumer sees the channel close.
        let (dummy, _) = mpsc::unbounded_channel();
        state.lock().await.completions = dummy;
        record_completions(shared, rx).await;

        let state = state.lock().await;
        let stored = state.store.list_by_user("alice").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].masked_number, "XXXX XXXX 0124");
    }

    #[tokio::test]
    async fn test_mismatches_feed_rate_limiter() {
        let (state, tx, rx) = state().await;
        tx.send(completed("bob", false)).unwrap();
        tx.send(completed("bob", false)).unwrap();
        drop(tx);
        let (dummy, _) = mpsc::unbounded_channel();
        state.lock().await.completions = dummy;
        record_completions(state.clone(), rx).await;

        let mut state = state.lock().await;
        assert_eq!(state.store.count_all().await.unwrap(), 0);
        assert!(state.rate_limiter.check("bob", Instant::now()).is_err());
        assert!(state.rate_limiter.check("alice", Instant::now()).is_ok());
    }

    #[tokio::test]
    async fn test_live_sessions_capped_per_user() {
        let (state, _tx, _rx) = state().await;
        let mut state = state.lock().await;
        state.providers = Arc::new(BlankProviders);
        state.start_session("carol").unwrap();
        state.start_session("carol").unwrap();
        let third = state.start_session("carol");
        assert!(matches!(third, Err(zbus::fdo::Error::LimitsExceeded(_))));
        state.start_session("dave").unwrap();
        assert_eq!(state.sessions.len(), 3);
    }

    #[tokio::test]
    async fn test_locked_user_cannot_reset() {
        let (state, _tx, _rx) = state().await;
        let handle = {
            let mut state = state.lock().await;
            state.providers = Arc::new(BlankProviders);
            let id = state.start_session("erin").unwrap();
            state.sessions[&id].clone()
        };
        restart_session(&state, &handle).await.unwrap();

        {
            let mut state = state.lock().await;
            let now = Instant::now();
            state.rate_limiter.record_failure("erin", now);
            state.rate_limiter.record_failure("erin", now);
            assert!(matches!(
                state.start_session("erin"),
                Err(zbus::fdo::Error::Failed(_))
            ));
        }
        assert!(restart_session(&state, &handle).await.is_err());
        assert_eq!(handle.status().stage, StageKind::AadhaarCard);
        assert!(handle.status().active);
    }
}
