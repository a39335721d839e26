use std::path::PathBuf;
use std::time::Duration;

use idwallet_core::{LicenseFormat, SessionConfig, SimilarityWeights};

use crate::rate_limiter::RateLimits;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Path to the SQLite database of verified identities.
    pub db_path: PathBuf,
    /// OCR command line; receives a PNG on stdin, prints text on stdout.
    pub ocr_command: String,
    /// Face detection command line; receives a PNG on stdin, prints a JSON
    /// array of detected faces on stdout.
    pub face_command: String,
    /// Seconds a stage may run without advancing before the attempt restarts.
    pub stage_timeout_secs: u64,
    /// Seconds before an unanswered liveness challenge is replaced.
    pub challenge_timeout_secs: u64,
    /// Composite similarity at or above which the selfie matches the document.
    pub match_threshold: f32,
    pub weights: SimilarityWeights,
    /// Selfie face center tolerance as a fraction of frame width.
    pub center_tolerance: f32,
    /// Minimum selfie face width as a fraction of the shorter frame side.
    pub min_face_fraction: f32,
    /// Minimum mean luma (0–255) of selfie frames. 0 disables the check.
    pub min_luminance: f32,
    /// Whether the passive landmark-stability check runs after a challenge passes.
    pub passive_liveness: bool,
    /// Minimum mean eye displacement (pixels) for the passive check.
    pub min_eye_displacement: f32,
    /// Require the full 16-character printed driving-license format.
    pub strict_license: bool,
    /// Failed matches per user before lockout.
    pub max_failures: u32,
    pub failure_window_secs: u64,
    pub lockout_secs: u64,
    /// Seconds without any client input before a session is ended.
    pub session_idle_secs: u64,
    /// Live sessions one user may hold at once.
    pub max_sessions_per_user: usize,
    /// Whether the daemon is running on the session bus (development mode).
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `IDWALLET_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("idwallet");

        let db_path = std::env::var("IDWALLET_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("verifications.db"));

        let defaults = SimilarityWeights::default();

        Self {
            db_path,
            ocr_command: std::env::var("IDWALLET_OCR_COMMAND")
                .unwrap_or_else(|_| "tesseract stdin stdout".to_string()),
            face_command: std::env::var("IDWALLET_FACE_COMMAND")
                .unwrap_or_else(|_| "idwallet-face-detect".to_string()),
            stage_timeout_secs: env_u64("IDWALLET_STAGE_TIMEOUT_SECS", 30),
            challenge_timeout_secs: env_u64("IDWALLET_CHALLENGE_TIMEOUT_SECS", 10),
            match_threshold: env_f32("IDWALLET_MATCH_THRESHOLD", 0.85),
            weights: SimilarityWeights {
                landmark: env_f32("IDWALLET_WEIGHT_LANDMARK", defaults.landmark),
                contour: env_f32("IDWALLET_WEIGHT_CONTOUR", defaults.contour),
                proportion: env_f32("IDWALLET_WEIGHT_PROPORTION", defaults.proportion),
                orientation: env_f32("IDWALLET_WEIGHT_ORIENTATION", defaults.orientation),
            },
            center_tolerance: env_f32("IDWALLET_CENTER_TOLERANCE", 0.15),
            min_face_fraction: env_f32("IDWALLET_MIN_FACE_FRACTION", 0.30),
            min_luminance: env_f32("IDWALLET_MIN_LUMINANCE", 40.0),
            passive_liveness: env_flag("IDWALLET_PASSIVE_LIVENESS", true),
            min_eye_displacement: env_f32("IDWALLET_MIN_EYE_DISPLACEMENT", 0.8),
            strict_license: env_flag("IDWALLET_STRICT_LICENSE", false),
            max_failures: env_u32("IDWALLET_MAX_FAILURES", 5),
            failure_window_secs: env_u64("IDWALLET_FAILURE_WINDOW_SECS", 60),
            lockout_secs: env_u64("IDWALLET_LOCKOUT_SECS", 300),
            session_idle_secs: env_u64("IDWALLET_SESSION_IDLE_SECS", 120),
            max_sessions_per_user: env_u32("IDWALLET_MAX_SESSIONS_PER_USER", 2) as usize,
            session_bus: std::env::var("IDWALLET_SESSION_BUS").is_ok(),
        }
    }

    /// State-machine policy derived from this configuration.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            stage_timeout: Duration::from_secs(self.stage_timeout_secs),
            challenge_timeout: Duration::from_secs(self.challenge_timeout_secs),
            match_threshold: self.match_threshold,
            weights: self.weights,
            center_tolerance: self.center_tolerance,
            min_face_fraction: self.min_face_fraction,
            min_luminance: self.min_luminance,
            passive_liveness: self.passive_liveness,
            min_eye_displacement: self.min_eye_displacement,
        }
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits {
            max_failures: self.max_failures,
            window: Duration::from_secs(self.failure_window_secs),
            lockout: Duration::from_secs(self.lockout_secs),
        }
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn license_format(&self) -> LicenseFormat {
        if self.strict_license {
            LicenseFormat::Strict
        } else {
            LicenseFormat::Permissive
        }
    }
}

/// Non-finite or negative values fall back to `default`.
fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
