//! `idwallet` — document number checks, offline face comparison and daemon queries.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use idwallet_core::detector::{select_face, to_facial_data};
use idwallet_core::document::{self, ScanOutcome};
use idwallet_core::{
    DetectedFace, DocumentKind, FaceSelection, FacialData, LicenseFormat, SimilarityScorer,
    SimilarityWeights,
};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "idwallet", version, about = "Identity verification tools")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus.
    #[arg(long, global = true)]
    session_bus: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a single document number.
    Check {
        /// aadhaar, pan or driving_license
        kind: DocumentKind,
        number: String,
        /// Require the full printed driving-license format.
        #[arg(long)]
        strict: bool,
    },
    /// Find and validate a document number in OCR text (file or `-` for stdin).
    Extract {
        kind: DocumentKind,
        #[arg(default_value = "-")]
        input: PathBuf,
        #[arg(long)]
        strict: bool,
    },
    /// Score two faces (FacialData JSON or face-detector output) against each other.
    Compare {
        reference: PathBuf,
        candidate: PathBuf,
        /// Composite score at or above which the faces match.
        #[arg(long, default_value_t = 0.85)]
        threshold: f32,
    },
    /// Show daemon status, or one session's status.
    Status {
        #[arg(long)]
        session: Option<String>,
    },
    /// List a user's stored verifications.
    History {
        /// Defaults to $USER.
        user: Option<String>,
    },
    /// Remove a stored verification.
    Remove { id: String, user: Option<String> },
}

#[zbus::proxy(
    interface = "org.idwallet.Verifier1",
    default_service = "org.idwallet.Verifier1",
    default_path = "/org/idwallet/Verifier1"
)]
trait Verifier {
    fn status(&self, session_id: &str) -> zbus::Result<String>;
    fn list_verifications(&self, user: &str) -> zbus::Result<String>;
    fn remove_verification(&self, user: &str, id: &str) -> zbus::Result<bool>;
    fn daemon_status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check {
            kind,
            number,
            strict,
        } => {
            let valid = check_number(kind, &number, license_format(strict));
            println!("{}", if valid { "valid" } else { "invalid" });
            if !valid {
                std::process::exit(1);
            }
        }
        Command::Extract {
            kind,
            input,
            strict,
        } => {
            let text = read_input(&input)?;
            let outcome = document::scan(&text, kind, license_format(strict));
            println!("{}", serde_json::to_string_pretty(&outcome_json(&outcome))?);
            if !matches!(outcome, ScanOutcome::Found(_)) {
                std::process::exit(1);
            }
        }
        Command::Compare {
            reference,
            candidate,
            threshold,
        } => {
            let reference = load_face(&reference)?;
            let candidate = load_face(&candidate)?;
            let report = compare(&reference, &candidate, threshold);
            tracing::debug!(matched = %report["matched"], "faces compared");
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { session } => {
            let proxy = connect(cli.session_bus).await?;
            tracing::debug!(session = ?session, "querying status");
            let json = match session {
                Some(id) => proxy.status(&id).await?,
                None => proxy.daemon_status().await?,
            };
            print_json(&json)?;
        }
        Command::History { user } => {
            let user = user_or_current(user)?;
            let proxy = connect(cli.session_bus).await?;
            print_json(&proxy.list_verifications(&user).await?)?;
        }
        Command::Remove { id, user } => {
            let user = user_or_current(user)?;
            let proxy = connect(cli.session_bus).await?;
            tracing::debug!(user = %user, id = %id, "removing verification");
            if proxy.remove_verification(&user, &id).await? {
                println!("removed {id}");
            } else {
                bail!("no verification {id} for user {user}");
            }
        }
    }
    Ok(())
}

fn license_format(strict: bool) -> LicenseFormat {
    if strict {
        LicenseFormat::Strict
    } else {
        LicenseFormat::Permissive
    }
}

/// Validate one number as printed, ignoring separators.
fn check_number(kind: DocumentKind, number: &str, format: LicenseFormat) -> bool {
    let cleaned: String = number
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_uppercase();
    match kind {
        DocumentKind::Aadhaar => document::is_valid_aadhaar(&cleaned),
        DocumentKind::Pan => document::is_valid_pan(&cleaned),
        DocumentKind::DrivingLicense => document::is_valid_license(&cleaned, format),
    }
}

fn outcome_json(outcome: &ScanOutcome) -> serde_json::Value {
    match outcome {
        ScanOutcome::Found(number) => serde_json::json!({
            "status": "found",
            "kind": number.kind,
            "number": number.value,
            "masked": number.masked(),
        }),
        ScanOutcome::Rejected { candidates } => serde_json::json!({
            "status": "rejected",
            "candidates": candidates,
        }),
        ScanOutcome::Nothing => serde_json::json!({ "status": "nothing" }),
    }
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }
}

/// Either a single face or the raw array a detection command prints.
#[derive(Deserialize)]
#[serde(untagged)]
enum FaceInput {
    Detected(Vec<DetectedFace>),
    Facial(Box<FacialData>),
}

fn parse_face(json: &str) -> Result<FacialData> {
    match serde_json::from_str::<FaceInput>(json).context("not a face or face list")? {
        FaceInput::Facial(face) => Ok(*face),
        FaceInput::Detected(faces) => {
            let face = select_face(&faces, FaceSelection::Largest)?;
            Ok(to_facial_data(face))
        }
    }
}

fn load_face(path: &Path) -> Result<FacialData> {
    parse_face(&read_input(path)?).with_context(|| format!("invalid face in {}", path.display()))
}

fn compare(reference: &FacialData, candidate: &FacialData, threshold: f32) -> serde_json::Value {
    let scorer = SimilarityScorer::new(SimilarityWeights::default());
    let breakdown = scorer.breakdown(reference, candidate);
    let matched = breakdown
        .overall
        .is_some_and(|s| s.is_finite() && s >= threshold);
    serde_json::json!({
        "breakdown": breakdown,
        "threshold": threshold,
        "matched": matched,
    })
}

async fn connect(session_bus: bool) -> Result<VerifierProxy<'static>> {
    tracing::debug!(
        bus = if session_bus { "session" } else { "system" },
        "connecting to idwalletd"
    );
    let conn = if session_bus {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    VerifierProxy::new(&conn)
        .await
        .context("idwalletd is not reachable")
}

fn user_or_current(user: Option<String>) -> Result<String> {
    match user {
        Some(u) => Ok(u),
        None => std::env::var("USER").context("no user given and $USER is unset"),
    }
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_number_ignores_separators() {
        assert!(check_number(DocumentKind::Aadhaar, "2345 6789 0124", LicenseFormat::Permissive));
        assert!(check_number(DocumentKind::Aadhaar, "2345-6789-0124", LicenseFormat::Permissive));
        assert!(!check_number(DocumentKind::Aadhaar, "2345 6789 0125", LicenseFormat::Permissive));
        assert!(check_number(DocumentKind::Pan, "abcpe1234f", LicenseFormat::Permissive));
        assert!(check_number(DocumentKind::DrivingLicense, "MH12 20110062821", LicenseFormat::Strict));
        assert!(!check_number(DocumentKind::DrivingLicense, "MH12 345", LicenseFormat::Strict));
    }

    #[test]
    fn test_outcome_json() {
        let found = document::scan("ID 2345 6789 0124", DocumentKind::Aadhaar, LicenseFormat::Permissive);
        let json = outcome_json(&found);
        assert_eq!(json["status"], "found");
        assert_eq!(json["masked"], "XXXX XXXX 0124");

        let rejected = outcome_json(&ScanOutcome::Rejected { candidates: 2 });
        assert_eq!(rejected["candidates"], 2);
    }

    fn face_json(shift: f32) -> String {
        format!(
            r#"{{"bounding_box":{{"x":{x},"y":80,"width":200,"height":260}},
               "landmarks":{{"left_eye":{{"x":{le},"y":170}},"right_eye":{{"x":{re},"y":172}},
                             "nose_base":{{"x":{nb},"y":230}},"mouth_left":{{"x":{ml},"y":275}},
                             "mouth_right":{{"x":{mr},"y":276}}}}}}"#,
            x = 100.0 + shift,
            le = 160.0 + shift,
            re = 240.0 + shift,
            nb = 200.0 + shift,
            ml = 170.0 + shift,
            mr = 230.0 + shift,
        )
    }

    #[test]
    fn test_parse_face_accepts_both_forms() {
        let single = parse_face(&face_json(0.0)).unwrap();
        assert_eq!(single.landmarks.len(), 5);

        let list = r#"[
            {"bounding_box":{"x":0,"y":0,"width":10,"height":10}},
            {"bounding_box":{"x":0,"y":0,"width":50,"height":50},"landmarks":[["left_eye",{"x":1,"y":2}]]}
        ]"#;
        let largest = parse_face(list).unwrap();
        assert_eq!(largest.bounding_box.width, 50.0);
        assert_eq!(largest.landmarks.len(), 1);

        assert!(parse_face("[]").is_err());
        assert!(parse_face("\"nope\"").is_err());
    }

    #[test]
    fn test_compare_translated_face_matches() {
        let a = parse_face(&face_json(0.0)).unwrap();
        let b = parse_face(&face_json(25.0)).unwrap();
        let report = compare(&a, &b, 0.85);
        assert_eq!(report["matched"], true);
        assert_eq!(report["threshold"], 0.85f32 as f64);
    }
}
