use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use idwallet_core::{DocumentKind, ValidatedNumber};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("document number encryption failed")]
    EncryptionFailed,
    #[error("document number decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid document number blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("stored document record is corrupt: {0}")]
    Corrupt(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed record of completed, matching verifications.
///
/// Document numbers are AES-256-GCM encrypted at rest. Each row also keeps a
/// keyed SHA-256 digest of the number so duplicates can be found without
/// decrypting every row. A per-installation 32-byte key is generated at first
/// use and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct VerifiedIdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl VerifiedIdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/idwallet"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS verifications (
                     id TEXT PRIMARY KEY,
                     user TEXT NOT NULL,
                     session_id TEXT NOT NULL,
                     document_kind TEXT NOT NULL,
                     number_digest TEXT NOT NULL,
                     number_blob BLOB NOT NULL,
                     match_score REAL NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_verifications_user ON verifications(user);
                 CREATE INDEX IF NOT EXISTS idx_verifications_digest ON verifications(number_digest);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Record a matching verification. Returns the generated UUID.
    pub async fn insert(
        &self,
        user: &str,
        session_id: &str,
        number: &ValidatedNumber,
        match_score: f32,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let digest = self.number_digest(number);
        let blob = self.encrypt(number.value.as_bytes())?;

        let id_clone = id.clone();
        let user = user.to_string();
        let session_id = session_id.to_string();
        let kind = number.kind.as_str();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO verifications (id, user, session_id, document_kind, number_digest, number_blob, match_score, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![id_clone, user, session_id, kind, digest, blob, match_score, created_at],
                )?;
                Ok(())
            })
            .await?;

        Ok(id)
    }

    /// List a user's verifications with masked document numbers.
    pub async fn list_by_user(&self, user: &str) -> Result<Vec<VerificationInfo>, StoreError> {
        let user = user.to_string();

        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<(String, String, Vec<u8>, f64, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, document_kind, number_blob, match_score, created_at
                     FROM verifications WHERE user = ?1 ORDER BY created_at",
                )?;
                let rows = stmt.query_map([&user], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, kind, blob, match_score, created_at) in rows {
            let number = self.decrypt_number(&kind, &blob)?;
            out.push(VerificationInfo {
                id,
                document_kind: number.kind,
                masked_number: number.masked(),
                match_score,
                created_at,
            });
        }
        Ok(out)
    }

    /// Users who have verified this exact document number.
    pub async fn users_with_number(&self, number: &ValidatedNumber) -> Result<Vec<String>, StoreError> {
        let digest = self.number_digest(number);
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT user FROM verifications WHERE number_digest = ?1 ORDER BY user",
                )?;
                let rows = stmt.query_map([&digest], |row| row.get::<_, String>(0))?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove a verification by ID, scoped to a user for cross-user protection.
    pub async fn remove(&self, user: &str, id: &str) -> Result<bool, StoreError> {
        let user = user.to_string();
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM verifications WHERE id = ?1 AND user = ?2",
                    [&id, &user],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count stored verifications across all users.
    pub async fn count_all(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM verifications", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Keyed digest: SHA-256 over the installation key, kind and number.
    fn number_digest(&self, number: &ValidatedNumber) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.enc_key);
        hasher.update(number.kind.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(number.value.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Encrypt with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)
    }

    fn decrypt_number(&self, kind: &str, blob: &[u8]) -> Result<ValidatedNumber, StoreError> {
        let kind: DocumentKind = kind
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("unknown document kind '{kind}'")))?;
        let value = String::from_utf8(self.decrypt(blob)?)
            .map_err(|_| StoreError::Corrupt("document number is not UTF-8".into()))?;
        Ok(ValidatedNumber { kind, value })
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

/// A stored verification as shown to clients (number masked).
#[derive(Debug, Clone, serde::Serialize)]
pub struct VerificationInfo {
    pub id: String,
    pub document_kind: DocumentKind,
    pub masked_number: String,
    pub match_score: f64,
    pub created_at: String,
}
