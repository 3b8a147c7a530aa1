///! Node enrollment and tunnel trust fabric
///!
///! Pairing-code issuance, challenge-response verification, administrator
///! approval, authorized-key lifecycle and revocation. Status advances
///! monotonically: issued -> pending_verification -> awaiting_approval ->
///! approved | rejected; revocation of the resulting connection is terminal.
///! Every transition lands in the enrollment audit trail.

use crate::db;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skybridge_common::Result;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Confusable-free pairing alphabet: I, O, U, L, 0 and 1 are omitted
const PAIRING_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTVWXYZ23456789";
const PAIRING_CODE_CHARS: usize = 12;
const CHALLENGE_NONCE_BYTES: usize = 32;

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollRequest {
    pub pairing_code: String,
    pub node_public_key: String,
    pub node_name: String,
    #[serde(default)]
    pub node_version: Option<String>,
    pub node_fingerprint: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollResponse {
    pub enrollment_id: String,
    pub challenge_nonce: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyRequest {
    pub enrollment_id: String,
    /// Base64 Ed25519 signature over the ASCII challenge nonce
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveRequest {
    pub approved_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairingCodeResponse {
    pub pairing_code: String,
    pub expires_at: i64,
}

/// Generate a grouped pairing code: `XXXX-XXXX-XXXX`
pub fn generate_pairing_code() -> String {
    let mut rng = rand::thread_rng();
    let chars: Vec<u8> = (0..PAIRING_CODE_CHARS)
        .map(|_| PAIRING_ALPHABET[rng.gen_range(0..PAIRING_ALPHABET.len())])
        .collect();

    chars
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Constant-time pairing code comparison
fn codes_match(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Shape check applied before any database work
fn is_valid_code_format(code: &str) -> bool {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    PATTERN
        .get_or_init(|| {
            regex::Regex::new(r"^[A-HJ-KM-NP-TV-Z2-9]{4}-[A-HJ-KM-NP-TV-Z2-9]{4}-[A-HJ-KM-NP-TV-Z2-9]{4}$")
                .expect("pairing code pattern is valid")
        })
        .is_match(code)
}

/// Parse an OpenSSH `ssh-ed25519 AAAA... comment` public key line into the
/// raw verifying key.
pub fn parse_ssh_ed25519(public_key: &str) -> Result<VerifyingKey> {
    let mut parts = public_key.split_whitespace();
    let key_type = parts.next().unwrap_or_default();
    if key_type != "ssh-ed25519" {
        return Err(skybridge_common::Error::InvalidRequest(format!(
            "unsupported key type '{}', expected ssh-ed25519",
            key_type
        )));
    }

    let blob_b64 = parts.next().ok_or_else(|| {
        skybridge_common::Error::InvalidRequest("public key line has no key blob".to_string())
    })?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64)
        .map_err(|e| {
            skybridge_common::Error::InvalidRequest(format!("key blob is not base64: {}", e))
        })?;

    // Wire format: length-prefixed "ssh-ed25519", then the 32-byte key
    let mut offset = 0usize;
    let mut read_chunk = |blob: &[u8]| -> Result<Vec<u8>> {
        if offset + 4 > blob.len() {
            return Err(skybridge_common::Error::InvalidRequest(
                "truncated ssh key blob".to_string(),
            ));
        }
        let len =
            u32::from_be_bytes([blob[offset], blob[offset + 1], blob[offset + 2], blob[offset + 3]])
                as usize;
        offset += 4;
        if offset + len > blob.len() {
            return Err(skybridge_common::Error::InvalidRequest(
                "truncated ssh key blob".to_string(),
            ));
        }
        let chunk = blob[offset..offset + len].to_vec();
        offset += len;
        Ok(chunk)
    };

    let algo = read_chunk(&blob)?;
    if algo != b"ssh-ed25519" {
        return Err(skybridge_common::Error::InvalidRequest(
            "key blob does not carry an ed25519 key".to_string(),
        ));
    }

    let key_bytes = read_chunk(&blob)?;
    let key_array: [u8; 32] = key_bytes.try_into().map_err(|_| {
        skybridge_common::Error::InvalidRequest("ed25519 key must be 32 bytes".to_string())
    })?;

    VerifyingKey::from_bytes(&key_array).map_err(|e| {
        skybridge_common::Error::InvalidRequest(format!("invalid ed25519 key: {}", e))
    })
}

/// OpenSSH-style fingerprint: `SHA256:` + unpadded base64 of the blob hash
pub fn fingerprint_of(public_key: &str) -> Result<String> {
    let blob_b64 = public_key.split_whitespace().nth(1).ok_or_else(|| {
        skybridge_common::Error::InvalidRequest("public key line has no key blob".to_string())
    })?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64)
        .map_err(|e| {
            skybridge_common::Error::InvalidRequest(format!("key blob is not base64: {}", e))
        })?;

    let digest = Sha256::digest(&blob);
    Ok(format!(
        "SHA256:{}",
        base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
    ))
}

/// Authorized-keys entry for an approved node: restricted to tunnel use
fn authorized_keys_line(public_key: &str, node_name: &str) -> String {
    format!(
        "restrict,port-forwarding {} skybridge-node-{}",
        public_key.trim(),
        node_name
    )
}

pub struct EnrollmentManager {
    pool: SqlitePool,
    authorized_keys_path: PathBuf,
    pairing_ttl_secs: u64,
    /// Serializes every authorized_keys rewrite
    key_file_lock: Arc<Mutex<()>>,
}

impl EnrollmentManager {
    pub fn new(pool: SqlitePool, authorized_keys_path: PathBuf, pairing_ttl_secs: u64) -> Self {
        Self {
            pool,
            authorized_keys_path,
            pairing_ttl_secs,
            key_file_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Operator step: mint a single-use pairing code
    pub async fn issue_pairing_code(&self, actor: Option<&str>) -> Result<PairingCodeResponse> {
        let pairing_code = generate_pairing_code();
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + self.pairing_ttl_secs as i64;

        let enrollment = db::enrollments::EnrollmentRecord {
            id: format!("enr-{}", uuid::Uuid::new_v4()),
            pairing_code: pairing_code.clone(),
            node_name: None,
            node_version: None,
            node_public_key: None,
            node_fingerprint: None,
            challenge_nonce: None,
            status: "issued".to_string(),
            expires_at,
            approved_by: None,
            approved_at: None,
            created_at: now,
            updated_at: now,
        };
        db::enrollments::insert(&self.pool, &enrollment).await?;
        db::enrollments::audit(
            &self.pool,
            "pairing_code_issued",
            Some(&enrollment.id),
            None,
            actor,
            None,
        )
        .await?;

        info!("Issued pairing code (enrollment {})", enrollment.id);
        Ok(PairingCodeResponse {
            pairing_code,
            expires_at,
        })
    }

    /// Node step: redeem a pairing code and receive a challenge
    pub async fn enroll(&self, request: EnrollRequest) -> Result<EnrollResponse> {
        if !is_valid_code_format(&request.pairing_code) {
            return Err(skybridge_common::Error::InvalidRequest(
                "malformed pairing code".to_string(),
            ));
        }

        // Key must parse and match the claimed fingerprint before anything
        // is stored
        parse_ssh_ed25519(&request.node_public_key)?;
        let computed = fingerprint_of(&request.node_public_key)?;
        if computed != request.node_fingerprint {
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "fingerprint mismatch: computed {}",
                computed
            )));
        }

        let candidates =
            db::enrollments::find_issued_by_code(&self.pool, &request.pairing_code).await?;
        let now = chrono::Utc::now().timestamp();

        let mut matched = None;
        for candidate in candidates {
            if codes_match(&candidate.pairing_code, &request.pairing_code) {
                matched = Some(candidate);
                break;
            }
        }

        let mut enrollment = matched.ok_or_else(|| {
            skybridge_common::Error::InvalidRequest("unknown or used pairing code".to_string())
        })?;

        if enrollment.expires_at < now {
            db::enrollments::audit(
                &self.pool,
                "enroll_rejected_expired",
                Some(&enrollment.id),
                Some(&request.node_fingerprint),
                None,
                None,
            )
            .await?;
            return Err(skybridge_common::Error::InvalidRequest(
                "pairing code expired".to_string(),
            ));
        }

        let mut nonce = [0u8; CHALLENGE_NONCE_BYTES];
        rand::thread_rng().fill(&mut nonce);
        let challenge_nonce = hex::encode(nonce);

        // Single-use: the code leaves the issued state here
        enrollment.node_name = Some(request.node_name.clone());
        enrollment.node_version = request.node_version.clone();
        enrollment.node_public_key = Some(request.node_public_key.clone());
        enrollment.node_fingerprint = Some(request.node_fingerprint.clone());
        enrollment.challenge_nonce = Some(challenge_nonce.clone());
        enrollment.status = "pending_verification".to_string();
        db::enrollments::update_enrollment(&self.pool, &enrollment).await?;

        db::enrollments::audit(
            &self.pool,
            "node_enrolled",
            Some(&enrollment.id),
            Some(&request.node_fingerprint),
            None,
            Some(&format!("node '{}'", request.node_name)),
        )
        .await?;

        Ok(EnrollResponse {
            enrollment_id: enrollment.id,
            challenge_nonce,
        })
    }

    /// Node step: prove possession of the private key
    pub async fn verify(&self, request: VerifyRequest) -> Result<()> {
        let mut enrollment = db::enrollments::get(&self.pool, &request.enrollment_id).await?;

        if enrollment.status != "pending_verification" {
            return Err(skybridge_common::Error::Conflict(format!(
                "enrollment '{}' is {}, expected pending_verification",
                enrollment.id, enrollment.status
            )));
        }

        let public_key = enrollment.node_public_key.clone().ok_or_else(|| {
            skybridge_common::Error::System("enrollment without public key".to_string())
        })?;
        let nonce = enrollment.challenge_nonce.clone().ok_or_else(|| {
            skybridge_common::Error::System("enrollment without challenge".to_string())
        })?;

        let verifying_key = parse_ssh_ed25519(&public_key)?;
        let signature_bytes = base64::engine::general_purpose::STANDARD
            .decode(&request.signature)
            .map_err(|e| {
                skybridge_common::Error::InvalidRequest(format!(
                    "signature is not base64: {}",
                    e
                ))
            })?;
        let signature = Signature::from_slice(&signature_bytes).map_err(|e| {
            skybridge_common::Error::InvalidRequest(format!("malformed signature: {}", e))
        })?;

        if let Err(e) = verifying_key.verify(nonce.as_bytes(), &signature) {
            db::enrollments::audit(
                &self.pool,
                "verification_failed",
                Some(&enrollment.id),
                enrollment.node_fingerprint.as_deref(),
                None,
                None,
            )
            .await?;
            return Err(skybridge_common::Error::InvalidRequest(format!(
                "challenge signature rejected: {}",
                e
            )));
        }

        enrollment.status = "awaiting_approval".to_string();
        db::enrollments::update_enrollment(&self.pool, &enrollment).await?;
        db::enrollments::audit(
            &self.pool,
            "node_verified",
            Some(&enrollment.id),
            enrollment.node_fingerprint.as_deref(),
            None,
            None,
        )
        .await?;

        info!("Enrollment {} verified, awaiting approval", enrollment.id);
        Ok(())
    }

    /// Administrator step: install the key and open the connection
    pub async fn approve(
        &self,
        enrollment_id: &str,
        request: ApproveRequest,
    ) -> Result<db::enrollments::ConnectionRecord> {
        let mut enrollment = db::enrollments::get(&self.pool, enrollment_id).await?;

        if enrollment.status != "awaiting_approval" {
            return Err(skybridge_common::Error::Conflict(format!(
                "enrollment '{}' is {}, expected awaiting_approval",
                enrollment.id, enrollment.status
            )));
        }

        let public_key = enrollment.node_public_key.clone().ok_or_else(|| {
            skybridge_common::Error::System("enrollment without public key".to_string())
        })?;
        let fingerprint = enrollment.node_fingerprint.clone().ok_or_else(|| {
            skybridge_common::Error::System("enrollment without fingerprint".to_string())
        })?;
        let node_name = enrollment.node_name.clone().unwrap_or_default();

        self.install_authorized_key(&public_key, &node_name).await?;

        let now = chrono::Utc::now().timestamp();
        enrollment.status = "approved".to_string();
        enrollment.approved_by = Some(request.approved_by.clone());
        enrollment.approved_at = Some(now);
        db::enrollments::update_enrollment(&self.pool, &enrollment).await?;

        let connection = db::enrollments::ConnectionRecord {
            id: format!("conn-{}", uuid::Uuid::new_v4()),
            enrollment_id: enrollment.id.clone(),
            node_name,
            node_fingerprint: fingerprint.clone(),
            status: "connected".to_string(),
            connected_at: now,
            revoked_at: None,
        };
        db::enrollments::insert_connection(&self.pool, &connection).await?;

        db::enrollments::audit(
            &self.pool,
            "node_approved",
            Some(&enrollment.id),
            Some(&fingerprint),
            Some(&request.approved_by),
            None,
        )
        .await?;

        info!(
            "Enrollment {} approved by {}",
            enrollment.id, request.approved_by
        );
        Ok(connection)
    }

    /// Administrator step: reject a pending enrollment
    pub async fn reject(&self, enrollment_id: &str, actor: &str) -> Result<()> {
        let mut enrollment = db::enrollments::get(&self.pool, enrollment_id).await?;

        match enrollment.status.as_str() {
            "pending_verification" | "awaiting_approval" => {}
            other => {
                return Err(skybridge_common::Error::Conflict(format!(
                    "enrollment '{}' is {}, cannot reject",
                    enrollment.id, other
                )))
            }
        }

        enrollment.status = "rejected".to_string();
        db::enrollments::update_enrollment(&self.pool, &enrollment).await?;
        db::enrollments::audit(
            &self.pool,
            "node_rejected",
            Some(&enrollment.id),
            enrollment.node_fingerprint.as_deref(),
            Some(actor),
            None,
        )
        .await?;

        Ok(())
    }

    /// Remove the node's key and close the connection. Idempotent: revoking
    /// an already-revoked connection is a no-op success.
    pub async fn revoke(&self, connection_id: &str, actor: &str) -> Result<()> {
        let connection = db::enrollments::get_connection(&self.pool, connection_id).await?;

        if connection.status == "revoked" {
            return Ok(());
        }

        self.remove_authorized_key(&connection.node_fingerprint).await?;
        db::enrollments::revoke_connection(&self.pool, connection_id).await?;
        db::enrollments::audit(
            &self.pool,
            "connection_revoked",
            Some(&connection.enrollment_id),
            Some(&connection.node_fingerprint),
            Some(actor),
            None,
        )
        .await?;

        info!("Connection {} revoked by {}", connection_id, actor);
        Ok(())
    }

    pub async fn list_enrollments(&self) -> Result<Vec<db::enrollments::EnrollmentRecord>> {
        db::enrollments::list(&self.pool).await
    }

    pub async fn list_connections(&self) -> Result<Vec<db::enrollments::ConnectionRecord>> {
        db::enrollments::list_connections(&self.pool).await
    }

    pub async fn audit_log(
        &self,
        event_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<db::enrollments::AuditRecord>> {
        db::enrollments::query_audit(&self.pool, event_type, limit).await
    }

    /// Append the node's key; the rewrite is atomic and serialized
    async fn install_authorized_key(&self, public_key: &str, node_name: &str) -> Result<()> {
        let _guard = self.key_file_lock.lock().await;

        let existing = tokio::fs::read_to_string(&self.authorized_keys_path)
            .await
            .unwrap_or_default();

        let fingerprint = fingerprint_of(public_key)?;
        for line in existing.lines() {
            if line_fingerprint(line).as_deref() == Some(fingerprint.as_str()) {
                // Already installed from a previous approval
                return Ok(());
            }
        }

        let mut content = existing;
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&authorized_keys_line(public_key, node_name));
        content.push('\n');

        self.write_key_file(&content).await
    }

    /// Drop every line whose key matches the recorded fingerprint exactly
    async fn remove_authorized_key(&self, fingerprint: &str) -> Result<()> {
        let _guard = self.key_file_lock.lock().await;

        let existing = match tokio::fs::read_to_string(&self.authorized_keys_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let kept: Vec<&str> = existing
            .lines()
            .filter(|line| line_fingerprint(line).as_deref() != Some(fingerprint))
            .collect();

        if kept.len() == existing.lines().count() {
            warn!("No authorized_keys entry matched fingerprint {}", fingerprint);
            return Ok(());
        }

        let mut content = kept.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        self.write_key_file(&content).await
    }

    /// Rewrite the key file under an exclusive OS-level lock, then swap it
    /// in atomically. The in-process mutex already serializes this hub; the
    /// flock guards against any other writer on the appliance.
    async fn write_key_file(&self, content: &str) -> Result<()> {
        if let Some(dir) = self.authorized_keys_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let lock_path = self.authorized_keys_path.with_extension("lock");
        let target = self.authorized_keys_path.clone();
        let content = content.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            let _lock = nix::fcntl::Flock::lock(lock_file, nix::fcntl::FlockArg::LockExclusive)
                .map_err(|(_, errno)| {
                    skybridge_common::Error::System(format!(
                        "failed to lock {}: {}",
                        lock_path.display(),
                        errno
                    ))
                })?;

            let tmp_path = target.with_extension("tmp");
            std::fs::write(&tmp_path, &content)?;
            std::fs::rename(&tmp_path, &target)?;
            Ok(())
        })
        .await
        .map_err(|e| skybridge_common::Error::System(format!("key file task failed: {}", e)))?
    }
}

/// Fingerprint of the key on an authorized_keys line, tolerating an options
/// prefix.
fn line_fingerprint(line: &str) -> Option<String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    for window in parts.windows(2) {
        if window[0].starts_with("ssh-") {
            let key_line = format!("{} {}", window[0], window[1]);
            if let Ok(fp) = fingerprint_of(&key_line) {
                return Some(fp);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    /// Render a dalek verifying key as an OpenSSH public key line
    fn ssh_public_key(key: &VerifyingKey, comment: &str) -> String {
        let mut blob = Vec::new();
        blob.extend_from_slice(&(11u32).to_be_bytes());
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&(32u32).to_be_bytes());
        blob.extend_from_slice(key.as_bytes());

        format!(
            "ssh-ed25519 {} {}",
            base64::engine::general_purpose::STANDARD.encode(&blob),
            comment
        )
    }

    async fn manager() -> (crate::db::Database, EnrollmentManager, tempfile::TempDir) {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let manager = EnrollmentManager::new(
            db.pool().clone(),
            tmp.path().join("authorized_keys"),
            600,
        );
        (db, manager, tmp)
    }

    #[test]
    fn test_pairing_code_shape() {
        for _ in 0..50 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), 14);
            let groups: Vec<&str> = code.split('-').collect();
            assert_eq!(groups.len(), 3);
            for group in groups {
                assert_eq!(group.len(), 4);
                for c in group.bytes() {
                    assert!(PAIRING_ALPHABET.contains(&c), "confusable char in {}", code);
                    assert!(!b"IOUL01".contains(&c));
                }
            }
        }
    }

    #[test]
    fn test_generated_codes_pass_the_shape_check() {
        for _ in 0..20 {
            assert!(is_valid_code_format(&generate_pairing_code()));
        }
        assert!(is_valid_code_format("AX7K-PJ3F-TH2Q"));
        assert!(!is_valid_code_format("AXIK-PJ3F-TH2Q")); // I is confusable
        assert!(!is_valid_code_format("AX7KPJ3FTH2Q"));
        assert!(!is_valid_code_format("ax7k-pj3f-th2q"));
    }

    #[test]
    fn test_ssh_key_parse_round_trip() {
        let signing = SigningKey::generate(&mut OsRng);
        let line = ssh_public_key(&signing.verifying_key(), "node@site-a");

        let parsed = parse_ssh_ed25519(&line).unwrap();
        assert_eq!(parsed.as_bytes(), signing.verifying_key().as_bytes());

        assert!(parse_ssh_ed25519("ssh-rsa AAAA node").is_err());
        assert!(parse_ssh_ed25519("ssh-ed25519 !!!notbase64").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let signing = SigningKey::generate(&mut OsRng);
        let line = ssh_public_key(&signing.verifying_key(), "a");
        let line_other_comment = ssh_public_key(&signing.verifying_key(), "b");

        let fp = fingerprint_of(&line).unwrap();
        assert!(fp.starts_with("SHA256:"));
        // The comment does not influence the fingerprint
        assert_eq!(fp, fingerprint_of(&line_other_comment).unwrap());
    }

    #[tokio::test]
    async fn test_happy_path_enrollment() {
        let (_db, manager, tmp) = manager().await;

        let signing = SigningKey::generate(&mut OsRng);
        let public_key = ssh_public_key(&signing.verifying_key(), "node@site-a");
        let fingerprint = fingerprint_of(&public_key).unwrap();

        // Operator issues a pairing code
        let issued = manager.issue_pairing_code(Some("admin")).await.unwrap();
        assert!(issued.expires_at > chrono::Utc::now().timestamp());

        // Node enrolls with the code and receives a 32-byte hex challenge
        let enrolled = manager
            .enroll(EnrollRequest {
                pairing_code: issued.pairing_code.clone(),
                node_public_key: public_key.clone(),
                node_name: "site-a".to_string(),
                node_version: Some("1.4.2".to_string()),
                node_fingerprint: fingerprint.clone(),
            })
            .await
            .unwrap();
        assert_eq!(enrolled.challenge_nonce.len(), 64);
        assert!(hex::decode(&enrolled.challenge_nonce).is_ok());

        // Node signs the challenge
        let signature = signing.sign(enrolled.challenge_nonce.as_bytes());
        manager
            .verify(VerifyRequest {
                enrollment_id: enrolled.enrollment_id.clone(),
                signature: base64::engine::general_purpose::STANDARD.encode(signature.to_bytes()),
            })
            .await
            .unwrap();

        // Operator approves; the key lands in authorized_keys
        let connection = manager
            .approve(
                &enrolled.enrollment_id,
                ApproveRequest {
                    approved_by: "admin".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(connection.status, "connected");
        assert_eq!(connection.node_fingerprint, fingerprint);

        let keys = tokio::fs::read_to_string(tmp.path().join("authorized_keys"))
            .await
            .unwrap();
        assert!(keys.contains("ssh-ed25519"));
        assert!(keys.contains("restrict"));
        assert!(keys.contains("skybridge-node-site-a"));

        // Audit trail covers every transition
        let audit = manager.audit_log(None, 50).await.unwrap();
        let events: Vec<&str> = audit.iter().map(|a| a.event_type.as_str()).collect();
        assert!(events.contains(&"pairing_code_issued"));
        assert!(events.contains(&"node_enrolled"));
        assert!(events.contains(&"node_verified"));
        assert!(events.contains(&"node_approved"));
    }

    #[tokio::test]
    async fn test_pairing_code_is_single_use() {
        let (_db, manager, _tmp) = manager().await;

        let signing = SigningKey::generate(&mut OsRng);
        let public_key = ssh_public_key(&signing.verifying_key(), "node");
        let fingerprint = fingerprint_of(&public_key).unwrap();

        let issued = manager.issue_pairing_code(None).await.unwrap();
        let request = EnrollRequest {
            pairing_code: issued.pairing_code,
            node_public_key: public_key,
            node_name: "site-a".to_string(),
            node_version: None,
            node_fingerprint: fingerprint,
        };

        manager.enroll(request.clone()).await.unwrap();
        match manager.enroll(request).await {
            Err(skybridge_common::Error::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_wrong_signature_is_rejected() {
        let (_db, manager, _tmp) = manager().await;

        let signing = SigningKey::generate(&mut OsRng);
        let impostor = SigningKey::generate(&mut OsRng);
        let public_key = ssh_public_key(&signing.verifying_key(), "node");
        let fingerprint = fingerprint_of(&public_key).unwrap();

        let issued = manager.issue_pairing_code(None).await.unwrap();
        let enrolled = manager
            .enroll(EnrollRequest {
                pairing_code: issued.pairing_code,
                node_public_key: public_key,
                node_name: "site-a".to_string(),
                node_version: None,
                node_fingerprint: fingerprint,
            })
            .await
            .unwrap();

        let forged = impostor.sign(enrolled.challenge_nonce.as_bytes());
        let result = manager
            .verify(VerifyRequest {
                enrollment_id: enrolled.enrollment_id.clone(),
                signature: base64::engine::general_purpose::STANDARD.encode(forged.to_bytes()),
            })
            .await;
        match result {
            Err(skybridge_common::Error::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }

        // The enrollment did not advance
        let enrollments = manager.list_enrollments().await.unwrap();
        assert_eq!(enrollments[0].status, "pending_verification");
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_is_rejected() {
        let (_db, manager, _tmp) = manager().await;

        let signing = SigningKey::generate(&mut OsRng);
        let public_key = ssh_public_key(&signing.verifying_key(), "node");

        let issued = manager.issue_pairing_code(None).await.unwrap();
        let result = manager
            .enroll(EnrollRequest {
                pairing_code: issued.pairing_code,
                node_public_key: public_key,
                node_name: "site-a".to_string(),
                node_version: None,
                node_fingerprint: "SHA256:bogus".to_string(),
            })
            .await;
        match result {
            Err(skybridge_common::Error::InvalidRequest(msg)) => {
                assert!(msg.contains("fingerprint mismatch"));
            }
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_revoke_removes_exactly_one_key_and_is_idempotent() {
        let (_db, manager, tmp) = manager().await;

        // Approve two nodes
        let mut connections = Vec::new();
        for name in ["site-a", "site-b"] {
            let signing = SigningKey::generate(&mut OsRng);
            let public_key = ssh_public_key(&signing.verifying_key(), name);
            let fingerprint = fingerprint_of(&public_key).unwrap();

            let issued = manager.issue_pairing_code(None).await.unwrap();
            let enrolled = manager
                .enroll(EnrollRequest {
                    pairing_code: issued.pairing_code,
                    node_public_key: public_key,
                    node_name: name.to_string(),
                    node_version: None,
                    node_fingerprint: fingerprint,
                })
                .await
                .unwrap();
            let signature = signing.sign(enrolled.challenge_nonce.as_bytes());
            manager
                .verify(VerifyRequest {
                    enrollment_id: enrolled.enrollment_id.clone(),
                    signature: base64::engine::general_purpose::STANDARD
                        .encode(signature.to_bytes()),
                })
                .await
                .unwrap();
            connections.push(
                manager
                    .approve(
                        &enrolled.enrollment_id,
                        ApproveRequest {
                            approved_by: "admin".to_string(),
                        },
                    )
                    .await
                    .unwrap(),
            );
        }

        let keys_path = tmp.path().join("authorized_keys");
        let before = tokio::fs::read_to_string(&keys_path).await.unwrap();
        assert_eq!(before.lines().count(), 2);

        manager.revoke(&connections[0].id, "admin").await.unwrap();

        let after = tokio::fs::read_to_string(&keys_path).await.unwrap();
        assert_eq!(after.lines().count(), 1);
        assert!(after.contains("skybridge-node-site-b"));

        // Revoking again is a no-op success
        manager.revoke(&connections[0].id, "admin").await.unwrap();
        let connection = db::enrollments::get_connection(manager_pool(&manager), &connections[0].id)
            .await
            .unwrap();
        assert_eq!(connection.status, "revoked");
    }

    fn manager_pool(manager: &EnrollmentManager) -> &SqlitePool {
        &manager.pool
    }

    #[tokio::test]
    async fn test_expired_code_is_refused() {
        let db = crate::db::Database::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let manager = EnrollmentManager::new(
            db.pool().clone(),
            tmp.path().join("authorized_keys"),
            0,
        );

        let signing = SigningKey::generate(&mut OsRng);
        let public_key = ssh_public_key(&signing.verifying_key(), "node");
        let fingerprint = fingerprint_of(&public_key).unwrap();

        let issued = manager.issue_pairing_code(None).await.unwrap();
        // TTL of zero expires immediately
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let result = manager
            .enroll(EnrollRequest {
                pairing_code: issued.pairing_code,
                node_public_key: public_key,
                node_name: "site-a".to_string(),
                node_version: None,
                node_fingerprint: fingerprint,
            })
            .await;
        match result {
            Err(skybridge_common::Error::InvalidRequest(msg)) => {
                assert!(msg.contains("expired"));
            }
            other => panic!("expected InvalidRequest, got {:?}", other.map(|_| ())),
        }
    }
}
