//! Shared-secret authentication
//!
//! Nodes prove knowledge of a cluster-wide secret by answering a random
//! challenge with HMAC-SHA256(secret, challenge). The secret lives in a
//! small JSON key store protected by a password checked with argon2.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use std::sync::Arc;

use crate::cluster::config::AuthScheme;
use crate::error::{SyncError, SyncResult};

pub const CHALLENGE_LEN: usize = 32;
const KEYSTORE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct KeyStoreFile {
    version: u32,
    password_hash: String,
    secret: String,
}

/// Random secret suitable for [`write_shared_secret`]
pub fn generate_secret() -> Vec<u8> {
    let mut secret = vec![0u8; 32];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Write the shared secret to the key store at `path`
pub fn write_shared_secret(path: &Path, password: &str, secret: &[u8]) -> SyncResult<()> {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| SyncError::Internal(format!("Hashing error: {}", e)))?;

    let file = KeyStoreFile {
        version: KEYSTORE_VERSION,
        password_hash,
        secret: BASE64.encode(secret),
    };
    let contents = serde_json::to_vec_pretty(&file)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Read the shared secret, checking `password` first
pub fn read_shared_secret(path: &Path, password: &str) -> SyncResult<Vec<u8>> {
    let contents = std::fs::read(path).map_err(|e| {
        SyncError::Auth(format!("Failed to read key store {}: {}", path.display(), e))
    })?;
    let file: KeyStoreFile = serde_json::from_slice(&contents)
        .map_err(|e| SyncError::Auth(format!("Corrupt key store {}: {}", path.display(), e)))?;
    if file.version != KEYSTORE_VERSION {
        return Err(SyncError::Auth(format!(
            "Unsupported key store version {}",
            file.version
        )));
    }

    let parsed = PasswordHash::new(&file.password_hash)
        .map_err(|e| SyncError::Auth(format!("Corrupt key store hash: {}", e)))?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| SyncError::Auth("Invalid key store password".to_string()))?;

    BASE64
        .decode(file.secret.as_bytes())
        .map_err(|e| SyncError::Auth(format!("Corrupt key store secret: {}", e)))
}

/// Authentication settings of one side of a connection
#[derive(Clone)]
pub struct AuthContext {
    scheme: AuthScheme,
    secret: Option<Arc<Vec<u8>>>,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext")
            .field("scheme", &self.scheme)
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

impl AuthContext {
    pub fn none() -> Self {
        Self {
            scheme: AuthScheme::NoAuth,
            secret: None,
        }
    }

    pub fn challenge_response(secret: Vec<u8>) -> Self {
        Self {
            scheme: AuthScheme::ChallengeResponse,
            secret: Some(Arc::new(secret)),
        }
    }

    /// Scheme without a usable secret; every challenge fails
    pub fn without_secret(scheme: AuthScheme) -> Self {
        Self {
            scheme,
            secret: None,
        }
    }

    /// Build from configured scheme and key store location
    pub fn from_settings(
        scheme: AuthScheme,
        keystore_path: Option<&Path>,
        keystore_password: Option<&str>,
    ) -> SyncResult<Self> {
        match scheme {
            AuthScheme::NoAuth => Ok(Self::none()),
            AuthScheme::ChallengeResponse => {
                let path = keystore_path.ok_or_else(|| {
                    SyncError::Auth("Challenge-response requires a key store path".to_string())
                })?;
                let secret = read_shared_secret(path, keystore_password.unwrap_or(""))?;
                Ok(Self::challenge_response(secret))
            }
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        self.scheme
    }

    pub fn requires_auth(&self) -> bool {
        self.scheme == AuthScheme::ChallengeResponse
    }

    pub fn new_challenge(&self) -> Vec<u8> {
        let mut challenge = vec![0u8; CHALLENGE_LEN];
        OsRng.fill_bytes(&mut challenge);
        challenge
    }

    fn mac(&self) -> SyncResult<Hmac<Sha256>> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| SyncError::Auth("No shared secret configured".to_string()))?;
        Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|e| SyncError::Auth(format!("Invalid key: {}", e)))
    }

    /// Answer a challenge from the peer
    pub fn respond(&self, challenge: &[u8]) -> SyncResult<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(challenge);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Check the peer's answer to our challenge in constant time
    pub fn verify(&self, challenge: &[u8], response: &[u8]) -> bool {
        match self.mac() {
            Ok(mut mac) => {
                mac.update(challenge);
                mac.verify_slice(response).is_ok()
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_keystore_round_trip_and_wrong_password() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("cluster.json");
        let secret = generate_secret();
        write_shared_secret(&path, "hunter2", &secret).unwrap();

        assert_eq!(read_shared_secret(&path, "hunter2").unwrap(), secret);
        assert!(matches!(
            read_shared_secret(&path, "wrong"),
            Err(SyncError::Auth(_))
        ));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_challenge_response() {
        let alice = AuthContext::challenge_response(b"shared".to_vec());
        let bob = AuthContext::challenge_response(b"shared".to_vec());
        let mallory = AuthContext::challenge_response(b"guess".to_vec());

        let challenge = alice.new_challenge();
        assert_eq!(challenge.len(), CHALLENGE_LEN);
        assert!(alice.verify(&challenge, &bob.respond(&challenge).unwrap()));
        assert!(!alice.verify(&challenge, &mallory.respond(&challenge).unwrap()));
        assert!(!AuthContext::none().verify(&challenge, &[0u8; 32]));
        assert!(AuthContext::none().respond(&challenge).is_err());
    }

    #[test]
    fn test_from_settings_requires_path() {
        assert!(AuthContext::from_settings(AuthScheme::ChallengeResponse, None, None).is_err());
        let ctx = AuthContext::from_settings(AuthScheme::NoAuth, None, None).unwrap();
        assert!(!ctx.requires_auth());
    }
}
