//! Argon2id password hashing.
//!
//! Hashes are stored as PHC strings so the salt and parameters travel with
//! the hash. Both operations are CPU-bound and run on the blocking pool.

use super::{AuthError, AuthResult};
use crate::config::AuthConfig;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

const SALT_LEN: usize = 16;

/// Argon2id hasher configured from `[auth]`.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHashing {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl PasswordHashing {
    /// Build from configuration.
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            memory_kib: config.argon2_memory_kib,
            iterations: config.argon2_iterations,
            parallelism: config.argon2_parallelism,
        }
    }

    fn argon2(self) -> AuthResult<Argon2<'static>> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| AuthError::Hashing(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// Hash a password into a PHC string with a fresh random salt.
    pub async fn hash(self, password: &str) -> AuthResult<String> {
        let password = password.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut salt = [0u8; SALT_LEN];
            getrandom::getrandom(&mut salt).map_err(|e| AuthError::Hashing(e.to_string()))?;
            let salt = SaltString::encode_b64(&salt).map_err(|e| AuthError::Hashing(e.to_string()))?;
            let hash = self
                .argon2()?
                .hash_password(password.as_bytes(), &salt)
                .map_err(|e| AuthError::Hashing(e.to_string()))?;
            Ok(hash.to_string())
        })
        .await
        .map_err(|e| AuthError::Hashing(e.to_string()))?
    }

    /// Check a password against a stored PHC string.
    ///
    /// The parameters embedded in the hash are used, so hashes made under
    /// older settings still verify.
    pub async fn verify(self, password: &str, phc: &str) -> AuthResult<bool> {
        let password = password.to_owned();
        let phc = phc.to_owned();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&phc).map_err(|e| AuthError::Hashing(e.to_string()))?;
            Ok(self
                .argon2()?
                .verify_password(password.as_bytes(), &parsed)
                .is_ok())
        })
        .await
        .map_err(|e| AuthError::Hashing(e.to_string()))?
    }
}
