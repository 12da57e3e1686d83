//! Credential verification
//!
//! The coordinator compares a supplied credential with the account's stored
//! reference through [`CredentialVerifier`]. Which scheme the references use
//! is a deployment decision; two verifiers ship here.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::error::{Error, Result};

/// Compares a supplied credential with a stored reference
pub trait CredentialVerifier: Send + Sync + 'static {
    /// `Ok(false)` for a mismatch; `Err` only when the reference is unusable
    fn verify(&self, supplied: &str, credential_ref: &str) -> Result<bool>;
}

/// Stored references are the credentials themselves
///
/// Comparison hashes both sides with BLAKE3 and compares the digests, which
/// `blake3::Hash` does in constant time.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextVerifier;

impl CredentialVerifier for PlaintextVerifier {
    fn verify(&self, supplied: &str, credential_ref: &str) -> Result<bool> {
        Ok(blake3::hash(supplied.as_bytes()) == blake3::hash(credential_ref.as_bytes()))
    }
}

/// Stored references are Argon2 PHC strings (`$argon2id$v=19$...`)
#[derive(Debug, Clone, Copy, Default)]
pub struct Argon2Verifier;

impl Argon2Verifier {
    /// Produce a PHC reference for provisioning accounts
    pub fn hash(&self, credential: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(credential.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::Credential(format!("Failed to hash credential: {}", e)))
    }
}

impl CredentialVerifier for Argon2Verifier {
    fn verify(&self, supplied: &str, credential_ref: &str) -> Result<bool> {
        let parsed = PasswordHash::new(credential_ref)
            .map_err(|e| Error::Credential(format!("Invalid credential reference: {}", e)))?;

        // Parameters are read from the reference itself
        match Argon2::default().verify_password(supplied.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Credential(format!("Verification failed: {}", e))),
        }
    }
}
