use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::credential::{hash_secret, Credential};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("no credential presented")]
    MissingCredential,
    #[error("credential does not match any issued key")]
    InvalidCredential,
    #[error("credential has been revoked")]
    Revoked,
    #[error("credential has expired")]
    Expired,
}

/// Checks a presented secret against one snapshot of stored credentials.
///
/// Pure: nothing is read or written beyond the slice it was built with.
#[derive(Debug, Clone, Copy)]
pub struct CredentialValidator<'a> {
    credentials: &'a [Credential],
    now: DateTime<Utc>,
}

impl<'a> CredentialValidator<'a> {
    pub fn new(credentials: &'a [Credential]) -> Self {
        Self {
            credentials,
            now: Utc::now(),
        }
    }

    /// Evaluate expiry against a fixed instant instead of the wall clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn validate(&self, raw_secret: Option<&str>) -> Result<&'a Credential, AuthFailure> {
        let raw = match raw_secret {
            Some(s) if !s.is_empty() => s,
            _ => return Err(AuthFailure::MissingCredential),
        };

        let incoming = hash_secret(raw);
        let mut matched: Option<&'a Credential> = None;
        // Every stored digest is compared; no early exit on a hit.
        for credential in self.credentials {
            let equal: bool = credential
                .secret_hash
                .as_bytes()
                .ct_eq(incoming.as_bytes())
                .into();
            if equal && matched.is_none() {
                matched = Some(credential);
            }
        }

        let credential = matched.ok_or(AuthFailure::InvalidCredential)?;
        if !credential.active {
            return Err(AuthFailure::Revoked);
        }
        if credential.is_expired_at(self.now) {
            return Err(AuthFailure::Expired);
        }
        Ok(credential)
    }
}
