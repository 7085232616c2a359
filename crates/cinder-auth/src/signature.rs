//! Detached signatures for pipeline files.
//!
//! A signature is an HS256 token keyed by the repo hash whose `sha256` claim is
//! the hex digest of the pipeline text it approves.

use cinder_core::repo::Repo;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::token::TokenError;

#[derive(Debug, Serialize, Deserialize)]
struct SignatureClaims {
    sha256: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignatureStatus {
    /// A well-formed signature was present.
    pub signed: bool,
    /// The signature verifies with the repo hash and matches the pipeline text.
    pub verified: bool,
}

fn digest(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

pub fn sign_config(repo: &Repo, data: &str) -> Result<String, TokenError> {
    let claims = SignatureClaims { sha256: digest(data) };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(repo.hash.as_bytes()),
    )?;
    Ok(token)
}

pub fn verify_config(repo: &Repo, data: &str, signature: Option<&str>) -> SignatureStatus {
    let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
        return SignatureStatus::default();
    };
    if let Err(e) = decode_header(signature) {
        debug!(repo = %repo.full_name, error = %e, "cannot parse config signature");
        return SignatureStatus::default();
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = false;

    let expected = digest(data);
    let verified = match decode::<SignatureClaims>(
        signature,
        &DecodingKey::from_secret(repo.hash.as_bytes()),
        &validation,
    ) {
        Ok(token) if token.claims.sha256 == expected => true,
        Ok(_) => {
            debug!(repo = %repo.full_name, "config signature does not match pipeline text");
            false
        }
        Err(e) => {
            debug!(repo = %repo.full_name, error = %e, "cannot verify config signature");
            false
        }
    };
    SignatureStatus {
        signed: true,
        verified,
    }
}
