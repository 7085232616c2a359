//! Repository-scoped tokens.

use chrono::Utc;
use cinder_core::repo::Repo;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token subject does not match {0}")]
    SubjectMismatch(String),
    #[error("token kind {actual:?} cannot be used as {expected:?}")]
    WrongKind { expected: TokenKind, actual: TokenKind },
}

impl From<TokenError> for cinder_core::Error {
    fn from(err: TokenError) -> Self {
        cinder_core::Error::Unauthorized(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Authorizes build triggers for one repository.
    Hook,
    /// Authorizes reading one repository's events, private ones included.
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Repository full name.
    pub sub: String,
    pub kind: TokenKind,
    pub iat: i64,
}

fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    // Repo tokens do not expire; rotating the repo hash revokes them.
    validation.required_spec_claims.clear();
    validation.validate_exp = false;
    validation
}

/// Issue a token of `kind` for `repo`, signed with the repo hash.
pub fn sign_token(repo: &Repo, kind: TokenKind) -> Result<String, TokenError> {
    let claims = TokenClaims {
        sub: repo.full_name.clone(),
        kind,
        iat: Utc::now().timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(repo.hash.as_bytes()),
    )?;
    Ok(token)
}

/// Verify a token against `repo`: signature, subject and kind must all match.
pub fn verify_token(token: &str, repo: &Repo, kind: TokenKind) -> Result<TokenClaims, TokenError> {
    let data = decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(repo.hash.as_bytes()),
        &validation(),
    )?;
    let claims = data.claims;
    if claims.sub != repo.full_name {
        return Err(TokenError::SubjectMismatch(repo.full_name.clone()));
    }
    if claims.kind != kind {
        return Err(TokenError::WrongKind {
            expected: kind,
            actual: claims.kind,
        });
    }
    Ok(claims)
}

/// Read the subject without checking the signature, to find the repo whose
/// hash verifies the token. Never trust the result on its own.
pub fn peek_subject(token: &str) -> Result<String, TokenError> {
    let mut validation = validation();
    validation.insecure_disable_signature_validation();
    let data = decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)?;
    Ok(data.claims.sub)
}
