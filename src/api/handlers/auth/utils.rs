//! Small helpers for validation, token handling, and password hashing.

use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng as SaltRng, PasswordHash, PasswordHasher, SaltString},
    Argon2, PasswordVerifier,
};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Create a new single-use challenge or reset token.
///
/// The raw token is only mailed to the user; the database stores a digest.
pub(crate) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Digest a token for storage and lookup.
///
/// Lookups compare digests, so matching never walks the raw token bytes and
/// a database dump contains nothing a link could be forged from.
pub(crate) fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// Compare a submitted password against the administrator shared secret.
///
/// Both sides are digested first so the comparison does not depend on how
/// many leading bytes happen to match the secret.
pub(crate) fn admin_secret_matches(candidate: &str, secret: &SecretString) -> bool {
    hash_token(candidate) == hash_token(secret.expose_secret())
}

/// Hash a password with Argon2id and a fresh random salt.
pub(crate) fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .context("failed to hash password")
}

/// Verify a password against a stored Argon2id hash; never errors on mismatch.
pub(crate) fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}

/// Build the verification link included in signup mail.
pub(crate) fn build_verify_url(public_base_url: &str, token: &str) -> String {
    let base = public_base_url.trim_end_matches('/');
    format!("{base}/verify#token={token}")
}

/// Build the login confirmation link included in login and admin mail.
pub(crate) fn build_login_confirm_url(public_base_url: &str, token: &str) -> String {
    let base = public_base_url.trim_end_matches('/');
    format!("{base}/confirm-login#token={token}")
}

/// Build the reset link from the origin that served the request.
pub(crate) fn build_reset_url(origin: &str, token: &str) -> String {
    let base = origin.trim_end_matches('/');
    format!("{base}/reset-password/{token}")
}

/// Reconstruct the request origin from proxy headers.
///
/// Reset links follow the host that served the request, so they match
/// whatever origin the user was on; the configured public base URL is only a
/// fallback.
pub(crate) fn request_origin(headers: &axum::http::HeaderMap) -> Option<String> {
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(axum::http::header::HOST))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("https");
    Some(format!("{scheme}://{host}"))
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn valid_email_accepts_basic_format() {
        assert!(valid_email("a@example.com"));
        assert!(valid_email("name.surname@example.co"));
    }

    #[test]
    fn valid_email_rejects_missing_parts() {
        assert!(!valid_email("not-an-email"));
        assert!(!valid_email("missing-at.example.com"));
        assert!(!valid_email("missing-domain@"));
    }

    #[test]
    fn generate_token_is_fixed_length() {
        let decoded_len = generate_token()
            .ok()
            .and_then(|token| URL_SAFE_NO_PAD.decode(token.as_bytes()).ok())
            .map(|bytes| bytes.len());
        assert_eq!(decoded_len, Some(32));
    }

    #[test]
    fn hash_token_stable() {
        let first = hash_token("token");
        let second = hash_token("token");
        let different = hash_token("other");
        assert_eq!(first, second);
        assert_ne!(first, different);
    }

    #[test]
    fn admin_secret_match_is_exact() {
        let secret = SecretString::from("sesame".to_string());
        assert!(admin_secret_matches("sesame", &secret));
        assert!(!admin_secret_matches("sesam", &secret));
        assert!(!admin_secret_matches("sesame ", &secret));
    }

    #[test]
    fn password_hash_round_trip() -> Result<()> {
        let hash = hash_password("CorrectHorseBatteryStaple")?;
        assert_ne!(hash, "CorrectHorseBatteryStaple");
        assert!(verify_password("CorrectHorseBatteryStaple", &hash));
        assert!(!verify_password("wrong", &hash));
        Ok(())
    }

    #[test]
    fn verify_password_rejects_garbage_hash() {
        assert!(!verify_password("password", "not-a-phc-string"));
    }

    #[test]
    fn build_urls_trim_trailing_slash() {
        assert_eq!(
            build_verify_url("https://symposia.dev/", "tok"),
            "https://symposia.dev/verify#token=tok"
        );
        assert_eq!(
            build_login_confirm_url("https://symposia.dev", "tok"),
            "https://symposia.dev/confirm-login#token=tok"
        );
        assert_eq!(
            build_reset_url("https://conf.example.com/", "tok"),
            "https://conf.example.com/reset-password/tok"
        );
    }

    #[test]
    fn request_origin_prefers_forwarded_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("internal:8080"));
        headers.insert(
            "x-forwarded-host",
            HeaderValue::from_static("conf.example.com"),
        );
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(
            request_origin(&headers),
            Some("https://conf.example.com".to_string())
        );
    }

    #[test]
    fn request_origin_falls_back_to_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("localhost:8080"));
        assert_eq!(
            request_origin(&headers),
            Some("https://localhost:8080".to_string())
        );
    }

    #[test]
    fn request_origin_none_without_host() {
        let headers = HeaderMap::new();
        assert_eq!(request_origin(&headers), None);
    }
}
