//! Auth configuration and shared state.

use secrecy::SecretString;

const DEFAULT_SESSION_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_ADMIN_CHALLENGE_TTL_SECONDS: i64 = 15 * 60;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    public_base_url: String,
    admin_secret: SecretString,
    session_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
    admin_challenge_ttl_seconds: i64,
}

impl AuthConfig {
    #[must_use]
    pub fn new(public_base_url: String, admin_secret: SecretString) -> Self {
        Self {
            public_base_url,
            admin_secret,
            session_ttl_seconds: DEFAULT_SESSION_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            admin_challenge_ttl_seconds: DEFAULT_ADMIN_CHALLENGE_TTL_SECONDS,
        }
    }

    #[must_use]
    pub fn with_session_ttl_seconds(mut self, seconds: i64) -> Self {
        self.session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_admin_challenge_ttl_seconds(mut self, seconds: i64) -> Self {
        self.admin_challenge_ttl_seconds = seconds;
        self
    }

    pub(crate) fn public_base_url(&self) -> &str {
        &self.public_base_url
    }

    pub(crate) fn admin_secret(&self) -> &SecretString {
        &self.admin_secret
    }

    pub(crate) fn session_ttl_seconds(&self) -> i64 {
        self.session_ttl_seconds
    }

    pub(super) fn reset_token_ttl_seconds(&self) -> i64 {
        self.reset_token_ttl_seconds
    }

    pub(super) fn admin_challenge_ttl_seconds(&self) -> i64 {
        self.admin_challenge_ttl_seconds
    }

    pub(crate) fn session_cookie_secure(&self) -> bool {
        self.public_base_url.starts_with("https://")
    }
}

pub struct AuthState {
    config: AuthConfig,
}

impl AuthState {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new(
            "https://symposia.dev".to_string(),
            SecretString::from("sesame".to_string()),
        )
    }

    #[test]
    fn auth_config_defaults_and_overrides() {
        let config = config();

        assert_eq!(config.public_base_url(), "https://symposia.dev");
        assert_eq!(
            config.session_ttl_seconds(),
            super::DEFAULT_SESSION_TTL_SECONDS
        );
        assert_eq!(
            config.reset_token_ttl_seconds(),
            super::DEFAULT_RESET_TOKEN_TTL_SECONDS
        );
        assert_eq!(
            config.admin_challenge_ttl_seconds(),
            super::DEFAULT_ADMIN_CHALLENGE_TTL_SECONDS
        );

        let config = config
            .with_session_ttl_seconds(120)
            .with_reset_token_ttl_seconds(30)
            .with_admin_challenge_ttl_seconds(60);

        assert_eq!(config.session_ttl_seconds(), 120);
        assert_eq!(config.reset_token_ttl_seconds(), 30);
        assert_eq!(config.admin_challenge_ttl_seconds(), 60);
    }

    #[test]
    fn session_cookie_secure_follows_scheme() {
        assert!(config().session_cookie_secure());
        let insecure = AuthConfig::new(
            "http://localhost:8080".to_string(),
            SecretString::from("sesame".to_string()),
        );
        assert!(!insecure.session_cookie_secure());
    }

    #[test]
    fn auth_state_exposes_config() {
        let state = AuthState::new(config());
        assert_eq!(state.config().public_base_url(), "https://symposia.dev");
    }
}
