//! # Symposia (Conference Registration Portal)
//!
//! `symposia` is the backend of a conference-registration portal. Visitors
//! sign up, confirm ownership of their address through a mailed single-use
//! link, log in with a second out-of-band confirmation, manage their
//! registration profile, and submit research abstracts.
//!
//! ## Verification model
//!
//! Every account carries at most one pending out-of-band challenge at a time,
//! typed by kind (`signup` or `login`). Issuing a login challenge supersedes
//! an unconsumed signup challenge; each consumer only accepts its own kind.
//! A verified account never carries a signup challenge.
//!
//! Raw tokens are mailed only. The database stores a SHA-256 digest, so every
//! lookup compares digests and a stolen database dump yields no usable links.
//!
//! ## Administrator access
//!
//! There is no administrator account. Presenting the configured shared secret
//! at login starts a mailed challenge held on the browsing session; following
//! the link elevates that session only. The grant expires with the session
//! and is never written to an account record.

pub mod api;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_commit_hash_format() {
        if GIT_COMMIT_HASH == "unknown" {
            // Acceptable in non-git build environments
            return;
        }
        assert!(
            GIT_COMMIT_HASH.chars().all(|c| c.is_ascii_hexdigit()),
            "GIT_COMMIT_HASH should be a hex string, got: {GIT_COMMIT_HASH}"
        );
        assert!(
            GIT_COMMIT_HASH.len() >= 7,
            "GIT_COMMIT_HASH should be at least 7 characters long, got: {GIT_COMMIT_HASH}"
        );
    }

    #[test]
    fn test_app_user_agent_format() {
        assert!(APP_USER_AGENT.starts_with(env!("CARGO_PKG_NAME")));
        assert!(APP_USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }
}
