//! # ZeroWork backend
//!
//! `zerowork` serves the user, contact and chat endpoints behind the ZeroWork
//! frontend.
//!
//! ## Registration & Email Verification
//!
//! Sign-up does not write a user row. The registration payload (with the
//! password already hashed) is parked in a [`verification::VerificationTokenStore`]
//! under a single-use token, and a verification link carrying that token is
//! queued in the email outbox. Visiting the link consumes the token and only
//! then creates the durable user.
//!
//! - **Single use:** consuming a token removes it; a second visit fails.
//! - **Expiry:** tokens live for 30 minutes by default and expired entries are
//!   treated as absent, then purged lazily or by the periodic sweeper.
//! - **One live link per email:** issuing again for the same address
//!   supersedes the earlier token.
//!
//! ## Email
//!
//! Contact notifications and verification links go through a DB-backed outbox
//! (`email_outbox`) so a flaky SMTP relay never fails or rolls back the request
//! that produced the email.
//!
//! ## Authentication
//!
//! Every `/api/*` route requires `Authorization: Bearer <API_AUTH_TOKEN>`.

pub mod agent;
pub mod api;
pub mod cli;
pub mod verification;

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
