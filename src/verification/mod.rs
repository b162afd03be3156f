//! Single-use, time-limited verification tokens for pending registrations.
//!
//! A token binds a registration payload (the user record that does not exist
//! yet) to an opaque string that is mailed to the user. The store hands the
//! payload back exactly once, and only while the token is still live.
//!
//! Two backends share the same contract:
//!
//! - [`MemoryTokenStore`]: process-local map behind one mutex.
//! - [`PgTokenStore`]: `pending_registrations` table, atomic through
//!   single-statement `DELETE ... RETURNING`.
//!
//! Raw tokens are never kept; entries are keyed by the SHA-256 of the token.

mod memory;
mod postgres;
mod sweeper;

use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryTokenStore;
pub use postgres::PgTokenStore;
pub use sweeper::spawn_sweeper;

/// Default lifetime of a verification token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Longest lifetime a verification token may be given (7 days).
pub const MAX_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Attempts made before giving up on a token that collides with a stored one.
const MAX_TOKEN_ATTEMPTS: usize = 3;

/// Registration fields collected at sign-up, opaque to the store.
pub type Payload = Map<String, Value>;

/// Storage key derived from a raw token.
pub(crate) type TokenKey = [u8; 32];

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("verification token not found")]
    NotFound,
    #[error("verification token expired")]
    Expired,
    #[error("failed to generate verification token")]
    Entropy(#[from] rand::Error),
    #[error("failed to generate a unique verification token")]
    Collision,
    #[error("stored registration payload is not a JSON object")]
    Payload,
    #[error("verification token lifetime is out of range")]
    TtlOutOfRange,
    #[error("verification token storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl TokenError {
    /// Both outcomes mean the link cannot be used; callers show one message.
    #[must_use]
    pub fn is_unusable(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired)
    }
}

/// Payload released by a successful [`VerificationTokenStore::consume`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRegistration {
    pub email: String,
    pub payload: Payload,
}

/// Outcome of asking for a fresh link for an email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReissueOutcome {
    /// The previous token was superseded by this one.
    Reissued(String),
    /// A link was issued too recently.
    Cooldown,
    /// No live registration is pending for the email.
    NoPending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStoreKind {
    Memory,
    Postgres,
}

impl TokenStoreKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres => "postgres",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "postgres" => Some(Self::Postgres),
            _ => None,
        }
    }
}

/// Default interval between sweeps of expired tokens.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Which backend holds pending registrations and how long they live.
#[derive(Clone, Debug)]
pub struct TokenStoreConfig {
    kind: TokenStoreKind,
    ttl: Duration,
    sweep_interval: Duration,
}

impl TokenStoreConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            kind: TokenStoreKind::Memory,
            ttl: DEFAULT_TOKEN_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: TokenStoreKind) -> Self {
        self.kind = kind;
        self
    }

    /// Clamped to `1..=MAX_TOKEN_TTL`.
    #[must_use]
    pub fn with_ttl_seconds(mut self, seconds: u64) -> Self {
        self.ttl = Duration::from_secs(seconds.clamp(1, MAX_TOKEN_TTL.as_secs()));
        self
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn kind(&self) -> TokenStoreKind {
        self.kind
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Verification token store, constructed once at startup and shared by the
/// registration handlers.
#[derive(Debug)]
pub enum VerificationTokenStore {
    Memory(MemoryTokenStore),
    Postgres(PgTokenStore),
}

impl VerificationTokenStore {
    #[must_use]
    pub fn memory(ttl: Duration) -> Self {
        Self::Memory(MemoryTokenStore::new(ttl))
    }

    #[must_use]
    pub fn postgres(pool: sqlx::PgPool, ttl: Duration) -> Self {
        Self::Postgres(PgTokenStore::new(pool, ttl))
    }

    /// Build the configured backend; `pool` is only used by `postgres`.
    #[must_use]
    pub fn from_config(config: &TokenStoreConfig, pool: &sqlx::PgPool) -> Self {
        match config.kind() {
            TokenStoreKind::Memory => Self::memory(config.ttl()),
            TokenStoreKind::Postgres => Self::postgres(pool.clone(), config.ttl()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> TokenStoreKind {
        match self {
            Self::Memory(_) => TokenStoreKind::Memory,
            Self::Postgres(_) => TokenStoreKind::Postgres,
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        match self {
            Self::Memory(store) => store.ttl(),
            Self::Postgres(store) => store.ttl(),
        }
    }

    /// Issue a token for `email`, superseding any live token for it.
    ///
    /// # Errors
    /// Returns an error if no entropy is available or the durable backend fails.
    pub async fn issue(&self, email: &str, payload: Payload) -> Result<String, TokenError> {
        match self {
            Self::Memory(store) => store.issue(email, payload).await,
            Self::Postgres(store) => store.issue(email, payload).await,
        }
    }

    /// Take the payload out of the store; a token can only be consumed once.
    ///
    /// # Errors
    /// `NotFound` or `Expired` when the token cannot be used, `Storage` when the
    /// durable backend fails.
    pub async fn consume(&self, token: &str) -> Result<PendingRegistration, TokenError> {
        match self {
            Self::Memory(store) => store.consume(token).await,
            Self::Postgres(store) => store.consume(token).await,
        }
    }

    /// Replace the live token for `email` with a new one carrying the same payload.
    ///
    /// # Errors
    /// Returns an error if no entropy is available or the durable backend fails.
    pub async fn reissue(
        &self,
        email: &str,
        cooldown: Duration,
    ) -> Result<ReissueOutcome, TokenError> {
        match self {
            Self::Memory(store) => store.reissue(email, cooldown).await,
            Self::Postgres(store) => store.reissue(email, cooldown).await,
        }
    }

    /// Evict every entry whose expiry is in the past, returning how many went.
    ///
    /// # Errors
    /// Returns an error if the durable backend fails.
    pub async fn sweep_expired(&self) -> Result<usize, TokenError> {
        match self {
            Self::Memory(store) => Ok(store.sweep_expired().await),
            Self::Postgres(store) => store.sweep_expired().await,
        }
    }

    /// Entries physically held, expired or not.
    ///
    /// # Errors
    /// Returns an error if the durable backend fails.
    pub async fn len(&self) -> Result<usize, TokenError> {
        match self {
            Self::Memory(store) => Ok(store.len().await),
            Self::Postgres(store) => store.len().await,
        }
    }

    /// # Errors
    /// Returns an error if the durable backend fails.
    pub async fn is_empty(&self) -> Result<bool, TokenError> {
        Ok(self.len().await? == 0)
    }
}

/// Create a raw token for the verification link (256 bits, URL-safe).
pub(crate) fn generate_token() -> Result<String, TokenError> {
    let mut bytes = [0u8; 32];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a raw token into its storage key.
pub(crate) fn hash_token(token: &str) -> TokenKey {
    Sha256::digest(token.as_bytes()).into()
}

/// `true` when Postgres rejected a row on a unique constraint (SQLSTATE 23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

/// Normalize a token taken from a URL; blank tokens can never match.
pub(crate) fn token_key(token: &str) -> Option<TokenKey> {
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(hash_token(token))
    }
}
